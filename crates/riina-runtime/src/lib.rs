//! Event-reconciliation core of the Riina bot.
//!
//! Raw stream frames flow from the [`StreamConnector`] through the
//! [`EventDispatcher`] into either the [`FollowReconciler`] (follow events) or
//! the [`MentionAdmission`] pipeline (mentions and replies), which consults the
//! [`ReplyRateLimiter`]. Scheduled posting and maintenance jobs share the same
//! store and reconciler; [`BotRuntime`] wires everything together.

pub mod bot_runtime;
pub mod decision_log;
pub mod event_dispatcher;
pub mod follow_reconciler;
pub mod jobs;
pub mod maintenance;
pub mod mention_admission;
pub mod ng_words;
pub mod posting;
pub mod rate_limiter;
pub mod scheduler;
pub mod stream_connector;

#[cfg(test)]
mod test_support;

pub use bot_runtime::{
    BotRuntime, JobSettings, MentionPollSettings, RuntimeDependencies, RuntimeSettings,
};
pub use decision_log::{DecisionLog, DecisionRecord, DECISION_LOG_FILE_NAME};
pub use event_dispatcher::{
    parse_stream_frame, DispatchOutcome, EventDispatcher, FrameError, StreamEvent,
};
pub use follow_reconciler::{FollowReconciler, ReconcileError, ReconcilerPolicy, SyncReport};
pub use maintenance::{CleanupReport, MaintenancePolicy, MaintenanceRunner};
pub use mention_admission::{
    default_follow_back_keywords, AdmissionOutcome, AdmissionPolicy, DropReason,
    MentionAdmission, RecentMentionCache, DEFAULT_DEDUP_CAPACITY,
};
pub use ng_words::{build_ng_word_filter, NgWordFilter};
pub use posting::{
    KeywordExtractor, NightMode, PostComposer, PostOutcome, PostingPolicy, SkipReason,
    DEFAULT_TIMEZONE,
};
pub use rate_limiter::{RateLimitPolicy, ReplyRateLimiter, DEFAULT_MAX_REPLIES_PER_WINDOW};
pub use scheduler::{parse_hh_mm, JobScheduler, JobTrigger, ScheduledJob};
pub use stream_connector::{
    ConnectorState, FrameDisposition, FrameHandler, ReconnectPolicy, StopReason,
    StreamConnector, StreamHealthSnapshot, StreamSession, StreamTransport, TransportError,
    WebSocketTransport, SUBSCRIBE_MAIN_CHANNEL,
};
