//! Classifies raw stream frames and routes them to the pipeline.
//!
//! Stream bodies are loosely typed JSON. They are parsed here, once, into
//! [`StreamEvent`]; anything that does not fit is dropped with a warning.

use std::sync::Arc;

use async_trait::async_trait;
use riina_misskey::{MentionEvent, MentionSource, NotePayload, RemoteUser, UserPayload};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::decision_log::{DecisionLog, DecisionRecord};
use crate::follow_reconciler::{FollowReconciler, SyncReport};
use crate::mention_admission::{AdmissionOutcome, MentionAdmission};
use crate::stream_connector::{FrameDisposition, FrameHandler};

pub const MAIN_CHANNEL_ID: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Connected,
    Mention(MentionEvent),
    Reply(MentionEvent),
    Followed(RemoteUser),
    /// Well-formed frame the bot does not act on.
    Ignored { kind: String },
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("malformed '{kind}' frame: {message}")]
    MalformedBody { kind: String, message: String },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    body: Value,
}

#[derive(Debug, Deserialize)]
struct ChannelFrameBody {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    body: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FollowedBody {
    Wrapped { user: UserPayload },
    Bare(UserPayload),
}

pub fn parse_stream_frame(raw: &str) -> Result<StreamEvent, FrameError> {
    let frame: RawFrame = serde_json::from_str(raw)?;
    match frame.kind.as_str() {
        "connected" => Ok(StreamEvent::Connected),
        "channel" => parse_channel_body(frame.body),
        other => Ok(StreamEvent::Ignored {
            kind: other.to_string(),
        }),
    }
}

fn parse_channel_body(body: Value) -> Result<StreamEvent, FrameError> {
    if !body.is_object() {
        return Err(malformed("channel", "body is not an object"));
    }
    let channel: ChannelFrameBody =
        serde_json::from_value(body).map_err(|error| malformed("channel", error))?;
    if channel.id != MAIN_CHANNEL_ID {
        return Ok(StreamEvent::Ignored {
            kind: format!("channel:{}", channel.id),
        });
    }
    match channel.kind.as_str() {
        "mention" => parse_note(&channel.kind, channel.body).map(StreamEvent::Mention),
        "reply" => parse_note(&channel.kind, channel.body).map(StreamEvent::Reply),
        "followed" => {
            let followed: FollowedBody = serde_json::from_value(channel.body)
                .map_err(|error| malformed("followed", error))?;
            let user = match followed {
                FollowedBody::Wrapped { user } | FollowedBody::Bare(user) => user,
            };
            Ok(StreamEvent::Followed(user.into()))
        }
        other => Ok(StreamEvent::Ignored {
            kind: other.to_string(),
        }),
    }
}

fn parse_note(kind: &str, body: Value) -> Result<MentionEvent, FrameError> {
    let note: NotePayload = serde_json::from_value(body).map_err(|error| malformed(kind, error))?;
    Ok(MentionEvent::from_note(note, MentionSource::Stream))
}

fn malformed(kind: &str, message: impl std::fmt::Display) -> FrameError {
    FrameError::MalformedBody {
        kind: kind.to_string(),
        message: message.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Connected,
    Admission(AdmissionOutcome),
    FollowSynced(SyncReport),
    FollowSyncFailed,
    Ignored,
    Malformed,
}

pub struct EventDispatcher {
    admission: Arc<MentionAdmission>,
    reconciler: Arc<FollowReconciler>,
    decision_log: Option<Arc<DecisionLog>>,
}

impl EventDispatcher {
    pub fn new(admission: Arc<MentionAdmission>, reconciler: Arc<FollowReconciler>) -> Self {
        Self {
            admission,
            reconciler,
            decision_log: None,
        }
    }

    pub fn with_decision_log(mut self, decision_log: Arc<DecisionLog>) -> Self {
        self.decision_log = Some(decision_log);
        self
    }

    pub async fn handle_stream_frame(&self, raw: &str) -> DispatchOutcome {
        let event = match parse_stream_frame(raw) {
            Ok(event) => event,
            Err(error) => {
                warn!(error = %error, "dropping malformed stream frame");
                self.log_decision(
                    DecisionRecord::new("dispatch", "malformed").with_detail(error.to_string()),
                );
                return DispatchOutcome::Malformed;
            }
        };
        match event {
            StreamEvent::Connected => {
                info!("stream channel connected");
                DispatchOutcome::Connected
            }
            StreamEvent::Mention(mention) | StreamEvent::Reply(mention) => {
                DispatchOutcome::Admission(self.admission.admit_mention(&mention).await)
            }
            StreamEvent::Followed(user) => {
                info!(user_id = %user.id, username = %user.username, "new follower event");
                let record = DecisionRecord::new("dispatch", "followed")
                    .with_detail(format!("user_id={}", user.id));
                match self.reconciler.run_full_sync().await {
                    Ok(report) => {
                        self.log_decision(record.with_reason("synced"));
                        DispatchOutcome::FollowSynced(report)
                    }
                    Err(error) => {
                        warn!(
                            user_id = %user.id,
                            error = %error,
                            "follower sync after follow event failed"
                        );
                        self.log_decision(record.with_reason("sync-failed"));
                        DispatchOutcome::FollowSyncFailed
                    }
                }
            }
            StreamEvent::Ignored { kind } => {
                debug!(kind = %kind, "ignoring stream frame");
                DispatchOutcome::Ignored
            }
        }
    }

    fn log_decision(&self, record: DecisionRecord) {
        if let Some(log) = &self.decision_log {
            if let Err(error) = log.append(&record) {
                warn!(error = %error, "failed to append decision log");
            }
        }
    }
}

#[async_trait]
impl FrameHandler for EventDispatcher {
    async fn handle_frame(&self, raw: &str) -> FrameDisposition {
        match self.handle_stream_frame(raw).await {
            DispatchOutcome::Malformed => FrameDisposition::Malformed,
            _ => FrameDisposition::Handled,
        }
    }
}

#[cfg(test)]
mod tests {
    use riina_store::{BotStore, InMemoryBotStore};
    use serde_json::json;

    use super::*;
    use crate::follow_reconciler::ReconcilerPolicy;
    use crate::mention_admission::{AdmissionPolicy, DropReason};
    use crate::rate_limiter::{RateLimitPolicy, ReplyRateLimiter};
    use crate::test_support::{ScriptedGenerator, ScriptedPlatform};

    fn note_frame(kind: &str, note_id: &str, user_id: &str, text: &str) -> String {
        json!({
            "type": "channel",
            "body": {
                "id": "main",
                "type": kind,
                "body": {
                    "id": note_id,
                    "text": text,
                    "user": { "id": user_id, "username": format!("name-{user_id}"), "name": null }
                }
            }
        })
        .to_string()
    }

    async fn dispatcher(
        platform: Arc<ScriptedPlatform>,
        store: Arc<InMemoryBotStore>,
    ) -> EventDispatcher {
        let reconciler = Arc::new(FollowReconciler::new(
            platform.clone(),
            store.clone(),
            ReconcilerPolicy::default(),
        ));
        reconciler.run_full_sync().await.expect("seed");
        let limiter = Arc::new(ReplyRateLimiter::new(store.clone(), RateLimitPolicy::default()));
        let admission = Arc::new(MentionAdmission::new(
            AdmissionPolicy::default(),
            reconciler.clone(),
            limiter,
            Arc::new(ScriptedGenerator::always("hi back")),
            platform,
            store,
        ));
        EventDispatcher::new(admission, reconciler)
    }

    #[test]
    fn unit_parse_mention_frame() {
        let event = parse_stream_frame(&note_frame("mention", "n1", "u1", "@riina hi")).expect("parse");
        match event {
            StreamEvent::Mention(mention) => {
                assert_eq!(mention.mention_id, "n1");
                assert_eq!(mention.author_id, "u1");
                assert_eq!(mention.text, "@riina hi");
                assert_eq!(mention.received_via, MentionSource::Stream);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unit_parse_followed_accepts_bare_and_wrapped_user() {
        let bare = json!({
            "type": "channel",
            "body": { "id": "main", "type": "followed", "body": { "id": "u9", "username": "nine" } }
        });
        let wrapped = json!({
            "type": "channel",
            "body": { "id": "main", "type": "followed", "body": { "user": { "id": "u9", "username": "nine" } } }
        });
        for frame in [bare, wrapped] {
            let event = parse_stream_frame(&frame.to_string()).expect("parse");
            assert!(matches!(event, StreamEvent::Followed(user) if user.id == "u9"));
        }
    }

    #[test]
    fn unit_other_channels_and_kinds_are_ignored() {
        let other_channel = json!({
            "type": "channel",
            "body": { "id": "home", "type": "note", "body": {} }
        });
        let other_kind = json!({
            "type": "channel",
            "body": { "id": "main", "type": "unreadNotification", "body": {} }
        });
        let other_frame = json!({ "type": "noteUpdated", "body": {} });

        assert!(matches!(
            parse_stream_frame(&other_channel.to_string()),
            Ok(StreamEvent::Ignored { kind }) if kind == "channel:home"
        ));
        assert!(matches!(
            parse_stream_frame(&other_kind.to_string()),
            Ok(StreamEvent::Ignored { kind }) if kind == "unreadNotification"
        ));
        assert!(matches!(
            parse_stream_frame(&other_frame.to_string()),
            Ok(StreamEvent::Ignored { .. })
        ));
        assert_eq!(
            parse_stream_frame(r#"{"type":"connected","body":{"id":"main"}}"#).expect("parse"),
            StreamEvent::Connected
        );
    }

    #[test]
    fn regression_malformed_frames_fail_closed() {
        assert!(matches!(parse_stream_frame("not json"), Err(FrameError::InvalidJson(_))));
        assert!(matches!(
            parse_stream_frame(r#"{"type":"channel","body":"oops"}"#),
            Err(FrameError::MalformedBody { .. })
        ));
        let note_without_user = json!({
            "type": "channel",
            "body": { "id": "main", "type": "mention", "body": { "id": "n1", "text": "hi" } }
        });
        assert!(matches!(
            parse_stream_frame(&note_without_user.to_string()),
            Err(FrameError::MalformedBody { kind, .. }) if kind == "mention"
        ));
    }

    #[tokio::test]
    async fn functional_mention_and_reply_frames_reach_admission() {
        let platform = Arc::new(ScriptedPlatform::with_graph(&["u1"], &["u1"]));
        let store = Arc::new(InMemoryBotStore::new());
        let dispatcher = dispatcher(platform.clone(), store).await;

        let mention = dispatcher
            .handle_stream_frame(&note_frame("mention", "n1", "u1", "hi"))
            .await;
        let reply = dispatcher
            .handle_stream_frame(&note_frame("reply", "n2", "u1", "again"))
            .await;
        let replay = dispatcher
            .handle_stream_frame(&note_frame("reply", "n2", "u1", "again"))
            .await;

        assert!(matches!(mention, DispatchOutcome::Admission(AdmissionOutcome::Replied { .. })));
        assert!(matches!(reply, DispatchOutcome::Admission(AdmissionOutcome::Replied { .. })));
        assert_eq!(
            replay,
            DispatchOutcome::Admission(AdmissionOutcome::Dropped(DropReason::Duplicate))
        );
        assert_eq!(platform.sent().len(), 2);
    }

    #[tokio::test]
    async fn functional_followed_frame_triggers_full_sync() {
        let platform = Arc::new(ScriptedPlatform::with_graph(&[], &[]));
        let store = Arc::new(InMemoryBotStore::new());
        let dispatcher = dispatcher(platform.clone(), store.clone()).await;

        platform
            .followers
            .lock()
            .expect("followers")
            .push(crate::test_support::user("u5"));
        let frame = json!({
            "type": "channel",
            "body": { "id": "main", "type": "followed", "body": { "id": "u5", "username": "five" } }
        });
        let outcome = dispatcher.handle_stream_frame(&frame.to_string()).await;

        assert!(matches!(outcome, DispatchOutcome::FollowSynced(report) if report.added == 1));
        assert!(store.get_follower("u5").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn regression_malformed_frame_does_not_stop_later_frames() {
        let platform = Arc::new(ScriptedPlatform::with_graph(&["u1"], &["u1"]));
        let store = Arc::new(InMemoryBotStore::new());
        let dispatcher = dispatcher(platform.clone(), store).await;

        assert_eq!(dispatcher.handle_stream_frame("{{{").await, DispatchOutcome::Malformed);
        let next = dispatcher
            .handle_stream_frame(&note_frame("mention", "n1", "u1", "hi"))
            .await;

        assert!(matches!(next, DispatchOutcome::Admission(AdmissionOutcome::Replied { .. })));
    }
}
