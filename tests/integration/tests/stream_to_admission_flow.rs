use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use riina_ai::TextGenerator;
use riina_core::LogRotationPolicy;
use riina_misskey::{
    MentionEvent, PlatformClient, PlatformError, RemoteUser, TimelineNote, TimelineSource,
};
use riina_runtime::{
    AdmissionOutcome, AdmissionPolicy, BotRuntime, DispatchOutcome, DropReason, EventDispatcher,
    FollowReconciler, JobSettings, MentionAdmission, NgWordFilter, RateLimitPolicy,
    ReconcilerPolicy, ReplyRateLimiter, RuntimeDependencies, RuntimeSettings, StreamSession,
    StreamTransport, TransportError, DECISION_LOG_FILE_NAME,
};
use riina_store::{BotStore, InMemoryBotStore};
use serde_json::{json, Value};
use tokio::sync::Notify;

fn remote_user(id: &str) -> RemoteUser {
    RemoteUser {
        id: id.to_string(),
        username: id.to_string(),
        display_name: None,
    }
}

#[derive(Default)]
struct FakeMisskey {
    followers: Mutex<Vec<RemoteUser>>,
    following: Mutex<Vec<RemoteUser>>,
    replies: Mutex<Vec<(String, Option<String>)>>,
    follow_calls: Mutex<Vec<String>>,
    unfollow_calls: Mutex<Vec<String>>,
}

impl FakeMisskey {
    fn with_graph(followers: &[&str], following: &[&str]) -> Self {
        let fake = Self::default();
        *fake.followers.lock().expect("followers") =
            followers.iter().map(|id| remote_user(id)).collect();
        *fake.following.lock().expect("following") =
            following.iter().map(|id| remote_user(id)).collect();
        fake
    }

    fn replies(&self) -> Vec<(String, Option<String>)> {
        self.replies.lock().expect("replies").clone()
    }
}

#[async_trait]
impl PlatformClient for FakeMisskey {
    async fn verify_credentials(&self) -> Result<RemoteUser, PlatformError> {
        Ok(remote_user("riina"))
    }

    async fn fetch_followers(&self) -> Result<Vec<RemoteUser>, PlatformError> {
        Ok(self.followers.lock().expect("followers").clone())
    }

    async fn fetch_following(&self) -> Result<Vec<RemoteUser>, PlatformError> {
        Ok(self.following.lock().expect("following").clone())
    }

    async fn follow(&self, user_id: &str) -> Result<(), PlatformError> {
        self.follow_calls
            .lock()
            .expect("follow calls")
            .push(user_id.to_string());
        self.following
            .lock()
            .expect("following")
            .push(remote_user(user_id));
        Ok(())
    }

    async fn unfollow(&self, user_id: &str) -> Result<(), PlatformError> {
        self.unfollow_calls
            .lock()
            .expect("unfollow calls")
            .push(user_id.to_string());
        self.following
            .lock()
            .expect("following")
            .retain(|user| user.id != user_id);
        Ok(())
    }

    async fn send_post(&self, text: &str, reply_to: Option<&str>) -> Result<String, PlatformError> {
        let mut replies = self.replies.lock().expect("replies");
        replies.push((text.to_string(), reply_to.map(str::to_string)));
        Ok(format!("note-{}", replies.len()))
    }

    async fn fetch_recent_mentions(&self, _limit: usize) -> Result<Vec<MentionEvent>, PlatformError> {
        Ok(Vec::new())
    }

    async fn fetch_timeline(
        &self,
        _source: TimelineSource,
        _limit: usize,
    ) -> Result<Vec<TimelineNote>, PlatformError> {
        Ok(Vec::new())
    }
}

struct EchoGenerator;

#[async_trait]
impl TextGenerator for EchoGenerator {
    async fn generate_reply(&self, message: &str, author_name: &str) -> Option<String> {
        Some(format!("{author_name}: {message}"))
    }

    async fn generate_post(&self, _topic: Option<&str>) -> Option<String> {
        None
    }
}

/// Hands out one session that replays `frames`, then signals `drained` and idles.
struct ReplayTransport {
    frames: Arc<Mutex<VecDeque<String>>>,
    drained: Arc<Notify>,
    handshakes: Arc<Mutex<Vec<String>>>,
    connects: AtomicUsize,
    refuse_all: bool,
}

impl ReplayTransport {
    fn replaying(frames: Vec<Value>) -> Self {
        Self {
            frames: Arc::new(Mutex::new(
                frames.into_iter().map(|frame| frame.to_string()).collect(),
            )),
            drained: Arc::new(Notify::new()),
            handshakes: Arc::new(Mutex::new(Vec::new())),
            connects: AtomicUsize::new(0),
            refuse_all: false,
        }
    }

    fn refusing() -> Self {
        Self {
            refuse_all: true,
            ..Self::replaying(Vec::new())
        }
    }
}

#[async_trait]
impl StreamTransport for ReplayTransport {
    async fn connect(&self) -> Result<Box<dyn StreamSession>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse_all {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        Ok(Box::new(ReplaySession {
            frames: self.frames.clone(),
            drained: self.drained.clone(),
            handshakes: self.handshakes.clone(),
        }))
    }
}

struct ReplaySession {
    frames: Arc<Mutex<VecDeque<String>>>,
    drained: Arc<Notify>,
    handshakes: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl StreamSession for ReplaySession {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.handshakes
            .lock()
            .expect("handshakes")
            .push(text.to_string());
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<String, TransportError> {
        let next = self.frames.lock().expect("frames").pop_front();
        match next {
            Some(frame) => Ok(frame),
            None => {
                self.drained.notify_one();
                std::future::pending().await
            }
        }
    }

    async fn close(&mut self) {}
}

fn note_frame(kind: &str, note_id: &str, author: &str, text: &str) -> Value {
    json!({
        "type": "channel",
        "body": {
            "id": "main",
            "type": kind,
            "body": {
                "id": note_id,
                "text": text,
                "user": { "id": author, "username": author, "name": null }
            }
        }
    })
}

fn quiet_settings(state_dir: &std::path::Path) -> RuntimeSettings {
    RuntimeSettings {
        admission: AdmissionPolicy {
            bot_user_id: Some("riina".to_string()),
            ..AdmissionPolicy::default()
        },
        maintenance: None,
        jobs: JobSettings {
            follow_sync_interval: None,
            mention_poll: None,
            random_post_interval: None,
            timeline_post_interval: None,
            scheduled_post_times: Vec::new(),
            cleanup_at: None,
            backup_at: None,
            stats_at: None,
        },
        state_dir: Some(state_dir.to_path_buf()),
        decision_log: Some(LogRotationPolicy::default()),
        backup_on_shutdown: false,
        ..RuntimeSettings::default()
    }
}

#[tokio::test]
async fn integration_stream_frames_flow_through_admission_to_replies() {
    let temp = tempfile::tempdir().expect("tempdir");
    let platform = Arc::new(FakeMisskey::with_graph(&["alice", "bob"], &["bob"]));
    let store = Arc::new(InMemoryBotStore::new());
    let transport = Arc::new(ReplayTransport::replaying(vec![
        note_frame("mention", "m1", "alice", "フォローしてください"),
        note_frame("mention", "m2", "alice", "こんにちは"),
        note_frame("mention", "m2", "alice", "こんにちは"),
        json!({"type": "channel", "body": {"id": "main", "type": "mention", "body": 7}}),
        note_frame("mention", "m3", "carol", "hello"),
        note_frame("reply", "m4", "bob", "one"),
        note_frame("reply", "m5", "bob", "two"),
        note_frame("reply", "m6", "bob", "three"),
        note_frame("reply", "m7", "bob", "four"),
        note_frame("mention", "m8", "riina", "talking to myself"),
    ]));
    let drained = transport.drained.clone();

    let runtime = BotRuntime::assemble(
        RuntimeDependencies {
            platform: platform.clone(),
            store: store.clone(),
            generator: Arc::new(EchoGenerator),
            transport: transport.clone(),
            ng_words: Arc::new(NgWordFilter::default()),
        },
        quiet_settings(temp.path()),
    )
    .expect("assemble runtime");

    tokio::time::timeout(
        Duration::from_secs(10),
        runtime.run_until_shutdown(async move { drained.notified().await }),
    )
    .await
    .expect("runtime finished in time")
    .expect("clean shutdown");

    assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    let handshakes = transport.handshakes.lock().expect("handshakes").clone();
    assert_eq!(handshakes.len(), 1);
    assert!(handshakes[0].contains("\"main\""));

    assert_eq!(
        platform.follow_calls.lock().expect("follow calls").clone(),
        vec!["alice".to_string()]
    );
    let alice = store
        .get_follower("alice")
        .await
        .expect("store")
        .expect("alice stored");
    assert!(alice.is_mutual());

    let reply_targets: Vec<Option<String>> = platform
        .replies()
        .into_iter()
        .map(|(_, reply_to)| reply_to)
        .collect();
    assert_eq!(
        reply_targets,
        vec![
            Some("m2".to_string()),
            Some("m4".to_string()),
            Some("m5".to_string()),
            Some("m6".to_string()),
        ]
    );

    let now = Utc::now();
    let bob_replies = store
        .count_replies_between("bob", now - chrono::Duration::hours(1), now)
        .await
        .expect("count");
    assert_eq!(bob_replies, 3);

    let decisions = std::fs::read_to_string(temp.path().join(DECISION_LOG_FILE_NAME))
        .expect("decision log written");
    let records: Vec<Value> = decisions
        .lines()
        .map(|line| serde_json::from_str(line).expect("ndjson line"))
        .collect();
    let reasons: Vec<&str> = records
        .iter()
        .filter_map(|record| record["reason"].as_str())
        .collect();
    assert!(reasons.contains(&"unread-duplicate"));
    assert!(reasons.contains(&"unauthorized"));
    assert!(reasons.contains(&"rate-limited"));
    assert!(reasons.contains(&"self-authored"));
    assert!(records
        .iter()
        .any(|record| record["outcome"] == "followed-back" && record["user_id"] == "alice"));
    assert!(records.iter().any(|record| record["outcome"] == "malformed"));
}

#[tokio::test]
async fn integration_followed_event_runs_full_sync_with_unfollow_cascade() {
    let platform = Arc::new(FakeMisskey::with_graph(
        &["alice", "erin"],
        &["alice", "erin"],
    ));
    let store: Arc<InMemoryBotStore> = Arc::new(InMemoryBotStore::new());
    let reconciler = Arc::new(FollowReconciler::new(
        platform.clone(),
        store.clone(),
        ReconcilerPolicy::default(),
    ));
    let limiter = Arc::new(ReplyRateLimiter::new(
        store.clone(),
        RateLimitPolicy::default(),
    ));
    let admission = Arc::new(MentionAdmission::new(
        AdmissionPolicy::default(),
        reconciler.clone(),
        limiter,
        Arc::new(EchoGenerator),
        platform.clone(),
        store.clone(),
    ));
    let dispatcher = EventDispatcher::new(admission, reconciler.clone());

    let initial = reconciler.run_full_sync().await.expect("initial sync");
    assert_eq!(initial.added, 2);
    assert_eq!(initial.mutual, 2);

    platform
        .followers
        .lock()
        .expect("followers")
        .retain(|user| user.id != "erin");
    platform
        .followers
        .lock()
        .expect("followers")
        .push(remote_user("dave"));

    let frame = json!({
        "type": "channel",
        "body": {
            "id": "main",
            "type": "followed",
            "body": { "id": "dave", "username": "dave", "name": "Dave" }
        }
    });
    let outcome = dispatcher.handle_stream_frame(&frame.to_string()).await;
    let DispatchOutcome::FollowSynced(report) = outcome else {
        panic!("expected follow sync, got {outcome:?}");
    };
    assert_eq!(report.added, 1);
    assert_eq!(report.removed, 1);
    assert_eq!(report.unfollowed, 1);
    assert_eq!(report.mutual, 1);

    assert_eq!(
        platform.unfollow_calls.lock().expect("unfollow calls").clone(),
        vec!["erin".to_string()]
    );
    assert!(store.get_follower("erin").await.expect("store").is_none());
    let dave = store
        .get_follower("dave")
        .await
        .expect("store")
        .expect("dave stored");
    assert!(!dave.is_mutual());

    let mention = note_frame("mention", "d1", "dave", "hi riina");
    let outcome = dispatcher.handle_stream_frame(&mention.to_string()).await;
    assert_eq!(
        outcome,
        DispatchOutcome::Admission(AdmissionOutcome::Dropped(DropReason::Unauthorized))
    );
    assert!(platform.replies().is_empty());
}

#[tokio::test(start_paused = true)]
async fn integration_runtime_fails_after_stream_backoff_is_exhausted() {
    let temp = tempfile::tempdir().expect("tempdir");
    let transport = Arc::new(ReplayTransport::refusing());

    let runtime = BotRuntime::assemble(
        RuntimeDependencies {
            platform: Arc::new(FakeMisskey::with_graph(&[], &[])),
            store: Arc::new(InMemoryBotStore::new()),
            generator: Arc::new(EchoGenerator),
            transport: transport.clone(),
            ng_words: Arc::new(NgWordFilter::default()),
        },
        quiet_settings(temp.path()),
    )
    .expect("assemble runtime");

    let error = runtime
        .run_until_shutdown(std::future::pending())
        .await
        .expect_err("stream gave up");
    assert!(error.to_string().contains("6 consecutive failures"));
    assert_eq!(transport.connects.load(Ordering::SeqCst), 6);

    let health: Value = serde_json::from_str(
        &std::fs::read_to_string(temp.path().join("stream-health.json")).expect("health file"),
    )
    .expect("health json");
    assert_eq!(health["failure_streak"], 6);
}
