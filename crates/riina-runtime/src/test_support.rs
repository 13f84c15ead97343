use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use riina_ai::TextGenerator;
use riina_misskey::{
    MentionEvent, MentionSource, PlatformClient, PlatformError, RemoteUser, TimelineNote,
    TimelineSource,
};

use crate::stream_connector::{StreamSession, StreamTransport, TransportError};

pub(crate) fn user(id: &str) -> RemoteUser {
    RemoteUser {
        id: id.to_string(),
        username: format!("name-{id}"),
        display_name: None,
    }
}

pub(crate) fn mention(mention_id: &str, author_id: &str, text: &str, via: MentionSource) -> MentionEvent {
    MentionEvent {
        mention_id: mention_id.to_string(),
        author_id: author_id.to_string(),
        author_name: format!("name-{author_id}"),
        text: text.to_string(),
        received_via: via,
    }
}

fn scripted_failure(operation: &'static str) -> PlatformError {
    PlatformError::Status {
        operation,
        status: 500,
        body: "scripted failure".to_string(),
    }
}

/// Platform double whose follow graph mutates as the bot follows/unfollows.
#[derive(Default)]
pub(crate) struct ScriptedPlatform {
    pub(crate) followers: Mutex<Vec<RemoteUser>>,
    pub(crate) following: Mutex<Vec<RemoteUser>>,
    pub(crate) recent_mentions: Mutex<Vec<MentionEvent>>,
    pub(crate) timeline: Mutex<Vec<TimelineNote>>,
    pub(crate) calls: Mutex<Vec<String>>,
    pub(crate) sent: Mutex<Vec<(String, Option<String>)>>,
    pub(crate) fail_fetch: AtomicBool,
    pub(crate) fail_follow: AtomicBool,
    pub(crate) fail_unfollow: AtomicBool,
    pub(crate) fail_send: AtomicBool,
    next_post_id: AtomicUsize,
}

impl ScriptedPlatform {
    pub(crate) fn with_graph(followers: &[&str], following: &[&str]) -> Self {
        let platform = Self::default();
        *platform.followers.lock().expect("followers") =
            followers.iter().map(|id| user(id)).collect();
        *platform.following.lock().expect("following") =
            following.iter().map(|id| user(id)).collect();
        platform
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    pub(crate) fn sent(&self) -> Vec<(String, Option<String>)> {
        self.sent.lock().expect("sent").clone()
    }

    pub(crate) fn remove_follower(&self, user_id: &str) {
        self.followers
            .lock()
            .expect("followers")
            .retain(|user| user.id != user_id);
    }

    fn log(&self, call: String) {
        self.calls.lock().expect("calls").push(call);
    }
}

#[async_trait]
impl PlatformClient for ScriptedPlatform {
    async fn verify_credentials(&self) -> Result<RemoteUser, PlatformError> {
        Ok(user("bot"))
    }

    async fn fetch_followers(&self) -> Result<Vec<RemoteUser>, PlatformError> {
        self.log("fetch_followers".to_string());
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(scripted_failure("users/followers"));
        }
        Ok(self.followers.lock().expect("followers").clone())
    }

    async fn fetch_following(&self) -> Result<Vec<RemoteUser>, PlatformError> {
        self.log("fetch_following".to_string());
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(scripted_failure("users/following"));
        }
        Ok(self.following.lock().expect("following").clone())
    }

    async fn follow(&self, user_id: &str) -> Result<(), PlatformError> {
        self.log(format!("follow:{user_id}"));
        if self.fail_follow.load(Ordering::SeqCst) {
            return Err(scripted_failure("following/create"));
        }
        let mut following = self.following.lock().expect("following");
        if !following.iter().any(|user| user.id == user_id) {
            following.push(user(user_id));
        }
        Ok(())
    }

    async fn unfollow(&self, user_id: &str) -> Result<(), PlatformError> {
        self.log(format!("unfollow:{user_id}"));
        if self.fail_unfollow.load(Ordering::SeqCst) {
            return Err(scripted_failure("following/delete"));
        }
        self.following
            .lock()
            .expect("following")
            .retain(|user| user.id != user_id);
        Ok(())
    }

    async fn send_post(&self, text: &str, reply_to: Option<&str>) -> Result<String, PlatformError> {
        self.log(format!("send:{}", reply_to.unwrap_or("-")));
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(scripted_failure("notes/create"));
        }
        self.sent
            .lock()
            .expect("sent")
            .push((text.to_string(), reply_to.map(str::to_string)));
        let id = self.next_post_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("note-{id}"))
    }

    async fn fetch_recent_mentions(&self, limit: usize) -> Result<Vec<MentionEvent>, PlatformError> {
        self.log("fetch_recent_mentions".to_string());
        let mentions = self.recent_mentions.lock().expect("mentions");
        Ok(mentions.iter().take(limit).cloned().collect())
    }

    async fn fetch_timeline(
        &self,
        source: TimelineSource,
        limit: usize,
    ) -> Result<Vec<TimelineNote>, PlatformError> {
        self.log(format!("fetch_timeline:{}", source.endpoint()));
        let notes = self.timeline.lock().expect("timeline");
        Ok(notes.iter().take(limit).cloned().collect())
    }
}

/// Generator double that replays scripted outputs, then falls back to a fixed
/// answer.
pub(crate) struct ScriptedGenerator {
    script: Mutex<VecDeque<Option<String>>>,
    fallback: Option<String>,
    reply_delay: Option<Duration>,
    pub(crate) reply_calls: AtomicUsize,
    pub(crate) post_topics: Mutex<Vec<Option<String>>>,
}

impl ScriptedGenerator {
    pub(crate) fn always(text: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(text.to_string()),
            reply_delay: None,
            reply_calls: AtomicUsize::new(0),
            post_topics: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn unavailable() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            reply_delay: None,
            reply_calls: AtomicUsize::new(0),
            post_topics: Mutex::new(Vec::new()),
        }
    }

    /// Each reply yields to the runtime for `delay` before answering.
    pub(crate) fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = Some(delay);
        self
    }

    pub(crate) fn replies_requested(&self) -> usize {
        self.reply_calls.load(Ordering::SeqCst)
    }

    fn next(&self) -> Option<String> {
        self.script
            .lock()
            .expect("script")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate_reply(&self, _message: &str, _author_name: &str) -> Option<String> {
        self.reply_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.reply_delay {
            tokio::time::sleep(delay).await;
        }
        self.next()
    }

    async fn generate_post(&self, topic: Option<&str>) -> Option<String> {
        self.post_topics
            .lock()
            .expect("topics")
            .push(topic.map(str::to_string));
        self.next()
    }
}

/// Transport whose sessions subscribe and then stay silent.
#[derive(Default)]
pub(crate) struct SilentTransport {
    pub(crate) refuse: AtomicBool,
    pub(crate) connects: AtomicUsize,
}

#[async_trait]
impl StreamTransport for SilentTransport {
    async fn connect(&self) -> Result<Box<dyn StreamSession>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        Ok(Box::new(SilentSession))
    }
}

struct SilentSession;

#[async_trait]
impl StreamSession for SilentSession {
    async fn send_text(&mut self, _text: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<String, TransportError> {
        std::future::pending().await
    }

    async fn close(&mut self) {}
}
