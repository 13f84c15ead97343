use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::helpers::{
    is_retryable_status, is_retryable_transport_error, parse_retry_after, retry_delay,
    truncate_for_error,
};
use crate::{
    MentionEvent, MentionSource, NotePayload, PlatformError, RemoteUser, TimelineNote,
    TimelineSource, UserPayload,
};

const RELATION_PAGE_LIMIT: usize = 100;
const MAX_RELATION_PAGES: usize = 200;

/// REST operations the bot performs against its own account.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn verify_credentials(&self) -> Result<RemoteUser, PlatformError>;
    /// Complete follower list of the bot account.
    async fn fetch_followers(&self) -> Result<Vec<RemoteUser>, PlatformError>;
    /// Complete list of accounts the bot follows.
    async fn fetch_following(&self) -> Result<Vec<RemoteUser>, PlatformError>;
    async fn follow(&self, user_id: &str) -> Result<(), PlatformError>;
    async fn unfollow(&self, user_id: &str) -> Result<(), PlatformError>;
    /// Publishes a note, optionally as a reply, and returns the new note id.
    async fn send_post(&self, text: &str, reply_to: Option<&str>) -> Result<String, PlatformError>;
    /// Recent mention/reply notifications, newest first.
    async fn fetch_recent_mentions(&self, limit: usize) -> Result<Vec<MentionEvent>, PlatformError>;
    async fn fetch_timeline(
        &self,
        source: TimelineSource,
        limit: usize,
    ) -> Result<Vec<TimelineNote>, PlatformError>;
}

#[derive(Debug, Clone)]
pub struct MisskeyConfig {
    /// Instance origin, e.g. `https://misskey.example`.
    pub instance_url: String,
    pub api_token: String,
    /// Visibility for every note the bot creates (`public`, `home`, `followers`).
    pub default_visibility: String,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
}

/// `reqwest`-based [`PlatformClient`].
pub struct MisskeyClient {
    http: reqwest::Client,
    api_base: String,
    api_token: String,
    default_visibility: String,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
    own_user: OnceCell<RemoteUser>,
}

impl MisskeyClient {
    pub fn new(config: MisskeyConfig) -> Result<Self, PlatformError> {
        let instance_url = config.instance_url.trim().trim_end_matches('/').to_string();
        if instance_url.is_empty() {
            return Err(PlatformError::InvalidConfig(
                "instance url cannot be empty".to_string(),
            ));
        }
        if config.api_token.trim().is_empty() {
            return Err(PlatformError::InvalidConfig(
                "api token cannot be empty".to_string(),
            ));
        }

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("riina-bot"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .map_err(|error| PlatformError::InvalidConfig(error.to_string()))?;

        Ok(Self {
            http,
            api_base: format!("{instance_url}/api"),
            api_token: config.api_token.trim().to_string(),
            default_visibility: config.default_visibility,
            retry_max_attempts: config.retry_max_attempts.max(1),
            retry_base_delay_ms: config.retry_base_delay_ms.max(1),
            own_user: OnceCell::new(),
        })
    }

    /// WebSocket endpoint for the streaming API, authenticated with the token.
    pub fn streaming_url(&self) -> Result<String, PlatformError> {
        let origin = self.api_base.trim_end_matches("/api");
        let mut url = reqwest::Url::parse(origin)
            .map_err(|error| PlatformError::InvalidConfig(format!("instance url: {error}")))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(PlatformError::InvalidConfig(format!(
                    "unsupported instance url scheme '{other}'"
                )))
            }
        };
        url.set_scheme(scheme).map_err(|()| {
            PlatformError::InvalidConfig("failed to derive streaming scheme".to_string())
        })?;
        url.set_path("/streaming");
        url.query_pairs_mut().clear().append_pair("i", &self.api_token);
        Ok(url.to_string())
    }

    async fn own_user_id(&self) -> Result<String, PlatformError> {
        let user = self
            .own_user
            .get_or_try_init(|| self.fetch_self())
            .await?;
        Ok(user.id.clone())
    }

    async fn fetch_self(&self) -> Result<RemoteUser, PlatformError> {
        let payload: UserPayload = self.request_json("i", json!({})).await?;
        Ok(payload.into())
    }

    async fn fetch_relations(
        &self,
        operation: &'static str,
        field: &'static str,
    ) -> Result<Vec<RemoteUser>, PlatformError> {
        let user_id = self.own_user_id().await?;
        let mut users = Vec::new();
        let mut until_id: Option<String> = None;
        for page in 0..MAX_RELATION_PAGES {
            let mut body = json!({ "userId": user_id, "limit": RELATION_PAGE_LIMIT });
            if let Some(cursor) = &until_id {
                body["untilId"] = json!(cursor);
            }
            let entries: Vec<Value> = self.request_json(operation, body).await?;
            let page_len = entries.len();
            for entry in entries {
                let relation: RelationEntry =
                    serde_json::from_value(entry).map_err(|error| PlatformError::Decode {
                        operation,
                        message: error.to_string(),
                    })?;
                let user = relation.user(field).ok_or_else(|| PlatformError::Decode {
                    operation,
                    message: format!("relation entry is missing '{field}'"),
                })?;
                until_id = Some(relation.id);
                users.push(user.into());
            }
            debug!(operation, page, page_len, total = users.len(), "fetched relation page");
            if page_len < RELATION_PAGE_LIMIT {
                return Ok(users);
            }
        }
        Err(PlatformError::Decode {
            operation,
            message: format!("more than {MAX_RELATION_PAGES} pages of relations"),
        })
    }

    async fn request_json<T>(&self, operation: &'static str, body: Value) -> Result<T, PlatformError>
    where
        T: DeserializeOwned,
    {
        let value = self.request_value(operation, body).await?;
        serde_json::from_value(value).map_err(|error| PlatformError::Decode {
            operation,
            message: error.to_string(),
        })
    }

    async fn request_value(&self, operation: &'static str, mut body: Value) -> Result<Value, PlatformError> {
        body["i"] = json!(self.api_token);
        let url = format!("{}/{operation}", self.api_base);
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let response = self
                .http
                .post(&url)
                .header("x-riina-retry-attempt", attempt.saturating_sub(1).to_string())
                .json(&body)
                .send()
                .await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let raw = response
                            .text()
                            .await
                            .map_err(|source| PlatformError::Transport { operation, source })?;
                        if raw.trim().is_empty() {
                            return Ok(Value::Null);
                        }
                        return serde_json::from_str(&raw).map_err(|error| PlatformError::Decode {
                            operation,
                            message: error.to_string(),
                        });
                    }

                    let retry_after = parse_retry_after(response.headers());
                    let raw = response.text().await.unwrap_or_default();
                    if attempt < self.retry_max_attempts && is_retryable_status(status.as_u16()) {
                        debug!(operation, attempt, status = status.as_u16(), "retrying misskey request");
                        tokio::time::sleep(retry_delay(
                            self.retry_base_delay_ms,
                            attempt,
                            retry_after,
                        ))
                        .await;
                        continue;
                    }
                    return Err(PlatformError::Status {
                        operation,
                        status: status.as_u16(),
                        body: truncate_for_error(&raw, 800),
                    });
                }
                Err(error) => {
                    if attempt < self.retry_max_attempts && is_retryable_transport_error(&error) {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, None))
                            .await;
                        continue;
                    }
                    return Err(PlatformError::Transport {
                        operation,
                        source: error,
                    });
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RelationEntry {
    id: String,
    #[serde(default)]
    follower: Option<UserPayload>,
    #[serde(default)]
    followee: Option<UserPayload>,
}

impl RelationEntry {
    fn user(&self, field: &str) -> Option<UserPayload> {
        match field {
            "follower" => self.follower.clone(),
            _ => self.followee.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NotificationEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    note: Option<NotePayload>,
}

#[derive(Debug, Deserialize)]
struct CreatedNoteEnvelope {
    #[serde(rename = "createdNote")]
    created_note: CreatedNote,
}

#[derive(Debug, Deserialize)]
struct CreatedNote {
    id: String,
}

#[async_trait]
impl PlatformClient for MisskeyClient {
    async fn verify_credentials(&self) -> Result<RemoteUser, PlatformError> {
        let user = self.own_user.get_or_try_init(|| self.fetch_self()).await?;
        Ok(user.clone())
    }

    async fn fetch_followers(&self) -> Result<Vec<RemoteUser>, PlatformError> {
        self.fetch_relations("users/followers", "follower").await
    }

    async fn fetch_following(&self) -> Result<Vec<RemoteUser>, PlatformError> {
        self.fetch_relations("users/following", "followee").await
    }

    async fn follow(&self, user_id: &str) -> Result<(), PlatformError> {
        self.request_value("following/create", json!({ "userId": user_id }))
            .await
            .map(|_| ())
    }

    async fn unfollow(&self, user_id: &str) -> Result<(), PlatformError> {
        self.request_value("following/delete", json!({ "userId": user_id }))
            .await
            .map(|_| ())
    }

    async fn send_post(&self, text: &str, reply_to: Option<&str>) -> Result<String, PlatformError> {
        let mut body = json!({ "text": text, "visibility": self.default_visibility });
        if let Some(reply_to) = reply_to {
            body["replyId"] = json!(reply_to);
        }
        let envelope: CreatedNoteEnvelope = self.request_json("notes/create", body).await?;
        Ok(envelope.created_note.id)
    }

    async fn fetch_recent_mentions(&self, limit: usize) -> Result<Vec<MentionEvent>, PlatformError> {
        let entries: Vec<NotificationEntry> = self
            .request_json(
                "i/notifications",
                json!({ "limit": limit.clamp(1, 100), "includeTypes": ["mention", "reply"] }),
            )
            .await?;
        Ok(entries
            .into_iter()
            .filter(|entry| matches!(entry.kind.as_str(), "mention" | "reply"))
            .filter_map(|entry| entry.note)
            .map(|note| MentionEvent::from_note(note, MentionSource::Poll))
            .collect())
    }

    async fn fetch_timeline(
        &self,
        source: TimelineSource,
        limit: usize,
    ) -> Result<Vec<TimelineNote>, PlatformError> {
        let notes: Vec<NotePayload> = self
            .request_json(source.endpoint(), json!({ "limit": limit.clamp(1, 100) }))
            .await?;
        Ok(notes.into_iter().map(TimelineNote::from).collect())
    }
}
