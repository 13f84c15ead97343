use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Account reference as returned by the users/following endpoints.
pub struct RemoteUser {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
}

impl From<UserPayload> for RemoteUser {
    fn from(payload: UserPayload) -> Self {
        Self {
            id: payload.id,
            username: payload.username,
            display_name: payload.name.filter(|name| !name.trim().is_empty()),
        }
    }
}

/// Wire shape of a Misskey user object. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct UserPayload {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Wire shape of a Misskey note as it appears in stream bodies, notifications
/// and timelines.
#[derive(Debug, Clone, Deserialize)]
pub struct NotePayload {
    pub id: String,
    #[serde(default)]
    pub text: Option<String>,
    pub user: UserPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Delivery path a mention arrived through.
pub enum MentionSource {
    Stream,
    Poll,
}

impl MentionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Poll => "poll",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A note that mentions or replies to the bot.
pub struct MentionEvent {
    pub mention_id: String,
    pub author_id: String,
    pub author_name: String,
    pub text: String,
    pub received_via: MentionSource,
}

impl MentionEvent {
    pub fn from_note(note: NotePayload, received_via: MentionSource) -> Self {
        Self {
            mention_id: note.id,
            author_id: note.user.id,
            author_name: note.user.username,
            text: note.text.unwrap_or_default(),
            received_via,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineSource {
    Home,
    Local,
    Global,
}

impl TimelineSource {
    pub fn endpoint(self) -> &'static str {
        match self {
            Self::Home => "notes/timeline",
            Self::Local => "notes/local-timeline",
            Self::Global => "notes/global-timeline",
        }
    }
}

impl std::str::FromStr for TimelineSource {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "home" => Ok(Self::Home),
            "local" => Ok(Self::Local),
            "global" => Ok(Self::Global),
            other => Err(format!(
                "unknown timeline source '{other}' (expected home, local or global)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineNote {
    pub id: String,
    pub author_id: String,
    pub text: Option<String>,
}

impl From<NotePayload> for TimelineNote {
    fn from(note: NotePayload) -> Self {
        Self {
            id: note.id,
            author_id: note.user.id,
            text: note.text,
        }
    }
}
