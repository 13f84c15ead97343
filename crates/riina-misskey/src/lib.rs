//! Misskey platform access: the [`PlatformClient`] contract the runtime depends
//! on, its REST implementation, and the note/user shapes shared with the event
//! stream.

mod client;
mod error;
mod helpers;
mod types;

pub use client::{MisskeyClient, MisskeyConfig, PlatformClient};
pub use error::{PlatformError, PlatformErrorCategory};
pub use types::{
    MentionEvent, MentionSource, NotePayload, RemoteUser, TimelineNote, TimelineSource,
    UserPayload,
};
