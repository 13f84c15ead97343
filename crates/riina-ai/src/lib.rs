//! Generative-text backend for the bot: a provider-neutral chat contract, the
//! Gemini `generateContent` client, and the reply/post generator that turns raw
//! completions into postable text.
mod google;
mod retry;
mod text_generation;
mod types;

pub use google::{GoogleClient, GoogleConfig, DEFAULT_GOOGLE_API_BASE};
pub use text_generation::{
    normalize_generated_text, GenerationSettings, LlmTextGenerator, TextGenerator,
    DEFAULT_MAX_POST_CHARS,
};
pub use types::{ChatRequest, ChatResponse, ChatUsage, LlmClient, Message, MessageRole, RiinaAiError};
