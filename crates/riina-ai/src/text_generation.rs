use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{ChatRequest, LlmClient, Message};

/// Longest note the bot publishes, in characters.
pub const DEFAULT_MAX_POST_CHARS: usize = 140;

#[async_trait]
/// Produces postable text. `None` means generation is unavailable for this
/// attempt; callers drop the action instead of retrying.
pub trait TextGenerator: Send + Sync {
    async fn generate_reply(&self, message: &str, author_name: &str) -> Option<String>;
    async fn generate_post(&self, topic: Option<&str>) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    pub model: String,
    /// Persona instructions sent as the system turn of every request.
    pub character_prompt: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub max_chars: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash".to_string(),
            character_prompt: String::new(),
            temperature: 1.0,
            max_output_tokens: 1024,
            max_chars: DEFAULT_MAX_POST_CHARS,
        }
    }
}

/// [`TextGenerator`] backed by any [`LlmClient`].
pub struct LlmTextGenerator {
    client: Arc<dyn LlmClient>,
    settings: GenerationSettings,
}

impl LlmTextGenerator {
    pub fn new(client: Arc<dyn LlmClient>, settings: GenerationSettings) -> Self {
        Self { client, settings }
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    async fn complete_prompt(&self, purpose: &'static str, prompt: String) -> Option<String> {
        let mut messages = Vec::with_capacity(2);
        if !self.settings.character_prompt.trim().is_empty() {
            messages.push(Message::system(self.settings.character_prompt.clone()));
        }
        messages.push(Message::user(prompt));
        let request = ChatRequest {
            model: self.settings.model.clone(),
            messages,
            max_tokens: Some(self.settings.max_output_tokens),
            temperature: Some(self.settings.temperature),
        };

        let response = match self.client.complete(request).await {
            Ok(response) => response,
            Err(error) => {
                warn!(purpose, error = %error, "text generation failed");
                return None;
            }
        };
        if let Some(reason) = response
            .finish_reason
            .as_deref()
            .filter(|reason| !reason.eq_ignore_ascii_case("stop"))
        {
            debug!(purpose, finish_reason = reason, "generation finished early");
        }

        let normalized = normalize_generated_text(&response.message.text, self.settings.max_chars);
        if normalized.is_none() {
            warn!(purpose, "text generation returned empty output");
        }
        normalized
    }
}

#[async_trait]
impl TextGenerator for LlmTextGenerator {
    async fn generate_reply(&self, message: &str, author_name: &str) -> Option<String> {
        let prompt = format!(
            "@{author_name} sent you this message:\n{message}\n\n\
             Reply to them in character in at most {} characters. \
             Output only the reply text.",
            self.settings.max_chars
        );
        self.complete_prompt("reply", prompt).await
    }

    async fn generate_post(&self, topic: Option<&str>) -> Option<String> {
        let prompt = match topic {
            Some(topic) => format!(
                "You noticed the keyword \"{topic}\" on your timeline. \
                 Write a short in-character monologue about it in at most {} characters. \
                 Do not address anyone. Output only the post text.",
                self.settings.max_chars
            ),
            None => format!(
                "Write one in-character post for your timeline in at most {} characters. \
                 Output only the post text.",
                self.settings.max_chars
            ),
        };
        self.complete_prompt("post", prompt).await
    }
}

/// Flattens model output into a single postable line: trims, turns line breaks
/// into spaces, squeezes repeated ASCII spaces and cuts to `max_chars`
/// characters. Returns `None` when nothing printable is left.
pub fn normalize_generated_text(raw: &str, max_chars: usize) -> Option<String> {
    let mut flattened = String::with_capacity(raw.len());
    let mut previous_space = false;
    for ch in raw.trim().chars() {
        let ch = if matches!(ch, '\n' | '\r') { ' ' } else { ch };
        if ch == ' ' {
            if previous_space {
                continue;
            }
            previous_space = true;
        } else {
            previous_space = false;
        }
        flattened.push(ch);
    }

    let truncated = flattened
        .chars()
        .take(max_chars)
        .collect::<String>()
        .trim_end()
        .to_string();
    (!truncated.is_empty()).then_some(truncated)
}
