use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::debug;

use crate::{
    retry::{
        is_retryable_http_error, new_request_id, parse_retry_after_ms, retry_budget_allows_delay,
        retry_delay_ms, should_retry_status,
    },
    ChatRequest, ChatResponse, ChatUsage, LlmClient, Message, MessageRole, RiinaAiError,
};

pub const DEFAULT_GOOGLE_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone)]
/// Connection settings for [`GoogleClient`].
pub struct GoogleConfig {
    pub api_base: String,
    pub api_key: String,
    pub request_timeout_ms: u64,
    pub max_retries: usize,
    pub retry_budget_ms: u64,
    pub retry_jitter: bool,
}

impl GoogleConfig {
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_GOOGLE_API_BASE.to_string(),
            api_key: api_key.into(),
            request_timeout_ms: 30_000,
            max_retries: 2,
            retry_budget_ms: 0,
            retry_jitter: true,
        }
    }
}

#[derive(Debug, Clone)]
/// Gemini `generateContent` client.
pub struct GoogleClient {
    client: reqwest::Client,
    config: GoogleConfig,
}

impl GoogleClient {
    pub fn new(config: GoogleConfig) -> Result<Self, RiinaAiError> {
        if config.api_key.trim().is_empty() {
            return Err(RiinaAiError::MissingApiKey);
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(
                config.request_timeout_ms.max(1),
            ))
            .build()?;

        Ok(Self { client, config })
    }

    fn generate_content_url(&self, model: &str) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        if base.contains(":generateContent") {
            return base.replace("{model}", model);
        }
        format!("{base}/models/{model}:generateContent")
    }
}

#[async_trait]
impl LlmClient for GoogleClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, RiinaAiError> {
        let body = build_generate_content_body(&request);
        let url = self.generate_content_url(&request.model);
        let started = std::time::Instant::now();
        let max_retries = self.config.max_retries;

        for attempt in 0..=max_retries {
            let response = self
                .client
                .post(&url)
                .header("x-riina-request-id", new_request_id())
                .header("x-riina-retry-attempt", attempt.to_string())
                .query(&[("key", self.config.api_key.as_str())])
                .json(&body)
                .send()
                .await;

            let retry_after_ms = match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let raw = response.text().await?;
                        return parse_generate_content_response(&raw);
                    }
                    let retry_after_ms = parse_retry_after_ms(response.headers());
                    let raw = response.text().await?;
                    if attempt >= max_retries || !should_retry_status(status.as_u16()) {
                        return Err(RiinaAiError::HttpStatus {
                            status: status.as_u16(),
                            body: raw,
                        });
                    }
                    retry_after_ms
                }
                Err(error) => {
                    if attempt >= max_retries || !is_retryable_http_error(&error) {
                        return Err(RiinaAiError::Http(error));
                    }
                    None
                }
            };

            let delay_ms = retry_delay_ms(attempt, self.config.retry_jitter, retry_after_ms);
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            if !retry_budget_allows_delay(elapsed_ms, delay_ms, self.config.retry_budget_ms) {
                return Err(RiinaAiError::InvalidResponse(format!(
                    "retry budget exhausted after {} attempt(s)",
                    attempt + 1
                )));
            }
            debug!(attempt, delay_ms, "retrying gemini generateContent");
            sleep(std::time::Duration::from_millis(delay_ms)).await;
        }

        Err(RiinaAiError::InvalidResponse(
            "request retry loop terminated unexpectedly".to_string(),
        ))
    }
}

fn build_generate_content_body(request: &ChatRequest) -> Value {
    let system = request
        .messages
        .iter()
        .filter(|message| message.role == MessageRole::System)
        .map(|message| message.text.trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    let contents = request
        .messages
        .iter()
        .filter(|message| !message.text.trim().is_empty())
        .filter_map(|message| {
            let role = match message.role {
                MessageRole::System => return None,
                MessageRole::User => "user",
                MessageRole::Assistant => "model",
            };
            Some(json!({ "role": role, "parts": [{ "text": message.text }] }))
        })
        .collect::<Vec<_>>();

    let mut body = json!({ "contents": contents });
    if !system.is_empty() {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }

    if request.temperature.is_some() || request.max_tokens.is_some() {
        let mut generation_config = json!({});
        if let Some(temperature) = request.temperature {
            generation_config["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            generation_config["maxOutputTokens"] = json!(max_tokens);
        }
        body["generationConfig"] = generation_config;
    }

    body
}

fn parse_generate_content_response(raw: &str) -> Result<ChatResponse, RiinaAiError> {
    let parsed: GenerateContentResponse = serde_json::from_str(raw)?;
    let candidate = parsed
        .candidates
        .and_then(|candidates| candidates.into_iter().next())
        .ok_or_else(|| {
            RiinaAiError::InvalidResponse("response contained no candidates".to_string())
        })?;

    let text = candidate
        .content
        .and_then(|content| content.parts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|part| part.text)
        .collect::<String>();

    let usage = parsed
        .usage_metadata
        .map(|usage| ChatUsage {
            input_tokens: usage.prompt_token_count.unwrap_or(0),
            output_tokens: usage.candidates_token_count.unwrap_or(0),
            total_tokens: usage.total_token_count.unwrap_or(0),
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        message: Message::assistant(text),
        finish_reason: candidate.finish_reason,
        usage,
    })
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<GenerateContentCandidate>>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GenerateContentUsage>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentCandidate {
    content: Option<GenerateContentContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentContent {
    parts: Option<Vec<GenerateContentPart>>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u64>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u64>,
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<u64>,
}
