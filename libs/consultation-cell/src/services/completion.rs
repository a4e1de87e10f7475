use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use shared_config::AppConfig;

use crate::error::ConsultationError;
use crate::models::{MessageRecord, MessageRole};

/// One increment from the completion backend. `Done` is the explicit terminal
/// signal; a turn is only finalized after observing it.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionChunk {
    Token(String),
    Done,
}

pub type CompletionStream =
    Pin<Box<dyn Stream<Item = Result<CompletionChunk, ConsultationError>> + Send>>;

/// Streaming completion seam. The engine is backend-agnostic beyond "ordered
/// message list in, token stream with a terminal signal out".
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn stream_completion(
        &self,
        history: &[MessageRecord],
    ) -> Result<CompletionStream, ConsultationError>;
}

// ==============================================================================
// OPENAI-COMPATIBLE CLIENT
// ==============================================================================

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<PromptMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct PromptMessage<'a> {
    role: MessageRole,
    content: &'a str,
}

/// Client for any OpenAI-compatible `/chat/completions` streaming endpoint.
pub struct OpenAiCompletionClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompletionClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.ai_backend_url.trim_end_matches('/').to_string(),
            api_key: config.ai_backend_api_key.clone(),
            model: config.ai_model.clone(),
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAiCompletionClient {
    async fn stream_completion(
        &self,
        history: &[MessageRecord],
    ) -> Result<CompletionStream, ConsultationError> {
        let request = CompletionRequest {
            model: &self.model,
            messages: history
                .iter()
                .map(|record| PromptMessage {
                    role: record.role,
                    content: &record.content,
                })
                .collect(),
            stream: true,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json");

        if !self.api_key.is_empty() {
            req = req.header(AUTHORIZATION, format!("Bearer {}", self.api_key));
        }

        let response = req
            .json(&request)
            .send()
            .await
            .map_err(|e| ConsultationError::Backend(format!("Completion dispatch failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ConsultationError::Backend(format!(
                "Completion request failed ({}): {}",
                status, message
            )));
        }

        Ok(Box::pin(TokenDecoder::new(response.bytes_stream())))
    }
}

// ==============================================================================
// SSE TOKEN DECODING
// ==============================================================================

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Decodes the `data:` lines of an OpenAI-style SSE body into completion
/// chunks. Only data lines matter here; other SSE fields and malformed chunks
/// are skipped. End of body without `[DONE]` is normalized to `Done` so
/// consumers always see an explicit terminal.
struct TokenDecoder<S> {
    inner: S,
    buffer: String,
    done: bool,
}

impl<S> TokenDecoder<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: String::new(),
            done: false,
        }
    }

    /// Pops the next complete `data:` payload out of the line buffer.
    fn next_data_line(&mut self) -> Option<String> {
        while let Some(line_end) = self.buffer.find('\n') {
            let mut line = self.buffer[..line_end].to_string();
            self.buffer.drain(..=line_end);

            if line.ends_with('\r') {
                line.pop();
            }

            if let Some(payload) = line.strip_prefix("data:") {
                return Some(payload.strip_prefix(' ').unwrap_or(payload).to_string());
            }
        }
        None
    }
}

fn decode_data_line(payload: &str) -> Option<CompletionChunk> {
    if payload == "[DONE]" {
        return Some(CompletionChunk::Done);
    }

    let chunk: StreamChunk = serde_json::from_str(payload).ok()?;
    let token = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)?;

    if token.is_empty() {
        None
    } else {
        Some(CompletionChunk::Token(token))
    }
}

impl<S, E> Stream for TokenDecoder<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    type Item = Result<CompletionChunk, ConsultationError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.done {
            return Poll::Ready(None);
        }

        loop {
            while let Some(payload) = this.next_data_line() {
                if let Some(chunk) = decode_data_line(&payload) {
                    if chunk == CompletionChunk::Done {
                        this.done = true;
                    }
                    return Poll::Ready(Some(Ok(chunk)));
                }
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    if let Ok(text) = std::str::from_utf8(&bytes) {
                        this.buffer.push_str(text);
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(ConsultationError::Backend(format!(
                        "Completion stream failed: {}",
                        e
                    )))));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(Some(Ok(CompletionChunk::Done)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
