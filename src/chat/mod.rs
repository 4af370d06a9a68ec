//! Streaming chat-completion client.
//!
//! [`ChatClient`] keeps the rolling conversation history and starts one
//! stream per turn. The stream itself runs on a spawned producer task that
//! feeds text deltas into a [`DeltaWriter`] as they arrive, so playback can
//! begin long before the reply is complete. The task honours a
//! [`CancellationToken`] for barge-in: once cancelled it stops appending and
//! the partial reply never reaches the history.

pub mod sse;

use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::ChatConfig;
use crate::error::{BridgeError, Result};
use crate::segment::DeltaWriter;
use sse::{DONE_SENTINEL, SseDataParser};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Chat-completion client with rolling history.
pub struct ChatClient {
    http: reqwest::Client,
    config: ChatConfig,
    history: Vec<ChatMessage>,
}

impl ChatClient {
    pub fn new(config: ChatConfig) -> Self {
        let history = vec![ChatMessage::system(config.system_prompt.clone())];
        Self {
            http: reqwest::Client::new(),
            config,
            history,
        }
    }

    /// Start streaming a reply to `user_text`.
    ///
    /// The user message joins the history immediately, interrupted or not;
    /// the assistant reply joins only via [`ChatClient::commit_reply`] so an
    /// interrupted turn never leaves a half-sentence in the transcript.
    ///
    /// Fails before any playback if the endpoint rejects the request.
    pub async fn begin_stream(
        &mut self,
        user_text: &str,
        writer: DeltaWriter,
        cancel: CancellationToken,
    ) -> Result<CompletionStream> {
        self.history.push(ChatMessage::user(user_text));
        self.trim_history();

        let url = format!("{}/v1/chat/completions", self.config.api_base);
        let body = json!({
            "model": self.config.model,
            "messages": self.history,
            "stream": true,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "max_tokens": self.config.max_tokens,
        });
        debug!(
            "chat request: {} messages to {}",
            self.history.len(),
            self.config.model
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::Chat(format!("chat request: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Chat(format!(
                "chat HTTP {status}: {}",
                error_message(&body)
            )));
        }

        let handle = tokio::spawn(pump_deltas(response, writer, cancel));
        Ok(CompletionStream { handle })
    }

    /// Record a completed assistant reply in the history.
    pub fn commit_reply(&mut self, reply: &str) {
        self.history.push(ChatMessage::assistant(reply));
        self.trim_history();
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Cap the history at the configured size, dropping the oldest
    /// exchanges while always keeping the leading system prompt.
    fn trim_history(&mut self) {
        if self.config.max_history_messages == 0 {
            return;
        }
        let cap = self.config.max_history_messages.max(2);
        let excess = self.history.len().saturating_sub(cap);
        if excess > 0 {
            self.history.drain(1..1 + excess);
        }
    }
}

/// Handle on the producer task pumping deltas into the sentence buffer.
#[derive(Debug)]
pub struct CompletionStream {
    handle: JoinHandle<Result<String>>,
}

impl CompletionStream {
    /// Whether the producer task has finished, normally or otherwise.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the producer and return the full accumulated reply.
    pub async fn join(self) -> Result<String> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(BridgeError::Task(format!("chat stream task: {e}"))),
        }
    }
}

/// Producer task: decode SSE payloads into deltas and append them to the
/// shared buffer until the stream ends or the token is cancelled.
async fn pump_deltas(
    response: reqwest::Response,
    mut writer: DeltaWriter,
    cancel: CancellationToken,
) -> Result<String> {
    let mut stream = response.bytes_stream();
    let mut parser = SseDataParser::new();
    let mut reply = String::new();

    'stream: loop {
        let chunk: Bytes = tokio::select! {
            () = cancel.cancelled() => break 'stream,
            chunk = stream.next() => match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(BridgeError::Chat(format!("chat stream: {e}"))),
                None => break 'stream,
            },
        };
        for payload in parser.feed(&chunk) {
            if payload.trim() == DONE_SENTINEL {
                break 'stream;
            }
            let Some(delta) = content_delta(&payload)? else {
                continue;
            };
            // Re-check between payloads so a barge-in mid-chunk stops the
            // append immediately.
            if cancel.is_cancelled() {
                break 'stream;
            }
            reply.push_str(&delta);
            writer.append(&delta);
        }
    }

    if cancel.is_cancelled() {
        // Interrupted: parked text dies with the writer, and the caller
        // discards the partial reply.
        trace!("chat stream cancelled after {} chars", reply.chars().count());
        return Ok(reply);
    }

    if let Some(payload) = parser.finish()
        && payload.trim() != DONE_SENTINEL
        && let Some(delta) = content_delta(&payload)?
    {
        reply.push_str(&delta);
        writer.append(&delta);
    }
    writer.finish();
    debug!("chat stream complete: {} chars", reply.chars().count());
    Ok(reply)
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Pull the text delta out of one stream payload. Role-only and empty
/// deltas yield `Ok(None)`; a payload that does not parse kills the stream.
fn content_delta(payload: &str) -> Result<Option<String>> {
    let chunk: StreamChunk = serde_json::from_str(payload)
        .map_err(|e| BridgeError::Chat(format!("malformed stream payload: {e}")))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty()))
}

/// Human-readable detail from an error response body.
fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body)
        && let Some(message) = value.pointer("/error/message").and_then(Value::as_str)
    {
        return message.to_owned();
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no error detail".to_owned()
    } else {
        trimmed.chars().take(200).collect()
    }
}
