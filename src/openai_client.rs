use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Result, eyre};
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::cli::chat::conversation_state::Message;
use crate::completion::{ChunkStream, CompletionBackend, Credential};
use crate::config::ChatConfig;
use crate::error::{TurnError, TurnResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChunkEvent {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// Streaming client for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: Url,
    model: String,
}

impl OpenAiClient {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

        Ok(Self::with_http(http, config.endpoint()?, &config.model))
    }

    pub fn with_http(http: reqwest::Client, endpoint: Url, model: &str) -> Self {
        Self {
            http,
            endpoint,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAiClient {
    async fn send(&self, history: &[Message], credential: &Credential) -> TurnResult<ChunkStream> {
        let request = ChatRequest {
            model: &self.model,
            messages: history,
            stream: true,
        };

        debug!(
            "Sending {} messages to {} (model {})",
            history.len(),
            self.endpoint,
            self.model
        );

        let response = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(credential.expose())
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Completion request failed with status {}", status);
            debug!("Error body: {}", body);
            return Err(classify_status(status, &body));
        }

        debug!("Response stream opened with status {}", status);
        Ok(chunk_stream(Box::pin(
            response.bytes_stream().map_err(transport_error),
        )))
    }
}

fn transport_error(err: reqwest::Error) -> TurnError {
    if err.is_timeout() {
        TurnError::Provider("request timed out".to_string())
    } else {
        TurnError::Provider(format!("request failed: {}", err))
    }
}

/// Maps a non-success HTTP response onto the turn error taxonomy. Only 429 is
/// treated as throttling; the provider's own message is used as detail when
/// the body carries one.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> TurnError {
    let detail = serde_json::from_str::<ApiErrorEnvelope>(body)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| body.trim().to_string());

    if status == StatusCode::TOO_MANY_REQUESTS {
        return TurnError::RateLimited(detail);
    }

    if detail.is_empty() {
        TurnError::Provider(status.to_string())
    } else {
        TurnError::Provider(format!("{}: {}", status, detail))
    }
}

/// Splits a byte stream into complete lines. Bytes are held back until the
/// terminating newline arrives, so multi-byte characters split across network
/// reads are decoded intact.
#[derive(Debug, Default)]
pub(crate) struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            lines.push(decode_line(&line[..pos]));
        }
        lines
    }

    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(e) => {
            warn!("Invalid UTF-8 in response stream ({}), decoding lossily", e);
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

/// Payload of a server-sent `data:` line; other fields and comments yield `None`.
fn sse_data(line: &str) -> Option<&str> {
    let value = line.strip_prefix("data:")?;
    Some(value.strip_prefix(' ').unwrap_or(value))
}

struct StreamState<S> {
    body: S,
    decoder: LineDecoder,
    pending: VecDeque<TurnResult<String>>,
    finished: bool,
}

impl<S, B> StreamState<S>
where
    S: Stream<Item = TurnResult<B>> + Unpin,
    B: AsRef<[u8]>,
{
    async fn next_chunk(&mut self) -> Option<TurnResult<String>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if self.finished {
                return None;
            }

            match self.body.next().await {
                Some(Ok(bytes)) => {
                    for line in self.decoder.feed(bytes.as_ref()) {
                        self.handle_line(&line);
                        if self.finished {
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    self.fail(e);
                }
                None => {
                    if let Some(line) = self.decoder.finish() {
                        self.handle_line(&line);
                    }
                    if !self.finished {
                        self.fail(TurnError::Provider(
                            "response stream closed before completion".to_string(),
                        ));
                    }
                }
            }
        }
    }

    fn handle_line(&mut self, line: &str) {
        let Some(data) = sse_data(line) else {
            return;
        };

        if data.trim() == DONE_SENTINEL {
            debug!("Response stream finished");
            self.finished = true;
            return;
        }

        let event: ChunkEvent = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(e) => {
                self.fail(TurnError::Provider(format!(
                    "unreadable stream event: {}",
                    e
                )));
                return;
            }
        };

        if let Some(error) = event.error {
            self.fail(TurnError::Provider(error.message));
            return;
        }

        for choice in event.choices {
            if let Some(reason) = choice.finish_reason {
                debug!("Finish reason: {}", reason);
            }
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                self.pending.push_back(Ok(content));
            }
        }
    }

    fn fail(&mut self, error: TurnError) {
        warn!("Response stream failed: {}", error);
        self.pending.push_back(Err(error));
        self.finished = true;
    }
}

/// Turns a raw server-sent-events body into a stream of content chunks.
///
/// The stream ends after `[DONE]` or after its first error; a body that ends
/// without `[DONE]` produces a final error so a truncated reply is never taken
/// for a complete one.
pub(crate) fn chunk_stream<S, B>(body: S) -> ChunkStream
where
    S: Stream<Item = TurnResult<B>> + Unpin + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = StreamState {
        body,
        decoder: LineDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        let item = state.next_chunk().await?;
        Some((item, state))
    }))
}
