use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::cli::chat::conversation_state::Message;
use crate::error::TurnResult;

/// Lazily produced response text. Finite, and read exactly once.
pub type ChunkStream = Pin<Box<dyn Stream<Item = TurnResult<String>> + Send>>;

/// API key for the completion endpoint. Lives in memory only; `Debug` never
/// prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Returns `None` for blank input so an empty key can never be stored.
    pub fn new(key: impl Into<String>) -> Option<Self> {
        let key = key.into().trim().to_string();
        if key.is_empty() {
            None
        } else {
            Some(Self(key))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(****)")
    }
}

/// Something that turns a conversation into a stream of response chunks.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Sends the whole `history` and returns the response as it arrives.
    ///
    /// Errors before the first byte (bad status, connection failure) come back
    /// as `Err`; failures after that arrive as an `Err` item in the stream.
    async fn send(&self, history: &[Message], credential: &Credential) -> TurnResult<ChunkStream>;
}
