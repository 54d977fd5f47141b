use thiserror::Error;

/// Classified failure of a single chat turn.
///
/// None of these end the session. The chat loop turns each one into an
/// inline notice and waits for the next input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TurnError {
    /// The endpoint answered with HTTP 429.
    #[error("rate limit reached: {0}")]
    RateLimited(String),

    /// Any other failure reported by the provider or hit on the way to it.
    #[error("{0}")]
    Provider(String),

    /// Text that the display encoding cannot represent.
    #[error("character {ch:?} at byte {index} cannot be encoded as {encoding}")]
    Encoding {
        ch: char,
        index: usize,
        encoding: &'static str,
    },
}

pub type TurnResult<T> = std::result::Result<T, TurnError>;
