use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CollectorError {
    /// Every fetch slot is taken. The request was dropped, not queued.
    #[error("collector is at capacity")]
    AtCapacity,

    #[error("collector is stopped")]
    Stopped,
}
