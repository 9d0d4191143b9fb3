use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum EventError {
    #[error("expected event type {expected}, got {actual}")]
    WrongType {
        expected: &'static str,
        actual: String,
    },

    #[error("invalid event payload: {0}")]
    InvalidPayload(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::InvalidPayload(err.to_string())
    }
}
