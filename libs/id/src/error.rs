use thiserror::Error;

/// Reasons an id string can be rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("id cannot be empty")]
    Empty,

    #[error("id missing '_' separator")]
    MissingSeparator,

    #[error("wrong id prefix: expected '{expected}', got '{actual}'")]
    WrongPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("malformed ulid: {0}")]
    MalformedUlid(String),
}

impl IdError {
    /// True when the id belongs to a different resource type.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::WrongPrefix { .. })
    }
}
