use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("lexical error: {0}")]
    Lexical(String),

    #[error("grammar error: {0}")]
    Grammar(String),

    #[error("context error: {0}")]
    Context(String),

    #[error("type error in {location}: found {found}, expected {expected}")]
    Type {
        location: String,
        found: String,
        expected: String,
    },

    #[error("code array capacity of {capacity} instructions exceeded")]
    Capacity { capacity: usize },

    #[error("internal error: {0}")]
    Internal(String),
}

impl CompileError {
    pub fn context(msg: impl Into<String>) -> Self {
        CompileError::Context(msg.into())
    }

    pub fn type_mismatch(
        location: impl Into<String>,
        found: impl ToString,
        expected: impl ToString,
    ) -> Self {
        CompileError::Type {
            location: location.into(),
            found: found.to_string(),
            expected: expected.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;
