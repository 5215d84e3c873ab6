use thiserror::Error;

use crate::range::{Position, Range};

#[derive(Error, Debug, PartialEq, Clone)]
pub enum LexerError {
    #[error("Unexpected character at {0}")]
    UnexpectedToken(Position),
    #[error("Unterminated {kind} starting at {}", range.start)]
    Unterminated { kind: &'static str, range: Range },
}

impl LexerError {
    /// The source range for diagnostics. Unterminated tokens only
    /// record where they began; the end position stays `-1`.
    pub fn range(&self) -> Range {
        match self {
            LexerError::UnexpectedToken(position) => Range::begin_only(*position),
            LexerError::Unterminated { range, .. } => *range,
        }
    }
}
