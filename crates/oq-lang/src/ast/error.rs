use thiserror::Error;

use crate::lexer::error::LexerError;
use crate::range::Range;

#[derive(Error, Debug, PartialEq, Clone)]
pub enum ParseError {
    #[error("Unexpected {found}")]
    UnexpectedToken { found: &'static str, range: Range },
    #[error("Expected {expected} but found {found}")]
    ExpectedToken {
        expected: &'static str,
        found: &'static str,
        range: Range,
    },
    #[error(transparent)]
    Lexer(LexerError),
}

impl ParseError {
    pub fn range(&self) -> Range {
        match self {
            ParseError::UnexpectedToken { range, .. } => *range,
            ParseError::ExpectedToken { range, .. } => *range,
            ParseError::Lexer(e) => e.range(),
        }
    }
}
