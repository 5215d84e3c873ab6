use compact_str::CompactString;
use thiserror::Error;

use crate::model::AccessError;
use crate::range::Range;

#[derive(Error, Debug, PartialEq, Clone)]
pub enum RuntimeError {
    #[error("Division by zero")]
    ZeroDivision(Range),
    #[error("Cannot apply `{op}` to {left} and {right}")]
    InvalidTypes {
        op: &'static str,
        left: &'static str,
        right: &'static str,
        range: Range,
    },
    #[error("Expected {expected} but got {found}")]
    InvalidType {
        expected: &'static str,
        found: &'static str,
        range: Range,
    },
    #[error("Unknown function `{name}`")]
    UnknownFunction { name: CompactString, range: Range },
    #[error("Undefined variable `{name}`")]
    UndefinedVariable { name: CompactString, range: Range },
    #[error("Wrong number of arguments for `{name}`: expected {expected}, got {got}")]
    InvalidNumberOfArguments {
        name: CompactString,
        expected: String,
        got: usize,
        range: Range,
    },
    #[error("Lists must have the same length, got {left} and {right}")]
    UnequalListLengths {
        left: usize,
        right: usize,
        range: Range,
    },
    #[error("Expected a single element but got {got}")]
    NotSingleElement { got: usize, range: Range },
    #[error("Invalid regular expression `{pattern}`: {message}")]
    InvalidRegex {
        pattern: String,
        message: String,
        range: Range,
    },
    #[error("Invalid date: {message}")]
    InvalidDate { message: String, range: Range },
    #[error("Script URL rejected in rendered output")]
    UnsafeOutput(Range),
    #[error("Call stack depth limit exceeded")]
    StackOverflow(Range),
    #[error("{source}")]
    Access { source: AccessError, range: Range },
}

impl RuntimeError {
    pub fn range(&self) -> Range {
        match self {
            RuntimeError::ZeroDivision(range)
            | RuntimeError::UnsafeOutput(range)
            | RuntimeError::StackOverflow(range) => *range,
            RuntimeError::InvalidTypes { range, .. }
            | RuntimeError::InvalidType { range, .. }
            | RuntimeError::UnknownFunction { range, .. }
            | RuntimeError::UndefinedVariable { range, .. }
            | RuntimeError::InvalidNumberOfArguments { range, .. }
            | RuntimeError::UnequalListLengths { range, .. }
            | RuntimeError::NotSingleElement { range, .. }
            | RuntimeError::InvalidRegex { range, .. }
            | RuntimeError::InvalidDate { range, .. }
            | RuntimeError::Access { range, .. } => *range,
        }
    }

    pub fn access(source: AccessError, range: Range) -> Self {
        RuntimeError::Access { source, range }
    }
}
