use miette::{Diagnostic, SourceOffset, SourceSpan};

use crate::ast::error::ParseError;
use crate::compiler::CompileError;
use crate::eval::error::RuntimeError;
use crate::lexer::error::LexerError;
use crate::range::Range;
use crate::resolver::ResolveError;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum InnerError {
    #[error(transparent)]
    Lexer(#[from] LexerError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Eval(#[from] RuntimeError),
}

impl InnerError {
    fn range(&self) -> Range {
        match self {
            InnerError::Lexer(e) => e.range(),
            InnerError::Parse(e) => e.range(),
            InnerError::Resolve(e) => e.range(),
            InnerError::Compile(e) => e.range(),
            InnerError::Eval(e) => e.range(),
        }
    }
}

/// A failure from any engine phase, packaged with the source text and
/// a span for diagnostics.
#[derive(PartialEq, Debug, thiserror::Error)]
#[error("{cause}")]
pub struct Error {
    /// The underlying cause of the error.
    pub cause: InnerError,
    /// The source code related to the error.
    pub source_code: String,
    /// The location in the source code for diagnostics.
    pub location: SourceSpan,
}

impl Error {
    pub fn from_error(source_code: impl Into<String>, cause: InnerError) -> Self {
        let source_code = source_code.into();
        let range = cause.range();
        let location = span_for(&source_code, range);
        Self {
            cause,
            source_code,
            location,
        }
    }
}

fn span_for(source_code: &str, range: Range) -> SourceSpan {
    if range.start.is_unknown() {
        return SourceSpan::new(SourceOffset::from_location(source_code, 1, 1), 1);
    }
    let start = SourceOffset::from_location(
        source_code,
        range.start.line as usize,
        range.start.column as usize,
    );
    // Unterminated constructs record only where they begin.
    let len = if range.end.is_unknown() {
        1
    } else {
        SourceOffset::from_location(
            source_code,
            range.end.line as usize,
            range.end.column as usize,
        )
        .offset()
        .saturating_sub(start.offset())
        .max(1)
    };
    SourceSpan::new(start, len)
}

impl Diagnostic for Error {
    fn code<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        let c = match &self.cause {
            InnerError::Lexer(LexerError::UnexpectedToken(_)) => "LexerError::UnexpectedToken",
            InnerError::Lexer(LexerError::Unterminated { .. }) => "LexerError::Unterminated",
            InnerError::Parse(ParseError::UnexpectedToken { .. }) => "ParseError::UnexpectedToken",
            InnerError::Parse(ParseError::ExpectedToken { .. }) => "ParseError::ExpectedToken",
            InnerError::Parse(ParseError::Lexer(_)) => "ParseError::Lexer",
            InnerError::Resolve(ResolveError::ModelNotFound { .. }) => {
                "ResolveError::ModelNotFound"
            }
            InnerError::Resolve(ResolveError::InvalidRegex { .. }) => "ResolveError::InvalidRegex",
            InnerError::Compile(CompileError::Folding(_)) => "CompileError::Folding",
            InnerError::Eval(e) => match e {
                RuntimeError::ZeroDivision(_) => "RuntimeError::ZeroDivision",
                RuntimeError::InvalidTypes { .. } => "RuntimeError::InvalidTypes",
                RuntimeError::InvalidType { .. } => "RuntimeError::InvalidType",
                RuntimeError::UnknownFunction { .. } => "RuntimeError::UnknownFunction",
                RuntimeError::UndefinedVariable { .. } => "RuntimeError::UndefinedVariable",
                RuntimeError::InvalidNumberOfArguments { .. } => {
                    "RuntimeError::InvalidNumberOfArguments"
                }
                RuntimeError::UnequalListLengths { .. } => "RuntimeError::UnequalListLengths",
                RuntimeError::NotSingleElement { .. } => "RuntimeError::NotSingleElement",
                RuntimeError::InvalidRegex { .. } => "RuntimeError::InvalidRegex",
                RuntimeError::InvalidDate { .. } => "RuntimeError::InvalidDate",
                RuntimeError::UnsafeOutput(_) => "RuntimeError::UnsafeOutput",
                RuntimeError::StackOverflow(_) => "RuntimeError::StackOverflow",
                RuntimeError::Access { .. } => "RuntimeError::Access",
            },
        };
        Some(Box::new(c))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        let msg = match &self.cause {
            InnerError::Lexer(LexerError::UnexpectedToken(_)) => {
                Some("Check for unexpected or misplaced tokens in your input.".to_string())
            }
            InnerError::Lexer(LexerError::Unterminated { kind, .. }) => Some(format!(
                "The {kind} that starts here is never closed. Add the missing terminator."
            )),
            InnerError::Parse(ParseError::ExpectedToken { expected, .. }) => {
                Some(format!("Expected {expected} here."))
            }
            InnerError::Resolve(ResolveError::ModelNotFound { name, .. }) => Some(format!(
                "No model element named `{name}` exists. Check the qualified name."
            )),
            InnerError::Eval(RuntimeError::ZeroDivision(_)) => {
                Some("Division by zero is not allowed.".to_string())
            }
            InnerError::Eval(RuntimeError::InvalidTypes { .. })
            | InnerError::Eval(RuntimeError::InvalidType { .. }) => {
                Some("Type mismatch. Check the types of your operands.".to_string())
            }
            InnerError::Eval(RuntimeError::UndefinedVariable { .. }) => {
                Some("This name is not bound here. Did you misspell a binding?".to_string())
            }
            InnerError::Eval(RuntimeError::UnequalListLengths { .. }) => Some(
                "Element-wise operations require lists of the same length.".to_string(),
            ),
            InnerError::Eval(RuntimeError::UnsafeOutput(_)) => Some(
                "Rendered output would contain a javascript: URL in an attribute.".to_string(),
            ),
            InnerError::Eval(RuntimeError::StackOverflow(_)) => {
                Some("The call stack limit was reached. Check for unbounded recursion.".to_string())
            }
            _ => None,
        };
        msg.map(|m| Box::new(m) as Box<dyn std::fmt::Display>)
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = miette::LabeledSpan> + '_>> {
        Some(Box::new(std::iter::once(
            miette::LabeledSpan::new_with_span(Some(format!("{}", self.cause)), self.location),
        )))
    }

    fn source_code(&self) -> Option<&dyn miette::SourceCode> {
        Some(&self.source_code)
    }
}
