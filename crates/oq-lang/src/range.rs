use nom_locate::LocatedSpan;
#[cfg(feature = "ast-json")]
use serde::{Deserialize, Serialize};

pub type Span<'a> = LocatedSpan<&'a str>;

/// A 1-based line/column position in the source text.
///
/// Tokenizer-level failures (unterminated string, comment or template)
/// only know where the offending token began; such errors carry
/// [`Position::UNKNOWN`] as their end, which renders as `-1`.
#[cfg_attr(feature = "ast-json", derive(Serialize, Deserialize))]
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Hash)]
pub struct Position {
    pub line: i64,
    pub column: i64,
}

impl Default for Position {
    fn default() -> Self {
        Position { line: 1, column: 1 }
    }
}

impl Position {
    pub const UNKNOWN: Position = Position {
        line: -1,
        column: -1,
    };

    pub fn new(line: i64, column: i64) -> Self {
        Position { line, column }
    }

    pub fn is_unknown(&self) -> bool {
        self.line < 0
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[cfg_attr(feature = "ast-json", derive(Serialize, Deserialize))]
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Default, Hash)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start: Position, end: Position) -> Self {
        Range { start, end }
    }

    /// A range that only records where the token began.
    pub fn begin_only(start: Position) -> Self {
        Range {
            start,
            end: Position::UNKNOWN,
        }
    }

    /// The smallest range covering both `self` and `other`.
    pub fn merge(&self, other: &Range) -> Range {
        Range {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

impl<'a> From<Span<'a>> for Position {
    fn from(span: Span<'a>) -> Self {
        Position {
            line: span.location_line() as i64,
            column: span.get_utf8_column() as i64,
        }
    }
}

impl<'a> From<Span<'a>> for Range {
    fn from(span: Span<'a>) -> Self {
        let start = Position {
            line: span.location_line() as i64,
            column: span.get_utf8_column() as i64,
        };
        Range {
            start,
            end: Position {
                line: start.line,
                column: start.column + span.fragment().chars().count() as i64,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_only_has_unknown_end() {
        let range = Range::begin_only(Position::new(3, 7));
        assert_eq!(range.start, Position::new(3, 7));
        assert!(range.end.is_unknown());
        assert_eq!(range.end.line, -1);
        assert_eq!(range.end.column, -1);
    }

    #[test]
    fn test_merge() {
        let a = Range::new(Position::new(1, 5), Position::new(1, 9));
        let b = Range::new(Position::new(1, 2), Position::new(2, 1));
        let merged = a.merge(&b);
        assert_eq!(merged.start, Position::new(1, 2));
        assert_eq!(merged.end, Position::new(2, 1));
    }
}
