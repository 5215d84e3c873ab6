use compact_str::CompactString;

use crate::number::Number;
use crate::range::Range;

/// One segment of a `{{{ ... }}}` template literal.
///
/// Expression segments hold the raw source of the embedded `{expr}`
/// span; the parser re-parses them with the recorded range offset so
/// diagnostics still point into the original script.
#[derive(Debug, PartialEq, Clone)]
pub enum TemplateSegment {
    Text(String, Range),
    Expr(String, Range),
}

#[derive(Debug, PartialEq, Clone)]
pub enum TokenKind {
    NumberLiteral(Number),
    StringLiteral(String),
    BoolLiteral(bool),
    NullLiteral,
    /// Backtick-quoted qualified name, e.g. `` `Module:Type#Part` ``.
    ModelLiteral(CompactString),
    Ident(CompactString),
    Template(Vec<TemplateSegment>),
    Comma,
    Colon,
    SemiColon,
    Question,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Arrow,
    Equal,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Not,
    AndAnd,
    OrOr,
    Dot,
    Switch,
    Default,
    And,
    Or,
    Eof,
}

impl TokenKind {
    pub fn name(&self) -> &'static str {
        match self {
            TokenKind::NumberLiteral(_) => "number",
            TokenKind::StringLiteral(_) => "string",
            TokenKind::BoolLiteral(_) => "boolean",
            TokenKind::NullLiteral => "null",
            TokenKind::ModelLiteral(_) => "model literal",
            TokenKind::Ident(_) => "identifier",
            TokenKind::Template(_) => "template",
            TokenKind::Comma => "','",
            TokenKind::Colon => "':'",
            TokenKind::SemiColon => "';'",
            TokenKind::Question => "'?'",
            TokenKind::LParen => "'('",
            TokenKind::RParen => "')'",
            TokenKind::LBracket => "'['",
            TokenKind::RBracket => "']'",
            TokenKind::LBrace => "'{'",
            TokenKind::RBrace => "'}'",
            TokenKind::Arrow => "'->'",
            TokenKind::Equal => "'='",
            TokenKind::EqEq => "'=='",
            TokenKind::NotEq => "'!='",
            TokenKind::Lt => "'<'",
            TokenKind::Le => "'<='",
            TokenKind::Gt => "'>'",
            TokenKind::Ge => "'>='",
            TokenKind::Plus => "'+'",
            TokenKind::Minus => "'-'",
            TokenKind::Star => "'*'",
            TokenKind::Slash => "'/'",
            TokenKind::Percent => "'%'",
            TokenKind::Not => "'!'",
            TokenKind::AndAnd => "'&&'",
            TokenKind::OrOr => "'||'",
            TokenKind::Dot => "'.'",
            TokenKind::Switch => "'switch'",
            TokenKind::Default => "'default'",
            TokenKind::And => "'and'",
            TokenKind::Or => "'or'",
            TokenKind::Eof => "end of input",
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct Token {
    pub range: Range,
    pub kind: TokenKind,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind.name())
    }
}
