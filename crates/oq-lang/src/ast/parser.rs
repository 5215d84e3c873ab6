use compact_str::CompactString;

use crate::lexer::token::{TemplateSegment, Token, TokenKind};
use crate::lexer::tokenize;
use crate::range::{Position, Range};

use super::error::ParseError;
use super::node::{BinaryOp, Expr, Node, TemplatePart, UnaryOp};

/// Parses a complete script into its expression tree.
pub fn parse(input: &str) -> Result<Node, ParseError> {
    let tokens = tokenize(input).map_err(ParseError::Lexer)?;
    Parser::new(&tokens).parse_program()
}

/// Recursive-descent parser over the token stream. Precedence, low to
/// high: `?:`, `||`/`or`, `&&`/`and`, equality, comparison, additive,
/// multiplicative, unary, postfix.
pub struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
}

impl<'t> Parser<'t> {
    /// The token stream must end with an `Eof` token, as produced by
    /// [`tokenize`].
    pub fn new(tokens: &'t [Token]) -> Self {
        debug_assert!(matches!(tokens.last().map(|t| &t.kind), Some(TokenKind::Eof)));
        Parser { tokens, pos: 0 }
    }

    pub fn parse_program(mut self) -> Result<Node, ParseError> {
        let node = self.expression()?;
        match self.peek().kind {
            TokenKind::Eof => Ok(node),
            _ => Err(self.unexpected()),
        }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_kind_at(&self, offset: usize) -> &TokenKind {
        let i = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[i].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> Option<Range> {
        if &self.peek().kind == kind {
            Some(self.advance().range)
        } else {
            None
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<Range, ParseError> {
        self.eat(kind).ok_or_else(|| ParseError::ExpectedToken {
            expected: kind.name(),
            found: self.peek().kind.name(),
            range: self.peek().range,
        })
    }

    fn unexpected(&self) -> ParseError {
        ParseError::UnexpectedToken {
            found: self.peek().kind.name(),
            range: self.peek().range,
        }
    }

    fn expect_ident(&mut self) -> Result<(CompactString, Range), ParseError> {
        match &self.peek().kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                let range = self.advance().range;
                Ok((name, range))
            }
            _ => Err(ParseError::ExpectedToken {
                expected: "identifier",
                found: self.peek().kind.name(),
                range: self.peek().range,
            }),
        }
    }

    fn expression(&mut self) -> Result<Node, ParseError> {
        self.ternary()
    }

    fn ternary(&mut self) -> Result<Node, ParseError> {
        let cond = self.or_expr()?;
        if self.eat(&TokenKind::Question).is_some() {
            let then = self.expression()?;
            self.expect(&TokenKind::Colon)?;
            let els = self.expression()?;
            let range = cond.range.merge(&els.range);
            Ok(Node::new(range, Expr::If(cond, then, els)))
        } else {
            Ok(cond)
        }
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> Result<Node, ParseError>,
        ops: &[(TokenKind, BinaryOp)],
    ) -> Result<Node, ParseError> {
        let mut left = next(self)?;
        'outer: loop {
            for (kind, op) in ops {
                if self.eat(kind).is_some() {
                    let right = next(self)?;
                    let range = left.range.merge(&right.range);
                    left = Node::new(range, Expr::Binary(*op, left, right));
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn or_expr(&mut self) -> Result<Node, ParseError> {
        self.binary_level(
            Self::and_expr,
            &[
                (TokenKind::OrOr, BinaryOp::Or),
                (TokenKind::Or, BinaryOp::Or),
            ],
        )
    }

    fn and_expr(&mut self) -> Result<Node, ParseError> {
        self.binary_level(
            Self::equality,
            &[
                (TokenKind::AndAnd, BinaryOp::And),
                (TokenKind::And, BinaryOp::And),
            ],
        )
    }

    fn equality(&mut self) -> Result<Node, ParseError> {
        self.binary_level(
            Self::comparison,
            &[
                (TokenKind::EqEq, BinaryOp::Eq),
                (TokenKind::NotEq, BinaryOp::NotEq),
            ],
        )
    }

    fn comparison(&mut self) -> Result<Node, ParseError> {
        self.binary_level(
            Self::additive,
            &[
                (TokenKind::Le, BinaryOp::Le),
                (TokenKind::Ge, BinaryOp::Ge),
                (TokenKind::Lt, BinaryOp::Lt),
                (TokenKind::Gt, BinaryOp::Gt),
            ],
        )
    }

    fn additive(&mut self) -> Result<Node, ParseError> {
        self.binary_level(
            Self::multiplicative,
            &[
                (TokenKind::Plus, BinaryOp::Add),
                (TokenKind::Minus, BinaryOp::Sub),
            ],
        )
    }

    fn multiplicative(&mut self) -> Result<Node, ParseError> {
        self.binary_level(
            Self::unary,
            &[
                (TokenKind::Star, BinaryOp::Mul),
                (TokenKind::Slash, BinaryOp::Div),
                (TokenKind::Percent, BinaryOp::Mod),
            ],
        )
    }

    fn unary(&mut self) -> Result<Node, ParseError> {
        if let Some(range) = self.eat(&TokenKind::Not) {
            let operand = self.unary()?;
            let range = range.merge(&operand.range);
            Ok(Node::new(range, Expr::Unary(UnaryOp::Not, operand)))
        } else if let Some(range) = self.eat(&TokenKind::Minus) {
            let operand = self.unary()?;
            let range = range.merge(&operand.range);
            Ok(Node::new(range, Expr::Unary(UnaryOp::Neg, operand)))
        } else {
            self.postfix()
        }
    }

    fn postfix(&mut self) -> Result<Node, ParseError> {
        let mut node = self.primary()?;
        loop {
            if self.eat(&TokenKind::Dot).is_some() {
                let (name, name_range) = self.expect_ident()?;
                if self.peek().kind == TokenKind::LParen {
                    let (args, end) = self.call_args()?;
                    node = self.method_call(node, name, name_range, args, end)?;
                } else {
                    // `.name` is attribute access, sugar for get().
                    let range = node.range.merge(&name_range);
                    let key = Node::new(name_range, Expr::String(name.to_string()));
                    node = Node::new(
                        range,
                        Expr::Call(
                            Node::new(name_range, Expr::Var(CompactString::const_new("get"))),
                            vec![node, key],
                        ),
                    );
                }
            } else if let Some(start) = self.eat(&TokenKind::LBracket) {
                let index = self.expression()?;
                let end = self.expect(&TokenKind::RBracket)?;
                let range = node.range.merge(&end);
                node = Node::new(
                    range,
                    Expr::Call(
                        Node::new(start, Expr::Var(CompactString::const_new("get"))),
                        vec![node, index],
                    ),
                );
            } else if self.peek().kind == TokenKind::LParen {
                let (args, end) = self.call_args()?;
                node = Self::apply_call(node, args, end);
            } else {
                return Ok(node);
            }
        }
    }

    /// Parses `( expr, ... )`, returning the arguments and the range
    /// of the closing parenthesis.
    fn call_args(&mut self) -> Result<(Vec<Node>, Range), ParseError> {
        self.expect(&TokenKind::LParen)?;
        let mut args = Vec::new();
        if let Some(end) = self.eat(&TokenKind::RParen) {
            return Ok((args, end));
        }
        loop {
            args.push(self.expression()?);
            if self.eat(&TokenKind::Comma).is_none() {
                let end = self.expect(&TokenKind::RParen)?;
                return Ok((args, end));
            }
            if let Some(end) = self.eat(&TokenKind::RParen) {
                return Ok((args, end));
            }
        }
    }

    /// Desugars `recv.name(args)`. Most methods become a call with the
    /// receiver prepended; `recursion` and `apply` are structural.
    fn method_call(
        &mut self,
        recv: Node,
        name: CompactString,
        name_range: Range,
        mut args: Vec<Node>,
        end: Range,
    ) -> Result<Node, ParseError> {
        let range = recv.range.merge(&end);
        match name.as_str() {
            "recursion" if args.len() == 1 || args.len() == 3 => {
                let step = args.remove(0);
                let bounds = if args.is_empty() {
                    None
                } else {
                    let from = args.remove(0);
                    let to = args.remove(0);
                    Some((from, to))
                };
                Ok(Node::new(
                    range,
                    Expr::Recursion {
                        seed: recv,
                        step,
                        bounds,
                    },
                ))
            }
            "apply" => Ok(Node::new(range, Expr::Call(recv, args))),
            _ => {
                let mut call_args = Vec::with_capacity(args.len() + 1);
                call_args.push(recv);
                call_args.append(&mut args);
                Ok(Node::new(
                    range,
                    Expr::Call(Node::new(name_range, Expr::Var(name)), call_args),
                ))
            }
        }
    }

    /// Applies `( args )` to a parsed callee, recognizing the special
    /// forms `regex('literal')` and `recursion(seed, step[, from, to])`.
    fn apply_call(callee: Node, mut args: Vec<Node>, end: Range) -> Node {
        let range = callee.range.merge(&end);
        if let Expr::Var(name) = &*callee.expr {
            match name.as_str() {
                "regex" if args.len() == 1 => {
                    if let Expr::String(pattern) = &*args[0].expr {
                        return Node::new(range, Expr::RegexLiteral(pattern.clone()));
                    }
                }
                "recursion" if args.len() == 2 || args.len() == 4 => {
                    let seed = args.remove(0);
                    let step = args.remove(0);
                    let bounds = if args.is_empty() {
                        None
                    } else {
                        let from = args.remove(0);
                        let to = args.remove(0);
                        Some((from, to))
                    };
                    return Node::new(range, Expr::Recursion { seed, step, bounds });
                }
                _ => {}
            }
        }
        Node::new(range, Expr::Call(callee, args))
    }

    fn primary(&mut self) -> Result<Node, ParseError> {
        match self.peek().kind.clone() {
            TokenKind::NumberLiteral(n) => {
                let range = self.advance().range;
                Ok(Node::new(range, Expr::Number(n)))
            }
            TokenKind::StringLiteral(s) => {
                let range = self.advance().range;
                Ok(Node::new(range, Expr::String(s)))
            }
            TokenKind::BoolLiteral(b) => {
                let range = self.advance().range;
                Ok(Node::new(range, Expr::Bool(b)))
            }
            TokenKind::NullLiteral => {
                let range = self.advance().range;
                Ok(Node::new(range, Expr::Null))
            }
            TokenKind::ModelLiteral(name) => {
                let range = self.advance().range;
                Ok(Node::new(range, Expr::ModelLiteral(name)))
            }
            TokenKind::Template(segments) => {
                let range = self.advance().range;
                let parts = Self::template_parts(&segments)?;
                Ok(Node::new(range, Expr::Template(parts)))
            }
            TokenKind::Ident(name) => {
                let range = self.advance().range;
                if self.eat(&TokenKind::Arrow).is_some() {
                    let body = self.expression()?;
                    let merged = range.merge(&body.range);
                    Ok(Node::new(merged, Expr::Lambda(name, body)))
                } else {
                    Ok(Node::new(range, Expr::Var(name)))
                }
            }
            TokenKind::Switch => self.switch_expr(),
            TokenKind::LParen => {
                let start = self.advance().range;
                let inner = self.expression()?;
                let end = self.expect(&TokenKind::RParen)?;
                Ok(Node {
                    range: start.merge(&end),
                    expr: inner.expr,
                })
            }
            TokenKind::LBracket => {
                let start = self.advance().range;
                let mut elems = Vec::new();
                if let Some(end) = self.eat(&TokenKind::RBracket) {
                    return Ok(Node::new(start.merge(&end), Expr::List(elems)));
                }
                loop {
                    elems.push(self.expression()?);
                    if self.eat(&TokenKind::Comma).is_none() {
                        let end = self.expect(&TokenKind::RBracket)?;
                        return Ok(Node::new(start.merge(&end), Expr::List(elems)));
                    }
                    if let Some(end) = self.eat(&TokenKind::RBracket) {
                        return Ok(Node::new(start.merge(&end), Expr::List(elems)));
                    }
                }
            }
            TokenKind::LBrace => self.block_or_map(),
            _ => Err(self.unexpected()),
        }
    }

    /// `{ ... }` is a block when it opens with `name =` bindings and a
    /// struct literal when the first expression is followed by `:`.
    /// `{}` is the empty struct.
    fn block_or_map(&mut self) -> Result<Node, ParseError> {
        let start = self.expect(&TokenKind::LBrace)?;
        if let Some(end) = self.eat(&TokenKind::RBrace) {
            return Ok(Node::new(start.merge(&end), Expr::Map(Vec::new())));
        }

        let mut bindings = Vec::new();
        while matches!(self.peek().kind, TokenKind::Ident(_))
            && *self.peek_kind_at(1) == TokenKind::Equal
        {
            let (name, _) = self.expect_ident()?;
            self.expect(&TokenKind::Equal)?;
            let value = self.expression()?;
            self.expect(&TokenKind::SemiColon)?;
            bindings.push((name, value));
        }

        let first = self.expression()?;

        if bindings.is_empty() && self.peek().kind == TokenKind::Colon {
            self.advance();
            let value = self.expression()?;
            let mut pairs = vec![(first, value)];
            while self.eat(&TokenKind::Comma).is_some() {
                if self.peek().kind == TokenKind::RBrace {
                    break;
                }
                let key = self.expression()?;
                self.expect(&TokenKind::Colon)?;
                let value = self.expression()?;
                pairs.push((key, value));
            }
            let end = self.expect(&TokenKind::RBrace)?;
            return Ok(Node::new(start.merge(&end), Expr::Map(pairs)));
        }

        self.eat(&TokenKind::SemiColon);
        let end = self.expect(&TokenKind::RBrace)?;
        Ok(Node::new(start.merge(&end), Expr::Block(bindings, first)))
    }

    /// Both switch forms: `switch { cond: val; ... }` and
    /// `switch (selector) { case: val; ... }`, each with an optional
    /// `default: val`.
    fn switch_expr(&mut self) -> Result<Node, ParseError> {
        let start = self.expect(&TokenKind::Switch)?;
        let selector = if self.eat(&TokenKind::LParen).is_some() {
            let selector = self.expression()?;
            self.expect(&TokenKind::RParen)?;
            Some(selector)
        } else {
            None
        };
        self.expect(&TokenKind::LBrace)?;

        let mut cases = Vec::new();
        let mut default = None;
        loop {
            if let Some(end) = self.eat(&TokenKind::RBrace) {
                return Ok(Node::new(
                    start.merge(&end),
                    Expr::Switch {
                        selector,
                        cases,
                        default,
                    },
                ));
            }
            if self.eat(&TokenKind::Default).is_some() {
                self.expect(&TokenKind::Colon)?;
                default = Some(self.expression()?);
            } else {
                let case = self.expression()?;
                self.expect(&TokenKind::Colon)?;
                let value = self.expression()?;
                cases.push((case, value));
            }
            if self.eat(&TokenKind::SemiColon).is_none() {
                let end = self.expect(&TokenKind::RBrace)?;
                return Ok(Node::new(
                    start.merge(&end),
                    Expr::Switch {
                        selector,
                        cases,
                        default,
                    },
                ));
            }
        }
    }

    /// Re-parses the expression segments captured inside a template.
    /// Token ranges are shifted so diagnostics point into the original
    /// script rather than the extracted fragment.
    fn template_parts(segments: &[TemplateSegment]) -> Result<Vec<TemplatePart>, ParseError> {
        segments
            .iter()
            .map(|segment| match segment {
                TemplateSegment::Text(text, _) => Ok(TemplatePart::Text(text.clone())),
                TemplateSegment::Expr(src, range) => {
                    let base = range.start;
                    let tokens = tokenize(src)
                        .map_err(|e| ParseError::Lexer(shift_lexer_error(e, base)))?;
                    let shifted: Vec<Token> = tokens
                        .into_iter()
                        .map(|t| Token {
                            range: shift_range(t.range, base),
                            kind: t.kind,
                        })
                        .collect();
                    let node = Parser::new(&shifted).parse_program()?;
                    Ok(TemplatePart::Expr(node))
                }
            })
            .collect()
    }
}

fn shift_position(p: Position, base: Position) -> Position {
    if p.is_unknown() {
        p
    } else if p.line == 1 {
        Position::new(base.line, base.column + p.column - 1)
    } else {
        Position::new(base.line + p.line - 1, p.column)
    }
}

fn shift_range(range: Range, base: Position) -> Range {
    Range {
        start: shift_position(range.start, base),
        end: shift_position(range.end, base),
    }
}

fn shift_lexer_error(
    error: crate::lexer::error::LexerError,
    base: Position,
) -> crate::lexer::error::LexerError {
    use crate::lexer::error::LexerError;
    match error {
        LexerError::UnexpectedToken(p) => LexerError::UnexpectedToken(shift_position(p, base)),
        LexerError::Unterminated { kind, range } => LexerError::Unterminated {
            kind,
            range: shift_range(range, base),
        },
    }
}
