pub mod error;
pub mod token;

use compact_str::CompactString;
use error::LexerError;
use nom::Parser;
use nom::bytes::complete::{is_not, tag, take, take_until, take_while_m_n};
use nom::character::complete::{alpha1, alphanumeric1, char, digit1, multispace1, one_of};
use nom::combinator::{map, map_opt, map_res, opt, recognize, value};
use nom::multi::{many0, many0_count};
use nom::sequence::{delimited, pair, preceded};
use nom::{IResult, branch::alt};
use nom_locate::position;
use token::{TemplateSegment, Token, TokenKind};

use crate::number::Number;
use crate::range::{Position, Range, Span};

macro_rules! define_token_parser {
    ($name:ident, $tag:expr, $kind:expr) => {
        fn $name(input: Span) -> IResult<Span, Token> {
            map(tag($tag), |span: Span| Token {
                range: span.into(),
                kind: $kind,
            })
            .parse(input)
        }
    };
}

/// Tokenizes a script. The returned stream always ends with an `Eof`
/// token carrying the position just past the last input character.
pub fn tokenize(input: &str) -> Result<Vec<Token>, LexerError> {
    let span = Span::new(input);
    match tokens(span) {
        Ok((rest, mut tokens)) => {
            if rest.fragment().is_empty() {
                let eof: Range = rest.into();
                tokens.push(Token {
                    range: eof,
                    kind: TokenKind::Eof,
                });
                Ok(tokens)
            } else {
                Err(classify_remainder(rest))
            }
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(classify_remainder(e.input)),
        Err(nom::Err::Incomplete(_)) => unreachable!(),
    }
}

/// Maps leftover input after the token loop stopped to the lexer error
/// it represents. Unterminated tokens know only their begin position.
fn classify_remainder(rest: Span) -> LexerError {
    let start: Position = rest.into();
    let fragment = rest.fragment();

    if fragment.starts_with("{{{") {
        LexerError::Unterminated {
            kind: "template",
            range: Range::begin_only(start),
        }
    } else if fragment.starts_with("/*") {
        LexerError::Unterminated {
            kind: "block comment",
            range: Range::begin_only(start),
        }
    } else if fragment.starts_with('\'') || fragment.starts_with('"') {
        LexerError::Unterminated {
            kind: "string literal",
            range: Range::begin_only(start),
        }
    } else if fragment.starts_with('`') {
        LexerError::Unterminated {
            kind: "model literal",
            range: Range::begin_only(start),
        }
    } else {
        LexerError::UnexpectedToken(start)
    }
}

fn tokens(input: Span) -> IResult<Span, Vec<Token>> {
    let (rest, tokens) = many0(preceded(trivia0, token)).parse(input)?;
    let (rest, _) = trivia0(rest)?;
    Ok((rest, tokens))
}

fn token(input: Span) -> IResult<Span, Token> {
    alt((
        template,
        number_literal,
        string_literal,
        model_literal,
        operators,
        punctuations,
        ident,
    ))
    .parse(input)
}

fn line_comment(input: Span) -> IResult<Span, ()> {
    value((), pair(tag("//"), opt(is_not("\r\n")))).parse(input)
}

// An opening `/*` with no terminator is a hard failure so the token
// loop cannot fall back to lexing `/` and `*` as operators.
fn block_comment(input: Span) -> IResult<Span, ()> {
    let (rest, _) = tag("/*")(input)?;
    match take_until("*/")(rest) {
        Ok((rest, _)) => {
            let (rest, _) = tag("*/")(rest)?;
            Ok((rest, ()))
        }
        Err(nom::Err::Error(_)) => Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::TakeUntil,
        ))),
        Err(e) => Err(e),
    }
}

fn trivia0(input: Span) -> IResult<Span, ()> {
    value(
        (),
        many0_count(alt((value((), multispace1), line_comment, block_comment))),
    )
    .parse(input)
}

define_token_parser!(arrow, "->", TokenKind::Arrow);
define_token_parser!(eq_eq, "==", TokenKind::EqEq);
define_token_parser!(not_eq, "!=", TokenKind::NotEq);
define_token_parser!(le, "<=", TokenKind::Le);
define_token_parser!(ge, ">=", TokenKind::Ge);
define_token_parser!(and_and, "&&", TokenKind::AndAnd);
define_token_parser!(or_or, "||", TokenKind::OrOr);
define_token_parser!(comma, ",", TokenKind::Comma);
define_token_parser!(colon, ":", TokenKind::Colon);
define_token_parser!(semi_colon, ";", TokenKind::SemiColon);
define_token_parser!(question, "?", TokenKind::Question);
define_token_parser!(l_paren, "(", TokenKind::LParen);
define_token_parser!(r_paren, ")", TokenKind::RParen);
define_token_parser!(l_bracket, "[", TokenKind::LBracket);
define_token_parser!(r_bracket, "]", TokenKind::RBracket);
define_token_parser!(l_brace, "{", TokenKind::LBrace);
define_token_parser!(r_brace, "}", TokenKind::RBrace);
define_token_parser!(equal, "=", TokenKind::Equal);
define_token_parser!(lt, "<", TokenKind::Lt);
define_token_parser!(gt, ">", TokenKind::Gt);
define_token_parser!(plus, "+", TokenKind::Plus);
define_token_parser!(minus, "-", TokenKind::Minus);
define_token_parser!(star, "*", TokenKind::Star);
define_token_parser!(slash, "/", TokenKind::Slash);
define_token_parser!(percent, "%", TokenKind::Percent);
define_token_parser!(not, "!", TokenKind::Not);
define_token_parser!(dot, ".", TokenKind::Dot);

fn operators(input: Span) -> IResult<Span, Token> {
    alt((arrow, eq_eq, not_eq, le, ge, and_and, or_or)).parse(input)
}

fn punctuations(input: Span) -> IResult<Span, Token> {
    alt((
        comma, colon, semi_colon, question, l_paren, r_paren, l_bracket, r_bracket, l_brace,
        r_brace, equal, lt, gt, plus, minus, star, slash, percent, not, dot,
    ))
    .parse(input)
}

fn number_literal(input: Span) -> IResult<Span, Token> {
    map_opt(
        recognize((
            digit1,
            many0_count(alt((digit1, tag("_")))),
            opt((char('.'), digit1, many0_count(alt((digit1, tag("_")))))),
            opt((one_of("eE"), opt(one_of("+-")), digit1)),
        )),
        |span: Span| {
            Number::parse_literal(span.fragment()).map(|n| Token {
                range: span.into(),
                kind: TokenKind::NumberLiteral(n),
            })
        },
    )
    .parse(input)
}

fn unicode(input: Span) -> IResult<Span, char> {
    map_opt(
        map_res(
            preceded(
                char('u'),
                delimited(
                    char('{'),
                    take_while_m_n(1, 6, |c: char| c.is_ascii_hexdigit()),
                    char('}'),
                ),
            ),
            |span: Span| u32::from_str_radix(span.fragment(), 16),
        ),
        char::from_u32,
    )
    .parse(input)
}

/// Raw high-byte escape `\xHH`.
fn high_byte(input: Span) -> IResult<Span, char> {
    map_res(
        preceded(
            char('x'),
            take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
        ),
        |span: Span| u8::from_str_radix(span.fragment(), 16).map(char::from),
    )
    .parse(input)
}

fn escape_sequence(input: Span) -> IResult<Span, char> {
    alt((
        value('\\', char('\\')),
        value('\'', char('\'')),
        value('"', char('"')),
        value('\n', char('n')),
        value('\r', char('r')),
        value('\t', char('t')),
        high_byte,
        unicode,
    ))
    .parse(input)
}

fn string_body(quote: char) -> impl for<'a> FnMut(Span<'a>) -> IResult<Span<'a>, String> {
    move |input: Span| {
        let mut out = String::new();
        let mut rest = input;
        loop {
            let fragment = rest.fragment();
            match fragment.chars().next() {
                None => return Err(nom::Err::Error(nom::error::Error::new(rest, nom::error::ErrorKind::Eof))),
                Some(c) if c == quote => return Ok((rest, out)),
                Some('\\') => {
                    let (r, _) = take(1usize)(rest)?;
                    let (r, c) = escape_sequence(r)?;
                    out.push(c);
                    rest = r;
                }
                Some(c) => {
                    let (r, _) = take(c.len_utf8())(rest)?;
                    out.push(c);
                    rest = r;
                }
            }
        }
    }
}

fn string_literal(input: Span) -> IResult<Span, Token> {
    let (span, start) = position(input)?;
    let (span, quote) = one_of("'\"")(span)?;
    let (span, text) = string_body(quote)(span)?;
    let (span, _) = char(quote)(span)?;
    let (span, end) = position(span)?;

    Ok((
        span,
        Token {
            range: Range {
                start: start.into(),
                end: end.into(),
            },
            kind: TokenKind::StringLiteral(text),
        },
    ))
}

fn model_literal(input: Span) -> IResult<Span, Token> {
    let (span, start) = position(input)?;
    let (span, name) = delimited(char('`'), is_not("`"), char('`')).parse(span)?;
    let (span, end) = position(span)?;

    Ok((
        span,
        Token {
            range: Range {
                start: start.into(),
                end: end.into(),
            },
            kind: TokenKind::ModelLiteral(CompactString::new(name.fragment())),
        },
    ))
}

fn ident(input: Span) -> IResult<Span, Token> {
    map(
        recognize(pair(
            alt((alpha1, tag("_"))),
            many0_count(alt((alphanumeric1, tag("_")))),
        )),
        |span: Span| {
            let kind = match *span.fragment() {
                "true" => TokenKind::BoolLiteral(true),
                "false" => TokenKind::BoolLiteral(false),
                "null" => TokenKind::NullLiteral,
                "switch" => TokenKind::Switch,
                "default" => TokenKind::Default,
                "and" => TokenKind::And,
                "or" => TokenKind::Or,
                _ => TokenKind::Ident(CompactString::new(span.fragment())),
            };
            Token {
                range: span.into(),
                kind,
            }
        },
    )
    .parse(input)
}

/// Finds the byte length of the balanced `{ ... }` span starting at
/// the opening brace, honoring string literals and escapes inside.
fn balanced_braces(fragment: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in fragment.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn template(input: Span) -> IResult<Span, Token> {
    let (span, start) = position(input)?;
    let (mut rest, _) = tag("{{{")(span)?;
    let mut segments: Vec<TemplateSegment> = Vec::new();
    let mut text = String::new();
    let mut text_start: Position = rest.into();

    macro_rules! flush_text {
        () => {
            if !text.is_empty() {
                let text_end: Position = rest.into();
                segments.push(TemplateSegment::Text(
                    std::mem::take(&mut text),
                    Range::new(text_start, text_end),
                ));
            }
        };
    }

    loop {
        let fragment = *rest.fragment();
        if fragment.starts_with("}}}") {
            flush_text!();
            let (after, _) = tag("}}}")(rest)?;
            let (after, end) = position(after)?;
            return Ok((
                after,
                Token {
                    range: Range {
                        start: start.into(),
                        end: end.into(),
                    },
                    kind: TokenKind::Template(segments),
                },
            ));
        }
        if fragment.is_empty() {
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::TakeUntil,
            )));
        }
        if fragment.starts_with("<%--") {
            match fragment.find("--%>") {
                Some(i) => {
                    flush_text!();
                    let (r, _) = take(i + 4)(rest)?;
                    rest = r;
                    text_start = rest.into();
                }
                None => {
                    return Err(nom::Err::Failure(nom::error::Error::new(
                        input,
                        nom::error::ErrorKind::TakeUntil,
                    )));
                }
            }
            continue;
        }
        if fragment.starts_with("<!--") {
            match fragment.find("-->") {
                Some(i) => {
                    flush_text!();
                    let (r, _) = take(i + 3)(rest)?;
                    rest = r;
                    text_start = rest.into();
                }
                None => {
                    return Err(nom::Err::Failure(nom::error::Error::new(
                        input,
                        nom::error::ErrorKind::TakeUntil,
                    )));
                }
            }
            continue;
        }
        if fragment.starts_with("\\{") || fragment.starts_with("\\}") {
            text.push(fragment.chars().nth(1).unwrap());
            let (r, _) = take(2usize)(rest)?;
            rest = r;
            continue;
        }
        if fragment.starts_with('{') {
            match balanced_braces(fragment) {
                Some(len) => {
                    flush_text!();
                    let (r, _) = take(1usize)(rest)?;
                    let (r, expr_start) = position(r)?;
                    let expr_src = &fragment[1..len - 1];
                    let (r, _) = take(len - 2)(r)?;
                    let (r, expr_end) = position(r)?;
                    segments.push(TemplateSegment::Expr(
                        expr_src.to_string(),
                        Range {
                            start: expr_start.into(),
                            end: expr_end.into(),
                        },
                    ));
                    let (r, _) = take(1usize)(r)?;
                    rest = r;
                    text_start = rest.into();
                }
                None => {
                    return Err(nom::Err::Failure(nom::error::Error::new(
                        input,
                        nom::error::ErrorKind::TakeUntil,
                    )));
                }
            }
            continue;
        }
        let c = fragment.chars().next().unwrap();
        text.push(c);
        let (r, _) = take(c.len_utf8())(rest)?;
        rest = r;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[rstest]
    #[case("7", vec![TokenKind::NumberLiteral(7.0.into()), TokenKind::Eof])]
    #[case("7.5", vec![TokenKind::NumberLiteral(7.5.into()), TokenKind::Eof])]
    #[case("7_000_000", vec![TokenKind::NumberLiteral(7_000_000.0.into()), TokenKind::Eof])]
    #[case("1e2", vec![TokenKind::NumberLiteral(100.0.into()), TokenKind::Eof])]
    #[case("2.5e-1", vec![TokenKind::NumberLiteral(0.25.into()), TokenKind::Eof])]
    fn test_numbers(#[case] input: &str, #[case] expected: Vec<TokenKind>) {
        assert_eq!(kinds(input), expected);
    }

    #[rstest]
    #[case(r"'hello'", "hello")]
    #[case(r#""hello""#, "hello")]
    #[case(r"''", "")]
    #[case(r"'a\\b'", "a\\b")]
    #[case(r"'a\'b'", "a'b")]
    #[case(r"'a\nb'", "a\nb")]
    #[case(r"'\xe9'", "\u{e9}")]
    #[case(r"'\u{1F600}'", "\u{1F600}")]
    fn test_strings(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(
            kinds(input),
            vec![
                TokenKind::StringLiteral(expected.to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_model_literal() {
        assert_eq!(
            kinds("`Accounts:User#name`"),
            vec![
                TokenKind::ModelLiteral(CompactString::new("Accounts:User#name")),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_operators_and_keywords() {
        assert_eq!(
            kinds("a -> b && c or null != true"),
            vec![
                TokenKind::Ident(CompactString::new("a")),
                TokenKind::Arrow,
                TokenKind::Ident(CompactString::new("b")),
                TokenKind::AndAnd,
                TokenKind::Ident(CompactString::new("c")),
                TokenKind::Or,
                TokenKind::NullLiteral,
                TokenKind::NotEq,
                TokenKind::BoolLiteral(true),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_minus_is_not_merged_into_number() {
        assert_eq!(
            kinds("1 -3"),
            vec![
                TokenKind::NumberLiteral(1.0.into()),
                TokenKind::Minus,
                TokenKind::NumberLiteral(3.0.into()),
                TokenKind::Eof
            ]
        );
    }

    #[rstest]
    #[case("1 // trailing\n+ 2")]
    #[case("1 /* inline */ + 2")]
    #[case("/* leading\nmultiline */1 + 2")]
    fn test_comments_are_trivia(#[case] input: &str) {
        assert_eq!(
            kinds(input),
            vec![
                TokenKind::NumberLiteral(1.0.into()),
                TokenKind::Plus,
                TokenKind::NumberLiteral(2.0.into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_line_comment_cr_terminated() {
        assert_eq!(
            kinds("1 // note\r+ 2"),
            vec![
                TokenKind::NumberLiteral(1.0.into()),
                TokenKind::Plus,
                TokenKind::NumberLiteral(2.0.into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_template_segments() {
        let tokens = tokenize("{{{<b>{name}</b>}}}").unwrap();
        match &tokens[0].kind {
            TokenKind::Template(segments) => {
                assert_eq!(segments.len(), 3);
                assert!(
                    matches!(&segments[0], TemplateSegment::Text(t, _) if t == "<b>"),
                    "got {:?}",
                    segments[0]
                );
                assert!(matches!(&segments[1], TemplateSegment::Expr(e, _) if e == "name"));
                assert!(matches!(&segments[2], TemplateSegment::Text(t, _) if t == "</b>"));
            }
            other => panic!("expected template, got {:?}", other),
        }
    }

    #[test]
    fn test_template_brace_escapes() {
        let tokens = tokenize(r"{{{a\{b\}c}}}").unwrap();
        match &tokens[0].kind {
            TokenKind::Template(segments) => {
                assert_eq!(segments.len(), 1);
                assert!(matches!(&segments[0], TemplateSegment::Text(t, _) if t == "a{b}c"));
            }
            other => panic!("expected template, got {:?}", other),
        }
    }

    #[rstest]
    #[case("{{{a<%-- hidden --%>b}}}")]
    #[case("{{{a<!-- hidden -->b}}}")]
    fn test_template_comments_stripped(#[case] input: &str) {
        let tokens = tokenize(input).unwrap();
        match &tokens[0].kind {
            TokenKind::Template(segments) => {
                let text: String = segments
                    .iter()
                    .map(|s| match s {
                        TemplateSegment::Text(t, _) => t.as_str(),
                        TemplateSegment::Expr(_, _) => "",
                    })
                    .collect();
                assert_eq!(text, "ab");
            }
            other => panic!("expected template, got {:?}", other),
        }
    }

    #[test]
    fn test_template_nested_braces_in_expr() {
        let tokens = tokenize("{{{x{ { a = 1; a + 1 } }y}}}").unwrap();
        match &tokens[0].kind {
            TokenKind::Template(segments) => {
                assert!(
                    matches!(&segments[1], TemplateSegment::Expr(e, _) if e.trim() == "{ a = 1; a + 1 }")
                );
            }
            other => panic!("expected template, got {:?}", other),
        }
    }

    #[test]
    fn test_unterminated_string_reports_begin_only() {
        let err = tokenize("1 + 'abc").unwrap_err();
        match err {
            LexerError::Unterminated { kind, range } => {
                assert_eq!(kind, "string literal");
                assert_eq!(range.start, Position::new(1, 5));
                assert_eq!(range.end, Position::UNKNOWN);
            }
            other => panic!("expected unterminated, got {:?}", other),
        }
    }

    #[rstest]
    #[case("/* never closed", "block comment")]
    #[case("1 + /* tail", "block comment")]
    #[case("`Model", "model literal")]
    #[case("{{{ open", "template")]
    #[case("{{{a<!-- hidden", "template")]
    #[case("{{{a{1 + 2", "template")]
    fn test_unterminated_tokens(#[case] input: &str, #[case] expected_kind: &str) {
        match tokenize(input).unwrap_err() {
            LexerError::Unterminated { kind, range } => {
                assert_eq!(kind, expected_kind);
                assert!(range.end.is_unknown());
            }
            other => panic!("expected unterminated, got {:?}", other),
        }
    }

    #[test]
    fn test_unexpected_character() {
        match tokenize("1 + @").unwrap_err() {
            LexerError::UnexpectedToken(position) => {
                assert_eq!(position, Position::new(1, 5));
            }
            other => panic!("expected unexpected token, got {:?}", other),
        }
    }

    #[test]
    fn test_token_positions() {
        let tokens = tokenize("ab + 1").unwrap();
        assert_eq!(tokens[0].range.start, Position::new(1, 1));
        assert_eq!(tokens[0].range.end, Position::new(1, 3));
        assert_eq!(tokens[1].range.start, Position::new(1, 4));
        assert_eq!(tokens[2].range.start, Position::new(1, 6));
    }
}
