//! Tokeniser for query text.

use std::ops::Range;

use logos::Logos;

use crate::query::errors::SyntaxError;

/// Lexical token. Keywords are lexed as [`Token::Ident`] and matched
/// case-insensitively by the parser.
#[derive(Logos, Clone, Debug, PartialEq)]
#[logos(skip r"([ \t\r\n\f]+|#[^\n]*)")]
pub enum Token<'s> {
    /// `<...>`, brackets stripped.
    #[regex(r#"<[^<>"{}|^`\\\x00-\x20]*>"#, |lex| { let s = lex.slice(); &s[1..s.len() - 1] })]
    IriRef(&'s str),
    /// `prefix:local` or `prefix:`.
    #[regex(r"([A-Za-z][A-Za-z0-9_]*)?:[A-Za-z0-9_\-:]*", |lex| dotted_tail(lex, ':'))]
    PrefixedName(&'s str),
    /// `?name` / `$name`, sigil stripped.
    #[regex(r"[?$][A-Za-z0-9_]+", |lex| &lex.slice()[1..])]
    Var(&'s str),
    /// `_:label`, prefix stripped.
    #[regex(r"_:[A-Za-z0-9_][A-Za-z0-9_\-]*", |lex| &dotted_tail(lex, '_')[2..])]
    BlankLabel(&'s str),
    /// `@tag`, `@` stripped.
    #[regex(r"@[a-zA-Z]+(-[a-zA-Z0-9]+)*", |lex| &lex.slice()[1..])]
    LangTag(&'s str),
    /// Short string literal, quotes kept; unescaped by the parser.
    #[regex(r#""([^"\\\n\r]|\\.)*""#, |lex| lex.slice())]
    #[regex(r#"'([^'\\\n\r]|\\.)*'"#, |lex| lex.slice())]
    String(&'s str),
    /// Long string literal (`"""` or `'''`), quotes kept.
    #[token(r#"""""#, |lex| long_string(lex, "\"\"\""))]
    #[token("'''", |lex| long_string(lex, "'''"))]
    LongString(&'s str),
    /// Unsigned integer.
    #[regex(r"[0-9]+", |lex| lex.slice())]
    Integer(&'s str),
    /// Unsigned decimal.
    #[regex(r"[0-9]*\.[0-9]+", |lex| lex.slice())]
    Decimal(&'s str),
    /// Unsigned double.
    #[regex(r"([0-9]+\.[0-9]*|\.?[0-9]+)[eE][+-]?[0-9]+", |lex| lex.slice())]
    Double(&'s str),
    /// Bare word: keyword, function name, `a`, `true`/`false`.
    #[regex(r"[A-Za-z][A-Za-z0-9_]*", |lex| lex.slice())]
    Ident(&'s str),
    #[token("^^")]
    DoubleCaret,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(".")]
    Dot,
    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("=")]
    Eq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("!")]
    Bang,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    /// Property path alternation; only lexed so it can be rejected clearly.
    #[token("|")]
    Pipe,
    /// Property path inverse; only lexed so it can be rejected clearly.
    #[token("^")]
    Caret,
    /// Property path modifier.
    #[token("?")]
    Question,
}

fn is_name_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-' | b':')
}

/// Extends a name over interior dots. A dot is only part of the name when a
/// name character follows it, so `ex:a.b` is one token and `ex:c.` ends at `c`.
fn dotted_tail<'s>(lex: &mut logos::Lexer<'s, Token<'s>>, local_after: char) -> &'s str {
    let slice = lex.slice();
    let local_started = slice
        .split_once(local_after)
        .is_some_and(|(_, local)| !local.is_empty());
    if local_started {
        let rest = lex.remainder().as_bytes();
        let mut end = 0;
        let mut idx = 0;
        while let Some(&byte) = rest.get(idx) {
            if is_name_byte(byte) {
                idx += 1;
                end = idx;
            } else if byte == b'.' {
                idx += 1;
            } else {
                break;
            }
        }
        lex.bump(end);
    }
    lex.slice()
}

fn long_string<'s>(lex: &mut logos::Lexer<'s, Token<'s>>, delimiter: &str) -> Option<&'s str> {
    let rest = lex.remainder();
    let mut escaped = false;
    for (idx, ch) in rest.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if ch == '\\' {
            escaped = true;
            continue;
        }
        if rest[idx..].starts_with(delimiter) {
            // Up to two extra quote characters may close the string.
            let mut end = idx + delimiter.len();
            let quote = delimiter.as_bytes()[0];
            while rest.as_bytes().get(end) == Some(&quote) && end - idx < delimiter.len() + 2 {
                end += 1;
            }
            let content_end = end - delimiter.len();
            lex.bump(end);
            let slice = lex.slice();
            let start = delimiter.len();
            let stop = start + content_end;
            return Some(&slice[start..stop]);
        }
    }
    None
}

/// Token with its byte span.
pub type Spanned<'s> = (Token<'s>, Range<usize>);

/// Tokenises the whole input, reporting the first unrecognised character.
pub fn tokenize(text: &str) -> Result<Vec<Spanned<'_>>, SyntaxError> {
    let mut lexer = Token::lexer(text);
    let mut out = Vec::new();
    while let Some(token) = lexer.next() {
        let span = lexer.span();
        match token {
            Ok(token) => out.push((token, span)),
            Err(()) => {
                let found = text[span.start..].chars().next().unwrap_or(' ');
                return Err(SyntaxError::at(
                    text,
                    span.start,
                    format!("unexpected character '{found}'"),
                ));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<Token<'_>> {
        tokenize(text)
            .expect("lexes")
            .into_iter()
            .map(|(tok, _)| tok)
            .collect()
    }

    #[test]
    fn lexes_basic_select() {
        let tokens = kinds("SELECT ?s WHERE { ?s a ex:Person . } # trailing");
        assert_eq!(
            tokens,
            vec![
                Token::Ident("SELECT"),
                Token::Var("s"),
                Token::Ident("WHERE"),
                Token::LBrace,
                Token::Var("s"),
                Token::Ident("a"),
                Token::PrefixedName("ex:Person"),
                Token::Dot,
                Token::RBrace,
            ]
        );
    }

    #[test]
    fn distinguishes_iri_from_less_than() {
        let tokens = kinds("FILTER(?a < 3) <http://x#y>");
        assert!(tokens.contains(&Token::Lt));
        assert!(tokens.contains(&Token::IriRef("http://x#y")));
    }

    #[test]
    fn prefixed_name_does_not_swallow_final_dot() {
        let tokens = kinds("ex:a ex:b ex:c.");
        assert_eq!(tokens.last(), Some(&Token::Dot));
        assert_eq!(tokens[2], Token::PrefixedName("ex:c"));
    }

    #[test]
    fn prefixed_names_with_local_parts() {
        let tokens = kinds("?s a :Person ; xsd:int ex: ex:a.b _:b1.");
        assert_eq!(
            tokens,
            vec![
                Token::Var("s"),
                Token::Ident("a"),
                Token::PrefixedName(":Person"),
                Token::Semicolon,
                Token::PrefixedName("xsd:int"),
                Token::PrefixedName("ex:"),
                Token::PrefixedName("ex:a.b"),
                Token::BlankLabel("b1"),
                Token::Dot,
            ]
        );
    }

    #[test]
    fn numbers_and_literals() {
        let tokens = kinds(r#"1 2.5 3e2 "hi"@en "x"^^xsd:int"#);
        assert_eq!(tokens[0], Token::Integer("1"));
        assert_eq!(tokens[1], Token::Decimal("2.5"));
        assert_eq!(tokens[2], Token::Double("3e2"));
        assert_eq!(tokens[3], Token::String("\"hi\""));
        assert_eq!(tokens[4], Token::LangTag("en"));
        assert_eq!(tokens[6], Token::DoubleCaret);
    }

    #[test]
    fn long_strings_span_lines() {
        let tokens = kinds("\"\"\"line one\nline \"two\"\"\"\" .");
        assert_eq!(tokens[0], Token::LongString("line one\nline \"two\""));
        assert_eq!(tokens[1], Token::Dot);
    }

    #[test]
    fn reports_position_of_bad_character() {
        let err = tokenize("SELECT ?s\nWHERE { ~ }").unwrap_err();
        assert_eq!((err.position.line, err.position.column), (2, 9));
    }
}
