use nom::branch::alt;
use nom::bytes::complete::{tag, take_till, take_while1};
use nom::character::complete::{anychar, char, digit0, digit1, multispace1, none_of, one_of};
use nom::combinator::{opt, recognize};
use nom::multi::many0;
use nom::sequence::{delimited, pair, tuple};
use nom::IResult;

use super::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Number,
    Ident,
    String,
    Punct,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    /// Byte offset into the metadata text.
    pub position: usize,
}

impl<'a> Token<'a> {
    pub fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct && self.text.starts_with(c)
    }
}

const PUNCTUATION: &str = "[]!@#$%^&*()+_={}|:;\"'<,>.?/";

fn comment(input: &str) -> IResult<&str, &str> {
    recognize(tuple((alt((tag("#"), tag("//"))), take_till(|c: char| c == '\n'), opt(char('\n')))))(input)
}

fn number(input: &str) -> IResult<&str, &str> {
    alt((recognize(tuple((digit0, char('.'), digit1))), digit1))(input)
}

fn ident(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-')(input)
}

fn string(input: &str) -> IResult<&str, &str> {
    recognize(delimited(
        char('"'),
        many0(alt((recognize(pair(char('\\'), anychar)), recognize(none_of("\\\""))))),
        char('"'),
    ))(input)
}

fn punct(input: &str) -> IResult<&str, &str> {
    recognize(one_of(PUNCTUATION))(input)
}

fn matched_len(input: &str, result: IResult<&str, &str>) -> Option<usize> {
    result.ok().map(|(rest, _)| input.len() - rest.len())
}

/// Picks the token at the start of `input`. Classes are tried in priority
/// order and the first one that matches wins, so `1data` is `1` then `data`.
fn token(input: &str) -> Option<(TokenKind, usize)> {
    if let Some(len) = matched_len(input, number(input)) {
        return Some((TokenKind::Number, len));
    }
    if let Some(len) = matched_len(input, ident(input)) {
        return Some((TokenKind::Ident, len));
    }
    if let Some(len) = matched_len(input, string(input)) {
        return Some((TokenKind::String, len));
    }
    matched_len(input, punct(input)).map(|len| (TokenKind::Punct, len))
}

/// 1-based line and column of a byte position.
pub(crate) fn line_column(text: &str, position: usize) -> (usize, usize) {
    let before = &text[..position.min(text.len())];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map_or(0, |i| i + 1);
    (line, before[line_start..].chars().count() + 1)
}

/// Splits metadata text into tokens, dropping comments and whitespace.
///
/// Tokens are produced lazily. The iterator ends after the first error.
#[derive(Clone, Debug)]
pub struct Lexer<'a> {
    input: &'a str,
    position: usize,
    done: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input, position: 0, done: false }
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Result<Token<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let rest = &self.input[self.position..];
            if rest.is_empty() {
                self.done = true;
                break;
            }
            if let Some(len) = matched_len(rest, alt((comment, multispace1))(rest)) {
                self.position += len;
                continue;
            }

            let position = self.position;
            return match token(rest) {
                Some((kind, len)) => {
                    self.position += len;
                    Some(Ok(Token { kind, text: &self.input[position..position + len], position }))
                }
                None => {
                    self.done = true;
                    let (line, column) = line_column(self.input, position);
                    let found = rest.chars().next().unwrap_or_default();
                    Some(Err(Error::Lex { position, line, column, found }))
                }
            };
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    fn lex(input: &str) -> Vec<(TokenKind, &str)> {
        Lexer::new(input).map(|t| t.map(|t| (t.kind, t.text))).collect::<Result<_, _>>().unwrap()
    }

    #[test]
    fn tokens_and_positions() {
        let tokens: Vec<_> = Lexer::new("vg0 {\n\tseqno = 3\n}").collect::<Result<_, _>>().unwrap();
        let summary: Vec<_> = tokens.iter().map(|t| (t.kind, t.text, t.position)).collect();
        assert_eq!(
            summary,
            [
                (TokenKind::Ident, "vg0", 0),
                (TokenKind::Punct, "{", 4),
                (TokenKind::Ident, "seqno", 7),
                (TokenKind::Punct, "=", 13),
                (TokenKind::Number, "3", 15),
                (TokenKind::Punct, "}", 17),
            ]
        );
    }

    #[test]
    fn comments_are_dropped() {
        assert_eq!(
            lex("# Generated by LVM2 version 2.03.16(2)\na = 1 // trailing\n#eof"),
            [(TokenKind::Ident, "a"), (TokenKind::Punct, "="), (TokenKind::Number, "1")]
        );
    }

    #[test]
    fn strings_keep_escapes() {
        assert_eq!(
            lex(r#"d = "say \"hi\" \\" x"#),
            [
                (TokenKind::Ident, "d"),
                (TokenKind::Punct, "="),
                (TokenKind::String, r#""say \"hi\" \\""#),
                (TokenKind::Ident, "x"),
            ]
        );
    }

    #[test]
    fn numbers_and_names() {
        assert_eq!(
            lex("1.5 .25 42 pv-0 1data 7."),
            [
                (TokenKind::Number, "1.5"),
                (TokenKind::Number, ".25"),
                (TokenKind::Number, "42"),
                (TokenKind::Ident, "pv-0"),
                (TokenKind::Number, "1"),
                (TokenKind::Ident, "data"),
                (TokenKind::Number, "7"),
                (TokenKind::Punct, "."),
            ]
        );
    }

    #[test]
    fn restarting_gives_same_tokens() {
        let lexer = Lexer::new("a = [1, 2]");
        let first: Vec<_> = lexer.clone().map(Result::unwrap).collect();
        let second: Vec<_> = lexer.map(Result::unwrap).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_character_is_an_error() {
        let mut lexer = Lexer::new("a = 1\nb = ~");
        let err = lexer.by_ref().find_map(Result::err).unwrap();
        assert!(
            matches!(err, Error::Lex { position: 10, line: 2, column: 5, found: '~' }),
            "{err:?}"
        );
        assert!(lexer.next().is_none());
    }
}
