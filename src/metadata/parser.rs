use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use super::lexer::{line_column, Lexer, Token, TokenKind};
use super::value::{Document, Section, Value};
use super::Error;

/// Deeper nesting than this is not something LVM writes.
const MAX_DEPTH: usize = 64;

/// Parses metadata text into a generic document tree.
///
/// ```text
/// Document := Section*
/// Section  := Identifier ( '=' Value | '{' Section* '}' )
/// Value    := Number | String | Array
/// Array    := '[' ( Value (',' Value)* )? ']'
/// ```
pub fn parse_document(text: &str) -> Result<Document, Error> {
    Parser { text, lexer: Lexer::new(text), lookahead: VecDeque::new() }.sections(0)
}

struct Parser<'a> {
    text: &'a str,
    lexer: Lexer<'a>,
    lookahead: VecDeque<Token<'a>>,
}

impl<'a> Parser<'a> {
    fn peek(&mut self, n: usize) -> Result<Option<Token<'a>>, Error> {
        while self.lookahead.len() <= n {
            match self.lexer.next() {
                Some(token) => self.lookahead.push_back(token?),
                None => break,
            }
        }
        Ok(self.lookahead.get(n).copied())
    }

    fn bump(&mut self) -> Result<Option<Token<'a>>, Error> {
        self.peek(0)?;
        Ok(self.lookahead.pop_front())
    }

    fn error(&self, expected: &'static str, found: Option<Token<'a>>) -> Error {
        let (position, found) = match found {
            Some(token) => (token.position, format!("`{}`", token.text)),
            None => (self.text.len(), "end of input".to_string()),
        };
        let (line, column) = line_column(self.text, position);
        Error::Parse { position, line, column, expected, found }
    }

    fn expect_punct(&mut self, c: char, expected: &'static str) -> Result<(), Error> {
        match self.bump()? {
            Some(token) if token.is_punct(c) => Ok(()),
            other => Err(self.error(expected, other)),
        }
    }

    /// The contents of a scope; `depth == 0` is the document itself, which
    /// ends at end of input instead of at `}`.
    fn sections(&mut self, depth: usize) -> Result<Section, Error> {
        if depth > MAX_DEPTH {
            let token = self.peek(0)?;
            return Err(self.error("less deeply nested sections", token));
        }
        let mut section = Section::new();
        loop {
            match self.peek(0)? {
                None if depth == 0 => return Ok(section),
                Some(token) if depth > 0 && token.is_punct('}') => {
                    self.bump()?;
                    return Ok(section);
                }
                Some(token) if token.kind == TokenKind::Ident => {
                    let (name, value) = self.section(depth)?;
                    section.push(name, value);
                }
                other => {
                    let expected = if depth == 0 { "a key or section name" } else { "a key, section name or `}`" };
                    return Err(self.error(expected, other));
                }
            }
        }
    }

    fn section(&mut self, depth: usize) -> Result<(String, Value), Error> {
        // the token after the name decides between an assignment and a scope
        let next = self.peek(1)?;
        let name = self.bump()?.map(|t| t.text.to_string()).unwrap_or_default();
        match next {
            Some(token) if token.is_punct('=') => {
                self.bump()?;
                Ok((name, self.value(depth)?))
            }
            Some(token) if token.is_punct('{') => {
                self.bump()?;
                Ok((name, Value::Section(self.sections(depth + 1)?)))
            }
            other => Err(self.error("`=` or `{`", other)),
        }
    }

    fn value(&mut self, depth: usize) -> Result<Value, Error> {
        let token = self.bump()?;
        match token {
            Some(t) if t.kind == TokenKind::Number => self.number(t),
            Some(t) if t.kind == TokenKind::String => Ok(Value::String(unescape(&t.text[1..t.text.len() - 1]))),
            Some(t) if t.is_punct('[') && depth < MAX_DEPTH => self.array(depth + 1),
            other => Err(self.error("a number, string or array", other)),
        }
    }

    fn number(&self, token: Token<'a>) -> Result<Value, Error> {
        let value = if token.text.contains('.') {
            token.text.parse().ok().map(Value::Float)
        } else {
            token.text.parse().ok().map(Value::Integer)
        };
        value.ok_or_else(|| self.error("a number that fits in 64 bits", Some(token)))
    }

    // the opening bracket is already consumed
    fn array(&mut self, depth: usize) -> Result<Value, Error> {
        let mut items = Vec::new();
        if matches!(self.peek(0)?, Some(t) if t.is_punct(']')) {
            self.bump()?;
            return Ok(Value::Array(items));
        }
        loop {
            items.push(self.value(depth)?);
            match self.bump()? {
                Some(t) if t.is_punct(',') => continue,
                Some(t) if t.is_punct(']') => return Ok(Value::Array(items)),
                other => return Err(self.error("`,` or `]`", other)),
            }
        }
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            c => out.push(c),
        }
    }
    out
}
