//! A small scanner for Go-style template sources. It does not understand
//! pipelines; it only finds the `{{ ... }}` actions, applies trim markers,
//! drops comments, and hands back a flat stream of [`Token`]s. The
//! [`crate::template`] module uses it to split sources into named fragments
//! before the full parse is delegated to [`gtmpl`].

use std::fmt;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// A piece of template source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Token<'a> {
    /// Literal text between actions, with trim markers already applied.
    Text(&'a str),

    /// The body of an action with delimiters, trim markers and surrounding
    /// whitespace removed, e.g. `template "nav" .`.
    Action(&'a str),
}

impl Token<'_> {
    /// The first word of an action (`define`, `if`, `end`, ...), or `None` for
    /// text tokens.
    pub fn keyword(&self) -> Option<&str> {
        match self {
            Token::Text(_) => None,
            Token::Action(body) => body.split_whitespace().next(),
        }
    }
}

/// Splits `src` into text and action tokens.
pub fn tokenize(src: &str) -> Result<Vec<Token<'_>>> {
    let mut tokens = Vec::new();
    let mut pos = 0;

    while let Some(found) = src[pos..].find(OPEN) {
        let open = pos + found;
        let mut inner_start = open + OPEN.len();
        let mut text = &src[pos..open];

        if trim_marker_follows(&src[inner_start..]) {
            text = text.trim_end();
            inner_start += 1;
        }
        if !text.is_empty() {
            tokens.push(Token::Text(text));
        }

        let close = find_close(src, inner_start)?;
        let mut inner = &src[inner_start..close];
        let trim_right = trim_marker_precedes(inner);
        if trim_right {
            inner = &inner[..inner.len() - 1];
        }

        let body = inner.trim();
        if !is_comment(body) {
            tokens.push(Token::Action(body));
        }

        pos = close + CLOSE.len();
        if trim_right {
            pos = src.len() - src[pos..].trim_start().len();
        }
    }

    if pos < src.len() {
        tokens.push(Token::Text(&src[pos..]));
    }

    Ok(tokens)
}

// `{{- ` trims; `{{-3}}` is a negative number.
fn trim_marker_follows(rest: &str) -> bool {
    let mut chars = rest.chars();
    chars.next() == Some('-') && chars.next().map_or(false, char::is_whitespace)
}

fn trim_marker_precedes(inner: &str) -> bool {
    let mut chars = inner.chars().rev();
    chars.next() == Some('-') && chars.next().map_or(false, char::is_whitespace)
}

fn is_comment(body: &str) -> bool {
    body.starts_with("/*") && body.ends_with("*/")
}

// Finds the `}}` that closes the action starting at `start`, skipping over
// comments and quoted literals which may themselves contain `}}`.
fn find_close(src: &str, start: usize) -> Result<usize> {
    let bytes = src.as_bytes();
    let mut i = start;

    let lead = src[start..].len() - src[start..].trim_start().len();
    if src[start + lead..].starts_with("/*") {
        match src[start + lead + 2..].find("*/") {
            Some(end) => i = start + lead + 2 + end + 2,
            None => return Err(Error::UnclosedComment { offset: start }),
        }
    }

    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => i = skip_quoted(bytes, i)?,
            b'`' => match src[i + 1..].find('`') {
                Some(end) => i += end + 2,
                None => return Err(Error::UnterminatedLiteral { offset: i }),
            },
            b'}' if bytes.get(i + 1) == Some(&b'}') => return Ok(i),
            _ => i += 1,
        }
    }

    Err(Error::UnclosedAction { offset: start })
}

fn skip_quoted(bytes: &[u8], start: usize) -> Result<usize> {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => break,
            b if b == quote => return Ok(i + 1),
            _ => i += 1,
        }
    }
    Err(Error::UnterminatedLiteral { offset: start })
}

/// Reads a leading Go string literal (`"..."` or `` `...` ``) from `s`,
/// returning its value and the remainder of `s`.
pub fn string_literal(s: &str) -> Option<(String, &str)> {
    let s = s.trim_start();
    if let Some(rest) = s.strip_prefix('`') {
        let end = rest.find('`')?;
        return Some((rest[..end].to_owned(), &rest[end + 1..]));
    }

    let rest = s.strip_prefix('"')?;
    let mut value = String::new();
    let mut chars = rest.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Some((value, &rest[i + 1..])),
            '\\' => match chars.next()?.1 {
                'n' => value.push('\n'),
                't' => value.push('\t'),
                'r' => value.push('\r'),
                other => value.push(other),
            },
            c => value.push(c),
        }
    }
    None
}

type Result<T> = std::result::Result<T, Error>;

/// Errors produced while scanning template source. Offsets are byte offsets
/// into the scanned text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An `{{` without a matching `}}`.
    UnclosedAction { offset: usize },

    /// A `{{/*` without a matching `*/`.
    UnclosedComment { offset: usize },

    /// A quoted literal inside an action that never ends.
    UnterminatedLiteral { offset: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::UnclosedAction { offset } => {
                write!(f, "unclosed action starting at byte {}", offset)
            }
            Error::UnclosedComment { offset } => {
                write!(f, "unclosed comment starting at byte {}", offset)
            }
            Error::UnterminatedLiteral { offset } => {
                write!(f, "unterminated quoted literal at byte {}", offset)
            }
        }
    }
}

impl std::error::Error for Error {}
