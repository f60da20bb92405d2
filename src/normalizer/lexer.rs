//! Span-preserving token view over the `sqlparser` tokenizer.
//!
//! Each token keeps the exact source slice it came from, so rewrites can edit by byte
//! span and leave everything else untouched. Input that does not tokenize (an
//! unterminated string or comment) is reported as an error and callers leave it as is.

use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Token as SqlToken, Tokenizer, TokenizerError, Whitespace};
use std::iter::Peekable;
use std::str::CharIndices;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Whitespace,
    Comment,
    Word,
    QuotedIdent,
    StringLit,
    Number,
    Placeholder,
    Operator,
    LParen,
    RParen,
    Comma,
    Semicolon,
    Dot,
    Star,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub start: usize,
    value: Option<String>,
}

impl<'a> Token<'a> {
    pub fn end(&self) -> usize {
        self.start + self.text.len()
    }

    pub fn is_trivia(&self) -> bool {
        matches!(self.kind, TokenKind::Whitespace | TokenKind::Comment)
    }

    pub fn is_word(&self, word: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(word)
    }

    pub fn is_op(&self, op: &str) -> bool {
        self.kind == TokenKind::Operator && self.text == op
    }

    pub fn is_line_comment(&self) -> bool {
        self.kind == TokenKind::Comment && self.text.starts_with("--")
    }

    /// Unquoted value of a string literal (`''` unescaped).
    pub fn string_value(&self) -> Option<String> {
        self.value.clone()
    }
}

pub fn tokenize(sql: &str) -> Result<Vec<Token<'_>>, TokenizerError> {
    let dialect = PostgreSqlDialect {};
    let located = Tokenizer::new(&dialect, sql).tokenize_with_location()?;

    let mut cursor = SourceCursor::new(sql);
    let starts: Vec<usize> = located
        .iter()
        .map(|t| cursor.seek(t.location.line, t.location.column))
        .collect();

    let mut tokens = Vec::with_capacity(located.len());
    for (i, located) in located.into_iter().enumerate() {
        if located.token == SqlToken::EOF {
            continue;
        }
        let start = starts[i];
        let end = starts.get(i + 1).copied().unwrap_or(sql.len());
        tokens.push(Token {
            kind: kind_of(&located.token),
            text: &sql[start..end],
            start,
            value: literal_value(located.token),
        });
    }
    Ok(tokens)
}

fn kind_of(token: &SqlToken) -> TokenKind {
    match token {
        SqlToken::Whitespace(Whitespace::SingleLineComment { .. } | Whitespace::MultiLineComment(_)) => {
            TokenKind::Comment
        }
        SqlToken::Whitespace(_) => TokenKind::Whitespace,
        SqlToken::Word(word) if word.quote_style.is_some() => TokenKind::QuotedIdent,
        SqlToken::Word(_) => TokenKind::Word,
        SqlToken::SingleQuotedString(_)
        | SqlToken::EscapedStringLiteral(_)
        | SqlToken::NationalStringLiteral(_)
        | SqlToken::HexStringLiteral(_)
        | SqlToken::DollarQuotedString(_) => TokenKind::StringLit,
        SqlToken::Number(..) => TokenKind::Number,
        SqlToken::Placeholder(_) => TokenKind::Placeholder,
        SqlToken::LParen => TokenKind::LParen,
        SqlToken::RParen => TokenKind::RParen,
        SqlToken::Comma => TokenKind::Comma,
        SqlToken::SemiColon => TokenKind::Semicolon,
        SqlToken::Period => TokenKind::Dot,
        SqlToken::Mul => TokenKind::Star,
        SqlToken::Char(_) => TokenKind::Other,
        _ => TokenKind::Operator,
    }
}

fn literal_value(token: SqlToken) -> Option<String> {
    match token {
        SqlToken::SingleQuotedString(value) | SqlToken::EscapedStringLiteral(value) => Some(value),
        _ => None,
    }
}

/// Maps the tokenizer's 1-based line/column (counted in chars) to byte offsets.
/// Lookups must be made in source order.
struct SourceCursor<'a> {
    chars: Peekable<CharIndices<'a>>,
    line: u64,
    column: u64,
    len: usize,
}

impl<'a> SourceCursor<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.char_indices().peekable(),
            line: 1,
            column: 1,
            len: source.len(),
        }
    }

    fn seek(&mut self, line: u64, column: u64) -> usize {
        while let Some(&(offset, ch)) = self.chars.peek() {
            if (self.line, self.column) >= (line, column) {
                return offset;
            }
            self.chars.next();
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        self.len
    }
}

/// Indices of non-trivia tokens.
pub fn significant(tokens: &[Token<'_>]) -> Vec<usize> {
    tokens
        .iter()
        .enumerate()
        .filter(|(_, t)| !t.is_trivia())
        .map(|(i, _)| i)
        .collect()
}

/// A pending text replacement over `[start, end)`; `start == end` inserts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

impl Edit {
    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self {
            start: at,
            end: at,
            text: text.into(),
        }
    }

    pub fn replace(start: usize, end: usize, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }
}

/// Apply non-overlapping edits. Inserts at the same offset keep their given order.
pub fn apply_edits(source: &str, mut edits: Vec<Edit>) -> String {
    if edits.is_empty() {
        return source.to_string();
    }
    edits.sort_by_key(|e| (e.start, e.end));

    let mut out = String::with_capacity(source.len() + edits.iter().map(|e| e.text.len()).sum::<usize>());
    let mut cursor = 0;
    for edit in edits {
        if edit.start < cursor {
            // overlapping edit; first one wins
            continue;
        }
        out.push_str(&source[cursor..edit.start]);
        out.push_str(&edit.text);
        cursor = edit.end;
    }
    out.push_str(&source[cursor..]);
    out
}
