//! Query Normalizer
//!
//! Rewrites generated SQL so it satisfies the storage layer's wire-type contract:
//! the `row_data` document column is projected as `json`, sub-fields compared against
//! non-text values are cast, and network-address fields compare as `inet`.
//!
//! Every rule works on lexer tokens, never touches string literals or comments, and is
//! idempotent.

pub mod lexer;
pub mod statements;

pub use statements::*;

use crate::model::{NormalizedQuery, SchemaDescriptor};
use lazy_static::lazy_static;
use lexer::{apply_edits, significant, tokenize, Edit, Token, TokenKind};
use regex::Regex;
use tracing::debug;

pub const DOCUMENT_COLUMN: &str = "row_data";
pub const WIRE_TYPE: &str = "json";
pub const DATASET_COLUMN: &str = "file_id";
pub const NETWORK_CAST: &str = "inet";

const COMPARISON_OPS: &[&str] = &["=", "<>", "!=", "<", ">", "<=", ">="];

/// Keywords that end a SELECT projection list.
const PROJECTION_END: &[&str] = &[
    "FROM", "INTO", "WHERE", "GROUP", "HAVING", "ORDER", "LIMIT", "OFFSET", "UNION",
    "INTERSECT", "EXCEPT", "WINDOW", "FETCH", "FOR",
];

lazy_static! {
    static ref PLACEHOLDER_NAME: Regex = Regex::new(r"(?i)^[$:]?file_?id$").unwrap();
    static ref QUOTED_PLACEHOLDER: Regex = Regex::new(r"(?i)^\{\{\s*file_?id\s*\}\}$").unwrap();
}

/// Normalizer configured with the request's schema descriptor.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    schema: SchemaDescriptor,
    network_fields: Vec<String>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(schema: SchemaDescriptor) -> Self {
        Self {
            schema,
            network_fields: Vec::new(),
        }
    }

    /// Treat `field` as a network address in addition to the built-in name patterns.
    pub fn with_network_field(mut self, field: impl Into<String>) -> Self {
        self.network_fields.push(field.into());
        self
    }

    pub fn normalize(&self, query_text: &str, target_dataset_id: &str) -> NormalizedQuery {
        let text = resolve_dataset_placeholders(query_text, target_dataset_id);
        let text = expand_leading_select_star(&text);
        let text = cast_document_projections(&text, false);
        let text = self.cast_comparisons(&text);
        NormalizedQuery { text }
    }

    fn is_network_field(&self, field: &str) -> bool {
        let lower = field.to_ascii_lowercase();
        self.network_fields.iter().any(|f| f.eq_ignore_ascii_case(field))
            || matches!(lower.as_str(), "ip" | "ip_address" | "ipaddress" | "ip_addr" | "ipv4" | "ipv6")
            || lower.starts_with("ip_")
            || lower.ends_with("_ip")
    }

    /// Cast needed when `field` is compared: `inet` for network fields, otherwise the
    /// schema type's cast. `None` for text and unknown fields.
    fn comparison_cast(&self, field: &str) -> Option<&'static str> {
        if self.is_network_field(field) {
            return Some(NETWORK_CAST);
        }
        self.schema
            .get(field)
            .or_else(|| {
                self.schema
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(field))
                    .map(|(_, ty)| ty)
            })
            .and_then(|ty| ty.comparison_cast())
    }

    fn cast_comparisons(&self, sql: &str) -> String {
        rewrite(sql, |view| self.comparison_edits(view))
    }

    fn comparison_edits(&self, view: &SigView<'_, '_>) -> Vec<Edit> {
        let mut edits = Vec::new();

        for k in 0..view.len() {
            let Some(op) = view.get(k) else { continue };
            if op.kind != TokenKind::Operator || !COMPARISON_OPS.contains(&op.text) {
                continue;
            }

            let left = k.checked_sub(1).and_then(|q| view.extraction_ending_at(q));
            let right = view.extraction_starting_at(k + 1);

            let mut network = false;
            for ext in [&left, &right].into_iter().flatten() {
                let target = self.comparison_cast(&ext.field);
                network |= target == Some(NETWORK_CAST)
                    || ext.existing_cast().map_or(false, |c| c.eq_ignore_ascii_case(NETWORK_CAST));
                edits.extend(view.cast_edits(ext, target));
            }

            if network {
                if left.is_none() {
                    if let Some(lit) = k.checked_sub(1).and_then(|q| view.literal_ending_at(q)) {
                        edits.extend(view.literal_cast_edit(&lit, NETWORK_CAST));
                    }
                }
                if right.is_none() {
                    if let Some(lit) = view.literal_starting_at(k + 1) {
                        edits.extend(view.literal_cast_edit(&lit, NETWORK_CAST));
                    }
                }
            }
        }

        edits
    }
}

/// Normalize with no schema knowledge (document cast, `inet` casts, placeholders).
pub fn normalize(query_text: &str, target_dataset_id: &str) -> NormalizedQuery {
    Normalizer::new().normalize(query_text, target_dataset_id)
}

/// The repair rewrite: cast the document column to the wire type even where it is
/// already cast to something else or hidden behind `*`.
pub fn force_document_cast(sql: &str) -> String {
    cast_document_projections(sql, true)
}

/// Quote a value as a SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Replace `{{fileId}}`, a whole `'{{fileId}}'` literal, `:file_id` and `$file_id` with
/// the quoted dataset id. Placeholders inside other literals and comments are left alone.
pub fn resolve_dataset_placeholders(sql: &str, dataset_id: &str) -> String {
    let dataset_id = dataset_id.trim();
    if dataset_id.is_empty() {
        return sql.to_string();
    }
    let literal = quote_literal(dataset_id);
    rewrite(sql, |view| view.placeholder_edits(&literal))
}

/// Tokenize `sql` and apply the edits `rule` produces. Text that does not tokenize is
/// returned unchanged.
fn rewrite<F>(sql: &str, rule: F) -> String
where
    F: FnOnce(&SigView<'_, '_>) -> Vec<Edit>,
{
    match tokenize(sql) {
        Ok(tokens) => {
            let view = SigView::new(&tokens);
            apply_edits(sql, rule(&view))
        }
        Err(e) => {
            debug!(error = %e, "SQL did not tokenize, left unchanged");
            sql.to_string()
        }
    }
}

/// `SELECT * ...` at the start of a statement projects the document column instead.
fn expand_leading_select_star(sql: &str) -> String {
    rewrite(sql, |view| {
        let mut edits = Vec::new();
        let mut starts = vec![0];
        starts.extend((0..view.len()).filter(|&i| view.is(i, TokenKind::Semicolon)).map(|i| i + 1));

        for start in starts {
            let is_select = view.get(start).map_or(false, |t| t.is_word("SELECT"));
            if let (true, Some(star)) = (is_select, view.get(start + 1)) {
                if star.kind == TokenKind::Star {
                    edits.push(Edit::replace(star.start, star.end(), document_cast()));
                }
            }
        }
        edits
    })
}

fn document_cast() -> String {
    format!("{}::{}", DOCUMENT_COLUMN, WIRE_TYPE)
}

/// Cast bare `row_data` projection items to the wire type. With `force`, also
/// re-cast `row_data::<other>` and expand lone `*` items.
fn cast_document_projections(sql: &str, force: bool) -> String {
    rewrite(sql, |view| {
        let mut edits = Vec::new();
        for pos in 0..view.len() {
            if !view.get(pos).map_or(false, |t| t.is_word("SELECT")) {
                continue;
            }
            for (first, last) in view.projection_items(pos + 1) {
                edits.extend(view.document_item_edits(first, last, force));
            }
        }
        edits
    })
}

/// A `row_data->>'field'` extraction around a comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Extraction {
    /// Significant-token positions of the first and last token of the operand.
    first: usize,
    last: usize,
    /// Position of the field's string literal.
    field_pos: usize,
    field: String,
    form: ExtractionForm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ExtractionForm {
    /// `row_data->>'f'`
    Bare,
    /// `(row_data->>'f')` optionally followed by `::type`
    Parenthesized { close: usize, cast: Option<String> },
    /// `row_data->>'f'::type`, where the cast binds to the literal, not the value
    MisplacedCast(String),
}

impl Extraction {
    fn existing_cast(&self) -> Option<&str> {
        match &self.form {
            ExtractionForm::Bare => None,
            ExtractionForm::Parenthesized { cast, .. } => cast.as_deref(),
            ExtractionForm::MisplacedCast(cast) => Some(cast),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Literal {
    /// Position of the string token.
    pos: usize,
    has_cast: bool,
}

/// Significant-token view over a token stream.
struct SigView<'t, 'a> {
    tokens: &'t [Token<'a>],
    sig: Vec<usize>,
}

impl<'t, 'a> SigView<'t, 'a> {
    fn new(tokens: &'t [Token<'a>]) -> Self {
        Self {
            tokens,
            sig: significant(tokens),
        }
    }

    fn len(&self) -> usize {
        self.sig.len()
    }

    fn get(&self, pos: usize) -> Option<&'t Token<'a>> {
        self.sig.get(pos).map(|&i| &self.tokens[i])
    }

    fn is(&self, pos: usize, kind: TokenKind) -> bool {
        self.get(pos).map_or(false, |t| t.kind == kind)
    }

    fn is_op(&self, pos: usize, op: &str) -> bool {
        self.get(pos).map_or(false, |t| t.is_op(op))
    }

    fn is_name(&self, pos: usize) -> bool {
        self.get(pos)
            .map_or(false, |t| matches!(t.kind, TokenKind::Word | TokenKind::QuotedIdent))
    }

    fn placeholder_edits(&self, literal: &str) -> Vec<Edit> {
        let mut edits = Vec::new();
        let mut pos = 0;
        while let Some(token) = self.get(pos) {
            let last = match token.kind {
                TokenKind::StringLit
                    if token.string_value().map_or(false, |v| QUOTED_PLACEHOLDER.is_match(&v)) =>
                {
                    Some(pos)
                }
                TokenKind::Placeholder if PLACEHOLDER_NAME.is_match(token.text) => Some(pos),
                _ if token.text == ":" => self.colon_placeholder_end(pos),
                _ if token.text == "{" => self.braced_placeholder_end(pos),
                _ => None,
            };
            match last.and_then(|l| self.get(l).map(|end| (l, end))) {
                Some((l, end)) => {
                    edits.push(Edit::replace(token.start, end.end(), literal));
                    pos = l + 1;
                }
                None => pos += 1,
            }
        }
        edits
    }

    /// `:file_id` with nothing between the colon and the name.
    fn colon_placeholder_end(&self, pos: usize) -> Option<usize> {
        let colon = self.get(pos)?;
        let name = self.get(pos + 1)?;
        (name.kind == TokenKind::Word && name.start == colon.end() && PLACEHOLDER_NAME.is_match(name.text))
            .then_some(pos + 1)
    }

    /// `{{ fileId }}`
    fn braced_placeholder_end(&self, pos: usize) -> Option<usize> {
        let texts = (pos..pos + 5)
            .map(|i| self.get(i).map(|t| t.text))
            .collect::<Option<Vec<_>>>()?;
        let name = self.get(pos + 2)?;
        let braced = texts[0] == "{" && texts[1] == "{" && texts[3] == "}" && texts[4] == "}";
        (braced && name.kind == TokenKind::Word && PLACEHOLDER_NAME.is_match(name.text)).then_some(pos + 4)
    }

    fn is_document_column(&self, pos: usize) -> bool {
        self.get(pos).map_or(false, |t| t.is_word(DOCUMENT_COLUMN))
    }

    /// `row_data` or `alias.row_data` starting at `pos`; returns the position of `row_data`.
    fn document_ref_from(&self, pos: usize) -> Option<usize> {
        if self.is_document_column(pos) {
            return Some(pos);
        }
        if self.is_name(pos) && self.is(pos + 1, TokenKind::Dot) && self.is_document_column(pos + 2) {
            return Some(pos + 2);
        }
        None
    }

    /// `[alias.]row_data ->> 'f'` starting at `pos`; returns (field literal position, field).
    fn core_from(&self, pos: usize) -> Option<(usize, String)> {
        let column = self.document_ref_from(pos)?;
        if !self.is_op(column + 1, "->>") {
            return None;
        }
        let field = self.get(column + 2)?.string_value()?;
        Some((column + 2, field))
    }

    /// `[alias.]row_data ->> 'f'` ending at `pos`; returns (first position, field).
    fn core_ending_at(&self, pos: usize) -> Option<(usize, String)> {
        let field = self.get(pos)?.string_value()?;
        let column = pos.checked_sub(2)?;
        if !self.is_op(pos - 1, "->>") || !self.is_document_column(column) {
            return None;
        }
        let first = match column.checked_sub(2) {
            Some(q) if self.is(column - 1, TokenKind::Dot) && self.is_name(q) => q,
            _ => column,
        };
        Some((first, field))
    }

    /// An opening paren that groups rather than calls a function.
    fn is_grouping_paren(&self, pos: usize) -> bool {
        self.is(pos, TokenKind::LParen)
            && pos.checked_sub(1).map_or(true, |p| !self.is_name(p) || self.is_keyword_before_paren(p))
    }

    fn is_keyword_before_paren(&self, pos: usize) -> bool {
        self.get(pos).map_or(false, |t| {
            ["AND", "OR", "NOT", "WHERE", "ON", "WHEN", "THEN", "ELSE", "SELECT", "HAVING"]
                .iter()
                .any(|kw| t.is_word(kw))
        })
    }

    fn cast_after(&self, pos: usize) -> Option<String> {
        if self.is_op(pos + 1, "::") && self.is(pos + 2, TokenKind::Word) {
            return self.get(pos + 2).map(|t| t.text.to_string());
        }
        None
    }

    fn extraction_starting_at(&self, pos: usize) -> Option<Extraction> {
        if self.is_grouping_paren(pos) {
            let (field_pos, field) = self.core_from(pos + 1)?;
            let close = field_pos + 1;
            if !self.is(close, TokenKind::RParen) {
                return None;
            }
            let cast = self.cast_after(close);
            let last = if cast.is_some() { close + 2 } else { close };
            return Some(Extraction {
                first: pos,
                last,
                field_pos,
                field,
                form: ExtractionForm::Parenthesized { close, cast },
            });
        }

        let (field_pos, field) = self.core_from(pos)?;
        if self.is_op(field_pos + 1, "->") || self.is_op(field_pos + 1, "->>") {
            return None;
        }
        let (last, form) = match self.cast_after(field_pos) {
            Some(cast) => (field_pos + 2, ExtractionForm::MisplacedCast(cast)),
            None => (field_pos, ExtractionForm::Bare),
        };
        Some(Extraction {
            first: pos,
            last,
            field_pos,
            field,
            form,
        })
    }

    fn extraction_ending_at(&self, pos: usize) -> Option<Extraction> {
        // `... :: type`
        if self.is(pos, TokenKind::Word) && pos >= 2 && self.is_op(pos - 1, "::") {
            let cast = self.get(pos)?.text.to_string();
            let inner = pos - 2;
            if self.is(inner, TokenKind::RParen) {
                let (first, field) = self.core_ending_at(inner.checked_sub(1)?)?;
                let open = first.checked_sub(1)?;
                if !self.is_grouping_paren(open) {
                    return None;
                }
                return Some(Extraction {
                    first: open,
                    last: pos,
                    field_pos: inner - 1,
                    field,
                    form: ExtractionForm::Parenthesized {
                        close: inner,
                        cast: Some(cast),
                    },
                });
            }
            let (first, field) = self.core_ending_at(inner)?;
            return Some(Extraction {
                first,
                last: pos,
                field_pos: inner,
                field,
                form: ExtractionForm::MisplacedCast(cast),
            });
        }

        if self.is(pos, TokenKind::RParen) {
            let (first, field) = self.core_ending_at(pos.checked_sub(1)?)?;
            let open = first.checked_sub(1)?;
            if !self.is_grouping_paren(open) {
                return None;
            }
            return Some(Extraction {
                first: open,
                last: pos,
                field_pos: pos - 1,
                field,
                form: ExtractionForm::Parenthesized { close: pos, cast: None },
            });
        }

        let (first, field) = self.core_ending_at(pos)?;
        Some(Extraction {
            first,
            last: pos,
            field_pos: pos,
            field,
            form: ExtractionForm::Bare,
        })
    }

    fn literal_starting_at(&self, pos: usize) -> Option<Literal> {
        if !self.is(pos, TokenKind::StringLit) {
            return None;
        }
        Some(Literal {
            pos,
            has_cast: self.cast_after(pos).is_some(),
        })
    }

    fn literal_ending_at(&self, pos: usize) -> Option<Literal> {
        if self.is(pos, TokenKind::StringLit) {
            return Some(Literal { pos, has_cast: false });
        }
        if self.is(pos, TokenKind::Word) && pos >= 2 && self.is_op(pos - 1, "::") && self.is(pos - 2, TokenKind::StringLit) {
            return Some(Literal {
                pos: pos - 2,
                has_cast: true,
            });
        }
        None
    }

    fn literal_cast_edit(&self, literal: &Literal, cast: &str) -> Option<Edit> {
        if literal.has_cast {
            return None;
        }
        let token = self.get(literal.pos)?;
        Some(Edit::insert(token.end(), format!("::{}", cast)))
    }

    fn cast_edits(&self, ext: &Extraction, target: Option<&str>) -> Vec<Edit> {
        let (Some(first), Some(last)) = (self.get(ext.first), self.get(ext.last)) else {
            return Vec::new();
        };
        match (&ext.form, target) {
            (ExtractionForm::Bare, Some(cast)) => vec![
                Edit::insert(first.start, "("),
                Edit::insert(last.end(), format!(")::{}", cast)),
            ],
            (ExtractionForm::Parenthesized { close, cast: None }, Some(cast)) => self
                .get(*close)
                .map(|t| vec![Edit::insert(t.end(), format!("::{}", cast))])
                .unwrap_or_default(),
            (ExtractionForm::MisplacedCast(_), _) => match self.get(ext.field_pos) {
                Some(field) => vec![Edit::insert(first.start, "("), Edit::insert(field.end(), ")")],
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// Projection items of the SELECT whose list starts at `pos`, as inclusive
    /// (first, last) significant positions.
    fn projection_items(&self, mut pos: usize) -> Vec<(usize, usize)> {
        while self.get(pos).map_or(false, |t| t.is_word("DISTINCT") || t.is_word("ALL")) {
            pos += 1;
        }

        let mut items = Vec::new();
        let mut depth = 0usize;
        let mut item_start = pos;

        while let Some(token) = self.get(pos) {
            match token.kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen if depth == 0 => break,
                TokenKind::RParen => depth -= 1,
                TokenKind::Semicolon if depth == 0 => break,
                TokenKind::Comma if depth == 0 => {
                    if pos > item_start {
                        items.push((item_start, pos - 1));
                    }
                    item_start = pos + 1;
                }
                TokenKind::Word if depth == 0 && PROJECTION_END.iter().any(|kw| token.is_word(kw)) => break,
                _ => {}
            }
            pos += 1;
        }
        if pos > item_start {
            items.push((item_start, pos - 1));
        }
        items
    }

    fn document_item_edits(&self, first: usize, last: usize, force: bool) -> Option<Edit> {
        if force && first == last && self.is(first, TokenKind::Star) {
            let star = self.get(first)?;
            return Some(Edit::replace(star.start, star.end(), document_cast()));
        }

        let column = self.document_ref_from(first)?;
        let column_token = self.get(column)?;

        if self.is_alias_tail(column + 1, last) {
            return Some(Edit::insert(column_token.end(), format!("::{}", WIRE_TYPE)));
        }

        if force && self.is_op(column + 1, "::") && self.is_alias_tail(column + 3, last) {
            let ty = self.get(column + 2)?;
            if ty.kind == TokenKind::Word && !ty.text.eq_ignore_ascii_case(WIRE_TYPE) {
                return Some(Edit::replace(ty.start, ty.end(), WIRE_TYPE));
            }
        }
        None
    }

    /// Nothing, `alias`, or `AS alias` between `pos` and `last` inclusive.
    fn is_alias_tail(&self, pos: usize, last: usize) -> bool {
        if pos > last {
            return true;
        }
        if pos == last {
            return self.is_name(pos) && !self.get(pos).map_or(false, |t| t.is_word("AS"));
        }
        pos + 1 == last && self.get(pos).map_or(false, |t| t.is_word("AS")) && self.is_name(last)
    }
}
