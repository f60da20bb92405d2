//! Statement-level checks: splitting, the read-only guard and dataset scoping.

use super::lexer::{significant, tokenize, Token, TokenKind};
use super::DATASET_COLUMN;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

lazy_static! {
    static ref UUID: Regex =
        Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}").unwrap();
}

/// Split on top-level `;`. Semicolons inside strings, identifiers and comments are
/// not terminators. Empty and comment-only pieces are dropped. Text that does not
/// tokenize is kept whole as a single statement.
pub fn split_statements(text: &str) -> Vec<String> {
    let tokens = match tokenize(text) {
        Ok(tokens) => tokens,
        Err(e) => {
            debug!(error = %e, "SQL did not tokenize, not split");
            let whole = text.trim();
            return if whole.is_empty() { Vec::new() } else { vec![whole.to_string()] };
        }
    };
    let mut statements = Vec::new();
    let mut start = 0;
    let mut has_content = false;

    for token in &tokens {
        match token.kind {
            TokenKind::Semicolon => {
                if has_content {
                    statements.push(text[start..token.start].trim().to_string());
                }
                start = token.end();
                has_content = false;
            }
            _ if !token.is_trivia() => has_content = true,
            _ => {}
        }
    }
    if has_content {
        statements.push(text[start..].trim().to_string());
    }
    statements
}

/// Join statements so that [`split_statements`] gives them back. A statement ending in
/// a line comment gets its terminator on the next line.
pub fn join_statements(statements: &[String]) -> String {
    statements
        .iter()
        .map(|statement| {
            let ends_in_line_comment = tokenize(statement)
                .ok()
                .and_then(|tokens| tokens.last().map(|t| t.is_line_comment()))
                .unwrap_or(false);
            if ends_in_line_comment {
                format!("{}\n", statement)
            } else {
                statement.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(";\n")
}

/// The first significant token must be `SELECT`.
pub fn is_read_only(statement: &str) -> bool {
    let Ok(tokens) = tokenize(statement) else {
        return false;
    };
    significant(&tokens)
        .first()
        .map_or(false, |&i| tokens[i].is_word("SELECT"))
}

/// True when the statement filters `file_id` by equality against `dataset_id`, in
/// either operand order and with or without a cast on the column.
pub fn is_scoped_to(statement: &str, dataset_id: &str) -> bool {
    let dataset_id = dataset_id.trim();
    if dataset_id.is_empty() {
        return false;
    }

    let Ok(tokens) = tokenize(statement) else {
        return false;
    };
    let sig: Vec<&Token<'_>> = significant(&tokens).into_iter().map(|i| &tokens[i]).collect();
    let is_column = |i: usize| sig.get(i).map_or(false, |t| t.is_word(DATASET_COLUMN));
    let is_target = |i: usize| {
        sig.get(i)
            .and_then(|t| t.string_value())
            .map_or(false, |v| v.trim().eq_ignore_ascii_case(dataset_id))
    };
    // Position just past an optional `::type` starting at `i`.
    let skip_cast = |i: usize| {
        if sig.get(i).map_or(false, |t| t.is_op("::")) && sig.get(i + 1).map_or(false, |t| t.kind == TokenKind::Word) {
            i + 2
        } else {
            i
        }
    };

    (0..sig.len()).any(|i| {
        if !sig[i].is_op("=") {
            return false;
        }
        // `[alias.]file_id [::type] = 'id' [::type]`
        let left_column = (1..=3).any(|back| {
            i.checked_sub(back)
                .map_or(false, |c| is_column(c) && skip_cast(c + 1) == i)
        });
        if left_column && is_target(i + 1) {
            return true;
        }
        // `'id' [::type] = [alias.]file_id`
        let left_target = (1..=3).any(|back| {
            i.checked_sub(back)
                .map_or(false, |c| is_target(c) && skip_cast(c + 1) == i)
        });
        let right_column = is_column(i + 1) || (sig.get(i + 2).map_or(false, |t| t.kind == TokenKind::Dot) && is_column(i + 3));
        left_target && right_column
    })
}

/// Dataset identifier embedded in a raw value (a UUID); otherwise the trimmed value.
pub fn extract_dataset_id(raw: &str) -> Option<String> {
    if let Some(found) = UUID.find(raw) {
        return Some(found.as_str().to_ascii_lowercase());
    }
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = "59037db4-f134-41d6-9cea-931d56278a38";

    #[test]
    fn test_split_ignores_quoted_semicolons() {
        let parts = split_statements("SELECT 'a;b' FROM t;\n  SELECT 2 ; -- trailing\n;");
        assert_eq!(parts, vec!["SELECT 'a;b' FROM t", "SELECT 2"]);
    }

    #[test]
    fn test_split_single_statement_without_terminator() {
        assert_eq!(split_statements("  SELECT 1  "), vec!["SELECT 1"]);
        assert!(split_statements(" ; ;").is_empty());
    }

    #[test]
    fn test_join_keeps_statements_apart_after_line_comment() {
        let statements = split_statements(
            "SELECT count(*) FROM csv_data WHERE file_id = 'x' -- total rows\n;\nSELECT 2 FROM csv_data",
        );
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], "SELECT count(*) FROM csv_data WHERE file_id = 'x' -- total rows");

        let joined = join_statements(&statements);
        assert_eq!(
            joined,
            "SELECT count(*) FROM csv_data WHERE file_id = 'x' -- total rows\n;\nSELECT 2 FROM csv_data"
        );
        assert_eq!(split_statements(&joined), statements);
        assert_eq!(join_statements(&["SELECT 1".to_string(), "SELECT 2".to_string()]), "SELECT 1;\nSELECT 2");
    }

    #[test]
    fn test_untokenizable_text_is_one_statement() {
        assert_eq!(split_statements(" SELECT 'a; b "), vec!["SELECT 'a; b"]);
        assert!(!is_read_only("SELECT 'oops"));
    }

    #[test]
    fn test_read_only_guard() {
        assert!(is_read_only("  -- note\n select row_data::json from csv_data"));
        assert!(!is_read_only("DELETE FROM csv_data"));
        assert!(!is_read_only("WITH x AS (DELETE FROM csv_data RETURNING *) SELECT * FROM x"));
        assert!(!is_read_only(""));
    }

    #[test]
    fn test_scoping_forms() {
        for sql in [
            format!("SELECT 1 FROM csv_data WHERE file_id = '{FILE}'"),
            format!("SELECT 1 FROM csv_data c WHERE c.file_id = '{FILE}'"),
            format!("SELECT 1 FROM csv_data WHERE file_id::text = '{FILE}'"),
            format!("SELECT 1 FROM csv_data WHERE file_id = '{FILE}'::uuid"),
            format!("SELECT 1 FROM csv_data WHERE '{FILE}' = file_id"),
        ] {
            assert!(is_scoped_to(&sql, FILE), "{sql}");
        }
    }

    #[test]
    fn test_unscoped_statements() {
        assert!(!is_scoped_to("SELECT row_data::json FROM csv_data", FILE));
        assert!(!is_scoped_to("SELECT 1 FROM csv_data WHERE file_id = 'other'", FILE));
        assert!(!is_scoped_to(&format!("SELECT '{FILE}' AS file_id FROM csv_data"), FILE));
    }

    #[test]
    fn test_extract_dataset_id() {
        assert_eq!(
            extract_dataset_id(&format!("uploads/{}.csv", FILE.to_uppercase())).as_deref(),
            Some(FILE)
        );
        assert_eq!(extract_dataset_id("  sales-2024 ").as_deref(), Some("sales-2024"));
        assert_eq!(extract_dataset_id("   "), None);
    }
}
