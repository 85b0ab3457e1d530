//! Batch splitting.
//!
//! Query text is cut into batches at `GO` separator lines. A separator line
//! holds nothing but `GO` (any case) and an optional repeat count:
//!
//! ```text
//! CREATE TABLE t (a INTEGER)
//! GO
//! INSERT INTO t VALUES (1)
//! GO 3
//! ```
//!
//! Separators inside `/* ... */` comments do not count.

use crate::batch::SelectionRange;

/// One batch cut from the query text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDefinition {
    /// Batch text, separator lines excluded.
    pub sql: String,
    /// Position of the batch text within the query text.
    pub selection: SelectionRange,
    /// Repeat count given on the closing separator.
    pub execution_count: Option<u32>,
}

/// Splits query text into batches.
///
/// Batches that contain only whitespace are dropped.
pub fn split_batches(text: &str) -> Vec<BatchDefinition> {
    let mut batches = Vec::new();
    let mut lines: Vec<&str> = Vec::new();
    let mut start_line = 0;
    let mut in_comment = false;

    for (index, line) in text.lines().enumerate() {
        if !in_comment && let Some(count) = parse_separator(line) {
            push_batch(&mut batches, &lines, start_line, count);
            lines.clear();
            start_line = index + 1;
            continue;
        }
        in_comment = scan_comments(line, in_comment);
        lines.push(line);
    }
    push_batch(&mut batches, &lines, start_line, None);

    batches
}

fn push_batch(
    batches: &mut Vec<BatchDefinition>,
    lines: &[&str],
    start_line: usize,
    execution_count: Option<u32>,
) {
    if lines.iter().all(|line| line.trim().is_empty()) {
        return;
    }
    let last = lines.len() - 1;
    batches.push(BatchDefinition {
        sql: lines.join("\n"),
        selection: SelectionRange {
            start_line: start_line as u32,
            start_column: 0,
            end_line: (start_line + last) as u32,
            end_column: lines[last].chars().count() as u32,
        },
        execution_count,
    });
}

/// Parses a separator line, returning its repeat count.
///
/// Returns `None` if the line is not a separator.
fn parse_separator(line: &str) -> Option<Option<u32>> {
    let mut tokens = line.split_whitespace();
    if !tokens.next()?.eq_ignore_ascii_case("go") {
        return None;
    }
    let count = match tokens.next() {
        None => None,
        Some(token) => match token.parse::<u32>() {
            Ok(count) if count > 0 => Some(count),
            _ => return None,
        },
    };
    if tokens.next().is_some() {
        return None;
    }
    Some(count)
}

/// Returns whether a block comment is still open after `line`.
///
/// Line comments and string literals are skipped.
fn scan_comments(line: &str, mut in_comment: bool) -> bool {
    let mut chars = line.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_comment {
            if c == '*' && chars.peek() == Some(&'/') {
                chars.next();
                in_comment = false;
            }
        } else if in_string {
            if c == '\'' {
                in_string = false;
            }
        } else {
            match c {
                '\'' => in_string = true,
                '-' if chars.peek() == Some(&'-') => break,
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    in_comment = true;
                }
                _ => {}
            }
        }
    }
    in_comment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqls(text: &str) -> Vec<String> {
        split_batches(text).into_iter().map(|b| b.sql).collect()
    }

    #[test]
    fn test_single_batch() {
        let batches = split_batches("SELECT 1; SELECT 2, 3");
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].sql, "SELECT 1; SELECT 2, 3");
        assert_eq!(batches[0].execution_count, None);
        assert_eq!(batches[0].selection.end_column, 21);
    }

    #[test]
    fn test_go_separates() {
        let batches = split_batches("SELECT 1\ngo\n\nSELECT 2\nSELECT 3\nGO");
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].sql, "SELECT 1");
        assert_eq!(batches[1].sql, "\nSELECT 2\nSELECT 3");
        assert_eq!(batches[1].selection.start_line, 2);
        assert_eq!(batches[1].selection.end_line, 4);
    }

    #[test]
    fn test_repeat_count() {
        let batches = split_batches("INSERT INTO t VALUES (1)\n  GO 3  \nSELECT 1");
        assert_eq!(batches[0].execution_count, Some(3));
        assert_eq!(batches[1].execution_count, None);
    }

    #[test]
    fn test_not_separators() {
        assert_eq!(sqls("SELECT 1 GO"), vec!["SELECT 1 GO"]);
        assert_eq!(sqls("GOTO label\nGO 0\nGO x"), vec!["GOTO label\nGO 0\nGO x"]);
    }

    #[test]
    fn test_separator_in_block_comment() {
        let text = "SELECT 1\n/* first\nGO\n*/\nSELECT 2\nGO\nSELECT 3";
        assert_eq!(
            sqls(text),
            vec!["SELECT 1\n/* first\nGO\n*/\nSELECT 2", "SELECT 3"]
        );
    }

    #[test]
    fn test_comment_markers_in_strings_and_line_comments() {
        let text = "SELECT '/*'\nGO\nSELECT 1 -- /*\nGO\nSELECT 2";
        assert_eq!(sqls(text), vec!["SELECT '/*'", "SELECT 1 -- /*", "SELECT 2"]);
    }

    #[test]
    fn test_empty_batches_dropped() {
        assert!(split_batches("").is_empty());
        assert!(split_batches("GO\n   \nGO\n").is_empty());
        let batches = split_batches("\nGO\nSELECT 1\nGO\n\n");
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].selection.start_line, 2);
    }
}
