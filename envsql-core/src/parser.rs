//! Parser for psql's human-aligned table output.
//!
//! Captured text either matches the tabular grammar (header line, dash
//! separator, data rows, `(N rows)` footer) or it does not; non-tabular
//! captures degrade to a single status message instead of an error.

use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;

/// Canonical placeholder for captures with no usable content.
pub const NO_DATA_PLACEHOLDER: &str = "(no data returned)";

const STATUS_MAX_LEN: usize = 50;

const SQL_EFFECT_VERBS: &[&str] = &[
    "UPDATE", "INSERT", "DELETE", "CREATE", "DROP", "ALTER", "SET", "GRANT", "REVOKE", "COPY",
    "BEGIN", "COMMIT", "ROLLBACK",
];

fn separator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^-+(\+-+)*$").unwrap())
}

fn row_count_footer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\(\d+ rows?\)$").unwrap())
}

/// Structured view of one environment's captured output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedTable {
    /// Column names in header order.
    pub columns: Vec<String>,
    /// Width of each column's dash run in the separator, by name.
    pub column_widths: IndexMap<String, usize>,
    /// Data rows; every row's key set equals `columns`.
    pub rows: Vec<IndexMap<String, String>>,
    /// Fallback message when the capture was not tabular.
    pub status: Option<String>,
}

impl ParsedTable {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.rows.is_empty() && self.status.is_none()
    }

    /// The status to show for an environment that produced no data rows.
    pub fn status_or_placeholder(&self) -> &str {
        self.status.as_deref().unwrap_or(NO_DATA_PLACEHOLDER)
    }
}

/// Parses one raw capture into a [`ParsedTable`].
///
/// Tabular captures yield columns, per-column widths and rows. Captures
/// without a separator line yield a status message: SQL effect tags like
/// `UPDATE 3` verbatim, "no relations" notices and long content as the
/// canonical placeholder, anything else short verbatim.
pub fn parse(raw: &str) -> ParsedTable {
    let lines: Vec<&str> = raw.lines().collect();

    let Some(header_idx) = lines.iter().position(|l| !l.trim().is_empty()) else {
        return ParsedTable::default();
    };

    let columns: Vec<String> = lines[header_idx]
        .split('|')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect();
    if columns.is_empty() {
        return ParsedTable::default();
    }

    let separator_idx = lines[header_idx + 1..]
        .iter()
        .position(|l| separator_re().is_match(l.trim()))
        .map(|offset| header_idx + 1 + offset);

    let Some(separator_idx) = separator_idx else {
        return ParsedTable {
            status: Some(status_message(&lines)),
            ..ParsedTable::default()
        };
    };

    let column_widths: IndexMap<String, usize> = columns
        .iter()
        .cloned()
        .zip(lines[separator_idx].trim().split('+').map(str::len))
        .collect();

    let mut rows = Vec::new();
    for line in &lines[separator_idx + 1..] {
        let trimmed = line.trim();
        if trimmed.is_empty()
            || row_count_footer_re().is_match(trimmed)
            || trimmed.starts_with("Time:")
        {
            break;
        }
        // Trailing empty fragments are kept so NULL cells hold their
        // column position.
        let values: Vec<String> = line.split('|').map(|f| f.trim().to_string()).collect();
        if values.len() != columns.len() {
            continue;
        }
        rows.push(columns.iter().cloned().zip(values).collect());
    }

    ParsedTable {
        columns,
        column_widths,
        rows,
        status: None,
    }
}

fn status_message(lines: &[&str]) -> String {
    let content = lines
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let upper = content.to_uppercase();
    if SQL_EFFECT_VERBS
        .iter()
        .any(|verb| upper.starts_with(verb))
    {
        return content;
    }
    if upper.contains("NO RELATIONS FOUND") {
        return NO_DATA_PLACEHOLDER.to_string();
    }
    if content.len() < STATUS_MAX_LEN {
        content
    } else {
        NO_DATA_PLACEHOLDER.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = " id | name \n----+------\n 1  | foo \n(1 row)\n";

    #[test]
    fn parses_simple_table() {
        let table = parse(SIMPLE);
        assert_eq!(table.columns, vec!["id", "name"]);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0]["id"], "1");
        assert_eq!(table.rows[0]["name"], "foo");
        assert_eq!(table.status, None);
    }

    #[test]
    fn widths_come_from_separator_dash_runs() {
        let table = parse(SIMPLE);
        assert_eq!(table.column_widths["id"], 4);
        assert_eq!(table.column_widths["name"], 6);
    }

    #[test]
    fn dml_tag_becomes_verbatim_status() {
        let table = parse("UPDATE 3\n");
        assert!(table.columns.is_empty());
        assert!(table.rows.is_empty());
        assert_eq!(table.status.as_deref(), Some("UPDATE 3"));
    }

    #[test]
    fn no_relations_becomes_placeholder() {
        let table = parse("No relations found.\n");
        assert_eq!(table.status.as_deref(), Some(NO_DATA_PLACEHOLDER));
    }

    #[test]
    fn long_non_tabular_content_becomes_placeholder() {
        let long = "x".repeat(80);
        let table = parse(&long);
        assert_eq!(table.status.as_deref(), Some(NO_DATA_PLACEHOLDER));
    }

    #[test]
    fn short_non_tabular_content_is_verbatim() {
        let table = parse("something odd\n");
        assert_eq!(table.status.as_deref(), Some("something odd"));
    }

    #[test]
    fn zero_row_table_keeps_columns() {
        let raw = " id | name \n----+------\n(0 rows)\n";
        let table = parse(raw);
        assert_eq!(table.columns, vec!["id", "name"]);
        assert!(table.rows.is_empty());
        assert_eq!(table.status, None);
    }

    #[test]
    fn trailing_null_cell_keeps_its_position() {
        let raw = " id | note \n----+------\n 1  | \n(1 row)\n";
        let table = parse(raw);
        assert_eq!(table.rows[0]["id"], "1");
        assert_eq!(table.rows[0]["note"], "");
    }

    #[test]
    fn mismatched_field_count_rows_are_dropped() {
        let raw = " id | name \n----+------\n 1  | foo \n garbage line without pipes\n 2  | bar \n";
        let table = parse(raw);
        // One pipe-less fragment yields a single field, which is dropped.
        assert_eq!(table.rows.len(), 2);
    }

    #[test]
    fn footer_and_timing_lines_stop_row_collection() {
        let raw = " id \n----\n 1 \nTime: 12.5 ms\n 2 \n";
        let table = parse(raw);
        assert_eq!(table.rows.len(), 1);
    }

    #[test]
    fn empty_input_is_empty_table() {
        assert!(parse("").is_empty());
        assert!(parse("\n  \n").is_empty());
    }

    #[test]
    fn parsing_is_idempotent() {
        assert_eq!(parse(SIMPLE), parse(SIMPLE));
    }
}
