//! Merges per-environment captures into one rendered report.
//!
//! Workers write raw client output into per-environment temporary capture
//! files; rendering parses every capture, unions the column sets and emits
//! one artifact. Capture files are removed once rendering has consumed
//! them, on success and failure alike.

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

use indexmap::IndexMap;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{EnvSqlError, Result};
use crate::parser::{self, ParsedTable};

/// Rendered report formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    /// Human-aligned text with an `env` column.
    #[default]
    Text,
    /// Comma-separated, header row `env,<columns...>`.
    Csv,
    /// Tab-separated, same shape as CSV.
    Txt,
    /// Pretty-printed object, environment name to row objects.
    Json,
    /// Same structure as JSON, YAML-encoded.
    Yaml,
}

impl ReportFormat {
    /// Whether this format consumes unaligned, tab-separated client output
    /// instead of the aligned table format.
    pub fn wants_unaligned(self) -> bool {
        matches!(self, Self::Json | Self::Yaml)
    }
}

impl FromStr for ReportFormat {
    type Err = EnvSqlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "csv" => Ok(Self::Csv),
            "txt" => Ok(Self::Txt),
            "json" => Ok(Self::Json),
            "yaml" => Ok(Self::Yaml),
            other => Err(EnvSqlError::configuration(format!(
                "unknown output format '{other}' (expected text, csv, txt, json or yaml)"
            ))),
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Csv => "csv",
            Self::Txt => "txt",
            Self::Json => "json",
            Self::Yaml => "yaml",
        };
        f.write_str(name)
    }
}

enum Capture {
    File(NamedTempFile),
    Parsed(ParsedTable),
}

/// Collects per-environment captures and renders the merged report.
///
/// Environments render in insertion order, which the orchestrator keeps
/// equal to input order regardless of completion order.
#[derive(Default)]
pub struct Aggregator {
    captures: Vec<(String, Capture)>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a capture file for one environment and returns its path.
    /// The file is exclusively owned by the writing worker until
    /// [`render`](Self::render) consumes it.
    pub fn capture_path(&mut self, env: &str) -> Result<PathBuf> {
        let file = NamedTempFile::with_prefix("envsql-")
            .map_err(|e| EnvSqlError::io("creating capture file", e))?;
        let path = file.path().to_path_buf();
        self.captures.push((env.to_string(), Capture::File(file)));
        Ok(path)
    }

    /// Adds an already-parsed table for one environment.
    pub fn insert_table(&mut self, env: &str, table: ParsedTable) {
        self.captures.push((env.to_string(), Capture::Parsed(table)));
    }

    pub fn is_empty(&self) -> bool {
        self.captures.is_empty()
    }

    /// Renders every collected capture in the given format. Capture files
    /// are deleted even when rendering fails.
    pub fn render(&mut self, format: ReportFormat, out: &mut dyn Write) -> Result<()> {
        // Draining first guarantees the temp files are dropped (and thus
        // removed) whatever happens below.
        let tables: Vec<(String, ParsedTable)> = self
            .captures
            .drain(..)
            .map(|(env, capture)| {
                let table = match capture {
                    Capture::Parsed(table) => table,
                    Capture::File(file) => match std::fs::read_to_string(file.path()) {
                        Ok(raw) => parser::parse(&raw),
                        // A missing or unreadable capture is an empty table.
                        Err(e) => {
                            warn!("capture for {env} unreadable: {e}");
                            ParsedTable::default()
                        }
                    },
                };
                (env, table)
            })
            .collect();

        match format {
            ReportFormat::Text => render_text(&tables, out),
            ReportFormat::Csv => render_delimited(&tables, ",", out),
            ReportFormat::Txt => render_delimited(&tables, "\t", out),
            ReportFormat::Json => render_json(&tables, out),
            ReportFormat::Yaml => render_yaml(&tables, out),
        }
    }
}

/// Ordered union of column names across tables, first-seen order.
fn column_union(tables: &[(String, ParsedTable)]) -> Vec<String> {
    let mut seen = IndexMap::new();
    for (_, table) in tables {
        for column in &table.columns {
            seen.entry(column.clone()).or_insert(());
        }
    }
    seen.into_keys().collect()
}

fn render_text(tables: &[(String, ParsedTable)], out: &mut dyn Write) -> Result<()> {
    let write_err = |e| EnvSqlError::io("writing report", e);

    let columns = column_union(tables);
    let env_width = tables
        .iter()
        .map(|(env, _)| env.len())
        .chain(std::iter::once("env".len()))
        .max()
        .unwrap_or(3);

    // Widths are recomputed over every environment's values; individual
    // tables may disagree once merged.
    let widths: Vec<usize> = columns
        .iter()
        .map(|column| {
            tables
                .iter()
                .flat_map(|(_, table)| &table.rows)
                .filter_map(|row| row.get(column))
                .map(String::len)
                .chain(std::iter::once(column.len()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let mut header = format!("{:env_width$}", "env");
    for (column, width) in columns.iter().zip(widths.iter().copied()) {
        header.push_str(" | ");
        header.push_str(&format!("{column:width$}"));
    }
    writeln!(out, "{header}").map_err(write_err)?;

    let mut separator = "-".repeat(env_width);
    for width in &widths {
        separator.push_str("-+-");
        separator.push_str(&"-".repeat(*width));
    }
    writeln!(out, "{separator}").map_err(write_err)?;

    for (env, table) in tables {
        if table.rows.is_empty() {
            writeln!(out, "{env:env_width$} | {}", table.status_or_placeholder())
                .map_err(write_err)?;
            continue;
        }
        for row in &table.rows {
            let mut line = format!("{env:env_width$}");
            for (column, width) in columns.iter().zip(widths.iter().copied()) {
                let value = row.get(column).map_or("", String::as_str);
                line.push_str(" | ");
                line.push_str(&format!("{value:width$}"));
            }
            writeln!(out, "{line}").map_err(write_err)?;
        }
    }
    Ok(())
}

fn render_delimited(
    tables: &[(String, ParsedTable)],
    delimiter: &str,
    out: &mut dyn Write,
) -> Result<()> {
    let write_err = |e| EnvSqlError::io("writing report", e);

    let columns = column_union(tables);
    let mut header = vec!["env".to_string()];
    header.extend(columns.iter().cloned());
    writeln!(out, "{}", header.join(delimiter)).map_err(write_err)?;

    for (env, table) in tables {
        for row in &table.rows {
            let mut fields = vec![env.as_str()];
            for column in &columns {
                fields.push(row.get(column).map_or("", String::as_str));
            }
            writeln!(out, "{}", fields.join(delimiter)).map_err(write_err)?;
        }
    }
    Ok(())
}

fn row_maps(tables: &[(String, ParsedTable)]) -> IndexMap<String, Vec<IndexMap<String, String>>> {
    tables
        .iter()
        .map(|(env, table)| (env.clone(), table.rows.clone()))
        .collect()
}

fn render_json(tables: &[(String, ParsedTable)], out: &mut dyn Write) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, &row_maps(tables)).map_err(|e| {
        EnvSqlError::Serialization {
            context: "rendering JSON report".to_string(),
            source: Box::new(e),
        }
    })?;
    writeln!(out).map_err(|e| EnvSqlError::io("writing report", e))
}

fn render_yaml(tables: &[(String, ParsedTable)], out: &mut dyn Write) -> Result<()> {
    serde_yaml::to_writer(out, &row_maps(tables)).map_err(|e| EnvSqlError::Serialization {
        context: "rendering YAML report".to_string(),
        source: Box::new(e),
    })
}
