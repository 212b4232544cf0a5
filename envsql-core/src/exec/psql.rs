//! SQL client invocation via the external `psql` binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::info;

use crate::context::{self, EnvironmentContext, OutputTarget};
use crate::error::{EnvSqlError, Result};
use crate::report::ReportFormat;

const RED: &str = "\x1b[0;31m";
const GREEN: &str = "\x1b[0;32m";
const RESET: &str = "\x1b[0m";

/// What to run against an environment's database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlOperation {
    /// Open an interactive session.
    Interactive,
    /// Run a literal SQL command.
    Command(String),
    /// Run the statements in a file.
    File(PathBuf),
}

impl SqlOperation {
    /// Classifies the positional CLI argument: absent means interactive, an
    /// existing file path runs as a script, anything else is a literal
    /// command.
    pub fn classify(arg: Option<&str>) -> Self {
        match arg {
            None => Self::Interactive,
            Some(value) if Path::new(value).is_file() => Self::File(PathBuf::from(value)),
            Some(value) => Self::Command(value.to_string()),
        }
    }

    pub fn is_interactive(&self) -> bool {
        matches!(self, Self::Interactive)
    }
}

fn sql_keyword_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?im)^\s*(SELECT|INSERT|UPDATE|DELETE|CREATE|DROP|ALTER|WITH|BEGIN|COMMIT|ROLLBACK)\b",
        )
        .expect("static regex")
    })
}

/// Crude keyword sniff rejecting files that clearly hold no SQL. Not a
/// parser.
pub fn validate_sql_file(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| EnvSqlError::io(format!("reading SQL file {}", path.display()), e))?;
    if sql_keyword_re().is_match(&content) {
        Ok(())
    } else {
        Err(EnvSqlError::structural(format!(
            "'{}' does not look like a SQL file",
            path.display()
        )))
    }
}

/// Extra psql flags for a report format: `-t -A` turns off alignment for
/// machine formats, with `,` as the field separator for CSV.
pub fn format_flags(format: ReportFormat) -> Vec<&'static str> {
    match format {
        ReportFormat::Csv => vec!["-t", "-A", "-F,"],
        ReportFormat::Txt | ReportFormat::Json | ReportFormat::Yaml => vec!["-t", "-A"],
        ReportFormat::Text => vec![],
    }
}

/// Executes one environment's SQL operation.
#[async_trait]
pub trait SqlClient: Send + Sync {
    /// Runs the operation against `database_url`, delivering output per the
    /// context's output target. `extra_flags` adjust the client's output
    /// formatting.
    async fn execute(
        &self,
        database_url: &str,
        ctx: &EnvironmentContext,
        operation: &SqlOperation,
        extra_flags: &[&str],
    ) -> Result<()>;
}

/// `psql` subprocess client.
#[derive(Debug, Default)]
pub struct PsqlClient;

impl PsqlClient {
    pub fn new() -> Self {
        Self
    }

    /// Colored prompt for interactive sessions: red for prod environments,
    /// green otherwise, with the replica tag when not read-write.
    fn prompt(ctx: &EnvironmentContext) -> String {
        let color = if ctx.name.to_ascii_lowercase().starts_with("prod") {
            RED
        } else {
            GREEN
        };
        format!("{color}{}{}:%/%R%#{RESET} ", ctx.name, ctx.mode.display_tag())
    }

    async fn run_interactive(database_url: &str, ctx: &EnvironmentContext) -> Result<()> {
        info!("connecting to {}", context::extract_hostname(database_url));
        let prompt = Self::prompt(ctx);
        let status = tokio::process::Command::new("psql")
            .arg(database_url)
            .arg(format!("--set=PROMPT1={prompt}"))
            .arg(format!("--set=PROMPT2={prompt}"))
            .status()
            .await
            .map_err(|e| EnvSqlError::execution_failed(&ctx.name, format!("failed to run psql: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(EnvSqlError::execution_failed(
                &ctx.name,
                format!("psql exited with {status}"),
            ))
        }
    }

    fn stdout_for(ctx: &EnvironmentContext) -> Result<Stdio> {
        match &ctx.output {
            OutputTarget::Stdout => Ok(Stdio::inherit()),
            OutputTarget::File(path) | OutputTarget::Capture(path) => {
                let file = std::fs::File::create(path).map_err(|e| {
                    EnvSqlError::io(format!("creating output file {}", path.display()), e)
                })?;
                Ok(Stdio::from(file))
            }
        }
    }
}

#[async_trait]
impl SqlClient for PsqlClient {
    async fn execute(
        &self,
        database_url: &str,
        ctx: &EnvironmentContext,
        operation: &SqlOperation,
        extra_flags: &[&str],
    ) -> Result<()> {
        let (selector, argument) = match operation {
            SqlOperation::Interactive => {
                return Self::run_interactive(database_url, ctx).await;
            }
            SqlOperation::Command(sql) => ("-c", sql.clone()),
            SqlOperation::File(path) => {
                validate_sql_file(path)?;
                ("-f", path.display().to_string())
            }
        };

        info!(
            environment = %ctx.name,
            "connecting to {}",
            context::extract_hostname(database_url)
        );

        let output = tokio::process::Command::new("psql")
            .arg("-d")
            .arg(database_url)
            .args(extra_flags)
            .arg(selector)
            .arg(&argument)
            .stdout(Self::stdout_for(ctx)?)
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| EnvSqlError::execution_failed(&ctx.name, format!("failed to run psql: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(EnvSqlError::execution_failed(
                &ctx.name,
                format!("psql exited with {}: {}", output.status, stderr.trim()),
            ))
        }
    }
}
