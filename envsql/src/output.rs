//! Output file naming and the SQL comment trailer.
//!
//! Generated output files live under `~/tmp` and are named
//! `<yyyymmdd>_<env>_<NNNN>`, where the serial avoids clobbering earlier
//! runs. User-provided names get `_<env>_<NNNN>` inserted before the
//! extension. Aggregator capture files never pass through here.

use std::path::{Path, PathBuf};

use chrono::Local;
use envsql_core::error::{EnvSqlError, Result};

/// Marker for `-o` given without a file name.
pub const GENERATED_NAME: &str = "";

fn default_output_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tmp")
}

/// Resolves the output path for one environment's run: a generated name
/// under the default directory when no name was given, otherwise the
/// requested name with environment and serial inserted.
pub fn resolve_output_file(requested: &str, env: &str) -> Result<PathBuf> {
    if requested == GENERATED_NAME {
        let dir = default_output_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| EnvSqlError::io(format!("creating {}", dir.display()), e))?;
        let date = Local::now().format("%Y%m%d").to_string();
        Ok(generated_path(&dir, &date, env))
    } else {
        Ok(env_specific_path(Path::new(requested), env))
    }
}

fn generated_path(dir: &Path, date: &str, env: &str) -> PathBuf {
    let mut serial = 1u32;
    loop {
        let candidate = dir.join(format!("{date}_{env}_{serial:04}"));
        if !candidate.exists() {
            return candidate;
        }
        serial += 1;
    }
}

/// Inserts `_<env>_<NNNN>` before the requested file's extension, bumping
/// the serial past any existing files.
fn env_specific_path(requested: &Path, env: &str) -> PathBuf {
    let dir = requested.parent().unwrap_or_else(|| Path::new(""));
    let stem = requested
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = requested
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut serial = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}_{env}_{serial:04}{extension}"));
        if !candidate.exists() {
            return candidate;
        }
        serial += 1;
    }
}

/// Appends the executed SQL command to an output file as a comment, so the
/// file records what produced it.
pub fn append_sql_command(output: &Path, sql: &str) -> Result<()> {
    append_trailer(output, "SQL command", sql)
}

/// Appends an executed SQL file's content to an output file as a comment.
pub fn append_sql_file(output: &Path, sql_file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(sql_file)
        .map_err(|e| EnvSqlError::io(format!("reading {}", sql_file.display()), e))?;
    append_trailer(output, "SQL file content", content.trim_end())
}

fn append_trailer(output: &Path, label: &str, body: &str) -> Result<()> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(output)
        .map_err(|e| EnvSqlError::io(format!("opening {}", output.display()), e))?;
    writeln!(file, "/* {label}:\n{body}\n*/")
        .map_err(|e| EnvSqlError::io(format!("writing {}", output.display()), e))?;
    Ok(())
}
