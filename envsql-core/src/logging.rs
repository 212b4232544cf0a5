//! Shared logging setup for the envsql binary.

use crate::Result;

/// Initializes structured logging based on verbosity level.
///
/// `verbose` counts `-v` flags (0=WARN, 1=INFO, 2=DEBUG, 3+=TRACE); `quiet`
/// drops everything below ERROR. The default is WARN so degradation notices
/// (cache fallback, ping failures) are visible without drowning table output.
pub fn init_logging(verbose: u8, quiet: bool) -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(level_for(verbose, quiet))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| {
            crate::error::EnvSqlError::configuration(format!("failed to initialize logging: {e}"))
        })?;

    Ok(())
}

fn level_for(verbose: u8, quiet: bool) -> tracing::Level {
    match (quiet, verbose) {
        (true, _) => tracing::Level::ERROR,
        (false, 0) => tracing::Level::WARN,
        (false, 1) => tracing::Level::INFO,
        (false, 2) => tracing::Level::DEBUG,
        (false, _) => tracing::Level::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Logging can only be initialized once per process, so only the level
    // mapping is exercised here.

    #[test]
    fn verbosity_levels() {
        assert_eq!(level_for(0, true), tracing::Level::ERROR);
        assert_eq!(level_for(3, true), tracing::Level::ERROR);
        assert_eq!(level_for(0, false), tracing::Level::WARN);
        assert_eq!(level_for(1, false), tracing::Level::INFO);
        assert_eq!(level_for(2, false), tracing::Level::DEBUG);
        assert_eq!(level_for(9, false), tracing::Level::TRACE);
    }
}
