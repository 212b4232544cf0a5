//! Layered configuration: CLI argument > environment variable > config file
//! > built-in default.
//!
//! The config file lives at `~/.envsql/config.yml` and carries cache settings
//! (key prefix, TTL) and environment group definitions. A missing or broken
//! file is never fatal; envsql falls back to built-in defaults and logs a
//! warning.

use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EnvSqlError, Result};

/// Default cache key prefix.
pub const DEFAULT_CACHE_PREFIX: &str = "db_url";

/// Default cache TTL in minutes.
pub const DEFAULT_CACHE_TTL_MINUTES: u64 = 10;

/// Environment variable overriding the cache key prefix.
pub const ENV_CACHE_PREFIX: &str = "ENVSQL_CACHE_PREFIX";

/// Environment variable overriding the cache TTL (in minutes).
pub const ENV_CACHE_TTL: &str = "ENVSQL_CACHE_TTL";

/// Environment variable overriding the cache directory.
pub const ENV_CACHE_DIR: &str = "ENVSQL_CACHE_DIR";

/// One named group of environments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupConfig {
    /// Human-readable description shown by `envsql groups`.
    #[serde(default)]
    pub description: Option<String>,
    /// Member environment names, in execution order.
    #[serde(default)]
    pub environments: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheSection {
    #[serde(default)]
    prefix: Option<String>,
    #[serde(default)]
    ttl_minutes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    cache: CacheSection,
    #[serde(default)]
    groups: Option<IndexMap<String, GroupConfig>>,
}

/// Where an effective configuration value came from, for `config show`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    CliArgument,
    EnvironmentVariable,
    ConfigFile,
    Default,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CliArgument => "CLI argument",
            Self::EnvironmentVariable => "environment variable",
            Self::ConfigFile => "config file",
            Self::Default => "default",
        };
        f.write_str(s)
    }
}

/// Loaded configuration plus the path it came from.
#[derive(Debug, Clone)]
pub struct Config {
    file: ConfigFile,
    path: PathBuf,
    file_exists: bool,
}

impl Config {
    /// Loads configuration from the default path (`~/.envsql/config.yml`).
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Loads configuration from an explicit path. Parse failures degrade to
    /// the built-in defaults with a warning.
    pub fn load_from(path: &Path) -> Self {
        let file_exists = path.exists();
        let file = if file_exists {
            match std::fs::read_to_string(path) {
                Ok(raw) => match serde_yaml::from_str(&raw) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!("failed to parse config file {}: {e}", path.display());
                        ConfigFile::default()
                    }
                },
                Err(e) => {
                    warn!("failed to read config file {}: {e}", path.display());
                    ConfigFile::default()
                }
            }
        } else {
            ConfigFile::default()
        };

        Self {
            file,
            path: path.to_path_buf(),
            file_exists,
        }
    }

    /// Path of the config file this configuration was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the config file existed at load time.
    pub fn file_exists(&self) -> bool {
        self.file_exists
    }

    /// Default config file path: `~/.envsql/config.yml`.
    pub fn config_path() -> PathBuf {
        config_dir().join("config.yml")
    }

    /// Cache directory: `ENVSQL_CACHE_DIR` or `~/.envsql/cache`.
    pub fn cache_dir() -> PathBuf {
        match std::env::var(ENV_CACHE_DIR) {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => config_dir().join("cache"),
        }
    }

    /// Cache directory used by older releases, migrated on first use.
    pub fn legacy_cache_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".envsql_cache")
    }

    /// Resolves the effective cache prefix and its source.
    pub fn cache_prefix(&self, explicit: Option<&str>) -> (String, ValueSource) {
        if let Some(prefix) = explicit {
            return (prefix.to_string(), ValueSource::CliArgument);
        }
        if let Ok(prefix) = std::env::var(ENV_CACHE_PREFIX) {
            if !prefix.is_empty() {
                return (prefix, ValueSource::EnvironmentVariable);
            }
        }
        if let Some(prefix) = &self.file.cache.prefix {
            return (prefix.clone(), ValueSource::ConfigFile);
        }
        (DEFAULT_CACHE_PREFIX.to_string(), ValueSource::Default)
    }

    /// Resolves the effective cache TTL and its source. Explicit and
    /// environment values are given in minutes.
    pub fn cache_ttl(&self, explicit_minutes: Option<u64>) -> (Duration, ValueSource) {
        if let Some(minutes) = explicit_minutes {
            return (Duration::from_secs(minutes * 60), ValueSource::CliArgument);
        }
        if let Ok(raw) = std::env::var(ENV_CACHE_TTL) {
            if let Ok(minutes) = raw.parse::<u64>() {
                return (
                    Duration::from_secs(minutes * 60),
                    ValueSource::EnvironmentVariable,
                );
            }
        }
        if let Some(minutes) = self.file.cache.ttl_minutes {
            return (Duration::from_secs(minutes * 60), ValueSource::ConfigFile);
        }
        (
            Duration::from_secs(DEFAULT_CACHE_TTL_MINUTES * 60),
            ValueSource::Default,
        )
    }

    /// Returns the group definitions: the config file's groups when present,
    /// otherwise the built-in defaults.
    pub fn groups(&self) -> IndexMap<String, GroupConfig> {
        self.file.groups.clone().unwrap_or_else(default_groups)
    }

    /// Looks up the member environments of a named group.
    pub fn group_environments(&self, name: &str) -> Option<Vec<String>> {
        self.groups().get(name).map(|g| g.environments.clone())
    }

    /// Writes a commented sample config file if none exists yet.
    pub fn write_default(path: &Path) -> Result<()> {
        if path.exists() {
            return Err(EnvSqlError::configuration(format!(
                "config file already exists: {}",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EnvSqlError::io(format!("creating {}", parent.display()), e))?;
        }
        std::fs::write(path, sample_config())
            .map_err(|e| EnvSqlError::io(format!("writing {}", path.display()), e))?;
        Ok(())
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".envsql")
}

fn default_groups() -> IndexMap<String, GroupConfig> {
    let mut groups = IndexMap::new();
    let entries: [(&str, &str, &[&str]); 8] = [
        (
            "staging",
            "Staging environments",
            &["staging", "staging-s2", "staging-s3", "staging-s101", "staging-s201"],
        ),
        (
            "all-prod",
            "All production environments",
            &[
                "prod", "prod-s2", "prod-s3", "prod-s4", "prod-s5", "prod-s6", "prod-s7",
                "prod-s8", "prod-s9", "prod-s101", "prod-s201",
            ],
        ),
        (
            "us-prod",
            "All US production environments",
            &[
                "prod", "prod-s2", "prod-s3", "prod-s4", "prod-s5", "prod-s6", "prod-s7",
                "prod-s8", "prod-s9",
            ],
        ),
        ("eu-prod", "All EU production environments", &["prod-s101"]),
        (
            "apse-prod",
            "All AP Southeast production environments",
            &["prod-s201"],
        ),
        (
            "us-staging",
            "All US staging environments",
            &["staging", "staging-s2", "staging-s3"],
        ),
        ("eu-staging", "All EU staging environments", &["staging-s101"]),
        (
            "apse-staging",
            "All AP Southeast staging environments",
            &["staging-s201"],
        ),
    ];

    for (name, description, environments) in entries {
        groups.insert(
            name.to_string(),
            GroupConfig {
                description: Some(description.to_string()),
                environments: environments.iter().map(|s| (*s).to_string()).collect(),
            },
        );
    }
    groups
}

fn sample_config() -> String {
    let mut out = String::from(
        "# envsql configuration file\n\
         #\n\
         # Cache keys use the format: envsql:{prefix}:{space}_{env}_{region}_{app}\n\
         cache:\n\
         \x20 prefix: db_url\n\
         \x20 # How long database URLs are cached before a fresh lookup (minutes)\n\
         \x20 ttl_minutes: 10\n\
         \n\
         # Environment groups for batch operations\n\
         groups:\n",
    );
    for (name, group) in default_groups() {
        out.push_str(&format!("  {name}:\n"));
        if let Some(description) = &group.description {
            out.push_str(&format!("    description: {description}\n"));
        }
        out.push_str("    environments:\n");
        for env in &group.environments {
            out.push_str(&format!("      - {env}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_config() -> Config {
        Config {
            file: ConfigFile::default(),
            path: PathBuf::from("/nonexistent/config.yml"),
            file_exists: false,
        }
    }

    #[test]
    fn explicit_prefix_wins() {
        temp_env::with_var(ENV_CACHE_PREFIX, Some("from-env"), || {
            let config = empty_config();
            let (prefix, source) = config.cache_prefix(Some("explicit"));
            assert_eq!(prefix, "explicit");
            assert_eq!(source, ValueSource::CliArgument);
        });
    }

    #[test]
    fn env_var_beats_file_and_default() {
        temp_env::with_var(ENV_CACHE_PREFIX, Some("from-env"), || {
            let mut config = empty_config();
            config.file.cache.prefix = Some("from-file".to_string());
            let (prefix, source) = config.cache_prefix(None);
            assert_eq!(prefix, "from-env");
            assert_eq!(source, ValueSource::EnvironmentVariable);
        });
    }

    #[test]
    fn file_beats_default() {
        temp_env::with_var(ENV_CACHE_PREFIX, None::<&str>, || {
            let mut config = empty_config();
            config.file.cache.prefix = Some("from-file".to_string());
            let (prefix, source) = config.cache_prefix(None);
            assert_eq!(prefix, "from-file");
            assert_eq!(source, ValueSource::ConfigFile);
        });
    }

    #[test]
    fn default_prefix_and_ttl() {
        temp_env::with_vars(
            [(ENV_CACHE_PREFIX, None::<&str>), (ENV_CACHE_TTL, None)],
            || {
                let config = empty_config();
                let (prefix, source) = config.cache_prefix(None);
                assert_eq!(prefix, DEFAULT_CACHE_PREFIX);
                assert_eq!(source, ValueSource::Default);

                let (ttl, source) = config.cache_ttl(None);
                assert_eq!(ttl, Duration::from_secs(600));
                assert_eq!(source, ValueSource::Default);
            },
        );
    }

    #[test]
    fn ttl_env_var_is_minutes() {
        temp_env::with_var(ENV_CACHE_TTL, Some("20"), || {
            let config = empty_config();
            let (ttl, source) = config.cache_ttl(None);
            assert_eq!(ttl, Duration::from_secs(1200));
            assert_eq!(source, ValueSource::EnvironmentVariable);
        });
    }

    #[test]
    fn built_in_groups_available_without_file() {
        let config = empty_config();
        let envs = config.group_environments("us-staging").unwrap();
        assert_eq!(envs, vec!["staging", "staging-s2", "staging-s3"]);
        assert!(config.group_environments("no-such-group").is_none());
    }

    #[test]
    fn loads_groups_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(
            &path,
            "cache:\n  prefix: team_urls\n  ttl_minutes: 30\ngroups:\n  canary:\n    description: Canary\n    environments:\n      - prod-s2\n",
        )
        .unwrap();

        let config = Config::load_from(&path);
        assert!(config.file_exists());
        assert_eq!(
            config.group_environments("canary").unwrap(),
            vec!["prod-s2"]
        );
        // File-provided groups replace the built-ins entirely.
        assert!(config.group_environments("us-staging").is_none());

        temp_env::with_vars(
            [(ENV_CACHE_PREFIX, None::<&str>), (ENV_CACHE_TTL, None)],
            || {
                assert_eq!(config.cache_prefix(None).0, "team_urls");
                assert_eq!(config.cache_ttl(None).0, Duration::from_secs(1800));
            },
        );
    }

    #[test]
    fn broken_yaml_degrades_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, ": not yaml {{{{").unwrap();

        let config = Config::load_from(&path);
        assert!(config.group_environments("staging").is_some());
    }

    #[test]
    fn sample_config_round_trips() {
        let parsed: ConfigFile = serde_yaml::from_str(&sample_config()).unwrap();
        let groups = parsed.groups.unwrap();
        assert_eq!(groups.len(), 8);
        assert_eq!(parsed.cache.prefix.as_deref(), Some("db_url"));
        assert_eq!(parsed.cache.ttl_minutes, Some(10));
    }
}
