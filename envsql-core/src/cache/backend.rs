//! Pluggable cache storage backends.
//!
//! The file backend is the default: one file per URL-encoded key under the
//! cache directory, each holding a small JSON envelope with the value and an
//! absolute expiry. TTL is enforced by the backend itself, and expired
//! entries are swept eagerly when the backend is opened.
//!
//! The Redis backend is used when `REDIS_URL` is set and reachable; TTL is
//! delegated to the store. Any failure to connect falls back to the file
//! backend with a warning (handled by the cache constructor, not here).

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redis::Commands;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EnvSqlError, Result};

/// Which kind of store is behind a cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    File,
    Redis,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => f.write_str("File"),
            Self::Redis => f.write_str("Redis"),
        }
    }
}

/// Storage operations a cache backend must provide. Implementations must be
/// safe for concurrent use by multiple workers.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    fn exists(&self, key: &str) -> Result<bool>;
    /// Wipes the entire store, not just one prefix.
    fn clear(&self) -> Result<()>;
    /// Counts entries whose key starts with `prefix`.
    fn count(&self, prefix: &str) -> Result<usize>;
    fn kind(&self) -> BackendKind;
    fn location(&self) -> String;
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    expires_at: u64,
    value: String,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// File-per-key store with self-enforced TTL.
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Opens (creating if needed) the backing directory and sweeps expired
    /// entries by touching every key file once.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| EnvSqlError::io(format!("creating cache dir {}", dir.display()), e))?;
        let backend = Self {
            dir: dir.to_path_buf(),
        };
        backend.sweep_expired();
        Ok(backend)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let encoded: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();
        self.dir.join(encoded)
    }

    fn decode_file_name(name: &str) -> String {
        url::form_urlencoded::parse(name.as_bytes())
            .map(|(k, v)| {
                if v.is_empty() {
                    k.into_owned()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect()
    }

    fn read_envelope(&self, path: &Path) -> Option<Envelope> {
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Removes every expired entry. Failures are logged, never fatal.
    fn sweep_expired(&self) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        let now = unix_now();
        let mut removed = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let expired = match self.read_envelope(&path) {
                Some(envelope) => envelope.expires_at <= now,
                // Unreadable entries are treated as garbage.
                None => true,
            };
            if expired {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("failed to remove expired cache entry {}: {e}", path.display());
                } else {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!("swept {removed} expired cache entries from {}", self.dir.display());
        }
    }
}

impl CacheBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        let Some(envelope) = self.read_envelope(&path) else {
            return Ok(None);
        };
        if envelope.expires_at <= unix_now() {
            let _ = std::fs::remove_file(&path);
            return Ok(None);
        }
        Ok(Some(envelope.value))
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let envelope = Envelope {
            expires_at: unix_now().saturating_add(ttl.as_secs()),
            value: value.to_string(),
        };
        let raw = serde_json::to_string(&envelope).map_err(|e| EnvSqlError::Serialization {
            context: "cache envelope".to_string(),
            source: Box::new(e),
        })?;
        let path = self.path_for(key);
        std::fs::write(&path, raw)
            .map_err(|e| EnvSqlError::io(format!("writing cache entry {}", path.display()), e))?;
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn clear(&self) -> Result<()> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| EnvSqlError::io(format!("reading cache dir {}", self.dir.display()), e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                std::fs::remove_file(&path).map_err(|e| {
                    EnvSqlError::io(format!("removing cache entry {}", path.display()), e)
                })?;
            }
        }
        Ok(())
    }

    fn count(&self, prefix: &str) -> Result<usize> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| EnvSqlError::io(format!("reading cache dir {}", self.dir.display()), e))?;
        let count = entries
            .flatten()
            .filter(|entry| entry.path().is_file())
            .filter(|entry| {
                let name = entry.file_name();
                let decoded = Self::decode_file_name(&name.to_string_lossy());
                decoded.starts_with(prefix)
            })
            .count();
        Ok(count)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }
}

/// Redis-backed store using the store's native TTL.
pub struct RedisBackend {
    connection: Mutex<redis::Connection>,
    url: String,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend").field("url", &self.url).finish()
    }
}

impl RedisBackend {
    /// Connects to the configured Redis instance. Errors here mean the
    /// caller should fall back to the file backend.
    pub fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| EnvSqlError::cache_degraded("invalid REDIS_URL", e))?;
        let connection = client
            .get_connection()
            .map_err(|e| EnvSqlError::cache_degraded("failed to connect to Redis", e))?;
        Ok(Self {
            connection: Mutex::new(connection),
            url: url.to_string(),
        })
    }
}

impl CacheBackend for RedisBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut con = self.connection.lock().expect("redis connection lock");
        con.get(key)
            .map_err(|e| EnvSqlError::cache_degraded("redis GET failed", e))
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut con = self.connection.lock().expect("redis connection lock");
        con.set_ex::<_, _, ()>(key, value, ttl.as_secs())
            .map_err(|e| EnvSqlError::cache_degraded("redis SETEX failed", e))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let mut con = self.connection.lock().expect("redis connection lock");
        con.exists(key)
            .map_err(|e| EnvSqlError::cache_degraded("redis EXISTS failed", e))
    }

    fn clear(&self) -> Result<()> {
        let mut con = self.connection.lock().expect("redis connection lock");
        redis::cmd("FLUSHDB")
            .query::<()>(&mut *con)
            .map_err(|e| EnvSqlError::cache_degraded("redis FLUSHDB failed", e))
    }

    fn count(&self, prefix: &str) -> Result<usize> {
        let mut con = self.connection.lock().expect("redis connection lock");
        let keys: Vec<String> = con
            .keys(format!("{prefix}*"))
            .map_err(|e| EnvSqlError::cache_degraded("redis KEYS failed", e))?;
        Ok(keys.len())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    fn location(&self) -> String {
        self.url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_backend_set_get_exists() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();

        backend
            .set("envsql:db_url:prod_p1_use1_app", "postgres://x", Duration::from_secs(60))
            .unwrap();
        assert!(backend.exists("envsql:db_url:prod_p1_use1_app").unwrap());
        assert_eq!(
            backend.get("envsql:db_url:prod_p1_use1_app").unwrap().as_deref(),
            Some("postgres://x")
        );
        assert_eq!(backend.get("envsql:db_url:missing").unwrap(), None);
    }

    #[test]
    fn expired_entry_is_a_miss_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();

        backend.set("k", "v", Duration::ZERO).unwrap();
        assert_eq!(backend.get("k").unwrap(), None);
        assert!(!backend.exists("k").unwrap());
        assert_eq!(backend.count("").unwrap(), 0);
    }

    #[test]
    fn open_sweeps_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = FileBackend::open(dir.path()).unwrap();
            backend.set("stale", "v", Duration::ZERO).unwrap();
            backend.set("fresh", "v", Duration::from_secs(300)).unwrap();
        }
        // Re-opening sweeps the expired file from disk eagerly.
        let _backend = FileBackend::open(dir.path()).unwrap();
        let remaining: Vec<_> = std::fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn clear_wipes_every_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();

        backend.set("envsql:a:k1", "v", Duration::from_secs(60)).unwrap();
        backend.set("envsql:b:k2", "v", Duration::from_secs(60)).unwrap();
        backend.clear().unwrap();
        assert_eq!(backend.count("").unwrap(), 0);
    }

    #[test]
    fn count_filters_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();

        backend.set("envsql:one:k", "v", Duration::from_secs(60)).unwrap();
        backend.set("envsql:one:k2", "v", Duration::from_secs(60)).unwrap();
        backend.set("envsql:two:k", "v", Duration::from_secs(60)).unwrap();
        assert_eq!(backend.count("envsql:one:").unwrap(), 2);
        assert_eq!(backend.count("envsql:two:").unwrap(), 1);
    }

    #[test]
    fn keys_with_special_characters_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();

        let key = "envsql:db_url:prod_env/one_use1_app";
        backend.set(key, "v", Duration::from_secs(60)).unwrap();
        assert_eq!(backend.get(key).unwrap().as_deref(), Some("v"));
        assert_eq!(backend.count("envsql:db_url:").unwrap(), 1);
    }
}
