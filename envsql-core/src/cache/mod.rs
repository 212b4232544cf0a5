//! TTL credential cache with pluggable backends and optional at-rest
//! encryption.
//!
//! One cache instance serves one (prefix, ttl) configuration; distinct
//! configurations never share state. The [`CacheRegistry`] owns the
//! instances for a run and hands out shared references, so the "singleton
//! per configuration" semantics hold without hidden globals.

pub mod backend;
pub mod encryption;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::EnvironmentContext;
use crate::error::Result;
use backend::{BackendKind, CacheBackend, FileBackend, RedisBackend};
use encryption::CacheCipher;

/// Environment variable pointing at a Redis store for the cache.
pub const ENV_REDIS_URL: &str = "REDIS_URL";

const KEY_NAMESPACE: &str = "envsql";

/// Builds the composite cache key for one credential.
///
/// Two contexts with identical composite fields resolve to the same key;
/// a differing cluster or application never collides because every field
/// is part of the joined composite.
pub fn cache_key(
    prefix: &str,
    space: &str,
    env: &str,
    region: &str,
    application: &str,
    cluster: Option<&str>,
) -> String {
    let mut composite = format!("{space}_{env}_{region}_{application}");
    if let Some(cluster) = cluster {
        composite.push('_');
        composite.push_str(cluster);
    }
    format!("{KEY_NAMESPACE}:{prefix}:{composite}")
}

/// Snapshot of one cache instance's configuration and contents.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub backend: BackendKind,
    pub prefix: String,
    pub total_entries: usize,
    pub ttl: Duration,
    pub encryption: String,
    pub location: String,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Backend:    {}", self.backend)?;
        writeln!(f, "Prefix:     {}", self.prefix)?;
        writeln!(f, "Entries:    {}", self.total_entries)?;
        writeln!(f, "TTL:        {}s", self.ttl.as_secs())?;
        writeln!(f, "Encryption: {}", self.encryption)?;
        write!(f, "Location:   {}", self.location)
    }
}

/// TTL key/value store for resolved database URLs.
pub struct CredentialCache {
    prefix: String,
    ttl: Duration,
    backend: Box<dyn CacheBackend>,
    cipher: Option<CacheCipher>,
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .field("backend", &self.backend.kind())
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

impl CredentialCache {
    /// Opens a cache for the given configuration: Redis when `REDIS_URL` is
    /// set and reachable, otherwise the file backend (with a warning on
    /// fallback). Legacy on-disk entries are migrated best-effort first.
    pub fn open(prefix: &str, ttl: Duration) -> Result<Self> {
        let cache_dir = Config::cache_dir();
        migrate_legacy_cache(&Config::legacy_cache_dir(), &cache_dir);

        let backend: Box<dyn CacheBackend> = match std::env::var(ENV_REDIS_URL) {
            Ok(url) if !url.is_empty() => match RedisBackend::connect(&url) {
                Ok(redis) => {
                    debug!("using Redis cache at {url}");
                    Box::new(redis)
                }
                Err(e) => {
                    warn!("{e}; falling back to file cache");
                    Box::new(FileBackend::open(&cache_dir)?)
                }
            },
            _ => Box::new(FileBackend::open(&cache_dir)?),
        };

        // Redis values stay plaintext; only the file backend encrypts.
        let cipher = match backend.kind() {
            BackendKind::File => CacheCipher::from_env(),
            BackendKind::Redis => None,
        };

        Ok(Self {
            prefix: prefix.to_string(),
            ttl,
            backend,
            cipher,
        })
    }

    /// Builds a cache with an explicit backend and cipher, for tests and
    /// embedding.
    pub fn with_backend(
        prefix: &str,
        ttl: Duration,
        backend: Box<dyn CacheBackend>,
        cipher: Option<CacheCipher>,
    ) -> Self {
        Self {
            prefix: prefix.to_string(),
            ttl,
            backend,
            cipher,
        }
    }

    /// The composite key for one environment context under this cache's
    /// prefix.
    pub fn key_for(&self, ctx: &EnvironmentContext) -> String {
        cache_key(
            &self.prefix,
            &ctx.space,
            &ctx.name,
            &ctx.region,
            &ctx.application,
            ctx.cluster.as_deref(),
        )
    }

    /// Fetches a value, decrypting if this cache encrypts at rest. A miss
    /// or any backend error returns `None` (errors are logged).
    pub fn get(&self, key: &str) -> Option<String> {
        match self.backend.get(key) {
            Ok(Some(value)) => Some(match &self.cipher {
                Some(cipher) => cipher.decrypt(&value),
                None => value,
            }),
            Ok(None) => None,
            Err(e) => {
                warn!("{e}");
                None
            }
        }
    }

    /// Stores a value under this cache's TTL. Encryption failure degrades
    /// to storing the plaintext with a warning.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let stored = match &self.cipher {
            Some(cipher) => match cipher.encrypt(value) {
                Ok(blob) => blob,
                Err(e) => {
                    warn!("{e}; storing value unencrypted");
                    value.to_string()
                }
            },
            None => value.to_string(),
        };
        self.backend.set(key, &stored, self.ttl)
    }

    /// Whether an unexpired entry exists for the key.
    pub fn exists(&self, key: &str) -> bool {
        match self.backend.exists(key) {
            Ok(present) => present,
            Err(e) => {
                warn!("{e}");
                false
            }
        }
    }

    /// Wipes the entire backing store.
    ///
    /// Caveat: this clears every entry in the backend, including entries
    /// written under other prefixes, not just the active prefix. This
    /// matches long-standing behavior and is relied upon by `cache clear`.
    pub fn clear(&self) -> Result<()> {
        self.backend.clear()
    }

    /// Reports backend, entry count under the active prefix, TTL and
    /// encryption status.
    pub fn stats(&self) -> Result<CacheStats> {
        let scan_prefix = format!("{KEY_NAMESPACE}:{}:", self.prefix);
        let encryption = match self.backend.kind() {
            BackendKind::Redis => "Not needed (Redis)".to_string(),
            BackendKind::File => {
                if self.cipher.is_some() {
                    "Enabled".to_string()
                } else {
                    format!("Disabled (set {})", encryption::ENV_CACHE_KEY)
                }
            }
        };
        Ok(CacheStats {
            backend: self.backend.kind(),
            prefix: self.prefix.clone(),
            total_entries: self.backend.count(&scan_prefix)?,
            ttl: self.ttl,
            encryption,
            location: self.backend.location(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Best-effort migration of a legacy cache directory into the current one.
/// Existing files are never clobbered; the old directory is removed only if
/// it ends up empty. All failures are logged, never fatal.
pub fn migrate_legacy_cache(legacy_dir: &Path, current_dir: &Path) {
    if legacy_dir == current_dir || !legacy_dir.is_dir() {
        return;
    }
    let Ok(entries) = std::fs::read_dir(legacy_dir) else {
        return;
    };
    if let Err(e) = std::fs::create_dir_all(current_dir) {
        warn!("cache migration skipped, cannot create {}: {e}", current_dir.display());
        return;
    }

    let mut migrated = 0usize;
    for entry in entries.flatten() {
        let source = entry.path();
        if !source.is_file() {
            continue;
        }
        let target = current_dir.join(entry.file_name());
        if target.exists() {
            continue;
        }
        match std::fs::copy(&source, &target) {
            Ok(_) => {
                let _ = std::fs::remove_file(&source);
                migrated += 1;
            }
            Err(e) => warn!("failed to migrate cache entry {}: {e}", source.display()),
        }
    }
    if migrated > 0 {
        info!("migrated {migrated} cache entries from {}", legacy_dir.display());
    }

    // Only remove the legacy directory when nothing is left behind.
    if let Ok(mut remaining) = std::fs::read_dir(legacy_dir) {
        if remaining.next().is_none() {
            if let Err(e) = std::fs::remove_dir(legacy_dir) {
                warn!("failed to remove legacy cache dir {}: {e}", legacy_dir.display());
            }
        }
    }
}

/// Registry of cache instances keyed by (prefix, ttl). Lazily creates one
/// instance per configuration; distinct configurations never share state.
#[derive(Default)]
pub struct CacheRegistry {
    instances: Mutex<HashMap<(String, u64), Arc<CredentialCache>>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cache instance for the effective (prefix, ttl) resolved
    /// through the configuration priority chain.
    pub fn instance(
        &self,
        config: &Config,
        explicit_prefix: Option<&str>,
        explicit_ttl_minutes: Option<u64>,
    ) -> Result<Arc<CredentialCache>> {
        let (prefix, _) = config.cache_prefix(explicit_prefix);
        let (ttl, _) = config.cache_ttl(explicit_ttl_minutes);

        let mut instances = self.instances.lock().expect("cache registry lock");
        if let Some(cache) = instances.get(&(prefix.clone(), ttl.as_secs())) {
            return Ok(Arc::clone(cache));
        }
        let cache = Arc::new(CredentialCache::open(&prefix, ttl)?);
        instances.insert((prefix, ttl.as_secs()), Arc::clone(&cache));
        Ok(cache)
    }

    /// Drops every instance (tests).
    pub fn reset(&self) {
        self.instances.lock().expect("cache registry lock").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_cache(dir: &Path, prefix: &str, ttl: Duration) -> CredentialCache {
        CredentialCache::with_backend(
            prefix,
            ttl,
            Box::new(FileBackend::open(dir).unwrap()),
            None,
        )
    }

    #[test]
    fn composite_key_format() {
        assert_eq!(
            cache_key("db_url", "prod", "prod01", "use1", "greenhouse", None),
            "envsql:db_url:prod_prod01_use1_greenhouse"
        );
        assert_eq!(
            cache_key("db_url", "prod", "prod01", "use1", "greenhouse", Some("c2")),
            "envsql:db_url:prod_prod01_use1_greenhouse_c2"
        );
    }

    #[test]
    fn differing_cluster_or_application_never_collides() {
        let with_cluster = cache_key("p", "s", "e", "r", "app", Some("c"));
        let without = cache_key("p", "s", "e", "r", "app", None);
        let other_app = cache_key("p", "s", "e", "r", "app2", None);
        assert_ne!(with_cluster, without);
        assert_ne!(other_app, without);
    }

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = file_cache(dir.path(), "db_url", Duration::from_secs(60));

        let key = cache_key("db_url", "prod", "p1", "use1", "app", None);
        cache.set(&key, "postgres://u@h/db").unwrap();
        assert!(cache.exists(&key));
        assert_eq!(cache.get(&key).as_deref(), Some("postgres://u@h/db"));
    }

    #[test]
    fn clear_makes_every_previous_key_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = file_cache(dir.path(), "db_url", Duration::from_secs(60));

        let keys: Vec<String> = (0..4)
            .map(|i| cache_key("db_url", "prod", &format!("env{i}"), "use1", "app", None))
            .collect();
        for key in &keys {
            cache.set(key, "value").unwrap();
        }
        cache.clear().unwrap();
        for key in &keys {
            assert_eq!(cache.get(key), None);
        }
    }

    #[test]
    fn clear_wipes_other_prefixes_too() {
        let dir = tempfile::tempdir().unwrap();
        let cache_a = file_cache(dir.path(), "a", Duration::from_secs(60));
        let cache_b = file_cache(dir.path(), "b", Duration::from_secs(60));

        cache_a.set(&cache_key("a", "s", "e", "r", "app", None), "v").unwrap();
        cache_b.set(&cache_key("b", "s", "e", "r", "app", None), "v").unwrap();

        // Documented caveat: clear() is store-wide, not prefix-scoped.
        cache_a.clear().unwrap();
        assert_eq!(cache_b.get(&cache_key("b", "s", "e", "r", "app", None)), None);
    }

    #[test]
    fn encrypted_round_trip_through_backend() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::with_backend(
            "db_url",
            Duration::from_secs(60),
            Box::new(FileBackend::open(dir.path()).unwrap()),
            Some(CacheCipher::new("passphrase")),
        );

        let key = cache_key("db_url", "prod", "p1", "use1", "app", None);
        cache.set(&key, "postgres://u:secret@h/db").unwrap();
        assert_eq!(cache.get(&key).as_deref(), Some("postgres://u:secret@h/db"));

        // The value on disk must not contain the plaintext.
        let raw = FileBackend::open(dir.path()).unwrap().get(&key).unwrap().unwrap();
        assert!(!raw.contains("secret"));
    }

    #[test]
    fn stats_reflect_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let cache = file_cache(dir.path(), "db_url", Duration::from_secs(600));

        cache.set(&cache_key("db_url", "s", "e", "r", "app", None), "v").unwrap();
        let stats = cache.stats().unwrap();
        assert_eq!(stats.backend, BackendKind::File);
        assert_eq!(stats.prefix, "db_url");
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.ttl, Duration::from_secs(600));
        assert!(stats.encryption.starts_with("Disabled"));
    }

    #[test]
    fn migration_copies_without_clobbering() {
        let legacy = tempfile::tempdir().unwrap();
        let current = tempfile::tempdir().unwrap();

        std::fs::write(legacy.path().join("moved"), "from-legacy").unwrap();
        std::fs::write(legacy.path().join("kept"), "legacy-version").unwrap();
        std::fs::write(current.path().join("kept"), "current-version").unwrap();

        migrate_legacy_cache(legacy.path(), current.path());

        assert_eq!(
            std::fs::read_to_string(current.path().join("moved")).unwrap(),
            "from-legacy"
        );
        assert_eq!(
            std::fs::read_to_string(current.path().join("kept")).unwrap(),
            "current-version"
        );
        // "kept" stayed behind in the legacy dir, so the dir must survive.
        assert!(legacy.path().exists());
    }
}
