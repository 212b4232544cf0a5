//! Drives per-environment units of work sequentially or in parallel.
//!
//! The orchestrator pre-scans the credential cache to find which
//! environments need a remote lookup, pings each distinct (space, region)
//! pair at most once per process, pre-authenticates before spawning
//! parallel workers, and isolates every per-environment failure at the
//! unit-of-work boundary. Only structural errors abort a run before work
//! starts.

pub mod platform;
pub mod psql;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::cache::CredentialCache;
use crate::context::{self, EnvironmentContext};
use crate::error::{EnvSqlError, Result};
pub use platform::{DATABASE_URL_SECRET, LotusClient, PingRegistry, PlatformClient};
pub use psql::{PsqlClient, SqlClient, SqlOperation};

/// How units of work are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One environment at a time, in input order.
    Sequential,
    /// Bounded worker pool. Zero workers means auto-detect parallelism.
    Parallel { workers: usize },
}

impl ExecutionMode {
    /// Pool size for this mode, never zero.
    pub fn effective_workers(self) -> usize {
        match self {
            Self::Sequential => 1,
            Self::Parallel { workers: 0 } => std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4),
            Self::Parallel { workers } => workers,
        }
    }

    pub fn is_parallel(self) -> bool {
        matches!(self, Self::Parallel { .. })
    }
}

/// Outcome of one environment's unit of work. Terminal; never retried.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub environment: String,
    pub success: bool,
    pub error: Option<String>,
}

impl ExecutionResult {
    fn succeeded(environment: &str) -> Self {
        Self {
            environment: environment.to_string(),
            success: true,
            error: None,
        }
    }

    fn failed(environment: &str, error: &EnvSqlError) -> Self {
        Self {
            environment: environment.to_string(),
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Callback invoked as units finish: (completed so far, total).
pub type ProgressFn = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Runs one logical SQL operation across many environments.
pub struct Orchestrator {
    cache: Arc<CredentialCache>,
    platform: Arc<dyn PlatformClient>,
    sql: Arc<dyn SqlClient>,
    pings: Arc<PingRegistry>,
    progress: Option<ProgressFn>,
}

impl Orchestrator {
    pub fn new(
        cache: Arc<CredentialCache>,
        platform: Arc<dyn PlatformClient>,
        sql: Arc<dyn SqlClient>,
        pings: Arc<PingRegistry>,
    ) -> Self {
        Self {
            cache,
            platform,
            sql,
            pings,
            progress: None,
        }
    }

    /// Installs a progress callback. The callback only ever reads the shared
    /// completed-counter value handed to it; it must not block.
    #[must_use]
    pub fn with_progress(mut self, progress: impl Fn(usize, usize) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Executes `operation` for every context, returning one result per
    /// environment in input order. Per-environment failures never abort
    /// sibling environments; only structural errors return `Err`.
    pub async fn run(
        &self,
        contexts: &[EnvironmentContext],
        mode: ExecutionMode,
        operation: &SqlOperation,
        extra_flags: &[&str],
    ) -> Result<Vec<ExecutionResult>> {
        if operation.is_interactive() && contexts.len() > 1 {
            return Err(EnvSqlError::structural(
                "an interactive session cannot target more than one environment",
            ));
        }
        if contexts.is_empty() {
            return Ok(Vec::new());
        }

        self.ping_uncached_pairs(contexts).await;

        if mode.is_parallel() {
            if let Err(e) = self.platform.preauthenticate().await {
                warn!("{e}");
            }
        }

        let total = contexts.len();
        let completed = AtomicUsize::new(0);

        let units = contexts.iter().enumerate().map(|(index, ctx)| {
            let completed = &completed;
            async move {
                let result = match self.run_one(ctx, operation, extra_flags).await {
                    Ok(()) => ExecutionResult::succeeded(&ctx.name),
                    Err(e) => ExecutionResult::failed(&ctx.name, &e),
                };
                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("[{done}/{total}] finished {}", ctx.name);
                if let Some(progress) = &self.progress {
                    progress(done, total);
                }
                (index, result)
            }
        });

        let mut indexed: Vec<(usize, ExecutionResult)> = match mode {
            ExecutionMode::Sequential => {
                let mut results = Vec::with_capacity(total);
                for unit in units {
                    results.push(unit.await);
                }
                results
            }
            ExecutionMode::Parallel { .. } => {
                stream::iter(units)
                    .buffer_unordered(mode.effective_workers())
                    .collect()
                    .await
            }
        };

        // The summary is presented in input order whatever the completion
        // order was.
        indexed.sort_by_key(|(index, _)| *index);
        Ok(indexed.into_iter().map(|(_, result)| result).collect())
    }

    /// Pings each distinct (space, region) pair that still needs a remote
    /// lookup, at most once per pair for the life of the registry. Failures
    /// are advisory.
    async fn ping_uncached_pairs(&self, contexts: &[EnvironmentContext]) {
        let mut pending = Vec::new();
        let mut seen = HashSet::new();
        for ctx in contexts {
            if self.cache.exists(&self.cache.key_for(ctx)) {
                continue;
            }
            let pair = (ctx.space.clone(), ctx.region.clone());
            if seen.insert(pair.clone()) && self.pings.claim(&pair.0, &pair.1) {
                pending.push(pair);
            }
        }

        let pings = pending.iter().map(|(space, region)| async move {
            if let Err(e) = self.platform.ping(space, region).await {
                warn!("{e}");
            }
        });
        futures::future::join_all(pings).await;
    }

    async fn run_one(
        &self,
        ctx: &EnvironmentContext,
        operation: &SqlOperation,
        extra_flags: &[&str],
    ) -> Result<()> {
        let url = self.resolve_url(ctx).await?;
        let url = connection_url(&url, ctx)?;
        self.sql.execute(&url, ctx, operation, extra_flags).await
    }

    /// Resolves the main database URL for one environment: cache hit if the
    /// entry is still a usable URL, otherwise a remote lookup whose result
    /// is written back to the cache.
    async fn resolve_url(&self, ctx: &EnvironmentContext) -> Result<String> {
        let key = self.cache.key_for(ctx);
        if let Some(cached) = self.cache.get(&key) {
            if url::Url::parse(&cached).is_ok() {
                debug!("cache hit for {}", ctx.name);
                return Ok(cached);
            }
            // An undecryptable or corrupt entry is a miss.
            warn!("discarding unusable cache entry for {}", ctx.name);
        }

        let url = self.platform.fetch_secret(DATABASE_URL_SECRET, ctx).await?;
        if let Err(e) = self.cache.set(&key, &url) {
            warn!("{e}");
        }
        Ok(url)
    }
}

/// Applies the connection mode's replica rewrite and the database-name
/// override to the cached main URL. A replica mode whose rewrite left the
/// URL unchanged is a hard failure for that environment.
fn connection_url(main_url: &str, ctx: &EnvironmentContext) -> Result<String> {
    let rewritten = ctx.mode.rewrite_url(main_url);
    if ctx.mode.requires_rewrite() && rewritten == main_url {
        return Err(EnvSqlError::execution_failed(
            &ctx.name,
            "replica connection URL is identical to the main database URL; the replica may not exist",
        ));
    }
    Ok(context::override_database_name(
        &rewritten,
        ctx.database.as_deref(),
    ))
}
