//! Platform collaborators: secret lookup, reachability pings and
//! authentication, all shelled out to the `lotus` CLI.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::context::EnvironmentContext;
use crate::error::{EnvSqlError, Result};

/// Secret name every database credential is looked up under.
pub const DATABASE_URL_SECRET: &str = "DATABASE_MAIN_URL";

/// Remote platform operations a run depends on. Implemented by
/// [`LotusClient`] in production and by in-memory fakes in tests.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Fetches a named secret for one environment's coordinates. Non-zero
    /// exit or a missing/malformed value line is a hard failure for that
    /// environment.
    async fn fetch_secret(&self, name: &str, ctx: &EnvironmentContext) -> Result<String>;

    /// Reachability check for one (space, region) pair. Advisory only.
    async fn ping(&self, space: &str, region: &str) -> Result<()>;

    /// One shared authentication handshake, performed before spawning
    /// parallel workers so they cannot each trigger an interactive prompt.
    async fn preauthenticate(&self) -> Result<()>;
}

/// Platform client backed by the `lotus` CLI.
#[derive(Debug, Default)]
pub struct LotusClient;

impl LotusClient {
    pub fn new() -> Self {
        Self
    }

    async fn run_lotus(args: &[&str]) -> std::io::Result<std::process::Output> {
        tokio::process::Command::new("lotus")
            .args(args)
            .output()
            .await
    }
}

#[async_trait]
impl PlatformClient for LotusClient {
    async fn fetch_secret(&self, name: &str, ctx: &EnvironmentContext) -> Result<String> {
        let mut args = vec![
            "secret", "get", name,
            "-s", ctx.space.as_str(),
            "-e", ctx.name.as_str(),
            "-r", ctx.region.as_str(),
            "-a", ctx.application.as_str(),
        ];
        if let Some(cluster) = &ctx.cluster {
            args.push("-c");
            args.push(cluster.as_str());
        }
        debug!("lotus {}", args.join(" "));
        let output = Self::run_lotus(&args)
            .await
            .map_err(|e| EnvSqlError::lookup_failed(&ctx.name, format!("failed to run lotus: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EnvSqlError::lookup_failed(
                &ctx.name,
                format!("lotus secret get failed: {}", stderr.trim()),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_secret_value(&stdout, name).ok_or_else(|| {
            EnvSqlError::lookup_failed(&ctx.name, format!("no {name} value in lotus output"))
        })
    }

    async fn ping(&self, space: &str, region: &str) -> Result<()> {
        let output = Self::run_lotus(&["ping", "-s", space, "-r", region])
            .await
            .map_err(|e| EnvSqlError::cache_unavailable(format!("failed to run lotus ping: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(EnvSqlError::cache_unavailable(format!(
                "lotus ping failed for {space}/{region}"
            )))
        }
    }

    async fn preauthenticate(&self) -> Result<()> {
        let output = Self::run_lotus(&["auth", "ensure"])
            .await
            .map_err(|e| EnvSqlError::cache_unavailable(format!("failed to run lotus auth: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(EnvSqlError::cache_unavailable(
                "lotus auth ensure failed; parallel workers may each prompt for authentication",
            ))
        }
    }
}

/// Extracts a secret's value from collaborator stdout: a line of either
/// `NAME=value` or `NAME: value`. Returns `None` when absent or empty.
pub fn parse_secret_value(stdout: &str, name: &str) -> Option<String> {
    for line in stdout.lines() {
        let line = line.trim();
        let value = line
            .strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('=').or_else(|| rest.strip_prefix(':')))
            .map(str::trim);
        if let Some(value) = value {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Set of (space, region) pairs already pinged in this run.
///
/// Owned by the orchestrator's top-level run and shared by reference with
/// workers; the lock covers the check-and-insert so a pair claimed by one
/// worker is skipped by every other worker racing for it.
#[derive(Debug, Default)]
pub struct PingRegistry {
    pinged: Mutex<HashSet<(String, String)>>,
}

impl PingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a (space, region) pair. Returns true when the caller is the
    /// one that should perform the ping.
    pub fn claim(&self, space: &str, region: &str) -> bool {
        self.pinged
            .lock()
            .expect("ping registry lock")
            .insert((space.to_string(), region.to_string()))
    }

    /// Forgets every claimed pair (tests).
    pub fn reset(&self) {
        self.pinged.lock().expect("ping registry lock").clear();
    }
}
