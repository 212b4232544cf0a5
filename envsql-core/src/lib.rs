//! Core library for envsql.
//!
//! This crate provides the subsystems behind the `envsql` binary: the TTL
//! credential cache with pluggable backends and at-rest encryption, the
//! parser for the SQL client's aligned table output, the cross-environment
//! output aggregator, and the orchestrator that fans one operation out
//! across many environments.
//!
//! # Architecture
//! - Per-environment state lives in an immutable [`EnvironmentContext`],
//!   derived from base options plus a per-environment override
//! - External collaborators (secret lookup, pings, the SQL client) sit
//!   behind traits so the orchestrator can be tested without subprocesses
//! - Failures in one environment never abort its siblings; only structural
//!   errors end a run early

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod logging;
pub mod parser;
pub mod report;

// Re-export commonly used types
pub use cache::{CacheRegistry, CacheStats, CredentialCache, cache_key};
pub use config::{Config, GroupConfig, ValueSource};
pub use context::{
    BaseContext, ConnectMode, EnvOverride, EnvironmentContext, OutputTarget, derive_context,
    parse_env_spec,
};
pub use error::{EnvSqlError, Result, redact_database_url};
pub use exec::{
    ExecutionMode, ExecutionResult, LotusClient, Orchestrator, PingRegistry, PlatformClient,
    PsqlClient, SqlClient, SqlOperation,
};
pub use logging::init_logging;
pub use parser::ParsedTable;
pub use report::{Aggregator, ReportFormat};
