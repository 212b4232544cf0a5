//! End-to-end flow: an orchestrated run whose workers write psql-style
//! captures, parsed and merged into one rendered report.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use envsql_core::cache::backend::FileBackend;
use envsql_core::{
    Aggregator, ConnectMode, CredentialCache, EnvironmentContext, ExecutionMode, Orchestrator,
    OutputTarget, PingRegistry, PlatformClient, ReportFormat, Result, SqlClient, SqlOperation,
    derive_context, parse_env_spec,
};

struct StaticPlatform;

#[async_trait]
impl PlatformClient for StaticPlatform {
    async fn fetch_secret(&self, _name: &str, _ctx: &EnvironmentContext) -> Result<String> {
        Ok("postgres://app:pw@postgres-main.internal:5432/app".to_string())
    }

    async fn ping(&self, _space: &str, _region: &str) -> Result<()> {
        Ok(())
    }

    async fn preauthenticate(&self) -> Result<()> {
        Ok(())
    }
}

/// Stands in for psql: writes a canned aligned capture per environment.
struct CannedPsql;

#[async_trait]
impl SqlClient for CannedPsql {
    async fn execute(
        &self,
        _database_url: &str,
        ctx: &EnvironmentContext,
        _operation: &SqlOperation,
        _extra_flags: &[&str],
    ) -> Result<()> {
        let capture = match ctx.name.as_str() {
            "prod01" => " id | name \n----+------\n 1  | ada \n 2  | bell \n(2 rows)\n",
            "prod02" => "UPDATE 3\n",
            _ => "",
        };
        if let OutputTarget::Capture(path) = &ctx.output {
            std::fs::write(path, capture).unwrap();
        }
        Ok(())
    }
}

fn file_cache(dir: &std::path::Path) -> Arc<CredentialCache> {
    Arc::new(CredentialCache::with_backend(
        "db_url",
        Duration::from_secs(600),
        Box::new(FileBackend::open(dir).unwrap()),
        None,
    ))
}

#[tokio::test]
async fn parallel_group_run_renders_one_merged_report() {
    let cache_dir = tempfile::tempdir().unwrap();
    let mut aggregator = Aggregator::new();

    let base = envsql_core::BaseContext::default();
    let mut contexts = Vec::new();
    for spec in parse_env_spec("prod01,prod02") {
        let target = OutputTarget::Capture(aggregator.capture_path(&spec.name).unwrap());
        contexts.push(derive_context(&base, &spec, target));
    }
    assert_eq!(contexts[0].mode, ConnectMode::ReadWrite);

    let orchestrator = Orchestrator::new(
        file_cache(cache_dir.path()),
        Arc::new(StaticPlatform),
        Arc::new(CannedPsql),
        Arc::new(PingRegistry::new()),
    );
    let results = orchestrator
        .run(
            &contexts,
            ExecutionMode::Parallel { workers: 2 },
            &SqlOperation::Command("update users set active = true".to_string()),
            &[],
        )
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.success));

    let mut rendered = Vec::new();
    aggregator
        .render(ReportFormat::Text, &mut rendered)
        .unwrap();
    let rendered = String::from_utf8(rendered).unwrap();
    let lines: Vec<&str> = rendered.lines().collect();

    // Header, separator, two data rows for prod01, one status row for
    // prod02's DML result.
    assert_eq!(lines.len(), 5);
    assert!(lines[0].starts_with("env"));
    assert!(lines[2].starts_with("prod01") && lines[2].contains("ada"));
    assert!(lines[3].starts_with("prod01") && lines[3].contains("bell"));
    assert!(lines[4].starts_with("prod02") && lines[4].contains("UPDATE 3"));
}

#[tokio::test]
async fn second_run_is_served_from_the_cache() {
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = file_cache(cache_dir.path());

    let base = envsql_core::BaseContext::default();
    let spec = &parse_env_spec("staging-s101")[0];
    let ctx = derive_context(&base, spec, OutputTarget::Stdout);
    // Naming-convention defaults recovered from the environment name.
    assert_eq!(ctx.space, "prod");
    assert_eq!(ctx.region, "euc1");

    let orchestrator = Orchestrator::new(
        Arc::clone(&cache),
        Arc::new(StaticPlatform),
        Arc::new(CannedPsql),
        Arc::new(PingRegistry::new()),
    );
    let op = SqlOperation::Command("select 1".to_string());

    let first = orchestrator
        .run(
            &[ctx.clone()],
            ExecutionMode::Sequential,
            &op,
            &[],
        )
        .await
        .unwrap();
    assert!(first[0].success);

    // The looked-up URL is now cached under the composite key.
    let key = cache.key_for(&ctx);
    assert_eq!(
        cache.get(&key).as_deref(),
        Some("postgres://app:pw@postgres-main.internal:5432/app")
    );
}
