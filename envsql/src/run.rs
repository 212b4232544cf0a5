//! Wires the CLI to the core subsystems: target resolution, orchestration,
//! aggregation and the end-of-run summary.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use envsql_core::error::{EnvSqlError, Result};
use envsql_core::exec::psql;
use envsql_core::{
    Aggregator, BaseContext, CacheRegistry, Config, ConnectMode, EnvOverride, EnvironmentContext,
    ExecutionMode, ExecutionResult, LotusClient, Orchestrator, OutputTarget, PingRegistry,
    PsqlClient, ReportFormat, SqlOperation, derive_context, parse_env_spec,
};
use tracing::info;

use crate::output;
use crate::{CacheCommand, Cli, Command, ConfigCommand};

/// Entry point after CLI parsing and logging setup.
pub async fn execute(cli: &Cli) -> Result<()> {
    let config = Config::load();
    let registry = CacheRegistry::new();

    match &cli.command {
        Some(Command::Cache { command }) => handle_cache(cli, &config, &registry, command),
        Some(Command::Config { command }) => handle_config(cli, &config, command),
        Some(Command::Groups) => {
            list_groups(&config);
            Ok(())
        }
        None => run_sql(cli, &config, &registry).await,
    }
}

async fn run_sql(cli: &Cli, config: &Config, registry: &CacheRegistry) -> Result<()> {
    // `-g list` is a long-standing shorthand for the groups subcommand.
    if cli.group.as_deref() == Some("list") {
        list_groups(config);
        return Ok(());
    }

    let operation = SqlOperation::classify(cli.sql.as_deref());
    let overrides = resolve_targets(cli, config)?;
    let multi = overrides.len() > 1;

    if cli.group.is_some() && operation.is_interactive() {
        return Err(EnvSqlError::structural(
            "interactive sessions are not supported for groups; provide a SQL command or file",
        ));
    }

    let aggregate = multi && !cli.no_agg && !operation.is_interactive();
    let format = effective_format(cli)?;
    let base = base_context(cli);

    let mut aggregator = Aggregator::new();
    let mut contexts = Vec::with_capacity(overrides.len());
    for spec in &overrides {
        let target = if aggregate {
            OutputTarget::Capture(aggregator.capture_path(&spec.name)?)
        } else if let Some(requested) = &cli.output {
            OutputTarget::File(output::resolve_output_file(requested, &spec.name)?)
        } else {
            OutputTarget::Stdout
        };
        contexts.push(derive_context(&base, spec, target));
    }

    if let Some(group) = &cli.group {
        let names: Vec<&str> = contexts.iter().map(|c| c.name.as_str()).collect();
        info!("executing for group '{group}': {}", names.join(", "));
    }

    // Captures stay in the client's aligned format; the aggregator parses
    // them and renders the requested format itself. Direct file or stdout
    // output hands the format flags to the client instead.
    let flags = if aggregate {
        Vec::new()
    } else {
        psql::format_flags(format)
    };

    let mode = execution_mode(cli, multi);
    let cache = registry.instance(config, cli.cache_prefix.as_deref(), cli.cache_ttl)?;
    let mut orchestrator = Orchestrator::new(
        cache,
        Arc::new(LotusClient::new()),
        Arc::new(PsqlClient::new()),
        Arc::new(PingRegistry::new()),
    );
    // One progress step per environment; per-environment output is not
    // interleaved unless it goes to stdout directly.
    if multi && !cli.global.quiet {
        orchestrator = orchestrator.with_progress(|done, total| {
            eprint!("\r[{done}/{total}]");
            let _ = std::io::stderr().flush();
        });
    }

    let results = orchestrator.run(&contexts, mode, &operation, &flags).await?;
    if multi && !cli.global.quiet {
        eprintln!();
    }

    append_trailers(&contexts, &results, &operation);

    if aggregate {
        render_aggregate(&mut aggregator, cli, format)?;
    }
    if multi {
        print_summary(&results);
    }
    Ok(())
}

/// Resolves the run's targets: a named group's members or an à la carte
/// environment spec.
fn resolve_targets(cli: &Cli, config: &Config) -> Result<Vec<EnvOverride>> {
    if cli.group.is_some() && cli.env.is_some() {
        return Err(EnvSqlError::structural(
            "use either --env or --group, not both",
        ));
    }

    if let Some(group) = &cli.group {
        let Some(environments) = config.group_environments(group) else {
            let available: Vec<String> = config.groups().keys().cloned().collect();
            return Err(EnvSqlError::structural(format!(
                "group '{group}' not found; available groups: {}",
                available.join(", ")
            )));
        };
        if environments.is_empty() {
            return Err(EnvSqlError::structural(format!(
                "group '{group}' has no environments"
            )));
        }
        return Ok(environments.iter().map(EnvOverride::named).collect());
    }

    if let Some(spec) = &cli.env {
        let overrides = parse_env_spec(spec);
        if overrides.is_empty() {
            return Err(EnvSqlError::structural("no environments specified"));
        }
        return Ok(overrides);
    }

    Err(EnvSqlError::structural(
        "specify a target with --env or --group",
    ))
}

fn base_context(cli: &Cli) -> BaseContext {
    BaseContext {
        space: cli.space.clone(),
        region: cli.region.clone(),
        application: cli.application.clone(),
        cluster: cli.cluster.clone(),
        mode: ConnectMode::parse(&cli.mode),
        database: cli.database.clone(),
    }
}

/// The report format: explicit flag first, then the output file extension,
/// then aligned text.
fn effective_format(cli: &Cli) -> Result<ReportFormat> {
    if let Some(format) = &cli.format {
        return format.parse();
    }
    if let Some(requested) = &cli.output {
        let format = match Path::new(requested)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .as_deref()
        {
            Some("csv") => ReportFormat::Csv,
            Some("json") => ReportFormat::Json,
            Some("yaml" | "yml") => ReportFormat::Yaml,
            Some("txt") => ReportFormat::Txt,
            _ => ReportFormat::Text,
        };
        return Ok(format);
    }
    Ok(ReportFormat::Text)
}

fn execution_mode(cli: &Cli, multi: bool) -> ExecutionMode {
    if !multi || cli.no_parallel {
        ExecutionMode::Sequential
    } else {
        ExecutionMode::Parallel {
            workers: cli.parallel.unwrap_or(0),
        }
    }
}

/// Records the executed SQL at the end of every user-visible output file.
/// Aggregator captures never get a trailer.
fn append_trailers(
    contexts: &[EnvironmentContext],
    results: &[ExecutionResult],
    operation: &SqlOperation,
) {
    for (ctx, result) in contexts.iter().zip(results) {
        if !result.success {
            continue;
        }
        let OutputTarget::File(path) = &ctx.output else {
            continue;
        };
        let appended = match operation {
            SqlOperation::Command(sql) => output::append_sql_command(path, sql),
            SqlOperation::File(sql_file) => output::append_sql_file(path, sql_file),
            SqlOperation::Interactive => Ok(()),
        };
        if let Err(e) = appended {
            tracing::warn!("{e}");
        }
    }
}

fn render_aggregate(aggregator: &mut Aggregator, cli: &Cli, format: ReportFormat) -> Result<()> {
    match &cli.output {
        Some(requested) => {
            let env_tag = cli.group.as_deref().unwrap_or("multi");
            let path = output::resolve_output_file(requested, env_tag)?;
            let mut file = std::fs::File::create(&path)
                .map_err(|e| EnvSqlError::io(format!("creating {}", path.display()), e))?;
            aggregator.render(format, &mut file)?;
            println!("Aggregated output written to {}", path.display());
            Ok(())
        }
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            aggregator.render(format, &mut lock)?;
            lock.flush().map_err(|e| EnvSqlError::io("flushing stdout", e))
        }
    }
}

fn print_summary(results: &[ExecutionResult]) {
    let successful: Vec<&ExecutionResult> = results.iter().filter(|r| r.success).collect();
    let failed: Vec<&ExecutionResult> = results.iter().filter(|r| !r.success).collect();

    println!("\n{}", "=".repeat(60));
    println!("EXECUTION SUMMARY");
    println!("{}", "=".repeat(60));
    println!("✓ Successful: {}", successful.len());
    for result in &successful {
        println!("  - {}", result.environment);
    }
    if !failed.is_empty() {
        println!("\n✗ Failed: {}", failed.len());
        for result in &failed {
            println!(
                "  - {}: {}",
                result.environment,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    println!("\nTotal environments processed: {}", results.len());
}

fn handle_cache(
    cli: &Cli,
    config: &Config,
    registry: &CacheRegistry,
    command: &CacheCommand,
) -> Result<()> {
    let cache = registry.instance(config, cli.cache_prefix.as_deref(), cli.cache_ttl)?;
    match command {
        CacheCommand::Clear => {
            cache.clear()?;
            println!("Cache cleared (all entries, every prefix).");
            Ok(())
        }
        CacheCommand::Stats => {
            println!("{}", cache.stats()?);
            Ok(())
        }
    }
}

fn handle_config(cli: &Cli, config: &Config, command: &ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let (prefix, prefix_source) = config.cache_prefix(cli.cache_prefix.as_deref());
            let (ttl, ttl_source) = config.cache_ttl(cli.cache_ttl);
            println!("Config file: {}", config.path().display());
            println!("File exists: {}", config.file_exists());
            println!("Cache prefix: {prefix} (from {prefix_source})");
            println!("Cache TTL: {}m (from {ttl_source})", ttl.as_secs() / 60);
            println!("Groups defined: {}", config.groups().len());
            Ok(())
        }
        ConfigCommand::Init => {
            let path = Config::config_path();
            Config::write_default(&path)?;
            println!("Wrote sample configuration to {}", path.display());
            Ok(())
        }
    }
}

fn list_groups(config: &Config) {
    let groups = config.groups();
    println!("Available groups:");
    println!("{}", "=".repeat(50));
    for (name, group) in &groups {
        println!("{name}:");
        println!(
            "  Description: {}",
            group.description.as_deref().unwrap_or("No description")
        );
        println!(
            "  Environments ({}): {}",
            group.environments.len(),
            group.environments.join(", ")
        );
        println!();
    }
}
