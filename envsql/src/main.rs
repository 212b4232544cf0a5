//! Run SQL against one or many named environments.
//!
//! envsql resolves each environment's database URL through a TTL credential
//! cache backed by the platform's secret store, shells out to psql, and
//! merges multi-environment results into one report.

mod output;
mod run;

use clap::{Args, Parser, Subcommand};
use envsql_core::{context::DEFAULT_APPLICATION, init_logging};
use tracing::error;

#[derive(Parser)]
#[command(name = "envsql")]
#[command(about = "Run SQL against one or many named environments")]
#[command(version)]
#[command(long_about = "
envsql - SQL across environments with cached credential lookup

Resolves each target environment's database URL through the platform secret
store (cached with a TTL), runs your SQL via psql, and aggregates results
across environments.

TARGETS:
  -e prod01                       one environment
  -e prod01,prod-s2               several environments
  -e prod01:prod:use1,dev02       with per-environment space/region overrides
  -g us-prod                      a configured group

EXAMPLES:
  envsql -e prod01 'select count(*) from users'
  envsql -g all-prod -f csv -o users.csv 'select id, name from users limit 5'
  envsql -e staging-s101 queries/cleanup.sql
  envsql -e dev01                 (interactive session)
  envsql cache stats
")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Option<Command>,

    /// SQL command or path to a SQL file; omit for an interactive session
    #[arg(help = "SQL command or file to execute (omit for interactive psql)")]
    pub sql: Option<String>,

    /// Target environments
    #[arg(
        short,
        long,
        help = "Environment spec: env[:space[:region]],... (comma-separated)"
    )]
    pub env: Option<String>,

    /// Target group
    #[arg(short, long, help = "Run against every environment in a configured group")]
    pub group: Option<String>,

    /// Output file
    #[arg(
        short,
        long,
        num_args = 0..=1,
        default_missing_value = output::GENERATED_NAME,
        help = "Write output to a file (omit the name for a generated one under ~/tmp)"
    )]
    pub output: Option<String>,

    /// Space override
    #[arg(short, long, help = "Deployment space (defaults by environment name)")]
    pub space: Option<String>,

    /// Region override
    #[arg(short, long, help = "Region (defaults by environment name)")]
    pub region: Option<String>,

    /// Application
    #[arg(
        short,
        long,
        default_value = DEFAULT_APPLICATION,
        help = "Application the credential belongs to"
    )]
    pub application: String,

    /// Cluster qualifier
    #[arg(short, long, help = "Optional cluster qualifier for the credential lookup")]
    pub cluster: Option<String>,

    /// Connection mode
    #[arg(
        short,
        long,
        default_value = "rw",
        help = "Connection mode: rw, ro/r1/primary, r2/secondary, r3/tertiary, or a custom replica suffix"
    )]
    pub mode: String,

    /// Database name override
    #[arg(short, long, help = "Override the database name in the resolved URL")]
    pub database: Option<String>,

    /// Output format
    #[arg(short, long, help = "Output format: text, csv, txt, json or yaml")]
    pub format: Option<String>,

    /// Disable aggregation
    #[arg(long, help = "Print each environment's output directly instead of aggregating")]
    pub no_agg: bool,

    /// Parallel workers
    #[arg(
        short,
        long,
        num_args = 0..=1,
        default_missing_value = "0",
        help = "Parallel workers for multi-environment runs (0 or omitted value = auto)"
    )]
    pub parallel: Option<usize>,

    /// Force sequential execution
    #[arg(short = 'P', long, help = "Run environments one at a time")]
    pub no_parallel: bool,

    /// Cache key prefix override
    #[arg(long, help = "Credential cache key prefix")]
    pub cache_prefix: Option<String>,

    /// Cache TTL override (minutes)
    #[arg(long, help = "Credential cache TTL in minutes")]
    pub cache_ttl: Option<u64>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Inspect or clear the credential cache
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
    /// Show or initialize configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// List configured environment groups
    Groups,
}

#[derive(Subcommand)]
pub enum CacheCommand {
    /// Remove every cached credential (all prefixes)
    Clear,
    /// Show cache backend, entry count and TTL
    Stats,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the effective configuration and where each value came from
    Show,
    /// Write a sample config file to ~/.envsql/config.yml
    Init,
}

#[derive(Args)]
pub struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,

    /// Suppress output
    #[arg(short, long, help = "Suppress all output except errors")]
    pub quiet: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.global.verbose, cli.global.quiet) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run::execute(&cli).await {
        error!("{e}");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_alacarte_run() {
        let cli = Cli::parse_from(["envsql", "-e", "prod01,dev02", "select 1"]);
        assert_eq!(cli.env.as_deref(), Some("prod01,dev02"));
        assert_eq!(cli.sql.as_deref(), Some("select 1"));
        assert_eq!(cli.application, DEFAULT_APPLICATION);
        assert_eq!(cli.mode, "rw");
        assert!(cli.parallel.is_none());
    }

    #[test]
    fn output_flag_without_value_means_generated_name() {
        let cli = Cli::parse_from(["envsql", "-e", "prod01", "-o", "--", "select 1"]);
        assert_eq!(cli.output.as_deref(), Some(output::GENERATED_NAME));

        let cli = Cli::parse_from(["envsql", "-e", "prod01", "-o", "out.csv", "select 1"]);
        assert_eq!(cli.output.as_deref(), Some("out.csv"));
    }

    #[test]
    fn parallel_flag_without_value_means_auto() {
        let cli = Cli::parse_from(["envsql", "-g", "all-prod", "-p", "--", "select 1"]);
        assert_eq!(cli.parallel, Some(0));

        let cli = Cli::parse_from(["envsql", "-g", "all-prod", "-p", "4", "select 1"]);
        assert_eq!(cli.parallel, Some(4));
    }

    #[test]
    fn parses_cache_subcommand() {
        let cli = Cli::parse_from(["envsql", "cache", "stats"]);
        assert!(matches!(
            cli.command,
            Some(Command::Cache {
                command: CacheCommand::Stats
            })
        ));
    }
}
