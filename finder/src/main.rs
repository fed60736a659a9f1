use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use workspace_finder::config::{mode_summary, resolve_service_modes, ServersConfig};
use workspace_finder::oneshot::{run_oneshot, OneshotOptions};
use workspace_finder::process::{default_base_env, RuntimeStatus, Supervisor, SupervisorOptions};

#[derive(Parser)]
#[command(name = "finder")]
#[command(about = "Search across local tool servers over stdio")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to servers.toml (searched upward from the current directory by default)
    #[arg(long, env = "FINDER_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds to wait for each tool server's first output line
    #[arg(long, env = "FINDER_READINESS_TIMEOUT", default_value_t = 10.0)]
    readiness_timeout: f64,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch every tool server and report its status
    Status {
        /// Keep monitoring (and restarting) for this many seconds
        #[arg(long)]
        watch: Option<f64>,
        /// Launch fallback commands for every service
        #[arg(long)]
        force_fallback: bool,
    },
    /// Search all ready tool servers and fetch the top results
    Search {
        /// Search query
        query: String,
        /// Results per service (capped at 3)
        #[arg(long, default_value_t = 3)]
        max_results: usize,
        /// Launch fallback commands for every service
        #[arg(long)]
        force_fallback: bool,
        /// Seconds allowed for the search and fetch stages
        #[arg(long)]
        deadline: Option<f64>,
    },
    /// Show which mode each service would launch in
    Modes {
        /// Launch fallback commands for every service
        #[arg(long)]
        force_fallback: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    finder_common::init_tracing("workspace_finder")?;

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let readiness_timeout = seconds(cli.readiness_timeout, "--readiness-timeout")?;

    match cli.command {
        Commands::Status {
            watch,
            force_fallback,
        } => {
            let watch = watch.map(|s| seconds(s, "--watch")).transpose()?;
            run_status(config, readiness_timeout, watch, force_fallback).await;
        }
        Commands::Search {
            query,
            max_results,
            force_fallback,
            deadline,
        } => {
            let mut options = OneshotOptions::new(query);
            options.max_results = max_results;
            options.force_fallback = force_fallback;
            options.readiness_timeout = readiness_timeout;
            options.deadline = deadline.map(|s| seconds(s, "--deadline")).transpose()?;
            run_search(&config, &options).await;
        }
        Commands::Modes { force_fallback } => {
            run_modes(&config, force_fallback, &default_base_env());
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<ServersConfig> {
    match path {
        Some(path) => ServersConfig::load_from_path(path)
            .with_context(|| format!("Failed to load {}", path.display())),
        None => {
            let config = ServersConfig::load().context("Failed to load servers.toml")?;
            config.context("No servers.toml found (use --config)")
        }
    }
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("{} must be a non-negative number", flag))
}

fn print_statuses(statuses: &std::collections::BTreeMap<String, RuntimeStatus>) {
    for status in statuses.values() {
        println!(
            "{:<12} {:<9} {:<13} ready={:<5} restarts={} {}",
            status.name,
            status.mode,
            status.state,
            status.ready,
            status.restart_count,
            status.warning.as_deref().unwrap_or("")
        );
    }
}

async fn run_status(
    config: ServersConfig,
    readiness_timeout: Duration,
    watch: Option<Duration>,
    force_fallback: bool,
) {
    let base_env = default_base_env();
    let resolved = resolve_service_modes(&config.services, force_fallback, true, &base_env);
    println!("modes: {}", mode_summary(&resolved));

    let supervisor = Supervisor::new(
        config.services,
        resolved,
        SupervisorOptions {
            readiness_timeout,
            base_env,
            ..Default::default()
        },
    );

    let mut statuses = supervisor.launch_all().await;
    print_statuses(&statuses);

    if let Some(watch) = watch {
        supervisor.monitor(&mut statuses, Some(watch)).await;
        println!();
        print_statuses(&statuses);
    }

    supervisor.shutdown(&mut statuses).await;
}

async fn run_search(config: &ServersConfig, options: &OneshotOptions) {
    let result = run_oneshot(config, options, None).await;

    println!("modes: {}", result.modes);
    println!();
    println!("{}", result.summary.markdown);

    if !result.documents.is_empty() {
        println!();
        println!("## Documents");
        for document in &result.documents {
            println!();
            println!("### {} ({}, {})", document.title, document.service, document.kind);
            println!("{}", document.content.trim());
        }
    }

    if !result.summary.links.is_empty() {
        println!();
        println!("## Evidence");
        for link in &result.summary.links {
            println!("{}", link.markdown());
        }
    }

    if !result.warnings.is_empty() {
        println!();
        println!("## Warnings");
        for warning in result.warnings.iter() {
            println!("- {}", warning);
        }
    }
}

fn run_modes(config: &ServersConfig, force_fallback: bool, env: &HashMap<String, String>) {
    let resolved = resolve_service_modes(&config.services, force_fallback, true, env);
    println!("{}", mode_summary(&resolved));
    for service in resolved.values() {
        if let Some(warning) = &service.warning {
            println!("  {}: {}", service.name, warning);
        }
    }
}
