use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fluux_sandbox::backoff::Backoff;
use fluux_sandbox::container::fake::FakeRuntime;
use fluux_sandbox::container::{ContainerRuntime, DockerCli};
use fluux_sandbox::reconcile::ReconcileReport;
use fluux_sandbox::{Config, SandboxEngine};

/// How long the runtime must answer before failed-pass backoff is reset.
const STABILITY_THRESHOLD: Duration = Duration::from_secs(60);

fn print_help() {
    println!(
        "\
fluux-sandbox v{}

Sandbox execution engine: runs agent sessions on the host or in hardened
containers, and keeps the container fleet reconciled.

USAGE:
    fluux-sandbox [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/sandbox.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit
        --dry-run    Use an in-memory runtime instead of the container CLI
        --status     Reconcile once, print status as JSON and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG              Log level filter for tracing
                          (e.g. debug, fluux_sandbox=debug,warn)

EXAMPLES:
    fluux-sandbox                               # uses config/sandbox.toml
    fluux-sandbox /etc/fluux/sandbox.toml       # custom config path
    RUST_LOG=debug fluux-sandbox --dry-run      # no container runtime needed",
        env!("CARGO_PKG_VERSION"),
    );
}

fn log_report(report: &ReconcileReport) {
    for name in &report.removed_deprecated {
        info!("Removed deprecated container {name}");
    }
    for name in &report.removed_orphans {
        info!("Removed orphaned container {name}");
    }
    for name in &report.recreated {
        info!("Recreated drifted container {name}");
    }
    for e in &report.errors {
        warn!("Reconciliation error: {e}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut dry_run = false;
    let mut status_only = false;
    let mut config_path = None;

    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("fluux-sandbox v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--dry-run" => dry_run = true,
            "--status" => status_only = true,
            other if other.starts_with('-') => {
                return Err(anyhow!("Unknown option {other}, see --help"));
            }
            other => config_path = Some(other.to_string()),
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fluux_sandbox=info")),
        )
        .init();

    let config_path = config_path.unwrap_or_else(|| "config/sandbox.toml".to_string());
    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;

    info!("Image: {}", config.runtime.image);
    info!(
        "Limits: {} processes, memory {} (reservation {})",
        config.hardening.pids_limit, config.hardening.memory, config.hardening.memory_reservation
    );
    info!("Data directory: {}", config.paths.data_dir.display());

    let runtime: Arc<dyn ContainerRuntime> = if dry_run {
        warn!("Dry run: using the in-memory runtime, no containers are created");
        Arc::new(FakeRuntime::new())
    } else {
        Arc::new(DockerCli::new(&config.runtime))
    };
    info!("Runtime backend: {} ({})", runtime.backend_name(), config.runtime.cli);

    let interval = Duration::from_secs(config.reconcile.interval_secs.max(1));
    let engine = SandboxEngine::new(config, runtime)?;

    match engine.startup().await {
        Ok(report) => log_report(&report),
        Err(e) => error!("Startup reconciliation failed: {e}"),
    }

    if status_only {
        println!("{}", serde_json::to_string_pretty(&engine.status())?);
        return Ok(());
    }

    let mut backoff = Backoff::new(Duration::from_secs(2), interval, 2);
    let mut healthy_since = engine.runtime_available().then(Instant::now);

    // ── Reconciliation loop ──────────────────────────────────────────
    loop {
        let delay = if healthy_since.is_some() {
            interval
        } else {
            let delay = backoff.next_delay();
            info!(
                "Retrying reconciliation in {}s (attempt {})...",
                delay.as_secs(),
                backoff.attempt
            );
            delay
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }

        match engine.force_reconcile().await {
            Ok(report) => {
                log_report(&report);
                let since = *healthy_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= STABILITY_THRESHOLD && backoff.attempt > 0 {
                    backoff.reset();
                    info!("Runtime stable, backoff reset");
                }
            }
            Err(e) => {
                warn!("Reconciliation failed: {e}");
                healthy_since = None;
            }
        }
    }

    if let Err(e) = engine.shutdown().await {
        error!("Shutdown failed: {e}");
    }
    info!("Bye");
    Ok(())
}
