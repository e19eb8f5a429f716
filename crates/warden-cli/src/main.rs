//! `warden` – start, supervise and stop the services of an agent deployment.
//!
//! ```text
//! warden [--config PATH] [--env NAME] up [--daemon] [--restart-crashed N]
//! warden [--config PATH] [--env NAME] check
//! warden [--config PATH] [--env NAME] order
//! warden [--config PATH] [--env NAME] status
//! ```
//!
//! `up` starts every service in dependency order, then supervises them until
//! Ctrl-C or SIGTERM and stops them in reverse order. The other commands
//! start nothing.
//!
//! Exit status is `1` when the configuration is invalid or a base service
//! failed to start, `0` otherwise.

mod backend;
mod report;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use warden_config::{LoadOptions, WardenConfig};
use warden_probe::HttpHealthChecker;
use warden_supervisor::{Orchestrator, UnixProcessControl, Watchdog};

#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(about = "Service lifecycle manager for agent deployments", long_about = None)]
struct Cli {
    /// Service configuration file (YAML or TOML).
    #[arg(short, long, default_value = "config/warden.yaml")]
    config: PathBuf,

    /// Named overlay from the `environments:` section.
    #[arg(short, long)]
    env: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Start all services and supervise them until interrupted.
    Up {
        /// Log lifecycle events only; no interactive output.
        #[arg(short, long)]
        daemon: bool,

        /// Restart a crashed service up to N times.
        #[arg(long, value_name = "N")]
        restart_crashed: Option<u32>,
    },
    /// Validate the configuration and probe every health URL.
    Check,
    /// Print the start order as dependency waves.
    Order,
    /// Print a table of configured services and their current health.
    Status,
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init_tracing("warden");
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Runtime error".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async {
        match cli.command {
            Command::Up { daemon, restart_crashed } => up(config, daemon, restart_crashed).await,
            Command::Check => check(config).await,
            Command::Order => order(config),
            Command::Status => status(config).await,
        }
    })
}

fn load_config(cli: &Cli) -> Result<WardenConfig, warden_config::ConfigError> {
    let opts = LoadOptions {
        environment: cli.env.clone(),
        ..Default::default()
    };
    let mut config = warden_config::load(&cli.config, &opts)?;
    warden_config::apply_env_overrides(&mut config);
    Ok(config)
}

fn orchestrator(config: WardenConfig) -> Orchestrator {
    Orchestrator::new(config, Arc::new(UnixProcessControl::new()), Arc::new(HttpHealthChecker::new()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

async fn up(config: WardenConfig, daemon: bool, restart_crashed: Option<u32>) -> ExitCode {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    install_ctrlc(Arc::clone(&shutdown_tx), daemon);

    let sweep_interval = config.settings.health.check_interval.max(Duration::from_secs(1));
    let backend = backend::build(&config.settings, Some(shutdown_rx.clone()));
    let mut orch = orchestrator(config).with_shutdown(shutdown_rx.clone());
    if let Some(registry) = backend.registry {
        orch = orch.with_registry(registry);
    }

    let printer = (!daemon).then(|| {
        let mut events = orch.subscribe();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                report::print_event(&event);
            }
        })
    });

    let init = match orch.initialize_all().await {
        Ok(init) => init,
        Err(e) => {
            error!(error = %e, "Initialization refused");
            eprintln!("{}: {}", "Config error".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };
    if !daemon {
        report::print_init(&init);
    }
    info!(
        started = init.started.len(),
        failed_base = ?init.failed_base_names(),
        failed_optional = ?init.failed_optional_names(),
        "Initialization finished"
    );

    let interrupted = *shutdown_rx.borrow();
    if init.success && !interrupted {
        let mut watchdog = Watchdog::new(orch.clone(), sweep_interval);
        if let Some(max) = restart_crashed {
            watchdog = watchdog.restart_crashed(max);
        }
        let watchdog = watchdog.spawn(shutdown_rx.clone());

        if !daemon {
            println!("  Press {} to stop.", "Ctrl-C".bold());
        }
        let mut rx = shutdown_rx.clone();
        if rx.wait_for(|stop| *stop).await.is_err() {
            warn!("Shutdown channel closed unexpectedly");
        }
        if let Err(e) = watchdog.await {
            warn!(error = %e, "Watchdog task ended abnormally");
        }
    } else if !init.success {
        error!(failed = ?init.failed_base_names(), "Base services failed; stopping what was started");
    }

    // Raised before stopping so no registry call backs off during shutdown.
    shutdown_tx.send_replace(true);
    let stopped = orch.shutdown_all().await;
    if !daemon {
        report::print_shutdown(&stopped);
    }

    if let Some(monitor) = backend.monitor
        && let Err(e) = monitor.await
    {
        warn!(error = %e, "Registry monitor ended abnormally");
    }
    if let Some(printer) = printer {
        printer.abort();
    }
    report::exit_code(&init)
}

async fn check(config: WardenConfig) -> ExitCode {
    let backend = backend::build(&config.settings, None);
    let mut orch = orchestrator(config);
    if let Some(registry) = backend.registry {
        orch = orch.with_registry(registry);
    }
    match orch.check_only().await {
        Ok(checked) => {
            report::print_check(&checked);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {}", "Config error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn order(config: WardenConfig) -> ExitCode {
    let resolver = warden_supervisor::DependencyResolver::new(config.services.as_slice());
    match resolver.and_then(|r| r.waves()) {
        Ok(waves) => {
            report::print_waves(&waves);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {}", "Config error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn status(config: WardenConfig) -> ExitCode {
    let backend = backend::build(&config.settings, None);
    let mut orch = orchestrator(config);
    if let Some(registry) = backend.registry {
        orch = orch.with_registry(registry);
    }
    match orch.check_only().await {
        Ok(checked) => {
            report::print_status(orch.config(), &checked);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {}", "Config error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Signals
// ─────────────────────────────────────────────────────────────────────────────

/// Ctrl-C and SIGTERM both flip the shutdown flag; a second signal is ignored.
fn install_ctrlc(shutdown: Arc<watch::Sender<bool>>, quiet: bool) {
    if let Err(e) = ctrlc::set_handler(move || {
        if *shutdown.borrow() {
            return;
        }
        if !quiet {
            println!();
            println!("{}", "⚠  Shutdown requested – stopping services …".yellow().bold());
        }
        info!("Shutdown signal received");
        shutdown.send_replace(true);
    }) {
        warn!(error = %e, "Failed to install signal handler; services will not be stopped on Ctrl-C");
    }
}
