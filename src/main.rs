// Crate-level lint configuration
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::single_match_else)]

//! gns3-proxy - Authenticating, filtering reverse proxy for GNS3 backends
//!
//! Fronts a pool of GNS3 backend servers behind a single address. Clients
//! authenticate with their own credentials; the proxy maps each user to a
//! backend, rewrites the credentials, and relays the exchange bit-for-bit,
//! WebSocket upgrades included.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gns3_proxy::access_log::AccessLogger;
use gns3_proxy::config::{ProxyConfig, DEFAULT_CONFIG_FILE};
use gns3_proxy::listener;
use gns3_proxy::policy::PolicyEngine;

/// Grace period for in-flight connections after a shutdown signal.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

/// gns3-proxy - Authenticating, filtering reverse proxy for GNS3 backends
#[derive(Parser, Debug)]
#[command(name = "gns3-proxy")]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of the gns3_proxy config file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE, env = "GNS3_PROXY_CONFIG")]
    config_file: PathBuf,

    /// Log level: DEBUG, INFO, WARNING, ERROR or CRITICAL (a leading
    /// character is enough)
    #[arg(long, default_value = "INFO", env = "GNS3_PROXY_LOG_LEVEL")]
    log_level: String,

    /// Access log file (stdout mirror via the normal log otherwise)
    #[arg(long, env = "GNS3_PROXY_ACCESS_LOG")]
    access_log: Option<PathBuf>,

    /// Run configuration validation only (don't start the proxy)
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Starting gns3-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {:?}", args.config_file);

    let config = match ProxyConfig::load(&args.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            return ExitCode::from(1);
        }
    };
    debug!("Config: {:?}", config);
    info!("Configuration validated successfully");

    if args.validate {
        info!("Configuration validation successful, exiting");
        return ExitCode::SUCCESS;
    }

    listener::set_open_file_limit(config.open_file_limit);

    let listener = match listener::bind(&config) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", config.socket_addr(), e);
            return ExitCode::from(2);
        }
    };

    print_startup_summary(&config);

    let config = Arc::new(config);
    let policy = Arc::new(PolicyEngine::new(config.clone()));
    let access_log = AccessLogger::open(args.access_log);

    let serve = listener::run(listener, config.clone(), policy, access_log);

    info!("Press Ctrl+C to shutdown gracefully");
    tokio::select! {
        _ = serve => {}
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
        }
    }

    // The listener is gone at this point; give in-flight workers a moment
    // to finish their exchanges.
    info!("Shutting down...");
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    info!("gns3-proxy shutdown complete");
    ExitCode::SUCCESS
}

/// Initialize logging. Accepts the Python-style level names the original
/// tooling uses, including single-letter abbreviations.
fn init_logging(level: &str) {
    let level = match level.to_ascii_lowercase().as_str() {
        s if s.starts_with('d') => "debug",
        s if s.starts_with('i') => "info",
        s if s.starts_with('w') => "warn",
        s if s.starts_with('e') => "error",
        s if s.starts_with('c') => "error",
        _ => "info",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();
}

/// Wait for OS shutdown signal
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("Failed to install SIGQUIT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigquit.recv() => {
            info!("Received SIGQUIT");
        }
    }
}

#[cfg(windows)]
async fn shutdown_signal() {
    use tokio::signal::windows::ctrl_break;

    let mut ctrl_break = ctrl_break().expect("Failed to install Ctrl+Break handler");
    ctrl_break.recv().await;
    info!("Received Ctrl+Break");
}

#[cfg(not(any(unix, windows)))]
async fn shutdown_signal() {
    std::future::pending::<()>().await;
}

/// Print startup summary
fn print_startup_summary(config: &ProxyConfig) {
    info!("═══════════════════════════════════════════════════════════════");
    info!("  🚀 gns3-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════════");
    info!("  Listening:     {}", config.socket_addr());
    info!("  Backend port:  {}", config.backend_port);
    info!("  Users:         {} configured", config.users.len());
    info!("  Mappings:      {} configured", config.mappings.len());
    info!("  Deny rules:    {} configured", config.deny_rules.len());
    info!("  Backends:");
    for (name, entry) in &config.servers {
        info!("    - {} → {}:{}", name, entry.addr, config.backend_port);
    }
    if let Some((name, addr)) = config.default_server() {
        info!("  Default:       {} ({})", name, addr);
    }
    if !config.auth_whitelist.is_empty() {
        info!(
            "  Trusted header auth from: {:?} via {}",
            config.auth_whitelist, config.auth_header_name
        );
    }
    info!("═══════════════════════════════════════════════════════════════");
}
