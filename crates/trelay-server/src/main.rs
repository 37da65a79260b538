//! trelay-server: TLS relay gateway.
//!
//! Accepts TLS connections from management clients and, per request, runs a
//! local diagnostic command, a configuration-collection job or an onward TCP
//! connection, then relays bytes until either side closes.

mod auth;
mod config;
mod ping;
mod relay;
mod server;
mod transport;
mod upstream;
mod worker;

use clap::Parser;
use config::{ConfigOverrides, ServerConfig};
use server::RelayServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// trelay-server: TLS relay for diagnostics, config collection and TCP patches
#[derive(Parser, Debug)]
#[command(name = "trelay-server", version, about = "TLS relay gateway")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.trelay/config.toml")]
    config: String,

    /// Generate self-signed certificate for development
    #[arg(long)]
    generate_cert: bool,

    /// Patch authorization file
    #[arg(long)]
    patch_file: Option<String>,

    /// Minimum client version ("0" disables the check)
    #[arg(long)]
    compatibility_version: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        protocol = trelay_core::PROTOCOL_VERSION,
        "starting trelay-server"
    );

    // Resolve cert/key paths
    let (cert, key) = if cli.generate_cert {
        match generate_self_signed_cert() {
            Ok((c, k)) => {
                info!(cert = %c.display(), key = %k.display(), "generated self-signed certificate");
                (
                    Some(c.to_string_lossy().into_owned()),
                    Some(k.to_string_lossy().into_owned()),
                )
            }
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    } else {
        (cli.cert, cli.key)
    };

    // Load server config (file + CLI overrides)
    let overrides = ConfigOverrides {
        bind: cli.bind,
        port: cli.port,
        cert,
        key,
        compatibility_version: cli.compatibility_version,
        patch_file: cli.patch_file,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    // Load TLS config
    let tls_config =
        match transport::tls::load_server_config(&server_config.cert_path, &server_config.key_path)
        {
            Ok(cfg) => cfg,
            Err(e) => {
                error!(error = %e, "failed to load TLS config");
                std::process::exit(1);
            }
        };

    let relay_server = RelayServer::new(server_config).await;

    // Run until shutdown signal
    let tls_arc = Arc::new(tls_config);

    tokio::select! {
        result = relay_server.run(tls_arc) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    // Stops the patch refresh task.
    drop(relay_server);
    info!("trelay-server stopped");
}

/// Write a self-signed certificate for development use into `~/.trelay`.
fn generate_self_signed_cert() -> Result<(PathBuf, PathBuf), Box<dyn std::error::Error>> {
    let trelay_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".trelay");
    std::fs::create_dir_all(&trelay_dir)?;

    let cert_path = trelay_dir.join("cert.pem");
    let key_path = trelay_dir.join("key.pem");

    let (cert, key) = transport::tls::self_signed_pem("trelay-server dev cert")?;
    std::fs::write(&cert_path, cert)?;
    std::fs::write(&key_path, key)?;

    Ok((cert_path, key_path))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
