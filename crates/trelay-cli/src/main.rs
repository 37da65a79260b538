//! trelay: management client for the TLS relay.
//!
//! Builds a relay request, performs the one-shot handshake, then pipes
//! stdin/stdout through the relay: diagnostics run on the relay host,
//! configuration collection, and onward TCP patches.

mod commands;
mod config;
mod session;
mod tls;

use clap::{Parser, Subcommand};
use commands::collect::CollectArgs;
use commands::diag::Diagnostic;
use commands::Invocation;
use session::Target;
use std::path::PathBuf;
use tls::Trust;
use tracing_subscriber::EnvFilter;

/// trelay: TLS relay client
#[derive(Parser)]
#[command(name = "trelay", version, about = "Management client for the trelay TLS relay")]
struct Cli {
    /// Relay server host
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Relay server port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// CA certificate used to verify the server (PEM)
    #[arg(long, global = true)]
    ca: Option<String>,

    /// Skip server certificate verification
    #[arg(long, global = true)]
    insecure: bool,

    /// Platform tag sent with the request
    #[arg(long, global = true)]
    platform: Option<String>,

    /// Domain sent with the request
    #[arg(long, global = true)]
    domain: Option<String>,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ping a host from the relay
    Ping {
        /// Destination IP
        dest: String,
        /// Source IP substituted into the command
        #[arg(long)]
        source: Option<String>,
        /// Command options as key=value pairs, comma separated
        #[arg(short, long)]
        options: Option<String>,
    },

    /// Traceroute to a host from the relay
    Traceroute {
        /// Destination IP
        dest: String,
        /// Source IP substituted into the command
        #[arg(long)]
        source: Option<String>,
        /// Command options as key=value pairs, comma separated
        #[arg(short, long)]
        options: Option<String>,
    },

    /// Collect a device configuration
    Config {
        /// Device IP
        device_ip: String,
        /// Collector source IP
        #[arg(long, default_value = "")]
        source: String,
        /// Collection protocol (e.g. SNMP, TFTP, CASCADE)
        #[arg(long, default_value = "SNMP")]
        protocol: String,
        /// Configuration type (e.g. RUNNING, STARTUP)
        #[arg(long = "type", default_value = "RUNNING")]
        config_type: String,
        /// File name the device writes to the TFTP folder
        #[arg(long)]
        file: String,
        /// Write community for SNMP/CASCADE jobs
        #[arg(long)]
        community: Option<String>,
        /// Device name reported in the transcript
        #[arg(long)]
        device_name: Option<String>,
    },

    /// Open a TCP connection through the relay
    Connect {
        /// Destination IP or host
        dest: String,
        /// Destination port
        dest_port: u16,
        /// Source IP the relay binds before dialing
        #[arg(long)]
        source: Option<String>,
        /// Application tag (defaults to TCP-<port>, a cross-connect patch)
        #[arg(long)]
        app: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "trelay=debug,trelay_core=debug"
    } else {
        "trelay=warn"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("trelay: {e:#}");
            1
        }
    };
    // stdin is read on a blocking thread that cannot be cancelled.
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli
        .config
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(config::default_path);
    let cfg = config::Config::load(&config_path)?.default;

    let host = cli.server.unwrap_or(cfg.server);
    if host.is_empty() {
        anyhow::bail!("no relay server given (use --server or set it in the config file)");
    }
    let trust = if cli.insecure || cfg.insecure {
        Trust::Insecure
    } else {
        match cli.ca.or(cfg.ca) {
            Some(ca) => Trust::CaFile(ca),
            None => anyhow::bail!("no CA certificate given (use --ca or --insecure)"),
        }
    };
    let inv = Invocation {
        target: Target {
            host,
            port: cli.port.unwrap_or(cfg.port),
            trust,
        },
        platform: cli.platform.unwrap_or(cfg.platform),
        domain: cli.domain.unwrap_or(cfg.domain),
    };

    match cli.command {
        Command::Ping {
            dest,
            source,
            options,
        } => {
            commands::diag::run(
                &inv,
                Diagnostic::Ping,
                &dest,
                source.as_deref(),
                options.as_deref(),
            )
            .await
        }
        Command::Traceroute {
            dest,
            source,
            options,
        } => {
            commands::diag::run(
                &inv,
                Diagnostic::Traceroute,
                &dest,
                source.as_deref(),
                options.as_deref(),
            )
            .await
        }
        Command::Config {
            device_ip,
            source,
            protocol,
            config_type,
            file,
            community,
            device_name,
        } => {
            let args = CollectArgs {
                device_ip,
                source,
                protocol,
                config_type,
                file,
                community,
                device_name,
            };
            commands::collect::run(&inv, &args).await
        }
        Command::Connect {
            dest,
            dest_port,
            source,
            app,
        } => {
            commands::connect::run(&inv, &dest, dest_port, source.as_deref(), app.as_deref())
                .await
        }
    }
}
