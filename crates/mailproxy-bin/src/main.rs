#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::pedantic
)]
#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mailproxy::{CONFIG, tokio, tracing};
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

mod config;
mod healthcheck;
mod validate;

pub(crate) use config::CONFIG_BIN;
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Serve {},
    /// Check the health of a proxy running on this host
    Healthcheck {},
    /// Load the mailbox access file and report what it grants
    ValidateConfig {
        #[clap(
            long,
            short,
            help = "Mailbox access file to check. Defaults to the configured file."
        )]
        file: Option<PathBuf>,
    },
    /// Print the version of the proxy
    Version {},
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_file(CONFIG_BIN.debug.extended_logs)
        .with_line_number(CONFIG_BIN.debug.extended_logs)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    match cli.command {
        Some(Commands::Serve {}) => {
            print_info();
            serve().await?;
        }
        Some(Commands::Healthcheck {}) => {
            healthcheck::health().await?;
        }
        Some(Commands::ValidateConfig { file }) => {
            validate::validate_config(file).await?;
        }
        Some(Commands::Version {}) => {
            println!("{VERSION}");
        }
        None => {
            if CONFIG_BIN.debug.auto_serve {
                print_info();
                serve().await?;
            } else {
                // Error out if no subcommand is provided.
                eprintln!("No subcommand provided. Use --help for more information.");
                anyhow::bail!("No subcommand provided");
            }
        }
    }

    Ok(())
}

async fn serve() -> anyhow::Result<()> {
    tracing::info!(
        "Starting mailbox proxy on {}:{}...",
        CONFIG.bind_ip,
        CONFIG.listen_port
    );
    let bind_addr = std::net::SocketAddr::from((CONFIG.bind_ip, CONFIG.listen_port));
    let cancellation_token = mailproxy::serve::shutdown_on_signal();
    mailproxy::serve::serve(bind_addr, cancellation_token).await
}

fn print_info() {
    println!("Mailbox Proxy Version: {VERSION}");
    tracing::info!(
        version = VERSION,
        upstream = %CONFIG.upstream_url,
        mailbox_access_file = %CONFIG.mailbox_access_file.display(),
        "Mailbox Proxy starting"
    );
}
