//! Alertline CLI
//!
//! Command-line client and local push server for Alertline.
//!
//! # Commands
//!
//! - `watch` - Connect, catch up and stream events as JSON lines
//! - `state` - Print the persisted sync state
//! - `serve` - Run the reference push server with a synthetic backlog

mod commands;

use alertline_protocol::Filter;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Alertline push client tools.
#[derive(Parser)]
#[command(name = "alertline")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a push server and print delivered events
    Watch {
        /// Push server URL
        #[arg(short, long, env = "ALERTLINE_URL")]
        url: String,

        /// Client identity
        #[arg(short, long, env = "ALERTLINE_CLIENT_ID")]
        client_id: String,

        /// Channel to subscribe to, as area:type (repeatable)
        #[arg(short, long = "filter", value_parser = parse_filter, required = true)]
        filters: Vec<Filter>,

        /// File holding the per-channel resume points
        #[arg(short, long, env = "ALERTLINE_STATE_FILE")]
        state_file: Option<PathBuf>,

        /// Ask the server to replay every channel from scratch
        #[arg(long)]
        reset: bool,

        /// Seconds without new events before catch-up ends
        #[arg(long, default_value = "30")]
        inactivity_secs: u64,

        /// Seconds before catch-up ends regardless of activity
        #[arg(long, default_value = "60")]
        catch_up_secs: u64,
    },

    /// Print the persisted sync state
    State {
        /// File holding the per-channel resume points
        #[arg(short, long, env = "ALERTLINE_STATE_FILE")]
        state_file: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run the reference push server
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:9400")]
        bind: SocketAddr,

        /// Channel to seed, as area:type (repeatable)
        #[arg(short, long = "channel", value_parser = parse_filter)]
        channels: Vec<Filter>,

        /// Events published per channel before clients connect
        #[arg(long, default_value = "0")]
        seed_backlog: usize,

        /// Events per replay burst
        #[arg(long, default_value = "25")]
        burst_size: usize,

        /// Share of each burst sent twice (0.0 to 1.0)
        #[arg(long, default_value = "0.0")]
        duplicate_ratio: f64,

        /// Seed for the replay shuffle
        #[arg(long, default_value = "7")]
        seed: u64,

        /// Do not send sync_complete after a backlog
        #[arg(long)]
        no_completion: bool,

        /// Publish one live event per channel at this interval
        #[arg(long)]
        live_interval_ms: Option<u64>,
    },

    /// Show version information
    Version,
}

fn parse_filter(spec: &str) -> Result<Filter, String> {
    Filter::parse(spec).ok_or_else(|| format!("expected area:type, got '{spec}'"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Watch {
            url,
            client_id,
            filters,
            state_file,
            reset,
            inactivity_secs,
            catch_up_secs,
        } => {
            let options = commands::watch::WatchOptions {
                url,
                client_id,
                filters,
                state_file,
                reset,
                inactivity_secs,
                catch_up_secs,
            };
            commands::watch::run(options).await?;
        }
        Commands::State { state_file, format } => {
            commands::state::run(&state_file, &format)?;
        }
        Commands::Serve {
            bind,
            channels,
            seed_backlog,
            burst_size,
            duplicate_ratio,
            seed,
            no_completion,
            live_interval_ms,
        } => {
            let options = commands::serve::ServeOptions {
                bind,
                channels,
                seed_backlog,
                burst_size,
                duplicate_ratio,
                seed,
                send_completion: !no_completion,
                live_interval_ms,
            };
            commands::serve::run(options).await?;
        }
        Commands::Version => {
            println!("Alertline CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
