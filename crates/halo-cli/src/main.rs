//! Halo CLI - discover and control running Halo instances.
//!
//! Client subcommands make one call and exit 0 on success. Any failure is
//! printed to stderr and exits 1. Logs go to stderr so stdout carries only
//! command output.

mod commands;
mod run;

use anyhow::Result;
use clap::{Parser, Subcommand};
use halo_core::SessionBus;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "halo")]
#[command(about = "Discover and control running Halo instances")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Registry database to use instead of the session default
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    /// Give up on a call after this many milliseconds (default: wait)
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List running instances
    List,

    /// Ask an instance to exit
    Quit {
        instance: String,
    },

    /// Send a request to an instance and print its reply
    #[command(alias = "request")]
    Message {
        instance: String,

        #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
        text: Vec<String>,
    },

    /// Open an instance's inspector
    Inspector {
        instance: String,
    },

    /// Toggle the visibility of one of an instance's windows
    Toggle {
        instance: String,
        window: String,
    },

    /// Host an instance until it is told to quit
    Run {
        /// Name to register under
        #[arg(short, long)]
        name: String,

        /// Window the instance owns (repeatable)
        #[arg(short, long = "window")]
        windows: Vec<String>,

        /// Command to run for requests; the request argv is appended
        #[arg(long, num_args = 1.., allow_hyphen_values = true)]
        request_cmd: Vec<String>,
    },
}

fn init_logging(args: &Args) {
    let default_level = match (&args.command, args.debug) {
        (_, true) => Level::DEBUG,
        (Command::Run { .. }, false) => Level::INFO,
        _ => Level::WARN,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

fn open_bus(registry: Option<&PathBuf>) -> Result<SessionBus> {
    let bus = match registry {
        Some(path) => SessionBus::open_at(path)?,
        None => SessionBus::session()?,
    };
    Ok(bus)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let bus = open_bus(args.registry.as_ref())?;
    let timeout = args.timeout_ms.map(Duration::from_millis);

    match args.command {
        Command::List => commands::list(&bus),
        Command::Quit { instance } => commands::quit(&bus, &instance, timeout).await,
        Command::Message { instance, text } => {
            commands::message(&bus, &instance, text, timeout).await
        }
        Command::Inspector { instance } => commands::inspector(&bus, &instance, timeout).await,
        Command::Toggle { instance, window } => {
            commands::toggle(&bus, &instance, &window, timeout).await
        }
        Command::Run {
            name,
            windows,
            request_cmd,
        } => run::run(&bus, &name, windows, request_cmd).await,
    }
}
