//! notesync CLI
//!
//! Runs the sync server and maintains its database.
//!
//! # Commands
//!
//! - `serve` - Run the HTTP and WebSocket server
//! - `dump-log` - Print sync log entries for debugging
//! - `compact` - Prune old sync log entries
//! - `verify` - Check note hashes and attachment content

mod commands;

use clap::{Parser, Subcommand};
use commands::serve::ServeOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// notesync server and maintenance tools.
#[derive(Parser)]
#[command(name = "notesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the SQLite database
    #[arg(global = true, short, long)]
    database: Option<PathBuf>,

    /// Directory holding attachment content
    #[arg(global = true, short, long)]
    content_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync server (reads NOTESYNC_* environment variables)
    Serve {
        /// Address to bind to
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Days of sync log to keep (0 keeps everything)
        #[arg(long)]
        log_retention_days: Option<u64>,

        /// Seconds between WebSocket pings
        #[arg(long)]
        ping_interval_secs: Option<u64>,
    },

    /// Print sync log entries for debugging
    DumpLog {
        /// Only entries of this user
        #[arg(short, long)]
        user: Option<String>,

        /// Only entries after this timestamp (epoch millis)
        #[arg(short, long, default_value = "0")]
        since: i64,

        /// Maximum number of entries to dump
        #[arg(short, long, default_value = "100")]
        limit: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Prune sync log entries older than the retention
    Compact {
        /// Days of log to keep
        #[arg(short, long)]
        retention_days: u64,

        /// Dry run - show what would be done
        #[arg(long)]
        dry_run: bool,
    },

    /// Check note hashes, attachment content and orphaned objects
    Verify {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose when set.
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve {
            bind,
            log_retention_days,
            ping_interval_secs,
        } => {
            let options = ServeOptions {
                bind,
                database: cli.database,
                content_dir: cli.content_dir,
                log_retention_days,
                ping_interval_secs,
            };
            commands::serve::run(options).await?;
        }
        Commands::DumpLog {
            user,
            since,
            limit,
            format,
        } => {
            let database = cli.database.ok_or("Database path required for dump-log")?;
            commands::dump_log::run(&database, user.as_deref(), since, limit, &format)?;
        }
        Commands::Compact {
            retention_days,
            dry_run,
        } => {
            let database = cli.database.ok_or("Database path required for compact")?;
            let retention = Duration::from_secs(retention_days * 24 * 60 * 60);
            commands::compact::run(&database, retention, dry_run)?;
        }
        Commands::Verify { format } => {
            let database = cli.database.ok_or("Database path required for verify")?;
            commands::verify::run(&database, cli.content_dir.as_ref(), &format)?;
        }
        Commands::Version => {
            println!("notesync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
