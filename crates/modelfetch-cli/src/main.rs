//! Modelfetch - command line front end for the model download engine.
//!
//! Wires the engine to the HuggingFace repository listing, the HTTP transfer
//! backend, and the JSON stores under the data directory.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "modelfetch")]
#[command(about = "Download, resume, and unpack AI models")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Data directory holding the stores and the models directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Engine config file (defaults to engine.json in the data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a model by `owner/name` coordinate or local path.
    /// Ctrl-C pauses the download.
    Download {
        location: String,

        /// Comma-separated glob patterns to include (default: weights, configs, tokenizers)
        #[arg(long)]
        allow: Option<String>,

        /// Comma-separated glob patterns to skip
        #[arg(long, default_value = "")]
        exclude: String,
    },
    /// Resume a paused download, or every interrupted one when no model is given.
    Resume { model_id: Option<String> },
    /// Cancel an active or paused download.
    Cancel { model_id: String },
    /// Remove a model and its files.
    Delete { model_id: String },
    /// Show every known model and transfer.
    Status {
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove leftovers of abandoned downloads.
    Cleanup,
    /// Extract a ZIP archive into an empty directory.
    Extract { archive: PathBuf, dest: PathBuf },
    /// Flatten an extracted package around its marker file.
    Restructure {
        dir: PathBuf,

        #[arg(long)]
        marker: Option<String>,

        #[arg(long)]
        bundle_suffix: Option<String>,
    },
    /// Test a glob pattern against a repository path.
    Match { pattern: String, path: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; RUST_LOG wins over --debug when set
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact();
    match EnvFilter::try_from_default_env() {
        Ok(filter) => builder.with_env_filter(filter).init(),
        Err(_) => builder.init(),
    }

    let data_dir = args.data_dir.unwrap_or_else(commands::default_data_dir);
    debug!("Data directory: {}", data_dir.display());

    match args.command {
        Command::Download {
            location,
            allow,
            exclude,
        } => {
            let engine = commands::open_engine(&data_dir, args.config.as_deref(), true).await?;
            commands::download(&engine, &location, allow.as_deref(), &exclude).await
        }
        Command::Resume { model_id } => {
            let engine = commands::open_engine(&data_dir, args.config.as_deref(), true).await?;
            commands::resume(&engine, model_id.as_deref()).await
        }
        Command::Cancel { model_id } => {
            let engine = commands::open_engine(&data_dir, args.config.as_deref(), false).await?;
            commands::cancel(&engine, &model_id).await
        }
        Command::Delete { model_id } => {
            let engine = commands::open_engine(&data_dir, args.config.as_deref(), false).await?;
            commands::delete(&engine, &model_id).await
        }
        Command::Status { json } => {
            let engine = commands::open_engine(&data_dir, args.config.as_deref(), false).await?;
            commands::status(&engine, json).await
        }
        Command::Cleanup => {
            let engine = commands::open_engine(&data_dir, args.config.as_deref(), false).await?;
            commands::cleanup(&engine).await
        }
        Command::Extract { archive, dest } => commands::extract(&archive, &dest),
        Command::Restructure {
            dir,
            marker,
            bundle_suffix,
        } => commands::restructure_dir(&dir, marker, bundle_suffix),
        Command::Match { pattern, path } => commands::match_pattern(&pattern, &path),
    }
}
