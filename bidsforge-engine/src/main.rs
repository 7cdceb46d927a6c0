//! bidsforge - BIDS conversion rule engine
//!
//! Command-line front end: analyse a dataset document, decode behavioral
//! timing files into it, emit the BIDS tree, or supervise a conversion script.

use anyhow::{bail, Context, Result};
use bidsforge_common::config::{load_config, resolve_root_folder, LoggingConfig};
use bidsforge_engine::events::{
    collect_headers, create_events_tsv, decode_events, map_event_columns, read_source,
};
use bidsforge_engine::ingest::{load_document, save_document};
use bidsforge_engine::supervisor::{RunOutcome, ScriptRunner};
use bidsforge_engine::{analyze, emitter};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "bidsforge")]
#[command(about = "BIDS conversion rule engine", long_about = None)]
#[command(version)]
struct Args {
    /// Path to TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every rule over a dataset document until it is stable
    Analyze {
        /// Dataset document (JSON)
        input: PathBuf,
        /// Where to write the result (defaults to the input)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Decode timing files into func/events acquisitions
    Events {
        /// Dataset document (JSON)
        input: PathBuf,
        /// Upload folder the timing files live in
        #[arg(long)]
        source: PathBuf,
        /// Timing files (.tsv .csv .out .txt .xlsx), relative to the upload folder
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write the BIDS directory tree
    Emit {
        /// Dataset document (JSON)
        input: PathBuf,
        /// Upload folder item paths are relative to
        #[arg(long)]
        source: PathBuf,
        /// Output dataset folder
        #[arg(long)]
        dataset: PathBuf,
    },
    /// Supervise a conversion script for one session work directory
    Run {
        /// Session folder name under the root folder
        session: String,
        /// Script to run with `bash <script> <work_dir>`
        script: PathBuf,
        /// Root folder (overrides env and config)
        #[arg(long)]
        root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging)?;

    info!("Starting bidsforge v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Commands::Analyze { input, output } => {
            let document = load_document(&input)?;
            let document = analyze(document, &config.engine);
            save_document(&document, output.as_deref().unwrap_or(&input))?;
        }
        Commands::Events { input, source, files, output } => {
            let mut document = analyze(load_document(&input)?, &config.engine);

            let sources = files
                .iter()
                .map(|file| {
                    read_source(&source, file)
                        .with_context(|| format!("Failed to read timing file {}", file.display()))
                })
                .collect::<Result<Vec<_>>>()?;
            let decoded = decode_events(&sources, &document.objects)?;
            info!(files = sources.len(), decoded = decoded.len(), "Timing files decoded");
            document.objects.extend(decoded);

            let mut document = analyze(document, &config.engine);
            let headers = collect_headers(&document.objects);
            let mapping = map_event_columns(document.events_mapping.as_ref(), &headers);
            document.objects = create_events_tsv(std::mem::take(&mut document.objects), &mapping);
            document.events_mapping = Some(mapping);

            save_document(&document, output.as_deref().unwrap_or(&input))?;
        }
        Commands::Emit { input, source, dataset } => {
            let document = analyze(load_document(&input)?, &config.engine);
            let summary = emitter::emit(&document, &source, &dataset)
                .with_context(|| format!("Failed to emit dataset to {}", dataset.display()))?;
            info!(written = summary.written, linked = summary.linked, "Done");
        }
        Commands::Run { session, script, root } => {
            let root_folder = resolve_root_folder(root.as_deref(), &config);
            let work_dir = root_folder.join(&session);
            if !work_dir.is_dir() {
                bail!("Work directory {} does not exist", work_dir.display());
            }

            let runner = ScriptRunner::new(config.supervisor.clone());
            let engine = config.engine.clone();
            let outcome = runner
                .run(&work_dir, &script, |dir| {
                    let path = dir.join("dataset.json");
                    if path.exists() {
                        let document = analyze(load_document(&path)?, &engine);
                        save_document(&document, &path)?;
                    }
                    Ok(())
                })
                .await?;

            match outcome {
                RunOutcome::Completed => info!(session = %session, "Conversion completed"),
                RunOutcome::Canceled => info!(session = %session, "Conversion canceled"),
                RunOutcome::Failed { exit_code, last_error } => bail!(
                    "Conversion failed (exit code {:?}): {}",
                    exit_code,
                    last_error.unwrap_or_default()
                ),
            }
        }
    }

    Ok(())
}

/// `RUST_LOG` wins over the configured level; an optional log file receives a
/// second, uncolored copy
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let file_layer = match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}
