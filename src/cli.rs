use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

use canvas_mirror_core::discovery::{available_courses, Endpoints};
use canvas_mirror_core::download::{collect_all, CanvasClient};
use canvas_mirror_core::storage::Backend;
use canvas_mirror_core::synchronise::synchronise;

use crate::load_config::load_config;
use crate::selection::{load_selection, save_selection, select_courses, CourseSelection};

/// CLI for canvas-mirror: keep a local or Drive copy of Canvas course content.
#[derive(Parser)]
#[clap(
    name = "canvas-mirror",
    version,
    about = "Incrementally mirror Canvas LMS course content into a local folder or Google Drive"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Synchronise the selected courses into the configured storage
    Sync {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Course id to sync; repeat for several. Remembered for later runs
        #[clap(long = "course")]
        course: Vec<u64>,
        /// Sync every available course
        #[clap(long, conflicts_with = "course")]
        all: bool,
    },
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    info!("trace_initialised");

    match cli.command {
        Commands::Sync {
            config,
            course,
            all,
        } => sync(config, &course, all).await,
    }
}

async fn sync(config_path: PathBuf, requested: &[u64], all: bool) -> Result<()> {
    let loaded = load_config(&config_path)?;
    let config = &loaded.sync;

    let api = CanvasClient::new(&config.canvas, &config.performance)
        .context("Failed to build Canvas client")?;
    let storage = Backend::from_config(config)
        .await
        .context("Failed to prepare storage")?;

    let endpoints = Endpoints::new(config.canvas.base_url());
    let available = available_courses(collect_all(&api, &endpoints.courses()).await);
    if available.is_empty() {
        println!("No available courses found.");
        return Ok(());
    }

    let saved = load_selection(&loaded.state_file);
    let courses = select_courses(available, requested, all, saved.as_ref());
    if let Err(e) = save_selection(&loaded.state_file, &CourseSelection::from_courses(&courses)) {
        warn!(error = ?e, "Could not save course selection");
    }

    println!("Synchronise starting...");
    let report = synchronise(config, &api, &storage, &courses)
        .await
        .context("Synchronisation failed")?;
    print!("{}", report.summary);
    let failed = report.total_failed();
    if failed > 0 {
        println!("{failed} resource(s) could not be synchronised; see the log for details.");
    }
    info!(failed, "Run complete");
    Ok(())
}
