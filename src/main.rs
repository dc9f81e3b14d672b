//! CLI entry point for mda-engine
//!
//! Provides a command-line interface for:
//! - Printing the summary of a batch file (image counts, memory, duration)
//! - Running a batch against the simulated microscope
//!
//! # Usage
//!
//! Summarize a batch:
//! ```bash
//! mda-engine summary demos/two_channel_stack.toml
//! ```
//!
//! Run it in simulation:
//! ```bash
//! mda-engine simulate demos/two_channel_stack.toml --width 256 --height 256
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mda_engine::acquisition::batch::BatchFile;
use mda_engine::acquisition::driver::AcquisitionDriver;
use mda_engine::acquisition::summary::verbose_summary;
use mda_engine::config::{EngineConfig, DEFAULT_CONFIG_PATH};
use mda_engine::context::AppContext;
use mda_engine::data::memory::InMemoryStorage;
use mda_engine::engine::simulated::SimulatedEngine;
use mda_engine::events::ShutdownCommencing;
use mda_engine::hardware::mock::{MockAutofocus, MockCore};
use mda_engine::hardware::{ImageGeometry, MicroscopeCore};
use mda_engine::logging;
use mda_engine::ui::HeadlessUi;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "mda-engine")]
#[command(about = "Multi-dimensional acquisition sequencing engine", long_about = None)]
struct Cli {
    /// Engine configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the summary of every sub-acquisition in a batch file
    Summary {
        /// Path to the batch TOML file
        batch: PathBuf,
    },

    /// Run a batch file against the simulated microscope
    Simulate {
        /// Path to the batch TOML file
        batch: PathBuf,

        /// Camera width in pixels
        #[arg(long, default_value = "512")]
        width: u32,

        /// Camera height in pixels
        #[arg(long, default_value = "512")]
        height: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = EngineConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Summary { batch } => print_summary(batch, &config),
        Commands::Simulate {
            batch,
            width,
            height,
        } => simulate(batch, config, ImageGeometry::new(width, height, 2)).await,
    }
}

fn load_batch(path: &Path, config: &EngineConfig) -> Result<BatchFile> {
    let batch = BatchFile::load(path).with_context(|| format!("reading batch {}", path.display()))?;
    Ok(match &config.storage.default_root {
        Some(root) => batch.with_default_root(root),
        None => batch,
    })
}

fn print_summary(path: PathBuf, config: &EngineConfig) -> Result<()> {
    let batch = load_batch(&path, config)?;
    let core = MockCore::default();
    let geometry = core.image_geometry();

    println!("📋 Batch: {}", path.display());
    for (index, entry) in batch.acquisition.iter().enumerate() {
        let settings = entry.settings.with_timing_from(&batch.timelapse);
        println!();
        println!("── Acquisition {} ({}) ──", index + 1, settings.prefix());
        println!(
            "{}",
            verbose_summary(&settings, &entry.positions, geometry, 10.0)?
        );
    }
    Ok(())
}

async fn simulate(path: PathBuf, config: EngineConfig, geometry: ImageGeometry) -> Result<()> {
    let batch = load_batch(&path, &config)?;

    println!("🔧 Initializing simulated microscope ({}x{})...", geometry.width, geometry.height);
    let core = Arc::new(MockCore::new(geometry));
    let engine = Arc::new(SimulatedEngine::with_timing(core.clone(), &config.engine));
    let storage = Arc::new(InMemoryStorage::new());
    let ui = Arc::new(HeadlessUi::new(true));

    let mut ctx = AppContext::new(core.clone(), ui.clone(), storage.clone()).with_config(config);
    if batch.acquisition.iter().any(|e| e.settings.autofocus().enabled) {
        ctx = ctx.with_autofocus(Arc::new(MockAutofocus::new(core.clone(), 0.0)));
    }
    let events = ctx.events.clone();
    let driver = AcquisitionDriver::new(ctx, engine);

    // Ctrl+C asks the driver whether the run may be discarded.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let request = ShutdownCommencing::new();
            events.post_shutdown(&request);
        }
    });

    println!("▶️  Running {} sub-acquisition(s)...", batch.acquisition.len());
    let stores = driver
        .run_acquisition(&batch.timelapse, &batch.settings(), &batch.position_lists())
        .await?;

    println!();
    println!("✅ Acquisition finished");
    for store in stores {
        println!("   {}: {} image(s)", store.name(), store.num_images());
    }
    for error in ui.errors() {
        eprintln!("   ⚠️  {}", error);
    }
    println!("   Snapped: {}", core.snap_count());
    Ok(())
}
