use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use clap::{Parser, Subcommand};
use daemon::{
    config::DaemonConfig, probe, scheduler::Scheduler, store::TaskStore,
    transcode::FfmpegTranscoder, validate::ALLOWED_EXTENSIONS,
};
use humansize::{format_size, DECIMAL};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Video transcoding queue daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the processing daemon (default)
    Run,
    /// Add an uploaded file to the processing queue
    Add {
        /// Filename in the uploads directory
        filename: String,
    },
    /// Show the status of a queued task
    Status {
        /// Task id returned by `add`
        task_id: String,
    },
    /// List files waiting in the uploads directory
    List,
    /// List transcoded files in the processed directory
    Ready,
    /// Remove old completed/failed tasks from the queue
    Cleanup {
        /// Age threshold in days (defaults to the configured retention)
        #[arg(long)]
        days: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    builder.format_timestamp_secs();
    if args.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    // Fall back to the system config location, same as the TUI
    let default_config_path = PathBuf::from("/etc/vaultd/config.json");
    let config_path = args
        .config
        .as_deref()
        .or_else(|| default_config_path.exists().then_some(default_config_path.as_path()));

    let cfg = DaemonConfig::load_config(config_path)
        .context("Failed to load configuration")?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(cfg).await,
        Command::Add { filename } => add_task(&cfg, &filename),
        Command::Status { task_id } => show_status(&cfg, &task_id),
        Command::List => list_files(&cfg, &cfg.uploads_dir).await,
        Command::Ready => list_files(&cfg, &cfg.processed_dir).await,
        Command::Cleanup { days } => run_cleanup(&cfg, days),
    }
}

async fn run_daemon(cfg: DaemonConfig) -> Result<()> {
    info!("Vault daemon starting");
    info!("Configuration loaded:");
    info!("  Uploads dir: {}", cfg.uploads_dir.display());
    info!("  Processed dir: {}", cfg.processed_dir.display());
    info!("  Queue file: {}", cfg.queue_file.display());
    info!("  Check interval: {}s", cfg.check_interval_secs);
    info!("  Max workers: {}", cfg.max_workers);
    info!("  Max retries: {}", cfg.max_retries);
    match cfg.transcode_timeout_secs {
        Some(secs) => info!("  Transcode timeout: {}s", secs),
        None => info!("  Transcode timeout: disabled"),
    }

    fs::create_dir_all(&cfg.uploads_dir)
        .with_context(|| format!("Failed to create uploads directory: {}", cfg.uploads_dir.display()))?;
    fs::create_dir_all(&cfg.processed_dir)
        .with_context(|| format!("Failed to create processed directory: {}", cfg.processed_dir.display()))?;

    let store = Arc::new(
        TaskStore::open(&cfg.queue_file, cfg.max_retries)
            .with_context(|| format!("Failed to open queue file: {}", cfg.queue_file.display()))?,
    );
    let transcoder = Arc::new(FfmpegTranscoder::new(&cfg.ffmpeg_bin));

    let scheduler = Scheduler::new(&cfg, store, transcoder);
    let handle = scheduler.handle();
    let daemon = tokio::spawn(scheduler.run());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("🔄 Shutdown requested, stopping daemon...");
    handle.shutdown();

    daemon.await.context("Daemon task panicked")?;
    info!("✅ Shutdown complete");
    Ok(())
}

fn add_task(cfg: &DaemonConfig, filename: &str) -> Result<()> {
    let store = TaskStore::open(&cfg.queue_file, cfg.max_retries)
        .with_context(|| format!("Failed to open queue file: {}", cfg.queue_file.display()))?;

    if let Some(existing) = store
        .find_by_filename(filename)
        .context("Failed to check queue for existing task")?
    {
        println!(
            "{} already queued: task {} ({})",
            filename, existing.id, existing.status
        );
        return Ok(());
    }

    if !cfg.uploads_dir.join(filename).exists() {
        warn!("{} is not in the uploads directory yet", filename);
    }

    let task = store
        .enqueue(filename)
        .with_context(|| format!("Failed to enqueue {}", filename))?;
    println!("queued {} as task {}", filename, task.id);
    Ok(())
}

fn show_status(cfg: &DaemonConfig, task_id: &str) -> Result<()> {
    let store = TaskStore::open(&cfg.queue_file, cfg.max_retries)
        .with_context(|| format!("Failed to open queue file: {}", cfg.queue_file.display()))?;

    match store.lookup(task_id).context("Failed to read queue")? {
        Some(task) => {
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        None => {
            println!("task {} not found", task_id);
        }
    }
    Ok(())
}

async fn list_files(cfg: &DaemonConfig, dir: &Path) -> Result<()> {
    if !dir.exists() {
        println!("no files found ({} does not exist)", dir.display());
        return Ok(());
    }

    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    if entries.is_empty() {
        println!("no files found in {}", dir.display());
        return Ok(());
    }

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        println!("{}  ({})", name, format_size(size, DECIMAL));

        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase())
            .unwrap_or_default();
        if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }

        match probe::probe_file(&cfg.ffprobe_bin, &path).await {
            Ok(info) => {
                for v in &info.video_streams {
                    println!("    video: {} {} @ {} fps", v.codec, v.resolution, v.fps);
                }
                for a in &info.audio_streams {
                    println!("    audio: {} [{}]", a.codec, a.language);
                }
            }
            Err(e) => {
                warn!("Failed to probe {}: {:#}", path.display(), e);
            }
        }
    }
    Ok(())
}

fn run_cleanup(cfg: &DaemonConfig, days: Option<i64>) -> Result<()> {
    let store = TaskStore::open(&cfg.queue_file, cfg.max_retries)
        .with_context(|| format!("Failed to open queue file: {}", cfg.queue_file.display()))?;

    let days = days.unwrap_or(cfg.retention_days);
    let removed = store
        .cleanup(ChronoDuration::days(days))
        .context("Failed to clean up old tasks")?;
    println!("removed {} task(s) older than {} day(s)", removed, days);
    Ok(())
}
