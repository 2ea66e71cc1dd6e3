use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the transcoding queue daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Directory where uploaded source files live
    pub uploads_dir: PathBuf,
    /// Directory where transcoded output files are written
    pub processed_dir: PathBuf,
    /// Path to the persistent queue document
    pub queue_file: PathBuf,
    /// Seconds between queue polls
    pub check_interval_secs: u64,
    /// Maximum number of concurrently running transcode attempts
    pub max_workers: usize,
    /// Retry budget assigned to every new task
    pub max_retries: u32,
    /// Terminal tasks older than this many days are removed by cleanup
    pub retention_days: i64,
    /// Optional per-attempt deadline; a transcode running longer than this
    /// is treated as a failed attempt
    pub transcode_timeout_secs: Option<u64>,
    /// Path to ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to ffprobe binary
    pub ffprobe_bin: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl DaemonConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            uploads_dir: PathBuf::from("/var/lib/vaultd/uploads"),
            processed_dir: PathBuf::from("/var/lib/vaultd/processed"),
            queue_file: PathBuf::from("/var/lib/vaultd/queue/tasks.json"),
            check_interval_secs: 1,
            max_workers: 2,
            max_retries: 3,
            retention_days: 7,
            transcode_timeout_secs: None,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // Try JSON first, then TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    let file_config: DaemonConfig = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                    config = file_config;
                } else {
                    let file_config: DaemonConfig = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                    config = file_config;
                }
            }
        }

        Ok(config)
    }
}
