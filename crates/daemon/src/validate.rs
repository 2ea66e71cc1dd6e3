use std::path::{Path, PathBuf};

use log::debug;
use sysinfo::Disks;
use thiserror::Error;

use crate::config::DaemonConfig;

/// Media container extensions accepted for transcoding
pub const ALLOWED_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "ts", "flv"];

/// A failed pre-flight check. Validation failures are terminal for the
/// task: none of these conditions clears up by retrying the transcode.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid file extension {0:?}, allowed: mp4, mkv, avi, mov, ts, flv")]
    InvalidExtension(String),
    #[error("source file not found: {}", .0.display())]
    SourceMissing(PathBuf),
    #[error("not enough disk space: need {required} bytes free, {available} available")]
    InsufficientSpace { required: u64, available: u64 },
    #[error("output file already exists: {}", .0.display())]
    OutputCollision(PathBuf),
}

/// Stateless pre-flight checks for a task's source file.
///
/// Checks run in a fixed order and short-circuit on the first failure;
/// the later checks touch the filesystem and are more expensive. No check
/// mutates anything, so validation is safe to repeat.
#[derive(Debug, Clone)]
pub struct Validator {
    uploads_dir: PathBuf,
    processed_dir: PathBuf,
}

impl Validator {
    pub fn new(cfg: &DaemonConfig) -> Self {
        Self {
            uploads_dir: cfg.uploads_dir.clone(),
            processed_dir: cfg.processed_dir.clone(),
        }
    }

    /// Full path of a task's source file in the uploads area
    pub fn source_path(&self, filename: &str) -> PathBuf {
        self.uploads_dir.join(filename)
    }

    /// Destination path for a task's transcoded output
    pub fn output_path(&self, filename: &str) -> PathBuf {
        let stem = Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(filename);
        self.processed_dir.join(format!("processed_{}.ts", stem))
    }

    /// Run all checks for a filename, in order:
    /// extension, source existence, free space, output collision.
    pub fn validate(&self, filename: &str) -> Result<(), ValidationError> {
        self.check_extension(filename)?;
        let size = self.check_source(filename)?;
        self.check_space(size)?;
        self.check_collision(filename)?;
        Ok(())
    }

    fn check_extension(&self, filename: &str) -> Result<(), ValidationError> {
        let ext = Path::new(filename)
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase())
            .unwrap_or_default();
        if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
            return Err(ValidationError::InvalidExtension(ext));
        }
        Ok(())
    }

    fn check_source(&self, filename: &str) -> Result<u64, ValidationError> {
        let path = self.source_path(filename);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(meta.len()),
            _ => Err(ValidationError::SourceMissing(path)),
        }
    }

    fn check_space(&self, source_size: u64) -> Result<(), ValidationError> {
        // headroom for the transcoded output plus safety margin
        let required = source_size.saturating_mul(2);
        let available = match free_space_at(&self.processed_dir) {
            Some(bytes) => bytes,
            None => {
                // no disk matched (e.g. exotic mounts); don't block on an
                // estimate we cannot make
                debug!(
                    "could not determine free space at {}, skipping check",
                    self.processed_dir.display()
                );
                return Ok(());
            }
        };
        debug!(
            "free space at {}: {} bytes ({} required)",
            self.processed_dir.display(),
            available,
            required
        );
        if available <= required {
            return Err(ValidationError::InsufficientSpace {
                required,
                available,
            });
        }
        Ok(())
    }

    fn check_collision(&self, filename: &str) -> Result<(), ValidationError> {
        let output = self.output_path(filename);
        if output.exists() {
            return Err(ValidationError::OutputCollision(output));
        }
        Ok(())
    }
}

/// Available bytes on the disk holding `path`, matched by the longest
/// mount point that prefixes it
fn free_space_at(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}
