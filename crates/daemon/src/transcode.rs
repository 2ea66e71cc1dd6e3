use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

/// Result of a finished transcode attempt
#[derive(Debug)]
pub struct TranscodeResult {
    pub exit_code: i32,
    pub stderr: String,
}

impl TranscodeResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Failure reason derived from the tool's stderr, trimmed to the last
    /// few lines so it fits in a task's error message
    pub fn failure_reason(&self) -> String {
        let tail: Vec<&str> = self
            .stderr
            .lines()
            .filter(|l| !l.trim().is_empty())
            .rev()
            .take(3)
            .collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        if tail.is_empty() {
            format!("ffmpeg exit code {}", self.exit_code)
        } else {
            format!("ffmpeg error: {}", tail.join(" | "))
        }
    }
}

/// The external transcoding collaborator.
///
/// An Err from `transcode` means the invocation itself broke (binary
/// missing, spawn failure); a clean run that produced a non-zero exit
/// code is an Ok result with `success() == false`.
#[async_trait]
pub trait Transcode: Send + Sync {
    async fn transcode(&self, input: &Path, output: &Path) -> Result<TranscodeResult>;
}

/// Production transcoder: h264 transport-stream conversion via ffmpeg
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg_bin: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_bin: &Path) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.to_path_buf(),
        }
    }
}

#[async_trait]
impl Transcode for FfmpegTranscoder {
    async fn transcode(&self, input: &Path, output: &Path) -> Result<TranscodeResult> {
        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.arg("-n")
            .arg("-i")
            .arg(input)
            .arg("-bsf:v")
            .arg("h264_mp4toannexb")
            .arg("-profile:v")
            .arg("main")
            .arg("-crf")
            .arg("20")
            .arg("-codec:v")
            .arg("libx264")
            .arg("-x264opts")
            .arg("keyint=100")
            .arg("-preset")
            .arg("fast")
            .arg("-codec:a")
            .arg("aac")
            .arg("-map")
            .arg("v:0")
            .arg("-map")
            .arg("0:a")
            .arg("-strict")
            .arg("-2")
            .arg("-sn")
            .arg("-maxrate")
            .arg("14M")
            .arg("-bufsize")
            .arg("1M")
            .arg(output)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // a dropped attempt (deadline expiry) must not leak the child
            .kill_on_drop(true);

        debug!(
            "running {} -i {} -> {}",
            self.ffmpeg_bin.display(),
            input.display(),
            output.display()
        );

        let result = cmd
            .output()
            .await
            .with_context(|| format!("Failed to execute ffmpeg for: {}", input.display()))?;

        let exit_code = result.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&result.stderr).to_string();
        debug!("ffmpeg exit code: {}, stderr length: {}", exit_code, stderr.len());

        Ok(TranscodeResult { exit_code, stderr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_is_exit_zero() {
        let ok = TranscodeResult {
            exit_code: 0,
            stderr: String::new(),
        };
        assert!(ok.success());
        let failed = TranscodeResult {
            exit_code: 1,
            stderr: String::new(),
        };
        assert!(!failed.success());
    }

    #[test]
    fn test_failure_reason_uses_stderr_tail() {
        let result = TranscodeResult {
            exit_code: 1,
            stderr: "line one\nline two\nline three\nline four\n".to_string(),
        };
        let reason = result.failure_reason();
        assert!(reason.starts_with("ffmpeg error:"));
        assert!(reason.contains("line four"));
        assert!(!reason.contains("line one"));
    }

    #[test]
    fn test_failure_reason_without_stderr() {
        let result = TranscodeResult {
            exit_code: 187,
            stderr: "  \n".to_string(),
        };
        assert_eq!(result.failure_reason(), "ffmpeg exit code 187");
    }
}
