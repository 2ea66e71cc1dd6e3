use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::process::Command;

/// Raw ffprobe output: the stream list we ask for
#[derive(Debug, Clone, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<i32>,
    height: Option<i32>,
    avg_frame_rate: Option<String>,
    tags: Option<HashMap<String, String>>,
}

/// Summarized technical info about a media file, for listings
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    pub video_streams: Vec<VideoStreamInfo>,
    pub audio_streams: Vec<AudioStreamInfo>,
}

#[derive(Debug, Clone)]
pub struct VideoStreamInfo {
    pub codec: String,
    pub resolution: String,
    pub fps: f64,
}

#[derive(Debug, Clone)]
pub struct AudioStreamInfo {
    pub codec: String,
    pub language: String,
}

/// Probe a media file with ffprobe and summarize its streams
pub async fn probe_file(ffprobe_bin: &Path, file_path: &Path) -> Result<MediaInfo> {
    if !file_path.exists() {
        anyhow::bail!("File does not exist: {}", file_path.display());
    }

    let output = Command::new(ffprobe_bin)
        .arg("-v")
        .arg("error")
        .arg("-show_entries")
        .arg("stream")
        .arg("-of")
        .arg("json")
        .arg(file_path)
        .output()
        .await
        .with_context(|| format!("Failed to execute ffprobe for: {}", file_path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "ffprobe failed (exit code {}) for {}: {}",
            output.status.code().unwrap_or(-1),
            file_path.display(),
            stderr.trim()
        );
    }

    let json_str = String::from_utf8(output.stdout)
        .context("ffprobe output is not valid UTF-8")?;
    let data: ProbeOutput = serde_json::from_str(&json_str)
        .with_context(|| format!("Failed to parse ffprobe JSON for: {}", file_path.display()))?;

    Ok(summarize(data))
}

fn summarize(data: ProbeOutput) -> MediaInfo {
    let mut info = MediaInfo::default();
    for stream in data.streams {
        match stream.codec_type.as_deref() {
            Some("video") => {
                let fps = stream
                    .avg_frame_rate
                    .as_deref()
                    .and_then(parse_frame_rate)
                    .unwrap_or(0.0);
                info.video_streams.push(VideoStreamInfo {
                    codec: stream.codec_name.clone().unwrap_or_else(|| "unknown".to_string()),
                    resolution: format!(
                        "{}x{}",
                        stream.width.unwrap_or(0),
                        stream.height.unwrap_or(0)
                    ),
                    fps: (fps * 100.0).round() / 100.0,
                });
            }
            Some("audio") => {
                let language = stream
                    .tags
                    .as_ref()
                    .and_then(|t| t.get("language"))
                    .cloned()
                    .unwrap_or_else(|| "Unknown".to_string());
                info.audio_streams.push(AudioStreamInfo {
                    codec: stream.codec_name.clone().unwrap_or_else(|| "unknown".to_string()),
                    language,
                });
            }
            _ => {}
        }
    }
    info
}

/// Parse a frame rate from ffprobe's fraction form (e.g. "30/1", "24000/1001")
/// or a plain decimal
fn parse_frame_rate(frame_rate_str: &str) -> Option<f64> {
    if let Some((num_str, den_str)) = frame_rate_str.split_once('/') {
        if let (Ok(num), Ok(den)) = (num_str.parse::<f64>(), den_str.parse::<f64>()) {
            if den != 0.0 && num > 0.0 {
                return Some(num / den);
            }
        }
        return None;
    }
    frame_rate_str.parse::<f64>().ok().filter(|&f| f > 0.0 && f < 200.0)
}
