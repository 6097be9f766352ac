use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::Config;
use crate::error::PipelineError;

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    pub streams: Vec<FFProbeStream>,
    pub format: FFProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    #[serde(rename = "format_name")]
    pub format_name: String,
    #[serde(rename = "bit_rate")]
    pub bit_rate: Option<String>,
    pub duration: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    #[serde(rename = "codec_type")]
    pub codec_type: Option<String>,
    #[serde(rename = "codec_name")]
    pub codec_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    #[serde(rename = "avg_frame_rate")]
    pub avg_frame_rate: Option<String>,
    #[serde(rename = "r_frame_rate")]
    pub r_frame_rate: Option<String>,
    #[serde(rename = "nb_frames")]
    pub nb_frames: Option<String>,
    #[serde(rename = "bit_rate")]
    pub bit_rate: Option<String>,
    pub duration: Option<String>,
}

/// Immutable video properties fetched once per job.
///
/// Drives extraction parameters and, for rescale jobs, the bitrate scale
/// factor relative to the source bitrate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoMetadata {
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u64,
    pub codec: String,
    pub container: String,
    pub frame_rate: f64,
    pub duration_secs: f64,
    pub total_frames: u64,
    pub has_audio: bool,
}

impl VideoMetadata {
    /// Build metadata from parsed ffprobe output.
    ///
    /// Pure conversion so parsing is testable against literal JSON fixtures;
    /// identical probe output always yields identical metadata.
    pub fn from_probe(data: &FFProbeData) -> Result<Self, PipelineError> {
        let video = data
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .ok_or_else(|| PipelineError::Probe("no video stream found".to_string()))?;

        let width = video.width.unwrap_or(0);
        let height = video.height.unwrap_or(0);
        if width == 0 || height == 0 {
            return Err(PipelineError::Probe(
                "video stream has no resolution".to_string(),
            ));
        }

        let frame_rate = video
            .avg_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| video.r_frame_rate.as_deref().and_then(parse_frame_rate))
            .ok_or_else(|| PipelineError::Probe("video stream has no frame rate".to_string()))?;

        // Stream bitrate first, format bitrate as fallback
        let bitrate_bps = video
            .bit_rate
            .as_deref()
            .and_then(|s| s.parse::<u64>().ok())
            .or_else(|| {
                data.format
                    .bit_rate
                    .as_deref()
                    .and_then(|s| s.parse::<u64>().ok())
            })
            .unwrap_or(0);

        let duration_secs = video
            .duration
            .as_deref()
            .and_then(|s| s.parse::<f64>().ok())
            .or_else(|| {
                data.format
                    .duration
                    .as_deref()
                    .and_then(|s| s.parse::<f64>().ok())
            })
            .unwrap_or(0.0);

        // nb_frames is absent from many containers; fall back to duration * fps
        let total_frames = video
            .nb_frames
            .as_deref()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|&n| n > 0)
            .unwrap_or_else(|| (duration_secs * frame_rate).round() as u64);

        let has_audio = data
            .streams
            .iter()
            .any(|s| s.codec_type.as_deref() == Some("audio"));

        Ok(VideoMetadata {
            width,
            height,
            bitrate_kbps: bitrate_bps / 1000,
            codec: video
                .codec_name
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            container: data.format.format_name.clone(),
            frame_rate,
            duration_secs,
            total_frames,
            has_audio,
        })
    }

    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Parse a frame rate from ffprobe's notation (e.g. "30/1", "30000/1001", "29.97")
pub fn parse_frame_rate(frame_rate_str: &str) -> Option<f64> {
    if let Some(slash_pos) = frame_rate_str.find('/') {
        let num_str = &frame_rate_str[..slash_pos];
        let den_str = &frame_rate_str[slash_pos + 1..];
        if let (Ok(num), Ok(den)) = (num_str.parse::<f64>(), den_str.parse::<f64>()) {
            if den != 0.0 && num > 0.0 {
                return Some(num / den);
            }
        }
        return None;
    }

    frame_rate_str
        .parse::<f64>()
        .ok()
        .filter(|&f| f > 0.0 && f < 1000.0)
}

/// Run ffprobe against a staged input file and parse the JSON output.
///
/// Side-effect-free on the input; invoked once per job. Failure terminates
/// only this job's pipeline.
pub async fn probe_file(cfg: &Config, file_path: &Path) -> Result<VideoMetadata, PipelineError> {
    if !file_path.exists() {
        return Err(PipelineError::Probe(format!(
            "file does not exist: {}",
            file_path.display()
        )));
    }

    debug!("ffprobe: probing {}", file_path.display());

    let output = Command::new(&cfg.ffprobe_bin)
        .kill_on_drop(true)
        .arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_streams")
        .arg("-show_format")
        .arg(file_path)
        .output()
        .await
        .map_err(|e| {
            PipelineError::Probe(format!(
                "failed to execute {}: {}",
                cfg.ffprobe_bin.display(),
                e
            ))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        return Err(PipelineError::Probe(format!(
            "ffprobe failed (exit code {}) for {}: {}",
            exit_code,
            file_path.display(),
            stderr.trim()
        )));
    }

    let json_str = String::from_utf8_lossy(&output.stdout);
    let data: FFProbeData = serde_json::from_str(&json_str)
        .map_err(|e| PipelineError::Probe(format!("failed to parse ffprobe JSON: {}", e)))?;

    VideoMetadata::from_probe(&data)
}
