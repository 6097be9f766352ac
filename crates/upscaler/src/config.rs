use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the upscaling orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the ffmpeg binary used for extraction, reassembly and muxing
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary used for metadata probing
    pub ffprobe_bin: PathBuf,
    /// Path to the Real-ESRGAN binary used for frame upscaling
    pub realesrgan_bin: PathBuf,
    /// Directory where finished artifacts are placed
    pub output_dir: PathBuf,
    /// Root directory under which per-job workspaces are created
    pub workspace_root: PathBuf,
    /// Grace period in seconds between asking a subprocess to terminate and
    /// force-killing it on cancellation
    pub term_grace_secs: u64,
    /// Capacity of the outbound progress/log event stream
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

impl Config {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            realesrgan_bin: PathBuf::from("realesrgan-ncnn-vulkan"),
            output_dir: PathBuf::from("output_videos"),
            workspace_root: std::env::temp_dir().join("upscaler-work"),
            term_grace_secs: 10,
            event_capacity: 256,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path).with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

                // Try JSON first, then TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    let file_config: Config = toml::from_str(&content).with_context(|| {
                        format!("Failed to parse TOML config: {}", config_path.display())
                    })?;
                    config = file_config;
                } else {
                    let file_config: Config =
                        serde_json::from_str(&content).with_context(|| {
                            format!("Failed to parse JSON config: {}", config_path.display())
                        })?;
                    config = file_config;
                }
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_no_path_given() {
        let cfg = Config::load_config(None).unwrap();
        assert_eq!(cfg.ffmpeg_bin, PathBuf::from("ffmpeg"));
        assert_eq!(cfg.term_grace_secs, 10);
        assert!(cfg.event_capacity > 0);
    }

    #[test]
    fn test_defaults_when_file_missing() {
        let cfg = Config::load_config(Some(Path::new("/nonexistent/upscaler.toml"))).unwrap();
        assert_eq!(cfg.realesrgan_bin, PathBuf::from("realesrgan-ncnn-vulkan"));
    }

    #[test]
    fn test_load_toml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upscaler.toml");
        std::fs::write(
            &path,
            r#"
ffmpeg_bin = "/opt/ffmpeg/bin/ffmpeg"
ffprobe_bin = "/opt/ffmpeg/bin/ffprobe"
realesrgan_bin = "/opt/esrgan/realesrgan-ncnn-vulkan"
output_dir = "/srv/out"
workspace_root = "/srv/work"
term_grace_secs = 5
event_capacity = 64
"#,
        )
        .unwrap();

        let cfg = Config::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.ffmpeg_bin, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(cfg.output_dir, PathBuf::from("/srv/out"));
        assert_eq!(cfg.term_grace_secs, 5);
        assert_eq!(cfg.event_capacity, 64);
    }

    #[test]
    fn test_load_json_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upscaler.json");
        std::fs::write(
            &path,
            r#"{
                "ffmpeg_bin": "ffmpeg",
                "ffprobe_bin": "ffprobe",
                "realesrgan_bin": "realesrgan-ncnn-vulkan",
                "output_dir": "out",
                "workspace_root": "work",
                "term_grace_secs": 2,
                "event_capacity": 16
            }"#,
        )
        .unwrap();

        let cfg = Config::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.workspace_root, PathBuf::from("work"));
        assert_eq!(cfg.term_grace_secs, 2);
    }
}
