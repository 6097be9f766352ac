use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use humansize::{format_size, DECIMAL};
use log::{info, warn};
use upscaler::{BatchCoordinator, Config, JobKind, JobRequest, JobStatus, PipelineEvent, UpscaleModel};
use walkdir::WalkDir;

/// Media file extensions considered for processing
const MEDIA_EXTENSIONS: &[&str] = &["mkv", "mp4", "m4v", "avi", "mov", "webm"];

/// Batch video upscaler driving ffmpeg and Real-ESRGAN
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Upscaling model
    #[arg(short, long, default_value = "realesrgan-x4plus")]
    model: String,

    /// Integer upscale factor
    #[arg(short, long, default_value_t = 4)]
    scale: u32,

    /// Rescale to a fixed resolution instead of upscaling,
    /// e.g. 1280x720 or 1280x720@24
    #[arg(long)]
    rescale: Option<String>,

    /// Shut the computer down after the batch completes
    #[arg(long)]
    shutdown_after: bool,

    /// Open the output folder when the batch is done
    #[arg(long)]
    open_output: bool,

    /// Video files or directories to process
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger - use RUST_LOG env var or default to info level
    env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .init();

    let args = Args::parse();

    let cfg = Config::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    let kind = parse_job_kind(&args)?;

    let files = collect_media_files(&args.inputs)?;
    if files.is_empty() {
        bail!("No video files found in the given inputs");
    }

    let coordinator =
        Arc::new(BatchCoordinator::new(cfg).context("Failed to initialize the coordinator")?);
    coordinator.request_shutdown_after(args.shutdown_after);

    // Print the event stream while the batch runs
    let mut events = coordinator.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PipelineEvent::Progress { file, percent }) => {
                    println!("[{:>3}%] {}", percent, file);
                }
                Ok(PipelineEvent::Log(line)) => {
                    if !line.trim().is_empty() {
                        println!("       {}", line);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event stream lagged, skipped {} event(s)", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Ctrl-C cancels the whole batch; the final status map still prints
    let canceler = Arc::clone(&coordinator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancellation requested, stopping the batch...");
            canceler.cancel();
        }
    });

    let mut requests = Vec::new();
    for (index, path) in files.iter().enumerate() {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("video.mp4")
            .to_string();
        info!(
            "Queued {} ({})",
            file_name,
            format_size(data.len() as u64, DECIMAL)
        );
        requests.push(JobRequest {
            file_code: format!("f{:03}", index + 1),
            file_name,
            data,
            kind: kind.clone(),
        });
    }

    let results = coordinator.submit(requests).await;
    printer.abort();

    println!();
    println!("Batch results:");
    for (file_name, status) in &results {
        match status {
            JobStatus::Completed(path) => {
                let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
                println!(
                    "  {} -> {} ({}, {})",
                    file_name,
                    status.label(),
                    path.display(),
                    format_size(size, DECIMAL)
                );
            }
            _ => println!("  {} -> {}", file_name, status.label()),
        }
    }

    if args.open_output {
        if let Err(e) = coordinator.open_output_dir() {
            warn!("Could not open the output folder: {}", e);
        }
    }

    if results
        .values()
        .any(|s| !matches!(s, JobStatus::Completed(_)))
    {
        std::process::exit(1);
    }
    Ok(())
}

fn parse_job_kind(args: &Args) -> Result<JobKind> {
    if let Some(spec) = &args.rescale {
        return parse_rescale(spec);
    }

    let model = UpscaleModel::from_name(&args.model)
        .with_context(|| format!("Unknown model: {}", args.model))?;
    if !model.supports_scale(args.scale) {
        bail!(
            "Model {} supports scales {:?}, got x{}",
            model.model_name(),
            model.supported_scales(),
            args.scale
        );
    }
    Ok(JobKind::Upscale {
        model,
        scale: args.scale,
    })
}

/// Parse a rescale target of the form WIDTHxHEIGHT or WIDTHxHEIGHT@FPS
fn parse_rescale(spec: &str) -> Result<JobKind> {
    let (resolution, frame_rate) = match spec.split_once('@') {
        Some((res, fps)) => {
            let fps: f64 = fps
                .parse()
                .with_context(|| format!("Invalid frame rate in: {}", spec))?;
            if fps <= 0.0 {
                bail!("Frame rate must be positive: {}", spec);
            }
            (res, Some(fps))
        }
        None => (spec, None),
    };

    let (w, h) = resolution
        .split_once('x')
        .with_context(|| format!("Expected WIDTHxHEIGHT[@FPS], got: {}", spec))?;
    let width: u32 = w
        .parse()
        .with_context(|| format!("Invalid width in: {}", spec))?;
    let height: u32 = h
        .parse()
        .with_context(|| format!("Invalid height in: {}", spec))?;
    if width == 0 || height == 0 {
        bail!("Rescale target must be non-zero: {}", spec);
    }

    Ok(JobKind::Rescale {
        width,
        height,
        frame_rate,
    })
}

/// Expand files and directories into the list of media files to process
fn collect_media_files(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            for entry in WalkDir::new(input)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if path.is_file() && is_media_file(path) {
                    files.push(path.to_path_buf());
                }
            }
        } else if input.is_file() {
            files.push(input.clone());
        } else {
            bail!("Input does not exist: {}", input.display());
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| MEDIA_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}
