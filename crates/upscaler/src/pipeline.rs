use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::PipelineError;
use crate::events::EventHub;
use crate::job::{Job, JobKind, JobRequest, JobStatus, ProgressTracker, Stage};
use crate::model::UpscaleModel;
use crate::probe::{self, VideoMetadata};
use crate::progress;
use crate::runner::{RunOutcome, ToolRunner};
use crate::workspace::{JobWorkspace, WorkspaceManager};

/// Resolution target for a rescale job
#[derive(Debug, Clone, Copy)]
struct RescaleTarget {
    width: u32,
    height: u32,
    frame_rate: Option<f64>,
}

/// Drives one file through the processing stages.
///
/// The pipeline exclusively owns its Job and Workspace. The only shared state
/// it touches is the upscaling token, the batch cancellation token, and the
/// outbound event stream; the token is checked before every stage and while
/// blocked, so cancellation short-circuits straight to cleanup.
pub struct FilePipeline {
    cfg: Arc<Config>,
    events: Arc<EventHub>,
    workspaces: Arc<WorkspaceManager>,
    upscale_token: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl FilePipeline {
    pub fn new(
        cfg: Arc<Config>,
        events: Arc<EventHub>,
        workspaces: Arc<WorkspaceManager>,
        upscale_token: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cfg,
            events,
            workspaces,
            upscale_token,
            cancel,
        }
    }

    /// Drive one job to a terminal status.
    ///
    /// Every error is folded into this job's status here; nothing propagates
    /// to sibling jobs.
    pub async fn run(&self, request: JobRequest) -> JobStatus {
        let mut job = Job::new(&request.file_code, &request.file_name);
        job.started_at = Some(Utc::now());
        info!(
            "Job {}: 🚀 starting {} ({} bytes)",
            job.file_code,
            job.file_name,
            request.data.len()
        );

        let result = self.execute(&request, &mut job).await;
        job.finished_at = Some(Utc::now());

        job.status = match result {
            Ok(output) => {
                info!("Job {}: ✅ completed -> {}", job.file_code, output.display());
                JobStatus::Completed(output)
            }
            Err(PipelineError::Canceled) => {
                info!("Job {}: canceled during {}", job.file_code, job.stage);
                JobStatus::Canceled
            }
            Err(e) => {
                error!("Job {}: ❌ failed during {}: {}", job.file_code, job.stage, e);
                JobStatus::Failed(e.reason())
            }
        };
        job.status.clone()
    }

    async fn execute(
        &self,
        request: &JobRequest,
        job: &mut Job,
    ) -> Result<PathBuf, PipelineError> {
        if request.data.is_empty() {
            return Err(PipelineError::Input("empty upload".to_string()));
        }
        self.checkpoint()?;

        job.stage = Stage::Probing;
        let workspace = self
            .workspaces
            .acquire(&request.file_code, &request.file_name)?;

        // Once any stage has written output, failure or cancellation below
        // must still reclaim the tree.
        let result = self.run_stages(request, job, &workspace).await;
        if let Err(e) = self.workspaces.release(&workspace) {
            warn!(
                "Job {}: failed to reclaim workspace {}: {}",
                job.file_code,
                workspace.root.display(),
                e
            );
        }
        result
    }

    async fn run_stages(
        &self,
        request: &JobRequest,
        job: &mut Job,
        ws: &JobWorkspace,
    ) -> Result<PathBuf, PipelineError> {
        let mut tracker = ProgressTracker::new();

        // Probing: stage the upload, then one ffprobe pass. The probe is a
        // suspension point like any other subprocess wait.
        tokio::fs::write(&ws.input_path, &request.data).await?;
        let meta = tokio::select! {
            meta = probe::probe_file(&self.cfg, &ws.input_path) => meta?,
            _ = self.cancel.cancelled() => return Err(PipelineError::Canceled),
        };
        info!(
            "Job {}: probed {}x{} {} {:.2} fps, {} frames, {} kbps, audio: {}",
            job.file_code,
            meta.width,
            meta.height,
            meta.codec,
            meta.frame_rate,
            meta.total_frames,
            meta.bitrate_kbps,
            meta.has_audio
        );
        self.publish(job, &mut tracker, 0);

        self.checkpoint()?;
        job.stage = Stage::Extracting;
        self.extract_frames(job, ws, &meta, &mut tracker).await?;

        if let JobKind::Upscale { model, scale } = &request.kind {
            self.checkpoint()?;
            job.stage = Stage::Upscaling;
            // The compute-bound stage is serialized batch-wide; the wait for
            // the token is itself a suspension point and abandons on
            // cancellation instead of acquiring first.
            let _permit = tokio::select! {
                permit = self.upscale_token.acquire() => {
                    permit.map_err(|_| PipelineError::Canceled)?
                }
                _ = self.cancel.cancelled() => return Err(PipelineError::Canceled),
            };
            self.upscale_frames(job, ws, *model, *scale, &mut tracker)
                .await?;
        }

        self.checkpoint()?;
        job.stage = Stage::Reassembling;
        self.reassemble(job, ws, &meta, &request.kind, &mut tracker)
            .await?;

        if meta.has_audio {
            self.checkpoint()?;
            job.stage = Stage::MergingAudio;
            self.merge_audio(job, ws, &mut tracker).await?;
        } else {
            info!("Job {}: source has no audio track, skipping merge", job.file_code);
        }

        self.checkpoint()?;
        job.stage = Stage::Finalizing;
        let artifact = if meta.has_audio {
            &ws.merged_path
        } else {
            &ws.assembled_path
        };
        let suffix = match request.kind {
            JobKind::Upscale { .. } => "_upscaled",
            JobKind::Rescale { .. } => "_rescaled",
        };
        let output = self.finalize(job, artifact, suffix).await?;
        self.publish(job, &mut tracker, 100);
        Ok(output)
    }

    async fn extract_frames(
        &self,
        job: &mut Job,
        ws: &JobWorkspace,
        meta: &VideoMetadata,
        tracker: &mut ProgressTracker,
    ) -> Result<(), PipelineError> {
        let pattern = ws.frames_dir.join("frame_%06d.png");
        let args = extract_args(&ws.input_path, &pattern);
        let total = meta.total_frames.max(1);

        let outcome = self
            .stage_runner()
            .run(&self.cfg.ffmpeg_bin, &args, None, &self.cancel, |line| {
                if let Some(frame) = progress::parse_frame_count(line) {
                    let ratio = frame as f64 / total as f64;
                    self.publish(job, tracker, Stage::Extracting.percent_at(ratio));
                } else {
                    self.events.publish_line(line);
                }
            })
            .await?;

        match outcome {
            RunOutcome::Canceled => Err(PipelineError::Canceled),
            RunOutcome::Exited { code: 0, .. } => {
                if list_frames(&ws.frames_dir)?.is_empty() {
                    return Err(PipelineError::Tool {
                        stage: Stage::Extracting,
                        exit_code: 0,
                        detail: "no frames produced".to_string(),
                    });
                }
                self.publish(job, tracker, Stage::Extracting.percent_at(1.0));
                Ok(())
            }
            RunOutcome::Exited { code, tail } => Err(PipelineError::Tool {
                stage: Stage::Extracting,
                exit_code: code,
                detail: tail.join("\n"),
            }),
        }
    }

    /// Upscale each extracted frame with the selected model and scale.
    ///
    /// Invoked once per frame so the percentage is exact and cancellation
    /// takes effect between frames without waiting for a long-running
    /// directory pass.
    async fn upscale_frames(
        &self,
        job: &mut Job,
        ws: &JobWorkspace,
        model: UpscaleModel,
        scale: u32,
        tracker: &mut ProgressTracker,
    ) -> Result<(), PipelineError> {
        let frames = list_frames(&ws.frames_dir)?;
        let total = frames.len().max(1);
        info!(
            "Job {}: upscaling {} frames with {} at x{}",
            job.file_code,
            frames.len(),
            model.model_name(),
            scale
        );

        let runner = self.stage_runner();
        for (index, frame) in frames.iter().enumerate() {
            self.checkpoint()?;

            let Some(name) = frame.file_name() else {
                continue;
            };
            let output = ws.upscaled_dir.join(name);
            let args = upscale_frame_args(frame, &output, model, scale);

            let outcome = runner
                .run(&self.cfg.realesrgan_bin, &args, None, &self.cancel, |line| {
                    self.events.publish_line(line);
                })
                .await?;

            match outcome {
                RunOutcome::Canceled => return Err(PipelineError::Canceled),
                RunOutcome::Exited { code: 0, .. } => {}
                RunOutcome::Exited { code, tail } => {
                    return Err(PipelineError::Tool {
                        stage: Stage::Upscaling,
                        exit_code: code,
                        detail: tail.join("\n"),
                    })
                }
            }

            let ratio = (index + 1) as f64 / total as f64;
            self.publish(job, tracker, Stage::Upscaling.percent_at(ratio));
        }
        Ok(())
    }

    async fn reassemble(
        &self,
        job: &mut Job,
        ws: &JobWorkspace,
        meta: &VideoMetadata,
        kind: &JobKind,
        tracker: &mut ProgressTracker,
    ) -> Result<(), PipelineError> {
        let (frames_dir, target) = match kind {
            JobKind::Upscale { .. } => (&ws.upscaled_dir, None),
            JobKind::Rescale {
                width,
                height,
                frame_rate,
            } => (
                &ws.frames_dir,
                Some(RescaleTarget {
                    width: *width,
                    height: *height,
                    frame_rate: *frame_rate,
                }),
            ),
        };
        let pattern = frames_dir.join("frame_%06d.png");
        let args = reassemble_args(&pattern, meta, target.as_ref(), &ws.assembled_path);
        let total = meta.total_frames.max(1);

        let outcome = self
            .stage_runner()
            .run(&self.cfg.ffmpeg_bin, &args, None, &self.cancel, |line| {
                if let Some(frame) = progress::parse_frame_count(line) {
                    let ratio = frame as f64 / total as f64;
                    self.publish(job, tracker, Stage::Reassembling.percent_at(ratio));
                } else {
                    self.events.publish_line(line);
                }
            })
            .await?;

        match outcome {
            RunOutcome::Canceled => Err(PipelineError::Canceled),
            RunOutcome::Exited { code: 0, .. } => {
                self.publish(job, tracker, Stage::Reassembling.percent_at(1.0));
                Ok(())
            }
            RunOutcome::Exited { code, tail } => Err(PipelineError::Tool {
                stage: Stage::Reassembling,
                exit_code: code,
                detail: tail.join("\n"),
            }),
        }
    }

    /// Re-attach the original audio track from the staged input
    async fn merge_audio(
        &self,
        job: &mut Job,
        ws: &JobWorkspace,
        tracker: &mut ProgressTracker,
    ) -> Result<(), PipelineError> {
        let args = merge_audio_args(&ws.assembled_path, &ws.input_path, &ws.merged_path);

        let outcome = self
            .stage_runner()
            .run(&self.cfg.ffmpeg_bin, &args, None, &self.cancel, |line| {
                self.events.publish_line(line);
            })
            .await?;

        match outcome {
            RunOutcome::Canceled => Err(PipelineError::Canceled),
            RunOutcome::Exited { code: 0, .. } => {
                self.publish(job, tracker, Stage::MergingAudio.percent_at(1.0));
                Ok(())
            }
            RunOutcome::Exited { code, tail } => Err(PipelineError::Tool {
                stage: Stage::MergingAudio,
                exit_code: code,
                detail: tail.join("\n"),
            }),
        }
    }

    /// Move the finished artifact to the user-visible output location
    async fn finalize(
        &self,
        job: &Job,
        artifact: &Path,
        suffix: &str,
    ) -> Result<PathBuf, PipelineError> {
        tokio::fs::create_dir_all(&self.cfg.output_dir).await?;
        let output = resolve_output_path(&self.cfg.output_dir, &job.file_name, suffix);

        // The workspace and the output directory may live on different
        // filesystems, where a rename does not work.
        if tokio::fs::rename(artifact, &output).await.is_err() {
            tokio::fs::copy(artifact, &output).await?;
            tokio::fs::remove_file(artifact).await?;
        }
        Ok(output)
    }

    /// Publish this job's progress through its monotonic tracker
    fn publish(&self, job: &mut Job, tracker: &mut ProgressTracker, percent: u8) {
        let published = tracker.update(percent);
        job.percent = published;
        self.events
            .publish_line(&progress::marker(&job.file_name, published));
    }

    fn checkpoint(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Canceled)
        } else {
            Ok(())
        }
    }

    fn stage_runner(&self) -> ToolRunner {
        ToolRunner::new(Duration::from_secs(self.cfg.term_grace_secs))
    }
}

/// ffmpeg arguments for decomposing the input into a frame sequence
fn extract_args(input: &Path, pattern: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-y".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-fps_mode".to_string(),
        "vfr".to_string(),
        "-progress".to_string(),
        "pipe:1".to_string(),
        "-nostats".to_string(),
        pattern.to_string_lossy().into_owned(),
    ]
}

/// Real-ESRGAN arguments for one frame
fn upscale_frame_args(
    input: &Path,
    output: &Path,
    model: UpscaleModel,
    scale: u32,
) -> Vec<String> {
    vec![
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-o".to_string(),
        output.to_string_lossy().into_owned(),
        "-s".to_string(),
        scale.to_string(),
        "-n".to_string(),
        model.model_name().to_string(),
        "-t".to_string(),
        "0".to_string(), // tile size, 0 = auto
        "-g".to_string(),
        "0".to_string(), // gpu device
        "-j".to_string(),
        "2:2:2".to_string(), // load/proc/save thread counts
    ]
}

/// ffmpeg arguments for re-encoding the frame sequence into a video stream
fn reassemble_args(
    pattern: &Path,
    meta: &VideoMetadata,
    target: Option<&RescaleTarget>,
    output: &Path,
) -> Vec<String> {
    let frame_rate = target
        .and_then(|t| t.frame_rate)
        .unwrap_or(meta.frame_rate);

    let mut args = vec![
        "-hide_banner".to_string(),
        "-y".to_string(),
        "-framerate".to_string(),
        format!("{:.3}", frame_rate),
        "-i".to_string(),
        pattern.to_string_lossy().into_owned(),
        "-c:v".to_string(),
        "libx264".to_string(),
    ];

    match target {
        Some(t) => {
            args.push("-vf".to_string());
            args.push(format!("scale={}:{}", t.width, t.height));
            let kbps = rescale_bitrate_kbps(meta, t);
            if kbps > 0 {
                args.push("-b:v".to_string());
                args.push(format!("{}k", kbps));
            } else {
                // no usable source bitrate, fall back to quality-based encoding
                args.push("-crf".to_string());
                args.push("18".to_string());
            }
        }
        None => {
            args.push("-crf".to_string());
            args.push("18".to_string());
        }
    }

    args.extend([
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-progress".to_string(),
        "pipe:1".to_string(),
        "-nostats".to_string(),
        output.to_string_lossy().into_owned(),
    ]);
    args
}

/// ffmpeg arguments for re-attaching the original audio track
fn merge_audio_args(video: &Path, source: &Path, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-y".to_string(),
        "-i".to_string(),
        video.to_string_lossy().into_owned(),
        "-i".to_string(),
        source.to_string_lossy().into_owned(),
        "-map".to_string(),
        "0:v:0".to_string(),
        "-map".to_string(),
        "1:a:0".to_string(),
        "-c:v".to_string(),
        "copy".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Target bitrate for a rescale job: the source bitrate scaled by
/// `sqrt(new_pixels / original_pixels)`.
fn rescale_bitrate_kbps(meta: &VideoMetadata, target: &RescaleTarget) -> u64 {
    if meta.bitrate_kbps == 0 || meta.pixel_count() == 0 {
        return 0;
    }
    let original = meta.pixel_count() as f64;
    let new = f64::from(target.width) * f64::from(target.height);
    (meta.bitrate_kbps as f64 * (new / original).sqrt()).round() as u64
}

/// Deterministic output name `<stem><suffix>.mp4`; collisions append a
/// numeric disambiguator before the extension.
fn resolve_output_path(output_dir: &Path, file_name: &str, suffix: &str) -> PathBuf {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("video");
    let base = format!("{}{}", stem, suffix);

    let mut candidate = output_dir.join(format!("{}.mp4", base));
    let mut attempt = 1;
    while candidate.exists() {
        candidate = output_dir.join(format!("{} ({}).mp4", base, attempt));
        attempt += 1;
    }
    candidate
}

/// Sorted list of frame files in a directory
fn list_frames(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut frames: Vec<PathBuf> = std::fs::read_dir(dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("png"))
        .collect();
    frames.sort();
    Ok(frames)
}
