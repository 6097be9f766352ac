use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::PipelineError;
use crate::events::{EventHub, PipelineEvent};
use crate::host;
use crate::job::{JobKind, JobRequest, JobStatus};
use crate::pipeline::FilePipeline;
use crate::probe::{self, VideoMetadata};
use crate::workspace::WorkspaceManager;

/// Owns the set of active pipelines for one submitted batch.
///
/// One `submit` call is one batch: it blocks until every pipeline reaches a
/// terminal state (or the batch is canceled) and returns the aggregated
/// status map with exactly one entry per submitted file name. The coordinator
/// is long-lived; batches run through it one after another.
pub struct BatchCoordinator {
    cfg: Arc<Config>,
    events: Arc<EventHub>,
    workspaces: Arc<WorkspaceManager>,
    /// Token of the batch currently in flight; replaced on every submit
    cancel: Mutex<CancellationToken>,
    /// Opt-in flag for shutting the machine down after the batch
    shutdown_after: AtomicBool,
}

impl BatchCoordinator {
    /// Build a coordinator: allocate the storage roots and sweep workspaces
    /// orphaned by a previous run.
    pub fn new(cfg: Config) -> Result<Self> {
        let workspaces = WorkspaceManager::new(cfg.workspace_root.clone());
        workspaces.ensure_root().with_context(|| {
            format!(
                "Failed to create workspace root: {}",
                cfg.workspace_root.display()
            )
        })?;
        std::fs::create_dir_all(&cfg.output_dir).with_context(|| {
            format!("Failed to create output directory: {}", cfg.output_dir.display())
        })?;

        let swept = workspaces.sweep_orphans();
        if swept > 0 {
            info!("✅ Startup recovery: removed {} orphaned workspace(s)", swept);
        }

        Ok(Self {
            events: Arc::new(EventHub::new(cfg.event_capacity)),
            workspaces: Arc::new(workspaces),
            cancel: Mutex::new(CancellationToken::new()),
            shutdown_after: AtomicBool::new(false),
            cfg: Arc::new(cfg),
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Subscribe to the progress/log event stream
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Opt in or out of shutting the machine down once the batch finishes
    pub fn request_shutdown_after(&self, enabled: bool) {
        self.shutdown_after.store(enabled, Ordering::SeqCst);
    }

    /// Cancel the batch currently in flight.
    ///
    /// Fire-and-forget and idempotent; safe to call when no batch is active.
    pub fn cancel(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    /// Run one batch to completion and return the per-file status map
    pub async fn submit(&self, requests: Vec<JobRequest>) -> BTreeMap<String, JobStatus> {
        info!("Batch submitted: {} file(s)", requests.len());

        // Fresh token per batch; a cancel left over from an earlier batch
        // must not abort this one.
        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = cancel.clone();

        let upscale_token = Arc::new(Semaphore::new(1));
        let mut results: BTreeMap<String, JobStatus> = BTreeMap::new();
        let mut handles = Vec::new();

        for request in requests {
            if let Err(e) = validate_request(&request) {
                warn!("Job {}: rejected at submission: {}", request.file_code, e);
                results.insert(request.file_name.clone(), JobStatus::Failed(e.reason()));
                continue;
            }

            let pipeline = FilePipeline::new(
                Arc::clone(&self.cfg),
                Arc::clone(&self.events),
                Arc::clone(&self.workspaces),
                Arc::clone(&upscale_token),
                cancel.clone(),
            );
            let file_name = request.file_name.clone();
            let handle = tokio::spawn(async move { pipeline.run(request).await });
            handles.push((file_name, handle));
        }

        for (file_name, handle) in handles {
            let status = match handle.await {
                Ok(status) => status,
                Err(e) => {
                    error!("Pipeline task for {} died: {}", file_name, e);
                    if cancel.is_cancelled() {
                        JobStatus::Canceled
                    } else {
                        JobStatus::Failed("IOError".to_string())
                    }
                }
            };
            results.insert(file_name, status);
        }

        // On cancellation, every job that did not reach Completed reports
        // Canceled, wherever its pipeline happened to stop.
        if cancel.is_cancelled() {
            for status in results.values_mut() {
                if !matches!(status, JobStatus::Completed(_)) {
                    *status = JobStatus::Canceled;
                }
            }
        }

        let completed = results
            .values()
            .filter(|s| matches!(s, JobStatus::Completed(_)))
            .count();
        info!("Batch finished: {}/{} completed", completed, results.len());

        // The shutdown opt-in is sampled exactly once, after every pipeline
        // reached a terminal state; a canceled batch never shuts down.
        if !cancel.is_cancelled() && self.shutdown_after.load(Ordering::SeqCst) {
            info!("Batch complete, shutting the computer down as requested");
            if let Err(e) = host::shutdown_computer().await {
                error!("Failed to shut down: {}", e);
            }
        }

        results
    }

    /// Probe one file's content without running a job
    pub async fn probe(&self, data: &[u8]) -> Result<VideoMetadata, PipelineError> {
        if data.is_empty() {
            return Err(PipelineError::Input("empty upload".to_string()));
        }
        let workspace = self.workspaces.acquire("probe", "probe.bin")?;
        tokio::fs::write(&workspace.input_path, data).await?;

        let result = probe::probe_file(&self.cfg, &workspace.input_path).await;
        if let Err(e) = self.workspaces.release(&workspace) {
            warn!(
                "Failed to reclaim probe workspace {}: {}",
                workspace.root.display(),
                e
            );
        }
        result
    }

    /// Open the finished-artifact directory in the host file browser
    pub fn open_output_dir(&self) -> Result<()> {
        host::open_path(&self.cfg.output_dir)
    }
}

/// Reject bad requests before any pipeline spawns
fn validate_request(request: &JobRequest) -> Result<(), PipelineError> {
    if request.data.is_empty() {
        return Err(PipelineError::Input(format!(
            "{}: empty upload",
            request.file_name
        )));
    }
    match &request.kind {
        JobKind::Upscale { model, scale } => {
            if !model.supports_scale(*scale) {
                return Err(PipelineError::Input(format!(
                    "model {} does not support scale x{} (supported: {:?})",
                    model.model_name(),
                    scale,
                    model.supported_scales()
                )));
            }
        }
        JobKind::Rescale { width, height, .. } => {
            if *width == 0 || *height == 0 {
                return Err(PipelineError::Input(
                    "rescale target resolution must be non-zero".to_string(),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UpscaleModel;

    fn test_coordinator(work: &std::path::Path, out: &std::path::Path) -> BatchCoordinator {
        let mut cfg = Config::default_config();
        cfg.workspace_root = work.to_path_buf();
        cfg.output_dir = out.to_path_buf();
        BatchCoordinator::new(cfg).unwrap()
    }

    fn upscale_request(code: &str, name: &str, data: &[u8]) -> JobRequest {
        JobRequest {
            file_code: code.to_string(),
            file_name: name.to_string(),
            data: data.to_vec(),
            kind: JobKind::Upscale {
                model: UpscaleModel::RealEsrganX4Plus,
                scale: 4,
            },
        }
    }

    #[tokio::test]
    async fn test_result_map_has_one_entry_per_submitted_file() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let coordinator = test_coordinator(work.path(), out.path());

        let results = coordinator
            .submit(vec![
                upscale_request("f001", "a.mp4", b"garbage-a"),
                upscale_request("f002", "b.mp4", b"garbage-b"),
                upscale_request("f003", "c.mp4", b""),
            ])
            .await;

        let names: Vec<&str> = results.keys().map(|s| s.as_str()).collect();
        assert_eq!(names, vec!["a.mp4", "b.mp4", "c.mp4"]);
        // garbage bytes cannot be probed; empty bytes are rejected up front
        assert_eq!(results["a.mp4"], JobStatus::Failed("ProbeError".to_string()));
        assert_eq!(results["b.mp4"], JobStatus::Failed("ProbeError".to_string()));
        assert_eq!(results["c.mp4"], JobStatus::Failed("InputError".to_string()));
    }

    #[tokio::test]
    async fn test_failures_leave_no_workspace_residue() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let coordinator = test_coordinator(work.path(), out.path());

        let _ = coordinator
            .submit(vec![
                upscale_request("f001", "a.mp4", b"garbage"),
                upscale_request("f002", "b.mp4", b"garbage"),
            ])
            .await;

        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_model_scale_rejected_at_submission() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let coordinator = test_coordinator(work.path(), out.path());

        let results = coordinator
            .submit(vec![JobRequest {
                file_code: "f001".to_string(),
                file_name: "a.mp4".to_string(),
                data: b"bytes".to_vec(),
                kind: JobKind::Upscale {
                    model: UpscaleModel::RealEsrganX4Plus,
                    scale: 2,
                },
            }])
            .await;

        assert_eq!(results["a.mp4"], JobStatus::Failed("InputError".to_string()));
        // rejected before a pipeline ever spawned, so no workspace was made
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_zero_rescale_target_rejected() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let coordinator = test_coordinator(work.path(), out.path());

        let results = coordinator
            .submit(vec![JobRequest {
                file_code: "f001".to_string(),
                file_name: "a.mp4".to_string(),
                data: b"bytes".to_vec(),
                kind: JobKind::Rescale {
                    width: 0,
                    height: 720,
                    frame_rate: None,
                },
            }])
            .await;

        assert_eq!(results["a.mp4"], JobStatus::Failed("InputError".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_with_no_batch_active_is_safe() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let coordinator = test_coordinator(work.path(), out.path());

        coordinator.cancel();
        coordinator.cancel();

        // a batch submitted afterwards is not born canceled
        let results = coordinator
            .submit(vec![upscale_request("f001", "a.mp4", b"garbage")])
            .await;
        assert_eq!(results["a.mp4"], JobStatus::Failed("ProbeError".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_mid_batch_marks_every_job_canceled() {
        use std::os::unix::fs::PermissionsExt;

        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();

        // a probe stub that hangs keeps both pipelines in-flight until cancel
        let stub = bin.path().join("ffprobe");
        std::fs::write(&stub, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut cfg = Config::default_config();
        cfg.workspace_root = work.path().to_path_buf();
        cfg.output_dir = out.path().to_path_buf();
        cfg.ffprobe_bin = stub;
        cfg.term_grace_secs = 1;

        let coordinator = Arc::new(BatchCoordinator::new(cfg).unwrap());

        let submitter = Arc::clone(&coordinator);
        let batch = tokio::spawn(async move {
            submitter
                .submit(vec![
                    upscale_request("f001", "a.mp4", b"bytes-a"),
                    upscale_request("f002", "b.mp4", b"bytes-b"),
                ])
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        coordinator.cancel();

        let results = batch.await.unwrap();
        assert_eq!(results["a.mp4"], JobStatus::Canceled);
        assert_eq!(results["b.mp4"], JobStatus::Canceled);
        // no residual workspaces or partial output files
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_probe_boundary_cleans_its_staging_file() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let coordinator = test_coordinator(work.path(), out.path());

        let err = coordinator.probe(b"not a video").await.unwrap_err();
        assert_eq!(err.reason(), "ProbeError");
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);

        let err = coordinator.probe(b"").await.unwrap_err();
        assert_eq!(err.reason(), "InputError");
    }
}
