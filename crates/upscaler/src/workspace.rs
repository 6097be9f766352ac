use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;

/// Exclusively-owned temporary storage tree for one job.
///
/// Never shared across jobs; removed on every exit path.
#[derive(Debug, Clone)]
pub struct JobWorkspace {
    /// Root of the job's tree, `<workspace_root>/<file_code>-<uuid>`
    pub root: PathBuf,
    /// Staged copy of the uploaded input bytes
    pub input_path: PathBuf,
    /// Extracted source frames
    pub frames_dir: PathBuf,
    /// Upscaled frames
    pub upscaled_dir: PathBuf,
    /// Re-encoded video stream, before the audio remux
    pub assembled_path: PathBuf,
    /// Final in-workspace artifact with the original audio attached
    pub merged_path: PathBuf,
}

/// Allocates and reclaims per-job workspaces under one root directory
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the workspace root if it does not exist yet
    pub fn ensure_root(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    /// Allocate a uniquely-named workspace tree for one job
    pub fn acquire(&self, file_code: &str, file_name: &str) -> Result<JobWorkspace, PipelineError> {
        let root = self.root.join(format!("{}-{}", file_code, Uuid::new_v4()));
        let frames_dir = root.join("frames");
        let upscaled_dir = root.join("upscaled");

        fs::create_dir_all(&frames_dir)?;
        fs::create_dir_all(&upscaled_dir)?;

        let ext = Path::new(file_name)
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("mp4");

        debug!("Workspace allocated: {}", root.display());

        Ok(JobWorkspace {
            input_path: root.join(format!("input.{}", ext)),
            frames_dir,
            upscaled_dir,
            assembled_path: root.join("assembled.mp4"),
            merged_path: root.join("merged.mp4"),
            root,
        })
    }

    /// Recursively remove a job's tree.
    ///
    /// Idempotent: safe to call after partial creation, repeated release, or
    /// a crash mid-job.
    pub fn release(&self, workspace: &JobWorkspace) -> std::io::Result<()> {
        if workspace.root.exists() {
            fs::remove_dir_all(&workspace.root)?;
            debug!("Workspace removed: {}", workspace.root.display());
        }
        Ok(())
    }

    /// Remove workspace trees left behind by a previous run.
    ///
    /// Run once at coordinator startup; job directories only live for the
    /// duration of a batch, so anything found here is an orphan. Foreign
    /// plain files under the root are left alone.
    pub fn sweep_orphans(&self) -> usize {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let mut swept = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    info!("🗑️  Removed orphaned workspace: {}", path.display());
                    swept += 1;
                }
                Err(e) => {
                    warn!("Failed to remove orphaned workspace {}: {}", path.display(), e);
                }
            }
        }
        swept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_creates_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());

        let ws = manager.acquire("f001", "clip.mkv").unwrap();
        assert!(ws.root.starts_with(dir.path()));
        assert!(ws.frames_dir.is_dir());
        assert!(ws.upscaled_dir.is_dir());
        assert_eq!(ws.input_path.file_name().unwrap(), "input.mkv");
    }

    #[test]
    fn test_acquired_workspaces_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());

        let a = manager.acquire("f001", "clip.mp4").unwrap();
        let b = manager.acquire("f001", "clip.mp4").unwrap();
        assert_ne!(a.root, b.root);
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());

        let ws = manager.acquire("f001", "clip.mp4").unwrap();
        fs::write(&ws.input_path, b"bytes").unwrap();
        fs::write(ws.frames_dir.join("frame_000001.png"), b"png").unwrap();

        manager.release(&ws).unwrap();
        assert!(!ws.root.exists());

        // second release is a no-op, not an error
        manager.release(&ws).unwrap();
    }

    #[test]
    fn test_release_after_partial_creation() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());

        let ws = manager.acquire("f001", "clip.mp4").unwrap();
        // simulate a crash between directory creation and staging
        fs::remove_dir_all(&ws.upscaled_dir).unwrap();

        manager.release(&ws).unwrap();
        assert!(!ws.root.exists());
    }

    #[test]
    fn test_sweep_removes_orphans_only() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());

        // two orphaned job trees and one foreign file
        let orphan_a = manager.acquire("f001", "a.mp4").unwrap();
        let orphan_b = manager.acquire("f002", "b.mp4").unwrap();
        let foreign = dir.path().join("notes.txt");
        fs::write(&foreign, b"keep me").unwrap();

        let swept = manager.sweep_orphans();
        assert_eq!(swept, 2);
        assert!(!orphan_a.root.exists());
        assert!(!orphan_b.root.exists());
        assert!(foreign.exists());
    }

    #[test]
    fn test_sweep_tolerates_missing_root() {
        let manager = WorkspaceManager::new("/nonexistent/upscaler-work");
        assert_eq!(manager.sweep_orphans(), 0);
    }
}
