use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::UpscaleModel;

/// What the client asked to be done with one file
#[derive(Debug, Clone, PartialEq)]
pub enum JobKind {
    /// Neural upscaling by an integer factor
    Upscale { model: UpscaleModel, scale: u32 },
    /// Plain resolution change via the transcoder; the target bitrate is
    /// derived from the source bitrate and the pixel-count ratio
    Rescale {
        width: u32,
        height: u32,
        /// Output frame rate; defaults to the source rate
        frame_rate: Option<f64>,
    },
}

/// One file's unit of work as submitted by the client
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Stable code assigned at submission
    pub file_code: String,
    /// Original file name, the key of the batch result map
    pub file_name: String,
    /// Raw video bytes handed over by the client
    pub data: Vec<u8>,
    pub kind: JobKind,
}

/// Terminal (or in-flight) status of a job
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Processing,
    Completed(PathBuf),
    Failed(String),
    Canceled,
}

impl JobStatus {
    /// Render the status string shown to the client
    pub fn label(&self) -> String {
        match self {
            JobStatus::Processing => "Processing...".to_string(),
            JobStatus::Completed(_) => "Completed".to_string(),
            JobStatus::Failed(reason) => format!("Failed: {}", reason),
            JobStatus::Canceled => "Canceled".to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Processing)
    }
}

/// Pipeline stages in order; every transition is a cancellation checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Queued,
    Probing,
    Extracting,
    Upscaling,
    Reassembling,
    MergingAudio,
    Finalizing,
}

impl Stage {
    /// Percent span this stage occupies in the whole-job progress bar.
    ///
    /// The spans are fixed so the displayed percentage stays monotonic across
    /// the whole job instead of resetting per stage: extraction 10%,
    /// upscaling 70%, reassembly 15%, audio merge 5%. Probing reports the 0%
    /// floor and Finalizing pins 100%.
    pub fn span(&self) -> (u8, u8) {
        match self {
            Stage::Queued | Stage::Probing => (0, 0),
            Stage::Extracting => (0, 10),
            Stage::Upscaling => (10, 80),
            Stage::Reassembling => (80, 95),
            Stage::MergingAudio => (95, 100),
            Stage::Finalizing => (100, 100),
        }
    }

    /// Map a within-stage completion ratio to a whole-job percentage
    pub fn percent_at(&self, ratio: f64) -> u8 {
        let (start, end) = self.span();
        let ratio = ratio.clamp(0.0, 1.0);
        start + (ratio * f64::from(end - start)).round() as u8
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Queued => "queued",
            Stage::Probing => "probe",
            Stage::Extracting => "extract",
            Stage::Upscaling => "upscale",
            Stage::Reassembling => "reassemble",
            Stage::MergingAudio => "merge-audio",
            Stage::Finalizing => "finalize",
        };
        f.write_str(name)
    }
}

/// Tracked state of one job, mutated only by its owning pipeline
#[derive(Debug, Clone)]
pub struct Job {
    pub file_code: String,
    pub file_name: String,
    pub stage: Stage,
    pub percent: u8,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(file_code: &str, file_name: &str) -> Self {
        Self {
            file_code: file_code.to_string(),
            file_name: file_name.to_string(),
            stage: Stage::Queued,
            percent: 0,
            status: JobStatus::Processing,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Monotonic progress floor for one job.
///
/// Stage-local percentages can jitter (a tool may re-report an earlier frame
/// count); everything published to the client goes through here so observed
/// progress never decreases until the job reaches a terminal state.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    floor: u8,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in a new percentage and return the value to publish
    pub fn update(&mut self, percent: u8) -> u8 {
        let percent = percent.min(100);
        if percent > self.floor {
            self.floor = percent;
        }
        self.floor
    }

    pub fn current(&self) -> u8 {
        self.floor
    }
}
