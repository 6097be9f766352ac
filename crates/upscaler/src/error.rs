use thiserror::Error;

use crate::job::Stage;

/// Per-job error taxonomy.
///
/// Errors are local to the job that raised them: the pipeline catches them at
/// its boundary and folds them into that job's terminal `Failed(reason)`
/// status. Sibling jobs and the batch as a whole are unaffected; only a
/// coordinator-level failure (no workspace storage at all) surfaces to the
/// caller as a batch error.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Unreadable or empty upload, or a rejected model/scale combination
    #[error("InputError: {0}")]
    Input(String),

    /// Metadata extraction failed for this file
    #[error("ProbeError: {0}")]
    Probe(String),

    /// An external tool exited non-zero with no cancellation pending
    #[error("ExternalToolError: {stage} exited with code {exit_code}: {detail}")]
    Tool {
        stage: Stage,
        exit_code: i32,
        /// Tail of the tool's combined output, kept for diagnostics
        detail: String,
    },

    /// Workspace allocation or cleanup failure
    #[error("IOError: {0}")]
    Io(#[from] std::io::Error),

    /// Non-error early exit; the job ends as `Canceled`, not `Failed`
    #[error("canceled")]
    Canceled,
}

impl PipelineError {
    /// The reason string shown in the per-file status map
    pub fn reason(&self) -> String {
        match self {
            PipelineError::Input(_) => "InputError".to_string(),
            PipelineError::Probe(_) => "ProbeError".to_string(),
            PipelineError::Tool {
                stage, exit_code, ..
            } => format!("ExternalToolError({}, exit {})", stage, exit_code),
            PipelineError::Io(_) => "IOError".to_string(),
            PipelineError::Canceled => "Canceled".to_string(),
        }
    }
}
