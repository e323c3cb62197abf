use thiserror::Error;

/// Failures a pipeline run reports to its observer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("a task is already running, wait for it to finish and try again")]
    Busy,
    #[error("failed to obtain {what}: {reason}")]
    Acquisition { what: String, reason: String },
    #[error("{0}")]
    Empty(String),
}

impl PipelineError {
    pub fn acquisition(what: impl Into<String>, err: &anyhow::Error) -> Self {
        PipelineError::Acquisition {
            what: what.into(),
            reason: format!("{err:#}"),
        }
    }
}
