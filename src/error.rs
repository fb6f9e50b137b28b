//! Error taxonomy surfaced by the build engine.
//!
//! Step bodies work with `anyhow` and are wrapped into
//! [`BuildError::StepExecution`] by the engine; everything the engine itself
//! rejects maps to one of the other variants.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// Invalid configuration, invalid layout, or a resume whose configuration
    /// does not match the saved run.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("saved state uses schema version {found}, this build understands version {expected}")]
    StateVersion { found: u32, expected: u32 },

    #[error("saved state {} is corrupt: {reason}", path.display())]
    CorruptState { path: PathBuf, reason: String },

    #[error("workspace {} is already in use by another build", .0.display())]
    WorkspaceBusy(PathBuf),

    #[error("step \"{step}\" failed: {cause:#}")]
    StepExecution { step: String, cause: anyhow::Error },

    #[error("cleanup of {} failed: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The lifecycle methods were called out of order.
    #[error("state machine used out of order: {0}")]
    Lifecycle(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Name of the failed step, if this is a step failure.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::StepExecution { step, .. } => Some(step),
            _ => None,
        }
    }
}

pub type BuildResult<T> = Result<T, BuildError>;
