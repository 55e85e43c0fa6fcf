use std::io;

use thiserror::Error;

use crate::providers::ProviderError;

#[derive(Debug, Error)]
pub enum StagecraftError {
    #[error("configuration error: {0}")]
    InvalidConfig(String),

    #[error("invalid project: {0}")]
    InvalidProject(String),

    #[error("provider '{provider}' is not available: {reason}")]
    ProviderNotAvailable { provider: String, reason: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("plan failed: {0}")]
    PlanFailed(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("strict decode failed: {0}")]
    StrictDecodeFailed(String),

    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("install failed: {0}")]
    InstallFailed(String),

    #[error("unsupported OS: {0}")]
    UnsupportedOs(String),

    #[error("secret sync failed: {0}")]
    SecretSyncFailed(String),

    #[error("dev server failed: {0}")]
    DevServerFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StagecraftError {
    /// CLI exit code: 1 for invalid input or validation errors, 2 for
    /// external provider/runtime failures, 3 for internal invariant
    /// violations.
    pub fn exit_code(&self) -> i32 {
        match self {
            StagecraftError::InvalidConfig(_)
            | StagecraftError::InvalidProject(_)
            | StagecraftError::StrictDecodeFailed(_)
            | StagecraftError::Yaml(_)
            | StagecraftError::Json(_) => 1,
            StagecraftError::Provider(err)
                if err.kind == crate::providers::ProviderErrorKind::InvalidConfig =>
            {
                1
            }
            StagecraftError::ExecutionFailed(_) => 3,
            _ => 2,
        }
    }
}

pub type Result<T> = std::result::Result<T, StagecraftError>;
