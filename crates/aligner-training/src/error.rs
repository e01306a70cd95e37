use std::fmt;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("configuration error at `{path}`: {message}")]
    Configuration { path: String, message: String },

    #[error("distributed initialization failed: {0}")]
    DistributedInit(String),

    #[error("failed to load model `{reference}`: {message}")]
    ModelLoad { reference: String, message: String },

    #[error("dataset initialization failed: {0}")]
    DataInit(String),

    #[error("training step {step} failed: {message}")]
    TrainingStep { step: u64, message: String },

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("invalid lifecycle transition from {from} to {to}")]
    Lifecycle { from: String, to: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrainingError {
    pub fn config(path: impl fmt::Display, message: impl Into<String>) -> Self {
        Self::Configuration { path: path.to_string(), message: message.into() }
    }

    pub fn model_load(reference: impl fmt::Display, message: impl Into<String>) -> Self {
        Self::ModelLoad { reference: reference.to_string(), message: message.into() }
    }

    pub fn step(step: u64, message: impl Into<String>) -> Self {
        Self::TrainingStep { step, message: message.into() }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } | Self::Yaml(_) | Self::Toml(_) => ErrorKind::Configuration,
            Self::DistributedInit(_) => ErrorKind::DistributedInit,
            Self::ModelLoad { .. } => ErrorKind::ModelLoad,
            Self::DataInit(_) => ErrorKind::DataInit,
            Self::TrainingStep { .. } => ErrorKind::TrainingStep,
            Self::Artifact(_)
            | Self::Lifecycle { .. }
            | Self::Io(_)
            | Self::Json(_)
            | Self::Other(_) => ErrorKind::Internal,
        }
    }
}

/// Coarse classification used for logging and process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    DistributedInit,
    ModelLoad,
    DataInit,
    TrainingStep,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Internal => 1,
            Self::Configuration => 2,
            Self::DistributedInit => 3,
            Self::ModelLoad => 4,
            Self::DataInit => 5,
            Self::TrainingStep => 6,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuration => "ConfigurationError",
            Self::DistributedInit => "DistributedInitError",
            Self::ModelLoad => "ModelLoadError",
            Self::DataInit => "DataInitError",
            Self::TrainingStep => "TrainingStepError",
            Self::Internal => "InternalError",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_cites_path() {
        let err = TrainingError::config("train_cfgs.seed", "expected integer, found `abc`");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("train_cfgs.seed"));
    }

    #[test]
    fn test_exit_codes_are_non_zero_and_distinct() {
        let kinds = [
            ErrorKind::Configuration,
            ErrorKind::DistributedInit,
            ErrorKind::ModelLoad,
            ErrorKind::DataInit,
            ErrorKind::TrainingStep,
            ErrorKind::Internal,
        ];
        let mut codes: Vec<u8> = kinds.iter().map(|k| k.exit_code()).collect();
        assert!(codes.iter().all(|c| *c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }
}
