use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronfleetError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config file not found: {path}")]
    ConfigNotFound { path: String },
}

impl CronfleetError {
    /// Short error code string printed next to CLI failures.
    pub fn code(&self) -> &'static str {
        match self {
            CronfleetError::Config(_) => "CONFIG_ERROR",
            CronfleetError::ConfigNotFound { .. } => "CONFIG_NOT_FOUND",
        }
    }
}

pub type Result<T> = std::result::Result<T, CronfleetError>;
