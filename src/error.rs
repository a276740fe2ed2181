use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Permit wait canceled")]
    Canceled,
}

impl AppError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, AppError::Canceled)
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
