use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Transfer error: {0}")]
    Transfer(#[from] hlsvod_engine::TransferError),

    #[error("Invalid configuration file {path}: {reason}")]
    Config { path: String, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{unfinished} of {total} transfers did not complete")]
    Unfinished { unfinished: usize, total: usize },
}

pub type Result<T> = std::result::Result<T, AppError>;
