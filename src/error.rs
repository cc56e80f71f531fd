use thiserror::Error;

#[derive(Error, Debug)]
pub enum CanvasError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("section worker error: {0}")]
    Worker(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("economy conflict: {0}")]
    EconomyConflict(String),

    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CanvasError>;
