use std::time::Duration;

use thiserror::Error;

pub use crate::codec::DecodeError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection idle for {0:?}")]
    IdleTimeout(Duration),

    #[error("message of {got} bytes exceeds frame limit of {limit} bytes")]
    FrameTooLarge { got: usize, limit: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
