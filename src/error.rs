use thiserror::Error;

use crate::connection::ConnectionError;

pub type Result<T> = std::result::Result<T, SdrError>;

#[derive(Error, Debug)]
pub enum SdrError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Recorder error: {0}")]
    Recorder(#[from] hound::Error),

    #[error("Session closed")]
    SessionClosed,
}
