use std::io;

use thiserror::Error;

use crate::request::ParseError;

/// Central error type for the minuet engine.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Underlying I/O error from the OS or network.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Error talking to the credential database.
    #[error("database error: {0}")]
    Db(#[from] postgres::Error),
    /// The peer sent a request the parser could not accept.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// The SQL connection pool has been shut down.
    #[error("sql pool is closed")]
    PoolClosed,
    /// A construction parameter is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<ParseError> for ServerError {
    fn from(e: ParseError) -> Self {
        ServerError::BadRequest(e.to_string())
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
