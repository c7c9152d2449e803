// src/error.rs
use crate::request::ParseError;
use std::io;

/// Central error type for the Nocturne engine.
#[derive(Debug, thiserror::Error)]
pub enum NocturneError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error during HTTP request parsing.
    #[error("parse error: {0:?}")]
    Parse(ParseError),

    /// Invalid configuration. Fatal at startup only.
    #[error("config error: {0}")]
    Config(String),

    /// Generic or miscellaneous error.
    #[error("{0}")]
    Other(String),
}

impl From<ParseError> for NocturneError {
    fn from(e: ParseError) -> Self {
        NocturneError::Parse(e)
    }
}

pub type NocturneResult<T> = Result<T, NocturneError>;
