//! Centralized error type for the consort umbrella crate.
//!
//! Wraps every subsystem error so `?` propagates naturally across crate boundaries.

use consort_core::HostError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Host(HostError),

    #[error("Config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<HostError> for Error {
    fn from(err: HostError) -> Self {
        match err {
            HostError::InvalidConfig(reason) => Error::Config(reason),
            other => Error::Host(other),
        }
    }
}

impl Error {
    /// The underlying host error, if this is one.
    pub fn host(&self) -> Option<&HostError> {
        match self {
            Error::Host(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
