use std::io;

use thiserror::Error;

/// Failures surfaced by the relay core.
///
/// Errors while releasing a session's streams are never returned; they are
/// logged where they happen.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("name '{0}' is already in use")]
    NameTaken(String),
    #[error("session '{0}' is no longer active")]
    Inactive(String),
}
