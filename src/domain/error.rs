use thiserror::Error;

use super::{options::OptionsError, signature::SignatureError};

/// Request validation failures. Raised before any cache or origin I/O.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Options(#[from] OptionsError),
}
