//! Domain layer: request options and URL signatures.

pub mod error;
pub mod options;
pub mod signature;
