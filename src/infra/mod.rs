//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod http;
pub mod origin;
pub mod telemetry;
pub mod transform;
