//! Caching reverse proxy for signed object-store files and image variants.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
