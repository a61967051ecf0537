//! Application layer: ports towards the origin and the transformer, and the
//! cache-aside pipeline that drives them.

pub mod error;
pub mod origin;
pub mod pipeline;
pub mod transform;
