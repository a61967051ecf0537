//! HTTP surface: the `/file` and `/image` proxy routes plus a liveness probe.

mod middleware;
mod public;

pub use middleware::RequestContext;
pub use public::{HttpState, build_router};
