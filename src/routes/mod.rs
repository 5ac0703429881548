//! Routing: the route table, the router that serves it and the request-scoped
//! parameter set it publishes.

pub mod params;
pub mod router;
#[allow(clippy::module_inception)]
pub mod routes;

pub use routes::routes;
