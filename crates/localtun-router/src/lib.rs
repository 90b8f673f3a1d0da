//! Request routing for the public HTTP listener
//!
//! Maps a request's `Host` header (and optionally its path) to the tunnel
//! that should serve it.

pub mod host;

pub use host::{normalize_host, RouteDecision, SubdomainResolver};
