//! Public HTTP server for localtun
//!
//! Accepts public HTTP traffic, proxies it to tunnel clients by subdomain,
//! and serves the control-plane API on everything else.

pub mod api;
pub mod connection;
pub mod response;
pub mod server;

pub use connection::PublicConnection;
pub use server::{HttpServer, HttpServerConfig, HttpServerError, DEFAULT_LANDING_PAGE};
