//! Shared types for the tunnel server
//!
//! - [`TunnelId`]: validated subdomain labels used as tunnel identifiers
//! - [`wire`]: HTTP/1.x head parsing and raw head reconstruction
//! - [`body`]: message body framing and verbatim body relay

pub mod body;
pub mod identifier;
pub mod wire;

pub use body::{relay_body, BodyFraming, RelayError};
pub use identifier::{IdentifierError, TunnelId};
pub use wire::{
    read_request_head, read_response_head, HeaderField, RequestHead, ResponseHead, WireError,
};
