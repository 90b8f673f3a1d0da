//! Token checks for the tunnel server's protected endpoints

pub mod jwt;
pub mod static_tokens;
pub mod validator;

pub use jwt::{JwtClaims, JwtError, JwtValidator};
pub use static_tokens::StaticTokens;
pub use validator::{bearer_token, AuthError, TokenValidator};

// Re-export useful types
pub use async_trait::async_trait;
