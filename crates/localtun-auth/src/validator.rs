//! Pluggable token validation

use async_trait::async_trait;
use thiserror::Error;

/// Authentication errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing authorization token")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    TokenExpired,
}

/// Decides whether a bearer token grants access to protected endpoints
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<(), AuthError>;

    /// Validate an optional token, failing with [`AuthError::MissingToken`]
    async fn authorize(&self, token: Option<&str>) -> Result<(), AuthError> {
        match token {
            Some(token) if !token.is_empty() => self.validate(token).await,
            _ => Err(AuthError::MissingToken),
        }
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AcceptAll;

    #[async_trait]
    impl TokenValidator for AcceptAll {
        async fn validate(&self, _token: &str) -> Result<(), AuthError> {
            Ok(())
        }
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc.def"), Some("abc.def"));
        assert_eq!(bearer_token("bearer   abc"), Some("abc"));
        assert_eq!(bearer_token("Basic dXNlcjpwYXNz"), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("abc"), None);
    }

    #[tokio::test]
    async fn test_authorize_requires_token() {
        let validator = AcceptAll;
        assert_eq!(validator.authorize(None).await, Err(AuthError::MissingToken));
        assert_eq!(validator.authorize(Some("")).await, Err(AuthError::MissingToken));
        assert!(validator.authorize(Some("anything")).await.is_ok());
    }
}
