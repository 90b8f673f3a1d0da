//! Fixed list of accepted tokens, loaded from configuration

use async_trait::async_trait;
use std::collections::HashSet;

use crate::validator::{AuthError, TokenValidator};

pub struct StaticTokens {
    tokens: HashSet<String>,
}

impl StaticTokens {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenValidator for StaticTokens {
    async fn validate(&self, token: &str) -> Result<(), AuthError> {
        if self.tokens.contains(token) {
            Ok(())
        } else {
            Err(AuthError::InvalidToken("unknown token".to_string()))
        }
    }
}
