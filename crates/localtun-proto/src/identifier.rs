//! Tunnel identifiers
//!
//! A tunnel identifier doubles as the public subdomain label, so it follows
//! hostname label rules with a tighter alphabet:
//! - 4 to 63 characters
//! - lowercase ASCII letters, digits and `-`
//! - first and last character must be a letter or digit
//!
//! # Examples
//! ```
//! use localtun_proto::TunnelId;
//!
//! assert!(TunnelId::parse("foobar-test").is_ok());
//! assert!(TunnelId::parse("-nope").is_err());
//! ```

use rand::seq::SliceRandom;
use rand::Rng;
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Minimum identifier length
pub const MIN_ID_LEN: usize = 4;
/// Maximum identifier length (DNS label limit)
pub const MAX_ID_LEN: usize = 63;

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "clever", "cool", "crisp", "curly", "dusty", "eager", "fancy", "fluffy",
    "fuzzy", "gentle", "giant", "happy", "humble", "icy", "jolly", "kind", "lazy", "little",
    "lucky", "mighty", "misty", "nice", "odd", "plain", "proud", "quick", "quiet", "rare",
    "shy", "silly", "smart", "solid", "swift", "tall", "tidy", "tiny", "vast", "witty",
];

const NOUNS: &[&str] = &[
    "badger", "bat", "bear", "bird", "bobcat", "cat", "crab", "crane", "deer", "dog", "dolphin",
    "duck", "eagle", "falcon", "fish", "fox", "frog", "goat", "goose", "hare", "hawk", "horse",
    "lion", "lizard", "mole", "moose", "mouse", "otter", "owl", "panda", "parrot", "puma",
    "rabbit", "seal", "sheep", "snake", "squid", "swan", "tiger", "walrus", "wolf", "yak",
];

/// Identifier validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("Invalid subdomain. Subdomains must be lowercase and between 4 and 63 alphanumeric characters.")]
    Invalid(String),
}

/// A validated tunnel identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelId(String);

impl TunnelId {
    /// Parse and validate an identifier
    pub fn parse(value: &str) -> Result<Self, IdentifierError> {
        if Self::is_valid(value) {
            Ok(Self(value.to_string()))
        } else {
            Err(IdentifierError::Invalid(value.to_string()))
        }
    }

    /// Check whether a string is a valid identifier without allocating
    pub fn is_valid(value: &str) -> bool {
        let bytes = value.as_bytes();
        if bytes.len() < MIN_ID_LEN || bytes.len() > MAX_ID_LEN {
            return false;
        }

        let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();

        alnum(&bytes[0])
            && alnum(&bytes[bytes.len() - 1])
            && bytes.iter().all(|b| alnum(b) || *b == b'-')
    }

    /// Generate a random human-readable identifier (e.g. `swift-otter-42`)
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quick");
        let noun = NOUNS.choose(&mut rng).copied().unwrap_or("fox");
        let number: u8 = rng.gen_range(0..100);

        Self(format!("{}-{}-{}", adjective, noun, number))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TunnelId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for TunnelId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for TunnelId {
    fn borrow(&self) -> &str {
        &self.0
    }
}
