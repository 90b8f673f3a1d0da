//! Server configuration file support
//!
//! Settings come from an optional YAML file (`--config localtun.yml`);
//! flags and `LOCALTUN_*` environment variables override its values.

use anyhow::{Context, Result};
use localtun_pool::PortRange;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_MAX_SOCKETS: usize = 10;
pub const DEFAULT_MIN_PORT: u16 = 8000;
pub const DEFAULT_MAX_PORT: u16 = 65535;
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 1000;

/// Configuration file format; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Public listener port
    pub port: Option<u16>,

    /// Address the public listener binds to
    pub address: Option<IpAddr>,

    /// Base domain tunnels are served under
    pub domain: Option<String>,

    /// Advertise https:// tunnel URLs
    pub secure: Option<bool>,

    /// Where `GET /` redirects to
    pub landing: Option<String>,

    /// Also route `/<id>/...` to tunnels
    pub path_routing: Option<bool>,

    /// Maximum tunnel sockets per client
    pub max_sockets: Option<usize>,

    /// Tunnel listener ports as `first:last`; takes precedence over min/max
    pub port_range: Option<String>,

    pub min_port: Option<u16>,
    pub max_port: Option<u16>,

    /// How long a client may stay without tunnel sockets, in milliseconds
    pub grace_period_ms: Option<u64>,

    /// Shared secret for HS256 tokens
    pub jwt_secret: Option<String>,

    /// Require one of `tokens` as a bearer token
    pub require_token: Option<bool>,

    pub tokens: Vec<String>,
}

/// How bearer tokens are checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenAuth {
    Disabled,
    Jwt(String),
    Static(Vec<String>),
}

/// Fully resolved server settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    pub domain: Option<String>,
    pub secure: bool,
    pub landing: Option<String>,
    pub path_routing: bool,
    pub max_sockets: usize,
    pub port_range: PortRange,
    pub grace_period: Duration,
    pub auth: TokenAuth,
}

impl ServerConfig {
    /// Load config from a specific file path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content)
    }

    /// Parse config from YAML string
    pub fn parse(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse YAML config")
    }

    /// Overlay `overrides` on top of this config
    pub fn merge(self, overrides: ServerConfig) -> ServerConfig {
        ServerConfig {
            port: overrides.port.or(self.port),
            address: overrides.address.or(self.address),
            domain: overrides.domain.or(self.domain),
            secure: overrides.secure.or(self.secure),
            landing: overrides.landing.or(self.landing),
            path_routing: overrides.path_routing.or(self.path_routing),
            max_sockets: overrides.max_sockets.or(self.max_sockets),
            port_range: overrides.port_range.or(self.port_range),
            min_port: overrides.min_port.or(self.min_port),
            max_port: overrides.max_port.or(self.max_port),
            grace_period_ms: overrides.grace_period_ms.or(self.grace_period_ms),
            jwt_secret: overrides.jwt_secret.or(self.jwt_secret),
            require_token: overrides.require_token.or(self.require_token),
            tokens: if overrides.tokens.is_empty() {
                self.tokens
            } else {
                overrides.tokens
            },
        }
    }

    /// Apply defaults and validate
    pub fn resolve(self) -> Result<Settings> {
        let address = self
            .address
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));
        let port = self.port.unwrap_or(DEFAULT_PORT);

        let max_sockets = self.max_sockets.unwrap_or(DEFAULT_MAX_SOCKETS);
        if max_sockets == 0 {
            anyhow::bail!("max-sockets must be at least 1");
        }

        let port_range = match &self.port_range {
            Some(expr) => expr
                .parse::<PortRange>()
                .with_context(|| format!("Invalid port range '{}'", expr))?,
            None => {
                let first = self.min_port.unwrap_or(DEFAULT_MIN_PORT);
                let last = self.max_port.unwrap_or(DEFAULT_MAX_PORT);
                if first < DEFAULT_MIN_PORT {
                    anyhow::bail!("min-port must be at least {}", DEFAULT_MIN_PORT);
                }
                if first >= last {
                    anyhow::bail!("min-port must be less than max-port");
                }
                PortRange { first, last }
            }
        };

        let auth = match (self.jwt_secret, self.require_token.unwrap_or(false)) {
            (Some(_), true) => {
                anyhow::bail!("jwt-secret and require-token cannot be combined")
            }
            (Some(secret), false) => {
                if secret.is_empty() {
                    anyhow::bail!("jwt-secret must not be empty");
                }
                TokenAuth::Jwt(secret)
            }
            (None, true) => {
                if self.tokens.is_empty() {
                    anyhow::bail!("require-token needs at least one token");
                }
                TokenAuth::Static(self.tokens)
            }
            (None, false) => TokenAuth::Disabled,
        };

        Ok(Settings {
            bind_addr: SocketAddr::new(address, port),
            domain: self.domain.filter(|domain| !domain.is_empty()),
            secure: self.secure.unwrap_or(false),
            landing: self.landing,
            path_routing: self.path_routing.unwrap_or(false),
            max_sockets,
            port_range,
            grace_period: Duration::from_millis(
                self.grace_period_ms.unwrap_or(DEFAULT_GRACE_PERIOD_MS),
            ),
            auth,
        })
    }

    /// Generate a template config file content
    pub fn template() -> String {
        format!(
            r#"# localtun server configuration
# Every setting can also be given as a flag or LOCALTUN_* variable.

port: {port}
address: "{address}"
# domain: "tunnel.example.com"
secure: false
max_sockets: {max_sockets}
port_range: "{min_port}:{max_port}"
grace_period_ms: {grace}
# path_routing: true
# landing: "https://example.com/"

# Token authentication (pick one)
# jwt_secret: "change-me"
# require_token: true
# tokens:
#   - "token-one"
"#,
            port = DEFAULT_PORT,
            address = DEFAULT_ADDRESS,
            max_sockets = DEFAULT_MAX_SOCKETS,
            min_port = DEFAULT_MIN_PORT,
            max_port = DEFAULT_MAX_PORT,
            grace = DEFAULT_GRACE_PERIOD_MS,
        )
    }
}
