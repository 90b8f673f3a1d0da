//! Host-based tunnel resolution

use localtun_proto::TunnelId;
use std::net::IpAddr;
use tracing::trace;

/// Where a public request should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// The host names a tunnel; unknown tunnels are a 404
    Subdomain(String),
    /// No subdomain, but the first path segment may name a tunnel
    PathPrefix(String),
    /// Served by the server's own API
    ControlPlane,
}

/// Normalize host header: drop the port and lowercase
///
/// Bracketed IPv6 literals are returned without brackets.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();

    let bare = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        // Remove port if present (e.g., "example.com:8080" -> "example.com")
        host.split(':').next().unwrap_or(host)
    };

    bare.trim_end_matches('.').to_ascii_lowercase()
}

/// Extracts tunnel ids from request hosts
#[derive(Debug, Clone, Default)]
pub struct SubdomainResolver {
    base_domain: Option<String>,
    path_routing: bool,
}

impl SubdomainResolver {
    /// `base_domain` is the domain tunnels are served under
    /// (e.g. `tunnel.example.com` for `<id>.tunnel.example.com`)
    pub fn new(base_domain: Option<&str>) -> Self {
        Self {
            base_domain: base_domain
                .map(normalize_host)
                .filter(|domain| !domain.is_empty()),
            path_routing: false,
        }
    }

    /// Also accept `/<id>/...` when the host carries no subdomain
    pub fn with_path_routing(mut self, enabled: bool) -> Self {
        self.path_routing = enabled;
        self
    }

    pub fn base_domain(&self) -> Option<&str> {
        self.base_domain.as_deref()
    }

    /// Subdomain label of `host`, if it has one
    pub fn subdomain(&self, host: &str) -> Option<String> {
        let host = normalize_host(host);
        if host.is_empty() || host.parse::<IpAddr>().is_ok() {
            return None;
        }

        let label = match &self.base_domain {
            Some(domain) => {
                let prefix = host.strip_suffix(domain.as_str())?.strip_suffix('.')?;
                (!prefix.contains('.')).then_some(prefix)?
            }
            None => {
                let labels: Vec<&str> = host.split('.').collect();
                match labels.as_slice() {
                    [label, "localhost"] => *label,
                    [label, _, _, ..] => *label,
                    _ => return None,
                }
            }
        };

        (!label.is_empty()).then(|| label.to_string())
    }

    /// First path segment, if it is a well-formed tunnel id
    pub fn path_prefix(path: &str) -> Option<&str> {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        let segment = path.trim_start_matches('/').split('/').next()?;
        TunnelId::is_valid(segment).then_some(segment)
    }

    /// Decide how to serve a request
    pub fn route(&self, host: Option<&str>, path: &str) -> RouteDecision {
        if let Some(id) = host.and_then(|h| self.subdomain(h)) {
            trace!(host = ?host, tunnel_id = %id, "Routing by subdomain");
            return RouteDecision::Subdomain(id);
        }

        if self.path_routing {
            if let Some(id) = Self::path_prefix(path) {
                trace!(path = path, tunnel_id = %id, "Routing by path prefix");
                return RouteDecision::PathPrefix(id.to_string());
            }
        }

        RouteDecision::ControlPlane
    }
}
