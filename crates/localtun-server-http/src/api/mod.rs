//! Control-plane HTTP API
//!
//! Serves tunnel creation and status on requests that do not belong to a
//! tunnel.

pub mod handlers;
pub mod models;

use axum::{routing::get, Router};
use localtun_auth::TokenValidator;
use localtun_control::TunnelRegistry;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
pub struct AppState {
    pub registry: Arc<TunnelRegistry>,
    /// Enables token checks on creation and `kill`
    pub validator: Option<Arc<dyn TokenValidator>>,
    pub landing_page: String,
    pub secure: bool,
    pub base_domain: Option<String>,
    pub path_routing: bool,
}

impl AppState {
    /// Public URL for a tunnel, built from the base domain or the request host
    pub fn public_url(&self, request_host: &str, id: &str) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        let host = self.base_domain.as_deref().unwrap_or(request_host);

        if self.path_routing && self.base_domain.is_none() {
            format!("{}://{}/{}", scheme, host, id)
        } else {
            format!("{}://{}.{}", scheme, id, host)
        }
    }
}

/// Build the control-plane router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/api/status", get(handlers::server_status))
        .route("/api/tunnels/{id}/status", get(handlers::tunnel_status))
        .route("/api/tunnels/{id}/kill", get(handlers::kill_tunnel))
        .route("/{id}", get(handlers::create_named_tunnel))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use localtun_control::SessionConfig;

    fn state(secure: bool, base_domain: Option<&str>, path_routing: bool) -> AppState {
        AppState {
            registry: Arc::new(TunnelRegistry::new(SessionConfig::default())),
            validator: None,
            landing_page: "https://example.com/".to_string(),
            secure,
            base_domain: base_domain.map(str::to_string),
            path_routing,
        }
    }

    #[test]
    fn test_public_url_from_request_host() {
        let state = state(false, None, false);
        assert_eq!(
            state.public_url("localtun.me:8080", "foobar-test"),
            "http://foobar-test.localtun.me:8080"
        );
    }

    #[test]
    fn test_public_url_prefers_base_domain() {
        let state = state(true, Some("tunnel.example.com"), true);
        assert_eq!(
            state.public_url("10.0.0.1", "foobar-test"),
            "https://foobar-test.tunnel.example.com"
        );
    }

    #[test]
    fn test_public_url_with_path_routing() {
        let state = state(false, None, true);
        assert_eq!(
            state.public_url("10.0.0.1:8080", "foobar-test"),
            "http://10.0.0.1:8080/foobar-test"
        );
    }
}
