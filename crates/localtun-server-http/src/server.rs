//! Public HTTP listener
//!
//! Every accepted connection runs a keep-alive loop: read a request head,
//! resolve the tunnel from the `Host` header, and either proxy the request
//! over one of the tunnel's sockets or hand it to the control-plane API.

use axum::body::Body;
use axum::Router;
use http::{Request, StatusCode, Version};
use localtun_auth::TokenValidator;
use localtun_control::{ProxyError, SessionConfig, TunnelRegistry, TunnelSession};
use localtun_proto::{read_request_head, relay_body, BodyFraming, RequestHead, WireError};
use localtun_router::{RouteDecision, SubdomainResolver};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::api::{self, AppState};
use crate::connection::PublicConnection;
use crate::response::{plain_response, serialize_response};

/// Where `GET /` redirects to by default
pub const DEFAULT_LANDING_PAGE: &str = "https://localtunnel.github.io/www/";

/// Largest request body accepted by the control plane
const MAX_CONTROL_BODY: u64 = 1024 * 1024;

/// HTTP server errors
#[derive(Debug, Error)]
pub enum HttpServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Ports below 1024 need elevated privileges; try --port 8080")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// HTTP server configuration
#[derive(Clone)]
pub struct HttpServerConfig {
    pub bind_addr: SocketAddr,
    /// Domain tunnels are served under; the request host is used when unset
    pub base_domain: Option<String>,
    /// Advertise `https://` URLs
    pub secure: bool,
    pub landing_page: String,
    /// Route `/<id>/...` to tunnels when the host has no subdomain
    pub path_routing: bool,
    pub session: SessionConfig,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 80)),
            base_domain: None,
            secure: false,
            landing_page: DEFAULT_LANDING_PAGE.to_string(),
            path_routing: false,
            session: SessionConfig::default(),
        }
    }
}

/// Tunnel HTTP server
pub struct HttpServer {
    config: HttpServerConfig,
    registry: Arc<TunnelRegistry>,
    validator: Option<Arc<dyn TokenValidator>>,
}

impl HttpServer {
    pub fn new(config: HttpServerConfig) -> Self {
        let registry = Arc::new(TunnelRegistry::new(config.session.clone()));
        Self {
            config,
            registry,
            validator: None,
        }
    }

    /// Require a valid bearer token for tunnel creation and `kill`
    pub fn with_token_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn registry(&self) -> Arc<TunnelRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &HttpServerConfig {
        &self.config
    }

    /// Bind the public listener
    pub async fn bind(&self) -> Result<TcpListener, HttpServerError> {
        TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| HttpServerError::BindError {
                address: self.config.bind_addr.ip().to_string(),
                port: self.config.bind_addr.port(),
                reason: e.to_string(),
            })
    }

    /// Bind and serve until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), HttpServerError> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener
    ///
    /// On shutdown all tunnel sessions are closed.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), HttpServerError> {
        let local_addr = listener.local_addr()?;
        info!("HTTP server listening on {}", local_addr);

        let dispatcher = Arc::new(self.dispatcher());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("HTTP server shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted connection from {}", peer_addr);
                        let dispatcher = dispatcher.clone();
                        tokio::spawn(async move {
                            if let Err(e) = dispatcher.handle_connection(stream).await {
                                debug!("Connection from {} ended: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }

        self.registry.shutdown();
        Ok(())
    }

    fn dispatcher(&self) -> Dispatcher {
        let resolver = SubdomainResolver::new(self.config.base_domain.as_deref())
            .with_path_routing(self.config.path_routing);

        let state = Arc::new(AppState {
            registry: self.registry.clone(),
            validator: self.validator.clone(),
            landing_page: self.config.landing_page.clone(),
            secure: self.config.secure,
            base_domain: resolver.base_domain().map(str::to_string),
            path_routing: self.config.path_routing,
        });

        Dispatcher {
            registry: self.registry.clone(),
            resolver,
            api: api::router(state),
        }
    }
}

struct Dispatcher {
    registry: Arc<TunnelRegistry>,
    resolver: SubdomainResolver,
    api: Router,
}

impl Dispatcher {
    async fn handle_connection(&self, stream: TcpStream) -> io::Result<()> {
        let _ = stream.set_nodelay(true);
        let mut conn = PublicConnection::new(stream);

        loop {
            let head = match read_request_head(&mut conn.reader).await {
                Ok(Some(head)) => head,
                Ok(None) | Err(WireError::UnexpectedEof) => return Ok(()),
                Err(WireError::Io(e)) => return Err(e),
                Err(WireError::HeadTooLarge) => {
                    let raw = plain_response(
                        StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                        "Request header too large",
                    );
                    return conn.writer.write_all(&raw).await;
                }
                Err(e) => {
                    debug!("Malformed request: {}", e);
                    let raw = plain_response(StatusCode::BAD_REQUEST, "Bad Request");
                    return conn.writer.write_all(&raw).await;
                }
            };

            if !self.dispatch(&head, &mut conn).await? {
                break;
            }
        }

        conn.writer.shutdown().await
    }

    /// Serve one request; returns whether the connection stays open
    async fn dispatch(&self, head: &RequestHead, conn: &mut PublicConnection) -> io::Result<bool> {
        match self.resolver.route(head.host(), &head.path) {
            RouteDecision::Subdomain(id) => match self.registry.get_session(&id) {
                Some(session) => self.proxy(&session, head, conn).await,
                // No tenant to hand the upgrade to
                None if head.is_upgrade() => Ok(false),
                None => {
                    debug!(tunnel_id = %id, "Request for unknown tunnel");
                    let raw =
                        plain_response(StatusCode::NOT_FOUND, &format!("Tunnel {} not found", id));
                    conn.writer.write_all(&raw).await?;
                    Ok(false)
                }
            },
            RouteDecision::PathPrefix(id) => match self.registry.get_session(&id) {
                Some(session) => self.proxy(&session, head, conn).await,
                None => self.control_plane(head, conn).await,
            },
            RouteDecision::ControlPlane => self.control_plane(head, conn).await,
        }
    }

    async fn proxy(
        &self,
        session: &TunnelSession,
        head: &RequestHead,
        conn: &mut PublicConnection,
    ) -> io::Result<bool> {
        let tunnel_id = session.id();

        if head.is_upgrade() {
            match session.proxy_upgrade(head, conn).await {
                Ok(stats) => debug!(
                    tunnel_id = %tunnel_id,
                    bytes_to_tunnel = stats.bytes_to_tunnel,
                    bytes_from_tunnel = stats.bytes_from_tunnel,
                    "Upgraded connection finished"
                ),
                Err(e) => debug!(tunnel_id = %tunnel_id, "Upgraded connection failed: {}", e),
            }
            return Ok(false);
        }

        let error = match session
            .proxy_request(head, &mut conn.reader, &mut conn.writer)
            .await
        {
            Ok(outcome) => {
                debug!(
                    tunnel_id = %tunnel_id,
                    method = %head.method,
                    path = %head.path,
                    status = outcome.status,
                    "Proxied request"
                );
                return Ok(outcome.keep_alive);
            }
            Err(e) => e,
        };

        let (status, message) = match &error {
            ProxyError::NoAvailableSocket(_) => (StatusCode::GATEWAY_TIMEOUT, "Tunnel unavailable"),
            ProxyError::Upstream {
                response_started: false,
                ..
            } => (StatusCode::BAD_GATEWAY, "Tunnel connection failed"),
            ProxyError::Wire(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
            ProxyError::ClientGone => return Ok(false),
            ProxyError::Upstream { .. } | ProxyError::Client(_) => {
                // Part of the response is already out; all we can do is abort
                debug!(tunnel_id = %tunnel_id, "Aborting connection: {}", error);
                return Ok(false);
            }
        };

        warn!(tunnel_id = %tunnel_id, status = status.as_u16(), "Request failed: {}", error);
        conn.writer.write_all(&plain_response(status, message)).await?;
        Ok(false)
    }

    async fn control_plane(
        &self,
        head: &RequestHead,
        conn: &mut PublicConnection,
    ) -> io::Result<bool> {
        if head.is_upgrade() {
            return Ok(false);
        }

        if let Err(status) = drain_body(head, &mut conn.reader).await {
            let raw = plain_response(status, status.canonical_reason().unwrap_or(""));
            conn.writer.write_all(&raw).await?;
            return Ok(false);
        }

        let request = match build_request(head) {
            Ok(request) => request,
            Err(e) => {
                debug!("Rejected request head: {}", e);
                let raw = plain_response(StatusCode::BAD_REQUEST, "Bad Request");
                conn.writer.write_all(&raw).await?;
                return Ok(false);
            }
        };

        let response = match self.api.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };

        let keep_alive = head.keep_alive();
        let raw = match serialize_response(response, keep_alive, head.version == 0).await {
            Ok(raw) => raw,
            Err(e) => {
                error!("Failed to build API response: {}", e);
                let raw = plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
                conn.writer.write_all(&raw).await?;
                return Ok(false);
            }
        };

        conn.writer.write_all(&raw).await?;
        Ok(keep_alive)
    }
}

/// Consume a control-plane request body; none of the API routes read one
async fn drain_body<R>(head: &RequestHead, reader: &mut R) -> Result<(), StatusCode>
where
    R: AsyncBufRead + Unpin,
{
    let framing = head
        .body_framing()
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    match framing {
        BodyFraming::Empty => return Ok(()),
        BodyFraming::Length(len) if len > MAX_CONTROL_BODY => {
            return Err(StatusCode::PAYLOAD_TOO_LARGE)
        }
        _ => {}
    }

    let mut limited = reader.take(MAX_CONTROL_BODY);
    relay_body(&mut limited, &mut tokio::io::sink(), framing)
        .await
        .map(|_| ())
        .map_err(|_| StatusCode::BAD_REQUEST)
}

fn build_request(head: &RequestHead) -> Result<Request<Body>, http::Error> {
    let version = if head.version == 0 {
        Version::HTTP_10
    } else {
        Version::HTTP_11
    };

    let mut builder = Request::builder()
        .method(head.method.as_str())
        .uri(head.path.as_str())
        .version(version);
    for field in &head.headers {
        builder = builder.header(field.name.as_str(), field.value.as_slice());
    }

    builder.body(Body::empty())
}
