//! A tunnel session: one remote client, its socket pool and its lifecycle
//!
//! The session starts `Armed` with a grace timer running. The first tunnel
//! socket moves it `Online`. When the last socket goes away it turns
//! `Offline` and the timer restarts; if no socket returns before the timer
//! fires the session closes itself.

use chrono::{DateTime, Utc};
use localtun_pool::{
    PoolConfig, PoolError, PoolEvent, PoolEvents, PoolInfo, PortManager, SocketPool,
    TunnelSocket, DEFAULT_MAX_SOCKETS,
};
use localtun_proto::{
    read_response_head, relay_body, BodyFraming, RelayError, RequestHead, TunnelId, WireError,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default time a session may stay without tunnel sockets
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(1000);

/// Settings shared by all sessions of a registry
#[derive(Clone)]
pub struct SessionConfig {
    pub grace_period: Duration,
    pub max_sockets: usize,
    /// Address tunnel listeners bind to
    pub bind_ip: IpAddr,
    pub port_manager: Option<Arc<PortManager>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            max_sockets: DEFAULT_MAX_SOCKETS,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_manager: None,
        }
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, waiting for the first tunnel socket
    Armed,
    Online,
    /// Lost every socket, grace timer running
    Offline,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub connected_sockets: usize,
    /// Requests waiting for a tunnel socket
    pub pending_requests: usize,
}

/// Proxying errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("No tunnel socket available: {0}")]
    NoAvailableSocket(#[source] PoolError),

    #[error("Tunnel connection failed: {source}")]
    Upstream {
        /// Whether any response bytes already reached the public client
        response_started: bool,
        #[source]
        source: WireError,
    },

    #[error("Public connection failed: {0}")]
    Client(#[source] WireError),

    #[error("Public client disconnected while waiting for a tunnel socket")]
    ClientGone,

    #[error("Malformed request: {0}")]
    Wire(#[source] WireError),
}

/// Result of a proxied HTTP exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyOutcome {
    pub status: u16,
    /// Whether the public connection may carry another request
    pub keep_alive: bool,
}

/// Byte counts of a finished upgraded connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpgradeStats {
    pub bytes_to_tunnel: u64,
    pub bytes_from_tunnel: u64,
}

fn tunnel_closed() -> WireError {
    WireError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionAborted,
        "tunnel closed",
    ))
}

/// One registered tunnel client
pub struct TunnelSession {
    id: TunnelId,
    created_at: DateTime<Utc>,
    pool: SocketPool,
    state: Mutex<SessionState>,
    closed: CancellationToken,
}

impl TunnelSession {
    /// Create a session and start its grace timer
    ///
    /// The tunnel listener is not bound yet, see [`TunnelSession::bind`].
    pub fn new(id: TunnelId, config: &SessionConfig) -> Arc<Self> {
        let mut pool_config = PoolConfig::new(id.as_str());
        pool_config.bind_ip = config.bind_ip;
        pool_config.max_sockets = config.max_sockets;
        pool_config.port_manager = config.port_manager.clone();

        let (pool, events) = SocketPool::new(pool_config);
        let session = Arc::new(Self {
            id,
            created_at: Utc::now(),
            pool,
            state: Mutex::new(SessionState::Armed),
            closed: CancellationToken::new(),
        });

        tokio::spawn(run_lifecycle(
            Arc::downgrade(&session),
            events,
            session.closed.clone(),
            config.grace_period,
        ));

        session
    }

    pub fn id(&self) -> &TunnelId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Bind the tunnel listener
    pub async fn bind(&self) -> Result<PoolInfo, PoolError> {
        self.pool.bind().await
    }

    /// Port remote clients connect their tunnel sockets to
    pub fn port(&self) -> Option<u16> {
        self.pool.port()
    }

    pub fn max_sockets(&self) -> usize {
        self.pool.max_sockets()
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    fn transition(&self, next: SessionState) {
        let mut state = self.lock_state();
        if *state != SessionState::Closed {
            debug!(tunnel_id = %self.id, from = ?*state, to = ?next, "Session state change");
            *state = next;
        }
    }

    pub fn stats(&self) -> SessionStats {
        let pool = self.pool.stats();
        SessionStats {
            connected_sockets: pool.connected_sockets,
            pending_requests: pool.pending_borrows,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session is closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Close the session: stop the timer, destroy the pool, notify watchers
    pub fn close(&self) {
        {
            let mut state = self.lock_state();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }

        self.pool.destroy();
        self.closed.cancel();
        info!(tunnel_id = %self.id, "Tunnel session closed");
    }

    /// Borrow a tunnel socket unless the public client hangs up first
    ///
    /// A hang-up can only be seen while the client has nothing else buffered;
    /// once request bytes are pending the borrow just runs to completion.
    async fn borrow_for<R>(&self, client: &mut R) -> Result<TunnelSocket, ProxyError>
    where
        R: AsyncBufRead + Unpin,
    {
        let hung_up = async {
            match client.fill_buf().await {
                Ok(buffered) if !buffered.is_empty() => std::future::pending().await,
                _ => (),
            }
        };

        tokio::select! {
            biased;
            _ = hung_up => {
                debug!(tunnel_id = %self.id, "Public client gone, dropping queued request");
                Err(ProxyError::ClientGone)
            }
            socket = self.pool.borrow() => socket.map_err(ProxyError::NoAvailableSocket),
        }
    }

    /// Forward one HTTP request over a tunnel socket and stream the response back
    ///
    /// The request body is relayed while the response is read, so upstreams
    /// that answer before consuming the body (or send `100 Continue`) work.
    pub async fn proxy_request<R, W>(
        &self,
        head: &RequestHead,
        client_reader: &mut R,
        client_writer: &mut W,
    ) -> Result<ProxyOutcome, ProxyError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let request_framing = head.body_framing().map_err(ProxyError::Wire)?;
        let request_bytes = head.encode();
        let method = head.method.as_str();

        let mut socket = self.borrow_for(client_reader).await?;
        let terminated = socket.terminated();

        debug!(
            tunnel_id = %self.id,
            socket_id = socket.id(),
            method = method,
            path = %head.path,
            "Proxying request"
        );

        let started = AtomicBool::new(false);
        let upstream_err = |source: WireError| ProxyError::Upstream {
            response_started: started.load(Ordering::Acquire),
            source,
        };

        let (up_read, mut up_write) = socket.stream_mut().split();
        let mut up_reader = BufReader::new(up_read);

        let send_request = async {
            up_write
                .write_all(&request_bytes)
                .await
                .map_err(|e| upstream_err(e.into()))?;
            relay_body(client_reader, &mut up_write, request_framing)
                .await
                .map_err(|e| match e {
                    RelayError::Read(err) => ProxyError::Client(err),
                    RelayError::Write(err) => upstream_err(err.into()),
                })?;
            Ok::<_, ProxyError>(())
        };

        let read_response = async {
            loop {
                let (response, raw) = read_response_head(&mut up_reader)
                    .await
                    .map_err(&upstream_err)?;

                if response.is_interim() {
                    client_writer
                        .write_all(&raw)
                        .await
                        .map_err(|e| ProxyError::Client(e.into()))?;
                    client_writer
                        .flush()
                        .await
                        .map_err(|e| ProxyError::Client(e.into()))?;
                    started.store(true, Ordering::Release);
                    continue;
                }

                let framing = response.body_framing(method).map_err(&upstream_err)?;
                client_writer
                    .write_all(&raw)
                    .await
                    .map_err(|e| ProxyError::Client(e.into()))?;
                started.store(true, Ordering::Release);

                relay_body(&mut up_reader, client_writer, framing)
                    .await
                    .map_err(|e| match e {
                        RelayError::Read(err) => upstream_err(err),
                        RelayError::Write(err) => ProxyError::Client(err.into()),
                    })?;

                return Ok::<_, ProxyError>((response, framing));
            }
        };

        let exchange = async { tokio::try_join!(send_request, read_response) };
        let result = tokio::select! {
            result = exchange => result,
            _ = terminated => Err(upstream_err(tunnel_closed())),
        };

        let leftover = !up_reader.buffer().is_empty();
        drop(up_reader);

        match result {
            Ok(((), (response, framing))) => {
                let upstream_reusable = response.keep_alive()
                    && framing.is_self_delimited()
                    && response.status != 101
                    && !leftover;

                if upstream_reusable {
                    socket.release();
                } else {
                    socket.discard();
                }

                Ok(ProxyOutcome {
                    status: response.status,
                    keep_alive: head.keep_alive()
                        && response.keep_alive()
                        && framing != BodyFraming::UntilClose
                        && response.status != 101,
                })
            }
            Err(e) => {
                debug!(tunnel_id = %self.id, "Proxied request failed: {}", e);
                socket.discard();
                Err(e)
            }
        }
    }

    /// Hand an upgrade request to the remote client and pipe bytes both ways
    ///
    /// The tunnel socket is consumed: it is closed when either side hangs up.
    pub async fn proxy_upgrade<S>(
        &self,
        head: &RequestHead,
        client: &mut S,
    ) -> Result<UpgradeStats, ProxyError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin,
    {
        let mut socket = self.borrow_for(client).await?;
        let terminated = socket.terminated();

        debug!(
            tunnel_id = %self.id,
            socket_id = socket.id(),
            path = %head.path,
            "Proxying upgrade"
        );

        let upstream = socket.stream_mut();
        upstream
            .write_all(&head.encode())
            .await
            .map_err(|e| ProxyError::Upstream {
                response_started: false,
                source: e.into(),
            })?;

        let result = tokio::select! {
            copied = tokio::io::copy_bidirectional(client, upstream) => copied
                .map(|(to_tunnel, from_tunnel)| UpgradeStats {
                    bytes_to_tunnel: to_tunnel,
                    bytes_from_tunnel: from_tunnel,
                })
                .map_err(|e| ProxyError::Upstream {
                    response_started: true,
                    source: e.into(),
                }),
            _ = terminated => Err(ProxyError::Upstream {
                response_started: true,
                source: tunnel_closed(),
            }),
        };

        socket.discard();
        result
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Drive the session state machine from pool events and the grace timer
async fn run_lifecycle(
    session: Weak<TunnelSession>,
    mut events: PoolEvents,
    closed: CancellationToken,
    grace_period: Duration,
) {
    let mut deadline = Some(Instant::now() + grace_period);

    loop {
        let grace = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        // events first: a socket that connected right at the deadline still counts
        tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            event = events.recv() => {
                let Some(session) = session.upgrade() else {
                    break;
                };

                match event {
                    Some(PoolEvent::Online) => {
                        deadline = None;
                        session.transition(SessionState::Online);
                        info!(tunnel_id = %session.id, "Tunnel client online");
                    }
                    Some(PoolEvent::Offline) => {
                        deadline = Some(Instant::now() + grace_period);
                        session.transition(SessionState::Offline);
                        info!(tunnel_id = %session.id, "Tunnel client offline");
                    }
                    Some(PoolEvent::Error(reason)) => {
                        warn!(tunnel_id = %session.id, "Tunnel pool failed: {}", reason);
                        session.close();
                        break;
                    }
                    None => {
                        session.close();
                        break;
                    }
                }
            }
            _ = grace => {
                if let Some(session) = session.upgrade() {
                    info!(
                        tunnel_id = %session.id,
                        grace_ms = grace_period.as_millis() as u64,
                        "No tunnel sockets within grace period"
                    );
                    session.close();
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localtun_proto::read_request_head;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt};
    use tokio::net::TcpStream;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn config(grace_ms: u64) -> SessionConfig {
        SessionConfig {
            grace_period: Duration::from_millis(grace_ms),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..SessionConfig::default()
        }
    }

    async fn bound_session(grace_ms: u64) -> (Arc<TunnelSession>, u16) {
        let session = TunnelSession::new(TunnelId::parse("session-test").unwrap(), &config(grace_ms));
        let info = session.bind().await.unwrap();
        (session, info.port)
    }

    async fn wait_for_state(session: &TunnelSession, expected: SessionState) {
        for _ in 0..300 {
            if session.state() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never reached {:?}, stuck at {:?}", expected, session.state());
    }

    /// Public side that stays connected without sending anything more
    fn idle_client() -> (tokio::io::BufReader<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let (client, peer) = tokio::io::duplex(64);
        (tokio::io::BufReader::new(client), peer)
    }

    fn get(path: &str) -> RequestHead {
        let raw = format!("GET {} HTTP/1.1\r\nHost: session-test.example.com\r\n\r\n", path);
        RequestHead::parse(raw.as_bytes()).unwrap().unwrap().0
    }

    /// Serve one request on a tunnel socket the way a tunnel client would
    async fn answer_once(stream: &mut TcpStream, response: &[u8]) -> RequestHead {
        let (read, mut write) = stream.split();
        let mut reader = tokio::io::BufReader::new(read);
        let head = read_request_head(&mut reader).await.unwrap().unwrap();
        write.write_all(response).await.unwrap();
        head
    }

    #[tokio::test]
    async fn test_closes_without_sockets_after_grace() {
        init_tracing();
        let (session, _port) = bound_session(100).await;
        assert_eq!(session.state(), SessionState::Armed);

        tokio::time::timeout(Duration::from_secs(2), session.closed())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_reconnect_within_grace_keeps_session() {
        init_tracing();
        let (session, port) = bound_session(300).await;

        let first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        wait_for_state(&session, SessionState::Online).await;

        drop(first);
        wait_for_state(&session, SessionState::Offline).await;

        let _second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        wait_for_state(&session, SessionState::Online).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(session.state(), SessionState::Online);
        assert!(!session.is_closed());
        assert_eq!(session.stats().connected_sockets, 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        init_tracing();
        let (session, _port) = bound_session(5_000).await;
        session.close();
        session.close();
        assert!(session.is_closed());
        assert_eq!(session.state(), SessionState::Closed);

        let (mut reader, _peer) = idle_client();
        let mut writer = Vec::new();
        let result = session.proxy_request(&get("/"), &mut reader, &mut writer).await;
        assert!(matches!(result, Err(ProxyError::NoAvailableSocket(PoolError::PoolClosed))));
    }

    #[tokio::test]
    async fn test_closed_client_is_not_queued() {
        init_tracing();
        let (session, _port) = bound_session(5_000).await;

        let mut reader = tokio::io::BufReader::new(&b""[..]);
        let mut writer = Vec::new();
        let result = session.proxy_request(&get("/"), &mut reader, &mut writer).await;

        assert!(matches!(result, Err(ProxyError::ClientGone)));
        assert_eq!(session.stats().pending_requests, 0);
    }

    #[tokio::test]
    async fn test_client_hang_up_cancels_queued_request() {
        init_tracing();
        let (session, port) = bound_session(5_000).await;

        let (client, peer) = tokio::io::duplex(64);
        let proxy = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                let mut reader = tokio::io::BufReader::new(client);
                let mut writer = Vec::new();
                session.proxy_request(&get("/charge"), &mut reader, &mut writer).await
            }
        });

        for _ in 0..300 {
            if session.stats().pending_requests == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.stats().pending_requests, 1);

        drop(peer);
        assert!(matches!(proxy.await.unwrap(), Err(ProxyError::ClientGone)));
        assert_eq!(session.stats().pending_requests, 0);

        // the socket that shows up afterwards is not handed the abandoned request
        let mut tunnel = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        wait_for_state(&session, SessionState::Online).await;
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(200), tunnel.read(&mut buf)).await;
        assert!(read.is_err());
        assert_eq!(session.stats().connected_sockets, 1);
    }

    #[tokio::test]
    async fn test_socket_arriving_at_deadline_keeps_session() {
        init_tracing();
        let (session, port) = bound_session(100).await;
        // let the timer and the accept loop register
        tokio::time::sleep(Duration::from_millis(10)).await;

        // connect, then block the runtime past the deadline so both are ready together
        let _tunnel = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!session.is_closed());
        assert_eq!(session.state(), SessionState::Online);
    }

    #[tokio::test]
    async fn test_proxy_request_reuses_socket() {
        init_tracing();
        let (session, port) = bound_session(5_000).await;
        let mut tunnel = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        wait_for_state(&session, SessionState::Online).await;

        for path in ["/one", "/two"] {
            let remote = async {
                answer_once(&mut tunnel, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await
            };
            let (mut reader, _peer) = idle_client();
            let mut writer = Vec::new();
            let request = get(path);
            let proxy = session.proxy_request(&request, &mut reader, &mut writer);

            let (seen, outcome) = tokio::join!(remote, proxy);
            let outcome = outcome.unwrap();

            assert_eq!(seen.path, path);
            assert_eq!(outcome.status, 200);
            assert!(outcome.keep_alive);
            assert_eq!(writer, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec());
        }

        assert_eq!(session.stats().connected_sockets, 1);
    }

    #[tokio::test]
    async fn test_proxy_request_with_body_and_continue() {
        init_tracing();
        let (session, port) = bound_session(5_000).await;
        let mut tunnel = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        wait_for_state(&session, SessionState::Online).await;

        let raw = b"POST /upload HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n";
        let head = RequestHead::parse(raw).unwrap().unwrap().0;

        let remote = async {
            let (read, mut write) = tunnel.split();
            let mut reader = tokio::io::BufReader::new(read);
            read_request_head(&mut reader).await.unwrap().unwrap();
            write.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.unwrap();
            let mut body = [0u8; 5];
            reader.read_exact(&mut body).await.unwrap();
            write
                .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 5\r\n\r\n")
                .await
                .unwrap();
            write.write_all(&body).await.unwrap();
        };

        let mut body = tokio::io::BufReader::new(&b"hello"[..]);
        let mut writer = Vec::new();
        let proxy = session.proxy_request(&head, &mut body, &mut writer);
        let ((), outcome) = tokio::join!(remote, proxy);

        assert_eq!(outcome.unwrap().status, 201);
        assert_eq!(
            String::from_utf8(writer).unwrap(),
            "HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 5\r\n\r\nhello"
        );
    }

    #[tokio::test]
    async fn test_response_until_close_discards_socket() {
        init_tracing();
        let (session, port) = bound_session(5_000).await;
        let mut tunnel = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        wait_for_state(&session, SessionState::Online).await;

        let remote = async {
            answer_once(&mut tunnel, b"HTTP/1.1 200 OK\r\n\r\nstreamed").await;
            tunnel.shutdown().await.unwrap();
        };
        let (mut reader, _peer) = idle_client();
        let mut writer = Vec::new();
        let request = get("/stream");
        let proxy = session.proxy_request(&request, &mut reader, &mut writer);
        let ((), outcome) = tokio::join!(remote, proxy);

        let outcome = outcome.unwrap();
        assert!(!outcome.keep_alive);
        assert!(writer.ends_with(b"streamed"));
        wait_for_state(&session, SessionState::Offline).await;
    }

    #[tokio::test]
    async fn test_upstream_failure_before_response() {
        init_tracing();
        let (session, port) = bound_session(5_000).await;
        let mut tunnel = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        wait_for_state(&session, SessionState::Online).await;

        let remote = async {
            let mut reader = tokio::io::BufReader::new(&mut tunnel);
            reader.fill_buf().await.unwrap();
            drop(reader);
            drop(tunnel);
        };
        let (mut reader, _peer) = idle_client();
        let mut writer = Vec::new();
        let request = get("/");
        let proxy = session.proxy_request(&request, &mut reader, &mut writer);
        let ((), result) = tokio::join!(remote, proxy);

        assert!(matches!(
            result,
            Err(ProxyError::Upstream {
                response_started: false,
                ..
            })
        ));
        assert!(writer.is_empty());
    }

    #[tokio::test]
    async fn test_upgrade_writes_exact_head_and_pipes() {
        init_tracing();
        let (session, port) = bound_session(5_000).await;
        let mut tunnel = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        wait_for_state(&session, SessionState::Online).await;

        let raw = "GET /socket HTTP/1.1\r\n\
                   Host: session-test.example.com\r\n\
                   upgrade: websocket\r\n\
                   Connection: Upgrade\r\n\
                   Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                   \r\n";
        let head = RequestHead::parse(raw.as_bytes()).unwrap().unwrap().0;

        let (mut public, server_side) = tokio::io::duplex(1024);
        let proxy = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                let mut server_side = tokio::io::BufReader::new(server_side);
                session.proxy_upgrade(&head, &mut server_side).await
            }
        });

        let mut received = vec![0u8; raw.len()];
        tunnel.read_exact(&mut received).await.unwrap();
        assert_eq!(String::from_utf8(received).unwrap(), raw);

        tunnel.write_all(b"HTTP/1.1 101 Switching Protocols\r\n\r\nhi").await.unwrap();
        let mut reply = vec![0u8; 38];
        public.read_exact(&mut reply).await.unwrap();
        assert!(reply.ends_with(b"hi"));

        public.write_all(b"ping").await.unwrap();
        let mut ping = [0u8; 4];
        tunnel.read_exact(&mut ping).await.unwrap();
        assert_eq!(&ping, b"ping");

        drop(tunnel);
        drop(public);
        let stats = proxy.await.unwrap().unwrap();
        assert_eq!(stats.bytes_to_tunnel, 4);
        assert_eq!(stats.bytes_from_tunnel, 38);
        wait_for_state(&session, SessionState::Offline).await;
    }
}
