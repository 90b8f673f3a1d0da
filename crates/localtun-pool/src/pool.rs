//! Per-tunnel pool of inbound tunnel sockets
//!
//! A remote client opens up to `max_sockets` TCP connections to the pool's
//! listener. Each public request borrows one of them. Borrows that find no
//! idle socket wait in a FIFO queue until one is connected or released.
//!
//! Idle sockets are parked in a small task that watches the connection, so a
//! socket the client closes while idle is removed immediately and the pool
//! can report going offline.

use crate::port_manager::{PortManager, PortRangeError};
use std::collections::VecDeque;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default cap on concurrently connected tunnel sockets
pub const DEFAULT_MAX_SOCKETS: usize = 10;

/// Pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Pool listener already started")]
    AlreadyStarted,

    #[error("Failed to bind tunnel listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    RangeExhausted(PortRangeError),

    #[error("Pool is closed")]
    PoolClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pool configuration
#[derive(Clone)]
pub struct PoolConfig {
    /// Owner of the pool, used for logs and port ownership
    pub tunnel_id: String,
    /// Address the tunnel listener binds to
    pub bind_ip: IpAddr,
    pub max_sockets: usize,
    /// Take the listener port from this range instead of letting the OS pick
    pub port_manager: Option<Arc<PortManager>>,
}

impl PoolConfig {
    pub fn new(tunnel_id: impl Into<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_sockets: DEFAULT_MAX_SOCKETS,
            port_manager: None,
        }
    }
}

/// Result of binding the tunnel listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolInfo {
    pub port: u16,
    pub max_connections: usize,
}

/// Connectivity transitions reported to the pool owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// First socket connected (0 -> 1)
    Online,
    /// Last socket closed (1 -> 0)
    Offline,
    /// The listener failed and the pool can no longer accept sockets
    Error(String),
}

/// Receiving half of the pool event channel
pub struct PoolEvents {
    rx: mpsc::UnboundedReceiver<PoolEvent>,
}

impl PoolEvents {
    pub async fn recv(&mut self) -> Option<PoolEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PoolEvent> {
        self.rx.try_recv().ok()
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub connected_sockets: usize,
    pub available_sockets: usize,
    pub pending_borrows: usize,
}

struct Parked {
    socket_id: u64,
    /// Wakes the park task, which sends the socket back through the reply
    unpark: oneshot::Sender<oneshot::Sender<TunnelSocket>>,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<TunnelSocket>,
}

#[derive(Default)]
struct PoolState {
    started: bool,
    closed: bool,
    connected: usize,
    available: VecDeque<Parked>,
    pending: VecDeque<Waiter>,
    next_waiter_id: u64,
    port: Option<u16>,
    allocated_port: Option<u16>,
}

struct Shared {
    config: PoolConfig,
    // Never drop a TunnelSocket while holding this lock: its slot guard locks it too
    state: Mutex<PoolState>,
    events: mpsc::UnboundedSender<PoolEvent>,
    shutdown: CancellationToken,
    next_socket_id: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a newly accepted stream and hand it out
    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let socket = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            if state.connected >= self.config.max_sockets {
                debug!(
                    tunnel_id = %self.config.tunnel_id,
                    peer = %peer,
                    "No more sockets allowed, dropping connection"
                );
                return;
            }

            state.connected += 1;
            if state.connected == 1 {
                let _ = self.events.send(PoolEvent::Online);
            }

            let _ = stream.set_nodelay(true);
            TunnelSocket {
                stream,
                id: self.next_socket_id.fetch_add(1, Ordering::Relaxed),
                peer,
                broken: false,
                slot: SlotGuard {
                    shared: Arc::clone(self),
                },
            }
        };

        debug!(
            tunnel_id = %self.config.tunnel_id,
            socket_id = socket.id,
            peer = %peer,
            "Tunnel socket connected"
        );
        self.offer(socket);
    }

    /// Give a socket to the oldest live waiter, or park it as available
    fn offer(self: &Arc<Self>, socket: TunnelSocket) {
        let mut socket = socket;
        let mut state = self.lock();

        if state.closed {
            drop(state);
            return;
        }

        while let Some(waiter) = state.pending.pop_front() {
            match waiter.tx.send(socket) {
                Ok(()) => {
                    debug!(tunnel_id = %self.config.tunnel_id, "Handing socket to queued borrow");
                    return;
                }
                // borrower gave up, try the next one
                Err(returned) => socket = returned,
            }
        }

        let (unpark_tx, unpark_rx) = oneshot::channel();
        state.available.push_back(Parked {
            socket_id: socket.id,
            unpark: unpark_tx,
        });
        drop(state);

        tokio::spawn(park(Arc::clone(self), socket, unpark_rx));
    }

    fn remove_parked(&self, socket_id: u64) {
        self.lock().available.retain(|p| p.socket_id != socket_id);
    }

    fn remove_waiter(&self, id: u64) {
        self.lock().pending.retain(|w| w.id != id);
    }
}

enum Wake {
    Unpark(oneshot::Sender<TunnelSocket>),
    Shutdown,
    Gone(&'static str),
}

/// Hold an idle socket until it is borrowed, closed, or the pool shuts down
async fn park(
    shared: Arc<Shared>,
    socket: TunnelSocket,
    unpark: oneshot::Receiver<oneshot::Sender<TunnelSocket>>,
) {
    let mut probe = [0u8; 1];

    let wake = tokio::select! {
        biased;
        _ = shared.shutdown.cancelled() => Wake::Shutdown,
        reply = unpark => match reply {
            Ok(reply) => Wake::Unpark(reply),
            Err(_) => Wake::Shutdown,
        },
        read = socket.stream.peek(&mut probe) => match read {
            Ok(0) => Wake::Gone("closed by client"),
            Ok(_) => Wake::Gone("unsolicited data on idle socket"),
            Err(_) => Wake::Gone("socket error"),
        },
    };

    match wake {
        Wake::Unpark(reply) => {
            if let Err(socket) = reply.send(socket) {
                // borrower went away between unpark and delivery
                shared.offer(socket);
            }
        }
        Wake::Shutdown => {}
        Wake::Gone(reason) => {
            debug!(
                tunnel_id = %shared.config.tunnel_id,
                socket_id = socket.id,
                reason = reason,
                "Idle tunnel socket removed"
            );
            shared.remove_parked(socket.id);
        }
    }
}

/// Keeps the connected-socket count honest: one slot per live socket
struct SlotGuard {
    shared: Arc<Shared>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.connected = state.connected.saturating_sub(1);

        if state.connected == 0 && !state.closed {
            debug!(tunnel_id = %self.shared.config.tunnel_id, "All tunnel sockets disconnected");
            let _ = self.shared.events.send(PoolEvent::Offline);
        }
    }
}

/// A tunnel socket lent out by the pool
///
/// Dropping it closes the connection. Use [`TunnelSocket::release`] to return
/// it for reuse.
pub struct TunnelSocket {
    stream: TcpStream,
    id: u64,
    peer: SocketAddr,
    broken: bool,
    slot: SlotGuard,
}

impl TunnelSocket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Flag the socket so that `release` closes it instead of reusing it
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Resolves when the owning pool is destroyed
    pub fn terminated(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.slot.shared.shutdown.clone();
        async move { token.cancelled().await }
    }

    /// Return the socket to the pool if it is still usable, otherwise close it
    pub fn release(self) {
        if self.broken {
            debug!(socket_id = self.id, "Closing broken tunnel socket");
            return;
        }
        let shared = Arc::clone(&self.slot.shared);
        shared.offer(self);
    }

    /// Close the socket without returning it
    pub fn discard(self) {}
}

/// Receiving end of a socket hand-off
///
/// If the borrower stops waiting, its queue entry (if any) is removed and a
/// socket that was already sent is offered back to the pool.
struct PendingBorrow {
    shared: Arc<Shared>,
    waiter: Option<u64>,
    rx: oneshot::Receiver<TunnelSocket>,
}

impl Drop for PendingBorrow {
    fn drop(&mut self) {
        if let Some(id) = self.waiter {
            self.shared.remove_waiter(id);
        }
        self.rx.close();
        if let Ok(socket) = self.rx.try_recv() {
            // delivered after the borrower was cancelled
            self.shared.offer(socket);
        }
    }
}

enum Next {
    Parked(Parked),
    Wait(PendingBorrow),
}

/// Pool of tunnel sockets for one tunnel
pub struct SocketPool {
    shared: Arc<Shared>,
}

impl SocketPool {
    pub fn new(config: PoolConfig) -> (Self, PoolEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(PoolState::default()),
            events: tx,
            shutdown: CancellationToken::new(),
            next_socket_id: AtomicU64::new(1),
        });

        (Self { shared }, PoolEvents { rx })
    }

    /// Bind the tunnel listener and start accepting sockets
    pub async fn bind(&self) -> Result<PoolInfo, PoolError> {
        let config = &self.shared.config;

        {
            let mut state = self.shared.lock();
            if state.started {
                return Err(PoolError::AlreadyStarted);
            }
            if state.closed {
                return Err(PoolError::PoolClosed);
            }
            state.started = true;
        }

        let listener = match &config.port_manager {
            Some(ports) => self.bind_from_range(ports).await?,
            None => TcpListener::bind(SocketAddr::new(config.bind_ip, 0))
                .await
                .map_err(|source| PoolError::Bind { port: 0, source })?,
        };
        let port = listener.local_addr()?.port();

        {
            let mut state = self.shared.lock();
            if state.closed {
                drop(state);
                self.release_port();
                return Err(PoolError::PoolClosed);
            }
            state.port = Some(port);
        }

        info!(
            tunnel_id = %config.tunnel_id,
            port = port,
            max_sockets = config.max_sockets,
            "Tunnel listener started"
        );

        tokio::spawn(accept_loop(Arc::clone(&self.shared), listener));

        Ok(PoolInfo {
            port,
            max_connections: config.max_sockets,
        })
    }

    /// Bind to the lowest free port of the range
    ///
    /// Ports held by other processes are skipped for this attempt and handed
    /// back to the range afterwards, so a later tunnel tries them again.
    async fn bind_from_range(&self, ports: &PortManager) -> Result<TcpListener, PoolError> {
        let config = &self.shared.config;
        let mut in_use = Vec::new();

        let result = loop {
            let port = match ports.allocate(&config.tunnel_id) {
                Ok(port) => port,
                Err(e) => break Err(PoolError::RangeExhausted(e)),
            };

            match TcpListener::bind(SocketAddr::new(config.bind_ip, port)).await {
                Ok(listener) => {
                    self.shared.lock().allocated_port = Some(port);
                    break Ok(listener);
                }
                Err(source) if source.kind() == std::io::ErrorKind::AddrInUse => {
                    debug!(
                        tunnel_id = %config.tunnel_id,
                        port = port,
                        "Port already in use, trying the next one"
                    );
                    in_use.push(port);
                }
                Err(source) => {
                    ports.release(port);
                    break Err(PoolError::Bind { port, source });
                }
            }
        };

        for port in in_use {
            ports.release(port);
        }
        result
    }

    /// Borrow a socket, waiting in FIFO order if none is idle
    ///
    /// Fails with [`PoolError::PoolClosed`] once the pool is destroyed.
    pub async fn borrow(&self) -> Result<TunnelSocket, PoolError> {
        loop {
            let next = {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(PoolError::PoolClosed);
                }

                match state.available.pop_front() {
                    Some(parked) => Next::Parked(parked),
                    None => {
                        let id = state.next_waiter_id;
                        state.next_waiter_id += 1;
                        let (tx, rx) = oneshot::channel();
                        state.pending.push_back(Waiter { id, tx });
                        Next::Wait(PendingBorrow {
                            shared: Arc::clone(&self.shared),
                            waiter: Some(id),
                            rx,
                        })
                    }
                }
            };

            match next {
                Next::Parked(parked) => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    if parked.unpark.send(reply_tx).is_err() {
                        // park task already gone (socket closed)
                        continue;
                    }
                    let mut handoff = PendingBorrow {
                        shared: Arc::clone(&self.shared),
                        waiter: None,
                        rx: reply_rx,
                    };
                    match (&mut handoff.rx).await {
                        Ok(socket) => return Ok(socket),
                        Err(_) => continue,
                    }
                }
                Next::Wait(mut pending) => {
                    debug!(tunnel_id = %self.shared.config.tunnel_id, "Waiting for a tunnel socket");
                    return (&mut pending.rx).await.map_err(|_| PoolError::PoolClosed);
                }
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            connected_sockets: state.connected,
            available_sockets: state.available.len(),
            pending_borrows: state.pending.len(),
        }
    }

    /// Port of the tunnel listener, once bound
    pub fn port(&self) -> Option<u16> {
        self.shared.lock().port
    }

    pub fn max_sockets(&self) -> usize {
        self.shared.config.max_sockets
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    fn release_port(&self) {
        let port = self.shared.lock().allocated_port.take();
        if let (Some(port), Some(ports)) = (port, &self.shared.config.port_manager) {
            ports.release(port);
        }
    }

    /// Stop accepting, close every socket and fail pending borrows
    ///
    /// Safe to call more than once.
    pub fn destroy(&self) {
        let (parked, waiters) = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.available),
                std::mem::take(&mut state.pending),
            )
        };

        self.shared.shutdown.cancel();
        drop(parked);
        drop(waiters);
        self.release_port();

        info!(tunnel_id = %self.shared.config.tunnel_id, "Tunnel socket pool destroyed");
    }
}

impl Drop for SocketPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => shared.admit(stream, peer),
                Err(e) if is_transient(&e) => {
                    debug!(tunnel_id = %shared.config.tunnel_id, "Transient accept error: {}", e);
                }
                Err(e) => {
                    error!(tunnel_id = %shared.config.tunnel_id, "Tunnel listener failed: {}", e);
                    let closed = shared.lock().closed;
                    if !closed {
                        let _ = shared.events.send(PoolEvent::Error(e.to_string()));
                    }
                    break;
                }
            }
        }
    }

    if !shared.shutdown.is_cancelled() {
        warn!(tunnel_id = %shared.config.tunnel_id, "Tunnel listener stopped");
    }
}
