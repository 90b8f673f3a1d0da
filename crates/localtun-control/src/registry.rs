//! Registry of live tunnel sessions keyed by tunnel id

use crate::session::{SessionConfig, TunnelSession};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use localtun_pool::PoolError;
use localtun_proto::{IdentifierError, TunnelId};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidIdentifier(#[from] IdentifierError),

    #[error("Failed to start tunnel listener: {0}")]
    Bind(#[from] PoolError),
}

/// Returned to the remote client when a tunnel is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub id: TunnelId,
    /// Port the remote client opens its tunnel sockets to
    pub port: u16,
    pub max_connections: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Sessions whose tunnel listener is up
    pub tunnels: usize,
}

/// Maps tunnel ids to sessions
///
/// A session is removed automatically once it closes, whether through its
/// grace timer, a pool failure, or [`TunnelRegistry::remove_session`].
pub struct TunnelRegistry {
    sessions: Arc<DashMap<TunnelId, Arc<TunnelSession>>>,
    config: SessionConfig,
}

impl TunnelRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create a session and start its tunnel listener
    ///
    /// A requested id that is already taken is silently replaced by a random
    /// one; the returned [`TunnelInfo`] carries the id actually assigned.
    pub async fn create_tunnel(&self, requested: Option<&str>) -> Result<TunnelInfo, RegistryError> {
        let mut requested = requested.map(TunnelId::parse).transpose()?;

        let session = loop {
            let id = requested.take().unwrap_or_else(TunnelId::random);

            // reserve the id before binding so concurrent requests cannot take it
            match self.sessions.entry(id) {
                Entry::Occupied(taken) => {
                    debug!(tunnel_id = %taken.key(), "Tunnel id in use, assigning a random one");
                }
                Entry::Vacant(slot) => {
                    let session = TunnelSession::new(slot.key().clone(), &self.config);
                    slot.insert(Arc::clone(&session));
                    break session;
                }
            }
        };

        let info = match session.bind().await {
            Ok(info) => info,
            Err(e) => {
                warn!(tunnel_id = %session.id(), "Failed to start tunnel: {}", e);
                self.sessions
                    .remove_if(session.id(), |_, current| Arc::ptr_eq(current, &session));
                session.close();
                return Err(e.into());
            }
        };

        self.watch(Arc::clone(&session));

        info!(
            tunnel_id = %session.id(),
            port = info.port,
            max_sockets = info.max_connections,
            "Tunnel created"
        );

        Ok(TunnelInfo {
            id: session.id().clone(),
            port: info.port,
            max_connections: info.max_connections,
        })
    }

    /// Drop the registry entry when the session closes, unless the id was
    /// reused by a newer session in the meantime
    fn watch(&self, session: Arc<TunnelSession>) {
        let sessions = Arc::clone(&self.sessions);

        tokio::spawn(async move {
            session.closed().await;

            let removed = sessions
                .remove_if(session.id(), |_, current| Arc::ptr_eq(current, &session))
                .is_some();
            if removed {
                info!(tunnel_id = %session.id(), "Tunnel removed");
            }
        });
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<TunnelSession>> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|session| !session.is_closed())
    }

    pub fn has_session(&self, id: &str) -> bool {
        self.get_session(id).is_some()
    }

    /// Close and remove a session; absent ids are ignored
    pub fn remove_session(&self, id: &str) {
        if let Some((_, session)) = self.sessions.remove(id) {
            session.close();
            info!(tunnel_id = %id, "Tunnel removed");
        }
    }

    pub fn stats(&self) -> RegistryStats {
        let tunnels = self
            .sessions
            .iter()
            .filter(|entry| entry.value().port().is_some() && !entry.value().is_closed())
            .count();
        RegistryStats { tunnels }
    }

    /// Ids of all registered sessions
    pub fn list(&self) -> Vec<TunnelId> {
        let mut ids: Vec<TunnelId> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Close every session
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<TunnelSession>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.sessions.clear();

        for session in &sessions {
            session.close();
        }
        info!(count = sessions.len(), "All tunnels closed");
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::net::TcpStream;

    fn registry(grace_ms: u64) -> TunnelRegistry {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        TunnelRegistry::new(SessionConfig {
            grace_period: Duration::from_millis(grace_ms),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..SessionConfig::default()
        })
    }

    #[tokio::test]
    async fn test_starts_empty() {
        let registry = registry(1_000);
        assert_eq!(registry.stats().tunnels, 0);
        assert!(!registry.has_session("anything"));
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_create_with_requested_id() {
        let registry = registry(1_000);
        let info = registry.create_tunnel(Some("foobar")).await.unwrap();

        assert_eq!(info.id.as_str(), "foobar");
        assert_eq!(info.max_connections, 10);
        assert!(info.port > 0);
        assert!(registry.has_session("foobar"));
        assert_eq!(registry.stats().tunnels, 1);

        registry.remove_session("foobar");
    }

    #[tokio::test]
    async fn test_create_with_random_id() {
        let registry = registry(1_000);
        let info = registry.create_tunnel(None).await.unwrap();
        assert!(TunnelId::is_valid(info.id.as_str()));
        assert!(registry.has_session(info.id.as_str()));
    }

    #[tokio::test]
    async fn test_collision_assigns_new_id() {
        let registry = registry(1_000);
        let first = registry.create_tunnel(Some("foobar")).await.unwrap();
        let second = registry.create_tunnel(Some("foobar")).await.unwrap();

        assert_eq!(first.id.as_str(), "foobar");
        assert_ne!(second.id, first.id);
        assert_ne!(second.port, first.port);
        assert!(registry.has_session(first.id.as_str()));
        assert!(registry.has_session(second.id.as_str()));
        assert_eq!(registry.stats().tunnels, 2);
    }

    #[tokio::test]
    async fn test_rejects_invalid_id() {
        let registry = registry(1_000);
        let result = registry.create_tunnel(Some("Bad_Id")).await;
        assert!(matches!(result, Err(RegistryError::InvalidIdentifier(_))));
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_remove_session() {
        let registry = registry(5_000);
        registry.create_tunnel(Some("foobar")).await.unwrap();

        registry.remove_session("foobar");
        assert!(!registry.has_session("foobar"));
        assert_eq!(registry.stats().tunnels, 0);

        registry.remove_session("foobar");
        registry.remove_session("never-existed");
    }

    #[tokio::test]
    async fn test_removes_session_without_sockets() {
        let registry = registry(100);
        registry.create_tunnel(Some("abcd")).await.unwrap();
        assert!(registry.has_session("abcd"));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!registry.has_session("abcd"));
        assert!(registry.list().is_empty());
        assert_eq!(registry.stats().tunnels, 0);
    }

    #[tokio::test]
    async fn test_keeps_session_with_socket() {
        let registry = registry(100);
        let info = registry.create_tunnel(Some("abcd")).await.unwrap();

        let _socket = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(registry.has_session("abcd"));
        let session = registry.get_session("abcd").unwrap();
        assert_eq!(session.stats().connected_sockets, 1);
    }

    #[tokio::test]
    async fn test_id_reused_after_removal() {
        let registry = registry(5_000);
        let first = registry.create_tunnel(Some("reused")).await.unwrap();
        registry.remove_session("reused");

        let second = registry.create_tunnel(Some("reused")).await.unwrap();
        assert_eq!(second.id, first.id);

        // watcher of the first session must not evict the new one
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.has_session("reused"));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let registry = registry(5_000);
        registry.create_tunnel(Some("one1")).await.unwrap();
        registry.create_tunnel(Some("two2")).await.unwrap();
        let session = registry.get_session("one1").unwrap();

        registry.shutdown();
        assert!(session.is_closed());
        assert_eq!(registry.stats().tunnels, 0);
        assert!(registry.list().is_empty());
    }
}
