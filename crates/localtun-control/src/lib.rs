//! Tunnel sessions and the registry that owns them
pub mod registry;
pub mod session;

pub use registry::{RegistryError, RegistryStats, TunnelInfo, TunnelRegistry};
pub use session::{
    ProxyError, ProxyOutcome, SessionConfig, SessionState, SessionStats, TunnelSession,
    UpgradeStats, DEFAULT_GRACE_PERIOD,
};
