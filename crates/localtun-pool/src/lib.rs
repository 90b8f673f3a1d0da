//! Tunnel socket pooling
//!
//! - [`SocketPool`]: per-tunnel listener and borrowable pool of tunnel sockets
//! - [`PortManager`]: optional fixed port range for tunnel listeners

pub mod pool;
pub mod port_manager;

pub use pool::{
    PoolConfig, PoolError, PoolEvent, PoolEvents, PoolInfo, PoolStats, SocketPool, TunnelSocket,
    DEFAULT_MAX_SOCKETS,
};
pub use port_manager::{PortManager, PortRange, PortRangeError};
