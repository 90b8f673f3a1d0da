use serde::{Deserialize, Serialize};

/// Server-wide status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Number of tunnels with a running listener
    pub tunnels: usize,
    pub mem: MemoryUsage,
}

/// Process memory usage in bytes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Resident set size
    pub rss: u64,
    /// Virtual memory size
    #[serde(rename = "virtual")]
    pub virtual_size: u64,
}

/// Status of a single tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelStatusResponse {
    pub connected_sockets: usize,
}

/// Returned to a remote client that created a tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTunnelResponse {
    pub id: String,
    /// Port to open tunnel sockets to
    pub port: u16,
    pub max_conn_count: usize,
    /// Public URL of the tunnel
    pub url: String,
}

/// Result of disconnecting a tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillResponse {
    pub success: bool,
    pub message: String,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
