//! Fixed-range port allocation for tunnel listeners
//!
//! When a range is configured, every tunnel listener is bound to a port taken
//! from it instead of an OS-assigned one. Allocation is first-fit in ascending
//! order and a port is never handed to two owners at once.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;

/// Port range errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortRangeError {
    #[error("Bad range expression: {0}")]
    BadExpression(String),

    #[error("Bad range expression min > max: {0}")]
    Inverted(String),

    #[error("No more ports available in range {0}")]
    Exhausted(PortRange),
}

/// Inclusive port range written as `first:last`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.first, self.last)
    }
}

impl FromStr for PortRange {
    type Err = PortRangeError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let bad = || PortRangeError::BadExpression(expr.to_string());

        let (first, last) = expr.split_once(':').ok_or_else(bad)?;
        let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if !digits(first) || !digits(last) {
            return Err(bad());
        }

        let first: u16 = first.parse().map_err(|_| bad())?;
        let last: u16 = last.parse().map_err(|_| bad())?;

        if first > last {
            return Err(PortRangeError::Inverted(expr.to_string()));
        }

        Ok(Self { first, last })
    }
}

/// Tracks which ports of a range are owned, and by whom
pub struct PortManager {
    range: PortRange,
    /// port -> owning tunnel id (None = free)
    ports: Mutex<BTreeMap<u16, Option<String>>>,
}

impl PortManager {
    /// Create a manager from a `first:last` expression
    pub fn new(expr: &str) -> Result<Self, PortRangeError> {
        Ok(Self::with_range(expr.parse()?))
    }

    pub fn with_range(range: PortRange) -> Self {
        let ports = (range.first..=range.last).map(|port| (port, None)).collect();
        debug!("Port pool initialized for range {}", range);

        Self {
            range,
            ports: Mutex::new(ports),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    fn ports(&self) -> MutexGuard<'_, BTreeMap<u16, Option<String>>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign the lowest free port to `owner`
    pub fn allocate(&self, owner: &str) -> Result<u16, PortRangeError> {
        let mut ports = self.ports();

        match ports.iter_mut().find(|(_, slot)| slot.is_none()) {
            Some((port, slot)) => {
                *slot = Some(owner.to_string());
                debug!(port = *port, owner = owner, "Port allocated");
                Ok(*port)
            }
            None => {
                debug!("No more ports available in range {}", self.range);
                Err(PortRangeError::Exhausted(self.range))
            }
        }
    }

    /// Return a port to the pool; ports outside the range are ignored
    pub fn release(&self, port: u16) {
        if let Some(slot) = self.ports().get_mut(&port) {
            debug!(port = port, "Port released");
            *slot = None;
        }
    }

    /// Current owner of a port, if allocated
    pub fn owner_of(&self, port: u16) -> Option<String> {
        self.ports().get(&port).cloned().flatten()
    }

    /// Number of ports not currently allocated
    pub fn available(&self) -> usize {
        self.ports().values().filter(|slot| slot.is_none()).count()
    }
}
