//! Relay port pairs.
//!
//! Each attachment's relay talks to the in-VM agent on a container-facing
//! port and to the helper on `container_port + helper_offset`. Ports come from
//! a counter that keeps advancing, so a just-released port is not reused
//! while older ones are free.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use skiff_common::{SkiffError, SkiffResult};

use crate::config::RelayConfig;

/// The two control-channel ports used by one relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayPortPair {
    /// Port the in-VM agent listens on for this attachment.
    pub container_port: u32,
    /// Port the helper listens on for this attachment.
    pub helper_port: u32,
}

#[derive(Debug)]
struct PortState {
    next: u32,
    in_use: BTreeSet<u32>,
}

/// Thread-safe allocator of [`RelayPortPair`]s.
#[derive(Debug)]
pub struct RelayPortAllocator {
    base: u32,
    count: u32,
    offset: u32,
    state: Mutex<PortState>,
}

impl RelayPortAllocator {
    /// Create an allocator for `count` pairs starting at `base`.
    #[must_use]
    pub fn new(base: u32, count: u32, offset: u32) -> Self {
        Self {
            base,
            count: count.max(1),
            offset,
            state: Mutex::new(PortState {
                next: base,
                in_use: BTreeSet::new(),
            }),
        }
    }

    /// Create an allocator from configuration.
    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.port_base, config.port_count, config.helper_offset)
    }

    /// The pair belonging to a container-facing port.
    #[must_use]
    pub const fn pair_for(&self, container_port: u32) -> RelayPortPair {
        RelayPortPair {
            container_port,
            helper_port: container_port + self.offset,
        }
    }

    /// Allocate the next free pair.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::RelayPortsExhausted`] if every pair is in use.
    pub fn allocate(&self) -> SkiffResult<RelayPortPair> {
        let mut state = self.state.lock();
        for step in 0..self.count {
            let candidate = self.base + (state.next - self.base + step) % self.count;
            if state.in_use.insert(candidate) {
                state.next = self.base + (candidate - self.base + 1) % self.count;
                return Ok(self.pair_for(candidate));
            }
        }
        Err(SkiffError::RelayPortsExhausted {
            first: self.base,
            last: self.base + self.count,
        })
    }

    /// Allocate a pair that is released when the returned lease drops.
    ///
    /// # Errors
    ///
    /// Same as [`Self::allocate`].
    pub fn lease(self: &Arc<Self>) -> SkiffResult<PortLease> {
        let pair = self.allocate()?;
        Ok(PortLease {
            allocator: Arc::clone(self),
            pair,
        })
    }

    /// Return a pair to the pool. Returns `false` if it was not allocated.
    pub fn release(&self, container_port: u32) -> bool {
        self.state.lock().in_use.remove(&container_port)
    }

    /// Whether a container-facing port is currently allocated.
    #[must_use]
    pub fn is_allocated(&self, container_port: u32) -> bool {
        self.state.lock().in_use.contains(&container_port)
    }

    /// Number of pairs in use.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use.len()
    }
}

/// An allocated pair that goes back to the pool on drop.
#[derive(Debug)]
pub struct PortLease {
    allocator: Arc<RelayPortAllocator>,
    pair: RelayPortPair,
}

impl PortLease {
    /// The leased pair.
    #[must_use]
    pub const fn pair(&self) -> RelayPortPair {
        self.pair
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.release(self.pair.container_port);
        tracing::trace!(port = self.pair.container_port, "Relay port released");
    }
}
