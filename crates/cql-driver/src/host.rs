//! A `Host` is a cluster member as the driver sees it: an address plus the
//! location and state metadata the topology layer and host-selection
//! policies need.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Opaque identity for a cluster member, stable across rolling IP changes,
/// taken from the `host_id` system-table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(pub Uuid);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HostState {
    Up = 0,
    Down = 1,
    /// Removed from the ring by a topology refresh but not yet evicted
    /// from the pool, so in-flight requests can drain.
    Ignored = 2,
}

impl HostState {
    fn from_u8(v: u8) -> HostState {
        match v {
            0 => HostState::Up,
            1 => HostState::Down,
            _ => HostState::Ignored,
        }
    }
}

/// A cluster member. `Host`s are cheap to clone (an `Arc` around shared,
/// atomically-updated state) so policies and pools can each hold their own
/// copy without coordinating a central registry.
#[derive(Clone)]
pub struct Host {
    inner: Arc<Inner>,
}

struct Inner {
    id: HostId,
    rpc_address: SocketAddr,
    datacenter: String,
    rack: String,
    state: AtomicU8,
}

impl Host {
    pub fn new(id: HostId, rpc_address: SocketAddr, datacenter: String, rack: String) -> Host {
        Host {
            inner: Arc::new(Inner {
                id,
                rpc_address,
                datacenter,
                rack,
                state: AtomicU8::new(HostState::Up as u8),
            }),
        }
    }

    pub fn id(&self) -> HostId {
        self.inner.id
    }

    pub fn rpc_address(&self) -> SocketAddr {
        self.inner.rpc_address
    }

    pub fn datacenter(&self) -> &str {
        &self.inner.datacenter
    }

    pub fn rack(&self) -> &str {
        &self.inner.rack
    }

    pub fn state(&self) -> HostState {
        HostState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: HostState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    pub fn is_up(&self) -> bool {
        self.state() == HostState::Up
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.inner.id)
            .field("rpc_address", &self.inner.rpc_address)
            .field("datacenter", &self.inner.datacenter)
            .field("rack", &self.inner.rack)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}
impl Eq for Host {}

impl std::hash::Hash for Host {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}
