//! Per-host connection pool: each host
//! gets a small fixed number of multiplexed connections rather than one
//! connection per in-flight request, since a single CQL connection
//! already multiplexes up to 32768 concurrent streams.

use crate::connection::{Connection, ServerEvent};
use crate::host::Host;
use crate::session::Authenticator;
use cql_protocol::ProtocolVersion;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

pub struct PoolConfig {
    pub connections_per_host: usize,
    pub protocol_version: ProtocolVersion,
    pub keyspace: Option<String>,
    pub request_timeout: Duration,
    pub heartbeat_interval: Option<Duration>,
}

/// A small round-robin set of live connections to one host, grown lazily
/// and replaced in place as connections close.
pub struct HostPool {
    host: Host,
    config: Arc<PoolConfig>,
    connections: RwLock<Vec<Connection>>,
    next: AtomicUsize,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl HostPool {
    pub fn new(host: Host, config: Arc<PoolConfig>, events: mpsc::UnboundedSender<ServerEvent>) -> HostPool {
        HostPool {
            host,
            config,
            connections: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
            events,
        }
    }

    pub async fn fill(&self, authenticator: Option<&(dyn Authenticator)>) -> Result<(), crate::error::DriverError> {
        let mut connections = self.connections.write().await;
        while connections.len() < self.config.connections_per_host {
            let conn = Connection::connect_with_options(
                &self.host,
                self.config.protocol_version,
                self.config.keyspace.as_deref(),
                authenticator,
                self.events.clone(),
                self.config.request_timeout,
                self.config.heartbeat_interval,
            )
            .await?;
            connections.push(conn);
        }
        Ok(())
    }

    /// Returns a connection to use for one request, preferring the least
    /// busy of the pool's connections, spreading load across the host's
    /// connections, and lazily dropping any that closed.
    pub async fn pick(&self) -> Option<Connection> {
        let mut connections = self.connections.write().await;
        connections.retain(|c| !c.is_closed());
        if connections.is_empty() {
            return None;
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % connections.len();
        let mut best = (start, connections[start].in_flight());
        for offset in 1..connections.len() {
            let idx = (start + offset) % connections.len();
            let in_flight = connections[idx].in_flight();
            if in_flight < best.1 {
                best = (idx, in_flight);
            }
        }
        Some(connections[best.0].clone())
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub fn host(&self) -> &Host {
        &self.host
    }
}
