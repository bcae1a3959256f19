//! The token ring and replication-strategy logic that turns a partition
//! key into a replica set. Refreshed wholesale from
//! `system.peers`/`system.local` and keyspace replication settings by the
//! control connection; readers only ever see a complete, consistent
//! snapshot via `Arc<ClusterData>` swap.

use crate::host::{Host, HostId};
use cql_protocol::{PartitionerKind, Token};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationStrategy {
    Simple { replication_factor: u32 },
    NetworkTopology { datacenter_factors: HashMap<String, u32> },
    /// Any strategy class the driver doesn't special-case; treated as
    /// `SimpleStrategy` with `replication_factor: 1` (every token maps to
    /// exactly its primary replica), which is always a safe fallback for
    /// routing purposes even if it under-estimates the true replica set.
    Unknown,
}

/// An immutable snapshot of the ring: a sorted `(token, host)` vector plus
/// the partitioner and per-keyspace replication strategies needed to turn
/// a token into a replica set.
pub struct ClusterData {
    pub partitioner: PartitionerKind,
    ring: Vec<(Token, Host)>,
    strategies: HashMap<String, ReplicationStrategy>,
}

impl ClusterData {
    pub fn new(
        partitioner: PartitionerKind,
        mut ring: Vec<(Token, Host)>,
        strategies: HashMap<String, ReplicationStrategy>,
    ) -> ClusterData {
        ring.sort_by(|a, b| a.0.cmp(&b.0));
        ClusterData {
            partitioner,
            ring,
            strategies,
        }
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.ring.iter().map(|(_, h)| h)
    }

    pub fn strategy(&self, keyspace: &str) -> &ReplicationStrategy {
        self.strategies.get(keyspace).unwrap_or(&ReplicationStrategy::Unknown)
    }

    /// The primary replica for `token`: the first host at or after it in
    /// ring order, wrapping back to the first host if `token` is beyond
    /// the last one.
    pub fn primary_replica(&self, token: &Token) -> Option<&Host> {
        if self.ring.is_empty() {
            return None;
        }
        let idx = self
            .ring
            .partition_point(|(t, _)| t < token);
        let idx = if idx == self.ring.len() { 0 } else { idx };
        Some(&self.ring[idx].1)
    }

    /// The full replica set for `token` in `keyspace`, in ring order
    /// starting from the primary replica.
    pub fn replicas_for_token(&self, keyspace: &str, token: &Token) -> Vec<Host> {
        if self.ring.is_empty() {
            return Vec::new();
        }
        let start = self
            .ring
            .partition_point(|(t, _)| t < token);
        let start = if start == self.ring.len() { 0 } else { start };

        match self.strategy(keyspace) {
            ReplicationStrategy::Simple { replication_factor } => {
                self.simple_replicas(start, *replication_factor as usize)
            }
            ReplicationStrategy::NetworkTopology { datacenter_factors } => {
                self.network_topology_replicas(start, datacenter_factors)
            }
            ReplicationStrategy::Unknown => self.simple_replicas(start, 1),
        }
    }

    fn simple_replicas(&self, start: usize, replication_factor: usize) -> Vec<Host> {
        let n = self.ring.len();
        let mut seen_hosts = std::collections::HashSet::new();
        let mut out = Vec::with_capacity(replication_factor.min(n));
        for offset in 0..n {
            if out.len() >= replication_factor {
                break;
            }
            let (_, host) = &self.ring[(start + offset) % n];
            if seen_hosts.insert(host.id()) {
                out.push(host.clone());
            }
        }
        out
    }

    fn network_topology_replicas(&self, start: usize, datacenter_factors: &HashMap<String, u32>) -> Vec<Host> {
        let n = self.ring.len();
        let mut per_dc_count: HashMap<&str, u32> = HashMap::new();
        let mut per_dc_racks_seen: HashMap<&str, std::collections::HashSet<&str>> = HashMap::new();
        let mut seen_hosts = std::collections::HashSet::new();
        let mut out = Vec::new();
        let total_needed: u32 = datacenter_factors.values().sum();

        // First pass: prefer hosts that introduce a new rack within their
        // datacenter (NetworkTopologyStrategy's rack-diversity rule).
        for pass_prefers_new_rack in [true, false] {
            if out.len() as u32 >= total_needed {
                break;
            }
            for offset in 0..n {
                if out.len() as u32 >= total_needed {
                    break;
                }
                let (_, host) = &self.ring[(start + offset) % n];
                if seen_hosts.contains(&host.id()) {
                    continue;
                }
                let Some(&wanted) = datacenter_factors.get(host.datacenter()) else {
                    continue;
                };
                let have = *per_dc_count.get(host.datacenter()).unwrap_or(&0);
                if have >= wanted {
                    continue;
                }
                let racks = per_dc_racks_seen.entry(host.datacenter()).or_default();
                let new_rack = !racks.contains(host.rack());
                if pass_prefers_new_rack && !new_rack {
                    continue;
                }
                seen_hosts.insert(host.id());
                racks.insert(host.rack());
                *per_dc_count.entry(host.datacenter()).or_insert(0) += 1;
                out.push(host.clone());
            }
        }
        out
    }
}

/// Identifies hosts by id for lookups that don't need the ring, e.g.
/// reconciling a `system.peers` refresh against already-known hosts to
/// preserve their live connection pools.
pub fn index_by_id(hosts: &[Host]) -> HashMap<HostId, Host> {
    hosts.iter().map(|h| (h.id(), h.clone())).collect()
}

pub type SharedClusterData = Arc<ClusterData>;

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{SocketAddr, SocketAddrV4, Ipv4Addr};
    use uuid::Uuid;

    fn host(id: u8, dc: &str, rack: &str) -> Host {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, id), 9042));
        Host::new(HostId(Uuid::from_u128(id as u128)), addr, dc.to_string(), rack.to_string())
    }

    #[test]
    fn primary_replica_wraps_around() {
        let ring = vec![
            (Token::Int64(-100), host(1, "dc1", "r1")),
            (Token::Int64(0), host(2, "dc1", "r1")),
            (Token::Int64(100), host(3, "dc1", "r1")),
        ];
        let data = ClusterData::new(PartitionerKind::Murmur3, ring, HashMap::new());
        assert_eq!(data.primary_replica(&Token::Int64(50)).unwrap().id(), HostId(Uuid::from_u128(3)));
        assert_eq!(data.primary_replica(&Token::Int64(200)).unwrap().id(), HostId(Uuid::from_u128(1)));
    }

    #[test]
    fn simple_strategy_replicas_wrap_and_dedup_hosts() {
        let ring = vec![
            (Token::Int64(-100), host(1, "dc1", "r1")),
            (Token::Int64(0), host(2, "dc1", "r1")),
            (Token::Int64(100), host(3, "dc1", "r1")),
        ];
        let mut strategies = HashMap::new();
        strategies.insert(
            "ks".to_string(),
            ReplicationStrategy::Simple { replication_factor: 2 },
        );
        let data = ClusterData::new(PartitionerKind::Murmur3, ring, strategies);
        let replicas = data.replicas_for_token("ks", &Token::Int64(150));
        assert_eq!(replicas.len(), 2);
        assert_eq!(replicas[0].id(), HostId(Uuid::from_u128(1)));
        assert_eq!(replicas[1].id(), HostId(Uuid::from_u128(2)));
    }

    #[test]
    fn network_topology_spreads_across_racks() {
        let ring = vec![
            (Token::Int64(0), host(1, "dc1", "r1")),
            (Token::Int64(10), host(2, "dc1", "r1")),
            (Token::Int64(20), host(3, "dc1", "r2")),
        ];
        let mut factors = HashMap::new();
        factors.insert("dc1".to_string(), 2);
        let mut strategies = HashMap::new();
        strategies.insert("ks".to_string(), ReplicationStrategy::NetworkTopology { datacenter_factors: factors });
        let data = ClusterData::new(PartitionerKind::Murmur3, ring, strategies);
        let replicas = data.replicas_for_token("ks", &Token::Int64(5));
        assert_eq!(replicas.len(), 2);
        // host 2 (same rack r1 as the primary) is skipped in favor of
        // host 3 (rack r2) in the rack-diversity first pass.
        assert_eq!(replicas[1].rack(), "r2");
    }
}
