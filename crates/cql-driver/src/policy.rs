//! Host-selection policies: each produces an iteration order
//! over candidate hosts for a given statement. The executor walks the
//! order, skipping down hosts, until one attempt succeeds or the list is
//! exhausted.

use crate::host::Host;
use crate::statement::BoundStatement;
use crate::topology::SharedClusterData;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Produces the ordered candidate list for one request. Implementations
/// must be cheap to call repeatedly (once per request) and safe to share
/// across connections via `&self`.
pub trait LoadBalancingPolicy: Send + Sync {
    fn plan(&self, statement: Option<&BoundStatement>, cluster: &SharedClusterData) -> Vec<Host>;
}

/// Plain round-robin over every host the cluster snapshot currently knows
/// about, regardless of datacenter.
pub struct RoundRobinPolicy {
    counter: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> RoundRobinPolicy {
        RoundRobinPolicy { counter: AtomicUsize::new(0) }
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn plan(&self, _statement: Option<&BoundStatement>, cluster: &SharedClusterData) -> Vec<Host> {
        let mut hosts: Vec<Host> = cluster.hosts().filter(|h| h.is_up()).cloned().collect();
        if hosts.is_empty() {
            return hosts;
        }
        let start = self.counter.fetch_add(1, Ordering::Relaxed) % hosts.len();
        hosts.rotate_left(start);
        hosts
    }
}

/// Prefers hosts in `local_dc`, falling back to the rest of the cluster
/// only once the local datacenter is exhausted.
pub struct DcAwareRoundRobinPolicy {
    local_dc: String,
    counter: AtomicUsize,
}

impl DcAwareRoundRobinPolicy {
    pub fn new(local_dc: impl Into<String>) -> DcAwareRoundRobinPolicy {
        DcAwareRoundRobinPolicy {
            local_dc: local_dc.into(),
            counter: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancingPolicy for DcAwareRoundRobinPolicy {
    fn plan(&self, _statement: Option<&BoundStatement>, cluster: &SharedClusterData) -> Vec<Host> {
        let mut local: Vec<Host> = Vec::new();
        let mut remote: Vec<Host> = Vec::new();
        for host in cluster.hosts().filter(|h| h.is_up()) {
            if host.datacenter() == self.local_dc {
                local.push(host.clone());
            } else {
                remote.push(host.clone());
            }
        }
        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        if !local.is_empty() {
            local.rotate_left(start % local.len());
        }
        if !remote.is_empty() {
            remote.rotate_left(start % remote.len());
        }
        local.extend(remote);
        local
    }
}

/// Like [`DcAwareRoundRobinPolicy`], but within the local datacenter also
/// prefers the local rack before other racks in that datacenter.
pub struct RackAwareRoundRobinPolicy {
    local_dc: String,
    local_rack: String,
    counter: AtomicUsize,
}

impl RackAwareRoundRobinPolicy {
    pub fn new(local_dc: impl Into<String>, local_rack: impl Into<String>) -> RackAwareRoundRobinPolicy {
        RackAwareRoundRobinPolicy {
            local_dc: local_dc.into(),
            local_rack: local_rack.into(),
            counter: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancingPolicy for RackAwareRoundRobinPolicy {
    fn plan(&self, _statement: Option<&BoundStatement>, cluster: &SharedClusterData) -> Vec<Host> {
        let mut local_rack: Vec<Host> = Vec::new();
        let mut local_dc: Vec<Host> = Vec::new();
        let mut remote: Vec<Host> = Vec::new();
        for host in cluster.hosts().filter(|h| h.is_up()) {
            if host.datacenter() == self.local_dc && host.rack() == self.local_rack {
                local_rack.push(host.clone());
            } else if host.datacenter() == self.local_dc {
                local_dc.push(host.clone());
            } else {
                remote.push(host.clone());
            }
        }
        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        for group in [&mut local_rack, &mut local_dc, &mut remote] {
            if !group.is_empty() {
                let len = group.len();
                group.rotate_left(start % len);
            }
        }
        local_rack.extend(local_dc);
        local_rack.extend(remote);
        local_rack
    }
}

/// Wraps a delegate policy: when the request carries a routing key, the
/// token's replica set is shuffled and placed first, with the delegate's
/// full plan appended (deduplicated) as the fallback order.
/// Falls back to the delegate's plan unchanged when there is no routing
/// key (a non-prepared statement, or a prepared statement with no
/// partition-key columns bound).
pub struct TokenAwarePolicy<P> {
    delegate: P,
    keyspace: String,
}

impl<P: LoadBalancingPolicy> TokenAwarePolicy<P> {
    pub fn new(delegate: P, keyspace: impl Into<String>) -> TokenAwarePolicy<P> {
        TokenAwarePolicy { delegate, keyspace: keyspace.into() }
    }
}

impl<P: LoadBalancingPolicy> LoadBalancingPolicy for TokenAwarePolicy<P> {
    fn plan(&self, statement: Option<&BoundStatement>, cluster: &SharedClusterData) -> Vec<Host> {
        let delegate_plan = self.delegate.plan(statement, cluster);

        let Some(statement) = statement else {
            return delegate_plan;
        };
        let Some(routing_key) = statement.routing_key() else {
            return delegate_plan;
        };

        let token = cluster.partitioner.token_for(&routing_key);
        let mut replicas = cluster.replicas_for_token(&self.keyspace, &token);
        replicas.retain(|h| h.is_up());
        replicas.shuffle(&mut rand::thread_rng());

        let mut seen: std::collections::HashSet<_> = replicas.iter().map(|h| h.id()).collect();
        let mut plan = replicas;
        for host in delegate_plan {
            if seen.insert(host.id()) {
                plan.push(host);
            }
        }
        plan
    }
}

/// Picks a uniformly random permutation each call; useful mostly for
/// tests that want to exercise every host without round-robin's
/// determinism.
pub struct RandomPolicy;

impl LoadBalancingPolicy for RandomPolicy {
    fn plan(&self, _statement: Option<&BoundStatement>, cluster: &SharedClusterData) -> Vec<Host> {
        let mut hosts: Vec<Host> = cluster.hosts().filter(|h| h.is_up()).cloned().collect();
        hosts.shuffle(&mut rand::thread_rng());
        hosts
    }
}

/// Jittered delay before firing a speculative second attempt: uniform in
/// `[base, base * 2)` so many concurrently-started requests
/// don't all speculate at exactly the same instant.
pub fn jittered_speculative_delay(base: std::time::Duration) -> std::time::Duration {
    let jitter: f64 = rand::thread_rng().gen_range(1.0..2.0);
    base.mul_f64(jitter)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::HostId;
    use crate::topology::{ClusterData, ReplicationStrategy};
    use cql_protocol::{PartitionerKind, Token};
    use std::collections::HashMap;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use uuid::Uuid;

    fn host(id: u8, dc: &str) -> Host {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, id), 9042));
        Host::new(HostId(Uuid::from_u128(id as u128)), addr, dc.to_string(), "rack1".to_string())
    }

    fn cluster(hosts: Vec<Host>) -> SharedClusterData {
        let ring: Vec<_> = hosts
            .into_iter()
            .enumerate()
            .map(|(i, h)| (Token::Int64(i as i64 * 100), h))
            .collect();
        std::sync::Arc::new(ClusterData::new(PartitionerKind::Murmur3, ring, HashMap::new()))
    }

    #[test]
    fn round_robin_rotates_across_calls() {
        let policy = RoundRobinPolicy::new();
        let c = cluster(vec![host(1, "dc1"), host(2, "dc1"), host(3, "dc1")]);
        let first = policy.plan(None, &c);
        let second = policy.plan(None, &c);
        assert_ne!(first[0].id(), second[0].id());
    }

    #[test]
    fn dc_aware_prefers_local_dc() {
        let policy = DcAwareRoundRobinPolicy::new("dc1");
        let c = cluster(vec![host(1, "dc2"), host(2, "dc1"), host(3, "dc1")]);
        let plan = policy.plan(None, &c);
        assert_eq!(plan[0].datacenter(), "dc1");
        assert_eq!(plan[1].datacenter(), "dc1");
        assert_eq!(plan[2].datacenter(), "dc2");
    }

    #[test]
    fn dead_hosts_are_excluded() {
        let policy = RoundRobinPolicy::new();
        let down = host(1, "dc1");
        down.set_state(crate::host::HostState::Down);
        let c = cluster(vec![down, host(2, "dc1")]);
        let plan = policy.plan(None, &c);
        assert_eq!(plan.len(), 1);
    }
}
