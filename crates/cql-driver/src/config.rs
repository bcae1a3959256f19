//! Session configuration. A plain, serde-derived
//! struct rather than a builder, paired one-to-one with a [`crate::cli`]
//! layer so every option is settable from a config file or from the
//! command line without duplicating field definitions.

use crate::policy::{DcAwareRoundRobinPolicy, LoadBalancingPolicy, RoundRobinPolicy, TokenAwarePolicy};
use crate::retry::{DefaultRetryPolicy, Retry};
use crate::speculative::SpeculativeExecutionPolicy;
use cql_protocol::Consistency;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Compression negotiated at STARTUP. `Snappy` is rejected by
/// the driver itself when the negotiated protocol version is 5, since
/// v5 dropped Snappy support, rather than leaving that validation to the
/// server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compressor {
    Nil,
    Lz4,
    Snappy,
}

/// Everything a [`crate::session::Session`] needs to bootstrap and run.
/// Every field that has an obvious
/// default is `Default`-derivable via [`SessionConfig::default`]; callers
/// typically only set `hosts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Initial contact points; resolved and connected to during
    /// `Session::connect`, after which topology discovery takes over.
    pub hosts: Vec<String>,
    /// Default native-protocol port for any host address given without
    /// one.
    pub port: u16,
    /// Keyspace to `USE` on every new connection, if any.
    pub keyspace: Option<String>,
    /// Connections opened per discovered host: a small
    /// number of multiplexed connections per host, not one per request.
    pub num_conns_per_host: usize,
    /// Protocol version to request at STARTUP; `0` auto-negotiates by
    /// trying the highest supported version first and falling back on a
    /// protocol-mismatch error.
    pub proto_version: u8,
    pub consistency: Consistency,
    pub serial_consistency: Option<cql_protocol::SerialConsistency>,
    /// Deadline applied to every request awaiting its response.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Delay between reconnect attempts to a host the pool has marked
    /// `Down`.
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
    /// How long a connection may sit idle before an OPTIONS frame is sent
    /// to keep it alive. `None` disables heartbeating.
    #[serde(with = "humantime_serde::option")]
    pub heartbeat_interval: Option<Duration>,
    /// Bound on the prepared-statement LRU.
    pub max_prepared_stmts: usize,
    /// Bound on the routing-key-info cache. Routing info (`pk_indices`)
    /// is carried as part of each prepared statement's cached metadata
    /// rather than in a separate map, so this currently shares
    /// `max_prepared_stmts`'s bound; the field is kept distinct so a
    /// config file written against this option continues to round-trip.
    pub max_routing_key_info: usize,
    pub compressor: Compressor,
    /// Local datacenter used by the default DC-aware policy; ignored if
    /// a custom `host_selection_policy` is supplied programmatically.
    pub local_dc: Option<String>,
    /// Skip the REGISTER for schema-change events, e.g. for a read-only
    /// analytics client that doesn't care about schema drift.
    pub disable_schema_events: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            hosts: Vec::new(),
            port: 9042,
            keyspace: None,
            num_conns_per_host: 2,
            proto_version: 0,
            consistency: Consistency::LocalQuorum,
            serial_consistency: None,
            timeout: Duration::from_secs(12),
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(1),
            heartbeat_interval: Some(Duration::from_secs(30)),
            max_prepared_stmts: 5_000,
            max_routing_key_info: 5_000,
            compressor: Compressor::Nil,
            local_dc: None,
            disable_schema_events: false,
        }
    }
}

impl SessionConfig {
    /// Builds the default load-balancing policy implied by this config: a
    /// token-aware wrapper around DC-aware round-robin when `local_dc` is
    /// set, or plain round-robin otherwise.
    pub fn default_policy(&self, keyspace: impl Into<String>) -> Arc<dyn LoadBalancingPolicy> {
        match &self.local_dc {
            Some(dc) => Arc::new(TokenAwarePolicy::new(DcAwareRoundRobinPolicy::new(dc.clone()), keyspace)),
            None => Arc::new(TokenAwarePolicy::new(RoundRobinPolicy::new(), keyspace)),
        }
    }

    pub fn default_retry_policy(&self) -> impl Retry {
        DefaultRetryPolicy::default()
    }

    pub fn default_speculative_policy(&self) -> SpeculativeExecutionPolicy {
        SpeculativeExecutionPolicy::Disabled
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.port, 9042);
        assert_eq!(cfg.num_conns_per_host, 2);
        assert_eq!(cfg.proto_version, 0, "0 means auto-detect the highest supported protocol version");
    }

    #[test]
    fn serializes_round_trip_through_json() {
        let cfg = SessionConfig {
            hosts: vec!["10.0.0.1".into()],
            local_dc: Some("dc1".into()),
            ..SessionConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hosts, cfg.hosts);
        assert_eq!(back.local_dc, cfg.local_dc);
    }
}
