//! `clap`-derived CLI surface mapping 1:1 onto [`crate::config::SessionConfig`],
//! so every option settable in config is also settable as a flag or
//! environment variable. This driver has no `main` of its own —
//! `ClientArgs` exists for binaries and test harnesses built on top of it.

use crate::config::{Compressor, SessionConfig};
use clap::Parser;
use cql_protocol::Consistency;
use std::time::Duration;

#[derive(Debug, Parser, Clone)]
#[command(name = "cql-client", about = "Connect to a CQL cluster and run a statement.")]
pub struct ClientArgs {
    /// Comma-separated contact points, e.g. `10.0.0.1,10.0.0.2`.
    #[arg(long, env = "CQL_HOSTS", value_delimiter = ',')]
    pub hosts: Vec<String>,

    #[arg(long, env = "CQL_PORT", default_value_t = 9042)]
    pub port: u16,

    #[arg(long, env = "CQL_KEYSPACE")]
    pub keyspace: Option<String>,

    #[arg(long, env = "CQL_NUM_CONNS_PER_HOST", default_value_t = 2)]
    pub num_conns_per_host: usize,

    /// `0` auto-negotiates the highest protocol version the cluster
    /// supports.
    #[arg(long, env = "CQL_PROTO_VERSION", default_value_t = 0)]
    pub proto_version: u8,

    #[arg(long, env = "CQL_CONSISTENCY", default_value = "local_quorum", value_parser = parse_consistency)]
    pub consistency: Consistency,

    #[arg(long, env = "CQL_TIMEOUT", default_value = "12s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    #[arg(long, env = "CQL_CONNECT_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    pub connect_timeout: Duration,

    #[arg(long, env = "CQL_RECONNECT_INTERVAL", default_value = "1s", value_parser = humantime::parse_duration)]
    pub reconnect_interval: Duration,

    /// `0s` disables heartbeating entirely.
    #[arg(long, env = "CQL_HEARTBEAT_INTERVAL", default_value = "30s", value_parser = humantime::parse_duration)]
    pub heartbeat_interval: Duration,

    #[arg(long, env = "CQL_MAX_PREPARED_STMTS", default_value_t = 5_000)]
    pub max_prepared_stmts: usize,

    #[arg(long, env = "CQL_COMPRESSOR", default_value = "nil", value_parser = parse_compressor)]
    pub compressor: Compressor,

    #[arg(long, env = "CQL_LOCAL_DC")]
    pub local_dc: Option<String>,

    #[arg(long, env = "CQL_DISABLE_SCHEMA_EVENTS", default_value_t = false)]
    pub disable_schema_events: bool,
}

fn parse_consistency(s: &str) -> Result<Consistency, String> {
    match s.to_ascii_lowercase().as_str() {
        "any" => Ok(Consistency::Any),
        "one" => Ok(Consistency::One),
        "two" => Ok(Consistency::Two),
        "three" => Ok(Consistency::Three),
        "quorum" => Ok(Consistency::Quorum),
        "all" => Ok(Consistency::All),
        "local_quorum" | "localquorum" => Ok(Consistency::LocalQuorum),
        "each_quorum" | "eachquorum" => Ok(Consistency::EachQuorum),
        "local_one" | "localone" => Ok(Consistency::LocalOne),
        other => Err(format!("unrecognized consistency level `{other}`")),
    }
}

fn parse_compressor(s: &str) -> Result<Compressor, String> {
    match s.to_ascii_lowercase().as_str() {
        "nil" | "none" => Ok(Compressor::Nil),
        "lz4" => Ok(Compressor::Lz4),
        "snappy" => Ok(Compressor::Snappy),
        other => Err(format!("unrecognized compressor `{other}`")),
    }
}

impl From<ClientArgs> for SessionConfig {
    fn from(args: ClientArgs) -> SessionConfig {
        SessionConfig {
            hosts: args.hosts,
            port: args.port,
            keyspace: args.keyspace,
            num_conns_per_host: args.num_conns_per_host,
            proto_version: args.proto_version,
            consistency: args.consistency,
            timeout: args.timeout,
            connect_timeout: args.connect_timeout,
            reconnect_interval: args.reconnect_interval,
            heartbeat_interval: if args.heartbeat_interval.is_zero() { None } else { Some(args.heartbeat_interval) },
            max_prepared_stmts: args.max_prepared_stmts,
            compressor: args.compressor,
            local_dc: args.local_dc,
            disable_schema_events: args.disable_schema_events,
            ..SessionConfig::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn maps_onto_session_config() {
        let args = ClientArgs::parse_from([
            "cql-client",
            "--hosts",
            "10.0.0.1,10.0.0.2",
            "--keyspace",
            "system",
            "--consistency",
            "quorum",
        ]);
        let cfg: SessionConfig = args.into();
        assert_eq!(cfg.hosts, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(cfg.keyspace.as_deref(), Some("system"));
        assert_eq!(cfg.consistency, Consistency::Quorum);
    }

    #[test]
    fn defaults_match_session_config_defaults() {
        let args = ClientArgs::parse_from(["cql-client"]);
        assert_eq!(args.port, SessionConfig::default().port);
        assert_eq!(args.proto_version, 0);
    }
}
