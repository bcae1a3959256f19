//! Bootstrap and lifecycle wiring. `Session` is the sole
//! owner of the [`Executor`], the per-host [`HostPool`]s, and the
//! [`ControlConnection`]; nothing downstream holds a strong reference
//! back to it, so there is no ownership cycle to break with a weak
//! pointer, realized here by simply never handing out `Arc<Session>`
//! to the types it owns.

use crate::config::SessionConfig;
use crate::control::ControlConnection;
use crate::error::DriverError;
use crate::executor::{ExecResult, Executor};
use crate::host::{Host, HostId};
use crate::pool::{HostPool, PoolConfig};
use crate::prepared_cache::PreparedCache;
use crate::retry::{NoRetry, Retry};
use crate::statement::{Batch, BoundStatement, PreparedStatement, Statement};
use crate::topology::ClusterData;
use cql_protocol::{PartitionerKind, ProtocolVersion};
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// SASL exchange provider: authentication is an external collaborator;
/// only the opaque byte exchange over AUTH_RESPONSE/AUTH_CHALLENGE lives
/// in the core.
pub trait Authenticator: Send + Sync {
    fn initial_response(&self) -> Vec<u8>;
    fn evaluate_challenge(&self, challenge: &[u8]) -> Vec<u8>;
}

/// `org.apache.cassandra.auth.PasswordAuthenticator`'s SASL PLAIN
/// mechanism: a single `\0username\0password` response with no further
/// challenge round-trip.
pub struct PasswordAuthenticator {
    username: String,
    password: String,
}

impl PasswordAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> PasswordAuthenticator {
        PasswordAuthenticator { username: username.into(), password: password.into() }
    }
}

impl Authenticator for PasswordAuthenticator {
    fn initial_response(&self) -> Vec<u8> {
        let mut token = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        token.push(0);
        token.extend_from_slice(self.username.as_bytes());
        token.push(0);
        token.extend_from_slice(self.password.as_bytes());
        token
    }

    fn evaluate_challenge(&self, _challenge: &[u8]) -> Vec<u8> {
        Vec::new()
    }
}

/// A live session against the cluster: the discovered topology, one
/// connection pool per live host, the prepared-statement cache, and the
/// control connection's background event loop.
pub struct Session {
    executor: Arc<Executor>,
    config: SessionConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    protocol_version: ProtocolVersion,
    control: Arc<AsyncMutex<ControlConnection>>,
    event_task: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

impl Session {
    /// Resolves `config.hosts`, opens a control connection to the first
    /// reachable contact point, performs the initial metadata refresh,
    /// opens pools to every discovered host, and starts the background
    /// event loop that keeps topology and schema in sync.
    pub async fn connect(
        config: SessionConfig,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Result<Session, DriverError> {
        if config.hosts.is_empty() {
            return Err(DriverError::Configuration("at least one contact point is required".to_string()));
        }

        let contact_points = resolve_contact_points(&config)?;
        let keyspace = config.keyspace.clone().unwrap_or_default();

        let executor = Arc::new(Executor {
            pools: RwLock::new(Arc::new(HashMap::new())),
            cluster: RwLock::new(Arc::new(ClusterData::new(PartitionerKind::Murmur3, Vec::new(), HashMap::new()))),
            policy: config.default_policy(keyspace),
            prepared: PreparedCache::new(config.max_prepared_stmts),
            speculative: config.default_speculative_policy(),
            default_keyspace: StdMutex::new(config.keyspace.clone()),
        });

        let (protocol_version, control) =
            open_control_connection(&contact_points, &config, authenticator.as_deref()).await?;

        let snapshot = control.refresh().await?;
        executor.swap_cluster(Arc::new(snapshot.into_cluster_data()));
        let hosts = cluster_hosts(&executor);
        let pools = build_pools(&hosts, &config, protocol_version, authenticator.as_deref()).await?;
        executor.swap_pools(Arc::new(pools));

        let control = Arc::new(AsyncMutex::new(control));
        let shutdown = Arc::new(AtomicBool::new(false));
        let event_task = spawn_event_loop(
            executor.clone(),
            control.clone(),
            config.clone(),
            authenticator.clone(),
            protocol_version,
            shutdown.clone(),
        );

        Ok(Session {
            executor,
            config,
            authenticator,
            protocol_version,
            control,
            event_task,
            shutdown,
        })
    }

    pub async fn execute(&self, statement: &Statement) -> Result<ExecResult, DriverError> {
        self.executor.execute_statement(statement, self.config.default_retry_policy()).await
    }

    pub async fn execute_with_retry(&self, statement: &Statement, retry: impl Retry) -> Result<ExecResult, DriverError> {
        self.executor.execute_statement(statement, retry).await
    }

    pub async fn prepare(&self, text: impl Into<Arc<str>>) -> Result<PreparedStatement, DriverError> {
        self.executor.prepare(text.into()).await
    }

    pub async fn execute_bound(&self, bound: &BoundStatement) -> Result<ExecResult, DriverError> {
        self.executor.execute_bound(bound, self.config.default_retry_policy()).await
    }

    pub async fn execute_bound_with_retry(&self, bound: &BoundStatement, retry: impl Retry) -> Result<ExecResult, DriverError> {
        self.executor.execute_bound(bound, retry).await
    }

    pub async fn execute_batch(&self, batch: &Batch) -> Result<(), DriverError> {
        self.executor.execute_batch(batch, NoRetry).await
    }

    /// Forces an out-of-band metadata refresh, e.g. after a schema change
    /// made through a different session. Normally unnecessary: the
    /// control connection's event loop keeps topology current on its own.
    pub async fn refresh_metadata(&self) -> Result<(), DriverError> {
        let snapshot = self.control.lock().await.refresh().await?;
        self.executor.swap_cluster(Arc::new(snapshot.into_cluster_data()));
        let hosts = cluster_hosts(&self.executor);
        let pools = build_pools(&hosts, &self.config, self.protocol_version, self.authenticator.as_deref()).await?;
        self.executor.swap_pools(Arc::new(pools));
        Ok(())
    }
}

fn cluster_hosts(executor: &Executor) -> Vec<Host> {
    executor.cluster.read().unwrap().hosts().cloned().collect()
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.event_task.abort();
    }
}

fn resolve_contact_points(config: &SessionConfig) -> Result<Vec<SocketAddr>, DriverError> {
    let mut addrs = Vec::new();
    for host in &config.hosts {
        let with_port = if host.contains(':') { host.clone() } else { format!("{host}:{}", config.port) };
        let resolved = with_port
            .to_socket_addrs()
            .map_err(|e| DriverError::Configuration(format!("failed to resolve contact point `{host}`: {e}")))?;
        addrs.extend(resolved);
    }
    if addrs.is_empty() {
        return Err(DriverError::Configuration("no contact points resolved to a usable address".to_string()));
    }
    Ok(addrs)
}

/// Tries each contact point against each candidate protocol version
/// (newest first when `proto_version == 0`), and
/// keeps the first connection that completes both STARTUP and the
/// REGISTER handshake.
async fn open_control_connection(
    contact_points: &[SocketAddr],
    config: &SessionConfig,
    authenticator: Option<&(dyn Authenticator)>,
) -> Result<(ProtocolVersion, ControlConnection), DriverError> {
    let candidate_versions = if config.proto_version == 0 {
        vec![ProtocolVersion::V5, ProtocolVersion::V4, ProtocolVersion::V3]
    } else {
        let v = ProtocolVersion::from_u8(config.proto_version)
            .ok_or_else(|| DriverError::Configuration(format!("unsupported protocol version {}", config.proto_version)))?;
        vec![v]
    };

    let mut last_err = None;
    for version in candidate_versions {
        for addr in contact_points {
            let placeholder = Host::new(HostId(Uuid::nil()), *addr, String::new(), String::new());
            match ControlConnection::open(
                &placeholder,
                version,
                authenticator,
                config.disable_schema_events,
                config.timeout,
                config.heartbeat_interval,
            )
            .await
            {
                Ok(control) => return Ok((version, control)),
                Err(e) => last_err = Some(e),
            }
        }
    }
    Err(last_err.unwrap_or(DriverError::NoHostAvailable))
}

async fn build_pools(
    hosts: &[Host],
    config: &SessionConfig,
    protocol_version: ProtocolVersion,
    authenticator: Option<&(dyn Authenticator)>,
) -> Result<HashMap<HostId, Arc<HostPool>>, DriverError> {
    let pool_config = Arc::new(PoolConfig {
        connections_per_host: config.num_conns_per_host,
        protocol_version,
        keyspace: config.keyspace.clone(),
        request_timeout: config.timeout,
        heartbeat_interval: config.heartbeat_interval,
    });

    let mut pools = HashMap::with_capacity(hosts.len());
    for host in hosts {
        if !host.is_up() {
            continue;
        }
        let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
        let pool = Arc::new(HostPool::new(host.clone(), pool_config.clone(), events_tx));
        if pool.fill(authenticator).await.is_ok() {
            pools.insert(host.id(), pool);
        }
        // A host that fails to accept any connections is simply left out
        // of the pool map; the next control-connection-driven refresh (or
        // the reconnect policy, once a host is marked Down) will retry it.
    }
    Ok(pools)
}

/// Background task owning the control connection's event stream for the
/// lifetime of the `Session`: every pushed event triggers a full metadata
/// refresh. Processing one event fully before pulling the
/// next off the channel is what gives a "topology change before status
/// change" ordering guarantee, since both kinds share the same queue.
fn spawn_event_loop(
    executor: Arc<Executor>,
    control: Arc<AsyncMutex<ControlConnection>>,
    config: SessionConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    protocol_version: ProtocolVersion,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            let event = {
                let mut guard = control.lock().await;
                guard.next_event().await
            };
            let Some(event) = event else {
                tracing::warn!("control connection's event channel closed; metadata will no longer refresh");
                return;
            };
            let kind = crate::control::peek_event_type(&event.body).unwrap_or_else(|| "UNKNOWN".to_string());
            tracing::info!(event.kind = %kind, "received cluster event");

            let refreshed = {
                let guard = control.lock().await;
                guard.refresh().await
            };
            match refreshed {
                Ok(snapshot) => {
                    executor.swap_cluster(Arc::new(snapshot.into_cluster_data()));
                    let hosts = cluster_hosts(&executor);
                    match build_pools(&hosts, &config, protocol_version, authenticator.as_deref()).await {
                        Ok(pools) => executor.swap_pools(Arc::new(pools)),
                        Err(e) => tracing::warn!(error = %e, "failed to rebuild connection pools after refresh"),
                    }
                }
                Err(e) => tracing::warn!(error = %e, "metadata refresh failed"),
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn password_authenticator_formats_plain_token() {
        let auth = PasswordAuthenticator::new("alice", "s3cret");
        let token = auth.initial_response();
        assert_eq!(token, b"\0alice\0s3cret".to_vec());
    }

    #[test]
    fn resolve_contact_points_requires_at_least_one_host() {
        let config = SessionConfig::default();
        let err = resolve_contact_points(&config);
        assert!(err.is_err());
    }

    #[test]
    fn resolve_contact_points_applies_default_port() {
        let config = SessionConfig { hosts: vec!["127.0.0.1".to_string()], port: 9042, ..SessionConfig::default() };
        let addrs = resolve_contact_points(&config).unwrap();
        assert_eq!(addrs[0].port(), 9042);
    }
}
