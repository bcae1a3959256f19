//! Client driver for the wide-column cluster's native protocol: connection
//! multiplexing, topology and token-ring tracking, prepared-statement
//! caching, host selection, and retry/speculative execution on top of
//! [`cql_protocol`]'s wire codec.

pub mod cli;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod executor;
pub mod host;
pub mod metadata;
pub mod page;
pub mod policy;
pub mod pool;
pub mod prepared_cache;
pub mod retry;
pub mod session;
pub mod speculative;
pub mod statement;
pub mod stream_id;
pub mod topology;

pub use cli::ClientArgs;
pub use config::{Compressor, SessionConfig};
pub use connection::{Connection, ServerEvent};
pub use error::{DriverError, ServerError};
pub use executor::{ExecResult, Executor};
pub use host::{Host, HostId, HostState};
pub use metadata::{ColumnSpec, Row, RowsMetadata, RowsResult};
pub use page::{rows_stream, Paginator};
pub use policy::{DcAwareRoundRobinPolicy, LoadBalancingPolicy, RackAwareRoundRobinPolicy, RandomPolicy, RoundRobinPolicy, TokenAwarePolicy};
pub use pool::{HostPool, PoolConfig};
pub use prepared_cache::PreparedCache;
pub use retry::{DefaultRetryPolicy, NoRetry, Retry, RetryDecision};
pub use session::{Authenticator, PasswordAuthenticator, Session};
pub use speculative::SpeculativeExecutionPolicy;
pub use statement::{Batch, BatchStatement, BatchType, BoundStatement, ExecutionParams, PreparedStatement, Statement};
pub use topology::{ClusterData, ReplicationStrategy, SharedClusterData};
