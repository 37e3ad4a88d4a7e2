//! Connection and client parameters

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound on accumulated result items per query.
///
/// Once a query's accumulator reaches this many items, any excess from
/// further response frames is discarded and the result is flagged truncated.
pub const DEFAULT_MAX_RESULT_SIZE: usize = 10_000;

/// How long a dispatched query may wait for a terminal response before the
/// client abandons it and rejects the caller with a timeout error.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(6 * 60);

/// Where to connect and how to authenticate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// WebSocket endpoint, e.g. `wss://<account>.gremlin.cosmos.azure.com:443/`
    pub endpoint: String,
    /// SASL username. Cosmos-style endpoints expect `/dbs/<db>/colls/<coll>`.
    pub username: String,
    /// SASL password (account key).
    pub password: String,
}

/// Full client configuration: connection target plus accumulation limits.
#[derive(Debug, Clone)]
pub struct GremlinClientParams {
    pub connection: ConnectionParams,
    /// See [`DEFAULT_MAX_RESULT_SIZE`].
    pub max_result_size: usize,
    /// See [`DEFAULT_QUERY_TIMEOUT`].
    pub query_timeout: Duration,
}

impl GremlinClientParams {
    pub fn new(connection: ConnectionParams) -> Self {
        Self {
            connection,
            max_result_size: DEFAULT_MAX_RESULT_SIZE,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}
