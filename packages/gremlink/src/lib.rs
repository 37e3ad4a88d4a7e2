//! gremlink — real-time Gremlin query client over WebSocket.
//!
//! Two cooperating layers:
//!
//! | Module       | Responsibility                                          |
//! |--------------|---------------------------------------------------------|
//! | `protocol`   | Wire types, MIME-prefixed frame codec, status codes     |
//! | `connection` | Socket lifecycle and status-driven response dispatch    |
//! | `client`     | Request correlation, accumulation, charges, timeouts    |
//! | `config`     | Endpoint, credentials and client limits                 |
//! | `error`      | Failure taxonomy shared by both layers                  |
//!
//! The connection layer owns exactly one WebSocket and reports everything
//! through callbacks; the client layer turns those callbacks into one future
//! per executed query, with bounded result accumulation and per-request
//! timeouts. Multiple queries can be in flight concurrently; responses are
//! routed purely by request id.
//!
//! # Example
//!
//! ```no_run
//! use gremlink::{ConnectionParams, GremlinClient, GremlinClientParams};
//!
//! # #[tokio::main]
//! # async fn main() -> gremlink::Result<()> {
//! let params = GremlinClientParams::new(ConnectionParams {
//!     endpoint: "wss://example.gremlin.cosmos.azure.com:443/".to_string(),
//!     username: "/dbs/db1/colls/graph1".to_string(),
//!     password: "<account-key>".to_string(),
//! });
//! let mut client = GremlinClient::new(params);
//!
//! let result = client.execute("g.V().count()").await?;
//! println!(
//!     "{} items {}",
//!     result.data.len(),
//!     gremlink::request_charge_string(result.total_request_charge)
//! );
//!
//! client.destroy();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;

pub use client::{
    request_charge_string, GremlinClient, GremlinQueryResult, NotificationSink, Severity,
};
pub use config::{
    ConnectionParams, GremlinClientParams, DEFAULT_MAX_RESULT_SIZE, DEFAULT_QUERY_TIMEOUT,
};
pub use connection::{ConnectionHandlers, ConnectionState, GremlinConnection, QueryUpdate};
pub use error::{GremlinError, Result};
