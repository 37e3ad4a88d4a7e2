//! Command-line query runner.
//!
//! Executes a single Gremlin query against a WebSocket endpoint and prints
//! the result as pretty JSON, with the request charge on stderr.
//!
//! Usage:
//!   gremlink --endpoint wss://host:443/ --username /dbs/db/colls/graph \
//!            --password <key> "g.V().limit(10)"

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gremlink::{request_charge_string, ConnectionParams, GremlinClient, GremlinClientParams};

#[derive(Parser)]
#[command(name = "gremlink", about = "Run a Gremlin query against a WebSocket endpoint")]
struct Args {
    /// WebSocket endpoint, e.g. wss://<account>.gremlin.cosmos.azure.com:443/
    #[arg(long)]
    endpoint: String,

    /// SASL username. Cosmos endpoints expect /dbs/<db>/colls/<collection>.
    #[arg(long)]
    username: String,

    /// SASL password (account key)
    #[arg(long)]
    password: String,

    /// Cap on accumulated result items
    #[arg(long, default_value_t = gremlink::DEFAULT_MAX_RESULT_SIZE)]
    max_results: usize,

    /// Gremlin query to execute
    query: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut params = GremlinClientParams::new(ConnectionParams {
        endpoint: args.endpoint,
        username: args.username,
        password: args.password,
    });
    params.max_result_size = args.max_results;

    let mut client = GremlinClient::new(params);
    let result = client.execute(&args.query).await?;

    println!("{}", serde_json::to_string_pretty(&result.data)?);
    if result.is_truncated {
        eprintln!("note: result truncated at {} items", result.data.len());
    }
    let charge = request_charge_string(result.total_request_charge);
    if !charge.is_empty() {
        eprintln!("request charge: {charge}");
    }

    client.destroy();
    Ok(())
}
