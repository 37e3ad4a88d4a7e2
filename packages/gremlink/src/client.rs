//! Query execution client: request correlation, result accumulation and
//! timeouts.
//!
//! Presents a single-result-per-call interface over the callback-based
//! [`GremlinConnection`]. Each executed query gets a pending entry keyed by
//! its request id; partial responses accumulate into it up to a configured
//! cap, request charges are summed while every frame reports one, and a
//! per-request timer abandons queries the server never answers. Each entry
//! settles exactly once — success, failure, timeout or abort, whichever
//! lands first — and later frames for a settled id are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::GremlinClientParams;
use crate::connection::{ConnectionHandlers, GremlinConnection, QueryUpdate};
use crate::error::{GremlinError, Result};
use crate::protocol::{self, GremlinRequestMessage, GremlinResponse};

/// Severity forwarded to the notification sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Side-effecting sink for operator-visible messages. The default forwards
/// into `tracing`; a console embedding would route these to its notification
/// system instead.
pub type NotificationSink = Arc<dyn Fn(Severity, &str) + Send + Sync>;

fn tracing_sink() -> NotificationSink {
    Arc::new(|severity, message| match severity {
        Severity::Info => info!("{message}"),
        Severity::Warning => warn!("{message}"),
        Severity::Error => error!("{message}"),
    })
}

fn notify(sink: &NotificationSink, severity: Severity, message: &str) {
    (sink.as_ref())(severity, message);
}

/// Running request-charge aggregate for one pending query.
///
/// Aggregation is all-or-nothing: one frame without a usable charge poisons
/// the total for the rest of the request, and later numeric frames do not
/// revive it.
#[derive(Debug, Clone, Copy, PartialEq)]
enum RequestCharge {
    /// No frame has contributed yet.
    Unset,
    /// Every frame so far carried a numeric charge.
    Total(f64),
    /// At least one frame had a missing or non-numeric charge.
    Unavailable,
}

impl RequestCharge {
    fn add(&mut self, charge: Option<f64>) {
        *self = match (charge, *self) {
            (_, RequestCharge::Unavailable) | (None, _) => RequestCharge::Unavailable,
            (Some(charge), RequestCharge::Unset) => RequestCharge::Total(charge),
            (Some(charge), RequestCharge::Total(total)) => RequestCharge::Total(total + charge),
        };
    }

    fn total(&self) -> Option<f64> {
        match self {
            RequestCharge::Total(total) => Some(*total),
            _ => None,
        }
    }
}

/// Final result of one executed query.
#[derive(Debug, Clone, PartialEq)]
pub struct GremlinQueryResult {
    /// Result items in server-send order.
    pub data: Vec<Value>,
    /// Aggregate request charge, if every response frame reported one.
    pub total_request_charge: Option<f64>,
    /// True when the configured result cap cut the accumulation short.
    pub is_truncated: bool,
}

struct PendingQuery {
    data: Vec<Value>,
    is_truncated: bool,
    charge: RequestCharge,
    settle: oneshot::Sender<Result<GremlinQueryResult>>,
    timeout: Option<JoinHandle<()>>,
}

impl PendingQuery {
    fn new(settle: oneshot::Sender<Result<GremlinQueryResult>>) -> Self {
        Self {
            data: Vec::new(),
            is_truncated: false,
            charge: RequestCharge::Unset,
            settle,
            timeout: None,
        }
    }

    fn settle_ok(self) {
        let PendingQuery { data, is_truncated, charge, settle, timeout } = self;
        if let Some(timeout) = timeout {
            timeout.abort();
        }
        let _ = settle.send(Ok(GremlinQueryResult {
            data,
            total_request_charge: charge.total(),
            is_truncated,
        }));
    }

    fn finish(self, outcome: Result<GremlinQueryResult>) {
        if let Some(timeout) = self.timeout {
            timeout.abort();
        }
        let _ = self.settle.send(outcome);
    }
}

type PendingMap = HashMap<Uuid, PendingQuery>;

fn lock_pending(pending: &Mutex<PendingMap>) -> MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// High-level Gremlin query client.
///
/// Owns a [`GremlinConnection`] and a map of pending queries keyed by
/// request id. Safe to share across tasks; all interior state is mutex
/// guarded and locks are never held across await points.
pub struct GremlinClient {
    params: GremlinClientParams,
    sink: NotificationSink,
    pending: Arc<Mutex<PendingMap>>,
    connection: Option<GremlinConnection>,
}

impl GremlinClient {
    pub fn new(params: GremlinClientParams) -> Self {
        Self::with_sink(params, tracing_sink())
    }

    pub fn with_sink(params: GremlinClientParams, sink: NotificationSink) -> Self {
        let mut client = Self {
            params: params.clone(),
            sink,
            pending: Arc::new(Mutex::new(HashMap::new())),
            connection: None,
        };
        client.initialize(params);
        client
    }

    /// (Re-)create the underlying connection, discarding any previous one.
    /// Queries pending against the old connection are rejected.
    pub fn initialize(&mut self, params: GremlinClientParams) {
        if let Some(previous) = self.connection.take() {
            previous.close();
        }
        let drained: Vec<PendingQuery> = lock_pending(&self.pending)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in drained {
            entry.finish(Err(GremlinError::ConnectionClosed));
        }
        let handlers = build_handlers(
            Arc::clone(&self.pending),
            Arc::clone(&self.sink),
            params.max_result_size,
        );
        self.connection = Some(GremlinConnection::new(params.connection.clone(), handlers));
        self.params = params;
    }

    /// Execute a Gremlin query and collect its full (possibly truncated)
    /// result. Settles exactly once: on the terminal response, on a
    /// failure, or when the query timeout fires.
    pub async fn execute(&self, query: &str) -> Result<GremlinQueryResult> {
        let connection = self
            .connection
            .as_ref()
            .ok_or(GremlinError::ConnectionClosed)?;

        let message = GremlinRequestMessage::eval(query);
        let request_id = message.request_id;
        let (settle_tx, settle_rx) = oneshot::channel();

        // Register before the frame can possibly be answered.
        lock_pending(&self.pending).insert(request_id, PendingQuery::new(settle_tx));
        connection.send_request(message);
        self.arm_timeout(request_id);

        match settle_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(GremlinError::ConnectionClosed),
        }
    }

    /// Reject a pending query and drop its state. Exposed for diagnostics;
    /// the timeout path goes through the same bookkeeping.
    pub fn abort_pending_request(&self, request_id: Uuid, error: GremlinError) {
        abort_entry(&self.pending, &self.sink, request_id, error);
    }

    /// Close the underlying connection and drop it. Anything still in
    /// flight is cleaned up by its timeout.
    pub fn destroy(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }

    fn arm_timeout(&self, request_id: Uuid) {
        let pending = Arc::clone(&self.pending);
        let sink = Arc::clone(&self.sink);
        let duration = self.params.query_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            abort_entry(&pending, &sink, request_id, GremlinError::QueryTimeout);
        });
        let mut map = lock_pending(&self.pending);
        match map.get_mut(&request_id) {
            Some(entry) => entry.timeout = Some(handle),
            // Already settled; the timer has nothing left to guard.
            None => handle.abort(),
        }
    }
}

/// Render a request charge for display: `"(N RUs)"`, or an empty string when
/// no charge is known. Zero is a real charge and is displayed.
pub fn request_charge_string(charge: Option<f64>) -> String {
    match charge {
        Some(charge) => format!("({charge} RUs)"),
        None => String::new(),
    }
}

// ============================================================================
// Connection callbacks
// ============================================================================

fn build_handlers(
    pending: Arc<Mutex<PendingMap>>,
    sink: NotificationSink,
    max_result_size: usize,
) -> ConnectionHandlers {
    ConnectionHandlers {
        on_success: {
            let pending = Arc::clone(&pending);
            let sink = Arc::clone(&sink);
            Box::new(move |update| on_query_success(&pending, &sink, max_result_size, update))
        },
        on_progress: {
            let pending = Arc::clone(&pending);
            let sink = Arc::clone(&sink);
            Box::new(move |update| on_query_progress(&pending, &sink, max_result_size, update))
        },
        on_failure: {
            let pending = Arc::clone(&pending);
            let sink = Arc::clone(&sink);
            Box::new(move |response, error| on_query_failure(&pending, &sink, response, error))
        },
        on_info: Box::new(move |message| notify(&sink, Severity::Info, message)),
    }
}

fn on_query_success(
    pending: &Mutex<PendingMap>,
    sink: &NotificationSink,
    max_result_size: usize,
    update: QueryUpdate,
) {
    let (items, charge) = split_update(sink, &update);
    let entry = lock_pending(pending).remove(&update.request_id);
    let Some(mut entry) = entry else {
        notify(
            sink,
            Severity::Warning,
            &format!("Dropping result for unknown request {}", update.request_id),
        );
        return;
    };
    accumulate(&mut entry, items, charge, max_result_size);
    entry.settle_ok();
}

fn on_query_progress(
    pending: &Mutex<PendingMap>,
    sink: &NotificationSink,
    max_result_size: usize,
    update: QueryUpdate,
) {
    let (items, charge) = split_update(sink, &update);
    let mut map = lock_pending(pending);
    let Some(entry) = map.get_mut(&update.request_id) else {
        drop(map);
        notify(
            sink,
            Severity::Warning,
            &format!("Dropping partial result for unknown request {}", update.request_id),
        );
        return;
    };
    let truncated = accumulate(entry, items, charge, max_result_size);
    if truncated {
        // The cap is hit; settle now instead of waiting for the terminal
        // frame. Whatever else the server sends for this id lands on the
        // unknown-request path and is dropped.
        if let Some(entry) = map.remove(&update.request_id) {
            drop(map);
            entry.settle_ok();
        }
    }
}

fn on_query_failure(
    pending: &Mutex<PendingMap>,
    sink: &NotificationSink,
    response: Option<&GremlinResponse>,
    error: GremlinError,
) {
    notify(sink, Severity::Error, &error.to_string());
    match response.and_then(|response| response.request_id()) {
        Some(request_id) => {
            let entry = lock_pending(pending).remove(&request_id);
            match entry {
                Some(entry) => {
                    if let Some(charge) = entry.charge.total() {
                        debug!(request_id = %request_id, charge, "rejecting request with partial charge");
                    }
                    entry.finish(Err(error));
                }
                None => {
                    debug!(request_id = %request_id, "dropping failure for unknown request");
                }
            }
        }
        None => {
            // No request context: every in-flight query is lost.
            let drained: Vec<PendingQuery> = lock_pending(pending)
                .drain()
                .map(|(_, entry)| entry)
                .collect();
            for entry in drained {
                entry.finish(Err(error.clone()));
            }
        }
    }
}

fn abort_entry(
    pending: &Mutex<PendingMap>,
    sink: &NotificationSink,
    request_id: Uuid,
    error: GremlinError,
) {
    let entry = lock_pending(pending).remove(&request_id);
    match entry {
        Some(entry) => {
            if let Some(charge) = entry.charge.total() {
                debug!(request_id = %request_id, charge, "aborting request with partial charge");
            }
            notify(
                sink,
                Severity::Error,
                &format!("Query {request_id} failed: {error}"),
            );
            entry.finish(Err(error));
        }
        None => {
            debug!(request_id = %request_id, "ignoring abort for unknown request");
        }
    }
}

/// Pull the payload items and the frame's request charge out of an update.
/// A null payload contributes no items; any other scalar becomes a single
/// item. A missing or non-numeric charge is reported once, here.
fn split_update(sink: &NotificationSink, update: &QueryUpdate) -> (Vec<Value>, Option<f64>) {
    let items = match update.data.clone() {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(scalar) => vec![scalar],
    };
    let charge = update
        .request_charge
        .as_ref()
        .and_then(protocol::parse_request_charge);
    if charge.is_none() {
        notify(
            sink,
            Severity::Warning,
            &format!(
                "Response for request {} carried no usable request charge",
                update.request_id
            ),
        );
    }
    (items, charge)
}

/// Apply one frame's items and charge to a pending entry. Returns the
/// entry's truncation flag so a progress frame can settle early once the
/// cap is hit.
fn accumulate(
    entry: &mut PendingQuery,
    items: Vec<Value>,
    charge: Option<f64>,
    max_result_size: usize,
) -> bool {
    let remaining = max_result_size.saturating_sub(entry.data.len());
    if items.len() > remaining {
        entry.is_truncated = true;
    }
    entry.data.extend(items.into_iter().take(remaining));
    entry.charge.add(charge);
    entry.is_truncated
}
