//! Protocol client: WebSocket lifecycle and the status-driven state machine.
//!
//! Owns the socket, a to-send queue for requests dispatched before the
//! connection is open, and an in-flight map of requests awaiting a terminal
//! response. Incoming frames are decoded and dispatched on their status code;
//! the owner observes everything through the callbacks wired in at
//! construction. This layer never returns an error from the message path —
//! every failure funnels through the failure callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ConnectionParams;
use crate::error::GremlinError;
use crate::protocol::{
    self, status, DecodedFrame, GremlinRequestMessage, GremlinResponse,
};

/// Payload handed to the success and progress callbacks.
#[derive(Debug, Clone)]
pub struct QueryUpdate {
    pub request_id: Uuid,
    /// Result payload carried by the frame; `None` for a no-content response.
    pub data: Option<Value>,
    /// Raw request charge attribute carried by the frame, if any.
    pub request_charge: Option<Value>,
}

pub type SuccessCallback = Box<dyn FnMut(QueryUpdate) + Send>;
pub type ProgressCallback = Box<dyn FnMut(QueryUpdate) + Send>;
pub type FailureCallback = Box<dyn FnMut(Option<&GremlinResponse>, GremlinError) + Send>;
pub type InfoCallback = Box<dyn FnMut(&str) + Send>;

/// Callbacks wired in by the owner at construction time.
pub struct ConnectionHandlers {
    pub on_success: SuccessCallback,
    pub on_progress: ProgressCallback,
    pub on_failure: FailureCallback,
    pub on_info: InfoCallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Events delivered by a socket pump task, tagged with the generation of the
/// socket that produced them.
enum SocketEvent {
    Opened(mpsc::UnboundedSender<Message>),
    Frame(Vec<u8>),
    Error(String),
    Closed { clean: bool },
}

struct ConnectionCore {
    params: ConnectionParams,
    state: ConnectionState,
    /// Bumped every time a new socket is dialed. Events from a superseded
    /// pump task carry a stale generation and are dropped.
    generation: u64,
    /// Dispatched but not yet sent; flushed when the socket opens.
    requests_to_send: HashMap<Uuid, GremlinRequestMessage>,
    /// Sent and awaiting a terminal response.
    pending_requests: HashMap<Uuid, GremlinRequestMessage>,
    /// Outbound frames for the current socket's writer task.
    outbound: Option<mpsc::UnboundedSender<Message>>,
    handlers: ConnectionHandlers,
}

/// Low-level Gremlin protocol client over a single WebSocket connection.
pub struct GremlinConnection {
    core: Arc<Mutex<ConnectionCore>>,
}

impl GremlinConnection {
    pub fn new(params: ConnectionParams, handlers: ConnectionHandlers) -> Self {
        Self {
            core: Arc::new(Mutex::new(ConnectionCore {
                params,
                state: ConnectionState::Disconnected,
                generation: 0,
                requests_to_send: HashMap::new(),
                pending_requests: HashMap::new(),
                outbound: None,
                handlers,
            })),
        }
    }

    /// Queue an eval request for `query` and trigger a connect. Returns the
    /// generated request id immediately; the frame goes out once the socket
    /// is open.
    pub fn send_query(&self, query: &str) -> Uuid {
        self.send_request(GremlinRequestMessage::eval(query))
    }

    /// Queue a prebuilt request. Lets the owner register per-request state
    /// under the request id before the frame can possibly be answered.
    pub fn send_request(&self, message: GremlinRequestMessage) -> Uuid {
        let request_id = message.request_id;
        self.lock().requests_to_send.insert(request_id, message);
        self.connect();
        request_id
    }

    /// Idempotent connect. Already open: flush anything queued. Connect in
    /// progress: no-op. Otherwise any stale socket is abandoned and a new
    /// one is dialed.
    pub fn connect(&self) {
        let (endpoint, generation) = {
            let mut core = self.lock();
            match core.state {
                ConnectionState::Open => {
                    core.flush_queued();
                    return;
                }
                ConnectionState::Connecting => return,
                ConnectionState::Disconnected | ConnectionState::Closing => {
                    core.outbound = None;
                    core.state = ConnectionState::Connecting;
                    core.generation += 1;
                    (core.params.endpoint.clone(), core.generation)
                }
            }
        };
        tokio::spawn(run_socket(Arc::clone(&self.core), endpoint, generation));
    }

    /// Close the connection if open or connecting. Queued and in-flight
    /// requests are cleared when the close lands.
    pub fn close(&self) {
        let mut core = self.lock();
        match core.state {
            ConnectionState::Open => {
                core.state = ConnectionState::Closing;
                if let Some(outbound) = core.outbound.take() {
                    let _ = outbound.send(Message::Close(None));
                }
            }
            ConnectionState::Connecting => {
                // No socket yet. Orphan the in-progress dial and report a
                // clean close directly.
                core.generation += 1;
                core.handle_close(true);
            }
            ConnectionState::Disconnected | ConnectionState::Closing => {}
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionCore> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ConnectionCore {
    // ------------------------------------------------------------------
    // Socket lifecycle
    // ------------------------------------------------------------------

    fn handle_open(&mut self, outbound: mpsc::UnboundedSender<Message>) {
        self.state = ConnectionState::Open;
        self.outbound = Some(outbound);
        (self.handlers.on_info)("Gremlin connection established");
        self.flush_queued();
    }

    fn handle_error(&mut self, message: String) {
        (self.handlers.on_failure)(None, GremlinError::Transport(message));
    }

    fn handle_close(&mut self, clean: bool) {
        self.state = ConnectionState::Disconnected;
        self.outbound = None;
        self.requests_to_send.clear();
        self.pending_requests.clear();
        if clean {
            (self.handlers.on_info)("Gremlin connection closed");
        } else {
            (self.handlers.on_failure)(None, GremlinError::UnexpectedClose);
        }
    }

    /// Move every queued request into the in-flight map and put its frame on
    /// the wire.
    fn flush_queued(&mut self) {
        let queued: Vec<Uuid> = self.requests_to_send.keys().copied().collect();
        for request_id in queued {
            if let Some(message) = self.requests_to_send.remove(&request_id) {
                self.send_message(message);
            }
        }
    }

    fn send_message(&mut self, message: GremlinRequestMessage) {
        let frame = match protocol::encode_frame(&message) {
            Ok(frame) => frame,
            Err(err) => {
                (self.handlers.on_failure)(None, err);
                return;
            }
        };
        let delivered = self
            .outbound
            .as_ref()
            .map(|outbound| outbound.send(Message::Binary(frame)).is_ok())
            .unwrap_or(false);
        if delivered {
            self.pending_requests.insert(message.request_id, message);
        } else {
            (self.handlers.on_failure)(None, GremlinError::ConnectionClosed);
        }
    }

    // ------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------

    fn handle_frame(&mut self, payload: &[u8]) {
        match protocol::decode_frame(payload) {
            Ok(DecodedFrame::Empty) => {
                (self.handlers.on_info)("Received empty frame from server");
            }
            Ok(DecodedFrame::Response(response)) => self.handle_response(*response),
            Err(err) => (self.handlers.on_failure)(None, err),
        }
    }

    /// Status-driven dispatch. Every known code has an arm; anything else is
    /// a terminal failure with its own error category.
    fn handle_response(&mut self, response: GremlinResponse) {
        match response.status.code {
            status::SUCCESS => self.handle_success(response),
            status::NO_CONTENT => self.handle_no_content(response),
            status::PARTIAL_CONTENT => self.handle_partial(response),
            status::AUTHENTICATE => self.handle_challenge(response),
            status::UNAUTHORIZED
            | status::MALFORMED_REQUEST
            | status::SERVER_ERROR
            | status::SCRIPT_EVALUATION_ERROR
            | status::SERVER_TIMEOUT
            | status::SERIALIZATION_ERROR => self.handle_failure_status(response),
            other => {
                warn!(code = other, "unrecognized status code");
                self.handle_failure_status(response);
            }
        }
    }

    fn handle_success(&mut self, response: GremlinResponse) {
        let Some(request_id) = self.take_in_flight(&response) else {
            return;
        };
        let update = QueryUpdate {
            request_id,
            data: response.result.as_ref().map(|result| result.data.clone()),
            request_charge: response.request_charge().cloned(),
        };
        (self.handlers.on_success)(update);
    }

    fn handle_no_content(&mut self, response: GremlinResponse) {
        let Some(request_id) = self.take_in_flight(&response) else {
            return;
        };
        let update = QueryUpdate {
            request_id,
            data: None,
            request_charge: response.request_charge().cloned(),
        };
        (self.handlers.on_success)(update);
    }

    /// Partial content: dispatch progress and keep the request in flight.
    fn handle_partial(&mut self, response: GremlinResponse) {
        let request_id = match response.request_id() {
            Some(id) if self.pending_requests.contains_key(&id) => id,
            _ => {
                self.report_orphan(&response);
                return;
            }
        };
        let update = QueryUpdate {
            request_id,
            data: response.result.as_ref().map(|result| result.data.clone()),
            request_charge: response.request_charge().cloned(),
        };
        (self.handlers.on_progress)(update);
    }

    /// Authentication challenge: answer with a SASL PLAIN token under the
    /// challenged request's id and processor name. The request stays in
    /// flight; no owner callback fires.
    fn handle_challenge(&mut self, response: GremlinResponse) {
        let Some(request_id) = response.request_id() else {
            self.report_orphan(&response);
            return;
        };
        let answer = match self.pending_requests.get(&request_id) {
            Some(challenged) => GremlinRequestMessage::authentication(
                challenged,
                &self.params.username,
                &self.params.password,
            ),
            None => {
                self.report_orphan(&response);
                return;
            }
        };
        debug!(request_id = %request_id, "answering authentication challenge");
        self.send_message(answer);
    }

    /// Terminal failure status: remove the request (when one matches) and
    /// report the category error. The response travels with the callback so
    /// the owner can route on its request id.
    fn handle_failure_status(&mut self, response: GremlinResponse) {
        if let Some(request_id) = response.request_id() {
            self.pending_requests.remove(&request_id);
        }
        let error = GremlinError::from_status(response.status.code, response.status_message());
        (self.handlers.on_failure)(Some(&response), error);
    }

    /// Remove the response's request from the in-flight map. Reports an
    /// orphan failure and returns `None` when nothing matches.
    fn take_in_flight(&mut self, response: &GremlinResponse) -> Option<Uuid> {
        match response.request_id() {
            Some(request_id) if self.pending_requests.remove(&request_id).is_some() => {
                Some(request_id)
            }
            _ => {
                self.report_orphan(response);
                None
            }
        }
    }

    /// A frame that matches no in-flight request. Reported through the
    /// failure callback; nothing is removed.
    fn report_orphan(&mut self, response: &GremlinResponse) {
        let raw_id = response.request_id.clone().unwrap_or_default();
        (self.handlers.on_failure)(Some(response), GremlinError::Orphan(raw_id));
    }
}

fn dispatch_event(core: &Arc<Mutex<ConnectionCore>>, generation: u64, event: SocketEvent) {
    let mut core = core.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if core.generation != generation {
        debug!(generation, "dropping event from superseded socket");
        return;
    }
    match event {
        SocketEvent::Opened(outbound) => core.handle_open(outbound),
        SocketEvent::Frame(payload) => core.handle_frame(&payload),
        SocketEvent::Error(message) => core.handle_error(message),
        SocketEvent::Closed { clean } => core.handle_close(clean),
    }
}

/// Dial the endpoint and pump socket events into the core until the
/// connection dies. Outbound frames flow through an unbounded channel into a
/// writer task so the reader never blocks on sends.
async fn run_socket(core: Arc<Mutex<ConnectionCore>>, endpoint: String, generation: u64) {
    let (stream, _) = match connect_async(endpoint.as_str()).await {
        Ok(connected) => connected,
        Err(err) => {
            dispatch_event(&core, generation, SocketEvent::Error(err.to_string()));
            dispatch_event(&core, generation, SocketEvent::Closed { clean: false });
            return;
        }
    };

    let (mut sink, mut source) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    dispatch_event(&core, generation, SocketEvent::Opened(outbound_tx));

    let mut clean = false;
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Binary(payload)) => {
                dispatch_event(&core, generation, SocketEvent::Frame(payload));
            }
            Ok(Message::Text(text)) => {
                dispatch_event(&core, generation, SocketEvent::Frame(text.into_bytes()));
            }
            Ok(Message::Close(_)) => {
                clean = true;
                break;
            }
            Ok(_) => {}
            Err(err) => {
                dispatch_event(&core, generation, SocketEvent::Error(err.to_string()));
                break;
            }
        }
    }

    writer.abort();
    dispatch_event(&core, generation, SocketEvent::Closed { clean });
}
