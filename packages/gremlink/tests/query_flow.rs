//! Integration tests: full query flows against a scripted in-process
//! WebSocket server.
//!
//! Each test binds a listener on a random port, accepts exactly one
//! connection and plays a fixed exchange against the client.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use gremlink::{
    ConnectionParams, GremlinClient, GremlinClientParams, GremlinError, NotificationSink, Severity,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type ServerSocket = WebSocketStream<TcpStream>;

async fn bind_server() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}/", listener.local_addr().unwrap());
    (listener, endpoint)
}

async fn accept_client(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = listener.accept().await.unwrap();
    accept_async(stream).await.unwrap()
}

/// Read one request frame and return its JSON payload (the one-byte MIME
/// header is stripped off the front).
async fn read_request(socket: &mut ServerSocket) -> Value {
    loop {
        let message = socket.next().await.expect("client hung up").unwrap();
        match message {
            Message::Binary(payload) => {
                let mime_len = payload[0] as usize;
                return serde_json::from_slice(&payload[1 + mime_len..]).unwrap();
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected client frame: {other:?}"),
        }
    }
}

async fn send_response(socket: &mut ServerSocket, body: Value) {
    socket
        .send(Message::Binary(serde_json::to_vec(&body).unwrap()))
        .await
        .unwrap();
}

fn response_body(request_id: &Value, code: u16, data: Value, charge: Value) -> Value {
    json!({
        "requestId": request_id,
        "status": {
            "code": code,
            "message": "",
            "attributes": { "x-ms-total-request-charge": charge }
        },
        "result": { "data": data }
    })
}

fn client_params(endpoint: &str) -> GremlinClientParams {
    GremlinClientParams::new(ConnectionParams {
        endpoint: endpoint.to_string(),
        username: "/dbs/db/colls/graph".to_string(),
        password: "key".to_string(),
    })
}

fn capture_sink() -> (NotificationSink, Arc<Mutex<Vec<(Severity, String)>>>) {
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink: NotificationSink = {
        let messages = Arc::clone(&messages);
        Arc::new(move |severity, message: &str| {
            messages.lock().unwrap().push((severity, message.to_string()))
        })
    };
    (sink, messages)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_success_resolves_with_data_and_charge() {
    let (listener, endpoint) = bind_server().await;
    let server = tokio::spawn(async move {
        let mut socket = accept_client(&listener).await;
        let request = read_request(&mut socket).await;
        assert_eq!(request["operation"], "eval");
        assert_eq!(request["args"]["query"], "g.V()");
        let id = request["requestId"].clone();
        send_response(&mut socket, response_body(&id, 200, json!(["v1", "v2"]), json!(2.5))).await;
    });

    let client = GremlinClient::new(client_params(&endpoint));
    let result = client.execute("g.V()").await.unwrap();

    assert_eq!(result.data, vec![json!("v1"), json!("v2")]);
    assert_eq!(result.total_request_charge, Some(2.5));
    assert!(!result.is_truncated);
    server.await.unwrap();
}

#[tokio::test]
async fn pagination_accumulates_in_order_and_sums_charges() {
    let (listener, endpoint) = bind_server().await;
    let server = tokio::spawn(async move {
        let mut socket = accept_client(&listener).await;
        let request = read_request(&mut socket).await;
        let id = request["requestId"].clone();
        send_response(&mut socket, response_body(&id, 206, json!(["a"]), json!(1))).await;
        send_response(&mut socket, response_body(&id, 206, json!(["b"]), json!(2))).await;
        send_response(&mut socket, response_body(&id, 206, json!(["c"]), json!(3))).await;
        send_response(&mut socket, response_body(&id, 200, json!([]), json!(0))).await;
    });

    let client = GremlinClient::new(client_params(&endpoint));
    let result = client.execute("g.V()").await.unwrap();

    assert_eq!(result.data, vec![json!("a"), json!("b"), json!("c")]);
    assert_eq!(result.total_request_charge, Some(6.0));
    assert!(!result.is_truncated);
    server.await.unwrap();
}

#[tokio::test]
async fn oversized_terminal_response_is_truncated_to_the_cap() {
    let (listener, endpoint) = bind_server().await;
    let server = tokio::spawn(async move {
        let mut socket = accept_client(&listener).await;
        let request = read_request(&mut socket).await;
        let id = request["requestId"].clone();
        send_response(
            &mut socket,
            response_body(&id, 200, json!(["a", "b", "c", "d", "e"]), json!(2)),
        )
        .await;
    });

    let mut params = client_params(&endpoint);
    params.max_result_size = 2;
    let client = GremlinClient::new(params);
    let result = client.execute("g.V()").await.unwrap();

    assert_eq!(result.data, vec![json!("a"), json!("b")]);
    assert!(result.is_truncated);
    assert_eq!(result.total_request_charge, Some(2.0));
    server.await.unwrap();
}

#[tokio::test]
async fn authentication_challenge_is_answered_with_the_same_request_id() {
    let (listener, endpoint) = bind_server().await;
    let server = tokio::spawn(async move {
        let mut socket = accept_client(&listener).await;
        let request = read_request(&mut socket).await;
        let id = request["requestId"].clone();

        send_response(&mut socket, response_body(&id, 407, json!(null), json!(0))).await;

        let challenge_answer = read_request(&mut socket).await;
        assert_eq!(challenge_answer["operation"], "authentication");
        assert_eq!(challenge_answer["requestId"], id);
        assert_eq!(
            challenge_answer["args"]["saslToken"],
            gremlink::protocol::sasl_plain_token("/dbs/db/colls/graph", "key")
        );

        send_response(&mut socket, response_body(&id, 200, json!(["ok"]), json!(1))).await;
    });

    let client = GremlinClient::new(client_params(&endpoint));
    let result = client.execute("g.V()").await.unwrap();

    assert_eq!(result.data, vec![json!("ok")]);
    server.await.unwrap();
}

#[tokio::test]
async fn failure_without_request_id_rejects_every_query_in_flight() {
    let (listener, endpoint) = bind_server().await;
    let server = tokio::spawn(async move {
        let mut socket = accept_client(&listener).await;
        read_request(&mut socket).await;
        read_request(&mut socket).await;
        // A failure with no request id at all.
        send_response(
            &mut socket,
            json!({ "status": { "code": 500, "message": "engine down" } }),
        )
        .await;
        // Keep the socket open so the close path does not race the test.
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let client = GremlinClient::new(client_params(&endpoint));
    let (first, second) = tokio::join!(client.execute("g.V()"), client.execute("g.E()"));

    assert_eq!(first, Err(GremlinError::ServerError("engine down".to_string())));
    assert_eq!(second, Err(GremlinError::ServerError("engine down".to_string())));
    server.abort();
}

#[tokio::test]
async fn unanswered_query_times_out_and_late_response_is_dropped() {
    let (listener, endpoint) = bind_server().await;
    let server = tokio::spawn(async move {
        let mut socket = accept_client(&listener).await;
        let request = read_request(&mut socket).await;
        let id = request["requestId"].clone();
        // Answer long after the client has given up.
        tokio::time::sleep(Duration::from_millis(750)).await;
        send_response(&mut socket, response_body(&id, 200, json!(["late"]), json!(1))).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let (sink, messages) = capture_sink();
    let mut params = client_params(&endpoint);
    params.query_timeout = Duration::from_millis(250);
    let client = GremlinClient::with_sink(params, sink);

    let outcome = client.execute("g.V()").await;
    assert_eq!(outcome, Err(GremlinError::QueryTimeout));

    // The late terminal frame lands on the unknown-request path.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(messages
        .lock()
        .unwrap()
        .iter()
        .any(|(_, message)| message.contains("unknown request")));
    server.abort();
}

#[tokio::test]
async fn progress_frame_over_capacity_settles_before_the_terminal_frame() {
    let (listener, endpoint) = bind_server().await;
    let server = tokio::spawn(async move {
        let mut socket = accept_client(&listener).await;
        let request = read_request(&mut socket).await;
        let id = request["requestId"].clone();
        send_response(
            &mut socket,
            response_body(&id, 206, json!(["a", "b", "c"]), json!(1)),
        )
        .await;
        // The terminal frame arrives after the client already settled.
        send_response(&mut socket, response_body(&id, 200, json!(["d"]), json!(1))).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let mut params = client_params(&endpoint);
    params.max_result_size = 2;
    let client = GremlinClient::new(params);
    let result = client.execute("g.V()").await.unwrap();

    assert_eq!(result.data, vec![json!("a"), json!("b")]);
    assert!(result.is_truncated);
    server.abort();
}

#[tokio::test]
async fn empty_frame_is_ignored_and_no_content_resolves_empty() {
    let (listener, endpoint) = bind_server().await;
    let server = tokio::spawn(async move {
        let mut socket = accept_client(&listener).await;
        let request = read_request(&mut socket).await;
        let id = request["requestId"].clone();
        socket.send(Message::Binary(Vec::new())).await.unwrap();
        send_response(
            &mut socket,
            json!({ "requestId": id, "status": { "code": 204, "message": null } }),
        )
        .await;
    });

    let client = GremlinClient::new(client_params(&endpoint));
    let result = client.execute("g.V().drop()").await.unwrap();

    assert!(result.data.is_empty());
    // A no-content frame carries no charge attribute, so no total either.
    assert_eq!(result.total_request_charge, None);
    assert!(!result.is_truncated);
    server.await.unwrap();
}
