use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use pier::{ClientConfig, Connection, ConnectionEvent, ServerAddress};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

/// End-to-end over a real websocket: subprotocol negotiation, an info
/// round-trip, then a clean close handshake.
#[tokio::test]
async fn websocket_roundtrip_against_a_loopback_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen_protocol: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    let server = {
        let seen = Arc::clone(&seen_protocol);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_hdr_async(stream, |req: &Request, mut resp: Response| {
                if let Some(proto) = req.headers().get("Sec-WebSocket-Protocol") {
                    *seen.lock().unwrap() = proto.to_str().ok().map(str::to_string);
                    resp.headers_mut()
                        .insert("Sec-WebSocket-Protocol", proto.clone());
                }
                Ok(resp)
            })
            .await
            .unwrap();

            while let Some(frame) = ws.next().await {
                match frame.unwrap_or(Message::Close(None)) {
                    Message::Text(text) => {
                        let request: Value = serde_json::from_str(&text).unwrap();
                        assert_eq!(request["janus"], "info");
                        let reply = json!({
                            "janus": "server_info",
                            "transaction": request["transaction"].clone(),
                            "name": "loopback"
                        });
                        ws.send(Message::Text(reply.to_string())).await.unwrap();
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        })
    };

    let config = ClientConfig::new(ServerAddress::new(format!("ws://127.0.0.1:{port}/janus")));
    let connection = Connection::open(config).await.unwrap();
    let mut events = connection.subscribe();

    let info = connection.get_info().await.unwrap();
    assert_eq!(info["name"], "loopback");
    assert_eq!(
        seen_protocol.lock().unwrap().as_deref(),
        Some("janus-protocol")
    );

    connection.close().await.unwrap();
    assert!(matches!(
        events.recv().await.unwrap(),
        ConnectionEvent::Closed
    ));
    server.await.unwrap();
}

/// Opening against a dead port walks the retry path and surfaces the last
/// connect error.
#[tokio::test]
async fn websocket_open_fails_fast_on_a_dead_port() {
    // Bind then drop to get a port nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut config = ClientConfig::new(ServerAddress::new(format!("ws://127.0.0.1:{port}/janus")));
    config.max_retries = 0;
    config.retry_time_secs = 0;
    let err = Connection::open(config).await.unwrap_err();
    assert!(!err.to_string().is_empty());
}
