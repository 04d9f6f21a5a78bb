use std::sync::Arc;
use std::time::Duration;

use pier::transport::mock::MockServer;
use pier::{
    ClientConfig, Connection, ConnectionEvent, Error, HandleEvent, PluginEvent, PluginHandler,
    ServerAddress, SessionEvent, TrickleEvent,
};
use serde_json::{Value, json};

fn mock_config() -> ClientConfig {
    ClientConfig::new(ServerAddress::new("mock://gateway"))
}

async fn open_mock() -> (Arc<MockServer>, Arc<Connection>) {
    let server = MockServer::new();
    let connection = Connection::open_with(mock_config(), server.factory())
        .await
        .expect("mock open");
    (server, connection)
}

/// Answer the next outbound request with the response built by `reply`.
async fn respond_next(server: &MockServer, reply: impl FnOnce(&Value) -> Value) -> Value {
    let request = server.recv().await.expect("outbound request");
    server.push(reply(&request));
    request
}

fn success_with_id(request: &Value, session_id: Option<u64>, id: u64) -> Value {
    let mut response = json!({
        "janus": "success",
        "transaction": request["transaction"].clone(),
        "data": { "id": id }
    });
    if let Some(session_id) = session_id {
        response["session_id"] = json!(session_id);
    }
    response
}

/// Drive `create` while answering it from the mock server.
async fn create_session(
    server: &Arc<MockServer>,
    connection: &Arc<Connection>,
    id: u64,
    ka_interval_secs: u64,
) -> Arc<pier::Session> {
    let create = {
        let connection = Arc::clone(connection);
        tokio::spawn(async move { connection.create(Some(ka_interval_secs)).await })
    };
    respond_next(server, |req| success_with_id(req, None, id)).await;
    create.await.unwrap().expect("create")
}

#[tokio::test]
async fn create_attach_destroy_roundtrip() {
    let (server, connection) = open_mock().await;

    let responder = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let create = respond_next(&server, |req| success_with_id(req, None, 42)).await;
            assert_eq!(create["janus"], "create");
            assert!(create["transaction"].is_string());

            let attach = respond_next(&server, |req| success_with_id(req, Some(42), 7)).await;
            assert_eq!(attach["janus"], "attach");
            assert_eq!(attach["session_id"], 42);
            assert_eq!(attach["plugin"], "janus.plugin.echotest");

            let destroy = respond_next(&server, |req| {
                json!({
                    "janus": "success",
                    "transaction": req["transaction"].clone(),
                    "session_id": 42
                })
            })
            .await;
            assert_eq!(destroy["janus"], "destroy");
            assert_eq!(destroy["session_id"], 42);
        })
    };

    let session = connection.create(Some(0)).await.expect("create");
    assert_eq!(session.id(), 42);

    let mut session_events = session.subscribe();
    let handle = session
        .attach("janus.plugin.echotest", None)
        .await
        .expect("attach");
    assert_eq!(handle.id(), 7);

    session.destroy().await.expect("destroy");
    assert!(matches!(
        session_events.recv().await.unwrap(),
        SessionEvent::Destroyed { id: 42 }
    ));
    assert!(session.destroyed());
    assert!(handle.detached());
    responder.await.unwrap();
}

#[tokio::test]
async fn error_response_rejects_with_code_and_reason() {
    let (server, connection) = open_mock().await;

    let responder = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            respond_next(&server, |req| success_with_id(req, None, 1)).await;
            respond_next(&server, |req| success_with_id(req, Some(1), 2)).await;
            let message = respond_next(&server, |req| {
                json!({
                    "janus": "error",
                    "transaction": req["transaction"].clone(),
                    "session_id": 1,
                    "sender": 2,
                    "error": { "code": 432, "reason": "no such room" }
                })
            })
            .await;
            assert_eq!(message["janus"], "message");
            assert_eq!(message["handle_id"], 2);
        })
    };

    let session = connection.create(Some(0)).await.unwrap();
    let handle = session.attach("janus.plugin.videoroom", None).await.unwrap();
    let err = handle.message(json!({}), None).await.unwrap_err();
    assert_eq!(err.to_string(), "432 no such room");
    responder.await.unwrap();
}

#[tokio::test]
async fn trickle_resolves_on_ack_without_sender() {
    let (server, connection) = open_mock().await;

    let responder = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            respond_next(&server, |req| success_with_id(req, None, 1)).await;
            respond_next(&server, |req| success_with_id(req, Some(1), 2)).await;
            // The ack carries no sender; routing has to find the handle
            // through the transaction owner.
            let trickle = respond_next(&server, |req| {
                json!({
                    "janus": "ack",
                    "transaction": req["transaction"].clone(),
                    "session_id": 1
                })
            })
            .await;
            assert_eq!(trickle["janus"], "trickle");
            assert_eq!(trickle["candidate"]["sdpMid"], "0");
        })
    };

    let session = connection.create(Some(0)).await.unwrap();
    let handle = session.attach("janus.plugin.echotest", None).await.unwrap();
    let candidate = json!({ "sdpMid": "0", "sdpMLineIndex": 0, "candidate": "candidate:1 1 udp 1 127.0.0.1 5000 typ host" });
    handle.trickle(Some(candidate)).await.expect("trickle ack");
    responder.await.unwrap();
}

#[tokio::test]
async fn trickle_without_candidate_sends_the_completed_marker() {
    let (server, connection) = open_mock().await;

    let responder = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            respond_next(&server, |req| success_with_id(req, None, 1)).await;
            respond_next(&server, |req| success_with_id(req, Some(1), 2)).await;
            let trickle = respond_next(&server, |req| {
                json!({
                    "janus": "ack",
                    "transaction": req["transaction"].clone(),
                    "session_id": 1
                })
            })
            .await;
            assert_eq!(trickle["candidate"]["completed"], true);
        })
    };

    let session = connection.create(Some(0)).await.unwrap();
    let handle = session.attach("janus.plugin.echotest", None).await.unwrap();
    handle.trickle(None).await.expect("trickle complete");
    responder.await.unwrap();
}

#[tokio::test]
async fn server_timeout_destroys_the_session() {
    let (server, connection) = open_mock().await;

    let session = create_session(&server, &connection, 1, 0).await;
    let mut session_events = session.subscribe();

    // Leave one session-owned request pending, then let the server evict.
    let pending = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            session
                .send_request(json!({ "janus": "message", "body": {} }))
                .await
        })
    };
    let _request = server.recv().await.expect("pending request");
    server.push(json!({ "janus": "timeout", "session_id": 1 }));

    assert!(matches!(
        session_events.recv().await.unwrap(),
        SessionEvent::Destroyed { id: 1 }
    ));
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::SessionDestroyed));
    assert!(session.destroyed());
    assert!(!connection.closed());
}

#[tokio::test]
async fn keepalive_miss_destroys_the_session_but_not_the_connection() {
    let (server, connection) = open_mock().await;

    let session = create_session(&server, &connection, 9, 1).await;
    let mut session_events = session.subscribe();

    let keepalive = server.recv().await.expect("keepalive probe");
    assert_eq!(keepalive["janus"], "keepalive");
    assert_eq!(keepalive["session_id"], 9);
    // No answer: the probe must expire within half the period.

    let event = tokio::time::timeout(Duration::from_secs(3), session_events.recv())
        .await
        .expect("session should die on a missed keepalive")
        .unwrap();
    assert!(matches!(event, SessionEvent::Destroyed { id: 9 }));
    assert!(!connection.closed());

    // The connection itself is still serviceable.
    let info = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.get_info().await })
    };
    respond_next(&server, |req| {
        json!({ "janus": "server_info", "transaction": req["transaction"].clone(), "name": "mock" })
    })
    .await;
    assert_eq!(info.await.unwrap().unwrap()["name"], "mock");
}

#[tokio::test]
async fn graceful_close_cascades_and_is_terminal() {
    let (server, connection) = open_mock().await;

    let session = create_session(&server, &connection, 3, 0).await;
    let mut connection_events = connection.subscribe();

    connection.close().await.expect("close");
    assert!(matches!(
        connection_events.recv().await.unwrap(),
        ConnectionEvent::Closed
    ));
    assert!(connection.closed());
    assert!(session.destroyed());

    let err = connection.close().await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));
    let err = connection.get_info().await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));
}

#[tokio::test]
async fn unexpected_drop_surfaces_as_connection_error() {
    let (server, connection) = open_mock().await;

    let session = create_session(&server, &connection, 3, 0).await;
    let mut connection_events = connection.subscribe();

    server.drop_connection(false);
    assert!(matches!(
        connection_events.recv().await.unwrap(),
        ConnectionEvent::Error(_)
    ));
    assert!(session.destroyed());
}

#[tokio::test]
async fn secrets_are_stamped_by_endpoint_mode() {
    // Plain endpoint: apisecret plus token.
    let server = MockServer::new();
    let mut address = ServerAddress::new("mock://gateway");
    address.apisecret = Some("s3cret".into());
    address.token = Some("tok".into());
    let connection = Connection::open_with(ClientConfig::new(address.clone()), server.factory())
        .await
        .unwrap();
    let info = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.get_info().await })
    };
    let request = respond_next(&server, |req| {
        json!({ "janus": "server_info", "transaction": req["transaction"].clone() })
    })
    .await;
    assert_eq!(request["apisecret"], "s3cret");
    assert_eq!(request["token"], "tok");
    assert!(request.get("admin_secret").is_none());
    info.await.unwrap().unwrap();

    // Admin endpoint: the same secret travels as admin_secret.
    let server = MockServer::new();
    let connection = Connection::open_with(ClientConfig::new(address).admin(), server.factory())
        .await
        .unwrap();
    let sessions = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.list_sessions().await })
    };
    let request = respond_next(&server, |req| {
        json!({
            "janus": "success",
            "transaction": req["transaction"].clone(),
            "sessions": [11, 22]
        })
    })
    .await;
    assert_eq!(request["janus"], "list_sessions");
    assert_eq!(request["admin_secret"], "s3cret");
    assert!(request.get("apisecret").is_none());
    assert_eq!(sessions.await.unwrap().unwrap(), vec![11, 22]);
}

#[tokio::test]
async fn admin_helpers_validate_their_arguments() {
    let (server, connection) = open_mock().await;

    let err = connection
        .start_pcap(1, 2, "", "trace.pcap", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingArgument("folder")));
    let err = connection.start_pcap(1, 2, "/tmp", "", None).await.unwrap_err();
    assert!(matches!(err, Error::MissingArgument("filename")));

    let pcap = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move {
            connection
                .start_pcap(1, 2, "/tmp", "trace.pcap", Some(1500))
                .await
        })
    };
    let request = respond_next(&server, |req| {
        json!({ "janus": "success", "transaction": req["transaction"].clone() })
    })
    .await;
    assert_eq!(request["janus"], "start_pcap");
    assert_eq!(request["folder"], "/tmp");
    assert_eq!(request["filename"], "trace.pcap");
    assert_eq!(request["truncate"], 1500);
    pcap.await.unwrap().unwrap();
}

struct EchoRecognizer;

impl PluginHandler for EchoRecognizer {
    fn handle_message(&self, raw: &Value) -> Option<PluginEvent> {
        let data = raw.get("plugindata")?.get("data")?;
        let mut event = PluginEvent::from_message(raw);
        event.event = data.get("echotest").and_then(Value::as_str).map(str::to_string);
        event.data["result"] = data.clone();
        Some(event)
    }
}

fn echo_recognizer() -> Arc<dyn PluginHandler> {
    Arc::new(EchoRecognizer)
}

#[tokio::test]
async fn plugin_events_and_notifications_reach_subscribers() {
    let (server, connection) = open_mock().await;

    let responder = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            respond_next(&server, |req| success_with_id(req, None, 1)).await;
            respond_next(&server, |req| success_with_id(req, Some(1), 2)).await;
        })
    };
    let session = connection.create(Some(0)).await.unwrap();
    let handle = session
        .attach("janus.plugin.echotest", Some(echo_recognizer()))
        .await
        .unwrap();
    responder.await.unwrap();
    let mut handle_events = handle.subscribe();

    // Async plugin event without a transaction.
    server.push(json!({
        "janus": "event",
        "session_id": 1,
        "sender": 2,
        "plugindata": { "plugin": "janus.plugin.echotest", "data": { "echotest": "event" } },
        "jsep": { "type": "answer", "sdp": "v=0", "e2ee": true }
    }));
    match handle_events.recv().await.unwrap() {
        HandleEvent::Event(event) => {
            assert_eq!(event.event.as_deref(), Some("event"));
            assert_eq!(event.data["jsep"]["sdp"], "v=0");
            assert_eq!(event.data["e2ee"], true);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Core notifications, in arrival order.
    server.push(json!({ "janus": "webrtcup", "session_id": 1, "sender": 2 }));
    server.push(json!({
        "janus": "media", "session_id": 1, "sender": 2,
        "type": "audio", "receiving": true, "mid": "0"
    }));
    server.push(json!({
        "janus": "slowlink", "session_id": 1, "sender": 2,
        "uplink": true, "media": "video", "lost": 12
    }));
    server.push(json!({
        "janus": "trickle", "session_id": 1, "sender": 2,
        "candidate": { "completed": true }
    }));
    server.push(json!({ "janus": "hangup", "session_id": 1, "sender": 2, "reason": "ice failed" }));

    assert!(matches!(
        handle_events.recv().await.unwrap(),
        HandleEvent::WebrtcUp
    ));
    match handle_events.recv().await.unwrap() {
        HandleEvent::Media(media) => {
            assert_eq!(media.media_type, "audio");
            assert!(media.receiving);
            assert_eq!(media.mid.as_deref(), Some("0"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match handle_events.recv().await.unwrap() {
        HandleEvent::Slowlink(slowlink) => {
            assert!(slowlink.uplink);
            assert_eq!(slowlink.media, "video");
            assert_eq!(slowlink.lost, 12);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(matches!(
        handle_events.recv().await.unwrap(),
        HandleEvent::Trickle(TrickleEvent::Completed)
    ));
    match handle_events.recv().await.unwrap() {
        HandleEvent::Hangup { reason } => assert_eq!(reason.as_deref(), Some("ice failed")),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn plugin_request_resolves_on_the_async_event_after_an_ack() {
    let (server, connection) = open_mock().await;

    let responder = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            respond_next(&server, |req| success_with_id(req, None, 1)).await;
            respond_next(&server, |req| success_with_id(req, Some(1), 2)).await;
            let message = server.recv().await.expect("plugin request");
            assert_eq!(message["janus"], "message");
            let tid = message["transaction"].clone();
            // Temporary ack first, definitive plugin event later.
            server.push(json!({ "janus": "ack", "transaction": tid.clone(), "session_id": 1 }));
            server.push(json!({
                "janus": "event",
                "transaction": tid,
                "session_id": 1,
                "sender": 2,
                "plugindata": { "plugin": "janus.plugin.echotest", "data": { "echotest": "done" } }
            }));
        })
    };

    let session = connection.create(Some(0)).await.unwrap();
    let handle = session
        .attach("janus.plugin.echotest", Some(echo_recognizer()))
        .await
        .unwrap();
    let response = handle.message(json!({ "audio": true }), None).await.unwrap();
    assert_eq!(response["janus"], "event");
    assert_eq!(response["plugindata"]["data"]["echotest"], "done");
    responder.await.unwrap();
}

#[tokio::test]
async fn detach_tears_the_handle_down_even_when_the_server_refuses() {
    let (server, connection) = open_mock().await;

    let responder = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            respond_next(&server, |req| success_with_id(req, None, 1)).await;
            respond_next(&server, |req| success_with_id(req, Some(1), 2)).await;
            respond_next(&server, |req| {
                json!({
                    "janus": "error",
                    "transaction": req["transaction"].clone(),
                    "session_id": 1,
                    "sender": 2,
                    "error": { "code": 460, "reason": "could not detach" }
                })
            })
            .await;
        })
    };

    let session = connection.create(Some(0)).await.unwrap();
    let handle = session.attach("janus.plugin.echotest", None).await.unwrap();
    let mut handle_events = handle.subscribe();

    handle.detach().await.expect("detach swallows server errors");
    assert!(handle.detached());
    assert!(matches!(
        handle_events.recv().await.unwrap(),
        HandleEvent::Detached { id: 2 }
    ));
    let err = handle.detach().await.unwrap_err();
    assert!(matches!(err, Error::HandleDetached));
    responder.await.unwrap();
}

#[tokio::test]
async fn attach_requires_a_plugin_id() {
    let (server, connection) = open_mock().await;
    let session = create_session(&server, &connection, 1, 0).await;
    let err = session.attach("", None).await.unwrap_err();
    assert!(matches!(err, Error::MissingArgument("plugin")));
}
