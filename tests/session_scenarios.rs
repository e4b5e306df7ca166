//! End-to-end session scenarios (spec.md §8 property 11), driven against an
//! in-process fake server: a real `tokio_tungstenite` WebSocket endpoint
//! bound to a local ephemeral port, since there is no live server in this
//! repository.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use streamdb_sdk::bsatn;
use streamdb_sdk::bsatn::Deserialize;
use streamdb_sdk::connection::{ConnectionState, DbConnection};
use streamdb_sdk::identity::{ConnectionId, Identity};
use streamdb_sdk::protocol::{
    CallReducerFlags, ClientMessage, IdentityToken, InitialSubscription, OneOffQueryResponse, ReducerCallInfo,
    ServerMessage, SubscriptionError, TransactionUpdate, UpdateStatus,
};
use streamdb_sdk::{Config, Error};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

async fn spawn_fake_server() -> (String, tokio::sync::mpsc::UnboundedReceiver<ClientMessage>, FakeServerHandle) {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<ServerMessage>();
    let (raw_tx, mut raw_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut write, mut read) = ws.split();

        // Handshake: immediately hand out an IdentityToken.
        let identity_token = ServerMessage::IdentityToken(IdentityToken {
            identity: Identity::from_bytes_le([7u8; 32]),
            token: "server-issued-token".to_string(),
            connection_id: ConnectionId(123),
        });
        send_server_message(&mut write, &identity_token).await;

        loop {
            tokio::select! {
                frame = read.next() => {
                    match frame {
                        Some(Ok(WsMessage::Binary(bytes))) => {
                            let mut cursor = bsatn::Deserializer::new(&bytes[1..]); // strip compression tag
                            if let Ok(msg) = ClientMessage::deserialize(&mut cursor) {
                                let _ = inbound_tx.send(msg);
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        _ => {}
                    }
                }
                Some(msg) = outbound_rx.recv() => {
                    send_server_message(&mut write, &msg).await;
                }
                Some(raw) = raw_rx.recv() => {
                    if write.send(WsMessage::Binary(raw.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    (format!("ws://{addr}"), inbound_rx, FakeServerHandle { outbound_tx, raw_tx })
}

struct FakeServerHandle {
    outbound_tx: tokio::sync::mpsc::UnboundedSender<ServerMessage>,
    raw_tx: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
}

impl FakeServerHandle {
    fn send(&self, msg: ServerMessage) {
        self.outbound_tx.send(msg).unwrap();
    }

    /// Send a raw frame bypassing the typed envelope, e.g. an unknown
    /// compression tag (§8 property 11's "Compression tag 3" scenario).
    fn send_raw(&self, frame: Vec<u8>) {
        self.raw_tx.send(frame).unwrap();
    }
}

async fn send_server_message<S>(write: &mut S, msg: &ServerMessage)
where
    S: futures::Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Debug,
{
    let mut frame = vec![0u8]; // compression tag: none
    frame.extend(bsatn::to_vec(msg).unwrap());
    write.send(WsMessage::Binary(frame.into())).await.unwrap();
}

#[tokio::test]
async fn connect_then_subscribe_populates_cache_with_initial_snapshot() {
    let (url, mut inbound, server) = spawn_fake_server().await;

    let conn = DbConnection::builder()
        .with_uri(url)
        .with_module_name("m")
        .with_config(Config {
            auto_connect: false,
            ..Config::default()
        })
        .build()
        .await
        .unwrap();
    conn.connect().await.unwrap();

    // Wait for the Connected state (set once IdentityToken arrives).
    for _ in 0..50 {
        if matches!(conn.state().await, ConnectionState::Connected { .. }) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(matches!(conn.state().await, ConnectionState::Connected { .. }));

    let subscribe_task = tokio::spawn({
        let conn = conn.clone();
        async move { conn.subscribe(&["SELECT * FROM t"]).await }
    });

    let ClientMessage::Subscribe(sub) = inbound.recv().await.unwrap() else {
        panic!("expected a Subscribe message");
    };
    assert_eq!(sub.queries, vec!["SELECT * FROM t".to_string()]);

    let row = vec![1u8, 0, 0, 0];
    server.send(ServerMessage::InitialSubscription(InitialSubscription {
        database_update: streamdb_sdk::protocol::DatabaseUpdate {
            tables: vec![streamdb_sdk::protocol::TableUpdate {
                table_id: 1,
                table_name: "t".to_string(),
                num_rows_hint: 1,
                deltas: vec![streamdb_sdk::protocol::CompressableQueryUpdate::Uncompressed(
                    streamdb_sdk::protocol::QueryUpdate {
                        deletes: streamdb_sdk::protocol::BsatnRowList {
                            size_hint: streamdb_sdk::protocol::RowSizeHint::FixedSize(4),
                            rows_data: Bytes::new(),
                        },
                        inserts: streamdb_sdk::protocol::BsatnRowList {
                            size_hint: streamdb_sdk::protocol::RowSizeHint::FixedSize(4),
                            rows_data: Bytes::from(row.clone()),
                        },
                    },
                )],
            }],
        },
        request_id: sub.request_id,
        total_host_execution_duration: streamdb_sdk::identity::TimeDuration(0),
    }));

    subscribe_task.await.unwrap().unwrap();

    assert_eq!(conn.cache().table_row_count("t"), 1);
    assert_eq!(conn.cache().iter_rows("t")[0].as_ref(), row.as_slice());
}

#[tokio::test]
async fn reducer_call_success_and_failure() {
    let (url, mut inbound, server) = spawn_fake_server().await;
    let conn = DbConnection::builder().with_uri(url).with_module_name("m").build().await.unwrap();

    for _ in 0..50 {
        if matches!(conn.state().await, ConnectionState::Connected { .. }) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let call = tokio::spawn({
        let conn = conn.clone();
        async move { conn.call_reducer("add", Bytes::new()).await }
    });
    let ClientMessage::CallReducer(req) = inbound.recv().await.unwrap() else {
        panic!("expected a CallReducer message");
    };
    assert_eq!(req.name, "add");
    assert_eq!(req.flags, CallReducerFlags::FullUpdate);

    server.send(ServerMessage::TransactionUpdate(TransactionUpdate {
        status: UpdateStatus::Committed(Default::default()),
        timestamp: streamdb_sdk::identity::Timestamp(0),
        caller_identity: Identity::ZERO,
        caller_connection_id: ConnectionId(0),
        reducer_call: ReducerCallInfo {
            reducer_name: "add".to_string(),
            reducer_id: 1,
            args: Bytes::new(),
            request_id: req.request_id,
        },
        energy_quanta_used: 0,
        host_execution_duration: streamdb_sdk::identity::TimeDuration(0),
    }));

    let result = call.await.unwrap();
    assert!(result.is_ok());
}

async fn connect_and_wait(conn: &DbConnection) {
    conn.connect().await.unwrap();
    for _ in 0..50 {
        if matches!(conn.state().await, ConnectionState::Connected { .. }) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("never reached Connected state");
}

#[tokio::test]
async fn reducer_call_failure_surfaces_server_message() {
    let (url, mut inbound, server) = spawn_fake_server().await;
    let conn = DbConnection::builder()
        .with_uri(url)
        .with_module_name("m")
        .with_config(Config { auto_connect: false, ..Config::default() })
        .build()
        .await
        .unwrap();
    connect_and_wait(&conn).await;

    let call = tokio::spawn({
        let conn = conn.clone();
        async move { conn.call_reducer("add", Bytes::new()).await }
    });
    let ClientMessage::CallReducer(req) = inbound.recv().await.unwrap() else {
        panic!("expected a CallReducer message");
    };

    server.send(ServerMessage::TransactionUpdate(TransactionUpdate {
        status: UpdateStatus::Failed("nope".to_string()),
        timestamp: streamdb_sdk::identity::Timestamp(0),
        caller_identity: Identity::ZERO,
        caller_connection_id: ConnectionId(0),
        reducer_call: ReducerCallInfo {
            reducer_name: "add".to_string(),
            reducer_id: 1,
            args: Bytes::new(),
            request_id: req.request_id,
        },
        energy_quanta_used: 0,
        host_execution_duration: streamdb_sdk::identity::TimeDuration(0),
    }));

    let err = call.await.unwrap().unwrap_err();
    match err {
        Error::ReducerCallFailed { name, message } => {
            assert_eq!(name, "add");
            assert_eq!(message, "nope");
        }
        other => panic!("expected ReducerCallFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn reducer_call_times_out_when_no_response_arrives() {
    let (url, mut inbound, _server) = spawn_fake_server().await;
    let conn = DbConnection::builder()
        .with_uri(url)
        .with_module_name("m")
        .with_config(Config {
            auto_connect: false,
            reducer_call_timeout: std::time::Duration::from_millis(50),
            ..Config::default()
        })
        .build()
        .await
        .unwrap();
    connect_and_wait(&conn).await;

    let call = tokio::spawn({
        let conn = conn.clone();
        async move { conn.call_reducer("slow", Bytes::new()).await }
    });
    let ClientMessage::CallReducer(_) = inbound.recv().await.unwrap() else {
        panic!("expected a CallReducer message");
    };
    // Never reply: the call must time out on its own.

    let err = call.await.unwrap().unwrap_err();
    match err {
        Error::ReducerTimeout { name, .. } => assert_eq!(name, "slow"),
        other => panic!("expected ReducerTimeout, got {other:?}"),
    }
}

#[tokio::test]
async fn subscription_error_without_request_id_drops_all_subscriptions() {
    let (url, mut inbound, server) = spawn_fake_server().await;
    let conn = DbConnection::builder()
        .with_uri(url)
        .with_module_name("m")
        .with_config(Config { auto_connect: false, ..Config::default() })
        .build()
        .await
        .unwrap();
    connect_and_wait(&conn).await;

    let subscribe_task = tokio::spawn({
        let conn = conn.clone();
        async move { conn.subscribe(&["SELECT * FROM t"]).await }
    });
    let ClientMessage::Subscribe(sub) = inbound.recv().await.unwrap() else {
        panic!("expected a Subscribe message");
    };
    server.send(ServerMessage::InitialSubscription(InitialSubscription {
        database_update: Default::default(),
        request_id: sub.request_id,
        total_host_execution_duration: streamdb_sdk::identity::TimeDuration(0),
    }));
    let handle = subscribe_task.await.unwrap().unwrap();

    // A fatal subscription error with no request id drops every active
    // subscription; the earlier handle is no longer tracked server-side.
    server.send(ServerMessage::SubscriptionError(SubscriptionError {
        request_id: None,
        query_id: None,
        error: "fatal".to_string(),
    }));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // unsubscribe on a dropped handle is a harmless no-op, not an error.
    conn.unsubscribe(handle).await.unwrap();
}

#[tokio::test]
async fn unknown_compression_tag_terminates_receive_loop_and_reconnects() {
    let (url, _inbound, server) = spawn_fake_server().await;
    let conn = DbConnection::builder()
        .with_uri(url)
        .with_module_name("m")
        .with_config(Config {
            auto_connect: false,
            max_reconnect_attempts: 0,
            ..Config::default()
        })
        .build()
        .await
        .unwrap();
    connect_and_wait(&conn).await;

    // Tag 3 is not one of {none, brotli, zlib}: a protocol/codec error that
    // must terminate the receive loop (§7, §8 property 11). With reconnect
    // disabled the session lands in `Disconnected`.
    server.send_raw(vec![3, 1, 2, 3]);
    for _ in 0..50 {
        if matches!(conn.state().await, ConnectionState::Disconnected) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("session did not disconnect after an unknown compression tag");
}

#[tokio::test]
async fn one_off_query_is_correlated_by_message_id_not_request_id() {
    let (url, mut inbound, server) = spawn_fake_server().await;
    let conn = DbConnection::builder()
        .with_uri(url)
        .with_module_name("m")
        .with_config(Config { auto_connect: false, ..Config::default() })
        .build()
        .await
        .unwrap();
    connect_and_wait(&conn).await;

    let call = tokio::spawn({
        let conn = conn.clone();
        async move { conn.one_off_query("SELECT * FROM t").await }
    });
    let ClientMessage::OneOffQuery(req) = inbound.recv().await.unwrap() else {
        panic!("expected a OneOffQuery message");
    };
    assert_eq!(req.query, "SELECT * FROM t");

    server.send(ServerMessage::OneOffQueryResponse(OneOffQueryResponse {
        message_id: req.message_id,
        error: None,
        tables: vec![],
        total_host_execution_duration: streamdb_sdk::identity::TimeDuration(0),
    }));

    let result = call.await.unwrap().unwrap();
    assert!(result.error.is_none());
}
