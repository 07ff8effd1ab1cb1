#![cfg(not(target_arch = "wasm32"))]
//! End-to-end flows against a local mock broker, grounded in the teacher's
//! `tests/it/ws_errors.rs` (a local `tokio-tungstenite::accept_async`
//! server standing in for a real counterparty).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eftl::{Client, ClientOptions, SubscriptionOptions};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage, WebSocketStream};

/// Binds an ephemeral local port and returns its `ws://` URL plus the
/// listener, so the caller can drive the accepted stream itself.
async fn bind() -> (String, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().unwrap();
    (format!("ws://{addr}"), listener)
}

async fn accept_one(listener: TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.expect("accept");
    accept_async(stream).await.expect("ws handshake")
}

/// Like [`accept_one`] but takes the listener by reference, so a test that
/// drives a transport loss + reconnect can accept a second connection on the
/// same bound port.
async fn accept_one_ref(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.expect("accept");
    accept_async(stream).await.expect("ws handshake")
}

async fn read_frame(ws: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        match ws.next().await.expect("stream ended").expect("ws error") {
            WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

async fn send_frame(ws: &mut WebSocketStream<TcpStream>, value: Value) {
    ws.send(WsMessage::Text(value.to_string())).await.expect("send");
}

async fn expect_login_and_welcome(ws: &mut WebSocketStream<TcpStream>) {
    let login = read_frame(ws).await;
    assert_eq!(login["op"], 1);
    send_frame(ws, json!({"op": 2, "client_id": "client-1", "protocol": 2, "max_size": 65536, "timeout": 30})).await;
}

#[tokio::test]
async fn publish_completes_on_matching_ack() {
    let (url, listener) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept_one(listener).await;
        expect_login_and_welcome(&mut ws).await;
        let publish = read_frame(&mut ws).await;
        assert_eq!(publish["op"], 8);
        let seq = publish["seq"].as_u64().unwrap();
        send_frame(&mut ws, json!({"op": 9, "seq": seq})).await;
        // Keep the socket open until the test drops the client.
        let _ = ws.next().await;
    });

    let client = Client::connect(&url, ClientOptions::new(), None, None).await.unwrap();
    client.publish(json!({"hello": "world"})).await.unwrap();
    client.disconnect().await;
    server.abort();
}

#[tokio::test]
async fn publish_fails_when_not_connected() {
    // No server at all: the very first connect attempt fails, so there is
    // no live Client to construct. Exercise NotConnected via a disconnected
    // session instead of a never-connected one.
    let (url, listener) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept_one(listener).await;
        expect_login_and_welcome(&mut ws).await;
        let _ = ws.next().await;
    });

    let client = Client::connect(&url, ClientOptions::new(), None, None).await.unwrap();
    client.disconnect().await;
    let err = client.publish(json!({})).await.unwrap_err();
    assert!(matches!(err, eftl::EftlError::NotConnected));
    server.abort();
}

#[tokio::test]
async fn subscribe_failure_is_returned_to_the_caller() {
    let (url, listener) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept_one(listener).await;
        expect_login_and_welcome(&mut ws).await;
        let subscribe = read_frame(&mut ws).await;
        assert_eq!(subscribe["op"], 3);
        let id = subscribe["id"].as_str().unwrap().to_string();
        send_frame(&mut ws, json!({"op": 6, "id": id, "err": 21, "reason": "not authorized"})).await;
        let _ = ws.next().await;
    });

    let client = Client::connect(&url, ClientOptions::new(), None, None).await.unwrap();
    let result = client.subscribe(Some("true".to_string()), SubscriptionOptions::default(), Arc::new(|_| {})).await;
    assert!(result.is_err());
    client.disconnect().await;
    server.abort();
}

#[tokio::test]
async fn subscribed_message_is_delivered_and_auto_acked() {
    let (url, listener) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept_one(listener).await;
        expect_login_and_welcome(&mut ws).await;
        let subscribe = read_frame(&mut ws).await;
        let id = subscribe["id"].as_str().unwrap().to_string();
        send_frame(&mut ws, json!({"op": 4, "id": id})).await;
        send_frame(&mut ws, json!({"op": 7, "id": id, "seq": 1, "body": {"text": "hi"}})).await;

        // Auto ack mode should send an ack back for sequence 1.
        let ack = read_frame(&mut ws).await;
        assert_eq!(ack["op"], 9);
        assert_eq!(ack["seq"], 1);
        let _ = ws.next().await;
    });

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_clone = received.clone();
    let client = Client::connect(&url, ClientOptions::new(), None, None).await.unwrap();
    client
        .subscribe(
            Some("true".to_string()),
            SubscriptionOptions::default(),
            Arc::new(move |msg| received_clone.lock().unwrap().push(msg.get_string("text").map(str::to_string))),
        )
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("message delivered");

    assert_eq!(received.lock().unwrap()[0].as_deref(), Some("hi"));
    client.disconnect().await;
    server.abort();
}

#[tokio::test]
async fn send_request_times_out_and_unregisters_the_ledger_entry() {
    let (url, listener) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept_one(listener).await;
        expect_login_and_welcome(&mut ws).await;
        // Never reply to the REQUEST frame.
        let _ = ws.next().await;
    });

    let client = Client::connect(&url, ClientOptions::new(), None, None).await.unwrap();
    let err = client.send_request(json!({"q": 1}), Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(err, eftl::EftlError::Timeout));
    client.disconnect().await;
    server.abort();
}

#[tokio::test]
async fn heartbeat_before_welcome_is_echoed() {
    let (url, listener) = bind().await;
    let acked = Arc::new(AtomicU64::new(0));
    let acked_clone = acked.clone();
    let server = tokio::spawn(async move {
        let mut ws = accept_one(listener).await;
        let login = read_frame(&mut ws).await;
        assert_eq!(login["op"], 1);

        send_frame(&mut ws, json!({"op": 0, "id": "hb-1"})).await;
        let echoed = read_frame(&mut ws).await;
        assert_eq!(echoed["op"], 0);
        assert_eq!(echoed["id"], "hb-1");
        acked_clone.store(1, Ordering::SeqCst);

        send_frame(&mut ws, json!({"op": 2, "client_id": "client-1", "protocol": 2, "max_size": 65536})).await;
        let _ = ws.next().await;
    });

    let client = Client::connect(&url, ClientOptions::new(), None, None).await.unwrap();
    assert_eq!(acked.load(Ordering::SeqCst), 1);
    client.disconnect().await;
    server.abort();
}

/// S2: a publish issued while RECONNECTING must not fail with `NotConnected`
/// — its ledger entry has to ride out the reconnect and complete once the
/// resend lands on the new connection and gets acked.
#[tokio::test]
async fn reconnect_resends_pending_publish_after_transport_loss() {
    let (url, listener) = bind().await;
    let server = tokio::spawn(async move {
        {
            let mut ws = accept_one_ref(&listener).await;
            expect_login_and_welcome(&mut ws).await;
            // Drop the transport to force the session into RECONNECTING.
            ws.close(None).await.ok();
        }

        let mut ws = accept_one_ref(&listener).await;
        expect_login_and_welcome(&mut ws).await;
        let publish = read_frame(&mut ws).await;
        assert_eq!(publish["op"], 8);
        let seq = publish["seq"].as_u64().unwrap();
        send_frame(&mut ws, json!({"op": 9, "seq": seq})).await;
        let _ = ws.next().await;
    });

    let client = Client::connect(&url, ClientOptions::new(), None, None).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if client.state().await == eftl::ConnectionState::Reconnecting {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session entered reconnecting");

    tokio::time::timeout(Duration::from_secs(5), client.publish(json!({"hello": "again"})))
        .await
        .expect("publish did not hang while reconnecting")
        .expect("publish issued while reconnecting must not fail with NotConnected");

    client.disconnect().await;
    server.abort();
}

/// S3: the same sequence delivered twice on one connection is deduped (only
/// the first delivery reaches the callback), but a non-resuming reconnect
/// resets that dedup state, so a replay of the same sequence after
/// reconnecting is delivered again rather than dropped.
#[tokio::test]
async fn dedup_drops_repeat_delivery_then_allows_replay_after_non_resuming_reconnect() {
    let (url, listener) = bind().await;
    let server = tokio::spawn(async move {
        let subscribe_id;
        {
            let mut ws = accept_one_ref(&listener).await;
            expect_login_and_welcome(&mut ws).await;
            let subscribe = read_frame(&mut ws).await;
            subscribe_id = subscribe["id"].as_str().unwrap().to_string();
            send_frame(&mut ws, json!({"op": 4, "id": subscribe_id})).await;

            send_frame(&mut ws, json!({"op": 7, "id": subscribe_id, "seq": 5, "body": {"n": 1}})).await;
            let ack = read_frame(&mut ws).await;
            assert_eq!(ack["seq"], 5);

            // Same sequence again, same connection: must be deduped, so no
            // second ack follows it.
            send_frame(&mut ws, json!({"op": 7, "id": subscribe_id, "seq": 5, "body": {"n": 2}})).await;

            ws.close(None).await.ok();
        }

        let mut ws = accept_one_ref(&listener).await;
        let login = read_frame(&mut ws).await;
        assert_eq!(login["op"], 1);
        send_frame(&mut ws, json!({"op": 2, "client_id": "client-1", "protocol": 2, "max_size": 65536, "timeout": 30})).await;

        let resubscribe = read_frame(&mut ws).await;
        assert_eq!(resubscribe["op"], 3);
        assert_eq!(resubscribe["id"], subscribe_id);
        send_frame(&mut ws, json!({"op": 4, "id": subscribe_id})).await;

        // WELCOME above carried no `_resume`, so the same sequence is
        // deliverable again.
        send_frame(&mut ws, json!({"op": 7, "id": subscribe_id, "seq": 5, "body": {"n": 3}})).await;
        let ack = read_frame(&mut ws).await;
        assert_eq!(ack["seq"], 5);
        let _ = ws.next().await;
    });

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let delivered_clone = delivered.clone();
    let client = Client::connect(&url, ClientOptions::new(), None, None).await.unwrap();
    client
        .subscribe(
            Some("true".to_string()),
            SubscriptionOptions::default(),
            Arc::new(move |msg| delivered_clone.lock().unwrap().push(msg.get_i64("n"))),
        )
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if delivered.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("replay delivered after reconnect");

    assert_eq!(*delivered.lock().unwrap(), vec![Some(1), Some(3)]);
    client.disconnect().await;
    server.abort();
}

#[tokio::test]
async fn kv_map_set_get_remove_round_trip() {
    let (url, listener) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept_one(listener).await;
        expect_login_and_welcome(&mut ws).await;

        let set = read_frame(&mut ws).await;
        assert_eq!(set["op"], 20);
        assert_eq!(set["map"], "widgets");
        assert_eq!(set["key"], "a");
        let seq = set["seq"].as_u64().unwrap();
        send_frame(&mut ws, json!({"op": 26, "seq": seq})).await;

        let get = read_frame(&mut ws).await;
        assert_eq!(get["op"], 22);
        let seq = get["seq"].as_u64().unwrap();
        send_frame(&mut ws, json!({"op": 26, "seq": seq, "body": {"value": 1}})).await;

        let remove = read_frame(&mut ws).await;
        assert_eq!(remove["op"], 24);
        let seq = remove["seq"].as_u64().unwrap();
        send_frame(&mut ws, json!({"op": 26, "seq": seq})).await;

        let _ = ws.next().await;
    });

    let client = Client::connect(&url, ClientOptions::new(), None, None).await.unwrap();
    let map = client.kv_map("widgets");
    map.set("a", json!(1)).await.unwrap();
    let value = map.get("a").await.unwrap();
    assert_eq!(value.unwrap().get_i64("value"), Some(1));
    map.remove("a").await.unwrap();

    client.disconnect().await;
    server.abort();
}
