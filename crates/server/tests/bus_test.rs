//! End-to-end bus tests over real loopback TCP
//!
//! Each test starts its own server on an ephemeral port and drives it with
//! real bus clients (and, where the client library would get in the way of
//! a misbehaving peer, a raw protocol speaker).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use tagbus_client::{BusClient, ClientConfig, Registry, TagKind, TagValue};
use tagbus_protocol::{
    value_payload, Command, Framer, Message, BUS_TAG, DEFAULT_TUS,
};
use tagbus_server::{BusServer, ServerConfig};

/// Start a server on an ephemeral loopback port, return the port
async fn start_server(cancel: &CancellationToken) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = BusServer::new(ServerConfig::default());
    let cancel = cancel.clone();
    tokio::spawn(async move {
        server.run_on(listener, cancel).await.unwrap();
    });
    port
}

/// Attach a client to a registry and spawn it
fn spawn_client(registry: &Registry, port: u16, cancel: &CancellationToken) {
    let client = BusClient::new(registry, ClientConfig::with_port(port)).unwrap();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        client.run(cancel).await.unwrap();
    });
}

/// Poll `cond` every 10 ms until it holds or 5 s elapse
async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A bare protocol speaker, for driving the server without the client
/// library's manners
struct RawBus {
    stream: TcpStream,
    framer: Framer,
    read_buf: BytesMut,
    conn_id: u16,
    tus: usize,
}

impl RawBus {
    /// Connect and complete the hello
    async fn connect(port: u16) -> Self {
        Self::connect_with_tus(port, DEFAULT_TUS).await
    }

    async fn connect_with_tus(port: u16, proposed: usize) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut raw = Self {
            stream,
            framer: Framer::new(DEFAULT_TUS),
            read_buf: BytesMut::with_capacity(64 * 1024),
            conn_id: 0,
            tus: DEFAULT_TUS,
        };
        raw.send(Message::new(
            Command::Id,
            0,
            proposed as u64,
            0,
            Bytes::copy_from_slice(BUS_TAG.as_bytes()),
        ))
        .await;
        loop {
            let msg = raw.recv().await;
            if msg.command == Command::Id && msg.payload == BUS_TAG.as_bytes() && msg.bus_id != 0
            {
                raw.conn_id = msg.bus_id;
                raw.tus = msg.time_us as usize;
                return raw;
            }
        }
    }

    async fn send(&mut self, message: Message) {
        let mut buf = BytesMut::new();
        message.encode_into(self.tus, &mut buf);
        self.stream.write_all(&buf).await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        timeout(Duration::from_secs(5), async {
            loop {
                if let Some(message) = self.framer.next(&mut self.read_buf).unwrap() {
                    return message;
                }
                let n = self.stream.read_buf(&mut self.read_buf).await.unwrap();
                assert!(n > 0, "server closed the connection");
            }
        })
        .await
        .expect("timed out waiting for a frame")
    }

    /// Declare a tag name and wait for its id
    async fn declare(&mut self, name: &str) -> u16 {
        self.send(Message::new(
            Command::Id,
            0,
            0,
            0,
            Bytes::copy_from_slice(name.as_bytes()),
        ))
        .await;
        loop {
            let msg = self.recv().await;
            if msg.command == Command::Id && msg.payload == name.as_bytes() {
                return msg.tag_id;
            }
        }
    }
}

// =============================================================================
// Fan-out and loop suppression
// =============================================================================

#[tokio::test]
async fn test_set_fans_out_and_author_sees_no_echo() {
    let cancel = CancellationToken::new();
    let port = start_server(&cancel).await;

    let reg_a = Registry::new();
    let int_a = reg_a.tag("IntVal", TagKind::Int).unwrap();
    let a_fires = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&a_fires);
    int_a.add_callback(0, move |_| {
        seen.fetch_add(1, Ordering::Relaxed);
    });
    spawn_client(&reg_a, port, &cancel);

    let reg_b = Registry::new();
    let int_b = reg_b.tag("IntVal", TagKind::Int).unwrap();
    spawn_client(&reg_b, port, &cancel);

    wait_until("both clients registered", || int_a.id() != 0 && int_b.id() != 0).await;

    int_a.set_at(7, 1_000_000).unwrap();

    wait_until("B observes the update", || {
        int_b.value() == Some(TagValue::Int(7))
    })
    .await;
    assert_eq!(int_b.time_us(), 1_000_000);
    assert_ne!(int_b.bus_id(), 0, "change must carry the remote author id");

    // Quiescence: the author's callback fired exactly once, for the local
    // write - its own SET never came back.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a_fires.load(Ordering::Relaxed), 1);

    cancel.cancel();
}

#[tokio::test]
async fn test_name_id_assignment_agrees_across_clients() {
    let cancel = CancellationToken::new();
    let port = start_server(&cancel).await;

    let reg_a = Registry::new();
    let reg_b = Registry::new();
    let names = ["Pump1", "Pump2", "Valve1", "Valve2"];
    let tags_a: Vec<_> = names
        .iter()
        .map(|n| reg_a.tag(n, TagKind::Float).unwrap())
        .collect();
    let tags_b: Vec<_> = names
        .iter()
        .map(|n| reg_b.tag(n, TagKind::Float).unwrap())
        .collect();
    spawn_client(&reg_a, port, &cancel);
    spawn_client(&reg_b, port, &cancel);

    wait_until("every tag registered on both sides", || {
        tags_a.iter().all(|t| t.id() != 0) && tags_b.iter().all(|t| t.id() != 0)
    })
    .await;

    let mut ids = Vec::new();
    for (a, b) in tags_a.iter().zip(&tags_b) {
        assert_eq!(a.id(), b.id(), "clients disagree on {}", a.name());
        ids.push(a.id());
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), names.len(), "tag ids must be unique");

    cancel.cancel();
}

// =============================================================================
// Stale writes
// =============================================================================

#[tokio::test]
async fn test_server_drops_stale_set() {
    let cancel = CancellationToken::new();
    let port = start_server(&cancel).await;

    let reg_b = Registry::new();
    let int_b = reg_b.tag("IntVal", TagKind::Int).unwrap();
    spawn_client(&reg_b, port, &cancel);

    let mut raw = RawBus::connect(port).await;
    let tag_id = raw.declare("IntVal").await;

    raw.send(Message::new(
        Command::Set,
        tag_id,
        1_000_000,
        0,
        value_payload(&TagValue::Int(7)),
    ))
    .await;
    wait_until("B observes 7", || int_b.value() == Some(TagValue::Int(7))).await;

    // An earlier-stamped write must vanish without a trace
    raw.send(Message::new(
        Command::Set,
        tag_id,
        500_000,
        0,
        value_payload(&TagValue::Int(9)),
    ))
    .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(int_b.value(), Some(TagValue::Int(7)));
    assert_eq!(int_b.time_us(), 1_000_000);

    cancel.cancel();
}

// =============================================================================
// Late subscription
// =============================================================================

#[tokio::test]
async fn test_late_subscriber_gets_current_value_unsolicited() {
    let cancel = CancellationToken::new();
    let port = start_server(&cancel).await;

    let reg_a = Registry::new();
    let int_a = reg_a.tag("IntVal", TagKind::Int).unwrap();
    spawn_client(&reg_a, port, &cancel);
    wait_until("A registered", || int_a.id() != 0).await;
    int_a.set_at(7, 1_000_000).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // C arrives long after the write and never asks for the value
    let reg_c = Registry::new();
    let int_c = reg_c.tag("IntVal", TagKind::Int).unwrap();
    spawn_client(&reg_c, port, &cancel);

    wait_until("C receives the stored value", || {
        int_c.value() == Some(TagValue::Int(7))
    })
    .await;
    assert_eq!(int_c.time_us(), 1_000_000);
    assert_ne!(int_c.bus_id(), 0);

    cancel.cancel();
}

// =============================================================================
// Reconnect / re-registration
// =============================================================================

#[tokio::test]
async fn test_restarted_author_reregisters_and_publishes() {
    let cancel = CancellationToken::new();
    let port = start_server(&cancel).await;

    let cancel_a = CancellationToken::new();
    let reg_a = Registry::new();
    let int_a = reg_a.tag("IntVal", TagKind::Int).unwrap();
    spawn_client(&reg_a, port, &cancel_a);

    let reg_b = Registry::new();
    let int_b = reg_b.tag("IntVal", TagKind::Int).unwrap();
    spawn_client(&reg_b, port, &cancel);

    wait_until("initial registration", || int_a.id() != 0 && int_b.id() != 0).await;
    int_a.set_at(7, 1_000_000).unwrap();
    wait_until("B observes 7", || int_b.value() == Some(TagValue::Int(7))).await;
    let first_author = int_b.bus_id();

    // "Restart" A: tear the whole client down, then come back fresh
    cancel_a.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reg_a2 = Registry::new();
    let int_a2 = reg_a2.tag("IntVal", TagKind::Int).unwrap();
    spawn_client(&reg_a2, port, &cancel);
    wait_until("A' registered", || int_a2.id() != 0).await;

    int_a2.set_at(11, 2_000_000).unwrap();
    wait_until("B observes 11", || int_b.value() == Some(TagValue::Int(11))).await;
    assert_eq!(int_b.time_us(), 2_000_000);
    assert_ne!(int_b.bus_id(), first_author, "a new connection id authors now");

    cancel.cancel();
}

// =============================================================================
// Request-to-author
// =============================================================================

#[tokio::test]
async fn test_rta_round_trip_with_cookie_prefixed_reply() {
    let cancel = CancellationToken::new();
    let port = start_server(&cancel).await;

    // A authors __history__ and serves requests for it
    let reg_a = Registry::new();
    let hist_a = reg_a.tag("__history__", TagKind::Bytes).unwrap();
    hist_a
        .set_rta_handler(|tag, request| {
            let TagValue::Json(request) = request else {
                return;
            };
            let rta_id = request["__rta_id__"].as_u64().unwrap_or(0) as u16;
            let mut blob = rta_id.to_be_bytes().to_vec();
            blob.extend_from_slice(b"history-blob");
            tag.set(blob).unwrap();
        })
        .unwrap();
    spawn_client(&reg_a, port, &cancel);
    wait_until("A registered", || hist_a.id() != 0).await;
    hist_a.set(vec![0u8, 0u8]).unwrap(); // become the author

    let reg_b = Registry::new();
    let hist_b = reg_b.tag("__history__", TagKind::Bytes).unwrap();
    spawn_client(&reg_b, port, &cancel);
    wait_until("B sees the authored value", || hist_b.value().is_some()).await;

    let cookie = hist_b
        .rta(TagValue::Json(json!({
            "start": 0,
            "end": 10,
            "__rta_id__": 42,
        })))
        .unwrap();
    assert_eq!(cookie, 42, "explicit cookie is preserved");

    wait_until("B receives the cookie-prefixed blob", || {
        matches!(
            hist_b.value(),
            Some(TagValue::Bytes(b)) if b.starts_with(&[0x00, 0x2a])
        )
    })
    .await;
    if let Some(TagValue::Bytes(blob)) = hist_b.value() {
        assert_eq!(&blob[2..], b"history-blob");
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_rta_to_unauthored_tag_is_an_error() {
    let cancel = CancellationToken::new();
    let port = start_server(&cancel).await;

    let mut raw = RawBus::connect(port).await;
    let tag_id = raw.declare("Orphan").await;

    raw.send(Message::new(
        Command::Rta,
        tag_id,
        0,
        0,
        value_payload(&TagValue::Json(json!({"q": 1}))),
    ))
    .await;

    loop {
        let msg = raw.recv().await;
        if msg.command == Command::Err {
            assert_eq!(msg.tag_id, tag_id);
            break;
        }
    }

    cancel.cancel();
}

// =============================================================================
// Fragmentation
// =============================================================================

#[tokio::test]
async fn test_two_mebibyte_payload_survives_the_bus() {
    let cancel = CancellationToken::new();
    let port = start_server(&cancel).await;

    let reg_a = Registry::new();
    let hist_a = reg_a.tag("__history__", TagKind::Bytes).unwrap();
    spawn_client(&reg_a, port, &cancel);

    let reg_b = Registry::new();
    let hist_b = reg_b.tag("__history__", TagKind::Bytes).unwrap();
    spawn_client(&reg_b, port, &cancel);

    wait_until("registered", || hist_a.id() != 0 && hist_b.id() != 0).await;

    let blob: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = Bytes::from(blob.clone());
    hist_a.set(blob).unwrap();

    wait_until("B reassembles the blob", || {
        matches!(hist_b.value(), Some(TagValue::Bytes(ref b)) if *b == expected)
    })
    .await;

    cancel.cancel();
}

// =============================================================================
// Error replies and snapshots, at the wire level
// =============================================================================

#[tokio::test]
async fn test_set_to_unknown_tag_id_gets_err() {
    let cancel = CancellationToken::new();
    let port = start_server(&cancel).await;

    let mut raw = RawBus::connect(port).await;
    raw.send(Message::new(
        Command::Set,
        999,
        1,
        0,
        value_payload(&TagValue::Int(1)),
    ))
    .await;

    loop {
        let msg = raw.recv().await;
        if msg.command == Command::Err {
            assert_eq!(msg.tag_id, 999);
            break;
        }
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_get_on_unset_tag_returns_empty_set() {
    let cancel = CancellationToken::new();
    let port = start_server(&cancel).await;

    let mut raw = RawBus::connect(port).await;
    let tag_id = raw.declare("FreshTag").await;

    raw.send(Message::new(Command::Get, tag_id, 0, 0, Bytes::new()))
        .await;
    loop {
        let msg = raw.recv().await;
        if msg.command == Command::Set && msg.tag_id == tag_id {
            assert!(msg.payload.is_empty(), "unset tag must answer null");
            assert_eq!(msg.time_us, 0);
            break;
        }
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_hello_negotiates_a_smaller_tus() {
    let cancel = CancellationToken::new();
    let port = start_server(&cancel).await;

    // This peer only wants 1000-byte frames; the server must honour that
    // when replying, and the value still arrives intact.
    let mut small = RawBus::connect_with_tus(port, 1000).await;
    assert_eq!(small.tus, 1000);
    assert_ne!(small.conn_id, 0);

    let tag_id = small.declare("WideValue").await;
    small
        .send(Message::new(Command::Sub, tag_id, 0, 0, Bytes::new()))
        .await;

    let mut other = RawBus::connect(port).await;
    let other_tag = other.declare("WideValue").await;
    assert_eq!(other_tag, tag_id);

    let wide = TagValue::Bytes(Bytes::from(vec![7u8; 5000]));
    other
        .send(Message::new(
            Command::Set,
            tag_id,
            1_000,
            0,
            value_payload(&wide),
        ))
        .await;

    loop {
        let msg = small.recv().await;
        if msg.command == Command::Set && msg.tag_id == tag_id && !msg.payload.is_empty() {
            assert_eq!(msg.payload.len(), 5000 + 5, "kind byte + length + body");
            assert_eq!(msg.bus_id, other.conn_id);
            break;
        }
    }

    cancel.cancel();
}
