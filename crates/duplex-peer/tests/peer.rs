use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use duplex_frame::{decode_frame, Frame, Headers};
use duplex_peer::{Channel, ChannelState, JsonCodec, Peer, PeerConfig, Rpc, RpcError};
use duplex_transport::memory::{self, MemoryTransport};
use duplex_transport::{framed, framed_with_config, MessageConfig, MAGIC};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;

const STEP: Duration = Duration::from_secs(5);

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(STEP, fut)
        .await
        .expect("operation should finish in time")
}

fn explode() -> Result<(), RpcError> {
    panic!("handler blew up")
}

fn server_rpc() -> Rpc {
    let mut rpc = Rpc::json();
    rpc.register("echo", |ch: Channel| async move {
        let (value, _last): (Value, bool) = ch.recv().await?;
        ch.send(&value, true)
    })
    .register("count", |ch: Channel| async move {
        let (n, _last): (u32, bool) = ch.recv().await?;
        for i in 0..n {
            ch.send(&i, false)?;
        }
        Ok(())
    })
    .register("fail", |_ch: Channel| async move {
        Err(RpcError::handler("boom"))
    })
    .register("panic", |_ch: Channel| async move { explode() })
    .register("chatty", |ch: Channel| async move {
        ch.send("first", false)?;
        ch.send("second", true)
    })
    .register("header", |ch: Channel| async move {
        let value = ch.headers().get("trace").cloned().unwrap_or_default();
        ch.send(&value, true)
    });
    rpc
}

fn connected(server: &Rpc, client: &Rpc) -> (Peer, Peer) {
    let (a, b) = memory::pair();
    (client.connect(b), server.accept(a))
}

async fn send_raw(transport: &mut MemoryTransport, frame: Frame) {
    transport
        .send(frame.encode().expect("frame should encode"))
        .await
        .expect("raw send should succeed");
}

async fn recv_raw(transport: &mut MemoryTransport) -> Frame {
    let message = within(transport.next())
        .await
        .expect("transport should yield a message")
        .expect("transport read should succeed");
    decode_frame(&message).expect("frame should decode")
}

#[tokio::test]
async fn echo_on_channel_seven() {
    let (server_end, mut raw) = memory::pair();
    let _server = server_rpc().accept(server_end);

    send_raw(
        &mut raw,
        Frame::open(7, "echo")
            .with_payload(Bytes::from_static(b"\"hi\""))
            .with_last(true),
    )
    .await;

    let reply = recv_raw(&mut raw).await;
    assert_eq!(
        reply,
        Frame::data(7, Bytes::from_static(b"\"hi\"")).with_last(true)
    );
}

#[tokio::test]
async fn unknown_method_on_channel_three() {
    let (server_end, mut raw) = memory::pair();
    let server = server_rpc().accept(server_end);

    send_raw(&mut raw, Frame::open(3, "missing")).await;

    let reply = recv_raw(&mut raw).await;
    assert_eq!(reply, Frame::error(3, "unknown method: missing"));
    assert_eq!(server.open_channels(), 0);
    assert!(!server.is_closed());
}

#[tokio::test]
async fn call_returns_echoed_value() {
    let (client, _server) = connected(&server_rpc(), &Rpc::json());
    let reply: String = within(client.call("echo", "hi")).await.unwrap();
    assert_eq!(reply, "hi");

    let reply: Value = within(client.call("echo", &json!({"a": [1, 2]})))
        .await
        .unwrap();
    assert_eq!(reply, json!({"a": [1, 2]}));
    assert_eq!(client.open_channels(), 0);
}

#[tokio::test]
async fn unknown_method_leaves_connection_usable() {
    let (client, _server) = connected(&server_rpc(), &Rpc::json());

    let err = within(client.call::<_, Value>("missing", &()))
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::UnknownMethod("missing".to_string()));

    let reply: String = within(client.call("echo", "still here")).await.unwrap();
    assert_eq!(reply, "still here");
}

#[tokio::test]
async fn transport_close_fails_pending_receives() {
    let (client_end, mut raw) = memory::pair();
    let client = Rpc::with_config(
        JsonCodec,
        PeerConfig {
            call_timeout: None,
            ..PeerConfig::default()
        },
    )
    .connect(client_end);

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.call::<_, Value>("slow", "a").await }
    });
    let second = tokio::spawn({
        let client = client.clone();
        async move { client.call::<_, Value>("slow", "b").await }
    });

    // Both calls are on the wire before the connection drops.
    let mut ids = HashSet::new();
    for _ in 0..2 {
        let open = recv_raw(&mut raw).await;
        assert!(open.is_open());
        ids.insert(open.channel);
    }
    assert_eq!(ids.len(), 2);
    drop(raw);

    assert_eq!(within(first).await.unwrap(), Err(RpcError::TransportClosed));
    assert_eq!(within(second).await.unwrap(), Err(RpcError::TransportClosed));

    within(client.close_notify()).await;
    within(client.close_notify()).await;
    assert!(client.is_closed());
    assert_eq!(client.close_reason(), Some(RpcError::TransportClosed));
    assert_eq!(client.open_channels(), 0);
    assert_eq!(
        client.open("echo").unwrap_err(),
        RpcError::TransportClosed
    );
}

#[tokio::test]
async fn streamed_values_arrive_in_order() {
    let (client, _server) = connected(&server_rpc(), &Rpc::json());

    let ch = client.open("count").unwrap();
    assert_eq!(ch.state(), ChannelState::Opening);
    ch.send(&5u32, true).unwrap();
    assert_eq!(ch.state(), ChannelState::Closing);

    let mut seen = Vec::new();
    loop {
        let (value, last): (Option<u32>, bool) = within(ch.recv()).await.unwrap();
        if last {
            assert!(value.is_none());
            break;
        }
        seen.push(value.expect("non-final frames carry a value"));
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    assert_eq!(ch.state(), ChannelState::Closed);
    within(ch.done()).await.unwrap();
}

#[tokio::test]
async fn unread_channel_does_not_block_others() {
    let (client, _server) = connected(&server_rpc(), &Rpc::json());

    let flood = client.open("count").unwrap();
    flood.send(&500u32, true).unwrap();

    let reply: String = within(client.call("echo", "through")).await.unwrap();
    assert_eq!(reply, "through");

    let (first, _): (Option<u32>, bool) = within(flood.recv()).await.unwrap();
    assert_eq!(first, Some(0));
}

#[tokio::test]
async fn receive_and_send_fail_after_last() {
    let (client, _server) = connected(&server_rpc(), &Rpc::json());

    let ch = client.open("echo").unwrap();
    ch.send("once", true).unwrap();
    let (value, last): (String, bool) = within(ch.recv()).await.unwrap();
    assert_eq!(value, "once");
    assert!(last);

    assert_eq!(
        within(ch.recv::<Value>()).await.unwrap_err(),
        RpcError::ChannelClosed
    );
    assert_eq!(ch.send("again", false).unwrap_err(), RpcError::ChannelClosed);
}

#[tokio::test]
async fn receive_and_send_fail_after_error() {
    let (client, _server) = connected(&server_rpc(), &Rpc::json());

    let ch = client.open("fail").unwrap();
    ch.send(&(), true).unwrap();
    assert_eq!(
        within(ch.recv::<Value>()).await.unwrap_err(),
        RpcError::RemoteError("boom".to_string())
    );
    assert_eq!(
        within(ch.recv::<Value>()).await.unwrap_err(),
        RpcError::ChannelClosed
    );
    assert_eq!(ch.send(&1, false).unwrap_err(), RpcError::ChannelClosed);
    assert_eq!(
        within(ch.done()).await,
        Err(RpcError::RemoteError("boom".to_string()))
    );
}

#[tokio::test]
async fn concurrent_opens_get_unique_ids() {
    let (client, server) = connected(&server_rpc(), &Rpc::json());

    let mut tasks = Vec::new();
    for _ in 0..64 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move { client.open("echo").unwrap() }));
    }
    let mut channels = Vec::new();
    for task in tasks {
        channels.push(task.await.unwrap());
    }

    let ids: HashSet<u32> = channels.iter().map(Channel::id).collect();
    assert_eq!(ids.len(), 64);
    assert!(ids.iter().all(|id| id % 2 == 1), "connector ids are odd");
    assert_eq!(client.open_channels(), 64);

    let server_side = server.open("echo").unwrap();
    assert_eq!(server_side.id() % 2, 0, "acceptor ids are even");

    for ch in &channels {
        ch.close(None);
    }
    assert_eq!(client.open_channels(), 0);
}

#[tokio::test]
async fn handler_error_becomes_remote_error() {
    let (client, server) = connected(&server_rpc(), &Rpc::json());

    let err = within(client.call::<_, Value>("fail", &())).await.unwrap_err();
    assert_eq!(err, RpcError::RemoteError("boom".to_string()));
    assert!(!server.is_closed());
}

#[tokio::test]
async fn handler_panic_is_reported() {
    let (client, server) = connected(&server_rpc(), &Rpc::json());

    let err = within(client.call::<_, Value>("panic", &()))
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::RemoteError("handler panicked".to_string()));

    let reply: String = within(client.call("echo", "alive")).await.unwrap();
    assert_eq!(reply, "alive");
    assert!(!server.is_closed());
}

#[tokio::test]
async fn streaming_reply_to_unary_call_is_rejected() {
    let (client, _server) = connected(&server_rpc(), &Rpc::json());

    let err = within(client.call::<_, String>("chatty", &()))
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::UnexpectedContinuation);
    assert_eq!(client.open_channels(), 0);
}

#[tokio::test]
async fn call_timeout_aborts_remote_handler() {
    let (tx, rx) = oneshot::channel::<Result<(), RpcError>>();
    let tx = Arc::new(Mutex::new(Some(tx)));

    let mut server = server_rpc();
    server.register("slow", move |ch: Channel| {
        let tx = Arc::clone(&tx);
        async move {
            let _request: (Value, bool) = ch.recv().await?;
            let outcome = ch.done().await;
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(outcome);
            }
            Ok(())
        }
    });
    let client_rpc = Rpc::with_config(
        JsonCodec,
        PeerConfig {
            call_timeout: Some(Duration::from_millis(50)),
            ..PeerConfig::default()
        },
    );
    let (client, _server) = connected(&server, &client_rpc);

    let err = within(client.call::<_, Value>("slow", &())).await.unwrap_err();
    assert_eq!(err, RpcError::Timeout(Duration::from_millis(50)));

    let remote_outcome = within(rx).await.unwrap();
    assert_eq!(
        remote_outcome,
        Err(RpcError::RemoteError("call timed out".to_string()))
    );
}

#[tokio::test]
async fn local_close_unblocks_receive() {
    let (client_end, mut raw) = memory::pair();
    let client = Rpc::json().connect(client_end);

    let ch = client.open("slow").unwrap();
    ch.send("req", true).unwrap();
    let open = recv_raw(&mut raw).await;

    let waiter = tokio::spawn({
        let ch = ch.clone();
        async move { ch.recv::<Value>().await }
    });
    tokio::task::yield_now().await;

    ch.close(Some("cancelled"));
    ch.close(Some("cancelled again"));

    assert_eq!(within(waiter).await.unwrap(), Err(RpcError::ChannelClosed));
    assert_eq!(
        within(ch.done()).await,
        Err(RpcError::Aborted("cancelled".to_string()))
    );

    // Exactly one cancel frame reaches the far end.
    let cancel = recv_raw(&mut raw).await;
    assert_eq!(cancel, Frame::error(open.channel, "cancelled"));
    let nothing_more = tokio::time::timeout(Duration::from_millis(50), raw.next()).await;
    assert!(nothing_more.is_err());
}

#[tokio::test]
async fn headers_reach_the_handler() {
    let (client, _server) = connected(&server_rpc(), &Rpc::json());

    let mut headers = Headers::new();
    headers.insert("trace".to_string(), "t-42".to_string());
    let ch = client.open_with_headers("header", headers).unwrap();
    ch.send(&(), true).unwrap();

    let (trace, last): (String, bool) = within(ch.recv()).await.unwrap();
    assert_eq!(trace, "t-42");
    assert!(last);
}

#[tokio::test]
async fn stray_frames_are_discarded() {
    let (server_end, mut raw) = memory::pair();
    let server = server_rpc().accept(server_end);

    send_raw(&mut raw, Frame::data(99, Bytes::from_static(b"1"))).await;
    send_raw(&mut raw, Frame::error(101, "late")).await;
    send_raw(
        &mut raw,
        Frame::open(5, "echo")
            .with_payload(Bytes::from_static(b"2"))
            .with_last(true),
    )
    .await;

    let reply = recv_raw(&mut raw).await;
    assert_eq!(reply.channel, 5);
    assert_eq!(reply.payload.as_ref(), b"2");
    assert!(!server.is_closed());
}

#[tokio::test]
async fn malformed_frame_closes_connection() {
    let (server_end, mut raw) = memory::pair();
    let server = server_rpc().accept(server_end);

    raw.send(Bytes::from_static(b"\x07garbage")).await.unwrap();

    within(server.close_notify()).await;
    assert!(matches!(
        server.close_reason(),
        Some(RpcError::MalformedFrame(_))
    ));
    assert!(within(raw.next()).await.is_none());
}

#[tokio::test]
async fn local_peer_close_notifies_both_ends() {
    let (client, server) = connected(&server_rpc(), &Rpc::json());

    client.close();
    assert!(client.is_closed());
    within(client.close_notify()).await;
    within(server.close_notify()).await;
    assert_eq!(server.close_reason(), Some(RpcError::TransportClosed));
}

#[tokio::test]
async fn either_end_can_call_the_other() {
    let mut client_rpc = Rpc::json();
    client_rpc.register("whoami", |ch: Channel| async move {
        ch.send("client", true)
    });

    let mut server = server_rpc();
    server.register("relay", |ch: Channel| async move {
        let _request: (Value, bool) = ch.recv().await?;
        let name: String = ch.call("whoami", &()).await?;
        ch.send(&format!("relayed {name}"), true)
    });

    let (client, server_peer) = connected(&server, &client_rpc);

    let direct: String = within(server_peer.call("whoami", &())).await.unwrap();
    assert_eq!(direct, "client");

    let relayed: String = within(client.call("relay", &())).await.unwrap();
    assert_eq!(relayed, "relayed client");
}

fn small_messages() -> MessageConfig {
    MessageConfig {
        max_message_size: 256,
    }
}

fn delayed_rpc() -> Rpc {
    let mut server = server_rpc();
    server.register("delayed", |ch: Channel| async move {
        let (value, _last): (Value, bool) = ch.recv().await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        ch.send(&value, true)
    });
    server
}

#[tokio::test]
async fn oversized_frame_fails_only_its_own_channel() {
    let (a, b) = memory::pair_with_config(small_messages());
    let _server = delayed_rpc().accept(a);
    let client = Rpc::json().connect(b);

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.call::<_, String>("delayed", "held").await }
    });

    let big = client.open("echo").unwrap();
    big.send(&"z".repeat(1000), true).unwrap();
    assert!(matches!(within(big.done()).await, Err(RpcError::Encode(_))));

    assert_eq!(within(pending).await.unwrap(), Ok("held".to_string()));
    let reply: String = within(client.call("echo", "after")).await.unwrap();
    assert_eq!(reply, "after");
    assert!(!client.is_closed());
    assert_eq!(client.open_channels(), 0);
}

#[tokio::test]
async fn oversized_send_is_rejected_before_queueing() {
    let (a, b) = memory::pair_with_config(small_messages());
    let _server = delayed_rpc().accept(a);
    let client = Rpc::with_config(
        JsonCodec,
        PeerConfig {
            max_message_size: 256,
            ..PeerConfig::default()
        },
    )
    .connect(b);

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.call::<_, String>("delayed", "held").await }
    });

    let big = client.open("echo").unwrap();
    let err = big.send(&"z".repeat(1000), true).unwrap_err();
    assert!(matches!(err, RpcError::Encode(_)), "{err:?}");
    assert_eq!(big.state(), ChannelState::Opening);
    big.close(None);

    assert_eq!(within(pending).await.unwrap(), Ok("held".to_string()));
    assert!(!client.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_closes_send_one_terminal_frame() {
    let (client_end, mut raw) = memory::pair();
    let client = Rpc::json().connect(client_end);

    for _ in 0..50 {
        let ch = client.open("echo").unwrap();
        ch.send(&1, false).unwrap();
        let open = recv_raw(&mut raw).await;
        assert_eq!(open.channel, ch.id());

        let closers: Vec<_> = (0..4)
            .map(|_| {
                let ch = ch.clone();
                tokio::spawn(async move { ch.close(None) })
            })
            .collect();
        for closer in closers {
            within(closer).await.unwrap();
        }
        assert_eq!(ch.send(&2, true).unwrap_err(), RpcError::ChannelClosed);

        let marker = client.open("marker").unwrap();
        marker.send(&(), true).unwrap();

        let terminal = recv_raw(&mut raw).await;
        assert_eq!(terminal, Frame::data(ch.id(), Bytes::new()).with_last(true));
        let next = recv_raw(&mut raw).await;
        assert_eq!(next.channel, marker.id(), "a second terminal frame was sent");
        marker.close(Some("done"));
        let _cancel = recv_raw(&mut raw).await;
    }
}

#[tokio::test]
async fn send_last_then_close_ends_a_handler_once() {
    let mut server = server_rpc();
    server.register("reply_then_close", |ch: Channel| async move {
        let _request: (Value, bool) = ch.recv().await?;
        ch.send("only", true)?;
        ch.close(None);
        ch.close(Some("ignored"));
        Ok(())
    });
    let (server_end, mut raw) = memory::pair();
    let _server = server.accept(server_end);

    send_raw(&mut raw, Frame::open(9, "reply_then_close").with_last(true)).await;
    send_raw(&mut raw, Frame::open(11, "echo").with_last(true)).await;

    let mut replies = Vec::new();
    for _ in 0..2 {
        replies.push(recv_raw(&mut raw).await);
    }
    let nothing_more = tokio::time::timeout(Duration::from_millis(50), raw.next()).await;
    assert!(nothing_more.is_err());

    let for_nine: Vec<_> = replies.iter().filter(|f| f.channel == 9).collect();
    assert_eq!(for_nine.len(), 1);
    assert_eq!(
        *for_nine[0],
        Frame::data(9, Bytes::from_static(b"\"only\"")).with_last(true)
    );
}

#[tokio::test]
async fn corrupt_envelope_is_a_malformed_frame() {
    let (peer_io, mut raw_io) = tokio::io::duplex(1024);
    let server = server_rpc().accept(framed(peer_io));

    raw_io.write_all(b"XY\x00\x00\x00\x00").await.unwrap();

    within(server.close_notify()).await;
    assert!(matches!(
        server.close_reason(),
        Some(RpcError::MalformedFrame(_))
    ));
}

#[tokio::test]
async fn oversized_inbound_message_is_a_malformed_frame() {
    let (peer_io, mut raw_io) = tokio::io::duplex(1024);
    let server = server_rpc().accept(framed_with_config(peer_io, small_messages()));

    raw_io.write_all(&MAGIC).await.unwrap();
    raw_io.write_all(&1000u32.to_le_bytes()).await.unwrap();

    within(server.close_notify()).await;
    assert!(matches!(
        server.close_reason(),
        Some(RpcError::MalformedFrame(_))
    ));
}
