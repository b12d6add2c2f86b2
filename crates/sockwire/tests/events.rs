use std::time::Duration;

use bytes::Bytes;
use sockwire::{
    AckError, SendError, SocketError, Value,
    handler::Message,
    socket::{DisconnectReason, SocketRef},
};
use tokio::sync::mpsc;

use fixture::{WsClient, create_server};

#[tokio::test]
async fn echo_event() {
    let (engine, io) = create_server();
    io.ns("/", |socket: SocketRef, _| {
        socket.on("chat", |socket: SocketRef, msg: Message| {
            let text: String = msg.data().unwrap();
            socket.emit("chat-ack", &text).unwrap();
        });
    });

    let (mut client, _) = WsClient::connect_ns(&engine, "/").await;
    client.send(r#"42["chat","hi"]"#).await;
    assert_eq!(client.recv().await, r#"42["chat-ack","hi"]"#);
}

#[tokio::test]
async fn event_with_several_args() {
    let (engine, io) = create_server();
    io.ns("/", |socket: SocketRef, _| {
        socket.on("sum", |socket: SocketRef, msg: Message| {
            let (a, b): (i64, i64) = msg.data().unwrap();
            socket.emit("sum", &(a, b, a + b)).unwrap();
        });
        socket.on("nothing", |socket: SocketRef, _: Message| {
            socket.emit("nothing", &()).unwrap();
        });
    });

    let (mut client, _) = WsClient::connect_ns(&engine, "/").await;
    client.send(r#"42["sum",1,2]"#).await;
    assert_eq!(client.recv().await, r#"42["sum",1,2,3]"#);
    client.send(r#"42["nothing"]"#).await;
    assert_eq!(client.recv().await, r#"42["nothing"]"#);
}

#[tokio::test]
async fn client_ack() {
    let (engine, io) = create_server();
    io.ns("/", |socket: SocketRef, _| {
        socket.on("ack", |_: SocketRef, msg: Message| {
            let ack = msg.ack.unwrap();
            assert_eq!(ack.ack_id(), 7);
            ack.send(&msg.args[0]).unwrap();
        });
    });

    let (mut client, _) = WsClient::connect_ns(&engine, "/").await;
    client.send(r#"427["ack",{"a":1}]"#).await;
    assert_eq!(client.recv().await, r#"437[{"a":1}]"#);
}

#[tokio::test]
async fn namespaced_ack() {
    let (engine, io) = create_server();
    io.ns("/admin", |socket: SocketRef, _| {
        socket.on("ping", |_: SocketRef, msg: Message| {
            msg.ack.unwrap().send("pong").unwrap();
        });
    });

    let (mut client, _) = WsClient::connect_ns(&engine, "/admin").await;
    client.send(r#"42/admin,12["ping"]"#).await;
    assert_eq!(client.recv().await, r#"43/admin,12["pong"]"#);
}

#[tokio::test]
async fn server_emit_with_ack() {
    let (engine, io) = create_server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    io.ns("/", move |socket: SocketRef, _| {
        let tx = tx.clone();
        let ack = socket.emit_with_ack::<_, String>("question", "?").unwrap();
        tokio::spawn(async move {
            tx.send(ack.await.unwrap()).unwrap();
        });
    });

    let (mut client, _) = WsClient::connect_ns(&engine, "/").await;
    assert_eq!(client.recv().await, r#"421["question","?"]"#);
    client.send(r#"431["answer"]"#).await;
    assert_recv!(rx, "answer".to_string());

    // A second ack for the same id is ignored
    client.send(r#"431["again"]"#).await;
    client.assert_silent().await;
}

#[tokio::test(start_paused = true)]
async fn server_ack_timeout() {
    let (engine, io) = create_server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    io.ns("/", move |socket: SocketRef, _| {
        let tx = tx.clone();
        let ack = socket.emit_with_ack::<_, String>("question", "?").unwrap();
        tokio::spawn(async move {
            tx.send(ack.await.unwrap_err()).unwrap();
        });
    });

    let (mut client, _) = WsClient::connect_ns(&engine, "/").await;
    assert_eq!(client.recv().await, r#"421["question","?"]"#);
    tokio::time::sleep(Duration::from_secs(6)).await;
    match rx.recv().await {
        Some(AckError::Timeout) => {}
        res => panic!("expected a timeout, got {res:?}"),
    }
}

#[tokio::test]
async fn binary_event() {
    let (engine, io) = create_server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    io.ns("/", move |socket: SocketRef, _| {
        let tx = tx.clone();
        socket.on("upload", move |socket: SocketRef, msg: Message| {
            tx.send(msg.args.clone()).unwrap();
            socket
                .emit("download", &Bytes::from_static(&[4, 5, 6]))
                .unwrap();
        });
    });

    let (mut client, _) = WsClient::connect_ns(&engine, "/").await;
    client
        .send(r#"451-["upload","name",{"_placeholder":true,"num":0}]"#)
        .await;
    // The event is only handled once the attachment is received
    client.assert_silent().await;
    assert!(rx.try_recv().is_err());

    client.send_bin(&[1, 2, 3]).await;
    assert_recv!(
        rx,
        vec![
            Value::from("name"),
            Value::Binary(Bytes::from_static(&[1, 2, 3]))
        ]
    );
    assert_eq!(
        client.recv().await,
        r#"451-["download",{"_placeholder":true,"num":0}]"#
    );
    assert_eq!(client.recv_bin().await, Bytes::from_static(&[4, 5, 6]));
}

#[tokio::test]
async fn catch_all_and_once_handlers() {
    let (engine, io) = create_server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    io.ns("/", move |socket: SocketRef, _| {
        let tx1 = tx.clone();
        socket.on_any(move |_: SocketRef, msg: &Message| {
            tx1.send(format!("any:{}", msg.event)).unwrap();
        });
        let tx2 = tx.clone();
        socket.once("first", move |_: SocketRef, msg: Message| {
            tx2.send(format!("once:{}", msg.event)).unwrap();
        });
    });

    let (mut client, _) = WsClient::connect_ns(&engine, "/").await;
    client.send(r#"42["first"]"#).await;
    client.send(r#"42["first"]"#).await;
    assert_recv!(rx, "any:first".to_string());
    assert_recv!(rx, "once:first".to_string());
    assert_recv!(rx, "any:first".to_string());
    client.assert_silent().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn invalid_event_closes_session() {
    let (engine, io) = create_server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    io.ns("/", move |socket: SocketRef, _| {
        let tx = tx.clone();
        socket.on_disconnect(move |_: SocketRef, reason: DisconnectReason| {
            tx.send(reason).unwrap();
        });
    });

    let (mut client, _) = WsClient::connect_ns(&engine, "/").await;
    client.send(r#"42[1,2]"#).await;
    assert_recv!(rx, DisconnectReason::PacketParsingError);
    assert_eq!(client.closed().await.as_deref(), Some("1"));
}

#[tokio::test]
async fn client_disconnect() {
    let (engine, io) = create_server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    io.ns("/", move |socket: SocketRef, _| {
        socket.join("room");
        let tx = tx.clone();
        socket.on_disconnect(move |socket: SocketRef, reason: DisconnectReason| {
            assert!(socket.rooms().is_empty());
            assert!(!socket.connected());
            tx.send(reason).unwrap();
        });
    });

    let (mut client, _) = WsClient::connect_ns(&engine, "/").await;
    let socket = io.sockets().pop().unwrap();
    client.send("41").await;
    assert_recv!(rx, DisconnectReason::ClientNSDisconnect);
    assert!(io.sockets().is_empty());
    assert!(matches!(
        socket.emit("late", "data"),
        Err(SendError::Socket(SocketError::Closed))
    ));

    // The session is still open and can reconnect
    assert_eq!(engine.sessions().len(), 1);
    client.send("40").await;
    assert!(client.recv().await.starts_with(r#"40{"sid":""#));
}

#[tokio::test]
async fn server_disconnect() {
    let (engine, io) = create_server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    io.ns("/", move |socket: SocketRef, _| {
        let tx = tx.clone();
        socket.on_disconnect(move |_: SocketRef, reason: DisconnectReason| {
            tx.send(reason).unwrap();
        });
        socket.on("leave", |socket: SocketRef, _: Message| {
            socket.clone().disconnect().unwrap();
            assert!(socket.disconnect().is_err());
        });
    });

    let (mut client, _) = WsClient::connect_ns(&engine, "/").await;
    client.send(r#"42["leave"]"#).await;
    assert_eq!(client.recv().await, "41");
    assert_recv!(rx, DisconnectReason::ServerNSDisconnect);
    assert!(io.sockets().is_empty());
}

#[tokio::test]
async fn transport_close_disconnects_every_namespace() {
    let (engine, io) = create_server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    for ns in ["/", "/admin"] {
        let tx = tx.clone();
        io.ns(ns, move |socket: SocketRef, _| {
            let tx = tx.clone();
            socket.on_disconnect(move |socket: SocketRef, reason: DisconnectReason| {
                tx.send((socket.ns().to_string(), reason)).unwrap();
            });
        });
    }

    let (mut client, _) = WsClient::connect_ns(&engine, "/").await;
    client.send("40/admin,").await;
    assert!(client.recv().await.starts_with("40/admin,"));

    client.send("1").await;
    let mut reasons = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
    reasons.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        reasons,
        vec![
            ("/".to_string(), DisconnectReason::TransportClose),
            ("/admin".to_string(), DisconnectReason::TransportClose),
        ]
    );
}

#[tokio::test]
async fn server_close() {
    let (engine, io) = create_server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    io.ns("/", move |socket: SocketRef, _| {
        let tx = tx.clone();
        socket.on_disconnect(move |_: SocketRef, reason: DisconnectReason| {
            tx.send(reason).unwrap();
        });
    });

    let (mut client, _) = WsClient::connect_ns(&engine, "/").await;
    io.close();
    assert_recv!(rx, DisconnectReason::ClosingServer);
    assert_eq!(client.closed().await.as_deref(), Some("1"));
    assert!(engine.sessions().is_empty());
}
