use std::time::Duration;

use sockwire::{SocketIo, Value, socket::SocketRef};
use tokio::sync::mpsc;

use fixture::{WsClient, create_server, create_server_with};

#[tokio::test]
async fn connect_main_namespace() {
    let (engine, io) = create_server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    io.ns("/", move |socket: SocketRef, auth| {
        tx.send((socket.id.to_string(), auth)).unwrap();
    });

    let (_client, sid) = WsClient::connect_ns(&engine, "/").await;
    assert_recv!(rx, (sid.clone(), None));
    assert_eq!(io.sockets().len(), 1);
    assert_eq!(io.sockets()[0].id.to_string(), sid);
}

#[tokio::test]
async fn connect_with_auth() {
    let (engine, io) = create_server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    io.ns("/admin", move |_: SocketRef, auth: Option<Value>| {
        tx.send(auth).unwrap();
    });

    let mut client = WsClient::connect(&engine, 4).await;
    client.send(r#"40/admin,{"token":"123"}"#).await;
    assert!(client.recv().await.starts_with(r#"40/admin,{"sid":""#));
    let auth = Value::Object(vec![("token".into(), Value::from("123"))]);
    assert_recv!(rx, Some(auth));
}

#[tokio::test]
async fn v3_connects_main_namespace_without_packet() {
    let (engine, io) = create_server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    io.ns("/", move |socket: SocketRef, _| {
        tx.send(socket.client_id()).unwrap();
    });
    io.ns("/chat", |_: SocketRef, _| {});

    let mut client = WsClient::connect(&engine, 3).await;
    assert_eq!(client.recv().await, "40");
    let session_id = engine.sessions()[0].id.to_string();
    assert_recv!(rx, session_id.clone());

    // V3 sockets share the session id, prefixed by the namespace outside of the main one
    client.send("40/chat,").await;
    assert_eq!(client.recv().await, "40/chat,");
    let socket = io.of("/chat").unwrap().sockets().pop().unwrap();
    assert_eq!(socket.client_id(), format!("/chat#{session_id}"));
}

#[tokio::test]
async fn invalid_namespace() {
    let (engine, _io) = create_server_with(SocketIo::builder().lazy_namespaces(false));
    let mut client = WsClient::connect(&engine, 4).await;
    client.send("40/unknown,").await;
    assert_eq!(
        client.recv().await,
        r#"44/unknown,{"message":"Invalid namespace"}"#
    );

    // The session stays open and can connect to an existing namespace
    client.send("40").await;
    assert!(client.recv().await.starts_with(r#"40{"sid":""#));
}

#[tokio::test]
async fn lazy_namespace() {
    let (engine, io) = create_server();
    let (_client, _) = WsClient::connect_ns(&engine, "/dynamic").await;
    assert_eq!(io.of("/dynamic").unwrap().sockets().len(), 1);
}

#[tokio::test]
async fn middleware_reject() {
    let (engine, io) = create_server();
    let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();
    let tx1 = tx.clone();
    io.ns("/", move |_: SocketRef, _| {
        tx1.send("connect").unwrap();
    })
    .use_middleware(move |_: &SocketRef, auth: Option<&Value>| {
        tx.send("middleware").unwrap();
        match auth.and_then(|auth| auth.get("token")) {
            Some(_) => Ok(()),
            None => Err("missing token"),
        }
    });

    let mut client = WsClient::connect(&engine, 4).await;
    client.send("40").await;
    assert_eq!(client.recv().await, r#"44{"message":"missing token"}"#);
    assert_recv!(rx, "middleware");
    assert!(io.sockets().is_empty());

    client.send(r#"40{"token":"abc"}"#).await;
    assert!(client.recv().await.starts_with(r#"40{"sid":""#));
    assert_recv!(rx, "middleware");
    assert_recv!(rx, "connect");
}

#[tokio::test]
async fn panicking_middleware_rejects() {
    let (engine, io) = create_server();
    io.ns("/", |_: SocketRef, _| {})
        .use_middleware(|_: &SocketRef, _: Option<&Value>| -> Result<(), String> {
            panic!("boom")
        });

    let mut client = WsClient::connect(&engine, 4).await;
    client.send("40").await;
    assert_eq!(
        client.recv().await,
        r#"44{"message":"middleware panicked: boom"}"#
    );
    assert!(io.sockets().is_empty());
}

#[tokio::test]
async fn panicking_connect_handler_is_isolated() {
    let (engine, io) = create_server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    io.ns("/", |_: SocketRef, _| panic!("boom"));
    io.ns("/", move |socket: SocketRef, _| {
        tx.send(socket.id).unwrap();
    });

    let (_client, sid) = WsClient::connect_ns(&engine, "/").await;
    match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
        Ok(Some(id)) => assert_eq!(id.to_string(), sid),
        res => panic!("second handler not called: {res:?}"),
    }
}

#[tokio::test]
async fn duplicate_connect_is_ignored() {
    let (engine, io) = create_server();
    let (mut client, _) = WsClient::connect_ns(&engine, "/").await;
    client.send("40").await;
    client.assert_silent().await;
    assert_eq!(io.sockets().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_timeout() {
    let (engine, _io) = create_server_with(
        SocketIo::builder().connect_timeout(Duration::from_millis(100)),
    );
    let mut client = WsClient::connect(&engine, 4).await;
    assert_eq!(engine.sessions().len(), 1);

    assert_eq!(client.closed().await.as_deref(), Some("1"));
    assert!(engine.sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn connected_session_outlives_connect_timeout() {
    let (engine, _io) = create_server_with(
        SocketIo::builder().connect_timeout(Duration::from_millis(100)),
    );
    let (_client, _) = WsClient::connect_ns(&engine, "/").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.sessions().len(), 1);
}
