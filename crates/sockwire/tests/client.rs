use std::{sync::Mutex, time::Duration};

use futures_util::{SinkExt, StreamExt};
use sockwire::{
    ConnectError, DisconnectError, ProtocolVersion, SocketIo, Value,
    client::{SocketClient, SocketClientBuilder},
    handler::Message,
    socket::{DisconnectReason, SocketRef},
};
use sockwire_engine::{
    Frame, TransportType,
    client::{ClientConfig, Connector, InProcessConnector, PollResponse},
    payload::Payload,
    transport::{MemoryChannel, TransportError, memory_channel},
};
use tokio::sync::mpsc;

use fixture::{Engine, create_server, create_server_with};

fn echo_server() -> (Engine, SocketIo) {
    let (engine, io) = create_server();
    io.ns("/", |socket: SocketRef, _| {
        socket.on("echo", |socket: SocketRef, msg: Message| {
            let text: String = msg.data().unwrap();
            match msg.ack {
                Some(ack) => ack.send(&text).unwrap(),
                None => socket.emit("echo", &text).unwrap(),
            }
        });
    });
    (engine, io)
}

fn config(protocol: ProtocolVersion) -> ClientConfig {
    ClientConfig::builder()
        .protocol(protocol)
        .transports([TransportType::Websocket])
        .build()
}

/// A websocket only connector, the test plays the server on the other end.
struct ScriptedServer {
    client: Mutex<Option<MemoryChannel>>,
}

impl ScriptedServer {
    fn new() -> (Self, MemoryChannel) {
        let (client, server) = memory_channel();
        let connector = Self {
            client: Mutex::new(Some(client)),
        };
        (connector, server)
    }
}

impl Connector for ScriptedServer {
    type Channel = MemoryChannel;

    async fn get(&self, _: &str) -> Result<PollResponse, TransportError> {
        Err(TransportError::Closed)
    }

    async fn post(&self, _: &str, _: Payload) -> Result<(), TransportError> {
        Err(TransportError::Closed)
    }

    async fn open_socket(&self, _: &str) -> Result<MemoryChannel, TransportError> {
        self.client.lock().unwrap().take().ok_or(TransportError::Closed)
    }
}

#[tokio::test]
async fn connect_emit_and_receive() {
    let (engine, io) = echo_server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = SocketClientBuilder::new()
        .on("echo", move |_: SocketClient, msg: Message| {
            tx.send(msg.data::<String>().unwrap()).unwrap();
        })
        .connect(InProcessConnector::new(engine.clone()), config(ProtocolVersion::V4))
        .await
        .unwrap();

    assert!(client.connected());
    assert_eq!(client.ns(), "/");
    assert_eq!(io.sockets()[0].id, client.id());

    client.emit("echo", "hello").unwrap();
    assert_recv!(rx, "hello".to_string());
}

#[tokio::test]
async fn emit_with_ack() {
    let (engine, _io) = echo_server();
    let client = SocketClientBuilder::new()
        .connect(InProcessConnector::new(engine), config(ProtocolVersion::V4))
        .await
        .unwrap();

    let res: String = client
        .emit_with_ack("echo", "ping")
        .unwrap()
        .await
        .unwrap();
    assert_eq!(res, "ping");
}

#[tokio::test]
async fn acknowledge_server_event() {
    let (engine, io) = create_server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    io.ns("/", move |socket: SocketRef, _| {
        let tx = tx.clone();
        let ack = socket.emit_with_ack::<_, (String, u32)>("ask", &()).unwrap();
        tokio::spawn(async move {
            tx.send(ack.await.unwrap()).unwrap();
        });
    });

    let _client = SocketClientBuilder::new()
        .on("ask", |_: SocketClient, msg: Message| {
            msg.ack.unwrap().send(&("yes", 42)).unwrap();
        })
        .connect(InProcessConnector::new(engine), config(ProtocolVersion::V4))
        .await
        .unwrap();

    assert_recv!(rx, ("yes".to_string(), 42));
}

#[tokio::test]
async fn auth_and_namespace() {
    let (engine, io) = create_server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    io.ns("/admin", move |socket: SocketRef, auth: Option<Value>| {
        tx.send((socket.ns().to_string(), auth)).unwrap();
    });

    let client = SocketClientBuilder::new()
        .namespace("/admin")
        .auth(serde_json::json!({ "token": "secret" }))
        .connect(InProcessConnector::new(engine), config(ProtocolVersion::V4))
        .await
        .unwrap();
    assert_eq!(client.ns(), "/admin");
    let auth = Value::Object(vec![("token".into(), Value::from("secret"))]);
    assert_recv!(rx, ("/admin".to_string(), Some(auth)));
}

#[tokio::test]
async fn rejected_connection() {
    let (engine, io) = create_server();
    io.ns("/", |_: SocketRef, _| {})
        .use_middleware(|_: &SocketRef, _: Option<&Value>| Err("not allowed"));

    let res = SocketClientBuilder::new()
        .connect(InProcessConnector::new(engine), config(ProtocolVersion::V4))
        .await;
    match res {
        Err(ConnectError::Rejected(reason)) => assert_eq!(reason, "not allowed"),
        res => panic!("expected a rejection, got {res:?}"),
    }
}

#[tokio::test]
async fn v3_client() {
    let (engine, io) = echo_server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = SocketClientBuilder::new()
        .on("echo", move |_: SocketClient, msg: Message| {
            tx.send(msg.data::<String>().unwrap()).unwrap();
        })
        .connect(InProcessConnector::new(engine.clone()), config(ProtocolVersion::V3))
        .await
        .unwrap();

    assert_eq!(client.protocol(), ProtocolVersion::V3);
    assert_eq!(client.id(), engine.sessions()[0].id);
    assert_eq!(io.sockets().len(), 1);
    client.emit("echo", "v3").unwrap();
    assert_recv!(rx, "v3".to_string());
}

#[tokio::test]
async fn client_disconnect() {
    let (engine, io) = create_server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    io.ns("/", move |socket: SocketRef, _| {
        let tx = tx.clone();
        socket.on_disconnect(move |_: SocketRef, reason: DisconnectReason| {
            tx.send(reason).unwrap();
        });
    });

    let (client_tx, mut client_rx) = mpsc::unbounded_channel();
    let client = SocketClientBuilder::new()
        .on_disconnect(move |_: SocketClient, reason: DisconnectReason| {
            client_tx.send(reason).unwrap();
        })
        .connect(InProcessConnector::new(engine), config(ProtocolVersion::V4))
        .await
        .unwrap();

    client.disconnect().unwrap();
    assert_eq!(client.disconnect(), Err(DisconnectError::AlreadyDisconnected));
    assert!(client.emit("late", &()).is_err());
    assert_recv!(client_rx, DisconnectReason::ClientNSDisconnect);
    assert_recv!(rx, DisconnectReason::ClientNSDisconnect);
}

#[tokio::test]
async fn server_disconnect() {
    let (engine, io) = create_server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = SocketClientBuilder::new()
        .on_disconnect(move |_: SocketClient, reason: DisconnectReason| {
            tx.send(reason).unwrap();
        })
        .connect(InProcessConnector::new(engine), config(ProtocolVersion::V4))
        .await
        .unwrap();

    io.disconnect_all().unwrap();
    assert_recv!(rx, DisconnectReason::ServerNSDisconnect);
    assert!(!client.connected());
}

#[tokio::test]
async fn invalid_namespace() {
    let (engine, _io) = create_server_with(SocketIo::builder().lazy_namespaces(false));
    let res = SocketClientBuilder::new()
        .namespace("/unknown")
        .connect(InProcessConnector::new(engine), config(ProtocolVersion::V4))
        .await;
    assert!(matches!(res, Err(ConnectError::Rejected(reason)) if reason == "Invalid namespace"));
}

#[tokio::test]
async fn polling_client_upgrades() {
    let (engine, _io) = echo_server();
    let client = SocketClientBuilder::new()
        .connect(InProcessConnector::new(engine), ClientConfig::default())
        .await
        .unwrap();
    assert_eq!(client.transport_type(), TransportType::Websocket);
    let res: String = client.emit_with_ack("echo", "up").unwrap().await.unwrap();
    assert_eq!(res, "up");
}

#[tokio::test(start_paused = true)]
async fn v3_pings_start_after_namespace_connect() {
    let (connector, mut server) = ScriptedServer::new();
    let client = tokio::spawn(
        SocketClientBuilder::new().connect(connector, config(ProtocolVersion::V3)),
    );

    let open = r#"0{"sid":"AAAAAAAAAAAAAAAA","upgrades":[],"pingInterval":1000,"pingTimeout":500}"#;
    server.send(Frame::Text(open.into())).await.unwrap();

    // Nothing is sent until the server accepts the main namespace
    let res = tokio::time::timeout(Duration::from_secs(3), server.next()).await;
    assert!(res.is_err(), "unexpected frame before connect: {res:?}");

    server.send(Frame::Text("40".into())).await.unwrap();
    let client = client.await.unwrap().unwrap();
    assert!(client.connected());

    let frame = tokio::time::timeout(Duration::from_secs(2), server.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame, Frame::Text("2".into()));
}
