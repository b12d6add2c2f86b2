use std::time::Duration;

use bytes::Bytes;
use sockwire_engine::{
    DisconnectReason, ProtocolVersion, TransportType,
    client::{ClientConfig, ClientEvent, ConnectError, EngineClient, InProcessConnector},
    config::EngineIoConfig,
};

use fixture::{Event, create_server, fast_heartbeat_config};

#[tokio::test]
async fn polling_client() {
    let (engine, mut rx) = create_server(EngineIoConfig::default());
    let config = ClientConfig::builder().upgrade(false).build();
    let (client, mut events) = EngineClient::connect(InProcessConnector::new(engine.clone()), config)
        .await
        .unwrap();
    assert_event!(rx, Event::Connect(sid) if sid == client.sid());
    assert_eq!(client.transport_type(), TransportType::Polling);

    client.emit("hello").unwrap();
    assert_eq!(events.recv().await, Some(ClientEvent::Message("hello".into())));
    client.emit_binary(Bytes::from_static(&[1, 2, 3])).unwrap();
    assert_eq!(
        events.recv().await,
        Some(ClientEvent::Binary(Bytes::from_static(&[1, 2, 3])))
    );
    assert_event!(rx, Event::Message(_, ref msg) if msg == "hello");
}

#[tokio::test]
async fn client_upgrades_to_websocket() {
    let (engine, mut rx) = create_server(EngineIoConfig::default());
    let (client, mut events) =
        EngineClient::connect(InProcessConnector::new(engine.clone()), ClientConfig::default())
            .await
            .unwrap();
    assert_event!(rx, Event::Connect(_));
    assert_eq!(client.transport_type(), TransportType::Websocket);
    assert_eq!(
        engine.get_session(client.sid()).unwrap().transport_type(),
        TransportType::Websocket
    );

    client.emit("over websocket").unwrap();
    assert_eq!(
        events.recv().await,
        Some(ClientEvent::Message("over websocket".into()))
    );
}

#[tokio::test]
async fn websocket_only_client() {
    let (engine, _rx) = create_server(EngineIoConfig::default());
    let config = ClientConfig::builder()
        .transports([TransportType::Websocket])
        .protocol(ProtocolVersion::V3)
        .build();
    let (client, mut events) = EngineClient::connect(InProcessConnector::new(engine.clone()), config)
        .await
        .unwrap();
    assert_eq!(client.transport_type(), TransportType::Websocket);
    assert_eq!(client.protocol(), ProtocolVersion::V3);

    client
        .emit_many("header", vec![Bytes::from_static(&[9])])
        .unwrap();
    assert_eq!(events.recv().await, Some(ClientEvent::Message("header".into())));
    assert_eq!(
        events.recv().await,
        Some(ClientEvent::Binary(Bytes::from_static(&[9])))
    );
}

#[tokio::test]
async fn client_close() {
    let (engine, mut rx) = create_server(EngineIoConfig::default());
    let (client, mut events) =
        EngineClient::connect(InProcessConnector::new(engine.clone()), ClientConfig::default())
            .await
            .unwrap();
    assert_event!(rx, Event::Connect(_));

    client.close();
    assert_eq!(
        events.recv().await,
        Some(ClientEvent::Closed(DisconnectReason::ClosingClient))
    );
    assert!(client.is_closed());
    assert!(client.emit("too late").is_err());
    assert_event!(rx, Event::Disconnect(_, DisconnectReason::TransportClose));
}

#[tokio::test]
async fn server_close_reaches_polling_client() {
    let (engine, _rx) = create_server(EngineIoConfig::default());
    let config = ClientConfig::builder().upgrade(false).build();
    let (client, mut events) = EngineClient::connect(InProcessConnector::new(engine.clone()), config)
        .await
        .unwrap();
    client.emit("ready").unwrap();
    assert_eq!(events.recv().await, Some(ClientEvent::Message("ready".into())));
    // let the client send its next polling request
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine.close();
    assert_eq!(
        events.recv().await,
        Some(ClientEvent::Closed(DisconnectReason::TransportClose))
    );
    client.closed().await;
}

#[tokio::test(start_paused = true)]
async fn v4_client_answers_server_pings() {
    let (engine, mut rx) = create_server(fast_heartbeat_config());
    let (client, _events) =
        EngineClient::connect(InProcessConnector::new(engine.clone()), ClientConfig::default())
            .await
            .unwrap();
    assert_event!(rx, Event::Connect(_));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!client.is_closed());
    let session = engine.get_session(client.sid()).unwrap();
    assert!(session.last_rtt().is_some());
}

#[tokio::test(start_paused = true)]
async fn v3_client_sends_pings() {
    let (engine, mut rx) = create_server(fast_heartbeat_config());
    let config = ClientConfig::builder()
        .protocol(ProtocolVersion::V3)
        .build();
    let (client, mut events) = EngineClient::connect(InProcessConnector::new(engine.clone()), config)
        .await
        .unwrap();
    assert_event!(rx, Event::Connect(_));

    client.start_heartbeat();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!client.is_closed());
    assert!(client.last_rtt().is_some());
    assert!(engine.get_session(client.sid()).is_some());

    engine.close();
    assert_eq!(
        events.recv().await,
        Some(ClientEvent::Closed(DisconnectReason::TransportClose))
    );
}

#[tokio::test]
async fn connect_to_unsupported_version() {
    let config = EngineIoConfig::builder()
        .protocols([ProtocolVersion::V4])
        .build();
    let (engine, _rx) = create_server(config);
    let config = ClientConfig::builder()
        .protocol(ProtocolVersion::V3)
        .build();
    let err = EngineClient::connect(InProcessConnector::new(engine), config)
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectError::Transport(_)));
}
