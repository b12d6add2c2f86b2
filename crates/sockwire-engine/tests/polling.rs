use std::time::Duration;

use http::{Method, header::CONTENT_TYPE};
use sockwire_engine::{
    DisconnectReason, ProtocolVersion, TransportType, config::EngineIoConfig,
};

use fixture::{Event, body_str, create_polling_connection, create_server, send_req};

#[tokio::test]
async fn open_v4_session() {
    let (engine, mut rx) = create_server(EngineIoConfig::default());
    let open = create_polling_connection(&engine, ProtocolVersion::V4).await;
    assert_eq!(open.upgrades, vec!["websocket"]);
    assert_eq!(open.ping_interval, 25000);
    assert_eq!(open.ping_timeout, 20000);
    assert_eq!(open.max_payload, 100000);
    assert_event!(rx, Event::Connect(sid) if sid == open.sid);

    let session = engine.get_session(open.sid).unwrap();
    assert_eq!(session.transport_type(), TransportType::Polling);
    assert_eq!(session.protocol, ProtocolVersion::V4);
}

#[tokio::test]
async fn open_v3_session_is_length_prefixed() {
    let (engine, _rx) = create_server(EngineIoConfig::default());
    let res = send_req(&engine, Method::GET, "EIO=3&transport=polling", None).await;
    assert_eq!(res.status(), 200);
    let body = body_str(&res);
    let (len, packet) = body.split_once(':').unwrap();
    assert_eq!(len.parse::<usize>().unwrap(), packet.chars().count());
    assert!(packet.starts_with("0{\"sid\":"));
}

#[tokio::test]
async fn message_roundtrip() {
    let (engine, mut rx) = create_server(EngineIoConfig::default());
    let sid = create_polling_connection(&engine, ProtocolVersion::V4).await.sid;
    let query = format!("EIO=4&transport=polling&sid={sid}");

    let res = send_req(&engine, Method::POST, &query, Some("4hello\x1e4world")).await;
    assert_eq!(res.status(), 200);
    assert_eq!(body_str(&res), "ok");

    assert_event!(rx, Event::Connect(_));
    assert_event!(rx, Event::Message(_, ref msg) if msg == "hello");
    assert_event!(rx, Event::Message(_, ref msg) if msg == "world");

    let res = send_req(&engine, Method::GET, &query, None).await;
    assert_eq!(body_str(&res), "4hello\x1e4world");
    assert_eq!(
        res.headers().get(CONTENT_TYPE).unwrap(),
        "text/plain; charset=UTF-8"
    );
}

#[tokio::test]
async fn binary_message_is_base64_with_v4() {
    let (engine, _rx) = create_server(EngineIoConfig::default());
    let sid = create_polling_connection(&engine, ProtocolVersion::V4).await.sid;
    let query = format!("EIO=4&transport=polling&sid={sid}");

    send_req(&engine, Method::POST, &query, Some("bAQID")).await;
    let res = send_req(&engine, Method::GET, &query, None).await;
    assert_eq!(body_str(&res), "bAQID");
}

#[tokio::test]
async fn multiple_http_polling_closes_session() {
    let (engine, mut rx) = create_server(EngineIoConfig::default());
    let sid = create_polling_connection(&engine, ProtocolVersion::V4).await.sid;
    let query = format!("EIO=4&transport=polling&sid={sid}");
    assert_event!(rx, Event::Connect(_));

    let pending = tokio::spawn({
        let engine = engine.clone();
        let query = query.clone();
        async move { send_req(&engine, Method::GET, &query, None).await }
    });
    // let the first request lock the queue
    tokio::time::sleep(Duration::from_millis(20)).await;

    let res = send_req(&engine, Method::GET, &query, None).await;
    assert_eq!(res.status(), 400);
    assert_event!(
        rx,
        Event::Disconnect(_, DisconnectReason::MultipleHttpPollingError)
    );

    let res = pending.await.unwrap();
    assert_eq!(body_str(&res), "1");
    assert!(engine.get_session(sid).is_none());
}

#[tokio::test(start_paused = true)]
async fn poll_timeout_sends_noop() {
    let config = EngineIoConfig::builder()
        .poll_timeout(Duration::from_secs(1))
        .build();
    let (engine, _rx) = create_server(config);
    let sid = create_polling_connection(&engine, ProtocolVersion::V4).await.sid;

    let res = send_req(
        &engine,
        Method::GET,
        &format!("EIO=4&transport=polling&sid={sid}"),
        None,
    )
    .await;
    assert_eq!(body_str(&res), "6");
    assert!(engine.get_session(sid).is_some());
}

#[tokio::test]
async fn client_close_packet() {
    let (engine, mut rx) = create_server(EngineIoConfig::default());
    let sid = create_polling_connection(&engine, ProtocolVersion::V4).await.sid;
    let query = format!("EIO=4&transport=polling&sid={sid}");
    assert_event!(rx, Event::Connect(_));

    let res = send_req(&engine, Method::POST, &query, Some("1")).await;
    assert_eq!(res.status(), 200);
    assert_event!(rx, Event::Disconnect(_, DisconnectReason::TransportClose));

    let res = send_req(&engine, Method::GET, &query, None).await;
    assert_eq!(res.status(), 400);
    assert_eq!(
        body_str(&res),
        "{\"code\":\"1\",\"message\":\"Session ID unknown\"}"
    );
}

#[tokio::test]
async fn server_close_notifies_handler() {
    let (engine, mut rx) = create_server(EngineIoConfig::default());
    create_polling_connection(&engine, ProtocolVersion::V4).await;
    assert_event!(rx, Event::Connect(_));

    engine.close();
    assert_event!(rx, Event::Disconnect(_, DisconnectReason::ClosingServer));
    assert!(engine.sessions().is_empty());
}

#[tokio::test]
async fn query_errors() {
    let (engine, _rx) = create_server(EngineIoConfig::default());

    let res = send_req(&engine, Method::GET, "EIO=4&transport=carrier-pigeon", None).await;
    assert_eq!(res.status(), 400);
    assert_eq!(
        body_str(&res),
        "{\"code\":\"0\",\"message\":\"Transport unknown\"}"
    );

    let res = send_req(&engine, Method::GET, "EIO=2&transport=polling", None).await;
    assert_eq!(
        body_str(&res),
        "{\"code\":\"5\",\"message\":\"Unsupported protocol version\"}"
    );

    let res = send_req(&engine, Method::POST, "EIO=4&transport=polling", None).await;
    assert_eq!(
        body_str(&res),
        "{\"code\":\"2\",\"message\":\"Bad handshake method\"}"
    );

    let res = send_req(
        &engine,
        Method::GET,
        "EIO=4&transport=polling&sid=AAAAAAAAAAAAAAHs",
        None,
    )
    .await;
    assert_eq!(
        body_str(&res),
        "{\"code\":\"1\",\"message\":\"Session ID unknown\"}"
    );
}

#[tokio::test]
async fn payload_too_large() {
    let config = EngineIoConfig::builder().max_payload(10).build();
    let (engine, _rx) = create_server(config);
    let sid = create_polling_connection(&engine, ProtocolVersion::V4).await.sid;

    let res = send_req(
        &engine,
        Method::POST,
        &format!("EIO=4&transport=polling&sid={sid}"),
        Some("4a very long message"),
    )
    .await;
    assert_eq!(res.status(), 413);
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let (engine, _rx) = create_server(EngineIoConfig::default());
    let req = http::Request::get("http://127.0.0.1/socket.io/?EIO=4&transport=polling")
        .body(bytes::Bytes::new())
        .unwrap();
    let res = sockwire_engine::service::handle_request(&engine, req).await;
    assert_eq!(res.status(), 404);
}
