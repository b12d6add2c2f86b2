use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use http::Method;
use sockwire_engine::{DisconnectReason, Frame, ProtocolVersion};

use fixture::{
    Event, body_str, create_polling_connection, create_server, create_ws_connection,
    fast_heartbeat_config, next_text, send_req,
};

#[tokio::test(start_paused = true)]
async fn v4_server_closes_without_pong() {
    let (engine, mut rx) = create_server(fast_heartbeat_config());
    let mut ws = create_ws_connection(&engine, "EIO=4&transport=websocket");
    next_text(&mut ws).await.unwrap();
    assert_event!(rx, Event::Connect(_));

    assert_eq!(next_text(&mut ws).await.unwrap(), "2");
    assert_eq!(next_text(&mut ws).await.unwrap(), "1");
    assert!(ws.next().await.is_none());
    assert_event!(rx, Event::Disconnect(_, DisconnectReason::HeartbeatTimeout));
}

#[tokio::test(start_paused = true)]
async fn v4_server_keeps_session_alive_with_pongs() {
    let (engine, mut rx) = create_server(fast_heartbeat_config());
    let mut ws = create_ws_connection(&engine, "EIO=4&transport=websocket");
    next_text(&mut ws).await.unwrap();
    assert_event!(rx, Event::Connect(_));

    for _ in 0..5 {
        assert_eq!(next_text(&mut ws).await.unwrap(), "2");
        ws.send(Frame::Text("3".into())).await.unwrap();
    }
    assert_eq!(engine.sessions().len(), 1);
    assert!(engine.sessions()[0].last_rtt().is_some());
}

#[tokio::test(start_paused = true)]
async fn v3_server_answers_pings_then_times_out() {
    let (engine, mut rx) = create_server(fast_heartbeat_config());
    let mut ws = create_ws_connection(&engine, "EIO=3&transport=websocket");
    next_text(&mut ws).await.unwrap();
    assert_event!(rx, Event::Connect(_));

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        ws.send(Frame::Text("2".into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await.unwrap(), "3");
    }
    assert_eq!(engine.sessions().len(), 1);

    // no more pings: closed after ping_interval + ping_timeout
    assert_eq!(next_text(&mut ws).await.unwrap(), "1");
    assert_event!(rx, Event::Disconnect(_, DisconnectReason::HeartbeatTimeout));
}

#[tokio::test(start_paused = true)]
async fn v4_polling_ping_is_queued() {
    let (engine, mut rx) = create_server(fast_heartbeat_config());
    let sid = create_polling_connection(&engine, ProtocolVersion::V4).await.sid;
    let query = format!("EIO=4&transport=polling&sid={sid}");
    assert_event!(rx, Event::Connect(_));

    let res = send_req(&engine, Method::GET, &query, None).await;
    assert_eq!(body_str(&res), "2");
    send_req(&engine, Method::POST, &query, Some("3")).await;

    let res = send_req(&engine, Method::GET, &query, None).await;
    assert_eq!(body_str(&res), "2");

    // no pong: the next poll receives the close packet
    let res = send_req(&engine, Method::GET, &query, None).await;
    assert_eq!(body_str(&res), "1");
    assert_event!(rx, Event::Disconnect(_, DisconnectReason::HeartbeatTimeout));
}
