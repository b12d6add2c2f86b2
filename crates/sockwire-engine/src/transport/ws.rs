//! The ws transport module handles persistent socket connections
//! and the upgrade from a polling session to a websocket.
//!
//! The socket is any [`RawChannel`], the websocket handshake itself is done by the host.
use std::{sync::Arc, time::Duration};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http::request::Parts;
use sockwire_engine_core::{Frame, Packet, PacketBuf, ProtocolVersion, Sid, TransportType};

use crate::{
    engine::EngineIo,
    errors::Error,
    handler::EngineIoHandler,
    peekable::PeekableReceiver,
    session::{DisconnectReason, Session},
    transport::{CloseSignal, HEARTBEAT_SEND_RETRIES, RawChannel, TransportError, retry_delay},
};

/// Handle a websocket connection.
///
/// Sends an open packet if it is not an upgrade from a polling session.
/// Reads packets from the websocket and handles them until the connection is closed.
pub(crate) async fn on_init<H: EngineIoHandler, C: RawChannel>(
    engine: Arc<EngineIo<H>>,
    mut channel: C,
    protocol: ProtocolVersion,
    sid: Option<Sid>,
    req: Parts,
) -> Result<(), Error> {
    let session = match sid {
        Some(sid) => {
            let session = engine.get_session(sid).ok_or(Error::UnknownSessionID(sid))?;
            if session.transport_type() == TransportType::Websocket || session.is_upgrading() {
                return Err(Error::Upgrade);
            }
            upgrade_handshake(&session, &mut channel, engine.config.upgrade_timeout).await?;
            session
        }
        None => {
            if !engine.config.allowed_transport(TransportType::Websocket) {
                return Err(Error::TransportMismatch);
            }
            let session = engine.create_session(protocol, TransportType::Websocket, req, true);
            #[cfg(feature = "tracing")]
            tracing::debug!("[sid={}] new websocket connection", session.id);
            let open = engine.config.open_packet(session.id, TransportType::Websocket);
            if let Err(e) = channel.send(Packet::Open(open).into_frame(protocol)).await {
                session.close(DisconnectReason::TransportError);
                return Err(e.into());
            }
            session.start_heartbeat();
            session
        }
    };

    let (tx, rx) = channel.split();
    let writer = tokio::spawn(forward_to_socket(session.clone(), tx));

    match forward_to_handler(&engine, rx, &session).await {
        Ok(()) => session.close(DisconnectReason::TransportClose),
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::debug!("[sid={}] error when handling packet: {:?}", session.id, e);
            session.close(
                Option::<DisconnectReason>::from(&e).unwrap_or(DisconnectReason::TransportError),
            );
        }
    }

    // Let the writer flush the close packet.
    if tokio::time::timeout(engine.config.ping_timeout, writer).await.is_err() {
        #[cfg(feature = "tracing")]
        tracing::debug!("[sid={}] websocket writer did not stop in time", session.id);
    }
    Ok(())
}

/// Forward all packets received from the websocket to the engine.
async fn forward_to_handler<H, S>(
    engine: &Arc<EngineIo<H>>,
    mut rx: S,
    session: &Arc<Session<H::Data>>,
) -> Result<(), Error>
where
    H: EngineIoHandler,
    S: Stream<Item = Result<Frame, TransportError>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = rx.next() => frame,
            _ = session.closed() => return Ok(()),
        };
        let Some(frame) = frame.transpose()? else {
            return Ok(());
        };
        match Packet::from_frame(frame, session.protocol) {
            Ok(packet) => engine.handle_packet(packet, session)?,
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("[sid={}] skipping packet: {_e}", session.id);
            }
        }
        if session.is_closed() {
            return Ok(());
        }
    }
}

/// Forward all packets waiting in the session queue to the websocket.
async fn forward_to_socket<D, S>(session: Arc<Session<D>>, mut tx: S)
where
    D: Default + Send + Sync + 'static,
    S: Sink<Frame, Error = TransportError> + Unpin,
{
    let mut rx = session.internal_rx.lock().await;
    if let Err(_e) = write_frames(&mut rx, &mut tx, session.protocol, session.closed_signal()).await
    {
        #[cfg(feature = "tracing")]
        tracing::debug!("[sid={}] error sending packets: {_e}", session.id);
        drop(rx);
        session.close(DisconnectReason::TransportError);
    }
}

/// Write queued packet groups to a sink until a close packet is written
/// or the connection is closed and the queue is empty.
///
/// The sink is flushed only when the queue is drained.
pub(crate) async fn write_frames<S>(
    rx: &mut PeekableReceiver<PacketBuf>,
    tx: &mut S,
    protocol: ProtocolVersion,
    closed: &CloseSignal,
) -> Result<(), TransportError>
where
    S: Sink<Frame, Error = TransportError> + Unpin,
{
    'outer: loop {
        let packets = tokio::select! {
            biased;
            packets = rx.recv() => packets,
            _ = closed.closed() => rx.try_recv().ok(),
        };
        let Some(packets) = packets else {
            break;
        };
        if write_group(tx, packets, protocol).await? {
            break;
        }
        while let Ok(packets) = rx.try_recv() {
            if write_group(tx, packets, protocol).await? {
                break 'outer;
            }
        }
        tx.flush().await?;
    }
    tx.close().await
}

/// Write a group of packets, returns true if a close packet was written.
async fn write_group<S>(
    tx: &mut S,
    packets: PacketBuf,
    protocol: ProtocolVersion,
) -> Result<bool, TransportError>
where
    S: Sink<Frame, Error = TransportError> + Unpin,
{
    for packet in packets {
        match packet {
            // A noop packet is only meant for a pending polling request during an upgrade.
            Packet::Noop => (),
            Packet::Close => {
                tx.send(Packet::Close.into_frame(protocol)).await?;
                return Ok(true);
            }
            packet @ (Packet::Ping | Packet::Pong) => {
                send_with_retry(tx, packet.into_frame(protocol)).await?
            }
            packet => tx.feed(packet.into_frame(protocol)).await?,
        }
    }
    Ok(false)
}

async fn send_with_retry<S>(tx: &mut S, frame: Frame) -> Result<(), TransportError>
where
    S: Sink<Frame, Error = TransportError> + Unpin,
{
    let mut attempt = 0;
    loop {
        match tx.send(frame.clone()).await {
            Ok(()) => return Ok(()),
            Err(_e) if attempt < HEARTBEAT_SEND_RETRIES => {
                #[cfg(feature = "tracing")]
                tracing::debug!(attempt, "heartbeat frame send failed: {_e}, retrying");
                tokio::time::sleep(retry_delay(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Read the next packet of an upgrade handshake.
async fn next_packet<C: RawChannel>(
    channel: &mut C,
    protocol: ProtocolVersion,
    timeout: Duration,
) -> Result<Packet, Error> {
    match tokio::time::timeout(timeout, channel.next()).await {
        Err(_) => Err(Error::UpgradeTimeout),
        Ok(None) => Err(Error::Upgrade),
        Ok(Some(frame)) => Ok(Packet::from_frame(frame?, protocol)?),
    }
}

/// Upgrade a session from polling to websocket.
///
/// Before switching, a noop packet is queued to release any pending polling request.
///
/// ## Handshake :
/// ```text
/// CLIENT                                                 SERVER
///│                                                      │
///│   GET /engine.io/?EIO=4&transport=websocket&sid=...  │
///│ ───────────────────────────────────────────────────► │
///│  ◄─────────────────────────────────────────────────┘ │
///│            HTTP 101 (WebSocket handshake)            │
///│                                                      │
///│            -----  WebSocket frames -----             │
///│  ─────────────────────────────────────────────────►  │
///│                         2probe                       │ (ping packet)
///│  ◄─────────────────────────────────────────────────  │
///│                         3probe                       │ (pong packet)
///│  ─────────────────────────────────────────────────►  │
///│                         5                            │ (upgrade packet)
///│                                                      │
///│            -----  WebSocket frames -----             │
/// ```
#[cfg_attr(feature = "tracing", tracing::instrument(skip(session, channel), fields(sid = %session.id)))]
async fn upgrade_handshake<D, C>(
    session: &Arc<Session<D>>,
    channel: &mut C,
    timeout: Duration,
) -> Result<(), Error>
where
    D: Default + Send + Sync + 'static,
    C: RawChannel,
{
    #[cfg(feature = "tracing")]
    tracing::debug!("websocket connection upgrade");

    session.set_upgrading(true);
    let res = async {
        match next_packet(channel, session.protocol, timeout).await? {
            Packet::PingProbe => {
                channel
                    .send(Packet::PongProbe.into_frame(session.protocol))
                    .await?
            }
            p => return Err(Error::BadPacket(p)),
        };

        // release any pending polling request
        session.send(Packet::Noop)?;

        match next_packet(channel, session.protocol, timeout).await? {
            Packet::Upgrade => Ok(()),
            p => Err(Error::BadPacket(p)),
        }
    }
    .await;

    if let Err(e) = res {
        #[cfg(feature = "tracing")]
        tracing::debug!("upgrade failed: {e}");
        session.set_upgrading(false);
        return Err(e);
    }

    // wait for any polling request to finish
    let _rx = session.internal_rx.lock().await;
    session.upgrade_to_websocket();

    #[cfg(feature = "tracing")]
    tracing::debug!("websocket upgrade successful");
    Ok(())
}
