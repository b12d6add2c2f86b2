//! Long-polling transport.
//!
//! * `open_req` opens a session and returns the handshake packet.
//! * `polling_req` waits for outbound packets and returns them as a single payload.
//! * `post_req` decodes a payload posted by the client.
use std::{collections::VecDeque, sync::Arc};

use bytes::Bytes;
use http::request::Parts;
use smallvec::smallvec;
use sockwire_engine_core::{
    Packet, PacketBuf, ProtocolVersion, TransportType,
    payload::{self, Payload},
};

use crate::{
    engine::EngineIo,
    errors::Error,
    handler::EngineIoHandler,
    peekable::Drain,
    session::{DisconnectReason, Session},
};

/// Encode a payload made of a single packet.
fn single_packet_payload(packet: Packet, protocol: ProtocolVersion, b64: bool) -> Payload {
    let mut queue: VecDeque<PacketBuf> = VecDeque::from([smallvec![packet]]);
    payload::encode(&mut queue, protocol, b64, u64::MAX)
}

/// Create a new long-polling session and return the open packet.
pub(crate) fn open_req<H: EngineIoHandler>(
    engine: &Arc<EngineIo<H>>,
    protocol: ProtocolVersion,
    req: Parts,
    supports_binary: bool,
) -> Result<Payload, Error> {
    if !engine.config.allowed_transport(TransportType::Polling) {
        return Err(Error::TransportMismatch);
    }
    let session = engine.create_session(protocol, TransportType::Polling, req, supports_binary);
    session.start_heartbeat();

    let packet = Packet::Open(engine.config.open_packet(session.id, TransportType::Polling));
    Ok(single_packet_payload(packet, protocol, session.b64()))
}

/// Handle a long-polling read.
///
/// Only one read can be pending for a session, a concurrent read closes the session.
/// If no packet is available within `poll_timeout`, a noop packet is returned.
#[cfg_attr(feature = "tracing", tracing::instrument(skip(engine, session), fields(sid = %session.id)))]
pub(crate) async fn polling_req<H: EngineIoHandler>(
    engine: &Arc<EngineIo<H>>,
    session: &Arc<Session<H::Data>>,
) -> Result<Payload, Error> {
    if session.transport_type() != TransportType::Polling {
        return Err(Error::TransportMismatch);
    }

    let Ok(mut rx) = session.internal_rx.try_lock() else {
        // The websocket transport holds the queue at the end of an upgrade.
        if session.is_upgrading() || session.transport_type() == TransportType::Websocket {
            return Err(Error::TransportMismatch);
        }
        #[cfg(feature = "tracing")]
        tracing::debug!("multiple polling requests, closing session");
        session.close(DisconnectReason::MultipleHttpPollingError);
        return Err(Error::MultipleHttpPolling);
    };

    if !session.is_closed() {
        tokio::select! {
            biased;
            _ = rx.fill() => {},
            _ = session.closed() => {},
            _ = tokio::time::sleep(engine.config.poll_timeout) => {
                #[cfg(feature = "tracing")]
                tracing::trace!("polling timeout, sending noop");
                return Ok(single_packet_payload(Packet::Noop, session.protocol, session.b64()));
            }
        }
    }

    let mut drain = Drain::new(&mut rx);
    let payload = payload::encode(
        &mut drain,
        session.protocol,
        session.b64(),
        engine.config.max_payload,
    );
    if drain.saw_close() {
        rx.close();
    }

    #[cfg(feature = "tracing")]
    tracing::trace!(len = payload.data.len(), "sending payload");
    Ok(payload)
}

/// Handle a long-polling write.
///
/// Packets are handled in order before answering. A packet that cannot be decoded is skipped,
/// a payload whose framing is broken is rejected as a whole.
#[cfg_attr(feature = "tracing", tracing::instrument(skip(engine, session, body), fields(sid = %session.id)))]
pub(crate) fn post_req<H: EngineIoHandler>(
    engine: &Arc<EngineIo<H>>,
    session: &Arc<Session<H::Data>>,
    body: Bytes,
    binary: bool,
) -> Result<(), Error> {
    if session.transport_type() != TransportType::Polling && !session.is_upgrading() {
        return Err(Error::TransportMismatch);
    }

    let packets = payload::decode(&body, session.protocol, binary, engine.config.max_payload)?;
    for packet in packets {
        let packet = match packet {
            Ok(packet) => packet,
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("skipping packet: {_e}");
                continue;
            }
        };
        if let Err(e) = engine.handle_packet(packet, session) {
            #[cfg(feature = "tracing")]
            tracing::debug!("error handling packet: {e:?}");
            if let Some(reason) = Option::<DisconnectReason>::from(&e) {
                session.close(reason);
            }
            return Err(e);
        }
        if session.is_closed() {
            break;
        }
    }
    Ok(())
}
