//! ## Heartbeat monitor
//!
//! A connection is kept alive by ping / pong packets. The side sending the pings depends on the
//! protocol version and on the role:
//!
//! | role   | V3        | V4        |
//! |--------|-----------|-----------|
//! | server | responder | initiator |
//! | client | initiator | responder |
//!
//! * An [initiator](HeartbeatMode::Initiator) sends a ping every `interval` and expects a pong
//!   within `timeout`.
//! * A [responder](HeartbeatMode::Responder) expects a ping within `interval + timeout` and
//!   answers it with a pong.
//!
//! The monitor runs in its own task and only holds a weak reference to its
//! [peer](HeartbeatPeer). Heartbeats are skipped while the peer is upgrading its transport.
use std::{
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use smallvec::smallvec;
use sockwire_engine_core::Packet;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant},
};

use crate::transport::{HEARTBEAT_SEND_RETRIES, MessageSink, retry_delay};

/// Which side of the heartbeat exchange the monitor is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatMode {
    /// Sends pings and waits for pongs.
    Initiator,
    /// Waits for pings and answers with pongs.
    Responder,
}

/// State of a [`Heartbeat`] monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeartbeatState {
    /// Not started yet
    Idle = 0,
    /// The peer is monitored
    Monitoring = 1,
    /// The monitor is stopped, it will not send anything anymore
    Closed = 2,
}

impl From<u8> for HeartbeatState {
    fn from(value: u8) -> Self {
        match value {
            0 => HeartbeatState::Idle,
            1 => HeartbeatState::Monitoring,
            _ => HeartbeatState::Closed,
        }
    }
}

/// The connection monitored by a [`Heartbeat`].
pub trait HeartbeatPeer: MessageSink + Send + Sync + 'static {
    /// Heartbeats are paused while this returns true.
    fn is_upgrading(&self) -> bool;
    /// Called at most once, when the peer did not answer in time.
    fn on_heartbeat_timeout(&self);
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    rtt: AtomicU64,
}

impl Shared {
    /// Move to [`HeartbeatState::Closed`], returns true if the monitor was running.
    fn close(&self) -> bool {
        self.state
            .compare_exchange(
                HeartbeatState::Monitoring as u8,
                HeartbeatState::Closed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// A heartbeat monitor bound to a connection.
#[derive(Debug)]
pub struct Heartbeat {
    mode: HeartbeatMode,
    interval: Duration,
    timeout: Duration,
    tx: mpsc::Sender<()>,
    rx: Mutex<Option<mpsc::Receiver<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl Heartbeat {
    /// Create an idle monitor.
    pub fn new(mode: HeartbeatMode, interval: Duration, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            mode,
            interval,
            timeout,
            tx,
            rx: Mutex::new(Some(rx)),
            handle: Mutex::new(None),
            shared: Arc::new(Shared {
                state: AtomicU8::new(HeartbeatState::Idle as u8),
                rtt: AtomicU64::new(0),
            }),
        }
    }

    /// The monitor mode
    pub fn mode(&self) -> HeartbeatMode {
        self.mode
    }

    /// Start monitoring `peer`. It does nothing if the monitor was already started or stopped.
    pub fn start<P: HeartbeatPeer>(&self, peer: Weak<P>) {
        let Some(rx) = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        if self
            .shared
            .state
            .compare_exchange(
                HeartbeatState::Idle as u8,
                HeartbeatState::Monitoring as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let job = HeartbeatJob {
            mode: self.mode,
            interval: self.interval,
            timeout: self.timeout,
            shared: self.shared.clone(),
        };
        let handle = tokio::spawn(job.run(rx, peer));
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
    }

    /// Notify the monitor that a heartbeat packet was received:
    /// a pong for an initiator, a ping for a responder.
    pub fn notify(&self) {
        // A pending notification is enough, a full channel can be ignored.
        self.tx.try_send(()).ok();
    }

    /// Stop the monitor and cancel its timers.
    pub fn stop(&self) {
        self.shared
            .state
            .store(HeartbeatState::Closed as u8, Ordering::Release);
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    /// The current monitor state
    pub fn state(&self) -> HeartbeatState {
        self.shared.state.load(Ordering::Acquire).into()
    }

    /// Round trip time of the last ping / pong exchange.
    /// It is only measured by initiators.
    pub fn last_rtt(&self) -> Option<Duration> {
        match self.shared.rtt.load(Ordering::Relaxed) {
            0 => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Why the job stopped monitoring.
enum Stop {
    Timeout,
    PeerGone,
}

struct HeartbeatJob {
    mode: HeartbeatMode,
    interval: Duration,
    timeout: Duration,
    shared: Arc<Shared>,
}

impl HeartbeatJob {
    async fn run<P: HeartbeatPeer>(self, mut rx: mpsc::Receiver<()>, peer: Weak<P>) {
        #[cfg(feature = "tracing")]
        tracing::debug!(mode = ?self.mode, "heartbeat routine started");

        let res = match self.mode {
            HeartbeatMode::Initiator => self.initiate(&mut rx, &peer).await,
            HeartbeatMode::Responder => self.respond(&mut rx, &peer).await,
        };

        if let Stop::Timeout = res {
            if self.shared.close() {
                #[cfg(feature = "tracing")]
                tracing::debug!(mode = ?self.mode, "heartbeat timeout");
                if let Some(peer) = peer.upgrade() {
                    peer.on_heartbeat_timeout();
                }
            }
        }
    }

    async fn initiate<P: HeartbeatPeer>(
        &self,
        rx: &mut mpsc::Receiver<()>,
        peer: &Weak<P>,
    ) -> Stop {
        let mut interval_tick = time::interval(self.interval);
        interval_tick.tick().await;
        // Some peers send a pong first, it should be consumed.
        rx.try_recv().ok();
        loop {
            match peer.upgrade() {
                None => return Stop::PeerGone,
                Some(peer) if peer.is_upgrading() => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("heartbeat paused due to upgrade, skipping");
                    drop(peer);
                    interval_tick.tick().await;
                    continue;
                }
                Some(peer) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("emitting ping");
                    if !send_with_retry(&*peer, Packet::Ping).await {
                        return Stop::Timeout;
                    }
                }
            }

            let start = Instant::now();
            match time::timeout(self.timeout, rx.recv()).await {
                Ok(Some(())) => {
                    let rtt = start.elapsed().as_micros().max(1) as u64;
                    self.shared.rtt.store(rtt, Ordering::Relaxed);
                    #[cfg(feature = "tracing")]
                    tracing::trace!(rtt, "pong received");
                }
                Ok(None) | Err(_) => return Stop::Timeout,
            }

            interval_tick.tick().await;
        }
    }

    async fn respond<P: HeartbeatPeer>(&self, rx: &mut mpsc::Receiver<()>, peer: &Weak<P>) -> Stop {
        loop {
            match time::timeout(self.interval + self.timeout, rx.recv()).await {
                Ok(Some(())) => (),
                Err(_) if peer.upgrade().is_some_and(|p| p.is_upgrading()) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("heartbeat paused due to upgrade, skipping timeout");
                    continue;
                }
                Ok(None) | Err(_) => return Stop::Timeout,
            }

            let Some(peer) = peer.upgrade() else {
                return Stop::PeerGone;
            };
            #[cfg(feature = "tracing")]
            tracing::trace!("ping received, sending pong");
            if !send_with_retry(&*peer, Packet::Pong).await {
                return Stop::Timeout;
            }
        }
    }
}

/// Send a heartbeat packet, retrying with an exponential backoff.
async fn send_with_retry<P: MessageSink>(peer: &P, packet: Packet) -> bool {
    for attempt in 0..=HEARTBEAT_SEND_RETRIES {
        match peer.send_packets(smallvec![packet.clone()]) {
            Ok(()) => return true,
            Err(_e) if attempt < HEARTBEAT_SEND_RETRIES => {
                #[cfg(feature = "tracing")]
                tracing::debug!(attempt, "heartbeat send failed: {_e}, retrying");
                time::sleep(retry_delay(attempt)).await;
            }
            Err(_) => (),
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use sockwire_engine_core::PacketBuf;

    use super::*;
    use crate::errors::SendError;

    #[derive(Default)]
    struct MockPeer {
        sent: Mutex<Vec<Packet>>,
        upgrading: AtomicBool,
        timeouts: AtomicUsize,
        failures: AtomicUsize,
    }

    impl MessageSink for MockPeer {
        fn send_packets(&self, packets: PacketBuf) -> Result<(), SendError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(SendError(packets));
            }
            self.sent.lock().unwrap().extend(packets);
            Ok(())
        }
    }

    impl HeartbeatPeer for MockPeer {
        fn is_upgrading(&self) -> bool {
            self.upgrading.load(Ordering::SeqCst)
        }
        fn on_heartbeat_timeout(&self) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl MockPeer {
        fn sent(&self) -> Vec<Packet> {
            self.sent.lock().unwrap().clone()
        }
    }

    const INTERVAL: Duration = Duration::from_millis(300);
    const TIMEOUT: Duration = Duration::from_millis(200);

    #[tokio::test(start_paused = true)]
    async fn initiator_times_out_once() {
        let peer = Arc::new(MockPeer::default());
        let hb = Heartbeat::new(HeartbeatMode::Initiator, INTERVAL, TIMEOUT);
        hb.start(Arc::downgrade(&peer));
        assert_eq!(hb.state(), HeartbeatState::Monitoring);

        time::sleep(TIMEOUT + Duration::from_millis(10)).await;
        assert_eq!(peer.sent(), vec![Packet::Ping]);
        assert_eq!(peer.timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(hb.state(), HeartbeatState::Closed);

        time::sleep(INTERVAL * 3).await;
        assert_eq!(peer.timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(peer.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn initiator_keeps_alive_with_pongs() {
        let peer = Arc::new(MockPeer::default());
        let hb = Heartbeat::new(HeartbeatMode::Initiator, INTERVAL, TIMEOUT);
        hb.start(Arc::downgrade(&peer));

        time::sleep(Duration::from_millis(50)).await;
        hb.notify();
        time::sleep(INTERVAL).await;
        hb.notify();
        time::sleep(INTERVAL).await;
        hb.notify();
        time::sleep(Duration::from_millis(100)).await;

        assert_eq!(peer.timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(peer.sent(), vec![Packet::Ping; 3]);
        assert_eq!(hb.last_rtt(), Some(Duration::from_millis(50)));
        assert_eq!(hb.state(), HeartbeatState::Monitoring);
    }

    #[tokio::test(start_paused = true)]
    async fn responder_answers_pings() {
        let peer = Arc::new(MockPeer::default());
        let hb = Heartbeat::new(HeartbeatMode::Responder, INTERVAL, TIMEOUT);
        hb.start(Arc::downgrade(&peer));

        time::sleep(INTERVAL).await;
        hb.notify();
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(peer.sent(), vec![Packet::Pong]);

        time::sleep(INTERVAL + TIMEOUT).await;
        assert_eq!(peer.timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(hb.state(), HeartbeatState::Closed);
        assert!(hb.last_rtt().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn upgrade_pauses_heartbeat() {
        let peer = Arc::new(MockPeer::default());
        peer.upgrading.store(true, Ordering::SeqCst);
        let hb = Heartbeat::new(HeartbeatMode::Initiator, INTERVAL, TIMEOUT);
        hb.start(Arc::downgrade(&peer));

        time::sleep(INTERVAL * 4).await;
        assert!(peer.sent().is_empty());
        assert_eq!(peer.timeouts.load(Ordering::SeqCst), 0);

        let hb = Heartbeat::new(HeartbeatMode::Responder, INTERVAL, TIMEOUT);
        hb.start(Arc::downgrade(&peer));
        time::sleep((INTERVAL + TIMEOUT) * 3).await;
        assert_eq!(peer.timeouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_failures_are_retried() {
        let peer = Arc::new(MockPeer::default());
        peer.failures.store(2, Ordering::SeqCst);
        let hb = Heartbeat::new(HeartbeatMode::Initiator, INTERVAL, TIMEOUT);
        hb.start(Arc::downgrade(&peer));

        time::sleep(Duration::from_millis(350)).await;
        assert_eq!(peer.sent(), vec![Packet::Ping]);

        let peer = Arc::new(MockPeer::default());
        peer.failures.store(10, Ordering::SeqCst);
        let hb = Heartbeat::new(HeartbeatMode::Initiator, INTERVAL, TIMEOUT);
        hb.start(Arc::downgrade(&peer));
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(peer.timeouts.load(Ordering::SeqCst), 1);
        assert!(peer.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_timers() {
        let peer = Arc::new(MockPeer::default());
        let hb = Heartbeat::new(HeartbeatMode::Responder, INTERVAL, TIMEOUT);
        hb.start(Arc::downgrade(&peer));
        hb.stop();
        time::sleep((INTERVAL + TIMEOUT) * 2).await;
        assert_eq!(peer.timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(hb.state(), HeartbeatState::Closed);

        // a stopped monitor cannot be restarted
        hb.start(Arc::downgrade(&peer));
        assert_eq!(hb.state(), HeartbeatState::Closed);
    }
}
