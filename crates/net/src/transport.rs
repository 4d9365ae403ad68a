//! Point-to-point transport between session peers
//!
//! Each transport owns one identity. A relay listens on a TCP address and
//! accepts channels from members; a member dials the relay named by a room
//! code. Every channel starts with a hello exchange that pairs the two
//! identities, after which both sides exchange [`Envelope`]s.
//!
//! Everything the transport observes is reported on the event receiver
//! returned by [`Transport::initialize`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tally_core::PeerId;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{Error, FailureKind, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{Envelope, Packet};
use crate::room_code::RoomCode;

/// Outbound queue depth per channel
const CHANNEL_QUEUE: usize = 64;

/// Event queue depth
const EVENT_QUEUE: usize = 256;

/// How this transport reaches its peers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Accept channels on this address (relay)
    Listen(SocketAddr),
    /// Dial out to a relay (member)
    Dial,
}

/// Transport connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Destroyed,
}

/// Events reported by the transport
#[derive(Debug)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    ChannelOpened(PeerId),
    ChannelClosed(PeerId),
    Message { from: PeerId, envelope: Envelope },
    Failed(Error),
}

/// Transport tuning
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Bound on bind, dial and hello exchange
    pub handshake_timeout: Duration,
    /// Delay between checks in [`Transport::wait_until_open`]
    pub poll_interval: Duration,
    /// Checks before [`Transport::wait_until_open`] gives up
    pub max_polls: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            max_polls: 100,
        }
    }
}

struct Channel {
    id: u64,
    tx: mpsc::Sender<Packet>,
}

/// State shared by the handle and the channel tasks
struct Shared {
    state: ConnectionState,
    channels: HashMap<PeerId, Channel>,
    next_channel_id: u64,
    local_addr: Option<SocketAddr>,
    listening: bool,
    last_target: Option<RoomCode>,
    last_failure: Option<(FailureKind, String)>,
}

struct Inner {
    identity: PeerId,
    endpoint: Endpoint,
    options: TransportOptions,
    shared: RwLock<Shared>,
    event_tx: mpsc::Sender<TransportEvent>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Transport handle
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Create a transport with the given identity, or a fresh one.
    ///
    /// A listening transport binds before returning, so a taken address
    /// surfaces here as a classified error.
    pub async fn initialize(
        identity: Option<PeerId>,
        endpoint: Endpoint,
        options: TransportOptions,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let identity = identity.unwrap_or_default();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (shutdown_tx, _) = broadcast::channel(1);

        let inner = Arc::new(Inner {
            identity,
            endpoint,
            options,
            shared: RwLock::new(Shared {
                state: ConnectionState::Disconnected,
                channels: HashMap::new(),
                next_channel_id: 1,
                local_addr: None,
                listening: false,
                last_target: None,
                last_failure: None,
            }),
            event_tx,
            shutdown_tx,
        });

        if let Endpoint::Listen(addr) = endpoint {
            inner.listen(addr).await?;
        }

        info!(identity = %identity, ?endpoint, "Transport initialized");
        Ok((Transport { inner }, event_rx))
    }

    pub fn identity(&self) -> PeerId {
        self.inner.identity
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.shared.read().await.state
    }

    /// Bound listen address, if listening
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.shared.read().await.local_addr
    }

    /// Identities with an open channel
    pub async fn open_peers(&self) -> Vec<PeerId> {
        self.inner.shared.read().await.channels.keys().copied().collect()
    }

    pub async fn is_open(&self, peer: PeerId) -> bool {
        self.inner.shared.read().await.channels.contains_key(&peer)
    }

    /// Start opening a channel to the relay named by `target`.
    ///
    /// Returns once the attempt is under way; use [`Self::wait_until_open`]
    /// to wait for the outcome.
    pub async fn connect(&self, target: &RoomCode) -> Result<()> {
        {
            let mut s = self.inner.shared.write().await;
            if s.state == ConnectionState::Destroyed {
                return Err(Error::Destroyed);
            }
            s.last_target = Some(*target);
            s.last_failure = None;
            if s.channels.contains_key(&target.relay) {
                return Ok(());
            }
        }

        if self.inner.endpoint == Endpoint::Dial {
            self.inner.set_state(ConnectionState::Connecting).await;
        }

        debug!(target = %target, "Dialing relay");
        tokio::spawn(dial(self.inner.clone(), *target));
        Ok(())
    }

    /// Poll until a channel to `peer` is open.
    ///
    /// Fails early with the classified cause when the last dial failed, and
    /// with a handshake timeout once the poll budget is spent.
    pub async fn wait_until_open(&self, peer: PeerId) -> Result<()> {
        let options = &self.inner.options;
        for _ in 0..options.max_polls {
            {
                let s = self.inner.shared.read().await;
                if s.state == ConnectionState::Destroyed {
                    return Err(Error::Destroyed);
                }
                if s.channels.contains_key(&peer) {
                    return Ok(());
                }
                if let Some((kind, detail)) = &s.last_failure {
                    return Err(Error::connection(*kind, detail.clone()));
                }
            }
            tokio::time::sleep(options.poll_interval).await;
        }

        Err(Error::connection(
            FailureKind::HandshakeTimeout,
            format!(
                "channel to {} did not open after {} checks",
                peer, options.max_polls
            ),
        ))
    }

    /// Send to one peer, or to every open channel when `target` is `None`.
    ///
    /// Does not wait for queue space: a message for a channel whose queue
    /// is full is dropped.
    pub async fn send(&self, envelope: Envelope, target: Option<PeerId>) -> Result<()> {
        // Clone senders out so no lock is held across the sends
        let targets: Vec<(PeerId, mpsc::Sender<Packet>)> = {
            let s = self.inner.shared.read().await;
            if s.state == ConnectionState::Destroyed {
                return Err(Error::Destroyed);
            }
            match target {
                Some(peer) => {
                    let channel = s.channels.get(&peer).ok_or(Error::NotConnected)?;
                    vec![(peer, channel.tx.clone())]
                }
                None => s
                    .channels
                    .iter()
                    .map(|(peer, channel)| (*peer, channel.tx.clone()))
                    .collect(),
            }
        };

        // Never wait on a slow reader; the next snapshot supersedes a dropped one
        let packet = Packet::Data { envelope };
        for (peer, tx) in targets {
            match tx.try_send(packet.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(peer = %peer, "Outbound queue full, dropping message");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(peer = %peer, "Channel gone before send");
                }
            }
        }
        Ok(())
    }

    /// Re-establish connectivity after a drop.
    ///
    /// A member re-dials its last relay; a relay re-binds if it stopped
    /// listening.
    pub async fn reconnect(&self) -> Result<()> {
        let (state, listening, local_addr, target) = {
            let s = self.inner.shared.read().await;
            (s.state, s.listening, s.local_addr, s.last_target)
        };
        if state == ConnectionState::Destroyed {
            return Err(Error::Destroyed);
        }

        match self.inner.endpoint {
            Endpoint::Listen(addr) => {
                if listening {
                    Ok(())
                } else {
                    self.inner.listen(local_addr.unwrap_or(addr)).await
                }
            }
            Endpoint::Dial => match target {
                Some(target) => self.connect(&target).await,
                None => Err(Error::NotConnected),
            },
        }
    }

    /// Close every channel and stop listening. Idempotent.
    pub async fn destroy(&self) {
        {
            let mut s = self.inner.shared.write().await;
            if s.state == ConnectionState::Destroyed {
                return;
            }
            s.state = ConnectionState::Destroyed;
            s.channels.clear();
            s.listening = false;
        }

        let _ = self.inner.shutdown_tx.send(());
        self.inner
            .emit(TransportEvent::StateChanged(ConnectionState::Destroyed))
            .await;
        info!(identity = %self.inner.identity, "Transport destroyed");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        // Stop background tasks even when destroy was never awaited
        let _ = self.inner.shutdown_tx.send(());
    }
}

impl Inner {
    async fn emit(&self, event: TransportEvent) {
        // Receiver gone means the owner stopped listening
        let _ = self.event_tx.send(event).await;
    }

    async fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut s = self.shared.write().await;
            if s.state == ConnectionState::Destroyed || s.state == state {
                false
            } else {
                s.state = state;
                true
            }
        };
        if changed {
            debug!(?state, "Transport state changed");
            self.emit(TransportEvent::StateChanged(state)).await;
        }
    }

    async fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        self.set_state(ConnectionState::Connecting).await;

        let bound = match timeout(self.options.handshake_timeout, TcpListener::bind(addr)).await {
            Ok(Ok(listener)) => listener
                .local_addr()
                .map(|local| (listener, local))
                .map_err(|e| connection_failure(Error::Io(e))),
            Ok(Err(e)) => Err(connection_failure(Error::classify(e))),
            Err(_) => Err(Error::connection(
                FailureKind::HandshakeTimeout,
                format!("bind on {} did not complete", addr),
            )),
        };

        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                warn!(addr = %addr, error = %e, "Listen failed");
                self.set_state(ConnectionState::Disconnected).await;
                return Err(e);
            }
        };

        {
            let mut s = self.shared.write().await;
            s.local_addr = Some(local_addr);
            s.listening = true;
        }

        info!(addr = %local_addr, identity = %self.identity, "Listening for peers");
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(accept_loop(self.clone(), listener, shutdown_rx));
        self.set_state(ConnectionState::Connected).await;
        Ok(())
    }

    /// Claim the slot for `peer`; `None` if that identity already has one
    async fn register(&self, peer: PeerId, tx: mpsc::Sender<Packet>) -> Option<u64> {
        let mut s = self.shared.write().await;
        if s.state == ConnectionState::Destroyed || s.channels.contains_key(&peer) {
            return None;
        }
        let id = s.next_channel_id;
        s.next_channel_id += 1;
        s.channels.insert(peer, Channel { id, tx });
        Some(id)
    }

    /// Release the slot if it still belongs to channel `id`
    async fn unregister(&self, peer: PeerId, id: u64) -> bool {
        let mut s = self.shared.write().await;
        match s.channels.get(&peer) {
            Some(channel) if channel.id == id => {
                s.channels.remove(&peer);
                true
            }
            _ => false,
        }
    }

    async fn record_failure(&self, err: &Error) {
        if let Error::Connection { kind, detail } = err {
            self.shared.write().await.last_failure = Some((*kind, detail.clone()));
        }
    }

    async fn run_channel(
        self: Arc<Self>,
        peer: PeerId,
        channel_id: u64,
        mut reader: ReadHalf<TcpStream>,
        writer: WriteHalf<TcpStream>,
        rx: mpsc::Receiver<Packet>,
    ) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if self.shared.read().await.state == ConnectionState::Destroyed {
            return;
        }

        let writer_handle = tokio::spawn(writer_task(writer, rx));

        if self.endpoint == Endpoint::Dial {
            self.set_state(ConnectionState::Connected).await;
        }
        info!(peer = %peer, "Channel open");
        self.emit(TransportEvent::ChannelOpened(peer)).await;

        loop {
            tokio::select! {
                result = read_frame(&mut reader) => {
                    match result {
                        Ok(Packet::Data { envelope }) => {
                            self.emit(TransportEvent::Message { from: peer, envelope }).await;
                        }
                        Ok(other) => {
                            debug!(peer = %peer, ?other, "Ignoring handshake packet on open channel");
                        }
                        Err(Error::Malformed(e)) => {
                            debug!(peer = %peer, error = %e, "Dropping malformed message");
                        }
                        Err(Error::ConnectionClosed) => {
                            debug!(peer = %peer, "Connection closed");
                            break;
                        }
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "Read error");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!(peer = %peer, "Channel shutting down");
                    break;
                }
            }
        }

        writer_handle.abort();

        if self.unregister(peer, channel_id).await {
            info!(peer = %peer, "Channel closed");
            self.emit(TransportEvent::ChannelClosed(peer)).await;

            if self.endpoint == Endpoint::Dial && self.shared.read().await.channels.is_empty() {
                self.set_state(ConnectionState::Disconnected).await;
            }
        }
    }
}

/// Accept incoming channels
async fn accept_loop(
    inner: Arc<Inner>,
    listener: TcpListener,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        tokio::spawn(handle_inbound(inner.clone(), stream, addr));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Pair an inbound connection with the dialer's identity
async fn handle_inbound(inner: Arc<Inner>, stream: TcpStream, addr: SocketAddr) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let peer = match timeout(inner.options.handshake_timeout, read_frame(&mut reader)).await {
        Ok(Ok(Packet::Hello { peer_id })) => peer_id,
        Ok(Ok(_)) => {
            warn!(addr = %addr, "Expected hello");
            return;
        }
        Ok(Err(e)) => {
            warn!(addr = %addr, error = %e, "Handshake failed");
            return;
        }
        Err(_) => {
            warn!(addr = %addr, "Handshake timed out");
            return;
        }
    };

    if peer == inner.identity {
        let e = Error::Rejected(format!("{} announced our own identity", addr));
        warn!(addr = %addr, error = %e, "Rejecting channel");
        return;
    }

    let (tx, rx) = mpsc::channel(CHANNEL_QUEUE);
    let Some(channel_id) = inner.register(peer, tx).await else {
        let e = Error::Rejected(format!("identity {} already has a channel", peer));
        warn!(addr = %addr, error = %e, "Rejecting channel");
        return;
    };

    let ack = Packet::HelloAck {
        peer_id: inner.identity,
    };
    if let Err(e) = write_frame(&mut writer, &ack).await {
        warn!(addr = %addr, error = %e, "Handshake reply failed");
        inner.unregister(peer, channel_id).await;
        return;
    }

    inner.run_channel(peer, channel_id, reader, writer, rx).await;
}

/// Dial the relay, exchange hellos, then run the channel
async fn dial(inner: Arc<Inner>, target: RoomCode) {
    let addr = target.socket_addr();
    let identity = inner.identity;

    let attempt = timeout(inner.options.handshake_timeout, async {
        let stream = TcpStream::connect(addr).await.map_err(Error::classify)?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        write_frame(&mut writer, &Packet::Hello { peer_id: identity }).await?;

        match read_frame(&mut reader).await {
            Ok(Packet::HelloAck { peer_id }) if peer_id == target.relay => Ok((reader, writer)),
            Ok(Packet::HelloAck { peer_id }) => Err(Error::connection(
                FailureKind::PeerUnavailable,
                format!("{} answered as {}, not {}", addr, peer_id, target.relay),
            )),
            Ok(_) => Err(Error::Protocol("Expected hello acknowledgement".into())),
            Err(Error::ConnectionClosed) => Err(Error::connection(
                FailureKind::PeerUnavailable,
                format!("{} closed the channel during handshake", addr),
            )),
            Err(e) => Err(e),
        }
    })
    .await;

    let result = match attempt {
        Ok(result) => result.map_err(connection_failure),
        Err(_) => Err(Error::connection(
            FailureKind::HandshakeTimeout,
            format!(
                "no handshake with {} within {:?}",
                addr, inner.options.handshake_timeout
            ),
        )),
    };

    match result {
        Ok((reader, writer)) => {
            let (tx, rx) = mpsc::channel(CHANNEL_QUEUE);
            let registered = inner.register(target.relay, tx).await;
            match registered {
                Some(channel_id) => {
                    inner
                        .run_channel(target.relay, channel_id, reader, writer, rx)
                        .await
                }
                None => debug!(peer = %target.relay, "Channel already open, dropping duplicate"),
            }
        }
        Err(e) => {
            warn!(target = %target, error = %e, "Dial failed");
            inner.record_failure(&e).await;
            if inner.endpoint == Endpoint::Dial {
                inner.set_state(ConnectionState::Disconnected).await;
            }
            inner.emit(TransportEvent::Failed(e)).await;
        }
    }
}

/// Writer task - drains the channel queue onto the socket
async fn writer_task(mut writer: WriteHalf<TcpStream>, mut rx: mpsc::Receiver<Packet>) {
    while let Some(packet) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &packet).await {
            debug!(error = %e, "Write failed");
            break;
        }
    }
}

/// Every dial or bind failure is reported as one of the classified kinds
fn connection_failure(err: Error) -> Error {
    match err {
        Error::Connection { .. } => err,
        Error::Io(e) => match Error::classify(e) {
            Error::Io(e) => Error::connection(FailureKind::PeerUnavailable, e.to_string()),
            classified => classified,
        },
        other => Error::connection(FailureKind::PeerUnavailable, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn quick() -> TransportOptions {
        TransportOptions {
            handshake_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(20),
            max_polls: 100,
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn relay() -> (Transport, mpsc::Receiver<TransportEvent>, RoomCode) {
        let (transport, events) =
            Transport::initialize(None, Endpoint::Listen(loopback()), quick())
                .await
                .unwrap();
        let addr = transport.local_addr().await.unwrap();
        let code = RoomCode::from_addr(addr, transport.identity());
        (transport, events, code)
    }

    async fn member(code: &RoomCode) -> (Transport, mpsc::Receiver<TransportEvent>) {
        let (transport, events) = Transport::initialize(None, Endpoint::Dial, quick())
            .await
            .unwrap();
        transport.connect(code).await.unwrap();
        transport.wait_until_open(code.relay).await.unwrap();
        (transport, events)
    }

    /// Wait for the first event matching `pred`, skipping others
    async fn expect_event<F>(events: &mut mpsc::Receiver<TransportEvent>, pred: F) -> TransportEvent
    where
        F: Fn(&TransportEvent) -> bool,
    {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event stream ended");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_relay_binds_and_reports_connected() {
        let (relay, mut events, code) = relay().await;
        assert_eq!(relay.state().await, ConnectionState::Connected);
        assert!(code.port > 0);
        expect_event(&mut events, |e| {
            matches!(e, TransportEvent::StateChanged(ConnectionState::Connected))
        })
        .await;
        relay.destroy().await;
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let (relay, mut relay_events, code) = relay().await;
        let (member, mut member_events) = member(&code).await;
        assert_eq!(member.state().await, ConnectionState::Connected);

        let opened = expect_event(&mut relay_events, |e| {
            matches!(e, TransportEvent::ChannelOpened(_))
        })
        .await;
        assert!(matches!(opened, TransportEvent::ChannelOpened(p) if p == member.identity()));

        member
            .send(Envelope::Vote { value: Some("5".into()) }, Some(code.relay))
            .await
            .unwrap();
        let received = expect_event(&mut relay_events, |e| {
            matches!(e, TransportEvent::Message { .. })
        })
        .await;
        match received {
            TransportEvent::Message { from, envelope } => {
                assert_eq!(from, member.identity());
                assert_eq!(envelope, Envelope::Vote { value: Some("5".into()) });
            }
            other => panic!("unexpected event {:?}", other),
        }

        relay.send(Envelope::Reveal {}, None).await.unwrap();
        let received = expect_event(&mut member_events, |e| {
            matches!(e, TransportEvent::Message { .. })
        })
        .await;
        assert!(matches!(
            received,
            TransportEvent::Message { envelope: Envelope::Reveal {}, .. }
        ));

        member.destroy().await;
        relay.destroy().await;
    }

    #[tokio::test]
    async fn test_member_destroy_closes_relay_channel() {
        let (relay, mut relay_events, code) = relay().await;
        let (member, _member_events) = member(&code).await;
        let member_id = member.identity();

        member.destroy().await;
        assert_eq!(member.state().await, ConnectionState::Destroyed);

        let closed = expect_event(&mut relay_events, |e| {
            matches!(e, TransportEvent::ChannelClosed(_))
        })
        .await;
        assert!(matches!(closed, TransportEvent::ChannelClosed(p) if p == member_id));
        assert!(relay.open_peers().await.is_empty());
        relay.destroy().await;
    }

    #[tokio::test]
    async fn test_relay_destroy_disconnects_member() {
        let (relay, _relay_events, code) = relay().await;
        let (member, mut member_events) = member(&code).await;

        relay.destroy().await;
        expect_event(&mut member_events, |e| {
            matches!(e, TransportEvent::ChannelClosed(_))
        })
        .await;
        expect_event(&mut member_events, |e| {
            matches!(e, TransportEvent::StateChanged(ConnectionState::Disconnected))
        })
        .await;
        member.destroy().await;
    }

    #[tokio::test]
    async fn test_refused_dial_is_peer_unavailable() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let code = RoomCode::from_addr(addr, PeerId::new());

        let (member, mut events) = Transport::initialize(None, Endpoint::Dial, quick())
            .await
            .unwrap();
        member.connect(&code).await.unwrap();

        let err = member.wait_until_open(code.relay).await.unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::PeerUnavailable));
        expect_event(&mut events, |e| matches!(e, TransportEvent::Failed(_))).await;
        assert_eq!(member.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_wrong_room_identity_is_peer_unavailable() {
        let (relay, _relay_events, code) = relay().await;
        let wrong = RoomCode::from_addr(code.socket_addr(), PeerId::new());

        let (member, _events) = Transport::initialize(None, Endpoint::Dial, quick())
            .await
            .unwrap();
        member.connect(&wrong).await.unwrap();
        let err = member.wait_until_open(wrong.relay).await.unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::PeerUnavailable));
        relay.destroy().await;
    }

    #[tokio::test]
    async fn test_silent_listener_is_handshake_timeout() {
        let listener = TcpListener::bind(loopback()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let accepted = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(accepted);
        });

        let code = RoomCode::from_addr(addr, PeerId::new());
        let (member, _events) = Transport::initialize(None, Endpoint::Dial, quick())
            .await
            .unwrap();
        member.connect(&code).await.unwrap();
        let err = member.wait_until_open(code.relay).await.unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::HandshakeTimeout));
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let (relay, _relay_events, code) = relay().await;
        let shared_id = PeerId::new();

        let (first, _first_events) =
            Transport::initialize(Some(shared_id), Endpoint::Dial, quick())
                .await
                .unwrap();
        first.connect(&code).await.unwrap();
        first.wait_until_open(code.relay).await.unwrap();

        let (second, _second_events) =
            Transport::initialize(Some(shared_id), Endpoint::Dial, quick())
                .await
                .unwrap();
        second.connect(&code).await.unwrap();
        let err = second.wait_until_open(code.relay).await.unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::PeerUnavailable));
        assert_eq!(relay.open_peers().await, vec![shared_id]);

        first.destroy().await;
        relay.destroy().await;
    }

    #[tokio::test]
    async fn test_malformed_message_keeps_channel_open() {
        let (relay, mut relay_events, code) = relay().await;

        let stream = TcpStream::connect(code.socket_addr()).await.unwrap();
        let (mut reader, mut writer) = tokio::io::split(stream);
        let me = PeerId::new();
        write_frame(&mut writer, &Packet::Hello { peer_id: me })
            .await
            .unwrap();
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Packet::HelloAck { peer_id: code.relay }
        );

        let junk = br#"{"kind":"data","envelope":{"type":"VOTE"}}"#;
        writer
            .write_all(&(junk.len() as u32).to_be_bytes())
            .await
            .unwrap();
        writer.write_all(junk).await.unwrap();
        write_frame(
            &mut writer,
            &Packet::Data {
                envelope: Envelope::HostClaim {},
            },
        )
        .await
        .unwrap();

        let received = expect_event(&mut relay_events, |e| {
            matches!(e, TransportEvent::Message { .. })
        })
        .await;
        assert!(matches!(
            received,
            TransportEvent::Message { from, envelope: Envelope::HostClaim {} } if from == me
        ));
        assert!(relay.is_open(me).await);
        relay.destroy().await;
    }

    #[tokio::test]
    async fn test_send_errors() {
        let (relay, _events, _code) = relay().await;
        assert!(matches!(
            relay.send(Envelope::Reset {}, Some(PeerId::new())).await,
            Err(Error::NotConnected)
        ));
        // Broadcast with nobody attached is fine
        relay.send(Envelope::Reset {}, None).await.unwrap();

        relay.destroy().await;
        assert!(matches!(
            relay.send(Envelope::Reset {}, None).await,
            Err(Error::Destroyed)
        ));
        assert!(matches!(relay.reconnect().await, Err(Error::Destroyed)));
    }

    #[tokio::test]
    async fn test_reconnect_needs_a_target() {
        let (member, _events) = Transport::initialize(None, Endpoint::Dial, quick())
            .await
            .unwrap();
        assert!(matches!(member.reconnect().await, Err(Error::NotConnected)));

        let (relay, _relay_events, _code) = relay().await;
        relay.reconnect().await.unwrap();
        assert_eq!(relay.state().await, ConnectionState::Connected);
        relay.destroy().await;
    }

    #[tokio::test]
    async fn test_member_redials_restarted_relay() {
        let (relay, _relay_events, code) = relay().await;
        let (member, mut member_events) = member(&code).await;

        relay.destroy().await;
        expect_event(&mut member_events, |e| {
            matches!(e, TransportEvent::StateChanged(ConnectionState::Disconnected))
        })
        .await;

        // Same identity on a fresh port, as a restarted relay would come back
        let (restarted, _events) = Transport::initialize(
            Some(code.relay),
            Endpoint::Listen(loopback()),
            quick(),
        )
        .await
        .unwrap();
        let moved = RoomCode::from_addr(restarted.local_addr().await.unwrap(), code.relay);
        member.connect(&moved).await.unwrap();
        member.wait_until_open(code.relay).await.unwrap();

        member.reconnect().await.unwrap();
        assert!(member.is_open(code.relay).await);

        member.destroy().await;
        restarted.destroy().await;
    }

    #[tokio::test]
    async fn test_stalled_channel_does_not_block_send() {
        let (relay, _events, _code) = relay().await;
        let stalled = PeerId::new();
        let (tx, mut rx) = mpsc::channel(1);
        relay.inner.register(stalled, tx).await.unwrap();

        let sends = async {
            for round in 0..3 {
                let ping = Envelope::Ping { timestamp: round };
                relay.send(ping.clone(), None).await?;
                relay.send(ping, Some(stalled)).await?;
            }
            Ok::<_, Error>(())
        };
        timeout(Duration::from_secs(1), sends)
            .await
            .expect("send waited on a full queue")
            .unwrap();

        assert!(matches!(
            rx.try_recv(),
            Ok(Packet::Data { envelope: Envelope::Ping { timestamp: 0 } })
        ));
        assert!(rx.try_recv().is_err());

        relay.destroy().await;
    }
}
