//! Session manager
//!
//! Owns one room membership. A single task holds the session state and
//! serializes everything that touches it: transport events, console
//! commands, and the heartbeat, snapshot and reveal timers. The console
//! reads a shared [`SessionView`] and a stream of [`SessionEvent`]s.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tally_core::{
    Config, ConnectionStatus, IdentityProvider, LivenessTracker, Participant, PeerId,
    SessionGateway, SessionRecord, SessionState, Settings, UserId,
};
use tally_net::{
    ConnectionState, Endpoint, Envelope, RoomCode, Transport, TransportEvent, TransportOptions,
};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::dispatch::{self, Command, Effect, LocalEffect, Role};
use crate::error::{Error, Result};

const COMMAND_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 64;

/// What a session needs from its surroundings
pub struct SessionContext {
    pub config: Config,
    pub user_id: UserId,
    pub gateway: Box<dyn SessionGateway + Send>,
}

impl SessionContext {
    /// Resolve the stable user identity from `store` and persist records to it
    pub fn from_store<S>(config: Config, store: S) -> Result<Self>
    where
        S: IdentityProvider + SessionGateway + Send + 'static,
    {
        let user_id = store.get_or_create_stable_user_id()?;
        Ok(Self {
            config,
            user_id,
            gateway: Box::new(store),
        })
    }

    fn transport_options(&self) -> TransportOptions {
        let transport = &self.config.transport;
        TransportOptions {
            handshake_timeout: transport.handshake_timeout(),
            poll_interval: transport.poll_interval(),
            max_polls: transport.connect_max_polls,
        }
    }
}

/// Parameters for a new room
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub name: String,
    /// Listen address, the configured one when `None`
    pub listen: Option<SocketAddr>,
    /// Address written into the room code when listening on a wildcard
    pub advertise: Option<IpAddr>,
    pub settings: Settings,
}

/// Read side of a session
#[derive(Debug, Clone)]
pub struct SessionView {
    pub role: Role,
    pub me: PeerId,
    pub user_id: UserId,
    pub name: String,
    pub room_code: RoomCode,
    pub state: SessionState,
    pub connection: ConnectionState,
    /// Relay liveness as seen from here
    pub relay_status: ConnectionStatus,
}

impl SessionView {
    pub fn me(&self) -> Option<&Participant> {
        self.state.participant_by_user(self.user_id)
    }

    pub fn is_host(&self) -> bool {
        self.state.is_user_host(self.user_id)
    }
}

/// Notifications for the console
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged,
    ConnectionChanged(ConnectionState),
    Failed(String),
}

enum SessionCommand {
    Act(Command),
    Reconnect(oneshot::Sender<Result<()>>),
    Shutdown {
        clear: bool,
        done: oneshot::Sender<()>,
    },
}

/// Session handle
pub struct SessionManager {
    view: Arc<RwLock<SessionView>>,
    events: mpsc::Receiver<SessionEvent>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    task: JoinHandle<()>,
}

/// Everything a constructor resolves before the task starts
struct Setup {
    role: Role,
    transport: Transport,
    transport_events: mpsc::Receiver<TransportEvent>,
    relay: PeerId,
    room_code: RoomCode,
    name: String,
    state: SessionState,
    is_creator: bool,
    claim_pending: bool,
    pending_host: Option<UserId>,
}

impl SessionManager {
    /// Open a new room with this process as relay and first facilitator
    pub async fn create_room(ctx: SessionContext, options: CreateOptions) -> Result<Self> {
        let listen = options.listen.unwrap_or(ctx.config.transport.listen);
        let (transport, transport_events) =
            Transport::initialize(None, Endpoint::Listen(listen), ctx.transport_options()).await?;

        let me = transport.identity();
        let bound = transport.local_addr().await.unwrap_or(listen);
        let room_code = RoomCode::from_addr(advertised(bound, options.advertise), me);
        let state = SessionState::with_creator(
            me,
            ctx.user_id,
            options.name.clone(),
            options.settings,
            Utc::now(),
        );

        info!(room = %room_code, name = %options.name, "Room created");
        let setup = Setup {
            role: Role::Relay,
            transport,
            transport_events,
            relay: me,
            room_code,
            name: options.name,
            state,
            is_creator: true,
            claim_pending: false,
            pending_host: None,
        };
        Ok(Self::spawn(ctx, setup).await)
    }

    /// Attach to an existing room as a member
    pub async fn join_room(ctx: SessionContext, room_code: RoomCode, name: String) -> Result<Self> {
        let join = Envelope::Join {
            name: name.clone(),
            user_id: ctx.user_id,
        };
        let (transport, transport_events) = dial(&ctx, &room_code, join).await?;

        info!(room = %room_code, name = %name, "Joined room");
        let setup = Setup {
            role: Role::Member,
            transport,
            transport_events,
            relay: room_code.relay,
            room_code,
            name,
            state: SessionState::default(),
            is_creator: false,
            claim_pending: false,
            pending_host: None,
        };
        Ok(Self::spawn(ctx, setup).await)
    }

    /// Resume from a saved record.
    ///
    /// The creator listens again under the room identity on the same port,
    /// and hands facilitation back to the saved holder once they reattach.
    /// A member dials with a fresh transport identity and sends REJOIN; if it
    /// was facilitator when the record was written and someone else holds the
    /// role now, it claims it back once welcomed.
    pub async fn rejoin_room(ctx: SessionContext, record: SessionRecord) -> Result<Self> {
        let room_code = RoomCode::parse(&record.room_code)?;

        if record.is_room_creator {
            let listen = SocketAddr::new(ctx.config.transport.listen.ip(), room_code.port);
            let (transport, transport_events) = Transport::initialize(
                Some(room_code.relay),
                Endpoint::Listen(listen),
                ctx.transport_options(),
            )
            .await?;

            let state = SessionState::with_creator(
                room_code.relay,
                ctx.user_id,
                record.name.clone(),
                record.settings,
                Utc::now(),
            );

            // Facilitation goes back to its saved holder when they return
            let pending_host = record.host_user_id.filter(|host| *host != ctx.user_id);

            info!(room = %room_code, ?pending_host, "Room reopened");
            let setup = Setup {
                role: Role::Relay,
                transport,
                transport_events,
                relay: room_code.relay,
                room_code,
                name: record.name,
                state,
                is_creator: true,
                claim_pending: false,
                pending_host,
            };
            return Ok(Self::spawn(ctx, setup).await);
        }

        let rejoin = Envelope::Rejoin {
            user_id: ctx.user_id,
            name: record.name.clone(),
        };
        let (transport, transport_events) = dial(&ctx, &room_code, rejoin).await?;

        info!(room = %room_code, name = %record.name, "Rejoined room");
        let setup = Setup {
            role: Role::Member,
            transport,
            transport_events,
            relay: room_code.relay,
            room_code,
            name: record.name,
            state: SessionState::default(),
            is_creator: false,
            claim_pending: record.is_host,
            pending_host: None,
        };
        Ok(Self::spawn(ctx, setup).await)
    }

    /// Rejoin whatever the gateway has saved
    pub async fn resume(ctx: SessionContext) -> Result<Self> {
        let record = ctx.gateway.load()?.ok_or(Error::NothingToResume)?;
        Self::rejoin_room(ctx, record).await
    }

    async fn spawn(ctx: SessionContext, setup: Setup) -> Self {
        let view = Arc::new(RwLock::new(SessionView {
            role: setup.role,
            me: setup.transport.identity(),
            user_id: ctx.user_id,
            name: setup.name.clone(),
            room_code: setup.room_code,
            state: setup.state.clone(),
            connection: setup.transport.state().await,
            relay_status: ConnectionStatus::Online,
        }));

        let (event_tx, events) = mpsc::channel(EVENT_QUEUE);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);

        let mut liveness = LivenessTracker::new(ctx.config.heartbeat.thresholds());
        let now = Utc::now();
        if setup.role == Role::Member {
            liveness.record(setup.relay, now);
        }

        let runner = Runner {
            role: setup.role,
            me: setup.transport.identity(),
            transport: setup.transport,
            transport_events: setup.transport_events,
            relay: setup.relay,
            room_code: setup.room_code,
            user_id: ctx.user_id,
            name: setup.name,
            state: setup.state,
            liveness,
            is_creator: setup.is_creator,
            claim_pending: setup.claim_pending,
            pending_host: setup.pending_host,
            rejoin_pending: false,
            config: ctx.config,
            gateway: Mutex::new(ctx.gateway),
            last_record: None,
            view: view.clone(),
            event_tx,
        };
        let task = tokio::spawn(runner.run(cmd_rx));

        Self {
            view,
            events,
            cmd_tx,
            task,
        }
    }

    /// Apply a local action
    pub async fn act(&self, command: Command) -> Result<()> {
        self.cmd_tx
            .send(SessionCommand::Act(command))
            .await
            .map_err(|_| Error::Closed)
    }

    /// Cast a vote, or withdraw it with `None`
    pub async fn vote(&self, value: Option<String>) -> Result<()> {
        self.act(Command::Vote(value)).await
    }

    pub async fn reveal(&self) -> Result<()> {
        self.act(Command::Reveal).await
    }

    pub async fn hide(&self) -> Result<()> {
        self.act(Command::Hide).await
    }

    pub async fn reset(&self) -> Result<()> {
        self.act(Command::Reset).await
    }

    pub async fn transfer_host_to(&self, user_id: UserId) -> Result<()> {
        self.act(Command::TransferHost(user_id)).await
    }

    pub async fn update_settings(&self, settings: Settings) -> Result<()> {
        self.act(Command::UpdateSettings(settings)).await
    }

    /// Re-establish the relay channel (member) or listener (relay).
    ///
    /// Returns once the attempt is under way; the outcome arrives as a
    /// connection event.
    pub async fn reconnect(&self) -> Result<()> {
        let (reply, outcome) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Reconnect(reply))
            .await
            .map_err(|_| Error::Closed)?;
        outcome.await.map_err(|_| Error::Closed)?
    }

    pub async fn snapshot(&self) -> SessionView {
        self.view.read().await.clone()
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Tear down the transport, keeping the saved record for a later resume
    pub async fn dispose(self) {
        self.shutdown(false).await;
    }

    /// Leave for good: tear down and forget the saved record
    pub async fn leave(self) {
        self.shutdown(true).await;
    }

    async fn shutdown(self, clear: bool) {
        let (done, finished) = oneshot::channel();
        if self
            .cmd_tx
            .send(SessionCommand::Shutdown { clear, done })
            .await
            .is_ok()
        {
            let _ = finished.await;
        }
        let _ = self.task.await;
    }
}

/// Dial the relay, wait for the channel and send the attach message
async fn dial(
    ctx: &SessionContext,
    room_code: &RoomCode,
    attach: Envelope,
) -> Result<(Transport, mpsc::Receiver<TransportEvent>)> {
    let (transport, events) =
        Transport::initialize(None, Endpoint::Dial, ctx.transport_options()).await?;

    let opened = async {
        transport.connect(room_code).await?;
        transport.wait_until_open(room_code.relay).await?;
        transport.send(attach, Some(room_code.relay)).await
    }
    .await;

    if let Err(e) = opened {
        warn!(room = %room_code, error = %e, "Could not reach room");
        transport.destroy().await;
        return Err(e.into());
    }
    Ok((transport, events))
}

/// Room code address: wildcard binds are advertised on the given IP, or loopback
fn advertised(bound: SocketAddr, advertise: Option<IpAddr>) -> SocketAddr {
    let ip = match advertise {
        Some(ip) => ip,
        None if bound.ip().is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        None => bound.ip(),
    };
    SocketAddr::new(ip, bound.port())
}

/// The session task
struct Runner {
    role: Role,
    me: PeerId,
    transport: Transport,
    transport_events: mpsc::Receiver<TransportEvent>,
    relay: PeerId,
    room_code: RoomCode,
    user_id: UserId,
    name: String,
    state: SessionState,
    liveness: LivenessTracker,
    is_creator: bool,
    /// Claim facilitation back after the next welcome
    claim_pending: bool,
    /// Relay: saved facilitator to restore when they reattach
    pending_host: Option<UserId>,
    /// Send REJOIN when the relay channel reopens
    rejoin_pending: bool,
    config: Config,
    gateway: Mutex<Box<dyn SessionGateway + Send>>,
    last_record: Option<SessionRecord>,
    view: Arc<RwLock<SessionView>>,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl Runner {
    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        let mut heartbeat = interval(self.config.heartbeat.interval());
        let mut snapshot = interval(self.config.relay.snapshot_interval());
        let mut reveal = interval(self.config.relay.reveal_tick());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        snapshot.set_missed_tick_behavior(MissedTickBehavior::Delay);
        reveal.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let is_relay = self.role == Role::Relay;
        self.publish().await;

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(SessionCommand::Act(command)) => self.act(command).await,
                        Some(SessionCommand::Reconnect(reply)) => {
                            let outcome = self.reconnect().await;
                            let _ = reply.send(outcome);
                        }
                        Some(SessionCommand::Shutdown { clear, done }) => {
                            self.shutdown(clear).await;
                            let _ = done.send(());
                            break;
                        }
                        None => {
                            debug!("Session handle dropped");
                            self.shutdown(false).await;
                            break;
                        }
                    }
                }
                event = self.transport_events.recv() => {
                    match event {
                        Some(event) => self.on_transport_event(event).await,
                        None => {
                            debug!("Transport event stream ended");
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => self.heartbeat().await,
                _ = snapshot.tick(), if is_relay => self.refresh_snapshot().await,
                _ = reveal.tick(), if is_relay => self.reveal_tick().await,
            }
        }
    }

    async fn act(&mut self, command: Command) {
        let now = Utc::now();
        let effect =
            dispatch::apply_local(&mut self.state, self.role, self.relay, self.me, &command, now);

        match effect {
            None => {
                debug!(?command, "Action ignored");
                return;
            }
            Some(LocalEffect::Broadcast) => {
                if matches!(command, Command::TransferHost(_) | Command::ClaimHost) {
                    self.pending_host = None;
                }
                self.broadcast().await
            }
            Some(LocalEffect::Forward(envelope)) => {
                if let Err(e) = self.transport.send(envelope, Some(self.relay)).await {
                    warn!(error = %e, "Could not forward action to relay");
                    self.emit(SessionEvent::Failed(e.to_string()));
                }
            }
        }
        self.publish().await;
    }

    async fn reconnect(&mut self) -> Result<()> {
        info!(room = %self.room_code, "Reconnecting");
        if self.role == Role::Member {
            if self.transport.is_open(self.relay).await {
                self.send_to(self.relay, self.rejoin_message()).await;
                return Ok(());
            }
            self.rejoin_pending = true;
        }
        self.transport.reconnect().await?;
        Ok(())
    }

    fn rejoin_message(&self) -> Envelope {
        Envelope::Rejoin {
            user_id: self.user_id,
            name: self.name.clone(),
        }
    }

    async fn shutdown(&mut self, clear: bool) {
        if clear {
            match self.gateway.lock() {
                Ok(gateway) => {
                    if let Err(e) = gateway.clear() {
                        warn!(error = %e, "Failed to clear saved session");
                    }
                }
                Err(_) => warn!("Session store lock poisoned"),
            }
        }
        self.transport.destroy().await;
        self.view.write().await.connection = ConnectionState::Destroyed;
        info!(room = %self.room_code, "Session closed");
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        let now = Utc::now();
        match event {
            TransportEvent::StateChanged(state) => {
                self.view.write().await.connection = state;
                if state == ConnectionState::Disconnected && self.role == Role::Member {
                    warn!(room = %self.room_code, "Lost the relay, reconnect to resume");
                }
                self.emit(SessionEvent::ConnectionChanged(state));
            }
            TransportEvent::ChannelOpened(peer) => {
                self.liveness.record(peer, now);
                if self.role == Role::Member && peer == self.relay && self.rejoin_pending {
                    self.rejoin_pending = false;
                    self.send_to(peer, self.rejoin_message()).await;
                }
            }
            TransportEvent::ChannelClosed(peer) => {
                self.liveness.forget(peer);
                if self.role == Role::Relay {
                    match self.state.remove(peer, now) {
                        Some(gone) => {
                            info!(peer = %peer, name = %gone.name, "Participant left");
                            self.broadcast().await;
                            self.publish().await;
                        }
                        None => debug!(peer = %peer, "Closed channel was not in the roster"),
                    }
                }
            }
            TransportEvent::Message { from, envelope } => self.on_message(from, envelope).await,
            TransportEvent::Failed(e) => {
                warn!(error = %e, "Transport failure");
                self.emit(SessionEvent::Failed(e.to_string()));
            }
        }
    }

    async fn on_message(&mut self, from: PeerId, envelope: Envelope) {
        let now = Utc::now();
        let effects = match self.role {
            Role::Relay => dispatch::dispatch_relay(
                &mut self.state,
                &mut self.liveness,
                self.relay,
                from,
                envelope,
                now,
            ),
            Role::Member => dispatch::dispatch_replica(
                &mut self.state,
                &mut self.liveness,
                self.relay,
                from,
                envelope,
                now,
            ),
        };
        if self.role == Role::Relay {
            self.restore_pending_host();
        }

        let mut changed = false;
        for effect in effects {
            match effect {
                Effect::Broadcast => {
                    self.broadcast().await;
                    changed = true;
                }
                Effect::Welcome(peer) => {
                    self.send_to(peer, Envelope::Welcome(self.state.clone()))
                        .await
                }
                Effect::Reply(peer, reply) => self.send_to(peer, reply).await,
                Effect::Replaced => changed = true,
            }
        }

        if changed {
            self.publish().await;
            if self.claim_pending {
                self.reclaim_host().await;
            }
        }
    }

    /// Hand facilitation to the saved holder once they are back in the roster.
    /// They can only reappear through JOIN or REJOIN, which always rebroadcast.
    fn restore_pending_host(&mut self) {
        let Some(user_id) = self.pending_host else {
            return;
        };
        let Some(peer) = self.state.participant_by_user(user_id).map(|p| p.transport_id) else {
            return;
        };
        self.pending_host = None;
        if self.state.transfer_host_to(peer) {
            info!(user_id = %user_id, peer = %peer, "Restored saved facilitator");
        }
    }

    /// After a resume, take facilitation back if it moved while we were away
    async fn reclaim_host(&mut self) {
        if self.state.participant_by_user(self.user_id).is_none() {
            return;
        }
        self.claim_pending = false;
        if !self.state.is_user_host(self.user_id) {
            info!("Reclaiming facilitation");
            self.act(Command::ClaimHost).await;
        }
    }

    async fn heartbeat(&mut self) {
        let now = Utc::now();
        let ping = Envelope::Ping {
            timestamp: now.timestamp_millis(),
        };

        match self.role {
            Role::Relay => self.broadcast_envelope(ping).await,
            Role::Member => {
                if self.transport.is_open(self.relay).await {
                    self.send_to(self.relay, ping).await;
                }
                let status = self.relay_status(now);
                let shown = self.view.read().await.relay_status;
                if shown != status {
                    debug!(?status, "Relay liveness changed");
                    self.publish().await;
                }
            }
        }
    }

    /// Stamp liveness on the roster and retransmit the full snapshot
    async fn refresh_snapshot(&mut self) {
        let now = Utc::now();
        let peers: Vec<PeerId> = self.state.players.iter().map(|p| p.transport_id).collect();

        let mut changed = false;
        for peer in peers {
            let status = if peer == self.me {
                ConnectionStatus::Online
            } else {
                self.liveness.status(peer, now)
            };
            let current = self.state.participant(peer).map(|p| p.connection_status);
            if current != Some(status) {
                self.state.set_connection_status(peer, status);
                changed = true;
            }
        }

        self.broadcast().await;
        if changed {
            self.publish().await;
        }
    }

    async fn reveal_tick(&mut self) {
        if self.state.tick_auto_reveal(Utc::now()) {
            info!("Auto-reveal countdown expired");
            self.broadcast().await;
            self.publish().await;
        }
    }

    async fn broadcast(&self) {
        self.broadcast_envelope(Envelope::UpdateState(self.state.clone()))
            .await;
    }

    async fn broadcast_envelope(&self, envelope: Envelope) {
        if let Err(e) = self.transport.send(envelope, None).await {
            warn!(error = %e, "Broadcast failed");
        }
    }

    async fn send_to(&self, peer: PeerId, envelope: Envelope) {
        if let Err(e) = self.transport.send(envelope, Some(peer)).await {
            debug!(peer = %peer, error = %e, "Send failed");
        }
    }

    fn relay_status(&self, now: chrono::DateTime<Utc>) -> ConnectionStatus {
        match self.role {
            Role::Relay => ConnectionStatus::Online,
            Role::Member => self.liveness.status(self.relay, now),
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.event_tx.try_send(event).is_err() {
            debug!("Console is not keeping up, dropping session event");
        }
    }

    /// Push the state to the view, notify the console, persist if needed
    async fn publish(&mut self) {
        let relay_status = self.relay_status(Utc::now());
        {
            let mut view = self.view.write().await;
            view.state = self.state.clone();
            view.relay_status = relay_status;
        }
        self.emit(SessionEvent::StateChanged);
        self.persist();
    }

    fn record(&self) -> SessionRecord {
        SessionRecord {
            room_code: self.room_code.to_url(),
            is_host: self.pending_host.is_none() && self.state.is_user_host(self.user_id),
            name: self.name.clone(),
            transport_id: self.me,
            user_id: self.user_id,
            is_room_creator: self.is_creator,
            settings: self.state.settings,
            countdown_start_time: self.state.countdown_start_time,
            host_user_id: self
                .pending_host
                .or_else(|| self.state.host().map(|p| p.user_id)),
        }
    }

    /// Save the resume record once we are in the roster and it changed
    fn persist(&mut self) {
        if self.state.participant_by_user(self.user_id).is_none() {
            return;
        }
        let record = self.record();
        if self.last_record.as_ref() == Some(&record) {
            return;
        }
        let saved = match self.gateway.lock() {
            Ok(gateway) => gateway.save(&record),
            Err(_) => {
                warn!("Session store lock poisoned");
                return;
            }
        };
        match saved {
            Ok(()) => self.last_record = Some(record),
            Err(e) => warn!(error = %e, "Failed to save session"),
        }
    }
}
