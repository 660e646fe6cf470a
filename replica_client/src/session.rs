//! Client session.
//!
//! Mirrors the host's state: identities arrive with `EntitySpawn`, tracked
//! fields are written from host snapshots, trainset aggregates are applied
//! to the local [`ClientWorld`], and jobs, items and players are kept in
//! local copies. The only things a client originates are login, chat, job
//! requests, its own transform and writes to entities it owns.
//!
//! Like the host session this owns no socket; [`crate::client::GameClient`]
//! moves datagrams in and out.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use replica_shared::config::SessionConfig;
use replica_shared::connection::Connection;
use replica_shared::error::{DisconnectReason, ProtocolError};
use replica_shared::event::{EventQueue, SessionEvent};
use replica_shared::identity::{EntityHandle, EntityKind, IdentityRegistry, NetId};
use replica_shared::item::{ItemOutcome, ItemReplicator, ItemStore, ItemUpdate};
use replica_shared::job::{JobMirror, ValidationKind};
use replica_shared::login::{LoginRequest, ModInfo};
use replica_shared::message::{Message, Protocol};
use replica_shared::player::PlayerTransform;
use replica_shared::replication::{CollectMode, ReplicationEngine, SnapshotBatch, SnapshotSource};
use replica_shared::task::TaskRegistry;
use replica_shared::tick::TickClock;
use replica_shared::tracked::ReplicatedField;
use replica_shared::trainset::{TrainsetApply, TrainsetPhysics, TrainsetReceiver, VehicleSink};

/// Interval between login attempts while waiting for an answer.
const LOGIN_RETRY: Duration = Duration::from_millis(500);

/// The local simulation as the client session drives it.
pub trait ClientWorld: VehicleSink {
    /// Creates the local proxy for a host entity. `None` when the local game
    /// has nothing to attach it to; its snapshots are then dropped.
    fn spawn(&mut self, id: NetId, kind: EntityKind, game_id: &str) -> Option<LocalProxy>;

    fn despawn(&mut self, _id: NetId, _handle: EntityHandle) {}
}

/// Local side of a spawned entity. `fields` must be in the order the host
/// registered them.
pub struct LocalProxy {
    pub handle: EntityHandle,
    pub fields: Vec<Box<dyn ReplicatedField>>,
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    /// Login sent, no answer yet.
    Connecting,
    /// Login accepted; world state is streaming in.
    Connected,
    /// `ClientLoaded` sent.
    Ready,
}

/// Another player as this client knows them.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePlayer {
    pub id: u8,
    pub username: String,
    pub guid: Uuid,
    pub ping_ms: u32,
    pub transform: PlayerTransform,
}

pub struct ClientSession<S> {
    config: SessionConfig,
    protocol: Protocol,
    world: S,
    server: SocketAddr,
    state: ClientState,
    conn: Connection,
    player: Option<u8>,
    guid: Uuid,
    mods: Vec<ModInfo>,
    clock: TickClock,
    registry: IdentityRegistry<EntityHandle>,
    engine: ReplicationEngine,
    trainsets: TrainsetReceiver,
    jobs: JobMirror,
    items: ItemStore,
    item_queue: ItemReplicator,
    players: BTreeMap<u8, RemotePlayer>,
    events: EventQueue<SessionEvent>,
    login_started: Option<Instant>,
    next_login: Option<Instant>,
    outgoing: Vec<Bytes>,
}

impl<S: ClientWorld> ClientSession<S> {
    /// `config.server_addr` must parse; `mods` is announced at login.
    pub fn new(
        config: SessionConfig,
        world: S,
        mods: Vec<ModInfo>,
        tasks: TaskRegistry,
        now: Instant,
    ) -> Result<Self, std::net::AddrParseError> {
        let server: SocketAddr = config.server_addr.parse()?;
        Ok(Self {
            protocol: Protocol::new(tasks, config.replication.item_compress_after),
            conn: Connection::new(server, &config.channel, now),
            clock: TickClock::new(config.tick_hz),
            engine: ReplicationEngine::new(config.full_sync_ticks()),
            world,
            server,
            state: ClientState::Disconnected,
            player: None,
            guid: Uuid::new_v4(),
            mods,
            registry: IdentityRegistry::mirror(),
            trainsets: TrainsetReceiver::new(),
            jobs: JobMirror::new(),
            items: ItemStore::new(),
            item_queue: ItemReplicator::new(),
            players: BTreeMap::new(),
            events: EventQueue::new(),
            login_started: None,
            next_login: None,
            outgoing: Vec::new(),
            config,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Assigned by the host at login.
    pub fn player_id(&self) -> Option<u8> {
        self.player
    }

    /// External identity sent at login.
    pub fn guid(&self) -> Uuid {
        self.guid
    }

    pub fn tick(&self) -> u32 {
        self.clock.tick()
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.conn.rtt()
    }

    pub fn world(&self) -> &S {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut S {
        &mut self.world
    }

    pub fn registry(&self) -> &IdentityRegistry<EntityHandle> {
        &self.registry
    }

    pub fn resolve_local_handle(&self, id: NetId) -> Option<EntityHandle> {
        self.registry.resolve(id).copied()
    }

    pub fn trainsets(&self) -> &TrainsetReceiver {
        &self.trainsets
    }

    pub fn jobs(&self) -> &JobMirror {
        &self.jobs
    }

    pub fn items(&self) -> &ItemStore {
        &self.items
    }

    pub fn players(&self) -> impl Iterator<Item = &RemotePlayer> {
        self.players.values()
    }

    pub fn player(&self, id: u8) -> Option<&RemotePlayer> {
        self.players.get(&id)
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain()
    }

    /// Datagrams to send to the server.
    pub fn drain_outgoing(&mut self) -> Vec<(SocketAddr, Bytes)> {
        self.outgoing.extend(self.conn.drain_outgoing());
        let server = self.server;
        self.outgoing.drain(..).map(|d| (server, d)).collect()
    }

    // Connection

    /// Starts logging in. Retries until the host answers or the disconnect
    /// timeout passes.
    pub fn connect(&mut self, now: Instant) {
        if self.state != ClientState::Disconnected {
            debug!(state = ?self.state, "Already connecting");
            return;
        }
        info!(server = %self.server, username = %self.config.player_name, "Connecting to server");
        self.conn = Connection::new(self.server, &self.config.channel, now);
        self.reset_mirrors();
        self.state = ClientState::Connecting;
        self.login_started = Some(now);
        self.send_login(now);
    }

    /// Drops everything learned from a previous session.
    fn reset_mirrors(&mut self) {
        self.registry = IdentityRegistry::mirror();
        self.engine = ReplicationEngine::new(self.config.full_sync_ticks());
        self.trainsets = TrainsetReceiver::new();
        self.jobs = JobMirror::new();
        self.items = ItemStore::new();
        self.item_queue = ItemReplicator::new();
        self.players.clear();
    }

    fn send_login(&mut self, now: Instant) {
        let password = Some(self.config.password.clone()).filter(|p| !p.is_empty());
        let msg = Message::Login(LoginRequest {
            username: self.config.player_name.clone(),
            guid: self.guid,
            password,
            build_version: self.config.build_version.clone(),
            mods: self.mods.clone(),
        });
        self.send(&msg, now);
        self.next_login = Some(now + LOGIN_RETRY);
    }

    /// Tells the host the game finished loading the world.
    pub fn mark_loaded(&mut self, now: Instant) {
        if self.state != ClientState::Connected {
            return;
        }
        self.send(&Message::ClientLoaded, now);
        self.state = ClientState::Ready;
        info!(player = ?self.player, "Client ready");
    }

    /// Leaves the session.
    pub fn disconnect(&mut self, now: Instant) {
        if self.state == ClientState::Disconnected {
            return;
        }
        self.send(&Message::Disconnect(DisconnectReason::DisconnectPeerCalled), now);
        self.close(DisconnectReason::DisconnectPeerCalled, "closed locally".to_string());
    }

    fn close(&mut self, reason: DisconnectReason, detail: String) {
        info!(?reason, detail = %detail, "Disconnected from server");
        self.outgoing.extend(self.conn.drain_outgoing());
        self.state = ClientState::Disconnected;
        self.login_started = None;
        self.next_login = None;
        self.events.push(SessionEvent::disconnected(self.player.take(), reason, detail));
        self.players.clear();
    }

    fn is_joined(&self) -> bool {
        matches!(self.state, ClientState::Connected | ClientState::Ready)
    }

    // Requests

    pub fn send_chat(&mut self, text: &str, now: Instant) {
        if !self.is_joined() || text.trim().is_empty() {
            return;
        }
        self.send(&Message::Chat { text: text.to_string() }, now);
    }

    pub fn send_transform(&mut self, transform: PlayerTransform, now: Instant) {
        let Some(player) = self.player.filter(|_| self.is_joined()) else {
            return;
        };
        self.send(&Message::PlayerTransform { player, transform }, now);
    }

    pub fn request_take(&mut self, job: NetId, now: Instant) {
        if self.is_joined() {
            self.send(&Message::JobTakeRequest { job }, now);
        }
    }

    /// Blocks the job's paper and asks the host to validate it. `false` if
    /// a validation for the job is already pending or the job is unknown.
    pub fn request_validation(&mut self, job: NetId, kind: ValidationKind, now: Instant) -> bool {
        if !self.is_joined() {
            return false;
        }
        let Some(station) = self.jobs.station_of(job) else {
            debug!(job = %job, "Validation for unknown job");
            return false;
        };
        let timeout = self
            .config
            .validation
            .timeout(self.conn.rtt().unwrap_or_default());
        let timeout_ticks = self.clock.ticks_for(timeout);
        let Some(request) = self
            .jobs
            .request_validation(job, station, kind, self.clock.tick(), timeout_ticks)
        else {
            return false;
        };
        debug!(job = %job, ?kind, timeout_ticks, "Requesting validation");
        self.send(&Message::JobValidateRequest(request), now);
        true
    }

    /// Registers a field on an entity this client will write and returns its
    /// ordinal. Writes only stick if the host granted ownership.
    pub fn register_field(&mut self, id: NetId, field: Box<dyn ReplicatedField>) -> Result<u8, ProtocolError> {
        self.engine.register_field(id, field)
    }

    pub fn report_dirty(&mut self, id: NetId) {
        self.engine.report_dirty(id);
    }

    /// Applies a local item change and queues it for the host.
    pub fn queue_item(&mut self, update: ItemUpdate) -> ItemOutcome {
        let outcome = self.items.apply(&update);
        if outcome != ItemOutcome::UnknownItem {
            self.item_queue.queue(update);
        }
        outcome
    }

    // Tick

    /// Runs one client tick. Returns the current tick.
    pub fn tick_once(&mut self, now: Instant) -> u32 {
        match self.state {
            ClientState::Disconnected => {}
            ClientState::Connecting => self.retry_login(now),
            ClientState::Connected | ClientState::Ready => {
                let tick = self.clock.advance();
                for (request, outcome) in self.jobs.poll_timeouts(tick) {
                    self.events.push(SessionEvent::JobValidated {
                        job: request.job,
                        outcome,
                    });
                }

                let frame = self.engine.collect(tick, CollectMode::Client);
                if !frame.delta.is_empty() {
                    self.send(&Message::DeltaSnapshots(frame.delta.clone()), now);
                }
                self.engine.mark_sent(&frame);

                let items = self.item_queue.drain();
                if !items.is_empty() {
                    self.send(&Message::ItemUpdates(items), now);
                }

                if let Err(e) = self.conn.update(now) {
                    warn!(error = %e, "Connection failed");
                    self.close(DisconnectReason::from(&e), e.to_string());
                } else if let Some(sample) = self.conn.take_latency_sample() {
                    trace!(rtt_ms = sample.as_millis() as u64, "Latency sample");
                }
            }
        }
        self.clock.tick()
    }

    fn retry_login(&mut self, now: Instant) {
        let timeout = self.config.channel.disconnect_timeout();
        if self
            .login_started
            .is_some_and(|started| now.saturating_duration_since(started) >= timeout)
        {
            warn!(server = %self.server, "No answer to login");
            self.close(DisconnectReason::ConnectionFailed, "no answer to login".to_string());
            return;
        }
        if self.next_login.is_some_and(|at| now >= at) {
            trace!(server = %self.server, "Resending login");
            self.send_login(now);
        }
    }

    // Receive

    /// Feeds one datagram. Anything not from the server is ignored.
    pub fn handle_datagram(&mut self, from: SocketAddr, datagram: &[u8], now: Instant) {
        if from != self.server {
            trace!(%from, "Ignored datagram from unknown sender");
            return;
        }
        if self.state == ClientState::Disconnected {
            return;
        }
        let payloads = match self.conn.handle_datagram(datagram, now) {
            Ok(payloads) => payloads,
            Err(e) => {
                warn!(error = %e, "Dropped undecodable datagram");
                return;
            }
        };
        for payload in payloads {
            // A disconnect earlier in this datagram ends the session.
            if self.state == ClientState::Disconnected {
                break;
            }
            match self.protocol.decode(&payload) {
                Ok(msg) => self.handle_message(msg),
                Err(e) => warn!(error = %e, "Dropped undecodable message"),
            }
        }
    }

    fn handle_message(&mut self, msg: Message) {
        match msg {
            Message::LoginAccepted { player, tick, tick_rate } => {
                if self.state != ClientState::Connecting {
                    debug!(player, "Ignored repeated login acceptance");
                    return;
                }
                self.clock = TickClock::new(tick_rate);
                self.clock.sync_from_server(tick, self.conn.rtt().unwrap_or_default());
                self.player = Some(player);
                self.state = ClientState::Connected;
                self.login_started = None;
                self.next_login = None;
                info!(player, tick = self.clock.tick(), tick_rate, "Login accepted");
                self.events.push(SessionEvent::Connected { player });
            }
            Message::LoginDenied(denied) => {
                if self.state != ClientState::Connecting {
                    return;
                }
                warn!(reason = %denied, "Login denied");
                let detail = denied.describe();
                self.events.push(SessionEvent::LoginDenied(denied));
                self.close(DisconnectReason::ConnectionRejected, detail);
            }
            Message::Disconnect(reason) => {
                self.close(reason, reason.default_text().to_string());
            }
            msg if !self.is_joined() => {
                debug!(message = msg.name(), "Ignored message before login");
            }
            Message::TickSync { tick } => {
                let synced = self.clock.sync_from_server(tick, self.conn.rtt().unwrap_or_default());
                self.events.push(SessionEvent::TickSynced { tick: synced });
            }
            Message::PlayerJoined { player, username, guid } => {
                self.players.insert(
                    player,
                    RemotePlayer {
                        id: player,
                        username: username.clone(),
                        guid,
                        ping_ms: 0,
                        transform: PlayerTransform::default(),
                    },
                );
                self.events.push(SessionEvent::PlayerJoined { player, username });
            }
            Message::PlayerLeft { player } => {
                if self.players.remove(&player).is_some() {
                    self.events.push(SessionEvent::PlayerLeft { player });
                }
            }
            Message::PingUpdate { player, ping_ms } => {
                if let Some(p) = self.players.get_mut(&player) {
                    p.ping_ms = ping_ms;
                }
            }
            Message::PlayerTransform { player, transform } => {
                if let Some(p) = self.players.get_mut(&player) {
                    p.transform = transform;
                }
            }
            Message::EntitySpawn { id, kind, game_id } => self.on_spawn(id, kind, &game_id),
            Message::EntityDespawn { id } => self.on_despawn(id),
            Message::FullSnapshots(batch) | Message::DeltaSnapshots(batch) => self.on_snapshots(batch),
            Message::TrainsetDescribe(describe) => self.trainsets.on_describe(describe),
            Message::TrainsetSync(physics) => {
                let applied = self.trainsets.apply_reliable(&physics, &mut self.world);
                self.log_trainset_apply(&physics, applied);
            }
            Message::TrainsetPhysics(physics) => {
                let applied = self.trainsets.apply(&physics, &mut self.world);
                self.log_trainset_apply(&physics, applied);
            }
            Message::JobsCreate { station, jobs } => {
                self.jobs.apply_create(station, jobs);
            }
            Message::JobsUpdate(updates) => {
                self.jobs.apply_updates(&updates);
            }
            Message::JobTakeResponse { job, granted, player } => {
                debug!(job = %job, granted, owner = player, "Job take answered");
                self.events.push(SessionEvent::JobTakeAnswered { job, granted });
            }
            Message::JobValidateResponse(response) => {
                if let Some(outcome) = self.jobs.on_validate_response(&response) {
                    self.events.push(SessionEvent::JobValidated {
                        job: response.job,
                        outcome,
                    });
                }
            }
            Message::ItemUpdates(updates) => {
                for update in &updates {
                    if self.items.apply(update) == ItemOutcome::UnknownItem {
                        debug!(item = %update.item, "Update for unknown item");
                    }
                }
            }
            Message::Chat { text } => self.events.push(SessionEvent::Chat { text }),
            other => debug!(message = other.name(), "Unexpected message from server"),
        }
    }

    fn on_spawn(&mut self, id: NetId, kind: EntityKind, game_id: &str) {
        let Some(proxy) = self.world.spawn(id, kind, game_id) else {
            debug!(entity = %id, ?kind, game_id, "No local proxy for entity");
            return;
        };
        if let Err(e) = self.registry.register(id, proxy.handle) {
            warn!(entity = %id, error = %e, "Could not register entity");
            return;
        }
        if !game_id.is_empty() {
            self.registry.bind_game_id(game_id, id);
        }
        for field in proxy.fields {
            if let Err(e) = self.engine.register_field(id, field) {
                warn!(entity = %id, error = %e, "Could not register field");
                break;
            }
        }
        debug!(entity = %id, ?kind, game_id, "Entity spawned");
    }

    fn on_despawn(&mut self, id: NetId) {
        self.engine.remove(id);
        self.trainsets.forget(id);
        match self.registry.unregister(id) {
            Some(handle) => {
                self.world.despawn(id, handle);
                debug!(entity = %id, "Entity despawned");
            }
            None => debug!(entity = %id, "Despawn for unknown entity"),
        }
    }

    fn log_trainset_apply(&self, physics: &TrainsetPhysics, applied: Result<TrainsetApply, ProtocolError>) {
        match applied {
            Ok(TrainsetApply::Applied(_)) => {}
            Ok(TrainsetApply::RigidBodiesOnly(cars)) => {
                trace!(trainset = %physics.trainset, tick = physics.tick, cars, "Late trainset resync")
            }
            Ok(TrainsetApply::Stale) => {
                trace!(trainset = %physics.trainset, tick = physics.tick, "Stale trainset update")
            }
            Err(e) => debug!(trainset = %physics.trainset, error = %e, "Dropped trainset update"),
        }
    }

    fn on_snapshots(&mut self, batch: SnapshotBatch) {
        for snapshot in batch.snapshots {
            if let Err(e) = self.engine.apply_remote_snapshot(
                snapshot.id,
                &snapshot.payload,
                SnapshotSource::Host { tick: batch.tick },
            ) {
                debug!(entity = %snapshot.id, tick = batch.tick, error = %e, "Dropped snapshot");
            }
        }
    }

    // Send

    fn send(&mut self, msg: &Message, now: Instant) {
        let payload = match self.protocol.encode(msg) {
            Ok(payload) => payload,
            Err(e) => {
                error!(message = msg.name(), error = %e, "Failed to encode message");
                return;
            }
        };
        if let Err(e) = self.conn.send(payload, msg.delivery(), now) {
            warn!(error = %e, "Connection failed");
            self.close(DisconnectReason::from(&e), e.to_string());
        }
    }
}
