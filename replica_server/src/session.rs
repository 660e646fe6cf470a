//! Authoritative host session.
//!
//! Owns every piece of replicated host state: identities, tracked fields,
//! trainsets, jobs, items, players and one [`Connection`] per logged-in
//! peer. Datagrams go in through [`ServerSession::handle_datagram`], one
//! simulation tick runs through [`ServerSession::tick_once`], and whatever must
//! go out is collected with [`ServerSession::drain_outgoing`].
//!
//! No sockets here; see [`crate::server::GameServer`].

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use replica_shared::channel::{DeliveryMethod, Frame};
use replica_shared::chat::{self, ChatDelivery};
use replica_shared::config::SessionConfig;
use replica_shared::connection::Connection;
use replica_shared::error::{ChannelError, DisconnectReason, ProtocolError};
use replica_shared::event::{EventQueue, SessionEvent};
use replica_shared::identity::{EntityHandle, EntityKind, IdentityRegistry, NetId};
use replica_shared::item::{ItemOutcome, ItemReplicator, ItemStore, ItemUpdate};
use replica_shared::job::{JobBoard, JobData, ValidationResponse};
use replica_shared::lobby::LobbyServerData;
use replica_shared::login::{LoginDenied, LoginPolicy, LoginRequest, ModInfo};
use replica_shared::message::{Message, Protocol};
use replica_shared::player::{PlayerRoster, HOST_PLAYER_ID};
use replica_shared::replication::{CollectMode, ReplicationEngine, SnapshotBatch, SnapshotSource};
use replica_shared::task::TaskRegistry;
use replica_shared::tick::TickClock;
use replica_shared::tracked::ReplicatedField;
use replica_shared::trainset::{TrainsetView, TrainsetWatcher, VehicleSource};

/// Snapshots per `FullSnapshots` message when syncing a late joiner.
const JOIN_SNAPSHOT_CHUNK: usize = 64;

/// The host simulation as the session sees it.
pub trait HostWorld: VehicleSource {
    /// Every trainset this tick, in a stable order.
    fn trainsets(&self) -> Vec<TrainsetView>;

    /// In-game time stamped on job transitions.
    fn game_time(&self) -> f32 {
        0.0
    }

    /// Steps the simulation by `dt` seconds before the session ticks.
    fn advance(&mut self, _dt: f32) {}
}

#[derive(Debug)]
struct Peer {
    conn: Connection,
    player: u8,
}

#[derive(Debug, Clone)]
struct Spawned {
    kind: EntityKind,
    game_id: String,
}

pub struct ServerSession<W> {
    config: SessionConfig,
    protocol: Protocol,
    world: W,
    clock: TickClock,
    registry: IdentityRegistry<EntityHandle>,
    spawned: BTreeMap<NetId, Spawned>,
    engine: ReplicationEngine,
    trainsets: TrainsetWatcher,
    jobs: JobBoard,
    items: ItemStore,
    item_queue: ItemReplicator,
    roster: PlayerRoster,
    login: LoginPolicy,
    peers: BTreeMap<SocketAddr, Peer>,
    addrs: HashMap<u8, SocketAddr>,
    server_id: Uuid,
    events: EventQueue<SessionEvent>,
    outgoing: Vec<(SocketAddr, Bytes)>,
    /// Players whose channel failed mid-operation; dropped once it finishes.
    failed: Vec<(u8, ChannelError)>,
    tick_sync_ticks: u32,
}

impl<W: HostWorld> ServerSession<W> {
    /// `mods` is the host's own manifest; clients must match it exactly.
    pub fn new(config: SessionConfig, world: W, mods: Vec<ModInfo>, tasks: TaskRegistry) -> Self {
        let clock = TickClock::new(config.tick_hz);
        let tick_sync_ticks = clock
            .ticks_for(Duration::from_millis(config.replication.tick_sync_interval_ms))
            .max(1);
        let mut roster = PlayerRoster::new();
        roster.add(HOST_PLAYER_ID, &config.player_name, Uuid::nil());
        let full_sync_ticks = config.full_sync_ticks();

        Self {
            protocol: Protocol::new(tasks, config.replication.item_compress_after),
            login: LoginPolicy::from_config(&config, mods),
            world,
            clock,
            registry: IdentityRegistry::host(),
            spawned: BTreeMap::new(),
            engine: ReplicationEngine::new(full_sync_ticks),
            trainsets: TrainsetWatcher::new(full_sync_ticks),
            jobs: JobBoard::new(),
            items: ItemStore::new(),
            item_queue: ItemReplicator::new(),
            roster,
            peers: BTreeMap::new(),
            addrs: HashMap::new(),
            server_id: Uuid::new_v4(),
            events: EventQueue::new(),
            outgoing: Vec::new(),
            failed: Vec::new(),
            tick_sync_ticks,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Session identity answered to server-browser probes.
    pub fn server_id(&self) -> Uuid {
        self.server_id
    }

    pub fn tick(&self) -> u32 {
        self.clock.tick()
    }

    pub fn world(&self) -> &W {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut W {
        &mut self.world
    }

    pub fn roster(&self) -> &PlayerRoster {
        &self.roster
    }

    pub fn registry(&self) -> &IdentityRegistry<EntityHandle> {
        &self.registry
    }

    pub fn items(&self) -> &ItemStore {
        &self.items
    }

    pub fn jobs(&self) -> &JobBoard {
        &self.jobs
    }

    /// Host-driven job transitions; the resulting updates go out next tick.
    pub fn jobs_mut(&mut self) -> &mut JobBoard {
        &mut self.jobs
    }

    /// Logged-in remote players.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn player_addr(&self, player: u8) -> Option<SocketAddr> {
        self.addrs.get(&player).copied()
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain()
    }

    /// Datagrams to send, each with its destination.
    pub fn drain_outgoing(&mut self) -> Vec<(SocketAddr, Bytes)> {
        for (addr, peer) in self.peers.iter_mut() {
            for datagram in peer.conn.drain_outgoing() {
                self.outgoing.push((*addr, datagram));
            }
        }
        std::mem::take(&mut self.outgoing)
    }

    /// What LAN discovery answers with.
    pub fn lobby_info(&self) -> LobbyServerData {
        let (ipv4, port) = self
            .config
            .server_addr
            .parse::<SocketAddr>()
            .map(|a| (a.ip().to_string(), a.port()))
            .unwrap_or_default();
        LobbyServerData {
            id: self.server_id.to_string(),
            ipv4: ipv4.clone(),
            local_ipv4: ipv4,
            port,
            name: self.config.player_name.clone(),
            has_password: !self.config.password.is_empty(),
            current_players: self.roster.len() as i32,
            max_players: i32::from(self.config.max_players),
            game_version: self.config.build_version.clone(),
            multiplayer_version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        }
    }

    // Entities

    /// Mints an identity for `handle` without announcing it. Items and jobs
    /// are announced by their own messages.
    pub fn register_entity(
        &mut self,
        handle: EntityHandle,
        game_id: Option<&str>,
    ) -> Result<NetId, ProtocolError> {
        let id = self.registry.allocate()?;
        self.registry.register(id, handle)?;
        if let Some(game_id) = game_id {
            self.registry.bind_game_id(game_id, id);
        }
        Ok(id)
    }

    /// Mints an identity, registers the entity's tracked fields and
    /// announces it with its initial state.
    pub fn spawn_entity(
        &mut self,
        handle: EntityHandle,
        game_id: Option<&str>,
        fields: Vec<Box<dyn ReplicatedField>>,
        now: Instant,
    ) -> Result<NetId, ProtocolError> {
        let id = self.register_entity(handle, game_id)?;
        for field in fields {
            if let Err(e) = self.engine.register_field(id, field) {
                self.engine.remove(id);
                self.registry.unregister(id);
                return Err(e);
            }
        }
        let game_id = game_id.unwrap_or_default().to_string();
        self.spawned.insert(
            id,
            Spawned {
                kind: handle.kind,
                game_id: game_id.clone(),
            },
        );
        debug!(entity = %id, kind = ?handle.kind, game_id = %game_id, "Spawned entity");

        self.broadcast(
            &Message::EntitySpawn {
                id,
                kind: handle.kind,
                game_id,
            },
            None,
            now,
        );
        if let Some(snapshot) = self.engine.snapshot_entity(id) {
            let batch = SnapshotBatch {
                tick: self.clock.tick(),
                snapshots: vec![snapshot],
            };
            self.broadcast(&Message::FullSnapshots(batch), None, now);
        }
        self.finish(now);
        Ok(id)
    }

    /// Forgets an entity everywhere and tells clients. Returns `false` for
    /// unknown identities.
    pub fn despawn_entity(&mut self, id: NetId, now: Instant) -> bool {
        let Some(handle) = self.registry.unregister(id) else {
            return false;
        };
        self.engine.remove(id);
        self.spawned.remove(&id);
        if let Some(owner) = self.roster.owner_of(id) {
            self.roster.release_ownership(owner, id);
        }
        debug!(entity = %id, kind = ?handle.kind, "Despawned entity");
        self.broadcast(&Message::EntityDespawn { id }, None, now);
        self.finish(now);
        true
    }

    pub fn report_dirty(&mut self, id: NetId) {
        self.engine.report_dirty(id);
    }

    pub fn resolve_local_handle(&self, id: NetId) -> Option<EntityHandle> {
        self.registry.resolve(id).copied()
    }

    /// Lets `player` write `entity`'s tracked fields and items.
    pub fn grant_ownership(&mut self, player: u8, entity: NetId) -> Option<u8> {
        self.roster.take_ownership(player, entity)
    }

    pub fn revoke_ownership(&mut self, player: u8, entity: NetId) -> bool {
        self.roster.release_ownership(player, entity)
    }

    // Items

    /// Applies a host-side item change and queues it for the next tick.
    pub fn queue_item(&mut self, update: ItemUpdate) -> ItemOutcome {
        let outcome = self.items.apply(&update);
        if outcome != ItemOutcome::UnknownItem {
            self.item_queue.queue(update);
        }
        outcome
    }

    // Jobs

    /// Mints identities for `jobs`, puts them on the board and broadcasts
    /// their creation.
    pub fn offer_jobs(
        &mut self,
        station: NetId,
        jobs: Vec<(EntityHandle, JobData)>,
        now: Instant,
    ) -> Result<Vec<NetId>, ProtocolError> {
        let mut created = Vec::with_capacity(jobs.len());
        for (handle, mut job) in jobs {
            job.net_id = self.register_entity(handle, Some(&job.game_id))?;
            self.jobs.add(station, job.clone())?;
            created.push(job);
        }
        let ids: Vec<NetId> = created.iter().map(|j| j.net_id).collect();
        info!(station = %station, jobs = ids.len(), "Offered jobs");
        self.broadcast(
            &Message::JobsCreate {
                station,
                jobs: created,
            },
            None,
            now,
        );
        self.finish(now);
        Ok(ids)
    }

    /// Drops a job; clients learn on the next tick.
    pub fn remove_job(&mut self, job: NetId) -> Option<JobData> {
        let data = self.jobs.remove(job)?;
        self.registry.unregister(job);
        Some(data)
    }

    // Players

    /// Host-side chat line, processed like any player's.
    pub fn host_chat(&mut self, text: &str, now: Instant) {
        self.on_chat(HOST_PLAYER_ID, text, now);
        self.finish(now);
    }

    pub fn kick(&mut self, player: u8, now: Instant) -> bool {
        let Some(addr) = self.addrs.get(&player).copied() else {
            return false;
        };
        info!(player, %addr, "Kicking player");
        self.send_unconnected(addr, &Message::Disconnect(DisconnectReason::Kicked));
        self.drop_player(player, DisconnectReason::Kicked, "kicked by host".to_string(), now);
        self.finish(now);
        true
    }

    /// Tells every peer the server is going away and forgets them.
    pub fn shutdown(&mut self, now: Instant) {
        let players: Vec<(u8, SocketAddr)> = self.addrs.iter().map(|(p, a)| (*p, *a)).collect();
        for (player, addr) in players {
            self.send_unconnected(addr, &Message::Disconnect(DisconnectReason::ServerShutdown));
            self.drop_player(player, DisconnectReason::ServerShutdown, "server shutdown".to_string(), now);
        }
        info!("Session shut down");
    }

    // Tick

    /// Runs one host tick: replication, trainsets, jobs, items, tick sync
    /// and connection housekeeping. Returns the new tick.
    pub fn tick_once(&mut self, now: Instant) -> u32 {
        let tick = self.clock.advance();

        let frame = self.engine.collect(tick, CollectMode::Host);
        if !frame.full.is_empty() {
            self.broadcast(&Message::FullSnapshots(frame.full.clone()), None, now);
        }
        if !frame.delta.is_empty() {
            self.broadcast(&Message::DeltaSnapshots(frame.delta.clone()), None, now);
        }
        self.engine.mark_sent(&frame);

        let sets = self.world.trainsets();
        for output in self.trainsets.tick(tick, &sets, &self.world) {
            if let Some(describe) = output.describe {
                self.broadcast(&Message::TrainsetDescribe(describe), None, now);
            }
            let msg = if output.reliable {
                Message::TrainsetSync(output.physics)
            } else {
                Message::TrainsetPhysics(output.physics)
            };
            self.broadcast(&msg, None, now);
        }

        let updates = self.jobs.drain_updates();
        if !updates.is_empty() {
            self.broadcast(&Message::JobsUpdate(updates), None, now);
        }

        let items = self.item_queue.drain();
        if !items.is_empty() {
            self.broadcast(&Message::ItemUpdates(items), None, now);
        }

        if tick % self.tick_sync_ticks == 0 {
            self.broadcast(&Message::TickSync { tick }, None, now);
        }

        self.update_connections(now);
        self.finish(now);
        tick
    }

    fn update_connections(&mut self, now: Instant) {
        let mut pings = Vec::new();
        for peer in self.peers.values_mut() {
            if let Err(e) = peer.conn.update(now) {
                self.failed.push((peer.player, e));
                continue;
            }
            if let Some(sample) = peer.conn.take_latency_sample() {
                pings.push((peer.player, sample.as_millis() as u32));
            }
        }
        for (player, ping_ms) in pings {
            if let Some(p) = self.roster.get_mut(player) {
                p.ping_ms = ping_ms;
            }
            self.broadcast(&Message::PingUpdate { player, ping_ms }, None, now);
        }
    }

    // Receive

    /// Feeds one datagram from `from`.
    pub fn handle_datagram(&mut self, from: SocketAddr, datagram: &[u8], now: Instant) {
        if let Some(peer) = self.peers.get_mut(&from) {
            let player = peer.player;
            match peer.conn.handle_datagram(datagram, now) {
                Ok(payloads) => {
                    for payload in payloads {
                        self.handle_payload(from, Some(player), &payload, now);
                    }
                }
                Err(e) => warn!(player, %from, error = %e, "Dropped undecodable datagram"),
            }
        } else {
            match Frame::decode(datagram) {
                Ok(Frame::Unconnected(payload)) => self.handle_payload(from, None, &payload, now),
                Ok(frame) => trace!(%from, kind = ?frame.kind(), "Ignored frame from unknown peer"),
                Err(e) => warn!(%from, error = %e, "Dropped undecodable datagram"),
            }
        }
        self.finish(now);
    }

    fn handle_payload(&mut self, from: SocketAddr, player: Option<u8>, payload: &[u8], now: Instant) {
        let msg = match self.protocol.decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(%from, error = %e, "Dropped undecodable message");
                return;
            }
        };
        // The player may have been dropped by an earlier message in this
        // datagram.
        let player = player.filter(|p| self.addrs.contains_key(p));
        match (player, msg) {
            (_, Message::ServerPing { server_id }) => {
                if server_id == self.server_id {
                    self.send_unconnected(from, &Message::ServerPong { server_id });
                } else {
                    debug!(%from, %server_id, "Ping for another server");
                }
            }
            (_, Message::DiscoveryRequest) => {
                let info = self.lobby_info();
                self.send_unconnected(from, &Message::DiscoveryResponse(Box::new(info)));
            }
            (None, Message::Login(request)) => self.on_login(from, request, now),
            (Some(player), Message::Login(_)) => debug!(player, "Ignored repeated login"),
            (Some(player), msg) => self.on_player_message(player, msg, now),
            (None, msg) => debug!(%from, message = msg.name(), "Ignored message from unknown peer"),
        }
    }

    fn on_login(&mut self, from: SocketAddr, request: LoginRequest, now: Instant) {
        let verdict = self
            .login
            .evaluate(&request, self.roster.len())
            .and_then(|()| {
                self.free_player_id().ok_or(LoginDenied::ServerFull {
                    max_players: self.config.max_players,
                })
            });
        let player = match verdict {
            Ok(player) => player,
            Err(denied) => {
                info!(%from, username = %request.username, reason = %denied, "Login denied");
                self.send_unconnected(from, &Message::LoginDenied(denied));
                return;
            }
        };

        let username = self
            .roster
            .add(player, &request.username, request.guid)
            .username
            .clone();
        self.peers.insert(
            from,
            Peer {
                conn: Connection::new(from, &self.config.channel, now),
                player,
            },
        );
        self.addrs.insert(player, from);
        info!(player, %from, username = %username, "Player connected");

        self.send_to(
            player,
            &Message::LoginAccepted {
                player,
                tick: self.clock.tick(),
                tick_rate: self.clock.tick_rate(),
            },
            now,
        );
        self.send_world_state(player, now);
        self.broadcast(
            &Message::PlayerJoined {
                player,
                username: username.clone(),
                guid: request.guid,
            },
            Some(player),
            now,
        );
        self.events.push(SessionEvent::Connected { player });
        self.events.push(SessionEvent::PlayerJoined { player, username });
    }

    fn free_player_id(&self) -> Option<u8> {
        (1..=u8::MAX).find(|id| self.roster.get(*id).is_none())
    }

    /// Everything a late joiner needs, in dependency order: players,
    /// entities and their state, trainsets, jobs, items.
    fn send_world_state(&mut self, player: u8, now: Instant) {
        let mut msgs: Vec<Message> = self
            .roster
            .iter()
            .filter(|p| p.id != player)
            .map(|p| Message::PlayerJoined {
                player: p.id,
                username: p.username.clone(),
                guid: p.guid,
            })
            .collect();
        msgs.extend(self.spawned.iter().map(|(id, s)| Message::EntitySpawn {
            id: *id,
            kind: s.kind,
            game_id: s.game_id.clone(),
        }));
        let full = self.engine.snapshot_all(self.clock.tick());
        msgs.extend(full.snapshots.chunks(JOIN_SNAPSHOT_CHUNK).map(|chunk| {
            Message::FullSnapshots(SnapshotBatch {
                tick: full.tick,
                snapshots: chunk.to_vec(),
            })
        }));
        msgs.extend(
            self.trainsets
                .descriptions()
                .into_iter()
                .map(Message::TrainsetDescribe),
        );
        msgs.extend(
            self.jobs
                .by_station()
                .into_iter()
                .map(|(station, jobs)| Message::JobsCreate {
                    station,
                    jobs: jobs.into_iter().cloned().collect(),
                }),
        );
        let items = self.items.snapshot();
        if !items.is_empty() {
            msgs.push(Message::ItemUpdates(items));
        }

        debug!(player, messages = msgs.len(), "Sending world state");
        for msg in &msgs {
            self.send_to(player, msg, now);
        }
    }

    fn on_player_message(&mut self, player: u8, msg: Message, now: Instant) {
        match msg {
            Message::ClientLoaded => {
                if let Some(p) = self.roster.get_mut(player) {
                    p.is_loaded = true;
                }
                info!(player, "Client finished loading");
            }
            Message::Chat { text } => self.on_chat(player, &text, now),
            Message::JobTakeRequest { job } => {
                let result = self.jobs.take(job, player, self.world.game_time());
                if let Err(denial) = result {
                    debug!(player, job = %job, ?denial, "Job take denied");
                }
                let owner = self.jobs.owner_of(job).unwrap_or(player);
                self.send_to(
                    player,
                    &Message::JobTakeResponse {
                        job,
                        granted: result.is_ok(),
                        player: owner,
                    },
                    now,
                );
            }
            Message::JobValidateRequest(request) => {
                let outcome = self.jobs.validate(&request, player, self.world.game_time());
                self.send_to(
                    player,
                    &Message::JobValidateResponse(ValidationResponse {
                        job: request.job,
                        outcome,
                    }),
                    now,
                );
            }
            Message::DeltaSnapshots(batch) => self.on_client_snapshots(player, batch, now),
            Message::PlayerTransform { transform, .. } => {
                if let Some(p) = self.roster.get_mut(player) {
                    p.transform = transform;
                }
                self.broadcast(&Message::PlayerTransform { player, transform }, Some(player), now);
            }
            Message::ItemUpdates(updates) => self.on_client_items(player, updates),
            Message::Disconnect(reason) => {
                info!(player, ?reason, "Player disconnected");
                self.drop_player(player, reason, "closed by client".to_string(), now);
            }
            other => debug!(player, message = other.name(), "Unexpected message from client"),
        }
    }

    /// Applies the snapshots `player` may write and relays them to everyone
    /// else.
    fn on_client_snapshots(&mut self, player: u8, batch: SnapshotBatch, now: Instant) {
        let mut relayed = Vec::new();
        for snapshot in batch.snapshots {
            if !self.roster.may_write(player, snapshot.id) {
                let e = ProtocolError::NotOwner {
                    player,
                    entity: snapshot.id,
                };
                warn!(error = %e, "Rejected client snapshot");
                continue;
            }
            match self
                .engine
                .apply_remote_snapshot(snapshot.id, &snapshot.payload, SnapshotSource::Client)
            {
                // Other peers only see what the host accepted.
                Ok(applied) => relayed.extend(self.engine.snapshot_fields(snapshot.id, &applied)),
                Err(e) => debug!(player, entity = %snapshot.id, tick = batch.tick, error = %e, "Dropped client snapshot"),
            }
        }
        if !relayed.is_empty() {
            self.broadcast(
                &Message::DeltaSnapshots(SnapshotBatch {
                    tick: self.clock.tick(),
                    snapshots: relayed,
                }),
                Some(player),
                now,
            );
        }
    }

    fn on_client_items(&mut self, player: u8, updates: Vec<ItemUpdate>) {
        for update in updates {
            if !self.roster.may_write(player, update.item) {
                warn!(player, item = %update.item, "Rejected item update from non-owner");
                continue;
            }
            if self.items.apply(&update) != ItemOutcome::UnknownItem {
                self.item_queue.queue(update);
            }
        }
    }

    fn on_chat(&mut self, sender: u8, text: &str, now: Instant) {
        for delivery in chat::process(sender, text, &self.roster) {
            match delivery {
                ChatDelivery::Broadcast { text, exclude } => {
                    if exclude != Some(HOST_PLAYER_ID) {
                        self.events.push(SessionEvent::Chat { text: text.clone() });
                    }
                    self.broadcast(&Message::Chat { text }, exclude, now);
                }
                ChatDelivery::Whisper { to, text } if to == HOST_PLAYER_ID => {
                    self.events.push(SessionEvent::Chat { text });
                }
                ChatDelivery::Whisper { to, text } => self.send_to(to, &Message::Chat { text }, now),
            }
        }
    }

    // Send

    fn encode(&self, msg: &Message) -> Option<Bytes> {
        match self.protocol.encode(msg) {
            Ok(payload) => Some(payload),
            Err(e) => {
                error!(message = msg.name(), error = %e, "Failed to encode message");
                None
            }
        }
    }

    fn send_to(&mut self, player: u8, msg: &Message, now: Instant) {
        let Some(addr) = self.addrs.get(&player).copied() else {
            return;
        };
        if let Some(payload) = self.encode(msg) {
            self.send_payload(addr, payload, msg.delivery(), now);
        }
    }

    fn broadcast(&mut self, msg: &Message, exclude: Option<u8>, now: Instant) {
        if self.peers.is_empty() {
            return;
        }
        let Some(payload) = self.encode(msg) else {
            return;
        };
        let targets: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, p)| Some(p.player) != exclude)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in targets {
            self.send_payload(addr, payload.clone(), msg.delivery(), now);
        }
    }

    fn send_payload(&mut self, addr: SocketAddr, payload: Bytes, delivery: DeliveryMethod, now: Instant) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        if let Err(e) = peer.conn.send(payload, delivery, now) {
            self.failed.push((peer.player, e));
        }
    }

    /// Unconnected datagram, also to addresses without a session.
    fn send_unconnected(&mut self, to: SocketAddr, msg: &Message) {
        if let Some(payload) = self.encode(msg) {
            self.outgoing.push((to, Frame::Unconnected(payload).to_bytes()));
        }
    }

    /// Drops players whose channel failed during the last operation.
    fn finish(&mut self, now: Instant) {
        while let Some((player, e)) = self.failed.pop() {
            warn!(player, error = %e, "Connection failed");
            self.drop_player(player, DisconnectReason::from(&e), e.to_string(), now);
        }
    }

    fn drop_player(&mut self, player: u8, reason: DisconnectReason, detail: String, now: Instant) {
        let Some(addr) = self.addrs.remove(&player) else {
            return;
        };
        if let Some(mut peer) = self.peers.remove(&addr) {
            for datagram in peer.conn.drain_outgoing() {
                self.outgoing.push((addr, datagram));
            }
        }
        self.roster.remove(player);
        let released = self.jobs.release_owner(player);
        info!(player, %addr, ?reason, released_jobs = released, "Player left");

        self.broadcast(&Message::PlayerLeft { player }, None, now);
        self.events.push(SessionEvent::disconnected(Some(player), reason, detail));
        self.events.push(SessionEvent::PlayerLeft { player });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_shared::job::{JobState, ValidationKind, ValidationOutcome, ValidationRequest};
    use replica_shared::math::{Quat, Vec3};
    use replica_shared::tracked::TrackedField;
    use std::sync::{Arc, Mutex};

    use crate::world::SimWorld;

    /// Client end of a session, driven by hand.
    struct TestPeer {
        addr: SocketAddr,
        conn: Connection,
        protocol: Protocol,
    }

    impl TestPeer {
        fn new(port: u16, now: Instant) -> Self {
            let server: SocketAddr = "127.0.0.1:7777".parse().unwrap();
            Self {
                addr: SocketAddr::from(([127, 0, 0, 1], port)),
                conn: Connection::new(server, &SessionConfig::default().channel, now),
                protocol: Protocol::default(),
            }
        }

        fn login_datagram(&self, name: &str, build: &str) -> Bytes {
            let msg = Message::Login(LoginRequest {
                username: name.into(),
                guid: Uuid::new_v4(),
                password: None,
                build_version: build.into(),
                mods: Vec::new(),
            });
            Frame::Unconnected(self.protocol.encode(&msg).unwrap()).to_bytes()
        }

        fn send(&mut self, msg: &Message, now: Instant) -> Vec<Bytes> {
            let payload = self.protocol.encode(msg).unwrap();
            self.conn.send(payload, msg.delivery(), now).unwrap();
            self.conn.drain_outgoing()
        }

        /// Feeds every datagram addressed to this peer; returns decoded
        /// messages.
        fn receive(&mut self, out: &[(SocketAddr, Bytes)], now: Instant) -> Vec<Message> {
            let mut msgs = Vec::new();
            for (to, datagram) in out {
                if *to != self.addr {
                    continue;
                }
                for payload in self.conn.handle_datagram(datagram, now).unwrap() {
                    msgs.push(self.protocol.decode(&payload).unwrap());
                }
            }
            msgs
        }
    }

    fn session() -> ServerSession<SimWorld> {
        let config = SessionConfig {
            build_version: "1.0".into(),
            player_name: "Host".into(),
            ..Default::default()
        };
        ServerSession::new(config, SimWorld::new(), Vec::new(), TaskRegistry::new())
    }

    fn join(
        server: &mut ServerSession<SimWorld>,
        port: u16,
        name: &str,
        now: Instant,
    ) -> (TestPeer, Vec<Message>) {
        let mut peer = TestPeer::new(port, now);
        let login = peer.login_datagram(name, "1.0");
        server.handle_datagram(peer.addr, &login, now);
        let out = server.drain_outgoing();
        let msgs = peer.receive(&out, now);
        (peer, msgs)
    }

    #[test]
    fn login_is_accepted_and_announced() {
        let now = Instant::now();
        let mut server = session();
        let (_ada, msgs) = join(&mut server, 5001, "Ada", now);

        assert!(matches!(msgs[0], Message::LoginAccepted { player: 1, tick: 0, tick_rate: 24 }));
        // The host is listed as an existing player.
        assert!(msgs
            .iter()
            .any(|m| matches!(m, Message::PlayerJoined { player: 0, username, .. } if username == "Host")));
        assert_eq!(server.peer_count(), 1);

        let (_bob, _) = join(&mut server, 5002, "Bob", now);
        let events = server.drain_events();
        assert!(events.contains(&SessionEvent::Connected { player: 2 }));
    }

    #[test]
    fn version_mismatch_is_denied_unconnected() {
        let now = Instant::now();
        let mut server = session();
        let peer = TestPeer::new(5001, now);
        server.handle_datagram(peer.addr, &peer.login_datagram("Ada", "0.9"), now);

        let out = server.drain_outgoing();
        assert_eq!(out.len(), 1);
        let Frame::Unconnected(payload) = Frame::decode(&out[0].1).unwrap() else {
            panic!("expected unconnected frame");
        };
        assert_eq!(
            peer.protocol.decode(&payload).unwrap(),
            Message::LoginDenied(LoginDenied::VersionMismatch {
                expected: "1.0".into(),
                got: "0.9".into()
            })
        );
        assert_eq!(server.peer_count(), 0);
    }

    #[test]
    fn ping_is_answered_only_for_own_id() {
        let now = Instant::now();
        let mut server = session();
        let protocol = Protocol::default();
        let from: SocketAddr = "10.0.0.9:4000".parse().unwrap();
        let ping = |id| Frame::Unconnected(protocol.encode(&Message::ServerPing { server_id: id }).unwrap()).to_bytes();

        server.handle_datagram(from, &ping(Uuid::new_v4()), now);
        assert!(server.drain_outgoing().is_empty());

        let own = server.server_id();
        server.handle_datagram(from, &ping(own), now);
        let out = server.drain_outgoing();
        let Frame::Unconnected(payload) = Frame::decode(&out[0].1).unwrap() else {
            panic!("expected unconnected frame");
        };
        assert_eq!(
            protocol.decode(&payload).unwrap(),
            Message::ServerPong { server_id: own }
        );
    }

    #[test]
    fn spawned_entity_reaches_clients_with_state() {
        let now = Instant::now();
        let mut server = session();
        let (mut ada, _) = join(&mut server, 5001, "Ada", now);

        let cell = Arc::new(Mutex::new(42u32));
        let (r, w) = (cell.clone(), cell.clone());
        let field: Box<dyn ReplicatedField> = Box::new(TrackedField::new(
            "fuel",
            move || *r.lock().unwrap(),
            move |v| *w.lock().unwrap() = v,
        ));
        let id = server
            .spawn_entity(EntityHandle::new(EntityKind::Car, 7), Some("L-001"), vec![field], now)
            .unwrap();

        let msgs = ada.receive(&server.drain_outgoing(), now);
        assert_eq!(
            msgs[0],
            Message::EntitySpawn {
                id,
                kind: EntityKind::Car,
                game_id: "L-001".into()
            }
        );
        assert!(matches!(&msgs[1], Message::FullSnapshots(b) if b.snapshots[0].id == id));
        assert_eq!(server.registry().resolve_game_id("L-001"), Some(id));

        *cell.lock().unwrap() = 43;
        server.tick_once(now);
        let msgs = ada.receive(&server.drain_outgoing(), now);
        assert!(msgs.iter().any(|m| matches!(m, Message::DeltaSnapshots(b) if b.snapshots[0].id == id)));
    }

    #[test]
    fn late_joiner_gets_world_state() {
        let now = Instant::now();
        let mut server = session();
        let item = server
            .register_entity(EntityHandle::new(EntityKind::Item, 1), None)
            .unwrap();
        server.queue_item(ItemUpdate::create(item, "lantern", Vec3::ZERO, Quat::IDENTITY));
        let job = JobData {
            game_id: "FF-SU-01".into(),
            ..Default::default()
        };
        let station = NetId(900);
        server
            .offer_jobs(station, vec![(EntityHandle::new(EntityKind::Job, 1), job)], now)
            .unwrap();

        let (_ada, msgs) = join(&mut server, 5001, "Ada", now);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, Message::JobsCreate { station: s, jobs } if *s == station && jobs.len() == 1)));
        assert!(msgs
            .iter()
            .any(|m| matches!(m, Message::ItemUpdates(items) if items[0].item == item)));
    }

    #[test]
    fn job_validation_round_trip() {
        let now = Instant::now();
        let mut server = session();
        let (mut ada, _) = join(&mut server, 5001, "Ada", now);
        let ids = server
            .offer_jobs(
                NetId(900),
                vec![(EntityHandle::new(EntityKind::Job, 1), JobData::default())],
                now,
            )
            .unwrap();
        let _ = ada.receive(&server.drain_outgoing(), now);

        let request = ValidationRequest {
            job: ids[0],
            station: NetId(900),
            kind: ValidationKind::Overview,
        };
        for d in ada.send(&Message::JobValidateRequest(request), now) {
            server.handle_datagram(ada.addr, &d, now);
        }
        let msgs = ada.receive(&server.drain_outgoing(), now);
        assert!(msgs.contains(&Message::JobValidateResponse(ValidationResponse {
            job: ids[0],
            outcome: ValidationOutcome::Approved
        })));
        assert_eq!(server.jobs().get(ids[0]).unwrap().state, JobState::InProgress);
        assert_eq!(server.jobs().owner_of(ids[0]), Some(1));
    }

    #[test]
    fn client_writes_need_ownership() {
        let now = Instant::now();
        let mut server = session();
        let (mut ada, _) = join(&mut server, 5001, "Ada", now);
        let (mut bob, _) = join(&mut server, 5002, "Bob", now);

        let cell = Arc::new(Mutex::new(0u32));
        let (r, w) = (cell.clone(), cell.clone());
        let id = server
            .spawn_entity(
                EntityHandle::new(EntityKind::Car, 1),
                None,
                vec![Box::new(TrackedField::new("lever", move || *r.lock().unwrap(), move |v| {
                    *w.lock().unwrap() = v
                })) as Box<dyn ReplicatedField>],
                now,
            )
            .unwrap();
        let out = server.drain_outgoing();
        ada.receive(&out, now);
        bob.receive(&out, now);

        let write = Message::DeltaSnapshots(SnapshotBatch {
            tick: 1,
            snapshots: vec![replica_shared::replication::EntitySnapshot {
                id,
                payload: Bytes::from_static(&[1, 0, 9, 0, 0, 0]),
            }],
        });
        for d in ada.send(&write, now) {
            server.handle_datagram(ada.addr, &d, now);
        }
        assert_eq!(*cell.lock().unwrap(), 0);

        server.grant_ownership(1, id);
        for d in ada.send(&write, now) {
            server.handle_datagram(ada.addr, &d, now);
        }
        assert_eq!(*cell.lock().unwrap(), 9);
        let relayed = bob.receive(&server.drain_outgoing(), now);
        assert!(relayed.iter().any(|m| matches!(m, Message::DeltaSnapshots(b) if b.snapshots[0].id == id)));
    }

    #[test]
    fn relayed_write_drops_host_owned_fields() {
        let now = Instant::now();
        let mut server = session();
        let (mut ada, _) = join(&mut server, 5001, "Ada", now);
        let (mut bob, _) = join(&mut server, 5002, "Bob", now);

        let lever = Arc::new(Mutex::new(0u32));
        let brake = Arc::new(Mutex::new(4u32));
        let (lr, lw) = (lever.clone(), lever.clone());
        let (br, bw) = (brake.clone(), brake.clone());
        let id = server
            .spawn_entity(
                EntityHandle::new(EntityKind::Car, 1),
                None,
                vec![
                    Box::new(TrackedField::new("lever", move || *lr.lock().unwrap(), move |v| {
                        *lw.lock().unwrap() = v
                    })) as Box<dyn ReplicatedField>,
                    Box::new(
                        TrackedField::new("brake", move || *br.lock().unwrap(), move |v| {
                            *bw.lock().unwrap() = v
                        })
                        .server_authoritative(),
                    ),
                ],
                now,
            )
            .unwrap();
        server.grant_ownership(1, id);
        let out = server.drain_outgoing();
        ada.receive(&out, now);
        bob.receive(&out, now);

        let write = Message::DeltaSnapshots(SnapshotBatch {
            tick: 500,
            snapshots: vec![replica_shared::replication::EntitySnapshot {
                id,
                payload: Bytes::from_static(&[2, 0, 9, 0, 0, 0, 1, 77, 0, 0, 0]),
            }],
        });
        for d in ada.send(&write, now) {
            server.handle_datagram(ada.addr, &d, now);
        }
        assert_eq!(*lever.lock().unwrap(), 9);
        assert_eq!(*brake.lock().unwrap(), 4);

        let relayed: Vec<SnapshotBatch> = bob
            .receive(&server.drain_outgoing(), now)
            .into_iter()
            .filter_map(|m| match m {
                Message::DeltaSnapshots(b) => Some(b),
                _ => None,
            })
            .collect();
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].tick, server.tick());
        assert_eq!(relayed[0].snapshots[0].payload.as_ref(), &[1, 0, 9, 0, 0, 0]);
    }

    #[test]
    fn silent_peer_times_out_and_releases_jobs() {
        let now = Instant::now();
        let mut server = session();
        let (_ada, _) = join(&mut server, 5001, "Ada", now);
        let ids = server
            .offer_jobs(
                NetId(900),
                vec![(EntityHandle::new(EntityKind::Job, 1), JobData::default())],
                now,
            )
            .unwrap();
        server.jobs_mut().take(ids[0], 1, 0.0).unwrap();
        server.drain_events();

        let later = now + server.config().channel.disconnect_timeout() + Duration::from_millis(1);
        server.tick_once(later);
        assert_eq!(server.peer_count(), 0);
        assert_eq!(server.jobs().get(ids[0]).unwrap().state, JobState::Available);
        let events = server.drain_events();
        assert!(matches!(
            events[0],
            SessionEvent::Disconnected {
                player: Some(1),
                reason: DisconnectReason::Timeout,
                ..
            }
        ));
    }

    #[test]
    fn chat_is_relayed_and_surfaced_to_host() {
        let now = Instant::now();
        let mut server = session();
        let (mut ada, _) = join(&mut server, 5001, "Ada", now);
        let (mut bob, _) = join(&mut server, 5002, "Bob", now);
        let out = server.drain_outgoing();
        ada.receive(&out, now);
        server.drain_events();

        for d in ada.send(&Message::Chat { text: "hi".into() }, now) {
            server.handle_datagram(ada.addr, &d, now);
        }
        let out = server.drain_outgoing();
        assert!(ada.receive(&out, now).is_empty());
        assert!(bob
            .receive(&out, now)
            .iter()
            .any(|m| matches!(m, Message::Chat { text } if text.contains("Ada:"))));
        assert!(matches!(&server.drain_events()[0], SessionEvent::Chat { text } if text.contains("hi")));
    }

    #[test]
    fn kick_sends_disconnect() {
        let now = Instant::now();
        let mut server = session();
        let (mut ada, _) = join(&mut server, 5001, "Ada", now);
        assert!(server.kick(1, now));
        assert!(!server.kick(1, now));
        let msgs = ada.receive(&server.drain_outgoing(), now);
        assert!(msgs.contains(&Message::Disconnect(DisconnectReason::Kicked)));
        assert!(server.roster().get(1).is_none());
    }
}
