//! Server browser: directory list, LAN discovery and batched pings.
//!
//! Probes and discovery requests are unconnected datagrams on one socket.
//! Every [`ServerBrowser::step_at`] reads whatever came back, resolves
//! expired probes and sends the next batch the scheduler lets through.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use anyhow::Context;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use replica_shared::channel::Frame;
use replica_shared::config::PingScheduleConfig;
use replica_shared::lobby::{AddressFamily, LatencyBook, LobbyServerData, PingResult, PingScheduler, ProbeTracker};
use replica_shared::message::{Message, Protocol};
use replica_shared::net::{drain_datagrams, Transport, UdpTransport};

pub struct ServerBrowser<T = UdpTransport> {
    transport: T,
    protocol: Protocol,
    config: PingScheduleConfig,
    scheduler: PingScheduler,
    tracker: ProbeTracker,
    latency: LatencyBook,
    servers: BTreeMap<Uuid, LobbyServerData>,
}

impl ServerBrowser<UdpTransport> {
    /// Binds an ephemeral UDP port with broadcast enabled.
    pub async fn bind(config: PingScheduleConfig) -> anyhow::Result<Self> {
        let transport = UdpTransport::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
        transport.enable_broadcast()?;
        Ok(Self::new(transport, config))
    }
}

impl<T: Transport> ServerBrowser<T> {
    pub fn new(transport: T, config: PingScheduleConfig) -> Self {
        Self {
            transport,
            protocol: Protocol::default(),
            scheduler: PingScheduler::new(config.clone()),
            tracker: ProbeTracker::new(&config),
            latency: LatencyBook::new(),
            servers: BTreeMap::new(),
            config,
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.transport.local_addr().context("transport local_addr")
    }

    /// Replaces the directory list. Entries with an unparsable id are
    /// skipped; servers still listed keep their latency.
    pub fn set_servers(&mut self, list: Vec<LobbyServerData>) -> usize {
        self.scheduler.set_servers(&list);
        let mut next = BTreeMap::new();
        for mut server in list {
            let Some(id) = server.server_uuid() else {
                continue;
            };
            server.ping = self.latency.latency(&id);
            next.insert(id, server);
        }
        for gone in self.servers.keys().filter(|id| !next.contains_key(*id)) {
            self.latency.forget(gone);
        }
        self.servers = next;
        self.servers.len()
    }

    /// Loads a lobby directory listing (`[{...}, ...]`).
    pub fn load_directory_json(&mut self, json: &str) -> anyhow::Result<usize> {
        let list = LobbyServerData::list_from_json_str(json).context("parse lobby directory")?;
        Ok(self.set_servers(list))
    }

    pub fn servers(&self) -> impl Iterator<Item = &LobbyServerData> {
        self.servers.values()
    }

    pub fn server(&self, id: &Uuid) -> Option<&LobbyServerData> {
        self.servers.get(id)
    }

    /// Displayed latency in milliseconds, `-1` without an answer.
    pub fn latency(&self, id: &Uuid) -> i32 {
        self.latency.latency(id)
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight()
    }

    /// Broadcasts a discovery request on every discovery port.
    pub async fn discover(&mut self) -> anyhow::Result<()> {
        let request = Frame::Unconnected(self.protocol.encode(&Message::DiscoveryRequest)?).to_bytes();
        for port in &self.config.discovery_ports {
            let to = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), *port);
            if let Err(e) = self.transport.send_to(&request, to).await {
                warn!(%to, error = %e, "Discovery send failed");
            }
        }
        debug!(ports = ?self.config.discovery_ports, "Sent LAN discovery");
        Ok(())
    }

    /// Reads answers, expires silent probes and sends the next batch.
    /// Returns every ping resolved during this step.
    pub async fn step_at(&mut self, now: Instant) -> anyhow::Result<Vec<PingResult>> {
        let mut resolved = Vec::new();
        for (datagram, from) in drain_datagrams(&self.transport).context("transport recv")? {
            let payload = match Frame::decode(&datagram) {
                Ok(Frame::Unconnected(payload)) => payload,
                Ok(frame) => {
                    trace!(%from, kind = ?frame.kind(), "Ignored connected frame");
                    continue;
                }
                Err(e) => {
                    warn!(%from, error = %e, "Dropped undecodable datagram");
                    continue;
                }
            };
            match self.protocol.decode(&payload) {
                Ok(Message::ServerPong { server_id }) => {
                    let family = if from.is_ipv4() {
                        AddressFamily::V4
                    } else {
                        AddressFamily::V6
                    };
                    match self.tracker.on_pong(server_id, family, now) {
                        Some(result) => resolved.push(result),
                        None => trace!(%from, %server_id, "Unexpected pong"),
                    }
                }
                Ok(Message::DiscoveryResponse(data)) => self.on_discovered(*data, from, now),
                Ok(other) => debug!(%from, message = other.name(), "Unexpected message"),
                Err(e) => warn!(%from, error = %e, "Dropped undecodable message"),
            }
        }
        resolved.extend(self.tracker.expire(now));
        for result in &resolved {
            let latency = self.latency.record(result);
            if let Some(server) = self.servers.get_mut(&result.server) {
                server.ping = latency;
            }
        }

        for probe in self.scheduler.poll(now) {
            let ping = Message::ServerPing { server_id: probe.server };
            let datagram = Frame::Unconnected(self.protocol.encode(&ping)?).to_bytes();
            match self.transport.send_to(&datagram, probe.target).await {
                Ok(()) => self.tracker.on_sent(&probe, now),
                Err(e) => warn!(to = %probe.target, error = %e, "Ping send failed"),
            }
        }
        Ok(resolved)
    }

    pub async fn step(&mut self) -> anyhow::Result<Vec<PingResult>> {
        self.step_at(Instant::now()).await
    }

    fn on_discovered(&mut self, mut data: LobbyServerData, from: SocketAddr, now: Instant) {
        let Some(id) = data.server_uuid() else {
            debug!(%from, id = %data.id, "Discovery answer with unparsable id");
            return;
        };
        let reported = data.ipv4.parse::<IpAddr>().ok();
        if reported.map_or(true, |ip| ip.is_unspecified()) {
            data.ipv4 = from.ip().to_string();
        }
        if data.port == 0 {
            data.port = from.port();
        }
        data.local_ipv4 = from.ip().to_string();
        data.last_seen = Some(now);
        data.ping = self.latency.latency(&id);
        if self.scheduler.upsert(&data) && !self.servers.contains_key(&id) {
            info!(server = %data.name, %from, "Discovered LAN server");
        }
        self.servers.insert(id, data);
    }
}
