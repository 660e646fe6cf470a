//! Lobby directory records and server-browser ping scheduling.
//!
//! # Ping cycle
//! 1. The work queue is refilled from the known server list when empty
//! 2. Each poll takes up to `batch_size` servers and emits one probe per
//!    address family the server advertises
//! 3. Batches are `batch_delay` apart; after the last batch the scheduler
//!    waits `cycle_delay(list size)` before refilling
//! 4. Every probe times out on its own and reports `-1`

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::codec::{Decode, DecodeError, Encode, PacketReader, PacketWriter};
use crate::config::PingScheduleConfig;

/// Ping value for "no answer".
pub const NO_PING: i32 = -1;

fn no_ping() -> i32 {
    NO_PING
}

/// One server as listed by the lobby directory or a LAN discovery answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbyServerData {
    #[serde(rename = "game_server_id")]
    pub id: String,
    #[serde(default)]
    pub ipv4: String,
    #[serde(default)]
    pub ipv6: String,
    pub port: u16,
    #[serde(rename = "server_name")]
    pub name: String,
    #[serde(rename = "password_protected", default)]
    pub has_password: bool,
    #[serde(default)]
    pub game_mode: i32,
    #[serde(default)]
    pub difficulty: i32,
    #[serde(default)]
    pub time_passed: String,
    #[serde(default)]
    pub current_players: i32,
    #[serde(default)]
    pub max_players: i32,
    #[serde(default)]
    pub required_mods: String,
    #[serde(default)]
    pub game_version: String,
    #[serde(default)]
    pub multiplayer_version: String,
    #[serde(rename = "server_info", default)]
    pub server_details: String,

    #[serde(skip)]
    pub local_ipv4: String,
    #[serde(skip, default = "no_ping")]
    pub ping: i32,
    #[serde(skip)]
    pub is_public: bool,
    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl Default for LobbyServerData {
    fn default() -> Self {
        Self {
            id: String::new(),
            ipv4: String::new(),
            ipv6: String::new(),
            port: 0,
            name: String::new(),
            has_password: false,
            game_mode: 0,
            difficulty: 0,
            time_passed: String::new(),
            current_players: 0,
            max_players: 0,
            required_mods: String::new(),
            game_version: String::new(),
            multiplayer_version: String::new(),
            server_details: String::new(),
            local_ipv4: String::new(),
            ping: NO_PING,
            is_public: false,
            last_seen: None,
        }
    }
}

impl LobbyServerData {
    /// Parses a directory listing (`[{...}, ...]`).
    pub fn list_from_json_str(s: &str) -> serde_json::Result<Vec<Self>> {
        serde_json::from_str(s)
    }

    pub fn server_uuid(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.id).ok()
    }

    pub fn ipv4_addr(&self) -> Option<SocketAddr> {
        parse_ip(&self.ipv4).map(|ip| SocketAddr::new(ip, self.port))
    }

    pub fn ipv6_addr(&self) -> Option<SocketAddr> {
        parse_ip(&self.ipv6).map(|ip| SocketAddr::new(ip, self.port))
    }

    pub fn difficulty_name(&self) -> &'static str {
        match self.difficulty {
            0 => "Standard",
            1 => "Comfort",
            2 => "Realistic",
            _ => "Custom",
        }
    }
}

fn parse_ip(s: &str) -> Option<IpAddr> {
    if s.is_empty() {
        None
    } else {
        s.parse().ok()
    }
}

impl Encode for LobbyServerData {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_str(&self.id);
        w.put_str(&self.ipv4);
        w.put_str(&self.ipv6);
        w.put_u16(self.port);
        w.put_str(&self.name);
        w.put_bool(self.has_password);
        w.put_i32(self.game_mode);
        w.put_i32(self.difficulty);
        w.put_str(&self.time_passed);
        w.put_i32(self.current_players);
        w.put_i32(self.max_players);
        w.put_str(&self.required_mods);
        w.put_str(&self.game_version);
        w.put_str(&self.multiplayer_version);
        w.put_str(&self.server_details);
    }
}

impl Decode for LobbyServerData {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            id: r.get_str()?,
            ipv4: r.get_str()?,
            ipv6: r.get_str()?,
            port: r.get_u16()?,
            name: r.get_str()?,
            has_password: r.get_bool()?,
            game_mode: r.get_i32()?,
            difficulty: r.get_i32()?,
            time_passed: r.get_str()?,
            current_players: r.get_i32()?,
            max_players: r.get_i32()?,
            required_mods: r.get_str()?,
            game_version: r.get_str()?,
            multiplayer_version: r.get_str()?,
            server_details: r.get_str()?,
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressFamily {
    V4,
    V6,
}

/// One unconnected ping to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingProbe {
    pub server: Uuid,
    pub target: SocketAddr,
    pub family: AddressFamily,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingResult {
    pub server: Uuid,
    pub family: AddressFamily,
    /// Round trip in milliseconds, or [`NO_PING`].
    pub ping_ms: i32,
}

#[derive(Debug, Clone, Copy)]
struct PingTarget {
    v4: Option<SocketAddr>,
    v6: Option<SocketAddr>,
}

/// Decides which servers to probe when.
#[derive(Debug)]
pub struct PingScheduler {
    config: PingScheduleConfig,
    known: BTreeMap<Uuid, PingTarget>,
    queue: VecDeque<Uuid>,
    next_at: Option<Instant>,
}

impl PingScheduler {
    pub fn new(config: PingScheduleConfig) -> Self {
        Self {
            config,
            known: BTreeMap::new(),
            queue: VecDeque::new(),
            next_at: None,
        }
    }

    /// Replaces the known list. Queued servers no longer listed are dropped.
    pub fn set_servers<'a>(&mut self, servers: impl IntoIterator<Item = &'a LobbyServerData>) {
        self.known.clear();
        for s in servers {
            self.upsert(s);
        }
        let known = &self.known;
        self.queue.retain(|id| known.contains_key(id));
    }

    pub fn upsert(&mut self, server: &LobbyServerData) -> bool {
        let Some(id) = server.server_uuid() else {
            debug!(id = %server.id, "Skipping server with unparsable id");
            return false;
        };
        self.known.insert(
            id,
            PingTarget {
                v4: server.ipv4_addr(),
                v6: server.ipv6_addr(),
            },
        );
        true
    }

    pub fn remove(&mut self, server: &Uuid) {
        self.known.remove(server);
        self.queue.retain(|id| id != server);
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn next_batch_at(&self) -> Option<Instant> {
        self.next_at
    }

    /// Probes due at `now`. Empty between batches.
    pub fn poll(&mut self, now: Instant) -> Vec<PingProbe> {
        if self.next_at.is_some_and(|at| now < at) {
            return Vec::new();
        }
        if self.queue.is_empty() {
            self.queue.extend(self.known.keys().copied());
            if self.queue.is_empty() {
                self.next_at = Some(now + self.config.cycle_delay(0));
                return Vec::new();
            }
        }

        let take = self.config.batch_size.max(1).min(self.queue.len());
        let mut probes = Vec::with_capacity(take * 2);
        for id in self.queue.drain(..take) {
            let Some(target) = self.known.get(&id) else {
                continue;
            };
            if let Some(addr) = target.v4 {
                probes.push(PingProbe {
                    server: id,
                    target: addr,
                    family: AddressFamily::V4,
                });
            }
            if let Some(addr) = target.v6 {
                probes.push(PingProbe {
                    server: id,
                    target: addr,
                    family: AddressFamily::V6,
                });
            }
        }

        let delay = if self.queue.is_empty() {
            self.config.cycle_delay(self.known.len())
        } else {
            self.config.batch_delay()
        };
        self.next_at = Some(now + delay);
        trace!(probes = probes.len(), remaining = self.queue.len(), "Ping batch");
        probes
    }
}

/// Outstanding probes and their deadlines.
#[derive(Debug)]
pub struct ProbeTracker {
    timeout: std::time::Duration,
    in_flight: HashMap<(Uuid, AddressFamily), Instant>,
}

impl ProbeTracker {
    pub fn new(config: &PingScheduleConfig) -> Self {
        Self {
            timeout: config.probe_timeout(),
            in_flight: HashMap::new(),
        }
    }

    pub fn on_sent(&mut self, probe: &PingProbe, now: Instant) {
        self.in_flight.insert((probe.server, probe.family), now);
    }

    /// Matches a pong to its probe. Unknown or expired pongs yield `None`.
    pub fn on_pong(&mut self, server: Uuid, family: AddressFamily, now: Instant) -> Option<PingResult> {
        let sent = self.in_flight.remove(&(server, family))?;
        let elapsed = now.saturating_duration_since(sent);
        if elapsed > self.timeout {
            return Some(PingResult {
                server,
                family,
                ping_ms: NO_PING,
            });
        }
        Some(PingResult {
            server,
            family,
            ping_ms: elapsed.as_millis().min(i32::MAX as u128) as i32,
        })
    }

    /// Probes older than the timeout resolve to [`NO_PING`].
    pub fn expire(&mut self, now: Instant) -> Vec<PingResult> {
        let timeout = self.timeout;
        let mut expired: Vec<(Uuid, AddressFamily)> = self
            .in_flight
            .iter()
            .filter(|(_, sent)| now.saturating_duration_since(**sent) >= timeout)
            .map(|(k, _)| *k)
            .collect();
        expired.sort();
        for key in &expired {
            self.in_flight.remove(key);
        }
        expired
            .into_iter()
            .map(|(server, family)| PingResult {
                server,
                family,
                ping_ms: NO_PING,
            })
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// Displayed latency per server: mean of the two latest answers.
#[derive(Debug, Default)]
pub struct LatencyBook {
    samples: HashMap<Uuid, VecDeque<i32>>,
}

impl LatencyBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a result and returns the server's current latency.
    pub fn record(&mut self, result: &PingResult) -> i32 {
        if result.ping_ms >= 0 {
            let s = self.samples.entry(result.server).or_default();
            s.push_back(result.ping_ms);
            while s.len() > 2 {
                s.pop_front();
            }
        }
        self.latency(&result.server)
    }

    pub fn latency(&self, server: &Uuid) -> i32 {
        match self.samples.get(server) {
            Some(s) if !s.is_empty() => {
                let sum: i64 = s.iter().map(|v| *v as i64).sum();
                (sum as f64 / s.len() as f64).round() as i32
            }
            _ => NO_PING,
        }
    }

    pub fn forget(&mut self, server: &Uuid) {
        self.samples.remove(server);
    }
}
