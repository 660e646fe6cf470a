//! Session configuration.
//!
//! Loaded from JSON strings (file IO left to the binaries). Every field has a
//! default so a config file only needs to name what it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration shared by client and server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Server listen address, e.g. `127.0.0.1:7777`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Fixed simulation tick rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Display name (client only).
    #[serde(default = "default_player_name")]
    pub player_name: String,
    /// Server password; empty means none.
    #[serde(default)]
    pub password: String,
    /// Build version announced at login and required by the host.
    #[serde(default = "default_build_version")]
    pub build_version: String,
    #[serde(default = "default_max_players")]
    pub max_players: u8,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub ping: PingScheduleConfig,
}

fn default_server_addr() -> String {
    "127.0.0.1:7777".to_string()
}

fn default_tick_hz() -> u32 {
    24
}

fn default_player_name() -> String {
    "Player".to_string()
}

fn default_build_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_max_players() -> u8 {
    4
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            tick_hz: default_tick_hz(),
            player_name: default_player_name(),
            password: String::new(),
            build_version: default_build_version(),
            max_players: default_max_players(),
            replication: ReplicationConfig::default(),
            channel: ChannelConfig::default(),
            validation: ValidationConfig::default(),
            ping: PingScheduleConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_hz.max(1) as f64)
    }

    /// Ticks between forced full snapshots at the configured tick rate.
    pub fn full_sync_ticks(&self) -> u32 {
        self.replication.full_sync_ticks(self.tick_hz)
    }
}

/// Dirty-state and trainset resync tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Desired interval between full snapshots of one entity.
    #[serde(default = "default_full_sync_interval_ms")]
    pub full_sync_interval_ms: u64,
    /// Item batches with more entries than this are gzip-compressed.
    #[serde(default = "default_compress_after")]
    pub item_compress_after: usize,
    /// How often the host rebroadcasts its tick.
    #[serde(default = "default_tick_sync_interval_ms")]
    pub tick_sync_interval_ms: u64,
}

fn default_full_sync_interval_ms() -> u64 {
    2_000
}

fn default_compress_after() -> usize {
    50
}

fn default_tick_sync_interval_ms() -> u64 {
    5_000
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            full_sync_interval_ms: default_full_sync_interval_ms(),
            item_compress_after: default_compress_after(),
            tick_sync_interval_ms: default_tick_sync_interval_ms(),
        }
    }
}

impl ReplicationConfig {
    /// `full_sync_interval / tick_duration`, never below one tick.
    pub fn full_sync_ticks(&self, tick_hz: u32) -> u32 {
        let ticks = self.full_sync_interval_ms as f64 / 1000.0 * tick_hz as f64;
        (ticks.round() as u32).max(1)
    }
}

/// Reliable channel and liveness tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_resend_interval_ms")]
    pub resend_interval_ms: u64,
    /// Sends of one reliable frame before the connection is declared dead.
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    /// Unacknowledged reliable frames allowed in flight.
    #[serde(default = "default_reliable_window")]
    pub reliable_window: usize,
    /// Reliable payloads queued behind a full window before sends fail.
    #[serde(default = "default_max_backlog")]
    pub max_backlog: usize,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Silence after which the peer is considered gone.
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
}

fn default_resend_interval_ms() -> u64 {
    100
}

fn default_max_send_attempts() -> u32 {
    50
}

fn default_reliable_window() -> usize {
    256
}

fn default_max_backlog() -> usize {
    8_192
}

fn default_ping_interval_ms() -> u64 {
    1_000
}

fn default_disconnect_timeout_ms() -> u64 {
    5_000
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            resend_interval_ms: default_resend_interval_ms(),
            max_send_attempts: default_max_send_attempts(),
            reliable_window: default_reliable_window(),
            max_backlog: default_max_backlog(),
            ping_interval_ms: default_ping_interval_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
        }
    }
}

impl ChannelConfig {
    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

/// Client-side validation request timeout: `max(floor, multiplier × rtt)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_rtt_multiplier")]
    pub rtt_multiplier: f32,
    #[serde(default = "default_validation_floor_ms")]
    pub floor_ms: u64,
}

fn default_rtt_multiplier() -> f32 {
    3.0
}

fn default_validation_floor_ms() -> u64 {
    500
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            rtt_multiplier: default_rtt_multiplier(),
            floor_ms: default_validation_floor_ms(),
        }
    }
}

impl ValidationConfig {
    pub fn timeout(&self, rtt: Duration) -> Duration {
        let scaled_ms = (rtt.as_millis() as f64 * self.rtt_multiplier.max(0.0) as f64).round();
        Duration::from_millis(scaled_ms as u64).max(Duration::from_millis(self.floor_ms))
    }
}

/// Server browser ping scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingScheduleConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// `(max list size, cycle delay ms)` steps, ascending; larger lists use
    /// `fallback_cycle_delay_ms`.
    #[serde(default = "default_cycle_steps")]
    pub cycle_steps: Vec<(usize, u64)>,
    #[serde(default = "default_fallback_cycle_delay_ms")]
    pub fallback_cycle_delay_ms: u64,
    /// UDP ports probed by LAN discovery.
    #[serde(default = "default_discovery_ports")]
    pub discovery_ports: Vec<u16>,
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_delay_ms() -> u64 {
    500
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_cycle_steps() -> Vec<(usize, u64)> {
    vec![(10, 5_000), (50, 10_000), (100, 20_000)]
}

fn default_fallback_cycle_delay_ms() -> u64 {
    30_000
}

fn default_discovery_ports() -> Vec<u16> {
    vec![8888, 8889, 8890]
}

impl Default for PingScheduleConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            cycle_steps: default_cycle_steps(),
            fallback_cycle_delay_ms: default_fallback_cycle_delay_ms(),
            discovery_ports: default_discovery_ports(),
        }
    }
}

impl PingScheduleConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Delay before re-pinging a list of `servers` entries.
    pub fn cycle_delay(&self, servers: usize) -> Duration {
        let ms = self
            .cycle_steps
            .iter()
            .find(|(max, _)| servers <= *max)
            .map(|(_, ms)| *ms)
            .unwrap_or(self.fallback_cycle_delay_ms);
        Duration::from_millis(ms)
    }
}
