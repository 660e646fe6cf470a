//! Async client loop.
//!
//! Wraps a [`ClientSession`] and a [`Transport`]: each step drains the
//! transport, runs one session tick and sends what the session queued.
//!
//! Console commands:
//! - `status`: state, player id, tick, rtt
//! - `players`: other players and their ping
//! - `say <text>`: chat (`/w <name> <text>` whispers)
//! - `take <job>`: ask the host for a job
//! - `validate <job> [overview|booklet]`: hand a job paper to the validator
//! - `ready`: report the world as loaded
//! - `disconnect`, `quit`

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};

use replica_shared::config::SessionConfig;
use replica_shared::event::SessionEvent;
use replica_shared::identity::NetId;
use replica_shared::job::ValidationKind;
use replica_shared::login::ModInfo;
use replica_shared::net::{drain_datagrams, Transport, UdpTransport};
use replica_shared::task::TaskRegistry;

use crate::session::{ClientSession, ClientState, ClientWorld};

pub struct GameClient<S, T = UdpTransport> {
    session: ClientSession<S>,
    transport: T,
    console_rx: Option<mpsc::Receiver<String>>,
    stopped: bool,
}

impl<S: ClientWorld> GameClient<S, UdpTransport> {
    /// Binds an ephemeral UDP port and starts logging in to
    /// `cfg.server_addr`.
    pub async fn connect(cfg: SessionConfig, world: S, mods: Vec<ModInfo>) -> anyhow::Result<Self> {
        let server: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let ip = if server.ip().is_loopback() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        let transport = UdpTransport::bind(SocketAddr::new(ip, 0)).await?;
        let session = ClientSession::new(cfg, world, mods, TaskRegistry::new(), Instant::now())
            .context("parse server_addr")?;

        let mut client = Self::new(session, transport);
        client.start().await?;
        Ok(client)
    }
}

impl<S: ClientWorld, T: Transport> GameClient<S, T> {
    pub fn new(session: ClientSession<S>, transport: T) -> Self {
        Self {
            session,
            transport,
            console_rx: None,
            stopped: false,
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.transport.local_addr().context("transport local_addr")
    }

    pub fn session(&self) -> &ClientSession<S> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ClientSession<S> {
        &mut self.session
    }

    pub fn state(&self) -> ClientState {
        self.session.state()
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.session.drain_events()
    }

    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    /// `true` after `quit`.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Sends the first login.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        self.start_at(Instant::now()).await
    }

    pub async fn start_at(&mut self, now: Instant) -> anyhow::Result<()> {
        self.session.connect(now);
        self.flush().await
    }

    /// Runs the client for a number of ticks.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = self.session.config().tick_duration();
        let mut next = tokio::time::Instant::now();

        for _ in 0..ticks {
            next += dt;
            self.step().await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one client tick at the current time.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        self.process_console_commands().await?;
        self.step_at(Instant::now()).await
    }

    /// Executes one client tick as if the clock read `now`.
    pub async fn step_at(&mut self, now: Instant) -> anyhow::Result<()> {
        let datagrams = drain_datagrams(&self.transport).context("transport recv")?;
        for (datagram, from) in datagrams {
            self.session.handle_datagram(from, &datagram, now);
        }
        self.session.tick_once(now);
        self.flush().await
    }

    pub async fn flush(&mut self) -> anyhow::Result<()> {
        for (to, datagram) in self.session.drain_outgoing() {
            if let Err(e) = self.transport.send_to(&datagram, to).await {
                warn!(%to, error = %e, "Send failed");
            }
        }
        Ok(())
    }

    /// Leaves the session and sends the farewell.
    pub async fn disconnect(&mut self) -> anyhow::Result<()> {
        self.session.disconnect(Instant::now());
        self.flush().await
    }

    async fn process_console_commands(&mut self) -> anyhow::Result<()> {
        // Collect lines first to avoid borrow conflict
        let lines: Vec<String> = if let Some(ref mut rx) = self.console_rx {
            let mut collected = Vec::new();
            while let Ok(line) = rx.try_recv() {
                collected.push(line);
            }
            collected
        } else {
            Vec::new()
        };

        for line in lines {
            for out in self.exec_console(&line) {
                println!("{out}");
            }
        }
        if self.stopped {
            self.disconnect().await?;
        }
        Ok(())
    }

    /// Executes a console command.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        let line = line.trim();
        let (command, rest) = match line.split_once(' ') {
            Some((c, r)) => (c, r.trim()),
            None => (line, ""),
        };
        if command.is_empty() {
            return Vec::new();
        }
        let now = Instant::now();

        match command {
            "status" => {
                let rtt = self
                    .session
                    .rtt()
                    .map(|r| format!("{}ms", r.as_millis()))
                    .unwrap_or_else(|| "-".to_string());
                vec![
                    format!("State: {:?}", self.session.state()),
                    format!("Server: {}", self.session.server_addr()),
                    format!("Player: {:?}", self.session.player_id()),
                    format!("Tick: {}", self.session.tick()),
                    format!("RTT: {rtt}"),
                    format!("Entities: {}", self.session.registry().len()),
                    format!("Jobs: {}", self.session.jobs().len()),
                    format!("Items: {}", self.session.items().len()),
                ]
            }
            "players" => self
                .session
                .players()
                .map(|p| format!("  {}: {} ping={}ms", p.id, p.username, p.ping_ms))
                .collect(),
            "say" => {
                self.session.send_chat(rest, now);
                Vec::new()
            }
            "take" => match parse_job(rest) {
                Some(job) => {
                    self.session.request_take(job, now);
                    Vec::new()
                }
                None => vec!["Usage: take <job>".to_string()],
            },
            "validate" => {
                let mut args = rest.split_whitespace();
                let job = args.next().and_then(parse_job);
                let kind = match args.next() {
                    None | Some("overview") => Some(ValidationKind::Overview),
                    Some("booklet") => Some(ValidationKind::Booklet),
                    Some(_) => None,
                };
                match (job, kind) {
                    (Some(job), Some(kind)) => {
                        if self.session.request_validation(job, kind, now) {
                            vec![format!("Validating {job}")]
                        } else {
                            vec![format!("Cannot validate {job} right now")]
                        }
                    }
                    _ => vec!["Usage: validate <job> [overview|booklet]".to_string()],
                }
            }
            "ready" => {
                self.session.mark_loaded(now);
                Vec::new()
            }
            "disconnect" => {
                self.session.disconnect(now);
                vec!["Disconnected".to_string()]
            }
            "quit" | "exit" => {
                info!("Client shutting down");
                self.stopped = true;
                Vec::new()
            }
            other => vec![format!("Unknown command '{other}'")],
        }
    }
}

fn parse_job(s: &str) -> Option<NetId> {
    s.trim().parse::<u16>().ok().map(NetId).filter(|id| id.is_assigned())
}
