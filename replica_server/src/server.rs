//! Async host loop.
//!
//! Fixed-timestep loop around a [`ServerSession`]: each step drains the
//! transport (`try_recv_from` until it would block), runs one session tick
//! and sends whatever the session queued. The session is owned directly, so
//! every mutation happens on the task driving the loop.
//!
//! Console commands (stdin in the binary):
//! - `status`: tick, players and their ping
//! - `kick <name>`: disconnect a player
//! - `say <text>`: chat as the host (`/server ...` works too)
//! - `quit`: disconnect everyone and stop

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use replica_shared::config::SessionConfig;
use replica_shared::event::SessionEvent;
use replica_shared::login::ModInfo;
use replica_shared::net::{drain_datagrams, Transport, UdpTransport};
use replica_shared::task::TaskRegistry;

use crate::session::{HostWorld, ServerSession};
use crate::world::SimWorld;

pub struct GameServer<W, T = UdpTransport> {
    session: ServerSession<W>,
    transport: T,
    console_rx: Option<mpsc::Receiver<String>>,
    stopped: bool,
}

impl<W: HostWorld> GameServer<W, UdpTransport> {
    /// Binds UDP on `cfg.server_addr`.
    pub async fn bind(
        cfg: SessionConfig,
        world: W,
        mods: Vec<ModInfo>,
        tasks: TaskRegistry,
    ) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let transport = UdpTransport::bind(addr).await?;
        Ok(Self::new(ServerSession::new(cfg, world, mods, tasks), transport))
    }
}

impl<W: HostWorld, T: Transport> GameServer<W, T> {
    pub fn new(session: ServerSession<W>, transport: T) -> Self {
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

    pub fn session(&self) -> &ServerSession<W> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ServerSession<W> {
        &mut self.session
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.session.drain_events()
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    /// `true` after `quit` or [`GameServer::shutdown`].
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Runs the server for a number of ticks.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = self.session.config().tick_duration();
        let mut next = Instant::now();

        for _ in 0..ticks {
            next += dt;
            self.step().await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one fixed simulation step.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        self.process_console_commands().await?;
        self.step_at(std::time::Instant::now()).await
    }

    /// Executes one fixed simulation step as if the clock read `now`.
    pub async fn step_at(&mut self, now: std::time::Instant) -> anyhow::Result<()> {
        self.recv_datagrams(now)?;
        let dt = self.session.config().tick_duration().as_secs_f32();
        self.session.world_mut().advance(dt);
        self.session.tick_once(now);
        self.flush().await
    }

    fn recv_datagrams(&mut self, now: std::time::Instant) -> anyhow::Result<()> {
        let datagrams = drain_datagrams(&self.transport).context("transport recv")?;
        for (datagram, from) in datagrams {
            self.session.handle_datagram(from, &datagram, now);
        }
        Ok(())
    }

    /// Sends everything the session queued. Sends are fire-and-forget; a
    /// failed send is logged and the channel layer retransmits if it must.
    pub async fn flush(&mut self) -> anyhow::Result<()> {
        for (to, datagram) in self.session.drain_outgoing() {
            if let Err(e) = self.transport.send_to(&datagram, to).await {
                warn!(%to, error = %e, "Send failed");
            }
        }
        Ok(())
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

        let was_stopped = self.stopped;
        for line in lines {
            for out in self.exec_console(&line) {
                println!("{out}");
            }
        }
        if self.stopped && !was_stopped {
            self.shutdown().await?;
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
        let now = std::time::Instant::now();

        match command {
            "status" => {
                let mut out = vec![
                    format!("Tick: {}", self.session.tick()),
                    format!("Server id: {}", self.session.server_id()),
                    format!("Players: {}", self.session.roster().len()),
                ];
                for p in self.session.roster().iter() {
                    out.push(format!(
                        "  {}: {} ping={}ms loaded={}",
                        p.id, p.username, p.ping_ms, p.is_loaded
                    ));
                }
                out
            }
            "kick" => {
                if rest.is_empty() {
                    return vec!["Usage: kick <name>".to_string()];
                }
                let Some(player) = self.session.roster().find_by_name(rest).map(|p| p.id) else {
                    return vec![format!("No player named '{rest}'")];
                };
                if self.session.kick(player, now) {
                    vec![format!("Kicked '{rest}'")]
                } else {
                    vec![format!("'{rest}' is not connected")]
                }
            }
            "say" => {
                self.session.host_chat(rest, now);
                Vec::new()
            }
            "quit" | "exit" => {
                info!("Server shutting down");
                self.stopped = true;
                Vec::new()
            }
            other => vec![format!("Unknown command '{other}'")],
        }
    }

    /// Disconnects every peer and sends the farewells.
    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.stopped = true;
        self.session.shutdown(std::time::Instant::now());
        self.flush().await
    }
}

/// Helper for tests: bind to an ephemeral port with a [`SimWorld`].
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(GameServer<SimWorld>, SessionConfig)> {
    let cfg = SessionConfig {
        server_addr: format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        tick_hz,
        ..Default::default()
    };

    let transport = UdpTransport::bind(cfg.server_addr.parse()?).await?;
    let addr = transport.local_addr()?;
    let mut cfg = cfg;
    cfg.server_addr = addr.to_string();

    let session = ServerSession::new(cfg.clone(), SimWorld::new(), Vec::new(), TaskRegistry::new());
    Ok((GameServer::new(session, transport), cfg))
}
