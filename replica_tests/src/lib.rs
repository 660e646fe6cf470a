//! Shared harness for the integration tests.
//!
//! Servers and clients run on a [`MemoryNetwork`] and are stepped in
//! lockstep on a simulated clock, so retransmit and timeout behaviour does
//! not depend on how fast the test machine is.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use replica_client::client::GameClient;
use replica_client::session::{ClientSession, ClientState};
use replica_client::world::MirrorWorld;
use replica_server::server::GameServer;
use replica_server::session::ServerSession;
use replica_server::world::SimWorld;
use replica_shared::config::SessionConfig;
use replica_shared::net::{MemoryNetwork, MemoryTransport, Transport};
use replica_shared::task::TaskRegistry;

pub type MemServer = GameServer<SimWorld, MemoryTransport>;
pub type MemClient = GameClient<MirrorWorld, MemoryTransport>;

/// Build version every harness host requires.
pub const HOST_BUILD: &str = "12";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Host on the next free memory port.
pub fn memory_server(net: &MemoryNetwork, tweak: impl FnOnce(&mut SessionConfig)) -> anyhow::Result<MemServer> {
    let transport = net.bind_ephemeral()?;
    let mut cfg = SessionConfig {
        server_addr: transport.local_addr()?.to_string(),
        player_name: "Host".into(),
        build_version: HOST_BUILD.into(),
        ..Default::default()
    };
    tweak(&mut cfg);
    let session = ServerSession::new(cfg, SimWorld::new(), Vec::new(), TaskRegistry::new());
    Ok(GameServer::new(session, transport))
}

/// Client settings for `server` with the host's build version.
pub fn client_config(server: SocketAddr, name: &str) -> SessionConfig {
    SessionConfig {
        server_addr: server.to_string(),
        player_name: name.into(),
        build_version: HOST_BUILD.into(),
        ..Default::default()
    }
}

/// Client that has not sent its login yet.
pub fn memory_client(
    net: &MemoryNetwork,
    cfg: SessionConfig,
    world: MirrorWorld,
    now: Instant,
) -> anyhow::Result<MemClient> {
    let transport = net.bind_ephemeral()?;
    let session = ClientSession::new(cfg, world, Vec::new(), TaskRegistry::new(), now)?;
    Ok(GameClient::new(session, transport))
}

/// Server plus one logged-in client per name.
pub async fn joined_session(
    net: &MemoryNetwork,
    clock: &mut SimClock,
    names: &[&str],
) -> anyhow::Result<(MemServer, Vec<MemClient>)> {
    let players = names.iter().map(|n| (*n, MirrorWorld::new())).collect();
    joined_with(net, clock, players).await
}

/// Like [`joined_session`], with a prepared world per client.
pub async fn joined_with(
    net: &MemoryNetwork,
    clock: &mut SimClock,
    players: Vec<(&str, MirrorWorld)>,
) -> anyhow::Result<(MemServer, Vec<MemClient>)> {
    joined_tuned(net, clock, players, |_| {}).await
}

/// Like [`joined_with`], applying `tweak` to the host and every client.
pub async fn joined_tuned(
    net: &MemoryNetwork,
    clock: &mut SimClock,
    players: Vec<(&str, MirrorWorld)>,
    tweak: impl Fn(&mut SessionConfig),
) -> anyhow::Result<(MemServer, Vec<MemClient>)> {
    let mut server = memory_server(net, &tweak)?;
    let addr = server.local_addr()?;
    let mut clients = Vec::with_capacity(players.len());
    for (name, world) in players {
        let mut cfg = client_config(addr, name);
        tweak(&mut cfg);
        let mut client = memory_client(net, cfg, world, clock.now)?;
        client.start_at(clock.now).await?;
        clients.push(client);
    }
    let mut refs: Vec<&mut MemClient> = clients.iter_mut().collect();
    let joined = clock
        .run_until(&mut server, &mut refs, 48, |_, clients| {
            clients.iter().all(|c| c.state() == ClientState::Connected)
        })
        .await?;
    anyhow::ensure!(joined, "clients did not join");
    Ok((server, clients))
}

/// Simulated wall clock advanced one tick per step.
#[derive(Debug, Clone, Copy)]
pub struct SimClock {
    pub now: Instant,
    pub dt: Duration,
}

impl SimClock {
    pub fn new(tick_hz: u32) -> Self {
        Self {
            now: Instant::now(),
            dt: Duration::from_secs_f64(1.0 / f64::from(tick_hz.max(1))),
        }
    }

    /// Steps the server, then every client, `ticks` times.
    pub async fn run(
        &mut self,
        server: &mut MemServer,
        clients: &mut [&mut MemClient],
        ticks: u32,
    ) -> anyhow::Result<()> {
        for _ in 0..ticks {
            self.now += self.dt;
            server.step_at(self.now).await?;
            for client in clients.iter_mut() {
                client.step_at(self.now).await?;
            }
        }
        Ok(())
    }

    /// Runs until `done` holds or `max_ticks` pass; returns whether it held.
    pub async fn run_until(
        &mut self,
        server: &mut MemServer,
        clients: &mut [&mut MemClient],
        max_ticks: u32,
        mut done: impl FnMut(&MemServer, &[&mut MemClient]) -> bool,
    ) -> anyhow::Result<bool> {
        for _ in 0..max_ticks {
            if done(server, clients) {
                return Ok(true);
            }
            self.run(server, clients, 1).await?;
        }
        Ok(done(server, clients))
    }
}
