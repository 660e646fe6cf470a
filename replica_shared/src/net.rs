//! Datagram transports.
//!
//! Sessions never touch sockets; the async shells move datagrams between a
//! [`Transport`] and the session once per tick. Two implementations:
//! - [`UdpTransport`]: tokio UDP socket.
//! - [`MemoryTransport`]: in-process network for tests, with optional
//!   seeded packet loss.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tracing::trace;

/// Receive buffer size; no datagram is larger.
pub const MAX_DATAGRAM: usize = 64 * 1024;

#[async_trait]
pub trait Transport: Send + Sync {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    async fn send_to(&self, datagram: &[u8], to: SocketAddr) -> io::Result<()>;

    /// Non-blocking receive; `WouldBlock` when nothing is queued.
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// Drains everything currently queued on `transport`.
pub fn drain_datagrams(transport: &dyn Transport) -> io::Result<Vec<(Vec<u8>, SocketAddr)>> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut out = Vec::new();
    loop {
        match transport.try_recv_from(&mut buf) {
            Ok((n, from)) => out.push((buf[..n].to_vec(), from)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(out),
            // Windows reports ICMP port-unreachable from an earlier send here.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("udp bind {addr}"))?;
        Ok(Self { socket })
    }

    /// Binds `127.0.0.1:0`.
    pub async fn bind_ephemeral() -> anyhow::Result<Self> {
        Self::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await
    }

    /// Allows sending to broadcast addresses (LAN discovery).
    pub fn enable_broadcast(&self) -> anyhow::Result<()> {
        self.socket.set_broadcast(true).context("udp set_broadcast")
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    async fn send_to(&self, datagram: &[u8], to: SocketAddr) -> io::Result<()> {
        self.socket.send_to(datagram, to).await.map(|_| ())
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.try_recv_from(buf)
    }
}

type Inbox = VecDeque<(Vec<u8>, SocketAddr)>;

#[derive(Debug)]
struct NetworkState {
    inboxes: HashMap<SocketAddr, Inbox>,
    next_port: u16,
    loss: f64,
    rng: StdRng,
    dropped: u64,
}

/// Shared in-process "network". Clone handles freely.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "memory network lock poisoned")
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_loss(0, 0.0)
    }

    /// Drops each datagram with probability `loss`, deterministically for
    /// a given `seed`.
    pub fn with_loss(seed: u64, loss: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                inboxes: HashMap::new(),
                next_port: 40_000,
                loss: loss.clamp(0.0, 1.0),
                rng: StdRng::seed_from_u64(seed),
                dropped: 0,
            })),
        }
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<MemoryTransport> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.inboxes.contains_key(&addr) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, addr.to_string()));
        }
        state.inboxes.insert(addr, VecDeque::new());
        Ok(MemoryTransport {
            addr,
            net: self.clone(),
        })
    }

    /// Binds the next free `127.0.0.1` port.
    pub fn bind_ephemeral(&self) -> io::Result<MemoryTransport> {
        let addr = {
            let mut state = self.state.lock().map_err(|_| poisoned())?;
            loop {
                let port = state.next_port;
                state.next_port = state.next_port.wrapping_add(1).max(1024);
                let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
                if !state.inboxes.contains_key(&addr) {
                    break addr;
                }
            }
        };
        self.bind(addr)
    }

    /// Datagrams lost so far.
    pub fn dropped(&self) -> u64 {
        self.state.lock().map(|s| s.dropped).unwrap_or(0)
    }

    /// Changes the loss rate, e.g. to let retransmits drain at the end of a
    /// test.
    pub fn set_loss(&self, loss: f64) {
        if let Ok(mut s) = self.state.lock() {
            s.loss = loss.clamp(0.0, 1.0);
        }
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let targets: Vec<SocketAddr> = if is_broadcast(to) {
            state
                .inboxes
                .keys()
                .filter(|a| a.port() == to.port() && **a != from)
                .copied()
                .collect()
        } else {
            vec![to]
        };
        for target in targets {
            let loss = state.loss;
            if loss > 0.0 && state.rng.gen_bool(loss) {
                state.dropped += 1;
                trace!(%from, %target, len = datagram.len(), "Dropped datagram");
                continue;
            }
            // Unbound destinations swallow the datagram, as UDP would.
            if let Some(inbox) = state.inboxes.get_mut(&target) {
                inbox.push_back((datagram.to_vec(), from));
            }
        }
        Ok(())
    }

    fn pop(&self, addr: SocketAddr) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        Ok(state.inboxes.get_mut(&addr).and_then(|q| q.pop_front()))
    }

    fn unbind(&self, addr: SocketAddr) {
        if let Ok(mut s) = self.state.lock() {
            s.inboxes.remove(&addr);
        }
    }
}

fn is_broadcast(addr: SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => ip.is_broadcast(),
        IpAddr::V6(_) => false,
    }
}

/// One endpoint on a [`MemoryNetwork`]. Unbinds on drop.
#[derive(Debug)]
pub struct MemoryTransport {
    addr: SocketAddr,
    net: MemoryNetwork,
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.net.unbind(self.addr);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    async fn send_to(&self, datagram: &[u8], to: SocketAddr) -> io::Result<()> {
        self.net.deliver(self.addr, to, datagram)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self.net.pop(self.addr)? {
            Some((data, from)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok((n, from))
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_transport_delivers_in_order() {
        let net = MemoryNetwork::new();
        let a = net.bind_ephemeral().unwrap();
        let b = net.bind_ephemeral().unwrap();
        let b_addr = b.local_addr().unwrap();
        a.send_to(b"one", b_addr).await.unwrap();
        a.send_to(b"two", b_addr).await.unwrap();

        let got = drain_datagrams(&b).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].0, b"one");
        assert_eq!(got[1].1, a.local_addr().unwrap());
        assert!(drain_datagrams(&b).unwrap().is_empty());
    }

    #[tokio::test]
    async fn seeded_loss_is_repeatable() {
        async fn run(seed: u64) -> u64 {
            let net = MemoryNetwork::with_loss(seed, 0.3);
            let a = net.bind_ephemeral().unwrap();
            let b = net.bind_ephemeral().unwrap();
            for _ in 0..200 {
                a.send_to(b"x", b.local_addr().unwrap()).await.unwrap();
            }
            net.dropped()
        }
        let first = run(7).await;
        assert_eq!(first, run(7).await);
        assert!(first > 20 && first < 120, "dropped {first}");
    }

    #[tokio::test]
    async fn broadcast_reaches_every_listener_on_port() {
        let net = MemoryNetwork::new();
        let client = net.bind_ephemeral().unwrap();
        let h1 = net.bind("10.0.0.1:8888".parse().unwrap()).unwrap();
        let h2 = net.bind("10.0.0.2:8888".parse().unwrap()).unwrap();
        let other = net.bind("10.0.0.3:8889".parse().unwrap()).unwrap();
        client
            .send_to(b"discover", "255.255.255.255:8888".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(drain_datagrams(&h1).unwrap().len(), 1);
        assert_eq!(drain_datagrams(&h2).unwrap().len(), 1);
        assert!(drain_datagrams(&other).unwrap().is_empty());
    }

    #[tokio::test]
    async fn udp_transport_round_trip() {
        let a = UdpTransport::bind_ephemeral().await.unwrap();
        let b = UdpTransport::bind_ephemeral().await.unwrap();
        a.send_to(b"ping", b.local_addr().unwrap()).await.unwrap();
        let mut buf = [0u8; 16];
        let mut got = None;
        for _ in 0..100 {
            match b.try_recv_from(&mut buf) {
                Ok((n, _)) => {
                    got = Some(buf[..n].to_vec());
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
                Err(e) => panic!("recv failed: {e}"),
            }
        }
        assert_eq!(got.as_deref(), Some(&b"ping"[..]));
    }
}
