//! One peer-to-peer connection: reliable and sequenced channels, acks,
//! ping/pong RTT measurement and liveness.
//!
//! The connection never touches a socket. Callers feed it received
//! datagrams and drain the datagrams it wants sent.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::trace;

use crate::channel::{DeliveryMethod, Frame, ReliableReceiver, ReliableSender, SequencedReceiver};
use crate::codec::DecodeError;
use crate::config::ChannelConfig;
use crate::error::ChannelError;

#[derive(Debug)]
pub struct Connection {
    peer: SocketAddr,
    config: ChannelConfig,
    reliable_out: ReliableSender,
    reliable_in: ReliableReceiver,
    sequenced_out: u16,
    sequenced_in: SequencedReceiver,
    outgoing: Vec<Bytes>,
    last_received: Instant,
    next_ping: Instant,
    ping_nonce: u32,
    ping_sent_at: Option<(u32, Instant)>,
    rtt: Option<Duration>,
    fresh_sample: Option<Duration>,
}

impl Connection {
    pub fn new(peer: SocketAddr, config: &ChannelConfig, now: Instant) -> Self {
        Self {
            peer,
            reliable_out: ReliableSender::new(
                config.resend_interval(),
                config.max_send_attempts,
                config.reliable_window,
                config.max_backlog,
            ),
            reliable_in: ReliableReceiver::new(config.reliable_window),
            sequenced_out: 0,
            sequenced_in: SequencedReceiver::default(),
            outgoing: Vec::new(),
            last_received: now,
            // First ping goes out on the first update.
            next_ping: now,
            ping_nonce: 0,
            ping_sent_at: None,
            rtt: None,
            fresh_sample: None,
            config: config.clone(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queues `payload` on the given class.
    pub fn send(
        &mut self,
        payload: Bytes,
        delivery: DeliveryMethod,
        now: Instant,
    ) -> Result<(), ChannelError> {
        let frame = match delivery {
            DeliveryMethod::Unconnected => Some(Frame::Unconnected(payload)),
            DeliveryMethod::Sequenced => {
                let seq = self.sequenced_out;
                self.sequenced_out = self.sequenced_out.wrapping_add(1);
                Some(Frame::Sequenced { seq, payload })
            }
            DeliveryMethod::ReliableOrdered => self.reliable_out.send(payload, now)?,
        };
        if let Some(frame) = frame {
            self.outgoing.push(frame.to_bytes());
        }
        Ok(())
    }

    /// Feeds one received datagram. Returns the message payloads it made
    /// deliverable, in delivery order.
    pub fn handle_datagram(&mut self, datagram: &[u8], now: Instant) -> Result<Vec<Bytes>, DecodeError> {
        let frame = Frame::decode(datagram)?;
        self.last_received = now;
        Ok(match frame {
            Frame::Unconnected(payload) => vec![payload],
            Frame::Reliable { seq, payload } => self.reliable_in.receive(seq, payload),
            Frame::Sequenced { seq, payload } => {
                if self.sequenced_in.accept(seq) {
                    vec![payload]
                } else {
                    trace!(peer = %self.peer, seq, "Dropped stale sequenced frame");
                    Vec::new()
                }
            }
            Frame::Ack { seqs } => {
                for seq in seqs {
                    self.reliable_out.on_ack(seq);
                }
                Vec::new()
            }
            Frame::Ping { nonce } => {
                self.outgoing.push(Frame::Pong { nonce }.to_bytes());
                Vec::new()
            }
            Frame::Pong { nonce } => {
                if let Some((sent_nonce, sent_at)) = self.ping_sent_at {
                    if sent_nonce == nonce {
                        let sample = now.saturating_duration_since(sent_at);
                        self.rtt = Some(sample);
                        self.fresh_sample = Some(sample);
                        self.ping_sent_at = None;
                    }
                }
                Vec::new()
            }
        })
    }

    /// Per-tick housekeeping: liveness, acks, retransmits, pings.
    pub fn update(&mut self, now: Instant) -> Result<(), ChannelError> {
        let silent = now.saturating_duration_since(self.last_received);
        if silent >= self.config.disconnect_timeout() {
            return Err(ChannelError::TimedOut {
                peer: self.peer.to_string(),
                silent_ms: silent.as_millis() as u64,
            });
        }

        if self.reliable_in.has_pending_acks() {
            let seqs = self.reliable_in.take_acks();
            // Keep each ack frame comfortably inside one datagram.
            for chunk in seqs.chunks(512) {
                self.outgoing.push(Frame::Ack { seqs: chunk.to_vec() }.to_bytes());
            }
        }

        for frame in self.reliable_out.poll(now)? {
            self.outgoing.push(frame.to_bytes());
        }

        if now >= self.next_ping {
            self.ping_nonce = self.ping_nonce.wrapping_add(1);
            self.ping_sent_at = Some((self.ping_nonce, now));
            self.outgoing.push(Frame::Ping { nonce: self.ping_nonce }.to_bytes());
            self.next_ping = now + self.config.ping_interval();
        }
        Ok(())
    }

    pub fn drain_outgoing(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.outgoing)
    }

    /// Most recent round-trip sample.
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    /// Returns a latency sample once, the first time it is asked for after
    /// a pong arrives.
    pub fn take_latency_sample(&mut self) -> Option<Duration> {
        self.fresh_sample.take()
    }

    /// `true` once every reliable payload has been acknowledged.
    pub fn is_flushed(&self) -> bool {
        self.reliable_out.is_idle()
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn pump(from: &mut Connection, to: &mut Connection, now: Instant) -> Vec<Bytes> {
        let mut delivered = Vec::new();
        for datagram in from.drain_outgoing() {
            delivered.extend(to.handle_datagram(&datagram, now).unwrap());
        }
        delivered
    }

    #[test]
    fn ping_pong_yields_one_latency_sample() {
        let cfg = ChannelConfig::default();
        let t0 = Instant::now();
        let mut a = Connection::new(addr(1), &cfg, t0);
        let mut b = Connection::new(addr(2), &cfg, t0);

        a.update(t0).unwrap();
        pump(&mut a, &mut b, t0);
        let t1 = t0 + Duration::from_millis(80);
        pump(&mut b, &mut a, t1);

        assert_eq!(a.rtt(), Some(Duration::from_millis(80)));
        assert_eq!(a.take_latency_sample(), Some(Duration::from_millis(80)));
        assert_eq!(a.take_latency_sample(), None);
    }

    #[test]
    fn reliable_delivery_survives_a_dropped_datagram() {
        let cfg = ChannelConfig::default();
        let t0 = Instant::now();
        let mut a = Connection::new(addr(1), &cfg, t0);
        let mut b = Connection::new(addr(2), &cfg, t0);

        a.send(Bytes::from_static(b"one"), DeliveryMethod::ReliableOrdered, t0)
            .unwrap();
        a.send(Bytes::from_static(b"two"), DeliveryMethod::ReliableOrdered, t0)
            .unwrap();
        let mut first = a.drain_outgoing();
        // Lose "one".
        first.remove(0);
        for d in first {
            assert!(b.handle_datagram(&d, t0).unwrap().is_empty());
        }
        b.update(t0).unwrap();
        pump(&mut b, &mut a, t0);

        let later = t0 + cfg.resend_interval();
        a.update(later).unwrap();
        let delivered = pump(&mut a, &mut b, later);
        assert_eq!(
            delivered,
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
        );
        b.update(later).unwrap();
        pump(&mut b, &mut a, later);
        assert!(a.is_flushed());
    }

    #[test]
    fn silence_times_out() {
        let cfg = ChannelConfig::default();
        let t0 = Instant::now();
        let mut a = Connection::new(addr(1), &cfg, t0);
        assert!(matches!(
            a.update(t0 + cfg.disconnect_timeout()),
            Err(ChannelError::TimedOut { .. })
        ));
    }

    #[test]
    fn garbage_is_a_decode_error_and_keeps_the_connection() {
        let cfg = ChannelConfig::default();
        let t0 = Instant::now();
        let mut a = Connection::new(addr(1), &cfg, t0);
        assert!(a.handle_datagram(&[200, 1, 2], t0).is_err());
        assert!(a.update(t0).is_ok());
    }
}
