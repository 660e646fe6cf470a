//! Datagram framing and the three delivery classes.
//!
//! Every datagram starts with a [`FrameKind`] byte. Reliable and sequenced
//! frames carry a wrapping `u16` sequence number; acks carry a list of
//! reliable sequence numbers seen since the last ack.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::codec::{DecodeError, PacketReader, PacketWriter};
use crate::error::ChannelError;
use crate::sequence::{sequence_greater_than, wrapping_diff};

/// How a message type travels. Each message type is bound to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMethod {
    /// No session, no ordering, no acknowledgement.
    Unconnected,
    /// Acknowledged, retransmitted, delivered once and in send order.
    ReliableOrdered,
    /// Best effort; anything older than the newest received is dropped.
    Sequenced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Unconnected = 0,
    Reliable = 1,
    Sequenced = 2,
    Ack = 3,
    Ping = 4,
    Pong = 5,
}

impl FrameKind {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => FrameKind::Unconnected,
            1 => FrameKind::Reliable,
            2 => FrameKind::Sequenced,
            3 => FrameKind::Ack,
            4 => FrameKind::Ping,
            5 => FrameKind::Pong,
            _ => return None,
        })
    }
}

/// One datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Unconnected(Bytes),
    Reliable { seq: u16, payload: Bytes },
    Sequenced { seq: u16, payload: Bytes },
    Ack { seqs: Vec<u16> },
    Ping { nonce: u32 },
    Pong { nonce: u32 },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Unconnected(_) => FrameKind::Unconnected,
            Frame::Reliable { .. } => FrameKind::Reliable,
            Frame::Sequenced { .. } => FrameKind::Sequenced,
            Frame::Ack { .. } => FrameKind::Ack,
            Frame::Ping { .. } => FrameKind::Ping,
            Frame::Pong { .. } => FrameKind::Pong,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut w = PacketWriter::with_capacity(self.payload_len() + 3);
        w.put_u8(self.kind() as u8);
        match self {
            Frame::Unconnected(payload) => w.put_raw(payload),
            Frame::Reliable { seq, payload } | Frame::Sequenced { seq, payload } => {
                w.put_u16(*seq);
                w.put_raw(payload);
            }
            Frame::Ack { seqs } => w.put_array(seqs),
            Frame::Ping { nonce } | Frame::Pong { nonce } => w.put_u32(*nonce),
        }
        w.freeze()
    }

    pub fn decode(datagram: &[u8]) -> Result<Frame, DecodeError> {
        let mut r = PacketReader::new(datagram);
        let kind = r.get_u8()?;
        let kind = FrameKind::from_u8(kind).ok_or(DecodeError::UnknownVariant {
            kind: "frame",
            value: kind,
        })?;
        Ok(match kind {
            FrameKind::Unconnected => Frame::Unconnected(Bytes::copy_from_slice(r.rest())),
            FrameKind::Reliable => {
                let seq = r.get_u16()?;
                Frame::Reliable {
                    seq,
                    payload: Bytes::copy_from_slice(r.rest()),
                }
            }
            FrameKind::Sequenced => {
                let seq = r.get_u16()?;
                Frame::Sequenced {
                    seq,
                    payload: Bytes::copy_from_slice(r.rest()),
                }
            }
            FrameKind::Ack => Frame::Ack {
                seqs: r.get_array()?,
            },
            FrameKind::Ping => Frame::Ping { nonce: r.get_u32()? },
            FrameKind::Pong => Frame::Pong { nonce: r.get_u32()? },
        })
    }

    fn payload_len(&self) -> usize {
        match self {
            Frame::Unconnected(p) => p.len(),
            Frame::Reliable { payload, .. } | Frame::Sequenced { payload, .. } => payload.len(),
            Frame::Ack { seqs } => 2 + seqs.len() * 2,
            Frame::Ping { .. } | Frame::Pong { .. } => 4,
        }
    }
}

#[derive(Debug)]
struct InFlight {
    seq: u16,
    payload: Bytes,
    last_sent: Instant,
    attempts: u32,
}

/// Sending half of the reliable-ordered class.
///
/// At most `window` frames are unacknowledged at once; payloads beyond that
/// wait in a backlog and go out as acks free the window.
#[derive(Debug)]
pub struct ReliableSender {
    next_seq: u16,
    in_flight: VecDeque<InFlight>,
    backlog: VecDeque<Bytes>,
    resend_after: Duration,
    max_attempts: u32,
    window: usize,
    max_backlog: usize,
}

impl ReliableSender {
    pub fn new(resend_after: Duration, max_attempts: u32, window: usize, max_backlog: usize) -> Self {
        Self {
            next_seq: 0,
            in_flight: VecDeque::new(),
            backlog: VecDeque::new(),
            resend_after,
            max_attempts: max_attempts.max(1),
            window: window.max(1),
            max_backlog,
        }
    }

    /// Queues `payload`. Returns the frame to put on the wire now, if the
    /// window has room and nothing older is still waiting in the backlog.
    pub fn send(&mut self, payload: Bytes, now: Instant) -> Result<Option<Frame>, ChannelError> {
        if self.in_flight.len() >= self.window || !self.backlog.is_empty() {
            if self.backlog.len() >= self.max_backlog {
                return Err(ChannelError::WindowFull {
                    in_flight: self.in_flight.len() + self.backlog.len(),
                });
            }
            self.backlog.push_back(payload);
            return Ok(None);
        }
        Ok(Some(self.launch(payload, now)))
    }

    fn launch(&mut self, payload: Bytes, now: Instant) -> Frame {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.in_flight.push_back(InFlight {
            seq,
            payload: payload.clone(),
            last_sent: now,
            attempts: 1,
        });
        Frame::Reliable { seq, payload }
    }

    /// Drops an acknowledged frame. Unknown or repeated acks are ignored.
    pub fn on_ack(&mut self, seq: u16) {
        if let Some(pos) = self.in_flight.iter().position(|f| f.seq == seq) {
            self.in_flight.remove(pos);
        }
    }

    /// Frames due for (re)transmission: resends of stale in-flight frames and
    /// backlog promoted into freed window slots.
    pub fn poll(&mut self, now: Instant) -> Result<Vec<Frame>, ChannelError> {
        let mut out = Vec::new();
        for f in self.in_flight.iter_mut() {
            if now.saturating_duration_since(f.last_sent) < self.resend_after {
                continue;
            }
            if f.attempts >= self.max_attempts {
                return Err(ChannelError::Unacknowledged {
                    seq: f.seq,
                    attempts: f.attempts,
                });
            }
            f.attempts += 1;
            f.last_sent = now;
            out.push(Frame::Reliable {
                seq: f.seq,
                payload: f.payload.clone(),
            });
        }
        while self.in_flight.len() < self.window {
            let Some(payload) = self.backlog.pop_front() else {
                break;
            };
            out.push(self.launch(payload, now));
        }
        Ok(out)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.backlog.is_empty()
    }
}

/// Receiving half of the reliable-ordered class.
///
/// Delivers each sequence number exactly once, in order. Frames ahead of the
/// expected one are buffered up to `window` positions; anything further out
/// is dropped unacknowledged and will be resent.
#[derive(Debug)]
pub struct ReliableReceiver {
    expected: u16,
    buffered: HashMap<u16, Bytes>,
    pending_acks: Vec<u16>,
    window: usize,
}

impl ReliableReceiver {
    pub fn new(window: usize) -> Self {
        Self {
            expected: 0,
            buffered: HashMap::new(),
            pending_acks: Vec::new(),
            window: window.clamp(1, i16::MAX as usize),
        }
    }

    /// Accepts one reliable frame and returns every payload that is now
    /// deliverable in order.
    pub fn receive(&mut self, seq: u16, payload: Bytes) -> Vec<Bytes> {
        let ahead = wrapping_diff(self.expected, seq);
        if ahead < 0 {
            // Already delivered; the sender missed our ack.
            self.pending_acks.push(seq);
            return Vec::new();
        }
        if ahead as usize >= self.window {
            return Vec::new();
        }
        self.pending_acks.push(seq);
        if ahead > 0 {
            self.buffered.entry(seq).or_insert(payload);
            return Vec::new();
        }

        let mut out = vec![payload];
        self.expected = self.expected.wrapping_add(1);
        while let Some(next) = self.buffered.remove(&self.expected) {
            out.push(next);
            self.expected = self.expected.wrapping_add(1);
        }
        out
    }

    pub fn take_acks(&mut self) -> Vec<u16> {
        let mut acks = std::mem::take(&mut self.pending_acks);
        acks.sort_unstable();
        acks.dedup();
        acks
    }

    pub fn has_pending_acks(&self) -> bool {
        !self.pending_acks.is_empty()
    }

    pub fn buffered(&self) -> usize {
        self.buffered.len()
    }
}

/// Receiving half of the sequenced class.
#[derive(Debug, Default)]
pub struct SequencedReceiver {
    newest: Option<u16>,
}

impl SequencedReceiver {
    /// `true` if `seq` is newer than anything seen so far.
    pub fn accept(&mut self, seq: u16) -> bool {
        match self.newest {
            Some(newest) if !sequence_greater_than(seq, newest) => false,
            _ => {
                self.newest = Some(seq);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn frames_survive_the_wire() {
        let frames = [
            Frame::Unconnected(b("probe")),
            Frame::Reliable {
                seq: 65535,
                payload: b("r"),
            },
            Frame::Sequenced {
                seq: 3,
                payload: Bytes::new(),
            },
            Frame::Ack { seqs: vec![1, 2, 9] },
            Frame::Ping { nonce: 42 },
            Frame::Pong { nonce: 42 },
        ];
        for f in frames {
            assert_eq!(Frame::decode(&f.to_bytes()).unwrap(), f);
        }
    }

    #[test]
    fn unknown_frame_kind_is_a_decode_error() {
        assert!(matches!(
            Frame::decode(&[9, 0, 0]),
            Err(DecodeError::UnknownVariant { kind: "frame", value: 9 })
        ));
        assert!(Frame::decode(&[]).is_err());
        assert!(Frame::decode(&[1, 0]).is_err());
    }

    #[test]
    fn receiver_reorders_and_drops_duplicates() {
        let mut rx = ReliableReceiver::new(64);
        assert!(rx.receive(1, b("b")).is_empty());
        assert!(rx.receive(2, b("c")).is_empty());
        assert_eq!(rx.receive(0, b("a")), vec![b("a"), b("b"), b("c")]);
        // Duplicate of a delivered frame: acked again, not redelivered.
        assert!(rx.receive(1, b("b")).is_empty());
        assert_eq!(rx.take_acks(), vec![0, 1, 2]);
    }

    #[test]
    fn receiver_ignores_frames_beyond_window() {
        let mut rx = ReliableReceiver::new(4);
        assert!(rx.receive(10, b("far")).is_empty());
        assert!(!rx.has_pending_acks());
        assert_eq!(rx.buffered(), 0);
    }

    #[test]
    fn receiver_orders_across_wrap() {
        let mut rx = ReliableReceiver::new(16);
        rx.expected = 65534;
        assert!(rx.receive(0, b("z")).is_empty());
        assert_eq!(rx.receive(65534, b("x")), vec![b("x")]);
        assert_eq!(rx.receive(65535, b("y")), vec![b("y"), b("z")]);
    }

    #[test]
    fn sender_resends_until_acked() {
        let t0 = Instant::now();
        let mut tx = ReliableSender::new(Duration::from_millis(100), 5, 8, 8);
        let frame = tx.send(b("hello"), t0).unwrap();
        assert!(matches!(frame, Some(Frame::Reliable { seq: 0, .. })));

        assert!(tx.poll(t0 + Duration::from_millis(50)).unwrap().is_empty());
        let resent = tx.poll(t0 + Duration::from_millis(100)).unwrap();
        assert_eq!(resent.len(), 1);

        tx.on_ack(0);
        assert!(tx.is_idle());
        assert!(tx.poll(t0 + Duration::from_secs(5)).unwrap().is_empty());
    }

    #[test]
    fn sender_gives_up_after_max_attempts() {
        let t0 = Instant::now();
        let mut tx = ReliableSender::new(Duration::from_millis(10), 3, 8, 8);
        tx.send(b("x"), t0).unwrap();
        tx.poll(t0 + Duration::from_millis(10)).unwrap();
        tx.poll(t0 + Duration::from_millis(20)).unwrap();
        assert_eq!(
            tx.poll(t0 + Duration::from_millis(30)),
            Err(ChannelError::Unacknowledged { seq: 0, attempts: 3 })
        );
    }

    #[test]
    fn full_window_backlogs_then_releases() {
        let t0 = Instant::now();
        let mut tx = ReliableSender::new(Duration::from_secs(1), 5, 2, 1);
        assert!(tx.send(b("a"), t0).unwrap().is_some());
        assert!(tx.send(b("b"), t0).unwrap().is_some());
        assert!(tx.send(b("c"), t0).unwrap().is_none());
        assert!(matches!(
            tx.send(b("d"), t0),
            Err(ChannelError::WindowFull { .. })
        ));
        tx.on_ack(0);
        let released = tx.poll(t0).unwrap();
        assert_eq!(
            released,
            vec![Frame::Reliable {
                seq: 2,
                payload: b("c")
            }]
        );
    }

    #[test]
    fn send_after_ack_waits_behind_backlog() {
        let t0 = Instant::now();
        let mut tx = ReliableSender::new(Duration::from_secs(1), 5, 1, 8);
        let mut rx = ReliableReceiver::new(8);
        let mut delivered = Vec::new();

        let Some(Frame::Reliable { seq, payload }) = tx.send(b("a"), t0).unwrap() else {
            panic!("first send should go out");
        };
        delivered.extend(rx.receive(seq, payload));
        assert!(tx.send(b("b"), t0).unwrap().is_none());

        // Ack lands before the next poll; a fresh send must not jump the queue.
        tx.on_ack(0);
        assert!(tx.send(b("c"), t0).unwrap().is_none());
        assert_eq!(tx.backlog(), 2);

        for _ in 0..2 {
            for frame in tx.poll(t0).unwrap() {
                let Frame::Reliable { seq, payload } = frame else {
                    panic!("unexpected frame {frame:?}");
                };
                delivered.extend(rx.receive(seq, payload));
                tx.on_ack(seq);
            }
        }
        assert_eq!(delivered, vec![b("a"), b("b"), b("c")]);
        assert!(tx.is_idle());
    }

    #[test]
    fn sequenced_drops_older_and_duplicates() {
        let mut rx = SequencedReceiver::default();
        assert!(rx.accept(5));
        assert!(!rx.accept(5));
        assert!(!rx.accept(4));
        assert!(rx.accept(7));

        let mut wrapping = SequencedReceiver::default();
        assert!(wrapping.accept(65530));
        assert!(wrapping.accept(2));
        assert!(!wrapping.accept(65531));
    }
}
