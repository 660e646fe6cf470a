//! Simulation tick clock and tick-keyed deferred work.

use std::collections::BTreeMap;
use std::time::Duration;

/// Monotonic tick counter at a fixed rate.
///
/// The host advances it once per fixed step. Clients re-derive it from every
/// latency sample; the most recent sample wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickClock {
    tick: u32,
    tick_rate: u32,
}

impl TickClock {
    pub fn new(tick_rate: u32) -> Self {
        Self {
            tick: 0,
            tick_rate: tick_rate.max(1),
        }
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn advance(&mut self) -> u32 {
        self.tick = self.tick.wrapping_add(1);
        self.tick
    }

    pub fn set(&mut self, tick: u32) {
        self.tick = tick;
    }

    /// `server_tick + round(rtt / 2 × tick_rate)`.
    pub fn sync_from_server(&mut self, server_tick: u32, rtt: Duration) -> u32 {
        let one_way = rtt.as_secs_f64() / 2.0;
        let lead = (one_way * self.tick_rate as f64).round() as u32;
        self.tick = server_tick.wrapping_add(lead);
        self.tick
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate as f64)
    }

    /// Whole ticks covering `d`, rounded up.
    pub fn ticks_for(&self, d: Duration) -> u32 {
        (d.as_secs_f64() * self.tick_rate as f64).ceil() as u32
    }
}

/// Work items waiting for a tick.
///
/// Items scheduled for the same tick come back in insertion order.
#[derive(Debug)]
pub struct DeferredQueue<T> {
    slots: BTreeMap<u32, Vec<T>>,
    len: usize,
}

impl<T> Default for DeferredQueue<T> {
    fn default() -> Self {
        Self {
            slots: BTreeMap::new(),
            len: 0,
        }
    }
}

impl<T> DeferredQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, at_tick: u32, item: T) {
        self.slots.entry(at_tick).or_default().push(item);
        self.len += 1;
    }

    /// Removes and returns everything scheduled at or before `now_tick`.
    pub fn due(&mut self, now_tick: u32) -> Vec<T> {
        let later = self.slots.split_off(&now_tick.saturating_add(1));
        let due = std::mem::replace(&mut self.slots, later);
        let out: Vec<T> = due.into_values().flatten().collect();
        self.len -= out.len();
        out
    }

    /// Drops every pending item matching `pred`; returns how many went.
    pub fn cancel_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> usize {
        let mut removed = 0;
        self.slots.retain(|_, items| {
            let before = items.len();
            items.retain(|i| !pred(i));
            removed += before - items.len();
            !items.is_empty()
        });
        self.len -= removed;
        removed
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
