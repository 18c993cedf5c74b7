//! Jitter buffer: a sequence-ordered holding area for received RTP packets.
//!
//! Packets are keyed by a wrap-aware extended sequence number so that
//! ordering survives the 16-bit rollover. The buffer is capacity-bounded;
//! overflow evicts the lowest key first.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::packet::RtpPacket;

// Max backwards jump still treated as reordering rather than a rollover
const MAX_DISORDER: u16 = 100;
const MAX_SEQUENCE_NUMBER: u16 = 65535;

struct Entry {
    packet: RtpPacket,
    arrived: Instant,
}

/// Outcome of an insert: a fresh packet (possibly displacing the lowest
/// entry to stay within capacity) or a duplicate of a buffered one.
pub enum Inserted {
    Fresh {
        key: u64,
        evicted: Option<RtpPacket>,
    },
    Duplicate {
        key: u64,
    },
}

pub struct JitterBuffer {
    entries: BTreeMap<u64, Entry>,
    capacity: usize,
    last_seq: u16,
    rollover: u64,
    primed: bool,
}

impl JitterBuffer {
    pub fn new(capacity: usize) -> Self {
        JitterBuffer {
            entries: BTreeMap::new(),
            capacity: capacity.max(1),
            last_seq: 0,
            rollover: 0,
            primed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Extend a 16-bit sequence number with the rollover counter,
    /// tolerating stragglers from just before a wrap.
    fn extend(&mut self, seq: u16) -> u64 {
        if !self.primed {
            self.primed = true;
        } else if seq == 0 {
            if self.last_seq > MAX_DISORDER {
                self.rollover += 1;
            }
        } else if self.last_seq < MAX_DISORDER
            && seq > MAX_SEQUENCE_NUMBER - MAX_DISORDER
        {
            self.rollover = self.rollover.saturating_sub(1);
        } else if seq < MAX_DISORDER
            && self.last_seq > MAX_SEQUENCE_NUMBER - MAX_DISORDER
        {
            self.rollover += 1;
        }
        self.last_seq = seq;
        seq as u64 + (MAX_SEQUENCE_NUMBER as u64 + 1) * self.rollover
    }

    pub fn insert(&mut self, packet: RtpPacket, now: Instant) -> Inserted {
        let key = self.extend(packet.sequence);
        if self.entries.contains_key(&key) {
            return Inserted::Duplicate { key };
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_first().map(|(_, e)| e.packet)
        } else {
            None
        };

        self.entries.insert(
            key,
            Entry {
                packet,
                arrived: now,
            },
        );
        Inserted::Fresh { key, evicted }
    }

    /// Release, lowest sequence first, every entry that has aged past
    /// `delay`, plus whatever must go to bring the buffer back under
    /// capacity. Returned packets are in wrap-aware sequence order.
    pub fn drain(&mut self, now: Instant, delay: Duration) -> Vec<RtpPacket> {
        let mut released = Vec::new();

        while self.entries.len() >= self.capacity {
            match self.entries.pop_first() {
                Some((_, entry)) => released.push(entry.packet),
                None => break,
            }
        }

        let aged: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.arrived) >= delay)
            .map(|(key, _)| *key)
            .collect();
        for key in aged {
            if let Some(entry) = self.entries.remove(&key) {
                released.push(entry.packet);
            }
        }

        released
    }
}
