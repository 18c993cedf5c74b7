// Per-stream RTP state: outgoing sequence/timestamp stamping, incoming
// reordering through the jitter buffer, and the RFC 3550 interarrival
// jitter estimate.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::warn;

use crate::buffer::{Inserted, JitterBuffer};
use crate::packet::{PayloadType, RtpPacket};
use crate::rtcp;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub buffer_size: usize,
    pub buffer_delay: Duration,
    // Kept as configuration; the delay policy does not consult it yet.
    pub max_buffer_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            buffer_size: 50,
            buffer_delay: Duration::from_millis(100),
            max_buffer_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct StreamStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub duplicated: u64,
    pub out_of_order: u64,
    pub invalid: u64,
    pub lost: u64,
    pub jitter_ms: f64,
}

pub struct RtpSession {
    ssrc: u32,
    payload_type: PayloadType,
    clock_rate: u32,
    sequence: u16,
    timestamp: u32,

    remote_ssrc: Option<u32>,
    last_remote_seq: Option<u16>,
    last_remote_ts: u32,
    last_arrival: Option<Instant>,
    jitter: f64,

    buffer: JitterBuffer,
    delay: Duration,
    expected_sequence: u16,

    first_ext_seq: Option<u64>,
    highest_ext_seq: u64,
    report_expected: u64,
    report_received: u64,

    stats: StreamStats,
    started: Instant,
    active: bool,
}

impl RtpSession {
    pub fn new(payload_type: PayloadType, config: &SessionConfig) -> RtpSession {
        RtpSession {
            ssrc: lark_utils::rand_u32(),
            payload_type,
            clock_rate: payload_type.clock_rate(),
            sequence: (lark_utils::rand_u32() & 0x7fff) as u16,
            timestamp: lark_utils::rand_u32(),
            remote_ssrc: None,
            last_remote_seq: None,
            last_remote_ts: 0,
            last_arrival: None,
            jitter: 0.0,
            buffer: JitterBuffer::new(config.buffer_size),
            delay: config.buffer_delay,
            expected_sequence: 0,
            first_ext_seq: None,
            highest_ext_seq: 0,
            report_expected: 0,
            report_received: 0,
            stats: StreamStats::default(),
            started: Instant::now(),
            active: true,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn expected_sequence(&self) -> u16 {
        self.expected_sequence
    }

    pub fn stats(&self) -> StreamStats {
        self.stats.clone()
    }

    /// Stamp an outgoing payload, then advance the sequence number and the
    /// timestamp by the payload-type packetization interval.
    pub fn create_packet(&mut self, payload: Bytes, marker: bool) -> RtpPacket {
        let packet = RtpPacket {
            marker,
            payload_type: self.payload_type.number(),
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
            payload,
            ..Default::default()
        };

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self
            .timestamp
            .wrapping_add(self.payload_type.samples_per_packet());
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += packet.payload.len() as u64;

        packet
    }

    /// Feed one received datagram through counting, jitter estimation,
    /// sequence classification and the jitter buffer. Returns the packets
    /// the buffer released, in presentation order. Malformed input is
    /// counted and dropped here, never propagated.
    pub fn receive_packet(&mut self, buf: &[u8], now: Instant) -> Vec<RtpPacket> {
        let packet = match RtpPacket::parse(buf) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.invalid += 1;
                warn!("rtp parse error: {e}");
                return Vec::new();
            }
        };
        if !packet.is_valid() {
            self.stats.invalid += 1;
            warn!("rtp packet with version {} dropped", packet.version);
            return Vec::new();
        }

        self.stats.packets_received += 1;
        self.stats.bytes_received += packet.payload.len() as u64;
        if self.remote_ssrc.is_none() {
            self.remote_ssrc = Some(packet.ssrc);
        }

        self.update_jitter(&packet, now);

        let mut released = Vec::new();
        match self.last_remote_seq {
            None => {
                self.last_remote_seq = Some(packet.sequence);
                self.store(packet, now, &mut released);
            }
            Some(last) => {
                let diff = packet.sequence.wrapping_sub(last) as i16;
                if diff > 0 {
                    self.last_remote_seq = Some(packet.sequence);
                    self.store(packet, now, &mut released);
                } else if diff == 0 {
                    self.stats.duplicated += 1;
                } else {
                    // Late arrival: buffer it, but the high-water sequence
                    // stays put.
                    self.store(packet, now, &mut released);
                }
            }
        }

        released.extend(self.poll(now));
        released
    }

    fn store(&mut self, packet: RtpPacket, now: Instant, released: &mut Vec<RtpPacket>) {
        let late = self
            .last_remote_seq
            .map(|last| packet.sequence != last)
            .unwrap_or(false);
        match self.buffer.insert(packet, now) {
            Inserted::Fresh { key, evicted } => {
                if late {
                    self.stats.out_of_order += 1;
                }
                if self.first_ext_seq.is_none() {
                    self.first_ext_seq = Some(key);
                }
                if key > self.highest_ext_seq {
                    self.highest_ext_seq = key;
                }
                if let Some(evicted) = evicted {
                    released.push(evicted);
                }
            }
            Inserted::Duplicate { .. } => {
                self.stats.duplicated += 1;
            }
        }
    }

    /// RFC 3550 interarrival jitter, in milliseconds: the smoothed
    /// difference between observed and expected transit spacing,
    /// `J += (|D| - J) / 16`.
    fn update_jitter(&mut self, packet: &RtpPacket, now: Instant) {
        if let Some(prev) = self.last_arrival {
            let expected_ms = packet.timestamp.wrapping_sub(self.last_remote_ts)
                as i32 as f64
                * 1000.0
                / self.clock_rate as f64;
            let observed_ms = now.duration_since(prev).as_secs_f64() * 1000.0;
            let d = observed_ms - expected_ms;
            self.jitter += (d.abs() - self.jitter) / 16.0;
            self.stats.jitter_ms = self.jitter;
        }
        self.last_remote_ts = packet.timestamp;
        self.last_arrival = Some(now);
    }

    /// Drain the jitter buffer against the configured delay. The expected
    /// sequence number moves past the last released packet.
    pub fn poll(&mut self, now: Instant) -> Vec<RtpPacket> {
        let released = self.buffer.drain(now, self.delay);
        if let Some(last) = released.last() {
            self.expected_sequence = last.sequence.wrapping_add(1);
        }
        released
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Reception report block for this stream. Generation only; nothing
    /// here schedules RTCP transmission.
    pub fn receiver_report(&mut self) -> rtcp::ReceiverReport {
        let unique = self
            .stats
            .packets_received
            .saturating_sub(self.stats.duplicated);
        let expected = match self.first_ext_seq {
            Some(first) => self.highest_ext_seq - first + 1,
            None => 0,
        };
        let lost = expected.saturating_sub(unique);
        self.stats.lost = lost;

        let interval_expected = expected.saturating_sub(self.report_expected);
        let interval_received = unique.saturating_sub(self.report_received);
        let interval_lost = interval_expected.saturating_sub(interval_received);
        let fraction_lost = if interval_expected > 0 {
            ((interval_lost * 256) / interval_expected).min(255) as u8
        } else {
            0
        };
        self.report_expected = expected;
        self.report_received = unique;

        rtcp::receiver_report(
            self.ssrc,
            self.remote_ssrc.unwrap_or(0),
            fraction_lost,
            (lost as u32).min(0x00ff_ffff),
            (self.highest_ext_seq & 0xffff_ffff) as u32,
            self.jitter as u32,
        )
    }

    /// Stop the stream: the buffer is cleared and no further drain runs.
    pub fn stop(&mut self) {
        self.active = false;
        self.buffer.clear();
    }
}
