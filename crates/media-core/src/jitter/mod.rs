//! Receive-side jitter buffer.
//!
//! Packets are keyed by their wrap-extended sequence number so they come out
//! in order. A packet is released once more than `target` frames are held.
//! In [`JitterBufferType::Fixed`] mode the target is constant. In
//! [`JitterBufferType::Adaptive`] mode it follows the RFC 3550 interarrival
//! jitter estimate inside the configured `min..=max` frame range.
//! [`JitterBufferType::Off`] delivers every packet straight away.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use rsua_rtp_core::RtpPacket;
use rsua_rtp_core::time::{duration_to_rtp_timestamp, rtp_timestamp_delta};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterBufferType {
    Off,
    #[default]
    Fixed,
    Adaptive,
}

impl FromStr for JitterBufferType {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(JitterBufferType::Off),
            "fixed" => Ok(JitterBufferType::Fixed),
            "adaptive" => Ok(JitterBufferType::Adaptive),
            other => Err(MediaError::InvalidInput(format!("unknown jitter buffer type '{}'", other))),
        }
    }
}

impl fmt::Display for JitterBufferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JitterBufferType::Off => "off",
            JitterBufferType::Fixed => "fixed",
            JitterBufferType::Adaptive => "adaptive",
        })
    }
}

#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    pub jb_type: JitterBufferType,
    /// Lower bound of the playout window, in frames
    pub min_frames: u32,
    /// Upper bound of the playout window, in frames
    pub max_frames: u32,
    /// Preferred window; 0 means `min_frames`
    pub wish_frames: u32,
    /// RTP clock rate of the stream
    pub clock_rate: u32,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            jb_type: JitterBufferType::Fixed,
            min_frames: 5,
            max_frames: 10,
            wish_frames: 0,
            clock_rate: 8000,
        }
    }
}

impl JitterBufferConfig {
    fn initial_target(&self) -> u32 {
        if self.wish_frames == 0 {
            self.min_frames
        } else {
            self.wish_frames.clamp(self.min_frames, self.max_frames)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JitterBufferStats {
    pub packets_in: u64,
    pub packets_out: u64,
    /// Sequence numbers skipped on the way out
    pub lost: u64,
    /// Packets dropped for arriving behind the playout point
    pub late: u64,
    pub duplicates: u64,
    /// Packets dropped because the buffer was over capacity
    pub overflows: u64,
    pub buffered: usize,
    pub target_frames: u32,
    /// Interarrival jitter estimate in milliseconds
    pub jitter_ms: f64,
}

/// Why [`JitterBuffer::put`] refused a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutError {
    Late,
    Duplicate,
}

pub struct JitterBuffer {
    config: JitterBufferConfig,
    packets: BTreeMap<u64, RtpPacket>,
    passthrough: VecDeque<RtpPacket>,

    /// Highest extended sequence number seen
    highest: Option<u64>,
    /// Extended sequence number of the last packet released
    last_out: Option<u64>,
    target: u32,

    // RFC 3550 A.8 interarrival jitter, in RTP timestamp units
    jitter: f64,
    base: Option<(Instant, u32)>,
    last_transit: Option<i64>,
    frame_ts: u32,

    stats: JitterBufferStats,
}

impl JitterBuffer {
    /// A `max_frames` below `min_frames` is raised to `min_frames`.
    pub fn new(mut config: JitterBufferConfig) -> Self {
        if config.min_frames > config.max_frames {
            warn!(
                min = config.min_frames,
                max = config.max_frames,
                "jitter buffer max below min, using min for both"
            );
            config.max_frames = config.min_frames;
        }
        let target = config.initial_target();
        let frame_ts = config.clock_rate / 50;
        Self {
            config,
            packets: BTreeMap::new(),
            passthrough: VecDeque::new(),
            highest: None,
            last_out: None,
            target,
            jitter: 0.0,
            base: None,
            last_transit: None,
            frame_ts,
            stats: JitterBufferStats::default(),
        }
    }

    pub fn jb_type(&self) -> JitterBufferType {
        self.config.jb_type
    }

    /// Current playout window in frames
    pub fn target(&self) -> u32 {
        self.target
    }

    fn capacity(&self) -> usize {
        (self.config.max_frames.max(1) as usize) * 2
    }

    /// Extend a 16-bit sequence number relative to the highest seen so far
    fn extend(&self, seq: u16) -> u64 {
        match self.highest {
            None => (1u64 << 16) + seq as u64,
            Some(high) => {
                let delta = seq.wrapping_sub(high as u16) as i16 as i64;
                (high as i64 + delta).max(0) as u64
            }
        }
    }

    pub fn put(&mut self, packet: RtpPacket, arrival: Instant) -> Result<(), PutError> {
        self.stats.packets_in += 1;
        self.update_jitter(&packet, arrival);

        if self.config.jb_type == JitterBufferType::Off {
            let ext = self.extend(packet.header.sequence_number);
            self.highest = Some(self.highest.map_or(ext, |h| h.max(ext)));
            self.passthrough.push_back(packet);
            return Ok(());
        }

        let ext = self.extend(packet.header.sequence_number);

        if let Some(last) = self.last_out {
            if ext <= last {
                self.stats.late += 1;
                trace!(seq = packet.header.sequence_number, "jitter buffer: late packet dropped");
                return Err(PutError::Late);
            }
        }
        if self.packets.contains_key(&ext) {
            self.stats.duplicates += 1;
            return Err(PutError::Duplicate);
        }

        self.highest = Some(self.highest.map_or(ext, |h| h.max(ext)));
        self.packets.insert(ext, packet);

        while self.packets.len() > self.capacity() {
            if let Some((ext, _)) = self.packets.pop_first() {
                debug!("jitter buffer overflow, dropping oldest frame");
                self.stats.overflows += 1;
                self.advance(ext);
            }
        }
        Ok(())
    }

    /// Next packet for playout, if the window is full enough
    pub fn get(&mut self) -> Option<RtpPacket> {
        if self.config.jb_type == JitterBufferType::Off {
            let packet = self.passthrough.pop_front()?;
            self.stats.packets_out += 1;
            return Some(packet);
        }

        if self.packets.len() <= self.target as usize {
            return None;
        }
        self.pop_next()
    }

    /// Release everything still held, in order
    pub fn drain(&mut self) -> Vec<RtpPacket> {
        let mut out: Vec<RtpPacket> = self.passthrough.drain(..).collect();
        self.stats.packets_out += out.len() as u64;
        while let Some(packet) = self.pop_next() {
            out.push(packet);
        }
        out
    }

    /// Forget all state, e.g. after the sender changed SSRC
    pub fn flush(&mut self) {
        self.packets.clear();
        self.passthrough.clear();
        self.highest = None;
        self.last_out = None;
        self.base = None;
        self.last_transit = None;
        self.jitter = 0.0;
        self.target = self.config.initial_target();
    }

    fn pop_next(&mut self) -> Option<RtpPacket> {
        let (ext, packet) = self.packets.pop_first()?;
        self.advance(ext);
        self.stats.packets_out += 1;
        Some(packet)
    }

    fn advance(&mut self, ext: u64) {
        if let Some(last) = self.last_out {
            if ext > last + 1 {
                self.stats.lost += ext - last - 1;
            }
        }
        self.last_out = Some(ext);
    }

    fn update_jitter(&mut self, packet: &RtpPacket, arrival: Instant) {
        let ts = packet.header.timestamp;
        let (base_time, base_ts) = *self.base.get_or_insert((arrival, ts));

        let elapsed = arrival.saturating_duration_since(base_time);
        let arrival_ts = duration_to_rtp_timestamp(elapsed, self.config.clock_rate) as i64;
        let transit = arrival_ts - rtp_timestamp_delta(ts, base_ts) as i64;

        if let Some(prev) = self.last_transit {
            let d = (transit - prev).abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);

        if let Some(high) = self.highest {
            if self.extend(packet.header.sequence_number) == high + 1 {
                if let Some(prev) = self.packets.get(&high).or(self.passthrough.back()) {
                    let step = rtp_timestamp_delta(ts, prev.header.timestamp);
                    if step > 0 {
                        self.frame_ts = step as u32;
                    }
                }
            }
        }

        if self.config.jb_type == JitterBufferType::Adaptive {
            let frame = self.frame_ts.max(1) as f64;
            let extra = (2.0 * self.jitter / frame).ceil() as u32;
            let target = (self.config.min_frames + extra).clamp(self.config.min_frames, self.config.max_frames);
            if target != self.target {
                debug!(from = self.target, to = target, "jitter buffer window adjusted");
                self.target = target;
            }
        }
    }

    pub fn stats(&self) -> JitterBufferStats {
        let mut stats = self.stats.clone();
        stats.buffered = self.packets.len() + self.passthrough.len();
        stats.target_frames = self.target;
        stats.jitter_ms = if self.config.clock_rate > 0 {
            self.jitter * 1000.0 / self.config.clock_rate as f64
        } else {
            0.0
        };
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn pkt(seq: u16, ts: u32) -> RtpPacket {
        RtpPacket::new_with_payload(0, seq, ts, 1, Bytes::from(vec![seq as u8]))
    }

    fn fixed(min: u32, max: u32) -> JitterBuffer {
        JitterBuffer::new(JitterBufferConfig {
            jb_type: JitterBufferType::Fixed,
            min_frames: min,
            max_frames: max,
            ..Default::default()
        })
    }

    fn seqs(packets: &[RtpPacket]) -> Vec<u16> {
        packets.iter().map(|p| p.header.sequence_number).collect()
    }

    #[test]
    fn test_fixed_reorders_within_window() {
        let mut jb = fixed(3, 3);
        let now = Instant::now();
        let mut out = Vec::new();
        for seq in [10u16, 12, 11, 14, 13, 15] {
            jb.put(pkt(seq, seq as u32 * 160), now).unwrap();
            while let Some(p) = jb.get() {
                out.push(p);
            }
        }
        assert_eq!(seqs(&out), vec![10, 11, 12]);
        out.extend(jb.drain());
        assert_eq!(seqs(&out), vec![10, 11, 12, 13, 14, 15]);
        assert_eq!(jb.stats().lost, 0);
    }

    #[test]
    fn test_fixed_drops_late_packets_as_loss() {
        let mut jb = fixed(1, 1);
        let now = Instant::now();
        let mut out = Vec::new();
        for seq in [1u16, 2, 4, 5] {
            jb.put(pkt(seq, 0), now).unwrap();
            while let Some(p) = jb.get() {
                out.push(p);
            }
        }
        // 3 was skipped when 4 went out
        assert_eq!(seqs(&out), vec![1, 2, 4]);
        assert_eq!(jb.put(pkt(3, 0), now), Err(PutError::Late));
        let stats = jb.stats();
        assert_eq!(stats.late, 1);
        assert_eq!(stats.lost, 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut jb = fixed(5, 10);
        let now = Instant::now();
        jb.put(pkt(7, 0), now).unwrap();
        assert_eq!(jb.put(pkt(7, 0), now), Err(PutError::Duplicate));
        assert_eq!(jb.stats().duplicates, 1);
    }

    #[test]
    fn test_sequence_wrap_keeps_order() {
        let mut jb = fixed(2, 2);
        let now = Instant::now();
        for seq in [65534u16, 0, 65535, 1] {
            jb.put(pkt(seq, 0), now).unwrap();
        }
        let mut out = Vec::new();
        while let Some(p) = jb.get() {
            out.push(p);
        }
        out.extend(jb.drain());
        assert_eq!(seqs(&out), vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn test_off_mode_passes_through_in_arrival_order() {
        let mut jb = JitterBuffer::new(JitterBufferConfig {
            jb_type: JitterBufferType::Off,
            ..Default::default()
        });
        let now = Instant::now();
        jb.put(pkt(2, 0), now).unwrap();
        assert_eq!(jb.get().map(|p| p.header.sequence_number), Some(2));
        jb.put(pkt(1, 0), now).unwrap();
        assert_eq!(jb.get().map(|p| p.header.sequence_number), Some(1));
        assert!(jb.get().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut jb = fixed(2, 2);
        let now = Instant::now();
        // never drained; capacity is 2 * max
        for seq in 0u16..6 {
            jb.put(pkt(seq, 0), now).unwrap();
        }
        let stats = jb.stats();
        assert_eq!(stats.overflows, 2);
        assert_eq!(stats.buffered, 4);
        assert_eq!(seqs(&jb.drain()), vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_adaptive_window_follows_jitter() {
        let mut jb = JitterBuffer::new(JitterBufferConfig {
            jb_type: JitterBufferType::Adaptive,
            min_frames: 2,
            max_frames: 8,
            wish_frames: 0,
            clock_rate: 8000,
        });
        let t0 = Instant::now();

        // Steady 20 ms spacing: window stays at the minimum
        for i in 0..20u16 {
            jb.put(pkt(i, i as u32 * 160), t0 + Duration::from_millis(i as u64 * 20)).unwrap();
            while jb.get().is_some() {}
        }
        assert_eq!(jb.target(), 2);

        // Alternate arrivals 60 ms early and late: window grows, capped at max
        for i in 20..60u16 {
            let skew: i64 = if i % 2 == 0 { 60 } else { -60 };
            let at = (i as i64 * 20 + skew) as u64;
            let _ = jb.put(pkt(i, i as u32 * 160), t0 + Duration::from_millis(at));
            while jb.get().is_some() {}
        }
        let grown = jb.target();
        assert!(grown > 2 && grown <= 8, "target {}", grown);

        // Back to steady arrivals: the estimate decays and the window shrinks
        for i in 60..200u16 {
            jb.put(pkt(i, i as u32 * 160), t0 + Duration::from_millis(i as u64 * 20)).unwrap();
            while jb.get().is_some() {}
        }
        assert!(jb.target() < grown);
        assert!(jb.target() >= 2);
    }

    #[test]
    fn test_inverted_window_is_widened() {
        let mut jb = JitterBuffer::new(JitterBufferConfig {
            jb_type: JitterBufferType::Adaptive,
            min_frames: 8,
            max_frames: 2,
            ..Default::default()
        });
        let t0 = Instant::now();
        for i in 0..20u16 {
            let skew = if i % 2 == 0 { 0 } else { 50 };
            let _ = jb.put(pkt(i, i as u32 * 160), t0 + Duration::from_millis(i as u64 * 20 + skew));
            while jb.get().is_some() {}
        }
        assert_eq!(jb.target(), 8);
    }

    #[test]
    fn test_parse_type() {
        assert_eq!("Adaptive".parse::<JitterBufferType>().unwrap(), JitterBufferType::Adaptive);
        assert!("bouncy".parse::<JitterBufferType>().is_err());
    }
}
