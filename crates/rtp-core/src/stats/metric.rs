use tokio::time::Instant;

/// Packet, byte and error counters for one direction of a stream.
///
/// The bitrate estimate is refreshed by [`Metric::sample`], which the owner
/// calls periodically; it divides the bytes seen since the previous sample by
/// the time elapsed since then.
#[derive(Debug, Clone, Default)]
pub struct Metric {
    started: Option<Instant>,
    n_packets: u64,
    n_bytes: u64,
    n_err: u64,

    cur_bitrate: u64,
    ts_last: Option<Instant>,
    n_bytes_last: u64,
}

impl Metric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn add_packet(&mut self, size: usize) {
        self.add_packet_at(size, Instant::now());
    }

    pub fn add_packet_at(&mut self, size: usize, now: Instant) {
        if self.started.is_none() {
            self.started = Some(now);
            self.ts_last = Some(now);
        }
        self.n_packets += 1;
        self.n_bytes += size as u64;
    }

    pub fn add_errors(&mut self, count: u64) {
        self.n_err += count;
    }

    /// Recompute the current bitrate; returns it in bits per second
    pub fn sample(&mut self, now: Instant) -> u64 {
        let Some(last) = self.ts_last else {
            return 0;
        };
        let elapsed = now.saturating_duration_since(last);
        if elapsed.is_zero() {
            return self.cur_bitrate;
        }
        let bytes = self.n_bytes - self.n_bytes_last;
        self.cur_bitrate = (bytes * 8 * 1000) / (elapsed.as_millis().max(1) as u64);
        self.ts_last = Some(now);
        self.n_bytes_last = self.n_bytes;
        self.cur_bitrate
    }

    pub fn n_packets(&self) -> u64 {
        self.n_packets
    }

    pub fn n_bytes(&self) -> u64 {
        self.n_bytes
    }

    pub fn n_err(&self) -> u64 {
        self.n_err
    }

    pub fn cur_bitrate(&self) -> u64 {
        self.cur_bitrate
    }

    /// Average bitrate in bits per second since the first packet
    pub fn avg_bitrate(&self, now: Instant) -> f64 {
        match self.started {
            Some(start) => {
                let secs = now.saturating_duration_since(start).as_secs_f64();
                if secs > 0.0 {
                    self.n_bytes as f64 * 8.0 / secs
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }
}
