//! RTP clock helpers

use std::time::Duration;

/// Convert an RTP timestamp span to wall-clock time at `clock_rate`
pub fn rtp_timestamp_to_duration(timestamp: u32, clock_rate: u32) -> Duration {
    if clock_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = (timestamp as u64 * 1_000_000_000) / clock_rate as u64;
    Duration::from_nanos(nanos)
}

/// Convert wall-clock time to an RTP timestamp span at `clock_rate`
pub fn duration_to_rtp_timestamp(duration: Duration, clock_rate: u32) -> u32 {
    ((duration.as_nanos() * clock_rate as u128) / 1_000_000_000) as u32
}

/// Signed distance `a - b` between two RTP timestamps, wrap-aware
pub fn rtp_timestamp_delta(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Common RTP clock rates
pub mod clock_rates {
    pub const AUDIO_8KHZ: u32 = 8000;
    pub const AUDIO_48KHZ: u32 = 48000;
    pub const VIDEO_90KHZ: u32 = 90000;
}
