//! Engine configuration read through the [`Conf`] collaborator.
//!
//! Missing keys keep their defaults. Malformed values are logged and
//! skipped, so a typo never prevents start-up.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use rsua_infra_common::{Conf, Range};
use rsua_media_core::{JitterBufferConfig, JitterBufferType, StreamConfig};
use tracing::warn;

use crate::redial::RedialAttempts;

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Time allowed to reach ESTABLISHED; `None` disables the timer
    pub local_timeout: Option<Duration>,
    /// Concurrent calls accepted before inbound ones are refused
    pub max_calls: u32,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            local_timeout: Some(Duration::from_secs(120)),
            max_calls: 4,
        }
    }
}

/// Audio/video transport settings
#[derive(Debug, Clone)]
pub struct AvtConfig {
    pub rtp_ports: Range,
    pub rtcp_mux: bool,
    pub jbuf_type: JitterBufferType,
    /// Jitter buffer window in frames
    pub jbuf_delay: Range,
    /// Preferred window; 0 means the minimum
    pub jbuf_wish: u32,
    pub rtp_timeout: Option<Duration>,
}

impl Default for AvtConfig {
    fn default() -> Self {
        Self {
            rtp_ports: Range::new(1024, 49152),
            rtcp_mux: false,
            jbuf_type: JitterBufferType::Fixed,
            jbuf_delay: Range::new(5, 10),
            jbuf_wish: 0,
            rtp_timeout: None,
        }
    }
}

impl AvtConfig {
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            rtp_ports: self.rtp_ports,
            rtcp_mux: self.rtcp_mux,
            jbuf: JitterBufferConfig {
                jb_type: self.jbuf_type,
                min_frames: self.jbuf_delay.min,
                max_frames: self.jbuf_delay.max,
                wish_frames: self.jbuf_wish,
                ..Default::default()
            },
            rtp_timeout: self.rtp_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedialConfig {
    pub attempts: RedialAttempts,
    pub delay: Duration,
}

impl Default for RedialConfig {
    fn default() -> Self {
        Self {
            attempts: RedialAttempts::Finite(0),
            delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub call: CallConfig,
    pub avt: AvtConfig,
    pub redial: RedialConfig,
    /// Address media sockets are bound to
    pub media_laddr: IpAddr,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            call: CallConfig::default(),
            avt: AvtConfig::default(),
            redial: RedialConfig::default(),
            media_laddr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

fn apply<T>(target: &mut T, value: rsua_infra_common::Result<Option<T>>) {
    match value {
        Ok(Some(v)) => *target = v,
        Ok(None) => {}
        Err(e) => warn!("config: {}, keeping default", e),
    }
}

fn seconds(value: u32) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value as u64))
}

impl CoreConfig {
    pub fn from_conf(conf: &dyn Conf) -> Self {
        let mut cfg = CoreConfig::default();

        let mut local_timeout = 120;
        apply(&mut local_timeout, conf.get_u32("call_local_timeout"));
        cfg.call.local_timeout = seconds(local_timeout);
        apply(&mut cfg.call.max_calls, conf.get_u32("call_max_calls"));

        apply(&mut cfg.avt.rtp_ports, conf.get_range("rtp_ports"));
        apply(&mut cfg.avt.rtcp_mux, conf.get_bool("rtcp_mux"));
        if let Some(value) = conf.get_str("jitter_buffer_type") {
            match value.parse() {
                Ok(jb_type) => cfg.avt.jbuf_type = jb_type,
                Err(e) => warn!("config: jitter_buffer_type: {}, keeping default", e),
            }
        }
        apply(&mut cfg.avt.jbuf_delay, conf.get_range("jitter_buffer_delay"));
        apply(&mut cfg.avt.jbuf_wish, conf.get_u32("jitter_buffer_wish"));
        let mut rtp_timeout = 0;
        apply(&mut rtp_timeout, conf.get_u32("rtp_timeout"));
        cfg.avt.rtp_timeout = seconds(rtp_timeout);

        if let Some(value) = conf.get_str("redial_attempts") {
            match value.parse() {
                Ok(attempts) => cfg.redial.attempts = attempts,
                Err(e) => warn!("config: {}, keeping default", e),
            }
        }
        let mut delay = 5;
        apply(&mut delay, conf.get_u32("redial_delay"));
        cfg.redial.delay = Duration::from_secs(delay as u64);

        if let Some(value) = conf.get_str("media_laddr") {
            match value.trim().parse() {
                Ok(addr) => cfg.media_laddr = addr,
                Err(_) => warn!("config: media_laddr '{}' is not an address, keeping default", value),
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsua_infra_common::ConfMap;

    #[test]
    fn test_defaults() {
        let cfg = CoreConfig::from_conf(&ConfMap::new());
        assert_eq!(cfg.call.local_timeout, Some(Duration::from_secs(120)));
        assert_eq!(cfg.call.max_calls, 4);
        assert_eq!(cfg.avt.rtp_ports, Range::new(1024, 49152));
        assert!(!cfg.avt.rtcp_mux);
        assert_eq!(cfg.avt.jbuf_type, JitterBufferType::Fixed);
        assert_eq!(cfg.avt.jbuf_delay, Range::new(5, 10));
        assert_eq!(cfg.avt.rtp_timeout, None);
        assert_eq!(cfg.redial.attempts, RedialAttempts::Finite(0));
        assert_eq!(cfg.redial.delay, Duration::from_secs(5));
    }

    #[test]
    fn test_values_override_defaults() {
        let conf = ConfMap::new()
            .with("call_local_timeout", "0")
            .with("call_max_calls", "2")
            .with("rtp_ports", "10000-10100")
            .with("rtcp_mux", "yes")
            .with("jitter_buffer_type", "adaptive")
            .with("jitter_buffer_delay", "2-20")
            .with("rtp_timeout", "30")
            .with("redial_attempts", "inf")
            .with("redial_delay", "1")
            .with("media_laddr", "127.0.0.1");
        let cfg = CoreConfig::from_conf(&conf);
        assert_eq!(cfg.call.local_timeout, None);
        assert_eq!(cfg.call.max_calls, 2);
        assert_eq!(cfg.avt.rtp_ports, Range::new(10000, 10100));
        assert!(cfg.avt.rtcp_mux);
        assert_eq!(cfg.avt.jbuf_type, JitterBufferType::Adaptive);
        assert_eq!(cfg.avt.rtp_timeout, Some(Duration::from_secs(30)));
        assert_eq!(cfg.redial.attempts, RedialAttempts::Infinite);
        assert_eq!(cfg.media_laddr, IpAddr::V4(Ipv4Addr::LOCALHOST));

        let stream = cfg.avt.stream_config();
        assert_eq!(stream.jbuf.min_frames, 2);
        assert_eq!(stream.jbuf.max_frames, 20);
    }

    #[test]
    fn test_malformed_values_are_skipped() {
        let conf = ConfMap::new()
            .with("call_max_calls", "many")
            .with("rtcp_mux", "perhaps")
            .with("jitter_buffer_type", "elastic")
            .with("redial_attempts", "-1")
            .with("rtp_ports", "9-3");
        let cfg = CoreConfig::from_conf(&conf);
        assert_eq!(cfg.call.max_calls, 4);
        assert!(!cfg.avt.rtcp_mux);
        assert_eq!(cfg.avt.jbuf_type, JitterBufferType::Fixed);
        assert_eq!(cfg.redial.attempts, RedialAttempts::Finite(0));
        assert_eq!(cfg.avt.rtp_ports, Range::new(1024, 49152));
    }
}
