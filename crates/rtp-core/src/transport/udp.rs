use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::packet::is_rtcp_packet;
use crate::{DEFAULT_MAX_PACKET_SIZE, Result};

/// Random picks tried before giving up on a large port range
pub const MAX_BIND_ATTEMPTS: usize = 64;

/// First pause after a hard receive error; doubles up to the max
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);
const RECV_ERROR_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Which logical channel a datagram arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketChannel {
    Rtp,
    Rtcp,
}

/// RTP socket, plus a separate RTCP socket on the next port unless muxed
pub struct RtpSocket {
    rtp: Arc<UdpSocket>,
    rtcp: Option<Arc<UdpSocket>>,
    receivers: Vec<JoinHandle<()>>,
}

impl RtpSocket {
    /// Bind inside `min..=max` on `ip`.
    ///
    /// RTP takes an even port. Without `rtcp_mux`, RTCP takes the odd port
    /// right above it. `min == 0 && max == 0` lets the OS choose.
    pub fn bind_in_range(ip: IpAddr, min: u16, max: u16, rtcp_mux: bool) -> Result<Self> {
        if min == 0 && max == 0 {
            let rtp = bind(SocketAddr::new(ip, 0))?;
            let rtcp = if rtcp_mux { None } else { Some(bind(SocketAddr::new(ip, 0))?) };
            return Self::from_std(rtp, rtcp);
        }
        if min > max {
            return Err(Error::InvalidParameter(format!("Invalid port range {}-{}", min, max)));
        }

        for port in candidate_ports(min, max, rtcp_mux) {
            let Ok(rtp) = bind(SocketAddr::new(ip, port)) else {
                trace!("RTP port {} busy", port);
                continue;
            };
            let rtcp = if rtcp_mux {
                None
            } else {
                match bind(SocketAddr::new(ip, port + 1)) {
                    Ok(sock) => Some(sock),
                    Err(_) => {
                        trace!("RTCP port {} busy", port + 1);
                        continue;
                    }
                }
            };
            debug!("Bound RTP on {}:{} (rtcp_mux={})", ip, port, rtcp_mux);
            return Self::from_std(rtp, rtcp);
        }

        warn!("No free RTP port in {}-{}", min, max);
        Err(Error::PortRangeExhausted { min, max })
    }

    fn from_std(rtp: std::net::UdpSocket, rtcp: Option<std::net::UdpSocket>) -> Result<Self> {
        let rtp = Arc::new(UdpSocket::from_std(rtp)?);
        let rtcp = match rtcp {
            Some(sock) => Some(Arc::new(UdpSocket::from_std(sock)?)),
            None => None,
        };
        Ok(Self {
            rtp,
            rtcp,
            receivers: Vec::new(),
        })
    }

    pub fn is_muxed(&self) -> bool {
        self.rtcp.is_none()
    }

    pub fn local_rtp_addr(&self) -> Result<SocketAddr> {
        Ok(self.rtp.local_addr()?)
    }

    /// Local RTCP address; the RTP address when muxed
    pub fn local_rtcp_addr(&self) -> Result<SocketAddr> {
        match &self.rtcp {
            Some(sock) => Ok(sock.local_addr()?),
            None => self.local_rtp_addr(),
        }
    }

    pub async fn send_rtp(&self, data: &[u8], dest: SocketAddr) -> Result<usize> {
        self.rtp
            .send_to(data, dest)
            .await
            .map_err(|e| Error::Transport(format!("RTP send to {} failed: {}", dest, e)))
    }

    pub async fn send_rtcp(&self, data: &[u8], dest: SocketAddr) -> Result<usize> {
        let sock = self.rtcp.as_ref().unwrap_or(&self.rtp);
        sock.send_to(data, dest)
            .await
            .map_err(|e| Error::Transport(format!("RTCP send to {} failed: {}", dest, e)))
    }

    /// Spawn the receive tasks. Each datagram is handed to `on_packet`; on a
    /// muxed socket RTCP is told apart from RTP by its packet type.
    pub fn start_receivers<F>(&mut self, on_packet: F)
    where
        F: Fn(PacketChannel, Bytes, SocketAddr) + Send + Sync + 'static,
    {
        if !self.receivers.is_empty() {
            return;
        }
        let on_packet = Arc::new(on_packet);
        let muxed = self.rtcp.is_none();

        self.receivers.push(spawn_receiver(self.rtp.clone(), muxed, PacketChannel::Rtp, on_packet.clone()));
        if let Some(rtcp) = &self.rtcp {
            self.receivers.push(spawn_receiver(rtcp.clone(), false, PacketChannel::Rtcp, on_packet));
        }
    }

    /// Stop the receive tasks; sockets close when the last handle drops
    pub fn close(&mut self) {
        for task in self.receivers.drain(..) {
            task.abort();
        }
    }
}

impl Drop for RtpSocket {
    fn drop(&mut self) {
        self.close();
    }
}

fn bind(addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    let sock = std::net::UdpSocket::bind(addr)?;
    sock.set_nonblocking(true)?;
    Ok(sock)
}

/// Even ports to try: all of them for a small range, random picks otherwise
fn candidate_ports(min: u16, max: u16, rtcp_mux: bool) -> Vec<u16> {
    let top = if rtcp_mux { max as u32 } else { (max as u32).saturating_sub(1) };
    let first = min as u32 + (min as u32 & 1);
    if first > top {
        return Vec::new();
    }
    let count = ((top - first) / 2 + 1) as usize;
    let port = |i: usize| (first + 2 * i as u32) as u16;
    if count <= MAX_BIND_ATTEMPTS {
        return (0..count).map(port).collect();
    }
    let mut rng = rand::thread_rng();
    (0..MAX_BIND_ATTEMPTS).map(|_| port(rng.gen_range(0..count))).collect()
}

fn spawn_receiver<F>(sock: Arc<UdpSocket>, demux: bool, channel: PacketChannel, on_packet: Arc<F>) -> JoinHandle<()>
where
    F: Fn(PacketChannel, Bytes, SocketAddr) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; DEFAULT_MAX_PACKET_SIZE];
        let mut backoff = RECV_ERROR_BACKOFF;
        loop {
            match sock.recv_from(&mut buf).await {
                Ok((len, src)) => {
                    backoff = RECV_ERROR_BACKOFF;
                    let data = &buf[..len];
                    let ch = if demux && is_rtcp_packet(data) { PacketChannel::Rtcp } else { channel };
                    on_packet(ch, Bytes::copy_from_slice(data), src);
                }
                Err(e) if is_transient(&e) => {
                    debug!("{:?} receive error: {}", channel, e);
                }
                Err(e) => {
                    warn!("{:?} receive error, retrying in {:?}: {}", channel, backoff, e);
                    time::sleep(backoff).await;
                    backoff = next_backoff(backoff);
                }
            }
        }
    })
}

/// ICMP reports from an earlier send surface as these on some platforms
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(RECV_ERROR_BACKOFF_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_ports_small_range() {
        assert_eq!(candidate_ports(10000, 10005, false), vec![10000, 10002, 10004]);
        assert_eq!(candidate_ports(10001, 10004, true), vec![10002, 10004]);
        assert!(candidate_ports(10001, 10001, true).is_empty());
        assert!(candidate_ports(10000, 10000, false).is_empty());
    }

    #[test]
    fn test_receive_errors_classified() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_transient(&io::Error::other("socket gone")));
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        assert_eq!(next_backoff(RECV_ERROR_BACKOFF), Duration::from_millis(20));
        let mut backoff = RECV_ERROR_BACKOFF;
        for _ in 0..20 {
            backoff = next_backoff(backoff);
        }
        assert_eq!(backoff, RECV_ERROR_BACKOFF_MAX);
    }

    #[test]
    fn test_candidate_ports_large_range_are_even_and_in_range() {
        let ports = candidate_ports(1024, 49152, false);
        assert_eq!(ports.len(), MAX_BIND_ATTEMPTS);
        assert!(ports.iter().all(|p| p % 2 == 0 && *p >= 1024 && *p < 49152));
    }
}
