use bitvec::prelude::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::Error;
use crate::{Result, RtpCsrc, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

pub const RTP_VERSION: u8 = 2;

/// Minimum header size (without CSRC or extensions)
pub const RTP_MIN_HEADER_SIZE: usize = 12;

/// RTCP packet types occupy 192..=223 in the second octet (RFC 5761 §4)
const RTCP_PT_RANGE: std::ops::RangeInclusive<u8> = 192..=223;

/// RTP header extension (RFC 3550 §5.3.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpExtension {
    pub profile: u16,
    /// Extension body, a multiple of four bytes on the wire
    pub data: Bytes,
}

/// RTP fixed header plus CSRC list and optional extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: RtpSequenceNumber,
    pub timestamp: RtpTimestamp,
    pub ssrc: RtpSsrc,
    pub csrc: Vec<RtpCsrc>,
    pub extension: Option<RtpExtension>,
}

impl RtpHeader {
    pub fn new(
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
    ) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extension: None,
        }
    }

    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    /// Encoded size in bytes
    pub fn size(&self) -> usize {
        let ext = self
            .extension
            .as_ref()
            .map(|e| 4 + e.data.len().div_ceil(4) * 4)
            .unwrap_or(0);
        RTP_MIN_HEADER_SIZE + self.csrc.len() * 4 + ext
    }

    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        need(buf, RTP_MIN_HEADER_SIZE)?;

        // V(2) P(1) X(1) CC(4)
        let first = buf.get_u8();
        let bits = first.view_bits::<Msb0>();
        let version = bits[0..2].load::<u8>();
        if version != RTP_VERSION {
            return Err(Error::InvalidPacket(format!("Invalid RTP version: {}", version)));
        }
        let padding = bits[2];
        let has_extension = bits[3];
        let cc = bits[4..8].load::<u8>();

        // M(1) PT(7)
        let second = buf.get_u8();
        let bits = second.view_bits::<Msb0>();
        let marker = bits[0];
        let payload_type = bits[1..8].load::<u8>();

        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        need(buf, cc as usize * 4)?;
        let csrc = (0..cc).map(|_| buf.get_u32()).collect();

        let extension = if has_extension {
            need(buf, 4)?;
            let profile = buf.get_u16();
            let len = buf.get_u16() as usize * 4;
            need(buf, len)?;
            Some(RtpExtension {
                profile,
                data: buf.copy_to_bytes(len),
            })
        } else {
            None
        };

        Ok(Self {
            version,
            padding,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension,
        })
    }

    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        if self.csrc.len() > 15 {
            return Err(Error::InvalidParameter(format!(
                "CSRC list too long: {}",
                self.csrc.len()
            )));
        }
        buf.reserve(self.size());

        let mut first = 0u8;
        let bits = first.view_bits_mut::<Msb0>();
        bits[0..2].store(self.version & 0x03);
        bits.set(2, self.padding);
        bits.set(3, self.extension.is_some());
        bits[4..8].store(self.csrc.len() as u8);
        buf.put_u8(first);

        let mut second = 0u8;
        let bits = second.view_bits_mut::<Msb0>();
        bits.set(0, self.marker);
        bits[1..8].store(self.payload_type & 0x7f);
        buf.put_u8(second);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }

        if let Some(ext) = &self.extension {
            let words = ext.data.len().div_ceil(4);
            if words > u16::MAX as usize {
                return Err(Error::InvalidParameter("Header extension too long".to_string()));
            }
            buf.put_u16(ext.profile);
            buf.put_u16(words as u16);
            buf.put_slice(&ext.data);
            buf.put_bytes(0, words * 4 - ext.data.len());
        }

        Ok(())
    }
}

fn need(buf: &impl Buf, required: usize) -> Result<()> {
    if buf.remaining() < required {
        return Err(Error::BufferTooSmall {
            required,
            available: buf.remaining(),
        });
    }
    Ok(())
}

/// RTP packet: header plus payload with padding stripped
#[derive(Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    pub fn new_with_payload(
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
        payload: Bytes,
    ) -> Self {
        Self {
            header: RtpHeader::new(payload_type, sequence_number, timestamp, ssrc),
            payload,
        }
    }

    pub fn size(&self) -> usize {
        self.header.size() + self.payload.len()
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        Self::parse_bytes(Bytes::copy_from_slice(data))
    }

    /// Parse without copying the payload out of `data`
    pub fn parse_bytes(mut data: Bytes) -> Result<Self> {
        let header = RtpHeader::parse(&mut data)?;

        let pad = if header.padding {
            let pad = data.last().copied().unwrap_or(0) as usize;
            if pad == 0 || pad > data.len() {
                return Err(Error::InvalidPacket(format!(
                    "Invalid padding length {} with {} bytes remaining",
                    pad,
                    data.len()
                )));
            }
            pad
        } else {
            0
        };

        let payload = data.slice(..data.len() - pad);
        Ok(Self { header, payload })
    }

    /// Serialize without padding; the padding flag is cleared on the wire
    pub fn serialize(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size());
        let mut header = self.header.clone();
        header.padding = false;
        header.serialize(&mut buf)?;
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

impl fmt::Debug for RtpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpPacket")
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Whether a datagram received on a muxed socket is RTCP rather than RTP
pub fn is_rtcp_packet(data: &[u8]) -> bool {
    data.len() >= 8 && data[0] >> 6 == RTP_VERSION && RTCP_PT_RANGE.contains(&data[1])
}
