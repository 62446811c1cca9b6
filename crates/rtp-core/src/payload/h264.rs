//! H.264 RTP framing (RFC 6184, packetization-mode 1).
//!
//! An Annex-B access unit is split at its start codes. Each NAL unit is sent
//! either as a single NAL unit packet or, when it does not fit in `maxsz`
//! bytes, as a run of FU-A fragments. The marker bit goes on the very last
//! packet of the access unit.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{trace, warn};

use crate::Result;
use crate::error::Error;

/// NAL unit type of an IDR slice
pub const NAL_TYPE_IDR: u8 = 5;

/// NAL unit type of a fragmentation unit A
pub const NAL_TYPE_FU_A: u8 = 28;

const NAL_TYPE_MASK: u8 = 0x1f;
const NAL_NRI_MASK: u8 = 0x60;
const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

/// Size of the FU indicator plus FU header
pub const FU_HEADER_SIZE: usize = 2;

/// Position of the next `00 00 01` at or after `from`, or `data.len()` when
/// there is none.
///
/// Bytes up to the next 32-bit boundary are checked one at a time. Aligned
/// words are then tested for a zero byte with `(x - 0x01010101) & !x &
/// 0x80808080`, and only words that contain one are inspected. The tail is
/// scanned byte-wise again.
pub fn find_start_code(data: &[u8], from: usize) -> usize {
    let len = data.len();
    let at = |i: usize| data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1;

    let mut p = from;
    let misalign = (data.as_ptr() as usize).wrapping_add(p) & 3;
    let aligned = p + (4 - misalign);

    while p < aligned && p + 3 < len {
        if at(p) {
            return p;
        }
        p += 1;
    }

    // Every start code beginning in p..p+4 has a zero at p+1 or p+3.
    while p + 6 < len {
        let x = u32::from_ne_bytes([data[p], data[p + 1], data[p + 2], data[p + 3]]);
        if x.wrapping_sub(0x0101_0101) & !x & 0x8080_8080 != 0 {
            if data[p + 1] == 0 {
                if data[p] == 0 && data[p + 2] == 1 {
                    return p;
                }
                if data[p + 2] == 0 && data[p + 3] == 1 {
                    return p + 1;
                }
            }
            if data[p + 3] == 0 {
                if data[p + 2] == 0 && data[p + 4] == 1 {
                    return p + 2;
                }
                if data[p + 4] == 0 && data[p + 5] == 1 {
                    return p + 3;
                }
            }
        }
        p += 4;
    }

    while p + 3 < len {
        if at(p) {
            return p;
        }
        p += 1;
    }

    len
}

/// Iterate the NAL units of an Annex-B buffer, without start codes or
/// trailing zero bytes.
fn nal_units(buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut r = find_start_code(buf, 0);
    std::iter::from_fn(move || {
        while r < buf.len() {
            // Skip the zeros and the 0x01 of the start code
            while r < buf.len() && buf[r] == 0 {
                r += 1;
            }
            r += 1;
            if r >= buf.len() {
                return None;
            }
            let next = find_start_code(buf, r);
            let mut end = next;
            while end > r && buf[end - 1] == 0 {
                end -= 1;
            }
            let nal = &buf[r..end];
            r = next;
            if !nal.is_empty() {
                return Some(nal);
            }
        }
        None
    })
}

/// Whether the access unit contains an IDR slice
pub fn is_keyframe(buf: &[u8]) -> bool {
    nal_units(buf).any(|nal| nal[0] & NAL_TYPE_MASK == NAL_TYPE_IDR)
}

/// One packet's worth of H.264 payload, handed to the packetizer sink
#[derive(Debug, Clone, Copy)]
pub struct H264Fragment<'a> {
    pub marker: bool,
    pub timestamp: u32,
    /// The NAL header byte, or the two FU-A header bytes
    pub header: &'a [u8],
    pub payload: &'a [u8],
}

impl H264Fragment<'_> {
    pub fn len(&self) -> usize {
        self.header.len() + self.payload.len()
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len());
        out.put_slice(self.header);
        out.put_slice(self.payload);
        out.freeze()
    }
}

/// Packetize one access unit, handing each packet to `sink` in order.
///
/// A NAL unit whose header plus payload fits in `maxsz` is sent as is;
/// anything larger is split into FU-A fragments of at most `maxsz` bytes.
/// Sink failures do not stop the run; they are collected into one
/// [`Error::Packetization`] once every packet has been offered.
pub fn packetize<F>(timestamp: u32, buf: &[u8], maxsz: usize, mut sink: F) -> Result<()>
where
    F: FnMut(H264Fragment<'_>) -> Result<()>,
{
    if maxsz <= FU_HEADER_SIZE {
        return Err(Error::InvalidParameter(format!(
            "H.264 payload size {} leaves no room for FU-A data",
            maxsz
        )));
    }

    let mut failed = 0usize;
    let mut first_error: Option<Error> = None;
    let mut send = |frag: H264Fragment<'_>| {
        if let Err(e) = sink(frag) {
            failed += 1;
            first_error.get_or_insert(e);
        }
    };

    let mut nals = nal_units(buf).peekable();
    while let Some(nal) = nals.next() {
        let marker = nals.peek().is_none();
        send_nal(timestamp, nal, maxsz, marker, &mut send);
    }

    match first_error {
        None => Ok(()),
        Some(e) => {
            warn!("H.264 packetizer: {} packet(s) rejected by sink", failed);
            Err(Error::Packetization(format!("{} packet(s) failed, first: {}", failed, e)))
        }
    }
}

fn send_nal<F>(timestamp: u32, nal: &[u8], maxsz: usize, marker: bool, send: &mut F)
where
    F: FnMut(H264Fragment<'_>),
{
    let hdr = [nal[0]];
    let mut payload = &nal[1..];

    if nal.len() <= maxsz {
        trace!(len = nal.len(), marker, "single NAL unit packet");
        send(H264Fragment { marker, timestamp, header: &hdr, payload });
        return;
    }

    let chunk = maxsz - FU_HEADER_SIZE;
    let mut fu = [(hdr[0] & NAL_NRI_MASK) | NAL_TYPE_FU_A, FU_START | (hdr[0] & NAL_TYPE_MASK)];

    while payload.len() > chunk {
        send(H264Fragment { marker: false, timestamp, header: &fu, payload: &payload[..chunk] });
        payload = &payload[chunk..];
        fu[1] &= !FU_START;
    }

    fu[1] |= FU_END;
    send(H264Fragment { marker, timestamp, header: &fu, payload });
}

/// Owned packet payload produced by [`H264Packetizer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H264Payload {
    pub bytes: Bytes,
    pub marker: bool,
}

/// Convenience wrapper that collects packetizer output
#[derive(Debug, Clone, Copy)]
pub struct H264Packetizer {
    maxsz: usize,
}

impl H264Packetizer {
    pub fn new(maxsz: usize) -> Self {
        Self { maxsz }
    }

    pub fn max_payload_size(&self) -> usize {
        self.maxsz
    }

    pub fn packetize(&self, timestamp: u32, access_unit: &[u8]) -> Result<Vec<H264Payload>> {
        let mut out = Vec::new();
        packetize(timestamp, access_unit, self.maxsz, |frag| {
            out.push(H264Payload { bytes: frag.to_bytes(), marker: frag.marker });
            Ok(())
        })?;
        Ok(out)
    }
}

/// Reassembles NAL units from single NAL unit and FU-A payloads
#[derive(Debug, Default)]
pub struct H264Depacketizer {
    partial: Option<BytesMut>,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one RTP payload; returns a NAL unit (header included) once complete.
    pub fn push(&mut self, payload: &[u8]) -> Result<Option<Bytes>> {
        let Some(&first) = payload.first() else {
            return Err(Error::InvalidPacket("empty H.264 payload".to_string()));
        };

        match first & NAL_TYPE_MASK {
            1..=23 => Ok(Some(Bytes::copy_from_slice(payload))),
            NAL_TYPE_FU_A => {
                if payload.len() < FU_HEADER_SIZE {
                    return Err(Error::InvalidPacket("truncated FU-A header".to_string()));
                }
                let fu = payload[1];
                let data = &payload[FU_HEADER_SIZE..];

                if fu & FU_START != 0 {
                    let mut nal = BytesMut::with_capacity(1 + data.len());
                    nal.put_u8((first & 0xe0) | (fu & NAL_TYPE_MASK));
                    self.partial = Some(nal);
                }

                let Some(nal) = self.partial.as_mut() else {
                    return Err(Error::InvalidPacket("FU-A continuation without start".to_string()));
                };
                nal.put_slice(data);

                if fu & FU_END != 0 {
                    Ok(self.partial.take().map(BytesMut::freeze))
                } else {
                    Ok(None)
                }
            }
            other => Err(Error::InvalidPacket(format!("unsupported H.264 packet type {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(buf: &[u8], maxsz: usize) -> Vec<(bool, Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        packetize(9000, buf, maxsz, |f| {
            assert_eq!(f.timestamp, 9000);
            out.push((f.marker, f.header.to_vec(), f.payload.to_vec()));
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn test_find_start_code_positions() {
        let data = [0xaa, 0xbb, 0x00, 0x00, 0x01, 0x65];
        assert_eq!(find_start_code(&data, 0), 2);
        assert_eq!(find_start_code(&data, 3), data.len());
        assert_eq!(find_start_code(&[], 0), 0);
        assert_eq!(find_start_code(&[0x00, 0x00], 0), 2);
    }

    #[test]
    fn test_find_start_code_matches_naive_scan() {
        // Start codes at every offset within a word, plus misaligned slices
        let mut data = vec![0x11u8; 64];
        for &pos in &[5usize, 18, 31, 44, 57] {
            data[pos] = 0;
            data[pos + 1] = 0;
            data[pos + 2] = 1;
        }
        for skew in 0..4 {
            let slice = &data[skew..];
            let naive: Vec<usize> = (0..slice.len().saturating_sub(3))
                .filter(|&i| slice[i] == 0 && slice[i + 1] == 0 && slice[i + 2] == 1)
                .collect();
            let mut found = Vec::new();
            let mut p = 0;
            loop {
                let sc = find_start_code(slice, p);
                if sc >= slice.len() {
                    break;
                }
                found.push(sc);
                p = sc + 1;
            }
            assert_eq!(found, naive, "skew {}", skew);
        }
    }

    #[test]
    fn test_small_nal_is_sent_verbatim() {
        let au = [0, 0, 0, 1, 0x67, 1, 2, 3];
        let pkts = collect(&au, 100);
        assert_eq!(pkts.len(), 1);
        assert_eq!(pkts[0], (true, vec![0x67], vec![1, 2, 3]));
    }

    #[test]
    fn test_exact_fit_is_not_fragmented() {
        // header + 9 bytes == maxsz
        let mut au = vec![0, 0, 1, 0x41];
        au.extend(1..=9u8);
        let pkts = collect(&au, 10);
        assert_eq!(pkts.len(), 1);
        assert_eq!(pkts[0].1, vec![0x41]);

        // one more byte and it no longer fits
        au.push(10);
        let pkts = collect(&au, 10);
        assert!(pkts.len() > 1);
    }

    #[test]
    fn test_fu_a_reassembly() {
        let nal: Vec<u8> = std::iter::once(0x65).chain((0..1000u32).map(|i| (i % 251) as u8 + 1)).collect();
        let mut au = vec![0, 0, 0, 1];
        au.extend_from_slice(&nal);

        let maxsz = 100;
        let pkts = collect(&au, maxsz);
        assert!(pkts.len() > 1);

        let starts = pkts.iter().filter(|(_, h, _)| h[1] & FU_START != 0).count();
        let ends = pkts.iter().filter(|(_, h, _)| h[1] & FU_END != 0).count();
        assert_eq!(starts, 1);
        assert_eq!(ends, 1);
        assert!(pkts[0].1[1] & FU_START != 0);
        assert!(pkts.last().unwrap().1[1] & FU_END != 0);

        let mut payload = Vec::new();
        for (i, (marker, hdr, data)) in pkts.iter().enumerate() {
            assert_eq!(hdr[0], (0x65 & NAL_NRI_MASK) | NAL_TYPE_FU_A);
            assert_eq!(hdr[1] & NAL_TYPE_MASK, NAL_TYPE_IDR);
            assert!(hdr.len() + data.len() <= maxsz);
            assert_eq!(*marker, i == pkts.len() - 1);
            payload.extend_from_slice(data);
        }
        assert_eq!(payload, nal[1..]);
    }

    #[test]
    fn test_marker_only_on_last_nal_of_access_unit() {
        let mut au = vec![0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f];
        au.extend_from_slice(&[0, 0, 1, 0x68, 0xce]);
        au.extend_from_slice(&[0, 0, 1, 0x65]);
        au.extend(std::iter::repeat(0x88).take(300));

        let pkts = collect(&au, 128);
        assert_eq!(pkts[0], (false, vec![0x67], vec![0x42, 0x00, 0x1f]));
        assert_eq!(pkts[1], (false, vec![0x68], vec![0xce]));
        let markers: Vec<bool> = pkts.iter().map(|p| p.0).collect();
        assert_eq!(markers.iter().filter(|m| **m).count(), 1);
        assert!(*markers.last().unwrap());
    }

    #[test]
    fn test_trailing_zero_of_four_byte_start_code_is_dropped() {
        let au = [0, 0, 0, 1, 0x67, 0xaa, 0, 0, 0, 1, 0x68, 0xbb];
        let pkts = collect(&au, 100);
        assert_eq!(pkts[0].2, vec![0xaa]);
        assert_eq!(pkts[1].2, vec![0xbb]);
    }

    #[test]
    fn test_sink_errors_are_aggregated() {
        let mut au = vec![0, 0, 1, 0x65];
        au.extend(std::iter::repeat(7).take(50));
        let mut calls = 0;
        let err = packetize(0, &au, 12, |_| {
            calls += 1;
            if calls % 2 == 0 {
                Err(Error::Transport("socket full".into()))
            } else {
                Ok(())
            }
        })
        .unwrap_err();
        // Every fragment was still offered
        assert_eq!(calls, 5);
        assert!(matches!(err, Error::Packetization(_)));
    }

    #[test]
    fn test_rejects_tiny_maxsz() {
        assert!(matches!(
            packetize(0, &[0, 0, 1, 0x65, 1], 2, |_| Ok(())),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_keyframe_detection() {
        assert!(is_keyframe(&[0, 0, 0, 1, 0x67, 1, 0, 0, 1, 0x65, 2]));
        assert!(!is_keyframe(&[0, 0, 0, 1, 0x41, 1, 2]));
        assert!(!is_keyframe(&[]));
    }

    #[test]
    fn test_depacketizer_roundtrip_through_packetizer() {
        let nal: Vec<u8> = std::iter::once(0x45).chain(std::iter::repeat(0x5a).take(500)).collect();
        let mut au = vec![0, 0, 1];
        au.extend_from_slice(&nal);

        let payloads = H264Packetizer::new(64).packetize(0, &au).unwrap();
        let mut depack = H264Depacketizer::new();
        let mut out = Vec::new();
        for p in &payloads {
            if let Some(nal) = depack.push(&p.bytes).unwrap() {
                out.push(nal);
            }
        }
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &nal[..]);
    }

    #[test]
    fn test_depacketizer_rejects_orphan_continuation() {
        let mut depack = H264Depacketizer::new();
        tokio_test::assert_err!(depack.push(&[0x7c, 0x05, 1, 2]));
    }
}
