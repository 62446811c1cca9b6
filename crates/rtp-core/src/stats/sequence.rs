use crate::{RtpSequenceNumber, RtpSsrc};

/// Jumps up to this size are treated as loss; larger forward jumps re-sync
const MAX_DROPOUT: u16 = 3000;

/// Packets at most this far behind the last one are reported as late
const MAX_MISORDER: u16 = 100;

/// Outcome of feeding one received sequence number to [`SequenceTracker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqResult {
    /// First packet from this source; tracking is now seeded
    First,
    /// The source changed SSRC and tracking was re-seeded
    SsrcChanged { previous: RtpSsrc },
    /// Next packet in order
    InOrder,
    /// `lost` packets are missing between the previous and this one
    Gap { lost: u16 },
    /// Large forward jump, accepted without counting loss
    Resync,
    Duplicate,
    /// Older than the last accepted packet
    Late,
}

impl SeqResult {
    /// Whether the packet should be passed on for playout
    pub fn is_accepted(&self) -> bool {
        !matches!(self, SeqResult::Duplicate | SeqResult::Late)
    }

    pub fn lost(&self) -> u16 {
        match self {
            SeqResult::Gap { lost } => *lost,
            _ => 0,
        }
    }
}

/// Receive-side SSRC and sequence tracker.
///
/// The first packet seeds the expected sequence number. Each later packet is
/// compared against the last accepted one; a forward gap is counted as loss.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    ssrc: Option<RtpSsrc>,
    last_seq: RtpSequenceNumber,
    lost: u64,
    duplicates: u64,
    late: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, ssrc: RtpSsrc, seq: RtpSequenceNumber) -> SeqResult {
        match self.ssrc {
            None => {
                self.seed(ssrc, seq);
                return SeqResult::First;
            }
            Some(previous) if previous != ssrc => {
                self.seed(ssrc, seq);
                return SeqResult::SsrcChanged { previous };
            }
            Some(_) => {}
        }

        let delta = seq.wrapping_sub(self.last_seq);
        let result = if delta == 0 {
            self.duplicates += 1;
            return SeqResult::Duplicate;
        } else if delta == 1 {
            SeqResult::InOrder
        } else if delta < MAX_DROPOUT {
            let lost = delta - 1;
            self.lost += lost as u64;
            SeqResult::Gap { lost }
        } else if delta <= u16::MAX - MAX_MISORDER {
            SeqResult::Resync
        } else {
            self.late += 1;
            return SeqResult::Late;
        };

        self.last_seq = seq;
        result
    }

    fn seed(&mut self, ssrc: RtpSsrc, seq: RtpSequenceNumber) {
        self.ssrc = Some(ssrc);
        self.last_seq = seq;
    }

    pub fn ssrc(&self) -> Option<RtpSsrc> {
        self.ssrc
    }

    /// Sequence number the next in-order packet should carry
    pub fn expected(&self) -> Option<RtpSequenceNumber> {
        self.ssrc.map(|_| self.last_seq.wrapping_add(1))
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn late(&self) -> u64 {
        self.late
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
