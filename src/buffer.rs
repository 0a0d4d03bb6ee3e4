//! Tri-region stream buffer.
//!
//! Every stream owns exactly one byte buffer, carved at open time into
//! three contiguous regions. The writer never reallocates:
//!
//! ```ignore
//! | sticky . . . | aperiodic . . | payload . . . . . . . . . . |
//!    |              |               |
//!    |              |               per-drain accumulating data,
//!    |              |               cleared by the drain
//!    |              scratch for building a nested group
//!    |              before commit
//!    single-copy declarations re-emitted in every drain
//! ```
//!
//! Each region is a self-terminated KLV chain; an empty region is a
//! single end marker.

use crate::klv::{align4, plant_end};

/// One of the three regions of a stream buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegionKind {
    Sticky,
    Aperiodic,
    Payload,
}

/// Byte bounds of one region within the stream buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Region {
    /// Byte offset of the region base within the stream buffer.
    pub start: usize,
    /// Fixed capacity in bytes.
    pub capacity: usize,
    /// Bytes in use, through the unpadded end of the last record.
    /// Advisory: appends recompute it by scanning for the terminator.
    pub used: usize,
}

impl Region {
    pub fn free(&self) -> usize {
        self.capacity - self.used.min(self.capacity)
    }

    /// Absolute end of the region within the stream buffer.
    pub fn end(&self) -> usize {
        self.start + self.capacity
    }
}

/// A stream's single allocation with its three carved regions.
#[derive(Debug)]
pub(crate) struct TriBuffer {
    pub buf: Vec<u8>,
    /// `false` when the buffer was supplied by the caller and has to
    /// be handed back on close.
    pub owned: bool,
    pub sticky: Region,
    pub aperiodic: Region,
    pub payload: Region,
}

impl TriBuffer {
    /// Carves `buf` into the three regions. `buf` must be larger than
    /// `sticky_cap + aperiodic_cap`; the payload region gets the rest.
    pub fn carve(mut buf: Vec<u8>, owned: bool, sticky_cap: usize, aperiodic_cap: usize) -> Self {
        buf.fill(0);
        let sticky = Region {
            start: 0,
            capacity: sticky_cap,
            used: 0,
        };
        let aperiodic = Region {
            start: sticky_cap,
            capacity: aperiodic_cap,
            used: 0,
        };
        let payload = Region {
            start: sticky_cap + aperiodic_cap,
            capacity: buf.len() - sticky_cap - aperiodic_cap,
            used: 0,
        };
        plant_end(&mut buf, sticky.start);
        plant_end(&mut buf, aperiodic.start);
        plant_end(&mut buf, payload.start);
        Self {
            buf,
            owned,
            sticky,
            aperiodic,
            payload,
        }
    }

    pub fn region(&self, kind: RegionKind) -> &Region {
        match kind {
            RegionKind::Sticky => &self.sticky,
            RegionKind::Aperiodic => &self.aperiodic,
            RegionKind::Payload => &self.payload,
        }
    }

    pub fn region_mut(&mut self, kind: RegionKind) -> &mut Region {
        match kind {
            RegionKind::Sticky => &mut self.sticky,
            RegionKind::Aperiodic => &mut self.aperiodic,
            RegionKind::Payload => &mut self.payload,
        }
    }

    /// Full-capacity view of a region.
    pub fn slice(&self, kind: RegionKind) -> &[u8] {
        let r = self.region(kind);
        &self.buf[r.start..r.end()]
    }

    /// Picks a scratch area at the tail of a region for pre-formatting
    /// a record of `required` bytes, or `None` if no region has the
    /// 2x headroom the tail carve needs (the caller then falls back to
    /// the shared workspace scratch).
    ///
    /// Sticky stores prefer the sticky tail so a full payload region
    /// cannot starve declarations.
    pub fn tail_scratch(&self, required: usize, sticky: bool) -> Option<(RegionKind, usize)> {
        if sticky && self.sticky.free() > required * 2 {
            let offset = self.sticky.end() - align4(required) - 8;
            return Some((RegionKind::Sticky, offset));
        }
        if self.payload.free() > required * 2 {
            let offset = self.payload.end() - align4(required) - 8;
            return Some((RegionKind::Payload, offset));
        }
        None
    }

    /// Hands the allocation back (for `stream_close` of a stream
    /// opened over a caller-supplied buffer).
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}
