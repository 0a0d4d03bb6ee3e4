//! KLV primitives: the eight-byte record header, the terminator-seeking
//! scan that keeps stream regions parseable, and the chunked size
//! encoding used for nest lengths in assembled output.
//!
//! ```ignore
//! | [K K K K] [T] [S] [R R] | data, padded to 4 bytes | ...
//!    |         |   |   |
//!    |         |   |   big-endian repeat count
//!    |         |   element size in bytes
//!    |         type code, 0 for nest
//!    FourCC key
//! ```

use std::io::Cursor;

use binrw::BinRead;
use log::warn;

use crate::FourCC;

/// Eight-byte KLV record header. Always big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(big)]
pub struct RecordHeader {
    /// FourCC key.
    pub key: FourCC,
    /// Sample type code (`SampleType` wire value; `0` for nest).
    pub type_code: u8,
    /// Element size in bytes.
    pub sample_size: u8,
    /// Repeat count.
    pub repeat: u16,
}

impl RecordHeader {
    pub fn new(key: FourCC, type_code: u8, sample_size: u8, repeat: u16) -> Self {
        Self {
            key,
            type_code,
            sample_size,
            repeat,
        }
    }

    /// Unpadded payload size in bytes.
    pub fn packed_size(&self) -> usize {
        self.sample_size as usize * self.repeat as usize
    }

    /// Payload size padded up to the 4-byte boundary.
    pub fn data_size(&self) -> usize {
        align4(self.packed_size())
    }

    /// Full record size: header plus padded payload.
    pub fn record_size(&self) -> usize {
        8 + self.data_size()
    }

    /// Reads the header at byte offset `pos`, or `None` if eight
    /// bytes are not available there.
    pub(crate) fn peek(buf: &[u8], pos: usize) -> Option<Self> {
        let bytes = buf.get(pos..pos + 8)?;
        let mut cursor = Cursor::new(bytes);
        Self::read(&mut cursor).ok()
    }

    /// Wire form of the header.
    pub(crate) fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0_u8; 8];
        bytes[0..4].copy_from_slice(&self.key.0);
        bytes[4] = self.type_code;
        bytes[5] = self.sample_size;
        bytes[6..8].copy_from_slice(&self.repeat.to_be_bytes());
        bytes
    }

    /// Writes the header at byte offset `pos`.
    pub(crate) fn store(&self, buf: &mut [u8], pos: usize) {
        buf[pos..pos + 8].copy_from_slice(&self.to_bytes());
    }
}

/// Rounds `n` up to a multiple of four.
#[inline]
pub(crate) fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Key at byte offset `pos`. Caller guarantees `pos + 4` is in bounds.
#[inline]
pub(crate) fn key_at(buf: &[u8], pos: usize) -> FourCC {
    FourCC([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

/// Plants the end marker at byte offset `pos` if it fits.
#[inline]
pub(crate) fn plant_end(buf: &mut [u8], pos: usize) {
    if pos + 4 <= buf.len() {
        buf[pos..pos + 4].copy_from_slice(&FourCC::END.0);
    }
}

#[inline]
pub(crate) fn read_u32_be(buf: &[u8], pos: usize) -> u32 {
    u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

#[inline]
pub(crate) fn write_u32_be(buf: &mut [u8], pos: usize, value: u32) {
    buf[pos..pos + 4].copy_from_slice(&value.to_be_bytes());
}

/// Walks a region from its base and returns the number of used bytes,
/// i.e. the unpadded end of the last record before the terminator.
///
/// The walk is self-healing: a damaged chain (invalid key, zero or
/// overrunning advance) is truncated by re-planting the terminator at
/// the last record boundary, so an interrupted append can never poison
/// later appends or drains. Appends recompute their write position with
/// this scan rather than trusting a mirrored size variable.
pub(crate) fn seek_end(region: &mut [u8]) -> usize {
    let cap = region.len();
    let mut pos = 0_usize;

    while pos + 8 <= cap {
        if region[pos..pos + 4] == FourCC::END.0 {
            return pos;
        }
        let hdr = match RecordHeader::peek(region, pos) {
            Some(hdr) => hdr,
            None => break,
        };
        if !hdr.key.is_valid() {
            warn!("seek_end: invalid key at offset {pos}, truncating region");
            break;
        }
        let advance = hdr.record_size();
        // the next key word has to fit as well
        if pos + advance + 4 > cap {
            break;
        }
        if region[pos + advance..pos + advance + 4] == FourCC::END.0 {
            return pos + 8 + hdr.packed_size();
        }
        pos += advance;
    }

    // Truncate at the last known-good record boundary.
    plant_end(region, pos);
    pos
}

/// Chunked nest size: smallest power-of-two chunk size such that the
/// chunk count stays within the 16-bit repeat field.
pub(crate) fn chunk_size(size: u32) -> u32 {
    let mut chunksize = 1_u32;
    let mut chunks = size;

    while chunks >= 65536 {
        chunksize <<= 1;
        chunks = (size + chunksize - 1) / chunksize;
    }

    chunksize
}

/// `(chunk_size, chunk_count)` encoding for a nest of `bytes` bytes,
/// with `chunk_size * chunk_count >= bytes`.
pub(crate) fn chunk_encode(bytes: u32) -> (u32, u32) {
    let chunksize = chunk_size(bytes);
    let chunks = (bytes + chunksize - 1) / chunksize;
    (chunksize, chunks)
}
