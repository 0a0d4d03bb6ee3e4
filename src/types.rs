//! GPMF sample types: the single-character type codes carried in every
//! KLV header, their element sizes and their byte-swap behavior.

use time::PrimitiveDateTime;

/// GPMF sample type code, as stored in byte 4 of a KLV header.
///
/// The discriminants are the wire values. `Nest` is the reserved `0`
/// type whose payload is a sequence of child KLV records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SampleType {
    /// ASCII character string, not NUL-terminated.
    Ascii = b'c',
    SignedByte = b'b',
    UnsignedByte = b'B',
    SignedShort = b's',
    UnsignedShort = b'S',
    Float = b'f',
    /// Raw four-character key, never swapped.
    FourCC = b'F',
    SignedLong = b'l',
    UnsignedLong = b'L',
    /// Q15.16 fixed point.
    Q15_16 = b'q',
    /// Q31.32 fixed point.
    Q31_32 = b'Q',
    Double = b'd',
    Signed64 = b'j',
    Unsigned64 = b'J',
    /// 128-bit id, stored verbatim.
    Guid = b'G',
    /// 16-byte ASCII date `yymmddhhmmss.sss`, stored verbatim.
    UtcDateTime = b'U',
    /// Huffman-compressed record produced by the drain-time compressor.
    Compressed = b'#',
    /// Structure described by a sibling `TYPE` descriptor.
    Complex = b'?',
    /// Nested sequence of child KLV records.
    Nest = 0,
}

impl SampleType {
    pub fn from_u8(value: u8) -> Option<Self> {
        let t = match value {
            b'c' => Self::Ascii,
            b'b' => Self::SignedByte,
            b'B' => Self::UnsignedByte,
            b's' => Self::SignedShort,
            b'S' => Self::UnsignedShort,
            b'f' => Self::Float,
            b'F' => Self::FourCC,
            b'l' => Self::SignedLong,
            b'L' => Self::UnsignedLong,
            b'q' => Self::Q15_16,
            b'Q' => Self::Q31_32,
            b'd' => Self::Double,
            b'j' => Self::Signed64,
            b'J' => Self::Unsigned64,
            b'G' => Self::Guid,
            b'U' => Self::UtcDateTime,
            b'#' => Self::Compressed,
            b'?' => Self::Complex,
            0 => Self::Nest,
            _ => return None,
        };
        Some(t)
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Element size in bytes, or `None` for types that are not
    /// directly sizeable (`Complex`, `Nest`).
    pub fn size(&self) -> Option<usize> {
        let ssize = match self {
            Self::Ascii | Self::SignedByte | Self::UnsignedByte | Self::Compressed => 1,
            Self::SignedShort | Self::UnsignedShort => 2,
            Self::Float | Self::FourCC | Self::SignedLong | Self::UnsignedLong | Self::Q15_16 => 4,
            Self::Q31_32 | Self::Double | Self::Signed64 | Self::Unsigned64 => 8,
            Self::Guid | Self::UtcDateTime => 16,
            Self::Complex | Self::Nest => return None,
        };
        Some(ssize)
    }

    /// Byte-swap unit applied when converting native little-endian
    /// input to the big-endian wire form.
    pub(crate) fn swap_unit(&self) -> SwapUnit {
        match self {
            Self::Ascii | Self::SignedByte | Self::UnsignedByte => SwapUnit::Verbatim,
            Self::SignedShort | Self::UnsignedShort => SwapUnit::Swap16,
            Self::Float | Self::SignedLong | Self::UnsignedLong | Self::Q15_16 => SwapUnit::Swap32,
            Self::Q31_32 | Self::Double | Self::Signed64 | Self::Unsigned64 => SwapUnit::Swap64,
            // FourCC values are raw four-byte ASCII, never swapped.
            Self::FourCC => SwapUnit::Verbatim,
            Self::Guid | Self::UtcDateTime => SwapUnit::Verbatim,
            // Complex swaps per the expanded TYPE descriptor;
            // everything else unknown is stored as is.
            Self::Complex => SwapUnit::Descriptor,
            Self::Compressed | Self::Nest => SwapUnit::Verbatim,
        }
    }
}

/// How a type's elements are converted to the big-endian wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SwapUnit {
    /// Copy as is.
    Verbatim,
    /// Swap every 2 bytes.
    Swap16,
    /// Swap every 4 bytes.
    Swap32,
    /// Swap every 8 bytes.
    Swap64,
    /// Swap field by field per the expanded complex descriptor.
    Descriptor,
}

impl SwapUnit {
    /// In-place little-to-big-endian conversion over `buf`.
    /// `buf` length need not be a multiple of the unit;
    /// a trailing partial element is left as is.
    pub(crate) fn swap_in_place(&self, buf: &mut [u8]) {
        match self {
            SwapUnit::Verbatim | SwapUnit::Descriptor => (),
            SwapUnit::Swap16 => {
                for pair in buf.chunks_exact_mut(2) {
                    pair.swap(0, 1);
                }
            }
            SwapUnit::Swap32 => {
                for quad in buf.chunks_exact_mut(4) {
                    quad.reverse();
                }
            }
            SwapUnit::Swap64 => {
                for oct in buf.chunks_exact_mut(8) {
                    oct.reverse();
                }
            }
        }
    }
}

/// Formats a date as the 16-byte payload of a `U` (UTC date time)
/// record, `yymmddhhmmss.sss`.
pub fn utc_date_time_bytes(dt: &PrimitiveDateTime) -> [u8; 16] {
    let text = format!(
        "{:02}{:02}{:02}{:02}{:02}{:02}.{:03}",
        dt.year().rem_euclid(100),
        dt.month() as u8,
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second(),
        dt.millisecond(),
    );
    let mut out = [0_u8; 16];
    out.copy_from_slice(&text.as_bytes()[..16]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::{Date, Month};

    #[test]
    fn sizes_match_wire_table() {
        assert_eq!(SampleType::Ascii.size(), Some(1));
        assert_eq!(SampleType::SignedShort.size(), Some(2));
        assert_eq!(SampleType::Float.size(), Some(4));
        assert_eq!(SampleType::Double.size(), Some(8));
        assert_eq!(SampleType::Guid.size(), Some(16));
        assert_eq!(SampleType::Nest.size(), None);
        assert_eq!(SampleType::Complex.size(), None);
    }

    #[test]
    fn fourcc_payloads_never_swap() {
        assert_eq!(SampleType::FourCC.swap_unit(), SwapUnit::Verbatim);
        assert_eq!(SampleType::Guid.swap_unit(), SwapUnit::Verbatim);
    }

    #[test]
    fn swap_in_place_units() {
        let mut buf = [1_u8, 2, 3, 4];
        SwapUnit::Swap16.swap_in_place(&mut buf);
        assert_eq!(buf, [2, 1, 4, 3]);

        let mut buf = [1_u8, 2, 3, 4];
        SwapUnit::Swap32.swap_in_place(&mut buf);
        assert_eq!(buf, [4, 3, 2, 1]);

        let mut buf = [1_u8, 2, 3, 4, 5, 6, 7, 8];
        SwapUnit::Swap64.swap_in_place(&mut buf);
        assert_eq!(buf, [8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn utc_date_time_layout() {
        let dt = Date::from_calendar_date(2017, Month::March, 9)
            .unwrap()
            .with_hms_milli(14, 5, 59, 123)
            .unwrap();
        assert_eq!(&utc_date_time_bytes(&dt), b"170309140559.123");
    }
}
