//! GPMF KLV key FourCC.
//! See <https://github.com/gopro/gpmf-parser> for the key registry
//! GoPro cameras emit. Third-party devices are free to invent keys,
//! so this is an open set, not an enum.

use std::fmt::Display;

use binrw::{BinRead, BinWrite};

/// KLV record key. Four printable ASCII bytes,
/// stored raw (never byte-swapped).
///
/// The all-zero value is the reserved stream terminator
/// ([`FourCC::END`]) and is not a valid key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, BinRead, BinWrite)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Reserved end marker, a.k.a. `GPMF_KEY_END`.
    pub const END: FourCC = FourCC([0, 0, 0, 0]);
    /// Outer device nest.
    pub const DEVC: FourCC = FourCC(*b"DEVC");
    /// Device id, emitted as `L` (number) or `F` (key-like id).
    pub const DVID: FourCC = FourCC(*b"DVID");
    /// Device name (ASCII, up to 80 bytes).
    pub const DVNM: FourCC = FourCC(*b"DVNM");
    /// Inner stream nest.
    pub const STRM: FourCC = FourCC(*b"STRM");
    /// Stream name declaration.
    pub const STNM: FourCC = FourCC(*b"STNM");
    /// Dejittered microsecond start stamp of a drained stream.
    pub const STMP: FourCC = FourCC(*b"STMP");
    /// Per-write microsecond stamps (`STORE_ALL_TIMESTAMPS`).
    pub const STPS: FourCC = FourCC(*b"STPS");
    /// Millisecond tick of the device-local clock.
    pub const TICK: FourCC = FourCC(*b"TICK");
    /// Closing tick of an aperiodic group.
    pub const TOCK: FourCC = FourCC(*b"TOCK");
    /// Running total sample counter, synthesized sticky.
    pub const TSMP: FourCC = FourCC(*b"TSMP");
    /// Empty payload counter, synthesized sticky when a stream goes idle.
    pub const EMPT: FourCC = FourCC(*b"EMPT");
    /// Complex type descriptor declaration.
    pub const TYPE: FourCC = FourCC(*b"TYPE");
    /// Scale denominator declaration.
    pub const SCAL: FourCC = FourCC(*b"SCAL");
    /// SI unit declaration.
    pub const SIUN: FourCC = FourCC(*b"SIUN");
    /// Free-form unit declaration.
    pub const UNIT: FourCC = FourCC(*b"UNIT");
    /// Compression quantization declaration (intercepted, never stored).
    pub const QUAN: FourCC = FourCC(*b"QUAN");
    /// Pre-formatted GPMF pseudo-key: stores with this key re-multiplex
    /// an already-formed DEVC tree into synthetic sub-streams.
    pub const GPMF: FourCC = FourCC(*b"GPMF");

    pub fn from_slice(fourcc: &[u8]) -> Self {
        assert_eq!(fourcc.len(), 4, "FourCC must have size 4.");
        Self([fourcc[0], fourcc[1], fourcc[2], fourcc[3]])
    }

    pub fn from_u32(value: u32) -> Self {
        Self(value.to_be_bytes())
    }

    pub fn as_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// `true` if every byte is printable ASCII and the
    /// first byte is alphabetic. The end marker is not valid.
    pub fn is_valid(&self) -> bool {
        self.0[0].is_ascii_alphabetic()
            && self.0.iter().all(|b| (0x20..=0x7e).contains(b))
    }

    /// Key as a `str`, replacing non-printable bytes
    /// (for diagnostics only; keys are compared as bytes).
    pub fn to_str(&self) -> String {
        self.0
            .iter()
            .map(|b| match b.is_ascii_graphic() || *b == b' ' {
                true => *b as char,
                false => '.',
            })
            .collect()
    }
}

impl Display for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

impl From<&[u8; 4]> for FourCC {
    fn from(value: &[u8; 4]) -> Self {
        Self(*value)
    }
}

#[cfg(test)]
mod tests {
    use super::FourCC;

    #[test]
    fn validity() {
        assert!(FourCC(*b"ACCL").is_valid());
        assert!(FourCC(*b"a123").is_valid());
        assert!(!FourCC::END.is_valid());
        assert!(!FourCC(*b"1BCD").is_valid(), "first byte must be alphabetic");
        assert!(!FourCC([b'A', 0, b'C', b'D']).is_valid());
    }

    #[test]
    fn round_trip_u32() {
        let key = FourCC(*b"GYRO");
        assert_eq!(FourCC::from_u32(key.as_u32()), key);
    }
}
