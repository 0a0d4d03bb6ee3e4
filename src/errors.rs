//! Writer errors, mirroring the wire-visible error codes
//! of the GPMF metadata service.

use std::fmt;

/// GPMF write/format errors.
///
/// Every fallible call returns one of these instead of panicking.
/// The numeric codes are stable and wire-visible
/// (`0` is success, i.e. `Ok(())`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpmfError {
    /// Null/closed stream handle, i.e. a caller bug.
    Device,
    /// A region (or the offered output buffer) is too small.
    /// The offered record is dropped intact, older data is preserved.
    /// Callers may drain and retry.
    Memory,
    /// The sticky region is too small for another declaration.
    StickyMemory,
    /// Drain found nothing to emit. Payload pointers are left empty.
    EmptyData,
    /// A complex-type descriptor does not match the declared
    /// sample size. Returned before any buffer mutation.
    Structure,
}

impl GpmfError {
    /// Stable numeric error code (`GPMF_ERROR_*`).
    /// Success (`0`) has no variant; it is `Ok(())`.
    pub fn code(&self) -> u32 {
        match self {
            GpmfError::Device => 1,
            GpmfError::Memory => 2,
            GpmfError::StickyMemory => 3,
            GpmfError::EmptyData => 4,
            GpmfError::Structure => 5,
        }
    }
}

impl std::error::Error for GpmfError {}

impl fmt::Display for GpmfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpmfError::Device => write!(f, "Invalid or closed stream handle"),
            GpmfError::Memory => write!(f, "Buffer region too small, record dropped"),
            GpmfError::StickyMemory => write!(f, "Sticky region too small, declaration dropped"),
            GpmfError::EmptyData => write!(f, "No payload data to drain"),
            GpmfError::Structure => write!(f, "Complex type descriptor does not match sample size"),
        }
    }
}

/// Converts GpmfError to std::io::Error
/// for callers muxing payloads straight into a file.
impl From<GpmfError> for std::io::Error {
    fn from(err: GpmfError) -> Self {
        std::io::Error::new(std::io::ErrorKind::Other, err)
    }
}
