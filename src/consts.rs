//! Fixed sizes and reserved ids of the writer service.
//!
//! The region reservations trade RAM against how much sticky/aperiodic
//! metadata a stream may declare; they are compile-time constants and the
//! writer never grows a buffer after `stream_open`.

/// Primary camera device id. Internal sensor streams should share it
/// so their `STRM`s group under one `DEVC`.
pub const DEVICE_ID_CAMERA: u32 = 1;

/// Device id of the stream that re-multiplexes externally
/// pre-formatted GPMF payloads. Rare.
pub const DEVICE_ID_PREFORMATTED: u32 = 0xFFFFFFFF;

/// Maximum number of external pre-formatted sub-streams per channel.
pub const EXT_PREFORMATTED_STREAMS: usize = 4;

/// Timestamps logged per payload (typically drained at 1Hz).
/// Overflow drops the newest stamps.
pub const MAX_TIMESTAMPS: usize = 50;

/// Sticky reservation for a timed stream. Can be increased if needed.
pub const STICKY_PAYLOAD_SIZE: usize = 256;
/// Aperiodic (deferred-commit) reservation for a timed stream.
pub const APERIODIC_PAYLOAD_SIZE: usize = 256;

/// Sticky reservation for the settings channel; global settings
/// are almost entirely sticky data.
pub const GLOBAL_STICKY_PAYLOAD_SIZE: usize = 1024;
/// Aperiodic reservation for the settings channel; barely used there.
pub const GLOBAL_APERIODIC_PAYLOAD_SIZE: usize = 32;

/// Bytes of a timed stream buffer consumed by the sticky and
/// aperiodic reservations. The payload region gets the rest.
pub const OVERHEAD: usize = STICKY_PAYLOAD_SIZE + APERIODIC_PAYLOAD_SIZE;

/// Same, for the settings channel.
pub const GLOBAL_OVERHEAD: usize = GLOBAL_STICKY_PAYLOAD_SIZE + GLOBAL_APERIODIC_PAYLOAD_SIZE;

/// Largest record pre-formatted on the stack; bigger records
/// borrow scratch from a region tail or the workspace.
pub(crate) const LOCAL_SCRATCH_SIZE: usize = 512;
