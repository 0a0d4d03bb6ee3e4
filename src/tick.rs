//! Millisecond tick of the device-local clock.
//!
//! Stands in for the OS timer tick old GoPro firmware stamped
//! payloads with. The epoch is the first use within the process,
//! which keeps the value small and monotonic for the whole capture.

use std::time::Instant;

use once_cell::sync::Lazy;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds since the process-local epoch.
pub(crate) fn tick_ms() -> u32 {
    EPOCH.elapsed().as_millis() as u32
}
