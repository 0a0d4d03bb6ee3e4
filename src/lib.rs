//! Writer for the GPMF key-length-value (KLV) telemetry container.
//! Formats multiplexed sensor streams (IMU, GPS, camera settings,
//! computer-vision results) into self-describing big-endian payloads
//! ready to mux as a timed metadata track of an MP4/MOV. Does not and
//! will not read MP4 files or decode video; pair with an MP4 muxer for
//! that.
//!
//! Producers each open a stream and push typed samples; a consumer
//! thread periodically drains one assembled `DEVC`/`STRM` tree per
//! channel. Everything is fixed-allocation after open and safe to call
//! from parallel sensor threads.
//!
//! ```rs
//! use gpmfwrite::{Channel, FourCC, GpmfWriter, SampleType, StoreFlags};
//!
//! let writer = GpmfWriter::new();
//! let imu = writer.stream_open(Channel::Timed, Some(1), "MyCamera", None, 8192)?;
//!
//! // declarations are sticky: stored once, re-emitted in every payload
//! imu.store(FourCC(*b"STNM"), SampleType::Ascii, 1, 5, b"Accel", StoreFlags::STICKY)?;
//!
//! // in a sensor thread
//! let xyz: [i16; 3] = [10, -20, 30];
//! let bytes: Vec<u8> = xyz.iter().flat_map(|v| v.to_ne_bytes()).collect();
//! imu.store(FourCC(*b"ACCL"), SampleType::SignedShort, 6, 1, &bytes, StoreFlags::NONE)?;
//!
//! // in the muxing thread
//! let mut out = vec![0_u8; 16384];
//! let payload = writer.get_payload(Channel::Timed, &mut out)?;
//! ```

pub mod consts;
pub mod errors;
pub mod fourcc;
pub mod klv;
pub mod stream;
pub mod types;
pub mod validate;
pub mod writer;
pub mod tests;

// Internal machinery
pub(crate) mod append;
pub(crate) mod buffer;
pub(crate) mod compress;
pub(crate) mod drain;
pub(crate) mod remux;
pub(crate) mod tick;

pub use consts::{DEVICE_ID_CAMERA, DEVICE_ID_PREFORMATTED};
pub use errors::GpmfError;
pub use fourcc::FourCC;
pub use klv::RecordHeader;
pub use stream::{Channel, StoreFlags, StreamHandle};
pub use types::{utc_date_time_bytes, SampleType};
pub use validate::is_valid_gpmf;
pub use writer::GpmfWriter;
