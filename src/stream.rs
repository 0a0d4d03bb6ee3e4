//! Metadata streams: per-sensor state, the store pre-formatter that
//! turns native-endian samples into wire-form KLV, and the aperiodic
//! (deferred-commit) group calls.
//!
//! A stream is owned jointly by one producer call site and the drain
//! thread; its lock serializes the two. Producers pre-build samples
//! outside the lock and must not hold it across sensor I/O, so
//! `store` copies.

use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::append::{append_formatted, Src};
use crate::buffer::TriBuffer;
use crate::consts::{DEVICE_ID_CAMERA, DEVICE_ID_PREFORMATTED, LOCAL_SCRATCH_SIZE};
use crate::errors::GpmfError;
use crate::klv::{align4, key_at, plant_end, write_u32_be, RecordHeader};
use crate::tick::tick_ms;
use crate::types::{SampleType, SwapUnit};
use crate::writer::Workspace;
use crate::{remux, FourCC};

/// Metadata channel a stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Time-changing telemetry destined for an MP4/MOV track.
    Timed = 0,
    /// Global settings that do not change with time (video mode etc.).
    Settings = 1,
}

impl Channel {
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Storage flags for [`StreamHandle::store`].
///
/// Combine with `|`. The numeric values are the wire-visible
/// `GPMF_FLAGS_*` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreFlags(u32);

impl StoreFlags {
    pub const NONE: StoreFlags = StoreFlags(0);
    /// Re-emit in every payload; updates replace the cached copy.
    pub const STICKY: StoreFlags = StoreFlags(1);
    /// Input is already big-endian (e.g. replayed pre-formatted data).
    pub const BIG_ENDIAN: StoreFlags = StoreFlags(2);
    /// Samples that share a moment in time; never coalesced by key.
    pub const GROUPED: StoreFlags = StoreFlags(4);
    /// Sticky only: 32-bit big-endian add into the cached copy.
    pub const ACCUMULATE: StoreFlags = StoreFlags(8);
    /// `STICKY | ACCUMULATE`.
    pub const STICKY_ACCUMULATE: StoreFlags = StoreFlags(9);
    /// Route to the aperiodic region (used by the aperiodic calls).
    pub const APERIODIC: StoreFlags = StoreFlags(16);
    /// Do not advance the total-sample counter.
    pub const DONT_COUNT: StoreFlags = StoreFlags(32);
    /// Keep samples sorted ascending by their first field.
    pub const SORTED: StoreFlags = StoreFlags(64);
    /// Also store the raw microsecond stamp of every write (`STPS`).
    pub const STORE_ALL_TIMESTAMPS: StoreFlags = StoreFlags(128);
    /// Seed a `TICK` sticky from the platform tick on first use,
    /// emulating old style tick-stamped metadata.
    pub const ADD_TICK: StoreFlags = StoreFlags(256);

    pub fn contains(&self, other: StoreFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for StoreFlags {
    type Output = StoreFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        StoreFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for StoreFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Everything behind a stream's lock.
#[derive(Debug)]
pub(crate) struct StreamInner {
    pub tri: TriBuffer,
    pub closed: bool,
    pub device_name: String,
    /// Earliest producer tick in the current payload, device-local clock.
    pub payload_tick: u32,
    /// Downsampler phase, persisted across drains.
    pub session_scale_count: u32,
    /// Remembered for synthesizing the empty-payload marker when the
    /// stream goes idle. `END` when nothing non-sticky was stored yet.
    pub last_nonsticky_key: FourCC,
    pub last_nonsticky_type: u8,
    pub last_nonsticky_size: u8,
    /// Expanded complex `TYPE` descriptor (`T[N]` already unrolled).
    pub complex_type: Vec<u8>,
    /// Compression quantization factor; `0` disables.
    pub quantize: u32,
    /// Bounded microsecond stamp log; overflow drops the newest.
    pub timestamps: Vec<u64>,
}

/// One opened metadata stream. Registered in its channel's device
/// list, which stays sorted by ascending `device_id` so records that
/// share a device group naturally in the output.
#[derive(Debug)]
pub(crate) struct DeviceStream {
    pub channel: Channel,
    pub device_id: u32,
    pub inner: Mutex<StreamInner>,
}

/// Cheaply clonable producer handle to an open stream.
///
/// Clones can be moved into sensor threads; all calls lock internally
/// and copy, so the lock is never held across sensor I/O.
#[derive(Clone)]
pub struct StreamHandle {
    pub(crate) ws: Arc<Workspace>,
    pub(crate) stream: Arc<DeviceStream>,
}

impl StreamHandle {
    pub fn channel(&self) -> Channel {
        self.stream.channel
    }

    pub fn device_id(&self) -> u32 {
        self.stream.device_id
    }

    /// Formats and stores raw sensor data.
    ///
    /// `sample_size` is the byte size of one sample (a gyro `x,y,z`
    /// triple of `i16` is one 6-byte sample), `sample_count` the number
    /// of samples in `data`. `data` holds native-endian bytes unless
    /// [`StoreFlags::BIG_ENDIAN`] says it is pre-swapped.
    pub fn store(
        &self,
        key: FourCC,
        sample_type: SampleType,
        sample_size: u32,
        sample_count: u32,
        data: &[u8],
        flags: StoreFlags,
    ) -> Result<(), GpmfError> {
        self.store_raw(
            key,
            sample_type.as_u8(),
            sample_size,
            sample_count,
            data,
            flags,
            0,
        )
    }

    /// [`store`](Self::store) with a microsecond stamp of the first
    /// sample in the write, for sensors that need more timing precision
    /// than the payload tick gives (the need is rare). All stamps of a
    /// capture must come from a single clock.
    pub fn store_stamped(
        &self,
        key: FourCC,
        sample_type: SampleType,
        sample_size: u32,
        sample_count: u32,
        data: &[u8],
        flags: StoreFlags,
        timestamp_us: u64,
    ) -> Result<(), GpmfError> {
        self.store_raw(
            key,
            sample_type.as_u8(),
            sample_size,
            sample_count,
            data,
            flags,
            timestamp_us,
        )
    }

    /// Store with a raw wire type code; also the replay path for
    /// re-multiplexed pre-formatted data whose codes may be unknown.
    pub(crate) fn store_raw(
        &self,
        key: FourCC,
        type_code: u8,
        sample_size: u32,
        sample_count: u32,
        data: &[u8],
        flags: StoreFlags,
        timestamp_us: u64,
    ) -> Result<(), GpmfError> {
        // A pre-formatted DEVC tree is not stored here; it is parsed
        // and re-dispatched into synthetic sub-streams.
        if key == FourCC::GPMF {
            let len = (sample_size as usize * sample_count as usize).min(data.len());
            remux::sync_external(&self.ws, &self.stream, &data[..len]);
            return Ok(());
        }

        let dm = &*self.stream;
        let mut inner = dm.inner.lock();
        if inner.closed {
            return Err(GpmfError::Device);
        }

        if timestamp_us == 0 && flags.contains(StoreFlags::ADD_TICK) {
            self.seed_tick(dm, &mut inner, flags);
        }

        let packed = sample_size as usize * sample_count as usize;
        if data.len() < packed {
            return Err(GpmfError::Memory);
        }
        let required = packed + 12;

        if flags.contains(StoreFlags::STICKY) {
            if key == FourCC::QUAN {
                // quantize factor for the drain-time compressor,
                // kept as state instead of a record
                if data.len() >= 4 {
                    inner.quantize = u32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
                }
                return Ok(());
            }
            if inner.tri.sticky.used + required > inner.tri.sticky.capacity {
                return Err(GpmfError::Memory);
            }
        } else if inner.tri.payload.used + required > inner.tri.payload.capacity {
            return Err(GpmfError::Memory);
        }

        if key == FourCC::TYPE {
            // remember the expanded descriptor to drive per-field
            // byte swapping of complex samples
            inner.complex_type = expand_complex_type(&data[..packed]);
        }

        // Pre-format into scratch, then hand off to the append engine.
        if required <= LOCAL_SCRATCH_SIZE {
            let mut local = [0_u8; LOCAL_SCRATCH_SIZE];
            let blen = format_record(
                &mut local,
                key,
                type_code,
                sample_size,
                sample_count,
                data,
                flags,
                &inner.complex_type,
            )?;
            append_formatted(
                dm,
                &mut inner,
                Src::Ext(&local[..blen]),
                blen,
                flags,
                sample_count,
                timestamp_us,
            );
        } else if let Some((_, offset)) =
            inner.tri.tail_scratch(required, flags.contains(StoreFlags::STICKY))
        {
            // format at the tail of a region with 2x headroom; the
            // append engine splices from there with overlapping moves
            let blen = {
                let StreamInner {
                    tri, complex_type, ..
                } = &mut *inner;
                format_record(
                    &mut tri.buf[offset..offset + 8 + align4(packed)],
                    key,
                    type_code,
                    sample_size,
                    sample_count,
                    data,
                    flags,
                    complex_type,
                )?
            };
            append_formatted(
                dm,
                &mut inner,
                Src::Tail(offset),
                blen,
                flags,
                sample_count,
                timestamp_us,
            );
        } else {
            // last resort: the shared workspace scratch, held only for
            // the duration of this one append
            let mut scratch = self.ws.scratch.lock();
            if scratch.len() < required {
                return Err(GpmfError::Memory);
            }
            let blen = format_record(
                &mut scratch,
                key,
                type_code,
                sample_size,
                sample_count,
                data,
                flags,
                &inner.complex_type,
            )?;
            append_formatted(
                dm,
                &mut inner,
                Src::Ext(&scratch[..blen]),
                blen,
                flags,
                sample_count,
                timestamp_us,
            );
        }

        Ok(())
    }

    /// `ADD_TICK` seeding. Non-sticky stores on the camera device plant
    /// the payload tick once per payload; sticky stores into an empty
    /// sticky region plant a zero placeholder so `TICK` precedes `SCAL`
    /// (desktop Quik cannot handle it the other way around).
    fn seed_tick(&self, dm: &DeviceStream, inner: &mut StreamInner, flags: StoreFlags) {
        if dm.device_id != DEVICE_ID_CAMERA || dm.channel == Channel::Settings {
            return;
        }
        if !flags.contains(StoreFlags::STICKY) && !flags.contains(StoreFlags::BIG_ENDIAN) {
            if inner.payload_tick == 0 {
                let tick = tick_ms();
                inner.payload_tick = tick;
                let rec = tick_record(FourCC::TICK, tick);
                append_formatted(dm, inner, Src::Ext(&rec), 12, StoreFlags::STICKY, 1, 0);
            }
        } else if flags.contains(StoreFlags::STICKY) && inner.tri.sticky.used == 0 {
            let rec = tick_record(FourCC::TICK, 0);
            append_formatted(dm, inner, Src::Ext(&rec), 12, StoreFlags::STICKY, 1, 0);
        }
    }

    /// Clears stale capture data: payload and aperiodic regions, the
    /// timestamp log, and the accumulator payloads (`TSMP`, `EMPT`)
    /// inside sticky. Declarations (type, units, scale, name) survive.
    pub fn reset(&self) {
        {
            let mut inner = self.stream.inner.lock();
            if inner.closed {
                return;
            }

            inner.tri.payload.used = 0;
            let payload_start = inner.tri.payload.start;
            plant_end(&mut inner.tri.buf, payload_start);

            // zero accumulators, keep declarations
            let sticky = inner.tri.sticky;
            let mut pos = sticky.start;
            while pos + 8 <= sticky.start + sticky.used.min(sticky.capacity) {
                let Some(hdr) = RecordHeader::peek(&inner.tri.buf, pos) else {
                    break;
                };
                if !hdr.key.is_valid() {
                    break;
                }
                if hdr.key == FourCC::TSMP || hdr.key == FourCC::EMPT {
                    write_u32_be(&mut inner.tri.buf, pos + 8, 0);
                }
                pos += hdr.record_size();
            }

            inner.tri.aperiodic.used = 0;
            let aperiodic_start = inner.tri.aperiodic.start;
            plant_end(&mut inner.tri.buf, aperiodic_start);

            inner.timestamps.clear();
        }

        if self.stream.device_id == DEVICE_ID_PREFORMATTED {
            for sub in self.ws.external_streams(self.stream.channel) {
                StreamHandle {
                    ws: Arc::clone(&self.ws),
                    stream: sub,
                }
                .reset();
            }
        }
    }

    /// Opens a nested group in the aperiodic region so multiple entries
    /// represent one moment in time (e.g. n detected objects in one
    /// frame). Call before time-consuming computation begins; the
    /// planted `TICK`/`TOCK` pair records when the moment occurred.
    pub fn aperiodic_begin(&self, _key: FourCC) -> Result<(), GpmfError> {
        let tick = tick_ms().to_ne_bytes();
        let flags = StoreFlags::APERIODIC | StoreFlags::DONT_COUNT;
        self.store(FourCC::TICK, SampleType::UnsignedLong, 4, 1, &tick, flags)?;
        self.store(FourCC::TOCK, SampleType::UnsignedLong, 4, 1, &tick, flags)
    }

    /// Stores into the open aperiodic group.
    pub fn aperiodic_store(
        &self,
        key: FourCC,
        sample_type: SampleType,
        sample_size: u32,
        sample_count: u32,
        data: &[u8],
    ) -> Result<(), GpmfError> {
        self.store(
            key,
            sample_type,
            sample_size,
            sample_count,
            data,
            StoreFlags::APERIODIC,
        )
    }

    /// Closes the group: refreshes `TOCK` with the current tick, then
    /// commits the whole aperiodic region to the payload as a single
    /// nested record and clears it. An empty group still commits; no
    /// detections is a detection.
    pub fn aperiodic_end(&self, key: FourCC) -> Result<(), GpmfError> {
        let tick = tick_ms();
        let dm = &*self.stream;
        let mut inner = dm.inner.lock();
        if inner.closed {
            return Err(GpmfError::Device);
        }

        let aper = inner.tri.aperiodic;
        if aper.used >= 24 && key_at(&inner.tri.buf, aper.start + 12) == FourCC::TOCK {
            write_u32_be(&mut inner.tri.buf, aper.start + 20, tick);
        }

        let used = aper.used;
        let mut local = [0_u8; LOCAL_SCRATCH_SIZE];
        let blen = {
            let StreamInner {
                tri, complex_type, ..
            } = &*inner;
            let data = &tri.buf[aper.start..aper.start + used];
            format_record(
                &mut local,
                key,
                0,
                1,
                used as u32,
                data,
                StoreFlags::BIG_ENDIAN,
                complex_type,
            )?
        };
        append_formatted(
            dm,
            &mut inner,
            Src::Ext(&local[..blen]),
            blen,
            StoreFlags::BIG_ENDIAN | StoreFlags::DONT_COUNT,
            used as u32,
            0,
        );

        inner.tri.aperiodic.used = 0;
        let aperiodic_start = inner.tri.aperiodic.start;
        plant_end(&mut inner.tri.buf, aperiodic_start);
        Ok(())
    }
}

fn tick_record(key: FourCC, tick: u32) -> [u8; 12] {
    let mut rec = [0_u8; 12];
    rec[0..8].copy_from_slice(&RecordHeader::new(key, b'L', 4, 1).to_bytes());
    rec[8..12].copy_from_slice(&tick.to_be_bytes());
    rec
}

/// Builds the wire form of one record into `dst`: big-endian header,
/// then the payload converted from native endianness (unless the input
/// is pre-swapped). Returns the unpadded byte length, header included.
///
/// Nests of non-aligned size are re-declared as 4-byte elements so nest
/// sizes stay aligned.
#[allow(clippy::too_many_arguments)]
pub(crate) fn format_record(
    dst: &mut [u8],
    key: FourCC,
    type_code: u8,
    sample_size: u32,
    sample_count: u32,
    data: &[u8],
    flags: StoreFlags,
    complex_type: &[u8],
) -> Result<usize, GpmfError> {
    let packed = sample_size as usize * sample_count as usize;

    let hdr = if type_code == 0 && packed % 4 != 0 {
        RecordHeader::new(key, 0, 4, (packed.div_ceil(4)) as u16)
    } else {
        RecordHeader::new(key, type_code, sample_size as u8, sample_count as u16)
    };
    dst[0..8].copy_from_slice(&hdr.to_bytes());
    dst[8..8 + packed].copy_from_slice(&data[..packed]);

    if !flags.contains(StoreFlags::BIG_ENDIAN) {
        let unit = SampleType::from_u8(type_code)
            .map(|t| t.swap_unit())
            .unwrap_or(SwapUnit::Verbatim);
        match unit {
            SwapUnit::Descriptor => {
                if !complex_type.is_empty() {
                    swap_complex(&mut dst[8..8 + packed], sample_size as usize, complex_type)?;
                }
                // no descriptor declared: stored as offered
            }
            unit => unit.swap_in_place(&mut dst[8..8 + packed]),
        }
    }

    Ok(8 + packed)
}

/// Field-wise endian swap of complex samples, driven by the expanded
/// descriptor. Every sample must consume the descriptor exactly.
fn swap_complex(
    payload: &mut [u8],
    sample_size: usize,
    complex_type: &[u8],
) -> Result<(), GpmfError> {
    let mut off = 0;
    while off < payload.len() {
        let mut consumed = 0_usize;
        for &code in complex_type {
            let field = SampleType::from_u8(code).ok_or(GpmfError::Structure)?;
            let fsize = field.size().ok_or(GpmfError::Structure)?;
            if consumed + fsize > sample_size || off + consumed + fsize > payload.len() {
                return Err(GpmfError::Structure);
            }
            field
                .swap_unit()
                .swap_in_place(&mut payload[off + consumed..off + consumed + fsize]);
            consumed += fsize;
        }
        if consumed != sample_size {
            return Err(GpmfError::Structure);
        }
        off += sample_size;
    }
    Ok(())
}

/// Expands a complex `TYPE` descriptor, unrolling array notation:
/// `"LB[6]"` becomes `"LBBBBBB"`. Returns an empty descriptor for a
/// malformed or oversized structure.
pub(crate) fn expand_complex_type(src: &[u8]) -> Vec<u8> {
    // one sample may not exceed 255 bytes, so neither may its shape
    const MAX: usize = 255;
    let mut dst = Vec::new();
    let mut i = 0;

    while i < src.len() {
        let c = src[i];
        if c == 0 {
            break;
        }
        if c == b'[' && i > 0 {
            let mut j = i + 1;
            let mut count = 0_usize;
            while j < src.len() && src[j].is_ascii_digit() {
                count = count * 10 + (src[j] - b'0') as usize;
                j += 1;
            }
            if count > 1 {
                let prev = src[i - 1];
                for _ in 1..count {
                    dst.push(prev);
                    if dst.len() > MAX {
                        return Vec::new();
                    }
                }
            }
            i = j;
            if i < src.len() && src[i] == b']' {
                i += 1;
            }
        } else {
            dst.push(c);
            if dst.len() > MAX {
                return Vec::new();
            }
            i += 1;
        }
    }

    dst
}
