//! The writer service: per-channel registries of open streams, the
//! shared scratch buffer, and stream open/close.
//!
//! Lock ordering is channel before stream, never the reverse.
//! Producers only ever take their own stream lock (plus, rarely, the
//! scratch lock under it); the drain takes the channel lock for the
//! whole walk and each stream lock briefly.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::TriBuffer;
use crate::consts::{
    APERIODIC_PAYLOAD_SIZE, DEVICE_ID_PREFORMATTED, EXT_PREFORMATTED_STREAMS,
    GLOBAL_APERIODIC_PAYLOAD_SIZE, GLOBAL_OVERHEAD, GLOBAL_STICKY_PAYLOAD_SIZE, OVERHEAD,
    STICKY_PAYLOAD_SIZE,
};
use crate::drain;
use crate::errors::GpmfError;
use crate::klv::{align4, seek_end, RecordHeader};
use crate::stream::{Channel, DeviceStream, StreamHandle, StreamInner};
use crate::FourCC;

/// Routing slot for one external pre-formatted sub-stream, matched by
/// `(device id, FourCC of the main data group)`.
#[derive(Debug)]
pub(crate) struct ExternSlot {
    pub key: FourCC,
    pub device_id: u32,
    pub stream: Option<Arc<DeviceStream>>,
}

/// One channel's ordered stream registry.
#[derive(Debug)]
pub(crate) struct ChannelList {
    /// Open streams, kept sorted by ascending `device_id` so streams
    /// sharing a device id group into one `DEVC` on drain.
    pub streams: Vec<Arc<DeviceStream>>,
    /// Source for auto-assigned device ids.
    pub auto_device_id: u32,
    /// Routing table for re-multiplexed pre-formatted streams.
    pub extern_slots: [Option<ExternSlot>; EXT_PREFORMATTED_STREAMS],
    /// Buffer budget of one synthetic sub-stream, a quarter of the
    /// pre-formatted parent's payload capacity. Zero until a parent
    /// stream is opened.
    pub extern_buffer_size: usize,
}

impl Default for ChannelList {
    fn default() -> Self {
        Self {
            streams: Vec::new(),
            auto_device_id: 0,
            extern_slots: [None, None, None, None],
            extern_buffer_size: 0,
        }
    }
}

/// Process-wide writer state shared by all handles.
#[derive(Debug)]
pub(crate) struct Workspace {
    pub channels: [Mutex<ChannelList>; 2],
    /// Shared pre-format scratch for records too big for a stream's
    /// own headroom. Held only for the duration of a single append.
    pub scratch: Mutex<Vec<u8>>,
}

impl Workspace {
    fn new() -> Self {
        Self {
            channels: [
                Mutex::new(ChannelList::default()),
                Mutex::new(ChannelList::default()),
            ],
            scratch: Mutex::new(Vec::new()),
        }
    }

    /// Opens a stream and registers it with its channel.
    pub(crate) fn open_stream(
        ws: &Arc<Workspace>,
        channel: Channel,
        device_id: Option<u32>,
        device_name: &str,
        buffer: Option<Vec<u8>>,
        buffer_size: usize,
    ) -> Result<StreamHandle, GpmfError> {
        let (sticky_cap, aperiodic_cap, overhead) = match channel {
            Channel::Settings => (
                GLOBAL_STICKY_PAYLOAD_SIZE,
                GLOBAL_APERIODIC_PAYLOAD_SIZE,
                GLOBAL_OVERHEAD,
            ),
            Channel::Timed => (STICKY_PAYLOAD_SIZE, APERIODIC_PAYLOAD_SIZE, OVERHEAD),
        };

        let (buf, owned) = match buffer {
            Some(buf) => {
                if buf.len() <= overhead {
                    // offered buffer too small
                    return Err(GpmfError::Memory);
                }
                (buf, false)
            }
            None => {
                let size = match buffer_size <= overhead {
                    // minimum size plus 1KByte
                    true => overhead + 1024,
                    false => buffer_size,
                };
                (vec![0_u8; size], true)
            }
        };

        let payload_cap = buf.len() - overhead;
        let tri = TriBuffer::carve(buf, owned, sticky_cap, aperiodic_cap);

        let name: String = device_name.chars().filter(|c| c.is_ascii()).take(80).collect();

        let mut list = ws.channels[channel.index()].lock();

        let device_id = match device_id {
            Some(id) if id != 0 => {
                if id != DEVICE_ID_PREFORMATTED {
                    list.auto_device_id = id;
                }
                id
            }
            _ => {
                list.auto_device_id += 1;
                list.auto_device_id
            }
        };

        let dm = Arc::new(DeviceStream {
            channel,
            device_id,
            inner: Mutex::new(StreamInner {
                tri,
                closed: false,
                device_name: name,
                payload_tick: 0,
                session_scale_count: 0,
                last_nonsticky_key: FourCC::END,
                last_nonsticky_type: 0,
                last_nonsticky_size: 0,
                complex_type: Vec::new(),
                quantize: 0,
                timestamps: Vec::new(),
            }),
        });

        if device_id == DEVICE_ID_PREFORMATTED {
            // this stream only carries the slab budget for up to four
            // synthetic sub-streams
            list.extern_buffer_size = ((payload_cap - 12) / EXT_PREFORMATTED_STREAMS) & !3;
        }

        // insertion keeps equal device ids in open order
        let at = list
            .streams
            .partition_point(|s| s.device_id <= device_id);
        list.streams.insert(at, Arc::clone(&dm));

        Ok(StreamHandle {
            ws: Arc::clone(ws),
            stream: dm,
        })
    }

    /// Sub-streams registered for re-multiplexed pre-formatted data.
    pub(crate) fn external_streams(&self, channel: Channel) -> Vec<Arc<DeviceStream>> {
        self.channels[channel.index()]
            .lock()
            .extern_slots
            .iter()
            .flatten()
            .filter_map(|slot| slot.stream.clone())
            .collect()
    }
}

/// The GPMF writer service. Create once, open a stream per sensor, and
/// drain payloads periodically from a consumer thread.
///
/// ```no_run
/// use gpmfwrite::{Channel, FourCC, GpmfWriter, SampleType, StoreFlags};
///
/// fn main() -> Result<(), gpmfwrite::GpmfError> {
///     let writer = GpmfWriter::new();
///     let accl = writer.stream_open(Channel::Timed, Some(1), "MyCamera", None, 8192)?;
///
///     accl.store(FourCC(*b"STNM"), SampleType::Ascii, 1, 5, b"Accel", StoreFlags::STICKY)?;
///     let xyz: [i16; 3] = [10, -20, 30];
///     let bytes: Vec<u8> = xyz.iter().flat_map(|v| v.to_ne_bytes()).collect();
///     accl.store(FourCC(*b"ACCL"), SampleType::SignedShort, 6, 1, &bytes, StoreFlags::NONE)?;
///
///     let mut out = vec![0_u8; 16384];
///     let payload = writer.get_payload(Channel::Timed, &mut out)?;
///     assert!(gpmfwrite::is_valid_gpmf(payload, true));
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct GpmfWriter {
    pub(crate) ws: Arc<Workspace>,
}

impl Default for GpmfWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl GpmfWriter {
    /// Initializes the writer service.
    pub fn new() -> Self {
        Self {
            ws: Arc::new(Workspace::new()),
        }
    }

    /// Offers a pool of memory for pre-formatting any record that
    /// overflows its stream's own headroom. Optional but recommended
    /// when producers store large single records.
    pub fn set_scratch_buffer(&self, buffer: Vec<u8>) -> Result<(), GpmfError> {
        if buffer.is_empty() {
            return Err(GpmfError::Memory);
        }
        *self.ws.scratch.lock() = buffer;
        Ok(())
    }

    /// Opens a new stream. A device may open multiple streams (the
    /// camera IMU has `ACCL`, `GYRO` and `MAGN`); they share a `DEVC`
    /// by sharing a `device_id`. Pass `None` to auto-assign an id.
    ///
    /// `buffer` is an optional caller-supplied allocation (handed back
    /// by [`stream_close`](Self::stream_close)); without one the writer
    /// allocates `buffer_size` bytes, at least the region overhead plus
    /// 1 KiB. Size the buffer for the expected bytes per drain period.
    pub fn stream_open(
        &self,
        channel: Channel,
        device_id: Option<u32>,
        device_name: &str,
        buffer: Option<Vec<u8>>,
        buffer_size: usize,
    ) -> Result<StreamHandle, GpmfError> {
        Workspace::open_stream(&self.ws, channel, device_id, device_name, buffer, buffer_size)
    }

    /// Closes a stream when its device disconnects. Returns the buffer
    /// if the caller supplied one at open time. Remaining clones of the
    /// handle turn inert (`Device` errors).
    pub fn stream_close(&self, handle: StreamHandle) -> Option<Vec<u8>> {
        let mut list = self.ws.channels[handle.stream.channel.index()].lock();
        let mut inner = handle.stream.inner.lock();
        if inner.closed {
            return None;
        }
        inner.closed = true;

        list.streams.retain(|s| !Arc::ptr_eq(s, &handle.stream));
        for slot in list.extern_slots.iter_mut().flatten() {
            if slot
                .stream
                .as_ref()
                .is_some_and(|s| Arc::ptr_eq(s, &handle.stream))
            {
                slot.stream = None;
            }
        }

        match inner.tri.owned {
            true => None,
            false => Some(inner.tri.take()),
        }
    }

    /// Drains the full-rate payload for `channel` into `buffer` and
    /// returns the assembled slice. Clears every stream's payload
    /// region. `EmptyData` when there is nothing to emit.
    pub fn get_payload<'a>(
        &self,
        channel: Channel,
        buffer: &'a mut [u8],
    ) -> Result<&'a [u8], GpmfError> {
        let (payload, _) = drain::get_payload_and_session(
            &self.ws,
            channel,
            buffer,
            drain::Passes::PAYLOAD,
            0,
        )?;
        Ok(payload)
    }

    /// Like [`get_payload`](Self::get_payload), but also assembles a
    /// parallel session payload downsampled towards `session_reduction`
    /// samples per drain: any record with at least twice that many
    /// samples is averaged down to the target rate.
    pub fn get_payload_and_session<'a>(
        &self,
        channel: Channel,
        buffer: &'a mut [u8],
        session_reduction: u32,
    ) -> Result<(&'a [u8], &'a [u8]), GpmfError> {
        let (payload, session) = drain::get_payload_and_session(
            &self.ws,
            channel,
            buffer,
            drain::Passes::BOTH,
            session_reduction,
        )?;
        Ok((payload, session))
    }

    /// Bytes an output buffer needs for the data currently pending on
    /// `channel`, plus 10% headroom for samples arriving between the
    /// estimate and the drain. `payload_scale` mirrors the session
    /// reduction, or `0` for the full-rate payload.
    pub fn estimate_buffer_size(&self, channel: Channel, payload_scale: u32) -> usize {
        estimate_buffer_size(&self.ws, channel, payload_scale)
    }
}

/// Walks a channel under its lock and sizes the pending data the way
/// the drain will emit it.
pub(crate) fn estimate_buffer_size(ws: &Workspace, channel: Channel, payload_scale: u32) -> usize {
    let session_scale = payload_scale;
    let list = ws.channels[channel.index()].lock();

    let mut totalsize = 0_usize;
    let mut devicesizebytes = 0_usize;
    let mut last_device_id = 0_u32;

    for dm in &list.streams {
        let mut inner = dm.inner.lock();
        let mut session_scale_count = inner.session_scale_count;

        // store information of all connected devices
        // even if they have sent no data
        if dm.device_id != last_device_id {
            last_device_id = dm.device_id;

            totalsize += devicesizebytes;
            devicesizebytes = 0;

            // DEVC header, then DVID and DVNM inside it
            totalsize += 8;
            devicesizebytes += 12;
            devicesizebytes += 8 + align4(inner.device_name.len());
        }

        if inner.tri.sticky.used > 0 {
            devicesizebytes += 8;
            devicesizebytes += align4(inner.tri.sticky.used);
        }

        if inner.tri.payload.used > 0 {
            if session_scale == 0 {
                let payload_used = {
                    let region = inner.tri.payload;
                    seek_end(&mut inner.tri.buf[region.start..region.end()])
                };
                devicesizebytes += align4(payload_used);
            } else {
                let slice = inner.tri.slice(crate::buffer::RegionKind::Payload);
                let mut pos = 0;
                let mut last_key = FourCC::END;
                while let Some(hdr) = RecordHeader::peek(slice, pos) {
                    if !hdr.key.is_valid() {
                        break;
                    }
                    let samples = hdr.repeat as u32;
                    let scaled = samples >= session_scale * 2
                        || hdr.type_code == 0
                        || last_key == hdr.key;
                    if scaled {
                        if hdr.type_code != 0 && last_key != hdr.key {
                            let mut newscale = (samples + session_scale / 2) / session_scale;
                            if newscale <= 1 {
                                newscale = 2;
                            }
                            let mut samples_out = 0_usize;
                            for _ in 0..samples {
                                session_scale_count += 1;
                                if session_scale_count >= newscale {
                                    session_scale_count = 0;
                                    samples_out += 1;
                                }
                            }
                            devicesizebytes += align4(8 + hdr.sample_size as usize * samples_out);
                        }
                    } else {
                        devicesizebytes += 8 + hdr.data_size();
                    }
                    last_key = hdr.key;
                    pos += hdr.record_size();
                }
            }
        }
    }

    totalsize += devicesizebytes;

    // add 10% in case extra samples arrive between calls
    let mut estimate = totalsize;
    estimate *= 11;
    estimate /= 10;
    estimate & !3
}
