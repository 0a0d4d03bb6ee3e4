//! Re-multiplex of externally pre-formatted GPMF.
//!
//! Some producers (a Bluetooth remote, a second camera) hand over a
//! fully formed `DEVC`/`STRM` tree instead of raw samples. The tree is
//! parsed and every stream replayed into a synthetic sub-stream of this
//! writer, so the external data merges into the normal drain: the
//! describing records become sticky, the main data group re-accumulates
//! per payload, and `TSMP`/`EMPT` are re-synthesized fresh.
//!
//! Routing is by `(device id, FourCC of the main data group)` against a
//! small fixed table; streams beyond the table are dropped.

use std::sync::Arc;

use log::debug;

use crate::consts::EXT_PREFORMATTED_STREAMS;
use crate::klv::{read_u32_be, RecordHeader};
use crate::stream::{DeviceStream, StoreFlags, StreamHandle};
use crate::writer::{ExternSlot, Workspace};
use crate::FourCC;

/// Parses a pre-formatted payload and dispatches every `STRM` it
/// contains. `parent` is the stream the producer stored to (device id
/// `DEVICE_ID_PREFORMATTED`).
pub(crate) fn sync_external(ws: &Arc<Workspace>, parent: &Arc<DeviceStream>, data: &[u8]) {
    let mut pos = 0_usize;
    let mut device_id = 0_u32;
    let mut device_name = String::new();

    while pos + 8 <= data.len() {
        let Some(devc) = RecordHeader::peek(data, pos) else {
            return;
        };
        if devc.key != FourCC::DEVC {
            return;
        }
        pos += 8;

        // walk the device's children; the declared size is not trusted,
        // the next DEVC key ends the device instead
        while pos + 8 <= data.len() {
            let Some(hdr) = RecordHeader::peek(data, pos) else {
                return;
            };
            if hdr.key == FourCC::DEVC {
                break;
            }
            if !hdr.key.is_valid() {
                return;
            }
            match hdr.key {
                FourCC::DVID => {
                    if pos + 12 <= data.len() {
                        device_id = read_u32_be(data, pos + 8);
                    }
                }
                FourCC::DVNM => {
                    let len = hdr.packed_size().min(data.len() - pos - 8).min(79);
                    device_name = data[pos + 8..pos + 8 + len]
                        .iter()
                        .map(|b| *b as char)
                        .collect();
                }
                FourCC::STRM => {
                    let end = (pos + hdr.record_size()).min(data.len());
                    route_stream(ws, parent, device_id, &device_name, &data[pos..end]);
                }
                _ => (),
            }
            pos += hdr.record_size();
        }
    }
}

/// FourCC of the main data group: the last child of the `STRM` nest.
fn main_group_key(strm: &[u8]) -> Option<FourCC> {
    let hdr = RecordHeader::peek(strm, 0)?;
    let total = (8 + hdr.data_size()).min(strm.len());
    let mut pos = 8;

    while pos + 8 <= total {
        let child = RecordHeader::peek(strm, pos)?;
        if !child.key.is_valid() {
            break;
        }
        if pos + child.record_size() >= total {
            return Some(child.key);
        }
        pos += child.record_size();
    }
    None
}

/// Finds (or claims) the routing slot for a stream and replays it into
/// the slot's synthetic sub-stream.
fn route_stream(
    ws: &Arc<Workspace>,
    parent: &Arc<DeviceStream>,
    device_id: u32,
    device_name: &str,
    strm: &[u8],
) {
    let Some(main_key) = main_group_key(strm) else {
        return;
    };
    let channel = parent.channel;

    // claim a slot under the channel lock
    let (slot_index, existing, slab_size) = {
        let mut list = ws.channels[channel.index()].lock();
        if list.extern_buffer_size == 0 {
            return;
        }
        let mut found = None;
        for i in 0..EXT_PREFORMATTED_STREAMS {
            match &list.extern_slots[i] {
                Some(slot) if slot.key == main_key && slot.device_id == device_id => {
                    found = Some(i);
                    break;
                }
                None => {
                    list.extern_slots[i] = Some(ExternSlot {
                        key: main_key,
                        device_id,
                        stream: None,
                    });
                    found = Some(i);
                    break;
                }
                Some(_) => (),
            }
        }
        let Some(i) = found else {
            debug!("remux: routing table full, dropping stream {main_key}");
            return;
        };
        let existing = list.extern_slots[i].as_ref().and_then(|s| s.stream.clone());
        (i, existing, list.extern_buffer_size)
    };

    let sub = match existing {
        Some(sub) => sub,
        None => {
            // the 0x01000000 bit keeps synthetic ids clear of real ones
            let handle = match Workspace::open_stream(
                ws,
                channel,
                Some(device_id | 0x01000000),
                device_name,
                None,
                slab_size,
            ) {
                Ok(handle) => handle,
                Err(_) => return,
            };
            let sub = Arc::clone(&handle.stream);
            let mut list = ws.channels[channel.index()].lock();
            if let Some(slot) = &mut list.extern_slots[slot_index] {
                slot.stream = Some(Arc::clone(&sub));
            }
            sub
        }
    };

    // only replay streams that actually carry something
    if strm.len() >= 20 {
        add_strm(
            &StreamHandle {
                ws: Arc::clone(ws),
                stream: sub,
            },
            strm,
        );
    }
}

/// Replays the children of one `STRM` into a sub-stream: everything
/// before the main data group describes the telemetry and is stored
/// sticky, the main group itself is the per-payload data. The input
/// `TSMP`/`EMPT` counters are dropped; the drain re-synthesizes them.
fn add_strm(handle: &StreamHandle, strm: &[u8]) {
    let Some(hdr) = RecordHeader::peek(strm, 0) else {
        return;
    };
    let total = (8 + hdr.data_size()).min(strm.len());
    let mut pos = 8;
    // with no TSMP in the input the main group is metadata-like and
    // stays sticky
    let mut last_group_sticky = true;

    while pos + 8 <= total {
        let Some(child) = RecordHeader::peek(strm, pos) else {
            return;
        };
        if !child.key.is_valid() {
            return;
        }
        let rec_end = pos + child.record_size();

        if child.key == FourCC::TSMP {
            last_group_sticky = false;
            pos = rec_end;
            continue;
        }
        if child.key == FourCC::EMPT {
            pos = rec_end;
            continue;
        }

        let data_end = (pos + 8 + child.packed_size()).min(strm.len());
        let data = &strm[pos + 8..data_end];
        let flags = match rec_end >= total {
            // the main data group
            true => match last_group_sticky {
                true => StoreFlags::STICKY | StoreFlags::BIG_ENDIAN,
                false => StoreFlags::BIG_ENDIAN,
            },
            false => StoreFlags::STICKY | StoreFlags::BIG_ENDIAN,
        };

        let _ = handle.store_raw(
            child.key,
            child.type_code,
            child.sample_size as u32,
            child.repeat as u32,
            data,
            flags,
            0,
        );

        if rec_end >= total {
            break;
        }
        pos = rec_end;
    }
}
