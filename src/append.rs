//! The in-place append engine.
//!
//! Takes a pre-formatted big-endian KLV record and merges it into one of
//! a stream's three regions: same-key records coalesce by growing the
//! repeat count, sticky records overwrite (or accumulate into) their
//! previous copy, sorted records insert positionally, and everything
//! else lands in front of the terminator. All mutation happens through
//! absolute byte offsets into the stream's single buffer so a record
//! formatted into a region tail can be spliced without aliasing.
//!
//! The caller holds the stream lock for the whole call.

use log::debug;

use crate::buffer::RegionKind;
use crate::consts::MAX_TIMESTAMPS;
use crate::klv::{align4, key_at, plant_end, read_u32_be, seek_end, write_u32_be, RecordHeader};
use crate::stream::{Channel, DeviceStream, StoreFlags, StreamInner};
use crate::FourCC;

/// Where the pre-formatted record lives: an external scratch slice, or
/// a carve at the tail of one of the stream's own regions.
#[derive(Clone, Copy)]
pub(crate) enum Src<'a> {
    Ext(&'a [u8]),
    /// Absolute byte offset within the stream buffer.
    Tail(usize),
}

fn src_header(buf: &[u8], src: Src) -> Option<RecordHeader> {
    match src {
        Src::Ext(s) => RecordHeader::peek(s, 0),
        Src::Tail(off) => RecordHeader::peek(buf, off),
    }
}

fn src_u32(buf: &[u8], src: Src, off: usize) -> u32 {
    match src {
        Src::Ext(s) => read_u32_be(s, off),
        Src::Tail(t) => read_u32_be(buf, t + off),
    }
}

fn src_byte(buf: &[u8], src: Src, off: usize) -> u8 {
    match src {
        Src::Ext(s) => s[off],
        Src::Tail(t) => buf[t + off],
    }
}

fn src_copy(buf: &mut [u8], src: Src, src_off: usize, dst: usize, len: usize) {
    match src {
        Src::Ext(s) => buf[dst..dst + len].copy_from_slice(&s[src_off..src_off + len]),
        Src::Tail(t) => buf.copy_within(t + src_off..t + src_off + len, dst),
    }
}

/// Key at `pos`, or the end marker when `pos` runs off the buffer
/// (a chain truncated right at the region boundary).
fn key_at_or_end(buf: &[u8], pos: usize) -> FourCC {
    match pos + 4 <= buf.len() {
        true => key_at(buf, pos),
        false => FourCC::END,
    }
}

/// `stored >= incoming`, comparing one big-endian element of the
/// record's storage type. Drives sorted insertion.
fn sorted_before(buf: &[u8], stored_at: usize, src: Src, src_off: usize, type_code: u8) -> bool {
    match type_code {
        b'c' | b'b' => buf[stored_at] as i8 >= src_byte(buf, src, src_off) as i8,
        b'B' => buf[stored_at] >= src_byte(buf, src, src_off),
        b's' => {
            let stored = i16::from_be_bytes([buf[stored_at], buf[stored_at + 1]]);
            let new = i16::from_be_bytes([src_byte(buf, src, src_off), src_byte(buf, src, src_off + 1)]);
            stored >= new
        }
        b'S' => {
            let stored = u16::from_be_bytes([buf[stored_at], buf[stored_at + 1]]);
            let new = u16::from_be_bytes([src_byte(buf, src, src_off), src_byte(buf, src, src_off + 1)]);
            stored >= new
        }
        b'l' => read_u32_be(buf, stored_at) as i32 >= src_u32(buf, src, src_off) as i32,
        b'L' => read_u32_be(buf, stored_at) >= src_u32(buf, src, src_off),
        b'f' => {
            let stored = f32::from_bits(read_u32_be(buf, stored_at));
            let new = f32::from_bits(src_u32(buf, src, src_off));
            stored >= new
        }
        // unsupported first-field type: degrade to front insertion
        _ => true,
    }
}

enum Hit {
    /// Matching record found at this offset.
    Match(usize, RecordHeader),
    /// No match; offset of the terminator.
    End(usize),
}

/// Scans a region for a record with `key`, starting at `pos`.
/// Same-key nests are skipped, not merged into. `GROUPED` records
/// never match so repeated groups stay separate records.
fn scan(buf: &[u8], key: FourCC, mut pos: usize, flags: StoreFlags) -> Hit {
    loop {
        let here = key_at_or_end(buf, pos);
        if here == FourCC::END {
            return Hit::End(pos);
        }
        let hdr = match RecordHeader::peek(buf, pos) {
            Some(hdr) => hdr,
            None => return Hit::End(pos),
        };
        if here == key && !flags.contains(StoreFlags::GROUPED) {
            if hdr.type_code == 0 {
                // a nested container under the same key is left alone
                pos += hdr.record_size();
                continue;
            }
            return Hit::Match(pos, hdr);
        }
        pos += hdr.record_size();
    }
}

/// Appends a formatted record (`src`, `bytelen` bytes of header plus
/// unpadded payload) to the region selected by `flags`. Mirrors the
/// producer-visible semantics described on [`StreamHandle::store`].
///
/// [`StreamHandle::store`]: crate::StreamHandle::store
pub(crate) fn append_formatted(
    dm: &DeviceStream,
    inner: &mut StreamInner,
    src: Src<'_>,
    bytelen: usize,
    flags: StoreFlags,
    sample_count: u32,
    timestamp_us: u64,
) {
    let Some(first_hdr) = src_header(&inner.tri.buf, src) else {
        return;
    };
    if !first_hdr.key.is_valid() {
        return;
    }

    // Raw per-write stamp, stored as its own payload record in front of
    // the main one. Appends of the same key coalesce, so one drain ends
    // up with an STPS array of every stamp.
    if timestamp_us != 0 && flags.contains(StoreFlags::STORE_ALL_TIMESTAMPS) {
        let mut stps = [0_u8; 16];
        stps[0..8].copy_from_slice(&RecordHeader::new(FourCC::STPS, b'J', 8, 1).to_bytes());
        stps[8..16].copy_from_slice(&timestamp_us.to_be_bytes());
        append_formatted(
            dm,
            inner,
            Src::Ext(&stps),
            16,
            StoreFlags::DONT_COUNT,
            1,
            0,
        );
    }

    let mut tsmp = [0_u8; 12];
    let mut src = src;
    let mut bytelen = bytelen;
    let mut flags = flags;
    let mut sample_count = sample_count;

    loop {
        let Some(hdr) = src_header(&inner.tri.buf, src) else {
            return;
        };
        let key = hdr.key;

        let kind = if flags.contains(StoreFlags::STICKY) {
            RegionKind::Sticky
        } else if flags.contains(StoreFlags::APERIODIC) {
            RegionKind::Aperiodic
        } else {
            RegionKind::Payload
        };

        if kind == RegionKind::Payload {
            inner.last_nonsticky_key = key;
            inner.last_nonsticky_type = hdr.type_code;
            inner.last_nonsticky_size = hdr.sample_size;

            if timestamp_us != 0 && inner.timestamps.len() < MAX_TIMESTAMPS {
                inner.timestamps.push(timestamp_us);
            }
        }

        let (base, cap) = {
            let r = inner.tri.region(kind);
            (r.start, r.capacity)
        };

        // Recompute the write position by scanning for the terminator
        // instead of trusting the mirrored size. An append interrupted
        // mid-splice heals here.
        let mut used = seek_end(&mut inner.tri.buf[base..base + cap]);
        let mut used_al = align4(used);

        if used == 0 && bytelen < cap {
            // first record of the region
            src_copy(&mut inner.tri.buf, src, 0, base, bytelen);
            zero_pad(&mut inner.tri.buf, base + bytelen);
            end_within(&mut inner.tri.buf, base, cap, base + align4(bytelen));
            used = bytelen;
        } else if bytelen + used + 4 < cap || flags.contains(StoreFlags::SORTED) {
            let mut pos = base;
            'merge: loop {
                match scan(&inner.tri.buf, key, pos, flags) {
                    Hit::Match(at, curr) if flags.contains(StoreFlags::STICKY) => {
                        if curr.packed_size() == hdr.packed_size() {
                            // same shape: overwrite (or add into) the payload
                            if flags.contains(StoreFlags::ACCUMULATE) && curr.type_code == b'L' {
                                let sum = read_u32_be(&inner.tri.buf, at + 8)
                                    .wrapping_add(src_u32(&inner.tri.buf, src, 8));
                                src_copy(&mut inner.tri.buf, src, 8, at + 8, bytelen - 8);
                                write_u32_be(&mut inner.tri.buf, at + 8, sum);
                            } else {
                                src_copy(&mut inner.tri.buf, src, 8, at + 8, bytelen - 8);
                            }
                        } else {
                            // the declaration changed shape: splice the old
                            // record out and rescan; the fresh copy lands at
                            // the end, so sticky order is unstable here
                            let reclen = curr.record_size();
                            let chain_end = (base + used_al + 4).min(inner.tri.buf.len());
                            inner
                                .tri
                                .buf
                                .copy_within((at + reclen).min(chain_end)..chain_end, at);
                            used = seek_end(&mut inner.tri.buf[base..base + cap]);
                            used_al = align4(used);
                            pos = at;
                            continue 'merge;
                        }
                    }
                    Hit::Match(at, curr) if flags.contains(StoreFlags::SORTED) => {
                        let complex_first = inner.complex_type.first().copied().unwrap_or(0);
                        used = sorted_insert(
                            &mut inner.tri.buf,
                            src,
                            &hdr,
                            at,
                            curr,
                            base,
                            cap,
                            used,
                            complex_first,
                        );
                    }
                    Hit::Match(at, curr) => {
                        // grow the existing record in place
                        let packed_curr = curr.packed_size();
                        let pad_curr = curr.data_size() - packed_curr;
                        let growth = align4(bytelen - 8 - pad_curr);
                        let gap = at + 8 + curr.data_size();

                        if key_at_or_end(&inner.tri.buf, base + used_al) == FourCC::END {
                            end_within(&mut inner.tri.buf, base, cap, base + used_al + growth);
                        }
                        if key_at_or_end(&inner.tri.buf, gap) != FourCC::END {
                            // make room for the grown payload
                            let chain_end = (base + used_al + 4).min(inner.tri.buf.len());
                            inner
                                .tri
                                .buf
                                .copy_within(gap..chain_end, gap + growth);
                        }
                        src_copy(&mut inner.tri.buf, src, 8, at + 8 + packed_curr, bytelen - 8);
                        let repeat = (curr.repeat as u32).wrapping_add(hdr.repeat as u32) as u16;
                        RecordHeader::new(key, curr.type_code, curr.sample_size, repeat)
                            .store(&mut inner.tri.buf, at);
                        used = used_al + growth;
                    }
                    Hit::End(at) => {
                        if at + bytelen + 4 > base + cap {
                            // sorted stores skip the fit check; drop here
                            debug!("append: {} under {} exceeds the region", bytelen, key);
                        } else if used > 0 && flags.contains(StoreFlags::ACCUMULATE) {
                            // accumulators go in front so they stay easy to
                            // find in every payload
                            let growth = align4(bytelen);
                            let chain_end = (base + used_al + 4).min(inner.tri.buf.len());
                            inner.tri.buf.copy_within(base..chain_end, base + growth);
                            src_copy(&mut inner.tri.buf, src, 0, base, bytelen);
                            zero_pad_to(&mut inner.tri.buf, base + bytelen, base + growth);
                            used = used_al + growth;
                        } else {
                            src_copy(&mut inner.tri.buf, src, 0, at, bytelen);
                            zero_pad(&mut inner.tri.buf, at + bytelen);
                            end_within(&mut inner.tri.buf, base, cap, at + align4(bytelen));
                            used = (at - base) + bytelen;
                        }
                    }
                }
                break;
            }
        } else {
            debug!(
                "append: {} byte record under {} does not fit ({} of {} bytes used)",
                bytelen,
                key,
                used,
                cap
            );
        }

        inner.tri.region_mut(kind).used = used;

        // Bump the running total-sample counter unless this write was
        // sticky, internal, or on the settings channel. Strings and
        // grouped/aperiodic payloads count as one sample.
        if !flags.contains(StoreFlags::STICKY)
            && !flags.contains(StoreFlags::DONT_COUNT)
            && dm.channel != Channel::Settings
        {
            let counted = if hdr.type_code == b'c'
                || flags.contains(StoreFlags::GROUPED)
                || flags.contains(StoreFlags::APERIODIC)
            {
                1
            } else {
                sample_count
            };
            tsmp[0..8].copy_from_slice(&RecordHeader::new(FourCC::TSMP, b'L', 4, 1).to_bytes());
            tsmp[8..12].copy_from_slice(&counted.to_be_bytes());

            src = Src::Ext(&tsmp);
            bytelen = 12;
            sample_count = 1;
            flags = StoreFlags::STICKY | StoreFlags::ACCUMULATE;
            continue;
        }
        break;
    }
}

/// Inserts every incoming sample into the matching sorted record,
/// keeping samples non-decreasing by their first field. When the region
/// cannot grow, the insertion shifts within the record and drops its
/// current tail sample instead, so capacity bounds the sort.
#[allow(clippy::too_many_arguments)]
fn sorted_insert(
    buf: &mut Vec<u8>,
    src: Src<'_>,
    incoming: &RecordHeader,
    at: usize,
    mut curr: RecordHeader,
    base: usize,
    cap: usize,
    mut used: usize,
    complex_first: u8,
) -> usize {
    let stride = curr.sample_size as usize;
    if stride == 0 || stride != incoming.sample_size as usize {
        return used;
    }
    let mut type_code = curr.type_code;
    if type_code == b'?' {
        // complex records sort by their leading descriptor field
        type_code = complex_first;
    }

    for k in 0..incoming.repeat {
        let src_off = 8 + k as usize * stride;
        let stored = curr.repeat as usize;
        let packed = curr.packed_size();
        let data_start = at + 8;

        let mut insert = stored;
        for i in 0..stored {
            if sorted_before(buf, data_start + i * stride, src, src_off, type_code) {
                insert = i;
                break;
            }
        }
        let insert_at = data_start + insert * stride;
        let used_al = align4(used);
        let growth = align4(packed + stride) - align4(packed);

        if stride + used + 4 < cap && base + used_al + 4 + growth <= (base + cap).min(buf.len()) {
            // two shifts: trailing records move by the padded growth,
            // trailing samples by one stride
            if growth > 0 {
                buf.copy_within(
                    at + 8 + align4(packed)..base + used_al + 4,
                    at + 8 + align4(packed) + growth,
                );
            }
            if insert < stored {
                buf.copy_within(insert_at..at + 8 + packed, insert_at + stride);
            }
            src_copy(buf, src, src_off, insert_at, stride);
            curr.repeat += 1;
            curr.store(buf, at);
            used = used_al + growth;
        } else if insert < stored {
            // full: keep the region size, drop the lowest-priority tail
            buf.copy_within(insert_at..at + 8 + packed - stride, insert_at + stride);
            src_copy(buf, src, src_off, insert_at, stride);
        }
        // no room and nothing smaller stored: the sample is dropped
    }

    used
}

/// Zeroes the padding bytes between `from` and the next 4-byte boundary.
fn zero_pad(buf: &mut [u8], from: usize) {
    let to = align4(from);
    if to <= buf.len() {
        buf[from..to].fill(0);
    }
}

fn zero_pad_to(buf: &mut [u8], from: usize, to: usize) {
    if from < to && to <= buf.len() {
        buf[from..to].fill(0);
    }
}

/// Plants the terminator at `at` if it still lies within the region.
fn end_within(buf: &mut [u8], base: usize, cap: usize, at: usize) {
    if at + 4 <= base + cap {
        plant_end(buf, at);
    }
}
