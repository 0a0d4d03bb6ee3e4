//! Payload assembly: welds every stream of a channel into one
//! hierarchical `DEVC`/`STRM` tree in the consumer's buffer, then
//! resets the payload regions.
//!
//! Two passes share the output buffer: the full-rate MP4 payload and
//! an optional session payload downsampled (with averaging) towards a
//! target sample rate. Nest lengths use the chunked size encoding so
//! they are not capped by the 16-bit repeat field.
//!
//! The channel lock is held for the whole drain; opens and closes
//! block, stores only contend per stream.

use log::warn;

use crate::compress;
use crate::consts::{DEVICE_ID_CAMERA, DEVICE_ID_PREFORMATTED};
use crate::errors::GpmfError;
use crate::klv::{align4, chunk_encode, plant_end, seek_end, RecordHeader};
use crate::stream::{Channel, StoreFlags};
use crate::writer::{estimate_buffer_size, Workspace};
use crate::FourCC;

/// Which of the two drain passes to produce.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Passes {
    pub payload: bool,
    pub session: bool,
}

impl Passes {
    pub const PAYLOAD: Passes = Passes {
        payload: true,
        session: false,
    };
    pub const BOTH: Passes = Passes {
        payload: true,
        session: true,
    };
}

/// Bounded write cursor over the consumer's buffer. Overflow latches
/// instead of panicking; the drain reports it as a memory error.
struct OutBuf<'b> {
    buf: &'b mut [u8],
    pos: usize,
    overflow: bool,
}

impl<'b> OutBuf<'b> {
    fn new(buf: &'b mut [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            overflow: false,
        }
    }

    fn put(&mut self, bytes: &[u8]) {
        if self.overflow || self.pos + bytes.len() > self.buf.len() {
            self.overflow = true;
            return;
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    /// Reserves a size word to be patched when the nest closes.
    fn reserve_size_word(&mut self) -> usize {
        let at = self.pos;
        self.put(&[0_u8; 4]);
        at
    }

    fn patch(&mut self, at: usize, bytes: &[u8]) {
        if !self.overflow && at + bytes.len() <= self.buf.len() {
            self.buf[at..at + bytes.len()].copy_from_slice(bytes);
        }
    }

    fn rewind_to(&mut self, at: usize) {
        self.pos = at;
    }

    fn remaining_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.pos..]
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
    }
}

/// Patches a nest's reserved size word with the chunked encoding of
/// `content` bytes and fills the chunk remainder with end markers.
/// Returns the bytes of padding written.
fn close_nest(out: &mut OutBuf, size_pos: usize, content: usize) -> usize {
    let (chunksize, chunks) = chunk_encode(content as u32);
    out.patch(
        size_pos,
        &[0_u8, chunksize as u8, (chunks >> 8) as u8, (chunks & 0xff) as u8][..],
    );
    let total = (chunksize * chunks) as usize;
    let mut pad = total.saturating_sub(content);
    let written = pad;
    while pad >= 4 {
        out.put(&FourCC::END.0);
        pad -= 4;
    }
    written
}

/// Least-squares fit `t(i) = a*i + b` over the logged stamps; the
/// intercept is the jitter-free start of the payload. With too few
/// points the first raw stamp is reported instead.
fn dejitter(stamps: &[u64]) -> u64 {
    if stamps.len() > 5 {
        let n = stamps.len() as f64;
        let mean_x = (stamps.len() - 1) as f64 / 2.0;
        let mean_y = stamps.iter().map(|&t| t as f64).sum::<f64>() / n;

        let mut top = 0.0_f64;
        let mut bot = 0.0_f64;
        for (i, &t) in stamps.iter().enumerate() {
            let dx = i as f64 - mean_x;
            top += dx * (t as f64 - mean_y);
            bot += dx * dx;
        }
        let slope = top / bot;
        (mean_y - slope * mean_x) as u64
    } else {
        stamps[0]
    }
}

pub(crate) fn get_payload_and_session<'a>(
    ws: &Workspace,
    channel: Channel,
    buffer: &'a mut [u8],
    passes: Passes,
    session_reduction: u32,
) -> Result<(&'a [u8], &'a [u8]), GpmfError> {
    let mut estimate = 0_usize;
    if passes.payload {
        estimate += estimate_buffer_size(ws, channel, 0);
    }
    if passes.session {
        estimate += estimate_buffer_size(ws, channel, session_reduction);
    }
    if buffer.len() < estimate {
        warn!("drain: {} byte buffer offered, {estimate} estimated", buffer.len());
        return Err(GpmfError::Memory);
    }
    if estimate == 0 {
        return Err(GpmfError::EmptyData);
    }

    // prevent device list changes while extracting
    let list = ws.channels[channel.index()].lock();

    let mut payload_len = 0_usize;
    let mut session_start = 0_usize;
    let mut session_len = 0_usize;
    let overflow;

    {
        let mut out = OutBuf::new(&mut *buffer);

        for j in 0..2 {
            let (wanted, session_scale, freebuffers) = match j {
                0 => (passes.payload, 0, passes.payload && !passes.session),
                _ => (passes.session, session_reduction, true),
            };
            if !wanted {
                continue;
            }
            let pass_start = out.pos;

            // earliest producer tick across the channel, reported in the
            // camera's DEVC
            let mut lowest_tick = 0_u32;
            for dm in &list.streams {
                let inner = dm.inner.lock();
                if inner.payload_tick != 0 && (lowest_tick == 0 || lowest_tick > inner.payload_tick)
                {
                    lowest_tick = inner.payload_tick;
                }
            }

            let mut last_device_id = 0_u32;
            let mut device_size_pos: Option<usize> = None;
            let mut devicesizebytes = 0_usize;

            for dm in &list.streams {
                let mut inner = dm.inner.lock();

                let mut stream_size_pos: Option<usize> = None;
                let mut stream_key_pos = 0_usize;
                let mut streamsizebytes = 0_usize;

                if dm.device_id != last_device_id && dm.device_id != DEVICE_ID_PREFORMATTED {
                    last_device_id = dm.device_id;

                    if let Some(size_pos) = device_size_pos {
                        close_nest(&mut out, size_pos, devicesizebytes);
                        devicesizebytes = 0;
                    }

                    // nested device, to speed the parsing of multiple
                    // devices in post
                    out.put(&FourCC::DEVC.0);
                    device_size_pos = Some(out.reserve_size_word());

                    // a key-like id is stored raw, a numeric one big-endian
                    let id_bytes = dm.device_id.to_be_bytes();
                    if FourCC(id_bytes).is_valid() {
                        out.put(&RecordHeader::new(FourCC::DVID, b'F', 4, 1).to_bytes());
                        out.put(&id_bytes);
                    } else {
                        out.put(&RecordHeader::new(FourCC::DVID, b'L', 4, 1).to_bytes());
                        out.put(&id_bytes);
                    }
                    devicesizebytes += 12;

                    let name = inner.device_name.as_bytes();
                    out.put(
                        &RecordHeader::new(FourCC::DVNM, b'c', 1, name.len() as u16).to_bytes(),
                    );
                    out.put(name);
                    let namepad = align4(name.len()) - name.len();
                    out.put(&[0_u8; 4][..namepad]);
                    devicesizebytes += 8 + align4(name.len());

                    // payload start tick (or higher precision MP4 timing)
                    if dm.device_id == DEVICE_ID_CAMERA
                        && dm.channel != Channel::Settings
                        && lowest_tick > 0
                    {
                        out.put(&RecordHeader::new(FourCC::TICK, b'L', 4, 1).to_bytes());
                        out.put(&lowest_tick.to_be_bytes());
                        devicesizebytes += 12;
                    }
                }

                // no current payload: has the device stopped? plant an
                // empty marker so parsers see the stream, and count the
                // dry spell in sticky
                if inner.tri.payload.used == 0
                    && dm.device_id != DEVICE_ID_PREFORMATTED
                    && inner.last_nonsticky_key != FourCC::END
                    && session_scale == 0
                {
                    let p = inner.tri.payload.start;
                    let key = inner.last_nonsticky_key;
                    let type_code = inner.last_nonsticky_type;
                    let sample_size = inner.last_nonsticky_size;
                    inner.tri.buf[p..p + 4].copy_from_slice(&key.0);
                    inner.tri.buf[p + 4] = type_code;
                    inner.tri.buf[p + 5] = sample_size;
                    inner.tri.buf[p + 6] = 0;
                    inner.tri.buf[p + 7] = 0;
                    plant_end(&mut inner.tri.buf, p + 8);
                    inner.tri.payload.used = 8;

                    let mut empt = [0_u8; 12];
                    empt[0..8]
                        .copy_from_slice(&RecordHeader::new(FourCC::EMPT, b'L', 4, 1).to_bytes());
                    empt[8..12].copy_from_slice(&1_u32.to_be_bytes());
                    crate::append::append_formatted(
                        dm,
                        &mut inner,
                        crate::append::Src::Ext(&empt),
                        12,
                        StoreFlags::STICKY | StoreFlags::ACCUMULATE,
                        1,
                        0,
                    );
                }

                // wrap the telemetry in a stream nest whenever there are
                // sticky declarations to re-emit
                if inner.tri.sticky.used > 0 {
                    stream_key_pos = out.pos;
                    out.put(&FourCC::STRM.0);
                    stream_size_pos = Some(out.reserve_size_word());
                    devicesizebytes += 8;

                    if !inner.timestamps.is_empty() {
                        let stamp = dejitter(&inner.timestamps);
                        out.put(&RecordHeader::new(FourCC::STMP, b'J', 8, 1).to_bytes());
                        out.put(&stamp.to_be_bytes());
                        devicesizebytes += 16;
                        streamsizebytes += 16;
                    }

                    if session_scale == 0 {
                        let n = align4(inner.tri.sticky.used);
                        let start = inner.tri.sticky.start;
                        out.put(&inner.tri.buf[start..start + n]);
                        devicesizebytes += n;
                        streamsizebytes += n;
                    } else {
                        // sample counters are meaningless in session files
                        let sticky = inner.tri.sticky;
                        let mut spos = sticky.start;
                        while let Some(hdr) = RecordHeader::peek(&inner.tri.buf, spos) {
                            if !hdr.key.is_valid() {
                                break;
                            }
                            if hdr.key == FourCC::TSMP || hdr.key == FourCC::EMPT {
                                spos += hdr.record_size();
                                continue;
                            }
                            let n = 8 + hdr.data_size();
                            out.put(&inner.tri.buf[spos..spos + n]);
                            devicesizebytes += n;
                            streamsizebytes += n;
                            spos += hdr.record_size();
                        }
                    }
                }

                if inner.tri.payload.used > 0 {
                    if session_scale == 0 {
                        let region = inner.tri.payload;
                        let used = seek_end(&mut inner.tri.buf[region.start..region.end()]);
                        inner.tri.payload.used = used;
                        let payload_addition = align4(used).min(region.capacity);
                        let src = region.start..region.start + payload_addition;

                        if inner.quantize != 0 && payload_addition > 100 {
                            let quantize = inner.quantize;
                            let n = compress::compress_record(
                                out.remaining_mut(),
                                &inner.tri.buf[src],
                                quantize,
                            );
                            if n == 0 {
                                out.overflow = true;
                            } else {
                                out.advance(n);
                                devicesizebytes += n;
                                streamsizebytes += n;
                            }
                        } else {
                            out.put(&inner.tri.buf[src]);
                            devicesizebytes += payload_addition;
                            streamsizebytes += payload_addition;
                        }
                    } else {
                        let (d, s) = session_scaled_copy(&mut out, &mut inner, session_scale);
                        devicesizebytes += d;
                        streamsizebytes += s;
                    }
                }

                // write the size field for the end of the stream
                if let Some(size_pos) = stream_size_pos {
                    if streamsizebytes < 8 {
                        // an empty stream nest is backed out entirely
                        out.rewind_to(stream_key_pos);
                        devicesizebytes -= 8 + streamsizebytes;
                    } else {
                        let pad = close_nest(&mut out, size_pos, streamsizebytes);
                        devicesizebytes += pad;
                    }
                }

                if freebuffers
                    && inner.tri.payload.used > 0
                    && dm.device_id != DEVICE_ID_PREFORMATTED
                {
                    // PREFORMATTED keeps its buffer: the sub-stream slabs
                    // live there
                    let start = inner.tri.payload.start;
                    plant_end(&mut inner.tri.buf, start);
                    inner.tri.payload.used = 0;
                    inner.payload_tick = 0;
                    inner.timestamps.clear();
                }
            }

            // write the size field for the end of the last device
            if let Some(size_pos) = device_size_pos {
                close_nest(&mut out, size_pos, devicesizebytes);
            }

            match j {
                0 => payload_len = out.pos - pass_start,
                _ => {
                    session_start = pass_start;
                    session_len = out.pos - pass_start;
                }
            }
        }

        overflow = out.overflow;
    }

    drop(list);

    if overflow {
        return Err(GpmfError::Memory);
    }

    let whole: &'a [u8] = buffer;
    Ok((
        &whole[..payload_len],
        &whole[session_start..session_start + session_len],
    ))
}

/// Copies one stream's payload records at the session rate: records
/// with at least twice `session_scale` samples are reduced to one
/// averaged sample per phase wrap, nests and repeated keys are
/// dropped, everything else is copied verbatim. The phase accumulator
/// lives in the stream so the cadence survives across drains.
fn session_scaled_copy(
    out: &mut OutBuf,
    inner: &mut crate::stream::StreamInner,
    session_scale: u32,
) -> (usize, usize) {
    let mut devicebytes = 0_usize;
    let mut streambytes = 0_usize;

    let payload = inner.tri.payload;
    let mut spos = payload.start;
    let mut last_key = FourCC::END;

    loop {
        let Some(hdr) = RecordHeader::peek(&inner.tri.buf, spos) else {
            break;
        };
        if !hdr.key.is_valid() {
            break;
        }
        let samples = hdr.repeat as u32;
        let reduce = (session_scale != 0 && samples >= session_scale * 2)
            || hdr.type_code == 0
            || last_key == hdr.key;

        if reduce {
            if hdr.type_code == 0 || last_key == hdr.key {
                // nests and repeated keys are dropped at session rate
                spos += hdr.record_size();
            } else {
                let sample_size = hdr.sample_size as usize;
                let sample_type = hdr.type_code;
                let mut newscale = (samples + session_scale / 2) / session_scale;
                if newscale <= 1 {
                    newscale = 2;
                }

                let rec_start = out.pos;
                out.put(&inner.tri.buf[spos..spos + 8]);

                // average what fits in the accumulator; other shapes are
                // decimated by picking every n-th sample
                let elem = match sample_type {
                    b'f' | b'l' | b'L' => 4_usize,
                    b's' | b'S' => 2,
                    _ => 0,
                };
                let average = elem != 0 && sample_size < 80;
                let looplen = if average { sample_size / elem } else { 0 };
                let mut acc_i = vec![0_i64; looplen];
                let mut acc_f = vec![0.0_f64; looplen];
                let mut count = 0_u32;
                let mut samples_out = 0_usize;

                let mut sample_at = spos + 8;
                for _ in 0..samples {
                    inner.session_scale_count += 1;
                    if inner.session_scale_count >= newscale {
                        inner.session_scale_count = 0;
                        if average && count > 0 {
                            emit_average(
                                out,
                                sample_type,
                                sample_size,
                                elem,
                                &mut acc_i,
                                &mut acc_f,
                                count,
                            );
                            count = 0;
                        } else {
                            out.put(&inner.tri.buf[sample_at..sample_at + sample_size]);
                        }
                        samples_out += 1;
                    }
                    if average {
                        accumulate(
                            &inner.tri.buf,
                            sample_at,
                            sample_type,
                            looplen,
                            elem,
                            &mut acc_i,
                            &mut acc_f,
                        );
                        count += 1;
                    }
                    sample_at += sample_size;
                }

                let emitted = 8 + sample_size * samples_out;
                let pad = align4(emitted) - emitted;
                out.put(&[0_u8; 4][..pad]);
                let reduced =
                    RecordHeader::new(hdr.key, sample_type, hdr.sample_size, samples_out as u16);
                out.patch(rec_start, &reduced.to_bytes());
                devicebytes += align4(emitted);
                streambytes += align4(emitted);
                spos += hdr.record_size();
            }
        } else {
            let n = 8 + hdr.data_size();
            out.put(&inner.tri.buf[spos..spos + n]);
            devicebytes += n;
            streambytes += n;
            spos += hdr.record_size();
        }

        last_key = hdr.key;
    }

    (devicebytes, streambytes)
}

/// Writes the mean of the accumulated samples, big-endian, and clears
/// the accumulators.
fn emit_average(
    out: &mut OutBuf,
    sample_type: u8,
    sample_size: usize,
    elem: usize,
    acc_i: &mut [i64],
    acc_f: &mut [f64],
    count: u32,
) {
    match sample_type {
        b'f' => {
            for v in acc_f.iter_mut() {
                let avg = (*v / count as f64) as f32;
                out.put(&avg.to_be_bytes());
                *v = 0.0;
            }
        }
        b's' => {
            for v in acc_i.iter_mut() {
                let avg = (*v / count as i64) as i16;
                out.put(&avg.to_be_bytes());
                *v = 0;
            }
        }
        b'S' => {
            for v in acc_i.iter_mut() {
                let avg = (*v / count as i64) as u16;
                out.put(&avg.to_be_bytes());
                *v = 0;
            }
        }
        b'l' => {
            for v in acc_i.iter_mut() {
                let avg = (*v / count as i64) as i32;
                out.put(&avg.to_be_bytes());
                *v = 0;
            }
        }
        b'L' => {
            for v in acc_i.iter_mut() {
                let avg = (*v / count as i64) as u32;
                out.put(&avg.to_be_bytes());
                *v = 0;
            }
        }
        _ => {}
    }
    // a sample size that is not a whole number of elements keeps its
    // trailing bytes zeroed
    let tail = sample_size - (sample_size / elem) * elem;
    out.put(&[0_u8; 8][..tail]);
}

/// Adds one big-endian source sample into the accumulators.
fn accumulate(
    buf: &[u8],
    at: usize,
    sample_type: u8,
    looplen: usize,
    elem: usize,
    acc_i: &mut [i64],
    acc_f: &mut [f64],
) {
    for i in 0..looplen {
        let off = at + i * elem;
        match sample_type {
            b'f' => {
                let bits = u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
                acc_f[i] += f32::from_bits(bits) as f64;
            }
            b's' => acc_i[i] += i16::from_be_bytes([buf[off], buf[off + 1]]) as i64,
            b'S' => acc_i[i] += u16::from_be_bytes([buf[off], buf[off + 1]]) as i64,
            b'l' => {
                acc_i[i] +=
                    i32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]) as i64
            }
            b'L' => {
                acc_i[i] +=
                    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]) as i64
            }
            _ => {}
        }
    }
}
