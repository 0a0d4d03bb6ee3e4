//! Drain-time sample compression: delta + zero-run + Huffman coding of
//! integer sample arrays, written big-endian in 16-bit words.
//!
//! Only 8/16/32-bit integer records compress; a 32-bit array is treated
//! as two interleaved 16-bit channels where only the low half is
//! quantized. The layout of a compressed record is
//!
//! ```ignore
//! [FOURCC]['#' size repeat][uncompressed type/size/repeat]
//! {first full sample}({quantizer}{delta bitstream})*
//! ```
//!
//! with one quantizer + bitstream per channel. Whenever the compressed
//! form threatens to outgrow the raw form the record is stored
//! uncompressed instead, so compression can never lose data or space.

use crate::klv::{align4, RecordHeader};

/// One variable-length code.
struct Vlc {
    size: u16,
    bits: u16,
}

/// Codes for delta magnitudes `0..=15`; larger deltas escape to a raw
/// value. Non-zero magnitudes carry a trailing sign bit.
#[rustfmt::skip]
static HUFF_TABLE: [Vlc; 16] = [
    Vlc { size: 1, bits: 0b0 },
    Vlc { size: 2, bits: 0b10 },
    Vlc { size: 4, bits: 0b1100 },
    Vlc { size: 5, bits: 0b11010 },
    Vlc { size: 5, bits: 0b11011 },
    Vlc { size: 6, bits: 0b111000 },
    Vlc { size: 6, bits: 0b111001 },
    Vlc { size: 6, bits: 0b111010 },
    Vlc { size: 6, bits: 0b111011 },
    Vlc { size: 7, bits: 0b1111000 },
    Vlc { size: 7, bits: 0b1111001 },
    Vlc { size: 7, bits: 0b1111010 },
    Vlc { size: 7, bits: 0b1111011 },
    Vlc { size: 8, bits: 0b11111000 },
    Vlc { size: 8, bits: 0b11111001 },
    Vlc { size: 8, bits: 0b11111010 },
];

/// Control codes: escape (raw value follows) and end of channel.
static ESC_CODE: Vlc = Vlc { size: 8, bits: 0b11111011 };
static END_CODE: Vlc = Vlc { size: 8, bits: 0b11111100 };

struct RunCode {
    size: u16,
    count: u16,
    bits: u16,
}

/// Zero-run codes, ascending by run length. Runs are coded greedily
/// from the longest entry down; the remainder under 16 zeros is spent
/// as single `0` bits (the magnitude-zero code).
#[rustfmt::skip]
static ZERO_RUN_TABLE: [RunCode; 4] = [
    RunCode { size: 8, count: 16,   bits: 0b11111101 },
    RunCode { size: 8, count: 64,   bits: 0b11111110 },
    RunCode { size: 9, count: 256,  bits: 0b111111110 },
    RunCode { size: 9, count: 1024, bits: 0b111111111 },
];

const WORD_SIZE: u32 = 16;

/// Big-endian 16-bit word bitstream writer over a byte buffer.
struct Bitstream<'a> {
    buf: &'a mut [u8],
    /// Bytes written so far.
    used: usize,
    /// Writable byte budget.
    block_len: usize,
    bits_free: u32,
    word: u32,
    error: bool,
    bits_per_src_word: u32,
}

impl<'a> Bitstream<'a> {
    fn new(buf: &'a mut [u8], block_len: usize, bits_per_src_word: u32) -> Self {
        let block_len = block_len.min(buf.len());
        Self {
            buf,
            used: 0,
            block_len,
            bits_free: WORD_SIZE,
            word: 0,
            error: false,
            bits_per_src_word,
        }
    }

    fn put_word(&mut self, word: u16) {
        if self.used + 2 <= self.block_len {
            self.buf[self.used..self.used + 2].copy_from_slice(&word.to_be_bytes());
            self.used += 2;
        } else {
            self.error = true;
        }
    }

    fn put_bits(&mut self, bits: u32, nbits: u32) {
        let mask = |n: u32| (1_u32 << n) - 1;
        if self.bits_free == WORD_SIZE {
            self.word = bits & mask(nbits);
            self.bits_free -= nbits;
        } else if nbits <= self.bits_free {
            self.word = (self.word << nbits) | (bits & mask(nbits));
            self.bits_free -= nbits;
        } else {
            // fill the current word and start the next one
            let mut n = nbits;
            self.word <<= self.bits_free;
            n -= self.bits_free;
            self.word |= (bits >> n) & mask(self.bits_free);
            let word = self.word as u16;
            self.put_word(word);
            self.word = bits & mask(n);
            self.bits_free = WORD_SIZE - n;
        }
    }

    fn put_code(&mut self, code: &Vlc) -> u32 {
        self.put_bits(code.bits as u32, code.size as u32);
        code.size as u32
    }

    /// Codes a run of zero deltas, longest entries first.
    fn zero_run(&mut self, mut zeros: u32) -> u32 {
        let mut total = 0_u32;
        let mut i = ZERO_RUN_TABLE.len();
        while i > 0 && zeros > 0 {
            let entry = &ZERO_RUN_TABLE[i - 1];
            if entry.count as u32 > zeros {
                i -= 1;
            } else {
                self.put_bits(entry.bits as u32, entry.size as u32);
                zeros -= entry.count as u32;
                total += entry.size as u32;
            }
        }
        // the rest as single-zero codes
        self.put_bits(0, zeros);
        total + zeros
    }

    /// Codes one non-zero delta: Huffman magnitude plus sign bit, or
    /// escape plus the raw source-width value.
    fn put_value(&mut self, delta: i32) -> u32 {
        let mag = delta.unsigned_abs();
        if (mag as usize) < HUFF_TABLE.len() {
            let entry = &HUFF_TABLE[mag as usize];
            let mut bits = entry.bits as u32;
            let mut nbits = entry.size as u32;
            if mag != 0 {
                bits <<= 1;
                if delta < 0 {
                    bits |= 1;
                }
                nbits += 1;
            }
            self.put_bits(bits, nbits);
            nbits
        } else {
            let mut nbits = self.put_code(&ESC_CODE);
            let mask = (1_u32 << self.bits_per_src_word) - 1;
            self.put_bits(delta as u32 & mask, self.bits_per_src_word);
            nbits += self.bits_per_src_word;
            nbits
        }
    }

    fn flush(&mut self) {
        if self.bits_free < WORD_SIZE {
            let word = (self.word << self.bits_free) as u16;
            self.put_word(word);
            self.bits_free = WORD_SIZE;
            self.word = 0;
        }
    }
}

/// Reads one big-endian source element as a quantized signed value.
fn quantized(src: &[u8], bytesize: usize, signed: bool, index: usize, quant: u32) -> i32 {
    let at = 8 + index * bytesize;
    let raw: i32 = match (bytesize, signed) {
        (1, true) => src[at] as i8 as i32,
        (1, false) => src[at] as i32,
        (2, true) => i16::from_be_bytes([src[at], src[at + 1]]) as i32,
        _ => u16::from_be_bytes([src[at], src[at + 1]]) as i32,
    };
    raw / quant as i32
}

/// Compresses the first record of `src` into `dst`, falling back to a
/// verbatim copy of the whole region whenever compression would not
/// shrink it. Returns the bytes written to `dst`, or `0` if `dst`
/// cannot even hold the raw copy.
pub(crate) fn compress_record(dst: &mut [u8], src: &[u8], quantize: u32) -> usize {
    let payload_addition = src.len();
    if dst.len() < payload_addition || payload_addition < 12 || quantize == 0 {
        return fallback(dst, src);
    }
    let Some(hdr) = RecordHeader::peek(src, 0) else {
        return fallback(dst, src);
    };

    let repeat = hdr.repeat as usize;
    let mut quant_hi = quantize;
    let quant_lo = quantize;

    let (bytesize, signed) = match hdr.type_code {
        b'l' | b'L' => {
            // 32-bit data is coded as two 16-bit channels; the high
            // half must stay lossless
            quant_hi = 1;
            (2_usize, hdr.type_code == b'l')
        }
        b'b' => (1, true),
        b'B' => (1, false),
        b's' => (2, true),
        b'S' => (2, false),
        // do not compress other types of data
        _ => return fallback(dst, src),
    };
    let channels = hdr.sample_size as usize / bytesize;
    if channels == 0 || 8 + repeat * channels * bytesize > payload_addition {
        return fallback(dst, src);
    }

    // [key][size word, patched last][uncompressed type/size/repeat]
    dst[0..4].copy_from_slice(&src[0..4]);
    dst[4..8].fill(0);
    dst[8..12].copy_from_slice(&src[4..8]);
    let mut out_size = 12_usize;

    // first full sample stored as is
    let first = bytesize * channels;
    dst[12..12 + first].copy_from_slice(&src[8..8 + first]);
    out_size += first;
    let mut pos = channels; // element cursor relative to byte 12

    for chn in 0..channels {
        let quant = match chn & 1 {
            1 => quant_lo,
            _ => quant_hi,
        };
        let bufsize = payload_addition - out_size;

        let stream_at;
        if bytesize == 2 {
            dst[12 + 2 * pos..12 + 2 * pos + 2].copy_from_slice(&(quant as u16).to_be_bytes());
            pos += 1;
            stream_at = 12 + 2 * pos;
        } else {
            dst[12 + pos] = quant as u8;
            pos += 1;
            pos = (pos + 1) & !1; // compressed data is 16-bit aligned
            stream_at = 12 + pos;
        }
        out_size += 4;

        let totalbits = {
            let mut bs = Bitstream::new(&mut dst[stream_at..], bufsize, bytesize as u32 * 8);
            let mut totalbits = 0_u32;
            let mut zerorun = 0_u32;
            let mut too_big = false;

            for i in 1..repeat {
                let delta = quantized(src, bytesize, signed, i * channels + chn, quant)
                    - quantized(src, bytesize, signed, (i - 1) * channels + chn, quant);

                if delta == 0 {
                    zerorun += 1;
                    continue;
                }
                if zerorun > 0 {
                    totalbits += bs.zero_run(zerorun);
                    zerorun = 0;
                }
                totalbits += bs.put_value(delta);

                // make sure compressed is not larger than uncompressed
                if totalbits + 256 > bufsize as u32 * 8 {
                    too_big = true;
                    break;
                }
            }

            if !too_big {
                totalbits += bs.put_code(&END_CODE);
                bs.flush();
            }
            match too_big || bs.error {
                true => None,
                false => Some(totalbits),
            }
        };
        let Some(totalbits) = totalbits else {
            return fallback(dst, src);
        };

        let bytesadded = totalbits.div_ceil(8) as usize;
        let lastsize = out_size;
        out_size += bytesadded;
        out_size = (out_size + 1) & !1; // 16-bit aligned channel
        pos += (out_size - lastsize) >> (bytesize - 1);
    }

    out_size = align4(out_size);

    if out_size > payload_addition {
        return fallback(dst, src);
    }

    let compressed = RecordHeader::new(
        hdr.key,
        b'#',
        bytesize as u8,
        ((out_size - 8) / bytesize) as u16,
    );
    dst[4..8].copy_from_slice(&compressed.to_bytes()[4..8]);

    out_size
}

fn fallback(dst: &mut [u8], src: &[u8]) -> usize {
    if dst.len() < src.len() {
        return 0;
    }
    dst[..src.len()].copy_from_slice(src);
    src.len()
}
