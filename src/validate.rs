//! Structural validation of assembled payloads.

use crate::klv::RecordHeader;
use crate::FourCC;

/// Tests whether `buffer` is a well-formed GPMF tree starting with a
/// `DEVC` nest. With `recurse` every nest level is checked; without it
/// only the top level. Succeeds only when the walk exactly consumes
/// the buffer (chunk padding of end markers included).
pub fn is_valid_gpmf(buffer: &[u8], recurse: bool) -> bool {
    is_valid(buffer, recurse, 0)
}

fn is_valid(buffer: &[u8], recurse: bool, level: u32) -> bool {
    let size = buffer.len();
    let mut pos = 0_usize;
    let mut first = true;

    while pos < size {
        if size - pos >= 4 && buffer[pos..pos + 4] == FourCC::END.0 {
            // chunk padding between or after records
            if first && level == 0 {
                return false;
            }
            pos += 4;
            continue;
        }
        if pos + 8 > size {
            return false;
        }
        let Some(hdr) = RecordHeader::peek(buffer, pos) else {
            return false;
        };
        if level == 0 && hdr.key != FourCC::DEVC {
            return false;
        }
        if !hdr.key.is_valid() {
            return false;
        }

        let datasize = hdr.data_size();
        if pos + 8 + datasize > size {
            return false;
        }
        if recurse
            && hdr.type_code == 0
            && !is_valid(&buffer[pos + 8..pos + 8 + datasize], recurse, level + 1)
        {
            return false;
        }

        first = false;
        pos += 8 + datasize;
    }

    pos == size
}
