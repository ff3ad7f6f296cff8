//! CRC32C checksums and the 5-byte block trailer.
//!
//! Every block appended to any log ends with the same trailer:
//!
//! ```text
//! +------------------+--------------+---------------------------+
//! | payload          | type (1 byte)| crc32c(payload||type), LE |
//! +------------------+--------------+---------------------------+
//! ```
//!
//! The type byte records how the payload is encoded (`0` = raw,
//! `1` = snappy); the checksum covers the payload plus the type byte so a
//! flipped compression tag is caught as corruption.

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISCSI};

use crate::corruption;
use crate::error::Result;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Length of the per-block trailer: type byte plus CRC32C.
pub const BLOCK_TRAILER_LEN: usize = 5;

/// Payload stored raw.
pub const TYPE_RAW: u8 = 0;
/// Payload compressed with snappy.
pub const TYPE_SNAPPY: u8 = 1;

/// CRC32C of `data`.
pub fn crc32c(data: &[u8]) -> u32 {
    CRC32C.checksum(data)
}

/// CRC32C over two concatenated byte runs without copying them together.
pub fn crc32c_extended(a: &[u8], b: &[u8]) -> u32 {
    let mut digest = CRC32C.digest();
    digest.update(a);
    digest.update(b);
    digest.finalize()
}

/// Appends the 5-byte trailer for `payload` (the bytes already in `buf`
/// starting at `payload_start`) encoded as `ctype`.
pub fn append_trailer(buf: &mut Vec<u8>, payload_start: usize, ctype: u8) {
    let crc = crc32c_extended(&buf[payload_start..], &[ctype]);
    buf.push(ctype);
    let mut crc_bytes = [0u8; 4];
    LittleEndian::write_u32(&mut crc_bytes, crc);
    buf.extend_from_slice(&crc_bytes);
}

/// Splits a stored block into `(payload, ctype)`, optionally verifying the
/// trailer checksum. The input must include the trailer.
pub fn strip_trailer(block: &[u8], verify: bool) -> Result<(&[u8], u8)> {
    if block.len() < BLOCK_TRAILER_LEN {
        return Err(corruption!(
            "block shorter than trailer: {} bytes",
            block.len()
        ));
    }
    let payload_len = block.len() - BLOCK_TRAILER_LEN;
    let payload = &block[..payload_len];
    let ctype = block[payload_len];
    if verify {
        let stored = LittleEndian::read_u32(&block[payload_len + 1..]);
        let actual = crc32c_extended(payload, &[ctype]);
        if stored != actual {
            return Err(corruption!(
                "block checksum mismatch: stored {stored:#010x}, computed {actual:#010x}"
            ));
        }
    }
    Ok((payload, ctype))
}
