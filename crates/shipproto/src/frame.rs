//! Command frame header codec.
//!
//! Layouts (size includes the header):
//! - V1/V2/V3a: `{u8 opcode, u8 flag, u16le size}`
//! - V3b:       `{u8 opcode, u8 flag, u16be size}`
//! - V4:        `{u16le opcode, u16le flag_lo, u32le size}` (flag is 32-bit
//!   on the wire path even though only the low 16 bits travel)

use bytes::Bytes;

use crate::{Dialect, ProtoError};

pub const MAX_FRAME_LEN: usize = 0x10000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u16,
    pub flag: u32,
    pub payload: Bytes,
}

/// Encode a header into `out[..header_size]`. `total` is the full padded
/// frame length.
pub fn encode_header(dialect: Dialect, opcode: u16, flag: u32, total: usize, out: &mut [u8]) {
    match dialect {
        Dialect::V1 | Dialect::V2 | Dialect::V3a => {
            out[0] = opcode as u8;
            out[1] = flag as u8;
            out[2..4].copy_from_slice(&(total as u16).to_le_bytes());
        }
        Dialect::V3b => {
            out[0] = opcode as u8;
            out[1] = flag as u8;
            out[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        }
        Dialect::V4 => {
            out[0..2].copy_from_slice(&opcode.to_le_bytes());
            out[2..4].copy_from_slice(&(flag as u16).to_le_bytes());
            out[4..8].copy_from_slice(&(total as u32).to_le_bytes());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub opcode: u16,
    pub flag: u32,
    pub total: usize,
}

/// Decode a header from the first `header_size` bytes. Validates the
/// declared length against the header size, the frame cap, and the
/// dialect's cipher alignment.
pub fn decode_header(dialect: Dialect, data: &[u8]) -> Result<Header, ProtoError> {
    let hs = dialect.header_size();
    if data.len() < hs {
        return Err(ProtoError::TooShort {
            need: hs,
            got: data.len(),
        });
    }
    let h = match dialect {
        Dialect::V1 | Dialect::V2 | Dialect::V3a => Header {
            opcode: data[0] as u16,
            flag: data[1] as u32,
            total: u16::from_le_bytes([data[2], data[3]]) as usize,
        },
        Dialect::V3b => Header {
            opcode: data[0] as u16,
            flag: data[1] as u32,
            total: u16::from_be_bytes([data[2], data[3]]) as usize,
        },
        Dialect::V4 => Header {
            opcode: u16::from_le_bytes([data[0], data[1]]),
            flag: u16::from_le_bytes([data[2], data[3]]) as u32,
            total: u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize,
        },
    };
    if h.total < hs {
        return Err(ProtoError::BadFrame("declared length below header size"));
    }
    if h.total > MAX_FRAME_LEN {
        return Err(ProtoError::BadFrame("declared length above frame cap"));
    }
    if h.total % dialect.cipher_alignment() != 0 {
        return Err(ProtoError::BadFrame("declared length not cipher-aligned"));
    }
    Ok(h)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_header_layout() {
        let mut out = [0u8; 4];
        encode_header(Dialect::V1, 0x05, 0x00, 0x0C, &mut out);
        assert_eq!(out, [0x05, 0x00, 0x0C, 0x00]);
        let h = decode_header(Dialect::V1, &out).unwrap();
        assert_eq!((h.opcode, h.flag, h.total), (0x05, 0x00, 0x0C));
    }

    #[test]
    fn v3b_swaps_the_size_field() {
        let mut out = [0u8; 4];
        encode_header(Dialect::V3b, 0x60, 0x02, 0x0140, &mut out);
        assert_eq!(out, [0x60, 0x02, 0x01, 0x40]);
        let h = decode_header(Dialect::V3b, &out).unwrap();
        assert_eq!(h.total, 0x0140);
    }

    #[test]
    fn v4_header_layout() {
        let mut out = [0u8; 8];
        encode_header(Dialect::V4, 0x00E6, 0x0001_0002, 0x18, &mut out);
        // Only the low 16 bits of the flag travel.
        assert_eq!(out, [0xE6, 0x00, 0x02, 0x00, 0x18, 0x00, 0x00, 0x00]);
        let h = decode_header(Dialect::V4, &out).unwrap();
        assert_eq!((h.opcode, h.flag, h.total), (0x00E6, 0x0002, 0x18));
    }

    #[test]
    fn rejects_undersized_declared_length() {
        let mut out = [0u8; 4];
        encode_header(Dialect::V1, 0x05, 0, 0, &mut out);
        assert!(matches!(
            decode_header(Dialect::V1, &out),
            Err(ProtoError::BadFrame(_))
        ));
    }

    #[test]
    fn rejects_unaligned_declared_length() {
        // 4-byte header claiming 10 total bytes under a 4-byte alignment.
        let out = [0x60, 0x00, 0x0A, 0x00];
        assert!(matches!(
            decode_header(Dialect::V1, &out),
            Err(ProtoError::BadFrame(_))
        ));
    }

    #[test]
    fn rejects_oversized_declared_length() {
        let mut out = [0u8; 8];
        out[0..2].copy_from_slice(&0x60u16.to_le_bytes());
        out[4..8].copy_from_slice(&0x20000u32.to_le_bytes());
        assert!(matches!(
            decode_header(Dialect::V4, &out),
            Err(ProtoError::BadFrame(_))
        ));
    }
}
