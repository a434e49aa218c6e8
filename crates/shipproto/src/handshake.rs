//! Server-init (handshake) payload codec.
//!
//! Opcodes 0x02, 0x17, 0x91 and 0x9B all carry this payload. It is sent in
//! cleartext; both sides install their ciphers from the embedded keys
//! immediately after it.

use crate::ProtoError;

/// Opcodes that carry a server-init payload.
pub const HANDSHAKE_OPCODES: [u16; 4] = [0x02, 0x17, 0x91, 0x9B];

pub fn is_handshake_opcode(opcode: u16) -> bool {
    HANDSHAKE_OPCODES.contains(&opcode)
}

const STREAM_COPYRIGHT_LEN: usize = 0x40;
const BLOCK_COPYRIGHT_LEN: usize = 0x60;
pub const BLOCK_SEED_LEN: usize = 0x30;

/// V1–V3 form: two 32-bit cipher seeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInit {
    pub copyright: String,
    pub server_key: u32,
    pub client_key: u32,
    pub after_message: String,
}

impl ServerInit {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(STREAM_COPYRIGHT_LEN + 8 + self.after_message.len());
        out.extend_from_slice(&pad_text(&self.copyright, STREAM_COPYRIGHT_LEN));
        out.extend_from_slice(&self.server_key.to_le_bytes());
        out.extend_from_slice(&self.client_key.to_le_bytes());
        out.extend_from_slice(self.after_message.as_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<ServerInit, ProtoError> {
        let need = STREAM_COPYRIGHT_LEN + 8;
        if data.len() < need {
            return Err(ProtoError::TooShort {
                need,
                got: data.len(),
            });
        }
        Ok(ServerInit {
            copyright: text_from(&data[..STREAM_COPYRIGHT_LEN]),
            server_key: u32::from_le_bytes(data[0x40..0x44].try_into().unwrap()),
            client_key: u32::from_le_bytes(data[0x44..0x48].try_into().unwrap()),
            after_message: text_from(&data[need..]),
        })
    }
}

/// V4 form: two 48-byte cipher seeds for the multi-key detector/imitator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInitV4 {
    pub copyright: String,
    pub server_seed: [u8; BLOCK_SEED_LEN],
    pub client_seed: [u8; BLOCK_SEED_LEN],
}

impl ServerInitV4 {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOCK_COPYRIGHT_LEN + 2 * BLOCK_SEED_LEN);
        out.extend_from_slice(&pad_text(&self.copyright, BLOCK_COPYRIGHT_LEN));
        out.extend_from_slice(&self.server_seed);
        out.extend_from_slice(&self.client_seed);
        out
    }

    pub fn decode(data: &[u8]) -> Result<ServerInitV4, ProtoError> {
        let need = BLOCK_COPYRIGHT_LEN + 2 * BLOCK_SEED_LEN;
        if data.len() < need {
            return Err(ProtoError::TooShort {
                need,
                got: data.len(),
            });
        }
        let mut server_seed = [0u8; BLOCK_SEED_LEN];
        let mut client_seed = [0u8; BLOCK_SEED_LEN];
        server_seed.copy_from_slice(&data[0x60..0x60 + BLOCK_SEED_LEN]);
        client_seed.copy_from_slice(&data[0x90..0x90 + BLOCK_SEED_LEN]);
        Ok(ServerInitV4 {
            copyright: text_from(&data[..BLOCK_COPYRIGHT_LEN]),
            server_seed,
            client_seed,
        })
    }
}

fn pad_text(s: &str, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let bytes = s.as_bytes();
    let n = bytes.len().min(len - 1); // keep at least one NUL
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn text_from(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_form_round_trips() {
        let init = ServerInit {
            copyright: "DreamCast Lobby Server.".to_string(),
            server_key: 0x1122_3344,
            client_key: 0xAABB_CCDD,
            after_message: "welcome".to_string(),
        };
        let enc = init.encode();
        assert_eq!(&enc[0x40..0x44], &0x1122_3344u32.to_le_bytes());
        let dec = ServerInit::decode(&enc).unwrap();
        assert_eq!(dec, init);
    }

    #[test]
    fn block_form_round_trips() {
        let init = ServerInitV4 {
            copyright: "Game Server.".to_string(),
            server_seed: [0x11; BLOCK_SEED_LEN],
            client_seed: [0x22; BLOCK_SEED_LEN],
        };
        let dec = ServerInitV4::decode(&init.encode()).unwrap();
        assert_eq!(dec, init);
    }

    #[test]
    fn truncated_payload_rejected() {
        assert!(matches!(
            ServerInit::decode(&[0u8; 0x40]),
            Err(ProtoError::TooShort { .. })
        ));
    }

    #[test]
    fn handshake_opcode_set() {
        assert!(is_handshake_opcode(0x02));
        assert!(is_handshake_opcode(0x9B));
        assert!(!is_handshake_opcode(0x60));
    }
}
