//! Per-connection session state.
//!
//! Born on accept, dies on EOF or error. Removal from its room must
//! precede destruction, and the player record is flushed to the save
//! interface before the slot is released.

use std::net::SocketAddr;

use keystream::{Cipher, GcCipher, KeyFile, MultiKeyDetector, MultiKeyImitator, PcCipher};
use shipproto::handshake::{ServerInit, ServerInitV4, BLOCK_SEED_LEN};
use shipproto::Dialect;

use std::sync::Arc;

use crate::channel::Channel;
use crate::error::ShipError;
use crate::player::PlayerData;
use crate::rooms::RoomId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "C-{:X}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionFlags {
    pub is_ep3: bool,
    pub is_v1: bool,
    pub can_chat: bool,
    pub cheats_enabled: bool,
    pub infinite_hp: bool,
    pub infinite_tp: bool,
    pub switch_assist: bool,
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub addr: SocketAddr,
    pub dialect: Dialect,
    pub chan: Channel,
    pub flags: SessionFlags,
    pub logged_in: bool,
    /// Still syncing into a game (gates the loading-only subcommands).
    pub loading: bool,
    pub room: Option<RoomId>,
    /// Slot index in the current room; the wire-visible client id.
    pub slot: u8,
    /// Transient position, updated by movement subcommands.
    pub area: u8,
    pub x: f32,
    pub z: f32,
    /// Cache of the last switch-enable subcommand for switch-assist
    /// replay.
    pub last_switch_enabled: Option<Vec<u8>>,
    /// Shop inventory generated for the pending shop interaction.
    pub shop_contents: Vec<shipproto::ItemData>,
    pub player: PlayerData,
}

impl Session {
    pub fn new(id: SessionId, addr: SocketAddr, dialect: Dialect, chan: Channel) -> Session {
        let mut flags = SessionFlags {
            can_chat: true,
            ..SessionFlags::default()
        };
        flags.is_v1 = dialect == Dialect::V1;
        Session {
            id,
            addr,
            dialect,
            chan,
            flags,
            logged_in: false,
            loading: false,
            room: None,
            slot: 0,
            area: 0,
            x: 0.0,
            z: 0.0,
            last_switch_enabled: None,
            shop_contents: Vec::new(),
            player: PlayerData::default(),
        }
    }

    /// Send the cleartext server-init command, then install the ciphers
    /// it advertised. V1 keys the legacy cipher, V2/V3 the shift-register
    /// cipher; V4 builds a detector over the key pool for the inbound
    /// direction and its paired imitator for the outbound one.
    pub fn begin_handshake(
        &mut self,
        opcode: u16,
        copyright: &str,
        key_pool: &[Arc<KeyFile>],
        expected_first: &[u8],
    ) -> Result<(), ShipError> {
        match self.dialect {
            Dialect::V4 => {
                let mut server_seed = [0u8; BLOCK_SEED_LEN];
                let mut client_seed = [0u8; BLOCK_SEED_LEN];
                fill_random(&mut server_seed);
                fill_random(&mut client_seed);
                let init = ServerInitV4 {
                    copyright: copyright.to_string(),
                    server_seed,
                    client_seed,
                };
                self.chan.send(opcode, 0, &init.encode())?;

                let detector = MultiKeyDetector::new(
                    key_pool.to_vec(),
                    expected_first.to_vec(),
                    client_seed.to_vec(),
                );
                let imitator =
                    MultiKeyImitator::new(detector.shared(), server_seed.to_vec(), true);
                self.chan
                    .set_cipher(Cipher::Detector(detector), Cipher::Imitator(imitator));
            }
            _ => {
                let server_key = random_u32();
                let client_key = random_u32();
                let init = ServerInit {
                    copyright: copyright.to_string(),
                    server_key,
                    client_key,
                    after_message: String::new(),
                };
                self.chan.send(opcode, 0, &init.encode())?;

                let (crypt_in, crypt_out) = match self.dialect {
                    Dialect::V1 => (
                        Cipher::Pc(PcCipher::new(client_key)),
                        Cipher::Pc(PcCipher::new(server_key)),
                    ),
                    _ => (
                        Cipher::Gc(GcCipher::new(client_key)),
                        Cipher::Gc(GcCipher::new(server_key)),
                    ),
                };
                self.chan.set_cipher(crypt_in, crypt_out);
            }
        }
        Ok(())
    }

    /// Restore a player record delivered by the save layer.
    pub fn load_player(&mut self, bytes: &[u8]) -> Result<(), ShipError> {
        self.player = PlayerData::from_bytes(bytes)
            .map_err(|_| ShipError::Unsupported("malformed player record"))?;
        Ok(())
    }

    /// Serialize the player record for the save layer.
    pub fn save_player(&self) -> Vec<u8> {
        self.player.to_bytes()
    }
}

fn fill_random(buf: &mut [u8]) {
    getrandom::getrandom(buf).expect("getrandom");
}

fn random_u32() -> u32 {
    let mut b = [0u8; 4];
    fill_random(&mut b);
    u32::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn session(dialect: Dialect) -> (Session, mpsc::UnboundedReceiver<bytes::Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let chan = Channel::new(dialect, tx);
        (
            Session::new(SessionId(1), "127.0.0.1:9000".parse().unwrap(), dialect, chan),
            rx,
        )
    }

    #[test]
    fn v2_handshake_keys_both_directions() {
        let (mut s, mut rx) = session(Dialect::V2);
        s.begin_handshake(0x17, "copyright text", &[], &[]).unwrap();
        // The init frame itself left in cleartext.
        let wire = rx.try_recv().unwrap();
        assert_eq!(wire[0], 0x17);
        let init = ServerInit::decode(&wire[4..]).unwrap();
        assert_eq!(init.copyright, "copyright text");
        assert!(s.chan.has_cipher());

        // The client can decrypt the next command with the advertised
        // server key.
        s.chan.send(0x1D, 0, &[]).unwrap();
        let mut enc = rx.try_recv().unwrap().to_vec();
        GcCipher::new(init.server_key).apply(&mut enc, true).unwrap();
        assert_eq!(enc[0], 0x1D);
    }

    #[test]
    fn v4_handshake_installs_detector_pair() {
        let key = Arc::new(keystream_test_key());
        let (mut s, mut rx) = session(Dialect::V4);
        s.begin_handshake(0x9B, "game server", &[key], &[0x93, 0, 8, 0, 0, 0, 0, 0])
            .unwrap();
        let wire = rx.try_recv().unwrap();
        let init = ServerInitV4::decode(&wire[8..]).unwrap();
        assert_ne!(init.server_seed, init.client_seed);
        assert!(s.chan.has_cipher());
    }

    fn keystream_test_key() -> KeyFile {
        KeyFile {
            subtype: keystream::BbSubtype::Standard,
            initial_key: [3u8; 0x48],
            private_key: Box::new([7u8; 0x1000]),
        }
    }

    #[test]
    fn player_record_round_trip() {
        let (mut s, _rx) = session(Dialect::V4);
        s.player.name = "Ash".into();
        let bytes = s.save_player();
        let (mut s2, _rx2) = session(Dialect::V4);
        s2.load_player(&bytes).unwrap();
        assert_eq!(s2.player.name, "Ash");
    }
}
