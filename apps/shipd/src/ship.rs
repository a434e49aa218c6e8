//! The ship: one state task owning every session and room.
//!
//! Network tasks only shuttle bytes. All protocol and game state lives
//! here and is mutated from a single task, so no handler ever observes a
//! partially-updated room. Reader tasks push `ShipEvent`s in; outbound
//! frames leave through each session's writer channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{info, warn};

use keystream::KeyFile;
use shipproto::frame::Frame;
use shipproto::handshake::is_handshake_opcode;
use shipproto::subcmd::is_envelope_opcode;
use shipproto::Dialect;

use crate::cards::CardIndex;
use crate::channel::Channel;
use crate::config::Config;
use crate::drops::{CommonItems, RareItemSet};
use crate::error::{Severity, ShipError};
use crate::levels::LevelTable;
use crate::quests::QuestIndex;
use crate::rooms::{Enemy, Room, RoomId};
use crate::session::{Session, SessionId};
use crate::subcmd;

/// Commands handled at the framing layer rather than the dispatcher.
const CMD_DISCONNECT: u16 = 0x05;
const CMD_CHAT: u16 = 0x06;
const CMD_JOIN_GAME: u16 = 0x10;
const CMD_FILE_CHUNK: u16 = 0x13;
const CMD_PING: u16 = 0x1D;
const CMD_FILE_OPEN: u16 = 0x44;
const CMD_LOBBY_JOINED: u16 = 0x67;
const CMD_PEER_JOINED: u16 = 0x68;
const CMD_PEER_LEFT: u16 = 0x69;
const CMD_DONE_LOADING: u16 = 0x6F;
const CMD_QUEST_REQUEST: u16 = 0xA9;
const CMD_CREATE_GAME: u16 = 0xC1;
const LOGIN_OPCODES: [u16; 4] = [0x93, 0x9A, 0x9D, 0x9E];

const FILE_CHUNK_SIZE: usize = 0x400;

#[derive(Debug)]
pub enum ShipEvent {
    Accept {
        sid: SessionId,
        addr: SocketAddr,
        dialect: Dialect,
        out: mpsc::UnboundedSender<Bytes>,
    },
    Data(SessionId, Bytes),
    Closed(SessionId),
}

/// Where player records go when a session ends. Save storage itself
/// lives outside the core.
pub trait SaveSink: Send {
    fn store(&mut self, name: &str, bytes: &[u8]);
    fn load(&mut self, name: &str) -> Option<Vec<u8>>;
}

pub struct NullSaves;

impl SaveSink for NullSaves {
    fn store(&mut self, _name: &str, _bytes: &[u8]) {}
    fn load(&mut self, _name: &str) -> Option<Vec<u8>> {
        None
    }
}

/// Flat-directory save store, one JSON record per character name.
pub struct DirSaves {
    pub dir: PathBuf,
}

impl SaveSink for DirSaves {
    fn store(&mut self, name: &str, bytes: &[u8]) {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return;
        }
        let path = self.dir.join(format!("{name}.json"));
        let tmp = self.dir.join(format!("{name}.json.tmp"));
        if std::fs::write(&tmp, bytes).and_then(|_| std::fs::rename(&tmp, &path)).is_err() {
            warn!(name, "failed to persist player record");
        }
    }

    fn load(&mut self, name: &str) -> Option<Vec<u8>> {
        std::fs::read(self.dir.join(format!("{name}.json"))).ok()
    }
}

pub struct Ship {
    pub name: String,
    pub copyright: String,
    pub item_tracking_default: bool,
    pub cheats_default: bool,
    pub expected_first: Vec<u8>,
    pub key_pool: Vec<Arc<KeyFile>>,
    pub sessions: HashMap<SessionId, Session>,
    pub rooms: HashMap<RoomId, Room>,
    next_room: RoomId,
    pub level_table: Arc<LevelTable>,
    pub rare_items: Option<Arc<RareItemSet>>,
    pub common_items: Arc<dyn CommonItems + Send + Sync>,
    pub quest_index: Arc<QuestIndex>,
    pub card_index: Option<Arc<CardIndex>>,
    pub saves: Box<dyn SaveSink>,
}

impl Ship {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: &Config,
        level_table: Arc<LevelTable>,
        rare_items: Option<Arc<RareItemSet>>,
        common_items: Arc<dyn CommonItems + Send + Sync>,
        quest_index: Arc<QuestIndex>,
        card_index: Option<Arc<CardIndex>>,
        saves: Box<dyn SaveSink>,
    ) -> Ship {
        Ship {
            name: cfg.file.name.clone(),
            copyright: "Ship Server. Copyright on file.".to_string(),
            item_tracking_default: cfg.file.item_tracking_enabled,
            cheats_default: cfg.file.cheats_enabled,
            expected_first: cfg.file.expected_first_command.clone(),
            key_pool: cfg.key_pool.clone(),
            sessions: HashMap::new(),
            rooms: HashMap::new(),
            next_room: 1,
            level_table,
            rare_items,
            common_items,
            quest_index,
            card_index,
            saves,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ShipEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                ShipEvent::Accept {
                    sid,
                    addr,
                    dialect,
                    out,
                } => self.accept(sid, addr, dialect, out),
                ShipEvent::Data(sid, data) => self.on_data(sid, &data),
                ShipEvent::Closed(sid) => self.disconnect_session(sid),
            }
        }
    }

    pub fn accept(
        &mut self,
        sid: SessionId,
        addr: SocketAddr,
        dialect: Dialect,
        out: mpsc::UnboundedSender<Bytes>,
    ) {
        let chan = Channel::new(dialect, out);
        let mut session = Session::new(sid, addr, dialect, chan);
        info!(%sid, %addr, %dialect, "client connected");
        if let Err(e) =
            session.begin_handshake(0x02, &self.copyright, &self.key_pool, &self.expected_first)
        {
            warn!(%sid, err = %e, "handshake failed");
            return;
        }
        self.sessions.insert(sid, session);
    }

    pub fn on_data(&mut self, sid: SessionId, data: &[u8]) {
        let Some(session) = self.sessions.get_mut(&sid) else {
            return;
        };
        let frames = match session.chan.push(data) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(%sid, err = %e, "bad inbound stream; disconnecting");
                self.disconnect_session(sid);
                return;
            }
        };
        for frame in frames {
            if let Err(e) = self.handle_frame(sid, &frame) {
                match e.severity() {
                    Severity::Protocol => {
                        warn!(%sid, opcode = format_args!("{:02X}", frame.opcode), err = %e,
                            "protocol error; disconnecting");
                        self.disconnect_session(sid);
                        return;
                    }
                    _ => {
                        info!(%sid, err = %e, "command dropped");
                    }
                }
            }
            if !self.sessions.contains_key(&sid) {
                return; // frame handler disconnected us
            }
        }
    }

    fn handle_frame(&mut self, sid: SessionId, frame: &Frame) -> Result<(), ShipError> {
        if is_envelope_opcode(frame.opcode) {
            return subcmd::on_subcommand(self, sid, frame.opcode, frame.flag, &frame.payload);
        }
        if LOGIN_OPCODES.contains(&frame.opcode) {
            return self.on_login(sid);
        }
        if is_handshake_opcode(frame.opcode) {
            // Clients never send server-init.
            return Err(ShipError::Proto(shipproto::ProtoError::BadFrame(
                "server-init from client",
            )));
        }
        match frame.opcode {
            CMD_PING => {
                self.send_to_session(sid, CMD_PING, 0, &[]);
                Ok(())
            }
            CMD_DISCONNECT => {
                self.disconnect_session(sid);
                Ok(())
            }
            CMD_CHAT => {
                let Some(session) = self.sessions.get(&sid) else {
                    return Ok(());
                };
                if !session.flags.can_chat {
                    return Ok(());
                }
                let Some(rid) = session.room else {
                    return Ok(());
                };
                let slot = session.slot as u32;
                let payload = frame.payload.to_vec();
                self.broadcast(rid, CMD_CHAT, slot, &payload, Some(sid));
                Ok(())
            }
            CMD_DONE_LOADING => {
                if let Some(session) = self.sessions.get_mut(&sid) {
                    session.loading = false;
                }
                Ok(())
            }
            CMD_CREATE_GAME => self.on_create_game(sid, &frame.payload),
            CMD_JOIN_GAME => self.join_room(sid, frame.flag),
            CMD_QUEST_REQUEST => self.send_quest(sid, frame.flag),
            other => {
                warn!(%sid, opcode = format_args!("{other:02X}"), "unknown opcode");
                Err(ShipError::Proto(shipproto::ProtoError::BadFrame(
                    "unknown opcode",
                )))
            }
        }
    }

    fn on_login(&mut self, sid: SessionId) -> Result<(), ShipError> {
        let card_capable = self.card_index.is_some();
        let Some(session) = self.sessions.get_mut(&sid) else {
            return Ok(());
        };
        if session.logged_in {
            return Ok(());
        }
        session.logged_in = true;
        // Console clients are card-capable when the ship carries the card
        // tables; the login payload's sub-version refinement is left to
        // the login server.
        if matches!(session.dialect, Dialect::V3a | Dialect::V3b) && card_capable {
            session.flags.is_ep3 = true;
        }
        if let Some(bytes) = self.saves.load(&self.sessions[&sid].player.name.clone()) {
            let _ = self
                .sessions
                .get_mut(&sid)
                .expect("session exists")
                .load_player(&bytes);
        }
        self.join_lobby(sid)
    }

    /// Stream a quest's bin/dat pair: one file-open command per file,
    /// then fixed-size chunks with the chunk index in the flag.
    fn send_quest(&mut self, sid: SessionId, quest_id: u32) -> Result<(), ShipError> {
        let dialect = self
            .sessions
            .get(&sid)
            .map(|s| s.dialect)
            .ok_or(ShipError::NoSuchQuest(quest_id))?;
        let quest_index = self.quest_index.clone();
        let quest = quest_index
            .get(dialect, quest_id)
            .ok_or(ShipError::NoSuchQuest(quest_id))?;

        for (ext, contents) in [("bin", &quest.bin), ("dat", &quest.dat)] {
            let name = format!("quest{quest_id}.{ext}");
            let mut open = vec![0u8; 0x20 + 4];
            open[..name.len().min(0x1F)].copy_from_slice(&name.as_bytes()[..name.len().min(0x1F)]);
            open[0x20..].copy_from_slice(&(contents.len() as u32).to_le_bytes());
            self.send_to_session(sid, CMD_FILE_OPEN, 0, &open);
            for (index, chunk) in contents.chunks(FILE_CHUNK_SIZE).enumerate() {
                self.send_to_session(sid, CMD_FILE_CHUNK, index as u32, chunk);
            }
        }
        info!(%sid, quest = quest_id, "quest sent");
        Ok(())
    }

    /// Push the compressed card catalogue and map list to a freshly
    /// seated card-capable client.
    fn send_card_static_data(&mut self, sid: SessionId) {
        let Some(index) = self.card_index.clone() else {
            return;
        };
        for (subsub, blob) in [
            (0x40u8, index.compressed_map_list()),
            (0x41u8, index.compressed_card_definitions()),
        ] {
            // 6xB6 extended-size envelope: these blobs exceed the 8-bit
            // word count.
            let mut payload = Vec::with_capacity(16 + blob.len());
            payload.extend_from_slice(&[0xB6, 0x00, 0x00, 0x00]);
            payload.extend_from_slice(&0u32.to_le_bytes());
            payload.push(subsub);
            payload.extend_from_slice(&[0, 0, 0]);
            payload.extend_from_slice(&(blob.len() as u16).to_le_bytes());
            payload.extend_from_slice(&0u16.to_le_bytes());
            payload.extend_from_slice(blob);
            let padded = (payload.len() + 3) & !3;
            payload.resize(padded, 0);
            let size = (payload.len() as u32).to_le_bytes();
            payload[4..8].copy_from_slice(&size);
            self.send_to_session(sid, 0x6C, 0, &payload);
        }
    }

    /// Payload: difficulty u8, episode u8, section_id u8, card u8.
    fn on_create_game(&mut self, sid: SessionId, payload: &[u8]) -> Result<(), ShipError> {
        if payload.len() < 4 {
            return Err(ShipError::Proto(shipproto::ProtoError::TooShort {
                need: 4,
                got: payload.len(),
            }));
        }
        let (difficulty, episode, section_id, card) =
            (payload[0].min(3), payload[1].clamp(1, 3), payload[2].min(9), payload[3] != 0);
        let dialect = self.sessions[&sid].dialect;
        if card && !self.sessions[&sid].flags.is_ep3 {
            return Ok(());
        }

        self.leave_current_room(sid);
        let rid = self.next_room;
        self.next_room += 1;
        let mut room = Room::new_game(
            rid,
            dialect,
            episode,
            difficulty,
            section_id,
            card,
            self.item_tracking_default && dialect == Dialect::V4,
            room_seed(),
        );
        room.cheats_enabled = self.cheats_default;
        if dialect == Dialect::V4 && !card {
            room.set_enemies(default_enemy_table(episode));
        }
        self.rooms.insert(rid, room);
        info!(room = rid, episode, difficulty, card, "game created");
        self.seat(sid, rid)
    }

    pub fn join_room(&mut self, sid: SessionId, rid: RoomId) -> Result<(), ShipError> {
        let room = self.rooms.get(&rid).ok_or(ShipError::NoSuchRoom(rid))?;
        if room.quarantined {
            return Err(ShipError::NoSuchRoom(rid));
        }
        let dialect = self.sessions[&sid].dialect;
        if room.dialect != dialect {
            return Err(ShipError::NoSuchRoom(rid));
        }
        self.leave_current_room(sid);
        self.seat(sid, rid)
    }

    fn join_lobby(&mut self, sid: SessionId) -> Result<(), ShipError> {
        let dialect = self.sessions[&sid].dialect;
        let existing = self
            .rooms
            .values()
            .filter(|r| !r.is_game && r.dialect == dialect && !r.quarantined)
            .find(|r| r.occupant_count() < r.capacity())
            .map(|r| r.id);
        let rid = match existing {
            Some(rid) => rid,
            None => {
                let rid = self.next_room;
                self.next_room += 1;
                let mut lobby = Room::new_lobby(rid, dialect, room_seed());
                lobby.card_battle = self.sessions[&sid].flags.is_ep3;
                self.rooms.insert(rid, lobby);
                rid
            }
        };
        self.seat(sid, rid)
    }

    fn seat(&mut self, sid: SessionId, rid: RoomId) -> Result<(), ShipError> {
        let room = self.rooms.get_mut(&rid).ok_or(ShipError::NoSuchRoom(rid))?;
        let slot = room.add(sid)?;
        let leader = room.leader as u8;
        let is_game = room.is_game;

        // In rooms where the server owns item state, the inventory the
        // player brought in is re-identified from the room counter so
        // item ids stay room-unique.
        if is_game && room.dialect == Dialect::V4 && room.item_tracking {
            let count = self.sessions[&sid].player.inventory.len();
            let ids: Vec<u32> = (0..count)
                .map(|_| room.generate_item_id(slot as u8))
                .collect();
            let player = &mut self.sessions.get_mut(&sid).expect("session exists").player;
            for (item, id) in player.inventory.iter_mut().zip(ids) {
                item.id = id;
            }
        }

        {
            let session = self.sessions.get_mut(&sid).expect("session exists");
            session.room = Some(rid);
            session.slot = slot as u8;
            session.loading = is_game;
        }

        // Tell the joiner where it landed, then announce to peers.
        let mut joined = vec![slot as u8, leader, is_game as u8, 0];
        joined.extend_from_slice(&rid.to_le_bytes());
        self.send_to_session(sid, CMD_LOBBY_JOINED, slot as u32, &joined);
        let announce = [slot as u8, leader, 0, 0];
        self.broadcast(rid, CMD_PEER_JOINED, slot as u32, &announce, Some(sid));
        info!(%sid, room = rid, slot, "joined room");

        let card_room = self.rooms[&rid].card_battle;
        if card_room && self.sessions[&sid].flags.is_ep3 {
            self.send_card_static_data(sid);
        }
        Ok(())
    }

    /// Remove a session from its room, publishing the departure and any
    /// leader change. Empty non-lobby rooms are torn down.
    pub fn leave_current_room(&mut self, sid: SessionId) {
        let Some(session) = self.sessions.get_mut(&sid) else {
            return;
        };
        let Some(rid) = session.room.take() else {
            return;
        };
        let Some(room) = self.rooms.get_mut(&rid) else {
            return;
        };
        let Some(slot) = room.slot_of(sid) else {
            return;
        };
        let new_leader = room.remove(slot);
        let leader_now = room.leader as u8;
        let empty_game = room.is_game && room.is_empty();
        let watcher_cleanup: Vec<RoomId> = if empty_game {
            room.watcher_rooms.clone()
        } else {
            Vec::new()
        };

        let left = [slot as u8, leader_now, 0, 0];
        self.broadcast(rid, CMD_PEER_LEFT, slot as u32, &left, None);
        if let Some(leader_slot) = new_leader {
            info!(room = rid, slot = leader_slot, "leader changed");
        }
        if empty_game {
            self.rooms.remove(&rid);
            for wid in watcher_cleanup {
                if let Some(w) = self.rooms.get_mut(&wid) {
                    w.watcher_rooms.retain(|r| *r != rid);
                }
            }
            info!(room = rid, "empty game removed");
        }
    }

    /// Full teardown: leave the room in the same tick, flush the save,
    /// drop the channel.
    pub fn disconnect_session(&mut self, sid: SessionId) {
        self.leave_current_room(sid);
        if let Some(mut session) = self.sessions.remove(&sid) {
            let name = session.player.name.clone();
            if !name.is_empty() {
                let bytes = session.save_player();
                self.saves.store(&name, &bytes);
            }
            session.chan.disconnect();
            info!(%sid, "client disconnected");
        }
    }

    pub fn send_to_session(&mut self, sid: SessionId, opcode: u16, flag: u32, payload: &[u8]) {
        if let Some(session) = self.sessions.get_mut(&sid) {
            if let Err(e) = session.chan.send(opcode, flag, payload) {
                // Full teardown happens on the reader's Closed event;
                // dropping the writer here is enough and keeps this safe
                // to call mid-dispatch.
                warn!(%sid, err = %e, "send failed; closing channel");
                session.chan.disconnect();
            }
        }
    }

    /// Encrypt-and-send to every occupied slot, handling per-slot dialect
    /// differences in the channel layer.
    pub fn broadcast(
        &mut self,
        rid: RoomId,
        opcode: u16,
        flag: u32,
        payload: &[u8],
        except: Option<SessionId>,
    ) {
        let Some(room) = self.rooms.get(&rid) else {
            return;
        };
        for (_, sid) in room.occupants() {
            if Some(sid) == except {
                continue;
            }
            self.send_to_session(sid, opcode, flag, payload);
        }
    }

    /// Send to exactly one slot; silently drops when the slot is empty.
    pub fn private_send(
        &mut self,
        rid: RoomId,
        slot: usize,
        opcode: u16,
        flag: u32,
        payload: &[u8],
    ) {
        let target = self.rooms.get(&rid).and_then(|r| r.session_at(slot));
        if let Some(sid) = target {
            self.send_to_session(sid, opcode, flag, payload);
        }
    }

    pub fn any_client_loading(&self, rid: RoomId) -> bool {
        let Some(room) = self.rooms.get(&rid) else {
            return false;
        };
        room.occupants()
            .iter()
            .any(|(_, sid)| self.sessions.get(sid).is_some_and(|s| s.loading))
    }

    /// Subscribe a lobby to a game's subcommand stream. Card rooms only
    /// ever carry lobby watchers.
    pub fn watch_game(&mut self, lobby: RoomId, game: RoomId) -> Result<(), ShipError> {
        if self.rooms.get(&lobby).is_none_or(|r| r.is_game) {
            return Err(ShipError::NoSuchRoom(lobby));
        }
        let room = self.rooms.get_mut(&game).ok_or(ShipError::NoSuchRoom(game))?;
        if !room.is_game {
            return Err(ShipError::NoSuchRoom(game));
        }
        if !room.watcher_rooms.contains(&lobby) {
            room.watcher_rooms.push(lobby);
        }
        Ok(())
    }
}

fn room_seed() -> u64 {
    let mut b = [0u8; 8];
    getrandom::getrandom(&mut b).expect("getrandom");
    u64::from_le_bytes(b)
}

/// Placeholder enemy roster used until a map-data loader provides real
/// per-variation layouts. Entries map 1:1 to wire enemy ids.
fn default_enemy_table(episode: u8) -> Vec<Enemy> {
    let base: u32 = match episode {
        2 => 40,
        3 => 60,
        _ => 20,
    };
    (0..0x40u32)
        .map(|i| Enemy::new(i, base + i * 5))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drops::BasicCommonItems;
    use crate::player::CharClass;
    use crate::subcmd::build_sub;
    use shipproto::frame::decode_header;
    use shipproto::items::{InventoryItem, ItemData};

    pub(crate) struct Harness {
        pub ship: Ship,
        pub taps: HashMap<SessionId, mpsc::UnboundedReceiver<Bytes>>,
        next_sid: u64,
    }

    impl Harness {
        pub fn new() -> Harness {
            Harness {
                ship: Ship {
                    name: "test".into(),
                    copyright: "test".into(),
                    item_tracking_default: true,
                    cheats_default: false,
                    expected_first: vec![0x93, 0, 8, 0, 0, 0, 0, 0],
                    key_pool: Vec::new(),
                    sessions: HashMap::new(),
                    rooms: HashMap::new(),
                    next_room: 1,
                    level_table: Arc::new(LevelTable::flat_default()),
                    rare_items: None,
                    common_items: Arc::new(BasicCommonItems),
                    quest_index: Arc::new(QuestIndex::default()),
                    card_index: None,
                    saves: Box::new(NullSaves),
                },
                taps: HashMap::new(),
                next_sid: 1,
            }
        }

        /// A connected session with no cipher, so taps read cleartext.
        pub fn session(&mut self, dialect: Dialect) -> SessionId {
            let sid = SessionId(self.next_sid);
            self.next_sid += 1;
            let (tx, rx) = mpsc::unbounded_channel();
            let chan = Channel::new(dialect, tx);
            let session = Session::new(sid, "127.0.0.1:1".parse().unwrap(), dialect, chan);
            self.ship.sessions.insert(sid, session);
            self.taps.insert(sid, rx);
            sid
        }

        pub fn v4_game(&mut self, members: &[SessionId]) -> RoomId {
            let rid = 100;
            let mut room = Room::new_game(rid, Dialect::V4, 1, 2, 5, false, true, 7);
            room.set_enemies(default_enemy_table(1));
            self.ship.rooms.insert(rid, room);
            for sid in members {
                self.ship.join_room(*sid, rid).unwrap();
            }
            // Clear the join/announce traffic so tests see only their own
            // effects.
            for sid in members {
                self.drain(*sid);
            }
            rid
        }

        pub fn sub(&mut self, from: SessionId, opcode: u16, flag: u32, data: &[u8]) {
            subcmd::on_subcommand(&mut self.ship, from, opcode, flag, data).unwrap();
        }

        /// Drain a tap into decoded (opcode, flag, payload) frames.
        pub fn drain(&mut self, sid: SessionId) -> Vec<(u16, u32, Vec<u8>)> {
            let dialect = self
                .ship
                .sessions
                .get(&sid)
                .map(|s| s.dialect)
                .unwrap_or(Dialect::V4);
            let hs = dialect.header_size();
            let rx = self.taps.get_mut(&sid).unwrap();
            let mut out = Vec::new();
            while let Ok(wire) = rx.try_recv() {
                let h = decode_header(dialect, &wire).unwrap();
                out.push((h.opcode, h.flag, wire[hs..h.total].to_vec()));
            }
            out
        }

        pub fn player_of(&self, sid: SessionId) -> &crate::player::PlayerData {
            &self.ship.sessions[&sid].player
        }
    }

    fn monomate_stack(id: u32, count: u8) -> InventoryItem {
        let mut d = ItemData::zero();
        d.data1[0] = 3;
        d.data1[5] = count;
        d.id = id;
        InventoryItem::new(d)
    }

    #[test]
    fn stack_split_scenario() {
        let mut h = Harness::new();
        let (a, b, c) = (
            h.session(Dialect::V4),
            h.session(Dialect::V4),
            h.session(Dialect::V4),
        );
        let rid = h.v4_game(&[a, b, c]);
        // Sender must sit in slot 2.
        let sender = c;
        assert_eq!(h.ship.sessions[&sender].slot, 2);
        h.ship
            .sessions
            .get_mut(&sender)
            .unwrap()
            .player
            .add_item(monomate_stack(0x10, 5))
            .unwrap();
        // The room counter has issued ids up to 0x10.
        h.ship.rooms.get_mut(&rid).unwrap().generate_item_id(0xFF);

        // SplitStack(id=0x10, amount=2, area=1, x=10.0, z=20.0)
        let mut body = Vec::new();
        body.extend_from_slice(&0x10u32.to_le_bytes());
        body.extend_from_slice(&2u32.to_le_bytes());
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&10.0f32.to_le_bytes());
        body.extend_from_slice(&20.0f32.to_le_bytes());
        let cmd = build_sub(0xC3, 2, &body);
        h.sub(sender, 0x60, 0, &cmd);

        // Sender still holds item 0x10 with 3 left.
        let p = h.player_of(sender);
        assert_eq!(p.inventory.len(), 1);
        assert_eq!(p.inventory[0].id, 0x10);
        assert_eq!(p.inventory[0].item().stack_count(), 3);

        // A new ground item with the next id exists at (1, 10.0, 20.0).
        let room = &h.ship.rooms[&rid];
        let ground = &room.ground_items[&0x11];
        assert_eq!(ground.item.stack_count(), 2);
        assert_eq!((ground.area, ground.x, ground.z), (1, 10.0, 20.0));

        // Every peer (including the sender) got the authoritative drop,
        // in the wide layout: 36-byte body, ten words, reserved tail.
        for sid in [a, b, c] {
            let frames = h.drain(sid);
            let drops: Vec<_> = frames
                .iter()
                .filter(|(op, _, p)| *op == 0x60 && p[0] == 0x5D)
                .collect();
            assert_eq!(drops.len(), 1, "peer {sid} missed the drop echo");
            let p = &drops[0].2;
            assert_eq!(p[1], 10);
            assert_eq!(u16::from_le_bytes([p[2], p[3]]), 2); // sender slot
            assert_eq!(&p[36..40], &[0, 0, 0, 0]);
        }

        // Item-id uniqueness across ground + inventories.
        let room = &h.ship.rooms[&rid];
        let mut ids: Vec<u32> = room.ground_items.keys().copied().collect();
        for sid in [a, b, c] {
            ids.extend(h.player_of(sid).inventory.iter().map(|i| i.id));
        }
        ids.sort_unstable();
        let before = ids.len();
        ids.dedup();
        assert_eq!(ids.len(), before);
    }

    #[test]
    fn experience_split_scenario() {
        let mut h = Harness::new();
        let (a, b, c) = (
            h.session(Dialect::V4),
            h.session(Dialect::V4),
            h.session(Dialect::V4),
        );
        let rid = h.v4_game(&[a, b, c]);
        // Enemy 7 with 1000 experience; slots 0 and 2 tag it, slot 2
        // lands the kill.
        {
            let room = h.ship.rooms.get_mut(&rid).unwrap();
            room.enemies[7] = Enemy::new(7, 1000);
        }
        for s in [a, b, c] {
            let p = &mut h.ship.sessions.get_mut(&s).unwrap().player;
            p.char_class = CharClass::Ramarl;
            p.level = 50;
            p.experience = u32::MAX / 4; // park below any threshold concern
        }
        // Reset experience so no level-ups fire.
        for s in [a, c] {
            h.ship.sessions.get_mut(&s).unwrap().player.experience = 0;
        }

        let hit = |h: &mut Harness, from: SessionId| {
            let cmd = build_sub(0x0A, 7, &[0, 0, 0, 0]);
            h.sub(from, 0x60, 0, &cmd);
        };
        hit(&mut h, a); // slot 0
        hit(&mut h, c); // slot 2

        let kill = build_sub(0xC8, 7, &[]);
        h.sub(c, 0x60, 0, &kill);

        assert_eq!(h.player_of(a).experience, 770);
        assert_eq!(h.player_of(c).experience, 1000);
        assert_eq!(h.player_of(b).experience, u32::MAX / 4); // never hit it

        let room = &h.ship.rooms[&rid];
        assert_ne!(room.enemies[7].hit_flags & 0x80, 0);

        // A second kill for the same enemy awards nothing more.
        let kill = build_sub(0xC8, 7, &[]);
        h.sub(a, 0x60, 0, &kill);
        assert_eq!(h.player_of(a).experience, 770);
        assert_eq!(h.player_of(c).experience, 1000);
    }

    #[test]
    fn experience_awards_trigger_level_ups() {
        let mut h = Harness::new();
        let a = h.session(Dialect::V4);
        let rid = h.v4_game(&[a]);
        {
            let room = h.ship.rooms.get_mut(&rid).unwrap();
            room.enemies[3] = Enemy::new(3, 5000);
        }
        let hit = build_sub(0x0A, 3, &[0, 0, 0, 0]);
        h.sub(a, 0x60, 0, &hit);
        let kill = build_sub(0xC8, 3, &[]);
        h.sub(a, 0x60, 0, &kill);

        let p = h.player_of(a);
        assert!(p.level > 0, "5000 exp must clear the early thresholds");
        assert_eq!(p.experience, 5000);
        // Level-up broadcast went out.
        let frames = h.drain(a);
        assert!(frames.iter().any(|(op, _, p)| *op == 0x60 && p[0] == 0x30));
    }

    #[test]
    fn private_subcommands_reach_only_the_target() {
        let mut h = Harness::new();
        let (a, b, c) = (
            h.session(Dialect::V4),
            h.session(Dialect::V4),
            h.session(Dialect::V4),
        );
        h.v4_game(&[a, b, c]);
        let card = build_sub(0x06, 0, &[0; 8]);
        // Private to slot 1 (= session b).
        h.sub(a, 0x62, 1, &card);
        assert!(h.drain(b).iter().any(|(op, _, _)| *op == 0x62));
        assert!(h.drain(c).is_empty());
        assert!(h.drain(a).is_empty());
    }

    #[test]
    fn spoofed_client_id_is_dropped() {
        let mut h = Harness::new();
        let (a, b) = (h.session(Dialect::V4), h.session(Dialect::V4));
        h.v4_game(&[a, b]);
        // Sender a sits in slot 0 but claims slot 1.
        let chat = build_sub(0x07, 1, &[0; 4]);
        h.sub(a, 0x60, 0, &chat);
        assert!(h.drain(b).is_empty());
    }

    #[test]
    fn v4_clients_may_not_create_inventory_items() {
        let mut h = Harness::new();
        let a = h.session(Dialect::V4);
        h.v4_game(&[a]);
        let mut body = Vec::new();
        body.extend_from_slice(&ItemData::zero().encode());
        let cmd = build_sub(0x2B, 0, &body);
        h.sub(a, 0x60, 0, &cmd);
        assert!(h.player_of(a).inventory.is_empty());
    }

    #[test]
    fn watcher_rooms_mirror_chat_only_before_battle() {
        let mut h = Harness::new();
        let (a, b) = (h.session(Dialect::V4), h.session(Dialect::V4));
        let watcher = h.session(Dialect::V4);
        let rid = h.v4_game(&[a, b]);

        let lobby_id = 200;
        h.ship
            .rooms
            .insert(lobby_id, Room::new_lobby(lobby_id, Dialect::V4, 3));
        h.ship.join_room(watcher, lobby_id).unwrap();
        h.drain(watcher);
        h.ship.watch_game(lobby_id, rid).unwrap();

        // Non-chat subcommand: not mirrored while no battle is live.
        let walk = build_sub(0x40, 0, &[0; 12]);
        h.sub(a, 0x60, 0, &walk);
        assert!(h.drain(watcher).is_empty());

        // Symbol chat: mirrored regardless.
        let chat = build_sub(0x07, 0, &[0; 4]);
        h.sub(a, 0x60, 0, &chat);
        assert!(!h.drain(watcher).is_empty());

        // With a battle in progress everything is mirrored.
        let mut rec = crate::battlerec::BattleRecord::new();
        rec.set_in_progress(true);
        h.ship.rooms.get_mut(&rid).unwrap().battle_record = Some(rec);
        let walk = build_sub(0x40, 0, &[0; 12]);
        h.sub(a, 0x60, 0, &walk);
        assert!(!h.drain(watcher).is_empty());
        // And the record kept it.
        let room = &h.ship.rooms[&rid];
        assert_eq!(room.battle_record.as_ref().unwrap().events().len(), 1);
    }

    #[test]
    fn leader_reelection_on_disconnect() {
        let mut h = Harness::new();
        let (a, b) = (h.session(Dialect::V4), h.session(Dialect::V4));
        let rid = h.v4_game(&[a, b]);
        assert_eq!(h.ship.rooms[&rid].leader, 0);
        h.ship.disconnect_session(a);
        let room = &h.ship.rooms[&rid];
        assert_eq!(room.leader, 1);
        assert_eq!(room.leader_session(), Some(b));
        // Peer b heard the departure.
        assert!(h.drain(b).iter().any(|(op, _, _)| *op == CMD_PEER_LEFT));
    }

    #[test]
    fn bank_deposit_and_withdraw_round_trip() {
        let mut h = Harness::new();
        let a = h.session(Dialect::V4);
        let rid = h.v4_game(&[a]);
        {
            let p = &mut h.ship.sessions.get_mut(&a).unwrap().player;
            p.meseta = 500;
            p.add_item(monomate_stack(0x50, 5)).unwrap();
        }

        // Deposit 300 meseta.
        let mut body = Vec::new();
        body.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        body.extend_from_slice(&300u32.to_le_bytes());
        body.push(0); // deposit
        body.push(0);
        let cmd = build_sub(0xBD, 0, &body);
        h.sub(a, 0x60, 0, &cmd);
        assert_eq!(h.player_of(a).meseta, 200);
        assert_eq!(h.player_of(a).bank.meseta, 300);

        // Deposit the whole stack.
        let mut body = Vec::new();
        body.extend_from_slice(&0x50u32.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(0);
        body.push(5);
        let cmd = build_sub(0xBD, 0, &body);
        h.sub(a, 0x60, 0, &cmd);
        assert!(h.player_of(a).inventory.is_empty());
        assert_eq!(h.player_of(a).bank.items.len(), 1);

        // Withdraw it; the item must come back under a fresh id.
        let mut body = Vec::new();
        body.extend_from_slice(&0x50u32.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(1);
        body.push(5);
        let cmd = build_sub(0xBD, 0, &body);
        h.sub(a, 0x60, 0, &cmd);
        let p = h.player_of(a);
        assert_eq!(p.inventory.len(), 1);
        assert_ne!(p.inventory[0].id, 0x10);
        assert!(p.bank.items.is_empty());

        // Over-withdrawal of meseta is refused outright.
        let mut body = Vec::new();
        body.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        body.extend_from_slice(&999_999u32.to_le_bytes());
        body.push(1);
        body.push(0);
        let cmd = build_sub(0xBD, 0, &body);
        h.sub(a, 0x60, 0, &cmd);
        assert_eq!(h.player_of(a).bank.meseta, 300);
    }

    #[test]
    fn shop_request_returns_nine_to_twelve_items() {
        let mut h = Harness::new();
        let a = h.session(Dialect::V4);
        h.v4_game(&[a]);
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_le_bytes()); // tool shop
        let cmd = build_sub(0xB5, 0, &body);
        h.sub(a, 0x60, 0, &cmd);
        let n = h.ship.sessions[&a].shop_contents.len();
        assert!((9..=12).contains(&n), "shop size {n}");
        // Unknown shop types come back empty.
        let mut body = Vec::new();
        body.extend_from_slice(&9u32.to_le_bytes());
        let cmd = build_sub(0xB5, 0, &body);
        h.sub(a, 0x60, 0, &cmd);
        assert!(h.ship.sessions[&a].shop_contents.is_empty());
    }

    #[test]
    fn switch_assist_replays_previous_enable() {
        let mut h = Harness::new();
        let (a, b) = (h.session(Dialect::V4), h.session(Dialect::V4));
        let rid = h.v4_game(&[a, b]);
        h.ship.rooms.get_mut(&rid).unwrap().cheats_enabled = true;
        h.ship.sessions.get_mut(&a).unwrap().flags.switch_assist = true;

        let enable = |object: u16| build_sub(0x05, object, &[0x01, 0x00, 0x00, 0x00]);
        h.sub(a, 0x60, 0, &enable(0x100));
        h.drain(b);
        h.sub(a, 0x60, 0, &enable(0x101));
        // b sees the new enable plus the replayed previous one.
        let switches = h
            .drain(b)
            .iter()
            .filter(|(_, _, p)| p[0] == 0x05)
            .count();
        assert_eq!(switches, 2);
        // The sender also gets the replay.
        assert!(h.drain(a).iter().any(|(_, _, p)| p[0] == 0x05));
    }

    #[test]
    fn boss_phase_completion_requests_the_boss_drop() {
        let mut h = Harness::new();
        let (a, b) = (h.session(Dialect::V4), h.session(Dialect::V4));
        let rid = h.v4_game(&[a, b]); // episode 1, difficulty 2
        h.ship.sessions.get_mut(&b).unwrap().area = 0x0E;

        let phase_setup = |phase: u32| {
            let mut body = Vec::new();
            body.extend_from_slice(&phase.to_le_bytes());
            body.extend_from_slice(&0u32.to_le_bytes());
            body.extend_from_slice(&2u32.to_le_bytes()); // room difficulty
            build_sub(0x75, 0, &body)
        };

        // An intermediate phase forwards but fires nothing.
        h.sub(b, 0x60, 0, &phase_setup(0x35));
        assert!(h.drain(a).iter().all(|(op, _, _)| *op != 0x62));

        // The final phase at the boss arena sends the leader (slot 0) a
        // private, fully formed drop request.
        h.sub(b, 0x60, 0, &phase_setup(0x37));
        let frames = h.drain(a);
        let req = frames
            .iter()
            .find(|(op, _, p)| *op == 0x62 && p[0] == 0x60)
            .expect("leader drop request");
        assert_eq!(req.1, 0); // directed at the leader slot
        let p = &req.2;
        assert_eq!(p[1], 6); // six words
        assert_eq!(&p[2..4], &[0, 0]); // header arg unused
        assert_eq!(p[4], 0x0E); // area
        assert_eq!(p[5], 0x2F); // episode 1 boss
        assert_eq!(u16::from_le_bytes([p[6], p[7]]), 0x0B4F);
        assert_eq!(
            f32::from_le_bytes(p[8..12].try_into().unwrap()),
            10160.58984375
        );
        assert_eq!(u16::from_le_bytes([p[16], p[17]]), 2);
        assert_eq!(&p[18..20], &[0, 0]);
        assert_eq!(&p[20..24], &0xE0AE_DC01u32.to_le_bytes());
        // The room itself is untouched; the leader's client answers with
        // its own drop request.
        assert!(h.ship.rooms[&rid].ground_items.is_empty());
    }

    #[test]
    fn card_battle_commands_are_remasked() {
        let mut h = Harness::new();
        let (a, b) = (h.session(Dialect::V3a), h.session(Dialect::V3a));
        let plain = h.session(Dialect::V3a); // not card-capable
        for sid in [a, b] {
            h.ship.sessions.get_mut(&sid).unwrap().flags.is_ep3 = true;
        }

        let rid = 300;
        let room = Room::new_game(rid, Dialect::V3a, 1, 0, 0, true, false, 11);
        h.ship.rooms.insert(rid, room);
        for sid in [a, b, plain] {
            h.ship.join_room(sid, rid).unwrap();
        }
        for sid in [a, b, plain] {
            h.drain(sid);
        }

        // A 6xB4 that arrived masked under key 0x21.
        let mut cmd = build_sub(0xB4, 0, &[0x07, 0x00, 0x00, 0x00, 1, 2, 3, 4, 5, 6, 7, 8]);
        let clear_tail = cmd[8..].to_vec();
        shipproto::subcmd::rotate_mask(&mut cmd, 0x21).unwrap();
        h.sub(a, 0xC9, 0, &cmd);

        // The card-incapable peer saw nothing.
        assert!(h.drain(plain).is_empty());

        let frames = h.drain(b);
        assert_eq!(frames.len(), 1);
        let mut fwd = frames[0].2.clone();
        assert_ne!(fwd[6], 0, "forwarded command must carry a fresh mask");
        // Unmasking with the advertised key recovers the plaintext tail.
        shipproto::subcmd::rotate_mask(&mut fwd, 0).unwrap();
        assert_eq!(&fwd[8..cmd.len()], &clear_tail[..]);
    }

    #[test]
    fn quest_request_streams_both_files() {
        let dir = std::env::temp_dir().join("shipd-ship-quest-test");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let mut bin = vec![0u8; 0x400];
        bin[16..18].copy_from_slice(&9u16.to_le_bytes());
        bin[20] = 0;
        bin[24..32].copy_from_slice(b"N\0i\0n\0e\0");
        std::fs::write(dir.join("q009-ret-bb.bin"), prs::compress(&bin)).unwrap();
        std::fs::write(dir.join("q009-ret-bb.dat"), prs::compress(&vec![3u8; 0x900])).unwrap();

        let mut h = Harness::new();
        h.ship.quest_index = Arc::new(QuestIndex::load(&dir).unwrap());
        let a = h.session(Dialect::V4);
        h.v4_game(&[a]);

        h.ship.send_quest(a, 9).unwrap();
        let frames = h.drain(a);
        let opens: Vec<_> = frames.iter().filter(|(op, _, _)| *op == CMD_FILE_OPEN).collect();
        assert_eq!(opens.len(), 2);
        assert!(opens[0].2.starts_with(b"quest9.bin"));
        let chunks: usize = frames.iter().filter(|(op, _, _)| *op == CMD_FILE_CHUNK).count();
        // Both compressed files fit well inside a handful of chunks; the
        // totals in the open commands match the chunked byte counts.
        let declared: usize = opens
            .iter()
            .map(|(_, _, p)| u32::from_le_bytes(p[0x20..0x24].try_into().unwrap()) as usize)
            .sum();
        let shipped: usize = frames
            .iter()
            .filter(|(op, _, _)| *op == CMD_FILE_CHUNK)
            .map(|(_, _, p)| p.len())
            .sum();
        assert!(chunks >= 2);
        assert!(shipped >= declared);

        assert!(matches!(
            h.ship.send_quest(a, 404),
            Err(ShipError::NoSuchQuest(404))
        ));
    }

    #[test]
    fn quarantined_room_stops_dispatching() {
        let mut h = Harness::new();
        let a = h.session(Dialect::V4);
        let rid = h.v4_game(&[a]);
        h.ship.rooms.get_mut(&rid).unwrap().quarantined = true;
        let chat = build_sub(0x07, 0, &[0; 4]);
        h.sub(a, 0x60, 0, &chat);
        assert!(h.drain(a).is_empty());
    }
}
