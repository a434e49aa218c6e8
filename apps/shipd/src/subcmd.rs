//! Subcommand dispatch.
//!
//! Game actions arrive inside the broadcast (0x60/0x6C/0xC9/0xCB) and
//! private (0x62/0x6D) envelope commands. The first payload byte selects
//! one of 256 table entries; each entry is a declarative policy (when to
//! forward, what to validate) or a handler that mutates room state and
//! forwards a server-generated result.
//!
//! Handlers return a result; failures are logged and swallowed here, at
//! the per-subcommand boundary, except protocol errors (which close the
//! connection) and invariant violations (which quarantine the room).

use rand::Rng;
use tracing::{error, info, warn};

use shipproto::items::{InventoryItem, ItemData, ITEM_ID_UNASSIGNED};
use shipproto::subcmd::{check_size, client_id, is_private_opcode, rotate_mask};
use shipproto::Dialect;

use crate::battlerec::EventKind;
use crate::drops::{rare_to_item, RareItemSet};
use crate::error::{Severity, ShipError};
use crate::player::MAX_LEVEL;
use crate::rooms::{RoomId, ENEMY_EXP_UNKNOWN, HIT_FLAG_DEAD};
use crate::session::SessionId;
use crate::ship::Ship;

/// Symbol chat / word select: mirrored to watchers even outside battle.
const WATCHER_CHAT_SUBS: [u8; 3] = [0x07, 0x74, 0xBD];

pub struct Ctx<'a> {
    pub ship: &'a mut Ship,
    pub sid: SessionId,
    pub rid: RoomId,
    pub opcode: u16,
    pub flag: u32,
    pub data: &'a [u8],
}

impl<'a> Ctx<'a> {
    fn sender(&self) -> &crate::session::Session {
        &self.ship.sessions[&self.sid]
    }

    fn sender_mut(&mut self) -> &mut crate::session::Session {
        self.ship.sessions.get_mut(&self.sid).expect("sender exists")
    }

    fn room(&self) -> &crate::rooms::Room {
        &self.ship.rooms[&self.rid]
    }

    fn room_mut(&mut self) -> &mut crate::rooms::Room {
        self.ship.rooms.get_mut(&self.rid).expect("room exists")
    }

    fn sender_slot(&self) -> u16 {
        self.sender().slot as u16
    }

    /// The sender's client-id field must match its own slot; a mismatch
    /// silently drops the subcommand.
    fn client_id_matches(&self) -> Result<bool, ShipError> {
        Ok(client_id(self.data)? == self.sender_slot())
    }

    fn forward(&mut self) -> Result<(), ShipError> {
        let data = self.data.to_vec();
        self.forward_data(&data)
    }

    /// The forwarding policy: private subcommands go to the one slot the
    /// frame flag names; broadcasts go to every other occupant, then are
    /// mirrored to watcher rooms and appended to the battle record.
    fn forward_data(&mut self, data: &[u8]) -> Result<(), ShipError> {
        let opcode_is_card = self.opcode & 0xF0 == 0xC0;
        if opcode_is_card && !self.sender().flags.is_ep3 {
            return Ok(());
        }

        if is_private_opcode(self.opcode) {
            let slot = self.flag as usize;
            let Some(target) = self.room().session_at(slot) else {
                return Ok(());
            };
            if opcode_is_card && !self.ship.sessions[&target].flags.is_ep3 {
                return Ok(());
            }
            self.ship.send_to_session(target, self.opcode, self.flag, data);
            return Ok(());
        }

        for (_, peer) in self.room().occupants() {
            if peer == self.sid {
                continue;
            }
            if opcode_is_card && !self.ship.sessions[&peer].flags.is_ep3 {
                continue;
            }
            self.ship.send_to_session(peer, self.opcode, self.flag, data);
        }

        // Watcher mirroring: chat always, everything else only while the
        // battle is past registration. Private subcommands never reach
        // watchers (handled above).
        if !data.is_empty() {
            let battle_live = self
                .room()
                .battle_record
                .as_ref()
                .is_some_and(|r| r.battle_in_progress());
            if WATCHER_CHAT_SUBS.contains(&data[0]) || battle_live {
                for wid in self.room().watcher_rooms.clone() {
                    let Some(watcher) = self.ship.rooms.get(&wid) else {
                        continue;
                    };
                    for (_, peer) in watcher.occupants() {
                        if opcode_is_card && !self.ship.sessions[&peer].flags.is_ep3 {
                            continue;
                        }
                        self.ship.send_to_session(peer, self.opcode, self.flag, data);
                    }
                }
            }
        }

        let kind = if opcode_is_card {
            EventKind::CardGameCommand
        } else {
            EventKind::GameCommand
        };
        if let Some(rec) = self.room_mut().battle_record.as_mut() {
            rec.add_command(kind, bytes::Bytes::copy_from_slice(data));
        }
        Ok(())
    }

    /// Broadcast a server-generated subcommand to the whole room,
    /// including the original sender.
    fn broadcast_sub(&mut self, data: &[u8]) {
        for (_, peer) in self.room().occupants() {
            self.ship.send_to_session(peer, 0x60, 0, data);
        }
    }

    fn send_sub_to(&mut self, target: SessionId, data: &[u8]) {
        self.ship.send_to_session(target, 0x60, 0, data);
    }
}

/// Build a subcommand with the standard 4-byte header. The body is padded
/// to a 4-byte boundary and the word count fills the size field.
pub fn build_sub(sub_opcode: u8, arg: u16, body: &[u8]) -> Vec<u8> {
    let total = (4 + body.len() + 3) & !3;
    let mut out = vec![0u8; total];
    out[0] = sub_opcode;
    out[1] = (total / 4) as u8;
    out[2..4].copy_from_slice(&arg.to_le_bytes());
    out[4..4 + body.len()].copy_from_slice(body);
    out
}

type HandlerFn = fn(&mut Ctx) -> Result<(), ShipError>;

#[derive(Clone, Copy)]
enum Entry {
    /// No handler known; log and drop.
    Nop,
    /// Explicitly invalid on the wire; log at error and drop.
    Invalid,
    /// Validate the envelope, forward verbatim.
    Fwd,
    /// Forward only inside games.
    FwdGame,
    /// Forward only while a game is still loading.
    FwdLoading,
    /// Forward after checking the embedded client id.
    FwdClient,
    /// Card-capable lobbies only.
    FwdEp3Lobby,
    /// Card games only.
    FwdEp3Game,
    H(HandlerFn),
}

/// Dispatch one subcommand envelope. `payload` is the raw (padded) frame
/// payload.
pub fn on_subcommand(
    ship: &mut Ship,
    sid: SessionId,
    opcode: u16,
    flag: u32,
    payload: &[u8],
) -> Result<(), ShipError> {
    let Some(rid) = ship.sessions.get(&sid).and_then(|s| s.room) else {
        return Ok(()); // not in a room; nothing to route
    };
    if ship.rooms.get(&rid).is_none_or(|r| r.quarantined) {
        return Ok(());
    }

    let data = check_size(payload)?;
    let sub = data[0];
    let mut ctx = Ctx {
        ship,
        sid,
        rid,
        opcode,
        flag,
        data,
    };

    let result = run_entry(TABLE[sub as usize], &mut ctx);
    match result {
        Ok(()) => Ok(()),
        Err(e) => match e.severity() {
            Severity::Protocol => Err(e),
            Severity::State => {
                info!(sub = format_args!("{sub:02X}"), err = %e, "subcommand dropped");
                Ok(())
            }
            Severity::Internal => {
                error!(room = rid, sub = format_args!("{sub:02X}"), err = %e, "room quarantined");
                if let Some(room) = ship.rooms.get_mut(&rid) {
                    room.quarantined = true;
                }
                Ok(())
            }
        },
    }
}

fn run_entry(entry: Entry, ctx: &mut Ctx) -> Result<(), ShipError> {
    match entry {
        Entry::Nop => {
            warn!(
                sub = format_args!("{:02X}", ctx.data[0]),
                private = is_private_opcode(ctx.opcode),
                "unknown subcommand"
            );
            Ok(())
        }
        Entry::Invalid => {
            error!(
                sub = format_args!("{:02X}", ctx.data[0]),
                "invalid subcommand"
            );
            Ok(())
        }
        Entry::Fwd => ctx.forward(),
        Entry::FwdGame => {
            if ctx.room().is_game {
                ctx.forward()?;
            }
            Ok(())
        }
        Entry::FwdLoading => {
            if ctx.room().is_game && ctx.ship.any_client_loading(ctx.rid) {
                ctx.forward()?;
            }
            Ok(())
        }
        Entry::FwdClient => {
            if ctx.client_id_matches()? {
                ctx.forward()?;
            }
            Ok(())
        }
        Entry::FwdEp3Lobby => {
            if !ctx.room().is_game && ctx.room().card_battle {
                ctx.forward()?;
            }
            Ok(())
        }
        Entry::FwdEp3Game => {
            if ctx.room().is_game && ctx.room().card_battle {
                ctx.forward()?;
            }
            Ok(())
        }
        Entry::H(f) => f(ctx),
    }
}

// ---------------------------------------------------------------------------
// Chat and presence
// ---------------------------------------------------------------------------

/// 6x06: guild card send. Private-only; forwarded to the one target slot.
fn on_send_guild_card(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !is_private_opcode(ctx.opcode) {
        return Ok(());
    }
    ctx.forward()
}

/// 6x07: symbol chat. Dropped when the sender is muted or spoofing.
fn on_symbol_chat(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.sender().flags.can_chat || !ctx.client_id_matches()? {
        return Ok(());
    }
    ctx.forward()
}

/// 6x74: word select chat.
fn on_word_select(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.sender().flags.can_chat || !ctx.client_id_matches()? {
        return Ok(());
    }
    ctx.forward()
}

/// 6x23: player visibility; lobbies use it to refresh state after load.
fn on_set_player_visibility(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.client_id_matches()? {
        return Ok(());
    }
    ctx.forward()
}

/// 6x21: inter-level warp.
fn on_change_area(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.room().is_game {
        return Ok(());
    }
    if ctx.data.len() >= 8 {
        let area = ctx.data[4];
        ctx.sender_mut().area = area;
    }
    ctx.forward()
}

/// 6x3E/6x3F/6x40/6x42: movement. Body starts with the x/z floats.
fn on_movement(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.client_id_matches()? {
        return Ok(());
    }
    if ctx.data.len() >= 12 {
        let x = f32::from_le_bytes(ctx.data[4..8].try_into().unwrap());
        let z = f32::from_le_bytes(ctx.data[8..12].try_into().unwrap());
        let s = ctx.sender_mut();
        s.x = x;
        s.z = z;
    }
    ctx.forward()
}

// ---------------------------------------------------------------------------
// Cheat plumbing
// ---------------------------------------------------------------------------

/// 6x05: switch state change. With switch-assist on, replays the cached
/// previous enable so one player can open two-player switch doors.
fn on_switch_state_changed(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.room().is_game {
        return Ok(());
    }
    ctx.forward()?;

    // body: [4..6) = flags, header arg = object id (0xFFFF = room clear).
    let object_id = client_id(ctx.data)?;
    let enabled = ctx.data.len() >= 6 && ctx.data[4] != 0;
    if enabled && object_id != 0xFFFF {
        let cheats = ctx.room().cheats_enabled && ctx.sender().flags.switch_assist;
        let prev = ctx.sender().last_switch_enabled.clone();
        if cheats {
            if let Some(prev) = prev {
                info!("switch assist: replaying previous enable");
                ctx.forward_data(&prev)?;
                let opcode = ctx.opcode;
                let flag = ctx.flag;
                let sid = ctx.sid;
                ctx.ship.send_to_session(sid, opcode, flag, &prev);
            }
        }
        let data = ctx.data.to_vec();
        ctx.sender_mut().last_switch_enabled = Some(data);
    }
    Ok(())
}

/// 6x2F/6x4B/6x4C: hit by an enemy. With infinite HP, immediately heal.
fn on_hit_by_enemy(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.room().is_game || !ctx.client_id_matches()? {
        return Ok(());
    }
    ctx.forward()?;
    if ctx.room().cheats_enabled && ctx.sender().flags.infinite_hp {
        let slot = ctx.sender_slot();
        let heal = build_sub(0x9A, slot, &stat_change_body(slot, StatChange::AddHp, 0xFF));
        ctx.broadcast_sub(&heal);
    }
    Ok(())
}

/// 6x48: technique cast finished. With infinite TP, refill.
fn on_cast_technique_finished(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.room().is_game || !ctx.client_id_matches()? {
        return Ok(());
    }
    ctx.forward()?;
    if ctx.room().cheats_enabled && ctx.sender().flags.infinite_tp {
        let slot = ctx.sender_slot();
        let restore = build_sub(0x9A, slot, &stat_change_body(slot, StatChange::AddTp, 0xFF));
        ctx.broadcast_sub(&restore);
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum StatChange {
    AddHp = 0,
    AddTp = 1,
}

fn stat_change_body(slot: u16, what: StatChange, amount: u8) -> [u8; 4] {
    let mut b = [0u8; 4];
    b[0..2].copy_from_slice(&slot.to_le_bytes());
    b[2] = what as u8;
    b[3] = amount;
    b
}

// ---------------------------------------------------------------------------
// Multi-target action commands: entry-count sanity checks
// ---------------------------------------------------------------------------

/// 6x46: attack finished; at most 11 hit entries, bounded by the size
/// field.
fn on_attack_finished(ctx: &mut Ctx) -> Result<(), ShipError> {
    check_entry_count(ctx.data, 8, 2, 11)?;
    if ctx.client_id_matches()? {
        ctx.forward()?;
    }
    Ok(())
}

/// 6x47: technique cast; at most 10 targets.
fn on_cast_technique(ctx: &mut Ctx) -> Result<(), ShipError> {
    check_entry_count(ctx.data, 8, 2, 10)?;
    if ctx.client_id_matches()? {
        ctx.forward()?;
    }
    Ok(())
}

/// 6x49: photon-blast energy subtraction; at most 14 entries.
fn on_subtract_pb_energy(ctx: &mut Ctx) -> Result<(), ShipError> {
    check_entry_count(ctx.data, 8, 3, 14)?;
    if ctx.client_id_matches()? {
        ctx.forward()?;
    }
    Ok(())
}

/// The declared entry count must fit in the declared envelope size.
fn check_entry_count(
    data: &[u8],
    count_offset: usize,
    header_words: u8,
    cap: usize,
) -> Result<(), ShipError> {
    if data.len() <= count_offset {
        return Err(ShipError::Proto(shipproto::ProtoError::BadSubcommand(
            "entry count missing",
        )));
    }
    let count = data[count_offset] as usize;
    let size_words = data[1] as usize;
    let allowed = size_words.saturating_sub(header_words as usize).min(cap);
    if count > allowed {
        return Err(ShipError::Proto(shipproto::ProtoError::BadSubcommand(
            "entry count exceeds command size",
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Item commands
// ---------------------------------------------------------------------------

fn decode_item(data: &[u8], at: usize) -> Result<ItemData, ShipError> {
    let bytes: &[u8; 20] = data
        .get(at..at + 20)
        .and_then(|s| s.try_into().ok())
        .ok_or(ShipError::Proto(shipproto::ProtoError::BadSubcommand(
            "item record truncated",
        )))?;
    Ok(ItemData::decode(bytes))
}

/// 6x2A: player dropped an inventory item on the ground.
/// Body: item_id u32, area u16, unused u16, x f32, z f32.
fn on_player_drop_item(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.client_id_matches()? {
        return Ok(());
    }
    if ctx.room().item_tracking {
        if ctx.data.len() < 20 {
            return Err(ShipError::Proto(shipproto::ProtoError::BadSubcommand(
                "drop item too short",
            )));
        }
        let item_id = u32::from_le_bytes(ctx.data[4..8].try_into().unwrap());
        let area = u16::from_le_bytes(ctx.data[8..10].try_into().unwrap()) as u8;
        let x = f32::from_le_bytes(ctx.data[12..16].try_into().unwrap());
        let z = f32::from_le_bytes(ctx.data[16..20].try_into().unwrap());

        let item = ctx.sender_mut().player.remove_item(item_id, 0)?;
        ctx.room_mut().add_ground(item, area, x, z)?;
        info!(
            slot = ctx.sender_slot(),
            item = format_args!("{item_id:08X}"),
            area,
            "player dropped item"
        );
    }
    ctx.forward()
}

/// 6x2B: client-created inventory item (tekker result, leader grants).
/// The server is item authority in V4, so V4 clients never get to do
/// this.
fn on_create_inventory_item(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.client_id_matches()? {
        return Ok(());
    }
    if ctx.sender().dialect == Dialect::V4 {
        return Ok(());
    }
    if ctx.room().item_tracking {
        let item = decode_item(ctx.data, 4)?;
        ctx.sender_mut().player.add_item(InventoryItem::new(item))?;
        info!(
            slot = ctx.sender_slot(),
            item = format_args!("{:08X}", item.id),
            "created inventory item"
        );
    }
    ctx.forward()
}

/// 6x5D: drop part of a stack (pre-V4 dialects; the leader owns item
/// state, we just mirror it).
/// Body: area u16, unused u16, x f32, z f32, item 20 bytes.
fn on_drop_partial_stack(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.room().is_game || ctx.room().dialect == Dialect::V4 {
        return Ok(());
    }
    if ctx.room().item_tracking {
        if ctx.data.len() < 36 {
            return Err(ShipError::Proto(shipproto::ProtoError::BadSubcommand(
                "stack drop too short",
            )));
        }
        let area = ctx.data[4];
        let x = f32::from_le_bytes(ctx.data[8..12].try_into().unwrap());
        let z = f32::from_le_bytes(ctx.data[12..16].try_into().unwrap());
        let item = decode_item(ctx.data, 16)?;
        ctx.room_mut().add_ground(item, area, x, z)?;
    }
    ctx.forward()
}

/// 6xC3: split a stack (V4). The server deducts the stack, issues a new
/// id when a partial stack was taken, places the ground item, and echoes
/// an authoritative drop to the whole room.
/// Body: item_id u32, amount u32, area u16 (le) + unused, x f32, z f32.
fn on_split_stack(ctx: &mut Ctx) -> Result<(), ShipError> {
    if ctx.room().dialect != Dialect::V4 {
        return ctx.forward();
    }
    if !ctx.room().is_game || !ctx.client_id_matches()? {
        return Ok(());
    }
    if !ctx.room().item_tracking {
        return Err(ShipError::Internal("item tracking off in a v4 game"));
    }
    if ctx.data.len() < 24 {
        return Err(ShipError::Proto(shipproto::ProtoError::BadSubcommand(
            "split stack too short",
        )));
    }
    let item_id = u32::from_le_bytes(ctx.data[4..8].try_into().unwrap());
    let amount = u32::from_le_bytes(ctx.data[8..12].try_into().unwrap());
    let area = u16::from_le_bytes(ctx.data[12..14].try_into().unwrap()) as u8;
    let x = f32::from_le_bytes(ctx.data[16..20].try_into().unwrap());
    let z = f32::from_le_bytes(ctx.data[20..24].try_into().unwrap());

    let mut item = ctx.sender_mut().player.remove_item(item_id, amount)?;
    if item.id == ITEM_ID_UNASSIGNED {
        let slot = ctx.sender_slot() as u8;
        item.id = ctx.room_mut().generate_item_id(slot);
    }
    ctx.room_mut().add_ground(item, area, x, z)?;
    info!(
        slot = ctx.sender_slot(),
        item = format_args!("{item_id:08X}"),
        amount,
        new_id = format_args!("{:08X}", item.id),
        "stack split to ground"
    );

    let cmd = drop_stacked_item_cmd(ctx.sender_slot(), &item, area, x, z);
    ctx.broadcast_sub(&cmd);
    Ok(())
}

/// Server-authoritative 6x5D echo for a split stack: area, position,
/// the item record, and a reserved trailing word.
fn drop_stacked_item_cmd(slot: u16, item: &ItemData, area: u8, x: f32, z: f32) -> Vec<u8> {
    let mut body = Vec::with_capacity(36);
    body.extend_from_slice(&(area as u16).to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&x.to_le_bytes());
    body.extend_from_slice(&z.to_le_bytes());
    body.extend_from_slice(&item.encode());
    body.extend_from_slice(&0u32.to_le_bytes());
    build_sub(0x5D, slot, &body)
}

/// 6x5E: buy from a shop (pre-V4; client-authoritative).
fn on_buy_shop_item(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.room().is_game || !ctx.client_id_matches()? {
        return Ok(());
    }
    if ctx.room().dialect == Dialect::V4 {
        return Ok(());
    }
    if ctx.room().item_tracking {
        let item = decode_item(ctx.data, 4)?;
        ctx.sender_mut().player.add_item(InventoryItem::new(item))?;
    }
    ctx.forward()
}

/// 6x5F: leader-created ground item from a box or enemy (pre-V4).
/// Body: area u8, from_enemy u8, request_id u16, x f32, z f32, item 20b.
fn on_box_or_enemy_item_drop(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.room().is_game || ctx.sender_slot() as usize != ctx.room().leader {
        return Ok(());
    }
    if ctx.room().dialect == Dialect::V4 {
        return Ok(());
    }
    if ctx.data.len() >= 36 {
        let area = ctx.data[4];
        let x = f32::from_le_bytes(ctx.data[8..12].try_into().unwrap());
        let z = f32::from_le_bytes(ctx.data[12..16].try_into().unwrap());
        let item = decode_item(ctx.data, 16)?;
        if ctx.room().item_tracking {
            ctx.room_mut().add_ground(item, area, x, z)?;
        }
        info!(
            item = format_args!("{:08X}", item.id),
            area, "leader created ground item"
        );
    }
    ctx.forward()
}

/// 6x59: item picked up (pre-V4; the slot in the body says who).
/// Body: picker u16, area u16, item_id u32.
fn on_pick_up_item(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.room().is_game || ctx.room().dialect == Dialect::V4 {
        return Ok(());
    }
    let picker = client_id(ctx.data)? as usize;
    let Some(target) = ctx.room().session_at(picker) else {
        return Ok(());
    };
    if ctx.room().item_tracking && ctx.data.len() >= 12 {
        let item_id = u32::from_le_bytes(ctx.data[8..12].try_into().unwrap());
        let ground = ctx.room_mut().remove_ground(item_id)?;
        ctx.ship
            .sessions
            .get_mut(&target)
            .expect("occupant exists")
            .player
            .add_item(InventoryItem::new(ground.item))?;
        info!(slot = picker, item = format_args!("{item_id:08X}"), "picked up item");
    }
    ctx.forward()
}

/// 6x5A: pick-up request. V4 performs the transfer itself and echoes an
/// authoritative 6x59; earlier dialects forward to the leader.
/// Body: item_id u32, area u8.
fn on_pick_up_item_request(ctx: &mut Ctx) -> Result<(), ShipError> {
    if ctx.room().dialect != Dialect::V4 {
        return ctx.forward();
    }
    if !ctx.room().is_game || !ctx.client_id_matches()? {
        return Ok(());
    }
    if !ctx.room().item_tracking {
        return Err(ShipError::Internal("item tracking off in a v4 game"));
    }
    if ctx.data.len() < 8 {
        return Err(ShipError::Proto(shipproto::ProtoError::BadSubcommand(
            "pick up request too short",
        )));
    }
    let item_id = u32::from_le_bytes(ctx.data[4..8].try_into().unwrap());
    let area = ctx.data.get(8).copied().unwrap_or(0);

    let ground = ctx.room_mut().remove_ground(item_id)?;
    ctx.sender_mut().player.add_item(InventoryItem::new(ground.item))?;
    info!(
        slot = ctx.sender_slot(),
        item = format_args!("{item_id:08X}"),
        "picked up item"
    );

    let slot = ctx.sender_slot();
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&slot.to_le_bytes());
    body.extend_from_slice(&(area as u16).to_le_bytes());
    body.extend_from_slice(&item_id.to_le_bytes());
    let cmd = build_sub(0x59, slot, &body);
    ctx.broadcast_sub(&cmd);
    Ok(())
}

/// 6x25 equip / 6x26 unequip: flip the equip bit on the inventory entry.
/// Body: item_id u32.
fn on_equip_unequip_item(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.client_id_matches()? {
        return Ok(());
    }
    if ctx.room().item_tracking {
        if ctx.data.len() < 8 {
            return Err(ShipError::Proto(shipproto::ProtoError::BadSubcommand(
                "equip command too short",
            )));
        }
        let item_id = u32::from_le_bytes(ctx.data[4..8].try_into().unwrap());
        let equip = ctx.data[0] == 0x25;
        let player = &mut ctx.sender_mut().player;
        let index = player.find_item(item_id)?;
        if equip {
            player.inventory[index].flags |= shipproto::items::FLAG_EQUIPPED;
        } else {
            player.inventory[index].flags &= !shipproto::items::FLAG_EQUIPPED;
        }
    } else if ctx.room().dialect == Dialect::V4 {
        return Err(ShipError::Internal("item tracking off in a v4 game"));
    }
    ctx.forward()
}

/// 6x27: use an item; consumables leave the inventory.
/// Body: item_id u32.
fn on_use_item(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.client_id_matches()? {
        return Ok(());
    }
    if ctx.room().item_tracking {
        if ctx.data.len() < 8 {
            return Err(ShipError::Proto(shipproto::ProtoError::BadSubcommand(
                "use item too short",
            )));
        }
        let item_id = u32::from_le_bytes(ctx.data[4..8].try_into().unwrap());
        let slot = ctx.sender_slot();
        ctx.sender_mut().player.remove_item(item_id, 1)?;
        info!(slot, item = format_args!("{item_id:08X}"), "used item");
    }
    ctx.forward()
}

/// 6x29: destroy an inventory item (bank deposit, mag feed, sale).
/// Body: item_id u32, amount u32.
fn on_destroy_inventory_item(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.room().is_game || !ctx.client_id_matches()? {
        return Ok(());
    }
    if ctx.room().item_tracking {
        if ctx.data.len() < 12 {
            return Err(ShipError::Proto(shipproto::ProtoError::BadSubcommand(
                "destroy item too short",
            )));
        }
        let item_id = u32::from_le_bytes(ctx.data[4..8].try_into().unwrap());
        let amount = u32::from_le_bytes(ctx.data[8..12].try_into().unwrap());
        ctx.sender_mut().player.remove_item(item_id, amount)?;
        info!(
            slot = ctx.sender_slot(),
            item = format_args!("{item_id:08X}"),
            amount,
            "inventory item destroyed"
        );
    }
    ctx.forward()
}

/// 6x63: destroy a ground item (dropped when too many accumulate).
/// Body: item_id u32, area u32.
fn on_destroy_ground_item(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.room().is_game {
        return Ok(());
    }
    if ctx.room().item_tracking {
        if ctx.data.len() < 8 {
            return Err(ShipError::Proto(shipproto::ProtoError::BadSubcommand(
                "destroy ground item too short",
            )));
        }
        let item_id = u32::from_le_bytes(ctx.data[4..8].try_into().unwrap());
        ctx.room_mut().remove_ground(item_id)?;
        info!(item = format_args!("{item_id:08X}"), "ground item destroyed");
    }
    ctx.forward()
}

// ---------------------------------------------------------------------------
// Drops and experience
// ---------------------------------------------------------------------------

/// Shared drop pipeline for enemy (6x60) and box (6xA2) requests.
/// Returns false when the room's dialect makes the leader the item
/// authority, in which case the request is forwarded instead.
fn generate_drop(
    ctx: &mut Ctx,
    enemy_id: Option<u16>,
    area: u8,
    x: f32,
    z: f32,
    request_id: u16,
) -> Result<bool, ShipError> {
    if ctx.room().dialect != Dialect::V4 {
        return Ok(false);
    }

    let (episode, difficulty, section_id) = {
        let r = ctx.room();
        (r.episode, r.difficulty, r.section_id)
    };

    // Rare roll first; a hit short-circuits the common generator.
    let mut item: Option<ItemData> = None;
    if let Some(rare_set) = ctx.ship.rare_items.clone() {
        let table = rare_set.table(episode.saturating_sub(1), difficulty, section_id);
        let room = ctx.ship.rooms.get_mut(&ctx.rid).expect("room exists");
        match enemy_id {
            None => {
                for i in 0..table.box_areas.len() {
                    if table.box_areas[i] != area {
                        continue;
                    }
                    if RareItemSet::sample(&mut room.rng, table.box_rares[i].probability) {
                        item = Some(rare_to_item(&table.box_rares[i]));
                        break;
                    }
                }
            }
            Some(id) if (id as usize) < table.monster_rares.len() => {
                if RareItemSet::sample(&mut room.rng, table.monster_rares[id as usize].probability)
                {
                    item = Some(rare_to_item(&table.monster_rares[id as usize]));
                }
            }
            Some(_) => {}
        }
    }

    if item.is_none() {
        let common = ctx.ship.common_items.clone();
        let room = ctx.ship.rooms.get_mut(&ctx.rid).expect("room exists");
        item = common.create_drop_item(
            enemy_id.is_none(),
            episode,
            difficulty,
            area,
            section_id,
            &mut room.rng,
        );
    }
    let Some(mut item) = item else {
        return Ok(true); // nothing dropped
    };

    item.id = ctx.room_mut().generate_item_id(0xFF);
    if ctx.room().item_tracking {
        ctx.room_mut().add_ground(item, area, x, z)?;
    }
    let cmd = drop_item_cmd(&item, enemy_id.is_some(), area, request_id, x, z);
    ctx.broadcast_sub(&cmd);
    Ok(true)
}

/// Server-generated 6x5F: area, from_enemy, request_id, position, two
/// reserved words, the item record, and a reserved trailing word.
fn drop_item_cmd(item: &ItemData, from_enemy: bool, area: u8, request_id: u16, x: f32, z: f32) -> Vec<u8> {
    let mut body = Vec::with_capacity(40);
    body.push(area);
    body.push(from_enemy as u8);
    body.extend_from_slice(&request_id.to_le_bytes());
    body.extend_from_slice(&x.to_le_bytes());
    body.extend_from_slice(&z.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&item.encode());
    body.extend_from_slice(&0u32.to_le_bytes());
    build_sub(0x5F, 0, &body)
}

/// 6x60: enemy drop request.
/// Body: area u8, enemy_id u8, request_id u16, x f32, z f32, two
/// reserved words (plus a reserved trailing word on the wide layouts).
fn on_enemy_drop_item_request(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.room().is_game {
        return Ok(());
    }
    if ctx.data.len() < 16 {
        return Err(ShipError::Proto(shipproto::ProtoError::BadSubcommand(
            "drop request too short",
        )));
    }
    let area = ctx.data[4];
    let enemy_id = ctx.data[5] as u16;
    let request_id = u16::from_le_bytes(ctx.data[6..8].try_into().unwrap());
    let x = f32::from_le_bytes(ctx.data[8..12].try_into().unwrap());
    let z = f32::from_le_bytes(ctx.data[12..16].try_into().unwrap());
    if !generate_drop(ctx, Some(enemy_id), area, x, z, request_id)? {
        ctx.forward()?;
    }
    Ok(())
}

/// 6xA2: box drop request.
/// Body: area u8, unused u8, request_id u16, x f32, z f32.
fn on_box_drop_item_request(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.room().is_game {
        return Ok(());
    }
    if ctx.data.len() < 16 {
        return Err(ShipError::Proto(shipproto::ProtoError::BadSubcommand(
            "drop request too short",
        )));
    }
    let area = ctx.data[4];
    let request_id = u16::from_le_bytes(ctx.data[6..8].try_into().unwrap());
    let x = f32::from_le_bytes(ctx.data[8..12].try_into().unwrap());
    let z = f32::from_le_bytes(ctx.data[12..16].try_into().unwrap());
    if !generate_drop(ctx, None, area, x, z, request_id)? {
        ctx.forward()?;
    }
    Ok(())
}

/// 6x75: phase setup. When a boss's final phase completes, synthesise a
/// drop request from the leader so the boss reward appears.
/// Body: phase u32, unused u32, difficulty u32.
fn on_phase_setup(ctx: &mut Ctx) -> Result<(), ShipError> {
    if matches!(ctx.sender().dialect, Dialect::V1 | Dialect::V2) {
        return ctx.forward();
    }
    if !ctx.room().is_game {
        return Ok(());
    }
    ctx.forward()?;
    if ctx.data.len() < 16 {
        return Ok(());
    }
    let phase = u32::from_le_bytes(ctx.data[4..8].try_into().unwrap());
    let difficulty = u32::from_le_bytes(ctx.data[12..16].try_into().unwrap());
    if difficulty != ctx.room().difficulty as u32 {
        return Ok(());
    }

    let (episode, room_difficulty) = (ctx.room().episode, ctx.room().difficulty);
    let area = ctx.sender().area;
    // Dark Falz has no third phase on Normal; the request fires at the
    // end of phase 0x35 there and 0x37 everywhere else. The Episode 2
    // boss uses phase 0x57.
    let fire = match (episode, area) {
        (1, 0x0E) => {
            (room_difficulty == 0 && phase == 0x35) || (room_difficulty != 0 && phase == 0x37)
        }
        (2, 0x0D) => phase == 0x57,
        _ => false,
    };
    if !fire {
        return Ok(());
    }

    let leader_slot = ctx.room().leader;
    let enemy_id: u8 = if episode == 2 { 0x4E } else { 0x2F };
    let x: f32 = if episode == 2 { -9999.0 } else { 10160.58984375 };
    let mut body = Vec::with_capacity(20);
    body.push(area);
    body.push(enemy_id);
    body.extend_from_slice(&0x0B4Fu16.to_le_bytes());
    body.extend_from_slice(&x.to_le_bytes());
    body.extend_from_slice(&0f32.to_le_bytes());
    body.extend_from_slice(&2u16.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&0xE0AE_DC01u32.to_le_bytes());
    let req = build_sub(0x60, 0, &body);
    let rid = ctx.rid;
    ctx.ship.private_send(rid, leader_slot, 0x62, leader_slot as u32, &req);
    Ok(())
}

/// 6x0A: enemy hit. Records who hit what for the experience split.
fn on_enemy_hit(ctx: &mut Ctx) -> Result<(), ShipError> {
    if ctx.room().dialect == Dialect::V4 {
        if !ctx.room().is_game {
            return Ok(());
        }
        let enemy_id = client_id(ctx.data)?;
        let slot = ctx.sender_slot() as u8;
        let room = ctx.room_mut();
        if let Ok(enemy) = room.enemy_mut(enemy_id) {
            if !enemy.is_dead() {
                enemy.hit_flags |= 1 << slot;
                enemy.last_hit = slot;
            }
        } else {
            return Ok(()); // stale id after reload; drop silently
        }
    }
    ctx.forward()
}

/// 6xC8: enemy killed. Awards experience once: full for the killing
/// blow, 77% for everyone else who tagged it. Level-ups apply the class
/// table deltas and are published to the room.
fn on_enemy_killed(ctx: &mut Ctx) -> Result<(), ShipError> {
    ctx.forward()?;
    if ctx.room().dialect != Dialect::V4 {
        return Ok(());
    }
    if !ctx.room().is_game {
        return Err(ShipError::Internal("enemy killed outside a game"));
    }
    let enemy_id = client_id(ctx.data)?;
    let level_table = ctx.ship.level_table.clone();

    let (experience, hit_flags, last_hit) = {
        let room = ctx.room_mut();
        let enemy = match room.enemy_mut(enemy_id) {
            Ok(e) => e,
            Err(_) => {
                info!(enemy = enemy_id, "kill for missing enemy entry");
                return Ok(());
            }
        };
        if enemy.is_dead() {
            return Ok(());
        }
        if enemy.experience == ENEMY_EXP_UNKNOWN {
            info!(enemy = enemy_id, "kill for unknown enemy type");
            return Ok(());
        }
        enemy.hit_flags |= HIT_FLAG_DEAD;
        (enemy.experience, enemy.hit_flags, enemy.last_hit)
    };

    for (slot, peer) in ctx.room().occupants() {
        if hit_flags & (1 << slot) == 0 {
            continue;
        }
        let player = &ctx.ship.sessions[&peer].player;
        if player.level >= MAX_LEVEL {
            continue;
        }
        let exp = if last_hit == slot as u8 {
            experience
        } else {
            experience * 77 / 100
        };

        let (char_class, mut level, total_exp) = {
            let p = &mut ctx.ship.sessions.get_mut(&peer).expect("occupant").player;
            p.experience = p.experience.saturating_add(exp);
            (p.char_class, p.level, p.experience)
        };
        let give = build_sub(0xBF, slot as u16, &exp.to_le_bytes());
        ctx.broadcast_sub(&give);

        let mut leveled = false;
        while level < MAX_LEVEL {
            let next = level_table.stats_for_level(char_class, level + 1);
            if total_exp < next.experience {
                break;
            }
            let delta = next.delta();
            let p = &mut ctx.ship.sessions.get_mut(&peer).expect("occupant").player;
            p.level += 1;
            p.stats.apply_delta(&delta);
            level += 1;
            leveled = true;
        }
        if leveled {
            let p = &ctx.ship.sessions[&peer].player;
            let mut body = Vec::with_capacity(16);
            body.extend_from_slice(&p.stats.atp.to_le_bytes());
            body.extend_from_slice(&p.stats.mst.to_le_bytes());
            body.extend_from_slice(&p.stats.evp.to_le_bytes());
            body.extend_from_slice(&p.stats.hp.to_le_bytes());
            body.extend_from_slice(&p.stats.dfp.to_le_bytes());
            body.extend_from_slice(&p.stats.ata.to_le_bytes());
            body.extend_from_slice(&p.level.to_le_bytes());
            let cmd = build_sub(0x30, slot as u16, &body);
            ctx.broadcast_sub(&cmd);
            info!(slot, level = ctx.ship.sessions[&peer].player.level, "level up");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Shop and bank (V4)
// ---------------------------------------------------------------------------

/// 6xB5: shop contents request on V4; the card-battle command stream on
/// card games.
/// Body: shop_type u32.
fn on_open_shop_or_card_subs(ctx: &mut Ctx) -> Result<(), ShipError> {
    if ctx.room().card_battle {
        return on_card_battle_subs(ctx);
    }
    if ctx.room().dialect != Dialect::V4 || !ctx.room().is_game {
        return Ok(());
    }
    if ctx.data.len() < 8 {
        return Err(ShipError::Proto(shipproto::ProtoError::BadSubcommand(
            "shop request too short",
        )));
    }
    let shop_type = u32::from_le_bytes(ctx.data[4..8].try_into().unwrap());
    let shop_class = match shop_type {
        0 => 3u8, // tools
        1 => 0,   // weapons
        2 => 1,   // armor
        _ => {
            ctx.sender_mut().shop_contents.clear();
            return Ok(());
        }
    };

    let common = ctx.ship.common_items.clone();
    let difficulty = ctx.room().difficulty;
    let count = {
        let room = ctx.room_mut();
        9 + (room.rng.random_range(0..4u32) as usize)
    };
    let slot = ctx.sender_slot() as u8;
    let mut contents = Vec::with_capacity(count);
    for _ in 0..count {
        let mut item = {
            let room = ctx.room_mut();
            common.create_shop_item(difficulty, shop_class, &mut room.rng)
        };
        item.id = ctx.room_mut().generate_item_id(slot);
        contents.push(item);
    }

    // 6xB6 extended-size reply, private to the requester.
    let mut payload = Vec::with_capacity(12 + contents.len() * 20);
    payload.extend_from_slice(&[0xB6, 0x00, 0x00, 0x00]);
    payload.extend_from_slice(&0u32.to_le_bytes()); // extended size, patched below
    payload.push(shop_type as u8);
    payload.push(contents.len() as u8);
    payload.extend_from_slice(&0u16.to_le_bytes());
    for item in &contents {
        payload.extend_from_slice(&item.encode());
    }
    let padded = (payload.len() + 3) & !3;
    payload.resize(padded, 0);
    let size = (payload.len() as u32).to_le_bytes();
    payload[4..8].copy_from_slice(&size);

    ctx.sender_mut().shop_contents = contents;
    let sid = ctx.sid;
    ctx.send_sub_to(sid, &payload);
    Ok(())
}

/// 6xBB: bank open on V4 games; card trade counter passthrough on card
/// lobbies.
fn on_open_bank_or_card_counter(ctx: &mut Ctx) -> Result<(), ShipError> {
    if ctx.room().card_battle {
        return ctx.forward();
    }
    if ctx.room().dialect != Dialect::V4 || !ctx.room().is_game {
        return Ok(());
    }
    // 6xBC extended-size reply with the bank contents.
    let p = &ctx.sender().player;
    let mut payload = Vec::with_capacity(16 + p.bank.items.len() * 24);
    payload.extend_from_slice(&[0xBC, 0x00, 0x00, 0x00]);
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload.extend_from_slice(&(p.bank.items.len() as u32).to_le_bytes());
    payload.extend_from_slice(&p.bank.meseta.to_le_bytes());
    for item in &p.bank.items {
        payload.extend_from_slice(&item.item().encode());
        payload.extend_from_slice(&item.flags.to_le_bytes());
    }
    let padded = (payload.len() + 7) & !7;
    payload.resize(padded, 0);
    let size = (payload.len() as u32).to_le_bytes();
    payload[4..8].copy_from_slice(&size);

    let sid = ctx.sid;
    ctx.send_sub_to(sid, &payload);
    Ok(())
}

/// 6xBD: bank transaction. Deposits and withdrawals validate ownership
/// and the meseta cap, then move the item or currency in one step; a
/// withdrawn item gets a fresh room-unique id.
/// Body: item_id u32, meseta_amount u32, action u8, item_amount u8.
fn on_bank_action(ctx: &mut Ctx) -> Result<(), ShipError> {
    if ctx.room().dialect != Dialect::V4 {
        return Ok(());
    }
    if !ctx.room().is_game {
        return Ok(());
    }
    if !ctx.room().item_tracking {
        return Err(ShipError::Internal("item tracking off in a v4 game"));
    }
    if ctx.data.len() < 14 {
        return Err(ShipError::Proto(shipproto::ProtoError::BadSubcommand(
            "bank action too short",
        )));
    }
    let item_id = u32::from_le_bytes(ctx.data[4..8].try_into().unwrap());
    let meseta_amount = u32::from_le_bytes(ctx.data[8..12].try_into().unwrap());
    let action = ctx.data[12];
    let item_amount = ctx.data[13] as u32;
    let slot = ctx.sender_slot();

    match action {
        0 => {
            // Deposit.
            if item_id == ITEM_ID_UNASSIGNED {
                let p = &mut ctx.sender_mut().player;
                if meseta_amount > p.meseta
                    || p.bank.meseta + meseta_amount > shipproto::items::MESETA_STACK_LIMIT
                {
                    return Ok(());
                }
                p.meseta -= meseta_amount;
                p.bank.meseta += meseta_amount;
            } else {
                if ctx.sender().player.bank.items.len() >= crate::player::BANK_CAP {
                    return Err(ShipError::BankFull);
                }
                let item = ctx.sender_mut().player.remove_item(item_id, item_amount)?;
                ctx.sender_mut()
                    .player
                    .bank
                    .items
                    .push(InventoryItem::new(item).into());
                let mut body = Vec::with_capacity(8);
                body.extend_from_slice(&item_id.to_le_bytes());
                body.extend_from_slice(&item_amount.to_le_bytes());
                let cmd = build_sub(0x29, slot, &body);
                ctx.broadcast_sub(&cmd);
            }
        }
        1 => {
            // Withdraw.
            if item_id == ITEM_ID_UNASSIGNED {
                let p = &mut ctx.sender_mut().player;
                if meseta_amount > p.bank.meseta
                    || p.meseta + meseta_amount > shipproto::items::MESETA_STACK_LIMIT
                {
                    return Ok(());
                }
                p.bank.meseta -= meseta_amount;
                p.meseta += meseta_amount;
            } else {
                let index = ctx
                    .sender()
                    .player
                    .bank
                    .items
                    .iter()
                    .position(|i| i.id == item_id)
                    .ok_or(ShipError::NoSuchItem(item_id))?;
                let mut item = {
                    let p = &mut ctx.sender_mut().player;
                    p.bank.items.remove(index).item()
                };
                item.id = ctx.room_mut().generate_item_id(0xFF);
                ctx.sender_mut().player.add_item(InventoryItem::new(item))?;
                // 6x2B with the reserved trailing word.
                let mut body = Vec::with_capacity(24);
                body.extend_from_slice(&item.encode());
                body.extend_from_slice(&0u32.to_le_bytes());
                let cmd = build_sub(0x2B, slot, &body);
                ctx.broadcast_sub(&cmd);
            }
        }
        _ => {}
    }
    Ok(())
}

/// 6xC4: sort inventory to the client's requested id order (V4).
/// Body: 30 item ids, unused slots 0xFFFFFFFF.
fn on_sort_inventory(ctx: &mut Ctx) -> Result<(), ShipError> {
    if ctx.room().dialect != Dialect::V4 {
        return Ok(());
    }
    if !ctx.room().item_tracking {
        return Err(ShipError::Internal("item tracking off in a v4 game"));
    }
    if ctx.data.len() < 4 + 30 * 4 {
        return Err(ShipError::Proto(shipproto::ProtoError::BadSubcommand(
            "sort inventory too short",
        )));
    }
    let ids: Vec<u32> = (0..30usize)
        .map(|i| {
            let at = 4 + i * 4;
            u32::from_le_bytes(ctx.data[at..at + 4].try_into().unwrap())
        })
        .filter(|&id| id != ITEM_ID_UNASSIGNED)
        .collect();
    let player = &mut ctx.sender_mut().player;
    let mut sorted = Vec::with_capacity(player.inventory.len());
    for id in ids {
        let index = player.find_item(id)?;
        sorted.push(player.inventory[index]);
    }
    if sorted.len() == player.inventory.len() {
        player.inventory = sorted;
    }
    Ok(())
}

/// 6xC5: medical center; flat 10 meseta fee.
fn on_medical_center(ctx: &mut Ctx) -> Result<(), ShipError> {
    if ctx.room().dialect != Dialect::V4 {
        return Ok(());
    }
    let p = &mut ctx.sender_mut().player;
    if p.meseta < 10 {
        return Err(ShipError::InsufficientFunds);
    }
    p.meseta -= 10;
    Ok(())
}

/// 6xB7/6xB8/6xBA/6xC0: shop pricing and item identification carry
/// legacy unresolved semantics; refuse rather than guess.
fn on_unsupported_trade(ctx: &mut Ctx) -> Result<(), ShipError> {
    if ctx.room().dialect != Dialect::V4 {
        return ctx.forward();
    }
    Err(ShipError::Unsupported("shop pricing / identification"))
}

// ---------------------------------------------------------------------------
// Card battle
// ---------------------------------------------------------------------------

/// 6xB3/6xB4 (and 6xB5 in card rooms): mask rotation then forward to
/// card-capable peers.
fn on_card_battle_subs(ctx: &mut Ctx) -> Result<(), ShipError> {
    if !ctx.room().is_game || !ctx.room().card_battle {
        return Ok(());
    }
    let mut data = ctx.data.to_vec();
    rotate_mask(&mut data, 0)?;

    let masking_disabled = ctx
        .ship
        .card_index
        .as_ref()
        .is_some_and(|idx| idx.masking_disabled());
    if !masking_disabled {
        let key = {
            let room = ctx.room_mut();
            let mut key = 0u8;
            while key == 0 {
                key = room.rng.random::<u8>();
            }
            key
        };
        rotate_mask(&mut data, key)?;
    }
    ctx.forward_data(&data)
}

// ---------------------------------------------------------------------------
// The table
// ---------------------------------------------------------------------------

use Entry::*;

static TABLE: [Entry; 0x100] = [
    /* 00 */ Invalid,
    /* 01 */ Nop,
    /* 02 */ Nop,
    /* 03 */ Nop,
    /* 04 */ Nop,
    /* 05 */ H(on_switch_state_changed),
    /* 06 */ H(on_send_guild_card),
    /* 07 */ H(on_symbol_chat),
    /* 08 */ Nop,
    /* 09 */ Nop,
    /* 0A */ H(on_enemy_hit),
    /* 0B */ FwdGame,
    /* 0C */ FwdGame, // add condition
    /* 0D */ FwdGame, // remove condition
    /* 0E */ Nop,
    /* 0F */ Nop,
    /* 10 */ Nop,
    /* 11 */ Nop,
    /* 12 */ FwdGame, // dragon boss actions
    /* 13 */ FwdGame, // de rol le boss actions
    /* 14 */ FwdGame,
    /* 15 */ FwdGame, // vol opt boss actions
    /* 16 */ FwdGame, // vol opt boss actions
    /* 17 */ FwdGame,
    /* 18 */ FwdGame,
    /* 19 */ FwdGame, // dark falz actions
    /* 1A */ Nop,
    /* 1B */ Nop,
    /* 1C */ FwdGame,
    /* 1D */ Nop,
    /* 1E */ Nop,
    /* 1F */ Fwd,
    /* 20 */ Fwd,
    /* 21 */ H(on_change_area),
    /* 22 */ FwdClient, // set player visibility (loading)
    /* 23 */ H(on_set_player_visibility),
    /* 24 */ FwdGame,
    /* 25 */ H(on_equip_unequip_item),
    /* 26 */ H(on_equip_unequip_item),
    /* 27 */ H(on_use_item),
    /* 28 */ FwdGame, // feed mag
    /* 29 */ H(on_destroy_inventory_item),
    /* 2A */ H(on_player_drop_item),
    /* 2B */ H(on_create_inventory_item),
    /* 2C */ Fwd, // talk to npc
    /* 2D */ Fwd, // done talking
    /* 2E */ Nop,
    /* 2F */ H(on_hit_by_enemy),
    /* 30 */ FwdGame, // level up
    /* 31 */ FwdGame, // medical center
    /* 32 */ FwdGame, // medical center
    /* 33 */ FwdGame, // revival item
    /* 34 */ Nop,
    /* 35 */ Nop,
    /* 36 */ FwdGame,
    /* 37 */ FwdGame, // photon blast
    /* 38 */ Nop,
    /* 39 */ FwdGame, // photon blast ready
    /* 3A */ FwdGame,
    /* 3B */ Fwd,
    /* 3C */ Nop,
    /* 3D */ Nop,
    /* 3E */ H(on_movement), // stop at position
    /* 3F */ H(on_movement), // set position
    /* 40 */ H(on_movement), // walk
    /* 41 */ Nop,
    /* 42 */ H(on_movement), // run
    /* 43 */ FwdClient,
    /* 44 */ FwdClient,
    /* 45 */ FwdClient,
    /* 46 */ H(on_attack_finished),
    /* 47 */ H(on_cast_technique),
    /* 48 */ H(on_cast_technique_finished),
    /* 49 */ H(on_subtract_pb_energy),
    /* 4A */ FwdClient,
    /* 4B */ H(on_hit_by_enemy),
    /* 4C */ H(on_hit_by_enemy),
    /* 4D */ FwdClient,
    /* 4E */ FwdClient,
    /* 4F */ FwdClient,
    /* 50 */ FwdClient,
    /* 51 */ Nop,
    /* 52 */ Fwd, // shop/bank interaction toggle
    /* 53 */ FwdGame,
    /* 54 */ Nop,
    /* 55 */ FwdClient, // intra-map warp
    /* 56 */ FwdClient,
    /* 57 */ FwdClient,
    /* 58 */ FwdGame,
    /* 59 */ H(on_pick_up_item),
    /* 5A */ H(on_pick_up_item_request),
    /* 5B */ Nop,
    /* 5C */ Nop,
    /* 5D */ H(on_drop_partial_stack),
    /* 5E */ H(on_buy_shop_item),
    /* 5F */ H(on_box_or_enemy_item_drop),
    /* 60 */ H(on_enemy_drop_item_request),
    /* 61 */ FwdGame, // feed mag
    /* 62 */ Nop,
    /* 63 */ H(on_destroy_ground_item),
    /* 64 */ Nop,
    /* 65 */ Nop,
    /* 66 */ FwdGame, // star atomizer
    /* 67 */ FwdGame, // create enemy set
    /* 68 */ FwdGame, // telepipe
    /* 69 */ FwdGame,
    /* 6A */ FwdGame,
    /* 6B */ FwdLoading,
    /* 6C */ FwdLoading,
    /* 6D */ FwdLoading,
    /* 6E */ FwdLoading,
    /* 6F */ FwdLoading,
    /* 70 */ FwdLoading,
    /* 71 */ FwdLoading,
    /* 72 */ FwdLoading,
    /* 73 */ Invalid,
    /* 74 */ H(on_word_select),
    /* 75 */ H(on_phase_setup),
    /* 76 */ FwdGame, // enemy spawn sync
    /* 77 */ FwdGame, // quest data sync
    /* 78 */ Nop,
    /* 79 */ Fwd, // lobby soccer
    /* 7A */ Nop,
    /* 7B */ Nop,
    /* 7C */ FwdGame,
    /* 7D */ FwdGame,
    /* 7E */ Nop,
    /* 7F */ Nop,
    /* 80 */ FwdGame, // trigger trap
    /* 81 */ Nop,
    /* 82 */ Nop,
    /* 83 */ FwdGame, // place trap
    /* 84 */ FwdGame,
    /* 85 */ FwdGame,
    /* 86 */ FwdGame, // hit destructible wall
    /* 87 */ Nop,
    /* 88 */ FwdGame,
    /* 89 */ FwdGame,
    /* 8A */ Nop,
    /* 8B */ Nop,
    /* 8C */ Nop,
    /* 8D */ FwdClient,
    /* 8E */ Nop,
    /* 8F */ Nop,
    /* 90 */ Nop,
    /* 91 */ FwdGame,
    /* 92 */ Nop,
    /* 93 */ FwdGame, // timed switch
    /* 94 */ FwdGame, // warp
    /* 95 */ Nop,
    /* 96 */ Nop,
    /* 97 */ Nop,
    /* 98 */ Nop,
    /* 99 */ Nop,
    /* 9A */ FwdGame, // player stat update
    /* 9B */ Nop,
    /* 9C */ FwdGame,
    /* 9D */ Nop,
    /* 9E */ Nop,
    /* 9F */ FwdGame, // gal gryphon actions
    /* A0 */ FwdGame, // gal gryphon actions
    /* A1 */ FwdGame,
    /* A2 */ H(on_box_drop_item_request),
    /* A3 */ FwdGame, // episode 2 boss actions
    /* A4 */ FwdGame, // olga flow phase 1
    /* A5 */ FwdGame, // olga flow phase 2
    /* A6 */ Fwd, // trade proposal
    /* A7 */ Nop,
    /* A8 */ FwdGame, // gol dragon actions
    /* A9 */ FwdGame, // barba ray actions
    /* AA */ FwdGame, // episode 2 boss actions
    /* AB */ FwdClient, // lobby chair
    /* AC */ Nop,
    /* AD */ FwdGame, // olga flow subordinate bosses
    /* AE */ FwdClient,
    /* AF */ FwdClient, // turn in lobby chair
    /* B0 */ FwdClient, // move in lobby chair
    /* B1 */ Nop,
    /* B2 */ Nop,
    /* B3 */ H(on_card_battle_subs),
    /* B4 */ H(on_card_battle_subs),
    /* B5 */ H(on_open_shop_or_card_subs),
    /* B6 */ Nop, // shop contents (server->client only)
    /* B7 */ H(on_unsupported_trade), // buy at shop
    /* B8 */ H(on_unsupported_trade), // identify item
    /* B9 */ Nop, // identify result (server->client only)
    /* BA */ H(on_unsupported_trade), // accept identification
    /* BB */ H(on_open_bank_or_card_counter),
    /* BC */ FwdEp3Game, // bank contents (server->client), card trade sequence
    /* BD */ H(on_bank_action),
    /* BE */ Fwd, // create inventory item (server->client), sound chat
    /* BF */ FwdEp3Lobby, // change lobby music; give-exp is server->client
    /* C0 */ H(on_unsupported_trade), // sell at shop
    /* C1 */ Nop,
    /* C2 */ Nop,
    /* C3 */ H(on_split_stack),
    /* C4 */ H(on_sort_inventory),
    /* C5 */ H(on_medical_center),
    /* C6 */ Nop,
    /* C7 */ Nop,
    /* C8 */ H(on_enemy_killed),
    /* C9 */ Nop,
    /* CA */ Nop,
    /* CB */ Nop,
    /* CC */ Nop,
    /* CD */ Nop,
    /* CE */ Nop,
    /* CF */ FwdGame,
    /* D0 */ Nop,
    /* D1 */ Nop,
    /* D2 */ Nop,
    /* D3 */ Nop,
    /* D4 */ Nop,
    /* D5 */ Nop,
    /* D6 */ Nop,
    /* D7 */ Nop,
    /* D8 */ Nop,
    /* D9 */ Nop,
    /* DA */ Nop,
    /* DB */ Nop,
    /* DC */ Nop,
    /* DD */ Nop,
    /* DE */ Nop,
    /* DF */ Nop,
    /* E0 */ Nop,
    /* E1 */ Nop,
    /* E2 */ Nop,
    /* E3 */ Nop,
    /* E4 */ Nop,
    /* E5 */ Nop,
    /* E6 */ Nop,
    /* E7 */ Nop,
    /* E8 */ Nop,
    /* E9 */ Nop,
    /* EA */ Nop,
    /* EB */ Nop,
    /* EC */ Nop,
    /* ED */ Nop,
    /* EE */ Nop,
    /* EF */ Nop,
    /* F0 */ Nop,
    /* F1 */ Nop,
    /* F2 */ Nop,
    /* F3 */ Nop,
    /* F4 */ Nop,
    /* F5 */ Nop,
    /* F6 */ Nop,
    /* F7 */ Nop,
    /* F8 */ Nop,
    /* F9 */ Nop,
    /* FA */ Nop,
    /* FB */ Nop,
    /* FC */ Nop,
    /* FD */ Nop,
    /* FE */ Nop,
    /* FF */ Nop,
];

/// True when the table carries a real policy for this sub-opcode.
pub fn subcommand_is_implemented(sub: u8) -> bool {
    !matches!(TABLE[sub as usize], Entry::Nop)
}
