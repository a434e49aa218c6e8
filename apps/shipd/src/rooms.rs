//! Room state: lobbies and games.
//!
//! A room is a fixed-capacity slot array of sessions plus, for games, the
//! item/enemy state the server is authoritative over in V4. The slot
//! index doubles as the client id on the wire. The leader always indexes
//! an occupied slot unless the room is empty.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::SeedableRng;

use shipproto::items::ItemData;
use shipproto::Dialect;

use crate::battlerec::BattleRecord;
use crate::error::ShipError;
use crate::session::SessionId;

pub type RoomId = u32;

pub const LOBBY_CAPACITY: usize = 12;
pub const GAME_CAPACITY: usize = 4;
pub const CARD_GAME_CAPACITY: usize = 12;

/// Item ids below this are never issued; inventories brought into a room
/// are re-identified starting here.
pub const FIRST_ITEM_ID: u32 = 0x0000_0010;

/// Sticky kill bit in an enemy's hit mask: set once, never cleared.
pub const HIT_FLAG_DEAD: u8 = 0x80;

/// Sentinel for enemy entries whose type was never resolved; they award
/// no experience.
pub const ENEMY_EXP_UNKNOWN: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy)]
pub struct GroundItem {
    pub item: ItemData,
    pub area: u8,
    pub x: f32,
    pub z: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct Enemy {
    pub type_id: u32,
    pub experience: u32,
    pub hit_flags: u8,
    pub last_hit: u8,
}

impl Enemy {
    pub fn new(type_id: u32, experience: u32) -> Enemy {
        Enemy {
            type_id,
            experience,
            hit_flags: 0,
            last_hit: 0,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.hit_flags & HIT_FLAG_DEAD != 0
    }
}

#[derive(Debug)]
pub struct Room {
    pub id: RoomId,
    pub dialect: Dialect,
    pub is_game: bool,
    /// 1-based, like the drop charts.
    pub episode: u8,
    pub difficulty: u8,
    pub section_id: u8,
    pub item_tracking: bool,
    pub cheats_enabled: bool,
    /// Card-battle game (or card-capable lobby when `is_game` is false).
    pub card_battle: bool,
    /// Poisoned by an invariant violation; the dispatcher stops touching
    /// it.
    pub quarantined: bool,
    slots: Vec<Option<SessionId>>,
    pub leader: usize,
    next_item_id: u32,
    pub ground_items: HashMap<u32, GroundItem>,
    pub enemies: Vec<Enemy>,
    pub rng: StdRng,
    pub battle_record: Option<BattleRecord>,
    /// Lobby rooms mirroring this game for spectators.
    pub watcher_rooms: Vec<RoomId>,
}

impl Room {
    pub fn new_lobby(id: RoomId, dialect: Dialect, rng_seed: u64) -> Room {
        Room {
            id,
            dialect,
            is_game: false,
            episode: 1,
            difficulty: 0,
            section_id: 0,
            item_tracking: false,
            cheats_enabled: false,
            card_battle: false,
            quarantined: false,
            slots: vec![None; LOBBY_CAPACITY],
            leader: 0,
            next_item_id: FIRST_ITEM_ID,
            ground_items: HashMap::new(),
            enemies: Vec::new(),
            rng: StdRng::seed_from_u64(rng_seed),
            battle_record: None,
            watcher_rooms: Vec::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_game(
        id: RoomId,
        dialect: Dialect,
        episode: u8,
        difficulty: u8,
        section_id: u8,
        card_battle: bool,
        item_tracking: bool,
        rng_seed: u64,
    ) -> Room {
        let capacity = if card_battle {
            CARD_GAME_CAPACITY
        } else {
            GAME_CAPACITY
        };
        Room {
            id,
            dialect,
            is_game: true,
            episode,
            difficulty,
            section_id,
            item_tracking,
            cheats_enabled: false,
            card_battle,
            quarantined: false,
            slots: vec![None; capacity],
            leader: 0,
            next_item_id: FIRST_ITEM_ID,
            ground_items: HashMap::new(),
            enemies: Vec::new(),
            rng: StdRng::seed_from_u64(rng_seed),
            battle_record: None,
            watcher_rooms: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    pub fn occupant_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn session_at(&self, slot: usize) -> Option<SessionId> {
        self.slots.get(slot).copied().flatten()
    }

    pub fn slot_of(&self, session: SessionId) -> Option<usize> {
        self.slots.iter().position(|s| *s == Some(session))
    }

    /// Every occupied (slot, session) pair in slot order.
    pub fn occupants(&self) -> Vec<(usize, SessionId)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|sid| (i, sid)))
            .collect()
    }

    pub fn leader_session(&self) -> Option<SessionId> {
        self.session_at(self.leader)
    }

    /// Seat a session in the lowest free slot. The first occupant becomes
    /// leader.
    pub fn add(&mut self, session: SessionId) -> Result<usize, ShipError> {
        let was_empty = self.is_empty();
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(ShipError::RoomFull)?;
        self.slots[slot] = Some(session);
        if was_empty {
            self.leader = slot;
        }
        Ok(slot)
    }

    /// Clear a slot. If the leader left, the lowest-index remaining
    /// occupant takes over; returns the new leader slot if it changed.
    pub fn remove(&mut self, slot: usize) -> Option<usize> {
        if self.slots.get(slot).copied().flatten().is_none() {
            return None;
        }
        self.slots[slot] = None;
        if self.leader == slot && !self.is_empty() {
            let new_leader = self
                .slots
                .iter()
                .position(|s| s.is_some())
                .expect("room is not empty");
            self.leader = new_leader;
            return Some(new_leader);
        }
        None
    }

    /// Fresh room-unique item id. The slot argument exists because some
    /// deployments partition the counter per slot; this implementation
    /// draws from one pool, which satisfies the same uniqueness contract.
    pub fn generate_item_id(&mut self, _slot: u8) -> u32 {
        let id = self.next_item_id;
        self.next_item_id = self.next_item_id.wrapping_add(1);
        id
    }

    pub fn add_ground(
        &mut self,
        item: ItemData,
        area: u8,
        x: f32,
        z: f32,
    ) -> Result<(), ShipError> {
        if self.ground_items.contains_key(&item.id) {
            return Err(ShipError::Internal("ground item id collision"));
        }
        self.ground_items.insert(item.id, GroundItem { item, area, x, z });
        Ok(())
    }

    pub fn remove_ground(&mut self, id: u32) -> Result<GroundItem, ShipError> {
        self.ground_items
            .remove(&id)
            .ok_or(ShipError::NoSuchItem(id))
    }

    pub fn enemy_mut(&mut self, id: u16) -> Result<&mut Enemy, ShipError> {
        self.enemies
            .get_mut(id as usize)
            .ok_or(ShipError::NoSuchEnemy(id))
    }

    pub fn set_enemies(&mut self, enemies: Vec<Enemy>) {
        self.enemies = enemies;
    }
}
