//! Player records: identity, stats, inventory, bank.
//!
//! Persistent storage lives outside this server; `to_bytes`/`from_bytes`
//! are the whole interface to it. The session flushes a save before its
//! room slot is released.

use serde::{Deserialize, Serialize};

use shipproto::items::{InventoryItem, ItemData, ITEM_ID_UNASSIGNED, MESETA_STACK_LIMIT};

use crate::error::ShipError;

pub const INVENTORY_CAP: usize = 30;
pub const BANK_CAP: usize = 200;
/// Levels are zero-based; 199 displays as level 200 and stops gaining.
pub const MAX_LEVEL: u32 = 199;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharClass {
    Humar,
    Hunewearl,
    Hucast,
    Hucaseal,
    Ramar,
    Ramarl,
    Racast,
    Racaseal,
    Fomar,
    Fomarl,
    Fonewm,
    Fonewearl,
}

impl CharClass {
    pub fn index(self) -> usize {
        self as usize
    }

    pub const COUNT: usize = 12;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub atp: u16,
    pub mst: u16,
    pub evp: u16,
    pub hp: u16,
    pub dfp: u16,
    pub ata: u16,
    pub lck: u16,
}

impl PlayerStats {
    pub fn apply_delta(&mut self, d: &PlayerStats) {
        self.atp = self.atp.saturating_add(d.atp);
        self.mst = self.mst.saturating_add(d.mst);
        self.evp = self.evp.saturating_add(d.evp);
        self.hp = self.hp.saturating_add(d.hp);
        self.dfp = self.dfp.saturating_add(d.dfp);
        self.ata = self.ata.saturating_add(d.ata);
        self.lck = self.lck.saturating_add(d.lck);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerBank {
    pub meseta: u32,
    pub items: Vec<SavedItem>,
}

/// Serializable mirror of an inventory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedItem {
    pub flags: u32,
    pub data1: [u8; 12],
    pub id: u32,
    pub data2: [u8; 4],
}

impl From<InventoryItem> for SavedItem {
    fn from(i: InventoryItem) -> SavedItem {
        SavedItem {
            flags: i.flags,
            data1: i.data.data1,
            id: i.data.id,
            data2: i.data.data2,
        }
    }
}

impl From<SavedItem> for InventoryItem {
    fn from(s: SavedItem) -> InventoryItem {
        InventoryItem {
            flags: s.flags,
            data: s.item(),
        }
    }
}

impl SavedItem {
    pub fn item(&self) -> ItemData {
        ItemData {
            data1: self.data1,
            id: self.id,
            data2: self.data2,
        }
    }

    pub fn store(&mut self, data: ItemData) {
        self.data1 = data.data1;
        self.id = data.id;
        self.data2 = data.data2;
    }

    pub fn equipped(&self) -> bool {
        self.flags & shipproto::items::FLAG_EQUIPPED != 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerData {
    pub name: String,
    pub char_class: CharClass,
    pub level: u32,
    pub experience: u32,
    pub stats: PlayerStats,
    pub meseta: u32,
    pub inventory: Vec<SavedItem>,
    pub bank: PlayerBank,
}

impl Default for PlayerData {
    fn default() -> PlayerData {
        PlayerData {
            name: String::new(),
            char_class: CharClass::Humar,
            level: 0,
            experience: 0,
            stats: PlayerStats::default(),
            meseta: 0,
            inventory: Vec::new(),
            bank: PlayerBank::default(),
        }
    }
}

impl PlayerData {
    pub fn from_bytes(bytes: &[u8]) -> Result<PlayerData, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("player record always serializes")
    }

    pub fn find_item(&self, item_id: u32) -> Result<usize, ShipError> {
        self.inventory
            .iter()
            .position(|i| i.id == item_id)
            .ok_or(ShipError::NoSuchItem(item_id))
    }

    /// Insert an item, merging into an existing stack when the type
    /// stacks. The merged stack keeps its original id.
    pub fn add_item(&mut self, item: InventoryItem) -> Result<(), ShipError> {
        let data = item.data;
        if data.is_stackable() {
            if let Some(existing) = self
                .inventory
                .iter_mut()
                .find(|i| i.item().same_stack_kind(&data))
            {
                let mut d = existing.item();
                let merged = d
                    .stack_count()
                    .saturating_add(data.stack_count())
                    .min(d.stack_limit());
                d.set_stack_count(merged);
                existing.data1 = d.data1;
                existing.data2 = d.data2;
                return Ok(());
            }
        }
        if self.inventory.len() >= INVENTORY_CAP {
            return Err(ShipError::InventoryFull);
        }
        self.inventory.push(item.into());
        Ok(())
    }

    /// Remove `amount` of an item. Taking part of a stack returns a record
    /// with the unassigned-id sentinel: the caller must issue a fresh
    /// room-unique id before publishing it.
    pub fn remove_item(&mut self, item_id: u32, amount: u32) -> Result<ItemData, ShipError> {
        let index = self.find_item(item_id)?;
        let mut data = self.inventory[index].item();
        if data.is_stackable() && amount != 0 && amount < data.stack_count() {
            let remaining = data.stack_count() - amount;
            let mut kept = data;
            kept.set_stack_count(remaining);
            self.inventory[index].data1 = kept.data1;
            self.inventory[index].data2 = kept.data2;
            data.set_stack_count(amount);
            data.id = ITEM_ID_UNASSIGNED;
            return Ok(data);
        }
        self.inventory.remove(index);
        Ok(data)
    }

    pub fn add_meseta(&mut self, amount: u32) {
        self.meseta = self.meseta.saturating_add(amount).min(MESETA_STACK_LIMIT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monomate(id: u32, count: u8) -> InventoryItem {
        let mut d = ItemData::zero();
        d.data1[0] = 3;
        d.data1[1] = 0;
        d.data1[5] = count;
        d.id = id;
        InventoryItem::new(d)
    }

    #[test]
    fn save_round_trip() {
        let mut p = PlayerData::default();
        p.name = "Rico".into();
        p.level = 41;
        p.add_item(monomate(0x10, 5)).unwrap();
        let restored = PlayerData::from_bytes(&p.to_bytes()).unwrap();
        assert_eq!(restored.name, "Rico");
        assert_eq!(restored.inventory.len(), 1);
    }

    #[test]
    fn stacks_merge_on_add() {
        let mut p = PlayerData::default();
        p.add_item(monomate(0x10, 5)).unwrap();
        p.add_item(monomate(0x11, 3)).unwrap();
        assert_eq!(p.inventory.len(), 1);
        assert_eq!(p.inventory[0].item().stack_count(), 8);
        assert_eq!(p.inventory[0].id, 0x10);
    }

    #[test]
    fn stack_merge_respects_limit() {
        let mut p = PlayerData::default();
        p.add_item(monomate(0x10, 8)).unwrap();
        p.add_item(monomate(0x11, 9)).unwrap();
        assert_eq!(p.inventory[0].item().stack_count(), 10);
    }

    #[test]
    fn partial_removal_returns_sentinel_id() {
        let mut p = PlayerData::default();
        p.add_item(monomate(0x10, 5)).unwrap();
        let taken = p.remove_item(0x10, 2).unwrap();
        assert_eq!(taken.id, ITEM_ID_UNASSIGNED);
        assert_eq!(taken.stack_count(), 2);
        assert_eq!(p.inventory[0].item().stack_count(), 3);
        assert_eq!(p.inventory[0].id, 0x10);
    }

    #[test]
    fn full_removal_keeps_id() {
        let mut p = PlayerData::default();
        p.add_item(monomate(0x10, 5)).unwrap();
        let taken = p.remove_item(0x10, 5).unwrap();
        assert_eq!(taken.id, 0x10);
        assert!(p.inventory.is_empty());
    }

    #[test]
    fn missing_item_errors() {
        let mut p = PlayerData::default();
        assert!(matches!(
            p.remove_item(0x99, 1),
            Err(ShipError::NoSuchItem(0x99))
        ));
    }

    #[test]
    fn inventory_cap_enforced() {
        let mut p = PlayerData::default();
        for i in 0..INVENTORY_CAP as u32 {
            let mut d = ItemData::zero();
            d.data1[0] = 0; // weapons never merge
            d.id = i;
            p.add_item(InventoryItem::new(d)).unwrap();
        }
        let mut d = ItemData::zero();
        d.id = 0x1000;
        assert!(matches!(
            p.add_item(InventoryItem::new(d)),
            Err(ShipError::InventoryFull)
        ));
    }
}
