//! Drop generation: rare tables and the common-item generator.
//!
//! Rare tables are indexed by (episode - 1, difficulty, section id). An
//! enemy drop looks up the table row for the enemy type; a box drop scans
//! the 30 box-area entries for a matching area. Either way the hit is a
//! Bernoulli sample against the entry's probability. When the rare roll
//! misses, the common generator produces a mundane drop (or nothing).

use std::path::Path;

use anyhow::Context;
use rand::rngs::StdRng;
use rand::Rng;
use serde::Deserialize;

use shipproto::items::ItemData;

pub const EPISODES: usize = 3;
pub const DIFFICULTIES: usize = 4;
pub const SECTION_IDS: usize = 10;
pub const BOX_AREAS: usize = 30;
pub const MONSTER_TYPES: usize = 0x66;

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RareDrop {
    /// Hit chance as a fraction of 2^32.
    pub probability: u32,
    pub item_code: [u8; 3],
}

#[derive(Debug, Clone, Deserialize)]
pub struct RareTable {
    #[serde(default = "zero_monster_rares")]
    pub monster_rares: Vec<RareDrop>,
    #[serde(default = "zero_box_areas")]
    pub box_areas: Vec<u8>,
    #[serde(default = "zero_box_rares")]
    pub box_rares: Vec<RareDrop>,
}

fn zero_monster_rares() -> Vec<RareDrop> {
    vec![RareDrop::default(); MONSTER_TYPES]
}

fn zero_box_areas() -> Vec<u8> {
    vec![0xFF; BOX_AREAS]
}

fn zero_box_rares() -> Vec<RareDrop> {
    vec![RareDrop::default(); BOX_AREAS]
}

impl Default for RareTable {
    fn default() -> RareTable {
        RareTable {
            monster_rares: zero_monster_rares(),
            box_areas: zero_box_areas(),
            box_rares: zero_box_rares(),
        }
    }
}

#[derive(Debug)]
pub struct RareItemSet {
    // [episode - 1][difficulty][section_id]
    tables: Vec<RareTable>,
}

#[derive(Debug, Deserialize)]
struct RareFileEntry {
    episode: u8,
    difficulty: u8,
    section_id: u8,
    #[serde(flatten)]
    table: RareTable,
}

impl RareItemSet {
    pub fn load(path: &Path) -> anyhow::Result<RareItemSet> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        let entries: Vec<RareFileEntry> =
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
        let mut set = RareItemSet {
            tables: vec![RareTable::default(); EPISODES * DIFFICULTIES * SECTION_IDS],
        };
        for e in entries {
            if e.episode < 1
                || e.episode as usize > EPISODES
                || e.difficulty as usize >= DIFFICULTIES
                || e.section_id as usize >= SECTION_IDS
            {
                anyhow::bail!(
                    "rare table entry out of range: episode {} difficulty {} section {}",
                    e.episode,
                    e.difficulty,
                    e.section_id
                );
            }
            if e.table.monster_rares.len() != MONSTER_TYPES
                || e.table.box_areas.len() != BOX_AREAS
                || e.table.box_rares.len() != BOX_AREAS
            {
                anyhow::bail!("rare table entry has wrong row counts");
            }
            let idx = Self::index(e.episode - 1, e.difficulty, e.section_id);
            set.tables[idx] = e.table;
        }
        Ok(set)
    }

    fn index(episode0: u8, difficulty: u8, section_id: u8) -> usize {
        (episode0 as usize * DIFFICULTIES + difficulty as usize) * SECTION_IDS
            + section_id as usize
    }

    pub fn table(&self, episode0: u8, difficulty: u8, section_id: u8) -> &RareTable {
        &self.tables[Self::index(
            episode0.min((EPISODES - 1) as u8),
            difficulty.min((DIFFICULTIES - 1) as u8),
            section_id.min((SECTION_IDS - 1) as u8),
        )]
    }

    /// Bernoulli sample: hit when a uniform u32 lands under the threshold.
    pub fn sample(rng: &mut StdRng, probability: u32) -> bool {
        probability != 0 && rng.random::<u32>() < probability
    }
}

/// A rare hit becomes an item template; weapons drop unidentified.
pub fn rare_to_item(drop: &RareDrop) -> ItemData {
    let mut item = ItemData::zero();
    item.data1[0] = drop.item_code[0];
    item.data1[1] = drop.item_code[1];
    item.data1[2] = drop.item_code[2];
    item.set_unidentified();
    item
}

/// Common (non-rare) drop source. The real table data is licensed content;
/// deployments provide their own generator, and tests inject deterministic
/// ones.
pub trait CommonItems {
    /// A drop for an enemy or box at the given coordinates in the drop
    /// charts. `None` means nothing drops.
    fn create_drop_item(
        &self,
        is_box: bool,
        episode: u8,
        difficulty: u8,
        area: u8,
        section_id: u8,
        rng: &mut StdRng,
    ) -> Option<ItemData>;

    /// One shop entry. `shop_class`: 0 = weapon, 1 = armor, 3 = tool.
    fn create_shop_item(&self, difficulty: u8, shop_class: u8, rng: &mut StdRng) -> ItemData;
}

/// Default generator: difficulty-scaled mundane gear with a meseta
/// fallback, roughly matching the live drop cadence (about a third of
/// requests produce nothing).
#[derive(Debug, Default)]
pub struct BasicCommonItems;

impl CommonItems for BasicCommonItems {
    fn create_drop_item(
        &self,
        is_box: bool,
        _episode: u8,
        difficulty: u8,
        area: u8,
        _section_id: u8,
        rng: &mut StdRng,
    ) -> Option<ItemData> {
        let roll: u32 = rng.random_range(0..100);
        // Boxes are a bit more generous than enemies.
        let nothing_below = if is_box { 25 } else { 40 };
        if roll < nothing_below {
            return None;
        }
        let mut item = ItemData::zero();
        match roll % 4 {
            0 => {
                // Weapon, tiered by difficulty and area.
                item.data1[0] = 0;
                item.data1[1] = 1 + (difficulty % 4) * 3 + (area / 4).min(2);
                item.data1[2] = rng.random_range(0..5);
            }
            1 => {
                // Armor.
                item.data1[0] = 1;
                item.data1[1] = 1;
                item.data1[2] = difficulty * 6 + rng.random_range(0..6);
            }
            2 => {
                // Recovery tool stack of one.
                item.data1[0] = 3;
                item.data1[1] = rng.random_range(0..2);
                item.data1[5] = 1;
            }
            _ => {
                // Meseta.
                item.data1[0] = 4;
                let base = 20 * (difficulty as u32 + 1);
                item.set_stack_count(base + rng.random_range(0..base));
            }
        }
        Some(item)
    }

    fn create_shop_item(&self, difficulty: u8, shop_class: u8, rng: &mut StdRng) -> ItemData {
        let mut item = ItemData::zero();
        match shop_class {
            0 => {
                item.data1[0] = 0;
                item.data1[1] = 1 + (difficulty % 4) * 3 + rng.random_range(0..3);
            }
            1 => {
                item.data1[0] = 1;
                item.data1[1] = 1;
                item.data1[2] = difficulty * 6 + rng.random_range(0..6);
            }
            _ => {
                item.data1[0] = 3;
                item.data1[1] = rng.random_range(0..2);
                item.data1[5] = 1;
            }
        }
        item
    }
}
