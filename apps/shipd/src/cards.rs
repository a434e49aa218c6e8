//! Card-battle static data: the card catalogue and the map index.
//!
//! Both tables are packed binary with explicit big-endian fields, decoded
//! through offset accessors rather than struct casts. The index is
//! immutable after load and shared by reference; the dispatcher only
//! consults `behavior_flags`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;

/// Debug/test toggles. The dispatcher consults DISABLE_MASKING; the rest
/// are honored by the (external) rules engine.
pub mod behavior {
    pub const SKIP_DECK_VERIFY: u32 = 0x0000_0001;
    pub const IGNORE_CARD_COUNTS: u32 = 0x0000_0002;
    pub const DISABLE_TIME_LIMITS: u32 = 0x0000_0008;
    pub const ENABLE_RECORDING: u32 = 0x0000_0040;
    pub const DISABLE_MASKING: u32 = 0x0000_0080;
}

pub const CARD_DEF_SIZE: usize = 0x128;
const CARD_FOOTER_SIZE: usize = 0x58;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatCode {
    pub code: u16,
    pub kind: u8,
    pub stat: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardEffect {
    pub effect_num: u8,
    pub condition_type: u8,
    pub expr: [u8; 0x0F],
    pub when: u8,
    pub apply_criterion: u8,
}

impl CardEffect {
    pub fn is_empty(&self) -> bool {
        self.effect_num == 0xFF || (self.effect_num == 0 && self.condition_type == 0)
    }
}

#[derive(Debug, Clone)]
pub struct CardDefinition {
    pub card_id: u32,
    pub name: String,
    pub card_type: u8,
    pub self_cost: u8,
    pub ally_cost: u8,
    pub hp: StatCode,
    pub ap: StatCode,
    pub tp: StatCode,
    pub mv: StatCode,
    pub range: [u32; 6],
    pub target_mode: u8,
    pub usable_criterion: u8,
    pub rarity: u8,
    pub card_class: u16,
    pub assist_effect: [u16; 2],
    pub drop_rates: [u16; 2],
    pub effects: [CardEffect; 3],
}

fn be16(d: &[u8], o: usize) -> u16 {
    u16::from_be_bytes([d[o], d[o + 1]])
}

fn be32(d: &[u8], o: usize) -> u32 {
    u32::from_be_bytes([d[o], d[o + 1], d[o + 2], d[o + 3]])
}

fn text(d: &[u8], o: usize, len: usize) -> String {
    let field = &d[o..o + len];
    let end = field.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn stat(d: &[u8], o: usize) -> StatCode {
    StatCode {
        code: be16(d, o),
        kind: d[o + 2],
        stat: d[o + 3] as i8,
    }
}

fn effect(d: &[u8], o: usize) -> CardEffect {
    let mut expr = [0u8; 0x0F];
    expr.copy_from_slice(&d[o + 2..o + 0x11]);
    CardEffect {
        effect_num: d[o],
        condition_type: d[o + 1],
        expr,
        when: d[o + 0x11],
        apply_criterion: d[o + 0x1E],
    }
}

impl CardDefinition {
    /// Decode one 0x128-byte record.
    pub fn decode(d: &[u8]) -> anyhow::Result<CardDefinition> {
        if d.len() < CARD_DEF_SIZE {
            anyhow::bail!("card definition record is truncated");
        }
        Ok(CardDefinition {
            card_id: be32(d, 0x000),
            name: text(d, 0x0A0, 0x14),
            card_type: d[0x044],
            self_cost: d[0x045],
            ally_cost: d[0x046],
            hp: stat(d, 0x048),
            ap: stat(d, 0x04C),
            tp: stat(d, 0x050),
            mv: stat(d, 0x054),
            range: [
                be32(d, 0x070),
                be32(d, 0x074),
                be32(d, 0x078),
                be32(d, 0x07C),
                be32(d, 0x080),
                be32(d, 0x084),
            ],
            target_mode: d[0x08C],
            usable_criterion: d[0x092],
            rarity: d[0x093],
            card_class: be16(d, 0x096),
            assist_effect: [be16(d, 0x098), be16(d, 0x09A)],
            drop_rates: [be16(d, 0x09C), be16(d, 0x09E)],
            effects: [effect(d, 0x0C7), effect(d, 0x0E7), effect(d, 0x107)],
        })
    }
}

/// Map geometry and metadata, decoded from the 0x5A18-byte definition.
#[derive(Debug, Clone)]
pub struct MapDefinition {
    pub map_number: u32,
    pub name: String,
    pub location_name: String,
    pub width: u8,
    pub height: u8,
    pub environment_number: u8,
    pub num_alt_maps: u8,
    pub map_tiles: [[u8; 0x10]; 0x10],
    pub modification_tiles: [[u8; 0x10]; 0x10],
    pub map_x: u16,
    pub map_y: u16,
    pub reward_card_ids: Vec<u16>,
    /// Default battle rules, kept raw (0x10 bytes at their on-disk
    /// layout); the rules engine owns their interpretation.
    pub default_rules: [u8; 0x10],
}

pub const MAP_DEF_SIZE: usize = 0x5A18;

impl MapDefinition {
    pub fn decode(d: &[u8]) -> anyhow::Result<MapDefinition> {
        if d.len() != MAP_DEF_SIZE {
            anyhow::bail!("map definition must be 0x{MAP_DEF_SIZE:X} bytes, got 0x{:X}", d.len());
        }
        let mut map_tiles = [[0u8; 0x10]; 0x10];
        let mut modification_tiles = [[0u8; 0x10]; 0x10];
        for y in 0..0x10 {
            map_tiles[y].copy_from_slice(&d[0x000C + y * 0x10..0x000C + (y + 1) * 0x10]);
            modification_tiles[y]
                .copy_from_slice(&d[0x1C68 + y * 0x10..0x1C68 + (y + 1) * 0x10]);
        }
        let mut default_rules = [0u8; 0x10];
        default_rules.copy_from_slice(&d[0x1DDC..0x1DEC]);
        let reward_card_ids = (0..0x10)
            .map(|i| be16(d, 0x59B0 + i * 2))
            .filter(|&id| id != 0xFFFF && id != 0)
            .collect();
        Ok(MapDefinition {
            map_number: be32(d, 0x0004),
            name: text(d, 0x1DF0, 0x14),
            location_name: text(d, 0x1E04, 0x14),
            width: d[0x0008],
            height: d[0x0009],
            environment_number: d[0x000A],
            num_alt_maps: d[0x000B],
            map_tiles,
            modification_tiles,
            map_x: be16(d, 0x1FE4),
            map_y: be16(d, 0x1FE6),
            reward_card_ids,
            default_rules,
        })
    }
}

#[derive(Debug)]
pub struct CardIndex {
    pub behavior_flags: u32,
    cards: HashMap<u32, CardDefinition>,
    cards_by_name: HashMap<String, u32>,
    compressed_card_defs: Vec<u8>,
    maps: HashMap<u32, MapDefinition>,
    maps_by_name: HashMap<String, u32>,
    compressed_map_list: Vec<u8>,
}

impl CardIndex {
    /// Load `card-definitions.mnr` (compressed card records + footer) and
    /// every map under `maps/` (`.mnmd` raw, `.mnm` compressed with a
    /// small header) from the ep3 directory.
    pub fn load(dir: &Path, behavior_flags: u32) -> anyhow::Result<CardIndex> {
        let defs_path = dir.join("card-definitions.mnr");
        let compressed_card_defs =
            std::fs::read(&defs_path).with_context(|| format!("read {}", defs_path.display()))?;
        let raw = prs::decompress(&compressed_card_defs)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("decompress {}", defs_path.display()))?;
        let cards = decode_card_table(&raw)?;
        let cards_by_name = cards
            .values()
            .map(|c| (c.name.clone(), c.card_id))
            .collect();

        let mut maps = HashMap::new();
        let maps_dir = dir.join("maps");
        if let Ok(entries) = std::fs::read_dir(&maps_dir) {
            let mut paths: Vec<_> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
            paths.sort();
            for path in paths {
                let ext = path.extension().and_then(|e| e.to_str());
                let decoded = match ext {
                    Some("mnmd") => {
                        let raw = std::fs::read(&path)
                            .with_context(|| format!("read {}", path.display()))?;
                        MapDefinition::decode(&raw)
                    }
                    Some("mnm") => {
                        let raw = std::fs::read(&path)
                            .with_context(|| format!("read {}", path.display()))?;
                        decode_compressed_map(&raw)
                    }
                    _ => continue,
                };
                match decoded {
                    Ok(map) => {
                        maps.insert(map.map_number, map);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), err = %e, "skipping bad map file");
                    }
                }
            }
        }
        let maps_by_name = maps
            .values()
            .map(|m| (m.name.clone(), m.map_number))
            .collect();
        let compressed_map_list = build_map_list(&maps);

        Ok(CardIndex {
            behavior_flags,
            cards,
            cards_by_name,
            compressed_card_defs,
            maps,
            maps_by_name,
            compressed_map_list,
        })
    }

    pub fn card(&self, id: u32) -> Option<&CardDefinition> {
        self.cards.get(&id)
    }

    pub fn card_by_name(&self, name: &str) -> Option<&CardDefinition> {
        self.cards_by_name.get(name).and_then(|id| self.cards.get(id))
    }

    pub fn all_card_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.cards.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// The blob handed to clients verbatim.
    pub fn compressed_card_definitions(&self) -> &[u8] {
        &self.compressed_card_defs
    }

    pub fn map(&self, number: u32) -> Option<&MapDefinition> {
        self.maps.get(&number)
    }

    pub fn map_by_name(&self, name: &str) -> Option<&MapDefinition> {
        self.maps_by_name.get(name).and_then(|n| self.maps.get(n))
    }

    pub fn all_map_numbers(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.maps.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn compressed_map_list(&self) -> &[u8] {
        &self.compressed_map_list
    }

    pub fn masking_disabled(&self) -> bool {
        self.behavior_flags & behavior::DISABLE_MASKING != 0
    }
}

fn decode_card_table(raw: &[u8]) -> anyhow::Result<HashMap<u32, CardDefinition>> {
    if raw.len() < CARD_FOOTER_SIZE {
        anyhow::bail!("card table too small for footer");
    }
    let count = be32(raw, raw.len() - CARD_FOOTER_SIZE) as usize;
    if raw.len() < CARD_FOOTER_SIZE + count * CARD_DEF_SIZE {
        anyhow::bail!("card table declares {count} cards but is too small");
    }
    let mut cards = HashMap::with_capacity(count);
    for i in 0..count {
        let def = CardDefinition::decode(&raw[i * CARD_DEF_SIZE..])?;
        cards.insert(def.card_id, def);
    }
    Ok(cards)
}

/// `.mnm` layout: `{u32le map_number, u32le compressed_size}` then the
/// compressed definition.
fn decode_compressed_map(raw: &[u8]) -> anyhow::Result<MapDefinition> {
    if raw.len() < 8 {
        anyhow::bail!("compressed map header truncated");
    }
    let compressed_size =
        u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
    if raw.len() < 8 + compressed_size {
        anyhow::bail!("compressed map body truncated");
    }
    let decompressed = prs::decompress(&raw[8..8 + compressed_size])
        .map_err(|e| anyhow::anyhow!("map decompress: {e}"))?;
    MapDefinition::decode(&decompressed)
}

const MAP_LIST_ENTRY_SIZE: usize = 0x220;

/// Build the compressed on-wire map list: a header, one 0x220-byte entry
/// per map, then the NUL-terminated string pool the entries point into.
fn build_map_list(maps: &HashMap<u32, MapDefinition>) -> Vec<u8> {
    let mut numbers: Vec<u32> = maps.keys().copied().collect();
    numbers.sort_unstable();

    let mut entries = Vec::with_capacity(numbers.len() * MAP_LIST_ENTRY_SIZE);
    let mut strings: Vec<u8> = Vec::new();
    let mut intern = |strings: &mut Vec<u8>, s: &str| -> u32 {
        let off = strings.len() as u32;
        strings.extend_from_slice(s.as_bytes());
        strings.push(0);
        off
    };

    for number in &numbers {
        let m = &maps[number];
        let name_off = intern(&mut strings, &m.name);
        let loc_off = intern(&mut strings, &m.location_name);
        let mut e = [0u8; MAP_LIST_ENTRY_SIZE];
        e[0x00..0x02].copy_from_slice(&m.map_x.to_be_bytes());
        e[0x02..0x04].copy_from_slice(&m.map_y.to_be_bytes());
        e[0x04..0x06].copy_from_slice(&(m.environment_number as u16).to_be_bytes());
        e[0x06..0x08].copy_from_slice(&(m.map_number as u16).to_be_bytes());
        e[0x08..0x0C].copy_from_slice(&name_off.to_be_bytes());
        e[0x0C..0x10].copy_from_slice(&loc_off.to_be_bytes());
        e[0x10..0x14].copy_from_slice(&loc_off.to_be_bytes());
        e[0x14..0x18].copy_from_slice(&name_off.to_be_bytes());
        e[0x18..0x1A].copy_from_slice(&(m.width as u16).to_be_bytes());
        e[0x1A..0x1C].copy_from_slice(&(m.height as u16).to_be_bytes());
        for y in 0..0x10 {
            e[0x1C + y * 0x10..0x1C + (y + 1) * 0x10].copy_from_slice(&m.map_tiles[y]);
            e[0x11C + y * 0x10..0x11C + (y + 1) * 0x10]
                .copy_from_slice(&m.modification_tiles[y]);
        }
        e[0x21C..0x220].copy_from_slice(&0xFF00_0000u32.to_be_bytes());
        entries.extend_from_slice(&e);
    }

    let strings_offset = entries.len() as u32;
    let total_size = (16 + entries.len() + strings.len()) as u32;
    let mut out = Vec::with_capacity(total_size as usize);
    out.extend_from_slice(&(numbers.len() as u32).to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&strings_offset.to_be_bytes());
    out.extend_from_slice(&total_size.to_be_bytes());
    out.extend_from_slice(&entries);
    out.extend_from_slice(&strings);
    prs::compress(&out)
}
