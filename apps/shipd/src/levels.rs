//! Per-class level table.
//!
//! 200 entries per class: the cumulative experience needed to reach each
//! level and the stat delta applied when it is reached. Loaded once at
//! startup from `system/levels.json` and shared by reference; immutable
//! after load.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::player::{CharClass, PlayerStats, MAX_LEVEL};

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct LevelEntry {
    /// Cumulative experience required to hold this level.
    pub experience: u32,
    #[serde(default)]
    pub atp: u16,
    #[serde(default)]
    pub mst: u16,
    #[serde(default)]
    pub evp: u16,
    #[serde(default)]
    pub hp: u16,
    #[serde(default)]
    pub dfp: u16,
    #[serde(default)]
    pub ata: u16,
    #[serde(default)]
    pub lck: u16,
}

impl LevelEntry {
    pub fn delta(&self) -> PlayerStats {
        PlayerStats {
            atp: self.atp,
            mst: self.mst,
            evp: self.evp,
            hp: self.hp,
            dfp: self.dfp,
            ata: self.ata,
            lck: self.lck,
        }
    }
}

#[derive(Debug)]
pub struct LevelTable {
    // [class][level], level 0..=199.
    entries: Vec<Vec<LevelEntry>>,
}

#[derive(Debug, Deserialize)]
struct LevelFile {
    classes: std::collections::HashMap<String, Vec<LevelEntry>>,
}

impl LevelTable {
    pub fn load(path: &Path) -> anyhow::Result<LevelTable> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        let file: LevelFile =
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;

        let mut entries = vec![Vec::new(); CharClass::COUNT];
        for (name, levels) in file.classes {
            let class: CharClass = serde_json::from_value(serde_json::Value::String(name.clone()))
                .with_context(|| format!("unknown char class {name:?} in level table"))?;
            if levels.len() != (MAX_LEVEL + 1) as usize {
                anyhow::bail!(
                    "class {name} has {} level entries, expected {}",
                    levels.len(),
                    MAX_LEVEL + 1
                );
            }
            entries[class.index()] = levels;
        }
        for (i, per_class) in entries.iter().enumerate() {
            if per_class.is_empty() {
                anyhow::bail!("level table is missing class index {i}");
            }
        }
        Ok(LevelTable { entries })
    }

    /// Flat default used when no table file is present: each level costs
    /// its index times 100 experience and grants small uniform gains.
    pub fn flat_default() -> LevelTable {
        let per_class: Vec<LevelEntry> = (0..=MAX_LEVEL)
            .map(|l| LevelEntry {
                experience: l * (l + 1) * 50,
                atp: 1,
                mst: 1,
                evp: 1,
                hp: 2,
                dfp: 1,
                ata: 1,
                lck: 0,
            })
            .collect();
        LevelTable {
            entries: vec![per_class; CharClass::COUNT],
        }
    }

    pub fn stats_for_level(&self, class: CharClass, level: u32) -> &LevelEntry {
        let level = level.min(MAX_LEVEL) as usize;
        &self.entries[class.index()][level]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_default_is_monotonic() {
        let t = LevelTable::flat_default();
        let mut last = 0;
        for l in 1..=MAX_LEVEL {
            let e = t.stats_for_level(CharClass::Ramarl, l);
            assert!(e.experience > last);
            last = e.experience;
        }
    }

    #[test]
    fn lookup_clamps_to_max_level() {
        let t = LevelTable::flat_default();
        let top = t.stats_for_level(CharClass::Humar, MAX_LEVEL).experience;
        assert_eq!(t.stats_for_level(CharClass::Humar, 5000).experience, top);
    }

    #[test]
    fn rejects_short_class_tables() {
        let dir = std::env::temp_dir().join("shipd-level-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("levels.json");
        std::fs::write(
            &path,
            r#"{"classes": {"humar": [{"experience": 0}]}}"#,
        )
        .unwrap();
        assert!(LevelTable::load(&path).is_err());
    }
}
