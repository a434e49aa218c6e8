//! Quest filename metadata.
//!
//! Filenames encode mode, id, and dialect:
//! - `b###-VV.bin`      battle mode
//! - `c###-VV.bin`      challenge mode
//! - `e###-gc3.bin`     card battles
//! - `q###-CAT-VV.bin`  everything else, CAT naming the category
//!
//! The `gov` category is episode-dependent and can only be fully resolved
//! once the bin header has been decoded; `QuestCategory::resolve_gov`
//! finishes the job.

use crate::{Dialect, ProtoError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuestCategory {
    Retrieval,
    Extermination,
    Event,
    Shop,
    Vr,
    Tower,
    Download,
    Solo,
    /// Placeholder until the episode is known.
    Government,
    GovEp1,
    GovEp2,
    GovEp4,
    Battle,
    Challenge,
    Card,
}

impl QuestCategory {
    fn from_token(token: &str) -> Option<QuestCategory> {
        match token {
            "ret" => Some(QuestCategory::Retrieval),
            "ext" => Some(QuestCategory::Extermination),
            "evt" => Some(QuestCategory::Event),
            "shp" => Some(QuestCategory::Shop),
            "vr" => Some(QuestCategory::Vr),
            "twr" => Some(QuestCategory::Tower),
            "dl" => Some(QuestCategory::Download),
            "1p" => Some(QuestCategory::Solo),
            "gov" => Some(QuestCategory::Government),
            _ => None,
        }
    }

    /// Battle/challenge/card ignore the episode filter when listing.
    pub fn is_mode(self) -> bool {
        matches!(
            self,
            QuestCategory::Battle | QuestCategory::Challenge | QuestCategory::Card
        )
    }

    pub fn resolve_gov(self, episode: u8) -> Result<QuestCategory, ProtoError> {
        if self != QuestCategory::Government {
            return Ok(self);
        }
        match episode {
            0 => Ok(QuestCategory::GovEp1),
            1 => Ok(QuestCategory::GovEp2),
            2 => Ok(QuestCategory::GovEp4),
            _ => Err(ProtoError::BadQuestName("government quest episode")),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            QuestCategory::Retrieval => "Retrieval",
            QuestCategory::Extermination => "Extermination",
            QuestCategory::Event => "Event",
            QuestCategory::Shop => "Shop",
            QuestCategory::Vr => "VR",
            QuestCategory::Tower => "Tower",
            QuestCategory::Download => "Download",
            QuestCategory::Solo => "Solo",
            QuestCategory::Government => "Government",
            QuestCategory::GovEp1 => "GovernmentEpisode1",
            QuestCategory::GovEp2 => "GovernmentEpisode2",
            QuestCategory::GovEp4 => "GovernmentEpisode4",
            QuestCategory::Battle => "Battle",
            QuestCategory::Challenge => "Challenge",
            QuestCategory::Card => "Card",
        }
    }
}

fn dialect_from_token(token: &str) -> Option<Dialect> {
    match token {
        "v1" => Some(Dialect::V1),
        "v2" => Some(Dialect::V2),
        "gc" => Some(Dialect::V3a),
        "gcb" => Some(Dialect::V3b),
        "gc3" => Some(Dialect::V3a),
        "bb" => Some(Dialect::V4),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestMeta {
    pub quest_id: u32,
    pub category: QuestCategory,
    pub dialect: Dialect,
}

impl QuestMeta {
    /// Parse metadata out of a `.bin`-family filename (the basename, with
    /// any of `.bin`, `.bin.gci`, `.bin.dlq` still attached). Names are
    /// case-sensitive.
    pub fn from_bin_name(filename: &str) -> Result<QuestMeta, ProtoError> {
        let base = filename
            .strip_suffix(".bin")
            .or_else(|| filename.strip_suffix(".bin.gci"))
            .or_else(|| filename.strip_suffix(".bin.dlq"))
            .ok_or(ProtoError::BadQuestName("missing .bin suffix"))?;
        let base = base.rsplit('/').next().unwrap_or(base);
        if base.is_empty() {
            return Err(ProtoError::BadQuestName("empty basename"));
        }

        let mode = base.as_bytes()[0];
        let category = match mode {
            b'b' => Some(QuestCategory::Battle),
            b'c' => Some(QuestCategory::Challenge),
            b'e' => Some(QuestCategory::Card),
            b'q' => None,
            _ => return Err(ProtoError::BadQuestName("unknown mode prefix")),
        };

        let tokens: Vec<&str> = base.split('-').collect();
        let expected = if category.is_none() { 3 } else { 2 };
        if tokens.len() != expected {
            return Err(ProtoError::BadQuestName("wrong token count"));
        }

        let quest_id: u32 = tokens[0][1..]
            .parse()
            .map_err(|_| ProtoError::BadQuestName("quest id"))?;

        let (category, dialect_token) = match category {
            Some(c) => (c, tokens[1]),
            None => (
                QuestCategory::from_token(tokens[1])
                    .ok_or(ProtoError::BadQuestName("unknown category token"))?,
                tokens[2],
            ),
        };
        let dialect = dialect_from_token(dialect_token)
            .ok_or(ProtoError::BadQuestName("unknown dialect token"))?;

        Ok(QuestMeta {
            quest_id,
            category,
            dialect,
        })
    }
}
