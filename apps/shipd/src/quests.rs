//! Quest containers.
//!
//! A quest is a pair of compressed blobs (`bin` = script + metadata,
//! `dat` = map data) that reaches us in one of three packagings:
//! - raw: `<name>.bin` / `<name>.dat`, already compressed, served as-is
//! - GCI: memory-card dump with 0x2080 bytes of card metadata, an 8-byte
//!   `{u32le size, u32le seed}` header, and an inner 16-byte header whose
//!   non-size words must be zero (nonzero means card-level encryption we
//!   do not support)
//! - DLQ: download packaging, `{u32le decompressed_size, u32le key}` then
//!   the V1-cipher-encrypted compressed blob
//!
//! All three must yield the same compressed stream for transmission.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use keystream::PcCipher;
use shipproto::quest::{QuestCategory, QuestMeta};
use shipproto::Dialect;

#[derive(Debug, Clone)]
pub enum QuestError {
    Truncated(&'static str),
    /// Encrypted GCI saves and V4 download quests.
    Unsupported(&'static str),
    /// The decompressed size baked into a DLQ header disagrees with the
    /// stream.
    LengthMismatch { declared: usize, actual: usize },
    BadCompression(prs::PrsError),
}

impl std::fmt::Display for QuestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuestError::Truncated(s) => write!(f, "quest file truncated: {s}"),
            QuestError::Unsupported(s) => write!(f, "unsupported quest file: {s}"),
            QuestError::LengthMismatch { declared, actual } => {
                write!(f, "decompressed size mismatch: header says {declared}, stream says {actual}")
            }
            QuestError::BadCompression(e) => write!(f, "bad compressed stream: {e}"),
        }
    }
}

impl std::error::Error for QuestError {}

impl From<prs::PrsError> for QuestError {
    fn from(e: prs::PrsError) -> Self {
        QuestError::BadCompression(e)
    }
}

const GCI_CARD_METADATA: usize = 0x2080;
const DLQ_HEADER: usize = 8;

/// Strip GCI packaging, returning the compressed blob.
pub fn decode_gci(data: &[u8]) -> Result<Vec<u8>, QuestError> {
    if data.len() < GCI_CARD_METADATA + 8 {
        return Err(QuestError::Truncated("before download header"));
    }
    let h = &data[GCI_CARD_METADATA..];
    let size = u32::from_le_bytes(h[0..4].try_into().unwrap()) as usize;
    let body = h.get(8..8 + size).ok_or(QuestError::Truncated("body"))?;

    if body.len() < 16 {
        return Err(QuestError::Truncated("inner header"));
    }
    let u1 = u32::from_le_bytes(body[0..4].try_into().unwrap());
    let u2 = u32::from_le_bytes(body[4..8].try_into().unwrap());
    let decompressed_size = u32::from_le_bytes(body[8..12].try_into().unwrap()) as usize;
    let u4 = u32::from_le_bytes(body[12..16].try_into().unwrap());
    if u1 != 0 || u2 != 0 || u4 != 0 {
        return Err(QuestError::Unsupported("gci file appears to be encrypted"));
    }

    let blob = body[16..].to_vec();
    let actual = prs::decompressed_size(&blob)?;
    // The inner size counts its own 8-byte trailer.
    let expected = decompressed_size.saturating_sub(8);
    if actual < expected {
        return Err(QuestError::LengthMismatch {
            declared: expected,
            actual,
        });
    }
    Ok(blob)
}

/// Strip DLQ packaging, returning the compressed blob.
pub fn decode_dlq(data: &[u8]) -> Result<Vec<u8>, QuestError> {
    if data.len() < DLQ_HEADER {
        return Err(QuestError::Truncated("download header"));
    }
    let decompressed_size = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
    let key = u32::from_le_bytes(data[4..8].try_into().unwrap());

    // The cipher wants 4-byte alignment; pad, decrypt, trim back.
    let body = &data[DLQ_HEADER..];
    let mut buf = body.to_vec();
    buf.resize((buf.len() + 3) & !3, 0);
    let mut cipher = PcCipher::new(key);
    cipher
        .apply(&mut buf, true)
        .expect("padded buffer is aligned");
    buf.truncate(body.len());

    let actual = prs::decompressed_size(&buf)?;
    if actual != decompressed_size {
        return Err(QuestError::LengthMismatch {
            declared: decompressed_size,
            actual,
        });
    }
    Ok(buf)
}

/// Wrap a compressed blob in DLQ packaging. `seed` of zero draws a random
/// one.
pub fn encode_dlq(compressed: &[u8], decompressed_size: usize, mut seed: u32) -> Vec<u8> {
    if seed == 0 {
        let mut b = [0u8; 4];
        getrandom::getrandom(&mut b).expect("getrandom");
        seed = u32::from_le_bytes(b).max(1);
    }
    let mut out = Vec::with_capacity(DLQ_HEADER + compressed.len() + 3);
    out.extend_from_slice(&(decompressed_size as u32).to_le_bytes());
    out.extend_from_slice(&seed.to_le_bytes());
    out.extend_from_slice(compressed);

    let body_len = out.len() - DLQ_HEADER;
    out.resize(DLQ_HEADER + ((body_len + 3) & !3), 0);
    let mut cipher = PcCipher::new(seed);
    cipher
        .apply(&mut out[DLQ_HEADER..], true)
        .expect("padded buffer is aligned");
    out.truncate(DLQ_HEADER + body_len);
    out
}

const BIN_HEADER_MIN: usize = 20;
const IS_DOWNLOAD_OFFSET: usize = 16;

#[derive(Debug, Clone)]
pub struct QuestInfo {
    pub number: u16,
    pub episode: u8,
    pub joinable: bool,
    pub name: String,
}

/// Decode the header of a decompressed bin blob. V4 carries 2-byte
/// characters and an explicit episode; the earlier dialects carry 1-byte
/// characters, with the console layout packing a number/episode byte
/// pair.
pub fn decode_bin_header(dialect: Dialect, bin: &[u8]) -> Result<QuestInfo, QuestError> {
    if bin.len() < BIN_HEADER_MIN + 0x20 {
        return Err(QuestError::Truncated("bin header"));
    }
    match dialect {
        Dialect::V1 | Dialect::V2 => Ok(QuestInfo {
            number: u16::from_le_bytes(bin[18..20].try_into().unwrap()),
            episode: 0,
            joinable: false,
            name: text8(&bin[20..20 + 0x20]),
        }),
        Dialect::V3a | Dialect::V3b => Ok(QuestInfo {
            number: bin[18] as u16,
            episode: if bin[19] == 1 { 1 } else { 0 },
            joinable: false,
            name: text8(&bin[20..20 + 0x20]),
        }),
        Dialect::V4 => {
            if bin.len() < 24 + 0x40 {
                return Err(QuestError::Truncated("bin header"));
            }
            Ok(QuestInfo {
                number: u16::from_le_bytes(bin[16..18].try_into().unwrap()),
                episode: bin[20],
                joinable: bin[22] != 0,
                name: text16(&bin[24..24 + 0x40]),
            })
        }
    }
}

fn text8(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn text16(field: &[u8]) -> String {
    let units: Vec<u16> = field
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

#[derive(Debug, Clone)]
pub struct Quest {
    pub meta: QuestMeta,
    pub info: QuestInfo,
    /// Compressed blobs, ready for the wire.
    pub bin: Vec<u8>,
    pub dat: Vec<u8>,
}

impl Quest {
    /// Load one quest given its `.bin`-family path; the matching `.dat`
    /// file must use the same packaging.
    pub fn load(bin_path: &Path) -> anyhow::Result<Quest> {
        let filename = bin_path
            .file_name()
            .and_then(|n| n.to_str())
            .context("quest path has no filename")?;
        let mut meta = QuestMeta::from_bin_name(filename)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("parse quest name {filename}"))?;

        let (bin, dat) = load_pair(bin_path, filename)?;
        let decompressed = prs::decompress(&bin)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("decompress bin")?;
        let info = decode_bin_header(meta.dialect, &decompressed)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("decode bin header")?;
        meta.category = meta
            .category
            .resolve_gov(info.episode)
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        Ok(Quest {
            meta,
            info,
            bin,
            dat,
        })
    }

    /// Produce the DLQ artefacts for this quest: the bin gets its
    /// download flag set (which means a decompress/patch/recompress
    /// round), the dat is re-wrapped as-is.
    pub fn create_download_files(&self) -> Result<(Vec<u8>, Vec<u8>), QuestError> {
        if self.meta.dialect == Dialect::V4 {
            return Err(QuestError::Unsupported("v4 has no download quests"));
        }
        let mut decompressed = prs::decompress(&self.bin)?;
        if decompressed.len() <= IS_DOWNLOAD_OFFSET {
            return Err(QuestError::Truncated("bin header"));
        }
        decompressed[IS_DOWNLOAD_OFFSET] = 0x01;
        let recompressed = prs::compress(&decompressed);
        let bin_dlq = encode_dlq(&recompressed, decompressed.len(), 0);

        let dat_size = prs::decompressed_size(&self.dat)?;
        let dat_dlq = encode_dlq(&self.dat, dat_size, 0);
        Ok((bin_dlq, dat_dlq))
    }
}

fn load_pair(bin_path: &Path, filename: &str) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    let read = |p: &Path| -> anyhow::Result<Vec<u8>> {
        std::fs::read(p).with_context(|| format!("read {}", p.display()))
    };
    let sibling = |suffix: &str, old: &str| -> PathBuf {
        bin_path.with_file_name(filename.replace(old, suffix))
    };
    if filename.ends_with(".bin.gci") {
        let bin = decode_gci(&read(bin_path)?)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("decode bin.gci")?;
        let dat = decode_gci(&read(&sibling(".dat.gci", ".bin.gci"))?)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("decode dat.gci")?;
        Ok((bin, dat))
    } else if filename.ends_with(".bin.dlq") {
        let bin = decode_dlq(&read(bin_path)?)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("decode bin.dlq")?;
        let dat = decode_dlq(&read(&sibling(".dat.dlq", ".bin.dlq"))?)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("decode dat.dlq")?;
        Ok((bin, dat))
    } else {
        let bin = read(bin_path)?;
        let dat = read(&sibling(".dat", ".bin"))?;
        Ok((bin, dat))
    }
}

#[derive(Debug, Default)]
pub struct QuestIndex {
    by_id: BTreeMap<(Dialect, u32), Quest>,
}

impl QuestIndex {
    pub fn load(dir: &Path) -> anyhow::Result<QuestIndex> {
        let mut index = QuestIndex::default();
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
            Err(e) => return Err(e).with_context(|| format!("read {}", dir.display())),
        };
        let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
        paths.sort();
        for path in paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !(name.ends_with(".bin") || name.ends_with(".bin.gci") || name.ends_with(".bin.dlq"))
            {
                continue;
            }
            match Quest::load(&path) {
                Ok(q) => {
                    tracing::info!(
                        name = %q.info.name,
                        dialect = %q.meta.dialect,
                        id = q.meta.quest_id,
                        category = q.meta.category.name(),
                        episode = q.info.episode,
                        "indexed quest"
                    );
                    index.by_id.insert((q.meta.dialect, q.meta.quest_id), q);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), err = %e, "failed to parse quest file");
                }
            }
        }
        Ok(index)
    }

    pub fn get(&self, dialect: Dialect, id: u32) -> Option<&Quest> {
        self.by_id.get(&(dialect, id))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// List quests for a menu. Mode categories (battle/challenge/card)
    /// ignore the episode filter; a negative episode skips it entirely.
    pub fn filter(
        &self,
        dialect: Dialect,
        category: QuestCategory,
        episode: i16,
    ) -> Vec<&Quest> {
        self.by_id
            .range((dialect, 0)..=(dialect, u32::MAX))
            .map(|(_, q)| q)
            .filter(|q| q.meta.category == category)
            .filter(|q| {
                episode < 0 || category.is_mode() || q.info.episode == episode as u8
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_bin(dialect: Dialect, number: u16, episode: u8, name: &str) -> Vec<u8> {
        let mut d = vec![0u8; 0x400];
        match dialect {
            Dialect::V1 | Dialect::V2 => {
                d[18..20].copy_from_slice(&number.to_le_bytes());
                d[20..20 + name.len()].copy_from_slice(name.as_bytes());
            }
            Dialect::V3a | Dialect::V3b => {
                d[18] = number as u8;
                d[19] = episode;
                d[20..20 + name.len()].copy_from_slice(name.as_bytes());
            }
            Dialect::V4 => {
                d[16..18].copy_from_slice(&number.to_le_bytes());
                d[20] = episode;
                d[22] = 1;
                for (i, u) in name.encode_utf16().enumerate() {
                    d[24 + i * 2..26 + i * 2].copy_from_slice(&u.to_le_bytes());
                }
            }
        }
        d
    }

    #[test]
    fn dlq_round_trip() {
        let plain = fake_bin(Dialect::V2, 7, 0, "Mop-up");
        let compressed = prs::compress(&plain);
        let dlq = encode_dlq(&compressed, plain.len(), 0xCAFE_BABE);
        // Header is cleartext.
        assert_eq!(&dlq[0..4], &(plain.len() as u32).to_le_bytes());
        assert_eq!(&dlq[4..8], &0xCAFE_BABEu32.to_le_bytes());
        let blob = decode_dlq(&dlq).unwrap();
        assert_eq!(blob, compressed);
        assert_eq!(prs::decompressed_size(&blob).unwrap(), plain.len());
    }

    #[test]
    fn dlq_scenario_literal_sizes() {
        // A file declaring decompressed_size 0x200 must decode to a blob
        // whose decompressed length is exactly 0x200.
        let plain = vec![0x5Au8; 0x200];
        let dlq = encode_dlq(&prs::compress(&plain), 0x200, 0xCAFE_BABE);
        let blob = decode_dlq(&dlq).unwrap();
        assert_eq!(prs::decompressed_size(&blob).unwrap(), 0x200);
    }

    #[test]
    fn dlq_length_mismatch_rejected() {
        let plain = vec![1u8; 64];
        let dlq = encode_dlq(&prs::compress(&plain), 65, 0x1234);
        assert!(matches!(
            decode_dlq(&dlq),
            Err(QuestError::LengthMismatch { declared: 65, actual: 64 })
        ));
    }

    fn fake_gci(blob: &[u8], inner: [u32; 4]) -> Vec<u8> {
        let mut body = Vec::new();
        for w in inner {
            body.extend_from_slice(&w.to_le_bytes());
        }
        body.extend_from_slice(blob);
        let mut out = vec![0u8; GCI_CARD_METADATA];
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&0x5EEDu32.to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn gci_decode() {
        let plain = fake_bin(Dialect::V3a, 3, 1, "Lost HEAT SWORD");
        let compressed = prs::compress(&plain);
        let gci = fake_gci(&compressed, [0, 0, plain.len() as u32 + 8, 0]);
        assert_eq!(decode_gci(&gci).unwrap(), compressed);
    }

    #[test]
    fn encrypted_gci_rejected() {
        let compressed = prs::compress(&[0u8; 64]);
        let gci = fake_gci(&compressed, [1, 0, 72, 0]);
        assert!(matches!(
            decode_gci(&gci),
            Err(QuestError::Unsupported(_))
        ));
    }

    #[test]
    fn bin_header_decodes_per_dialect() {
        let v2 = decode_bin_header(Dialect::V2, &fake_bin(Dialect::V2, 58, 0, "Mop-up")).unwrap();
        assert_eq!((v2.number, v2.episode), (58, 0));
        assert_eq!(v2.name, "Mop-up");

        let v3 = decode_bin_header(Dialect::V3a, &fake_bin(Dialect::V3a, 3, 1, "Seat of the Heart"))
            .unwrap();
        assert_eq!((v3.number, v3.episode), (3, 1));

        let v4 =
            decode_bin_header(Dialect::V4, &fake_bin(Dialect::V4, 701, 2, "Black Paper")).unwrap();
        assert_eq!((v4.number, v4.episode), (701, 2));
        assert!(v4.joinable);
        assert_eq!(v4.name, "Black Paper");
    }

    #[test]
    fn quest_loads_from_disk_and_download_flag_set() {
        let dir = std::env::temp_dir().join("shipd-quest-test");
        std::fs::create_dir_all(&dir).unwrap();
        let plain = fake_bin(Dialect::V2, 58, 0, "Mop-up");
        std::fs::write(dir.join("q058-ret-v2.bin"), prs::compress(&plain)).unwrap();
        std::fs::write(dir.join("q058-ret-v2.dat"), prs::compress(&[9u8; 128])).unwrap();

        let q = Quest::load(&dir.join("q058-ret-v2.bin")).unwrap();
        assert_eq!(q.info.number, 58);
        assert_eq!(q.meta.category, QuestCategory::Retrieval);

        let (bin_dlq, dat_dlq) = q.create_download_files().unwrap();
        let bin_blob = decode_dlq(&bin_dlq).unwrap();
        let patched = prs::decompress(&bin_blob).unwrap();
        assert_eq!(patched[IS_DOWNLOAD_OFFSET], 0x01);
        assert_eq!(prs::decompress(&decode_dlq(&dat_dlq).unwrap()).unwrap(), vec![9u8; 128]);
    }

    #[test]
    fn index_filters_by_category_and_episode() {
        let dir = std::env::temp_dir().join("shipd-quest-index-test");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let write = |name: &str, bin: Vec<u8>| {
            std::fs::write(dir.join(name), prs::compress(&bin)).unwrap();
            std::fs::write(
                dir.join(name.replace(".bin", ".dat")),
                prs::compress(&[0u8; 16]),
            )
            .unwrap();
        };
        write("q001-ret-bb.bin", fake_bin(Dialect::V4, 1, 0, "One"));
        write("q002-ret-bb.bin", fake_bin(Dialect::V4, 2, 1, "Two"));
        write("b101-bb.bin", fake_bin(Dialect::V4, 101, 0, "Battle 1"));

        let index = QuestIndex::load(&dir).unwrap();
        assert_eq!(index.len(), 3);
        let ep1 = index.filter(Dialect::V4, QuestCategory::Retrieval, 0);
        assert_eq!(ep1.len(), 1);
        assert_eq!(ep1[0].info.name, "One");
        // Mode categories ignore the episode argument.
        let battle = index.filter(Dialect::V4, QuestCategory::Battle, 1);
        assert_eq!(battle.len(), 1);
        assert!(index.get(Dialect::V4, 2).is_some());
        assert!(index.get(Dialect::V2, 1).is_none());
    }
}
