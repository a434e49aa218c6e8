//! Server configuration.
//!
//! One directory tree is handed to the process:
//! - `system/`  - `config.json`, `levels.json`, `keys/*.nsk`, optional
//!   `rare_items.json`
//! - `quests/`  - quest files
//! - `ep3/`     - card and map tables
//!
//! Anything missing or malformed in `system/` is fatal at startup.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;

use keystream::KeyFile;
use shipproto::Dialect;

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    pub dialect: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub dialect: String,
    pub listen_port: u16,
    pub remote: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub name: String,
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    pub listen: Vec<ListenConfig>,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default = "default_true")]
    pub item_tracking_enabled: bool,
    #[serde(default)]
    pub cheats_enabled: bool,
    #[serde(default)]
    pub ep3_behavior_flags: u32,
    /// Expected plaintext of the first encrypted client command, used by
    /// the V4 multi-key detector. Deployment-specific.
    #[serde(default = "default_expected_first")]
    pub expected_first_command: Vec<u8>,
    #[serde(default)]
    pub welcome_message: String,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_expected_first() -> Vec<u8> {
    // The standard first client command: a bare login header, opcode
    // 0x93, flag 0, declared size 8.
    vec![0x93, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00]
}

#[derive(Debug)]
pub struct Config {
    pub root: PathBuf,
    pub file: ConfigFile,
    pub listeners: Vec<(Dialect, SocketAddr)>,
    pub key_pool: Vec<Arc<KeyFile>>,
}

impl Config {
    pub fn load(root: &Path) -> anyhow::Result<Config> {
        let config_path = root.join("system/config.json");
        let raw = std::fs::read_to_string(&config_path)
            .with_context(|| format!("read {}", config_path.display()))?;
        let file: ConfigFile = serde_json::from_str(&raw)
            .with_context(|| format!("parse {}", config_path.display()))?;

        let mut listeners = Vec::new();
        for l in &file.listen {
            let dialect = Dialect::from_name(&l.dialect)
                .with_context(|| format!("unknown dialect {:?} in listen config", l.dialect))?;
            let addr: SocketAddr = format!("{}:{}", file.bind_host, l.port)
                .parse()
                .with_context(|| format!("bad bind address for port {}", l.port))?;
            listeners.push((dialect, addr));
        }
        if listeners.is_empty() && file.proxy.is_none() {
            anyhow::bail!("config declares no listeners and no proxy");
        }

        let key_pool = load_key_pool(&root.join("system/keys"))?;
        let needs_keys = listeners.iter().any(|(d, _)| *d == Dialect::V4);
        if needs_keys && key_pool.is_empty() {
            anyhow::bail!("a v4 listener is configured but system/keys holds no keys");
        }

        Ok(Config {
            root: root.to_path_buf(),
            file,
            listeners,
            key_pool,
        })
    }

    pub fn quests_dir(&self) -> PathBuf {
        self.root.join("quests")
    }

    pub fn ep3_dir(&self) -> PathBuf {
        self.root.join("ep3")
    }

    pub fn levels_path(&self) -> PathBuf {
        self.root.join("system/levels.json")
    }

    pub fn rare_items_path(&self) -> PathBuf {
        self.root.join("system/rare_items.json")
    }
}

fn load_key_pool(dir: &Path) -> anyhow::Result<Vec<Arc<KeyFile>>> {
    let mut pool = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        // No key directory at all is fine for stream-cipher-only setups.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(pool),
        Err(e) => return Err(e).with_context(|| format!("read {}", dir.display())),
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|e| e == "nsk"))
        .collect();
    paths.sort();
    for path in paths {
        let raw = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let key = KeyFile::from_bytes(&raw)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("parse key file {}", path.display()))?;
        pool.push(Arc::new(key));
    }
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let raw = r#"{
            "name": "test ship",
            "listen": [
                {"dialect": "v2", "port": 5100},
                {"dialect": "v4", "port": 5101}
            ]
        }"#;
        let file: ConfigFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.name, "test ship");
        assert!(file.item_tracking_enabled);
        assert_eq!(file.expected_first_command[0], 0x93);
        assert!(file.proxy.is_none());
    }

    #[test]
    fn parses_proxy_config() {
        let raw = r#"{
            "name": "relay",
            "listen": [],
            "proxy": {"dialect": "v2", "listen_port": 5110, "remote": "10.0.0.5:5100"}
        }"#;
        let file: ConfigFile = serde_json::from_str(raw).unwrap();
        let p = file.proxy.unwrap();
        assert_eq!(p.listen_port, 5110);
        assert_eq!(p.remote.port(), 5100);
    }
}
