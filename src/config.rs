use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::mapper::NotesFallback;

/// Overrides the store location (useful for tests and multiple vaults).
pub const STORE_DIR_ENV: &str = "HV_STORE_DIR";

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct KdfParams {
    pub algo: String, // "argon2id"
    pub memory_mib: u32,
    pub iterations: u32,
    pub parallelism: u32,
    pub salt: String, // base64
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EncConfig {
    pub algo: String,                 // "xchacha20-poly1305"
    pub master_key_nonce: String,     // base64
    pub encrypted_master_key: String, // base64
    /// Key epoch bound into every field ciphertext.
    #[serde(default = "default_epoch")]
    pub epoch: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
    pub version: u32,
    pub owner_id: String,
    pub kdf: KdfParams,
    pub enc: EncConfig,
    #[serde(default)]
    pub notes_on_decrypt_error: NotesFallback,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_epoch() -> u32 {
    1
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Config {
    pub fn load(root: &Path) -> anyhow::Result<Self> {
        let path = config_path(root);
        let data = std::fs::read_to_string(&path).map_err(|e| {
            anyhow::anyhow!(
                "cannot read {} ({e}); run `hv init` first",
                path.display()
            )
        })?;
        let cfg: Config = serde_json::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(root)?;
        let s = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path(root), s)?;
        Ok(())
    }
}

/// Root of the store, e.g. ~/.local/share/hearth-vault
pub fn store_root() -> anyhow::Result<PathBuf> {
    if let Ok(dir) = std::env::var(STORE_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let mut dir = dirs::data_dir().ok_or_else(|| anyhow::anyhow!("cannot get data dir"))?;
    dir.push("hearth-vault");
    Ok(dir)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}
