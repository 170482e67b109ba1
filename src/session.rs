use anyhow::{Result, anyhow};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::config::Config;
use crate::crypto::{CryptoError, MasterKey, unlock_master_key};
use crate::store::write_private;

const SESSION_TTL_SECS: u64 = 5 * 60;

// Per-session derivation runs on every unlock, so it is lighter than the master KDF.
const SESSION_KDF_MEMORY_KIB: u32 = 8 * 1024;
const SESSION_KDF_ITERATIONS: u32 = 2;

/// Per-session key material every field encrypt/decrypt is scoped to.
#[derive(Clone)]
pub struct SessionContext {
    session_id: String,
    epoch: u32,
    key: Zeroizing<[u8; 32]>,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, epoch: u32, key: [u8; 32]) -> Self {
        Self {
            session_id: session_id.into(),
            epoch,
            key: Zeroizing::new(key),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub(crate) fn key(&self) -> &[u8; 32] {
        &self.key
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .field("epoch", &self.epoch)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Key/session management boundary: turns a session token into a context.
pub trait SessionProvider {
    fn session_context(&self, token: &str) -> Result<SessionContext, CryptoError>;
}

/// Derives session keys from the unlocked master key with Argon2id.
///
/// The same token always yields the same key, so data sealed in one session
/// opens in the next one for that token; other tokens cannot open it.
pub struct MasterKeySessions {
    master_key: Zeroizing<MasterKey>,
    salt: Vec<u8>,
    epoch: u32,
}

impl MasterKeySessions {
    pub fn new(master_key: MasterKey, cfg: &Config) -> Result<Self> {
        let salt = general_purpose::STANDARD.decode(&cfg.kdf.salt)?;
        Ok(Self {
            master_key: Zeroizing::new(master_key),
            salt,
            epoch: cfg.enc.epoch,
        })
    }

    /// Unlock the master key with the master password and wrap it in a provider.
    pub fn unlock(master_password: &str, cfg: &Config) -> Result<Self, CryptoError> {
        let mk = Zeroizing::new(unlock_master_key(master_password, cfg)?);
        Ok(Self::new(*mk, cfg)?)
    }

    fn derive(&self, token: &str) -> Result<[u8; 32], CryptoError> {
        let params = Params::new(
            SESSION_KDF_MEMORY_KIB,
            SESSION_KDF_ITERATIONS,
            1,
            Some(32),
        )
        .map_err(|e| anyhow!("argon2 params error: {e}"))?;
        let argon2 = Argon2::new_with_secret(
            &self.master_key[..],
            Algorithm::Argon2id,
            Version::V0x13,
            params,
        )
        .map_err(|e| anyhow!("argon2 error: {e}"))?;

        let mut out = [0u8; 32];
        argon2
            .hash_password_into(token.as_bytes(), &self.salt, &mut out)
            .map_err(|e| anyhow!("argon2 error: {e}"))?;
        Ok(out)
    }
}

impl SessionProvider for MasterKeySessions {
    fn session_context(&self, token: &str) -> Result<SessionContext, CryptoError> {
        if token.trim().is_empty() {
            return Err(CryptoError::Other(anyhow!("empty session token")));
        }
        let key = Zeroizing::new(self.derive(token)?);
        let session_id = uuid::Uuid::new_v4().to_string();
        debug!(session = %session_id, epoch = self.epoch, "session context derived");
        Ok(SessionContext::new(session_id, self.epoch, *key))
    }
}

#[derive(Serialize, Deserialize)]
struct SessionFile {
    expires_at: u64,
    session_id: String,
    epoch: u32,
    key: String,
}

pub fn session_path(root: &Path) -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(dir).join("hv-session.json")
    } else {
        root.join("session.json")
    }
}

fn now_unix() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| anyhow!("system time error: {e}"))?
        .as_secs())
}

fn read_cached(path: &Path, now: u64, epoch: u32) -> Option<SessionContext> {
    let data = fs::read_to_string(path).ok()?;
    let sess: SessionFile = serde_json::from_str(&data).ok()?;
    if now > sess.expires_at || sess.epoch != epoch {
        let _ = fs::remove_file(path);
        return None;
    }
    let bytes = Zeroizing::new(general_purpose::STANDARD.decode(&sess.key).ok()?);
    let key: [u8; 32] = bytes.as_slice().try_into().ok()?;
    Some(SessionContext::new(sess.session_id, sess.epoch, key))
}

/// Reuse the cached session for the vault owner, or unlock with the master
/// password and cache the derived session key for a few minutes.
pub fn load_or_unlock<F>(cfg: &Config, root: &Path, ask_password: F) -> Result<SessionContext>
where
    F: FnOnce() -> Result<String>,
{
    let path = session_path(root);
    let now = now_unix()?;

    if let Some(ctx) = read_cached(&path, now, cfg.enc.epoch) {
        debug!(session = ctx.session_id(), "reusing cached session");
        return Ok(ctx);
    }

    let master_password = Zeroizing::new(ask_password()?);
    let sessions = MasterKeySessions::unlock(&master_password, cfg)?;
    let ctx = sessions.session_context(&cfg.owner_id)?;

    let sess = SessionFile {
        expires_at: now + SESSION_TTL_SECS,
        session_id: ctx.session_id().to_string(),
        epoch: ctx.epoch(),
        key: general_purpose::STANDARD.encode(ctx.key()),
    };

    // caching is best effort; the unlocked session is returned either way
    if let Err(e) = write_session_file(&path, &sess) {
        warn!(path = %path.display(), error = %e, "session key not cached");
        let _ = fs::remove_file(&path);
    }

    Ok(ctx)
}

fn write_session_file(path: &Path, sess: &SessionFile) -> Result<()> {
    let json = Zeroizing::new(serde_json::to_string(sess)?);
    write_private(path, json.as_bytes())?;
    Ok(())
}

/// Forget the cached session key. Returns whether one existed.
pub fn clear_cached_session(root: &Path) -> Result<bool> {
    let path = session_path(root);
    match fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
