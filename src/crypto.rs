use crate::config::{Config, EncConfig, KdfParams};
use crate::session::SessionContext;
use crate::strength::SYMBOLS;
use anyhow::anyhow;
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{Engine as _, engine::general_purpose};
use chacha20poly1305::{
    KeyInit, XChaCha20Poly1305, XNonce,
    aead::{Aead, AeadCore, OsRng, Payload},
};
use rand::RngCore;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, warn};

pub type MasterKey = [u8; 32];

/// Version tag of the field ciphertext layout.
const FIELD_FORMAT: &str = "v1";
const NONCE_LEN: usize = 24;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecryptionError {
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
    #[error("ciphertext was sealed under key epoch {found}, session is at epoch {expected}")]
    EpochMismatch { expected: u32, found: u32 },
    #[error("authentication tag verification failed")]
    Authentication,
    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid master password")]
    InvalidMasterPassword,
    #[error(transparent)]
    Decryption(#[from] DecryptionError),
    #[error("session context missing")]
    SessionContextMissing,
    #[error("batch decrypt returned {got} results for {expected} inputs")]
    BatchLengthMismatch { expected: usize, got: usize },
    #[error("encrypt error: {0}")]
    Encryption(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Encrypts and decrypts individual secret fields under a session context.
///
/// Implementations must make `decrypt_batch` observably equivalent to calling
/// `decrypt` on every element in order.
pub trait FieldCodec: Send + Sync {
    fn encrypt(&self, plaintext: &str, ctx: &SessionContext) -> Result<String, CryptoError>;

    fn decrypt(&self, ciphertext: &str, ctx: &SessionContext) -> Result<String, CryptoError>;

    /// The outer error means the batch path itself is unavailable; the inner
    /// results are per-element.
    fn decrypt_batch(
        &self,
        ciphertexts: &[&str],
        ctx: &SessionContext,
    ) -> Result<Vec<Result<String, CryptoError>>, CryptoError> {
        Ok(ciphertexts.iter().map(|ct| self.decrypt(ct, ctx)).collect())
    }
}

/// XChaCha20-Poly1305 field codec.
///
/// Ciphertext layout: `v1.<epoch>.<nonce b64>.<ciphertext+tag b64>`. The epoch
/// is also bound as associated data.
#[derive(Debug, Default, Clone, Copy)]
pub struct XChaChaCodec;

impl XChaChaCodec {
    fn cipher(ctx: &SessionContext) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(ctx.key()))
    }

    fn seal(
        cipher: &XChaCha20Poly1305,
        epoch: u32,
        plaintext: &str,
    ) -> Result<String, CryptoError> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let aad = associated_data(epoch);
        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: &aad,
                },
            )
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        Ok(format!(
            "{FIELD_FORMAT}.{epoch}.{}.{}",
            general_purpose::STANDARD.encode(nonce),
            general_purpose::STANDARD.encode(ciphertext)
        ))
    }

    fn open(
        cipher: &XChaCha20Poly1305,
        epoch: u32,
        payload: &str,
    ) -> Result<String, DecryptionError> {
        let mut parts = payload.splitn(4, '.');
        let (Some(version), Some(found), Some(nonce_b64), Some(ct_b64)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(DecryptionError::Malformed("expected 4 segments".into()));
        };
        if version != FIELD_FORMAT {
            return Err(DecryptionError::Malformed(format!(
                "unknown format {version:?}"
            )));
        }
        let found: u32 = found
            .parse()
            .map_err(|_| DecryptionError::Malformed("bad epoch".into()))?;
        if found != epoch {
            return Err(DecryptionError::EpochMismatch {
                expected: epoch,
                found,
            });
        }

        let nonce_bytes = general_purpose::STANDARD
            .decode(nonce_b64)
            .map_err(|e| DecryptionError::Malformed(format!("nonce: {e}")))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(DecryptionError::Malformed(format!(
                "nonce is {} bytes",
                nonce_bytes.len()
            )));
        }
        let ciphertext = general_purpose::STANDARD
            .decode(ct_b64)
            .map_err(|e| DecryptionError::Malformed(format!("ciphertext: {e}")))?;

        let aad = associated_data(epoch);
        let plaintext = cipher
            .decrypt(
                XNonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| DecryptionError::Authentication)?;

        String::from_utf8(plaintext).map_err(|_| DecryptionError::InvalidUtf8)
    }
}

fn associated_data(epoch: u32) -> Vec<u8> {
    format!("hearth-vault/{FIELD_FORMAT}/{epoch}").into_bytes()
}

impl FieldCodec for XChaChaCodec {
    fn encrypt(&self, plaintext: &str, ctx: &SessionContext) -> Result<String, CryptoError> {
        Self::seal(&Self::cipher(ctx), ctx.epoch(), plaintext)
    }

    fn decrypt(&self, ciphertext: &str, ctx: &SessionContext) -> Result<String, CryptoError> {
        Ok(Self::open(&Self::cipher(ctx), ctx.epoch(), ciphertext)?)
    }

    fn decrypt_batch(
        &self,
        ciphertexts: &[&str],
        ctx: &SessionContext,
    ) -> Result<Vec<Result<String, CryptoError>>, CryptoError> {
        debug!(count = ciphertexts.len(), session = ctx.session_id(), "batch decrypt");
        let cipher = Self::cipher(ctx);
        let epoch = ctx.epoch();
        Ok(ciphertexts
            .par_iter()
            .map(|ct| Self::open(&cipher, epoch, ct).map_err(CryptoError::from))
            .collect())
    }
}

/// Decrypt every ciphertext, preferring the batch path.
///
/// Output index `i` always corresponds to input index `i`. A failed or
/// miscounted batch is discarded and the whole list is decrypted one by one.
pub fn decrypt_all<C: FieldCodec + ?Sized>(
    codec: &C,
    ciphertexts: &[&str],
    ctx: &SessionContext,
) -> Vec<Result<String, CryptoError>> {
    match codec.decrypt_batch(ciphertexts, ctx) {
        Ok(out) if out.len() == ciphertexts.len() => return out,
        Ok(out) => {
            let err = CryptoError::BatchLengthMismatch {
                expected: ciphertexts.len(),
                got: out.len(),
            };
            warn!(error = %err, "discarding batch result, decrypting sequentially");
        }
        Err(err) => {
            warn!(error = %err, "batch decrypt unavailable, decrypting sequentially");
        }
    }
    ciphertexts.iter().map(|ct| codec.decrypt(ct, ctx)).collect()
}

/// A missing session context is a caller bug; it is never replaced by a default key.
pub fn require_session(ctx: Option<&SessionContext>) -> Result<&SessionContext, CryptoError> {
    ctx.ok_or_else(|| {
        warn!("session context missing, refusing to encrypt or decrypt");
        CryptoError::SessionContextMissing
    })
}

/// Generate a fresh master key and wrap it with a KEK derived from the
/// master password.
pub fn generate_new_config(master_password: &str, owner_id: &str) -> anyhow::Result<Config> {
    let mut mk = zeroize::Zeroizing::new([0u8; 32]);
    rand::thread_rng().fill_bytes(&mut mk[..]);

    let mut salt_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt_bytes);

    let kdf = KdfParams {
        algo: "argon2id".to_string(),
        memory_mib: 32,
        iterations: 3,
        parallelism: 1,
        salt: general_purpose::STANDARD.encode(salt_bytes),
    };

    let kek = zeroize::Zeroizing::new(derive_kek(master_password, &kdf)?);
    let (nonce_b64, ct_b64) = encrypt_with_key(&kek, &mk[..])?;

    Ok(Config {
        version: 1,
        owner_id: owner_id.to_string(),
        kdf,
        enc: EncConfig {
            algo: "xchacha20-poly1305".to_string(),
            master_key_nonce: nonce_b64,
            encrypted_master_key: ct_b64,
            epoch: 1,
        },
        notes_on_decrypt_error: Default::default(),
        log_level: "warn".to_string(),
    })
}

/// Unwrap the master key from config with the master password.
pub fn unlock_master_key(master_password: &str, cfg: &Config) -> Result<MasterKey, CryptoError> {
    let kek = zeroize::Zeroizing::new(derive_kek(master_password, &cfg.kdf)?);
    decrypt_with_key(
        &kek,
        &cfg.enc.master_key_nonce,
        &cfg.enc.encrypted_master_key,
    )
}

/// Argon2id KEK from the master password and KDF params.
fn derive_kek(master_password: &str, kdf: &KdfParams) -> anyhow::Result<[u8; 32]> {
    let salt_bytes = general_purpose::STANDARD.decode(&kdf.salt)?;

    let params = Params::new(
        kdf.memory_mib * 1024, // m_cost in KiB
        kdf.iterations,
        kdf.parallelism,
        Some(32),
    )
    .map_err(|e| anyhow!("argon2 params error: {e}"))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = [0u8; 32];
    argon2
        .hash_password_into(master_password.as_bytes(), &salt_bytes, &mut out)
        .map_err(|e| anyhow!("argon2 error: {e}"))?;

    Ok(out)
}

/// Returns (nonce_b64, ciphertext_b64).
fn encrypt_with_key(key_bytes: &[u8; 32], plaintext: &[u8]) -> anyhow::Result<(String, String)> {
    let cipher = XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key_bytes));
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| anyhow!("encrypt error: {e}"))?;

    Ok((
        general_purpose::STANDARD.encode(nonce),
        general_purpose::STANDARD.encode(ciphertext),
    ))
}

fn decrypt_with_key(
    key_bytes: &[u8; 32],
    nonce_b64: &str,
    ct_b64: &str,
) -> Result<MasterKey, CryptoError> {
    let cipher = XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key_bytes));

    let nonce_bytes = general_purpose::STANDARD
        .decode(nonce_b64)
        .map_err(|e| CryptoError::Other(e.into()))?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(CryptoError::Other(anyhow!("invalid master key nonce")));
    }
    let ciphertext = general_purpose::STANDARD
        .decode(ct_b64)
        .map_err(|e| CryptoError::Other(e.into()))?;

    let plaintext = zeroize::Zeroizing::new(
        cipher
            .decrypt(XNonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| CryptoError::InvalidMasterPassword)?,
    );

    if plaintext.len() != 32 {
        return Err(CryptoError::Other(anyhow!("invalid master key length")));
    }

    let mut mk = [0u8; 32];
    mk.copy_from_slice(&plaintext);
    Ok(mk)
}

#[derive(Debug, Clone, Copy)]
pub struct PasswordCharset {
    pub upper: bool,
    pub lower: bool,
    pub digits: bool,
    pub symbols: bool,
}

impl Default for PasswordCharset {
    fn default() -> Self {
        Self {
            upper: true,
            lower: true,
            digits: true,
            symbols: true,
        }
    }
}

/// Random password with at least one character from every enabled class.
pub fn generate_password(len: usize, charset: PasswordCharset) -> anyhow::Result<String> {
    let mut classes: Vec<Vec<char>> = Vec::new();
    if charset.upper {
        classes.push(('A'..='Z').collect());
    }
    if charset.lower {
        classes.push(('a'..='z').collect());
    }
    if charset.digits {
        classes.push(('0'..='9').collect());
    }
    if charset.symbols {
        classes.push(SYMBOLS.chars().collect());
    }
    if classes.is_empty() {
        anyhow::bail!("at least one character class must be enabled");
    }
    if len < classes.len() {
        anyhow::bail!(
            "length {len} is too short for {} character classes",
            classes.len()
        );
    }

    let mut rng = rand::thread_rng();
    let all: Vec<char> = classes.iter().flatten().copied().collect();
    let mut out: Vec<char> = classes
        .iter()
        .filter_map(|class| class.choose(&mut rng).copied())
        .collect();
    while out.len() < len {
        if let Some(c) = all.choose(&mut rng) {
            out.push(*c);
        }
    }
    out.shuffle(&mut rng);

    Ok(out.into_iter().collect())
}
