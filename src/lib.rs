//! Password vault core: field encryption scoped to a session, mapping of
//! stored rows into decrypted records, and password strength rating.

pub mod config;
pub mod crypto;
pub mod mapper;
pub mod record;
pub mod session;
pub mod store;
pub mod strength;
pub mod vault;

pub use crypto::{CryptoError, DecryptionError, FieldCodec, XChaChaCodec, decrypt_all};
pub use mapper::{DECRYPTION_ERROR_SENTINEL, DecryptCache, NotesFallback, RecordMapper};
pub use record::{Category, NewPassword, PasswordRecord, PasswordRow, PasswordUpdate};
pub use session::{MasterKeySessions, SessionContext, SessionProvider};
pub use store::{JsonRowStore, MemoryRowStore, RowStore};
pub use strength::{StrengthLevel, evaluate};
pub use vault::{ListFilter, Vault, VaultError};
