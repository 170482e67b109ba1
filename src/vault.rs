//! Vault entry lifecycle: create, edit, delete, read and list.
//!
//! Plaintext secrets only exist on the way in (before encryption) and on the
//! way out (after mapping). Every operation touching ciphertext needs a
//! session context.

use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::crypto::{CryptoError, FieldCodec, require_session};
use crate::mapper::{NotesFallback, RecordMapper, resolve_service_name, resolve_url};
use crate::record::{
    Category, NewPassword, PasswordRecord, PasswordRow, PasswordUpdate, clean_tags, non_blank,
    normalize_url,
};
use crate::session::SessionContext;
use crate::store::RowStore;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("password entry {0} not found")]
    NotFound(String),
    #[error("{requester} may not modify password entry {id}")]
    Forbidden { id: String, requester: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VaultError>;

/// Listing filter; every set field must match.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub category: Option<Category>,
    pub favorites_only: bool,
    /// Case-insensitive match on service name, username, url or a tag.
    pub query: Option<String>,
}

impl ListFilter {
    fn matches(&self, row: &PasswordRow) -> bool {
        if self.favorites_only && !row.is_favorite.unwrap_or(false) {
            return false;
        }
        if let Some(category) = &self.category {
            let row_category = row
                .category
                .as_deref()
                .map(Category::parse)
                .unwrap_or_default();
            if &row_category != category {
                return false;
            }
        }
        let Some(query) = self.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) else {
            return true;
        };
        let query = query.to_lowercase();
        let hit = |s: &str| s.to_lowercase().contains(&query);

        resolve_service_name(row).is_some_and(|s| hit(&s))
            || row.username.as_deref().is_some_and(hit)
            || resolve_url(row).is_some_and(|s| hit(&s))
            || row.tags.iter().flatten().any(|t| hit(t.as_str()))
    }
}

pub struct Vault<C, S> {
    codec: C,
    store: S,
    notes_fallback: NotesFallback,
}

impl<C: FieldCodec, S: RowStore> Vault<C, S> {
    pub fn new(codec: C, store: S) -> Self {
        Self {
            codec,
            store,
            notes_fallback: NotesFallback::default(),
        }
    }

    pub fn with_notes_fallback(mut self, fallback: NotesFallback) -> Self {
        self.notes_fallback = fallback;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    fn mapper<'a>(&'a self, ctx: &'a SessionContext) -> RecordMapper<'a, C> {
        RecordMapper::new(&self.codec, ctx).with_notes_fallback(self.notes_fallback)
    }

    fn encrypt_opt(&self, value: Option<&str>, ctx: &SessionContext) -> Result<Option<String>> {
        value
            .map(|v| self.codec.encrypt(v, ctx))
            .transpose()
            .map_err(VaultError::from)
    }

    fn owned_row(&self, requester: &str, id: &str) -> Result<PasswordRow> {
        let row = self
            .store
            .get(id)?
            .ok_or_else(|| VaultError::NotFound(id.to_string()))?;
        if row.owner_id != requester {
            return Err(VaultError::Forbidden {
                id: id.to_string(),
                requester: requester.to_string(),
            });
        }
        Ok(row)
    }

    pub fn create(
        &mut self,
        ctx: Option<&SessionContext>,
        owner_id: &str,
        input: NewPassword,
    ) -> Result<PasswordRecord> {
        let ctx = require_session(ctx)?;
        let service_name = required_name(&input.service_name)?;
        let url = parse_url(input.url.as_deref())?;

        let password = self.codec.encrypt(&input.password, ctx)?;
        let notes = self.encrypt_opt(non_blank(input.notes).as_deref(), ctx)?;

        let now = OffsetDateTime::now_utc();
        let shared_with = clean_shared(input.shared_with, owner_id);
        let row = PasswordRow {
            id: uuid::Uuid::new_v4().to_string(),
            service_name: Some(service_name),
            title: None,
            username: non_blank(input.username),
            password: Some(password),
            url,
            website_url: None,
            category: Some(input.category.as_str().to_string()),
            notes,
            tags: Some(clean_tags(input.tags).into_iter().collect()),
            owner_id: owner_id.to_string(),
            is_shared: Some(!shared_with.is_empty()),
            shared_with: Some(shared_with),
            is_favorite: Some(input.is_favorite),
            last_changed: now,
            created_at: now,
            updated_at: now,
        };

        self.store.upsert(row.clone())?;
        info!(id = %row.id, owner = owner_id, "password entry created");
        Ok(self.mapper(ctx).map_row(&row, None))
    }

    /// Apply `changes`. Only fields whose plaintext actually changed are
    /// re-encrypted; `last_changed` moves only when the secret does.
    pub fn update(
        &mut self,
        ctx: Option<&SessionContext>,
        requester: &str,
        id: &str,
        changes: PasswordUpdate,
    ) -> Result<PasswordRecord> {
        let ctx = require_session(ctx)?;
        let mut row = self.owned_row(requester, id)?;
        let now = OffsetDateTime::now_utc();

        if let Some(new_secret) = changes.password {
            if self.current_plaintext(row.password.as_deref(), ctx).as_deref()
                != Some(new_secret.as_str())
            {
                row.password = Some(self.codec.encrypt(&new_secret, ctx)?);
                row.last_changed = now;
                debug!(id, "secret re-encrypted");
            }
        }

        if let Some(new_notes) = changes.notes {
            let new_notes = non_blank(new_notes);
            let current = row
                .notes
                .as_deref()
                .filter(|n| !n.is_empty())
                .map(|n| self.current_plaintext(Some(n), ctx));
            let unchanged = match (&current, &new_notes) {
                (None, None) => true,
                (Some(Some(old)), Some(new)) => old == new,
                _ => false,
            };
            if !unchanged {
                row.notes = self.encrypt_opt(new_notes.as_deref(), ctx)?;
                debug!(id, "notes re-encrypted");
            }
        }

        if let Some(name) = changes.service_name {
            row.service_name = Some(required_name(&name)?);
        }
        if let Some(username) = changes.username {
            row.username = non_blank(username);
        }
        if let Some(url) = changes.url {
            row.url = parse_url(url.as_deref())?;
            // an explicit url replaces the legacy column too
            row.website_url = None;
        }
        if let Some(category) = changes.category {
            row.category = Some(category.as_str().to_string());
        }
        if let Some(tags) = changes.tags {
            row.tags = Some(clean_tags(tags).into_iter().collect());
        }
        if let Some(favorite) = changes.is_favorite {
            row.is_favorite = Some(favorite);
        }
        if let Some(shared_with) = changes.shared_with {
            let shared_with = clean_shared(shared_with, &row.owner_id);
            row.is_shared = Some(!shared_with.is_empty());
            row.shared_with = Some(shared_with);
        }

        row.updated_at = now;
        self.store.upsert(row.clone())?;
        info!(id, "password entry updated");
        Ok(self.mapper(ctx).map_row(&row, None))
    }

    /// Hard delete; only the owner may delete.
    pub fn delete(&mut self, requester: &str, id: &str) -> Result<()> {
        self.owned_row(requester, id)?;
        if !self.store.remove(id)? {
            return Err(VaultError::NotFound(id.to_string()));
        }
        info!(id, "password entry deleted");
        Ok(())
    }

    pub fn get(
        &self,
        ctx: Option<&SessionContext>,
        requester: &str,
        id: &str,
    ) -> Result<PasswordRecord> {
        let ctx = require_session(ctx)?;
        let row = self
            .store
            .get(id)?
            .filter(|r| r.visible_to(requester))
            .ok_or_else(|| VaultError::NotFound(id.to_string()))?;
        Ok(self.mapper(ctx).map_row(&row, None))
    }

    /// Entries visible to `requester`, favourites first, then by service name.
    pub fn list(
        &self,
        ctx: Option<&SessionContext>,
        requester: &str,
        filter: &ListFilter,
    ) -> Result<Vec<PasswordRecord>> {
        let ctx = require_session(ctx)?;
        let rows: Vec<PasswordRow> = self
            .store
            .load()?
            .into_iter()
            .filter(|r| r.visible_to(requester) && filter.matches(r))
            .collect();

        let mut records = self.mapper(ctx).map_rows(&rows);
        records.sort_by(|a, b| {
            b.is_favorite
                .cmp(&a.is_favorite)
                .then_with(|| {
                    a.service_name
                        .to_lowercase()
                        .cmp(&b.service_name.to_lowercase())
                })
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(records)
    }

    /// `None` when the stored value does not decrypt.
    fn current_plaintext(&self, stored: Option<&str>, ctx: &SessionContext) -> Option<String> {
        match stored {
            None | Some("") => Some(String::new()),
            Some(ct) => self.codec.decrypt(ct, ctx).ok(),
        }
    }
}

fn required_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(VaultError::InvalidInput(
            "service name must not be empty".into(),
        ));
    }
    Ok(name.to_string())
}

fn parse_url(raw: Option<&str>) -> Result<Option<String>> {
    match raw {
        None => Ok(None),
        Some(raw) => normalize_url(raw)
            .map_err(|e| VaultError::InvalidInput(format!("invalid url {raw:?}: {e}"))),
    }
}

/// Trimmed, de-duplicated in first-seen order, never containing the owner.
fn clean_shared(ids: Vec<String>, owner_id: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        let id = id.trim();
        if !id.is_empty() && id != owner_id && !out.iter().any(|o| o == id) {
            out.push(id.to_string());
        }
    }
    out
}
