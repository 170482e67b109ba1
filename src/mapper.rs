//! Turns persisted rows into decrypted [`PasswordRecord`]s.
//!
//! Mapping never fails as a whole: a field that will not decrypt is replaced
//! per record and the rest of the listing is unaffected.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::crypto::{FieldCodec, decrypt_all};
use crate::record::{Category, PasswordRecord, PasswordRow, clean_tags};
use crate::session::SessionContext;
use crate::strength::{StrengthLevel, evaluate};

/// Shown in place of a secret that failed to decrypt.
pub const DECRYPTION_ERROR_SENTINEL: &str = "[Decryption Error]";

/// What `notes` shows when it cannot be decrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotesFallback {
    /// Keep the stored (still encrypted) value.
    #[default]
    Raw,
    /// Use [`DECRYPTION_ERROR_SENTINEL`], like the secret.
    Sentinel,
}

/// First candidate with non-blank content, in the order given.
pub fn resolve_first(candidates: &[Option<&str>]) -> Option<String> {
    candidates
        .iter()
        .flatten()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// `service_name`, then legacy `title`.
pub fn resolve_service_name(row: &PasswordRow) -> Option<String> {
    resolve_first(&[row.service_name.as_deref(), row.title.as_deref()])
}

/// `url`, then legacy `website_url`.
pub fn resolve_url(row: &PasswordRow) -> Option<String> {
    resolve_first(&[row.url.as_deref(), row.website_url.as_deref()])
}

fn stored(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedField {
    Plain(String),
    Failed,
}

/// Batch-decrypt one column, one slot per row; `None` where nothing is stored.
fn decrypt_column<C, F>(
    codec: &C,
    ctx: &SessionContext,
    rows: &[PasswordRow],
    column: F,
) -> Vec<Option<CachedField>>
where
    C: FieldCodec + ?Sized,
    F: Fn(&PasswordRow) -> Option<&str>,
{
    let (positions, ciphertexts): (Vec<usize>, Vec<&str>) = rows
        .iter()
        .enumerate()
        .filter_map(|(i, r)| column(r).map(|ct| (i, ct)))
        .unzip();

    let mut slots = vec![None; rows.len()];
    // decrypt_all keeps index i of the output aligned with positions[i]
    for (pos, result) in positions.into_iter().zip(decrypt_all(codec, &ciphertexts, ctx)) {
        slots[pos] = Some(match result {
            Ok(plain) => CachedField::Plain(plain),
            Err(_) => CachedField::Failed,
        });
    }
    slots
}

/// Plaintext secrets and notes for one listing, keyed by row id.
///
/// Ids that occur more than once in the listing are left out, so those rows
/// go to the codec instead of borrowing another row's plaintext.
#[derive(Debug, Default)]
pub struct DecryptCache {
    secrets: HashMap<String, CachedField>,
    notes: HashMap<String, CachedField>,
}

impl DecryptCache {
    /// Batch-decrypt the secret and notes columns of `rows`.
    pub fn build<C: FieldCodec + ?Sized>(
        codec: &C,
        ctx: &SessionContext,
        rows: &[PasswordRow],
    ) -> Self {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for row in rows {
            *seen.entry(row.id.as_str()).or_default() += 1;
        }
        let unique = |r: &PasswordRow| seen.get(r.id.as_str()) == Some(&1);

        let secrets = decrypt_column(codec, ctx, rows, |r| {
            stored(&r.password).filter(|_| unique(r))
        });
        let notes = decrypt_column(codec, ctx, rows, |r| stored(&r.notes).filter(|_| unique(r)));
        let (secrets, notes) = (Self::keyed(rows, secrets), Self::keyed(rows, notes));
        let duplicates = seen.values().filter(|&&n| n > 1).count();
        if duplicates > 0 {
            warn!(duplicates, "duplicate row ids left out of decrypt cache");
        }
        debug!(
            rows = rows.len(),
            secrets = secrets.len(),
            notes = notes.len(),
            "decrypt cache built"
        );
        Self { secrets, notes }
    }

    fn keyed(
        rows: &[PasswordRow],
        slots: Vec<Option<CachedField>>,
    ) -> HashMap<String, CachedField> {
        rows.iter()
            .zip(slots)
            .filter_map(|(row, slot)| slot.map(|field| (row.id.clone(), field)))
            .collect()
    }

    pub fn secret(&self, id: &str) -> Option<&CachedField> {
        self.secrets.get(id)
    }

    pub fn notes(&self, id: &str) -> Option<&CachedField> {
        self.notes.get(id)
    }

    pub fn insert_secret(&mut self, id: impl Into<String>, field: CachedField) {
        self.secrets.insert(id.into(), field);
    }

    pub fn insert_notes(&mut self, id: impl Into<String>, field: CachedField) {
        self.notes.insert(id.into(), field);
    }
}

/// Outcome of resolving one encrypted column.
#[derive(Debug, PartialEq, Eq)]
enum FieldValue {
    Absent,
    Plain(String),
    Failed,
}

pub struct RecordMapper<'a, C: FieldCodec + ?Sized> {
    codec: &'a C,
    session: &'a SessionContext,
    notes_fallback: NotesFallback,
}

impl<'a, C: FieldCodec + ?Sized> RecordMapper<'a, C> {
    pub fn new(codec: &'a C, session: &'a SessionContext) -> Self {
        Self {
            codec,
            session,
            notes_fallback: NotesFallback::default(),
        }
    }

    pub fn with_notes_fallback(mut self, fallback: NotesFallback) -> Self {
        self.notes_fallback = fallback;
        self
    }

    /// Map every row, batch-decrypting up front. Batch results are matched
    /// to rows by position, never by id.
    pub fn map_rows(&self, rows: &[PasswordRow]) -> Vec<PasswordRecord> {
        let secrets = decrypt_column(self.codec, self.session, rows, |r| stored(&r.password));
        let notes = decrypt_column(self.codec, self.session, rows, |r| stored(&r.notes));
        debug!(rows = rows.len(), "listing batch-decrypted");
        rows.iter()
            .zip(secrets.iter().zip(&notes))
            .map(|(row, (secret, notes))| self.map_with(row, secret.as_ref(), notes.as_ref()))
            .collect()
    }

    /// Map one row. Cache hits win over calling the codec.
    pub fn map_row(&self, row: &PasswordRow, cache: Option<&DecryptCache>) -> PasswordRecord {
        self.map_with(
            row,
            cache.and_then(|c| c.secret(&row.id)),
            cache.and_then(|c| c.notes(&row.id)),
        )
    }

    fn map_with(
        &self,
        row: &PasswordRow,
        cached_secret: Option<&CachedField>,
        cached_notes: Option<&CachedField>,
    ) -> PasswordRecord {
        let (secret, strength) =
            match self.field(&row.id, "password", stored(&row.password), cached_secret) {
                FieldValue::Absent => (String::new(), StrengthLevel::Weak),
                FieldValue::Plain(plain) => {
                    let strength = evaluate(&plain);
                    (plain, strength)
                }
                // The sentinel is not a real secret, so it is not scored.
                FieldValue::Failed => (DECRYPTION_ERROR_SENTINEL.to_string(), StrengthLevel::Weak),
            };

        let notes = match self.field(&row.id, "notes", stored(&row.notes), cached_notes) {
            FieldValue::Absent => None,
            FieldValue::Plain(plain) => Some(plain),
            FieldValue::Failed => match self.notes_fallback {
                NotesFallback::Raw => row.notes.clone(),
                NotesFallback::Sentinel => Some(DECRYPTION_ERROR_SENTINEL.to_string()),
            },
        };

        let shared_with = row.shared_with.clone().unwrap_or_default();
        PasswordRecord {
            id: row.id.clone(),
            service_name: resolve_service_name(row).unwrap_or_default(),
            username: row.username.clone(),
            secret,
            url: resolve_url(row),
            category: row
                .category
                .as_deref()
                .map(Category::parse)
                .unwrap_or_default(),
            notes,
            tags: clean_tags(row.tags.iter().flatten()),
            owner_id: row.owner_id.clone(),
            is_shared: row.is_shared.unwrap_or(false) || !shared_with.is_empty(),
            shared_with,
            is_favorite: row.is_favorite.unwrap_or(false),
            last_changed: row.last_changed,
            created_at: row.created_at,
            updated_at: row.updated_at,
            strength,
        }
    }

    fn field(
        &self,
        id: &str,
        column: &str,
        ciphertext: Option<&str>,
        cached: Option<&CachedField>,
    ) -> FieldValue {
        let Some(ciphertext) = ciphertext else {
            return FieldValue::Absent;
        };
        match cached {
            Some(CachedField::Plain(plain)) => FieldValue::Plain(plain.clone()),
            Some(CachedField::Failed) => {
                warn!(id, column, "field decryption failed in batch");
                FieldValue::Failed
            }
            None => match self.codec.decrypt(ciphertext, self.session) {
                Ok(plain) => FieldValue::Plain(plain),
                Err(err) => {
                    warn!(id, column, error = %err, "field decryption failed");
                    FieldValue::Failed
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoError, XChaChaCodec};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::macros::datetime;

    fn ctx() -> SessionContext {
        SessionContext::new("test", 1, [5; 32])
    }

    fn row(id: &str, secret: Option<&str>, notes: Option<&str>) -> PasswordRow {
        let ctx = ctx();
        PasswordRow {
            id: id.to_string(),
            service_name: Some(format!("service {id}")),
            title: None,
            username: Some("me@example.com".into()),
            password: secret.map(|s| XChaChaCodec.encrypt(s, &ctx).unwrap()),
            url: None,
            website_url: None,
            category: None,
            notes: notes.map(|s| XChaChaCodec.encrypt(s, &ctx).unwrap()),
            tags: None,
            owner_id: "owner".into(),
            shared_with: None,
            is_favorite: None,
            is_shared: None,
            last_changed: datetime!(2024-05-01 10:00 UTC),
            created_at: datetime!(2024-05-01 10:00 UTC),
            updated_at: datetime!(2024-05-01 10:00 UTC),
        }
    }

    /// Counts single decrypt calls and has no batch path of its own.
    #[derive(Default)]
    struct CountingCodec {
        decrypts: AtomicUsize,
    }

    impl FieldCodec for CountingCodec {
        fn encrypt(&self, plaintext: &str, ctx: &SessionContext) -> Result<String, CryptoError> {
            XChaChaCodec.encrypt(plaintext, ctx)
        }

        fn decrypt(&self, ciphertext: &str, ctx: &SessionContext) -> Result<String, CryptoError> {
            self.decrypts.fetch_add(1, Ordering::SeqCst);
            XChaChaCodec.decrypt(ciphertext, ctx)
        }
    }

    #[test]
    fn resolve_first_precedence() {
        assert_eq!(resolve_first(&[Some("a"), Some("b")]).as_deref(), Some("a"));
        assert_eq!(resolve_first(&[None, Some("b")]).as_deref(), Some("b"));
        assert_eq!(resolve_first(&[Some("  "), Some("b")]).as_deref(), Some("b"));
        assert_eq!(resolve_first(&[None, None]), None);
        assert_eq!(resolve_first(&[]), None);
    }

    #[test]
    fn legacy_columns_fill_gaps() {
        let mut r = row("1", Some("pw"), None);
        r.service_name = None;
        r.title = Some("Old Bank".into());
        r.website_url = Some("https://old.example/".into());
        let ctx = ctx();
        let rec = RecordMapper::new(&XChaChaCodec, &ctx).map_row(&r, None);
        assert_eq!(rec.service_name, "Old Bank");
        assert_eq!(rec.url.as_deref(), Some("https://old.example/"));

        r.url = Some("https://new.example/".into());
        let rec = RecordMapper::new(&XChaChaCodec, &ctx).map_row(&r, None);
        assert_eq!(rec.url.as_deref(), Some("https://new.example/"));
    }

    #[test]
    fn decrypts_and_scores() {
        let ctx = ctx();
        let rec = RecordMapper::new(&XChaChaCodec, &ctx)
            .map_row(&row("1", Some("Tr0ub4dor&3!"), Some("pin 1234")), None);
        assert_eq!(rec.secret, "Tr0ub4dor&3!");
        assert_eq!(rec.notes.as_deref(), Some("pin 1234"));
        assert_eq!(rec.strength, StrengthLevel::Strong);
        assert_eq!(rec.category, Category::Other);
        assert!(rec.tags.is_empty());
        assert!(!rec.is_favorite && !rec.is_shared);
    }

    #[test]
    fn absent_secret_is_empty_and_weak() {
        let ctx = ctx();
        let rec = RecordMapper::new(&XChaChaCodec, &ctx).map_row(&row("1", None, None), None);
        assert_eq!(rec.secret, "");
        assert_eq!(rec.notes, None);
        assert_eq!(rec.strength, StrengthLevel::Weak);
    }

    #[test]
    fn corrupt_secret_becomes_sentinel() {
        let mut r = row("1", Some("Tr0ub4dor&3!"), None);
        let original = r.password.clone().unwrap();
        r.password = Some(format!("{original}xx"));
        let ctx = ctx();
        let rec = RecordMapper::new(&XChaChaCodec, &ctx).map_row(&r, None);
        assert_eq!(rec.secret, DECRYPTION_ERROR_SENTINEL);
        assert_ne!(rec.secret, original);
        assert_eq!(rec.strength, StrengthLevel::Weak);
    }

    #[test]
    fn wrong_session_yields_sentinel() {
        let r = row("1", Some("Tr0ub4dor&3!"), None);
        let other = SessionContext::new("b", 1, [6; 32]);
        let rec = RecordMapper::new(&XChaChaCodec, &other).map_row(&r, None);
        assert_eq!(rec.secret, DECRYPTION_ERROR_SENTINEL);
    }

    #[test]
    fn corrupt_notes_fallback() {
        let mut r = row("1", Some("pw"), None);
        r.notes = Some("not-a-ciphertext".into());
        let ctx = ctx();

        let raw = RecordMapper::new(&XChaChaCodec, &ctx).map_row(&r, None);
        assert_eq!(raw.notes.as_deref(), Some("not-a-ciphertext"));
        assert_eq!(raw.secret, "pw");

        let sentinel = RecordMapper::new(&XChaChaCodec, &ctx)
            .with_notes_fallback(NotesFallback::Sentinel)
            .map_row(&r, None);
        assert_eq!(sentinel.notes.as_deref(), Some(DECRYPTION_ERROR_SENTINEL));
    }

    #[test]
    fn one_corrupt_row_does_not_break_listing() {
        let mut rows: Vec<PasswordRow> = (0..5)
            .map(|i| row(&i.to_string(), Some(&format!("secret-{i}")), Some("n")))
            .collect();
        rows[2].password = Some("v1.1.garbage.garbage".into());

        let ctx = ctx();
        let records = RecordMapper::new(&XChaChaCodec, &ctx).map_rows(&rows);
        assert_eq!(records.len(), 5);
        for (i, rec) in records.iter().enumerate() {
            assert_eq!(rec.id, i.to_string());
            if i == 2 {
                assert_eq!(rec.secret, DECRYPTION_ERROR_SENTINEL);
            } else {
                assert_eq!(rec.secret, format!("secret-{i}"));
            }
            assert_eq!(rec.notes.as_deref(), Some("n"));
        }
    }

    #[test]
    fn cache_keeps_ids_aligned_when_some_rows_have_no_secret() {
        let rows = vec![
            row("a", Some("alpha"), None),
            row("b", None, Some("only notes")),
            row("c", Some("gamma"), Some("c notes")),
        ];
        let ctx = ctx();
        let cache = DecryptCache::build(&XChaChaCodec, &ctx, &rows);
        assert_eq!(cache.secret("a"), Some(&CachedField::Plain("alpha".into())));
        assert_eq!(cache.secret("b"), None);
        assert_eq!(cache.secret("c"), Some(&CachedField::Plain("gamma".into())));
        assert_eq!(cache.notes("a"), None);
        assert_eq!(cache.notes("b"), Some(&CachedField::Plain("only notes".into())));
        assert_eq!(cache.notes("c"), Some(&CachedField::Plain("c notes".into())));
    }

    #[test]
    fn cache_hits_skip_the_codec() {
        let r = row("1", Some("real"), Some("real notes"));
        let codec = CountingCodec::default();
        let ctx = ctx();

        let mut cache = DecryptCache::default();
        cache.insert_secret("1", CachedField::Plain("cached".into()));
        cache.insert_notes("1", CachedField::Plain("cached notes".into()));

        let rec = RecordMapper::new(&codec, &ctx).map_row(&r, Some(&cache));
        assert_eq!(rec.secret, "cached");
        assert_eq!(rec.notes.as_deref(), Some("cached notes"));
        assert_eq!(codec.decrypts.load(Ordering::SeqCst), 0);

        // a miss goes to the codec
        let rec = RecordMapper::new(&codec, &ctx).map_row(&r, Some(&DecryptCache::default()));
        assert_eq!(rec.secret, "real");
        assert_eq!(codec.decrypts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cached_failure_is_not_retried() {
        let r = row("1", Some("real"), None);
        let codec = CountingCodec::default();
        let ctx = ctx();
        let mut cache = DecryptCache::default();
        cache.insert_secret("1", CachedField::Failed);

        let rec = RecordMapper::new(&codec, &ctx).map_row(&r, Some(&cache));
        assert_eq!(rec.secret, DECRYPTION_ERROR_SENTINEL);
        assert_eq!(codec.decrypts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn map_rows_decrypts_each_field_once() {
        let rows: Vec<PasswordRow> = (0..4)
            .map(|i| row(&i.to_string(), Some("pw"), Some("notes")))
            .collect();
        let codec = CountingCodec::default();
        let ctx = ctx();
        let records = RecordMapper::new(&codec, &ctx).map_rows(&rows);
        assert_eq!(records.len(), 4);
        // default batch path is sequential: one call per stored field
        assert_eq!(codec.decrypts.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn rows_sharing_an_id_keep_their_own_secrets() {
        let rows = vec![
            row("x", Some("first"), Some("first notes")),
            row("x", Some("second"), Some("second notes")),
        ];
        let ctx = ctx();
        let mapper = RecordMapper::new(&XChaChaCodec, &ctx);

        let one_by_one: Vec<String> = rows.iter().map(|r| mapper.map_row(r, None).secret).collect();
        let batched = mapper.map_rows(&rows);
        assert_eq!(one_by_one, ["first", "second"]);
        assert_eq!(
            batched.iter().map(|r| r.secret.as_str()).collect::<Vec<_>>(),
            one_by_one
        );
        assert_eq!(batched[0].notes.as_deref(), Some("first notes"));
        assert_eq!(batched[1].notes.as_deref(), Some("second notes"));
    }

    #[test]
    fn cache_leaves_out_duplicate_ids() {
        let rows = vec![
            row("x", Some("first"), None),
            row("x", Some("second"), None),
            row("y", Some("third"), None),
        ];
        let ctx = ctx();
        let cache = DecryptCache::build(&XChaChaCodec, &ctx, &rows);
        assert_eq!(cache.secret("x"), None);
        assert_eq!(cache.secret("y"), Some(&CachedField::Plain("third".into())));

        let mapper = RecordMapper::new(&XChaChaCodec, &ctx);
        let secrets: Vec<String> = rows
            .iter()
            .map(|r| mapper.map_row(r, Some(&cache)).secret)
            .collect();
        assert_eq!(secrets, ["first", "second", "third"]);
    }

    #[test]
    fn sharing_and_flags() {
        let mut r = row("1", Some("pw"), None);
        r.shared_with = Some(vec!["partner".into()]);
        r.is_favorite = Some(true);
        r.category = Some("Financial".into());
        r.tags = Some(vec![" bank ".into(), "bank".into(), "".into()]);
        let ctx = ctx();
        let rec = RecordMapper::new(&XChaChaCodec, &ctx).map_row(&r, None);
        assert!(rec.is_shared);
        assert!(rec.is_favorite);
        assert_eq!(rec.shared_with, ["partner"]);
        assert_eq!(rec.category, Category::Financial);
        assert_eq!(rec.tags.len(), 1);
    }
}
