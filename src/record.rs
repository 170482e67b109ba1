use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use time::OffsetDateTime;
use url::Url;

use crate::strength::StrengthLevel;

/// A vault entry as persisted. `password` and `notes` hold ciphertext.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PasswordRow {
    pub id: String,
    #[serde(default)]
    pub service_name: Option<String>,
    /// Legacy name column, read when `service_name` is absent.
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Legacy address column, read when `url` is absent.
    #[serde(default)]
    pub website_url: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    pub owner_id: String,
    #[serde(default)]
    pub shared_with: Option<Vec<String>>,
    #[serde(default)]
    pub is_favorite: Option<bool>,
    #[serde(default)]
    pub is_shared: Option<bool>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_changed: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl PasswordRow {
    /// Owner or explicitly shared with `account`.
    pub fn visible_to(&self, account: &str) -> bool {
        self.owner_id == account
            || self
                .shared_with
                .as_deref()
                .is_some_and(|ids| ids.iter().any(|id| id == account))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Category {
    Financial,
    Travel,
    Household,
    Shopping,
    Social,
    Work,
    Entertainment,
    Utilities,
    #[default]
    Other,
    Custom(String),
}

impl Category {
    /// Known names are case-insensitive; anything else is kept as free text.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.to_ascii_lowercase().as_str() {
            "financial" => Category::Financial,
            "travel" => Category::Travel,
            "household" => Category::Household,
            "shopping" => Category::Shopping,
            "social" => Category::Social,
            "work" => Category::Work,
            "entertainment" => Category::Entertainment,
            "utilities" => Category::Utilities,
            "" | "other" => Category::Other,
            _ => Category::Custom(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Category::Financial => "financial",
            Category::Travel => "travel",
            Category::Household => "household",
            Category::Shopping => "shopping",
            Category::Social => "social",
            Category::Work => "work",
            Category::Entertainment => "entertainment",
            Category::Utilities => "utilities",
            Category::Other => "other",
            Category::Custom(s) => s,
        }
    }
}

impl From<String> for Category {
    fn from(s: String) -> Self {
        Category::parse(&s)
    }
}

impl From<Category> for String {
    fn from(c: Category) -> Self {
        c.as_str().to_string()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decrypted vault entry.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct PasswordRecord {
    pub id: String,
    pub service_name: String,
    pub username: Option<String>,
    pub secret: String,
    pub url: Option<String>,
    pub category: Category,
    pub notes: Option<String>,
    pub tags: BTreeSet<String>,
    pub owner_id: String,
    pub shared_with: Vec<String>,
    pub is_favorite: bool,
    pub is_shared: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_changed: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub strength: StrengthLevel,
}

impl fmt::Debug for PasswordRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordRecord")
            .field("id", &self.id)
            .field("service_name", &self.service_name)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("url", &self.url)
            .field("category", &self.category)
            .field("tags", &self.tags)
            .field("owner_id", &self.owner_id)
            .field("shared_with", &self.shared_with)
            .field("is_favorite", &self.is_favorite)
            .field("is_shared", &self.is_shared)
            .field("last_changed", &self.last_changed)
            .field("updated_at", &self.updated_at)
            .field("strength", &self.strength)
            .finish_non_exhaustive()
    }
}

/// Input for a new vault entry, all plaintext.
#[derive(Debug, Clone, Default)]
pub struct NewPassword {
    pub service_name: String,
    pub username: Option<String>,
    pub password: String,
    pub url: Option<String>,
    pub category: Category,
    pub notes: Option<String>,
    pub tags: Vec<String>,
    pub is_favorite: bool,
    pub shared_with: Vec<String>,
}

/// Partial edit. `None` leaves a field alone; `Some(None)` clears an optional one.
#[derive(Debug, Clone, Default)]
pub struct PasswordUpdate {
    pub service_name: Option<String>,
    pub username: Option<Option<String>>,
    pub password: Option<String>,
    pub url: Option<Option<String>>,
    pub category: Option<Category>,
    pub notes: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
    pub is_favorite: Option<bool>,
    pub shared_with: Option<Vec<String>>,
}

/// Trim, default to https when no scheme is given, and canonicalize.
/// Blank input means "no url".
pub fn normalize_url(raw: &str) -> Result<Option<String>, url::ParseError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    Ok(Some(Url::parse(&with_scheme)?.to_string()))
}

/// Trimmed, non-empty, de-duplicated.
pub fn clean_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// `Some` only for values with non-whitespace content.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn category_parse() {
        assert_eq!(Category::parse("Financial"), Category::Financial);
        assert_eq!(Category::parse(" travel "), Category::Travel);
        assert_eq!(Category::parse(""), Category::Other);
        assert_eq!(
            Category::parse("Pets"),
            Category::Custom("Pets".to_string())
        );
        assert_eq!(Category::Custom("Pets".into()).as_str(), "Pets");
    }

    #[test]
    fn category_serde_as_string() {
        let json = serde_json::to_string(&Category::Household).unwrap();
        assert_eq!(json, "\"household\"");
        let back: Category = serde_json::from_str("\"garden\"").unwrap();
        assert_eq!(back, Category::Custom("garden".into()));
    }

    #[test]
    fn url_normalization() {
        assert_eq!(normalize_url("  ").unwrap(), None);
        assert_eq!(
            normalize_url("example.com").unwrap().as_deref(),
            Some("https://example.com/")
        );
        assert_eq!(
            normalize_url("HTTP://Example.com/login").unwrap().as_deref(),
            Some("http://example.com/login")
        );
        assert!(normalize_url("https://exa mple.com").is_err());
    }

    #[test]
    fn tags_are_cleaned() {
        let tags = clean_tags(["bank", " bank ", "", "family"]);
        assert_eq!(tags.into_iter().collect::<Vec<_>>(), ["bank", "family"]);
    }

    #[test]
    fn row_defaults_for_missing_columns() {
        let json = r#"{
            "id": "r1",
            "owner_id": "u1",
            "last_changed": "2024-01-02T03:04:05Z",
            "created_at": "2024-01-02T03:04:05Z",
            "updated_at": "2024-01-02T03:04:05Z"
        }"#;
        let row: PasswordRow = serde_json::from_str(json).unwrap();
        assert_eq!(row.service_name, None);
        assert_eq!(row.tags, None);
        assert_eq!(row.created_at, datetime!(2024-01-02 03:04:05 UTC));
    }

    #[test]
    fn visibility() {
        let row = PasswordRow {
            id: "r1".into(),
            service_name: None,
            title: None,
            username: None,
            password: None,
            url: None,
            website_url: None,
            category: None,
            notes: None,
            tags: None,
            owner_id: "u1".into(),
            shared_with: Some(vec!["u2".into()]),
            is_favorite: None,
            is_shared: Some(true),
            last_changed: datetime!(2024-01-01 0:00 UTC),
            created_at: datetime!(2024-01-01 0:00 UTC),
            updated_at: datetime!(2024-01-01 0:00 UTC),
        };
        assert!(row.visible_to("u1"));
        assert!(row.visible_to("u2"));
        assert!(!row.visible_to("u3"));
    }
}
