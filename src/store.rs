use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};

use crate::record::PasswordRow;

const ROWS_FILE: &str = "rows.json";

/// Persistence for encrypted rows. Rows are stored exactly as given.
pub trait RowStore {
    fn load(&self) -> anyhow::Result<Vec<PasswordRow>>;

    fn get(&self, id: &str) -> anyhow::Result<Option<PasswordRow>> {
        Ok(self.load()?.into_iter().find(|r| r.id == id))
    }

    /// Insert, or replace the row with the same id.
    fn upsert(&mut self, row: PasswordRow) -> anyhow::Result<()>;

    /// Hard delete. Returns whether a row was removed.
    fn remove(&mut self, id: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryRowStore {
    rows: Vec<PasswordRow>,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RowStore for MemoryRowStore {
    fn load(&self) -> anyhow::Result<Vec<PasswordRow>> {
        Ok(self.rows.clone())
    }

    fn upsert(&mut self, row: PasswordRow) -> anyhow::Result<()> {
        upsert_into(&mut self.rows, row);
        Ok(())
    }

    fn remove(&mut self, id: &str) -> anyhow::Result<bool> {
        let before = self.rows.len();
        self.rows.retain(|r| r.id != id);
        Ok(self.rows.len() != before)
    }
}

/// All rows in one `rows.json` under the store root.
#[derive(Debug, Clone)]
pub struct JsonRowStore {
    path: PathBuf,
}

impl JsonRowStore {
    pub fn open(root: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("cannot create store dir {}", root.display()))?;
        Ok(Self {
            path: root.join(ROWS_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, rows: &[PasswordRow]) -> anyhow::Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let s = serde_json::to_string_pretty(rows)?;
        write_private(&tmp, s.as_bytes())
            .with_context(|| format!("cannot write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("cannot replace {}", self.path.display()))?;
        Ok(())
    }
}

impl RowStore for JsonRowStore {
    fn load(&self) -> anyhow::Result<Vec<PasswordRow>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&self.path)
            .with_context(|| format!("cannot read rows file {}", self.path.display()))?;
        let rows = serde_json::from_str(&data)
            .with_context(|| format!("cannot parse rows file {}", self.path.display()))?;
        Ok(rows)
    }

    fn upsert(&mut self, row: PasswordRow) -> anyhow::Result<()> {
        let mut rows = self.load()?;
        upsert_into(&mut rows, row);
        self.write(&rows)
    }

    fn remove(&mut self, id: &str) -> anyhow::Result<bool> {
        let mut rows = self.load()?;
        let before = rows.len();
        rows.retain(|r| r.id != id);
        if rows.len() == before {
            return Ok(false);
        }
        self.write(&rows)?;
        Ok(true)
    }
}

fn upsert_into(rows: &mut Vec<PasswordRow>, row: PasswordRow) {
    match rows.iter_mut().find(|r| r.id == row.id) {
        Some(existing) => *existing = row,
        None => rows.push(row),
    }
}

/// Write `data` to a file only the owner can read. New files are created with
/// mode 0600; an existing file is tightened before it is written.
pub(crate) fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(path)?;
    set_perms_restrictive(path)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(unix)]
fn set_perms_restrictive(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_perms_restrictive(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
