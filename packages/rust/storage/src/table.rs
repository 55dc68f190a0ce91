//! Durable result tables keyed by page-group.
//!
//! Layout under a run root:
//!
//! ```text
//! <root>/results.csv               combined table (StoreKey::Run)
//! <root>/<group>/results.csv       one table per page-group
//! <root>/_loose/results.csv        images placed directly in the root
//! ```

use std::path::{Path, PathBuf};

use bbqscan_shared::{BbqScanError, Result, ResultRow, ResultTable, natural_cmp};
use tracing::debug;

/// Group key for images that sit directly in the run root.
pub const LOOSE_GROUP: &str = "_loose";

/// Storage key: the whole run, or one page-group by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKey {
    Run,
    Group(String),
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Run => f.write_str("<run>"),
            Self::Group(name) => f.write_str(name),
        }
    }
}

/// Tabular storage with existence checks for resumption.
///
/// Each key is written whole; there is no append.
pub trait ResultStore: Send + Sync {
    fn exists(&self, key: &StoreKey) -> Result<bool>;
    fn write(&self, key: &StoreKey, table: &ResultTable) -> Result<()>;
    fn read(&self, key: &StoreKey) -> Result<ResultTable>;
    /// Every stored page-group table under the run, in natural key order with
    /// the loose group last.
    fn read_all(&self) -> Result<Vec<(String, ResultTable)>>;
}

/// [`ResultStore`] backed by CSV files.
#[derive(Debug, Clone)]
pub struct CsvResultStore {
    root: PathBuf,
    file_name: String,
}

impl CsvResultStore {
    pub fn new(root: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            file_name: file_name.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the table for `key` lives.
    pub fn path_for(&self, key: &StoreKey) -> PathBuf {
        match key {
            StoreKey::Run => self.root.join(&self.file_name),
            StoreKey::Group(name) => self.root.join(name).join(&self.file_name),
        }
    }
}

impl ResultStore for CsvResultStore {
    fn exists(&self, key: &StoreKey) -> Result<bool> {
        Ok(self.path_for(key).is_file())
    }

    fn write(&self, key: &StoreKey, table: &ResultTable) -> Result<()> {
        let target = self.path_for(key);
        let dir = target
            .parent()
            .ok_or_else(|| BbqScanError::Storage(format!("no parent for {}", target.display())))?;
        std::fs::create_dir_all(dir).map_err(|e| BbqScanError::io(dir, e))?;

        let temp = dir.join(format!(".{}.tmp", self.file_name));
        let mut writer = csv::Writer::from_path(&temp)
            .map_err(|e| BbqScanError::Storage(format!("{}: {e}", temp.display())))?;
        for row in &table.rows {
            writer
                .serialize(row)
                .map_err(|e| BbqScanError::Storage(format!("{}: {e}", temp.display())))?;
        }
        writer
            .flush()
            .map_err(|e| BbqScanError::io(&temp, e))?;
        drop(writer);

        // Atomic rename, readers never see a half-written table
        std::fs::rename(&temp, &target).map_err(|e| BbqScanError::io(&target, e))?;
        debug!(key = %key, rows = table.len(), path = %target.display(), "wrote result table");
        Ok(())
    }

    fn read(&self, key: &StoreKey) -> Result<ResultTable> {
        let path = self.path_for(key);
        let mut reader = csv::Reader::from_path(&path)
            .map_err(|e| BbqScanError::Storage(format!("{}: {e}", path.display())))?;
        let rows = reader
            .deserialize::<ResultRow>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| BbqScanError::Storage(format!("{}: {e}", path.display())))?;
        Ok(ResultTable::new(rows))
    }

    fn read_all(&self) -> Result<Vec<(String, ResultTable)>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| BbqScanError::io(&self.root, e))?;

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BbqScanError::io(&self.root, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.exists(&StoreKey::Group(name.clone()))? {
                keys.push(name);
            }
        }
        // loose images are processed last, so their table goes last too
        keys.sort_by(|a, b| {
            (a == LOOSE_GROUP)
                .cmp(&(b == LOOSE_GROUP))
                .then_with(|| natural_cmp(a, b))
        });

        keys.into_iter()
            .map(|name| {
                let table = self.read(&StoreKey::Group(name.clone()))?;
                Ok((name, table))
            })
            .collect()
    }
}
