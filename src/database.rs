use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::config::Config;
use crate::error::{Result, TarnError};
use crate::index::{read_meta, BTreeIndex, HashIndex, Index, IndexKind};

/// Owns the named tables of a database directory and resolves names to
/// indexes. Each table is one data file plus a `.meta` companion in the
/// directory.
pub struct Database {
    base: PathBuf,
    config: Config,
    tables: RwLock<HashMap<String, Arc<dyn Index>>>,
    temp_counter: AtomicU64,
}

impl Database {
    pub fn open(dir: &Path) -> Result<Arc<Self>> {
        Self::open_with_config(dir, Config::default())
    }

    /// Opens the directory, loading every table that has a readable meta
    /// file. Spill files from interrupted joins (dot-prefixed) are
    /// ignored.
    pub fn open_with_config(dir: &Path, config: Config) -> Result<Arc<Self>> {
        fs::create_dir_all(dir)?;
        let mut tables: HashMap<String, Arc<dyn Index>> = HashMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name
                .to_str()
                .and_then(|value| value.strip_suffix(".meta"))
            else {
                continue;
            };
            if name.is_empty() || name.starts_with('.') {
                continue;
            }
            let data_path = dir.join(name);
            let (_, payload) = read_meta(&data_path)?;
            let index: Arc<dyn Index> = match payload.kind() {
                IndexKind::BTree => {
                    Arc::new(BTreeIndex::open(dir, name, config.page_cache_frames)?)
                }
                IndexKind::Hash => Arc::new(HashIndex::open(dir, name, config.page_cache_frames)?),
            };
            tables.insert(name.to_string(), index);
        }
        info!(dir = %dir.display(), tables = tables.len(), "database opened");
        Ok(Arc::new(Self {
            base: dir.to_path_buf(),
            config,
            tables: RwLock::new(tables),
            temp_counter: AtomicU64::new(0),
        }))
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn create_table(&self, name: &str, kind: IndexKind) -> Result<Arc<dyn Index>> {
        validate_table_name(name)?;
        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Err(TarnError::Protocol(format!("table {name} already exists")));
        }
        let index: Arc<dyn Index> = match kind {
            IndexKind::BTree => Arc::new(BTreeIndex::create(
                &self.base,
                name,
                self.config.page_cache_frames,
            )?),
            IndexKind::Hash => Arc::new(HashIndex::create(
                &self.base,
                name,
                self.config.page_cache_frames,
            )?),
        };
        tables.insert(name.to_string(), Arc::clone(&index));
        info!(table = name, kind = kind.as_str(), "table created");
        Ok(index)
    }

    pub fn get_table(&self, name: &str) -> Result<Arc<dyn Index>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or(TarnError::NotFound("table"))
    }

    /// Every registered table; checkpoint iterates this to flush.
    pub fn tables(&self) -> Vec<Arc<dyn Index>> {
        self.tables.read().values().cloned().collect()
    }

    /// An anonymous hash table used as join spill space. Not registered:
    /// the join removes its files when it finishes.
    pub fn create_temp_hash_table(&self) -> Result<Arc<HashIndex>> {
        let id = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let name = format!(".join{id}");
        Ok(Arc::new(HashIndex::create(
            &self.base,
            &name,
            self.config.page_cache_frames,
        )?))
    }

    /// Flushes every table's pages and metadata, quiescing writers per
    /// table.
    pub fn flush_all(&self) -> Result<()> {
        for table in self.tables() {
            let _barrier = table.pager().lock_all_updates();
            table.flush()?;
        }
        Ok(())
    }
}

fn validate_table_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(TarnError::Protocol(format!(
            "invalid table name {name:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_get_and_reopen_tables() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("data");
        {
            let db = Database::open(&path).expect("open");
            let tree = db.create_table("t", IndexKind::BTree).expect("create t");
            let hash = db.create_table("h", IndexKind::Hash).expect("create h");
            tree.insert(1, 10).expect("insert");
            hash.insert(2, 20).expect("insert");
            assert!(matches!(
                db.create_table("t", IndexKind::Hash),
                Err(TarnError::Protocol(_))
            ));
            db.flush_all().expect("flush");
        }
        let db = Database::open(&path).expect("reopen");
        assert_eq!(db.tables().len(), 2);
        assert_eq!(db.get_table("t").expect("t").find(1).expect("find"), 10);
        assert_eq!(db.get_table("h").expect("h").find(2).expect("find"), 20);
        assert_eq!(db.get_table("t").expect("t").kind(), IndexKind::BTree);
        assert!(matches!(
            db.get_table("missing"),
            Err(TarnError::NotFound("table"))
        ));
    }

    #[test]
    fn table_names_are_validated() {
        let dir = tempdir().expect("temp dir");
        let db = Database::open(&dir.path().join("data")).expect("open");
        assert!(db.create_table("ok_name-1", IndexKind::BTree).is_ok());
        for bad in ["", "a/b", "a b", "a,b", "..", "<x>"] {
            assert!(
                matches!(
                    db.create_table(bad, IndexKind::BTree),
                    Err(TarnError::Protocol(_))
                ),
                "name {bad:?} should be rejected"
            );
        }
    }
}
