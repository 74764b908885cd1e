use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::concurrency::{LockMode, Resource, TransactionManager};
use crate::config::Config;
use crate::database::Database;
use crate::error::{Result, TarnError};
use crate::index::{Index, IndexKind};

mod log;

pub use self::log::{parse_log, parse_record, EditAction, LogRecord};

struct RmState {
    file: File,
    tx_stack: HashMap<Uuid, Vec<LogRecord>>,
}

/// Write-ahead logging and crash recovery. Every record is appended and
/// fsynced before the in-memory effect it describes becomes visible; a
/// per-client stack of records since `start` backs in-process rollback.
pub struct RecoveryManager {
    db: Arc<Database>,
    tm: Arc<TransactionManager>,
    state: Mutex<RmState>,
    log_path: PathBuf,
    sync_log: bool,
}

impl RecoveryManager {
    pub fn new(db: Arc<Database>, tm: Arc<TransactionManager>) -> Result<Arc<Self>> {
        let log_path = log_path_for(db.base_path());
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&log_path)?;
        let sync_log = db.config().sync_log;
        Ok(Arc::new(Self {
            db,
            tm,
            state: Mutex::new(RmState {
                file,
                tx_stack: HashMap::new(),
            }),
            log_path,
            sync_log,
        }))
    }

    fn append(&self, state: &mut RmState, record: &LogRecord) -> Result<()> {
        writeln!(state.file, "{record}")?;
        if self.sync_log {
            state.file.sync_data()?;
        }
        Ok(())
    }

    /// Clients with a `start` record and no `commit` yet.
    pub fn live_clients(&self) -> Vec<Uuid> {
        self.state.lock().tx_stack.keys().copied().collect()
    }

    pub fn log_table(&self, kind: IndexKind, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        self.append(
            &mut state,
            &LogRecord::Table {
                kind,
                name: name.to_string(),
            },
        )
    }

    pub fn log_start(&self, client: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        let record = LogRecord::Start { client };
        self.append(&mut state, &record)?;
        state.tx_stack.insert(client, vec![record]);
        Ok(())
    }

    pub fn log_commit(&self, client: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        self.append(&mut state, &LogRecord::Commit { client })?;
        state.tx_stack.remove(&client);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_edit(
        &self,
        client: Uuid,
        table: &str,
        action: EditAction,
        key: i64,
        old_value: i64,
        new_value: i64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let record = LogRecord::Edit {
            client,
            table: table.to_string(),
            action,
            key,
            old_value,
            new_value,
        };
        self.append(&mut state, &record)?;
        // Only transactions accumulate a rollback stack; autocommit edits
        // are logged but have nothing to undo.
        if let Some(stack) = state.tx_stack.get_mut(&client) {
            stack.push(record);
        }
        Ok(())
    }

    /// `transaction begin` for a client: registered with the transaction
    /// manager and logged.
    pub fn begin_transaction(&self, client: Uuid) -> Result<()> {
        self.tm.begin(client)?;
        self.log_start(client)
    }

    /// `transaction commit`: logged, then locks released.
    pub fn commit_transaction(&self, client: Uuid) -> Result<()> {
        if !self.tm.has_transaction(client) {
            return Err(TarnError::Protocol("commit without begin".into()));
        }
        self.log_commit(client)?;
        self.tm.commit(client)
    }

    /// Creates a table, logging the creation first.
    pub fn logged_create_table(&self, name: &str, kind: IndexKind) -> Result<Arc<dyn Index>> {
        if self.db.get_table(name).is_ok() {
            return Err(TarnError::Protocol(format!("table {name} already exists")));
        }
        self.log_table(kind, name)?;
        self.db.create_table(name, kind)
    }

    /// Point insert through lock and log. Outside a transaction the lock
    /// step is skipped and the edit applies immediately.
    pub fn logged_insert(&self, client: Uuid, table: &str, key: i64, value: i64) -> Result<()> {
        let index = self.db.get_table(table)?;
        self.lock_for_edit(client, table, key)?;
        match index.find(key) {
            Ok(_) => return Err(TarnError::Duplicate(key)),
            Err(TarnError::NotFound(_)) => {}
            Err(other) => return Err(other),
        }
        self.log_edit(client, table, EditAction::Insert, key, 0, value)?;
        index.insert(key, value)
    }

    /// Point update through lock and log; records the previous value for
    /// undo.
    pub fn logged_update(&self, client: Uuid, table: &str, key: i64, value: i64) -> Result<()> {
        let index = self.db.get_table(table)?;
        self.lock_for_edit(client, table, key)?;
        let old_value = index.find(key)?;
        self.log_edit(client, table, EditAction::Update, key, old_value, value)?;
        index.update(key, value)
    }

    /// Point delete through lock and log; records the deleted value for
    /// undo.
    pub fn logged_delete(&self, client: Uuid, table: &str, key: i64) -> Result<()> {
        let index = self.db.get_table(table)?;
        self.lock_for_edit(client, table, key)?;
        let old_value = index.find(key)?;
        self.log_edit(client, table, EditAction::Delete, key, old_value, 0)?;
        index.delete(key)
    }

    fn lock_for_edit(&self, client: Uuid, table: &str, key: i64) -> Result<()> {
        if self.tm.has_transaction(client) {
            self.tm
                .lock(client, &Resource::new(table, key), LockMode::Exclusive)?;
        }
        Ok(())
    }

    /// Quiesces and flushes every table, appends a checkpoint record
    /// naming the live transactions, then snapshots the database directory
    /// to its `-recovery` peer.
    pub fn checkpoint(&self) -> Result<()> {
        let mut state = self.state.lock();
        let tables = self.db.tables();
        let barriers: Vec<_> = tables
            .iter()
            .map(|table| table.pager().lock_all_updates())
            .collect();
        for table in &tables {
            table.flush()?;
        }
        let clients: Vec<Uuid> = state.tx_stack.keys().copied().collect();
        self.append(&mut state, &LogRecord::Checkpoint { clients })?;
        drop(barriers);
        self.snapshot()?;
        info!(tables = tables.len(), "checkpoint complete");
        Ok(())
    }

    /// Whole-directory copy of the database next to itself; coarse but
    /// crash-consistent together with the log.
    fn snapshot(&self) -> Result<()> {
        let source = self.db.base_path();
        let target = recovery_dir_for(source);
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        copy_dir(source, &target)
    }

    /// Rolls back one live transaction: undoes its edits newest to
    /// oldest through real locks, then commits in both the log and the
    /// transaction manager so the rollback itself is durable.
    pub fn rollback(&self, client: Uuid) -> Result<()> {
        let records = self
            .state
            .lock()
            .tx_stack
            .get(&client)
            .cloned()
            .ok_or_else(|| TarnError::Protocol("transaction not found".into()))?;
        for record in records.iter().rev() {
            if matches!(record, LogRecord::Edit { .. }) {
                self.undo_edit(record)?;
            }
        }
        warn!(client = %client, edits = records.len() - 1, "transaction rolled back");
        self.log_commit(client)?;
        self.tm.commit(client)
    }

    /// Replays the log after a restart: seeds the active set from the
    /// last checkpoint, redoes forward from it, then undoes the edits of
    /// still-active transactions back to the checkpoint and closes them
    /// with compensating commits.
    pub fn recover(&self) -> Result<()> {
        let text = fs::read_to_string(&self.log_path)?;
        let records = parse_log(&text);
        let checkpoint_pos = records
            .iter()
            .rposition(|record| matches!(record, LogRecord::Checkpoint { .. }));

        let mut active: HashSet<Uuid> = HashSet::new();
        let redo_from = match checkpoint_pos {
            Some(pos) => {
                if let LogRecord::Checkpoint { clients } = &records[pos] {
                    for &client in clients {
                        self.tm.begin(client)?;
                        active.insert(client);
                    }
                }
                pos
            }
            None => 0,
        };

        for record in &records[redo_from..] {
            match record {
                LogRecord::Table { kind, name } => {
                    if self.db.get_table(name).is_err() {
                        self.db.create_table(name, *kind)?;
                    }
                }
                LogRecord::Edit { .. } => self.redo_edit(record)?,
                LogRecord::Start { client } => {
                    self.tm.begin(*client)?;
                    active.insert(*client);
                }
                LogRecord::Commit { client } => {
                    active.remove(client);
                    self.tm.commit(*client)?;
                }
                LogRecord::Checkpoint { .. } => {}
            }
        }

        // Losers are undone to the checkpoint state: the snapshot already
        // reflects everything before the checkpoint record.
        for record in records[redo_from..].iter().rev() {
            match record {
                LogRecord::Edit { client, .. } if active.contains(client) => {
                    self.undo_edit(record)?;
                }
                LogRecord::Start { client } if active.contains(client) => {
                    self.log_commit(*client)?;
                    self.tm.commit(*client)?;
                    active.remove(client);
                }
                _ => {}
            }
        }
        for client in active {
            self.log_commit(client)?;
            self.tm.commit(client)?;
        }
        info!(records = records.len(), "recovery replay complete");
        Ok(())
    }

    /// Applies a logged edit during redo. Idempotent across unknown
    /// starting states: insert falls back to update on a duplicate key,
    /// update falls back to insert on a missing key, delete is as-is.
    fn redo_edit(&self, record: &LogRecord) -> Result<()> {
        let LogRecord::Edit {
            table,
            action,
            key,
            new_value,
            ..
        } = record
        else {
            return Err(TarnError::Protocol("can only redo edit records".into()));
        };
        let index = self.db.get_table(table)?;
        match action {
            EditAction::Insert => match index.insert(*key, *new_value) {
                Err(TarnError::Duplicate(_)) => index.update(*key, *new_value),
                result => result,
            },
            EditAction::Update => match index.update(*key, *new_value) {
                Err(TarnError::NotFound(_)) => index.insert(*key, *new_value),
                result => result,
            },
            EditAction::Delete => index.delete(*key),
        }
    }

    /// Applies the inverse of a logged edit through the locked, logged
    /// path, so undo serialises with live transactions and is itself
    /// recoverable.
    fn undo_edit(&self, record: &LogRecord) -> Result<()> {
        let LogRecord::Edit {
            client,
            table,
            action,
            key,
            old_value,
            ..
        } = record
        else {
            return Err(TarnError::Protocol("can only undo edit records".into()));
        };
        match action {
            EditAction::Insert => self.logged_delete(*client, table, *key),
            EditAction::Update => self.logged_update(*client, table, *key, *old_value),
            EditAction::Delete => self.logged_insert(*client, table, *key, *old_value),
        }
    }
}

/// Opens the database under `dir`, restoring the `-recovery` snapshot
/// first when one exists. Call [`RecoveryManager::recover`] afterwards to
/// replay the log.
pub fn prime(dir: &Path, config: Config) -> Result<Arc<Database>> {
    let recovery = recovery_dir_for(dir);
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        fs::create_dir_all(&recovery)?;
        return Database::open_with_config(dir, config);
    }
    if !recovery.exists() {
        return Database::open_with_config(dir, config);
    }
    fs::remove_dir_all(dir)?;
    copy_dir(&recovery, dir)?;
    info!(dir = %dir.display(), "database restored from recovery snapshot");
    Database::open_with_config(dir, config)
}

fn log_path_for(dir: &Path) -> PathBuf {
    let mut os_string = dir.as_os_str().to_owned();
    os_string.push(".log");
    PathBuf::from(os_string)
}

fn recovery_dir_for(dir: &Path) -> PathBuf {
    let mut os_string = dir.as_os_str().to_owned();
    os_string.push("-recovery");
    PathBuf::from(os_string)
}

fn copy_dir(source: &Path, target: &Path) -> Result<()> {
    fs::create_dir_all(target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}
