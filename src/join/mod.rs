use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::debug;

use crate::database::Database;
use crate::error::{Result, TarnError};
use crate::index::{meta_path, Entry, HashIndex, Index};
use crate::pager::PageNum;

mod bloom;

pub use bloom::{BloomFilter, DEFAULT_FILTER_BITS};

/// One joined row: the matching entries from each side.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntryPair {
    pub left: Entry,
    pub right: Entry,
}

/// Running probe workers plus the temporary spill tables they read.
/// [`JoinWorkers::finish`] joins the workers, removes the spill files and
/// reports the first worker error.
pub struct JoinWorkers {
    handles: Vec<JoinHandle<Result<()>>>,
    spill: Vec<Arc<HashIndex>>,
}

impl JoinWorkers {
    pub fn finish(self) -> Result<()> {
        let mut first_error = None;
        for handle in self.handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => first_error = first_error.or(Some(err)),
                Err(_) => {
                    first_error =
                        first_error.or(Some(TarnError::Conflict("join worker panicked".into())))
                }
            }
        }
        for index in &self.spill {
            let data = index.pager().path().to_path_buf();
            let _ = fs::remove_file(meta_path(&data));
            let _ = fs::remove_file(data);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Grace hash join. Both inputs are partitioned into temporary extendible
/// hash tables keyed on the join attribute, the shallower directory is
/// extended until the depths match, and equal-indexed bucket pairs are
/// probed in parallel. Results flow through a bounded channel; every send
/// honours the cancellation receiver.
pub fn join(
    db: &Arc<Database>,
    left: &dyn Index,
    right: &dyn Index,
    join_on_left_key: bool,
    join_on_right_key: bool,
    cancel: Receiver<()>,
) -> Result<(Receiver<EntryPair>, JoinWorkers)> {
    let left_spill = build_spill_table(db, left, join_on_left_key)?;
    let right_spill = build_spill_table(db, right, join_on_right_key)?;

    while left_spill.depth() != right_spill.depth() {
        if left_spill.depth() < right_spill.depth() {
            left_spill.extend_table()?;
        } else {
            right_spill.extend_table()?;
        }
    }
    debug!(depth = left_spill.depth(), "join sides partitioned");

    let (sender, receiver) = bounded(db.config().join_channel_capacity);
    let left_buckets = left_spill.buckets();
    let right_buckets = right_spill.buckets();
    let mut seen: HashSet<(PageNum, PageNum)> = HashSet::new();
    let mut handles = Vec::new();
    for (slot, &left_pn) in left_buckets.iter().enumerate() {
        let right_pn = right_buckets[slot];
        if !seen.insert((left_pn, right_pn)) {
            continue;
        }
        let left_side = Arc::clone(&left_spill);
        let right_side = Arc::clone(&right_spill);
        let out = sender.clone();
        let cancelled = cancel.clone();
        handles.push(std::thread::spawn(move || {
            probe_buckets(
                &left_side,
                &right_side,
                left_pn,
                right_pn,
                join_on_left_key,
                join_on_right_key,
                &out,
                &cancelled,
            )
        }));
    }
    drop(sender);
    Ok((
        receiver,
        JoinWorkers {
            handles,
            spill: vec![left_spill, right_spill],
        },
    ))
}

/// Builds one side's spill table. Joining on the key inserts entries
/// as-is; joining on the value hashes the value, and the joined column
/// stands in for both fields. Entries sharing a join attribute beyond the
/// first are dropped, as the spill table is itself a unique index.
fn build_spill_table(
    db: &Arc<Database>,
    source: &dyn Index,
    use_key: bool,
) -> Result<Arc<HashIndex>> {
    let spill = db.create_temp_hash_table()?;
    for entry in source.select()? {
        let (key, value) = if use_key {
            (entry.key, entry.value)
        } else {
            (entry.value, entry.value)
        };
        match spill.insert(key, value) {
            Ok(()) | Err(TarnError::Duplicate(_)) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(spill)
}

#[allow(clippy::too_many_arguments)]
fn probe_buckets(
    left: &HashIndex,
    right: &HashIndex,
    left_pn: PageNum,
    right_pn: PageNum,
    join_on_left_key: bool,
    join_on_right_key: bool,
    out: &Sender<EntryPair>,
    cancel: &Receiver<()>,
) -> Result<()> {
    let left_entries = left.bucket_entries(left_pn)?;
    let right_entries = right.bucket_entries(right_pn)?;
    let mut filter = BloomFilter::new(DEFAULT_FILTER_BITS);
    for entry in &left_entries {
        filter.insert(entry.key);
    }
    for right_entry in &right_entries {
        if !filter.contains(right_entry.key) {
            continue;
        }
        for left_entry in &left_entries {
            if left_entry.key != right_entry.key {
                continue;
            }
            let left_out = if join_on_left_key {
                *left_entry
            } else {
                Entry {
                    key: left_entry.value,
                    value: left_entry.key,
                }
            };
            let right_out = if join_on_right_key {
                *right_entry
            } else {
                Entry {
                    key: right_entry.value,
                    value: right_entry.key,
                }
            };
            send_result(
                out,
                cancel,
                EntryPair {
                    left: left_out,
                    right: right_out,
                },
            )?;
        }
    }
    Ok(())
}

/// Sends one result unless the join has been cancelled.
fn send_result(out: &Sender<EntryPair>, cancel: &Receiver<()>, pair: EntryPair) -> Result<()> {
    select! {
        recv(cancel) -> _ => Err(TarnError::Conflict("join cancelled".into())),
        send(out, pair) -> sent => {
            sent.map_err(|_| TarnError::Conflict("join receiver dropped".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexKind;
    use crossbeam_channel::unbounded;
    use tempfile::tempdir;

    #[test]
    fn join_on_keys_matches_natural_join() {
        let dir = tempdir().expect("temp dir");
        let db = Database::open(&dir.path().join("data")).expect("open db");
        let left = db.create_table("l", IndexKind::BTree).expect("left");
        let right = db.create_table("r", IndexKind::Hash).expect("right");
        for key in 0..200i64 {
            left.insert(key, key * 10).expect("insert left");
        }
        for key in 100..300i64 {
            right.insert(key, key * 7).expect("insert right");
        }
        let (_cancel_tx, cancel_rx) = unbounded::<()>();
        let (results, workers) =
            join(&db, left.as_ref(), right.as_ref(), true, true, cancel_rx).expect("join");
        let mut pairs: Vec<EntryPair> = results.iter().collect();
        workers.finish().expect("workers");
        pairs.sort_by_key(|pair| pair.left.key);
        assert_eq!(pairs.len(), 100);
        for (offset, pair) in pairs.iter().enumerate() {
            let key = 100 + offset as i64;
            assert_eq!(pair.left, Entry { key, value: key * 10 });
            assert_eq!(pair.right, Entry { key, value: key * 7 });
        }
        // Spill files are cleaned up.
        let leftovers: Vec<_> = std::fs::read_dir(db.base_path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".join"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn join_on_values_swaps_emitted_entries() {
        let dir = tempdir().expect("temp dir");
        let db = Database::open(&dir.path().join("data")).expect("open db");
        let left = db.create_table("l", IndexKind::BTree).expect("left");
        let right = db.create_table("r", IndexKind::BTree).expect("right");
        left.insert(1, 42).expect("insert left");
        right.insert(42, 5).expect("insert right");
        let (_cancel_tx, cancel_rx) = unbounded::<()>();
        let (results, workers) =
            join(&db, left.as_ref(), right.as_ref(), false, true, cancel_rx).expect("join");
        let pairs: Vec<EntryPair> = results.iter().collect();
        workers.finish().expect("workers");
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].left, Entry { key: 42, value: 42 });
        assert_eq!(pairs[0].right, Entry { key: 42, value: 5 });
    }

    #[test]
    fn cancellation_stops_workers() {
        let dir = tempdir().expect("temp dir");
        let db = Database::open_with_config(
            &dir.path().join("data"),
            crate::config::Config {
                join_channel_capacity: 1,
                ..crate::config::Config::default()
            },
        )
        .expect("open db");
        let left = db.create_table("l", IndexKind::BTree).expect("left");
        let right = db.create_table("r", IndexKind::BTree).expect("right");
        for key in 0..500i64 {
            left.insert(key, key).expect("insert left");
            right.insert(key, key).expect("insert right");
        }
        let (cancel_tx, cancel_rx) = unbounded::<()>();
        let (results, workers) =
            join(&db, left.as_ref(), right.as_ref(), true, true, cancel_rx).expect("join");
        // Take a few results, then cancel while the channel is saturated.
        let _first = results.recv().expect("one result");
        cancel_tx.send(()).expect("cancel");
        drop(results);
        assert!(workers.finish().is_err());
    }
}
