use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::error::{Result, TarnError};

/// A lockable unit: one key of one table. Lock state is materialised on
/// first acquisition.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Resource {
    pub table: String,
    pub key: i64,
}

impl Resource {
    pub fn new(table: impl Into<String>, key: i64) -> Self {
        Self {
            table: table.into(),
            key,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::Shared => "r",
            LockMode::Exclusive => "w",
        }
    }
}

struct Waiter {
    ticket: u64,
    owner: Uuid,
    mode: LockMode,
}

#[derive(Default)]
struct LockInner {
    holders: HashMap<Uuid, LockMode>,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
}

#[derive(Default)]
struct LockState {
    inner: Mutex<LockInner>,
    cond: Condvar,
}

/// Maps resources to read/write lock state with a FIFO waiter queue.
/// Oblivious to deadlock policy: callers (the transaction manager) decide
/// whether a request is safe to block on before calling [`LockManager::lock`].
#[derive(Default)]
pub struct LockManager {
    table: Mutex<HashMap<Resource, Arc<LockState>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_for(&self, resource: &Resource) -> Arc<LockState> {
        let mut table = self.table.lock();
        Arc::clone(table.entry(resource.clone()).or_default())
    }

    /// Acquires `resource` in `mode` for `owner`, blocking behind the FIFO
    /// queue. A waiting exclusive request blocks later shared requests (no
    /// barging). An exclusive request by the sole shared holder upgrades
    /// immediately; an upgrade with other holders waits at the front of
    /// the queue.
    pub fn lock(&self, owner: Uuid, resource: &Resource, mode: LockMode) {
        let state = self.state_for(resource);
        let mut inner = state.inner.lock();
        let upgrading =
            mode == LockMode::Exclusive && inner.holders.get(&owner) == Some(&LockMode::Shared);
        if upgrading && inner.holders.len() == 1 {
            inner.holders.insert(owner, LockMode::Exclusive);
            return;
        }
        if !upgrading && inner.queue.is_empty() && grantable(&inner.holders, owner, mode) {
            inner.holders.insert(owner, mode);
            return;
        }
        let ticket = inner.next_ticket;
        inner.next_ticket += 1;
        let waiter = Waiter {
            ticket,
            owner,
            mode,
        };
        if upgrading {
            inner.queue.push_front(waiter);
        } else {
            inner.queue.push_back(waiter);
        }
        loop {
            let at_front = inner.queue.front().map(|w| w.ticket) == Some(ticket);
            if at_front && grantable(&inner.holders, owner, mode) {
                inner.queue.pop_front();
                inner.holders.insert(owner, mode);
                // Consecutive compatible waiters drain one at a time.
                state.cond.notify_all();
                return;
            }
            state.cond.wait(&mut inner);
        }
    }

    /// Releases `owner`'s hold and wakes the queue; waiters are granted in
    /// order until the front request is incompatible with the remaining
    /// holders.
    pub fn unlock(&self, owner: Uuid, resource: &Resource, mode: LockMode) -> Result<()> {
        let state = {
            let table = self.table.lock();
            table
                .get(resource)
                .cloned()
                .ok_or_else(|| TarnError::Protocol("resource is not locked".into()))?
        };
        let mut inner = state.inner.lock();
        match inner.holders.get(&owner) {
            Some(held) if *held == mode => {}
            Some(_) => return Err(TarnError::Protocol("lock mode does not match".into())),
            None => return Err(TarnError::Protocol("lock is not held".into())),
        }
        inner.holders.remove(&owner);
        state.cond.notify_all();
        Ok(())
    }
}

fn grantable(holders: &HashMap<Uuid, LockMode>, owner: Uuid, mode: LockMode) -> bool {
    match mode {
        LockMode::Shared => holders.values().all(|held| *held == LockMode::Shared),
        LockMode::Exclusive => {
            holders.is_empty()
                || (holders.len() == 1 && holders.get(&owner) == Some(&LockMode::Shared))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn resource() -> Resource {
        Resource::new("t", 1)
    }

    #[test]
    fn shared_holders_stack() {
        let lm = LockManager::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        lm.lock(a, &resource(), LockMode::Shared);
        lm.lock(b, &resource(), LockMode::Shared);
        lm.unlock(a, &resource(), LockMode::Shared).expect("unlock a");
        lm.unlock(b, &resource(), LockMode::Shared).expect("unlock b");
    }

    #[test]
    fn exclusive_blocks_until_release() {
        let lm = Arc::new(LockManager::new());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        lm.lock(a, &resource(), LockMode::Exclusive);
        let acquired = Arc::new(AtomicBool::new(false));
        let lm2 = Arc::clone(&lm);
        let flag = Arc::clone(&acquired);
        let handle = thread::spawn(move || {
            lm2.lock(b, &resource(), LockMode::Exclusive);
            flag.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(30));
        assert!(!acquired.load(Ordering::SeqCst));
        lm.unlock(a, &resource(), LockMode::Exclusive).expect("unlock");
        handle.join().expect("waiter thread");
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn waiting_exclusive_blocks_later_shared() {
        let lm = Arc::new(LockManager::new());
        let reader = Uuid::new_v4();
        let writer = Uuid::new_v4();
        let late_reader = Uuid::new_v4();
        lm.lock(reader, &resource(), LockMode::Shared);

        let events = Arc::new(Mutex::new(Vec::new()));
        let lm_w = Arc::clone(&lm);
        let ev_w = Arc::clone(&events);
        let writer_thread = thread::spawn(move || {
            lm_w.lock(writer, &resource(), LockMode::Exclusive);
            ev_w.lock().push("writer");
            thread::sleep(Duration::from_millis(20));
            lm_w.unlock(writer, &resource(), LockMode::Exclusive)
                .expect("unlock writer");
        });
        thread::sleep(Duration::from_millis(30));

        let lm_r = Arc::clone(&lm);
        let ev_r = Arc::clone(&events);
        let reader_thread = thread::spawn(move || {
            lm_r.lock(late_reader, &resource(), LockMode::Shared);
            ev_r.lock().push("late reader");
            lm_r.unlock(late_reader, &resource(), LockMode::Shared)
                .expect("unlock late reader");
        });
        thread::sleep(Duration::from_millis(30));
        // The late shared request must queue behind the exclusive waiter.
        assert!(events.lock().is_empty());

        lm.unlock(reader, &resource(), LockMode::Shared)
            .expect("unlock first reader");
        writer_thread.join().expect("writer thread");
        reader_thread.join().expect("reader thread");
        assert_eq!(*events.lock(), vec!["writer", "late reader"]);
    }

    #[test]
    fn sole_shared_holder_upgrades_without_blocking() {
        let lm = LockManager::new();
        let a = Uuid::new_v4();
        lm.lock(a, &resource(), LockMode::Shared);
        lm.lock(a, &resource(), LockMode::Exclusive);
        lm.unlock(a, &resource(), LockMode::Exclusive)
            .expect("unlock upgraded");
    }

    #[test]
    fn unlock_validates_holder_and_mode() {
        let lm = LockManager::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        lm.lock(a, &resource(), LockMode::Shared);
        assert!(lm.unlock(a, &resource(), LockMode::Exclusive).is_err());
        assert!(lm.unlock(b, &resource(), LockMode::Shared).is_err());
        lm.unlock(a, &resource(), LockMode::Shared).expect("unlock");
    }
}
