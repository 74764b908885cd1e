use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, TarnError};

use super::graph::WaitsForGraph;
use super::lock_manager::{LockManager, LockMode, Resource};

/// One client's transaction: the set of resources it holds and the mode
/// it holds each in. Created by `begin`, destroyed by `commit`.
pub struct Transaction {
    id: Uuid,
    resources: RwLock<HashMap<Resource, LockMode>>,
}

impl Transaction {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            resources: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn resources(&self) -> HashMap<Resource, LockMode> {
        self.resources.read().clone()
    }
}

struct TmState {
    transactions: HashMap<Uuid, Arc<Transaction>>,
    graph: WaitsForGraph,
}

/// Coordinates strict two-phase locking: resources are acquired through
/// [`TransactionManager::lock`] and released together at commit. Before a
/// request is allowed to block, its would-be waits-for edges are added to
/// the graph and a cycle check runs; a request that would close a cycle
/// fails with `Deadlock` instead of blocking. The check is conservative:
/// it can reject schedules that would have untangled themselves, but it
/// never lets a deadlock form.
pub struct TransactionManager {
    lm: Arc<LockManager>,
    state: Mutex<TmState>,
}

impl TransactionManager {
    pub fn new(lm: Arc<LockManager>) -> Arc<Self> {
        Arc::new(Self {
            lm,
            state: Mutex::new(TmState {
                transactions: HashMap::new(),
                graph: WaitsForGraph::default(),
            }),
        })
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lm
    }

    pub fn begin(&self, client: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        if state.transactions.contains_key(&client) {
            return Err(TarnError::Protocol("transaction already began".into()));
        }
        state
            .transactions
            .insert(client, Arc::new(Transaction::new(client)));
        debug!(client = %client, "transaction began");
        Ok(())
    }

    pub fn has_transaction(&self, client: Uuid) -> bool {
        self.state.lock().transactions.contains_key(&client)
    }

    pub fn transaction(&self, client: Uuid) -> Result<Arc<Transaction>> {
        self.state
            .lock()
            .transactions
            .get(&client)
            .cloned()
            .ok_or_else(|| TarnError::Protocol("transaction not found".into()))
    }

    /// Acquires `resource` in `mode` for `client`. Re-acquisition at the
    /// same or weaker mode is idempotent; shared to exclusive upgrades go
    /// through the same conflict discovery as fresh requests.
    pub fn lock(&self, client: Uuid, resource: &Resource, mode: LockMode) -> Result<()> {
        let tx = self.transaction(client)?;
        if let Some(&held) = tx.resources.read().get(resource) {
            match (held, mode) {
                (LockMode::Exclusive, _) | (LockMode::Shared, LockMode::Shared) => return Ok(()),
                (LockMode::Shared, LockMode::Exclusive) => {}
            }
        }
        let conflicting = {
            let mut state = self.state.lock();
            let conflicting = discover_conflicts(&state.transactions, client, resource, mode);
            for &other in &conflicting {
                state.graph.add_edge(client, other);
            }
            if state.graph.has_cycle_from(client) {
                for &other in &conflicting {
                    state.graph.remove_edge(client, other);
                }
                debug!(client = %client, table = %resource.table, key = resource.key,
                    "lock request rejected, would deadlock");
                return Err(TarnError::Deadlock);
            }
            conflicting
        };
        // May block; the edges added above keep later requesters honest
        // about who this transaction is waiting on.
        self.lm.lock(client, resource, mode);
        {
            let mut state = self.state.lock();
            for &other in &conflicting {
                state.graph.remove_edge(client, other);
            }
        }
        tx.resources.write().insert(resource.clone(), mode);
        Ok(())
    }

    /// Early release of a single resource; the mode must match what the
    /// transaction holds.
    pub fn unlock(&self, client: Uuid, resource: &Resource, mode: LockMode) -> Result<()> {
        let tx = self.transaction(client)?;
        {
            let mut resources = tx.resources.write();
            match resources.get(resource) {
                Some(&held) if held == mode => {
                    resources.remove(resource);
                }
                Some(_) => {
                    return Err(TarnError::Protocol("lock mode does not match".into()));
                }
                None => {
                    return Err(TarnError::Protocol("resource to unlock not found".into()));
                }
            }
        }
        self.lm.unlock(client, resource, mode)
    }

    /// Releases every lock held by `client` and forgets the transaction.
    pub fn commit(&self, client: Uuid) -> Result<()> {
        let tx = {
            let mut state = self.state.lock();
            let tx = state
                .transactions
                .remove(&client)
                .ok_or_else(|| TarnError::Protocol("no transaction running".into()))?;
            state.graph.remove_node(client);
            tx
        };
        for (resource, mode) in tx.resources.read().iter() {
            self.lm.unlock(client, resource, *mode)?;
        }
        debug!(client = %client, "transaction committed");
        Ok(())
    }
}

/// Transactions other than `client` holding `resource` in a mode that is
/// incompatible with `mode`.
fn discover_conflicts(
    transactions: &HashMap<Uuid, Arc<Transaction>>,
    client: Uuid,
    resource: &Resource,
    mode: LockMode,
) -> Vec<Uuid> {
    let mut conflicting = Vec::new();
    for (&id, tx) in transactions {
        if id == client {
            continue;
        }
        if let Some(&held) = tx.resources.read().get(resource) {
            if held == LockMode::Exclusive || mode == LockMode::Exclusive {
                conflicting.push(id);
            }
        }
    }
    conflicting
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn manager() -> Arc<TransactionManager> {
        TransactionManager::new(Arc::new(LockManager::new()))
    }

    #[test]
    fn begin_twice_is_a_protocol_error() {
        let tm = manager();
        let client = Uuid::new_v4();
        tm.begin(client).expect("begin");
        assert!(matches!(tm.begin(client), Err(TarnError::Protocol(_))));
        tm.commit(client).expect("commit");
        tm.begin(client).expect("begin again after commit");
    }

    #[test]
    fn relock_is_idempotent_and_upgrade_succeeds_alone() {
        let tm = manager();
        let client = Uuid::new_v4();
        let resource = Resource::new("t", 1);
        tm.begin(client).expect("begin");
        tm.lock(client, &resource, LockMode::Shared).expect("shared");
        tm.lock(client, &resource, LockMode::Shared)
            .expect("shared again");
        tm.lock(client, &resource, LockMode::Exclusive)
            .expect("upgrade as sole reader");
        tm.lock(client, &resource, LockMode::Shared)
            .expect("weaker mode after upgrade");
        assert_eq!(
            tm.transaction(client).expect("tx").resources()[&resource],
            LockMode::Exclusive
        );
        tm.commit(client).expect("commit");
    }

    #[test]
    fn two_client_cross_request_deadlocks() {
        let tm = manager();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let r5 = Resource::new("t", 5);
        let r6 = Resource::new("t", 6);
        tm.begin(a).expect("begin a");
        tm.begin(b).expect("begin b");
        tm.lock(a, &r5, LockMode::Exclusive).expect("a locks 5");
        tm.lock(b, &r6, LockMode::Exclusive).expect("b locks 6");

        let tm_a = Arc::clone(&tm);
        let blocked = thread::spawn(move || tm_a.lock(a, &r6, LockMode::Exclusive));
        thread::sleep(Duration::from_millis(50));

        let result = tm.lock(b, &Resource::new("t", 5), LockMode::Exclusive);
        assert!(matches!(result, Err(TarnError::Deadlock)));

        // B backs off; A's blocked request must now complete.
        tm.commit(b).expect("commit b");
        blocked
            .join()
            .expect("blocked thread")
            .expect("a acquires 6 after b releases");
        tm.commit(a).expect("commit a");
    }

    #[test]
    fn commit_releases_locks_for_other_clients() {
        let tm = manager();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let resource = Resource::new("t", 9);
        tm.begin(a).expect("begin a");
        tm.begin(b).expect("begin b");
        tm.lock(a, &resource, LockMode::Exclusive).expect("a locks");
        tm.commit(a).expect("commit a");
        tm.lock(b, &resource, LockMode::Exclusive)
            .expect("b locks after a commits");
        tm.commit(b).expect("commit b");
    }

    #[test]
    fn unlock_requires_matching_mode() {
        let tm = manager();
        let client = Uuid::new_v4();
        let resource = Resource::new("t", 2);
        tm.begin(client).expect("begin");
        tm.lock(client, &resource, LockMode::Shared).expect("lock");
        assert!(matches!(
            tm.unlock(client, &resource, LockMode::Exclusive),
            Err(TarnError::Protocol(_))
        ));
        tm.unlock(client, &resource, LockMode::Shared).expect("unlock");
        assert!(matches!(
            tm.unlock(client, &resource, LockMode::Shared),
            Err(TarnError::Protocol(_))
        ));
        tm.commit(client).expect("commit");
    }
}
