//! Fair readers/writer lock table shared by every session worker.
//!
//! The table lives behind a single mutex that is only held for O(1)
//! bookkeeping. A request that cannot be granted is parked in the resource's
//! FIFO wait queue together with a oneshot sender; the releasing worker
//! records the grant and fires that sender while still holding the mutex, so
//! ownership moves straight from the releaser to the waiter.
//!
//! Promotion rules on release, once the resource has no holders left:
//!
//! - a WRITE at the front of the queue is granted alone;
//! - a READ at the front is granted together with every READ directly behind
//!   it, stopping at the first WRITE.
//!
//! Nothing is ever reordered, so a queued WRITE is never overtaken by a READ
//! that arrived after it.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{
    error::LockError,
    protocol::{ClientId, LockMode, fits_in_frame},
    store::{MemoryStore, PayloadStore},
};

/// Externally visible mode of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Read,
    Write,
}

/// Point-in-time view of one resource, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSnapshot {
    pub state: LockState,
    pub active_readers: usize,
    pub owner: Option<ClientId>,
    pub queued: usize,
}

impl LockSnapshot {
    fn unlocked() -> Self {
        Self {
            state: LockState::Unlocked,
            active_readers: 0,
            owner: None,
            queued: 0,
        }
    }
}

#[derive(Debug, Default)]
enum Holders {
    #[default]
    Unlocked,
    /// Hold count per reader; never empty.
    Read { readers: HashMap<ClientId, usize> },
    Write { owner: ClientId },
}

struct Waiter {
    client: ClientId,
    mode: LockMode,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct ResourceLock {
    holders: Holders,
    queue: VecDeque<Waiter>,
}

impl ResourceLock {
    fn active_readers(&self) -> usize {
        match &self.holders {
            Holders::Read { readers } => readers.values().sum(),
            _ => 0,
        }
    }

    fn snapshot(&self) -> LockSnapshot {
        let (state, owner) = match &self.holders {
            Holders::Unlocked => (LockState::Unlocked, None),
            Holders::Read { .. } => (LockState::Read, None),
            Holders::Write { owner } => (LockState::Write, Some(*owner)),
        };
        LockSnapshot {
            state,
            active_readers: self.active_readers(),
            owner,
            queued: self.queue.len(),
        }
    }

    fn can_grant_now(&self, mode: LockMode) -> bool {
        match (&self.holders, mode) {
            (Holders::Unlocked, _) => true,
            (Holders::Read { .. }, LockMode::Read) => self.queue.is_empty(),
            _ => false,
        }
    }

    /// Callers must have checked that the grant is compatible.
    fn grant(&mut self, client: ClientId, mode: LockMode) {
        match mode {
            LockMode::Write => self.holders = Holders::Write { owner: client },
            LockMode::Read => match &mut self.holders {
                Holders::Read { readers } => *readers.entry(client).or_insert(0) += 1,
                _ => {
                    self.holders = Holders::Read {
                        readers: HashMap::from([(client, 1)]),
                    }
                }
            },
        }
    }

    /// Drops one hold of `client`, returning which kind it was.
    fn release(&mut self, client: ClientId) -> Option<LockMode> {
        let (released, now_unlocked) = match &mut self.holders {
            Holders::Write { owner } if *owner == client => (Some(LockMode::Write), true),
            Holders::Read { readers } => match readers.get_mut(&client) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        readers.remove(&client);
                    }
                    (Some(LockMode::Read), readers.is_empty())
                }
                None => (None, false),
            },
            _ => (None, false),
        };

        if now_unlocked {
            self.holders = Holders::Unlocked;
        }
        released
    }

    /// Hands the resource to the waiters at the front of the queue.
    fn promote(&mut self) -> Vec<(ClientId, LockMode)> {
        let mut promoted = Vec::new();

        while let Some(front) = self.queue.front() {
            let admissible = match (&self.holders, front.mode) {
                (Holders::Unlocked, _) => true,
                // Only while draining a batch of readers.
                (Holders::Read { .. }, LockMode::Read) => !promoted.is_empty(),
                _ => false,
            };
            if !admissible {
                break;
            }

            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            if waiter.grant.send(()).is_err() {
                // The waiting task is gone; it never gets the resource.
                debug!(client = waiter.client, "skipping abandoned waiter");
                continue;
            }

            self.grant(waiter.client, waiter.mode);
            promoted.push((waiter.client, waiter.mode));
            if waiter.mode == LockMode::Write {
                break;
            }
        }

        promoted
    }
}

#[derive(Default)]
struct LockTable {
    resources: HashMap<String, ResourceLock>,
}

impl LockTable {
    fn entry(&mut self, resource: &str) -> &mut ResourceLock {
        self.resources.entry(resource.to_string()).or_default()
    }

    fn get_mut(&mut self, resource: &str) -> Option<&mut ResourceLock> {
        self.resources.get_mut(resource)
    }

    fn get(&self, resource: &str) -> Option<&ResourceLock> {
        self.resources.get(resource)
    }
}

/// The lock manager: acquire/release over the lock table plus payload access
/// gated by lock ownership.
pub struct LockManager {
    table: Mutex<LockTable>,
    store: Arc<dyn PayloadStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn PayloadStore>) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            store,
        }
    }

    /// A manager whose payloads live only in memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    // Every mutation restores the table invariants before anything that can
    // panic, so a poisoned guard is still consistent.
    fn table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Completes once `client` holds `resource` in `mode`.
    ///
    /// Waits without bound; there is no lease or timeout.
    pub async fn acquire(&self, resource: &str, mode: LockMode, client: ClientId) {
        let granted = {
            let mut table = self.table();
            let lock = table.entry(resource);

            if lock.can_grant_now(mode) {
                lock.grant(client, mode);
                info!(client, resource, %mode, "lock granted");
                return;
            }

            let (grant, granted) = oneshot::channel();
            lock.queue.push_back(Waiter {
                client,
                mode,
                grant,
            });
            info!(
                client,
                resource,
                %mode,
                position = lock.queue.len(),
                "lock queued"
            );
            granted
        };

        if granted.await.is_err() {
            // Senders are consumed by `promote`, which only runs while the
            // table (and so this manager) is alive.
            warn!(client, resource, "lock waiter dropped without a grant");
        }
    }

    /// Releases whatever hold `client` has on `resource`.
    ///
    /// Releasing something not held, or held by someone else, is a no-op and
    /// returns `None`.
    pub fn release(&self, resource: &str, client: ClientId) -> Option<LockMode> {
        let mut table = self.table();
        let Some(lock) = table.get_mut(resource) else {
            debug!(client, resource, "release of unknown resource ignored");
            return None;
        };

        let Some(released) = lock.release(client) else {
            debug!(client, resource, "release by non-holder ignored");
            return None;
        };
        info!(client, resource, mode = %released, "lock released");

        if matches!(lock.holders, Holders::Unlocked) {
            for (waiter, mode) in lock.promote() {
                info!(client = waiter, resource, %mode, "lock granted from queue");
            }
        }
        Some(released)
    }

    pub fn holds_write(&self, resource: &str, client: ClientId) -> bool {
        let table = self.table();
        matches!(
            table.get(resource).map(|lock| &lock.holders),
            Some(Holders::Write { owner }) if *owner == client
        )
    }

    pub fn snapshot(&self, resource: &str) -> LockSnapshot {
        let table = self.table();
        table
            .get(resource)
            .map(ResourceLock::snapshot)
            .unwrap_or_else(LockSnapshot::unlocked)
    }

    /// Current payload of `resource`, empty if none was ever written.
    ///
    /// A stored payload that cannot travel on one reply line is refused.
    pub async fn read(&self, resource: &str) -> Result<String, LockError> {
        let payload = self.store.read_payload(resource).await?.unwrap_or_default();
        if !fits_in_frame(&payload) {
            return Err(LockError::Unframeable {
                resource: resource.to_string(),
            });
        }
        Ok(payload)
    }

    /// Stores `payload`; the caller must hold the WRITE lock on `resource`.
    pub async fn write(
        &self,
        resource: &str,
        client: ClientId,
        payload: &str,
    ) -> Result<(), LockError> {
        if !self.holds_write(resource, client) {
            return Err(LockError::NotOwner {
                resource: resource.to_string(),
                client,
            });
        }
        self.store.write_payload(resource, payload).await?;
        info!(client, resource, bytes = payload.len(), "payload written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio::{task::JoinHandle, time::timeout};

    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    fn spawn_acquire(
        manager: &Arc<LockManager>,
        resource: &'static str,
        mode: LockMode,
        client: ClientId,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(manager);
        tokio::spawn(async move { manager.acquire(resource, mode, client).await })
    }

    async fn wait_for_queue(manager: &LockManager, resource: &str, queued: usize) {
        timeout(WAIT, async {
            while manager.snapshot(resource).queued != queued {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("waiters should reach the queue");
    }

    async fn granted(handle: JoinHandle<()>) {
        timeout(WAIT, handle)
            .await
            .expect("acquire should complete")
            .expect("acquire task should not panic");
    }

    #[tokio::test]
    async fn readers_share_and_writer_excludes() {
        let manager = LockManager::in_memory();
        manager.acquire("f", LockMode::Read, 1).await;
        manager.acquire("f", LockMode::Read, 2).await;

        let snapshot = manager.snapshot("f");
        assert_eq!(snapshot.state, LockState::Read);
        assert_eq!(snapshot.active_readers, 2);
        assert_eq!(snapshot.owner, None);

        manager.release("f", 1);
        manager.release("f", 2);
        assert_eq!(manager.snapshot("f").state, LockState::Unlocked);

        manager.acquire("f", LockMode::Write, 3).await;
        let snapshot = manager.snapshot("f");
        assert_eq!(snapshot.state, LockState::Write);
        assert_eq!(snapshot.owner, Some(3));
        assert_eq!(snapshot.active_readers, 0);
    }

    #[tokio::test]
    async fn queued_writer_is_not_overtaken_by_later_reader() {
        let manager = Arc::new(LockManager::in_memory());
        manager.acquire("f", LockMode::Read, 1).await;

        let writer = spawn_acquire(&manager, "f", LockMode::Write, 2);
        wait_for_queue(&manager, "f", 1).await;
        let reader = spawn_acquire(&manager, "f", LockMode::Read, 3);
        wait_for_queue(&manager, "f", 2).await;

        assert_eq!(manager.snapshot("f").active_readers, 1);

        manager.release("f", 1);
        granted(writer).await;
        let snapshot = manager.snapshot("f");
        assert_eq!(snapshot.owner, Some(2));
        assert_eq!(snapshot.queued, 1);

        manager.release("f", 2);
        granted(reader).await;
        assert_eq!(manager.snapshot("f").state, LockState::Read);
    }

    #[tokio::test]
    async fn contiguous_readers_are_promoted_together() {
        let manager = Arc::new(LockManager::in_memory());
        manager.acquire("f", LockMode::Write, 1).await;

        let r2 = spawn_acquire(&manager, "f", LockMode::Read, 2);
        wait_for_queue(&manager, "f", 1).await;
        let r3 = spawn_acquire(&manager, "f", LockMode::Read, 3);
        wait_for_queue(&manager, "f", 2).await;
        let w4 = spawn_acquire(&manager, "f", LockMode::Write, 4);
        wait_for_queue(&manager, "f", 3).await;
        let r5 = spawn_acquire(&manager, "f", LockMode::Read, 5);
        wait_for_queue(&manager, "f", 4).await;

        manager.release("f", 1);
        granted(r2).await;
        granted(r3).await;
        let snapshot = manager.snapshot("f");
        assert_eq!(snapshot.state, LockState::Read);
        assert_eq!(snapshot.active_readers, 2);
        assert_eq!(snapshot.queued, 2);

        manager.release("f", 2);
        assert_eq!(manager.snapshot("f").active_readers, 1);
        assert!(!w4.is_finished());

        manager.release("f", 3);
        granted(w4).await;
        assert_eq!(manager.snapshot("f").owner, Some(4));

        manager.release("f", 4);
        granted(r5).await;
        assert_eq!(manager.snapshot("f").active_readers, 1);
    }

    #[tokio::test]
    async fn release_hands_over_without_unlocked_window() {
        let manager = Arc::new(LockManager::in_memory());
        manager.acquire("f", LockMode::Write, 1).await;

        let waiter = spawn_acquire(&manager, "f", LockMode::Write, 2);
        wait_for_queue(&manager, "f", 1).await;

        assert_eq!(manager.release("f", 1), Some(LockMode::Write));
        // Ownership has moved before the waiting task even runs again.
        let snapshot = manager.snapshot("f");
        assert_eq!(snapshot.state, LockState::Write);
        assert_eq!(snapshot.owner, Some(2));

        // A third party arriving now queues behind the new owner.
        let late = spawn_acquire(&manager, "f", LockMode::Read, 3);
        wait_for_queue(&manager, "f", 1).await;
        granted(waiter).await;
        assert!(!late.is_finished());

        manager.release("f", 2);
        granted(late).await;
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let manager = LockManager::in_memory();
        assert_eq!(manager.release("never", 1), None);
        assert_eq!(manager.snapshot("never"), LockSnapshot::unlocked());

        manager.acquire("f", LockMode::Write, 1).await;
        let before = manager.snapshot("f");
        assert_eq!(manager.release("f", 2), None);
        assert_eq!(manager.snapshot("f"), before);

        assert_eq!(manager.release("f", 1), Some(LockMode::Write));
        let after = manager.snapshot("f");
        assert_eq!(manager.release("f", 1), None);
        assert_eq!(manager.snapshot("f"), after);
        assert_eq!(after.state, LockState::Unlocked);
    }

    #[tokio::test]
    async fn repeated_read_holds_are_counted_per_client() {
        let manager = LockManager::in_memory();
        manager.acquire("f", LockMode::Read, 1).await;
        manager.acquire("f", LockMode::Read, 1).await;
        assert_eq!(manager.snapshot("f").active_readers, 2);

        manager.release("f", 1);
        assert_eq!(manager.snapshot("f").state, LockState::Read);
        manager.release("f", 1);
        assert_eq!(manager.snapshot("f").state, LockState::Unlocked);
    }

    #[tokio::test]
    async fn abandoned_waiter_is_skipped() {
        let manager = Arc::new(LockManager::in_memory());
        manager.acquire("f", LockMode::Write, 1).await;

        let abandoned = spawn_acquire(&manager, "f", LockMode::Write, 2);
        wait_for_queue(&manager, "f", 1).await;
        let reader = spawn_acquire(&manager, "f", LockMode::Read, 3);
        wait_for_queue(&manager, "f", 2).await;

        abandoned.abort();
        assert!(abandoned.await.is_err());

        manager.release("f", 1);
        granted(reader).await;
        let snapshot = manager.snapshot("f");
        assert_eq!(snapshot.state, LockState::Read);
        assert_eq!(snapshot.owner, None);
        assert_eq!(snapshot.queued, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn writers_and_readers_never_overlap() {
        let manager = Arc::new(LockManager::in_memory());
        let writers_inside = Arc::new(AtomicUsize::new(0));
        let readers_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for client in 0..16u64 {
            let manager = Arc::clone(&manager);
            let writers_inside = Arc::clone(&writers_inside);
            let readers_inside = Arc::clone(&readers_inside);
            let mode = if client % 3 == 0 {
                LockMode::Write
            } else {
                LockMode::Read
            };

            tasks.push(tokio::spawn(async move {
                for _ in 0..20 {
                    manager.acquire("shared", mode, client).await;
                    match mode {
                        LockMode::Write => {
                            assert_eq!(writers_inside.fetch_add(1, Ordering::SeqCst), 0);
                            assert_eq!(readers_inside.load(Ordering::SeqCst), 0);
                            tokio::task::yield_now().await;
                            writers_inside.fetch_sub(1, Ordering::SeqCst);
                        }
                        LockMode::Read => {
                            readers_inside.fetch_add(1, Ordering::SeqCst);
                            assert_eq!(writers_inside.load(Ordering::SeqCst), 0);
                            tokio::task::yield_now().await;
                            readers_inside.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                    assert_eq!(manager.release("shared", client), Some(mode));
                }
            }));
        }

        for task in tasks {
            timeout(Duration::from_secs(10), task)
                .await
                .expect("no deadlock")
                .expect("task should not panic");
        }
        assert_eq!(manager.snapshot("shared"), LockSnapshot::unlocked());
    }

    #[tokio::test]
    async fn write_requires_write_ownership() {
        let manager = LockManager::in_memory();

        let err = manager
            .write("doc", 1, "nope")
            .await
            .expect_err("write without lock");
        assert!(matches!(err, LockError::NotOwner { client: 1, .. }));

        manager.acquire("doc", LockMode::Read, 1).await;
        assert!(manager.write("doc", 1, "nope").await.is_err());
        manager.release("doc", 1);

        manager.acquire("doc", LockMode::Write, 1).await;
        manager
            .write("doc", 1, "hello world")
            .await
            .expect("owner may write");
        manager.release("doc", 1);

        assert_eq!(manager.read("doc").await.expect("read"), "hello world");
        assert_eq!(manager.read("empty").await.expect("read"), "");
    }

    #[tokio::test]
    async fn multi_line_payload_is_refused_on_read() {
        let store = Arc::new(MemoryStore::new());
        store
            .write_payload("notes", "line1\nline2")
            .await
            .expect("seed store");
        let manager = LockManager::new(store);

        let err = manager.read("notes").await.expect_err("unframeable");
        assert!(matches!(err, LockError::Unframeable { .. }));
        assert_eq!(err.reason(), "storage_failure");
    }
}
