//! Per-node read/write lock
//!
//! A FIFO queue of lock requests. Shared requests arriving while a shared
//! group sits at the tail join that group; an exclusive request always starts
//! a new entry. Only the head entry is runnable, and the next entry becomes
//! runnable only once the head is fully released. Readers can therefore not
//! starve a writer, and no group is ever skipped.
//!
//! Waiters park on a broadcast notification and re-check their own request
//! after every wake-up.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Lock mode requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn from_exclusive(exclusive: bool) -> Self {
        if exclusive {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        }
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Shared => write!(f, "shared"),
            LockMode::Exclusive => write!(f, "exclusive"),
        }
    }
}

#[derive(Debug)]
struct Request {
    id: u64,
    exclusive: bool,
    /// Holders (or would-be holders) of a shared group
    readers: u32,
    runnable: bool,
}

#[derive(Debug, Default)]
struct Queue {
    requests: VecDeque<Request>,
    next_id: u64,
}

impl Queue {
    fn push(&mut self, exclusive: bool, runnable: bool) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.requests.push_back(Request {
            id,
            exclusive,
            readers: 1,
            runnable,
        });
        id
    }

    fn is_runnable(&self, id: u64) -> bool {
        self.requests
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.runnable)
            .unwrap_or(false)
    }

    /// Pop the head and hand the lock to the next entry. Returns true if
    /// waiters need waking.
    fn advance(&mut self) -> bool {
        self.requests.pop_front();
        match self.requests.front_mut() {
            Some(next) => {
                next.runnable = true;
                true
            }
            None => false,
        }
    }
}

/// Snapshot of a lock's queue, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockState {
    /// Entries waiting or running
    pub queued: usize,
    /// Mode of the running entry, if any
    pub head: Option<LockMode>,
    /// Readers in the running entry (0 when it is exclusive or absent)
    pub head_readers: u32,
}

/// FIFO read/write lock with reader coalescing.
#[derive(Debug, Default)]
pub struct LockManager {
    queue: Mutex<Queue>,
    wakeup: Notify,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire in the given mode.
    pub async fn acquire(&self, mode: LockMode) {
        match mode {
            LockMode::Shared => self.acquire_shared().await,
            LockMode::Exclusive => self.acquire_exclusive().await,
        }
    }

    /// Release in the given mode.
    pub fn release(&self, mode: LockMode) -> Result<()> {
        match mode {
            LockMode::Shared => self.release_shared(),
            LockMode::Exclusive => self.release_exclusive(),
        }
    }

    pub async fn acquire_shared(&self) {
        let id = {
            let mut queue = self.queue.lock();
            let joinable = queue.requests.back_mut().filter(|tail| !tail.exclusive);
            match joinable {
                Some(tail) => {
                    tail.readers += 1;
                    tail.id
                }
                None => {
                    let runnable = queue.requests.is_empty();
                    queue.push(false, runnable)
                }
            }
        };
        self.wait_for(id).await;
    }

    pub async fn acquire_exclusive(&self) {
        let id = {
            let mut queue = self.queue.lock();
            let runnable = queue.requests.is_empty();
            queue.push(true, runnable)
        };
        self.wait_for(id).await;
    }

    pub fn release_shared(&self) -> Result<()> {
        let wake = {
            let mut queue = self.queue.lock();
            let head = queue
                .requests
                .front_mut()
                .ok_or_else(|| Error::IllegalState("shared release of an idle lock".to_string()))?;
            if head.exclusive {
                return Err(Error::IllegalState(
                    "shared release while an exclusive holder runs".to_string(),
                ));
            }
            head.readers -= 1;
            head.readers == 0 && queue.advance()
        };
        if wake {
            self.wakeup.notify_waiters();
        }
        Ok(())
    }

    pub fn release_exclusive(&self) -> Result<()> {
        let wake = {
            let mut queue = self.queue.lock();
            match queue.requests.front().map(|head| head.exclusive) {
                None => {
                    return Err(Error::IllegalState(
                        "exclusive release of an idle lock".to_string(),
                    ))
                }
                Some(false) => {
                    return Err(Error::IllegalState(
                        "exclusive release while shared holders run".to_string(),
                    ))
                }
                Some(true) => queue.advance(),
            }
        };
        if wake {
            self.wakeup.notify_waiters();
        }
        Ok(())
    }

    pub fn state(&self) -> LockState {
        let queue = self.queue.lock();
        let head = queue.requests.front();
        LockState {
            queued: queue.requests.len(),
            head: head.map(|r| LockMode::from_exclusive(r.exclusive)),
            head_readers: head.filter(|r| !r.exclusive).map(|r| r.readers).unwrap_or(0),
        }
    }

    async fn wait_for(&self, id: u64) {
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and
            // the await is not lost.
            notified.as_mut().enable();
            if self.queue.lock().is_runnable(id) {
                return;
            }
            notified.await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    const SETTLE: Duration = Duration::from_millis(50);

    fn spawn_acquire(lock: &Arc<LockManager>, mode: LockMode) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let lock = lock.clone();
        tokio::spawn(async move {
            lock.acquire(mode).await;
            let _ = tx.send(());
        });
        rx
    }

    async fn wait_queued(lock: &LockManager, queued: usize) {
        while lock.state().queued < queued {
            tokio::task::yield_now().await;
        }
    }

    async fn granted(rx: &mut oneshot::Receiver<()>) -> bool {
        timeout(SETTLE, rx).await.is_ok()
    }

    #[tokio::test]
    async fn test_uncontended() {
        let lock = LockManager::new();
        lock.acquire_exclusive().await;
        assert_eq!(lock.state().head, Some(LockMode::Exclusive));
        lock.release_exclusive().unwrap();
        assert_eq!(lock.state().queued, 0);

        lock.acquire_shared().await;
        lock.acquire_shared().await;
        assert_eq!(lock.state().head_readers, 2);
        lock.release_shared().unwrap();
        lock.release_shared().unwrap();
        assert_eq!(lock.state().queued, 0);
    }

    #[tokio::test]
    async fn test_release_idle_is_error() {
        let lock = LockManager::new();
        assert_matches!(lock.release_shared(), Err(Error::IllegalState(_)));
        assert_matches!(lock.release_exclusive(), Err(Error::IllegalState(_)));

        lock.acquire_shared().await;
        assert_matches!(lock.release_exclusive(), Err(Error::IllegalState(_)));
        lock.release_shared().unwrap();
    }

    #[tokio::test]
    async fn test_readers_coalesce_writer_waits_reader_after_writer_waits() {
        let lock = Arc::new(LockManager::new());

        // A and B share the running group.
        lock.acquire_shared().await;
        lock.acquire_shared().await;
        assert_eq!(lock.state().head_readers, 2);

        let mut c = spawn_acquire(&lock, LockMode::Exclusive);
        wait_queued(&lock, 2).await;
        let mut d = spawn_acquire(&lock, LockMode::Shared);
        wait_queued(&lock, 3).await;

        assert!(!granted(&mut c).await);
        assert!(!granted(&mut d).await);

        // C waits for both readers.
        lock.release_shared().unwrap();
        assert!(!granted(&mut c).await);
        lock.release_shared().unwrap();
        assert!(granted(&mut c).await);
        assert!(!granted(&mut d).await);

        // D waits for C.
        lock.release_exclusive().unwrap();
        assert!(granted(&mut d).await);
        lock.release_shared().unwrap();
        assert_eq!(lock.state().queued, 0);
    }

    #[tokio::test]
    async fn test_readers_join_waiting_group() {
        let lock = Arc::new(LockManager::new());
        lock.acquire_exclusive().await;

        let mut r1 = spawn_acquire(&lock, LockMode::Shared);
        wait_queued(&lock, 2).await;
        let mut r2 = spawn_acquire(&lock, LockMode::Shared);
        tokio::time::sleep(SETTLE).await;

        // The second reader joined the waiting group instead of queueing.
        assert_eq!(lock.state().queued, 2);

        lock.release_exclusive().unwrap();
        assert!(granted(&mut r1).await);
        assert!(granted(&mut r2).await);
        assert_eq!(lock.state().head_readers, 2);
    }

    #[test]
    fn test_waiter_is_woken_by_release() {
        let lock = LockManager::new();
        tokio_test::block_on(lock.acquire_exclusive());

        let mut waiter = tokio_test::task::spawn(lock.acquire_shared());
        tokio_test::assert_pending!(waiter.poll());

        lock.release_exclusive().unwrap();
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
        assert_eq!(lock.state().head, Some(LockMode::Shared));
    }

    #[tokio::test]
    async fn test_writers_are_never_coalesced() {
        let lock = Arc::new(LockManager::new());
        lock.acquire_exclusive().await;

        let mut w1 = spawn_acquire(&lock, LockMode::Exclusive);
        wait_queued(&lock, 2).await;
        let mut w2 = spawn_acquire(&lock, LockMode::Exclusive);
        wait_queued(&lock, 3).await;

        lock.release_exclusive().unwrap();
        assert!(granted(&mut w1).await);
        assert!(!granted(&mut w2).await);

        lock.release_exclusive().unwrap();
        assert!(granted(&mut w2).await);
        lock.release_exclusive().unwrap();
    }
}
