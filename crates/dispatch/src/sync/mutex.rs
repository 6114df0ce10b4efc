//! Queue-based asynchronous mutual exclusion
//!
//! Serializes asynchronous critical sections in strict arrival order. Unlike
//! a data-carrying mutex, [`AsyncMutex`] guards *work*: the caller hands over
//! a closure producing a future, and the lock is held until that future
//! completes, whatever its outcome.

use std::collections::VecDeque;
use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct LockState {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// FIFO lock for asynchronous critical sections
///
/// A call to [`lock`](Self::lock) either runs immediately (lock free, queue
/// empty) or waits behind every earlier caller. The lock is released once
/// the section's future resolves, panics, or is dropped, and ownership is
/// then handed directly to the next queued waiter.
///
/// A failed section only affects its own caller: the mutex stays usable and
/// queued sections keep running in order.
///
/// The lock is not reentrant. A section that calls `lock` on the same
/// instance before completing waits on itself forever.
///
/// # Example
///
/// ```
/// use switchyard_dispatch::sync::AsyncMutex;
///
/// # tokio_test::block_on(async {
/// let mutex = AsyncMutex::new();
/// let value = mutex.lock(|| async { 40 + 2 }).await;
/// assert_eq!(value, 42);
/// # });
/// ```
#[derive(Debug, Default)]
pub struct AsyncMutex {
    state: Mutex<LockState>,
}

impl AsyncMutex {
    /// Create an unlocked mutex with an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `section` once every earlier caller has finished
    pub async fn lock<F, Fut, T>(&self, section: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _held = self.acquire(false).await;
        section().await
    }

    /// Run `section` ahead of every caller still waiting in the queue
    ///
    /// The currently running section is never preempted.
    pub async fn lock_prioritized<F, Fut, T>(&self, section: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _held = self.acquire(true).await;
        section().await
    }

    /// Whether a section is currently running
    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Number of callers waiting behind the running section
    pub fn queue_len(&self) -> usize {
        self.state.lock().waiters.len()
    }

    async fn acquire(&self, prioritize: bool) -> Held<'_> {
        loop {
            let rx = {
                let mut state = self.state.lock();
                if !state.locked {
                    state.locked = true;
                    return Held { mutex: self };
                }

                let (tx, rx) = oneshot::channel();
                if prioritize {
                    state.waiters.push_front(tx);
                } else {
                    state.waiters.push_back(tx);
                }
                rx
            };

            let mut waiting = Waiting {
                mutex: self,
                rx,
                acquired: false,
            };

            if (&mut waiting.rx).await.is_ok() {
                waiting.acquired = true;
                return Held { mutex: self };
            }
            // The sender vanished without a handoff; queue up again.
        }
    }

    /// Hand the lock to the next live waiter, or unlock
    fn release(&self) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return;
            }
        }
        state.locked = false;
    }
}

/// Ownership of the lock; released on drop
struct Held<'a> {
    mutex: &'a AsyncMutex,
}

impl Drop for Held<'_> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

/// A queued acquisition that may be cancelled before it completes
struct Waiting<'a> {
    mutex: &'a AsyncMutex,
    rx: oneshot::Receiver<()>,
    acquired: bool,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if self.acquired {
            return;
        }
        // A handoff may have landed between the last poll and the drop.
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.mutex.release();
        }
    }
}
