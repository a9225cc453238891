//! A strictly FIFO async mutex with cancellable acquisition.
//!
//! Ownership is handed from the releasing holder straight to the oldest
//! waiter; the lock never passes through an unheld state while anyone is
//! queued, so late arrivals cannot barge ahead. The lock is not re-entrant.

use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Mutex as StdMutex, MutexGuard as StdMutexGuard};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;

struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockState {
    held: bool,
    next_waiter_id: u64,
    waiters: VecDeque<Waiter>,
}

impl LockState {
    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|waiter| waiter.id == id) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }

    fn hand_off(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.grant.send(()).is_ok() {
                trace!(waiter = waiter.id, "Mutex ownership transferred");
                return;
            }
        }
        self.held = false;
    }
}

#[derive(Default)]
pub struct Mutex {
    state: StdMutex<LockState>,
}

/// Releases the owning [`Mutex`] when dropped.
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        let _ = self.mutex.release();
    }
}

enum Wake {
    Granted,
    Cancelled,
}

struct PendingAcquire<'a> {
    mutex: &'a Mutex,
    id: u64,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl PendingAcquire<'_> {
    fn cancel(&mut self) -> Result<()> {
        let mut state = self.mutex.lock_state();
        self.settled = true;
        if state.remove_waiter(self.id) {
            Err(Error::Aborted)
        } else {
            // Already granted under the state lock; cancellation is too late.
            Ok(())
        }
    }
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.mutex.lock_state();
        if !state.remove_waiter(self.id) {
            // Granted but never observed: pass ownership along.
            state.hand_off();
        }
    }
}

impl Mutex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> StdMutexGuard<'_, LockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_locked(&self) -> bool {
        self.lock_state().held
    }

    /// Number of callers currently queued behind the holder.
    pub fn waiting(&self) -> usize {
        self.lock_state().waiters.len()
    }

    /// Suspends until the caller owns the lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Aborted`] if `cancel` fires while the caller is still
    /// queued. Cancellation after ownership was granted has no effect.
    pub async fn acquire(&self, cancel: Option<&CancellationToken>) -> Result<()> {
        let (id, rx) = {
            let mut state = self.lock_state();
            if !state.held {
                state.held = true;
                return Ok(());
            }
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(Error::Aborted);
            }
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (grant, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, grant });
            (id, rx)
        };

        let mut pending = PendingAcquire {
            mutex: self,
            id,
            rx,
            settled: false,
        };

        let wake = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = &mut pending.rx => Wake::Granted,
                _ = token.cancelled() => Wake::Cancelled,
            },
            None => {
                let _ = (&mut pending.rx).await;
                Wake::Granted
            }
        };

        match wake {
            Wake::Granted => {
                pending.settled = true;
                Ok(())
            }
            Wake::Cancelled => pending.cancel(),
        }
    }

    /// Acquires the lock and returns a guard that releases it on drop.
    ///
    /// # Errors
    ///
    /// Same as [`Mutex::acquire`].
    pub async fn lock(&self, cancel: Option<&CancellationToken>) -> Result<MutexGuard<'_>> {
        self.acquire(cancel).await?;
        Ok(MutexGuard { mutex: self })
    }

    /// Transfers ownership to the oldest waiter, or unlocks if none remain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the lock is not held.
    pub fn release(&self) -> Result<()> {
        let mut state = self.lock_state();
        if !state.held {
            return Err(Error::illegal_state("release of an unheld mutex"));
        }
        state.hand_off();
        Ok(())
    }
}
