//! Sync permits
//!
//! A node only runs as many outgoing syncs as it holds permits. Permits can
//! be revoked while the node is overloaded: syncs already holding one run
//! to completion, but no new permit is granted until enough are restored.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

/// Permit counters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PermitMetrics {
    /// Permits that can be acquired right now
    pub available: usize,
    pub revoked: usize,
    /// Permits held by running syncs
    pub utilized: usize,
}

#[derive(Debug)]
struct PermitState {
    capacity: usize,
    revoked: usize,
    utilized: usize,
}

impl PermitState {
    fn available(&self) -> usize {
        self.capacity
            .saturating_sub(self.revoked)
            .saturating_sub(self.utilized)
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<PermitState>,
    released: Notify,
}

/// Bounded pool of sync permits
#[derive(Clone, Debug)]
pub struct SyncPermitProvider {
    shared: Arc<Shared>,
}

/// A held permit, returned to the pool when dropped
#[derive(Debug)]
pub struct SyncPermit {
    shared: Arc<Shared>,
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        self.shared.state.lock().utilized -= 1;
        self.shared.released.notify_waiters();
    }
}

impl SyncPermitProvider {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PermitState {
                    capacity,
                    revoked: 0,
                    utilized: 0,
                }),
                released: Notify::new(),
            }),
        }
    }

    /// Take a permit if one is available
    pub fn try_acquire(&self) -> Option<SyncPermit> {
        let mut state = self.shared.state.lock();
        if state.available() == 0 {
            return None;
        }
        state.utilized += 1;
        Some(SyncPermit {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Wait until a permit is available and take it
    pub async fn acquire(&self) -> SyncPermit {
        loop {
            // Registered before the check so a release in between is not missed
            let released = self.shared.released.notified();
            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            released.await;
        }
    }

    /// Withdraw up to `count` permits from circulation
    pub fn revoke(&self, count: usize) {
        let mut state = self.shared.state.lock();
        state.revoked = (state.revoked + count).min(state.capacity);
    }

    /// Return up to `count` revoked permits to circulation
    pub fn restore(&self, count: usize) {
        {
            let mut state = self.shared.state.lock();
            state.revoked = state.revoked.saturating_sub(count);
        }
        self.shared.released.notify_waiters();
    }

    /// Revoke or restore so that exactly `revoked` permits are withdrawn
    pub fn set_revoked(&self, revoked: usize) {
        let current = self.metrics().revoked;
        if revoked > current {
            self.revoke(revoked - current);
        } else if revoked < current {
            self.restore(current - revoked);
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.state.lock().capacity
    }

    pub fn metrics(&self) -> PermitMetrics {
        let state = self.shared.state.lock();
        PermitMetrics {
            available: state.available(),
            revoked: state.revoked,
            utilized: state.utilized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_three_of_five_proceed() {
        let provider = SyncPermitProvider::new(3);
        let (tx, mut rx) = mpsc::unbounded_channel();
        for attempt in 0..5 {
            let provider = provider.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let permit = provider.acquire().await;
                tx.send((attempt, permit)).unwrap();
            });
        }

        let mut granted = Vec::new();
        for _ in 0..3 {
            granted.push(
                timeout(Duration::from_secs(5), rx.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
        assert_eq!(
            provider.metrics(),
            PermitMetrics {
                available: 0,
                revoked: 0,
                utilized: 3
            }
        );

        drop(granted.pop());
        let fourth = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        drop(fourth);
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_revoked_permits_block_new_syncs() {
        let provider = SyncPermitProvider::new(2);
        let running = provider.try_acquire().unwrap();

        provider.revoke(2);
        assert!(provider.try_acquire().is_none());
        assert_eq!(
            provider.metrics(),
            PermitMetrics {
                available: 0,
                revoked: 2,
                utilized: 1
            }
        );

        // The running sync completes normally
        drop(running);
        assert_eq!(provider.metrics().utilized, 0);
        assert!(provider.try_acquire().is_none());

        let waiter = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        provider.restore(1);
        let permit = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert_eq!(provider.metrics().available, 0);
        drop(permit);
        assert_eq!(provider.metrics().available, 1);
    }

    #[test]
    fn test_set_revoked() {
        let provider = SyncPermitProvider::new(4);
        provider.set_revoked(10);
        assert_eq!(provider.metrics().revoked, 4);
        provider.set_revoked(1);
        assert_eq!(provider.metrics().available, 3);
        assert_eq!(provider.capacity(), 4);
    }
}
