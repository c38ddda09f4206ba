use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

use super::account::AccountId;

/// Registry of per-account exclusive locks.
///
/// Locks are created on first use and live as long as the registry. Transfers over
/// disjoint accounts never touch the same mutex.
#[derive(Debug, Default)]
pub(crate) struct AccountLocks {
    locks: DashMap<AccountId, Arc<Mutex<()>>>,
}

/// Held locks, released on drop.
pub(crate) struct AccountGuards {
    _guards: Vec<ArcMutexGuard<RawMutex, ()>>,
}

impl AccountLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, id: AccountId) -> Arc<Mutex<()>> {
        self.locks.entry(id).or_default().clone()
    }

    /// Locks every listed account in ascending id order, so two transfers over the
    /// same pair cannot deadlock. `timeout` bounds the whole acquisition. On timeout,
    /// returns the id that could not be locked and releases whatever was already held.
    pub(crate) fn acquire(
        &self,
        ids: &[AccountId],
        timeout: Duration,
    ) -> Result<AccountGuards, AccountId> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();

        let deadline = Instant::now() + timeout;
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.lock_for(id).try_lock_arc_for(remaining) {
                Some(guard) => guards.push(guard),
                None => return Err(id),
            }
        }

        Ok(AccountGuards { _guards: guards })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn held_account_times_out() {
        let locks = AccountLocks::new();
        let _held = locks.acquire(&[AccountId(1)], SHORT).unwrap();

        let err = locks
            .acquire(&[AccountId(2), AccountId(1)], SHORT)
            .err()
            .unwrap();
        assert_eq!(err, AccountId(1));

        // AccountId(2) was released when acquisition failed
        assert!(locks.acquire(&[AccountId(2)], SHORT).is_ok());
    }

    #[test]
    fn released_on_drop() {
        let locks = AccountLocks::new();
        drop(locks.acquire(&[AccountId(1), AccountId(2)], SHORT).unwrap());
        assert!(locks.acquire(&[AccountId(2), AccountId(1)], SHORT).is_ok());
    }

    #[test]
    fn duplicate_ids_lock_once() {
        let locks = AccountLocks::new();
        assert!(locks.acquire(&[AccountId(3), AccountId(3)], SHORT).is_ok());
    }

    #[test]
    fn timeout_covers_every_account() {
        let locks = Arc::new(AccountLocks::new());
        let timeout = Duration::from_millis(200);
        let (held_tx, held_rx) = mpsc::channel();

        // One thread releases account 1 late, account 2 stays held throughout.
        let holder = Arc::clone(&locks);
        let handle = thread::spawn(move || {
            let first = holder.acquire(&[AccountId(1)], SHORT).unwrap();
            let _second = holder.acquire(&[AccountId(2)], SHORT).unwrap();
            held_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(150));
            drop(first);
            thread::sleep(Duration::from_millis(400));
        });
        held_rx.recv().unwrap();

        let started = Instant::now();
        let err = locks
            .acquire(&[AccountId(1), AccountId(2)], timeout)
            .err()
            .unwrap();
        let waited = started.elapsed();

        assert_eq!(err, AccountId(2));
        assert!(waited < Duration::from_millis(300), "waited {waited:?}");
        handle.join().unwrap();
    }

    #[test]
    fn disjoint_accounts_do_not_contend() {
        let locks = Arc::new(AccountLocks::new());
        let _held = locks.acquire(&[AccountId(1), AccountId(2)], SHORT).unwrap();

        let (tx, rx) = mpsc::channel();
        let other = Arc::clone(&locks);
        thread::spawn(move || {
            let acquired = other.acquire(&[AccountId(3), AccountId(4)], SHORT).is_ok();
            tx.send(acquired).unwrap();
        });
        assert!(rx.recv().unwrap());
    }
}
