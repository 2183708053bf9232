use ahash::{AHashMap as HashMap, RandomState};
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::time::{Duration, Instant};

use crate::Key;
use crate::distributed::GlobalTransactionId;
use crate::errors::{MnemosyneError, Result};

/// Identity holding a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockOwner {
    Transaction(GlobalTransactionId),
    /// A non-transactional invocation, such as a cache-wide clear.
    Invocation(u64),
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockOwner::Transaction(gtx) => write!(f, "{}", gtx),
            LockOwner::Invocation(id) => write!(f, "invocation-{}", id),
        }
    }
}

#[derive(Debug)]
struct LockRecord {
    owner: LockOwner,
    acquired_at: Instant,
}

impl LockRecord {
    fn new(owner: LockOwner) -> Self {
        Self {
            owner,
            acquired_at: Instant::now(),
        }
    }
}

/// One slice of the lock table. Waiters on any key of the stripe park on
/// `released` and re-check their key when woken.
#[derive(Default)]
struct Stripe {
    records: Mutex<HashMap<Key, LockRecord>>,
    released: Condvar,
}

/// Per-key exclusive locks with bounded, event-driven waiting.
///
/// Keys hash onto a fixed number of stripes. Blocked acquirers sleep on their
/// stripe's condition variable and are woken by a release, or by the clock
/// when their deadline (or the holder's lease) passes. Locks are reentrant per
/// [`LockOwner`]. The manager never retries on the caller's behalf: a timeout
/// is reported as [`MnemosyneError::LockTimeout`].
pub struct LockManager {
    stripes: Vec<Stripe>,
    hasher: RandomState,
    lease: Option<Duration>,
}

impl LockManager {
    /// Creates a lock manager with `concurrency_level` stripes.
    ///
    /// # Arguments
    ///
    /// * `concurrency_level` - Number of stripes; clamped to at least one.
    /// * `lease` - When set, a lock held for longer than this is reclaimed by
    ///   the next contender instead of making it wait.
    pub fn new(concurrency_level: usize, lease: Option<Duration>) -> Self {
        let stripes = (0..concurrency_level.max(1))
            .map(|_| Stripe::default())
            .collect();
        Self {
            stripes,
            hasher: RandomState::new(),
            lease,
        }
    }

    fn stripe_for(&self, key: &Key) -> &Stripe {
        let index = (self.hasher.hash_one(key) % self.stripes.len() as u64) as usize;
        &self.stripes[index]
    }

    /// Acquires the lock on `key` for `owner`, waiting at most `timeout`.
    ///
    /// Acquiring a lock the owner already holds returns immediately.
    ///
    /// # Errors
    ///
    /// Returns `MnemosyneError::LockTimeout` if another owner still holds the
    /// key when the timeout expires.
    pub fn acquire(&self, key: &Key, owner: LockOwner, timeout: Duration) -> Result<()> {
        let stripe = self.stripe_for(key);
        let deadline = Instant::now() + timeout;
        let mut records = stripe.records.lock();
        loop {
            let holder = records.get(key).map(|r| (r.owner, r.acquired_at));
            let wake_at = match holder {
                None => {
                    records.insert(key.clone(), LockRecord::new(owner));
                    trace!("Lock on {:?} acquired by {}", key, owner);
                    return Ok(());
                }
                Some((holder, _)) if holder == owner => return Ok(()),
                Some((holder, acquired_at)) => match self.lease {
                    Some(lease) if acquired_at.elapsed() >= lease => {
                        warn!(
                            "Reclaiming lock on {:?} from {} after lease of {:?}",
                            key, holder, lease
                        );
                        records.insert(key.clone(), LockRecord::new(owner));
                        return Ok(());
                    }
                    Some(lease) => deadline.min(acquired_at + lease),
                    None => deadline,
                },
            };

            if Instant::now() >= deadline {
                debug!(
                    "Lock acquisition on {:?} by {} timed out after {:?}",
                    key, owner, timeout
                );
                return Err(MnemosyneError::LockTimeout {
                    key: key.clone(),
                    owner: owner.to_string(),
                });
            }
            stripe.released.wait_until(&mut records, wake_at);
        }
    }

    /// Acquires `key` only if it is free (or already ours) right now.
    pub fn try_acquire(&self, key: &Key, owner: LockOwner) -> bool {
        self.acquire(key, owner, Duration::ZERO).is_ok()
    }

    /// Acquires every key in canonical (sorted) order.
    ///
    /// On failure the locks taken by this call are released again; locks the
    /// owner held before the call are kept.
    ///
    /// # Returns
    ///
    /// The keys that were newly locked by this call.
    pub fn acquire_all(&self, keys: &[Key], owner: LockOwner, timeout: Duration) -> Result<Vec<Key>> {
        let mut ordered: Vec<&Key> = keys.iter().collect();
        ordered.sort();
        ordered.dedup();

        let deadline = Instant::now() + timeout;
        let mut acquired = Vec::new();
        for key in ordered {
            if self.is_held_by(key, owner) {
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(err) = self.acquire(key, owner, remaining) {
                self.release_all(&acquired, owner);
                return Err(err);
            }
            acquired.push(key.clone());
        }
        Ok(acquired)
    }

    /// Releases `key` if `owner` holds it. Releasing twice is a no-op.
    pub fn release(&self, key: &Key, owner: LockOwner) {
        let stripe = self.stripe_for(key);
        let mut records = stripe.records.lock();
        if records.get(key).is_some_and(|record| record.owner == owner) {
            records.remove(key);
            trace!("Lock on {:?} released by {}", key, owner);
            stripe.released.notify_all();
        }
    }

    pub fn release_all(&self, keys: &[Key], owner: LockOwner) {
        for key in keys {
            self.release(key, owner);
        }
    }

    /// Releases every lock `owner` holds, returning how many were released.
    pub fn release_owned_by(&self, owner: LockOwner) -> usize {
        let mut released = 0;
        for stripe in &self.stripes {
            let mut records = stripe.records.lock();
            let before = records.len();
            records.retain(|_, record| record.owner != owner);
            let removed = before - records.len();
            if removed > 0 {
                released += removed;
                stripe.released.notify_all();
            }
        }
        released
    }

    pub fn is_held_by_anyone(&self, key: &Key) -> bool {
        self.stripe_for(key).records.lock().contains_key(key)
    }

    pub fn is_held_by(&self, key: &Key, owner: LockOwner) -> bool {
        self.owner_of(key) == Some(owner)
    }

    pub fn owner_of(&self, key: &Key) -> Option<LockOwner> {
        self.stripe_for(key)
            .records
            .lock()
            .get(key)
            .map(|record| record.owner)
    }

    /// Total number of locks currently held.
    pub fn held_count(&self) -> usize {
        self.stripes.iter().map(|s| s.records.lock().len()).sum()
    }
}
