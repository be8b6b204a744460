use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::SyncError;

/// Longest single wait, so cancellation is noticed promptly.
const MAX_WAIT: Duration = Duration::from_millis(50);
/// A grant never exceeds this fraction of a worker's per-second share.
const GRANTS_PER_SECOND: u64 = 10;

/// Shared credit pool bounding the aggregate byte rate of every transfer.
///
/// Credit refills at `limit` bytes per second and starts empty, so over any
/// run the bytes granted never exceed `limit * elapsed + one second of
/// idle accumulation`. Each grant is capped to the caller's fair share of
/// the limit given the number of registered transfers; the share is
/// recomputed on every request, so it follows transfers joining and leaving.
#[derive(Debug)]
pub struct BandwidthGovernor {
    limit: Option<u64>,
    state: Mutex<Credit>,
    changed: Condvar,
}

#[derive(Debug)]
struct Credit {
    available: f64,
    refilled_at: Instant,
    active: usize,
}

impl BandwidthGovernor {
    pub fn new(limit: Option<u64>) -> Arc<Self> {
        Arc::new(Self {
            limit: limit.filter(|limit| *limit > 0),
            state: Mutex::new(Credit {
                available: 0.0,
                refilled_at: Instant::now(),
                active: 0,
            }),
            changed: Condvar::new(),
        })
    }

    pub fn unlimited() -> Arc<Self> {
        Self::new(None)
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn active_transfers(&self) -> usize {
        self.lock().active
    }

    /// Registers one transfer; the share of the others shrinks until the
    /// returned permit is dropped.
    pub fn register(self: &Arc<Self>) -> TransferPermit {
        self.lock().active += 1;
        self.changed.notify_all();
        TransferPermit {
            governor: Arc::clone(self),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Credit> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn acquire(&self, wanted: usize, cancel: &CancelToken) -> Result<usize, SyncError> {
        if wanted == 0 {
            return Ok(0);
        }
        let Some(limit) = self.limit else {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            return Ok(wanted);
        };

        let mut state = self.lock();
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let now = Instant::now();
            let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
            state.available = (state.available + elapsed * limit as f64).min(limit as f64);
            state.refilled_at = now;

            let share = limit / state.active.max(1) as u64;
            let cap = (share / GRANTS_PER_SECOND).max(1);
            let grant = (wanted as u64).min(cap);
            if state.available >= grant as f64 {
                state.available -= grant as f64;
                return Ok(grant as usize);
            }

            let deficit = grant as f64 - state.available;
            let wait = Duration::from_secs_f64(deficit / limit as f64).min(MAX_WAIT);
            state = match self.changed.wait_timeout(state, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

/// One registered transfer. Dropping it releases its share.
#[derive(Debug)]
pub struct TransferPermit {
    governor: Arc<BandwidthGovernor>,
}

impl TransferPermit {
    /// Blocks until some credit is available and returns how many bytes
    /// (at most `wanted`) may be read next.
    pub fn acquire(&self, wanted: usize, cancel: &CancelToken) -> Result<usize, SyncError> {
        self.governor.acquire(wanted, cancel)
    }
}

impl Drop for TransferPermit {
    fn drop(&mut self) {
        let mut state = self.governor.lock();
        state.active = state.active.saturating_sub(1);
        drop(state);
        self.governor.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn unlimited_grants_everything() {
        let governor = BandwidthGovernor::unlimited();
        let permit = governor.register();
        assert_eq!(permit.acquire(1 << 20, &CancelToken::new()).unwrap(), 1 << 20);
    }

    #[test]
    fn permits_track_active_transfers() {
        let governor = BandwidthGovernor::new(Some(1000));
        let a = governor.register();
        let b = governor.register();
        assert_eq!(governor.active_transfers(), 2);
        drop(a);
        assert_eq!(governor.active_transfers(), 1);
        drop(b);
        assert_eq!(governor.active_transfers(), 0);
    }

    #[test]
    fn grants_are_capped_by_fair_share() {
        let governor = BandwidthGovernor::new(Some(100_000));
        let cancel = CancelToken::new();
        let a = governor.register();
        let _b = governor.register();
        let grant = a.acquire(1 << 20, &cancel).unwrap();
        assert_eq!(grant, 100_000 / 2 / 10);
    }

    #[test]
    fn share_follows_transfers_joining_and_leaving() {
        let limit = 100_000u64;
        let governor = BandwidthGovernor::new(Some(limit));
        let cancel = CancelToken::new();
        let a = governor.register();
        assert_eq!(a.acquire(1 << 20, &cancel).unwrap(), 10_000);

        let b = governor.register();
        let c = governor.register();
        assert_eq!(a.acquire(1 << 20, &cancel).unwrap(), 100_000 / 3 / 10);

        drop(c);
        assert_eq!(a.acquire(1 << 20, &cancel).unwrap(), 5_000);

        drop(b);
        assert_eq!(governor.active_transfers(), 1);
        assert_eq!(a.acquire(1 << 20, &cancel).unwrap(), 10_000);
    }

    #[test]
    fn cancelled_acquire_returns_promptly() {
        let governor = BandwidthGovernor::new(Some(1));
        let cancel = CancelToken::new();
        let permit = governor.register();
        cancel.cancel();
        let started = Instant::now();
        let err = permit.acquire(1, &cancel).unwrap_err();
        assert_matches!(err, SyncError::Cancelled);
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn aggregate_rate_is_bounded_across_workers() {
        let limit = 200_000u64;
        let governor = BandwidthGovernor::new(Some(limit));
        let cancel = CancelToken::new();
        let started = Instant::now();
        let total: usize = thread::scope(|scope| {
            let handles = (0..4)
                .map(|_| {
                    let governor = Arc::clone(&governor);
                    let cancel = cancel.clone();
                    scope.spawn(move || {
                        let permit = governor.register();
                        let mut received = 0usize;
                        while received < 50_000 {
                            received += permit.acquire(8192, &cancel).unwrap();
                        }
                        received
                    })
                })
                .collect::<Vec<_>>();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        let elapsed = started.elapsed().as_secs_f64();
        let rate = total as f64 / elapsed;
        assert!(rate <= limit as f64 * 1.1, "rate {rate} exceeds limit {limit}");
    }
}
