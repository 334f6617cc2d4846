//! Token-fenced distributed lock over the kv table.
//!
//! Each acquisition stores a random uuid token; release and lease renewal are
//! compare-and-* operations on that token, so a holder whose lease expired can
//! never release or extend somebody else's acquisition. A background renewal
//! task extends the lease at a third of the TTL and terminates itself the
//! moment ownership is lost.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::LockRetry;
use crate::error::StrataError;
use crate::store::TierStore;

pub fn memory_process_key(user_id: i64) -> String {
    format!("lock:memory_process:{user_id}")
}

pub struct DistLock {
    store: Arc<TierStore>,
}

/// Proof of a live acquisition. Dropping the guard without calling
/// [`DistLock::unlock`] stops renewal and lets the lease lapse via TTL.
pub struct LockGuard {
    key: String,
    token: String,
    stop: watch::Sender<bool>,
    renew: JoinHandle<()>,
}

impl DistLock {
    pub fn new(store: Arc<TierStore>) -> Self {
        Self { store }
    }

    /// Single acquisition attempt. `None` means someone else holds the key.
    pub async fn lock(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>, StrataError> {
        let token = uuid::Uuid::new_v4().to_string();
        let acquired = {
            let store = self.store.clone();
            let key = key.to_string();
            let token = token.clone();
            tokio::task::spawn_blocking(move || {
                store.kv_set_nx(&key, &token, ttl.as_millis() as i64)
            })
            .await
            .map_err(|e| StrataError::Internal(format!("lock task: {e}")))??
        };
        if !acquired {
            return Ok(None);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let renew = tokio::spawn(renew_loop(
            self.store.clone(),
            key.to_string(),
            token.clone(),
            ttl,
            stop_rx,
        ));
        Ok(Some(LockGuard { key: key.to_string(), token, stop: stop_tx, renew }))
    }

    /// Acquire with bounded exponential backoff. `None` after the final
    /// attempt means the caller should skip its work, not queue up behind it.
    pub async fn acquire_with_retry(
        &self,
        key: &str,
        ttl: Duration,
        retry: &LockRetry,
    ) -> Result<Option<LockGuard>, StrataError> {
        let mut backoff = retry.initial_backoff;
        for attempt in 1..=retry.max_attempts {
            if let Some(guard) = self.lock(key, ttl).await? {
                return Ok(Some(guard));
            }
            if attempt == retry.max_attempts {
                break;
            }
            backoff = (backoff * 2).min(retry.max_backoff);
            let jitter_ms = retry.jitter.as_millis() as u64;
            let jitter = if jitter_ms > 0 {
                Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
            } else {
                Duration::ZERO
            };
            debug!(key, attempt, backoff_ms = backoff.as_millis() as u64, "lock busy, retrying");
            tokio::time::sleep(backoff + jitter).await;
        }
        Ok(None)
    }

    /// Release: stop the renewal task, then compare-and-delete on the token.
    pub async fn unlock(&self, guard: LockGuard) -> Result<(), StrataError> {
        let _ = guard.stop.send(true);
        let _ = guard.renew.await;

        let store = self.store.clone();
        let key = guard.key.clone();
        let token = guard.token.clone();
        let released = tokio::task::spawn_blocking(move || store.kv_compare_delete(&key, &token))
            .await
            .map_err(|e| StrataError::Internal(format!("unlock task: {e}")))??;
        if !released {
            warn!(key = %guard.key, "lock already expired or taken over at release");
        }
        Ok(())
    }
}

async fn renew_loop(
    store: Arc<TierStore>,
    key: String,
    token: String,
    ttl: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(ttl / 3);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await; // first tick fires immediately
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = tick.tick() => {
                let store = store.clone();
                let k = key.clone();
                let t = token.clone();
                let extended = tokio::task::spawn_blocking(move || {
                    store.kv_compare_extend(&k, &t, ttl.as_millis() as i64)
                })
                .await;
                match extended {
                    Ok(Ok(true)) => {}
                    Ok(Ok(false)) => {
                        warn!(key, "lease lost, stopping renewal");
                        return;
                    }
                    Ok(Err(e)) => {
                        warn!(key, error = %e, "lease renewal failed");
                    }
                    Err(e) => {
                        warn!(key, error = %e, "lease renewal task failed");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_pair() -> (Arc<TierStore>, DistLock) {
        let store = Arc::new(TierStore::open(":memory:").expect("store"));
        let lock = DistLock::new(store.clone());
        (store, lock)
    }

    #[tokio::test]
    async fn mutual_exclusion() {
        let (_store, lock) = lock_pair();
        let key = memory_process_key(1);
        let guard = lock.lock(&key, Duration::from_secs(60)).await.unwrap().unwrap();
        assert!(lock.lock(&key, Duration::from_secs(60)).await.unwrap().is_none());
        lock.unlock(guard).await.unwrap();
        // free again after release
        let again = lock.lock(&key, Duration::from_secs(60)).await.unwrap();
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn retry_gives_up_when_held() {
        let (_store, lock) = lock_pair();
        let key = memory_process_key(2);
        let _held = lock.lock(&key, Duration::from_secs(60)).await.unwrap().unwrap();
        let retry = LockRetry {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            jitter: Duration::from_millis(1),
        };
        let got = lock
            .acquire_with_retry(&key, Duration::from_secs(60), &retry)
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn stale_guard_cannot_release_new_owner() {
        let (store, lock) = lock_pair();
        let key = memory_process_key(3);
        let stale = lock.lock(&key, Duration::from_secs(60)).await.unwrap().unwrap();

        // simulate lease expiry and takeover by another holder
        store.kv_delete(&key).unwrap();
        let fresh = lock.lock(&key, Duration::from_secs(60)).await.unwrap().unwrap();

        lock.unlock(stale).await.unwrap();
        // the new owner's token is untouched
        assert!(store.kv_get(&key).unwrap().is_some());
        lock.unlock(fresh).await.unwrap();
        assert!(store.kv_get(&key).unwrap().is_none());
    }

    #[tokio::test]
    async fn renewal_extends_short_lease() {
        let (store, lock) = lock_pair();
        let key = memory_process_key(4);
        let ttl = Duration::from_millis(240);
        let guard = lock.lock(&key, ttl).await.unwrap().unwrap();

        // well past the original TTL; renewal every 80ms keeps the lease live
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(store.kv_get(&key).unwrap().is_some());
        lock.unlock(guard).await.unwrap();
        assert!(store.kv_get(&key).unwrap().is_none());
    }
}
