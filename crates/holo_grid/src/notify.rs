//! Wait/notify registry keyed by `WaitKey`.
//!
//! Mutations that may unblock someone call `notify` with the key's wait key;
//! blocked callers use `wait_for`, which re-runs their attempt after every
//! wake and after a bounded recheck interval. A wake is only a hint: the
//! attempt itself decides whether the caller's condition holds, so spurious
//! wakes and notifications that raced ahead of registration are both fine.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, Instant};

use crate::types::WaitKey;

/// Upper bound between re-checks while waiting without a notification.
pub const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct WaitNotifyService {
    waiters: Mutex<HashMap<WaitKey, Arc<Notify>>>,
    recheck_interval: Duration,
}

impl Default for WaitNotifyService {
    fn default() -> Self {
        Self::new(DEFAULT_RECHECK_INTERVAL)
    }
}

impl WaitNotifyService {
    pub fn new(recheck_interval: Duration) -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            recheck_interval: recheck_interval.max(Duration::from_millis(1)),
        }
    }

    /// Register interest in `key` and return its notifier.
    pub fn register(&self, key: &WaitKey) -> Arc<Notify> {
        let mut waiters = self.waiters.lock().unwrap_or_else(|p| p.into_inner());
        waiters.entry(key.clone()).or_default().clone()
    }

    /// Drop a registration; the entry is pruned once nobody else holds it.
    pub fn release(&self, key: &WaitKey, notify: Arc<Notify>) {
        drop(notify);
        let mut waiters = self.waiters.lock().unwrap_or_else(|p| p.into_inner());
        if waiters.get(key).is_some_and(|n| Arc::strong_count(n) == 1) {
            waiters.remove(key);
        }
    }

    /// Wake every waiter currently registered on `key`. Returns false when
    /// there was nobody to wake.
    pub fn notify(&self, key: &WaitKey) -> bool {
        let notify = {
            let waiters = self.waiters.lock().unwrap_or_else(|p| p.into_inner());
            waiters.get(key).cloned()
        };
        match notify {
            Some(notify) => {
                notify.notify_waiters();
                true
            }
            None => false,
        }
    }

    pub fn waiting_keys(&self) -> usize {
        self.waiters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Run `attempt` until it yields a value or `timeout` elapses.
    ///
    /// Interest is registered before every attempt so a notification fired
    /// while the attempt is in flight is not lost. Returns `Ok(None)` on
    /// timeout; attempt errors are propagated immediately.
    pub async fn wait_for<T, F, Fut>(
        &self,
        key: &WaitKey,
        timeout: Duration,
        mut attempt: F,
    ) -> anyhow::Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let notify = self.register(key);
            let outcome = {
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match attempt().await {
                    Ok(Some(value)) => Some(Ok(Some(value))),
                    Err(err) => Some(Err(err)),
                    Ok(None) => {
                        let now = Instant::now();
                        if now >= deadline {
                            Some(Ok(None))
                        } else {
                            let wait = (deadline - now).min(self.recheck_interval);
                            tokio::select! {
                                _ = &mut notified => {}
                                _ = time::sleep(wait) => {}
                            }
                            None
                        }
                    }
                }
            };
            self.release(key, notify);
            if let Some(result) = outcome {
                return result;
            }
        }
    }
}
