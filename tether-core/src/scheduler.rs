//! Keyed timer scheduler.
//!
//! Every delayed or periodic job in the workspace goes through here. Timers are
//! identified by a [`TimerKey`]; scheduling a key that is already pending
//! aborts the pending timer first, so a component can never end up with two
//! heartbeats or two reconnects racing each other.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Identity of a timer: a kind (`"heartbeat"`, `"reconnect"`, ...) and the
/// owner it belongs to (a connection id, or empty for singletons).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    kind: &'static str,
    owner: String,
}

impl TimerKey {
    pub fn new(kind: &'static str, owner: impl Into<String>) -> Self {
        Self {
            kind,
            owner: owner.into(),
        }
    }

    /// A key for a timer that exists at most once per scheduler.
    pub fn singleton(kind: &'static str) -> Self {
        Self::new(kind, String::new())
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl fmt::Display for TimerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.owner.is_empty() {
            f.write_str(self.kind)
        } else {
            write!(f, "{}:{}", self.kind, self.owner)
        }
    }
}

#[derive(Default)]
struct SchedulerInner {
    timers: Mutex<HashMap<TimerKey, (u64, AbortHandle)>>,
    next_id: AtomicU64,
}

impl SchedulerInner {
    /// Forget a timer, but only if it is still the one registered under `key`.
    fn release(&self, key: &TimerKey, id: u64) {
        if let Ok(mut timers) = self.timers.lock() {
            if timers.get(key).map(|(current, _)| *current) == Some(id) {
                timers.remove(key);
            }
        }
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        if let Ok(timers) = self.timers.get_mut() {
            for (_, (_, handle)) in timers.drain() {
                handle.abort();
            }
        }
    }
}

/// Cloneable handle to a set of keyed timers. Dropping the last clone aborts
/// everything still pending.
#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once after `delay`, replacing any pending timer with the same key.
    ///
    /// The timer is deregistered before `task` starts, so the task may
    /// reschedule its own key without cancelling itself.
    pub fn schedule_once<F>(&self, key: TimerKey, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(runtime) = current_runtime(&key) else {
            return;
        };
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        let task_key = key.clone();

        let Ok(mut timers) = self.inner.timers.lock() else {
            return;
        };
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.release(&task_key, id);
            }
            task.await;
        });
        if let Some((_, previous)) = timers.insert(key.clone(), (id, handle.abort_handle())) {
            previous.abort();
            tracing::trace!(timer = %key, "Replaced pending timer");
        }
    }

    /// Run `tick` every `interval` (first run after one interval) until cancelled.
    pub fn schedule_repeating<F, Fut>(&self, key: TimerKey, interval: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(runtime) = current_runtime(&key) else {
            return;
        };
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let period = interval.max(Duration::from_millis(1));

        let Ok(mut timers) = self.inner.timers.lock() else {
            return;
        };
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tick().await;
            }
        });
        if let Some((_, previous)) = timers.insert(key.clone(), (id, handle.abort_handle())) {
            previous.abort();
            tracing::trace!(timer = %key, "Replaced repeating timer");
        }
    }

    /// Cancel a pending timer. Returns whether one was pending.
    pub fn cancel(&self, key: &TimerKey) -> bool {
        let removed = self
            .inner
            .timers
            .lock()
            .ok()
            .and_then(|mut timers| timers.remove(key));
        match removed {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer owned by `owner`.
    pub fn cancel_owner(&self, owner: &str) -> usize {
        let Ok(mut timers) = self.inner.timers.lock() else {
            return 0;
        };
        let keys: Vec<TimerKey> = timers
            .keys()
            .filter(|key| key.owner == owner)
            .cloned()
            .collect();
        for key in &keys {
            if let Some((_, handle)) = timers.remove(key) {
                handle.abort();
            }
        }
        keys.len()
    }

    pub fn cancel_all(&self) {
        if let Ok(mut timers) = self.inner.timers.lock() {
            for (_, (_, handle)) in timers.drain() {
                handle.abort();
            }
        }
    }

    pub fn is_scheduled(&self, key: &TimerKey) -> bool {
        self.inner
            .timers
            .lock()
            .map(|timers| timers.contains_key(key))
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .timers
            .lock()
            .map(|timers| timers.len())
            .unwrap_or(0)
    }
}

fn current_runtime(key: &TimerKey) -> Option<Handle> {
    match Handle::try_current() {
        Ok(handle) => Some(handle),
        Err(_) => {
            tracing::warn!(timer = %key, "No async runtime available, timer not scheduled");
            None
        }
    }
}
