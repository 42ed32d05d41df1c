//! Deduplicating, rate-limited work queue.
//!
//! Semantics follow the classic controller queue:
//! - an item is queued at most once; adding an item that is queued is a no-op;
//! - adding an item that is being processed marks it dirty, and [WorkQueue::done]
//!   re-queues it, so one key is never processed by two workers at once;
//! - after shutdown, `add` is ignored and [WorkQueue::get] hands out what is left,
//!   then returns `None`.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use kube::ResourceExt;
use tokio::sync::Notify;
use tracing::debug;

use evreq_api::EvictionRequest;

use crate::rate_limiter::RateLimiter;

/// Namespaced name of an eviction request, rendered `namespace/name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced object; `None` when name or namespace is missing.
    pub fn for_request(request: &EvictionRequest) -> Option<Self> {
        let namespace = request.namespace().filter(|ns| !ns.is_empty())?;
        let name = request.metadata.name.clone().filter(|n| !n.is_empty())?;
        Some(Self { namespace, name })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    ready: Notify,
    idle: Notify,
    limiter: Box<dyn RateLimiter<K>>,
}

impl<K> Inner<K> {
    fn lock(&self) -> MutexGuard<'_, State<K>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                ready: Notify::new(),
                idle: Notify::new(),
                limiter: Box::new(limiter),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn add(&self, item: K) {
        let mut state = self.inner.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.ready.notify_one();
    }

    /// Add `item` once `delay` has elapsed. Must be called within a Tokio runtime.
    pub fn add_after(&self, item: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    pub fn add_rate_limited(&self, item: K) {
        let delay = self.inner.limiter.when(&item);
        debug!(queue = %self.inner.name, key = %item, delay_ms = delay.as_millis() as u64, "requeueing with backoff");
        self.add_after(item, delay);
    }

    /// Stop tracking retries for `item`; its next failure starts from the base delay.
    pub fn forget(&self, item: &K) {
        self.inner.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &K) -> u32 {
        self.inner.limiter.num_requeues(item)
    }

    /// Wait for the next item. Returns `None` once shut down and empty.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.ready.notified();
            {
                let mut state = self.inner.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `item` as processed. Re-queues it when it was added meanwhile.
    pub fn done(&self, item: &K) {
        let mut state = self.inner.lock();
        state.processing.remove(item);
        let requeue = state.dirty.contains(item);
        if requeue {
            state.queue.push_back(item.clone());
        }
        let idle = state.processing.is_empty();
        drop(state);
        if requeue {
            self.inner.ready.notify_one();
        }
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    pub fn shut_down(&self) {
        self.inner.lock().shutting_down = true;
        self.inner.ready.notify_waiters();
    }

    /// Shut down and wait until no item is being processed.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.lock().processing.is_empty() {
                return;
            }
            idle.await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    /// Items waiting to be handed out.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
