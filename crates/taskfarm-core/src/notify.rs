//! Change propagation: per-entity subscriptions and batched job-change
//! notifications.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::JobId;

/// Subscriptions keyed by the entity being watched.
#[derive(Debug, Clone)]
pub struct EventBus<K, S> {
    subscriptions: BTreeMap<K, Vec<S>>,
}

impl<K, S> Default for EventBus<K, S> {
    fn default() -> Self {
        Self {
            subscriptions: BTreeMap::new(),
        }
    }
}

impl<K, S> EventBus<K, S>
where
    K: Ord + Clone,
    S: PartialEq + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `key`. Subscribing twice is a no-op.
    pub fn subscribe(&mut self, key: K, subscriber: S) {
        let subscribers = self.subscriptions.entry(key).or_default();
        if !subscribers.contains(&subscriber) {
            subscribers.push(subscriber);
        }
    }

    /// Stop watching `key`. Returns false if there was no such subscription.
    pub fn unsubscribe(&mut self, key: &K, subscriber: &S) -> bool {
        let Some(subscribers) = self.subscriptions.get_mut(key) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s != subscriber);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            self.subscriptions.remove(key);
        }
        removed
    }

    /// Drop every subscription held by `subscriber`.
    pub fn unsubscribe_all(&mut self, subscriber: &S) {
        self.subscriptions.retain(|_, subscribers| {
            subscribers.retain(|s| s != subscriber);
            !subscribers.is_empty()
        });
    }

    /// The entity is gone; returns the subscribers that were watching it.
    pub fn retire(&mut self, key: &K) -> Vec<S> {
        self.subscriptions.remove(key).unwrap_or_default()
    }

    pub fn subscribers(&self, key: &K) -> &[S] {
        self.subscriptions.get(key).map_or(&[], Vec::as_slice)
    }

    /// Number of watched entities.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

type Sink = Box<dyn Fn(&BTreeSet<JobId>) + Send + Sync>;

struct Inner {
    depth: AtomicUsize,
    fired: AtomicU64,
    changed: Mutex<BTreeSet<JobId>>,
    sink: Sink,
}

/// Collects job changes and hands them to a sink.
///
/// Outside a batch every change is delivered at once. While a [`Batch`]
/// guard is alive changes are only recorded; dropping the outermost guard
/// delivers all of them in a single notification.
#[derive(Clone)]
pub struct ChangeNotifier {
    inner: Arc<Inner>,
}

impl fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("depth", &self.inner.depth.load(Ordering::Relaxed))
            .field("fired", &self.inner.fired.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(|_| {})
    }
}

impl ChangeNotifier {
    pub fn new(sink: impl Fn(&BTreeSet<JobId>) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                depth: AtomicUsize::new(0),
                fired: AtomicU64::new(0),
                changed: Mutex::new(BTreeSet::new()),
                sink: Box::new(sink),
            }),
        }
    }

    /// Open a batch; notifications are held until the outermost guard drops.
    pub fn batch(&self) -> Batch {
        self.inner.depth.fetch_add(1, Ordering::SeqCst);
        Batch {
            notifier: self.clone(),
        }
    }

    /// Record that `job` changed.
    pub fn mark_changed(&self, job: &JobId) {
        self.changed().insert(job.clone());
        if self.inner.depth.load(Ordering::SeqCst) == 0 {
            self.flush();
        }
    }

    /// Number of notifications delivered so far.
    pub fn fired(&self) -> u64 {
        self.inner.fired.load(Ordering::Relaxed)
    }

    fn changed(&self) -> std::sync::MutexGuard<'_, BTreeSet<JobId>> {
        self.inner
            .changed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(&self) {
        let changed = std::mem::take(&mut *self.changed());
        if changed.is_empty() {
            return;
        }
        self.inner.fired.fetch_add(1, Ordering::Relaxed);
        (self.inner.sink)(&changed);
    }
}

/// Guard returned by [`ChangeNotifier::batch`].
#[must_use = "changes are delivered when the batch is dropped"]
pub struct Batch {
    notifier: ChangeNotifier,
}

impl Drop for Batch {
    fn drop(&mut self) {
        if self.notifier.inner.depth.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notifier.flush();
        }
    }
}
