//! In-process notification router.
//!
//! Listeners register a trigger (a flat JSON object); a fired notification
//! reaches every listener whose trigger it matches. A trigger key matches if
//! the notification lacks the key or holds an equal value under it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use livedata_core::value::values_equal;
use livedata_core::{Error, Result};
use parking_lot::Mutex;
use serde_json::{Map, Value};

/// A trigger or notification.
pub type Notification = Map<String, Value>;

/// Listener callback. An `Err` is logged and does not stop the fan-out.
pub type ListenerFn = Arc<dyn Fn(&Notification) -> Result<()> + Send + Sync>;

/// Listeners whose trigger names no collection live under this bucket.
const ANY_COLLECTION: &str = "";

struct Listener {
    trigger: Notification,
    callback: ListenerFn,
}

#[derive(Default)]
struct CrossbarInner {
    next_id: AtomicU64,
    buckets: Mutex<HashMap<String, BTreeMap<u64, Listener>>>,
}

/// Structured pub/sub registry.
///
/// Each instance is independent; clones share the same listeners.
///
/// # Example
///
/// ```ignore
/// let crossbar = Crossbar::new();
/// let handle = crossbar.listen(json!({"collection": "docs"}), |n| {
///     println!("docs changed: {:?}", n);
///     Ok(())
/// })?;
/// crossbar.fire(json!({"collection": "docs", "id": "a"}))?;
/// handle.stop();
/// ```
#[derive(Clone, Default)]
pub struct Crossbar {
    inner: Arc<CrossbarInner>,
}

impl Crossbar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for notifications matching `trigger`.
    ///
    /// Fails with `MalformedInput` unless `trigger` is a JSON object.
    pub fn listen<F>(&self, trigger: Value, callback: F) -> Result<ListenHandle>
    where
        F: Fn(&Notification) -> Result<()> + Send + Sync + 'static,
    {
        let Value::Object(trigger) = trigger else {
            return Err(Error::malformed("crossbar trigger must be an object"));
        };
        let bucket = bucket_of(&trigger);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .buckets
            .lock()
            .entry(bucket.clone())
            .or_default()
            .insert(
                id,
                Listener {
                    trigger,
                    callback: Arc::new(callback),
                },
            );
        Ok(ListenHandle {
            crossbar: Arc::downgrade(&self.inner),
            bucket,
            id,
        })
    }

    /// Invokes every listener matching `notification`.
    ///
    /// Matching listeners are collected first and called with the registry
    /// unlocked, so callbacks may listen or stop freely. A listener stopped
    /// by an earlier callback of the same fan-out is still called.
    pub fn fire(&self, notification: Value) -> Result<()> {
        let Value::Object(notification) = notification else {
            return Err(Error::malformed("crossbar notification must be an object"));
        };
        self.fire_notification(&notification);
        Ok(())
    }

    /// Like [`fire`](Crossbar::fire), for an already-built notification.
    pub fn fire_notification(&self, notification: &Notification) {
        let matching: Vec<ListenerFn> = {
            let buckets = self.inner.buckets.lock();
            let collect = |bucket: &BTreeMap<u64, Listener>| {
                bucket
                    .values()
                    .filter(|l| matches(notification, &l.trigger))
                    .map(|l| l.callback.clone())
                    .collect::<Vec<_>>()
            };
            match notification.get("collection").and_then(Value::as_str) {
                Some(collection) => {
                    let mut found = Vec::new();
                    for name in [collection, ANY_COLLECTION] {
                        if let Some(bucket) = buckets.get(name) {
                            found.extend(collect(bucket));
                        }
                    }
                    found
                }
                None => buckets.values().flat_map(|b| collect(b)).collect(),
            }
        };

        for callback in matching {
            if let Err(err) = callback(notification) {
                log::warn!("crossbar listener failed: {}", err);
            }
        }
    }

    /// Returns the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.buckets.lock().values().map(BTreeMap::len).sum()
    }
}

fn bucket_of(trigger: &Notification) -> String {
    match trigger.get("collection") {
        Some(Value::String(name)) => name.clone(),
        _ => ANY_COLLECTION.to_string(),
    }
}

/// Returns true if `notification` matches `trigger`: every key of the
/// trigger is either absent from the notification or holds an equal value.
pub fn matches(notification: &Notification, trigger: &Notification) -> bool {
    trigger.iter().all(|(key, expected)| match notification.get(key) {
        Some(actual) => values_equal(actual, expected),
        None => true,
    })
}

/// Registration returned by [`Crossbar::listen`].
pub struct ListenHandle {
    crossbar: Weak<CrossbarInner>,
    bucket: String,
    id: u64,
}

impl ListenHandle {
    /// Deregisters the listener. Stopping twice is a no-op.
    pub fn stop(&self) {
        let Some(inner) = self.crossbar.upgrade() else {
            return;
        };
        let mut buckets = inner.buckets.lock();
        if let Some(bucket) = buckets.get_mut(&self.bucket) {
            bucket.remove(&self.id);
            if bucket.is_empty() {
                buckets.remove(&self.bucket);
            }
        }
    }
}
