//! Server-side live queries.
//!
//! An observe call is served by an [`ObserveMultiplexer`] shared by every
//! observer of the same query. Each multiplexer is fed by one driver:
//!
//! - [`OplogObserveDriver`] follows the store's operation log and only goes
//!   back to the store for the documents it cannot decide on locally
//! - [`PollingObserveDriver`] re-runs the query after matching writes and
//!   periodically, diffing consecutive result sets
//!
//! [`ObserveRegistry`] picks the driver and de-duplicates queries.

mod cache;
mod multiplexer;
mod oplog_driver;
mod polling_driver;

use std::sync::{Arc, Weak};

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use livedata_core::Result;
use livedata_query::{CompiledCursor, CursorDescription};
use livedata_storage::DocumentStore;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::config::ServerConfig;

pub(crate) use cache::with_id;
pub use multiplexer::{EventSink, ObserveHandle, ObserveMultiplexer};
pub use oplog_driver::{OplogObserveDriver, Phase};
pub use polling_driver::PollingObserveDriver;

/// A running strategy feeding one multiplexer.
pub trait ObserveDriver: Send + Sync {
    /// Stops the driver; pending fence writes are released.
    fn stop(&self);
}

/// Crossbar triggers covering every write a query can observe: one per id
/// when the selector pins ids, one for the whole collection otherwise.
pub(crate) fn listen_triggers(cursor: &CursorDescription, compiled: &CompiledCursor) -> Vec<Value> {
    match compiled.matcher.ids_matched() {
        Some(ids) => ids
            .iter()
            .map(|id| json!({"collection": cursor.collection, "id": id.to_value()}))
            .collect(),
        None => vec![json!({"collection": cursor.collection})],
    }
}

/// Starts live queries and shares identical ones.
pub struct ObserveRegistry {
    store: Arc<dyn DocumentStore>,
    config: ServerConfig,
    multiplexers: Mutex<HashMap<String, Arc<ObserveMultiplexer>>>,
}

impl ObserveRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            multiplexers: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Number of distinct live queries running.
    pub fn live_query_count(&self) -> usize {
        self.multiplexers.lock().len()
    }

    /// Returns true if `cursor` can be served from the operation log.
    pub fn can_use_oplog(&self, cursor: &CursorDescription, ordered: bool) -> bool {
        !self.config.disable_oplog
            && !cursor.options.disable_oplog
            && !ordered
            && cursor.options.skip.is_none()
            && cursor.options.limit.is_none()
            && self.store.capabilities().oplog().is_some()
    }

    /// Observes `cursor`, delivering its current result set to `sink` as
    /// adds before returning, and every later change afterwards.
    pub async fn observe_changes(
        self: &Arc<Self>,
        cursor: &CursorDescription,
        ordered: bool,
        sink: EventSink,
    ) -> Result<ObserveHandle> {
        let compiled = cursor.compile()?;
        let key = format!("{}{}", if ordered { "o" } else { "u" }, cursor.key());

        loop {
            let (mux, created) = match self.multiplexers.lock().entry(key.clone()) {
                Entry::Occupied(entry) => (entry.get().clone(), false),
                Entry::Vacant(entry) => {
                    let mux = ObserveMultiplexer::new(ordered);
                    entry.insert(mux.clone());
                    (mux, true)
                }
            };
            if created {
                self.start_driver(&key, cursor, &compiled, ordered, &mux)?;
            }

            // a multiplexer stopped between lookup and registration is
            // replaced on the next pass
            let Some(id) = mux.try_add_handle(sink.clone())? else {
                self.forget(&key, &mux);
                continue;
            };
            let handle = ObserveHandle::new(mux.clone(), id);
            mux.wait_ready(id).await?;
            return Ok(handle);
        }
    }

    fn start_driver(
        self: &Arc<Self>,
        key: &str,
        cursor: &CursorDescription,
        compiled: &CompiledCursor,
        ordered: bool,
        mux: &Arc<ObserveMultiplexer>,
    ) -> Result<()> {
        let started: Result<Arc<dyn ObserveDriver>> = if self.can_use_oplog(cursor, ordered) {
            log::debug!("observing {} via the oplog", key);
            OplogObserveDriver::start(
                cursor.clone(),
                compiled.clone(),
                self.store.clone(),
                mux.clone(),
                self.config.clone(),
            )
            .map(|d| d as Arc<dyn ObserveDriver>)
        } else {
            log::debug!("observing {} by polling", key);
            PollingObserveDriver::start(
                cursor.clone(),
                compiled.clone(),
                self.store.clone(),
                mux.clone(),
                ordered,
                self.config.clone(),
            )
            .map(|d| d as Arc<dyn ObserveDriver>)
        };
        let driver = match started {
            Ok(driver) => driver,
            Err(err) => {
                self.forget(key, mux);
                return Err(err);
            }
        };

        let registry: Weak<Self> = Arc::downgrade(self);
        let weak_mux = Arc::downgrade(mux);
        let key = key.to_string();
        mux.set_on_stop(move || {
            driver.stop();
            if let (Some(registry), Some(mux)) = (registry.upgrade(), weak_mux.upgrade()) {
                registry.forget(&key, &mux);
            }
        });
        Ok(())
    }

    fn forget(&self, key: &str, mux: &Arc<ObserveMultiplexer>) {
        let mut multiplexers = self.multiplexers.lock();
        if multiplexers.get(key).map_or(false, |m| Arc::ptr_eq(m, mux)) {
            multiplexers.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livedata_core::ObserveEvent;
    use livedata_storage::MemoryStore;

    fn ignore() -> EventSink {
        Arc::new(|_: &ObserveEvent| {})
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_observer_racing_last_stop_gets_live_query() {
        let store = Arc::new(MemoryStore::new());
        let registry = ObserveRegistry::new(store, ServerConfig::default());
        let cursor = CursorDescription::new("docs", json!({}));

        for _ in 0..200 {
            let first = registry.observe_changes(&cursor, false, ignore()).await.unwrap();
            let stopper = std::thread::spawn(move || first.stop());
            let second = registry.observe_changes(&cursor, false, ignore()).await.unwrap();
            stopper.join().unwrap();

            assert!(!second.multiplexer().is_stopped());
            assert_eq!(second.multiplexer().handle_count(), 1);
            assert_eq!(registry.live_query_count(), 1);
            drop(second);
            assert_eq!(registry.live_query_count(), 0);
        }
    }
}
