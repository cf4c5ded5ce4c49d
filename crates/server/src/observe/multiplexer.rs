//! Sharing one live query between many observers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use livedata_core::{Error, ObserveEvent, Result};
use parking_lot::Mutex;
use tokio::sync::watch;

use super::cache::ResultSet;

/// Receives the events of one observer.
///
/// Sinks run on the driver's delivery path and must not stop handles or
/// start observers themselves.
pub type EventSink = Arc<dyn Fn(&ObserveEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

struct MuxState {
    handles: BTreeMap<u64, EventSink>,
    next_handle: u64,
    cache: ResultSet,
    stopped: bool,
}

/// Fans the events of one driver out to every observer of the same query.
///
/// Keeps the current result set so late observers start with the documents
/// delivered so far. The driver declares the multiplexer ready once its
/// first result set has been delivered; observers wait for that before
/// their observe call returns.
pub struct ObserveMultiplexer {
    ordered: bool,
    state: Mutex<MuxState>,
    ready: watch::Sender<Readiness>,
    on_stop: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ObserveMultiplexer {
    pub(crate) fn new(ordered: bool) -> Arc<Self> {
        let (ready, _) = watch::channel(Readiness::Pending);
        Arc::new(Self {
            ordered,
            state: Mutex::new(MuxState {
                handles: BTreeMap::new(),
                next_handle: 0,
                cache: ResultSet::new(ordered),
                stopped: false,
            }),
            ready,
            on_stop: Mutex::new(None),
        })
    }

    #[inline]
    pub fn ordered(&self) -> bool {
        self.ordered
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow() == Readiness::Ready
    }

    pub fn handle_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Number of documents currently in the result set.
    pub fn result_count(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// Sets what stopping runs; runs it at once if already stopped.
    pub(crate) fn set_on_stop(&self, f: impl FnOnce() + Send + 'static) {
        let mut slot = self.on_stop.lock();
        if self.state.lock().stopped {
            drop(slot);
            f();
        } else {
            *slot = Some(Box::new(f));
        }
    }

    /// Registers `sink` and replays the current result set to it.
    ///
    /// Returns `None` if the multiplexer already stopped, and the query
    /// error if its first query failed.
    pub(crate) fn try_add_handle(&self, sink: EventSink) -> Result<Option<u64>> {
        if let Readiness::Failed(message) = &*self.ready.borrow() {
            return Err(Error::store(message.clone()));
        }
        let mut state = self.state.lock();
        if state.stopped {
            return Ok(None);
        }
        let id = state.next_handle;
        state.next_handle += 1;
        for event in state.cache.initial_events() {
            sink(&event);
        }
        state.handles.insert(id, sink);
        Ok(Some(id))
    }

    /// Waits until the first result set was delivered.
    ///
    /// If the first query failed the handle is dropped and the error
    /// returned.
    pub(crate) async fn wait_ready(&self, handle: u64) -> Result<()> {
        let mut ready = self.ready.subscribe();
        let outcome = ready
            .wait_for(|r| *r != Readiness::Pending)
            .await
            .map(|r| r.clone())
            .map_err(|_| Error::stopped("observe multiplexer"))?;
        match outcome {
            Readiness::Failed(message) => {
                self.remove_handle(handle);
                Err(Error::store(message))
            }
            _ => Ok(()),
        }
    }

    /// Drops one observer. Removing the last one marks the multiplexer
    /// stopped under the same lock, so no observer can attach in between.
    pub(crate) fn remove_handle(&self, handle: u64) {
        let last = {
            let mut state = self.state.lock();
            let last = state.handles.remove(&handle).is_some()
                && state.handles.is_empty()
                && !state.stopped;
            if last {
                state.stopped = true;
            }
            last
        };
        if last {
            self.run_on_stop();
        }
    }

    /// Delivers one event to every observer.
    pub fn dispatch(&self, event: ObserveEvent) {
        let sinks: Vec<EventSink> = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            if let Err(err) = state.cache.apply(&event) {
                log::error!("observe cache out of sync: {}", err);
            }
            state.handles.values().cloned().collect()
        };
        for sink in sinks {
            sink(&event);
        }
    }

    /// Declares the first result set delivered.
    pub fn ready(&self) {
        self.ready.send_if_modified(|r| {
            if *r == Readiness::Pending {
                *r = Readiness::Ready;
                true
            } else {
                false
            }
        });
    }

    /// Fails every waiting observer with the error of the first query and
    /// stops the multiplexer.
    pub fn query_error(&self, err: &Error) {
        let failed = self.ready.send_if_modified(|r| {
            if *r == Readiness::Pending {
                *r = Readiness::Failed(err.to_string());
                true
            } else {
                false
            }
        });
        if !failed {
            log::error!("query error after the query was ready: {}", err);
            return;
        }
        self.state.lock().handles.clear();
        self.stop();
    }

    fn stop(&self) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        self.run_on_stop();
    }

    fn run_on_stop(&self) {
        let on_stop = self.on_stop.lock().take();
        if let Some(on_stop) = on_stop {
            on_stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}

/// One observer of a live query. Stopping (or dropping) it stops delivery;
/// the last handle of a query stops its driver.
pub struct ObserveHandle {
    mux: Arc<ObserveMultiplexer>,
    id: u64,
    stopped: AtomicBool,
}

impl ObserveHandle {
    pub(crate) fn new(mux: Arc<ObserveMultiplexer>, id: u64) -> Self {
        Self {
            mux,
            id,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn multiplexer(&self) -> &Arc<ObserveMultiplexer> {
        &self.mux
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.mux.remove_handle(self.id);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for ObserveHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
