//! Live queries kept up to date by re-running them.

use std::sync::Arc;

use livedata_core::{Document, DocumentId, Result};
use livedata_query::{CompiledCursor, CursorDescription};
use livedata_storage::{current_fence, DocumentStore, FenceWrite, ListenHandle};
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::cache::ResultSet;
use super::{listen_triggers, with_id, ObserveDriver, ObserveMultiplexer};
use crate::config::ServerConfig;

struct PollState {
    /// `None` until the first poll succeeded.
    results: Option<ResultSet>,
    /// Fence writes to commit once the next poll has been delivered.
    pending_writes: Vec<FenceWrite>,
    stopped: bool,
}

enum PollOutcome {
    Delivered,
    Retry,
    Stop,
}

/// Observe driver for stores without an operation log, and for queries the
/// log cannot serve (sorted windows).
///
/// Matching writes schedule a poll after the throttle window; without
/// writes the query is still re-run every polling interval.
pub struct PollingObserveDriver {
    query: CursorDescription,
    compiled: CompiledCursor,
    store: Arc<dyn DocumentStore>,
    mux: Arc<ObserveMultiplexer>,
    ordered: bool,
    config: ServerConfig,
    state: Mutex<PollState>,
    wake: Notify,
    listeners: Mutex<Vec<ListenHandle>>,
}

impl PollingObserveDriver {
    pub fn start(
        cursor: CursorDescription,
        compiled: CompiledCursor,
        store: Arc<dyn DocumentStore>,
        mux: Arc<ObserveMultiplexer>,
        ordered: bool,
        config: ServerConfig,
    ) -> Result<Arc<Self>> {
        let mut query = cursor;
        query.options.fields = None;
        let driver = Arc::new(Self {
            query,
            compiled,
            store,
            mux,
            ordered,
            config,
            state: Mutex::new(PollState {
                results: None,
                pending_writes: Vec::new(),
                stopped: false,
            }),
            wake: Notify::new(),
            listeners: Mutex::new(Vec::new()),
        });

        for trigger in listen_triggers(&driver.query, &driver.compiled) {
            let weak = Arc::downgrade(&driver);
            let listened = driver.store.invalidation_crossbar().listen(trigger, move |_| {
                if let Some(driver) = weak.upgrade() {
                    driver.invalidate();
                }
                Ok(())
            });
            match listened {
                Ok(handle) => driver.listeners.lock().push(handle),
                Err(err) => {
                    driver.stop();
                    return Err(err);
                }
            }
        }

        tokio::spawn(driver.clone().run());
        Ok(driver)
    }

    /// A matching write happened: hold its fence and schedule a poll.
    fn invalidate(&self) {
        if let Some(fence) = current_fence() {
            match fence.begin_write() {
                Ok(write) => {
                    let rejected = {
                        let mut state = self.state.lock();
                        if state.stopped {
                            Some(write)
                        } else {
                            state.pending_writes.push(write);
                            None
                        }
                    };
                    if let Some(write) = rejected {
                        commit_all(vec![write]);
                    }
                }
                Err(err) => log::debug!("write after the fence fired: {}", err),
            }
        }
        self.wake.notify_one();
    }

    fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    async fn run(self: Arc<Self>) {
        loop {
            match self.poll().await {
                PollOutcome::Stop => return,
                PollOutcome::Retry => {
                    tokio::time::sleep(self.config.fetch_retry_delay()).await;
                    continue;
                }
                PollOutcome::Delivered => {}
            }
            tokio::select! {
                _ = self.wake.notified() => {
                    tokio::time::sleep(self.config.polling_throttle()).await;
                }
                _ = tokio::time::sleep(self.config.polling_interval()) => {}
            }
            if self.is_stopped() {
                return;
            }
        }
    }

    async fn poll(&self) -> PollOutcome {
        let (writes, first) = {
            let mut state = self.state.lock();
            if state.stopped {
                return PollOutcome::Stop;
            }
            (std::mem::take(&mut state.pending_writes), state.results.is_none())
        };

        let fresh = match self.store.find(&self.query).await.and_then(|docs| self.materialize(docs)) {
            Ok(fresh) => fresh,
            Err(err) if first && !err.is_transient() => {
                log::warn!("initial poll of {} failed: {}", self.query.collection, err);
                commit_all(writes);
                self.mux.query_error(&err);
                return PollOutcome::Stop;
            }
            Err(err) => {
                log::warn!("poll of {} failed, retrying: {}", self.query.collection, err);
                let mut state = self.state.lock();
                let mut writes = writes;
                writes.append(&mut state.pending_writes);
                state.pending_writes = writes;
                return PollOutcome::Retry;
            }
        };

        let stopped = {
            let mut state = self.state.lock();
            if !state.stopped {
                let old = state
                    .results
                    .take()
                    .unwrap_or_else(|| ResultSet::new(self.ordered));
                match old.diff(&fresh) {
                    Ok(events) => {
                        for event in events {
                            self.mux.dispatch(event);
                        }
                    }
                    Err(err) => log::error!("cannot diff results of {}: {}", self.query.collection, err),
                }
                state.results = Some(fresh);
            }
            state.stopped
        };
        if !stopped && first {
            self.mux.ready();
        }
        commit_all(writes);
        if stopped {
            PollOutcome::Stop
        } else {
            PollOutcome::Delivered
        }
    }

    fn materialize(&self, docs: Vec<Document>) -> Result<ResultSet> {
        let projected = docs
            .iter()
            .map(|doc| DocumentId::of(doc).map(|id| with_id(&id, &self.compiled.project(doc))))
            .collect::<Result<Vec<_>>>()?;
        ResultSet::from_docs(self.ordered, projected)
    }
}

impl ObserveDriver for PollingObserveDriver {
    fn stop(&self) {
        let writes = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.results = None;
            std::mem::take(&mut state.pending_writes)
        };
        for listener in self.listeners.lock().drain(..) {
            listener.stop();
        }
        commit_all(writes);
        self.wake.notify_one();
        log::debug!("stopped polling observer on {}", self.query.collection);
    }
}

fn commit_all(writes: Vec<FenceWrite>) {
    for write in writes {
        if let Err(err) = write.committed() {
            log::error!("failed to commit fence write: {}", err);
        }
    }
}
