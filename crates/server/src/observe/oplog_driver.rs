//! Live queries fed by the operation log.
//!
//! The driver keeps the published result set of an unordered query and
//! updates it from log entries:
//!
//! - `Initializing`: the (re)query runs; entries seen meanwhile only mark
//!   their ids for a later fetch
//! - `Fetching`: marked ids are read back from the store one by one
//! - `Steady`: removes, inserts and replacements are applied directly;
//!   field-level updates mark the id and switch to `Fetching`
//!
//! Every change to the published set is delivered to the multiplexer in the
//! same critical section that makes it.

use std::sync::Arc;

use livedata_core::diff::make_changed_fields;
use livedata_core::value::fields_of;
use livedata_core::{Document, DocumentId, Error, IdMap, ObserveEvent, Result};
use livedata_query::{CompiledCursor, CursorDescription};
use livedata_storage::{
    current_fence, DocumentStore, FenceWrite, ListenHandle, Notification, OplogEntry,
    OplogHandle, OplogOp, OplogUpdate,
};
use parking_lot::Mutex;

use super::{listen_triggers, with_id, ObserveDriver, ObserveMultiplexer};
use crate::config::ServerConfig;

/// Lifecycle phase of an [`OplogObserveDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Fetching,
    Steady,
}

struct DriverState {
    phase: Phase,
    /// Projected documents, with `_id`, as delivered to the multiplexer.
    published: IdMap<Document>,
    /// Ids to read back, with the timestamp of the entry that marked them.
    need_to_fetch: IdMap<u64>,
    currently_fetching: IdMap<u64>,
    fetch_generation: u64,
    requery_when_done: bool,
    writes_to_commit_when_steady: Vec<FenceWrite>,
    stopped: bool,
}

enum AfterQuery {
    Requery,
    Steady(Vec<FenceWrite>),
    Fetch,
    Stopped,
}

/// Observe driver following a store's operation log.
pub struct OplogObserveDriver {
    /// The observed query without its projection; the driver projects
    /// itself so the selector sees whole documents.
    query: CursorDescription,
    compiled: CompiledCursor,
    store: Arc<dyn DocumentStore>,
    oplog: OplogHandle,
    mux: Arc<ObserveMultiplexer>,
    config: ServerConfig,
    state: Mutex<DriverState>,
    listeners: Mutex<Vec<ListenHandle>>,
}

impl OplogObserveDriver {
    /// Starts observing `cursor`; the first query runs in the background
    /// and readies `mux` when delivered.
    pub fn start(
        cursor: CursorDescription,
        compiled: CompiledCursor,
        store: Arc<dyn DocumentStore>,
        mux: Arc<ObserveMultiplexer>,
        config: ServerConfig,
    ) -> Result<Arc<Self>> {
        let oplog = store
            .capabilities()
            .oplog()
            .cloned()
            .ok_or_else(|| Error::invariant("oplog driver needs a store with an operation log"))?;
        let mut query = cursor;
        query.options.fields = None;

        let driver = Arc::new(Self {
            query,
            compiled,
            store,
            oplog,
            mux,
            config,
            state: Mutex::new(DriverState {
                phase: Phase::Initializing,
                published: IdMap::new(),
                need_to_fetch: IdMap::new(),
                currently_fetching: IdMap::new(),
                fetch_generation: 0,
                requery_when_done: false,
                writes_to_commit_when_steady: Vec::new(),
                stopped: false,
            }),
            listeners: Mutex::new(Vec::new()),
        });

        if let Err(err) = driver.listen() {
            driver.stop();
            return Err(err);
        }
        tokio::spawn(driver.clone().run_query(true));
        Ok(driver)
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn published_count(&self) -> usize {
        self.state.lock().published.len()
    }

    fn listen(self: &Arc<Self>) -> Result<()> {
        for trigger in listen_triggers(&self.query, &self.compiled) {
            let weak = Arc::downgrade(self);
            let entries = self.oplog.on_oplog_entry(trigger.clone(), move |n| match weak.upgrade() {
                Some(driver) => driver.handle_oplog_entry(n),
                None => Ok(()),
            })?;
            self.listeners.lock().push(entries);

            let weak = Arc::downgrade(self);
            let writes = self.store.invalidation_crossbar().listen(trigger, move |_| {
                if let Some(driver) = weak.upgrade() {
                    driver.join_current_fence();
                }
                Ok(())
            })?;
            self.listeners.lock().push(writes);
        }

        let weak = Arc::downgrade(self);
        let skipped = self.oplog.on_skipped_entries(move || {
            if let Some(driver) = weak.upgrade() {
                log::warn!("oplog entries skipped, requerying {}", driver.query.collection);
                driver.needs_requery();
            }
        })?;
        self.listeners.lock().push(skipped);
        Ok(())
    }

    fn handle_oplog_entry(self: &Arc<Self>, notification: &Notification) -> Result<()> {
        let entry = OplogEntry::from_notification(notification)?;
        if matches!(entry.op, OplogOp::DropCollection) {
            self.needs_requery();
            return Ok(());
        }
        let id = entry
            .id()
            .ok_or_else(|| Error::malformed("oplog entry without a document id"))?;

        let mut state = self.state.lock();
        if state.stopped {
            return Ok(());
        }
        match state.phase {
            Phase::Initializing => {
                state.need_to_fetch.insert(id, entry.ts);
                return Ok(());
            }
            Phase::Fetching
                if state.currently_fetching.contains_key(&id)
                    || state.need_to_fetch.contains_key(&id) =>
            {
                state.need_to_fetch.insert(id, entry.ts);
                return Ok(());
            }
            _ => {}
        }

        match entry.op {
            OplogOp::Remove { .. } => {
                if state.published.contains_key(&id) {
                    self.remove_published(&mut state, &id);
                }
            }
            OplogOp::Insert { doc } => {
                if state.published.contains_key(&id) {
                    return Err(Error::invariant(format!(
                        "insert of already published {} in {}",
                        id, self.query.collection
                    )));
                }
                self.handle_doc(&mut state, &id, Some(doc));
            }
            OplogOp::Update {
                update: OplogUpdate::Replace { doc },
                ..
            } => {
                let doc = with_id(&id, &doc);
                self.handle_doc(&mut state, &id, Some(doc));
            }
            OplogOp::Update {
                update: OplogUpdate::Modifier { .. },
                ..
            } => {
                // never applied locally; the document is read back
                state.need_to_fetch.insert(id, entry.ts);
                if state.phase == Phase::Steady {
                    state.phase = Phase::Fetching;
                    log::debug!("{}: steady -> fetching", self.query.collection);
                    tokio::spawn(self.clone().fetch_modified());
                }
            }
            OplogOp::DropCollection => {}
        }
        Ok(())
    }

    /// Reconciles one document with the published set.
    fn handle_doc(&self, state: &mut DriverState, id: &DocumentId, doc: Option<Document>) {
        let matches = doc
            .as_ref()
            .map_or(false, |d| self.compiled.matcher.document_matches(d));
        let published_before = state.published.contains_key(id);

        match (doc, matches, published_before) {
            (Some(doc), true, false) => {
                let projected = with_id(id, &self.compiled.project(&doc));
                let fields = fields_of(&projected);
                state.published.insert(id.clone(), projected);
                self.mux.dispatch(ObserveEvent::Added {
                    id: id.clone(),
                    fields,
                });
            }
            (Some(doc), true, true) => {
                let projected = with_id(id, &self.compiled.project(&doc));
                let changes = match state.published.get(id) {
                    Some(old) => make_changed_fields(&projected, old),
                    None => return,
                };
                if !changes.is_empty() {
                    state.published.insert(id.clone(), projected);
                    self.mux.dispatch(ObserveEvent::Changed {
                        id: id.clone(),
                        fields: changes,
                    });
                }
            }
            (_, false, true) => self.remove_published(state, id),
            _ => {}
        }
    }

    fn remove_published(&self, state: &mut DriverState, id: &DocumentId) {
        if state.published.remove(id).is_some() {
            self.mux.dispatch(ObserveEvent::Removed { id: id.clone() });
        }
    }

    /// Runs a full query and publishes its results, retrying store errors.
    ///
    /// An error of the very first query that is not transient fails the
    /// multiplexer instead.
    async fn run_query(self: Arc<Self>, mut initial: bool) {
        loop {
            {
                let mut state = self.state.lock();
                if state.stopped {
                    return;
                }
                state.phase = Phase::Initializing;
            }

            let docs = match self.store.find(&self.query).await {
                Ok(docs) => docs,
                Err(err) if initial && !err.is_transient() => {
                    log::warn!("initial query on {} failed: {}", self.query.collection, err);
                    self.mux.query_error(&err);
                    return;
                }
                Err(err) => {
                    log::warn!("query on {} failed, retrying: {}", self.query.collection, err);
                    tokio::time::sleep(self.config.fetch_retry_delay()).await;
                    continue;
                }
            };

            {
                let mut state = self.state.lock();
                if state.stopped {
                    return;
                }
                let mut fresh = IdMap::with_capacity(docs.len());
                for doc in docs {
                    match DocumentId::of(&doc) {
                        Ok(id) => {
                            fresh.insert(id, doc);
                        }
                        Err(err) => log::error!("skipping document without id: {}", err),
                    }
                }
                let gone: Vec<DocumentId> = state
                    .published
                    .keys()
                    .filter(|id| !fresh.contains_key(*id))
                    .cloned()
                    .collect();
                for id in gone {
                    self.remove_published(&mut state, &id);
                }
                for (id, doc) in fresh {
                    self.handle_doc(&mut state, &id, Some(doc));
                }
            }

            if let Err(err) = self.oplog.wait_until_caught_up().await {
                log::warn!("oplog of {} stopped: {}", self.query.collection, err);
            }
            self.mux.ready();

            let next = {
                let mut state = self.state.lock();
                if state.stopped {
                    AfterQuery::Stopped
                } else if state.requery_when_done {
                    state.requery_when_done = false;
                    reset_fetches(&mut state);
                    AfterQuery::Requery
                } else if state.need_to_fetch.is_empty() {
                    AfterQuery::Steady(self.become_steady(&mut state))
                } else {
                    state.phase = Phase::Fetching;
                    log::debug!("{}: initializing -> fetching", self.query.collection);
                    AfterQuery::Fetch
                }
            };
            match next {
                AfterQuery::Requery => {
                    initial = false;
                }
                AfterQuery::Steady(writes) => {
                    commit_all(writes);
                    return;
                }
                AfterQuery::Fetch => {
                    self.fetch_modified().await;
                    return;
                }
                AfterQuery::Stopped => return,
            }
        }
    }

    /// Reads back every marked document until none is left, then becomes
    /// steady. Results of a superseded generation are dropped.
    async fn fetch_modified(self: Arc<Self>) {
        loop {
            let (batch, generation) = {
                let mut state = self.state.lock();
                if state.stopped || state.phase != Phase::Fetching {
                    return;
                }
                if state.need_to_fetch.is_empty() {
                    let writes = self.become_steady(&mut state);
                    drop(state);
                    commit_all(writes);
                    return;
                }
                let batch = std::mem::take(&mut state.need_to_fetch);
                state.currently_fetching = batch.clone();
                state.fetch_generation += 1;
                let ids: Vec<DocumentId> = batch.into_keys().collect();
                (ids, state.fetch_generation)
            };

            let fetches = batch.into_iter().map(|id| {
                let driver = self.clone();
                async move {
                    let fetched = driver.fetch_with_retry(&id, generation).await;
                    (id, fetched)
                }
            });
            let results = futures::future::join_all(fetches).await;

            let requery = {
                let mut state = self.state.lock();
                if state.stopped
                    || state.phase != Phase::Fetching
                    || state.fetch_generation != generation
                {
                    return;
                }
                let mut requery = false;
                for (id, fetched) in results {
                    match fetched {
                        Ok(doc) => self.handle_doc(&mut state, &id, doc),
                        Err(err) => {
                            log::warn!("fetch of {} in {} failed: {}", id, self.query.collection, err);
                            requery = true;
                        }
                    }
                }
                state.currently_fetching.clear();
                requery
            };
            if requery {
                self.needs_requery();
                return;
            }
        }
    }

    async fn fetch_with_retry(&self, id: &DocumentId, generation: u64) -> Result<Option<Document>> {
        loop {
            match self.store.find_one(&self.query.collection, id).await {
                Ok(doc) => return Ok(doc),
                Err(err) if err.is_transient() => {
                    log::warn!("fetch of {} failed, retrying: {}", id, err);
                    tokio::time::sleep(self.config.fetch_retry_delay()).await;
                    let superseded = {
                        let state = self.state.lock();
                        state.stopped || state.fetch_generation != generation
                    };
                    if superseded {
                        return Err(Error::stopped("superseded fetch"));
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Starts over with a full query, or queues one behind the running one.
    fn needs_requery(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            if state.phase == Phase::Initializing {
                state.requery_when_done = true;
                return;
            }
            state.phase = Phase::Initializing;
            reset_fetches(&mut state);
        }
        log::debug!("{}: requerying", self.query.collection);
        tokio::spawn(self.clone().run_query(false));
    }

    fn become_steady(&self, state: &mut DriverState) -> Vec<FenceWrite> {
        state.phase = Phase::Steady;
        log::debug!("{}: steady", self.query.collection);
        std::mem::take(&mut state.writes_to_commit_when_steady)
    }

    /// Holds the running task's fence until the write that is being
    /// announced has gone through the log and this driver is steady.
    fn join_current_fence(self: &Arc<Self>) {
        let Some(fence) = current_fence() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let writer = fence.clone();
        let joined = fence.on_before_fire(move || {
            let Some(driver) = weak.upgrade() else {
                return;
            };
            match writer.begin_write() {
                Ok(write) => {
                    tokio::spawn(driver.commit_when_caught_up(write));
                }
                Err(err) => log::error!("could not join write fence: {}", err),
            }
        });
        if let Err(err) = joined {
            log::debug!("write after the fence fired: {}", err);
        }
    }

    async fn commit_when_caught_up(self: Arc<Self>, write: FenceWrite) {
        if let Err(err) = self.oplog.wait_until_caught_up().await {
            log::warn!("oplog of {} stopped: {}", self.query.collection, err);
        }
        let ready = {
            let mut state = self.state.lock();
            if state.stopped || state.phase == Phase::Steady {
                Some(write)
            } else {
                state.writes_to_commit_when_steady.push(write);
                None
            }
        };
        if let Some(write) = ready {
            commit_all(vec![write]);
        }
    }
}

impl ObserveDriver for OplogObserveDriver {
    fn stop(&self) {
        let writes = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.published.clear();
            state.need_to_fetch.clear();
            state.currently_fetching.clear();
            std::mem::take(&mut state.writes_to_commit_when_steady)
        };
        for listener in self.listeners.lock().drain(..) {
            listener.stop();
        }
        commit_all(writes);
        log::debug!("stopped oplog observer on {}", self.query.collection);
    }
}

fn reset_fetches(state: &mut DriverState) {
    state.fetch_generation += 1;
    state.need_to_fetch.clear();
    state.currently_fetching.clear();
}

fn commit_all(writes: Vec<FenceWrite>) {
    for write in writes {
        if let Err(err) = write.committed() {
            log::error!("failed to commit fence write: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use livedata_core::value::to_document;
    use livedata_storage::{
        with_fence, Crossbar, MemoryStore, StoreCapabilities, UpdateOptions, UpdateOutcome,
        WriteFence,
    };
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    use crate::observe::EventSink;

    /// A store whose point reads wait for the gate and may fail first.
    struct GatedStore {
        inner: MemoryStore,
        gate: Semaphore,
        transient_failures: AtomicUsize,
        point_reads: AtomicUsize,
    }

    impl GatedStore {
        fn new(open: bool) -> Arc<Self> {
            let store = Arc::new(Self {
                inner: MemoryStore::with_oplog(64),
                gate: Semaphore::new(0),
                transient_failures: AtomicUsize::new(0),
                point_reads: AtomicUsize::new(0),
            });
            if open {
                store.open();
            }
            store
        }

        fn open(&self) {
            self.gate.add_permits(1 << 20);
        }

        fn oplog(&self) -> OplogHandle {
            self.inner.capabilities().oplog().cloned().unwrap()
        }
    }

    #[async_trait]
    impl DocumentStore for GatedStore {
        fn capabilities(&self) -> StoreCapabilities {
            self.inner.capabilities()
        }

        fn invalidation_crossbar(&self) -> &Crossbar {
            self.inner.invalidation_crossbar()
        }

        async fn find(&self, cursor: &CursorDescription) -> Result<Vec<Document>> {
            self.inner.find(cursor).await
        }

        async fn find_one(&self, collection: &str, id: &DocumentId) -> Result<Option<Document>> {
            self.point_reads.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(Error::transient_store("read timed out"));
            }
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| Error::store("gate closed"))?;
            self.inner.find_one(collection, id).await
        }

        async fn insert(&self, collection: &str, doc: Document) -> Result<DocumentId> {
            self.inner.insert(collection, doc).await
        }

        async fn update(
            &self,
            collection: &str,
            selector: &Value,
            modifier: &Value,
            options: UpdateOptions,
        ) -> Result<UpdateOutcome> {
            self.inner.update(collection, selector, modifier, options).await
        }

        async fn remove(&self, collection: &str, selector: &Value) -> Result<usize> {
            self.inner.remove(collection, selector).await
        }

        async fn drop_collection(&self, collection: &str) -> Result<()> {
            self.inner.drop_collection(collection).await
        }
    }

    fn doc(value: Value) -> Document {
        to_document(value).unwrap()
    }

    fn recorder() -> (Arc<Mutex<Vec<ObserveEvent>>>, EventSink) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        (seen, Arc::new(move |e: &ObserveEvent| s.lock().push(e.clone())))
    }

    async fn observe(
        store: &Arc<GatedStore>,
        selector: Value,
    ) -> (Arc<OplogObserveDriver>, Arc<Mutex<Vec<ObserveEvent>>>) {
        let config = ServerConfig {
            fetch_retry_delay_ms: 1,
            ..ServerConfig::default()
        };
        let mux = ObserveMultiplexer::new(false);
        let (events, sink) = recorder();
        let handle = mux.try_add_handle(sink).unwrap().unwrap();
        let cursor = CursorDescription::new("docs", selector);
        let compiled = cursor.compile().unwrap();
        let driver =
            OplogObserveDriver::start(cursor, compiled, store.clone(), mux.clone(), config).unwrap();
        mux.wait_ready(handle).await.unwrap();
        wait_for_phase(&driver, Phase::Steady).await;
        (driver, events)
    }

    async fn wait_for_phase(driver: &OplogObserveDriver, phase: Phase) {
        for _ in 0..500 {
            if driver.phase() == phase {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("driver stuck in {:?}, expected {:?}", driver.phase(), phase);
    }

    fn set_status(status: &str) -> Value {
        json!({"$set": {"status": status}})
    }

    #[tokio::test]
    async fn test_partial_update_is_fetched_before_publishing() {
        let store = GatedStore::new(false);
        store
            .insert("docs", doc(json!({"_id": "a", "status": "closed"})))
            .await
            .unwrap();
        let (driver, events) = observe(&store, json!({"status": "open"})).await;
        assert!(events.lock().is_empty());

        store
            .update("docs", &json!("a"), &set_status("open"), Default::default())
            .await
            .unwrap();
        store.oplog().wait_until_caught_up().await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(driver.phase(), Phase::Fetching);
        assert_eq!(driver.published_count(), 0);
        assert!(events.lock().is_empty());

        store.open();
        wait_for_phase(&driver, Phase::Steady).await;
        assert_eq!(
            *events.lock(),
            vec![ObserveEvent::Added {
                id: "a".into(),
                fields: doc(json!({"status": "open"})),
            }]
        );
    }

    #[tokio::test]
    async fn test_steady_applies_inserts_replacements_and_removes() {
        let store = GatedStore::new(true);
        let (driver, events) = observe(&store, json!({"status": "open"})).await;

        store
            .insert("docs", doc(json!({"_id": "a", "status": "open", "n": 1})))
            .await
            .unwrap();
        store
            .update("docs", &json!("a"), &json!({"status": "open", "n": 2}), Default::default())
            .await
            .unwrap();
        store.remove("docs", &json!("a")).await.unwrap();
        store.oplog().wait_until_caught_up().await.unwrap();

        let events = events.lock();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ObserveEvent::Added { .. }));
        match &events[1] {
            ObserveEvent::Changed { fields, .. } => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields["n"], Some(json!(2)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(events[2], ObserveEvent::Removed { .. }));
        assert_eq!(driver.published_count(), 0);
        assert_eq!(store.point_reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_fetch_errors_are_retried() {
        let store = GatedStore::new(true);
        store
            .insert("docs", doc(json!({"_id": "a", "status": "closed"})))
            .await
            .unwrap();
        let (driver, events) = observe(&store, json!({"status": "open"})).await;
        store.transient_failures.store(2, Ordering::SeqCst);

        store
            .update("docs", &json!("a"), &set_status("open"), Default::default())
            .await
            .unwrap();
        store.oplog().wait_until_caught_up().await.unwrap();
        wait_for_phase(&driver, Phase::Steady).await;

        assert_eq!(store.point_reads.load(Ordering::SeqCst), 3);
        assert_eq!(events.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_rename_and_pull_all_are_fetched() {
        let store = GatedStore::new(true);
        store
            .insert("docs", doc(json!({"_id": "a", "tags": ["urgent", "x"], "status": "open"})))
            .await
            .unwrap();
        store
            .insert("docs", doc(json!({"_id": "b", "tags": ["urgent"], "status": "open"})))
            .await
            .unwrap();
        let (driver, events) = observe(&store, json!({"tags": "urgent"})).await;
        assert_eq!(events.lock().len(), 2);

        store
            .update("docs", &json!("a"), &json!({"$rename": {"status": "state"}}), Default::default())
            .await
            .unwrap();
        store
            .update("docs", &json!("b"), &json!({"$pullAll": {"tags": ["urgent"]}}), Default::default())
            .await
            .unwrap();
        store.oplog().wait_until_caught_up().await.unwrap();
        wait_for_phase(&driver, Phase::Steady).await;

        let events = events.lock();
        assert_eq!(events.len(), 4);
        assert!(events[2..].contains(&ObserveEvent::Removed { id: "b".into() }));
        let renamed = events[2..].iter().find_map(|e| match e {
            ObserveEvent::Changed { id, fields } if id.as_str() == "a" => Some(fields.clone()),
            _ => None,
        });
        let renamed = renamed.unwrap();
        assert_eq!(renamed.get("status"), Some(&None));
        assert_eq!(renamed.get("state"), Some(&Some(json!("open"))));
        assert!(store.point_reads.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_stop_discards_in_flight_fetch() {
        let store = GatedStore::new(false);
        store
            .insert("docs", doc(json!({"_id": "a", "status": "closed"})))
            .await
            .unwrap();
        let (driver, events) = observe(&store, json!({"status": "open"})).await;

        store
            .update("docs", &json!("a"), &set_status("open"), Default::default())
            .await
            .unwrap();
        store.oplog().wait_until_caught_up().await.unwrap();
        tokio::task::yield_now().await;
        driver.stop();

        store.open();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(events.lock().is_empty());
        assert_eq!(driver.published_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_collection_requeries() {
        let store = GatedStore::new(true);
        store
            .insert("docs", doc(json!({"_id": "a", "status": "open"})))
            .await
            .unwrap();
        let (driver, events) = observe(&store, json!({})).await;
        assert_eq!(events.lock().len(), 1);

        store.drop_collection("docs").await.unwrap();
        store.oplog().wait_until_caught_up().await.unwrap();
        wait_for_phase(&driver, Phase::Steady).await;
        for _ in 0..100 {
            if driver.published_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(driver.published_count(), 0);
        assert_eq!(events.lock()[1], ObserveEvent::Removed { id: "a".into() });
    }

    #[tokio::test]
    async fn test_fence_waits_for_fetched_delivery() {
        let store = GatedStore::new(false);
        store
            .insert("docs", doc(json!({"_id": "a", "status": "closed"})))
            .await
            .unwrap();
        let (driver, events) = observe(&store, json!({"status": "open"})).await;

        let fence = WriteFence::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        fence
            .on_all_committed(move || f.store(true, Ordering::SeqCst))
            .unwrap();
        with_fence(
            fence.clone(),
            store.update("docs", &json!("a"), &set_status("open"), Default::default()),
        )
        .await
        .unwrap();
        fence.arm().unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert!(events.lock().is_empty());

        store.open();
        wait_for_phase(&driver, Phase::Steady).await;
        for _ in 0..100 {
            if fired.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(events.lock().len(), 1);
    }
}
