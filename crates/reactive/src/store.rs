//! Client connection state: collections, subscriptions and pending methods.
//!
//! The store does no I/O. Outgoing messages accumulate in an outbox that the
//! transport drains with [`ClientStore::take_outgoing`]; incoming messages are
//! handed over in batches with [`ClientStore::apply_batch`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use hashbrown::HashMap;
use livedata_core::diff::apply_changes;
use livedata_core::protocol::{ClientMessage, ErrorPayload, ServerMessage};
use livedata_core::value::ID_FIELD;
use livedata_core::{Document, DocumentId, Error, Result};
use livedata_query::modifier::upsert_document;
use livedata_random::{make_rpc_seed, RandomScope, RandomStream, SharedGenerator};
use serde_json::Value;

use crate::collection::{LocalCollection, UpdateOptions, UpdateResult};
use crate::tracker::{Dependency, Tracker};

/// Final outcome of a method call: its result or the error it raised.
pub type MethodOutcome = std::result::Result<Option<Value>, ErrorPayload>;

type MethodCallback = Box<dyn FnOnce(MethodOutcome)>;

struct SubscriptionState {
    name: String,
    ready: bool,
    error: Option<ErrorPayload>,
    dep: Dependency,
}

struct PendingMethod {
    outcome: Option<MethodOutcome>,
    updated: bool,
    callback: Option<MethodCallback>,
}

/// A document written by a method stub whose call is not settled yet.
struct StubWrite {
    /// Calls whose stubs wrote the document and that still wait for
    /// `updated`.
    methods: Vec<String>,
    /// The document as the server sees it; `None` if it does not exist there.
    server_doc: Option<Document>,
}

type DocKey = (String, DocumentId);

struct StoreInner {
    tracker: Tracker,
    collections: RefCell<HashMap<String, LocalCollection>>,
    subscriptions: RefCell<HashMap<String, SubscriptionState>>,
    methods: RefCell<HashMap<String, PendingMethod>>,
    stub_writes: RefCell<HashMap<DocKey, StubWrite>>,
    outbox: RefCell<Vec<ClientMessage>>,
    next_id: Cell<u64>,
}

/// Client-side view of one connection.
///
/// # Example
///
/// ```ignore
/// let store = ClientStore::new(Tracker::new());
/// let sub = store.subscribe("openTasks", vec![]);
/// transport.send_all(store.take_outgoing());
///
/// // later, for every batch read from the socket
/// store.apply_batch(messages)?;
/// assert!(store.is_ready(&sub));
/// ```
#[derive(Clone)]
pub struct ClientStore {
    inner: Rc<StoreInner>,
}

impl ClientStore {
    pub fn new(tracker: Tracker) -> Self {
        Self {
            inner: Rc::new(StoreInner {
                tracker,
                collections: RefCell::new(HashMap::new()),
                subscriptions: RefCell::new(HashMap::new()),
                methods: RefCell::new(HashMap::new()),
                stub_writes: RefCell::new(HashMap::new()),
                outbox: RefCell::new(Vec::new()),
                next_id: Cell::new(1),
            }),
        }
    }

    #[inline]
    pub fn tracker(&self) -> &Tracker {
        &self.inner.tracker
    }

    /// Returns the named collection, creating it on first use.
    pub fn collection(&self, name: &str) -> LocalCollection {
        self.inner
            .collections
            .borrow_mut()
            .entry(name.to_string())
            .or_insert_with(|| LocalCollection::new(name))
            .clone()
    }

    /// Drains the messages waiting to be sent.
    pub fn take_outgoing(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut *self.inner.outbox.borrow_mut())
    }

    fn next_id(&self) -> String {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        id.to_string()
    }

    /// Queues a `sub` message and returns the subscription id.
    pub fn subscribe(&self, name: &str, params: Vec<Value>) -> String {
        let id = self.next_id();
        self.inner.subscriptions.borrow_mut().insert(
            id.clone(),
            SubscriptionState {
                name: name.to_string(),
                ready: false,
                error: None,
                dep: Dependency::new(),
            },
        );
        self.inner.outbox.borrow_mut().push(ClientMessage::Sub {
            id: id.clone(),
            name: name.to_string(),
            params,
        });
        id
    }

    /// Queues an `unsub` message and forgets the subscription.
    pub fn unsubscribe(&self, id: &str) {
        let removed = self.inner.subscriptions.borrow_mut().remove(id);
        if let Some(sub) = removed {
            log::debug!("unsubscribing {} ({})", id, sub.name);
            self.inner.outbox.borrow_mut().push(ClientMessage::Unsub { id: id.to_string() });
            sub.dep.changed();
        }
    }

    /// Returns true once the server reported the subscription ready.
    /// Reactive: a computation calling this reruns when readiness changes.
    pub fn is_ready(&self, id: &str) -> bool {
        let subs = self.inner.subscriptions.borrow();
        match subs.get(id) {
            Some(sub) => {
                sub.dep.depend(&self.inner.tracker);
                sub.ready
            }
            None => false,
        }
    }

    /// Returns the error a subscription was terminated with, if any.
    pub fn subscription_error(&self, id: &str) -> Option<ErrorPayload> {
        self.inner
            .subscriptions
            .borrow()
            .get(id)
            .and_then(|sub| sub.error.clone())
    }

    /// Queues a method call and returns its id.
    ///
    /// `callback` runs once both the result and the `updated` notice for the
    /// call have arrived, so the method's writes are visible in the local
    /// collections by then.
    pub fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        callback: impl FnOnce(MethodOutcome) + 'static,
    ) -> String {
        self.call_with_stub(method, params, |_, _| Ok(()), callback)
    }

    /// Like [`call`](ClientStore::call), but first simulates the method
    /// locally by running `stub`.
    ///
    /// The stub runs under the same random seed that is sent to the server,
    /// so documents it inserts without an `_id` get the ids the server will
    /// assign. Its writes show up at once and are replaced by the server's
    /// version of the same documents when the call's `updated` arrives. A
    /// failing stub is logged; the call is sent regardless.
    pub fn call_with_stub<S>(
        &self,
        method: &str,
        params: Vec<Value>,
        stub: S,
        callback: impl FnOnce(MethodOutcome) + 'static,
    ) -> String
    where
        S: FnOnce(&StubContext<'_>, &[Value]) -> Result<()>,
    {
        let id = self.next_id();
        let seed = make_rpc_seed(None, method);
        self.inner.methods.borrow_mut().insert(
            id.clone(),
            PendingMethod {
                outcome: None,
                updated: false,
                callback: Some(Box::new(callback)),
            },
        );

        let ctx = StubContext {
            store: self,
            method_id: &id,
            scope: RandomScope::new(Some(seed.clone())),
        };
        if let Err(err) = stub(&ctx, &params) {
            log::debug!("stub of {} failed: {}", method, err);
        }
        drop(ctx);

        self.inner.outbox.borrow_mut().push(ClientMessage::Method {
            id: id.clone(),
            method: method.to_string(),
            params,
            random_seed: Some(seed),
        });
        id
    }

    /// Records that the stub of `method_id` is about to write a document.
    fn track_stub_write(&self, method_id: &str, collection: &str, id: &DocumentId) {
        let before = self.collection(collection).get(id);
        let mut writes = self.inner.stub_writes.borrow_mut();
        let write = writes
            .entry((collection.to_string(), id.clone()))
            .or_insert_with(|| StubWrite {
                methods: Vec::new(),
                server_doc: before,
            });
        if !write.methods.iter().any(|m| m == method_id) {
            write.methods.push(method_id.to_string());
        }
    }

    /// Applies `f` to the server's copy of a document a stub wrote, if any.
    ///
    /// Returns `None` when no pending stub wrote the document.
    fn with_server_doc(
        &self,
        collection: &str,
        id: &DocumentId,
        f: impl FnOnce(&mut Option<Document>) -> Result<()>,
    ) -> Option<Result<()>> {
        let mut writes = self.inner.stub_writes.borrow_mut();
        let write = writes.get_mut(&(collection.to_string(), id.clone()))?;
        Some(f(&mut write.server_doc))
    }

    /// Replaces stub writes no longer covered by a pending call with the
    /// server's version of each document.
    fn settle_stub_writes(&self, method_ids: &[String]) -> Result<()> {
        let settled: Vec<(DocKey, Option<Document>)> = {
            let mut writes = self.inner.stub_writes.borrow_mut();
            for write in writes.values_mut() {
                write.methods.retain(|m| !method_ids.contains(m));
            }
            let done: Vec<DocKey> = writes
                .iter()
                .filter(|(_, write)| write.methods.is_empty())
                .map(|(key, _)| key.clone())
                .collect();
            done.into_iter()
                .filter_map(|key| writes.remove(&key).map(|write| (key, write.server_doc)))
                .collect()
        };

        let mut outcome = Ok(());
        for ((collection, id), server_doc) in settled {
            let local = self.collection(&collection);
            let step = match server_doc {
                Some(doc) => local.replace(doc).map(|_| ()),
                None if local.get(&id).is_some() => local.remove_by_id(&id),
                None => Ok(()),
            };
            outcome = outcome.and(step);
        }
        outcome
    }

    /// Applies a batch of server messages.
    ///
    /// Observers of every touched collection are paused for the whole batch,
    /// so they see the net effect only. Reactive computations rerun once at
    /// the end, then completed method callbacks run. A message that fails to
    /// apply is logged and skipped; the first such error is returned after
    /// the rest of the batch has been processed.
    pub fn apply_batch(&self, messages: Vec<ServerMessage>) -> Result<()> {
        let mut touched: Vec<LocalCollection> = Vec::new();
        for name in messages.iter().filter_map(ServerMessage::collection) {
            if !touched.iter().any(|c| c.name() == name) {
                let collection = self.collection(name);
                collection.pause_observers();
                touched.push(collection);
            }
        }

        let mut first_error = None;
        let mut changed_deps = Vec::new();
        for message in messages {
            if let Err(err) = self.apply_message(message, &mut changed_deps) {
                log::warn!("failed to apply server message: {}", err);
                first_error.get_or_insert(err);
            }
        }

        for collection in &touched {
            if let Err(err) = collection.resume_observers() {
                log::error!("failed to resume observers of {}: {}", collection.name(), err);
                first_error.get_or_insert(err);
            }
        }
        for dep in changed_deps {
            dep.changed();
        }
        self.inner.tracker.flush();
        self.run_completed_methods();

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn apply_message(&self, message: ServerMessage, changed_deps: &mut Vec<Dependency>) -> Result<()> {
        let changes = message.changed_fields();
        match message {
            ServerMessage::Added {
                collection, id, mut fields, ..
            }
            | ServerMessage::AddedBefore {
                collection, id, mut fields, ..
            } => {
                fields.insert(ID_FIELD.to_string(), id.to_value());
                let mut fields = Some(fields);
                let shadowed = self.with_server_doc(&collection, &id, |server_doc| {
                    *server_doc = fields.take();
                    Ok(())
                });
                match (shadowed, fields) {
                    (Some(result), _) => result?,
                    (None, Some(fields)) => {
                        self.collection(&collection).insert(fields)?;
                    }
                    (None, None) => {}
                }
            }
            ServerMessage::Changed { collection, id, .. } => {
                let changes = changes.unwrap_or_default();
                let shadowed = self.with_server_doc(&collection, &id, |server_doc| {
                    match server_doc {
                        Some(doc) => {
                            apply_changes(doc, &changes);
                            Ok(())
                        }
                        None => Err(Error::not_found(collection.as_str(), id.clone())),
                    }
                });
                match shadowed {
                    Some(result) => result?,
                    None => self.collection(&collection).apply_changes(&id, &changes)?,
                }
            }
            ServerMessage::Removed { collection, id } => {
                let shadowed = self.with_server_doc(&collection, &id, |server_doc| {
                    match server_doc.take() {
                        Some(_) => Ok(()),
                        None => Err(Error::not_found(collection.as_str(), id.clone())),
                    }
                });
                match shadowed {
                    Some(result) => result?,
                    None => self.collection(&collection).remove_by_id(&id)?,
                }
            }
            // positions are recomputed locally from each query's sort
            ServerMessage::MovedBefore { .. } => {}
            ServerMessage::Ready { subs } => {
                let mut subscriptions = self.inner.subscriptions.borrow_mut();
                for id in subs {
                    if let Some(sub) = subscriptions.get_mut(&id) {
                        if !sub.ready {
                            sub.ready = true;
                            changed_deps.push(sub.dep.clone());
                        }
                    }
                }
            }
            ServerMessage::Nosub { id, error } => {
                let mut subscriptions = self.inner.subscriptions.borrow_mut();
                if let Some(sub) = subscriptions.get_mut(&id) {
                    if let Some(error) = &error {
                        log::warn!("subscription {} ({}) failed: {}", id, sub.name, error.reason);
                    }
                    sub.ready = false;
                    sub.error = error;
                    changed_deps.push(sub.dep.clone());
                }
            }
            ServerMessage::Result { id, result, error } => {
                let mut methods = self.inner.methods.borrow_mut();
                let Some(method) = methods.get_mut(&id) else {
                    return Err(Error::malformed(format!("result for unknown method {}", id)));
                };
                method.outcome = Some(match error {
                    Some(error) => Err(error),
                    None => Ok(result),
                });
            }
            ServerMessage::Updated { methods: ids } => {
                {
                    let mut methods = self.inner.methods.borrow_mut();
                    for id in &ids {
                        if let Some(method) = methods.get_mut(id) {
                            method.updated = true;
                        }
                    }
                }
                self.settle_stub_writes(&ids)?;
            }
            ServerMessage::Error { reason, .. } => {
                log::error!("server rejected a message: {}", reason);
            }
            ServerMessage::Connected { .. }
            | ServerMessage::Failed { .. }
            | ServerMessage::Ping { .. }
            | ServerMessage::Pong { .. } => {}
        }
        Ok(())
    }

    fn run_completed_methods(&self) {
        let completed: Vec<(String, MethodCallback, MethodOutcome)> = {
            let mut methods = self.inner.methods.borrow_mut();
            let mut ids: Vec<String> = methods
                .iter()
                .filter(|(_, m)| m.updated && m.outcome.is_some())
                .map(|(id, _)| id.clone())
                .collect();
            ids.sort_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX));
            ids.into_iter()
                .filter_map(|id| {
                    let method = methods.remove(&id)?;
                    Some((id, method.callback?, method.outcome?))
                })
                .collect()
        };
        for (id, callback, outcome) in completed {
            log::trace!("method {} completed", id);
            callback(outcome);
        }
    }

    /// Returns the number of method calls still waiting for completion.
    pub fn pending_methods(&self) -> usize {
        self.inner.methods.borrow().len()
    }
}

/// Handed to a method stub: the local collections and the call's seeded
/// randomness.
///
/// Writes must go through the context so they can be reconciled with the
/// server's results later.
pub struct StubContext<'a> {
    store: &'a ClientStore,
    method_id: &'a str,
    scope: RandomScope,
}

impl StubContext<'_> {
    pub fn random_seed(&self) -> Option<&str> {
        self.scope.random_seed()
    }

    /// Named random sequence of this call, identical to the server's.
    pub fn random_stream(&self, name: &str) -> SharedGenerator {
        RandomStream::get(Some(&self.scope), name)
    }

    /// The named collection, for reads.
    pub fn collection(&self, name: &str) -> LocalCollection {
        self.store.collection(name)
    }

    pub fn insert(&self, collection: &str, mut doc: Document) -> Result<DocumentId> {
        let id = if doc.contains_key(ID_FIELD) {
            DocumentId::of(&doc)?
        } else {
            let id = DocumentId::new(
                self.random_stream(&format!("/collection/{}", collection))
                    .lock()
                    .id(),
            );
            doc.insert(ID_FIELD.to_string(), id.to_value());
            id
        };
        self.store.track_stub_write(self.method_id, collection, &id);
        self.store.collection(collection).insert(doc)
    }

    pub fn update(
        &self,
        collection: &str,
        selector: &Value,
        modifier: &Value,
        options: UpdateOptions,
    ) -> Result<UpdateResult> {
        let mut ids = self.matching_ids(collection, selector)?;
        if !options.multi {
            ids.truncate(1);
        }
        if ids.is_empty() && options.upsert {
            let doc = upsert_document(selector, modifier)?;
            let inserted_id = self.insert(collection, doc)?;
            return Ok(UpdateResult {
                matched: 0,
                inserted_id: Some(inserted_id),
            });
        }
        for id in &ids {
            self.store.track_stub_write(self.method_id, collection, id);
        }
        let plain = UpdateOptions {
            upsert: false,
            ..options
        };
        self.store.collection(collection).update(selector, modifier, plain)
    }

    pub fn remove(&self, collection: &str, selector: &Value) -> Result<usize> {
        for id in self.matching_ids(collection, selector)? {
            self.store.track_stub_write(self.method_id, collection, &id);
        }
        self.store.collection(collection).remove(selector)
    }

    fn matching_ids(&self, collection: &str, selector: &Value) -> Result<Vec<DocumentId>> {
        let docs = self
            .store
            .collection(collection)
            .find(selector, Default::default())?
            .fetch();
        Ok(docs.iter().filter_map(|doc| DocumentId::of(doc).ok()).collect())
    }
}
