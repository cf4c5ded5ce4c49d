//! Client-side document collection with live queries.
//!
//! Every write updates the result set of each live query in the same call
//! and queues the resulting callbacks. Callbacks run after the collection
//! state is released, so they may read the collection, write to it or stop
//! their own query.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use livedata_core::diff::{
    apply_changes, diff_query_ordered_changes, diff_query_unordered_changes, make_changed_fields,
};
use livedata_core::value::{fields_of, ID_FIELD};
use livedata_core::{ChangedFields, Document, DocumentId, Error, IdMap, ObserveEvent, Result};
use livedata_query::modifier::{apply_modifier, upsert_document, ModifyOptions};
use livedata_query::{CompiledCursor, CursorDescription, CursorOptions, Matcher};
use livedata_random::RandomGenerator;
use serde_json::Value;

use crate::observe::{DocumentCallbacks, ObserveCallbacks, ObserveHandle};
use crate::tracker::{Computation, Tracker};

/// Identifier of a live query within its collection.
pub type QueryId = u64;

/// Options for [`LocalCollection::update`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Update every matching document instead of the first one.
    pub multi: bool,
    /// Insert a document built from selector and modifier if nothing matched.
    pub upsert: bool,
}

/// Outcome of [`LocalCollection::update`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    pub matched: usize,
    pub inserted_id: Option<DocumentId>,
}

struct StoredDoc {
    seq: u64,
    doc: Document,
}

#[derive(Clone)]
enum QueryResults {
    Unordered(IdMap<Document>),
    Ordered(Vec<Document>),
}

impl QueryResults {
    fn empty(ordered: bool) -> Self {
        if ordered {
            QueryResults::Ordered(Vec::new())
        } else {
            QueryResults::Unordered(IdMap::new())
        }
    }

    fn diff(&self, fresh: &QueryResults) -> Result<Vec<ObserveEvent>> {
        match (self, fresh) {
            (QueryResults::Ordered(old), QueryResults::Ordered(new)) => {
                diff_query_ordered_changes(old, new)
            }
            (QueryResults::Unordered(old), QueryResults::Unordered(new)) => {
                Ok(diff_query_unordered_changes(old, new))
            }
            _ => Err(Error::invariant("result sets of different shapes")),
        }
    }

    fn initial_events(&self) -> Vec<ObserveEvent> {
        match self {
            QueryResults::Ordered(docs) => docs
                .iter()
                .filter_map(|doc| {
                    let id = DocumentId::of(doc).ok()?;
                    Some(ObserveEvent::AddedBefore {
                        id,
                        fields: fields_of(doc),
                        before: None,
                    })
                })
                .collect(),
            QueryResults::Unordered(docs) => docs
                .iter()
                .map(|(id, doc)| ObserveEvent::Added {
                    id: id.clone(),
                    fields: fields_of(doc),
                })
                .collect(),
        }
    }
}

struct LiveQuery {
    compiled: CompiledCursor,
    callbacks: Rc<ObserveCallbacks>,
    ordered: bool,
    results: QueryResults,
    /// Results as of `pause_observers`.
    snapshot: Option<QueryResults>,
}

impl LiveQuery {
    fn compute(&self, docs: &IdMap<StoredDoc>) -> QueryResults {
        let selected = self.compiled.select(by_insertion(docs));
        if self.ordered {
            QueryResults::Ordered(
                selected
                    .into_iter()
                    .map(|doc| project_with_id(&self.compiled, doc))
                    .collect(),
            )
        } else {
            QueryResults::Unordered(
                selected
                    .into_iter()
                    .filter_map(|doc| {
                        let id = DocumentId::of(doc).ok()?;
                        Some((id, project_with_id(&self.compiled, doc)))
                    })
                    .collect(),
            )
        }
    }

    /// Brings the result set up to date after document `id` became `new`
    /// (`None` when removed) and returns the events describing the change.
    fn maintain(
        &mut self,
        docs: &IdMap<StoredDoc>,
        id: &DocumentId,
        new: Option<&Document>,
    ) -> Result<Vec<ObserveEvent>> {
        if self.ordered || self.compiled.is_windowed() {
            let fresh = self.compute(docs);
            let events = self.results.diff(&fresh)?;
            self.results = fresh;
            return Ok(events);
        }
        let QueryResults::Unordered(results) = &mut self.results else {
            return Err(Error::invariant("unordered query holds ordered results"));
        };

        let now = new.filter(|doc| self.compiled.matcher.document_matches(doc));
        let mut events = Vec::new();
        match (results.get(id), now) {
            (None, Some(doc)) => {
                let projected = project_with_id(&self.compiled, doc);
                events.push(ObserveEvent::Added {
                    id: id.clone(),
                    fields: fields_of(&projected),
                });
                results.insert(id.clone(), projected);
            }
            (Some(old), Some(doc)) => {
                let projected = project_with_id(&self.compiled, doc);
                let fields = make_changed_fields(&projected, old);
                if !fields.is_empty() {
                    events.push(ObserveEvent::Changed {
                        id: id.clone(),
                        fields,
                    });
                }
                results.insert(id.clone(), projected);
            }
            (Some(_), None) => {
                results.remove(id);
                events.push(ObserveEvent::Removed { id: id.clone() });
            }
            (None, None) => {}
        }
        Ok(events)
    }
}

fn by_insertion(docs: &IdMap<StoredDoc>) -> Vec<&Document> {
    let mut stored: Vec<&StoredDoc> = docs.values().collect();
    stored.sort_by_key(|s| s.seq);
    stored.into_iter().map(|s| &s.doc).collect()
}

/// Projects `doc` but keeps its `_id`, which result-set bookkeeping needs
/// even when the projection excludes it.
fn project_with_id(compiled: &CompiledCursor, doc: &Document) -> Document {
    let mut projected = compiled.project(doc);
    if let Some(id) = doc.get(ID_FIELD) {
        projected.insert(ID_FIELD.to_string(), id.clone());
    }
    projected
}

type QueuedEvent = (QueryId, Rc<ObserveCallbacks>, ObserveEvent);

#[derive(Default)]
struct CollectionState {
    docs: IdMap<StoredDoc>,
    next_seq: u64,
    queries: BTreeMap<QueryId, LiveQuery>,
    next_qid: QueryId,
    paused: bool,
    pending: VecDeque<QueuedEvent>,
}

impl CollectionState {
    /// Updates every live query after a write to `id` and queues the events.
    ///
    /// A query that fails to update does not hold back the others; the
    /// first failure is returned once every query has been visited.
    fn notify(&mut self, id: &DocumentId) -> Result<()> {
        let CollectionState {
            docs,
            queries,
            paused,
            pending,
            ..
        } = self;
        let new = docs.get(id).map(|s| &s.doc);
        let mut outcome = Ok(());
        for (qid, query) in queries.iter_mut() {
            let events = match query.maintain(docs, id, new) {
                Ok(events) => events,
                Err(err) => {
                    log::error!("live query {} failed to update: {}", qid, err);
                    outcome = outcome.and(Err(err));
                    continue;
                }
            };
            if !*paused {
                pending.extend(
                    events
                        .into_iter()
                        .map(|event| (*qid, query.callbacks.clone(), event)),
                );
            }
        }
        outcome
    }

    fn put(&mut self, id: DocumentId, doc: Document) -> Result<()> {
        match self.docs.get_mut(&id) {
            Some(stored) => stored.doc = doc,
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.docs.insert(id.clone(), StoredDoc { seq, doc });
            }
        }
        self.notify(&id)
    }

    fn matching_ids(&self, matcher: &Matcher) -> Vec<DocumentId> {
        if let Some(ids) = matcher.ids_matched() {
            return ids
                .iter()
                .filter(|id| {
                    self.docs
                        .get(*id)
                        .map_or(false, |s| matcher.document_matches(&s.doc))
                })
                .cloned()
                .collect();
        }
        let mut matched: Vec<(&DocumentId, &StoredDoc)> = self
            .docs
            .iter()
            .filter(|(_, s)| matcher.document_matches(&s.doc))
            .collect();
        matched.sort_by_key(|(_, s)| s.seq);
        matched.into_iter().map(|(id, _)| id.clone()).collect()
    }
}

pub(crate) struct CollectionInner {
    name: String,
    state: RefCell<CollectionState>,
    draining: Cell<bool>,
}

impl CollectionInner {
    pub(crate) fn remove_query(&self, query_id: QueryId) {
        let mut state = self.state.borrow_mut();
        state.queries.remove(&query_id);
        state.pending.retain(|(qid, _, _)| *qid != query_id);
    }

    /// Runs queued callbacks. Callbacks queued while draining are picked up
    /// by the outermost call.
    fn drain(&self) {
        if self.draining.replace(true) {
            return;
        }
        // a panicking callback must not leave the queue blocked
        let _guard = DrainGuard(&self.draining);
        loop {
            let next = self.state.borrow_mut().pending.pop_front();
            match next {
                Some((_, callbacks, event)) => callbacks.dispatch(&event),
                None => break,
            }
        }
    }
}

struct DrainGuard<'a>(&'a Cell<bool>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// An in-memory collection of documents.
///
/// Cloning is cheap; clones share the same documents and live queries.
#[derive(Clone)]
pub struct LocalCollection {
    inner: Rc<CollectionInner>,
}

impl LocalCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(CollectionInner {
                name: name.into(),
                state: RefCell::new(CollectionState::default()),
                draining: Cell::new(false),
            }),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn len(&self) -> usize {
        self.inner.state.borrow().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a copy of the document with the given id.
    pub fn get(&self, id: &DocumentId) -> Option<Document> {
        self.inner.state.borrow().docs.get(id).map(|s| s.doc.clone())
    }

    /// Inserts a document, generating an `_id` if it has none.
    pub fn insert(&self, mut doc: Document) -> Result<DocumentId> {
        let id = if doc.contains_key(ID_FIELD) {
            DocumentId::of(&doc)?
        } else {
            let id = DocumentId::new(RandomGenerator::from_entropy().id());
            doc.insert(ID_FIELD.to_string(), id.to_value());
            id
        };

        let result = {
            let mut state = self.inner.state.borrow_mut();
            if state.docs.contains_key(&id) {
                return Err(Error::duplicate_id(self.name(), id));
            }
            state.put(id.clone(), doc)
        };
        self.inner.drain();
        result.map(|()| id)
    }

    /// Applies `modifier` to the first (or, with `multi`, every) document
    /// matching `selector`.
    ///
    /// The modifier is applied to every matched document before any of them
    /// is written, so a failing modifier leaves the collection unchanged.
    pub fn update(
        &self,
        selector: &Value,
        modifier: &Value,
        options: UpdateOptions,
    ) -> Result<UpdateResult> {
        let matcher = Matcher::new(selector)?;
        let result = {
            let mut state = self.inner.state.borrow_mut();
            let mut ids = state.matching_ids(&matcher);
            if !options.multi {
                ids.truncate(1);
            }

            let mut updated = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(stored) = state.docs.get(&id) {
                    let doc = apply_modifier(&stored.doc, modifier, ModifyOptions::default())?;
                    updated.push((id, doc));
                }
            }

            let matched = updated.len();
            let mut outcome = Ok(());
            for (id, doc) in updated {
                outcome = outcome.and(state.put(id, doc));
            }
            outcome.map(|()| matched)
        };
        self.inner.drain();
        let matched = result?;

        if matched == 0 && options.upsert {
            let doc = upsert_document(selector, modifier)?;
            let inserted_id = self.insert(doc)?;
            return Ok(UpdateResult {
                matched: 0,
                inserted_id: Some(inserted_id),
            });
        }
        Ok(UpdateResult {
            matched,
            inserted_id: None,
        })
    }

    /// Updates the first matching document or inserts a new one.
    pub fn upsert(&self, selector: &Value, modifier: &Value) -> Result<UpdateResult> {
        self.update(
            selector,
            modifier,
            UpdateOptions {
                multi: false,
                upsert: true,
            },
        )
    }

    /// Removes every document matching `selector` and returns how many were
    /// removed.
    pub fn remove(&self, selector: &Value) -> Result<usize> {
        let matcher = Matcher::new(selector)?;
        let result = {
            let mut state = self.inner.state.borrow_mut();
            let ids = state.matching_ids(&matcher);
            let mut outcome = Ok(());
            for id in &ids {
                state.docs.remove(id);
                outcome = outcome.and(state.notify(id));
            }
            outcome.map(|()| ids.len())
        };
        self.inner.drain();
        result
    }

    /// Applies a field-level patch to an existing document.
    pub fn apply_changes(&self, id: &DocumentId, changes: &ChangedFields) -> Result<()> {
        let result = {
            let mut state = self.inner.state.borrow_mut();
            let Some(stored) = state.docs.get(id) else {
                return Err(Error::not_found(self.name(), id.clone()));
            };
            let mut doc = stored.doc.clone();
            apply_changes(&mut doc, changes);
            state.put(id.clone(), doc)
        };
        self.inner.drain();
        result
    }

    /// Stores `doc` under its `_id`, replacing the document with that id if
    /// there is one.
    pub fn replace(&self, doc: Document) -> Result<DocumentId> {
        let id = DocumentId::of(&doc)?;
        let result = self.inner.state.borrow_mut().put(id.clone(), doc);
        self.inner.drain();
        result.map(|()| id)
    }

    /// Removes one document by id.
    pub fn remove_by_id(&self, id: &DocumentId) -> Result<()> {
        let result = {
            let mut state = self.inner.state.borrow_mut();
            if state.docs.remove(id).is_none() {
                return Err(Error::not_found(self.name(), id.clone()));
            }
            state.notify(id)
        };
        self.inner.drain();
        result
    }

    /// Creates a cursor over the documents matching `selector`.
    pub fn find(&self, selector: &Value, options: CursorOptions) -> Result<Cursor> {
        let description = CursorDescription {
            collection: self.name().to_string(),
            selector: selector.clone(),
            options,
        };
        let compiled = description.compile()?;
        Ok(Cursor {
            collection: self.clone(),
            compiled,
        })
    }

    /// Returns the first document matching `selector`.
    pub fn find_one(&self, selector: &Value, options: CursorOptions) -> Result<Option<Document>> {
        let options = CursorOptions {
            limit: Some(1),
            ..options
        };
        Ok(self.find(selector, options)?.fetch().into_iter().next())
    }

    /// Stops delivering callbacks until [`resume_observers`] is called.
    ///
    /// Result sets are still maintained; on resume each query receives the
    /// difference between its results at pause time and its current
    /// results, so transient states are never observed.
    ///
    /// [`resume_observers`]: LocalCollection::resume_observers
    pub fn pause_observers(&self) {
        let mut state = self.inner.state.borrow_mut();
        if state.paused {
            return;
        }
        state.paused = true;
        for query in state.queries.values_mut() {
            query.snapshot = Some(query.results.clone());
        }
    }

    pub fn resume_observers(&self) -> Result<()> {
        let result = {
            let mut state = self.inner.state.borrow_mut();
            if !state.paused {
                return Ok(());
            }
            state.paused = false;

            let CollectionState {
                queries, pending, ..
            } = &mut *state;
            let mut outcome = Ok(());
            for (qid, query) in queries.iter_mut() {
                let Some(snapshot) = query.snapshot.take() else {
                    continue;
                };
                match snapshot.diff(&query.results) {
                    Ok(events) => pending.extend(
                        events
                            .into_iter()
                            .map(|event| (*qid, query.callbacks.clone(), event)),
                    ),
                    Err(err) => outcome = Err(err),
                }
            }
            outcome
        };
        self.inner.drain();
        result
    }

    fn add_query(
        &self,
        compiled: CompiledCursor,
        callbacks: ObserveCallbacks,
        suppress_initial: bool,
    ) -> ObserveHandle {
        let query_id = {
            let mut state = self.inner.state.borrow_mut();
            let query_id = state.next_qid;
            state.next_qid += 1;

            let ordered = callbacks.is_ordered();
            let mut query = LiveQuery {
                compiled,
                callbacks: Rc::new(callbacks),
                ordered,
                results: QueryResults::empty(ordered),
                snapshot: None,
            };
            query.results = query.compute(&state.docs);

            if state.paused {
                query.snapshot = Some(QueryResults::empty(ordered));
            } else if !suppress_initial {
                let callbacks = query.callbacks.clone();
                state.pending.extend(
                    query
                        .results
                        .initial_events()
                        .into_iter()
                        .map(|event| (query_id, callbacks.clone(), event)),
                );
            }
            state.queries.insert(query_id, query);
            query_id
        };
        self.inner.drain();
        ObserveHandle::new(Rc::downgrade(&self.inner), query_id)
    }
}

/// A query over a [`LocalCollection`].
pub struct Cursor {
    collection: LocalCollection,
    compiled: CompiledCursor,
}

impl Cursor {
    /// Returns the matching documents, sorted, windowed and projected.
    pub fn fetch(&self) -> Vec<Document> {
        let state = self.collection.inner.state.borrow();
        self.compiled.execute(by_insertion(&state.docs))
    }

    pub fn count(&self) -> usize {
        let state = self.collection.inner.state.borrow();
        self.compiled.select(by_insertion(&state.docs)).len()
    }

    /// Starts a live query. The current results are delivered as additions
    /// before this returns.
    pub fn observe_changes(&self, callbacks: ObserveCallbacks) -> ObserveHandle {
        self.collection
            .add_query(self.compiled.clone(), callbacks, false)
    }

    /// Starts a live query with whole-document callbacks.
    pub fn observe(&self, callbacks: DocumentCallbacks) -> ObserveHandle {
        self.observe_changes(callbacks.into_observe_callbacks())
    }

    /// Like [`fetch`](Cursor::fetch), but also invalidates the current
    /// computation of `tracker` when the result changes.
    pub fn fetch_reactive(&self, tracker: &Tracker) -> Vec<Document> {
        self.depend(tracker, self.compiled.sorter.is_some());
        self.fetch()
    }

    /// Like [`count`](Cursor::count), but reactive.
    pub fn count_reactive(&self, tracker: &Tracker) -> usize {
        self.depend(tracker, false);
        self.count()
    }

    fn depend(&self, tracker: &Tracker, ordered: bool) {
        let Some(computation) = tracker.current() else {
            return;
        };

        let invalidator = |computation: &Computation| {
            let computation = computation.clone();
            move || computation.invalidate()
        };
        let (on_add, on_change, on_remove) = (
            invalidator(&computation),
            invalidator(&computation),
            invalidator(&computation),
        );
        let mut callbacks = ObserveCallbacks::new()
            .on_added(move |_, _| on_add())
            .on_changed(move |_, _| on_change())
            .on_removed(move |_| on_remove());
        if ordered {
            let (on_add_before, on_move) = (invalidator(&computation), invalidator(&computation));
            callbacks = callbacks
                .on_added_before(move |_, _, _| on_add_before())
                .on_moved_before(move |_, _| on_move());
        }

        let handle = self
            .collection
            .add_query(self.compiled.clone(), callbacks, true);
        computation.on_invalidate(move |_| handle.stop());
    }
}
