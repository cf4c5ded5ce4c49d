//! In-memory document store.

use async_trait::async_trait;
use hashbrown::HashMap;
use livedata_core::diff::make_changed_fields;
use livedata_core::value::ID_FIELD;
use livedata_core::{Document, DocumentId, Error, IdMap, Result};
use livedata_query::modifier::{apply_modifier, is_modifier, upsert_document, ModifyOptions};
use livedata_query::{CursorDescription, Matcher};
use livedata_random::RandomGenerator;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::crossbar::Crossbar;
use crate::fence::{current_fence, FenceWrite};
use crate::oplog::{OplogHandle, OplogOp, OplogUpdate, OplogWriter};
use crate::store::{DocumentStore, StoreCapabilities, UpdateOptions, UpdateOutcome};

/// Default number of entries a lagging tailer may fall behind.
pub const DEFAULT_OPLOG_CAPACITY: usize = 1024;

struct StoredDoc {
    seq: u64,
    doc: Document,
}

#[derive(Default)]
struct Collection {
    docs: IdMap<StoredDoc>,
}

impl Collection {
    fn in_insertion_order(&self) -> Vec<&Document> {
        let mut stored: Vec<&StoredDoc> = self.docs.values().collect();
        stored.sort_by_key(|s| s.seq);
        stored.into_iter().map(|s| &s.doc).collect()
    }

    fn matching_ids(&self, matcher: &Matcher) -> Vec<DocumentId> {
        self.in_insertion_order()
            .into_iter()
            .filter(|doc| matcher.document_matches(doc))
            .filter_map(|doc| DocumentId::of(doc).ok())
            .collect()
    }
}

#[derive(Default)]
struct StoreState {
    collections: HashMap<String, Collection>,
    next_seq: u64,
}

/// A store keeping every collection in memory.
///
/// Created with [`MemoryStore::with_oplog`] it also records an operation
/// log and reports [`StoreCapabilities::LogTailing`].
pub struct MemoryStore {
    state: Mutex<StoreState>,
    crossbar: Crossbar,
    oplog: Option<(OplogWriter, OplogHandle)>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates a store without an operation log.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            crossbar: Crossbar::new(),
            oplog: None,
        }
    }

    /// Creates a store with an operation log holding up to `capacity`
    /// untailed entries. Must be called within a tokio runtime.
    pub fn with_oplog(capacity: usize) -> Self {
        Self {
            oplog: Some(OplogHandle::start(capacity)),
            ..Self::new()
        }
    }

    /// Returns the number of documents in `collection`.
    pub fn count(&self, collection: &str) -> usize {
        self.state
            .lock()
            .collections
            .get(collection)
            .map_or(0, |c| c.docs.len())
    }

    fn log(&self, collection: &str, op: OplogOp) {
        if let Some((writer, _)) = &self.oplog {
            writer.append(collection, op);
        }
    }

    /// Announces written documents and completes the fence write.
    fn announce(&self, collection: &str, ids: &[DocumentId], write: Option<FenceWrite>) -> Result<()> {
        for id in ids {
            self.crossbar.fire_notification(&notification(collection, Some(id)));
        }
        match write {
            Some(write) => write.committed(),
            None => Ok(()),
        }
    }
}

fn notification(collection: &str, id: Option<&DocumentId>) -> serde_json::Map<String, Value> {
    let mut n = serde_json::Map::new();
    n.insert("collection".into(), Value::String(collection.to_string()));
    if let Some(id) = id {
        n.insert("id".into(), id.to_value());
    }
    n
}

fn begin_fence_write() -> Result<Option<FenceWrite>> {
    current_fence().map(|fence| fence.begin_write()).transpose()
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn capabilities(&self) -> StoreCapabilities {
        match &self.oplog {
            Some((_, handle)) => StoreCapabilities::LogTailing(handle.clone()),
            None => StoreCapabilities::PointReadOnly,
        }
    }

    fn invalidation_crossbar(&self) -> &Crossbar {
        &self.crossbar
    }

    async fn find(&self, cursor: &CursorDescription) -> Result<Vec<Document>> {
        let compiled = cursor.compile()?;
        let state = self.state.lock();
        Ok(match state.collections.get(&cursor.collection) {
            Some(collection) => compiled.execute(collection.in_insertion_order()),
            None => Vec::new(),
        })
    }

    async fn find_one(&self, collection: &str, id: &DocumentId) -> Result<Option<Document>> {
        let state = self.state.lock();
        Ok(state
            .collections
            .get(collection)
            .and_then(|c| c.docs.get(id))
            .map(|s| s.doc.clone()))
    }

    async fn insert(&self, collection: &str, mut doc: Document) -> Result<DocumentId> {
        let id = match doc.get(ID_FIELD) {
            Some(_) => DocumentId::of(&doc)?,
            None => {
                let id = DocumentId::new(RandomGenerator::from_entropy().id());
                doc.insert(ID_FIELD.to_string(), id.to_value());
                id
            }
        };

        let write = begin_fence_write()?;
        let inserted = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            let docs = &mut state.collections.entry(collection.to_string()).or_default().docs;
            if docs.contains_key(&id) {
                false
            } else {
                docs.insert(id.clone(), StoredDoc { seq, doc: doc.clone() });
                state.next_seq += 1;
                self.log(collection, OplogOp::Insert { doc });
                true
            }
        };
        if !inserted {
            if let Some(write) = write {
                write.committed()?;
            }
            return Err(Error::duplicate_id(collection, id));
        }
        self.announce(collection, std::slice::from_ref(&id), write)?;
        Ok(id)
    }

    async fn update(
        &self,
        collection: &str,
        selector: &Value,
        modifier: &Value,
        options: UpdateOptions,
    ) -> Result<UpdateOutcome> {
        let matcher = Matcher::new(selector)?;
        let replacement = !is_modifier(modifier)?;

        let write = begin_fence_write()?;
        let result = {
            let mut state = self.state.lock();
            let applied: Result<Vec<(DocumentId, Document, Document)>> =
                match state.collections.get(collection) {
                    Some(coll) => {
                        let mut ids = coll.matching_ids(&matcher);
                        if !options.multi {
                            ids.truncate(1);
                        }
                        ids.into_iter()
                            .filter_map(|id| coll.docs.get(&id).map(|s| (id, s.doc.clone())))
                            .map(|(id, old)| {
                                apply_modifier(&old, modifier, ModifyOptions::default())
                                    .map(|new| (id, old, new))
                            })
                            .collect()
                    }
                    None => Ok(Vec::new()),
                };

            applied.map(|updates| {
                let coll = state.collections.entry(collection.to_string()).or_default();
                let mut ids = Vec::with_capacity(updates.len());
                for (id, old, new) in updates {
                    let update = if replacement {
                        OplogUpdate::Replace { doc: new.clone() }
                    } else {
                        let mut set = Document::new();
                        let mut unset = Vec::new();
                        for (field, value) in make_changed_fields(&new, &old) {
                            match value {
                                Some(value) => {
                                    set.insert(field, value);
                                }
                                None => unset.push(field),
                            }
                        }
                        OplogUpdate::Modifier { set, unset }
                    };
                    if let Some(stored) = coll.docs.get_mut(&id) {
                        stored.doc = new;
                    }
                    self.log(collection, OplogOp::Update { id: id.clone(), update });
                    ids.push(id);
                }
                ids
            })
        };

        let ids = match result {
            Ok(ids) => ids,
            Err(err) => {
                if let Some(write) = write {
                    write.committed()?;
                }
                return Err(err);
            }
        };
        self.announce(collection, &ids, write)?;

        if ids.is_empty() && options.upsert {
            let doc = upsert_document(selector, modifier)?;
            let upserted_id = self.insert(collection, doc).await?;
            return Ok(UpdateOutcome {
                matched: 0,
                upserted_id: Some(upserted_id),
            });
        }
        Ok(UpdateOutcome {
            matched: ids.len(),
            upserted_id: None,
        })
    }

    async fn remove(&self, collection: &str, selector: &Value) -> Result<usize> {
        let matcher = Matcher::new(selector)?;
        let write = begin_fence_write()?;
        let ids = {
            let mut state = self.state.lock();
            match state.collections.get_mut(collection) {
                Some(coll) => {
                    let ids = coll.matching_ids(&matcher);
                    for id in &ids {
                        coll.docs.remove(id);
                        self.log(collection, OplogOp::Remove { id: id.clone() });
                    }
                    ids
                }
                None => Vec::new(),
            }
        };
        self.announce(collection, &ids, write)?;
        Ok(ids.len())
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        let write = begin_fence_write()?;
        let existed = {
            let mut state = self.state.lock();
            let existed = state.collections.remove(collection).is_some();
            if existed {
                self.log(collection, OplogOp::DropCollection);
            }
            existed
        };
        if existed {
            self.crossbar.fire(json!({
                "collection": collection,
                "dropCollection": true,
            }))?;
        }
        match write {
            Some(write) => write.committed(),
            None => Ok(()),
        }
    }
}
