//! Live query callbacks and handles.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use livedata_core::diff::apply_changes;
use livedata_core::value::ID_FIELD;
use livedata_core::{ChangedFields, Document, DocumentId, IdMap, ObserveEvent};

use crate::collection::{CollectionInner, QueryId};

type AddedFn = Box<dyn Fn(&DocumentId, &Document)>;
type AddedBeforeFn = Box<dyn Fn(&DocumentId, &Document, Option<&DocumentId>)>;
type ChangedFn = Box<dyn Fn(&DocumentId, &ChangedFields)>;
type MovedBeforeFn = Box<dyn Fn(&DocumentId, Option<&DocumentId>)>;
type RemovedFn = Box<dyn Fn(&DocumentId)>;

/// Field-level callbacks of a live query.
///
/// Registering `on_added_before` or `on_moved_before` makes the query
/// ordered: additions then carry the id of the next document.
#[derive(Default)]
pub struct ObserveCallbacks {
    added: Option<AddedFn>,
    added_before: Option<AddedBeforeFn>,
    changed: Option<ChangedFn>,
    moved_before: Option<MovedBeforeFn>,
    removed: Option<RemovedFn>,
}

impl ObserveCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_added(mut self, f: impl Fn(&DocumentId, &Document) + 'static) -> Self {
        self.added = Some(Box::new(f));
        self
    }

    pub fn on_added_before(
        mut self,
        f: impl Fn(&DocumentId, &Document, Option<&DocumentId>) + 'static,
    ) -> Self {
        self.added_before = Some(Box::new(f));
        self
    }

    pub fn on_changed(mut self, f: impl Fn(&DocumentId, &ChangedFields) + 'static) -> Self {
        self.changed = Some(Box::new(f));
        self
    }

    pub fn on_moved_before(mut self, f: impl Fn(&DocumentId, Option<&DocumentId>) + 'static) -> Self {
        self.moved_before = Some(Box::new(f));
        self
    }

    pub fn on_removed(mut self, f: impl Fn(&DocumentId) + 'static) -> Self {
        self.removed = Some(Box::new(f));
        self
    }

    /// Returns true if the callbacks need positional information.
    #[inline]
    pub fn is_ordered(&self) -> bool {
        self.added_before.is_some() || self.moved_before.is_some()
    }

    /// Delivers one event.
    pub fn dispatch(&self, event: &ObserveEvent) {
        match event {
            ObserveEvent::Added { id, fields } => {
                if let Some(f) = &self.added {
                    f(id, fields);
                }
            }
            ObserveEvent::AddedBefore { id, fields, before } => {
                if let Some(f) = &self.added_before {
                    f(id, fields, before.as_ref());
                } else if let Some(f) = &self.added {
                    f(id, fields);
                }
            }
            ObserveEvent::Changed { id, fields } => {
                if let Some(f) = &self.changed {
                    f(id, fields);
                }
            }
            ObserveEvent::MovedBefore { id, before } => {
                if let Some(f) = &self.moved_before {
                    f(id, before.as_ref());
                }
            }
            ObserveEvent::Removed { id } => {
                if let Some(f) = &self.removed {
                    f(id);
                }
            }
        }
    }
}

type DocFn = Box<dyn Fn(&Document)>;
type DocChangedFn = Box<dyn Fn(&Document, &Document)>;

/// Document-level callbacks: `changed` receives the new and the old
/// document instead of a patch.
#[derive(Default)]
pub struct DocumentCallbacks {
    added: Option<DocFn>,
    changed: Option<DocChangedFn>,
    removed: Option<DocFn>,
}

impl DocumentCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_added(mut self, f: impl Fn(&Document) + 'static) -> Self {
        self.added = Some(Box::new(f));
        self
    }

    /// `f(new_document, old_document)`
    pub fn on_changed(mut self, f: impl Fn(&Document, &Document) + 'static) -> Self {
        self.changed = Some(Box::new(f));
        self
    }

    pub fn on_removed(mut self, f: impl Fn(&Document) + 'static) -> Self {
        self.removed = Some(Box::new(f));
        self
    }

    /// Wraps these callbacks into field-level callbacks backed by a cache of
    /// the documents seen so far.
    pub(crate) fn into_observe_callbacks(self) -> ObserveCallbacks {
        let cache: Rc<RefCell<IdMap<Document>>> = Rc::new(RefCell::new(IdMap::new()));
        let callbacks = Rc::new(self);

        let (added_cache, added_cbs) = (cache.clone(), callbacks.clone());
        let (changed_cache, changed_cbs) = (cache.clone(), callbacks.clone());
        let (removed_cache, removed_cbs) = (cache, callbacks);

        ObserveCallbacks::new()
            .on_added(move |id, fields| {
                let mut doc = fields.clone();
                doc.insert(ID_FIELD.to_string(), id.to_value());
                added_cache.borrow_mut().insert(id.clone(), doc.clone());
                if let Some(f) = &added_cbs.added {
                    f(&doc);
                }
            })
            .on_changed(move |id, fields| {
                let pair = {
                    let mut cache = changed_cache.borrow_mut();
                    cache.get_mut(id).map(|doc| {
                        let old = doc.clone();
                        apply_changes(doc, fields);
                        (doc.clone(), old)
                    })
                };
                if let (Some((new, old)), Some(f)) = (pair, &changed_cbs.changed) {
                    f(&new, &old);
                }
            })
            .on_removed(move |id| {
                let old = removed_cache.borrow_mut().remove(id);
                if let (Some(old), Some(f)) = (old, &removed_cbs.removed) {
                    f(&old);
                }
            })
    }
}

/// Handle of a live query. The query keeps running until `stop` is called.
pub struct ObserveHandle {
    collection: Weak<CollectionInner>,
    query_id: QueryId,
    stopped: Cell<bool>,
}

impl ObserveHandle {
    pub(crate) fn new(collection: Weak<CollectionInner>, query_id: QueryId) -> Self {
        Self {
            collection,
            query_id,
            stopped: Cell::new(false),
        }
    }

    #[inline]
    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.get()
    }

    /// Stops the query. Callbacks still queued for it are dropped.
    pub fn stop(&self) {
        if self.stopped.replace(true) {
            return;
        }
        if let Some(collection) = self.collection.upgrade() {
            collection.remove_query(self.query_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Document {
        livedata_core::value::to_document(value).unwrap()
    }

    #[test]
    fn test_dispatch_added_before_falls_back_to_added() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let callbacks = ObserveCallbacks::new().on_added(move |id, _| s.borrow_mut().push(id.clone()));
        assert!(!callbacks.is_ordered());

        callbacks.dispatch(&ObserveEvent::AddedBefore {
            id: "a".into(),
            fields: Document::new(),
            before: None,
        });
        assert_eq!(*seen.borrow(), vec![DocumentId::from("a")]);
    }

    #[test]
    fn test_ordered_callbacks() {
        let callbacks = ObserveCallbacks::new().on_moved_before(|_, _| {});
        assert!(callbacks.is_ordered());
    }

    #[test]
    fn test_document_callbacks_track_old_and_new() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let (l1, l2, l3) = (log.clone(), log.clone(), log.clone());
        let callbacks = DocumentCallbacks::new()
            .on_added(move |doc| l1.borrow_mut().push(format!("added {}", doc["n"])))
            .on_changed(move |new, old| {
                l2.borrow_mut().push(format!("changed {} -> {}", old["n"], new["n"]))
            })
            .on_removed(move |old| l3.borrow_mut().push(format!("removed {}", old["n"])))
            .into_observe_callbacks();

        let mut patch = ChangedFields::new();
        patch.insert("n".into(), Some(json!(2)));

        callbacks.dispatch(&ObserveEvent::Added {
            id: "x".into(),
            fields: fields(json!({"n": 1})),
        });
        callbacks.dispatch(&ObserveEvent::Changed {
            id: "x".into(),
            fields: patch,
        });
        callbacks.dispatch(&ObserveEvent::Removed { id: "x".into() });

        assert_eq!(
            *log.borrow(),
            vec!["added 1", "changed 1 -> 2", "removed 2"]
        );
    }
}
