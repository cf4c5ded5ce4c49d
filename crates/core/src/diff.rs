//! Field-level and result-set diffing.
//!
//! `ChangedFields` describes a field-level patch: `Some(value)` sets a field,
//! `None` clears it. Result-set diffs compare two snapshots of a live query
//! and produce the `ObserveEvent`s that turn the old snapshot into the new
//! one. The client cache uses them when observers resume, the polling
//! driver after every poll.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::Result;
use crate::value::{fields_of, values_equal, Document, DocumentId, IdMap, ID_FIELD};

/// Field-level patch. `None` marks a cleared field.
pub type ChangedFields = BTreeMap<String, Option<Value>>;

/// A single change to a live query's result set.
#[derive(Clone, Debug, PartialEq)]
pub enum ObserveEvent {
    /// A document entered an unordered result set.
    Added { id: DocumentId, fields: Document },
    /// A document entered an ordered result set before `before`
    /// (`None` appends).
    AddedBefore {
        id: DocumentId,
        fields: Document,
        before: Option<DocumentId>,
    },
    /// Fields of a document in the result set changed.
    Changed { id: DocumentId, fields: ChangedFields },
    /// A document moved before `before` (`None` moves it to the end).
    MovedBefore {
        id: DocumentId,
        before: Option<DocumentId>,
    },
    /// A document left the result set.
    Removed { id: DocumentId },
}

impl ObserveEvent {
    /// Returns the id of the affected document.
    pub fn id(&self) -> &DocumentId {
        match self {
            ObserveEvent::Added { id, .. }
            | ObserveEvent::AddedBefore { id, .. }
            | ObserveEvent::Changed { id, .. }
            | ObserveEvent::MovedBefore { id, .. }
            | ObserveEvent::Removed { id } => id,
        }
    }

    /// Returns true for `Added` and `AddedBefore`.
    #[inline]
    pub fn is_add(&self) -> bool {
        matches!(
            self,
            ObserveEvent::Added { .. } | ObserveEvent::AddedBefore { .. }
        )
    }
}

/// Computes the patch that turns `old_doc` into `new_doc`, ignoring `_id`.
///
/// Unchanged fields are omitted; fields missing from `new_doc` become `None`.
pub fn make_changed_fields(new_doc: &Document, old_doc: &Document) -> ChangedFields {
    let mut fields = ChangedFields::new();
    for (key, new_value) in new_doc {
        if key == ID_FIELD {
            continue;
        }
        match old_doc.get(key) {
            Some(old_value) if values_equal(old_value, new_value) => {}
            _ => {
                fields.insert(key.clone(), Some(new_value.clone()));
            }
        }
    }
    for key in old_doc.keys() {
        if key != ID_FIELD && !new_doc.contains_key(key) {
            fields.insert(key.clone(), None);
        }
    }
    fields
}

/// Applies a field-level patch in place.
pub fn apply_changes(doc: &mut Document, changes: &ChangedFields) {
    for (key, value) in changes {
        match value {
            Some(value) => {
                doc.insert(key.clone(), value.clone());
            }
            None => {
                doc.remove(key);
            }
        }
    }
}

/// Diffs two unordered result sets.
///
/// Emits `Changed` for documents present in both with differing fields,
/// `Added` for new documents and `Removed` for vanished ones.
pub fn diff_query_unordered_changes(
    old_results: &IdMap<Document>,
    new_results: &IdMap<Document>,
) -> Vec<ObserveEvent> {
    let mut events = Vec::new();

    for (id, new_doc) in new_results {
        match old_results.get(id) {
            Some(old_doc) => {
                let fields = make_changed_fields(new_doc, old_doc);
                if !fields.is_empty() {
                    events.push(ObserveEvent::Changed {
                        id: id.clone(),
                        fields,
                    });
                }
            }
            None => events.push(ObserveEvent::Added {
                id: id.clone(),
                fields: fields_of(new_doc),
            }),
        }
    }

    for id in old_results.keys() {
        if !new_results.contains_key(id) {
            events.push(ObserveEvent::Removed { id: id.clone() });
        }
    }

    events
}

/// Diffs two ordered result sets.
///
/// Documents on the longest common subsequence of both orders stay put; every
/// other surviving document is reported with `MovedBefore`. Applying the
/// events in order to `old_results` yields `new_results`.
pub fn diff_query_ordered_changes(
    old_results: &[Document],
    new_results: &[Document],
) -> Result<Vec<ObserveEvent>> {
    let old_ids = old_results
        .iter()
        .map(DocumentId::of)
        .collect::<Result<Vec<_>>>()?;
    let new_ids = new_results
        .iter()
        .map(DocumentId::of)
        .collect::<Result<Vec<_>>>()?;

    let mut old_index_of_id: IdMap<usize> = IdMap::new();
    for (i, id) in old_ids.iter().enumerate() {
        old_index_of_id.insert(id.clone(), i);
    }
    let new_presence: hashbrown::HashSet<&DocumentId> = new_ids.iter().collect();

    let unmoved = longest_unmoved_run(&new_ids, &old_index_of_id);

    let mut events = Vec::new();
    for id in &old_ids {
        if !new_presence.contains(id) {
            events.push(ObserveEvent::Removed { id: id.clone() });
        }
    }

    let mut start_of_group = 0;
    for end_of_group in unmoved
        .iter()
        .copied()
        .chain(core::iter::once(new_results.len()))
    {
        let group_id = new_ids.get(end_of_group).cloned();
        for i in start_of_group..end_of_group {
            let id = &new_ids[i];
            let new_doc = &new_results[i];
            match old_index_of_id.get(id) {
                None => events.push(ObserveEvent::AddedBefore {
                    id: id.clone(),
                    fields: fields_of(new_doc),
                    before: group_id.clone(),
                }),
                Some(&old_index) => {
                    let fields = make_changed_fields(new_doc, &old_results[old_index]);
                    if !fields.is_empty() {
                        events.push(ObserveEvent::Changed {
                            id: id.clone(),
                            fields,
                        });
                    }
                    events.push(ObserveEvent::MovedBefore {
                        id: id.clone(),
                        before: group_id.clone(),
                    });
                }
            }
        }

        if let Some(group_id) = &group_id {
            if let Some(&old_index) = old_index_of_id.get(group_id) {
                let fields = make_changed_fields(&new_results[end_of_group], &old_results[old_index]);
                if !fields.is_empty() {
                    events.push(ObserveEvent::Changed {
                        id: group_id.clone(),
                        fields,
                    });
                }
            }
        }
        start_of_group = end_of_group + 1;
    }

    Ok(events)
}

/// Returns indices into `new_ids` of the longest run of surviving documents
/// whose old positions are increasing.
fn longest_unmoved_run(new_ids: &[DocumentId], old_index_of_id: &IdMap<usize>) -> Vec<usize> {
    let n = new_ids.len();
    let mut seq_ends: Vec<usize> = Vec::with_capacity(n);
    let mut ptrs: Vec<Option<usize>> = vec![None; n];

    for i in 0..n {
        let Some(&old_i) = old_index_of_id.get(&new_ids[i]) else {
            continue;
        };
        let mut j = seq_ends.len();
        while j > 0 {
            let end = seq_ends[j - 1];
            if old_index_of_id[&new_ids[end]] < old_i {
                break;
            }
            j -= 1;
        }
        ptrs[i] = if j == 0 { None } else { Some(seq_ends[j - 1]) };
        if j == seq_ends.len() {
            seq_ends.push(i);
        } else {
            seq_ends[j] = i;
        }
    }

    let mut unmoved = Vec::new();
    let mut idx = seq_ends.last().copied();
    while let Some(i) = idx {
        unmoved.push(i);
        idx = ptrs[i];
    }
    unmoved.reverse();
    unmoved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::to_document;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        to_document(value).unwrap()
    }

    fn id_map(docs: &[Document]) -> IdMap<Document> {
        docs.iter()
            .map(|d| (DocumentId::of(d).unwrap(), d.clone()))
            .collect()
    }

    #[test]
    fn test_make_changed_fields_minimal() {
        let old = doc(json!({"_id": "x", "a": 1, "b": 2}));
        let new = doc(json!({"_id": "x", "a": 1, "b": 3, "c": 4}));

        let changed = make_changed_fields(&new, &old);
        assert_eq!(changed.len(), 2);
        assert_eq!(changed["b"], Some(json!(3)));
        assert_eq!(changed["c"], Some(json!(4)));
        assert!(!changed.contains_key("a"));
    }

    #[test]
    fn test_make_changed_fields_cleared() {
        let old = doc(json!({"_id": "x", "a": 1, "b": 2}));
        let new = doc(json!({"_id": "x", "a": 1}));

        let changed = make_changed_fields(&new, &old);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed["b"], None);
    }

    #[test]
    fn test_make_changed_fields_numeric_equality() {
        let old = doc(json!({"_id": "x", "a": 1}));
        let new = doc(json!({"_id": "x", "a": 1.0}));
        assert!(make_changed_fields(&new, &old).is_empty());
    }

    #[test]
    fn test_apply_changes() {
        let mut target = doc(json!({"_id": "x", "a": 1, "b": 2}));
        let mut changes = ChangedFields::new();
        changes.insert("a".into(), Some(json!(5)));
        changes.insert("b".into(), None);
        apply_changes(&mut target, &changes);
        assert_eq!(target, doc(json!({"_id": "x", "a": 5})));
    }

    #[test]
    fn test_diff_unordered() {
        let old = id_map(&[
            doc(json!({"_id": "a", "v": 1})),
            doc(json!({"_id": "b", "v": 1})),
        ]);
        let new = id_map(&[
            doc(json!({"_id": "b", "v": 2})),
            doc(json!({"_id": "c", "v": 1})),
        ]);

        let events = diff_query_unordered_changes(&old, &new);
        assert_eq!(events.len(), 3);
        assert!(events.contains(&ObserveEvent::Removed { id: "a".into() }));
        assert!(events.contains(&ObserveEvent::Added {
            id: "c".into(),
            fields: doc(json!({"v": 1})),
        }));
        let mut fields = ChangedFields::new();
        fields.insert("v".into(), Some(json!(2)));
        assert!(events.contains(&ObserveEvent::Changed {
            id: "b".into(),
            fields,
        }));
    }

    #[test]
    fn test_diff_unordered_identical() {
        let old = id_map(&[doc(json!({"_id": "a", "v": 1}))]);
        assert!(diff_query_unordered_changes(&old, &old.clone()).is_empty());
    }

    #[test]
    fn test_diff_ordered_move_to_front() {
        let old = vec![
            doc(json!({"_id": "a"})),
            doc(json!({"_id": "b"})),
            doc(json!({"_id": "c"})),
        ];
        let new = vec![
            doc(json!({"_id": "c"})),
            doc(json!({"_id": "a"})),
            doc(json!({"_id": "b"})),
        ];

        let events = diff_query_ordered_changes(&old, &new).unwrap();
        assert_eq!(
            events,
            vec![ObserveEvent::MovedBefore {
                id: "c".into(),
                before: Some("a".into()),
            }]
        );
    }

    #[test]
    fn test_diff_ordered_add_remove() {
        let old = vec![doc(json!({"_id": "a"})), doc(json!({"_id": "b"}))];
        let new = vec![doc(json!({"_id": "b"})), doc(json!({"_id": "d", "x": 1}))];

        let events = diff_query_ordered_changes(&old, &new).unwrap();
        assert_eq!(
            events,
            vec![
                ObserveEvent::Removed { id: "a".into() },
                ObserveEvent::AddedBefore {
                    id: "d".into(),
                    fields: doc(json!({"x": 1})),
                    before: None,
                },
            ]
        );
    }

    #[test]
    fn test_diff_ordered_requires_ids() {
        let old = vec![doc(json!({"x": 1}))];
        assert!(diff_query_ordered_changes(&old, &[]).is_err());
    }
}
