//! Property tests for result-set diffing.

use livedata_core::diff::{
    apply_changes, diff_query_ordered_changes, diff_query_unordered_changes,
};
use livedata_core::value::{documents_equal, to_document};
use livedata_core::{Document, DocumentId, IdMap, ObserveEvent};
use proptest::prelude::*;
use serde_json::json;

fn make_doc(id: u8, v: u8) -> Document {
    to_document(json!({"_id": format!("d{}", id), "v": v})).unwrap()
}

/// Distinct ids with arbitrary values, in arbitrary order.
fn result_set() -> impl Strategy<Value = Vec<Document>> {
    proptest::collection::btree_map(0u8..12, 0u8..3, 0..10)
        .prop_map(|m| m.into_iter().collect::<Vec<_>>())
        .prop_shuffle()
        .prop_map(|pairs| pairs.into_iter().map(|(id, v)| make_doc(id, v)).collect())
}

fn position(list: &[Document], id: &DocumentId) -> Option<usize> {
    list.iter()
        .position(|d| DocumentId::of(d).map_or(false, |x| &x == id))
}

fn apply_ordered(mut list: Vec<Document>, events: &[ObserveEvent]) -> Vec<Document> {
    for event in events {
        match event {
            ObserveEvent::AddedBefore { id, fields, before } => {
                let mut doc = fields.clone();
                doc.insert("_id".into(), id.to_value());
                let at = before
                    .as_ref()
                    .and_then(|b| position(&list, b))
                    .unwrap_or(list.len());
                list.insert(at, doc);
            }
            ObserveEvent::MovedBefore { id, before } => {
                let from = position(&list, id).expect("moved doc present");
                let doc = list.remove(from);
                let at = before
                    .as_ref()
                    .and_then(|b| position(&list, b))
                    .unwrap_or(list.len());
                list.insert(at, doc);
            }
            ObserveEvent::Changed { id, fields } => {
                let at = position(&list, id).expect("changed doc present");
                apply_changes(&mut list[at], fields);
            }
            ObserveEvent::Removed { id } => {
                let at = position(&list, id).expect("removed doc present");
                list.remove(at);
            }
            ObserveEvent::Added { .. } => panic!("ordered diff emitted unordered add"),
        }
    }
    list
}

proptest! {
    #[test]
    fn ordered_diff_reconstructs_new_results(old in result_set(), new in result_set()) {
        let events = diff_query_ordered_changes(&old, &new).unwrap();
        let rebuilt = apply_ordered(old, &events);
        prop_assert_eq!(rebuilt.len(), new.len());
        for (a, b) in rebuilt.iter().zip(new.iter()) {
            prop_assert!(documents_equal(a, b));
        }
    }

    #[test]
    fn unordered_diff_reconstructs_new_results(old in result_set(), new in result_set()) {
        let to_map = |docs: &[Document]| -> IdMap<Document> {
            docs.iter().map(|d| (DocumentId::of(d).unwrap(), d.clone())).collect()
        };
        let (old_map, new_map) = (to_map(&old), to_map(&new));

        let mut rebuilt = old_map.clone();
        for event in diff_query_unordered_changes(&old_map, &new_map) {
            match event {
                ObserveEvent::Added { id, mut fields } => {
                    fields.insert("_id".into(), id.to_value());
                    rebuilt.insert(id, fields);
                }
                ObserveEvent::Changed { id, fields } => {
                    apply_changes(rebuilt.get_mut(&id).unwrap(), &fields);
                }
                ObserveEvent::Removed { id } => {
                    rebuilt.remove(&id);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        prop_assert_eq!(rebuilt, new_map);
    }
}
