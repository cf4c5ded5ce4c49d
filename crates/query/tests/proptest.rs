//! Property tests for matching and sorting.

use core::cmp::Ordering;

use livedata_core::value::to_document;
use livedata_query::{Matcher, Sorter};
use proptest::prelude::*;
use serde_json::{json, Value};

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        (-50i64..50).prop_map(Value::from),
        "[a-d]{0,3}".prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
    ]
}

fn field_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        3 => scalar(),
        1 => proptest::collection::vec(scalar(), 0..4).prop_map(Value::from),
    ]
}

proptest! {
    #[test]
    fn gt_and_lte_partition_numbers(x in -100i64..100, pivot in -100i64..100) {
        let doc = to_document(json!({"n": x})).unwrap();
        let gt = Matcher::new(&json!({"n": {"$gt": pivot}})).unwrap();
        let lte = Matcher::new(&json!({"n": {"$lte": pivot}})).unwrap();
        prop_assert!(gt.document_matches(&doc) != lte.document_matches(&doc));
    }

    #[test]
    fn in_is_or_of_equalities(value in field_value(), options in proptest::collection::vec(scalar(), 1..4)) {
        let doc = to_document(json!({"f": value})).unwrap();
        let in_matcher = Matcher::new(&json!({"f": {"$in": options.clone()}})).unwrap();
        let clauses: Vec<Value> = options.iter().map(|o| json!({"f": o})).collect();
        let or_matcher = Matcher::new(&json!({"$or": clauses})).unwrap();
        prop_assert_eq!(in_matcher.document_matches(&doc), or_matcher.document_matches(&doc));
    }

    #[test]
    fn ne_negates_eq(value in field_value(), operand in scalar()) {
        let doc = to_document(json!({"f": value})).unwrap();
        let eq = Matcher::new(&json!({"f": {"$eq": operand.clone()}})).unwrap();
        let ne = Matcher::new(&json!({"f": {"$ne": operand}})).unwrap();
        prop_assert!(eq.document_matches(&doc) != ne.document_matches(&doc));
    }

    #[test]
    fn sorter_is_antisymmetric(a in field_value(), b in field_value(), asc in any::<bool>()) {
        let sorter = Sorter::new(&json!({"f": if asc { 1 } else { -1 }})).unwrap();
        let da = to_document(json!({"_id": "a", "f": a})).unwrap();
        let db = to_document(json!({"_id": "b", "f": b})).unwrap();
        prop_assert_eq!(sorter.compare(&da, &db), sorter.compare(&db, &da).reverse());
        prop_assert_ne!(sorter.compare(&da, &db), Ordering::Equal);
    }
}
