//! Selector compilation and document matching.

use core::cmp::Ordering;

use livedata_core::value::{compare_values, type_order, values_equal, ID_FIELD};
use livedata_core::{Document, DocumentId, Error, Result};
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};

use crate::path::{expand_arrays, lookup, split_path};

/// A compiled selector.
///
/// # Example
///
/// ```ignore
/// let matcher = Matcher::new(&json!({"tags": "urgent", "votes": {"$gt": 2}}))?;
/// matcher.document_matches(&doc);
/// ```
#[derive(Debug, Clone)]
pub struct Matcher {
    selector: Value,
    root: DocPredicate,
    ids: Option<Vec<DocumentId>>,
}

#[derive(Debug, Clone)]
enum DocPredicate {
    Everything,
    Nothing,
    All(Vec<DocPredicate>),
    Any(Vec<DocPredicate>),
    NoneOf(Vec<DocPredicate>),
    Field { path: Vec<String>, test: ValueTest },
}

#[derive(Debug, Clone, Copy)]
enum CmpOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone)]
enum ValueTest {
    Eq(Value),
    Ne(Value),
    Cmp(CmpOp, Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Size(Option<usize>),
    All(Vec<Value>),
    ElemMatch(Box<ElementMatcher>),
    Not(Vec<ValueTest>),
    Regex(Regex),
    Mod(f64, f64),
    Every(Vec<ValueTest>),
}

impl Matcher {
    /// Compiles a selector.
    ///
    /// A string selector is shorthand for `{_id: <string>}`; `null` matches
    /// nothing.
    pub fn new(selector: &Value) -> Result<Self> {
        let (root, ids) = match selector {
            Value::String(id) => (
                DocPredicate::Field {
                    path: vec![ID_FIELD.to_string()],
                    test: ValueTest::Eq(selector.clone()),
                },
                Some(vec![DocumentId::new(id.clone())]),
            ),
            Value::Null => (DocPredicate::Nothing, Some(Vec::new())),
            Value::Object(map) => (compile_document(map)?, ids_in_selector(map)),
            other => {
                return Err(Error::invalid_selector(format!(
                    "selector must be an object or an id, got {}",
                    other
                )))
            }
        };
        Ok(Self {
            selector: selector.clone(),
            root,
            ids,
        })
    }

    /// Returns the selector this matcher was compiled from.
    #[inline]
    pub fn selector(&self) -> &Value {
        &self.selector
    }

    /// Tests a document.
    pub fn document_matches(&self, doc: &Document) -> bool {
        self.root.matches(doc)
    }

    /// Returns the ids the selector is restricted to, if it pins `_id` to
    /// specific values.
    pub fn ids_matched(&self) -> Option<&[DocumentId]> {
        self.ids.as_deref()
    }
}

/// Test applied to array elements by `$elemMatch` and `$pull`.
#[derive(Debug, Clone)]
pub enum ElementMatcher {
    /// Operator object such as `{$gte: 5}` applied to the element itself.
    Value(Vec<ValueTestBox>),
    /// Sub-document selector; the element must be an object.
    Document(Box<Matcher>),
    /// Plain equality.
    Equals(Value),
}

/// Opaque compiled value test.
#[derive(Debug, Clone)]
pub struct ValueTestBox(ValueTest);

impl ElementMatcher {
    /// Compiles an element selector.
    pub fn new(arg: &Value) -> Result<Self> {
        match arg {
            Value::Object(map) if is_element_operator_object(map)? => Ok(ElementMatcher::Value(
                vec![ValueTestBox(compile_operators(map)?)],
            )),
            Value::Object(_) => Ok(ElementMatcher::Document(Box::new(Matcher::new(arg)?))),
            other => Ok(ElementMatcher::Equals(other.clone())),
        }
    }

    /// Tests one array element.
    pub fn matches(&self, element: &Value) -> bool {
        match self {
            ElementMatcher::Value(tests) => tests.iter().all(|t| t.0.matches(&[Some(element)])),
            ElementMatcher::Document(matcher) => match element {
                Value::Object(map) => matcher.document_matches(map),
                _ => false,
            },
            ElementMatcher::Equals(value) => values_equal(value, element),
        }
    }
}

fn is_element_operator_object(map: &Map<String, Value>) -> Result<bool> {
    if map.keys().any(|k| matches!(k.as_str(), "$and" | "$or" | "$nor")) {
        return Ok(false);
    }
    is_operator_object(map)
}

fn is_operator_object(map: &Map<String, Value>) -> Result<bool> {
    let operators = map.keys().filter(|k| k.starts_with('$')).count();
    if operators == 0 {
        return Ok(false);
    }
    if operators != map.len() {
        return Err(Error::invalid_selector(format!(
            "inconsistent operator: {}",
            Value::Object(map.clone())
        )));
    }
    Ok(true)
}

fn ids_in_selector(map: &Map<String, Value>) -> Option<Vec<DocumentId>> {
    match map.get(ID_FIELD)? {
        Value::String(id) => Some(vec![DocumentId::new(id.clone())]),
        Value::Object(ops) if ops.len() == 1 => match ops.get("$in")? {
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_str().map(DocumentId::from))
                .collect(),
            _ => None,
        },
        _ => None,
    }
}

fn compile_document(selector: &Map<String, Value>) -> Result<DocPredicate> {
    if selector.is_empty() {
        return Ok(DocPredicate::Everything);
    }

    let mut predicates = Vec::with_capacity(selector.len());
    for (key, sub) in selector {
        if key.starts_with('$') {
            match key.as_str() {
                "$and" => predicates.push(DocPredicate::All(compile_clauses(key, sub)?)),
                "$or" => predicates.push(DocPredicate::Any(compile_clauses(key, sub)?)),
                "$nor" => predicates.push(DocPredicate::NoneOf(compile_clauses(key, sub)?)),
                "$comment" => {}
                other => {
                    return Err(Error::invalid_selector(format!(
                        "unrecognized logical operator: {}",
                        other
                    )))
                }
            }
        } else {
            predicates.push(DocPredicate::Field {
                path: split_path(key),
                test: compile_value_selector(sub)?,
            });
        }
    }
    Ok(DocPredicate::All(predicates))
}

fn compile_clauses(op: &str, sub: &Value) -> Result<Vec<DocPredicate>> {
    let clauses = match sub {
        Value::Array(items) if !items.is_empty() => items,
        _ => {
            return Err(Error::invalid_selector(format!(
                "{} must be a non-empty array",
                op
            )))
        }
    };
    clauses
        .iter()
        .map(|clause| match clause {
            Value::Object(map) => compile_document(map),
            other => Err(Error::invalid_selector(format!(
                "{} clauses must be objects, got {}",
                op, other
            ))),
        })
        .collect()
}

fn compile_value_selector(sub: &Value) -> Result<ValueTest> {
    match sub {
        Value::Object(map) if is_operator_object(map)? => compile_operators(map),
        other => Ok(ValueTest::Eq(other.clone())),
    }
}

fn compile_operators(ops: &Map<String, Value>) -> Result<ValueTest> {
    let mut tests = Vec::with_capacity(ops.len());
    for (op, arg) in ops {
        let test = match op.as_str() {
            "$eq" => ValueTest::Eq(arg.clone()),
            "$ne" => ValueTest::Ne(arg.clone()),
            "$gt" => ValueTest::Cmp(CmpOp::Gt, arg.clone()),
            "$gte" => ValueTest::Cmp(CmpOp::Gte, arg.clone()),
            "$lt" => ValueTest::Cmp(CmpOp::Lt, arg.clone()),
            "$lte" => ValueTest::Cmp(CmpOp::Lte, arg.clone()),
            "$in" => ValueTest::In(array_arg(op, arg)?.clone()),
            "$nin" => ValueTest::Nin(array_arg(op, arg)?.clone()),
            "$all" => ValueTest::All(array_arg(op, arg)?.clone()),
            "$exists" => ValueTest::Exists(is_truthy(arg)),
            "$size" => ValueTest::Size(
                arg.as_f64()
                    .filter(|n| *n >= 0.0 && n.fract() == 0.0)
                    .map(|n| n as usize),
            ),
            "$elemMatch" => match arg {
                Value::Object(_) => ValueTest::ElemMatch(Box::new(ElementMatcher::new(arg)?)),
                _ => return Err(Error::invalid_selector("$elemMatch needs an object")),
            },
            "$not" => match arg {
                Value::Object(inner) if is_operator_object(inner)? => {
                    ValueTest::Not(vec![compile_operators(inner)?])
                }
                _ => return Err(Error::invalid_selector("$not needs an operator object")),
            },
            "$regex" => {
                let options = ops.get("$options").and_then(Value::as_str).unwrap_or("");
                ValueTest::Regex(compile_regex(arg, options)?)
            }
            "$options" => {
                if !ops.contains_key("$regex") {
                    return Err(Error::invalid_selector("$options needs a $regex"));
                }
                continue;
            }
            "$mod" => compile_mod(arg)?,
            other => {
                return Err(Error::invalid_selector(format!(
                    "unrecognized operator: {}",
                    other
                )))
            }
        };
        tests.push(test);
    }
    Ok(ValueTest::Every(tests))
}

fn array_arg<'a>(op: &str, arg: &'a Value) -> Result<&'a Vec<Value>> {
    arg.as_array()
        .ok_or_else(|| Error::invalid_selector(format!("{} needs an array", op)))
}

fn compile_regex(pattern: &Value, options: &str) -> Result<Regex> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| Error::invalid_selector("$regex needs a string pattern"))?;
    let mut builder = RegexBuilder::new(pattern);
    for flag in options.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            other => {
                return Err(Error::invalid_selector(format!(
                    "unsupported $options flag: {}",
                    other
                )))
            }
        };
    }
    builder
        .build()
        .map_err(|e| Error::invalid_selector(format!("bad $regex: {}", e)))
}

fn compile_mod(arg: &Value) -> Result<ValueTest> {
    let parts = arg.as_array().filter(|a| a.len() == 2);
    let parsed = parts.and_then(|a| Some((a[0].as_f64()?, a[1].as_f64()?)));
    match parsed {
        Some((divisor, remainder)) if divisor != 0.0 => Ok(ValueTest::Mod(divisor, remainder)),
        _ => Err(Error::invalid_selector(
            "$mod needs an array of a non-zero divisor and a remainder",
        )),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

impl DocPredicate {
    fn matches(&self, doc: &Document) -> bool {
        match self {
            DocPredicate::Everything => true,
            DocPredicate::Nothing => false,
            DocPredicate::All(preds) => preds.iter().all(|p| p.matches(doc)),
            DocPredicate::Any(preds) => preds.iter().any(|p| p.matches(doc)),
            DocPredicate::NoneOf(preds) => !preds.iter().any(|p| p.matches(doc)),
            DocPredicate::Field { path, test } => test.matches(&lookup(doc, path)),
        }
    }
}

fn equals_any(branches: &[Option<&Value>], operand: &Value) -> bool {
    let expanded = expand_arrays(branches);
    if operand.is_null() {
        return expanded.iter().any(|b| b.map_or(true, Value::is_null));
    }
    expanded
        .iter()
        .any(|b| b.map_or(false, |v| values_equal(v, operand)))
}

impl ValueTest {
    fn matches(&self, branches: &[Option<&Value>]) -> bool {
        match self {
            ValueTest::Eq(operand) => equals_any(branches, operand),
            ValueTest::Ne(operand) => !equals_any(branches, operand),
            ValueTest::In(operands) => operands.iter().any(|o| equals_any(branches, o)),
            ValueTest::Nin(operands) => !operands.iter().any(|o| equals_any(branches, o)),
            ValueTest::Cmp(op, operand) => {
                let expanded = expand_arrays(branches);
                if operand.is_null() {
                    return matches!(op, CmpOp::Gte | CmpOp::Lte)
                        && expanded.iter().any(|b| b.map_or(true, Value::is_null));
                }
                expanded.iter().flatten().any(|value| {
                    if type_order(value) != type_order(operand) {
                        return false;
                    }
                    let ord = compare_values(value, operand);
                    match op {
                        CmpOp::Gt => ord == Ordering::Greater,
                        CmpOp::Gte => ord != Ordering::Less,
                        CmpOp::Lt => ord == Ordering::Less,
                        CmpOp::Lte => ord != Ordering::Greater,
                    }
                })
            }
            ValueTest::Exists(expected) => branches.iter().any(Option::is_some) == *expected,
            ValueTest::Size(size) => branches.iter().flatten().any(|v| match (v, size) {
                (Value::Array(items), Some(n)) => items.len() == *n,
                _ => false,
            }),
            ValueTest::All(operands) => {
                !operands.is_empty() && operands.iter().all(|o| equals_any(branches, o))
            }
            ValueTest::ElemMatch(element) => branches.iter().flatten().any(|v| match v {
                Value::Array(items) => items.iter().any(|item| element.matches(item)),
                _ => false,
            }),
            ValueTest::Not(tests) => !tests.iter().all(|t| t.matches(branches)),
            ValueTest::Regex(re) => expand_arrays(branches)
                .iter()
                .flatten()
                .any(|v| v.as_str().map_or(false, |s| re.is_match(s))),
            ValueTest::Mod(divisor, remainder) => expand_arrays(branches)
                .iter()
                .flatten()
                .any(|v| v.as_f64().map_or(false, |x| x % divisor == *remainder)),
            ValueTest::Every(tests) => tests.iter().all(|t| t.matches(branches)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livedata_core::value::to_document;
    use serde_json::json;

    fn matches(selector: Value, doc: Value) -> bool {
        Matcher::new(&selector)
            .unwrap()
            .document_matches(&to_document(doc).unwrap())
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        assert!(matches(json!({}), json!({"_id": "a"})));
    }

    #[test]
    fn test_id_shorthand() {
        assert!(matches(json!("a"), json!({"_id": "a"})));
        assert!(!matches(json!("a"), json!({"_id": "b"})));
        assert!(!matches(json!(null), json!({"_id": "a"})));
    }

    #[test]
    fn test_equality() {
        assert!(matches(json!({"status": "open"}), json!({"status": "open"})));
        assert!(!matches(json!({"status": "open"}), json!({"status": "closed"})));
        assert!(matches(json!({"n": 1}), json!({"n": 1.0})));
        assert!(matches(json!({"a": {"b": 1}}), json!({"a": {"b": 1}})));
    }

    #[test]
    fn test_equality_array_expansion() {
        assert!(matches(json!({"tags": "x"}), json!({"tags": ["y", "x"]})));
        assert!(matches(json!({"tags": ["y", "x"]}), json!({"tags": ["y", "x"]})));
        assert!(!matches(json!({"tags": "z"}), json!({"tags": ["y", "x"]})));
    }

    #[test]
    fn test_null_matches_missing() {
        assert!(matches(json!({"a": null}), json!({"b": 1})));
        assert!(matches(json!({"a": null}), json!({"a": null})));
        assert!(!matches(json!({"a": null}), json!({"a": 0})));
    }

    #[test]
    fn test_nested_path_through_array() {
        let doc = json!({"items": [{"qty": 1}, {"qty": 7}]});
        assert!(matches(json!({"items.qty": 7}), doc.clone()));
        assert!(matches(json!({"items.qty": {"$gt": 5}}), doc.clone()));
        assert!(!matches(json!({"items.qty": {"$gt": 10}}), doc));
    }

    #[test]
    fn test_comparisons_same_type_only() {
        assert!(matches(json!({"n": {"$gt": 3}}), json!({"n": 5})));
        assert!(!matches(json!({"n": {"$gt": 3}}), json!({"n": "5"})));
        assert!(matches(json!({"n": {"$gte": 3, "$lt": 4}}), json!({"n": 3})));
        assert!(!matches(json!({"n": {"$lt": 3}}), json!({"m": 1})));
        assert!(matches(json!({"s": {"$lt": "b"}}), json!({"s": "a"})));
    }

    #[test]
    fn test_ne_and_nin() {
        assert!(matches(json!({"a": {"$ne": 1}}), json!({"a": 2})));
        assert!(matches(json!({"a": {"$ne": 1}}), json!({})));
        assert!(!matches(json!({"a": {"$ne": 1}}), json!({"a": [1, 2]})));
        assert!(matches(json!({"a": {"$nin": [1, 2]}}), json!({"a": 3})));
        assert!(!matches(json!({"a": {"$nin": [1, 2]}}), json!({"a": 2})));
    }

    #[test]
    fn test_in() {
        assert!(matches(json!({"a": {"$in": [1, "x"]}}), json!({"a": "x"})));
        assert!(matches(json!({"a": {"$in": [null]}}), json!({})));
        assert!(!matches(json!({"a": {"$in": []}}), json!({"a": 1})));
    }

    #[test]
    fn test_exists_and_size() {
        assert!(matches(json!({"a": {"$exists": true}}), json!({"a": null})));
        assert!(matches(json!({"a": {"$exists": false}}), json!({"b": 1})));
        assert!(!matches(json!({"a": {"$exists": 0}}), json!({"a": 1})));
        assert!(matches(json!({"a": {"$size": 2}}), json!({"a": [1, 2]})));
        assert!(!matches(json!({"a": {"$size": 2}}), json!({"a": [1]})));
        assert!(!matches(json!({"a": {"$size": "2"}}), json!({"a": [1, 2]})));
    }

    #[test]
    fn test_all() {
        assert!(matches(json!({"a": {"$all": [1, 3]}}), json!({"a": [1, 2, 3]})));
        assert!(!matches(json!({"a": {"$all": [1, 4]}}), json!({"a": [1, 2, 3]})));
        assert!(!matches(json!({"a": {"$all": []}}), json!({"a": [1]})));
    }

    #[test]
    fn test_elem_match() {
        let doc = json!({"r": [{"k": "a", "v": 1}, {"k": "b", "v": 5}]});
        assert!(matches(json!({"r": {"$elemMatch": {"k": "b", "v": {"$gt": 2}}}}), doc.clone()));
        assert!(!matches(json!({"r": {"$elemMatch": {"k": "a", "v": {"$gt": 2}}}}), doc));
        assert!(matches(
            json!({"n": {"$elemMatch": {"$gte": 80, "$lt": 85}}}),
            json!({"n": [70, 82, 90]})
        ));
    }

    #[test]
    fn test_not_regex_mod() {
        assert!(matches(json!({"a": {"$not": {"$gt": 5}}}), json!({"a": 3})));
        assert!(!matches(json!({"a": {"$not": {"$gt": 5}}}), json!({"a": 9})));
        assert!(matches(json!({"name": {"$regex": "^al", "$options": "i"}}), json!({"name": "Alice"})));
        assert!(!matches(json!({"name": {"$regex": "^al"}}), json!({"name": "Alice"})));
        assert!(matches(json!({"n": {"$mod": [4, 1]}}), json!({"n": 9})));
        assert!(!matches(json!({"n": {"$mod": [4, 1]}}), json!({"n": 8})));
    }

    #[test]
    fn test_logical_operators() {
        let doc = json!({"a": 1, "b": 2});
        assert!(matches(json!({"$or": [{"a": 5}, {"b": 2}]}), doc.clone()));
        assert!(!matches(json!({"$and": [{"a": 1}, {"b": 3}]}), doc.clone()));
        assert!(matches(json!({"$nor": [{"a": 5}, {"b": 5}]}), doc.clone()));
        assert!(!matches(json!({"$nor": [{"a": 1}]}), doc));
    }

    #[test]
    fn test_invalid_selectors() {
        assert!(Matcher::new(&json!({"a": {"$bogus": 1}})).is_err());
        assert!(Matcher::new(&json!({"a": {"$gt": 1, "b": 2}})).is_err());
        assert!(Matcher::new(&json!({"$or": []})).is_err());
        assert!(Matcher::new(&json!({"$where": "1"})).is_err());
        assert!(Matcher::new(&json!({"a": {"$in": 5}})).is_err());
        assert!(Matcher::new(&json!({"a": {"$mod": [0, 1]}})).is_err());
        assert!(Matcher::new(&json!([1])).is_err());
        assert!(Matcher::new(&json!({"a": {"$regex": "("}})).is_err());
    }

    #[test]
    fn test_ids_matched() {
        let m = Matcher::new(&json!({"_id": "x", "a": 1})).unwrap();
        assert_eq!(m.ids_matched(), Some(&[DocumentId::from("x")][..]));

        let m = Matcher::new(&json!({"_id": {"$in": ["x", "y"]}})).unwrap();
        assert_eq!(m.ids_matched().map(|ids| ids.len()), Some(2));

        let m = Matcher::new(&json!({"a": 1})).unwrap();
        assert!(m.ids_matched().is_none());
    }

    #[test]
    fn test_element_matcher() {
        let em = ElementMatcher::new(&json!({"$gte": 6})).unwrap();
        assert!(em.matches(&json!(7)));
        assert!(!em.matches(&json!(5)));

        let em = ElementMatcher::new(&json!({"k": "a"})).unwrap();
        assert!(em.matches(&json!({"k": "a", "z": 1})));
        assert!(!em.matches(&json!("a")));

        let em = ElementMatcher::new(&json!(3)).unwrap();
        assert!(em.matches(&json!(3.0)));
    }
}
