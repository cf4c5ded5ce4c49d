//! Update modifiers.
//!
//! [`apply_modifier`] never mutates its input: the modifier is applied to a
//! copy, which is returned only if every operator succeeded and the `_id`
//! is unchanged.

use core::cmp::Ordering;

use livedata_core::value::{compare_values, values_equal, ID_FIELD};
use livedata_core::{Document, Error, Result};
use serde_json::{Map, Number, Value};

use crate::matcher::ElementMatcher;
use crate::path::{is_numeric_key, split_path};

/// Options for [`apply_modifier`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ModifyOptions {
    /// The document is being created by an upsert; enables `$setOnInsert`.
    pub is_insert: bool,
}

/// Returns true if `modifier` consists of update operators, false if it is
/// a replacement document.
pub fn is_modifier(modifier: &Value) -> Result<bool> {
    let map = modifier
        .as_object()
        .ok_or_else(|| Error::invalid_modifier("modifier must be an object"))?;
    let operators = map.keys().filter(|k| k.starts_with('$')).count();
    if operators > 0 && operators != map.len() {
        return Err(Error::invalid_modifier(
            "update cannot mix operators and plain fields",
        ));
    }
    Ok(operators > 0)
}

/// Applies an update modifier or replacement to a copy of `doc`.
pub fn apply_modifier(doc: &Document, modifier: &Value, options: ModifyOptions) -> Result<Document> {
    if !is_modifier(modifier)? {
        return replace_document(doc, modifier);
    }

    let mut target = Value::Object(doc.clone());
    let ops = modifier.as_object().into_iter().flatten();
    for (op, args) in ops {
        let fields = args
            .as_object()
            .ok_or_else(|| Error::invalid_modifier(format!("{} must be given an object", op)))?;
        for (field, arg) in fields {
            if field.is_empty() {
                return Err(Error::invalid_modifier("empty field name"));
            }
            if field == ID_FIELD || field.starts_with("_id.") {
                return Err(Error::invalid_modifier(format!(
                    "mod on _id not allowed ({})",
                    op
                )));
            }
            apply_operator(&mut target, op, &split_path(field), arg, options)?;
        }
    }

    match target {
        Value::Object(map) => Ok(map),
        _ => Err(Error::invariant("modifier target stopped being an object")),
    }
}

/// Builds the document an upsert inserts when nothing matched.
///
/// Equality clauses of the selector seed the document, then the modifier is
/// applied with `$setOnInsert` enabled.
pub fn upsert_document(selector: &Value, modifier: &Value) -> Result<Document> {
    let mut seed = Value::Object(Map::new());
    match selector {
        Value::String(id) => {
            set_at(&mut seed, &[ID_FIELD.to_string()], Value::String(id.clone()))?;
        }
        Value::Object(map) => {
            for (key, value) in map {
                if key.starts_with('$') {
                    continue;
                }
                let is_operator = value
                    .as_object()
                    .map_or(false, |o| o.keys().any(|k| k.starts_with('$')));
                if !is_operator {
                    set_at(&mut seed, &split_path(key), value.clone())?;
                }
            }
        }
        _ => {}
    }
    let seed = match seed {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    if is_modifier(modifier)? {
        apply_modifier(&seed, modifier, ModifyOptions { is_insert: true })
    } else {
        let mut doc = replace_document(&Map::new(), modifier)?;
        if let Some(id) = seed.get(ID_FIELD) {
            doc.insert(ID_FIELD.to_string(), id.clone());
        }
        Ok(doc)
    }
}

fn replace_document(doc: &Document, replacement: &Value) -> Result<Document> {
    let mut new_doc = replacement
        .as_object()
        .cloned()
        .ok_or_else(|| Error::invalid_modifier("replacement must be an object"))?;
    match (doc.get(ID_FIELD), new_doc.get(ID_FIELD)) {
        (Some(old), Some(new)) if !values_equal(old, new) => {
            return Err(Error::invalid_modifier("the _id field cannot be changed"))
        }
        (Some(old), None) => {
            let old = old.clone();
            new_doc.insert(ID_FIELD.to_string(), old);
        }
        _ => {}
    }
    Ok(new_doc)
}

fn apply_operator(
    target: &mut Value,
    op: &str,
    parts: &[String],
    arg: &Value,
    options: ModifyOptions,
) -> Result<()> {
    match op {
        "$set" => set_at(target, parts, arg.clone()),
        "$setOnInsert" => {
            if options.is_insert {
                set_at(target, parts, arg.clone())?;
            }
            Ok(())
        }
        "$unset" => {
            if let Some((container, key)) = locate(target, parts, false)? {
                unset_field(container, key);
            }
            Ok(())
        }
        "$inc" | "$mul" => {
            let Value::Number(operand) = arg else {
                return Err(Error::invalid_modifier(format!("{} needs a number", op)));
            };
            let (container, key) = locate_required(target, parts)?;
            let updated = match get_field(container, key) {
                None if op == "$inc" => Value::Number(operand.clone()),
                None => Value::from(0),
                Some(Value::Number(current)) => {
                    if op == "$inc" {
                        add_numbers(current, operand)
                    } else {
                        mul_numbers(current, operand)
                    }
                }
                Some(_) => {
                    return Err(Error::invalid_modifier(format!(
                        "cannot apply {} to a non-number field",
                        op
                    )))
                }
            };
            set_field(container, key, updated)
        }
        "$min" | "$max" => {
            let (container, key) = locate_required(target, parts)?;
            let replace = match get_field(container, key) {
                None => true,
                Some(current) => {
                    let ord = compare_values(arg, current);
                    if op == "$min" {
                        ord == Ordering::Less
                    } else {
                        ord == Ordering::Greater
                    }
                }
            };
            if replace {
                set_field(container, key, arg.clone())?;
            }
            Ok(())
        }
        "$rename" => {
            let to = arg
                .as_str()
                .ok_or_else(|| Error::invalid_modifier("$rename target must be a string"))?;
            let to_parts = split_path(to);
            if to_parts == parts {
                return Err(Error::invalid_modifier("$rename source and target are equal"));
            }
            let moved = match locate(target, parts, false)? {
                Some((container, key)) => take_field(container, key),
                None => None,
            };
            if let Some(value) = moved {
                set_at(target, &to_parts, value)?;
            }
            Ok(())
        }
        "$push" | "$addToSet" => {
            let values = match arg {
                Value::Object(map) if map.contains_key("$each") => map
                    .get("$each")
                    .and_then(Value::as_array)
                    .cloned()
                    .ok_or_else(|| Error::invalid_modifier("$each needs an array"))?,
                other => vec![other.clone()],
            };
            let (container, key) = locate_required(target, parts)?;
            let mut items = match get_field(container, key) {
                None => Vec::new(),
                Some(Value::Array(items)) => items.clone(),
                Some(_) => {
                    return Err(Error::invalid_modifier(format!(
                        "cannot apply {} to a non-array field",
                        op
                    )))
                }
            };
            for value in values {
                if op == "$addToSet" && items.iter().any(|v| values_equal(v, &value)) {
                    continue;
                }
                items.push(value);
            }
            set_field(container, key, Value::Array(items))
        }
        "$pop" | "$pull" | "$pullAll" => {
            let Some((container, key)) = locate(target, parts, false)? else {
                return Ok(());
            };
            let mut items = match get_field(container, key) {
                None => return Ok(()),
                Some(Value::Array(items)) => items.clone(),
                Some(_) => {
                    return Err(Error::invalid_modifier(format!(
                        "cannot apply {} to a non-array field",
                        op
                    )))
                }
            };
            match op {
                "$pop" => {
                    let from_front = arg.as_f64().map_or(false, |n| n < 0.0);
                    if !items.is_empty() {
                        if from_front {
                            items.remove(0);
                        } else {
                            items.pop();
                        }
                    }
                }
                "$pull" => {
                    let element = ElementMatcher::new(arg)?;
                    items.retain(|item| !element.matches(item));
                }
                _ => {
                    let pulled = arg
                        .as_array()
                        .ok_or_else(|| Error::invalid_modifier("$pullAll needs an array"))?;
                    items.retain(|item| !pulled.iter().any(|p| values_equal(p, item)));
                }
            }
            set_field(container, key, Value::Array(items))
        }
        other => Err(Error::invalid_modifier(format!(
            "unknown modifier: {}",
            other
        ))),
    }
}

fn set_at(target: &mut Value, parts: &[String], value: Value) -> Result<()> {
    let (container, key) = locate_required(target, parts)?;
    set_field(container, key, value)
}

fn locate_required<'a, 'p>(
    target: &'a mut Value,
    parts: &'p [String],
) -> Result<(&'a mut Value, &'p str)> {
    locate(target, parts, true)?
        .ok_or_else(|| Error::invalid_modifier(format!("cannot reach field {}", parts.join("."))))
}

/// Walks to the container of the last path part, creating intermediate
/// objects when `create` is set.
fn locate<'a, 'p>(
    target: &'a mut Value,
    parts: &'p [String],
    create: bool,
) -> Result<Option<(&'a mut Value, &'p str)>> {
    let Some((last, parents)) = parts.split_last() else {
        return Err(Error::invalid_modifier("empty field path"));
    };
    let mut current = Some(target);
    for part in parents {
        let Some(node) = current.take() else { break };
        current = step(node, part, create)?;
    }
    Ok(current.map(|container| (container, last.as_str())))
}

fn step<'a>(node: &'a mut Value, part: &str, create: bool) -> Result<Option<&'a mut Value>> {
    match node {
        Value::Object(map) => {
            if create && !map.contains_key(part) {
                map.insert(part.to_string(), Value::Object(Map::new()));
            }
            Ok(map.get_mut(part))
        }
        Value::Array(items) => {
            if !is_numeric_key(part) {
                return if create {
                    Err(Error::invalid_modifier(format!(
                        "can't append to array using string field name {}",
                        part
                    )))
                } else {
                    Ok(None)
                };
            }
            let index = part
                .parse::<usize>()
                .map_err(|_| Error::invalid_modifier(format!("bad array index {}", part)))?;
            if create {
                while items.len() < index {
                    items.push(Value::Null);
                }
                if items.len() == index {
                    items.push(Value::Object(Map::new()));
                }
            }
            Ok(items.get_mut(index))
        }
        other if create => Err(Error::invalid_modifier(format!(
            "cannot use the part '{}' to traverse {}",
            part, other
        ))),
        _ => Ok(None),
    }
}

fn get_field<'a>(container: &'a Value, key: &str) -> Option<&'a Value> {
    match container {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

fn set_field(container: &mut Value, key: &str, value: Value) -> Result<()> {
    match container {
        Value::Object(map) => {
            map.insert(key.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = key.parse::<usize>().map_err(|_| {
                Error::invalid_modifier(format!(
                    "can't append to array using string field name {}",
                    key
                ))
            })?;
            while items.len() <= index {
                items.push(Value::Null);
            }
            items[index] = value;
            Ok(())
        }
        other => Err(Error::invalid_modifier(format!(
            "cannot set field {} on {}",
            key, other
        ))),
    }
}

fn unset_field(container: &mut Value, key: &str) {
    match container {
        Value::Object(map) => {
            map.remove(key);
        }
        Value::Array(items) => {
            if let Some(slot) = key.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                *slot = Value::Null;
            }
        }
        _ => {}
    }
}

fn take_field(container: &mut Value, key: &str) -> Option<Value> {
    match container {
        Value::Object(map) => map.remove(key),
        _ => None,
    }
}

fn add_numbers(a: &Number, b: &Number) -> Value {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Value::from(sum);
        }
    }
    float_value(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0))
}

fn mul_numbers(a: &Number, b: &Number) -> Value {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(product) = x.checked_mul(y) {
            return Value::from(product);
        }
    }
    float_value(a.as_f64().unwrap_or(0.0) * b.as_f64().unwrap_or(0.0))
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f).map_or(Value::Null, Value::Number)
}
