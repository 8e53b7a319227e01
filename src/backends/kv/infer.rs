//! Purpose: Derive a table schema from sampled items.
//! Exports: `schema_from_items`, `SAMPLE_ROWS`, `HASHED_BUCKETS`.
//! Role: Backs the `infer`/`infer_schema` exec commands of the kv backend.
//! Invariants: Attribute types fold through the widening lattice; the key is the
//! only attribute whose rendering equals every sampled `__name` (or its parts).
use std::collections::{BTreeMap, BTreeSet};

use super::schema::{FieldType, Schema};
use super::store::{ITEM_NAME, Item};
use super::writer::key_string;
use crate::core::dtype::Value;
use crate::core::error::{Error, ErrorKind};

/// Items sampled when inferring a schema.
pub const SAMPLE_ROWS: usize = 10;
/// Bucket count assumed for hashed keys; it cannot be observed from item names.
pub const HASHED_BUCKETS: u32 = 64;

/// Tracks, per attribute, whether every sampled value so far matched a key part.
#[derive(Default)]
struct Candidates(BTreeMap<String, bool>);

impl Candidates {
    fn observe(&mut self, name: &str, matches: bool) {
        let entry = self.0.entry(name.to_string()).or_insert(true);
        *entry = *entry && matches;
    }

    fn matching(&self) -> Vec<String> {
        self.0
            .iter()
            .filter(|(_, matches)| **matches)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// `bucketprefix_123`: the primary part of a hashed key.
fn is_hashed_primary(value: &str) -> bool {
    let Some((prefix, bucket)) = value.split_once('_') else {
        return false;
    };
    !prefix.is_empty()
        && prefix.chars().all(|c| c.is_ascii_alphanumeric())
        && !bucket.is_empty()
        && bucket.chars().all(|c| c.is_ascii_digit())
}

struct KeyParts<'a> {
    primary: Option<&'a str>,
    sorting: Option<&'a str>,
    hashed_primary: Option<&'a str>,
}

fn split_item_name(name: &str) -> KeyParts<'_> {
    let mut parts = KeyParts {
        primary: None,
        sorting: None,
        hashed_primary: None,
    };
    if let Some(dot) = name.find('.')
        && dot < name.len() - 1
    {
        let primary = &name[..dot];
        parts.sorting = Some(&name[dot + 1..]);
        if is_hashed_primary(primary) {
            parts.hashed_primary = primary.split_once('_').map(|(prefix, _)| prefix);
        } else {
            parts.primary = Some(primary);
        }
    }
    parts
}

fn type_mismatch(name: &str, previous: &Value, current: &Value) -> Error {
    Error::new(ErrorKind::Schema).with_message(format!(
        "type '{}' of value '{previous}' doesn't match type '{}' of value '{current}' for column '{name}'",
        FieldType::of_value(previous).name(),
        FieldType::of_value(current).name(),
    ))
}

/// Infers key, sorting key and field types from `items`; `key` overrides detection.
pub fn schema_from_items(key: &str, items: &[Item]) -> Result<Schema, Error> {
    let mut types: BTreeMap<String, (FieldType, Value)> = BTreeMap::new();
    let mut full = Candidates::default();
    let mut primary = Candidates::default();
    let mut sorting = Candidates::default();
    let mut hashed = Candidates::default();

    for item in items {
        let item_name = match item.get(ITEM_NAME) {
            Some(Value::String(name)) => name.as_str(),
            _ => {
                return Err(Error::new(ErrorKind::BadRequest)
                    .with_message("sampled item has no object name attribute"));
            }
        };
        let parts = split_item_name(item_name);

        for (name, value) in item {
            if name == ITEM_NAME {
                continue;
            }
            let kind = FieldType::of_value(value);
            let joined = match types.get(name) {
                Some((previous, sample)) => previous
                    .join(kind)
                    .ok_or_else(|| type_mismatch(name, sample, value))?,
                None => kind,
            };
            types.insert(name.clone(), (joined, value.clone()));

            let rendered = key_string(value);
            full.observe(name, rendered == item_name);
            if let Some(part) = parts.primary {
                primary.observe(name, rendered == part);
            }
            if let Some(part) = parts.sorting {
                sorting.observe(name, rendered == part);
            }
            if let Some(part) = parts.hashed_primary {
                hashed.observe(name, rendered == part);
            }
        }
    }

    let mut key_field = key.to_string();
    let mut sorting_field = String::new();
    let mut buckets = 0;
    if key_field.is_empty() {
        let full_keys = full.matching();
        let primary_keys = primary.matching();
        let sorting_keys = sorting.matching();
        let hashed_keys = hashed.matching();

        let mut primary_field = String::new();
        if hashed_keys.len() == 1 {
            primary_field = hashed_keys[0].clone();
            buckets = HASHED_BUCKETS;
        } else if primary_keys.len() == 1 {
            primary_field = primary_keys[0].clone();
        }
        if !primary_field.is_empty() && sorting_keys.len() == 1 {
            sorting_field = sorting_keys[0].clone();
        }

        if !primary_field.is_empty() && !sorting_field.is_empty() {
            key_field = primary_field;
        } else if full_keys.len() == 1 {
            key_field = full_keys[0].clone();
            sorting_field.clear();
        } else {
            let reason = if full_keys.is_empty() {
                "no column matches the primary-key attribute".to_string()
            } else {
                format!(
                    "{} columns ({}) match the primary-key attribute",
                    full_keys.len(),
                    full_keys.join(", ")
                )
            };
            return Err(Error::new(ErrorKind::Schema).with_message(format!(
                "could not determine which column is the table's primary-key attribute, because {reason}"
            )));
        }
    } else if !types.contains_key(&key_field) {
        return Err(Error::new(ErrorKind::Schema).with_message(format!(
            "key column '{key_field}' does not appear in the sampled items"
        )));
    }

    let mut schema = Schema::new(key_field.clone(), sorting_field.clone());
    schema.hashing_bucket_num = buckets;
    let non_nullable: BTreeSet<&str> = [key_field.as_str(), sorting_field.as_str()].into();
    for (name, (kind, _)) in &types {
        schema.add_field(name, *kind, !non_nullable.contains(name.as_str()))?;
    }
    Ok(schema)
}
