//! Purpose: Table schema stored next to a key-value table as `<table>/.#schema`.
//! Exports: `Schema`, `SchemaField`, `FieldType`, `SCHEMA_OBJECT`.
//! Role: The writer merges each frame's shape into it; readers use the key field.
//! Invariants: Types only widen along `long -> double -> string`; a failed merge
//! leaves the schema unchanged.
//! Invariants: Key and sorting key may only be set while the schema has no fields.
use serde::{Deserialize, Serialize};

use super::store::{ItemStore, StoreError};
use crate::core::dtype::{DType, Value};
use crate::core::error::{Error, ErrorKind};

pub const SCHEMA_OBJECT: &str = ".#schema";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Long,
    Double,
    String,
    Timestamp,
    Boolean,
}

impl FieldType {
    pub fn of(dtype: DType) -> FieldType {
        match dtype {
            DType::Int64 => FieldType::Long,
            DType::Float64 => FieldType::Double,
            DType::String => FieldType::String,
            DType::TimestampNs => FieldType::Timestamp,
            DType::Bool => FieldType::Boolean,
        }
    }

    pub fn of_value(value: &Value) -> FieldType {
        FieldType::of(value.dtype())
    }

    pub fn dtype(self) -> DType {
        match self {
            FieldType::Long => DType::Int64,
            FieldType::Double => DType::Float64,
            FieldType::String => DType::String,
            FieldType::Timestamp => DType::TimestampNs,
            FieldType::Boolean => DType::Bool,
        }
    }

    /// Least upper bound in `long ⊑ double ⊑ string`; `None` when undefined.
    pub fn join(self, other: FieldType) -> Option<FieldType> {
        use FieldType::{Double, Long, String};
        match (self, other) {
            (left, right) if left == right => Some(left),
            (Long, Double) | (Double, Long) => Some(Double),
            (Long | Double, String) | (String, Long | Double) => Some(String),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FieldType::Long => "long",
            FieldType::Double => "double",
            FieldType::String => "string",
            FieldType::Timestamp => "timestamp",
            FieldType::Boolean => "boolean",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldType,
    #[serde(default)]
    pub nullable: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub fields: Vec<SchemaField>,
    #[serde(default)]
    pub key: String,
    #[serde(rename = "sortingKey", default, skip_serializing_if = "String::is_empty")]
    pub sorting_key: String,
    #[serde(rename = "hashingBucketNum", default, skip_serializing_if = "is_zero")]
    pub hashing_bucket_num: u32,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl Schema {
    pub fn new(key: impl Into<String>, sorting_key: impl Into<String>) -> Schema {
        Schema {
            fields: Vec::new(),
            key: key.into(),
            sorting_key: sorting_key.into(),
            hashing_bucket_num: 0,
        }
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Adds `name`, or widens an existing field of that name.
    pub fn add_field(&mut self, name: &str, kind: FieldType, nullable: bool) -> Result<(), Error> {
        match self.fields.iter_mut().find(|field| field.name == name) {
            Some(field) => {
                field.kind = field.kind.join(kind).ok_or_else(|| type_change(name, field.kind, kind))?;
                field.nullable |= nullable;
            }
            None => self.fields.push(SchemaField {
                name: name.to_string(),
                kind,
                nullable,
            }),
        }
        Ok(())
    }

    /// Merges `new` into `self`; returns whether anything changed.
    pub fn merge(&mut self, new: &Schema) -> Result<bool, Error> {
        let mut merged = self.clone();
        let is_first = self.fields.is_empty();
        let mut changed = false;

        for field in &new.fields {
            match merged.fields.iter_mut().find(|existing| existing.name == field.name) {
                None => {
                    merged.fields.push(field.clone());
                    changed = true;
                }
                Some(existing) => {
                    let joined = existing
                        .kind
                        .join(field.kind)
                        .ok_or_else(|| type_change(&field.name, existing.kind, field.kind))?;
                    if joined != existing.kind {
                        existing.kind = joined;
                        changed = true;
                    }
                }
            }
        }

        if !new.key.is_empty() && merged.key != new.key {
            if !is_first {
                return Err(Error::new(ErrorKind::Schema).with_message(format!(
                    "changing primary key is not allowed, old: {}, new: {}",
                    merged.key, new.key
                )));
            }
            merged.key = new.key.clone();
            changed = true;
        }
        if !new.sorting_key.is_empty() && merged.sorting_key != new.sorting_key {
            if !is_first {
                return Err(Error::new(ErrorKind::Schema).with_message(format!(
                    "changing sorting key is not allowed, old: {}, new: {}",
                    merged.sorting_key, new.sorting_key
                )));
            }
            merged.sorting_key = new.sorting_key.clone();
            changed = true;
        }
        if is_first && new.hashing_bucket_num != merged.hashing_bucket_num {
            merged.hashing_bucket_num = new.hashing_bucket_num;
            changed = true;
        }

        *self = merged;
        Ok(changed)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode schema")
                .with_source(err)
        })
    }

    pub fn from_json(data: &[u8]) -> Result<Schema, Error> {
        serde_json::from_slice(data).map_err(|err| {
            Error::new(ErrorKind::Schema)
                .with_message("failed to decode table schema")
                .with_source(err)
        })
    }

    /// Schema stored for the table at `table_path`, `None` when there is none.
    pub async fn load(store: &dyn ItemStore, table_path: &str) -> Result<Option<Schema>, Error> {
        match store.get_object(&schema_path(table_path)).await {
            Ok(body) => Schema::from_json(&body).map(Some),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(store_failure("failed to read schema", err)),
        }
    }

    pub async fn store(&self, store: &dyn ItemStore, table_path: &str) -> Result<(), Error> {
        store
            .put_object(&schema_path(table_path), self.to_json()?)
            .await
            .map_err(|err| store_failure("failed to update schema", err))
    }

    /// Merges and persists only when the merge changed something.
    pub async fn update(
        &mut self,
        store: &dyn ItemStore,
        table_path: &str,
        new: &Schema,
    ) -> Result<bool, Error> {
        let changed = self.merge(new)?;
        if changed {
            self.store(store, table_path).await?;
        }
        Ok(changed)
    }
}

pub fn schema_path(table_path: &str) -> String {
    if table_path.ends_with('/') {
        format!("{table_path}{SCHEMA_OBJECT}")
    } else {
        format!("{table_path}/{SCHEMA_OBJECT}")
    }
}

fn store_failure(context: &str, err: StoreError) -> Error {
    let message = if err.status == 401 || err.status == 403 {
        format!("{context}: unauthorized ({}), check the session credentials", err.status)
    } else {
        format!("{context}: {}", err.message)
    };
    Error::from(err).with_message(message)
}

fn type_change(name: &str, from: FieldType, to: FieldType) -> Error {
    Error::new(ErrorKind::Schema).with_message(format!(
        "schema change for column {name} from type {} to {} is not allowed",
        from.name(),
        to.name()
    ))
}

#[cfg(test)]
mod tests {
    use super::{FieldType, Schema, schema_path};
    use crate::backends::kv::memory::MemoryContainer;
    use crate::core::error::ErrorKind;

    fn schema(fields: &[(&str, FieldType)], key: &str) -> Schema {
        let mut schema = Schema::new(key, "");
        for (name, kind) in fields {
            schema.add_field(name, *kind, *name != key).expect("field");
        }
        schema
    }

    #[test]
    fn join_follows_the_widening_lattice() {
        assert_eq!(FieldType::Long.join(FieldType::Double), Some(FieldType::Double));
        assert_eq!(FieldType::Double.join(FieldType::String), Some(FieldType::String));
        assert_eq!(FieldType::Long.join(FieldType::Long), Some(FieldType::Long));
        assert_eq!(FieldType::Boolean.join(FieldType::Long), None);
        assert_eq!(FieldType::Timestamp.join(FieldType::String), None);
    }

    #[test]
    fn merge_appends_widens_and_reports_changes() {
        let mut current = schema(&[("idx", FieldType::Long), ("n", FieldType::Long)], "idx");
        let unchanged = schema(&[("n", FieldType::Long)], "idx");
        assert!(!current.merge(&unchanged).expect("same"));

        let wider = schema(&[("n", FieldType::Double), ("s", FieldType::String)], "idx");
        assert!(current.merge(&wider).expect("widen"));
        assert_eq!(current.field("n").expect("n").kind, FieldType::Double);
        assert!(current.field("s").is_some());

        let narrower = schema(&[("n", FieldType::Long)], "idx");
        assert!(!current.merge(&narrower).expect("narrower input keeps wider type"));
        assert_eq!(current.field("n").expect("n").kind, FieldType::Double);
    }

    #[test]
    fn failed_merge_leaves_schema_untouched() {
        let mut current = schema(&[("idx", FieldType::Long), ("flag", FieldType::Boolean)], "idx");
        let before = current.clone();
        let bad = schema(&[("extra", FieldType::Long), ("flag", FieldType::Long)], "idx");
        let err = current.merge(&bad).expect_err("bool to long");
        assert_eq!(err.kind(), ErrorKind::Schema);
        assert_eq!(current, before);
    }

    #[test]
    fn key_changes_only_on_first_schema() {
        let mut first = Schema::new("idx", "");
        assert!(first.merge(&schema(&[("name", FieldType::String)], "name")).expect("first"));
        assert_eq!(first.key, "name");

        let err = first
            .merge(&schema(&[("name", FieldType::String)], "other"))
            .expect_err("key change");
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[test]
    fn json_uses_field_type_names() {
        let mut current = schema(&[("name", FieldType::String), ("age", FieldType::Long)], "name");
        current.hashing_bucket_num = 64;
        let json = String::from_utf8(current.to_json().expect("json")).expect("utf8");
        assert!(json.contains(r#""type":"long""#));
        assert!(json.contains(r#""hashingBucketNum":64"#));
        assert!(!json.contains("sortingKey"));
        assert_eq!(Schema::from_json(json.as_bytes()).expect("decode"), current);
    }

    #[tokio::test]
    async fn update_persists_only_on_change() {
        let store = MemoryContainer::new(10);
        let mut current = Schema::new("idx", "");
        let new = schema(&[("idx", FieldType::Long)], "idx");
        assert!(current.update(&store, "t/", &new).await.expect("first write"));
        assert_eq!(
            Schema::load(&store, "t/").await.expect("load"),
            Some(current.clone())
        );
        assert!(!current.update(&store, "t/", &new).await.expect("no change"));
        assert_eq!(schema_path("t"), "t/.#schema");
        assert_eq!(Schema::load(&store, "missing/").await.expect("none"), None);
    }
}
