//! Purpose: Stream key-value items out as frames.
//! Exports: `read_table`, `ReaderSettings`, `DEFAULT_MESSAGE_LIMIT`.
//! Role: Implements `Backend::read` for the kv backend on top of the items cursor.
//! Invariants: A frame holds at most `message_limit` rows; cells missing from an
//! item are null in the frame's mask.
//! Invariants: Values are widened to the schema's field type when one is known.
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::cursor::{AsyncItemsCursor, CursorOptions};
use super::schema::{FieldType, SCHEMA_OBJECT, Schema};
use super::store::{ITEM_NAME, Item, ItemStore};
use crate::backends::{FrameSink, FrameStream};
use crate::core::dtype::Value;
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{Frame, RowMap};
use crate::core::request::ReadRequest;

pub const DEFAULT_MESSAGE_LIMIT: usize = 256;

#[derive(Clone, Copy, Debug)]
pub struct ReaderSettings {
    pub workers: usize,
}

/// Leaf directories under `path`; a table without sub-directories is its own
/// single partition.
pub async fn partitions(store: &dyn ItemStore, path: &str) -> Result<Vec<String>, Error> {
    let mut pending = vec![path.to_string()];
    let mut leaves = Vec::new();
    while let Some(directory) = pending.pop() {
        let children = store.list_directories(&directory).await.map_err(Error::from)?;
        if children.is_empty() {
            leaves.push(directory);
        } else {
            pending.extend(children.into_iter().rev());
        }
    }
    Ok(leaves)
}

pub async fn read_table(
    store: Arc<dyn ItemStore>,
    table_path: String,
    request: ReadRequest,
    settings: ReaderSettings,
    cancel: CancellationToken,
) -> Result<FrameStream, Error> {
    if !request.group_by.trim().is_empty() {
        return Err(Error::new(ErrorKind::BadRequest)
            .with_message("the kv backend does not support group_by"));
    }
    let schema = Schema::load(store.as_ref(), &table_path).await?.ok_or_else(|| {
        Error::new(ErrorKind::NotFound)
            .with_message(format!("table '{}' not found (no schema)", request.table))
            .with_table(request.table.clone())
    })?;

    let mut columns: Vec<String> = request
        .columns
        .iter()
        .filter(|name| !name.is_empty())
        .cloned()
        .collect();
    if columns.is_empty() {
        columns.push("*".to_string());
    }
    let all_columns = columns.iter().any(|name| name == "*");
    let duplicate_index = !all_columns && columns.contains(&schema.key);
    let mut attributes = columns.clone();
    if !all_columns && columns.contains(&schema.key) {
        attributes.push(ITEM_NAME.to_string());
    }

    let partitions = partitions(store.as_ref(), &table_path).await?;
    let workers = if request.segments > 0 {
        request.segments as usize
    } else {
        settings.workers
    };
    let options = CursorOptions {
        partitions,
        attributes,
        filter: request.filter.clone(),
        sharding_keys: request.sharding_keys.clone(),
        workers,
        sort_key_range_start: request.sort_key_range_start.clone(),
        sort_key_range_end: request.sort_key_range_end.clone(),
        limit: request.limit as usize,
        page_size: 0,
    };
    debug!(table = %table_path, partitions = options.partitions.len(), "kv read");

    let message_limit = match request.message_limit {
        0 => DEFAULT_MESSAGE_LIMIT,
        limit => limit as usize,
    };
    let layout = FrameLayout {
        schema,
        duplicate_index,
        reset_index: request.reset_index,
    };
    let cursor = AsyncItemsCursor::new(store, options, &cancel);
    Ok(FrameStream::spawn(cancel, move |sink| {
        emit_frames(cursor, layout, message_limit, sink)
    }))
}

async fn emit_frames(
    mut cursor: AsyncItemsCursor,
    layout: FrameLayout,
    message_limit: usize,
    sink: FrameSink,
) -> Result<(), Error> {
    let mut rows = Vec::with_capacity(message_limit);
    while let Some(item) = cursor.next_item().await? {
        if let Some(row) = layout.row(item) {
            rows.push(row);
        }
        if rows.len() >= message_limit {
            let frame = layout.frame(&rows)?;
            rows.clear();
            if !sink.send(frame).await {
                return Ok(());
            }
        }
    }
    if !rows.is_empty() {
        sink.send(layout.frame(&rows)?).await;
    }
    Ok(())
}

struct FrameLayout {
    schema: Schema,
    duplicate_index: bool,
    reset_index: bool,
}

impl FrameLayout {
    /// `None` for objects that are not table rows.
    fn row(&self, mut item: Item) -> Option<RowMap> {
        let name = item.remove(ITEM_NAME);
        if matches!(&name, Some(Value::String(name)) if name == SCHEMA_OBJECT) {
            return None;
        }
        if item.is_empty() && name.is_none() {
            return None;
        }
        if !item.contains_key(&self.schema.key)
            && let Some(Value::String(name)) = name
        {
            item.insert(self.schema.key.clone(), self.key_from_name(&name));
        }
        Some(
            item.into_iter()
                .map(|(attribute, value)| {
                    let value = self.widen(&attribute, value);
                    (attribute, value)
                })
                .collect(),
        )
    }

    /// Parses the key part of an item name by the key field's type.
    fn key_from_name(&self, name: &str) -> Value {
        let primary = if self.schema.sorting_key.is_empty() {
            name
        } else {
            name.split_once('.').map(|(primary, _)| primary).unwrap_or(name)
        };
        match self.schema.field(&self.schema.key).map(|field| field.kind) {
            Some(FieldType::Long) => primary
                .parse::<i64>()
                .map(Value::Int)
                .unwrap_or_else(|_| Value::from(primary)),
            Some(FieldType::Double) => primary
                .parse::<f64>()
                .map(Value::Float)
                .unwrap_or_else(|_| Value::from(primary)),
            _ => Value::from(primary),
        }
    }

    fn widen(&self, attribute: &str, value: Value) -> Value {
        match (self.schema.field(attribute).map(|field| field.kind), value) {
            (Some(FieldType::Double), Value::Int(value)) => Value::Float(value as f64),
            (Some(FieldType::String), Value::Int(value)) => Value::String(value.to_string()),
            (Some(FieldType::String), Value::Float(value)) => Value::String(value.to_string()),
            (_, value) => value,
        }
    }

    fn frame(&self, rows: &[RowMap]) -> Result<Frame, Error> {
        let frame = Frame::from_rows(rows, &[])?;
        let key = self.schema.key.as_str();
        let only_key = frame.columns().len() == 1 && frame.columns()[0].name() == key;
        if self.reset_index || only_key || frame.find(key).is_none() {
            return Ok(frame);
        }

        let mut parts = frame.into_parts();
        let Some(position) = parts.columns.iter().position(|column| column.name() == key) else {
            return Frame::from_parts(parts);
        };
        if self.duplicate_index {
            let index = parts.columns[position].with_name(format!("_{key}"));
            parts.indices.push(index);
        } else {
            let index = parts.columns.remove(position);
            parts.indices.push(index);
        }
        Frame::from_parts(parts)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::{ReaderSettings, partitions, read_table};
    use crate::backends::kv::memory::MemoryContainer;
    use crate::backends::kv::schema::{FieldType, Schema};
    use crate::backends::kv::store::{Item, ItemStore, UpdateItemInput};
    use crate::core::dtype::Value;
    use crate::core::error::ErrorKind;
    use crate::core::request::ReadRequest;

    async fn seed(store: &MemoryContainer, count: i64) {
        let mut schema = Schema::new("id", "");
        schema.add_field("id", FieldType::Long, false).expect("id");
        schema.add_field("n", FieldType::Double, true).expect("n");
        schema.add_field("s", FieldType::String, true).expect("s");
        schema.store(store, "t/").await.expect("schema");
        for id in 0..count {
            let mut attributes = Item::new();
            attributes.insert("id".into(), Value::Int(id));
            attributes.insert("n".into(), Value::Int(id * 2));
            if id % 2 == 0 {
                attributes.insert("s".into(), Value::from(format!("s{id}")));
            }
            store
                .update_item(&UpdateItemInput {
                    path: format!("t/{id}"),
                    attributes,
                    ..UpdateItemInput::default()
                })
                .await
                .expect("put");
        }
    }

    fn settings() -> ReaderSettings {
        ReaderSettings { workers: 2 }
    }

    #[tokio::test]
    async fn frames_are_batched_with_index_and_nulls() {
        let store = Arc::new(MemoryContainer::new(7));
        seed(&store, 10).await;
        let request = ReadRequest {
            table: "t".into(),
            message_limit: 4,
            ..ReadRequest::default()
        };
        let frames = read_table(store, "t/".into(), request, settings(), CancellationToken::new())
            .await
            .expect("read")
            .collect()
            .await
            .expect("frames");
        assert_eq!(frames.iter().map(|frame| frame.len()).sum::<usize>(), 10);
        assert!(frames.iter().all(|frame| frame.len() <= 4));
        for frame in &frames {
            assert_eq!(frame.indices()[0].name(), "id");
            assert_eq!(frame.column("n").expect("n").dtype(), crate::core::dtype::DType::Float64);
            let ids = frame.indices()[0].ints().expect("ids");
            if frame.find("s").is_none() {
                assert!(ids.iter().all(|id| id % 2 == 1), "s missing from {ids:?}");
                continue;
            }
            for (row, id) in ids.iter().enumerate() {
                assert_eq!(frame.is_null(row, "s"), id % 2 == 1);
            }
        }
    }

    #[tokio::test]
    async fn batch_without_values_for_a_field_has_no_column() {
        let store = Arc::new(MemoryContainer::new(10));
        seed(&store, 0).await;
        for id in [1i64, 3] {
            let mut attributes = Item::new();
            attributes.insert("id".into(), Value::Int(id));
            attributes.insert("n".into(), Value::Float(0.5));
            store
                .update_item(&UpdateItemInput {
                    path: format!("t/{id}"),
                    attributes,
                    ..UpdateItemInput::default()
                })
                .await
                .expect("put");
        }
        let request = ReadRequest {
            table: "t".into(),
            ..ReadRequest::default()
        };
        let frames = read_table(store, "t/".into(), request, settings(), CancellationToken::new())
            .await
            .expect("read")
            .collect()
            .await
            .expect("frames");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].names(), vec!["n"]);
        assert!(frames[0].find("s").is_none());
        assert!(!frames[0].is_null(0, "s"));
    }

    #[tokio::test]
    async fn requested_key_is_duplicated_and_reset_index_keeps_columns() {
        let store = Arc::new(MemoryContainer::new(50));
        seed(&store, 3).await;
        let request = ReadRequest {
            table: "t".into(),
            columns: vec!["id".into(), "n".into()],
            ..ReadRequest::default()
        };
        let frames = read_table(store.clone(), "t/".into(), request, settings(), CancellationToken::new())
            .await
            .expect("read")
            .collect()
            .await
            .expect("frames");
        let frame = &frames[0];
        assert_eq!(frame.indices()[0].name(), "_id");
        assert!(frame.column("id").is_ok());

        let request = ReadRequest {
            table: "t".into(),
            reset_index: true,
            ..ReadRequest::default()
        };
        let frames = read_table(store, "t/".into(), request, settings(), CancellationToken::new())
            .await
            .expect("read")
            .collect()
            .await
            .expect("frames");
        assert!(frames.iter().all(|frame| frame.indices().is_empty()));
    }

    #[tokio::test]
    async fn missing_schema_and_group_by_fail() {
        let store = Arc::new(MemoryContainer::new(10));
        let request = ReadRequest {
            table: "nope".into(),
            ..ReadRequest::default()
        };
        let err = read_table(store.clone(), "nope/".into(), request, settings(), CancellationToken::new())
            .await
            .err()
            .expect("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);

        seed(&store, 1).await;
        let request = ReadRequest {
            table: "t".into(),
            group_by: "s".into(),
            ..ReadRequest::default()
        };
        let err = read_table(store, "t/".into(), request, settings(), CancellationToken::new())
            .await
            .err()
            .expect("group by");
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn partitions_are_leaf_directories() {
        let store = MemoryContainer::new(10);
        for path in ["t/a=1/b=1/x", "t/a=1/b=2/x", "t/a=2/x"] {
            store
                .update_item(&UpdateItemInput {
                    path: path.into(),
                    ..UpdateItemInput::default()
                })
                .await
                .expect("put");
        }
        assert_eq!(
            partitions(&store, "t/").await.expect("partitions"),
            vec!["t/a=1/b=1/", "t/a=1/b=2/", "t/a=2/"]
        );
        assert_eq!(partitions(&store, "u/").await.expect("leaf"), vec!["u/"]);
    }
}
