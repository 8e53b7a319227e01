//! Purpose: Turn written frames into item updates on the key-value store.
//! Exports: `KvAppender`, `WriterSettings`, `key_string`, `validate_frame`.
//! Role: The `FrameAppender` handed out by the kv backend for write requests.
//! Invariants: Every queued update is counted by the completion latch before it is
//! sent; `wait_for_complete` returns once the count drains, the first failure wins.
//! Invariants: Rows without an index are keyed by their row number across frames.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::expr::{TemplateKind, check_template, render_template};
use super::schema::{FieldType, Schema};
use super::store::{Item, ItemStore, StoreError, UpdateItemInput, UpdateMode};
use crate::backends::FrameAppender;
use crate::core::dtype::Value;
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::Frame;
use crate::core::request::{SaveMode, WriteRequest};

/// Key attribute used when a table is first written without an index.
pub const DEFAULT_KEY_COLUMN: &str = "idx";
pub const MAX_ATTRIBUTE_NAME_LENGTH: usize = 256;
/// Used when a write carries no completion timeout.
const UNBOUNDED_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Copy, Debug)]
pub struct WriterSettings {
    /// Concurrent `update_item` calls.
    pub workers: usize,
}

fn bad_request(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::BadRequest).with_message(message)
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Rejects frames the store cannot hold before any I/O happens.
pub fn validate_frame(frame: &Frame, partition_keys: &[String]) -> Result<(), Error> {
    if frame.columns().is_empty() && frame.indices().is_empty() {
        return Err(bad_request("empty frame"));
    }
    if frame.indices().len() > 2 {
        return Err(bad_request("can only write up to two indices"));
    }
    for (number, name) in frame.names().into_iter().enumerate() {
        if name.is_empty() {
            return Err(bad_request(format!("column number {number} has an empty name")));
        }
        if !is_valid_name(name) {
            return Err(bad_request(format!("column '{name}' has an invalid name")));
        }
        if name.len() > MAX_ATTRIBUTE_NAME_LENGTH {
            return Err(bad_request(format!(
                "column '{name}' exceeding maximum allowed attribute name of {MAX_ATTRIBUTE_NAME_LENGTH}"
            )));
        }
    }
    for index in frame.indices() {
        let name = index.name();
        if !name.is_empty() && !is_valid_name(name) {
            return Err(bad_request(format!("index '{name}' has an invalid name")));
        }
        if name.len() > MAX_ATTRIBUTE_NAME_LENGTH {
            return Err(bad_request(format!(
                "index '{name}' exceeding maximum allowed attribute name of {MAX_ATTRIBUTE_NAME_LENGTH}"
            )));
        }
    }
    let mut seen = Vec::with_capacity(partition_keys.len());
    for key in partition_keys {
        if frame.column(key).is_err() {
            return Err(bad_request(format!("column '{key}' does not exist in the dataframe")));
        }
        if seen.contains(&key) {
            return Err(bad_request(format!(
                "column '{key}' appears more than once as a partition key"
            )));
        }
        seen.push(key);
    }
    Ok(())
}

/// Renders a key value as it appears in item names.
pub fn key_string(value: &Value) -> String {
    match value {
        Value::String(value) => value.clone(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Int(value) => value.to_string(),
        Value::Float(value) => {
            let fixed = format!("{value:.6}");
            let trimmed = fixed.trim_end_matches('0');
            if trimmed.ends_with('.') {
                format!("{trimmed}0")
            } else {
                trimmed.to_string()
            }
        }
        Value::Time(nanos) => {
            let seconds = nanos.div_euclid(1_000_000_000);
            let rest = nanos.rem_euclid(1_000_000_000);
            format!("{seconds}:{rest}")
        }
    }
}

fn update_mode(mode: SaveMode) -> UpdateMode {
    match mode {
        SaveMode::OverwriteItem => UpdateMode::OverwriteAttributes,
        SaveMode::CreateNewItemsOnly => UpdateMode::CreateNewItemOnly,
        SaveMode::ErrorIfTableExists | SaveMode::OverwriteTable | SaveMode::UpdateItem => {
            UpdateMode::CreateOrReplaceAttributes
        }
    }
}

/// Counts outstanding updates; the first recorded error is kept.
#[derive(Default)]
struct CompletionLatch {
    pending: AtomicUsize,
    drained: Notify,
    error: Mutex<Option<Error>>,
}

impl CompletionLatch {
    fn add(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self, result: Result<(), Error>) {
        if let Err(err) = result {
            let mut slot = self
                .error
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    fn first_error(&self) -> Option<Error> {
        self.error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(Error::detached)
    }

    async fn wait(&self) {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }
}

pub struct KvAppender {
    store: Arc<dyn ItemStore>,
    table_path: String,
    request: WriteRequest,
    schema: Schema,
    rows_processed: usize,
    outbound: Option<mpsc::Sender<UpdateItemInput>>,
    latch: Arc<CompletionLatch>,
    cancel: CancellationToken,
}

impl KvAppender {
    /// Applies the save-mode rules for an existing table and starts the update
    /// workers. The request's initial frame, if any, is added before returning.
    pub async fn open(
        store: Arc<dyn ItemStore>,
        table_path: String,
        mut request: WriteRequest,
        settings: WriterSettings,
    ) -> Result<KvAppender, Error> {
        if !request.expression.is_empty() {
            check_template(&request.expression, TemplateKind::Assignments)?;
        }
        if !request.condition.is_empty() {
            check_template(&request.condition, TemplateKind::Condition)?;
        }

        let mut schema = Schema::load(store.as_ref(), &table_path).await?;
        if schema.is_some() {
            match request.save_mode {
                SaveMode::OverwriteTable => {
                    debug!(table = %table_path, "overwriting table");
                    super::delete_table(store.clone(), &table_path, "", settings.workers, true)
                        .await
                        .map_err(|err| {
                            let message = format!(
                                "error occurred while deleting table '{table_path}': {}",
                                err.message().unwrap_or("store error")
                            );
                            err.with_message(message)
                        })?;
                    schema = None;
                }
                SaveMode::ErrorIfTableExists => {
                    return Err(Error::new(ErrorKind::Conflict)
                        .with_message(format!(
                            "table '{table_path}' already exists; either use a different save mode or save to a different table"
                        ))
                        .with_table(table_path));
                }
                _ => {}
            }
        } else if request.save_mode == SaveMode::ErrorIfTableExists
            && store
                .check_path_exists(&table_path)
                .await
                .map_err(Error::from)?
        {
            return Err(Error::new(ErrorKind::Conflict)
                .with_message(format!(
                    "folder '{table_path}' already exists; you can't write to an existing folder unless it already contains a schema file"
                ))
                .with_table(table_path));
        }

        let workers = settings.workers.max(1);
        let (outbound, inbound) = mpsc::channel(workers * 2);
        let inbound = Arc::new(AsyncMutex::new(inbound));
        let latch = Arc::new(CompletionLatch::default());
        let cancel = CancellationToken::new();
        for _ in 0..workers {
            tokio::spawn(update_worker(
                store.clone(),
                inbound.clone(),
                latch.clone(),
                cancel.clone(),
                request.save_mode,
            ));
        }

        let initial = request.initial_data.take();
        let mut appender = KvAppender {
            store,
            table_path,
            request,
            schema: schema.unwrap_or_else(|| Schema::new(DEFAULT_KEY_COLUMN, "")),
            rows_processed: 0,
            outbound: Some(outbound),
            latch,
            cancel,
        };
        if let Some(frame) = initial {
            appender.add(frame).await?;
        }
        Ok(appender)
    }

    async fn send(&self, input: UpdateItemInput) -> Result<(), Error> {
        let Some(outbound) = &self.outbound else {
            return Err(bad_request("frames cannot be added after the write completed"));
        };
        self.latch.add();
        if outbound.send(input).await.is_err() {
            self.latch.done(Ok(()));
            return Err(Error::new(ErrorKind::Internal).with_message("update workers stopped"));
        }
        Ok(())
    }

    fn row_key(&self, frame: &Frame, row: usize) -> Result<(Value, Option<Value>), Error> {
        let key = match frame.indices().first() {
            Some(index) => index.at(row)?,
            None => Value::Int((self.rows_processed + row) as i64),
        };
        let sorting = match frame.indices().get(1) {
            Some(index) => Some(index.at(row)?),
            None => None,
        };
        Ok((key, sorting))
    }

    fn item_path(&self, frame: &Frame, row: usize, key: &Value, sorting: Option<&Value>) -> Result<String, Error> {
        let mut path = self.table_path.clone();
        for name in &self.request.partition_keys {
            path.push_str(name);
            path.push('=');
            if frame.is_null(row, name) {
                path.push_str("null");
            } else {
                path.push_str(&key_string(&frame.column(name)?.at(row)?));
            }
            path.push('/');
        }
        path.push_str(&key_string(key));
        if let Some(sorting) = sorting {
            path.push('.');
            path.push_str(&key_string(sorting));
        }
        Ok(path)
    }

    fn render_condition(&self, frame: &Frame, row: usize) -> Result<String, Error> {
        if self.request.condition.is_empty() {
            return Ok(String::new());
        }
        render_template(&self.request.condition, frame, row).inspect_err(|err| {
            error!("error generating condition: {err}");
        })
    }

    /// The schema this frame implies, keyed like the table.
    fn frame_schema(&self, frame: &Frame) -> Result<(Schema, String, Option<String>), Error> {
        let indices = frame.indices();
        let (key_name, sorting_name) = match indices.first() {
            Some(index) => {
                let key = if index.name().is_empty() {
                    self.schema.key.clone()
                } else {
                    index.name().to_string()
                };
                (key, indices.get(1).map(|sorting| sorting.name().to_string()))
            }
            None => (self.schema.key.clone(), None),
        };

        let mut schema = Schema::new(key_name.clone(), sorting_name.clone().unwrap_or_default());
        match indices.first() {
            Some(index) => schema.add_field(&key_name, FieldType::of(index.dtype()), false)?,
            None => schema.add_field(&key_name, FieldType::Long, false)?,
        }
        if let (Some(name), Some(index)) = (&sorting_name, indices.get(1)) {
            schema.add_field(name, FieldType::of(index.dtype()), false)?;
        }
        for column in frame.columns() {
            schema.add_field(column.name(), FieldType::of(column.dtype()), true)?;
        }
        for (name, value) in frame.labels() {
            schema.add_field(name, FieldType::of_value(value), true)?;
        }
        Ok((schema, key_name, sorting_name))
    }

    async fn put_rows(&mut self, frame: &Frame) -> Result<(), Error> {
        let (new_schema, key_name, sorting_name) = self.frame_schema(frame)?;
        self.schema
            .update(self.store.as_ref(), &self.table_path, &new_schema)
            .await?;

        let mode = update_mode(self.request.save_mode);
        for row in 0..frame.len() {
            let (key, sorting) = self.row_key(frame, row)?;
            if key_string(&key).is_empty() {
                return Err(bad_request(format!(
                    "invalid input. key \"{key_name}\" should not be empty"
                )));
            }
            if let (Some(name), Some(value)) = (&sorting_name, &sorting)
                && key_string(value).is_empty()
            {
                return Err(bad_request(format!(
                    "invalid input. sorting key \"{name}\" should not be empty"
                )));
            }

            let (attributes, remove) = row_attributes(frame, row)?;
            let mut attributes = attributes;
            attributes.insert(key_name.clone(), key.clone());
            if let (Some(name), Some(value)) = (&sorting_name, &sorting) {
                attributes.insert(name.clone(), value.clone());
            }

            let input = UpdateItemInput {
                path: self.item_path(frame, row, &key, sorting.as_ref())?,
                attributes,
                remove: if self.request.save_mode == SaveMode::UpdateItem {
                    remove
                } else {
                    Vec::new()
                },
                expression: None,
                condition: self.render_condition(frame, row)?,
                mode,
            };
            self.send(input).await?;
        }
        Ok(())
    }

    async fn update_rows(&mut self, frame: &Frame) -> Result<(), Error> {
        let mode = update_mode(self.request.save_mode);
        for row in 0..frame.len() {
            let expression = render_template(&self.request.expression, frame, row)
                .inspect_err(|err| error!("error generating expression: {err}"))?;
            let (key, sorting) = self.row_key(frame, row)?;
            let mut path = format!("{}{}", self.table_path, key_string(&key));
            if let Some(sorting) = &sorting {
                path.push('.');
                path.push_str(&key_string(sorting));
            }
            let input = UpdateItemInput {
                path,
                expression: Some(expression),
                condition: self.render_condition(frame, row)?,
                mode,
                ..UpdateItemInput::default()
            };
            self.send(input).await?;
        }
        Ok(())
    }
}

/// Non-null cells and frame labels as attributes, plus the names of null cells.
fn row_attributes(frame: &Frame, row: usize) -> Result<(Item, Vec<String>), Error> {
    let mut attributes: Item = frame
        .labels()
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let mut nulls = Vec::new();
    for column in frame.columns() {
        let name = column.name();
        if frame.is_null(row, name) {
            nulls.push(name.to_string());
            continue;
        }
        attributes.insert(name.to_string(), column.at(row)?);
    }
    Ok((attributes, nulls))
}

#[async_trait]
impl FrameAppender for KvAppender {
    async fn add(&mut self, frame: Frame) -> Result<(), Error> {
        validate_frame(&frame, &self.request.partition_keys)?;
        if let Some(err) = self.latch.first_error() {
            return Err(err);
        }
        if self.request.expression.is_empty() {
            self.put_rows(&frame).await?;
        } else {
            self.update_rows(&frame).await?;
        }
        self.rows_processed += frame.len();
        Ok(())
    }

    async fn wait_for_complete(&mut self, timeout: Duration) -> Result<(), Error> {
        self.outbound = None;
        let limit = if timeout.is_zero() { UNBOUNDED_WAIT } else { timeout };
        if tokio::time::timeout(limit, self.latch.wait()).await.is_err() {
            self.cancel.cancel();
            return Err(Error::new(ErrorKind::Timeout)
                .with_message(format!(
                    "the operation timed out after {:.2} seconds",
                    limit.as_secs_f64()
                ))
                .with_table(self.table_path.clone()));
        }
        match self.latch.first_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for KvAppender {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn update_worker(
    store: Arc<dyn ItemStore>,
    inbound: Arc<AsyncMutex<mpsc::Receiver<UpdateItemInput>>>,
    latch: Arc<CompletionLatch>,
    cancel: CancellationToken,
    save_mode: SaveMode,
) {
    loop {
        let next = tokio::select! {
            next = async { inbound.lock().await.recv().await } => next,
            _ = cancel.cancelled() => return,
        };
        let Some(input) = next else {
            return;
        };
        debug!(path = %input.path, "update item");
        let result = tokio::select! {
            result = store.update_item(&input) => result,
            _ = cancel.cancelled() => return,
        };
        latch.done(classify(result, &input, save_mode));
    }
}

fn classify(result: Result<(), StoreError>, input: &UpdateItemInput, save_mode: SaveMode) -> Result<(), Error> {
    let Err(err) = result else {
        return Ok(());
    };
    if err.is_condition_failed() && save_mode != SaveMode::UpdateItem {
        info!(path = %input.path, "condition for item evaluated to false");
        return Ok(());
    }
    if err.is_item_exists() && input.mode == UpdateMode::CreateNewItemOnly {
        info!(path = %input.path, "item already exists, skipped in CreateNewItemsOnly mode");
        return Ok(());
    }
    error!(path = %input.path, status = err.status, "failed to update item: {}", err.message);
    let message = if err.is_condition_failed() {
        format!("condition for item '{}' evaluated to false", input.path)
    } else {
        format!("failed to update item '{}': {}", input.path, err.message)
    };
    Err(Error::from(err).with_message(message))
}
