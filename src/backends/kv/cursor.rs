//! Purpose: Parallel, segmented, paginated scan over key-value partitions.
//! Exports: `AsyncItemsCursor`, `CursorOptions`.
//! Role: Feeds the reader and schema inference with items from every shard.
//! Invariants: Each worker holds at most one outstanding `get_items` and does not
//! re-issue until its previous page was taken by the cursor.
//! Invariants: The scan ends when `workers x partitions` shards reported done; a
//! not-found partition counts as done.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::store::{GetItemsInput, GetItemsOutput, Item, ItemStore, StoreError};
use crate::core::error::{Error, ErrorKind};

/// Retries per `get_items` call for retryable statuses, after the first attempt.
const MAX_RETRIES: usize = 5;
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, Default)]
pub struct CursorOptions {
    pub partitions: Vec<String>,
    pub attributes: Vec<String>,
    pub filter: String,
    pub sharding_keys: Vec<String>,
    /// Segments per partition when no sharding keys are given.
    pub workers: usize,
    pub sort_key_range_start: String,
    pub sort_key_range_end: String,
    /// Maximum items emitted; 0 means unlimited.
    pub limit: usize,
    /// Items requested per page; 0 lets the store decide.
    pub page_size: usize,
}

enum ShardEvent {
    Page {
        items: Vec<Item>,
        ack: Option<oneshot::Sender<()>>,
    },
    Done,
    Failed(StoreError),
}

pub struct AsyncItemsCursor {
    events: mpsc::Receiver<ShardEvent>,
    pending: VecDeque<Item>,
    current: Option<Item>,
    error: Option<Error>,
    shards: usize,
    finished_shards: usize,
    emitted: usize,
    limit: usize,
    cancel: CancellationToken,
}

impl AsyncItemsCursor {
    /// Starts one worker per shard; the workers stop when `cancel` fires or the
    /// cursor is dropped.
    pub fn new(
        store: Arc<dyn ItemStore>,
        options: CursorOptions,
        cancel: &CancellationToken,
    ) -> AsyncItemsCursor {
        let cancel = cancel.child_token();
        let inputs = shard_inputs(&options);
        let shards = inputs.len();
        let (tx, events) = mpsc::channel(shards.max(1));
        debug!(
            shards,
            partitions = options.partitions.len(),
            "starting items cursor"
        );
        for input in inputs {
            tokio::spawn(scan_shard(store.clone(), input, tx.clone(), cancel.clone()));
        }
        AsyncItemsCursor {
            events,
            pending: VecDeque::new(),
            current: None,
            error: None,
            shards,
            finished_shards: 0,
            emitted: 0,
            limit: options.limit,
            cancel,
        }
    }

    /// Advances to the next item; false at the end of the scan or on error.
    pub async fn next(&mut self) -> bool {
        match self.next_item().await {
            Ok(Some(item)) => {
                self.current = Some(item);
                true
            }
            Ok(None) => {
                self.current = None;
                false
            }
            Err(err) => {
                self.current = None;
                self.error = Some(err);
                false
            }
        }
    }

    pub fn item(&self) -> Option<&Item> {
        self.current.as_ref()
    }

    pub fn take_item(&mut self) -> Option<Item> {
        self.current.take()
    }

    pub fn err(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub async fn next_item(&mut self) -> Result<Option<Item>, Error> {
        if let Some(err) = &self.error {
            return Err(err.detached());
        }
        loop {
            if self.limit > 0 && self.emitted >= self.limit {
                self.cancel.cancel();
                return Ok(None);
            }
            if let Some(item) = self.pending.pop_front() {
                self.emitted += 1;
                return Ok(Some(item));
            }
            if self.finished_shards >= self.shards {
                return Ok(None);
            }

            let event = tokio::select! {
                event = self.events.recv() => event,
                _ = self.cancel.cancelled() => return Ok(None),
            };
            match event {
                Some(ShardEvent::Page { items, ack }) => {
                    self.pending.extend(items);
                    match ack {
                        Some(ack) => {
                            let _ = ack.send(());
                        }
                        None => self.finished_shards += 1,
                    }
                }
                Some(ShardEvent::Done) => self.finished_shards += 1,
                Some(ShardEvent::Failed(err)) => {
                    self.cancel.cancel();
                    let err = Error::from(err);
                    let message = format!(
                        "failed to get next items: {}",
                        err.message().unwrap_or("store error")
                    );
                    return Err(err.with_message(message));
                }
                None => {
                    return Err(Error::new(ErrorKind::Internal)
                        .with_message("items cursor workers exited before finishing"));
                }
            }
        }
    }

    /// Drains the remaining items.
    pub async fn all(mut self) -> Result<Vec<Item>, Error> {
        let mut items = Vec::new();
        while let Some(item) = self.next_item().await? {
            items.push(item);
        }
        Ok(items)
    }
}

impl Drop for AsyncItemsCursor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn shard_inputs(options: &CursorOptions) -> Vec<GetItemsInput> {
    let base = GetItemsInput {
        attributes: options.attributes.clone(),
        filter: options.filter.clone(),
        limit: options.page_size,
        ..GetItemsInput::default()
    };
    let mut inputs = Vec::new();
    for partition in &options.partitions {
        if options.sharding_keys.is_empty() {
            let segments = options.workers.max(1);
            for segment in 0..segments {
                inputs.push(GetItemsInput {
                    path: partition.clone(),
                    segment,
                    total_segments: segments,
                    ..base.clone()
                });
            }
        } else {
            for key in &options.sharding_keys {
                inputs.push(GetItemsInput {
                    path: partition.clone(),
                    sharding_key: Some(key.clone()),
                    sort_key_range_start: options.sort_key_range_start.clone(),
                    sort_key_range_end: options.sort_key_range_end.clone(),
                    ..base.clone()
                });
            }
        }
    }
    inputs
}

async fn scan_shard(
    store: Arc<dyn ItemStore>,
    mut input: GetItemsInput,
    events: mpsc::Sender<ShardEvent>,
    cancel: CancellationToken,
) {
    loop {
        let output = match fetch_page(store.as_ref(), &input, &cancel).await {
            Some(Ok(output)) => output,
            Some(Err(err)) if err.is_not_found() => {
                debug!(path = %input.path, segment = input.segment, "partition not found");
                send(&events, &cancel, ShardEvent::Done).await;
                return;
            }
            Some(Err(err)) => {
                warn!(path = %input.path, status = err.status, "get items failed: {}", err.message);
                send(&events, &cancel, ShardEvent::Failed(err)).await;
                return;
            }
            None => return,
        };

        let GetItemsOutput {
            items,
            last,
            next_marker,
        } = output;
        let marker = next_marker.filter(|_| !last);
        let Some(marker) = marker else {
            send(&events, &cancel, ShardEvent::Page { items, ack: None }).await;
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        let page = ShardEvent::Page {
            items,
            ack: Some(ack_tx),
        };
        if !send(&events, &cancel, page).await {
            return;
        }
        tokio::select! {
            acked = ack_rx => {
                if acked.is_err() {
                    return;
                }
            }
            _ = cancel.cancelled() => return,
        }
        input.marker = Some(marker);
    }
}

/// `None` when the scan was cancelled while waiting.
async fn fetch_page(
    store: &dyn ItemStore,
    input: &GetItemsInput,
    cancel: &CancellationToken,
) -> Option<Result<GetItemsOutput, StoreError>> {
    let mut retries = 0;
    loop {
        let result = tokio::select! {
            result = store.get_items(input) => result,
            _ = cancel.cancelled() => return None,
        };
        match result {
            Err(err) if err.is_retryable() && retries < MAX_RETRIES => {
                retries += 1;
                debug!(path = %input.path, status = err.status, retries, "retrying get items");
                tokio::time::sleep(RETRY_BACKOFF * retries as u32).await;
            }
            result => return Some(result),
        }
    }
}

async fn send(events: &mpsc::Sender<ShardEvent>, cancel: &CancellationToken, event: ShardEvent) -> bool {
    tokio::select! {
        sent = events.send(event) => sent.is_ok(),
        _ = cancel.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::{AsyncItemsCursor, CursorOptions};
    use crate::backends::kv::memory::MemoryContainer;
    use crate::backends::kv::store::{ITEM_NAME, Item, ItemStore, UpdateItemInput};
    use crate::core::dtype::Value;
    use crate::core::error::ErrorKind;

    async fn fill(store: &MemoryContainer, partition: &str, count: usize) {
        for n in 0..count {
            let mut attributes = Item::new();
            attributes.insert("n".to_string(), Value::from(n as i64));
            store
                .update_item(&UpdateItemInput {
                    path: format!("{partition}item{n:03}"),
                    attributes,
                    ..UpdateItemInput::default()
                })
                .await
                .expect("put");
        }
    }

    fn names(items: &[Item]) -> BTreeSet<String> {
        items
            .iter()
            .filter_map(|item| item.get(ITEM_NAME).and_then(|v| v.as_str()).map(String::from))
            .collect()
    }

    #[tokio::test]
    async fn every_item_is_emitted_once_across_partitions() {
        let store = Arc::new(MemoryContainer::new(5));
        for partition in ["t/p=0/", "t/p=1/", "t/p=2/"] {
            fill(&store, partition, 10).await;
        }
        let options = CursorOptions {
            partitions: vec!["t/p=0/".into(), "t/p=1/".into(), "t/p=2/".into()],
            workers: 4,
            ..CursorOptions::default()
        };
        let mut cursor = AsyncItemsCursor::new(store.clone(), options, &CancellationToken::new());
        let mut count = 0;
        while cursor.next().await {
            assert!(cursor.item().is_some());
            count += 1;
        }
        assert!(cursor.err().is_none());
        assert_eq!(count, 30);
    }

    #[tokio::test]
    async fn items_match_the_store_without_duplicates() {
        let store = Arc::new(MemoryContainer::new(3));
        fill(&store, "t/", 25).await;
        let options = CursorOptions {
            partitions: vec!["t/".into()],
            workers: 3,
            ..CursorOptions::default()
        };
        let items = AsyncItemsCursor::new(store, options, &CancellationToken::new())
            .all()
            .await
            .expect("scan");
        assert_eq!(items.len(), 25);
        assert_eq!(names(&items).len(), 25);
    }

    #[tokio::test]
    async fn missing_partition_counts_as_finished() {
        let store = Arc::new(MemoryContainer::new(10));
        fill(&store, "t/a/", 4).await;
        let options = CursorOptions {
            partitions: vec!["t/a/".into(), "t/missing/".into()],
            workers: 2,
            ..CursorOptions::default()
        };
        let items = AsyncItemsCursor::new(store, options, &CancellationToken::new())
            .all()
            .await
            .expect("scan");
        assert_eq!(items.len(), 4);
    }

    #[tokio::test]
    async fn retryable_failures_are_retried_and_fatal_ones_surface() {
        let store = Arc::new(MemoryContainer::new(10));
        fill(&store, "t/", 6).await;
        let options = CursorOptions {
            partitions: vec!["t/".into()],
            workers: 1,
            ..CursorOptions::default()
        };

        store.fail_next_get_items(503, 5);
        let items = AsyncItemsCursor::new(store.clone(), options.clone(), &CancellationToken::new())
            .all()
            .await
            .expect("retried");
        assert_eq!(items.len(), 6);

        store.fail_next_get_items(503, 6);
        let mut cursor = AsyncItemsCursor::new(store.clone(), options.clone(), &CancellationToken::new());
        assert!(!cursor.next().await);
        assert_eq!(cursor.err().expect("error").kind(), ErrorKind::Transport);

        store.fail_next_get_items(400, 1);
        let err = AsyncItemsCursor::new(store, options, &CancellationToken::new())
            .all()
            .await
            .expect_err("bad request");
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn limit_and_sharding_keys() {
        let store = Arc::new(MemoryContainer::new(2));
        for key in ["a", "b", "c"] {
            for sort in 0..4 {
                store
                    .update_item(&UpdateItemInput {
                        path: format!("t/{key}.{sort}"),
                        ..UpdateItemInput::default()
                    })
                    .await
                    .expect("put");
            }
        }

        let options = CursorOptions {
            partitions: vec!["t/".into()],
            sharding_keys: vec!["a".into(), "c".into()],
            sort_key_range_start: "1".into(),
            sort_key_range_end: "3".into(),
            ..CursorOptions::default()
        };
        let items = AsyncItemsCursor::new(store.clone(), options, &CancellationToken::new())
            .all()
            .await
            .expect("sharded");
        let expected: BTreeSet<String> = ["a.1", "a.2", "c.1", "c.2"].iter().map(|s| s.to_string()).collect();
        assert_eq!(names(&items), expected);

        let limited = CursorOptions {
            partitions: vec!["t/".into()],
            workers: 2,
            limit: 5,
            ..CursorOptions::default()
        };
        let items = AsyncItemsCursor::new(store, limited, &CancellationToken::new())
            .all()
            .await
            .expect("limited");
        assert_eq!(items.len(), 5);
    }
}
