//! Purpose: In-process item store with the paging, sharding and condition semantics
//! the key-value backend relies on.
//! Exports: `MemoryStore`, `MemoryContainer`.
//! Role: Default `StoreProvider` for the `kv` backend; also the test double for cursors.
//! Invariants: Items within a directory page in name order; markers are item names.
//! Invariants: Segment membership is a stable hash of the item name.
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use super::expr::{Assignments, Condition};
use super::store::{
    GetItemsInput, GetItemsOutput, ITEM_NAME, Item, ItemStore, STATUS_BAD_REQUEST,
    STATUS_CONDITION_FAILED, STATUS_CONFLICT, StoreError, StoreProvider, UpdateItemInput,
    UpdateMode,
};
use crate::core::dtype::Value;
use crate::core::error::Error;
use crate::core::request::{Credentials, Session};

const DEFAULT_PAGE_SIZE: usize = 128;

#[derive(Clone, Debug)]
enum Object {
    Item(Item),
    Blob(Vec<u8>),
}

pub struct MemoryStore {
    containers: RwLock<HashMap<String, Arc<MemoryContainer>>>,
    page_size: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
            page_size: page_size.max(1),
        }
    }

    /// The container named `name`, created on first use.
    pub fn container_handle(&self, name: &str) -> Arc<MemoryContainer> {
        if let Some(container) = self
            .containers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
        {
            return container.clone();
        }
        self.containers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryContainer::new(self.page_size)))
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreProvider for MemoryStore {
    fn container(
        &self,
        _session: &Session,
        _credentials: &Credentials,
        name: &str,
    ) -> Result<Arc<dyn ItemStore>, Error> {
        Ok(self.container_handle(name))
    }
}

pub struct MemoryContainer {
    objects: RwLock<BTreeMap<String, Object>>,
    page_size: usize,
    failures: Mutex<VecDeque<u16>>,
    get_items_calls: AtomicUsize,
}

impl MemoryContainer {
    pub fn new(page_size: usize) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            page_size: page_size.max(1),
            failures: Mutex::new(VecDeque::new()),
            get_items_calls: AtomicUsize::new(0),
        }
    }

    /// Makes the next `times` `get_items` calls fail with `status`.
    pub fn fail_next_get_items(&self, status: u16, times: usize) {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        failures.extend(std::iter::repeat_n(status, times));
    }

    pub fn get_items_calls(&self) -> usize {
        self.get_items_calls.load(Ordering::SeqCst)
    }

    /// Stored attributes of the item at `path`, without `__name`.
    pub fn item(&self, path: &str) -> Option<Item> {
        match self.read_objects().get(path) {
            Some(Object::Item(item)) => Some(item.clone()),
            _ => None,
        }
    }

    /// Paths of every item under `prefix`, recursively.
    pub fn item_paths(&self, prefix: &str) -> Vec<String> {
        self.read_objects()
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .filter(|(_, object)| matches!(object, Object::Item(_)))
            .map(|(path, _)| path.clone())
            .collect()
    }

    fn read_objects(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Object>> {
        self.objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_objects(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Object>> {
        self.objects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn injected_failure(&self) -> Option<StoreError> {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .map(|status| StoreError::new(status, format!("injected failure ({status})")))
    }
}

fn as_directory(path: &str) -> String {
    if path.is_empty() || path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

fn item_name(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

/// FNV-1a; stable across runs so segment membership is reproducible.
fn segment_of(name: &str, total: usize) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % total as u64) as usize
}

fn in_shard(name: &str, input: &GetItemsInput) -> bool {
    if let Some(key) = &input.sharding_key {
        let (primary, sort) = match name.split_once('.') {
            Some((primary, sort)) => (primary, Some(sort)),
            None => (name, None),
        };
        if primary != key {
            return false;
        }
        if input.sort_key_range_start.is_empty() && input.sort_key_range_end.is_empty() {
            return true;
        }
        let Some(sort) = sort else {
            return false;
        };
        let after_start =
            input.sort_key_range_start.is_empty() || sort >= input.sort_key_range_start.as_str();
        let before_end =
            input.sort_key_range_end.is_empty() || sort < input.sort_key_range_end.as_str();
        return after_start && before_end;
    }
    input.total_segments <= 1 || segment_of(name, input.total_segments) == input.segment
}

fn with_name(item: &Item, name: &str) -> Item {
    let mut item = item.clone();
    item.insert(ITEM_NAME.to_string(), Value::from(name));
    item
}

fn project(item: Item, attributes: &[String]) -> Item {
    if attributes.is_empty() || attributes.iter().any(|name| name == "*") {
        return item;
    }
    item.into_iter()
        .filter(|(name, _)| attributes.contains(name))
        .collect()
}

fn bad_expression(err: Error) -> StoreError {
    StoreError::new(
        STATUS_BAD_REQUEST,
        err.message().unwrap_or("bad expression").to_string(),
    )
}

#[async_trait]
impl ItemStore for MemoryContainer {
    async fn get_items(&self, input: &GetItemsInput) -> Result<GetItemsOutput, StoreError> {
        tokio::task::yield_now().await;
        self.get_items_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.injected_failure() {
            return Err(err);
        }

        let filter = if input.filter.trim().is_empty() {
            None
        } else {
            Some(Condition::parse(&input.filter).map_err(bad_expression)?)
        };
        let directory = as_directory(&input.path);
        let page_size = if input.limit > 0 {
            input.limit
        } else {
            self.page_size
        };

        let objects = self.read_objects();
        let mut under_directory = objects
            .range(directory.clone()..)
            .take_while(|(path, _)| path.starts_with(&directory))
            .peekable();
        if under_directory.peek().is_none() {
            return Err(StoreError::not_found(&input.path));
        }

        let mut items = Vec::new();
        let mut last_name = None;
        let mut has_more = false;
        for (path, object) in under_directory {
            let Object::Item(stored) = object else {
                continue;
            };
            let name = &path[directory.len()..];
            if name.contains('/') {
                continue;
            }
            if input.marker.as_deref().is_some_and(|marker| name <= marker) {
                continue;
            }
            if !in_shard(name, input) {
                continue;
            }
            let full = with_name(stored, name);
            if filter.as_ref().is_some_and(|filter| !filter.matches(&full)) {
                continue;
            }
            if items.len() == page_size {
                has_more = true;
                break;
            }
            items.push(project(full, &input.attributes));
            last_name = Some(name.to_string());
        }

        let next_marker = if has_more { last_name } else { None };
        Ok(GetItemsOutput {
            items,
            last: !has_more,
            next_marker,
        })
    }

    async fn update_item(&self, input: &UpdateItemInput) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        let condition = if input.condition.trim().is_empty() {
            None
        } else {
            Some(Condition::parse(&input.condition).map_err(bad_expression)?)
        };
        let expression = match &input.expression {
            Some(expression) => Some(Assignments::parse(expression).map_err(bad_expression)?),
            None => None,
        };

        let name = item_name(&input.path).to_string();
        let mut objects = self.write_objects();
        let existing = match objects.get(&input.path) {
            Some(Object::Item(item)) => Some(item.clone()),
            Some(Object::Blob(_)) => {
                return Err(StoreError::new(
                    STATUS_CONFLICT,
                    format!("{} is not an item", input.path),
                ));
            }
            None => None,
        };

        if let Some(condition) = &condition {
            let current = with_name(&existing.clone().unwrap_or_default(), &name);
            if !condition.matches(&current) {
                return Err(StoreError::new(
                    STATUS_CONDITION_FAILED,
                    format!("condition '{}' evaluated to false", input.condition),
                ));
            }
        }
        if input.mode == UpdateMode::CreateNewItemOnly && existing.is_some() {
            return Err(StoreError::new(
                STATUS_CONFLICT,
                format!("item {} already exists", input.path),
            ));
        }

        let mut item = match input.mode {
            UpdateMode::OverwriteAttributes => Item::new(),
            _ => existing.unwrap_or_default(),
        };
        item.extend(
            input
                .attributes
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        for name in &input.remove {
            item.remove(name);
        }
        if let Some(expression) = expression {
            expression.apply(&mut item).map_err(bad_expression)?;
        }
        item.remove(ITEM_NAME);
        objects.insert(input.path.clone(), Object::Item(item));
        Ok(())
    }

    async fn put_object(&self, path: &str, body: Vec<u8>) -> Result<(), StoreError> {
        self.write_objects()
            .insert(path.to_string(), Object::Blob(body));
        Ok(())
    }

    async fn get_object(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        match self.read_objects().get(path) {
            Some(Object::Blob(body)) => Ok(body.clone()),
            Some(Object::Item(_)) => Err(StoreError::new(
                STATUS_BAD_REQUEST,
                format!("{path} is an item, not an object"),
            )),
            None => Err(StoreError::not_found(path)),
        }
    }

    async fn delete_object(&self, path: &str) -> Result<(), StoreError> {
        let mut objects = self.write_objects();
        if path.ends_with('/') {
            let doomed: Vec<String> = objects
                .range(path.to_string()..)
                .take_while(|(key, _)| key.starts_with(path))
                .map(|(key, _)| key.clone())
                .collect();
            if doomed.is_empty() {
                return Err(StoreError::not_found(path));
            }
            for key in doomed {
                objects.remove(&key);
            }
            return Ok(());
        }
        match objects.remove(path) {
            Some(_) => Ok(()),
            None => Err(StoreError::not_found(path)),
        }
    }

    async fn check_path_exists(&self, path: &str) -> Result<bool, StoreError> {
        let objects = self.read_objects();
        if objects.contains_key(path) {
            return Ok(true);
        }
        let directory = as_directory(path);
        Ok(objects
            .range(directory.clone()..)
            .next()
            .is_some_and(|(key, _)| key.starts_with(&directory)))
    }

    async fn list_directories(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let directory = as_directory(path);
        let objects = self.read_objects();
        let children: BTreeSet<String> = objects
            .range(directory.clone()..)
            .take_while(|(key, _)| key.starts_with(&directory))
            .filter_map(|(key, _)| {
                let rest = &key[directory.len()..];
                rest.split_once('/')
                    .map(|(child, _)| format!("{directory}{child}/"))
            })
            .collect();
        Ok(children.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryContainer;
    use crate::backends::kv::store::{
        GetItemsInput, ITEM_NAME, Item, ItemStore, UpdateItemInput, UpdateMode,
    };
    use crate::core::dtype::Value;

    fn attrs(pairs: &[(&str, Value)]) -> Item {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    async fn put(store: &MemoryContainer, path: &str, item: Item) {
        store
            .update_item(&UpdateItemInput {
                path: path.to_string(),
                attributes: item,
                ..UpdateItemInput::default()
            })
            .await
            .expect("put");
    }

    #[tokio::test]
    async fn pages_follow_markers_until_last() {
        let store = MemoryContainer::new(2);
        for index in 0..5 {
            put(&store, &format!("t/k{index}"), attrs(&[("n", Value::Int(index))])).await;
        }
        let mut input = GetItemsInput {
            path: "t/".to_string(),
            attributes: vec!["*".to_string()],
            ..GetItemsInput::default()
        };
        let mut names = Vec::new();
        loop {
            let page = store.get_items(&input).await.expect("page");
            for item in &page.items {
                names.push(item.get(ITEM_NAME).and_then(Value::as_str).expect("name").to_string());
            }
            if page.last {
                break;
            }
            input.marker = page.next_marker;
        }
        assert_eq!(names, vec!["k0", "k1", "k2", "k3", "k4"]);
    }

    #[tokio::test]
    async fn segments_partition_the_directory() {
        let store = MemoryContainer::new(1000);
        for index in 0..50 {
            put(&store, &format!("t/item{index}"), attrs(&[("n", Value::Int(index))])).await;
        }
        let mut total = 0;
        for segment in 0..4 {
            let page = store
                .get_items(&GetItemsInput {
                    path: "t/".to_string(),
                    segment,
                    total_segments: 4,
                    ..GetItemsInput::default()
                })
                .await
                .expect("segment");
            total += page.items.len();
        }
        assert_eq!(total, 50);
    }

    #[tokio::test]
    async fn sharding_key_and_sort_range_select_items() {
        let store = MemoryContainer::new(100);
        for (name, value) in [("a.1", 1), ("a.2", 2), ("a.3", 3), ("b.1", 4)] {
            put(&store, &format!("t/{name}"), attrs(&[("n", Value::Int(value))])).await;
        }
        let page = store
            .get_items(&GetItemsInput {
                path: "t".to_string(),
                sharding_key: Some("a".to_string()),
                sort_key_range_start: "2".to_string(),
                sort_key_range_end: "3".to_string(),
                ..GetItemsInput::default()
            })
            .await
            .expect("shard");
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].get("n"), Some(&Value::Int(2)));
    }

    #[tokio::test]
    async fn update_modes_and_conditions() {
        let store = MemoryContainer::new(10);
        put(&store, "t/k", attrs(&[("a", Value::Int(1)), ("b", Value::Int(2))])).await;

        store
            .update_item(&UpdateItemInput {
                path: "t/k".to_string(),
                attributes: attrs(&[("c", Value::Int(3))]),
                mode: UpdateMode::OverwriteAttributes,
                ..UpdateItemInput::default()
            })
            .await
            .expect("overwrite");
        assert_eq!(store.item("t/k"), Some(attrs(&[("c", Value::Int(3))])));

        let err = store
            .update_item(&UpdateItemInput {
                path: "t/k".to_string(),
                mode: UpdateMode::CreateNewItemOnly,
                ..UpdateItemInput::default()
            })
            .await
            .expect_err("exists");
        assert!(err.is_item_exists());

        let err = store
            .update_item(&UpdateItemInput {
                path: "t/k".to_string(),
                expression: Some("c=c+1".to_string()),
                condition: "c > 5".to_string(),
                ..UpdateItemInput::default()
            })
            .await
            .expect_err("condition");
        assert!(err.is_condition_failed());

        store
            .update_item(&UpdateItemInput {
                path: "t/k".to_string(),
                expression: Some("c=c+1".to_string()),
                condition: "c == 3".to_string(),
                ..UpdateItemInput::default()
            })
            .await
            .expect("conditional update");
        assert_eq!(store.item("t/k").and_then(|item| item.get("c").cloned()), Some(Value::Int(4)));
    }

    #[tokio::test]
    async fn missing_directory_is_not_found_and_failures_inject() {
        let store = MemoryContainer::new(10);
        let err = store
            .get_items(&GetItemsInput {
                path: "nope/".to_string(),
                ..GetItemsInput::default()
            })
            .await
            .expect_err("missing");
        assert!(err.is_not_found());

        put(&store, "t/a=1/k", attrs(&[("n", Value::Int(1))])).await;
        store.fail_next_get_items(503, 1);
        let err = store
            .get_items(&GetItemsInput {
                path: "t/a=1/".to_string(),
                ..GetItemsInput::default()
            })
            .await
            .expect_err("injected");
        assert_eq!(err.status, 503);
        assert_eq!(
            store.list_directories("t").await.expect("dirs"),
            vec!["t/a=1/".to_string()]
        );
        assert!(store.check_path_exists("t").await.expect("exists"));
        assert_eq!(store.get_items_calls(), 2);
    }
}
