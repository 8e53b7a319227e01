//! Purpose: The item-store boundary the key-value backend is written against.
//! Exports: `ItemStore`, `StoreProvider`, `StoreError`, `Item`, `GetItemsInput`,
//! `GetItemsOutput`, `UpdateItemInput`, `UpdateMode`, `ITEM_NAME`.
//! Role: One `ItemStore` per container; status-carrying errors let callers apply
//! retry and not-found rules without parsing messages.
//! Invariants: Item paths are `<directory>/<name>`; `__name` is the final segment.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::dtype::Value;
use crate::core::error::{Error, ErrorKind};
use crate::core::request::{Credentials, Session};

/// Attribute carrying an item's object name.
pub const ITEM_NAME: &str = "__name";

pub type Item = BTreeMap<String, Value>;

#[derive(Clone, Debug, Default)]
pub struct GetItemsInput {
    pub path: String,
    pub attributes: Vec<String>,
    pub filter: String,
    pub sharding_key: Option<String>,
    pub segment: usize,
    pub total_segments: usize,
    pub sort_key_range_start: String,
    pub sort_key_range_end: String,
    pub marker: Option<String>,
    pub limit: usize,
}

#[derive(Clone, Debug, Default)]
pub struct GetItemsOutput {
    pub items: Vec<Item>,
    pub last: bool,
    pub next_marker: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum UpdateMode {
    #[default]
    CreateOrReplaceAttributes,
    OverwriteAttributes,
    CreateNewItemOnly,
}

#[derive(Clone, Debug, Default)]
pub struct UpdateItemInput {
    pub path: String,
    pub attributes: Item,
    pub remove: Vec<String>,
    pub expression: Option<String>,
    pub condition: String,
    pub mode: UpdateMode,
}

pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_CONFLICT: u16 = 409;
pub const STATUS_CONDITION_FAILED: u16 = 412;
pub const STATUS_UNAVAILABLE: u16 = 503;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreError {
    pub status: u16,
    pub message: String,
}

impl StoreError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(STATUS_NOT_FOUND, format!("{path} not found"))
    }

    pub fn is_not_found(&self) -> bool {
        self.status == STATUS_NOT_FOUND
    }

    pub fn is_condition_failed(&self) -> bool {
        self.status == STATUS_CONDITION_FAILED
    }

    pub fn is_item_exists(&self) -> bool {
        self.status == STATUS_CONFLICT
    }

    /// Statuses a reader retries: server errors and conflicts.
    pub fn is_retryable(&self) -> bool {
        self.status >= 500 || self.status == STATUS_CONFLICT
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store error {}: {}", self.status, self.message)
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        let kind = match err.status {
            STATUS_BAD_REQUEST => ErrorKind::BadRequest,
            STATUS_NOT_FOUND => ErrorKind::NotFound,
            STATUS_CONFLICT | STATUS_CONDITION_FAILED => ErrorKind::Conflict,
            _ => ErrorKind::Transport,
        };
        Error::new(kind).with_message(err.message.clone()).with_source(err)
    }
}

#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn get_items(&self, input: &GetItemsInput) -> Result<GetItemsOutput, StoreError>;

    async fn update_item(&self, input: &UpdateItemInput) -> Result<(), StoreError>;

    async fn put_object(&self, path: &str, body: Vec<u8>) -> Result<(), StoreError>;

    async fn get_object(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    async fn delete_object(&self, path: &str) -> Result<(), StoreError>;

    async fn check_path_exists(&self, path: &str) -> Result<bool, StoreError>;

    /// Immediate child directories of `path`, each ending in `/`.
    async fn list_directories(&self, path: &str) -> Result<Vec<String>, StoreError>;
}

/// Hands out the item store for a container, given the caller's session.
pub trait StoreProvider: Send + Sync {
    fn container(
        &self,
        session: &Session,
        credentials: &Credentials,
        name: &str,
    ) -> Result<Arc<dyn ItemStore>, Error>;
}
