//! Purpose: Session and per-operation request types shared by transports and backends.
//! Exports: `Session`, `Secret`, `Credentials`, `SaveMode`, `ReadRequest`, `WriteRequest`,
//! `CreateRequest`, `DeleteRequest`, `ExecRequest`, `HistoryRequest`, `ErrorOptions`.
//! Role: Transports decode into these types; the API layer seals credentials before dispatch.
//! Invariants: After `seal`, the session's password and token fields are empty and the
//! secrets live only in `Credentials`, which never serializes and prints as `****`.
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{Error, ErrorKind};
use super::frame::Frame;

const HOME_VAR: &str = "$V3IO_HOME";
const USERS_CONTAINER: &str = "users";

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("****")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("****")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub password: Secret,
    pub token: Secret,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    pub url: String,
    pub container: String,
    pub path: String,
    pub user: String,
    pub password: String,
    pub token: String,
    pub id: String,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("url", &self.url)
            .field("container", &self.container)
            .field("path", &self.path)
            .field("user", &self.user)
            .field("password", &Secret::new(""))
            .field("token", &Secret::new(""))
            .field("id", &self.id)
            .finish()
    }
}

impl Session {
    /// Splits a table reference into `(container, path)`.
    ///
    /// Without a session container the first path segment names the container.
    /// `$V3IO_HOME` maps to the `users` container under the session user's directory.
    pub fn resolve_path(&self, table: &str, add_slash: bool) -> Result<(String, String), Error> {
        let mut container = self.container.clone();
        let mut path = table.to_string();

        if container.is_empty() {
            let Some((head, rest)) = table.split_once('/') else {
                return Err(Error::new(ErrorKind::BadRequest)
                    .with_message("missing data container name")
                    .with_hint("Set the session container or prefix the table, e.g. bigdata/mytable."));
            };
            container = head.to_string();
            path = rest.to_string();
        }

        if container == HOME_VAR {
            container = USERS_CONTAINER.to_string();
            path = format!("{}/{}", self.user, path);
        }

        let home_prefix = format!("{HOME_VAR}/");
        if let Some(expanded) = path
            .strip_prefix(home_prefix.as_str())
            .map(|rest| format!("{}/{}", self.user, rest))
        {
            container = USERS_CONTAINER.to_string();
            path = expanded;
        }

        if add_slash && !path.ends_with('/') {
            path.push('/');
        }
        Ok((container, path))
    }

    /// Fills empty fields from `defaults`.
    pub fn fill_from(&mut self, defaults: &Session) {
        fill(&mut self.url, &defaults.url);
        fill(&mut self.container, &defaults.container);
        fill(&mut self.path, &defaults.path);
        fill(&mut self.user, &defaults.user);
        fill(&mut self.password, &defaults.password);
        fill(&mut self.token, &defaults.token);
        fill(&mut self.id, &defaults.id);
    }
}

fn fill(target: &mut String, value: &str) {
    if target.is_empty() {
        *target = value.to_string();
    }
}

/// Requests that carry a session implement this so secrets can be moved out of it.
pub trait SessionRequest {
    fn session(&self) -> &Session;
    fn session_mut(&mut self) -> &mut Session;
    fn credentials(&self) -> &Credentials;
    fn credentials_mut(&mut self) -> &mut Credentials;

    /// Moves password and token out of the session. Existing credentials win.
    fn seal(&mut self) {
        let password = std::mem::take(&mut self.session_mut().password);
        let token = std::mem::take(&mut self.session_mut().token);
        let credentials = self.credentials_mut();
        if credentials.password.is_empty() {
            credentials.password = Secret::new(password);
        }
        if credentials.token.is_empty() {
            credentials.token = Secret::new(token);
        }
    }
}

macro_rules! session_request {
    ($($ty:ty),* $(,)?) => {
        $(impl SessionRequest for $ty {
            fn session(&self) -> &Session {
                &self.session
            }

            fn session_mut(&mut self) -> &mut Session {
                &mut self.session
            }

            fn credentials(&self) -> &Credentials {
                &self.credentials
            }

            fn credentials_mut(&mut self) -> &mut Credentials {
                &mut self.credentials
            }
        })*
    };
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum SaveMode {
    #[default]
    ErrorIfTableExists,
    OverwriteTable,
    UpdateItem,
    OverwriteItem,
    CreateNewItemsOnly,
}

impl SaveMode {
    pub fn parse(value: &str) -> Result<SaveMode, Error> {
        match value {
            "" | "errorIfTableExists" => Ok(SaveMode::ErrorIfTableExists),
            "overwriteTable" => Ok(SaveMode::OverwriteTable),
            "updateItem" => Ok(SaveMode::UpdateItem),
            "overwriteItem" => Ok(SaveMode::OverwriteItem),
            "createNewItemsOnly" => Ok(SaveMode::CreateNewItemsOnly),
            other => Err(Error::new(ErrorKind::BadRequest)
                .with_message(format!("unknown save mode '{other}'"))
                .with_hint(
                    "Use errorIfTableExists, overwriteTable, updateItem, overwriteItem or createNewItemsOnly.",
                )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SaveMode::ErrorIfTableExists => "errorIfTableExists",
            SaveMode::OverwriteTable => "overwriteTable",
            SaveMode::UpdateItem => "updateItem",
            SaveMode::OverwriteItem => "overwriteItem",
            SaveMode::CreateNewItemsOnly => "createNewItemsOnly",
        }
    }
}

impl fmt::Display for SaveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorOptions {
    #[default]
    Fail,
    Ignore,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadRequest {
    pub session: Session,
    pub backend: String,
    pub table: String,
    pub query: String,
    pub columns: Vec<String>,
    pub filter: String,
    pub group_by: String,
    pub limit: u64,
    pub message_limit: u64,
    pub sharding_keys: Vec<String>,
    pub sort_key_range_start: String,
    pub sort_key_range_end: String,
    pub reset_index: bool,
    pub segments: u32,
    #[serde(skip)]
    pub credentials: Credentials,
}

#[derive(Clone, Debug, Default)]
pub struct WriteRequest {
    pub session: Session,
    pub backend: String,
    pub table: String,
    pub expression: String,
    pub condition: String,
    pub partition_keys: Vec<String>,
    pub save_mode: SaveMode,
    pub initial_data: Option<Frame>,
    pub more: bool,
    pub timeout: Option<Duration>,
    pub credentials: Credentials,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateRequest {
    pub session: Session,
    pub backend: String,
    pub table: String,
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub if_exists: ErrorOptions,
    #[serde(skip)]
    pub credentials: Credentials,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteRequest {
    pub session: Session,
    pub backend: String,
    pub table: String,
    pub filter: String,
    pub if_missing: ErrorOptions,
    #[serde(skip)]
    pub credentials: Credentials,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecRequest {
    pub session: Session,
    pub backend: String,
    pub table: String,
    pub command: String,
    pub args: BTreeMap<String, serde_json::Value>,
    pub expression: String,
    #[serde(skip)]
    pub credentials: Credentials,
}

impl ExecRequest {
    /// String argument, accepting JSON strings and scalars.
    pub fn arg_str(&self, name: &str) -> Option<String> {
        match self.args.get(name)? {
            serde_json::Value::String(value) => Some(value.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryRequest {
    pub session: Session,
    pub backend: String,
    pub table: String,
    pub action: String,
    pub limit: u64,
    #[serde(skip)]
    pub credentials: Credentials,
}

session_request!(
    ReadRequest,
    WriteRequest,
    CreateRequest,
    DeleteRequest,
    ExecRequest,
    HistoryRequest,
);
