//! Purpose: Gateway configuration: JSON file, validation, defaults and session defaults.
//! Exports: `Config`, `BackendConfig`, `LogConfig`, `session_from_env`.
//! Role: Loaded once by the server entry point and shared read-only afterwards.
//! Invariants: After `validate` + `init_defaults`, every backend has a unique name,
//! a type, and `workers >= 1`.
//! Invariants: Password and session key never serialize.
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};
use crate::core::request::Session;

const DEFAULT_WORKERS: usize = 8;
const DEFAULT_UPDATE_WORKERS_PER_VN: usize = 8;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub workers: usize,
    pub update_workers_per_vn: usize,
    pub options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub log: LogConfig,
    pub workers: usize,
    pub update_workers_per_vn: usize,
    pub default_timeout: u64,
    pub limit: u64,
    pub web_api_endpoint: String,
    pub container: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(skip_serializing)]
    pub session_key: String,
    pub backends: Vec<BackendConfig>,
    #[serde(skip)]
    pub env_session: Session,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            workers: DEFAULT_WORKERS,
            update_workers_per_vn: DEFAULT_UPDATE_WORKERS_PER_VN,
            default_timeout: DEFAULT_TIMEOUT_SECS,
            limit: 0,
            web_api_endpoint: String::new(),
            container: String::new(),
            username: String::new(),
            password: String::new(),
            session_key: String::new(),
            backends: Vec::new(),
            env_session: Session::default(),
        }
    }
}

impl Config {
    /// Single `kv` backend with defaults applied; handy for embedding and tests.
    pub fn with_kv_backend() -> Config {
        let mut config = Config {
            backends: vec![BackendConfig {
                kind: "kv".to_string(),
                ..BackendConfig::default()
            }],
            ..Config::default()
        };
        config.init_defaults();
        config
    }

    pub fn from_json(data: &str) -> Result<Config, Error> {
        serde_json::from_str(data).map_err(|err| {
            Error::new(ErrorKind::BadRequest)
                .with_message("invalid configuration")
                .with_source(err)
        })
    }

    pub fn from_path(path: &Path) -> Result<Config, Error> {
        let data = std::fs::read_to_string(path).map_err(|err| {
            Error::new(ErrorKind::NotFound)
                .with_message(format!("cannot read configuration {}", path.display()))
                .with_source(err)
        })?;
        Config::from_json(&data)
    }

    /// Loads, validates and fills defaults.
    pub fn load(path: &Path) -> Result<Config, Error> {
        let mut config = Config::from_path(path)?;
        config.validate()?;
        config.init_defaults();
        Ok(config)
    }

    pub fn validate(&mut self) -> Result<(), Error> {
        if self.backends.is_empty() {
            return Err(Error::new(ErrorKind::BadRequest)
                .with_message("no backends")
                .with_hint("Add at least one entry to \"backends\", e.g. {\"type\": \"kv\"}."));
        }
        if self.workers == 0 {
            return Err(Error::new(ErrorKind::BadRequest).with_message("workers must be at least 1"));
        }
        let level = self.log.level.to_ascii_lowercase();
        if !level.is_empty() && !LOG_LEVELS.contains(&level.as_str()) {
            return Err(Error::new(ErrorKind::BadRequest)
                .with_message(format!("unknown log level '{}'", self.log.level)));
        }

        let mut names = HashSet::new();
        for (position, backend) in self.backends.iter_mut().enumerate() {
            if backend.name.is_empty() {
                backend.name = backend.kind.clone();
            }
            if backend.kind.is_empty() {
                return Err(Error::new(ErrorKind::BadRequest)
                    .with_message(format!("backend '{}' missing type", backend.name)));
            }
            if !names.insert(backend.name.clone()) {
                return Err(Error::new(ErrorKind::BadRequest).with_message(format!(
                    "backend {position} - duplicate name '{}'",
                    backend.name
                )));
            }
        }
        Ok(())
    }

    pub fn init_defaults(&mut self) {
        if self.default_timeout == 0 {
            self.default_timeout = DEFAULT_TIMEOUT_SECS;
        }
        if self.log.level.is_empty() {
            self.log.level = "info".to_string();
        }
        for backend in &mut self.backends {
            if backend.name.is_empty() {
                backend.name = backend.kind.clone();
            }
            if backend.workers == 0 {
                backend.workers = self.workers.max(1);
            }
            if backend.update_workers_per_vn == 0 {
                backend.update_workers_per_vn = if self.update_workers_per_vn == 0 {
                    DEFAULT_UPDATE_WORKERS_PER_VN
                } else {
                    self.update_workers_per_vn
                };
            }
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout.max(1))
    }

    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|backend| backend.name == name)
    }

    /// Resolves environment session defaults through `lookup`.
    pub fn load_env_session<F>(&mut self, lookup: F) -> Result<(), Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.env_session = session_from_env(lookup)?;
        Ok(())
    }

    /// Fills blank session fields from the environment, then from this config.
    pub fn fill_session(&self, session: &mut Session) {
        session.fill_from(&self.env_session);
        session.fill_from(&Session {
            url: self.web_api_endpoint.clone(),
            container: self.container.clone(),
            user: self.username.clone(),
            password: self.password.clone(),
            token: self.session_key.clone(),
            ..Session::default()
        });
    }
}

/// Session fields from `V3IO_SESSION` (JSON or `k=v,k=v`), then the individual
/// `V3IO_*` variables.
pub fn session_from_env<F>(lookup: F) -> Result<Session, Error>
where
    F: Fn(&str) -> Option<String>,
{
    let mut session = match lookup("V3IO_SESSION").filter(|data| !data.trim().is_empty()) {
        Some(data) => parse_env_session(&data)?,
        None => Session::default(),
    };

    let var = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| lookup(name).filter(|value| !value.is_empty()))
            .unwrap_or_default()
    };
    session.fill_from(&Session {
        url: var(&["V3IO_URL", "V3IO_API"]),
        container: var(&["V3IO_CONTAINER"]),
        path: var(&["V3IO_PATH"]),
        user: var(&["V3IO_USER", "V3IO_USERNAME"]),
        password: var(&["V3IO_PASSWORD"]),
        token: var(&["V3IO_ACCESS_KEY", "V3IO_TOKEN"]),
        id: String::new(),
    });
    Ok(session)
}

fn parse_env_session(data: &str) -> Result<Session, Error> {
    let data = data.trim();
    if data.starts_with('{') {
        return serde_json::from_str(data).map_err(|err| {
            Error::new(ErrorKind::BadRequest)
                .with_message("invalid V3IO_SESSION JSON")
                .with_source(err)
        });
    }

    let mut session = Session::default();
    for pair in data.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(Error::new(ErrorKind::BadRequest)
                .with_message(format!("invalid V3IO_SESSION entry '{pair}'")));
        };
        let value = value.trim().to_string();
        match key.trim() {
            "url" => session.url = value,
            "container" => session.container = value,
            "path" => session.path = value,
            "user" => session.user = value,
            "password" => session.password = value,
            "token" => session.token = value,
            "id" => session.id = value,
            other => {
                return Err(Error::new(ErrorKind::BadRequest)
                    .with_message(format!("unknown V3IO_SESSION key '{other}'")));
            }
        }
    }
    Ok(session)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::{Config, session_from_env};
    use crate::core::error::ErrorKind;
    use crate::core::request::Session;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn load_applies_names_and_worker_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"{{"workers": 4, "backends": [{{"type": "kv"}}, {{"type": "kv", "name": "kv2", "workers": 2}}]}}"#
        )
        .expect("write config");

        let config = Config::load(file.path()).expect("load");
        assert_eq!(config.backends[0].name, "kv");
        assert_eq!(config.backends[0].workers, 4);
        assert_eq!(config.backends[1].workers, 2);
        assert_eq!(config.backends[1].update_workers_per_vn, 8);
        assert_eq!(config.default_timeout, 30);
    }

    #[test]
    fn validate_rejects_bad_backend_lists() {
        let cases = [
            r#"{"backends": []}"#,
            r#"{"backends": [{"name": "x"}]}"#,
            r#"{"backends": [{"type": "kv"}, {"type": "kv"}]}"#,
            r#"{"log": {"level": "loud"}, "backends": [{"type": "kv"}]}"#,
        ];
        for case in cases {
            let mut config = Config::from_json(case).expect("parse");
            let err = config.validate().expect_err(case);
            assert_eq!(err.kind(), ErrorKind::BadRequest, "{case}");
        }
    }

    #[test]
    fn secrets_do_not_serialize() {
        let config = Config::from_json(
            r#"{"password": "hunter2", "sessionKey": "abc", "backends": [{"type": "kv"}]}"#,
        )
        .expect("parse");
        let json = serde_json::to_string(&config).expect("json");
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("abc"));
    }

    #[test]
    fn env_session_accepts_json_and_pairs() {
        let session = session_from_env(env(&[(
            "V3IO_SESSION",
            r#"{"container": "bigdata", "user": "iguazio"}"#,
        )]))
        .expect("json");
        assert_eq!(session.container, "bigdata");

        let session = session_from_env(env(&[
            ("V3IO_SESSION", "container=users, user=alice"),
            ("V3IO_ACCESS_KEY", "key-1"),
            ("V3IO_CONTAINER", "ignored"),
        ]))
        .expect("pairs");
        assert_eq!(session.container, "users");
        assert_eq!(session.user, "alice");
        assert_eq!(session.token, "key-1");

        let err = session_from_env(env(&[("V3IO_SESSION", "colour=blue")])).expect_err("bad key");
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn request_session_wins_over_env_and_config() {
        let mut config = Config::with_kv_backend();
        config.container = "from-config".to_string();
        config.username = "config-user".to_string();
        config
            .load_env_session(env(&[("V3IO_USER", "env-user")]))
            .expect("env");

        let mut session = Session {
            url: "http://request".to_string(),
            ..Session::default()
        };
        config.fill_session(&mut session);
        assert_eq!(session.url, "http://request");
        assert_eq!(session.user, "env-user");
        assert_eq!(session.container, "from-config");
    }
}
