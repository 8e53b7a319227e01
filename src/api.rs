//! Purpose: Transport-independent entry point for every gateway operation.
//! Exports: `Api`, `HistoryEntry`, `DEFAULT_WRITE_TIMEOUT`, `HISTORY_CAPACITY`.
//! Role: Seals credentials, resolves the backend, enforces timeouts, records history.
//! Invariants: Secrets are moved out of sessions before anything is logged.
//! Invariants: Read frames reach `out` in the order the backend produced them; a
//! closed `out` cancels the backend read.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use crate::backends::{Backend, BackendContext, IoContext, registry};
use crate::config::Config;
use crate::core::column::Column;
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::Frame;
use crate::core::request::{
    CreateRequest, DeleteRequest, ExecRequest, HistoryRequest, ReadRequest, SessionRequest,
    WriteRequest,
};
use crate::core::sql::parse_sql;

/// Completion wait for writes that carry no timeout of their own.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(3 * 60);
/// Completed calls kept for `history`.
pub const HISTORY_CAPACITY: usize = 1024;

static REQUEST_IDS: AtomicU64 = AtomicU64::new(0);

pub fn next_request_id() -> u64 {
    REQUEST_IDS.fetch_add(1, Ordering::Relaxed) + 1
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: u64,
    pub action: String,
    pub backend: String,
    pub table: String,
    /// Nanoseconds since the Unix epoch.
    pub start: i64,
    pub duration_ms: u64,
}

pub struct Api {
    config: Arc<Config>,
    backends: HashMap<String, Arc<dyn Backend>>,
    history: Mutex<VecDeque<HistoryEntry>>,
    instance: String,
    started: Instant,
}

/// Per-call bookkeeping shared by every operation.
struct Call {
    id: u64,
    action: &'static str,
    backend: String,
    table: String,
    start: OffsetDateTime,
    clock: Instant,
}

impl Api {
    /// Instantiates every configured backend through the registry.
    pub fn new(config: Arc<Config>, io: IoContext) -> Result<Api, Error> {
        registry::init();
        let mut backends = HashMap::new();
        for backend in &config.backends {
            let factory = registry::factory(&backend.kind).ok_or_else(|| {
                Error::new(ErrorKind::UnknownBackend)
                    .with_message(format!("unknown backend type '{}'", backend.kind))
                    .with_hint(format!("Known types: {}.", registry::kinds().join(", ")))
            })?;
            let ctx = BackendContext {
                span: info_span!("backend", name = %backend.name, kind = %backend.kind),
                io: io.clone(),
                backend: backend.clone(),
                config: config.clone(),
            };
            let instance = factory(ctx)?;
            backends.insert(backend.name.clone(), instance);
        }
        Ok(Api {
            config,
            backends,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            instance: instance_id(),
            started: Instant::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Random per-process identifier reported by status.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn status(&self) -> serde_json::Value {
        let mut backends: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        backends.sort_unstable();
        serde_json::json!({
            "status": "running",
            "instance": self.instance,
            "uptime_ms": self.started.elapsed().as_millis() as u64,
            "backends": backends,
        })
    }

    fn backend(&self, name: &str) -> Result<Arc<dyn Backend>, Error> {
        if name.is_empty() {
            return Err(Error::new(ErrorKind::BadRequest).with_message("missing backend name"));
        }
        self.backends.get(name).cloned().ok_or_else(|| {
            Error::new(ErrorKind::UnknownBackend).with_message(format!("unknown backend '{name}'"))
        })
    }

    fn begin(&self, action: &'static str, backend: &str, table: &str) -> Call {
        let call = Call {
            id: next_request_id(),
            action,
            backend: backend.to_string(),
            table: table.to_string(),
            start: OffsetDateTime::now_utc(),
            clock: Instant::now(),
        };
        debug!(id = call.id, action, backend, table, "request");
        call
    }

    fn finish<T>(&self, call: Call, result: Result<T, Error>) -> Result<T, Error> {
        let elapsed = call.clock.elapsed();
        let duration_ms = elapsed.as_millis() as u64;
        match &result {
            Ok(_) => info!(
                id = call.id,
                action = call.action,
                backend = %call.backend,
                table = %call.table,
                duration_ms,
                "request done"
            ),
            Err(err) => warn!(
                id = call.id,
                action = call.action,
                backend = %call.backend,
                table = %call.table,
                duration_ms,
                "request failed: {err}"
            ),
        }
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(HistoryEntry {
            id: call.id,
            action: call.action.to_string(),
            backend: call.backend,
            table: call.table,
            start: call.start.unix_timestamp_nanos() as i64,
            duration_ms,
        });
        result
    }

    /// Streams the frames of a read into `out`.
    pub async fn read(
        &self,
        mut request: ReadRequest,
        out: mpsc::Sender<Frame>,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        request.seal();
        let merged = self.merge_query(&mut request);
        let call = self.begin("read", &request.backend, &request.table);
        let result = match merged {
            Ok(()) => self.pump(request, out, cancel).await,
            Err(err) => Err(err),
        };
        self.finish(call, result)
    }

    async fn pump(
        &self,
        mut request: ReadRequest,
        out: mpsc::Sender<Frame>,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        let backend = self.backend(&request.backend)?;
        if self.config.limit > 0 && (request.limit == 0 || request.limit > self.config.limit) {
            request.limit = self.config.limit;
        }
        let mut frames = backend.read(request, cancel.clone()).await?;
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            let sent = tokio::select! {
                sent = out.send(frame) => sent.is_ok(),
                _ = cancel.cancelled() => false,
            };
            if !sent {
                debug!("read consumer went away");
                frames.cancel();
                break;
            }
        }
        Ok(())
    }

    /// Parses `query` into the request's table, columns, filter and group-by.
    fn merge_query(&self, request: &mut ReadRequest) -> Result<(), Error> {
        if request.query.trim().is_empty() {
            return Ok(());
        }
        if !request.table.is_empty()
            || !request.columns.is_empty()
            || !request.filter.is_empty()
            || !request.group_by.is_empty()
        {
            return Err(Error::new(ErrorKind::BadRequest)
                .with_message("both query AND table/columns/filter/group_by provided"));
        }
        let query = parse_sql(&request.query)?;
        request.table = query.table;
        request.columns = query.columns;
        request.filter = query.filter;
        request.group_by = query.group_by;
        if request.limit == 0 {
            request.limit = query.limit.unwrap_or(0);
        }
        Ok(())
    }

    /// Feeds every frame from `frames` to the backend; returns `(frames, rows)`.
    pub async fn write(
        &self,
        mut request: WriteRequest,
        mut frames: mpsc::Receiver<Frame>,
    ) -> Result<(u64, u64), Error> {
        request.seal();
        let call = self.begin("write", &request.backend, &request.table);
        let result = async {
            let backend = self.backend(&request.backend)?;
            let timeout = request.timeout.unwrap_or(DEFAULT_WRITE_TIMEOUT);
            let (mut nframes, mut nrows) = match &request.initial_data {
                Some(frame) => (1u64, frame.len() as u64),
                None => (0, 0),
            };
            let mut appender = backend.write(request).await?;
            while let Some(frame) = frames.recv().await {
                nframes += 1;
                nrows += frame.len() as u64;
                appender.add(frame).await?;
            }
            if nrows > 0 {
                appender.wait_for_complete(timeout).await?;
            }
            Ok((nframes, nrows))
        }
        .await;
        self.finish(call, result)
    }

    async fn unary<T, F>(&self, call: Call, operation: F) -> Result<T, Error>
    where
        F: std::future::Future<Output = Result<T, Error>>,
    {
        let timeout = self.config.default_timeout();
        let result = match tokio::time::timeout(timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorKind::Timeout).with_message(format!(
                "{} timed out after {} seconds",
                call.action,
                timeout.as_secs()
            ))),
        };
        self.finish(call, result)
    }

    pub async fn create(&self, mut request: CreateRequest) -> Result<(), Error> {
        request.seal();
        let call = self.begin("create", &request.backend, &request.table);
        let backend = self.backend(&request.backend);
        self.unary(call, async move { backend?.create(request).await }).await
    }

    pub async fn delete(&self, mut request: DeleteRequest) -> Result<(), Error> {
        request.seal();
        let call = self.begin("delete", &request.backend, &request.table);
        let backend = self.backend(&request.backend);
        self.unary(call, async move { backend?.delete(request).await }).await
    }

    pub async fn exec(&self, mut request: ExecRequest) -> Result<Option<Frame>, Error> {
        request.seal();
        let call = self.begin("exec", &request.backend, &request.table);
        let backend = self.backend(&request.backend);
        self.unary(call, async move { backend?.exec(request).await }).await
    }

    /// Completed calls as a frame, oldest first, filtered by the request fields.
    pub fn history(&self, request: &HistoryRequest) -> Result<Frame, Error> {
        let entries: Vec<HistoryEntry> = {
            let history = self
                .history
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            history
                .iter()
                .filter(|entry| request.backend.is_empty() || entry.backend == request.backend)
                .filter(|entry| request.table.is_empty() || entry.table == request.table)
                .filter(|entry| request.action.is_empty() || entry.action == request.action)
                .cloned()
                .collect()
        };
        let skip = match request.limit as usize {
            0 => 0,
            limit => entries.len().saturating_sub(limit),
        };
        let entries = &entries[skip..];
        Frame::new(
            vec![
                Column::dense("id", entries.iter().map(|e| e.id as i64).collect::<Vec<_>>()),
                Column::dense("action", entries.iter().map(|e| e.action.clone()).collect::<Vec<_>>()),
                Column::dense("backend", entries.iter().map(|e| e.backend.clone()).collect::<Vec<_>>()),
                Column::dense("table", entries.iter().map(|e| e.table.clone()).collect::<Vec<_>>()),
                Column::times("start", entries.iter().map(|e| e.start).collect()),
                Column::dense(
                    "duration_ms",
                    entries.iter().map(|e| e.duration_ms as i64).collect::<Vec<_>>(),
                ),
            ],
            Vec::new(),
        )
    }
}

fn instance_id() -> String {
    let mut bytes = [0u8; 8];
    if getrandom::fill(&mut bytes).is_err() {
        return format!("{:016x}", OffsetDateTime::now_utc().unix_timestamp_nanos() as u64);
    }
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
