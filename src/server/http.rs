//! Purpose: HTTP transport for the gateway.
//! Exports: `router`, `run`, `ACCESS_KEY_USER`.
//! Role: Axum routes for read/write/create/delete/exec/history, status/config, and a
//! Grafana SimpleJSON endpoint.
//! Invariants: Envelope parse failures answer 400, every other failure answers 500
//! with `{"error", "kind"}`. `/read` streams length-prefixed records and reports a
//! late failure as a trailing `Error` record.
use std::future::IntoFuture;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::api::Api;
use crate::backends::READ_CHANNEL_CAPACITY;
use crate::core::codec::{Message, RecordDecoder, decode_frame, encode_record, frame_to_bytes};
use crate::core::dtype::{DType, Value};
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::Frame;
use crate::core::request::{
    CreateRequest, DeleteRequest, ExecRequest, HistoryRequest, ReadRequest, Session,
};

/// Basic-auth user name meaning "the password is an access token".
pub const ACCESS_KEY_USER: &str = "__ACCESS_KEY";
const GRAFANA_DEFAULT_BACKEND: &str = "kv";

#[derive(Clone)]
struct AppState {
    api: Arc<Api>,
}

pub fn router(api: Arc<Api>, max_body_bytes: usize) -> Router {
    let state = Arc::new(AppState { api });
    Router::new()
        .route("/", get(status))
        .route("/_/status", get(status))
        .route("/_/config", get(config))
        .route("/read", post(read))
        .route("/write", post(write))
        .route("/create", post(create))
        .route("/delete", post(delete))
        .route("/exec", post(exec))
        .route("/history", post(history))
        .route("/grafana", get(grafana_ping))
        .route("/grafana/query", post(grafana_query))
        .route("/grafana/search", post(grafana_search))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<(), Error> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .into_future()
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Transport)
                .with_message("http server failed")
                .with_source(err)
        })
}

async fn status(State(state): State<Arc<AppState>>) -> Response {
    json_response(state.api.status())
}

async fn config(State(state): State<Arc<AppState>>) -> Response {
    match serde_json::to_value(state.api.config()) {
        Ok(value) => json_response(value),
        Err(err) => error_response(
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode config")
                .with_source(err),
        ),
    }
}

async fn read(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let mut request: ReadRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(err) => return bad_request(err),
    };
    apply_auth(&headers, &mut request.session);

    let mut messages = super::spawn_read(state.api.clone(), request);
    let (tx, rx) = mpsc::channel::<Result<Bytes, Error>>(READ_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            let record = encode_record(&message);
            let failed = record.is_err();
            if tx.send(record).await.is_err() || failed {
                break;
            }
        }
    });

    let stream = ReceiverStream::new(rx)
        .map(|result| result.map_err(|err| std::io::Error::other(err.to_string())));
    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        "content-type",
        HeaderValue::from_static("application/octet-stream"),
    );
    response
}

async fn write(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Body) -> Response {
    let mut chunks = body.into_data_stream();
    let mut decoder = RecordDecoder::new();

    let header = loop {
        match decoder.next_message() {
            Ok(Some(Message::InitialWrite(header))) => break header,
            Ok(Some(other)) => {
                return bad_request(Error::new(ErrorKind::BadRequest).with_message(format!(
                    "bad write request - expected initial_write, got {}",
                    other.name()
                )));
            }
            Ok(None) => {}
            Err(err) => return bad_request(err),
        }
        match chunks.next().await {
            Some(Ok(chunk)) => decoder.push(&chunk),
            Some(Err(err)) => {
                return bad_request(
                    Error::new(ErrorKind::Transport)
                        .with_message("failed to read request body")
                        .with_source(err),
                );
            }
            None => {
                return bad_request(
                    Error::new(ErrorKind::BadRequest).with_message("bad write request"),
                );
            }
        }
    };
    let mut request = match header.into_request() {
        Ok(request) => request,
        Err(err) => return bad_request(err),
    };
    apply_auth(&headers, &mut request.session);

    let (frames_tx, frames_rx) = mpsc::channel::<Frame>(1);
    let api = state.api.clone();
    let writing = tokio::spawn(async move { api.write(request, frames_rx).await });

    let decoded: Result<(), Error> = async {
        loop {
            while let Some(message) = decoder.next_message()? {
                match message {
                    Message::FrameChunk(payload) => {
                        let frame = decode_frame(payload)?;
                        if frames_tx.send(frame).await.is_err() {
                            return Ok(());
                        }
                    }
                    Message::End => return Ok(()),
                    other => {
                        return Err(Error::new(ErrorKind::BadRequest).with_message(format!(
                            "unexpected {} record in write stream",
                            other.name()
                        )));
                    }
                }
            }
            match chunks.next().await {
                Some(Ok(chunk)) => decoder.push(&chunk),
                Some(Err(err)) => {
                    return Err(Error::new(ErrorKind::Transport)
                        .with_message("failed to read request body")
                        .with_source(err));
                }
                None if decoder.has_partial() => {
                    return Err(Error::new(ErrorKind::Transport).with_message("truncated record"));
                }
                None => return Ok(()),
            }
        }
    }
    .await;
    drop(frames_tx);

    let written = match writing.await {
        Ok(written) => written,
        Err(err) => Err(Error::new(ErrorKind::Internal)
            .with_message("write task failed")
            .with_source(err)),
    };
    if let Err(err) = decoded {
        warn!("write decode error: {err}");
        return error_response(err);
    }
    match written {
        Ok((frames, rows)) => json_response(json!({ "num_frames": frames, "num_rows": rows })),
        Err(err) => error_response(err),
    }
}

async fn create(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let mut request: CreateRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(err) => return bad_request(err),
    };
    apply_auth(&headers, &mut request.session);
    match state.api.create(request).await {
        Ok(()) => json_response(json!({ "ok": true })),
        Err(err) => error_response(err),
    }
}

async fn delete(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let mut request: DeleteRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(err) => return bad_request(err),
    };
    apply_auth(&headers, &mut request.session);
    match state.api.delete(request).await {
        Ok(()) => json_response(json!({ "ok": true })),
        Err(err) => error_response(err),
    }
}

async fn exec(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let mut request: ExecRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(err) => return bad_request(err),
    };
    apply_auth(&headers, &mut request.session);
    match state.api.exec(request).await {
        Ok(frame) => frame_response(frame.as_ref()),
        Err(err) => error_response(err),
    }
}

async fn history(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let mut request: HistoryRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(err) => return bad_request(err),
    };
    apply_auth(&headers, &mut request.session);
    match state.api.history(&request) {
        Ok(frame) => frame_response(Some(&frame)),
        Err(err) => error_response(err),
    }
}

/// `{"frame": "<base64>"}`; an empty string when there is no frame.
fn frame_response(frame: Option<&Frame>) -> Response {
    let encoded = match frame.map(frame_to_bytes).transpose() {
        Ok(bytes) => bytes.map(|bytes| STANDARD.encode(bytes)).unwrap_or_default(),
        Err(err) => return error_response(err),
    };
    json_response(json!({ "frame": encoded }))
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, Error> {
    let body = if body.is_empty() { b"{}".as_slice() } else { body };
    serde_json::from_slice(body).map_err(|err| {
        Error::new(ErrorKind::BadRequest)
            .with_message(format!("bad request - {err}"))
            .with_source(err)
    })
}

/// Fills session credentials from `Authorization: Basic|Bearer`.
fn apply_auth(headers: &HeaderMap, session: &mut Session) {
    let Some(value) = headers.get(axum::http::header::AUTHORIZATION) else {
        return;
    };
    let value = value.to_str().unwrap_or_default();
    if let Some(encoded) = value.strip_prefix("Basic ") {
        let decoded = match STANDARD.decode(encoded.trim()) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("error in basic auth, can't base64 decode: {err}");
                return;
            }
        };
        let decoded = String::from_utf8_lossy(&decoded);
        let Some((user, password)) = decoded.split_once(':') else {
            warn!("error in basic auth, can't find ':'");
            return;
        };
        if user == ACCESS_KEY_USER {
            session.token = password.to_string();
        } else {
            session.user = user.to_string();
            session.password = password.to_string();
        }
    } else if let Some(token) = value.strip_prefix("Bearer ") {
        session.token = token.trim().to_string();
    } else {
        warn!("unknown auth scheme");
    }
}

fn json_response(payload: serde_json::Value) -> Response {
    Json(payload).into_response()
}

fn bad_request(err: Error) -> Response {
    debug!("rejecting request: {err}");
    error_response_with_status(err, StatusCode::BAD_REQUEST)
}

fn error_response(err: Error) -> Response {
    error_response_with_status(err, StatusCode::INTERNAL_SERVER_ERROR)
}

fn error_response_with_status(err: Error, status: StatusCode) -> Response {
    let body = json!({
        "error": err.message().unwrap_or("error"),
        "kind": err.kind().as_str(),
    });
    (status, Json(body)).into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GrafanaBody {
    targets: Vec<serde_json::Map<String, serde_json::Value>>,
    target: String,
}

/// Read parameters carried in a SimpleJSON target string such as
/// `fields=a,b;table_name=t;backend=kv;filter=x > 1`.
#[derive(Debug, Default, PartialEq)]
struct GrafanaQuery {
    fields: Vec<String>,
    table: String,
    backend: String,
    filter: String,
    container: String,
}

impl GrafanaQuery {
    fn parse_line(&mut self, line: &str) {
        for part in line.split(';') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim() {
                "fields" => self.fields = value.split(',').map(|f| f.trim().to_string()).collect(),
                "table_name" => self.table = value,
                "backend" => self.backend = value,
                "filter" => self.filter = value,
                "container" => self.container = value,
                _ => {}
            }
        }
    }

    fn parse(body: &[u8], search: bool) -> Result<GrafanaQuery, Error> {
        let body: GrafanaBody = parse_body(body)?;
        let mut query = GrafanaQuery {
            backend: GRAFANA_DEFAULT_BACKEND.to_string(),
            ..GrafanaQuery::default()
        };
        if search {
            query.parse_line(&body.target);
        } else {
            for target in &body.targets {
                if let Some(line) = target.get("target").and_then(|value| value.as_str()) {
                    query.parse_line(line);
                }
            }
        }
        Ok(query)
    }

    fn read_request(&self, headers: &HeaderMap) -> ReadRequest {
        let mut request = ReadRequest {
            backend: self.backend.clone(),
            table: self.table.clone(),
            columns: self.fields.clone(),
            filter: self.filter.clone(),
            ..ReadRequest::default()
        };
        request.session.container = self.container.clone();
        apply_auth(headers, &mut request.session);
        request
    }
}

async fn grafana_ping() -> Response {
    json_response(json!({ "status": "ok" }))
}

async fn grafana_query(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let query = match GrafanaQuery::parse(&body, false) {
        Ok(query) => query,
        Err(err) => return bad_request(err),
    };
    let frames = match read_all(&state.api, query.read_request(&headers)).await {
        Ok(frames) => frames,
        Err(err) => return error_response(err),
    };
    let mut tables = Vec::with_capacity(frames.len());
    for frame in &frames {
        match table_output(frame, &query.fields) {
            Ok(table) => tables.push(table),
            Err(err) => return error_response(err),
        }
    }
    json_response(serde_json::Value::Array(tables))
}

async fn grafana_search(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let query = match GrafanaQuery::parse(&body, true) {
        Ok(query) => query,
        Err(err) => return bad_request(err),
    };
    let frames = match read_all(&state.api, query.read_request(&headers)).await {
        Ok(frames) => frames,
        Err(err) => return error_response(err),
    };
    let mut values = Vec::new();
    for frame in &frames {
        for row in frame.rows(true) {
            for field in &query.fields {
                values.push(value_json(row.get(field)));
            }
        }
    }
    json_response(serde_json::Value::Array(values))
}

async fn read_all(api: &Arc<Api>, request: ReadRequest) -> Result<Vec<Frame>, Error> {
    let mut messages = super::spawn_read(api.clone(), request);
    let mut frames = Vec::new();
    while let Some(message) = messages.recv().await {
        match message {
            Message::FrameChunk(payload) => frames.push(decode_frame(payload)?),
            Message::Error(payload) => return Err(payload.into_error()),
            _ => {}
        }
    }
    Ok(frames)
}

fn table_output(frame: &Frame, fields: &[String]) -> Result<serde_json::Value, Error> {
    let fields: Vec<String> = if fields.is_empty() || fields[0] == "*" {
        let mut names: Vec<String> = frame.names().into_iter().map(str::to_string).collect();
        names.sort();
        names
    } else {
        fields.to_vec()
    };
    let mut columns = Vec::with_capacity(fields.len());
    for field in &fields {
        let column = frame.find(field).ok_or_else(|| {
            Error::new(ErrorKind::NotFound).with_message(format!("column '{field}' not found"))
        })?;
        let kind = match column.dtype() {
            DType::Int64 | DType::Float64 => "number",
            DType::TimestampNs => "time",
            DType::Bool => "boolean",
            DType::String => "string",
        };
        columns.push(json!({ "text": field, "type": kind }));
    }
    let rows: Vec<serde_json::Value> = frame
        .rows(true)
        .map(|row| {
            serde_json::Value::Array(fields.iter().map(|field| value_json(row.get(field))).collect())
        })
        .collect();
    Ok(json!({ "type": "table", "columns": columns, "rows": rows }))
}

fn value_json(value: Option<Value>) -> serde_json::Value {
    value.map_or(serde_json::Value::Null, |value| value.to_json())
}
