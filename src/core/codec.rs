//! Purpose: Wire encoding for frames and transport messages.
//! Exports: `Message`, `FramePayload`, `ColumnPayload`, `WriteHeader`, `ErrorPayload`,
//! `AckPayload`, `RecordDecoder`, record read/write helpers, frame (de)serialization.
//! Role: Every record is a 4-byte big-endian length followed by a MessagePack map.
//! Invariants: Unknown fields are ignored; unknown dtypes fail with `UnsupportedDType`.
//! Invariants: A column payload populates exactly the array matching its dtype.
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::column::{Column, ColumnData};
use super::dtype::{DType, Value};
use super::error::{Error, ErrorKind};
use super::frame::{Frame, FrameParts, NullMask};
use super::request::{
    CreateRequest, Credentials, DeleteRequest, ExecRequest, HistoryRequest, ReadRequest, SaveMode,
    Session, WriteRequest,
};

pub const MAX_RECORD_BYTES: usize = 256 * 1024 * 1024;
const LENGTH_PREFIX: usize = 4;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnPayload {
    pub name: String,
    pub dtype: String,
    #[serde(default)]
    pub label: bool,
    #[serde(default)]
    pub len: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bools: Vec<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ints: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub floats: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub strings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub times: Vec<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FramePayload {
    #[serde(default)]
    pub columns: Vec<ColumnPayload>,
    #[serde(default)]
    pub indices: Vec<ColumnPayload>,
    #[serde(default)]
    pub labels: BTreeMap<String, Value>,
    #[serde(default)]
    pub nulls: Option<Vec<Vec<String>>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WriteHeader {
    #[serde(default)]
    pub session: Session,
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub expression: String,
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub partition_keys: Vec<String>,
    #[serde(default)]
    pub save_mode: String,
    #[serde(default)]
    pub initial_data: Option<FramePayload>,
    #[serde(default)]
    pub more: bool,
    #[serde(default)]
    pub timeout_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    #[serde(default)]
    pub frames: u64,
    #[serde(default)]
    pub rows: u64,
    #[serde(default)]
    pub frame: Option<FramePayload>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    InitialWrite(WriteHeader),
    FrameChunk(FramePayload),
    Error(ErrorPayload),
    Ack(AckPayload),
    Read(ReadRequest),
    Create(CreateRequest),
    Delete(DeleteRequest),
    Exec(ExecRequest),
    History(HistoryRequest),
    End,
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::InitialWrite(_) => "initial_write",
            Message::FrameChunk(_) => "frame_chunk",
            Message::Error(_) => "error",
            Message::Ack(_) => "ack",
            Message::Read(_) => "read",
            Message::Create(_) => "create",
            Message::Delete(_) => "delete",
            Message::Exec(_) => "exec",
            Message::History(_) => "history",
            Message::End => "end",
        }
    }
}

impl From<&Error> for ErrorPayload {
    fn from(err: &Error) -> Self {
        ErrorPayload {
            kind: err.kind().as_str().to_string(),
            message: err.message().unwrap_or("error").to_string(),
        }
    }
}

impl ErrorPayload {
    pub fn into_error(self) -> Error {
        Error::new(ErrorKind::parse(&self.kind)).with_message(self.message)
    }
}

impl WriteHeader {
    pub fn from_request(request: &WriteRequest) -> WriteHeader {
        WriteHeader {
            session: request.session.clone(),
            backend: request.backend.clone(),
            table: request.table.clone(),
            expression: request.expression.clone(),
            condition: request.condition.clone(),
            partition_keys: request.partition_keys.clone(),
            save_mode: request.save_mode.as_str().to_string(),
            initial_data: request.initial_data.as_ref().map(encode_frame),
            more: request.more,
            timeout_ms: request
                .timeout
                .map(|timeout| timeout.as_millis() as u64)
                .unwrap_or(0),
        }
    }

    pub fn into_request(self) -> Result<WriteRequest, Error> {
        let save_mode = SaveMode::parse(&self.save_mode)?;
        let initial_data = self.initial_data.map(decode_frame).transpose()?;
        Ok(WriteRequest {
            session: self.session,
            backend: self.backend,
            table: self.table,
            expression: self.expression,
            condition: self.condition,
            partition_keys: self.partition_keys,
            save_mode,
            initial_data,
            more: self.more,
            timeout: (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms)),
            credentials: Credentials::default(),
        })
    }
}

pub fn encode_frame(frame: &Frame) -> FramePayload {
    FramePayload {
        columns: frame.columns().iter().map(encode_column).collect(),
        indices: frame.indices().iter().map(encode_column).collect(),
        labels: frame.labels().clone(),
        nulls: frame.nulls().map(|mask| {
            mask.rows()
                .iter()
                .map(|nulls| nulls.iter().cloned().collect())
                .collect()
        }),
    }
}

fn encode_column(column: &Column) -> ColumnPayload {
    let mut payload = ColumnPayload {
        name: column.name().to_string(),
        dtype: column.dtype().wire_name().to_string(),
        label: column.is_label(),
        len: column.len() as u64,
        ..ColumnPayload::default()
    };
    match (column.data(), column.label_value()) {
        (Some(ColumnData::Bool(values)), _) => payload.bools = values.clone(),
        (Some(ColumnData::Int(values)), _) => payload.ints = values.clone(),
        (Some(ColumnData::Float(values)), _) => payload.floats = values.clone(),
        (Some(ColumnData::String(values)), _) => payload.strings = values.clone(),
        (Some(ColumnData::Time(values)), _) => payload.times = values.clone(),
        (None, Some(Value::Bool(value))) => payload.bools = vec![*value],
        (None, Some(Value::Int(value))) => payload.ints = vec![*value],
        (None, Some(Value::Float(value))) => payload.floats = vec![*value],
        (None, Some(Value::String(value))) => payload.strings = vec![value.clone()],
        (None, Some(Value::Time(value))) => payload.times = vec![*value],
        (None, None) => {}
    }
    payload
}

pub fn decode_frame(payload: FramePayload) -> Result<Frame, Error> {
    let columns = payload
        .columns
        .into_iter()
        .map(decode_column)
        .collect::<Result<Vec<_>, _>>()?;
    let indices = payload
        .indices
        .into_iter()
        .map(decode_column)
        .collect::<Result<Vec<_>, _>>()?;
    let nulls = payload.nulls.map(|rows| {
        NullMask::from_rows(
            rows.into_iter()
                .map(|names| names.into_iter().collect())
                .collect(),
        )
    });
    Frame::from_parts(FrameParts {
        columns,
        indices,
        labels: payload.labels,
        nulls,
    })
}

fn decode_column(payload: ColumnPayload) -> Result<Column, Error> {
    let dtype = DType::from_wire(&payload.dtype)?;
    let populated = [
        (DType::Bool, payload.bools.len()),
        (DType::Int64, payload.ints.len()),
        (DType::Float64, payload.floats.len()),
        (DType::String, payload.strings.len()),
        (DType::TimestampNs, payload.times.len()),
    ];
    if let Some((other, _)) = populated
        .iter()
        .find(|(kind, count)| *kind != dtype && *count > 0)
    {
        return Err(bad_payload(&payload.name, format!(
            "{dtype} column carries {other} values"
        )));
    }
    let len = usize::try_from(payload.len)
        .map_err(|_| bad_payload(&payload.name, "length does not fit in memory".to_string()))?;
    let expected = if payload.label { 1 } else { len };
    let found = populated
        .iter()
        .find(|(kind, _)| *kind == dtype)
        .map(|(_, count)| *count)
        .unwrap_or(0);
    if found != expected {
        return Err(bad_payload(&payload.name, format!(
            "expected {expected} values, found {found}"
        )));
    }

    let data = match dtype {
        DType::Bool => ColumnData::Bool(payload.bools),
        DType::Int64 => ColumnData::Int(payload.ints),
        DType::Float64 => ColumnData::Float(payload.floats),
        DType::String => ColumnData::String(payload.strings),
        DType::TimestampNs => ColumnData::Time(payload.times),
    };
    if !payload.label {
        return Ok(Column::dense(payload.name, data));
    }
    let value = match data {
        ColumnData::Bool(values) => Value::Bool(values[0]),
        ColumnData::Int(values) => Value::Int(values[0]),
        ColumnData::Float(values) => Value::Float(values[0]),
        ColumnData::String(mut values) => Value::String(values.swap_remove(0)),
        ColumnData::Time(values) => Value::Time(values[0]),
    };
    Ok(Column::label(payload.name, value, len))
}

fn bad_payload(column: &str, detail: String) -> Error {
    Error::new(ErrorKind::BadRequest)
        .with_message(format!("malformed payload for column '{column}': {detail}"))
}

pub fn frame_to_bytes(frame: &Frame) -> Result<Vec<u8>, Error> {
    rmp_serde::to_vec_named(&encode_frame(frame)).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode frame")
            .with_source(err)
    })
}

pub fn frame_from_bytes(bytes: &[u8]) -> Result<Frame, Error> {
    let payload: FramePayload = rmp_serde::from_slice(bytes).map_err(|err| {
        Error::new(ErrorKind::BadRequest)
            .with_message("failed to decode frame")
            .with_source(err)
    })?;
    decode_frame(payload)
}

/// Length-prefixed record for one message.
pub fn encode_record(message: &Message) -> Result<Bytes, Error> {
    let payload = rmp_serde::to_vec_named(message).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message(format!("failed to encode {} message", message.name()))
            .with_source(err)
    })?;
    if payload.len() > MAX_RECORD_BYTES {
        return Err(Error::new(ErrorKind::BadRequest)
            .with_message(format!("record of {} bytes exceeds limit", payload.len()))
            .with_hint("Send the data in smaller frames."));
    }
    let mut record = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
    record.put_u32(payload.len() as u32);
    record.put_slice(&payload);
    Ok(record.freeze())
}

pub fn decode_message(payload: &[u8]) -> Result<Message, Error> {
    rmp_serde::from_slice(payload).map_err(|err| {
        Error::new(ErrorKind::BadRequest)
            .with_message("malformed record")
            .with_source(err)
    })
}

/// Incremental decoder for records arriving in arbitrary chunks.
#[derive(Debug, Default)]
pub struct RecordDecoder {
    buffer: BytesMut,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn next_message(&mut self) -> Result<Option<Message>, Error> {
        if self.buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        check_record_len(len)?;
        if self.buffer.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }
        self.buffer.advance(LENGTH_PREFIX);
        let payload = self.buffer.split_to(len);
        decode_message(&payload).map(Some)
    }
}

fn check_record_len(len: usize) -> Result<(), Error> {
    if len > MAX_RECORD_BYTES {
        return Err(Error::new(ErrorKind::BadRequest)
            .with_message(format!("record length {len} exceeds limit")));
    }
    Ok(())
}

fn transport_error(context: &str, err: io::Error) -> Error {
    Error::new(ErrorKind::Transport)
        .with_message(context.to_string())
        .with_source(err)
}

/// Reads one record; `None` on a clean end of stream between records.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    let mut filled = 0;
    while filled < LENGTH_PREFIX {
        let read = reader
            .read(&mut prefix[filled..])
            .await
            .map_err(|err| transport_error("failed to read record length", err))?;
        if read == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::new(ErrorKind::Transport).with_message("truncated record length"));
        }
        filled += read;
    }
    let len = u32::from_be_bytes(prefix) as usize;
    check_record_len(len)?;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|err| transport_error("truncated record", err))?;
    decode_message(&payload).map(Some)
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let record = encode_record(message)?;
    writer
        .write_all(&record)
        .await
        .map_err(|err| transport_error("failed to write record", err))?;
    writer
        .flush()
        .await
        .map_err(|err| transport_error("failed to flush record", err))
}

pub fn read_message_blocking<R: Read>(reader: &mut R) -> Result<Option<Message>, Error> {
    let mut prefix = [0u8; LENGTH_PREFIX];
    let mut filled = 0;
    while filled < LENGTH_PREFIX {
        let read = reader
            .read(&mut prefix[filled..])
            .map_err(|err| transport_error("failed to read record length", err))?;
        if read == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::new(ErrorKind::Transport).with_message("truncated record length"));
        }
        filled += read;
    }
    let len = u32::from_be_bytes(prefix) as usize;
    check_record_len(len)?;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|err| transport_error("truncated record", err))?;
    decode_message(&payload).map(Some)
}

pub fn write_message_blocking<W: Write>(writer: &mut W, message: &Message) -> Result<(), Error> {
    let record = encode_record(message)?;
    writer
        .write_all(&record)
        .map_err(|err| transport_error("failed to write record", err))
}
