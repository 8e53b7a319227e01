//! Purpose: Clients for a running gateway.
//! Exports: `Client` (blocking HTTP), `FrameReader`, `RpcClient` (async binary RPC).
//! Role: Used by the CLI subcommands and by integration tests.
//! Invariants: Server error bodies decode back into the same `ErrorKind`; a trailing
//! `Error` record on a read stream surfaces as the reader's last item.
use std::io::{BufReader, Read};
use std::net::SocketAddr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{BufReader as AsyncBufReader, BufWriter as AsyncBufWriter};
use tokio::net::TcpStream;
use url::Url;

use crate::core::codec::{
    AckPayload, Message, WriteHeader, decode_frame, encode_frame, encode_record,
    frame_from_bytes, read_message, read_message_blocking, write_message,
};
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::Frame;
use crate::core::request::{
    CreateRequest, DeleteRequest, ExecRequest, HistoryRequest, ReadRequest, WriteRequest,
};

#[derive(Clone, Debug)]
enum Auth {
    Basic { user: String, password: String },
    Bearer(String),
}

/// Blocking HTTP client.
#[derive(Clone)]
pub struct Client {
    base_url: Url,
    agent: ureq::Agent,
    auth: Option<Auth>,
}

#[derive(Debug, Deserialize)]
struct WriteReply {
    num_frames: u64,
    num_rows: u64,
}

#[derive(Debug, Deserialize)]
struct FrameReply {
    #[serde(default)]
    frame: String,
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    error: String,
    #[serde(default)]
    kind: String,
}

impl Client {
    pub fn new(base_url: impl AsRef<str>) -> Result<Client, Error> {
        Ok(Client {
            base_url: normalize_base_url(base_url.as_ref())?,
            agent: ureq::AgentBuilder::new().build(),
            auth: None,
        })
    }

    pub fn with_basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(Auth::Basic {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(Auth::Bearer(token.into()));
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Starts a read; frames are decoded lazily as the body arrives.
    pub fn read(&self, request: &ReadRequest) -> Result<FrameReader, Error> {
        let body = encode_json(request)?;
        let response = self
            .request("POST", "read")?
            .set("Content-Type", "application/json")
            .send_string(&body);
        let response = check(response)?;
        Ok(FrameReader {
            reader: Some(BufReader::new(response.into_reader())),
        })
    }

    pub fn read_all(&self, request: &ReadRequest) -> Result<Vec<Frame>, Error> {
        self.read(request)?.collect()
    }

    /// Sends `frames` after the initial request record; returns `(frames, rows)` written.
    pub fn write<I>(&self, request: &WriteRequest, frames: I) -> Result<(u64, u64), Error>
    where
        I: IntoIterator<Item = Frame>,
    {
        let mut body = encode_record(&Message::InitialWrite(WriteHeader::from_request(request)))?.to_vec();
        for frame in frames {
            body.extend_from_slice(&encode_record(&Message::FrameChunk(encode_frame(&frame)))?);
        }
        body.extend_from_slice(&encode_record(&Message::End)?);
        let response = self
            .request("POST", "write")?
            .set("Content-Type", "application/octet-stream")
            .send_bytes(&body);
        let reply: WriteReply = read_json(check(response)?)?;
        Ok((reply.num_frames, reply.num_rows))
    }

    pub fn create(&self, request: &CreateRequest) -> Result<(), Error> {
        self.post_json::<_, serde_json::Value>("create", request).map(|_| ())
    }

    pub fn delete(&self, request: &DeleteRequest) -> Result<(), Error> {
        self.post_json::<_, serde_json::Value>("delete", request).map(|_| ())
    }

    pub fn exec(&self, request: &ExecRequest) -> Result<Option<Frame>, Error> {
        let reply: FrameReply = self.post_json("exec", request)?;
        decode_frame_reply(&reply.frame)
    }

    pub fn history(&self, request: &HistoryRequest) -> Result<Frame, Error> {
        let reply: FrameReply = self.post_json("history", request)?;
        decode_frame_reply(&reply.frame)?.ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_message("history reply carried no frame")
        })
    }

    pub fn status(&self) -> Result<serde_json::Value, Error> {
        let response = self.request("GET", "_/status")?.call();
        read_json(check(response)?)
    }

    fn post_json<T, R>(&self, path: &str, body: &T) -> Result<R, Error>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let payload = encode_json(body)?;
        let response = self
            .request("POST", path)?
            .set("Accept", "application/json")
            .set("Content-Type", "application/json")
            .send_string(&payload);
        read_json(check(response)?)
    }

    fn request(&self, method: &str, path: &str) -> Result<ureq::Request, Error> {
        let url = self.base_url.join(path).map_err(|err| {
            Error::new(ErrorKind::BadRequest)
                .with_message(format!("invalid request path '{path}'"))
                .with_source(err)
        })?;
        let mut request = self.agent.request(method, url.as_str());
        match &self.auth {
            Some(Auth::Basic { user, password }) => {
                let encoded = STANDARD.encode(format!("{user}:{password}"));
                request = request.set("Authorization", &format!("Basic {encoded}"));
            }
            Some(Auth::Bearer(token)) => {
                request = request.set("Authorization", &format!("Bearer {token}"));
            }
            None => {}
        }
        Ok(request)
    }
}

/// Frames of one HTTP read, in server order.
pub struct FrameReader {
    reader: Option<BufReader<Box<dyn Read + Send + Sync + 'static>>>,
}

impl FrameReader {
    pub fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let message = match read_message_blocking(reader) {
            Ok(message) => message,
            Err(err) => {
                self.reader = None;
                return Err(err);
            }
        };
        match message {
            Some(Message::FrameChunk(payload)) => decode_frame(payload).map(Some),
            Some(Message::Error(payload)) => {
                self.reader = None;
                Err(payload.into_error())
            }
            Some(other) => {
                self.reader = None;
                Err(Error::new(ErrorKind::Transport)
                    .with_message(format!("unexpected {} record in read stream", other.name())))
            }
            None => {
                self.reader = None;
                Ok(None)
            }
        }
    }

    pub fn cancel(&mut self) {
        self.reader = None;
    }
}

impl Iterator for FrameReader {
    type Item = Result<Frame, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

fn normalize_base_url(raw: &str) -> Result<Url, Error> {
    let mut url = Url::parse(raw).map_err(|err| {
        Error::new(ErrorKind::BadRequest)
            .with_message("invalid gateway url")
            .with_source(err)
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(Error::new(ErrorKind::BadRequest)
            .with_message("gateway url must use http or https scheme"));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn encode_json<T: Serialize>(body: &T) -> Result<String, Error> {
    serde_json::to_string(body).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode request json")
            .with_source(err)
    })
}

fn check(response: Result<ureq::Response, ureq::Error>) -> Result<ureq::Response, Error> {
    match response {
        Ok(response) => Ok(response),
        Err(ureq::Error::Status(code, response)) => Err(parse_error_response(code, response)),
        Err(ureq::Error::Transport(err)) => Err(Error::new(ErrorKind::Transport)
            .with_message("request failed")
            .with_source(err)),
    }
}

fn read_json<R: DeserializeOwned>(response: ureq::Response) -> Result<R, Error> {
    let body = response.into_string().map_err(|err| {
        Error::new(ErrorKind::Transport)
            .with_message("failed to read response body")
            .with_source(err)
    })?;
    serde_json::from_str(&body).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("invalid response json")
            .with_source(err)
    })
}

fn parse_error_response(status: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    if let Ok(reply) = serde_json::from_str::<ErrorReply>(&body) {
        let kind = if reply.kind.is_empty() {
            error_kind_from_status(status)
        } else {
            ErrorKind::parse(&reply.kind)
        };
        return Error::new(kind).with_message(reply.error);
    }
    let message = body.trim();
    let message = if message.is_empty() {
        format!("gateway error status {status}")
    } else {
        message.to_string()
    };
    Error::new(error_kind_from_status(status)).with_message(message)
}

fn error_kind_from_status(status: u16) -> ErrorKind {
    match status {
        400 | 405 | 413 | 422 => ErrorKind::BadRequest,
        404 => ErrorKind::NotFound,
        _ => ErrorKind::Internal,
    }
}

fn decode_frame_reply(encoded: &str) -> Result<Option<Frame>, Error> {
    if encoded.is_empty() {
        return Ok(None);
    }
    let bytes = STANDARD.decode(encoded).map_err(|err| {
        Error::new(ErrorKind::Transport)
            .with_message("invalid base64 frame")
            .with_source(err)
    })?;
    frame_from_bytes(&bytes).map(Some)
}

/// Async client for the binary RPC transport; one connection per call.
#[derive(Clone, Debug)]
pub struct RpcClient {
    addr: SocketAddr,
}

type RpcReader = AsyncBufReader<tokio::net::tcp::OwnedReadHalf>;
type RpcWriter = AsyncBufWriter<tokio::net::tcp::OwnedWriteHalf>;

impl RpcClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    async fn connect(&self) -> Result<(RpcReader, RpcWriter), Error> {
        let stream = TcpStream::connect(self.addr).await.map_err(|err| {
            Error::new(ErrorKind::Transport)
                .with_message(format!("failed to connect to {}", self.addr))
                .with_source(err)
        })?;
        let (reader, writer) = stream.into_split();
        Ok((AsyncBufReader::new(reader), AsyncBufWriter::new(writer)))
    }

    pub async fn read(&self, request: &ReadRequest) -> Result<Vec<Frame>, Error> {
        let (mut reader, mut writer) = self.connect().await?;
        write_message(&mut writer, &Message::Read(request.clone())).await?;
        let mut frames = Vec::new();
        loop {
            match read_message(&mut reader).await? {
                Some(Message::FrameChunk(payload)) => frames.push(decode_frame(payload)?),
                Some(Message::Ack(_)) => return Ok(frames),
                Some(Message::Error(payload)) => return Err(payload.into_error()),
                Some(other) => {
                    return Err(Error::new(ErrorKind::Transport).with_message(format!(
                        "unexpected {} record in read stream",
                        other.name()
                    )));
                }
                None => {
                    return Err(Error::new(ErrorKind::Transport)
                        .with_message("read stream closed without acknowledgement"));
                }
            }
        }
    }

    pub async fn write(&self, request: &WriteRequest, frames: Vec<Frame>) -> Result<(u64, u64), Error> {
        let (mut reader, mut writer) = self.connect().await?;
        write_message(&mut writer, &Message::InitialWrite(WriteHeader::from_request(request))).await?;
        for frame in &frames {
            write_message(&mut writer, &Message::FrameChunk(encode_frame(frame))).await?;
        }
        write_message(&mut writer, &Message::End).await?;
        let ack = expect_ack(&mut reader).await?;
        Ok((ack.frames, ack.rows))
    }

    pub async fn create(&self, request: &CreateRequest) -> Result<(), Error> {
        self.unary(Message::Create(request.clone())).await.map(|_| ())
    }

    pub async fn delete(&self, request: &DeleteRequest) -> Result<(), Error> {
        self.unary(Message::Delete(request.clone())).await.map(|_| ())
    }

    pub async fn exec(&self, request: &ExecRequest) -> Result<Option<Frame>, Error> {
        let ack = self.unary(Message::Exec(request.clone())).await?;
        ack.frame.map(decode_frame).transpose()
    }

    pub async fn history(&self, request: &HistoryRequest) -> Result<Frame, Error> {
        let ack = self.unary(Message::History(request.clone())).await?;
        let payload = ack.frame.ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_message("history reply carried no frame")
        })?;
        decode_frame(payload)
    }

    async fn unary(&self, call: Message) -> Result<AckPayload, Error> {
        let (mut reader, mut writer) = self.connect().await?;
        write_message(&mut writer, &call).await?;
        expect_ack(&mut reader).await
    }
}

async fn expect_ack(reader: &mut RpcReader) -> Result<AckPayload, Error> {
    match read_message(reader).await? {
        Some(Message::Ack(ack)) => Ok(ack),
        Some(Message::Error(payload)) => Err(payload.into_error()),
        Some(other) => Err(Error::new(ErrorKind::Transport)
            .with_message(format!("unexpected {} record in reply", other.name()))),
        None => Err(Error::new(ErrorKind::Transport).with_message("connection closed before reply")),
    }
}

#[cfg(test)]
mod tests {
    use super::{Client, error_kind_from_status, normalize_base_url};
    use crate::core::error::ErrorKind;

    #[test]
    fn base_url_gains_trailing_slash_and_rejects_other_schemes() {
        let url = normalize_base_url("http://127.0.0.1:8080/gateway").expect("url");
        assert_eq!(url.as_str(), "http://127.0.0.1:8080/gateway/");
        assert_eq!(url.join("read").expect("join").path(), "/gateway/read");

        let err = Client::new("ftp://example.com").err().expect("scheme");
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn status_codes_without_body_map_to_kinds() {
        assert_eq!(error_kind_from_status(400), ErrorKind::BadRequest);
        assert_eq!(error_kind_from_status(404), ErrorKind::NotFound);
        assert_eq!(error_kind_from_status(500), ErrorKind::Internal);
    }
}
