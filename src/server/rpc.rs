//! Purpose: Binary RPC transport: length-prefixed MessagePack records over TCP.
//! Exports: `run`.
//! Role: One call per connection; the first record names the call.
//! Invariants: Read replies are `FrameChunk*` then exactly one `Ack` or `Error`.
//! Invariants: Write requires `InitialWrite`, `FrameChunk*`, `End`; a connection that
//! closes before `End` fails the write.
use std::sync::Arc;

use tokio::io::{AsyncRead, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::Api;
use crate::core::codec::{
    AckPayload, ErrorPayload, FramePayload, Message, WriteHeader, decode_frame, encode_frame,
    read_message, write_message,
};
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::Frame;

pub async fn run(listener: TcpListener, api: Arc<Api>, shutdown: CancellationToken) -> Result<(), Error> {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("rpc accept failed: {err}");
                    continue;
                }
            },
            _ = shutdown.cancelled() => return Ok(()),
        };
        debug!(%peer, "rpc connection");
        let api = api.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, api).await {
                warn!(%peer, "rpc connection failed: {err}");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, api: Arc<Api>) -> Result<(), Error> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let Some(call) = read_message(&mut reader).await? else {
        return Ok(());
    };

    let reply = match call {
        Message::Read(request) => {
            let mut messages = super::spawn_read(api, request);
            let mut ack = AckPayload::default();
            while let Some(message) = messages.recv().await {
                if let Message::FrameChunk(payload) = &message {
                    ack.frames += 1;
                    ack.rows += payload_rows(payload);
                }
                let failed = matches!(message, Message::Error(_));
                write_message(&mut writer, &message).await?;
                if failed {
                    return Ok(());
                }
            }
            Ok(ack)
        }
        Message::InitialWrite(header) => write(&mut reader, header, api).await,
        Message::Create(request) => api.create(request).await.map(|()| AckPayload::default()),
        Message::Delete(request) => api.delete(request).await.map(|()| AckPayload::default()),
        Message::Exec(request) => api.exec(request).await.map(|frame| AckPayload {
            frame: frame.as_ref().map(encode_frame),
            ..AckPayload::default()
        }),
        Message::History(request) => api.history(&request).map(|frame| AckPayload {
            frames: 1,
            rows: frame.len() as u64,
            frame: Some(encode_frame(&frame)),
        }),
        other => Err(Error::new(ErrorKind::BadRequest)
            .with_message(format!("unexpected {} record at start of call", other.name()))),
    };

    let message = match reply {
        Ok(ack) => Message::Ack(ack),
        Err(err) => Message::Error(ErrorPayload::from(&err)),
    };
    write_message(&mut writer, &message).await
}

async fn write<R>(reader: &mut R, header: WriteHeader, api: Arc<Api>) -> Result<AckPayload, Error>
where
    R: AsyncRead + Unpin,
{
    let request = header.into_request()?;
    let (frames_tx, frames_rx) = mpsc::channel::<Frame>(1);
    let writing = tokio::spawn(async move { api.write(request, frames_rx).await });

    let decoded: Result<(), Error> = async {
        loop {
            match read_message(reader).await? {
                Some(Message::FrameChunk(payload)) => {
                    let frame = decode_frame(payload)?;
                    if frames_tx.send(frame).await.is_err() {
                        return Ok(());
                    }
                }
                Some(Message::End) => return Ok(()),
                Some(other) => {
                    return Err(Error::new(ErrorKind::BadRequest).with_message(format!(
                        "unexpected {} record in write stream",
                        other.name()
                    )));
                }
                None => {
                    return Err(Error::new(ErrorKind::Transport)
                        .with_message("write stream closed before end marker"));
                }
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
    decoded?;
    let (frames, rows) = written?;
    Ok(AckPayload {
        frames,
        rows,
        frame: None,
    })
}

fn payload_rows(payload: &FramePayload) -> u64 {
    payload
        .columns
        .first()
        .or_else(|| payload.indices.first())
        .map(|column| column.len)
        .unwrap_or(0)
}
