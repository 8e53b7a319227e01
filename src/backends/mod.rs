//! Purpose: Backend capability contract and the plumbing shared by all backends.
//! Exports: `Backend`, `FrameAppender`, `FrameStream`, `FrameSink`, `BackendContext`,
//! `Factory`, `registry`, `kv`.
//! Role: The API layer dispatches every request through `Arc<dyn Backend>`.
//! Invariants: A read runs in its own task and delivers frames over a bounded channel;
//! dropping the `FrameStream` cancels the producer.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{BackendConfig, Config};
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::Frame;
use crate::core::request::{CreateRequest, DeleteRequest, ExecRequest, ReadRequest, WriteRequest};

pub mod kv;
pub mod registry;

/// Frames buffered between a read task and its consumer.
pub const READ_CHANNEL_CAPACITY: usize = 4;

#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    async fn read(&self, request: ReadRequest, cancel: CancellationToken) -> Result<FrameStream, Error> {
        let _ = (request, cancel);
        Err(unsupported(self.name(), "read"))
    }

    async fn write(&self, request: WriteRequest) -> Result<Box<dyn FrameAppender>, Error> {
        let _ = request;
        Err(unsupported(self.name(), "write"))
    }

    async fn create(&self, request: CreateRequest) -> Result<(), Error> {
        let _ = request;
        Err(unsupported(self.name(), "create"))
    }

    async fn delete(&self, request: DeleteRequest) -> Result<(), Error> {
        let _ = request;
        Err(unsupported(self.name(), "delete"))
    }

    async fn exec(&self, request: ExecRequest) -> Result<Option<Frame>, Error> {
        let _ = request;
        Err(unsupported(self.name(), "exec"))
    }
}

pub fn unsupported(backend: &str, operation: &str) -> Error {
    Error::new(ErrorKind::Unsupported)
        .with_message(format!("{backend} backend does not support {operation}"))
}

/// Receives the frames of one write request.
#[async_trait]
pub trait FrameAppender: Send {
    async fn add(&mut self, frame: Frame) -> Result<(), Error>;

    /// Blocks until every issued store operation has been acknowledged.
    async fn wait_for_complete(&mut self, timeout: Duration) -> Result<(), Error>;
}

/// Producer half handed to a read task.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<Result<Frame, Error>>,
    cancel: CancellationToken,
}

impl FrameSink {
    /// Returns false once the consumer is gone or the read was cancelled.
    pub async fn send(&self, frame: Frame) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            sent = self.tx.send(Ok(frame)) => sent.is_ok(),
            _ = self.cancel.cancelled() => false,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

/// Consumer half of a read.
pub struct FrameStream {
    rx: mpsc::Receiver<Result<Frame, Error>>,
    cancel: CancellationToken,
}

impl FrameStream {
    /// Runs `produce` on its own task; its error, if any, becomes the last item.
    pub fn spawn<F, Fut>(cancel: CancellationToken, produce: F) -> FrameStream
    where
        F: FnOnce(FrameSink) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), Error>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
        let sink = FrameSink {
            tx: tx.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(async move {
            if let Err(err) = produce(sink).await {
                let _ = tx.send(Err(err)).await;
            }
        });
        FrameStream { rx, cancel }
    }

    pub async fn next(&mut self) -> Option<Result<Frame, Error>> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drains the stream into memory.
    pub async fn collect(mut self) -> Result<Vec<Frame>, Error> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next().await {
            frames.push(frame?);
        }
        Ok(frames)
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Shared I/O facilities handed to every backend factory.
#[derive(Clone)]
pub struct IoContext {
    pub kv_store: Arc<dyn kv::store::StoreProvider>,
}

impl Default for IoContext {
    fn default() -> Self {
        Self {
            kv_store: Arc::new(kv::memory::MemoryStore::new()),
        }
    }
}

pub struct BackendContext {
    pub span: tracing::Span,
    pub io: IoContext,
    pub backend: BackendConfig,
    pub config: Arc<Config>,
}

pub type Factory = Arc<dyn Fn(BackendContext) -> Result<Arc<dyn Backend>, Error> + Send + Sync>;

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::FrameStream;
    use crate::core::column::Column;
    use crate::core::error::{Error, ErrorKind};
    use crate::core::frame::Frame;

    fn one_row() -> Frame {
        Frame::new(vec![Column::dense("a", vec![1i64])], Vec::new()).expect("frame")
    }

    #[tokio::test]
    async fn producer_error_arrives_after_frames() {
        let stream = FrameStream::spawn(CancellationToken::new(), |sink| async move {
            sink.send(one_row()).await;
            Err(Error::new(ErrorKind::Transport).with_message("boom"))
        });
        let mut stream = stream;
        assert!(stream.next().await.expect("frame").is_ok());
        let err = stream.next().await.expect("error").expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_producer() {
        let cancel = CancellationToken::new();
        let observed = cancel.clone();
        let stream = FrameStream::spawn(cancel, |sink| async move {
            while sink.send(one_row()).await {}
            Ok(())
        });
        drop(stream);
        observed.cancelled().await;
    }
}
