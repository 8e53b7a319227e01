//! Purpose: End-to-end tests for the length-prefixed MessagePack transport.
//! Role: Drives every call through `RpcClient` against an in-process gateway.
mod common;

use common::{TestGateway, TestResult, session};
use framegate::core::column::Column;
use framegate::core::error::ErrorKind;
use framegate::core::frame::Frame;
use framegate::core::request::{
    CreateRequest, DeleteRequest, ExecRequest, HistoryRequest, ReadRequest, WriteRequest,
};

#[test]
fn rpc_round_trip_covers_every_call() -> TestResult<()> {
    let gateway = TestGateway::start()?;
    let rpc = gateway.rpc();
    gateway.block_on(async {
        let frame = Frame::new(
            vec![
                Column::dense("name", vec!["ann", "bob", "cid"]),
                Column::dense("age", vec![31i64, 42, 27]),
            ],
            vec![Column::dense("key", vec!["a", "b", "c"])],
        )?;
        let write = WriteRequest {
            session: session(),
            backend: "kv".into(),
            table: "people".into(),
            ..WriteRequest::default()
        };
        assert_eq!(rpc.write(&write, vec![frame]).await?, (1, 3));

        let read = ReadRequest {
            session: session(),
            backend: "kv".into(),
            table: "people".into(),
            filter: "age > 30".into(),
            ..ReadRequest::default()
        };
        let frames = rpc.read(&read).await?;
        assert_eq!(frames.iter().map(Frame::len).sum::<usize>(), 2);

        let query = ReadRequest {
            session: session(),
            backend: "kv".into(),
            query: "SELECT name FROM people WHERE age < 30".into(),
            ..ReadRequest::default()
        };
        let frames = rpc.read(&query).await?;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].column("name")?.strings()?.to_vec(), vec!["cid"]);

        let exec = ExecRequest {
            session: session(),
            backend: "kv".into(),
            table: "people".into(),
            command: "infer".into(),
            ..ExecRequest::default()
        };
        assert!(rpc.exec(&exec).await?.is_none());

        let err = rpc
            .create(&CreateRequest {
                session: session(),
                backend: "kv".into(),
                table: "people".into(),
                ..CreateRequest::default()
            })
            .await
            .expect_err("kv has no create");
        assert_eq!(err.kind(), ErrorKind::Unsupported);

        rpc.delete(&DeleteRequest {
            session: session(),
            backend: "kv".into(),
            table: "people".into(),
            ..DeleteRequest::default()
        })
        .await?;
        let err = rpc.read(&read).await.expect_err("table deleted");
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let history = rpc
            .history(&HistoryRequest {
                action: "read".into(),
                ..HistoryRequest::default()
            })
            .await?;
        assert_eq!(history.len(), 3);
        Ok::<_, Box<dyn std::error::Error>>(())
    })
}

#[test]
fn write_without_end_record_is_not_acknowledged() -> TestResult<()> {
    use framegate::core::codec::{Message, WriteHeader, read_message, write_message};
    use tokio::io::{AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    let gateway = TestGateway::start()?;
    let addr = gateway.rpc_addr;
    gateway.block_on(async move {
        let stream = TcpStream::connect(addr).await?;
        let (reader, mut writer) = stream.into_split();
        let request = WriteRequest {
            session: session(),
            backend: "kv".into(),
            table: "truncated".into(),
            ..WriteRequest::default()
        };
        write_message(&mut writer, &Message::InitialWrite(WriteHeader::from_request(&request))).await?;
        writer.shutdown().await?;
        let mut reader = BufReader::new(reader);
        match read_message(&mut reader).await? {
            Some(Message::Error(payload)) => {
                assert_eq!(payload.into_error().kind(), ErrorKind::Transport);
            }
            other => panic!("expected an error record, got {other:?}"),
        }
        Ok::<_, Box<dyn std::error::Error>>(())
    })
}
