//! Purpose: End-to-end tests for the HTTP transport and blocking client.
//! Role: Write and read frames, unary calls, history, Grafana, and error mapping.
//! Invariants: Every test runs against its own in-process gateway.
mod common;

use std::io::Read;

use common::{TestGateway, TestResult, session};
use framegate::core::column::Column;
use framegate::core::error::ErrorKind;
use framegate::core::frame::Frame;
use framegate::core::request::{
    DeleteRequest, ExecRequest, HistoryRequest, ReadRequest, WriteRequest,
};
use serde_json::json;

const ROWS: usize = 1027;

fn five_column_frame(rows: usize) -> Frame {
    let base = 1_700_000_000_000_000_000i64;
    Frame::new(
        vec![
            Column::dense("bools", (0..rows).map(|i| i % 2 == 0).collect::<Vec<_>>()),
            Column::dense("floats", (0..rows).map(|i| i as f64 * 0.5).collect::<Vec<_>>()),
            Column::dense("ints", (0..rows).map(|i| i as i64 * 3).collect::<Vec<_>>()),
            Column::dense("strings", (0..rows).map(|i| format!("s{i}")).collect::<Vec<_>>()),
            Column::times("times", (0..rows).map(|i| base + i as i64 * 1_000).collect()),
        ],
        Vec::new(),
    )
    .expect("frame")
}

fn write_request(table: &str) -> WriteRequest {
    WriteRequest {
        session: session(),
        backend: "kv".into(),
        table: table.into(),
        ..WriteRequest::default()
    }
}

fn read_request(table: &str) -> ReadRequest {
    ReadRequest {
        session: session(),
        backend: "kv".into(),
        table: table.into(),
        ..ReadRequest::default()
    }
}

#[test]
fn write_then_read_1027_rows_with_five_dtypes() -> TestResult<()> {
    let gateway = TestGateway::start()?;
    let client = gateway.client()?;

    let frame = five_column_frame(ROWS);
    let (head, tail) = (frame.slice(0, 500)?, frame.slice(500, ROWS)?);
    let (frames, rows) = client.write(&write_request("e2e"), vec![head, tail])?;
    assert_eq!((frames, rows), (2, ROWS as u64));

    let frames = client.read_all(&read_request("e2e"))?;
    assert!(frames.len() > 1, "message limit should split the read");
    assert_eq!(frames.iter().map(Frame::len).sum::<usize>(), ROWS);
    let mut names = frames[0].names();
    names.sort_unstable();
    assert_eq!(names, vec!["bools", "floats", "ints", "strings", "times"]);
    assert_eq!(frames[0].indices()[0].name(), "idx");
    Ok(())
}

#[test]
fn read_errors_arrive_as_a_trailing_record() -> TestResult<()> {
    let gateway = TestGateway::start()?;
    let client = gateway.client()?;

    let mut reader = client.read(&read_request("no_such_table"))?;
    let err = reader.next().expect("one item").expect_err("missing table");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(reader.next().is_none());

    let bad = ReadRequest {
        backend: "tsdb".into(),
        ..read_request("t")
    };
    let err = client.read_all(&bad).expect_err("unknown backend");
    assert_eq!(err.kind(), ErrorKind::UnknownBackend);
    Ok(())
}

#[test]
fn unary_calls_exec_and_history() -> TestResult<()> {
    let gateway = TestGateway::start()?;
    let client = gateway.client()?;
    client.write(&write_request("unary"), vec![five_column_frame(4)])?;

    let frame = client.exec(&ExecRequest {
        session: session(),
        backend: "kv".into(),
        table: "unary".into(),
        command: "infer".into(),
        ..ExecRequest::default()
    })?;
    assert!(frame.is_none());

    let err = client
        .exec(&ExecRequest {
            backend: "kv".into(),
            table: "unary".into(),
            command: "compact".into(),
            ..ExecRequest::default()
        })
        .expect_err("unknown command");
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    client.delete(&DeleteRequest {
        session: session(),
        backend: "kv".into(),
        table: "unary".into(),
        ..DeleteRequest::default()
    })?;
    let err = client.read_all(&read_request("unary")).expect_err("deleted");
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let history = client.history(&HistoryRequest {
        table: "unary".into(),
        ..HistoryRequest::default()
    })?;
    let actions = history.column("action")?.strings()?.to_vec();
    assert_eq!(actions, vec!["write", "exec", "exec", "delete", "read"]);

    let status = client.status()?;
    assert_eq!(status["status"], "running");
    Ok(())
}

#[test]
fn malformed_requests_and_routes_map_to_http_statuses() -> TestResult<()> {
    let gateway = TestGateway::start()?;
    let agent = ureq::agent();

    match agent
        .post(&format!("{}/create", gateway.url))
        .send_string("{not json")
    {
        Err(ureq::Error::Status(400, response)) => {
            let body: serde_json::Value = serde_json::from_str(&response.into_string()?)?;
            assert_eq!(body["kind"], "BadRequest");
        }
        other => panic!("expected 400, got {other:?}"),
    }
    match agent.get(&format!("{}/read", gateway.url)).call() {
        Err(ureq::Error::Status(405, _)) => {}
        other => panic!("expected 405, got {other:?}"),
    }
    match agent.get(&format!("{}/nowhere", gateway.url)).call() {
        Err(ureq::Error::Status(404, _)) => {}
        other => panic!("expected 404, got {other:?}"),
    }

    let config: serde_json::Value = serde_json::from_str(
        &agent
            .get(&format!("{}/_/config", gateway.url))
            .call()?
            .into_string()?,
    )?;
    assert_eq!(config["backends"][0]["type"], "kv");
    assert!(config.get("password").is_none());
    Ok(())
}

#[test]
fn grafana_query_returns_table_output() -> TestResult<()> {
    let gateway = TestGateway::start()?;
    let client = gateway.client()?;
    let frame = Frame::new(
        vec![
            Column::dense("price", vec![10.5f64, 20.0]),
            Column::dense("symbol", vec!["AAPL", "MSFT"]),
        ],
        Vec::new(),
    )?;
    client.write(&write_request("stocks"), vec![frame])?;

    let body = json!({
        "targets": [{
            "type": "table",
            "target": format!("fields=symbol,price;table_name=stocks;backend=kv;container={}", common::CONTAINER),
        }]
    });
    let mut text = String::new();
    ureq::post(&format!("{}/grafana/query", gateway.url))
        .set("Content-Type", "application/json")
        .send_string(&body.to_string())?
        .into_reader()
        .read_to_string(&mut text)?;
    let tables: serde_json::Value = serde_json::from_str(&text)?;
    let table = &tables[0];
    assert_eq!(table["type"], "table");
    assert_eq!(table["columns"][0], json!({"text": "symbol", "type": "string"}));
    assert_eq!(table["columns"][1]["type"], "number");
    let mut symbols: Vec<String> = table["rows"]
        .as_array()
        .expect("rows")
        .iter()
        .map(|row| row[0].as_str().unwrap_or_default().to_string())
        .collect();
    symbols.sort();
    assert_eq!(symbols, vec!["AAPL", "MSFT"]);
    Ok(())
}
