//! Purpose: Save-mode semantics of the key-value backend over the HTTP gateway.
//! Role: Table conflicts, overwrites, conditional inserts, and expression updates.
//! Invariants: Rows are keyed by an explicit `key` index so items can be compared.
mod common;

use std::collections::BTreeMap;

use common::{TestGateway, TestResult, session};
use framegate::client::Client;
use framegate::core::column::Column;
use framegate::core::dtype::Value;
use framegate::core::error::ErrorKind;
use framegate::core::frame::{Frame, RowMap};
use framegate::core::request::{ExecRequest, ReadRequest, SaveMode, WriteRequest};
use framegate::repeating::{Pool, Task};

fn keyed(keys: &[&str], columns: Vec<Column>) -> Frame {
    Frame::new(columns, vec![Column::dense("key", keys.to_vec())]).expect("frame")
}

fn write(client: &Client, table: &str, mode: SaveMode, frame: Frame) -> Result<(), framegate::core::error::Error> {
    write_with(client, table, mode, "", frame)
}

fn write_with(
    client: &Client,
    table: &str,
    mode: SaveMode,
    expression: &str,
    frame: Frame,
) -> Result<(), framegate::core::error::Error> {
    let request = WriteRequest {
        session: session(),
        backend: "kv".into(),
        table: table.into(),
        save_mode: mode,
        expression: expression.into(),
        ..WriteRequest::default()
    };
    client.write(&request, vec![frame]).map(|_| ())
}

fn rows_by_key(client: &Client, table: &str) -> TestResult<BTreeMap<String, RowMap>> {
    let frames = client.read_all(&ReadRequest {
        session: session(),
        backend: "kv".into(),
        table: table.into(),
        ..ReadRequest::default()
    })?;
    let mut rows = BTreeMap::new();
    for frame in &frames {
        for row in frame.rows(true) {
            let map = row.to_map();
            let key = match map.get("key") {
                Some(Value::String(key)) => key.clone(),
                other => return Err(format!("row without key: {other:?}").into()),
            };
            rows.insert(key, map);
        }
    }
    Ok(rows)
}

#[test]
fn existing_table_conflicts_in_default_mode() -> TestResult<()> {
    let gateway = TestGateway::start()?;
    let client = gateway.client()?;
    let frame = keyed(&["k1"], vec![Column::dense("n1", vec![1i64])]);

    write(&client, "modes", SaveMode::ErrorIfTableExists, frame.clone())?;
    let err = write(&client, "modes", SaveMode::ErrorIfTableExists, frame).expect_err("conflict");
    assert_eq!(err.kind(), ErrorKind::Conflict);
    Ok(())
}

#[test]
fn overwrite_table_replaces_rows_and_schema() -> TestResult<()> {
    let gateway = TestGateway::start()?;
    let client = gateway.client()?;
    write(
        &client,
        "replace",
        SaveMode::ErrorIfTableExists,
        keyed(
            &["k1", "k2"],
            vec![Column::dense("n1", vec![1i64, 2]), Column::dense("n2", vec![3i64, 4])],
        ),
    )?;
    write(
        &client,
        "replace",
        SaveMode::OverwriteTable,
        keyed(
            &["k3"],
            vec![Column::dense("n3", vec![5i64]), Column::dense("n4", vec![6i64])],
        ),
    )?;

    let rows = rows_by_key(&client, "replace")?;
    assert_eq!(rows.keys().collect::<Vec<_>>(), vec!["k3"]);
    let names: Vec<&str> = rows["k3"].keys().map(String::as_str).collect();
    assert_eq!(names, vec!["key", "n3", "n4"]);
    Ok(())
}

#[test]
fn create_new_items_only_keeps_existing_rows() -> TestResult<()> {
    let gateway = TestGateway::start()?;
    let client = gateway.client()?;
    write(
        &client,
        "inserts",
        SaveMode::ErrorIfTableExists,
        keyed(&["k1"], vec![Column::dense("n", vec![1i64])]),
    )?;
    write(
        &client,
        "inserts",
        SaveMode::CreateNewItemsOnly,
        keyed(&["k1", "k2"], vec![Column::dense("n", vec![100i64, 2])]),
    )?;

    let rows = rows_by_key(&client, "inserts")?;
    assert_eq!(rows["k1"].get("n"), Some(&Value::Int(1)));
    assert_eq!(rows["k2"].get("n"), Some(&Value::Int(2)));
    Ok(())
}

#[test]
fn update_item_applies_expressions_to_stored_attributes() -> TestResult<()> {
    let gateway = TestGateway::start()?;
    let client = gateway.client()?;
    write(
        &client,
        "sums",
        SaveMode::ErrorIfTableExists,
        keyed(
            &["k1"],
            vec![Column::dense("n1", vec![2i64]), Column::dense("n2", vec![5i64])],
        ),
    )?;
    write_with(
        &client,
        "sums",
        SaveMode::UpdateItem,
        "n3=n1+n2",
        keyed(&["k1"], vec![Column::dense("n1", vec![2i64])]),
    )?;

    let rows = rows_by_key(&client, "sums")?;
    assert_eq!(rows["k1"].get("n3"), Some(&Value::Int(7)));

    client.exec(&ExecRequest {
        session: session(),
        backend: "kv".into(),
        table: "sums".into(),
        command: "update".into(),
        args: [
            ("key".to_string(), "k1".into()),
            ("expression".to_string(), "n3=n3*2".into()),
        ]
        .into_iter()
        .collect(),
        ..ExecRequest::default()
    })?;
    let rows = rows_by_key(&client, "sums")?;
    assert_eq!(rows["k1"].get("n3"), Some(&Value::Int(14)));
    Ok(())
}

#[test]
fn overwrite_item_drops_attributes_not_written() -> TestResult<()> {
    let gateway = TestGateway::start()?;
    let client = gateway.client()?;
    write(
        &client,
        "items",
        SaveMode::ErrorIfTableExists,
        keyed(
            &["k1"],
            vec![Column::dense("n1", vec![1i64]), Column::dense("n2", vec![2i64])],
        ),
    )?;
    write(
        &client,
        "items",
        SaveMode::OverwriteItem,
        keyed(&["k1"], vec![Column::dense("n3", vec![3i64])]),
    )?;

    let rows = rows_by_key(&client, "items")?;
    let names: Vec<&str> = rows["k1"].keys().map(String::as_str).collect();
    assert_eq!(names, vec!["key", "n3"]);
    Ok(())
}

#[test]
fn concurrent_writers_share_a_pool() -> TestResult<()> {
    let gateway = TestGateway::start()?;
    let rpc = gateway.rpc();
    let errors = gateway.block_on(async move {
        let pool = Pool::new(4, 4);
        let task = Task::new(8, 4, move |repetition| {
            let rpc = rpc.clone();
            async move {
                let request = WriteRequest {
                    session: session(),
                    backend: "kv".into(),
                    table: "shared".into(),
                    save_mode: SaveMode::CreateNewItemsOnly,
                    ..WriteRequest::default()
                };
                let key = format!("r{repetition}");
                let frame = keyed(&[key.as_str()], vec![Column::dense("n", vec![repetition as i64])]);
                rpc.write(&request, vec![frame]).await.map(|_| ())
            }
        });
        pool.submit_and_wait(&task).await
    });
    assert!(errors.is_empty(), "{errors}");

    let rows = rows_by_key(&gateway.client()?, "shared")?;
    assert_eq!(rows.len(), 8);
    assert_eq!(rows["r5"].get("n"), Some(&Value::Int(5)));
    Ok(())
}
