//! Purpose: The key-value backend: tables of items with a JSON schema object.
//! Exports: `KvBackend`, `factory`, `delete_table`, and the store, cursor, schema,
//! reader and writer modules.
//! Role: Registered under the `kv` type; every request resolves its session to a
//! container through the configured `StoreProvider`.
//! Invariants: Table paths always end in `/`.
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backends::{Backend, BackendContext, FrameAppender, FrameStream};
use crate::config::Config;
use crate::core::dtype::Value;
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::Frame;
use crate::core::request::{
    CreateRequest, Credentials, DeleteRequest, ErrorOptions, ExecRequest, ReadRequest, Secret,
    Session, WriteRequest,
};

pub mod cursor;
pub mod expr;
pub mod infer;
pub mod memory;
pub mod reader;
pub mod schema;
pub mod store;
pub mod writer;

use cursor::{AsyncItemsCursor, CursorOptions};
use reader::ReaderSettings;
use schema::Schema;
use store::{ITEM_NAME, ItemStore, StoreError, StoreProvider, UpdateItemInput, UpdateMode};
use writer::{KvAppender, WriterSettings};

pub struct KvBackend {
    name: String,
    span: tracing::Span,
    provider: Arc<dyn StoreProvider>,
    config: Arc<Config>,
    workers: usize,
    update_workers_per_vn: usize,
}

pub fn factory(ctx: BackendContext) -> Result<Arc<dyn Backend>, Error> {
    let backend = KvBackend {
        name: ctx.backend.name.clone(),
        span: ctx.span,
        provider: ctx.io.kv_store,
        workers: ctx.backend.workers.max(1),
        update_workers_per_vn: ctx.backend.update_workers_per_vn.max(1),
        config: ctx.config,
    };
    info!(parent: &backend.span, workers = backend.workers, "kv backend ready");
    Ok(Arc::new(backend))
}

impl KvBackend {
    /// The item store and table path a request addresses.
    fn connect(
        &self,
        session: &Session,
        credentials: &Credentials,
        table: &str,
    ) -> Result<(Arc<dyn ItemStore>, String), Error> {
        if table.trim().is_empty() {
            return Err(Error::new(ErrorKind::BadRequest).with_message("missing table name"));
        }
        let mut session = session.clone();
        self.config.fill_session(&mut session);
        let (container, path) = session.resolve_path(table, true)?;
        session.container = container.clone();

        let mut credentials = credentials.clone();
        if credentials.password.is_empty() {
            credentials.password = Secret::new(std::mem::take(&mut session.password));
        }
        if credentials.token.is_empty() {
            credentials.token = Secret::new(std::mem::take(&mut session.token));
        }
        let store = self
            .provider
            .container(&session, &credentials, &container)
            .map_err(|err| err.with_table(table.to_string()))?;
        Ok((store, path))
    }

    async fn infer_schema(&self, request: &ExecRequest) -> Result<(), Error> {
        let (store, path) = self.connect(&request.session, &request.credentials, &request.table)?;
        let key = request.arg_str("key").unwrap_or_default();
        let options = CursorOptions {
            partitions: vec![path.clone()],
            attributes: vec!["*".to_string()],
            workers: self.workers,
            limit: infer::SAMPLE_ROWS,
            ..CursorOptions::default()
        };
        let items = AsyncItemsCursor::new(store.clone(), options, &CancellationToken::new())
            .all()
            .await?;
        let inferred = infer::schema_from_items(&key, &items)?;
        debug!(parent: &self.span, table = %path, key = %inferred.key, "inferred schema");
        Schema::new(key, "")
            .update(store.as_ref(), &path, &inferred)
            .await?;
        Ok(())
    }

    async fn update_item(&self, request: &ExecRequest) -> Result<(), Error> {
        let key = request.arg_str("key");
        let expression = request
            .arg_str("expression")
            .or_else(|| (!request.expression.is_empty()).then(|| request.expression.clone()));
        let (Some(key), Some(expression)) = (key, expression) else {
            return Err(Error::new(ErrorKind::BadRequest).with_message(
                "missing a required parameter - 'table', 'expression', and/or 'key' argument",
            ));
        };
        if request.table.is_empty() {
            return Err(Error::new(ErrorKind::BadRequest).with_message(
                "missing a required parameter - 'table', 'expression', and/or 'key' argument",
            ));
        }
        let condition = request.arg_str("condition").unwrap_or_default();
        let (store, path) = self.connect(&request.session, &request.credentials, &request.table)?;
        debug!(parent: &self.span, %path, %key, %expression, %condition, "update item");
        store
            .update_item(&UpdateItemInput {
                path: format!("{path}{key}"),
                expression: Some(expression),
                condition,
                mode: UpdateMode::CreateOrReplaceAttributes,
                ..UpdateItemInput::default()
            })
            .await
            .map_err(|err| Error::from(err).with_table(request.table.clone()))
    }
}

#[async_trait]
impl Backend for KvBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, request: ReadRequest, cancel: CancellationToken) -> Result<FrameStream, Error> {
        let (store, path) = self.connect(&request.session, &request.credentials, &request.table)?;
        let settings = ReaderSettings {
            workers: self.workers,
        };
        reader::read_table(store, path, request, settings, cancel).await
    }

    async fn write(&self, request: WriteRequest) -> Result<Box<dyn FrameAppender>, Error> {
        let (store, path) = self.connect(&request.session, &request.credentials, &request.table)?;
        let settings = WriterSettings {
            workers: self.workers * self.update_workers_per_vn,
        };
        let appender = KvAppender::open(store, path, request, settings).await?;
        Ok(Box::new(appender))
    }

    async fn create(&self, request: CreateRequest) -> Result<(), Error> {
        Err(Error::new(ErrorKind::Unsupported)
            .with_message("'create' isn't required for the kv backend; the table is created on first write")
            .with_table(request.table))
    }

    async fn delete(&self, request: DeleteRequest) -> Result<(), Error> {
        let (store, path) = self.connect(&request.session, &request.credentials, &request.table)?;
        let ignore_missing = request.if_missing == ErrorOptions::Ignore;
        delete_table(store, &path, &request.filter, self.workers, ignore_missing)
            .await
            .map_err(|err| err.with_table(request.table.clone()))
    }

    async fn exec(&self, request: ExecRequest) -> Result<Option<Frame>, Error> {
        let command = request.command.trim().to_lowercase();
        match command.as_str() {
            "infer" | "infer_schema" => self.infer_schema(&request).await.map(|_| None),
            "update" => self.update_item(&request).await.map(|_| None),
            _ => Err(Error::new(ErrorKind::Unsupported)
                .with_message(format!("kv backend doesn't support execute command '{command}'"))),
        }
    }
}

/// Deletes the items of a table, those matching `filter` when one is given.
/// Without a filter the schema object and the table directory go too.
pub async fn delete_table(
    store: Arc<dyn ItemStore>,
    table_path: &str,
    filter: &str,
    workers: usize,
    ignore_missing: bool,
) -> Result<(), Error> {
    if !store.check_path_exists(table_path).await.map_err(Error::from)? {
        if ignore_missing {
            return Ok(());
        }
        return Err(Error::new(ErrorKind::NotFound)
            .with_message(format!("table '{table_path}' not found")));
    }

    let workers = workers.max(1);
    let mut deletes: JoinSet<Result<(), StoreError>> = JoinSet::new();
    for partition in reader::partitions(store.as_ref(), table_path).await? {
        let options = CursorOptions {
            partitions: vec![partition.clone()],
            attributes: vec![ITEM_NAME.to_string()],
            filter: filter.to_string(),
            workers,
            ..CursorOptions::default()
        };
        let mut cursor = AsyncItemsCursor::new(store.clone(), options, &CancellationToken::new());
        while let Some(item) = cursor.next_item().await? {
            let Some(Value::String(name)) = item.get(ITEM_NAME) else {
                continue;
            };
            while deletes.len() >= workers {
                if let Some(joined) = deletes.join_next().await {
                    check_delete(joined, table_path)?;
                }
            }
            let store = store.clone();
            let path = format!("{partition}{name}");
            deletes.spawn(async move { store.delete_object(&path).await });
        }
    }
    while let Some(joined) = deletes.join_next().await {
        check_delete(joined, table_path)?;
    }

    if filter.trim().is_empty() {
        match store.delete_object(table_path).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                let message = format!("failed to delete table object '{table_path}': {}", err.message);
                return Err(Error::from(err).with_message(message));
            }
        }
    }
    Ok(())
}

fn check_delete(
    joined: Result<Result<(), StoreError>, tokio::task::JoinError>,
    table_path: &str,
) -> Result<(), Error> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) if err.is_not_found() => Ok(()),
        Ok(Err(err)) => {
            let message = format!("delete failed during recursive delete of '{table_path}': {}", err.message);
            Err(Error::from(err).with_message(message))
        }
        Err(err) => Err(Error::new(ErrorKind::Internal)
            .with_message("delete task failed")
            .with_source(err)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::delete_table;
    use super::memory::{MemoryContainer, MemoryStore};
    use super::store::{Item, ItemStore, UpdateItemInput};
    use crate::backends::{Backend, BackendContext, IoContext};
    use crate::config::Config;
    use crate::core::column::Column;
    use crate::core::dtype::Value;
    use crate::core::error::ErrorKind;
    use crate::core::frame::Frame;
    use crate::core::request::{DeleteRequest, ErrorOptions, ExecRequest, ReadRequest, Session, WriteRequest};

    fn backend(store: Arc<MemoryStore>) -> Arc<dyn Backend> {
        let config = Arc::new(Config::with_kv_backend());
        let ctx = BackendContext {
            span: tracing::Span::none(),
            io: IoContext { kv_store: store },
            backend: config.backends[0].clone(),
            config: config.clone(),
        };
        super::factory(ctx).expect("backend")
    }

    fn session() -> Session {
        Session {
            container: "bigdata".into(),
            ..Session::default()
        }
    }

    async fn put(store: &MemoryContainer, path: &str, pairs: &[(&str, Value)]) {
        let attributes: Item = pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        store
            .update_item(&UpdateItemInput {
                path: path.into(),
                attributes,
                ..UpdateItemInput::default()
            })
            .await
            .expect("put");
    }

    #[tokio::test]
    async fn write_then_read_through_the_backend() {
        let store = Arc::new(MemoryStore::new());
        let kv = backend(store.clone());
        let frame = Frame::new(
            vec![Column::dense("n", vec![1.5f64, 2.5, 3.5])],
            vec![Column::dense("k", vec!["a", "b", "c"])],
        )
        .expect("frame");
        let mut appender = kv
            .write(WriteRequest {
                session: session(),
                table: "pets".into(),
                initial_data: Some(frame),
                ..WriteRequest::default()
            })
            .await
            .expect("write");
        appender
            .wait_for_complete(std::time::Duration::from_secs(5))
            .await
            .expect("complete");

        let frames = kv
            .read(
                ReadRequest {
                    session: session(),
                    table: "pets".into(),
                    ..ReadRequest::default()
                },
                CancellationToken::new(),
            )
            .await
            .expect("read")
            .collect()
            .await
            .expect("frames");
        assert_eq!(frames.iter().map(Frame::len).sum::<usize>(), 3);
        assert_eq!(frames[0].indices()[0].name(), "k");
    }

    #[tokio::test]
    async fn exec_infers_schema_and_updates_items() {
        let store = Arc::new(MemoryStore::new());
        let container = store.container_handle("bigdata");
        for (name, age) in [("rocky", 2), ("mocha", 3)] {
            put(&container, &format!("pets/{name}"), &[("name", Value::from(name)), ("age", Value::from(age))]).await;
        }
        let kv = backend(store.clone());
        let exec = |command: &str, args: &[(&str, &str)]| ExecRequest {
            session: session(),
            table: "pets".into(),
            command: command.into(),
            args: args
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
                .collect::<BTreeMap<_, _>>(),
            ..ExecRequest::default()
        };

        kv.exec(exec("infer", &[])).await.expect("infer");
        let schema = super::Schema::load(container.as_ref(), "pets/")
            .await
            .expect("load")
            .expect("schema");
        assert_eq!(schema.key, "name");

        kv.exec(exec("update", &[("key", "rocky"), ("expression", "age=age+1")]))
            .await
            .expect("update");
        assert_eq!(container.item("pets/rocky").expect("rocky").get("age"), Some(&Value::Int(3)));

        let err = kv
            .exec(exec("update", &[("key", "mocha"), ("expression", "age=1"), ("condition", "age>10")]))
            .await
            .expect_err("condition");
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = kv.exec(exec("update", &[("key", "mocha")])).await.expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        let err = kv.exec(exec("compact", &[])).await.expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn delete_with_filter_and_missing_tables() {
        let store = Arc::new(MemoryContainer::new(3));
        for n in 0..8i64 {
            put(&store, &format!("t/{n}"), &[("n", Value::Int(n))]).await;
        }
        store.put_object("t/.#schema", b"{}".to_vec()).await.expect("schema");

        delete_table(store.clone(), "t/", "n >= 4", 2, false).await.expect("filtered");
        assert_eq!(store.item_paths("t/").len(), 4);
        assert!(store.get_object("t/.#schema").await.is_ok());

        delete_table(store.clone(), "t/", "", 2, false).await.expect("all");
        assert!(!store.check_path_exists("t/").await.expect("exists"));

        let err = delete_table(store.clone(), "t/", "", 2, false).await.expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        delete_table(store.clone(), "t/", "", 2, true).await.expect("ignored");

        let kv = backend(Arc::new(MemoryStore::new()));
        kv.delete(DeleteRequest {
            session: session(),
            table: "gone".into(),
            if_missing: ErrorOptions::Ignore,
            ..DeleteRequest::default()
        })
        .await
        .expect("ignore missing");
    }
}
