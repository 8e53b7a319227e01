//! Purpose: `framegate` CLI entry point.
//! Role: Runs the gateway (`serve`) or talks to a running one over HTTP.
//! Invariants: Read output is JSON Lines on stdout, one object per row.
//! Invariants: Errors are emitted as JSON on stderr when stderr is not a terminal;
//! the exit code comes from `to_exit_code`.
use std::collections::BTreeMap;
use std::io::{self, BufRead, BufWriter, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value as Json, json};

use framegate::client::Client;
use framegate::config::Config;
use framegate::core::dtype::Value;
use framegate::core::error::{Error, ErrorKind, to_exit_code};
use framegate::core::frame::{Frame, RowMap};
use framegate::core::request::{
    CreateRequest, DeleteRequest, ErrorOptions, ExecRequest, HistoryRequest, ReadRequest,
    SaveMode, Session, WriteRequest,
};
use framegate::server::{self, DEFAULT_HTTP_ADDR, DEFAULT_MAX_BODY_BYTES, DEFAULT_RPC_ADDR, ServeConfig};

const DEFAULT_URL: &str = "http://127.0.0.1:8080";
const WRITE_BATCH_ROWS: usize = 1024;

#[derive(Parser)]
#[command(
    name = "framegate",
    version,
    about = "Streaming tabular data gateway over pluggable storage backends",
    after_help = r#"EXAMPLES
  $ framegate serve --config gateway.json
  $ framegate write --table weather --index city < rows.jsonl
  $ framegate read --query "SELECT * FROM weather WHERE temp > 20"
  $ framegate exec --table weather --command infer"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(long, env = "FRAMEGATE_URL", default_value = DEFAULT_URL, global = true, help = "Gateway URL for client commands")]
    url: String,
    #[arg(long, global = true, help = "User for basic auth")]
    user: Option<String>,
    #[arg(long, global = true, env = "FRAMEGATE_PASSWORD", hide_env_values = true, help = "Password for basic auth")]
    password: Option<String>,
    #[arg(long, global = true, env = "FRAMEGATE_TOKEN", hide_env_values = true, help = "Access token (bearer auth)")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP and RPC servers until interrupted
    Serve {
        #[arg(long, help = "JSON configuration file (default: a single kv backend)")]
        config: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_HTTP_ADDR, help = "HTTP listen address")]
        http: SocketAddr,
        #[arg(long, default_value = DEFAULT_RPC_ADDR, help = "Binary RPC listen address")]
        rpc: SocketAddr,
        #[arg(long, help = "Disable the binary RPC listener")]
        no_rpc: bool,
        #[arg(long, default_value_t = DEFAULT_MAX_BODY_BYTES, help = "Maximum HTTP request body size")]
        max_body_bytes: usize,
    },
    /// Stream rows of a table as JSON Lines
    Read {
        #[command(flatten)]
        target: Target,
        #[arg(long, help = "SELECT statement (instead of --table/--columns/--filter)")]
        query: Option<String>,
        #[arg(long, value_delimiter = ',', help = "Columns to read (default: all)")]
        columns: Vec<String>,
        #[arg(long, default_value = "", help = "Filter expression")]
        filter: String,
        #[arg(long, default_value_t = 0, help = "Maximum rows (0 = unlimited)")]
        limit: u64,
        #[arg(long, default_value_t = 0, help = "Rows per frame")]
        message_limit: u64,
        #[arg(long, help = "Do not move the key into an index column")]
        reset_index: bool,
    },
    /// Write JSON Lines rows from stdin
    Write {
        #[command(flatten)]
        target: Target,
        #[arg(long, help = "Column holding the row key")]
        index: Option<String>,
        #[arg(long, default_value = "errorIfTableExists", help = "Save mode")]
        save_mode: String,
        #[arg(long, default_value = "", help = "Update expression template")]
        expression: String,
        #[arg(long, default_value = "", help = "Condition template")]
        condition: String,
        #[arg(long, value_delimiter = ',', help = "Partition key columns")]
        partition_keys: Vec<String>,
        #[arg(long, help = "Completion timeout in seconds")]
        timeout: Option<u64>,
    },
    /// Create a table
    Create {
        #[command(flatten)]
        target: Target,
        #[arg(long, help = "Succeed when the table already exists")]
        if_exists_ignore: bool,
    },
    /// Delete a table, or the items matching --filter
    Delete {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value = "", help = "Delete only matching items")]
        filter: String,
        #[arg(long, help = "Succeed when the table does not exist")]
        if_missing_ignore: bool,
    },
    /// Run a backend command (e.g. infer, update)
    Exec {
        #[command(flatten)]
        target: Target,
        #[arg(long, help = "Command name")]
        command: String,
        #[arg(long = "arg", value_parser = parse_arg, help = "Command argument key=value (repeatable)")]
        args: Vec<(String, String)>,
        #[arg(long, default_value = "", help = "Expression argument")]
        expression: String,
    },
    /// Show recently completed gateway calls
    History {
        #[arg(long, default_value = "", help = "Filter by backend")]
        backend: String,
        #[arg(long, default_value = "", help = "Filter by table")]
        table: String,
        #[arg(long, default_value = "", help = "Filter by action")]
        action: String,
        #[arg(long, default_value_t = 0, help = "Newest N entries (0 = all)")]
        limit: u64,
    },
    /// Show gateway status
    Status,
}

#[derive(Args)]
struct Target {
    #[arg(long, default_value = "kv", help = "Backend name")]
    backend: String,
    #[arg(long, default_value = "", help = "Table path")]
    table: String,
    #[arg(long, default_value = "", help = "Container")]
    container: String,
}

impl Target {
    fn session(&self) -> Session {
        Session {
            container: self.container.clone(),
            ..Session::default()
        }
    }
}

fn parse_arg(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

fn main() {
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<i32, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let code = if err.kind() == ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand {
                    2
                } else {
                    0
                };
                return Ok(code);
            }
            _ => {
                return Err(Error::new(ErrorKind::BadRequest)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Run `framegate --help` for usage."));
            }
        },
    };

    if let Command::Serve {
        config,
        http,
        rpc,
        no_rpc,
        max_body_bytes,
    } = cli.command
    {
        let serve = ServeConfig {
            http: Some(http),
            rpc: (!no_rpc).then_some(rpc),
            max_body_bytes,
        };
        return run_serve(config, serve).map(|()| 0);
    }

    let client = connect(&cli)?;
    match cli.command {
        Command::Serve { .. } => Ok(0),
        Command::Read {
            target,
            query,
            columns,
            filter,
            limit,
            message_limit,
            reset_index,
        } => {
            let request = ReadRequest {
                session: target.session(),
                backend: target.backend,
                table: target.table,
                query: query.unwrap_or_default(),
                columns,
                filter,
                limit,
                message_limit,
                reset_index,
                ..ReadRequest::default()
            };
            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            for frame in client.read(&request)? {
                emit_rows(&mut out, &frame?)?;
            }
            flush(&mut out)?;
            Ok(0)
        }
        Command::Write {
            target,
            index,
            save_mode,
            expression,
            condition,
            partition_keys,
            timeout,
        } => {
            let request = WriteRequest {
                session: target.session(),
                backend: target.backend,
                table: target.table,
                expression,
                condition,
                partition_keys,
                save_mode: SaveMode::parse(&save_mode)?,
                timeout: timeout.map(Duration::from_secs),
                ..WriteRequest::default()
            };
            let frames = frames_from_jsonl(io::stdin().lock(), index.as_deref())?;
            let (frames, rows) = client.write(&request, frames)?;
            emit_json(&json!({ "num_frames": frames, "num_rows": rows }))?;
            Ok(0)
        }
        Command::Create {
            target,
            if_exists_ignore,
        } => {
            client.create(&CreateRequest {
                session: target.session(),
                backend: target.backend,
                table: target.table,
                if_exists: error_options(if_exists_ignore),
                ..CreateRequest::default()
            })?;
            Ok(0)
        }
        Command::Delete {
            target,
            filter,
            if_missing_ignore,
        } => {
            client.delete(&DeleteRequest {
                session: target.session(),
                backend: target.backend,
                table: target.table,
                filter,
                if_missing: error_options(if_missing_ignore),
                ..DeleteRequest::default()
            })?;
            Ok(0)
        }
        Command::Exec {
            target,
            command,
            args,
            expression,
        } => {
            let args: BTreeMap<String, Json> = args
                .into_iter()
                .map(|(key, value)| (key, Json::String(value)))
                .collect();
            let frame = client.exec(&ExecRequest {
                session: target.session(),
                backend: target.backend,
                table: target.table,
                command,
                args,
                expression,
                ..ExecRequest::default()
            })?;
            if let Some(frame) = frame {
                let stdout = io::stdout();
                let mut out = BufWriter::new(stdout.lock());
                emit_rows(&mut out, &frame)?;
                flush(&mut out)?;
            }
            Ok(0)
        }
        Command::History {
            backend,
            table,
            action,
            limit,
        } => {
            let frame = client.history(&HistoryRequest {
                backend,
                table,
                action,
                limit,
                ..HistoryRequest::default()
            })?;
            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            emit_rows(&mut out, &frame)?;
            flush(&mut out)?;
            Ok(0)
        }
        Command::Status => {
            emit_json(&client.status()?)?;
            Ok(0)
        }
    }
}

fn run_serve(config_path: Option<PathBuf>, serve: ServeConfig) -> Result<(), Error> {
    let mut config = match config_path {
        Some(path) => Config::load(&path)?,
        None => Config::with_kv_backend(),
    };
    config.load_env_session(|name| std::env::var(name).ok())?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })?;
    runtime.block_on(server::serve(config, serve))
}

fn connect(cli: &Cli) -> Result<Client, Error> {
    let client = Client::new(&cli.url)?;
    Ok(match (&cli.token, &cli.user) {
        (Some(token), _) => client.with_token(token.clone()),
        (None, Some(user)) => {
            client.with_basic_auth(user.clone(), cli.password.clone().unwrap_or_default())
        }
        (None, None) => client,
    })
}

fn error_options(ignore: bool) -> ErrorOptions {
    if ignore {
        ErrorOptions::Ignore
    } else {
        ErrorOptions::Fail
    }
}

/// Groups JSON Lines objects into frames of `WRITE_BATCH_ROWS` rows.
fn frames_from_jsonl<R: BufRead>(input: R, index: Option<&str>) -> Result<Vec<Frame>, Error> {
    let index_names: Vec<&str> = index.into_iter().collect();
    let mut frames = Vec::new();
    let mut rows: Vec<RowMap> = Vec::with_capacity(WRITE_BATCH_ROWS);
    for (number, line) in input.lines().enumerate() {
        let line = line.map_err(|err| {
            Error::new(ErrorKind::Transport)
                .with_message("failed to read input")
                .with_source(err)
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let object: Map<String, Json> = serde_json::from_str(&line).map_err(|err| {
            Error::new(ErrorKind::BadRequest)
                .with_message(format!("line {}: expected a JSON object", number + 1))
                .with_source(err)
        })?;
        let row: RowMap = object
            .iter()
            .filter_map(|(name, value)| Value::from_json(value).map(|value| (name.clone(), value)))
            .collect();
        rows.push(row);
        if rows.len() == WRITE_BATCH_ROWS {
            frames.push(Frame::from_rows(&rows, &index_names)?);
            rows.clear();
        }
    }
    if !rows.is_empty() {
        frames.push(Frame::from_rows(&rows, &index_names)?);
    }
    Ok(frames)
}

fn emit_rows<W: Write>(out: &mut W, frame: &Frame) -> Result<(), Error> {
    for row in frame.rows(true) {
        let object: Map<String, Json> = row
            .to_map()
            .into_iter()
            .map(|(name, value)| (name, value.to_json()))
            .collect();
        let line = serde_json::to_string(&object).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode row")
                .with_source(err)
        })?;
        writeln!(out, "{line}").map_err(write_error)?;
    }
    Ok(())
}

fn emit_json(value: &Json) -> Result<(), Error> {
    let text = serde_json::to_string_pretty(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode output")
            .with_source(err)
    })?;
    println!("{text}");
    Ok(())
}

fn flush<W: Write>(out: &mut W) -> Result<(), Error> {
    out.flush().map_err(write_error)
}

fn write_error(err: io::Error) -> Error {
    Error::new(ErrorKind::Transport)
        .with_message("failed to write output")
        .with_source(err)
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("error: {}", err.message().unwrap_or("error"));
        if let Some(hint) = err.hint() {
            eprintln!("hint: {hint}");
        }
        return;
    }
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(err.kind().as_str()));
    inner.insert("message".to_string(), json!(err.message().unwrap_or("error")));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(table) = err.table() {
        inner.insert("table".to_string(), json!(table));
    }
    let text = serde_json::to_string(&json!({ "error": inner })).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{text}");
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
