//! Replays JSON-lines tasks against an in-memory deployment and prints one
//! JSON line per outcome.
//!
//! Input lines look like
//! `{"operation": "insertOne", "collection": "orders", "payload": [{"sku": "a"}]}`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use serde::{Deserialize, Serialize};
use storelane_core::{Outcome, Payload, Value};
use storelane_dispatch::memory::MemoryConnector;
use storelane_dispatch::observability::{init_tracing, LogFormat};
use storelane_dispatch::{DeploymentConfig, DispatchContext, Dispatcher, DispatcherSettings, Task};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "storelane-replay")]
#[command(about = "Replay JSON-lines tasks through the dispatcher")]
#[command(version)]
struct Args {
    /// Deployment connection URI; its path selects the database
    #[arg(long, env = "STORELANE_URI", default_value = "memory://localhost/test")]
    uri: String,

    /// Maximum operations in flight at once (0 = unbounded)
    #[arg(long, short, env = "STORELANE_PARALLELISM", default_value_t = 4)]
    parallelism: u32,

    /// Driver options as a JSON object
    #[arg(long, env = "STORELANE_OPTIONS", default_value = "")]
    options: String,

    /// Collection for every task, overriding the task's own
    #[arg(long)]
    collection: Option<String>,

    /// Operation for every task, overriding the task's own
    #[arg(long)]
    operation: Option<String>,

    /// Task file; stdin when omitted
    #[arg(long, short)]
    input: Option<PathBuf>,

    /// Simulated driver latency per call, in milliseconds
    #[arg(long, default_value_t = 0)]
    latency_ms: u64,

    /// Minimum spacing of status reports, in milliseconds
    #[arg(long, env = "STORELANE_STATUS_INTERVAL_MS", default_value_t = 1000)]
    status_interval_ms: u64,

    #[arg(long, value_enum, env = "STORELANE_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Deserialize)]
struct TaskLine {
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    collection: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct OutcomeLine {
    task: usize,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl OutcomeLine {
    fn new(task: usize, outcome: Outcome) -> Self {
        let (kind, value, error) = match outcome {
            Outcome::Iteration(value) => ("iteration", Some(value.into_json()), None),
            Outcome::End(payload) => ("end", payload.map(payload_json), None),
            Outcome::Error(err) => ("error", None, Some(err.to_string())),
        };
        Self {
            task,
            kind,
            value,
            error,
        }
    }

    fn is_terminal(&self) -> bool {
        self.kind != "iteration"
    }
}

fn payload_json(payload: Payload) -> serde_json::Value {
    match payload {
        Payload::Value(value) => value.into_json(),
        Payload::Database(db) => serde_json::json!({ "database": db.name() }),
        Payload::Collection(collection) => serde_json::json!({ "collection": collection.name() }),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format)?;

    let deployment = DeploymentConfig::new(args.uri)
        .with_parallelism(args.parallelism)
        .with_options_json(&args.options)?;
    let connector = MemoryConnector::new().with_latency(Duration::from_millis(args.latency_ms));
    let ctx = DispatchContext::new(Arc::new(connector));
    let settings = DispatcherSettings {
        collection: args.collection,
        operation: args.operation,
        status_interval: Duration::from_millis(args.status_interval_ms),
    };
    let dispatcher = Dispatcher::start(&ctx, Some(&deployment), settings);

    let reader: Box<dyn AsyncRead + Unpin + Send> = match &args.input {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<OutcomeLine>();
    let mut lines = BufReader::new(reader).lines();
    let mut submitted = 0usize;
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: TaskLine = serde_json::from_str(&line)
            .with_context(|| format!("line {line_no}: not a task object"))?;
        let index = submitted;
        let tx = tx.clone();
        let mut task = Task::new(Value::from(parsed.payload), move |outcome: Outcome| {
            // The receiver only goes away once every task finished.
            let _ = tx.send(OutcomeLine::new(index, outcome));
        });
        if let Some(operation) = parsed.operation {
            task = task.with_operation(operation);
        }
        if let Some(collection) = parsed.collection {
            task = task.with_scope(collection);
        }
        dispatcher.submit(task);
        submitted += 1;
    }
    drop(tx);
    tracing::info!(submitted, "all tasks submitted");

    let mut stdout = tokio::io::stdout();
    let mut remaining = submitted;
    while remaining > 0 {
        let Some(line) = rx.recv().await else {
            break;
        };
        if line.is_terminal() {
            remaining -= 1;
        }
        let mut text = serde_json::to_string(&line)?;
        text.push('\n');
        stdout.write_all(text.as_bytes()).await?;
    }
    stdout.flush().await?;

    let snapshot = dispatcher.profiling();
    dispatcher.close();
    tracing::info!(
        submitted = snapshot.submitted,
        succeeded = snapshot.succeeded,
        failed = snapshot.failed,
        "replay finished"
    );
    Ok(())
}
