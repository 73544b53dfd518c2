//! Pipeline orchestration.
//!
//! The job is a fixed task graph:
//!
//! ```text
//! fetch_playlist ─▶ upload_raw ─▶ read_pending ─┬▶ process_album  ─▶ store_album  ─┐
//!                                               ├▶ process_artist ─▶ store_artist ─┼▶ move_processed
//!                                               └▶ process_song   ─▶ store_song   ─┘
//! ```
//!
//! Tasks run one at a time in [`TaskId::EXECUTION_ORDER`]. A task runs only
//! if every upstream task in the same plan succeeded; otherwise it is marked
//! [`TaskState::UpstreamFailed`]. The three table branches are independent,
//! so a failure in one still lets the other two publish, but
//! `move_processed` never runs unless all three stored their table.
//!
//! Data moves between tasks through [`RunOutputs`], never through globals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::catalog::PlaylistSource;
use crate::config::StorageConfig;
use crate::error::{EtlError, Result};
use crate::models::{FetchedPlaylist, PendingDocument, TableKind};
use crate::normalize;
use crate::store::ObjectStore;

/// One node of the task graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskId {
    FetchPlaylist,
    UploadRaw,
    ReadPending,
    Process(TableKind),
    Store(TableKind),
    MoveProcessed,
}

impl TaskId {
    /// Topological order of the whole graph.
    pub const EXECUTION_ORDER: [TaskId; 10] = [
        TaskId::FetchPlaylist,
        TaskId::UploadRaw,
        TaskId::ReadPending,
        TaskId::Process(TableKind::Album),
        TaskId::Store(TableKind::Album),
        TaskId::Process(TableKind::Artist),
        TaskId::Store(TableKind::Artist),
        TaskId::Process(TableKind::Song),
        TaskId::Store(TableKind::Song),
        TaskId::MoveProcessed,
    ];

    pub fn upstream(self) -> Vec<TaskId> {
        match self {
            TaskId::FetchPlaylist => vec![],
            TaskId::UploadRaw => vec![TaskId::FetchPlaylist],
            TaskId::ReadPending => vec![TaskId::UploadRaw],
            TaskId::Process(_) => vec![TaskId::ReadPending],
            TaskId::Store(kind) => vec![TaskId::Process(kind)],
            TaskId::MoveProcessed => TableKind::ALL.iter().map(|k| TaskId::Store(*k)).collect(),
        }
    }

    pub fn name(self) -> String {
        match self {
            TaskId::FetchPlaylist => "fetch_playlist".to_string(),
            TaskId::UploadRaw => "upload_raw".to_string(),
            TaskId::ReadPending => "read_pending".to_string(),
            TaskId::Process(kind) => format!("process_{}", kind),
            TaskId::Store(kind) => format!("store_{}", kind),
            TaskId::MoveProcessed => "move_processed".to_string(),
        }
    }
}

/// Which subset of the graph a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Every task.
    Full,
    /// Fetch and upload the raw document only.
    Fetch,
    /// Read pending, build and store tables; leave pending documents alone.
    Transform,
    /// Move pending documents to processed only.
    Archive,
}

impl Plan {
    pub fn tasks(self) -> Vec<TaskId> {
        TaskId::EXECUTION_ORDER
            .into_iter()
            .filter(|task| match self {
                Plan::Full => true,
                Plan::Fetch => matches!(task, TaskId::FetchPlaylist | TaskId::UploadRaw),
                Plan::Transform => matches!(
                    task,
                    TaskId::ReadPending | TaskId::Process(_) | TaskId::Store(_)
                ),
                Plan::Archive => *task == TaskId::MoveProcessed,
            })
            .collect()
    }

    pub fn needs_source(self) -> bool {
        matches!(self, Plan::Full | Plan::Fetch)
    }
}

#[derive(Debug)]
pub enum TaskState {
    Success,
    Failed(EtlError),
    UpstreamFailed,
}

impl TaskState {
    fn label(&self) -> &'static str {
        match self {
            TaskState::Success => "success",
            TaskState::Failed(_) => "failed",
            TaskState::UpstreamFailed => "upstream_failed",
        }
    }
}

/// Values handed from one task to the next.
#[derive(Debug, Default)]
pub struct RunOutputs {
    pub fetched: Option<FetchedPlaylist>,
    pub raw_key: Option<String>,
    pub pending: Vec<PendingDocument>,
    pub tables: HashMap<TableKind, Vec<u8>>,
    pub published: Vec<(TableKind, String)>,
    pub moved: Vec<(String, String)>,
}

/// Outcome of one pipeline run.
#[derive(Debug)]
pub struct RunReport {
    pub run_at: DateTime<Utc>,
    pub tasks: Vec<(TaskId, TaskState)>,
    pub outputs: RunOutputs,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.tasks
            .iter()
            .all(|(_, state)| matches!(state, TaskState::Success))
    }

    pub fn state(&self, task: TaskId) -> Option<&TaskState> {
        self.tasks.iter().find(|(t, _)| *t == task).map(|(_, s)| s)
    }

    /// The first task failure, in execution order.
    pub fn first_error(&self) -> Option<(TaskId, &EtlError)> {
        self.tasks.iter().find_map(|(task, state)| match state {
            TaskState::Failed(e) => Some((*task, e)),
            _ => None,
        })
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "run {}", run_stamp(self.run_at))?;
        for (task, state) in &self.tasks {
            write!(f, "  {:<16} {}", task.name(), state.label())?;
            if let TaskState::Failed(e) = state {
                write!(f, "  ({})", e)?;
            }
            writeln!(f)?;
        }
        if let Some(ref key) = self.outputs.raw_key {
            writeln!(f, "  raw document: {}", key)?;
        }
        if self.tasks.iter().any(|(t, _)| *t == TaskId::ReadPending) {
            writeln!(f, "  pending documents: {}", self.outputs.pending.len())?;
        }
        for (kind, key) in &self.outputs.published {
            writeln!(f, "  {} table: {}", kind, key)?;
        }
        if self.tasks.iter().any(|(t, _)| *t == TaskId::MoveProcessed) {
            writeln!(f, "  archived documents: {}", self.outputs.moved.len())?;
        }
        write!(f, "{}", if self.is_success() { "ok" } else { "failed" })
    }
}

/// The job, wired to its store and catalog source.
pub struct Pipeline {
    storage: StorageConfig,
    store: Arc<dyn ObjectStore>,
    source: Option<Arc<dyn PlaylistSource>>,
}

impl Pipeline {
    pub fn new(
        storage: StorageConfig,
        store: Arc<dyn ObjectStore>,
        source: Option<Arc<dyn PlaylistSource>>,
    ) -> Self {
        Self {
            storage,
            store,
            source,
        }
    }

    /// Execute a plan once.
    pub async fn run(&self, plan: Plan, run_at: DateTime<Utc>) -> RunReport {
        let tasks = plan.tasks();
        let mut states: HashMap<TaskId, bool> = HashMap::new();
        let mut report = RunReport {
            run_at,
            tasks: Vec::with_capacity(tasks.len()),
            outputs: RunOutputs::default(),
        };

        info!(
            plan = ?plan,
            store = %self.store.location(),
            run = %run_stamp(run_at),
            "run started"
        );

        for task in tasks.iter().copied() {
            // Upstream tasks outside this plan count as satisfied.
            let blocked = task
                .upstream()
                .iter()
                .any(|up| states.get(up).is_some_and(|ok| !ok));
            let state = if blocked {
                warn!(task = %task.name(), "upstream failed, skipping");
                TaskState::UpstreamFailed
            } else {
                match self.run_task(task, run_at, &mut report.outputs).await {
                    Ok(()) => {
                        info!(task = %task.name(), "task succeeded");
                        TaskState::Success
                    }
                    Err(e) => {
                        error!(task = %task.name(), error = %e, "task failed");
                        TaskState::Failed(e)
                    }
                }
            };
            states.insert(task, matches!(state, TaskState::Success));
            report.tasks.push((task, state));
        }

        info!(success = report.is_success(), "run finished");
        report
    }

    async fn run_task(
        &self,
        task: TaskId,
        run_at: DateTime<Utc>,
        outputs: &mut RunOutputs,
    ) -> Result<()> {
        let store = self.store.as_ref();
        match task {
            TaskId::FetchPlaylist => {
                let source = self.source.as_ref().ok_or_else(|| {
                    EtlError::Config("no playlist source configured for this run".to_string())
                })?;
                outputs.fetched = Some(source.fetch_playlist().await?);
            }
            TaskId::UploadRaw => {
                let fetched = outputs.fetched.as_ref().ok_or_else(|| {
                    EtlError::Config("upload_raw ran without a fetched document".to_string())
                })?;
                outputs.raw_key = Some(archive_raw(store, &self.storage, fetched).await?);
            }
            TaskId::ReadPending => {
                outputs.pending = load_pending(store, &self.storage.pending_prefix).await?;
            }
            TaskId::Process(kind) => {
                let table = normalize::build_table(kind, &outputs.pending)?;
                outputs.tables.insert(kind, table);
            }
            TaskId::Store(kind) => {
                let table = outputs.tables.get(&kind).ok_or_else(|| {
                    EtlError::Config(format!("store_{} ran without a built table", kind))
                })?;
                let key = table_key(&self.storage, kind, run_at);
                publish_table(store, &key, table.clone()).await?;
                outputs.published.push((kind, key));
            }
            TaskId::MoveProcessed => {
                outputs.moved = move_processed(
                    store,
                    &self.storage.pending_prefix,
                    &self.storage.processed_prefix,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Run the full plan every `interval` until Ctrl-C.
    pub async fn run_forever(&self, interval: Duration) -> Result<()> {
        self.run_until(interval, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run the full plan every `interval` until `shutdown` completes.
    ///
    /// Runs never overlap: the next tick is awaited only after the current
    /// run returns, and missed ticks are delayed rather than bursted. A
    /// failed run is logged and the loop carries on.
    pub async fn run_until<F>(&self, interval: Duration, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let report = self.run(Plan::Full, Utc::now()).await;
                    match report.first_error() {
                        None => info!("scheduled run succeeded"),
                        Some((task, e)) => {
                            error!(task = %task.name(), error = %e, "scheduled run failed")
                        }
                    }
                }
            }
        }
    }
}

/// `YYYYMMDDTHHMMSS`, the run stamp used in table keys.
pub fn run_stamp(run_at: DateTime<Utc>) -> String {
    run_at.format("%Y%m%dT%H%M%S").to_string()
}

/// Key for a table published by the run at `run_at`.
pub fn table_key(storage: &StorageConfig, kind: TableKind, run_at: DateTime<Utc>) -> String {
    let prefix = match kind {
        TableKind::Album => &storage.transformed.albums,
        TableKind::Artist => &storage.transformed.artists,
        TableKind::Song => &storage.transformed.songs,
    };
    format!("{}{}_transformed_{}.csv", prefix, kind, run_stamp(run_at))
}

/// Store a freshly fetched document under the pending prefix.
pub async fn archive_raw(
    store: &dyn ObjectStore,
    storage: &StorageConfig,
    fetched: &FetchedPlaylist,
) -> Result<String> {
    let key = format!("{}{}", storage.pending_prefix, fetched.filename);
    store.put(&key, fetched.body.clone().into_bytes()).await?;
    info!(key = %key, bytes = fetched.body.len(), "raw document stored");
    Ok(key)
}

/// Keys under `prefix` that name JSON documents, in store order.
pub async fn pending_keys(store: &dyn ObjectStore, prefix: &str) -> Result<Vec<String>> {
    Ok(store
        .list_keys(prefix)
        .await?
        .into_iter()
        .filter(|k| k.ends_with(".json"))
        .collect())
}

/// Read and parse every pending JSON document.
pub async fn load_pending(store: &dyn ObjectStore, prefix: &str) -> Result<Vec<PendingDocument>> {
    let keys = pending_keys(store, prefix).await?;
    let mut docs = Vec::with_capacity(keys.len());
    for key in keys {
        let bytes = store.get(&key).await?;
        let body = serde_json::from_slice(&bytes).map_err(|e| EtlError::malformed(&key, e))?;
        docs.push(PendingDocument { key, body });
    }
    info!(count = docs.len(), prefix = %prefix, "pending documents loaded");
    Ok(docs)
}

/// Write a table, replacing any object already at `key`.
pub async fn publish_table(store: &dyn ObjectStore, key: &str, table: Vec<u8>) -> Result<()> {
    let bytes = table.len();
    store.put(key, table).await?;
    info!(key = %key, bytes, "table published");
    Ok(())
}

/// `pending/<rest>` → `processed/<rest>`; `None` if `key` is not under
/// `pending_prefix`.
pub fn processed_key(key: &str, pending_prefix: &str, processed_prefix: &str) -> Option<String> {
    key.strip_prefix(pending_prefix)
        .map(|rest| format!("{}{}", processed_prefix, rest))
}

/// Copy every pending JSON document to the processed prefix, then delete
/// the original.
///
/// Copy and delete are separate requests. If a delete fails after its copy
/// succeeded, the document exists in both places and the next run will
/// process it again.
pub async fn move_processed(
    store: &dyn ObjectStore,
    pending_prefix: &str,
    processed_prefix: &str,
) -> Result<Vec<(String, String)>> {
    let mut moved = Vec::new();
    for key in pending_keys(store, pending_prefix).await? {
        let Some(target) = processed_key(&key, pending_prefix, processed_prefix) else {
            continue;
        };
        store.copy(&key, &target).await?;
        store.delete(&key).await?;
        info!(from = %key, to = %target, "archived");
        moved.push((key, target));
    }
    Ok(moved)
}
