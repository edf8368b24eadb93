//! MU Monitor Loop (spec.md §4.J): poll monitored processes for scheduled
//! messages at a fixed interval and crank the resulting batches.
//!
//! Concurrency is bounded the way the base crate's task-automation server
//! bounds its dequeue loop (a fixed number of in-flight slots, mirroring
//! `automations::server::serve`'s semaphore), adapted to a single-process
//! `for_each_concurrent` fan-out since monitors here are driven in-place
//! rather than spawned onto a shared pool. Each tick fully drains before
//! the next begins, which is what stands in for the base design's
//! `runningMonitorList`: a monitor can never have two ticks in flight at
//! once.

use ao_types::{sort_key, CuError, Monitor};
use futures::stream::{self, StreamExt};
use std::time::Duration;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ScheduledMessage {
    pub message: ao_types::MessageBody,
    pub scheduled_sort_key: String,
}

/// Where monitors are read from and written back to. An external
/// collaborator per spec.md §1 (the embedded document store).
pub trait MonitorStore: Send + Sync {
    fn list_monitors(&self) -> Result<Vec<Monitor>, CuError>;
    fn save_monitor(&self, monitor: &Monitor) -> Result<(), CuError>;
}

/// The CU's `scheduled/{processId}` endpoint (spec.md §6).
#[async_trait::async_trait]
pub trait ScheduledFetcher: Send + Sync {
    async fn fetch_scheduled(&self, process_id: &str, from: Option<&str>) -> Result<Vec<ScheduledMessage>, CuError>;
}

/// Persists a batch of scheduled messages under a freshly generated
/// `fromTxId`, returning them as cranker-ready `MessageBody` values.
#[async_trait::async_trait]
pub trait ScheduledBatchWriter: Send + Sync {
    async fn persist_batch(
        &self,
        process_id: &str,
        from_tx_id: &str,
        messages: &[ScheduledMessage],
    ) -> Result<Vec<ao_types::MessageBody>, CuError>;
}

pub trait BatchIdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

pub struct MonitorLoopDeps<'a> {
    pub monitor_store: &'a dyn MonitorStore,
    pub scheduled_fetcher: &'a dyn ScheduledFetcher,
    pub batch_writer: &'a dyn ScheduledBatchWriter,
    pub batch_id_generator: &'a dyn BatchIdGenerator,
    pub crank: mu_cranker::CrankDeps<'a>,
    pub crank_depth_limit: u32,
}

pub struct MonitorLoopConfig {
    /// Fixed poll interval; spec.md §4.J specifies "approximately 1s".
    pub poll_interval: Duration,
    pub max_concurrency: usize,
}

async fn poll_one(monitor: &Monitor, deps: &MonitorLoopDeps<'_>) {
    if let Err(e) = poll_one_inner(monitor, deps).await {
        tracing::warn!(process_id = %monitor.id, error = %e, "monitor poll failed, will retry next tick");
    }
}

async fn poll_one_inner(monitor: &Monitor, deps: &MonitorLoopDeps<'_>) -> Result<(), CuError> {
    if !monitor.authorized {
        return Ok(());
    }

    let scheduled = deps
        .scheduled_fetcher
        .fetch_scheduled(&monitor.id, monitor.last_from_sort_key.as_deref())
        .await?;
    if scheduled.is_empty() {
        return Ok(());
    }

    let from_tx_id = deps.batch_id_generator.generate();
    let persisted = deps.batch_writer.persist_batch(&monitor.id, &from_tx_id, &scheduled).await?;

    let outcome = mu_cranker::crank(&deps.crank, persisted, deps.crank_depth_limit).await;
    if !outcome.unsent.is_empty() {
        tracing::warn!(
            process_id = %monitor.id,
            unsent = outcome.unsent.len(),
            "some cranked messages were not dispatched, will retry on the next poll"
        );
    }

    let max_sort_key = scheduled
        .iter()
        .map(|m| m.scheduled_sort_key.as_str())
        .max_by(|a, b| sort_key::compare(a, b))
        .unwrap()
        .to_string();

    let mut updated = monitor.clone();
    updated.last_from_sort_key = Some(max_sort_key);
    deps.monitor_store.save_monitor(&updated)?;
    Ok(())
}

/// Poll all monitors once. Exposed separately from [`run`] so a caller
/// (or a test) can drive a single tick directly.
pub async fn tick(deps: &MonitorLoopDeps<'_>, max_concurrency: usize) {
    let monitors = match deps.monitor_store.list_monitors() {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(error = %e, "failed to list monitors, will retry next tick");
            return;
        }
    };

    stream::iter(monitors)
        .for_each_concurrent(Some(max_concurrency), |monitor| async move { poll_one(&monitor, deps).await })
        .await;
}

const MONITORS_CF: &str = "monitors";

fn monitor_key(process_id: &str) -> String {
    format!("proc-{process_id}")
}

/// Production [`MonitorStore`]: one RocksDB column family, keyed by
/// process id, following the same prefix-keyed scheme as the result
/// store.
pub struct RocksDbMonitorStore {
    db: rocksdb::DB,
}

impl RocksDbMonitorStore {
    pub fn open(path: &std::path::Path) -> Result<Self, CuError> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = rocksdb::DB::open_cf(&opts, path, [MONITORS_CF]).map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?;
        tracing::debug!(path = %path.display(), "opened monitor store");
        Ok(RocksDbMonitorStore { db })
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, CuError> {
        self.db
            .cf_handle(MONITORS_CF)
            .ok_or_else(|| CuError::fatal(anyhow::anyhow!("missing column family {MONITORS_CF}")))
    }
}

impl MonitorStore for RocksDbMonitorStore {
    fn list_monitors(&self) -> Result<Vec<Monitor>, CuError> {
        let cf = self.cf()?;
        self.db
            .iterator_cf(cf, rocksdb::IteratorMode::Start)
            .map(|item| {
                let (_, value) = item.map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?;
                serde_json::from_slice(&value).map_err(|e| CuError::fatal(anyhow::anyhow!(e)))
            })
            .collect()
    }

    fn save_monitor(&self, monitor: &Monitor) -> Result<(), CuError> {
        let key = monitor_key(&monitor.id);
        let value = serde_json::to_vec(monitor).map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?;
        self.db
            .put_cf(self.cf()?, key.as_bytes(), value)
            .map_err(|e| CuError::fatal(anyhow::anyhow!(e)))
    }
}

/// Run the monitor loop at `config.poll_interval` until `shutdown`
/// resolves.
pub async fn run(deps: &MonitorLoopDeps<'_>, config: &MonitorLoopConfig, shutdown: impl std::future::Future<Output = ()>) {
    let mut ticker = tokio::time::interval(config.poll_interval);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => {
                tracing::info!("monitor loop signaled to stop");
                return;
            }
        }

        tick(deps, config.max_concurrency).await;
    }
}
