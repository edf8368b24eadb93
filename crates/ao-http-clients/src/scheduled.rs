//! The CU's `scheduled/{processId}` endpoint (spec.md §6): the source of
//! cron and scheduled messages the MU monitor loop polls, plus the
//! local persistence of each polled batch so it can be cranked.

use crate::HttpEndpoint;
use ao_types::{CuError, MessageBody};
use mu_monitor::{ScheduledBatchWriter, ScheduledFetcher, ScheduledMessage};
use serde::Deserialize;
use url::Url;

pub struct HttpScheduledFetcher {
    endpoint: HttpEndpoint,
}

impl HttpScheduledFetcher {
    pub fn new(base_url: Url) -> Self {
        HttpScheduledFetcher {
            endpoint: HttpEndpoint::new(base_url),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireScheduled {
    #[serde(rename = "sortKey")]
    sort_key: String,
    message: MessageBody,
}

#[async_trait::async_trait]
impl ScheduledFetcher for HttpScheduledFetcher {
    async fn fetch_scheduled(&self, process_id: &str, from: Option<&str>) -> Result<Vec<ScheduledMessage>, CuError> {
        let path = format!("/scheduled/{process_id}");
        let query: Vec<(&str, &str)> = from.map(|f| vec![("from", f)]).unwrap_or_default();
        let wire: Vec<WireScheduled> = self.endpoint.get_json(&path, &query).await?;
        Ok(wire
            .into_iter()
            .map(|w| ScheduledMessage {
                message: w.message,
                scheduled_sort_key: w.sort_key,
            })
            .collect())
    }
}

/// Persists a freshly-fetched batch under `from_tx_id`, by the same
/// `ResultStoreBackend`-style RocksDB scheme the CU's result store uses,
/// so a crash mid-crank can be resumed without re-sending already-seen
/// messages.
pub struct RocksDbScheduledBatchWriter {
    db: rocksdb::DB,
}

const BATCHES_CF: &str = "scheduled_batches";

impl RocksDbScheduledBatchWriter {
    pub fn open(path: &std::path::Path) -> Result<Self, CuError> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let db = rocksdb::DB::open_cf(&opts, path, [BATCHES_CF]).map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?;
        Ok(RocksDbScheduledBatchWriter { db })
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, CuError> {
        self.db
            .cf_handle(BATCHES_CF)
            .ok_or_else(|| CuError::fatal(anyhow::anyhow!("missing column family {BATCHES_CF}")))
    }
}

#[async_trait::async_trait]
impl ScheduledBatchWriter for RocksDbScheduledBatchWriter {
    async fn persist_batch(
        &self,
        process_id: &str,
        from_tx_id: &str,
        messages: &[ScheduledMessage],
    ) -> Result<Vec<MessageBody>, CuError> {
        let key = format!("proc-{process_id}:{from_tx_id}");
        let value = serde_json::to_vec(messages).map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?;
        self.db
            .put_cf(self.cf()?, key.as_bytes(), value)
            .map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?;
        Ok(messages.iter().map(|m| m.message.clone()).collect())
    }
}
