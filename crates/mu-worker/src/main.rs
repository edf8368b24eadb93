//! The MU process: polls monitored processes for scheduled messages and
//! cranks the evaluations they trigger (spec.md §4.I-J). No inbound
//! router here — this binary only drives the poll loop outward.

use ao_cli_common::{init_logging, MuConfig, OrBail};
use ao_http_clients::{
    ConfigNodeSelector, ExternalSigner, HttpCuClient, HttpScheduledFetcher, HttpSuClient, RocksDbScheduledBatchWriter,
    UuidBatchIdGenerator,
};
use clap::Parser;
use mu_cranker::CrankDeps;
use mu_monitor::{MonitorLoopConfig, MonitorLoopDeps, RocksDbMonitorStore};
use std::time::Duration;

#[tokio::main]
async fn main() {
    let config = MuConfig::parse();
    init_logging(&config.log);

    let monitor_store = RocksDbMonitorStore::open(&config.db_path.join("monitors")).or_bail("failed to open monitor store");
    let batch_writer = RocksDbScheduledBatchWriter::open(&config.db_path.join("scheduled_batches"))
        .or_bail("failed to open scheduled batch store");

    let scheduled_fetcher = HttpScheduledFetcher::new(config.cu_url.clone());
    let signer = ExternalSigner::new(config.module_owner.clone());
    let su_client = HttpSuClient::new(config.sequencer_url.clone());
    let node_selector = ConfigNodeSelector::new(config.cu_url.to_string());
    let cu_client = HttpCuClient::new();
    let batch_id_generator = UuidBatchIdGenerator::new();

    let deps = MonitorLoopDeps {
        monitor_store: &monitor_store,
        scheduled_fetcher: &scheduled_fetcher,
        batch_writer: &batch_writer,
        batch_id_generator: &batch_id_generator,
        crank: CrankDeps {
            signer: &signer,
            su_client: &su_client,
            node_selector: &node_selector,
            cu_client: &cu_client,
        },
        crank_depth_limit: config.crank_depth_limit,
    };

    let loop_config = MonitorLoopConfig {
        poll_interval: Duration::from_millis(config.monitor_poll_interval_ms),
        max_concurrency: config.monitor_max_concurrency,
    };

    tracing::info!(
        poll_interval_ms = config.monitor_poll_interval_ms,
        max_concurrency = config.monitor_max_concurrency,
        mode = ?config.mode,
        "mu-worker starting monitor loop"
    );

    mu_monitor::run(&deps, &loop_config, async {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("received shutdown signal");
    })
    .await;
}
