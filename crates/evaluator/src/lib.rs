//! Evaluator (spec.md §4.G): fold a process's hydrated message stream
//! through its WASM process, producing updated memory and outbound work.

use ao_types::{sort_key, AoGlobal, CuError, Evaluation, Message, MessageBody, Output};
use memory_cache::{CacheKey, OnEviction, ProcessMemoryCache};
use result_store::{ResultStore, ResultStoreBackend};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// The WASM runtime itself is an external collaborator (spec.md §1); this
/// trait is the seam the evaluator folds through.
#[async_trait::async_trait]
pub trait WasmProcess: Send + Sync {
    async fn evaluate(&self, memory: Option<&[u8]>, message: &Message, ao_global: &AoGlobal) -> Result<Output, CuError>;
}

/// Records evictions from the [`ProcessMemoryCache`] so the evaluator can
/// publish a Checkpoint for the memory that was about to be dropped,
/// outside of the cache's own synchronous callback.
#[derive(Default)]
pub struct EvictionRecorder {
    pending: Mutex<Vec<(String, CacheKey)>>,
}

impl EvictionRecorder {
    pub fn new() -> Self {
        EvictionRecorder::default()
    }

    pub fn drain(&self) -> Vec<(String, CacheKey)> {
        std::mem::take(&mut self.pending.lock().unwrap())
    }
}

impl OnEviction for EvictionRecorder {
    fn on_eviction(&self, process_id: &str, key: &CacheKey) {
        self.pending.lock().unwrap().push((process_id.to_string(), key.clone()));
    }
}

pub struct CheckpointDeps<'a> {
    pub gateway: &'a dyn checkpoint_store::GatewayClient,
    pub signer: &'a dyn checkpoint_store::Signer,
    pub policy: &'a dyn checkpoint_store::CheckpointPolicy,
    pub module_id: &'a str,
}

pub struct EvaluatorDeps<'a, RB: ResultStoreBackend> {
    pub result_store: &'a ResultStore<RB>,
    pub source_client: &'a dyn message_source::SequencerClient,
    pub hydration_config: &'a hydration::HydrationConfig,
    pub wasm: &'a dyn WasmProcess,
    pub checkpoint: CheckpointDeps<'a>,
    /// Publish a checkpoint after every N persisted evaluations, in
    /// addition to the eviction-triggered publish. `None` disables
    /// periodic publication.
    pub checkpoint_every: Option<u64>,
}

pub struct EvaluateRequest<'a> {
    pub process_id: &'a str,
    pub to: &'a str,
}

#[derive(Default)]
pub struct EvaluateOutcome {
    pub memory: Option<Vec<u8>>,
    pub last_evaluation: Option<Evaluation>,
    pub outbound_messages: Vec<MessageBody>,
    pub spawns: Vec<MessageBody>,
    pub evaluated_count: u64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Best-effort extraction of the timestamp field from a sortKey, used only
/// to bound a Checkpoint Store discovery query; the SU-side interpretation
/// of `to` as a Message Source bound does not go through this.
fn sort_key_timestamp(s: &str) -> u64 {
    sort_key::canonicalize(s)
        .splitn(3, ',')
        .nth(1)
        .and_then(|v| v.parse().ok())
        .unwrap_or(u64::MAX)
}

async fn publish_checkpoint<RB: ResultStoreBackend>(
    deps: &EvaluatorDeps<'_, RB>,
    process_id: &str,
    memory: &[u8],
    key: &CacheKey,
) -> Result<(), CuError> {
    let gzipped = checkpoint_store::compress(memory)?;
    let (height, _) = parse_height_and_rest(&key.sort_key);
    let req = checkpoint_store::PublishRequest {
        process_id,
        module_id: deps.checkpoint.module_id,
        epoch: None,
        nonce: None,
        timestamp: key.timestamp,
        block_height: height,
        cron_interval: key.cron.as_deref(),
        gzipped_memory: &gzipped,
    };
    match checkpoint_store::publish(deps.checkpoint.gateway, deps.checkpoint.signer, deps.checkpoint.policy, req).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_retriable() => {
            tracing::warn!(process_id, error = %e, "checkpoint publish failed, will retry on next eviction");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn parse_height_and_rest(sort_key: &str) -> (u64, String) {
    let canon = sort_key::canonicalize(sort_key);
    let mut parts = canon.splitn(2, ',');
    let height = parts.next().unwrap_or("0").parse().unwrap_or(0);
    (height, parts.next().unwrap_or("").to_string())
}

/// Run the fold algorithm for `(processId, to)`: locate starting memory,
/// open a Message Source, hydrate, fold each message through the WASM
/// process, persist and cache each evaluation, and publish checkpoints.
pub async fn evaluate<'a, RB, E>(
    req: EvaluateRequest<'_>,
    deps: &EvaluatorDeps<'_, RB>,
    hydration_deps: &'a hydration::HydrationDeps<'a>,
    cache: &Mutex<ProcessMemoryCache<E>>,
    eviction_recorder: &EvictionRecorder,
) -> Result<EvaluateOutcome, CuError>
where
    RB: ResultStoreBackend,
    E: OnEviction,
{
    use futures::stream::StreamExt;

    let mut start_sort_key = sort_key::MIN_COLLATION_CHAR.to_string();
    let mut current_memory: Option<Vec<u8>> = None;

    {
        let mut guard = cache.lock().unwrap();
        if let Some(hit) = guard
            .get(req.process_id)
            .map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?
        {
            if !sort_key::compare(&hit.key.sort_key, req.to).is_gt() {
                start_sort_key = hit.key.sort_key.clone();
                current_memory = Some(hit.memory);
            }
        }
    }

    if current_memory.is_none() {
        if let Some(discovered) = checkpoint_store::discover(
            deps.checkpoint.gateway,
            deps.checkpoint.signer.owner_address(),
            req.process_id,
            sort_key_timestamp(req.to),
            None,
        )
        .await?
        {
            start_sort_key = format!("{:012}", discovered.block_height);
            current_memory = Some(discovered.memory);
        }
    }

    let source = message_source::open(deps.source_client, req.process_id, &start_sort_key, req.to);
    let mut pipeline = Box::pin(hydration::pipeline(source, hydration_deps, deps.hydration_config));

    let mut outcome = EvaluateOutcome {
        memory: current_memory.clone(),
        ..Default::default()
    };

    while let Some(item) = pipeline.next().await {
        let msg = item?;

        if let Some(deep_hash) = &msg.deep_hash {
            if deps.result_store.find_by_deep_hash(req.process_id, deep_hash)?.is_some() {
                continue;
            }
        }
        if deps
            .result_store
            .find_evaluation_at(req.process_id, &msg.sort_key)?
            .is_some()
        {
            continue;
        }

        let output = deps
            .wasm
            .evaluate(current_memory.as_deref(), &msg, &msg.ao_global)
            .await?;

        if let Some(new_memory) = &output.memory {
            current_memory = Some(new_memory.clone());
        }
        outcome.memory = current_memory.clone();
        outcome.outbound_messages.extend(output.messages.clone());
        outcome.spawns.extend(output.spawns.clone());

        let cron = ao_types::tag_value(&msg.message.tags, "Cron-Interval").map(|s| s.to_string());
        let evaluation = Evaluation {
            sort_key: msg.sort_key.clone(),
            process_id: req.process_id.to_string(),
            message_id: msg.message.id.clone(),
            timestamp: msg.ao_global.block.timestamp,
            is_cron: msg.is_cron.unwrap_or(false),
            epoch: msg.epoch,
            nonce: msg.nonce,
            evaluated_at: now_millis(),
            output,
            deep_hash: msg.deep_hash.clone(),
        };
        deps.result_store.save_evaluation(&evaluation)?;
        outcome.evaluated_count += 1;
        outcome.last_evaluation = Some(evaluation);

        let cache_key = CacheKey {
            sort_key: msg.sort_key.clone(),
            timestamp: msg.ao_global.block.timestamp,
            cron,
        };
        if let Some(memory) = &current_memory {
            let mut guard = cache.lock().unwrap();
            guard
                .set(req.process_id, cache_key, memory)
                .map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?;
        }

        for (process_id, key) in eviction_recorder.drain() {
            if let Some(memory) = &current_memory {
                publish_checkpoint(deps, &process_id, memory, &key).await?;
            }
        }

        if let Some(period) = deps.checkpoint_every {
            if period > 0 && outcome.evaluated_count % period == 0 {
                if let Some(memory) = &current_memory {
                    let key = CacheKey {
                        sort_key: msg.sort_key.clone(),
                        timestamp: msg.ao_global.block.timestamp,
                        cron: ao_types::tag_value(&msg.message.tags, "Cron-Interval").map(|s| s.to_string()),
                    };
                    publish_checkpoint(deps, req.process_id, memory, &key).await?;
                }
            }
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod test {
    use super::*;
    use checkpoint_store::{CheckpointDataItem, CheckpointRecord, DefaultCheckpointPolicy, GatewayClient, SignedDataItem, Signer};
    use hydration::{AssignmentOverlay, AssignmentResolver, DataLoader, HydrationConfig, HydrationDeps, LoadedData};
    use message_source::{SequencerClient, SuInteraction, SuPage};
    use result_store::RocksDbBackend;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct EchoWasm;
    #[async_trait::async_trait]
    impl WasmProcess for EchoWasm {
        async fn evaluate(&self, memory: Option<&[u8]>, _message: &Message, _ao_global: &AoGlobal) -> Result<Output, CuError> {
            let mut memory = memory.map(|m| m.to_vec()).unwrap_or_default();
            memory.push(1);
            Ok(Output {
                memory: Some(memory),
                messages: vec![],
                spawns: vec![],
                output: serde_json::Value::Null,
                error: None,
                gas_used: Some(1),
            })
        }
    }

    struct OnePageClient {
        interactions: StdMutex<Vec<SuInteraction>>,
    }

    #[async_trait::async_trait]
    impl SequencerClient for OnePageClient {
        async fn fetch_page(
            &self,
            _process_id: &str,
            _from: &str,
            _to: &str,
            _cursor: Option<String>,
        ) -> Result<SuPage, CuError> {
            let mut all = self.interactions.lock().unwrap();
            if all.is_empty() {
                Ok(SuPage {
                    interactions: vec![],
                    has_next_page: false,
                })
            } else {
                Ok(SuPage {
                    interactions: std::mem::take(&mut all),
                    has_next_page: false,
                })
            }
        }
    }

    struct NoopLoader;
    #[async_trait::async_trait]
    impl DataLoader for NoopLoader {
        async fn load(&self, _tx_id: &str) -> Result<LoadedData, CuError> {
            Ok(LoadedData { data: String::new() })
        }
    }

    struct NoopResolver;
    #[async_trait::async_trait]
    impl AssignmentResolver for NoopResolver {
        async fn resolve(&self, tx_id: &str) -> Result<AssignmentOverlay, CuError> {
            Ok(AssignmentOverlay {
                id: tx_id.to_string(),
                owner: "owner".to_string(),
                from: "owner".to_string(),
                tags: vec![],
                anchor: None,
                data: None,
            })
        }
    }

    struct EmptyGateway;
    #[async_trait::async_trait]
    impl GatewayClient for EmptyGateway {
        async fn find_checkpoints(
            &self,
            _owner: &str,
            _process_id: &str,
            _nonce: Option<u64>,
            _timestamp: Option<u64>,
            _cron: Option<&str>,
            _limit: usize,
        ) -> Result<Vec<CheckpointRecord>, CuError> {
            Ok(vec![])
        }
        async fn download(&self, _tx_id: &str) -> Result<Vec<u8>, CuError> {
            Ok(vec![])
        }
        async fn upload(&self, _item: &SignedDataItem) -> Result<String, CuError> {
            Ok("tx-checkpoint".to_string())
        }
    }

    struct FakeSigner;
    impl Signer for FakeSigner {
        fn owner_address(&self) -> &str {
            "owner-1"
        }
        fn sign(&self, item: CheckpointDataItem) -> Result<SignedDataItem, CuError> {
            Ok(SignedDataItem {
                tags: item.tags,
                data: item.data,
                owner: "owner-1".to_string(),
            })
        }
    }

    fn interaction(height: u64) -> SuInteraction {
        SuInteraction {
            sort_key: format!("{height},{},k{height}", height * 1000),
            block_height: height,
            block_timestamp: height * 1000,
            tags: vec![],
            message_id: Some(format!("msg-{height}")),
            owner: "owner-1".to_string(),
            target: "proc-1".to_string(),
            anchor: None,
            data: None,
            is_cron: false,
        }
    }

    #[tokio::test]
    async fn folds_messages_cold_start_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RocksDbBackend::open(dir.path()).unwrap();
        let result_store = ResultStore::new(backend);

        let source_client = OnePageClient {
            interactions: StdMutex::new(vec![interaction(1), interaction(2)]),
        };
        let wasm = EchoWasm;
        let loader = NoopLoader;
        let resolver = NoopResolver;
        let hydration_config = HydrationConfig { load_max_block: None };
        let hydration_deps = HydrationDeps {
            data_loader: &loader,
            assignment_resolver: &resolver,
        };
        let gateway = EmptyGateway;
        let signer = FakeSigner;
        let policy = DefaultCheckpointPolicy;

        let deps = EvaluatorDeps {
            result_store: &result_store,
            source_client: &source_client,
            hydration_config: &hydration_config,
            wasm: &wasm,
            checkpoint: CheckpointDeps {
                gateway: &gateway,
                signer: &signer,
                policy: &policy,
                module_id: "module-1",
            },
            checkpoint_every: None,
        };

        let cache = Mutex::new(ProcessMemoryCache::new(
            1_000_000,
            Duration::from_secs(60),
            |_: &str, _: &CacheKey| {},
        ));
        let recorder = EvictionRecorder::new();

        let outcome = evaluate(
            EvaluateRequest {
                process_id: "proc-1",
                to: "100",
            },
            &deps,
            &hydration_deps,
            &cache,
            &recorder,
        )
        .await
        .unwrap();

        assert_eq!(outcome.evaluated_count, 2);
        assert_eq!(outcome.memory, Some(vec![1, 1]));
        assert_eq!(
            result_store
                .find_evaluations("proc-1", None, None)
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn dedup_by_sort_key_skips_already_recorded_message() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RocksDbBackend::open(dir.path()).unwrap();
        let result_store = ResultStore::new(backend);

        let pre_existing = Evaluation {
            sort_key: sort_key::canonicalize(&interaction(1).sort_key),
            process_id: "proc-1".to_string(),
            message_id: Some("msg-1".to_string()),
            timestamp: 1000,
            is_cron: false,
            epoch: None,
            nonce: None,
            evaluated_at: 1,
            output: Output::default(),
            deep_hash: None,
        };
        result_store.save_evaluation(&pre_existing).unwrap();

        let source_client = OnePageClient {
            interactions: StdMutex::new(vec![interaction(1)]),
        };
        let wasm = EchoWasm;
        let loader = NoopLoader;
        let resolver = NoopResolver;
        let hydration_config = HydrationConfig { load_max_block: None };
        let hydration_deps = HydrationDeps {
            data_loader: &loader,
            assignment_resolver: &resolver,
        };
        let gateway = EmptyGateway;
        let signer = FakeSigner;
        let policy = DefaultCheckpointPolicy;

        let deps = EvaluatorDeps {
            result_store: &result_store,
            source_client: &source_client,
            hydration_config: &hydration_config,
            wasm: &wasm,
            checkpoint: CheckpointDeps {
                gateway: &gateway,
                signer: &signer,
                policy: &policy,
                module_id: "module-1",
            },
            checkpoint_every: None,
        };

        let cache = Mutex::new(ProcessMemoryCache::new(
            1_000_000,
            Duration::from_secs(60),
            |_: &str, _: &CacheKey| {},
        ));
        let recorder = EvictionRecorder::new();

        let outcome = evaluate(
            EvaluateRequest {
                process_id: "proc-1",
                to: "100",
            },
            &deps,
            &hydration_deps,
            &cache,
            &recorder,
        )
        .await
        .unwrap();

        assert_eq!(outcome.evaluated_count, 0);
    }
}
