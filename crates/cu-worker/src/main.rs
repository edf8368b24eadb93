//! The CU process: wires the evaluation pipeline (spec.md §4.A-H) behind
//! a thin HTTP router exposing the endpoints the MU consumes (spec.md
//! §6). The router itself stays deliberately minimal — routing and
//! request decoding only, no business logic — since a production
//! deployment's request router is an external collaborator (spec.md §1);
//! everything past that boundary calls straight into the library crates.

use ao_http_clients::{
    ExternalSigner, HttpAssignmentResolver, HttpDataLoader, HttpGatewayClient, HttpSequencerClient, HttpWasmProcess,
};
use ao_cli_common::{init_logging, CuConfig, OrBail};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use checkpoint_store::DefaultCheckpointPolicy;
use clap::Parser;
use evaluator::{CheckpointDeps, EvaluateRequest, EvaluatorDeps, EvictionRecorder};
use memory_cache::{CacheKey, OnEviction, ProcessMemoryCache};
use result_store::{ResultStore, RocksDbBackend};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Forwards cache evictions to a shared [`EvictionRecorder`] the request
/// handler can drain after folding, without the cache owning it outright.
struct SharedEvictionRecorder(Arc<EvictionRecorder>);

impl OnEviction for SharedEvictionRecorder {
    fn on_eviction(&self, process_id: &str, key: &CacheKey) {
        self.0.on_eviction(process_id, key);
    }
}

struct AppState {
    result_store: ResultStore<RocksDbBackend>,
    cache: Mutex<ProcessMemoryCache<SharedEvictionRecorder>>,
    eviction_recorder: Arc<EvictionRecorder>,
    source_client: HttpSequencerClient,
    hydration_config: hydration::HydrationConfig,
    data_loader: HttpDataLoader,
    assignment_resolver: HttpAssignmentResolver,
    wasm: HttpWasmProcess,
    gateway: HttpGatewayClient,
    signer: ExternalSigner,
    policy: DefaultCheckpointPolicy,
    module_id: String,
    checkpoint_every: Option<u64>,
}

struct ApiError(ao_types::CuError);

impl From<ao_types::CuError> for ApiError {
    fn from(e: ao_types::CuError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use ao_types::CuError::*;
        let status = match &self.0 {
            IllFormedMessage(_) => StatusCode::BAD_REQUEST,
            NotFound(_) => StatusCode::NOT_FOUND,
            Conflict(_) => StatusCode::CONFLICT,
            Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Deterministic(_) => StatusCode::OK,
            Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::warn!(error = %self.0, "request failed");
        (status, self.0.to_string()).into_response()
    }
}

#[derive(serde::Serialize)]
struct ResultResponse {
    messages: Vec<ao_types::MessageBody>,
    spawns: Vec<ao_types::MessageBody>,
    output: serde_json::Value,
}

/// `message_id` is a transaction/message id, not a SortKey (spec.md
/// §6's `GET {CU_URL}/result/{txId}`) — there is no collaborator in this
/// workspace that resolves one to the other, so it can never be handed
/// to `evaluator::evaluate` as a cutoff. Instead: serve directly from an
/// already-persisted evaluation if one exists; otherwise fold forward
/// through everything currently available from the SU (so the message,
/// if it has landed, gets recorded) and check again. Still missing after
/// that means the message hasn't been assigned a sortKey yet, which
/// spec.md §6 documents as returning the empty structure.
async fn get_result(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<ResultResponse>, ApiError> {
    let process_id = query
        .get("process-id")
        .cloned()
        .ok_or_else(|| ao_types::CuError::ill_formed("missing process-id query parameter"))?;

    if let Some(found) = state.result_store.find_by_message_id(&process_id, &message_id)? {
        return Ok(Json(ResultResponse {
            messages: found.output.messages,
            spawns: found.output.spawns,
            output: found.output.output,
        }));
    }

    let deps = EvaluatorDeps {
        result_store: &state.result_store,
        source_client: &state.source_client,
        hydration_config: &state.hydration_config,
        wasm: &state.wasm,
        checkpoint: CheckpointDeps {
            gateway: &state.gateway,
            signer: &state.signer,
            policy: &state.policy,
            module_id: &state.module_id,
        },
        checkpoint_every: state.checkpoint_every,
    };
    let hydration_deps = hydration::HydrationDeps {
        data_loader: &state.data_loader,
        assignment_resolver: &state.assignment_resolver,
    };

    let max_bound = ao_types::sort_key::max_bound();
    evaluator::evaluate(
        EvaluateRequest {
            process_id: &process_id,
            to: &max_bound,
        },
        &deps,
        &hydration_deps,
        &state.cache,
        &state.eviction_recorder,
    )
    .await?;

    match state.result_store.find_by_message_id(&process_id, &message_id)? {
        Some(found) => Ok(Json(ResultResponse {
            messages: found.output.messages,
            spawns: found.output.spawns,
            output: found.output.output,
        })),
        None => {
            tracing::debug!(%message_id, %process_id, "result requested for a message not yet assigned a sortKey");
            Ok(Json(ResultResponse {
                messages: vec![],
                spawns: vec![],
                output: serde_json::Value::Null,
            }))
        }
    }
}

#[derive(serde::Serialize)]
struct WireScheduled {
    #[serde(rename = "sortKey")]
    sort_key: String,
    message: ao_types::MessageBody,
}

/// Surfaces already-persisted cron evaluations as scheduled messages for
/// the MU monitor loop to crank. The original input `MessageBody` isn't
/// part of the persisted `Evaluation` record (spec.md §6's layout keeps
/// only the fold's output), so this reconstructs a minimal stand-in
/// carrying enough to address the crank — a real deployment's router
/// would have the original message at hand.
async fn get_scheduled(
    State(state): State<Arc<AppState>>,
    Path(process_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Vec<WireScheduled>>, ApiError> {
    let from = query.get("from").map(|s| s.as_str());
    let evaluations = state.result_store.find_evaluations(&process_id, from, None)?;

    let scheduled = evaluations
        .into_iter()
        .filter(|e| e.is_cron)
        .map(|e| WireScheduled {
            sort_key: e.sort_key.clone(),
            message: ao_types::MessageBody {
                id: e.message_id,
                data: None,
                owner: state.module_id.clone(),
                target: process_id.clone(),
                anchor: None,
                from: state.module_id.clone(),
                forwarded_by: None,
                forwarded_for: None,
                tags: vec![],
            },
        })
        .collect();

    Ok(Json(scheduled))
}

#[tokio::main]
async fn main() {
    let config = CuConfig::parse();
    init_logging(&config.log);

    let backend = RocksDbBackend::open(&config.db_path).or_bail("failed to open result store");
    let result_store = ResultStore::new(backend);

    let eviction_recorder = Arc::new(EvictionRecorder::new());
    let cache = Mutex::new(ProcessMemoryCache::new(
        config.process_memory_cache_max_size,
        Duration::from_millis(config.process_memory_cache_ttl_ms),
        SharedEvictionRecorder(eviction_recorder.clone()),
    ));

    let state = Arc::new(AppState {
        result_store,
        cache,
        eviction_recorder,
        source_client: HttpSequencerClient::new(config.sequencer_url.clone()),
        hydration_config: hydration::HydrationConfig {
            load_max_block: config.ao_load_max_block,
        },
        data_loader: HttpDataLoader::new(config.gateway_url.clone()),
        assignment_resolver: HttpAssignmentResolver::new(config.sequencer_url.clone()),
        wasm: HttpWasmProcess::new(config.wasm_url.clone()),
        gateway: HttpGatewayClient::new(config.gateway_url.clone()),
        signer: ExternalSigner::new(config.module_owner.clone()),
        policy: DefaultCheckpointPolicy,
        module_id: config.module_id.clone(),
        checkpoint_every: config.checkpoint_every,
    });

    let app = Router::new()
        .route("/result/:message_id", get(get_result))
        .route("/scheduled/:process_id", get(get_scheduled))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, mode = ?config.mode, "cu-worker listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("received shutdown signal");
        })
        .await
        .or_bail("server exited with error");
}
