//! HTTP-backed adapters for the external collaborators the rest of this
//! workspace folds through (spec.md §1, §6): the Sequencer Unit, the
//! Arweave gateway/upload endpoint, and CU-to-CU evaluation fetches.
//! Built the same way `flow-client::Client` wraps `reqwest` behind a
//! typed unary-request helper.

mod cu;
mod gateway;
mod hydration_deps;
mod misc;
mod scheduled;
mod signer;
mod su;
mod wasm;

pub use cu::HttpCuClient;
pub use gateway::HttpGatewayClient;
pub use hydration_deps::{HttpAssignmentResolver, HttpDataLoader};
pub use misc::{ConfigNodeSelector, UuidBatchIdGenerator};
pub use scheduled::{HttpScheduledFetcher, RocksDbScheduledBatchWriter};
pub use signer::ExternalSigner;
pub use su::{HttpSequencerClient, HttpSuClient};
pub use wasm::HttpWasmProcess;

use ao_types::CuError;
use serde::{de::DeserializeOwned, Serialize};
use url::Url;

/// Thin wrapper around `reqwest::Client` plus a base URL, with the
/// unary JSON request/response helper every adapter in this crate calls
/// through.
#[derive(Clone)]
pub struct HttpEndpoint {
    base_url: Url,
    http: reqwest::Client,
}

impl HttpEndpoint {
    pub fn new(base_url: Url) -> Self {
        HttpEndpoint {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    /// Build an endpoint against `base_url` reusing an already-built
    /// `reqwest::Client` (and its connection pool), for callers that
    /// address many base URLs over the lifetime of one process.
    pub fn with_client(base_url: Url, http: reqwest::Client) -> Self {
        HttpEndpoint { base_url, http }
    }

    pub async fn get_json<Response>(&self, path: &str, query: &[(&str, &str)]) -> Result<Response, CuError>
    where
        Response: DeserializeOwned,
    {
        let mut url = self.join(path)?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        let response = self.http.get(url).send().await.map_err(to_cu_error)?;
        decode(response).await
    }

    pub async fn post_json<Request, Response>(&self, path: &str, body: &Request) -> Result<Response, CuError>
    where
        Request: Serialize,
        Response: DeserializeOwned,
    {
        let url = self.join(path)?;
        let response = self.http.post(url).json(body).send().await.map_err(to_cu_error)?;
        decode(response).await
    }

    pub async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, CuError> {
        let url = self.join(path)?;
        let response = self.http.get(url).send().await.map_err(to_cu_error)?;
        let status = response.status();
        if status.is_success() {
            response.bytes().await.map(|b| b.to_vec()).map_err(to_cu_error)
        } else {
            Err(status_to_cu_error(status, response.text().await.unwrap_or_default()))
        }
    }

    fn join(&self, path: &str) -> Result<Url, CuError> {
        self.base_url.join(path).map_err(|e| CuError::fatal(anyhow::anyhow!(e)))
    }
}

async fn decode<Response: DeserializeOwned>(response: reqwest::Response) -> Result<Response, CuError> {
    let status = response.status();
    if status.is_success() {
        response.json().await.map_err(to_cu_error)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(status_to_cu_error(status, body))
    }
}

fn status_to_cu_error(status: reqwest::StatusCode, body: String) -> CuError {
    if status == reqwest::StatusCode::NOT_FOUND {
        CuError::NotFound(format!("{status}: {body}"))
    } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        CuError::transient(anyhow::anyhow!("{status}: {body}"))
    } else {
        CuError::fatal(anyhow::anyhow!("{status}: {body}"))
    }
}

fn to_cu_error(e: reqwest::Error) -> CuError {
    if e.is_timeout() || e.is_connect() {
        CuError::transient(anyhow::anyhow!(e))
    } else {
        CuError::fatal(anyhow::anyhow!(e))
    }
}
