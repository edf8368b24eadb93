//! Fetches the evaluation a just-submitted message triggered, from
//! whichever CU node [`mu_cranker::NodeSelector`] picked (spec.md §6's
//! `/result/{messageId}` endpoint).

use crate::HttpEndpoint;
use ao_types::{CuError, MessageBody};
use mu_cranker::{CrankEvaluationResult, CuClient};
use serde::Deserialize;
use url::Url;

/// CU nodes are addressed dynamically by [`mu_cranker::NodeSelector`], so
/// this client holds a shared `reqwest::Client` (and its connection
/// pool) rather than being bound to a single base URL at construction
/// time, building an [`HttpEndpoint`] per call against whichever node
/// address was selected.
pub struct HttpCuClient {
    http: reqwest::Client,
}

impl HttpCuClient {
    pub fn new() -> Self {
        HttpCuClient {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpCuClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct WireResult {
    #[serde(default)]
    messages: Vec<MessageBody>,
    #[serde(default)]
    spawns: Vec<MessageBody>,
}

#[async_trait::async_trait]
impl CuClient for HttpCuClient {
    async fn fetch_evaluation(&self, node: &str, process_id: &str, message_id: &str) -> Result<CrankEvaluationResult, CuError> {
        let base_url = Url::parse(node).map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?;
        let endpoint = HttpEndpoint::with_client(base_url, self.http.clone());
        let path = format!("/result/{message_id}");
        let result: WireResult = endpoint.get_json(&path, &[("process-id", process_id)]).await?;
        Ok(CrankEvaluationResult {
            outbound_messages: result.messages,
            spawns: result.spawns,
        })
    }
}
