//! Delegates WASM execution to an external loader process reached over
//! HTTP. The loader itself — the WASM runtime — is out of scope for this
//! workspace (spec.md §1); this is the seam a deployment wires a real
//! `ao-loader`-style process in behind.

use crate::HttpEndpoint;
use ao_types::{AoGlobal, CuError, Message, Output};
use evaluator::WasmProcess;
use serde::Serialize;
use url::Url;

pub struct HttpWasmProcess {
    endpoint: HttpEndpoint,
}

impl HttpWasmProcess {
    pub fn new(base_url: Url) -> Self {
        HttpWasmProcess {
            endpoint: HttpEndpoint::new(base_url),
        }
    }
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    memory: Option<String>,
    message: &'a Message,
    #[serde(rename = "AoGlobal")]
    ao_global: &'a AoGlobal,
}

#[async_trait::async_trait]
impl WasmProcess for HttpWasmProcess {
    async fn evaluate(&self, memory: Option<&[u8]>, message: &Message, ao_global: &AoGlobal) -> Result<Output, CuError> {
        let request = WireRequest {
            memory: memory.map(|m| base64::encode(m)),
            message,
            ao_global,
        };
        self.endpoint.post_json("/evaluate", &request).await
    }
}
