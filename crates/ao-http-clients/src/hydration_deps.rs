//! Gateway-backed implementations of the hydration pipeline's two data
//! fetches: the legacy `Load` tag transform and assignment overlay
//! resolution (spec.md §6).

use crate::HttpEndpoint;
use ao_types::CuError;
use hydration::{AssignmentOverlay, AssignmentResolver, DataLoader, LoadedData};
use serde::Deserialize;
use url::Url;

pub struct HttpDataLoader {
    endpoint: HttpEndpoint,
}

impl HttpDataLoader {
    pub fn new(gateway_base_url: Url) -> Self {
        HttpDataLoader {
            endpoint: HttpEndpoint::new(gateway_base_url),
        }
    }
}

#[async_trait::async_trait]
impl DataLoader for HttpDataLoader {
    async fn load(&self, tx_id: &str) -> Result<LoadedData, CuError> {
        let bytes = self.endpoint.get_bytes(&format!("/raw/{tx_id}")).await?;
        Ok(LoadedData {
            data: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

pub struct HttpAssignmentResolver {
    endpoint: HttpEndpoint,
}

impl HttpAssignmentResolver {
    pub fn new(sequencer_base_url: Url) -> Self {
        HttpAssignmentResolver {
            endpoint: HttpEndpoint::new(sequencer_base_url),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireAssignment {
    id: String,
    owner: String,
    from: String,
    #[serde(default)]
    tags: Vec<ao_types::Tag>,
    anchor: Option<String>,
    data: Option<String>,
}

#[async_trait::async_trait]
impl AssignmentResolver for HttpAssignmentResolver {
    async fn resolve(&self, tx_id: &str) -> Result<AssignmentOverlay, CuError> {
        let wire: WireAssignment = self.endpoint.get_json(&format!("/tx/{tx_id}"), &[]).await?;
        Ok(AssignmentOverlay {
            id: wire.id,
            owner: wire.owner,
            from: wire.from,
            tags: wire.tags,
            anchor: wire.anchor,
            data: wire.data,
        })
    }
}
