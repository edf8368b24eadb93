//! The Sequencer Unit's `interactions-sort-key` paging endpoint and its
//! message-submission endpoint (spec.md §6).

use crate::HttpEndpoint;
use ao_types::{CuError, Tag};
use message_source::{SequencerClient, SuInteraction, SuPage};
use mu_cranker::{SignedDataItem, SuClient};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Clone)]
pub struct HttpSequencerClient {
    endpoint: HttpEndpoint,
}

impl HttpSequencerClient {
    pub fn new(base_url: Url) -> Self {
        HttpSequencerClient {
            endpoint: HttpEndpoint::new(base_url),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WirePage {
    interactions: Vec<WireInteraction>,
    #[serde(rename = "hasNextPage")]
    has_next_page: bool,
}

#[derive(Debug, Deserialize)]
struct WireInteraction {
    #[serde(rename = "sortKey")]
    sort_key: String,
    #[serde(rename = "blockHeight")]
    block_height: u64,
    #[serde(rename = "blockTimestamp")]
    block_timestamp: u64,
    #[serde(default)]
    tags: Vec<Tag>,
    #[serde(rename = "messageId")]
    message_id: Option<String>,
    owner: String,
    target: String,
    anchor: Option<String>,
    data: Option<String>,
    #[serde(rename = "isCron", default)]
    is_cron: bool,
}

impl From<WireInteraction> for SuInteraction {
    fn from(w: WireInteraction) -> Self {
        SuInteraction {
            sort_key: w.sort_key,
            block_height: w.block_height,
            block_timestamp: w.block_timestamp,
            tags: w.tags,
            message_id: w.message_id,
            owner: w.owner,
            target: w.target,
            anchor: w.anchor,
            data: w.data,
            is_cron: w.is_cron,
        }
    }
}

#[async_trait::async_trait]
impl SequencerClient for HttpSequencerClient {
    async fn fetch_page(
        &self,
        process_id: &str,
        from: &str,
        to: &str,
        cursor: Option<String>,
    ) -> Result<SuPage, CuError> {
        let mut query = vec![("process-id", process_id), ("from", from), ("to", to)];
        if let Some(cursor) = cursor.as_deref() {
            query.push(("from-sort-key", cursor));
        }
        let page: WirePage = self.endpoint.get_json("/interactions-sort-key", &query).await?;
        Ok(SuPage {
            interactions: page.interactions.into_iter().map(SuInteraction::from).collect(),
            has_next_page: page.has_next_page,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct WireSignedDataItem<'a> {
    target: &'a str,
    tags: &'a [Tag],
    owner: &'a str,
    data: String,
}

#[derive(Debug, Deserialize)]
struct WireSubmitResponse {
    #[serde(rename = "id")]
    id: String,
}

/// The SU's message-submission endpoint, reached from the MU cranker.
pub struct HttpSuClient {
    endpoint: HttpEndpoint,
}

impl HttpSuClient {
    pub fn new(base_url: Url) -> Self {
        HttpSuClient {
            endpoint: HttpEndpoint::new(base_url),
        }
    }
}

#[async_trait::async_trait]
impl SuClient for HttpSuClient {
    async fn submit(&self, item: &SignedDataItem) -> Result<String, CuError> {
        let wire = WireSignedDataItem {
            target: &item.target,
            tags: &item.tags,
            owner: &item.owner,
            data: base64::encode(&item.data),
        };
        let response: WireSubmitResponse = self.endpoint.post_json("/", &wire).await?;
        tracing::debug!(tx_id = %response.id, target = %item.target, "submitted data item to SU");
        Ok(response.id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_page_decodes_into_su_page() {
        let body = r#"{
            "interactions": [{
                "sortKey": "1,1000,a",
                "blockHeight": 1,
                "blockTimestamp": 1000,
                "tags": [{"name": "Foo", "value": "Bar"}],
                "messageId": "msg-1",
                "owner": "owner-1",
                "target": "proc-1",
                "anchor": null,
                "data": null,
                "isCron": false
            }],
            "hasNextPage": true
        }"#;
        let page: WirePage = serde_json::from_str(body).unwrap();
        assert!(page.has_next_page);
        let interaction: SuInteraction = page.interactions.into_iter().next().unwrap().into();
        assert_eq!(interaction.sort_key, "1,1000,a");
        assert_eq!(interaction.block_height, 1);
        assert_eq!(interaction.tags.len(), 1);
    }
}
