//! The Arweave gateway's GraphQL checkpoint query, transaction download,
//! and data-item upload endpoints (spec.md §6), behind
//! [`checkpoint_store::GatewayClient`].

use crate::HttpEndpoint;
use ao_types::CuError;
use checkpoint_store::{CheckpointRecord, GatewayClient, SignedDataItem};
use serde::{Deserialize, Serialize};
use url::Url;

pub struct HttpGatewayClient {
    endpoint: HttpEndpoint,
}

impl HttpGatewayClient {
    pub fn new(base_url: Url) -> Self {
        HttpGatewayClient {
            endpoint: HttpEndpoint::new(base_url),
        }
    }
}

#[derive(Debug, Serialize)]
struct GraphQlQuery<'a> {
    query: &'a str,
    variables: GraphQlVariables<'a>,
}

#[derive(Debug, Serialize)]
struct GraphQlVariables<'a> {
    owner: &'a str,
    #[serde(rename = "processId")]
    process_id: &'a str,
    nonce: Option<u64>,
    timestamp: Option<u64>,
    cron: Option<&'a str>,
    limit: usize,
}

const CHECKPOINT_QUERY: &str = r#"
query FindCheckpoints($owner: String!, $processId: String!, $nonce: Int, $timestamp: Int, $cron: String, $limit: Int!) {
  transactions(owners: [$owner], tags: [
    { name: "Data-Protocol", values: ["ao"] },
    { name: "Type", values: ["Checkpoint"] },
    { name: "Process", values: [$processId] }
  ], first: $limit) {
    edges { node { id tags { name value } } }
  }
}
"#;

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: GraphQlData,
}

#[derive(Debug, Deserialize)]
struct GraphQlData {
    transactions: GraphQlTransactions,
}

#[derive(Debug, Deserialize)]
struct GraphQlTransactions {
    edges: Vec<GraphQlEdge>,
}

#[derive(Debug, Deserialize)]
struct GraphQlEdge {
    node: GraphQlNode,
}

#[derive(Debug, Deserialize)]
struct GraphQlNode {
    id: String,
    tags: Vec<ao_types::Tag>,
}

fn tag_u64(tags: &[ao_types::Tag], name: &str) -> Option<u64> {
    ao_types::tag_value(tags, name).and_then(|v| v.parse().ok())
}

impl TryFrom<GraphQlNode> for CheckpointRecord {
    type Error = CuError;

    fn try_from(node: GraphQlNode) -> Result<Self, CuError> {
        let block_height = tag_u64(&node.tags, "Block-Height")
            .ok_or_else(|| CuError::fatal(anyhow::anyhow!("checkpoint {} missing Block-Height tag", node.id)))?;
        let timestamp = tag_u64(&node.tags, "Timestamp")
            .ok_or_else(|| CuError::fatal(anyhow::anyhow!("checkpoint {} missing Timestamp tag", node.id)))?;
        Ok(CheckpointRecord {
            tx_id: node.id,
            block_height,
            timestamp,
            nonce: tag_u64(&node.tags, "Nonce"),
            cron_interval: ao_types::tag_value(&node.tags, "Cron-Interval").map(str::to_string),
            content_encoding: ao_types::tag_value(&node.tags, "Content-Encoding").map(str::to_string),
        })
    }
}

#[async_trait::async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn find_checkpoints(
        &self,
        owner: &str,
        process_id: &str,
        nonce: Option<u64>,
        timestamp: Option<u64>,
        cron: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CheckpointRecord>, CuError> {
        let query = GraphQlQuery {
            query: CHECKPOINT_QUERY,
            variables: GraphQlVariables {
                owner,
                process_id,
                nonce,
                timestamp,
                cron,
                limit,
            },
        };
        let response: GraphQlResponse = self.endpoint.post_json("/graphql", &query).await?;
        response
            .data
            .transactions
            .edges
            .into_iter()
            .map(|edge| CheckpointRecord::try_from(edge.node))
            .collect()
    }

    async fn download(&self, tx_id: &str) -> Result<Vec<u8>, CuError> {
        self.endpoint.get_bytes(&format!("/raw/{tx_id}")).await
    }

    async fn upload(&self, item: &SignedDataItem) -> Result<String, CuError> {
        #[derive(Serialize)]
        struct WireItem<'a> {
            tags: &'a [ao_types::Tag],
            owner: &'a str,
            data: String,
        }
        #[derive(Deserialize)]
        struct WireResponse {
            id: String,
        }
        let wire = WireItem {
            tags: &item.tags,
            owner: &item.owner,
            data: base64::encode(&item.data),
        };
        let response: WireResponse = self.endpoint.post_json("/tx", &wire).await?;
        Ok(response.id)
    }
}
