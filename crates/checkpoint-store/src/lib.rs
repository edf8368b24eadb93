//! Checkpoint Store (spec.md §4.D): publish/discover process memory
//! snapshots on Arweave.
//!
//! The gateway transport, the signing/bundling library, and the discipline
//! for deciding *what* anchor to set are all external collaborators or
//! policy hooks; this crate owns only the publish/discover algorithms.

use ao_types::{sort_key, CuError};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

/// A signed data item ready for upload, carrying the exact tag set
/// required by spec.md's "Checkpoint data item tags (bit-exact)".
#[derive(Debug, Clone)]
pub struct CheckpointDataItem {
    pub tags: Vec<ao_types::Tag>,
    pub data: Vec<u8>,
}

/// Signs a checkpoint data item. The real implementation lives in the
/// third-party bundle/signing library (out of scope per spec.md §1); this
/// trait is the seam this crate calls through.
pub trait Signer: Send + Sync {
    fn owner_address(&self) -> &str;
    fn sign(&self, item: CheckpointDataItem) -> Result<SignedDataItem, CuError>;
}

#[derive(Debug, Clone)]
pub struct SignedDataItem {
    pub tags: Vec<ao_types::Tag>,
    pub data: Vec<u8>,
    pub owner: String,
}

/// A Checkpoint as returned by a gateway GraphQL query, before its data
/// has been downloaded.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub tx_id: String,
    pub block_height: u64,
    pub timestamp: u64,
    pub nonce: Option<u64>,
    pub cron_interval: Option<String>,
    pub content_encoding: Option<String>,
}

/// The Arweave gateway and transaction-upload endpoint, treated as an
/// external collaborator reached over GraphQL/HTTP (spec.md §6).
#[async_trait::async_trait]
pub trait GatewayClient: Send + Sync {
    async fn find_checkpoints(
        &self,
        owner: &str,
        process_id: &str,
        nonce: Option<u64>,
        timestamp: Option<u64>,
        cron: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CheckpointRecord>, CuError>;

    async fn download(&self, tx_id: &str) -> Result<Vec<u8>, CuError>;

    async fn upload(&self, item: &SignedDataItem) -> Result<String, CuError>;
}

/// Bounded fan-out for "most-recent Checkpoints" queries (spec.md §4.D).
const DISCOVER_FAN_OUT: usize = 50;

#[derive(Debug, Clone)]
pub struct DiscoveredMemory {
    pub memory: Vec<u8>,
    pub timestamp: u64,
    pub block_height: u64,
    pub nonce: Option<u64>,
    pub cron: Option<String>,
}

/// Decide the `anchor` tag value to set on a published checkpoint data
/// item. spec.md §9 Open Question (c) is resolved as the empty string;
/// exposed as a hook so a caller can override without touching
/// [`publish`].
pub trait CheckpointPolicy: Send + Sync {
    fn anchor(&self) -> String {
        String::new()
    }
}

pub struct DefaultCheckpointPolicy;
impl CheckpointPolicy for DefaultCheckpointPolicy {}

pub struct PublishRequest<'a> {
    pub process_id: &'a str,
    pub module_id: &'a str,
    pub epoch: Option<u64>,
    pub nonce: Option<u64>,
    pub timestamp: u64,
    pub block_height: u64,
    pub cron_interval: Option<&'a str>,
    /// Already-gzip-compressed memory.
    pub gzipped_memory: &'a [u8],
}

/// Publish a Checkpoint for `req`, unless one matching
/// `(owner, processId, nonce, timestamp, cron)` already exists, in which
/// case this is a no-op (idempotence). Failures are logged and non-fatal
/// per spec.md §4.D; callers that want hard failure should inspect the
/// returned `Err` themselves — this function surfaces it rather than
/// swallowing it, since "non-fatal" is a policy for the *caller's retry
/// loop*, not for this function's return type.
pub async fn publish(
    gateway: &dyn GatewayClient,
    signer: &dyn Signer,
    policy: &dyn CheckpointPolicy,
    req: PublishRequest<'_>,
) -> Result<Option<String>, CuError> {
    let existing = gateway
        .find_checkpoints(
            signer.owner_address(),
            req.process_id,
            req.nonce,
            Some(req.timestamp),
            req.cron_interval,
            1,
        )
        .await?;
    if let Some(found) = existing.into_iter().next() {
        tracing::debug!(tx_id = %found.tx_id, "checkpoint already published, skipping");
        return Ok(None);
    }

    let mut sha = Sha256::new();
    let mut decoder = flate2::read::GzDecoder::new(req.gzipped_memory);
    let mut uncompressed = Vec::new();
    decoder
        .read_to_end(&mut uncompressed)
        .map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?;
    sha.update(&uncompressed);
    let sha_256 = base64::encode(sha.finalize());

    let mut tags = vec![
        ao_types::Tag::new("Data-Protocol", "ao"),
        ao_types::Tag::new("Variant", "ao.TN.1"),
        ao_types::Tag::new("Type", "Checkpoint"),
        ao_types::Tag::new("Module", req.module_id),
        ao_types::Tag::new("Process", req.process_id),
        ao_types::Tag::new("Timestamp", req.timestamp.to_string()),
        ao_types::Tag::new("Block-Height", req.block_height.to_string()),
        ao_types::Tag::new("Content-Type", "application/octet-stream"),
        ao_types::Tag::new("SHA-256", sha_256),
        ao_types::Tag::new("Content-Encoding", "gzip"),
    ];
    if let Some(epoch) = req.epoch {
        tags.push(ao_types::Tag::new("Epoch", epoch.to_string()));
    }
    if let Some(nonce) = req.nonce {
        tags.push(ao_types::Tag::new("Nonce", nonce.to_string()));
    }
    if let Some(cron) = req.cron_interval {
        tags.push(ao_types::Tag::new("Cron-Interval", cron));
    }
    tags.push(ao_types::Tag::new("Anchor", policy.anchor()));

    let item = CheckpointDataItem {
        tags,
        data: req.gzipped_memory.to_vec(),
    };
    let signed = signer.sign(item)?;
    let tx_id = gateway.upload(&signed).await?;
    Ok(Some(tx_id))
}

/// Discover the most-recent Checkpoint for `process_id` that is not
/// later-than `(timestamp, cron)`, downloading and decoding it. Returns
/// `None` ("cold start") if no matching checkpoint exists or its bytes
/// cannot be fetched.
pub async fn discover(
    gateway: &dyn GatewayClient,
    owner: &str,
    process_id: &str,
    timestamp: u64,
    cron: Option<&str>,
) -> Result<Option<DiscoveredMemory>, CuError> {
    let candidates = match gateway
        .find_checkpoints(owner, process_id, None, None, None, DISCOVER_FAN_OUT)
        .await
    {
        Ok(c) => c,
        Err(CuError::Transient(_)) | Err(CuError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e),
    };

    let best = candidates
        .into_iter()
        .filter(|c| !sort_key::is_later_than(c.timestamp, c.cron_interval.as_deref(), timestamp, cron))
        .max_by_key(|c| c.block_height);

    let Some(best) = best else {
        return Ok(None);
    };

    let bytes = match gateway.download(&best.tx_id).await {
        Ok(b) => b,
        Err(CuError::Transient(_)) | Err(CuError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e),
    };

    let memory = if best.content_encoding.as_deref() == Some("gzip") {
        let mut decoder = flate2::read::GzDecoder::new(bytes.as_slice());
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?;
        out
    } else {
        bytes
    };

    Ok(Some(DiscoveredMemory {
        memory,
        timestamp: best.timestamp,
        block_height: best.block_height,
        nonce: best.nonce,
        cron: best.cron_interval,
    }))
}

/// Gzip-compress `memory`, for callers preparing a [`PublishRequest`].
pub fn compress(memory: &[u8]) -> Result<Vec<u8>, CuError> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(memory)
        .map_err(|e| CuError::fatal(anyhow::anyhow!(e)))?;
    encoder.finish().map_err(|e| CuError::fatal(anyhow::anyhow!(e)))
}
