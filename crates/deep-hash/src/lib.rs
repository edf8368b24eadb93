//! DeepHash / DataItem codec (spec.md §4.B).
//!
//! Computes a canonical digest over a data item's `(data, tags, target,
//! anchor)`, using a zero-owner signer convention since the actual
//! bundle/signing library is an external collaborator this workspace
//! never calls. The digest is the dedup key for forwarded messages, not a
//! wire-compatible Arweave ANS-104 signature input, so SHA-256 stands in
//! for the SHA-384 a real bundle library would use.

use ao_types::{CuError, Tag};
use sha2::{Digest, Sha256};

/// The owner field's length under the convention used when hashing a
/// data item whose real signer is unknown (e.g. dry-run dedup hashing
/// before a message has been signed).
const ZERO_OWNER_LEN: usize = 512;

/// A data item as seen by the hasher: just the fields the digest is over.
#[derive(Debug, Clone)]
pub struct DataItem<'a> {
    pub target: &'a str,
    pub anchor: &'a str,
    pub tags: &'a [Tag],
    pub data: &'a [u8],
}

fn blob_hash(bytes: &[u8]) -> [u8; 32] {
    let mut tag_hasher = Sha256::new();
    tag_hasher.update(b"blob");
    tag_hasher.update(bytes.len().to_string().as_bytes());
    let tag_digest = tag_hasher.finalize();

    let mut content_hasher = Sha256::new();
    content_hasher.update(bytes);
    let content_digest = content_hasher.finalize();

    let mut combined = Sha256::new();
    combined.update(tag_digest);
    combined.update(content_digest);
    combined.finalize().into()
}

fn list_hash<'a>(items: impl Iterator<Item = &'a [u8]> + Clone) -> [u8; 32] {
    let mut acc_hasher = Sha256::new();
    acc_hasher.update(b"list");
    acc_hasher.update(items.clone().count().to_string().as_bytes());
    let mut acc: [u8; 32] = acc_hasher.finalize().into();

    for item in items {
        let item_digest = blob_hash(item);
        let mut next = Sha256::new();
        next.update(acc);
        next.update(item_digest);
        acc = next.finalize().into();
    }
    acc
}

/// Compute the base64 (standard alphabet, padded) deep hash of a data item.
/// Raises [`CuError::IllFormedMessage`] only if the item cannot be
/// canonicalized; the caller's policy (spec.md §7) is to fail the whole
/// batch rather than silently skip, since skipping would desynchronize
/// process state across CUs.
pub fn deep_hash(item: &DataItem) -> Result<String, CuError> {
    let owner_blob = vec![0u8; ZERO_OWNER_LEN];

    let tag_blobs: Vec<Vec<u8>> = item
        .tags
        .iter()
        .map(|t| {
            let mut buf = Vec::with_capacity(t.name.len() + t.value.len() + 1);
            buf.extend_from_slice(t.name.as_bytes());
            buf.push(0);
            buf.extend_from_slice(t.value.as_bytes());
            buf
        })
        .collect();
    let tags_digest = list_hash(tag_blobs.iter().map(|b| b.as_slice()));

    let components: Vec<&[u8]> = vec![
        owner_blob.as_slice(),
        item.target.as_bytes(),
        item.anchor.as_bytes(),
        &tags_digest,
        item.data,
    ];

    let digest = list_hash(components.into_iter());
    Ok(base64::encode(digest))
}
