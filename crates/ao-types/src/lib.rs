//! Shared data model for the ao Compute Unit core and the Messenger Unit
//! cranker: processes, messages, evaluations, checkpoints and monitors,
//! plus the `CuError` kinds that every other crate in this workspace
//! propagates.

pub mod sort_key;

use serde::{Deserialize, Serialize};

/// Error kinds shared across the evaluation pipeline and the cranker.
///
/// Propagation policy (see the design doc for the full table):
/// `Transient`/`NotFound` degrade gracefully on checkpoint discovery,
/// `Conflict` on save is swallowed by the caller, `IllFormedMessage` halts
/// the current evaluation, `Deterministic` is recorded but does not halt
/// the chain, `Fatal` aborts the unit.
#[derive(Debug, thiserror::Error)]
pub enum CuError {
    #[error("ill-formed message: {0}")]
    IllFormedMessage(String),

    #[error("transient failure: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("deterministic evaluation error: {0}")]
    Deterministic(String),

    #[error("fatal error: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl CuError {
    pub fn ill_formed(msg: impl Into<String>) -> Self {
        CuError::IllFormedMessage(msg.into())
    }

    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        CuError::Transient(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        CuError::Fatal(err.into())
    }

    /// True for errors that a caller may retry without changing its input.
    pub fn is_retriable(&self) -> bool {
        matches!(self, CuError::Transient(_))
    }
}

/// A single `{name, value}` tag, as carried on processes, messages and
/// checkpoint data items. Tag names are not required to be unique; lookups
/// return the first match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Tag {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Look up the value of the first tag with the given name.
pub fn tag_value<'a>(tags: &'a [Tag], name: &str) -> Option<&'a str> {
    tags.iter().find(|t| t.name == name).map(|t| t.value.as_str())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub timestamp: u64,
}

/// An immutable process record, as recorded at spawn time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub id: String,
    pub owner: String,
    pub signature: Option<String>,
    pub data: Option<String>,
    pub anchor: Option<String>,
    pub tags: Vec<Tag>,
    pub block: Block,
}

/// The inner payload of a `Message`, i.e. the envelope that is (or would
/// be) DataItem-signed. `id` is absent for scheduled/cron messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBody {
    pub id: Option<String>,
    pub data: Option<String>,
    pub owner: String,
    pub target: String,
    pub anchor: Option<String>,
    pub from: String,
    #[serde(rename = "Forwarded-By", skip_serializing_if = "Option::is_none")]
    pub forwarded_by: Option<String>,
    #[serde(rename = "Forwarded-For", skip_serializing_if = "Option::is_none")]
    pub forwarded_for: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AoGlobal {
    pub process: Process,
    pub block: Block,
}

/// A single unit of input to the evaluator: a scheduled message, a cron
/// message, or an assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub sort_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deep_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_assignment: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_cron: Option<bool>,
    /// Cron messages carry neither a scheduling epoch nor nonce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    pub message: MessageBody,
    pub ao_global: AoGlobal,
}

impl Message {
    /// Messages are hashed only when forwarded (`Forwarded-For` present).
    pub fn needs_deep_hash(&self) -> bool {
        self.message.forwarded_by.is_some()
    }
}

/// The WASM process's output for a single folded message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Output {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<Vec<u8>>,
    #[serde(default)]
    pub messages: Vec<MessageBody>,
    #[serde(default)]
    pub spawns: Vec<MessageBody>,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<u64>,
}

/// A single persisted evaluation record. Primary key `(process_id,
/// sort_key)`; secondary index `(process_id, deep_hash)` when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub sort_key: String,
    pub process_id: String,
    pub message_id: Option<String>,
    pub timestamp: u64,
    pub is_cron: bool,
    pub epoch: Option<u64>,
    pub nonce: Option<u64>,
    pub evaluated_at: u64,
    pub output: Output,
    pub deep_hash: Option<String>,
}

/// An opaque WASM linear memory snapshot. Held compressed at rest; callers
/// that need to execute against it must decompress first.
#[derive(Debug, Clone)]
pub struct MemorySnapshot {
    pub bytes: Vec<u8>,
    pub encoding: Option<Encoding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gzip,
}

/// The Arweave-visible publication of a MemorySnapshot.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub process_id: String,
    pub module_id: String,
    pub epoch: Option<u64>,
    pub nonce: Option<u64>,
    pub timestamp: u64,
    pub block_height: u64,
    pub sha_256: String,
    pub cron_interval: Option<String>,
    pub content_encoding: Option<String>,
}

/// One monitor per process, tracked by the MU monitor loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: String,
    pub authorized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_from_sort_key: Option<String>,
    pub interval: u64,
    pub block: Block,
    pub created_at: u64,
}

/// Validate a `Message` against the schema boundary described in the
/// design notes: anchors/ids must be well-formed, and forwarded messages
/// must be dehydrated via `needs_deep_hash` before this check runs.
pub fn validate_message(msg: &Message) -> Result<(), CuError> {
    if msg.message.owner.is_empty() {
        return Err(CuError::ill_formed("message owner must not be empty"));
    }
    if msg.message.target.is_empty() {
        return Err(CuError::ill_formed("message target must not be empty"));
    }
    if let Some(anchor) = &msg.message.anchor {
        if anchor.len() > 32 {
            return Err(CuError::ill_formed(format!(
                "anchor exceeds 32 bytes: {} bytes",
                anchor.len()
            )));
        }
    }
    if msg.message.forwarded_for.is_some() && msg.deep_hash.is_none() {
        return Err(CuError::ill_formed(
            "forwarded message is missing its deepHash",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn base_message() -> Message {
        Message {
            sort_key: "000000000001,1,abc".to_string(),
            deep_hash: None,
            is_assignment: None,
            is_cron: None,
            epoch: None,
            nonce: None,
            message: MessageBody {
                id: Some("msg-1".to_string()),
                data: None,
                owner: "owner-1".to_string(),
                target: "proc-1".to_string(),
                anchor: None,
                from: "owner-1".to_string(),
                forwarded_by: None,
                forwarded_for: None,
                tags: vec![],
            },
            ao_global: AoGlobal {
                process: Process {
                    id: "proc-1".to_string(),
                    owner: "owner-1".to_string(),
                    signature: None,
                    data: None,
                    anchor: None,
                    tags: vec![],
                    block: Block {
                        height: 1,
                        timestamp: 1,
                    },
                },
                block: Block {
                    height: 1,
                    timestamp: 1,
                },
            },
        }
    }

    #[test]
    fn rejects_empty_owner() {
        let mut msg = base_message();
        msg.message.owner.clear();
        assert!(matches!(
            validate_message(&msg),
            Err(CuError::IllFormedMessage(_))
        ));
    }

    #[test]
    fn rejects_forwarded_without_deep_hash() {
        let mut msg = base_message();
        msg.message.forwarded_for = Some("other-proc".to_string());
        assert!(validate_message(&msg).is_err());
    }

    #[test]
    fn accepts_well_formed_message() {
        assert!(validate_message(&base_message()).is_ok());
    }

    #[test]
    fn tag_value_returns_first_match() {
        let tags = vec![Tag::new("Load", "one"), Tag::new("Load", "two")];
        assert_eq!(tag_value(&tags, "Load"), Some("one"));
        assert_eq!(tag_value(&tags, "Missing"), None);
    }
}
