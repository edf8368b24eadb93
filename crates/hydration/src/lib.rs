//! Hydration Pipeline (spec.md §4.F): deep-hash, data-load, and
//! assignment-overlay transforms applied to the Message Source stream,
//! preserving order and producing at most one output per input.

use ao_types::{CuError, Message};
use futures::stream::{Stream, StreamExt};

/// The result of fetching a referenced transaction's data for the legacy
/// `maybeLoadData` transform.
#[derive(Debug, Clone)]
pub struct LoadedData {
    pub data: String,
}

/// Fetches transaction data for the `Load` tag transform. Sunset by
/// `AO_LOAD_MAX_BLOCK`; an external collaborator (Arweave gateway).
#[async_trait::async_trait]
pub trait DataLoader: Send + Sync {
    async fn load(&self, tx_id: &str) -> Result<LoadedData, CuError>;
}

/// The fields an assignment overlays onto a scheduled message, fetched
/// from the referenced chain transaction.
#[derive(Debug, Clone)]
pub struct AssignmentOverlay {
    pub id: String,
    pub owner: String,
    pub from: String,
    pub tags: Vec<ao_types::Tag>,
    pub anchor: Option<String>,
    pub data: Option<String>,
}

#[async_trait::async_trait]
pub trait AssignmentResolver: Send + Sync {
    async fn resolve(&self, tx_id: &str) -> Result<AssignmentOverlay, CuError>;
}

pub struct HydrationConfig {
    /// `None` disables `maybeLoadData` entirely (full sunset, per the
    /// design notes' guidance to plan for the transform's removal).
    pub load_max_block: Option<u64>,
}

pub struct HydrationDeps<'a> {
    pub data_loader: &'a dyn DataLoader,
    pub assignment_resolver: &'a dyn AssignmentResolver,
}

/// `maybeDeepHash`: if the message was forwarded (`Forwarded-By` set),
/// compute and attach its deepHash. On failure, the stream fails (spec.md
/// §7: skipping would desynchronize state).
fn maybe_deep_hash(mut msg: Message) -> Result<Message, CuError> {
    if !msg.needs_deep_hash() {
        return Ok(msg);
    }
    let data = msg.message.data.clone().unwrap_or_default();
    let item = deep_hash::DataItem {
        target: &msg.message.target,
        anchor: msg.message.anchor.as_deref().unwrap_or(""),
        tags: &msg.message.tags,
        data: data.as_bytes(),
    };
    msg.deep_hash = Some(deep_hash::deep_hash(&item)?);
    Ok(msg)
}

/// `maybeLoadData`: legacy transform, bounded by `AO_LOAD_MAX_BLOCK`.
/// Returns `None` when the message should be dropped (above the
/// deprecation cutoff).
async fn maybe_load_data(
    mut msg: Message,
    loader: &dyn DataLoader,
    config: &HydrationConfig,
) -> Result<Option<Message>, CuError> {
    let Some(load_tx) = ao_types::tag_value(&msg.message.tags, "Load").map(|s| s.to_string()) else {
        return Ok(Some(msg));
    };
    if msg.is_cron.unwrap_or(false) {
        return Ok(Some(msg));
    }
    let Some(cutoff) = config.load_max_block else {
        // The transform is fully disabled: legacy `Load` tags pass
        // through untouched rather than being resolved.
        return Ok(Some(msg));
    };
    if msg.ao_global.block.height >= cutoff {
        tracing::debug!(
            block_height = msg.ao_global.block.height,
            cutoff,
            "dropping message past AO_LOAD_MAX_BLOCK (legacy maybeAoLoad sunset)"
        );
        return Ok(None);
    }

    let loaded = loader.load(&load_tx).await?;
    msg.message.data = Some(loaded.data);
    Ok(Some(msg))
}

/// `maybeAssignment`: overlay the referenced transaction's
/// `(Id, Owner, From, Tags, Anchor, Data)` onto the message. Per spec.md
/// §9 Open Question (b), both `Owner` and `From` are overlaid from the
/// chain transaction rather than retaining the scheduled values.
async fn maybe_assignment(mut msg: Message, resolver: &dyn AssignmentResolver) -> Result<Message, CuError> {
    if !msg.is_assignment.unwrap_or(false) {
        return Ok(msg);
    }
    let Some(tx_id) = msg.message.id.clone() else {
        return Err(CuError::ill_formed("assignment message is missing an id"));
    };
    let overlay = resolver.resolve(&tx_id).await?;

    msg.message.id = Some(overlay.id);
    msg.message.owner = overlay.owner;
    msg.message.from = overlay.from;
    msg.message.tags = overlay.tags;
    msg.message.anchor = overlay.anchor;
    msg.message.data = overlay.data;
    Ok(msg)
}

/// Run a single message through all three transforms plus the terminal
/// schema validator. Returns `Ok(None)` if the message was legacy-dropped.
pub async fn hydrate(msg: Message, deps: &HydrationDeps<'_>, config: &HydrationConfig) -> Result<Option<Message>, CuError> {
    let msg = maybe_deep_hash(msg)?;
    let Some(msg) = maybe_load_data(msg, deps.data_loader, config).await? else {
        return Ok(None);
    };
    let msg = maybe_assignment(msg, deps.assignment_resolver).await?;
    ao_types::validate_message(&msg)?;
    Ok(Some(msg))
}

/// Compose the Message Source stream with the hydration transforms,
/// preserving order and pull-based backpressure: each output is produced
/// only as the consumer polls for it.
pub fn pipeline<'a, S>(
    source: S,
    deps: &'a HydrationDeps<'a>,
    config: &'a HydrationConfig,
) -> impl Stream<Item = Result<Message, CuError>> + 'a
where
    S: Stream<Item = Result<Message, CuError>> + 'a,
{
    source
        .then(move |res| async move {
            match res {
                Ok(msg) => hydrate(msg, deps, config).await,
                Err(e) => Err(e),
            }
        })
        .filter_map(|res| async move {
            match res {
                Ok(Some(msg)) => Some(Ok(msg)),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            }
        })
}

#[cfg(test)]
mod test {
    use super::*;
    use ao_types::{AoGlobal, Block, MessageBody, Process, Tag};
    use futures::stream;

    fn base_message(height: u64) -> Message {
        Message {
            sort_key: format!("{height:012},{},k", height * 1000),
            deep_hash: None,
            is_assignment: None,
            is_cron: Some(false),
            epoch: None,
            nonce: None,
            message: MessageBody {
                id: Some(format!("msg-{height}")),
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
                        height,
                        timestamp: height * 1000,
                    },
                },
                block: Block {
                    height,
                    timestamp: height * 1000,
                },
            },
        }
    }

    struct NoopLoader;
    #[async_trait::async_trait]
    impl DataLoader for NoopLoader {
        async fn load(&self, _tx_id: &str) -> Result<LoadedData, CuError> {
            Ok(LoadedData {
                data: "loaded".to_string(),
            })
        }
    }

    struct NoopResolver;
    #[async_trait::async_trait]
    impl AssignmentResolver for NoopResolver {
        async fn resolve(&self, tx_id: &str) -> Result<AssignmentOverlay, CuError> {
            Ok(AssignmentOverlay {
                id: tx_id.to_string(),
                owner: "chain-owner".to_string(),
                from: "chain-owner".to_string(),
                tags: vec![Tag::new("From-Process", "chain-owner")],
                anchor: None,
                data: Some("chain-data".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn deep_hash_attached_only_for_forwarded_messages() {
        let mut msg = base_message(1);
        msg.message.forwarded_by = Some("forwarder".to_string());
        msg.message.forwarded_for = Some("target".to_string());

        let config = HydrationConfig {
            load_max_block: Some(1000),
        };
        let deps = HydrationDeps {
            data_loader: &NoopLoader,
            assignment_resolver: &NoopResolver,
        };
        let out = hydrate(msg, &deps, &config).await.unwrap().unwrap();
        assert!(out.deep_hash.is_some());

        let plain = base_message(2);
        let out2 = hydrate(plain, &deps, &config).await.unwrap().unwrap();
        assert!(out2.deep_hash.is_none());
    }

    #[tokio::test]
    async fn load_data_drops_messages_past_cutoff() {
        let mut msg = base_message(2000);
        msg.message.tags = vec![Tag::new("Load", "tx-1")];

        let config = HydrationConfig {
            load_max_block: Some(1000),
        };
        let deps = HydrationDeps {
            data_loader: &NoopLoader,
            assignment_resolver: &NoopResolver,
        };
        let out = hydrate(msg, &deps, &config).await.unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn load_data_fetches_below_cutoff() {
        let mut msg = base_message(1);
        msg.message.tags = vec![Tag::new("Load", "tx-1")];

        let config = HydrationConfig {
            load_max_block: Some(1000),
        };
        let deps = HydrationDeps {
            data_loader: &NoopLoader,
            assignment_resolver: &NoopResolver,
        };
        let out = hydrate(msg, &deps, &config).await.unwrap().unwrap();
        assert_eq!(out.message.data, Some("loaded".to_string()));
    }

    #[tokio::test]
    async fn assignment_overlays_owner_and_from() {
        let mut msg = base_message(1);
        msg.is_assignment = Some(true);

        let config = HydrationConfig {
            load_max_block: Some(1000),
        };
        let deps = HydrationDeps {
            data_loader: &NoopLoader,
            assignment_resolver: &NoopResolver,
        };
        let out = hydrate(msg, &deps, &config).await.unwrap().unwrap();
        assert_eq!(out.message.owner, "chain-owner");
        assert_eq!(out.message.from, "chain-owner");
        assert_eq!(out.message.data, Some("chain-data".to_string()));
    }

    #[tokio::test]
    async fn pipeline_preserves_order_and_filters_dropped() {
        let config = HydrationConfig {
            load_max_block: Some(1000),
        };
        let deps = HydrationDeps {
            data_loader: &NoopLoader,
            assignment_resolver: &NoopResolver,
        };

        let mut dropped = base_message(2000);
        dropped.message.tags = vec![Tag::new("Load", "tx-1")];

        let source = stream::iter(vec![Ok(base_message(1)), Ok(dropped), Ok(base_message(3))]);
        let out: Vec<Message> = pipeline(source, &deps, &config)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let heights: Vec<u64> = out.iter().map(|m| m.ao_global.block.height).collect();
        assert_eq!(heights, vec![1, 3]);
    }
}
