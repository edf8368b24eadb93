//! Message Source (spec.md §4.E): a finite, forward-only stream of
//! Messages for `(processId, from, to)`, pulled from the Sequencer Unit.
//!
//! The SU returns pages in descending block-height order; this crate
//! reverses each page and pages transparently until exhausted, the way
//! the base crate's `flow-client::pagination` wraps a descending
//! PostgREST range into an ascending logical cursor.

use ao_types::{sort_key, AoGlobal, CuError, Message, MessageBody, Tag};
use futures::stream::{self, Stream, StreamExt};

/// One interaction as returned by the SU for a single page. Field
/// coercion from wire strings (block height/timestamp arrive as strings)
/// is the thin router layer's job (spec.md §1, out of scope); by the time
/// this crate sees an `SuInteraction` those fields are already numeric.
#[derive(Debug, Clone)]
pub struct SuInteraction {
    pub sort_key: String,
    pub block_height: u64,
    pub block_timestamp: u64,
    pub tags: Vec<Tag>,
    pub message_id: Option<String>,
    pub owner: String,
    pub target: String,
    pub anchor: Option<String>,
    pub data: Option<String>,
    pub is_cron: bool,
}

#[derive(Debug, Clone)]
pub struct SuPage {
    pub interactions: Vec<SuInteraction>,
    pub has_next_page: bool,
}

/// The SU's `interactions-sort-key` endpoint (spec.md §6), treated as an
/// external collaborator reached over HTTP.
#[async_trait::async_trait]
pub trait SequencerClient: Send + Sync {
    async fn fetch_page(
        &self,
        process_id: &str,
        from: &str,
        to: &str,
        cursor: Option<String>,
    ) -> Result<SuPage, CuError>;
}

fn to_message(process_id: &str, raw: SuInteraction) -> Message {
    let from = ao_types::tag_value(&raw.tags, "From-Process")
        .map(|s| s.to_string())
        .unwrap_or_else(|| raw.owner.clone());
    let forwarded_by = ao_types::tag_value(&raw.tags, "Forwarded-By").map(|s| s.to_string());
    let forwarded_for = ao_types::tag_value(&raw.tags, "Forwarded-For").map(|s| s.to_string());
    let is_assignment = ao_types::tag_value(&raw.tags, "Assignment").map(|_| true);

    Message {
        sort_key: sort_key::canonicalize(&raw.sort_key),
        deep_hash: None,
        is_assignment,
        is_cron: Some(raw.is_cron),
        epoch: None,
        nonce: None,
        message: MessageBody {
            id: raw.message_id,
            data: raw.data,
            owner: raw.owner.clone(),
            target: raw.target.clone(),
            anchor: raw.anchor,
            from,
            forwarded_by,
            forwarded_for,
            tags: raw.tags,
        },
        ao_global: AoGlobal {
            process: ao_types::Process {
                id: process_id.to_string(),
                owner: raw.owner,
                signature: None,
                data: None,
                anchor: None,
                tags: vec![],
                block: ao_types::Block {
                    height: raw.block_height,
                    timestamp: raw.block_timestamp,
                },
            },
            block: ao_types::Block {
                height: raw.block_height,
                timestamp: raw.block_timestamp,
            },
        },
    }
}

/// Open a forward-only stream of Messages for `(processId, from, to)`.
/// `from` is canonicalized as given; `to` must already reflect the
/// block-height-only increment rule (spec.md §4.A) — callers building a
/// bound from a bare block height should run it through
/// `sort_key::increment_bound` first.
pub fn open<'a>(
    client: &'a dyn SequencerClient,
    process_id: &'a str,
    from: &'a str,
    to: &'a str,
) -> impl Stream<Item = Result<Message, CuError>> + 'a {
    let from = sort_key::canonicalize(from);

    struct State<'a> {
        client: &'a dyn SequencerClient,
        process_id: &'a str,
        from: String,
        to: &'a str,
        // Messages from the current page, already reversed into ascending
        // order and awaiting delivery.
        buffer: std::collections::VecDeque<Message>,
        cursor: Option<String>,
        done: bool,
    }

    let initial = State {
        client,
        process_id,
        from,
        to,
        buffer: std::collections::VecDeque::new(),
        cursor: None,
        done: false,
    };

    stream::unfold(initial, move |mut state| async move {
        loop {
            if let Some(msg) = state.buffer.pop_front() {
                return Some((Ok(msg), state));
            }
            if state.done {
                return None;
            }

            let page = match state
                .client
                .fetch_page(state.process_id, &state.from, state.to, state.cursor.clone())
                .await
            {
                Ok(p) => p,
                Err(e) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
            };

            if page.interactions.is_empty() {
                state.done = true;
                continue;
            }

            // SU pages are descending by block height; reverse into
            // ascending order before handing messages to the consumer.
            for raw in page.interactions.into_iter().rev() {
                let msg = to_message(state.process_id, raw);
                match ao_types::validate_message(&msg) {
                    Ok(()) => state.buffer.push_back(msg),
                    Err(e) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                }
            }

            if page.has_next_page {
                state.cursor = state.buffer.back().map(|m| m.sort_key.clone());
            } else {
                state.done = true;
            }
        }
    })
}
