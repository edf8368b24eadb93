//! MU Cranker (spec.md §4.I): dispatch outbound messages to the SU and
//! recursively crank the evaluations they trigger.

use ao_types::{CuError, MessageBody, Tag};
use std::collections::{HashSet, VecDeque};

/// The data item shape a cranked message is signed into; the signing
/// library itself is an external collaborator (spec.md §1).
#[derive(Debug, Clone)]
pub struct DataItem {
    pub target: String,
    pub anchor: Option<String>,
    pub tags: Vec<Tag>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SignedDataItem {
    pub target: String,
    pub tags: Vec<Tag>,
    pub data: Vec<u8>,
    pub owner: String,
}

pub trait Signer: Send + Sync {
    fn owner_address(&self) -> &str;
    fn sign(&self, item: DataItem) -> Result<SignedDataItem, CuError>;
}

/// The SU's message-submission endpoint (spec.md §6), an external
/// collaborator reached over HTTP.
#[async_trait::async_trait]
pub trait SuClient: Send + Sync {
    async fn submit(&self, item: &SignedDataItem) -> Result<String, CuError>;
}

/// Routes a processId to the CU node responsible for evaluating it.
/// Intentionally synchronous: this is local routing logic, not an I/O call.
pub trait NodeSelector: Send + Sync {
    fn select_node(&self, process_id: &str) -> String;
}

#[derive(Debug, Clone, Default)]
pub struct CrankEvaluationResult {
    pub outbound_messages: Vec<MessageBody>,
    pub spawns: Vec<MessageBody>,
}

/// Fetches the evaluation a just-submitted message triggered, so its
/// outbound messages and spawns can be cranked in turn.
#[async_trait::async_trait]
pub trait CuClient: Send + Sync {
    async fn fetch_evaluation(
        &self,
        node: &str,
        process_id: &str,
        message_id: &str,
    ) -> Result<CrankEvaluationResult, CuError>;
}

pub struct CrankDeps<'a> {
    pub signer: &'a dyn Signer,
    pub su_client: &'a dyn SuClient,
    pub node_selector: &'a dyn NodeSelector,
    pub cu_client: &'a dyn CuClient,
}

#[derive(Debug, Default)]
pub struct CrankOutcome {
    /// Tx ids of messages successfully submitted to the SU.
    pub sent: Vec<String>,
    /// Messages that failed to dispatch; callers persist these as unsent
    /// and may retry them on a subsequent crank.
    pub unsent: Vec<MessageBody>,
}

fn to_data_item(msg: &MessageBody) -> DataItem {
    DataItem {
        target: msg.target.clone(),
        anchor: msg.anchor.clone(),
        tags: msg.tags.clone(),
        data: msg.data.clone().unwrap_or_default().into_bytes(),
    }
}

async fn dispatch(deps: &CrankDeps<'_>, msg: &MessageBody) -> Result<String, CuError> {
    let item = to_data_item(msg);
    let signed = deps.signer.sign(item)?;
    deps.su_client.submit(&signed).await
}

/// Dispatch `messages` and recursively crank the evaluations they trigger,
/// bounded by `depth_limit` and a `(processId, messageId)` traversal set.
/// Per-message failures are logged and isolated: a failing message does
/// not abort its siblings, and is returned in `unsent` for the caller to
/// persist and retry.
pub async fn crank(deps: &CrankDeps<'_>, messages: Vec<MessageBody>, depth_limit: u32) -> CrankOutcome {
    let mut visited: HashSet<(String, String)> = HashSet::new();
    let mut outcome = CrankOutcome::default();
    let mut queue: VecDeque<(u32, MessageBody)> = messages.into_iter().map(|m| (0, m)).collect();

    while let Some((depth, msg)) = queue.pop_front() {
        if depth >= depth_limit {
            tracing::warn!(target = %msg.target, depth, "crank depth limit reached, dropping message");
            continue;
        }

        let message_id = msg.id.clone().unwrap_or_default();
        let key = (msg.target.clone(), message_id.clone());
        if !visited.insert(key) {
            tracing::debug!(target = %msg.target, message_id, "already cranked this message, skipping");
            continue;
        }

        match dispatch(deps, &msg).await {
            Err(e) => {
                tracing::warn!(target = %msg.target, error = %e, "failed to dispatch message, marking unsent");
                outcome.unsent.push(msg);
            }
            Ok(tx_id) => {
                outcome.sent.push(tx_id);

                let node = deps.node_selector.select_node(&msg.target);
                match deps.cu_client.fetch_evaluation(&node, &msg.target, &message_id).await {
                    Ok(result) => {
                        for next in result.outbound_messages.into_iter().chain(result.spawns) {
                            queue.push_back((depth + 1, next));
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            target = %msg.target,
                            message_id,
                            error = %e,
                            "failed to fetch resulting evaluation, not expanding recursion"
                        );
                    }
                }
            }
        }
    }

    outcome
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    fn message(target: &str, id: &str) -> MessageBody {
        MessageBody {
            id: Some(id.to_string()),
            data: None,
            owner: "owner-1".to_string(),
            target: target.to_string(),
            anchor: None,
            from: "owner-1".to_string(),
            forwarded_by: None,
            forwarded_for: None,
            tags: vec![],
        }
    }

    struct FakeSigner;
    impl Signer for FakeSigner {
        fn owner_address(&self) -> &str {
            "owner-1"
        }
        fn sign(&self, item: DataItem) -> Result<SignedDataItem, CuError> {
            Ok(SignedDataItem {
                target: item.target,
                tags: item.tags,
                data: item.data,
                owner: "owner-1".to_string(),
            })
        }
    }

    struct FakeSu {
        submitted: Mutex<Vec<String>>,
        fail_targets: Vec<String>,
    }

    #[async_trait::async_trait]
    impl SuClient for FakeSu {
        async fn submit(&self, item: &SignedDataItem) -> Result<String, CuError> {
            if self.fail_targets.contains(&item.target) {
                return Err(CuError::transient(anyhow::anyhow!("su unavailable")));
            }
            let tx_id = format!("tx-{}", item.target);
            self.submitted.lock().unwrap().push(tx_id.clone());
            Ok(tx_id)
        }
    }

    struct FixedNode;
    impl NodeSelector for FixedNode {
        fn select_node(&self, _process_id: &str) -> String {
            "cu-1".to_string()
        }
    }

    struct ChainCu {
        /// Each dispatched message triggers exactly one more message to
        /// the next target in this chain, until exhausted.
        chain: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl CuClient for ChainCu {
        async fn fetch_evaluation(
            &self,
            _node: &str,
            _process_id: &str,
            _message_id: &str,
        ) -> Result<CrankEvaluationResult, CuError> {
            let mut chain = self.chain.lock().unwrap();
            if let Some(next_target) = chain.pop() {
                Ok(CrankEvaluationResult {
                    outbound_messages: vec![message(&next_target, "next")],
                    spawns: vec![],
                })
            } else {
                Ok(CrankEvaluationResult::default())
            }
        }
    }

    #[tokio::test]
    async fn dispatches_and_recurses_through_chain() {
        let su = FakeSu {
            submitted: Mutex::new(vec![]),
            fail_targets: vec![],
        };
        let cu = ChainCu {
            chain: Mutex::new(vec!["proc-c".to_string(), "proc-b".to_string()]),
        };
        let deps = CrankDeps {
            signer: &FakeSigner,
            su_client: &su,
            node_selector: &FixedNode,
            cu_client: &cu,
        };

        let outcome = crank(&deps, vec![message("proc-a", "m1")], 10).await;
        assert_eq!(outcome.sent.len(), 3);
        assert!(outcome.unsent.is_empty());
    }

    #[tokio::test]
    async fn failed_dispatch_is_isolated_and_marked_unsent() {
        let su = FakeSu {
            submitted: Mutex::new(vec![]),
            fail_targets: vec!["proc-bad".to_string()],
        };
        let cu = ChainCu { chain: Mutex::new(vec![]) };
        let deps = CrankDeps {
            signer: &FakeSigner,
            su_client: &su,
            node_selector: &FixedNode,
            cu_client: &cu,
        };

        let outcome = crank(
            &deps,
            vec![message("proc-bad", "m1"), message("proc-good", "m2")],
            10,
        )
        .await;
        assert_eq!(outcome.sent, vec!["tx-proc-good".to_string()]);
        assert_eq!(outcome.unsent.len(), 1);
        assert_eq!(outcome.unsent[0].target, "proc-bad");
    }

    #[tokio::test]
    async fn depth_limit_drops_further_recursion() {
        let su = FakeSu {
            submitted: Mutex::new(vec![]),
            fail_targets: vec![],
        };
        let cu = ChainCu {
            chain: Mutex::new(vec!["proc-c".to_string(), "proc-b".to_string()]),
        };
        let deps = CrankDeps {
            signer: &FakeSigner,
            su_client: &su,
            node_selector: &FixedNode,
            cu_client: &cu,
        };

        let outcome = crank(&deps, vec![message("proc-a", "m1")], 1).await;
        assert_eq!(outcome.sent.len(), 1);
    }

    #[tokio::test]
    async fn visited_set_prevents_loops() {
        let su = FakeSu {
            submitted: Mutex::new(vec![]),
            fail_targets: vec![],
        };
        struct LoopingCu;
        #[async_trait::async_trait]
        impl CuClient for LoopingCu {
            async fn fetch_evaluation(
                &self,
                _node: &str,
                _process_id: &str,
                _message_id: &str,
            ) -> Result<CrankEvaluationResult, CuError> {
                Ok(CrankEvaluationResult {
                    outbound_messages: vec![message("proc-a", "m1")],
                    spawns: vec![],
                })
            }
        }
        let deps = CrankDeps {
            signer: &FakeSigner,
            su_client: &su,
            node_selector: &FixedNode,
            cu_client: &LoopingCu,
        };

        let outcome = crank(&deps, vec![message("proc-a", "m1")], 100).await;
        assert_eq!(outcome.sent.len(), 1);
    }
}
