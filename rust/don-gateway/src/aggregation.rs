//! Quorum arithmetic and node response aggregation.

use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::api::Message;

/// Fault tolerance parameters of a DON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quorum {
    pub members: usize,
    pub f: usize,
}

impl Quorum {
    pub fn new(members: usize, f: usize) -> Self {
        Self { members, f }
    }

    /// Matching responses needed to trust a result: `F + 1`.
    pub fn threshold(&self) -> usize {
        self.f + 1
    }

    /// Send failures at which the request can no longer reach quorum.
    pub fn max_send_failures(&self) -> usize {
        self.members.saturating_sub(self.f)
    }
}

/// What an aggregator concluded from the responses seen so far.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationDecision {
    /// More responses are needed.
    Pending,
    /// Enough nodes agree; deliver this response.
    Agreed(Message),
    /// Agreement is no longer reachable.
    Failed(String),
}

/// Decides when a set of node responses is final.
///
/// `responses` maps node address to its response, one entry per node.
pub trait ResponseAggregator: Send + Sync + Debug {
    fn aggregate(&self, quorum: Quorum, responses: &BTreeMap<String, Message>) -> AggregationDecision;
}

/// Requires `F + 1` nodes to return byte-identical payloads.
///
/// The delivered message is taken from the lowest node address in the
/// winning group so the choice does not depend on arrival order.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatchingPayloadAggregator;

impl ResponseAggregator for MatchingPayloadAggregator {
    fn aggregate(&self, quorum: Quorum, responses: &BTreeMap<String, Message>) -> AggregationDecision {
        let mut groups: BTreeMap<Vec<u8>, Vec<&str>> = BTreeMap::new();
        for (node, msg) in responses {
            let key = serde_json::to_vec(&msg.body.payload).unwrap_or_default();
            groups.entry(key).or_default().push(node.as_str());
        }

        let threshold = quorum.threshold();
        let mut largest = 0;
        let mut winner: Option<&str> = None;
        for nodes in groups.values() {
            largest = largest.max(nodes.len());
            if nodes.len() >= threshold {
                // BTreeMap iteration keeps each group sorted by node address
                let first = nodes[0];
                if winner.is_none_or(|w| first < w) {
                    winner = Some(first);
                }
            }
        }

        if let Some(node) = winner {
            if let Some(msg) = responses.get(node) {
                return AggregationDecision::Agreed(msg.clone());
            }
        }

        let outstanding = quorum.members.saturating_sub(responses.len());
        if largest + outstanding < threshold {
            return AggregationDecision::Failed(format!(
                "{} responses from {} nodes cannot produce {threshold} matching payloads",
                responses.len(),
                quorum.members
            ));
        }
        AggregationDecision::Pending
    }
}
