//! Delivery of user requests to DON members.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::api::Message;
use crate::config::NodeConfig;
use crate::metrics;

/// Sends messages to individual DON members.
#[async_trait]
pub trait Don: Send + Sync + fmt::Debug {
    async fn send_to_node(
        &self,
        cancel: &CancellationToken,
        node_address: &str,
        msg: &Message,
    ) -> anyhow::Result<()>;
}

/// A single connected node.
#[async_trait]
pub trait NodeConnection: Send + Sync + fmt::Debug {
    async fn send(&self, msg: &Message) -> anyhow::Result<()>;
}

/// In-process [`Don`] routing to registered connections by address.
#[derive(Debug, Default)]
pub struct LocalDon {
    nodes: RwLock<HashMap<String, Arc<dyn NodeConnection>>>,
}

impl LocalDon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the connection for `address`.
    pub fn register(&self, address: &str, connection: Arc<dyn NodeConnection>) {
        self.nodes
            .write()
            .insert(address.to_ascii_lowercase(), connection);
    }

    pub fn deregister(&self, address: &str) -> bool {
        self.nodes
            .write()
            .remove(&address.to_ascii_lowercase())
            .is_some()
    }
}

#[async_trait]
impl Don for LocalDon {
    async fn send_to_node(
        &self,
        cancel: &CancellationToken,
        node_address: &str,
        msg: &Message,
    ) -> anyhow::Result<()> {
        if cancel.is_cancelled() {
            bail!("request cancelled");
        }
        let connection = self
            .nodes
            .read()
            .get(&node_address.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| anyhow!("node {node_address} is not connected"))?;
        connection.send(msg).await
    }
}

/// Per-member result of one fan-out.
#[derive(Debug, Default)]
pub struct FanOutReport {
    pub succeeded: usize,
    /// `(node address, error)` for each failed send.
    pub failed: Vec<(String, String)>,
}

impl FanOutReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed.len()
    }
}

/// Send `msg` to every member concurrently.
///
/// Each send is bounded by `timeout` and abandoned when `cancel` fires;
/// timeouts and cancellations count as failures.
pub async fn fan_out(
    don: &dyn Don,
    members: &[NodeConfig],
    msg: &Message,
    cancel: &CancellationToken,
    timeout: Duration,
) -> FanOutReport {
    let sends = members.iter().map(|member| async move {
        let result = tokio::select! {
            () = cancel.cancelled() => Err(anyhow!("request cancelled")),
            sent = tokio::time::timeout(timeout, don.send_to_node(cancel, &member.address, msg)) => {
                sent.map_err(|_| anyhow!("send timed out after {timeout:?}")).and_then(|r| r)
            }
        };
        (member, result)
    });

    let mut report = FanOutReport::default();
    for (member, result) in join_all(sends).await {
        metrics::record_node_send(result.is_ok());
        match result {
            Ok(()) => report.succeeded += 1,
            Err(e) => {
                tracing::debug!(node = %member.name, address = %member.address, error = %e, "Send to node failed");
                report.failed.push((member.address.clone(), format!("{e:#}")));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingNode {
        received: AtomicUsize,
        fail: bool,
        stall: bool,
    }

    #[async_trait]
    impl NodeConnection for CountingNode {
        async fn send(&self, _msg: &Message) -> anyhow::Result<()> {
            if self.stall {
                std::future::pending::<()>().await;
            }
            if self.fail {
                bail!("connection reset");
            }
            self.received.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn members(n: usize) -> Vec<NodeConfig> {
        (0..n)
            .map(|i| NodeConfig {
                name: format!("node{i}"),
                address: format!("0xn{i}"),
            })
            .collect()
    }

    fn request() -> Message {
        Message::new("1", "secrets_list", "don", json!(null))
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_member() {
        let don = LocalDon::new();
        let nodes: Vec<Arc<CountingNode>> = (0..3).map(|_| Arc::new(CountingNode::default())).collect();
        for (member, node) in members(3).iter().zip(&nodes) {
            don.register(&member.address, node.clone());
        }

        let report = fan_out(&don, &members(3), &request(), &CancellationToken::new(), Duration::from_secs(1)).await;
        assert_eq!(report.succeeded, 3);
        assert!(report.failed.is_empty());
        for node in nodes {
            assert_eq!(node.received.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_unknown_and_failing_nodes_counted() {
        let don = LocalDon::new();
        let members = members(3);
        don.register(&members[0].address, Arc::new(CountingNode::default()));
        don.register(
            &members[1].address,
            Arc::new(CountingNode {
                fail: true,
                ..CountingNode::default()
            }),
        );

        let report = fan_out(&don, &members, &request(), &CancellationToken::new(), Duration::from_secs(1)).await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.total(), 3);
        assert!(report.failed.iter().any(|(_, e)| e.contains("not connected")));
        assert!(report.failed.iter().any(|(_, e)| e.contains("connection reset")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_node_times_out() {
        let don = LocalDon::new();
        let members = members(2);
        don.register(&members[0].address, Arc::new(CountingNode::default()));
        don.register(
            &members[1].address,
            Arc::new(CountingNode {
                stall: true,
                ..CountingNode::default()
            }),
        );

        let report = fan_out(&don, &members, &request(), &CancellationToken::new(), Duration::from_millis(500)).await;
        assert_eq!(report.succeeded, 1);
        assert!(report.failed[0].1.contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancelled_request_sends_nothing() {
        let don = LocalDon::new();
        let node = Arc::new(CountingNode::default());
        let members = members(1);
        don.register(&members[0].address, node.clone());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = fan_out(&don, &members, &request(), &cancel, Duration::from_secs(1)).await;
        assert_eq!(report.succeeded, 0);
        assert_eq!(node.received.load(Ordering::SeqCst), 0);
        assert!(don.deregister(&members[0].address));
    }
}
