//! Shared fixtures for handler integration tests.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::collections::HashSet;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use don_gateway::{Don, DonConfig, FunctionsHandler, Handler, Message, NodeConfig};

pub const DON_ID: &str = "functions_don";

pub fn signing_key(seed: u8) -> SigningKey {
    let mut secret = [0u8; 32];
    secret[31] = seed;
    SigningKey::from_slice(&secret).unwrap()
}

pub fn node_address(i: usize) -> String {
    format!("0x{i:040x}")
}

pub fn don_config(members: usize, f: usize) -> DonConfig {
    DonConfig {
        don_id: DON_ID.to_string(),
        members: (1..=members)
            .map(|i| NodeConfig {
                name: format!("node{i}"),
                address: node_address(i),
            })
            .collect(),
        f,
        ..DonConfig::default()
    }
}

pub fn signed_request(message_id: &str, seed: u8) -> Message {
    let mut msg = Message::new(message_id, "secrets_set", DON_ID, json!({"encryptedSecrets": "0xabcd"}));
    msg.sign(&signing_key(seed)).unwrap();
    msg
}

/// The response a node returns for `request`.
pub fn node_response(request: &Message, payload: Value) -> Message {
    let mut response = request.clone();
    response.body.payload = payload;
    response.signature.clear();
    response
}

/// Records sends, fails the configured nodes, and optionally answers every
/// successful send through the handler before returning.
#[derive(Debug, Default)]
pub struct MockDon {
    failing: Mutex<HashSet<String>>,
    sent: Mutex<Vec<(String, Message)>>,
    auto_reply: Mutex<Option<Value>>,
    handler: OnceLock<Weak<FunctionsHandler>>,
}

impl MockDon {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_nodes(&self, addresses: impl IntoIterator<Item = String>) {
        self.failing.lock().extend(addresses);
    }

    /// Reply to every successful send with `payload` via `handler`.
    pub fn auto_reply(&self, handler: &Arc<FunctionsHandler>, payload: Value) {
        let _ = self.handler.set(Arc::downgrade(handler));
        *self.auto_reply.lock() = Some(payload);
    }

    pub fn sent(&self) -> Vec<(String, Message)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Don for MockDon {
    async fn send_to_node(
        &self,
        _cancel: &CancellationToken,
        node_address: &str,
        msg: &Message,
    ) -> anyhow::Result<()> {
        self.sent.lock().push((node_address.to_string(), msg.clone()));
        if self.failing.lock().contains(node_address) {
            anyhow::bail!("node {node_address} unreachable");
        }

        let reply = self.auto_reply.lock().clone();
        let handler = self.handler.get().and_then(Weak::upgrade);
        if let (Some(payload), Some(handler)) = (reply, handler) {
            handler
                .handle_node_message(node_response(msg, payload), node_address)
                .await?;
        }
        Ok(())
    }
}
