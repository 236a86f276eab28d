//! Request handler: admission, pending-state registration, DON fan-out and
//! quorum delivery.
//!
//! A user message passes these checks, in order, before any state changes:
//!
//! 1. required fields present and within size limits
//! 2. DON id matches the served DON (skipped when none is configured)
//! 3. method is `secrets_set` or `secrets_list`
//! 4. sender is allow-listed
//! 5. signature recovers to the sender
//! 6. sender and global rate limits have capacity
//!
//! Rate limiting runs after signature verification because it spends tokens
//! keyed by sender.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::aggregation::MatchingPayloadAggregator;
use crate::allowlist::{Allowlist, AllowlistSource, OnchainAllowlist};
use crate::api::{Address, ErrorCode, Message, UserCallbackPayload};
use crate::config::{ConfigValidator, ConfigurationError, DonConfig, HandlerConfig};
use crate::don::{fan_out, Don};
use crate::error::{GatewayError, GatewayResult};
use crate::logging::OpTimer;
use crate::metrics;
use crate::pending::{sweep_interval_for, PendingLimits, PendingRequests, RequestKey, ResponseOutcome};
use crate::rate_limit::RateLimiter;

pub const METHOD_SECRETS_SET: &str = "secrets_set";
pub const METHOD_SECRETS_LIST: &str = "secrets_list";

const SHUTDOWN_REASON: &str = "gateway handler is shutting down";

/// Metrics label for a caller-supplied method. Only supported methods get
/// their own series.
fn method_label(method: &str) -> &'static str {
    match method {
        METHOD_SECRETS_SET => METHOD_SECRETS_SET,
        METHOD_SECRETS_LIST => METHOD_SECRETS_LIST,
        _ => "unsupported",
    }
}

/// A gateway handler serving one DON.
#[async_trait]
pub trait Handler: Send + Sync + std::fmt::Debug {
    /// Admit a user request and forward it to the DON.
    ///
    /// On `Ok`, exactly one value will be sent on `callback`. On `Err`,
    /// nothing was registered and `callback` is dropped.
    async fn handle_user_message(
        &self,
        cancel: &CancellationToken,
        msg: Message,
        callback: oneshot::Sender<UserCallbackPayload>,
    ) -> GatewayResult<()>;

    /// Feed a node's response into the pending table. Unknown requests and
    /// non-member nodes are logged and ignored.
    async fn handle_node_message(&self, msg: Message, node_address: &str) -> GatewayResult<()>;

    /// Spawn background tasks. Must be called from within a Tokio runtime.
    fn start(&self) -> GatewayResult<()>;

    /// Stop background tasks, wait for them, and fail any pending requests.
    async fn close(&self) -> GatewayResult<()>;
}

/// Handler for the `secrets_set` and `secrets_list` methods.
#[derive(Debug)]
pub struct FunctionsHandler {
    config: HandlerConfig,
    don_config: DonConfig,
    don: Arc<dyn Don>,
    allowlist: Option<Arc<dyn Allowlist>>,
    rate_limiter: Option<RateLimiter>,
    pending: Arc<PendingRequests>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl FunctionsHandler {
    pub fn new(
        config: HandlerConfig,
        don_config: DonConfig,
        don: Arc<dyn Don>,
        allowlist: Option<Arc<dyn Allowlist>>,
        rate_limiter: Option<RateLimiter>,
    ) -> Self {
        let pending = PendingRequests::new(
            don_config.quorum(),
            Arc::new(MatchingPayloadAggregator),
            PendingLimits {
                global: config.max_pending_requests_global,
                per_sender: config.max_pending_requests_per_user,
            },
        );
        Self {
            config,
            don_config,
            don,
            allowlist,
            rate_limiter,
            pending: Arc::new(pending),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Build a handler from its raw JSON config.
    ///
    /// `allowlist_source` is required when the config enables the allow-list.
    pub fn from_config(
        raw: &serde_json::Value,
        don_config: DonConfig,
        don: Arc<dyn Don>,
        allowlist_source: Option<Arc<dyn AllowlistSource>>,
    ) -> GatewayResult<Self> {
        let config = HandlerConfig::parse(raw)?;
        ConfigValidator::validate_don(&don_config)?;

        let allowlist: Option<Arc<dyn Allowlist>> = match &config.allowlist_config {
            Some(allowlist_config) => {
                let source = allowlist_source.ok_or_else(|| {
                    ConfigurationError::missing_required(
                        "allow-list source",
                        "allowlistConfig is set",
                        "FunctionsHandler::from_config",
                    )
                })?;
                let contract: Address = allowlist_config.contract_address.parse().map_err(
                    |e: crate::api::ParseAddressError| {
                        ConfigurationError::invalid(
                            format!("allowlistConfig.contractAddress: {e}"),
                            "Use the 0x-prefixed 20-byte address of the allow-list contract",
                        )
                    },
                )?;
                Some(Arc::new(OnchainAllowlist::new(
                    source,
                    contract,
                    allowlist_config.block_confirmations,
                )))
            }
            None => None,
        };

        let rate_limiter = config
            .rate_limiter_config
            .as_ref()
            .map(RateLimiter::new)
            .transpose()?;

        Ok(Self::new(config, don_config, don, allowlist, rate_limiter))
    }

    pub fn pending_requests(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    pub fn don_config(&self) -> &DonConfig {
        &self.don_config
    }

    fn admit(&self, msg: &Message) -> GatewayResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(GatewayError::Lifecycle("handler is closed".to_string()));
        }

        msg.validate_fields()?;
        let body = &msg.body;

        if !self.don_config.don_id.is_empty() && body.don_id != self.don_config.don_id {
            return Err(GatewayError::UnsupportedDonId {
                expected: self.don_config.don_id.clone(),
                got: body.don_id.clone(),
            });
        }
        if body.method != METHOD_SECRETS_SET && body.method != METHOD_SECRETS_LIST {
            return Err(GatewayError::UnsupportedMethod(body.method.clone()));
        }

        let sender: Address = body
            .sender
            .parse()
            .map_err(|e: crate::api::ParseAddressError| GatewayError::InvalidMessage(e.to_string()))?;
        if let Some(allowlist) = &self.allowlist {
            if !allowlist.allow(&sender) {
                return Err(GatewayError::NotAllowlisted {
                    sender: sender.to_string(),
                });
            }
        }

        msg.verify_signature()?;

        if let Some(limiter) = &self.rate_limiter {
            if !limiter.allow(&sender.to_string()) {
                return Err(GatewayError::RateLimited {
                    sender: sender.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn handle_secrets_request(
        &self,
        cancel: &CancellationToken,
        msg: Message,
        callback: oneshot::Sender<UserCallbackPayload>,
    ) -> GatewayResult<()> {
        let key = RequestKey::from_message(&msg);
        let timeout = self.config.request_timeout();
        self.pending.register(key.clone(), callback, Instant::now() + timeout)?;

        let timer = OpTimer::new("don", "fan_out");
        let report = fan_out(self.don.as_ref(), &self.don_config.members, &msg, cancel, timeout).await;

        let max_failures = self.pending.quorum().max_send_failures();
        let result = if report.failed.len() >= max_failures {
            Err(GatewayError::InsufficientNodes {
                failed: report.failed.len(),
                total: report.total(),
            })
        } else {
            Ok(report.succeeded)
        };
        timer.finish_with_result(result.as_ref());

        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                if self.pending.evict(&key) {
                    tracing::warn!(request = %key, failures = ?report.failed, "Fan-out could not reach enough nodes");
                    Err(err)
                } else {
                    // resolved or expired while sends were in flight
                    tracing::debug!(request = %key, "Request completed before fan-out returned");
                    Ok(())
                }
            }
        }
    }
}

#[async_trait]
impl Handler for FunctionsHandler {
    async fn handle_user_message(
        &self,
        cancel: &CancellationToken,
        msg: Message,
        callback: oneshot::Sender<UserCallbackPayload>,
    ) -> GatewayResult<()> {
        let method = method_label(&msg.body.method);
        if let Err(e) = self.admit(&msg) {
            tracing::debug!(sender = %msg.body.sender, id = %msg.body.message_id, reason = e.reason(), error = %e, "Rejected user message");
            metrics::record_rejection(e.reason());
            metrics::record_user_request(method, "rejected");
            return Err(e);
        }

        tracing::debug!(sender = %msg.body.sender, id = %msg.body.message_id, method, "Accepted user message");
        let result = self.handle_secrets_request(cancel, msg, callback).await;
        match &result {
            Ok(()) => metrics::record_user_request(method, "accepted"),
            Err(e) => {
                metrics::record_rejection(e.reason());
                metrics::record_user_request(method, "rejected");
            }
        }
        result
    }

    async fn handle_node_message(&self, msg: Message, node_address: &str) -> GatewayResult<()> {
        if !self.don_config.is_member(node_address) {
            tracing::warn!(node = %node_address, id = %msg.body.message_id, "Dropping response from a node outside the DON");
            metrics::record_node_response("non_member");
            return Ok(());
        }

        let key = RequestKey::from_message(&msg);
        match self.pending.record_response(&key, node_address, msg) {
            ResponseOutcome::Unmatched => {
                tracing::warn!(request = %key, node = %node_address, "Received a node message for an unknown request");
                metrics::record_node_response("unmatched");
            }
            ResponseOutcome::Recorded(count) => {
                tracing::debug!(request = %key, node = %node_address, count, "Recorded node response");
                metrics::record_node_response("recorded");
            }
            ResponseOutcome::Resolved(code) => {
                tracing::debug!(request = %key, node = %node_address, %code, "Request resolved");
                metrics::record_node_response("resolved");
            }
        }
        Ok(())
    }

    fn start(&self) -> GatewayResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| GatewayError::Lifecycle(format!("start requires a Tokio runtime: {e}")))?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::Lifecycle("handler already started".to_string()));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Lifecycle("handler is closed".to_string()));
        }

        tracing::info!(
            don_id = %self.don_config.don_id,
            members = self.don_config.members.len(),
            f = self.don_config.f,
            "Starting FunctionsHandler"
        );
        let mut tasks = self.tasks.lock();

        if let (Some(allowlist), Some(allowlist_config)) = (&self.allowlist, &self.config.allowlist_config) {
            let allowlist = Arc::clone(allowlist);
            let shutdown = self.shutdown.child_token();
            let frequency = allowlist_config.update_frequency();
            let timeout = allowlist_config.update_timeout();
            tasks.push(runtime.spawn(async move {
                allowlist.update_periodically(shutdown, frequency, timeout).await;
            }));
        }

        let interval = sweep_interval_for(self.config.request_timeout());
        tasks.push(runtime.spawn(Arc::clone(&self.pending).run_sweeper(self.shutdown.child_token(), interval)));
        Ok(())
    }

    async fn close(&self) -> GatewayResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::Lifecycle("handler already closed".to_string()));
        }
        tracing::info!(don_id = %self.don_config.don_id, "Closing FunctionsHandler");
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Background task ended abnormally");
            }
        }

        let failed = self.pending.fail_all(ErrorCode::FatalError, SHUTDOWN_REASON);
        if failed > 0 {
            tracing::info!(failed, "Failed outstanding requests on shutdown");
        }
        Ok(())
    }
}
