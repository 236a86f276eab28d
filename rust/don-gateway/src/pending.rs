//! Pending-request table.
//!
//! Each accepted user request owns one entry, keyed by `(sender, message_id)`,
//! holding the caller's callback and the node responses collected so far.
//! An entry leaves the table exactly once, by one of:
//!
//! - quorum reached or proven unreachable ([`PendingRequests::record_response`])
//! - fan-out failure ([`PendingRequests::evict`]), no callback
//! - deadline passed ([`PendingRequests::expire`])
//! - shutdown ([`PendingRequests::fail_all`])
//!
//! Removal and the decision to deliver happen under one lock, so concurrent
//! paths racing on the same key cannot both deliver. The callback itself is
//! sent after the lock is released.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::aggregation::{AggregationDecision, Quorum, ResponseAggregator};
use crate::api::{ErrorCode, Message, UserCallbackPayload};
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::{self, RequestTimer};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Identity of an in-flight request. Senders compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    pub sender: String,
    pub message_id: String,
}

impl RequestKey {
    pub fn new(sender: &str, message_id: impl Into<String>) -> Self {
        Self {
            sender: sender.to_ascii_lowercase(),
            message_id: message_id.into(),
        }
    }

    pub fn from_message(msg: &Message) -> Self {
        Self::new(&msg.body.sender, msg.body.message_id.clone())
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sender, self.message_id)
    }
}

/// Caps on in-flight requests. Zero disables a cap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingLimits {
    pub global: usize,
    pub per_sender: usize,
}

/// Result of feeding one node response into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// No entry for the key; the response was dropped.
    Unmatched,
    /// Stored; the entry now holds this many responses.
    Recorded(usize),
    /// The entry was resolved and its callback delivered with this code.
    Resolved(ErrorCode),
}

struct PendingRequest {
    callback: oneshot::Sender<UserCallbackPayload>,
    responses: BTreeMap<String, Message>,
    deadline: Instant,
    timer: RequestTimer,
}

#[derive(Default)]
struct TableState {
    entries: HashMap<RequestKey, PendingRequest>,
    per_sender: HashMap<String, usize>,
    /// Set by `fail_all`; no entry is accepted afterwards.
    closed: bool,
}

impl TableState {
    fn remove(&mut self, key: &RequestKey) -> Option<PendingRequest> {
        let entry = self.entries.remove(key)?;
        if let Some(count) = self.per_sender.get_mut(&key.sender) {
            *count -= 1;
            if *count == 0 {
                self.per_sender.remove(&key.sender);
            }
        }
        Some(entry)
    }
}

/// Concurrent table of requests awaiting quorum.
pub struct PendingRequests {
    quorum: Quorum,
    aggregator: Arc<dyn ResponseAggregator>,
    limits: PendingLimits,
    state: Mutex<TableState>,
}

impl fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequests")
            .field("quorum", &self.quorum)
            .field("aggregator", &self.aggregator)
            .field("limits", &self.limits)
            .field("len", &self.len())
            .finish()
    }
}

impl PendingRequests {
    pub fn new(quorum: Quorum, aggregator: Arc<dyn ResponseAggregator>, limits: PendingLimits) -> Self {
        Self {
            quorum,
            aggregator,
            limits,
            state: Mutex::new(TableState::default()),
        }
    }

    pub fn quorum(&self) -> Quorum {
        self.quorum
    }

    /// Add an entry. Fails without side effects on a duplicate key, when a
    /// cap is reached, or once the table is closed; the callback is dropped
    /// in that case.
    pub fn register(
        &self,
        key: RequestKey,
        callback: oneshot::Sender<UserCallbackPayload>,
        deadline: Instant,
    ) -> GatewayResult<()> {
        let mut state = self.state.lock();

        if state.closed {
            return Err(GatewayError::Lifecycle("pending request table is closed".to_string()));
        }
        if state.entries.contains_key(&key) {
            return Err(GatewayError::DuplicateRequest {
                sender: key.sender,
                message_id: key.message_id,
            });
        }
        if self.limits.global > 0 && state.entries.len() >= self.limits.global {
            return Err(GatewayError::TooManyPendingRequests {
                scope: "global",
                limit: self.limits.global,
            });
        }
        if self.limits.per_sender > 0
            && state.per_sender.get(&key.sender).copied().unwrap_or(0) >= self.limits.per_sender
        {
            return Err(GatewayError::TooManyPendingRequests {
                scope: "per-user",
                limit: self.limits.per_sender,
            });
        }

        *state.per_sender.entry(key.sender.clone()).or_insert(0) += 1;
        state.entries.insert(
            key,
            PendingRequest {
                callback,
                responses: BTreeMap::new(),
                deadline,
                timer: RequestTimer::start(),
            },
        );
        metrics::set_pending_requests(state.entries.len());
        Ok(())
    }

    /// Store a node's response and resolve the entry if the aggregator
    /// reaches a decision. A later response from the same node replaces its
    /// earlier one.
    pub fn record_response(&self, key: &RequestKey, node: &str, response: Message) -> ResponseOutcome {
        let (entry, payload) = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(key) else {
                return ResponseOutcome::Unmatched;
            };
            entry.responses.insert(node.to_ascii_lowercase(), response);

            let payload = match self.aggregator.aggregate(self.quorum, &entry.responses) {
                AggregationDecision::Pending => {
                    return ResponseOutcome::Recorded(entry.responses.len());
                }
                AggregationDecision::Agreed(msg) => UserCallbackPayload::success(msg),
                AggregationDecision::Failed(reason) => {
                    UserCallbackPayload::failure(ErrorCode::NodeResponseEncodingError, reason)
                }
            };
            let Some(entry) = state.remove(key) else {
                return ResponseOutcome::Unmatched;
            };
            metrics::set_pending_requests(state.entries.len());
            (entry, payload)
        };

        let code = payload.err_code;
        deliver(key, entry, payload);
        ResponseOutcome::Resolved(code)
    }

    /// Remove an entry without delivering anything. Returns whether the
    /// entry was still present.
    pub fn evict(&self, key: &RequestKey) -> bool {
        let mut state = self.state.lock();
        let removed = state.remove(key).is_some();
        metrics::set_pending_requests(state.entries.len());
        removed
    }

    /// Resolve every entry whose deadline is at or before `now` with
    /// [`ErrorCode::RequestTimeoutError`]. Returns how many expired.
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<(RequestKey, PendingRequest)> = {
            let mut state = self.state.lock();
            let keys: Vec<RequestKey> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();
            let expired = keys
                .into_iter()
                .filter_map(|key| state.remove(&key).map(|entry| (key, entry)))
                .collect();
            metrics::set_pending_requests(state.entries.len());
            expired
        };

        let count = expired.len();
        for (key, entry) in expired {
            let received = entry.responses.len();
            deliver(
                &key,
                entry,
                UserCallbackPayload::failure(
                    ErrorCode::RequestTimeoutError,
                    format!(
                        "request timed out with {received} of {} required responses",
                        self.quorum.threshold()
                    ),
                ),
            );
        }
        count
    }

    /// Resolve every entry with the given failure and close the table to
    /// new registrations. Returns how many entries there were.
    pub fn fail_all(&self, code: ErrorCode, reason: &str) -> usize {
        let drained: Vec<(RequestKey, PendingRequest)> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.per_sender.clear();
            let drained = state.entries.drain().collect();
            metrics::set_pending_requests(0);
            drained
        };

        let count = drained.len();
        for (key, entry) in drained {
            deliver(&key, entry, UserCallbackPayload::failure(code, reason));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Responses collected for `key`, if it is pending.
    pub fn response_count(&self, key: &RequestKey) -> Option<usize> {
        self.state.lock().entries.get(key).map(|e| e.responses.len())
    }

    /// Expire overdue entries every `interval` until `shutdown` fires.
    pub async fn run_sweeper(self: Arc<Self>, shutdown: CancellationToken, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::debug!("Pending request sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let expired = self.expire(Instant::now());
                    if expired > 0 {
                        tracing::debug!(expired, remaining = self.len(), "Expired pending requests");
                    }
                }
            }
        }
    }
}

/// Sweep often enough that a request outlives its timeout by at most a
/// quarter of it, within fixed bounds.
pub fn sweep_interval_for(request_timeout: Duration) -> Duration {
    (request_timeout / 4).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)
}

fn deliver(key: &RequestKey, entry: PendingRequest, payload: UserCallbackPayload) {
    let code = payload.err_code;
    entry.timer.complete(code);
    if entry.callback.send(payload).is_err() {
        tracing::debug!(request = %key, %code, "Caller dropped before result was delivered");
    }
}
