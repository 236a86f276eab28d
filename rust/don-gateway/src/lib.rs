//! DON Gateway - routing core for requests served by a decentralized oracle
//! network.
//!
//! Users submit signed messages. The gateway checks them, fans each one out
//! to every member of the DON, and delivers a single result to the caller
//! once `F + 1` members return matching responses.
//!
//! # Architecture
//!
//! ```text
//! user message ─► Handler::handle_user_message
//!                   ├─ field / DON id / method checks
//!                   ├─ Allowlist ─► signature ─► RateLimiter
//!                   ├─ PendingRequests::register
//!                   └─ don::fan_out ─► Don::send_to_node (all members)
//!
//! node message ─► Handler::handle_node_message
//!                   └─ PendingRequests::record_response
//!                        └─ ResponseAggregator ─► callback (exactly once)
//! ```
//!
//! Background tasks started by [`Handler::start`] refresh the allow-list and
//! expire requests past their deadline. [`Handler::close`] stops them and
//! fails whatever is still pending.

pub mod aggregation;
pub mod allowlist;
pub mod api;
pub mod config;
pub mod don;
pub mod error;
pub mod handler;
pub mod logging;
pub mod metrics;
pub mod pending;
pub mod rate_limit;

pub use aggregation::{AggregationDecision, MatchingPayloadAggregator, Quorum, ResponseAggregator};
pub use allowlist::{Allowlist, AllowlistSource, OnchainAllowlist, StaticAllowlistSource};
pub use api::{Address, ErrorCode, Message, MessageBody, UserCallbackPayload};
pub use config::{DonConfig, GatewayConfig, HandlerConfig, NodeConfig};
pub use don::{Don, LocalDon, NodeConnection};
pub use error::{GatewayError, GatewayResult};
pub use handler::{FunctionsHandler, Handler};
pub use pending::{PendingRequests, RequestKey};
pub use rate_limit::{RateLimiter, RateLimiterConfig};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
