//! Sender allow-list with periodic background refresh.
//!
//! Reads go to an immutable snapshot behind an `Arc`; a refresh builds a new
//! set and swaps the pointer, so readers never wait on a fetch.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::api::Address;
use crate::logging::OpTimer;
use crate::metrics;

/// Decides whether a sender may submit requests.
#[async_trait]
pub trait Allowlist: Send + Sync + fmt::Debug {
    /// Check the current snapshot. Never blocks on a refresh.
    fn allow(&self, sender: &Address) -> bool;

    /// Refresh every `frequency` until `shutdown` fires. Each fetch is bounded
    /// by `timeout`; failures keep the previous snapshot.
    async fn update_periodically(
        &self,
        shutdown: CancellationToken,
        frequency: Duration,
        timeout: Duration,
    );
}

/// Where allow-listed senders come from, typically an on-chain contract.
#[async_trait]
pub trait AllowlistSource: Send + Sync + fmt::Debug {
    /// Fetch the full set of permitted senders at a block with at least
    /// `block_confirmations` confirmations.
    async fn fetch_allowed_senders(&self, block_confirmations: u64) -> anyhow::Result<Vec<Address>>;
}

/// Allow-list backed by a periodically polled [`AllowlistSource`].
///
/// Starts empty, so every sender is rejected until the first refresh
/// succeeds.
#[derive(Debug)]
pub struct OnchainAllowlist {
    source: Arc<dyn AllowlistSource>,
    contract_address: Address,
    block_confirmations: u64,
    snapshot: RwLock<Arc<HashSet<Address>>>,
}

impl OnchainAllowlist {
    pub fn new(
        source: Arc<dyn AllowlistSource>,
        contract_address: Address,
        block_confirmations: u64,
    ) -> Self {
        Self {
            source,
            contract_address,
            block_confirmations,
            snapshot: RwLock::new(Arc::new(HashSet::new())),
        }
    }

    pub fn contract_address(&self) -> Address {
        self.contract_address
    }

    /// Number of senders in the current snapshot.
    pub fn len(&self) -> usize {
        self.snapshot.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch once and swap in the result. Returns the new snapshot size.
    pub async fn update_from_source(&self, timeout: Duration) -> anyhow::Result<usize> {
        let senders = tokio::time::timeout(
            timeout,
            self.source.fetch_allowed_senders(self.block_confirmations),
        )
        .await
        .with_context(|| format!("allow-list fetch timed out after {timeout:?}"))?
        .with_context(|| format!("failed to fetch allow-list from {}", self.contract_address))?;

        let next: HashSet<Address> = senders.into_iter().collect();
        let size = next.len();
        *self.snapshot.write() = Arc::new(next);
        Ok(size)
    }
}

#[async_trait]
impl Allowlist for OnchainAllowlist {
    fn allow(&self, sender: &Address) -> bool {
        self.snapshot.read().contains(sender)
    }

    async fn update_periodically(
        &self,
        shutdown: CancellationToken,
        frequency: Duration,
        timeout: Duration,
    ) {
        tracing::info!(
            contract = %self.contract_address,
            frequency_secs = frequency.as_secs_f64(),
            "Allow-list refresh loop started"
        );
        let mut ticker = tokio::time::interval(frequency);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let timer = OpTimer::new("allowlist", "refresh");
                    let result = tokio::select! {
                        () = shutdown.cancelled() => break,
                        result = self.update_from_source(timeout) => result,
                    };
                    timer.finish_with_result(result.as_ref());
                    metrics::record_allowlist_refresh(result.ok());
                }
            }
        }
        tracing::info!(contract = %self.contract_address, "Allow-list refresh loop stopped");
    }
}

/// Fixed sender list, for local runs and tests.
#[derive(Debug, Default)]
pub struct StaticAllowlistSource {
    senders: RwLock<Vec<Address>>,
}

impl StaticAllowlistSource {
    pub fn new(senders: Vec<Address>) -> Self {
        Self {
            senders: RwLock::new(senders),
        }
    }

    /// Replace the list returned by later fetches.
    pub fn set(&self, senders: Vec<Address>) {
        *self.senders.write() = senders;
    }
}

#[async_trait]
impl AllowlistSource for StaticAllowlistSource {
    async fn fetch_allowed_senders(&self, _block_confirmations: u64) -> anyhow::Result<Vec<Address>> {
        Ok(self.senders.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn addr(last: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        Address::from_bytes(bytes)
    }

    /// Counts fetches and can be switched into failure or hang modes.
    #[derive(Debug, Default)]
    struct FlakySource {
        senders: RwLock<Vec<Address>>,
        fail: AtomicBool,
        hang: AtomicBool,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl AllowlistSource for FlakySource {
        async fn fetch_allowed_senders(&self, _: u64) -> anyhow::Result<Vec<Address>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("rpc unavailable");
            }
            Ok(self.senders.read().clone())
        }
    }

    #[tokio::test]
    async fn test_empty_until_first_refresh() {
        let source = Arc::new(StaticAllowlistSource::new(vec![addr(1), addr(2)]));
        let allowlist = OnchainAllowlist::new(source.clone(), addr(0xaa), 1);
        assert!(!allowlist.allow(&addr(1)));

        assert_eq!(allowlist.update_from_source(Duration::from_secs(1)).await.unwrap(), 2);
        assert!(allowlist.allow(&addr(1)));
        assert!(!allowlist.allow(&addr(3)));

        source.set(vec![addr(3)]);
        allowlist.update_from_source(Duration::from_secs(1)).await.unwrap();
        assert!(!allowlist.allow(&addr(1)));
        assert!(allowlist.allow(&addr(3)));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_snapshot() {
        let source = Arc::new(FlakySource::default());
        source.senders.write().push(addr(1));
        let allowlist = OnchainAllowlist::new(source.clone(), addr(0xaa), 0);
        allowlist.update_from_source(Duration::from_secs(1)).await.unwrap();

        source.fail.store(true, Ordering::SeqCst);
        let err = allowlist.update_from_source(Duration::from_secs(1)).await.unwrap_err();
        assert!(format!("{err:#}").contains("rpc unavailable"));
        assert!(allowlist.allow(&addr(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_fetch_times_out() {
        let source = Arc::new(FlakySource::default());
        source.hang.store(true, Ordering::SeqCst);
        let allowlist = OnchainAllowlist::new(source, addr(0xaa), 0);
        let err = allowlist.update_from_source(Duration::from_secs(2)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(allowlist.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_refresh_until_cancelled() {
        let source = Arc::new(FlakySource::default());
        source.senders.write().push(addr(7));
        let allowlist = Arc::new(OnchainAllowlist::new(source.clone(), addr(0xaa), 0));
        let shutdown = CancellationToken::new();

        let task = {
            let allowlist = Arc::clone(&allowlist);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                allowlist
                    .update_periodically(shutdown, Duration::from_secs(10), Duration::from_secs(1))
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(allowlist.allow(&addr(7)));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        task.await.unwrap();
    }
}
