//! Bounded exponential-backoff polling for transaction inclusion.

use std::future::Future;

use tracing::debug;

use crate::config::{ChainConfig, ConfirmationPolicy};
use crate::error::{RelayError, RelayResult};
use crate::evm::rpc::{self, TxReceipt};
use crate::host::{ChainRpc, Clock};
use crate::types::{Network, TxHash};

/// Calls `poll` until it yields a value or the policy deadline passes.
/// Poll errors count as "not yet"; only the deadline ends the wait.
pub async fn poll_with_backoff<C, T, F, Fut>(
    clock: &C,
    policy: &ConfirmationPolicy,
    network: Network,
    tx_hash: &str,
    mut poll: F,
) -> RelayResult<T>
where
    C: Clock,
    F: FnMut() -> Fut,
    Fut: Future<Output = RelayResult<Option<T>>>,
{
    let started = clock.now_ms();
    let max_backoff = policy.max_backoff_ms.max(1);
    let mut backoff = policy.initial_backoff_ms.clamp(1, max_backoff);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match poll().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(err) => debug!(%network, tx_hash, attempt, error = %err, "poll failed"),
        }

        let waited = clock.now_ms().saturating_sub(started);
        if waited >= policy.deadline_ms {
            return Err(RelayError::ConfirmationTimeout {
                network: network.to_string(),
                tx_hash: tx_hash.to_string(),
                waited_ms: waited,
            });
        }
        clock
            .sleep_ms(backoff.min(policy.deadline_ms - waited))
            .await;
        backoff = backoff
            .saturating_mul(u64::from(policy.backoff_factor.max(1)))
            .min(max_backoff);
    }
}

/// Waits for `tx_hash` to be mined. A reverted receipt is returned as-is;
/// callers decide what a revert means.
pub async fn wait_for_receipt<H>(
    host: &H,
    chain: &ChainConfig,
    tx_hash: &TxHash,
    policy: &ConfirmationPolicy,
) -> RelayResult<TxReceipt>
where
    H: ChainRpc + Clock,
{
    let chain_id = chain.chain_id;
    poll_with_backoff(host, policy, chain.network, &tx_hash.to_string(), || {
        rpc::get_transaction_receipt(host, chain_id, tx_hash)
    })
    .await
}
