//! Single-writer transaction submission, one FIFO lane per chain.
//!
//! Every payout from the relayer account on a chain goes through that
//! chain's lane, so nonce assignment never races. Lane bookkeeping lives in
//! canister state: a message that traps while holding the lane cannot
//! release it, so turns expire after `LanePolicy::lease_ms`.

use std::collections::BTreeSet;

use candid::CandidType;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{ChainConfig, LanePolicy};
use crate::error::{RelayError, RelayResult};
use crate::evm::keccak::keccak256;
use crate::evm::rpc;
use crate::evm::tx::{plan_fees, Eip1559Tx};
use crate::host::{ChainRpc, Clock, StateStore, TxSigner};
use crate::types::{Address, TxHash};

#[derive(Clone, Debug, Default, PartialEq, Eq, CandidType, Deserialize, Serialize)]
pub struct SubmissionLane {
    pub next_ticket: u64,
    pub serving: u64,
    pub held: bool,
    pub turn_started_ms: u64,
    /// Waiters that gave up; skipped when their turn comes.
    pub abandoned: BTreeSet<u64>,
    /// Next nonce after our last successful broadcast.
    pub nonce: Option<u64>,
}

impl SubmissionLane {
    fn take_ticket(&mut self, now_ms: u64) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        if ticket == self.serving && !self.held {
            self.turn_started_ms = now_ms;
        }
        ticket
    }

    fn advance(&mut self, now_ms: u64) {
        self.held = false;
        self.serving += 1;
        while self.abandoned.remove(&self.serving) {
            self.serving += 1;
        }
        self.turn_started_ms = now_ms;
    }

    fn try_enter(&mut self, ticket: u64, now_ms: u64, lease_ms: u64) -> bool {
        if self.serving != ticket && now_ms.saturating_sub(self.turn_started_ms) > lease_ms {
            warn!(
                ticket = self.serving,
                held = self.held,
                "submission turn expired, skipping"
            );
            self.advance(now_ms);
        }
        if self.serving == ticket && !self.held {
            self.held = true;
            self.turn_started_ms = now_ms;
            return true;
        }
        false
    }

    fn release(&mut self, ticket: u64, now_ms: u64) {
        if self.serving == ticket && self.held {
            self.advance(now_ms);
        }
    }

    fn abandon(&mut self, ticket: u64, now_ms: u64) {
        if ticket == self.serving {
            self.advance(now_ms);
        } else if ticket > self.serving {
            self.abandoned.insert(ticket);
        }
    }

    pub fn is_idle(&self) -> bool {
        !self.held && self.serving >= self.next_ticket
    }
}

/// Holds a chain's lane; the turn passes on drop.
pub struct LaneGuard<'a, H: StateStore + Clock> {
    host: &'a H,
    chain_id: u64,
    ticket: u64,
}

impl<H: StateStore + Clock> Drop for LaneGuard<'_, H> {
    fn drop(&mut self) {
        let now = self.host.now_ms();
        let (chain_id, ticket) = (self.chain_id, self.ticket);
        self.host.write(|state| {
            if let Some(lane) = state.lanes.get_mut(&chain_id) {
                lane.release(ticket, now);
            }
        });
    }
}

pub async fn acquire_lane<'a, H>(
    host: &'a H,
    chain_id: u64,
    policy: &LanePolicy,
) -> RelayResult<LaneGuard<'a, H>>
where
    H: StateStore + Clock,
{
    let started = host.now_ms();
    let ticket = host.write(|state| state.lanes.entry(chain_id).or_default().take_ticket(started));
    loop {
        let now = host.now_ms();
        let entered = host.write(|state| {
            state
                .lanes
                .entry(chain_id)
                .or_default()
                .try_enter(ticket, now, policy.lease_ms)
        });
        if entered {
            return Ok(LaneGuard {
                host,
                chain_id,
                ticket,
            });
        }
        if now.saturating_sub(started) >= policy.wait_ms {
            host.write(|state| {
                if let Some(lane) = state.lanes.get_mut(&chain_id) {
                    lane.abandon(ticket, now);
                }
            });
            return Err(RelayError::SubmitterBusy { chain_id });
        }
        host.sleep_ms(policy.poll_ms.max(1)).await;
    }
}

/// A call to be signed and broadcast by the relayer account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxRequest {
    pub to: Address,
    pub value: BigUint,
    pub data: Vec<u8>,
}

async fn next_nonce<H>(host: &H, chain_id: u64, from: &Address) -> RelayResult<u64>
where
    H: ChainRpc + StateStore,
{
    let pending = rpc::get_transaction_count(host, chain_id, from).await?;
    let cached = host.read(|state| state.lanes.get(&chain_id).and_then(|lane| lane.nonce));
    Ok(cached.map_or(pending, |cached| cached.max(pending)))
}

fn set_cached_nonce<H: StateStore>(host: &H, chain_id: u64, nonce: Option<u64>) {
    host.write(|state| state.lanes.entry(chain_id).or_default().nonce = nonce);
}

/// Signs and broadcasts `request` on `chain` from the relayer account.
///
/// Failures before the broadcast are returned unchanged and mean nothing
/// left the relayer. A failed broadcast is reported as
/// `DestinationSubmitFailed` carrying the locally computed hash, since the
/// node may still have accepted the transaction.
pub async fn submit_transaction<H>(host: &H, chain: &ChainConfig, request: &TxRequest) -> RelayResult<TxHash>
where
    H: ChainRpc + TxSigner + Clock + StateStore,
{
    let chain_id = chain.chain_id;
    let (lanes, fees) = host.read(|state| (state.config.lanes.clone(), state.config.fees.clone()));
    let _lane = acquire_lane(host, chain_id, &lanes).await?;

    let from = host.signer_address()?;
    let estimate =
        rpc::estimate_gas(host, chain_id, &from, &request.to, &request.value, &request.data).await?;
    let base_fee = rpc::base_fee(host, chain_id).await?;
    let priority_fee = rpc::max_priority_fee(host, chain_id).await?;
    let plan = plan_fees(
        &estimate,
        fees.min_gas_limit,
        &base_fee,
        &priority_fee,
        fees.max_fee_multiplier,
        fees.priority_multiplier,
    )?;
    let nonce = next_nonce(host, chain_id, &from).await?;

    let tx = Eip1559Tx {
        chain_id,
        nonce,
        max_priority_fee_per_gas: plan.max_priority_fee_per_gas,
        max_fee_per_gas: plan.max_fee_per_gas,
        gas_limit: plan.gas_limit,
        to: request.to,
        value: request.value.clone(),
        data: request.data.clone(),
    };
    let signature = host.sign_prehash(&tx.signing_hash()).await?;
    let raw = tx.encode_signed(&signature);
    let local_hash = TxHash::from_bytes(keccak256(&raw));

    match rpc::send_raw_transaction(host, chain_id, &raw).await {
        Ok(tx_hash) => {
            set_cached_nonce(host, chain_id, Some(nonce + 1));
            info!(chain_id, nonce, %tx_hash, to = %request.to, "transaction broadcast");
            Ok(tx_hash)
        }
        Err(err) => {
            set_cached_nonce(host, chain_id, None);
            warn!(chain_id, nonce, tx_hash = %local_hash, error = %err, "broadcast failed");
            Err(RelayError::DestinationSubmitFailed {
                message: err.to_string(),
                tx_hash: Some(local_hash.to_string()),
            })
        }
    }
}
