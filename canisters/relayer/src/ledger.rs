//! Idempotency ledger keyed by transfer id.
//!
//! Consulted before any payout: a settled transfer replays its stored
//! outcome, an in-flight one is refused, and one whose payout may or may not
//! have gone out waits for an operator.

use candid::CandidType;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};
use crate::executor::SettlementReceipt;
use crate::price::PriceQuote;
use crate::state::RelayerState;
use crate::types::{Action, TransferId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, CandidType, Deserialize, Serialize)]
pub enum LedgerStatus {
    InFlight,
    Settled,
    /// The payout was broadcast, or may have been, without a confirmed
    /// outcome. Source funds have moved; needs manual reconciliation.
    Unresolved,
}

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub struct LedgerEntry {
    pub transfer_id: String,
    pub action: Action,
    pub recipient: String,
    pub source_amount: String,
    pub status: LedgerStatus,
    pub started_at_ms: u64,
    pub updated_at_ms: u64,
    pub destination_amount: Option<String>,
    pub source_price: Option<PriceQuote>,
    pub destination_price: Option<PriceQuote>,
    pub destination_tx_hash: Option<String>,
    pub outcome: Option<SettlementReceipt>,
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Admission {
    Proceed,
    Replay(SettlementReceipt),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, CandidType, Deserialize, Serialize)]
pub struct LedgerCounters {
    pub settled: u64,
    pub in_flight: u64,
    pub unresolved: u64,
}

pub struct NewTransfer<'a> {
    pub transfer_id: &'a TransferId,
    pub action: Action,
    pub recipient: &'a str,
    pub source_amount: &'a str,
}

pub fn admit(
    state: &mut RelayerState,
    transfer: NewTransfer<'_>,
    now_ms: u64,
    in_flight_lease_ms: u64,
) -> RelayResult<Admission> {
    let key = transfer.transfer_id.to_string();
    if let Some(entry) = state.ledger.get_mut(&key) {
        if entry.action != transfer.action
            || entry.recipient != transfer.recipient
            || entry.source_amount != transfer.source_amount
        {
            return Err(RelayError::TransferConflict { transfer_id: key });
        }
        return match entry.status {
            LedgerStatus::Settled => match &entry.outcome {
                Some(outcome) => Ok(Admission::Replay(outcome.clone())),
                None => Err(RelayError::NeedsReconciliation {
                    transfer_id: key,
                    reason: "settled without a recorded outcome".into(),
                }),
            },
            LedgerStatus::InFlight
                if now_ms.saturating_sub(entry.updated_at_ms) <= in_flight_lease_ms =>
            {
                Err(RelayError::SettlementInProgress { transfer_id: key })
            }
            LedgerStatus::InFlight => {
                entry.status = LedgerStatus::Unresolved;
                entry.updated_at_ms = now_ms;
                entry.reason = Some("settlement was interrupted".into());
                Err(RelayError::NeedsReconciliation {
                    transfer_id: key,
                    reason: "settlement was interrupted".into(),
                })
            }
            LedgerStatus::Unresolved => Err(RelayError::NeedsReconciliation {
                transfer_id: key,
                reason: entry
                    .reason
                    .clone()
                    .unwrap_or_else(|| "payout outcome unknown".into()),
            }),
        };
    }

    state.ledger.insert(
        key.clone(),
        LedgerEntry {
            transfer_id: key,
            action: transfer.action,
            recipient: transfer.recipient.to_string(),
            source_amount: transfer.source_amount.to_string(),
            status: LedgerStatus::InFlight,
            started_at_ms: now_ms,
            updated_at_ms: now_ms,
            destination_amount: None,
            source_price: None,
            destination_price: None,
            destination_tx_hash: None,
            outcome: None,
            reason: None,
        },
    );
    Ok(Admission::Proceed)
}

fn with_entry(state: &mut RelayerState, transfer_id: &TransferId, f: impl FnOnce(&mut LedgerEntry)) {
    if let Some(entry) = state.ledger.get_mut(&transfer_id.to_string()) {
        f(entry);
    }
}

pub fn record_quote(
    state: &mut RelayerState,
    transfer_id: &TransferId,
    destination_amount: &str,
    prices: (&PriceQuote, &PriceQuote),
    now_ms: u64,
) {
    with_entry(state, transfer_id, |entry| {
        entry.destination_amount = Some(destination_amount.to_string());
        entry.source_price = Some(prices.0.clone());
        entry.destination_price = Some(prices.1.clone());
        entry.updated_at_ms = now_ms;
    });
}

pub fn record_broadcast(state: &mut RelayerState, transfer_id: &TransferId, tx_hash: &str, now_ms: u64) {
    with_entry(state, transfer_id, |entry| {
        entry.destination_tx_hash = Some(tx_hash.to_string());
        entry.updated_at_ms = now_ms;
    });
}

pub fn record_settled(state: &mut RelayerState, transfer_id: &TransferId, outcome: &SettlementReceipt, now_ms: u64) {
    with_entry(state, transfer_id, |entry| {
        entry.status = LedgerStatus::Settled;
        entry.destination_tx_hash = Some(outcome.tx_hash.clone());
        entry.outcome = Some(outcome.clone());
        entry.reason = None;
        entry.updated_at_ms = now_ms;
    });
}

pub fn record_unresolved(
    state: &mut RelayerState,
    transfer_id: &TransferId,
    reason: &str,
    tx_hash: Option<&str>,
    now_ms: u64,
) {
    with_entry(state, transfer_id, |entry| {
        entry.status = LedgerStatus::Unresolved;
        if let Some(hash) = tx_hash {
            entry.destination_tx_hash = Some(hash.to_string());
        }
        entry.reason = Some(reason.to_string());
        entry.updated_at_ms = now_ms;
    });
}

/// Drops an in-flight entry whose settlement failed before anything was
/// broadcast, so the transfer can be retried.
pub fn release(state: &mut RelayerState, transfer_id: &TransferId) {
    let key = transfer_id.to_string();
    if matches!(state.ledger.get(&key), Some(entry) if entry.status == LedgerStatus::InFlight) {
        state.ledger.remove(&key);
    }
}

pub fn broadcast_hash(state: &RelayerState, transfer_id: &TransferId) -> Option<String> {
    state
        .ledger
        .get(&transfer_id.to_string())
        .and_then(|entry| entry.destination_tx_hash.clone())
}

pub fn entry(state: &RelayerState, transfer_id: &TransferId) -> Option<LedgerEntry> {
    state.ledger.get(&transfer_id.to_string()).cloned()
}

pub fn forget(state: &mut RelayerState, transfer_id: &TransferId) -> bool {
    state.ledger.remove(&transfer_id.to_string()).is_some()
}

pub fn unresolved(state: &RelayerState) -> Vec<LedgerEntry> {
    state
        .ledger
        .values()
        .filter(|entry| entry.status == LedgerStatus::Unresolved)
        .cloned()
        .collect()
}

pub fn counters(state: &RelayerState) -> LedgerCounters {
    let mut counters = LedgerCounters::default();
    for entry in state.ledger.values() {
        match entry.status {
            LedgerStatus::Settled => counters.settled += 1,
            LedgerStatus::InFlight => counters.in_flight += 1,
            LedgerStatus::Unresolved => counters.unresolved += 1,
        }
    }
    counters
}
