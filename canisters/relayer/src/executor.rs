//! Settlement executor: verifies a deposit, prices it, checks liquidity and
//! pays out on the destination chain, at most once per transfer id.

use candid::CandidType;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::amount::Amount;
use crate::config::ChainConfig;
use crate::confirm::wait_for_receipt;
use crate::error::{ErrorCategory, RelayError, RelayResult};
use crate::evm::abi::{encode_mint_weth, is_mint_weth_for};
use crate::evm::rpc::{self, TxReceipt};
use crate::host::Host;
use crate::ledger::{self, Admission, NewTransfer};
use crate::liquidity::check_liquidity;
use crate::price::{resolve_prices, PriceQuote};
use crate::submitter::{submit_transaction, TxRequest};
use crate::types::{Action, Address, PayoutKind, TransferId, TxHash};

#[derive(Clone, Debug, PartialEq, Eq, CandidType, Deserialize, Serialize)]
pub struct SettlementRequest {
    pub recipient: String,
    pub amount: String,
    /// Canonical action name or one of the historic client tags.
    pub action: String,
    pub source_tx_hash: Option<String>,
    /// Earlier mint attempt for a `bridge-wrap` transfer, if any.
    pub destination_tx_hash: Option<String>,
    pub transfer_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedRequest {
    pub recipient: Address,
    pub amount: Amount,
    pub action: Action,
    pub source_tx_hash: Option<TxHash>,
    pub destination_tx_hash: Option<TxHash>,
    pub transfer_id: TransferId,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl SettlementRequest {
    /// Input validation; nothing here touches a chain.
    pub fn validate(&self, now_ms: u64) -> RelayResult<ValidatedRequest> {
        let action = Action::from_tag(&self.action)?;
        let recipient = Address::parse("recipient", &self.recipient)?;
        let amount = Amount::parse(&self.amount)?;
        let source_tx_hash = present(&self.source_tx_hash)
            .map(|hash| TxHash::parse("source_tx_hash", hash))
            .transpose()?;
        let destination_tx_hash = present(&self.destination_tx_hash)
            .map(|hash| TxHash::parse("destination_tx_hash", hash))
            .transpose()?;
        let transfer_id = match (&source_tx_hash, present(&self.transfer_id)) {
            (Some(hash), _) => TransferId::from_tx_hash(hash),
            (None, Some(explicit)) => TransferId::from_client(explicit),
            (None, None) => TransferId::synthesize(&recipient, &amount.to_fixed_string(), now_ms),
        };
        Ok(ValidatedRequest {
            recipient,
            amount,
            action,
            source_tx_hash,
            destination_tx_hash,
            transfer_id,
        })
    }
}

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub struct SettlementReceipt {
    pub transfer_id: String,
    pub action: Action,
    pub recipient: String,
    pub source_amount: String,
    pub tx_hash: String,
    pub receipt: TxReceipt,
    /// Destination amount with all 18 decimals.
    pub computed_amount: String,
    pub source_price: PriceQuote,
    pub destination_price: PriceQuote,
    /// True when this outcome was recorded by an earlier identical request.
    pub replayed: bool,
}

/// Wire form of a settlement outcome.
#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub struct SettlementResponse {
    pub success: bool,
    pub transfer_id: Option<String>,
    pub tx_hash: Option<String>,
    pub receipt: Option<TxReceipt>,
    pub computed_amount: Option<String>,
    pub source_price: Option<PriceQuote>,
    pub destination_price: Option<PriceQuote>,
    pub replayed: bool,
    pub error: Option<String>,
    pub category: Option<ErrorCategory>,
    pub details: Option<String>,
}

impl From<RelayResult<SettlementReceipt>> for SettlementResponse {
    fn from(result: RelayResult<SettlementReceipt>) -> Self {
        match result {
            Ok(outcome) => Self {
                success: true,
                transfer_id: Some(outcome.transfer_id),
                tx_hash: Some(outcome.tx_hash),
                receipt: Some(outcome.receipt),
                computed_amount: Some(outcome.computed_amount),
                source_price: Some(outcome.source_price),
                destination_price: Some(outcome.destination_price),
                replayed: outcome.replayed,
                error: None,
                category: None,
                details: None,
            },
            Err(err) => Self {
                success: false,
                transfer_id: None,
                tx_hash: None,
                receipt: None,
                computed_amount: None,
                source_price: None,
                destination_price: None,
                replayed: false,
                error: Some(err.to_string()),
                category: Some(err.category()),
                details: err.details(),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub struct Quote {
    pub action: Action,
    pub source_amount: String,
    pub destination_amount: String,
    pub rate: f64,
    pub source_price: PriceQuote,
    pub destination_price: PriceQuote,
}

/// `source × source_usd / destination_usd`, rejected unless positive and
/// finite.
pub fn compute_destination_amount(source: &Amount, source_usd: f64, destination_usd: f64) -> RelayResult<Amount> {
    if !(source_usd.is_finite() && source_usd > 0.0 && destination_usd.is_finite() && destination_usd > 0.0) {
        return Err(RelayError::InvalidAmount {
            reason: format!("unusable prices {} / {}", source_usd, destination_usd),
        });
    }
    Amount::from_f64(source.as_f64() * source_usd / destination_usd)
}

pub async fn quote<H: Host>(host: &H, action: Action, amount: &Amount) -> RelayResult<Quote> {
    let route = action.route();
    let (source_price, destination_price) =
        resolve_prices(host, route.source_asset, route.destination_asset).await;
    let destination = compute_destination_amount(amount, source_price.usd_price, destination_price.usd_price)?;
    Ok(Quote {
        action,
        source_amount: amount.to_fixed_string(),
        destination_amount: destination.to_fixed_string(),
        rate: source_price.usd_price / destination_price.usd_price,
        source_price,
        destination_price,
    })
}

async fn verify_source<H: Host>(host: &H, chain: &ChainConfig, tx_hash: &TxHash) -> RelayResult<()> {
    let not_confirmed = |reason: &str| RelayError::SourceNotConfirmed {
        tx_hash: tx_hash.to_string(),
        reason: reason.to_string(),
    };
    match rpc::get_transaction_receipt(host, chain.chain_id, tx_hash).await? {
        None => Err(not_confirmed("receipt not found")),
        Some(receipt) if !receipt.succeeded() => Err(not_confirmed("transaction reverted")),
        Some(_) => Ok(()),
    }
}

fn payout_call(request: &ValidatedRequest, destination: &ChainConfig, amount: &Amount) -> RelayResult<TxRequest> {
    match request.action.route().payout {
        PayoutKind::NativeTransfer => Ok(TxRequest {
            to: request.recipient,
            value: amount.wei().clone(),
            data: Vec::new(),
        }),
        PayoutKind::WrappedMint => Ok(TxRequest {
            to: destination.bridge()?,
            value: BigUint::from(0u8),
            data: encode_mint_weth(&request.recipient, amount.wei(), &request.transfer_id)?,
        }),
    }
}

/// The receipt of `request`'s earlier mint, if the claimed hash is one: a
/// successful `mintWETH` from the relayer to the bridge for this recipient
/// and transfer id. Anything else is not trusted.
async fn previous_mint<H: Host>(
    host: &H,
    request: &ValidatedRequest,
    destination: &ChainConfig,
    relayer: &Address,
) -> RelayResult<Option<(TxHash, TxReceipt)>> {
    let Some(previous) = request.destination_tx_hash else {
        return Ok(None);
    };
    let bridge = destination.bridge()?;
    let attributable = rpc::get_transaction(host, destination.chain_id, &previous)
        .await?
        .is_some_and(|tx| {
            tx.from == *relayer
                && tx.to == Some(bridge)
                && is_mint_weth_for(&tx.input, &request.recipient, &request.transfer_id)
        });
    if !attributable {
        warn!(transfer_id = %request.transfer_id, tx_hash = %previous, "ignoring destination hash that is not this transfer's mint");
        return Ok(None);
    }
    Ok(rpc::get_transaction_receipt(host, destination.chain_id, &previous)
        .await?
        .filter(TxReceipt::succeeded)
        .map(|receipt| (previous, receipt)))
}

struct Priced {
    computed_amount: String,
    source_price: PriceQuote,
    destination_price: PriceQuote,
}

impl Priced {
    fn receipt(&self, request: &ValidatedRequest, tx_hash: String, receipt: TxReceipt) -> SettlementReceipt {
        SettlementReceipt {
            transfer_id: request.transfer_id.to_string(),
            action: request.action,
            recipient: request.recipient.to_string(),
            source_amount: request.amount.to_fixed_string(),
            tx_hash,
            receipt,
            computed_amount: self.computed_amount.clone(),
            source_price: self.source_price.clone(),
            destination_price: self.destination_price.clone(),
            replayed: false,
        }
    }
}

async fn execute<H: Host>(host: &H, request: &ValidatedRequest) -> RelayResult<SettlementReceipt> {
    let route = request.action.route();
    let (source_chain, destination_chain, confirmation) = host.read(|state| {
        (
            state.config.chain(route.source_network).clone(),
            state.config.chain(route.destination_network).clone(),
            state.config.confirmation.clone(),
        )
    });

    if let Some(source_tx) = &request.source_tx_hash {
        verify_source(host, &source_chain, source_tx).await?;
    }

    let (source_price, destination_price) =
        resolve_prices(host, route.source_asset, route.destination_asset).await;
    let destination_amount =
        compute_destination_amount(&request.amount, source_price.usd_price, destination_price.usd_price)?;
    let priced = Priced {
        computed_amount: destination_amount.to_fixed_string(),
        source_price,
        destination_price,
    };
    let now = host.now_ms();
    host.write(|state| {
        ledger::record_quote(
            state,
            &request.transfer_id,
            &priced.computed_amount,
            (&priced.source_price, &priced.destination_price),
            now,
        )
    });

    let relayer = host.signer_address()?;
    if route.payout == PayoutKind::WrappedMint {
        if let Some((previous, receipt)) = previous_mint(host, request, &destination_chain, &relayer).await? {
            info!(transfer_id = %request.transfer_id, tx_hash = %previous, "mint already confirmed, resuming");
            return Ok(priced.receipt(request, previous.to_string(), receipt));
        }
    }

    check_liquidity(host, request.action, &destination_amount, &relayer)
        .await
        .ensure_sufficient()?;

    let call = payout_call(request, &destination_chain, &destination_amount)?;
    let tx_hash = submit_transaction(host, &destination_chain, &call).await?;
    let now = host.now_ms();
    host.write(|state| ledger::record_broadcast(state, &request.transfer_id, &tx_hash.to_string(), now));

    let receipt = wait_for_receipt(host, &destination_chain, &tx_hash, &confirmation).await?;
    if !receipt.succeeded() {
        return Err(RelayError::DestinationSubmitFailed {
            message: "payout transaction reverted".into(),
            tx_hash: Some(tx_hash.to_string()),
        });
    }
    info!(
        transfer_id = %request.transfer_id,
        action = %request.action,
        %tx_hash,
        amount = %priced.computed_amount,
        "settlement confirmed"
    );
    Ok(priced.receipt(request, tx_hash.to_string(), receipt))
}

/// Settles one transfer. Never retries internally.
///
/// A failure before broadcast releases the transfer id for a later retry.
/// Once a payout has (or may have) been broadcast, a failure leaves the
/// transfer unresolved until an operator reconciles it.
pub async fn settle<H: Host>(host: &H, request: &SettlementRequest) -> RelayResult<SettlementReceipt> {
    let (paused, require_source_proof, in_flight_lease_ms) = host.read(|state| {
        (
            state.config.paused,
            state.config.require_source_proof,
            state.config.in_flight_lease_ms,
        )
    });
    if paused {
        return Err(RelayError::Paused);
    }
    let request = request.validate(host.now_ms())?;
    if require_source_proof && request.source_tx_hash.is_none() {
        return Err(RelayError::SourceNotConfirmed {
            tx_hash: String::new(),
            reason: "source transaction hash required".into(),
        });
    }

    let transfer_id = request.transfer_id;
    let recipient = request.recipient.to_string();
    let source_amount = request.amount.to_fixed_string();
    let now = host.now_ms();
    let (log_id, admission) = host.write(|state| {
        let log_id = state.push_log(
            now,
            transfer_id.to_string(),
            request.action,
            recipient.clone(),
            source_amount.clone(),
        );
        let admission = ledger::admit(
            state,
            NewTransfer {
                transfer_id: &transfer_id,
                action: request.action,
                recipient: &recipient,
                source_amount: &source_amount,
            },
            now,
            in_flight_lease_ms,
        );
        (log_id, admission)
    });

    match admission {
        Err(err) => {
            host.write(|state| state.mark_log_failure(log_id, &err.to_string()));
            return Err(err);
        }
        Ok(Admission::Replay(outcome)) => {
            info!(%transfer_id, tx_hash = %outcome.tx_hash, "replaying recorded settlement");
            host.write(|state| state.mark_log_success(log_id, &outcome.tx_hash, true));
            return Ok(SettlementReceipt {
                replayed: true,
                ..outcome
            });
        }
        Ok(Admission::Proceed) => {}
    }

    let result = execute(host, &request).await;
    let now = host.now_ms();
    match &result {
        Ok(outcome) => host.write(|state| {
            ledger::record_settled(state, &transfer_id, outcome, now);
            state.mark_log_success(log_id, &outcome.tx_hash, false);
        }),
        Err(err) => {
            let attempted = match err {
                RelayError::DestinationSubmitFailed { tx_hash, .. } => tx_hash.clone(),
                _ => None,
            };
            let reason = err.to_string();
            host.write(|state| {
                let broadcast = ledger::broadcast_hash(state, &transfer_id).or(attempted);
                match broadcast {
                    Some(hash) => {
                        warn!(%transfer_id, tx_hash = %hash, error = %reason, "payout outcome unresolved");
                        ledger::record_unresolved(state, &transfer_id, &reason, Some(&hash), now);
                    }
                    None => ledger::release(state, &transfer_id),
                }
                state.mark_log_failure(log_id, &reason);
            });
        }
    }
    result
}

/// Operator resolution of an unresolved transfer. With a destination hash
/// the transfer is recorded as settled by that (successful) transaction;
/// without one the entry is dropped so the transfer can be settled again.
pub async fn resolve_transfer<H: Host>(
    host: &H,
    transfer_id: &str,
    destination_tx_hash: Option<String>,
) -> RelayResult<Option<SettlementReceipt>> {
    let id = TransferId::parse("transfer_id", transfer_id)?;
    let entry = host
        .read(|state| ledger::entry(state, &id))
        .filter(|entry| entry.status == ledger::LedgerStatus::Unresolved)
        .ok_or_else(|| RelayError::UnknownTransfer {
            transfer_id: id.to_string(),
        })?;

    let Some(raw_hash) = present(&destination_tx_hash) else {
        host.write(|state| ledger::forget(state, &id));
        info!(transfer_id = %id, "unresolved transfer released for retry");
        return Ok(None);
    };

    let tx_hash = TxHash::parse("destination_tx_hash", raw_hash)?;
    let destination = host.read(|state| state.config.chain(entry.action.route().destination_network).clone());
    let receipt = rpc::get_transaction_receipt(host, destination.chain_id, &tx_hash)
        .await?
        .filter(TxReceipt::succeeded)
        .ok_or_else(|| RelayError::DestinationSubmitFailed {
            message: "payout transaction is not a confirmed success".into(),
            tx_hash: Some(tx_hash.to_string()),
        })?;
    let (Some(computed_amount), Some(source_price), Some(destination_price)) = (
        entry.destination_amount.clone(),
        entry.source_price.clone(),
        entry.destination_price.clone(),
    ) else {
        return Err(RelayError::NeedsReconciliation {
            transfer_id: id.to_string(),
            reason: "no quote was recorded for this transfer".into(),
        });
    };

    let outcome = SettlementReceipt {
        transfer_id: entry.transfer_id.clone(),
        action: entry.action,
        recipient: entry.recipient.clone(),
        source_amount: entry.source_amount.clone(),
        tx_hash: tx_hash.to_string(),
        receipt,
        computed_amount,
        source_price,
        destination_price,
        replayed: false,
    };
    let now = host.now_ms();
    host.write(|state| ledger::record_settled(state, &id, &outcome, now));
    info!(transfer_id = %id, %tx_hash, "unresolved transfer reconciled");
    Ok(Some(outcome))
}
