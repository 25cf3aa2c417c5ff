//! Balance sufficiency checks run before any payout is submitted.

use candid::{CandidType, Nat};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::balance::{read_balance, BalanceReading};
use crate::config::LiquidityPolicy;
use crate::error::{RelayError, RelayResult};
use crate::host::{ChainRpc, StateStore};
use crate::types::{Action, Address, Network, PayoutKind};

const BPS_DENOMINATOR: u32 = 10_000;
const MESSAGE_DECIMALS: usize = 6;

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub struct LiquiditySnapshot {
    pub network: Network,
    pub symbol: String,
    pub required_wei: Nat,
    pub available_wei: Nat,
    pub sufficient: bool,
    pub reachable: bool,
    /// Largest payout the current balance covers, for payout-side snapshots.
    pub max_payable_wei: Option<Nat>,
}

impl LiquiditySnapshot {
    fn shortfall(&self) -> RelayError {
        let render = |wei: &Nat| Amount::from_nat(wei).display(MESSAGE_DECIMALS);
        RelayError::InsufficientLiquidity {
            network: self.network.to_string(),
            symbol: self.symbol.clone(),
            required: render(&self.required_wei),
            available: render(&self.available_wei),
            max_payable: self.max_payable_wei.as_ref().map(render),
        }
    }
}

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub struct LiquidityReport {
    pub source: LiquiditySnapshot,
    pub destination: LiquiditySnapshot,
}

impl LiquidityReport {
    pub fn sufficient(&self) -> bool {
        self.source.sufficient && self.destination.sufficient
    }

    /// Destination shortfalls are reported first since they carry a
    /// suggested smaller amount.
    pub fn ensure_sufficient(&self) -> RelayResult<()> {
        if !self.destination.sufficient {
            return Err(self.destination.shortfall());
        }
        if !self.source.sufficient {
            return Err(self.source.shortfall());
        }
        Ok(())
    }
}

/// `ceil(amount * buffer_bps / 10_000)`.
pub fn required_with_buffer(amount: &BigUint, buffer_bps: u32) -> BigUint {
    let scaled = amount * BigUint::from(buffer_bps);
    let denominator = BigUint::from(BPS_DENOMINATOR);
    (scaled + &denominator - BigUint::from(1u8)) / denominator
}

/// Inverse of [`required_with_buffer`], rounded down.
pub fn max_payable(available: &BigUint, buffer_bps: u32) -> BigUint {
    if buffer_bps == 0 {
        return available.clone();
    }
    available * BigUint::from(BPS_DENOMINATOR) / BigUint::from(buffer_bps)
}

pub fn payout_snapshot(reading: &BalanceReading, symbol: &str, payout: &BigUint, buffer_bps: u32) -> LiquiditySnapshot {
    let required = required_with_buffer(payout, buffer_bps);
    LiquiditySnapshot {
        network: reading.network,
        symbol: symbol.to_string(),
        sufficient: reading.reachable && reading.wei >= required,
        reachable: reading.reachable,
        max_payable_wei: Some(Nat::from(max_payable(&reading.wei, buffer_bps))),
        required_wei: Nat::from(required),
        available_wei: Nat::from(reading.wei.clone()),
    }
}

pub fn reserve_snapshot(reading: &BalanceReading, symbol: &str, reserve: &BigUint) -> LiquiditySnapshot {
    LiquiditySnapshot {
        network: reading.network,
        symbol: symbol.to_string(),
        sufficient: reading.reachable && &reading.wei >= reserve,
        reachable: reading.reachable,
        max_payable_wei: None,
        required_wei: Nat::from(reserve.clone()),
        available_wei: Nat::from(reading.wei.clone()),
    }
}

/// Evaluates both legs of `action` for a payout of `destination_amount`.
/// Native payouts need the buffered amount on the destination chain; a
/// wrapped mint only needs gas there. The source chain must always hold the
/// gas floor.
pub fn evaluate(
    action: Action,
    destination_amount: &Amount,
    source: &BalanceReading,
    destination: &BalanceReading,
    policy: &LiquidityPolicy,
) -> LiquidityReport {
    let route = action.route();
    let source_symbol = route.source_asset.priced_as().symbol();
    let destination_symbol = match route.destination_network {
        Network::Monad => "MON",
        Network::Sepolia => "ETH",
    };
    let destination = match route.payout {
        PayoutKind::NativeTransfer => payout_snapshot(
            destination,
            destination_symbol,
            destination_amount.wei(),
            policy.buffer_bps,
        ),
        PayoutKind::WrappedMint => {
            reserve_snapshot(destination, destination_symbol, &policy.mint_gas_reserve_wei.0)
        }
    };
    LiquidityReport {
        source: reserve_snapshot(source, source_symbol, &policy.source_gas_floor_wei.0),
        destination,
    }
}

pub async fn check_liquidity<H>(
    host: &H,
    action: Action,
    destination_amount: &Amount,
    relayer: &Address,
) -> LiquidityReport
where
    H: ChainRpc + StateStore,
{
    let route = action.route();
    let (source_chain, destination_chain, policy) = host.read(|state| {
        (
            state.config.chain(route.source_network).clone(),
            state.config.chain(route.destination_network).clone(),
            state.config.liquidity.clone(),
        )
    });
    let source = read_balance(host, &source_chain, relayer).await;
    let destination = read_balance(host, &destination_chain, relayer).await;
    evaluate(action, destination_amount, &source, &destination, &policy)
}
