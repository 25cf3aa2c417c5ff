//! Relayer status snapshot: balances, prices and health.

use candid::{CandidType, Nat};
use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::balance::{read_balance, BalanceReading};
use crate::config::ChainConfig;
use crate::host::Host;
use crate::ledger::{self, LedgerCounters};
use crate::price::{resolve_price, PriceQuote};
use crate::types::{Asset, Network};

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub struct ChainStatus {
    pub network: Network,
    pub chain_id: u64,
    pub symbol: String,
    pub balance_wei: Nat,
    pub balance: String,
    pub reachable: bool,
    pub usd_value: f64,
    pub above_gas_floor: bool,
}

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub struct RelayerStatus {
    pub relayer_address: Option<String>,
    pub paused: bool,
    /// Both chains reachable and funded above the gas floor.
    pub healthy: bool,
    pub chains: Vec<ChainStatus>,
    pub prices: Vec<PriceQuote>,
    pub ledger: LedgerCounters,
    pub timestamp_ms: u64,
}

fn chain_status(chain: &ChainConfig, reading: &BalanceReading, usd_price: f64, gas_floor: &Nat) -> ChainStatus {
    let amount = Amount::from_wei(reading.wei.clone());
    ChainStatus {
        network: chain.network,
        chain_id: chain.chain_id,
        symbol: chain.symbol.clone(),
        balance_wei: amount.to_nat(),
        balance: amount.to_fixed_string(),
        reachable: reading.reachable,
        usd_value: amount.as_f64() * usd_price,
        above_gas_floor: reading.reachable && reading.wei >= gas_floor.0,
    }
}

pub async fn relayer_status<H: Host>(host: &H) -> RelayerStatus {
    let (relayer, paused, monad, sepolia, gas_floor, counters) = host.read(|state| {
        (
            state.config.relayer_address(),
            state.config.paused,
            state.config.monad.clone(),
            state.config.sepolia.clone(),
            state.config.liquidity.source_gas_floor_wei.clone(),
            ledger::counters(state),
        )
    });
    let mon_price = resolve_price(host, Asset::Mon).await;
    let eth_price = resolve_price(host, Asset::Eth).await;

    let chains = match &relayer {
        Ok(address) => {
            let monad_reading = read_balance(host, &monad, address).await;
            let sepolia_reading = read_balance(host, &sepolia, address).await;
            vec![
                chain_status(&monad, &monad_reading, mon_price.usd_price, &gas_floor),
                chain_status(&sepolia, &sepolia_reading, eth_price.usd_price, &gas_floor),
            ]
        }
        Err(_) => [(&monad, mon_price.usd_price), (&sepolia, eth_price.usd_price)]
            .into_iter()
            .map(|(chain, price)| {
                let reading = BalanceReading {
                    network: chain.network,
                    wei: Default::default(),
                    reachable: false,
                };
                chain_status(chain, &reading, price, &gas_floor)
            })
            .collect(),
    };

    RelayerStatus {
        relayer_address: relayer.ok().map(|address| address.to_string()),
        paused,
        healthy: chains.iter().all(|chain| chain.above_gas_floor),
        chains,
        prices: vec![mon_price, eth_price],
        ledger: counters,
        timestamp_ms: host.now_ms(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Clock, StateStore};
    use crate::price::QuoteSource;
    use crate::testing::MockHost;

    #[tokio::test]
    async fn healthy_when_both_chains_are_funded() {
        let host = MockHost::new();
        host.set_price("ethereum", Ok(4000.0));
        let relayer = host.relayer_address();
        let (monad, sepolia) = host.read(|state| (state.config.monad.chain_id, state.config.sepolia.chain_id));
        host.set_balance(monad, &relayer, Amount::parse("100").unwrap().wei().clone());
        host.set_balance(sepolia, &relayer, Amount::parse("0.5").unwrap().wei().clone());

        let status = relayer_status(&host).await;
        assert!(status.healthy);
        assert!(status.paused);
        assert_eq!(status.chains[1].balance, "0.500000000000000000");
        assert_eq!(status.chains[1].usd_value, 2000.0);
        assert_eq!(status.prices[0].source, QuoteSource::Fallback);
        assert_eq!(status.prices[1].source, QuoteSource::Live);
    }

    #[tokio::test]
    async fn unreachable_chain_reads_as_empty_and_unhealthy() {
        let host = MockHost::new();
        let relayer = host.relayer_address();
        let (monad, sepolia) = host.read(|state| (state.config.monad.chain_id, state.config.sepolia.chain_id));
        host.set_balance(monad, &relayer, Amount::parse("100").unwrap().wei().clone());
        host.set_balance(sepolia, &relayer, Amount::parse("1").unwrap().wei().clone());
        host.set_unreachable(sepolia, true);

        let status = relayer_status(&host).await;
        assert!(!status.healthy);
        assert!(!status.chains[1].reachable);
        assert_eq!(status.chains[1].balance_wei, Nat::from(0u8));
    }

    #[tokio::test]
    async fn low_gas_balance_is_unhealthy() {
        let host = MockHost::new();
        let relayer = host.relayer_address();
        let (monad, sepolia) = host.read(|state| (state.config.monad.chain_id, state.config.sepolia.chain_id));
        host.set_balance(monad, &relayer, Amount::parse("100").unwrap().wei().clone());
        host.set_balance(sepolia, &relayer, Amount::parse("0.001").unwrap().wei().clone());
        let status = relayer_status(&host).await;
        assert!(status.chains[0].above_gas_floor);
        assert!(!status.chains[1].above_gas_floor);
        assert!(!status.healthy);
    }
}
