use num_bigint::BigUint;
use tracing::warn;

use crate::config::ChainConfig;
use crate::error::RelayResult;
use crate::evm::rpc;
use crate::host::ChainRpc;
use crate::types::{Address, Network};

/// A balance read for liquidity decisions. An unreachable chain reads as
/// zero so it can never pass a liquidity check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BalanceReading {
    pub network: Network,
    pub wei: BigUint,
    pub reachable: bool,
}

pub async fn get_native_balance<R: ChainRpc>(
    rpc: &R,
    chain: &ChainConfig,
    address: &Address,
) -> RelayResult<BigUint> {
    rpc::get_balance(rpc, chain.chain_id, address).await
}

pub async fn read_balance<R: ChainRpc>(rpc: &R, chain: &ChainConfig, address: &Address) -> BalanceReading {
    match get_native_balance(rpc, chain, address).await {
        Ok(wei) => BalanceReading {
            network: chain.network,
            wei,
            reachable: true,
        },
        Err(err) => {
            warn!(chain_id = chain.chain_id, error = %err, "balance read failed, treating as zero");
            BalanceReading {
                network: chain.network,
                wei: BigUint::from(0u8),
                reachable: false,
            }
        }
    }
}
