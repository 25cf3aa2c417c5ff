//! Seams between the settlement protocol and the environment it runs in.
//!
//! The canister wires these to the EVM RPC canister, threshold ECDSA, HTTPS
//! outcalls and stable state; tests wire them to in-memory fakes.

use serde_json::Value;

use crate::error::RelayResult;
use crate::evm::rpc::RpcService;
use crate::evm::signature::RecoverableSignature;
use crate::state::RelayerState;
use crate::types::Address;

#[allow(async_fn_in_trait)]
pub trait ChainRpc {
    /// Sends one JSON-RPC request and returns its `result` member.
    async fn request(&self, service: &RpcService, payload: Value) -> RelayResult<Value>;
}

#[allow(async_fn_in_trait)]
pub trait TxSigner {
    fn signer_address(&self) -> RelayResult<Address>;

    async fn sign_prehash(&self, prehash: &[u8; 32]) -> RelayResult<RecoverableSignature>;
}

#[allow(async_fn_in_trait)]
pub trait PriceFeed {
    /// USD price for a feed id such as `ethereum`. Implementations bound the
    /// request time; callers treat any error as "use the fallback".
    async fn fetch_usd(&self, feed_id: &str) -> RelayResult<f64>;
}

#[allow(async_fn_in_trait)]
pub trait Clock {
    fn now_ms(&self) -> u64;

    async fn sleep_ms(&self, ms: u64);
}

pub trait StateStore {
    fn read<T>(&self, f: impl FnOnce(&RelayerState) -> T) -> T;

    fn write<T>(&self, f: impl FnOnce(&mut RelayerState) -> T) -> T;
}

pub trait Host: ChainRpc + TxSigner + PriceFeed + Clock + StateStore {}

impl<T> Host for T where T: ChainRpc + TxSigner + PriceFeed + Clock + StateStore {}
