//! Canister-side host: EVM RPC canister calls, threshold ECDSA, HTTPS price
//! outcalls and the persisted relayer state.

use std::cell::RefCell;

use candid::{CandidType, Nat};
use ic_cdk::api::call::call_with_payment128;
use ic_cdk::api::management_canister::ecdsa::{
    sign_with_ecdsa, EcdsaCurve, EcdsaKeyId, SignWithEcdsaArgument, SignWithEcdsaResponse,
};
use ic_cdk::api::management_canister::http_request::{
    http_request, CanisterHttpRequestArgument, HttpMethod, HttpResponse, TransformArgs, TransformContext,
};
use ic_cdk::api::management_canister::main::raw_rand;
use ic_cdk::api::time;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RpcTarget;
use crate::error::{RelayError, RelayResult};
use crate::evm::rpc::RpcService;
use crate::evm::signature::RecoverableSignature;
use crate::host::{ChainRpc, Clock, PriceFeed, StateStore, TxSigner};
use crate::price::parse_simple_price;
use crate::state::RelayerState;
use crate::types::Address;

const RPC_CALL_CYCLES: u128 = 2_000_000_000_000;
const RPC_RESPONSE_ESTIMATE: u64 = 64 * 1024;
const PRICE_OUTCALL_CYCLES: u128 = 50_000_000_000;
const PRICE_RESPONSE_LIMIT: u64 = 2 * 1024;

thread_local! {
    static STATE: RefCell<Option<RelayerState>> = RefCell::new(None);
}

pub fn install_state(state: RelayerState) {
    STATE.with(|cell| *cell.borrow_mut() = Some(state));
}

pub fn snapshot_state() -> Option<RelayerState> {
    STATE.with(|cell| cell.borrow().clone())
}

pub fn state_mut<T>(f: impl FnOnce(&mut RelayerState) -> T) -> T {
    STATE.with(|cell| {
        let mut guard = cell.borrow_mut();
        let state = guard.as_mut().expect("relayer state not initialized");
        f(state)
    })
}

pub fn state_ref<T>(f: impl FnOnce(&RelayerState) -> T) -> T {
    STATE.with(|cell| {
        let guard = cell.borrow();
        let state = guard.as_ref().expect("relayer state not initialized");
        f(state)
    })
}

#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
struct RpcCanisterError {
    code: i64,
    message: String,
}

fn transport_error((code, message): (ic_cdk::api::call::RejectionCode, String)) -> RelayError {
    RelayError::RpcTransportError {
        code: format!("{:?}", code),
        message,
    }
}

fn rpc_target() -> RelayResult<RpcTarget> {
    state_ref(|state| state.config.rpc_target.clone()).ok_or(RelayError::ConfigurationMissing {
        field: "rpc_target".into(),
    })
}

/// Unwraps a JSON-RPC response body into its `result` member.
fn json_rpc_result(body: &str) -> RelayResult<Value> {
    let value: Value = serde_json::from_str(body).map_err(|err| RelayError::JsonError {
        message: err.to_string(),
    })?;
    if let Some(error) = value.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32_000);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(RelayError::RpcError { code, message });
    }
    value
        .get("result")
        .cloned()
        .ok_or_else(|| RelayError::mismatch("result"))
}

/// Strips headers so replicas agree on the price response.
pub fn transform_price(args: TransformArgs) -> HttpResponse {
    HttpResponse {
        status: args.response.status,
        headers: Vec::new(),
        body: args.response.body,
    }
}

pub struct CanisterHost;

impl ChainRpc for CanisterHost {
    async fn request(&self, service: &RpcService, payload: Value) -> RelayResult<Value> {
        let target = rpc_target()?;
        let payload_str = serde_json::to_string(&payload).map_err(|err| RelayError::JsonError {
            message: err.to_string(),
        })?;
        let (response,): (Result<String, RpcCanisterError>,) = call_with_payment128(
            target.canister,
            "request",
            (service.clone(), payload_str, RPC_RESPONSE_ESTIMATE),
            RPC_CALL_CYCLES,
        )
        .await
        .map_err(transport_error)?;
        let body = response.map_err(|err| RelayError::RpcError {
            code: err.code,
            message: err.message,
        })?;
        json_rpc_result(&body)
    }
}

impl TxSigner for CanisterHost {
    fn signer_address(&self) -> RelayResult<Address> {
        state_ref(|state| state.config.relayer_address())
    }

    async fn sign_prehash(&self, prehash: &[u8; 32]) -> RelayResult<RecoverableSignature> {
        let (key_name, derivation_path) = state_ref(|state| {
            (
                state.config.ecdsa_key_name.clone(),
                state.config.ecdsa_derivation_path.clone(),
            )
        });
        let signer = self.signer_address()?;
        let arg = SignWithEcdsaArgument {
            message_hash: prehash.to_vec(),
            derivation_path,
            key_id: EcdsaKeyId {
                curve: EcdsaCurve::Secp256k1,
                name: key_name,
            },
        };
        let (SignWithEcdsaResponse { signature },) = sign_with_ecdsa(arg).await.map_err(|(code, message)| {
            RelayError::SigningFailed {
                message: format!("{:?}: {}", code, message),
            }
        })?;
        RecoverableSignature::from_compact_for_signer(prehash, &signature, &signer)
    }
}

impl PriceFeed for CanisterHost {
    async fn fetch_usd(&self, feed_id: &str) -> RelayResult<f64> {
        let base = state_ref(|state| state.config.price_api_url.clone());
        let request = CanisterHttpRequestArgument {
            url: format!("{}?ids={}&vs_currencies=usd", base, feed_id),
            max_response_bytes: Some(PRICE_RESPONSE_LIMIT),
            method: HttpMethod::GET,
            headers: Vec::new(),
            body: None,
            transform: Some(TransformContext::from_name(
                "transform_price_response".to_string(),
                Vec::new(),
            )),
        };
        let (response,) = http_request(request, PRICE_OUTCALL_CYCLES)
            .await
            .map_err(|(code, message)| RelayError::PriceFeed {
                message: format!("{:?}: {}", code, message),
            })?;
        if response.status < Nat::from(200u16) || response.status >= Nat::from(300u16) {
            return Err(RelayError::PriceFeed {
                message: format!("status {}", response.status),
            });
        }
        parse_simple_price(&response.body, feed_id).ok_or_else(|| RelayError::PriceFeed {
            message: format!("no usd price for {}", feed_id),
        })
    }
}

impl Clock for CanisterHost {
    fn now_ms(&self) -> u64 {
        time() / 1_000_000
    }

    /// Each `raw_rand` round trip yields for at least one round.
    async fn sleep_ms(&self, ms: u64) {
        let until = self.now_ms().saturating_add(ms);
        while self.now_ms() < until {
            if raw_rand().await.is_err() {
                break;
            }
        }
    }
}

impl StateStore for CanisterHost {
    fn read<T>(&self, f: impl FnOnce(&RelayerState) -> T) -> T {
        state_ref(f)
    }

    fn write<T>(&self, f: impl FnOnce(&mut RelayerState) -> T) -> T {
        state_mut(f)
    }
}
