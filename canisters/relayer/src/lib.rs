//! ICP relayer canister settling cross-chain transfers between Monad testnet
//! and Sepolia. A deposit on the source chain is verified, priced in USD,
//! checked against the relayer's liquidity and paid out from the relayer's
//! threshold-ECDSA account on the destination chain, at most once per
//! transfer id.

use std::collections::BTreeSet;

use candid::Principal;
use ic_cdk::api::caller;
use ic_cdk::api::management_canister::http_request::{HttpResponse, TransformArgs};
use ic_cdk::storage::{stable_restore, stable_save};
use ic_cdk::trap;
use ic_cdk_macros::{init, post_upgrade, pre_upgrade, query, update};

pub mod amount;
pub mod balance;
pub mod canister;
pub mod config;
pub mod confirm;
pub mod delegation;
pub mod error;
pub mod evm;
pub mod executor;
pub mod host;
pub mod ledger;
pub mod liquidity;
pub mod logging;
pub mod orchestrator;
pub mod price;
pub mod sponsor;
pub mod state;
pub mod status;
pub mod submitter;
pub mod types;

#[cfg(test)]
mod testing;

use crate::amount::Amount;
use crate::canister::{state_mut, state_ref, CanisterHost};
use crate::config::{ChainConfig, ConfirmationPolicy, InitArgs, LiquidityPolicy, RpcTarget};
use crate::delegation::{DelegationView, RegisterDelegationRequest, RevokeDelegationRequest};
use crate::error::{RelayError, RelayResult};
use crate::executor::{Quote, SettlementReceipt, SettlementRequest, SettlementResponse};
use crate::ledger::LedgerEntry;
use crate::orchestrator::{BridgeStatus, DelegatedSwapRequest};
use crate::state::{LogEntry, RelayerState};
use crate::status::RelayerStatus;
use crate::types::{Action, Address};

fn ensure_admin() -> RelayResult<()> {
    let caller = caller();
    state_ref(|state| {
        if state.admins.contains(&caller) {
            Ok(())
        } else {
            Err(RelayError::NotAuthorized)
        }
    })
}

fn admin_or_trap() {
    if let Err(err) = ensure_admin() {
        trap(&err.to_string());
    }
}

#[init]
fn init(args: Option<InitArgs>) {
    logging::init_tracing();
    let args = args.unwrap_or_default();
    let mut admins: BTreeSet<Principal> = args.admins.iter().copied().collect();
    admins.insert(caller());
    let config = match args.into_config() {
        Ok(config) => config,
        Err(err) => trap(&format!("invalid init args: {}", err)),
    };
    canister::install_state(RelayerState::new(admins, config));
}

#[pre_upgrade]
fn pre_upgrade() {
    let snapshot = canister::snapshot_state();
    if let Err(e) = stable_save((snapshot,)) {
        trap(&format!("failed to save state: {}", e));
    }
}

#[post_upgrade]
fn post_upgrade() {
    logging::init_tracing();
    let (snapshot,): (Option<RelayerState>,) =
        stable_restore().unwrap_or_else(|e| trap(&format!("failed to restore state: {}", e)));
    canister::install_state(snapshot.unwrap_or_default());
}

#[update]
async fn settle(request: SettlementRequest) -> SettlementResponse {
    executor::settle(&CanisterHost, &request).await.into()
}

#[update]
async fn quote(action: String, amount: String) -> Result<Quote, String> {
    let action = Action::from_tag(&action).map_err(|e| e.to_string())?;
    let amount = Amount::parse(&amount).map_err(|e| e.to_string())?;
    executor::quote(&CanisterHost, action, &amount)
        .await
        .map_err(|e| e.to_string())
}

#[update]
async fn relayer_status() -> RelayerStatus {
    status::relayer_status(&CanisterHost).await
}

#[update]
fn register_delegation(request: RegisterDelegationRequest) -> Result<DelegationView, String> {
    delegation::register(&CanisterHost, &request).map_err(|e| e.to_string())
}

#[query]
fn get_delegation(user_address: String) -> Result<Option<DelegationView>, String> {
    let user = Address::parse("user_address", &user_address).map_err(|e| e.to_string())?;
    let now = ic_cdk::api::time() / 1_000_000;
    Ok(state_mut(|state| delegation::get(state, &user, now)).map(|d| d.view()))
}

#[update]
fn revoke_delegation(request: RevokeDelegationRequest) -> Result<bool, String> {
    delegation::revoke(&CanisterHost, &request).map_err(|e| e.to_string())
}

#[update]
async fn delegated_swap(request: DelegatedSwapRequest) -> Result<BridgeStatus, String> {
    orchestrator::delegated_swap(&CanisterHost, &request)
        .await
        .map_err(|e| e.to_string())
}

#[query]
fn logs(start_after: Option<u64>, limit: u32) -> Vec<LogEntry> {
    state_ref(|state| state.log_page(start_after, limit))
}

#[query]
fn unresolved_transfers() -> Vec<LedgerEntry> {
    state_ref(ledger::unresolved)
}

#[update]
async fn resolve_transfer(
    transfer_id: String,
    destination_tx_hash: Option<String>,
) -> Result<Option<SettlementReceipt>, String> {
    ensure_admin().map_err(|e| e.to_string())?;
    executor::resolve_transfer(&CanisterHost, &transfer_id, destination_tx_hash)
        .await
        .map_err(|e| e.to_string())
}

#[query]
fn transform_price_response(args: TransformArgs) -> HttpResponse {
    canister::transform_price(args)
}

#[query]
fn get_relayer_address() -> Option<String> {
    state_ref(|state| state.config.evm_addr.clone())
}

#[update]
fn set_rpc_target(canister: Principal, network: String) {
    admin_or_trap();
    state_mut(|state| state.config.rpc_target = Some(RpcTarget { canister, network }));
}

#[update]
fn set_relayer_address(address: String) {
    admin_or_trap();
    let normalized = match Address::parse("relayer_address", &address) {
        Ok(addr) => addr.to_string(),
        Err(err) => trap(&err.to_string()),
    };
    state_mut(|state| state.config.evm_addr = Some(normalized));
}

#[update]
fn set_chain_config(chain: ChainConfig) {
    admin_or_trap();
    if let Err(err) = state_mut(|state| state.config.replace_chain(chain)) {
        trap(&err.to_string());
    }
}

#[update]
fn set_liquidity_policy(policy: LiquidityPolicy) {
    admin_or_trap();
    if policy.buffer_bps < 10_000 {
        trap("buffer_bps must be at least 10000");
    }
    state_mut(|state| state.config.liquidity = policy);
}

#[update]
fn set_confirmation_policy(policy: ConfirmationPolicy) {
    admin_or_trap();
    if policy.deadline_ms == 0 || policy.initial_backoff_ms == 0 {
        trap("confirmation deadline and backoff must be positive");
    }
    state_mut(|state| state.config.confirmation = policy);
}

#[update]
fn pause(flag: bool) {
    admin_or_trap();
    state_mut(|state| state.config.paused = flag);
}
