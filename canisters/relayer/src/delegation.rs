//! Delegation capability store.
//!
//! A delegation lets the relayer submit a user's source-leg deposit through
//! their smart account. Records are a capability cache: the stored
//! signature is checked again, against the stored capability set, every
//! time a delegated action is authorized.

use candid::CandidType;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::RelayerConfig;
use crate::error::{RelayError, RelayResult};
use crate::evm::abi::{
    function_name, selector, APPROVE_SIGNATURE, BRIDGE_SIGNATURE, COMPLETE_BRIDGE_SIGNATURE,
    DEPOSIT_SIGNATURE, MINT_WETH_SIGNATURE, TRANSFER_FROM_SIGNATURE, TRANSFER_SIGNATURE,
};
use crate::evm::rpc::parse_hex_bytes;
use crate::evm::signature::{personal_message_hash, RecoverableSignature};
use crate::host::{Clock, StateStore};
use crate::state::RelayerState;
use crate::types::Address;

/// Tolerated drift between a client's `issued_at_ms` and canister time.
const MAX_CLOCK_SKEW_MS: u64 = 5 * 60 * 1000;

const DELEGATABLE_SIGNATURES: [&str; 7] = [
    BRIDGE_SIGNATURE,
    MINT_WETH_SIGNATURE,
    COMPLETE_BRIDGE_SIGNATURE,
    DEPOSIT_SIGNATURE,
    APPROVE_SIGNATURE,
    TRANSFER_FROM_SIGNATURE,
    TRANSFER_SIGNATURE,
];

#[derive(Clone, Debug, PartialEq, Eq, CandidType, Deserialize, Serialize)]
pub struct Capability {
    pub target: String,
    pub functions: Vec<String>,
}

impl Capability {
    fn new(target: &Address, signatures: &[&str]) -> Self {
        Self {
            target: target.to_string(),
            functions: signatures
                .iter()
                .map(|signature| function_name(signature).to_string())
                .collect(),
        }
    }

    fn allowed_function(&self, call_selector: [u8; 4]) -> Option<&str> {
        self.functions.iter().map(String::as_str).find(|name| {
            DELEGATABLE_SIGNATURES
                .iter()
                .any(|signature| function_name(signature) == *name && selector(signature) == call_selector)
        })
    }
}

/// Bridge contracts on both chains plus Monad WETH.
pub fn default_capabilities(config: &RelayerConfig) -> RelayResult<Vec<Capability>> {
    let mut capabilities = vec![
        Capability::new(
            &config.monad.bridge()?,
            &[BRIDGE_SIGNATURE, MINT_WETH_SIGNATURE],
        ),
        Capability::new(
            &config.sepolia.bridge()?,
            &[COMPLETE_BRIDGE_SIGNATURE, DEPOSIT_SIGNATURE],
        ),
    ];
    if let Some(weth) = config.monad.wrapped()? {
        capabilities.push(Capability::new(
            &weth,
            &[APPROVE_SIGNATURE, TRANSFER_FROM_SIGNATURE, TRANSFER_SIGNATURE],
        ));
    }
    Ok(capabilities)
}

#[derive(Clone, Debug, PartialEq, Eq, CandidType, Deserialize, Serialize)]
pub struct Delegation {
    pub user_address: String,
    pub smart_account_address: String,
    /// Relayer account the user delegated to.
    pub delegate: String,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    pub capabilities: Vec<Capability>,
    pub is_active: bool,
    pub issued_at_ms: u64,
    pub expires_at_ms: u64,
    pub created_at_ms: u64,
}

impl Delegation {
    pub fn authorization_message(&self) -> String {
        authorization_message(
            &self.user_address,
            &self.smart_account_address,
            &self.delegate,
            &self.capabilities,
            self.issued_at_ms,
            self.expires_at_ms,
        )
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at_ms
    }

    pub fn verify_signature(&self) -> RelayResult<()> {
        let user = Address::parse("user_address", &self.user_address)?;
        let digest = personal_message_hash(self.authorization_message().as_bytes());
        let signer = RecoverableSignature::from_rsv(&self.signature)?.recover(&digest)?;
        if signer != user {
            return Err(RelayError::DelegationSignatureInvalid {
                reason: format!("signed by {}, not {}", signer, user),
            });
        }
        Ok(())
    }

    pub fn view(&self) -> DelegationView {
        DelegationView {
            user_address: self.user_address.clone(),
            smart_account_address: self.smart_account_address.clone(),
            is_active: self.is_active,
            capabilities: self.capabilities.len() as u32,
            expires_at_ms: self.expires_at_ms,
            created_at_ms: self.created_at_ms,
        }
    }
}

/// The exact text a user signs with `personal_sign` to create a delegation.
pub fn authorization_message(
    user: &str,
    smart_account: &str,
    delegate: &str,
    capabilities: &[Capability],
    issued_at_ms: u64,
    expires_at_ms: u64,
) -> String {
    let mut message = format!(
        "Authorize cross-chain relayer delegation\nUser: {}\nSmart account: {}\nDelegate: {}\nIssued at: {}\nExpires at: {}\nCapabilities:",
        user.to_ascii_lowercase(),
        smart_account.to_ascii_lowercase(),
        delegate.to_ascii_lowercase(),
        issued_at_ms,
        expires_at_ms,
    );
    for capability in capabilities {
        message.push_str(&format!(
            "\n{}: {}",
            capability.target.to_ascii_lowercase(),
            capability.functions.join(",")
        ));
    }
    message
}

pub fn revocation_message(user: &str, issued_at_ms: u64) -> String {
    format!(
        "Revoke cross-chain relayer delegation\nUser: {}\nIssued at: {}",
        user.to_ascii_lowercase(),
        issued_at_ms
    )
}

#[derive(Clone, Debug, PartialEq, Eq, CandidType, Deserialize, Serialize)]
pub struct DelegationView {
    pub user_address: String,
    pub smart_account_address: String,
    pub is_active: bool,
    pub capabilities: u32,
    pub expires_at_ms: u64,
    pub created_at_ms: u64,
}

#[derive(Clone, Debug, CandidType, Deserialize)]
pub struct RegisterDelegationRequest {
    pub user_address: String,
    pub smart_account_address: String,
    /// 65-byte `personal_sign` signature, `0x` hex.
    pub signature: String,
    pub issued_at_ms: u64,
}

#[derive(Clone, Debug, CandidType, Deserialize)]
pub struct RevokeDelegationRequest {
    pub user_address: String,
    pub signature: String,
    pub issued_at_ms: u64,
}

fn decode_signature(value: &str) -> RelayResult<Vec<u8>> {
    parse_hex_bytes(value).map_err(|_| RelayError::DelegationSignatureInvalid {
        reason: "signature is not 0x-prefixed hex".into(),
    })
}

fn check_issued_at(issued_at_ms: u64, now_ms: u64) -> RelayResult<()> {
    if issued_at_ms > now_ms.saturating_add(MAX_CLOCK_SKEW_MS) {
        return Err(RelayError::DelegationSignatureInvalid {
            reason: "issued in the future".into(),
        });
    }
    Ok(())
}

pub fn set(state: &mut RelayerState, delegation: Delegation) {
    state
        .delegations
        .insert(delegation.user_address.to_ascii_lowercase(), delegation);
}

/// Looks up a user's delegation, deactivating it if it has expired.
pub fn get(state: &mut RelayerState, user: &Address, now_ms: u64) -> Option<Delegation> {
    let delegation = state.delegations.get_mut(&user.to_string())?;
    if delegation.is_active && delegation.is_expired(now_ms) {
        delegation.is_active = false;
        info!(user = %user, "delegation expired");
    }
    Some(delegation.clone())
}

pub fn register<H>(host: &H, request: &RegisterDelegationRequest) -> RelayResult<DelegationView>
where
    H: StateStore + Clock,
{
    let user = Address::parse("user_address", &request.user_address)?;
    let smart_account = Address::parse("smart_account_address", &request.smart_account_address)?;
    let signature = decode_signature(&request.signature)?;
    let now = host.now_ms();
    check_issued_at(request.issued_at_ms, now)?;

    let (delegate, capabilities, ttl) = host.read(|state| {
        Ok::<_, RelayError>((
            state.config.relayer_address()?,
            default_capabilities(&state.config)?,
            state.config.delegation_ttl_ms,
        ))
    })?;
    let expires_at_ms = request.issued_at_ms.saturating_add(ttl);
    if expires_at_ms <= now {
        return Err(RelayError::DelegationInactive);
    }

    let delegation = Delegation {
        user_address: user.to_string(),
        smart_account_address: smart_account.to_string(),
        delegate: delegate.to_string(),
        signature,
        capabilities,
        is_active: true,
        issued_at_ms: request.issued_at_ms,
        expires_at_ms,
        created_at_ms: now,
    };
    delegation.verify_signature()?;

    let view = delegation.view();
    host.write(|state| set(state, delegation));
    info!(user = %user, smart_account = %smart_account, expires_at_ms, "delegation registered");
    Ok(view)
}

pub fn revoke<H>(host: &H, request: &RevokeDelegationRequest) -> RelayResult<bool>
where
    H: StateStore + Clock,
{
    let user = Address::parse("user_address", &request.user_address)?;
    let now = host.now_ms();
    check_issued_at(request.issued_at_ms, now)?;
    let digest = personal_message_hash(revocation_message(&user.to_string(), request.issued_at_ms).as_bytes());
    let signer = RecoverableSignature::from_rsv(&decode_signature(&request.signature)?)?.recover(&digest)?;
    if signer != user {
        return Err(RelayError::DelegationSignatureInvalid {
            reason: format!("revocation signed by {}", signer),
        });
    }

    let removed = host.write(|state| {
        let key = user.to_string();
        match state.delegations.get(&key) {
            // An older revocation must not remove a newer delegation.
            Some(existing) if existing.issued_at_ms <= request.issued_at_ms => {
                state.delegations.remove(&key);
                true
            }
            _ => false,
        }
    });
    if removed {
        info!(user = %user, "delegation revoked");
    }
    Ok(removed)
}

/// Checks that `delegation` currently permits the relayer to call `target`
/// with `call_data` on the user's behalf.
pub fn authorize(
    delegation: &Delegation,
    relayer: &Address,
    now_ms: u64,
    target: &Address,
    call_data: &[u8],
) -> RelayResult<()> {
    if !delegation.is_active || delegation.is_expired(now_ms) {
        return Err(RelayError::DelegationInactive);
    }
    delegation.verify_signature()?;
    if Address::parse("delegate", &delegation.delegate)? != *relayer {
        return Err(RelayError::DelegationSignatureInvalid {
            reason: format!("delegated to {}, not {}", delegation.delegate, relayer),
        });
    }

    let denied = |function: String| RelayError::CapabilityDenied {
        target: target.to_string(),
        function,
    };
    if call_data.len() < 4 {
        return Err(denied("plain value transfer".into()));
    }
    let call_selector = [call_data[0], call_data[1], call_data[2], call_data[3]];
    delegation
        .capabilities
        .iter()
        .filter(|capability| {
            Address::parse("capability", &capability.target).ok().as_ref() == Some(target)
        })
        .find_map(|capability| capability.allowed_function(call_selector))
        .map(|_| ())
        .ok_or_else(|| denied(format!("0x{}", hex::encode(call_selector))))
}
