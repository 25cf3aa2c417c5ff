//! Delegated source-leg submission through an ERC-4337 bundler.
//!
//! The relayer builds a v0.6 `UserOperation` that makes the user's smart
//! account call the source bridge, signs it as the account's delegate, and
//! hands it to the bundler configured for the source chain.

use num_bigint::BigUint;
use serde_json::{json, Value};
use tracing::info;

use crate::amount::Amount;
use crate::config::{BundlerConfig, ChainConfig, ConfirmationPolicy};
use crate::confirm::poll_with_backoff;
use crate::delegation::{self, Delegation};
use crate::error::{RelayError, RelayResult};
use crate::evm::abi::{
    address_word, decode_uint, encode_bridge, encode_deposit, encode_execute, encode_get_nonce, uint_word,
};
use crate::evm::keccak::keccak256;
use crate::evm::rpc::{self, envelope, parse_receipt, to_hex_prefixed, uint_to_hex, RpcApi, RpcService, TxReceipt};
use crate::evm::signature::personal_message_hash;
use crate::evm::tx::plan_fees;
use crate::host::Host;
use crate::types::{Action, Address, Network, TxHash};

const CALL_GAS_LIMIT: u64 = 100_000;
const VERIFICATION_GAS_LIMIT: u64 = 100_000;
const PRE_VERIFICATION_GAS: u64 = 21_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: BigUint,
    pub init_code: Vec<u8>,
    pub call_data: Vec<u8>,
    pub call_gas_limit: BigUint,
    pub verification_gas_limit: BigUint,
    pub pre_verification_gas: BigUint,
    pub max_fee_per_gas: BigUint,
    pub max_priority_fee_per_gas: BigUint,
    pub paymaster_and_data: Vec<u8>,
    pub signature: Vec<u8>,
}

impl UserOperation {
    /// EntryPoint v0.6 `getUserOpHash`.
    pub fn hash(&self, entry_point: &Address, chain_id: u64) -> RelayResult<[u8; 32]> {
        let mut packed = Vec::with_capacity(32 * 10);
        packed.extend_from_slice(&address_word(&self.sender));
        packed.extend_from_slice(&uint_word(&self.nonce)?);
        packed.extend_from_slice(&keccak256(&self.init_code));
        packed.extend_from_slice(&keccak256(&self.call_data));
        packed.extend_from_slice(&uint_word(&self.call_gas_limit)?);
        packed.extend_from_slice(&uint_word(&self.verification_gas_limit)?);
        packed.extend_from_slice(&uint_word(&self.pre_verification_gas)?);
        packed.extend_from_slice(&uint_word(&self.max_fee_per_gas)?);
        packed.extend_from_slice(&uint_word(&self.max_priority_fee_per_gas)?);
        packed.extend_from_slice(&keccak256(&self.paymaster_and_data));

        let mut outer = Vec::with_capacity(32 * 3);
        outer.extend_from_slice(&keccak256(&packed));
        outer.extend_from_slice(&address_word(entry_point));
        outer.extend_from_slice(&uint_word(&BigUint::from(chain_id))?);
        Ok(keccak256(&outer))
    }

    pub fn to_json(&self) -> Value {
        json!({
            "sender": self.sender.to_string(),
            "nonce": uint_to_hex(&self.nonce),
            "initCode": to_hex_prefixed(&self.init_code),
            "callData": to_hex_prefixed(&self.call_data),
            "callGasLimit": uint_to_hex(&self.call_gas_limit),
            "verificationGasLimit": uint_to_hex(&self.verification_gas_limit),
            "preVerificationGas": uint_to_hex(&self.pre_verification_gas),
            "maxFeePerGas": uint_to_hex(&self.max_fee_per_gas),
            "maxPriorityFeePerGas": uint_to_hex(&self.max_priority_fee_per_gas),
            "paymasterAndData": to_hex_prefixed(&self.paymaster_and_data),
            "signature": to_hex_prefixed(&self.signature),
        })
    }
}

fn bundler_service(bundler: &BundlerConfig) -> RpcService {
    RpcService::Custom(RpcApi {
        url: bundler.url.clone(),
        headers: None,
    })
}

async fn account_nonce<H: Host>(host: &H, chain_id: u64, entry_point: &Address, sender: &Address) -> RelayResult<BigUint> {
    let word = rpc::eth_call(host, chain_id, entry_point, &encode_get_nonce(sender)).await?;
    Ok(decode_uint(&word))
}

/// Source-leg call a delegated deposit makes for `action`.
pub fn deposit_call(
    action: Action,
    source: &ChainConfig,
    destination: &ChainConfig,
    recipient: &Address,
) -> RelayResult<(Address, Vec<u8>)> {
    let data = match action.route().source_network {
        Network::Monad => encode_bridge(destination.chain_id, recipient),
        Network::Sepolia => encode_deposit(),
    };
    Ok((source.bridge()?, data))
}

/// Sends one user operation and waits for the bundler's receipt.
pub async fn submit_user_operation<H: Host>(
    host: &H,
    chain: &ChainConfig,
    sender: &Address,
    target: &Address,
    value: &BigUint,
    inner: &[u8],
    policy: &ConfirmationPolicy,
) -> RelayResult<TxReceipt> {
    let bundler = chain
        .bundler
        .clone()
        .ok_or_else(|| RelayError::ConfigurationMissing {
            field: format!("{} bundler", chain.network),
        })?;
    let entry_point = Address::parse("entry_point", &bundler.entry_point)?;
    let service = bundler_service(&bundler);
    let fees = host.read(|state| state.config.fees.clone());

    let base_fee = rpc::base_fee(host, chain.chain_id).await?;
    let priority_fee = rpc::max_priority_fee(host, chain.chain_id).await?;
    let plan = plan_fees(
        &BigUint::from(CALL_GAS_LIMIT),
        fees.min_gas_limit,
        &base_fee,
        &priority_fee,
        fees.max_fee_multiplier,
        fees.priority_multiplier,
    )?;

    let mut operation = UserOperation {
        sender: *sender,
        nonce: account_nonce(host, chain.chain_id, &entry_point, sender).await?,
        init_code: Vec::new(),
        call_data: encode_execute(target, value, inner)?,
        call_gas_limit: plan.gas_limit,
        verification_gas_limit: BigUint::from(VERIFICATION_GAS_LIMIT),
        pre_verification_gas: BigUint::from(PRE_VERIFICATION_GAS),
        max_fee_per_gas: plan.max_fee_per_gas,
        max_priority_fee_per_gas: plan.max_priority_fee_per_gas,
        paymaster_and_data: Vec::new(),
        signature: Vec::new(),
    };

    if bundler.sponsor {
        let payload = envelope(
            "pm_sponsorUserOperation",
            json!([operation.to_json(), entry_point.to_string()]),
        );
        let sponsored = host.request(&service, payload).await?;
        let paymaster = sponsored
            .get("paymasterAndData")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::mismatch("paymasterAndData"))?;
        operation.paymaster_and_data = rpc::parse_hex_bytes(paymaster)?;
    }

    let op_hash = operation.hash(&entry_point, chain.chain_id)?;
    let signature = host.sign_prehash(&personal_message_hash(&op_hash)).await?;
    operation.signature = signature.to_rsv().to_vec();

    let payload = envelope(
        "eth_sendUserOperation",
        json!([operation.to_json(), entry_point.to_string()]),
    );
    let sent = host.request(&service, payload).await?;
    let user_op_hash = sent
        .as_str()
        .ok_or_else(|| RelayError::mismatch("user operation hash"))?
        .to_string();
    info!(chain_id = chain.chain_id, sender = %sender, user_op_hash = %user_op_hash, "user operation sent");

    let service = &service;
    let op_hash = user_op_hash.as_str();
    let receipt = poll_with_backoff(host, policy, chain.network, op_hash, move || {
        let payload = envelope("eth_getUserOperationReceipt", json!([op_hash]));
        async move {
            let value = host.request(service, payload).await?;
            if value.is_null() {
                return Ok(None);
            }
            let receipt = value
                .get("receipt")
                .ok_or_else(|| RelayError::mismatch("receipt"))?;
            parse_receipt(receipt).map(Some)
        }
    })
    .await?;
    Ok(receipt)
}

/// Runs the source leg of `action` through the user's smart account.
/// The delegation is re-verified against the exact call first.
pub async fn submit_delegated_deposit<H: Host>(
    host: &H,
    delegation: &Delegation,
    action: Action,
    amount: &Amount,
    recipient: &Address,
) -> RelayResult<TxHash> {
    let route = action.route();
    let (source, destination, policy, relayer) = host.read(|state| {
        (
            state.config.chain(route.source_network).clone(),
            state.config.chain(route.destination_network).clone(),
            state.config.confirmation.clone(),
            state.config.relayer_address(),
        )
    });
    let relayer = relayer?;
    let (target, data) = deposit_call(action, &source, &destination, recipient)?;
    delegation::authorize(delegation, &relayer, host.now_ms(), &target, &data)?;

    let sender = Address::parse("smart_account_address", &delegation.smart_account_address)?;
    let receipt = submit_user_operation(host, &source, &sender, &target, amount.wei(), &data, &policy).await?;
    let tx_hash = TxHash::parse("transaction", &receipt.transaction_hash)?;
    if !receipt.succeeded() {
        return Err(RelayError::SourceNotConfirmed {
            tx_hash: tx_hash.to_string(),
            reason: "delegated deposit reverted".into(),
        });
    }
    Ok(tx_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::signature::RecoverableSignature;
    use crate::host::{Clock, StateStore};
    use crate::testing::MockHost;

    fn sample() -> UserOperation {
        UserOperation {
            sender: Address::from_bytes([0xaa; 20]),
            nonce: BigUint::from(3u8),
            init_code: Vec::new(),
            call_data: encode_deposit(),
            call_gas_limit: BigUint::from(CALL_GAS_LIMIT),
            verification_gas_limit: BigUint::from(VERIFICATION_GAS_LIMIT),
            pre_verification_gas: BigUint::from(PRE_VERIFICATION_GAS),
            max_fee_per_gas: BigUint::from(2_000_000_000u64),
            max_priority_fee_per_gas: BigUint::from(1_000_000_000u64),
            paymaster_and_data: Vec::new(),
            signature: Vec::new(),
        }
    }

    #[test]
    fn hash_binds_chain_and_ignores_signature() {
        let entry_point = Address::parse("entry_point", crate::config::DEFAULT_ENTRY_POINT).unwrap();
        let op = sample();
        let mut signed = op.clone();
        signed.signature = vec![1, 2, 3];
        assert_eq!(op.hash(&entry_point, 1).unwrap(), signed.hash(&entry_point, 1).unwrap());
        assert_ne!(op.hash(&entry_point, 1).unwrap(), op.hash(&entry_point, 2).unwrap());
    }

    #[test]
    fn deposit_call_targets_source_bridge() {
        let monad = ChainConfig::monad_testnet();
        let sepolia = ChainConfig::sepolia();
        let recipient = Address::from_bytes([0x01; 20]);
        let (target, data) = deposit_call(Action::SwapForward, &monad, &sepolia, &recipient).unwrap();
        assert_eq!(target, monad.bridge().unwrap());
        assert_eq!(data, encode_bridge(sepolia.chain_id, &recipient));
        let (target, data) = deposit_call(Action::SwapReverse, &sepolia, &monad, &recipient).unwrap();
        assert_eq!(target, sepolia.bridge().unwrap());
        assert_eq!(data, encode_deposit());
    }

    #[tokio::test]
    async fn user_operation_is_signed_by_relayer_and_sponsored() {
        let host = MockHost::with_bundlers();
        let chain = host.read(|state| state.config.monad.clone());
        let sender = Address::from_bytes([0xaa; 20]);
        let target = chain.bridge().unwrap();
        let receipt = submit_user_operation(
            &host,
            &chain,
            &sender,
            &target,
            &BigUint::from(5u8),
            &encode_deposit(),
            &ConfirmationPolicy::default(),
        )
        .await
        .unwrap();
        assert!(receipt.succeeded());

        let sent = host.user_operations();
        assert_eq!(sent.len(), 1);
        let op = &sent[0];
        assert_eq!(op["paymasterAndData"], "0xabcd");
        assert_eq!(op["nonce"], "0x0");

        // Rebuild the hash from the submitted JSON fields to check the signature.
        let field = |name: &str| rpc::uint_from_hex(op[name].as_str().unwrap()).unwrap();
        let bytes = |name: &str| rpc::parse_hex_bytes(op[name].as_str().unwrap()).unwrap();
        let rebuilt = UserOperation {
            sender,
            nonce: field("nonce"),
            init_code: bytes("initCode"),
            call_data: bytes("callData"),
            call_gas_limit: field("callGasLimit"),
            verification_gas_limit: field("verificationGasLimit"),
            pre_verification_gas: field("preVerificationGas"),
            max_fee_per_gas: field("maxFeePerGas"),
            max_priority_fee_per_gas: field("maxPriorityFeePerGas"),
            paymaster_and_data: bytes("paymasterAndData"),
            signature: Vec::new(),
        };
        let entry_point = Address::parse("entry_point", crate::config::DEFAULT_ENTRY_POINT).unwrap();
        let digest = personal_message_hash(&rebuilt.hash(&entry_point, chain.chain_id).unwrap());
        let signature = RecoverableSignature::from_rsv(&bytes("signature")).unwrap();
        assert_eq!(signature.recover(&digest).unwrap(), host.relayer_address());
    }
}
