//! Typed wrappers over raw Ethereum JSON-RPC methods.

use std::sync::atomic::{AtomicU64, Ordering};

use candid::{CandidType, Nat};
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{RelayError, RelayResult};
use crate::host::ChainRpc;
use crate::types::{Address, TxHash};

static JSON_RPC_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug, PartialEq, Eq, CandidType, Deserialize, Serialize)]
pub struct RpcHeader {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, CandidType, Deserialize, Serialize)]
pub struct RpcApi {
    pub url: String,
    pub headers: Option<Vec<RpcHeader>>,
}

/// Mirrors the EVM RPC canister's service selector.
#[derive(Clone, Debug, PartialEq, Eq, CandidType, Deserialize, Serialize)]
pub enum RpcService {
    Chain(u64),
    Custom(RpcApi),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, CandidType, Deserialize, Serialize)]
pub enum ReceiptStatus {
    Success,
    Reverted,
}

#[derive(Clone, Debug, PartialEq, Eq, CandidType, Deserialize, Serialize)]
pub struct TxReceipt {
    pub transaction_hash: String,
    pub block_number: u64,
    pub gas_used: Nat,
    pub status: ReceiptStatus,
}

impl TxReceipt {
    pub fn succeeded(&self) -> bool {
        self.status == ReceiptStatus::Success
    }
}

/// The parts of `eth_getTransactionByHash` needed to attribute a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainTransaction {
    pub from: Address,
    /// `None` for contract creation.
    pub to: Option<Address>,
    pub input: Vec<u8>,
}

fn next_json_rpc_id() -> u64 {
    JSON_RPC_ID.fetch_add(1, Ordering::Relaxed)
}

pub fn envelope(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": next_json_rpc_id(),
        "method": method,
        "params": params,
    })
}

pub fn to_hex_prefixed(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

pub fn uint_to_hex(value: &BigUint) -> String {
    format!("0x{}", value.to_str_radix(16))
}

pub fn parse_hex_bytes(value: &str) -> RelayResult<Vec<u8>> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .ok_or_else(|| RelayError::HexDecodeFailed {
            value: trimmed.to_string(),
        })?;
    // Quantities may have an odd number of nibbles.
    let padded;
    let digits = if digits.len() % 2 == 1 {
        padded = format!("0{}", digits);
        padded.as_str()
    } else {
        digits
    };
    hex::decode(digits).map_err(|_| RelayError::HexDecodeFailed {
        value: trimmed.to_string(),
    })
}

pub fn uint_from_hex(value: &str) -> RelayResult<BigUint> {
    if value == "0x" {
        return Ok(BigUint::from(0u8));
    }
    Ok(BigUint::from_bytes_be(&parse_hex_bytes(value)?))
}

pub fn u64_from_hex(field: &str, value: &str) -> RelayResult<u64> {
    uint_from_hex(value)?
        .to_u64()
        .ok_or_else(|| RelayError::NumberOutOfRange {
            field: field.to_string(),
        })
}

fn as_hex_str<'a>(value: &'a Value, expected: &str) -> RelayResult<&'a str> {
    value.as_str().ok_or_else(|| RelayError::mismatch(expected))
}

pub async fn get_balance<R: ChainRpc>(rpc: &R, chain_id: u64, address: &Address) -> RelayResult<BigUint> {
    let payload = envelope("eth_getBalance", json!([address.to_string(), "latest"]));
    let value = rpc.request(&RpcService::Chain(chain_id), payload).await?;
    uint_from_hex(as_hex_str(&value, "hex string")?)
}

pub async fn get_transaction_count<R: ChainRpc>(
    rpc: &R,
    chain_id: u64,
    address: &Address,
) -> RelayResult<u64> {
    let payload = envelope(
        "eth_getTransactionCount",
        json!([address.to_string(), "pending"]),
    );
    let value = rpc.request(&RpcService::Chain(chain_id), payload).await?;
    u64_from_hex("nonce", as_hex_str(&value, "hex string")?)
}

pub async fn max_priority_fee<R: ChainRpc>(rpc: &R, chain_id: u64) -> RelayResult<BigUint> {
    let payload = envelope("eth_maxPriorityFeePerGas", json!([]));
    let value = rpc.request(&RpcService::Chain(chain_id), payload).await?;
    uint_from_hex(as_hex_str(&value, "hex string")?)
}

pub async fn base_fee<R: ChainRpc>(rpc: &R, chain_id: u64) -> RelayResult<BigUint> {
    let payload = envelope("eth_getBlockByNumber", json!(["latest", false]));
    let value = rpc.request(&RpcService::Chain(chain_id), payload).await?;
    match value {
        Value::Object(map) => match map.get("baseFeePerGas").and_then(Value::as_str) {
            Some(base_fee) => uint_from_hex(base_fee),
            None => Err(RelayError::mismatch("baseFeePerGas")),
        },
        _ => Err(RelayError::mismatch("block object")),
    }
}

pub async fn estimate_gas<R: ChainRpc>(
    rpc: &R,
    chain_id: u64,
    from: &Address,
    to: &Address,
    value: &BigUint,
    data: &[u8],
) -> RelayResult<BigUint> {
    let payload = envelope(
        "eth_estimateGas",
        json!([{
            "from": from.to_string(),
            "to": to.to_string(),
            "value": uint_to_hex(value),
            "data": to_hex_prefixed(data),
        }]),
    );
    match rpc.request(&RpcService::Chain(chain_id), payload).await {
        Ok(value) => uint_from_hex(as_hex_str(&value, "hex string")?).map_err(|err| match err {
            RelayError::HexDecodeFailed { value } => RelayError::GasEstimateFailed { message: value },
            other => other,
        }),
        Err(RelayError::RpcError { message, .. }) => Err(RelayError::GasEstimateFailed { message }),
        Err(other) => Err(other),
    }
}

pub async fn eth_call<R: ChainRpc>(
    rpc: &R,
    chain_id: u64,
    to: &Address,
    data: &[u8],
) -> RelayResult<Vec<u8>> {
    let payload = envelope(
        "eth_call",
        json!([
            {
                "to": to.to_string(),
                "data": to_hex_prefixed(data),
            },
            "latest"
        ]),
    );
    let value = rpc.request(&RpcService::Chain(chain_id), payload).await?;
    parse_hex_bytes(as_hex_str(&value, "hex string")?)
}

pub async fn send_raw_transaction<R: ChainRpc>(
    rpc: &R,
    chain_id: u64,
    raw_tx: &[u8],
) -> RelayResult<TxHash> {
    let payload = envelope("eth_sendRawTransaction", json!([to_hex_prefixed(raw_tx)]));
    let value = rpc.request(&RpcService::Chain(chain_id), payload).await?;
    TxHash::parse("transaction", as_hex_str(&value, "transaction hash")?)
}

/// `None` while the transaction is unknown or not yet mined.
pub async fn get_transaction_receipt<R: ChainRpc>(
    rpc: &R,
    chain_id: u64,
    tx_hash: &TxHash,
) -> RelayResult<Option<TxReceipt>> {
    let payload = envelope("eth_getTransactionReceipt", json!([tx_hash.to_string()]));
    let value = rpc.request(&RpcService::Chain(chain_id), payload).await?;
    if value.is_null() {
        return Ok(None);
    }
    parse_receipt(&value).map(Some)
}

pub async fn get_transaction<R: ChainRpc>(
    rpc: &R,
    chain_id: u64,
    tx_hash: &TxHash,
) -> RelayResult<Option<ChainTransaction>> {
    let payload = envelope("eth_getTransactionByHash", json!([tx_hash.to_string()]));
    let value = rpc.request(&RpcService::Chain(chain_id), payload).await?;
    if value.is_null() {
        return Ok(None);
    }
    parse_transaction(&value).map(Some)
}

pub fn parse_transaction(value: &Value) -> RelayResult<ChainTransaction> {
    let from = value
        .get("from")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::mismatch("from"))?;
    let to = match value.get("to").and_then(Value::as_str) {
        Some(to) => Some(Address::parse("to", to)?),
        None => None,
    };
    let input = value
        .get("input")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::mismatch("input"))?;
    Ok(ChainTransaction {
        from: Address::parse("from", from)?,
        to,
        input: parse_hex_bytes(input)?,
    })
}

pub fn parse_receipt(value: &Value) -> RelayResult<TxReceipt> {
    let field = |name: &str| {
        value
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::mismatch(name))
    };
    let status = match field("status")? {
        "0x1" => ReceiptStatus::Success,
        _ => ReceiptStatus::Reverted,
    };
    Ok(TxReceipt {
        transaction_hash: field("transactionHash")?.to_string(),
        block_number: u64_from_hex("blockNumber", field("blockNumber")?)?,
        gas_used: Nat::from(uint_from_hex(field("gasUsed")?)?),
        status,
    })
}
