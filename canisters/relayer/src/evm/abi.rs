//! Call-data encoding for the handful of contract functions the relayer uses.

use num_bigint::BigUint;

use crate::error::{RelayError, RelayResult};
use crate::evm::keccak::keccak256;
use crate::types::{Address, TransferId};

pub const BRIDGE_SIGNATURE: &str = "bridge(uint256,address)";
pub const DEPOSIT_SIGNATURE: &str = "deposit()";
pub const MINT_WETH_SIGNATURE: &str = "mintWETH(address,uint256,bytes32)";
pub const COMPLETE_BRIDGE_SIGNATURE: &str = "completeBridge(address,uint256,bytes32)";
pub const APPROVE_SIGNATURE: &str = "approve(address,uint256)";
pub const TRANSFER_FROM_SIGNATURE: &str = "transferFrom(address,address,uint256)";
pub const TRANSFER_SIGNATURE: &str = "transfer(address,uint256)";
pub const EXECUTE_SIGNATURE: &str = "execute(address,uint256,bytes)";
pub const GET_NONCE_SIGNATURE: &str = "getNonce(address,uint192)";

pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// The function name part of a signature, e.g. `mintWETH`.
pub fn function_name(signature: &str) -> &str {
    signature.split('(').next().unwrap_or(signature)
}

fn pad_left(value: &[u8]) -> [u8; 32] {
    let mut word = [0u8; 32];
    let take = value.len().min(32);
    word[32 - take..].copy_from_slice(&value[value.len() - take..]);
    word
}

pub fn address_word(address: &Address) -> [u8; 32] {
    pad_left(address.as_bytes())
}

pub fn uint_word(value: &BigUint) -> RelayResult<[u8; 32]> {
    let bytes = value.to_bytes_be();
    if bytes.len() > 32 {
        return Err(RelayError::NumberOutOfRange {
            field: "uint256".into(),
        });
    }
    Ok(pad_left(&bytes))
}

pub fn u64_word(value: u64) -> [u8; 32] {
    pad_left(&value.to_be_bytes())
}

struct CallBuilder {
    data: Vec<u8>,
}

impl CallBuilder {
    fn new(signature: &str) -> Self {
        let mut data = Vec::with_capacity(4 + 32 * 4);
        data.extend_from_slice(&selector(signature));
        Self { data }
    }

    fn word(mut self, word: [u8; 32]) -> Self {
        self.data.extend_from_slice(&word);
        self
    }

    fn tail_bytes(mut self, bytes: &[u8]) -> Self {
        self.data.extend_from_slice(&u64_word(bytes.len() as u64));
        self.data.extend_from_slice(bytes);
        let padding = (32 - bytes.len() % 32) % 32;
        self.data.extend(std::iter::repeat(0u8).take(padding));
        self
    }

    fn build(self) -> Vec<u8> {
        self.data
    }
}

/// `bridge(destinationChainId, to)` on the source bridge contract.
pub fn encode_bridge(destination_chain_id: u64, to: &Address) -> Vec<u8> {
    CallBuilder::new(BRIDGE_SIGNATURE)
        .word(u64_word(destination_chain_id))
        .word(address_word(to))
        .build()
}

pub fn encode_deposit() -> Vec<u8> {
    CallBuilder::new(DEPOSIT_SIGNATURE).build()
}

/// `mintWETH(to, amount, transferId)` on the Monad bridge.
pub fn encode_mint_weth(to: &Address, amount: &BigUint, transfer_id: &TransferId) -> RelayResult<Vec<u8>> {
    Ok(CallBuilder::new(MINT_WETH_SIGNATURE)
        .word(address_word(to))
        .word(uint_word(amount)?)
        .word(*transfer_id.as_bytes())
        .build())
}

/// True when `data` is a `mintWETH` call for `to` under `transfer_id`,
/// whatever the amount.
pub fn is_mint_weth_for(data: &[u8], to: &Address, transfer_id: &TransferId) -> bool {
    data.len() == 4 + 3 * 32
        && data[..4] == selector(MINT_WETH_SIGNATURE)
        && data[4..36] == address_word(to)
        && data[68..100] == transfer_id.as_bytes()[..]
}

/// Smart-account `execute(dest, value, func)`.
pub fn encode_execute(target: &Address, value: &BigUint, inner: &[u8]) -> RelayResult<Vec<u8>> {
    Ok(CallBuilder::new(EXECUTE_SIGNATURE)
        .word(address_word(target))
        .word(uint_word(value)?)
        .word(u64_word(3 * 32))
        .tail_bytes(inner)
        .build())
}

/// EntryPoint `getNonce(sender, key)` with key 0.
pub fn encode_get_nonce(sender: &Address) -> Vec<u8> {
    CallBuilder::new(GET_NONCE_SIGNATURE)
        .word(address_word(sender))
        .word([0u8; 32])
        .build()
}

pub fn decode_uint(bytes: &[u8]) -> BigUint {
    BigUint::from_bytes_be(bytes)
}
