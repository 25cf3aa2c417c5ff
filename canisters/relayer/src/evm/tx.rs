//! EIP-1559 transaction assembly.

use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};

use crate::error::{RelayError, RelayResult};
use crate::evm::keccak::keccak256;
use crate::evm::rlp::RlpList;
use crate::evm::signature::RecoverableSignature;
use crate::types::Address;

const EIP1559_TX_TYPE: u8 = 0x02;
const MIN_PRIORITY_FEE_WEI: u64 = 1_000_000_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Eip1559Tx {
    pub chain_id: u64,
    pub nonce: u64,
    pub max_priority_fee_per_gas: BigUint,
    pub max_fee_per_gas: BigUint,
    pub gas_limit: BigUint,
    pub to: Address,
    pub value: BigUint,
    pub data: Vec<u8>,
}

impl Eip1559Tx {
    fn unsigned_fields(&self) -> RlpList {
        let mut fields = RlpList::new();
        fields
            .u64(self.chain_id)
            .u64(self.nonce)
            .uint(&self.max_priority_fee_per_gas)
            .uint(&self.max_fee_per_gas)
            .uint(&self.gas_limit)
            .bytes(self.to.as_bytes())
            .uint(&self.value)
            .bytes(&self.data)
            .list(&RlpList::new()); // access list
        fields
    }

    pub fn signing_hash(&self) -> [u8; 32] {
        let mut payload = vec![EIP1559_TX_TYPE];
        payload.extend_from_slice(&self.unsigned_fields().finish());
        keccak256(&payload)
    }

    pub fn encode_signed(&self, signature: &RecoverableSignature) -> Vec<u8> {
        let mut fields = self.unsigned_fields();
        fields
            .u64(signature.y_parity as u64)
            .uint(&BigUint::from_bytes_be(&signature.r))
            .uint(&BigUint::from_bytes_be(&signature.s));
        let mut raw = vec![EIP1559_TX_TYPE];
        raw.extend_from_slice(&fields.finish());
        raw
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeePlan {
    pub gas_limit: BigUint,
    pub max_priority_fee_per_gas: BigUint,
    pub max_fee_per_gas: BigUint,
}

/// Multiplies and rounds up, never returning less than the input.
pub fn scale_up(value: &BigUint, multiplier: f64) -> RelayResult<BigUint> {
    let base = value.to_f64().ok_or_else(|| RelayError::NumberOutOfRange {
        field: "scaled value".into(),
    })?;
    let scaled = (base * multiplier).ceil();
    if !scaled.is_finite() || scaled < 0.0 {
        return Err(RelayError::NumberOutOfRange {
            field: "scaled value".into(),
        });
    }
    let scaled = BigUint::from(scaled as u128);
    Ok(if &scaled < value { value.clone() } else { scaled })
}

/// Gas limit gets 20% headroom over the estimate (with a floor); the max fee
/// is the scaled base fee plus the scaled priority fee.
pub fn plan_fees(
    gas_estimate: &BigUint,
    min_gas_limit: u64,
    base_fee: &BigUint,
    priority_fee: &BigUint,
    max_fee_multiplier: f64,
    priority_multiplier: f64,
) -> RelayResult<FeePlan> {
    let floor = BigUint::from(min_gas_limit);
    let gas_limit = if gas_estimate < &floor {
        floor
    } else {
        gas_estimate.clone()
    };
    let gas_limit = scale_up(&gas_limit, 1.2)?;

    let mut priority = scale_up(priority_fee, priority_multiplier)?;
    if priority.is_zero() {
        priority = BigUint::from(MIN_PRIORITY_FEE_WEI);
    }
    let max_fee = scale_up(base_fee, max_fee_multiplier)? + &priority;

    Ok(FeePlan {
        gas_limit,
        max_priority_fee_per_gas: priority,
        max_fee_per_gas: max_fee,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::signature::address_of;
    use k256::ecdsa::SigningKey;

    fn sample_tx() -> Eip1559Tx {
        Eip1559Tx {
            chain_id: 11_155_111,
            nonce: 7,
            max_priority_fee_per_gas: BigUint::from(2_000_000_000u64),
            max_fee_per_gas: BigUint::from(30_000_000_000u64),
            gas_limit: BigUint::from(25_200u64),
            to: Address::from_bytes([0x22; 20]),
            value: BigUint::from(10u64).pow(15),
            data: Vec::new(),
        }
    }

    #[test]
    fn signed_encoding_recovers_to_signer() {
        let key = SigningKey::from_slice(&[0x07; 32]).unwrap();
        let tx = sample_tx();
        let hash = tx.signing_hash();
        let (sig, recid) = key.sign_prehash_recoverable(&hash).unwrap();
        let bytes = sig.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        let signature = RecoverableSignature {
            r,
            s,
            y_parity: recid.to_byte(),
        };

        let raw = tx.encode_signed(&signature);
        assert_eq!(raw[0], 0x02);
        assert_eq!(
            signature.recover(&hash).unwrap(),
            address_of(key.verifying_key())
        );
    }

    #[test]
    fn fee_plan_applies_floors_and_multipliers() {
        let plan = plan_fees(
            &BigUint::from(10_000u64),
            21_000,
            &BigUint::from(10u64),
            &BigUint::from(0u64),
            2.0,
            1.2,
        )
        .unwrap();
        assert_eq!(plan.gas_limit, BigUint::from(25_200u64));
        assert_eq!(plan.max_priority_fee_per_gas, BigUint::from(MIN_PRIORITY_FEE_WEI));
        assert_eq!(plan.max_fee_per_gas, BigUint::from(MIN_PRIORITY_FEE_WEI + 20));
    }
}
