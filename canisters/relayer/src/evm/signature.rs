use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};

use crate::error::{RelayError, RelayResult};
use crate::evm::keccak::keccak256;
use crate::types::Address;

/// secp256k1 signature with the recovery parity EVM transactions need.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoverableSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub y_parity: u8,
}

impl RecoverableSignature {
    /// Parses a 65-byte `r || s || v` signature, `v` being 0/1 or 27/28.
    pub fn from_rsv(bytes: &[u8]) -> RelayResult<Self> {
        if bytes.len() != 65 {
            return Err(RelayError::DelegationSignatureInvalid {
                reason: format!("expected 65 bytes, got {}", bytes.len()),
            });
        }
        let y_parity = match bytes[64] {
            0 | 27 => 0,
            1 | 28 => 1,
            v => {
                return Err(RelayError::DelegationSignatureInvalid {
                    reason: format!("invalid recovery byte {}", v),
                })
            }
        };
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..64]);
        Ok(Self { r, s, y_parity })
    }

    pub fn to_rsv(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(&self.r);
        out[32..64].copy_from_slice(&self.s);
        out[64] = 27 + self.y_parity;
        out
    }

    /// Threshold ECDSA returns 64 bytes without a recovery id; the parity is
    /// found by recovering against the known signer address.
    pub fn from_compact_for_signer(
        prehash: &[u8; 32],
        compact: &[u8],
        signer: &Address,
    ) -> RelayResult<Self> {
        if compact.len() != 64 {
            return Err(RelayError::SigningFailed {
                message: format!("expected 64-byte signature, got {}", compact.len()),
            });
        }
        // EVM rejects high-s signatures.
        let signature = Signature::from_slice(compact).map_err(|e| RelayError::SigningFailed {
            message: e.to_string(),
        })?;
        let signature = signature.normalize_s().unwrap_or(signature);
        let bytes = signature.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        for y_parity in 0..2u8 {
            let candidate = Self { r, s, y_parity };
            if candidate.recover(prehash).ok().as_ref() == Some(signer) {
                return Ok(candidate);
            }
        }
        Err(RelayError::SigningFailed {
            message: format!("signature does not recover to {}", signer),
        })
    }

    pub fn recover(&self, prehash: &[u8; 32]) -> RelayResult<Address> {
        let invalid = |reason: String| RelayError::DelegationSignatureInvalid { reason };
        let mut compact = [0u8; 64];
        compact[..32].copy_from_slice(&self.r);
        compact[32..].copy_from_slice(&self.s);
        let signature = Signature::from_slice(&compact).map_err(|e| invalid(e.to_string()))?;
        let recovery_id =
            RecoveryId::from_byte(self.y_parity).ok_or_else(|| invalid("bad parity".into()))?;
        let key = VerifyingKey::recover_from_prehash(prehash, &signature, recovery_id)
            .map_err(|e| invalid(e.to_string()))?;
        Ok(address_of(&key))
    }
}

pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&hash[12..]);
    Address::from_bytes(out)
}

/// EIP-191 `personal_sign` digest.
pub fn personal_message_hash(message: &[u8]) -> [u8; 32] {
    let mut prefixed = format!("\x19Ethereum Signed Message:\n{}", message.len()).into_bytes();
    prefixed.extend_from_slice(message);
    keccak256(&prefixed)
}
