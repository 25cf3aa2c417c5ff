use std::fmt;

use candid::CandidType;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};
use crate::evm::keccak::Keccak256;

fn decode_prefixed_hex(field: &str, value: &str) -> RelayResult<Vec<u8>> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| RelayError::HexDecodeFailed {
            value: format!("{}={}", field, trimmed),
        })?;
    hex::decode(digits).map_err(|_| RelayError::HexDecodeFailed {
        value: format!("{}={}", field, trimmed),
    })
}

/// A 20-byte EVM account address, displayed lowercase with a `0x` prefix.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; 20]);

impl Address {
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn parse(field: &str, value: &str) -> RelayResult<Self> {
        let invalid = || RelayError::InvalidAddress {
            field: field.to_string(),
            value: value.trim().to_string(),
        };
        let trimmed = value.trim();
        if trimmed.len() != 42 {
            return Err(invalid());
        }
        let bytes = decode_prefixed_hex(field, trimmed).map_err(|_| invalid())?;
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A 32-byte transaction hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxHash([u8; 32]);

impl TxHash {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn parse(field: &str, value: &str) -> RelayResult<Self> {
        let invalid = || RelayError::InvalidHash {
            field: field.to_string(),
            value: value.trim().to_string(),
        };
        let bytes = decode_prefixed_hex(field, value).map_err(|_| invalid())?;
        if bytes.len() != 32 {
            return Err(invalid());
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Idempotency key correlating a source deposit with its destination payout.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferId([u8; 32]);

impl TransferId {
    /// Each derivation hashes under its own tag, so a client-chosen id can
    /// never collide with the id of a verified deposit.
    fn derive(tag: &[u8], parts: &[&[u8]]) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(tag);
        for part in parts {
            hasher.update(part);
        }
        Self(hasher.finalize())
    }

    pub fn from_tx_hash(hash: &TxHash) -> Self {
        Self::derive(b"source:", &[hash.as_bytes().as_slice()])
    }

    pub fn from_client(value: &str) -> Self {
        Self::derive(b"client:", &[value.trim().as_bytes()])
    }

    pub fn synthesize(recipient: &Address, amount: &str, now_ms: u64) -> Self {
        Self::derive(
            b"legacy:",
            &[
                recipient.as_bytes().as_slice(),
                amount.as_bytes(),
                now_ms.to_be_bytes().as_slice(),
            ],
        )
    }

    /// An id as reported back to callers (`0x` + 64 hex digits).
    pub fn parse(field: &str, value: &str) -> RelayResult<Self> {
        TxHash::parse(field, value).map(|hash| Self(*hash.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, CandidType, Deserialize, Serialize)]
pub enum Network {
    Monad,
    Sepolia,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Monad => write!(f, "Monad Testnet"),
            Network::Sepolia => write!(f, "Sepolia"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, CandidType, Deserialize, Serialize)]
pub enum Asset {
    Mon,
    Eth,
    Weth,
}

impl Asset {
    pub fn symbol(&self) -> &'static str {
        match self {
            Asset::Mon => "MON",
            Asset::Eth => "ETH",
            Asset::Weth => "WETH",
        }
    }

    /// The asset whose USD price values this one. Wrapped ETH trades at par.
    pub fn priced_as(&self) -> Asset {
        match self {
            Asset::Weth => Asset::Eth,
            other => *other,
        }
    }

    pub fn parse(value: &str) -> RelayResult<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "MON" => Ok(Asset::Mon),
            "ETH" => Ok(Asset::Eth),
            "WETH" => Ok(Asset::Weth),
            other => Err(RelayError::UnsupportedActionPair {
                pair: format!("unknown asset {}", other),
            }),
        }
    }
}

/// How the destination leg pays the recipient.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayoutKind {
    NativeTransfer,
    WrappedMint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    pub source_network: Network,
    pub destination_network: Network,
    pub source_asset: Asset,
    pub destination_asset: Asset,
    pub payout: PayoutKind,
}

/// Closed set of settlement directions. The caller always declares one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, CandidType, Deserialize, Serialize)]
pub enum Action {
    #[serde(rename = "bridge-native")]
    BridgeNative,
    #[serde(rename = "bridge-wrap")]
    BridgeWrap,
    #[serde(rename = "swap-forward")]
    SwapForward,
    #[serde(rename = "swap-reverse")]
    SwapReverse,
}

impl Action {
    pub const ALL: [Action; 4] = [
        Action::BridgeNative,
        Action::BridgeWrap,
        Action::SwapForward,
        Action::SwapReverse,
    ];

    pub fn route(&self) -> Route {
        match self {
            Action::BridgeNative => Route {
                source_network: Network::Monad,
                destination_network: Network::Sepolia,
                source_asset: Asset::Mon,
                destination_asset: Asset::Eth,
                payout: PayoutKind::NativeTransfer,
            },
            Action::BridgeWrap => Route {
                source_network: Network::Sepolia,
                destination_network: Network::Monad,
                source_asset: Asset::Eth,
                destination_asset: Asset::Weth,
                payout: PayoutKind::WrappedMint,
            },
            Action::SwapForward => Route {
                source_network: Network::Monad,
                destination_network: Network::Sepolia,
                source_asset: Asset::Mon,
                destination_asset: Asset::Eth,
                payout: PayoutKind::NativeTransfer,
            },
            Action::SwapReverse => Route {
                source_network: Network::Sepolia,
                destination_network: Network::Monad,
                source_asset: Asset::Eth,
                destination_asset: Asset::Mon,
                payout: PayoutKind::NativeTransfer,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::BridgeNative => "bridge-native",
            Action::BridgeWrap => "bridge-wrap",
            Action::SwapForward => "swap-forward",
            Action::SwapReverse => "swap-reverse",
        }
    }

    /// Accepts the canonical names and the historic client tags. Unknown
    /// tags are rejected rather than defaulting to a plain transfer.
    pub fn from_tag(tag: &str) -> RelayResult<Self> {
        match tag.trim() {
            "bridge-native" | "bridge" => Ok(Action::BridgeNative),
            "bridge-wrap" | "bridge-eth-to-weth" => Ok(Action::BridgeWrap),
            "swap-forward" | "swap" | "swap-monad-to-eth" => Ok(Action::SwapForward),
            "swap-reverse" | "swap-eth-to-monad" => Ok(Action::SwapReverse),
            other => Err(RelayError::UnsupportedActionPair {
                pair: format!("unknown action {:?}", other),
            }),
        }
    }

    /// Token-pair form used by the delegated swap API.
    pub fn from_assets(from: Asset, to: Asset) -> RelayResult<Self> {
        match (from, to) {
            (Asset::Mon, Asset::Eth) => Ok(Action::SwapForward),
            (Asset::Eth, Asset::Mon) => Ok(Action::SwapReverse),
            (Asset::Eth, Asset::Weth) => Ok(Action::BridgeWrap),
            (from, to) => Err(RelayError::UnsupportedActionPair {
                pair: format!("{} -> {}", from.symbol(), to.symbol()),
            }),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parse_normalizes_case() {
        let addr =
            Address::parse("recipient", "0x742D35Cc6634C0532925a3b8D4C9db96C4b4d8b6").unwrap();
        assert_eq!(addr.to_string(), "0x742d35cc6634c0532925a3b8d4c9db96c4b4d8b6");
        assert!(Address::parse("recipient", "0x1234").is_err());
        assert!(Address::parse("recipient", "742d35cc6634c0532925a3b8d4c9db96c4b4d8b6ff").is_err());
    }

    #[test]
    fn client_ids_never_alias_deposit_ids() {
        let hash = TxHash::from_bytes([7u8; 32]);
        let deposit = TransferId::from_tx_hash(&hash);
        assert_ne!(deposit.as_bytes(), hash.as_bytes());
        assert_ne!(TransferId::from_client(&hash.to_string()), deposit);
        assert_ne!(TransferId::from_client(&deposit.to_string()), deposit);
        assert_eq!(TransferId::from_client(" order-7 "), TransferId::from_client("order-7"));
    }

    #[test]
    fn reported_ids_parse_back() {
        let id = TransferId::from_client("order-7");
        assert_eq!(TransferId::parse("transfer_id", &id.to_string()).unwrap(), id);
        assert!(TransferId::parse("transfer_id", "0xabcd").is_err());
    }

    #[test]
    fn legacy_tags_map_to_closed_actions() {
        assert_eq!(Action::from_tag("swap").unwrap(), Action::SwapForward);
        assert_eq!(Action::from_tag("swap-eth-to-monad").unwrap(), Action::SwapReverse);
        assert_eq!(Action::from_tag("bridge-eth-to-weth").unwrap(), Action::BridgeWrap);
        assert!(matches!(
            Action::from_tag("swapp"),
            Err(RelayError::UnsupportedActionPair { .. })
        ));
    }

    #[test]
    fn every_action_crosses_chains() {
        for action in Action::ALL {
            let route = action.route();
            assert_ne!(route.source_network, route.destination_network);
        }
        assert!(Action::from_assets(Asset::Mon, Asset::Weth).is_err());
    }
}
