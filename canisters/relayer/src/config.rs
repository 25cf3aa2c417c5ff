use candid::{CandidType, Nat, Principal};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};
use crate::types::{Address, Asset, Network};

pub const MONAD_TESTNET_CHAIN_ID: u64 = 10_143;
pub const SEPOLIA_CHAIN_ID: u64 = 11_155_111;
pub const DEFAULT_ENTRY_POINT: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";
pub const DEFAULT_PRICE_API_URL: &str = "https://api.coingecko.com/api/v3/simple/price";
const DELEGATION_TTL_MS: u64 = 30 * 24 * 60 * 60 * 1000;

fn native_units(numerator: u64, denominator: u64) -> Nat {
    Nat::from(BigUint::from(10u64).pow(18) * numerator / denominator)
}

#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct RpcTarget {
    pub canister: Principal,
    pub network: String,
}

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub struct ChainConfig {
    pub network: Network,
    pub chain_id: u64,
    pub symbol: String,
    pub bridge_address: String,
    pub wrapped_token: Option<String>,
    /// CoinGecko id; `None` means the asset has no live feed.
    pub price_feed_id: Option<String>,
    pub fallback_usd: f64,
    /// ERC-4337 bundler for delegated deposits originating on this chain.
    pub bundler: Option<BundlerConfig>,
}

impl ChainConfig {
    pub fn monad_testnet() -> Self {
        Self {
            network: Network::Monad,
            chain_id: MONAD_TESTNET_CHAIN_ID,
            symbol: "MON".into(),
            bridge_address: "0x790f07dF19F95aAbFAed3BfED01c07724c9a6cca".into(),
            wrapped_token: Some("0xdfd0480D0c1f59a0c5eAeadfDE047840F6813623".into()),
            price_feed_id: None,
            fallback_usd: 0.006144,
            bundler: None,
        }
    }

    pub fn sepolia() -> Self {
        Self {
            network: Network::Sepolia,
            chain_id: SEPOLIA_CHAIN_ID,
            symbol: "ETH".into(),
            bridge_address: "0xe564df234366234b279c9a5d547c94AA4a5C08F3".into(),
            wrapped_token: None,
            price_feed_id: Some("ethereum".into()),
            fallback_usd: 4327.95,
            bundler: None,
        }
    }

    pub fn bridge(&self) -> RelayResult<Address> {
        Address::parse("bridge_address", &self.bridge_address)
    }

    pub fn validate(&self) -> RelayResult<()> {
        self.bridge()?;
        self.wrapped()?;
        if !(self.fallback_usd.is_finite() && self.fallback_usd > 0.0) {
            return Err(RelayError::InvalidAmount {
                reason: format!("fallback price for {} must be positive", self.symbol),
            });
        }
        if let Some(bundler) = &self.bundler {
            Address::parse("entry_point", &bundler.entry_point)?;
        }
        Ok(())
    }

    pub fn wrapped(&self) -> RelayResult<Option<Address>> {
        self.wrapped_token
            .as_deref()
            .map(|token| Address::parse("wrapped_token", token))
            .transpose()
    }
}

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub struct LiquidityPolicy {
    /// Payout headroom in basis points; 11_000 requires 1.1x the payout.
    pub buffer_bps: u32,
    pub source_gas_floor_wei: Nat,
    pub mint_gas_reserve_wei: Nat,
}

impl Default for LiquidityPolicy {
    fn default() -> Self {
        Self {
            buffer_bps: 11_000,
            source_gas_floor_wei: native_units(1, 100),
            mint_gas_reserve_wei: native_units(5, 1000),
        }
    }
}

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub struct ConfirmationPolicy {
    pub initial_backoff_ms: u64,
    pub backoff_factor: u32,
    pub max_backoff_ms: u64,
    pub deadline_ms: u64,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 2_000,
            backoff_factor: 2,
            max_backoff_ms: 16_000,
            deadline_ms: 120_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub struct FeePolicy {
    pub max_fee_multiplier: f64,
    pub priority_multiplier: f64,
    pub min_gas_limit: u64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            max_fee_multiplier: 2.0,
            priority_multiplier: 1.2,
            min_gas_limit: 21_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub struct LanePolicy {
    /// How long a settlement waits for its turn on a chain before giving up.
    pub wait_ms: u64,
    /// A holder older than this is presumed lost (trapped message).
    pub lease_ms: u64,
    pub poll_ms: u64,
}

impl Default for LanePolicy {
    fn default() -> Self {
        Self {
            wait_ms: 60_000,
            lease_ms: 300_000,
            poll_ms: 1_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub struct BundlerConfig {
    pub url: String,
    pub entry_point: String,
    /// Ask the bundler's paymaster to sponsor gas (`pm_sponsorUserOperation`).
    pub sponsor: bool,
}

#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct RelayerConfig {
    pub evm_addr: Option<String>,
    pub ecdsa_key_name: String,
    pub ecdsa_derivation_path: Vec<Vec<u8>>,
    pub rpc_target: Option<RpcTarget>,
    pub price_api_url: String,
    pub monad: ChainConfig,
    pub sepolia: ChainConfig,
    pub liquidity: LiquidityPolicy,
    pub confirmation: ConfirmationPolicy,
    pub fees: FeePolicy,
    pub lanes: LanePolicy,
    /// Reject settlements that carry no source transaction hash.
    pub require_source_proof: bool,
    pub delegation_ttl_ms: u64,
    /// Settlements stuck in flight longer than this need reconciliation.
    pub in_flight_lease_ms: u64,
    pub paused: bool,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            evm_addr: None,
            ecdsa_key_name: "test_key_1".into(),
            ecdsa_derivation_path: Vec::new(),
            rpc_target: None,
            price_api_url: DEFAULT_PRICE_API_URL.into(),
            monad: ChainConfig::monad_testnet(),
            sepolia: ChainConfig::sepolia(),
            liquidity: LiquidityPolicy::default(),
            confirmation: ConfirmationPolicy::default(),
            fees: FeePolicy::default(),
            lanes: LanePolicy::default(),
            require_source_proof: false,
            delegation_ttl_ms: DELEGATION_TTL_MS,
            in_flight_lease_ms: 600_000,
            paused: true,
        }
    }
}

impl RelayerConfig {
    pub fn chain(&self, network: Network) -> &ChainConfig {
        match network {
            Network::Monad => &self.monad,
            Network::Sepolia => &self.sepolia,
        }
    }

    pub fn chain_mut(&mut self, network: Network) -> &mut ChainConfig {
        match network {
            Network::Monad => &mut self.monad,
            Network::Sepolia => &mut self.sepolia,
        }
    }

    /// Validates `chain` and replaces the config of its network.
    pub fn replace_chain(&mut self, chain: ChainConfig) -> RelayResult<()> {
        chain.validate()?;
        let network = chain.network;
        *self.chain_mut(network) = chain;
        Ok(())
    }

    /// Chain whose config carries the price feed for an asset.
    pub fn pricing_chain(&self, asset: Asset) -> &ChainConfig {
        match asset.priced_as() {
            Asset::Mon => &self.monad,
            _ => &self.sepolia,
        }
    }

    pub fn relayer_address(&self) -> RelayResult<Address> {
        let raw = self
            .evm_addr
            .as_deref()
            .ok_or_else(|| RelayError::ConfigurationMissing {
                field: "evm_addr".into(),
            })?;
        Address::parse("evm_addr", raw)
    }
}

#[derive(Clone, Debug, CandidType, Deserialize)]
pub struct InitArgs {
    pub admins: Vec<Principal>,
    pub ecdsa_key_name: Option<String>,
    pub ecdsa_derivation_path: Option<Vec<Vec<u8>>>,
    pub relayer_address: Option<String>,
    pub rpc_target: Option<RpcTarget>,
    pub price_api_url: Option<String>,
    pub monad: Option<ChainConfig>,
    pub sepolia: Option<ChainConfig>,
    pub liquidity: Option<LiquidityPolicy>,
    pub confirmation: Option<ConfirmationPolicy>,
    pub fees: Option<FeePolicy>,
    pub require_source_proof: Option<bool>,
}

impl Default for InitArgs {
    fn default() -> Self {
        Self {
            admins: Vec::new(),
            ecdsa_key_name: None,
            ecdsa_derivation_path: None,
            relayer_address: None,
            rpc_target: None,
            price_api_url: None,
            monad: None,
            sepolia: None,
            liquidity: None,
            confirmation: None,
            fees: None,
            require_source_proof: None,
        }
    }
}

impl InitArgs {
    pub fn into_config(self) -> RelayResult<RelayerConfig> {
        let defaults = RelayerConfig::default();
        let evm_addr = self
            .relayer_address
            .map(|raw| Address::parse("relayer_address", &raw).map(|a| a.to_string()))
            .transpose()?;
        let config = RelayerConfig {
            evm_addr,
            ecdsa_key_name: self.ecdsa_key_name.unwrap_or(defaults.ecdsa_key_name),
            ecdsa_derivation_path: self.ecdsa_derivation_path.unwrap_or_default(),
            rpc_target: self.rpc_target,
            price_api_url: self.price_api_url.unwrap_or(defaults.price_api_url),
            monad: self.monad.unwrap_or(defaults.monad),
            sepolia: self.sepolia.unwrap_or(defaults.sepolia),
            liquidity: self.liquidity.unwrap_or(defaults.liquidity),
            confirmation: self.confirmation.unwrap_or(defaults.confirmation),
            fees: self.fees.unwrap_or(defaults.fees),
            require_source_proof: self.require_source_proof.unwrap_or(false),
            ..defaults
        };
        config.monad.validate()?;
        config.sepolia.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_start_paused_with_ten_percent_buffer() {
        let config = InitArgs::default().into_config().unwrap();
        assert!(config.paused);
        assert_eq!(config.liquidity.buffer_bps, 11_000);
        assert_eq!(
            config.liquidity.source_gas_floor_wei,
            Nat::from(10_000_000_000_000_000u64)
        );
        assert_eq!(config.chain(Network::Sepolia).chain_id, SEPOLIA_CHAIN_ID);
        assert_eq!(config.pricing_chain(Asset::Weth).symbol, "ETH");
    }

    #[test]
    fn replacing_a_chain_touches_only_its_network() {
        let mut config = InitArgs::default().into_config().unwrap();
        let mut monad = ChainConfig::monad_testnet();
        monad.fallback_usd = 0.5;
        config.replace_chain(monad).unwrap();
        assert_eq!(config.chain(Network::Monad).fallback_usd, 0.5);
        assert_eq!(config.chain(Network::Sepolia), &ChainConfig::sepolia());

        let mut broken = ChainConfig::sepolia();
        broken.fallback_usd = f64::NAN;
        assert!(config.replace_chain(broken).is_err());
        assert_eq!(config.chain(Network::Sepolia), &ChainConfig::sepolia());
    }

    #[test]
    fn relayer_address_is_normalized_and_validated() {
        let args = InitArgs {
            relayer_address: Some("0xAB00000000000000000000000000000000000001".into()),
            ..InitArgs::default()
        };
        let config = args.into_config().unwrap();
        assert_eq!(
            config.evm_addr.as_deref(),
            Some("0xab00000000000000000000000000000000000001")
        );

        let bad = InitArgs {
            relayer_address: Some("nope".into()),
            ..InitArgs::default()
        };
        assert!(bad.into_config().is_err());

        let mut sepolia = ChainConfig::sepolia();
        sepolia.fallback_usd = 0.0;
        let bad_chain = InitArgs {
            sepolia: Some(sepolia),
            ..InitArgs::default()
        };
        assert!(bad_chain.into_config().is_err());
    }
}
