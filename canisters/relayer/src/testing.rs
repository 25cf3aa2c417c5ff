//! In-memory host for unit tests: two fake chains, a price table, a virtual
//! clock and locally held signing keys.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use k256::ecdsa::SigningKey;
use num_bigint::BigUint;
use once_cell::sync::Lazy;
use serde_json::{json, Value};

use crate::config::{BundlerConfig, RelayerConfig, DEFAULT_ENTRY_POINT};
use crate::error::{RelayError, RelayResult};
use crate::evm::keccak::keccak256;
use crate::evm::rpc::{parse_hex_bytes, to_hex_prefixed, uint_to_hex, RpcService};
use crate::evm::signature::{address_of, personal_message_hash, RecoverableSignature};
use crate::evm::tx::Eip1559Tx;
use crate::host::{ChainRpc, Clock, PriceFeed, StateStore, TxSigner};
use crate::state::RelayerState;
use crate::types::{Address, Network, TxHash};

pub static RELAYER_KEY: Lazy<SigningKey> =
    Lazy::new(|| SigningKey::from_slice(&[0x11; 32]).expect("valid relayer key"));
pub static USER_KEY: Lazy<SigningKey> =
    Lazy::new(|| SigningKey::from_slice(&[0x22; 32]).expect("valid user key"));

const START_MS: u64 = 1_700_000_000_000;
const ONE_GWEI: &str = "0x3b9aca00";

/// EIP-191 signature over `message`, as a wallet's `personal_sign` returns it.
pub fn personal_sign(key: &SigningKey, message: &str) -> String {
    let digest = personal_message_hash(message.as_bytes());
    let (signature, recovery_id) = key.sign_prehash_recoverable(&digest).expect("signable digest");
    let mut rsv = signature.to_bytes().to_vec();
    rsv.push(27 + recovery_id.to_byte());
    to_hex_prefixed(&rsv)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentTx {
    pub from: Address,
    pub nonce: u64,
    pub to: Address,
    pub value: BigUint,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug)]
struct ScheduledReceipt {
    success: bool,
    misses: u32,
}

#[derive(Default)]
struct MockChain {
    balances: HashMap<Address, BigUint>,
    pending_nonce: u64,
    receipts: HashMap<String, ScheduledReceipt>,
    sent: Vec<SentTx>,
    transactions: HashMap<String, SentTx>,
    methods: Vec<String>,
    user_operations: Vec<Value>,
    unreachable: bool,
    hold_receipts: bool,
    broadcast_error: Option<String>,
    gas_error: Option<String>,
}

pub struct MockHost {
    state: RefCell<RelayerState>,
    now: Cell<u64>,
    chains: RefCell<BTreeMap<u64, MockChain>>,
    bundlers: RefCell<BTreeMap<String, u64>>,
    prices: RefCell<HashMap<String, RelayResult<f64>>>,
    price_fetches: Cell<u32>,
}

impl MockHost {
    /// Starts paused, like a freshly installed relayer.
    pub fn new() -> Self {
        let config = RelayerConfig {
            evm_addr: Some(address_of(RELAYER_KEY.verifying_key()).to_string()),
            ..RelayerConfig::default()
        };
        Self {
            state: RefCell::new(RelayerState::new(BTreeSet::new(), config)),
            now: Cell::new(START_MS),
            chains: RefCell::new(BTreeMap::new()),
            bundlers: RefCell::new(BTreeMap::new()),
            prices: RefCell::new(HashMap::new()),
            price_fetches: Cell::new(0),
        }
    }

    pub fn with_bundlers() -> Self {
        let host = Self::new();
        for network in [Network::Monad, Network::Sepolia] {
            let url = format!("https://bundler.{}.test", network.to_string().to_lowercase().replace(' ', "-"));
            let chain_id = host.write(|state| {
                let chain = state.config.chain_mut(network);
                chain.bundler = Some(BundlerConfig {
                    url: url.clone(),
                    entry_point: DEFAULT_ENTRY_POINT.into(),
                    sponsor: true,
                });
                chain.chain_id
            });
            host.bundlers.borrow_mut().insert(url, chain_id);
        }
        host
    }

    fn chain<T>(&self, chain_id: u64, f: impl FnOnce(&mut MockChain) -> T) -> T {
        f(self.chains.borrow_mut().entry(chain_id).or_default())
    }

    pub fn unpause(&self) {
        self.write(|state| state.config.paused = false);
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }

    pub fn relayer_address(&self) -> Address {
        address_of(RELAYER_KEY.verifying_key())
    }

    pub fn user_address(&self) -> Address {
        address_of(USER_KEY.verifying_key())
    }

    pub fn set_price(&self, feed_id: &str, price: RelayResult<f64>) {
        self.prices.borrow_mut().insert(feed_id.to_string(), price);
    }

    pub fn set_fallback(&self, network: Network, usd: f64) {
        self.write(|state| state.config.chain_mut(network).fallback_usd = usd);
    }

    pub fn price_fetches(&self) -> u32 {
        self.price_fetches.get()
    }

    pub fn set_balance(&self, chain_id: u64, address: &Address, wei: BigUint) {
        self.chain(chain_id, |chain| chain.balances.insert(*address, wei));
    }

    pub fn set_unreachable(&self, chain_id: u64, unreachable: bool) {
        self.chain(chain_id, |chain| chain.unreachable = unreachable);
    }

    /// Makes `tx_hash` known on `chain_id`; its receipt shows up after
    /// `misses` empty polls.
    pub fn schedule_receipt(&self, chain_id: u64, tx_hash: TxHash, success: bool, misses: u32) {
        self.chain(chain_id, |chain| {
            chain
                .receipts
                .insert(tx_hash.to_string(), ScheduledReceipt { success, misses })
        });
    }

    /// Lands a successful transaction that the relayer did not send.
    pub fn foreign_transaction(&self, chain_id: u64, tx_hash: TxHash, tx: SentTx) {
        self.chain(chain_id, |chain| chain.transactions.insert(tx_hash.to_string(), tx));
        self.schedule_receipt(chain_id, tx_hash, true, 0);
    }

    /// While held, every receipt lookup on the chain comes back empty.
    pub fn hold_receipts(&self, chain_id: u64, hold: bool) {
        self.chain(chain_id, |chain| chain.hold_receipts = hold);
    }

    pub fn fail_broadcasts(&self, chain_id: u64, error: Option<&str>) {
        self.chain(chain_id, |chain| chain.broadcast_error = error.map(str::to_string));
    }

    pub fn fail_gas_estimate(&self, chain_id: u64, error: Option<&str>) {
        self.chain(chain_id, |chain| chain.gas_error = error.map(str::to_string));
    }

    pub fn sent_transactions(&self, chain_id: u64) -> Vec<SentTx> {
        self.chain(chain_id, |chain| chain.sent.clone())
    }

    pub fn sent_nonces(&self, chain_id: u64) -> Vec<u64> {
        self.sent_transactions(chain_id).iter().map(|tx| tx.nonce).collect()
    }

    pub fn methods(&self, chain_id: u64) -> Vec<String> {
        self.chain(chain_id, |chain| chain.methods.clone())
    }

    pub fn user_operations(&self) -> Vec<Value> {
        self.chains
            .borrow()
            .values()
            .flat_map(|chain| chain.user_operations.iter().cloned())
            .collect()
    }

    fn resolve_service(&self, service: &RpcService) -> RelayResult<u64> {
        match service {
            RpcService::Chain(chain_id) => Ok(*chain_id),
            RpcService::Custom(api) => self.bundlers.borrow().get(&api.url).copied().ok_or_else(|| {
                RelayError::RpcTransportError {
                    code: "unknown_host".into(),
                    message: api.url.clone(),
                }
            }),
        }
    }
}

fn receipt_json(tx_hash: &str, success: bool) -> Value {
    json!({
        "transactionHash": tx_hash,
        "blockNumber": "0x10",
        "gasUsed": "0x5208",
        "status": if success { "0x1" } else { "0x0" },
    })
}

fn param_str<'a>(params: &'a Value, index: usize) -> RelayResult<&'a str> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::mismatch("string param"))
}

fn rpc_error(code: i64, message: &str) -> RelayError {
    RelayError::RpcError {
        code,
        message: message.to_string(),
    }
}

impl MockChain {
    fn handle(&mut self, method: &str, params: &Value) -> RelayResult<Value> {
        match method {
            "eth_getBalance" => {
                let address = Address::parse("address", param_str(params, 0)?)?;
                let balance = self.balances.get(&address).cloned().unwrap_or_default();
                Ok(json!(uint_to_hex(&balance)))
            }
            "eth_getTransactionCount" => Ok(json!(format!("0x{:x}", self.pending_nonce))),
            "eth_maxPriorityFeePerGas" => Ok(json!(ONE_GWEI)),
            "eth_getBlockByNumber" => Ok(json!({ "number": "0x10", "baseFeePerGas": ONE_GWEI })),
            "eth_estimateGas" => match &self.gas_error {
                Some(message) => Err(rpc_error(3, message)),
                None => Ok(json!("0x5208")),
            },
            // EntryPoint.getNonce for a fresh account.
            "eth_call" => Ok(json!(format!("0x{}", "00".repeat(32)))),
            "eth_sendRawTransaction" => {
                if let Some(message) = &self.broadcast_error {
                    return Err(rpc_error(-32000, message));
                }
                let raw = parse_hex_bytes(param_str(params, 0)?)?;
                let sent = decode_signed_tx(&raw);
                self.pending_nonce = self.pending_nonce.max(sent.nonce + 1);
                let tx_hash = TxHash::from_bytes(keccak256(&raw)).to_string();
                self.transactions.insert(tx_hash.clone(), sent.clone());
                self.sent.push(sent);
                self.receipts.insert(
                    tx_hash.clone(),
                    ScheduledReceipt {
                        success: true,
                        misses: 0,
                    },
                );
                Ok(json!(tx_hash))
            }
            "eth_getTransactionReceipt" => {
                let tx_hash = param_str(params, 0)?.to_lowercase();
                if self.hold_receipts {
                    return Ok(Value::Null);
                }
                match self.receipts.get_mut(&tx_hash) {
                    Some(scheduled) if scheduled.misses > 0 => {
                        scheduled.misses -= 1;
                        Ok(Value::Null)
                    }
                    Some(scheduled) => Ok(receipt_json(&tx_hash, scheduled.success)),
                    None => Ok(Value::Null),
                }
            }
            "eth_getTransactionByHash" => {
                let tx_hash = param_str(params, 0)?.to_lowercase();
                match self.transactions.get(&tx_hash) {
                    Some(tx) => Ok(json!({
                        "hash": tx_hash,
                        "from": tx.from.to_string(),
                        "to": tx.to.to_string(),
                        "input": to_hex_prefixed(&tx.data),
                    })),
                    None => Ok(Value::Null),
                }
            }
            "pm_sponsorUserOperation" => Ok(json!({ "paymasterAndData": "0xabcd" })),
            "eth_sendUserOperation" => {
                let operation = params.get(0).cloned().unwrap_or(Value::Null);
                let op_hash = TxHash::from_bytes(keccak256(operation.to_string().as_bytes())).to_string();
                self.user_operations.push(operation);
                self.receipts.insert(
                    op_hash.clone(),
                    ScheduledReceipt {
                        success: true,
                        misses: 0,
                    },
                );
                Ok(json!(op_hash))
            }
            "eth_getUserOperationReceipt" => {
                let op_hash = param_str(params, 0)?.to_lowercase();
                match self.receipts.get(&op_hash) {
                    Some(scheduled) if !self.hold_receipts => Ok(json!({
                        "userOpHash": op_hash,
                        "success": scheduled.success,
                        "receipt": receipt_json(&op_hash, scheduled.success),
                    })),
                    _ => Ok(Value::Null),
                }
            }
            other => Err(rpc_error(-32601, &format!("method {} not found", other))),
        }
    }
}

/// Splits one RLP item off `buf`: (is_list, payload, consumed).
fn rlp_item(buf: &[u8]) -> (bool, &[u8], usize) {
    let prefix = buf[0];
    let long_len = |len_of_len: usize| {
        let len = buf[1..1 + len_of_len]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (1 + len_of_len, len)
    };
    let (is_list, header, len) = match prefix {
        0x00..=0x7f => return (false, &buf[..1], 1),
        0x80..=0xb7 => (false, 1, (prefix - 0x80) as usize),
        0xb8..=0xbf => {
            let (header, len) = long_len((prefix - 0xb7) as usize);
            (false, header, len)
        }
        0xc0..=0xf7 => (true, 1, (prefix - 0xc0) as usize),
        _ => {
            let (header, len) = long_len((prefix - 0xf7) as usize);
            (true, header, len)
        }
    };
    (is_list, &buf[header..header + len], header + len)
}

fn be_u64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

fn word(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(bytes);
    out
}

/// Decodes a signed type-2 transaction and recovers its sender.
fn decode_signed_tx(raw: &[u8]) -> SentTx {
    let (_, mut payload, _) = rlp_item(&raw[1..]);
    let mut fields = Vec::new();
    while !payload.is_empty() {
        let (_, item, consumed) = rlp_item(payload);
        fields.push(item);
        payload = &payload[consumed..];
    }
    let mut to = [0u8; 20];
    to.copy_from_slice(fields[5]);
    let tx = Eip1559Tx {
        chain_id: be_u64(fields[0]),
        nonce: be_u64(fields[1]),
        max_priority_fee_per_gas: BigUint::from_bytes_be(fields[2]),
        max_fee_per_gas: BigUint::from_bytes_be(fields[3]),
        gas_limit: BigUint::from_bytes_be(fields[4]),
        to: Address::from_bytes(to),
        value: BigUint::from_bytes_be(fields[6]),
        data: fields[7].to_vec(),
    };
    let signature = RecoverableSignature {
        r: word(fields[10]),
        s: word(fields[11]),
        y_parity: be_u64(fields[9]) as u8,
    };
    SentTx {
        from: signature.recover(&tx.signing_hash()).expect("recoverable sender"),
        nonce: tx.nonce,
        to: tx.to,
        value: tx.value,
        data: tx.data,
    }
}

impl ChainRpc for MockHost {
    async fn request(&self, service: &RpcService, payload: Value) -> RelayResult<Value> {
        tokio::task::yield_now().await;
        let chain_id = self.resolve_service(service)?;
        let method = payload["method"].as_str().unwrap_or_default().to_string();
        self.chain(chain_id, |chain| {
            if chain.unreachable {
                return Err(RelayError::RpcTransportError {
                    code: "unreachable".into(),
                    message: format!("chain {} is down", chain_id),
                });
            }
            chain.methods.push(method.clone());
            chain.handle(&method, &payload["params"])
        })
    }
}

impl TxSigner for MockHost {
    fn signer_address(&self) -> RelayResult<Address> {
        self.read(|state| state.config.relayer_address())
    }

    async fn sign_prehash(&self, prehash: &[u8; 32]) -> RelayResult<RecoverableSignature> {
        let (signature, recovery_id) =
            RELAYER_KEY
                .sign_prehash_recoverable(prehash)
                .map_err(|e| RelayError::SigningFailed {
                    message: e.to_string(),
                })?;
        let bytes = signature.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        Ok(RecoverableSignature {
            r,
            s,
            y_parity: recovery_id.to_byte(),
        })
    }
}

impl PriceFeed for MockHost {
    async fn fetch_usd(&self, feed_id: &str) -> RelayResult<f64> {
        self.price_fetches.set(self.price_fetches.get() + 1);
        self.prices
            .borrow()
            .get(feed_id)
            .cloned()
            .unwrap_or_else(|| {
                Err(RelayError::PriceFeed {
                    message: format!("no price for {}", feed_id),
                })
            })
    }
}

impl Clock for MockHost {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    async fn sleep_ms(&self, ms: u64) {
        tokio::task::yield_now().await;
        self.advance(ms);
    }
}

impl StateStore for MockHost {
    fn read<T>(&self, f: impl FnOnce(&RelayerState) -> T) -> T {
        f(&self.state.borrow())
    }

    fn write<T>(&self, f: impl FnOnce(&mut RelayerState) -> T) -> T {
        f(&mut self.state.borrow_mut())
    }
}
