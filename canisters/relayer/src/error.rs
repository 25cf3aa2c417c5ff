use candid::CandidType;
use serde::{Deserialize, Serialize};

pub type RelayResult<T> = std::result::Result<T, RelayError>;

/// How a failure should be reported to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, CandidType, Deserialize, Serialize)]
pub enum ErrorCategory {
    /// Bad input or a failed precondition; retrying the same request will not help.
    ClientError,
    /// Temporary condition (liquidity, busy submitter); the caller may retry.
    Retryable,
    /// Unexpected RPC or signing failure.
    Internal,
}

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize, thiserror::Error)]
pub enum RelayError {
    #[error("not authorized")]
    NotAuthorized,
    #[error("service paused")]
    Paused,
    #[error("configuration missing: {field}")]
    ConfigurationMissing { field: String },
    #[error("invalid {field} address: {value}")]
    InvalidAddress { field: String, value: String },
    #[error("invalid {field} hash: {value}")]
    InvalidHash { field: String, value: String },
    #[error("invalid amount: {reason}")]
    InvalidAmount { reason: String },
    #[error("unsupported action pair: {pair}")]
    UnsupportedActionPair { pair: String },
    #[error("source transaction {tx_hash} not confirmed: {reason}")]
    SourceNotConfirmed { tx_hash: String, reason: String },
    #[error("{}", insufficient_liquidity_message(.network, .symbol, .required, .available, .max_payable))]
    InsufficientLiquidity {
        network: String,
        symbol: String,
        required: String,
        available: String,
        max_payable: Option<String>,
    },
    #[error("destination submission failed: {message}")]
    DestinationSubmitFailed {
        message: String,
        tx_hash: Option<String>,
    },
    #[error("transaction {tx_hash} on {network} not confirmed within {waited_ms} ms")]
    ConfirmationTimeout {
        network: String,
        tx_hash: String,
        waited_ms: u64,
    },
    #[error("settlement {transfer_id} is already in progress")]
    SettlementInProgress { transfer_id: String },
    #[error("transfer {transfer_id} needs manual reconciliation: {reason}")]
    NeedsReconciliation { transfer_id: String, reason: String },
    #[error("transfer {transfer_id} was already submitted with a different recipient, amount or action")]
    TransferConflict { transfer_id: String },
    #[error("transfer {transfer_id} is not awaiting reconciliation")]
    UnknownTransfer { transfer_id: String },
    #[error("submission lane for chain {chain_id} is busy")]
    SubmitterBusy { chain_id: u64 },
    #[error("please switch to chain {expected} (connected to {actual})")]
    WrongSourceChain { expected: u64, actual: u64 },
    #[error("swap already started")]
    SwapAlreadyStarted,
    #[error("no delegation found for this user")]
    DelegationNotFound,
    #[error("delegation is not active")]
    DelegationInactive,
    #[error("delegation signature invalid: {reason}")]
    DelegationSignatureInvalid { reason: String },
    #[error("delegated swaps pay out to the delegating user only, not {recipient}")]
    RecipientNotDelegated { recipient: String },
    #[error("delegation does not allow {function} on {target}")]
    CapabilityDenied { target: String, function: String },
    #[error("rpc error {code}: {message}")]
    RpcError { code: i64, message: String },
    #[error("rpc transport error {code}: {message}")]
    RpcTransportError { code: String, message: String },
    #[error("unexpected rpc result type, expected {expected}")]
    RpcResultTypeMismatch { expected: String },
    #[error("failed to decode hex: {value}")]
    HexDecodeFailed { value: String },
    #[error("number out of range: {field}")]
    NumberOutOfRange { field: String },
    #[error("gas estimation failed: {message}")]
    GasEstimateFailed { message: String },
    #[error("signing failed: {message}")]
    SigningFailed { message: String },
    #[error("price feed error: {message}")]
    PriceFeed { message: String },
    #[error("json error: {message}")]
    JsonError { message: String },
}

fn insufficient_liquidity_message(
    network: &str,
    symbol: &str,
    required: &str,
    available: &str,
    max_payable: &Option<String>,
) -> String {
    let mut message = format!(
        "insufficient liquidity on {}: required {} {}, available {} {}",
        network, required, symbol, available, symbol
    );
    if let Some(max) = max_payable {
        message.push_str(&format!(". Try {} {} or less", max, symbol));
    }
    message
}

impl RelayError {
    pub fn category(&self) -> ErrorCategory {
        use RelayError::*;
        match self {
            NotAuthorized
            | InvalidAddress { .. }
            | InvalidHash { .. }
            | InvalidAmount { .. }
            | UnsupportedActionPair { .. }
            | SourceNotConfirmed { .. }
            | WrongSourceChain { .. }
            | SwapAlreadyStarted
            | UnknownTransfer { .. }
            | TransferConflict { .. }
            | RecipientNotDelegated { .. }
            | DelegationNotFound
            | DelegationInactive
            | DelegationSignatureInvalid { .. }
            | CapabilityDenied { .. } => ErrorCategory::ClientError,
            Paused
            | InsufficientLiquidity { .. }
            | SubmitterBusy { .. }
            | SettlementInProgress { .. }
            | ConfirmationTimeout { .. } => ErrorCategory::Retryable,
            ConfigurationMissing { .. }
            | DestinationSubmitFailed { .. }
            | NeedsReconciliation { .. }
            | RpcError { .. }
            | RpcTransportError { .. }
            | RpcResultTypeMismatch { .. }
            | HexDecodeFailed { .. }
            | NumberOutOfRange { .. }
            | GasEstimateFailed { .. }
            | SigningFailed { .. }
            | PriceFeed { .. }
            | JsonError { .. } => ErrorCategory::Internal,
        }
    }

    /// Extra context for failure responses, when the variant carries any.
    pub fn details(&self) -> Option<String> {
        match self {
            RelayError::InsufficientLiquidity {
                max_payable: Some(max),
                symbol,
                ..
            } => Some(format!("max payable {} {}", max, symbol)),
            RelayError::DestinationSubmitFailed {
                tx_hash: Some(hash),
                ..
            } => Some(format!("destination tx {}", hash)),
            RelayError::NeedsReconciliation { transfer_id, .. } => {
                Some(format!("transfer {}", transfer_id))
            }
            _ => None,
        }
    }

    pub(crate) fn mismatch(expected: &str) -> Self {
        RelayError::RpcResultTypeMismatch {
            expected: expected.to_string(),
        }
    }
}
