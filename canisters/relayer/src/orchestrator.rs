//! Per-swap coordinator driving a transfer from source deposit to payout.
//!
//! One `BridgeOrchestrator` exists per user-initiated swap. It moves through
//! `Idle → SourcePending → SourceConfirmed → TargetPending → TargetConfirmed`
//! or into `Error`, and never leaves a terminal phase.

use candid::CandidType;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::amount::Amount;
use crate::config::ChainConfig;
use crate::confirm::wait_for_receipt;
use crate::delegation::{self, Delegation};
use crate::error::{RelayError, RelayResult};
use crate::executor::{self, SettlementReceipt, SettlementRequest};
use crate::host::Host;
use crate::sponsor::submit_delegated_deposit;
use crate::types::{Action, Address, Asset, Network, TxHash};

#[derive(Clone, Copy, Debug, PartialEq, Eq, CandidType, Deserialize, Serialize)]
pub enum BridgePhase {
    Idle,
    SourcePending,
    SourceConfirmed,
    TargetPending,
    TargetConfirmed,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, CandidType, Deserialize, Serialize)]
pub struct BridgeStatus {
    pub phase: BridgePhase,
    pub direction: Option<Action>,
    pub source_tx_hash: Option<String>,
    pub target_tx_hash: Option<String>,
    pub error: Option<String>,
    /// Set when the swap failed after the source leg may have moved funds.
    pub needs_reconciliation: bool,
    pub delegated: bool,
    pub history: Vec<BridgePhase>,
}

impl Default for BridgeStatus {
    fn default() -> Self {
        Self {
            phase: BridgePhase::Idle,
            direction: None,
            source_tx_hash: None,
            target_tx_hash: None,
            error: None,
            needs_reconciliation: false,
            delegated: false,
            history: vec![BridgePhase::Idle],
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SwapRequest {
    pub action: Action,
    pub amount: Amount,
    pub user: Address,
    pub recipient: Address,
}

/// Everything the orchestrator needs from the outside world.
#[allow(async_fn_in_trait)]
pub trait SwapBackend {
    /// Chain the caller is currently connected to.
    fn active_chain_id(&self) -> u64;

    fn chain_id(&self, network: Network) -> u64;

    async fn fetch_delegation(&self, user: &Address) -> Option<Delegation>;

    /// Interactive, wallet-signed deposit.
    async fn send_source(&self, request: &SwapRequest) -> RelayResult<TxHash>;

    async fn wait_source(&self, network: Network, tx_hash: &TxHash) -> RelayResult<()>;

    /// Deposit submitted by the relayer through the user's smart account.
    /// Returns once the deposit is mined.
    async fn delegated_source(&self, delegation: &Delegation, request: &SwapRequest) -> RelayResult<TxHash>;

    async fn settle(&self, request: &SettlementRequest) -> RelayResult<SettlementReceipt>;
}

fn retry_hint(err: &RelayError) -> Option<&'static str> {
    match err {
        RelayError::InsufficientLiquidity { .. } => {
            Some("The relayer cannot cover this amount right now. Try a smaller amount or retry later.")
        }
        RelayError::GasEstimateFailed { .. } => {
            Some("Gas estimation failed. Check the amount and that the account holds enough gas.")
        }
        RelayError::ConfirmationTimeout { .. } => {
            Some("The transaction may still confirm. Check the explorer before retrying.")
        }
        RelayError::NeedsReconciliation { .. } | RelayError::DestinationSubmitFailed { .. } => {
            Some("Your deposit was received but the payout did not complete. It has been flagged for manual reconciliation.")
        }
        _ => None,
    }
}

pub struct BridgeOrchestrator<B> {
    backend: B,
    status: BridgeStatus,
}

impl<B: SwapBackend> BridgeOrchestrator<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            status: BridgeStatus::default(),
        }
    }

    pub fn status(&self) -> &BridgeStatus {
        &self.status
    }

    fn transition(&mut self, phase: BridgePhase) {
        self.status.phase = phase;
        self.status.history.push(phase);
    }

    fn fail(&mut self, err: RelayError) {
        let mut message = err.to_string();
        if let Some(hint) = retry_hint(&err) {
            message.push_str(". ");
            message.push_str(hint);
        }
        self.status.needs_reconciliation = self.status.source_tx_hash.is_some()
            && !matches!(err, RelayError::SourceNotConfirmed { .. });
        warn!(
            phase = ?self.status.phase,
            source_tx_hash = ?self.status.source_tx_hash,
            error = %err,
            "swap failed"
        );
        self.status.error = Some(message);
        self.transition(BridgePhase::Error);
    }

    /// Runs the swap to a terminal phase. Only the pre-start guards return
    /// `Err`; everything after the first transition is reported through the
    /// status.
    pub async fn run(&mut self, request: SwapRequest) -> RelayResult<&BridgeStatus> {
        if self.status.phase != BridgePhase::Idle {
            return Err(RelayError::SwapAlreadyStarted);
        }
        let route = request.action.route();
        let expected = self.backend.chain_id(route.source_network);
        let actual = self.backend.active_chain_id();
        if expected != actual {
            return Err(RelayError::WrongSourceChain { expected, actual });
        }
        self.status.direction = Some(request.action);

        let delegation = self
            .backend
            .fetch_delegation(&request.user)
            .await
            .filter(|delegation| delegation.is_active);

        self.transition(BridgePhase::SourcePending);
        let source = match &delegation {
            Some(delegation) => {
                self.status.delegated = true;
                self.backend.delegated_source(delegation, &request).await
            }
            None => match self.backend.send_source(&request).await {
                Ok(tx_hash) => {
                    self.status.source_tx_hash = Some(tx_hash.to_string());
                    self.backend
                        .wait_source(route.source_network, &tx_hash)
                        .await
                        .map(|()| tx_hash)
                }
                Err(err) => Err(err),
            },
        };
        let source_tx_hash = match source {
            Ok(tx_hash) => tx_hash,
            Err(err) => {
                self.fail(err);
                return Ok(&self.status);
            }
        };
        self.status.source_tx_hash = Some(source_tx_hash.to_string());
        self.transition(BridgePhase::SourceConfirmed);

        self.transition(BridgePhase::TargetPending);
        let settlement = SettlementRequest {
            recipient: request.recipient.to_string(),
            amount: request.amount.to_fixed_string(),
            action: request.action.name().to_string(),
            source_tx_hash: Some(source_tx_hash.to_string()),
            destination_tx_hash: None,
            transfer_id: None,
        };
        match self.backend.settle(&settlement).await {
            Ok(receipt) => {
                info!(
                    action = %request.action,
                    source_tx_hash = %source_tx_hash,
                    target_tx_hash = %receipt.tx_hash,
                    "swap completed"
                );
                self.status.target_tx_hash = Some(receipt.tx_hash);
                self.transition(BridgePhase::TargetConfirmed);
            }
            Err(err) => self.fail(err),
        }
        Ok(&self.status)
    }
}

/// Backend wired to a relayer host. The relayer holds no user wallet, so
/// only the delegated path can start a swap here.
pub struct HostBackend<'a, H> {
    pub host: &'a H,
    pub active_chain_id: u64,
}

impl<H: Host> SwapBackend for HostBackend<'_, H> {
    fn active_chain_id(&self) -> u64 {
        self.active_chain_id
    }

    fn chain_id(&self, network: Network) -> u64 {
        self.host.read(|state| state.config.chain(network).chain_id)
    }

    async fn fetch_delegation(&self, user: &Address) -> Option<Delegation> {
        let now = self.host.now_ms();
        self.host.write(|state| delegation::get(state, user, now))
    }

    async fn send_source(&self, _request: &SwapRequest) -> RelayResult<TxHash> {
        Err(RelayError::DelegationNotFound)
    }

    async fn wait_source(&self, network: Network, tx_hash: &TxHash) -> RelayResult<()> {
        let (chain, policy): (ChainConfig, _) = self.host.read(|state| {
            (
                state.config.chain(network).clone(),
                state.config.confirmation.clone(),
            )
        });
        let receipt = wait_for_receipt(self.host, &chain, tx_hash, &policy).await?;
        if !receipt.succeeded() {
            return Err(RelayError::SourceNotConfirmed {
                tx_hash: tx_hash.to_string(),
                reason: "transaction reverted".into(),
            });
        }
        Ok(())
    }

    async fn delegated_source(&self, delegation: &Delegation, request: &SwapRequest) -> RelayResult<TxHash> {
        submit_delegated_deposit(self.host, delegation, request.action, &request.amount, &request.recipient).await
    }

    async fn settle(&self, request: &SettlementRequest) -> RelayResult<SettlementReceipt> {
        executor::settle(self.host, request).await
    }
}

#[derive(Clone, Debug, CandidType, Deserialize)]
pub struct DelegatedSwapRequest {
    pub user_address: String,
    pub from_token: String,
    pub to_token: String,
    pub amount: String,
    /// Must be the user's own address when given; the delegation does not
    /// authorize paying anyone else.
    pub recipient: Option<String>,
    /// Chain the client is connected to.
    pub chain_id: u64,
}

/// One-click swap: the relayer deposits through the user's smart account and
/// settles in the same call.
pub async fn delegated_swap<H: Host>(host: &H, request: &DelegatedSwapRequest) -> RelayResult<BridgeStatus> {
    if host.read(|state| state.config.paused) {
        return Err(RelayError::Paused);
    }
    let action = Action::from_assets(Asset::parse(&request.from_token)?, Asset::parse(&request.to_token)?)?;
    let user = Address::parse("user_address", &request.user_address)?;
    if let Some(raw) = request.recipient.as_deref().filter(|raw| !raw.trim().is_empty()) {
        let recipient = Address::parse("recipient", raw)?;
        if recipient != user {
            return Err(RelayError::RecipientNotDelegated {
                recipient: recipient.to_string(),
            });
        }
    }
    let swap = SwapRequest {
        action,
        amount: Amount::parse(&request.amount)?,
        user,
        recipient: user,
    };
    let mut orchestrator = BridgeOrchestrator::new(HostBackend {
        host,
        active_chain_id: request.chain_id,
    });
    orchestrator.run(swap).await.cloned()
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::delegation::{authorization_message, default_capabilities, register, RegisterDelegationRequest};
    use crate::evm::rpc::{ReceiptStatus, TxReceipt};
    use crate::host::{Clock, StateStore};
    use crate::price::{PriceQuote, QuoteSource};
    use crate::testing::{personal_sign, MockHost, USER_KEY};

    const MONAD: u64 = 10_143;
    const SEPOLIA: u64 = 11_155_111;

    struct ScriptedBackend {
        active_chain_id: u64,
        delegation: Option<Delegation>,
        settle_result: RelayResult<()>,
        calls: RefCell<Vec<&'static str>>,
    }

    impl ScriptedBackend {
        fn new(active_chain_id: u64) -> Self {
            Self {
                active_chain_id,
                delegation: None,
                settle_result: Ok(()),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    fn quote(asset: Asset) -> PriceQuote {
        PriceQuote {
            asset,
            usd_price: 1.0,
            source: QuoteSource::Fallback,
            timestamp_ms: 0,
        }
    }

    impl SwapBackend for &ScriptedBackend {
        fn active_chain_id(&self) -> u64 {
            self.active_chain_id
        }

        fn chain_id(&self, network: Network) -> u64 {
            match network {
                Network::Monad => MONAD,
                Network::Sepolia => SEPOLIA,
            }
        }

        async fn fetch_delegation(&self, _user: &Address) -> Option<Delegation> {
            self.delegation.clone()
        }

        async fn send_source(&self, _request: &SwapRequest) -> RelayResult<TxHash> {
            self.calls.borrow_mut().push("send_source");
            Ok(TxHash::from_bytes([0x01; 32]))
        }

        async fn wait_source(&self, _network: Network, _tx_hash: &TxHash) -> RelayResult<()> {
            self.calls.borrow_mut().push("wait_source");
            Ok(())
        }

        async fn delegated_source(&self, _delegation: &Delegation, _request: &SwapRequest) -> RelayResult<TxHash> {
            self.calls.borrow_mut().push("delegated_source");
            Ok(TxHash::from_bytes([0x02; 32]))
        }

        async fn settle(&self, request: &SettlementRequest) -> RelayResult<SettlementReceipt> {
            self.calls.borrow_mut().push("settle");
            self.settle_result.clone()?;
            Ok(SettlementReceipt {
                transfer_id: request.source_tx_hash.clone().unwrap_or_default(),
                action: Action::from_tag(&request.action)?,
                recipient: request.recipient.clone(),
                source_amount: request.amount.clone(),
                tx_hash: format!("0x{}", "03".repeat(32)),
                receipt: TxReceipt {
                    transaction_hash: format!("0x{}", "03".repeat(32)),
                    block_number: 1,
                    gas_used: 21_000u32.into(),
                    status: ReceiptStatus::Success,
                },
                computed_amount: request.amount.clone(),
                source_price: quote(Asset::Mon),
                destination_price: quote(Asset::Eth),
                replayed: false,
            })
        }
    }

    fn swap(action: Action) -> SwapRequest {
        SwapRequest {
            action,
            amount: Amount::parse("1").unwrap(),
            user: Address::from_bytes([0x0a; 20]),
            recipient: Address::from_bytes([0x0b; 20]),
        }
    }

    fn active_delegation() -> Delegation {
        Delegation {
            user_address: Address::from_bytes([0x0a; 20]).to_string(),
            smart_account_address: Address::from_bytes([0x0c; 20]).to_string(),
            delegate: Address::from_bytes([0x0d; 20]).to_string(),
            signature: Vec::new(),
            capabilities: Vec::new(),
            is_active: true,
            issued_at_ms: 0,
            expires_at_ms: u64::MAX,
            created_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn interactive_swap_walks_every_phase() {
        let backend = ScriptedBackend::new(MONAD);
        let mut orchestrator = BridgeOrchestrator::new(&backend);
        let status = orchestrator.run(swap(Action::SwapForward)).await.unwrap().clone();
        assert_eq!(
            status.history,
            vec![
                BridgePhase::Idle,
                BridgePhase::SourcePending,
                BridgePhase::SourceConfirmed,
                BridgePhase::TargetPending,
                BridgePhase::TargetConfirmed,
            ]
        );
        assert!(status.source_tx_hash.is_some() && status.target_tx_hash.is_some());
        assert_eq!(*backend.calls.borrow(), vec!["send_source", "wait_source", "settle"]);

        // Terminal phases are final.
        assert_eq!(
            orchestrator.run(swap(Action::SwapForward)).await.unwrap_err(),
            RelayError::SwapAlreadyStarted
        );
    }

    #[tokio::test]
    async fn wrong_chain_never_reaches_source_pending() {
        let backend = ScriptedBackend::new(SEPOLIA);
        let mut orchestrator = BridgeOrchestrator::new(&backend);
        let err = orchestrator.run(swap(Action::SwapForward)).await.unwrap_err();
        assert_eq!(
            err,
            RelayError::WrongSourceChain {
                expected: MONAD,
                actual: SEPOLIA
            }
        );
        assert_eq!(orchestrator.status().phase, BridgePhase::Idle);
        assert!(backend.calls.borrow().is_empty());
    }

    #[tokio::test]
    async fn active_delegation_collapses_source_leg() {
        let mut backend = ScriptedBackend::new(SEPOLIA);
        backend.delegation = Some(active_delegation());
        let mut orchestrator = BridgeOrchestrator::new(&backend);
        let status = orchestrator.run(swap(Action::SwapReverse)).await.unwrap().clone();
        assert_eq!(status.phase, BridgePhase::TargetConfirmed);
        assert!(status.delegated);
        assert_eq!(*backend.calls.borrow(), vec!["delegated_source", "settle"]);
    }

    #[tokio::test]
    async fn inactive_delegation_falls_back_to_interactive_flow() {
        let mut backend = ScriptedBackend::new(SEPOLIA);
        backend.delegation = Some(Delegation {
            is_active: false,
            ..active_delegation()
        });
        let mut orchestrator = BridgeOrchestrator::new(&backend);
        orchestrator.run(swap(Action::SwapReverse)).await.unwrap();
        assert_eq!(backend.calls.borrow()[0], "send_source");
    }

    #[tokio::test]
    async fn payout_failure_is_flagged_for_reconciliation_with_hint() {
        let mut backend = ScriptedBackend::new(MONAD);
        backend.settle_result = Err(RelayError::InsufficientLiquidity {
            network: "Sepolia".into(),
            symbol: "ETH".into(),
            required: "1.100000".into(),
            available: "1.050000".into(),
            max_payable: Some("0.954545".into()),
        });
        let mut orchestrator = BridgeOrchestrator::new(&backend);
        let status = orchestrator.run(swap(Action::SwapForward)).await.unwrap().clone();
        assert_eq!(status.phase, BridgePhase::Error);
        assert!(status.needs_reconciliation);
        let message = status.error.unwrap();
        assert!(message.contains("Try 0.954545 ETH or less"));
        assert!(message.contains("Try a smaller amount"));
    }

    fn register_user(host: &MockHost) {
        let user = host.user_address();
        let issued = host.now_ms();
        let message = host.read(|state| {
            authorization_message(
                &user.to_string(),
                "0x00000000000000000000000000000000000000aa",
                &state.config.relayer_address().unwrap().to_string(),
                &default_capabilities(&state.config).unwrap(),
                issued,
                issued + state.config.delegation_ttl_ms,
            )
        });
        register(
            host,
            &RegisterDelegationRequest {
                user_address: user.to_string(),
                smart_account_address: "0x00000000000000000000000000000000000000aa".into(),
                signature: personal_sign(&USER_KEY, &message),
                issued_at_ms: issued,
            },
        )
        .unwrap();
    }

    fn funded_host() -> MockHost {
        let host = MockHost::with_bundlers();
        host.unpause();
        host.set_price("ethereum", Ok(2.0));
        host.set_fallback(Network::Monad, 1.0);
        let relayer = host.relayer_address();
        for chain_id in [MONAD, SEPOLIA] {
            host.set_balance(chain_id, &relayer, Amount::parse("10").unwrap().wei().clone());
        }
        host
    }

    fn delegated_request(host: &MockHost, chain_id: u64) -> DelegatedSwapRequest {
        DelegatedSwapRequest {
            user_address: host.user_address().to_string(),
            from_token: "MON".into(),
            to_token: "eth".into(),
            amount: "2".into(),
            recipient: None,
            chain_id,
        }
    }

    #[tokio::test]
    async fn delegated_swap_deposits_and_settles() {
        let host = funded_host();
        register_user(&host);

        let status = delegated_swap(&host, &delegated_request(&host, MONAD)).await.unwrap();
        assert_eq!(status.phase, BridgePhase::TargetConfirmed);
        assert!(status.delegated);
        assert_eq!(host.user_operations().len(), 1);

        let payouts = host.sent_transactions(SEPOLIA);
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].to, host.user_address());
        assert_eq!(payouts[0].value, Amount::parse("1").unwrap().wei().clone());
    }

    #[tokio::test]
    async fn delegated_swap_without_delegation_moves_nothing() {
        let host = funded_host();
        let status = delegated_swap(&host, &delegated_request(&host, MONAD)).await.unwrap();
        assert_eq!(status.phase, BridgePhase::Error);
        assert!(!status.needs_reconciliation);
        assert!(host.user_operations().is_empty());
        assert!(host.sent_transactions(SEPOLIA).is_empty());
    }

    #[tokio::test]
    async fn delegated_swap_pays_only_the_delegating_user() {
        let host = funded_host();
        register_user(&host);

        let mut redirected = delegated_request(&host, MONAD);
        redirected.recipient = Some("0x000000000000000000000000000000000000dEaD".into());
        assert!(matches!(
            delegated_swap(&host, &redirected).await,
            Err(RelayError::RecipientNotDelegated { .. })
        ));
        assert!(host.user_operations().is_empty());
        assert!(host.sent_transactions(SEPOLIA).is_empty());

        let mut explicit = delegated_request(&host, MONAD);
        explicit.recipient = Some(host.user_address().to_string().to_uppercase().replacen("0X", "0x", 1));
        let status = delegated_swap(&host, &explicit).await.unwrap();
        assert_eq!(status.phase, BridgePhase::TargetConfirmed);
        assert_eq!(host.sent_transactions(SEPOLIA)[0].to, host.user_address());
    }

    #[tokio::test]
    async fn delegated_swap_rejects_unsupported_pairs() {
        let host = funded_host();
        let mut request = delegated_request(&host, MONAD);
        request.to_token = "WETH".into();
        assert!(matches!(
            delegated_swap(&host, &request).await,
            Err(RelayError::UnsupportedActionPair { .. })
        ));
    }
}
