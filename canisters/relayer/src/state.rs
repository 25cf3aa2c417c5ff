use std::collections::{BTreeMap, BTreeSet};

use candid::{CandidType, Principal};
use serde::{Deserialize, Serialize};

use crate::config::RelayerConfig;
use crate::delegation::Delegation;
use crate::ledger::LedgerEntry;
use crate::submitter::SubmissionLane;
use crate::types::Action;

const MAX_LOGS: usize = 1_000;

#[derive(Clone, Debug, Default, CandidType, Deserialize, Serialize)]
pub struct RelayerState {
    pub admins: BTreeSet<Principal>,
    pub config: RelayerConfig,
    /// Keyed by lowercase user address.
    pub delegations: BTreeMap<String, Delegation>,
    /// Keyed by transfer id.
    pub ledger: BTreeMap<String, LedgerEntry>,
    /// One lane per destination chain id.
    pub lanes: BTreeMap<u64, SubmissionLane>,
    pub logs: Vec<SettlementLog>,
    pub next_log_id: u64,
}

impl RelayerState {
    pub fn new(admins: BTreeSet<Principal>, config: RelayerConfig) -> Self {
        Self {
            admins,
            config,
            next_log_id: 1,
            ..Self::default()
        }
    }

    pub fn push_log(
        &mut self,
        now_ms: u64,
        transfer_id: String,
        action: Action,
        recipient: String,
        amount: String,
    ) -> u64 {
        let id = self.next_log_id.max(1);
        self.next_log_id = id + 1;
        self.logs.push(SettlementLog {
            id,
            ts_ms: now_ms,
            transfer_id,
            action,
            recipient,
            amount,
            status: SettlementStatus::Accepted,
            tx_hash: None,
            fail_reason: None,
        });
        if self.logs.len() > MAX_LOGS {
            let excess = self.logs.len() - MAX_LOGS;
            self.logs.drain(..excess);
        }
        id
    }

    pub fn mark_log_success(&mut self, log_id: u64, tx_hash: &str, replayed: bool) {
        if let Some(log) = self.logs.iter_mut().find(|log| log.id == log_id) {
            log.status = if replayed {
                SettlementStatus::Replayed
            } else {
                SettlementStatus::Settled
            };
            log.tx_hash = Some(tx_hash.to_string());
        }
    }

    pub fn mark_log_failure(&mut self, log_id: u64, reason: &str) {
        if let Some(log) = self.logs.iter_mut().find(|log| log.id == log_id) {
            log.status = SettlementStatus::Failed;
            log.fail_reason = Some(reason.to_string());
        }
    }

    /// Newest first. `start_after` is the last id of the previous page.
    pub fn log_page(&self, start_after: Option<u64>, limit: u32) -> Vec<LogEntry> {
        self.logs
            .iter()
            .rev()
            .filter(|log| start_after.map_or(true, |cursor| log.id < cursor))
            .take(limit.max(1) as usize)
            .map(LogEntry::from)
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, CandidType, Deserialize, Serialize)]
pub enum SettlementStatus {
    Accepted,
    Settled,
    Replayed,
    Failed,
}

#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct SettlementLog {
    pub id: u64,
    pub ts_ms: u64,
    pub transfer_id: String,
    pub action: Action,
    pub recipient: String,
    pub amount: String,
    pub status: SettlementStatus,
    pub tx_hash: Option<String>,
    pub fail_reason: Option<String>,
}

#[derive(Clone, Debug, CandidType, Deserialize, Serialize)]
pub struct LogEntry {
    pub id: u64,
    pub ts: u64,
    pub transfer_id: String,
    pub action: String,
    pub recipient: String,
    pub amount: String,
    pub tx: Option<String>,
    pub status: String,
    pub fail_reason: Option<String>,
}

impl From<&SettlementLog> for LogEntry {
    fn from(log: &SettlementLog) -> Self {
        LogEntry {
            id: log.id,
            ts: log.ts_ms,
            transfer_id: log.transfer_id.clone(),
            action: log.action.name().to_string(),
            recipient: log.recipient.clone(),
            amount: log.amount.clone(),
            tx: log.tx_hash.clone(),
            status: match log.status {
                SettlementStatus::Accepted => "accepted".to_string(),
                SettlementStatus::Settled => "settled".to_string(),
                SettlementStatus::Replayed => "replayed".to_string(),
                SettlementStatus::Failed => "failed".to_string(),
            },
            fail_reason: log.fail_reason.clone(),
        }
    }
}
