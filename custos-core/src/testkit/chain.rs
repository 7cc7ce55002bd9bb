//! A chain client driven entirely by scripted state: pushed transfers,
//! queued failures, and per-hash receipt outcomes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use alloy_primitives::U256;
use async_trait::async_trait;

use crate::chain::{ChainClient, ChainError, SubmittedTx, TransferRecord, TxStatus};
use crate::entities::SettlementKind;

/// One payout accepted by the scripted node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub kind: SettlementKind,
    pub contract: String,
    pub token: String,
    pub recipient: String,
    pub amount_wei: U256,
    pub nonce: u64,
    pub tx_hash: String,
}

pub struct ScriptedChain {
    head: AtomicU64,
    transfers: Mutex<Vec<TransferRecord>>,
    explorer_transfers: Mutex<Vec<TransferRecord>>,
    scan_failures: Mutex<VecDeque<ChainError>>,
    explorer_failures: Mutex<VecDeque<ChainError>>,
    submit_failures: Mutex<VecDeque<ChainError>>,
    contract_balance: Mutex<U256>,
    pending_nonce: AtomicU64,
    submissions: Mutex<Vec<SubmissionRecord>>,
    submit_attempts: AtomicUsize,
    default_status: Mutex<TxStatus>,
    statuses: Mutex<HashMap<String, TxStatus>>,
}

impl Default for ScriptedChain {
    fn default() -> Self {
        Self {
            head: AtomicU64::new(0),
            transfers: Mutex::new(Vec::new()),
            explorer_transfers: Mutex::new(Vec::new()),
            scan_failures: Mutex::new(VecDeque::new()),
            explorer_failures: Mutex::new(VecDeque::new()),
            submit_failures: Mutex::new(VecDeque::new()),
            // Plenty by default so only tests about balance set it.
            contract_balance: Mutex::new(U256::MAX),
            pending_nonce: AtomicU64::new(0),
            submissions: Mutex::new(Vec::new()),
            submit_attempts: AtomicUsize::new(0),
            default_status: Mutex::new(TxStatus::Confirmed { block_number: 1 }),
            statuses: Mutex::new(HashMap::new()),
        }
    }
}

impl ScriptedChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, block: u64) {
        self.head.store(block, Ordering::SeqCst);
    }

    pub fn push_transfer(&self, record: TransferRecord) {
        lock(&self.transfers).push(record);
    }

    pub fn push_explorer_transfer(&self, record: TransferRecord) {
        lock(&self.explorer_transfers).push(record);
    }

    pub fn queue_scan_failure(&self, err: ChainError) {
        lock(&self.scan_failures).push_back(err);
    }

    pub fn queue_explorer_failure(&self, err: ChainError) {
        lock(&self.explorer_failures).push_back(err);
    }

    pub fn queue_submit_failure(&self, err: ChainError) {
        lock(&self.submit_failures).push_back(err);
    }

    pub fn set_contract_balance(&self, balance: U256) {
        *lock(&self.contract_balance) = balance;
    }

    pub fn set_pending_nonce(&self, nonce: u64) {
        self.pending_nonce.store(nonce, Ordering::SeqCst);
    }

    /// Receipt outcome for any hash without a specific one scripted.
    pub fn set_default_status(&self, status: TxStatus) {
        *lock(&self.default_status) = status;
    }

    pub fn set_tx_status(&self, tx_hash: &str, status: TxStatus) {
        lock(&self.statuses).insert(tx_hash.to_owned(), status);
    }

    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        lock(&self.submissions).clone()
    }

    /// Submission calls made, failed ones included.
    pub fn submit_attempts(&self) -> usize {
        self.submit_attempts.load(Ordering::SeqCst)
    }

    fn submit(
        &self,
        kind: SettlementKind,
        contract: &str,
        token: &str,
        recipient: &str,
        amount_wei: U256,
        nonce: u64,
    ) -> Result<SubmittedTx, ChainError> {
        self.submit_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.submit_failures).pop_front() {
            return Err(err);
        }
        let mut submissions = lock(&self.submissions);
        let tx_hash = format!("0xsub{}", submissions.len() + 1);
        submissions.push(SubmissionRecord {
            kind,
            contract: contract.to_owned(),
            token: token.to_owned(),
            recipient: recipient.to_owned(),
            amount_wei,
            nonce,
            tx_hash: tx_hash.clone(),
        });
        // The accepted transaction now sits in the scripted mempool.
        self.pending_nonce.store(nonce + 1, Ordering::SeqCst);
        Ok(SubmittedTx { tx_hash, nonce })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

#[async_trait]
impl ChainClient for ScriptedChain {
    async fn head_block(&self) -> Result<u64, ChainError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn transfers_to(
        &self,
        _token_address: &str,
        recipient: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferRecord>, ChainError> {
        if let Some(err) = lock(&self.scan_failures).pop_front() {
            return Err(err);
        }
        Ok(lock(&self.transfers)
            .iter()
            .filter(|r| {
                r.block_number >= from_block
                    && r.block_number <= to_block
                    && r.to.eq_ignore_ascii_case(recipient)
            })
            .cloned()
            .collect())
    }

    async fn explorer_transfers_to(
        &self,
        _token_address: &str,
        recipient: &str,
        from_block: u64,
    ) -> Result<Vec<TransferRecord>, ChainError> {
        if let Some(err) = lock(&self.explorer_failures).pop_front() {
            return Err(err);
        }
        Ok(lock(&self.explorer_transfers)
            .iter()
            .filter(|r| r.block_number >= from_block && r.to.eq_ignore_ascii_case(recipient))
            .cloned()
            .collect())
    }

    async fn contract_balance(
        &self,
        _token_address: &str,
        _holder: &str,
    ) -> Result<U256, ChainError> {
        Ok(*lock(&self.contract_balance))
    }

    async fn pending_nonce(&self) -> Result<u64, ChainError> {
        Ok(self.pending_nonce.load(Ordering::SeqCst))
    }

    async fn submit_release(
        &self,
        contract: &str,
        token_address: &str,
        recipient: &str,
        amount_wei: U256,
        nonce: u64,
    ) -> Result<SubmittedTx, ChainError> {
        self.submit(
            SettlementKind::Release,
            contract,
            token_address,
            recipient,
            amount_wei,
            nonce,
        )
    }

    async fn submit_refund(
        &self,
        contract: &str,
        token_address: &str,
        recipient: &str,
        amount_wei: U256,
        nonce: u64,
    ) -> Result<SubmittedTx, ChainError> {
        self.submit(
            SettlementKind::Refund,
            contract,
            token_address,
            recipient,
            amount_wei,
            nonce,
        )
    }

    async fn tx_status(&self, tx_hash: &str) -> Result<TxStatus, ChainError> {
        if let Some(status) = lock(&self.statuses).get(tx_hash) {
            return Ok(*status);
        }
        Ok(*lock(&self.default_status))
    }
}
