#![allow(dead_code)]

use anyhow::{anyhow, Result};
use solana_sdk::{hash::Hash, pubkey::Pubkey, transaction::Transaction};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use splitpay::config::{Payment, Recipient, Storage};
use splitpay::ledger::{
    LedgerRpc, TokenAmount, TokenBalance, TxEnvelope, TxMessage, TxMeta, TxRecord,
};
use splitpay::replay::SignatureGuard;
use splitpay::storage::Store;

pub const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

/// In-memory stand-in for the ledger RPC.
#[derive(Default)]
pub struct MockLedger {
    pub transactions: Mutex<HashMap<String, TxRecord>>,
    pub existing_accounts: Mutex<HashSet<Pubkey>>,
    pub blockhash: Hash,
    pub fail_rpc: AtomicBool,
    pub sent: Mutex<Vec<Transaction>>,
    pub block_height: AtomicU64,
    /// Scripted answers for confirmation polls, oldest first; once drained,
    /// every poll confirms.
    pub confirm_script: Mutex<VecDeque<bool>>,
}

impl MockLedger {
    pub fn new() -> Self {
        MockLedger::default()
    }

    pub fn insert_transaction(&self, signature: &str, record: TxRecord) {
        self.transactions
            .lock()
            .unwrap()
            .insert(signature.to_string(), record);
    }

    pub fn add_account(&self, account: Pubkey) {
        self.existing_accounts.lock().unwrap().insert(account);
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_rpc.store(failing, Ordering::SeqCst);
    }

    pub fn set_block_height(&self, height: u64) {
        self.block_height.store(height, Ordering::SeqCst);
    }

    pub fn script_confirmations(&self, answers: &[bool]) {
        self.confirm_script
            .lock()
            .unwrap()
            .extend(answers.iter().copied());
    }

    fn check_up(&self) -> Result<()> {
        if self.fail_rpc.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        Ok(())
    }
}

impl LedgerRpc for MockLedger {
    async fn get_transaction(&self, signature: &str) -> Result<Option<TxRecord>> {
        self.check_up()?;
        Ok(self.transactions.lock().unwrap().get(signature).cloned())
    }

    async fn get_latest_blockhash(&self) -> Result<(Hash, u64)> {
        self.check_up()?;
        Ok((self.blockhash, 1_000))
    }

    async fn get_block_height(&self) -> Result<u64> {
        self.check_up()?;
        Ok(self.block_height.load(Ordering::SeqCst))
    }

    async fn account_exists(&self, account: &Pubkey) -> Result<bool> {
        self.check_up()?;
        Ok(self.existing_accounts.lock().unwrap().contains(account))
    }

    async fn send_transaction(&self, tx: &Transaction) -> Result<String> {
        self.check_up()?;
        self.sent.lock().unwrap().push(tx.clone());
        Ok(tx
            .signatures
            .first()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unsigned".to_string()))
    }

    async fn confirm_transaction(&self, _signature: &str) -> Result<bool> {
        self.check_up()?;
        Ok(self.confirm_script.lock().unwrap().pop_front().unwrap_or(true))
    }

    async fn get_token_balance(&self, _token_account: &Pubkey) -> Result<u64> {
        self.check_up()?;
        Ok(0)
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0) as i64
}

/// Payment config with two fresh recipient wallets splitting 50/50.
pub fn test_payment() -> (Payment, Vec<Pubkey>) {
    let recipients = vec![Pubkey::new_unique(), Pubkey::new_unique()];
    let payment = Payment {
        fee: 0.30,
        mint: USDC_MINT.into(),
        recipients: recipients
            .iter()
            .map(|r| Recipient { address: r.to_string(), percent: 50 })
            .collect(),
        referral_percent: 10,
        recency_secs: 300,
        tolerance_percent: 1,
    };
    (payment, recipients)
}

/// One credited token account inside a transaction record: the account key
/// and its balance before and after, in minor units.
pub struct Credit {
    pub account: Pubkey,
    pub pre: u64,
    pub post: u64,
}

/// A successful transaction record crediting the given accounts with the
/// settlement token. Account keys: payer first, then each credited account.
pub fn payment_record(payer: &Pubkey, credits: &[Credit], block_time: i64) -> TxRecord {
    payment_record_with_mint(payer, credits, block_time, USDC_MINT)
}

pub fn payment_record_with_mint(
    payer: &Pubkey,
    credits: &[Credit],
    block_time: i64,
    mint: &str,
) -> TxRecord {
    let mut account_keys = vec![payer.to_string()];
    let mut pre = Vec::new();
    let mut post = Vec::new();
    for (i, credit) in credits.iter().enumerate() {
        account_keys.push(credit.account.to_string());
        let index = i + 1;
        pre.push(TokenBalance {
            account_index: index,
            mint: mint.to_string(),
            owner: None,
            ui_token_amount: TokenAmount { amount: credit.pre.to_string(), decimals: 6 },
        });
        post.push(TokenBalance {
            account_index: index,
            mint: mint.to_string(),
            owner: None,
            ui_token_amount: TokenAmount { amount: credit.post.to_string(), decimals: 6 },
        });
    }

    TxRecord {
        slot: 1,
        block_time: Some(block_time),
        meta: Some(TxMeta {
            err: None,
            pre_token_balances: pre,
            post_token_balances: post,
            loaded_addresses: None,
        }),
        transaction: TxEnvelope { message: TxMessage { account_keys } },
    }
}

pub fn open_store(dir: &tempfile::TempDir) -> Arc<Store> {
    splitpay::storage::open(&Storage { path: dir.path().to_str().unwrap().to_string() }).unwrap()
}

pub fn open_guard(store: Arc<Store>, capacity: usize) -> Arc<SignatureGuard> {
    Arc::new(SignatureGuard::open(store, capacity).unwrap())
}
