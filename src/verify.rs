// Payment verification against the ledger's own record.
//
// The signature is attacker-controlled input: the browser wallet built and
// submitted the transaction, so nothing the client claims about amounts or
// success is trusted. Ground truth is re-derived from the transaction's
// pre/post token-account balances, never from instruction data, which can be
// spoofed by non-standard encodings or wrapped instructions.

use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use spl_associated_token_account::get_associated_token_address;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Payment;
use crate::ledger::LedgerRpc;
use crate::replay::SignatureGuard;
use crate::split;

/// Why a claimed payment was rejected. Exactly one kind per rejection; the
/// first failing check short-circuits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyError {
    AlreadyUsed,
    NotFound,
    TransactionFailed,
    TooOld,
    NoAuthorizedPayment,
    InsufficientAmount,
    NetworkOrTimeout,
    ConfigurationInvalid,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            VerifyError::AlreadyUsed => "transaction signature already used",
            VerifyError::NotFound => "transaction not found",
            VerifyError::TransactionFailed => "transaction failed",
            VerifyError::TooOld => "transaction too old (must be within the recency window)",
            VerifyError::NoAuthorizedPayment => "no payment to authorized wallets found",
            VerifyError::InsufficientAmount => "insufficient payment amount",
            VerifyError::NetworkOrTimeout => "ledger lookup failed",
            VerifyError::ConfigurationInvalid => "payment configuration invalid",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for VerifyError {}

pub struct Verifier<L: LedgerRpc> {
    ledger: L,
    guard: Arc<SignatureGuard>,
    payment: Payment,
}

impl<L: LedgerRpc> Verifier<L> {
    pub fn new(ledger: L, guard: Arc<SignatureGuard>, payment: Payment) -> Self {
        Verifier { ledger, guard, payment }
    }

    /// Authoritatively decide whether `signature` is a valid, sufficient,
    /// non-replayed payment to the configured recipients.
    ///
    /// When `referrer` is given, its token account joins the recognized
    /// recipient set: the commission leg then counts toward the expected
    /// total, which always covers the full fee.
    pub async fn verify(
        &self,
        signature: &str,
        expected_payer: Option<&Pubkey>,
        referrer: Option<&Pubkey>,
    ) -> Result<(), VerifyError> {
        if self.guard.contains(signature) {
            crate::metrics::REPLAY_ATTEMPTS.inc();
            return reject(VerifyError::AlreadyUsed);
        }

        let mint = Pubkey::from_str(&self.payment.mint)
            .map_err(|_| rejected(VerifyError::ConfigurationInvalid))?;
        let recipients: Vec<Pubkey> = self
            .payment
            .recipients
            .iter()
            .map(|r| Pubkey::from_str(&r.address))
            .collect::<Result<_, _>>()
            .map_err(|_| rejected(VerifyError::ConfigurationInvalid))?;
        let expected = split::compute(&self.payment, referrer.is_some())
            .map_err(|_| rejected(VerifyError::ConfigurationInvalid))?;

        // Fail closed: an unreachable or slow ledger never verifies anything.
        let record = self
            .ledger
            .get_transaction(signature)
            .await
            .map_err(|e| {
                eprintln!("ledger lookup for {signature} failed: {e:#}");
                rejected(VerifyError::NetworkOrTimeout)
            })?;
        let Some(record) = record else {
            return reject(VerifyError::NotFound);
        };
        // A record without metadata cannot be re-derived from; treat it the
        // same as an unknown signature.
        let Some(meta) = record.meta.as_ref() else {
            return reject(VerifyError::NotFound);
        };

        // A signature existing does not imply success.
        if meta.err.is_some() {
            return reject(VerifyError::TransactionFailed);
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0) as i64;
        // No timestamp means the age cannot be established; treat as stale
        // rather than waving it through.
        let Some(block_time) = record.block_time else {
            return reject(VerifyError::TooOld);
        };
        if now - block_time > self.payment.recency_secs as i64 {
            return reject(VerifyError::TooOld);
        }

        let keys = record.all_account_keys();
        if let Some(payer) = expected_payer {
            // Fee payer is always the first account key.
            if keys.first().map(String::as_str) != Some(payer.to_string().as_str()) {
                return reject(VerifyError::NoAuthorizedPayment);
            }
        }

        // Recognized destinations: the platform recipients' token accounts
        // for the settlement mint, plus the referrer's when declared.
        let mut watched: Vec<String> = recipients
            .iter()
            .map(|r| get_associated_token_address(r, &mint).to_string())
            .collect();
        if let Some(referrer) = referrer {
            watched.push(get_associated_token_address(referrer, &mint).to_string());
        }

        let mint_str = mint.to_string();
        let mut total_received: i128 = 0;
        let mut found_recipient = false;
        for post in &meta.post_token_balances {
            // Deltas on any other mint never count, even if the number matches.
            if post.mint != mint_str {
                continue;
            }
            let Some(key) = keys.get(post.account_index) else { continue };
            if !watched.iter().any(|w| w == key) {
                continue;
            }
            found_recipient = true;
            let pre = meta
                .pre_token_balances
                .iter()
                .find(|p| p.account_index == post.account_index)
                .and_then(|p| p.ui_token_amount.amount.parse::<i128>().ok())
                .unwrap_or(0);
            let post_amount = post.ui_token_amount.amount.parse::<i128>().unwrap_or(0);
            total_received += post_amount - pre;
        }

        if !found_recipient {
            return reject(VerifyError::NoAuthorizedPayment);
        }

        // 1% tolerance absorbs conversion noise without permitting meaningful
        // underpayment.
        let min_expected =
            expected.total * (100 - self.payment.tolerance_percent.min(100)) / 100;
        if total_received < min_expected as i128 {
            return reject(VerifyError::InsufficientAmount);
        }

        // Atomic acceptance: a concurrent duplicate of the same signature
        // loses here even if it passed every check above.
        match self.guard.try_mark(signature) {
            Ok(true) => {}
            Ok(false) => {
                crate::metrics::REPLAY_ATTEMPTS.inc();
                return reject(VerifyError::AlreadyUsed);
            }
            Err(e) => {
                eprintln!("replay guard write for {signature} failed: {e:#}");
                return reject(VerifyError::NetworkOrTimeout);
            }
        }

        crate::metrics::VERIFY_OK.inc();
        Ok(())
    }
}

fn rejected(kind: VerifyError) -> VerifyError {
    crate::metrics::VERIFY_FAIL.inc();
    kind
}

fn reject(kind: VerifyError) -> Result<(), VerifyError> {
    Err(rejected(kind))
}
