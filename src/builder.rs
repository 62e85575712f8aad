// Unsigned split-payment construction. The payer's wallet signs and submits;
// this code never touches a key except in the CLI `pay` helper below.

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use solana_sdk::{
    hash::Hash,
    instruction::Instruction,
    message::Message,
    pubkey::Pubkey,
    signature::{Keypair, Signer},
    transaction::Transaction,
};
use spl_associated_token_account::{
    get_associated_token_address, instruction::create_associated_token_account,
};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Payment;
use crate::ledger::LedgerRpc;
use crate::split::{self, FeeSplit};

/// Rebuild-and-resign attempts tolerated when submission fails on an expired
/// recency marker. User rejection and genuine errors are terminal.
pub const MAX_SUBMIT_ATTEMPTS: u32 = 3;

/// Delay between confirmation polls after a successful submission.
pub const CONFIRM_POLL: Duration = Duration::from_millis(400);

#[derive(Debug)]
pub struct BuiltPayment {
    pub transaction: Transaction,
    pub blockhash: Hash,
    pub last_valid_block_height: u64,
    pub split: FeeSplit,
}

/// Build the unsigned transaction moving the fee split from the payer to
/// each recipient's token account, creating missing recipient accounts at
/// the payer's expense. With a referrer, the commission transfer comes first.
pub async fn build_split_payment<L: LedgerRpc>(
    ledger: &L,
    payment: &Payment,
    payer: &Pubkey,
    referrer: Option<&Pubkey>,
) -> Result<BuiltPayment> {
    let mint = Pubkey::from_str(&payment.mint).context("invalid settlement mint")?;
    let split = split::compute(payment, referrer.is_some())?;

    // The payer must already hold the settlement currency; we never fund them.
    let payer_token_account = get_associated_token_address(payer, &mint);
    if !ledger.account_exists(&payer_token_account).await? {
        bail!("payer has no token account for the settlement currency");
    }

    // Transfer legs in order: commission first, then the platform split.
    let mut legs: Vec<(Pubkey, u64)> = Vec::new();
    if let Some(referrer) = referrer {
        legs.push((*referrer, split.referral_commission));
    }
    for (recipient, amount) in payment.recipients.iter().zip(split.amounts.iter()) {
        let owner = Pubkey::from_str(&recipient.address)
            .with_context(|| format!("invalid recipient address '{}'", recipient.address))?;
        legs.push((owner, *amount));
    }

    let mut instructions: Vec<Instruction> = Vec::new();

    // Recipients that never received the token need their associated account
    // created first; the payer bears that one-time cost.
    for (owner, amount) in &legs {
        if *amount == 0 {
            continue;
        }
        let ata = get_associated_token_address(owner, &mint);
        if !ledger.account_exists(&ata).await? {
            instructions.push(create_associated_token_account(
                payer,
                owner,
                &mint,
                &spl_token::id(),
            ));
        }
    }

    // Zero-amount transfers are omitted: wasteful at best, invalid at worst.
    for (owner, amount) in &legs {
        if *amount == 0 {
            continue;
        }
        let ata = get_associated_token_address(owner, &mint);
        instructions.push(spl_token::instruction::transfer(
            &spl_token::id(),
            &payer_token_account,
            &ata,
            payer,
            &[],
            *amount,
        )?);
    }

    if instructions.is_empty() {
        bail!("fee split contains no nonzero transfer");
    }

    let (blockhash, last_valid_block_height) = ledger.get_latest_blockhash().await?;
    let message = Message::new_with_blockhash(&instructions, Some(payer), &blockhash);
    let transaction = Transaction::new_unsigned(message);

    Ok(BuiltPayment { transaction, blockhash, last_valid_block_height, split })
}

/// Wire encoding handed to wallets: base64 over the ledger's binary format.
pub fn encode_transaction_b64(tx: &Transaction) -> Result<String> {
    let bytes = bincode::serialize(tx).context("serialize transaction")?;
    Ok(B64.encode(bytes))
}

/// Payer-side helper for the CLI: sign with a local keypair, submit, and
/// confirm. A transaction built too early gets rejected once its recency
/// marker expires, so expiry failures rebuild a fresh transaction and retry.
pub async fn pay_and_confirm<L: LedgerRpc>(
    ledger: &L,
    payment: &Payment,
    payer: &Keypair,
    referrer: Option<&Pubkey>,
) -> Result<String> {
    let payer_pk = payer.pubkey();
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 1..=MAX_SUBMIT_ATTEMPTS {
        let mut built = build_split_payment(ledger, payment, &payer_pk, referrer).await?;
        built
            .transaction
            .try_sign(&[payer], built.blockhash)
            .context("sign payment transaction")?;

        match ledger.send_transaction(&built.transaction).await {
            Ok(signature) => {
                // A submitted transaction stays live until its validity window
                // closes; resubmitting earlier risks charging the payer twice.
                // Poll until confirmed or the window is provably over.
                loop {
                    if ledger.confirm_transaction(&signature).await? {
                        return Ok(signature);
                    }
                    if ledger.get_block_height().await? > built.last_valid_block_height {
                        break;
                    }
                    tokio::time::sleep(CONFIRM_POLL).await;
                }
                eprintln!(
                    "transaction {signature} expired unconfirmed, rebuilding (attempt {attempt}/{MAX_SUBMIT_ATTEMPTS})"
                );
                last_err = Some(anyhow!("transaction {signature} expired unconfirmed"));
            }
            Err(e) => {
                let msg = format!("{e}");
                let expired = msg.contains("Blockhash not found")
                    || msg.contains("BlockhashNotFound")
                    || msg.contains("block height exceeded");
                if !expired {
                    return Err(e).context("submit payment transaction");
                }
                eprintln!(
                    "blockhash expired, rebuilding payment transaction (attempt {attempt}/{MAX_SUBMIT_ATTEMPTS})"
                );
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("payment submission failed")))
}
