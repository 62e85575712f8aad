mod common;

use common::{test_payment, MockLedger};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signer;
use spl_associated_token_account::get_associated_token_address;
use splitpay::builder;
use splitpay::config::Payment;
use std::str::FromStr;

fn mint() -> Pubkey {
    Pubkey::from_str(common::USDC_MINT).unwrap()
}

/// Decoded view of one compiled instruction.
struct Ix {
    program: Pubkey,
    accounts: Vec<Pubkey>,
    data: Vec<u8>,
}

fn decode(tx: &solana_sdk::transaction::Transaction) -> Vec<Ix> {
    let keys = &tx.message.account_keys;
    tx.message
        .instructions
        .iter()
        .map(|ix| Ix {
            program: keys[ix.program_id_index as usize],
            accounts: ix.accounts.iter().map(|i| keys[*i as usize]).collect(),
            data: ix.data.clone(),
        })
        .collect()
}

fn transfer_amount(ix: &Ix) -> u64 {
    // SPL token transfer: tag 3 followed by the amount in little endian.
    assert_eq!(ix.data[0], 3);
    u64::from_le_bytes(ix.data[1..9].try_into().unwrap())
}

fn ledger_with_accounts(payment: &Payment, payer: &Pubkey, recipients: &[Pubkey]) -> MockLedger {
    let ledger = MockLedger::new();
    let mint = Pubkey::from_str(&payment.mint).unwrap();
    ledger.add_account(get_associated_token_address(payer, &mint));
    for r in recipients {
        ledger.add_account(get_associated_token_address(r, &mint));
    }
    ledger
}

#[tokio::test]
async fn payer_without_token_account_is_rejected() {
    let (payment, _) = test_payment();
    let payer = Pubkey::new_unique();
    let ledger = MockLedger::new();

    let err = builder::build_split_payment(&ledger, &payment, &payer, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no token account"));
}

#[tokio::test]
async fn builds_one_transfer_per_recipient() {
    let (payment, recipients) = test_payment();
    let payer = Pubkey::new_unique();
    let ledger = ledger_with_accounts(&payment, &payer, &recipients);

    let built = builder::build_split_payment(&ledger, &payment, &payer, None)
        .await
        .unwrap();

    assert_eq!(built.transaction.message.account_keys[0], payer);
    assert_eq!(built.transaction.message.recent_blockhash, built.blockhash);
    assert_eq!(built.last_valid_block_height, 1_000);

    let ixs = decode(&built.transaction);
    assert_eq!(ixs.len(), 2);
    for (ix, recipient) in ixs.iter().zip(&recipients) {
        assert_eq!(ix.program, spl_token::id());
        assert_eq!(transfer_amount(ix), 150_000);
        assert_eq!(ix.accounts[1], get_associated_token_address(recipient, &mint()));
    }
}

#[tokio::test]
async fn commission_transfer_comes_first() {
    let (payment, recipients) = test_payment();
    let payer = Pubkey::new_unique();
    let referrer = Pubkey::new_unique();
    let ledger = ledger_with_accounts(&payment, &payer, &recipients);
    ledger.add_account(get_associated_token_address(&referrer, &mint()));

    let built = builder::build_split_payment(&ledger, &payment, &payer, Some(&referrer))
        .await
        .unwrap();

    let ixs = decode(&built.transaction);
    assert_eq!(ixs.len(), 3);
    assert_eq!(transfer_amount(&ixs[0]), 30_000);
    assert_eq!(
        ixs[0].accounts[1],
        get_associated_token_address(&referrer, &mint())
    );
    assert_eq!(transfer_amount(&ixs[1]), 135_000);
    assert_eq!(transfer_amount(&ixs[2]), 135_000);
    assert_eq!(built.split.total, 300_000);
}

#[tokio::test]
async fn missing_recipient_accounts_are_created_first_at_payer_expense() {
    let (payment, recipients) = test_payment();
    let payer = Pubkey::new_unique();
    let ledger = MockLedger::new();
    // Payer and one recipient have accounts; the other does not.
    ledger.add_account(get_associated_token_address(&payer, &mint()));
    ledger.add_account(get_associated_token_address(&recipients[0], &mint()));

    let built = builder::build_split_payment(&ledger, &payment, &payer, None)
        .await
        .unwrap();

    let ixs = decode(&built.transaction);
    assert_eq!(ixs.len(), 3);
    // Account creation precedes every transfer, funded by the payer.
    assert_eq!(ixs[0].program, spl_associated_token_account::id());
    assert_eq!(ixs[0].accounts[0], payer);
    assert_eq!(ixs[1].program, spl_token::id());
    assert_eq!(ixs[2].program, spl_token::id());
}

#[tokio::test]
async fn zero_fee_has_nothing_to_transfer() {
    let (mut payment, recipients) = test_payment();
    payment.fee = 0.0;
    let payer = Pubkey::new_unique();
    let ledger = ledger_with_accounts(&payment, &payer, &recipients);

    let err = builder::build_split_payment(&ledger, &payment, &payer, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no nonzero transfer"));
}

#[tokio::test]
async fn pending_confirmation_is_polled_without_resubmitting() {
    let (payment, recipients) = test_payment();
    let payer = solana_sdk::signature::Keypair::new();
    let ledger = ledger_with_accounts(&payment, &payer.pubkey(), &recipients);
    // Two not-yet-confirmed polls while the transaction is still live.
    ledger.script_confirmations(&[false, false]);

    builder::pay_and_confirm(&ledger, &payment, &payer, None)
        .await
        .unwrap();

    // One intended payment, one submitted transaction.
    assert_eq!(ledger.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn rebuilds_only_after_the_validity_window_closes() {
    let (payment, recipients) = test_payment();
    let payer = solana_sdk::signature::Keypair::new();
    let ledger = ledger_with_accounts(&payment, &payer.pubkey(), &recipients);
    // The chain has moved past last_valid_block_height (1_000); the first
    // submission can no longer land, so a rebuild is safe.
    ledger.set_block_height(2_000);
    ledger.script_confirmations(&[false]);

    builder::pay_and_confirm(&ledger, &payment, &payer, None)
        .await
        .unwrap();

    assert_eq!(ledger.sent.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn encoded_transaction_round_trips() {
    let (payment, recipients) = test_payment();
    let payer = Pubkey::new_unique();
    let ledger = ledger_with_accounts(&payment, &payer, &recipients);

    let built = builder::build_split_payment(&ledger, &payment, &payer, None)
        .await
        .unwrap();
    let encoded = builder::encode_transaction_b64(&built.transaction).unwrap();

    use base64::{engine::general_purpose::STANDARD, Engine as _};
    let bytes = STANDARD.decode(encoded).unwrap();
    let decoded: solana_sdk::transaction::Transaction = bincode::deserialize(&bytes).unwrap();
    assert_eq!(decoded.message, built.transaction.message);
}
