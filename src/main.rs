use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signer::keypair::read_keypair_file;
use spl_associated_token_account::get_associated_token_address;
use std::str::FromStr;
use std::sync::Arc;

use splitpay::ledger::{HttpLedger, LedgerRpc};
use splitpay::settle::{ActionClient, SettleService};
use splitpay::{builder, config, metrics, replay, settle, split, storage};

#[derive(Parser)]
#[command(name = "splitpay", about = "Split-settlement payment service", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the settlement service.
    Serve,
    /// Build an unsigned payment transaction for a payer and print it base64
    /// encoded, ready for an external wallet to sign.
    BuildTx {
        payer: String,
        #[arg(long)]
        referrer: Option<String>,
    },
    /// Verify a payment signature against the ledger.
    Verify {
        signature: String,
        #[arg(long)]
        payer: Option<String>,
        #[arg(long)]
        referrer: Option<String>,
    },
    /// Sign and submit the payment from a local keypair file, then confirm.
    Pay {
        keypair: String,
        #[arg(long)]
        referrer: Option<String>,
    },
    /// Print the configured fee split.
    Split {
        #[arg(long)]
        referrer: bool,
    },
    /// Print a wallet's settlement-token balance.
    Balance { wallet: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;
    let ledger = Arc::new(HttpLedger::new(&cfg.ledger)?);

    match cli.command {
        Command::Serve => serve(cfg, ledger).await,
        Command::BuildTx { payer, referrer } => {
            let payer = Pubkey::from_str(&payer).context("invalid payer address")?;
            let referrer = parse_opt(referrer)?;
            let built =
                builder::build_split_payment(&ledger, &cfg.payment, &payer, referrer.as_ref())
                    .await?;
            println!("blockhash: {}", built.blockhash);
            println!("last valid block height: {}", built.last_valid_block_height);
            println!("{}", builder::encode_transaction_b64(&built.transaction)?);
            Ok(())
        }
        Command::Verify { signature, payer, referrer } => {
            let payer = parse_opt(payer)?;
            let referrer = parse_opt(referrer)?;
            let store = storage::open(&cfg.storage)?;
            let guard =
                Arc::new(replay::SignatureGuard::open(store, cfg.replay.capacity)?);
            let verifier =
                splitpay::Verifier::new(ledger, guard, cfg.payment.clone());
            match verifier
                .verify(&signature, payer.as_ref(), referrer.as_ref())
                .await
            {
                Ok(()) => {
                    println!("✅ payment verified");
                    Ok(())
                }
                Err(e) => {
                    eprintln!("❌ {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Pay { keypair, referrer } => {
            let payer = read_keypair_file(&keypair)
                .map_err(|e| anyhow::anyhow!("read keypair file '{keypair}': {e}"))?;
            let referrer = parse_opt(referrer)?;
            let signature =
                builder::pay_and_confirm(&ledger, &cfg.payment, &payer, referrer.as_ref())
                    .await?;
            println!("✅ payment confirmed: {signature}");
            Ok(())
        }
        Command::Split { referrer } => {
            let s = split::compute(&cfg.payment, referrer)?;
            println!("{}", serde_json::to_string_pretty(&s)?);
            Ok(())
        }
        Command::Balance { wallet } => {
            let wallet = Pubkey::from_str(&wallet).context("invalid wallet address")?;
            let mint = Pubkey::from_str(&cfg.payment.mint).context("invalid settlement mint")?;
            let ata = get_associated_token_address(&wallet, &mint);
            let amount = ledger.get_token_balance(&ata).await?;
            println!("{}", amount as f64 / split::MINOR_UNITS_PER_TOKEN as f64);
            Ok(())
        }
    }
}

async fn serve(cfg: config::Config, ledger: Arc<HttpLedger>) -> Result<()> {
    let store = storage::open(&cfg.storage)?;
    metrics::serve(cfg.metrics.clone())?;

    let guard = Arc::new(replay::SignatureGuard::open(store.clone(), cfg.replay.capacity)?);
    println!("🛡️  replay guard loaded with {} accepted signatures", guard.len());

    let action = ActionClient::new(cfg.service.action_url.clone())?;
    let bind = cfg.service.bind.clone();
    let svc = Arc::new(SettleService::new(cfg, ledger, guard, store, action));

    if svc.dev_bypass_allowed() {
        eprintln!("⚠️  unverified settlement is ENABLED (development mode)");
    }

    settle::serve(svc, &bind).await?;
    println!("🚀 settlement service listening on {bind}");

    tokio::signal::ctrl_c().await.context("wait for shutdown signal")?;
    println!("👋 shutting down");
    Ok(())
}

fn parse_opt(s: Option<String>) -> Result<Option<Pubkey>> {
    match s {
        None => Ok(None),
        Some(s) => Ok(Some(Pubkey::from_str(&s).context("invalid address")?)),
    }
}
