// Opaque ledger client interface plus the production JSON-RPC implementation.
// The verifier only ever consumes the typed record below; nothing downstream
// touches raw RPC responses.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use solana_sdk::{hash::Hash, pubkey::Pubkey, transaction::Transaction};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// A token-account balance snapshot attached to a transaction record.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenBalance {
    #[serde(rename = "accountIndex")]
    pub account_index: usize,
    pub mint: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(rename = "uiTokenAmount")]
    pub ui_token_amount: TokenAmount,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenAmount {
    /// Raw integer amount in minor units, as a decimal string.
    pub amount: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoadedAddresses {
    #[serde(default)]
    pub writable: Vec<String>,
    #[serde(default)]
    pub readonly: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxMeta {
    /// Non-null when the transaction itself errored on chain.
    pub err: Option<serde_json::Value>,
    #[serde(rename = "preTokenBalances", default)]
    pub pre_token_balances: Vec<TokenBalance>,
    #[serde(rename = "postTokenBalances", default)]
    pub post_token_balances: Vec<TokenBalance>,
    #[serde(rename = "loadedAddresses", default)]
    pub loaded_addresses: Option<LoadedAddresses>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxMessage {
    #[serde(rename = "accountKeys")]
    pub account_keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxEnvelope {
    pub message: TxMessage,
}

/// The ledger's record of a confirmed transaction, reduced to the fields
/// payment verification needs.
#[derive(Debug, Clone, Deserialize)]
pub struct TxRecord {
    pub slot: u64,
    #[serde(rename = "blockTime")]
    pub block_time: Option<i64>,
    pub meta: Option<TxMeta>,
    pub transaction: TxEnvelope,
}

impl TxRecord {
    /// Static account keys followed by lookup-table loaded addresses, in the
    /// index order token-balance entries refer to.
    pub fn all_account_keys(&self) -> Vec<String> {
        let mut keys = self.transaction.message.account_keys.clone();
        if let Some(meta) = &self.meta {
            if let Some(loaded) = &meta.loaded_addresses {
                keys.extend(loaded.writable.iter().cloned());
                keys.extend(loaded.readonly.iter().cloned());
            }
        }
        keys
    }
}

/// Everything the payment subsystem needs from the ledger network. All calls
/// are bounded by the client timeout; callers treat any error as fail-closed.
pub trait LedgerRpc: Send + Sync {
    /// Fetch a finalized-or-confirmed transaction record by signature.
    /// `Ok(None)` means the ledger does not know the signature.
    fn get_transaction(
        &self,
        signature: &str,
    ) -> impl Future<Output = Result<Option<TxRecord>>> + Send;

    /// Latest finalized blockhash and the block height it stays valid through.
    fn get_latest_blockhash(&self) -> impl Future<Output = Result<(Hash, u64)>> + Send;

    /// Current block height at confirmed commitment. Compared against a
    /// transaction's `last_valid_block_height` to decide whether it can
    /// still land.
    fn get_block_height(&self) -> impl Future<Output = Result<u64>> + Send;

    fn account_exists(&self, account: &Pubkey) -> impl Future<Output = Result<bool>> + Send;

    /// Submit a fully signed transaction; returns its signature string.
    fn send_transaction(&self, tx: &Transaction) -> impl Future<Output = Result<String>> + Send;

    /// True once the ledger reports the signature at confirmed commitment or
    /// better with no error.
    fn confirm_transaction(&self, signature: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Raw minor-unit balance of a token account (0 when the account is absent).
    fn get_token_balance(&self, token_account: &Pubkey)
        -> impl Future<Output = Result<u64>> + Send;
}

// Shared handles delegate, so services can hold Arc<L> and stay generic.
impl<L: LedgerRpc> LedgerRpc for Arc<L> {
    fn get_transaction(
        &self,
        signature: &str,
    ) -> impl Future<Output = Result<Option<TxRecord>>> + Send {
        (**self).get_transaction(signature)
    }

    fn get_latest_blockhash(&self) -> impl Future<Output = Result<(Hash, u64)>> + Send {
        (**self).get_latest_blockhash()
    }

    fn get_block_height(&self) -> impl Future<Output = Result<u64>> + Send {
        (**self).get_block_height()
    }

    fn account_exists(&self, account: &Pubkey) -> impl Future<Output = Result<bool>> + Send {
        (**self).account_exists(account)
    }

    fn send_transaction(&self, tx: &Transaction) -> impl Future<Output = Result<String>> + Send {
        (**self).send_transaction(tx)
    }

    fn confirm_transaction(&self, signature: &str) -> impl Future<Output = Result<bool>> + Send {
        (**self).confirm_transaction(signature)
    }

    fn get_token_balance(
        &self,
        token_account: &Pubkey,
    ) -> impl Future<Output = Result<u64>> + Send {
        (**self).get_token_balance(token_account)
    }
}

/// Production ledger client: raw Solana JSON-RPC over HTTP with a bounded
/// request timeout.
pub struct HttpLedger {
    url: String,
    client: reqwest::Client,
}

impl HttpLedger {
    pub fn new(cfg: &crate::config::Ledger) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("build ledger http client")?;
        Ok(HttpLedger { url: cfg.rpc_url.clone(), client })
    }

    async fn call(&self, method: &'static str, params: serde_json::Value) -> Result<serde_json::Value> {
        #[derive(Serialize)]
        struct RpcReq {
            jsonrpc: &'static str,
            id: u32,
            method: &'static str,
            params: serde_json::Value,
        }
        let rpc = RpcReq { jsonrpc: "2.0", id: 1, method, params };
        let resp = self
            .client
            .post(&self.url)
            .json(&rpc)
            .send()
            .await
            .with_context(|| format!("ledger rpc http ({method})"))?;
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("ledger rpc decode ({method})"))?;
        if let Some(err) = body.get("error") {
            return Err(anyhow!("ledger rpc error ({method}): {err}"));
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| anyhow!("ledger rpc ({method}): missing result"))
    }
}

impl LedgerRpc for HttpLedger {
    async fn get_transaction(&self, signature: &str) -> Result<Option<TxRecord>> {
        let result = self
            .call(
                "getTransaction",
                json!([signature, {
                    "encoding": "json",
                    "commitment": "confirmed",
                    "maxSupportedTransactionVersion": 0,
                }]),
            )
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let record: TxRecord =
            serde_json::from_value(result).context("decode transaction record")?;
        Ok(Some(record))
    }

    async fn get_latest_blockhash(&self) -> Result<(Hash, u64)> {
        // Finalized commitment gives the transaction the longest validity window.
        let result = self
            .call("getLatestBlockhash", json!([{"commitment": "finalized"}]))
            .await?;
        let value = result.get("value").ok_or_else(|| anyhow!("missing blockhash value"))?;
        let blockhash = value
            .get("blockhash")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("missing blockhash"))?;
        let last_valid = value
            .get("lastValidBlockHeight")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| anyhow!("missing lastValidBlockHeight"))?;
        let hash = Hash::from_str(blockhash).map_err(|e| anyhow!("bad blockhash: {e}"))?;
        Ok((hash, last_valid))
    }

    async fn get_block_height(&self) -> Result<u64> {
        let result = self
            .call("getBlockHeight", json!([{"commitment": "confirmed"}]))
            .await?;
        result
            .as_u64()
            .ok_or_else(|| anyhow!("getBlockHeight: non-numeric result"))
    }

    async fn account_exists(&self, account: &Pubkey) -> Result<bool> {
        let result = self
            .call(
                "getAccountInfo",
                json!([account.to_string(), {"encoding": "base64"}]),
            )
            .await?;
        Ok(result.get("value").map(|v| !v.is_null()).unwrap_or(false))
    }

    async fn send_transaction(&self, tx: &Transaction) -> Result<String> {
        let wire = bincode::serialize(tx).context("serialize transaction")?;
        let result = self
            .call(
                "sendTransaction",
                json!([B64.encode(wire), {
                    "encoding": "base64",
                    "preflightCommitment": "confirmed",
                    "maxRetries": 3,
                }]),
            )
            .await?;
        result
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("sendTransaction: non-string signature"))
    }

    async fn confirm_transaction(&self, signature: &str) -> Result<bool> {
        let result = self
            .call(
                "getSignatureStatuses",
                json!([[signature], {"searchTransactionHistory": true}]),
            )
            .await?;
        let status = match result.get("value").and_then(|v| v.get(0)) {
            Some(s) if !s.is_null() => s.clone(),
            _ => return Ok(false),
        };
        if status.get("err").map(|e| !e.is_null()).unwrap_or(false) {
            return Ok(false);
        }
        let commitment = status
            .get("confirmationStatus")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        Ok(commitment == "confirmed" || commitment == "finalized")
    }

    async fn get_token_balance(&self, token_account: &Pubkey) -> Result<u64> {
        let result = self
            .call("getTokenAccountBalance", json!([token_account.to_string()]))
            .await?;
        let amount = result
            .get("value")
            .and_then(|v| v.get("amount"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("missing token balance amount"))?;
        amount.parse::<u64>().context("parse token balance amount")
    }
}
