// Settlement orchestration: verification gates the paid action, referral
// bookkeeping is a best-effort side effect of an already-confirmed payment.
// HTTP surface follows the same minimal JSON routing as the rest of our
// services.

use anyhow::{bail, Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Server};
use serde::{Deserialize, Serialize};
use serde_json::json;
use solana_sdk::pubkey::Pubkey;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::builder;
use crate::config::Config;
use crate::ledger::LedgerRpc;
use crate::referral::ReferralLedger;
use crate::replay::SignatureGuard;
use crate::split::{self, FeeSplit};
use crate::storage::Store;
use crate::verify::{Verifier, VerifyError};

/// The paid operation a verified payment unlocks. Analysis generation lives
/// outside this service; this is the seam it is invoked through.
pub trait PaidAction: Send + Sync + 'static {
    fn execute(
        &self,
        params: serde_json::Value,
    ) -> impl Future<Output = Result<serde_json::Value>> + Send;
}

/// Production action client: forwards to the configured endpoint, or merely
/// acknowledges the unlock when none is configured.
pub struct ActionClient {
    url: Option<String>,
    client: reqwest::Client,
}

impl ActionClient {
    pub fn new(url: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("build action http client")?;
        Ok(ActionClient { url, client })
    }
}

impl PaidAction for ActionClient {
    async fn execute(&self, params: serde_json::Value) -> Result<serde_json::Value> {
        let Some(url) = &self.url else {
            return Ok(json!({ "unlocked": true, "params": params }));
        };
        let resp = self
            .client
            .post(url)
            .json(&params)
            .send()
            .await
            .context("paid action http")?;
        if !resp.status().is_success() {
            bail!("paid action endpoint returned {}", resp.status());
        }
        resp.json().await.context("paid action decode")
    }
}

/// Why a settlement request was turned away before the paid action ran.
#[derive(Debug)]
pub enum SettleRejection {
    PaymentRequired,
    Verification(VerifyError),
    Action(anyhow::Error),
}

pub struct SettleService<L: LedgerRpc, A: PaidAction> {
    cfg: Config,
    ledger: Arc<L>,
    verifier: Verifier<Arc<L>>,
    referrals: ReferralLedger,
    action: A,
}

impl<L: LedgerRpc + 'static, A: PaidAction> SettleService<L, A> {
    pub fn new(
        cfg: Config,
        ledger: Arc<L>,
        guard: Arc<SignatureGuard>,
        store: Arc<Store>,
        action: A,
    ) -> Self {
        let verifier = Verifier::new(ledger.clone(), guard, cfg.payment.clone());
        let referrals = ReferralLedger::new(store);
        SettleService { cfg, ledger, verifier, referrals, action }
    }

    pub fn referrals(&self) -> &ReferralLedger {
        &self.referrals
    }

    /// The unverified path exists for local development only and is double
    /// gated: both the environment and the explicit flag must opt in.
    pub fn dev_bypass_allowed(&self) -> bool {
        self.cfg.service.environment == "development" && self.cfg.service.allow_unverified
    }

    /// Verify the claimed payment, then record the referral commission as a
    /// fire-and-forget side effect. Bookkeeping failure never rolls back or
    /// surfaces; the payment is already confirmed on the ledger.
    pub async fn settle_payment(
        &self,
        payer: &Pubkey,
        signature: &str,
        referrer: Option<&Pubkey>,
    ) -> Result<(), VerifyError> {
        self.verifier.verify(signature, Some(payer), referrer).await?;

        if let Some(referrer) = referrer {
            let split = match split::compute(&self.cfg.payment, true) {
                Ok(s) => s,
                // Verification already validated the config; don't fail a
                // verified payment over bookkeeping.
                Err(e) => {
                    eprintln!("fee split for referral recording failed: {e:#}");
                    return Ok(());
                }
            };
            let referrals = self.referrals.clone();
            let referrer = referrer.to_string();
            let payer = payer.to_string();
            let signature = signature.to_string();
            tokio::spawn(async move {
                match referrals.record_earning(
                    &referrer,
                    &payer,
                    &signature,
                    split.referral_commission,
                    split.total,
                ) {
                    Ok(true) => {
                        crate::metrics::REFERRAL_RECORDED.inc();
                        println!(
                            "💸 recorded referral earning of {} minor units to {referrer}",
                            split.referral_commission
                        );
                    }
                    Ok(false) => {} // already recorded for this signature
                    Err(e) => {
                        crate::metrics::REFERRAL_RECORD_FAILED.inc();
                        eprintln!("referral recording failed for {signature}: {e:#}");
                    }
                }
            });
        }

        Ok(())
    }

    /// Request-level flow: gate on payment, then run the paid action exactly
    /// once per accepted signature. The action's own failure does not
    /// un-verify the payment; there is no refund path here.
    pub async fn settle_and_execute(
        &self,
        payer: &Pubkey,
        signature: Option<&str>,
        referrer: Option<&Pubkey>,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, SettleRejection> {
        match signature {
            Some(sig) => self
                .settle_payment(payer, sig, referrer)
                .await
                .map_err(SettleRejection::Verification)?,
            None => {
                if !self.dev_bypass_allowed() {
                    return Err(SettleRejection::PaymentRequired);
                }
                eprintln!("⚠️  no payment signature supplied; proceeding unverified (development mode)");
            }
        }

        self.action.execute(params).await.map_err(SettleRejection::Action)
    }
}

// --- Minimal HTTP RPC (JSON) ---

#[derive(Deserialize)]
struct BuildTxReq {
    payer: String,
    #[serde(default)]
    referrer: Option<String>,
}

#[derive(Serialize)]
struct BuildTxResp {
    transaction_b64: String,
    blockhash: String,
    last_valid_block_height: u64,
    split: FeeSplit,
}

#[derive(Deserialize)]
struct SettleReq {
    payer: String,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    referrer: Option<String>,
    #[serde(default)]
    params: serde_json::Value,
}

pub async fn serve<L, A>(svc: Arc<SettleService<L, A>>, bind: &str) -> Result<()>
where
    L: LedgerRpc + 'static,
    A: PaidAction,
{
    let addr: std::net::SocketAddr = bind.parse().context("settle service bind parse")?;

    let make = make_service_fn(move |_conn| {
        let svc = svc.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let svc = svc.clone();
                async move { Ok::<_, std::convert::Infallible>(route(svc, req).await) }
            }))
        }
    });

    tokio::spawn(async move {
        if let Err(e) = Server::bind(&addr).serve(make).await {
            eprintln!("settle service error: {}", e);
        }
    });
    Ok(())
}

async fn route<L, A>(
    svc: Arc<SettleService<L, A>>,
    req: Request<Body>,
) -> hyper::Response<Body>
where
    L: LedgerRpc + 'static,
    A: PaidAction,
{
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    match (method, path.as_str()) {
        (Method::GET, "/health") => json_response(&json!({"ok": true}), 200),

        (Method::GET, "/fee_split") => {
            let with_referrer = referrer_flag(req.uri().query());
            match split::compute(&svc.cfg.payment, with_referrer) {
                Ok(s) => json_response(&s, 200),
                Err(e) => err_response(&format!("{e}"), 500),
            }
        }

        (Method::GET, p) if p.starts_with("/referral_stats/") => {
            let wallet = p.trim_start_matches("/referral_stats/");
            match svc.referrals.stats_for(wallet) {
                Ok(stats) => json_response(&stats, 200),
                Err(e) => err_response(&format!("{e}"), 500),
            }
        }

        (Method::POST, "/build_payment_tx") => {
            crate::metrics::BUILD_REQUESTS.inc();
            let body = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
            let req: BuildTxReq = match serde_json::from_slice(&body) {
                Ok(r) => r,
                Err(e) => return err_response(&format!("bad request: {e}"), 400),
            };
            let payer = match Pubkey::from_str(&req.payer) {
                Ok(p) => p,
                Err(_) => return err_response("invalid payer address", 400),
            };
            let referrer = match parse_opt_pubkey(req.referrer.as_deref()) {
                Ok(r) => r,
                Err(msg) => return err_response(msg, 400),
            };
            match builder::build_split_payment(
                svc.ledger.as_ref(),
                &svc.cfg.payment,
                &payer,
                referrer.as_ref(),
            )
            .await
            {
                Ok(built) => match builder::encode_transaction_b64(&built.transaction) {
                    Ok(transaction_b64) => json_response(
                        &BuildTxResp {
                            transaction_b64,
                            blockhash: built.blockhash.to_string(),
                            last_valid_block_height: built.last_valid_block_height,
                            split: built.split,
                        },
                        200,
                    ),
                    Err(e) => err_response(&format!("{e}"), 500),
                },
                Err(e) => err_response(&format!("{e}"), 400),
            }
        }

        (Method::POST, "/settle") => {
            crate::metrics::SETTLE_REQUESTS.inc();
            let body = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
            let req: SettleReq = match serde_json::from_slice(&body) {
                Ok(r) => r,
                Err(e) => return err_response(&format!("bad request: {e}"), 400),
            };
            let payer = match Pubkey::from_str(&req.payer) {
                Ok(p) => p,
                Err(_) => return err_response("invalid payer address", 400),
            };
            let referrer = match parse_opt_pubkey(req.referrer.as_deref()) {
                Ok(r) => r,
                Err(msg) => return err_response(msg, 400),
            };
            match svc
                .settle_and_execute(&payer, req.signature.as_deref(), referrer.as_ref(), req.params)
                .await
            {
                Ok(result) => json_response(&json!({"success": true, "result": result}), 200),
                Err(SettleRejection::PaymentRequired) => {
                    err_response("payment signature required", 402)
                }
                Err(SettleRejection::Verification(kind)) => json_response(
                    &json!({
                        "error": format!("payment verification failed: {kind}"),
                        "kind": kind,
                    }),
                    402,
                ),
                Err(SettleRejection::Action(e)) => {
                    eprintln!("paid action failed after verified payment: {e:#}");
                    err_response("paid action failed", 500)
                }
            }
        }

        _ => err_response("not found", 404),
    }
}

// Exact key match; substring matching would also accept unrelated keys
// that merely end in "referrer".
fn referrer_flag(query: Option<&str>) -> bool {
    query
        .map(|q| q.split('&').any(|kv| kv == "referrer=true"))
        .unwrap_or(false)
}

fn parse_opt_pubkey(s: Option<&str>) -> Result<Option<Pubkey>, &'static str> {
    match s {
        None => Ok(None),
        Some(s) => Pubkey::from_str(s)
            .map(Some)
            .map_err(|_| "invalid referrer address"),
    }
}

fn json_response<T: serde::Serialize>(val: &T, status: u16) -> hyper::Response<Body> {
    let body = serde_json::to_vec(val).unwrap_or_else(|_| b"{}".to_vec());
    let mut resp = hyper::Response::new(Body::from(body));
    *resp.status_mut() =
        hyper::StatusCode::from_u16(status).unwrap_or(hyper::StatusCode::OK);
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    resp
}

fn err_response(msg: &str, status: u16) -> hyper::Response<Body> {
    json_response(&json!({"error": msg}), status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referrer_flag_requires_the_exact_key() {
        assert!(referrer_flag(Some("referrer=true")));
        assert!(referrer_flag(Some("foo=1&referrer=true")));
        assert!(!referrer_flag(Some("noreferrer=true")));
        assert!(!referrer_flag(Some("referrer=false")));
        assert!(!referrer_flag(Some("referrer=truely")));
        assert!(!referrer_flag(None));
    }
}
