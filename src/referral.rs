// Referral bookkeeping: identities and commission earnings. The signature
// key makes earning inserts naturally idempotent, defense in depth beside
// the replay guard.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::storage::{Store, CF_REFERRAL_EARNING, CF_REFERRAL_USER};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub wallet_address: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralEarning {
    pub referrer: String,
    pub downline: String,
    pub tx_signature: String,
    pub commission_minor: u64,
    pub total_fee_minor: u64,
    pub created_at: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReferralStats {
    pub total_earnings: u64,
    pub total_commission_minor: u64,
}

#[derive(Clone)]
pub struct ReferralLedger {
    store: Arc<Store>,
}

impl ReferralLedger {
    pub fn new(store: Arc<Store>) -> Self {
        ReferralLedger { store }
    }

    pub fn get_or_create_user(&self, wallet: &str) -> Result<User> {
        if let Some(user) = self.store.get::<User>(CF_REFERRAL_USER, wallet.as_bytes())? {
            return Ok(user);
        }
        let user = User { wallet_address: wallet.to_string(), created_at: unix_now() };
        self.store.put(CF_REFERRAL_USER, wallet.as_bytes(), &user)?;
        Ok(user)
    }

    /// Record a commission earning keyed by the payment signature. Returns
    /// `false` when an earning for this signature already exists.
    pub fn record_earning(
        &self,
        referrer: &str,
        downline: &str,
        signature: &str,
        commission_minor: u64,
        total_fee_minor: u64,
    ) -> Result<bool> {
        if self.store.exists(CF_REFERRAL_EARNING, signature.as_bytes())? {
            return Ok(false);
        }
        self.get_or_create_user(referrer)?;
        self.get_or_create_user(downline)?;
        let earning = ReferralEarning {
            referrer: referrer.to_string(),
            downline: downline.to_string(),
            tx_signature: signature.to_string(),
            commission_minor,
            total_fee_minor,
            created_at: unix_now(),
        };
        self.store.put(CF_REFERRAL_EARNING, signature.as_bytes(), &earning)?;
        Ok(true)
    }

    pub fn earnings_for(&self, referrer: &str) -> Result<Vec<ReferralEarning>> {
        let cf = self.store.cf(CF_REFERRAL_EARNING)?;
        let mut earnings = Vec::new();
        for item in self.store.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (_key, value) = item?;
            if let Ok(earning) = bincode::deserialize::<ReferralEarning>(&value) {
                if earning.referrer == referrer {
                    earnings.push(earning);
                }
            }
        }
        Ok(earnings)
    }

    pub fn stats_for(&self, referrer: &str) -> Result<ReferralStats> {
        let mut stats = ReferralStats::default();
        for earning in self.earnings_for(referrer)? {
            stats.total_earnings += 1;
            stats.total_commission_minor += earning.commission_minor;
        }
        Ok(stats)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
