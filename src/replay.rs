// Replay guard: which payment signatures have already been accepted.
//
// Check-and-mark must be atomic under concurrent settlement attempts, and
// must survive a restart, so the set lives in rocksdb behind a mutex-guarded
// in-memory index. `try_mark` is the only acceptance point; at most one
// caller ever gets `true` for a given signature.

use anyhow::{Context, Result};
use rocksdb::WriteBatch;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::storage::{Store, CF_USED_SIG};

pub const DEFAULT_CAPACITY: usize = 10_000;

struct GuardInner {
    set: HashSet<String>,
    /// Acceptance order, oldest first. Drives eviction.
    order: VecDeque<String>,
    next_seq: u64,
}

pub struct SignatureGuard {
    store: Arc<Store>,
    inner: Mutex<GuardInner>,
    capacity: usize,
}

impl SignatureGuard {
    /// Load previously accepted signatures from disk, ordered by the
    /// acceptance sequence persisted alongside each entry.
    pub fn open(store: Arc<Store>, capacity: usize) -> Result<Self> {
        let cf = store.cf(CF_USED_SIG)?;
        let mut rows: Vec<(u64, String)> = Vec::new();
        for item in store.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, value) = item.context("iterate used signatures")?;
            if value.len() < 8 {
                continue;
            }
            let mut seq_bytes = [0u8; 8];
            seq_bytes.copy_from_slice(&value[..8]);
            let seq = u64::from_le_bytes(seq_bytes);
            rows.push((seq, String::from_utf8_lossy(&key).into_owned()));
        }
        rows.sort_by_key(|(seq, _)| *seq);

        let next_seq = rows.last().map(|(seq, _)| seq + 1).unwrap_or(0);
        let mut set = HashSet::with_capacity(rows.len());
        let mut order = VecDeque::with_capacity(rows.len());
        for (_, sig) in rows {
            set.insert(sig.clone());
            order.push_back(sig);
        }

        Ok(SignatureGuard {
            store,
            inner: Mutex::new(GuardInner { set, order, next_seq }),
            capacity: capacity.max(1),
        })
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.inner.lock().unwrap().set.contains(signature)
    }

    /// Atomically record the signature as consumed. Returns `false` when it
    /// was already present; the caller lost the race and must treat the
    /// payment as replayed.
    pub fn try_mark(&self, signature: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.set.contains(signature) {
            return Ok(false);
        }
        // Persist before exposing in memory, so a crash can never end up
        // having accepted a signature the disk set does not know about.
        let seq = inner.next_seq;
        self.store.db.put_cf(
            self.store.cf(CF_USED_SIG)?,
            signature.as_bytes(),
            seq.to_le_bytes(),
        )
        .context("persist used signature")?;
        inner.next_seq += 1;
        inner.set.insert(signature.to_string());
        inner.order.push_back(signature.to_string());

        if inner.set.len() > self.capacity {
            self.evict_oldest(&mut inner)?;
        }
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the oldest ~10% in one batch. Ledger transactions age out of the
    /// recency window long before they age out of the guard, so old entries
    /// carry no security value.
    fn evict_oldest(&self, inner: &mut GuardInner) -> Result<()> {
        let target = (self.capacity / 10).max(1);
        let cf = self.store.cf(CF_USED_SIG)?;
        let mut batch = WriteBatch::default();
        let mut evicted = 0u64;
        for _ in 0..target {
            let Some(sig) = inner.order.pop_front() else { break };
            batch.delete_cf(cf, sig.as_bytes());
            inner.set.remove(&sig);
            evicted += 1;
        }
        self.store.write_batch(batch)?;
        crate::metrics::EVICTED_SIGNATURES.inc_by(evicted);
        Ok(())
    }
}
