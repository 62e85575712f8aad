use anyhow::{Context, Result};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

/// Accepted payment signatures (replay guard).
pub const CF_USED_SIG: &str = "used_sig";
/// Referral identities keyed by wallet address.
pub const CF_REFERRAL_USER: &str = "referral_user";
/// Referral earnings keyed by payment signature.
pub const CF_REFERRAL_EARNING: &str = "referral_earning";

const CF_NAMES: [&str; 4] = ["default", CF_USED_SIG, CF_REFERRAL_USER, CF_REFERRAL_EARNING];

pub struct Store {
    pub db: DB,
}

impl Store {
    pub fn open(base_path: &str) -> Result<Self> {
        let mut cf_opts = Options::default();
        cf_opts.set_write_buffer_size(8 * 1024 * 1024);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = CF_NAMES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_opts.clone()))
            .collect();

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        std::fs::create_dir_all(base_path).ok();

        let db = DB::open_cf_descriptors(&db_opts, base_path, cf_descriptors)
            .with_context(|| format!("Failed to open database at '{base_path}'"))?;

        Ok(Store { db })
    }

    pub fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", name))
    }

    pub fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let data = bincode::serialize(value)
            .with_context(|| format!("Failed to serialize value for key '{key:?}' in CF '{cf}'"))?;
        let handle = self.cf(cf)?;
        self.db
            .put_cf(handle, key, &data)
            .with_context(|| format!("Failed to PUT to database for key '{key:?}' in CF '{cf}'"))
    }

    pub fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.cf(cf)?;
        match self.db.get_cf(handle, key)? {
            Some(value) => {
                let deser = bincode::deserialize(&value[..]).with_context(|| {
                    format!("Failed to deserialize value for key '{key:?}' in CF '{cf}'")
                })?;
                Ok(Some(deser))
            }
            None => Ok(None),
        }
    }

    pub fn exists(&self, cf: &str, key: &[u8]) -> Result<bool> {
        let handle = self.cf(cf)?;
        Ok(self.db.get_cf(handle, key)?.is_some())
    }

    pub fn delete(&self, cf: &str, key: &[u8]) -> Result<()> {
        let handle = self.cf(cf)?;
        self.db
            .delete_cf(handle, key)
            .with_context(|| format!("Failed to DELETE key '{key:?}' in CF '{cf}'"))
    }

    /// Atomically applies a set of writes.
    pub fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .write(batch)
            .with_context(|| "Failed to write batch to database")
    }
}

pub fn open(cfg: &crate::config::Storage) -> Result<Arc<Store>> {
    let store = Store::open(&cfg.path)?;
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_get_roundtrip_per_cf() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path().to_str().unwrap()).unwrap();

        store.put(CF_USED_SIG, b"sig-1", &42u64).unwrap();
        let got: Option<u64> = store.get(CF_USED_SIG, b"sig-1").unwrap();
        assert_eq!(got, Some(42));

        // Same key in another CF is independent.
        let other: Option<u64> = store.get(CF_REFERRAL_USER, b"sig-1").unwrap();
        assert!(other.is_none());

        store.delete(CF_USED_SIG, b"sig-1").unwrap();
        assert!(!store.exists(CF_USED_SIG, b"sig-1").unwrap());
    }
}
