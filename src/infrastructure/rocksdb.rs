use crate::domain::authorization::{Authorization, AuthorizationChange, admit};
use crate::domain::ids::{AuthorizationId, CustomerId, LoanId, TransactionId};
use crate::domain::loan::PaymentOverride;
use crate::domain::ports::{
    AuthorizationStore, PaymentOverrideStore, SettlementStore, TransactionStore,
};
use crate::domain::settlement::SettlementRecord;
use crate::domain::transaction::{AchTransaction, TransactionFilter};
use crate::error::{AutopayError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family for authorizations, keyed by authorization id.
pub const CF_AUTHORIZATIONS: &str = "authorizations";
/// Column Family for ACH transactions, keyed by transaction id.
pub const CF_TRANSACTIONS: &str = "transactions";
/// Column Family for settlement records, keyed by the settled transaction id.
pub const CF_SETTLEMENTS: &str = "settlements";
/// Column Family for loan payment overrides, keyed by loan id.
pub const CF_PAYMENT_OVERRIDES: &str = "payment_overrides";

/// A persistent store implementation using RocksDB.
///
/// Values are serde_json documents. Operations that read siblings before
/// writing hold `write_lock` and commit through one `WriteBatch`, so they are
/// atomic with respect to each other and to a crash.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at `path`, creating the column
    /// families if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = [
            CF_AUTHORIZATIONS,
            CF_TRANSACTIONS,
            CF_SETTLEMENTS,
            CF_PAYMENT_OVERRIDES,
        ]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, families)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            AutopayError::InternalError(Box::new(std::io::Error::other(format!(
                "{name} column family not found"
            ))))
        })
    }

    fn get_json<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_pinned_cf(cf, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.cf(cf_name)?;
        self.db.put_cf(cf, key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn scan_json<T: DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            values.push(serde_json::from_slice(&value)?);
        }
        Ok(values)
    }

    fn write_authorizations(&self, records: &[Authorization]) -> Result<()> {
        let cf = self.cf(CF_AUTHORIZATIONS)?;
        let mut batch = WriteBatch::default();
        for record in records {
            batch.put_cf(cf, record.id.as_uuid().as_bytes(), serde_json::to_vec(record)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn authorizations_where(
        &self,
        predicate: impl Fn(&Authorization) -> bool,
    ) -> Result<Vec<Authorization>> {
        let mut matching: Vec<Authorization> = self
            .scan_json::<Authorization>(CF_AUTHORIZATIONS)?
            .into_iter()
            .filter(|a| predicate(a))
            .collect();
        matching.sort_by_key(|a| a.created_at);
        Ok(matching)
    }
}

#[async_trait]
impl AuthorizationStore for RocksDBStore {
    async fn get(&self, id: AuthorizationId) -> Result<Option<Authorization>> {
        self.get_json(CF_AUTHORIZATIONS, id.as_uuid().as_bytes())
    }

    async fn for_customer(&self, customer_id: &CustomerId) -> Result<Vec<Authorization>> {
        self.authorizations_where(|a| a.customer_id == *customer_id)
    }

    async fn for_loan(&self, loan_id: &LoanId) -> Result<Vec<Authorization>> {
        self.authorizations_where(|a| a.loan_id.as_ref() == Some(loan_id))
    }

    async fn insert(&self, authorization: Authorization) -> Result<Authorization> {
        let _guard = self.write_lock.lock().await;
        if AuthorizationStore::get(self, authorization.id).await?.is_some() {
            return Err(AutopayError::Conflict(format!(
                "Authorization {} already exists",
                authorization.id
            )));
        }
        let siblings = self.authorizations_where(|a| a.customer_id == authorization.customer_id)?;
        let changed = admit(authorization, siblings)?;
        self.write_authorizations(&changed)?;
        Ok(changed[0].clone())
    }

    async fn apply(
        &self,
        id: AuthorizationId,
        change: AuthorizationChange,
    ) -> Result<Authorization> {
        let _guard = self.write_lock.lock().await;
        let target = AuthorizationStore::get(self, id)
            .await?
            .ok_or_else(|| AutopayError::NotFound(format!("Authorization {id}")))?;
        let siblings =
            self.authorizations_where(|a| a.customer_id == target.customer_id && a.id != id)?;
        let changed = change.apply(target, siblings)?;
        self.write_authorizations(&changed)?;
        Ok(changed[0].clone())
    }
}

#[async_trait]
impl TransactionStore for RocksDBStore {
    async fn store(&self, mut txn: AchTransaction) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = txn.id.as_uuid().as_bytes().to_vec();
        if let Some(existing) = self.get_json::<AchTransaction>(CF_TRANSACTIONS, &key)? {
            txn.notification_sent |= existing.notification_sent;
        }
        self.put_json(CF_TRANSACTIONS, &key, &txn)
    }

    async fn get(&self, id: TransactionId) -> Result<Option<AchTransaction>> {
        self.get_json(CF_TRANSACTIONS, id.as_uuid().as_bytes())
    }

    async fn find_by_processor_id(&self, processor_id: &str) -> Result<Option<AchTransaction>> {
        Ok(self
            .scan_json::<AchTransaction>(CF_TRANSACTIONS)?
            .into_iter()
            .find(|t| t.processor_transaction_id.as_deref() == Some(processor_id)))
    }

    async fn query(&self, filter: &TransactionFilter) -> Result<Vec<AchTransaction>> {
        let mut matching: Vec<AchTransaction> = self
            .scan_json::<AchTransaction>(CF_TRANSACTIONS)?
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect();
        matching.sort_by_key(|t| (t.scheduled_date, t.created_at));
        Ok(matching)
    }

    async fn claim_notification(&self, id: TransactionId) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let key = id.as_uuid().as_bytes();
        let mut txn = self
            .get_json::<AchTransaction>(CF_TRANSACTIONS, key)?
            .ok_or_else(|| AutopayError::NotFound(format!("Transaction {id}")))?;
        if txn.notification_sent {
            return Ok(false);
        }
        txn.notification_sent = true;
        self.put_json(CF_TRANSACTIONS, key, &txn)?;
        Ok(true)
    }
}

#[async_trait]
impl SettlementStore for RocksDBStore {
    async fn insert_if_absent(&self, record: SettlementRecord) -> Result<(SettlementRecord, bool)> {
        let _guard = self.write_lock.lock().await;
        let key = record.transaction_id.as_uuid().as_bytes().to_vec();
        if let Some(existing) = self.get_json::<SettlementRecord>(CF_SETTLEMENTS, &key)? {
            return Ok((existing, false));
        }
        self.put_json(CF_SETTLEMENTS, &key, &record)?;
        Ok((record, true))
    }
}

#[async_trait]
impl PaymentOverrideStore for RocksDBStore {
    async fn find(&self, loan_id: &LoanId) -> Result<Option<PaymentOverride>> {
        self.get_json(CF_PAYMENT_OVERRIDES, loan_id.as_str().as_bytes())
    }

    async fn save(&self, entry: PaymentOverride) -> Result<()> {
        self.put_json(CF_PAYMENT_OVERRIDES, entry.loan_id.as_str().as_bytes(), &entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::authorization::tests::authorization;
    use crate::domain::transaction::TransactionStatus;
    use crate::domain::transaction::tests::scheduled;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_rocksdb_open_cf() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).expect("Failed to open RocksDB");

        assert!(store.db.cf_handle(CF_AUTHORIZATIONS).is_some());
        assert!(store.db.cf_handle(CF_TRANSACTIONS).is_some());
        assert!(store.db.cf_handle(CF_SETTLEMENTS).is_some());
        assert!(store.db.cf_handle(CF_PAYMENT_OVERRIDES).is_some());
    }

    #[tokio::test]
    async fn test_rocksdb_payment_override_survives_reopen() {
        let dir = tempdir().unwrap();
        let loan_id = LoanId::from("LOAN-1");
        let chosen = PaymentOverride {
            loan_id: loan_id.clone(),
            authorization_id: Some(AuthorizationId::generate()),
            updated_at: crate::domain::authorization::tests::at(),
        };
        {
            let store = RocksDBStore::open(dir.path()).unwrap();
            store.save(chosen.clone()).await.unwrap();
        }

        let store = RocksDBStore::open(dir.path()).unwrap();
        assert_eq!(store.find(&loan_id).await.unwrap(), Some(chosen.clone()));
        assert_eq!(store.find(&LoanId::from("LOAN-2")).await.unwrap(), None);

        let cleared = PaymentOverride {
            authorization_id: None,
            ..chosen
        };
        store.save(cleared.clone()).await.unwrap();
        assert_eq!(store.find(&loan_id).await.unwrap(), Some(cleared));
    }

    #[tokio::test]
    async fn test_rocksdb_authorization_store() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();

        let mut first = authorization("CUST-1", None);
        first.is_default = true;
        let mut second = authorization("CUST-1", None);
        second.is_default = true;

        AuthorizationStore::insert(&store, first.clone()).await.unwrap();
        AuthorizationStore::insert(&store, second.clone()).await.unwrap();

        let reloaded = AuthorizationStore::get(&store, first.id).await.unwrap().unwrap();
        assert!(!reloaded.is_default);
        let customer = store.for_customer(&CustomerId::from("CUST-1")).await.unwrap();
        assert_eq!(customer.len(), 2);
        assert_eq!(customer.iter().filter(|a| a.is_default).count(), 1);
    }

    #[tokio::test]
    async fn test_rocksdb_transaction_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let txn = scheduled(0, 2);
        {
            let store = RocksDBStore::open(dir.path()).unwrap();
            TransactionStore::store(&store, txn.clone()).await.unwrap();
        }

        let store = RocksDBStore::open(dir.path()).unwrap();
        let retrieved = TransactionStore::get(&store, txn.id).await.unwrap().unwrap();
        assert_eq!(retrieved, txn);
        let scheduled = store
            .query(&TransactionFilter::with_statuses(&[TransactionStatus::Scheduled]))
            .await
            .unwrap();
        assert_eq!(scheduled.len(), 1);

        assert!(store.claim_notification(txn.id).await.unwrap());
        assert!(!store.claim_notification(txn.id).await.unwrap());
        TransactionStore::store(&store, txn.clone()).await.unwrap();
        let reloaded = TransactionStore::get(&store, txn.id).await.unwrap().unwrap();
        assert!(reloaded.notification_sent);
    }

    #[tokio::test]
    async fn test_rocksdb_settlement_store_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();
        let txn = scheduled(0, 2);

        let (_, created) = store
            .insert_if_absent(SettlementRecord::for_transaction(&txn, txn.scheduled_date))
            .await
            .unwrap();
        assert!(created);
        let (_, created) = store
            .insert_if_absent(SettlementRecord::for_transaction(&txn, txn.scheduled_date))
            .await
            .unwrap();
        assert!(!created);
    }
}
