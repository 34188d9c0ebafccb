use crate::{KVStore, Result, StorageError, Transaction as KVTransaction};
use bytes::Bytes;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const OBJECTS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("objects");

/// redb-based storage backend
pub struct RedbBackend {
    db: Arc<Database>,
}

impl RedbBackend {
    /// Open (or create) the database file at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening redb database at: {}", path.as_ref().display());

        let db = Database::create(path.as_ref()).map_err(|e| {
            StorageError::database_error(
                format!("Failed to create database: {}", e),
                Some(Box::new(e)),
            )
        })?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(OBJECTS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl KVStore for RedbBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OBJECTS_TABLE)?;

        Ok(table
            .get(key)?
            .map(|value| Bytes::copy_from_slice(value.value())))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        debug!("Putting key: {}", String::from_utf8_lossy(key));

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(OBJECTS_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;

        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        debug!("Deleting key: {}", String::from_utf8_lossy(key));

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(OBJECTS_TABLE)?;
            table.remove(key)?;
        }
        write_txn.commit()?;

        Ok(())
    }

    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OBJECTS_TABLE)?;

        // Keys are ordered, so the prefix is one contiguous range
        let mut results = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, value) = entry?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push((
                Bytes::copy_from_slice(key.value()),
                Bytes::copy_from_slice(value.value()),
            ));
        }

        debug!(
            "Scan of {} found {} entries",
            String::from_utf8_lossy(prefix),
            results.len()
        );
        Ok(results)
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OBJECTS_TABLE)?;
        Ok(table.get(key)?.is_some())
    }

    fn transaction(&self) -> Result<Box<dyn KVTransaction>> {
        let write_txn = self.db.begin_write()?;
        Ok(Box::new(RedbTransaction { txn: Some(write_txn) }))
    }
}

/// redb write transaction; aborted on drop unless committed
struct RedbTransaction {
    txn: Option<redb::WriteTransaction>,
}

impl RedbTransaction {
    fn txn(&self) -> Result<&redb::WriteTransaction> {
        self.txn.as_ref().ok_or_else(|| {
            StorageError::transaction_error("Transaction already committed or rolled back")
        })
    }
}

impl KVTransaction for RedbTransaction {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let table = self.txn()?.open_table(OBJECTS_TABLE)?;
        let value = table
            .get(key)?
            .map(|value| Bytes::copy_from_slice(value.value()));
        Ok(value)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut table = self.txn()?.open_table(OBJECTS_TABLE)?;
        table.insert(key, value)?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        let mut table = self.txn()?.open_table(OBJECTS_TABLE)?;
        table.remove(key)?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        let txn = self.txn.take().ok_or_else(|| {
            StorageError::transaction_error("Transaction already committed or rolled back")
        })?;
        txn.commit()?;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        let txn = self.txn.take().ok_or_else(|| {
            StorageError::transaction_error("Transaction already committed or rolled back")
        })?;
        txn.abort()?;
        Ok(())
    }
}

impl Drop for RedbTransaction {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            let _ = txn.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_redb_backend_basic_operations() {
        let dir = tempdir().unwrap();
        let backend = RedbBackend::new(dir.path().join("test.redb")).unwrap();

        backend.put(b"ClusterQueue/cq", b"{}").unwrap();
        assert_eq!(backend.get(b"ClusterQueue/cq").unwrap(), Some(Bytes::from("{}")));
        assert!(backend.exists(b"ClusterQueue/cq").unwrap());
        assert!(!backend.exists(b"ClusterQueue/other").unwrap());

        backend.delete(b"ClusterQueue/cq").unwrap();
        assert_eq!(backend.get(b"ClusterQueue/cq").unwrap(), None);
    }

    #[test]
    fn test_redb_backend_scan_is_prefix_bounded() {
        let dir = tempdir().unwrap();
        let backend = RedbBackend::new(dir.path().join("test.redb")).unwrap();

        backend.put(b"Workload/a/one", b"1").unwrap();
        backend.put(b"Workload/b/two", b"2").unwrap();
        backend.put(b"WorkloadX/a/three", b"3").unwrap();
        backend.put(b"LocalQueue/a/main", b"4").unwrap();

        let results = backend.scan(b"Workload/").unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, Bytes::from("Workload/a/one"));

        let results = backend.scan(b"Workload/b/").unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_redb_backend_transaction() {
        let dir = tempdir().unwrap();
        let backend = RedbBackend::new(dir.path().join("test.redb")).unwrap();

        let mut txn = backend.transaction().unwrap();
        txn.put(b"key1", b"value1").unwrap();
        assert_eq!(txn.get(b"key1").unwrap(), Some(Bytes::from("value1")));
        txn.commit().unwrap();
        assert_eq!(backend.get(b"key1").unwrap(), Some(Bytes::from("value1")));

        let mut txn = backend.transaction().unwrap();
        txn.put(b"key2", b"value2").unwrap();
        txn.rollback().unwrap();
        assert_eq!(backend.get(b"key2").unwrap(), None);

        {
            let mut txn = backend.transaction().unwrap();
            txn.put(b"key3", b"value3").unwrap();
        }
        assert_eq!(backend.get(b"key3").unwrap(), None);
    }

    #[test]
    fn test_redb_backend_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");
        {
            let backend = RedbBackend::new(&path).unwrap();
            backend.put(b"ResourceFlavor/default", b"{}").unwrap();
        }
        let backend = RedbBackend::new(&path).unwrap();
        assert!(backend.exists(b"ResourceFlavor/default").unwrap());
    }
}
