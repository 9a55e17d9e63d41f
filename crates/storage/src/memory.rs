use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch, WriteOp};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

/// Test and tooling backend; everything lives in one ordered map.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        Ok(guard.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        let mut results = Vec::new();
        for ((entry_column, key), value) in guard.range((column, prefix.to_vec())..) {
            if *entry_column != column || !key.starts_with(prefix) {
                break;
            }
            results.push((key.clone(), value.clone()));
        }
        Ok(results)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard.insert(
                        (*column, key.as_slice().to_vec()),
                        value.as_slice().to_vec(),
                    );
                }
                WriteOp::Delete { column, key } => {
                    guard.remove(&(*column, key.as_slice().to_vec()));
                }
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_applies_all_ops() {
        let store = MemoryStore::new();
        store.put(Column::Meta, b"a", b"1").unwrap();
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"b".as_slice(), b"2".as_slice());
        batch.delete(Column::Meta, b"a".as_slice());
        store.write_batch(&batch).unwrap();
        assert_eq!(store.get(Column::Meta, b"a").unwrap(), None);
        assert_eq!(store.get(Column::Meta, b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn scan_prefix_is_column_scoped() {
        let store = MemoryStore::new();
        store.put(Column::Header, b"ab1", b"x").unwrap();
        store.put(Column::Header, b"ab2", b"y").unwrap();
        store.put(Column::Header, b"zz", b"n").unwrap();
        store.put(Column::Block, b"ab3", b"n").unwrap();
        let results = store.scan_prefix(Column::Header, b"ab").unwrap();
        assert_eq!(results.len(), 2);
    }
}
