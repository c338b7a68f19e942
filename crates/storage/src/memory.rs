//! In-memory backend, used by tests and as the default store.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch, WriteOp};

#[derive(Default)]
pub struct MemoryStore {
    columns: RwLock<BTreeMap<(Column, Vec<u8>), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let columns = self
            .columns
            .read()
            .map_err(|_| StoreError::Backend("memory store poisoned".to_string()))?;
        Ok(columns.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut columns = self
            .columns
            .write()
            .map_err(|_| StoreError::Backend("memory store poisoned".to_string()))?;
        columns.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut columns = self
            .columns
            .write()
            .map_err(|_| StoreError::Backend("memory store poisoned".to_string()))?;
        columns.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let columns = self
            .columns
            .read()
            .map_err(|_| StoreError::Backend("memory store poisoned".to_string()))?;
        let mut out = Vec::new();
        for ((col, key), value) in columns.range((column, prefix.to_vec())..) {
            if *col != column || !key.starts_with(prefix) {
                break;
            }
            out.push((key.clone(), value.clone()));
        }
        Ok(out)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut columns = self
            .columns
            .write()
            .map_err(|_| StoreError::Backend("memory store poisoned".to_string()))?;
        for op in batch.into_ops() {
            match op {
                WriteOp::Put { column, key, value } => {
                    columns.insert((column, key.as_slice().to_vec()), value);
                }
                WriteOp::Delete { column, key } => {
                    columns.remove(&(column, key.as_slice().to_vec()));
                }
            }
        }
        Ok(())
    }
}
