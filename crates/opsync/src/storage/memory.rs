use crate::frame::Frame;
use crate::op::Op;
use crate::storage::{Storage, StorageError};
use crate::uuid::Uuid;
use crate::version::VersionVector;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct ObjectRecord {
    vv: VersionVector,
    snapshot: Option<Frame>,
    tail: BTreeMap<Uuid, Op>,
}

/// In-memory storage for tests and ephemeral replicas.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: Mutex<HashMap<Uuid, ObjectRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn load_vv(&self, object: &Uuid) -> Result<VersionVector, StorageError> {
        let records = self.records.lock().unwrap();
        Ok(records
            .get(object)
            .map(|r| r.vv.clone())
            .unwrap_or_default())
    }

    fn save_vv(&self, object: &Uuid, vv: &VersionVector) -> Result<(), StorageError> {
        let mut records = self.records.lock().unwrap();
        records.entry(*object).or_default().vv = vv.clone();
        Ok(())
    }

    fn append(&self, object: &Uuid, ops: &[Op]) -> Result<(), StorageError> {
        let mut records = self.records.lock().unwrap();
        let record = records.entry(*object).or_default();
        for op in ops {
            record.tail.entry(op.event).or_insert_with(|| op.clone());
        }
        Ok(())
    }

    fn tail(&self, object: &Uuid) -> Result<Vec<Op>, StorageError> {
        let records = self.records.lock().unwrap();
        Ok(records
            .get(object)
            .map(|r| r.tail.values().cloned().collect())
            .unwrap_or_default())
    }

    fn load_snapshot(&self, object: &Uuid) -> Result<Option<Frame>, StorageError> {
        let records = self.records.lock().unwrap();
        Ok(records.get(object).and_then(|r| r.snapshot.clone()))
    }

    fn compact(&self, object: &Uuid, state: &Frame) -> Result<(), StorageError> {
        let mut records = self.records.lock().unwrap();
        let record = records.entry(*object).or_default();
        record.snapshot = Some(state.clone());
        record.tail.clear();
        Ok(())
    }

    fn objects(&self) -> Result<Vec<Uuid>, StorageError> {
        let records = self.records.lock().unwrap();
        Ok(records.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_tail_ordering() {
        let storage = MemoryStorage::new();
        let object: Uuid = "chat".parse().unwrap();
        let a = Frame::parse_op_text("*log#chat@2-X:0\t'b';").unwrap();
        let b = Frame::parse_op_text("*log#chat@1-X:0\t'a';").unwrap();
        storage.append(&object, &[a.clone(), b.clone()]).unwrap();

        let tail = storage.tail(&object).unwrap();
        assert_eq!(tail, vec![b, a]);
    }

    #[test]
    fn test_append_is_idempotent() {
        let storage = MemoryStorage::new();
        let object: Uuid = "chat".parse().unwrap();
        let op = Frame::parse_op_text("*log#chat@1-X:0\t'a';").unwrap();
        storage.append(&object, &[op.clone()]).unwrap();
        storage.append(&object, &[op]).unwrap();
        assert_eq!(storage.tail(&object).unwrap().len(), 1);
    }

    #[test]
    fn test_compact_truncates_tail() {
        let storage = MemoryStorage::new();
        let object: Uuid = "doc".parse().unwrap();
        let op = Frame::parse_op_text("*lww#doc@1-X:k\t=1;").unwrap();
        storage.append(&object, &[op]).unwrap();

        let state = Frame::parse_text("*lww#doc@1-X!\n:k\t=1,\n\n").unwrap();
        storage.compact(&object, &state).unwrap();

        assert!(storage.tail(&object).unwrap().is_empty());
        assert_eq!(storage.load_snapshot(&object).unwrap(), Some(state));
    }
}
