use crate::frame::{Frame, MalformedFrame};
use crate::op::Op;
use crate::uuid::Uuid;
use crate::version::VersionVector;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(#[from] rusqlite::Error),
    #[error("storage pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("corrupt stored op or frame: {0}")]
    Corrupt(#[from] MalformedFrame),
}

/// Persistence boundary for the op log.
///
/// The layout is keyed by (object, event stamp); a per-object range scan
/// returns the op tail in event order, and a separate slot per object holds
/// the last compacted snapshot.
///
/// The replica owns the version vector lifecycle; storage only persists it
/// and has no knowledge of subscriptions or relaying.
pub trait Storage: Send + Sync {
    /// Version vector persisted for an object (empty when unknown).
    fn load_vv(&self, object: &Uuid) -> Result<VersionVector, StorageError>;

    fn save_vv(&self, object: &Uuid, vv: &VersionVector) -> Result<(), StorageError>;

    /// Append ops to the object's tail. Re-appending an existing
    /// (object, event) key is a no-op.
    fn append(&self, object: &Uuid, ops: &[Op]) -> Result<(), StorageError>;

    /// Ops logged since the last compaction, ordered by event stamp.
    fn tail(&self, object: &Uuid) -> Result<Vec<Op>, StorageError>;

    fn load_snapshot(&self, object: &Uuid) -> Result<Option<Frame>, StorageError>;

    /// Replace the snapshot and drop the logged tail it now covers.
    fn compact(&self, object: &Uuid, state: &Frame) -> Result<(), StorageError>;

    /// Every object with any persisted state.
    fn objects(&self) -> Result<Vec<Uuid>, StorageError>;
}
