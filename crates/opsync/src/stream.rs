use crate::frame::Frame;
use crate::uuid::Uuid;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

/// Identifies one end of a channel within a replica's subscriber table.
pub type StreamId = u64;

/// What a sink receives: frames, then `None` exactly once at end-of-stream.
pub type StreamItem = Option<Frame>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("stream closed")]
    Closed,
    #[error("duplicate subscription for '{0}'")]
    Duplicate(Uuid),
}

/// The receiving half a subscriber hands to a replica.
///
/// Cloneable; the end-of-stream marker is delivered at most once across all
/// clones.
#[derive(Debug, Clone)]
pub struct Sink {
    id: StreamId,
    tx: mpsc::Sender<StreamItem>,
    closed: Arc<AtomicBool>,
}

impl Sink {
    /// A connected sink/receiver pair.
    pub fn pair(id: StreamId, capacity: usize) -> (Sink, mpsc::Receiver<StreamItem>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Sink {
                id,
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Deliver a frame; false if the receiver is gone or the stream ended.
    pub async fn update(&self, frame: Frame) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(Some(frame)).await.is_ok()
    }

    /// Deliver the end-of-stream marker, exactly once.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(None).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// The bidirectional channel contract every concrete stream implements:
/// replicas, transport adapters, caches.
///
/// `push` carries new (possibly unstamped) ops toward the root of the
/// replica tree; `update` carries converged states and diffs away from it.
#[async_trait]
pub trait OpStream: Send {
    /// Subscribe a sink to the objects named by the query frame. At most one
    /// live sink per (query key, sink id); a repeated `on` refreshes the
    /// subscription vector instead of silently replacing the sink.
    async fn on(&mut self, query: Frame, sink: Sink) -> Result<(), StreamError>;

    /// Drop a subscription; the last interested party propagates `off`
    /// upstream.
    async fn off(&mut self, object: Uuid, sink_id: StreamId) -> Result<(), StreamError>;

    /// Submit new ops upstream, usually unstamped until a clock stamps them.
    async fn push(&mut self, frame: Frame) -> Result<(), StreamError>;

    /// Deliver a converged state or diff downstream; `None` ends the stream
    /// and is propagated exactly once.
    async fn update(&mut self, frame: Option<Frame>) -> Result<(), StreamError>;
}
