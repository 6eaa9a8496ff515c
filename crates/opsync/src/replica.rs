use crate::base64::MalformedToken;
use crate::clock::Clock;
use crate::frame::Frame;
use crate::op::{self, Atom, Op, Term};
use crate::reduce::{self, CrdtKind};
use crate::scheme::ReplicaIdScheme;
use crate::storage::{Storage, StorageError};
use crate::stream::{OpStream, Sink, StreamError, StreamId};
use crate::uuid::{Uuid, Word};
use crate::version::VersionVector;
use async_trait::async_trait;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("invalid database id: {0}")]
    BadDbId(#[from] MalformedToken),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct ReplicaOptions {
    pub scheme: ReplicaIdScheme,
    pub compact_threshold: usize,
    pub mailbox_capacity: usize,
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            scheme: ReplicaIdScheme::default(),
            compact_threshold: 64,
            mailbox_capacity: 256,
        }
    }
}

/// Mailbox messages; senders use [`ReplicaHandle`] instead of building these.
#[derive(Debug)]
pub enum ReplicaMsg {
    On { query: Frame, sink: Sink },
    Off { object: Uuid, sink_id: StreamId },
    Push { frame: Frame, from: Option<Sink> },
    Closed { sink_id: StreamId },
    UpstreamConnected { sink: Sink },
    UpstreamFrame { frame: Frame },
    UpstreamClosed,
}

/// Cloneable sender half of a replica's mailbox.
#[derive(Debug, Clone)]
pub struct ReplicaHandle {
    tx: mpsc::Sender<ReplicaMsg>,
}

/// A bounded replica mailbox; pass the receiver to [`Replica::run`].
pub fn channel(capacity: usize) -> (ReplicaHandle, mpsc::Receiver<ReplicaMsg>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ReplicaHandle { tx }, rx)
}

impl ReplicaHandle {
    async fn send(&self, msg: ReplicaMsg) -> Result<(), StreamError> {
        self.tx.send(msg).await.map_err(|_| StreamError::Closed)
    }

    pub async fn on(&self, query: Frame, sink: Sink) -> Result<(), StreamError> {
        self.send(ReplicaMsg::On { query, sink }).await
    }

    pub async fn off(&self, object: Uuid, sink_id: StreamId) -> Result<(), StreamError> {
        self.send(ReplicaMsg::Off { object, sink_id }).await
    }

    pub async fn push(&self, frame: Frame, from: Option<Sink>) -> Result<(), StreamError> {
        self.send(ReplicaMsg::Push { frame, from }).await
    }

    pub async fn closed(&self, sink_id: StreamId) -> Result<(), StreamError> {
        self.send(ReplicaMsg::Closed { sink_id }).await
    }

    pub async fn connect_upstream(&self, sink: Sink) -> Result<(), StreamError> {
        self.send(ReplicaMsg::UpstreamConnected { sink }).await
    }

    pub async fn upstream_frame(&self, frame: Frame) -> Result<(), StreamError> {
        self.send(ReplicaMsg::UpstreamFrame { frame }).await
    }

    pub async fn upstream_closed(&self) -> Result<(), StreamError> {
        self.send(ReplicaMsg::UpstreamClosed).await
    }
}

#[async_trait]
impl OpStream for ReplicaHandle {
    async fn on(&mut self, query: Frame, sink: Sink) -> Result<(), StreamError> {
        ReplicaHandle::on(self, query, sink).await
    }

    async fn off(&mut self, object: Uuid, sink_id: StreamId) -> Result<(), StreamError> {
        ReplicaHandle::off(self, object, sink_id).await
    }

    async fn push(&mut self, frame: Frame) -> Result<(), StreamError> {
        ReplicaHandle::push(self, frame, None).await
    }

    async fn update(&mut self, frame: Option<Frame>) -> Result<(), StreamError> {
        match frame {
            Some(frame) => self.upstream_frame(frame).await,
            None => self.upstream_closed().await,
        }
    }
}

/// Per-object subscription lifecycle relative to the upstream replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubState {
    Unsubscribed,
    Pending,
    Live,
}

#[derive(Debug)]
struct Subscriber {
    sink: Sink,
    vv: VersionVector,
}

#[derive(Debug)]
struct ObjectEntry {
    ty: Uuid,
    snapshot: Frame,
    tail: Vec<Op>,
    vv: VersionVector,
    subs: Vec<Subscriber>,
    upstream: SubState,
    /// Downstream `on` requests buffered until the upstream answers.
    pending: Vec<(VersionVector, Sink)>,
}

/// The subscription / log-aggregation state machine.
///
/// Runs as a single task exclusively owning its subscriber table and logs;
/// every interaction goes through the bounded mailbox, so reductions always
/// see a consistent snapshot and no locks are needed.
pub struct Replica<S: Storage> {
    root: Uuid,
    scheme: ReplicaIdScheme,
    clock: Box<dyn Clock>,
    storage: Arc<S>,
    objects: HashMap<Uuid, ObjectEntry>,
    upstream: Option<Sink>,
    session_granted: bool,
    next_session: u64,
    compact_threshold: usize,
}

impl<S: Storage> Replica<S> {
    /// Build a replica over its storage; replays persisted version vectors
    /// into the clock so stamps issued after a restart exceed everything
    /// already logged.
    pub fn new(
        db_id: &str,
        mut clock: Box<dyn Clock>,
        storage: Arc<S>,
        options: ReplicaOptions,
    ) -> Result<Self, ReplicaError> {
        let root = Uuid {
            value: db_id.parse()?,
            origin: Word::ZERO,
            sep: crate::uuid::Sep::Name,
        };
        for object in storage.objects()? {
            let vv = storage.load_vv(&object)?;
            for (origin, value) in vv.iter() {
                clock.see(&Uuid::event(Word::new(value), origin));
            }
        }
        Ok(Self {
            root,
            scheme: options.scheme,
            clock,
            storage,
            objects: HashMap::new(),
            upstream: None,
            session_granted: false,
            next_session: 1,
            compact_threshold: options.compact_threshold,
        })
    }

    pub fn origin(&self) -> Word {
        self.clock.origin()
    }

    pub fn root(&self) -> Uuid {
        self.root
    }

    /// Drive the state machine until every handle is dropped, then close all
    /// subscriber streams.
    pub async fn run(mut self, mut rx: mpsc::Receiver<ReplicaMsg>) {
        while let Some(msg) = rx.recv().await {
            let result = match msg {
                ReplicaMsg::On { query, sink } => self.handle_on(&query, &sink).await,
                ReplicaMsg::Off { object, sink_id } => self.handle_off(object, sink_id).await,
                ReplicaMsg::Push { frame, from } => {
                    self.handle_push(frame, from.as_ref(), false).await
                }
                ReplicaMsg::Closed { sink_id } => self.handle_closed(sink_id).await,
                ReplicaMsg::UpstreamConnected { sink } => {
                    self.handle_upstream_connected(sink).await
                }
                ReplicaMsg::UpstreamFrame { frame } => self.handle_upstream_frame(frame).await,
                ReplicaMsg::UpstreamClosed => {
                    self.upstream = None;
                    for entry in self.objects.values_mut() {
                        if entry.upstream == SubState::Live {
                            entry.upstream = SubState::Unsubscribed;
                        }
                    }
                    Ok(())
                }
            };
            if let Err(e) = result {
                error!("storage failure in replica loop: {}", e);
            }
        }
        debug!("replica mailbox closed, shutting down");
        for entry in self.objects.values() {
            for sub in &entry.subs {
                sub.sink.close().await;
            }
        }
    }

    fn load_entry<'a>(
        objects: &'a mut HashMap<Uuid, ObjectEntry>,
        storage: &S,
        object: Uuid,
        ty: Uuid,
    ) -> Result<&'a mut ObjectEntry, StorageError> {
        match objects.entry(object) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(v) => {
                let snapshot = storage.load_snapshot(&object)?.unwrap_or_default();
                let tail = storage.tail(&object)?;
                let vv = storage.load_vv(&object)?;
                let ty = if snapshot.is_empty() { ty } else { snapshot.ty() };
                Ok(v.insert(ObjectEntry {
                    ty,
                    snapshot,
                    tail,
                    vv,
                    subs: Vec::new(),
                    upstream: SubState::Unsubscribed,
                    pending: Vec::new(),
                }))
            }
        }
    }

    /// The object's current state: snapshot plus tail, reduced on demand.
    fn full_state(entry: &ObjectEntry) -> Frame {
        if entry.tail.is_empty() {
            return entry.snapshot.clone();
        }
        let change = Frame::from_ops(entry.tail.clone());
        if entry.snapshot.is_empty() && CrdtKind::of(&entry.ty).is_none() {
            // no reducer registered: serve the raw tail
            return change;
        }
        reduce::reduce(&entry.snapshot, &change)
    }

    /// Emit the diff + `on` acknowledgement pair and register the sink.
    async fn answer_on(
        entry: &mut ObjectEntry,
        object: Uuid,
        req_vv: &VersionVector,
        sink: &Sink,
        grant: Option<Word>,
    ) {
        let full = Self::full_state(entry);
        if !full.is_empty() {
            sink.update(reduce::diff(&full, req_vv)).await;
        }
        let mut atoms = vec![Atom::String(entry.vv.to_string())];
        if let Some(session) = grant {
            atoms.push(Atom::Uuid(Uuid::event(Word::ZERO, session)));
        }
        let ack = Op::new(entry.ty, object, entry.vv.tip(), op::ON).with_atoms(atoms);
        sink.update(Frame::from_ops(vec![ack])).await;

        match entry.subs.iter_mut().find(|s| s.sink.id() == sink.id()) {
            // a repeated `on` refreshes the acked vector, it does not stack
            Some(sub) => sub.vv = req_vv.clone(),
            None => entry.subs.push(Subscriber {
                sink: sink.clone(),
                vv: req_vv.clone(),
            }),
        }
    }

    async fn handle_on(&mut self, query: &Frame, sink: &Sink) -> Result<(), StorageError> {
        for qop in query.ops() {
            if qop.is_off() {
                self.handle_off(qop.object, sink.id()).await?;
                continue;
            }
            if !qop.is_on() {
                continue;
            }
            let object = qop.object;
            let req_vv = match qop.atoms.first().and_then(Atom::as_str) {
                Some(text) => match text.parse::<VersionVector>() {
                    Ok(vv) => vv,
                    Err(e) => {
                        sink.update(reduce::error_frame(qop.ty, object, &e.to_string()))
                            .await;
                        continue;
                    }
                },
                None => VersionVector::new(),
            };

            // first contact on the root object gets a session id granted
            let grant = if object == self.root && qop.event.origin.is_zero() {
                let session = self
                    .scheme
                    .grant_session(self.clock.origin(), self.next_session);
                self.next_session += 1;
                info!("granted session origin {}", session);
                Some(session)
            } else {
                None
            };

            let entry = Self::load_entry(&mut self.objects, &self.storage, object, qop.ty)?;
            let covered = entry.vv.descends(&req_vv);
            if covered || self.upstream.is_none() {
                Self::answer_on(entry, object, &req_vv, sink, grant).await;
            } else {
                debug!("buffering on for {} until upstream catches up", object);
                entry.pending.push((req_vv, sink.clone()));
            }

            // fan the subscription out upstream exactly once per object
            if entry.upstream == SubState::Unsubscribed {
                if let Some(up) = &self.upstream {
                    let sub = Op::new(
                        entry.ty,
                        object,
                        Uuid::event(Word::ZERO, self.clock.origin()),
                        op::ON,
                    )
                    .with_atoms(vec![Atom::String(entry.vv.to_string())])
                    .with_term(Term::Query);
                    up.update(Frame::from_ops(vec![sub])).await;
                    entry.upstream = SubState::Pending;
                }
            }
        }
        Ok(())
    }

    async fn handle_off(&mut self, object: Uuid, sink_id: StreamId) -> Result<(), StorageError> {
        let Some(entry) = self.objects.get_mut(&object) else {
            return Ok(());
        };
        entry.subs.retain(|s| s.sink.id() != sink_id);
        entry.pending.retain(|(_, s)| s.id() != sink_id);
        // reference counting: the last subscriber leaving unsubscribes upstream
        if entry.subs.is_empty() && entry.upstream != SubState::Unsubscribed {
            if let Some(up) = &self.upstream {
                let off = Op::new(entry.ty, object, Uuid::ZERO, op::OFF);
                up.update(Frame::from_ops(vec![off])).await;
            }
            entry.upstream = SubState::Unsubscribed;
        }
        Ok(())
    }

    async fn handle_closed(&mut self, sink_id: StreamId) -> Result<(), StorageError> {
        let objects: Vec<Uuid> = self.objects.keys().copied().collect();
        for object in objects {
            self.handle_off(object, sink_id).await?;
        }
        Ok(())
    }

    /// Stamp, validate, log and relay a frame of ops for one object.
    async fn handle_push(
        &mut self,
        frame: Frame,
        from: Option<&Sink>,
        from_upstream: bool,
    ) -> Result<(), StorageError> {
        if frame.is_empty() {
            return Ok(());
        }
        let object = frame.object();
        let ty = frame.ty();
        if object.is_zero() {
            if let Some(sink) = from {
                sink.update(reduce::error_frame(ty, object, "op without an object"))
                    .await;
            }
            return Ok(());
        }

        let entry = Self::load_entry(&mut self.objects, &self.storage, object, ty)?;

        // validate and stamp first; nothing is applied if any op regresses
        let mut to_apply: Vec<Op> = Vec::new();
        for body_op in frame.body() {
            if !body_op.is_mutation() {
                continue;
            }
            let mut op = body_op.clone();
            if op.event.is_zero() {
                match self.clock.issue() {
                    Ok(stamp) => op.event = stamp,
                    Err(e) => {
                        error!("{}", e);
                        if let Some(sink) = from {
                            sink.update(reduce::error_frame(ty, object, &e.to_string()))
                                .await;
                        }
                        return Ok(());
                    }
                }
            } else {
                let last = entry.vv.get(op.event.origin);
                let trusted = from_upstream
                    || self
                        .scheme
                        .is_upstream_of(op.event.origin, self.clock.origin());
                if op.event.value.raw() < last && !trusted {
                    warn!(
                        "out-of-order op for {} from origin {}",
                        object, op.event.origin
                    );
                    if let Some(sink) = from {
                        sink.update(reduce::error_frame(
                            ty,
                            object,
                            &format!("OutOfOrder: event {} regresses", op.event),
                        ))
                        .await;
                    }
                    return Ok(());
                }
                if entry.vv.covers(&op.event)
                    || to_apply.iter().any(|o| o.event == op.event)
                {
                    continue; // duplicate delivery
                }
                self.clock.see(&op.event);
            }
            to_apply.push(op);
        }
        if to_apply.is_empty() {
            return Ok(());
        }

        for op in &to_apply {
            entry.vv.see(&op.event);
        }
        self.storage.append(&object, &to_apply)?;
        self.storage.save_vv(&object, &entry.vv)?;
        entry.tail.extend(to_apply.iter().cloned());

        // relay to every subscriber except the originating stream
        let relay = Frame::from_ops(to_apply);
        let from_id = from.map(Sink::id);
        for sub in &mut entry.subs {
            if Some(sub.sink.id()) == from_id {
                continue;
            }
            if sub.sink.update(relay.clone()).await {
                for op in relay.ops() {
                    sub.vv.see(&op.event);
                }
            }
        }
        if !from_upstream {
            if let Some(up) = &self.upstream {
                up.update(relay.clone()).await;
            }
        }

        // fold the log into a snapshot once it outgrows the threshold
        if entry.tail.len() > self.compact_threshold && CrdtKind::of(&entry.ty).is_some() {
            let folded = reduce::reduce(&entry.snapshot, &Frame::from_ops(entry.tail.clone()));
            if !folded.ops().iter().any(Op::is_error) {
                debug!(
                    "compacted {} ({} tail ops) into a snapshot",
                    object,
                    entry.tail.len()
                );
                entry.snapshot = folded;
                entry.tail.clear();
                self.storage.compact(&object, &entry.snapshot)?;
            }
        }
        Ok(())
    }

    async fn handle_upstream_connected(&mut self, sink: Sink) -> Result<(), StorageError> {
        info!("upstream connected");
        let up = sink.clone();
        self.upstream = Some(sink);

        // root handshake; an all-zero origin asks for a session grant
        let root_entry =
            Self::load_entry(&mut self.objects, &self.storage, self.root, Uuid::ZERO)?;
        let origin = if self.session_granted {
            self.clock.origin()
        } else {
            Word::ZERO
        };
        let hello = Op::new(
            root_entry.ty,
            self.root,
            Uuid::event(Word::ZERO, origin),
            op::ON,
        )
        .with_atoms(vec![Atom::String(root_entry.vv.to_string())])
        .with_term(Term::Query);
        up.update(Frame::from_ops(vec![hello])).await;
        root_entry.upstream = SubState::Pending;

        // re-issue `on` for every object with live interest, with the last
        // acked vector, so the upstream answers with just the missing diff
        for (&object, entry) in &mut self.objects {
            if object == self.root || entry.subs.is_empty() {
                continue;
            }
            let reon = Op::new(
                entry.ty,
                object,
                Uuid::event(Word::ZERO, self.clock.origin()),
                op::REON,
            )
            .with_atoms(vec![Atom::String(entry.vv.to_string())])
            .with_term(Term::Query);
            up.update(Frame::from_ops(vec![reon])).await;
            entry.upstream = SubState::Pending;
        }
        Ok(())
    }

    async fn handle_upstream_frame(&mut self, frame: Frame) -> Result<(), StorageError> {
        if frame.is_empty() {
            return Ok(());
        }
        let first = &frame.ops()[0];

        if first.is_error() {
            warn!(
                "upstream error for {}: {:?}",
                first.object,
                first.atoms.first()
            );
            return Ok(());
        }

        if first.is_on() && !first.is_query() {
            // subscription acknowledgement, possibly carrying a session grant
            let object = first.object;
            if object == self.root && !self.session_granted {
                if let Some(granted) = first.atoms.iter().find_map(Atom::as_uuid) {
                    if !granted.origin.is_zero() {
                        info!("adopting granted session origin {}", granted.origin);
                        self.clock.set_origin(granted.origin);
                        self.session_granted = true;
                    }
                }
            }
            self.clock.see(&first.event);
            let entry =
                Self::load_entry(&mut self.objects, &self.storage, object, first.ty)?;
            entry.upstream = SubState::Live;
            entry.vv.see(&first.event);

            // upload everything the upstream's acked vector does not cover,
            // e.g. ops logged while offline
            if let Some(up_vv) = first
                .atoms
                .first()
                .and_then(Atom::as_str)
                .and_then(|text| text.parse::<VersionVector>().ok())
            {
                let full = Self::full_state(entry);
                let missing: Vec<Op> = full
                    .body()
                    .iter()
                    .filter(|op| !up_vv.covers(&op.event))
                    .map(|op| op.clone().with_term(Term::Raw))
                    .collect();
                if !missing.is_empty() {
                    if let Some(up) = &self.upstream {
                        debug!("uploading {} missing ops for {}", missing.len(), object);
                        up.update(Frame::from_ops(missing)).await;
                    }
                }
            }

            // the upstream has answered; flush buffered downstream requests
            let pending = std::mem::take(&mut entry.pending);
            for (req_vv, sink) in pending {
                Self::answer_on(entry, object, &req_vv, &sink, None).await;
            }
            return Ok(());
        }

        if frame.header().is_some() {
            // a reduced state or diff frame: merge it wholesale
            let object = frame.object();
            let entry =
                Self::load_entry(&mut self.objects, &self.storage, object, frame.ty())?;
            for op in frame.ops() {
                entry.vv.see(&op.event);
                self.clock.see(&op.event);
            }
            let current = Self::full_state(entry);
            let merged = if current.is_empty() {
                frame.clone()
            } else {
                reduce::reduce(&current, &frame)
            };
            if merged.ops().iter().any(Op::is_error) {
                warn!("could not merge upstream state frame for {}", object);
                return Ok(());
            }
            entry.snapshot = merged;
            entry.tail.clear();
            self.storage.compact(&object, &entry.snapshot)?;
            self.storage.save_vv(&object, &entry.vv)?;
            for sub in &entry.subs {
                sub.sink.update(frame.clone()).await;
            }
            return Ok(());
        }

        // raw ops relayed from upstream: ordered, trusted
        self.handle_push(frame, None, true).await
    }
}
