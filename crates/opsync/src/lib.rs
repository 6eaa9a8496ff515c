// Architecture modules
pub mod base64;
pub mod clock;
pub mod config;
pub mod frame;
pub mod net;
pub mod op;
pub mod reduce;
pub mod replica;
pub mod scheme;
pub mod storage;
pub mod stream;
pub mod uuid;
pub mod version;

// Public exports
pub use clock::{CalendarClock, Clock, LogicalClock, TimestampExhausted};
pub use config::Config;
pub use frame::{Frame, MalformedFrame};
pub use net::{Connector, Listener};
pub use op::{Atom, Op, Term};
pub use replica::{Replica, ReplicaHandle, ReplicaMsg, ReplicaOptions, channel};
pub use scheme::ReplicaIdScheme;
pub use storage::{MemoryStorage, SqliteStorage, Storage};
pub use stream::{OpStream, Sink, StreamError, StreamId};
pub use uuid::{Sep, Stamp, Uuid, Word};
pub use version::VersionVector;
