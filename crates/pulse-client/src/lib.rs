pub mod backoff;
pub mod connector;
pub mod offline;
pub mod sender;
pub mod storage;
pub mod transport;

pub use connector::HttpStreamConnector;
pub use offline::{OfflineActionQueue, QueueOptions, QueueStatus};
pub use sender::{ActionSender, HttpActionSender, SendError};
pub use storage::{FileStorage, MemoryStorage, SqliteStorage, Storage};
pub use transport::{ClientTransport, TransportOptions, TransportSnapshot, TransportState};
