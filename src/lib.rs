pub mod allocator;
pub mod config;
pub mod engine;
pub mod error;
pub mod file_store;
pub mod handler;
pub mod journal;
pub mod lease;
pub mod packet;
pub mod sqlite;
pub mod store;
pub mod task;

pub use allocator::RangeAllocator;
pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use file_store::FileStore;
pub use handler::LeaseHandler;
pub use lease::{HwAddr, Lease};
pub use packet::{DhcpReply, DhcpRequest, MessageType};
pub use sqlite::SqliteStore;
pub use store::LeaseStore;
pub use task::PeriodicTask;
