pub mod log;
pub mod memory;
pub mod meta;

pub use log::{FileLogStore, LogEntryStoreOptions};
pub use memory::MemoryStorage;
pub use meta::{FileMetaStore, MetaStoreOptions};
