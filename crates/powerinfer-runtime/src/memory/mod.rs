//! Memory subsystem
//!
//! - [`aligned`]: aligned, zeroed heap buffers
//! - [`list`]: index-linked circular lists in an arena
//! - [`lru`]: LRU ordering over list nodes
//! - [`disk_buffer`]: double-buffered page-aligned disk staging

pub mod aligned;
pub mod disk_buffer;
pub mod list;
pub mod lru;

pub use aligned::{align_up, AlignedBuffer};
pub use disk_buffer::{AlignedRead, BackingStore, DiskBuffer, MemoryStore, NUM_BUFFER};
pub use list::{ListArena, NodeId};
pub use lru::Lru;
