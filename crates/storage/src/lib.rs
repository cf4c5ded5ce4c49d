//! Livedata Storage - Change notification and the backing store interface.
//!
//! This crate provides:
//!
//! - `Crossbar`: structured pub/sub used to announce writes
//! - `WriteFence`: holds back a method's "writes done" signal until every
//!   observer affected by its writes has delivered the results
//! - `DocumentStore`: async interface to a backing store, with capability
//!   variants for log tailing and point reads
//! - `MemoryStore`: in-memory implementation, optionally with an
//!   operation log tailed by an `OplogHandle`
//!
//! # Example
//!
//! ```ignore
//! use livedata_storage::{with_fence, DocumentStore, MemoryStore, WriteFence};
//!
//! let store = MemoryStore::with_oplog(1024);
//! let fence = WriteFence::new();
//! with_fence(fence.clone(), store.insert("docs", doc)).await?;
//! fence.arm_and_wait().await?;
//! ```

mod crossbar;
mod fence;
mod memory;
mod oplog;
mod store;

pub use crossbar::{matches, Crossbar, ListenHandle, ListenerFn, Notification};
pub use fence::{current_fence, with_fence, FenceWrite, WriteFence};
pub use memory::{MemoryStore, DEFAULT_OPLOG_CAPACITY};
pub use oplog::{OplogEntry, OplogHandle, OplogOp, OplogUpdate};
pub use store::{DocumentStore, StoreCapabilities, UpdateOptions, UpdateOutcome};
