//! Livedata Reactive - Client-side reactive document cache.
//!
//! This crate provides the client half of the live-data system:
//!
//! - `LocalCollection`: in-memory documents with live queries that keep
//!   their result sets current on every insert, update and remove
//! - `ObserveCallbacks` / `ObserveHandle`: per-query change callbacks,
//!   batched with `pause_observers` / `resume_observers`
//! - `Tracker`, `Computation`, `Dependency`: reactive recomputation
//! - `ClientStore`: applies batches of server messages atomically relative
//!   to reactive reruns and completes method calls once their writes are
//!   visible; method stubs simulate a call locally under the seed sent to
//!   the server
//!
//! Everything here is single-threaded (`Rc`/`RefCell`).
//!
//! # Example
//!
//! ```ignore
//! use livedata_reactive::{LocalCollection, ObserveCallbacks};
//!
//! let docs = LocalCollection::new("docs");
//! let handle = docs
//!     .find(&json!({"status": "open"}), Default::default())?
//!     .observe_changes(ObserveCallbacks::new().on_added(|id, fields| {
//!         println!("{} entered the result set: {:?}", id, fields);
//!     }));
//!
//! docs.insert(doc)?;
//! handle.stop();
//! ```

mod collection;
mod observe;
mod store;
mod tracker;

pub use collection::{Cursor, LocalCollection, QueryId, UpdateOptions, UpdateResult};
pub use observe::{DocumentCallbacks, ObserveCallbacks, ObserveHandle};
pub use store::{ClientStore, MethodOutcome, StubContext};
pub use tracker::{Computation, Dependency, Tracker};
