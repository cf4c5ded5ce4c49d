//! Livedata Core - Shared types for the livedata synchronization core.
//!
//! This crate provides the foundations every other livedata crate builds on:
//!
//! - `Document` / `DocumentId`: the nested key/value records that flow between
//!   the store, the server's publication machinery and client caches
//! - `value`: the total ordering and structural equality used by sorting,
//!   matching and diffing
//! - `diff`: field-level diffs (`ChangedFields`) and result-set diffs that turn
//!   two query snapshots into `ObserveEvent`s
//! - `protocol`: the live-data wire messages exchanged with clients
//! - `Error`: the error taxonomy shared by the workspace
//!
//! # Example
//!
//! ```rust
//! use livedata_core::{diff, Document};
//! use serde_json::json;
//!
//! let old: Document = serde_json::from_value(json!({"_id": "a", "a": 1, "b": 2})).unwrap();
//! let new: Document = serde_json::from_value(json!({"_id": "a", "a": 1, "b": 3, "c": 4})).unwrap();
//!
//! let changed = diff::make_changed_fields(&new, &old);
//! assert_eq!(changed.len(), 2);
//! assert_eq!(changed["b"], Some(json!(3)));
//! ```

pub mod diff;
mod error;
pub mod protocol;
pub mod value;

pub use diff::{ChangedFields, ObserveEvent};
pub use error::{Error, Result};
pub use value::{Document, DocumentId, IdMap};
