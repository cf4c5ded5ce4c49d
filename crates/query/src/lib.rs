//! Livedata Query - Query primitives shared by the client cache and the server.
//!
//! This crate provides:
//!
//! - `Matcher`: compiles a selector and tests documents against it
//! - `Sorter`: compiles a sort specifier into a document comparator
//! - `modifier`: applies update operators (`$set`, `$inc`, `$push`, ...)
//! - `Projection`: field inclusion/exclusion
//! - `CursorDescription`: the immutable description of a live query
//!
//! # Example
//!
//! ```ignore
//! use livedata_query::{CursorDescription, Matcher};
//! use serde_json::json;
//!
//! let matcher = Matcher::new(&json!({"status": "open", "votes": {"$gte": 3}}))?;
//! assert!(matcher.document_matches(&doc));
//!
//! let cursor = CursorDescription::new("docs", json!({"status": "open"}))
//!     .with_sort(json!({"votes": -1}))
//!     .with_limit(10);
//! let results = cursor.compile()?.execute(store.iter());
//! ```

mod cursor;
mod matcher;
pub mod modifier;
pub mod path;
mod projection;
mod sorter;

pub use cursor::{CompiledCursor, CursorDescription, CursorOptions};
pub use matcher::{ElementMatcher, Matcher};
pub use projection::Projection;
pub use sorter::Sorter;
