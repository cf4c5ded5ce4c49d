//! Livedata Random - Reproducible randomness for optimistic writes.
//!
//! A client that simulates a method locally and the server that runs it for
//! real must generate the same document ids. Both sides derive a
//! `RandomStream` from the seed sent along with the method call; named
//! sequences drawn from it produce bit-identical output on every platform.
//!
//! - `Alea`: the seeded generator
//! - `RandomGenerator`: string/id helpers over either a seeded or an
//!   entropy-backed source
//! - `RandomStream` / `RandomScope`: per-invocation named sequences
//! - `make_rpc_seed`: seeds for nested method calls
//!
//! # Example
//!
//! ```rust
//! use livedata_random::RandomStream;
//!
//! let client = RandomStream::with_seed(["abc"]);
//! let server = RandomStream::with_seed(["abc"]);
//!
//! let a = client.sequence("/collection/docs").lock().id();
//! let b = server.sequence("/collection/docs").lock().id();
//! assert_eq!(a, b);
//! ```

mod alea;
mod generator;
mod stream;

pub use alea::Alea;
pub use generator::{
    random_token, RandomGenerator, BASE64_CHARS, HEX_CHARS, UNMISTAKABLE_CHARS,
};
pub use stream::{make_rpc_seed, RandomScope, RandomStream, SharedGenerator};
