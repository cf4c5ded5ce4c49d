//! Named, seeded random sequences scoped to one method invocation.

use std::sync::{Arc, OnceLock};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::generator::{random_token, RandomGenerator};

/// Generator shared between everyone drawing from the same sequence.
pub type SharedGenerator = Arc<Mutex<RandomGenerator>>;

/// A family of named random sequences derived from one seed.
///
/// The sequence named `name` is seeded with `seed ++ [name]`, so two streams
/// with the same seed produce identical values for identical draws, no
/// matter which process they run in.
#[derive(Debug)]
pub struct RandomStream {
    seed: Vec<String>,
    sequences: Mutex<HashMap<String, SharedGenerator>>,
}

impl RandomStream {
    /// Creates a stream; without a seed a fresh random token is used.
    pub fn new(seed: Option<Vec<String>>) -> Self {
        Self {
            seed: seed.unwrap_or_else(|| vec![random_token()]),
            sequences: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a stream from seed parts; numbers are seeded by their decimal
    /// representation.
    pub fn with_seed<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self::new(Some(parts.into_iter().map(|p| p.to_string()).collect()))
    }

    /// Returns the seed parts.
    #[inline]
    pub fn seed(&self) -> &[String] {
        &self.seed
    }

    /// Returns the generator of the named sequence, creating it on first use.
    ///
    /// Repeated calls return the same generator so draws continue where the
    /// previous caller stopped.
    pub fn sequence(&self, name: &str) -> SharedGenerator {
        let mut sequences = self.sequences.lock();
        sequences
            .entry(name.to_string())
            .or_insert_with(|| {
                let mut seeds = self.seed.clone();
                seeds.push(name.to_string());
                Arc::new(Mutex::new(RandomGenerator::with_seeds(&seeds)))
            })
            .clone()
    }

    /// Returns the generator for `name` within `scope`.
    ///
    /// Without a scope the result is a fresh non-reproducible generator.
    pub fn get(scope: Option<&RandomScope>, name: &str) -> SharedGenerator {
        match scope {
            Some(scope) => scope.stream().sequence(name),
            None => Arc::new(Mutex::new(RandomGenerator::from_entropy())),
        }
    }
}

/// Randomness context of one method invocation.
///
/// Holds the seed the caller supplied and lazily builds the stream from it.
#[derive(Debug, Default)]
pub struct RandomScope {
    random_seed: Option<String>,
    stream: OnceLock<RandomStream>,
}

impl RandomScope {
    pub fn new(random_seed: Option<String>) -> Self {
        Self {
            random_seed,
            stream: OnceLock::new(),
        }
    }

    /// Returns the seed supplied by the caller.
    #[inline]
    pub fn random_seed(&self) -> Option<&str> {
        self.random_seed.as_deref()
    }

    /// Returns the stream of this scope, built on first use.
    pub fn stream(&self) -> &RandomStream {
        self.stream
            .get_or_init(|| RandomStream::new(self.random_seed.clone().map(|s| vec![s])))
    }
}

/// Derives the seed for a method call made from within `enclosing`.
///
/// Top-level calls get a random seed.
pub fn make_rpc_seed(enclosing: Option<&RandomScope>, method_name: &str) -> String {
    match enclosing {
        Some(scope) => scope
            .stream()
            .sequence(&format!("/rpc/{}", method_name))
            .lock()
            .hex_string(20),
        None => random_token(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_sequence() {
        let a = RandomStream::with_seed([1, 2, 3]);
        let b = RandomStream::with_seed([1, 2, 3]);
        let x = a.sequence("x").lock().hex_string(20);
        let y = b.sequence("x").lock().hex_string(20);
        assert_eq!(x, y);
        assert_eq!(a.seed(), &["1".to_string(), "2".to_string(), "3".to_string()]);
    }

    #[test]
    fn test_sequence_names_are_independent() {
        let stream = RandomStream::with_seed(["seed"]);
        let a = stream.sequence("a").lock().hex_string(20);
        let b = stream.sequence("b").lock().hex_string(20);
        assert_ne!(a, b);
    }

    #[test]
    fn test_sequence_continues() {
        let stream = RandomStream::with_seed(["seed"]);
        let first = stream.sequence("ids").lock().id();
        let second = stream.sequence("ids").lock().id();
        assert_ne!(first, second);

        let replay = RandomStream::with_seed(["seed"]);
        let seq = replay.sequence("ids");
        assert_eq!(seq.lock().id(), first);
        assert_eq!(seq.lock().id(), second);
    }

    #[test]
    fn test_sequence_independent_of_other_draws() {
        let a = RandomStream::with_seed(["s"]);
        let _ = a.sequence("other").lock().secret();
        let from_a = a.sequence("ids").lock().id();

        let b = RandomStream::with_seed(["s"]);
        assert_eq!(b.sequence("ids").lock().id(), from_a);
    }

    #[test]
    fn test_unseeded_stream_gets_token() {
        let stream = RandomStream::new(None);
        assert_eq!(stream.seed().len(), 1);
        assert_eq!(stream.seed()[0].len(), 20);
    }

    #[test]
    fn test_get_without_scope_is_unseeded() {
        let gen = RandomStream::get(None, "default");
        assert!(!gen.lock().is_seeded());
    }

    #[test]
    fn test_get_with_scope_reuses_generator() {
        let scope = RandomScope::new(Some("abc".into()));
        let a = RandomStream::get(Some(&scope), "n");
        let b = RandomStream::get(Some(&scope), "n");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.lock().is_seeded());
        assert_eq!(scope.random_seed(), Some("abc"));
    }

    #[test]
    fn test_make_rpc_seed() {
        let outer = RandomScope::new(Some("outer".into()));
        let replay = RandomScope::new(Some("outer".into()));

        let seed = make_rpc_seed(Some(&outer), "child");
        assert_eq!(seed.len(), 20);
        assert_eq!(seed, make_rpc_seed(Some(&replay), "child"));
        assert_ne!(
            make_rpc_seed(Some(&outer), "child"),
            seed,
            "second nested call draws the next value"
        );
        assert_ne!(make_rpc_seed(Some(&replay), "other"), seed);

        let top_level = make_rpc_seed(None, "child");
        assert_eq!(top_level.len(), 20);
    }
}
