//! Random strings and ids over a seeded or entropy-backed source.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::alea::Alea;

/// Alphabet for ids: no characters that are easily confused when read.
pub const UNMISTAKABLE_CHARS: &str = "23456789ABCDEFGHJKLMNPQRSTWXYZabcdefghijkmnopqrstuvwxyz";

/// Alphabet for secrets.
pub const BASE64_CHARS: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Alphabet for hex strings.
pub const HEX_CHARS: &str = "0123456789abcdef";

const DEFAULT_ID_LEN: usize = 17;
const DEFAULT_SECRET_LEN: usize = 43;

#[derive(Debug)]
enum Source {
    Seeded(Alea),
    Entropy(StdRng),
}

/// Generator of fractions, ids and random strings.
///
/// A seeded generator is reproducible; an entropy-backed one is not.
#[derive(Debug)]
pub struct RandomGenerator {
    source: Source,
}

impl RandomGenerator {
    /// Creates a reproducible generator.
    pub fn with_seeds<S: AsRef<str>>(seeds: &[S]) -> Self {
        Self {
            source: Source::Seeded(Alea::new(seeds)),
        }
    }

    /// Creates a non-reproducible generator seeded from the OS.
    pub fn from_entropy() -> Self {
        Self {
            source: Source::Entropy(StdRng::from_entropy()),
        }
    }

    /// Returns true if the output is reproducible from a seed.
    #[inline]
    pub fn is_seeded(&self) -> bool {
        matches!(self.source, Source::Seeded(_))
    }

    /// Returns a fraction in `[0, 1)`.
    pub fn fraction(&mut self) -> f64 {
        match &mut self.source {
            Source::Seeded(alea) => alea.next_f64(),
            Source::Entropy(rng) => rng.gen::<f64>(),
        }
    }

    /// Picks one character of `alphabet`.
    pub fn choice(&mut self, alphabet: &str) -> char {
        let chars: Vec<char> = alphabet.chars().collect();
        self.choose_from(&chars).unwrap_or_default()
    }

    fn choose_from(&mut self, chars: &[char]) -> Option<char> {
        if chars.is_empty() {
            return None;
        }
        let index = (self.fraction() * chars.len() as f64).floor() as usize;
        chars.get(index.min(chars.len() - 1)).copied()
    }

    /// Returns `len` characters drawn from `alphabet`.
    pub fn random_string(&mut self, len: usize, alphabet: &str) -> String {
        let chars: Vec<char> = alphabet.chars().collect();
        (0..len).filter_map(|_| self.choose_from(&chars)).collect()
    }

    /// Returns `digits` lowercase hex digits.
    pub fn hex_string(&mut self, digits: usize) -> String {
        self.random_string(digits, HEX_CHARS)
    }

    /// Returns a 17 character document id.
    pub fn id(&mut self) -> String {
        self.id_of_len(DEFAULT_ID_LEN)
    }

    /// Returns a document id of the given length.
    pub fn id_of_len(&mut self, len: usize) -> String {
        self.random_string(len, UNMISTAKABLE_CHARS)
    }

    /// Returns a 43 character secret (about 256 bits).
    pub fn secret(&mut self) -> String {
        self.random_string(DEFAULT_SECRET_LEN, BASE64_CHARS)
    }
}

/// Returns a fresh non-reproducible 20 digit hex token.
pub fn random_token() -> String {
    RandomGenerator::from_entropy().hex_string(20)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_string_alphabet() {
        let mut gen = RandomGenerator::with_seeds(&["hex"]);
        let s = gen.hex_string(64);
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| HEX_CHARS.contains(c)));
    }

    #[test]
    fn test_id_shape() {
        let mut gen = RandomGenerator::from_entropy();
        let id = gen.id();
        assert_eq!(id.chars().count(), 17);
        assert!(id.chars().all(|c| UNMISTAKABLE_CHARS.contains(c)));
        assert_eq!(gen.id_of_len(5).len(), 5);
    }

    #[test]
    fn test_secret_shape() {
        let mut gen = RandomGenerator::with_seeds(&["s"]);
        let secret = gen.secret();
        assert_eq!(secret.len(), 43);
        assert!(secret.chars().all(|c| BASE64_CHARS.contains(c)));
    }

    #[test]
    fn test_choice_empty_alphabet() {
        let mut gen = RandomGenerator::with_seeds(&["e"]);
        assert_eq!(gen.choice(""), '\0');
        assert_eq!(gen.random_string(3, ""), "");
    }

    #[test]
    fn test_seeded_generators_agree() {
        let mut a = RandomGenerator::with_seeds(&["1", "2", "3"]);
        let mut b = RandomGenerator::with_seeds(&["1", "2", "3"]);
        assert!(a.is_seeded());
        assert_eq!(a.id(), b.id());
        assert_eq!(a.hex_string(20), b.hex_string(20));
    }

    #[test]
    fn test_entropy_generators_differ() {
        let a = RandomGenerator::from_entropy().secret();
        let b = RandomGenerator::from_entropy().secret();
        assert_ne!(a, b);
        assert!(!RandomGenerator::from_entropy().is_seeded());
    }

    #[test]
    fn test_random_token() {
        let token = random_token();
        assert_eq!(token.len(), 20);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
