//! Alea pseudo-random generator.
//!
//! All arithmetic is done in `f64` with explicit 32-bit truncations so the
//! output matches other implementations of the same algorithm bit for bit.

const TWO_POW_32: f64 = 4_294_967_296.0;
const TWO_POW_NEG_32: f64 = 2.328_306_436_538_696_3e-10;

/// Truncates to an unsigned 32-bit integer, wrapping like `x >>> 0`.
fn to_uint32(x: f64) -> f64 {
    if !x.is_finite() {
        return 0.0;
    }
    x.trunc().rem_euclid(TWO_POW_32)
}

/// Truncates to a signed 32-bit integer, wrapping like `x | 0`.
fn to_int32(x: f64) -> f64 {
    let u = to_uint32(x);
    if u >= TWO_POW_32 / 2.0 {
        u - TWO_POW_32
    } else {
        u
    }
}

struct Mash {
    n: f64,
}

impl Mash {
    fn new() -> Self {
        Self {
            n: 4_022_871_197.0,
        }
    }

    fn mash(&mut self, data: &str) -> f64 {
        for unit in data.encode_utf16() {
            self.n += f64::from(unit);
            let mut h = 0.025_196_032_824_169_38 * self.n;
            self.n = to_uint32(h);
            h -= self.n;
            h *= self.n;
            self.n = to_uint32(h);
            h -= self.n;
            self.n += h * TWO_POW_32;
        }
        to_uint32(self.n) * TWO_POW_NEG_32
    }
}

/// Seeded generator producing fractions in `[0, 1)`.
#[derive(Debug, Clone)]
pub struct Alea {
    s0: f64,
    s1: f64,
    s2: f64,
    c: f64,
}

impl Alea {
    /// Creates a generator from string seeds. Order matters.
    pub fn new<S: AsRef<str>>(seeds: &[S]) -> Self {
        let mut mash = Mash::new();
        let mut s0 = mash.mash(" ");
        let mut s1 = mash.mash(" ");
        let mut s2 = mash.mash(" ");

        for seed in seeds {
            let seed = seed.as_ref();
            s0 -= mash.mash(seed);
            if s0 < 0.0 {
                s0 += 1.0;
            }
            s1 -= mash.mash(seed);
            if s1 < 0.0 {
                s1 += 1.0;
            }
            s2 -= mash.mash(seed);
            if s2 < 0.0 {
                s2 += 1.0;
            }
        }

        Self { s0, s1, s2, c: 1.0 }
    }

    /// Returns the next fraction in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        let t = 2_091_639.0 * self.s0 + self.c * TWO_POW_NEG_32;
        self.s0 = self.s1;
        self.s1 = self.s2;
        self.c = to_int32(t);
        self.s2 = t - self.c;
        self.s2
    }
}
