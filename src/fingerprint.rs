//! Stern & Dill hash compaction.
//!
//! A state fingerprint is two independent 32-bit words derived from a large
//! table of random words (the "grate", computed once per process from a fixed
//! seed so runs are reproducible). Every set bit of a serialized fragment,
//! taken at its absolute position in the logical state bitstream, XORs two
//! grate words into the running fingerprint.
//!
//! The only combinator is XOR, which is associative and commutative: the
//! globals, each process stack, and each heap object are hashed independently
//! and combined in any order, so re-hashing one changed fragment only requires
//! re-concatenating it.
//!
//! Fingerprint equality is treated as state equality *with high probability*.
//! That trade-off (memory and speed against a vanishingly small chance of two
//! distinct states colliding) is deliberate and load-bearing; callers must not
//! assume exactness.
//!
//! # Reference
//!
//! - U. Stern and D. L. Dill, "Improved Probabilistic Verification by Hash
//!   Compaction", CHARME 1995.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Number of `u32` words in the grate. Power of two so absolute bit positions
/// wrap by masking.
const GRATE_WORDS: usize = 1 << 18;
const GRATE_MASK: u64 = (GRATE_WORDS as u64) - 1;

/// Fixed seed for the grate. Changing it changes every fingerprint ever
/// produced, so it is part of the on-disk frontier compatibility surface.
const GRATE_SEED: u64 = 0x5744_1995_0C0F_FEE5;

static GRATE: OnceLock<Box<[u32]>> = OnceLock::new();

fn grate() -> &'static [u32] {
    GRATE.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(GRATE_SEED);
        (0..GRATE_WORDS).map(|_| rng.gen::<u32>()).collect()
    })
}

/// A probabilistic hash of a full program state or of one of its fragments.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Fingerprint(pub u32, pub u32);

impl Fingerprint {
    /// The identity of [`Fingerprint::concat`].
    pub const EMPTY: Fingerprint = Fingerprint(0, 0);

    /// Combines two fragments. Associative and commutative.
    #[inline]
    pub fn concat(self, other: Fingerprint) -> Fingerprint {
        Fingerprint(self.0 ^ other.0, self.1 ^ other.1)
    }

    /// A 64-bit form for use as a map key.
    #[inline]
    pub fn to_u64(self) -> u64 {
        ((self.0 as u64) << 32) | self.1 as u64
    }

    pub fn from_u64(word: u64) -> Fingerprint {
        Fingerprint((word >> 32) as u32, word as u32)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}{:08x}", self.0, self.1)
    }
}

/// Hashes a serialized fragment placed at `offset` bytes into the logical
/// state bitstream. The offset lets the same byte pattern hash differently
/// depending on where it occurs, so fields that swap positions do not collide.
pub fn hash_bytes(buf: &[u8], offset: u64) -> Fingerprint {
    let grate = grate();
    let mut fp = Fingerprint::EMPTY;
    for (i, &byte) in buf.iter().enumerate() {
        if byte == 0 {
            continue;
        }
        let byte_pos = offset.wrapping_add(i as u64) << 3;
        for bit in 0..8 {
            if byte & (1 << bit) != 0 {
                let pos = (byte_pos + bit) << 2;
                fp.0 ^= grate[(pos & GRATE_MASK) as usize];
                fp.1 ^= grate[((pos + 1) & GRATE_MASK) as usize];
            }
        }
    }
    fp
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn is_deterministic() {
        let fp1 = hash_bytes(b"two processes, one counter", 64);
        let fp2 = hash_bytes(b"two processes, one counter", 64);
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn depends_on_offset() {
        let fp1 = hash_bytes(b"payload", 0);
        let fp2 = hash_bytes(b"payload", 8);
        assert_ne!(fp1, fp2);
    }

    #[test]
    fn zero_bytes_hash_to_the_identity() {
        assert_eq!(hash_bytes(&[0u8; 32], 123), Fingerprint::EMPTY);
    }

    #[test]
    fn concat_is_commutative_and_self_inverse() {
        let a = hash_bytes(b"globals", 0);
        let b = hash_bytes(b"heap object", 4096);
        assert_eq!(a.concat(b), b.concat(a));
        assert_eq!(a.concat(b).concat(b), a);
        assert_eq!(a.concat(Fingerprint::EMPTY), a);
    }

    #[test]
    fn u64_round_trip() {
        let fp = hash_bytes(b"round trip", 17);
        assert_eq!(Fingerprint::from_u64(fp.to_u64()), fp);
    }
}
