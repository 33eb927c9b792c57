//! Probabilistic primality testing and prime candidate generation
//!
//! Miller–Rabin over the fixed-width integer kernel. The first two rounds
//! pin the witnesses 2 and 3; further rounds sample uniformly. One quirk
//! is kept on purpose: `1` reports prime, matching the library's
//! long-standing convention for degenerate inputs.

#![forbid(unsafe_code)]

use rand::Rng;

use crate::bigint::{
    self, add_into, compare, is_zero, pow_mod_into, rem_into, sub_into, BigInt, Scratch,
};

/// Default number of rounds used by RSA key generation.
pub const DEFAULT_ROUNDS: u16 = 10;

/// Miller–Rabin primality test.
///
/// `n` is read at its given width; internally the working width is
/// doubled so squarings of residues never overflow. Trivial cases:
/// even values above 2 are composite, 0 is composite, 1, 2 and 3 are
/// prime.
pub fn miller_rabin<R: Rng>(n: &[u32], rounds: u16, rng: &mut R) -> bool {
    if n.is_empty() || is_zero(n) {
        return false;
    }

    // Values that fit a single word get their trivial answers directly.
    let single = n.iter().skip(1).all(|&w| w == 0);
    if single {
        match n[0] {
            0 => return false,
            1..=3 => return true,
            _ => {}
        }
    }
    if n[0] & 1 == 0 {
        return false;
    }

    // Head-room for products of two residues.
    let len = n.len() * 2;
    let mut ws = Scratch::new(len);
    let mut wide = vec![0u32; len];
    wide[..n.len()].copy_from_slice(n);
    let n = wide;

    let mut one = vec![0u32; len];
    one[0] = 1;
    let mut minus_one = vec![0u32; len];
    if !sub_into(&n, &one, &mut minus_one) {
        return false;
    }

    // n - 1 = 2^s * d with d odd.
    let s = match bigint::trailing_zeros(&minus_one) {
        Some(s) => s,
        None => return false,
    };
    let mut d = vec![0u32; len];
    bigint::shr_into(&minus_one, s, &mut d);

    let mut witness = vec![0u32; len];
    let mut x = vec![0u32; len];
    let mut sq = vec![0u32; len];

    for round in 0..rounds {
        match round {
            0 => {
                witness.fill(0);
                witness[0] = 2;
            }
            1 => {
                witness.fill(0);
                witness[0] = 3;
            }
            _ => {
                // Uniform residue, clamped into [2, n - 2].
                for w in witness.iter_mut() {
                    *w = rng.gen();
                }
                let cand = witness.clone();
                if !rem_into(&cand, &n, &mut witness, &mut ws) {
                    return false;
                }
                if witness[0] < 3 && witness.iter().skip(1).all(|&w| w == 0) {
                    witness[0] = 3;
                }
                if compare(&witness, &minus_one) != std::cmp::Ordering::Less {
                    witness.copy_from_slice(&one);
                    witness[0] = 3;
                }
            }
        }

        if !pow_mod_into(&witness, &d, &n, &mut x, &mut ws) {
            return false;
        }
        if compare(&x, &one) == std::cmp::Ordering::Equal
            || compare(&x, &minus_one) == std::cmp::Ordering::Equal
        {
            continue;
        }

        let mut hit = false;
        for _ in 1..s {
            if !bigint::mul_into(&x.clone(), &x.clone(), &mut sq, &mut ws) {
                return false;
            }
            if !rem_into(&sq, &n, &mut x, &mut ws) {
                return false;
            }
            if compare(&x, &one) == std::cmp::Ordering::Equal {
                return false;
            }
            if compare(&x, &minus_one) == std::cmp::Ordering::Equal {
                hit = true;
                break;
            }
        }
        if !hit {
            return false;
        }
    }
    true
}

/// Generate a probable prime filling `half_words` words of a
/// `total_words`-wide array: least-significant bit set, top bit of word
/// `half_words - 1` set, advanced by two until `rounds` Miller–Rabin
/// rounds pass.
pub fn generate_prime<R: Rng>(total_words: usize, half_words: usize, rounds: u16, rng: &mut R) -> BigInt {
    debug_assert!(half_words > 0 && half_words <= total_words);
    let mut candidate = vec![0u32; total_words];
    for w in candidate.iter_mut().take(half_words) {
        *w = rng.gen();
    }
    candidate[0] |= 1;
    candidate[half_words - 1] |= 1 << 31;

    let two = {
        let mut t = vec![0u32; total_words];
        t[0] = 2;
        t
    };
    while !miller_rabin(&candidate, rounds, rng) {
        let cur = candidate.clone();
        // Cannot overflow: the candidate occupies the low half.
        add_into(&cur, &two, &mut candidate);
    }
    BigInt::from_words(&candidate)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn is_prime(v: u32) -> bool {
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let words = [v, 0, 0, 0];
        miller_rabin(&words, 10, &mut rng)
    }

    #[test]
    fn known_primes_pass_ten_rounds() {
        for v in [2u32, 3, 5, 401] {
            assert!(is_prime(v), "{v} should be prime");
        }
    }

    #[test]
    fn known_composites_fail() {
        for v in [0u32, 4, 55, 99, 243_407] {
            assert!(!is_prime(v), "{v} should be composite");
        }
    }

    #[test]
    fn one_is_prime_by_convention() {
        assert!(is_prime(1));
    }

    #[test]
    fn large_known_values() {
        // 2^31 - 1 is a Mersenne prime; 2^31 - 3 factors.
        assert!(is_prime(0x7FFF_FFFF));
        assert!(!is_prime(0x7FFF_FFFD));
    }

    #[test]
    fn multiword_prime_and_composite() {
        let mut rng = StdRng::seed_from_u64(7);
        // 2^61 - 1 (Mersenne prime) spread over two words.
        let p61 = [0xFFFF_FFFFu32, 0x1FFF_FFFF, 0, 0];
        assert!(miller_rabin(&p61, 10, &mut rng));
        // An even neighbor.
        let even = [0xFFFF_FFFEu32, 0x1FFF_FFFF, 0, 0];
        assert!(!miller_rabin(&even, 10, &mut rng));
    }

    #[test]
    fn generated_prime_has_requested_shape() {
        let mut rng = StdRng::seed_from_u64(42);
        let p = generate_prime(4, 2, 10, &mut rng);
        assert_eq!(p.len(), 4);
        assert_eq!(p.words()[0] & 1, 1);
        assert!(p.words()[1] & (1 << 31) != 0);
        assert_eq!(p.words()[2], 0);
        assert_eq!(p.words()[3], 0);
        assert!(miller_rabin(p.words(), 10, &mut rng));
    }
}
