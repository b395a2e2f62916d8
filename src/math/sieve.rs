//! Prime sieve (C1): `nth_prime(k)` for k >= 1, backed by a prefilled
//! cache and a segmented, wheel-filtered Sieve of Eratosthenes beyond it.

use crate::math::transcendental as tr;

/// Number of primes kept in the prefilled cache, built once at model
/// construction (`spec.md` §4.1: "at least 10,000 primes").
pub const CACHE_SIZE: usize = 10_000;

/// One segment is 32 KiB of bits, one bit per odd candidate, per
/// `spec.md` §4.1.
const SEGMENT_BYTES: usize = 32 * 1024;
const SEGMENT_BITS: usize = SEGMENT_BYTES * 8;

/// Residues mod 12 a prime (other than 2 and 3) must fall into. Asserted
/// as an invariant after every segment, per spec: this does not change
/// correctness (it is implied by primality) but documents an assumption
/// downstream consumers (the lattice map) rely on.
fn is_valid_residue(p: u64) -> bool {
    if p == 2 || p == 3 {
        return true;
    }
    matches!(p % 12, 1 | 5 | 7 | 11)
}

/// A growable cache of primes in increasing order, plus a segmented
/// sieve that extends it on demand.
pub struct PrimeSieve {
    cache: Vec<u64>,
}

impl PrimeSieve {
    /// Builds the cache, eagerly filling at least `CACHE_SIZE` primes.
    pub fn new() -> Self {
        let mut sieve = PrimeSieve { cache: Vec::new() };
        sieve.extend_to_count(CACHE_SIZE);
        sieve
    }

    /// The k-th prime (1-indexed; `nth_prime(1) == 2`).
    pub fn nth_prime(&mut self, k: usize) -> u64 {
        assert!(k >= 1, "nth_prime is 1-indexed");
        if k > self.cache.len() {
            self.extend_to_count(k);
        }
        self.cache[k - 1]
    }

    /// Read-only view of whatever has already been computed. Useful for
    /// tests and for callers that only need primes within the prefilled
    /// cache and want to avoid the `&mut self` of `nth_prime`.
    pub fn cached(&self) -> &[u64] {
        &self.cache
    }

    fn extend_to_count(&mut self, count: usize) {
        if self.cache.len() >= count {
            return;
        }
        if self.cache.is_empty() {
            // Simple sieve for the base primes, regrown geometrically until
            // it is guaranteed to contain at least `count` primes. The prime
            // counting function pi(n) ~ n/ln(n), so n = count*(ln(count)+2)
            // is a safe, generous upper bound for small/medium `count`.
            let mut limit = estimate_upper_bound(count.max(16));
            loop {
                self.cache = simple_sieve(limit);
                if self.cache.len() >= count {
                    break;
                }
                limit *= 2;
            }
        } else {
            // Beyond the prefilled cache, grow it with the segmented
            // sieve (`spec.md` §4.1) instead of rebuilding everything
            // from scratch: `primes_in_range` walks `(lo, hi]` in 32 KiB
            // segments and we only need the primes past what we already
            // hold.
            let mut lo = *self.cache.last().unwrap();
            let mut hi = estimate_upper_bound(count.max(16));
            loop {
                self.cache.extend(primes_in_range(lo, hi));
                if self.cache.len() >= count {
                    break;
                }
                lo = hi;
                hi *= 2;
            }
        }
        for &p in &self.cache {
            debug_assert!(
                is_valid_residue(p),
                "prime {p} violates the mod-12 residue invariant"
            );
        }
    }
}

impl Default for PrimeSieve {
    fn default() -> Self {
        Self::new()
    }
}

fn estimate_upper_bound(count: usize) -> u64 {
    let n = count as f32;
    let bound = n * (tr::log(n) + 2.0);
    tr::ceil(bound) as u64 + 64
}

/// Plain Sieve of Eratosthenes up to and including `limit`, used to seed
/// the base primes for the segmented sieve and directly for small caches.
fn simple_sieve(limit: u64) -> Vec<u64> {
    let limit = limit as usize;
    let mut is_composite = vec![false; limit + 1];
    let mut primes = Vec::new();
    for n in 2..=limit {
        if !is_composite[n] {
            primes.push(n as u64);
            let mut m = n * n;
            while m <= limit {
                is_composite[m] = true;
                m += n;
            }
        }
    }
    primes
}

/// Produces primes in `(lo, hi]` using the base primes up to `sqrt(hi)`,
/// processing the range in 32 KiB segments (one bit per odd candidate).
/// This is the on-demand extension path described in `spec.md` §4.1:
/// `extend_to_count` calls this directly once the prefilled cache is
/// exhausted, and it is also exposed on its own for callers that want
/// primes in a bounded window without materializing every prime below it.
pub fn primes_in_range(lo: u64, hi: u64) -> Vec<u64> {
    if hi < 2 || hi <= lo {
        return Vec::new();
    }
    let sqrt_hi = tr::ceil(tr::sqrt(hi as f32)) as u64 + 1;
    let base_primes = simple_sieve(sqrt_hi);

    let mut out = Vec::new();
    let start = lo.max(1) + 1; // (lo, hi] -> first odd candidate search
    let mut seg_lo = start;
    while seg_lo <= hi {
        let seg_hi = (seg_lo + SEGMENT_BITS as u64 * 2).min(hi);
        let mut composite = vec![false; ((seg_hi - seg_lo) / 2 + 1) as usize];
        for &p in &base_primes {
            if p < 2 {
                continue;
            }
            let p2 = p * p;
            let mut first = if p2 > seg_lo {
                p2
            } else {
                let rem = seg_lo % p;
                let mut f = seg_lo + (if rem == 0 { 0 } else { p - rem });
                if f < p2 {
                    f = p2;
                }
                f
            };
            if first % 2 == 0 {
                first += p;
            }
            let mut m = first;
            while m <= seg_hi {
                if m >= seg_lo {
                    composite[((m - seg_lo) / 2) as usize] = true;
                }
                m += 2 * p;
            }
        }
        let mut c = seg_lo;
        if c % 2 == 0 {
            c += 1;
        }
        while c <= seg_hi {
            let idx = ((c - seg_lo) / 2) as usize;
            if !composite[idx] && is_prime_trial(c, &base_primes) {
                out.push(c);
            }
            c += 2;
        }
        seg_lo = seg_hi + 1;
    }
    out
}

fn is_prime_trial(n: u64, base_primes: &[u64]) -> bool {
    for &p in base_primes {
        if p * p > n {
            break;
        }
        if n % p == 0 {
            return n == p;
        }
    }
    n > 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_primes_are_correct() {
        let mut sieve = PrimeSieve::new();
        let expected = [2u64, 3, 5, 7, 11, 13, 17, 19, 23, 29];
        for (i, &p) in expected.iter().enumerate() {
            assert_eq!(sieve.nth_prime(i + 1), p);
        }
    }

    #[test]
    fn nth_prime_count_matches_index() {
        let mut sieve = PrimeSieve::new();
        for k in 1..=2000usize {
            let p = sieve.nth_prime(k);
            let below = sieve.cached().iter().filter(|&&q| q < p).count();
            assert_eq!(below, k - 1, "k={k} p={p}");
        }
    }

    #[test]
    fn residues_hold_from_the_third_prime_onward() {
        let mut sieve = PrimeSieve::new();
        for k in 3..=5000usize {
            let p = sieve.nth_prime(k);
            assert!(matches!(p % 12, 1 | 5 | 7 | 11), "p={p} k={k}");
        }
    }

    #[test]
    fn cache_grows_past_its_initial_size() {
        let mut sieve = PrimeSieve::new();
        let p = sieve.nth_prime(CACHE_SIZE + 500);
        assert!(p > sieve.cached()[CACHE_SIZE - 1]);
    }

    #[test]
    fn primes_in_range_matches_simple_sieve() {
        let all = simple_sieve(2000);
        let ranged = primes_in_range(1000, 2000);
        let expected: Vec<u64> = all.into_iter().filter(|&p| p > 1000).collect();
        assert_eq!(ranged, expected);
    }
}
