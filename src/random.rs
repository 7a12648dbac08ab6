//! Random number source for `random` and `setrandom`.
//!
//! A zero seed selects native mode, seeded from the clock. Any other seed
//! gives a repeatable sequence from a lagged subtractive generator.

use std::time::{SystemTime, UNIX_EPOCH};

const TABLE_LEN: usize = 55;

#[derive(Debug, Clone)]
pub struct Random {
    table: [u32; TABLE_LEN],
    idx1: usize,
    idx2: usize,
}

impl Default for Random {
    fn default() -> Self {
        Random::new(0)
    }
}

impl Random {
    pub fn new(seed: u32) -> Self {
        let mut random = Random {
            table: [0; TABLE_LEN],
            idx1: 0,
            idx2: 31,
        };
        random.seed(seed);
        random
    }

    /// Reseed the generator. Zero reseeds from the clock.
    pub fn seed(&mut self, seed: u32) {
        let seed = if seed == 0 {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            (now.as_nanos() as u32) | 1
        } else {
            seed
        };

        self.table[TABLE_LEN - 1] = seed;
        self.idx1 = 0;
        self.idx2 = 31;
        let mut seed = seed;
        let mut k = 1u32;
        for i in 0..TABLE_LEN {
            let ii = (21 * i) % TABLE_LEN;
            self.table[ii] = k;
            k = seed.wrapping_sub(k);
            seed = self.table[ii];
        }
        for _ in 0..4 {
            for i in 0..TABLE_LEN {
                let other = self.table[(1 + i + 30) % TABLE_LEN];
                self.table[i] = self.table[i].wrapping_sub(other);
            }
        }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.idx1 = (self.idx1 + 1) % TABLE_LEN;
        self.idx2 = (self.idx2 + 1) % TABLE_LEN;
        self.table[self.idx1] = self.table[self.idx1].wrapping_sub(self.table[self.idx2]);
        self.table[self.idx1]
    }

    /// Value for `random n`: any 32-bit value for zero, `0..n` for positive
    /// `n`, `n+1..=0` for negative `n`.
    pub fn range(&mut self, n: u32) -> u32 {
        let n = n as i32;
        match n {
            0 => {
                let lo = self.next_u32() >> 16;
                let hi = self.next_u32() >> 16;
                lo | (hi << 16)
            }
            n if n > 0 => ((self.next_u32() as u64 * n as u64) >> 32) as u32,
            n => {
                let scaled = (self.next_u32() as u64 * n.unsigned_abs() as u64) >> 32;
                (scaled as u32).wrapping_neg()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn seeded_sequence_repeats() {
        let mut a = Random::new(1234);
        let mut b = Random::new(99);
        let first: Vec<u32> = (0..20).map(|_| a.range(0)).collect();
        b.seed(1234);
        let second: Vec<u32> = (0..20).map(|_| b.range(0)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn native_mode_produces_values() {
        let mut random = Random::new(0);
        let values: Vec<u32> = (0..8).map(|_| random.range(0)).collect();
        assert!(values.iter().any(|v| *v != values[0]));
    }

    proptest! {
        #[test]
        fn range_bounds(seed in 1u32.., n in 1i32..) {
            let mut random = Random::new(seed);
            for _ in 0..16 {
                let pos = random.range(n as u32) as i32;
                prop_assert!(pos >= 0 && pos < n);
                let neg = random.range((-n) as u32) as i32;
                prop_assert!(neg <= 0 && neg > -n);
            }
        }
    }
}
