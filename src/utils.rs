#[allow(unused)]
use crate::prelude::*;

/// Uniform random `Array2` in `[-limit, limit)` drawn from the given rng.
#[macro_export]
macro_rules! rand_array {
    ($rng:expr, $limit:expr, $($x:expr),*) => {
        {
            Array2::random_using(($($x,)*), Uniform::new(-$limit, $limit), $rng)
        }
    };
}

/// Stable 64-bit FNV-1a fingerprint, used for hash buckets and per-variable seeds.
pub fn fingerprint(s: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    s.bytes()
        .fold(OFFSET, |hash, byte| (hash ^ byte as u64).wrapping_mul(PRIME))
}

/// Index of the largest value in every row; ties resolve to the first index.
pub fn argmax_rows(x: &Array2<f64>) -> Array1<usize> {
    x.outer_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |(best, max), (i, &v)| {
                    if v > max {
                        (i, v)
                    } else {
                        (best, max)
                    }
                })
                .0
        })
        .collect()
}

pub fn zero_fraction(x: &Array2<f64>) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    x.iter().filter(|&&v| v == 0.0).count() as f64 / x.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(fingerprint(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fingerprint("a"), 0xaf63_dc4c_8601_ec8c);
        assert_ne!(fingerprint("english"), fingerprint("french"));
    }

    #[test]
    fn argmax_picks_first_on_ties() {
        let x = array![[0.1, 0.7, 0.2], [0.5, 0.5, 0.0]];
        assert_eq!(argmax_rows(&x), array![1, 0]);
    }

    #[test]
    fn zero_fraction_counts_exact_zeros() {
        let x = array![[0.0, 1.0], [0.0, -2.0]];
        assert_eq!(zero_fraction(&x), 0.5);
    }
}
