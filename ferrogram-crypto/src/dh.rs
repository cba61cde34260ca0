//! Validation of server-supplied Diffie-Hellman parameters.
//!
//! A server (or anyone in the middle) that picks a weak group can recover
//! the auth key, so every check here is mandatory before `g_b` is sent.

use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};

/// The 2048-bit safe prime the production servers use.
pub const KNOWN_PRIME_HEX: &str = concat!(
    "C71CAEB9C6B1C9048E6C522F70F13F73980D40238E3E21C14934D037563D930F",
    "48198A0AA7C14058229493D22530F4DBFA336F6E0AC925139543AED44CCE7C37",
    "20FD51F69458705AC68CD4FE6B6B13ABDC9746512969328454F18FAF8C595F64",
    "2477FE96BB2A941D5BCD1D4AC8CC49880708FA9B378E3C4F3A9060BEE67CF9A4",
    "A4A695811051907E162753B56B0F6B410DBA74D8A84B2A14B3144E0EF1284754",
    "FD17ED950D5965B4B9DD46582DB1178D169C6BC465B0D6FF9CA3928FEF5B9AE4",
    "E418FC15E83EBEA0F87FA9FF5EED70050DED2849F47BF959D956850CE929851F",
    "0D8115F635B105EE2E4E15D04B2454BF6F4FADF034B10403119CD8E3B92FCC5B",
);

const MILLER_RABIN_ROUNDS: usize = 30;

const SMALL_PRIMES: [u32; 15] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47];

/// Why a set of DH parameters was refused.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DhParamError {
    #[error("dh_prime is {bits} bits, expected 2048")]
    PrimeSize { bits: u64 },
    #[error("dh_prime is not a safe prime")]
    NotSafePrime,
    #[error("g = {0} is outside 2..=7")]
    GeneratorOutOfRange(i32),
    #[error("g = {0} does not generate a subgroup of order (p-1)/2 for this prime")]
    BadGenerator(i32),
    #[error("{0} is outside (2^1984, p - 2^1984)")]
    ValueOutOfRange(&'static str),
}

/// The well-known prime as a number.
pub fn known_prime() -> BigUint {
    // The constant is valid hex; parse cannot fail.
    BigUint::parse_bytes(KNOWN_PRIME_HEX.as_bytes(), 16).unwrap_or_default()
}

/// Check that `p` is a 2048-bit safe prime and that `g` generates the
/// quadratic-residue subgroup of order `(p-1)/2`.
pub fn check_prime_and_generator(p: &BigUint, g: i32) -> Result<(), DhParamError> {
    if p.bits() != 2048 {
        return Err(DhParamError::PrimeSize { bits: p.bits() });
    }
    if !(2..=7).contains(&g) {
        return Err(DhParamError::GeneratorOutOfRange(g));
    }

    let residue_ok = match g {
        2 => rem(p, 8) == 7,
        3 => rem(p, 3) == 2,
        4 => true,
        5 => matches!(rem(p, 5), 1 | 4),
        6 => matches!(rem(p, 24), 19 | 23),
        7 => matches!(rem(p, 7), 3 | 5 | 6),
        _ => false,
    };
    if !residue_ok {
        return Err(DhParamError::BadGenerator(g));
    }

    if *p != known_prime() {
        let half = (p - BigUint::one()) >> 1u32;
        if !is_probable_prime(p, MILLER_RABIN_ROUNDS) || !is_probable_prime(&half, MILLER_RABIN_ROUNDS) {
            return Err(DhParamError::NotSafePrime);
        }
    }
    Ok(())
}

/// Check `1 < v < p - 1` and `2^(2048-64) < v < p - 2^(2048-64)`.
pub fn check_public_value(v: &BigUint, p: &BigUint, name: &'static str) -> Result<(), DhParamError> {
    let one = BigUint::one();
    let safety = BigUint::one() << (2048 - 64);
    if *p <= &safety + &safety {
        return Err(DhParamError::ValueOutOfRange(name));
    }
    let in_open = |lo: &BigUint, hi: &BigUint| lo < v && v < hi;
    if !in_open(&one, &(p - &one)) || !in_open(&safety, &(p - &safety)) {
        return Err(DhParamError::ValueOutOfRange(name));
    }
    Ok(())
}

fn rem(p: &BigUint, m: u32) -> u32 {
    (p % BigUint::from(m)).to_u32().unwrap_or(u32::MAX)
}

/// Miller-Rabin probable-prime test.
///
/// Witnesses are random when the system RNG is available, otherwise the
/// small primes are used as fixed bases.
pub fn is_probable_prime(n: &BigUint, rounds: usize) -> bool {
    let one = BigUint::one();
    let two = BigUint::from(2u32);
    if *n < two {
        return false;
    }
    for sp in SMALL_PRIMES {
        let sp = BigUint::from(sp);
        if *n == sp {
            return true;
        }
        if (n % &sp).is_zero() {
            return false;
        }
    }

    let n_minus_one = n - &one;
    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;

    'witness: for i in 0..rounds {
        let a = witness(n, i);
        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

// A base in [2, n-2].
fn witness(n: &BigUint, round: usize) -> BigUint {
    let span = n - BigUint::from(3u32);
    let mut bytes = vec![0u8; ((n.bits() + 7) / 8) as usize];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) if !span.is_zero() => BigUint::from(2u32) + BigUint::from_bytes_be(&bytes) % span,
        _ => BigUint::from(SMALL_PRIMES[round % SMALL_PRIMES.len()]),
    }
}
