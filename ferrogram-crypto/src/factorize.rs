//! Pollard-rho (Brent variant) integer factorization for the PQ step.

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 { let t = b; b = a % b; a = t; }
    a
}

fn abs_sub(a: u128, b: u128) -> u128 { a.max(b) - a.min(b) }

fn mulmod(a: u128, b: u128, m: u128) -> u128 {
    // pq < 2^64, so operands < 2^64 and the product fits in u128.
    a * b % m
}

fn factorize_with(pq: u128, c: u128) -> Option<(u64, u64)> {
    if pq % 2 == 0 {
        return Some((2, (pq / 2) as u64));
    }

    let step = |y: u128| (mulmod(y, y, pq) + c) % pq;

    let mut y = 3 * (pq / 7);
    let m = 7 * (pq / 13);
    let mut g = 1u128;
    let mut r = 1u128;
    let mut q = 1u128;
    let mut x = 0u128;
    let mut ys = 0u128;

    while g == 1 {
        x = y;
        for _ in 0..r { y = step(y); }
        let mut k = 0;
        while k < r && g == 1 {
            ys = y;
            for _ in 0..m.min(r - k) {
                y = step(y);
                q = mulmod(q, abs_sub(x, y), pq);
            }
            g = gcd(q, pq);
            k += m;
        }
        r *= 2;
    }

    if g == pq {
        loop {
            ys = step(ys);
            g = gcd(abs_sub(x, ys), pq);
            if g > 1 { break; }
        }
    }

    if g == 1 || g == pq {
        return None;
    }
    let p = g as u64;
    let q = (pq / g) as u64;
    Some((p.min(q), p.max(q)))
}

/// Factorize `pq` into two factors `(p, q)` where `p ≤ q`.
///
/// Returns `None` when every seed fails, which only happens for inputs a
/// server would never legitimately send (primes, 0, 1).
pub fn factorize(pq: u64) -> Option<(u64, u64)> {
    if pq < 4 {
        return None;
    }
    let n = pq as u128;
    [43u128, 47, 53, 59, 61]
        .into_iter()
        .find_map(|seed| factorize_with(n, seed * (n / 103)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t1() { assert_eq!(factorize(1470626929934143021), Some((1206429347, 1218991343))); }

    #[test]
    fn t2() { assert_eq!(factorize(2363612107535801713), Some((1518968219, 1556064227))); }

    #[test]
    fn even() { assert_eq!(factorize(2 * 1000003), Some((2, 1000003))); }

    #[test]
    fn trivial_inputs() {
        assert_eq!(factorize(0), None);
        assert_eq!(factorize(1), None);
    }
}
