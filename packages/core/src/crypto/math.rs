//! Modular arithmetic over the 1536-bit Diffie-Hellman group (RFC 3526, group 5).
//!
//! All helpers are pure functions over owned `BigUint` values. `p` is a safe
//! prime, `q = (p - 1) / 2` is the order of the subgroup generated by `g = 2`.

use crate::crypto::secure_memory::Secret;
use crate::error::Result;
use num_bigint::BigUint;
use rand_core::RngCore;
use std::sync::OnceLock;

const DH_PRIME_BYTES: [u8; 192] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2,
    0x21, 0x68, 0xC2, 0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1,
    0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6,
    0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45,
    0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9,
    0xA6, 0x37, 0xED, 0x6B, 0x0B, 0xFF, 0x5C, 0xB6, 0xF4, 0x06, 0xB7, 0xED,
    0xEE, 0x38, 0x6B, 0xFB, 0x5A, 0x89, 0x9F, 0xA5, 0xAE, 0x9F, 0x24, 0x11,
    0x7C, 0x4B, 0x1F, 0xE6, 0x49, 0x28, 0x66, 0x51, 0xEC, 0xE4, 0x5B, 0x3D,
    0xC2, 0x00, 0x7C, 0xB8, 0xA1, 0x63, 0xBF, 0x05, 0x98, 0xDA, 0x48, 0x36,
    0x1C, 0x55, 0xD3, 0x9A, 0x69, 0x16, 0x3F, 0xA8, 0xFD, 0x24, 0xCF, 0x5F,
    0x83, 0x65, 0x5D, 0x23, 0xDC, 0xA3, 0xAD, 0x96, 0x1C, 0x62, 0xF3, 0x56,
    0x20, 0x85, 0x52, 0xBB, 0x9E, 0xD5, 0x29, 0x07, 0x70, 0x96, 0x96, 0x6D,
    0x67, 0x0C, 0x35, 0x4E, 0x4A, 0xBC, 0x98, 0x04, 0xF1, 0x74, 0x6C, 0x08,
    0xCA, 0x23, 0x73, 0x27, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

static P: OnceLock<BigUint> = OnceLock::new();
static Q: OnceLock<BigUint> = OnceLock::new();
static G: OnceLock<BigUint> = OnceLock::new();
static P_MINUS_2: OnceLock<BigUint> = OnceLock::new();

pub fn p() -> &'static BigUint {
    P.get_or_init(|| BigUint::from_bytes_be(&DH_PRIME_BYTES))
}

pub fn q() -> &'static BigUint {
    Q.get_or_init(|| (p() - 1u32) >> 1)
}

pub fn g() -> &'static BigUint {
    G.get_or_init(|| BigUint::from(2u32))
}

fn p_minus_2() -> &'static BigUint {
    P_MINUS_2.get_or_init(|| p() - 2u32)
}

/// base^exp mod p
pub fn mod_exp(base: &BigUint, exp: &BigUint) -> BigUint {
    base.modpow(exp, p())
}

/// g^exp mod p
pub fn mod_exp_g(exp: &BigUint) -> BigUint {
    g().modpow(exp, p())
}

pub fn mul_mod(a: &BigUint, b: &BigUint, m: &BigUint) -> BigUint {
    (a * b) % m
}

/// Inverse modulo the prime `m` via Fermat's little theorem.
pub fn mod_inverse_prime(a: &BigUint, m: &BigUint) -> BigUint {
    a.modpow(&(m - 2u32), m)
}

/// a / b mod p
pub fn div_mod(a: &BigUint, b: &BigUint) -> BigUint {
    mul_mod(a, &b.modpow(p_minus_2(), p()), p())
}

/// (a - b) mod m, for non-negative operands of any size.
pub fn sub_mod(a: &BigUint, b: &BigUint, m: &BigUint) -> BigUint {
    let a = a % m;
    let b = b % m;
    if a >= b {
        a - b
    } else {
        m - b + a
    }
}

/// A received DH value must satisfy 2 <= v <= p - 2.
pub fn is_group_element(v: &BigUint) -> bool {
    let two = BigUint::from(2u32);
    *v >= two && v <= p_minus_2()
}

/// Fills a fresh buffer of `len` bytes from `rng`; any failure is a short read.
pub fn random_bytes(rng: &mut dyn RngCore, len: usize) -> Result<Secret> {
    let mut buf = vec![0u8; len];
    rng.try_fill_bytes(&mut buf)?;
    Ok(Secret::new(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::{One, Zero};

    #[test]
    fn test_group_parameters() {
        assert_eq!(p().bits(), 1536);
        assert_eq!(&(q() * 2u32 + 1u32), p());
        assert!(mod_exp_g(q()).is_one());
    }

    #[test]
    fn test_group_element_bounds() {
        assert!(!is_group_element(&BigUint::zero()));
        assert!(!is_group_element(&BigUint::one()));
        assert!(is_group_element(&BigUint::from(2u32)));
        assert!(is_group_element(p_minus_2()));
        assert!(!is_group_element(&(p() - 1u32)));
        assert!(!is_group_element(p()));
    }

    #[test]
    fn test_sub_mod_wraps_negative_results() {
        let m = BigUint::from(11u32);
        assert_eq!(sub_mod(&BigUint::from(3u32), &BigUint::from(5u32), &m), BigUint::from(9u32));
        assert_eq!(sub_mod(&BigUint::from(5u32), &BigUint::from(3u32), &m), BigUint::from(2u32));
        assert_eq!(sub_mod(&BigUint::from(3u32), &BigUint::from(27u32), &m), BigUint::from(9u32));
    }

    #[test]
    fn test_div_mod_inverts_mul_mod() {
        let a = mod_exp_g(&BigUint::from(12345u32));
        let b = mod_exp_g(&BigUint::from(999u32));
        let prod = mul_mod(&a, &b, p());
        assert_eq!(div_mod(&prod, &b), a);
    }

    #[test]
    fn test_dh_agreement() {
        let x = BigUint::from(0x1234_5678u64);
        let y = BigUint::from(0x9abc_def0u64);
        let gx = mod_exp_g(&x);
        let gy = mod_exp_g(&y);
        assert_eq!(mod_exp(&gy, &x), mod_exp(&gx, &y));
    }
}
