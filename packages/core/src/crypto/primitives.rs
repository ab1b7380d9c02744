//! Hash, MAC and stream cipher helpers used by every protocol layer.
//!
//! OTR v2/v3 pin the primitives: SHA-1 is `hash`, SHA-256 is `hash2`,
//! AES-128 in counter mode is the cipher.

use crate::error::{OtrError, Result};
use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

pub const HASH_LEN: usize = 20;
pub const HASH2_LEN: usize = 32;
pub const AES_KEY_LEN: usize = 16;
pub const AES_BLOCK_LEN: usize = 16;
pub const TRUNCATED_MAC_LEN: usize = 20;

pub fn sha1(data: &[u8]) -> [u8; HASH_LEN] {
    Sha1::digest(data).into()
}

pub fn sha256(data: &[u8]) -> [u8; HASH2_LEN] {
    Sha256::digest(data).into()
}

/// SHA-256(prefix || data), the keyed ladder used for AKE and session keys.
pub fn sha256_prefixed(prefix: u8, data: &[u8]) -> [u8; HASH2_LEN] {
    let mut h = Sha256::new();
    h.update([prefix]);
    h.update(data);
    h.finalize().into()
}

/// SHA-1(prefix || data)
pub fn sha1_prefixed(prefix: u8, data: &[u8]) -> [u8; HASH_LEN] {
    let mut h = Sha1::new();
    h.update([prefix]);
    h.update(data);
    h.finalize().into()
}

pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; HASH2_LEN]> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|e| OtrError::InvalidKey(format!("HMAC-SHA256 key: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

pub fn hmac_sha1(key: &[u8], parts: &[&[u8]]) -> Result<[u8; HASH_LEN]> {
    let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key)
        .map_err(|e| OtrError::InvalidKey(format!("HMAC-SHA1 key: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// AES-128-CTR keystream XOR. `iv` is the full initial counter block.
pub fn aes_ctr(key: &[u8], iv: &[u8; AES_BLOCK_LEN], data: &[u8]) -> Result<Vec<u8>> {
    let mut cipher = Aes128Ctr::new_from_slices(key, iv)
        .map_err(|_| OtrError::InvalidKey(format!("AES key must be {} bytes", AES_KEY_LEN)))?;
    let mut out = data.to_vec();
    cipher.apply_keystream(&mut out);
    Ok(out)
}

/// AES-128-CTR with an all-zero initial counter, used inside the AKE.
pub fn aes_ctr_zero_iv(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    aes_ctr(key, &[0u8; AES_BLOCK_LEN], data)
}

/// Data messages put the 8-byte top half counter in the high half of the IV.
pub fn counter_iv(top_half: &[u8; 8]) -> [u8; AES_BLOCK_LEN] {
    let mut iv = [0u8; AES_BLOCK_LEN];
    iv[..8].copy_from_slice(top_half);
    iv
}

pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        assert_eq!(
            hex::encode(sha1(b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_prefixed_hash_equals_concatenation() {
        assert_eq!(sha256_prefixed(0x01, b"secret"), sha256(b"\x01secret"));
        assert_eq!(sha1_prefixed(0x02, b"secret"), sha1(b"\x02secret"));
    }

    #[test]
    fn test_hmac_parts_are_concatenated() {
        let key = [7u8; 32];
        assert_eq!(
            hmac_sha256(&key, &[b"ab", b"cd"]).unwrap(),
            hmac_sha256(&key, &[b"abcd"]).unwrap()
        );
        assert_eq!(
            hmac_sha1(&key, &[b"a", b"bcd"]).unwrap(),
            hmac_sha1(&key, &[b"abcd"]).unwrap()
        );
    }

    #[test]
    fn test_aes_ctr_is_involutive() {
        let key = [3u8; 16];
        let iv = counter_iv(&[0, 0, 0, 0, 0, 0, 0, 1]);
        let plaintext = b"attack at dawn, bring snacks";
        let ciphertext = aes_ctr(&key, &iv, plaintext).unwrap();
        assert_ne!(&ciphertext[..], &plaintext[..]);
        assert_eq!(aes_ctr(&key, &iv, &ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn test_aes_ctr_rejects_wrong_key_length() {
        assert!(aes_ctr_zero_iv(&[0u8; 15], b"x").is_err());
    }

    #[test]
    fn test_counter_iv_layout() {
        let iv = counter_iv(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&iv[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&iv[8..], &[0u8; 8]);
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"ab"));
    }
}
