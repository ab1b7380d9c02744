//! Long-term identity keys.
//!
//! Public keys travel with a 2-byte type tag so other algorithms can be added
//! without changing the AKE wire format. DSA (tag 0x0000) is the only type
//! OTR v2/v3 define.

use crate::crypto::math::mod_inverse_prime;
use crate::crypto::primitives::sha1;
use crate::crypto::secure_memory::{wipe_biguint, Secret};
use crate::error::{OtrError, Result};
use crate::protocol::wire::{append_mpi, append_short, extract_mpi, extract_short};
use num_bigint::BigUint;
use num_traits::Zero;
use rand_core::RngCore;

pub const DSA_KEY_TYPE: u16 = 0x0000;

/// DSA signatures are r || s, each left-padded to this many bytes.
pub const DSA_SIGNATURE_HALF_LEN: usize = 20;
pub const DSA_SIGNATURE_LEN: usize = 2 * DSA_SIGNATURE_HALF_LEN;

const MAX_NONCE_ATTEMPTS: usize = 64;

/// The signing half of a long-term identity, supplied by the host.
pub trait PrivateKey: Send + Sync {
    fn public_key(&self) -> PublicKey;

    /// Signs an already hashed value. Randomness is drawn from `rng`.
    fn sign(&self, rng: &mut dyn RngCore, hashed: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    Dsa(DsaPublicKey),
}

impl PublicKey {
    pub fn key_type(&self) -> u16 {
        match self {
            PublicKey::Dsa(_) => DSA_KEY_TYPE,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            PublicKey::Dsa(k) => k.serialize(),
        }
    }

    /// Dispatches on the type tag. Unknown tags do not parse.
    pub fn parse(input: &[u8]) -> Option<(&[u8], PublicKey)> {
        let (_, tag) = extract_short(input)?;
        match tag {
            DSA_KEY_TYPE => {
                let (rest, key) = DsaPublicKey::parse(input)?;
                Some((rest, PublicKey::Dsa(key)))
            }
            _ => None,
        }
    }

    /// Verifies `sig` over `hashed`, returning whatever follows the signature.
    pub fn verify<'a>(&self, hashed: &[u8], sig: &'a [u8]) -> Option<&'a [u8]> {
        match self {
            PublicKey::Dsa(k) => k.verify(hashed, sig),
        }
    }

    pub fn fingerprint(&self) -> Vec<u8> {
        match self {
            PublicKey::Dsa(k) => k.fingerprint().to_vec(),
        }
    }

    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint())
    }

    pub fn is_same(&self, other: &PublicKey) -> bool {
        self == other
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsaPublicKey {
    pub p: BigUint,
    pub q: BigUint,
    pub g: BigUint,
    pub y: BigUint,
}

impl DsaPublicKey {
    pub fn serialize(&self) -> Vec<u8> {
        let out = append_short(Vec::new(), DSA_KEY_TYPE);
        let out = append_mpi(out, &self.p);
        let out = append_mpi(out, &self.q);
        let out = append_mpi(out, &self.g);
        append_mpi(out, &self.y)
    }

    pub fn parse(input: &[u8]) -> Option<(&[u8], DsaPublicKey)> {
        let (rest, tag) = extract_short(input)?;
        if tag != DSA_KEY_TYPE {
            return None;
        }
        let (rest, p) = extract_mpi(rest)?;
        let (rest, q) = extract_mpi(rest)?;
        let (rest, g) = extract_mpi(rest)?;
        let (rest, y) = extract_mpi(rest)?;
        if q.is_zero() || p.is_zero() || q.bits() > (DSA_SIGNATURE_HALF_LEN * 8) as u64 {
            return None;
        }
        Some((rest, DsaPublicKey { p, q, g, y }))
    }

    /// SHA-1 over the serialized key without its type tag.
    pub fn fingerprint(&self) -> [u8; 20] {
        let serialized = self.serialize();
        sha1(&serialized[2..])
    }

    pub fn verify<'a>(&self, hashed: &[u8], sig: &'a [u8]) -> Option<&'a [u8]> {
        if sig.len() < DSA_SIGNATURE_LEN {
            return None;
        }
        let r = BigUint::from_bytes_be(&sig[..DSA_SIGNATURE_HALF_LEN]);
        let s = BigUint::from_bytes_be(&sig[DSA_SIGNATURE_HALF_LEN..DSA_SIGNATURE_LEN]);
        if r.is_zero() || s.is_zero() || r >= self.q || s >= self.q {
            return None;
        }

        let z = BigUint::from_bytes_be(hashed);
        let w = mod_inverse_prime(&s, &self.q);
        let u1 = (&z * &w) % &self.q;
        let u2 = (&r * &w) % &self.q;
        let v = ((self.g.modpow(&u1, &self.p) * self.y.modpow(&u2, &self.p)) % &self.p) % &self.q;

        if v == r {
            Some(&sig[DSA_SIGNATURE_LEN..])
        } else {
            None
        }
    }
}

pub struct DsaPrivateKey {
    public: DsaPublicKey,
    x: Secret,
}

impl DsaPrivateKey {
    /// Parses the serialized public key followed by MPI x.
    pub fn parse(input: &[u8]) -> Result<(&[u8], DsaPrivateKey)> {
        let (rest, public) = DsaPublicKey::parse(input)
            .ok_or_else(|| OtrError::InvalidKey("corrupt DSA public key".into()))?;
        let (rest, x) =
            extract_mpi(rest).ok_or_else(|| OtrError::InvalidKey("corrupt DSA private key".into()))?;
        if x.is_zero() || x >= public.q {
            return Err(OtrError::InvalidKey("DSA private key out of range".into()));
        }
        Ok((rest, DsaPrivateKey { public, x: Secret::from_biguint(&x) }))
    }

    pub fn from_bytes(input: &[u8]) -> Result<DsaPrivateKey> {
        let (_, key) = DsaPrivateKey::parse(input)?;
        Ok(key)
    }

    pub fn serialize(&self) -> Vec<u8> {
        append_mpi(self.public.serialize(), &self.x.to_biguint())
    }

    pub fn dsa_public_key(&self) -> &DsaPublicKey {
        &self.public
    }

    fn random_nonce(&self, rng: &mut dyn RngCore) -> Result<BigUint> {
        let q = &self.public.q;
        let len = ((q.bits() + 7) / 8) as usize;
        let mut buf = vec![0u8; len];
        for _ in 0..MAX_NONCE_ATTEMPTS {
            rng.try_fill_bytes(&mut buf)?;
            let k = BigUint::from_bytes_be(&buf);
            if !k.is_zero() && &k < q {
                zeroize::Zeroize::zeroize(&mut buf);
                return Ok(k);
            }
        }
        Err(OtrError::ShortRandomRead)
    }

    fn sign_with(&self, rng: &mut dyn RngCore, x: &BigUint, z: &BigUint) -> Result<Vec<u8>> {
        let DsaPublicKey { p, q, g, .. } = &self.public;
        for _ in 0..MAX_NONCE_ATTEMPTS {
            let mut k = self.random_nonce(rng)?;
            let r = g.modpow(&k, p) % q;
            if r.is_zero() {
                wipe_biguint(&mut k);
                continue;
            }
            let mut k_inv = mod_inverse_prime(&k, q);
            wipe_biguint(&mut k);
            let s = (&k_inv * ((z + x * &r) % q)) % q;
            wipe_biguint(&mut k_inv);
            if s.is_zero() {
                continue;
            }

            let mut out = left_pad(&r, DSA_SIGNATURE_HALF_LEN)?;
            out.extend(left_pad(&s, DSA_SIGNATURE_HALF_LEN)?);
            return Ok(out);
        }

        Err(OtrError::ShortRandomRead)
    }
}

fn left_pad(value: &BigUint, len: usize) -> Result<Vec<u8>> {
    let bytes = value.to_bytes_be();
    if bytes.len() > len {
        return Err(OtrError::InvalidKey("DSA signature component too large".into()));
    }
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(&bytes);
    Ok(out)
}

impl PrivateKey for DsaPrivateKey {
    fn public_key(&self) -> PublicKey {
        PublicKey::Dsa(self.public.clone())
    }

    fn sign(&self, rng: &mut dyn RngCore, hashed: &[u8]) -> Result<Vec<u8>> {
        let z = BigUint::from_bytes_be(hashed);
        let mut x = self.x.to_biguint();
        let signed = self.sign_with(rng, &x, &z);
        wipe_biguint(&mut x);
        signed
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_private_key_roundtrips_through_serialization() {
        let raw = hex::decode(ALICE_PRIVATE_KEY_HEX).unwrap();
        let key = DsaPrivateKey::from_bytes(&raw).unwrap();
        assert_eq!(key.serialize(), raw);
        assert_eq!(key.dsa_public_key().q.bits(), 160);
    }

    #[test]
    fn test_sign_then_verify() {
        let key = alice_key();
        let mut rng = StdRng::seed_from_u64(7);
        let hashed = crate::crypto::primitives::sha256(b"message to sign");

        let sig = key.sign(&mut rng, &hashed).unwrap();
        assert_eq!(sig.len(), DSA_SIGNATURE_LEN);

        let mut with_trailer = sig.clone();
        with_trailer.extend_from_slice(b"rest");
        let rest = key.public_key().verify(&hashed, &with_trailer);
        assert_eq!(rest, Some(&b"rest"[..]));
    }

    #[test]
    fn test_verify_rejects_other_message_and_other_key() {
        let alice = alice_key();
        let bob = bob_key();
        let mut rng = StdRng::seed_from_u64(8);
        let hashed = crate::crypto::primitives::sha256(b"original");
        let sig = alice.sign(&mut rng, &hashed).unwrap();

        let other = crate::crypto::primitives::sha256(b"tampered");
        assert!(alice.public_key().verify(&other, &sig).is_none());
        assert!(bob.public_key().verify(&hashed, &sig).is_none());
        assert!(alice.public_key().verify(&hashed, &sig[..39]).is_none());
    }

    #[test]
    fn test_public_key_parse_dispatches_on_tag() {
        let public = alice_key().public_key();
        let mut serialized = public.serialize();
        serialized.extend_from_slice(&[0xAA]);

        let (rest, parsed) = PublicKey::parse(&serialized).unwrap();
        assert_eq!(rest, &[0xAA]);
        assert!(parsed.is_same(&public));
        assert_eq!(parsed.key_type(), DSA_KEY_TYPE);

        serialized[1] = 0x01;
        assert!(PublicKey::parse(&serialized).is_none());
    }

    #[test]
    fn test_fingerprint_skips_type_tag() {
        let public = alice_key().public_key();
        let serialized = public.serialize();
        assert_eq!(public.fingerprint(), sha1(&serialized[2..]).to_vec());
        assert_eq!(public.fingerprint_hex().len(), 40);
        assert_ne!(public.fingerprint(), bob_key().public_key().fingerprint());
    }

    #[test]
    fn test_sign_reports_exhausted_randomness() {
        struct Empty;
        impl RngCore for Empty {
            fn next_u32(&mut self) -> u32 {
                0
            }
            fn next_u64(&mut self) -> u64 {
                0
            }
            fn fill_bytes(&mut self, _dest: &mut [u8]) {}
            fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> std::result::Result<(), rand_core::Error> {
                Err(rand_core::Error::new("exhausted"))
            }
        }

        let err = alice_key().sign(&mut Empty, b"hash").unwrap_err();
        assert!(err.is_retryable());
    }
}
