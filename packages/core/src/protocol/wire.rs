// Wire primitives (OTR binary encoding)
// SHORT/INT are big-endian, DATA is a 4-byte length plus bytes,
// MPI is DATA over the minimal big-endian magnitude.

use num_bigint::BigUint;
use num_traits::Zero;

pub fn append_short(mut out: Vec<u8>, v: u16) -> Vec<u8> {
    out.extend_from_slice(&v.to_be_bytes());
    out
}

pub fn append_word(mut out: Vec<u8>, v: u32) -> Vec<u8> {
    out.extend_from_slice(&v.to_be_bytes());
    out
}

pub fn append_data(mut out: Vec<u8>, data: &[u8]) -> Vec<u8> {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// Minimal big-endian magnitude, empty for zero.
pub fn mpi_bytes(n: &BigUint) -> Vec<u8> {
    if n.is_zero() {
        Vec::new()
    } else {
        n.to_bytes_be()
    }
}

pub fn append_mpi(out: Vec<u8>, n: &BigUint) -> Vec<u8> {
    append_data(out, &mpi_bytes(n))
}

pub fn append_mpis(mut out: Vec<u8>, values: &[&BigUint]) -> Vec<u8> {
    for v in values {
        out = append_mpi(out, v);
    }
    out
}

pub fn extract_short(input: &[u8]) -> Option<(&[u8], u16)> {
    if input.len() < 2 {
        return None;
    }
    let v = u16::from_be_bytes([input[0], input[1]]);
    Some((&input[2..], v))
}

pub fn extract_word(input: &[u8]) -> Option<(&[u8], u32)> {
    if input.len() < 4 {
        return None;
    }
    let v = u32::from_be_bytes([input[0], input[1], input[2], input[3]]);
    Some((&input[4..], v))
}

pub fn extract_data(input: &[u8]) -> Option<(&[u8], &[u8])> {
    let (rest, len) = extract_word(input)?;
    let len = len as usize;
    if rest.len() < len {
        return None;
    }
    Some((&rest[len..], &rest[..len]))
}

pub fn extract_mpi(input: &[u8]) -> Option<(&[u8], BigUint)> {
    let (rest, bytes) = extract_data(input)?;
    Some((rest, BigUint::from_bytes_be(bytes)))
}

/// Reads a 4-byte count followed by that many MPIs.
pub fn extract_mpis(input: &[u8]) -> Option<(&[u8], Vec<BigUint>)> {
    let (mut rest, count) = extract_word(input)?;
    // Every MPI takes at least its 4-byte length prefix.
    if (count as usize).saturating_mul(4) > rest.len() {
        return None;
    }
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (r, v) = extract_mpi(rest)?;
        values.push(v);
        rest = r;
    }
    Some((rest, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_append_fixed_width() {
        assert_eq!(append_short(vec![], 0x0102), vec![0x01, 0x02]);
        assert_eq!(append_word(vec![0xFF], 0x01020304), vec![0xFF, 1, 2, 3, 4]);
    }

    #[test]
    fn test_mpi_encoding_is_minimal() {
        let n = BigUint::from(0x0100u32);
        assert_eq!(append_mpi(vec![], &n), vec![0, 0, 0, 2, 0x01, 0x00]);
        assert_eq!(append_mpi(vec![], &BigUint::zero()), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_extract_rejects_truncated_input() {
        assert!(extract_short(&[1]).is_none());
        assert!(extract_word(&[1, 2, 3]).is_none());
        assert!(extract_data(&[0, 0, 0, 5, 1, 2]).is_none());
        assert!(extract_mpi(&[0, 0]).is_none());
    }

    #[test]
    fn test_extract_mpis_rejects_absurd_count() {
        let data = append_word(vec![], u32::MAX);
        assert!(extract_mpis(&data).is_none());
    }

    #[test]
    fn test_extract_mpis_reads_count_then_values() {
        let a = BigUint::from(7u32);
        let b = BigUint::from(1u64 << 40);
        let data = append_mpis(append_word(vec![], 2), &[&a, &b]);
        let (rest, values) = extract_mpis(&data).unwrap();
        assert!(rest.is_empty());
        assert_eq!(values, vec![a, b]);
    }

    proptest! {
        #[test]
        fn prop_data_leaves_trailing_bytes(payload in proptest::collection::vec(any::<u8>(), 0..64),
                                           trailer in proptest::collection::vec(any::<u8>(), 0..16)) {
            let mut encoded = append_data(vec![], &payload);
            encoded.extend_from_slice(&trailer);
            let (rest, data) = extract_data(&encoded).unwrap();
            prop_assert_eq!(data, &payload[..]);
            prop_assert_eq!(rest, &trailer[..]);
        }

        #[test]
        fn prop_mpi_preserves_value(bytes in proptest::collection::vec(any::<u8>(), 0..200)) {
            let n = BigUint::from_bytes_be(&bytes);
            let encoded = append_mpi(vec![], &n);
            let (rest, decoded) = extract_mpi(&encoded).unwrap();
            prop_assert!(rest.is_empty());
            prop_assert_eq!(decoded, n);
        }
    }
}
