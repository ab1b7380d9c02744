// Бинарные сообщения протокола: AKE (DH-Commit, DH-Key, Reveal-Sig, Sig)
// и Data message. Заголовок версии добавляется отдельно (см. version.rs).

use crate::crypto::primitives::{ct_eq, hmac_sha1, HASH_LEN, TRUNCATED_MAC_LEN};
use crate::error::{OtrError, Result};
use crate::protocol::wire::{append_data, append_mpi, append_word, extract_data, extract_mpi, extract_word};
use num_bigint::BigUint;

pub const MSG_TYPE_DH_COMMIT: u8 = 0x02;
pub const MSG_TYPE_DATA: u8 = 0x03;
pub const MSG_TYPE_DH_KEY: u8 = 0x0A;
pub const MSG_TYPE_REVEAL_SIG: u8 = 0x11;
pub const MSG_TYPE_SIG: u8 = 0x12;

pub const MESSAGE_FLAG_NORMAL: u8 = 0x00;
pub const MESSAGE_FLAG_IGNORE_UNREADABLE: u8 = 0x01;

pub const REVEAL_KEY_LEN: usize = 16;
pub const MAC_KEY_LEN: usize = HASH_LEN;

pub type MacKey = [u8; MAC_KEY_LEN];

/// DH-Commit: AES(r, MPI(gx)) and SHA-256(MPI(gx)).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhCommit {
    pub encrypted_gx: Vec<u8>,
    pub hashed_gx: Vec<u8>,
}

impl DhCommit {
    pub fn serialize(&self) -> Vec<u8> {
        let out = append_data(Vec::new(), &self.encrypted_gx);
        append_data(out, &self.hashed_gx)
    }

    pub fn deserialize(msg: &[u8]) -> Result<DhCommit> {
        let (rest, encrypted_gx) =
            extract_data(msg).ok_or_else(|| OtrError::malformed("corrupt DH commit message"))?;
        let (_, hashed_gx) =
            extract_data(rest).ok_or_else(|| OtrError::malformed("corrupt DH commit message"))?;
        Ok(DhCommit {
            encrypted_gx: encrypted_gx.to_vec(),
            hashed_gx: hashed_gx.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhKey {
    pub gy: BigUint,
}

impl DhKey {
    pub fn serialize(&self) -> Vec<u8> {
        append_mpi(Vec::new(), &self.gy)
    }

    pub fn deserialize(msg: &[u8]) -> Result<DhKey> {
        let (_, gy) = extract_mpi(msg).ok_or_else(|| OtrError::malformed("corrupt DH key message"))?;
        Ok(DhKey { gy })
    }
}

/// Reveal-Signature: the commitment key r, the encrypted signature and
/// its truncated MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealSig {
    pub r: [u8; REVEAL_KEY_LEN],
    pub encrypted_sig: Vec<u8>,
    pub mac: Vec<u8>,
}

impl RevealSig {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = append_data(Vec::new(), &self.r);
        out = append_data(out, &self.encrypted_sig);
        out.extend_from_slice(&self.mac[..TRUNCATED_MAC_LEN.min(self.mac.len())]);
        out
    }

    pub fn deserialize(msg: &[u8]) -> Result<RevealSig> {
        let corrupt = || OtrError::malformed("corrupt reveal signature message");
        let (rest, r) = extract_data(msg).ok_or_else(corrupt)?;
        let (mac, encrypted_sig) = extract_data(rest).ok_or_else(corrupt)?;
        if r.len() != REVEAL_KEY_LEN || mac.len() != TRUNCATED_MAC_LEN {
            return Err(corrupt());
        }
        let mut key = [0u8; REVEAL_KEY_LEN];
        key.copy_from_slice(r);
        Ok(RevealSig {
            r: key,
            encrypted_sig: encrypted_sig.to_vec(),
            mac: mac.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sig {
    pub encrypted_sig: Vec<u8>,
    pub mac: Vec<u8>,
}

impl Sig {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = append_data(Vec::new(), &self.encrypted_sig);
        out.extend_from_slice(&self.mac[..TRUNCATED_MAC_LEN.min(self.mac.len())]);
        out
    }

    pub fn deserialize(msg: &[u8]) -> Result<Sig> {
        let corrupt = || OtrError::malformed("corrupt signature message");
        let (mac, encrypted_sig) = extract_data(msg).ok_or_else(corrupt)?;
        if mac.len() != TRUNCATED_MAC_LEN {
            return Err(corrupt());
        }
        Ok(Sig {
            encrypted_sig: encrypted_sig.to_vec(),
            mac: mac.to_vec(),
        })
    }
}

/// Encrypted data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub flag: u8,
    pub sender_key_id: u32,
    pub recipient_key_id: u32,
    /// Sender's next DH public value.
    pub y: BigUint,
    pub top_half_ctr: [u8; 8],
    pub encrypted_msg: Vec<u8>,
    pub authenticator: Vec<u8>,
    pub old_mac_keys: Vec<MacKey>,
}

impl DataMessage {
    pub fn counter(&self) -> u64 {
        u64::from_be_bytes(self.top_half_ctr)
    }

    /// Everything the authenticator covers, minus the version header.
    pub fn serialize_unsigned(&self) -> Vec<u8> {
        let mut out = vec![self.flag];
        out = append_word(out, self.sender_key_id);
        out = append_word(out, self.recipient_key_id);
        out = append_mpi(out, &self.y);
        out.extend_from_slice(&self.top_half_ctr);
        append_data(out, &self.encrypted_msg)
    }

    pub fn sign(&mut self, mac_key: &[u8], header: &[u8]) -> Result<()> {
        let unsigned = self.serialize_unsigned();
        self.authenticator = hmac_sha1(mac_key, &[header, &unsigned])?.to_vec();
        Ok(())
    }

    /// Verifies the authenticator over the exact bytes that were received.
    pub fn check_sign(&self, mac_key: &[u8], header: &[u8], unsigned: &[u8]) -> Result<()> {
        let expected = hmac_sha1(mac_key, &[header, unsigned])?;
        if !ct_eq(&expected, &self.authenticator) {
            return Err(OtrError::conflict("bad signature MAC in data message"));
        }
        Ok(())
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.serialize_unsigned();
        out.extend_from_slice(&self.authenticator);
        let revealed: Vec<u8> = self.old_mac_keys.iter().flat_map(|k| k.iter().copied()).collect();
        append_data(out, &revealed)
    }

    /// Parses a data message body; also returns the unsigned prefix as received.
    pub fn deserialize(msg: &[u8]) -> Result<(DataMessage, &[u8])> {
        if msg.is_empty() {
            return Err(OtrError::malformed("empty data message"));
        }
        let flag = msg[0];
        let rest = &msg[1..];

        let (rest, sender_key_id) =
            extract_word(rest).ok_or_else(|| OtrError::malformed("corrupted sender key id"))?;
        let (rest, recipient_key_id) =
            extract_word(rest).ok_or_else(|| OtrError::malformed("corrupted recipient key id"))?;
        let (rest, y) = extract_mpi(rest).ok_or_else(|| OtrError::malformed("corrupted DH value"))?;

        if rest.len() < 8 {
            return Err(OtrError::malformed("corrupted counter"));
        }
        let mut top_half_ctr = [0u8; 8];
        top_half_ctr.copy_from_slice(&rest[..8]);
        if u64::from_be_bytes(top_half_ctr) == 0 {
            return Err(OtrError::malformed("invalid zero counter"));
        }

        let (rest, encrypted_msg) =
            extract_data(&rest[8..]).ok_or_else(|| OtrError::malformed("corrupted encrypted message"))?;
        let unsigned = &msg[..msg.len() - rest.len()];

        if rest.len() < HASH_LEN {
            return Err(OtrError::malformed("corrupted authenticator"));
        }
        let authenticator = rest[..HASH_LEN].to_vec();

        let (_, revealed) = extract_data(&rest[HASH_LEN..])
            .ok_or_else(|| OtrError::malformed("corrupted revealed MAC keys"))?;
        if revealed.len() % MAC_KEY_LEN != 0 {
            return Err(OtrError::malformed("corrupted revealed MAC keys"));
        }
        let old_mac_keys = revealed
            .chunks_exact(MAC_KEY_LEN)
            .map(|chunk| {
                let mut k = [0u8; MAC_KEY_LEN];
                k.copy_from_slice(chunk);
                k
            })
            .collect();

        Ok((
            DataMessage {
                flag,
                sender_key_id,
                recipient_key_id,
                y,
                top_half_ctr,
                encrypted_msg: encrypted_msg.to_vec(),
                authenticator,
                old_mac_keys,
            },
            unsigned,
        ))
    }
}

/// Flag byte of a data message body; empty bodies count as normal.
pub fn extract_data_message_flag(msg: &[u8]) -> u8 {
    msg.first().copied().unwrap_or(MESSAGE_FLAG_NORMAL)
}
