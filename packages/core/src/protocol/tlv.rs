// TLV записи внутри расшифрованного data message и SMP сообщения поверх них.
//
// Plaintext: message || 0x00 || TLV*
// TLV:       SHORT type || SHORT length || value

use crate::error::{OtrError, Result};
use crate::protocol::wire::{append_mpis, append_short, append_word, extract_mpis, extract_short};
use num_bigint::BigUint;

pub const TLV_HEADER_LEN: usize = 4;

pub const TLV_TYPE_PADDING: u16 = 0x00;
pub const TLV_TYPE_DISCONNECTED: u16 = 0x01;
pub const TLV_TYPE_SMP1: u16 = 0x02;
pub const TLV_TYPE_SMP2: u16 = 0x03;
pub const TLV_TYPE_SMP3: u16 = 0x04;
pub const TLV_TYPE_SMP4: u16 = 0x05;
pub const TLV_TYPE_SMP_ABORT: u16 = 0x06;
pub const TLV_TYPE_SMP1_WITH_QUESTION: u16 = 0x07;
pub const TLV_TYPE_EXTRA_SYMMETRIC_KEY: u16 = 0x08;

const PADDING_GRANULARITY: usize = 256;
const NUL_BYTE_LEN: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tlv_type: u16,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(tlv_type: u16, value: Vec<u8>) -> Self {
        Self { tlv_type, value }
    }

    pub fn disconnected() -> Self {
        Self::new(TLV_TYPE_DISCONNECTED, Vec::new())
    }

    pub fn smp_abort() -> Self {
        Self::new(TLV_TYPE_SMP_ABORT, Vec::new())
    }

    /// 4-byte usage tag followed by usage-specific data.
    pub fn extra_symmetric_key(usage: u32, usage_data: &[u8]) -> Self {
        let mut value = append_word(Vec::new(), usage);
        value.extend_from_slice(usage_data);
        Self::new(TLV_TYPE_EXTRA_SYMMETRIC_KEY, value)
    }

    pub fn is_smp_message(&self) -> bool {
        (TLV_TYPE_SMP1..=TLV_TYPE_SMP1_WITH_QUESTION).contains(&self.tlv_type)
    }

    pub fn append_to(&self, out: Vec<u8>) -> Vec<u8> {
        let mut out = append_short(out, self.tlv_type);
        out = append_short(out, self.value.len() as u16);
        out.extend_from_slice(&self.value);
        out
    }

    /// Reads one TLV; a length running past the input is an error.
    pub fn extract(input: &[u8]) -> Result<(&[u8], Tlv)> {
        let (rest, tlv_type) = extract_short(input).ok_or_else(|| OtrError::malformed("wrong tlv type"))?;
        let (rest, len) = extract_short(rest).ok_or_else(|| OtrError::malformed("wrong tlv length"))?;
        let len = len as usize;
        if rest.len() < len {
            return Err(OtrError::malformed("wrong tlv value"));
        }
        Ok((&rest[len..], Tlv::new(tlv_type, rest[..len].to_vec())))
    }
}

/// Decrypted payload of a data message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Plaintext {
    pub message: Vec<u8>,
    pub tlvs: Vec<Tlv>,
}

impl Plaintext {
    pub fn new(message: &[u8], tlvs: Vec<Tlv>) -> Self {
        Self {
            message: message.to_vec(),
            tlvs,
        }
    }

    /// Appends the padding TLV so that the padded body lines up on 256 bytes.
    pub fn pad(mut self) -> Self {
        let padding =
            PADDING_GRANULARITY - ((self.message.len() + TLV_HEADER_LEN + NUL_BYTE_LEN) % PADDING_GRANULARITY);
        self.tlvs.push(Tlv::new(TLV_TYPE_PADDING, vec![0u8; padding]));
        self
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.message.clone();
        out.push(0x00);
        self.tlvs.iter().fold(out, |acc, t| t.append_to(acc))
    }

    /// Splits at the first NUL. Unknown TLV types are kept for the caller to skip.
    pub fn deserialize(msg: &[u8]) -> Result<Plaintext> {
        let (message, mut rest) = match msg.iter().position(|&b| b == 0x00) {
            Some(nul) => (&msg[..nul], &msg[nul + 1..]),
            None => (msg, &[][..]),
        };

        let mut tlvs = Vec::new();
        while !rest.is_empty() {
            let (r, t) = Tlv::extract(rest)?;
            tlvs.push(t);
            rest = r;
        }
        Ok(Plaintext {
            message: message.to_vec(),
            tlvs,
        })
    }
}

// ============================================
// SMP сообщения
// ============================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmpMessage1 {
    pub g2a: BigUint,
    pub c2: BigUint,
    pub d2: BigUint,
    pub g3a: BigUint,
    pub c3: BigUint,
    pub d3: BigUint,
    pub question: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmpMessage2 {
    pub g2b: BigUint,
    pub c2: BigUint,
    pub d2: BigUint,
    pub g3b: BigUint,
    pub c3: BigUint,
    pub d3: BigUint,
    pub pb: BigUint,
    pub qb: BigUint,
    pub cp: BigUint,
    pub d5: BigUint,
    pub d6: BigUint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmpMessage3 {
    pub pa: BigUint,
    pub qa: BigUint,
    pub cp: BigUint,
    pub d5: BigUint,
    pub d6: BigUint,
    pub ra: BigUint,
    pub cr: BigUint,
    pub d7: BigUint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmpMessage4 {
    pub rb: BigUint,
    pub cr: BigUint,
    pub d7: BigUint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmpMessage {
    One(SmpMessage1),
    Two(SmpMessage2),
    Three(SmpMessage3),
    Four(SmpMessage4),
    Abort,
}

fn smp_tlv(tlv_type: u16, prefix: Vec<u8>, values: &[&BigUint]) -> Tlv {
    let value = append_mpis(append_word(prefix, values.len() as u32), values);
    Tlv::new(tlv_type, value)
}

fn smp_values(value: &[u8], expected: usize) -> Result<Vec<BigUint>> {
    match extract_mpis(value) {
        Some((_, mpis)) if mpis.len() >= expected => Ok(mpis),
        _ => Err(OtrError::malformed("corrupt SMP message")),
    }
}

impl SmpMessage {
    pub fn to_tlv(&self) -> Tlv {
        match self {
            SmpMessage::One(m) => {
                let values = [&m.g2a, &m.c2, &m.d2, &m.g3a, &m.c3, &m.d3];
                match &m.question {
                    Some(q) => {
                        let mut prefix = q.as_bytes().to_vec();
                        prefix.push(0x00);
                        smp_tlv(TLV_TYPE_SMP1_WITH_QUESTION, prefix, &values)
                    }
                    None => smp_tlv(TLV_TYPE_SMP1, Vec::new(), &values),
                }
            }
            SmpMessage::Two(m) => smp_tlv(
                TLV_TYPE_SMP2,
                Vec::new(),
                &[&m.g2b, &m.c2, &m.d2, &m.g3b, &m.c3, &m.d3, &m.pb, &m.qb, &m.cp, &m.d5, &m.d6],
            ),
            SmpMessage::Three(m) => smp_tlv(
                TLV_TYPE_SMP3,
                Vec::new(),
                &[&m.pa, &m.qa, &m.cp, &m.d5, &m.d6, &m.ra, &m.cr, &m.d7],
            ),
            SmpMessage::Four(m) => smp_tlv(TLV_TYPE_SMP4, Vec::new(), &[&m.rb, &m.cr, &m.d7]),
            SmpMessage::Abort => Tlv::smp_abort(),
        }
    }

    pub fn from_tlv(t: &Tlv) -> Result<SmpMessage> {
        match t.tlv_type {
            TLV_TYPE_SMP1 => Ok(SmpMessage::One(parse_smp1(&t.value, None)?)),
            TLV_TYPE_SMP1_WITH_QUESTION => {
                let nul = t
                    .value
                    .iter()
                    .position(|&b| b == 0x00)
                    .ok_or_else(|| OtrError::malformed("corrupt SMP question"))?;
                let question = String::from_utf8_lossy(&t.value[..nul]).into_owned();
                Ok(SmpMessage::One(parse_smp1(&t.value[nul + 1..], Some(question))?))
            }
            TLV_TYPE_SMP2 => {
                let mut v = smp_values(&t.value, 11)?.into_iter();
                let mut next = || v.next().unwrap_or_default();
                Ok(SmpMessage::Two(SmpMessage2 {
                    g2b: next(),
                    c2: next(),
                    d2: next(),
                    g3b: next(),
                    c3: next(),
                    d3: next(),
                    pb: next(),
                    qb: next(),
                    cp: next(),
                    d5: next(),
                    d6: next(),
                }))
            }
            TLV_TYPE_SMP3 => {
                let mut v = smp_values(&t.value, 8)?.into_iter();
                let mut next = || v.next().unwrap_or_default();
                Ok(SmpMessage::Three(SmpMessage3 {
                    pa: next(),
                    qa: next(),
                    cp: next(),
                    d5: next(),
                    d6: next(),
                    ra: next(),
                    cr: next(),
                    d7: next(),
                }))
            }
            TLV_TYPE_SMP4 => {
                let mut v = smp_values(&t.value, 3)?.into_iter();
                let mut next = || v.next().unwrap_or_default();
                Ok(SmpMessage::Four(SmpMessage4 {
                    rb: next(),
                    cr: next(),
                    d7: next(),
                }))
            }
            TLV_TYPE_SMP_ABORT => Ok(SmpMessage::Abort),
            other => Err(OtrError::malformed(format!("TLV type {} is not an SMP message", other))),
        }
    }
}

fn parse_smp1(value: &[u8], question: Option<String>) -> Result<SmpMessage1> {
    let mut v = smp_values(value, 6)?.into_iter();
    let mut next = || v.next().unwrap_or_default();
    Ok(SmpMessage1 {
        g2a: next(),
        c2: next(),
        d2: next(),
        g3a: next(),
        c3: next(),
        d3: next(),
        question,
    })
}
