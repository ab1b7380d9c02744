//! Protocol versions and their per-version framing rules.

use crate::api::policy::Policies;
use crate::error::{OtrError, Result};
use crate::protocol::wire::{append_short, append_word, extract_short, extract_word};

/// Smallest instance tag a client may pick; lower values are reserved.
pub const MIN_VALID_INSTANCE_TAG: u32 = 0x100;

pub const V2_HEADER_LEN: usize = 3;
pub const V3_HEADER_LEN: usize = 11;

/// Offset of the message type byte, shared by both versions.
pub const MESSAGE_TYPE_OFFSET: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V2,
    V3,
}

/// Result of checking the instance tags of an incoming v3 message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceCheck {
    Ok,
    /// Well-formed, but meant for another session of the same peers.
    OtherInstance,
    Malformed,
}

impl Version {
    pub fn from_number(n: u16) -> Result<Version> {
        match n {
            2 => Ok(Version::V2),
            3 => Ok(Version::V3),
            _ => Err(OtrError::UnsupportedVersion),
        }
    }

    /// Resolves a version number and checks the policy allows it.
    pub fn allowed(n: u16, policies: Policies) -> Result<Version> {
        let v = Version::from_number(n)?;
        if !policies.has(v.policy()) {
            return Err(OtrError::InvalidVersion);
        }
        Ok(v)
    }

    /// Highest version both the policy and the peer's advertised bitmask allow.
    pub fn negotiate(advertised: u32, policies: Policies) -> Result<Version> {
        if policies.has(Policies::ALLOW_V3) && advertised & (1 << 3) != 0 {
            Ok(Version::V3)
        } else if policies.has(Policies::ALLOW_V2) && advertised & (1 << 2) != 0 {
            Ok(Version::V2)
        } else {
            Err(OtrError::UnsupportedVersion)
        }
    }

    pub fn number(&self) -> u16 {
        match self {
            Version::V2 => 2,
            Version::V3 => 3,
        }
    }

    pub fn policy(&self) -> Policies {
        match self {
            Version::V2 => Policies::ALLOW_V2,
            Version::V3 => Policies::ALLOW_V3,
        }
    }

    pub fn header_len(&self) -> usize {
        match self {
            Version::V2 => V2_HEADER_LEN,
            Version::V3 => V3_HEADER_LEN,
        }
    }

    pub fn has_instance_tags(&self) -> bool {
        matches!(self, Version::V3)
    }

    pub fn message_header(&self, msg_type: u8, our_tag: u32, their_tag: u32) -> Vec<u8> {
        let mut out = append_short(Vec::with_capacity(self.header_len()), self.number());
        out.push(msg_type);
        if self.has_instance_tags() {
            out = append_word(out, our_tag);
            out = append_word(out, their_tag);
        }
        out
    }

    /// Splits a decoded message into (header, body) and returns the tags it
    /// carries as (sender, receiver). v2 messages carry no tags.
    pub fn split_header<'a>(&self, msg: &'a [u8]) -> Result<(&'a [u8], &'a [u8], Option<(u32, u32)>)> {
        let len = self.header_len();
        if msg.len() < len {
            return Err(OtrError::malformed("message shorter than its header"));
        }
        let (header, body) = msg.split_at(len);
        if !self.has_instance_tags() {
            return Ok((header, body, None));
        }
        let (rest, sender) = extract_word(&header[V2_HEADER_LEN..])
            .ok_or_else(|| OtrError::malformed("missing sender instance tag"))?;
        let (_, receiver) =
            extract_word(rest).ok_or_else(|| OtrError::malformed("missing receiver instance tag"))?;
        Ok((header, body, Some((sender, receiver))))
    }

    pub fn whitespace_tag(&self) -> &'static str {
        match self {
            Version::V2 => super::envelope::WHITESPACE_TAG_V2,
            Version::V3 => super::envelope::WHITESPACE_TAG_V3,
        }
    }
}

/// Reads the protocol version from the first two bytes of a decoded message.
pub fn message_version(msg: &[u8]) -> Result<u16> {
    extract_short(msg)
        .map(|(_, v)| v)
        .ok_or_else(|| OtrError::malformed("message too short for a version"))
}

/// Instance tag rules: tags below 0x100 are malformed (receiver 0 means
/// "any instance"), a sender we have not seen yet is adopted, and anything not
/// addressed to us is for another instance.
pub fn check_instance_tags(
    our_tag: u32,
    their_tag: &mut u32,
    sender: u32,
    receiver: u32,
) -> InstanceCheck {
    if *their_tag == 0 {
        *their_tag = sender;
    }
    if receiver > 0 && receiver < MIN_VALID_INSTANCE_TAG {
        return InstanceCheck::Malformed;
    }
    if sender < MIN_VALID_INSTANCE_TAG {
        return InstanceCheck::Malformed;
    }
    if (receiver != 0 && receiver != our_tag) || *their_tag != sender {
        return InstanceCheck::OtherInstance;
    }
    InstanceCheck::Ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_prefers_v3() {
        let both = (1 << 2) | (1 << 3);
        assert_eq!(Version::negotiate(both, Policies::default_policy()).unwrap(), Version::V3);
        assert_eq!(Version::negotiate(1 << 2, Policies::default_policy()).unwrap(), Version::V2);
        assert_eq!(Version::negotiate(both, Policies::ALLOW_V2).unwrap(), Version::V2);
        assert_eq!(
            Version::negotiate(1 << 2, Policies::otr_v3()),
            Err(OtrError::UnsupportedVersion)
        );
    }

    #[test]
    fn test_allowed_checks_policy() {
        assert_eq!(Version::allowed(3, Policies::otr_v3()).unwrap(), Version::V3);
        assert_eq!(Version::allowed(2, Policies::otr_v3()), Err(OtrError::InvalidVersion));
        assert_eq!(Version::allowed(1, Policies::always()), Err(OtrError::UnsupportedVersion));
    }

    #[test]
    fn test_v3_header_layout() {
        let header = Version::V3.message_header(0x03, 0x0000_0101, 0x0000_0102);
        assert_eq!(header, vec![0, 3, 3, 0, 0, 1, 1, 0, 0, 1, 2]);

        let mut msg = header.clone();
        msg.extend_from_slice(b"body");
        let (h, body, tags) = Version::V3.split_header(&msg).unwrap();
        assert_eq!(h, &header[..]);
        assert_eq!(body, b"body");
        assert_eq!(tags, Some((0x101, 0x102)));
    }

    #[test]
    fn test_v2_header_has_no_tags() {
        let header = Version::V2.message_header(0x02, 0x101, 0x102);
        assert_eq!(header, vec![0, 2, 2]);
        let (_, body, tags) = Version::V2.split_header(&[0, 2, 2, 9]).unwrap();
        assert_eq!(body, &[9]);
        assert!(tags.is_none());
    }

    #[test]
    fn test_split_header_rejects_short_message() {
        assert!(Version::V3.split_header(&[0, 3, 3, 0]).is_err());
    }

    #[test]
    fn test_instance_tag_rules() {
        let mut theirs = 0;
        assert_eq!(check_instance_tags(0x200, &mut theirs, 0x300, 0), InstanceCheck::Ok);
        assert_eq!(theirs, 0x300);

        assert_eq!(check_instance_tags(0x200, &mut theirs, 0x300, 0x200), InstanceCheck::Ok);
        assert_eq!(
            check_instance_tags(0x200, &mut theirs, 0x300, 0x999),
            InstanceCheck::OtherInstance
        );
        assert_eq!(
            check_instance_tags(0x200, &mut theirs, 0x301, 0x200),
            InstanceCheck::OtherInstance
        );
        assert_eq!(check_instance_tags(0x200, &mut theirs, 0x300, 0x50), InstanceCheck::Malformed);
        assert_eq!(check_instance_tags(0x200, &mut theirs, 0x99, 0x200), InstanceCheck::Malformed);
    }
}
