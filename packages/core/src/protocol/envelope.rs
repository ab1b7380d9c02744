// Текстовые конверты OTR: query, error, encoded, whitespace tag
// и определение типа входящего сообщения.

use crate::api::policy::Policies;
use crate::error::{OtrError, Result};
use crate::protocol::messages::{
    MSG_TYPE_DATA, MSG_TYPE_DH_COMMIT, MSG_TYPE_DH_KEY, MSG_TYPE_REVEAL_SIG, MSG_TYPE_SIG,
};
use crate::utils::b64;

pub const QUERY_MARKER: &str = "?OTR";
pub const ERROR_MARKER: &str = "?OTR Error:";
pub const ENCODED_MARKER: &str = "?OTR:";
pub const V2_FRAGMENT_PREFIX: &str = "?OTR,";
pub const V3_FRAGMENT_PREFIX: &str = "?OTR|";

/// "OT" in space/tab binary.
pub const WHITESPACE_TAG_BASE: &str = " \t  \t\t\t\t \t \t \t  ";
/// "2"
pub const WHITESPACE_TAG_V2: &str = "  \t\t  \t ";
/// "3"
pub const WHITESPACE_TAG_V3: &str = "  \t\t  \t\t";

const WHITESPACE_TAG_UNIT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageGuess {
    Error,
    Query,
    TaggedPlaintext,
    NotOtr,
    V1KeyExchange,
    Fragment,
    DhCommit,
    DhKey,
    RevealSig,
    Sig,
    Data,
    Unknown,
}

pub fn guess_message_type(msg: &[u8]) -> MessageGuess {
    if msg.starts_with(ERROR_MARKER.as_bytes()) {
        return MessageGuess::Error;
    }
    if msg.starts_with(V2_FRAGMENT_PREFIX.as_bytes()) || msg.starts_with(V3_FRAGMENT_PREFIX.as_bytes()) {
        return MessageGuess::Fragment;
    }
    if msg.starts_with(b"?OTR?") || msg.starts_with(b"?OTRv") {
        return MessageGuess::Query;
    }
    if msg.starts_with(ENCODED_MARKER.as_bytes()) {
        return guess_encoded(&msg[ENCODED_MARKER.len()..]);
    }
    if msg.starts_with(QUERY_MARKER.as_bytes()) {
        return MessageGuess::Unknown;
    }
    if find(msg, WHITESPACE_TAG_BASE.as_bytes()).is_some() {
        return MessageGuess::TaggedPlaintext;
    }
    MessageGuess::NotOtr
}

// The first four base64 characters encode version (2 bytes) and type (1 byte).
fn guess_encoded(b64: &[u8]) -> MessageGuess {
    if b64.len() < 4 {
        return MessageGuess::Unknown;
    }
    if &b64[..4] == b"AAEK" {
        return MessageGuess::V1KeyExchange;
    }
    match b64[3] {
        b'C' => MessageGuess::DhCommit,
        b'K' => MessageGuess::DhKey,
        b'R' => MessageGuess::RevealSig,
        b'S' => MessageGuess::Sig,
        b'D' => MessageGuess::Data,
        _ => MessageGuess::Unknown,
    }
}

/// Message type byte for an encoded guess.
pub fn guess_to_message_type(guess: MessageGuess) -> Option<u8> {
    match guess {
        MessageGuess::DhCommit => Some(MSG_TYPE_DH_COMMIT),
        MessageGuess::DhKey => Some(MSG_TYPE_DH_KEY),
        MessageGuess::RevealSig => Some(MSG_TYPE_REVEAL_SIG),
        MessageGuess::Sig => Some(MSG_TYPE_SIG),
        MessageGuess::Data => Some(MSG_TYPE_DATA),
        _ => None,
    }
}

/// `?OTR:` + base64 + `.`
pub fn encode(msg: &[u8]) -> Vec<u8> {
    let mut out = ENCODED_MARKER.as_bytes().to_vec();
    out.extend_from_slice(b64::encode(msg).as_bytes());
    out.push(b'.');
    out
}

pub fn decode(encoded: &[u8]) -> Result<Vec<u8>> {
    let body = encoded
        .strip_prefix(ENCODED_MARKER.as_bytes())
        .ok_or_else(|| OtrError::malformed("missing OTR envelope"))?;
    let end = body
        .iter()
        .position(|&b| b == b'.')
        .ok_or_else(|| OtrError::malformed("unterminated OTR envelope"))?;
    b64::decode(&body[..end])
}

/// Builds `?OTRv23?` for the allowed versions, plus optional friendly text.
pub fn query_message(policies: Policies, friendly: Option<&str>) -> Vec<u8> {
    let mut out = String::from("?OTRv");
    if policies.has(Policies::ALLOW_V2) {
        out.push('2');
    }
    if policies.has(Policies::ALLOW_V3) {
        out.push('3');
    }
    out.push('?');
    if let Some(text) = friendly {
        out.push(' ');
        out.push_str(text);
    }
    out.into_bytes()
}

/// Versions advertised by a query message, in the order they appear.
/// Both `?OTR?` (v1) and `?OTRv..?` forms are understood.
pub fn parse_query(msg: &[u8]) -> Vec<u32> {
    let mut versions = Vec::new();
    let mut rest = match msg.strip_prefix(QUERY_MARKER.as_bytes()) {
        Some(r) => r,
        None => return versions,
    };

    if let Some(r) = rest.strip_prefix(b"?") {
        versions.push(1);
        rest = r;
    }

    if let Some(r) = rest.strip_prefix(b"v") {
        for &c in r {
            if c == b'?' {
                break;
            }
            if c.is_ascii_digit() {
                versions.push(u32::from(c - b'0'));
            }
        }
    }
    versions
}

/// Bitmask (1 << version) of the advertised versions the policy accepts.
pub fn accepted_query_versions(policies: Policies, msg: &[u8]) -> u32 {
    parse_query(msg).into_iter().fold(0, |acc, v| match v {
        2 if policies.has(Policies::ALLOW_V2) => acc | (1 << 2),
        3 if policies.has(Policies::ALLOW_V3) => acc | (1 << 3),
        _ => acc,
    })
}

pub fn whitespace_tag(policies: Policies) -> String {
    let mut tag = String::from(WHITESPACE_TAG_BASE);
    if policies.has(Policies::ALLOW_V2) {
        tag.push_str(WHITESPACE_TAG_V2);
    }
    if policies.has(Policies::ALLOW_V3) {
        tag.push_str(WHITESPACE_TAG_V3);
    }
    tag
}

/// Removes the tag from a plaintext and returns the advertised version bitmask.
pub fn extract_whitespace_tag(msg: &[u8]) -> (Vec<u8>, u32) {
    let base = WHITESPACE_TAG_BASE.as_bytes();
    let pos = match find(msg, base) {
        Some(p) => p,
        None => return (msg.to_vec(), 0),
    };

    let mut versions = 0u32;
    let mut rest = &msg[pos + base.len()..];
    while rest.len() >= WHITESPACE_TAG_UNIT
        && rest[..WHITESPACE_TAG_UNIT].iter().all(|&b| b == b' ' || b == b'\t')
    {
        let unit = &rest[..WHITESPACE_TAG_UNIT];
        if unit == WHITESPACE_TAG_V3.as_bytes() {
            versions |= 1 << 3;
        } else if unit == WHITESPACE_TAG_V2.as_bytes() {
            versions |= 1 << 2;
        }
        rest = &rest[WHITESPACE_TAG_UNIT..];
    }

    let mut plain = msg[..pos].to_vec();
    plain.extend_from_slice(rest);
    (plain, versions)
}

/// `?OTR Error: ` + text
pub fn error_message(text: &[u8]) -> Vec<u8> {
    let mut out = ERROR_MARKER.as_bytes().to_vec();
    out.push(b' ');
    out.extend_from_slice(text);
    out
}

/// Error text without the marker and a single leading space.
pub fn error_text(msg: &[u8]) -> &[u8] {
    let text = &msg[ERROR_MARKER.len().min(msg.len())..];
    text.strip_prefix(b" ").unwrap_or(text)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_message_type() {
        assert_eq!(guess_message_type(b"Hello world"), MessageGuess::NotOtr);
        assert_eq!(guess_message_type(b"?OTR:AAMC"), MessageGuess::DhCommit);
        assert_eq!(guess_message_type(b"?OTR:AAIK"), MessageGuess::DhKey);
        assert_eq!(guess_message_type(b"?OTR:AAMR"), MessageGuess::RevealSig);
        assert_eq!(guess_message_type(b"?OTR:AAIS"), MessageGuess::Sig);
        assert_eq!(guess_message_type(b"?OTR:AAMD"), MessageGuess::Data);
        assert_eq!(guess_message_type(b"?OTR:AAEK"), MessageGuess::V1KeyExchange);
        assert_eq!(guess_message_type(b"?OTR?"), MessageGuess::Query);
        assert_eq!(guess_message_type(b"?OTRv"), MessageGuess::Query);
        assert_eq!(guess_message_type(b"?OTR Error:"), MessageGuess::Error);
        assert_eq!(guess_message_type(b"?OTR Weird:"), MessageGuess::Unknown);
        assert_eq!(guess_message_type(b"?OTR|"), MessageGuess::Fragment);
        assert_eq!(guess_message_type(b"?OTR,"), MessageGuess::Fragment);

        let tagged = format!("hi{}", whitespace_tag(Policies::otr_v3()));
        assert_eq!(guess_message_type(tagged.as_bytes()), MessageGuess::TaggedPlaintext);
    }

    #[test]
    fn test_encode_decode_envelope() {
        let encoded = encode(&[0x00, 0x03, 0x02, 0xFF]);
        assert_eq!(encoded, b"?OTR:AAMC/w==.".to_vec());
        assert_eq!(decode(&encoded).unwrap(), vec![0x00, 0x03, 0x02, 0xFF]);
        assert!(decode(b"?OTR:AAMC").is_err());
        assert!(decode(b"?OTR:!!!!.").is_err());
    }

    #[test]
    fn test_parse_query() {
        assert_eq!(parse_query(b"?OTR?"), vec![1]);
        assert_eq!(parse_query(b"?OTRv2?"), vec![2]);
        assert_eq!(parse_query(b"?OTRv23?"), vec![2, 3]);
        assert_eq!(parse_query(b"?OTR?v2"), vec![1, 2]);
        assert_eq!(parse_query(b"?OTRv248?"), vec![2, 4, 8]);
        assert_eq!(parse_query(b"?OTR?v?"), vec![1]);
        assert_eq!(parse_query(b"?OTRv?"), Vec::<u32>::new());
    }

    #[test]
    fn test_accepted_query_versions_respects_policy() {
        assert_eq!(accepted_query_versions(Policies::empty(), b"?OTR?"), 0);
        assert_eq!(
            accepted_query_versions(Policies::ALLOW_V2 | Policies::ALLOW_V3, b"?OTRv32?"),
            (1 << 2) | (1 << 3)
        );
        assert_eq!(accepted_query_versions(Policies::ALLOW_V2, b"?OTRv32?"), 1 << 2);
    }

    #[test]
    fn test_query_message() {
        assert_eq!(query_message(Policies::otr_v3(), None), b"?OTRv3?".to_vec());
        assert_eq!(
            query_message(Policies::otr_v3(), Some("hello foobarium")),
            b"?OTRv3? hello foobarium".to_vec()
        );
        assert_eq!(query_message(Policies::default_policy(), None), b"?OTRv23?".to_vec());
    }

    #[test]
    fn test_whitespace_tag_roundtrip() {
        let msg = format!("hello{} world", whitespace_tag(Policies::default_policy()));
        let (plain, versions) = extract_whitespace_tag(msg.as_bytes());
        assert_eq!(plain, b"hello world".to_vec());
        assert_eq!(versions, (1 << 2) | (1 << 3));
    }

    #[test]
    fn test_whitespace_tag_encodes_ot() {
        let ot: String = "OT"
            .bytes()
            .flat_map(|b| (0..8).rev().map(move |i| if b >> i & 1 == 1 { '\t' } else { ' ' }))
            .collect();
        assert_eq!(ot, WHITESPACE_TAG_BASE);
    }

    #[test]
    fn test_error_message() {
        let msg = error_message(b"something broke");
        assert_eq!(msg, b"?OTR Error: something broke".to_vec());
        assert_eq!(error_text(&msg), b"something broke");
        assert_eq!(error_text(b"?OTR Error:bare"), b"bare");
    }
}
