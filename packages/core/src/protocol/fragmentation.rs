//! Fragmentation of encoded messages for carriers with a size limit.
//!
//! ```text
//! v2: ?OTR,<index>,<total>,<chunk>,
//! v3: ?OTR|<sender tag hex>|<receiver tag hex>,<index>,<total>,<chunk>,
//! ```
//!
//! Indices are 1-based, five decimal digits. Reassembly only accepts the
//! fragments of one message in strict order.

use crate::error::{OtrError, Result};
use crate::protocol::envelope::{V2_FRAGMENT_PREFIX, V3_FRAGMENT_PREFIX};
use crate::protocol::version::Version;
use tracing::trace;

const FRAGMENT_SEPARATOR: u8 = b',';
const ITAG_SEPARATOR: u8 = b'|';

pub fn fragment_prefix(version: Version, index: usize, total: usize, our_tag: u32, their_tag: u32) -> String {
    match version {
        Version::V3 => format!(
            "{}{:08x}|{:08x},{:05},{:05},",
            V3_FRAGMENT_PREFIX, our_tag, their_tag, index, total
        ),
        Version::V2 => format!("{}{:05},{:05},", V2_FRAGMENT_PREFIX, index, total),
    }
}

/// Splits `data` into fragments of at most `size` bytes each.
/// A size of 0, or one too small for the prefix, leaves the message whole.
pub fn fragment(data: &[u8], size: u16, version: Version, our_tag: u32, their_tag: u32) -> Vec<Vec<u8>> {
    let size = size as usize;
    if size == 0 || data.len() <= size {
        return vec![data.to_vec()];
    }

    let overhead = fragment_prefix(version, 1, 1, our_tag, their_tag).len() + 1;
    if size <= overhead {
        return vec![data.to_vec()];
    }
    let chunk_len = size - overhead;
    let total = (data.len() + chunk_len - 1) / chunk_len;
    if total > u16::MAX as usize {
        return vec![data.to_vec()];
    }

    trace!(target: "otr::fragment", total, chunk_len, "fragmenting outgoing message");

    data.chunks(chunk_len)
        .enumerate()
        .map(|(i, chunk)| {
            let mut out = fragment_prefix(version, i + 1, total, our_tag, their_tag).into_bytes();
            out.extend_from_slice(chunk);
            out.push(FRAGMENT_SEPARATOR);
            out
        })
        .collect()
}

/// One parsed fragment. `tags` is (sender, receiver) for v3 fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub tags: Option<(u32, u32)>,
    pub index: u16,
    pub total: u16,
    pub chunk: &'a [u8],
}

pub fn parse_fragment(data: &[u8]) -> Result<Fragment<'_>> {
    let invalid = || OtrError::malformed("invalid OTR fragment");

    let (tags, body) = if let Some(rest) = data.strip_prefix(V3_FRAGMENT_PREFIX.as_bytes()) {
        let comma = rest.iter().position(|&b| b == FRAGMENT_SEPARATOR).ok_or_else(invalid)?;
        let mut itags = rest[..comma].split(|&b| b == ITAG_SEPARATOR);
        let sender = itags.next().and_then(parse_itag).ok_or_else(invalid)?;
        let receiver = itags.next().and_then(parse_itag).ok_or_else(invalid)?;
        if itags.next().is_some() {
            return Err(invalid());
        }
        (Some((sender, receiver)), &rest[comma + 1..])
    } else if let Some(rest) = data.strip_prefix(V2_FRAGMENT_PREFIX.as_bytes()) {
        (None, rest)
    } else {
        return Err(invalid());
    };

    let parts: Vec<&[u8]> = body.split(|&b| b == FRAGMENT_SEPARATOR).collect();
    if parts.len() != 4 || !parts[3].is_empty() {
        return Err(invalid());
    }
    let index = parse_decimal(parts[0]).ok_or_else(invalid)?;
    let total = parse_decimal(parts[1]).ok_or_else(invalid)?;

    Ok(Fragment {
        tags,
        index,
        total,
        chunk: parts[2],
    })
}

fn parse_itag(hex_tag: &[u8]) -> Option<u32> {
    let s = std::str::from_utf8(hex_tag).ok()?;
    u32::from_str_radix(s, 16).ok()
}

fn parse_decimal(digits: &[u8]) -> Option<u16> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Reassembly buffer for the message currently being received.
#[derive(Debug, Default)]
pub struct FragmentationContext {
    buffer: Vec<u8>,
    current_index: u16,
    current_total: u16,
}

impl FragmentationContext {
    pub fn receive(&mut self, fragment: &Fragment<'_>) {
        let (index, total) = (fragment.index, fragment.total);

        if index == 0 || total == 0 || index > total {
            trace!(target: "otr::fragment", index, total, "discarding invalid fragment");
        } else if index == 1 {
            self.buffer = fragment.chunk.to_vec();
            self.current_index = index;
            self.current_total = total;
        } else if self.current_index.checked_add(1) == Some(index) && self.current_total == total {
            self.buffer.extend_from_slice(fragment.chunk);
            self.current_index = index;
        } else {
            trace!(
                target: "otr::fragment",
                index,
                total,
                expected = self.current_index.wrapping_add(1),
                "out of order fragment, forgetting partial message"
            );
            self.reset();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.current_index > 0 && self.current_index == self.current_total
    }

    /// Takes the reassembled message once complete.
    pub fn take_complete(&mut self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let msg = std::mem::take(&mut self.buffer);
        self.reset();
        Some(msg)
    }

    pub fn reset(&mut self) {
        *self = FragmentationContext::default();
    }
}
