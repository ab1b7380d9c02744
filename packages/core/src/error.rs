use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OtrError {
    /// Truncated or structurally invalid wire data.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Well-formed input that contradicts the session state (key ids, counters).
    #[error("Protocol conflict: {0}")]
    Conflict(String),

    /// Bad MAC, bad signature, bad commitment or invalid group element.
    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Short read from random source")]
    ShortRandomRead,

    #[error("Unsupported OTR version")]
    UnsupportedVersion,

    #[error("Version not allowed by policy")]
    InvalidVersion,

    #[error("Message has the wrong protocol version")]
    WrongProtocolVersion,

    #[error("Received an encrypted message while not in private")]
    NotInPrivate,

    #[error("Cannot send an encrypted message without an encrypted session")]
    CannotSendUnencrypted,

    #[error("Cannot authenticate: {0}")]
    CannotAuthenticate(String),

    #[error("Memory lock failed: {0}")]
    MemoryLock(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl OtrError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        OtrError::Malformed(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        OtrError::Conflict(msg.into())
    }

    pub fn verification(msg: impl Into<String>) -> Self {
        OtrError::Verification(msg.into())
    }

    /// Conflicts mean the ratchets are out of sync; the peer gets an "unreadable" error.
    pub fn is_conflict(&self) -> bool {
        matches!(self, OtrError::Conflict(_))
    }

    /// Only randomness exhaustion can succeed on a plain retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OtrError::ShortRandomRead)
    }
}

impl From<rand_core::Error> for OtrError {
    fn from(_: rand_core::Error) -> Self {
        OtrError::ShortRandomRead
    }
}

impl From<base64::DecodeError> for OtrError {
    fn from(err: base64::DecodeError) -> Self {
        OtrError::Malformed(format!("Base64 decode failed: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, OtrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(OtrError::conflict("counter regressed").is_conflict());
        assert!(!OtrError::malformed("short").is_conflict());
        assert!(OtrError::ShortRandomRead.is_retryable());
        assert!(!OtrError::verification("bad mac").is_retryable());
    }

    #[test]
    fn test_display() {
        let err = OtrError::conflict("counter regressed");
        assert_eq!(err.to_string(), "Protocol conflict: counter regressed");
    }
}
