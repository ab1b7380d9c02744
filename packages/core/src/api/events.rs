//! Events reported to the host UI layer.
//!
//! A conversation owns at most one handler per event family. Handlers are
//! plain traits; any `FnMut` with the matching signature implements them.

use crate::error::OtrError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageEvent {
    /// A plaintext send was refused because the policy requires encryption.
    EncryptionRequired,
    EncryptionError,
    /// The peer closed the private session; nothing more can be sent.
    ConnectionEnded,
    SetupError,
    MessageReflected,
    MessageResent,
    MessageSent,
    ReceivedMessageNotInPrivate,
    ReceivedMessageUnreadable,
    ReceivedMessageMalformed,
    LogHeartbeatReceived,
    LogHeartbeatSent,
    ReceivedMessageGeneralError,
    ReceivedMessageUnencrypted,
    ReceivedMessageUnrecognized,
    ReceivedMessageForOtherInstance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityEvent {
    GoneInsecure,
    GoneSecure,
    StillSecure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpEvent {
    Error,
    Abort,
    Cheated,
    AskForAnswer,
    AskForSecret,
    InProgress,
    Success,
    Failure,
}

/// Error kinds the engine reports to the peer as `?OTR Error:` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    EncryptionError,
    MessageUnreadable,
    MessageMalformed,
    MessageNotInPrivate,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::EncryptionError => "EncryptionError",
            ErrorCode::MessageUnreadable => "MessageUnreadable",
            ErrorCode::MessageMalformed => "MessageMalformed",
            ErrorCode::MessageNotInPrivate => "MessageNotInPrivate",
        };
        f.write_str(name)
    }
}

pub trait MessageEventHandler: Send {
    fn handle_message_event(&mut self, event: MessageEvent, message: Option<&[u8]>, error: Option<&OtrError>);
}

pub trait SecurityEventHandler: Send {
    fn handle_security_event(&mut self, event: SecurityEvent);
}

pub trait SmpEventHandler: Send {
    /// `question` is set for `AskForAnswer`.
    fn handle_smp_event(&mut self, event: SmpEvent, progress_percent: u8, question: Option<&str>);
}

/// Maps an error kind to the (localized) text sent to the peer.
pub trait ErrorMessageHandler: Send {
    fn handle_error_message(&mut self, code: ErrorCode) -> Vec<u8>;
}

/// Receives the extra symmetric key when the peer announces its use.
pub trait ReceivedKeyHandler: Send {
    fn received_symmetric_key(&mut self, usage: u32, usage_data: &[u8], key: &[u8]);
}

impl<F> MessageEventHandler for F
where
    F: FnMut(MessageEvent, Option<&[u8]>, Option<&OtrError>) + Send,
{
    fn handle_message_event(&mut self, event: MessageEvent, message: Option<&[u8]>, error: Option<&OtrError>) {
        self(event, message, error)
    }
}

impl<F> SecurityEventHandler for F
where
    F: FnMut(SecurityEvent) + Send,
{
    fn handle_security_event(&mut self, event: SecurityEvent) {
        self(event)
    }
}

impl<F> SmpEventHandler for F
where
    F: FnMut(SmpEvent, u8, Option<&str>) + Send,
{
    fn handle_smp_event(&mut self, event: SmpEvent, progress_percent: u8, question: Option<&str>) {
        self(event, progress_percent, question)
    }
}

impl<F> ErrorMessageHandler for F
where
    F: FnMut(ErrorCode) -> Vec<u8> + Send,
{
    fn handle_error_message(&mut self, code: ErrorCode) -> Vec<u8> {
        self(code)
    }
}

impl<F> ReceivedKeyHandler for F
where
    F: FnMut(u32, &[u8], &[u8]) + Send,
{
    fn received_symmetric_key(&mut self, usage: u32, usage_data: &[u8], key: &[u8]) {
        self(usage, usage_data, key)
    }
}

/// Handler slots owned by a conversation.
#[derive(Default)]
pub(crate) struct EventHandlers {
    pub message: Option<Box<dyn MessageEventHandler>>,
    pub security: Option<Box<dyn SecurityEventHandler>>,
    pub smp: Option<Box<dyn SmpEventHandler>>,
    pub error_message: Option<Box<dyn ErrorMessageHandler>>,
    pub received_key: Option<Box<dyn ReceivedKeyHandler>>,
}

impl EventHandlers {
    pub fn message_event(&mut self, event: MessageEvent) {
        if let Some(h) = self.message.as_mut() {
            h.handle_message_event(event, None, None);
        }
    }

    pub fn message_event_with_message(&mut self, event: MessageEvent, message: &[u8]) {
        if let Some(h) = self.message.as_mut() {
            h.handle_message_event(event, Some(message), None);
        }
    }

    pub fn message_event_with_error(&mut self, event: MessageEvent, error: &OtrError) {
        if let Some(h) = self.message.as_mut() {
            h.handle_message_event(event, None, Some(error));
        }
    }

    pub fn security_event(&mut self, event: SecurityEvent) {
        if let Some(h) = self.security.as_mut() {
            h.handle_security_event(event);
        }
    }

    pub fn smp_event(&mut self, event: SmpEvent, progress_percent: u8) {
        if let Some(h) = self.smp.as_mut() {
            h.handle_smp_event(event, progress_percent, None);
        }
    }

    pub fn smp_event_with_question(&mut self, event: SmpEvent, progress_percent: u8, question: &str) {
        if let Some(h) = self.smp.as_mut() {
            h.handle_smp_event(event, progress_percent, Some(question));
        }
    }

    pub fn error_message(&mut self, code: ErrorCode) -> Option<Vec<u8>> {
        self.error_message.as_mut().map(|h| h.handle_error_message(code))
    }

    pub fn received_key(&mut self, usage: u32, usage_data: &[u8], key: &[u8]) {
        if let Some(h) = self.received_key.as_mut() {
            h.received_symmetric_key(usage, usage_data, key);
        }
    }
}
