//! Conversation: one OTR session with one peer.
//!
//! ```text
//!            send() / end() / SMP          receive()
//!   host ─────────────────▶ Conversation ◀────────── transport
//!        ◀──── events ────  │ ake · keys · smp · fragments · resend
//! ```
//!
//! Every call runs to completion and returns what has to go to the
//! transport. Messages produced on an error path (`?OTR Error:` replies) are
//! kept aside and handed out with the next call's output or through
//! [`Conversation::take_injections`].

use crate::api::events::{
    ErrorCode, ErrorMessageHandler, EventHandlers, MessageEvent, MessageEventHandler, ReceivedKeyHandler,
    SecurityEvent, SecurityEventHandler, SmpEventHandler,
};
use crate::api::policy::Policies;
use crate::config::Config;
use crate::crypto::keys::{PrivateKey, PublicKey};
use crate::crypto::secure_memory::{MemoryLock, NoMemoryLock, Secret};
use crate::error::{OtrError, Result};
use crate::protocol::envelope::{self, encode};
use crate::protocol::fragmentation::{fragment, FragmentationContext};
use crate::protocol::messages::{MESSAGE_FLAG_IGNORE_UNREADABLE, MESSAGE_FLAG_NORMAL};
use crate::protocol::tlv::{SmpMessage, Tlv};
use crate::protocol::version::{Version, MIN_VALID_INSTANCE_TAG};
use crate::state::ake::{AkeContext, AuthState};
use crate::state::keys::{KeyManagementContext, Ssid};
use crate::state::resend::{ResendContext, ResendQueue, RetransmitMode};
use crate::state::smp::{smp_secret, SmpContext, SmpEnv, SmpNotice};
use rand::rngs::OsRng;
use rand_core::RngCore;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroize;

const MAX_INSTANCE_TAG_ATTEMPTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageState {
    #[default]
    Plaintext,
    Encrypted,
    /// The peer ended the private session; sending is refused until `end()`.
    Finished,
}

/// Whether our plaintext still advertises OTR with the whitespace tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum WhitespaceState {
    Candidate,
    Sent,
    Rejected,
}

/// Outcome of one `receive` call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Received {
    /// Text for the user, if the message carried any.
    pub plain: Option<Vec<u8>>,
    /// Messages for the transport, in order.
    pub to_send: Vec<Vec<u8>>,
}

impl Received {
    pub(super) fn plain(message: Vec<u8>) -> Self {
        Self {
            plain: Some(message),
            to_send: Vec::new(),
        }
    }

    pub(super) fn sending(to_send: Vec<Vec<u8>>) -> Self {
        Self { plain: None, to_send }
    }
}

pub struct Conversation {
    pub(super) config: Config,
    pub(super) rng: Box<dyn RngCore + Send>,
    pub(super) lock: Arc<dyn MemoryLock>,
    pub(super) our_key: Box<dyn PrivateKey>,
    pub(super) policies: Policies,

    pub(super) version: Option<Version>,
    pub(super) msg_state: MessageState,
    pub(super) whitespace_state: WhitespaceState,
    pub(super) our_instance_tag: u32,
    pub(super) their_instance_tag: u32,

    pub(super) ssid: Option<Ssid>,
    pub(super) their_key: Option<PublicKey>,

    pub(super) ake: AkeContext,
    pub(super) keys: Option<KeyManagementContext>,
    pub(super) smp: SmpContext,
    pub(super) fragments: FragmentationContext,
    pub(super) resend: ResendContext,
    pub(super) handlers: EventHandlers,

    pub(super) fragment_size: u16,
    pub(super) friendly_query: Option<String>,
    pub(super) injections: Vec<Vec<u8>>,
}

impl Conversation {
    /// A conversation using the global [`Config`], the OS random source and
    /// no memory locking.
    pub fn new(our_key: Box<dyn PrivateKey>, policies: Policies) -> Self {
        let lock: Arc<dyn MemoryLock> = Arc::new(NoMemoryLock);
        let config = Config::global().clone();
        Self {
            fragment_size: config.default_fragment_size,
            config,
            rng: Box::new(OsRng),
            ake: AkeContext::new(Arc::clone(&lock)),
            smp: SmpContext::new(Arc::clone(&lock)),
            lock,
            our_key,
            policies,
            version: None,
            msg_state: MessageState::Plaintext,
            whitespace_state: WhitespaceState::Candidate,
            our_instance_tag: 0,
            their_instance_tag: 0,
            ssid: None,
            their_key: None,
            keys: None,
            fragments: FragmentationContext::default(),
            resend: ResendContext::default(),
            handlers: EventHandlers::default(),
            friendly_query: None,
            injections: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.fragment_size = config.default_fragment_size;
        self.config = config;
        self
    }

    pub fn with_rng(mut self, rng: Box<dyn RngCore + Send>) -> Self {
        self.rng = rng;
        self
    }

    /// Installs a memory lock. Must happen before the first exchange.
    pub fn with_memory_lock(mut self, lock: Arc<dyn MemoryLock>) -> Self {
        self.ake = AkeContext::new(Arc::clone(&lock));
        self.smp = SmpContext::new(Arc::clone(&lock));
        self.lock = lock;
        self
    }

    // ============================================
    // Настройки и обработчики
    // ============================================

    pub fn set_policies(&mut self, policies: Policies) {
        self.policies = policies;
    }

    /// Maximum size of outgoing encoded messages; 0 disables fragmentation.
    pub fn set_fragment_size(&mut self, size: u16) {
        self.fragment_size = size;
    }

    /// Human readable text appended to query messages.
    pub fn set_friendly_query_message(&mut self, text: impl Into<String>) {
        self.friendly_query = Some(text.into());
    }

    pub fn set_message_event_handler(&mut self, handler: impl MessageEventHandler + 'static) {
        self.handlers.message = Some(Box::new(handler));
    }

    pub fn set_security_event_handler(&mut self, handler: impl SecurityEventHandler + 'static) {
        self.handlers.security = Some(Box::new(handler));
    }

    pub fn set_smp_event_handler(&mut self, handler: impl SmpEventHandler + 'static) {
        self.handlers.smp = Some(Box::new(handler));
    }

    pub fn set_error_message_handler(&mut self, handler: impl ErrorMessageHandler + 'static) {
        self.handlers.error_message = Some(Box::new(handler));
    }

    pub fn set_received_key_handler(&mut self, handler: impl ReceivedKeyHandler + 'static) {
        self.handlers.received_key = Some(Box::new(handler));
    }

    /// Pins our instance tag. Values below 0x100 are reserved, so a fresh
    /// random tag is picked instead.
    pub fn initialize_instance_tag(&mut self, tag: u32) -> Result<u32> {
        self.our_instance_tag = if tag >= MIN_VALID_INSTANCE_TAG {
            tag
        } else {
            generate_instance_tag(&mut *self.rng)?
        };
        Ok(self.our_instance_tag)
    }

    // ============================================
    // Состояние
    // ============================================

    pub fn policies(&self) -> Policies {
        self.policies
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn message_state(&self) -> MessageState {
        self.msg_state
    }

    pub fn is_encrypted(&self) -> bool {
        self.msg_state == MessageState::Encrypted
    }

    pub fn auth_state(&self) -> &AuthState {
        self.ake.state()
    }

    /// Session id of the current encrypted session.
    pub fn ssid(&self) -> Option<Ssid> {
        self.ssid
    }

    /// Long-term key the peer authenticated with.
    pub fn their_key(&self) -> Option<&PublicKey> {
        self.their_key.as_ref()
    }

    /// (ours, theirs); 0 means not known yet.
    pub fn instance_tags(&self) -> (u32, u32) {
        (self.our_instance_tag, self.their_instance_tag)
    }

    /// Question the peer attached to its authentication request.
    pub fn smp_question(&self) -> Option<&str> {
        self.smp.question()
    }

    /// Handle on the resend queue, for enqueueing from another thread.
    pub fn resend_queue(&self) -> ResendQueue {
        self.resend.queue.clone()
    }

    /// MAC keys waiting to be revealed with the next data message.
    pub fn pending_mac_keys(&self) -> usize {
        self.keys.as_ref().map_or(0, |k| k.pending_mac_keys())
    }

    /// Messages produced on an error path that still need to be sent.
    pub fn take_injections(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.injections)
    }

    // ============================================
    // Отправка
    // ============================================

    pub fn query_message(&self) -> Vec<u8> {
        envelope::query_message(self.policies, self.friendly_query.as_deref())
    }

    pub fn send(&mut self, message: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.send_with_opaque(message, &[])
    }

    /// Like [`Conversation::send`]; `opaque` comes back with the
    /// `MessageSent`/`MessageResent` event if the message is queued and sent
    /// later.
    pub fn send_with_opaque(&mut self, message: &[u8], opaque: &[u8]) -> Result<Vec<Vec<u8>>> {
        use tracing::debug;

        let mut out = self.take_injections();
        if !self.policies.is_otr_enabled() {
            out.push(message.to_vec());
            return Ok(out);
        }

        match self.msg_state {
            MessageState::Plaintext if self.policies.has(Policies::REQUIRE_ENCRYPTION) => {
                debug!(target: "otr::conversation", "encryption required, queueing message and querying peer");
                self.handlers.message_event(MessageEvent::EncryptionRequired);
                self.resend.queue.later(message, opaque);
                self.resend.mode = RetransmitMode::Exact;
                out.push(self.query_message());
            }
            MessageState::Plaintext => {
                out.push(self.tag_plaintext(message));
            }
            MessageState::Finished => {
                debug!(target: "otr::conversation", "peer ended the session, refusing to send");
                self.handlers.message_event(MessageEvent::ConnectionEnded);
            }
            MessageState::Encrypted => match self.send_user_message(message, opaque) {
                Ok(sent) => out.extend(sent),
                Err(e) => {
                    self.handlers.message_event_with_error(MessageEvent::EncryptionError, &e);
                    self.inject_error(ErrorCode::EncryptionError);
                    return Err(e);
                }
            },
        }
        Ok(out)
    }

    /// Sends a user message as a data message and remembers it in case the
    /// peer reports it could not read it.
    pub(super) fn send_user_message(&mut self, message: &[u8], opaque: &[u8]) -> Result<Vec<Vec<u8>>> {
        let out = self.send_data_message(message, MESSAGE_FLAG_NORMAL, Vec::new())?;
        let interval = self.resend_interval();
        self.resend.queue.prune(interval);
        self.resend.later(message, opaque);
        self.resend.mode = RetransmitMode::No;
        Ok(out)
    }

    fn tag_plaintext(&mut self, message: &[u8]) -> Vec<u8> {
        let mut out = message.to_vec();
        if self.policies.has(Policies::SEND_WHITESPACE_TAG) && self.whitespace_state == WhitespaceState::Candidate {
            out.extend_from_slice(envelope::whitespace_tag(self.policies).as_bytes());
            self.whitespace_state = WhitespaceState::Sent;
        }
        out
    }

    /// Ends the private session. The peer is told with a disconnect TLV if
    /// the session was encrypted. Keys are wiped either way.
    pub fn end(&mut self) -> Result<Vec<Vec<u8>>> {
        use tracing::debug;

        let previous = self.msg_state;
        let result = if previous == MessageState::Encrypted {
            self.smp.wipe();
            self.send_data_message(&[], MESSAGE_FLAG_IGNORE_UNREADABLE, vec![Tlv::disconnected()])
        } else {
            Ok(Vec::new())
        };

        self.msg_state = MessageState::Plaintext;
        self.wipe_session();
        self.ake.reset();
        debug!(target: "otr::conversation", from = ?previous, "conversation ended");

        if previous == MessageState::Encrypted {
            self.handlers.security_event(SecurityEvent::GoneInsecure);
        }
        let mut out = self.take_injections();
        out.extend(result?);
        Ok(out)
    }

    /// Sends a TLV 8 announcing use of the extra symmetric key and returns
    /// that key alongside the messages.
    pub fn use_extra_symmetric_key(&mut self, usage: u32, usage_data: &[u8]) -> Result<(Vec<Vec<u8>>, Secret)> {
        let tlv = Tlv::extra_symmetric_key(usage, usage_data);
        let (msg, extra_key) = self.generate_data_message(&[], MESSAGE_FLAG_IGNORE_UNREADABLE, vec![tlv])?;
        let out = self.frag_encode(&msg)?;
        Ok((out, extra_key))
    }

    // ============================================
    // SMP
    // ============================================

    /// Starts an SMP run with `secret`, optionally asking `question`.
    pub fn start_authenticate(&mut self, question: Option<&str>, secret: &[u8]) -> Result<Vec<Vec<u8>>> {
        let (ssid, their_fp) = self.session_identity()?;
        let our_fp = self.our_key.public_key().fingerprint();
        let x = smp_secret(&our_fp, &their_fp, &ssid, secret);

        let messages = {
            let mut env = SmpEnv {
                rng: &mut *self.rng,
                parameter_len: self.config.smp_parameter_length,
            };
            self.smp.start(&mut env, x, question)?
        };
        self.send_smp_messages(&messages)
    }

    /// Answers the peer's SMP request with our secret.
    pub fn provide_authentication_secret(&mut self, secret: &[u8]) -> Result<Vec<Vec<u8>>> {
        let (ssid, their_fp) = self.session_identity()?;
        let our_fp = self.our_key.public_key().fingerprint();
        let x = smp_secret(&their_fp, &our_fp, &ssid, secret);

        let step = {
            let mut env = SmpEnv {
                rng: &mut *self.rng,
                parameter_len: self.config.smp_parameter_length,
            };
            self.smp.provide_secret(&mut env, x)?
        };
        self.raise_smp_notice(step.notice);
        self.send_smp_messages(&step.reply)
    }

    /// Abandons the SMP run and tells the peer if the session is encrypted.
    pub fn abort_authentication(&mut self) -> Result<Vec<Vec<u8>>> {
        let abort = self.smp.abort();
        if !self.is_encrypted() {
            return Ok(Vec::new());
        }
        self.send_smp_messages(&[abort])
    }

    fn session_identity(&self) -> Result<(Ssid, Vec<u8>)> {
        if !self.is_encrypted() {
            return Err(OtrError::CannotAuthenticate("not in an encrypted session".into()));
        }
        match (self.ssid, self.their_key.as_ref()) {
            (Some(ssid), Some(key)) => Ok((ssid, key.fingerprint())),
            _ => Err(OtrError::CannotAuthenticate("peer identity unknown".into())),
        }
    }

    pub(super) fn send_smp_messages(&mut self, messages: &[SmpMessage]) -> Result<Vec<Vec<u8>>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let tlvs = messages.iter().map(SmpMessage::to_tlv).collect();
        self.send_data_message(&[], MESSAGE_FLAG_IGNORE_UNREADABLE, tlvs)
    }

    pub(super) fn raise_smp_notice(&mut self, notice: Option<SmpNotice>) {
        if let Some(notice) = notice {
            match notice.question {
                Some(question) => self.handlers.smp_event_with_question(notice.event, notice.progress, &question),
                None => self.handlers.smp_event(notice.event, notice.progress),
            }
        }
    }

    // ============================================
    // Внутренние помощники
    // ============================================

    pub(super) fn our_instance_tag(&mut self) -> Result<u32> {
        if self.our_instance_tag == 0 {
            self.our_instance_tag = generate_instance_tag(&mut *self.rng)?;
        }
        Ok(self.our_instance_tag)
    }

    pub(super) fn resend_interval(&self) -> Duration {
        Duration::from_secs(self.config.resend_interval_secs)
    }

    pub(super) fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.config.heartbeat_interval_secs)
    }

    /// Header for `msg_type` under the negotiated version.
    pub(super) fn message_header(&mut self, msg_type: u8) -> Result<Vec<u8>> {
        let version = self
            .version
            .ok_or_else(|| OtrError::conflict("no protocol version negotiated"))?;
        let our_tag = self.our_instance_tag()?;
        Ok(version.message_header(msg_type, our_tag, self.their_instance_tag))
    }

    /// Header + body, encoded and fragmented for the transport.
    pub(super) fn wrap_and_encode(&mut self, msg_type: u8, body: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut msg = self.message_header(msg_type)?;
        msg.extend_from_slice(body);
        self.frag_encode(&msg)
    }

    pub(super) fn frag_encode(&mut self, msg: &[u8]) -> Result<Vec<Vec<u8>>> {
        let version = self
            .version
            .ok_or_else(|| OtrError::conflict("no protocol version negotiated"))?;
        let our_tag = self.our_instance_tag()?;
        let encoded = encode(msg);
        self.resend.mark_sent();
        Ok(fragment(&encoded, self.fragment_size, version, our_tag, self.their_instance_tag))
    }

    /// Queues an `?OTR Error:` for the peer if the host supplied the text.
    pub(super) fn inject_error(&mut self, code: ErrorCode) {
        if let Some(text) = self.handlers.error_message(code) {
            self.injections.push(envelope::error_message(&text));
        }
    }

    /// A plaintext arrived: the peer saw our tag and did not answer it, and
    /// the user should know the message was not private.
    pub(super) fn check_plaintext_policies(&mut self, plain: &[u8]) {
        if self.whitespace_state == WhitespaceState::Sent {
            self.whitespace_state = WhitespaceState::Rejected;
        }
        if self.msg_state != MessageState::Plaintext || self.policies.has(Policies::REQUIRE_ENCRYPTION) {
            self.handlers
                .message_event_with_message(MessageEvent::ReceivedMessageUnencrypted, plain);
        }
    }

    /// The peer sent a disconnect TLV.
    pub(super) fn peer_disconnected(&mut self) {
        use tracing::debug;

        debug!(target: "otr::conversation", "peer disconnected");
        self.msg_state = MessageState::Finished;
        self.wipe_session();
        self.handlers.security_event(SecurityEvent::GoneInsecure);
    }

    pub(super) fn wipe_session(&mut self) {
        self.resend.reset();
        self.smp.wipe();
        if let Some(mut keys) = self.keys.take() {
            keys.zeroize();
        }
        if let Some(mut ssid) = self.ssid.take() {
            ssid.zeroize();
        }
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        self.wipe_session();
        self.ake.reset();
    }
}

fn generate_instance_tag(rng: &mut dyn RngCore) -> Result<u32> {
    let mut buf = [0u8; 4];
    for _ in 0..MAX_INSTANCE_TAG_ATTEMPTS {
        rng.try_fill_bytes(&mut buf)?;
        let tag = u32::from_be_bytes(buf);
        if tag >= MIN_VALID_INSTANCE_TAG {
            return Ok(tag);
        }
    }
    Err(OtrError::ShortRandomRead)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::crypto::keys::fixtures::{alice_key, bob_key};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    pub fn test_config() -> Config {
        let mut config = Config::default();
        config.smp_parameter_length = 24;
        config
    }

    pub fn alice() -> Conversation {
        Conversation::new(Box::new(alice_key()), Policies::default_policy())
            .with_config(test_config())
            .with_rng(Box::new(StdRng::seed_from_u64(0xA11CE)))
    }

    pub fn bob() -> Conversation {
        Conversation::new(Box::new(bob_key()), Policies::default_policy())
            .with_config(test_config())
            .with_rng(Box::new(StdRng::seed_from_u64(0xB0B)))
    }

    /// Delivers `messages` to `to`, returning whatever it shows the user.
    pub fn deliver(to: &mut Conversation, messages: Vec<Vec<u8>>) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let mut plains = Vec::new();
        let mut replies = Vec::new();
        for m in messages {
            let received = to.receive(&m).unwrap();
            plains.extend(received.plain);
            replies.extend(received.to_send);
        }
        (plains, replies)
    }

    /// Plays messages back and forth until both sides are quiet.
    pub fn converse(a: &mut Conversation, b: &mut Conversation, mut from_a: Vec<Vec<u8>>) {
        for _ in 0..16 {
            if from_a.is_empty() {
                return;
            }
            let (_, from_b) = deliver(b, from_a);
            let (_, next) = deliver(a, from_b);
            from_a = next;
        }
        panic!("conversation did not settle");
    }

    /// Alice queries, Bob commits, both end up encrypted.
    pub fn encrypted_pair() -> (Conversation, Conversation) {
        let mut a = alice();
        let mut b = bob();
        let query = a.query_message();
        let (_, commit) = deliver(&mut b, vec![query]);
        converse(&mut b, &mut a, commit);
        assert!(a.is_encrypted() && b.is_encrypted());
        (a, b)
    }
}
