// Разбор входящих сообщений: тип, версия, instance tags, AKE.

use crate::api::events::{MessageEvent, SecurityEvent};
use crate::api::policy::Policies;
use crate::error::{OtrError, Result};
use crate::protocol::envelope::{
    accepted_query_versions, decode, error_text, extract_whitespace_tag, guess_message_type,
    guess_to_message_type, MessageGuess,
};
use crate::protocol::fragmentation::parse_fragment;
use crate::protocol::messages::{MSG_TYPE_DATA, MSG_TYPE_DH_COMMIT};
use crate::protocol::version::{check_instance_tags, message_version, InstanceCheck, Version, MESSAGE_TYPE_OFFSET};
use crate::state::ake::AkeEnv;
use crate::state::conversation::{Conversation, MessageState, Received};
use crate::state::resend::RetransmitMode;
use tracing::{debug, trace, warn};
use zeroize::Zeroize;

impl Conversation {
    /// Processes one message from the transport.
    ///
    /// On error, replies meant for the peer (such as `?OTR Error:` messages)
    /// stay queued; collect them with [`Conversation::take_injections`].
    pub fn receive(&mut self, message: &[u8]) -> Result<Received> {
        if !self.policies.is_otr_enabled() {
            return Ok(Received::plain(message.to_vec()));
        }

        let guess = guess_message_type(message);
        if guess != MessageGuess::Fragment {
            self.fragments.reset();
        }

        let mut received = self.receive_guessed(guess, message)?;
        let mut to_send = self.take_injections();
        to_send.append(&mut received.to_send);
        received.to_send = to_send;
        Ok(received)
    }

    fn receive_guessed(&mut self, guess: MessageGuess, message: &[u8]) -> Result<Received> {
        trace!(target: "otr::conversation", ?guess, "received message");
        match guess {
            MessageGuess::Error => Ok(self.receive_error(message)),
            MessageGuess::Query => self.receive_query(message).map(Received::sending),
            MessageGuess::TaggedPlaintext => Ok(self.receive_tagged_plaintext(message)),
            MessageGuess::NotOtr => {
                self.check_plaintext_policies(message);
                Ok(Received::plain(message.to_vec()))
            }
            MessageGuess::V1KeyExchange => Err(OtrError::UnsupportedVersion),
            MessageGuess::Fragment => self.receive_fragment(message),
            MessageGuess::Unknown => {
                self.handlers.message_event(MessageEvent::ReceivedMessageUnrecognized);
                Ok(Received::default())
            }
            MessageGuess::DhCommit
            | MessageGuess::DhKey
            | MessageGuess::RevealSig
            | MessageGuess::Sig
            | MessageGuess::Data => self.receive_encoded(guess, message),
        }
    }

    fn receive_error(&mut self, message: &[u8]) -> Received {
        let text = error_text(message);
        debug!(target: "otr::conversation", "peer reported an error");
        self.handlers
            .message_event_with_message(MessageEvent::ReceivedMessageGeneralError, text);

        if self.msg_state == MessageState::Encrypted {
            self.resend.mode = RetransmitMode::WithPrefix;
        }
        let mut received = Received::default();
        if self.policies.has(Policies::ERROR_START_AKE) {
            received.to_send.push(self.query_message());
        }
        received
    }

    fn receive_query(&mut self, message: &[u8]) -> Result<Vec<Vec<u8>>> {
        let versions = accepted_query_versions(self.policies, message);
        self.commit_to_version(versions)?;
        self.send_dh_commit()
    }

    fn receive_tagged_plaintext(&mut self, message: &[u8]) -> Received {
        let (plain, versions) = extract_whitespace_tag(message);
        let mut received = Received::default();

        if self.policies.has(Policies::WHITESPACE_START_AKE) && self.msg_state != MessageState::Encrypted {
            let started = self.commit_to_version(versions).and_then(|_| self.send_dh_commit());
            match started {
                Ok(commit) => received.to_send = commit,
                Err(e) => debug!(target: "otr::conversation", error = %e, "not answering whitespace tag"),
            }
        }

        self.check_plaintext_policies(&plain);
        if !plain.is_empty() {
            received.plain = Some(plain);
        }
        received
    }

    fn receive_fragment(&mut self, message: &[u8]) -> Result<Received> {
        let frag = parse_fragment(message)?;
        if let Some((_, receiver)) = frag.tags {
            let ours = self.our_instance_tag()?;
            if receiver != 0 && receiver != ours {
                self.handlers.message_event(MessageEvent::ReceivedMessageForOtherInstance);
                return Ok(Received::default());
            }
        }

        trace!(target: "otr::fragment", index = frag.index, total = frag.total, "received fragment");
        self.fragments.receive(&frag);
        match self.fragments.take_complete() {
            Some(whole) => {
                let guess = guess_message_type(&whole);
                if guess == MessageGuess::Fragment {
                    return Err(OtrError::malformed("fragment inside a fragment"));
                }
                self.receive_guessed(guess, &whole)
            }
            None => Ok(Received::default()),
        }
    }

    fn receive_encoded(&mut self, guess: MessageGuess, message: &[u8]) -> Result<Received> {
        let decoded = decode(message)?;
        let version = self.check_version(message_version(&decoded)?)?;
        let msg_type = *decoded
            .get(MESSAGE_TYPE_OFFSET)
            .ok_or_else(|| OtrError::malformed("message too short for a type"))?;
        if guess_to_message_type(guess) != Some(msg_type) {
            return Err(OtrError::malformed("message type does not match its encoding"));
        }
        let (header, body, tags) = version.split_header(&decoded)?;

        if let Some((sender, receiver)) = tags {
            let ours = self.our_instance_tag()?;
            match check_instance_tags(ours, &mut self.their_instance_tag, sender, receiver) {
                InstanceCheck::Ok => {}
                InstanceCheck::OtherInstance => {
                    debug!(target: "otr::conversation", sender, receiver, "message for another instance");
                    self.handlers.message_event(MessageEvent::ReceivedMessageForOtherInstance);
                    return Ok(Received::default());
                }
                InstanceCheck::Malformed => return Err(OtrError::malformed("invalid instance tags")),
            }
        }

        if msg_type == MSG_TYPE_DATA {
            self.receive_data_message(header, body)
        } else {
            self.receive_ake(msg_type, body).map(Received::sending)
        }
    }

    // ============================================
    // Версия протокола
    // ============================================

    /// The first version we agree on sticks for the rest of the conversation.
    fn commit_to_version(&mut self, advertised: u32) -> Result<Version> {
        if let Some(v) = self.version {
            return Ok(v);
        }
        let v = Version::negotiate(advertised, self.policies)?;
        debug!(target: "otr::conversation", version = v.number(), "committed to protocol version");
        self.version = Some(v);
        Ok(v)
    }

    fn check_version(&mut self, number: u16) -> Result<Version> {
        match self.version {
            Some(v) if v.number() == number => Ok(v),
            Some(_) => Err(OtrError::WrongProtocolVersion),
            None => {
                let v = Version::allowed(number, self.policies)?;
                self.version = Some(v);
                Ok(v)
            }
        }
    }

    // ============================================
    // AKE
    // ============================================

    fn send_dh_commit(&mut self) -> Result<Vec<Vec<u8>>> {
        let body = {
            let mut env = AkeEnv {
                rng: &mut *self.rng,
                our_key: &*self.our_key,
                exponent_len: self.config.ake_exponent_length,
            };
            self.ake.start(&mut env)?
        };
        self.wrap_and_encode(MSG_TYPE_DH_COMMIT, &body)
    }

    fn receive_ake(&mut self, msg_type: u8, body: &[u8]) -> Result<Vec<Vec<u8>>> {
        let step = {
            let mut env = AkeEnv {
                rng: &mut *self.rng,
                our_key: &*self.our_key,
                exponent_len: self.config.ake_exponent_length,
            };
            self.ake.receive(msg_type, body, &mut env)
        };
        let step = match step {
            Ok(step) => step,
            Err(e) => {
                warn!(target: "otr::ake", error = %e, msg_type, "AKE message rejected");
                self.handlers.message_event_with_error(MessageEvent::SetupError, &e);
                return Err(e);
            }
        };

        let mut out = match step.reply {
            Some((reply_type, reply)) => self.wrap_and_encode(reply_type, &reply)?,
            None => Vec::new(),
        };
        if step.finished {
            out.extend(self.ake_finished()?);
        }
        Ok(out)
    }

    /// Installs the keys of a completed AKE and sends anything that was
    /// waiting for an encrypted session.
    fn ake_finished(&mut self) -> Result<Vec<Vec<u8>>> {
        let result = self.ake.take_result(self.config.max_pending_mac_keys)?;
        let was_encrypted = self.msg_state == MessageState::Encrypted;

        self.smp.wipe();
        if let Some(mut old) = self.keys.replace(result.keys) {
            old.zeroize();
        }
        self.ssid = Some(result.ssid);
        let reflected = result.their_key.is_same(&self.our_key.public_key());
        self.their_key = Some(result.their_key);
        self.msg_state = MessageState::Encrypted;

        debug!(
            target: "otr::conversation",
            still_secure = was_encrypted,
            their_instance_tag = self.their_instance_tag,
            "AKE finished, conversation encrypted"
        );
        self.handlers.security_event(if was_encrypted {
            SecurityEvent::StillSecure
        } else {
            SecurityEvent::GoneSecure
        });
        if reflected {
            warn!(target: "otr::conversation", "peer authenticated with our own key");
            self.handlers.message_event(MessageEvent::MessageReflected);
        }

        if let Some(keys) = self.keys.as_mut() {
            keys.generate_new_dh_key_pair(&mut *self.rng, self.config.ake_exponent_length)?;
        }
        self.maybe_retransmit()
    }
}
