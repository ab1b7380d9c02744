// Data messages: шифрование, TLV, heartbeat и переотправка.
//
// Outgoing messages use (our_key_id - 1, their_key_id) and announce our
// current public value. Incoming ones are checked in this order: counter,
// MAC, decrypt, ratchet, TLVs.

use crate::api::events::{ErrorCode, MessageEvent};
use crate::crypto::math::is_group_element;
use crate::crypto::primitives::{aes_ctr, counter_iv};
use crate::crypto::secure_memory::Secret;
use crate::error::{OtrError, Result};
use crate::protocol::messages::{
    extract_data_message_flag, DataMessage, MESSAGE_FLAG_IGNORE_UNREADABLE, MESSAGE_FLAG_NORMAL, MSG_TYPE_DATA,
};
use crate::protocol::tlv::{
    Plaintext, SmpMessage, Tlv, TLV_TYPE_DISCONNECTED, TLV_TYPE_EXTRA_SYMMETRIC_KEY, TLV_TYPE_PADDING,
};
use crate::protocol::wire::extract_word;
use crate::state::conversation::{Conversation, MessageState, Received};
use crate::state::resend::RetransmitMode;
use crate::state::smp::SmpEnv;
use tracing::{debug, trace};
use zeroize::Zeroize;

impl Conversation {
    // ============================================
    // Исходящие
    // ============================================

    /// Builds header + data message. Also returns the extra symmetric key of
    /// the key pair that was used.
    pub(super) fn generate_data_message(
        &mut self,
        message: &[u8],
        flag: u8,
        tlvs: Vec<Tlv>,
    ) -> Result<(Vec<u8>, Secret)> {
        if self.msg_state != MessageState::Encrypted {
            return Err(OtrError::CannotSendUnencrypted);
        }
        let header = self.message_header(MSG_TYPE_DATA)?;
        let keys = self.keys.as_mut().ok_or(OtrError::CannotSendUnencrypted)?;

        let our_key_id = keys.our_key_id.wrapping_sub(1);
        let their_key_id = keys.their_key_id;
        let session = keys.calculate_session_keys(our_key_id, their_key_id)?;
        let top_half_ctr = keys.next_send_counter();
        let y = keys
            .our_current_public()
            .cloned()
            .ok_or_else(|| OtrError::conflict("no current DH key"))?;

        let mut serialized = Plaintext::new(message, tlvs).pad().serialize();
        let encrypted = aes_ctr(session.sending_aes_key.as_bytes(), &counter_iv(&top_half_ctr), &serialized);
        serialized.zeroize();

        let mut msg = DataMessage {
            flag,
            sender_key_id: our_key_id,
            recipient_key_id: their_key_id,
            y,
            top_half_ctr,
            encrypted_msg: encrypted?,
            authenticator: Vec::new(),
            old_mac_keys: keys.reveal_mac_keys(),
        };
        msg.sign(session.sending_mac_key.as_bytes(), &header)?;

        trace!(
            target: "otr::data",
            sender_key_id = our_key_id,
            recipient_key_id = their_key_id,
            counter = msg.counter(),
            revealed = msg.old_mac_keys.len(),
            "generated data message"
        );

        let extra_key = session.extra_key.try_clone(&self.lock)?;
        let mut out = header;
        out.extend(msg.serialize());
        Ok((out, extra_key))
    }

    pub(super) fn send_data_message(&mut self, message: &[u8], flag: u8, tlvs: Vec<Tlv>) -> Result<Vec<Vec<u8>>> {
        let (msg, _) = self.generate_data_message(message, flag, tlvs)?;
        self.frag_encode(&msg)
    }

    /// Empty data message so the peer can rotate keys even when we are quiet.
    fn heartbeat(&mut self) -> Result<Vec<Vec<u8>>> {
        let out = self.send_data_message(&[], MESSAGE_FLAG_IGNORE_UNREADABLE, Vec::new())?;
        debug!(target: "otr::data", "sent heartbeat");
        self.handlers.message_event(MessageEvent::LogHeartbeatSent);
        Ok(out)
    }

    /// Sends what is waiting in the resend queue, if the mode allows it and
    /// we have been active within the resend interval.
    pub(super) fn maybe_retransmit(&mut self) -> Result<Vec<Vec<u8>>> {
        let interval = self.resend_interval();
        if self.resend.mode == RetransmitMode::No
            || self.resend.queue.is_empty()
            || !self.resend.sent_recently(interval)
        {
            return Ok(Vec::new());
        }

        let mode = self.resend.mode;
        let pending = self.resend.queue.take_pending(interval);
        debug!(target: "otr::resend", ?mode, count = pending.len(), "retransmitting pending messages");

        let mut out = Vec::new();
        self.resend.start_retransmitting();
        let sent = pending.iter().try_for_each(|entry| -> Result<()> {
            let message = match mode {
                RetransmitMode::WithPrefix => {
                    let mut prefixed = self.config.default_resend_prefix.clone().into_bytes();
                    prefixed.extend_from_slice(&entry.message);
                    prefixed
                }
                _ => entry.message.clone(),
            };
            out.extend(self.send_user_message(&message, &entry.opaque)?);
            Ok(())
        });
        self.resend.end_retransmitting();
        sent?;

        let event = if mode == RetransmitMode::WithPrefix {
            MessageEvent::MessageResent
        } else {
            MessageEvent::MessageSent
        };
        for entry in &pending {
            self.handlers.message_event_with_message(event, &entry.opaque);
        }
        Ok(out)
    }

    // ============================================
    // Входящие
    // ============================================

    pub(super) fn receive_data_message(&mut self, header: &[u8], body: &[u8]) -> Result<Received> {
        let ignore_unreadable = extract_data_message_flag(body) & MESSAGE_FLAG_IGNORE_UNREADABLE != 0;

        let mut received = match self.process_data_message(header, body) {
            Ok(received) => received,
            Err(e) if ignore_unreadable => {
                debug!(target: "otr::data", error = %e, "ignoring unreadable control message");
                return Ok(Received::default());
            }
            Err(e) => {
                self.notify_data_message_error(&e);
                return Err(e);
            }
        };

        let heartbeat_due = self.resend.heartbeat_due(self.heartbeat_interval());
        if received.plain.is_some() && self.msg_state == MessageState::Encrypted && heartbeat_due {
            received.to_send.extend(self.heartbeat()?);
        }
        Ok(received)
    }

    fn process_data_message(&mut self, header: &[u8], body: &[u8]) -> Result<Received> {
        if self.msg_state != MessageState::Encrypted {
            self.handlers.message_event(MessageEvent::ReceivedMessageNotInPrivate);
            self.inject_error(ErrorCode::MessageNotInPrivate);
            return Err(OtrError::NotInPrivate);
        }

        let (msg, unsigned) = DataMessage::deserialize(body)?;
        let exponent_len = self.config.ake_exponent_length;
        let keys = self.keys.as_mut().ok_or(OtrError::NotInPrivate)?;

        keys.check_message_counter(msg.recipient_key_id, msg.sender_key_id, msg.counter())?;
        let session = keys.calculate_session_keys(msg.recipient_key_id, msg.sender_key_id)?;
        msg.check_sign(session.receiving_mac_key.as_bytes(), header, unsigned)?;
        if !is_group_element(&msg.y) {
            return Err(OtrError::verification("DH value out of range"));
        }
        keys.accept_message_counter(msg.recipient_key_id, msg.sender_key_id, msg.counter());

        let mut decrypted = aes_ctr(
            session.receiving_aes_key.as_bytes(),
            &counter_iv(&msg.top_half_ctr),
            &msg.encrypted_msg,
        )?;
        let plain = Plaintext::deserialize(&decrypted);
        decrypted.zeroize();
        let mut plain = plain?;

        trace!(
            target: "otr::data",
            sender_key_id = msg.sender_key_id,
            recipient_key_id = msg.recipient_key_id,
            counter = msg.counter(),
            tlvs = plain.tlvs.len(),
            "accepted data message"
        );

        keys.rotate_our_keys(msg.recipient_key_id, &mut *self.rng, exponent_len)?;
        keys.rotate_their_key(msg.sender_key_id, msg.y);

        if plain.message.is_empty() {
            debug!(target: "otr::data", "received heartbeat");
            self.handlers.message_event(MessageEvent::LogHeartbeatReceived);
        }

        let replies = self.process_tlvs(&plain.tlvs, &session.extra_key)?;
        let mut received = Received::default();
        if !replies.is_empty() && self.msg_state == MessageState::Encrypted {
            let flag = if replies.iter().any(Tlv::is_smp_message) {
                MESSAGE_FLAG_IGNORE_UNREADABLE
            } else {
                MESSAGE_FLAG_NORMAL
            };
            received.to_send = self.send_data_message(&[], flag, replies)?;
        }
        if !plain.message.is_empty() {
            received.plain = Some(std::mem::take(&mut plain.message));
        }
        Ok(received)
    }

    /// Handles the TLVs of one message and collects the TLVs to answer with.
    fn process_tlvs(&mut self, tlvs: &[Tlv], extra_key: &Secret) -> Result<Vec<Tlv>> {
        let mut replies = Vec::new();
        for tlv in tlvs {
            match tlv.tlv_type {
                TLV_TYPE_PADDING => {}
                TLV_TYPE_DISCONNECTED => {
                    self.peer_disconnected();
                    return Ok(Vec::new());
                }
                TLV_TYPE_EXTRA_SYMMETRIC_KEY => {
                    let (usage_data, usage) = extract_word(&tlv.value)
                        .ok_or_else(|| OtrError::malformed("corrupt extra symmetric key TLV"))?;
                    self.handlers.received_key(usage, usage_data, extra_key.as_bytes());
                }
                _ if tlv.is_smp_message() => {
                    let msg = SmpMessage::from_tlv(tlv)?;
                    let step = {
                        let mut env = SmpEnv {
                            rng: &mut *self.rng,
                            parameter_len: self.config.smp_parameter_length,
                        };
                        self.smp.receive(&mut env, msg)?
                    };
                    self.raise_smp_notice(step.notice);
                    replies.extend(step.reply.iter().map(SmpMessage::to_tlv));
                }
                other => trace!(target: "otr::data", tlv_type = other, "skipping unknown TLV"),
            }
        }
        Ok(replies)
    }

    fn notify_data_message_error(&mut self, err: &OtrError) {
        match err {
            OtrError::NotInPrivate => {}
            e if e.is_conflict() => {
                self.handlers
                    .message_event_with_error(MessageEvent::ReceivedMessageUnreadable, e);
                self.inject_error(ErrorCode::MessageUnreadable);
            }
            e => {
                self.handlers.message_event_with_error(MessageEvent::ReceivedMessageMalformed, e);
                self.inject_error(ErrorCode::MessageMalformed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::api::events::MessageEvent;
    use crate::error::OtrError;
    use crate::state::conversation::test_support::*;
    use crate::state::conversation::Conversation;
    use std::sync::{Arc, Mutex};

    fn record_events(c: &mut Conversation) -> Arc<Mutex<Vec<MessageEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        c.set_message_event_handler(move |e: MessageEvent, _: Option<&[u8]>, _: Option<&OtrError>| {
            sink.lock().unwrap().push(e)
        });
        events
    }

    #[test]
    fn test_ratchet_keeps_messages_flowing() {
        let (mut a, mut b) = encrypted_pair();
        for i in 0..5 {
            let text = format!("ping {}", i);
            let (plains, _) = deliver(&mut b, a.send(text.as_bytes()).unwrap());
            assert_eq!(plains, vec![text.into_bytes()]);

            let text = format!("pong {}", i);
            let (plains, _) = deliver(&mut a, b.send(text.as_bytes()).unwrap());
            assert_eq!(plains, vec![text.into_bytes()]);
        }
    }

    #[test]
    fn test_several_messages_without_reply() {
        let (mut a, mut b) = encrypted_pair();
        let first = a.send(b"one").unwrap();
        let second = a.send(b"two").unwrap();
        let (plains, _) = deliver(&mut b, first);
        assert_eq!(plains, vec![b"one".to_vec()]);
        let (plains, _) = deliver(&mut b, second);
        assert_eq!(plains, vec![b"two".to_vec()]);
    }

    #[test]
    fn test_replayed_message_is_rejected() {
        let (mut a, mut b) = encrypted_pair();
        let events = record_events(&mut b);
        b.set_error_message_handler(|_| b"unreadable".to_vec());

        let sent = a.send(b"once").unwrap();
        deliver(&mut b, sent.clone());

        let err = b.receive(&sent[0]).unwrap_err();
        assert_eq!(err, OtrError::conflict("counter regressed"));
        assert_eq!(*events.lock().unwrap(), vec![MessageEvent::ReceivedMessageUnreadable]);
        assert_eq!(b.take_injections(), vec![b"?OTR Error: unreadable".to_vec()]);
    }

    #[test]
    fn test_tampered_message_is_malformed_or_unreadable() {
        let (mut a, mut b) = encrypted_pair();
        let mut sent = a.send(b"intact").unwrap();
        // Flip a character inside the base64 body.
        let pos = sent[0].len() / 2;
        sent[0][pos] = if sent[0][pos] == b'A' { b'B' } else { b'A' };
        assert!(b.receive(&sent[0]).is_err());

        // The session survives.
        let (plains, _) = deliver(&mut b, a.send(b"next").unwrap());
        assert_eq!(plains, vec![b"next".to_vec()]);
    }

    #[test]
    fn test_data_message_while_plaintext() {
        let (mut a, b) = encrypted_pair();
        let mut stranger = bob();
        stranger.initialize_instance_tag(b.instance_tags().0).unwrap();
        let events = record_events(&mut stranger);
        stranger.set_error_message_handler(|_| b"not private".to_vec());

        let sent = a.send(b"hello?").unwrap();
        assert_eq!(stranger.receive(&sent[0]).unwrap_err(), OtrError::NotInPrivate);
        assert_eq!(*events.lock().unwrap(), vec![MessageEvent::ReceivedMessageNotInPrivate]);
        assert_eq!(stranger.take_injections(), vec![b"?OTR Error: not private".to_vec()]);
    }

    #[test]
    fn test_heartbeat_after_quiet_period() {
        let (mut a, mut b) = encrypted_pair();
        b.config.heartbeat_interval_secs = 0;
        let events = record_events(&mut b);

        let (plains, replies) = deliver(&mut b, a.send(b"are you there").unwrap());
        assert_eq!(plains, vec![b"are you there".to_vec()]);
        assert_eq!(replies.len(), 1);
        assert_eq!(*events.lock().unwrap(), vec![MessageEvent::LogHeartbeatSent]);

        let a_events = record_events(&mut a);
        let (plains, nothing) = deliver(&mut a, replies);
        assert!(plains.is_empty());
        assert!(nothing.is_empty());
        assert_eq!(*a_events.lock().unwrap(), vec![MessageEvent::LogHeartbeatReceived]);
    }

    #[test]
    fn test_no_heartbeat_within_interval() {
        let (mut a, mut b) = encrypted_pair();
        let (_, replies) = deliver(&mut b, a.send(b"hi").unwrap());
        assert!(replies.is_empty());
    }
}
