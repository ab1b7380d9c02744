//! End-to-end tests for two conversations talking to each other
//!
//! This test suite covers:
//! - AKE started by a query message, then encrypted data both ways
//! - DH ratchet over many messages
//! - Socialist Millionaires' Protocol (match and mismatch)
//! - Fragmentation of AKE and data messages
//! - Resend of queued messages and heartbeats
//! - Disconnect handling
//! - Policy persistence

use otr_core::{
    Config, Conversation, DsaPrivateKey, MessageEvent, MessageState, OtrError, Policies, PrivateKey,
    SecurityEvent, SmpEvent,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{Arc, Mutex};

const ALICE_PRIVATE_KEY_HEX: &str = "000000000080c81c2cb2eb729b7e6fd48e975a932c638b3a9055478583afa46755683e30102447f6da2d8bec9f386bbb5da6403b0040fee8650b6ab2d7f32c55ab017ae9b6aec8c324ab5844784e9a80e194830d548fb7f09a0410df2c4d5c8bc2b3e9ad484e65412be689cf0834694e0839fb2954021521ffdffb8f5c32c14dbf2020b3ce7500000014da4591d58def96de61aea7b04a8405fe1609308d000000808ddd5cb0b9d66956e3dea5a915d9aba9d8a6e7053b74dadb2fc52f9fe4e5bcc487d2305485ed95fed026ad93f06ebb8c9e8baf693b7887132c7ffdd3b0f72f4002ff4ed56583ca7c54458f8c068ca3e8a4dfa309d1dd5d34e2a4b68e6f4338835e5e0fb4317c9e4c7e4806dafda3ef459cd563775a586dd91b1319f72621bf3f00000080b8147e74d8c45e6318c37731b8b33b984a795b3653c2cd1d65cc99efe097cb7eb2fa49569bab5aab6e8a1c261a27d0f7840a5e80b317e6683042b59b6dceca2879c6ffc877a465be690c15e4a42f9a7588e79b10faac11b1ce3741fcef7aba8ce05327a2c16d279ee1b3d77eb783fb10e3356caa25635331e26dd42b8396c4d00000001420bec691fea37ecea58a5c717142f0b804452f57";

const BOB_PRIVATE_KEY_HEX: &str = "000000000080a5138eb3d3eb9c1d85716faecadb718f87d31aaed1157671d7fee7e488f95e8e0ba60ad449ec732710a7dec5190f7182af2e2f98312d98497221dff160fd68033dd4f3a33b7c078d0d9f66e26847e76ca7447d4bab35486045090572863d9e4454777f24d6706f63e02548dfec2d0a620af37bbc1d24f884708a212c343b480d00000014e9c58f0ea21a5e4dfd9f44b6a9f7f6a9961a8fa9000000803c4d111aebd62d3c50c2889d420a32cdf1e98b70affcc1fcf44d59cca2eb019f6b774ef88153fb9b9615441a5fe25ea2d11b74ce922ca0232bd81b3c0fcac2a95b20cb6e6c0c5c1ace2e26f65dc43c751af0edbb10d669890e8ab6beea91410b8b2187af1a8347627a06ecea7e0f772c28aae9461301e83884860c9b656c722f0000008065af8625a555ea0e008cd04743671a3cda21162e83af045725db2eb2bb52712708dc0cc1a84c08b3649b88a966974bde27d8612c2861792ec9f08786a246fcadd6d8d3a81a32287745f309238f47618c2bd7612cb8b02d940571e0f30b96420bcd462ff542901b46109b1e5ad6423744448d20a57818a8cbb1647d0fea3b664e0000001440f9f2eb554cb00d45a5826b54bfa419b6980e48";

fn key(hex_key: &str) -> DsaPrivateKey {
    DsaPrivateKey::from_bytes(&hex::decode(hex_key).unwrap()).unwrap()
}

fn config() -> Config {
    let mut config = Config::default();
    // Short SMP exponents keep the tests fast.
    config.smp_parameter_length = 24;
    config
}

fn conversation(hex_key: &str, seed: u64, config: Config) -> Conversation {
    Conversation::new(Box::new(key(hex_key)), Policies::default_policy())
        .with_config(config)
        .with_rng(Box::new(StdRng::seed_from_u64(seed)))
}

fn alice() -> Conversation {
    conversation(ALICE_PRIVATE_KEY_HEX, 1, config())
}

fn bob() -> Conversation {
    conversation(BOB_PRIVATE_KEY_HEX, 2, config())
}

/// Feeds every message to `to` and collects what it shows and what it answers.
fn deliver(to: &mut Conversation, messages: Vec<Vec<u8>>) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let mut plains = Vec::new();
    let mut replies = Vec::new();
    for m in messages {
        let received = to.receive(&m).expect("receive failed");
        plains.extend(received.plain);
        replies.extend(received.to_send);
    }
    (plains, replies)
}

/// Runs the AKE: `a` queries, `b` answers, until nobody has anything to say.
fn establish(a: &mut Conversation, b: &mut Conversation) {
    let (_, mut from_b) = deliver(b, vec![a.query_message()]);
    for _ in 0..8 {
        if from_b.is_empty() {
            break;
        }
        let (_, from_a) = deliver(a, from_b);
        from_b = deliver(b, from_a).1;
    }
    assert!(a.is_encrypted(), "initiator should be encrypted");
    assert!(b.is_encrypted(), "responder should be encrypted");
}

fn message_events(c: &mut Conversation) -> Arc<Mutex<Vec<MessageEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    c.set_message_event_handler(move |e: MessageEvent, _: Option<&[u8]>, _: Option<&OtrError>| {
        sink.lock().unwrap().push(e)
    });
    events
}

/// Test that a query message leads to an encrypted session and a first message
#[test]
fn test_query_then_hello() {
    let mut a = alice();
    let mut b = bob();
    establish(&mut a, &mut b);

    assert_eq!(a.ssid(), b.ssid(), "both sides must agree on the SSID");
    assert_eq!(a.their_key(), Some(&key(BOB_PRIVATE_KEY_HEX).public_key()));

    let (plains, replies) = deliver(&mut b, a.send(b"hello").unwrap());
    assert_eq!(plains, vec![b"hello".to_vec()]);
    assert!(replies.is_empty(), "a fresh session needs no heartbeat");
}

/// Test that the ratchet survives a long alternating exchange
#[test]
fn test_ratchet_many_rounds() {
    let mut a = alice();
    let mut b = bob();
    establish(&mut a, &mut b);

    for i in 0..10 {
        let text = format!("from alice {}", i);
        let (plains, _) = deliver(&mut b, a.send(text.as_bytes()).unwrap());
        assert_eq!(plains, vec![text.into_bytes()]);

        if i % 3 == 0 {
            continue;
        }
        let text = format!("from bob {}", i);
        let (plains, _) = deliver(&mut a, b.send(text.as_bytes()).unwrap());
        assert_eq!(plains, vec![text.into_bytes()]);
    }
}

fn smp_result(c: &mut Conversation) -> Arc<Mutex<Option<SmpEvent>>> {
    let result = Arc::new(Mutex::new(None));
    let out = result.clone();
    c.set_smp_event_handler(move |e: SmpEvent, _: u8, _: Option<&str>| {
        if matches!(e, SmpEvent::Success | SmpEvent::Failure | SmpEvent::Cheated) {
            *out.lock().unwrap() = Some(e);
        }
    });
    result
}

fn run_smp(a_secret: &[u8], b_secret: &[u8]) -> (Option<SmpEvent>, Option<SmpEvent>) {
    let mut a = alice();
    let mut b = bob();
    establish(&mut a, &mut b);
    let a_result = smp_result(&mut a);
    let b_result = smp_result(&mut b);

    let smp1 = a.start_authenticate(None, a_secret).unwrap();
    deliver(&mut b, smp1);
    let smp2 = b.provide_authentication_secret(b_secret).unwrap();
    let (_, smp3) = deliver(&mut a, smp2);
    let (_, smp4) = deliver(&mut b, smp3);
    deliver(&mut a, smp4);

    let a_result = *a_result.lock().unwrap();
    let b_result = *b_result.lock().unwrap();
    (a_result, b_result)
}

/// Test that SMP succeeds on both sides when the secrets match
#[test]
fn test_smp_matching_secrets() {
    let (a, b) = run_smp(b"correct horse", b"correct horse");
    assert_eq!(a, Some(SmpEvent::Success));
    assert_eq!(b, Some(SmpEvent::Success));
}

/// Test that SMP fails on both sides when the secrets differ
#[test]
fn test_smp_different_secrets() {
    let (a, b) = run_smp(b"correct horse", b"battery staple");
    assert_eq!(a, Some(SmpEvent::Failure));
    assert_eq!(b, Some(SmpEvent::Failure));
}

/// Test that a small fragment size splits messages and they still arrive whole
#[test]
fn test_fragmented_session() {
    let mut a = alice();
    let mut b = bob();
    a.set_fragment_size(80);
    b.set_fragment_size(80);
    establish(&mut a, &mut b);

    let text = "a message long enough to need several fragments ".repeat(4);
    let sent = a.send(text.as_bytes()).unwrap();
    assert!(sent.len() > 3, "expected several fragments, got {}", sent.len());
    assert!(sent.iter().all(|f| f.len() <= 80));

    let (plains, _) = deliver(&mut b, sent);
    assert_eq!(plains, vec![text.into_bytes()]);
}

/// Test that messages typed before the session existed are sent once it does
#[test]
fn test_require_encryption_resends_after_ake() {
    let mut a = alice();
    a.set_policies(Policies::always());
    let mut b = bob();

    let out = a.send(b"wait for it").unwrap();
    assert_eq!(out, vec![a.query_message()]);
    assert_eq!(a.resend_queue().len(), 1);

    let (_, commit) = deliver(&mut b, out);
    let (_, dh_key) = deliver(&mut a, commit);
    let (_, reveal_sig) = deliver(&mut b, dh_key);
    let (_, sig_and_pending) = deliver(&mut a, reveal_sig);
    let (plains, _) = deliver(&mut b, sig_and_pending);

    assert_eq!(plains, vec![b"wait for it".to_vec()]);
    assert!(a.is_encrypted() && b.is_encrypted());
}

/// Test that a quiet side answers an incoming message with a heartbeat
#[test]
fn test_heartbeat() {
    let mut a = alice();
    let mut quiet = config();
    quiet.heartbeat_interval_secs = 0;
    let mut b = conversation(BOB_PRIVATE_KEY_HEX, 2, quiet);
    establish(&mut a, &mut b);
    let a_events = message_events(&mut a);
    let b_events = message_events(&mut b);

    let (plains, heartbeat) = deliver(&mut b, a.send(b"anyone there?").unwrap());
    assert_eq!(plains, vec![b"anyone there?".to_vec()]);
    assert_eq!(heartbeat.len(), 1);
    assert_eq!(*b_events.lock().unwrap(), vec![MessageEvent::LogHeartbeatSent]);

    let (plains, replies) = deliver(&mut a, heartbeat);
    assert!(plains.is_empty(), "heartbeats carry no text");
    assert!(replies.is_empty());
    assert_eq!(*a_events.lock().unwrap(), vec![MessageEvent::LogHeartbeatReceived]);
}

/// Test that ending a session finishes the peer and blocks further sends
#[test]
fn test_disconnect() {
    let mut a = alice();
    let mut b = bob();
    establish(&mut a, &mut b);
    let security = Arc::new(Mutex::new(Vec::new()));
    let sink = security.clone();
    b.set_security_event_handler(move |e: SecurityEvent| sink.lock().unwrap().push(e));
    let events = message_events(&mut b);

    let bye = a.end().unwrap();
    assert_eq!(a.message_state(), MessageState::Plaintext);
    deliver(&mut b, bye);

    assert_eq!(b.message_state(), MessageState::Finished);
    assert_eq!(b.ssid(), None);
    assert_eq!(*security.lock().unwrap(), vec![SecurityEvent::GoneInsecure]);

    assert!(b.send(b"still there?").unwrap().is_empty());
    assert_eq!(events.lock().unwrap().last(), Some(&MessageEvent::ConnectionEnded));

    b.end().unwrap();
    assert_eq!(b.message_state(), MessageState::Plaintext);
}

/// Test that policies persist as a plain number
#[test]
fn test_policies_serde() {
    let policies = Policies::default_policy();
    let json = serde_json::to_string(&policies).unwrap();
    assert_eq!(json, "51");
    let back: Policies = serde_json::from_str(&json).unwrap();
    assert_eq!(back, policies);
    assert!(back.has(Policies::ERROR_START_AKE));
}
