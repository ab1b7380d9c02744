//! Контекст управления ключами: DH ratchet, счётчики и раскрытие MAC ключей.
//!
//! ```text
//! our:   previous (id-1) ── current (id)      ← ротация при recipient_key_id == id
//! their: previous (id-1) ── current (id)      ← ротация при sender_key_id == id
//! ```
//!
//! Сессионный ключ для пары (our, their) вычислим, пока обе стороны держат
//! один из двух последних ключей. Счётчики ведутся отдельно на каждую пару.

use crate::crypto::math::{mod_exp, mod_exp_g, random_bytes};
use crate::crypto::primitives::{sha1, sha1_prefixed, sha256_prefixed, AES_KEY_LEN};
use crate::crypto::secure_memory::{MemoryLock, Secret};
use crate::error::{OtrError, Result};
use crate::protocol::messages::{MacKey, MAC_KEY_LEN, REVEAL_KEY_LEN};
use crate::protocol::wire::append_mpi;
use num_bigint::BigUint;
use rand_core::RngCore;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroize;

const SSID_LEN: usize = 8;

pub type Ssid = [u8; SSID_LEN];

// ============================================
// DH пары и производные ключи
// ============================================

/// A DH key pair. The private exponent is pinned and wiped on drop.
pub struct DhKeyPair {
    pub public: BigUint,
    private: Secret,
}

impl DhKeyPair {
    pub fn generate(rng: &mut dyn RngCore, exponent_len: usize, lock: &Arc<dyn MemoryLock>) -> Result<Self> {
        let mut private = random_bytes(rng, exponent_len)?;
        private.protect(lock)?;
        let public = mod_exp_g(&private.to_biguint());
        Ok(Self { public, private })
    }

    /// Adopts an exponent drawn elsewhere, e.g. during the AKE.
    pub fn from_parts(private: Secret, public: BigUint) -> Self {
        Self { public, private }
    }

    pub fn private(&self) -> &Secret {
        &self.private
    }

    /// g^(their * our) mod p, as its MPI encoding.
    pub fn shared_secret(&self, their_public: &BigUint) -> Secret {
        let s = mod_exp(their_public, &self.private.to_biguint());
        Secret::new(append_mpi(Vec::new(), &s))
    }
}

impl Zeroize for DhKeyPair {
    fn zeroize(&mut self) {
        self.private.zeroize();
        self.public = BigUint::default();
    }
}

/// Keys for one direction pair of data messages. Recomputed per message.
#[derive(Debug)]
pub struct SessionKeys {
    pub sending_aes_key: Secret,
    pub receiving_aes_key: Secret,
    pub sending_mac_key: Secret,
    pub receiving_mac_key: Secret,
    pub extra_key: Secret,
}

impl SessionKeys {
    /// The side with the larger public value uses 0x01 for sending.
    pub fn derive(our: &DhKeyPair, their_public: &BigUint, lock: &Arc<dyn MemoryLock>) -> Result<Self> {
        let (send_byte, recv_byte) = if our.public > *their_public {
            (0x01, 0x02)
        } else {
            (0x02, 0x01)
        };

        let secbytes = our.shared_secret(their_public);
        let secbytes = secbytes.as_bytes();

        let mut sending_aes_key = Secret::from_slice(&sha1_prefixed(send_byte, secbytes)[..AES_KEY_LEN]);
        let mut receiving_aes_key = Secret::from_slice(&sha1_prefixed(recv_byte, secbytes)[..AES_KEY_LEN]);
        let mut sending_mac_key = Secret::from_slice(&sha1(sending_aes_key.as_bytes()));
        let mut receiving_mac_key = Secret::from_slice(&sha1(receiving_aes_key.as_bytes()));
        let mut extra_key = Secret::from_slice(&sha256_prefixed(0xFF, secbytes));

        for key in [
            &mut sending_aes_key,
            &mut receiving_aes_key,
            &mut sending_mac_key,
            &mut receiving_mac_key,
            &mut extra_key,
        ] {
            key.protect(lock)?;
        }

        Ok(Self {
            sending_aes_key,
            receiving_aes_key,
            sending_mac_key,
            receiving_mac_key,
            extra_key,
        })
    }
}

impl Zeroize for SessionKeys {
    fn zeroize(&mut self) {
        self.sending_aes_key.zeroize();
        self.receiving_aes_key.zeroize();
        self.sending_mac_key.zeroize();
        self.receiving_mac_key.zeroize();
        self.extra_key.zeroize();
    }
}

/// One AKE key bundle: AES key `c` and the MAC keys `m1`, `m2`.
#[derive(Default)]
pub struct AkeKeys {
    pub c: Secret,
    pub m1: Secret,
    pub m2: Secret,
}

impl Zeroize for AkeKeys {
    fn zeroize(&mut self) {
        self.c.zeroize();
        self.m1.zeroize();
        self.m2.zeroize();
    }
}

/// Hash ladder h(b) = SHA-256(b || MPI(s)) over the AKE shared secret.
/// Returns (ssid, reveal keys, signature keys).
pub fn calculate_ake_keys(secbytes: &Secret, lock: &Arc<dyn MemoryLock>) -> Result<(Ssid, AkeKeys, AkeKeys)> {
    let h = |b: u8| sha256_prefixed(b, secbytes.as_bytes());

    let mut ssid = [0u8; SSID_LEN];
    ssid.copy_from_slice(&h(0x00)[..SSID_LEN]);

    let h1 = h(0x01);
    let mut reveal = AkeKeys {
        c: Secret::from_slice(&h1[..REVEAL_KEY_LEN]),
        m1: Secret::from_slice(&h(0x02)),
        m2: Secret::from_slice(&h(0x03)),
    };
    let mut sig = AkeKeys {
        c: Secret::from_slice(&h1[REVEAL_KEY_LEN..]),
        m1: Secret::from_slice(&h(0x04)),
        m2: Secret::from_slice(&h(0x05)),
    };

    for key in [
        &mut reveal.c,
        &mut reveal.m1,
        &mut reveal.m2,
        &mut sig.c,
        &mut sig.m1,
        &mut sig.m2,
    ] {
        key.protect(lock)?;
    }

    Ok((ssid, reveal, sig))
}

// ============================================
// История счётчиков и MAC ключей
// ============================================

#[derive(Debug, Clone, Copy)]
struct KeyPairCounter {
    our_key_id: u32,
    their_key_id: u32,
    our_counter: u64,
    their_counter: u64,
}

struct MacKeyUsage {
    our_key_id: u32,
    their_key_id: u32,
    receiving_key: Secret,
}

/// Bounded FIFO of MAC keys waiting to be published with the next data message.
#[derive(Debug)]
pub struct MacKeyQueue {
    keys: VecDeque<MacKey>,
    bound: usize,
}

impl MacKeyQueue {
    pub fn new(bound: usize) -> Self {
        Self {
            keys: VecDeque::new(),
            bound,
        }
    }

    pub fn push(&mut self, key: MacKey) {
        if self.bound == 0 {
            return;
        }
        while self.keys.len() >= self.bound {
            debug!(target: "otr::keys", bound = self.bound, "disclosure queue full, dropping oldest MAC key");
            self.keys.pop_front();
        }
        self.keys.push_back(key);
    }

    /// Takes every queued key; the queue is empty afterwards.
    pub fn drain(&mut self) -> Vec<MacKey> {
        self.keys.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// ============================================
// KeyManagementContext
// ============================================

pub struct KeyManagementContext {
    pub our_key_id: u32,
    pub their_key_id: u32,

    our_current: Option<DhKeyPair>,
    our_previous: Option<DhKeyPair>,
    their_current: Option<BigUint>,
    their_previous: Option<BigUint>,

    counters: Vec<KeyPairCounter>,
    mac_history: Vec<MacKeyUsage>,
    pending_reveal: MacKeyQueue,

    lock: Arc<dyn MemoryLock>,
}

impl KeyManagementContext {
    pub fn new(lock: Arc<dyn MemoryLock>, max_pending_mac_keys: usize) -> Self {
        Self {
            our_key_id: 0,
            their_key_id: 0,
            our_current: None,
            our_previous: None,
            their_current: None,
            their_previous: None,
            counters: Vec::new(),
            mac_history: Vec::new(),
            pending_reveal: MacKeyQueue::new(max_pending_mac_keys),
            lock,
        }
    }

    /// A context holding the pairs the AKE agreed on.
    pub fn seeded(
        lock: Arc<dyn MemoryLock>,
        max_pending_mac_keys: usize,
        ours: (u32, DhKeyPair),
        theirs: (u32, BigUint),
    ) -> Self {
        let mut keys = Self::new(lock, max_pending_mac_keys);
        keys.our_key_id = ours.0;
        keys.our_current = Some(ours.1);
        keys.their_key_id = theirs.0;
        keys.their_current = Some(theirs.1);
        keys
    }

    pub fn set_their_current(&mut self, public: BigUint) {
        self.their_current = Some(public);
    }

    pub fn our_current_public(&self) -> Option<&BigUint> {
        self.our_current.as_ref().map(|k| &k.public)
    }

    pub fn their_current_public(&self) -> Option<&BigUint> {
        self.their_current.as_ref()
    }

    /// Retires the current pair and makes a fresh one current.
    pub fn generate_new_dh_key_pair(&mut self, rng: &mut dyn RngCore, exponent_len: usize) -> Result<()> {
        let fresh = DhKeyPair::generate(rng, exponent_len, &self.lock)?;
        if let Some(mut retired) = std::mem::replace(&mut self.our_previous, self.our_current.take()) {
            retired.zeroize();
        }
        self.our_current = Some(fresh);
        self.our_key_id = self.our_key_id.wrapping_add(1);

        debug!(target: "otr::keys", our_key_id = self.our_key_id, "generated new DH key pair");
        Ok(())
    }

    fn pick_our_keys(&self, key_id: u32) -> Result<&DhKeyPair> {
        if key_id == 0 || self.our_key_id == 0 {
            return Err(OtrError::conflict("invalid key id for local peer"));
        }
        let found = if key_id == self.our_key_id {
            self.our_current.as_ref()
        } else if key_id == self.our_key_id - 1 {
            self.our_previous.as_ref()
        } else {
            None
        };
        found.ok_or_else(|| OtrError::conflict("unexpected key id for local peer"))
    }

    fn pick_their_key(&self, key_id: u32) -> Result<&BigUint> {
        if key_id == 0 || self.their_key_id == 0 {
            return Err(OtrError::conflict("invalid key id for remote peer"));
        }
        let found = if key_id == self.their_key_id {
            self.their_current.as_ref()
        } else if key_id == self.their_key_id - 1 {
            self.their_previous.as_ref()
        } else {
            None
        };
        found.ok_or_else(|| OtrError::conflict("unexpected key id for remote peer"))
    }

    /// Derives the session keys for (our_key_id, their_key_id) and remembers
    /// the receiving MAC key so it can be disclosed once the pair retires.
    pub fn calculate_session_keys(&mut self, our_key_id: u32, their_key_id: u32) -> Result<SessionKeys> {
        let our = self.pick_our_keys(our_key_id)?;
        let their = self.pick_their_key(their_key_id)?;
        let keys = SessionKeys::derive(our, their, &self.lock)?;

        let known = self
            .mac_history
            .iter()
            .any(|u| u.our_key_id == our_key_id && u.their_key_id == their_key_id);
        if !known {
            let mut receiving_key = keys.receiving_mac_key.try_clone(&self.lock)?;
            receiving_key.protect(&self.lock)?;
            self.mac_history.push(MacKeyUsage {
                our_key_id,
                their_key_id,
                receiving_key,
            });
        }
        Ok(keys)
    }

    fn counter_entry(&mut self, our_key_id: u32, their_key_id: u32) -> &mut KeyPairCounter {
        let pos = self
            .counters
            .iter()
            .position(|c| c.our_key_id == our_key_id && c.their_key_id == their_key_id);
        let idx = match pos {
            Some(idx) => idx,
            None => {
                self.counters.push(KeyPairCounter {
                    our_key_id,
                    their_key_id,
                    our_counter: 0,
                    their_counter: 0,
                });
                self.counters.len() - 1
            }
        };
        &mut self.counters[idx]
    }

    /// Counter for the next outgoing message under (our_key_id - 1, their_key_id).
    pub fn next_send_counter(&mut self) -> [u8; 8] {
        let (our, their) = (self.our_key_id.wrapping_sub(1), self.their_key_id);
        let entry = self.counter_entry(our, their);
        if entry.our_counter == 0 {
            entry.our_counter = 1;
        }
        let ctr = entry.our_counter;
        entry.our_counter += 1;
        ctr.to_be_bytes()
    }

    /// Rejects a counter not above the last accepted one for this key pair.
    pub fn check_message_counter(&self, recipient_key_id: u32, sender_key_id: u32, counter: u64) -> Result<()> {
        let last = self
            .counters
            .iter()
            .find(|c| c.our_key_id == recipient_key_id && c.their_key_id == sender_key_id)
            .map(|c| c.their_counter)
            .unwrap_or(0);
        if counter <= last {
            debug!(
                target: "otr::keys",
                recipient_key_id,
                sender_key_id,
                counter,
                last,
                "rejecting replayed counter"
            );
            return Err(OtrError::conflict("counter regressed"));
        }
        Ok(())
    }

    /// Records a counter once its message authenticated.
    pub fn accept_message_counter(&mut self, recipient_key_id: u32, sender_key_id: u32, counter: u64) {
        self.counter_entry(recipient_key_id, sender_key_id).their_counter = counter;
    }

    /// The peer used our current key, so we can move on to a fresh one.
    pub fn rotate_our_keys(
        &mut self,
        recipient_key_id: u32,
        rng: &mut dyn RngCore,
        exponent_len: usize,
    ) -> Result<()> {
        if recipient_key_id != self.our_key_id {
            return Ok(());
        }
        let retiring = self.our_key_id.wrapping_sub(1);
        self.retire_mac_keys(|u| u.our_key_id == retiring);
        self.generate_new_dh_key_pair(rng, exponent_len)?;
        self.prune_counters();
        Ok(())
    }

    /// The peer announced a new public value with its current key id.
    pub fn rotate_their_key(&mut self, sender_key_id: u32, next_public: BigUint) {
        if sender_key_id != self.their_key_id {
            return;
        }
        let retiring = self.their_key_id.wrapping_sub(1);
        self.retire_mac_keys(|u| u.their_key_id == retiring);

        self.their_previous = self.their_current.replace(next_public);
        self.their_key_id = self.their_key_id.wrapping_add(1);
        self.prune_counters();

        debug!(target: "otr::keys", their_key_id = self.their_key_id, "rotated peer DH key");
    }

    fn retire_mac_keys(&mut self, retired: impl Fn(&MacKeyUsage) -> bool) {
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.mac_history).into_iter().partition(|u| retired(u));
        self.mac_history = kept;
        for mut usage in gone {
            let mut key = [0u8; MAC_KEY_LEN];
            let bytes = usage.receiving_key.as_bytes();
            if bytes.len() == MAC_KEY_LEN {
                key.copy_from_slice(bytes);
                self.pending_reveal.push(key);
            }
            usage.receiving_key.zeroize();
        }
    }

    /// Counters for key ids that can no longer be picked are unreachable.
    fn prune_counters(&mut self) {
        let min_our = self.our_key_id.saturating_sub(1);
        let min_their = self.their_key_id.saturating_sub(1);
        self.counters
            .retain(|c| c.our_key_id >= min_our && c.their_key_id >= min_their);
    }

    /// Keys to publish with the next outgoing data message. Drains the queue.
    pub fn reveal_mac_keys(&mut self) -> Vec<MacKey> {
        self.pending_reveal.drain()
    }

    pub fn pending_mac_keys(&self) -> usize {
        self.pending_reveal.len()
    }
}

impl Zeroize for KeyManagementContext {
    fn zeroize(&mut self) {
        for pair in [self.our_current.as_mut(), self.our_previous.as_mut()].into_iter().flatten() {
            pair.zeroize();
        }
        self.our_current = None;
        self.our_previous = None;
        self.their_current = None;
        self.their_previous = None;
        for usage in self.mac_history.iter_mut() {
            usage.receiving_key.zeroize();
        }
        self.mac_history.clear();
        self.counters.clear();
        self.pending_reveal.drain();
        self.our_key_id = 0;
        self.their_key_id = 0;
    }
}
