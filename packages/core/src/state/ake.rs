//! Authenticated key exchange.
//!
//! ```text
//!  Bob                                  Alice
//!   │ ── DH-Commit  AES_r(g^x), H(g^x) ──▶ │  None → AwaitingRevealSig
//!   │ ◀────────────── DH-Key  g^y ──────── │
//!   │ ── Reveal-Sig  r, AES_c(sigB), MAC ▶ │  AwaitingDhKey → AwaitingSig
//!   │ ◀──────── Sig  AES_c'(sigA), MAC ─── │  AwaitingRevealSig → None (done)
//! ```
//!
//! Every transition takes the current [`AuthState`] and yields the next one
//! plus an optional reply. On error the previous state is kept.

use crate::crypto::keys::{PrivateKey, PublicKey};
use crate::crypto::math::{is_group_element, mod_exp, mod_exp_g, random_bytes};
use crate::crypto::primitives::{aes_ctr_zero_iv, ct_eq, hmac_sha256, sha256, TRUNCATED_MAC_LEN};
use crate::crypto::secure_memory::{MemoryLock, Secret};
use crate::error::{OtrError, Result};
use crate::protocol::messages::{
    DhCommit, DhKey, RevealSig, Sig, MSG_TYPE_DH_COMMIT, MSG_TYPE_DH_KEY, MSG_TYPE_REVEAL_SIG, MSG_TYPE_SIG,
    REVEAL_KEY_LEN,
};
use crate::protocol::wire::{append_data, append_mpi, append_word, extract_mpi, extract_word};
use crate::state::keys::{calculate_ake_keys, AkeKeys, DhKeyPair, KeyManagementContext, Ssid};
use num_bigint::BigUint;
use rand_core::RngCore;
use std::sync::Arc;
use zeroize::Zeroize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    None,
    AwaitingDhKey,
    AwaitingRevealSig,
    /// Keeps the Reveal-Sig body so a repeated DH-Key gets the same answer.
    AwaitingSig { reveal_sig: Vec<u8> },
}

impl AuthState {
    pub fn name(&self) -> &'static str {
        match self {
            AuthState::None => "none",
            AuthState::AwaitingDhKey => "awaiting_dh_key",
            AuthState::AwaitingRevealSig => "awaiting_reveal_sig",
            AuthState::AwaitingSig { .. } => "awaiting_sig",
        }
    }
}

/// What the AKE borrows from its conversation for one call.
pub struct AkeEnv<'a> {
    pub rng: &'a mut dyn RngCore,
    pub our_key: &'a dyn PrivateKey,
    pub exponent_len: usize,
}

/// Result of feeding one AKE message: an optional (type, body) reply and
/// whether the exchange just completed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AkeStep {
    pub reply: Option<(u8, Vec<u8>)>,
    pub finished: bool,
}

impl AkeStep {
    fn reply(msg_type: u8, body: Vec<u8>) -> Self {
        Self {
            reply: Some((msg_type, body)),
            finished: false,
        }
    }

    fn ignore() -> Self {
        Self::default()
    }
}

/// Keys agreed on by a completed AKE.
pub struct AkeResult {
    pub ssid: Ssid,
    pub their_key: PublicKey,
    pub keys: KeyManagementContext,
}

pub struct AkeContext {
    state: AuthState,

    secret_exponent: Secret,
    our_public_value: Option<BigUint>,
    their_public_value: Option<BigUint>,

    r: Secret,
    encrypted_gx: Vec<u8>,
    hashed_gx: Vec<u8>,

    reveal_key: AkeKeys,
    sig_key: AkeKeys,
    ssid: Ssid,

    our_key_id: u32,
    their_key_id: u32,
    their_key: Option<PublicKey>,

    lock: Arc<dyn MemoryLock>,
}

impl AkeContext {
    pub fn new(lock: Arc<dyn MemoryLock>) -> Self {
        Self {
            state: AuthState::None,
            secret_exponent: Secret::default(),
            our_public_value: None,
            their_public_value: None,
            r: Secret::default(),
            encrypted_gx: Vec::new(),
            hashed_gx: Vec::new(),
            reveal_key: AkeKeys::default(),
            sig_key: AkeKeys::default(),
            ssid: [0u8; 8],
            our_key_id: 0,
            their_key_id: 0,
            their_key: None,
            lock,
        }
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    // ============================================
    // Генерация сообщений
    // ============================================

    fn init_exponent(&mut self, env: &mut AkeEnv<'_>) -> Result<()> {
        self.wipe();
        let mut x = random_bytes(env.rng, env.exponent_len)?;
        x.protect(&self.lock)?;
        self.our_public_value = Some(mod_exp_g(&x.to_biguint()));
        self.secret_exponent = x;
        Ok(())
    }

    fn our_public(&self) -> Result<&BigUint> {
        self.our_public_value
            .as_ref()
            .ok_or_else(|| OtrError::conflict("AKE has no local DH value"))
    }

    fn their_public(&self) -> Result<&BigUint> {
        self.their_public_value
            .as_ref()
            .ok_or_else(|| OtrError::conflict("AKE has no remote DH value"))
    }

    /// Starts a new exchange: fresh x and r, then the commitment to g^x.
    pub fn start(&mut self, env: &mut AkeEnv<'_>) -> Result<Vec<u8>> {
        use tracing::debug;

        self.init_exponent(env)?;
        let mut r = random_bytes(env.rng, REVEAL_KEY_LEN)?;
        r.protect(&self.lock)?;
        self.r = r;

        let gx_mpi = append_mpi(Vec::new(), self.our_public()?);
        self.encrypted_gx = aes_ctr_zero_iv(self.r.as_bytes(), &gx_mpi)?;
        self.hashed_gx = sha256(&gx_mpi).to_vec();

        debug!(target: "otr::ake", from = self.state.name(), to = "awaiting_dh_key", "starting AKE");
        self.state = AuthState::AwaitingDhKey;
        Ok(self.serialize_dh_commit())
    }

    fn serialize_dh_commit(&self) -> Vec<u8> {
        DhCommit {
            encrypted_gx: self.encrypted_gx.clone(),
            hashed_gx: self.hashed_gx.clone(),
        }
        .serialize()
    }

    fn serialize_dh_key(&self) -> Result<Vec<u8>> {
        Ok(DhKey {
            gy: self.our_public()?.clone(),
        }
        .serialize())
    }

    fn calculate_keys(&mut self) -> Result<()> {
        let s = mod_exp(self.their_public()?, &self.secret_exponent.to_biguint());
        let secbytes = Secret::new(append_mpi(Vec::new(), &s));
        let (ssid, reveal, sig) = calculate_ake_keys(&secbytes, &self.lock)?;
        self.ssid = ssid;
        self.reveal_key = reveal;
        self.sig_key = sig;
        Ok(())
    }

    /// HMAC(m1, g^ours || g^theirs || pub || keyid), signed, then AES(c, ...).
    fn encrypted_signature(&self, keys: &AkeKeys, env: &mut AkeEnv<'_>) -> Result<Vec<u8>> {
        let public = env.our_key.public_key().serialize();
        let mb = hmac_sha256(
            keys.m1.as_bytes(),
            &[
                &append_mpi(Vec::new(), self.our_public()?),
                &append_mpi(Vec::new(), self.their_public()?),
                &public,
                &append_word(Vec::new(), self.our_key_id),
            ],
        )?;
        let signature = env.our_key.sign(env.rng, &mb)?;

        let mut xb = append_word(public, self.our_key_id);
        xb.extend_from_slice(&signature);
        aes_ctr_zero_iv(keys.c.as_bytes(), &xb)
    }

    fn signature_mac(keys: &AkeKeys, encrypted_sig: &[u8]) -> Result<Vec<u8>> {
        let mac = hmac_sha256(keys.m2.as_bytes(), &[&append_data(Vec::new(), encrypted_sig)])?;
        Ok(mac[..TRUNCATED_MAC_LEN].to_vec())
    }

    fn reveal_sig_message(&mut self, env: &mut AkeEnv<'_>) -> Result<Vec<u8>> {
        self.calculate_keys()?;
        self.our_key_id = 1;
        let encrypted_sig = self.encrypted_signature(&self.reveal_key, env)?;
        let mac = Self::signature_mac(&self.reveal_key, &encrypted_sig)?;

        let mut r = [0u8; REVEAL_KEY_LEN];
        r.copy_from_slice(self.r.as_bytes());
        let body = RevealSig { r, encrypted_sig, mac }.serialize();
        r.zeroize();
        Ok(body)
    }

    fn sig_message(&mut self, env: &mut AkeEnv<'_>) -> Result<Vec<u8>> {
        self.our_key_id = 1;
        let encrypted_sig = self.encrypted_signature(&self.sig_key, env)?;
        let mac = Self::signature_mac(&self.sig_key, &encrypted_sig)?;
        Ok(Sig { encrypted_sig, mac }.serialize())
    }

    // ============================================
    // Обработка входящих сообщений
    // ============================================

    fn process_dh_commit(&mut self, msg: &[u8]) -> Result<()> {
        let commit = DhCommit::deserialize(msg)?;
        self.encrypted_gx = commit.encrypted_gx;
        self.hashed_gx = commit.hashed_gx;
        Ok(())
    }

    /// Returns true when the peer resent the g^y we already have.
    fn process_dh_key(&mut self, msg: &[u8]) -> Result<bool> {
        let DhKey { gy } = DhKey::deserialize(msg)?;
        if !is_group_element(&gy) {
            return Err(OtrError::verification("DH value out of range"));
        }
        if let Some(known) = &self.their_public_value {
            return Ok(*known == gy);
        }
        self.their_public_value = Some(gy);
        Ok(false)
    }

    fn process_reveal_sig(&mut self, msg: &[u8]) -> Result<()> {
        let reveal = RevealSig::deserialize(msg)?;

        let gx_mpi = aes_ctr_zero_iv(&reveal.r, &self.encrypted_gx)?;
        if !ct_eq(&sha256(&gx_mpi), &self.hashed_gx) {
            return Err(OtrError::verification("bad commitment MAC in reveal signature message"));
        }
        let gx = match extract_mpi(&gx_mpi) {
            Some((rest, gx)) if rest.is_empty() => gx,
            _ => return Err(OtrError::malformed("gx corrupt after decryption")),
        };
        if !is_group_element(&gx) {
            return Err(OtrError::verification("DH value out of range"));
        }

        self.r = Secret::from_slice(&reveal.r);
        self.r.protect(&self.lock)?;
        self.their_public_value = Some(gx);
        self.calculate_keys()?;

        let keys = std::mem::take(&mut self.reveal_key);
        let outcome = self.process_encrypted_sig(&reveal.encrypted_sig, &reveal.mac, &keys);
        self.reveal_key = keys;
        outcome
    }

    fn process_sig(&mut self, msg: &[u8]) -> Result<()> {
        let sig = Sig::deserialize(msg)?;
        let keys = std::mem::take(&mut self.sig_key);
        let outcome = self.process_encrypted_sig(&sig.encrypted_sig, &sig.mac, &keys);
        self.sig_key = keys;
        outcome
    }

    fn process_encrypted_sig(&mut self, encrypted_sig: &[u8], mac: &[u8], keys: &AkeKeys) -> Result<()> {
        let expected = Self::signature_mac(keys, encrypted_sig)?;
        if !ct_eq(&expected, mac) {
            return Err(OtrError::verification("bad signature MAC in encrypted signature"));
        }

        let decrypted = aes_ctr_zero_iv(keys.c.as_bytes(), encrypted_sig)?;
        let (rest, their_key) =
            PublicKey::parse(&decrypted).ok_or_else(|| OtrError::malformed("corrupt public key in signature"))?;
        let (sig, key_id) = extract_word(rest).ok_or_else(|| OtrError::malformed("corrupt key id in signature"))?;
        if key_id == 0 {
            return Err(OtrError::malformed("zero key id in signature"));
        }

        let mb = hmac_sha256(
            keys.m1.as_bytes(),
            &[
                &append_mpi(Vec::new(), self.their_public()?),
                &append_mpi(Vec::new(), self.our_public()?),
                &their_key.serialize(),
                &append_word(Vec::new(), key_id),
            ],
        )?;
        match their_key.verify(&mb, sig) {
            Some(rest) if rest.is_empty() => {}
            _ => return Err(OtrError::verification("bad signature in encrypted signature")),
        }

        self.their_key = Some(their_key);
        self.their_key_id = key_id;
        Ok(())
    }

    // ============================================
    // Машина состояний
    // ============================================

    /// Feeds one AKE message body of type `msg_type`.
    pub fn receive(&mut self, msg_type: u8, msg: &[u8], env: &mut AkeEnv<'_>) -> Result<AkeStep> {
        use tracing::debug;

        let current = std::mem::replace(&mut self.state, AuthState::None);
        match self.transition(&current, msg_type, msg, env) {
            Ok((next, step)) => {
                if next != current {
                    debug!(
                        target: "otr::ake",
                        msg_type,
                        from = current.name(),
                        to = next.name(),
                        finished = step.finished,
                        "auth state transition"
                    );
                }
                self.state = next;
                Ok(step)
            }
            Err(e) => {
                debug!(target: "otr::ake", msg_type, state = current.name(), error = %e, "AKE message rejected");
                self.state = current;
                Err(e)
            }
        }
    }

    fn transition(
        &mut self,
        current: &AuthState,
        msg_type: u8,
        msg: &[u8],
        env: &mut AkeEnv<'_>,
    ) -> Result<(AuthState, AkeStep)> {
        match (current, msg_type) {
            (AuthState::None, MSG_TYPE_DH_COMMIT) | (AuthState::AwaitingSig { .. }, MSG_TYPE_DH_COMMIT) => {
                self.accept_commit(msg, env)
            }

            (AuthState::AwaitingDhKey, MSG_TYPE_DH_COMMIT) => {
                let theirs = DhCommit::deserialize(msg)?;
                if self.hashed_gx.as_slice() > theirs.hashed_gx.as_slice() {
                    Ok((
                        AuthState::AwaitingDhKey,
                        AkeStep::reply(MSG_TYPE_DH_COMMIT, self.serialize_dh_commit()),
                    ))
                } else {
                    self.accept_commit(msg, env)
                }
            }

            (AuthState::AwaitingRevealSig, MSG_TYPE_DH_COMMIT) => {
                self.process_dh_commit(msg)?;
                Ok((
                    AuthState::AwaitingRevealSig,
                    AkeStep::reply(MSG_TYPE_DH_KEY, self.serialize_dh_key()?),
                ))
            }

            (AuthState::AwaitingDhKey, MSG_TYPE_DH_KEY) => {
                self.process_dh_key(msg)?;
                let reveal_sig = match self.reveal_sig_message(env) {
                    Ok(body) => body,
                    Err(e) => {
                        // Still awaiting a DH-Key; the next one must not be
                        // compared against this g^y.
                        self.their_public_value = None;
                        return Err(e);
                    }
                };
                Ok((
                    AuthState::AwaitingSig {
                        reveal_sig: reveal_sig.clone(),
                    },
                    AkeStep::reply(MSG_TYPE_REVEAL_SIG, reveal_sig),
                ))
            }

            (AuthState::AwaitingSig { reveal_sig }, MSG_TYPE_DH_KEY) => {
                let step = if self.process_dh_key(msg)? {
                    AkeStep::reply(MSG_TYPE_REVEAL_SIG, reveal_sig.clone())
                } else {
                    AkeStep::ignore()
                };
                Ok((current.clone(), step))
            }

            (AuthState::AwaitingRevealSig, MSG_TYPE_REVEAL_SIG) => {
                self.process_reveal_sig(msg)?;
                let sig = self.sig_message(env)?;
                let mut step = AkeStep::reply(MSG_TYPE_SIG, sig);
                step.finished = true;
                Ok((AuthState::None, step))
            }

            (AuthState::AwaitingSig { .. }, MSG_TYPE_SIG) => {
                self.process_sig(msg)?;
                Ok((
                    AuthState::None,
                    AkeStep {
                        reply: None,
                        finished: true,
                    },
                ))
            }

            _ => Ok((current.clone(), AkeStep::ignore())),
        }
    }

    /// A commitment from the peer restarts the exchange on our side with a
    /// fresh g^y.
    fn accept_commit(&mut self, msg: &[u8], env: &mut AkeEnv<'_>) -> Result<(AuthState, AkeStep)> {
        let commit = DhCommit::deserialize(msg)?;
        self.init_exponent(env)?;
        self.encrypted_gx = commit.encrypted_gx;
        self.hashed_gx = commit.hashed_gx;
        Ok((
            AuthState::AwaitingRevealSig,
            AkeStep::reply(MSG_TYPE_DH_KEY, self.serialize_dh_key()?),
        ))
    }

    /// Hands over what a finished exchange agreed on and wipes the rest.
    pub fn take_result(&mut self, max_pending_mac_keys: usize) -> Result<AkeResult> {
        let their_key = self
            .their_key
            .take()
            .ok_or_else(|| OtrError::conflict("AKE has not completed"))?;
        let their_public = self.their_public()?.clone();
        let our_public = self.our_public()?.clone();
        let private = std::mem::take(&mut self.secret_exponent);

        let keys = KeyManagementContext::seeded(
            Arc::clone(&self.lock),
            max_pending_mac_keys,
            (self.our_key_id, DhKeyPair::from_parts(private, our_public)),
            (self.their_key_id, their_public),
        );
        let ssid = self.ssid;
        self.wipe();

        Ok(AkeResult { ssid, their_key, keys })
    }

    /// Forgets the in-progress exchange. The state itself is left alone.
    pub fn wipe(&mut self) {
        self.secret_exponent.zeroize();
        self.our_public_value = None;
        self.their_public_value = None;
        self.r.zeroize();
        self.encrypted_gx.clear();
        self.hashed_gx.clear();
        self.reveal_key.zeroize();
        self.sig_key.zeroize();
        self.ssid.zeroize();
        self.our_key_id = 0;
        self.their_key_id = 0;
        self.their_key = None;
    }

    /// Drops the exchange and goes back to [`AuthState::None`].
    pub fn reset(&mut self) {
        self.wipe();
        self.state = AuthState::None;
    }
}

impl Zeroize for AkeContext {
    fn zeroize(&mut self) {
        self.reset();
    }
}
