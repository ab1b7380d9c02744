//! Socialist Millionaires' Protocol over data message TLVs.
//!
//! ```text
//!  initiator (a)                           responder (b)
//!   Expect1 ── SMP1 g2a, g3a ─────────────▶ Expect1 → WaitingForSecret
//!   Expect2 ◀── SMP2 g2b, g3b, Pb, Qb ──── WaitingForSecret → Expect3
//!   Expect4 ── SMP3 Pa, Qa, Ra ───────────▶ Expect3 → Expect1 (Ra^b3 == Pa/Pb)
//!   Expect1 ◀── SMP4 Rb ────────────────── (Rb^a3 == Pa/Pb)
//! ```
//!
//! Per-step secrets live inside the state variant that needs them, so moving
//! to another state drops (and wipes) them.

use crate::api::events::SmpEvent;
use crate::crypto::math::{div_mod, is_group_element, mod_exp, mod_exp_g, mul_mod, p, q, random_bytes, sub_mod};
use crate::crypto::primitives::sha256_prefixed;
use crate::crypto::secure_memory::{wipe_biguint, MemoryLock, Secret};
use crate::error::{OtrError, Result};
use crate::protocol::tlv::{SmpMessage, SmpMessage1, SmpMessage2, SmpMessage3, SmpMessage4};
use crate::protocol::wire::append_mpis;
use num_bigint::BigUint;
use rand_core::RngCore;
use std::sync::Arc;
use zeroize::Zeroize;

const SMP_SECRET_VERSION: u8 = 0x01;

pub const PROGRESS_ASK: u8 = 25;
pub const PROGRESS_IN_PROGRESS: u8 = 60;
pub const PROGRESS_DONE: u8 = 100;

/// x = SHA-256(1 || initiator fp || responder fp || ssid || user secret)
pub fn smp_secret(initiator_fp: &[u8], responder_fp: &[u8], ssid: &[u8], user_secret: &[u8]) -> Secret {
    let mut input = Vec::with_capacity(initiator_fp.len() + responder_fp.len() + ssid.len() + user_secret.len());
    input.extend_from_slice(initiator_fp);
    input.extend_from_slice(responder_fp);
    input.extend_from_slice(ssid);
    input.extend_from_slice(user_secret);
    let secret = Secret::from_slice(&sha256_prefixed(SMP_SECRET_VERSION, &input));
    input.zeroize();
    secret
}

// ============================================
// Состояния и их секреты
// ============================================

/// Initiator after sending SMP1.
pub struct Smp1State {
    a2: Secret,
    a3: Secret,
}

/// Responder after sending SMP2.
pub struct Smp2State {
    b3: Secret,
    g2: BigUint,
    g3: BigUint,
    g3a: BigUint,
    pb: BigUint,
    qb: BigUint,
}

/// Initiator after sending SMP3.
pub struct Smp3State {
    a3: Secret,
    g3b: BigUint,
    papb: BigUint,
    qaqb: BigUint,
}

impl Zeroize for Smp1State {
    fn zeroize(&mut self) {
        self.a2.zeroize();
        self.a3.zeroize();
    }
}

impl Zeroize for Smp2State {
    fn zeroize(&mut self) {
        self.b3.zeroize();
        for v in [&mut self.g2, &mut self.g3, &mut self.g3a, &mut self.pb, &mut self.qb] {
            wipe_biguint(v);
        }
    }
}

impl Zeroize for Smp3State {
    fn zeroize(&mut self) {
        self.a3.zeroize();
        for v in [&mut self.g3b, &mut self.papb, &mut self.qaqb] {
            wipe_biguint(v);
        }
    }
}

pub enum SmpState {
    Expect1,
    WaitingForSecret { msg1: SmpMessage1 },
    Expect2 { s1: Smp1State },
    Expect3 { s2: Smp2State },
    Expect4 { s3: Smp3State },
}

impl SmpState {
    pub fn name(&self) -> &'static str {
        match self {
            SmpState::Expect1 => "expect1",
            SmpState::WaitingForSecret { .. } => "waiting_for_secret",
            SmpState::Expect2 { .. } => "expect2",
            SmpState::Expect3 { .. } => "expect3",
            SmpState::Expect4 { .. } => "expect4",
        }
    }
}

impl Zeroize for SmpState {
    fn zeroize(&mut self) {
        match self {
            SmpState::Expect1 | SmpState::WaitingForSecret { .. } => {}
            SmpState::Expect2 { s1 } => s1.zeroize(),
            SmpState::Expect3 { s2 } => s2.zeroize(),
            SmpState::Expect4 { s3 } => s3.zeroize(),
        }
        *self = SmpState::Expect1;
    }
}

// ============================================
// Результат шага
// ============================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmpNotice {
    pub event: SmpEvent,
    pub progress: u8,
    pub question: Option<String>,
}

impl SmpNotice {
    fn new(event: SmpEvent, progress: u8) -> Self {
        Self {
            event,
            progress,
            question: None,
        }
    }
}

/// Messages to send to the peer and the event to raise locally.
#[derive(Debug, Default)]
pub struct SmpStep {
    pub reply: Vec<SmpMessage>,
    pub notice: Option<SmpNotice>,
}

/// What the SMP engine borrows from its conversation for one call.
pub struct SmpEnv<'a> {
    pub rng: &'a mut dyn RngCore,
    pub parameter_len: usize,
}

// ============================================
// SmpContext
// ============================================

pub struct SmpContext {
    state: SmpState,
    secret: Option<Secret>,
    question: Option<String>,
    lock: Arc<dyn MemoryLock>,
}

impl SmpContext {
    pub fn new(lock: Arc<dyn MemoryLock>) -> Self {
        Self {
            state: SmpState::Expect1,
            secret: None,
            question: None,
            lock,
        }
    }

    pub fn state(&self) -> &SmpState {
        &self.state
    }

    /// Question the peer attached to its SMP1, if any.
    pub fn question(&self) -> Option<&str> {
        self.question.as_deref()
    }

    /// Begins a run. A run already in progress is aborted first.
    pub fn start(&mut self, env: &mut SmpEnv<'_>, secret: Secret, question: Option<&str>) -> Result<Vec<SmpMessage>> {
        use tracing::debug;

        let mut out = Vec::new();
        if !matches!(self.state, SmpState::Expect1) {
            debug!(target: "otr::smp", state = self.state.name(), "restarting SMP, aborting current run");
            self.wipe();
            out.push(SmpMessage::Abort);
        }

        let (s1, msg1) = self.generate_smp1(env, question)?;
        self.secret = Some(secret);
        self.set_state(SmpState::Expect2 { s1 });
        out.push(SmpMessage::One(msg1));
        Ok(out)
    }

    /// Answers a pending SMP1 with the local secret.
    pub fn provide_secret(&mut self, env: &mut SmpEnv<'_>, secret: Secret) -> Result<SmpStep> {
        let msg1 = match std::mem::replace(&mut self.state, SmpState::Expect1) {
            SmpState::WaitingForSecret { msg1 } => msg1,
            mut other => {
                other.zeroize();
                self.wipe();
                return Err(OtrError::CannotAuthenticate("not expecting an SMP secret".into()));
            }
        };

        let (s2, msg2) = self.generate_smp2(env, &secret, &msg1)?;
        self.secret = Some(secret);
        self.set_state(SmpState::Expect3 { s2 });
        Ok(SmpStep {
            reply: vec![SmpMessage::Two(msg2)],
            notice: None,
        })
    }

    /// Local abort: forget everything and tell the peer.
    pub fn abort(&mut self) -> SmpMessage {
        self.wipe();
        SmpMessage::Abort
    }

    pub fn receive(&mut self, env: &mut SmpEnv<'_>, msg: SmpMessage) -> Result<SmpStep> {
        use tracing::debug;

        let state = std::mem::replace(&mut self.state, SmpState::Expect1);
        match (state, msg) {
            (_, SmpMessage::Abort) => {
                debug!(target: "otr::smp", "peer aborted SMP");
                self.wipe();
                Ok(SmpStep {
                    reply: Vec::new(),
                    notice: Some(SmpNotice::new(SmpEvent::Abort, 0)),
                })
            }

            (SmpState::Expect1, SmpMessage::One(msg1)) => {
                if let Err(e) = verify_smp1(&msg1) {
                    return Ok(self.cheated(&e));
                }
                let notice = match &msg1.question {
                    Some(question) => SmpNotice {
                        event: SmpEvent::AskForAnswer,
                        progress: PROGRESS_ASK,
                        question: Some(question.clone()),
                    },
                    None => SmpNotice::new(SmpEvent::AskForSecret, PROGRESS_ASK),
                };
                self.question = msg1.question.clone();
                self.set_state(SmpState::WaitingForSecret { msg1 });
                Ok(SmpStep {
                    reply: Vec::new(),
                    notice: Some(notice),
                })
            }

            (SmpState::Expect2 { mut s1 }, SmpMessage::Two(msg2)) => {
                let (g2, g3) = match verify_smp2(&s1, &msg2) {
                    Ok(generators) => generators,
                    Err(e) => {
                        s1.zeroize();
                        return Ok(self.cheated(&e));
                    }
                };
                let (s3, msg3) = self.generate_smp3(env, s1, &g2, &g3, &msg2)?;
                self.set_state(SmpState::Expect4 { s3 });
                Ok(SmpStep {
                    reply: vec![SmpMessage::Three(msg3)],
                    notice: Some(SmpNotice::new(SmpEvent::InProgress, PROGRESS_IN_PROGRESS)),
                })
            }

            (SmpState::Expect3 { mut s2 }, SmpMessage::Three(msg3)) => {
                if let Err(e) = verify_smp3(&s2, &msg3) {
                    s2.zeroize();
                    return Ok(self.cheated(&e));
                }
                let success = smp3_protocol_success(&s2, &msg3);
                let msg4 = generate_smp4(env, &self.lock, &s2, &msg3)?;
                s2.zeroize();
                self.wipe();
                Ok(SmpStep {
                    reply: vec![SmpMessage::Four(msg4)],
                    notice: Some(self.finished(success)),
                })
            }

            (SmpState::Expect4 { mut s3 }, SmpMessage::Four(msg4)) => {
                if let Err(e) = verify_smp4(&s3, &msg4) {
                    s3.zeroize();
                    return Ok(self.cheated(&e));
                }
                let success = smp4_protocol_success(&s3, &msg4);
                s3.zeroize();
                self.wipe();
                Ok(SmpStep {
                    reply: Vec::new(),
                    notice: Some(self.finished(success)),
                })
            }

            (mut state, _) => {
                debug!(target: "otr::smp", state = state.name(), "unexpected SMP message, aborting");
                state.zeroize();
                self.wipe();
                Ok(SmpStep {
                    reply: vec![SmpMessage::Abort],
                    notice: Some(SmpNotice::new(SmpEvent::Error, 0)),
                })
            }
        }
    }

    fn set_state(&mut self, next: SmpState) {
        use tracing::debug;

        debug!(target: "otr::smp", to = next.name(), "SMP state transition");
        let mut previous = std::mem::replace(&mut self.state, next);
        previous.zeroize();
    }

    fn cheated(&mut self, err: &OtrError) -> SmpStep {
        use tracing::warn;

        warn!(target: "otr::smp", error = %err, "SMP proof did not verify");
        self.wipe();
        SmpStep {
            reply: vec![SmpMessage::Abort],
            notice: Some(SmpNotice::new(SmpEvent::Cheated, 0)),
        }
    }

    fn finished(&self, success: bool) -> SmpNotice {
        use tracing::debug;

        debug!(target: "otr::smp", success, "SMP run finished");
        let event = if success { SmpEvent::Success } else { SmpEvent::Failure };
        SmpNotice::new(event, PROGRESS_DONE)
    }

    /// Back to `Expect1` with every secret wiped.
    pub fn wipe(&mut self) {
        self.state.zeroize();
        if let Some(mut secret) = self.secret.take() {
            secret.zeroize();
        }
        self.question = None;
    }

    #[cfg(test)]
    pub(crate) fn holds_secrets(&self) -> bool {
        self.secret.is_some() || !matches!(self.state, SmpState::Expect1)
    }

    fn random_exponent(&self, env: &mut SmpEnv<'_>) -> Result<Secret> {
        let mut r = random_bytes(env.rng, env.parameter_len)?;
        r.protect(&self.lock)?;
        Ok(r)
    }

    // ============================================
    // Генерация сообщений
    // ============================================

    fn generate_smp1(&self, env: &mut SmpEnv<'_>, question: Option<&str>) -> Result<(Smp1State, SmpMessage1)> {
        let a2 = self.random_exponent(env)?;
        let a3 = self.random_exponent(env)?;
        let r2 = self.random_exponent(env)?;
        let r3 = self.random_exponent(env)?;

        let (c2, d2) = generate_zkp(&r2, &a2, 1);
        let (c3, d3) = generate_zkp(&r3, &a3, 2);
        let msg = SmpMessage1 {
            g2a: mod_exp_g(&a2.to_biguint()),
            c2,
            d2,
            g3a: mod_exp_g(&a3.to_biguint()),
            c3,
            d3,
            question: question.map(str::to_owned),
        };
        Ok((Smp1State { a2, a3 }, msg))
    }

    fn generate_smp2(
        &self,
        env: &mut SmpEnv<'_>,
        secret: &Secret,
        msg1: &SmpMessage1,
    ) -> Result<(Smp2State, SmpMessage2)> {
        let b2 = self.random_exponent(env)?;
        let b3 = self.random_exponent(env)?;
        let r2 = self.random_exponent(env)?;
        let r3 = self.random_exponent(env)?;
        let r4 = self.random_exponent(env)?;
        let r5 = self.random_exponent(env)?;
        let r6 = self.random_exponent(env)?;

        let (c2, d2) = generate_zkp(&r2, &b2, 3);
        let (c3, d3) = generate_zkp(&r3, &b3, 4);

        let g2 = mod_exp(&msg1.g2a, &b2.to_biguint());
        let g3 = mod_exp(&msg1.g3a, &b3.to_biguint());

        let (pb, qb, cp, d5, d6) = blind_secret(&g2, &g3, &r4, &r5, &r6, secret, 5);

        let msg = SmpMessage2 {
            g2b: mod_exp_g(&b2.to_biguint()),
            c2,
            d2,
            g3b: mod_exp_g(&b3.to_biguint()),
            c3,
            d3,
            pb: pb.clone(),
            qb: qb.clone(),
            cp,
            d5,
            d6,
        };
        let state = Smp2State {
            b3,
            g2,
            g3,
            g3a: msg1.g3a.clone(),
            pb,
            qb,
        };
        Ok((state, msg))
    }

    fn generate_smp3(
        &self,
        env: &mut SmpEnv<'_>,
        mut s1: Smp1State,
        g2: &BigUint,
        g3: &BigUint,
        msg2: &SmpMessage2,
    ) -> Result<(Smp3State, SmpMessage3)> {
        let secret = self
            .secret
            .as_ref()
            .ok_or_else(|| OtrError::CannotAuthenticate("no SMP secret".into()))?;
        let r4 = self.random_exponent(env)?;
        let r5 = self.random_exponent(env)?;
        let r6 = self.random_exponent(env)?;
        let r7 = self.random_exponent(env)?;

        let (pa, qa, cp, d5, d6) = blind_secret(g2, g3, &r4, &r5, &r6, secret, 6);

        let qaqb = div_mod(&qa, &msg2.qb);
        let papb = div_mod(&pa, &msg2.pb);
        let a3 = std::mem::take(&mut s1.a3);
        s1.zeroize();

        let ra = mod_exp(&qaqb, &a3.to_biguint());
        let (cr, d7) = generate_zkp4(&r7, &a3, &qaqb, 7);

        let msg = SmpMessage3 {
            pa,
            qa,
            cp,
            d5,
            d6,
            ra,
            cr,
            d7,
        };
        let state = Smp3State {
            a3,
            g3b: msg2.g3b.clone(),
            papb,
            qaqb,
        };
        Ok((state, msg))
    }
}

impl Zeroize for SmpContext {
    fn zeroize(&mut self) {
        self.wipe();
    }
}

fn generate_smp4(
    env: &mut SmpEnv<'_>,
    lock: &Arc<dyn MemoryLock>,
    s2: &Smp2State,
    msg3: &SmpMessage3,
) -> Result<SmpMessage4> {
    let mut r7 = random_bytes(env.rng, env.parameter_len)?;
    r7.protect(lock)?;

    let qaqb = div_mod(&msg3.qa, &s2.qb);
    let rb = mod_exp(&qaqb, &s2.b3.to_biguint());
    let (cr, d7) = generate_zkp4(&r7, &s2.b3, &qaqb, 8);
    Ok(SmpMessage4 { rb, cr, d7 })
}

// ============================================
// Доказательства
// ============================================

/// SHA-256(ix || MPI(v1) || MPI(v2) ...) as an integer.
fn hash_mpis(ix: u8, values: &[&BigUint]) -> BigUint {
    BigUint::from_bytes_be(&sha256_prefixed(ix, &append_mpis(Vec::new(), values)))
}

/// Knowledge of `a` in g^a: c = H(ix, g^r), d = r - a*c mod q.
fn generate_zkp(r: &Secret, a: &Secret, ix: u8) -> (BigUint, BigUint) {
    let (mut r, mut a) = (r.to_biguint(), a.to_biguint());
    let c = hash_mpis(ix, &[&mod_exp_g(&r)]);
    let d = sub_mod(&r, &mul_mod(&a, &c, q()), q());
    wipe_biguint(&mut r);
    wipe_biguint(&mut a);
    (c, d)
}

fn verify_zkp(d: &BigUint, gen: &BigUint, c: &BigUint, ix: u8) -> Result<()> {
    let r = mul_mod(&mod_exp_g(d), &mod_exp(gen, c), p());
    if hash_mpis(ix, &[&r]) != *c {
        return Err(OtrError::verification(format!("bad ZKP {}", ix)));
    }
    Ok(())
}

/// P = g3^r4, Q = g^r4 * g2^x with the proof that both use the same r4
/// and that Q carries x.
fn blind_secret(
    g2: &BigUint,
    g3: &BigUint,
    r4: &Secret,
    r5: &Secret,
    r6: &Secret,
    secret: &Secret,
    ix: u8,
) -> (BigUint, BigUint, BigUint, BigUint, BigUint) {
    let (mut r4, mut r5, mut r6, mut x) = (r4.to_biguint(), r5.to_biguint(), r6.to_biguint(), secret.to_biguint());

    let pv = mod_exp(g3, &r4);
    let qv = mul_mod(&mod_exp_g(&r4), &mod_exp(g2, &x), p());

    let t1 = mod_exp(g3, &r5);
    let t2 = mul_mod(&mod_exp_g(&r5), &mod_exp(g2, &r6), p());
    let cp = hash_mpis(ix, &[&t1, &t2]);

    let d5 = sub_mod(&r5, &mul_mod(&r4, &cp, q()), q());
    let d6 = sub_mod(&r6, &mul_mod(&x, &cp, q()), q());
    for v in [&mut r4, &mut r5, &mut r6, &mut x] {
        wipe_biguint(v);
    }
    (pv, qv, cp, d5, d6)
}

#[allow(clippy::too_many_arguments)]
fn verify_blinded_secret(
    g2: &BigUint,
    g3: &BigUint,
    pv: &BigUint,
    qv: &BigUint,
    cp: &BigUint,
    d5: &BigUint,
    d6: &BigUint,
    ix: u8,
) -> Result<()> {
    let l = mul_mod(&mod_exp(g3, d5), &mod_exp(pv, cp), p());
    let r = mul_mod(
        &mul_mod(&mod_exp_g(d5), &mod_exp(g2, d6), p()),
        &mod_exp(qv, cp),
        p(),
    );
    if hash_mpis(ix, &[&l, &r]) != *cp {
        return Err(OtrError::verification(format!("bad ZKP {}", ix)));
    }
    Ok(())
}

/// Proof that log_g(g3x) == log_qaqb(R): c = H(ix, g^r7, qaqb^r7).
fn generate_zkp4(r7: &Secret, x3: &Secret, qaqb: &BigUint, ix: u8) -> (BigUint, BigUint) {
    let (mut r7, mut x3) = (r7.to_biguint(), x3.to_biguint());
    let cr = hash_mpis(ix, &[&mod_exp_g(&r7), &mod_exp(qaqb, &r7)]);
    let d7 = sub_mod(&r7, &mul_mod(&x3, &cr, q()), q());
    wipe_biguint(&mut r7);
    wipe_biguint(&mut x3);
    (cr, d7)
}

fn verify_zkp4(g3x: &BigUint, qaqb: &BigUint, rv: &BigUint, cr: &BigUint, d7: &BigUint, ix: u8) -> Result<()> {
    let l = mul_mod(&mod_exp_g(d7), &mod_exp(g3x, cr), p());
    let r = mul_mod(&mod_exp(qaqb, d7), &mod_exp(rv, cr), p());
    if hash_mpis(ix, &[&l, &r]) != *cr {
        return Err(OtrError::verification(format!("bad ZKP {}", ix)));
    }
    Ok(())
}

fn require_group_elements(values: &[&BigUint]) -> Result<()> {
    if values.iter().all(|v| is_group_element(v)) {
        Ok(())
    } else {
        Err(OtrError::verification("SMP value is not a group element"))
    }
}

fn verify_smp1(msg: &SmpMessage1) -> Result<()> {
    require_group_elements(&[&msg.g2a, &msg.g3a])?;
    verify_zkp(&msg.d2, &msg.g2a, &msg.c2, 1)?;
    verify_zkp(&msg.d3, &msg.g3a, &msg.c3, 2)
}

/// Checks SMP2 and returns the joint generators (g2, g3).
fn verify_smp2(s1: &Smp1State, msg: &SmpMessage2) -> Result<(BigUint, BigUint)> {
    require_group_elements(&[&msg.g2b, &msg.g3b, &msg.pb, &msg.qb])?;
    verify_zkp(&msg.d2, &msg.g2b, &msg.c2, 3)?;
    verify_zkp(&msg.d3, &msg.g3b, &msg.c3, 4)?;

    let g2 = mod_exp(&msg.g2b, &s1.a2.to_biguint());
    let g3 = mod_exp(&msg.g3b, &s1.a3.to_biguint());
    verify_blinded_secret(&g2, &g3, &msg.pb, &msg.qb, &msg.cp, &msg.d5, &msg.d6, 5)?;
    Ok((g2, g3))
}

fn verify_smp3(s2: &Smp2State, msg: &SmpMessage3) -> Result<()> {
    require_group_elements(&[&msg.pa, &msg.qa, &msg.ra])?;
    verify_blinded_secret(&s2.g2, &s2.g3, &msg.pa, &msg.qa, &msg.cp, &msg.d5, &msg.d6, 6)?;
    let qaqb = div_mod(&msg.qa, &s2.qb);
    verify_zkp4(&s2.g3a, &qaqb, &msg.ra, &msg.cr, &msg.d7, 7)
}

fn verify_smp4(s3: &Smp3State, msg: &SmpMessage4) -> Result<()> {
    require_group_elements(&[&msg.rb])?;
    verify_zkp4(&s3.g3b, &s3.qaqb, &msg.rb, &msg.cr, &msg.d7, 8)
}

/// Ra^b3 == Pa/Pb
fn smp3_protocol_success(s2: &Smp2State, msg: &SmpMessage3) -> bool {
    let rab = mod_exp(&msg.ra, &s2.b3.to_biguint());
    rab == div_mod(&msg.pa, &s2.pb)
}

/// Rb^a3 == Pa/Pb
fn smp4_protocol_success(s3: &Smp3State, msg: &SmpMessage4) -> bool {
    let rab = mod_exp(&msg.rb, &s3.a3.to_biguint());
    rab == s3.papb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::secure_memory::NoMemoryLock;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const FP_A: [u8; 20] = [0xAA; 20];
    const FP_B: [u8; 20] = [0xBB; 20];
    const SSID: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];

    // Short exponents keep the tests fast; the math is length independent.
    const TEST_PARAMETER_LEN: usize = 24;

    struct Side {
        smp: SmpContext,
        rng: StdRng,
    }

    impl Side {
        fn new(seed: u64) -> Self {
            Self {
                smp: SmpContext::new(Arc::new(NoMemoryLock)),
                rng: StdRng::seed_from_u64(seed),
            }
        }

        fn env(&mut self) -> (&mut SmpContext, SmpEnv<'_>) {
            (
                &mut self.smp,
                SmpEnv {
                    rng: &mut self.rng,
                    parameter_len: TEST_PARAMETER_LEN,
                },
            )
        }

        fn start(&mut self, secret: &[u8], question: Option<&str>) -> Vec<SmpMessage> {
            let (smp, mut env) = self.env();
            smp.start(&mut env, smp_secret(&FP_A, &FP_B, &SSID, secret), question)
                .unwrap()
        }

        fn answer(&mut self, secret: &[u8]) -> SmpStep {
            let (smp, mut env) = self.env();
            smp.provide_secret(&mut env, smp_secret(&FP_A, &FP_B, &SSID, secret))
                .unwrap()
        }

        fn receive(&mut self, msg: SmpMessage) -> SmpStep {
            let (smp, mut env) = self.env();
            smp.receive(&mut env, msg).unwrap()
        }
    }

    fn only(mut msgs: Vec<SmpMessage>) -> SmpMessage {
        assert_eq!(msgs.len(), 1);
        msgs.remove(0)
    }

    fn event(step: &SmpStep) -> Option<SmpEvent> {
        step.notice.as_ref().map(|n| n.event)
    }

    fn run(secret_a: &[u8], secret_b: &[u8]) -> (SmpStep, SmpStep) {
        let mut alice = Side::new(1);
        let mut bob = Side::new(2);

        let msg1 = only(alice.start(secret_a, Some("colour?")));
        let asked = bob.receive(msg1);
        assert_eq!(
            asked.notice,
            Some(SmpNotice {
                event: SmpEvent::AskForAnswer,
                progress: PROGRESS_ASK,
                question: Some("colour?".into()),
            })
        );
        assert_eq!(bob.smp.question(), Some("colour?"));

        let msg2 = only(bob.answer(secret_b).reply);
        let step3 = alice.receive(msg2);
        assert_eq!(event(&step3), Some(SmpEvent::InProgress));
        assert!(matches!(alice.smp.state(), SmpState::Expect4 { .. }));

        let bob_done = bob.receive(only(step3.reply));
        let msg4 = bob_done.reply.first().cloned().unwrap();
        let alice_done = alice.receive(msg4);

        assert!(!alice.smp.holds_secrets());
        assert!(!bob.smp.holds_secrets());
        (alice_done, bob_done)
    }

    #[test]
    fn test_zeroized_smp3_state_holds_no_values() {
        let mut s3 = Smp3State {
            a3: Secret::new(vec![0x5A; 24]),
            g3b: BigUint::from_bytes_be(&[0x11; 192]),
            papb: BigUint::from_bytes_be(&[0x22; 192]),
            qaqb: BigUint::from_bytes_be(&[0x33; 192]),
        };
        s3.zeroize();
        assert!(s3.a3.as_bytes().iter().all(|b| *b == 0));
        for v in [&s3.g3b, &s3.papb, &s3.qaqb] {
            assert_eq!(*v, BigUint::default());
        }
    }

    #[test]
    fn test_equal_secrets_succeed_on_both_sides() {
        let (alice, bob) = run(b"blue", b"blue");
        assert_eq!(event(&alice), Some(SmpEvent::Success));
        assert_eq!(event(&bob), Some(SmpEvent::Success));
    }

    #[test]
    fn test_different_secrets_fail_on_both_sides() {
        let (alice, bob) = run(b"blue", b"bluf");
        assert_eq!(event(&alice), Some(SmpEvent::Failure));
        assert_eq!(event(&bob), Some(SmpEvent::Failure));
        assert_eq!(alice.notice.unwrap().progress, PROGRESS_DONE);
    }

    #[test]
    fn test_forged_proof_is_cheating() {
        let mut alice = Side::new(3);
        let mut bob = Side::new(4);

        let mut msg1 = match only(alice.start(b"s", None)) {
            SmpMessage::One(m) => m,
            _ => unreachable!(),
        };
        msg1.d2 += 1u32;

        let step = bob.receive(SmpMessage::One(msg1));
        assert_eq!(event(&step), Some(SmpEvent::Cheated));
        assert_eq!(step.reply, vec![SmpMessage::Abort]);
        assert!(matches!(bob.smp.state(), SmpState::Expect1));
    }

    #[test]
    fn test_out_of_order_message_is_an_error() {
        let mut alice = Side::new(5);
        let mut bob = Side::new(6);
        only(alice.start(b"s", None));
        let msg1 = only(bob.start(b"s", None));

        let step = alice.receive(msg1);
        assert_eq!(event(&step), Some(SmpEvent::Error));
        assert_eq!(step.reply, vec![SmpMessage::Abort]);
        assert!(!alice.smp.holds_secrets());
    }

    #[test]
    fn test_abort_from_every_state_resets() {
        let mut alice = Side::new(7);
        let mut bob = Side::new(8);

        // Expect1
        bob.smp.abort();
        assert!(!bob.smp.holds_secrets());

        // Expect2
        let msg1 = only(alice.start(b"x", None));
        assert!(matches!(alice.smp.state(), SmpState::Expect2 { .. }));

        // WaitingForSecret
        bob.receive(msg1.clone());
        assert!(matches!(bob.smp.state(), SmpState::WaitingForSecret { .. }));
        assert_eq!(bob.smp.abort(), SmpMessage::Abort);
        assert!(!bob.smp.holds_secrets());

        // Expect3
        bob.receive(msg1);
        let msg2 = only(bob.answer(b"x").reply);
        assert!(matches!(bob.smp.state(), SmpState::Expect3 { .. }));

        // Expect4
        alice.receive(msg2);
        assert!(matches!(alice.smp.state(), SmpState::Expect4 { .. }));

        for side in [&mut alice, &mut bob] {
            side.smp.abort();
            assert!(matches!(side.smp.state(), SmpState::Expect1));
            assert!(!side.smp.holds_secrets());
        }
    }

    #[test]
    fn test_peer_abort_raises_event() {
        let mut alice = Side::new(9);
        only(alice.start(b"x", None));
        let step = alice.receive(SmpMessage::Abort);
        assert_eq!(event(&step), Some(SmpEvent::Abort));
        assert!(step.reply.is_empty());
        assert!(!alice.smp.holds_secrets());
    }

    #[test]
    fn test_restart_prepends_abort() {
        let mut alice = Side::new(10);
        only(alice.start(b"x", None));
        let msgs = alice.start(b"y", None);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0], SmpMessage::Abort);
        assert!(matches!(msgs[1], SmpMessage::One(_)));
    }

    #[test]
    fn test_secret_without_request_is_rejected() {
        let mut bob = Side::new(11);
        let (smp, mut env) = bob.env();
        let err = smp.provide_secret(&mut env, Secret::from_slice(b"x")).unwrap_err();
        assert!(matches!(err, OtrError::CannotAuthenticate(_)));
    }

    #[test]
    fn test_secret_depends_on_every_input() {
        let base = smp_secret(&FP_A, &FP_B, &SSID, b"s");
        assert_ne!(base, smp_secret(&FP_B, &FP_A, &SSID, b"s"));
        assert_ne!(base, smp_secret(&FP_A, &FP_B, &[0u8; 8], b"s"));
        assert_ne!(base, smp_secret(&FP_A, &FP_B, &SSID, b"t"));
        assert_eq!(base.len(), 32);
    }
}
