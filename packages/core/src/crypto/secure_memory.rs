//! Secure memory discipline for key material.
//!
//! Two pieces work together:
//! - [`MemoryLock`] is a capability the host hands to a conversation. It pins
//!   buffers that hold secrets so they are not swapped out. Whether a failure
//!   is fatal is decided by the implementation, and a fatal failure travels
//!   through the regular `OtrError` channel.
//! - [`Secret`] owns a secret byte buffer. It is zeroized on `zeroize()` and on
//!   drop, and unpins itself if it was pinned.

use crate::error::{OtrError, Result};
use num_bigint::BigUint;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;
use zeroize::Zeroize;

/// Pins memory regions holding key material.
pub trait MemoryLock: Send + Sync {
    fn lock(&self, region: &[u8]) -> Result<()>;
    fn unlock(&self, region: &[u8]) -> Result<()>;
}

/// Does nothing. Default for hosts that do not care about swap.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMemoryLock;

impl MemoryLock for NoMemoryLock {
    fn lock(&self, _region: &[u8]) -> Result<()> {
        Ok(())
    }

    fn unlock(&self, _region: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// `mlock(2)` based pinning.
///
/// In strict mode a failed lock is returned as [`OtrError::MemoryLock`]; in
/// best-effort mode failures are ignored and only the first one is logged.
#[derive(Debug)]
pub struct MlockMemoryLock {
    strict: bool,
    warned: AtomicBool,
}

impl MlockMemoryLock {
    pub fn strict() -> Self {
        Self {
            strict: true,
            warned: AtomicBool::new(false),
        }
    }

    pub fn best_effort() -> Self {
        Self {
            strict: false,
            warned: AtomicBool::new(false),
        }
    }

    fn outcome(&self, op: &str, res: std::io::Result<()>) -> Result<()> {
        match res {
            Ok(()) => Ok(()),
            Err(e) if self.strict => Err(OtrError::MemoryLock(format!("{}: {}", op, e))),
            Err(e) => {
                if !self.warned.swap(true, Ordering::Relaxed) {
                    warn!(target: "otr::memory", error = %e, "{} failed, key material stays unpinned", op);
                }
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
mod sys {
    use std::os::raw::{c_int, c_void};

    extern "C" {
        fn mlock(addr: *const c_void, len: usize) -> c_int;
        fn munlock(addr: *const c_void, len: usize) -> c_int;
    }

    pub fn lock(region: &[u8]) -> std::io::Result<()> {
        if region.is_empty() {
            return Ok(());
        }
        // SAFETY: the pointer and length describe a live, borrowed slice.
        let rc = unsafe { mlock(region.as_ptr() as *const c_void, region.len()) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn unlock(region: &[u8]) -> std::io::Result<()> {
        if region.is_empty() {
            return Ok(());
        }
        // SAFETY: the pointer and length describe a live, borrowed slice.
        let rc = unsafe { munlock(region.as_ptr() as *const c_void, region.len()) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(unix))]
mod sys {
    pub fn lock(_region: &[u8]) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "memory locking is not supported on this platform",
        ))
    }

    pub fn unlock(_region: &[u8]) -> std::io::Result<()> {
        Ok(())
    }
}

impl MemoryLock for MlockMemoryLock {
    fn lock(&self, region: &[u8]) -> Result<()> {
        self.outcome("mlock", sys::lock(region))
    }

    fn unlock(&self, region: &[u8]) -> Result<()> {
        self.outcome("munlock", sys::unlock(region))
    }
}

/// Owned secret bytes: private exponents, AES and MAC keys, SMP blinding factors.
#[derive(Default)]
pub struct Secret {
    bytes: Vec<u8>,
    pinned_by: Option<Arc<dyn MemoryLock>>,
}

impl Secret {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            pinned_by: None,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }

    pub fn from_biguint(n: &BigUint) -> Self {
        Self::new(n.to_bytes_be())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Transient integer view. Callers clear it with [`wipe_biguint`].
    pub fn to_biguint(&self) -> BigUint {
        BigUint::from_bytes_be(&self.bytes)
    }

    /// Pins the buffer with `lock`. It is unpinned again when wiped.
    pub fn protect(&mut self, lock: &Arc<dyn MemoryLock>) -> Result<()> {
        if self.pinned_by.is_some() {
            return Ok(());
        }
        lock.lock(&self.bytes)?;
        self.pinned_by = Some(Arc::clone(lock));
        Ok(())
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned_by.is_some()
    }

    pub fn try_clone(&self, lock: &Arc<dyn MemoryLock>) -> Result<Self> {
        let mut copy = Secret::from_slice(&self.bytes);
        if self.pinned_by.is_some() {
            copy.protect(lock)?;
        }
        Ok(copy)
    }
}

/// Clears `n` limb by limb before it shrinks to zero, so the freed digits
/// hold no key bits. Low bits go first: the top limb is cleared last.
pub fn wipe_biguint(n: &mut BigUint) {
    for bit in 0..n.bits() {
        n.set_bit(bit, false);
    }
}

impl Zeroize for Secret {
    fn zeroize(&mut self) {
        self.bytes.as_mut_slice().zeroize();
        if let Some(lock) = self.pinned_by.take() {
            let _ = lock.unlock(&self.bytes);
        }
        self.bytes.zeroize();
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED; {}])", self.bytes.len())
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.bytes.len() == other.bytes.len() && bool::from(self.bytes.ct_eq(&other.bytes))
    }
}
