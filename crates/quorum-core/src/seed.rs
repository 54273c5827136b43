//! BIP-39 mnemonic and seed handling.
//!
//! The 64-byte seed is the single most dangerous value in the wallet: it
//! exists only between stretching the mnemonic and deriving the master
//! node, wrapped in [`SealedSeed`] so those bytes are pinned off swap and
//! wiped the moment the wallet is done with them.

use bip39::{Language, Mnemonic};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum SeedError {
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),
}

/// Accepted mnemonic lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordCount {
    Words12,
    Words24,
}

impl WordCount {
    fn words(self) -> usize {
        match self {
            WordCount::Words12 => 12,
            WordCount::Words24 => 24,
        }
    }
}

/// Generate a fresh English mnemonic of the given length.
pub fn generate_mnemonic(count: WordCount) -> Result<Mnemonic, SeedError> {
    Mnemonic::generate_in(Language::English, count.words())
        .map_err(|e| SeedError::InvalidMnemonic(e.to_string()))
}

/// Parse a mnemonic from user input.
///
/// Whitespace is normalized and case is folded before validation, since
/// phrases are routinely typed or pasted with stray spacing.
pub fn parse_mnemonic(words: &str) -> Result<Mnemonic, SeedError> {
    let normalized = words
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    if normalized.is_empty() {
        return Err(SeedError::InvalidMnemonic("empty phrase".into()));
    }
    Mnemonic::parse_in(Language::English, &normalized)
        .map_err(|e| SeedError::InvalidMnemonic(e.to_string()))
}

/// Stretch a mnemonic (plus optional passphrase) into a sealed 64-byte
/// seed: 2048 rounds of HMAC-SHA-512 over the normalized phrase, per
/// BIP-39.
pub fn derive_seed(mnemonic: &Mnemonic, passphrase: &str) -> SealedSeed {
    SealedSeed::stretch(mnemonic, passphrase)
}

/// A stretched seed, pinned in memory for as long as it lives.
///
/// Sealing does three things, all scoped to exactly these 64 bytes:
///
/// - disables core dumps for the process the first time any seed is
///   materialized, so a crash mid-derivation cannot write it to disk;
/// - `mlock`s the buffer so the OS cannot page it out to swap;
/// - zeroizes (and unpins) the buffer on drop.
///
/// Pinning is best effort: containers and unprivileged users may refuse
/// `mlock`/`setrlimit`, in which case the failure is logged and the seed
/// still works, just without that guarantee. [`SealedSeed::is_pinned`]
/// reports what actually took.
pub struct SealedSeed {
    bytes: Zeroizing<[u8; 64]>,
    pinned: bool,
}

impl SealedSeed {
    fn stretch(mnemonic: &Mnemonic, passphrase: &str) -> Self {
        sys::forbid_core_dumps_once();
        let bytes = Zeroizing::new(mnemonic.to_seed(passphrase));
        let pinned = sys::pin(bytes.as_ptr(), bytes.len());
        if !pinned {
            log::warn!("seed buffer could not be pinned; it may be swappable");
        }
        Self { bytes, pinned }
    }

    /// The raw seed, for feeding the master-node derivation.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..]
    }

    /// Whether the buffer is actually locked off swap.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}

impl Drop for SealedSeed {
    fn drop(&mut self) {
        // Wipe before releasing the pin, so the page never holds the
        // seed once it is swappable again. Zeroizing's own wipe at field
        // drop would run after this body, hence the explicit call.
        use zeroize::Zeroize;
        self.bytes.zeroize();
        if self.pinned {
            sys::unpin(self.bytes.as_ptr(), self.bytes.len());
        }
    }
}

impl std::fmt::Debug for SealedSeed {
    // Never prints seed material.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedSeed")
            .field("pinned", &self.pinned)
            .finish()
    }
}

/// Platform plumbing behind [`SealedSeed`]. Kept private: nothing else in
/// the wallet handles raw secret buffers.
#[cfg(unix)]
mod sys {
    use std::sync::atomic::{AtomicBool, Ordering};

    static CORE_DUMPS_FORBIDDEN: AtomicBool = AtomicBool::new(false);

    pub fn forbid_core_dumps_once() {
        if CORE_DUMPS_FORBIDDEN.swap(true, Ordering::SeqCst) {
            return;
        }
        let zero = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: shrinking RLIMIT_CORE to zero is always permitted.
        if unsafe { libc::setrlimit(libc::RLIMIT_CORE, &zero) } != 0 {
            log::warn!(
                "could not disable core dumps: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    pub fn pin(ptr: *const u8, len: usize) -> bool {
        // SAFETY: the pointer comes from a live SealedSeed buffer that
        // outlives the lock.
        unsafe { libc::mlock(ptr as *const libc::c_void, len) == 0 }
    }

    pub fn unpin(ptr: *const u8, len: usize) {
        // SAFETY: matches the earlier pin of the same buffer.
        unsafe {
            libc::munlock(ptr as *const libc::c_void, len);
        }
    }
}

#[cfg(not(unix))]
mod sys {
    pub fn forbid_core_dumps_once() {
        log::warn!("core dump prevention is not available on this platform");
    }

    pub fn pin(_ptr: *const u8, _len: usize) -> bool {
        false
    }

    pub fn unpin(_ptr: *const u8, _len: usize) {}
}
