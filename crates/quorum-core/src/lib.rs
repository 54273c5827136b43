//! Quorum Core
//!
//! Seed material and key derivation for the Quorum wallet.
//!
//! # Key Derivation
//!
//! From a single BIP-39 seed the wallet derives accounts for every
//! supported script kind:
//! - single-key: m/44'/c'/a', m/49'/c'/a', m/84'/c'/a'
//! - multisig:   m/48'/c'/a'/s' with s' ∈ {0', 1', 2'}
//!
//! Extended public keys cross the wallet boundary in SLIP-132 encoding and
//! are normalized on the way in (`xpub` module). Multisig membership is
//! modeled by `account`.

pub mod account;
pub mod keys;
pub mod seed;
pub mod xpub;

pub use account::*;
pub use keys::*;
pub use seed::*;
pub use xpub::*;
