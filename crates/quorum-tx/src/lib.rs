//! Quorum Tx
//!
//! Turns a spend request into broadcast-ready bytes: pick unspent outputs,
//! assemble an unsigned transaction with change, sign single-key inputs,
//! or hand multisig drafts to `quorum-psbt` for coordination.
//!
//! The network, fee source, and key storage are all behind the provider
//! traits in [`providers`]; nothing in this crate blocks or retries.

pub mod build;
pub mod providers;
pub mod select;

pub use build::*;
pub use providers::*;
pub use select::*;
