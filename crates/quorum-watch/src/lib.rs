//! Quorum Watch
//!
//! Watch-only payees. A contact is either a single saved address or an
//! extended public key with a cache of derived receive/change addresses,
//! grown lazily under the gap-limit policy.

pub mod contact;

pub use contact::*;
