//! Watch-only contacts.
//!
//! Paying the same address twice links payments on-chain, so a contact
//! saved as an xpub hands out fresh addresses instead. The cache starts at
//! the initial gap (10 receive + 10 change) and grows contiguously from
//! index 0 up to the 50 + 50 ceiling; scanning code uses it to decide when
//! an account can be considered empty.

use bitcoin::{Address, Network};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use quorum_core::xpub::{self, XpubError};

/// Initial gap per chain.
pub const INITIAL_GAP: u32 = 10;

/// Ceiling per chain.
pub const MAX_GAP: u32 = 50;

#[derive(Error, Debug)]
pub enum ContactError {
    #[error(transparent)]
    Xpub(#[from] XpubError),
    #[error(transparent)]
    Address(#[from] quorum_script::address::AddressError),
    #[error("Gap of {requested} exceeds the ceiling of {MAX_GAP}")]
    GapTooLarge { requested: u32 },
    #[error("Gap of {requested} does not extend the current gap of {current}")]
    GapNotLarger { requested: u32, current: u32 },
    #[error("Contact is a single address; it has no derivable cache")]
    NotDerivable,
}

/// How a contact receives money.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContactSource {
    /// One fixed address, reused (the contact's choice, not ours).
    Single { address: String },
    /// An account-level extended key we derive fresh addresses from.
    Xpub { slip132: String },
}

/// A watch-only payee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub source: ContactSource,
    pub network: Network,
    /// Cached receive addresses, contiguous from index 0.
    receive: Vec<String>,
    /// Cached change addresses, contiguous from index 0.
    change: Vec<String>,
}

impl Contact {
    /// A contact that is just an address.
    pub fn from_address(name: &str, address: &str, network: Network) -> Result<Self, ContactError> {
        let decoded = quorum_script::address::decode(address, network)?;
        Ok(Self {
            name: name.to_string(),
            source: ContactSource::Single {
                address: decoded.address.to_string(),
            },
            network,
            receive: Vec::new(),
            change: Vec::new(),
        })
    }

    /// A contact backed by an extended key, with the cache warmed to the
    /// initial gap.
    pub fn from_xpub(name: &str, slip132: &str, network: Network) -> Result<Self, ContactError> {
        let parsed = xpub::parse(slip132, network)?;
        parsed.require_account_depth()?;
        let mut contact = Self {
            name: name.to_string(),
            source: ContactSource::Xpub {
                slip132: parsed.original.clone(),
            },
            network,
            receive: Vec::new(),
            change: Vec::new(),
        };
        contact.warm(INITIAL_GAP)?;
        Ok(contact)
    }

    /// Current gap (cached addresses per chain).
    pub fn gap(&self) -> u32 {
        self.receive.len() as u32
    }

    /// All cached addresses, receive chain first.
    pub fn cached(&self) -> impl Iterator<Item = &str> {
        self.receive
            .iter()
            .chain(self.change.iter())
            .map(String::as_str)
    }

    /// Whether an address belongs to this contact.
    pub fn contains(&self, address: &str) -> bool {
        match &self.source {
            ContactSource::Single { address: a } => a == address,
            ContactSource::Xpub { .. } => self.cached().any(|a| a == address),
        }
    }

    /// Next address to pay this contact, given the set already used.
    ///
    /// Falls back to the last cached address when the whole cache is used;
    /// callers extend the cache before that becomes a reuse.
    pub fn next_unused<'a>(&'a self, used: &[&str]) -> Option<&'a str> {
        match &self.source {
            ContactSource::Single { address } => Some(address.as_str()),
            ContactSource::Xpub { .. } => self
                .receive
                .iter()
                .map(String::as_str)
                .find(|a| !used.contains(a))
                .or_else(|| self.receive.last().map(String::as_str)),
        }
    }

    /// Fill the cache up to `gap` addresses per chain (2 × gap total),
    /// returning the newly derived addresses.
    pub fn warm(&mut self, gap: u32) -> Result<Vec<Address>, ContactError> {
        if gap > MAX_GAP {
            return Err(ContactError::GapTooLarge { requested: gap });
        }
        let slip132 = match &self.source {
            ContactSource::Xpub { slip132 } => slip132.clone(),
            ContactSource::Single { .. } => return Err(ContactError::NotDerivable),
        };
        let parsed = xpub::parse(&slip132, self.network)?;

        let mut fresh = Vec::new();
        for index in self.receive.len() as u32..gap {
            let address = parsed.derive_address(0, index)?;
            self.receive.push(address.to_string());
            fresh.push(address);
        }
        for index in self.change.len() as u32..gap {
            let address = parsed.derive_address(1, index)?;
            self.change.push(address.to_string());
            fresh.push(address);
        }
        Ok(fresh)
    }

    /// Grow the cache to a strictly larger gap, returning exactly the
    /// `2 × (new − old)` new addresses.
    pub fn extend(&mut self, new_gap: u32) -> Result<Vec<Address>, ContactError> {
        let current = self.gap();
        if new_gap <= current {
            return Err(ContactError::GapNotLarger {
                requested: new_gap,
                current,
            });
        }
        log::debug!("extending cache for {} from {current} to {new_gap}", self.name);
        self.warm(new_gap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_core::seed::{derive_seed, parse_mnemonic};
    use quorum_core::KeyTree;
    use quorum_script::ScriptKind;
    use std::collections::HashSet;

    fn contact() -> Contact {
        let mnemonic = parse_mnemonic(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
        )
        .unwrap();
        let seed = derive_seed(&mnemonic, "");
        let tree = KeyTree::from_seed(seed.as_bytes(), Network::Testnet).unwrap();
        let slip = tree.account_xpub_slip132(ScriptKind::P2wpkh, 0).unwrap();
        Contact::from_xpub("alice", &slip, Network::Testnet).unwrap()
    }

    #[test]
    fn test_warm_cache_initial_size() {
        let contact = contact();
        assert_eq!(contact.gap(), INITIAL_GAP);
        assert_eq!(contact.cached().count(), 2 * INITIAL_GAP as usize);
    }

    #[test]
    fn test_cache_contiguous_and_correct() {
        let contact = contact();
        // First receive address of the reference testnet account.
        assert_eq!(
            contact.receive[0],
            "tb1q6rz28mcfaxtmd6v789l9rrlrusdprr9pz3cppk"
        );
        assert!(contact.contains("tb1q6rz28mcfaxtmd6v789l9rrlrusdprr9pz3cppk"));
    }

    /// Gap-limit monotonicity: growing from g1 to g2 yields exactly
    /// 2 × (g2 − g1) fresh addresses, disjoint from the warm set.
    #[test]
    fn test_extend_returns_exactly_the_new_tail() {
        let mut contact = contact();
        let warm: HashSet<String> = contact.cached().map(str::to_string).collect();

        let fresh = contact.extend(25).unwrap();
        assert_eq!(fresh.len(), 2 * (25 - INITIAL_GAP as usize));
        assert_eq!(contact.gap(), 25);
        for address in &fresh {
            assert!(!warm.contains(&address.to_string()));
        }
    }

    #[test]
    fn test_extend_respects_ceiling() {
        let mut contact = contact();
        contact.extend(MAX_GAP).unwrap();
        assert!(matches!(
            contact.extend(MAX_GAP + 1),
            Err(ContactError::GapTooLarge { .. })
        ));
    }

    #[test]
    fn test_extend_must_grow() {
        let mut contact = contact();
        assert!(matches!(
            contact.extend(INITIAL_GAP),
            Err(ContactError::GapNotLarger { .. })
        ));
    }

    #[test]
    fn test_next_unused_walks_the_chain() {
        let contact = contact();
        let first = contact.next_unused(&[]).unwrap().to_string();
        assert_eq!(first, contact.receive[0]);
        let second = contact.next_unused(&[first.as_str()]).unwrap();
        assert_eq!(second, contact.receive[1]);
    }

    #[test]
    fn test_single_address_contact() {
        let contact = Contact::from_address(
            "bob",
            "tb1q6rz28mcfaxtmd6v789l9rrlrusdprr9pz3cppk",
            Network::Testnet,
        )
        .unwrap();
        assert_eq!(
            contact.next_unused(&[]).unwrap(),
            "tb1q6rz28mcfaxtmd6v789l9rrlrusdprr9pz3cppk"
        );
        assert!(matches!(
            contact.clone().warm(5),
            Err(ContactError::NotDerivable)
        ));
    }

    #[test]
    fn test_multisig_xpub_rejected() {
        let mnemonic = parse_mnemonic(
            "zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo wrong",
        )
        .unwrap();
        let seed = derive_seed(&mnemonic, "");
        let tree = KeyTree::from_seed(seed.as_bytes(), Network::Testnet).unwrap();
        let slip = tree
            .account_xpub_slip132(ScriptKind::P2wshMultisig, 0)
            .unwrap();
        // warm() fails immediately: a lone multisig key has no addresses.
        assert!(Contact::from_xpub("vault", &slip, Network::Testnet).is_err());
    }
}
