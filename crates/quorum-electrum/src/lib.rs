//! Quorum Electrum
//!
//! The only crate in the workspace that opens a socket. It backs the
//! provider seams of `quorum-tx` with an Electrum server: listing unspent
//! outputs for a script, fetching funding transactions for legacy inputs,
//! estimating fee rates, and submitting finished transactions. Everything
//! that crosses the wire is public data; key material never reaches this
//! crate.
//!
//! Mainnet connections must be TLS. Plaintext is tolerated on the test
//! networks (regtest has nothing else), but a plaintext mainnet URL is
//! refused outright rather than warned about.

use bitcoin::{Network, Script, Transaction, Txid};
use electrum_client::{ElectrumApi, Error as ElectrumError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use quorum_script::weight::MIN_RELAY_FEE_RATE;
use quorum_tx::{
    Broadcaster, FeeProvider, FeeRates, ProviderError, ProviderKind, UnspentOutput,
    UnspentProvider,
};

/// Confirmation targets (blocks) behind the three fee tiers.
const FAST_BLOCKS: usize = 2;
const MEDIUM_BLOCKS: usize = 6;
const SLOW_BLOCKS: usize = 25;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Could not reach Electrum server: {0}")]
    Connect(String),

    #[error("Refusing a plaintext connection on {network}; use an ssl:// URL")]
    PlaintextRefused { network: Network },

    #[error("Electrum protocol error: {0}")]
    Protocol(#[from] ElectrumError),
}

/// Connection settings, serializable for the caller's config layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectrumConfig {
    pub url: String,
    pub network: Network,
}

impl ElectrumConfig {
    /// A sensible public server for each network. Anything but regtest
    /// gets TLS on the operator's standard port.
    pub fn for_network(network: Network) -> Self {
        let url = match network {
            Network::Bitcoin => "ssl://electrum.blockstream.info:50002",
            Network::Testnet => "ssl://electrum.blockstream.info:60002",
            Network::Signet => "ssl://mempool.space:60602",
            _ => "tcp://127.0.0.1:50001",
        };
        Self {
            url: url.to_string(),
            network,
        }
    }
}

/// Does the URL promise an encrypted transport?
fn carries_tls(url: &str) -> bool {
    url.starts_with("ssl://") || url.starts_with("tcp+tls://")
}

/// Electrum-backed provider bundle.
pub struct ElectrumWallet {
    client: electrum_client::Client,
    network: Network,
}

impl ElectrumWallet {
    /// Connect, enforcing the transport policy before any bytes move.
    pub fn connect(config: &ElectrumConfig) -> Result<Self, Error> {
        if !carries_tls(&config.url) {
            if config.network == Network::Bitcoin {
                return Err(Error::PlaintextRefused {
                    network: config.network,
                });
            }
            log::debug!("plaintext Electrum transport on {}", config.network);
        }

        let client = electrum_client::Client::new(&config.url)
            .map_err(|e: ElectrumError| Error::Connect(e.to_string()))?;

        Ok(Self {
            client,
            network: config.network,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Height of the current chain tip, per the server's header
    /// subscription.
    pub fn tip_height(&self) -> Result<u32, Error> {
        let notification = self.client.block_headers_subscribe()?;
        Ok(notification.height as u32)
    }

    fn rate_for_target(&self, blocks: usize) -> Result<u64, ProviderError> {
        let estimate = self
            .client
            .estimate_fee(blocks)
            .map_err(|e| ProviderError::new(ProviderKind::Fees, e))?;
        Ok(sat_per_vb(estimate))
    }
}

/// Electrum quotes fees as BTC per kilobyte; the weight model wants whole
/// satoshis per virtual byte. A non-positive quote means the server has no
/// estimate, and nothing ever drops below the relay floor.
fn sat_per_vb(btc_per_kb: f64) -> u64 {
    if btc_per_kb <= 0.0 {
        return MIN_RELAY_FEE_RATE;
    }
    // 1 BTC/kB = 100_000_000 sat / 1_000 vB.
    let rate = (btc_per_kb * 100_000.0).round() as u64;
    rate.max(MIN_RELAY_FEE_RATE)
}

impl UnspentProvider for ElectrumWallet {
    fn unspent_for_script(&self, script: &Script) -> Result<Vec<UnspentOutput>, ProviderError> {
        let listed = self
            .client
            .script_list_unspent(script)
            .map_err(|e| ProviderError::new(ProviderKind::Unspent, e))?;

        let mut outputs = Vec::with_capacity(listed.len());
        for entry in listed {
            outputs.push(UnspentOutput {
                outpoint: bitcoin::OutPoint {
                    txid: entry.tx_hash,
                    vout: entry.tx_pos as u32,
                },
                value: bitcoin::Amount::from_sat(entry.value),
                script_pubkey: script.to_owned(),
                // Mempool entries report height 0.
                confirmed: entry.height > 0,
                // Ownership metadata is the wallet's to fill in; the
                // server only knows scripts.
                derivation_path: None,
                kind: None,
            });
        }
        Ok(outputs)
    }

    fn funding_transaction(&self, txid: &Txid) -> Result<Option<Transaction>, ProviderError> {
        match self.client.transaction_get(txid) {
            Ok(tx) => Ok(Some(tx)),
            Err(e) => {
                log::debug!("funding transaction {txid} unavailable: {e}");
                Ok(None)
            }
        }
    }
}

impl FeeProvider for ElectrumWallet {
    fn rates(&self) -> Result<FeeRates, ProviderError> {
        Ok(FeeRates {
            slow: self.rate_for_target(SLOW_BLOCKS)?,
            medium: self.rate_for_target(MEDIUM_BLOCKS)?,
            fast: self.rate_for_target(FAST_BLOCKS)?,
        })
    }
}

impl Broadcaster for ElectrumWallet {
    fn broadcast(&self, tx: &Transaction) -> Result<Txid, ProviderError> {
        let txid = self
            .client
            .transaction_broadcast(tx)
            .map_err(|e| ProviderError::new(ProviderKind::Broadcast, e))?;
        log::info!("broadcast accepted: {txid}");
        Ok(txid)
    }
}
