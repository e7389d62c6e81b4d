//! Derived account state, rebuildable from the block list.

use std::collections::HashMap;

use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};

use crate::chain::model::Block;
use crate::crypto::string_to_key;

/// Per-wallet derived record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletInfo {
    /// Transaction counter: strictly monotonic per-wallet sequence used to
    /// reject replayed transfers.
    #[serde(rename = "TXC")]
    pub txc: u64,
    /// Current balance.
    #[serde(rename = "Amount")]
    pub amount: f64,
    /// Canonical public key string bound at registration.
    #[serde(rename = "PublicKey")]
    pub public_key: String,
}

/// The account table and aggregates derived from the block list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chainstate {
    #[serde(rename = "Wallets")]
    pub wallets: HashMap<String, WalletInfo>,
    /// Owned copy of the most recently accepted block.
    #[serde(rename = "LastBlock")]
    pub last_block: Block,
    /// Sum of all block rewards issued.
    #[serde(rename = "MarketVolume")]
    pub market_volume: f64,
    /// Count of all processed transactions.
    #[serde(rename = "TransactionVolume")]
    pub transaction_volume: u64,
}

impl Default for Chainstate {
    fn default() -> Self {
        Chainstate {
            wallets: HashMap::new(),
            last_block: Block::genesis(),
            market_volume: 0.0,
            transaction_volume: 0,
        }
    }
}

impl Chainstate {
    pub fn wallet(&self, address: &str) -> Option<&WalletInfo> {
        self.wallets.get(address)
    }

    pub fn is_registered(&self, address: &str) -> bool {
        self.wallets.contains_key(address)
    }

    /// Looks up and decodes the public key bound to `address`.
    pub fn public_key_of(&self, address: &str) -> Option<RsaPublicKey> {
        let info = self.wallets.get(address)?;
        string_to_key(&info.public_key).ok()
    }
}
