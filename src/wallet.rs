//! Node wallet: an RSA keypair bound to a random address, persisted as a
//! single JSON file.

use std::path::Path;

use rand::distributions::Alphanumeric;
use rand::Rng;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::NodeError;

const ADDRESS_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    /// The keypair for this wallet.
    #[serde(rename = "KP")]
    pub keypair: RsaPrivateKey,
    /// The address other wallets know this one by.
    #[serde(rename = "Address")]
    pub address: String,
}

impl Wallet {
    /// Generates a fresh wallet with a random 32-character address.
    pub fn generate() -> Result<Self, NodeError> {
        let keypair = crypto::generate_keypair()?;
        let address: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ADDRESS_LEN)
            .map(char::from)
            .collect();
        Ok(Wallet { keypair, address })
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.keypair.to_public_key()
    }

    /// The canonical string form of this wallet's public key, as carried in
    /// registrations.
    pub fn public_key_string(&self) -> Result<String, NodeError> {
        crypto::key_to_string(&self.public_key())
    }

    /// Signs a precomputed digest with this wallet's private key.
    pub fn sign_hash(&self, hash: &[u8]) -> Result<String, NodeError> {
        crypto::sign(hash, &self.keypair)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path)?;
        let wallet: Wallet = serde_json::from_str(&content)
            .map_err(|e| NodeError::Wallet(format!("could not deserialize wallet: {}", e)))?;
        Ok(wallet)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), NodeError> {
        let content = serde_json::to_string(self)
            .map_err(|e| NodeError::Wallet(format!("could not serialize wallet: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Loads the wallet file, generating and persisting a new wallet when the
/// file is missing or unreadable. A generation failure propagates; the node
/// cannot run without a wallet.
pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Wallet, NodeError> {
    let path = path.as_ref();
    match Wallet::load(path) {
        Ok(wallet) => {
            log::info!("loaded wallet {}", wallet.address);
            Ok(wallet)
        }
        Err(e) => {
            log::warn!("could not load wallet file: {}, generating a new wallet", e);
            let wallet = Wallet::generate()?;
            wallet.save(path)?;
            log::info!("generated wallet {}", wallet.address);
            Ok(wallet)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{from_hex, hash_hex, verify};

    #[test]
    fn generates_alphanumeric_address() {
        let wallet = Wallet::generate().unwrap();
        assert_eq!(wallet.address.len(), ADDRESS_LEN);
        assert!(wallet.address.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn wallet_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");

        let wallet = Wallet::generate().unwrap();
        wallet.save(&path).unwrap();
        let loaded = Wallet::load(&path).unwrap();

        assert_eq!(loaded.address, wallet.address);
        assert_eq!(
            loaded.public_key_string().unwrap(),
            wallet.public_key_string().unwrap()
        );
    }

    #[test]
    fn load_or_generate_creates_missing_wallet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");

        let first = load_or_generate(&path).unwrap();
        let second = load_or_generate(&path).unwrap();
        assert_eq!(first.address, second.address);
    }

    #[test]
    fn signs_verifiable_hashes() {
        let wallet = Wallet::generate().unwrap();
        let digest = from_hex(&hash_hex("a transfer"));

        let signature = wallet.sign_hash(&digest).unwrap();
        assert!(verify(&signature, &digest, &wallet.public_key()));
    }
}
