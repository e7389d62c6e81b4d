//! Ledger entities and their canonical hashing.
//!
//! Canonical forms are byte-exact: block hashes cover the string-formatted
//! header fields followed by the JSON arrays of transactions and
//! registrations; transaction hashes cover the string-formatted fields in
//! declaration order. Amounts render in the default `f64` display form, so
//! every node derives identical digests for identical content.

use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};

use crate::crypto::{from_hex, hash_hex, verify};
use crate::error::NodeError;
use crate::wallet::Wallet;

/// One block of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Autoincrement id; the genesis block has id 0.
    #[serde(rename = "ID")]
    pub id: u64,
    /// Nonce establishing the required difficulty.
    #[serde(rename = "Nonce")]
    pub nonce: u64,
    /// Hex SHA-256 over the canonical serialization.
    #[serde(rename = "Hash")]
    pub hash: String,
    /// Hash of the predecessor block; empty for genesis.
    #[serde(rename = "Previous")]
    pub previous: String,
    /// Address credited with the block reward.
    #[serde(rename = "Miner")]
    pub miner: String,
    #[serde(rename = "Transactions")]
    pub transactions: Vec<Transaction>,
    #[serde(rename = "Registrations")]
    pub registrations: Vec<Registration>,
}

impl Block {
    /// The well-known first block every chain starts from.
    pub fn genesis() -> Self {
        let mut block = Block::default();
        block.hash = block.compute_hash().unwrap_or_default();
        block
    }

    /// Recomputes the hex hash from canonical form.
    pub fn compute_hash(&self) -> Result<String, NodeError> {
        let mut canonical = format!("{}{}{}{}", self.id, self.previous, self.miner, self.nonce);
        canonical.push_str(&serde_json::to_string(&self.transactions)?);
        canonical.push_str(&serde_json::to_string(&self.registrations)?);
        Ok(hash_hex(&canonical))
    }

    /// Whether this block carries any transactions or registrations.
    pub fn has_payload(&self) -> bool {
        !self.transactions.is_empty() || !self.registrations.is_empty()
    }
}

/// A signed transfer between two wallets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Per-sender sequence number, starting at 1. The chain accepts a
    /// transaction only when its txid is exactly the sender's counter + 1,
    /// which makes replays of an included transaction invalid.
    #[serde(rename = "TXID")]
    pub txid: u64,
    #[serde(rename = "Sender")]
    pub sender: String,
    #[serde(rename = "Recipient")]
    pub recipient: String,
    #[serde(rename = "Amount")]
    pub amount: f64,
    #[serde(rename = "Comment")]
    pub comment: String,
    /// Hex SHA-256 over the canonical serialization.
    #[serde(rename = "Hash")]
    pub hash: String,
    /// Base64 RSA-PSS signature of the decoded hash bytes by the sender.
    #[serde(rename = "Signature")]
    pub signature: String,
}

impl Transaction {
    /// Recomputes the hex hash from canonical form.
    pub fn compute_hash(&self) -> String {
        hash_hex(&format!(
            "{}{}{}{}{}",
            self.txid, self.sender, self.recipient, self.amount, self.comment
        ))
    }

    /// Builds a transaction from `wallet` and signs it.
    pub fn signed(
        wallet: &Wallet,
        txid: u64,
        recipient: impl Into<String>,
        amount: f64,
        comment: impl Into<String>,
    ) -> Result<Self, NodeError> {
        let mut tx = Transaction {
            txid,
            sender: wallet.address.clone(),
            recipient: recipient.into(),
            amount,
            comment: comment.into(),
            hash: String::new(),
            signature: String::new(),
        };
        tx.hash = tx.compute_hash();
        tx.signature = wallet.sign_hash(&from_hex(&tx.hash))?;
        Ok(tx)
    }

    /// Checks hash integrity and the sender's signature.
    pub fn verify(&self, sender_key: &RsaPublicKey) -> bool {
        if self.hash != self.compute_hash() {
            return false;
        }
        verify(&self.signature, &from_hex(&self.hash), sender_key)
    }
}

/// An event binding a wallet address to a public key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    #[serde(rename = "Wallet")]
    pub wallet: String,
    /// Canonical public key string, per [`crate::crypto::key_to_string`].
    #[serde(rename = "PublicKey")]
    pub public_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_is_stable() {
        let a = Block::genesis();
        let b = Block::genesis();
        assert_eq!(a.id, 0);
        assert!(a.previous.is_empty());
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.hash, a.compute_hash().unwrap());
    }

    #[test]
    fn block_hash_covers_every_header_field() {
        let base = Block {
            id: 3,
            nonce: 99,
            previous: "prev".into(),
            miner: "miner".into(),
            ..Block::default()
        };
        let reference = base.compute_hash().unwrap();

        let mutations: [fn(&mut Block); 6] = [
            |b| b.id += 1,
            |b| b.nonce += 1,
            |b| b.previous.push('x'),
            |b| b.miner.push('x'),
            |b| b.registrations.push(Registration::default()),
            |b| b.transactions.push(Transaction::default()),
        ];
        for mutate in mutations {
            let mut changed = base.clone();
            mutate(&mut changed);
            assert_ne!(changed.compute_hash().unwrap(), reference);
        }
    }

    #[test]
    fn block_hash_ignores_claimed_hash_field() {
        let mut block = Block {
            id: 1,
            previous: "p".into(),
            miner: "m".into(),
            ..Block::default()
        };
        let reference = block.compute_hash().unwrap();
        block.hash = "forged".into();
        assert_eq!(block.compute_hash().unwrap(), reference);
    }

    #[test]
    fn transaction_hash_excludes_signature() {
        let mut tx = Transaction {
            txid: 1,
            sender: "a".into(),
            recipient: "b".into(),
            amount: 0.5,
            comment: "coffee".into(),
            ..Transaction::default()
        };
        let reference = tx.compute_hash();
        tx.signature = "anything".into();
        assert_eq!(tx.compute_hash(), reference);

        tx.amount = 0.6;
        assert_ne!(tx.compute_hash(), reference);
    }

    #[test]
    fn signed_transaction_verifies() {
        let wallet = Wallet::generate().unwrap();
        let tx = Transaction::signed(&wallet, 1, "recipient", 0.25, "test").unwrap();

        assert!(tx.verify(&wallet.public_key()));

        let mut forged = tx.clone();
        forged.amount = 100.0;
        forged.hash = forged.compute_hash();
        assert!(!forged.verify(&wallet.public_key()));
    }

    #[test]
    fn wire_field_names_are_pascal_case() {
        let tx = Transaction::default();
        let json = serde_json::to_string(&tx).unwrap();
        for field in ["TXID", "Sender", "Recipient", "Amount", "Comment", "Hash", "Signature"] {
            assert!(json.contains(&format!("\"{}\"", field)), "missing {}", field);
        }

        let block = Block::default();
        let json = serde_json::to_string(&block).unwrap();
        for field in ["ID", "Nonce", "Hash", "Previous", "Miner", "Transactions", "Registrations"] {
            assert!(json.contains(&format!("\"{}\"", field)), "missing {}", field);
        }
    }
}
