//! The chain engine: exclusive owner of the block list and the derived
//! chainstate. All mutation flows through [`Chain::process_block`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::chain::model::Block;
use crate::chain::state::{Chainstate, WalletInfo};
use crate::chain::validate::{validate, BlockVerdict};
use crate::config::BLOCK_REWARD;
use crate::error::NodeError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    #[serde(rename = "Blocks")]
    blocks: Vec<Block>,
    #[serde(rename = "Chainstate")]
    chainstate: Chainstate,
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

impl Chain {
    /// A fresh chain holding only the genesis block.
    pub fn new() -> Self {
        Chain {
            blocks: vec![Block::genesis()],
            chainstate: Chainstate::default(),
        }
    }

    /// The most recently accepted block.
    pub fn head(&self) -> &Block {
        &self.chainstate.last_block
    }

    pub fn chainstate(&self) -> &Chainstate {
        &self.chainstate
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn validate(&self, block: &Block) -> BlockVerdict {
        validate(&self.chainstate, block)
    }

    /// Applies a block that already passed [`Chain::validate`]: creates
    /// wallets for its registrations, credits the miner, applies each
    /// transfer, and advances the head.
    pub fn process_block(&mut self, block: Block) {
        for reg in &block.registrations {
            self.chainstate.wallets.insert(
                reg.wallet.clone(),
                WalletInfo {
                    txc: 0,
                    amount: 0.0,
                    public_key: reg.public_key.clone(),
                },
            );
        }

        self.chainstate
            .wallets
            .entry(block.miner.clone())
            .or_default()
            .amount += BLOCK_REWARD;
        self.chainstate.market_volume += BLOCK_REWARD;

        for tx in &block.transactions {
            if let Some(sender) = self.chainstate.wallets.get_mut(&tx.sender) {
                sender.amount -= tx.amount;
                sender.txc += 1;
            }
            self.chainstate
                .wallets
                .entry(tx.recipient.clone())
                .or_default()
                .amount += tx.amount;
            self.chainstate.transaction_volume += 1;
        }

        self.chainstate.last_block = block.clone();
        self.blocks.push(block);
    }

    /// Validates and, on accept, processes a block.
    pub fn try_accept(&mut self, block: Block) -> BlockVerdict {
        let verdict = self.validate(&block);
        if verdict.is_accept() {
            self.process_block(block);
        }
        verdict
    }

    /// Clears the derived state and replays every non-genesis block through
    /// validate + process, skipping invalid ones. Used after loading from
    /// disk; idempotent.
    pub fn rebuild(&mut self) {
        let replay: Vec<Block> = self.blocks.drain(..).collect();
        self.chainstate = Chainstate::default();
        self.blocks.push(self.chainstate.last_block.clone());

        for block in replay.into_iter().filter(|b| b.id != 0) {
            let verdict = self.validate(&block);
            if verdict.is_accept() {
                self.process_block(block);
            } else {
                log::warn!(
                    "block {} is invalid and will be skipped, reason={}",
                    block.id,
                    verdict
                );
            }
        }
    }

    /// The blocks a syncing peer is missing, most recent first. `None` when
    /// the peer's hash is unknown to us; the caller then sends the whole
    /// non-genesis tail instead.
    pub fn blocks_after(&self, hash: &str) -> Option<Vec<Block>> {
        let position = self.blocks.iter().position(|b| b.hash == hash)?;
        Some(self.blocks[position + 1..].iter().rev().cloned().collect())
    }

    /// The whole non-genesis tail, most recent first.
    pub fn full_tail(&self) -> Vec<Block> {
        self.blocks[1..].iter().rev().cloned().collect()
    }

    /// Adopts a chronologically ordered batch of peer blocks when doing so
    /// strictly advances the head.
    ///
    /// The batch must attach to a block we hold (its first block's
    /// `previous`). The local prefix up to the attach point plus the batch
    /// is replayed on a scratch chain, stopping at the first invalid block,
    /// so a malicious peer cannot poison state beyond the point of
    /// divergence. Only a scratch head strictly greater than the current
    /// head replaces the live chain; returns whether it did.
    pub fn adopt_chain(&mut self, batch: &[Block]) -> bool {
        let Some(first) = batch.first() else {
            return false;
        };
        let Some(attach) = self.blocks.iter().position(|b| b.hash == first.previous) else {
            log::debug!("sync batch does not attach to any held block");
            return false;
        };

        let mut scratch = Chain::new();
        for block in self.blocks.iter().take(attach + 1).skip(1) {
            scratch.process_block(block.clone());
        }
        for block in batch {
            let verdict = scratch.validate(block);
            if !verdict.is_accept() {
                log::warn!("sync block {} rejected, reason={}", block.id, verdict);
                break;
            }
            scratch.process_block(block.clone());
        }

        if scratch.head().id > self.head().id {
            *self = scratch;
            true
        } else {
            false
        }
    }

    /// Writes the full chain as JSON, atomically (temp file then rename).
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<(), NodeError> {
        let path = path.as_ref();
        let content = serde_json::to_string(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Reads a persisted chain. Callers rebuild afterwards so the derived
    /// state never depends on what the file claims.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path)?;
        let chain: Chain = serde_json::from_str(&content)
            .map_err(|e| NodeError::Chain(format!("could not deserialize chain: {}", e)))?;
        Ok(chain)
    }
}
