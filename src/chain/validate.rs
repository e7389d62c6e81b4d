//! Pure block validation against a chainstate.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::chain::model::Block;
use crate::chain::state::Chainstate;
use crate::config::{BLOCK_DIFF, EMPTY_BLOCK_DIFF};
use crate::crypto::{from_hex, leading_zero_bytes, string_to_key};

/// Outcome of validating a candidate block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockVerdict {
    Accept,
    /// `previous` does not match the current head's hash.
    RejectHashLink,
    /// `id` is not the current head's id + 1.
    RejectId,
    /// The recomputed hash does not meet the required difficulty.
    RejectDifficulty,
    /// Missing vital fields, id 0, a duplicate in-block registration, or a
    /// claimed hash that disagrees with the canonical form.
    RejectMalformed,
    /// A transaction failed: unknown sender, bad signature, wrong txid, or
    /// insufficient balance.
    RejectTx,
}

impl BlockVerdict {
    pub fn is_accept(self) -> bool {
        self == BlockVerdict::Accept
    }
}

impl fmt::Display for BlockVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockVerdict::Accept => "BLOCK_ACCEPT",
            BlockVerdict::RejectHashLink => "BLOCK_REJECT_NO_HASH_SEQUENCE_INTEGRITY",
            BlockVerdict::RejectId => "BLOCK_REJECT_NO_ID_SEQUENCE_INTEGRITY",
            BlockVerdict::RejectDifficulty => "BLOCK_REJECT_WRONG_HASH_DIFF",
            BlockVerdict::RejectMalformed => "BLOCK_REJECT_BLOCK_INVALID",
            BlockVerdict::RejectTx => "BLOCK_REJECT_TRANSACTION_INVALID",
        };
        f.write_str(name)
    }
}

/// The difficulty a block of this shape must meet.
pub fn required_difficulty(block: &Block) -> u8 {
    if block.has_payload() {
        BLOCK_DIFF
    } else {
        EMPTY_BLOCK_DIFF
    }
}

/// Validates `block` as the next block on top of `state`. Pure: no side
/// effects on either argument.
///
/// The hash is recomputed from canonical form and must agree with the
/// claimed hash; difficulty is judged on the recomputed value, so a peer
/// cannot pair easy content with a hand-picked hash string. Transactions are
/// applied to a scratch view sequentially, which enforces gapless txids and
/// cumulative balance limits for multiple transfers from one sender within
/// the same block.
pub fn validate(state: &Chainstate, block: &Block) -> BlockVerdict {
    if block.hash.is_empty() || block.miner.is_empty() || block.previous.is_empty() {
        return BlockVerdict::RejectMalformed;
    }
    if block.id == 0 {
        return BlockVerdict::RejectMalformed;
    }
    let Ok(recomputed) = block.compute_hash() else {
        return BlockVerdict::RejectMalformed;
    };
    if recomputed != block.hash {
        return BlockVerdict::RejectMalformed;
    }

    if block.previous != state.last_block.hash {
        return BlockVerdict::RejectHashLink;
    }
    if block.id != state.last_block.id + 1 {
        return BlockVerdict::RejectId;
    }
    if leading_zero_bytes(&from_hex(&recomputed)) != required_difficulty(block) {
        return BlockVerdict::RejectDifficulty;
    }

    let mut bound = HashSet::new();
    for reg in &block.registrations {
        if !bound.insert(reg.wallet.as_str()) {
            return BlockVerdict::RejectMalformed;
        }
    }

    // Scratch balances and counters so in-block sequences are judged
    // against the state each transaction would actually see.
    let mut balances: HashMap<&str, f64> = HashMap::new();
    let mut counters: HashMap<&str, u64> = HashMap::new();
    for tx in &block.transactions {
        let Some(info) = state.wallet(&tx.sender) else {
            return BlockVerdict::RejectTx;
        };
        let Ok(key) = string_to_key(&info.public_key) else {
            return BlockVerdict::RejectTx;
        };
        if !tx.verify(&key) {
            return BlockVerdict::RejectTx;
        }
        let counter = counters.entry(tx.sender.as_str()).or_insert(info.txc);
        if tx.txid != *counter + 1 {
            return BlockVerdict::RejectTx;
        }
        let balance = balances.entry(tx.sender.as_str()).or_insert(info.amount);
        if tx.amount < 0.0 || tx.amount > *balance {
            return BlockVerdict::RejectTx;
        }
        *balance -= tx.amount;
        *counter += 1;
        if let Some(info) = state.wallet(&tx.recipient) {
            *balances.entry(tx.recipient.as_str()).or_insert(info.amount) += tx.amount;
        }
    }

    BlockVerdict::Accept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::model::{Registration, Transaction};
    use crate::chain::testing::{registered_state, solve_nonce};
    use crate::wallet::Wallet;

    fn next_block(state: &Chainstate) -> Block {
        Block {
            id: state.last_block.id + 1,
            previous: state.last_block.hash.clone(),
            miner: "miner-address".into(),
            ..Block::default()
        }
    }

    #[test]
    fn accepts_solved_registration_block() {
        let state = Chainstate::default();
        let wallet = Wallet::generate().unwrap();

        let mut block = next_block(&state);
        block.registrations.push(Registration {
            wallet: wallet.address.clone(),
            public_key: wallet.public_key_string().unwrap(),
        });
        solve_nonce(&mut block);

        assert_eq!(validate(&state, &block), BlockVerdict::Accept);
    }

    #[test]
    fn rejects_broken_hash_link() {
        let state = Chainstate::default();
        let mut block = next_block(&state);
        block.previous = "somewhere-else".into();
        solve_nonce(&mut block);

        assert_eq!(validate(&state, &block), BlockVerdict::RejectHashLink);
    }

    #[test]
    fn rejects_wrong_id() {
        let state = Chainstate::default();
        let mut block = next_block(&state);
        block.id += 1;
        solve_nonce(&mut block);

        assert_eq!(validate(&state, &block), BlockVerdict::RejectId);
    }

    #[test]
    fn rejects_wrong_difficulty() {
        let state = Chainstate::default();
        // A payload-free block needs two leading zero bytes; give it a
        // nonce solved for one.
        let mut block = next_block(&state);
        loop {
            block.hash = block.compute_hash().unwrap();
            if leading_zero_bytes(&from_hex(&block.hash)) == BLOCK_DIFF {
                break;
            }
            block.nonce += 1;
        }

        assert_eq!(validate(&state, &block), BlockVerdict::RejectDifficulty);
    }

    #[test]
    fn rejects_forged_hash() {
        let state = Chainstate::default();
        let mut block = next_block(&state);
        solve_nonce(&mut block);
        block.hash = format!("0000{}", &block.hash[4..]);

        assert_eq!(validate(&state, &block), BlockVerdict::RejectMalformed);
    }

    #[test]
    fn rejects_missing_fields_and_id_zero() {
        let state = Chainstate::default();

        let mut no_miner = next_block(&state);
        no_miner.miner.clear();
        solve_nonce(&mut no_miner);
        assert_eq!(validate(&state, &no_miner), BlockVerdict::RejectMalformed);

        let mut id_zero = next_block(&state);
        id_zero.id = 0;
        solve_nonce(&mut id_zero);
        assert_eq!(validate(&state, &id_zero), BlockVerdict::RejectMalformed);
    }

    #[test]
    fn rejects_duplicate_in_block_registration() {
        let state = Chainstate::default();
        let wallet = Wallet::generate().unwrap();
        let reg = Registration {
            wallet: wallet.address.clone(),
            public_key: wallet.public_key_string().unwrap(),
        };

        let mut block = next_block(&state);
        block.registrations.push(reg.clone());
        block.registrations.push(reg);
        solve_nonce(&mut block);

        assert_eq!(validate(&state, &block), BlockVerdict::RejectMalformed);
    }

    #[test]
    fn rejects_unknown_sender() {
        let state = Chainstate::default();
        let wallet = Wallet::generate().unwrap();

        let mut block = next_block(&state);
        block
            .transactions
            .push(Transaction::signed(&wallet, 1, "nobody", 0.1, "").unwrap());
        solve_nonce(&mut block);

        assert_eq!(validate(&state, &block), BlockVerdict::RejectTx);
    }

    #[test]
    fn rejects_replayed_txid() {
        let (state, wallet) = registered_state(2.0, 1);

        let mut block = next_block(&state);
        block
            .transactions
            .push(Transaction::signed(&wallet, 1, "nobody", 0.1, "replay").unwrap());
        solve_nonce(&mut block);

        assert_eq!(validate(&state, &block), BlockVerdict::RejectTx);
    }

    #[test]
    fn rejects_overspend() {
        let (state, wallet) = registered_state(0.3, 0);

        let mut block = next_block(&state);
        block
            .transactions
            .push(Transaction::signed(&wallet, 1, "nobody", 0.5, "too much").unwrap());
        solve_nonce(&mut block);

        assert_eq!(validate(&state, &block), BlockVerdict::RejectTx);
    }

    #[test]
    fn rejects_cumulative_overspend_within_block() {
        let (state, wallet) = registered_state(1.0, 0);

        // Each transfer alone is covered, together they are not.
        let mut block = next_block(&state);
        block
            .transactions
            .push(Transaction::signed(&wallet, 1, "nobody", 0.7, "first").unwrap());
        block
            .transactions
            .push(Transaction::signed(&wallet, 2, "nobody", 0.7, "second").unwrap());
        solve_nonce(&mut block);

        assert_eq!(validate(&state, &block), BlockVerdict::RejectTx);
    }

    #[test]
    fn accepts_sequential_transfers_within_block() {
        let (state, wallet) = registered_state(1.0, 0);

        let mut block = next_block(&state);
        block
            .transactions
            .push(Transaction::signed(&wallet, 1, "nobody", 0.4, "first").unwrap());
        block
            .transactions
            .push(Transaction::signed(&wallet, 2, "nobody", 0.4, "second").unwrap());
        solve_nonce(&mut block);

        assert_eq!(validate(&state, &block), BlockVerdict::Accept);
    }

    #[test]
    fn rejects_gapped_txids_within_block() {
        let (state, wallet) = registered_state(1.0, 0);

        let mut block = next_block(&state);
        block
            .transactions
            .push(Transaction::signed(&wallet, 1, "nobody", 0.1, "first").unwrap());
        block
            .transactions
            .push(Transaction::signed(&wallet, 3, "nobody", 0.1, "gap").unwrap());
        solve_nonce(&mut block);

        assert_eq!(validate(&state, &block), BlockVerdict::RejectTx);
    }
}
