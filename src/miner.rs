//! Parallel nonce search over the current mempool snapshot, with
//! cooperative cancellation.
//!
//! Every mining round takes a fresh cancellation flag from [`MinerControl`];
//! setting the flag means "all workers associated with this round must
//! exit". Workers poll it with a relaxed load on every nonce, so they stop
//! within one hash of a cancel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use parking_lot::Mutex;

use crate::chain::{required_difficulty, Block};
use crate::crypto::{from_hex, leading_zero_bytes};
use crate::network::Relay;

/// Hands out per-round cancellation flags and lets the block-accept path
/// and shutdown cancel whichever round is running.
#[derive(Default)]
pub struct MinerControl {
    current: Mutex<Option<Arc<AtomicBool>>>,
    shutdown: AtomicBool,
}

impl MinerControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new round, cancelling the previous one on the way out.
    pub fn begin_round(&self) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(self.shutdown.load(Ordering::Relaxed)));
        if let Some(old) = self.current.lock().replace(Arc::clone(&flag)) {
            old.store(true, Ordering::Relaxed);
        }
        flag
    }

    /// Cancels the running round, if any. The miner loop reacts by
    /// re-snapshotting the head and mempool.
    pub fn cancel_current(&self) {
        if let Some(flag) = self.current.lock().as_ref() {
            flag.store(true, Ordering::Relaxed);
        }
    }

    /// Cancels the running round and prevents new ones from starting.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.cancel_current();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// Searches for a nonce that gives `candidate` its required difficulty.
///
/// Spawns `threads` workers, each seeded with a distinct random nonce and
/// incrementing from there. The first solution wins; the flag is then set
/// so the remaining workers drop out. Returns `None` when the round was
/// cancelled before a solution was found.
pub fn mine(mut candidate: Block, threads: usize, cancel: &Arc<AtomicBool>) -> Option<Block> {
    let difficulty = required_difficulty(&candidate);
    let (result_tx, result_rx) = mpsc::channel();

    thread::scope(|scope| {
        for _ in 0..threads.max(1) {
            let result_tx = result_tx.clone();
            let cancel = Arc::clone(cancel);
            let mut block = candidate.clone();
            scope.spawn(move || {
                block.nonce = rand::random();
                while !cancel.load(Ordering::Relaxed) {
                    let Ok(hash) = block.compute_hash() else {
                        return;
                    };
                    if leading_zero_bytes(&from_hex(&hash)) == difficulty {
                        // First result wins; a closed channel means another
                        // worker already won.
                        let _ = result_tx.send((block.nonce, hash));
                        return;
                    }
                    block.nonce = block.nonce.wrapping_add(1);
                }
            });
        }
        drop(result_tx);

        // Err means every worker exited without a solution, i.e. cancelled.
        match result_rx.recv() {
            Ok((nonce, hash)) => {
                cancel.store(true, Ordering::Relaxed);
                candidate.nonce = nonce;
                candidate.hash = hash;
                Some(candidate)
            }
            Err(_) => None,
        }
    })
}

/// Supervising loop: snapshot the head and mempool, mine, feed the result
/// back through the relay's accept path, repeat. A cancelled round simply
/// re-snapshots, so the next candidate always builds on the freshest head.
pub async fn run(relay: Arc<Relay>, control: Arc<MinerControl>, threads: usize) {
    log::info!("miner started with {} workers", threads);
    while !control.is_shutdown() {
        let candidate = relay.build_candidate();
        let flag = control.begin_round();
        let round = tokio::task::spawn_blocking(move || mine(candidate, threads, &flag));
        match round.await {
            Ok(Some(block)) => relay.submit_mined_block(block),
            Ok(None) => {}
            Err(e) => {
                log::error!("mining round failed: {}", e);
                break;
            }
        }
    }
    log::info!("miner stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::model::Registration;
    use crate::chain::{validate, BlockVerdict, Chainstate};
    use crate::config::BLOCK_DIFF;

    fn candidate(state: &Chainstate) -> Block {
        Block {
            id: state.last_block.id + 1,
            previous: state.last_block.hash.clone(),
            miner: "miner".into(),
            registrations: vec![Registration {
                wallet: "fresh-wallet".into(),
                public_key: "a-key".into(),
            }],
            ..Block::default()
        }
    }

    #[test]
    fn mines_an_acceptable_block() {
        let state = Chainstate::default();
        let cancel = Arc::new(AtomicBool::new(false));

        let block = mine(candidate(&state), 2, &cancel).expect("solution");

        assert_eq!(leading_zero_bytes(&from_hex(&block.hash)), BLOCK_DIFF);
        assert_eq!(block.hash, block.compute_hash().unwrap());
        assert_eq!(validate(&state, &block), BlockVerdict::Accept);
        // The winning round cancels its own workers.
        assert!(cancel.load(Ordering::Relaxed));
    }

    #[test]
    fn cancelled_round_returns_none() {
        let state = Chainstate::default();
        let cancel = Arc::new(AtomicBool::new(true));

        assert!(mine(candidate(&state), 4, &cancel).is_none());
    }

    #[test]
    fn new_round_cancels_the_previous_one() {
        let control = MinerControl::new();
        let first = control.begin_round();
        let second = control.begin_round();

        assert!(first.load(Ordering::Relaxed));
        assert!(!second.load(Ordering::Relaxed));

        control.cancel_current();
        assert!(second.load(Ordering::Relaxed));
    }

    #[test]
    fn shutdown_poisons_future_rounds() {
        let control = MinerControl::new();
        let round = control.begin_round();
        control.shutdown();

        assert!(round.load(Ordering::Relaxed));
        assert!(control.begin_round().load(Ordering::Relaxed));
        assert!(control.is_shutdown());
    }

    #[tokio::test]
    async fn mining_loop_extends_the_chain() {
        use crate::chain::Chain;
        use crate::wallet::Wallet;
        use std::time::{Duration, Instant};

        let control = Arc::new(MinerControl::new());
        let relay = Relay::new(
            Chain::new(),
            Wallet::generate().unwrap(),
            true,
            Arc::clone(&control),
        );
        relay.announce_self().unwrap();

        tokio::spawn(run(Arc::clone(&relay), Arc::clone(&control), 2));

        let deadline = Instant::now() + Duration::from_secs(60);
        while relay.head_id() < 2 {
            assert!(Instant::now() < deadline, "miner made no progress");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        control.shutdown();

        // Block 1 carries our own registration; later blocks build on it.
        let miner_address = relay.wallet_address().to_string();
        relay.with_chain(|chain| {
            assert_eq!(chain.blocks()[1].miner, miner_address);
            assert!(chain
                .blocks()[1]
                .registrations
                .iter()
                .any(|r| r.wallet == miner_address));
            assert!(chain.chainstate().wallet(&miner_address).unwrap().amount >= 2.0);
        });
    }
}
