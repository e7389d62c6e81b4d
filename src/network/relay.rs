//! The relay: peer connection lifecycle, message dispatch, broadcast
//! fan-out, and the floating mempools.
//!
//! Each connection gets a reader task (streaming frame decode + dispatch)
//! and a writer task draining an outbound channel, so broadcasts never
//! block on a slow peer's socket. Handlers run on the reader task and are
//! synchronous: chain and mempool locks are short-lived and never held
//! across an await.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::chain::{Block, Chain, Registration, Transaction};
use crate::config::MAX_SYNC_BLOCKS;
use crate::error::NodeError;
use crate::miner::MinerControl;
use crate::network::protocol::{
    FrameReader, Message, MessageType, SyncNextBlocks, SyncRequest,
};
use crate::network::sync::SyncCoordinator;
use crate::wallet::Wallet;

struct PeerHandle {
    outbound: UnboundedSender<String>,
}

pub struct Relay {
    chain: Mutex<Chain>,
    floating_txs: Mutex<Vec<Transaction>>,
    floating_regs: Mutex<Vec<Registration>>,
    peers: Mutex<HashMap<u64, PeerHandle>>,
    next_peer_id: AtomicU64,
    wallet: Wallet,
    /// Suppress rebroadcast of items received from peers.
    local: bool,
    miner_control: Arc<MinerControl>,
    sync: SyncCoordinator,
}

impl Relay {
    pub fn new(
        chain: Chain,
        wallet: Wallet,
        local: bool,
        miner_control: Arc<MinerControl>,
    ) -> Arc<Self> {
        Arc::new(Relay {
            chain: Mutex::new(chain),
            floating_txs: Mutex::new(Vec::new()),
            floating_regs: Mutex::new(Vec::new()),
            peers: Mutex::new(HashMap::new()),
            next_peer_id: AtomicU64::new(0),
            wallet,
            local,
            miner_control,
            sync: SyncCoordinator::new(),
        })
    }

    // ----- connection lifecycle -----

    /// Accepts inbound connections forever, one reader task each.
    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(Arc::clone(&self).run_connection(stream));
                }
                Err(e) => {
                    log::warn!("could not accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Dials each configured peer on its own task, retrying forever.
    pub fn dial_peers(self: Arc<Self>, peers: Vec<String>) {
        for addr in peers {
            tokio::spawn(Arc::clone(&self).dial_loop(addr));
        }
    }

    async fn dial_loop(self: Arc<Self>, addr: String) {
        let mut backoff = Duration::from_secs(1);
        loop {
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    backoff = Duration::from_secs(1);
                    Arc::clone(&self).run_connection(stream).await;
                    log::info!("connection to {} closed, redialing", addr);
                }
                Err(e) => {
                    log::debug!("could not reach {}: {}", addr, e);
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(60));
        }
    }

    /// Registers the connection and reads it until it closes. Malformed
    /// frames are logged and skipped; only I/O errors end the reader.
    async fn run_connection(self: Arc<Self>, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        let (read_half, write_half) = stream.into_split();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        self.peers.lock().insert(id, PeerHandle { outbound: outbound_tx });
        log::info!("peer {} connected", peer);

        let writer = tokio::spawn(writer_loop(write_half, outbound_rx));

        let mut reader = FrameReader::new(read_half);
        loop {
            match reader.next_message().await {
                Ok(Some(message)) => self.dispatch(message, id),
                Ok(None) => break,
                Err(NodeError::Io(e)) => {
                    log::debug!("peer {} read error: {}", peer, e);
                    break;
                }
                Err(e) => log::warn!("peer {} sent a malformed message: {}", peer, e),
            }
        }

        self.peers.lock().remove(&id);
        writer.abort();
        log::info!("peer {} disconnected", peer);
    }

    /// Drops every peer connection.
    pub fn shutdown(&self) {
        self.peers.lock().clear();
    }

    // ----- dispatch and handlers -----

    fn dispatch(&self, message: Message, peer_id: u64) {
        match message.kind() {
            Some(MessageType::NewBlock) => self.handle_new_block(&message, peer_id),
            Some(MessageType::NewTx) => self.handle_new_tx(&message),
            Some(MessageType::NewRx) => self.handle_new_rx(&message),
            Some(MessageType::Sync) => self.handle_sync(&message, peer_id),
            Some(MessageType::SyncNextBlocks) => self.handle_sync_next_blocks(&message),
            Some(MessageType::Init) | Some(MessageType::InitBlocks) => {
                // Reserved for a future chain bootstrap handshake.
                log::debug!("reserved message type {} ignored", message.kind);
            }
            None => log::warn!("message with unknown type {} ignored", message.kind),
        }
    }

    fn handle_new_block(&self, message: &Message, peer_id: u64) {
        let block: Block = match message.decode() {
            Ok(block) => block,
            Err(e) => {
                log::warn!("undecodable block payload: {}", e);
                return;
            }
        };

        let verdict = {
            let mut chain = self.chain.lock();
            if chain.blocks().iter().any(|b| b.hash == block.hash) {
                log::debug!("duplicate block {} ignored", block.id);
                return;
            }
            chain.try_accept(block.clone())
        };

        if verdict.is_accept() {
            log::info!("accepted block {} from peer", block.id);
            self.evict_included(&block);
            self.miner_control.cancel_current();
            if !self.local {
                self.broadcast_block(&block);
            }
        } else {
            log::warn!("rejected block {}, reason={}", block.id, verdict);
            // The peer may be ahead of us; ask it for its tail.
            self.request_sync(peer_id);
        }
    }

    fn handle_new_tx(&self, message: &Message) {
        let tx: Transaction = match message.decode() {
            Ok(tx) => tx,
            Err(e) => {
                log::warn!("undecodable transaction payload: {}", e);
                return;
            }
        };

        let valid = {
            let chain = self.chain.lock();
            let state = chain.chainstate();
            match (state.wallet(&tx.sender), state.public_key_of(&tx.sender)) {
                (Some(info), Some(key)) => tx.verify(&key) && tx.txid == info.txc + 1,
                _ => false,
            }
        };
        if !valid {
            log::warn!("rejected floating transaction {} from {}", tx.txid, tx.sender);
            return;
        }

        {
            let mut floating = self.floating_txs.lock();
            if floating
                .iter()
                .any(|t| t.sender == tx.sender && t.txid == tx.txid)
            {
                return;
            }
            floating.push(tx.clone());
        }
        log::info!("admitted floating transaction {} from {}", tx.txid, tx.sender);
        if !self.local {
            self.broadcast_tx(&tx);
        }
    }

    fn handle_new_rx(&self, message: &Message) {
        let reg: Registration = match message.decode() {
            Ok(reg) => reg,
            Err(e) => {
                log::warn!("undecodable registration payload: {}", e);
                return;
            }
        };

        // Full validity is judged at block inclusion time.
        {
            let mut floating = self.floating_regs.lock();
            if floating.iter().any(|r| r.wallet == reg.wallet) {
                return;
            }
            floating.push(reg.clone());
        }
        log::info!("admitted floating registration for {}", reg.wallet);
        if !self.local {
            self.broadcast_registration(&reg);
        }
    }

    fn handle_sync(&self, message: &Message, peer_id: u64) {
        let request: SyncRequest = match message.decode() {
            Ok(request) => request,
            Err(e) => {
                log::warn!("undecodable sync request: {}", e);
                return;
            }
        };

        let (head, mut blocks) = {
            let chain = self.chain.lock();
            let blocks = chain
                .blocks_after(&request.last_block_hash)
                .unwrap_or_else(|| chain.full_tail());
            (chain.head().id, blocks)
        };
        blocks.truncate(MAX_SYNC_BLOCKS);
        log::debug!("serving sync request with {} blocks", blocks.len());

        match Message::new(MessageType::SyncNextBlocks, &SyncNextBlocks { head, blocks }) {
            Ok(reply) => {
                self.send_to(peer_id, &reply);
            }
            Err(e) => log::error!("could not build sync reply: {}", e),
        }
    }

    fn handle_sync_next_blocks(&self, message: &Message) {
        // Whatever the reply contains, the sync transaction is over.
        self.sync.complete();

        let payload: SyncNextBlocks = match message.decode() {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("undecodable sync reply: {}", e);
                return;
            }
        };

        if payload.head <= self.chain.lock().head().id {
            log::debug!("sync reply head {} is not ahead of us", payload.head);
            return;
        }

        // Blocks travel most recent first; process chronologically.
        let chronological: Vec<Block> = payload.blocks.into_iter().rev().collect();
        let adopted = self.chain.lock().adopt_chain(&chronological);
        if !adopted {
            return;
        }

        let applied: Vec<Block> = {
            let chain = self.chain.lock();
            chronological
                .into_iter()
                .filter(|b| chain.blocks().iter().any(|h| h.hash == b.hash))
                .collect()
        };
        for block in &applied {
            self.evict_included(block);
        }
        self.miner_control.cancel_current();
        log::info!(
            "adopted {} blocks from sync, head is now {}",
            applied.len(),
            self.chain.lock().head().id
        );
    }

    /// Opens a sync with `peer_id` unless one is already in flight.
    fn request_sync(&self, peer_id: u64) {
        if !self.sync.try_begin() {
            return;
        }
        let request = SyncRequest {
            last_block_hash: self.chain.lock().head().hash.clone(),
        };
        match Message::new(MessageType::Sync, &request) {
            Ok(message) => {
                if self.send_to(peer_id, &message) {
                    log::info!("sync opened with peer");
                } else {
                    self.sync.complete();
                }
            }
            Err(e) => {
                log::error!("could not build sync request: {}", e);
                self.sync.complete();
            }
        }
    }

    // ----- broadcast fan-out -----

    pub fn broadcast_block(&self, block: &Block) {
        self.broadcast(MessageType::NewBlock, block, "block");
    }

    pub fn broadcast_tx(&self, tx: &Transaction) {
        self.broadcast(MessageType::NewTx, tx, "transaction");
    }

    pub fn broadcast_registration(&self, reg: &Registration) {
        self.broadcast(MessageType::NewRx, reg, "registration");
    }

    fn broadcast(&self, kind: MessageType, payload: &impl Serialize, what: &str) {
        let frame = match Message::new(kind, payload).and_then(|m| m.encode()) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("could not serialize {} for broadcast: {}", what, e);
                return;
            }
        };
        self.send_all(&frame);
    }

    /// Best-effort send to every peer; dead connections are pruned, not
    /// retried.
    fn send_all(&self, frame: &str) {
        let mut dead = Vec::new();
        {
            let peers = self.peers.lock();
            for (id, handle) in peers.iter() {
                if handle.outbound.send(frame.to_string()).is_err() {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut peers = self.peers.lock();
            for id in dead {
                peers.remove(&id);
            }
        }
    }

    fn send_to(&self, peer_id: u64, message: &Message) -> bool {
        let Ok(frame) = message.encode() else {
            return false;
        };
        let sent = self
            .peers
            .lock()
            .get(&peer_id)
            .map(|handle| handle.outbound.send(frame).is_ok())
            .unwrap_or(false);
        if !sent {
            self.peers.lock().remove(&peer_id);
        }
        sent
    }

    // ----- mempool and mining support -----

    /// Removes mempool entries included in `block`, matching transactions
    /// by (sender, txid) and registrations by wallet address.
    fn evict_included(&self, block: &Block) {
        if !block.transactions.is_empty() {
            self.floating_txs.lock().retain(|tx| {
                !block
                    .transactions
                    .iter()
                    .any(|b| b.sender == tx.sender && b.txid == tx.txid)
            });
        }
        if !block.registrations.is_empty() {
            self.floating_regs
                .lock()
                .retain(|reg| !block.registrations.iter().any(|b| b.wallet == reg.wallet));
        }
    }

    /// Builds the next mining candidate from the current head and mempool.
    ///
    /// Floating entries that no longer fit the chainstate (stale txids,
    /// uncovered amounts) are left out so the miner never grinds on a block
    /// its own node would reject.
    pub fn build_candidate(&self) -> Block {
        let chain = self.chain.lock();
        let state = chain.chainstate();
        let mut candidate = Block {
            id: chain.head().id + 1,
            previous: chain.head().hash.clone(),
            miner: self.wallet.address.clone(),
            ..Block::default()
        };

        let mut bound = HashSet::new();
        for reg in self.floating_regs.lock().iter() {
            if bound.insert(reg.wallet.clone()) {
                candidate.registrations.push(reg.clone());
            }
        }

        let mut balances: HashMap<String, f64> = HashMap::new();
        let mut counters: HashMap<String, u64> = HashMap::new();
        for tx in self.floating_txs.lock().iter() {
            let Some(info) = state.wallet(&tx.sender) else {
                continue;
            };
            let counter = counters.entry(tx.sender.clone()).or_insert(info.txc);
            let balance = balances.entry(tx.sender.clone()).or_insert(info.amount);
            if tx.txid != *counter + 1 || tx.amount < 0.0 || tx.amount > *balance {
                continue;
            }
            *counter += 1;
            *balance -= tx.amount;
            if let Some(recipient) = state.wallet(&tx.recipient) {
                *balances
                    .entry(tx.recipient.clone())
                    .or_insert(recipient.amount) += tx.amount;
            }
            candidate.transactions.push(tx.clone());
        }

        candidate
    }

    /// Feeds a self-mined block through the same accept path as peer
    /// blocks. A reject here just means a peer block won the race.
    pub fn submit_mined_block(&self, block: Block) {
        let verdict = self.chain.lock().try_accept(block.clone());
        if verdict.is_accept() {
            log::info!("mined block {} accepted, hash {}", block.id, block.hash);
            self.evict_included(&block);
            self.broadcast_block(&block);
        } else {
            log::debug!("mined block {} obsolete, reason={}", block.id, verdict);
        }
    }

    /// Broadcasts a registration for our own wallet when the chain does not
    /// know it yet, and queues it for our own miner.
    pub fn announce_self(&self) -> Result<(), NodeError> {
        if self.chain.lock().chainstate().is_registered(&self.wallet.address) {
            return Ok(());
        }
        let reg = Registration {
            wallet: self.wallet.address.clone(),
            public_key: self.wallet.public_key_string()?,
        };
        {
            let mut floating = self.floating_regs.lock();
            if !floating.iter().any(|r| r.wallet == reg.wallet) {
                floating.push(reg.clone());
            }
        }
        log::info!("announcing wallet {}", self.wallet.address);
        self.broadcast_registration(&reg);
        Ok(())
    }

    // ----- introspection -----

    pub fn wallet_address(&self) -> &str {
        &self.wallet.address
    }

    pub fn head_id(&self) -> u64 {
        self.chain.lock().head().id
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn floating_counts(&self) -> (usize, usize) {
        (self.floating_txs.lock().len(), self.floating_regs.lock().len())
    }

    /// Runs `f` under the chain lock.
    pub fn with_chain<T>(&self, f: impl FnOnce(&Chain) -> T) -> T {
        f(&self.chain.lock())
    }

    /// Writes the chain snapshot to disk.
    pub fn persist_chain(&self, path: &str) -> Result<(), NodeError> {
        self.chain.lock().persist(path)
    }
}

async fn writer_loop(mut write_half: OwnedWriteHalf, mut outbound: UnboundedReceiver<String>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = write_half.write_all(frame.as_bytes()).await {
            log::debug!("peer write failed: {}", e);
            break;
        }
    }
}
