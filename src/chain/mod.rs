//! The chain: block/transaction/registration model, derived account state,
//! the pure block validator, and the engine that owns the block list.

pub mod engine;
pub mod model;
pub mod state;
pub mod validate;

pub use engine::Chain;
pub use model::{Block, Registration, Transaction};
pub use state::{Chainstate, WalletInfo};
pub use validate::{required_difficulty, validate, BlockVerdict};
