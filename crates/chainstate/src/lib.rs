pub mod block_store;
pub mod chain_store;
pub mod error;
pub mod header_chain;
mod pipe;
pub mod state;
pub mod txhashset;
mod txhashset_proc;

pub use block_store::BlockStore;
pub use chain_store::{BlockIndex, Branch, ChainStore, NodeId};
pub use error::{ApplyError, ChainError, ChainStatus};
pub use state::{ChainState, TipInfo};
pub use txhashset::{Roots, TxHashSet};
