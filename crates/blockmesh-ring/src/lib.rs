//! # blockmesh-ring
//!
//! A consistent-hash ring over uid-scoped stores.
//!
//! Every member is identified by its persistent store id. A key belongs to
//! the member with the greatest id not exceeding the key's placement hash,
//! wrapping around to the greatest id. Adding a member migrates the blocks
//! the new membership assigns to it.
//!
//! ```text
//!   ids:    1f....   5a....   a0....   e7....
//!           |--------|--------|--------|--------> (wraps to e7)
//!   hash 63.. -> 5a      hash 0c.. -> e7
//! ```
//!
//! [`UnifiedBlockStore`] is itself a [`blockmesh_store::BlockSource`], so
//! blob layers can sit on a ring exactly as on a single accessor.

mod placement;
mod unified;

pub use placement::{placement_hash, predecessor, select};
pub use unified::{RelocationReport, RingOptions, UnifiedBlockStore};
