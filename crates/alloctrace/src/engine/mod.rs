//! Stack-site aggregation engine.
//!
//! Allocation call stacks are aggregated into sharded hash maps: the stack
//! map carries one `StackAgg` per unique call stack, and - in live mode -
//! the alloc map links each outstanding pointer fingerprint to the
//! aggregate it was credited to. All records come from per-shard slab
//! allocators that draw chunks straight from the real allocator, so map
//! growth never re-enters the hooks.

pub mod addrset;
pub mod allocmap;
pub mod capture;
pub mod fingerprint;
pub mod slab;
pub mod stackmap;
pub mod tracker;

/// Upper bound on captured frames; one less than a power of two so the
/// frame count packs into the top bits of the stack hash word.
pub const MAX_FRAMES: usize = 31;

/// Bits reserved for the packed frame count: `log2(MAX_FRAMES + 1)`.
pub const FRAME_COUNT_BITS: u32 = 5;

pub use stackmap::{STACK_MAP, StackAgg};
pub use allocmap::ALLOC_MAP;
