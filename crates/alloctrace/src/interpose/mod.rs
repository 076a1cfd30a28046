//! Allocator interposition layer.
//!
//! The preloadable shim exports replacements for the C allocation entry
//! points; the bodies live here. Each replacement forwards to the real
//! implementation (resolved once via the dynamic linker) when no hook set is
//! registered, and to the registered hook otherwise. A small bump arena
//! serves the allocations the dynamic linker itself issues while we are
//! resolving the real symbols.

mod bootstrap;
mod hooks;
mod real;

pub use hooks::{
    HookTable, caller_address, calloc_entry, free_entry, install_fork_handler, malloc_entry,
    memalign_entry, aligned_alloc_entry, posix_memalign_entry, pvalloc_entry, realloc_entry,
    register_hooks, valloc_entry,
};
pub use real::{RealFuncs, ensure_resolved, page_size, real};
