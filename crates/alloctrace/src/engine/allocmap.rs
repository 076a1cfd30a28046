//! Sharded hash map from live pointer fingerprint to the stack aggregate
//! the allocation was credited to. Present only in live mode.

use core::ffi::c_void;
use core::ptr;
use std::sync::Mutex;

use super::slab::Slab;
use super::stackmap::StackAgg;
use crate::control;
use crate::interpose::real;

pub const N_ALLOC_SHARDS: usize = 16;
const SHARD_BITS: u32 = N_ALLOC_SHARDS.trailing_zeros();
const INITIAL_BUCKETS: usize = 1024;
const RECORDS_PER_CHUNK: usize = 1024;

/// One live allocation. The fingerprint is a bijection of the pointer, so
/// no pointer field is needed.
#[repr(C)]
struct AllocEntry {
    ptr_hash: u64,
    stack_agg: *mut StackAgg,
    next: *mut AllocEntry,
}

struct ShardInner {
    buckets: *mut *mut AllocEntry,
    mask: u64,
    size: u32,
    limit: u32,
    slab: Slab,
}

unsafe impl Send for ShardInner {}

struct AllocShard {
    inner: Mutex<ShardInner>,
}

impl AllocShard {
    const fn new() -> AllocShard {
        AllocShard {
            inner: Mutex::new(ShardInner {
                buckets: ptr::null_mut(),
                mask: 0,
                size: 0,
                limit: 0,
                slab: Slab::new(size_of::<AllocEntry>(), RECORDS_PER_CHUNK),
            }),
        }
    }
}

impl ShardInner {
    #[inline]
    fn bucket_index(&self, ptr_hash: u64) -> usize {
        ((ptr_hash >> SHARD_BITS) & self.mask) as usize
    }

    fn init(&mut self) -> bool {
        let buckets =
            unsafe { (real().calloc)(INITIAL_BUCKETS, size_of::<*mut AllocEntry>()) };
        if buckets.is_null() {
            return false;
        }
        self.buckets = buckets as *mut *mut AllocEntry;
        self.mask = (INITIAL_BUCKETS - 1) as u64;
        self.size = 0;
        self.limit = (INITIAL_BUCKETS / 2) as u32;
        true
    }

    fn teardown(&mut self) {
        if !self.buckets.is_null() {
            unsafe {
                (real().free)(self.buckets as *mut c_void);
            }
        }
        self.buckets = ptr::null_mut();
        self.mask = 0;
        self.size = 0;
        self.limit = 0;
        self.slab.release_all();
    }

    fn grow(&mut self) {
        let new_count = (self.mask as usize + 1) * 2;
        let new = unsafe { (real().calloc)(new_count, size_of::<*mut AllocEntry>()) }
            as *mut *mut AllocEntry;
        if new.is_null() {
            return;
        }
        let new_mask = (new_count - 1) as u64;
        for b in 0..=self.mask as usize {
            let mut entry = unsafe { *self.buckets.add(b) };
            while !entry.is_null() {
                let next = unsafe { (*entry).next };
                let idx = ((unsafe { (*entry).ptr_hash } >> SHARD_BITS) & new_mask) as usize;
                unsafe {
                    (*entry).next = *new.add(idx);
                    *new.add(idx) = entry;
                }
                entry = next;
            }
        }
        unsafe {
            (real().free)(self.buckets as *mut c_void);
        }
        self.buckets = new;
        self.mask = new_mask;
        self.limit = (new_count / 2) as u32;
    }
}

pub struct AllocMap {
    shards: [AllocShard; N_ALLOC_SHARDS],
}

pub static ALLOC_MAP: AllocMap = AllocMap {
    shards: [const { AllocShard::new() }; N_ALLOC_SHARDS],
};

impl AllocMap {
    #[inline]
    fn shard(&self, ptr_hash: u64) -> &AllocShard {
        &self.shards[(ptr_hash & (N_ALLOC_SHARDS as u64 - 1)) as usize]
    }

    /// Record a live allocation. Dropped silently when the profiler left
    /// live mode, was disabled, crossed an enable generation since the
    /// stack credit, or the slab is out of memory; the stack aggregate then
    /// simply never receives a debit.
    pub fn insert(&self, ptr_hash: u64, stack_agg: *mut StackAgg, generation: u64) {
        let mut g = self.shard(ptr_hash).inner.lock().unwrap();
        if !control::enabled() || !control::live_mode() || g.buckets.is_null() {
            return;
        }
        if control::generation() != generation {
            return;
        }
        let record = g.slab.alloc() as *mut AllocEntry;
        if record.is_null() {
            return;
        }
        let idx = g.bucket_index(ptr_hash);
        unsafe {
            (*record).ptr_hash = ptr_hash;
            (*record).stack_agg = stack_agg;
            (*record).next = *g.buckets.add(idx);
            *g.buckets.add(idx) = record;
        }
        g.size += 1;
        if g.size > g.limit {
            g.grow();
        }
    }

    /// Unlink the entry for `ptr_hash` and return its stack aggregate, or
    /// null. A miss is legitimate: the allocation predates enabling or its
    /// fingerprint is untracked.
    pub fn remove(&self, ptr_hash: u64) -> *mut StackAgg {
        let mut g = self.shard(ptr_hash).inner.lock().unwrap();
        if g.buckets.is_null() {
            return ptr::null_mut();
        }
        let idx = g.bucket_index(ptr_hash);
        let mut link = unsafe { g.buckets.add(idx) };
        loop {
            let entry = unsafe { *link };
            if entry.is_null() {
                return ptr::null_mut();
            }
            unsafe {
                if (*entry).ptr_hash == ptr_hash {
                    *link = (*entry).next;
                    let agg = (*entry).stack_agg;
                    g.slab.free(entry as *mut u8);
                    g.size -= 1;
                    return agg;
                }
                link = &raw mut (*entry).next;
            }
        }
    }

    pub fn live_entries(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.inner.lock().unwrap().size as u64)
            .sum()
    }

    pub fn stats(&self) -> super::stackmap::MapStats {
        let mut stats = super::stackmap::MapStats::default();
        for shard in &self.shards {
            let g = shard.inner.lock().unwrap();
            stats.entries += g.size as u64;
            stats.largest_shard = stats.largest_shard.max(g.size);
            if !g.buckets.is_null() {
                stats.bucket_bytes += ((g.mask + 1) as usize * size_of::<*mut AllocEntry>()) as u64;
            }
            stats.slab_bytes += g.slab.owned_bytes() as u64;
        }
        stats
    }

    pub fn init_shards(&self) -> bool {
        for shard in &self.shards {
            if !shard.inner.lock().unwrap().init() {
                self.teardown_shards();
                return false;
            }
        }
        true
    }

    pub fn teardown_shards(&self) {
        for shard in &self.shards {
            shard.inner.lock().unwrap().teardown();
        }
    }
}
