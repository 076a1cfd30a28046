//! Sharded hash map from canonical call stack to its allocation aggregate.

use core::ffi::c_void;
use core::ptr;
use std::sync::Mutex;

use super::fingerprint::{pack_hash, unpack_hash};
use super::slab::Slab;
use super::MAX_FRAMES;
use crate::control;
use crate::interpose::real;

pub const N_STACK_SHARDS: usize = 16;
const SHARD_BITS: u32 = N_STACK_SHARDS.trailing_zeros();
const INITIAL_BUCKETS: usize = 1024;
const RECORDS_PER_CHUNK: usize = 128;

/// Aggregate record for one unique call stack. Never deleted while the
/// session is enabled, so alloc-map entries may hold bare references into
/// the owning shard's slab.
#[repr(C)]
pub struct StackAgg {
    hash_len: u64,
    bytes: u64,
    count: u64,
    next: *mut StackAgg,
    frames: [usize; MAX_FRAMES],
}

impl StackAgg {
    #[inline]
    pub fn hash(&self) -> u64 {
        unpack_hash(self.hash_len).0
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        unpack_hash(self.hash_len).1
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.frame_count()]
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

struct ShardInner {
    buckets: *mut *mut StackAgg,
    mask: u64,
    size: u32,
    limit: u32,
    slab: Slab,
}

unsafe impl Send for ShardInner {}

struct StackShard {
    inner: Mutex<ShardInner>,
}

impl StackShard {
    const fn new() -> StackShard {
        StackShard {
            inner: Mutex::new(ShardInner {
                buckets: ptr::null_mut(),
                mask: 0,
                size: 0,
                limit: 0,
                slab: Slab::new(size_of::<StackAgg>(), RECORDS_PER_CHUNK),
            }),
        }
    }
}

impl ShardInner {
    #[inline]
    fn bucket_index(&self, hash: u64) -> usize {
        // Shards consume the low hash bits; dividing them out keeps bucket
        // distributions independent across shards.
        ((hash >> SHARD_BITS) & self.mask) as usize
    }

    fn init(&mut self) -> bool {
        let buckets =
            unsafe { (real().calloc)(INITIAL_BUCKETS, size_of::<*mut StackAgg>()) };
        if buckets.is_null() {
            return false;
        }
        self.buckets = buckets as *mut *mut StackAgg;
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
        let new =
            unsafe { (real().calloc)(new_count, size_of::<*mut StackAgg>()) } as *mut *mut StackAgg;
        if new.is_null() {
            // Keep the old table and accept the degraded load factor.
            return;
        }
        let new_mask = (new_count - 1) as u64;
        for b in 0..=self.mask as usize {
            let mut entry = unsafe { *self.buckets.add(b) };
            while !entry.is_null() {
                let next = unsafe { (*entry).next };
                let idx = ((unsafe { (*entry).hash() } >> SHARD_BITS) & new_mask) as usize;
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

/// One snapshot line taken under a shard lock during a dump.
#[derive(Clone, Copy)]
pub struct SnapEntry {
    pub agg: *const StackAgg,
    pub bytes: u64,
    pub count: u64,
}

#[derive(Default, Clone, Copy)]
pub struct MapStats {
    pub entries: u64,
    pub bucket_bytes: u64,
    pub slab_bytes: u64,
    pub largest_shard: u32,
}

pub struct StackMap {
    shards: [StackShard; N_STACK_SHARDS],
}

pub static STACK_MAP: StackMap = StackMap {
    shards: [const { StackShard::new() }; N_STACK_SHARDS],
};

impl StackMap {
    #[inline]
    fn shard(&self, hash: u64) -> &StackShard {
        &self.shards[(hash & (N_STACK_SHARDS as u64 - 1)) as usize]
    }

    /// Credit `(size, +1)` to the aggregate for the given stack, creating it
    /// if this stack was never seen. Returns null when disabled or out of
    /// memory; the caller drops the update silently.
    pub fn credit(&self, hash: u64, frames: &[usize], size: u64) -> *mut StackAgg {
        debug_assert!(frames.len() <= MAX_FRAMES);
        let mut g = self.shard(hash).inner.lock().unwrap();
        if !control::enabled() || g.buckets.is_null() {
            return ptr::null_mut();
        }
        let packed = pack_hash(hash, frames.len());
        let idx = g.bucket_index(hash);
        let mut entry = unsafe { *g.buckets.add(idx) };
        while !entry.is_null() {
            unsafe {
                if (*entry).hash_len == packed
                    && (&(*entry).frames)[..frames.len()] == *frames
                {
                    (*entry).bytes += size;
                    (*entry).count += 1;
                    return entry;
                }
                entry = (*entry).next;
            }
        }

        let record = g.slab.alloc() as *mut StackAgg;
        if record.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            (*record).hash_len = packed;
            (*record).bytes = size;
            (*record).count = 1;
            (&mut (*record).frames)[..frames.len()].copy_from_slice(frames);
            (*record).next = *g.buckets.add(idx);
            *g.buckets.add(idx) = record;
        }
        g.size += 1;
        if g.size > g.limit {
            g.grow();
        }
        record
    }

    /// Reverse one allocation's credit. The aggregate survives even at
    /// `count == 0`; it still counts as a seen stack.
    ///
    /// # Safety
    /// `agg` must have been returned by [`credit`] within the current
    /// enable session.
    pub unsafe fn debit(&self, agg: *mut StackAgg, size: u64) {
        let shard = self.shard(unsafe { (*agg).hash() });
        let g = shard.inner.lock().unwrap();
        if !control::enabled() || g.buckets.is_null() {
            return;
        }
        unsafe {
            (*agg).bytes = (*agg).bytes.wrapping_sub(size);
            (*agg).count = (*agg).count.wrapping_sub(1);
        }
    }

    /// Restore a speculative debit after a failed resize.
    ///
    /// # Safety
    /// Same contract as [`debit`].
    pub unsafe fn recredit(&self, agg: *mut StackAgg, size: u64) {
        let shard = self.shard(unsafe { (*agg).hash() });
        let g = shard.inner.lock().unwrap();
        if !control::enabled() || g.buckets.is_null() {
            return;
        }
        unsafe {
            (*agg).bytes += size;
            (*agg).count += 1;
        }
    }

    pub fn shard_count(&self) -> usize {
        N_STACK_SHARDS
    }

    /// Snapshot one shard's aggregates with `count > 0`, under its lock.
    pub fn snapshot_shard(&self, idx: usize) -> Vec<SnapEntry> {
        let g = self.shards[idx].inner.lock().unwrap();
        let mut out = Vec::with_capacity(g.size as usize);
        if g.buckets.is_null() {
            return out;
        }
        for b in 0..=g.mask as usize {
            let mut entry = unsafe { *g.buckets.add(b) } as *const StackAgg;
            while !entry.is_null() {
                unsafe {
                    if (*entry).count > 0 {
                        out.push(SnapEntry {
                            agg: entry,
                            bytes: (*entry).bytes,
                            count: (*entry).count,
                        });
                    }
                    entry = (*entry).next;
                }
            }
        }
        out
    }

    /// Unique stacks ever seen this session, including aggregates whose
    /// live count dropped to zero.
    pub fn unique_stacks(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.inner.lock().unwrap().size as u64)
            .sum()
    }

    pub fn stats(&self) -> MapStats {
        let mut stats = MapStats::default();
        for shard in &self.shards {
            let g = shard.inner.lock().unwrap();
            stats.entries += g.size as u64;
            stats.largest_shard = stats.largest_shard.max(g.size);
            if !g.buckets.is_null() {
                stats.bucket_bytes += ((g.mask + 1) as usize * size_of::<*mut StackAgg>()) as u64;
            }
            stats.slab_bytes += g.slab.owned_bytes() as u64;
        }
        stats
    }

    /// Allocate every shard's initial bucket table. On failure the map is
    /// torn back down and `false` returned.
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
