//! Fixed-size record allocator backing the hash map shards.
//!
//! Records are carved out of chunks obtained from the real allocator, so
//! allocating a record never re-enters the hooks. Freed records go on an
//! intrusive free list; chunks are only returned to the real heap on a full
//! reset.

use core::ffi::c_void;
use core::ptr;

use crate::interpose::real;

#[repr(C)]
struct FreeNode {
    next: *mut FreeNode,
}

#[repr(C)]
struct ChunkHeader {
    next: *mut ChunkHeader,
    _pad: usize,
}

pub struct Slab {
    record_size: usize,
    records_per_chunk: usize,
    free: *mut FreeNode,
    chunks: *mut ChunkHeader,
    owned_bytes: usize,
}

// Only touched under the owning shard's mutex.
unsafe impl Send for Slab {}

impl Slab {
    pub const fn new(record_size: usize, records_per_chunk: usize) -> Slab {
        assert!(record_size >= size_of::<FreeNode>());
        assert!(record_size % size_of::<usize>() == 0);
        Slab {
            record_size,
            records_per_chunk,
            free: ptr::null_mut(),
            chunks: ptr::null_mut(),
            owned_bytes: 0,
        }
    }

    /// Pop a record, growing by one chunk if the free list is empty.
    /// Returns null when the real allocator has no memory.
    pub fn alloc(&mut self) -> *mut u8 {
        if self.free.is_null() && !self.grow() {
            return ptr::null_mut();
        }
        let node = self.free;
        self.free = unsafe { (*node).next };
        node as *mut u8
    }

    pub fn free(&mut self, record: *mut u8) {
        let node = record as *mut FreeNode;
        unsafe {
            (*node).next = self.free;
        }
        self.free = node;
    }

    fn grow(&mut self) -> bool {
        let bytes = size_of::<ChunkHeader>() + self.record_size * self.records_per_chunk;
        let chunk = unsafe { (real().malloc)(bytes) } as *mut ChunkHeader;
        if chunk.is_null() {
            return false;
        }
        unsafe {
            (*chunk).next = self.chunks;
        }
        self.chunks = chunk;
        self.owned_bytes += bytes;

        let first = unsafe { (chunk as *mut u8).add(size_of::<ChunkHeader>()) };
        for i in 0..self.records_per_chunk {
            let record = unsafe { first.add(i * self.record_size) };
            self.free(record);
        }
        true
    }

    /// Return every chunk to the real heap. All records handed out by this
    /// slab are invalid afterwards.
    pub fn release_all(&mut self) {
        let mut chunk = self.chunks;
        while !chunk.is_null() {
            let next = unsafe { (*chunk).next };
            unsafe {
                (real().free)(chunk as *mut c_void);
            }
            chunk = next;
        }
        self.chunks = ptr::null_mut();
        self.free = ptr::null_mut();
        self.owned_bytes = 0;
    }

    /// Bytes currently held from the real heap.
    pub fn owned_bytes(&self) -> usize {
        self.owned_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_recycle_through_the_free_list() {
        let mut slab = Slab::new(64, 8);
        let a = slab.alloc();
        let b = slab.alloc();
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);
        slab.free(b);
        let c = slab.alloc();
        assert_eq!(c, b);
        slab.release_all();
    }

    #[test]
    fn grows_beyond_one_chunk() {
        let mut slab = Slab::new(32, 4);
        let mut records = Vec::new();
        for _ in 0..13 {
            let r = slab.alloc();
            assert!(!r.is_null());
            records.push(r as usize);
        }
        records.sort_unstable();
        records.dedup();
        assert_eq!(records.len(), 13);
        assert!(slab.owned_bytes() >= 13 * 32);
        slab.release_all();
        assert_eq!(slab.owned_bytes(), 0);
    }
}
