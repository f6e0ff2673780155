//! Per-CPU buffer cache — a slab-style allocator for fixed-size chunks.
//!
//! Mirrors `init_cache`/`cache_alloc`/`cache_free` in `libupcall/upcall.c`.
//! Each worker owns exactly one `BufferCache` per element size (message
//! buffers and connection records get independent caches, as
//! `event-tester/upcall.c` does with `msg_cache`/`conn_cache`). Because a
//! cache is only ever touched by the worker that created it, `alloc`/`free`
//! need no synchronization at all — the lock-freedom the spec calls for
//! falls out of single-ownership, not atomics.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// A growable pool of fixed-size chunks, owned by one worker.
pub struct BufferCache {
    element_size: usize,
    slab_count: usize,
    cpu_index: usize,
    slabs: Vec<(NonNull<u8>, Layout)>,
    free_list: Vec<NonNull<u8>>,
}

impl BufferCache {
    /// Allocate a slab sized for `initial_count` chunks of `element_size`
    /// bytes, conceptually local to `cpu_index`'s cache/NUMA domain.
    ///
    /// Out-of-memory here is startup-fatal per spec.md §4.2 — this cache is
    /// a startup resource, not something steady-state code recovers from.
    pub fn new(element_size: usize, initial_count: usize, cpu_index: usize) -> Self {
        let element_size = element_size.max(1);
        let mut cache = Self {
            element_size,
            slab_count: 0,
            cpu_index,
            slabs: Vec::new(),
            free_list: Vec::with_capacity(initial_count),
        };
        cache.grow(initial_count);
        cache
    }

    /// The fixed element size this cache hands out.
    #[inline]
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// The CPU/NUMA domain this cache believes it is local to. Callers must
    /// not pass a foreign `cpu_index` when allocating/freeing — distinct
    /// indices operate independently and cross-talk is a caller bug, not
    /// something this type can detect cheaply.
    #[inline]
    pub fn cpu_index(&self) -> usize {
        self.cpu_index
    }

    /// Amortized O(1): pop the free list, growing the slab first if empty.
    pub fn alloc(&mut self) -> NonNull<u8> {
        if self.free_list.is_empty() {
            self.grow(self.slab_count.max(1));
        }
        // `grow` always pushes at least one chunk, so this cannot be empty.
        self.free_list.pop().expect("cache grow invariant")
    }

    /// Amortized O(1): push back onto the free list.
    ///
    /// # Safety
    /// `ptr` must have come from this exact cache's `alloc()` and must not
    /// be freed twice.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        self.free_list.push(ptr);
    }

    /// Number of chunks currently available without growing.
    pub fn available(&self) -> usize {
        self.free_list.len()
    }

    fn grow(&mut self, count: usize) {
        let count = count.max(1);
        let layout = Layout::from_size_align(self.element_size * count, 16)
            .expect("buffer cache layout overflow");
        // TODO: mbind(2) this slab to cpu_index's NUMA node once a numa
        // binding crate is in the dependency tree; for now allocation is
        // plain heap memory and "local" is aspirational.
        let base = unsafe { alloc::alloc(layout) };
        let base = NonNull::new(base).unwrap_or_else(|| {
            // Startup-fatal: spec.md §4.2 treats OOM here as unrecoverable.
            alloc::handle_alloc_error(layout)
        });
        for i in 0..count {
            let chunk = unsafe { base.as_ptr().add(i * self.element_size) };
            self.free_list.push(NonNull::new(chunk).expect("chunk offset non-null"));
        }
        self.slabs.push((base, layout));
        self.slab_count += count;
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        for (base, layout) in self.slabs.drain(..) {
            unsafe { alloc::dealloc(base.as_ptr(), layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_round_trip() {
        let mut cache = BufferCache::new(64, 4, 0);
        assert_eq!(cache.available(), 4);
        let a = cache.alloc();
        let b = cache.alloc();
        assert_eq!(cache.available(), 2);
        assert_ne!(a, b);
        cache.free(a);
        cache.free(b);
        assert_eq!(cache.available(), 4);
    }

    #[test]
    fn grows_when_exhausted() {
        let mut cache = BufferCache::new(32, 2, 0);
        let _a = cache.alloc();
        let _b = cache.alloc();
        assert_eq!(cache.available(), 0);
        // Next alloc must grow rather than panic.
        let c = cache.alloc();
        cache.free(c);
    }

    #[test]
    fn distinct_caches_are_independent() {
        let mut cache0 = BufferCache::new(16, 2, 0);
        let cache1 = BufferCache::new(16, 2, 1);
        assert_eq!(cache0.cpu_index(), 0);
        assert_eq!(cache1.cpu_index(), 1);
        let p = cache0.alloc();
        cache0.free(p);
    }
}
