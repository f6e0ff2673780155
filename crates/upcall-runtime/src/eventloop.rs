//! The batched submit/reap event loop (spec.md §4.5) and the modern,
//! buffer-donation public API (spec.md §4.7).
//!
//! Every worker owns two growable arrays — outbound work-requests and
//! inbound completions — and drives `submit → dispatch → rearm` in a tight
//! loop. `submit` (spec.md §4.1) is the sole suspension point in steady
//! state; everything else here runs to completion on the dispatching
//! worker before the next submit.

use crate::buffer::BufferCache;
use crate::syscall;
use upcall_core::entry::{IoVec, UpEvent, WorkFn};
use upcall_core::error::Result;

/// Growth chunk for outbound/inbound arrays, matching the `EVTS` constant
/// in `event-tester/upcall.c`.
const EVTS: usize = 2;

/// Per-worker event-loop state: outbound work-request queue, inbound
/// completion queue, and the buffer-donation free list.
///
/// Only the owning worker thread ever touches its own `Worker` — spec.md
/// §5 guarantees one connection (and thus one worker) per fd, so no
/// synchronization is needed here either.
pub struct Worker {
    index: usize,
    upfd: i32,
    donation: bool,
    outbound: Vec<UpEvent>,
    inbound: Vec<UpEvent>,
    inbound_capacity: usize,
    free_list: Vec<IoVec>,
}

impl Worker {
    /// Construct a worker's event-loop state. `inbound_capacity` bounds how
    /// many completions one `submit` call can return — spec.md §5: "the
    /// inbound array is fixed-size, bounding the per-iteration work budget."
    pub fn new(index: usize, upfd: i32, donation: bool, inbound_capacity: usize) -> Self {
        Self {
            index,
            upfd,
            donation,
            outbound: Vec::with_capacity(EVTS),
            inbound: vec![UpEvent::zeroed(); inbound_capacity.max(1)],
            inbound_capacity: inbound_capacity.max(1),
            free_list: Vec::new(),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn upfd(&self) -> i32 {
        self.upfd
    }

    /// Queue an accept work-request; the kernel will deliver a completion
    /// whose `work_fn` is `work_fn` and whose `result` is the new fd.
    pub fn add_accept(&mut self, fd: i32, work_fn: WorkFn) {
        self.push_outbound(UpEvent::accept(fd, work_fn));
    }

    /// Queue a read work-request in donation mode: no buffer is supplied —
    /// the kernel fills `result`/`buf`/`len` from the donated pool.
    pub fn add_read(&mut self, fd: i32, work_fn: WorkFn) {
        self.push_outbound(UpEvent::read(fd, std::ptr::null_mut(), 0, work_fn));
    }

    /// Queue a read work-request in classic mode, where the caller supplies
    /// the buffer the kernel is to fill.
    pub fn add_read_buf(&mut self, fd: i32, buf: *mut u8, len: u64, work_fn: WorkFn) {
        self.push_outbound(UpEvent::read(fd, buf, len, work_fn));
    }

    /// Directly queue a `Vec` (buffer-donation) record describing `bufs` to
    /// the kernel right now, bypassing the automatic per-iteration
    /// `return_buffer` donation below. For posting a fresh pool, not for
    /// recycling read buffers mid-loop.
    pub fn add_buffers(&mut self, bufs: &[IoVec]) {
        let ptr = bufs.as_ptr() as *mut u8;
        self.push_outbound(UpEvent::donate(ptr, bufs.len() as u64));
    }

    /// Return a buffer the application is done with. Staged on a
    /// thread-local free list; re-donated to the kernel as a single `Vec`
    /// record on the *next* `run_event_loop` iteration, not immediately.
    pub fn return_buffer(&mut self, base: *mut u8, len: usize) {
        self.free_list.push(IoVec { base, len });
    }

    /// How many buffers are staged for re-donation on the next iteration.
    pub fn free_list_len(&self) -> usize {
        self.free_list.len()
    }

    fn push_outbound(&mut self, event: UpEvent) {
        if self.outbound.len() == self.outbound.capacity() {
            expand(&mut self.outbound);
        }
        self.outbound.push(event);
    }

    /// Grow the inbound completion array, preserving already-populated
    /// entries (spec.md §8: "`expand_queues` must preserve the prefix of
    /// outstanding entries").
    pub fn expand_inbound(&mut self, min_capacity: usize) {
        if min_capacity <= self.inbound_capacity {
            return;
        }
        let new_capacity = grown_capacity(self.inbound_capacity, min_capacity);
        self.inbound.resize(new_capacity, UpEvent::zeroed());
        self.inbound_capacity = new_capacity;
    }
}

/// Double-or-linear growth in chunks of `EVTS`, matching spec.md §4.5.
fn grown_capacity(current: usize, min_needed: usize) -> usize {
    let mut cap = current.max(EVTS);
    while cap < min_needed {
        cap = (cap * 2).max(cap + EVTS);
    }
    cap
}

fn expand(buf: &mut Vec<UpEvent>) {
    let new_cap = grown_capacity(buf.capacity(), buf.capacity() + 1);
    buf.reserve(new_cap - buf.len());
}

/// One (or until death) iteration of the submit/dispatch cycle, per
/// spec.md §4.5:
///
/// ```text
/// if donation_mode and free_list_used > 0:
///     append one VEC record describing the free-list to outbound
/// n ← submit(upfd, outbound_used, outbound, inbound_capacity, inbound)
/// if n < 0: fatal
/// free_list_used ← 0
/// outbound_used  ← 0
/// for i in 0 .. n-1:
///     if inbound[i].work_fn != nil:
///         inbound[i].work_fn(&inbound[i])
/// zero inbound[0..inbound_capacity]
/// ```
///
/// `submit`'s failure is always fatal (spec.md §7) — there is no retry at
/// this layer, so this function propagates the error rather than looping
/// past it.
pub fn run_event_loop(worker: &mut Worker, continuous: bool) -> Result<()> {
    loop {
        submit_and_dispatch(worker)?;
        if !continuous {
            return Ok(());
        }
    }
}

fn submit_and_dispatch(worker: &mut Worker) -> Result<()> {
    // Staged `return_buffer` calls become one VEC record, donating the
    // whole free list back to the kernel for this submit.
    let pending_bufs = if worker.donation && !worker.free_list.is_empty() {
        Some(std::mem::take(&mut worker.free_list))
    } else {
        None
    };
    if let Some(bufs) = &pending_bufs {
        worker.add_buffers(bufs);
    }

    let inbound_capacity = worker.inbound_capacity;
    let n = syscall::submit(
        worker.upfd,
        &worker.outbound,
        &mut worker.inbound[..inbound_capacity],
    )?;
    // `pending_bufs` must outlive the syscall above, since the kernel reads
    // the iovec array it points into synchronously during `submit`.
    drop(pending_bufs);

    worker.free_list.clear();
    worker.outbound.clear();

    for i in 0..n {
        if let Some(work_fn) = worker.inbound[i].work_fn {
            let ptr = &mut worker.inbound[i] as *mut UpEvent;
            work_fn(ptr);
        }
    }

    for entry in worker.inbound[..inbound_capacity].iter_mut() {
        *entry = UpEvent::zeroed();
    }

    Ok(())
}

/// Allocate `buf_count` chunks from `cache` and stage them as the worker's
/// initial donation pool, per spec.md §4.7: "allocate the outbound/inbound
/// arrays and the initial buffer pool, then queue the pool as an initial VEC
/// donation." Staging through [`Worker::return_buffer`] means the pool rides
/// out as one VEC record on the very first `run_event_loop` iteration,
/// rather than needing a second donation path.
pub fn upcall_worker_setup(worker: &mut Worker, cache: &mut BufferCache, buf_count: usize) {
    let element_size = cache.element_size();
    for _ in 0..buf_count {
        let ptr = cache.alloc();
        worker.return_buffer(ptr.as_ptr(), element_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upcall_worker_setup_stages_initial_pool() {
        let mut cache = BufferCache::new(64, 2, 0);
        let mut worker = Worker::new(0, -1, true, 4);
        upcall_worker_setup(&mut worker, &mut cache, 4);
        assert_eq!(worker.free_list_len(), 4);
    }

    #[test]
    fn expand_preserves_prefix() {
        let mut buf: Vec<UpEvent> = vec![UpEvent::zeroed(); 2];
        buf[0].fd = 7;
        buf[1].fd = 9;
        expand(&mut buf);
        assert_eq!(buf[0].fd, 7);
        assert_eq!(buf[1].fd, 9);
    }

    #[test]
    fn grown_capacity_is_monotonic_and_sufficient() {
        assert!(grown_capacity(2, 3) >= 3);
        assert!(grown_capacity(2, 3) > 2);
        assert!(grown_capacity(64, 65) >= 65);
    }

    #[test]
    fn return_buffer_stages_until_next_iteration() {
        let mut worker = Worker::new(0, -1, true, 4);
        assert_eq!(worker.free_list_len(), 0);
        worker.return_buffer(std::ptr::null_mut(), 64);
        worker.return_buffer(std::ptr::null_mut(), 64);
        assert_eq!(worker.free_list_len(), 2);
    }

    #[test]
    fn add_accept_and_read_queue_outbound() {
        extern "C" fn noop(_: *mut UpEvent) {}
        let mut worker = Worker::new(0, -1, true, 4);
        worker.add_accept(3, noop);
        worker.add_read(4, noop);
        assert_eq!(worker.outbound.len(), 2);
    }

    #[test]
    fn expand_inbound_preserves_prefix() {
        let mut worker = Worker::new(0, -1, true, 2);
        worker.inbound[0].fd = 11;
        worker.expand_inbound(5);
        assert!(worker.inbound_capacity >= 5);
        assert_eq!(worker.inbound[0].fd, 11);
    }
}
