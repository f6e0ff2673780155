//! Per-connection record and lifecycle state, per spec.md §3/§4.6.

/// `state ∈ {WAITING, READING, WRITING, CLOSING}`, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Waiting,
    Reading,
    Writing,
    Closing,
}

/// `{fd, state, cursor, buffer, event_count, lock}` from spec.md §3.
///
/// `lock` is named in the spec as "reserved for future cross-worker
/// extensions" and never taken on the specified design's common path — it
/// is omitted here rather than carried as dead weight, since Rust's
/// partitioning invariant (one fd, one worker) is enforced by construction
/// through [`crate::context`] rather than by a field nobody locks.
pub struct Connection {
    /// Kernel file descriptor. `-1` is the sentinel marking a connection
    /// closed while a callback for it may still be in flight — per spec.md
    /// §8, any racing callback must see `fd < 0` and return without
    /// touching the record further.
    pub fd: i32,
    pub state: State,
    /// Bytes of the current message assembled in `buffer` so far.
    /// Invariant: `0 <= cursor < msg_size`, except transiently while
    /// `state == Writing`.
    pub cursor: usize,
    /// One cache chunk of `msg_size` bytes, owned by this connection for
    /// its lifetime. Allocated from the worker's message `BufferCache` at
    /// accept time, returned to it at close.
    pub buffer: *mut u8,
    pub event_count: u64,
}

unsafe impl Send for Connection {}

impl Connection {
    /// A connection record with no live fd, suitable both as initial pool
    /// stock and as the shape a freed record is reset to.
    pub fn closed() -> Self {
        Self {
            fd: -1,
            state: State::Closing,
            cursor: 0,
            buffer: std::ptr::null_mut(),
            event_count: 0,
        }
    }

    pub fn reset(&mut self, fd: i32, buffer: *mut u8) {
        self.fd = fd;
        self.state = State::Waiting;
        self.cursor = 0;
        self.buffer = buffer;
        self.event_count = 0;
    }
}

/// A per-worker pool of reusable [`Connection`] records, mirroring
/// `cache_alloc(conn_cache, ...)`/`cache_free(conn_cache, ...)` in
/// `event-tester/upcall.c`.
///
/// Kept as a typed `Vec<Box<Connection>>` free-list rather than routed
/// through [`upcall_runtime::buffer::BufferCache`]: that cache hands out
/// uninitialized byte chunks for POD data (message buffers), whereas a
/// `Connection` needs its fields constructed/dropped properly. The
/// recycling behavior spec.md §4.6 calls for is preserved; only the
/// allocator backing it is adapted to Rust's ownership model.
pub struct ConnPool {
    free: Vec<Box<Connection>>,
}

impl ConnPool {
    pub fn new(initial: usize) -> Self {
        Self {
            free: (0..initial).map(|_| Box::new(Connection::closed())).collect(),
        }
    }

    pub fn alloc(&mut self, fd: i32, buffer: *mut u8) -> *mut Connection {
        let mut conn = self.free.pop().unwrap_or_else(|| Box::new(Connection::closed()));
        conn.reset(fd, buffer);
        Box::into_raw(conn)
    }

    /// # Safety
    /// `conn` must have come from this pool's `alloc()` (directly or via
    /// growth) and must not be freed twice.
    pub unsafe fn free(&mut self, conn: *mut Connection) {
        let boxed = Box::from_raw(conn);
        self.free.push(boxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_resets_fields() {
        let mut pool = ConnPool::new(1);
        let ptr = pool.alloc(7, std::ptr::null_mut());
        let conn = unsafe { &*ptr };
        assert_eq!(conn.fd, 7);
        assert_eq!(conn.state, State::Waiting);
        assert_eq!(conn.cursor, 0);
        unsafe { pool.free(ptr) };
    }

    #[test]
    fn grows_past_initial_stock() {
        let mut pool = ConnPool::new(0);
        let ptr = pool.alloc(3, std::ptr::null_mut());
        assert!(!ptr.is_null());
        unsafe { pool.free(ptr) };
    }

    #[test]
    fn freed_record_is_reused() {
        let mut pool = ConnPool::new(1);
        let first = pool.alloc(1, std::ptr::null_mut());
        unsafe { pool.free(first) };
        let second = pool.alloc(2, std::ptr::null_mut());
        assert_eq!(first, second);
        unsafe { pool.free(second) };
    }
}
