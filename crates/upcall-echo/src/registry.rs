//! The process-wide `conns[fd]` dense array from spec.md §3/§5.
//!
//! Entries are written by exactly one worker (whichever accepted or
//! created the fd) and read by callbacks on that same worker — the
//! kernel's partitioning guarantee means no two workers ever touch the
//! same slot concurrently. `AtomicPtr` is used not because of contention
//! but because a raw `Vec<*mut Connection>` would not be `Sync`, and this
//! table is genuinely process-wide (`static`), mirroring `conns`/`threads`
//! in `event-tester/upcall.c` — global arrays written without a lock on
//! the common path, per spec.md §5.

use crate::connection::Connection;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::OnceLock;

/// Upper bound on simultaneously open fds this table can index. A real
/// deployment would size this from `getrlimit(RLIMIT_NOFILE)`; fixed here
/// to keep the table a single contiguous allocation, as `conns` is in the
/// original.
const MAX_FDS: usize = 65536;

pub struct ConnTable {
    slots: Box<[AtomicPtr<Connection>]>,
}

impl ConnTable {
    fn new() -> Self {
        let slots = (0..MAX_FDS)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    pub fn set(&self, fd: i32, conn: *mut Connection) {
        if let Some(slot) = self.slots.get(fd as usize) {
            slot.store(conn, Ordering::Release);
        }
    }

    pub fn get(&self, fd: i32) -> *mut Connection {
        if fd < 0 {
            return std::ptr::null_mut();
        }
        self.slots
            .get(fd as usize)
            .map(|slot| slot.load(Ordering::Acquire))
            .unwrap_or(std::ptr::null_mut())
    }

    pub fn clear(&self, fd: i32) {
        self.set(fd, std::ptr::null_mut());
    }
}

static CONNS: OnceLock<ConnTable> = OnceLock::new();

/// The single, process-lifetime `conns[fd]` table.
pub fn conns() -> &'static ConnTable {
    CONNS.get_or_init(ConnTable::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_slot_is_null() {
        let table = ConnTable::new();
        assert!(table.get(5).is_null());
    }

    #[test]
    fn set_then_get_round_trips() {
        let table = ConnTable::new();
        let mut conn = Connection::closed();
        let ptr = &mut conn as *mut Connection;
        table.set(42, ptr);
        assert_eq!(table.get(42), ptr);
        table.clear(42);
        assert!(table.get(42).is_null());
    }

    #[test]
    fn negative_fd_is_never_found() {
        let table = ConnTable::new();
        assert!(table.get(-1).is_null());
    }
}
