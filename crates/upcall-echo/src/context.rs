//! Thread-local worker context.
//!
//! `work_fn` callbacks are plain `extern "C" fn(*mut UpEvent)` — bit-exact
//! with the kernel ABI, so there is no room for a captured closure or an
//! extra parameter. The original solves this with `__thread struct
//! worker_thread *me` and thread-local `msg_cache`/`conn_cache` globals in
//! `event-tester/upcall.c`; this module is the direct Rust counterpart,
//! using `thread_local!` the way `gvthread-runtime`'s `CURRENT_WORKER_ID`
//! does.
//!
//! The raw pointers stored here are sound because they all point at state
//! owned by the spawning closure in `upcall_runtime::worker::init_event_handler`,
//! which outlives every `run_event_loop` iteration on that same thread —
//! the pointers are never read from, or even visible to, any other thread.

use crate::connection::ConnPool;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use upcall_runtime::buffer::BufferCache;
use upcall_runtime::eventloop::Worker;

#[derive(Clone, Copy)]
struct WorkerCtx {
    /// `None` under the legacy `ctl`/`wait` variant, which never touches
    /// the modern submit/reap loop's `Worker`.
    worker: Option<*mut Worker>,
    msg_cache: *mut BufferCache,
    conn_pool: *mut ConnPool,
    index: usize,
    msg_size: usize,
    listen_fd: i32,
    donation: bool,
    upfd: i32,
    /// The shared registry every worker's accept/read/close handlers
    /// register into and look up through, under the legacy `ctl`/`wait`
    /// variant. Unused (and unset) under the modern variant.
    #[cfg(feature = "legacy")]
    registry: *const upcall_runtime::legacy::EventRegistry,
}

thread_local! {
    static CTX: Cell<Option<WorkerCtx>> = const { Cell::new(None) };
}

// Process-wide rather than per-worker thread-local, unlike the original's
// `me->accept_count`/`me->conn_count`: the binary's periodic stats line
// (spec.md §11) is printed from the main thread, which has no worker
// context installed, so the counters it reads have to live outside any
// one worker's thread-local state.
static ACCEPT_COUNT: AtomicU64 = AtomicU64::new(0);
static CONN_COUNT: AtomicU64 = AtomicU64::new(0);

/// Install this thread's worker context. Called once, from the `setup_fn`
/// passed to `EventHandlerBuilder::build`, before any event is dispatched.
///
/// `conn_pool` is leaked deliberately: per spec.md §9, per-CPU caches are
/// process-lifetime thread-local state, never torn down before the worker
/// thread itself exits.
pub fn install(worker: &mut Worker, msg_cache: &mut BufferCache, index: usize, msg_size: usize, listen_fd: i32, donation: bool) {
    let upfd = worker.upfd();
    let conn_pool = Box::into_raw(Box::new(ConnPool::new(64)));
    CTX.with(|c| {
        c.set(Some(WorkerCtx {
            worker: Some(worker as *mut Worker),
            msg_cache: msg_cache as *mut BufferCache,
            conn_pool,
            index,
            msg_size,
            listen_fd,
            donation,
            upfd,
            #[cfg(feature = "legacy")]
            registry: std::ptr::null(),
        }))
    });
}

/// Install this thread's worker context for the legacy `ctl`/`wait`
/// variant, which has no modern `Worker` to point at.
#[cfg(feature = "legacy")]
pub fn install_legacy(
    registry: &upcall_runtime::legacy::EventRegistry,
    msg_cache: &mut BufferCache,
    index: usize,
    msg_size: usize,
    listen_fd: i32,
    upfd: i32,
) {
    let conn_pool = Box::into_raw(Box::new(ConnPool::new(64)));
    CTX.with(|c| {
        c.set(Some(WorkerCtx {
            worker: None,
            msg_cache: msg_cache as *mut BufferCache,
            conn_pool,
            index,
            msg_size,
            listen_fd,
            donation: false,
            upfd,
            registry: registry as *const upcall_runtime::legacy::EventRegistry,
        }))
    });
}

fn ctx() -> WorkerCtx {
    CTX.with(|c| c.get()).expect("worker context not installed for this thread")
}

pub fn index() -> usize {
    ctx().index
}

pub fn msg_size() -> usize {
    ctx().msg_size
}

pub fn listen_fd() -> i32 {
    ctx().listen_fd
}

pub fn donation() -> bool {
    ctx().donation
}

pub fn upfd() -> i32 {
    ctx().upfd
}

#[cfg(feature = "legacy")]
pub fn registry() -> &'static upcall_runtime::legacy::EventRegistry {
    let ptr = ctx().registry;
    assert!(!ptr.is_null(), "no legacy EventRegistry installed on this thread (modern variant?)");
    unsafe { &*ptr }
}

pub fn with_worker<R>(f: impl FnOnce(&mut Worker) -> R) -> R {
    let worker = ctx().worker.expect("no modern Worker installed on this thread (legacy variant?)");
    f(unsafe { &mut *worker })
}

pub fn with_msg_cache<R>(f: impl FnOnce(&mut BufferCache) -> R) -> R {
    f(unsafe { &mut *ctx().msg_cache })
}

pub fn with_conn_pool<R>(f: impl FnOnce(&mut ConnPool) -> R) -> R {
    f(unsafe { &mut *ctx().conn_pool })
}

pub fn accept_count() -> u64 {
    ACCEPT_COUNT.load(Ordering::Relaxed)
}

pub fn conn_count() -> u64 {
    CONN_COUNT.load(Ordering::Relaxed)
}

pub(crate) fn incr_accept_count() {
    ACCEPT_COUNT.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn incr_conn_count() {
    CONN_COUNT.fetch_add(1, Ordering::Relaxed);
}
