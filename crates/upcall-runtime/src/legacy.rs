//! Legacy, level-triggered variant: `register_event`/`unregister_event`
//! bind a `{arg, work_fn}` pair to an `(fd, event-mask)` tuple via `ctl`;
//! a single-item `wait` loop looks the pair up by fd and dispatches it.
//!
//! This variant has no counterpart in `libupcall/upcall.h` — only
//! spec.md's §2/§4.1 describe it. Grounded instead on the shape of
//! `EventFdNotifier` (`crates/ksvc-module/src/eventfd_notifier.rs`): a
//! small fd-keyed registry guarded by a single `Mutex`, matching this
//! workspace's habit of reaching for a plain `Mutex<HashMap<..>>` rather
//! than a lock-free structure at the edges where throughput doesn't
//! matter — only the hot per-worker submit/dispatch path gets the
//! single-writer, lock-free treatment.

use crate::buffer::BufferCache;
use crate::syscall;
use crate::syscall::legacy::{ctl, wait};
use crate::topology;
use crate::worker::Rendezvous;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use upcall_core::entry::{UpEvent, WorkItem};
use upcall_core::error::{Result, UpcallError};
use upcall_core::flags::{ConcurrencyModel, CtlAction, O_CLOEXEC, UPWRKINIT};

/// fd-keyed table of registered `{arg, work_fn}` pairs for one upcall fd.
pub struct EventRegistry {
    items: Mutex<HashMap<i32, WorkItem>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
        }
    }

    /// Bind `item` to `fd` under `events`, both in the kernel (via `ctl`)
    /// and in the local lookup table `run_legacy_loop` dispatches from.
    pub fn register_event(&self, upfd: i32, fd: i32, events: u32, item: WorkItem) -> Result<()> {
        ctl(upfd, CtlAction::Add, fd, events, item.arg as u64)?;
        self.items.lock().unwrap().insert(fd, item);
        Ok(())
    }

    /// Unbind `fd`, both in the kernel and locally.
    pub fn unregister_event(&self, upfd: i32, fd: i32) -> Result<()> {
        ctl(upfd, CtlAction::Del, fd, 0, 0)?;
        self.items.lock().unwrap().remove(&fd);
        Ok(())
    }

    fn lookup(&self, fd: i32) -> Option<WorkItem> {
        self.items.lock().unwrap().get(&fd).copied()
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registers the calling worker as a dispatch context, per spec.md §6's
/// `ioctl(UPIOSTSK)` — the legacy variant's counterpart to the modern
/// variant's implicit registration on first `submit`.
pub fn register_dispatch_context(upfd: i32) -> Result<()> {
    let ret = unsafe { libc::ioctl(upfd, UPWRKINIT as _, 0) };
    if ret < 0 {
        Err(upcall_core::error::UpcallError::Os(unsafe {
            *libc::__errno_location()
        }))
    } else {
        Ok(())
    }
}

/// Block for single completions and dispatch each to the registry entry
/// bound to its fd, until `wait` fails (fatal, matching `submit`'s
/// failure semantics in the modern loop).
pub fn run_legacy_loop(upfd: i32, registry: &EventRegistry) -> Result<()> {
    loop {
        let mut item = UpEvent::zeroed();
        wait(upfd, &mut item)?;
        let fd = item.fd;
        if let Some(work_item) = registry.lookup(fd) {
            (work_item.work_fn)(work_item.arg);
        }
    }
}

/// A live legacy event handler: the shared upcall fd, the shared
/// registry, and every worker thread's handle. Unlike the modern
/// [`crate::worker::EventHandler`], shutdown works by closing `upfd` out
/// from under the blocked `wait()` calls rather than a polled flag —
/// `run_legacy_loop` already treats a failing `wait` as its natural exit.
pub struct LegacyEventHandler {
    upfd: i32,
    registry: Arc<EventRegistry>,
    handles: Vec<JoinHandle<()>>,
}

impl LegacyEventHandler {
    #[inline]
    pub fn upfd(&self) -> i32 {
        self.upfd
    }

    #[inline]
    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    pub fn shutdown(self) {
        unsafe { libc::close(self.upfd) };
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// The legacy counterpart of [`crate::worker::init_event_handler`]: same
/// five-step bring-up (create, query queue count, resolve affinity, spawn,
/// rendezvous-release), but each worker registers as a dispatch context
/// via `ioctl(UPWRKINIT)` and falls into [`run_legacy_loop`] instead of the
/// modern submit/reap loop — the two dispatch mechanisms never share a
/// worker thread.
///
/// `setup_fn` runs once per worker, after this worker's own `BufferCache`
/// and the shared registry exist but before the rendezvous barrier, and
/// returns the listening fd it registered — mirroring
/// `upcall_echo::setup_worker_legacy`.
pub fn init_legacy_event_handler<F>(
    model: ConcurrencyModel,
    threads_per_queue: usize,
    msg_size: usize,
    buf_count: usize,
    setup_fn: F,
) -> Result<LegacyEventHandler>
where
    F: Fn(&EventRegistry, i32, &mut BufferCache, usize) -> Result<i32> + Send + Sync + Clone + 'static,
{
    let num_cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

    let flags = model.flag_bit() | O_CLOEXEC;
    let upfd = syscall::create(flags)?;

    let queue_count = match syscall::queue_count(upfd) {
        Ok(n) => n as usize,
        Err(e) => {
            unsafe { libc::close(upfd) };
            return Err(e);
        }
    };

    let affinity_sets = match topology::resolve(model, num_cpus, queue_count) {
        Ok(sets) => sets,
        Err(e) => {
            unsafe { libc::close(upfd) };
            return Err(e);
        }
    };

    let total_workers = affinity_sets.len() * threads_per_queue;
    let registry = Arc::new(EventRegistry::new());
    let rendezvous = Arc::new(Rendezvous::new(total_workers));
    let started = Arc::new(AtomicBool::new(true));

    let mut handles = Vec::with_capacity(total_workers);
    let mut spawn_err: Option<UpcallError> = None;

    'spawn: for (queue_index, cpu_set) in affinity_sets.iter().enumerate() {
        for _ in 0..threads_per_queue {
            let cpu_set = cpu_set.clone();
            let setup_fn = setup_fn.clone();
            let registry = Arc::clone(&registry);
            let rendezvous = Arc::clone(&rendezvous);
            let started = Arc::clone(&started);

            let spawned = thread::Builder::new()
                .name(format!("upcall-legacy-worker-{}", queue_index))
                .spawn(move || {
                    if let Err(e) = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &cpu_set) {
                        eprintln!("upcall: legacy worker {} failed to set affinity: {}", queue_index, e);
                        rendezvous.arrive_and_wait();
                        return;
                    }

                    if let Err(e) = register_dispatch_context(upfd) {
                        eprintln!("upcall: legacy worker {} dispatch-context registration failed: {}", queue_index, e);
                        started.store(false, Ordering::Release);
                        rendezvous.arrive_and_wait();
                        return;
                    }

                    let mut cache = BufferCache::new(msg_size, buf_count, queue_index);
                    if let Err(e) = setup_fn(&registry, upfd, &mut cache, queue_index) {
                        eprintln!("upcall: legacy worker {} setup failed: {}", queue_index, e);
                        started.store(false, Ordering::Release);
                        rendezvous.arrive_and_wait();
                        return;
                    }

                    rendezvous.arrive_and_wait();

                    if let Err(e) = run_legacy_loop(upfd, &registry) {
                        eprintln!("upcall: legacy worker {} wait failed: {}", queue_index, e);
                    }
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    spawn_err = Some(UpcallError::from(e));
                    break 'spawn;
                }
            }
        }
    }

    if let Some(err) = spawn_err {
        // Only `handles.len()` threads actually started — see the matching
        // comment in `worker::init_event_handler`.
        rendezvous.cancel_unspawned(handles.len());
        rendezvous.wait_for_all_and_release();
        unsafe { libc::close(upfd) };
        for handle in handles {
            let _ = handle.join();
        }
        return Err(err);
    }

    rendezvous.wait_for_all_and_release();

    if !started.load(Ordering::Acquire) {
        unsafe { libc::close(upfd) };
        for handle in handles {
            let _ = handle.join();
        }
        return Err(UpcallError::Os(libc::EIO));
    }

    eprintln!(
        "upcall: legacy worker fabric live — model={:?} queues={} threads_per_queue={} total_workers={}",
        model, affinity_sets.len(), threads_per_queue, total_workers
    );

    Ok(LegacyEventHandler { upfd, registry, handles })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup_round_trips() {
        extern "C" fn noop(_: *mut core::ffi::c_void) {}
        let registry = EventRegistry::new();
        let item = WorkItem {
            arg: std::ptr::null_mut(),
            work_fn: noop,
        };
        registry.items.lock().unwrap().insert(7, item);
        assert!(registry.lookup(7).is_some());
        assert!(registry.lookup(8).is_none());
    }
}
