//! Worker fabric: `init_event_handler` (spec.md §4.4) as an
//! `EventHandlerBuilder`, plus the rendezvous barrier that brings every
//! worker live atomically.
//!
//! Grounded on `init_threads`/`worker_setup` in `event-tester/upcall.c`: one
//! CPU-pinned, detached thread per queue (times `threads_per_queue`), each
//! running its own setup before blocking on a shared gate, released all at
//! once once every worker has arrived. The gate itself is a hand-rolled
//! `Mutex`+`Condvar` pair rather than `std::sync::Barrier`, since the
//! spawning thread is a releaser, not a participant (mirrors the
//! asymmetric `setup_count`/`setup_cond` protocol in the original, with the
//! spawner's busy-poll replaced by a proper condvar wait).

use crate::buffer::BufferCache;
use crate::eventloop::{self, Worker};
use crate::syscall;
use crate::topology;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use upcall_core::error::{Result, UpcallError};
use upcall_core::flags::{ConcurrencyModel, O_CLOEXEC};

/// A one-shot rendezvous gate: N workers arrive, the spawner releases them
/// all together. Not reusable — built fresh per `init_event_handler` call.
pub(crate) struct Rendezvous {
    count: Mutex<usize>,
    cond: Condvar,
    total: AtomicUsize,
}

impl Rendezvous {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
            total: AtomicUsize::new(total),
        }
    }

    /// Called by a worker once its own setup is complete. Blocks until the
    /// spawner has seen every worker arrive and reset the gate.
    pub(crate) fn arrive_and_wait(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_all();
        while *count != 0 {
            count = self.cond.wait(count).unwrap();
        }
    }

    /// Called by the spawning thread. Blocks until every worker has
    /// arrived, then resets the gate and releases them all at once.
    pub(crate) fn wait_for_all_and_release(&self) {
        let total = self.total.load(Ordering::Acquire);
        let mut count = self.count.lock().unwrap();
        while *count < total {
            count = self.cond.wait(count).unwrap();
        }
        *count = 0;
        self.cond.notify_all();
    }

    /// Lower the expected arrival count after a spawn failure cuts the
    /// worker set short partway through — only the threads that actually
    /// started will ever call `arrive_and_wait`, so waiting on the
    /// original count would block forever.
    pub(crate) fn cancel_unspawned(&self, spawned: usize) {
        self.total.store(spawned, Ordering::Release);
    }
}

/// Configuration for [`init_event_handler`], following the same plain
/// builder shape `InstanceBuilder` uses in `ksvc-module/src/instance.rs`.
#[derive(Debug, Clone)]
pub struct EventHandlerConfig {
    model: ConcurrencyModel,
    threads_per_queue: usize,
    msg_size: usize,
    buf_count: usize,
    donation: bool,
    inbound_capacity: usize,
}

impl Default for EventHandlerConfig {
    fn default() -> Self {
        Self {
            model: ConcurrencyModel::PerCpu,
            threads_per_queue: 1,
            msg_size: 4096,
            buf_count: 64,
            donation: true,
            inbound_capacity: 32,
        }
    }
}

/// Builder for [`EventHandlerConfig`]; `.build(setup_fn)` performs the five
/// `init_event_handler` steps from spec.md §4.4.
pub struct EventHandlerBuilder {
    config: EventHandlerConfig,
}

impl EventHandlerBuilder {
    pub fn new() -> Self {
        Self {
            config: EventHandlerConfig::default(),
        }
    }

    pub fn model(mut self, model: ConcurrencyModel) -> Self {
        self.config.model = model;
        self
    }

    pub fn threads_per_queue(mut self, n: usize) -> Self {
        self.config.threads_per_queue = n.max(1);
        self
    }

    pub fn msg_size(mut self, n: usize) -> Self {
        self.config.msg_size = n;
        self
    }

    pub fn buf_count(mut self, n: usize) -> Self {
        self.config.buf_count = n;
        self
    }

    /// Buffer-donation mode (`true`, the default) vs. classic caller-supplied
    /// read buffers (`false`).
    pub fn donation(mut self, donation: bool) -> Self {
        self.config.donation = donation;
        self
    }

    pub fn inbound_capacity(mut self, n: usize) -> Self {
        self.config.inbound_capacity = n.max(1);
        self
    }

    /// Build the event handler and bring every worker live.
    ///
    /// `setup_fn` runs once per worker thread, after that worker's
    /// `BufferCache` and initial donation pool are ready but before the
    /// rendezvous barrier — this is where a caller queues its `add_accept`
    /// (spec.md §4.6's `on_accept` registration, for instance).
    pub fn build<F>(self, setup_fn: F) -> Result<EventHandler>
    where
        F: Fn(&mut Worker, &mut BufferCache, usize) + Send + Sync + Clone + 'static,
    {
        init_event_handler(self.config, setup_fn)
    }
}

impl Default for EventHandlerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A live event handler: the upcall fd and the handles of every worker
/// thread it spawned. Detached threads run until `shutdown()` is called.
pub struct EventHandler {
    upfd: i32,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl EventHandler {
    #[inline]
    pub fn upfd(&self) -> i32 {
        self.upfd
    }

    /// Ask every worker to exit after its current `submit` call returns,
    /// then join them all. Not part of the original's "run until death"
    /// model, but `cmd/upcall-echod`'s SIGINT/SIGTERM handler needs
    /// somewhere to signal into.
    pub fn shutdown(self) {
        self.shutdown.store(true, std::sync::atomic::Ordering::Release);
        for handle in self.handles {
            let _ = handle.join();
        }
        unsafe { libc::close(self.upfd) };
    }
}

/// spec.md §4.4's five steps:
///
/// 1. `upcall_create` the queue set.
/// 2. Query the kernel-reported queue count.
/// 3. Resolve CPU affinity sets for the chosen concurrency model.
/// 4. Spawn `threads_per_queue` CPU-pinned threads per queue, each running
///    its own buffer cache setup, `setup_fn`, then the rendezvous barrier.
/// 5. Release every worker at once; they fall into `run_event_loop`.
///
/// Any worker failing to spawn or pin is fatal — per spec.md, "no partial
/// startup": already-spawned workers are signalled to shut down and
/// joined, the upcall fd is closed, and the first error is returned.
pub fn init_event_handler<F>(config: EventHandlerConfig, setup_fn: F) -> Result<EventHandler>
where
    F: Fn(&mut Worker, &mut BufferCache, usize) + Send + Sync + Clone + 'static,
{
    let num_cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    let flags = config.model.flag_bit() | O_CLOEXEC;
    let upfd = syscall::create(flags)?;

    let queue_count = match syscall::queue_count(upfd) {
        Ok(n) => n as usize,
        Err(e) => {
            unsafe { libc::close(upfd) };
            return Err(e);
        }
    };

    let affinity_sets = match topology::resolve(config.model, num_cpus, queue_count) {
        Ok(sets) => sets,
        Err(e) => {
            unsafe { libc::close(upfd) };
            return Err(e);
        }
    };

    let total_workers = affinity_sets.len() * config.threads_per_queue;
    let rendezvous = Arc::new(Rendezvous::new(total_workers));
    let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let started = Arc::new(std::sync::atomic::AtomicBool::new(true));

    let mut handles = Vec::with_capacity(total_workers);
    let mut spawn_err: Option<UpcallError> = None;

    'spawn: for (queue_index, cpu_set) in affinity_sets.iter().enumerate() {
        for _ in 0..config.threads_per_queue {
            let cpu_set = cpu_set.clone();
            let setup_fn = setup_fn.clone();
            let rendezvous = Arc::clone(&rendezvous);
            let shutdown = Arc::clone(&shutdown);
            let started = Arc::clone(&started);
            let donation = config.donation;
            let inbound_capacity = config.inbound_capacity;
            let msg_size = config.msg_size;
            let buf_count = config.buf_count;

            let spawned = thread::Builder::new()
                .name(format!("upcall-worker-{}", queue_index))
                .spawn(move || {
                    if let Err(e) = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &cpu_set) {
                        eprintln!("upcall: worker {} failed to set affinity: {}", queue_index, e);
                        started.store(false, std::sync::atomic::Ordering::Release);
                        rendezvous.arrive_and_wait();
                        return;
                    }

                    let mut worker = Worker::new(queue_index, upfd, donation, inbound_capacity);
                    let mut cache = BufferCache::new(msg_size, buf_count, queue_index);
                    if donation {
                        eventloop::upcall_worker_setup(&mut worker, &mut cache, buf_count);
                    }

                    setup_fn(&mut worker, &mut cache, queue_index);

                    rendezvous.arrive_and_wait();

                    while !shutdown.load(std::sync::atomic::Ordering::Acquire) {
                        if let Err(e) = eventloop::run_event_loop(&mut worker, false) {
                            eprintln!("upcall: worker {} submit failed: {}", queue_index, e);
                            break;
                        }
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
        shutdown.store(true, std::sync::atomic::Ordering::Release);
        // Workers already blocked in `arrive_and_wait` never see the
        // `submit` loop's shutdown check — release the gate so they can.
        // Only `handles.len()` threads actually started, so the gate must
        // not wait for the full `total_workers` that were meant to spawn.
        rendezvous.cancel_unspawned(handles.len());
        rendezvous.wait_for_all_and_release();
        for handle in handles {
            let _ = handle.join();
        }
        unsafe { libc::close(upfd) };
        return Err(err);
    }

    rendezvous.wait_for_all_and_release();

    if !started.load(std::sync::atomic::Ordering::Acquire) {
        // Every worker arrived, but at least one failed to pin its
        // affinity before getting there — its queue would sit unserved
        // forever. No partial startup: tear the whole fabric down.
        shutdown.store(true, std::sync::atomic::Ordering::Release);
        for handle in handles {
            let _ = handle.join();
        }
        unsafe { libc::close(upfd) };
        return Err(UpcallError::Os(libc::EIO));
    }

    eprintln!(
        "upcall: worker fabric live — model={:?} queues={} threads_per_queue={} total_workers={}",
        config.model, affinity_sets.len(), config.threads_per_queue, total_workers
    );

    Ok(EventHandler {
        upfd,
        shutdown,
        handles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendezvous_releases_all_arrivals_together() {
        let gate = Arc::new(Rendezvous::new(3));
        let released = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let gate = Arc::clone(&gate);
            let released = Arc::clone(&released);
            handles.push(thread::spawn(move || {
                gate.arrive_and_wait();
                released.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }

        gate.wait_for_all_and_release();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(released.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[test]
    fn builder_defaults_are_sane() {
        let builder = EventHandlerBuilder::new();
        assert_eq!(builder.config.threads_per_queue, 1);
        assert!(builder.config.donation);
    }
}
