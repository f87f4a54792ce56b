//! Shared worker-thread scheduler driving all asynchronous I/O.
//!
//! A [`Scheduler`] owns the pool of worker threads and the async I/O
//! runtime they run. Servers and other long-lived components register
//! themselves as *active users*; [`Scheduler::shutdown`] blocks until
//! every user has been removed before the workers are joined, so a
//! component is never destructed while completions referencing it are
//! still queued.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info};

use crate::Result;

/// Number of worker threads used when the hardware concurrency cannot
/// be determined.
const FALLBACK_NUM_THREADS: usize = 8;

/// How long [`Scheduler::shutdown`] waits for worker threads to join.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Manages the pool of worker threads shared by all servers.
///
/// The scheduler is started on demand: the first call to
/// [`add_active_user`](Scheduler::add_active_user), [`post`](Scheduler::post)
/// or [`handle`](Scheduler::handle) spins up the workers if
/// [`startup`](Scheduler::startup) has not been called explicitly.
#[derive(Debug)]
pub struct Scheduler {
    state: Mutex<State>,
    no_more_active_users: Condvar,
    scheduler_has_stopped: Condvar,
}

#[derive(Debug)]
struct State {
    runtime: Option<Runtime>,
    num_threads: usize,
    active_users: u32,
    is_running: bool,
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl Scheduler {
    /// Creates a stopped scheduler sized to the hardware concurrency.
    pub fn new() -> Scheduler {
        let num_threads = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(FALLBACK_NUM_THREADS);
        Scheduler {
            state: Mutex::new(State {
                runtime: None,
                num_threads,
                active_users: 0,
                is_running: false,
            }),
            no_more_active_users: Condvar::new(),
            scheduler_has_stopped: Condvar::new(),
        }
    }

    /// Starts the worker threads. Idempotent; called automatically when
    /// the scheduler is first needed.
    pub fn startup(&self) -> Result<()> {
        let mut state = self.lock();
        self.startup_locked(&mut state)
    }

    fn startup_locked(&self, state: &mut MutexGuard<'_, State>) -> Result<()> {
        if !state.is_running {
            info!(threads = state.num_threads, "starting thread scheduler");
            let runtime = Builder::new_multi_thread()
                .worker_threads(state.num_threads)
                .thread_name("pion-worker")
                .enable_all()
                .build()
                .map_err(crate::Error::new_io)?;
            state.runtime = Some(runtime);
            state.is_running = true;
        }
        Ok(())
    }

    /// Stops the scheduler, blocking until all active users have been
    /// removed and every worker thread has been joined.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if !state.is_running {
            state.runtime = None;
            return;
        }

        info!("shutting down thread scheduler");
        while state.active_users > 0 {
            debug!(
                active_users = state.active_users,
                "waiting for active users before shutdown"
            );
            state = self
                .no_more_active_users
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        state.is_running = false;
        let runtime = state.runtime.take();
        // Release the lock before joining so waiters in join() can
        // observe the stopped state as soon as it is signaled.
        drop(state);

        if let Some(runtime) = runtime {
            runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        }
        info!("thread scheduler has shutdown");
        self.scheduler_has_stopped.notify_all();
    }

    /// Blocks the calling thread until the scheduler has stopped.
    pub fn join(&self) {
        let mut state = self.lock();
        while state.is_running {
            state = self
                .scheduler_has_stopped
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Registers an active user, deferring shutdown until it is
    /// removed. Starts the workers on demand.
    pub fn add_active_user(&self) -> Result<()> {
        let mut state = self.lock();
        self.startup_locked(&mut state)?;
        state.active_users += 1;
        Ok(())
    }

    /// Removes an active user. Reaching zero releases a pending
    /// [`shutdown`](Scheduler::shutdown).
    pub fn remove_active_user(&self) {
        let mut state = self.lock();
        debug_assert!(state.active_users > 0);
        state.active_users = state.active_users.saturating_sub(1);
        if state.active_users == 0 {
            self.no_more_active_users.notify_all();
        }
    }

    /// Enqueues a single-shot task on the worker pool.
    ///
    /// Tasks do not return values; any failure is the task's own
    /// responsibility to handle.
    pub fn post<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle()?.spawn(task);
        Ok(())
    }

    /// Returns a handle to the async I/O runtime, starting the workers
    /// on demand.
    pub fn handle(&self) -> Result<Handle> {
        let mut state = self.lock();
        self.startup_locked(&mut state)?;
        let runtime = state
            .runtime
            .as_ref()
            .expect("runtime exists after startup");
        Ok(runtime.handle().clone())
    }

    /// Sets the number of worker threads used by the next startup.
    pub fn set_num_threads(&self, n: usize) {
        self.lock().num_threads = n.max(1);
    }

    /// Returns the configured number of worker threads.
    pub fn num_threads(&self) -> usize {
        self.lock().num_threads
    }

    /// Returns true while the worker pool is running.
    pub fn is_running(&self) -> bool {
        self.lock().is_running
    }

    /// Returns the number of registered active users.
    pub fn active_users(&self) -> u32 {
        self.lock().active_users
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // A runtime must not be dropped from async context; shut it
        // down with a background join if anything is still live.
        let runtime = self.lock().runtime.take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn startup_is_idempotent() {
        let scheduler = Scheduler::new();
        scheduler.startup().unwrap();
        scheduler.startup().unwrap();
        assert!(scheduler.is_running());
        scheduler.shutdown();
        assert!(!scheduler.is_running());
    }

    #[test]
    fn post_runs_tasks() {
        let scheduler = Scheduler::new();
        let (tx, rx) = mpsc::channel();
        scheduler
            .post(async move {
                tx.send(42u32).unwrap();
            })
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 42);
        scheduler.shutdown();
    }

    #[test]
    fn shutdown_waits_for_active_users() {
        let scheduler = Arc::new(Scheduler::new());
        const USERS: u32 = 3;
        for _ in 0..USERS {
            scheduler.add_active_user().unwrap();
        }

        let (tx, rx) = mpsc::channel();
        let shutter = Arc::clone(&scheduler);
        let handle = std::thread::spawn(move || {
            shutter.shutdown();
            tx.send(()).unwrap();
        });

        // Shutdown must remain blocked while users are registered.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        let start = Instant::now();
        for _ in 0..USERS {
            scheduler.remove_active_user();
        }
        rx.recv_timeout(Duration::from_secs(1))
            .expect("shutdown should complete after users release");
        assert!(start.elapsed() < Duration::from_secs(1));
        handle.join().unwrap();
    }

    #[test]
    fn join_returns_after_shutdown() {
        let scheduler = Arc::new(Scheduler::new());
        scheduler.startup().unwrap();
        let joiner = Arc::clone(&scheduler);
        let handle = std::thread::spawn(move || joiner.join());
        scheduler.shutdown();
        handle.join().unwrap();
    }
}
