//! Process-wide shutdown coordination and Unix daemon plumbing.

use std::sync::{Arc, Condvar, Mutex};

use tracing::info;

use crate::scheduler::Scheduler;
use crate::Result;

/// Broadcast used to coordinate graceful shutdown across servers.
///
/// The context is created in `main` and threaded through whatever
/// needs to trigger or await shutdown; there is no hidden global.
#[derive(Debug, Default)]
pub struct ProcessContext {
    shutdown_now: Mutex<bool>,
    shutdown_cond: Condvar,
}

impl ProcessContext {
    /// Creates a context with shutdown not yet requested.
    pub fn new() -> Arc<ProcessContext> {
        Arc::new(ProcessContext::default())
    }

    /// Requests shutdown, waking every waiter.
    pub fn shutdown(&self) {
        let mut now = self
            .shutdown_now
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !*now {
            *now = true;
            self.shutdown_cond.notify_all();
        }
    }

    /// True once shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        *self
            .shutdown_now
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks the calling thread until shutdown is requested.
    pub fn wait_for_shutdown(&self) {
        let mut now = self
            .shutdown_now
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        while !*now {
            now = self
                .shutdown_cond
                .wait(now)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Arranges for SIGINT and SIGTERM to trigger the context's shutdown.
pub fn install_signal_handlers(
    scheduler: &Scheduler,
    context: Arc<ProcessContext>,
) -> Result<()> {
    scheduler.post(async move {
        wait_for_termination_signal().await;
        info!("termination signal received");
        context.shutdown();
    })
}

#[cfg(unix)]
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            tracing::error!(error = %e, "could not install SIGTERM handler");
            return std::future::pending().await;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Ignores the signals a long-running network daemon must not die
/// from (SIGPIPE, SIGCHLD, SIGHUP).
#[cfg(unix)]
pub fn ignore_noisy_signals() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGCHLD, libc::SIG_IGN);
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }
}

/// No-op on platforms without Unix signals.
#[cfg(not(unix))]
pub fn ignore_noisy_signals() {}

/// Detaches the process from its controlling terminal and keeps it
/// running in the background.
#[cfg(unix)]
pub fn daemonize() -> Result<()> {
    use crate::Error;
    use std::io;

    unsafe {
        // Already a daemon if our parent is init.
        if libc::getppid() == 1 {
            return Ok(());
        }

        match libc::fork() {
            -1 => return Err(Error::new_io(io::Error::last_os_error())),
            0 => {}
            // Parent exits, orphaning the daemon child.
            _ => libc::_exit(0),
        }

        // Obtain a new process group.
        libc::setsid();

        // Detach stdio from the terminal.
        for fd in 0..3 {
            libc::close(fd);
        }
        let null = libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_RDWR);
        if null != -1 {
            libc::dup(null);
            libc::dup(null);
        }

        // Restrict default file creation to 0750.
        libc::umask(0o027);
    }
    Ok(())
}

/// Daemonizing is not supported on this platform.
#[cfg(not(unix))]
pub fn daemonize() -> Result<()> {
    Err(crate::Error::new_config(
        "daemonize is only supported on Unix platforms",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn shutdown_wakes_waiters() {
        let context = ProcessContext::new();
        assert!(!context.is_shutdown());

        let waiter = Arc::clone(&context);
        let handle = std::thread::spawn(move || waiter.wait_for_shutdown());
        std::thread::sleep(Duration::from_millis(50));
        context.shutdown();
        handle.join().unwrap();
        assert!(context.is_shutdown());

        // A second request is harmless, and waiting now returns
        // immediately.
        context.shutdown();
        context.wait_for_shutdown();
    }
}
