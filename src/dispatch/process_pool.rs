//! Process-pool dispatch: forked workers, each with its own accept loop.
//!
//! Accept-in-worker design: every worker binds its own `SO_REUSEPORT`
//! listener on the shared address, so the kernel load-balances incoming
//! connections across workers with no parent coordination. A connection is
//! accepted by exactly one worker, and a crashing worker cannot take down a
//! listener owned by a sibling process.

use super::bind_listener;
use crate::handler::Handler;
use std::io;
use std::net::SocketAddr;
use tracing::{error, info, warn};

/// Fork `workers` processes and wait for them. The parent returns only once
/// every worker has exited; workers themselves never return.
pub fn serve(addr: SocketAddr, handler: Handler, workers: usize) -> io::Result<()> {
    let workers = workers.max(1);
    info!(addr = %addr, workers, "Process-pool dispatch starting");

    let mut pids = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        match unsafe { libc::fork() } {
            -1 => return Err(io::Error::last_os_error()),
            0 => {
                // Child: run the accept loop and never come back through
                // the parent's stack. _exit skips atexit handlers and the
                // stdio buffers duplicated by fork.
                let code = match worker_loop(worker_id, addr, &handler) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!(worker = worker_id, error = %e, "Worker failed");
                        1
                    }
                };
                unsafe { libc::_exit(code) };
            }
            pid => {
                info!(worker = worker_id, pid, "Forked worker");
                pids.push(pid);
            }
        }
    }

    for pid in pids {
        let mut status: libc::c_int = 0;
        if unsafe { libc::waitpid(pid, &mut status, 0) } == -1 {
            warn!(pid, error = %io::Error::last_os_error(), "waitpid failed");
        } else {
            warn!(pid, status, "Worker exited");
        }
    }

    Ok(())
}

/// Per-worker accept loop over a private `SO_REUSEPORT` listener.
fn worker_loop(worker_id: usize, addr: SocketAddr, handler: &Handler) -> io::Result<()> {
    let listener = bind_listener(addr, true)?;
    info!(
        worker = worker_id,
        pid = std::process::id(),
        addr = %listener.local_addr()?,
        "Worker accepting"
    );

    loop {
        match listener.accept() {
            Ok((stream, peer)) => handler.handle(stream, peer),
            Err(e) if super::accept_retryable(&e) => {
                error!(worker = worker_id, error = %e, "Failed to accept connection");
            }
            Err(e) => return Err(e),
        }
    }
}
