//! Dispatch strategies for accepted connections.
//!
//! Three interchangeable execution models share the same contract: own the
//! accept loop and decide how connection handlers are scheduled. `serve`
//! never returns except on a fatal bind/accept error.
//!
//! - `inline`: synchronous, at most one connection in flight.
//! - `thread_pool`: fixed worker threads sharing process memory and the
//!   storage namespace, fed by an unbounded queue.
//! - `process_pool`: forked worker processes, each with its own
//!   `SO_REUSEPORT` accept loop (Unix only).

mod inline;
#[cfg(unix)]
mod process_pool;
mod thread_pool;

use crate::config::{Config, DispatchMode};
use crate::handler::Handler;
use crate::storage::Storage;
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};

/// Run the server with the configured dispatch strategy.
pub fn run(config: Config) -> io::Result<()> {
    let storage = Storage::open(&config.storage_root)?;
    let handler = Handler::new(storage, config.timeout_secs);
    let addr = resolve_addr(&config.bind_addr())?;

    match config.mode {
        DispatchMode::Single => {
            let listener = bind_listener(addr, false)?;
            inline::serve(listener, handler)
        }
        DispatchMode::Thread => {
            let listener = bind_listener(addr, false)?;
            thread_pool::serve(listener, handler, config.workers)
        }
        #[cfg(unix)]
        DispatchMode::Process => process_pool::serve(addr, handler, config.workers),
        #[cfg(not(unix))]
        DispatchMode::Process => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process dispatch requires a Unix platform",
        )),
    }
}

fn resolve_addr(bind_addr: &str) -> io::Result<SocketAddr> {
    bind_addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address resolved for '{}'", bind_addr),
        )
    })
}

/// Create a blocking TCP listener.
///
/// `reuse_port` lets multiple process-pool workers bind the same address so
/// the kernel load-balances accepts between them.
pub(crate) fn bind_listener(addr: SocketAddr, reuse_port: bool) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;

    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

/// Whether an accept failure is worth retrying rather than fatal.
pub(crate) fn accept_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
