//! Inline dispatch: the accept loop runs each handler synchronously.
//!
//! At most one connection is in flight; the simplest strategy, with no
//! isolation between a slow client and the accept queue.

use super::accept_retryable;
use crate::handler::Handler;
use std::io;
use std::net::TcpListener;
use tracing::{error, info};

/// Accept and handle connections one at a time. Returns only on a fatal
/// accept error.
pub fn serve(listener: TcpListener, handler: Handler) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "Inline dispatch serving");

    loop {
        match listener.accept() {
            Ok((stream, peer)) => handler.handle(stream, peer),
            Err(e) if accept_retryable(&e) => {
                error!(error = %e, "Failed to accept connection");
            }
            Err(e) => return Err(e),
        }
    }
}
