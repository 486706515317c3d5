//! Thread-pool dispatch: a fixed set of worker threads drains an unbounded
//! connection queue.
//!
//! Submission never blocks the accept loop. Burst traffic grows the queue
//! and its memory rather than rejecting connections.

use super::accept_retryable;
use crate::handler::Handler;
use std::io;
use std::net::TcpListener;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of named worker threads fed by an unbounded queue.
///
/// Dropping the pool closes the queue; workers drain what is already
/// queued, then stop, and the drop blocks until they have.
pub struct ThreadPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(size: usize) -> io::Result<Self> {
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for worker_id in 0..size {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("worker-{}", worker_id))
                .spawn(move || worker_loop(worker_id, receiver))?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Queue a job. Never blocks; the queue is unbounded.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Send only fails once all workers are gone, which means the pool
        // is shutting down anyway.
        if let Some(sender) = &self.sender {
            let _ = sender.send(Box::new(job));
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(worker_id: usize, receiver: Arc<Mutex<Receiver<Job>>>) {
    debug!(worker = worker_id, "Worker started");
    loop {
        let job = {
            let guard = match receiver.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.recv()
        };
        match job {
            Ok(job) => job(),
            // Channel closed: pool is shutting down.
            Err(_) => break,
        }
    }
    debug!(worker = worker_id, "Worker stopped");
}

/// Accept connections and hand each to the pool. Returns only on a fatal
/// accept error.
pub fn serve(listener: TcpListener, handler: Handler, workers: usize) -> io::Result<()> {
    let pool = ThreadPool::new(workers.max(1))?;
    info!(
        addr = %listener.local_addr()?,
        workers = workers.max(1),
        "Thread-pool dispatch serving"
    );

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                let handler = handler.clone();
                pool.execute(move || handler.handle(stream, peer));
            }
            Err(e) if accept_retryable(&e) => {
                error!(error = %e, "Failed to accept connection");
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_pool_runs_all_jobs() {
        let pool = ThreadPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    fn start_server(workers: usize) -> (tempfile::TempDir, SocketAddr) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let handler = Handler::new(storage, 5);

        let listener = super::super::bind_listener("127.0.0.1:0".parse().unwrap(), false).unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let _ = serve(listener, handler, workers);
        });
        (dir, addr)
    }

    /// Minimal client: send the command, read up to the reply delimiter,
    /// return (reply line, any bytes that followed in the same stream).
    fn request(addr: SocketAddr, command: &str, payload: &[u8]) -> (String, Vec<u8>) {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(command.as_bytes()).unwrap();
        stream.write_all(b"\r\n\r\n").unwrap();
        stream.write_all(payload).unwrap();

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).unwrap();
        let pos = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("reply delimiter");
        let header = String::from_utf8_lossy(&raw[..pos]).into_owned();
        (header, raw[pos + 4..].to_vec())
    }

    #[test]
    fn test_upload_and_concurrent_get() {
        let (_dir, addr) = start_server(4);

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        let encoded = STANDARD.encode(&payload);
        let (header, _) = request(
            addr,
            &format!("UPLOAD shared.bin {}", encoded.len()),
            encoded.as_bytes(),
        );
        assert!(header.starts_with("OK"));

        // Two simultaneous GETs for the same file while an independent
        // upload proceeds in parallel.
        let getters: Vec<_> = (0..2)
            .map(|_| {
                let payload = payload.clone();
                thread::spawn(move || {
                    let (header, body) = request(addr, "GET shared.bin", b"");
                    assert_eq!(header, format!("OK {}", payload.len()));
                    assert_eq!(body, payload);
                })
            })
            .collect();

        let other = STANDARD.encode(b"independent");
        let (header, rest) = request(
            addr,
            &format!("UPLOAD other.bin {}", other.len()),
            other.as_bytes(),
        );
        assert_eq!(header, "OK Ready to receive");
        assert_eq!(rest, b"OK Upload complete\r\n\r\n");

        for getter in getters {
            getter.join().unwrap();
        }
    }

    #[test]
    fn test_unknown_command_over_socket() {
        let (_dir, addr) = start_server(2);
        let (header, _) = request(addr, "FOO bar", b"");
        assert!(header.starts_with("ERROR Unknown command"));
    }
}
