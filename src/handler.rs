//! Per-connection request handling.
//!
//! Each accepted connection runs a straight-line state machine: frame the
//! header, parse the command, then run exactly one upload, download, list,
//! or delete session before the connection closes. Failures are
//! connection-scoped: a best-effort `ERROR` reply is sent where the peer is
//! still reachable, and the connection is closed on every exit path.
//!
//! Uploads arrive as a base64 byte stream of arbitrary chunking. The
//! decoder only ever decodes 4-byte-aligned prefixes of its working buffer
//! and carries the unaligned tail into the next chunk; decoding a
//! non-aligned prefix would silently corrupt the output, which is the bug
//! this session type exists to avoid. Peak memory stays O(chunk size) no
//! matter how large the file is.

use crate::protocol::{self, Command, ProtocolError, Response, READ_CHUNK_SIZE};
use crate::storage::Storage;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::BytesMut;
use std::fs::File;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Chunk size for streaming stored files back to the peer.
const DOWNLOAD_CHUNK_SIZE: usize = 65536;

/// Connection handler: one instance is shared by all workers of a dispatch
/// strategy. Holds no per-connection state.
#[derive(Debug, Clone)]
pub struct Handler {
    storage: Storage,
    timeout: Option<Duration>,
}

impl Handler {
    /// `timeout_secs == 0` disables the idle timeout.
    pub fn new(storage: Storage, timeout_secs: u64) -> Self {
        Self {
            storage,
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        }
    }

    /// Handle one accepted connection end to end.
    ///
    /// Never propagates: every failure is connection-local. The stream is
    /// dropped (closed) on all paths when this returns.
    pub fn handle(&self, mut stream: TcpStream, peer: SocketAddr) {
        debug!(peer = %peer, "New connection");

        if let Some(timeout) = self.timeout {
            let _ = stream.set_read_timeout(Some(timeout));
            let _ = stream.set_write_timeout(Some(timeout));
        }

        match self.run(&mut stream) {
            Ok(()) => debug!(peer = %peer, "Connection finished"),
            Err(e) => warn!(peer = %peer, error = %e, "Connection failed"),
        }
    }

    /// Run the request state machine, sending a best-effort `ERROR` reply
    /// on reportable failures. Secondary send failures are swallowed.
    pub fn run<S: Read + Write>(&self, stream: &mut S) -> Result<(), ProtocolError> {
        match self.process(stream) {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_reportable() {
                    let _ = stream.write_all(&Response::error(&e.to_string()));
                }
                Err(e)
            }
        }
    }

    /// Frame, parse, then dispatch on the (closed) command set.
    fn process<S: Read + Write>(&self, stream: &mut S) -> Result<(), ProtocolError> {
        let frame = protocol::read_frame(stream)?;
        let command = protocol::parse_header(&frame.header)?;

        match command {
            Command::Upload { filename, size } => {
                self.upload(stream, &filename, size, frame.payload_prefix)
            }
            Command::Get { filename } => self.download(stream, &filename),
            Command::List => self.list(stream),
            Command::Delete { filename } => self.delete(stream, &filename),
        }
    }

    fn upload<S: Read + Write>(
        &self,
        stream: &mut S,
        filename: &str,
        size: u64,
        payload_prefix: BytesMut,
    ) -> Result<(), ProtocolError> {
        let (path, file) = self
            .storage
            .create(filename)
            .map_err(ProtocolError::Storage)?;

        stream
            .write_all(Response::ready())
            .map_err(ProtocolError::Io)?;

        let session = UploadSession::new(path.clone(), file, size);
        match session.run(stream, payload_prefix) {
            Ok(decoded) => {
                stream
                    .write_all(Response::upload_complete())
                    .map_err(ProtocolError::Io)?;
                info!(filename, raw = size, decoded, "Upload complete");
                Ok(())
            }
            Err(e @ ProtocolError::InvalidEncoding) => {
                // Corrupt content must not masquerade as a complete file.
                self.storage.discard_partial(&path);
                Err(e)
            }
            Err(e @ ProtocolError::TruncatedUpload) => {
                // Partial file retained for inspection.
                warn!(filename, path = %path.display(), "Upload truncated, partial file kept");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn download<S: Read + Write>(
        &self,
        stream: &mut S,
        filename: &str,
    ) -> Result<(), ProtocolError> {
        let Some((file, size)) = self
            .storage
            .open_for_read(filename)
            .map_err(ProtocolError::Storage)?
        else {
            return Err(ProtocolError::FileNotFound(filename.to_string()));
        };

        stream
            .write_all(&Response::size(size))
            .map_err(ProtocolError::Io)?;

        let session = DownloadSession::new(file, size);
        let sent = session.run(stream)?;
        info!(filename, sent, "Download complete");
        Ok(())
    }

    fn list<S: Write>(&self, stream: &mut S) -> Result<(), ProtocolError> {
        let names = self.storage.list().map_err(ProtocolError::Storage)?;
        stream
            .write_all(&Response::listing(&names))
            .map_err(ProtocolError::Io)?;
        debug!(count = names.len(), "Listing sent");
        Ok(())
    }

    fn delete<S: Write>(&self, stream: &mut S, filename: &str) -> Result<(), ProtocolError> {
        if !self.storage.remove(filename).map_err(ProtocolError::Storage)? {
            return Err(ProtocolError::FileNotFound(filename.to_string()));
        }
        stream
            .write_all(&Response::deleted(filename))
            .map_err(ProtocolError::Io)?;
        info!(filename, "File deleted");
        Ok(())
    }
}

/// Streaming base64 upload decoder.
///
/// Owns the destination file exclusively until it is dropped. `carry` holds
/// base64 bytes whose length is not yet a multiple of 4; the invariant
/// `carry.len() < 4` holds at every decode-step boundary.
struct UploadSession {
    path: PathBuf,
    file: File,
    expected_size: u64,
    bytes_consumed_raw: u64,
    decoded_bytes: u64,
}

impl UploadSession {
    fn new(path: PathBuf, file: File, expected_size: u64) -> Self {
        Self {
            path,
            file,
            expected_size,
            bytes_consumed_raw: 0,
            decoded_bytes: 0,
        }
    }

    /// Consume exactly `expected_size` raw payload bytes from `stream`,
    /// seeded with whatever arrived alongside the header. Returns the
    /// decoded byte count.
    fn run<R: Read>(mut self, stream: &mut R, prefix: BytesMut) -> Result<u64, ProtocolError> {
        let mut carry = prefix;
        // A peer sending past the declared size is ignored beyond it.
        if carry.len() as u64 > self.expected_size {
            carry.truncate(self.expected_size as usize);
        }
        self.bytes_consumed_raw = carry.len() as u64;

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            self.drain_aligned(&mut carry)?;

            if self.bytes_consumed_raw >= self.expected_size {
                break;
            }

            let remaining = self.expected_size - self.bytes_consumed_raw;
            let want = remaining.min(READ_CHUNK_SIZE as u64) as usize;
            let n = protocol::read_chunk(stream, &mut chunk[..want])?;
            if n == 0 {
                return Err(ProtocolError::TruncatedUpload);
            }
            carry.extend_from_slice(&chunk[..n]);
            self.bytes_consumed_raw += n as u64;
        }

        // For a correctly terminated base64 stream the carry is empty here;
        // a 1-3 byte tail cannot be a valid group.
        if !carry.is_empty() {
            let decoded = STANDARD
                .decode(&carry[..])
                .map_err(|_| ProtocolError::InvalidEncoding)?;
            self.write_decoded(&decoded)?;
        }

        debug!(
            path = %self.path.display(),
            raw = self.bytes_consumed_raw,
            decoded = self.decoded_bytes,
            "Upload stream decoded"
        );
        Ok(self.decoded_bytes)
    }

    /// Decode the 4-byte-aligned prefix of `carry` and write it out,
    /// leaving the unaligned tail in place.
    fn drain_aligned(&mut self, carry: &mut BytesMut) -> Result<(), ProtocolError> {
        let usable = (carry.len() / 4) * 4;
        if usable == 0 {
            return Ok(());
        }
        let group = carry.split_to(usable);
        let decoded = STANDARD
            .decode(&group[..])
            .map_err(|_| ProtocolError::InvalidEncoding)?;
        self.write_decoded(&decoded)
    }

    fn write_decoded(&mut self, decoded: &[u8]) -> Result<(), ProtocolError> {
        self.file
            .write_all(decoded)
            .map_err(ProtocolError::Storage)?;
        self.decoded_bytes += decoded.len() as u64;
        Ok(())
    }
}

/// Raw-byte download streamer. Terminal once `bytes_sent == size`.
struct DownloadSession {
    file: File,
    size: u64,
    bytes_sent: u64,
}

impl DownloadSession {
    fn new(file: File, size: u64) -> Self {
        Self {
            file,
            size,
            bytes_sent: 0,
        }
    }

    /// Stream the file in fixed-size chunks, returning bytes sent.
    fn run<W: Write>(mut self, stream: &mut W) -> Result<u64, ProtocolError> {
        let mut chunk = vec![0u8; DOWNLOAD_CHUNK_SIZE];
        loop {
            let n = self.file.read(&mut chunk).map_err(ProtocolError::Storage)?;
            if n == 0 {
                break;
            }
            stream.write_all(&chunk[..n]).map_err(ProtocolError::Io)?;
            self.bytes_sent += n as u64;
            debug_assert!(self.bytes_sent <= self.size);
        }
        Ok(self.bytes_sent)
    }
}
