//! Wire protocol framing and command parsing.
//!
//! Requests are a single text header line terminated by `\r\n\r\n`:
//! - `UPLOAD <filename> <size>` followed by exactly `size` bytes of base64 payload
//! - `GET <filename>`
//! - `LIST`
//! - `DELETE <filename>`
//!
//! Replies use the same `\r\n\r\n` terminated framing: `OK ...` or `ERROR ...`.
//! GET replies carry the raw file bytes after the header frame; the upload
//! payload is base64 while downloads are raw, an asymmetry the protocol keeps.

use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Read};
use std::str;

/// Header frame delimiter.
pub const HEADER_DELIMITER: &[u8] = b"\r\n\r\n";

/// Maximum accumulated bytes while searching for the header delimiter.
pub const MAX_HEADER_SIZE: usize = 8192;

/// Bounded read size for header and upload payload chunks.
pub const READ_CHUNK_SIZE: usize = 8192;

/// Parsed request command.
///
/// A closed set: unknown command strings never escape the parser, so the
/// connection handler can match exhaustively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store a file; `size` is the raw base64 payload length in bytes.
    Upload { filename: String, size: u64 },
    /// Retrieve a file as raw bytes.
    Get { filename: String },
    /// List the names in the storage namespace.
    List,
    /// Remove a file.
    Delete { filename: String },
}

/// Connection-local protocol errors.
///
/// None of these are fatal to the server process; each terminates exactly
/// one connection.
#[derive(Debug)]
pub enum ProtocolError {
    /// Header exceeded [`MAX_HEADER_SIZE`] without a delimiter.
    HeaderTooLarge,
    /// Peer closed before the header delimiter arrived.
    ConnectionClosedEarly,
    /// Header was not valid UTF-8 or had too few tokens.
    MalformedHeader,
    /// First token was not a recognized command.
    UnknownCommand(String),
    /// UPLOAD without a parseable non-negative size.
    MissingOrInvalidSize,
    /// Upload payload was not valid base64.
    InvalidEncoding,
    /// Peer closed before sending the full upload payload.
    TruncatedUpload,
    /// GET or DELETE target does not exist.
    FileNotFound(String),
    /// Disk-level failure (open, write, sync, remove).
    Storage(io::Error),
    /// Socket-level failure outside the framing rules above.
    Io(io::Error),
}

impl ProtocolError {
    /// Whether an `ERROR` reply should be attempted for this failure.
    ///
    /// When the peer already closed (or went silent past the idle timeout)
    /// there is nobody left to reply to; those cases are logged only.
    pub fn is_reportable(&self) -> bool {
        !matches!(
            self,
            ProtocolError::ConnectionClosedEarly
                | ProtocolError::TruncatedUpload
                | ProtocolError::Io(_)
        )
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::HeaderTooLarge => write!(f, "Header too large"),
            ProtocolError::ConnectionClosedEarly => {
                write!(f, "Connection closed before header completed")
            }
            ProtocolError::MalformedHeader => write!(f, "Invalid command format"),
            ProtocolError::UnknownCommand(cmd) => write!(f, "Unknown command: {}", cmd),
            ProtocolError::MissingOrInvalidSize => write!(f, "Missing or invalid size"),
            ProtocolError::InvalidEncoding => write!(f, "Invalid base64 payload"),
            ProtocolError::TruncatedUpload => {
                write!(f, "Connection closed before upload completed")
            }
            ProtocolError::FileNotFound(_) => write!(f, "File not found"),
            ProtocolError::Storage(e) => write!(f, "Storage error: {}", e),
            ProtocolError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Storage(e) | ProtocolError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// A framed request header plus whatever payload bytes arrived with it.
#[derive(Debug)]
pub struct Frame {
    /// The header line, delimiter excluded.
    pub header: Bytes,
    /// Bytes read past the delimiter. For UPLOAD these are the first slice
    /// of the payload stream and must not be discarded.
    pub payload_prefix: BytesMut,
}

/// Read from `reader` until the header delimiter appears.
///
/// Fails with `HeaderTooLarge` when the header line exceeds
/// [`MAX_HEADER_SIZE`] bytes, whether or not a delimiter eventually shows
/// up, and `ConnectionClosedEarly` on EOF (or read timeout) before the
/// delimiter.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame, ProtocolError> {
    let mut buffer = BytesMut::with_capacity(READ_CHUNK_SIZE);
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        if let Some(pos) = find_delimiter(&buffer) {
            if pos > MAX_HEADER_SIZE {
                return Err(ProtocolError::HeaderTooLarge);
            }
            let header = buffer.split_to(pos).freeze();
            buffer.advance(HEADER_DELIMITER.len());
            return Ok(Frame {
                header,
                payload_prefix: buffer,
            });
        }

        // No delimiter yet. Once the buffer holds more than a maximal
        // header plus a possibly straddling delimiter, any delimiter still
        // to come would start past the size bound.
        if buffer.len() > MAX_HEADER_SIZE + HEADER_DELIMITER.len() {
            return Err(ProtocolError::HeaderTooLarge);
        }

        let n = read_chunk(reader, &mut chunk)?;
        if n == 0 {
            return Err(ProtocolError::ConnectionClosedEarly);
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

/// Bounded read that folds timeouts into the zero-length-read path.
///
/// An idle-timeout expiry is indistinguishable from the peer going away
/// as far as the protocol is concerned, so both surface as `Ok(0)`.
pub fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, ProtocolError> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Ok(0)
            }
            Err(e) => return Err(ProtocolError::Io(e)),
        }
    }
}

/// Find the header delimiter, returning the offset of its first byte.
fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEADER_DELIMITER.len())
        .position(|w| w == HEADER_DELIMITER)
}

/// Parse a header line into a [`Command`].
pub fn parse_header(header: &[u8]) -> Result<Command, ProtocolError> {
    let line = str::from_utf8(header).map_err(|_| ProtocolError::MalformedHeader)?;
    let parts: Vec<&str> = line.split_whitespace().collect();

    let Some(&command) = parts.first() else {
        return Err(ProtocolError::MalformedHeader);
    };

    if command.eq_ignore_ascii_case("LIST") {
        return Ok(Command::List);
    }

    if parts.len() < 2 {
        return Err(ProtocolError::MalformedHeader);
    }
    let filename = parts[1].to_string();

    if command.eq_ignore_ascii_case("UPLOAD") {
        let size = parts
            .get(2)
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or(ProtocolError::MissingOrInvalidSize)?;
        Ok(Command::Upload { filename, size })
    } else if command.eq_ignore_ascii_case("GET") {
        Ok(Command::Get { filename })
    } else if command.eq_ignore_ascii_case("DELETE") {
        Ok(Command::Delete { filename })
    } else {
        Err(ProtocolError::UnknownCommand(command.to_string()))
    }
}

/// Reply frame formatting.
pub struct Response;

impl Response {
    /// Acknowledgement sent after an UPLOAD header is accepted, before
    /// payload consumption begins.
    pub fn ready() -> &'static [u8] {
        b"OK Ready to receive\r\n\r\n"
    }

    /// Sent once the full upload payload is decoded and on disk.
    pub fn upload_complete() -> &'static [u8] {
        b"OK Upload complete\r\n\r\n"
    }

    /// GET success header; raw file bytes follow immediately.
    pub fn size(size: u64) -> Vec<u8> {
        format!("OK {}\r\n\r\n", size).into_bytes()
    }

    /// DELETE success.
    pub fn deleted(filename: &str) -> Vec<u8> {
        format!("OK Deleted {}\r\n\r\n", filename).into_bytes()
    }

    /// LIST success; names are whitespace-separated (the command grammar
    /// precludes names containing whitespace).
    pub fn listing(names: &[String]) -> Vec<u8> {
        let mut reply = String::from("OK");
        for name in names {
            reply.push(' ');
            reply.push_str(name);
        }
        reply.push_str("\r\n\r\n");
        reply.into_bytes()
    }

    /// Error reply with a human-readable message.
    pub fn error(message: &str) -> Vec<u8> {
        format!("ERROR {}\r\n\r\n", message).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that hands out at most `limit` bytes per read call, to
    /// exercise delimiter and carry handling across arbitrary chunk splits.
    pub struct Trickle<R> {
        inner: R,
        limit: usize,
    }

    impl<R: Read> Trickle<R> {
        pub fn new(inner: R, limit: usize) -> Self {
            Self { inner, limit }
        }
    }

    impl<R: Read> Read for Trickle<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.limit);
            self.inner.read(&mut buf[..n])
        }
    }

    #[test]
    fn test_read_frame_splits_header_and_prefix() {
        let mut input = Cursor::new(b"UPLOAD data.bin 8\r\n\r\nAAAA".to_vec());
        let frame = read_frame(&mut input).unwrap();
        assert_eq!(&frame.header[..], b"UPLOAD data.bin 8");
        assert_eq!(&frame.payload_prefix[..], b"AAAA");
    }

    #[test]
    fn test_read_frame_without_payload() {
        let mut input = Cursor::new(b"GET data.bin\r\n\r\n".to_vec());
        let frame = read_frame(&mut input).unwrap();
        assert_eq!(&frame.header[..], b"GET data.bin");
        assert!(frame.payload_prefix.is_empty());
    }

    #[test]
    fn test_read_frame_delimiter_across_reads() {
        // One byte per read: the delimiter arrives split over four reads.
        let mut input = Trickle::new(Cursor::new(b"LIST\r\n\r\nxyz".to_vec()), 1);
        let frame = read_frame(&mut input).unwrap();
        assert_eq!(&frame.header[..], b"LIST");
        assert_eq!(&frame.payload_prefix[..], b"xyz");
    }

    #[test]
    fn test_read_frame_closed_early() {
        let mut input = Cursor::new(b"GET data.bin\r\n".to_vec());
        match read_frame(&mut input) {
            Err(ProtocolError::ConnectionClosedEarly) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_read_frame_header_too_large() {
        let mut big = vec![b'a'; MAX_HEADER_SIZE + 64];
        big.extend_from_slice(b"\r\n\r\n");
        let mut input = Cursor::new(big);
        match read_frame(&mut input) {
            Err(ProtocolError::HeaderTooLarge) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_read_frame_oversized_header_split_across_reads() {
        // The delimiter arrives in the read that crosses the size bound;
        // the header must still be rejected.
        let mut big = vec![b'a'; 12000];
        big.extend_from_slice(b"\r\n\r\n");
        let mut input = Trickle::new(Cursor::new(big), MAX_HEADER_SIZE - 1);
        match read_frame(&mut input) {
            Err(ProtocolError::HeaderTooLarge) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_read_frame_header_at_size_bound() {
        let mut input_bytes = vec![b'a'; MAX_HEADER_SIZE];
        input_bytes.extend_from_slice(b"\r\n\r\n");
        let mut input = Cursor::new(input_bytes);
        let frame = read_frame(&mut input).unwrap();
        assert_eq!(frame.header.len(), MAX_HEADER_SIZE);
    }

    #[test]
    fn test_parse_upload() {
        let cmd = parse_header(b"UPLOAD report.pdf 1024").unwrap();
        assert_eq!(
            cmd,
            Command::Upload {
                filename: "report.pdf".to_string(),
                size: 1024
            }
        );
    }

    #[test]
    fn test_parse_case_insensitive() {
        let cmd = parse_header(b"upload report.pdf 1024").unwrap();
        assert!(matches!(cmd, Command::Upload { .. }));

        let cmd = parse_header(b"get report.pdf").unwrap();
        assert_eq!(
            cmd,
            Command::Get {
                filename: "report.pdf".to_string()
            }
        );
    }

    #[test]
    fn test_parse_list_and_delete() {
        assert_eq!(parse_header(b"LIST").unwrap(), Command::List);
        assert_eq!(
            parse_header(b"DELETE old.log").unwrap(),
            Command::Delete {
                filename: "old.log".to_string()
            }
        );
    }

    #[test]
    fn test_parse_upload_missing_size() {
        match parse_header(b"UPLOAD report.pdf") {
            Err(ProtocolError::MissingOrInvalidSize) => {}
            other => panic!("unexpected: {:?}", other),
        }
        match parse_header(b"UPLOAD report.pdf -3") {
            Err(ProtocolError::MissingOrInvalidSize) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_malformed() {
        match parse_header(b"") {
            Err(ProtocolError::MalformedHeader) => {}
            other => panic!("unexpected: {:?}", other),
        }
        match parse_header(b"GET") {
            Err(ProtocolError::MalformedHeader) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_command() {
        match parse_header(b"FOO bar") {
            Err(ProtocolError::UnknownCommand(cmd)) => assert_eq!(cmd, "FOO"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_response_frames() {
        assert_eq!(Response::size(42), b"OK 42\r\n\r\n");
        assert_eq!(
            Response::error("File not found"),
            b"ERROR File not found\r\n\r\n"
        );
        assert_eq!(
            Response::listing(&["a.txt".to_string(), "b.txt".to_string()]),
            b"OK a.txt b.txt\r\n\r\n"
        );
        assert_eq!(Response::listing(&[]), b"OK\r\n\r\n");
    }
}
