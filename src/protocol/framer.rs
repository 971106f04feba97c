//! Interleaved wire framer (RFC 2326 §10.12).
//!
//! After PLAY, the server writes two kinds of frames onto the single TCP
//! stream with no outer framing:
//!
//! - binary blocks: `$ <channel:u8> <length:u16 BE> <payload>`, carrying
//!   RTP (even channels) or RTCP (odd channels);
//! - text responses (`RTSP/1.0 ...`), e.g. replies to keep-alive OPTIONS.
//!
//! Text responses carry no length prefix, so after any malformed byte the
//! only recovery is to scan for the two synchronization tokens — the `$`
//! byte and the ASCII `RTSP` prefix — and validate `$` candidates against
//! the session's stream table before trusting them. A rejected candidate
//! is un-read (minus its `$`) and scanning resumes inside those bytes, so
//! a `$` occurring in response text cannot swallow the response behind it.

use std::collections::VecDeque;
use std::io::Read;

use bytes::{BufMut, BytesMut};

use crate::error::Result;
use crate::protocol::response::RtspResponse;

/// Number of payload bytes handed to the validator along with the block
/// header. Enough for the RTP fixed header fields that identify a stream.
const VALIDATE_PREFIX_LEN: usize = 8;

/// One frame recovered from the interleaved stream.
#[derive(Debug)]
pub enum Frame {
    /// A complete RTSP text response, body included.
    Response(RtspResponse),
    /// A `$`-framed binary block. Even channels carry RTP, odd RTCP.
    Interleaved { channel: u8, payload: bytes::Bytes },
}

/// Validates a candidate interleaved block header against session state.
///
/// `prefix` holds the first payload bytes (up to 8; fewer when the
/// declared length is shorter). Implementations accept a candidate only
/// when its channel maps to a known stream; odd (RTCP) channels are
/// accepted unconditionally, even channels only when the prefix carries
/// the RTP version bits and that stream's payload type.
pub trait BlockValidator {
    fn validate(&self, channel: u8, declared_len: usize, prefix: &[u8]) -> bool;
}

/// Splits a buffered TCP byte stream into [`Frame`]s.
///
/// Owns a small lookahead queue so rejected candidate bytes can be
/// rescanned instead of dropped.
pub struct Framer<R: Read> {
    reader: R,
    lookahead: VecDeque<u8>,
}

impl<R: Read> Framer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            lookahead: VecDeque::new(),
        }
    }

    /// Block until the next complete frame is available.
    ///
    /// Errors are I/O-level only (including clean EOF, surfaced as
    /// `UnexpectedEof`): framing desynchronization is handled internally
    /// by resuming the scan.
    pub fn next_frame(&mut self, validator: &dyn BlockValidator) -> Result<Frame> {
        loop {
            let b = self.next_byte()?;
            if b == b'$' {
                if let Some(frame) = self.try_read_block(validator)? {
                    return Ok(frame);
                }
            } else if b == b'R' && self.lookahead_matches(b"TSP")? {
                return Ok(Frame::Response(self.read_response()?));
            }
        }
    }

    /// Attempt to read an interleaved block after a `$` byte. On
    /// validation failure the header and prefix bytes are pushed back for
    /// rescanning and `None` is returned.
    fn try_read_block(&mut self, validator: &dyn BlockValidator) -> Result<Option<Frame>> {
        let mut header = [0u8; 3];
        self.read_exact_buf(&mut header)?;
        let channel = header[0];
        let declared_len = u16::from_be_bytes([header[1], header[2]]) as usize;

        let prefix_len = declared_len.min(VALIDATE_PREFIX_LEN);
        let mut prefix = vec![0u8; prefix_len];
        self.read_exact_buf(&mut prefix)?;

        if !validator.validate(channel, declared_len, &prefix) {
            tracing::trace!(channel, declared_len, "interleaved candidate rejected, resyncing");
            for &b in prefix.iter().rev() {
                self.lookahead.push_front(b);
            }
            for &b in header.iter().rev() {
                self.lookahead.push_front(b);
            }
            return Ok(None);
        }

        let mut payload = BytesMut::with_capacity(declared_len);
        payload.put_slice(&prefix);
        let mut rest = vec![0u8; declared_len - prefix_len];
        self.read_exact_buf(&mut rest)?;
        payload.put_slice(&rest);

        Ok(Some(Frame::Interleaved {
            channel,
            payload: payload.freeze(),
        }))
    }

    /// Read a text response. The leading `R` has been consumed and `TSP`
    /// is known to follow.
    fn read_response(&mut self) -> Result<RtspResponse> {
        let mut head = String::from("R");
        for _ in 0..3 {
            head.push(self.next_byte()? as char);
        }

        // Rest of the status line, then headers until the empty line.
        loop {
            let line = self.read_line()?;
            head.push_str(&line);
            head.push('\n');
            if line.is_empty() {
                break;
            }
        }

        let mut response = RtspResponse::parse_head(&head)?;

        let content_length = response.content_length();
        if content_length > 0 {
            let mut body = vec![0u8; content_length];
            self.read_exact_buf(&mut body)?;
            response.body = body;
        }

        Ok(response)
    }

    /// Read bytes until `\n`, stripping `\r`.
    fn read_line(&mut self) -> Result<String> {
        let mut out = Vec::new();
        loop {
            let b = self.next_byte()?;
            if b == b'\n' {
                break;
            }
            if b != b'\r' {
                out.push(b);
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn next_byte(&mut self) -> std::io::Result<u8> {
        if let Some(b) = self.lookahead.pop_front() {
            return Ok(b);
        }
        let mut buf = [0u8; 1];
        self.reader.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Whether the next bytes equal `expected`, without consuming them.
    /// Returns `false` (rather than an error) when the stream ends first,
    /// so the scan loop reports EOF at its natural read site.
    fn lookahead_matches(&mut self, expected: &[u8]) -> std::io::Result<bool> {
        while self.lookahead.len() < expected.len() {
            let mut buf = [0u8; 1];
            match self.reader.read_exact(&mut buf) {
                Ok(()) => self.lookahead.push_back(buf[0]),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(self
            .lookahead
            .iter()
            .zip(expected.iter())
            .all(|(a, b)| a == b))
    }

    fn read_exact_buf(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.lookahead.pop_front() {
                Some(b) => {
                    buf[filled] = b;
                    filled += 1;
                }
                None => break,
            }
        }
        if filled < buf.len() {
            self.reader.read_exact(&mut buf[filled..])?;
        }
        Ok(())
    }
}
