use crate::error::{ProtocolErrorKind, Result, RtspError};

/// A parsed RTSP response (RFC 2326 §7).
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 2\r\n
/// Content-Type: application/sdp\r\n
/// Content-Length: 142\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// The framer parses the head (status line + headers) and then reads
/// `Content-Length` bytes of body. Header lookup is case-insensitive per
/// RFC 2326 §4.2.
#[derive(Debug)]
pub struct RtspResponse {
    /// Numeric status code (200, 401, 454, ...).
    pub status: u16,
    /// Reason phrase as sent by the server (may be empty).
    pub reason: String,
    /// Headers as ordered (name, value) pairs. Names are stored
    /// as-received; lookups via [`get_header`](Self::get_header) are
    /// case-insensitive.
    pub headers: Vec<(String, String)>,
    /// Response body (`Content-Length` bytes), filled in by the framer.
    pub body: Vec<u8>,
}

impl RtspResponse {
    /// Parse the status line and header block (everything up to the empty
    /// line). Returns [`RtspError::Protocol`] on malformed input.
    pub fn parse_head(raw: &str) -> Result<Self> {
        let mut lines = raw.lines();

        let status_line = lines.next().ok_or(RtspError::Protocol {
            kind: ProtocolErrorKind::InvalidStatusLine,
        })?;

        let mut parts = status_line.split_whitespace();
        let version = parts.next().unwrap_or("");
        if !version.starts_with("RTSP/") {
            return Err(RtspError::Protocol {
                kind: ProtocolErrorKind::InvalidStatusLine,
            });
        }

        let status: u16 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(RtspError::Protocol {
                kind: ProtocolErrorKind::InvalidStatusLine,
            })?;

        let reason = parts.collect::<Vec<_>>().join(" ");

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }

            let colon_pos = line.find(':').ok_or(RtspError::Protocol {
                kind: ProtocolErrorKind::InvalidHeader,
            })?;

            let name = line[..colon_pos].trim().to_string();
            let value = line[colon_pos + 1..].trim().to_string();
            headers.push((name, value));
        }

        Ok(RtspResponse {
            status,
            reason,
            headers,
            body: Vec::new(),
        })
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Declared body length, zero when the header is absent or unparsable.
    pub fn content_length(&self) -> usize {
        self.get_header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// The session identifier from the `Session` header, with the
    /// `;timeout=...` suffix stripped (RFC 2326 §12.37).
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim())
    }
}
