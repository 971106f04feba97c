use std::fmt::Write as _;

/// An outgoing RTSP request (RFC 2326 §6).
///
/// Uses a builder pattern — chain [`add_header`](Self::add_header), then
/// call [`serialize`](Self::serialize). The session layer owns the headers
/// every request must carry (`CSeq`, `Session`, `Authorization`) and adds
/// them before serialization; this type only knows the wire shape.
///
/// ```text
/// Method SP Request-URI SP RTSP/1.0 CRLF
/// *(Header: Value CRLF)
/// CRLF
/// ```
#[must_use]
#[derive(Debug)]
pub struct RtspRequest {
    /// RTSP method (DESCRIBE, SETUP, PLAY, OPTIONS, TEARDOWN).
    pub method: &'static str,
    /// Request-URI, userinfo already stripped.
    pub uri: String,
    /// Headers as ordered (name, value) pairs.
    pub headers: Vec<(String, String)>,
}

impl RtspRequest {
    pub fn new(method: &'static str, uri: &str) -> Self {
        RtspRequest {
            method,
            uri: uri.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Serialize to the RTSP text wire format. Lines end with `\r\n` and
    /// the header block terminates with an empty line.
    pub fn serialize(&self) -> String {
        let mut out = format!("{} {} RTSP/1.0\r\n", self.method, self.uri);
        for (name, value) in &self.headers {
            let _ = write!(out, "{}: {}\r\n", name, value);
        }
        out.push_str("\r\n");
        out
    }
}
