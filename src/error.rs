//! Error types for the shared RTSP client.

use std::fmt;

/// Errors that can occur while opening or driving an upstream RTSP session.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Transport**: [`Dial`](Self::Dial), [`Io`](Self::Io) — socket/network
///   failures while connecting or during the handshake.
/// - **URL**: [`UnsupportedScheme`](Self::UnsupportedScheme),
///   [`InvalidUrl`](Self::InvalidUrl).
/// - **Protocol**: [`Protocol`](Self::Protocol) — malformed responses, bad
///   status codes, SDP problems.
/// - **Auth**: [`Auth`](Self::Auth) — a 401 challenge that cannot be
///   answered.
/// - **Config**: [`InvalidConfig`](Self::InvalidConfig).
///
/// All of these surface synchronously from
/// [`Provider::open_stream`](crate::Provider::open_stream). Once a stream is
/// playing, transport failures no longer surface as errors — they manifest
/// as a terminal EOF packet on every subscriber.
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TCP connect failure (refused, DNS, timeout).
    #[error("failed to connect to {url}: {source}")]
    Dial {
        url: String,
        #[source]
        source: std::io::Error,
    },

    /// The URL scheme is not `rtsp`.
    #[error("unsupported URL scheme in {0:?} (expected rtsp://)")]
    UnsupportedScheme(String),

    /// The URL could not be parsed at all.
    #[error("invalid RTSP URL {0:?}")]
    InvalidUrl(String),

    /// The server violated RTSP 1.0 (RFC 2326) in a way the handshake
    /// cannot recover from.
    #[error("RTSP protocol error: {kind}")]
    Protocol { kind: ProtocolErrorKind },

    /// A 401 challenge that cannot be answered with the available
    /// credentials.
    #[error("RTSP authentication failed: {kind}")]
    Auth { kind: AuthErrorKind },

    /// Rejected session configuration (e.g. `lag_threshold >= ring_capacity`).
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
}

/// Specific kind of unrecoverable protocol failure.
#[derive(Debug)]
pub enum ProtocolErrorKind {
    /// Response status line did not have the `RTSP/1.0 <code> <reason>` shape.
    InvalidStatusLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// A request was answered with a non-200 status (after the single
    /// auth retry, where applicable).
    BadStatus { method: &'static str, status: u16 },
    /// The DESCRIBE body was shorter or longer than its `Content-Length`.
    BodyLengthMismatch { declared: usize, received: usize },
    /// The DESCRIBE body was not parseable as SDP.
    SdpUnparsable,
    /// The SDP contained no media sections to set up.
    NoMediaSections,
    /// The interleaved data could not be decoded as RTP for too many
    /// consecutive packets.
    RtpUnusable,
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidStatusLine => write!(f, "invalid status line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::BadStatus { method, status } => {
                write!(f, "{method} failed with status {status}")
            }
            Self::BodyLengthMismatch { declared, received } => write!(
                f,
                "body length mismatch (Content-Length {declared}, received {received})"
            ),
            Self::SdpUnparsable => write!(f, "unparsable SDP body"),
            Self::NoMediaSections => write!(f, "SDP contains no media sections"),
            Self::RtpUnusable => write!(f, "undecodable RTP stream"),
        }
    }
}

/// Specific kind of authentication failure on a 401 response.
#[derive(Debug)]
pub enum AuthErrorKind {
    /// The URL carries no userinfo to answer the challenge with.
    NoCredentials,
    /// The `WWW-Authenticate` header lacked a usable `realm`.
    NoRealm,
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCredentials => write!(f, "no credentials in URL"),
            Self::NoRealm => write!(f, "challenge has no realm"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
