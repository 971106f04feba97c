//! RTSP protocol implementation (RFC 2326), client side.
//!
//! This module handles everything that travels over the RTSP control
//! channel — building requests, parsing responses, answering auth
//! challenges, parsing SDP bodies, and splitting the interleaved byte
//! stream back into text responses and binary blocks.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! DESCRIBE rtsp://camera/stream RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! ## Methods issued by this client
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | DESCRIBE | §10.2 | Retrieve the SDP session description |
//! | SETUP | §10.4 | Negotiate interleaved TCP transport per media |
//! | PLAY | §10.5 | Start media delivery |
//! | OPTIONS | §10.1 | Keep-alive |
//! | TEARDOWN | §10.7 | Destroy the upstream session (best effort) |
//!
//! ## Interleaved framing (RFC 2326 §10.12)
//!
//! Once PLAY succeeds, the server multiplexes binary `$`-framed RTP/RTCP
//! blocks with text responses on the same TCP stream. [`framer`] recovers
//! the frame boundaries, including after desynchronization.

pub mod auth;
pub mod framer;
pub mod request;
pub mod response;
pub mod sdp;

pub use framer::{BlockValidator, Frame, Framer};
pub use request::RtspRequest;
pub use response::RtspResponse;
