//! Upstream RTSP session: handshake, producer loop, and lifetime.
//!
//! One session exists per upstream URL. It owns the TCP connection and is
//! split in two:
//!
//! - [`Session`] — the producer-side state (framer, CSeq counter, auth
//!   generator, media streams, codec prefix). Created synchronously by the
//!   handshake, then moved into the producer thread, which is the sole
//!   reader and writer of the socket for the rest of the session's life.
//! - [`SharedSession`] — the handle subscribers and the registry share:
//!   the ring buffer, codec descriptions, the subscriber refcount, and
//!   the shutdown signal.
//!
//! ## Handshake state machine (RFC 2326)
//!
//! ```text
//! Idle ──DESCRIBE ok──► Described ──SETUP ok (each media)──► SetUp
//!                                                              │
//!                                                           PLAY ok
//!                                                              ▼
//!          Playing ◄──all streams have codec data── WaitingCodec
//! ```
//!
//! PLAY lands directly in `Playing` when the SDP already provided codec
//! data for every stream; otherwise the codec probe drains packets in
//! `WaitingCodec` first. A failure at any stage surfaces as an error
//! from [`Session::connect`] — there is no terminal stage. Once playing,
//! the session ends through the producer loop instead: an exit reason
//! (shutdown request, upstream EOF, transport error, undecodable RTP)
//! always writes the terminal EOF packet, and a requested shutdown also
//! sends the best-effort TEARDOWN.
//!
//! ## Producer loop
//!
//! The producer converts every interleaved RTP block into zero or more
//! ring packets: RTCP channels are dropped, H.264 NAL units become
//! `video_key`/`video_delta` packets, and keyframes are prefixed with the
//! current codec parameters (`00000001 SPS 00000001 PPS`) so every
//! subscriber's first video packet is self-contained. On socket EOF, a
//! transport error, or a shutdown request it writes one terminal EOF
//! packet and removes the session from the registry.

use std::io::{BufReader, Write as _};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use url::Url;

use crate::codec::CodecData;
use crate::config::SessionConfig;
use crate::error::{ProtocolErrorKind, Result, RtspError};
use crate::media::{MediaEvent, MediaStream};
use crate::packet::PacketKind;
use crate::protocol::auth::AuthContext;
use crate::protocol::sdp;
use crate::protocol::{BlockValidator, Frame, Framer, RtspRequest, RtspResponse};
use crate::provider::ProviderInner;
use crate::ring::RingBuffer;

const DEFAULT_RTSP_PORT: u16 = 554;
const READ_BUFFER_SIZE: usize = 2048;
const NAL_START_CODE: [u8; 4] = [0, 0, 0, 1];
const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;

/// Handshake progress (RFC 2326 §A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Described,
    SetUp,
    WaitingCodec,
    Playing,
}

/// Why the producer loop exited.
#[derive(Debug)]
enum ExitReason {
    /// The registry asked the session to stop (last subscriber left).
    Requested,
    /// The upstream closed the connection.
    UpstreamEof,
    /// A socket or protocol failure.
    TransportError,
    /// Too many consecutive undecodable RTP packets.
    RtpUnusable,
}

/// State shared between the registry, subscribers, and the producer.
#[derive(Debug)]
pub(crate) struct SharedSession {
    /// Registry key — the URL exactly as passed to `open_stream`.
    pub(crate) url_key: String,
    /// Hostname, for logs (the URL may carry credentials).
    pub(crate) host: String,
    pub(crate) ring: RingBuffer,
    /// Codec description per set-up stream, frozen after the handshake.
    pub(crate) codecs: Vec<CodecData>,
    /// Live subscriber count. The session shuts down when it reaches zero.
    pub(crate) refcount: AtomicI64,
    /// Set by the registry to ask the producer to exit.
    pub(crate) shutdown: AtomicBool,
    /// The session socket; kept here so the registry can unblock the
    /// producer's read with a half-close.
    pub(crate) socket: TcpStream,
    pub(crate) producer: Mutex<Option<JoinHandle<()>>>,
    next_subscriber: AtomicU32,
}

impl SharedSession {
    /// Claim a subscriber slot unless the session is already shutting
    /// down (refcount at zero).
    pub(crate) fn try_subscribe(&self) -> bool {
        let mut current = self.refcount.load(Ordering::SeqCst);
        while current > 0 {
            match self.refcount.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Identity string for a new subscriber's log statements.
    pub(crate) fn subscriber_key(&self) -> String {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        format!("{}[{}]", self.host, id)
    }
}

/// Validates candidate interleaved block headers against the set-up
/// streams: channel within range, odd (RTCP) channels unconditionally,
/// even channels only when the payload starts like RTP for that stream.
struct StreamValidator<'a>(&'a [MediaStream]);

impl BlockValidator for StreamValidator<'_> {
    fn validate(&self, channel: u8, declared_len: usize, prefix: &[u8]) -> bool {
        if (channel / 2) as usize >= self.0.len() {
            return false;
        }
        if channel % 2 == 1 {
            return true;
        }
        declared_len >= 8
            && prefix.len() >= 2
            && prefix[0] & 0xC0 == 0x80
            && prefix[1] & 0x7F == self.0[(channel / 2) as usize].payload_type()
    }
}

/// Producer-side session state. Only ever touched by the thread that
/// created it (handshake) and then by the producer thread it moves into.
pub(crate) struct Session {
    config: SessionConfig,
    /// Session URL with userinfo stripped; used as request URI and as the
    /// Digest `uri` parameter.
    request_url: String,
    host: String,
    username: Option<String>,
    password: Option<String>,

    writer: TcpStream,
    framer: Framer<BufReader<TcpStream>>,

    cseq: u32,
    session_id: Option<String>,
    auth: Option<AuthContext>,
    stage: Stage,
    last_keepalive: Instant,

    streams: Vec<MediaStream>,
    /// `00000001 <SPS> 00000001 <PPS>`, prepended to every keyframe.
    codec_prefix: Vec<u8>,
}

impl Session {
    /// Dial the camera and run the handshake through PLAY, blocking until
    /// every set-up stream has codec data. Returns the producer state and
    /// the shared handle (with a refcount of 1 for the first subscriber).
    pub(crate) fn connect(url_str: &str, config: &SessionConfig) -> Result<(Session, SharedSession)> {
        let parsed =
            Url::parse(url_str).map_err(|_| RtspError::InvalidUrl(url_str.to_string()))?;
        if parsed.scheme() != "rtsp" {
            return Err(RtspError::UnsupportedScheme(url_str.to_string()));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| RtspError::InvalidUrl(url_str.to_string()))?
            .to_string();
        let port = parsed.port().unwrap_or(DEFAULT_RTSP_PORT);

        let socket = dial(&host, port, config, url_str)?;

        let username = match parsed.username() {
            "" => None,
            user => Some(user.to_string()),
        };
        let password = parsed.password().map(str::to_string);

        let mut stripped = parsed.clone();
        let _ = stripped.set_username("");
        let _ = stripped.set_password(None);
        let request_url = stripped.to_string();

        let reader = socket.try_clone()?;
        let writer = socket.try_clone()?;

        let mut session = Session {
            config: config.clone(),
            request_url,
            host: host.clone(),
            username,
            password,
            writer,
            framer: Framer::new(BufReader::with_capacity(READ_BUFFER_SIZE, reader)),
            cseq: 0,
            session_id: None,
            auth: None,
            stage: Stage::Idle,
            last_keepalive: Instant::now(),
            streams: Vec::new(),
            codec_prefix: Vec::new(),
        };

        session.describe()?;
        session.setup_all()?;
        session.play()?;
        session.probe()?;
        session.rebuild_codec_prefix();

        let codecs = session
            .streams
            .iter()
            .filter_map(|s| s.codec().cloned())
            .collect();

        let shared = SharedSession {
            url_key: url_str.to_string(),
            host,
            ring: RingBuffer::new(config.ring_capacity, config.lag_threshold),
            codecs,
            refcount: AtomicI64::new(1),
            shutdown: AtomicBool::new(false),
            socket,
            producer: Mutex::new(None),
            next_subscriber: AtomicU32::new(0),
        };

        Ok((session, shared))
    }

    /// Producer thread entry point. Consumes the session.
    pub(crate) fn run(mut self, shared: Arc<SharedSession>, provider: Weak<ProviderInner>) {
        let reason = self.produce(&shared);

        if matches!(reason, ExitReason::Requested) {
            // Best effort: the read half may already be shut down, but the
            // write half is still ours.
            if let Err(e) = self.teardown() {
                tracing::debug!(host = %self.host, error = %e, "TEARDOWN not delivered");
            }
        }

        shared.ring.write_eof();

        if let Some(provider) = provider.upgrade() {
            provider.forget_session(&shared);
        }
        let _ = shared.socket.shutdown(Shutdown::Both);

        tracing::debug!(host = %self.host, reason = ?reason, "session closed");
    }

    fn produce(&mut self, shared: &SharedSession) -> ExitReason {
        loop {
            if shared.shutdown.load(Ordering::SeqCst) {
                return ExitReason::Requested;
            }
            if let Err(e) = self.maybe_keepalive() {
                tracing::warn!(host = %self.host, error = %e, "keep-alive write failed");
                return ExitReason::TransportError;
            }

            let frame = {
                let Session {
                    framer, streams, ..
                } = self;
                framer.next_frame(&StreamValidator(streams))
            };

            match frame {
                Err(e) => {
                    if shared.shutdown.load(Ordering::SeqCst) {
                        return ExitReason::Requested;
                    }
                    return match e {
                        RtspError::Io(ref io)
                            if io.kind() == std::io::ErrorKind::UnexpectedEof =>
                        {
                            tracing::debug!(host = %self.host, "upstream closed the connection");
                            ExitReason::UpstreamEof
                        }
                        e => {
                            tracing::warn!(host = %self.host, error = %e, "session read failed");
                            ExitReason::TransportError
                        }
                    };
                }
                Ok(Frame::Response(response)) => {
                    // Spontaneous response, e.g. to a keep-alive OPTIONS.
                    if let Err(e) = self.note_response(&response) {
                        tracing::warn!(host = %self.host, error = %e, "mid-stream response not usable");
                    }
                }
                Ok(Frame::Interleaved { channel, payload }) => {
                    if channel % 2 == 1 {
                        tracing::debug!(channel, len = payload.len(), "RTCP block dropped");
                        continue;
                    }
                    let idx = (channel / 2) as usize;
                    let events = match self.streams.get_mut(idx) {
                        Some(stream) => match stream.handle_rtp(&payload) {
                            Ok(events) => events,
                            Err(e) => {
                                tracing::error!(host = %self.host, stream = idx, error = %e, "giving up on stream");
                                return ExitReason::RtpUnusable;
                            }
                        },
                        None => {
                            tracing::warn!(channel, "block for unknown stream");
                            continue;
                        }
                    };

                    if self.streams[idx].take_parameters_changed() {
                        self.rebuild_codec_prefix();
                    }
                    for event in events {
                        self.emit(idx, event, &shared.ring);
                    }
                }
            }
        }
    }

    /// Classify one media event and write it into the ring.
    fn emit(&mut self, idx: usize, event: MediaEvent, ring: &RingBuffer) {
        match event {
            MediaEvent::VideoNal(unit) => {
                // Parameter sets feed the codec prefix, never the ring.
                if unit.nal_type == NAL_TYPE_SPS || unit.nal_type == NAL_TYPE_PPS {
                    return;
                }
                let Some(pts) = self.streams[idx].pts_for(unit.timestamp) else {
                    return;
                };
                let nal = &unit.avcc[4..];
                if unit.is_keyframe {
                    let mut data =
                        BytesMut::with_capacity(self.codec_prefix.len() + 4 + nal.len());
                    data.put_slice(&self.codec_prefix);
                    data.put_slice(&NAL_START_CODE);
                    data.put_slice(nal);
                    ring.write(PacketKind::VideoKey, pts, data.freeze());
                } else {
                    ring.write(PacketKind::VideoDelta, pts, unit.avcc.slice(4..));
                }
            }
            MediaEvent::Audio { data, timestamp } => {
                let Some(pts) = self.streams[idx].pts_for(timestamp) else {
                    return;
                };
                ring.write(PacketKind::Audio, pts, data);
            }
            MediaEvent::Metadata { data, timestamp } => {
                let Some(pts) = self.streams[idx].pts_for(timestamp) else {
                    return;
                };
                ring.write(PacketKind::Metadata, pts, data);
            }
        }
    }

    // --- handshake ---

    /// DESCRIBE, retried once on a non-200 status (a 401 installs the auth
    /// generator during response handling, so the retry carries it).
    fn describe(&mut self) -> Result<()> {
        let mut last_status = 0;
        for attempt in 0..2 {
            let request = RtspRequest::new("DESCRIBE", &self.request_url)
                .add_header("Accept", "application/sdp");
            self.write_request(request)?;
            let response = self.read_response()?;

            if response.status == 200 {
                return self.apply_sdp(&response);
            }
            tracing::debug!(host = %self.host, status = response.status, attempt, "DESCRIBE not accepted");
            last_status = response.status;
        }
        Err(RtspError::Protocol {
            kind: ProtocolErrorKind::BadStatus {
                method: "DESCRIBE",
                status: last_status,
            },
        })
    }

    fn apply_sdp(&mut self, response: &RtspResponse) -> Result<()> {
        let declared = response.content_length();
        if declared == 0 || declared != response.body.len() {
            return Err(RtspError::Protocol {
                kind: ProtocolErrorKind::BodyLengthMismatch {
                    declared,
                    received: response.body.len(),
                },
            });
        }

        let body = String::from_utf8_lossy(&response.body);
        let medias = sdp::parse_sdp(&body);
        if medias.is_empty() {
            return Err(RtspError::Protocol {
                kind: ProtocolErrorKind::NoMediaSections,
            });
        }

        self.streams = medias
            .iter()
            .enumerate()
            .map(|(i, media)| MediaStream::from_sdp(i, media))
            .collect();
        self.stage = Stage::Described;
        tracing::debug!(host = %self.host, streams = self.streams.len(), "DESCRIBE complete");
        Ok(())
    }

    /// SETUP each media with interleaved TCP transport: stream `i` gets
    /// RTP on channel `2i` and RTCP on `2i + 1`.
    fn setup_all(&mut self) -> Result<()> {
        for i in 0..self.streams.len() {
            let uri = self.transport_uri(self.streams[i].control());
            let transport = format!("RTP/AVP/TCP;unicast;interleaved={}-{}", 2 * i, 2 * i + 1);
            let request = RtspRequest::new("SETUP", &uri).add_header("Transport", &transport);
            let response = self.roundtrip(request)?;
            if response.status != 200 {
                return Err(RtspError::Protocol {
                    kind: ProtocolErrorKind::BadStatus {
                        method: "SETUP",
                        status: response.status,
                    },
                });
            }
        }
        self.stage = Stage::SetUp;
        Ok(())
    }

    /// Absolute control attributes are used verbatim; tokens are joined
    /// onto the session URL.
    fn transport_uri(&self, control: &str) -> String {
        if control.starts_with("rtsp://") {
            control.to_string()
        } else if control.is_empty() {
            self.request_url.clone()
        } else {
            format!("{}/{}", self.request_url, control)
        }
    }

    fn play(&mut self) -> Result<()> {
        let request = RtspRequest::new("PLAY", &self.request_url);
        let response = self.roundtrip(request)?;
        if response.status != 200 {
            return Err(RtspError::Protocol {
                kind: ProtocolErrorKind::BadStatus {
                    method: "PLAY",
                    status: response.status,
                },
            });
        }
        self.stage = if self.all_codec_ready() {
            Stage::Playing
        } else {
            Stage::WaitingCodec
        };
        tracing::debug!(host = %self.host, stage = ?self.stage, "PLAY accepted");
        Ok(())
    }

    /// Read and discard packets until every stream has codec data —
    /// cameras that omit `sprop-parameter-sets` send SPS/PPS in-band.
    fn probe(&mut self) -> Result<()> {
        while !self.all_codec_ready() {
            let frame = {
                let Session {
                    framer, streams, ..
                } = self;
                framer.next_frame(&StreamValidator(streams))?
            };
            match frame {
                Frame::Response(response) => self.note_response(&response)?,
                Frame::Interleaved { channel, payload } => {
                    if channel % 2 == 1 {
                        continue;
                    }
                    if let Some(stream) = self.streams.get_mut((channel / 2) as usize) {
                        stream.handle_rtp(&payload).map_err(|_| RtspError::Protocol {
                            kind: ProtocolErrorKind::RtpUnusable,
                        })?;
                    }
                }
            }
        }
        self.stage = Stage::Playing;
        Ok(())
    }

    fn all_codec_ready(&self) -> bool {
        self.streams.iter().all(|s| s.codec_ready())
    }

    // --- request plumbing ---

    /// Serialize and send one request with the session-wide headers:
    /// `CSeq` (monotonic), `Session` once assigned, `Authorization` once a
    /// challenge was answered, plus configured extras.
    fn write_request(&mut self, request: RtspRequest) -> Result<()> {
        self.cseq += 1;
        let method = request.method;

        let mut request = request.add_header("CSeq", &self.cseq.to_string());
        if let Some(auth) = &self.auth {
            request =
                request.add_header("Authorization", &auth.authorization(method, &self.request_url));
        }
        if let Some(session_id) = &self.session_id {
            request = request.add_header("Session", session_id);
        }
        if let Some(user_agent) = &self.config.user_agent {
            request = request.add_header("User-Agent", user_agent);
        }
        for line in &self.config.extra_headers {
            if let Some((name, value)) = line.split_once(':') {
                request = request.add_header(name.trim(), value.trim());
            }
        }

        self.writer.write_all(request.serialize().as_bytes())?;
        Ok(())
    }

    /// Read frames until a text response arrives; interleaved blocks that
    /// beat the response are skipped.
    fn read_response(&mut self) -> Result<RtspResponse> {
        loop {
            let frame = {
                let Session {
                    framer, streams, ..
                } = self;
                framer.next_frame(&StreamValidator(streams))?
            };
            match frame {
                Frame::Response(response) => {
                    self.note_response(&response)?;
                    return Ok(response);
                }
                Frame::Interleaved { channel, .. } => {
                    tracing::trace!(channel, "interleaved block while awaiting response");
                }
            }
        }
    }

    /// One request/response exchange; a 401 answer is retried once with
    /// the freshly installed auth generator.
    fn roundtrip(&mut self, request: RtspRequest) -> Result<RtspResponse> {
        let method = request.method;
        let uri = request.uri.clone();
        let headers = request.headers.clone();

        self.write_request(request)?;
        let response = self.read_response()?;
        if response.status != 401 {
            return Ok(response);
        }

        tracing::debug!(host = %self.host, method, "retrying with Authorization");
        let mut retry = RtspRequest::new(method, &uri);
        retry.headers = headers;
        self.write_request(retry)?;
        self.read_response()
    }

    /// Update session state from any response: capture the server-assigned
    /// session id on first appearance, and answer a 401 challenge.
    fn note_response(&mut self, response: &RtspResponse) -> Result<()> {
        if self.session_id.is_none() {
            if let Some(id) = response.session_id() {
                self.session_id = Some(id.to_string());
            }
        }
        if response.status == 401 {
            let challenge = response.get_header("WWW-Authenticate").unwrap_or("");
            self.auth = Some(AuthContext::new(
                challenge,
                self.username.as_deref(),
                self.password.as_deref(),
            )?);
        }
        Ok(())
    }

    /// Send OPTIONS when the configured keep-alive interval has elapsed.
    fn maybe_keepalive(&mut self) -> Result<()> {
        let interval = self.config.keepalive_interval;
        if interval.is_zero() || self.last_keepalive.elapsed() < interval {
            return Ok(());
        }
        self.last_keepalive = Instant::now();
        tracing::trace!(host = %self.host, "OPTIONS keep-alive");
        self.write_request(RtspRequest::new("OPTIONS", &self.request_url))
    }

    /// Best-effort TEARDOWN; the socket is closed regardless.
    fn teardown(&mut self) -> Result<()> {
        self.write_request(RtspRequest::new("TEARDOWN", &self.request_url))
    }

    /// Recompute `00000001 SPS 00000001 PPS` from the first video stream's
    /// current parameter sets.
    fn rebuild_codec_prefix(&mut self) {
        self.codec_prefix.clear();
        for stream in &self.streams {
            if let Some((sps, pps)) = stream.h264_parameters() {
                self.codec_prefix.extend_from_slice(&NAL_START_CODE);
                self.codec_prefix.extend_from_slice(sps);
                self.codec_prefix.extend_from_slice(&NAL_START_CODE);
                self.codec_prefix.extend_from_slice(pps);
                return;
            }
        }
    }
}

fn dial(host: &str, port: u16, config: &SessionConfig, url_str: &str) -> Result<TcpStream> {
    let addr_str = format!("{host}:{port}");
    let result = if config.dial_timeout.is_zero() {
        TcpStream::connect(&addr_str)
    } else {
        addr_str.to_socket_addrs().and_then(|mut addrs| {
            addrs.next().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no addresses resolved")
            })
        }).and_then(|addr| TcpStream::connect_timeout(&addr, config.dial_timeout))
    };

    result.map_err(|source| RtspError::Dial {
        url: url_str.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sdp::parse_sdp;

    fn streams() -> Vec<MediaStream> {
        let sdp = "m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=control:trackID=1\r\n";
        parse_sdp(sdp)
            .iter()
            .enumerate()
            .map(|(i, m)| MediaStream::from_sdp(i, m))
            .collect()
    }

    #[test]
    fn validator_rejects_out_of_range_channel() {
        let streams = streams();
        let v = StreamValidator(&streams);
        assert!(!v.validate(2, 100, &[0x80, 96]));
        assert!(!v.validate(3, 100, &[0x80, 96]));
    }

    #[test]
    fn validator_accepts_odd_channel_blindly() {
        let streams = streams();
        let v = StreamValidator(&streams);
        assert!(v.validate(1, 4, b"RTCP"));
    }

    #[test]
    fn validator_checks_rtp_shape_on_even_channel() {
        let streams = streams();
        let v = StreamValidator(&streams);
        assert!(v.validate(0, 12, &[0x80, 96, 0, 0, 0, 0, 0, 0]));
        // marker bit set is fine; payload type must still match
        assert!(v.validate(0, 12, &[0x80, 0x80 | 96, 0, 0, 0, 0, 0, 0]));
        assert!(!v.validate(0, 12, &[0x80, 97, 0, 0, 0, 0, 0, 0]), "wrong payload type");
        assert!(!v.validate(0, 12, &[0x40, 96, 0, 0, 0, 0, 0, 0]), "wrong RTP version");
        assert!(!v.validate(0, 7, &[0x80, 96, 0, 0, 0, 0, 0]), "too short for RTP");
    }

    #[test]
    fn no_streams_rejects_everything_even_rtcp() {
        let streams: Vec<MediaStream> = Vec::new();
        let v = StreamValidator(&streams);
        assert!(!v.validate(0, 12, &[0x80, 96, 0, 0, 0, 0, 0, 0]));
        assert!(!v.validate(1, 5, b"RTSP/"));
    }
}
