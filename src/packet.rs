//! The unit of data delivered to subscribers.

use std::time::Duration;

use bytes::Bytes;

/// Classification of a [`Packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// A self-contained H.264 keyframe. The payload starts with the
    /// current codec parameters:
    /// `00 00 00 01 <SPS> 00 00 00 01 <PPS> 00 00 00 01 <IDR NAL>`.
    VideoKey,
    /// A non-key video NAL unit (raw NAL bytes, no framing prefix).
    VideoDelta,
    /// An ONVIF metadata document, passed through unchanged.
    Metadata,
    /// An audio payload (AAC frame or PCM samples), passed through.
    Audio,
    /// Terminal marker: the upstream session ended. Every read after the
    /// first EOF returns EOF again.
    Eof,
}

/// A decoded packet as observed by a subscriber.
///
/// Packets are produced once by the session's network reader and shared
/// read-only with every subscriber; the payload is an immutable [`Bytes`]
/// buffer, so holding on to a packet is cheap and safe regardless of how
/// far the producer has advanced.
#[derive(Debug, Clone)]
pub struct Packet {
    kind: PacketKind,
    /// Decode timestamp as a duration since the stream origin.
    pts: Duration,
    /// Producer sequence number: monotonic and gap-free per session.
    seq: u64,
    data: Bytes,
}

impl Packet {
    pub(crate) fn new(kind: PacketKind, pts: Duration, seq: u64, data: Bytes) -> Self {
        Self {
            kind,
            pts,
            seq,
            data,
        }
    }

    /// Terminal packet written by the producer on shutdown or upstream EOF.
    pub(crate) fn eof(seq: u64) -> Self {
        Self {
            kind: PacketKind::Eof,
            pts: Duration::ZERO,
            seq,
            data: Bytes::new(),
        }
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Whether this is a keyframe video packet.
    pub fn is_key_frame(&self) -> bool {
        self.kind == PacketKind::VideoKey
    }

    /// Whether this is an ONVIF metadata packet.
    pub fn is_metadata(&self) -> bool {
        self.kind == PacketKind::Metadata
    }

    /// Whether this is the terminal EOF marker.
    pub fn is_eof(&self) -> bool {
        self.kind == PacketKind::Eof
    }

    /// Decode timestamp relative to the stream origin.
    pub fn pts(&self) -> Duration {
        self.pts
    }

    /// Producer sequence number. Strictly increasing across the packets
    /// any one subscriber observes.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Packet payload. See [`PacketKind`] for the framing per kind.
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}
