//! Subscriber handle over a shared session.

use std::sync::Arc;

use crate::codec::CodecData;
use crate::packet::Packet;
use crate::provider::Provider;
use crate::session::SharedSession;

/// One subscription to an upstream session's packet stream.
///
/// Each stream advances through the shared ring at its own pace:
///
/// - the first video packet it returns is always a keyframe, carrying the
///   codec parameters inline;
/// - a stream that stalls for more than the session's lag threshold is
///   skipped forward to the newest region and realigned to a keyframe;
/// - once [`read`](Self::read) returns an EOF packet, every further read
///   returns EOF.
///
/// Dropping the stream releases the subscription; [`close`](Self::close)
/// does so explicitly and is idempotent. The last subscriber to leave
/// tears the upstream session down.
#[derive(Debug)]
pub struct Stream {
    provider: Provider,
    shared: Arc<SharedSession>,
    /// Ring cursor; -1 until the first read positions it.
    cursor: i64,
    /// Sticky terminal packet.
    eof: Option<Arc<Packet>>,
    closed: bool,
    key: String,
}

impl Stream {
    pub(crate) fn new(provider: Provider, shared: Arc<SharedSession>) -> Self {
        let key = shared.subscriber_key();
        tracing::debug!(subscriber = %key, "subscriber attached");
        Stream {
            provider,
            shared,
            cursor: -1,
            eof: None,
            closed: false,
            key,
        }
    }

    /// Blocking read of the next packet.
    pub fn read(&mut self) -> Arc<Packet> {
        if let Some(eof) = &self.eof {
            return eof.clone();
        }
        let packet = self.shared.ring.read(&mut self.cursor);
        if packet.is_eof() {
            tracing::debug!(subscriber = %self.key, "stream reached EOF");
            self.eof = Some(packet.clone());
        }
        packet
    }

    /// Codec description of each stream the session set up, in SDP order.
    pub fn codecs(&self) -> &[CodecData] {
        &self.shared.codecs
    }

    /// Identity string (`host[n]`) for correlating log statements.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Hostname of the upstream camera.
    pub fn host(&self) -> &str {
        &self.shared.host
    }

    /// Release the subscription. Idempotent; the last close for a session
    /// waits for the producer to finish shutting down.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        tracing::debug!(subscriber = %self.key, "subscriber detached");
        self.provider.release(&self.shared);
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close();
    }
}
