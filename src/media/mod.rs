//! Per-stream media handling: RTP validation, depacketization, and
//! timestamp conversion.
//!
//! One [`MediaStream`] exists per SDP media section. It owns the codec
//! description, the depacketizer state, and the RTP-timestamp-to-duration
//! mapping, including the anomaly checks that protect subscribers from
//! replayed or corrupt timestamps:
//!
//! - the first accepted packet's RTP timestamp becomes the stream origin
//!   and is never reset for the life of the session;
//! - a packet whose converted time decreases, or jumps more than 30
//!   minutes ahead of the previous packet, is dropped with a warning.
//!
//! Payload handling per codec:
//!
//! | Codec | Handling |
//! |-------|----------|
//! | H.264 | [`h264::H264Depacketizer`] (FU-A, STAP-A, SPS/PPS tracking) |
//! | AAC | 4-byte AU header stripped, frame passed through |
//! | PCM µ-law / A-law | payload passed through |
//! | ONVIF metadata | payload passed through unchanged |

pub mod h264;
pub mod rtp;

use std::time::Duration;

use bytes::Bytes;

use crate::codec::CodecData;
use crate::protocol::sdp::MediaDescription;
use h264::H264Depacketizer;

/// Default RTP clock rate for video streams lacking an `a=rtpmap` rate.
const DEFAULT_VIDEO_CLOCK_RATE: u32 = 90_000;
/// Default RTP clock rate for everything else (RFC 5391).
const DEFAULT_CLOCK_RATE: u32 = 8_000;

/// Maximum forward jump between consecutive packets of one stream before
/// the packet is treated as a timing anomaly and dropped.
const MAX_PTS_JUMP: Duration = Duration::from_secs(30 * 60);

/// Consecutive undecodable RTP packets tolerated before the stream is
/// considered unusable and the session torn down.
const MAX_CONSECUTIVE_RTP_ERRORS: u32 = 50;

/// A run of consecutive RTP decode failures exceeded
/// [`MAX_CONSECUTIVE_RTP_ERRORS`].
#[derive(Debug, thiserror::Error)]
#[error("too many consecutive undecodable RTP packets")]
pub struct RtpErrorOverflow;

/// Codec-specific payload handling for one stream.
#[derive(Debug)]
enum PayloadHandler {
    H264(H264Depacketizer),
    Aac,
    Pcm,
    Metadata,
    Unsupported,
}

/// A decoded media event produced from one RTP packet.
#[derive(Debug)]
pub enum MediaEvent {
    /// One H.264 NAL unit in AVCC framing.
    VideoNal(h264::NalUnit),
    /// An audio frame (AAC with AU header stripped, or raw PCM).
    Audio { data: Bytes, timestamp: u32 },
    /// An ONVIF metadata document.
    Metadata { data: Bytes, timestamp: u32 },
}

/// State for one SDP media section of an upstream session.
#[derive(Debug)]
pub struct MediaStream {
    index: usize,
    payload_type: u8,
    clock_rate: u32,
    control: String,
    codec: Option<CodecData>,
    handler: PayloadHandler,

    /// RTP timestamp of the first accepted packet; the pts origin.
    origin: Option<u32>,
    /// Converted time of the last accepted packet.
    last_pts: Duration,
    error_run: u32,
}

impl MediaStream {
    /// Build stream state from a parsed SDP media section, seeding the
    /// H.264 depacketizer with `sprop-parameter-sets` when present.
    pub fn from_sdp(index: usize, media: &MediaDescription) -> Self {
        let is_video = media.media_kind == "video";
        let clock_rate = if media.clock_rate > 0 {
            media.clock_rate
        } else if is_video {
            DEFAULT_VIDEO_CLOCK_RATE
        } else {
            DEFAULT_CLOCK_RATE
        };

        let (handler, codec) = Self::classify(media);

        let mut stream = MediaStream {
            index,
            payload_type: media.payload_type,
            clock_rate,
            control: media.control.clone(),
            codec,
            handler,
            origin: None,
            last_pts: Duration::ZERO,
            error_run: 0,
        };

        if let PayloadHandler::H264(depacketizer) = &mut stream.handler {
            for nal in &media.sprop_parameter_sets {
                // Seeding only updates SPS/PPS state; emitted units are
                // irrelevant here.
                let _ = depacketizer.push(0, nal);
            }
        }
        stream.refresh_codec();

        stream
    }

    fn classify(media: &MediaDescription) -> (PayloadHandler, Option<CodecData>) {
        if media.encoding.eq_ignore_ascii_case("H264") {
            return (PayloadHandler::H264(H264Depacketizer::new()), None);
        }
        if media.encoding.eq_ignore_ascii_case("MPEG4-GENERIC") {
            return match &media.config {
                Some(config) => (
                    PayloadHandler::Aac,
                    Some(CodecData::Aac {
                        config: Bytes::copy_from_slice(config),
                    }),
                ),
                None => {
                    tracing::warn!("AAC media without fmtp config, treating as unsupported");
                    (PayloadHandler::Unsupported, None)
                }
            };
        }
        if media.encoding.eq_ignore_ascii_case("vnd.onvif.metadata") {
            return (
                PayloadHandler::Metadata,
                Some(CodecData::OnvifMetadata {
                    uri: media.control.clone(),
                }),
            );
        }
        // Static payload types (RFC 3551 §6)
        match media.payload_type {
            0 => (PayloadHandler::Pcm, Some(CodecData::PcmMulaw)),
            8 => (PayloadHandler::Pcm, Some(CodecData::PcmAlaw)),
            _ => {
                tracing::warn!(
                    payload_type = media.payload_type,
                    encoding = %media.encoding,
                    "unsupported codec, stream will be ignored"
                );
                (PayloadHandler::Unsupported, None)
            }
        }
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn control(&self) -> &str {
        &self.control
    }

    pub fn codec(&self) -> Option<&CodecData> {
        self.codec.as_ref()
    }

    /// Whether this stream has the codec description it needs before
    /// packets can be delivered. Unsupported streams never will and are
    /// excluded from the session's readiness check.
    pub fn codec_ready(&self) -> bool {
        match self.handler {
            PayloadHandler::Unsupported => true,
            _ => self.codec.is_some(),
        }
    }

    /// Current H.264 parameter sets, when both are known.
    pub fn h264_parameters(&self) -> Option<(&Bytes, &Bytes)> {
        match &self.handler {
            PayloadHandler::H264(d) => Some((d.sps()?, d.pps()?)),
            _ => None,
        }
    }

    /// True once per SPS/PPS refresh: the producer rebuilds its codec
    /// prefix when this reports a change.
    pub fn take_parameters_changed(&mut self) -> bool {
        match &mut self.handler {
            PayloadHandler::H264(d) if d.parameters_changed() => {
                d.clear_parameter_change();
                true
            }
            _ => false,
        }
    }

    /// Decode one RTP packet (the payload of an even-channel interleaved
    /// block) into media events. Malformed packets are dropped and
    /// counted; an uninterrupted run past the internal threshold returns
    /// [`RtpErrorOverflow`] and the caller ends the session.
    pub fn handle_rtp(&mut self, data: &[u8]) -> Result<Vec<MediaEvent>, RtpErrorOverflow> {
        let Some(packet) = rtp::parse(data) else {
            tracing::warn!(stream = self.index, len = data.len(), "malformed RTP packet");
            return self.count_error();
        };

        match &mut self.handler {
            PayloadHandler::H264(depacketizer) => {
                match depacketizer.push(packet.timestamp, packet.payload) {
                    Ok(units) => {
                        self.error_run = 0;
                        self.refresh_codec();
                        Ok(units.into_iter().map(MediaEvent::VideoNal).collect())
                    }
                    Err(e) => {
                        tracing::warn!(stream = self.index, error = %e, "dropping H.264 payload");
                        self.count_error()
                    }
                }
            }
            PayloadHandler::Aac => {
                // Strip the 4-byte AU-headers section preceding the frame.
                if packet.payload.len() < 4 {
                    tracing::warn!(stream = self.index, "AAC packet too short");
                    return self.count_error();
                }
                self.error_run = 0;
                Ok(vec![MediaEvent::Audio {
                    data: Bytes::copy_from_slice(&packet.payload[4..]),
                    timestamp: packet.timestamp,
                }])
            }
            PayloadHandler::Pcm => {
                self.error_run = 0;
                Ok(vec![MediaEvent::Audio {
                    data: Bytes::copy_from_slice(packet.payload),
                    timestamp: packet.timestamp,
                }])
            }
            PayloadHandler::Metadata => {
                self.error_run = 0;
                Ok(vec![MediaEvent::Metadata {
                    data: Bytes::copy_from_slice(packet.payload),
                    timestamp: packet.timestamp,
                }])
            }
            PayloadHandler::Unsupported => {
                tracing::trace!(stream = self.index, "dropping packet for unsupported codec");
                Ok(Vec::new())
            }
        }
    }

    /// Convert an RTP timestamp to a duration since the stream origin.
    ///
    /// The first accepted timestamp defines the origin. Returns `None`
    /// (drop) when the converted time runs backwards or jumps more than
    /// 30 minutes ahead — a 32-bit wraparound lands in the latter bucket.
    pub fn pts_for(&mut self, timestamp: u32) -> Option<Duration> {
        let origin = *self.origin.get_or_insert(timestamp);
        let ticks = timestamp.wrapping_sub(origin);
        let pts =
            Duration::from_nanos(ticks as u64 * 1_000_000_000 / self.clock_rate as u64);

        if pts < self.last_pts || pts > self.last_pts + MAX_PTS_JUMP {
            tracing::warn!(
                stream = self.index,
                pts_ms = pts.as_millis() as u64,
                last_ms = self.last_pts.as_millis() as u64,
                "RTP time anomaly, dropping packet"
            );
            return None;
        }

        self.last_pts = pts;
        Some(pts)
    }

    fn count_error(&mut self) -> Result<Vec<MediaEvent>, RtpErrorOverflow> {
        self.error_run += 1;
        if self.error_run > MAX_CONSECUTIVE_RTP_ERRORS {
            return Err(RtpErrorOverflow);
        }
        Ok(Vec::new())
    }

    /// Rebuild the codec description from the depacketizer's parameter
    /// sets when they differ from the stored one.
    fn refresh_codec(&mut self) {
        if let PayloadHandler::H264(d) = &self.handler {
            if let (Some(sps), Some(pps)) = (d.sps(), d.pps()) {
                let fresh = CodecData::H264 {
                    sps: sps.clone(),
                    pps: pps.clone(),
                };
                if self.codec.as_ref() != Some(&fresh) {
                    tracing::debug!(stream = self.index, "H.264 codec data updated");
                    self.codec = Some(fresh);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sdp::parse_sdp;

    fn h264_media(sprop: bool) -> MediaDescription {
        let fmtp = if sprop {
            // SPS = 67 42 00 29, PPS = 68 CE 38 80
            "a=fmtp:96 packetization-mode=1;sprop-parameter-sets=Z0IAKQ==,aM44gA==\r\n"
        } else {
            ""
        };
        let sdp = format!(
            "m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n{fmtp}a=control:trackID=1\r\n"
        );
        parse_sdp(&sdp).remove(0)
    }

    fn rtp_packet(timestamp: u32, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0x80, 96, 0, 1];
        data.extend_from_slice(&timestamp.to_be_bytes());
        data.extend_from_slice(&[0, 0, 0, 1]); // SSRC
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn sdp_seeding_builds_codec_data() {
        let stream = MediaStream::from_sdp(0, &h264_media(true));
        assert!(stream.codec_ready());
        match stream.codec().unwrap() {
            CodecData::H264 { sps, pps } => {
                assert_eq!(sps.as_ref(), &[0x67, 0x42, 0x00, 0x29]);
                assert_eq!(pps.as_ref(), &[0x68, 0xCE, 0x38, 0x80]);
            }
            other => panic!("expected H264 codec data, got {:?}", other),
        }
    }

    #[test]
    fn codec_data_arrives_in_band() {
        let mut stream = MediaStream::from_sdp(0, &h264_media(false));
        assert!(!stream.codec_ready());

        stream.handle_rtp(&rtp_packet(0, &[0x67, 0x42])).unwrap();
        assert!(!stream.codec_ready());
        stream.handle_rtp(&rtp_packet(0, &[0x68, 0xCE])).unwrap();
        assert!(stream.codec_ready());
        assert!(stream.h264_parameters().is_some());
    }

    #[test]
    fn pts_origin_and_progress() {
        let mut stream = MediaStream::from_sdp(0, &h264_media(true));
        assert_eq!(stream.pts_for(90_000), Some(Duration::ZERO));
        assert_eq!(stream.pts_for(180_000), Some(Duration::from_secs(1)));
        assert_eq!(
            stream.pts_for(90_000 + 45_000),
            None,
            "backwards time dropped"
        );
        // Last accepted time is unchanged by the dropped packet
        assert_eq!(stream.pts_for(270_000), Some(Duration::from_secs(2)));
    }

    #[test]
    fn pts_jump_over_30_minutes_dropped() {
        let mut stream = MediaStream::from_sdp(0, &h264_media(true));
        assert!(stream.pts_for(0).is_some());
        let jump = 31 * 60 * 90_000u32;
        assert_eq!(stream.pts_for(jump), None);
    }

    #[test]
    fn wraparound_treated_as_anomaly() {
        let mut stream = MediaStream::from_sdp(0, &h264_media(true));
        assert!(stream.pts_for(u32::MAX - 1000).is_some());
        // Wraps past zero: wrapping delta is small and positive, so this
        // still advances…
        assert!(stream.pts_for(500).is_some());
        // …but a genuine pre-wrap replay is a huge forward delta and drops.
        assert_eq!(stream.pts_for(u32::MAX - 2000), None);
    }

    #[test]
    fn malformed_run_overflows() {
        let mut stream = MediaStream::from_sdp(0, &h264_media(true));
        let garbage = [0u8; 4];
        for _ in 0..MAX_CONSECUTIVE_RTP_ERRORS {
            assert!(
                stream.handle_rtp(&garbage).is_ok(),
                "threshold not yet exceeded at exactly the limit"
            );
        }
        assert!(stream.handle_rtp(&garbage).is_err());
    }

    #[test]
    fn good_packet_resets_error_run() {
        let mut stream = MediaStream::from_sdp(0, &h264_media(true));
        let garbage = [0u8; 4];
        for _ in 0..MAX_CONSECUTIVE_RTP_ERRORS {
            assert!(stream.handle_rtp(&garbage).is_ok());
        }
        stream.handle_rtp(&rtp_packet(0, &[0x41, 0x00])).unwrap();
        for _ in 0..MAX_CONSECUTIVE_RTP_ERRORS {
            assert!(stream.handle_rtp(&garbage).is_ok());
        }
    }

    #[test]
    fn aac_strips_au_header() {
        let sdp = "m=audio 0 RTP/AVP 97\r\na=rtpmap:97 MPEG4-GENERIC/16000\r\n\
                   a=fmtp:97 config=1408\r\na=control:trackID=2\r\n";
        let mut stream = MediaStream::from_sdp(1, &parse_sdp(sdp).remove(0));
        assert!(stream.codec_ready());

        let events = stream
            .handle_rtp(&rtp_packet(100, &[0, 16, 0, 0, 0xDE, 0xAD]))
            .unwrap();
        match &events[0] {
            MediaEvent::Audio { data, timestamp } => {
                assert_eq!(data.as_ref(), &[0xDE, 0xAD]);
                assert_eq!(*timestamp, 100);
            }
            other => panic!("expected audio, got {:?}", other),
        }
    }

    #[test]
    fn pcm_mulaw_passthrough() {
        let sdp = "m=audio 0 RTP/AVP 0\r\na=control:trackID=2\r\n";
        let mut stream = MediaStream::from_sdp(1, &parse_sdp(sdp).remove(0));
        assert_eq!(stream.codec(), Some(&CodecData::PcmMulaw));
        assert_eq!(stream.clock_rate, DEFAULT_CLOCK_RATE);

        let events = stream.handle_rtp(&rtp_packet(8000, &[1, 2, 3])).unwrap();
        assert!(matches!(&events[0], MediaEvent::Audio { data, .. } if data.as_ref() == [1, 2, 3]));
    }

    #[test]
    fn onvif_metadata_passthrough() {
        let sdp = "m=application 0 RTP/AVP 107\r\n\
                   a=rtpmap:107 vnd.onvif.metadata/90000\r\na=control:trackID=3\r\n";
        let mut stream = MediaStream::from_sdp(2, &parse_sdp(sdp).remove(0));
        assert!(matches!(
            stream.codec(),
            Some(CodecData::OnvifMetadata { .. })
        ));

        let doc = b"<tt:MetadataStream/>";
        let events = stream.handle_rtp(&rtp_packet(5, doc)).unwrap();
        assert!(
            matches!(&events[0], MediaEvent::Metadata { data, .. } if data.as_ref() == &doc[..])
        );
    }

    #[test]
    fn unsupported_codec_drops_packets() {
        let sdp = "m=video 0 RTP/AVP 26\r\na=rtpmap:26 JPEG/90000\r\n";
        let mut stream = MediaStream::from_sdp(0, &parse_sdp(sdp).remove(0));
        assert!(stream.codec_ready(), "unsupported streams never gate readiness");
        assert!(stream.codec().is_none());
        assert!(stream.handle_rtp(&rtp_packet(0, &[1, 2])).unwrap().is_empty());
    }
}
