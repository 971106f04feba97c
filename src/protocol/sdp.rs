//! SDP (Session Description Protocol) media-section parsing (RFC 4566).
//!
//! Extracts from a DESCRIBE body the fields this client acts on:
//!
//! ```text
//! m=video 0 RTP/AVP 96                          ← media kind + payload type
//! a=rtpmap:96 H264/90000                        ← encoding name / clock rate
//! a=fmtp:96 packetization-mode=1;sprop-parameter-sets=Z0IAHpWo...,aM4wpIA=
//! a=control:trackID=1                           ← per-media control token
//! ```
//!
//! Session-level lines (`v=`, `o=`, `s=`, `c=`, `t=`) are skipped; only the
//! media sections matter for SETUP and depacketization. Unknown attributes
//! are ignored rather than rejected — cameras emit a wide variety of
//! nonstandard lines.

use base64::prelude::BASE64_STANDARD;
use base64::Engine as _;

/// One `m=` section with the attributes this client consumes.
#[derive(Debug, Clone, Default)]
pub struct MediaDescription {
    /// Media kind from the `m=` line: `video`, `audio`, or `application`.
    pub media_kind: String,
    /// First payload type listed on the `m=` line.
    pub payload_type: u8,
    /// Encoding name from `a=rtpmap` (e.g. `H264`, `MPEG4-GENERIC`,
    /// `vnd.onvif.metadata`). Empty for static payload types without an
    /// rtpmap line.
    pub encoding: String,
    /// Clock rate from `a=rtpmap`, zero when absent.
    pub clock_rate: u32,
    /// Control token or URI from `a=control`.
    pub control: String,
    /// Decoded `sprop-parameter-sets` NAL units (H.264 SPS/PPS).
    pub sprop_parameter_sets: Vec<Vec<u8>>,
    /// Decoded `config=` bytes (AAC AudioSpecificConfig, hex).
    pub config: Option<Vec<u8>>,
}

/// Parse every media section of an SDP body.
///
/// Returns an empty vector when the body has no `m=` lines; the caller
/// treats that as a protocol error.
pub fn parse_sdp(body: &str) -> Vec<MediaDescription> {
    let mut medias: Vec<MediaDescription> = Vec::new();

    for line in body.lines() {
        let line = line.trim_end();

        if let Some(rest) = line.strip_prefix("m=") {
            let mut tokens = rest.split_whitespace();
            let kind = tokens.next().unwrap_or("").to_string();
            let _port = tokens.next();
            let _proto = tokens.next();
            let payload_type = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(0);

            medias.push(MediaDescription {
                media_kind: kind,
                payload_type,
                ..Default::default()
            });
            continue;
        }

        let Some(media) = medias.last_mut() else {
            continue; // session-level line
        };

        if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            // a=rtpmap:<pt> <encoding>/<clock>[/<channels>]
            let Some((pt, spec)) = rest.split_once(' ') else {
                continue;
            };
            if pt.trim().parse::<u8>() != Ok(media.payload_type) {
                continue;
            }
            let mut fields = spec.trim().split('/');
            media.encoding = fields.next().unwrap_or("").to_string();
            media.clock_rate = fields.next().and_then(|c| c.parse().ok()).unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("a=control:") {
            media.control = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("a=fmtp:") {
            let Some((pt, params)) = rest.split_once(' ') else {
                continue;
            };
            if pt.trim().parse::<u8>() != Ok(media.payload_type) {
                continue;
            }
            parse_fmtp(params, media);
        }
    }

    medias
}

/// Parse the `a=fmtp` parameter list: `key=value` pairs separated by `;`.
fn parse_fmtp(params: &str, media: &mut MediaDescription) {
    for param in params.split(';') {
        let Some((key, value)) = param.trim().split_once('=') else {
            continue;
        };
        match key.trim() {
            "sprop-parameter-sets" => {
                for encoded in value.split(',') {
                    match BASE64_STANDARD.decode(encoded.trim()) {
                        Ok(nal) if !nal.is_empty() => media.sprop_parameter_sets.push(nal),
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "undecodable sprop-parameter-sets entry");
                        }
                    }
                }
            }
            "config" => {
                if let Some(bytes) = parse_hex(value.trim()) {
                    media.config = Some(bytes);
                }
            }
            _ => {}
        }
    }
}

/// Decode a hex string (even length, ASCII hex digits).
fn parse_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
