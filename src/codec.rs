//! Codec descriptions attached to each upstream media stream.

use bytes::Bytes;

/// Codec parameters for one media stream, built from SDP attributes and
/// refined by in-band parameter sets.
///
/// The H.264 variant stores the raw SPS/PPS byte strings as they appear on
/// the wire; bit-level SPS parsing (profile, dimensions) is left to
/// downstream consumers that need it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecData {
    /// H.264 video with its current parameter sets.
    H264 { sps: Bytes, pps: Bytes },
    /// AAC audio with its MPEG-4 AudioSpecificConfig bytes.
    Aac { config: Bytes },
    /// G.711 µ-law audio (static payload type 0).
    PcmMulaw,
    /// G.711 A-law audio (static payload type 8).
    PcmAlaw,
    /// ONVIF metadata stream, identified by its control URI.
    OnvifMetadata { uri: String },
}

impl CodecData {
    pub fn is_video(&self) -> bool {
        matches!(self, Self::H264 { .. })
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, Self::Aac { .. } | Self::PcmMulaw | Self::PcmAlaw)
    }

    /// Short codec name for log statements.
    pub fn name(&self) -> &'static str {
        match self {
            Self::H264 { .. } => "H264",
            Self::Aac { .. } => "AAC",
            Self::PcmMulaw => "PCM_MULAW",
            Self::PcmAlaw => "PCM_ALAW",
            Self::OnvifMetadata { .. } => "ONVIF_METADATA",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let h264 = CodecData::H264 {
            sps: Bytes::from_static(&[0x67, 0x42]),
            pps: Bytes::from_static(&[0x68, 0xCE]),
        };
        assert!(h264.is_video());
        assert!(!h264.is_audio());
        assert_eq!(h264.name(), "H264");

        assert!(CodecData::PcmMulaw.is_audio());
        assert!(CodecData::Aac {
            config: Bytes::from_static(&[0x14, 0x08])
        }
        .is_audio());
        assert!(!CodecData::OnvifMetadata {
            uri: "http://www.onvif.org/ver10/schema".to_string()
        }
        .is_audio());
    }
}
