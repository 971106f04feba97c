use bytes::{BufMut, Bytes, BytesMut};

/// H.264 RTP depacketizer (RFC 6184).
///
/// Converts RTP payloads into length-prefixed AVCC NAL units, reassembling
/// FU-A fragments and expanding STAP-A aggregates. Tracks the current
/// SPS/PPS parameter sets so the session can maintain its codec prefix.
///
/// NAL unit type handling (H.264 table 7-1 / RFC 6184 §5.2):
///
/// | nal_type | Handling |
/// |----------|----------|
/// | 1–5      | single NAL unit; 5 (IDR) marks a keyframe |
/// | 6, 9–23  | single NAL unit (SEI, AUD, ...) |
/// | 7 / 8    | SPS / PPS: parameter set tracked, unit still emitted |
/// | 24       | STAP-A: expand `<2-byte size><NAL>` sub-units |
/// | 28       | FU-A: reassemble Start..End into one NAL |
/// | 25–27, 29| STAP-B/MTAP/FU-B: unsupported, dropped with a warning |
///
/// Some cameras erroneously send Annex-B byte streams (`00 00 00 01` start
/// codes) where a single NAL is expected; those payloads are split on
/// start codes and each piece handled individually.
#[derive(Debug, Default)]
pub struct H264Depacketizer {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    sps_changed: bool,
    pps_changed: bool,

    fu_started: bool,
    fu_buffer: Vec<u8>,

    /// Units produced by the payload currently being handled.
    units: Vec<NalUnit>,
}

/// One depacketized NAL unit.
#[derive(Debug, Clone)]
pub struct NalUnit {
    /// `<4-byte big-endian length><NAL bytes>` (AVCC framing).
    pub avcc: Bytes,
    /// Low five bits of the NAL header.
    pub nal_type: u8,
    /// Whether this is an IDR slice (nal_type 5).
    pub is_keyframe: bool,
    /// RTP timestamp of the packet that completed this unit.
    pub timestamp: u32,
}

/// A payload this depacketizer cannot turn into NAL units.
#[derive(Debug, thiserror::Error)]
pub enum DepacketizeError {
    #[error("H.264 payload too short")]
    TooShort,
    #[error("unsupported H.264 NAL type {0}")]
    UnsupportedNalType(u8),
}

const NAL_TYPE_IDR: u8 = 5;
const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;
const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;

impl H264Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one RTP payload; returns the NAL units it completed (possibly
    /// none, e.g. for non-final FU-A fragments).
    ///
    /// On error, units accumulated from the same payload are discarded —
    /// the caller drops the whole packet.
    pub fn push(
        &mut self,
        timestamp: u32,
        payload: &[u8],
    ) -> Result<Vec<NalUnit>, DepacketizeError> {
        match self.handle_nal(timestamp, payload) {
            Ok(()) => Ok(std::mem::take(&mut self.units)),
            Err(e) => {
                self.units.clear();
                Err(e)
            }
        }
    }

    /// Current SPS bytes, from SDP seeding or in-band NAL units.
    pub fn sps(&self) -> Option<&Bytes> {
        self.sps.as_ref()
    }

    /// Current PPS bytes.
    pub fn pps(&self) -> Option<&Bytes> {
        self.pps.as_ref()
    }

    /// Whether either parameter set changed since the last
    /// [`clear_parameter_change`](Self::clear_parameter_change).
    pub fn parameters_changed(&self) -> bool {
        self.sps_changed || self.pps_changed
    }

    /// Whether *both* parameter sets changed — the codec description
    /// itself is different.
    pub fn codec_data_changed(&self) -> bool {
        self.sps_changed && self.pps_changed
    }

    pub fn clear_parameter_change(&mut self) {
        self.sps_changed = false;
        self.pps_changed = false;
    }

    fn handle_nal(&mut self, timestamp: u32, packet: &[u8]) -> Result<(), DepacketizeError> {
        if packet.len() < 2 {
            return Err(DepacketizeError::TooShort);
        }

        // Buggy camera: Annex-B byte stream where a single NAL is expected.
        if packet.starts_with(&[0, 0, 0, 1]) {
            for nal in split_annex_b(packet) {
                self.handle_nal(timestamp, nal)?;
            }
            return Ok(());
        }

        let nal_type = packet[0] & 0x1F;
        match nal_type {
            1..=23 => {
                if nal_type == NAL_TYPE_SPS {
                    self.update_sps(packet);
                } else if nal_type == NAL_TYPE_PPS {
                    self.update_pps(packet);
                }
                self.emit(timestamp, packet);
                Ok(())
            }
            NAL_TYPE_STAP_A => {
                // <STAP-A header> then repeated <2-byte size><NAL>
                let mut rest = &packet[1..];
                while rest.len() >= 2 {
                    let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                    if size + 2 > rest.len() {
                        break;
                    }
                    self.handle_nal(timestamp, &rest[2..2 + size])?;
                    rest = &rest[2 + size..];
                }
                Ok(())
            }
            NAL_TYPE_FU_A => {
                let fu_indicator = packet[0];
                let fu_header = packet[1];
                let is_start = fu_header & 0x80 != 0;
                let is_end = fu_header & 0x40 != 0;

                if is_start {
                    self.fu_started = true;
                    self.fu_buffer.clear();
                    // Reconstructed NAL header: F/NRI from the indicator,
                    // type from the FU header.
                    self.fu_buffer
                        .push((fu_indicator & 0xE0) | (fu_header & 0x1F));
                }
                if self.fu_started {
                    self.fu_buffer.extend_from_slice(&packet[2..]);
                    if is_end {
                        self.fu_started = false;
                        let nal = std::mem::take(&mut self.fu_buffer);
                        self.handle_nal(timestamp, &nal)?;
                    }
                } else {
                    tracing::trace!("FU-A continuation without start, dropping");
                }
                Ok(())
            }
            25..=27 | 29 => {
                tracing::warn!(nal_type, "unsupported H.264 aggregation type, dropping");
                Ok(())
            }
            _ => Err(DepacketizeError::UnsupportedNalType(nal_type)),
        }
    }

    fn emit(&mut self, timestamp: u32, nal: &[u8]) {
        let nal_type = nal[0] & 0x1F;
        let mut avcc = BytesMut::with_capacity(4 + nal.len());
        avcc.put_u32(nal.len() as u32);
        avcc.put_slice(nal);
        self.units.push(NalUnit {
            avcc: avcc.freeze(),
            nal_type,
            is_keyframe: nal_type == NAL_TYPE_IDR,
            timestamp,
        });
    }

    fn update_sps(&mut self, nal: &[u8]) {
        match &self.sps {
            None => self.sps = Some(Bytes::copy_from_slice(nal)),
            Some(current) if current.as_ref() != nal => {
                tracing::debug!("SPS changed mid-stream");
                self.sps = Some(Bytes::copy_from_slice(nal));
                self.sps_changed = true;
            }
            Some(_) => {}
        }
    }

    fn update_pps(&mut self, nal: &[u8]) {
        match &self.pps {
            None => self.pps = Some(Bytes::copy_from_slice(nal)),
            Some(current) if current.as_ref() != nal => {
                tracing::debug!("PPS changed mid-stream");
                self.pps = Some(Bytes::copy_from_slice(nal));
                self.pps_changed = true;
            }
            Some(_) => {}
        }
    }
}

/// Iterate over the NAL units of an Annex-B byte stream.
///
/// A unit runs from the end of one start code to the byte before the
/// next. Both the 4-byte (`00 00 00 01`) and 3-byte (`00 00 01`) forms
/// are recognized; bytes before the first start code and empty units
/// (adjacent start codes) are skipped.
fn split_annex_b(data: &[u8]) -> AnnexBUnits<'_> {
    AnnexBUnits {
        data,
        pos: 0,
        unit_start: None,
    }
}

struct AnnexBUnits<'a> {
    data: &'a [u8],
    pos: usize,
    /// Index just past the most recent start code, while its unit is
    /// still open.
    unit_start: Option<usize>,
}

impl<'a> Iterator for AnnexBUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        while self.pos < self.data.len() {
            let code_len = start_code_len(&self.data[self.pos..]);
            if code_len == 0 {
                self.pos += 1;
                continue;
            }
            let finished = self.unit_start;
            let unit_end = self.pos;
            self.unit_start = Some(self.pos + code_len);
            self.pos += code_len;
            if let Some(start) = finished {
                if start < unit_end {
                    return Some(&self.data[start..unit_end]);
                }
            }
        }
        match self.unit_start.take() {
            Some(start) if start < self.data.len() => Some(&self.data[start..]),
            _ => None,
        }
    }
}

fn start_code_len(data: &[u8]) -> usize {
    if data.starts_with(&[0, 0, 0, 1]) {
        4
    } else if data.starts_with(&[0, 0, 1]) {
        3
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_all(d: &mut H264Depacketizer, ts: u32, payloads: &[&[u8]]) -> Vec<NalUnit> {
        let mut out = Vec::new();
        for p in payloads {
            out.extend(d.push(ts, p).unwrap());
        }
        out
    }

    // --- single NAL ---

    #[test]
    fn single_nal_to_avcc() {
        let mut d = H264Depacketizer::new();
        let units = d.push(1000, &[0x41, 0xAA, 0xBB]).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].avcc.as_ref(), &[0, 0, 0, 3, 0x41, 0xAA, 0xBB]);
        assert_eq!(units[0].nal_type, 1);
        assert!(!units[0].is_keyframe);
        assert_eq!(units[0].timestamp, 1000);
    }

    #[test]
    fn idr_marks_keyframe() {
        let mut d = H264Depacketizer::new();
        let units = d.push(0, &[0x65, 0x11]).unwrap();
        assert!(units[0].is_keyframe);
        assert_eq!(units[0].nal_type, 5);
    }

    #[test]
    fn sei_emitted_as_delta() {
        let mut d = H264Depacketizer::new();
        let units = d.push(0, &[0x06, 0x05, 0x01]).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].nal_type, 6);
        assert!(!units[0].is_keyframe);
    }

    // --- FU-A ---

    #[test]
    fn fu_a_reassembly() {
        let mut d = H264Depacketizer::new();
        let ts = 5555;
        assert!(d.push(ts, &[0x7C, 0x85, 0xAA, 0xBB]).unwrap().is_empty());
        assert!(d.push(ts, &[0x7C, 0x05, 0xCC, 0xDD]).unwrap().is_empty());
        let units = d.push(ts, &[0x7C, 0x45, 0xEE]).unwrap();

        assert_eq!(units.len(), 1);
        let u = &units[0];
        // Reconstructed header: (0x7C & 0xE0) | (0x85 & 0x1F) = 0x65
        assert_eq!(
            u.avcc.as_ref(),
            &[0, 0, 0, 6, 0x65, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE]
        );
        assert!(u.is_keyframe);
        assert_eq!(u.timestamp, ts);
    }

    #[test]
    fn fu_a_continuation_without_start_dropped() {
        let mut d = H264Depacketizer::new();
        assert!(d.push(0, &[0x7C, 0x05, 0xCC]).unwrap().is_empty());
        assert!(d.push(0, &[0x7C, 0x45, 0xEE]).unwrap().is_empty());
    }

    #[test]
    fn fu_a_restart_discards_partial() {
        let mut d = H264Depacketizer::new();
        assert!(d.push(0, &[0x7C, 0x85, 0x01]).unwrap().is_empty());
        // New start before the previous fragment ended
        assert!(d.push(0, &[0x7C, 0x85, 0x02]).unwrap().is_empty());
        let units = d.push(0, &[0x7C, 0x45, 0x03]).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].avcc.as_ref(), &[0, 0, 0, 3, 0x65, 0x02, 0x03]);
    }

    // --- STAP-A ---

    #[test]
    fn stap_a_expansion_updates_parameter_sets() {
        // STAP-A carrying SPS (67 AA BB) and PPS (68 CC)
        let mut d = H264Depacketizer::new();
        let units = d
            .push(42, &[0x78, 0x00, 0x03, 0x67, 0xAA, 0xBB, 0x00, 0x02, 0x68, 0xCC])
            .unwrap();

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].avcc.as_ref(), &[0, 0, 0, 3, 0x67, 0xAA, 0xBB]);
        assert_eq!(units[1].avcc.as_ref(), &[0, 0, 0, 2, 0x68, 0xCC]);
        assert!(units.iter().all(|u| u.timestamp == 42));
        assert!(units.iter().all(|u| !u.is_keyframe));

        assert_eq!(d.sps().unwrap().as_ref(), &[0x67, 0xAA, 0xBB]);
        assert_eq!(d.pps().unwrap().as_ref(), &[0x68, 0xCC]);
        // First sighting is not a "change"
        assert!(!d.parameters_changed());
    }

    #[test]
    fn stap_a_of_k_units_produces_k_packets() {
        let mut d = H264Depacketizer::new();
        let mut payload = vec![0x78];
        for _ in 0..4 {
            payload.extend_from_slice(&[0x00, 0x02, 0x41, 0x99]);
        }
        let units = d.push(7, &payload).unwrap();
        assert_eq!(units.len(), 4);
        assert!(units.iter().all(|u| u.timestamp == 7));
    }

    #[test]
    fn stap_a_truncated_sub_unit_stops_cleanly() {
        let mut d = H264Depacketizer::new();
        // Second size claims 9 bytes but only 2 remain
        let units = d
            .push(0, &[0x78, 0x00, 0x02, 0x41, 0x99, 0x00, 0x09, 0x41, 0x99])
            .unwrap();
        assert_eq!(units.len(), 1);
    }

    // --- parameter set changes ---

    #[test]
    fn sps_pps_change_detection() {
        let mut d = H264Depacketizer::new();
        d.push(0, &[0x67, 0x01]).unwrap();
        d.push(0, &[0x68, 0x02]).unwrap();
        assert!(!d.parameters_changed());

        d.push(0, &[0x67, 0x01]).unwrap(); // identical — no change
        assert!(!d.parameters_changed());

        d.push(0, &[0x67, 0xFF]).unwrap();
        assert!(d.parameters_changed());
        assert!(!d.codec_data_changed());

        d.push(0, &[0x68, 0xFE]).unwrap();
        assert!(d.codec_data_changed());

        d.clear_parameter_change();
        assert!(!d.parameters_changed());
        assert_eq!(d.sps().unwrap().as_ref(), &[0x67, 0xFF]);
    }

    // --- Annex-B fallback ---

    #[test]
    fn buggy_annex_b_payload_split() {
        let mut d = H264Depacketizer::new();
        let mut payload = vec![0, 0, 0, 1, 0x67, 0x11];
        payload.extend_from_slice(&[0, 0, 0, 1, 0x68, 0x22]);
        payload.extend_from_slice(&[0, 0, 1, 0x65, 0x33]);
        let units = d.push(9, &payload).unwrap();

        assert_eq!(units.len(), 3);
        assert_eq!(units[2].avcc.as_ref(), &[0, 0, 0, 2, 0x65, 0x33]);
        assert!(units[2].is_keyframe);
        assert_eq!(d.sps().unwrap().as_ref(), &[0x67, 0x11]);
    }

    #[test]
    fn annex_b_units_mixed_start_codes() {
        let data = [0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68];
        let units: Vec<&[u8]> = split_annex_b(&data).collect();
        assert_eq!(units, vec![&[0x67, 0x42][..], &[0x68][..]]);
    }

    #[test]
    fn annex_b_units_edge_cases() {
        assert!(split_annex_b(&[]).next().is_none());
        assert!(split_annex_b(&[0xFF, 0xFE]).next().is_none());
        // Leading garbage dropped, adjacent start codes yield nothing
        let data = [0xAB, 0, 0, 1, 0, 0, 0, 1, 0x41, 0x09];
        let units: Vec<&[u8]> = split_annex_b(&data).collect();
        assert_eq!(units, vec![&[0x41, 0x09][..]]);
    }

    // --- errors ---

    #[test]
    fn too_short_rejected() {
        let mut d = H264Depacketizer::new();
        assert!(matches!(d.push(0, &[0x41]), Err(DepacketizeError::TooShort)));
        assert!(matches!(d.push(0, &[]), Err(DepacketizeError::TooShort)));
    }

    #[test]
    fn reserved_nal_type_rejected() {
        let mut d = H264Depacketizer::new();
        assert!(matches!(
            d.push(0, &[0x1E, 0x00]), // type 30
            Err(DepacketizeError::UnsupportedNalType(30))
        ));
    }

    #[test]
    fn unsupported_aggregation_dropped_silently() {
        let mut d = H264Depacketizer::new();
        // STAP-B (25) — dropped, not an error
        assert!(d.push(0, &[0x19, 0x00, 0x01]).unwrap().is_empty());
    }

    // --- depacketization round trip ---

    #[test]
    fn fragmented_then_single_nals_are_lossless() {
        // A known NAL sequence carried as FU-A fragments and single NALs
        // comes out as the same NALs in AVCC framing.
        let original: Vec<Vec<u8>> = vec![
            vec![0x65, 1, 2, 3, 4, 5, 6],
            vec![0x41, 9, 8],
            vec![0x41, 7, 7, 7],
        ];

        let mut d = H264Depacketizer::new();
        let mut got = Vec::new();

        // First NAL as three FU-A fragments
        let nri = original[0][0] & 0x60;
        let body = &original[0][1..];
        let frag1 = [&[nri | 28, 0x80 | 5][..], &body[..2]].concat();
        let frag2 = [&[nri | 28, 5][..], &body[2..4]].concat();
        let frag3 = [&[nri | 28, 0x40 | 5][..], &body[4..]].concat();
        got.extend(push_all(
            &mut d,
            1,
            &[frag1.as_slice(), frag2.as_slice(), frag3.as_slice()],
        ));
        // Remaining NALs as single-NAL payloads
        got.extend(d.push(2, &original[1]).unwrap());
        got.extend(d.push(3, &original[2]).unwrap());

        assert_eq!(got.len(), original.len());
        for (unit, nal) in got.iter().zip(&original) {
            assert_eq!(&unit.avcc[4..], nal.as_slice());
            let len = u32::from_be_bytes(unit.avcc[..4].try_into().unwrap());
            assert_eq!(len as usize, nal.len());
        }
    }
}
