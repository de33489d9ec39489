//! RTP header classification.
//!
//! Grounded on `RtpParser.{hpp,cpp}`: the fixed 12-byte header layout and
//! `parseRtp`'s payload-type classification table (from
//! <https://www.ietf.org/assignments/rtp-parameters/rtp-parameters.xml>).
//! Only single-packet classification is implemented — RTP stream
//! reassembly is a Non-goal.

use crate::error::Result;
use crate::packet::require_len;

pub const HEADER_SIZE: usize = 12;

/// The classification `classify` assigns to a UDP payload, mirroring
/// `RtpParser::PacketType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpPacketType {
    /// Too short, or not RTP version 2.
    Invalid,
    /// Looks like RTP but the payload type is outside all known ranges.
    InvalidCodec,
    Audio,
    Video,
    AudioVideo,
    /// Payload type in the dynamic range (96-127).
    Dynamic,
    /// RTCP packet (payload type mapped back into the 200-204 range).
    Rtcp,
}

#[derive(Debug, Clone, Copy)]
pub struct RtpClassification {
    pub packet_type: RtpPacketType,
    pub payload_type: u8,
    pub ssrc_id: u32,
    pub timestamp: u32,
    pub seq_num: u16,
}

pub struct RtpView<'a> {
    data: &'a [u8],
}

impl<'a> RtpView<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        require_len(data, HEADER_SIZE, "rtp header")?;
        Ok(Self { data })
    }

    pub fn version(&self) -> u8 {
        (self.data[0] >> 6) & 0x03
    }

    pub fn csrc_count(&self) -> u8 {
        self.data[0] & 0x0F
    }

    pub fn has_padding(&self) -> bool {
        self.data[0] & 0x20 != 0
    }

    pub fn has_extension(&self) -> bool {
        self.data[0] & 0x10 != 0
    }

    pub fn has_marker(&self) -> bool {
        self.data[1] & 0x80 != 0
    }

    pub fn payload_type(&self) -> u8 {
        self.data[1] & 0x7F
    }

    pub fn seq_num(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes(self.data[4..8].try_into().unwrap())
    }

    pub fn ssrc_id(&self) -> u32 {
        u32::from_be_bytes(self.data[8..12].try_into().unwrap())
    }
}

/// Classifies a UDP payload as RTP/RTCP or not, per `RtpParser::parseRtp`.
/// Returns `RtpPacketType::Invalid` (with zeroed fields) if the payload is
/// too short or not version 2 — this never errors, matching the original's
/// "output parameters might be set even on error" contract simplified to
/// always-populated output.
pub fn classify(udp_payload: &[u8]) -> RtpClassification {
    let invalid = RtpClassification {
        packet_type: RtpPacketType::Invalid,
        payload_type: 0,
        ssrc_id: 0,
        timestamp: 0,
        seq_num: 0,
    };

    if udp_payload.len() <= HEADER_SIZE {
        return invalid;
    }
    let view = match RtpView::new(udp_payload) {
        Ok(v) => v,
        Err(_) => return invalid,
    };
    if view.version() != 2 {
        return invalid;
    }

    let mut payload_type = view.payload_type();
    let ssrc_id = view.ssrc_id();
    let timestamp = view.timestamp();
    let seq_num = view.seq_num();

    let packet_type = if payload_type == 0 || (3..=18).contains(&payload_type) {
        RtpPacketType::Audio
    } else if (96..=127).contains(&payload_type) {
        RtpPacketType::Dynamic
    } else if payload_type == 33 {
        RtpPacketType::AudioVideo
    } else if (25..=34).contains(&payload_type) {
        RtpPacketType::Video
    } else if (72..=76).contains(&payload_type) && view.has_marker() {
        payload_type |= 0x80;
        RtpPacketType::Rtcp
    } else {
        RtpPacketType::InvalidCodec
    };

    RtpClassification { packet_type, payload_type, ssrc_id, timestamp, seq_num }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(payload_type: u8, marker: bool) -> Vec<u8> {
        let mut h = vec![0u8; 13];
        h[0] = 0x80; // version 2
        h[1] = payload_type | if marker { 0x80 } else { 0 };
        h
    }

    #[test]
    fn classifies_audio() {
        assert_eq!(classify(&header(0, false)).packet_type, RtpPacketType::Audio);
        assert_eq!(classify(&header(10, false)).packet_type, RtpPacketType::Audio);
    }

    #[test]
    fn classifies_dynamic() {
        assert_eq!(classify(&header(100, false)).packet_type, RtpPacketType::Dynamic);
    }

    #[test]
    fn classifies_video_and_audio_video() {
        assert_eq!(classify(&header(30, false)).packet_type, RtpPacketType::Video);
        assert_eq!(classify(&header(33, false)).packet_type, RtpPacketType::AudioVideo);
    }

    #[test]
    fn classifies_rtcp_only_with_marker() {
        let c = classify(&header(74, true));
        assert_eq!(c.packet_type, RtpPacketType::Rtcp);
        assert_eq!(c.payload_type, 74 | 0x80);

        assert_eq!(classify(&header(74, false)).packet_type, RtpPacketType::InvalidCodec);
    }

    #[test]
    fn rejects_wrong_version_and_short_payload() {
        let mut bad_version = header(0, false);
        bad_version[0] = 0x40;
        assert_eq!(classify(&bad_version).packet_type, RtpPacketType::Invalid);
        assert_eq!(classify(&[0u8; 12]).packet_type, RtpPacketType::Invalid);
    }
}
