//! RTP packet parse/build for G.711 passthrough.
//!
//! Ingress frames arrive from Asterisk's ExternalMedia channel and may
//! carry CSRC lists, header extensions, or padding, all of which are
//! stripped before the raw G.711 payload is handed on. Egress packets are
//! always the fixed 12-byte header plus one 20ms frame.

use crate::constants::*;
use discortp::{
    rtp::{MutableRtpPacket, RtpExtensionPacket, RtpPacket, RtpType},
    MutablePacket, PacketSize,
};
use rand::random;
use std::{error::Error as StdError, fmt};

/// Errors raised while decoding a datagram as RTP.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum PacketError {
    /// The datagram was too short, had the wrong version, or declared
    /// header fields extending past its end.
    InvalidFrame,
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::InvalidFrame => write!(f, "datagram was not a well-formed RTP packet"),
        }
    }
}

impl StdError for PacketError {}

/// A decoded view over one RTP datagram.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Frame<'a> {
    pub payload_type: RtpType,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    /// Media bytes with CSRC list, extension header, and padding removed.
    pub payload: &'a [u8],
}

/// Parses one datagram, returning the header fields and the media payload.
pub fn parse(datagram: &[u8]) -> Result<Frame<'_>, PacketError> {
    if datagram.len() < RtpPacket::minimum_packet_size() {
        return Err(PacketError::InvalidFrame);
    }

    let rtp = RtpPacket::new(datagram).ok_or(PacketError::InvalidFrame)?;

    if rtp.get_version() != RTP_VERSION {
        return Err(PacketError::InvalidFrame);
    }

    let offset = RtpPacket::minimum_packet_size() + 4 * rtp.get_csrc_count() as usize;
    if offset > datagram.len() {
        return Err(PacketError::InvalidFrame);
    }

    let mut payload = &datagram[offset..];

    if rtp.get_extension() != 0 {
        // The extension header is profile (2B) + word count (2B) + words.
        let skip = RtpExtensionPacket::new(payload)
            .map(|ext| ext.packet_size())
            .ok_or(PacketError::InvalidFrame)?;

        if skip > payload.len() {
            return Err(PacketError::InvalidFrame);
        }

        payload = &payload[skip..];
    }

    if rtp.get_padding() != 0 {
        let pad = *datagram.last().ok_or(PacketError::InvalidFrame)? as usize;

        if pad == 0 || pad > payload.len() {
            return Err(PacketError::InvalidFrame);
        }

        payload = &payload[..payload.len() - pad];
    }

    Ok(Frame {
        payload_type: rtp.get_payload_type(),
        sequence: rtp.get_sequence().into(),
        timestamp: rtp.get_timestamp().into(),
        ssrc: rtp.get_ssrc(),
        payload,
    })
}

/// Builds a padding-free, extension-free packet around `payload`.
#[must_use]
pub fn build_packet(
    payload_type: RtpType,
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = vec![0u8; RtpPacket::minimum_packet_size() + payload.len()];

    let mut rtp = MutableRtpPacket::new(&mut buf[..]).expect(
        "FATAL: Too few bytes in buf for RTP header.\
            (Blame: RtpPacket::minimum_packet_size()?)",
    );
    rtp.set_version(RTP_VERSION);
    rtp.set_payload_type(payload_type);
    rtp.set_sequence(sequence.into());
    rtp.set_timestamp(timestamp.into());
    rtp.set_ssrc(ssrc);
    rtp.payload_mut().copy_from_slice(payload);

    buf
}

/// Squashes near-silent mu-law bytes down to pure silence.
///
/// Server-side VAD counts low-amplitude line noise as speech; a frame
/// that is more than [`SILENT_FRAME_RATIO`] near-silence is replaced
/// wholesale, and stray near-silent bytes are squashed individually
/// otherwise.
pub fn scrub_silence(payload: &mut [u8]) {
    if payload.is_empty() {
        return;
    }

    let near_silent = payload.iter().filter(|&&b| b >= ULAW_NEAR_SILENCE).count();

    if near_silent as f32 / payload.len() as f32 > SILENT_FRAME_RATIO {
        payload.fill(ULAW_SILENCE);
    } else {
        for byte in payload.iter_mut() {
            if *byte >= ULAW_NEAR_SILENCE {
                *byte = ULAW_SILENCE;
            }
        }
    }
}

/// Reusable egress packet buffer.
///
/// Header fields are written once at construction; each sent frame then
/// only rewrites the payload and marches sequence/timestamp in place.
pub struct PacketWriter {
    packet: [u8; RtpPacket::minimum_packet_size() + FRAME_SIZE],
}

impl PacketWriter {
    /// Creates a writer with a random initial sequence/timestamp and the
    /// session's fixed SSRC.
    #[must_use]
    pub fn new(payload_type: RtpType, ssrc: u32) -> Self {
        let mut packet = [0u8; RtpPacket::minimum_packet_size() + FRAME_SIZE];

        let mut rtp = MutableRtpPacket::new(&mut packet[..]).expect(
            "FATAL: Too few bytes in self.packet for RTP header.\
                (Blame: RtpPacket::minimum_packet_size()?)",
        );
        rtp.set_version(RTP_VERSION);
        rtp.set_payload_type(payload_type);
        rtp.set_sequence(random::<u16>().into());
        rtp.set_timestamp(random::<u32>().into());
        rtp.set_ssrc(ssrc);

        Self { packet }
    }

    /// Writes one frame's payload, returning the bytes to put on the wire.
    ///
    /// `payload` must be at most one frame (160 bytes).
    pub fn frame(&mut self, payload: &[u8]) -> &[u8] {
        let total = RtpPacket::minimum_packet_size() + payload.len();

        let mut rtp = MutableRtpPacket::new(&mut self.packet[..]).expect(
            "FATAL: Too few bytes in self.packet for RTP header.\
                (Blame: RtpPacket::minimum_packet_size()?)",
        );
        rtp.payload_mut()[..payload.len()].copy_from_slice(payload);

        &self.packet[..total]
    }

    /// Advances sequence (+1 mod 2^16) and timestamp (+`samples` mod 2^32)
    /// after a successful send.
    pub fn advance(&mut self, samples: u32) {
        let mut rtp = MutableRtpPacket::new(&mut self.packet[..]).expect(
            "FATAL: Too few bytes in self.packet for RTP header.\
                (Blame: RtpPacket::minimum_packet_size()?)",
        );
        rtp.set_sequence(rtp.get_sequence() + 1);
        rtp.set_timestamp(rtp.get_timestamp() + samples);
    }

    pub fn sequence(&self) -> u16 {
        RtpPacket::new(&self.packet[..])
            .expect("Writer buffer always holds a valid header.")
            .get_sequence()
            .into()
    }

    pub fn timestamp(&self) -> u32 {
        RtpPacket::new(&self.packet[..])
            .expect("Writer buffer always holds a valid header.")
            .get_timestamp()
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 12-byte header, PT 0, seq 0x1234, ts 0x140, ssrc 0xDEADBEEF,
    // 4 bytes of mu-law silence.
    const BASIC: [u8; 16] = [
        0x80, 0x00, 0x12, 0x34, 0x00, 0x00, 0x01, 0x40, 0xDE, 0xAD, 0xBE, 0xEF, 0xFF, 0xFF, 0xFF,
        0xFF,
    ];

    #[test]
    fn parses_plain_packet() {
        let frame = parse(&BASIC).unwrap();

        assert_eq!(frame.payload_type, RtpType::Pcmu);
        assert_eq!(frame.sequence, 0x1234);
        assert_eq!(frame.timestamp, 0x140);
        assert_eq!(frame.ssrc, 0xDEAD_BEEF);
        assert_eq!(frame.payload, &[0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn rejects_short_and_wrong_version() {
        assert_eq!(parse(&BASIC[..11]), Err(PacketError::InvalidFrame));

        let mut wrong_version = BASIC;
        wrong_version[0] = 0x40;
        assert_eq!(parse(&wrong_version), Err(PacketError::InvalidFrame));
    }

    #[test]
    fn rejects_truncated_csrc_list() {
        let mut pkt = BASIC;
        // Claim 15 CSRCs in a 16-byte datagram.
        pkt[0] = 0x8F;
        assert_eq!(parse(&pkt), Err(PacketError::InvalidFrame));
    }

    #[test]
    fn skips_extension_header() {
        // Extension bit set; one-word extension (profile 0xBEDE).
        let mut pkt = vec![0x90, 0x00, 0x12, 0x34, 0x00, 0x00, 0x01, 0x40];
        pkt.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        pkt.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04]);
        pkt.extend_from_slice(&[0x11, 0x22]);

        let frame = parse(&pkt).unwrap();
        assert_eq!(frame.payload, &[0x11, 0x22]);
    }

    #[test]
    fn strips_padding() {
        // Padding bit set, final byte declares two bytes of padding.
        let mut pkt = BASIC.to_vec();
        pkt[0] = 0xA0;
        pkt[15] = 0x02;

        let frame = parse(&pkt).unwrap();
        assert_eq!(frame.payload, &[0xFF, 0xFF]);
    }

    #[test]
    fn rejects_padding_longer_than_payload() {
        let mut pkt = BASIC.to_vec();
        pkt[0] = 0xA0;
        pkt[15] = 0x09;

        assert_eq!(parse(&pkt), Err(PacketError::InvalidFrame));
    }

    #[test]
    fn build_reproduces_parsed_fields() {
        let frame = parse(&BASIC).unwrap();
        let rebuilt = build_packet(
            frame.payload_type,
            frame.sequence,
            frame.timestamp,
            frame.ssrc,
            frame.payload,
        );

        assert_eq!(&rebuilt[..], &BASIC[..]);
    }

    #[test]
    fn writer_marches_sequence_and_timestamp() {
        let mut writer = PacketWriter::new(RtpType::Pcmu, 0x1234_5678);
        let payload = [0u8; FRAME_SIZE];

        let first_seq = writer.sequence();
        let first_ts = writer.timestamp();

        let wire = writer.frame(&payload);
        assert_eq!(wire.len(), 12 + FRAME_SIZE);
        writer.advance(FRAME_SIZE as u32);

        assert_eq!(writer.sequence(), first_seq.wrapping_add(1));
        assert_eq!(writer.timestamp(), first_ts.wrapping_add(FRAME_SIZE as u32));
    }

    #[test]
    fn sequence_wraps_at_u16_boundary() {
        let mut writer = PacketWriter::new(RtpType::Pcmu, 1);
        let payload = [0u8; FRAME_SIZE];

        // Walk the writer onto the boundary, then across it.
        while writer.sequence() != 0xFFFF {
            let _ = writer.frame(&payload);
            writer.advance(FRAME_SIZE as u32);
        }

        let _ = writer.frame(&payload);
        writer.advance(FRAME_SIZE as u32);
        assert_eq!(writer.sequence(), 0x0000);
    }

    #[test]
    fn scrub_replaces_mostly_silent_frames() {
        let mut frame = vec![0xFC; 160];
        frame[0] = 0x20;

        scrub_silence(&mut frame);
        assert!(frame.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn scrub_squashes_stray_near_silence() {
        let mut frame = vec![0x20; 160];
        frame[10] = 0xFD;
        frame[20] = 0xFE;

        scrub_silence(&mut frame);
        assert_eq!(frame[10], 0xFF);
        assert_eq!(frame[20], 0xFF);
        assert_eq!(frame[0], 0x20);
    }
}
