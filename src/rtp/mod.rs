//! RTP handling for a single call: packet parse/build and the per-call
//! UDP endpoint with paced egress.

mod codec;
mod endpoint;

pub use self::{
    codec::{build_packet, parse, scrub_silence, Frame, PacketError, PacketWriter},
    endpoint::{EndpointError, EndpointStats, RtpEndpoint},
};

use discortp::rtp::RtpType;
use std::fmt;

/// G.711 companding variant carried on a call's media stream.
///
/// Audio is passed through byte-for-byte; the codec only selects the RTP
/// payload type and the format string handed to Asterisk and OpenAI.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Codec {
    /// G.711 mu-law, RTP payload type 0.
    #[default]
    Ulaw,
    /// G.711 A-law, RTP payload type 8.
    Alaw,
}

impl Codec {
    /// The RTP payload type for frames of this codec.
    #[must_use]
    pub fn payload_type(self) -> RtpType {
        match self {
            Codec::Ulaw => RtpType::Pcmu,
            Codec::Alaw => RtpType::Pcma,
        }
    }

    /// Maps an Asterisk format name onto a codec, if it is one we pass
    /// through.
    #[must_use]
    pub fn from_format(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ulaw" => Some(Codec::Ulaw),
            "alaw" => Some(Codec::Alaw),
            _ => None,
        }
    }

    /// The format name Asterisk uses for this codec.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Codec::Ulaw => "ulaw",
            Codec::Alaw => "alaw",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_names_round_trip() {
        assert_eq!(Codec::from_format("ulaw"), Some(Codec::Ulaw));
        assert_eq!(Codec::from_format(" ULAW "), Some(Codec::Ulaw));
        assert_eq!(Codec::from_format("alaw"), Some(Codec::Alaw));
        assert_eq!(Codec::from_format("opus"), None);
        assert_eq!(Codec::Ulaw.as_str(), "ulaw");
    }

    #[test]
    fn payload_types_match_g711() {
        assert_eq!(Codec::Ulaw.payload_type(), RtpType::Pcmu);
        assert_eq!(Codec::Alaw.payload_type(), RtpType::Pcma);
    }
}
