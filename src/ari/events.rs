//! Event model for the ARI WebSocket.
//!
//! Asterisk tags every event message with a top-level `type` field; only
//! the variants this bridge reacts to are modelled in full, everything
//! else collapses into [`AriEvent::Unknown`].

use serde::Deserialize;

/// One event from the `/ari/events` socket.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub enum AriEvent {
    /// Dial state progress on an originated channel.
    Dial(DialInfo),
    /// A channel entered the Stasis application.
    StasisStart { channel: Channel },
    /// A channel left the Stasis application.
    StasisEnd { channel: Channel },
    PlaybackStarted { playback: Playback },
    PlaybackFinished { playback: Playback },
    ChannelStateChange { channel: Channel },
    ChannelDestroyed {
        channel: Channel,
        #[serde(default)]
        cause: Option<i64>,
        #[serde(default)]
        cause_txt: Option<String>,
    },
    /// Any event type this bridge has no interest in.
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DialInfo {
    #[serde(default)]
    pub dialstatus: String,
    #[serde(default)]
    pub peer: Option<Channel>,
}

/// The subset of ARI's channel resource this bridge inspects.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub dialplan: Option<Dialplan>,
    #[serde(default)]
    pub caller: Option<CallerId>,
}

impl Channel {
    /// Whether this is an ExternalMedia pseudo-channel owned by `app`.
    #[must_use]
    pub fn is_unicast_rtp_for(&self, app: &str) -> bool {
        (self.id.starts_with(crate::constants::UNICAST_RTP_PREFIX)
            || self.name.starts_with(crate::constants::UNICAST_RTP_PREFIX))
            && self
                .dialplan
                .as_ref()
                .is_some_and(|d| d.app_name == app)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Dialplan {
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub exten: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub app_data: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CallerId {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub number: String,
}

/// The subset of ARI's playback resource this bridge inspects.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Playback {
    pub id: String,
    #[serde(default)]
    pub media_uri: String,
    #[serde(default)]
    pub target_uri: String,
    #[serde(default)]
    pub state: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_stasis_start() {
        let raw = r#"{
            "type": "StasisStart",
            "timestamp": "2024-05-01T10:00:00.000-0500",
            "args": [],
            "channel": {
                "id": "1714575600.77",
                "name": "SIP/voip-0000004d",
                "state": "Up",
                "caller": {"name": "", "number": "3001234567"},
                "dialplan": {
                    "context": "from-voip",
                    "exten": "3241000752",
                    "priority": 3,
                    "app_name": "Stasis",
                    "app_data": "openai-app"
                }
            },
            "application": "openai-app"
        }"#;

        let event: AriEvent = serde_json::from_str(raw).unwrap();
        match event {
            AriEvent::StasisStart { channel } => {
                assert_eq!(channel.id, "1714575600.77");
                assert_eq!(channel.state, "Up");
                assert_eq!(channel.caller.unwrap().number, "3001234567");
            },
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn decodes_dial_ringing() {
        let raw = r#"{
            "type": "Dial",
            "dialstatus": "RINGING",
            "peer": {"id": "1714575600.78", "name": "SIP/voip_issabel-0000004e", "state": "Ringing"}
        }"#;

        let event: AriEvent = serde_json::from_str(raw).unwrap();
        match event {
            AriEvent::Dial(info) => assert_eq!(info.dialstatus, "RINGING"),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn decodes_playback_events() {
        let raw = r#"{
            "type": "PlaybackStarted",
            "playback": {
                "id": "p-123",
                "media_uri": "sound:morosos_natalia",
                "target_uri": "channel:1714575600.77",
                "state": "playing"
            }
        }"#;

        let event: AriEvent = serde_json::from_str(raw).unwrap();
        match event {
            AriEvent::PlaybackStarted { playback } => {
                assert_eq!(playback.id, "p-123");
                assert_eq!(playback.target_uri, "channel:1714575600.77");
            },
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_are_tolerated() {
        let raw = r#"{"type": "ChannelVarset", "variable": "X", "value": "1"}"#;
        let event: AriEvent = serde_json::from_str(raw).unwrap();
        assert!(matches!(event, AriEvent::Unknown));
    }

    #[test]
    fn recognises_orphan_media_channels() {
        let raw = r#"{
            "id": "1714575600.80",
            "name": "UnicastRTP/10.0.0.5:10002-0x7f",
            "state": "Up",
            "dialplan": {"context": "default", "exten": "s", "app_name": "openai-app", "app_data": ""}
        }"#;

        let channel: Channel = serde_json::from_str(raw).unwrap();
        assert!(channel.is_unicast_rtp_for("openai-app"));
        assert!(!channel.is_unicast_rtp_for("overdue-app"));
    }
}
