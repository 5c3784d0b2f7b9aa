//! Wire model for the OpenAI Realtime WebSocket.
//!
//! Both directions are JSON with a `type` discriminator. Audio rides
//! inside events as base64 G.711 bytes.

use base64::{engine::general_purpose::STANDARD as BASE64, DecodeError, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events this client sends to the service.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate,
}

/// The one-shot session configuration sent on connect.
#[derive(Clone, Debug, Serialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub voice: String,
    pub instructions: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub turn_detection: TurnDetection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

/// Server-side VAD parameters.
#[derive(Clone, Debug, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

/// Conversation items this client creates: only tool results.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum ConversationItem {
    #[serde(rename = "function_call_output")]
    FunctionCallOutput { call_id: String, output: String },
}

/// Events the service sends to this client.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "response.created")]
    ResponseCreated,
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        #[serde(default)]
        call_id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        #[serde(default)]
        call_id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        arguments: String,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "response.output_item.done")]
    OutputItemDone {
        #[serde(default)]
        item: Value,
    },
    #[serde(rename = "response.done")]
    ResponseDone,
    #[serde(rename = "error")]
    Error { error: ApiError },
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// Encodes raw G.711 bytes for an `input_audio_buffer.append`.
#[must_use]
pub fn encode_audio(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decodes the base64 payload of a `response.audio.delta`.
pub fn decode_audio(delta: &str) -> Result<Vec<u8>, DecodeError> {
    BASE64.decode(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_update_has_expected_shape() {
        let event = ClientEvent::SessionUpdate {
            session: SessionConfig {
                modalities: vec!["audio".into(), "text".into()],
                voice: "verse".into(),
                instructions: "Eres un asistente.".into(),
                input_audio_format: "g711_ulaw".into(),
                output_audio_format: "g711_ulaw".into(),
                turn_detection: TurnDetection {
                    kind: "server_vad".into(),
                    threshold: 0.2,
                    prefix_padding_ms: 300,
                    silence_duration_ms: 100,
                },
                tools: None,
                tool_choice: None,
            },
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["input_audio_format"], "g711_ulaw");
        assert_eq!(value["session"]["turn_detection"]["type"], "server_vad");
        assert!(value["session"].get("tools").is_none());
    }

    #[test]
    fn tools_serialize_with_auto_choice() {
        let event = ClientEvent::SessionUpdate {
            session: SessionConfig {
                modalities: vec!["audio".into(), "text".into()],
                voice: "verse".into(),
                instructions: String::new(),
                input_audio_format: "g711_ulaw".into(),
                output_audio_format: "g711_ulaw".into(),
                turn_detection: TurnDetection {
                    kind: "server_vad".into(),
                    threshold: 0.2,
                    prefix_padding_ms: 300,
                    silence_duration_ms: 100,
                },
                tools: Some(vec![json!({"type": "function", "name": "consultar_mikrotik"})]),
                tool_choice: Some("auto".into()),
            },
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["session"]["tool_choice"], "auto");
        assert_eq!(
            value["session"]["tools"][0]["name"],
            "consultar_mikrotik"
        );
    }

    #[test]
    fn function_output_round_trips_call_id() {
        let event = ClientEvent::ConversationItemCreate {
            item: ConversationItem::FunctionCallOutput {
                call_id: "call_42".into(),
                output: r#"{"success":true}"#.into(),
            },
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "conversation.item.create");
        assert_eq!(value["item"]["type"], "function_call_output");
        assert_eq!(value["item"]["call_id"], "call_42");
    }

    #[test]
    fn response_create_is_bare() {
        let value = serde_json::to_value(ClientEvent::ResponseCreate).unwrap();
        assert_eq!(value, json!({"type": "response.create"}));
    }

    #[test]
    fn decodes_audio_delta() {
        let raw = json!({
            "type": "response.audio.delta",
            "event_id": "ev_1",
            "response_id": "resp_1",
            "item_id": "item_1",
            "output_index": 0,
            "content_index": 0,
            "delta": encode_audio(&[0xFF, 0x7F, 0x00]),
        });

        let event: ServerEvent = serde_json::from_value(raw).unwrap();
        match event {
            ServerEvent::AudioDelta { delta } => {
                assert_eq!(decode_audio(&delta).unwrap(), vec![0xFF, 0x7F, 0x00]);
            },
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn decodes_function_call_events() {
        let delta: ServerEvent = serde_json::from_value(json!({
            "type": "response.function_call_arguments.delta",
            "call_id": "call_1",
            "name": "consultar_mikrotik",
            "delta": "{\"preg",
        }))
        .unwrap();

        assert!(matches!(
            delta,
            ServerEvent::FunctionCallArgumentsDelta { ref call_id, .. } if call_id == "call_1"
        ));

        let done: ServerEvent = serde_json::from_value(json!({
            "type": "response.function_call_arguments.done",
            "call_id": "call_1",
            "name": "consultar_mikrotik",
            "arguments": "{\"pregunta\":\"estado\"}",
        }))
        .unwrap();

        assert!(matches!(
            done,
            ServerEvent::FunctionCallArgumentsDone { ref arguments, .. }
                if arguments.contains("pregunta")
        ));
    }

    #[test]
    fn unknown_server_events_are_tolerated() {
        let event: ServerEvent =
            serde_json::from_value(json!({"type": "rate_limits.updated", "rate_limits": []}))
                .unwrap();
        assert!(matches!(event, ServerEvent::Unknown));
    }
}
