//! Full-duplex session against the OpenAI Realtime API.
//!
//! One WebSocket, one task: the task's select loop reads server events,
//! pumps caller audio up once the session is acknowledged, and forwards
//! tool results produced by detached worker tasks. Audio crosses the
//! session boundary on bounded byte-chunk channels, so the endpoint and
//! the session never hold references to each other.

pub mod model;
mod task;

use crate::{
    config::Config,
    constants::AUDIO_QUEUE_DEPTH,
    tools::ToolSet,
    ws::{self, Error as WsError, SenderExt},
};
use flume::{Receiver, Sender};
use model::{ClientEvent, SessionConfig, TurnDetection};
use std::{error::Error as StdError, fmt, sync::Arc, time::Duration};
use tokio::{spawn, time::timeout};
use tracing::{info, instrument};

/// Errors raised while establishing a realtime session.
#[derive(Debug)]
#[non_exhaustive]
pub enum RealtimeError {
    Ws(WsError),
    /// The WebSocket handshake did not complete in time.
    TimedOut,
}

impl From<WsError> for RealtimeError {
    fn from(e: WsError) -> Self {
        RealtimeError::Ws(e)
    }
}

impl fmt::Display for RealtimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to open realtime session: ")?;
        match self {
            RealtimeError::Ws(e) => write!(f, "websocket issue ({e:?})"),
            RealtimeError::TimedOut => write!(f, "connection attempt timed out"),
        }
    }
}

impl StdError for RealtimeError {}

pub type Result<T> = std::result::Result<T, RealtimeError>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to a live realtime session.
///
/// Dropping the handle (or calling [`stop`]) ends the task and closes
/// the socket; the session is never reconnected within a call.
///
/// [`stop`]: RealtimeSession::stop
pub struct RealtimeSession {
    outgoing_tx: Sender<Vec<u8>>,
    incoming_rx: Receiver<Vec<u8>>,
    control: Sender<task::SessionMessage>,
}

impl RealtimeSession {
    /// Connects, configures the session, and spawns its task.
    #[instrument(skip_all)]
    pub async fn connect(config: &Config, api_key: &str, tools: Arc<ToolSet>) -> Result<Self> {
        let url = format!(
            "{}?model={}",
            config.realtime_endpoint.trim_end_matches('/'),
            config.realtime_model
        );

        let headers = [
            ("authorization", format!("Bearer {api_key}")),
            ("openai-beta", "realtime=v1".to_owned()),
        ];

        let mut client = timeout(CONNECT_TIMEOUT, ws::connect(&url, &headers))
            .await
            .map_err(|_| RealtimeError::TimedOut)??;

        // Configure before anything else flows; audio is held back until
        // the matching `session.updated` arrives.
        client
            .send_json(&ClientEvent::SessionUpdate {
                session: session_config(config, &tools),
            })
            .await?;

        info!("Realtime session configured (model {}).", config.realtime_model);

        let (outgoing_tx, outgoing_rx) = flume::bounded(AUDIO_QUEUE_DEPTH);
        let (incoming_tx, incoming_rx) = flume::bounded(AUDIO_QUEUE_DEPTH);
        let (control_tx, control_rx) = flume::unbounded();

        let session_task = task::SessionTask::new(
            client,
            control_rx,
            outgoing_rx,
            incoming_tx,
            incoming_rx.clone(),
            tools,
        );

        spawn(task::runner(session_task));

        Ok(Self {
            outgoing_tx,
            incoming_rx,
            control: control_tx,
        })
    }

    /// Sender for caller audio chunks (raw G.711 bytes).
    pub fn outgoing_sender(&self) -> Sender<Vec<u8>> {
        self.outgoing_tx.clone()
    }

    /// Receiver of synthesized assistant audio (raw G.711 bytes).
    pub fn incoming_receiver(&self) -> Receiver<Vec<u8>> {
        self.incoming_rx.clone()
    }

    /// Ends the session task. Idempotent.
    pub fn stop(&self) {
        drop(self.control.send(task::SessionMessage::Stop));
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn session_config(config: &Config, tools: &ToolSet) -> SessionConfig {
    let (tool_defs, tool_choice) = if tools.is_empty() {
        (None, None)
    } else {
        (Some(tools.definitions()), Some("auto".to_owned()))
    };

    SessionConfig {
        modalities: vec!["audio".into(), "text".into()],
        voice: config.voice.clone(),
        instructions: config.instructions.clone(),
        input_audio_format: "g711_ulaw".into(),
        output_audio_format: "g711_ulaw".into(),
        turn_detection: TurnDetection {
            kind: "server_vad".into(),
            threshold: config.vad_threshold,
            prefix_padding_ms: config.vad_prefix_padding_ms,
            silence_duration_ms: config.vad_silence_duration_ms,
        },
        tools: tool_defs,
        tool_choice,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_schema_only_sent_when_tools_exist() {
        let config = Config::default();

        let bare = session_config(&config, &ToolSet::new());
        assert!(bare.tools.is_none());
        assert!(bare.tool_choice.is_none());

        let with = session_config(
            &config,
            &ToolSet::new().with(Arc::new(crate::tools::NetInfoTool::new(
                crate::tools::NetInfoClient::new("http://127.0.0.1:1/").unwrap(),
            ))),
        );
        assert_eq!(with.tools.as_ref().unwrap().len(), 1);
        assert_eq!(with.tool_choice.as_deref(), Some("auto"));
    }

    #[test]
    fn session_defaults_use_g711() {
        let config = Config::default();
        let session = session_config(&config, &ToolSet::new());

        assert_eq!(session.input_audio_format, "g711_ulaw");
        assert_eq!(session.output_audio_format, "g711_ulaw");
        assert_eq!(session.turn_detection.kind, "server_vad");
    }
}
