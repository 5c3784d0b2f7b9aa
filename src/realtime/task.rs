//! The realtime session's select loop and tool workers.

use super::model::*;
use crate::{
    constants::WS_PING_INTERVAL,
    tools::ToolSet,
    ws::{ReceiverExt, SenderExt, WsStream},
};
use async_tungstenite::tungstenite::Message;
use flume::{Receiver, Sender};
use futures::SinkExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::{
    select, spawn,
    time::{sleep_until, Instant},
};
use tracing::{debug, info, instrument, trace, warn};

pub(crate) enum SessionMessage {
    Stop,
}

/// A tool result on its way back to the model.
pub(crate) struct ToolOutcome {
    call_id: String,
    output: Value,
}

/// In-flight function call being accumulated from argument deltas.
///
/// At most one exists at a time; the service streams calls serially
/// within a response.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    call_id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
struct SessionMetrics {
    chunks_sent: u64,
    bytes_sent: u64,
    chunks_received: u64,
    bytes_received: u64,
    function_calls: u64,
}

pub(crate) struct SessionTask {
    ws: WsStream,
    rx: Receiver<SessionMessage>,
    outgoing: Receiver<Vec<u8>>,
    incoming_tx: Sender<Vec<u8>>,
    /// Kept purely so barge-in can drain queued assistant audio.
    incoming_rx: Receiver<Vec<u8>>,
    tool_tx: Sender<ToolOutcome>,
    tool_rx: Receiver<ToolOutcome>,
    tools: Arc<ToolSet>,

    session_ready: bool,
    assistant_speaking: bool,
    pending_call: Option<ToolCallAccumulator>,
    metrics: SessionMetrics,
}

impl SessionTask {
    pub(crate) fn new(
        ws: WsStream,
        rx: Receiver<SessionMessage>,
        outgoing: Receiver<Vec<u8>>,
        incoming_tx: Sender<Vec<u8>>,
        incoming_rx: Receiver<Vec<u8>>,
        tools: Arc<ToolSet>,
    ) -> Self {
        let (tool_tx, tool_rx) = flume::unbounded();

        Self {
            ws,
            rx,
            outgoing,
            incoming_tx,
            incoming_rx,
            tool_tx,
            tool_rx,
            tools,
            session_ready: false,
            assistant_speaking: false,
            pending_call: None,
            metrics: SessionMetrics::default(),
        }
    }

    #[instrument(skip(self))]
    async fn run(&mut self) {
        let mut next_ping = Instant::now() + WS_PING_INTERVAL;

        loop {
            select! {
                () = sleep_until(next_ping) => {
                    // Keeps NATs and the service's idle timer satisfied
                    // while a long tool call holds the turn.
                    if let Err(e) = self.ws.send(Message::Ping(Vec::new().into())).await {
                        warn!("Realtime ping failed: {e:?}.");
                        break;
                    }
                    next_ping = Instant::now() + WS_PING_INTERVAL;
                },
                ws_msg = self.ws.recv_json_no_timeout::<ServerEvent>() => {
                    match ws_msg {
                        Ok(Some(event)) => {
                            if !self.process_event(event).await {
                                break;
                            }
                        },
                        Ok(None) => {},
                        Err(e) => {
                            // The session is scoped to one call; a dead
                            // socket tears the call down rather than
                            // reconnecting mid-conversation.
                            warn!("Realtime socket error: {e:?}.");
                            break;
                        },
                    }
                },
                audio = self.outgoing.recv_async(), if self.session_ready => {
                    match audio {
                        Ok(chunk) => {
                            if !self.append_audio(chunk).await {
                                break;
                            }
                        },
                        Err(_) => break,
                    }
                },
                outcome = self.tool_rx.recv_async() => {
                    // tool_tx lives on self, so this can't disconnect.
                    if let Ok(outcome) = outcome {
                        if !self.send_tool_result(outcome).await {
                            break;
                        }
                    }
                },
                inner_msg = self.rx.recv_async() => {
                    match inner_msg {
                        Ok(SessionMessage::Stop) | Err(flume::RecvError::Disconnected) => break,
                    }
                },
            }
        }

        info!(
            "Realtime session closing: {} chunks up ({} B), {} chunks down ({} B), {} tool calls.",
            self.metrics.chunks_sent,
            self.metrics.bytes_sent,
            self.metrics.chunks_received,
            self.metrics.bytes_received,
            self.metrics.function_calls,
        );
    }

    /// Handles one server event; returns `false` to end the session.
    async fn process_event(&mut self, event: ServerEvent) -> bool {
        match event {
            ServerEvent::SessionCreated => {
                debug!("Session created.");
            },
            ServerEvent::SessionUpdated => {
                debug!("Session configuration acknowledged; audio may flow.");
                self.session_ready = true;
            },
            ServerEvent::ResponseCreated => {
                trace!("Response started.");
            },
            ServerEvent::AudioDelta { delta } => {
                match decode_audio(&delta) {
                    Ok(audio) => {
                        self.assistant_speaking = true;
                        self.metrics.chunks_received += 1;
                        self.metrics.bytes_received += audio.len() as u64;

                        // Bounded queue: a wedged egress applies
                        // backpressure to the reader here.
                        if self.incoming_tx.send_async(audio).await.is_err() {
                            return false;
                        }
                    },
                    Err(e) => warn!("Undecodable audio delta: {e}."),
                }
            },
            ServerEvent::SpeechStarted => {
                // Barge-in: the caller is talking over the assistant, so
                // anything not yet played is stale.
                let discarded = self.incoming_rx.drain().count();
                if self.assistant_speaking {
                    debug!("Barge-in; discarded {discarded} queued audio chunks.");
                }
                self.assistant_speaking = false;
            },
            ServerEvent::SpeechStopped => {
                trace!("Speech stopped.");
            },
            ServerEvent::AudioTranscriptDone { transcript } => {
                info!("Assistant transcript: {transcript}");
            },
            ServerEvent::FunctionCallArgumentsDelta { call_id, name, delta } => {
                let call = self.pending_call.get_or_insert_with(|| {
                    info!("Function call started: {name} ({call_id}).");
                    ToolCallAccumulator {
                        call_id: call_id.clone(),
                        name: name.clone(),
                        ..Default::default()
                    }
                });
                call.arguments.push_str(&delta);
            },
            ServerEvent::FunctionCallArgumentsDone { call_id, name, arguments } => {
                self.dispatch_tool(call_id, name, arguments);
            },
            ServerEvent::OutputItemDone { item } => {
                if item["type"] == "function_call" {
                    debug!("Function call item finished: {}.", item["name"]);
                }
            },
            ServerEvent::ResponseDone => {
                trace!("Response complete.");
                self.assistant_speaking = false;
                // A call that never reached `.done` dies with the turn.
                self.pending_call = None;
            },
            ServerEvent::Error { error } => {
                warn!(
                    "Service error [{}]: {}",
                    error.code.as_deref().unwrap_or("unknown"),
                    error.message,
                );
            },
            ServerEvent::Unknown => {
                trace!("Ignoring unhandled server event.");
            },
        }

        true
    }

    async fn append_audio(&mut self, chunk: Vec<u8>) -> bool {
        self.metrics.chunks_sent += 1;
        self.metrics.bytes_sent += chunk.len() as u64;

        let event = ClientEvent::InputAudioAppend {
            audio: encode_audio(&chunk),
        };

        if let Err(e) = self.ws.send_json(&event).await {
            warn!("Failed to append caller audio: {e:?}.");
            return false;
        }

        true
    }

    /// Spawns the tool worker for a completed call.
    ///
    /// Execution happens off this task so the socket keeps servicing
    /// ping/pong during backend calls that run for tens of seconds.
    fn dispatch_tool(&mut self, call_id: String, name: String, arguments: String) {
        // The done event repeats the full argument string; prefer it,
        // falling back to whatever was accumulated.
        let raw = if arguments.is_empty() {
            self.pending_call
                .take()
                .map(|c| c.arguments)
                .unwrap_or_default()
        } else {
            self.pending_call = None;
            arguments
        };

        let parsed = serde_json::from_str::<Value>(&raw).unwrap_or_else(|e| {
            warn!("Unparseable tool arguments ({e}); substituting empty object.");
            Value::Object(Default::default())
        });

        self.metrics.function_calls += 1;

        let tools = Arc::clone(&self.tools);
        let tool_tx = self.tool_tx.clone();

        spawn(async move {
            trace!("Tool worker started for {call_id}.");
            let output = tools.dispatch(&name, parsed).await;
            drop(tool_tx.send_async(ToolOutcome { call_id, output }).await);
            trace!("Tool worker finished.");
        });
    }

    /// Returns the tool result and nudges the model to keep talking.
    async fn send_tool_result(&mut self, outcome: ToolOutcome) -> bool {
        let output = serde_json::to_string(&outcome.output)
            .unwrap_or_else(|_| r#"{"error":"unserializable result"}"#.to_owned());

        let item = ClientEvent::ConversationItemCreate {
            item: ConversationItem::FunctionCallOutput {
                call_id: outcome.call_id.clone(),
                output,
            },
        };

        if let Err(e) = self.ws.send_json(&item).await {
            warn!("Failed to send tool result: {e:?}.");
            return false;
        }

        if let Err(e) = self.ws.send_json(&ClientEvent::ResponseCreate).await {
            warn!("Failed to resume response: {e:?}.");
            return false;
        }

        debug!("Tool result delivered for {}.", outcome.call_id);
        true
    }
}

#[instrument(skip(task))]
pub(crate) async fn runner(mut task: SessionTask) {
    trace!("Realtime session task started.");
    task.run().await;
    trace!("Realtime session task finished.");
}

#[cfg(test)]
mod tests {
    use super::*;

    // The select loop itself needs a live socket; the queue and
    // accumulator behaviours are exercised directly.

    #[test]
    fn barge_in_clears_queued_audio() {
        let (tx, rx) = flume::bounded::<Vec<u8>>(64);

        for _ in 0..10 {
            tx.send(vec![0xFF; 160]).unwrap();
        }
        assert_eq!(rx.len(), 10);

        // What SpeechStarted does to the incoming queue.
        let discarded = rx.drain().count();
        assert_eq!(discarded, 10);
        assert_eq!(rx.len(), 0);

        // A later delta is unaffected.
        tx.send(vec![0x01; 160]).unwrap();
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn accumulator_concatenates_deltas() {
        let mut acc: Option<ToolCallAccumulator> = None;

        for (call_id, name, delta) in [
            ("call_7", "consultar_mikrotik", r#"{"preg"#),
            ("call_7", "", r#"unta":"#),
            ("call_7", "", r#""estado"}"#),
        ] {
            let call = acc.get_or_insert_with(|| ToolCallAccumulator {
                call_id: call_id.to_owned(),
                name: name.to_owned(),
                ..Default::default()
            });
            call.arguments.push_str(delta);
        }

        let call = acc.unwrap();
        assert_eq!(call.call_id, "call_7");
        assert_eq!(call.name, "consultar_mikrotik");

        let parsed: Value = serde_json::from_str(&call.arguments).unwrap();
        assert_eq!(parsed["pregunta"], "estado");
    }

    #[test]
    fn malformed_arguments_fall_back_to_empty_object() {
        let parsed = serde_json::from_str::<Value>("{not json")
            .unwrap_or_else(|_| Value::Object(Default::default()));
        assert_eq!(parsed, serde_json::json!({}));
    }
}
