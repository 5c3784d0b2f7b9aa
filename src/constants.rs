//! Constants affecting bridge function and wire handling.

use std::{ops::RangeInclusive, time::Duration};

/// Sample rate of G.711 audio on the Asterisk leg.
pub const SAMPLE_RATE_RAW: usize = 8_000;

/// Number of audio frames/packets to be sent per second.
pub const AUDIO_FRAME_RATE: usize = 50;

/// Length of time between any two audio frames.
pub const TIMESTEP_LENGTH: Duration = Duration::from_millis(1000 / AUDIO_FRAME_RATE as u64);

/// Length (in milliseconds) of any audio frame.
pub const FRAME_LEN_MS: usize = 1000 / AUDIO_FRAME_RATE;

/// Number of samples (and, for G.711, bytes) in one complete frame of audio.
pub const FRAME_SIZE: usize = SAMPLE_RATE_RAW / AUDIO_FRAME_RATE;

/// Number of frames buffered before paced transmission begins.
///
/// TTS byte streams arrive in bursts; priming ~200ms of audio prevents
/// underflow during the start transient.
pub const PRIMING_FRAMES: usize = 10;

/// Bytes of caller audio accumulated before a chunk is forwarded to the
/// realtime session (~75ms, keeping added latency under 100ms while
/// reducing per-message WebSocket overhead).
pub const INGRESS_BATCH_BYTES: usize = 600;

/// Maximum datagram size read off a call's RTP socket.
///
/// G.711 frames are 172 bytes on the wire; anything larger than this is
/// not RTP traffic we care about.
pub const RTP_PACKET_MAX: usize = 1024;

/// Local UDP port range probed when binding a call's RTP endpoint.
pub const RTP_PORT_RANGE: RangeInclusive<u16> = 10_000..=20_000;

/// The one (and only) RTP version.
pub const RTP_VERSION: u8 = 2;

/// The mu-law encoding of digital silence (-0).
pub const ULAW_SILENCE: u8 = 0xFF;

/// Lowest mu-law byte value treated as near-silence when scrubbing
/// ingress frames. Low-amplitude line noise above this threshold trips
/// the server-side VAD.
pub const ULAW_NEAR_SILENCE: u8 = 0xFC;

/// Fraction of near-silent bytes above which a whole frame is replaced
/// with pure silence.
pub const SILENT_FRAME_RATIO: f32 = 0.9;

/// How long the egress scheduler waits for fresh audio before inserting
/// a silence frame to preserve timing.
pub const EGRESS_UNDERFLOW_WAIT: Duration = Duration::from_millis(500);

/// Interval between client pings on the realtime WebSocket.
///
/// Long on purpose: tool calls can hold the turn for a minute, and the
/// service tolerates quiet sockets far better than mid-call reconnects.
pub const WS_PING_INTERVAL: Duration = Duration::from_secs(90);

/// Bound on the caller->model and model->caller audio queues.
///
/// Producers block briefly when a queue is full; at 50 frames/s this is
/// several seconds of headroom.
pub const AUDIO_QUEUE_DEPTH: usize = 512;

/// Delay between reconnection attempts on the ARI event socket.
pub const ARI_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Timeout applied to every ARI REST request.
pub const ARI_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra pause imposed after Asterisk reports `Allocation failed` on an
/// origination attempt, giving the PBX time to release channels.
pub const ALLOCATION_FAILURE_PAUSE: Duration = Duration::from_secs(30);

/// Default model requested from the realtime endpoint.
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview-2024-12-17";

/// Prefix given to external-media channel ids, used to tell the media
/// pseudo-channel's `StasisStart` apart from the caller's.
pub const EXTERNAL_CHANNEL_PREFIX: &str = "external_";

/// Name prefix Asterisk gives ExternalMedia RTP channels; used by the
/// orphan sweep at teardown.
pub const UNICAST_RTP_PREFIX: &str = "UnicastRTP";
