//! One inbound call: wiring the caller's channel, the RTP endpoint, and
//! the realtime session together, and tearing all of it down again.

use crate::{
    ari::{AriClient, AriError},
    config::Config,
    constants::EXTERNAL_CHANNEL_PREFIX,
    realtime::{RealtimeError, RealtimeSession},
    rtp::{Codec, EndpointError, RtpEndpoint},
    tools::ToolSet,
};
use serde_json::json;
use std::{
    error::Error as StdError,
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Instant,
};
use tokio::spawn;
use tracing::{debug, info, instrument, warn};

/// Errors raised while setting up an inbound call.
#[derive(Debug)]
#[non_exhaustive]
pub enum CallError {
    Ari(AriError),
    Endpoint(EndpointError),
    Realtime(RealtimeError),
}

impl From<AriError> for CallError {
    fn from(e: AriError) -> Self {
        CallError::Ari(e)
    }
}

impl From<EndpointError> for CallError {
    fn from(e: EndpointError) -> Self {
        CallError::Endpoint(e)
    }
}

impl From<RealtimeError> for CallError {
    fn from(e: RealtimeError) -> Self {
        CallError::Realtime(e)
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call setup failed: ")?;
        match self {
            CallError::Ari(e) => e.fmt(f),
            CallError::Endpoint(e) => e.fmt(f),
            CallError::Realtime(e) => e.fmt(f),
        }
    }
}

impl StdError for CallError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            CallError::Ari(e) => Some(e),
            CallError::Endpoint(e) => Some(e),
            CallError::Realtime(e) => Some(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, CallError>;

/// A live bridged call.
///
/// Exclusively owns its [`RtpEndpoint`] and [`RealtimeSession`]; audio
/// moves between them over channels pumped by two forwarding tasks, so
/// neither half holds a reference to the other.
pub struct CallSession {
    channel_id: String,
    app: String,
    codec: Codec,
    local_rtp: SocketAddr,
    remote_rtp: Option<SocketAddr>,
    bridge_id: Option<String>,
    external_id: Option<String>,
    endpoint: Option<RtpEndpoint>,
    realtime: Option<RealtimeSession>,
    created_at: Instant,
    torn_down: bool,
}

impl CallSession {
    /// Builds the full media path for a caller channel that just entered
    /// the Stasis application.
    #[instrument(skip(ari, config, tools, api_key), fields(channel = %channel_id))]
    pub async fn start(
        ari: &AriClient,
        config: &Config,
        tools: Arc<ToolSet>,
        api_key: &str,
        app: &str,
        local_ip: IpAddr,
        channel_id: &str,
    ) -> Result<Self> {
        // 1-2. RTP introspection and codec detection on the caller leg.
        let rtp_info = ari.channel_rtp_info(channel_id).await;
        let codec = ari.detect_codec(channel_id).await;

        if rtp_info.remote.is_none() {
            debug!("No rtpdest on {channel_id}; remote will be learned from ingress.");
        }

        // 3. A free port for our side of the media stream.
        let mut endpoint = RtpEndpoint::bind(local_ip)
            .await?
            .packet_interval(config.packet_interval);
        let local_rtp = endpoint.local_addr();

        // 4. The ExternalMedia pseudo-channel pointing back at us.
        let external_id = format!("{EXTERNAL_CHANNEL_PREFIX}{channel_id}");
        let variables = json!({
            "CHANNEL_PURPOSE": "realtime_bridge",
            "ORIGINAL_CHANNEL_ID": channel_id,
            "RTP_REMOTE_ADDRESS": rtp_info
                .remote
                .map(|a| a.ip().to_string())
                .unwrap_or_default(),
            "RTP_REMOTE_PORT": rtp_info
                .remote
                .map(|a| a.port().to_string())
                .unwrap_or_default(),
            "PEER_IP": rtp_info.peer_ip.clone().unwrap_or_default(),
        });

        let mut session = Self {
            channel_id: channel_id.to_owned(),
            app: app.to_owned(),
            codec,
            local_rtp,
            remote_rtp: rtp_info.remote,
            bridge_id: None,
            external_id: None,
            endpoint: None,
            realtime: None,
            created_at: Instant::now(),
            torn_down: false,
        };

        let setup = async {
            ari.create_external_media(
                &external_id,
                app,
                &local_rtp.to_string(),
                codec,
                &variables,
            )
            .await?;
            session.external_id = Some(external_id.clone());

            // 5. Media can flow as soon as Asterisk dials our socket.
            endpoint.start(rtp_info.remote, codec);

            // 6. One mixing bridge holding exactly the two legs.
            let bridge_id = format!("bridge_{channel_id}");
            ari.create_bridge(&bridge_id, &format!("Realtime Bridge {channel_id}"))
                .await?;
            session.bridge_id = Some(bridge_id.clone());

            ari.add_channel(&bridge_id, channel_id).await?;
            ari.add_channel(&bridge_id, &external_id).await?;

            // 7. The model leg, wired to the endpoint by two pumps.
            let realtime = RealtimeSession::connect(config, api_key, tools).await?;

            let ingress = endpoint.ingress()?;
            let to_model = realtime.outgoing_sender();
            spawn(async move {
                while let Ok(chunk) = ingress.recv_async().await {
                    if to_model.send_async(chunk).await.is_err() {
                        break;
                    }
                }
            });

            let from_model = realtime.incoming_receiver();
            let egress = endpoint.egress_sender()?;
            let watchdog_ari = ari.clone();
            let watchdog_channel = channel_id.to_owned();
            spawn(async move {
                while let Ok(chunk) = from_model.recv_async().await {
                    if egress.send_async(chunk).await.is_err() {
                        break;
                    }
                }

                // The model leg died or was stopped. Hanging up the
                // caller hands cleanup to the normal StasisEnd path; on
                // an ordinary teardown the channel is already gone and
                // this is a no-op.
                if let Err(e) = watchdog_ari.hangup(&watchdog_channel).await {
                    debug!("Post-session hangup failed: {e}.");
                }
            });

            session.endpoint = Some(endpoint);
            session.realtime = Some(realtime);

            Ok::<(), CallError>(())
        };

        if let Err(e) = setup.await {
            warn!("Setup failed ({e}); rolling back partial call state.");
            session.stop(ari).await;
            return Err(e);
        }

        info!(
            "Call {channel_id} bridged: {codec} RTP on {local_rtp}, remote {:?}.",
            session.remote_rtp,
        );

        Ok(session)
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn local_rtp(&self) -> SocketAddr {
        self.local_rtp
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Ordered teardown: model leg, media leg, external channel, bridge,
    /// then a sweep for orphaned `UnicastRTP/*` channels.
    ///
    /// Safe to call more than once; later calls do nothing.
    #[instrument(skip(self, ari), fields(channel = %self.channel_id))]
    pub async fn stop(&mut self, ari: &AriClient) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Some(realtime) = self.realtime.take() {
            realtime.stop();
        }

        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.stop();
        }

        if let Some(external_id) = self.external_id.take() {
            if let Err(e) = ari.hangup(&external_id).await {
                debug!("External channel hangup failed: {e}.");
            }
        }

        if let Some(bridge_id) = self.bridge_id.take() {
            if let Err(e) = ari.delete_bridge(&bridge_id).await {
                warn!("Bridge delete failed: {e}.");
            }
        }

        match ari.sweep_orphan_media(&self.app).await {
            Ok(0) => {},
            Ok(n) => info!("Swept {n} orphan media channels."),
            Err(e) => debug!("Orphan sweep failed: {e}."),
        }

        info!(
            "Call {} torn down after {:.1}s.",
            self.channel_id,
            self.created_at.elapsed().as_secs_f32(),
        );
    }
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("channel_id", &self.channel_id)
            .field("codec", &self.codec)
            .field("local_rtp", &self.local_rtp)
            .field("remote_rtp", &self.remote_rtp)
            .field("bridge_id", &self.bridge_id)
            .field("torn_down", &self.torn_down)
            .finish_non_exhaustive()
    }
}
