//! Registry of live inbound calls, driven by the ARI event socket.

use crate::{
    ari::{AriClient, AriEvent},
    call::CallSession,
    config::Config,
    constants::{EXTERNAL_CHANNEL_PREFIX, UNICAST_RTP_PREFIX},
    tools::ToolSet,
};
use dashmap::DashMap;
use std::{net::IpAddr, sync::Arc};
use tokio::{spawn, sync::Mutex};
use tracing::{debug, error, info, instrument, warn};

/// The inbound Stasis application: one [`CallSession`] per live caller
/// channel, keyed by channel id.
///
/// Session failures are isolated; a call that cannot be set up or dies
/// mid-stream never takes the event loop or other calls with it.
pub struct Bridge {
    ari: AriClient,
    config: Config,
    tools: Arc<ToolSet>,
    api_key: String,
    app: String,
    local_ip: IpAddr,
    sessions: DashMap<String, Arc<Mutex<CallSession>>>,
}

impl Bridge {
    pub fn new(
        ari: AriClient,
        config: Config,
        tools: ToolSet,
        api_key: String,
        app: String,
        local_ip: IpAddr,
    ) -> Arc<Self> {
        Arc::new(Self {
            ari,
            config,
            tools: Arc::new(tools),
            api_key,
            app,
            local_ip,
            sessions: DashMap::new(),
        })
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Consumes ARI events until the subscription ends.
    #[instrument(skip_all, fields(app = %self.app))]
    pub async fn run(self: &Arc<Self>) {
        let subscription = self.ari.events(&self.app);
        let events = subscription.events();

        info!("Inbound bridge listening for {} events.", self.app);

        while let Ok(event) = events.recv_async().await {
            match event {
                AriEvent::StasisStart { channel } => self.on_stasis_start(channel.id),
                AriEvent::StasisEnd { channel } => self.on_stasis_end(channel.id).await,
                AriEvent::ChannelDestroyed { channel, cause_txt, .. } => {
                    debug!(
                        "Channel {} destroyed ({}).",
                        channel.id,
                        cause_txt.unwrap_or_default(),
                    );
                },
                other => debug!("Ignoring event: {other:?}."),
            }
        }

        info!("Inbound bridge event stream ended.");
    }

    /// Spawns call setup for a new caller channel.
    fn on_stasis_start(self: &Arc<Self>, channel_id: String) {
        // The ExternalMedia leg re-enters Stasis under its own id; only
        // the caller's channel anchors a session.
        if channel_id.starts_with(EXTERNAL_CHANNEL_PREFIX)
            || channel_id.starts_with(UNICAST_RTP_PREFIX)
        {
            debug!("Skipping StasisStart for media channel {channel_id}.");
            return;
        }

        if self.sessions.contains_key(&channel_id) {
            warn!("Duplicate StasisStart for {channel_id}; ignoring.");
            return;
        }

        info!("New call on channel {channel_id}.");

        let this = Arc::clone(self);
        spawn(async move {
            let session = CallSession::start(
                &this.ari,
                &this.config,
                Arc::clone(&this.tools),
                &this.api_key,
                &this.app,
                this.local_ip,
                &channel_id,
            )
            .await;

            match session {
                Ok(session) => {
                    this.sessions
                        .insert(channel_id, Arc::new(Mutex::new(session)));
                },
                Err(e) => {
                    // Partial state was already rolled back by start().
                    error!("Call setup for {channel_id} failed: {e}.");
                },
            }
        });
    }

    /// Tears down the session owning a departed caller channel.
    async fn on_stasis_end(&self, channel_id: String) {
        let Some((_, session)) = self.sessions.remove(&channel_id) else {
            debug!("StasisEnd for unknown channel {channel_id}.");
            return;
        };

        info!("Call ended on channel {channel_id}.");
        session.lock().await.stop(&self.ari).await;
    }

    /// Tears down every live session (shutdown path).
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();

        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.lock().await.stop(&self.ari).await;
            }
        }
    }
}
