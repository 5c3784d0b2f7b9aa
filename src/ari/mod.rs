//! Client for the Asterisk REST Interface: a Basic-auth HTTP wrapper
//! plus a long-lived event WebSocket subscriber.

mod events;
mod retry;
pub(crate) mod ws;

pub use self::{
    events::{AriEvent, CallerId, Channel, DialInfo, Dialplan, Playback},
    ws::EventSubscription,
};

use self::retry::Retry;

use crate::{constants::*, rtp::Codec};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    error::Error as StdError,
    fmt,
    net::SocketAddr,
    sync::Arc,
};
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Errors from ARI REST operations.
#[derive(Debug)]
#[non_exhaustive]
pub enum AriError {
    /// Asterisk could not allocate a channel for an origination; the
    /// caller must pause before retrying.
    AllocationFailed,
    Http(reqwest::Error),
    Json(serde_json::Error),
    /// A non-success status with the response body for diagnostics.
    UnexpectedStatus(StatusCode, String),
    Url(url::ParseError),
}

impl From<reqwest::Error> for AriError {
    fn from(e: reqwest::Error) -> Self {
        AriError::Http(e)
    }
}

impl From<serde_json::Error> for AriError {
    fn from(e: serde_json::Error) -> Self {
        AriError::Json(e)
    }
}

impl From<url::ParseError> for AriError {
    fn from(e: url::ParseError) -> Self {
        AriError::Url(e)
    }
}

impl fmt::Display for AriError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ARI request failed: ")?;
        match self {
            AriError::AllocationFailed => write!(f, "channel allocation failed"),
            AriError::Http(e) => e.fmt(f),
            AriError::Json(e) => e.fmt(f),
            AriError::UnexpectedStatus(status, body) => {
                write!(f, "unexpected status {status} ({body})")
            },
            AriError::Url(e) => e.fmt(f),
        }
    }
}

impl StdError for AriError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            AriError::Http(e) => Some(e),
            AriError::Json(e) => Some(e),
            AriError::Url(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AriError>;

/// RTP introspection variables collected from a channel, best-effort.
#[derive(Clone, Debug, Default)]
pub struct RtpInfo {
    /// Parsed `CHANNEL(rtpdest)`, the address Asterisk sends media to.
    pub remote: Option<SocketAddr>,
    pub peer_ip: Option<String>,
    /// Every raw variable that was present, keyed by short name.
    pub raw: HashMap<&'static str, String>,
}

/// Process-wide client for one Asterisk's control surface.
///
/// Cheap to clone; per-call state never lives here.
#[derive(Clone)]
pub struct AriClient {
    http: reqwest::Client,
    base: Arc<Url>,
    username: Arc<str>,
    password: Arc<str>,
}

impl AriClient {
    /// Creates a client for `http://host:port/ari`.
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Result<Self> {
        let base = Url::parse(&format!("http://{host}:{port}/ari/"))?;

        let http = reqwest::Client::builder()
            .timeout(ARI_HTTP_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base: Arc::new(base),
            username: Arc::from(username),
            password: Arc::from(password),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    /// Subscribes to the event socket for the given Stasis application,
    /// reconnecting on a fixed 5s delay forever.
    ///
    /// Events raised during a reconnect window are lost.
    pub fn events(&self, app: &str) -> EventSubscription {
        let host = self.base.host_str().unwrap_or("localhost");
        let port = self.base.port_or_known_default().unwrap_or(8088);

        ws::subscribe(
            host,
            port,
            &self.username,
            &self.password,
            app,
            Retry::default(),
        )
    }

    /// Originates a call, returning the new channel id.
    #[instrument(skip(self, variables))]
    pub async fn originate(
        &self,
        endpoint: &str,
        app: &str,
        caller_id: &str,
        variables: &Value,
    ) -> Result<String> {
        let body = json!({
            "endpoint": endpoint,
            "app": app,
            "callerId": caller_id,
            "variables": variables,
        });

        let response = self
            .http
            .post(self.url("channels")?)
            .basic_auth(&*self.username, Some(&*self.password))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            if text.contains("Allocation failed") {
                return Err(AriError::AllocationFailed);
            }
            return Err(AriError::UnexpectedStatus(status, text));
        }

        let channel: Value = serde_json::from_str(&text)?;
        let id = channel["id"]
            .as_str()
            .ok_or_else(|| AriError::UnexpectedStatus(status, text.clone()))?
            .to_owned();

        info!("Originated {endpoint} as channel {id}.");
        Ok(id)
    }

    /// Creates an ExternalMedia channel shipping RTP to `external_host`.
    #[instrument(skip(self, variables))]
    pub async fn create_external_media(
        &self,
        channel_id: &str,
        app: &str,
        external_host: &str,
        codec: Codec,
        variables: &Value,
    ) -> Result<String> {
        let body = json!({
            "app": app,
            "channelId": channel_id,
            "external_host": external_host,
            "format": codec.as_str(),
            "encapsulation": "rtp",
            "transport": "udp",
            "connection_type": "client",
            "variables": variables,
        });

        let response = self
            .http
            .post(self.url("channels/externalMedia")?)
            .basic_auth(&*self.username, Some(&*self.password))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AriError::UnexpectedStatus(status, response.text().await?));
        }

        info!("External media channel {channel_id} created at {external_host}.");
        Ok(channel_id.to_owned())
    }

    /// Creates a mixing bridge with the given id.
    #[instrument(skip(self))]
    pub async fn create_bridge(&self, bridge_id: &str, name: &str) -> Result<String> {
        let body = json!({
            "type": "mixing",
            "bridgeId": bridge_id,
            "name": name,
        });

        let response = self
            .http
            .post(self.url("bridges")?)
            .basic_auth(&*self.username, Some(&*self.password))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        // Asterisk answers 200 with the resource, or 204.
        if !status.is_success() {
            return Err(AriError::UnexpectedStatus(status, response.text().await?));
        }

        Ok(bridge_id.to_owned())
    }

    /// Adds a channel to a bridge. Both 200 and 204 count as success.
    #[instrument(skip(self))]
    pub async fn add_channel(&self, bridge_id: &str, channel_id: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("bridges/{bridge_id}/addChannel"))?)
            .basic_auth(&*self.username, Some(&*self.password))
            .json(&json!({ "channel": channel_id }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AriError::UnexpectedStatus(status, response.text().await?));
        }

        Ok(())
    }

    /// Starts playback of `media` (e.g. `sound:<name>`) on a channel,
    /// returning the playback id. Asterisk answers 201 Created.
    #[instrument(skip(self))]
    pub async fn play(&self, channel_id: &str, media: &str) -> Result<String> {
        let response = self
            .http
            .post(self.url(&format!("channels/{channel_id}/play"))?)
            .basic_auth(&*self.username, Some(&*self.password))
            .json(&json!({ "media": media }))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(AriError::UnexpectedStatus(status, text));
        }

        let playback: Value = serde_json::from_str(&text)?;
        playback["id"]
            .as_str()
            .map(str::to_owned)
            .ok_or(AriError::UnexpectedStatus(status, text))
    }

    /// Fetches a channel resource.
    pub async fn get_channel(&self, channel_id: &str) -> Result<Channel> {
        let response = self
            .http
            .get(self.url(&format!("channels/{channel_id}"))?)
            .basic_auth(&*self.username, Some(&*self.password))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AriError::UnexpectedStatus(status, response.text().await?));
        }

        Ok(response.json().await?)
    }

    /// Lists every channel known to Asterisk.
    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        let response = self
            .http
            .get(self.url("channels")?)
            .basic_auth(&*self.username, Some(&*self.password))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AriError::UnexpectedStatus(status, response.text().await?));
        }

        Ok(response.json().await?)
    }

    /// Fetches one playback resource, or `None` if it no longer exists.
    pub async fn get_playback(&self, playback_id: &str) -> Result<Option<Playback>> {
        let response = self
            .http
            .get(self.url(&format!("playbacks/{playback_id}"))?)
            .basic_auth(&*self.username, Some(&*self.password))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(AriError::UnexpectedStatus(status, response.text().await?));
        }

        Ok(Some(response.json().await?))
    }

    /// Reads one channel variable; missing variables are not errors.
    pub async fn get_channel_var(&self, channel_id: &str, name: &str) -> Result<Option<String>> {
        let mut url = self.url(&format!("channels/{channel_id}/variable"))?;
        url.query_pairs_mut().append_pair("variable", name);

        let response = self
            .http
            .get(url)
            .basic_auth(&*self.username, Some(&*self.password))
            .send()
            .await?;

        if !response.status().is_success() {
            // Unset and unknown variables surface as errors from ARI;
            // introspection is best-effort.
            return Ok(None);
        }

        let body: Value = response.json().await?;
        Ok(body["value"]
            .as_str()
            .filter(|v| !v.is_empty())
            .map(str::to_owned))
    }

    /// Collects the RTP introspection variables for a channel.
    #[instrument(skip(self))]
    pub async fn channel_rtp_info(&self, channel_id: &str) -> RtpInfo {
        const VARIABLES: &[(&str, &str)] = &[
            ("CHANNEL(rtp,remote_address)", "remote_address"),
            ("CHANNEL(rtp,remote_port)", "remote_port"),
            ("CHANNEL(peerip)", "peer_ip"),
            ("CHANNEL(rtpaddress)", "rtp_address"),
            ("CHANNEL(rtpdest)", "rtp_dest"),
            ("CHANNEL(rtpsource)", "rtp_source"),
            ("CHANNEL(rtp,destport)", "dest_port"),
            ("CHANNEL(rtp,port)", "local_port"),
            ("CHANNEL(rtp,srcport)", "src_port"),
        ];

        let mut info = RtpInfo::default();

        for (variable, key) in VARIABLES {
            match self.get_channel_var(channel_id, variable).await {
                Ok(Some(value)) => {
                    info.raw.insert(*key, value);
                },
                Ok(None) => {},
                Err(e) => debug!("Variable {variable} unavailable: {e}."),
            }
        }

        if let Some(dest) = info.raw.get("rtp_dest") {
            match dest.parse::<SocketAddr>() {
                Ok(addr) => info.remote = Some(addr),
                Err(e) => warn!("Unparseable rtpdest {dest:?}: {e}."),
            }
        }

        info.peer_ip = info.raw.get("peer_ip").cloned();
        info
    }

    /// Probes a channel's configured audio format, defaulting to mu-law.
    #[instrument(skip(self))]
    pub async fn detect_codec(&self, channel_id: &str) -> Codec {
        const PROBES: &[&str] = &[
            "CHANNEL(audioreadformat)",
            "CHANNEL(audiowriteformat)",
            "CHANNEL(format)",
        ];

        for variable in PROBES {
            if let Ok(Some(value)) = self.get_channel_var(channel_id, variable).await {
                if let Some(codec) = Codec::from_format(&value) {
                    debug!("Codec {codec} detected from {variable}.");
                    return codec;
                }
            }
        }

        debug!("No codec variable set on {channel_id}; assuming mu-law.");
        Codec::Ulaw
    }

    /// Hangs up a channel. A channel that is already gone is not an error.
    #[instrument(skip(self))]
    pub async fn hangup(&self, channel_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("channels/{channel_id}"))?)
            .basic_auth(&*self.username, Some(&*self.password))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(AriError::UnexpectedStatus(status, response.text().await?))
        }
    }

    /// Deletes a bridge. 200, 204, and 404 all count as done.
    #[instrument(skip(self))]
    pub async fn delete_bridge(&self, bridge_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("bridges/{bridge_id}"))?)
            .basic_auth(&*self.username, Some(&*self.password))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(AriError::UnexpectedStatus(status, response.text().await?))
        }
    }

    /// Force-hangs any `UnicastRTP/*` channel still parked in `app`.
    ///
    /// ExternalMedia channels occasionally outlive their call; this runs
    /// at teardown so they don't accumulate.
    #[instrument(skip(self))]
    pub async fn sweep_orphan_media(&self, app: &str) -> Result<usize> {
        let mut swept = 0;

        for channel in self.list_channels().await? {
            if channel.is_unicast_rtp_for(app) {
                match self.hangup(&channel.id).await {
                    Ok(()) => {
                        info!("Orphan media channel {} hung up.", channel.id);
                        swept += 1;
                    },
                    Err(e) => debug!("Orphan sweep of {} failed: {e}.", channel.id),
                }
            }
        }

        Ok(swept)
    }
}

impl fmt::Debug for AriClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AriClient")
            .field("base", &self.base.as_str())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}
