//! Long-lived subscriber for the ARI event socket.
//!
//! The socket is resilient by reconnection, not by resumption: after a
//! drop the runner waits out the retry policy and dials again. Events
//! raised by Asterisk inside that window are lost, which the callers
//! tolerate.

use super::{events::AriEvent, retry::Retry};
use crate::ws::{self, Error as WsError, ReceiverExt};
use flume::{Receiver, Sender};
use tokio::{spawn, time::sleep};
use tracing::{info, instrument, trace, warn};
use url::Url;

/// A running subscription to one Stasis application's events.
pub struct EventSubscription {
    rx: Receiver<AriEvent>,
    stop: Sender<()>,
}

impl EventSubscription {
    /// The stream of decoded events. Ends once [`stop`] is called or
    /// the retry policy gives up.
    ///
    /// [`stop`]: EventSubscription::stop
    pub fn events(&self) -> Receiver<AriEvent> {
        self.rx.clone()
    }

    /// Ends the subscription. Idempotent.
    pub fn stop(&self) {
        drop(self.stop.try_send(()));
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) fn subscribe(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    app: &str,
    retry: Retry,
) -> EventSubscription {
    let (tx, rx) = flume::unbounded();
    let (stop_tx, stop_rx) = flume::bounded(1);

    let url = event_url(host, port, username, password, app);

    spawn(runner(url, tx, stop_rx, retry));

    EventSubscription { rx, stop: stop_tx }
}

fn event_url(host: &str, port: u16, username: &str, password: &str, app: &str) -> String {
    let mut url = Url::parse(&format!("ws://{host}:{port}/ari/events"))
        .expect("Static event URL shape is always parseable.");

    url.query_pairs_mut()
        .append_pair("api_key", &format!("{username}:{password}"))
        .append_pair("app", app);

    url.into()
}

#[instrument(skip_all)]
async fn runner(url: String, tx: Sender<AriEvent>, stop: Receiver<()>, retry: Retry) {
    trace!("ARI event task started.");

    let mut attempts = 0;

    'reconnect: loop {
        let mut client = tokio::select! {
            connected = ws::connect(&url, &[]) => match connected {
                Ok(client) => client,
                Err(e) => {
                    warn!("ARI event socket connect failed: {e:?}.");
                    if !wait_out_retry(&retry, &mut attempts, &stop).await {
                        break 'reconnect;
                    }
                    continue 'reconnect;
                },
            },
            _ = stop.recv_async() => break 'reconnect,
        };

        info!("ARI event socket connected.");
        attempts = 0;

        loop {
            tokio::select! {
                event = client.recv_json_no_timeout::<AriEvent>() => match event {
                    Ok(Some(event)) => {
                        if tx.send_async(event).await.is_err() {
                            break 'reconnect;
                        }
                    },
                    // Undecodable messages are skipped inside recv_json.
                    Ok(None) => {},
                    Err(WsError::WsClosed(frame)) => {
                        warn!("ARI event socket closed ({frame:?}); reconnecting.");
                        break;
                    },
                    Err(e) => {
                        warn!("ARI event socket error: {e:?}; reconnecting.");
                        break;
                    },
                },
                _ = stop.recv_async() => break 'reconnect,
            }
        }

        if !wait_out_retry(&retry, &mut attempts, &stop).await {
            break 'reconnect;
        }
    }

    trace!("ARI event task stopped.");
}

/// Sleeps out the next retry delay. Returns `false` when the policy is
/// exhausted or a stop arrives mid-wait.
async fn wait_out_retry(retry: &Retry, attempts: &mut usize, stop: &Receiver<()>) -> bool {
    let Some(wait) = retry.retry_in(*attempts) else {
        warn!("ARI event socket retry limit reached; giving up.");
        return false;
    };

    *attempts += 1;

    tokio::select! {
        () = sleep(wait) => true,
        _ = stop.recv_async() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_url_carries_credentials_and_app() {
        let url = event_url("pbx.local", 8088, "ari-user", "s3cret", "openai-app");
        let parsed = Url::parse(&url).unwrap();

        assert_eq!(parsed.scheme(), "ws");
        assert_eq!(parsed.path(), "/ari/events");

        let pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("api_key".into(), "ari-user:s3cret".into())));
        assert!(pairs.contains(&("app".into(), "openai-app".into())));
    }

    #[test]
    fn event_url_escapes_awkward_passwords() {
        let url = event_url("pbx.local", 8088, "user", "p a&s=s", "app");
        let parsed = Url::parse(&url).unwrap();

        let api_key = parsed
            .query_pairs()
            .find(|(k, _)| k == "api_key")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        assert_eq!(api_key, "user:p a&s=s");
    }
}
