//! [`MessageStore`] backed by the Palaver log service.
//!
//! Reads and writes are plain HTTP requests. Transactions are optimistic:
//! read the value and its revision, compute locally, compare-and-set, and
//! recompute from the value returned with a 409 until the budget runs out.
//!
//! Append subscriptions share one gateway WebSocket per store, owned by a
//! background task. When the socket drops the task reconnects with
//! exponential backoff and resubscribes every channel; after the configured
//! number of failed attempts each subscription receives
//! [`AppendEvent::Dropped`].
use std::collections::HashMap;
use std::sync::OnceLock;

use futures_util::{SinkExt, StreamExt};
use reqwest::{Response, StatusCode};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use palaver_types::api::{CompareAndSetRequest, Direction, MAX_RANGE_LIMIT, RangeQuery, ValueQuery, VersionedValue, WriteRequest};
use palaver_types::events::{GatewayCommand, GatewayEvent};
use palaver_types::fields::{Fields, LogEntry};
use palaver_types::models::ChannelId;

use super::{AppendEvent, AppendSubscription, MessageStore, StorePath, SubscriptionId};
use crate::config::SyncConfig;
use crate::error::StoreError;

pub struct RemoteStore {
    http: reqwest::Client,
    base_url: Url,
    gateway_url: Url,
    config: SyncConfig,
    gateway: OnceLock<mpsc::UnboundedSender<GatewayCmd>>,
}

impl RemoteStore {
    /// `base_url` is the log service root, e.g. `http://localhost:3000`.
    pub fn new(base_url: &str, config: &SyncConfig) -> Result<Self, StoreError> {
        let base_url = Url::parse(base_url).map_err(|e| StoreError::Backend(format!("invalid base url: {e}")))?;
        let gateway_url = gateway_url(&base_url)?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| StoreError::Backend(format!("http client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            gateway_url,
            config: config.clone(),
            gateway: OnceLock::new(),
        })
    }

    /// `<base>/channels/<channel>/entries[/<key>[/<action>]]`, each segment
    /// percent-encoded.
    fn endpoint(&self, channel_id: &ChannelId, key: Option<&str>, action: Option<&str>) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| StoreError::Backend("base url cannot hold a path".into()))?;
            segments.pop_if_empty().extend(["channels", channel_id.as_str(), "entries"]);
            segments.extend(key);
            segments.extend(action);
        }
        Ok(url)
    }

    fn gateway_commands(&self) -> mpsc::UnboundedSender<GatewayCmd> {
        self.gateway
            .get_or_init(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let gateway = Gateway {
                    url: self.gateway_url.clone(),
                    config: self.config.clone(),
                    subs: HashMap::new(),
                    pending: HashMap::new(),
                };
                tokio::spawn(gateway.run(rx));
                tx
            })
            .clone()
    }

    async fn read_value(&self, path: &StorePath) -> Result<VersionedValue, StoreError> {
        let url = self.endpoint(&path.channel_id, Some(&path.key), Some("value"))?;
        let resp = self
            .http
            .get(url)
            .query(&ValueQuery { path: path.path.clone() })
            .send()
            .await
            .map_err(read_failure)?;
        let resp = success(resp, false).await?;
        resp.json().await.map_err(malformed)
    }
}

fn gateway_url(base_url: &Url) -> Result<Url, StoreError> {
    let mut url = base_url.clone();
    let scheme = match base_url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(StoreError::Backend(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| StoreError::Backend("cannot derive gateway url".into()))?;
    url.path_segments_mut()
        .map_err(|_| StoreError::Backend("base url cannot hold a path".into()))?
        .pop_if_empty()
        .push("gateway");
    Ok(url)
}

// -- Error mapping --

fn read_failure(e: reqwest::Error) -> StoreError {
    StoreError::Unreachable(e.to_string())
}

fn malformed(e: reqwest::Error) -> StoreError {
    StoreError::Malformed(e.to_string())
}

/// Only a failed connect proves a write was never delivered.
fn write_failure(e: reqwest::Error) -> StoreError {
    if e.is_connect() || e.is_builder() {
        StoreError::Unreachable(e.to_string())
    } else {
        StoreError::Ambiguous(e.to_string())
    }
}

async fn success(resp: Response, is_write: bool) -> Result<Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let detail = format!("{status}: {body}");
    Err(match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(detail),
        s if s.is_server_error() && is_write => StoreError::Ambiguous(detail),
        s if s.is_server_error() => StoreError::Unreachable(detail),
        _ => StoreError::Backend(detail),
    })
}

impl MessageStore for RemoteStore {
    async fn range_read(
        &self,
        channel_id: &ChannelId,
        bound: Option<&str>,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let query = RangeQuery {
            bound: bound.map(str::to_string),
            direction,
            limit: limit.min(MAX_RANGE_LIMIT as usize) as u32,
        };
        let url = self.endpoint(channel_id, None, None)?;
        let resp = self.http.get(url).query(&query).send().await.map_err(read_failure)?;
        let resp = success(resp, false).await?;
        resp.json().await.map_err(malformed)
    }

    async fn point_read(&self, channel_id: &ChannelId, key: &str) -> Result<Option<LogEntry>, StoreError> {
        let url = self.endpoint(channel_id, Some(key), None)?;
        let resp = self.http.get(url).send().await.map_err(read_failure)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = success(resp, false).await?;
        resp.json().await.map(Some).map_err(malformed)
    }

    async fn write(&self, channel_id: &ChannelId, key: &str, fields: Fields) -> Result<(), StoreError> {
        let url = self.endpoint(channel_id, Some(key), None)?;
        let resp = self
            .http
            .patch(url)
            .json(&WriteRequest { fields })
            .send()
            .await
            .map_err(write_failure)?;
        success(resp, true).await?;
        Ok(())
    }

    async fn subscribe_append(&self, channel_id: &ChannelId) -> Result<AppendSubscription, StoreError> {
        let commands = self.gateway_commands();
        let stopped = || StoreError::Unreachable("gateway task stopped".into());

        let id = Uuid::new_v4();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (ack_tx, ack) = oneshot::channel();
        commands
            .send(GatewayCmd::Subscribe {
                channel_id: channel_id.clone(),
                id,
                events: events_tx,
                ack: ack_tx,
            })
            .map_err(|_| stopped())?;

        // Reconnect attempts and their backoff count against the wait.
        let budget = self.config.request_timeout()
            + (1..=self.config.resubscribe_attempts)
                .map(|attempt| self.config.resubscribe_backoff(attempt) + self.config.request_timeout())
                .sum::<std::time::Duration>();
        match tokio::time::timeout(budget, ack).await {
            Ok(Ok(Ok(()))) => Ok(AppendSubscription { id, events }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(stopped()),
            Err(_) => {
                let _ = commands.send(GatewayCmd::Unsubscribe { id });
                Err(StoreError::Unreachable(format!("subscription to {channel_id} not acknowledged")))
            }
        }
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(commands) = self.gateway.get() {
            let _ = commands.send(GatewayCmd::Unsubscribe { id });
        }
    }

    async fn transact<F>(&self, path: &StorePath, update: F) -> Result<Value, StoreError>
    where
        F: Fn(Option<&Value>) -> Value + Send + Sync + 'static,
    {
        let url = self.endpoint(&path.channel_id, Some(&path.key), Some("cas"))?;
        let mut known: Option<VersionedValue> = None;

        for attempt in 1..=self.config.transact_attempts {
            let current = match known.take() {
                Some(current) => current,
                None => self.read_value(path).await?,
            };
            if current.revision == 0 {
                return Err(StoreError::NotFound(path.to_string()));
            }

            let request = CompareAndSetRequest {
                path: path.path.clone(),
                expected_revision: current.revision,
                value: update(current.value.as_ref()),
            };
            let resp = self
                .http
                .post(url.clone())
                .json(&request)
                .send()
                .await
                .map_err(write_failure)?;

            match resp.status() {
                StatusCode::OK => {
                    let committed: VersionedValue = resp
                        .json()
                        .await
                        .map_err(|e| StoreError::Ambiguous(format!("commit response unreadable: {e}")))?;
                    return Ok(committed.value.unwrap_or(Value::Null));
                }
                StatusCode::CONFLICT => {
                    debug!("Transaction on {} conflicted on attempt {}", path, attempt);
                    // A conflict body we cannot read just means re-reading.
                    known = resp.json().await.ok();
                }
                _ => {
                    success(resp, true).await?;
                }
            }
        }

        Err(StoreError::TransactionAborted {
            attempts: self.config.transact_attempts,
        })
    }
}

// -- Gateway --

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum GatewayCmd {
    Subscribe {
        channel_id: ChannelId,
        id: SubscriptionId,
        events: mpsc::UnboundedSender<AppendEvent>,
        ack: oneshot::Sender<Result<(), StoreError>>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
}

struct Subscriber {
    channel_id: ChannelId,
    events: mpsc::UnboundedSender<AppendEvent>,
}

struct Gateway {
    url: Url,
    config: SyncConfig,
    subs: HashMap<SubscriptionId, Subscriber>,
    /// Subscribe requests waiting for the server's `Subscribed`.
    pending: HashMap<ChannelId, Vec<oneshot::Sender<Result<(), StoreError>>>>,
}

impl Gateway {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<GatewayCmd>) {
        let mut socket: Option<WsStream> = None;

        loop {
            if socket.is_none() && !self.subs.is_empty() {
                socket = self.connect().await;
            }

            let Some(ws) = socket.as_mut() else {
                match commands.recv().await {
                    Some(cmd) => {
                        let _ = self.command(cmd, None).await;
                    }
                    None => return,
                }
                continue;
            };

            let mut lost = false;
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => lost = self.command(cmd, Some(ws)).await.is_err(),
                    None => {
                        let _ = ws.close(None).await;
                        return;
                    }
                },
                frame = ws.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.event(text.as_str()),
                    // Flushing sends the queued pong.
                    Some(Ok(WsMessage::Ping(_))) => lost = ws.flush().await.is_err(),
                    Some(Ok(WsMessage::Close(_))) | None => lost = true,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Gateway read failed: {}", e);
                        lost = true;
                    }
                },
            }

            if lost {
                warn!("Gateway connection lost, {} subscriptions to restore", self.subs.len());
                socket = None;
            }
        }
    }

    /// Connect and subscribe every channel, retrying with backoff. Gives up
    /// on every subscription once the attempts are spent.
    async fn connect(&mut self) -> Option<WsStream> {
        let attempts = self.config.resubscribe_attempts.max(1);
        for attempt in 1..=attempts {
            match connect_async(self.url.as_str()).await {
                Ok((mut ws, _)) => match self.resubscribe_all(&mut ws).await {
                    Ok(()) => {
                        info!("Gateway connected to {}", self.url);
                        return Some(ws);
                    }
                    Err(e) => warn!("Gateway resubscribe failed: {}", e),
                },
                Err(e) => warn!("Gateway connect attempt {}/{} failed: {}", attempt, attempts, e),
            }
            if attempt < attempts {
                self.broadcast(AppendEvent::Reconnecting { attempt });
                tokio::time::sleep(self.config.resubscribe_backoff(attempt)).await;
            }
        }
        self.give_up(format!("gateway unreachable after {attempts} attempts"));
        None
    }

    async fn resubscribe_all(&mut self, ws: &mut WsStream) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let mut channels: Vec<ChannelId> = self.subs.values().map(|s| s.channel_id.clone()).collect();
        channels.sort();
        channels.dedup();
        for channel_id in channels {
            send_command(ws, GatewayCommand::Subscribe {
                channel_id: channel_id.to_string(),
            })
            .await?;
        }
        Ok(())
    }

    /// `Err` means the socket failed and must be replaced.
    async fn command(&mut self, cmd: GatewayCmd, ws: Option<&mut WsStream>) -> Result<(), ()> {
        match cmd {
            GatewayCmd::Subscribe {
                channel_id,
                id,
                events,
                ack,
            } => {
                debug!("Subscribing {} to {}", id, channel_id);
                self.subs.insert(
                    id,
                    Subscriber {
                        channel_id: channel_id.clone(),
                        events,
                    },
                );
                self.pending.entry(channel_id.clone()).or_default().push(ack);
                // Without a socket the next connect subscribes it.
                if let Some(ws) = ws {
                    let subscribe = GatewayCommand::Subscribe {
                        channel_id: channel_id.to_string(),
                    };
                    send_command(ws, subscribe).await.map_err(|e| warn!("Gateway send failed: {}", e))?;
                }
            }
            GatewayCmd::Unsubscribe { id } => {
                let Some(sub) = self.subs.remove(&id) else {
                    return Ok(());
                };
                debug!("Unsubscribing {} from {}", id, sub.channel_id);
                let still_wanted = self.subs.values().any(|s| s.channel_id == sub.channel_id);
                if let (false, Some(ws)) = (still_wanted, ws) {
                    let unsubscribe = GatewayCommand::Unsubscribe {
                        channel_id: sub.channel_id.to_string(),
                    };
                    send_command(ws, unsubscribe).await.map_err(|e| warn!("Gateway send failed: {}", e))?;
                }
            }
        }
        Ok(())
    }

    fn event(&mut self, text: &str) {
        let event = match serde_json::from_str::<GatewayEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                warn!("Ignoring unreadable gateway frame: {}", e);
                return;
            }
        };
        match event {
            GatewayEvent::Subscribed { channel_id } => {
                let channel_id = ChannelId::new(channel_id);
                match self.pending.remove(&channel_id) {
                    Some(acks) => {
                        for ack in acks {
                            let _ = ack.send(Ok(()));
                        }
                    }
                    None => self.deliver(&channel_id, AppendEvent::Resubscribed),
                }
            }
            GatewayEvent::Unsubscribed { channel_id } => debug!("Gateway unsubscribed {}", channel_id),
            GatewayEvent::EntryAppended { channel_id, entry } => {
                self.deliver(&ChannelId::new(channel_id), AppendEvent::Appended(entry));
            }
        }
    }

    fn deliver(&mut self, channel_id: &ChannelId, event: AppendEvent) {
        self.subs
            .retain(|_, sub| &sub.channel_id != channel_id || sub.events.send(event.clone()).is_ok());
    }

    fn broadcast(&mut self, event: AppendEvent) {
        self.subs.retain(|_, sub| sub.events.send(event.clone()).is_ok());
    }

    fn give_up(&mut self, reason: String) {
        warn!("Dropping {} subscriptions: {}", self.subs.len(), reason);
        for (_, sub) in self.subs.drain() {
            let _ = sub.events.send(AppendEvent::Dropped { reason: reason.clone() });
        }
        for (_, acks) in self.pending.drain() {
            for ack in acks {
                let _ = ack.send(Err(StoreError::Unreachable(reason.clone())));
            }
        }
    }
}

async fn send_command(ws: &mut WsStream, command: GatewayCommand) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    // Serializing a two-variant enum of strings cannot fail.
    let json = serde_json::to_string(&command).unwrap_or_default();
    ws.send(WsMessage::text(json)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(base: &str) -> RemoteStore {
        RemoteStore::new(base, &SyncConfig::default()).unwrap()
    }

    #[test]
    fn endpoints_are_percent_encoded() {
        let store = store("http://localhost:3000");
        let url = store
            .endpoint(&ChannelId::new("team chat"), Some("-Nabc"), Some("cas"))
            .unwrap();
        assert_eq!(url.as_str(), "http://localhost:3000/channels/team%20chat/entries/-Nabc/cas");
    }

    #[test]
    fn gateway_follows_the_scheme_and_prefix() {
        assert_eq!(store("http://localhost:3000").gateway_url.as_str(), "ws://localhost:3000/gateway");
        assert_eq!(store("https://chat.example/api/").gateway_url.as_str(), "wss://chat.example/api/gateway");
        assert!(RemoteStore::new("ftp://x", &SyncConfig::default()).is_err());
    }

    #[tokio::test]
    async fn unreachable_service_fails_reads_definitively() {
        // Port 9 (discard) is not served in test environments.
        let store = store("http://127.0.0.1:9");
        let err = store
            .range_read(&ChannelId::new("c"), None, Direction::Backward, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unreachable(_)));
        assert_eq!(err.committed(), Some(false));
    }
}
