//! Redis pub/sub-backed bus (optional).
//!
//! Pub/sub is not durable: a subscriber that is offline misses messages. Job
//! change consumers re-read the store to catch up, so that is acceptable here.

use std::marker::PhantomData;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use redis::Commands;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use tidecrm_events::{EventBus, SubscriberLiveness, Subscription};

/// Channel job change notifications are published on.
pub const DEFAULT_JOB_CHANNEL: &str = "tidecrm:jobs:changes";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// How often an idle subscription thread checks whether anyone is still listening.
const SUBSCRIBER_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to start publisher thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("publisher thread stopped")]
    PublisherStopped,
}

/// Redis pub/sub bus carrying JSON-encoded messages of type `M`.
///
/// `publish` never touches the network: payloads are queued for a dedicated
/// publisher thread that keeps one connection open, so it is safe to call
/// from async code. Clones share that thread; it exits when the last clone
/// is dropped.
pub struct RedisPubSubBus<M> {
    client: redis::Client,
    channel: String,
    outbox: mpsc::Sender<String>,
    _message: PhantomData<fn() -> M>,
}

impl<M> RedisPubSubBus<M> {
    /// Validate the URL and start the publisher thread; no connection is made
    /// until the first publish.
    pub fn new(redis_url: impl AsRef<str>, channel: impl Into<String>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())?;
        let channel = channel.into();

        let (outbox, queued) = mpsc::channel();
        let publisher = Publisher {
            client: client.clone(),
            channel: channel.clone(),
            conn: None,
        };
        thread::Builder::new()
            .name("redis-publisher".into())
            .spawn(move || publisher.run(queued))?;

        Ok(Self {
            client,
            channel,
            outbox,
            _message: PhantomData,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl<M> Clone for RedisPubSubBus<M> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            channel: self.channel.clone(),
            outbox: self.outbox.clone(),
            _message: PhantomData,
        }
    }
}

impl<M> std::fmt::Debug for RedisPubSubBus<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPubSubBus")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl<M> EventBus<M> for RedisPubSubBus<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    type Error = RedisBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&message)?;
        self.outbox
            .send(payload)
            .map_err(|_| RedisBusError::PublisherStopped)
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        let (subscription, liveness) = Subscription::tracked(rx);

        let client = self.client.clone();
        let channel = self.channel.clone();

        // Forwards pub/sub messages until the subscription is dropped or the
        // connection fails. Either way the receiver sees a disconnect.
        thread::spawn(move || forward(client, channel, tx, liveness));

        subscription
    }
}

/// Owns the long-lived publishing connection.
struct Publisher {
    client: redis::Client,
    channel: String,
    conn: Option<redis::Connection>,
}

impl Publisher {
    fn run(mut self, queued: mpsc::Receiver<String>) {
        for payload in queued {
            match self.publish(&payload) {
                Ok(receivers) => debug!(channel = %self.channel, receivers, "published"),
                Err(err) => {
                    warn!(channel = %self.channel, error = %err, "redis publish failed; message dropped");
                }
            }
        }
        debug!(channel = %self.channel, "redis publisher stopped");
    }

    /// A broken connection is replaced once before giving up on the message.
    fn publish(&mut self, payload: &str) -> redis::RedisResult<i64> {
        match self.send(payload) {
            Err(err) if err.is_connection_dropped() || err.is_io_error() => {
                debug!(channel = %self.channel, error = %err, "reconnecting redis publisher");
                self.conn = None;
                self.send(payload)
            }
            result => result,
        }
    }

    fn send(&mut self, payload: &str) -> redis::RedisResult<i64> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.client.get_connection_with_timeout(CONNECT_TIMEOUT)?,
        };
        let conn = self.conn.insert(conn);
        conn.publish(&self.channel, payload)
    }
}

fn forward<M>(client: redis::Client, channel: String, tx: mpsc::Sender<M>, liveness: SubscriberLiveness)
where
    M: DeserializeOwned,
{
    let mut conn = match client.get_connection_with_timeout(CONNECT_TIMEOUT) {
        Ok(c) => c,
        Err(err) => {
            warn!(channel = %channel, error = %err, "redis subscribe: connection failed");
            return;
        }
    };

    let mut pubsub = conn.as_pubsub();
    if let Err(err) = pubsub.set_read_timeout(Some(SUBSCRIBER_POLL)) {
        warn!(channel = %channel, error = %err, "redis subscribe: read timeout not set");
        return;
    }
    if let Err(err) = pubsub.subscribe(&channel) {
        warn!(channel = %channel, error = %err, "redis subscribe failed");
        return;
    }

    while liveness.is_subscribed() {
        let msg = match pubsub.get_message() {
            Ok(m) => m,
            Err(err) if err.is_timeout() => continue,
            Err(err) => {
                warn!(channel = %channel, error = %err, "redis subscription closed");
                return;
            }
        };

        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(_) => continue,
        };

        let message: M = match serde_json::from_str(&payload) {
            Ok(m) => m,
            Err(err) => {
                warn!(channel = %channel, error = %err, "skipping undecodable message");
                continue;
            }
        };

        if tx.send(message).is_err() {
            break;
        }
    }
    debug!(channel = %channel, "redis subscriber gone; unsubscribing");
}
