//! Redis Streams relay between service instances
//!
//! Every event published on one instance is appended to a shared stream tagged with the
//! instance id; each instance tails the stream and delivers foreign entries to its own
//! sessions. The relay is best-effort: the ledger stays the source of truth and clients
//! close gaps with catch-up.

use crate::redis_client::RedisClient;
use crate::websocket::events::ChatEvent;
use crate::websocket::fanout::Fanout;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::{self, Duration};
use uuid::Uuid;

pub const EVENTS_STREAM_KEY: &str = "stream:conversation-events";

/// Approximate cap on retained entries; the stream is a relay, not history.
const STREAM_MAXLEN: usize = 10_000;
const READ_BLOCK_MS: usize = 5_000;
const READ_BATCH: usize = 100;

const FIELD_ORIGIN: &str = "origin";
const FIELD_EVENT: &str = "event";

/// Handle used by [`Fanout`] to push events to other instances.
#[derive(Clone)]
pub struct StreamRelay {
    tx: UnboundedSender<ChatEvent>,
}

impl StreamRelay {
    /// Spawns the writer task and returns the handle.
    pub fn start(client: RedisClient, instance_id: Uuid) -> Self {
        let (tx, rx) = unbounded_channel();
        tokio::spawn(run_writer(client, instance_id, rx));
        Self { tx }
    }

    /// Queues the event for the writer. Never blocks the publisher.
    pub fn forward(&self, event: &ChatEvent) {
        if self.tx.send(event.clone()).is_err() {
            tracing::warn!(
                event_type = event.event_type(),
                "Stream relay writer stopped, event not relayed"
            );
        }
    }
}

async fn run_writer(client: RedisClient, instance_id: Uuid, mut rx: UnboundedReceiver<ChatEvent>) {
    let mut conn = client.manager();
    let origin = instance_id.to_string();

    while let Some(event) = rx.recv().await {
        let encoded = match serde_json::to_string(&event) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode event for relay");
                continue;
            }
        };

        let result: redis::RedisResult<String> = conn
            .xadd_maxlen(
                EVENTS_STREAM_KEY,
                StreamMaxlen::Approx(STREAM_MAXLEN),
                "*",
                &[(FIELD_ORIGIN, origin.as_str()), (FIELD_EVENT, encoded.as_str())],
            )
            .await;

        if let Err(e) = result {
            tracing::warn!(
                error = %e,
                event_type = event.event_type(),
                conversation_id = ?event.conversation_id(),
                "Failed to relay event to stream"
            );
        }
    }
}

/// Tails the shared stream and delivers entries from other instances locally.
/// Starts at the stream's current end; older entries are covered by catch-up.
pub async fn start_streams_listener(client: RedisClient, fanout: Fanout, instance_id: Uuid) {
    let origin = instance_id.to_string();
    let options = StreamReadOptions::default()
        .block(READ_BLOCK_MS)
        .count(READ_BATCH);
    let mut last_id = "$".to_string();

    loop {
        let mut conn = match client.dedicated_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(error = %e, "Stream listener failed to connect, retrying");
                time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        tracing::info!(stream = EVENTS_STREAM_KEY, "Stream listener connected");

        loop {
            let read: redis::RedisResult<Option<StreamReadReply>> = conn
                .xread_options(&[EVENTS_STREAM_KEY], &[last_id.as_str()], &options)
                .await;

            let reply = match read {
                Ok(Some(reply)) => reply,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "Stream listener read failed");
                    time::sleep(Duration::from_secs(1)).await;
                    break;
                }
            };

            for entry in reply.keys.into_iter().flat_map(|key| key.ids) {
                last_id = entry.id.clone();

                let entry_origin: Option<String> = entry.get(FIELD_ORIGIN);
                if entry_origin.as_deref() == Some(origin.as_str()) {
                    continue;
                }

                let Some(raw) = entry.get::<String>(FIELD_EVENT) else {
                    tracing::warn!(entry_id = %entry.id, "Stream entry without event payload");
                    continue;
                };
                match serde_json::from_str::<ChatEvent>(&raw) {
                    Ok(event) => {
                        fanout.deliver_local(&event).await;
                    }
                    Err(e) => {
                        tracing::warn!(entry_id = %entry.id, error = %e, "Undecodable stream entry");
                    }
                }
            }
        }
    }
}
