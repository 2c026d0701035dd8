use std::collections::BTreeSet;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::{Notification, Store, StoreError, StoreResult, Subscription};

const SCAN_BATCH: u32 = 100;

/// Redis-backed store shared by participants in different processes.
///
/// Values live in plain keys. Each write runs as a `MULTI` pipeline that
/// updates the key and `PUBLISH`es the new value (JSON-encoded, `null` for a
/// removal) on a channel named after the key, which is what subscriptions
/// listen to.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = Client::open(redis_url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(unavailable)?;
        debug!(%redis_url, "connected to redis store");
        Ok(Self { client, conn })
    }

    async fn write(&self, key: &str, value: Notification) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(&value).map_err(|err| StoreError::Rejected {
            key: key.to_string(),
            reason: err.to_string(),
        })?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        match &value {
            Some(value) => pipe.set(key, value).ignore(),
            None => pipe.del(key).ignore(),
        };
        pipe.publish(key, payload)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|err| write_error(key, err))
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<String>>(key).await.map_err(unavailable)
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        trace!(%key, "redis store set");
        self.write(key, Some(value)).await
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        trace!(%key, "redis store remove");
        self.write(key, None).await
    }

    async fn subscribe(&self, key: &str) -> StoreResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(unavailable)?;
        pubsub.subscribe(key).await.map_err(unavailable)?;

        // Read only after the channel is live so no write falls in between;
        // a write racing this GET may be observed twice.
        let mut conn = self.conn.clone();
        let current: Option<String> = conn.get(key).await.map_err(unavailable)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(current);

        let channel = key.to_string();
        let forwarder = tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    message = messages.next() => {
                        let Some(message) = message else {
                            warn!(key = %channel, "redis subscription ended");
                            break;
                        };
                        let payload: String = match message.get_payload() {
                            Ok(payload) => payload,
                            Err(err) => {
                                warn!(key = %channel, error = %err, "unreadable pub/sub payload");
                                continue;
                            }
                        };
                        match serde_json::from_str::<Notification>(&payload) {
                            Ok(value) => {
                                if tx.send(value).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(key = %channel, error = %err, "foreign message on store channel");
                            }
                        }
                    }
                }
            }
        });

        Ok(Subscription::with_forwarder(key, rx, forwarder))
    }

    async fn scan(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        // SCAN may repeat keys across batches.
        let mut keys = BTreeSet::new();
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            keys.extend(batch);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = keys.into_iter().collect();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|value| (key, value)))
            .collect())
    }
}

fn unavailable(err: RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn write_error(key: &str, err: RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        unavailable(err)
    } else {
        StoreError::Rejected {
            key: key.to_string(),
            reason: err.to_string(),
        }
    }
}
