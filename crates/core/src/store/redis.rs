//! Redis-backed shared store.

use async_trait::async_trait;
use fred::clients::{Client, SubscriberClient};
use fred::interfaces::{
    ClientLike, EventInterface, KeysInterface, LuaInterface, PubsubInterface, SetsInterface,
    SortedSetsInterface,
};
use fred::types::Expiration;
use fred::types::config::Config as RedisConfig;
use tidings_common::{AppError, AppResult};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{SessionTransition, SharedStore, SlidingWindowOutcome, keys};

const CHANNEL_CAPACITY: usize = 1024;

/// KEYS[1] counter, ARGV[1] delta. Returns nil when the key is absent.
const ADJUST_IF_EXISTS: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return false
end
local v = redis.call('INCRBY', KEYS[1], ARGV[1])
if v < 0 then
  redis.call('SET', KEYS[1], 0, 'KEEPTTL')
  v = 0
end
return v
";

/// KEYS[1] counter, ARGV[1] ttl seconds.
const INCR_WITH_EXPIRY: &str = r"
local v = redis.call('INCR', KEYS[1])
if v == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return v
";

/// KEYS[1] log, ARGV: now ms, window ms, max, member.
/// Returns {allowed, count, oldest} with oldest = -1 for an empty log.
const SLIDING_WINDOW: &str = r"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
local allowed = 0
if count < max then
  redis.call('ZADD', KEYS[1], now, ARGV[4])
  count = count + 1
  allowed = 1
end
redis.call('PEXPIRE', KEYS[1], window)
local oldest = -1
local first = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if first[2] then
  oldest = tonumber(first[2])
end
return {allowed, count, oldest}
";

/// KEYS: sessions, online set, version. ARGV: session, user id.
/// Returns {changed, sessions, version}.
const OPEN_SESSION: &str = r"
local changed = redis.call('SADD', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[2], ARGV[2])
local version
if changed == 1 then
  version = redis.call('INCR', KEYS[3])
else
  version = tonumber(redis.call('GET', KEYS[3]) or '0')
end
return {changed, redis.call('SCARD', KEYS[1]), version}
";

/// KEYS: sessions, online set, version. ARGV: session, user id.
/// Returns {changed, sessions, version}.
const CLOSE_SESSION: &str = r"
local changed = redis.call('SREM', KEYS[1], ARGV[1])
local sessions = redis.call('SCARD', KEYS[1])
if sessions == 0 then
  redis.call('DEL', KEYS[1])
  redis.call('SREM', KEYS[2], ARGV[2])
end
local version
if changed == 1 then
  version = redis.call('INCR', KEYS[3])
else
  version = tonumber(redis.call('GET', KEYS[3]) or '0')
end
return {changed, sessions, version}
";

fn cache_err(e: fred::error::Error) -> AppError {
    AppError::CacheUnavailable(e.to_string())
}

/// Shared store backed by Redis.
///
/// Keys are namespaced with the configured prefix. Pub/Sub channels are
/// global so every process on the same Redis sees them.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    subscriber: SubscriberClient,
    prefix: String,
}

impl RedisStore {
    /// Connect the command and subscriber clients.
    pub async fn connect(url: &str, prefix: &str) -> AppResult<Self> {
        let config = RedisConfig::from_url(url).map_err(cache_err)?;

        let client = Client::new(config.clone(), None, None, None);
        client.init().await.map_err(cache_err)?;

        let subscriber = SubscriberClient::new(config, None, None, None);
        subscriber.init().await.map_err(cache_err)?;

        info!(prefix, "Redis shared store connected");

        Ok(Self {
            client,
            subscriber,
            prefix: prefix.to_string(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    async fn session_script(
        &self,
        script: &str,
        user_id: &str,
        session: &str,
    ) -> AppResult<SessionTransition> {
        let reply: Vec<i64> = self
            .client
            .eval(
                script,
                vec![
                    self.key(&keys::sessions(user_id)),
                    self.key(keys::ONLINE_USERS),
                    self.key(&keys::presence_version(user_id)),
                ],
                vec![session.to_string(), user_id.to_string()],
            )
            .await
            .map_err(cache_err)?;

        match reply.as_slice() {
            [changed, sessions, version] => Ok(SessionTransition {
                changed: *changed == 1,
                sessions: u64::try_from(*sessions).unwrap_or(0),
                version: u64::try_from(*version).unwrap_or(0),
            }),
            other => Err(AppError::CacheUnavailable(format!(
                "unexpected session reply: {other:?}"
            ))),
        }
    }

    /// Close both connections.
    pub async fn quit(&self) {
        if let Err(e) = self.subscriber.quit().await {
            warn!(error = %e, "Failed to close Redis subscriber");
        }
        if let Err(e) = self.client.quit().await {
            warn!(error = %e, "Failed to close Redis client");
        }
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        self.client.get(self.key(key)).await.map_err(cache_err)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> AppResult<()> {
        let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
        self.client
            .set::<(), _, _>(self.key(key), value, Some(Expiration::EX(ttl)), None, false)
            .await
            .map_err(cache_err)
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.client
            .del::<i64, _>(self.key(key))
            .await
            .map(|_| ())
            .map_err(cache_err)
    }

    async fn adjust_if_exists(&self, key: &str, delta: i64) -> AppResult<Option<i64>> {
        self.client
            .eval(ADJUST_IF_EXISTS, vec![self.key(key)], vec![delta.to_string()])
            .await
            .map_err(cache_err)
    }

    async fn incr_with_expiry(&self, key: &str, ttl_secs: u64) -> AppResult<i64> {
        self.client
            .eval(INCR_WITH_EXPIRY, vec![self.key(key)], vec![ttl_secs.to_string()])
            .await
            .map_err(cache_err)
    }

    async fn sliding_window(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_ms: i64,
        max: u64,
    ) -> AppResult<SlidingWindowOutcome> {
        let reply: Vec<i64> = self
            .client
            .eval(
                SLIDING_WINDOW,
                vec![self.key(key)],
                vec![
                    now_ms.to_string(),
                    window_ms.to_string(),
                    max.to_string(),
                    member.to_string(),
                ],
            )
            .await
            .map_err(cache_err)?;

        match reply.as_slice() {
            [allowed, count, oldest] => Ok(SlidingWindowOutcome {
                allowed: *allowed == 1,
                count: u64::try_from(*count).unwrap_or(0),
                oldest_ms: (*oldest >= 0).then_some(*oldest),
            }),
            other => Err(AppError::CacheUnavailable(format!(
                "unexpected sliding window reply: {other:?}"
            ))),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> AppResult<()> {
        self.client
            .zadd::<i64, _, _>(self.key(key), None, None, false, false, (score as f64, member))
            .await
            .map(|_| ())
            .map_err(cache_err)
    }

    async fn zrem(&self, key: &str, member: &str) -> AppResult<()> {
        self.client
            .zrem::<i64, _, _>(self.key(key), member)
            .await
            .map(|_| ())
            .map_err(cache_err)
    }

    async fn zrange(&self, key: &str) -> AppResult<Vec<String>> {
        self.client
            .zrange(self.key(key), 0_i64, -1_i64, None, false, None, false)
            .await
            .map_err(cache_err)
    }

    async fn open_session(&self, user_id: &str, session: &str) -> AppResult<SessionTransition> {
        self.session_script(OPEN_SESSION, user_id, session).await
    }

    async fn close_session(
        &self,
        user_id: &str,
        session: &str,
    ) -> AppResult<SessionTransition> {
        self.session_script(CLOSE_SESSION, user_id, session).await
    }

    async fn sismember(&self, key: &str, member: &str) -> AppResult<bool> {
        self.client
            .sismember(self.key(key), member)
            .await
            .map_err(cache_err)
    }

    async fn publish(&self, channel: &str, payload: &str) -> AppResult<()> {
        self.client
            .publish::<i64, _, _>(channel, payload)
            .await
            .map(|_| ())
            .map_err(cache_err)
    }

    async fn subscribe(&self, channel: &str) -> AppResult<broadcast::Receiver<String>> {
        self.subscriber.subscribe(channel).await.map_err(cache_err)?;

        let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
        let mut messages = self.subscriber.message_rx();
        let wanted = channel.to_string();

        tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(message) => {
                        if *message.channel != *wanted {
                            continue;
                        }
                        if let Some(payload) = message.value.as_string() {
                            if tx.send(payload).is_err() {
                                debug!(channel = %wanted, "No local receivers left");
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %wanted, skipped, "Pub/Sub receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            info!(channel = %wanted, "Pub/Sub message stream ended");
        });

        Ok(rx)
    }
}
