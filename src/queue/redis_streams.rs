// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Streams queue backend.
//!
//! # Key Layout
//!
//! For a queue `q` under prefix `p`:
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `p:q:open` | stream | captured events not yet ticked |
//! | `p:q:events` | stream | ticked events, fields `tick`, `id`, `event` |
//! | `p:q:ticks` | zset | every tick, scored by itself |
//! | `p:q:ranges` | hash | tick → `"<first-id> <last-id>"` in `events` |
//! | `p:q:event_seq` / `p:q:tick_seq` | string | id counters |
//! | `p:q:owner:<group>` | string | name of the group's active consumer |
//! | `p:q:consumers` | set | registered consumer names |
//! | `p:q:consumer:<name>` | hash | `group`, `last_tick`, flags, handoff |
//!
//! Every state change runs as one Lua script, so the registry moves
//! atomically even with several engines sharing the server. The ack
//! script also trims `events`, `ticks` and `ranges` below the lowest tick
//! acked by every active consumer; it derives consumer keys from the
//! prefix, so the queue's keys must live on one node.

use super::{BoxFuture, ConsumerInfo, Handoff, QueueService, ReassignOutcome};
use crate::error::{ReplicationError, Result};
use crate::event::{Batch, Event};
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::store::now_ms;
use redis::aio::ConnectionManager;
use redis::streams::StreamRangeReply;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const ENQUEUE_SCRIPT: &str = r#"
local ids = {}
for i, payload in ipairs(ARGV) do
  local id = redis.call('INCR', KEYS[2])
  redis.call('XADD', KEYS[1], '*', 'id', id, 'event', payload)
  ids[i] = id
end
return ids
"#;

const TICK_SCRIPT: &str = r#"
local entries = redis.call('XRANGE', KEYS[1], '-', '+')
if #entries == 0 and ARGV[1] == '1' then
  return -1
end
local tick = redis.call('INCR', KEYS[5])
local first = ''
local last = ''
for _, entry in ipairs(entries) do
  local f = entry[2]
  local id = redis.call('XADD', KEYS[2], '*', 'tick', tick, f[1], f[2], f[3], f[4])
  if first == '' then first = id end
  last = id
end
redis.call('DEL', KEYS[1])
redis.call('ZADD', KEYS[3], tick, tick)
redis.call('HSET', KEYS[4], tick, first .. ' ' .. last)
return tick
"#;

const REGISTER_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 1 then
  return 0
end
local last = ARGV[2]
if last == '' then
  last = redis.call('GET', KEYS[4]) or '0'
end
redis.call('HSET', KEYS[2], 'group', ARGV[4], 'last_tick', last, 'pause_requested', '0',
  'paused', '0', 'updated_at', ARGV[3])
redis.call('SADD', KEYS[1], ARGV[1])
redis.call('SET', KEYS[3], ARGV[1], 'NX')
return 1
"#;

const UNREGISTER_SCRIPT: &str = r#"
local removed = redis.call('DEL', KEYS[2])
redis.call('SREM', KEYS[1], ARGV[1])
if redis.call('GET', KEYS[3]) == ARGV[1] then
  redis.call('DEL', KEYS[3])
end
return removed
"#;

const ACK_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 0 then
  return 'UNKNOWN'
end
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 'NOT_OWNER'
end
local last = tonumber(redis.call('HGET', KEYS[2], 'last_tick'))
if tonumber(ARGV[2]) > last then
  last = tonumber(ARGV[2])
end
redis.call('HSET', KEYS[2], 'last_tick', last, 'updated_at', ARGV[3])

local floor = nil
for _, name in ipairs(redis.call('SMEMBERS', KEYS[3])) do
  local ckey = ARGV[4] .. ':consumer:' .. name
  local group = redis.call('HGET', ckey, 'group') or name
  if redis.call('GET', ARGV[4] .. ':owner:' .. group) == name then
    local t = tonumber(redis.call('HGET', ckey, 'last_tick') or '0')
    if floor == nil or t < floor then
      floor = t
    end
  end
end
if floor == nil then
  return 'OK'
end
local minid = nil
for _, tick in ipairs(redis.call('ZRANGEBYSCORE', KEYS[5], '-inf', floor)) do
  local range = redis.call('HGET', KEYS[6], tick)
  if range then
    local last_id = string.match(range, ' (%S+)$')
    if last_id then
      local ms, seq = string.match(last_id, '^(%d+)-(%d+)$')
      if ms then
        minid = ms .. '-' .. (tonumber(seq) + 1)
      end
    end
    redis.call('HDEL', KEYS[6], tick)
  end
end
if minid then
  redis.call('XTRIM', KEYS[4], 'MINID', minid)
end
redis.call('ZREMRANGEBYSCORE', KEYS[5], '-inf', '(' .. floor)
return 'OK'
"#;

const SET_PAUSE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 'UNKNOWN'
end
if ARGV[1] == '1' then
  redis.call('HSET', KEYS[1], 'pause_requested', '1', 'updated_at', ARGV[2])
else
  redis.call('HSET', KEYS[1], 'pause_requested', '0', 'paused', '0', 'updated_at', ARGV[2])
  redis.call('HDEL', KEYS[1], 'handoff', 'handoff_tick')
end
return 'OK'
"#;

const CONFIRM_PAUSE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 'UNKNOWN'
end
if redis.call('HGET', KEYS[1], 'pause_requested') ~= '1' then
  return 'NO_PAUSE'
end
local last = tonumber(redis.call('HGET', KEYS[1], 'last_tick'))
local handoff_tick = tonumber(ARGV[1])
if handoff_tick > last then
  last = handoff_tick
end
redis.call('HSET', KEYS[1], 'paused', '1', 'last_tick', last, 'handoff_tick', ARGV[1],
  'handoff', ARGV[2], 'updated_at', ARGV[3])
return 'OK'
"#;

const REASSIGN_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[3]) == 0 then
  return {'UNKNOWN', ARGV[2]}
end
if redis.call('EXISTS', KEYS[2]) == 0 then
  return {'UNKNOWN', ARGV[1]}
end
if (redis.call('HGET', KEYS[3], 'group') or ARGV[2]) ~= ARGV[4] then
  return {'GROUP_MISMATCH', ARGV[2]}
end
local owner = redis.call('GET', KEYS[1])
if owner == ARGV[2] then
  return {'ALREADY', ''}
end
if owner ~= ARGV[1] then
  return {'NOT_OWNER', ARGV[1]}
end
local handoff = redis.call('HGET', KEYS[2], 'handoff')
if redis.call('HGET', KEYS[2], 'paused') ~= '1' or not handoff then
  return {'NOT_PAUSED', ARGV[1]}
end
local tick = redis.call('HGET', KEYS[2], 'handoff_tick')
redis.call('SET', KEYS[1], ARGV[2])
redis.call('HSET', KEYS[3], 'last_tick', tick, 'pause_requested', '0', 'paused', '0',
  'updated_at', ARGV[3])
redis.call('HDEL', KEYS[3], 'handoff', 'handoff_tick')
return {'OK', handoff}
"#;

const DEAD_REASSIGN_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[3]) == 0 then
  return {'UNKNOWN', ARGV[2]}
end
if redis.call('EXISTS', KEYS[2]) == 0 then
  return {'UNKNOWN', ARGV[1]}
end
if (redis.call('HGET', KEYS[3], 'group') or ARGV[2]) ~= ARGV[4] then
  return {'GROUP_MISMATCH', ARGV[2]}
end
local owner = redis.call('GET', KEYS[1])
if owner == ARGV[2] then
  return {'ALREADY', ''}
end
if owner ~= ARGV[1] then
  return {'NOT_OWNER', ARGV[1]}
end
if tonumber(redis.call('HGET', KEYS[2], 'updated_at') or '0') >= tonumber(ARGV[5]) then
  return {'ALIVE', ARGV[1]}
end
local tick = redis.call('HGET', KEYS[2], 'last_tick') or '0'
local handoff = redis.call('HGET', KEYS[2], 'handoff')
if redis.call('HGET', KEYS[2], 'paused') == '1' and handoff then
  tick = redis.call('HGET', KEYS[2], 'handoff_tick')
else
  handoff = ''
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('HSET', KEYS[2], 'pause_requested', '0', 'paused', '0')
redis.call('HDEL', KEYS[2], 'handoff', 'handoff_tick')
redis.call('HSET', KEYS[3], 'last_tick', tick, 'pause_requested', '0', 'paused', '0',
  'updated_at', ARGV[3])
redis.call('HDEL', KEYS[3], 'handoff', 'handoff_tick')
return {'OK', handoff, tick}
"#;

/// Connection settings for [`RedisQueue`].
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    pub url: String,
    /// Prepended to every key, e.g. `"cascade"`.
    pub key_prefix: String,
    pub retry: RetryConfig,
}

impl RedisQueueConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: "cascade".to_string(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

struct Keys {
    base: String,
}

impl Keys {
    fn new(prefix: &str, queue: &str) -> Self {
        Self {
            base: format!("{}:{}", prefix, queue),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.base, suffix)
    }

    fn consumer(&self, name: &str) -> String {
        format!("{}:consumer:{}", self.base, name)
    }

    fn owner(&self, group: &str) -> String {
        format!("{}:owner:{}", self.base, group)
    }
}

/// Queue service on a Redis server.
///
/// Producers call [`enqueue`](Self::enqueue) and [`tick`](Self::tick);
/// consumers use the [`QueueService`] surface.
pub struct RedisQueue {
    config: RedisQueueConfig,
    conn: ConnectionManager,
    enqueue: Script,
    tick: Script,
    register: Script,
    unregister: Script,
    ack: Script,
    set_pause: Script,
    confirm_pause: Script,
    reassign: Script,
    dead_reassign: Script,
}

impl RedisQueue {
    /// Connect with the retry schedule of `config.retry`.
    pub async fn connect(config: RedisQueueConfig) -> Result<Self> {
        info!(url = %config.url, prefix = %config.key_prefix, "Connecting to Redis queue");

        let client = Client::open(config.url.as_str())
            .map_err(|e| ReplicationError::Config(format!("Invalid Redis URL: {}", e)))?;

        let retry = &config.retry;
        let mut attempt = 0;

        let conn = loop {
            attempt += 1;
            let failure = match timeout(retry.connection_timeout, client.get_connection_manager()).await {
                Ok(Ok(conn)) => {
                    info!(attempt, "Connected to Redis queue");
                    break conn;
                }
                Ok(Err(e)) => ReplicationError::redis("connect", e),
                Err(_) => ReplicationError::redis_msg(
                    "connect",
                    format!("attempt timed out after {}ms", retry.connection_timeout.as_millis()),
                ),
            };
            if !retry.should_retry(attempt) {
                error!(attempt, error = %failure, "Giving up on Redis queue");
                return Err(failure);
            }
            let delay = retry.delay_after(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Redis connect failed, retrying"
            );
            tokio::time::sleep(delay).await;
        };

        Ok(Self {
            config,
            conn,
            enqueue: Script::new(ENQUEUE_SCRIPT),
            tick: Script::new(TICK_SCRIPT),
            register: Script::new(REGISTER_SCRIPT),
            unregister: Script::new(UNREGISTER_SCRIPT),
            ack: Script::new(ACK_SCRIPT),
            set_pause: Script::new(SET_PAUSE_SCRIPT),
            confirm_pause: Script::new(CONFIRM_PAUSE_SCRIPT),
            reassign: Script::new(REASSIGN_SCRIPT),
            dead_reassign: Script::new(DEAD_REASSIGN_SCRIPT),
        })
    }

    pub fn config(&self) -> &RedisQueueConfig {
        &self.config
    }

    fn keys(&self, queue: &str) -> Keys {
        Keys::new(&self.config.key_prefix, queue)
    }

    /// Append events to the open (unticked) set of `queue`.
    pub async fn enqueue(&self, queue: &str, events: &[Event]) -> Result<Vec<i64>> {
        let keys = self.keys(queue);
        let mut invocation = self.enqueue.key(keys.key("open"));
        invocation.key(keys.key("event_seq"));
        for event in events {
            invocation.arg(serde_json::to_string(event)?);
        }
        let mut conn = self.conn.clone();
        let ids: Vec<i64> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ReplicationError::redis("enqueue", e))?;
        Ok(ids)
    }

    /// Close the open set into a new tick, even if it is empty.
    pub async fn tick(&self, queue: &str) -> Result<i64> {
        let tick_id = self.run_tick(queue, false).await?;
        debug!(queue, tick_id, "Ticked Redis queue");
        Ok(tick_id)
    }

    /// Tick only if events are waiting.
    pub async fn tick_if_pending(&self, queue: &str) -> Result<Option<i64>> {
        let tick_id = self.run_tick(queue, true).await?;
        Ok((tick_id > 0).then_some(tick_id))
    }

    async fn run_tick(&self, queue: &str, only_if_pending: bool) -> Result<i64> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        self.tick
            .key(keys.key("open"))
            .key(keys.key("events"))
            .key(keys.key("ticks"))
            .key(keys.key("ranges"))
            .key(keys.key("tick_seq"))
            .arg(if only_if_pending { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ReplicationError::redis("tick", e))
    }

    async fn fetch_batch(&self, queue: &str, after_tick: i64) -> Result<Option<Batch>> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();

        let next: Vec<i64> = redis::cmd("ZRANGEBYSCORE")
            .arg(keys.key("ticks"))
            .arg(format!("({}", after_tick))
            .arg("+inf")
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| ReplicationError::redis("ZRANGEBYSCORE", e))?;
        let Some(&tick_id) = next.first() else {
            return Ok(None);
        };

        let prev: Vec<i64> = redis::cmd("ZREVRANGEBYSCORE")
            .arg(keys.key("ticks"))
            .arg(format!("({}", tick_id))
            .arg("-inf")
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| ReplicationError::redis("ZREVRANGEBYSCORE", e))?;
        let prev_tick_id = prev.first().copied().unwrap_or(0);

        let range: Option<String> = conn
            .hget(keys.key("ranges"), tick_id)
            .await
            .map_err(|e| ReplicationError::redis("HGET", e))?;
        let events = match range.as_deref().and_then(|r| r.split_once(' ')) {
            Some((first, last)) if !first.is_empty() => {
                let reply: StreamRangeReply = conn
                    .xrange(keys.key("events"), first, last)
                    .await
                    .map_err(|e| ReplicationError::redis("XRANGE", e))?;
                reply
                    .ids
                    .iter()
                    .map(|entry| parse_entry(queue, &entry.id, &entry.map))
                    .collect::<Result<Vec<_>>>()?
            }
            _ => Vec::new(),
        };

        Ok(Some(Batch::new(tick_id, prev_tick_id, tick_id, events)))
    }

    async fn load_consumer(&self, queue: &str, consumer: &str) -> Result<Option<ConsumerInfo>> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(keys.consumer(consumer))
            .await
            .map_err(|e| ReplicationError::redis("HGETALL", e))?;
        if fields.is_empty() {
            return Ok(None);
        }
        let group = fields.get("group").map_or(consumer, String::as_str);
        let owner: Option<String> = conn
            .get(keys.owner(group))
            .await
            .map_err(|e| ReplicationError::redis("GET", e))?;
        consumer_from_fields(queue, consumer, owner.as_deref(), &fields).map(Some)
    }

    /// Group of a registered consumer; fixed at registration.
    async fn consumer_group(&self, queue: &str, consumer: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(self.keys(queue).consumer(consumer))
            .await
            .map_err(|e| ReplicationError::redis("HGETALL", e))?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            fields
                .get("group")
                .cloned()
                .unwrap_or_else(|| consumer.to_string()),
        ))
    }

    async fn require_group(&self, queue: &str, consumer: &str) -> Result<String> {
        self.consumer_group(queue, consumer)
            .await?
            .ok_or_else(|| ReplicationError::UnknownConsumer {
                queue: queue.to_string(),
                consumer: consumer.to_string(),
            })
    }

    async fn update_pause(&self, queue: &str, consumer: &str, requested: bool) -> Result<()> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let status: String = self
            .set_pause
            .key(keys.consumer(consumer))
            .arg(if requested { "1" } else { "0" })
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ReplicationError::redis("pause", e))?;
        check_status(queue, consumer, &status)
    }

    async fn run_ack(&self, queue: &str, consumer: &str, tick_id: i64) -> Result<()> {
        let group = self.require_group(queue, consumer).await?;
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let status: String = self
            .ack
            .key(keys.owner(&group))
            .key(keys.consumer(consumer))
            .key(keys.key("consumers"))
            .key(keys.key("events"))
            .key(keys.key("ticks"))
            .key(keys.key("ranges"))
            .arg(consumer)
            .arg(tick_id)
            .arg(now_ms())
            .arg(&keys.base)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ReplicationError::redis("ack", e))?;
        check_status(queue, consumer, &status)
    }

    async fn run_register(
        &self,
        queue: &str,
        consumer: &str,
        group: &str,
        start_tick: Option<i64>,
    ) -> Result<ConsumerInfo> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let created: i64 = self
            .register
            .key(keys.key("consumers"))
            .key(keys.consumer(consumer))
            .key(keys.owner(group))
            .key(keys.key("tick_seq"))
            .arg(consumer)
            .arg(start_tick.map(|t| t.to_string()).unwrap_or_default())
            .arg(now_ms())
            .arg(group)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ReplicationError::redis("register_consumer", e))?;
        let info = self
            .load_consumer(queue, consumer)
            .await?
            .ok_or_else(|| ReplicationError::Internal(format!("consumer {} vanished", consumer)))?;
        if created == 1 {
            info!(queue, consumer, group, last_tick = info.last_tick, active = info.active, "Registered consumer");
        }
        Ok(info)
    }

    async fn run_unregister(&self, queue: &str, consumer: &str) -> Result<bool> {
        let Some(group) = self.consumer_group(queue, consumer).await? else {
            return Ok(false);
        };
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .unregister
            .key(keys.key("consumers"))
            .key(keys.consumer(consumer))
            .key(keys.owner(&group))
            .arg(consumer)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ReplicationError::redis("unregister_consumer", e))?;
        Ok(removed > 0)
    }

    async fn list_consumers(&self, queue: &str) -> Result<Vec<ConsumerInfo>> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = conn
            .smembers(keys.key("consumers"))
            .await
            .map_err(|e| ReplicationError::redis("SMEMBERS", e))?;
        names.sort();
        let mut infos = Vec::with_capacity(names.len());
        for name in names {
            if let Some(info) = self.load_consumer(queue, &name).await? {
                infos.push(info);
            }
        }
        Ok(infos)
    }

    async fn load_head(&self, queue: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        conn.get(self.keys(queue).key("tick_seq"))
            .await
            .map_err(|e| ReplicationError::redis("GET", e))
    }

    async fn run_confirm_pause(&self, queue: &str, consumer: &str, handoff: &Handoff) -> Result<()> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let status: String = self
            .confirm_pause
            .key(keys.consumer(consumer))
            .arg(handoff.last_tick)
            .arg(serde_json::to_string(handoff)?)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ReplicationError::redis("confirm_pause", e))?;
        check_status(queue, consumer, &status)
    }

    async fn run_reassign(&self, queue: &str, from: &str, to: &str) -> Result<ReassignOutcome> {
        let group = self.require_group(queue, from).await?;
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let reply: Vec<String> = self
            .reassign
            .key(keys.owner(&group))
            .key(keys.consumer(from))
            .key(keys.consumer(to))
            .arg(from)
            .arg(to)
            .arg(now_ms())
            .arg(&group)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ReplicationError::redis("reassign_consumer", e))?;
        let (status, payload) = match reply.as_slice() {
            [status, payload] => (status.as_str(), payload.as_str()),
            _ => {
                return Err(ReplicationError::redis_msg(
                    "reassign_consumer",
                    format!("unexpected reply {:?}", reply),
                ))
            }
        };
        match status {
            "OK" => {
                let handoff: Handoff = serde_json::from_str(payload)?;
                info!(queue, from, to, last_tick = handoff.last_tick, "Reassigned queue consumer");
                Ok(ReassignOutcome::Reassigned { handoff })
            }
            "ALREADY" => Ok(ReassignOutcome::AlreadyAssigned),
            other => check_status(queue, payload, other).map(|_| ReassignOutcome::AlreadyAssigned),
        }
    }

    async fn run_dead_reassign(
        &self,
        queue: &str,
        from: &str,
        to: &str,
        silent_before: i64,
    ) -> Result<ReassignOutcome> {
        let group = self.require_group(queue, from).await?;
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let reply: Vec<String> = self
            .dead_reassign
            .key(keys.owner(&group))
            .key(keys.consumer(from))
            .key(keys.consumer(to))
            .arg(from)
            .arg(to)
            .arg(now_ms())
            .arg(&group)
            .arg(silent_before)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ReplicationError::redis("reassign_dead_consumer", e))?;
        let handoff = match reply.as_slice() {
            [status, payload, tick] if status == "OK" => dead_handoff(payload, tick)?,
            [status, _] if status == "ALREADY" => return Ok(ReassignOutcome::AlreadyAssigned),
            [status, _] if status == "ALIVE" => {
                return Err(ReplicationError::InvalidState {
                    expected: format!("{} silent since before {}", from, silent_before),
                    actual: "still heard from".to_string(),
                })
            }
            [status, payload] => {
                return check_status(queue, payload, status).map(|_| ReassignOutcome::AlreadyAssigned)
            }
            _ => {
                return Err(ReplicationError::redis_msg(
                    "reassign_dead_consumer",
                    format!("unexpected reply {:?}", reply),
                ))
            }
        };
        info!(queue, from, to, last_tick = handoff.last_tick, "Reassigned queue from dead consumer");
        Ok(ReassignOutcome::Reassigned { handoff })
    }
}

fn parse_entry(queue: &str, stream_id: &str, fields: &HashMap<String, redis::Value>) -> Result<Event> {
    let field = |name: &str| -> Result<String> {
        fields
            .get(name)
            .and_then(|v| redis::from_redis_value::<String>(v).ok())
            .ok_or_else(|| {
                metrics::record_queue_parse_error(queue);
                ReplicationError::redis_msg(
                    "XRANGE",
                    format!("entry {} missing field {}", stream_id, name),
                )
            })
    };
    let parse_id = |name: &str| -> Result<i64> {
        field(name)?.parse::<i64>().map_err(|e| {
            ReplicationError::redis_msg("XRANGE", format!("entry {} bad {}: {}", stream_id, name, e))
        })
    };

    let mut event: Event = serde_json::from_str(&field("event")?)?;
    event.event_id = parse_id("id")?;
    event.tick_id = parse_id("tick")?;
    Ok(event)
}

fn consumer_from_fields(
    queue: &str,
    consumer: &str,
    owner: Option<&str>,
    fields: &HashMap<String, String>,
) -> Result<ConsumerInfo> {
    let int = |name: &str| -> i64 {
        fields
            .get(name)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
    };
    let flag = |name: &str| fields.get(name).map(String::as_str) == Some("1");
    let handoff = fields
        .get("handoff")
        .map(|h| serde_json::from_str::<Handoff>(h))
        .transpose()?;
    Ok(ConsumerInfo {
        queue: queue.to_string(),
        consumer: consumer.to_string(),
        group: fields
            .get("group")
            .cloned()
            .unwrap_or_else(|| consumer.to_string()),
        last_tick: int("last_tick"),
        active: owner == Some(consumer),
        pause_requested: flag("pause_requested"),
        paused: flag("paused"),
        handoff,
        updated_at: int("updated_at"),
    })
}

/// Handoff of a dead owner: its published one, or just its last ack.
fn dead_handoff(payload: &str, tick: &str) -> Result<Handoff> {
    if !payload.is_empty() {
        return Ok(serde_json::from_str(payload)?);
    }
    let last_tick = tick.parse::<i64>().map_err(|e| {
        ReplicationError::redis_msg("reassign_dead_consumer", format!("bad last_tick {:?}: {}", tick, e))
    })?;
    Ok(Handoff {
        last_tick,
        tables: Vec::new(),
    })
}

fn check_status(queue: &str, consumer: &str, status: &str) -> Result<()> {
    match status {
        "OK" => Ok(()),
        "UNKNOWN" => Err(ReplicationError::UnknownConsumer {
            queue: queue.to_string(),
            consumer: consumer.to_string(),
        }),
        "NOT_OWNER" => Err(ReplicationError::NotOwner {
            queue: queue.to_string(),
            consumer: consumer.to_string(),
        }),
        "NO_PAUSE" => Err(ReplicationError::InvalidState {
            expected: format!("pause requested for {}", consumer),
            actual: "no pause request".to_string(),
        }),
        "NOT_PAUSED" => Err(ReplicationError::InvalidState {
            expected: format!("{} paused with handoff", consumer),
            actual: "not paused".to_string(),
        }),
        "GROUP_MISMATCH" => Err(ReplicationError::Topology(format!(
            "{} is not in the owner's consumer group on {}",
            consumer, queue
        ))),
        other => Err(ReplicationError::redis_msg(
            "script",
            format!("unexpected status {}", other),
        )),
    }
}

impl QueueService for RedisQueue {
    fn name(&self) -> &str {
        "redis"
    }

    fn next_batch<'a>(&'a self, queue: &'a str, after_tick: i64) -> BoxFuture<'a, Option<Batch>> {
        Box::pin(self.fetch_batch(queue, after_tick))
    }

    fn ack<'a>(&'a self, queue: &'a str, consumer: &'a str, tick_id: i64) -> BoxFuture<'a, ()> {
        Box::pin(self.run_ack(queue, consumer, tick_id))
    }

    fn register_consumer<'a>(
        &'a self,
        queue: &'a str,
        consumer: &'a str,
        group: &'a str,
        start_tick: Option<i64>,
    ) -> BoxFuture<'a, ConsumerInfo> {
        Box::pin(self.run_register(queue, consumer, group, start_tick))
    }

    fn unregister_consumer<'a>(&'a self, queue: &'a str, consumer: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(self.run_unregister(queue, consumer))
    }

    fn consumer_info<'a>(
        &'a self,
        queue: &'a str,
        consumer: &'a str,
    ) -> BoxFuture<'a, Option<ConsumerInfo>> {
        Box::pin(self.load_consumer(queue, consumer))
    }

    fn consumers<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Vec<ConsumerInfo>> {
        Box::pin(self.list_consumers(queue))
    }

    fn head_tick<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Option<i64>> {
        Box::pin(self.load_head(queue))
    }

    fn request_pause<'a>(&'a self, queue: &'a str, consumer: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.update_pause(queue, consumer, true))
    }

    fn resume<'a>(&'a self, queue: &'a str, consumer: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.update_pause(queue, consumer, false))
    }

    fn confirm_pause<'a>(
        &'a self,
        queue: &'a str,
        consumer: &'a str,
        handoff: &'a Handoff,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.run_confirm_pause(queue, consumer, handoff))
    }

    fn reassign_consumer<'a>(
        &'a self,
        queue: &'a str,
        from: &'a str,
        to: &'a str,
    ) -> BoxFuture<'a, ReassignOutcome> {
        Box::pin(self.run_reassign(queue, from, to))
    }

    fn reassign_dead_consumer<'a>(
        &'a self,
        queue: &'a str,
        from: &'a str,
        to: &'a str,
        silent_before: i64,
    ) -> BoxFuture<'a, ReassignOutcome> {
        Box::pin(self.run_dead_reassign(queue, from, to, silent_before))
    }
}
