//! Redis 在线记录存储
//!
//! 每个用户对应一个有序集合 `<prefix><user_id>`：成员是连接 ID，分值是该连接的过期时间（毫秒）。
//! 分值不晚于 Redis 当前时间的成员视为已过期，每次读写前先清理。
//! 键本身的 TTL 跟随最近一次写入，最后一条连接过期后整个键自动消失。
//! 所有判断在 Lua 脚本里原子完成，时间取自 Redis 的 `TIME`，多个网关节点之间不依赖本地时钟。

use std::time::Duration;

use application::{ConnectionId, PresenceError, PresenceStore};
use async_trait::async_trait;
use domain::UserId;
use redis::aio::ConnectionManager;
use redis::Script;

use crate::messaging::error::presence_error;

pub const DEFAULT_KEY_PREFIX: &str = "presence:";

const NOW_MS: &str = r"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now)
";

/// 返回 1 表示写入前没有存活的连接
const MARK_ONLINE: &str = r"
local ttl = tonumber(ARGV[2])
local before = redis.call('ZCARD', KEYS[1])
redis.call('ZADD', KEYS[1], now + ttl, ARGV[1])
redis.call('PEXPIRE', KEYS[1], ttl)
if before == 0 then return 1 end
return 0
";

/// 返回 1 表示续期成功，连接记录不存在时不写入
const EXTEND: &str = r"
local ttl = tonumber(ARGV[2])
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then return 0 end
redis.call('ZADD', KEYS[1], now + ttl, ARGV[1])
redis.call('PEXPIRE', KEYS[1], ttl)
return 1
";

/// 返回 1 表示删除后没有存活的连接
const MARK_OFFLINE: &str = r"
redis.call('ZREM', KEYS[1], ARGV[1])
if redis.call('ZCARD', KEYS[1]) == 0 then
  redis.call('DEL', KEYS[1])
  return 1
end
return 0
";

const IS_ONLINE: &str = r"
return redis.call('ZCARD', KEYS[1])
";

#[derive(Clone)]
struct Scripts {
    mark_online: Script,
    extend: Script,
    mark_offline: Script,
    is_online: Script,
}

impl Scripts {
    fn new() -> Self {
        let with_clock = |body: &str| Script::new(&format!("{NOW_MS}{body}"));
        Self {
            mark_online: with_clock(MARK_ONLINE),
            extend: with_clock(EXTEND),
            mark_offline: with_clock(MARK_OFFLINE),
            is_online: with_clock(IS_ONLINE),
        }
    }
}

#[derive(Clone)]
pub struct RedisPresenceStore {
    conn: ConnectionManager,
    key_prefix: String,
    scripts: Scripts,
}

impl RedisPresenceStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self::with_prefix(conn, DEFAULT_KEY_PREFIX)
    }

    pub fn with_prefix(conn: ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
            scripts: Scripts::new(),
        }
    }

    fn key(&self, user_id: UserId) -> String {
        format!("{}{}", self.key_prefix, user_id)
    }
}

/// `PEXPIRE` 不接受 0
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn mark_online(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        ttl: Duration,
    ) -> Result<bool, PresenceError> {
        let mut conn = self.conn.clone();
        let first: i64 = self
            .scripts
            .mark_online
            .key(self.key(user_id))
            .arg(connection_id.to_string())
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|err| presence_error("mark online", err))?;
        Ok(first == 1)
    }

    async fn extend(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        ttl: Duration,
    ) -> Result<bool, PresenceError> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .scripts
            .extend
            .key(self.key(user_id))
            .arg(connection_id.to_string())
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|err| presence_error("extend", err))?;
        Ok(extended == 1)
    }

    async fn mark_offline(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<bool, PresenceError> {
        let mut conn = self.conn.clone();
        let last: i64 = self
            .scripts
            .mark_offline
            .key(self.key(user_id))
            .arg(connection_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|err| presence_error("mark offline", err))?;
        Ok(last == 1)
    }

    async fn is_online(&self, user_id: UserId) -> Result<bool, PresenceError> {
        let mut conn = self.conn.clone();
        let live: i64 = self
            .scripts
            .is_online
            .key(self.key(user_id))
            .invoke_async(&mut conn)
            .await
            .map_err(|err| presence_error("is online", err))?;
        Ok(live > 0)
    }
}
