//! 原子操作使用的Lua脚本
//!
//! 任务记录以Rust序列化好的JSON整体写入，脚本只搬动ID并维护 `state` 字段。

use std::sync::LazyLock;

use redis::Script;

/// KEYS: task, pending, scheduled, queues
/// ARGV: msg, id, process_at_ms（0表示立即可执行）, queue
///
/// 返回1表示成功，0表示ID已存在
pub static ENQUEUE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    return 0
end
redis.call("HSET", KEYS[1], "msg", ARGV[1], "state", "pending")
if tonumber(ARGV[3]) > 0 then
    redis.call("ZADD", KEYS[3], ARGV[3], ARGV[2])
else
    redis.call("LPUSH", KEYS[2], ARGV[2])
end
redis.call("SADD", KEYS[4], ARGV[4])
return 1
"#,
    )
});

/// KEYS: pending, active, scheduled, retry, lease
/// ARGV: now_ms, base_lease_ms, task_key_prefix, lease_grace_ms
///
/// 先把到期的延迟/重试任务移入pending，再取出最早的一个。返回任务JSON或nil。
/// 带 `timeout_seconds` 的任务租约至少为 timeout + grace。
pub static DEQUEUE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
for _, zkey in ipairs({KEYS[3], KEYS[4]}) do
    local due = redis.call("ZRANGEBYSCORE", zkey, "-inf", ARGV[1], "LIMIT", 0, 100)
    for _, id in ipairs(due) do
        redis.call("LPUSH", KEYS[1], id)
        redis.call("ZREM", zkey, id)
    end
end
local id = redis.call("RPOPLPUSH", KEYS[1], KEYS[2])
if not id then
    return nil
end
local key = ARGV[3] .. id
local msg = redis.call("HGET", key, "msg")
local lease_ms = tonumber(ARGV[2])
local ok, decoded = pcall(cjson.decode, msg)
if ok and type(decoded) == "table" and type(decoded["timeout_seconds"]) == "number" then
    lease_ms = math.max(lease_ms, decoded["timeout_seconds"] * 1000 + tonumber(ARGV[4]))
end
redis.call("HSET", key, "state", "active")
redis.call("ZADD", KEYS[5], string.format("%d", tonumber(ARGV[1]) + lease_ms), id)
return msg
"#,
    )
});

/// KEYS: active, lease, task, completed
/// ARGV: id, msg, now_ms, max_completed, task_key_prefix
///
/// 返回0表示任务不在active列表中
pub static ACK: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if redis.call("LREM", KEYS[1], 0, ARGV[1]) == 0 then
    return 0
end
redis.call("ZREM", KEYS[2], ARGV[1])
redis.call("HSET", KEYS[3], "msg", ARGV[2], "state", "done")
redis.call("ZADD", KEYS[4], ARGV[3], ARGV[1])
local excess = redis.call("ZCARD", KEYS[4]) - tonumber(ARGV[4])
if excess > 0 then
    local old = redis.call("ZRANGE", KEYS[4], 0, excess - 1)
    for _, oid in ipairs(old) do
        redis.call("DEL", ARGV[5] .. oid)
    end
    redis.call("ZREMRANGEBYRANK", KEYS[4], 0, excess - 1)
end
return 1
"#,
    )
});

/// KEYS: active, lease, task, target（retry或archived）
/// ARGV: id, msg, state, score
///
/// 返回0表示任务不在active列表中
pub static FAIL: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if redis.call("LREM", KEYS[1], 0, ARGV[1]) == 0 then
    return 0
end
redis.call("ZREM", KEYS[2], ARGV[1])
redis.call("HSET", KEYS[3], "msg", ARGV[2], "state", ARGV[3])
redis.call("ZADD", KEYS[4], ARGV[4], ARGV[1])
return 1
"#,
    )
});
