//! Atomic Lua scripts (§4.2). Each runs as one atomic unit on the server so
//! that split ownership can never occur between an inspect and a claim.
//!
//! Transliterated from the original `redimq` Go implementation's
//! `LUA_publishToGMT`, `LUA_reclaimMessageGroups`, and
//! `LUA_deleteMessageGroupIfEmpty` (see `examples/original_source/mqLua.go`).
//! These scripts are never overridden by callers; changing their behaviour
//! can leave the registry in a state the rest of the engine cannot recover
//! from.

use deadpool_redis::redis::Script;
use once_cell::sync::Lazy;

/// `KEYS = [group_set_key, registry_log]`, `ARGV = [group_key]`.
///
/// If `group_key` is not a member of `group_set_key`, adds it there and
/// appends `{key: group_key}` to `registry_log`. The data message itself is
/// appended separately and unconditionally after this script runs (§4.4.1) —
/// a crash between the two leaves a registry entry with no message, which is
/// benign (see DESIGN.md).
pub static PUBLISH_TO_GROUPED_TOPIC: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call("SADD", KEYS[1], ARGV[1]) == 1 then
            redis.call("XADD", KEYS[2], "*", "key", ARGV[1])
        end
        return "OK"
        "#,
    )
});

/// `KEYS = [registry_log]`, `ARGV = [group, consumer, count]`.
///
/// Reads up to `count` pending registry entries for `group` regardless of
/// current owner and claims them for `consumer` with `min_idle = 0`. This is
/// the lock-reclaim primitive behind Tier R of lock acquisition (§4.4.3).
pub static RECLAIM_MESSAGE_GROUPS: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local pending = redis.call("XPENDING", KEYS[1], ARGV[1], "-", "+", ARGV[3])
        if pending == nil or #pending == 0 then
            return {}
        end
        local ids = {}
        for i = 1, #pending do
            ids[i] = pending[i][1]
        end
        return redis.call("XCLAIM", KEYS[1], ARGV[1], ARGV[2], 0, unpack(ids))
        "#,
    )
});

/// `KEYS = [registry_log, per_group_log]`, `ARGV = [registry_id]`.
///
/// If `per_group_log` is empty, deletes `registry_id` from `registry_log` and
/// drops the `per_group_log` key. Returns `1` if the deletion happened, `0`
/// otherwise.
pub static DELETE_EMPTY_GROUP: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local count = redis.call("XLEN", KEYS[2])
        if count == 0 then
            redis.call("XDEL", KEYS[1], ARGV[1])
            redis.call("DEL", KEYS[2])
            return 1
        end
        return 0
        "#,
    )
});
