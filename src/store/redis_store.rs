use redis::Commands;

use super::{Batch, Command, KvStore, StoreError, StoreResult};

/// Applies a batch inside one script call.
///
/// KEYS holds one target per command and ARGV holds an opcode and an argument
/// per command. A first pass checks every condition and key type against the
/// state the batch would see, and only a clean pass writes anything. Replies
/// with `{0, flags...}` on success, `{1, index}` for a failed condition and
/// `{2, index}` for a key holding the wrong type.
const EXEC_SCRIPT: &str = r#"
local kinds = {}
local function kind(key)
  if kinds[key] == nil then
    kinds[key] = redis.call('TYPE', key)['ok']
  end
  return kinds[key]
end

for i, key in ipairs(KEYS) do
  local op = ARGV[2 * i - 1]
  local current = kind(key)
  if op == 'sadd' or op == 'srem' then
    if current ~= 'none' and current ~= 'set' then return {2, i} end
    if op == 'sadd' then kinds[key] = 'set' end
  else
    if current ~= 'none' and current ~= 'string' then return {2, i} end
    if op == 'setnx' and current ~= 'none' then return {1, i} end
    if op == 'setxx' and current == 'none' then return {1, i} end
    if op == 'del' then kinds[key] = 'none' else kinds[key] = 'string' end
  end
end

local reply = {0}
for i, key in ipairs(KEYS) do
  local op = ARGV[2 * i - 1]
  local arg = ARGV[2 * i]
  local changed = 0
  if op == 'set' then
    redis.call('SET', key, arg)
    changed = 1
  elseif op == 'setnx' then
    changed = redis.call('SETNX', key, arg)
  elseif op == 'setxx' then
    if redis.call('SET', key, arg, 'XX') then changed = 1 end
  elseif op == 'del' then
    changed = redis.call('DEL', key)
  elseif op == 'sadd' then
    changed = redis.call('SADD', key, arg)
  elseif op == 'srem' then
    changed = redis.call('SREM', key, arg)
  end
  reply[i + 1] = changed
end
return reply
"#;

const STATUS_OK: i64 = 0;
const STATUS_CONDITION_FAILED: i64 = 1;
const STATUS_WRONG_TYPE: i64 = 2;

/// [`KvStore`] on a Redis server
///
/// Every primitive runs on its own connection. A [`Batch`] runs as one Lua
/// script, so Redis executes it without interleaving other clients and a
/// failed `SET NX` / `SET XX` condition leaves the keyspace untouched.
pub struct RedisStore {
    client: redis::Client,
    exec_script: redis::Script,
}

impl RedisStore {
    /// Connect to the server at `redis_url` (e.g. `redis://localhost:6379`)
    ///
    /// Fails if the server cannot be reached.
    pub fn open(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| {
            tracing::error!("Failed to create Redis client: {}", e);
            StoreError::Redis(e)
        })?;

        let mut conn = client.get_connection().map_err(|e| {
            tracing::error!("Failed to connect to Redis: {}", e);
            StoreError::Redis(e)
        })?;
        let _: String = redis::cmd("PING").query(&mut conn)?;

        tracing::info!("Redis store initialized");

        Ok(Self {
            client,
            exec_script: redis::Script::new(EXEC_SCRIPT),
        })
    }

    fn connection(&self) -> StoreResult<redis::Connection> {
        Ok(self.client.get_connection()?)
    }
}

/// Opcode and argument passed to the script for one command
fn script_arg(command: &Command) -> (&'static str, &[u8]) {
    match command {
        Command::Set { value, .. } => ("set", value.as_slice()),
        Command::SetIfAbsent { value, .. } => ("setnx", value.as_slice()),
        Command::SetIfPresent { value, .. } => ("setxx", value.as_slice()),
        Command::Delete { .. } => ("del", b"".as_slice()),
        Command::SetAdd { member, .. } => ("sadd", member.as_bytes()),
        Command::SetRemove { member, .. } => ("srem", member.as_bytes()),
    }
}

/// Turn the script reply into change flags or the error naming the failed command
fn decode_reply(batch: &Batch, reply: &[i64]) -> StoreResult<Vec<bool>> {
    let Some((&status, rest)) = reply.split_first() else {
        return Err(StoreError::Unavailable("empty script reply".to_string()));
    };

    let failed_key = || {
        // Lua indexes from 1
        rest.first()
            .and_then(|&i| usize::try_from(i).ok())
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| batch.commands().get(i))
            .map(|command| command.target().to_string())
            .unwrap_or_default()
    };

    match status {
        STATUS_OK if rest.len() == batch.len() => Ok(rest.iter().map(|&flag| flag > 0).collect()),
        STATUS_OK => Err(StoreError::Unavailable(format!(
            "script reported {} flags for {} commands",
            rest.len(),
            batch.len()
        ))),
        STATUS_CONDITION_FAILED => Err(StoreError::ConditionFailed { key: failed_key() }),
        STATUS_WRONG_TYPE => Err(StoreError::WrongType { key: failed_key() }),
        other => Err(StoreError::Unavailable(format!(
            "unknown script status {}",
            other
        ))),
    }
}

impl KvStore for RedisStore {
    fn incr(&self, counter: &str) -> StoreResult<i64> {
        let mut conn = self.connection()?;
        let next: i64 = conn.incr(counter, 1)?;
        Ok(next)
    }

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.connection()?;
        let value: Option<Vec<u8>> = conn.get(key)?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let mut conn = self.connection()?;
        let _: () = conn.set(key, value)?;
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &[u8]) -> StoreResult<bool> {
        let mut conn = self.connection()?;
        let written: bool = conn.set_nx(key, value)?;
        Ok(written)
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.connection()?;
        let removed: i64 = conn.del(key)?;
        Ok(removed > 0)
    }

    fn set_add(&self, set: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.connection()?;
        let added: i64 = conn.sadd(set, member)?;
        Ok(added > 0)
    }

    fn set_remove(&self, set: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.connection()?;
        let removed: i64 = conn.srem(set, member)?;
        Ok(removed > 0)
    }

    fn set_members(&self, set: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection()?;
        let mut members: Vec<String> = conn.smembers(set)?;
        members.sort();
        Ok(members)
    }

    fn exec(&self, batch: Batch) -> StoreResult<Vec<bool>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut invocation = self.exec_script.prepare_invoke();
        for command in batch.commands() {
            let (opcode, arg) = script_arg(command);
            invocation.key(command.target()).arg(opcode).arg(arg);
        }

        let mut conn = self.connection()?;
        let reply: Vec<i64> = invocation.invoke(&mut conn)?;

        decode_reply(&batch, &reply).inspect_err(|e| {
            tracing::debug!("Redis batch rejected: {}", e);
        })
    }
}
