// ABOUTME: Dispatcher gluing the pool, encoder, and interpreter behind `execute_command`
// ABOUTME: Also hosts a representative subset of the thin command wrappers (get/set/hgetall/...)

use crate::codec::{CommandArg, CommandClass, ResponseInterpreter, Value, command_class};
use crate::config::Config;
use crate::connection::Connection;
use crate::error::{SsdbError, SsdbResult};
use crate::pool::ConnectionPool;
use bytes::Bytes;
use std::sync::{Arc, Mutex};

/// Canonicalize the command name used to look up a response class: the
/// wire-level `"delete"` -> `"del"` rename must be mirrored here so a caller
/// who spells it `"delete"` still gets the right response shape.
fn canonical(cmd: &str) -> &str {
    if cmd == "delete" { "del" } else { cmd }
}

/// The SSDB client: either pooled (the default) or pinned to a single
/// connection.
///
/// Pooled mode leases a fresh [`Connection`] per call to
/// [`Client::execute_command`] and returns it automatically. Single-connection
/// mode keeps one `Connection` alive across calls, created lazily on first
/// use — appropriate for callers that already serialize their own access
/// (e.g. one client per thread).
pub struct Client {
    pool: Arc<ConnectionPool>,
    single_connection: bool,
    pinned: Mutex<Option<Connection>>,
}

impl Client {
    /// A pooled client over `config`.
    pub fn new(config: Config) -> Self {
        Self {
            pool: ConnectionPool::new(config),
            single_connection: false,
            pinned: Mutex::new(None),
        }
    }

    /// A client pinned to a single connection, created lazily.
    pub fn new_single_connection(config: Config) -> Self {
        Self {
            pool: ConnectionPool::new(config),
            single_connection: true,
            pinned: Mutex::new(None),
        }
    }

    /// Run one command end to end: encode, send, read the response, and
    /// shape it according to `cmd`'s response class.
    pub fn execute_command(&self, cmd: &str, args: &[CommandArg]) -> SsdbResult<Value> {
        let class_cmd = canonical(cmd);
        if self.single_connection {
            self.execute_pinned(cmd, class_cmd, args)
        } else {
            let mut conn = self.pool.lease()?;
            conn.send(cmd, args)?;
            let frame = conn.read_response()?;
            ResponseInterpreter::interpret(class_cmd, frame)
        }
    }

    fn execute_pinned(&self, cmd: &str, class_cmd: &str, args: &[CommandArg]) -> SsdbResult<Value> {
        let mut slot = self.pinned.lock().expect("pinned connection mutex poisoned");
        if slot.is_none() {
            // The first lease a single-connection client performs still goes
            // through `ConnectionPool::lease()`, so it gets the same
            // fork-check and stale-probe reconnect as a pooled lease would;
            // the connection is then detached and pinned instead of being
            // returned to the pool after this one call.
            *slot = Some(self.pool.lease()?.into_connection());
        }
        let conn = slot.as_mut().expect("just populated above");
        conn.send(cmd, args)?;
        let frame = conn.read_response()?;
        ResponseInterpreter::interpret(class_cmd, frame)
    }

    /// Release the pinned connection (if any) and disconnect every idle
    /// pooled connection.
    pub fn close(&self) -> SsdbResult<()> {
        if self.single_connection {
            if let Some(conn) = self
                .pinned
                .lock()
                .expect("pinned connection mutex poisoned")
                .take()
            {
                self.pool.release(conn)?;
            }
        }
        self.pool.disconnect_all()
    }
}

// --- Representative thin command wrappers over `execute_command` ---
//
// Each wrapper does argument coercion and a single `execute_command` call;
// the shape of the returned `Value` is guaranteed by `command_class`
// agreeing with `ResponseInterpreter`, so unpacking the expected variant
// here is an internal invariant, not something callers can violate.

macro_rules! expect_variant {
    ($value:expr, $variant:ident) => {
        match $value {
            Value::$variant(inner) => inner,
            other => panic!(
                "command classification disagrees with interpreter: got {other:?}"
            ),
        }
    };
}

impl Client {
    pub fn ping(&self) -> SsdbResult<()> {
        self.execute_command("ping", &[])?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> SsdbResult<Option<Bytes>> {
        match self.execute_command("get", &[CommandArg::from(key)])? {
            Value::Absent => Ok(None),
            other => Ok(Some(expect_variant!(other, Bytes))),
        }
    }

    pub fn set(&self, key: &str, value: &str) -> SsdbResult<i64> {
        let value = self.execute_command("set", &[CommandArg::from(key), CommandArg::from(value)])?;
        Ok(expect_variant!(value, Int))
    }

    pub fn delete(&self, key: &str) -> SsdbResult<i64> {
        let value = self.execute_command("delete", &[CommandArg::from(key)])?;
        Ok(expect_variant!(value, Int))
    }

    pub fn incr(&self, key: &str, by: i64) -> SsdbResult<i64> {
        let value = self.execute_command("incr", &[CommandArg::from(key), CommandArg::from(by)])?;
        Ok(expect_variant!(value, Int))
    }

    pub fn exists(&self, key: &str) -> SsdbResult<bool> {
        let value = self.execute_command("exists", &[CommandArg::from(key)])?;
        Ok(expect_variant!(value, Int) != 0)
    }

    pub fn hset(&self, name: &str, key: &str, value: &str) -> SsdbResult<i64> {
        let args = [CommandArg::from(name), CommandArg::from(key), CommandArg::from(value)];
        let value = self.execute_command("hset", &args)?;
        Ok(expect_variant!(value, Int))
    }

    pub fn hget(&self, name: &str, key: &str) -> SsdbResult<Option<Bytes>> {
        let args = [CommandArg::from(name), CommandArg::from(key)];
        match self.execute_command("hget", &args)? {
            Value::Absent => Ok(None),
            other => Ok(Some(expect_variant!(other, Bytes))),
        }
    }

    pub fn hgetall(&self, name: &str) -> SsdbResult<Vec<(Bytes, Bytes)>> {
        let value = self.execute_command("hgetall", &[CommandArg::from(name)])?;
        Ok(expect_variant!(value, StrMap))
    }

    pub fn zset(&self, name: &str, key: &str, score: i64) -> SsdbResult<i64> {
        let args = [CommandArg::from(name), CommandArg::from(key), CommandArg::from(score)];
        let value = self.execute_command("zset", &args)?;
        Ok(expect_variant!(value, Int))
    }

    pub fn zscore(&self, name: &str, key: &str) -> SsdbResult<Option<i64>> {
        let args = [CommandArg::from(name), CommandArg::from(key)];
        match self.execute_command("zget", &args)? {
            Value::Absent => Ok(None),
            other => Ok(Some(expect_variant!(other, Int))),
        }
    }

    pub fn scan(
        &self,
        key_start: &str,
        key_end: &str,
        limit: i64,
    ) -> SsdbResult<(Option<Bytes>, Vec<(Bytes, Bytes)>)> {
        let args = [
            CommandArg::from(key_start),
            CommandArg::from(key_end),
            CommandArg::from(limit),
        ];
        let value = self.execute_command("scan", &args)?;
        match value {
            Value::StrMapScan(cursor, map) => Ok((cursor, map)),
            other => panic!("command classification disagrees with interpreter: got {other:?}"),
        }
    }

    pub fn qpush(&self, name: &str, item: &str) -> SsdbResult<i64> {
        let args = [CommandArg::from(name), CommandArg::from(item)];
        let value = self.execute_command("qpush", &args)?;
        Ok(expect_variant!(value, Int))
    }

    pub fn qrange(&self, name: &str, offset: i64, limit: i64) -> SsdbResult<Vec<Bytes>> {
        let args = [CommandArg::from(name), CommandArg::from(offset), CommandArg::from(limit)];
        let value = self.execute_command("qrange", &args)?;
        Ok(expect_variant!(value, List))
    }

    pub fn info(&self) -> SsdbResult<Vec<Bytes>> {
        let value = self.execute_command("info", &[])?;
        Ok(expect_variant!(value, List))
    }
}

/// Sanity-check that a command name is classified, before relying on a
/// wrapper built around it. Exposed mainly so tests (and callers extending
/// the command surface) can assert a new wrapper's command is registered.
pub fn is_known_command(cmd: &str) -> bool {
    command_class(canonical(cmd)).is_some()
}

#[allow(dead_code)]
fn assert_response_class(cmd: &str, expected: CommandClass) -> bool {
    command_class(canonical(cmd)) == Some(expected)
}
