// ABOUTME: Cooperative (tokio) counterpart to `client::Client`
// ABOUTME: Same dispatcher discipline — lease, send, read, interpret, return — as explicit awaits

use crate::codec::{CommandArg, ResponseInterpreter, Value};
use crate::config::Config;
use crate::connection_async::AsyncConnection;
use crate::error::SsdbResult;
use crate::pool_async::AsyncConnectionPool;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Canonicalize the command name used to look up a response class: mirrors
/// [`crate::client::canonical`] for the async dispatcher.
fn canonical(cmd: &str) -> &str {
    if cmd == "delete" { "del" } else { cmd }
}

/// As [`crate::client::Client`], but every step — lease, send, read, release
/// — is an explicit suspension point, for use inside a single-threaded event
/// loop.
pub struct AsyncClient {
    pool: Arc<AsyncConnectionPool>,
    single_connection: bool,
    pinned: Mutex<Option<AsyncConnection>>,
}

impl AsyncClient {
    /// A pooled client over `config`.
    pub fn new(config: Config) -> Self {
        Self {
            pool: AsyncConnectionPool::new(config),
            single_connection: false,
            pinned: Mutex::new(None),
        }
    }

    /// A client pinned to a single connection, created lazily.
    pub fn new_single_connection(config: Config) -> Self {
        Self {
            pool: AsyncConnectionPool::new(config),
            single_connection: true,
            pinned: Mutex::new(None),
        }
    }

    /// Run one command end to end: encode, send, read the response, and
    /// shape it according to `cmd`'s response class.
    pub async fn execute_command(&self, cmd: &str, args: &[CommandArg]) -> SsdbResult<Value> {
        let class_cmd = canonical(cmd);
        if self.single_connection {
            self.execute_pinned(cmd, class_cmd, args).await
        } else {
            let mut conn = self.pool.lease().await?;
            conn.send(cmd, args).await?;
            let frame = conn.read_response().await?;
            ResponseInterpreter::interpret(class_cmd, frame)
        }
    }

    async fn execute_pinned(
        &self,
        cmd: &str,
        class_cmd: &str,
        args: &[CommandArg],
    ) -> SsdbResult<Value> {
        let mut slot = self.pinned.lock().await;
        if slot.is_none() {
            // As `Client::execute_pinned`: the first lease still goes through
            // `AsyncConnectionPool::lease()` for its fork-check and
            // stale-probe reconnect, then gets detached and pinned.
            *slot = Some(self.pool.lease().await?.into_connection());
        }
        let conn = slot.as_mut().expect("just populated above");
        conn.send(cmd, args).await?;
        let frame = conn.read_response().await?;
        ResponseInterpreter::interpret(class_cmd, frame)
    }

    /// Release the pinned connection (if any) and disconnect every idle
    /// pooled connection.
    pub async fn close(&self) -> SsdbResult<()> {
        if self.single_connection {
            if let Some(conn) = self.pinned.lock().await.take() {
                self.pool.release(conn).await?;
            }
        }
        self.pool.disconnect_all().await
    }
}

// --- Representative thin command wrappers over `execute_command`, async form ---

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

impl AsyncClient {
    pub async fn ping(&self) -> SsdbResult<()> {
        self.execute_command("ping", &[]).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> SsdbResult<Option<Bytes>> {
        match self.execute_command("get", &[CommandArg::from(key)]).await? {
            Value::Absent => Ok(None),
            other => Ok(Some(expect_variant!(other, Bytes))),
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> SsdbResult<i64> {
        let value = self
            .execute_command("set", &[CommandArg::from(key), CommandArg::from(value)])
            .await?;
        Ok(expect_variant!(value, Int))
    }

    pub async fn delete(&self, key: &str) -> SsdbResult<i64> {
        let value = self.execute_command("delete", &[CommandArg::from(key)]).await?;
        Ok(expect_variant!(value, Int))
    }

    pub async fn hgetall(&self, name: &str) -> SsdbResult<Vec<(Bytes, Bytes)>> {
        let value = self
            .execute_command("hgetall", &[CommandArg::from(name)])
            .await?;
        Ok(expect_variant!(value, StrMap))
    }

    pub async fn scan(
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
        let value = self.execute_command("scan", &args).await?;
        match value {
            Value::StrMapScan(cursor, map) => Ok((cursor, map)),
            other => panic!("command classification disagrees with interpreter: got {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, Write};
    use std::net::TcpListener;
    use std::thread;

    fn spawn_scripted_server(
        script: Vec<&'static str>,
    ) -> (std::net::SocketAddr, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            for reply in script {
                let mut reader = std::io::BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                let _ = reader.read_line(&mut line);
                stream.write_all(reply.as_bytes()).unwrap();
            }
        });
        (addr, handle)
    }

    fn client_for(addr: std::net::SocketAddr) -> AsyncClient {
        let mut config = Config::default();
        config.host = addr.ip().to_string();
        config.port = addr.port();
        AsyncClient::new_single_connection(config)
    }

    #[tokio::test]
    async fn ping_round_trip() {
        let (addr, handle) = spawn_scripted_server(vec!["2\nok\n\n"]);
        let client = client_for(addr);
        client.ping().await.unwrap();
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn set_round_trip() {
        let (addr, handle) = spawn_scripted_server(vec!["2\nok\n1\n1\n\n"]);
        let client = client_for(addr);
        assert_eq!(client.set("foo", "bar").await.unwrap(), 1);
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn get_missing_key_is_none() {
        let (addr, handle) = spawn_scripted_server(vec!["9\nnot_found\n\n"]);
        let client = client_for(addr);
        assert_eq!(client.get("foo").await.unwrap(), None);
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn hgetall_round_trip() {
        let (addr, handle) = spawn_scripted_server(vec!["2\nok\n1\na\n1\n1\n1\nb\n1\n2\n\n"]);
        let client = client_for(addr);
        let map = client.hgetall("h").await.unwrap();
        assert_eq!(map.len(), 2);
        handle.join().unwrap();
    }
}
