// ABOUTME: Cooperative (tokio) counterpart to `pool::ConnectionPool`
// ABOUTME: Same lease/release/fork-reset discipline, built on an async mutex and a Notify

use crate::config::Config;
use crate::connection::IdleProbe;
use crate::connection_async::AsyncConnection;
use crate::error::{SsdbError, SsdbResult};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

struct PoolState {
    owning_pid: u32,
    available: Vec<AsyncConnection>,
    in_use: u32,
    created_connections: u32,
}

/// As [`crate::pool::ConnectionPool`], but every lock acquisition and socket
/// operation is an explicit suspension point. `fork_mutex` stays a plain
/// `std::sync::Mutex` — fork is exceptional in a cooperative runtime, not
/// worth an async primitive.
pub struct AsyncConnectionPool {
    config: Config,
    state: Mutex<PoolState>,
    available_changed: Notify,
    fork_mutex: std::sync::Mutex<()>,
}

impl AsyncConnectionPool {
    pub fn new(config: Config) -> Arc<Self> {
        let owning_pid = std::process::id();
        Arc::new(Self {
            config,
            state: Mutex::new(PoolState {
                owning_pid,
                available: Vec::new(),
                in_use: 0,
                created_connections: 0,
            }),
            available_changed: Notify::new(),
            fork_mutex: std::sync::Mutex::new(()),
        })
    }

    fn max_connections(&self) -> u32 {
        self.config.effective_max_connections()
    }

    #[tracing::instrument(skip(self))]
    pub async fn lease(self: &Arc<Self>) -> SsdbResult<AsyncPooledConnection> {
        self.check_pid().await?;
        let mut conn = self.acquire_slot().await?;
        match self.prepare(&mut conn).await {
            Ok(()) => Ok(AsyncPooledConnection {
                conn: Some(conn),
                pool: Arc::clone(self),
            }),
            Err(err) => {
                let _ = self.release(conn).await;
                Err(err)
            }
        }
    }

    async fn acquire_slot(&self) -> SsdbResult<AsyncConnection> {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(conn) = state.available.pop() {
                    state.in_use += 1;
                    return Ok(conn);
                }
                if state.created_connections < self.max_connections() {
                    state.created_connections += 1;
                    state.in_use += 1;
                    return Ok(AsyncConnection::new(&self.config));
                }
            }
            self.available_changed.notified().await;
        }
    }

    async fn prepare(&self, conn: &mut AsyncConnection) -> SsdbResult<()> {
        let first_attempt = match conn.connect().await {
            Ok(()) => conn.probe_idle().await,
            Err(err) => Err(err),
        };
        match first_attempt {
            Ok(IdleProbe::Idle) => Ok(()),
            Ok(IdleProbe::DataPresent) | Err(_) => {
                warn!("connect or idle probe was unhappy at lease time, reconnecting once");
                conn.disconnect();
                conn.connect().await?;
                match conn.probe_idle().await? {
                    IdleProbe::Idle => Ok(()),
                    IdleProbe::DataPresent => Err(SsdbError::ConnectionNotReady),
                }
            }
        }
    }

    /// As [`crate::pool::ConnectionPool::release`]: a connection that came
    /// back already disconnected is dropped rather than recycled, and
    /// `created_connections` shrinks to make room for a fresh one.
    pub async fn release(&self, conn: AsyncConnection) -> SsdbResult<()> {
        self.check_pid().await?;
        let owns = conn.owning_pid() == std::process::id();
        let mut state = self.state.lock().await;
        state.in_use = state.in_use.saturating_sub(1);
        if owns && conn.is_connected() {
            state.available.push(conn);
            drop(state);
        } else {
            state.created_connections = state.created_connections.saturating_sub(1);
            drop(state);
            conn.disconnect();
        }
        self.available_changed.notify_one();
        Ok(())
    }

    pub async fn make_connection(&self) -> SsdbResult<AsyncConnection> {
        let mut state = self.state.lock().await;
        if state.created_connections >= self.max_connections() {
            return Err(SsdbError::PoolExhausted);
        }
        state.created_connections += 1;
        state.in_use += 1;
        Ok(AsyncConnection::new(&self.config))
    }

    pub async fn disconnect_all(&self) -> SsdbResult<()> {
        self.check_pid().await?;
        let mut state = self.state.lock().await;
        let idle = std::mem::take(&mut state.available);
        state.created_connections = state
            .created_connections
            .saturating_sub(idle.len() as u32);
        drop(state);

        for mut conn in idle {
            conn.disconnect();
        }
        self.available_changed.notify_waiters();
        Ok(())
    }

    pub async fn accounting(&self) -> (usize, u32, u32) {
        let state = self.state.lock().await;
        (state.available.len(), state.in_use, state.created_connections)
    }

    async fn check_pid(&self) -> SsdbResult<()> {
        let current = std::process::id();
        if self.state.lock().await.owning_pid == current {
            return Ok(());
        }

        let deadline = Instant::now() + self.config.fork_mutex_timeout;
        loop {
            match self.fork_mutex.try_lock() {
                Ok(_guard) => {
                    let mut state = self.state.lock().await;
                    if state.owning_pid != current {
                        debug!(pid = current, "fork detected, resetting pool");
                        state.available.clear();
                        state.in_use = 0;
                        state.created_connections = 0;
                        state.owning_pid = current;
                    }
                    return Ok(());
                }
                Err(_) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Err(_) => return Err(SsdbError::ChildDeadlock),
            }
        }
    }
}

/// A leased [`AsyncConnection`]. Returned to its pool on drop by spawning a
/// detached release task, since `Drop` cannot `.await`.
pub struct AsyncPooledConnection {
    conn: Option<AsyncConnection>,
    pool: Arc<AsyncConnectionPool>,
}

impl Deref for AsyncPooledConnection {
    type Target = AsyncConnection;
    fn deref(&self) -> &AsyncConnection {
        self.conn.as_ref().expect("conn taken only on drop")
    }
}

impl DerefMut for AsyncPooledConnection {
    fn deref_mut(&mut self) -> &mut AsyncConnection {
        self.conn.as_mut().expect("conn taken only on drop")
    }
}

impl AsyncPooledConnection {
    /// As [`crate::pool::PooledConnection::into_connection`]: detach the
    /// leased [`AsyncConnection`] without returning it to the pool, for a
    /// caller that wants to pin it across many calls.
    pub fn into_connection(mut self) -> AsyncConnection {
        self.conn.take().expect("conn present until drop")
    }
}

impl Drop for AsyncPooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = Arc::clone(&self.pool);
            tokio::spawn(async move {
                if let Err(err) = pool.release(conn).await {
                    warn!(error = %err, "failed to return connection to pool");
                }
            });
        }
    }
}

#[cfg(test)]
impl AsyncConnectionPool {
    async fn set_owning_pid_for_test(&self, pid: u32) {
        self.state.lock().await.owning_pid = pid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn lease_without_connecting_tracks_accounting() {
        let pool = AsyncConnectionPool::new(Config::default());
        let conn = pool.make_connection().await.unwrap();
        assert_eq!(pool.accounting().await, (0, 1, 1));
        pool.release(conn).await.unwrap();
        assert_eq!(pool.accounting().await, (1, 0, 1));
    }

    #[tokio::test]
    async fn make_connection_respects_max_connections() {
        let mut config = Config::default();
        config.max_connections = 1;
        let pool = AsyncConnectionPool::new(config);
        let _first = pool.make_connection().await.unwrap();
        let err = pool.make_connection().await.unwrap_err();
        assert!(matches!(err, SsdbError::PoolExhausted));
    }

    #[tokio::test]
    async fn fork_detection_resets_pool_state() {
        let pool = AsyncConnectionPool::new(Config::default());
        let conn = pool.make_connection().await.unwrap();
        pool.release(conn).await.unwrap();
        assert_eq!(pool.accounting().await, (1, 0, 1));

        pool.set_owning_pid_for_test(u32::MAX).await;
        pool.disconnect_all().await.unwrap();
        assert_eq!(pool.accounting().await, (0, 0, 0));
    }

    #[tokio::test]
    async fn release_after_server_close_shrinks_created_connections_instead_of_recycling() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut config = Config::default();
        config.host = addr.ip().to_string();
        config.port = addr.port();
        let pool = AsyncConnectionPool::new(config);

        let mut conn = pool.make_connection().await.unwrap();
        conn.connect().await.unwrap();
        server.await.unwrap();

        let err = conn.read_response().await.unwrap_err();
        assert!(matches!(err, SsdbError::ConnectionClosed));
        assert!(!conn.is_connected());

        assert_eq!(pool.accounting().await, (0, 1, 1));
        pool.release(conn).await.unwrap();
        assert_eq!(pool.accounting().await, (0, 0, 0));
    }

    #[tokio::test]
    async fn second_lease_blocks_until_first_is_released() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            for _ in 0..2 {
                if let Ok((stream, _)) = listener.accept().await {
                    // Keep the socket open for the lifetime of the test;
                    // nothing needs to be read or written for a lease to
                    // succeed (no auth configured, no probe data sent).
                    tokio::spawn(async move {
                        let _keep_alive = stream;
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    });
                }
            }
        });

        let mut config = Config::default();
        config.host = addr.ip().to_string();
        config.port = addr.port();
        config.max_connections = 1;
        let pool = AsyncConnectionPool::new(config);

        let first = pool.lease().await.unwrap();

        let pool2 = Arc::clone(&pool);
        let waiter = tokio::spawn(async move {
            let _second = pool2.lease().await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            !waiter.is_finished(),
            "second lease should still be blocked on the Notify"
        );

        drop(first);
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("second lease should unblock once the first is released")
            .unwrap();
        server.await.unwrap();
    }
}
