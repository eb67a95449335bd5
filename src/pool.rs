// ABOUTME: Bounded, fork-safe pool of blocking SSDB connections
// ABOUTME: Leases enforce one in-flight request per connection; LIFO reuse favors warm sockets

use crate::config::Config;
use crate::connection::{Connection, IdleProbe};
use crate::error::{SsdbError, SsdbResult};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

struct PoolState {
    owning_pid: u32,
    available: Vec<Connection>,
    in_use: u32,
    created_connections: u32,
}

impl PoolState {
    fn reset(&mut self, new_pid: u32) {
        // Dropping `available` runs each Connection's Drop impl, which only
        // shuts the socket down if the current PID matches the connection's
        // own recorded PID — so a forked child never touches the parent's
        // file descriptors here.
        self.available.clear();
        self.in_use = 0;
        self.created_connections = 0;
        self.owning_pid = new_pid;
    }
}

/// A bounded pool of [`Connection`]s, safe to share across threads and
/// across a `fork()`.
///
/// Leasing a connection removes it from `available` (or creates a new one,
/// up to `max_connections`) and hands back a [`PooledConnection`] guard that
/// returns it to the pool on drop.
pub struct ConnectionPool {
    config: Config,
    state: Mutex<PoolState>,
    available_changed: Condvar,
    fork_mutex: Mutex<()>,
}

impl ConnectionPool {
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
            available_changed: Condvar::new(),
            fork_mutex: Mutex::new(()),
        })
    }

    fn max_connections(&self) -> u32 {
        self.config.effective_max_connections()
    }

    /// Lease a connection: reuse one from `available`, or create a fresh one
    /// if under `max_connections`, blocking on a condvar otherwise. The
    /// connection is then connected and probed for stale data, with one
    /// reconnect attempt if the probe is unhappy.
    #[tracing::instrument(skip(self))]
    pub fn lease(self: &Arc<Self>) -> SsdbResult<PooledConnection> {
        self.check_pid()?;
        let mut conn = self.acquire_slot()?;
        match self.prepare(&mut conn) {
            Ok(()) => Ok(PooledConnection {
                conn: Some(conn),
                pool: Arc::clone(self),
            }),
            Err(err) => {
                let _ = self.release(conn);
                Err(err)
            }
        }
    }

    fn acquire_slot(&self) -> SsdbResult<Connection> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(conn) = state.available.pop() {
                state.in_use += 1;
                return Ok(conn);
            }
            if state.created_connections < self.max_connections() {
                state.created_connections += 1;
                state.in_use += 1;
                return Ok(Connection::new(&self.config));
            }
            state = self
                .available_changed
                .wait(state)
                .expect("pool mutex poisoned");
        }
    }

    fn prepare(&self, conn: &mut Connection) -> SsdbResult<()> {
        match conn.connect().and_then(|()| conn.probe_idle()) {
            Ok(IdleProbe::Idle) => Ok(()),
            Ok(IdleProbe::DataPresent) | Err(_) => {
                warn!("connect or idle probe was unhappy at lease time, reconnecting once");
                conn.disconnect();
                conn.connect()?;
                match conn.probe_idle()? {
                    IdleProbe::Idle => Ok(()),
                    IdleProbe::DataPresent => Err(SsdbError::ConnectionNotReady),
                }
            }
        }
    }

    /// Return a leased connection to the pool. Normally called via
    /// [`PooledConnection`]'s `Drop`, not directly.
    ///
    /// A connection that came back already disconnected — the server closed
    /// it, or a protocol error tore it down mid-response — is not recycled
    /// into `available`; it's dropped here and `created_connections` shrinks
    /// so the next lease is free to open a replacement socket.
    pub fn release(&self, conn: Connection) -> SsdbResult<()> {
        self.check_pid()?;
        let owns = conn.owning_pid() == std::process::id();
        let mut state = self.state.lock().unwrap();
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

    /// Create a connection slot without connecting it. Exposed for callers
    /// (single-connection [`crate::client::Client`]) that want to manage one
    /// connection's lifetime outside the pool's `available` stack.
    pub fn make_connection(&self) -> SsdbResult<Connection> {
        let mut state = self.state.lock().unwrap();
        if state.created_connections >= self.max_connections() {
            return Err(SsdbError::PoolExhausted);
        }
        state.created_connections += 1;
        state.in_use += 1;
        Ok(Connection::new(&self.config))
    }

    /// Disconnect every connection currently sitting in `available`. Leased
    /// connections are owned by their callers and are disconnected when
    /// released back to a pool that has already shrunk its accounting here.
    pub fn disconnect_all(&self) -> SsdbResult<()> {
        self.check_pid()?;
        let mut state = self.state.lock().unwrap();
        let idle = std::mem::take(&mut state.available);
        state.created_connections = state
            .created_connections
            .saturating_sub(idle.len() as u32);
        drop(state);

        for mut conn in idle {
            conn.disconnect();
        }
        self.available_changed.notify_all();
        Ok(())
    }

    /// Snapshot of `(available, in_use, created_connections)`, for tests and
    /// diagnostics.
    pub fn accounting(&self) -> (usize, u32, u32) {
        let state = self.state.lock().unwrap();
        (state.available.len(), state.in_use, state.created_connections)
    }

    /// Detect a fork since the pool was created or last reset, and if one
    /// happened, reset all pool state under `fork_mutex` (bounded by
    /// `fork_mutex_timeout`, to guard against a child inheriting the mutex
    /// already held mid-critical-section by the parent at fork time).
    fn check_pid(&self) -> SsdbResult<()> {
        let current = std::process::id();
        if self.state.lock().unwrap().owning_pid == current {
            return Ok(());
        }

        let deadline = Instant::now() + self.config.fork_mutex_timeout;
        loop {
            match self.fork_mutex.try_lock() {
                Ok(_guard) => {
                    let mut state = self.state.lock().unwrap();
                    if state.owning_pid != current {
                        debug!(pid = current, "fork detected, resetting pool");
                        state.reset(current);
                    }
                    return Ok(());
                }
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(_) => return Err(SsdbError::ChildDeadlock),
            }
        }
    }
}

/// A leased [`Connection`], returned to its pool automatically on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
}

impl Deref for PooledConnection {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("conn taken only on drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("conn taken only on drop")
    }
}

impl PooledConnection {
    /// Detach the leased [`Connection`] from this guard without returning it
    /// to the pool. For a caller (the single-connection client) that wants
    /// to pin a connection across many calls instead of leasing fresh one
    /// each time, while still going through `lease()`'s fork-check and
    /// stale-probe reconnect for that first lease.
    pub fn into_connection(mut self) -> Connection {
        self.conn.take().expect("conn present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(err) = self.pool.release(conn) {
                warn!(error = %err, "failed to return connection to pool");
            }
        }
    }
}

#[cfg(test)]
impl ConnectionPool {
    /// Simulate the pool having been created by a different process, to
    /// exercise the fork-reset path without actually forking.
    fn set_owning_pid_for_test(&self, pid: u32) {
        self.state.lock().unwrap().owning_pid = pid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn lease_without_connecting_tracks_accounting() {
        let pool = ConnectionPool::new(Config::default());
        let conn = pool.make_connection().unwrap();
        let (available, in_use, created) = pool.accounting();
        assert_eq!(available, 0);
        assert_eq!(in_use, 1);
        assert_eq!(created, 1);
        pool.release(conn).unwrap();
        let (available, in_use, created) = pool.accounting();
        assert_eq!(available, 1);
        assert_eq!(in_use, 0);
        assert_eq!(created, 1);
    }

    #[test]
    fn make_connection_respects_max_connections() {
        let mut config = Config::default();
        config.max_connections = 1;
        let pool = ConnectionPool::new(config);
        let _first = pool.make_connection().unwrap();
        let err = pool.make_connection().unwrap_err();
        assert!(matches!(err, SsdbError::PoolExhausted));
    }

    #[test]
    fn disconnect_all_drains_available_and_adjusts_accounting() {
        let pool = ConnectionPool::new(Config::default());
        let conn = pool.make_connection().unwrap();
        pool.release(conn).unwrap();
        assert_eq!(pool.accounting(), (1, 0, 1));
        pool.disconnect_all().unwrap();
        assert_eq!(pool.accounting(), (0, 0, 0));
    }

    #[test]
    fn release_after_server_close_shrinks_created_connections_instead_of_recycling() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let mut config = Config::default();
        config.host = addr.ip().to_string();
        config.port = addr.port();
        let pool = ConnectionPool::new(config);

        let mut conn = pool.make_connection().unwrap();
        conn.connect().unwrap();
        server.join().unwrap();

        let err = conn.read_response().unwrap_err();
        assert!(matches!(err, SsdbError::ConnectionClosed));
        assert!(!conn.is_connected());

        assert_eq!(pool.accounting(), (0, 1, 1));
        pool.release(conn).unwrap();
        assert_eq!(pool.accounting(), (0, 0, 0));
    }

    #[test]
    fn fork_detection_resets_pool_state() {
        let pool = ConnectionPool::new(Config::default());
        let conn = pool.make_connection().unwrap();
        pool.release(conn).unwrap();
        assert_eq!(pool.accounting(), (1, 0, 1));

        // Pretend this pool belongs to some other (now-dead) process, the
        // way a forked child would see it. Any operation that calls
        // `check_pid` should notice the mismatch and reset accounting before
        // doing anything else.
        pool.set_owning_pid_for_test(u32::MAX);
        pool.disconnect_all().unwrap();
        assert_eq!(pool.accounting(), (0, 0, 0));
    }

    #[test]
    fn second_lease_blocks_until_first_is_released() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            for _ in 0..2 {
                if let Ok((stream, _)) = listener.accept() {
                    // Keep the socket open for the lifetime of the test;
                    // nothing needs to be read or written for a lease to
                    // succeed (no auth configured, no probe data sent).
                    thread::spawn(move || {
                        let _keep_alive = stream;
                        thread::sleep(Duration::from_secs(2));
                    });
                }
            }
        });

        let mut config = Config::default();
        config.host = addr.ip().to_string();
        config.port = addr.port();
        config.max_connections = 1;
        let pool = ConnectionPool::new(config);

        let first = pool.lease().unwrap();

        let pool2 = Arc::clone(&pool);
        let (tx, rx) = mpsc::channel();
        let waiter = thread::spawn(move || {
            let _second = pool2.lease().unwrap();
            tx.send(()).unwrap();
        });

        thread::sleep(Duration::from_millis(100));
        assert!(
            rx.try_recv().is_err(),
            "second lease should still be blocked on the condvar"
        );

        drop(first);
        rx.recv_timeout(Duration::from_secs(2))
            .expect("second lease should unblock once the first is released");
        waiter.join().unwrap();
        server.join().unwrap();
    }
}
