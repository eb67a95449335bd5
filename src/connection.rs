// ABOUTME: Blocking, single-socket connection to an SSDB server
// ABOUTME: Owns the read buffer and frame parser; one in-flight request at a time

use crate::buffer::ByteBuffer;
use crate::codec::{CommandArg, CommandEncoder};
use crate::config::{Config, KeepaliveOptions};
use crate::error::{SsdbError, SsdbResult};
use crate::frame::{Frame, FrameParser, ParseOutcome};
use socket2::{Socket, TcpKeepalive};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use tracing::{debug, warn};

/// Outcome of [`Connection::probe_idle`]: whether the socket looks quiet or
/// has stray unread data sitting on it.
#[derive(Debug, PartialEq, Eq)]
pub enum IdleProbe {
    /// No data observed; the connection is safe to reuse.
    Idle,
    /// A non-blocking read returned data. The previous response was not
    /// fully drained (or, in principle, the server pushed something
    /// unprompted — SSDB never does). The caller should reconnect.
    DataPresent,
}

/// A single TCP connection to an SSDB server, plus the incremental parser
/// state needed to read framed responses off it.
///
/// Only one request may be in flight on a `Connection` at a time — callers
/// (normally [`crate::pool::ConnectionPool`]) are responsible for that
/// discipline; nothing here enforces it beyond `pending_frame`.
#[derive(Debug)]
pub struct Connection {
    host: String,
    port: u16,
    password: Option<String>,
    socket_keepalive: bool,
    socket_keepalive_options: Option<KeepaliveOptions>,
    recv_chunk_size: usize,
    owning_pid: u32,
    socket: Option<TcpStream>,
    buffer: ByteBuffer,
    /// A frame already parsed out of the buffer by [`Connection::probe_idle`]
    /// but not yet handed to a caller. Consumed by the next `read_response`.
    pending_frame: Option<Frame>,
}

impl Connection {
    /// Build a not-yet-connected `Connection` from `config`.
    pub fn new(config: &Config) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            password: config.password.clone(),
            socket_keepalive: config.socket_keepalive,
            socket_keepalive_options: config.socket_keepalive_options,
            recv_chunk_size: config.recv_chunk_size,
            owning_pid: std::process::id(),
            socket: None,
            buffer: ByteBuffer::new(),
            pending_frame: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// The PID this connection was constructed under. Used by
    /// [`crate::pool::ConnectionPool`] to decide, on release, whether it
    /// still owns the socket.
    pub fn owning_pid(&self) -> u32 {
        self.owning_pid
    }

    /// Open the TCP socket and, if a password is configured, perform the
    /// `auth` handshake. Idempotent: a no-op if already connected.
    #[tracing::instrument(skip(self), fields(host = %self.host, port = self.port))]
    pub fn connect(&mut self) -> SsdbResult<()> {
        if self.socket.is_some() {
            return Ok(());
        }

        debug!("opening connection");
        let stream = TcpStream::connect((self.host.as_str(), self.port))?;
        stream.set_nodelay(true)?;
        let stream = if self.socket_keepalive {
            self.apply_keepalive(stream)?
        } else {
            stream
        };
        self.socket = Some(stream);
        self.buffer.clear();
        self.pending_frame = None;

        if let Some(password) = self.password.clone() {
            if let Err(err) = self.authenticate(&password) {
                warn!(error = %err, "auth handshake failed");
                self.disconnect();
                return Err(err);
            }
        }

        Ok(())
    }

    /// Turn on `SO_REUSEADDR` and platform TCP keepalive probing on a freshly
    /// opened socket, using [`KeepaliveOptions`] (or its defaults).
    fn apply_keepalive(&self, stream: TcpStream) -> SsdbResult<TcpStream> {
        let socket = Socket::from(stream);
        socket.set_reuse_address(true)?;

        let options = self.socket_keepalive_options.unwrap_or_default();
        let keepalive = TcpKeepalive::new()
            .with_time(options.idle)
            .with_interval(options.interval);
        #[cfg(not(target_os = "windows"))]
        let keepalive = keepalive.with_retries(options.retries);
        socket.set_tcp_keepalive(&keepalive)?;

        Ok(socket.into())
    }

    fn authenticate(&mut self, password: &str) -> SsdbResult<()> {
        self.send("auth", &[CommandArg::from(password)])?;
        let frame = self.read_response()?;
        match frame.first() {
            Some(status) if status.as_ref() == b"ok" => Ok(()),
            Some(status) => Err(SsdbError::AuthError(
                String::from_utf8_lossy(status).into_owned(),
            )),
            None => Err(SsdbError::AuthError("empty auth response".to_string())),
        }
    }

    /// Encode and write a command. Does not wait for a response.
    pub fn send(&mut self, cmd: &str, args: &[CommandArg]) -> SsdbResult<()> {
        let bytes = CommandEncoder::encode(cmd, args);
        let socket = self.socket_mut()?;
        socket.write_all(&bytes)?;
        socket.flush()?;
        Ok(())
    }

    /// Block until one complete frame has been read.
    pub fn read_response(&mut self) -> SsdbResult<Frame> {
        if let Some(frame) = self.pending_frame.take() {
            return Ok(frame);
        }

        loop {
            match FrameParser::try_parse(&mut self.buffer) {
                ParseOutcome::Complete(frame) => return Ok(frame),
                ParseOutcome::Incomplete => self.fill_buffer()?,
                ParseOutcome::BadFormat(reason) => {
                    self.disconnect();
                    return Err(SsdbError::ProtocolError(reason));
                }
            }
        }
    }

    fn fill_buffer(&mut self) -> SsdbResult<()> {
        let chunk_size = self.recv_chunk_size;
        let socket = self.socket_mut()?;
        let mut chunk = vec![0u8; chunk_size];
        let n = socket.read(&mut chunk)?;
        if n == 0 {
            self.disconnect();
            return Err(SsdbError::ConnectionClosed);
        }
        self.buffer.append(&chunk[..n])?;
        Ok(())
    }

    /// Check for stray unread data on the socket before issuing a new
    /// command, without blocking.
    #[tracing::instrument(skip(self), fields(host = %self.host, port = self.port))]
    pub fn probe_idle(&mut self) -> SsdbResult<IdleProbe> {
        if self.pending_frame.is_some() {
            return Ok(IdleProbe::DataPresent);
        }

        match FrameParser::try_parse(&mut self.buffer) {
            ParseOutcome::Complete(frame) => {
                self.pending_frame = Some(frame);
                return Ok(IdleProbe::DataPresent);
            }
            ParseOutcome::BadFormat(reason) => {
                self.disconnect();
                return Err(SsdbError::ProtocolError(reason));
            }
            ParseOutcome::Incomplete => {}
        }

        let socket = self.socket_mut()?;
        socket.set_nonblocking(true)?;
        let mut chunk = [0u8; 4096];
        let result = socket.read(&mut chunk);
        // Always restore blocking mode before interpreting the result.
        self.socket_mut()?.set_nonblocking(false)?;

        match result {
            Ok(0) => {
                self.disconnect();
                Err(SsdbError::ConnectionClosed)
            }
            Ok(n) => {
                self.buffer.append(&chunk[..n])?;
                Ok(IdleProbe::DataPresent)
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(IdleProbe::Idle),
            Err(e) => {
                self.disconnect();
                Err(SsdbError::Io(e))
            }
        }
    }

    /// Idempotent. A forked child never shuts down the parent's socket — it
    /// only clears its own handle to it.
    pub fn disconnect(&mut self) {
        if let Some(socket) = self.socket.take() {
            debug!(host = %self.host, port = self.port, "disconnecting");
            if std::process::id() == self.owning_pid {
                let _ = socket.shutdown(std::net::Shutdown::Both);
            }
        }
        self.buffer.clear();
        self.pending_frame = None;
    }

    fn socket_mut(&mut self) -> SsdbResult<&mut TcpStream> {
        self.socket.as_mut().ok_or(SsdbError::ConnectionClosed)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
