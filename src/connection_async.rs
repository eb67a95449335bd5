// ABOUTME: Cooperative (tokio) counterpart to `connection::Connection`
// ABOUTME: Same state machine as the blocking connection, suspension points made explicit

use crate::buffer::ByteBuffer;
use crate::codec::{CommandArg, CommandEncoder};
use crate::config::{Config, KeepaliveOptions};
use crate::error::{SsdbError, SsdbResult};
use crate::frame::{Frame, FrameParser, ParseOutcome};
use socket2::{Socket, TcpKeepalive};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::connection::IdleProbe;

/// As [`crate::connection::Connection`], but every suspension point (connect,
/// read, write, the idle probe) is an explicit `.await` instead of a
/// blocking syscall, for use inside a single-threaded event loop.
#[derive(Debug)]
pub struct AsyncConnection {
    host: String,
    port: u16,
    password: Option<String>,
    socket_keepalive: bool,
    socket_keepalive_options: Option<KeepaliveOptions>,
    recv_chunk_size: usize,
    owning_pid: u32,
    socket: Option<TcpStream>,
    buffer: ByteBuffer,
    pending_frame: Option<Frame>,
}

impl AsyncConnection {
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

    pub fn owning_pid(&self) -> u32 {
        self.owning_pid
    }

    #[tracing::instrument(skip(self), fields(host = %self.host, port = self.port))]
    pub async fn connect(&mut self) -> SsdbResult<()> {
        if self.socket.is_some() {
            return Ok(());
        }

        debug!("opening connection");
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
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
            if let Err(err) = self.authenticate(&password).await {
                warn!(error = %err, "auth handshake failed");
                self.disconnect();
                return Err(err);
            }
        }
        Ok(())
    }

    /// As [`crate::connection::Connection::apply_keepalive`]: round-trips the
    /// socket through its `std` form since `socket2` has no tokio-native API.
    fn apply_keepalive(&self, stream: TcpStream) -> SsdbResult<TcpStream> {
        let std_stream = stream.into_std()?;
        let socket = Socket::from(std_stream);
        socket.set_reuse_address(true)?;

        let options = self.socket_keepalive_options.unwrap_or_default();
        let keepalive = TcpKeepalive::new()
            .with_time(options.idle)
            .with_interval(options.interval);
        #[cfg(not(target_os = "windows"))]
        let keepalive = keepalive.with_retries(options.retries);
        socket.set_tcp_keepalive(&keepalive)?;

        let std_stream: std::net::TcpStream = socket.into();
        std_stream.set_nonblocking(true)?;
        Ok(TcpStream::from_std(std_stream)?)
    }

    async fn authenticate(&mut self, password: &str) -> SsdbResult<()> {
        self.send("auth", &[CommandArg::from(password)]).await?;
        let frame = self.read_response().await?;
        match frame.first() {
            Some(status) if status.as_ref() == b"ok" => Ok(()),
            Some(status) => Err(SsdbError::AuthError(
                String::from_utf8_lossy(status).into_owned(),
            )),
            None => Err(SsdbError::AuthError("empty auth response".to_string())),
        }
    }

    pub async fn send(&mut self, cmd: &str, args: &[CommandArg]) -> SsdbResult<()> {
        let bytes = CommandEncoder::encode(cmd, args);
        let socket = self.socket_mut()?;
        socket.write_all(&bytes).await?;
        socket.flush().await?;
        Ok(())
    }

    pub async fn read_response(&mut self) -> SsdbResult<Frame> {
        if let Some(frame) = self.pending_frame.take() {
            return Ok(frame);
        }
        loop {
            match FrameParser::try_parse(&mut self.buffer) {
                ParseOutcome::Complete(frame) => return Ok(frame),
                ParseOutcome::Incomplete => self.fill_buffer().await?,
                ParseOutcome::BadFormat(reason) => {
                    self.disconnect();
                    return Err(SsdbError::ProtocolError(reason));
                }
            }
        }
    }

    async fn fill_buffer(&mut self) -> SsdbResult<()> {
        let chunk_size = self.recv_chunk_size;
        let socket = self.socket_mut()?;
        let mut chunk = vec![0u8; chunk_size];
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            self.disconnect();
            return Err(SsdbError::ConnectionClosed);
        }
        self.buffer.append(&chunk[..n])?;
        Ok(())
    }

    /// `probe_idle`'s non-blocking read is emulated with a zero-duration
    /// `tokio::time::timeout` around the read future.
    #[tracing::instrument(skip(self), fields(host = %self.host, port = self.port))]
    pub async fn probe_idle(&mut self) -> SsdbResult<IdleProbe> {
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

        let mut chunk = [0u8; 4096];
        let socket = self.socket_mut()?;
        match tokio::time::timeout(Duration::ZERO, socket.read(&mut chunk)).await {
            Err(_elapsed) => Ok(IdleProbe::Idle),
            Ok(Ok(0)) => {
                self.disconnect();
                Err(SsdbError::ConnectionClosed)
            }
            Ok(Ok(n)) => {
                self.buffer.append(&chunk[..n])?;
                Ok(IdleProbe::DataPresent)
            }
            Ok(Err(e)) => {
                self.disconnect();
                Err(SsdbError::Io(e))
            }
        }
    }

    pub fn disconnect(&mut self) {
        if let Some(socket) = self.socket.take() {
            debug!(host = %self.host, port = self.port, "disconnecting");
            if std::process::id() == self.owning_pid {
                let _ = socket.set_linger(None);
            }
            drop(socket);
        }
        self.buffer.clear();
        self.pending_frame = None;
    }

    fn socket_mut(&mut self) -> SsdbResult<&mut TcpStream> {
        self.socket.as_mut().ok_or(SsdbError::ConnectionClosed)
    }
}

impl Drop for AsyncConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
