pub mod buffer;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod pool;

#[cfg(feature = "async")]
pub mod client_async;
#[cfg(feature = "async")]
pub mod connection_async;
#[cfg(feature = "async")]
pub mod pool_async;

pub use client::Client;
pub use codec::{CommandArg, CommandClass, Value};
pub use config::{ClientBuilder, Config};
pub use connection::Connection;
pub use error::{SsdbError, SsdbResult};
pub use frame::{Frame, FrameParser};
pub use pool::{ConnectionPool, PooledConnection};

#[cfg(feature = "async")]
pub use client_async::AsyncClient;
#[cfg(feature = "async")]
pub use connection_async::AsyncConnection;
#[cfg(feature = "async")]
pub use pool_async::{AsyncConnectionPool, AsyncPooledConnection};

/// A specialized `Result` type for SSDB operations.
///
/// Defined as a convenience alias over [`SsdbResult`], matching the crate's
/// own error type rather than a boxed `dyn Error`.
///
/// # Examples
///
/// ```rust,no_run
/// use ssdb::{Client, Config};
///
/// fn main() -> ssdb::SsdbResult<()> {
///     let client = Client::new(Config::default());
///     client.set("foo", "bar")?;
///     let value = client.get("foo")?;
///     assert_eq!(value.as_deref(), Some(b"bar".as_ref()));
///     client.close()?;
///     Ok(())
/// }
/// ```
pub type Result<T> = SsdbResult<T>;
