//! Instrument Links
//!
//! Transport plumbing shared by every instrument adapter. A [`Link`] owns one
//! connection (TCP socket or serial port) behind a mutex, applies a hard timeout to every
//! exchange, and drops the connection after any fault so the next exchange starts from a
//! clean stream.
//!
//! # Types
//!
//! - [`LinkIO`]: Trait alias combining AsyncRead + AsyncWrite for any byte stream
//! - [`DynLink`]: Type-erased boxed stream
//! - [`Endpoint`]: Where a link connects to, as written in the configuration file
//!
//! # Example
//!
//! ```rust,ignore
//! let endpoint = Endpoint::Tcp { host: "192.168.0.21".into(), port: 5025 };
//! let link = Link::new("cathode", endpoint, Duration::from_secs(1));
//! link.open().await?;
//! let idn = link.query_line(b"*IDN?\n", b'\n').await?;
//! ```

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

/// Trait alias for async instrument I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can back a link:
/// - `tokio::net::TcpStream` (socket instruments)
/// - `tokio_serial::SerialStream` (RS-232/RS-485 instruments)
/// - `tokio::io::DuplexStream` (testing)
pub trait LinkIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> LinkIO for T {}

/// Type-erased boxed stream.
pub type DynLink = Box<dyn LinkIO>;

/// Connection descriptor for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum Endpoint {
    /// Raw TCP socket.
    Tcp {
        /// Host name or IP address.
        host: String,
        /// TCP port.
        port: u16,
    },
    /// Serial line, 8N1, no flow control.
    Serial {
        /// Port path, e.g. `/dev/ttyUSB0` or `COM3`.
        path: String,
        /// Baud rate.
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
}

fn default_baud_rate() -> u32 {
    9600
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Endpoint::Serial { path, baud_rate } => write!(f, "serial://{path} ({baud_rate} baud)"),
        }
    }
}

/// Open a stream to `endpoint`, bounded by `connect_timeout`.
pub async fn open_endpoint(
    endpoint: &Endpoint,
    connect_timeout: Duration,
    device_name: &str,
) -> Result<DynLink> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = timeout(connect_timeout, TcpStream::connect((host.as_str(), *port)))
                .await
                .map_err(|_| anyhow!("{device_name}: connect to {endpoint} timed out"))?
                .with_context(|| format!("{device_name}: connect to {endpoint} failed"))?;
            stream.set_nodelay(true).ok();
            Ok(Box::new(stream))
        }
        Endpoint::Serial { path, baud_rate } => {
            open_serial(path, *baud_rate, connect_timeout, device_name).await
        }
    }
}

#[cfg(feature = "serial")]
async fn open_serial(
    port_path: &str,
    baud_rate: u32,
    open_timeout: Duration,
    device_name: &str,
) -> Result<DynLink> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    let opened = spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .context(format!(
                "Failed to open {} serial port: {}",
                device_name_owned, port_path_owned
            ))
    });

    let port = timeout(open_timeout, opened)
        .await
        .map_err(|_| anyhow!("{device_name}: opening {port_path} timed out"))?
        .context("spawn_blocking for serial port opening failed")??;
    Ok(Box::new(port))
}

#[cfg(not(feature = "serial"))]
async fn open_serial(
    port_path: &str,
    _baud_rate: u32,
    _open_timeout: Duration,
    device_name: &str,
) -> Result<DynLink> {
    bail!("{device_name}: serial support not enabled, cannot open {port_path}; rebuild with --features serial")
}

/// Drain stale bytes from a stream until nothing arrives for `quiet`.
///
/// Returns the number of bytes discarded.
pub async fn drain_stale<R: AsyncRead + Unpin>(port: &mut R, quiet: Duration) -> usize {
    let mut discard = [0u8; 256];
    let mut total_discarded = 0usize;

    loop {
        match timeout(quiet, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total_discarded
}

type Port = BufReader<DynLink>;

/// One instrument connection with per-exchange timeout and lazy reopen.
pub struct Link {
    name: String,
    endpoint: Option<Endpoint>,
    timeout: Duration,
    port: Mutex<Option<Port>>,
}

impl Link {
    /// Create an unopened link. Nothing touches the network until [`Link::open`] or the
    /// first exchange.
    pub fn new(name: impl Into<String>, endpoint: Endpoint, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            endpoint: Some(endpoint),
            timeout,
            port: Mutex::new(None),
        }
    }

    /// Wrap an already-open stream. Once the stream faults it cannot be reopened.
    pub fn attached(name: impl Into<String>, stream: DynLink, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            endpoint: None,
            timeout,
            port: Mutex::new(Some(BufReader::new(stream))),
        }
    }

    /// Device name used in error messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Per-exchange timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open the connection now if it is not already open.
    pub async fn open(&self) -> Result<()> {
        let mut guard = self.port.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_port().await?);
        }
        Ok(())
    }

    /// Close the connection. A later exchange reopens it if the link has an endpoint.
    pub async fn close(&self) {
        if let Some(mut port) = self.port.lock().await.take() {
            port.get_mut().shutdown().await.ok();
        }
    }

    async fn open_port(&self) -> Result<Port> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| anyhow!("{}: link closed", self.name))?;
        debug!(device = %self.name, %endpoint, "opening link");
        let stream = open_endpoint(endpoint, self.timeout, &self.name).await?;
        Ok(BufReader::new(stream))
    }

    // The port leaves the slot for the whole exchange. If the caller drops the future
    // mid-exchange the port goes with it, so a late reply can never be read as the answer
    // to the next request.
    async fn checkout(&self, slot: &mut Option<Port>) -> Result<Port> {
        match slot.take() {
            Some(port) => Ok(port),
            None => self.open_port().await,
        }
    }

    fn settle<T>(
        &self,
        slot: &mut Option<Port>,
        port: Port,
        outcome: std::result::Result<Result<T>, tokio::time::error::Elapsed>,
    ) -> Result<T> {
        match outcome {
            Ok(Ok(value)) => {
                *slot = Some(port);
                Ok(value)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(anyhow!("{}: no response within {:?}", self.name, self.timeout)),
        }
    }

    /// Write `request` without waiting for a reply.
    pub async fn send(&self, request: &[u8]) -> Result<()> {
        let mut guard = self.port.lock().await;
        let mut port = self.checkout(&mut guard).await?;
        let outcome = timeout(self.timeout, async {
            port.get_mut().write_all(request).await?;
            port.get_mut().flush().await?;
            Ok(())
        })
        .await;
        self.settle(&mut guard, port, outcome)
    }

    /// Write `request` and read one reply terminated by `delimiter`.
    ///
    /// The returned string has the delimiter and surrounding whitespace removed.
    pub async fn query_line(&self, request: &[u8], delimiter: u8) -> Result<String> {
        let mut guard = self.port.lock().await;
        let mut port = self.checkout(&mut guard).await?;
        let outcome = timeout(self.timeout, async {
            port.get_mut().write_all(request).await?;
            port.get_mut().flush().await?;
            let mut buf = Vec::with_capacity(64);
            let n = port.read_until(delimiter, &mut buf).await?;
            if n == 0 {
                bail!("link closed by peer");
            }
            Ok(String::from_utf8_lossy(&buf)
                .trim_matches(|c: char| c.is_whitespace() || c == '\0' || c == delimiter as char)
                .to_string())
        })
        .await;
        self.settle(&mut guard, port, outcome)
    }

    /// Write `request` and read a binary reply whose length is derived from its header.
    ///
    /// `header_len` bytes are read first, then `remaining(&header)` more bytes. The full
    /// frame (header included) is returned.
    pub async fn query_frame<F>(&self, request: &[u8], header_len: usize, remaining: F) -> Result<Vec<u8>>
    where
        F: FnOnce(&[u8]) -> Result<usize> + Send,
    {
        let mut guard = self.port.lock().await;
        let mut port = self.checkout(&mut guard).await?;
        let outcome = timeout(self.timeout, async {
            port.get_mut().write_all(request).await?;
            port.get_mut().flush().await?;
            let mut frame = vec![0u8; header_len];
            port.read_exact(&mut frame).await?;
            let rest = remaining(&frame)?;
            let start = frame.len();
            frame.resize(start + rest, 0);
            port.read_exact(&mut frame[start..]).await?;
            Ok(frame)
        })
        .await;
        self.settle(&mut guard, port, outcome)
    }

    /// Discard bytes left over from earlier replies nobody read.
    pub async fn discard_pending(&self, quiet: Duration) -> usize {
        let mut guard = self.port.lock().await;
        match guard.as_mut() {
            Some(port) => {
                let buffered = port.buffer().len();
                port.consume(buffered);
                buffered + drain_stale(port.get_mut(), quiet).await
            }
            None => 0,
        }
    }

    /// Whether a connection is currently held.
    pub async fn is_open(&self) -> bool {
        self.port.lock().await.is_some()
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_query_line_with_duplex() {
        let (mut host, device) = tokio::io::duplex(64);
        let link = Link::attached("psu", Box::new(device), Duration::from_millis(200));

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 32];
            let n = host.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*IDN?\n");
            host.write_all(b"ACME,PSU-1000,42\n").await.unwrap();
            host
        });

        let reply = link.query_line(b"*IDN?\n", b'\n').await.unwrap();
        assert_eq!(reply, "ACME,PSU-1000,42");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_drops_connection() {
        let (_host, device) = tokio::io::duplex(64);
        let link = Link::attached("gauge", Box::new(device), Duration::from_millis(30));

        let err = link.query_line(b"001MF\r", b'\r').await.unwrap_err();
        assert!(err.to_string().contains("no response"));
        assert!(!link.is_open().await);

        // An attached link has no endpoint to reopen.
        let err = link.send(b"x").await.unwrap_err();
        assert!(err.to_string().contains("link closed"));
    }

    #[tokio::test]
    async fn test_abandoned_query_drops_connection() {
        let (mut host, device) = tokio::io::duplex(64);
        let link = Link::attached("psu", Box::new(device), Duration::from_millis(500));

        tokio::spawn(async move {
            let mut buf = [0u8; 32];
            let _ = host.read(&mut buf).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = host.write_all(b"22.0\n").await;
            host
        });

        // The caller gives up before the reply arrives.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            link.query_line(b"MEASURE:CURRENT?\n", b'\n'),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(!link.is_open().await);

        // The late reply must not answer the next request.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(link.query_line(b"MEASURE:VOLTAGE?\n", b'\n').await.is_err());
    }

    #[tokio::test]
    async fn test_scripted_exchange_keeps_line_order() {
        let mock = tokio_test::io::Builder::new()
            .write(b"MEASURE:VOLTAGE?\n")
            .read(b"12.50\n")
            .write(b"OUTPUT ON\n")
            .write(b"MEASURE:CURRENT?\n")
            .read(b"0.75\r\n")
            .build();
        let link = Link::attached("psu", Box::new(mock), Duration::from_millis(200));

        assert_eq!(link.query_line(b"MEASURE:VOLTAGE?\n", b'\n').await.unwrap(), "12.50");
        link.send(b"OUTPUT ON\n").await.unwrap();
        assert_eq!(link.query_line(b"MEASURE:CURRENT?\n", b'\n').await.unwrap(), "0.75");
    }

    #[tokio::test]
    async fn test_query_frame_reads_declared_length() {
        let (mut host, device) = tokio::io::duplex(64);
        let link = Link::attached("mfc", Box::new(device), Duration::from_millis(200));

        tokio::spawn(async move {
            let mut buf = [0u8; 8];
            host.read_exact(&mut buf).await.unwrap();
            host.write_all(&[1, 3, 2, 0xAB, 0xCD, 9, 9]).await.unwrap();
        });

        let frame = link
            .query_frame(&[0u8; 8], 3, |header| Ok(header[2] as usize + 2))
            .await
            .unwrap();
        assert_eq!(frame, vec![1, 3, 2, 0xAB, 0xCD, 9, 9]);
    }

    #[tokio::test]
    async fn test_peer_close_is_an_error() {
        let (host, device) = tokio::io::duplex(64);
        let link = Link::attached("psu", Box::new(device), Duration::from_millis(200));
        drop(host);
        assert!(link.query_line(b"MEAS:VOLT?\n", b'\n').await.is_err());
    }

    #[tokio::test]
    async fn test_drain_stale() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(b"stale data 12345").await.unwrap();
        let discarded = drain_stale(&mut device, Duration::from_millis(20)).await;
        assert_eq!(discarded, 16);
    }

    #[tokio::test]
    async fn test_unreachable_tcp_endpoint_fails_fast() {
        // Port 9 on localhost is normally closed; either refusal or timeout is acceptable.
        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port: 9,
        };
        let link = Link::new("nowhere", endpoint, Duration::from_millis(200));
        assert!(link.open().await.is_err());
    }

    #[test]
    fn endpoint_deserializes_from_tagged_table() {
        let endpoint: Endpoint = toml::from_str(
            r#"
            transport = "serial"
            path = "/dev/ttyUSB0"
            "#,
        )
        .unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Serial {
                path: "/dev/ttyUSB0".into(),
                baud_rate: 9600
            }
        );
        assert_eq!(endpoint.to_string(), "serial:///dev/ttyUSB0 (9600 baud)");
    }
}
