//! MQTT 3.1.1 publisher (QoS 0 only).
//!
//! Only the packets a fire-and-forget publisher needs are implemented:
//!
//! | Packet     | Header | Notes |
//! |------------|--------|-------|
//! | CONNECT    | 0x10   | clean session, keep-alive 0 (no pings needed) |
//! | CONNACK    | 0x20   | return code must be 0 |
//! | PUBLISH    | 0x30   | QoS 0, no packet id |
//! | DISCONNECT | 0xE0   | sent on shutdown |
//!
//! The connection is kept open across snapshots. After a fault the next publish
//! reconnects, at most once per `reconnect_interval`; publishes in between fail fast.
//! A QoS 0 session gets nothing back from the broker, so before each publish the
//! socket is drained without blocking and end-of-stream counts as a fault.

use anyhow::{anyhow, bail, ensure, Context, Result};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::bus::MessageBus;

const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const PUBLISH_QOS0: u8 = 0x30;
const DISCONNECT: u8 = 0xE0;
const PROTOCOL_LEVEL: u8 = 4;
const CLEAN_SESSION: u8 = 0x02;
const MAX_REMAINING_LENGTH: usize = 268_435_455;

fn put_remaining_length(buf: &mut BytesMut, mut len: usize) -> Result<()> {
    ensure!(len <= MAX_REMAINING_LENGTH, "packet too large ({len} bytes)");
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| anyhow!("string field too long"))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// CONNECT packet.
pub fn encode_connect(client_id: &str, keep_alive_secs: u16) -> Result<Bytes> {
    let mut body = BytesMut::new();
    put_string(&mut body, "MQTT")?;
    body.put_u8(PROTOCOL_LEVEL);
    body.put_u8(CLEAN_SESSION);
    body.put_u16(keep_alive_secs);
    put_string(&mut body, client_id)?;

    let mut packet = BytesMut::with_capacity(body.len() + 5);
    packet.put_u8(CONNECT);
    put_remaining_length(&mut packet, body.len())?;
    packet.put_slice(&body);
    Ok(packet.freeze())
}

/// QoS 0 PUBLISH packet.
pub fn encode_publish(topic: &str, payload: &[u8]) -> Result<Bytes> {
    ensure!(!topic.is_empty(), "empty topic");
    let remaining = 2 + topic.len() + payload.len();
    let mut packet = BytesMut::with_capacity(remaining + 5);
    packet.put_u8(PUBLISH_QOS0);
    put_remaining_length(&mut packet, remaining)?;
    put_string(&mut packet, topic)?;
    packet.put_slice(payload);
    Ok(packet.freeze())
}

/// DISCONNECT packet.
pub fn encode_disconnect() -> Bytes {
    Bytes::from_static(&[DISCONNECT, 0x00])
}

/// Check a CONNACK.
pub fn check_connack(packet: &[u8; 4]) -> Result<()> {
    ensure!(
        packet[0] == CONNACK && packet[1] == 0x02,
        "expected CONNACK, got {:02X?}",
        packet
    );
    match packet[3] {
        0 => Ok(()),
        1 => bail!("broker refused connection: unacceptable protocol version"),
        2 => bail!("broker refused connection: client identifier rejected"),
        3 => bail!("broker refused connection: server unavailable"),
        4 => bail!("broker refused connection: bad user name or password"),
        5 => bail!("broker refused connection: not authorized"),
        code => bail!("broker refused connection: return code {code}"),
    }
}

/// Broker coordinates and retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttSettings {
    /// Broker host.
    pub broker: String,
    /// Broker port.
    pub port: u16,
    /// Client identifier.
    pub client_id: String,
    /// Bound on connect plus CONNACK, and on each publish write.
    pub connect_timeout: Duration,
    /// Minimum time between connection attempts.
    pub reconnect_interval: Duration,
}

/// Persistent-connection QoS 0 publisher.
pub struct MqttPublisher {
    settings: MqttSettings,
    stream: Option<TcpStream>,
    last_attempt: Option<Instant>,
}

impl MqttPublisher {
    /// Unconnected publisher; the first publish connects.
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings,
            stream: None,
            last_attempt: None,
        }
    }

    /// Whether a broker connection is held.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect now, regardless of the reconnect interval.
    pub async fn connect(&mut self) -> Result<()> {
        self.last_attempt = Some(Instant::now());
        let settings = &self.settings;
        let address = format!("{}:{}", settings.broker, settings.port);

        let stream = timeout(settings.connect_timeout, async {
            let mut stream = TcpStream::connect(&address)
                .await
                .with_context(|| format!("connect to broker {address}"))?;
            stream.set_nodelay(true).ok();
            stream
                .write_all(&encode_connect(&settings.client_id, 0)?)
                .await?;
            let mut ack = [0u8; 4];
            stream
                .read_exact(&mut ack)
                .await
                .context("waiting for CONNACK")?;
            check_connack(&ack)?;
            Ok::<_, anyhow::Error>(stream)
        })
        .await
        .map_err(|_| anyhow!("broker {address} did not answer within {:?}", settings.connect_timeout))??;

        info!(broker = %address, client_id = %settings.client_id, "connected to message broker");
        self.stream = Some(stream);
        Ok(())
    }

    async fn ensure_connected(&mut self) -> Result<&mut TcpStream> {
        if self.stream.as_ref().map_or(false, broker_hung_up) {
            warn!("message broker closed the connection");
            self.stream = None;
        }
        if self.stream.is_none() {
            let due = self
                .last_attempt
                .map_or(true, |at| at.elapsed() >= self.settings.reconnect_interval);
            if !due {
                bail!("broker unavailable, waiting before reconnecting");
            }
            if let Err(err) = self.connect().await {
                warn!(error = %err, retry_in = ?self.settings.reconnect_interval, "message broker unreachable");
                return Err(err);
            }
        }
        self.stream
            .as_mut()
            .ok_or_else(|| anyhow!("broker connection lost"))
    }
}

/// Non-blocking check for a closed or failed broker socket. Stray bytes are discarded.
fn broker_hung_up(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match stream.try_read(&mut buf) {
            Ok(0) => return true,
            Ok(n) => debug!(bytes = n, "discarding unsolicited broker data"),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return false,
            Err(err) => {
                debug!(error = %err, "broker socket failed");
                return true;
            }
        }
    }
}

#[async_trait]
impl MessageBus for MqttPublisher {
    async fn publish(&mut self, topic: &str, payload: &str) -> Result<()> {
        let packet = encode_publish(topic, payload.as_bytes())?;
        let write_timeout = self.settings.connect_timeout;
        let stream = self.ensure_connected().await?;
        let outcome = timeout(write_timeout, stream.write_all(&packet)).await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.stream = None;
                Err(anyhow!(err).context("broker connection lost"))
            }
            Err(_) => {
                self.stream = None;
                Err(anyhow!("publish to {topic} timed out"))
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.write_all(&encode_disconnect()).await {
                debug!(error = %err, "DISCONNECT not delivered");
            }
            stream.shutdown().await.ok();
            info!("disconnected from message broker");
        }
    }
}
