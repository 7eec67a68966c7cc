//! Instrument adapters.
//!
//! Every adapter wraps one [`link::Link`] and exposes the capability traits from
//! [`capabilities`]. Construction attempts the handshake once and never fails; faults on
//! later operations are contained inside the adapter.

pub mod capabilities;
pub mod flow_controller;
pub mod link;
pub mod mock;
pub mod modbus;
pub mod power_supply;
pub mod thermocouple;
pub mod vacuum_gauge;

pub use capabilities::{
    Connection, Delivery, GasType, MultiChannelReadable, OutputState, Readable,
    StatefulDiscrete, ValveState, Writable,
};
pub use flow_controller::FlowController;
pub use link::{Endpoint, Link};
pub use power_supply::{Quantity, ScpiPowerSupply, SupplyChannel, SupplyState};
pub use thermocouple::ThermocoupleScanner;
pub use vacuum_gauge::{GaugeKind, VacuumGauge};

/// Fake line-oriented instruments for adapter tests.
#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::link::Link;

    type Handler = Box<dyn FnMut(&str) -> Option<String> + Send>;

    /// Reply table: request line in, optional reply line out.
    pub struct Script(Handler);

    impl Script {
        pub fn new(handler: impl FnMut(&str) -> Option<String> + Send + 'static) -> Self {
            Self(Box::new(handler))
        }
    }

    /// Requests seen by a fake instrument, in arrival order.
    #[derive(Clone, Default)]
    pub struct CommandLog(Arc<Mutex<Vec<String>>>);

    impl CommandLog {
        pub fn lines(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    /// LF-terminated fake instrument.
    pub fn fake_line_instrument(name: &str, script: Script) -> (Link, CommandLog) {
        fake_instrument(name, b'\n', script)
    }

    /// Fake instrument answering requests terminated by `delimiter`.
    pub fn fake_instrument(name: &str, delimiter: u8, mut script: Script) -> (Link, CommandLog) {
        let (host, device) = tokio::io::duplex(1024);
        let log = CommandLog::default();
        let seen = log.clone();

        tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(host);
            let mut reader = BufReader::new(read_half);
            loop {
                let mut buf = Vec::new();
                match reader.read_until(delimiter, &mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(delimiter as char)
                    .to_string();
                seen.0.lock().push(line.clone());
                if let Some(reply) = (script.0)(&line) {
                    let mut out = reply.into_bytes();
                    out.push(delimiter);
                    if write_half.write_all(&out).await.is_err() {
                        break;
                    }
                }
            }
        });

        let link = Link::attached(name, Box::new(device), Duration::from_millis(200));
        (link, log)
    }
}
