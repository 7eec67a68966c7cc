//! Modbus RTU framing.
//!
//! Only the two function codes the flow controller needs are supported: 0x03 (read
//! holding registers) and 0x06 (write single register). Frames are the same on a serial
//! line and on an RTU-over-TCP gateway, so the master runs over any [`Link`].
//!
//! Frame layout: `unit | function | payload | crc_lo | crc_hi`, CRC-16/MODBUS over
//! everything before the CRC.

use anyhow::{anyhow, bail, ensure, Result};
use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use tracing::trace;

use super::link::Link;

/// Read holding registers.
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
/// Write single register.
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;

const EXCEPTION_FLAG: u8 = 0x80;
const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

fn seal(mut frame: BytesMut) -> Vec<u8> {
    let crc = crc16(&frame);
    frame.put_u16_le(crc);
    frame.to_vec()
}

/// Build a function 0x03 request.
pub fn read_holding_request(unit: u8, start: u16, count: u16) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(8);
    frame.put_u8(unit);
    frame.put_u8(READ_HOLDING_REGISTERS);
    frame.put_u16(start);
    frame.put_u16(count);
    seal(frame)
}

/// Build a function 0x06 request.
pub fn write_register_request(unit: u8, address: u16, value: u16) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(8);
    frame.put_u8(unit);
    frame.put_u8(WRITE_SINGLE_REGISTER);
    frame.put_u16(address);
    frame.put_u16(value);
    seal(frame)
}

/// Bytes still to read after the 3-byte response header.
pub fn remaining_after_header(header: &[u8]) -> Result<usize> {
    ensure!(header.len() >= 3, "short modbus header");
    let function = header[1];
    if function & EXCEPTION_FLAG != 0 {
        // exception code already in header[2], CRC follows
        return Ok(2);
    }
    match function {
        READ_HOLDING_REGISTERS => Ok(header[2] as usize + 2),
        WRITE_SINGLE_REGISTER => Ok(5),
        other => bail!("unsupported modbus function 0x{other:02X}"),
    }
}

fn check_frame(frame: &[u8], unit: u8, function: u8) -> Result<&[u8]> {
    ensure!(frame.len() >= 5, "modbus frame too short ({} bytes)", frame.len());
    let (body, crc_bytes) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let expected = crc16(body);
    ensure!(
        received == expected,
        "modbus CRC mismatch: received 0x{received:04X}, expected 0x{expected:04X}"
    );
    ensure!(body[0] == unit, "reply from unit {} while talking to {unit}", body[0]);
    if body[1] == function | EXCEPTION_FLAG {
        bail!("modbus exception 0x{:02X} for function 0x{function:02X}", body[2]);
    }
    ensure!(
        body[1] == function,
        "unexpected function 0x{:02X} in reply",
        body[1]
    );
    Ok(&body[2..])
}

/// Decode a function 0x03 response into register values.
pub fn parse_read_response(frame: &[u8], unit: u8, count: u16) -> Result<Vec<u16>> {
    let mut payload = check_frame(frame, unit, READ_HOLDING_REGISTERS)?;
    let byte_count = payload.get_u8() as usize;
    ensure!(
        byte_count == count as usize * 2 && payload.remaining() == byte_count,
        "expected {count} registers, got {byte_count} data bytes"
    );
    Ok((0..count).map(|_| payload.get_u16()).collect())
}

/// Check a function 0x06 echo.
pub fn parse_write_response(frame: &[u8], unit: u8, address: u16, value: u16) -> Result<()> {
    let mut payload = check_frame(frame, unit, WRITE_SINGLE_REGISTER)?;
    ensure!(payload.remaining() == 4, "malformed write echo");
    let echoed = (payload.get_u16(), payload.get_u16());
    ensure!(
        echoed == (address, value),
        "write echo mismatch: sent ({address}, {value}), got {echoed:?}"
    );
    Ok(())
}

/// Modbus RTU master for one unit on one link.
#[derive(Debug)]
pub struct ModbusRtu {
    link: Link,
    unit: u8,
}

impl ModbusRtu {
    /// Talk to `unit` over `link`.
    pub fn new(link: Link, unit: u8) -> Self {
        Self { link, unit }
    }

    /// Underlying link.
    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Read `count` holding registers starting at `start`.
    pub async fn read_holding_registers(&self, start: u16, count: u16) -> Result<Vec<u16>> {
        let request = read_holding_request(self.unit, start, count);
        trace!(device = self.link.name(), ?request, "modbus read");
        let frame = self
            .link
            .query_frame(&request, 3, remaining_after_header)
            .await?;
        parse_read_response(&frame, self.unit, count)
            .map_err(|err| anyhow!("{}: {err}", self.link.name()))
    }

    /// Write one holding register.
    pub async fn write_register(&self, address: u16, value: u16) -> Result<()> {
        let request = write_register_request(self.unit, address, value);
        trace!(device = self.link.name(), ?request, "modbus write");
        let frame = self
            .link
            .query_frame(&request, 3, remaining_after_header)
            .await?;
        parse_write_response(&frame, self.unit, address, value)
            .map_err(|err| anyhow!("{}: {err}", self.link.name()))
    }
}
