//! WFIREX4 wire protocol
//!
//! Every request is a frame:
//!   0xAA | PayloadLen(2,BE) | Payload(N) | CRC8(1)
//!
//! Payloads start with an opcode. Sending an IR code uses
//! `11 00 | CodeLen(2,BE) | Code(N)`; learning and sensor reads are
//! bare one-byte opcodes. Responses are only checked for the 0xAA
//! header; the firmware's checksums are not verified on the way in.

mod crc;

pub use crc::checksum;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{DeviceError, Result};

/// Frame header byte
pub const HEADER: u8 = 0xAA;

/// Opcode prefix of a send-IR-code payload
pub const OPCODE_SEND: [u8; 2] = [0x11, 0x00];
pub const OPCODE_LEARN: u8 = 0x12;
pub const OPCODE_TELEMETRY: u8 = 0x18;

/// Learn trigger, `AA 00 01 12 6C`
pub const LEARN_REQUEST: [u8; 5] = [HEADER, 0x00, 0x01, OPCODE_LEARN, 0x6C];

/// Sensor read request, `AA 00 01 18 50`
pub const TELEMETRY_REQUEST: [u8; 5] = [HEADER, 0x00, 0x01, OPCODE_TELEMETRY, 0x50];

/// Smallest sensor response that carries every field
pub const TELEMETRY_MIN_LEN: usize = 12;

/// Bytes stripped from a learn response to get the IR code
/// (header, length and opcode framing)
pub const LEARN_PREFIX_LEN: usize = 8;

/// An encoded request frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Vec<u8>,
    payload_len: u16,
    checksum: u8,
}

impl Frame {
    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.payload.len());
        buf.put_u8(HEADER);
        buf.put_u16(self.payload_len);
        buf.put_slice(&self.payload);
        buf.put_u8(self.checksum);
        buf.to_vec()
    }
}

fn length_field(len: usize, what: &str) -> Result<u16> {
    u16::try_from(len).map_err(|_| {
        DeviceError::InvalidCode(format!(
            "{} of {} bytes exceeds the {} byte frame limit",
            what,
            len,
            u16::MAX
        ))
    })
}

/// Build a frame around `payload`
///
/// Fails if the payload does not fit the 16-bit length field.
pub fn encode(payload: &[u8]) -> Result<Frame> {
    Ok(Frame {
        payload_len: length_field(payload.len(), "payload")?,
        payload: payload.to_vec(),
        checksum: checksum(payload),
    })
}

/// Payload for transmitting an IR code
pub fn command_payload(code: &[u8]) -> Result<Vec<u8>> {
    let code_len = length_field(code.len(), "IR code")?;
    let mut buf = BytesMut::with_capacity(4 + code.len());
    buf.put_slice(&OPCODE_SEND);
    buf.put_u16(code_len);
    buf.put_slice(code);
    Ok(buf.to_vec())
}

/// Wire bytes of the frame that transmits `code`
pub fn command_frame(code: &[u8]) -> Result<Vec<u8>> {
    Ok(encode(&command_payload(code)?)?.to_bytes())
}

/// A device response that passed the header check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub raw: Vec<u8>,
}

impl Response {
    /// Declared payload length, if the response is long enough to carry one
    pub fn declared_len(&self) -> Option<u16> {
        (self.raw.len() >= 3).then(|| u16::from_be_bytes([self.raw[1], self.raw[2]]))
    }

    /// Payload bytes following header and length, trailing checksum excluded
    ///
    /// Uses the declared length when the buffer holds it, otherwise
    /// everything after the length field.
    pub fn payload(&self) -> &[u8] {
        if self.raw.len() < 3 {
            return &[];
        }
        let body = &self.raw[3..];
        match self.declared_len() {
            Some(len) if (len as usize) <= body.len() => &body[..len as usize],
            _ => body,
        }
    }
}

/// Accept a response if it is non-empty and starts with the header byte
pub fn decode(raw: &[u8]) -> Result<Response> {
    match raw.first() {
        None => Err(DeviceError::Format("empty response".to_string())),
        Some(&HEADER) => Ok(Response { raw: raw.to_vec() }),
        Some(other) => Err(DeviceError::Format(format!(
            "unexpected header byte 0x{:02x}",
            other
        ))),
    }
}

/// Raw sensor fields from a telemetry response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Telemetry {
    /// Humidity in 0.1 %
    pub humidity_raw: u16,
    /// Temperature in 0.1 °C
    pub temperature_raw: u16,
    /// Illuminance in lx
    pub illuminance: u16,
    /// Signal activity, 0-255
    pub activity: u8,
}

impl Telemetry {
    /// Parse a sensor response
    ///
    /// Accepts anything of at least 12 bytes starting with 0xAA; the
    /// declared length is not cross-checked.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < TELEMETRY_MIN_LEN {
            return Err(DeviceError::Format(format!(
                "sensor response too short: {} bytes (minimum {})",
                data.len(),
                TELEMETRY_MIN_LEN
            )));
        }
        let response = decode(data)?;

        let mut buf = &response.raw[5..TELEMETRY_MIN_LEN];
        let humidity_raw = buf.get_u16();
        let temperature_raw = buf.get_u16();
        let illuminance = buf.get_u16();
        let activity = buf.get_u8();

        Ok(Telemetry {
            humidity_raw,
            temperature_raw,
            illuminance,
            activity,
        })
    }
}

/// Extract the learned IR code (hex) from a learn response
pub fn learned_code(data: &[u8]) -> Result<String> {
    let response = decode(data)
        .map_err(|_| DeviceError::Learn("unexpected response".to_string()))?;
    let code = response
        .raw
        .get(LEARN_PREFIX_LEN..)
        .map(hex::encode)
        .unwrap_or_default();
    Ok(code)
}
