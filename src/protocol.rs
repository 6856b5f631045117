//! TouchComm framing.
//!
//! Commands go out as `code, length (u16 LE), payload`. Replies start with
//! `0xA5`, a status byte and a u16 LE length; a non-empty payload is
//! followed by the `0x5A` end code.
use std::fmt::{Display, Formatter};
use std::io;

use crate::identify::DeviceMode;

pub const START_CODE: u8 = 0xA5;
pub const END_CODE: u8 = 0x5A;
pub const HEADER_SIZE: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandValue {
    Identify = 0x02,
    Reset = 0x04,
    EnableReport = 0x05,
    DisableReport = 0x06,
    EraseFlash = 0x11,
    WriteFlash = 0x12,
    RunApplicationFirmware = 0x14,
    EnterBootloader = 0x1F,
    GetStaticConfig = 0x21,
    ReadMemory = 0x81,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Idle,
    Ok,
    ContinuedRead,
    IdentifyReport,
    Other(u8),
}

impl From<u8> for Status {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Status::Idle,
            0x01 => Status::Ok,
            0x03 => Status::ContinuedRead,
            0x10 => Status::IdentifyReport,
            code => Status::Other(code),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("bad start code {0:#04x}")]
    BadStartCode(u8),
    #[error("bad end code {0:#04x}")]
    BadEndCode(u8),
    #[error("packet is {actual} bytes, header announces {expected}")]
    Length { expected: usize, actual: usize },
    #[error("payload of {0} bytes does not fit a command")]
    PayloadTooLarge(usize),
    #[error("no reply to command {command:#04x}")]
    NoReply { command: u8 },
    #[error("command {command:#04x} failed with status {status:#04x}")]
    Status { command: u8, status: u8 },
    #[error("identify report too short ({0} bytes)")]
    Identify(usize),
    #[error("device is in {0} mode")]
    UnexpectedMode(DeviceMode),
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    code: u8,
    payload: Vec<u8>,
}

impl Command {
    pub fn new(code: CommandValue, payload: Vec<u8>) -> Self {
        Self::raw(code as u8, payload)
    }

    pub fn raw(code: u8, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let size = u16::try_from(self.payload.len())
            .map_err(|_| ProtocolError::PayloadTooLarge(self.payload.len()))?;
        let mut frame = Vec::with_capacity(3 + self.payload.len());
        frame.push(self.code);
        frame.extend_from_slice(&size.to_le_bytes());
        frame.extend_from_slice(&self.payload);
        Ok(frame)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: u8,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn status(&self) -> Status {
        Status::from(self.status)
    }

    pub fn is_idle(&self) -> bool {
        self.status() == Status::Idle && self.payload.is_empty()
    }

    pub fn header(&self) -> [u8; HEADER_SIZE] {
        let [l0, l1] = (self.payload.len() as u16).to_le_bytes();
        [START_CODE, self.status, l0, l1]
    }

    /// Returns the status byte and payload length announced by a header.
    pub fn parse_header(header: &[u8; HEADER_SIZE]) -> Result<(u8, usize), ProtocolError> {
        if header[0] != START_CODE {
            return Err(ProtocolError::BadStartCode(header[0]));
        }
        let length = u16::from_le_bytes([header[2], header[3]]) as usize;
        Ok((header[1], length))
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::decode(bytes, true)
    }

    /// Parses the hex text of a captured reply, e.g. `"A5010200AABB"`.
    ///
    /// Captures usually lack the end code, so it is optional here.
    pub fn from_hex(text: &str) -> Result<Self, ProtocolError> {
        let digits: String = text
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '"')
            .collect();
        let bytes = hex::decode(digits)?;
        Self::decode(&bytes, false)
    }

    fn decode(bytes: &[u8], end_required: bool) -> Result<Self, ProtocolError> {
        let header: &[u8; HEADER_SIZE] = bytes
            .get(..HEADER_SIZE)
            .and_then(|h| h.try_into().ok())
            .ok_or(ProtocolError::Length {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            })?;
        let (status, length) = Self::parse_header(header)?;
        let body = &bytes[HEADER_SIZE..];

        let framed = if length == 0 { 0 } else { length + 1 };
        if body.len() == framed {
            if let Some(&end) = body.get(length) {
                if end != END_CODE {
                    return Err(ProtocolError::BadEndCode(end));
                }
            }
        } else if end_required || body.len() != length {
            return Err(ProtocolError::Length {
                expected: HEADER_SIZE + framed,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            status,
            payload: body[..length].to_vec(),
        })
    }
}

impl Display for Response {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}",
            hex::encode_upper(self.header()),
            hex::encode_upper(&self.payload)
        )
    }
}
