use std::fmt::{Display, Formatter};

use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::FromBytes;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::protocol::ProtocolError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceMode {
    Application,
    Bootloader,
    Unknown(u8),
}

impl From<u8> for DeviceMode {
    fn from(mode: u8) -> Self {
        match mode {
            0x01 => DeviceMode::Application,
            0x0B | 0x0C => DeviceMode::Bootloader,
            mode => DeviceMode::Unknown(mode),
        }
    }
}

impl Display for DeviceMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceMode::Application => f.write_str("application"),
            DeviceMode::Bootloader => f.write_str("bootloader"),
            DeviceMode::Unknown(m) => write!(f, "unknown ({m:#04x})"),
        }
    }
}

/// Payload of an identify report. Newer firmware appends fields after
/// `max_write_size`; they are ignored.
#[derive(FromBytes, Immutable, IntoBytes, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct IdentifyReport {
    version: u8,
    mode: u8,
    part_number: [u8; 16],
    build_id: U32,
    max_write_size: U16,
}

impl IdentifyReport {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        Self::read_from_prefix(payload)
            .map(|(report, _)| report)
            .map_err(|_| ProtocolError::Identify(payload.len()))
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn mode(&self) -> DeviceMode {
        DeviceMode::from(self.mode)
    }

    pub fn part_number(&self) -> String {
        let end = self
            .part_number
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.part_number.len());
        String::from_utf8_lossy(&self.part_number[..end])
            .trim_end()
            .to_string()
    }

    /// Firmware build number ("packrat").
    pub fn build_id(&self) -> u32 {
        self.build_id.get()
    }

    pub fn max_write_size(&self) -> u16 {
        self.max_write_size.get()
    }
}

impl Display for IdentifyReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let version = self.version();
        let mode = self.mode();
        let part = self.part_number();
        let build = self.build_id();
        let max_write = self.max_write_size();
        write!(
            f,
            "Version: {version}\nMode: {mode}\nPart number: {part}\nPackrat: {build}\nMax write size: {max_write}"
        )
    }
}
