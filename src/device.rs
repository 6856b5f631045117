//! Request/response exchanges with a TouchComm controller over a byte
//! stream (serial port or TCP bridge).
use std::io::{Read, Write};
use std::thread::sleep;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::identify::{DeviceMode, IdentifyReport};
use crate::protocol::{
    Command, CommandValue, ProtocolError, Response, Status, HEADER_SIZE, START_CODE,
};
use crate::update::{AreaUpdate, EraseRange, UpdatePlan, PRE_ERASE};

// Header-sized reads worth of stray bytes skipped while hunting for a start code.
const RESYNC_ATTEMPTS: usize = 10;
const RESYNC_LIMIT: usize = RESYNC_ATTEMPTS * HEADER_SIZE;
// Idle replies tolerated while the controller is still busy.
const IDLE_RETRIES: usize = 3;

#[derive(Clone, Copy, Debug)]
pub struct Timing {
    /// Delay between a command and reading its reply
    pub settle: Duration,
    /// Delay between idle replies
    pub idle_delay: Duration,
    pub erase: Duration,
    pub long_erase: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(100),
            idle_delay: Duration::from_millis(100),
            erase: Duration::from_secs(1),
            long_erase: Duration::from_secs(8),
        }
    }
}

pub struct Device<P> {
    port: P,
    timing: Timing,
}

impl<P: Read + Write> Device<P> {
    pub fn new(port: P) -> Self {
        Self::with_timing(port, Timing::default())
    }

    pub fn with_timing(port: P, timing: Timing) -> Self {
        Self { port, timing }
    }

    pub fn send(&mut self, command: &Command) -> Result<(), ProtocolError> {
        let frame = command.to_bytes()?;
        if frame.len() > 64 {
            debug!("-> {:02X} ({} bytes)", command.code(), frame.len());
        } else {
            debug!("-> {}", hex::encode_upper(&frame));
        }
        self.port.write_all(&frame)?;
        self.port.flush()?;
        Ok(())
    }

    /// Reads one reply, skipping over garbage until a start code shows up.
    pub fn read_response(&mut self) -> Result<Response, ProtocolError> {
        let mut byte = [0u8; 1];
        let mut skipped = 0;
        loop {
            self.port.read_exact(&mut byte)?;
            if byte[0] == START_CODE {
                break;
            }
            skipped += 1;
            if skipped >= RESYNC_LIMIT {
                return Err(ProtocolError::BadStartCode(byte[0]));
            }
        }
        if skipped > 0 {
            warn!("Skipped {skipped} bytes before the start code");
        }

        let mut header = [START_CODE; HEADER_SIZE];
        self.port.read_exact(&mut header[1..])?;
        let (_, length) = Response::parse_header(&header)?;

        // Payload and end code follow only when there is a payload.
        let body = if length == 0 { 0 } else { length + 1 };
        let mut frame = header.to_vec();
        frame.resize(HEADER_SIZE + body, 0);
        self.port.read_exact(&mut frame[HEADER_SIZE..])?;
        let response = Response::parse(&frame)?;
        debug!("<- {response}");
        Ok(response)
    }

    /// Reads the reply to `command`, tolerating a few idle packets.
    pub fn read_reply(&mut self, command: u8) -> Result<Response, ProtocolError> {
        for _ in 0..IDLE_RETRIES {
            let response = self.read_response()?;
            if !response.is_idle() {
                return Ok(response);
            }
            sleep(self.timing.idle_delay);
        }
        Err(ProtocolError::NoReply { command })
    }

    pub fn transact(&mut self, command: &Command, settle: Duration) -> Result<Response, ProtocolError> {
        self.send(command)?;
        sleep(settle);
        self.read_reply(command.code())
    }

    fn transact_ok(&mut self, command: &Command, settle: Duration) -> Result<Response, ProtocolError> {
        let response = self.transact(command, settle)?;
        match response.status() {
            Status::Ok => Ok(response),
            _ => Err(ProtocolError::Status {
                command: command.code(),
                status: response.status,
            }),
        }
    }

    /// Sends an arbitrary command; with `reply` unset nothing is read back.
    pub fn raw(&mut self, command: &Command, reply: bool) -> Result<Option<Response>, ProtocolError> {
        if !reply {
            self.send(command)?;
            return Ok(None);
        }
        let settle = self.timing.settle;
        self.transact(command, settle).map(Some)
    }

    pub fn identify(&mut self) -> Result<IdentifyReport, ProtocolError> {
        let command = Command::new(CommandValue::Identify, vec![]);
        let settle = self.timing.settle;
        let response = self.transact(&command, settle)?;
        match response.status() {
            Status::Ok | Status::IdentifyReport => IdentifyReport::parse(&response.payload),
            _ => Err(ProtocolError::Status {
                command: command.code(),
                status: response.status,
            }),
        }
    }

    pub fn mode(&mut self) -> Result<DeviceMode, ProtocolError> {
        Ok(self.identify()?.mode())
    }

    /// Switches to the bootloader unless it is already running.
    pub fn ensure_bootloader(&mut self) -> Result<(), ProtocolError> {
        match self.mode()? {
            DeviceMode::Bootloader => Ok(()),
            DeviceMode::Application => self.enter_bootloader(),
            mode => Err(ProtocolError::UnexpectedMode(mode)),
        }
    }

    pub fn enter_bootloader(&mut self) -> Result<(), ProtocolError> {
        info!("Entering bootloader");
        let command = Command::new(CommandValue::EnterBootloader, vec![]);
        let settle = self.timing.settle;
        let response = self.transact(&command, settle)?;
        if response.status() != Status::IdentifyReport {
            return Err(ProtocolError::Status {
                command: command.code(),
                status: response.status,
            });
        }
        match IdentifyReport::parse(&response.payload)?.mode() {
            DeviceMode::Bootloader => Ok(()),
            mode => Err(ProtocolError::UnexpectedMode(mode)),
        }
    }

    pub fn run_application(&mut self) -> Result<(), ProtocolError> {
        info!("Switching to application firmware");
        let command = Command::new(CommandValue::RunApplicationFirmware, vec![]);
        let settle = self.timing.settle;
        let mode = match self.transact(&command, settle) {
            Ok(r) if r.status() == Status::IdentifyReport => IdentifyReport::parse(&r.payload)?.mode(),
            // Some bootloaders restart without reporting; ask instead.
            Ok(_) | Err(ProtocolError::NoReply { .. }) => self.mode()?,
            Err(e) => return Err(e),
        };
        match mode {
            DeviceMode::Application => Ok(()),
            mode => Err(ProtocolError::UnexpectedMode(mode)),
        }
    }

    pub fn reset(&mut self) -> Result<(), ProtocolError> {
        self.send(&Command::new(CommandValue::Reset, vec![]))
    }

    pub fn erase(&mut self, range: EraseRange, settle: Duration) -> Result<(), ProtocolError> {
        info!("Erasing {} pages from page {}", range.pages, range.start_page);
        let command = Command::new(CommandValue::EraseFlash, range.payload());
        self.transact_ok(&command, settle)?;
        Ok(())
    }

    pub fn read_memory(&mut self, address: u16, length: u16) -> Result<Vec<u8>, ProtocolError> {
        let mut payload = address.to_le_bytes().to_vec();
        payload.extend_from_slice(&length.to_le_bytes());
        let command = Command::new(CommandValue::ReadMemory, payload);
        let settle = self.timing.settle;
        Ok(self.transact_ok(&command, settle)?.payload)
    }

    pub fn static_config(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let command = Command::new(CommandValue::GetStaticConfig, vec![]);
        let settle = self.timing.settle;
        Ok(self.transact_ok(&command, settle)?.payload)
    }

    /// Reads `count` packets without sending anything, idle ones included.
    pub fn read_packets(
        &mut self,
        count: usize,
        interval: Duration,
        mut on_packet: impl FnMut(&Response),
    ) -> Result<(), ProtocolError> {
        for _ in 0..count {
            let packet = self.read_response()?;
            on_packet(&packet);
            sleep(interval);
        }
        Ok(())
    }

    /// Enables `report`, hands `count` packets to `on_packet`, then disables
    /// the report again even if reading failed.
    pub fn stream_reports(
        &mut self,
        report: u8,
        count: usize,
        interval: Duration,
        on_packet: impl FnMut(&Response),
    ) -> Result<(), ProtocolError> {
        let settle = self.timing.settle;
        self.transact_ok(&Command::new(CommandValue::EnableReport, vec![report]), settle)?;
        let streamed = self.read_packets(count, interval, on_packet);
        let disabled = self
            .transact_ok(&Command::new(CommandValue::DisableReport, vec![report]), settle)
            .map(|_| ());
        streamed.and(disabled)
    }

    /// Programs every area of `plan` and restarts into the new firmware.
    pub fn update(&mut self, plan: &UpdatePlan<'_>) -> Result<(), ProtocolError> {
        self.ensure_bootloader()?;
        let erase_time = self.timing.erase;
        self.erase(PRE_ERASE, erase_time)?;

        for step in plan.steps() {
            let erase_time = if step.long_erase {
                self.timing.long_erase
            } else {
                self.timing.erase
            };
            // A long erase may still be running when the idle retries run out.
            match self.erase(step.erase, erase_time) {
                Ok(()) => {}
                Err(ProtocolError::NoReply { .. }) => {
                    warn!("No reply to erasing {}, assuming it completed", step.name)
                }
                Err(e) => return Err(e),
            }
            self.write_area(step)?;
            info!("Updated {}", step.name);
        }

        self.run_application()
    }

    /// Writes the chunks of an already erased area.
    pub fn write_area(&mut self, step: &AreaUpdate<'_>) -> Result<(), ProtocolError> {
        info!("Writing {} ({} bytes)", step.name, step.data.len());
        let settle = self.timing.settle;
        for (index, chunk) in step.chunks.iter().enumerate() {
            let command = Command::new(CommandValue::WriteFlash, step.chunk_payload(chunk));
            if let Err(e) = self.transact_ok(&command, settle) {
                error!(
                    "Write {} of {} failed at block {:#06x}",
                    index + 1,
                    step.chunks.len(),
                    chunk.block
                );
                return Err(e);
            }
        }
        Ok(())
    }
}
