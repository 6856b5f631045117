use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::{error, info, warn};
use sha2::{Digest, Sha256};

mod device;
mod error;
mod identify;
mod image;
mod protocol;
mod report;
mod update;

use device::Device;
use error::Error;
use image::{AreaFlags, FlashArea, Image};
use protocol::{Command as TouchCommand, Response, Status};
use report::PacketView;
use update::UpdatePlan;

const SERIAL_TIMEOUT: Duration = Duration::from_millis(100);
const TCP_TIMEOUT: Duration = Duration::from_millis(200);

const PORT: &str = "/dev/ttyUSB1";
const BAUD: u32 = 115_200;

trait Stream: Read + Write {}
impl<T: Read + Write> Stream for T {}

type Port = Box<dyn Stream>;

#[derive(Debug, Args)]
struct Link {
    /// Serial port of the controller bridge
    #[clap(long, short, action, default_value = PORT)]
    port: String,
    #[clap(long, short, default_value_t = BAUD)]
    baud: u32,
    /// Connect to a TCP bridge (host:port) instead of a serial port
    #[clap(long)]
    tcp: Option<String>,
}

impl Link {
    fn open(&self) -> Result<Device<Port>, Error> {
        let port: Port = match &self.tcp {
            Some(addr) => {
                info!("Connecting to {addr}");
                let stream = TcpStream::connect(addr)?;
                stream.set_read_timeout(Some(TCP_TIMEOUT))?;
                stream.set_nodelay(true)?;
                Box::new(stream)
            }
            None => {
                info!("Using port {}", self.port);
                let port = serialport::new(&self.port, self.baud)
                    .timeout(SERIAL_TIMEOUT)
                    .open()?;
                Box::new(port)
            }
        };
        Ok(Device::new(port))
    }
}

/// `NAME:ADDRESS:FILE[:always]`, ADDRESS being a word address.
#[derive(Clone, Debug)]
struct AreaSpec {
    name: String,
    address: u32,
    path: PathBuf,
    always_overwrite: bool,
}

fn parse_area_spec(s: &str) -> Result<AreaSpec, String> {
    let mut parts = s.splitn(3, ':');
    let (Some(name), Some(address), Some(rest)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("expected NAME:ADDRESS:FILE[:always], got {s:?}"));
    };
    let address = clap_num::maybe_hex::<u32>(address)?;
    let (path, always_overwrite) = match rest.strip_suffix(":always") {
        Some(path) => (path, true),
        None => (rest, false),
    };
    Ok(AreaSpec {
        name: name.to_string(),
        address,
        path: PathBuf::from(path),
        always_overwrite,
    })
}

#[derive(Debug, Subcommand)]
enum ImageCommand {
    /// List flash areas and the JSON section
    Info { file: PathBuf },
    /// Check magic, section table and area checksums
    Verify { file: PathBuf },
    /// Build an image from raw area contents
    #[clap(verbatim_doc_comment)]
    Create {
        #[arg(long, short)]
        output: PathBuf,
        /// NAME:ADDRESS:FILE[:always], may be repeated
        #[arg(long = "area", required = true, value_parser = parse_area_spec)]
        areas: Vec<AreaSpec>,
        /// JSON document stored in the JSON section
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Write an area's contents, or the JSON section when no area is named
    Extract {
        file: PathBuf,
        name: Option<String>,
        #[arg(long, short)]
        output: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum Command {
    /// TouchBoot image file tools
    Image {
        #[command(subcommand)]
        cmd: ImageCommand,
    },
    /// Show the erase and write steps an update would take
    Plan { file: PathBuf },
    /// Decode captured reply packets given as hex
    Decode {
        #[arg(required = true)]
        packets: Vec<String>,
    },
    Identify {
        #[command(flatten)]
        link: Link,
    },
    /// Flash the areas of an image and restart the application
    Update {
        file: PathBuf,
        #[command(flatten)]
        link: Link,
    },
    /// Enter the bootloader if needed and erase flash pages
    Erase {
        #[arg(index = 1, default_value_t = 8, value_parser = clap_num::maybe_hex::<u8>)]
        start_page: u8,
        #[arg(index = 2, default_value_t = 8, value_parser = clap_num::maybe_hex::<u8>)]
        pages: u8,
        /// Time the erase takes before its reply can be read
        #[arg(long, default_value_t = 2000)]
        wait_ms: u64,
        #[command(flatten)]
        link: Link,
    },
    Reset {
        #[command(flatten)]
        link: Link,
    },
    /// Print packets as they arrive, without sending a command
    Read {
        #[arg(long, short, default_value_t = 1)]
        count: usize,
        #[arg(long, default_value_t = 200)]
        interval_ms: u64,
        #[command(flatten)]
        link: Link,
    },
    /// Enable a report, print some packets and disable it again
    Reports {
        #[arg(index = 1, value_parser = clap_num::maybe_hex::<u8>)]
        report: u8,
        #[arg(long, short, default_value_t = 10)]
        count: usize,
        #[arg(long, default_value_t = 200)]
        interval_ms: u64,
        #[command(flatten)]
        link: Link,
    },
    /// Read controller RAM
    Peek {
        /// Word address
        #[arg(index = 1, value_parser = clap_num::maybe_hex::<u16>)]
        address: u16,
        #[arg(index = 2, value_parser = clap_num::maybe_hex::<u16>)]
        length: u16,
        #[command(flatten)]
        link: Link,
    },
    StaticConfig {
        #[command(flatten)]
        link: Link,
    },
    /// Send any command code with a hex payload
    Raw {
        #[arg(index = 1, value_parser = clap_num::maybe_hex::<u8>)]
        code: u8,
        #[arg(index = 2)]
        payload: Option<String>,
        /// Do not wait for a reply
        #[arg(long)]
        no_reply: bool,
        #[command(flatten)]
        link: Link,
    },
}

/// TouchComm controller firmware tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Command to run
    #[command(subcommand)]
    cmd: Command,
}

fn main() {
    let cmd = Cli::parse().cmd;
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if let Err(e) = run(cmd) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run(cmd: Command) -> Result<(), Error> {
    match cmd {
        Command::Image { cmd } => run_image(cmd),
        Command::Plan { file } => {
            let image = Image::read_file(&file)?;
            let plan = UpdatePlan::new(&image)?;
            println!("{plan}");
            Ok(())
        }
        Command::Decode { packets } => {
            for packet in packets {
                let response = Response::from_hex(&packet)?;
                print!("{}", PacketView(&response));
                if response.status() == Status::IdentifyReport {
                    println!("{}", identify::IdentifyReport::parse(&response.payload)?);
                }
            }
            Ok(())
        }
        Command::Identify { link } => {
            let mut device = link.open()?;
            println!("{}", device.identify()?);
            Ok(())
        }
        Command::Update { file, link } => {
            let image = Image::read_file(&file)?;
            let plan = UpdatePlan::new(&image)?;
            info!("Updating {} areas, {} bytes", plan.steps().len(), plan.total_bytes());
            let mut device = link.open()?;
            device.update(&plan)?;
            info!("🎉 Done. Application firmware is running.");
            Ok(())
        }
        Command::Erase {
            start_page,
            pages,
            wait_ms,
            link,
        } => {
            let mut device = link.open()?;
            device.ensure_bootloader()?;
            let range = update::EraseRange { start_page, pages };
            device.erase(range, Duration::from_millis(wait_ms))?;
            info!("Erase OK");
            Ok(())
        }
        Command::Reset { link } => {
            link.open()?.reset()?;
            Ok(())
        }
        Command::Read {
            count,
            interval_ms,
            link,
        } => {
            let mut device = link.open()?;
            let interval = Duration::from_millis(interval_ms);
            device.read_packets(count, interval, |packet| {
                print!("{}", PacketView(packet));
            })?;
            Ok(())
        }
        Command::Reports {
            report,
            count,
            interval_ms,
            link,
        } => {
            let mut device = link.open()?;
            let interval = Duration::from_millis(interval_ms);
            device.stream_reports(report, count, interval, |packet| {
                print!("{}", PacketView(packet));
            })?;
            Ok(())
        }
        Command::Peek {
            address,
            length,
            link,
        } => {
            let data = link.open()?.read_memory(address, length)?;
            for line in peek_rows(address, &data) {
                println!("{line}");
            }
            Ok(())
        }
        Command::StaticConfig { link } => {
            let data = link.open()?.static_config()?;
            for line in data.chunks(32) {
                println!("{}", hex::encode_upper(line));
            }
            Ok(())
        }
        Command::Raw {
            code,
            payload,
            no_reply,
            link,
        } => {
            let payload = match payload {
                Some(p) => hex::decode(p)?,
                None => vec![],
            };
            let mut device = link.open()?;
            if let Some(response) = device.raw(&TouchCommand::raw(code, payload), !no_reply)? {
                print!("{}", PacketView(&response));
            }
            Ok(())
        }
    }
}

/// Eight little-endian words per row, labelled with the word address of
/// the first one.
fn peek_rows(address: u16, data: &[u8]) -> Vec<String> {
    data.chunks(16)
        .enumerate()
        .map(|(row, bytes)| {
            // A trailing odd byte is printed on its own.
            let words: Vec<String> = bytes
                .chunks(2)
                .map(|w| w.iter().rev().map(|b| format!("{b:02x}")).collect())
                .collect();
            format!("{:04x}: {}", usize::from(address) + row * 8, words.join(" "))
        })
        .collect()
}

fn run_image(cmd: ImageCommand) -> Result<(), Error> {
    match cmd {
        ImageCommand::Info { file } => {
            let image = Image::read_file(&file)?;
            println!("{}: {} sections", file.display(), image.section_count());
            for area in image.flash_areas() {
                let overwrite = if area.flags().always_overwrite() {
                    " always-overwrite"
                } else {
                    ""
                };
                println!(
                    "{:<16} address {:#010x} length {:>8} crc32 {:#010x}{overwrite}",
                    area.name(),
                    area.address(),
                    area.length(),
                    area.crc32()
                );
                println!("{:<16} sha256 {}", "", hex::encode(Sha256::digest(area.data())));
            }
            if let Some(json) = image.json_section() {
                println!("JSON section: {} bytes", json.len());
                match serde_json::from_slice::<serde_json::Value>(json) {
                    Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                    Err(e) => warn!("JSON section does not parse: {e}"),
                }
            }
            Ok(())
        }
        ImageCommand::Verify { file } => {
            let image = Image::read_file(&file)?;
            info!(
                "Image is valid: {} flash areas{}",
                image.flash_areas().len(),
                if image.json_section().is_some() {
                    " and a JSON section"
                } else {
                    ""
                }
            );
            Ok(())
        }
        ImageCommand::Create {
            output,
            areas,
            json,
        } => {
            let mut image = Image::new();
            for spec in areas {
                let data = std::fs::read(&spec.path)?;
                info!(
                    "{}: {} bytes from {} at word address {:#x}",
                    spec.name,
                    data.len(),
                    spec.path.display(),
                    spec.address
                );
                let flags = AreaFlags::new().with_always_overwrite(spec.always_overwrite);
                image.add_flash_area(FlashArea::new(spec.name, spec.address, data, flags)?);
            }
            if let Some(path) = json {
                let text = std::fs::read(path)?;
                serde_json::from_slice::<serde_json::Value>(&text)?;
                image.set_json_section(text);
            }
            image.write_file(&output)?;
            info!("Wrote {}", output.display());
            Ok(())
        }
        ImageCommand::Extract { file, name, output } => {
            let image = Image::read_file(&file)?;
            let data = match &name {
                Some(name) => image
                    .flash_area(name)
                    .ok_or_else(|| Error::NoSuchArea(name.clone()))?
                    .data(),
                None => image.json_section().ok_or(Error::NoJsonSection)?,
            };
            std::fs::write(&output, data)?;
            info!("Wrote {} bytes to {}", data.len(), output.display());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn area_specs() {
        let spec = parse_area_spec("APP_CODE:0x100:build/app.bin").unwrap();
        assert_eq!(spec.name, "APP_CODE");
        assert_eq!(spec.address, 0x100);
        assert_eq!(spec.path, PathBuf::from("build/app.bin"));
        assert!(!spec.always_overwrite);

        let spec = parse_area_spec("APP_CONFIG:30720:C:/fw/config.bin:always").unwrap();
        assert_eq!(spec.address, 0x7800);
        assert_eq!(spec.path, PathBuf::from("C:/fw/config.bin"));
        assert!(spec.always_overwrite);

        assert!(parse_area_spec("APP_CODE:0x100").is_err());
        assert!(parse_area_spec("APP_CODE:zz:app.bin").is_err());
    }

    #[test]
    fn parses_link_options() {
        let cli = Cli::parse_from(["touchboot", "identify", "--tcp", "127.0.0.1:10001"]);
        match cli.cmd {
            Command::Identify { link } => {
                assert_eq!(link.tcp.as_deref(), Some("127.0.0.1:10001"));
                assert_eq!(link.port, PORT);
                assert_eq!(link.baud, BAUD);
            }
            other => panic!("unexpected {other:?}"),
        }
        let cli = Cli::parse_from(["touchboot", "erase", "0x08", "8", "-p", "/dev/ttyACM0"]);
        match cli.cmd {
            Command::Erase {
                start_page, pages, link, ..
            } => {
                assert_eq!((start_page, pages), (8, 8));
                assert_eq!(link.port, "/dev/ttyACM0");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn peek_rows_start_at_address() {
        let data: Vec<u8> = (0..20).collect();
        let rows = peek_rows(0x7000, &data);
        assert_eq!(
            rows,
            [
                "7000: 0100 0302 0504 0706 0908 0b0a 0d0c 0f0e",
                "7008: 1110 1312",
            ]
        );
        assert_eq!(peek_rows(0x20, &[0xAB]), ["0020: ab"]);
    }

    #[test]
    fn erase_defaults_and_read_options() {
        let cli = Cli::parse_from(["touchboot", "erase"]);
        match cli.cmd {
            Command::Erase {
                start_page,
                pages,
                wait_ms,
                ..
            } => assert_eq!((start_page, pages, wait_ms), (8, 8, 2000)),
            other => panic!("unexpected {other:?}"),
        }
        let cli = Cli::parse_from(["touchboot", "read", "-c", "200"]);
        match cli.cmd {
            Command::Read {
                count, interval_ms, ..
            } => assert_eq!((count, interval_ms), (200, 200)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
