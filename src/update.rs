//! Firmware update planning.
//!
//! Flash is erased in 4 KiB pages and written in 512-byte chunks, each
//! addressed by its 8-byte block number.
use std::fmt::{Display, Formatter};

use log::warn;

use crate::image::Image;

pub const PAGE_SIZE: usize = 4096;
pub const WRITE_CHUNK_SIZE: usize = 512;
pub const BLOCK_SIZE: usize = 8;

const APP_CODE: &str = "APP_CODE";
const APP_CONFIG: &str = "APP_CONFIG";
const DISPLAY: &str = "DISPLAY";

/// Cleared before any area is programmed.
pub const PRE_ERASE: EraseRange = EraseRange {
    start_page: 8,
    pages: 8,
};

/// Areas programmed by an update, in order.
pub const UPDATE_AREAS: [&str; 3] = [APP_CODE, APP_CONFIG, DISPLAY];

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("image has no {0} flash area")]
    MissingArea(&'static str),
    #[error("flash area {name} starts at page {page}, beyond the erasable range")]
    PageOutOfRange { name: String, page: u64 },
    #[error("flash area {name} spans {pages} pages, more than one erase can cover")]
    TooManyPages { name: String, pages: usize },
    #[error("flash area {name} reaches block {block}, beyond the writable range")]
    BlockOutOfRange { name: String, block: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EraseRange {
    pub start_page: u8,
    pub pages: u8,
}

impl EraseRange {
    pub fn payload(self) -> Vec<u8> {
        vec![self.start_page, self.pages]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteChunk {
    pub block: u16,
    pub offset: usize,
    pub len: usize,
}

#[derive(Clone, Debug)]
pub struct AreaUpdate<'a> {
    pub name: &'a str,
    pub byte_address: u64,
    pub data: &'a [u8],
    pub erase: EraseRange,
    /// Erasing application code takes much longer than config areas.
    pub long_erase: bool,
    pub chunks: Vec<WriteChunk>,
}

impl AreaUpdate<'_> {
    pub fn chunk_data(&self, chunk: &WriteChunk) -> &[u8] {
        &self.data[chunk.offset..chunk.offset + chunk.len]
    }

    /// Write command payload: LE block number followed by the chunk.
    pub fn chunk_payload(&self, chunk: &WriteChunk) -> Vec<u8> {
        let mut payload = Vec::with_capacity(2 + chunk.len);
        payload.extend_from_slice(&chunk.block.to_le_bytes());
        payload.extend_from_slice(self.chunk_data(chunk));
        payload
    }
}

#[derive(Clone, Debug)]
pub struct UpdatePlan<'a> {
    steps: Vec<AreaUpdate<'a>>,
}

impl<'a> UpdatePlan<'a> {
    pub fn new(image: &'a Image) -> Result<Self, PlanError> {
        let mut steps = Vec::new();
        for name in UPDATE_AREAS {
            let Some(area) = image.flash_area(name) else {
                if name == APP_CODE {
                    return Err(PlanError::MissingArea(APP_CODE));
                }
                warn!("Image has no {name} area, skipping");
                continue;
            };
            let byte_address = u64::from(area.address()) * 2;
            steps.push(AreaUpdate {
                name: area.name(),
                byte_address,
                data: area.data(),
                erase: erase_range(name, byte_address, area.length())?,
                long_erase: name == APP_CODE,
                chunks: write_chunks(name, byte_address, area.length())?,
            });
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[AreaUpdate<'a>] {
        &self.steps
    }

    pub fn total_bytes(&self) -> usize {
        self.steps.iter().map(|s| s.data.len()).sum()
    }
}

impl Display for UpdatePlan<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let EraseRange { start_page, pages } = PRE_ERASE;
        writeln!(f, "erase pages {start_page}..{} first", start_page + pages)?;
        for step in &self.steps {
            let EraseRange { start_page, pages } = step.erase;
            writeln!(
                f,
                "{:<16} byte address {:#08x}, {} bytes",
                step.name,
                step.byte_address,
                step.data.len()
            )?;
            writeln!(f, "  erase pages {start_page}..{}", u16::from(start_page) + u16::from(pages))?;
            if let (Some(first), Some(last)) = (step.chunks.first(), step.chunks.last()) {
                writeln!(
                    f,
                    "  write {} chunks, blocks {}..={}",
                    step.chunks.len(),
                    first.block,
                    last.block
                )?;
            }
        }
        write!(f, "total {} bytes", self.total_bytes())
    }
}

pub fn erase_range(name: &str, byte_address: u64, length: usize) -> Result<EraseRange, PlanError> {
    let page = byte_address / PAGE_SIZE as u64;
    let start_page = u8::try_from(page).map_err(|_| PlanError::PageOutOfRange {
        name: name.to_string(),
        page,
    })?;
    let count = length.div_ceil(PAGE_SIZE);
    let pages = u8::try_from(count).map_err(|_| PlanError::TooManyPages {
        name: name.to_string(),
        pages: count,
    })?;
    Ok(EraseRange { start_page, pages })
}

pub fn write_chunks(name: &str, byte_address: u64, length: usize) -> Result<Vec<WriteChunk>, PlanError> {
    (0..length)
        .step_by(WRITE_CHUNK_SIZE)
        .map(|offset| {
            let block = (byte_address + offset as u64) / BLOCK_SIZE as u64;
            u16::try_from(block)
                .map(|block| WriteChunk {
                    block,
                    offset,
                    len: WRITE_CHUNK_SIZE.min(length - offset),
                })
                .map_err(|_| PlanError::BlockOutOfRange {
                    name: name.to_string(),
                    block,
                })
        })
        .collect()
}
