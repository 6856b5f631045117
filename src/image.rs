//! TouchBoot image files.
//!
//! An image is a flat container: a magic word, a section count, a table of
//! absolute section offsets, then the sections themselves. Flash area
//! sections carry a 36-byte header followed by the area contents (16-bit
//! little-endian words). The optional JSON section carries a zlib stream.
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use bitfield_struct::bitfield;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::{debug, warn};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const IMAGE_MAGIC: u32 = 0x4818_472B;
const FLASH_AREA_TAG: u32 = 0x7C05_E516;
const JSON_TAG: u32 = 0xC1FB_41D8;

pub const NAME_LEN: usize = 16;

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct AreaFlags {
    /// Program the area even if the device already holds the same contents
    pub always_overwrite: bool,
    #[bits(31)]
    _reserved: u32,
}

#[derive(FromBytes, Immutable, IntoBytes, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
struct FileHeader {
    magic: U32,
    sections: U32,
}

const FILE_HEADER_SIZE: usize = std::mem::size_of::<FileHeader>();
const OFFSET_SIZE: usize = std::mem::size_of::<U32>();

#[derive(FromBytes, Immutable, IntoBytes, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
struct AreaHeader {
    tag: U32,
    name: [u8; NAME_LEN],
    flags: U32,
    address: U32,
    length: U32,
    crc32: U32,
}

const AREA_HEADER_SIZE: usize = std::mem::size_of::<AreaHeader>();

#[derive(FromBytes, Immutable, IntoBytes, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
struct JsonHeader {
    tag: U32,
    length: U32,
}

const JSON_HEADER_SIZE: usize = std::mem::size_of::<JsonHeader>();

#[derive(Debug, thiserror::Error)]
pub enum ImageReadError {
    #[error("bad magic value {0:#010x} != {expected:#010x}", expected = IMAGE_MAGIC)]
    BadMagic(u32),
    #[error("unknown section type {tag:08X} at offset {offset:#x}")]
    UnknownSection { offset: usize, tag: u32 },
    #[error("CRC mismatch in flash area {name}: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        name: String,
        stored: u32,
        computed: u32,
    },
    #[error("image truncated at offset {offset:#x}")]
    Truncated { offset: usize },
    #[error("flash area {name} has odd length {length}")]
    OddLength { name: String, length: usize },
    #[error("flash area at offset {offset:#x} has a non-ASCII name")]
    InvalidName { offset: usize },
    #[error("cannot decompress JSON section: {0}")]
    Json(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ImageWriteError {
    #[error("flash area name {0:?} is longer than {NAME_LEN} characters")]
    NameTooLong(String),
    #[error("flash area name {0:?} must be printable ASCII without trailing spaces")]
    InvalidName(String),
    #[error("flash area {name} has odd length {length}, areas hold 16-bit words")]
    OddLength { name: String, length: usize },
    #[error("image does not fit 32-bit offsets")]
    TooLarge,
    #[error("cannot compress JSON section: {0}")]
    Compress(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A named region of flash, addressed in 16-bit words.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlashArea {
    name: String,
    address: u32,
    data: Vec<u8>,
    flags: AreaFlags,
}

impl FlashArea {
    pub fn new(
        name: impl Into<String>,
        address: u32,
        data: Vec<u8>,
        flags: AreaFlags,
    ) -> Result<Self, ImageWriteError> {
        let name = name.into();
        if name.len() > NAME_LEN {
            return Err(ImageWriteError::NameTooLong(name));
        }
        let printable = name.bytes().all(|b| b.is_ascii_graphic() || b == b' ');
        if !printable || name.ends_with(' ') {
            return Err(ImageWriteError::InvalidName(name));
        }
        if data.len() % 2 != 0 {
            let length = data.len();
            return Err(ImageWriteError::OddLength { name, length });
        }
        Ok(Self {
            name,
            address,
            data,
            flags,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Word address of the area in device flash.
    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn flags(&self) -> AreaFlags {
        self.flags
    }

    /// Length in bytes.
    pub fn length(&self) -> usize {
        self.data.len()
    }

    pub fn crc32(&self) -> u32 {
        crc32(&self.data)
    }

    fn padded_name(&self) -> [u8; NAME_LEN] {
        let mut name = [b' '; NAME_LEN];
        name[..self.name.len()].copy_from_slice(self.name.as_bytes());
        name
    }
}

/// In-memory representation of a TouchBoot image file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Image {
    areas: Vec<FlashArea>,
    json: Option<Vec<u8>>,
}

impl Image {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_flash_area(&mut self, area: FlashArea) {
        if self.flash_area(area.name()).is_some() {
            warn!("Duplicate flash area {}, lookups return the first", area.name());
        }
        self.areas.push(area);
    }

    /// First area with the given name.
    pub fn flash_area(&self, name: &str) -> Option<&FlashArea> {
        self.areas.iter().find(|a| a.name == name)
    }

    pub fn flash_areas(&self) -> &[FlashArea] {
        &self.areas
    }

    pub fn set_json_section(&mut self, json: Vec<u8>) {
        self.json = Some(json);
    }

    pub fn json_section(&self) -> Option<&[u8]> {
        self.json.as_deref()
    }

    pub fn section_count(&self) -> usize {
        self.areas.len() + usize::from(self.json.is_some())
    }

    pub fn read_file(path: impl AsRef<Path>) -> Result<Self, ImageReadError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        debug!("Read {} bytes from {}", bytes.len(), path.display());
        Self::load(&bytes)
    }

    pub fn write_file(&self, path: impl AsRef<Path>) -> Result<(), ImageWriteError> {
        let bytes = self.save()?;
        fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load(bytes: &[u8]) -> Result<Self, ImageReadError> {
        let header: FileHeader = read_at(bytes, 0)?;
        let magic = header.magic.get();
        if magic != IMAGE_MAGIC {
            return Err(ImageReadError::BadMagic(magic));
        }

        let sections = header.sections.get() as usize;
        debug!("Image has {sections} sections");
        let mut image = Self::new();
        for index in 0..sections {
            let entry: U32 = read_at(bytes, FILE_HEADER_SIZE + index * OFFSET_SIZE)?;
            let offset = entry.get() as usize;
            let tag: U32 = read_at(bytes, offset)?;
            match tag.get() {
                FLASH_AREA_TAG => {
                    let area = read_area(bytes, offset)?;
                    debug!(
                        "Flash area {} at {offset:#x}: {} bytes for word address {:#x}",
                        area.name,
                        area.length(),
                        area.address
                    );
                    image.areas.push(area);
                }
                JSON_TAG => {
                    if image.json.is_some() {
                        warn!("Multiple JSON sections, keeping the last one");
                    }
                    image.json = Some(read_json(bytes, offset)?);
                }
                tag => return Err(ImageReadError::UnknownSection { offset, tag }),
            }
        }
        Ok(image)
    }

    pub fn save(&self) -> Result<Vec<u8>, ImageWriteError> {
        let json = self.json.as_deref().map(compress).transpose()?;
        let sections = self.section_count();

        let mut offset = FILE_HEADER_SIZE + OFFSET_SIZE * sections;
        let mut table = Vec::with_capacity(sections);
        for area in &self.areas {
            table.push(to_u32(offset)?);
            offset += AREA_HEADER_SIZE + area.length();
        }
        if let Some(json) = &json {
            table.push(to_u32(offset)?);
            offset += JSON_HEADER_SIZE + json.len();
        }
        to_u32(offset)?;

        let mut out = Vec::with_capacity(offset);
        let header = FileHeader {
            magic: U32::new(IMAGE_MAGIC),
            sections: U32::new(to_u32(sections)?),
        };
        out.extend_from_slice(header.as_bytes());
        for entry in table {
            out.extend_from_slice(U32::new(entry).as_bytes());
        }

        for area in &self.areas {
            let flags = AreaFlags::new().with_always_overwrite(area.flags.always_overwrite());
            let header = AreaHeader {
                tag: U32::new(FLASH_AREA_TAG),
                name: area.padded_name(),
                flags: U32::new(flags.into_bits()),
                address: U32::new(area.address),
                length: U32::new(to_u32(area.length())?),
                crc32: U32::new(area.crc32()),
            };
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(&area.data);
        }

        if let Some(json) = json {
            let header = JsonHeader {
                tag: U32::new(JSON_TAG),
                length: U32::new(to_u32(json.len())?),
            };
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(&json);
        }
        Ok(out)
    }
}

fn to_u32(value: usize) -> Result<u32, ImageWriteError> {
    u32::try_from(value).map_err(|_| ImageWriteError::TooLarge)
}

fn read_at<T>(bytes: &[u8], offset: usize) -> Result<T, ImageReadError>
where
    T: FromBytes + KnownLayout + Immutable,
{
    bytes
        .get(offset..)
        .and_then(|rest| T::read_from_prefix(rest).ok())
        .map(|(value, _)| value)
        .ok_or(ImageReadError::Truncated { offset })
}

fn slice_at(bytes: &[u8], offset: usize, length: usize) -> Result<&[u8], ImageReadError> {
    offset
        .checked_add(length)
        .and_then(|end| bytes.get(offset..end))
        .ok_or(ImageReadError::Truncated { offset })
}

fn read_area(bytes: &[u8], offset: usize) -> Result<FlashArea, ImageReadError> {
    let header: AreaHeader = read_at(bytes, offset)?;
    let name = parse_name(&header.name).ok_or(ImageReadError::InvalidName { offset })?;
    let length = header.length.get() as usize;
    let data = slice_at(bytes, offset + AREA_HEADER_SIZE, length)?;

    let stored = header.crc32.get();
    let computed = crc32(data);
    if stored != computed {
        return Err(ImageReadError::CrcMismatch {
            name,
            stored,
            computed,
        });
    }
    if length % 2 != 0 {
        return Err(ImageReadError::OddLength { name, length });
    }

    let raw = AreaFlags::from_bits(header.flags.get());
    Ok(FlashArea {
        name,
        address: header.address.get(),
        data: data.to_vec(),
        flags: AreaFlags::new().with_always_overwrite(raw.always_overwrite()),
    })
}

// Names are space padded; some tools pad with NUL instead.
fn parse_name(raw: &[u8; NAME_LEN]) -> Option<String> {
    let end = raw
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map_or(0, |i| i + 1);
    let name = &raw[..end];
    name.iter()
        .all(|&b| b.is_ascii_graphic() || b == b' ')
        .then(|| String::from_utf8_lossy(name).into_owned())
}

fn read_json(bytes: &[u8], offset: usize) -> Result<Vec<u8>, ImageReadError> {
    let header: JsonHeader = read_at(bytes, offset)?;
    let compressed = slice_at(bytes, offset + JSON_HEADER_SIZE, header.length.get() as usize)?;
    let mut json = Vec::new();
    ZlibDecoder::new(compressed)
        .read_to_end(&mut json)
        .map_err(ImageReadError::Json)?;
    debug!(
        "JSON section at {offset:#x}: {} bytes, {} compressed",
        json.len(),
        compressed.len()
    );
    Ok(json)
}

fn compress(json: &[u8]) -> Result<Vec<u8>, ImageWriteError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(json).map_err(ImageWriteError::Compress)?;
    encoder.finish().map_err(ImageWriteError::Compress)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area(name: &str, address: u32, data: &[u8]) -> FlashArea {
        FlashArea::new(name, address, data.to_vec(), AreaFlags::new()).unwrap()
    }

    fn sample() -> Image {
        let mut image = Image::new();
        image.add_flash_area(area("BOOT_CONFIG", 0x7F00, &[0xAA, 0x55, 0x01, 0x02]));
        image.add_flash_area(
            FlashArea::new(
                "APP_CODE",
                0,
                (0..64u8).collect(),
                AreaFlags::new().with_always_overwrite(true),
            )
            .unwrap(),
        );
        image.set_json_section(br#"{"build": 3318, "part": "S3908"}"#.to_vec());
        image
    }

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn crc_is_zlib_crc32() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn header_layout() {
        assert_eq!(FILE_HEADER_SIZE, 8);
        assert_eq!(AREA_HEADER_SIZE, 36);
        assert_eq!(JSON_HEADER_SIZE, 8);
    }

    #[test]
    fn empty_image() {
        let bytes = Image::new().save().unwrap();
        assert_eq!(bytes, [0x2B, 0x47, 0x18, 0x48, 0, 0, 0, 0]);
        assert_eq!(Image::load(&bytes).unwrap(), Image::new());
    }

    #[test]
    fn save_then_load() {
        let image = sample();
        let loaded = Image::load(&image.save().unwrap()).unwrap();
        assert_eq!(loaded, image);
        assert!(loaded.flash_area("APP_CODE").unwrap().flags().always_overwrite());
        assert!(!loaded.flash_area("BOOT_CONFIG").unwrap().flags().always_overwrite());
        assert!(loaded.flash_area("DISPLAY").is_none());
    }

    #[test]
    fn offsets_are_cumulative() {
        let image = sample();
        let bytes = image.save().unwrap();
        assert_eq!(u32_at(&bytes, 4), 3);
        let first = 8 + 4 * 3;
        assert_eq!(u32_at(&bytes, 8), first);
        assert_eq!(u32_at(&bytes, 12), first + 36 + 4);
        assert_eq!(u32_at(&bytes, 16), first + 36 + 4 + 36 + 64);
        assert_eq!(u32_at(&bytes, u32_at(&bytes, 16) as usize), JSON_TAG);
    }

    #[test]
    fn area_section_encoding() {
        let mut image = Image::new();
        image.add_flash_area(
            FlashArea::new(
                "APP_CONFIG",
                0x1234,
                vec![1, 2],
                AreaFlags::new().with_always_overwrite(true),
            )
            .unwrap(),
        );
        let bytes = image.save().unwrap();
        let section = &bytes[12..];
        assert_eq!(u32_at(section, 0), FLASH_AREA_TAG);
        assert_eq!(&section[4..20], b"APP_CONFIG      ");
        assert_eq!(u32_at(section, 20), 1);
        assert_eq!(u32_at(section, 24), 0x1234);
        assert_eq!(u32_at(section, 28), 2);
        assert_eq!(u32_at(section, 32), crc32(&[1, 2]));
        assert_eq!(&section[36..], &[1, 2]);
    }

    #[test]
    fn reserved_flag_bits_are_dropped() {
        let mut bytes = sample().save().unwrap();
        let section = u32_at(&bytes, 8) as usize;
        bytes[section + 20..section + 24].copy_from_slice(&0xFFFF_FFFEu32.to_le_bytes());
        let image = Image::load(&bytes).unwrap();
        assert_eq!(image.flash_areas()[0].flags(), AreaFlags::new());
    }

    #[test]
    fn nul_padded_names() {
        let mut bytes = sample().save().unwrap();
        let section = u32_at(&bytes, 8) as usize;
        bytes[section + 4 + 11..section + 20].fill(0);
        let image = Image::load(&bytes).unwrap();
        assert_eq!(image.flash_areas()[0].name(), "BOOT_CONFIG");
    }

    #[test]
    fn control_bytes_in_name() {
        let mut bytes = sample().save().unwrap();
        let section = u32_at(&bytes, 8) as usize;
        bytes[section + 4 + 4] = b'\n';
        assert!(matches!(
            Image::load(&bytes),
            Err(ImageReadError::InvalidName { offset }) if offset == section
        ));
    }

    #[test]
    fn round_trips() {
        let areas_only = {
            let mut image = Image::new();
            image.add_flash_area(area("APP_CODE", 0, &[1, 2, 3, 4]));
            image.add_flash_area(area("APP_CONFIG", 0x7800, &[5, 6]));
            image
        };
        let json_only = {
            let mut image = Image::new();
            image.set_json_section(b"{}".to_vec());
            image
        };
        let zero_length = {
            let mut image = Image::new();
            image.add_flash_area(area("DISPLAY", 0x7C00, &[]));
            image
        };
        let empty_json = {
            let mut image = Image::new();
            image.add_flash_area(area("APP_CODE", 0, &[0; 8]));
            image.set_json_section(vec![]);
            image
        };
        for (label, image) in [
            ("empty", Image::new()),
            ("sample", sample()),
            ("areas only", areas_only),
            ("json only", json_only),
            ("zero length area", zero_length),
            ("empty json", empty_json),
        ] {
            let bytes = image.save().unwrap();
            assert_eq!(u32_at(&bytes, 4) as usize, image.section_count(), "{label}");
            assert_eq!(Image::load(&bytes).unwrap(), image, "{label}");
        }
    }

    #[test]
    fn duplicate_names_keep_order() {
        let mut image = Image::new();
        image.add_flash_area(area("APP_CODE", 0, &[1, 1]));
        image.add_flash_area(area("APP_CODE", 0x100, &[2, 2]));
        let loaded = Image::load(&image.save().unwrap()).unwrap();
        assert_eq!(loaded.flash_areas().len(), 2);
        assert_eq!(loaded.flash_area("APP_CODE").unwrap().data(), [1, 1]);
        assert_eq!(loaded.flash_areas()[1].address(), 0x100);
    }

    /// Builds a file from raw sections, with `gap` zero bytes before each.
    fn assemble(sections: &[&[u8]], gap: usize) -> Vec<u8> {
        let mut bytes = IMAGE_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&(sections.len() as u32).to_le_bytes());
        let mut offset = 8 + 4 * sections.len();
        for section in sections {
            offset += gap;
            bytes.extend_from_slice(&(offset as u32).to_le_bytes());
            offset += section.len();
        }
        for section in sections {
            bytes.resize(bytes.len() + gap, 0);
            bytes.extend_from_slice(section);
        }
        bytes
    }

    // Section bytes of a single-section image.
    fn only_section(image: &Image) -> Vec<u8> {
        image.save().unwrap()[12..].to_vec()
    }

    #[test]
    fn last_json_section_wins() {
        let mut first = Image::new();
        first.set_json_section(br#"{"n": 1}"#.to_vec());
        let mut second = Image::new();
        second.set_json_section(br#"{"n": 2}"#.to_vec());
        let bytes = assemble(&[&only_section(&first)[..], &only_section(&second)[..]], 0);
        let image = Image::load(&bytes).unwrap();
        assert_eq!(image.json_section(), Some(&br#"{"n": 2}"#[..]));
    }

    #[test]
    fn follows_offset_table() {
        let mut a = Image::new();
        a.add_flash_area(area("APP_CODE", 0, &[1, 2]));
        let mut b = Image::new();
        b.add_flash_area(area("APP_CONFIG", 0x7800, &[3, 4]));

        let bytes = assemble(&[&only_section(&b)[..], &only_section(&a)[..]], 6);
        let image = Image::load(&bytes).unwrap();
        let names: Vec<_> = image.flash_areas().iter().map(|a| a.name()).collect();
        assert_eq!(names, ["APP_CONFIG", "APP_CODE"]);
        assert_eq!(image.flash_area("APP_CODE").unwrap().data(), [1, 2]);

        // Table entries out of file order.
        let mut swapped = assemble(&[&only_section(&a)[..], &only_section(&b)[..]], 0);
        let (first, second) = (u32_at(&swapped, 8), u32_at(&swapped, 12));
        swapped[8..12].copy_from_slice(&second.to_le_bytes());
        swapped[12..16].copy_from_slice(&first.to_le_bytes());
        let image = Image::load(&swapped).unwrap();
        assert_eq!(image.flash_areas()[0].name(), "APP_CONFIG");
        assert_eq!(image.flash_areas()[1].name(), "APP_CODE");
    }

    #[test]
    fn bad_magic() {
        let mut bytes = sample().save().unwrap();
        bytes[0] = 0;
        assert!(matches!(
            Image::load(&bytes),
            Err(ImageReadError::BadMagic(0x4818_4700))
        ));
    }

    #[test]
    fn unknown_section() {
        let mut bytes = sample().save().unwrap();
        let section = u32_at(&bytes, 12) as usize;
        bytes[section..section + 4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        match Image::load(&bytes) {
            Err(ImageReadError::UnknownSection { offset, tag }) => {
                assert_eq!(offset, section);
                assert_eq!(tag, 0xDEAD_BEEF);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn crc_mismatch() {
        let mut bytes = sample().save().unwrap();
        let section = u32_at(&bytes, 12) as usize;
        bytes[section + AREA_HEADER_SIZE + 5] ^= 0xFF;
        match Image::load(&bytes) {
            Err(ImageReadError::CrcMismatch { name, .. }) => assert_eq!(name, "APP_CODE"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncated() {
        let bytes = sample().save().unwrap();
        assert!(matches!(
            Image::load(&bytes[..6]),
            Err(ImageReadError::Truncated { offset: 0 })
        ));
        let section = u32_at(&bytes, 12) as usize;
        assert!(matches!(
            Image::load(&bytes[..section + AREA_HEADER_SIZE + 10]),
            Err(ImageReadError::Truncated { .. })
        ));
    }

    #[test]
    fn corrupt_json_section() {
        let mut bytes = sample().save().unwrap();
        let section = u32_at(&bytes, 16) as usize;
        bytes[section + JSON_HEADER_SIZE..].fill(0xFF);
        assert!(matches!(Image::load(&bytes), Err(ImageReadError::Json(_))));
    }

    #[test]
    fn area_validation() {
        let flags = AreaFlags::new();
        assert!(matches!(
            FlashArea::new("A_VERY_LONG_AREA_NAME", 0, vec![], flags),
            Err(ImageWriteError::NameTooLong(_))
        ));
        assert!(matches!(
            FlashArea::new("CONFIG ", 0, vec![], flags),
            Err(ImageWriteError::InvalidName(_))
        ));
        assert!(matches!(
            FlashArea::new("DISPLAÿ", 0, vec![], flags),
            Err(ImageWriteError::InvalidName(_))
        ));
        assert!(matches!(
            FlashArea::new("APP_CODE", 0, vec![1, 2, 3], flags),
            Err(ImageWriteError::OddLength { length: 3, .. })
        ));
        assert!(FlashArea::new("EXACTLY_16_CHARS", 0, vec![], flags).is_ok());
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.img");
        let image = sample();
        image.write_file(&path).unwrap();
        assert_eq!(Image::read_file(&path).unwrap(), image);
    }
}
