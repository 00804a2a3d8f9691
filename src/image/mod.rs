//! Firmware image reading.
//!
//! An image is loaded from an Intel HEX file into ordered, non-overlapping
//! blocks. The data is scanned for application information blocks (logged
//! only) and for exactly one signature block, whose address the device
//! verifies after the last write.

pub mod hex;

use std::path::Path;

use serde::Serialize;

use self::hex::{HexError, HexImage};

/// Marks the start of the signature block
pub const SIGNATURE_BLOCK_MAGIC: [u8; 8] = *b"FWSIGBLK";
/// Marks the start of an application information block
pub const APP_INFO_MAGIC: [u8; 8] = *b"APPINFO\0";

const APP_INFO_NAME_LEN: usize = 32;
const APP_INFO_VERSION_LEN: usize = 16;
const APP_INFO_DATE_LEN: usize = 12;
const APP_INFO_TIME_LEN: usize = 9;
const APP_INFO_LEN: usize =
    1 + APP_INFO_NAME_LEN + APP_INFO_VERSION_LEN + APP_INFO_DATE_LEN + APP_INFO_TIME_LEN;

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid hex file: {0}")]
    Parse(#[from] HexError),
    #[error("No signature block found in image")]
    NoSignatureBlock,
    #[error("Signature block found {} times, expected exactly once", .0.len())]
    AmbiguousSignatureBlock(Vec<u32>),
    #[error("Invalid block layout: {0}")]
    InvalidBlocks(String),
}

/// Contiguous run of bytes destined for one flash address range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub address_offset: u32,
    pub data: Vec<u8>,
}

impl Block {
    pub fn new(address_offset: u32, data: Vec<u8>) -> Self {
        Self {
            address_offset,
            data,
        }
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Exclusive end address
    pub fn end(&self) -> u64 {
        self.address_offset as u64 + self.data.len() as u64
    }
}

/// Metadata embedded by the application build
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppInfo {
    pub address: u32,
    pub version: u8,
    pub project_name: String,
    pub project_version: String,
    pub build_date: String,
    pub build_time: String,
}

impl AppInfo {
    fn parse(address: u32, bytes: &[u8]) -> Option<Self> {
        if bytes.len() < APP_INFO_LEN {
            return None;
        }
        let mut rest = &bytes[1..];
        let mut field = |len: usize| {
            let (head, tail) = rest.split_at(len);
            rest = tail;
            let end = head.iter().position(|&b| b == 0).unwrap_or(head.len());
            String::from_utf8_lossy(&head[..end]).trim().to_string()
        };
        Some(Self {
            address,
            version: bytes[0],
            project_name: field(APP_INFO_NAME_LEN),
            project_version: field(APP_INFO_VERSION_LEN),
            build_date: field(APP_INFO_DATE_LEN),
            build_time: field(APP_INFO_TIME_LEN),
        })
    }
}

/// Parsed firmware. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    blocks: Vec<Block>,
    signature_block_address: Option<u32>,
    app_infos: Vec<AppInfo>,
}

/// Load a hex file and locate its signature block
pub fn load(path: impl AsRef<Path>) -> Result<FirmwareImage, ReadError> {
    FirmwareImage::load(path)
}

impl FirmwareImage {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReadError> {
        let path = path.as_ref();
        log::info!("[Image] Reading {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|source| ReadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_hex_str(&content)
    }

    pub fn from_hex_str(content: &str) -> Result<Self, ReadError> {
        let hex = HexImage::parse(content)?;
        let blocks: Vec<Block> = hex
            .segments
            .into_iter()
            .map(|(address, data)| Block::new(address, data))
            .collect();

        let app_infos = scan_app_infos(&blocks);
        if app_infos.is_empty() {
            log::info!("[Image] No application information block found");
        }
        for info in &app_infos {
            log::info!(
                "[Image] Application '{}' version '{}' built {} {} (info block v{} at 0x{:08X})",
                info.project_name,
                info.project_version,
                info.build_date,
                info.build_time,
                info.version,
                info.address
            );
        }

        let signatures = find_magic(&blocks, &SIGNATURE_BLOCK_MAGIC);
        let signature_block_address = match signatures.as_slice() {
            [] => return Err(ReadError::NoSignatureBlock),
            [address] => *address,
            _ => return Err(ReadError::AmbiguousSignatureBlock(signatures)),
        };
        log::info!(
            "[Image] {} block(s), {} bytes, signature block at 0x{:08X}",
            blocks.len(),
            blocks.iter().map(|b| b.data.len()).sum::<usize>(),
            signature_block_address
        );

        Ok(Self {
            blocks,
            signature_block_address: Some(signature_block_address),
            app_infos,
        })
    }

    /// Build an image from explicit blocks. Blocks are sorted by address and must not overlap or be empty.
    pub fn from_blocks(mut blocks: Vec<Block>, signature_block_address: Option<u32>) -> Result<Self, ReadError> {
        blocks.sort_by_key(|b| b.address_offset);
        for block in &blocks {
            if block.data.is_empty() {
                return Err(ReadError::InvalidBlocks(format!(
                    "empty block at 0x{:08X}",
                    block.address_offset
                )));
            }
            if block.end() > u32::MAX as u64 + 1 {
                return Err(ReadError::InvalidBlocks(format!(
                    "block at 0x{:08X} exceeds the address space",
                    block.address_offset
                )));
            }
        }
        for pair in blocks.windows(2) {
            if pair[0].end() > pair[1].address_offset as u64 {
                return Err(ReadError::InvalidBlocks(format!(
                    "block at 0x{:08X} overlaps block at 0x{:08X}",
                    pair[1].address_offset, pair[0].address_offset
                )));
            }
        }
        let app_infos = scan_app_infos(&blocks);
        Ok(Self {
            blocks,
            signature_block_address,
            app_infos,
        })
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn signature_block_address(&self) -> Option<u32> {
        self.signature_block_address
    }

    pub fn app_infos(&self) -> &[AppInfo] {
        &self.app_infos
    }

    /// Sum of all block sizes
    pub fn total_len(&self) -> u64 {
        self.blocks.iter().map(|b| b.data.len() as u64).sum()
    }
}

/// Absolute addresses of every occurrence of `magic` inside the blocks
fn find_magic(blocks: &[Block], magic: &[u8]) -> Vec<u32> {
    blocks
        .iter()
        .flat_map(|block| {
            block
                .data
                .windows(magic.len())
                .enumerate()
                .filter(|(_, window)| *window == magic)
                .map(move |(offset, _)| block.address_offset + offset as u32)
        })
        .collect()
}

fn scan_app_infos(blocks: &[Block]) -> Vec<AppInfo> {
    let mut infos = Vec::new();
    for block in blocks {
        for (offset, window) in block.data.windows(APP_INFO_MAGIC.len()).enumerate() {
            if window != APP_INFO_MAGIC {
                continue;
            }
            let address = block.address_offset + offset as u32;
            let body = &block.data[offset + APP_INFO_MAGIC.len()..];
            match AppInfo::parse(address, body) {
                Some(info) => infos.push(info),
                None => log::debug!("[Image] Truncated application information block at 0x{:08X}", address),
            }
        }
    }
    infos
}
