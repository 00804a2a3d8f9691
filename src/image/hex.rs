//! Intel HEX record parsing into contiguous memory segments.

use std::collections::BTreeMap;

/// Record types of the Intel HEX format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Data,
    EndOfFile,
    ExtendedSegmentAddress,
    StartSegmentAddress,
    ExtendedLinearAddress,
    StartLinearAddress,
}

impl RecordType {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Data),
            0x01 => Some(Self::EndOfFile),
            0x02 => Some(Self::ExtendedSegmentAddress),
            0x03 => Some(Self::StartSegmentAddress),
            0x04 => Some(Self::ExtendedLinearAddress),
            0x05 => Some(Self::StartLinearAddress),
            _ => None,
        }
    }
}

/// Why a record could not be accepted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("missing ':' start code")]
    MissingStartCode,
    #[error("invalid hex digits")]
    InvalidHex,
    #[error("record too short")]
    TooShort,
    #[error("byte count {declared} does not match record length {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("checksum 0x{found:02X} does not match computed 0x{expected:02X}")]
    Checksum { expected: u8, found: u8 },
    #[error("unknown record type 0x{0:02X}")]
    UnknownType(u8),
    #[error("malformed address record")]
    BadAddressRecord,
    #[error("data at 0x{0:08X} overlaps previously defined data")]
    Overlap(u32),
    #[error("data runs past the 32-bit address space")]
    AddressOverflow,
    #[error("data after end-of-file record")]
    DataAfterEof,
    #[error("missing end-of-file record")]
    MissingEof,
}

/// Parse failure with the 1-based line it occurred on (0 for file-level problems)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {kind}")]
pub struct HexError {
    pub line: usize,
    pub kind: RecordError,
}

/// One decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub rtype: RecordType,
    pub address: u16,
    pub data: Vec<u8>,
}

impl Record {
    /// Parse one line of the form `:LLAAAATT[DD...]CC`
    pub fn parse(line: &str) -> Result<Self, RecordError> {
        let body = line.strip_prefix(':').ok_or(RecordError::MissingStartCode)?;
        let bytes = hex::decode(body).map_err(|_| RecordError::InvalidHex)?;
        if bytes.len() < 5 {
            return Err(RecordError::TooShort);
        }

        let declared = bytes[0] as usize;
        let actual = bytes.len() - 5;
        if declared != actual {
            return Err(RecordError::LengthMismatch { declared, actual });
        }

        let (content, checksum) = bytes.split_at(bytes.len() - 1);
        let expected = checksum_of(content);
        if expected != checksum[0] {
            return Err(RecordError::Checksum {
                expected,
                found: checksum[0],
            });
        }

        let rtype = RecordType::from_byte(bytes[3]).ok_or(RecordError::UnknownType(bytes[3]))?;
        Ok(Self {
            rtype,
            address: u16::from_be_bytes([bytes[1], bytes[2]]),
            data: bytes[4..4 + declared].to_vec(),
        })
    }
}

/// Two's complement of the byte sum
pub fn checksum_of(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

/// Sparse memory image: start address of each contiguous segment -> bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HexImage {
    pub segments: BTreeMap<u32, Vec<u8>>,
    pub start_address: Option<u32>,
}

impl HexImage {
    /// Parse a whole Intel HEX text
    pub fn parse(content: &str) -> Result<Self, HexError> {
        let mut image = Self::default();
        let mut base: u32 = 0;
        let mut seen_eof = false;

        for (index, raw) in content.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let at = |kind: RecordError| HexError { line: line_no, kind };
            if seen_eof {
                return Err(at(RecordError::DataAfterEof));
            }

            let record = Record::parse(line).map_err(at)?;
            match record.rtype {
                RecordType::Data => {
                    let address = base
                        .checked_add(record.address as u32)
                        .ok_or(at(RecordError::AddressOverflow))?;
                    image.insert(address, &record.data).map_err(at)?;
                }
                RecordType::EndOfFile => seen_eof = true,
                RecordType::ExtendedSegmentAddress => {
                    let segment = address_payload::<2>(&record).map_err(at)?;
                    base = (u16::from_be_bytes(segment) as u32) << 4;
                }
                RecordType::ExtendedLinearAddress => {
                    let upper = address_payload::<2>(&record).map_err(at)?;
                    base = (u16::from_be_bytes(upper) as u32) << 16;
                }
                RecordType::StartSegmentAddress | RecordType::StartLinearAddress => {
                    let start = address_payload::<4>(&record).map_err(at)?;
                    image.start_address = Some(u32::from_be_bytes(start));
                }
            }
        }

        if !seen_eof {
            return Err(HexError {
                line: 0,
                kind: RecordError::MissingEof,
            });
        }
        Ok(image)
    }

    /// Insert data at `address`, merging with adjacent segments
    fn insert(&mut self, address: u32, data: &[u8]) -> Result<(), RecordError> {
        if data.is_empty() {
            return Ok(());
        }
        let end = address as u64 + data.len() as u64;
        if end > u32::MAX as u64 + 1 {
            return Err(RecordError::AddressOverflow);
        }

        // Previous segment: overlap check and append candidate
        let mut append_to = None;
        if let Some((&start, existing)) = self.segments.range(..=address).next_back() {
            let existing_end = start as u64 + existing.len() as u64;
            if (address as u64) < existing_end {
                return Err(RecordError::Overlap(address));
            }
            if existing_end == address as u64 {
                append_to = Some(start);
            }
        }

        // Next segment: overlap check and prepend candidate
        let mut merge_next = None;
        if let Some((&next_start, _)) = self.segments.range(address..).next() {
            if (next_start as u64) < end {
                return Err(RecordError::Overlap(address));
            }
            if next_start as u64 == end {
                merge_next = Some(next_start);
            }
        }

        let tail = merge_next.and_then(|start| self.segments.remove(&start));
        match append_to {
            Some(start) => {
                if let Some(segment) = self.segments.get_mut(&start) {
                    segment.extend_from_slice(data);
                    if let Some(tail) = tail {
                        segment.extend_from_slice(&tail);
                    }
                }
            }
            None => {
                let mut segment = data.to_vec();
                if let Some(tail) = tail {
                    segment.extend_from_slice(&tail);
                }
                self.segments.insert(address, segment);
            }
        }
        Ok(())
    }

    /// Total number of data bytes
    pub fn data_len(&self) -> usize {
        self.segments.values().map(Vec::len).sum()
    }
}

fn address_payload<const N: usize>(record: &Record) -> Result<[u8; N], RecordError> {
    record
        .data
        .as_slice()
        .try_into()
        .map_err(|_| RecordError::BadAddressRecord)
}
