//! Device identity as reported by the flashloader.

use std::fmt;

use serde::Serialize;

use crate::bus::Channel;
use crate::error::FlashError;
use crate::uds::services::{self, did};
use crate::uds::session::TransportSession;

/// Feature bit set announced by the flashloader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FeatureFlags(pub u32);

impl FeatureFlags {
    pub const MAX_BLOCK_LENGTH: u32 = 1 << 0;
    pub const EXTENDED_SERIAL_NUMBER: u32 = 1 << 1;
    pub const ETHERNET_ROUTING: u32 = 1 << 2;
    pub const FILE_BASED_TRANSFER: u32 = 1 << 3;

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }

    fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn max_block_length_readable(self) -> bool {
        self.has(Self::MAX_BLOCK_LENGTH)
    }

    pub fn extended_serial_number(self) -> bool {
        self.has(Self::EXTENDED_SERIAL_NUMBER)
    }

    pub fn ethernet_routing(self) -> bool {
        self.has(Self::ETHERNET_ROUTING)
    }

    pub fn file_based_transfer(self) -> bool {
        self.has(Self::FILE_BASED_TRANSFER)
    }
}

/// Serial number in either of its two on-device layouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum SerialNumber {
    Legacy([u8; 6]),
    Extended(String),
}

const EXTENDED_FORMAT_BCD: u8 = 0;
const EXTENDED_FORMAT_ASCII: u8 = 1;

impl SerialNumber {
    /// Decode an extended serial record: format byte followed by payload
    pub fn from_extended(data: &[u8]) -> Result<Self, String> {
        let (format, payload) = data
            .split_first()
            .ok_or_else(|| "empty extended serial number".to_string())?;
        match *format {
            EXTENDED_FORMAT_BCD => Ok(Self::Extended(bcd_digits(payload))),
            EXTENDED_FORMAT_ASCII => {
                let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
                Ok(Self::Extended(
                    String::from_utf8_lossy(&payload[..end]).trim().to_string(),
                ))
            }
            other => Err(format!("unknown serial number format {}", other)),
        }
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerialNumber::Legacy(bytes) => {
                let digits = bcd_digits(bytes);
                write!(f, "{}.{}.{}", &digits[..2], &digits[2..8], &digits[8..])
            }
            SerialNumber::Extended(text) => f.write_str(text),
        }
    }
}

fn bcd_digits(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Date, time and user of the last flash
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fingerprint {
    pub date: String,
    pub time: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub article_number: String,
    pub hardware_version: String,
    pub device_name: String,
    pub protocol_version: String,
    pub flashloader_sw_version: String,
    pub flashloader_protocol_version: String,
    pub flash_count: u32,
    pub fingerprint: Fingerprint,
    pub features: FeatureFlags,
    pub max_block_length: Option<u32>,
    pub serial_number: SerialNumber,
}

/// Read every identity field in the fixed order. The first failure aborts.
pub fn read<C: Channel>(session: &TransportSession<C>) -> Result<DeviceIdentity, FlashError> {
    let text = |step: &'static str, id: u16| {
        services::read_did_string(session, id).map_err(|e| FlashError::com(step, e))
    };
    let version = |step: &'static str, id: u16| {
        services::read_did_fixed::<C, 2>(session, id)
            .map(|[major, minor]| format!("{}.{}", major, minor))
            .map_err(|e| FlashError::com(step, e))
    };

    let article_number = text("Read article number", did::ARTICLE_NUMBER)?;
    let hardware_version = text("Read hardware version", did::HARDWARE_VERSION)?;
    let device_name = text("Read device name", did::DEVICE_NAME)?;
    let protocol_version = version("Read protocol version", did::PROTOCOL_VERSION)?;
    let flashloader_sw_version = text("Read flashloader version", did::FLASHLOADER_SW_VERSION)?;
    let flashloader_protocol_version = version(
        "Read flashloader protocol version",
        did::FLASHLOADER_PROTOCOL_VERSION,
    )?;
    let flash_count = services::read_did_fixed::<C, 4>(session, did::FLASH_COUNT)
        .map(u32::from_be_bytes)
        .map_err(|e| FlashError::com("Read flash count", e))?;
    let fingerprint = read_fingerprint(session)?;

    // Decides which of the remaining fields exist
    let features = services::read_did_fixed::<C, 4>(session, did::FEATURE_LIST)
        .map(FeatureFlags::from_bytes)
        .map_err(|e| FlashError::com("Read feature list", e))?;

    let max_block_length = if features.max_block_length_readable() {
        let value = services::read_did_fixed::<C, 4>(session, did::MAX_BLOCK_LENGTH)
            .map(u32::from_be_bytes)
            .map_err(|e| FlashError::com("Read max block length", e))?;
        Some(value)
    } else {
        None
    };

    let serial_number = if features.extended_serial_number() {
        let data = services::read_did_data(session, did::SERIAL_NUMBER_EXT)
            .map_err(|e| FlashError::com("Read serial number", e))?;
        SerialNumber::from_extended(&data).map_err(|e| {
            FlashError::com(
                "Read serial number",
                crate::uds::error::UdsError::InvalidResponse(e),
            )
        })?
    } else {
        services::read_did_fixed::<C, 6>(session, did::SERIAL_NUMBER)
            .map(SerialNumber::Legacy)
            .map_err(|e| FlashError::com("Read serial number", e))?
    };

    Ok(DeviceIdentity {
        article_number,
        hardware_version,
        device_name,
        protocol_version,
        flashloader_sw_version,
        flashloader_protocol_version,
        flash_count,
        fingerprint,
        features,
        max_block_length,
        serial_number,
    })
}

fn read_fingerprint<C: Channel>(session: &TransportSession<C>) -> Result<Fingerprint, FlashError> {
    let [yy, mm, dd] = services::read_did_fixed::<C, 3>(session, did::FINGERPRINT_DATE)
        .map_err(|e| FlashError::com("Read fingerprint date", e))?;
    let [h, m, s] = services::read_did_fixed::<C, 3>(session, did::FINGERPRINT_TIME)
        .map_err(|e| FlashError::com("Read fingerprint time", e))?;
    let username = services::read_did_string(session, did::FINGERPRINT_USERNAME)
        .map_err(|e| FlashError::com("Read fingerprint user", e))?;
    Ok(Fingerprint {
        date: format!("20{:02}-{:02}-{:02}", yy, mm, dd),
        time: format!("{:02}:{:02}:{:02}", h, m, s),
        username,
    })
}
