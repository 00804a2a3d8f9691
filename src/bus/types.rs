use std::fmt;

use serde::{Deserialize, Serialize};

// Transport id carried in every message record
pub const TRANSPORT_CAN: u32 = 1;

// TxFlags
pub const TX_FLAG_FUNCTIONAL: u32 = 0x0001;
pub const TX_FLAG_FRAME_PAD: u32 = 0x0040;

/// Diagnostic tool address on every bus. Reserved, never assigned to a node.
pub const CLIENT_NODE_ID: u8 = 126;

/// Functional request identifier, heard by every node on the bus
pub const FUNCTIONAL_REQUEST_ID: u32 = 0x7DF;

const PHYSICAL_REQUEST_BASE: u32 = 0x600;
const PHYSICAL_RESPONSE_BASE: u32 = 0x680;

/// 4-byte identifier header + payload
pub const MAX_DATA_SIZE: usize = 4128;
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATA_SIZE - 4;

/// Request identifier for a server node
pub fn request_id(server_node_id: u8) -> u32 {
    PHYSICAL_REQUEST_BASE + server_node_id as u32
}

/// Response identifier for a server node
pub fn response_id(server_node_id: u8) -> u32 {
    PHYSICAL_RESPONSE_BASE + server_node_id as u32
}

/// Physical medium of a bus or interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Can,
    Ethernet,
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusKind::Can => write!(f, "CAN"),
            BusKind::Ethernet => write!(f, "Ethernet"),
        }
    }
}

/// Message record exchanged with the bus driver library
#[repr(C)]
#[derive(Clone)]
pub struct BusMessage {
    pub transport_id: u32,
    pub rx_status: u32,
    pub tx_flags: u32,
    pub timestamp: u32,
    pub data_size: u32,
    pub data: [u8; MAX_DATA_SIZE],
}

impl Default for BusMessage {
    fn default() -> Self {
        Self {
            transport_id: TRANSPORT_CAN,
            rx_status: 0,
            tx_flags: 0,
            timestamp: 0,
            data_size: 0,
            data: [0u8; MAX_DATA_SIZE],
        }
    }
}

impl BusMessage {
    /// Build a message addressed to `id`. Payloads beyond `MAX_PAYLOAD_SIZE` are rejected.
    pub fn new(id: u32, payload: &[u8]) -> Result<Self, DriverError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(DriverError::ExceededLimit);
        }
        let mut msg = Self {
            tx_flags: TX_FLAG_FRAME_PAD,
            data_size: (4 + payload.len()) as u32,
            ..Default::default()
        };
        msg.data[0..4].copy_from_slice(&id.to_be_bytes());
        msg.data[4..4 + payload.len()].copy_from_slice(payload);
        Ok(msg)
    }

    /// Build a functional (broadcast) request
    pub fn new_functional(payload: &[u8]) -> Result<Self, DriverError> {
        let mut msg = Self::new(FUNCTIONAL_REQUEST_ID, payload)?;
        msg.tx_flags |= TX_FLAG_FUNCTIONAL;
        Ok(msg)
    }

    pub fn payload(&self) -> &[u8] {
        let end = (self.data_size as usize).min(MAX_DATA_SIZE);
        if end > 4 {
            &self.data[4..end]
        } else {
            &[]
        }
    }

    pub fn id(&self) -> u32 {
        u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    pub fn is_functional(&self) -> bool {
        self.tx_flags & TX_FLAG_FUNCTIONAL != 0
    }
}

impl fmt::Debug for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusMessage")
            .field("transport_id", &self.transport_id)
            .field("id", &format_args!("0x{:03X}", self.id()))
            .field("payload", &format_args!("[{}]", hex_dump(self.payload())))
            .finish()
    }
}

/// Space separated upper-case hex, used for trace logging
pub fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Status codes returned by the bus driver library
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("Not supported")]
    NotSupported,
    #[error("Invalid channel handle")]
    InvalidHandle,
    #[error("Null parameter")]
    NullParameter,
    #[error("Failed")]
    Failed,
    #[error("Device not connected")]
    DeviceNotConnected,
    #[error("Timeout")]
    Timeout,
    #[error("Invalid message")]
    InvalidMsg,
    #[error("Exceeded limit")]
    ExceededLimit,
    #[error("Device in use")]
    DeviceInUse,
    #[error("Buffer empty")]
    BufferEmpty,
    #[error("Buffer full")]
    BufferFull,
    #[error("Buffer overflow")]
    BufferOverflow,
    #[error("Invalid bitrate")]
    InvalidBitrate,
    #[error("Bus off")]
    BusOff,
}

impl DriverError {
    /// Map a driver status code. 0 is success and has no error value.
    pub fn from_code(code: u32) -> Option<Self> {
        let err = match code {
            0x00 => return None,
            0x01 => Self::NotSupported,
            0x02 => Self::InvalidHandle,
            0x04 => Self::NullParameter,
            0x07 => Self::Failed,
            0x08 => Self::DeviceNotConnected,
            0x09 => Self::Timeout,
            0x0A => Self::InvalidMsg,
            0x0C => Self::ExceededLimit,
            0x0E => Self::DeviceInUse,
            0x10 => Self::BufferEmpty,
            0x11 => Self::BufferFull,
            0x12 => Self::BufferOverflow,
            0x19 => Self::InvalidBitrate,
            0x1B => Self::BusOff,
            _ => Self::Failed,
        };
        Some(err)
    }

    /// Read-side statuses meaning "nothing arrived yet"
    pub fn is_empty_read(&self) -> bool {
        matches!(self, Self::BufferEmpty | Self::Timeout)
    }
}
