use crate::bus::Channel;
use crate::uds::error::UdsError;
use crate::uds::session::TransportSession;

/// Diagnostic session types
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum DiagSession {
    Programming = 0x02,
    PreProgramming = 0x60,
}

/// Sub-function bit asking the server not to answer
pub const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;

/// Data identifiers read and written by the flash sequence
pub mod did {
    pub const ARTICLE_NUMBER: u16 = 0xA801;
    pub const HARDWARE_VERSION: u16 = 0xF191;
    pub const DEVICE_NAME: u16 = 0xF197;
    pub const PROTOCOL_VERSION: u16 = 0xA802;
    pub const FLASHLOADER_SW_VERSION: u16 = 0xF180;
    pub const FLASHLOADER_PROTOCOL_VERSION: u16 = 0xA803;
    pub const FLASH_COUNT: u16 = 0xA804;
    pub const FINGERPRINT_DATE: u16 = 0xF199;
    pub const FINGERPRINT_TIME: u16 = 0xA805;
    pub const FINGERPRINT_USERNAME: u16 = 0xA806;
    pub const FEATURE_LIST: u16 = 0xA807;
    pub const MAX_BLOCK_LENGTH: u16 = 0xA808;
    pub const SERIAL_NUMBER: u16 = 0xF18C;
    pub const SERIAL_NUMBER_EXT: u16 = 0xA809;
}

/// Known routine IDs
pub mod routine {
    pub const CHECK_FLASH_MEMORY_AVAILABLE: u16 = 0x0204;
    pub const REQUEST_PROGRAMMING: u16 = 0x0206;
}

/// Routine control sub-functions
pub const ROUTINE_START: u8 = 0x01;

/// Security access levels of the non-secure flash handshake
pub const SECURITY_LEVEL_SEED: u8 = 0x05;
pub const SECURITY_LEVEL_KEY: u8 = 0x06;

/// Seed-response mode byte announcing secure mode
const SECURE_MODE_FLAG: u8 = 0x01;

// ─── Diagnostic Session Control (0x10) ──────────────────────────────

pub fn diagnostic_session<C: Channel>(
    session: &TransportSession<C>,
    kind: DiagSession,
) -> Result<Vec<u8>, UdsError> {
    session.send_recv(&[0x10, kind as u8])
}

/// Functional "enter preprogramming session" with the response suppressed
pub fn broadcast_preprogramming<C: Channel>(session: &TransportSession<C>) -> Result<(), UdsError> {
    session.broadcast(&[
        0x10,
        DiagSession::PreProgramming as u8 | SUPPRESS_POSITIVE_RESPONSE,
    ])
}

// ─── ECUReset (0x11) ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetType {
    HardReset = 0x01,
    ResetToFlashloader = 0x60,
}

pub fn ecu_reset<C: Channel>(
    session: &TransportSession<C>,
    reset_type: ResetType,
) -> Result<Vec<u8>, UdsError> {
    session.send_recv(&[0x11, reset_type as u8])
}

// ─── ReadDataByIdentifier (0x22) / WriteDataByIdentifier (0x2E) ─────

pub fn read_did<C: Channel>(session: &TransportSession<C>, did_id: u16) -> Result<Vec<u8>, UdsError> {
    let [hi, lo] = did_id.to_be_bytes();
    let response = session.send_recv(&[0x22, hi, lo])?;
    // Response: 0x62 DID_HI DID_LO DATA...
    if response.len() < 3 || response[1] != hi || response[2] != lo {
        return Err(UdsError::InvalidResponse(format!(
            "ReadDID 0x{:04X} response malformed",
            did_id
        )));
    }
    Ok(response)
}

/// Read a DID and return just the data portion (after service ID + DID bytes)
pub fn read_did_data<C: Channel>(session: &TransportSession<C>, did_id: u16) -> Result<Vec<u8>, UdsError> {
    let response = read_did(session, did_id)?;
    Ok(response[3..].to_vec())
}

/// Read a DID carrying NUL-padded ASCII
pub fn read_did_string<C: Channel>(session: &TransportSession<C>, did_id: u16) -> Result<String, UdsError> {
    let data = read_did_data(session, did_id)?;
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    Ok(String::from_utf8_lossy(&data[..end]).trim().to_string())
}

/// Read a DID of exactly `N` bytes
pub fn read_did_fixed<C: Channel, const N: usize>(
    session: &TransportSession<C>,
    did_id: u16,
) -> Result<[u8; N], UdsError> {
    let data = read_did_data(session, did_id)?;
    data.as_slice().try_into().map_err(|_| {
        UdsError::InvalidResponse(format!(
            "DID 0x{:04X}: expected {} bytes, got {}",
            did_id,
            N,
            data.len()
        ))
    })
}

pub fn write_did<C: Channel>(session: &TransportSession<C>, did_id: u16, data: &[u8]) -> Result<(), UdsError> {
    let [hi, lo] = did_id.to_be_bytes();
    let mut request = vec![0x2E, hi, lo];
    request.extend_from_slice(data);
    session.send_recv(&request)?;
    Ok(())
}

// ─── SecurityAccess (0x27) ──────────────────────────────────────────

/// Seed answer of the flashloader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedResponse {
    pub seed: u32,
    pub secure_mode: bool,
}

/// Request security seed from the device
pub fn security_request_seed<C: Channel>(
    session: &TransportSession<C>,
    level: u8,
) -> Result<SeedResponse, UdsError> {
    let response = session.send_recv(&[0x27, level])?;
    // Response: 0x67 LEVEL SEED[4] [MODE]
    if response.len() < 6 {
        return Err(UdsError::InvalidResponse(
            "SecurityAccess seed response too short, expected at least 6 bytes".into(),
        ));
    }
    let seed = u32::from_be_bytes([response[2], response[3], response[4], response[5]]);
    let secure_mode = response.get(6).copied() == Some(SECURE_MODE_FLAG);
    Ok(SeedResponse { seed, secure_mode })
}

/// Send security key to the device
pub fn security_send_key<C: Channel>(
    session: &TransportSession<C>,
    level: u8,
    key: &[u8],
) -> Result<(), UdsError> {
    let mut request = vec![0x27, level];
    request.extend_from_slice(key);
    session.send_recv(&request)?;
    Ok(())
}

// ─── RoutineControl (0x31) ──────────────────────────────────────────

/// Start a routine and return its status record (bytes after the routine id)
pub fn routine_start<C: Channel>(
    session: &TransportSession<C>,
    routine_id: u16,
    data: &[u8],
) -> Result<Vec<u8>, UdsError> {
    let [hi, lo] = routine_id.to_be_bytes();
    let mut request = vec![0x31, ROUTINE_START, hi, lo];
    request.extend_from_slice(data);

    let response = session.send_recv(&request)?;
    // Response: 0x71 SUB RID_HI RID_LO [STATUS...]
    if response.len() < 4 {
        return Err(UdsError::InvalidResponse(format!(
            "RoutineControl 0x{:04X} response too short",
            routine_id
        )));
    }
    Ok(response[4..].to_vec())
}

/// Set the "request programming" flag so the application hands over to the flashloader on reset
pub fn request_programming<C: Channel>(session: &TransportSession<C>) -> Result<(), UdsError> {
    routine_start(session, routine::REQUEST_PROGRAMMING, &[])?;
    Ok(())
}

/// Ask the device whether `[address, address + size)` may be written
pub fn check_flash_memory_available<C: Channel>(
    session: &TransportSession<C>,
    address: u32,
    size: u32,
) -> Result<(), UdsError> {
    let mut params = address.to_be_bytes().to_vec();
    params.extend_from_slice(&size.to_be_bytes());
    routine_start(session, routine::CHECK_FLASH_MEMORY_AVAILABLE, &params)?;
    Ok(())
}

// ─── RequestDownload (0x34) / TransferData (0x36) / Exit (0x37) ─────

/// Open a download window. Returns the device's max block length.
pub fn request_download<C: Channel>(
    session: &TransportSession<C>,
    address: u32,
    size: u32,
) -> Result<u32, UdsError> {
    let mut request = vec![0x34, 0x00, 0x44];
    request.extend_from_slice(&address.to_be_bytes());
    request.extend_from_slice(&size.to_be_bytes());

    let response = session.send_recv(&request)?;
    if response.len() < 2 {
        return Err(UdsError::InvalidResponse("RequestDownload response too short".into()));
    }

    let num_bytes = (response[1] >> 4) as usize;
    if num_bytes == 0 || num_bytes > 4 || response.len() < 2 + num_bytes {
        return Err(UdsError::InvalidResponse(
            "RequestDownload response missing maxBlockLength".into(),
        ));
    }

    let max_block_length = response[2..2 + num_bytes]
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | b as u32);
    Ok(max_block_length)
}

pub fn transfer_data<C: Channel>(
    session: &TransportSession<C>,
    sequence_counter: u8,
    data: &[u8],
) -> Result<(), UdsError> {
    let mut request = Vec::with_capacity(data.len() + 2);
    request.push(0x36);
    request.push(sequence_counter);
    request.extend_from_slice(data);

    let response = session.send_recv(&request)?;
    if response.get(1) != Some(&sequence_counter) {
        return Err(UdsError::InvalidResponse(format!(
            "TransferData echoed wrong sequence counter (sent {})",
            sequence_counter
        )));
    }
    Ok(())
}

/// Close the download window, optionally verifying the signature at `signature_address`
pub fn request_transfer_exit<C: Channel>(
    session: &TransportSession<C>,
    signature_address: Option<u32>,
) -> Result<(), UdsError> {
    let mut request = vec![0x37];
    if let Some(address) = signature_address {
        request.push(0x01);
        request.extend_from_slice(&address.to_be_bytes());
    }
    session.send_recv(&request)?;
    Ok(())
}
