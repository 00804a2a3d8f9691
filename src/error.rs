use serde::Serialize;

use crate::image::ReadError;
use crate::route::RouteStatus;
use crate::sequencer::SequencerState;
use crate::uds::error::{NegativeResponseCode, UdsError};
use crate::uds::session::ConnectError;

/// Caller-visible outcome of an engine operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResultCode {
    Ok,
    ComFailure,
    SessionFailure,
    SecureModeUnsupported,
    NoSignatureBlock,
    ParseError,
    IoError,
    RangeError,
    NoRoute,
    BridgeNotSupported,
    NotApplicable,
    Cancelled,
}

impl ResultCode {
    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ResultCode::Ok => "OK",
            ResultCode::ComFailure => "communication failure",
            ResultCode::SessionFailure => "session failure",
            ResultCode::SecureModeUnsupported => "secure mode not supported",
            ResultCode::NoSignatureBlock => "no signature block",
            ResultCode::ParseError => "parse error",
            ResultCode::IoError => "I/O error",
            ResultCode::RangeError => "target out of range",
            ResultCode::NoRoute => "no route",
            ResultCode::BridgeNotSupported => "bridge not supported",
            ResultCode::NotApplicable => "not applicable",
            ResultCode::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// Failure of a sequencer step
#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    #[error("No open session")]
    NotConnected,
    #[error("Connect failed: {0}")]
    Connect(#[from] ConnectError),
    #[error("Firmware image: {0}")]
    Image(#[from] ReadError),
    #[error("{step} failed: {source}")]
    Communication {
        step: &'static str,
        #[source]
        source: UdsError,
    },
    #[error("Programming session rejected: {0}")]
    Session(#[source] UdsError),
    #[error("Device runs in secure mode, which is not supported")]
    SecureModeUnsupported,
    #[error("Flash memory not available for block at 0x{offset:08X} ({size} bytes): {source}")]
    FlashNotAvailable {
        offset: u32,
        size: u32,
        #[source]
        source: UdsError,
    },
    #[error("Image has no signature block address")]
    MissingSignatureAddress,
    #[error("Operation not allowed in state {0:?}")]
    InvalidState(SequencerState),
    #[error("Cancelled")]
    Cancelled,
}

impl FlashError {
    pub(crate) fn com(step: &'static str, source: UdsError) -> Self {
        FlashError::Communication { step, source }
    }

    pub fn code(&self) -> ResultCode {
        match self {
            FlashError::NotConnected
            | FlashError::Connect(_)
            | FlashError::Communication { .. }
            | FlashError::FlashNotAvailable { .. } => ResultCode::ComFailure,
            FlashError::Image(e) => e.into(),
            FlashError::Session(_) | FlashError::InvalidState(_) => ResultCode::SessionFailure,
            FlashError::SecureModeUnsupported => ResultCode::SecureModeUnsupported,
            FlashError::MissingSignatureAddress => ResultCode::NoSignatureBlock,
            FlashError::Cancelled => ResultCode::Cancelled,
        }
    }

    /// Negative response code reported by the device, if any
    pub fn nrc(&self) -> Option<NegativeResponseCode> {
        match self {
            FlashError::Communication { source, .. }
            | FlashError::Session(source)
            | FlashError::FlashNotAvailable { source, .. } => source.nrc(),
            _ => None,
        }
    }
}

impl From<&FlashError> for ResultCode {
    fn from(e: &FlashError) -> Self {
        e.code()
    }
}

impl From<&ReadError> for ResultCode {
    fn from(e: &ReadError) -> Self {
        match e {
            ReadError::Io { .. } => ResultCode::IoError,
            ReadError::Parse(_) | ReadError::InvalidBlocks(_) => ResultCode::ParseError,
            ReadError::NoSignatureBlock | ReadError::AmbiguousSignatureBlock(_) => {
                ResultCode::NoSignatureBlock
            }
        }
    }
}

impl From<RouteStatus> for ResultCode {
    fn from(status: RouteStatus) -> Self {
        match status {
            RouteStatus::Ok => ResultCode::Ok,
            RouteStatus::Range => ResultCode::RangeError,
            RouteStatus::Com => ResultCode::NoRoute,
            RouteStatus::Config => ResultCode::BridgeNotSupported,
            RouteStatus::NoAct => ResultCode::NotApplicable,
        }
    }
}
