/// Negative response codes a flashloader can return
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NegativeResponseCode {
    #[error("General reject (0x10)")]
    GeneralReject,
    #[error("Service not supported (0x11)")]
    ServiceNotSupported,
    #[error("Sub-function not supported (0x12)")]
    SubFunctionNotSupported,
    #[error("Incorrect message length or invalid format (0x13)")]
    IncorrectMessageLengthOrInvalidFormat,
    #[error("Busy - repeat request (0x21)")]
    BusyRepeatRequest,
    #[error("Conditions not correct (0x22)")]
    ConditionsNotCorrect,
    #[error("Request sequence error (0x24)")]
    RequestSequenceError,
    #[error("Request out of range (0x31)")]
    RequestOutOfRange,
    #[error("Security access denied (0x33)")]
    SecurityAccessDenied,
    #[error("Invalid key (0x35)")]
    InvalidKey,
    #[error("Exceeded number of attempts (0x36)")]
    ExceededNumberOfAttempts,
    #[error("Required time delay not expired (0x37)")]
    RequiredTimeDelayNotExpired,
    #[error("Upload/download not accepted (0x70)")]
    UploadDownloadNotAccepted,
    #[error("Transfer data suspended (0x71)")]
    TransferDataSuspended,
    #[error("General programming failure (0x72)")]
    GeneralProgrammingFailure,
    #[error("Wrong block sequence counter (0x73)")]
    WrongBlockSequenceCounter,
    #[error("Request correctly received - response pending (0x78)")]
    RequestCorrectlyReceivedResponsePending,
    #[error("Sub-function not supported in active session (0x7E)")]
    SubFunctionNotSupportedInActiveSession,
    #[error("Service not supported in active session (0x7F)")]
    ServiceNotSupportedInActiveSession,
    #[error("Unknown NRC (0x{0:02X})")]
    Unknown(u8),
}

impl NegativeResponseCode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x10 => Self::GeneralReject,
            0x11 => Self::ServiceNotSupported,
            0x12 => Self::SubFunctionNotSupported,
            0x13 => Self::IncorrectMessageLengthOrInvalidFormat,
            0x21 => Self::BusyRepeatRequest,
            0x22 => Self::ConditionsNotCorrect,
            0x24 => Self::RequestSequenceError,
            0x31 => Self::RequestOutOfRange,
            0x33 => Self::SecurityAccessDenied,
            0x35 => Self::InvalidKey,
            0x36 => Self::ExceededNumberOfAttempts,
            0x37 => Self::RequiredTimeDelayNotExpired,
            0x70 => Self::UploadDownloadNotAccepted,
            0x71 => Self::TransferDataSuspended,
            0x72 => Self::GeneralProgrammingFailure,
            0x73 => Self::WrongBlockSequenceCounter,
            0x78 => Self::RequestCorrectlyReceivedResponsePending,
            0x7E => Self::SubFunctionNotSupportedInActiveSession,
            0x7F => Self::ServiceNotSupportedInActiveSession,
            other => Self::Unknown(other),
        }
    }

    pub fn to_byte(&self) -> u8 {
        match self {
            Self::GeneralReject => 0x10,
            Self::ServiceNotSupported => 0x11,
            Self::SubFunctionNotSupported => 0x12,
            Self::IncorrectMessageLengthOrInvalidFormat => 0x13,
            Self::BusyRepeatRequest => 0x21,
            Self::ConditionsNotCorrect => 0x22,
            Self::RequestSequenceError => 0x24,
            Self::RequestOutOfRange => 0x31,
            Self::SecurityAccessDenied => 0x33,
            Self::InvalidKey => 0x35,
            Self::ExceededNumberOfAttempts => 0x36,
            Self::RequiredTimeDelayNotExpired => 0x37,
            Self::UploadDownloadNotAccepted => 0x70,
            Self::TransferDataSuspended => 0x71,
            Self::GeneralProgrammingFailure => 0x72,
            Self::WrongBlockSequenceCounter => 0x73,
            Self::RequestCorrectlyReceivedResponsePending => 0x78,
            Self::SubFunctionNotSupportedInActiveSession => 0x7E,
            Self::ServiceNotSupportedInActiveSession => 0x7F,
            Self::Unknown(code) => *code,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::RequestCorrectlyReceivedResponsePending)
    }
}

/// Diagnostic request error combining NRC and transport errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UdsError {
    #[error("Negative response for service 0x{service_id:02X}: {nrc}")]
    NegativeResponse {
        service_id: u8,
        nrc: NegativeResponseCode,
    },
    #[error("Response timeout")]
    Timeout,
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl UdsError {
    /// The device's negative response code, when the failure carries one
    pub fn nrc(&self) -> Option<NegativeResponseCode> {
        match self {
            Self::NegativeResponse { nrc, .. } => Some(*nrc),
            _ => None,
        }
    }
}
