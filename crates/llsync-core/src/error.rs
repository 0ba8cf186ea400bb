//! Error taxonomy with stable, user-visible codes.
//!
//! Every failure a caller can observe maps to an [`ErrorCode`] with a
//! fixed code string and message, so UIs and telemetry stay stable
//! across refactors. Layer-specific errors (`TlvError`, `FragmentError`,
//! `TransportError`, ...) converge into [`ProtocolError`] at the session
//! surface.

use std::fmt;

use thiserror::Error;

use crate::backend::BackendError;
use crate::crypto::AuthError;
use crate::protocol::FragmentError;
use crate::schema::SchemaError;
use crate::tlv::TlvError;
use crate::transport::TransportError;

/// Stable failure codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Pairing / control exchanges.
    WaitBindReplyTimeout,
    WaitConnectReplyTimeout,
    WaitUnbindReplyTimeout,
    WaitDeviceInfoTimeout,
    WaitControlPropertyReplyTimeout,
    WaitControlActionReplyTimeout,
    WaitUserCheckTimeout,
    UserCheckRejected,
    ConnectReplyInvalid,
    DeviceInfoInvalid,
    UnbindReplyInvalid,
    ControlReplyInvalid,
    UpdateReplyInvalid,
    PskNotFound,
    ConnectSignMismatch,
    UnbindSignMismatch,
    DeviceNameEmpty,
    SchemaMismatch,
    BadFrame,
    BleWriteError,
    ConnectionBroken,
    BackendRequestFail,
    // OTA.
    OtaInProgress,
    UserCancelledOta,
    GetOtaInfoFail,
    FirmwareUpToDate,
    ModuleNotSupported,
    ModuleNotAllowed,
    WaitUpdateReplyTimeout,
    UpdateDataReplyTimeout,
    UpdateCheckFileFail,
    ModuleUpdateFail,
    ModuleUpdateConnectTimeout,
    WaitModuleRebootTimeout,
}

impl ErrorCode {
    /// Stable code string, suitable for logs and telemetry.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::WaitBindReplyTimeout => "WAIT_BIND_REPLY_TIMEOUT",
            ErrorCode::WaitConnectReplyTimeout => "WAIT_CONNECT_REPLY_TIMEOUT",
            ErrorCode::WaitUnbindReplyTimeout => "WAIT_UNBIND_REPLY_TIMEOUT",
            ErrorCode::WaitDeviceInfoTimeout => "WAIT_GET_DEVICE_INFO_TIMEOUT",
            ErrorCode::WaitControlPropertyReplyTimeout => "WAIT_CONTROL_DEVICE_REPLY_TIMEOUT",
            ErrorCode::WaitControlActionReplyTimeout => "WAIT_CONTROL_ACTION_REPLY_TIMEOUT",
            ErrorCode::WaitUserCheckTimeout => "WAIT_USER_CHECK_TIMEOUT",
            ErrorCode::UserCheckRejected => "GET_USER_CHECK_REJECT",
            ErrorCode::ConnectReplyInvalid => "CONNECT_REPLY_INVALID",
            ErrorCode::DeviceInfoInvalid => "DEVICE_INFO_INVALID",
            ErrorCode::UnbindReplyInvalid => "UNBIND_REPLY_INVALID",
            ErrorCode::ControlReplyInvalid => "CONTROL_REPLY_INVALID",
            ErrorCode::UpdateReplyInvalid => "UPDATE_REPLY_INVALID",
            ErrorCode::PskNotFound => "PSK_GET_ERROR",
            ErrorCode::ConnectSignMismatch => "CONNECT_SIGN_AUTH_ERROR",
            ErrorCode::UnbindSignMismatch => "UNBIND_REPLY_ERROR",
            ErrorCode::DeviceNameEmpty => "DEVICE_NAME_IS_EMPTY",
            ErrorCode::SchemaMismatch => "TEMPLATE_NOT_MATCH",
            ErrorCode::BadFrame => "FRAME_PARSE_ERROR",
            ErrorCode::BleWriteError => "BLE_WRITE_ERROR",
            ErrorCode::ConnectionBroken => "BLE_CONNECTION_BREAK",
            ErrorCode::BackendRequestFail => "BACKEND_REQUEST_FAIL",
            ErrorCode::OtaInProgress => "OTA_UPDATE_IN_PROGRESS",
            ErrorCode::UserCancelledOta => "USER_CANCEL_OTA_UPDATE",
            ErrorCode::GetOtaInfoFail => "GET_OTA_INFO_FAIL",
            ErrorCode::FirmwareUpToDate => "MODULE_VERSION_IS_UPDATED",
            ErrorCode::ModuleNotSupported => "MODULE_DONNOT_SUPPORT",
            ErrorCode::ModuleNotAllowed => "MODULE_DONNOT_ALLOW",
            ErrorCode::WaitUpdateReplyTimeout => "WAIT_GET_UPDATE_INFO_TIMEOUT",
            ErrorCode::UpdateDataReplyTimeout => "UPDATE_DATA_REPLAY_TIMEOUT",
            ErrorCode::UpdateCheckFileFail => "MODULE_UPDATE_CHECK_FILE_FAIL",
            ErrorCode::ModuleUpdateFail => "MODULE_UPDATE_FAIL",
            ErrorCode::ModuleUpdateConnectTimeout => "MODULE_UPDATE_CONNECT_TIMEOUT",
            ErrorCode::WaitModuleRebootTimeout => "WAIT_MODULE_UPDATE_TIMEOUT",
        }
    }

    /// Human-readable message from the fixed code→message table.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::WaitBindReplyTimeout => "timed out waiting for the bind reply",
            ErrorCode::WaitConnectReplyTimeout => "timed out waiting for the connection auth reply",
            ErrorCode::WaitUnbindReplyTimeout => "timed out waiting for the unbind reply",
            ErrorCode::WaitDeviceInfoTimeout => "timed out waiting for device info",
            ErrorCode::WaitControlPropertyReplyTimeout => {
                "timed out waiting for the property control reply"
            }
            ErrorCode::WaitControlActionReplyTimeout => {
                "timed out waiting for the action control reply"
            }
            ErrorCode::WaitUserCheckTimeout => "user did not confirm the bind in time",
            ErrorCode::UserCheckRejected => "user rejected the bind on the device",
            ErrorCode::ConnectReplyInvalid => "device sent an empty or malformed auth reply",
            ErrorCode::DeviceInfoInvalid => "device sent an empty or malformed info reply",
            ErrorCode::UnbindReplyInvalid => "device sent an empty or malformed unbind reply",
            ErrorCode::ControlReplyInvalid => "device sent an empty or malformed control reply",
            ErrorCode::UpdateReplyInvalid => "device sent an empty or malformed update reply",
            ErrorCode::PskNotFound => "no PSK record for this device",
            ErrorCode::ConnectSignMismatch => "connection signature verification failed",
            ErrorCode::UnbindSignMismatch => "unbind signature verification failed",
            ErrorCode::DeviceNameEmpty => "device name is required",
            ErrorCode::SchemaMismatch => "data template does not match the device payload",
            ErrorCode::BadFrame => "notify frame could not be parsed",
            ErrorCode::BleWriteError => "BLE write failed",
            ErrorCode::ConnectionBroken => "BLE connection broken",
            ErrorCode::BackendRequestFail => "backend request failed",
            ErrorCode::OtaInProgress => "an OTA update is already in progress",
            ErrorCode::UserCancelledOta => "OTA update cancelled by the user",
            ErrorCode::GetOtaInfoFail => "could not fetch OTA metadata",
            ErrorCode::FirmwareUpToDate => "firmware is already at the target version",
            ErrorCode::ModuleNotSupported => "module does not support this operation",
            ErrorCode::ModuleNotAllowed => "device refused the update request",
            ErrorCode::WaitUpdateReplyTimeout => "timed out waiting for the update reply",
            ErrorCode::UpdateDataReplyTimeout => "timed out waiting for the data acknowledgement",
            ErrorCode::UpdateCheckFileFail => "device reported a firmware integrity failure",
            ErrorCode::ModuleUpdateFail => "device rebooted into the wrong firmware version",
            ErrorCode::ModuleUpdateConnectTimeout => "could not reconnect after the update reboot",
            ErrorCode::WaitModuleRebootTimeout => "device never rebooted after the update",
        }
    }

    fn is_ota_code(self) -> bool {
        matches!(
            self,
            ErrorCode::OtaInProgress
                | ErrorCode::UserCancelledOta
                | ErrorCode::GetOtaInfoFail
                | ErrorCode::FirmwareUpToDate
                | ErrorCode::ModuleNotSupported
                | ErrorCode::ModuleNotAllowed
                | ErrorCode::WaitUpdateReplyTimeout
                | ErrorCode::UpdateDataReplyTimeout
                | ErrorCode::UpdateCheckFileFail
                | ErrorCode::ModuleUpdateFail
                | ErrorCode::ModuleUpdateConnectTimeout
                | ErrorCode::WaitModuleRebootTimeout
                | ErrorCode::UpdateReplyInvalid
                | ErrorCode::BleWriteError
                | ErrorCode::ConnectionBroken
        )
    }

    /// Collapse non-OTA codes to the "module does not support" bucket.
    /// Most untyped device failures mid-update mean the firmware simply
    /// lacks the OTA service.
    pub fn classify_for_ota(self) -> ErrorCode {
        if self.is_ota_code() {
            self
        } else {
            ErrorCode::ModuleNotSupported
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.message())
    }
}

/// Failure surface of the session, pairing, control and OTA layers.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// An exchange-specific wait expired.
    #[error("{0}")]
    Timeout(ErrorCode),

    /// Device and client signatures disagree. Fatal, never retried.
    #[error("{0}")]
    SignatureMismatch(ErrorCode),

    /// The reply arrived but could not be interpreted.
    #[error("{0}")]
    InvalidReply(ErrorCode),

    /// Device answered with a non-zero status code, surfaced verbatim.
    #[error("device rejected the request with code {code}")]
    DeviceRejected { code: u8 },

    /// Cooperative cancellation observed at an await point.
    #[error("{}", ErrorCode::UserCancelledOta)]
    Cancelled,

    /// The link dropped while an operation was in flight.
    #[error("{}", ErrorCode::ConnectionBroken)]
    ConnectionBroken,

    /// Any other coded failure.
    #[error("{0}")]
    Failed(ErrorCode),

    #[error(transparent)]
    Tlv(#[from] TlvError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Fragment(#[from] FragmentError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("backend: {0}")]
    Backend(#[from] BackendError),
}

impl ProtocolError {
    /// The stable code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Timeout(code)
            | ProtocolError::SignatureMismatch(code)
            | ProtocolError::InvalidReply(code)
            | ProtocolError::Failed(code) => *code,
            ProtocolError::DeviceRejected { .. } => ErrorCode::ControlReplyInvalid,
            ProtocolError::Cancelled => ErrorCode::UserCancelledOta,
            ProtocolError::ConnectionBroken => ErrorCode::ConnectionBroken,
            ProtocolError::Tlv(_) | ProtocolError::Schema(_) => ErrorCode::SchemaMismatch,
            ProtocolError::Fragment(_) => ErrorCode::BadFrame,
            ProtocolError::Auth(_) => ErrorCode::ConnectSignMismatch,
            ProtocolError::Transport(TransportError::Disconnected) => ErrorCode::ConnectionBroken,
            ProtocolError::Transport(_) => ErrorCode::BleWriteError,
            ProtocolError::Backend(_) => ErrorCode::BackendRequestFail,
        }
    }
}
