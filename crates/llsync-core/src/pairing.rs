//! Pairing and authentication exchanges: bind, connection auth, device
//! info, MTU negotiation and unbind.
//!
//! Each exchange is a `write_then_wait` over the session engine with its
//! own timeout code. Mid-sequence failures are written back to the
//! device before they surface locally, so the peer never believes an
//! aborted bind or unbind succeeded.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{BackendApi, BackendError, BindRequest};
use crate::crypto::{self, AuthError};
use crate::error::{ErrorCode, ProtocolError};
use crate::events::{LinkPhase, LlsyncEvent, LlsyncObserver};
use crate::protocol::constants::*;
use crate::protocol::fragment::Assembled;
use crate::protocol::message::EventKind;
use crate::session::LlsyncSession;
use crate::transport::BleTransport;

/// Parsed bind reply.
#[derive(Debug, Clone)]
pub struct BindReply {
    /// Device signature, lowercase hex.
    pub signature: String,
    /// Challenge timestamp plus the fixed device-side skew.
    pub device_timestamp: u32,
    /// Challenge nonce, echoed to the backend as the connection id.
    pub nonce: u32,
    /// The device's assigned name.
    pub device_name: String,
}

/// Negotiated device info.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub version: u8,
    pub mtu: usize,
    pub needs_mtu_set: bool,
    pub ota_version: Option<String>,
}

impl<T: BleTransport, B: BackendApi, O: LlsyncObserver> LlsyncSession<T, B, O> {
    /// Bind this device: time-sync challenge, device signature, backend
    /// registration, PSK provisioning. Returns the logical device id.
    ///
    /// With `user_check` the device requires its owner to confirm on the
    /// device itself; see [`request_bind`](Self::request_bind) for the
    /// window semantics.
    pub fn bind_device(&mut self, user_check: bool) -> Result<String, ProtocolError> {
        let reply = self.request_bind(user_check)?;
        info!(device_name = %reply.device_name, "device answered bind challenge");
        self.identity_mut().device_name = reply.device_name.clone();

        let request = BindRequest {
            device_id: self.identity().device_id(),
            signature: reply.signature.clone(),
            device_timestamp: reply.device_timestamp,
            conn_id: reply.nonce.to_string(),
        };
        if let Err(e) = self.backend().register_binding(&request) {
            // The device must not be left believing it is bound.
            let err = ProtocolError::Backend(e);
            self.report_bind_error(err.code().as_str());
            self.emit(LlsyncEvent::Failure { code: err.code() });
            return Err(err);
        }

        self.report_bind_success()?;
        Ok(self.identity().device_id())
    }

    /// Write the time-sync challenge and wait for the signed reply.
    pub fn request_bind(&mut self, user_check: bool) -> Result<BindReply, ProtocolError> {
        self.set_phase(LinkPhase::Binding);

        let timestamp = self.unix_timestamp();
        let nonce = crypto::gen_nonce();
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&nonce.to_be_bytes());
        payload.extend_from_slice(&timestamp.to_be_bytes());
        let frames = self.info_frames(INFO_TIME_SYNC, &payload)?;

        if !user_check {
            let reply = self.write_then_wait(
                crate::transport::WriteTarget::DeviceInfo,
                &frames,
                EventKind::BindReply,
                Some(Duration::from_millis(self.config().wait_bind_reply_ms)),
                ErrorCode::WaitBindReplyTimeout,
            )?;
            return parse_bind_reply(&reply, timestamp, nonce, false);
        }

        self.write_info(&frames)?;

        // The device may announce how long its owner has to confirm;
        // older firmware never does, so a default window kicks in after
        // the announcement wait expires.
        let reply_wait = self.config().wait_user_check_window_reply_ms;
        let default_window = self.config().default_user_check_window_ms;
        let window_ms = self.wait_with_fallback(
            EventKind::UserCheckWindow,
            Some(Duration::from_millis(reply_wait)),
            ErrorCode::WaitUserCheckTimeout,
            Some(move || default_window.saturating_sub(reply_wait)),
            |assembled| {
                if assembled.payload.len() < 2 {
                    return Err(ProtocolError::InvalidReply(ErrorCode::ConnectReplyInvalid));
                }
                let seconds = u16::from_be_bytes([assembled.payload[0], assembled.payload[1]]);
                Ok(u64::from(seconds) * 1000)
            },
        )?;
        debug!(window_ms, "waiting for user confirmation");

        match self.wait_for_event(
            EventKind::BindReply,
            Some(Duration::from_millis(window_ms)),
            ErrorCode::WaitUserCheckTimeout,
        ) {
            Ok(reply) => parse_bind_reply(&reply, timestamp, nonce, true),
            Err(ProtocolError::Timeout(code)) => {
                self.cancel_user_check(false);
                Err(ProtocolError::Timeout(code))
            }
            Err(e) => Err(e),
        }
    }

    /// Tell the device the confirmation wait ended. `user_cancelled`
    /// distinguishes an explicit cancel from a timeout.
    pub fn cancel_user_check(&mut self, user_cancelled: bool) {
        let reason = if user_cancelled {
            USER_CHECK_REASON_CANCEL
        } else {
            USER_CHECK_REASON_TIMEOUT
        };
        let frames = match self.info_frames(INFO_USER_CHECK_CANCEL, &[reason]) {
            Ok(frames) => frames,
            Err(_) => return,
        };
        if let Err(e) = self.write_info(&frames) {
            warn!(error = %e, "could not deliver user-check cancellation");
        }
    }

    fn report_bind_error(&mut self, code: &str) {
        let frames = match self.info_frames(INFO_BIND_FAIL, code.as_bytes()) {
            Ok(frames) => frames,
            Err(_) => return,
        };
        if let Err(e) = self.write_info(&frames) {
            warn!(error = %e, "could not deliver bind failure code");
        }
    }

    /// Provision a fresh PSK to the device and the backend.
    fn report_bind_success(&mut self) -> Result<(), ProtocolError> {
        let psk = crypto::gen_psk();
        let mut payload = hex::decode(&psk).map_err(AuthError::BadPskHex)?;
        payload.extend(
            hex::decode(&self.identity().user_identity).map_err(AuthError::BadIdentityHex)?,
        );

        let frames = self.info_frames(INFO_BIND_SUCCESS, &payload)?;
        self.write_info(&frames)?;

        let device_id = self.identity().device_id();
        self.backend().store_psk(&device_id, &psk)?;
        self.state_mut().psk = Some(psk);
        self.state_mut().authorized = true;
        self.set_phase(LinkPhase::Authorized);
        Ok(())
    }

    /// Authenticate an existing binding over a fresh connection, then
    /// pull device info and negotiate the MTU.
    pub fn authenticate_connection(&mut self) -> Result<DeviceInfo, ProtocolError> {
        if self.identity().device_name.is_empty() {
            return Err(ProtocolError::Failed(ErrorCode::DeviceNameEmpty));
        }
        self.set_phase(LinkPhase::Authenticating);

        match self.try_authenticate() {
            Ok(info) => Ok(info),
            Err(e) => {
                // Best effort: the device shows a "connect failed" state
                // instead of waiting for a session that will never come.
                let _ = self.write_info(&Self::signal_frame(INFO_CONNECT_FAIL));
                self.emit(LlsyncEvent::Failure { code: e.code() });
                Err(e)
            }
        }
    }

    fn try_authenticate(&mut self) -> Result<DeviceInfo, ProtocolError> {
        let device_id = self.identity().device_id();
        let psk = load_psk(self.backend(), &device_id)?;

        let timestamp = self.unix_timestamp();
        let client_sign = crypto::hmac_signature(&timestamp.to_string(), &psk)?;
        let mut payload = Vec::with_capacity(4 + SIGNATURE_LEN);
        payload.extend_from_slice(&timestamp.to_be_bytes());
        payload.extend(hex::decode(&client_sign).map_err(AuthError::BadPskHex)?);

        let frames = self.info_frames(INFO_CONNECT_AUTH, &payload)?;
        let reply = self.write_then_wait(
            crate::transport::WriteTarget::DeviceInfo,
            &frames,
            EventKind::ConnectReply,
            Some(Duration::from_millis(self.config().wait_connect_reply_ms)),
            ErrorCode::WaitConnectReplyTimeout,
        )?;
        let device_sign = extract_signature(&reply, ErrorCode::ConnectReplyInvalid)?;

        let challenge = format!(
            "{}{}{}",
            timestamp + AUTH_TIMESTAMP_SKEW,
            self.identity().product_id,
            self.identity().device_name
        );
        let expected = crypto::hmac_signature(&challenge, &psk)?;
        if !crypto::signatures_match(&device_sign, &expected) {
            return Err(ProtocolError::SignatureMismatch(
                ErrorCode::ConnectSignMismatch,
            ));
        }
        self.state_mut().psk = Some(psk);

        let info = self.get_device_info()?;
        self.state_mut().ble_version = info.version;
        if info.mtu > 0 {
            self.state_mut().mtu = info.mtu;
        }
        if info.needs_mtu_set {
            self.negotiate_mtu(info.mtu);
        }

        self.state_mut().ota_version = info.ota_version.clone();
        if let Some(version) = &info.ota_version {
            if let Err(e) = self.backend().report_ota_version(&device_id, version) {
                warn!(error = %e, "could not report the firmware version");
            }
        }

        self.state_mut().authorized = true;
        self.set_phase(LinkPhase::Authorized);
        self.emit(LlsyncEvent::Authorized {
            version: info.version,
            mtu: self.state().mtu,
            ota_version: info.ota_version.clone(),
        });
        Ok(info)
    }

    /// Request the device-info block (protocol version, MTU, firmware
    /// version).
    pub fn get_device_info(&mut self) -> Result<DeviceInfo, ProtocolError> {
        let reply = self.write_then_wait(
            crate::transport::WriteTarget::DeviceInfo,
            &Self::signal_frame(INFO_CONNECT_SUCCESS),
            EventKind::DeviceInfo,
            Some(Duration::from_millis(self.config().wait_device_info_ms)),
            ErrorCode::WaitDeviceInfoTimeout,
        )?;
        parse_device_info(&reply)
    }

    /// Apply the device-requested MTU and report the result back. A
    /// platform that forbids explicit negotiation skips silently.
    fn negotiate_mtu(&mut self, mtu: usize) {
        if !self.transport().supports_mtu_negotiation() {
            debug!(mtu, "platform forbids explicit MTU negotiation, skipping");
            return;
        }
        let body = match self.transport().set_mtu(mtu) {
            Ok(()) => {
                info!(mtu, "MTU applied");
                MTU_RESULT_SUCCESS
            }
            Err(e) => {
                warn!(mtu, error = %e, "MTU negotiation failed");
                MTU_RESULT_FAIL
            }
        };
        let frames = match self.info_frames(INFO_MTU_RESULT, &body.to_be_bytes()) {
            Ok(frames) => frames,
            Err(_) => return,
        };
        if let Err(e) = self.write_info(&frames) {
            warn!(error = %e, "could not deliver the MTU result");
        }
    }

    /// Unbind: prove possession of the PSK to the device, verify its
    /// counter-signature, and only then remove the backend record.
    pub fn unbind_device(&mut self) -> Result<(), ProtocolError> {
        if self.identity().device_name.is_empty() {
            return Err(ProtocolError::Failed(ErrorCode::DeviceNameEmpty));
        }
        self.set_phase(LinkPhase::Unbinding);

        match self.try_unbind() {
            Ok(()) => {
                let _ = self.write_info(&Self::signal_frame(INFO_UNBIND_SUCCESS));
                self.state_mut().authorized = false;
                self.disconnect();
                Ok(())
            }
            Err(e) => {
                let _ = self.write_info(&Self::signal_frame(INFO_UNBIND_FAIL));
                self.emit(LlsyncEvent::Failure { code: e.code() });
                Err(e)
            }
        }
    }

    fn try_unbind(&mut self) -> Result<(), ProtocolError> {
        let device_id = self.identity().device_id();
        let psk = load_psk(self.backend(), &device_id)?;

        let sign = crypto::hmac_signature(UNBIND_REQUEST, &psk)?;
        let payload = hex::decode(&sign).map_err(AuthError::BadPskHex)?;
        let frames = self.info_frames(INFO_UNBIND_AUTH, &payload)?;

        let reply = self.write_then_wait(
            crate::transport::WriteTarget::DeviceInfo,
            &frames,
            EventKind::UnbindReply,
            Some(Duration::from_millis(self.config().wait_unbind_reply_ms)),
            ErrorCode::WaitUnbindReplyTimeout,
        )?;
        let device_sign = extract_signature(&reply, ErrorCode::UnbindReplyInvalid)?;

        let expected = crypto::hmac_signature(UNBIND_RESPONSE, &psk)?;
        if !crypto::signatures_match(&device_sign, &expected) {
            // Without device-side proof the backend record must stay.
            return Err(ProtocolError::SignatureMismatch(
                ErrorCode::UnbindSignMismatch,
            ));
        }

        self.backend().remove_binding(&device_id)?;
        Ok(())
    }
}

fn load_psk<B: BackendApi>(backend: &B, device_id: &str) -> Result<String, ProtocolError> {
    match backend.load_psk(device_id) {
        Ok(psk) => Ok(psk),
        Err(BackendError::PskNotFound { .. }) => {
            Err(ProtocolError::Failed(ErrorCode::PskNotFound))
        }
        Err(e) => Err(ProtocolError::Backend(e)),
    }
}

fn extract_signature(reply: &Assembled, code: ErrorCode) -> Result<String, ProtocolError> {
    let sign = reply
        .payload
        .get(..SIGNATURE_LEN)
        .ok_or(ProtocolError::InvalidReply(code))?;
    Ok(hex::encode(sign))
}

fn parse_bind_reply(
    reply: &Assembled,
    timestamp: u32,
    nonce: u32,
    user_check: bool,
) -> Result<BindReply, ProtocolError> {
    if user_check && reply.flag {
        return Err(ProtocolError::Failed(ErrorCode::UserCheckRejected));
    }
    let signature = extract_signature(reply, ErrorCode::ConnectReplyInvalid)?;
    let device_name = String::from_utf8_lossy(&reply.payload[SIGNATURE_LEN..]).into_owned();
    Ok(BindReply {
        signature,
        device_timestamp: timestamp + AUTH_TIMESTAMP_SKEW,
        nonce,
        device_name,
    })
}

fn parse_device_info(reply: &Assembled) -> Result<DeviceInfo, ProtocolError> {
    let payload = &reply.payload;
    if payload.len() < 4 {
        return Err(ProtocolError::InvalidReply(ErrorCode::DeviceInfoInvalid));
    }
    let version = payload[0];
    let mtu_field = u16::from_be_bytes([payload[1], payload[2]]);
    let needs_mtu_set = mtu_field & 0x8000 != 0;
    let mtu = (mtu_field & 0x1FFF) as usize;

    let ver_len = payload[3] as usize;
    let ota_version = if ver_len == 0 {
        None
    } else {
        let raw = payload
            .get(4..4 + ver_len)
            .ok_or(ProtocolError::InvalidReply(ErrorCode::DeviceInfoInvalid))?;
        Some(
            String::from_utf8(raw.to_vec())
                .map_err(|_| ProtocolError::InvalidReply(ErrorCode::DeviceInfoInvalid))?,
        )
    };

    Ok(DeviceInfo {
        version,
        mtu,
        needs_mtu_set,
        ota_version,
    })
}
