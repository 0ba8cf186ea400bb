//! Resumable firmware-update engine.
//!
//! One update per session. The driver walks the phases in order —
//! metadata check, download, request negotiation, chunked send with
//! per-cycle acknowledgement, integrity confirmation, reboot-and-verify
//! — and applies retry and escalation policy in one place. Cancellation
//! is cooperative: [`OtaCancelHandle::cancel`] is observed at the next
//! await point.

mod chunks;

pub use chunks::{FirmwareFile, OtaProgress, UpdateOffer, integrity_failure_reason, refusal_reason};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::BackendApi;
use crate::error::{ErrorCode, ProtocolError};
use crate::events::{LlsyncEvent, LlsyncObserver, OtaPhase};
use crate::protocol::constants::{OTA_UPDATE_DATA_END, OTA_UPDATE_REQUEST};
use crate::protocol::fragment::fragment;
use crate::protocol::message::EventKind;
use crate::session::LlsyncSession;
use crate::transport::{BleTransport, WriteTarget};

/// Terminal failure of an update, carrying its stable code.
#[derive(Error, Debug)]
#[error("{code}: {detail}")]
pub struct OtaError {
    pub code: ErrorCode,
    pub detail: String,
}

/// Successful update summary.
#[derive(Debug, Clone)]
pub struct OtaReport {
    pub target_version: String,
    pub file_size: usize,
}

/// Cooperative cancellation handle for an in-flight update. Clonable
/// into another thread; the engine observes it at every await point.
#[derive(Clone)]
pub struct OtaCancelHandle(Arc<AtomicBool>);

impl OtaCancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl<T: BleTransport, B: BackendApi, O: LlsyncObserver> LlsyncSession<T, B, O> {
    /// Handle that cancels the currently running update.
    pub fn ota_cancel_handle(&self) -> OtaCancelHandle {
        OtaCancelHandle(self.cancel_ota.clone())
    }

    /// Run a firmware update to completion. Fails immediately when one
    /// is already in progress. All failures carry an OTA-classified
    /// code; anything the device reports without a known code collapses
    /// to "module does not support".
    pub fn start_ota(&mut self) -> Result<OtaReport, OtaError> {
        if self.ota_in_progress {
            return Err(OtaError {
                code: ErrorCode::OtaInProgress,
                detail: ErrorCode::OtaInProgress.message().to_string(),
            });
        }
        self.ota_in_progress = true;
        self.cancel_ota.store(false, Ordering::SeqCst);

        let mut phase = OtaPhase::Idle;
        let result = self.run_ota(&mut phase);
        self.ota_in_progress = false;

        match result {
            Ok(report) => {
                self.set_ota_phase(&mut phase, OtaPhase::Success);
                Ok(report)
            }
            Err(e) => {
                self.set_ota_phase(&mut phase, OtaPhase::Failed);
                let code = e.code().classify_for_ota();
                self.emit(LlsyncEvent::Failure { code });
                Err(OtaError {
                    code,
                    detail: e.to_string(),
                })
            }
        }
    }

    fn set_ota_phase(&self, current: &mut OtaPhase, to: OtaPhase) {
        if *current != to {
            self.emit(LlsyncEvent::OtaPhaseChanged { from: *current, to });
            *current = to;
        }
    }

    fn check_cancel(&self) -> Result<(), ProtocolError> {
        if self.cancel_ota.load(Ordering::SeqCst) {
            Err(ProtocolError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn run_ota(&mut self, phase: &mut OtaPhase) -> Result<OtaReport, ProtocolError> {
        self.set_ota_phase(phase, OtaPhase::CheckUpdateInfo);
        let device_id = self.identity().device_id();
        let current = self
            .state()
            .ota_version
            .clone()
            .ok_or(ProtocolError::Failed(ErrorCode::ModuleNotSupported))?;
        let info = self.backend().ota_info(&device_id).map_err(|e| {
            warn!(error = %e, "OTA metadata lookup failed");
            ProtocolError::Failed(ErrorCode::GetOtaInfoFail)
        })?;
        if info.target_version == current {
            return Err(ProtocolError::Failed(ErrorCode::FirmwareUpToDate));
        }
        info!(current = %current, target = %info.target_version, "firmware update available");

        self.set_ota_phase(phase, OtaPhase::Downloading);
        let bytes = self
            .backend()
            .download_firmware(&info.firmware_url, &mut |received, total| {
                self.emit(LlsyncEvent::DownloadProgress { received, total });
            })?;
        let file = FirmwareFile::new(bytes);
        if file.is_empty() {
            return Err(ProtocolError::Failed(ErrorCode::GetOtaInfoFail));
        }
        debug!(size = file.len(), crc = %format!("{:08X}", file.crc()), "firmware downloaded");
        self.check_cancel()?;

        self.set_ota_phase(phase, OtaPhase::RequestingUpdate);
        let request = chunks::build_update_request(&file, &info.target_version)?;
        let frames = fragment(&[OTA_UPDATE_REQUEST], &[request], self.state().mtu)?;
        let gap = self.config().write_gap();
        self.write_frames(WriteTarget::Ota, &frames, gap)?;
        let reply = self.wait_cancellable(
            EventKind::UpdateReply,
            Some(Duration::from_millis(self.config().wait_update_reply_ms)),
            ErrorCode::WaitUpdateReplyTimeout,
        )?;
        let offer = chunks::parse_update_reply(
            &reply.payload,
            self.state().mtu,
            self.config().ota_cycle_retry_limit,
            Duration::from_millis(self.config().ota_send_gap_ms),
        )?;
        let mut progress = offer.progress;
        if !offer.resume_supported && progress.received_size != 0 {
            debug!("device cannot resume, restarting from offset zero");
            progress.received_size = 0;
        }
        info!(
            packages = progress.max_packages_per_cycle,
            package_bytes = progress.max_bytes_per_package,
            resume_offset = progress.received_size,
            "device accepted the update"
        );

        self.set_ota_phase(phase, OtaPhase::SendingData);
        while progress.received_size < file.len() {
            self.check_cancel()?;
            let cycle = chunks::cycle_chunks(file.bytes(), &progress);
            let received = self.send_cycle(&cycle, &progress)?;
            progress.received_size = received;
            self.emit(LlsyncEvent::OtaProgress {
                received,
                total: file.len(),
            });
        }

        self.set_ota_phase(phase, OtaPhase::ConfirmingCompletion);
        let gap = self.config().write_gap();
        self.write_frames(WriteTarget::Ota, &[vec![OTA_UPDATE_DATA_END]], gap)?;
        let verdict = self.wait_cancellable(
            EventKind::UpdateCheckReply,
            Some(progress.retry_gap * progress.retry_limit),
            ErrorCode::UpdateDataReplyTimeout,
        )?;
        chunks::parse_check_reply(&verdict.payload)?;
        info!("device verified the firmware image");

        self.set_ota_phase(phase, OtaPhase::WaitingReboot);
        self.wait_reboot_and_verify(&info.target_version, &progress)?;

        Ok(OtaReport {
            target_version: info.target_version,
            file_size: file.len(),
        })
    }

    /// Send one cycle of packets and reconcile the device's cumulative
    /// acknowledgement. A short acknowledgement resends from the acked
    /// sequence; the retry ceiling turns persistent mismatch into a
    /// permanent failure.
    fn send_cycle(&mut self, cycle: &[&[u8]], progress: &OtaProgress) -> Result<usize, ProtocolError> {
        let ack_wait = progress.retry_gap * progress.retry_limit;
        let mut seq = 0usize;
        let mut retries = 0u32;

        loop {
            self.check_cancel()?;
            let frames = chunks::package_frames(cycle, seq);
            self.write_cycle_frames(&frames, progress.send_gap)?;

            let ack = self.wait_cancellable(
                EventKind::UpdateDataReply,
                Some(ack_wait),
                ErrorCode::UpdateDataReplyTimeout,
            )?;
            let (acked, received) = chunks::parse_data_ack(&ack.payload)?;
            if acked == cycle.len() {
                return Ok(received);
            }

            retries += 1;
            if retries > progress.retry_limit {
                warn!(retries, "acknowledgement mismatches exhausted the retry budget");
                return Err(ProtocolError::Timeout(ErrorCode::UpdateDataReplyTimeout));
            }
            warn!(
                acked,
                sent = cycle.len(),
                retries,
                "short acknowledgement, resending from the acked sequence"
            );
            seq = acked;
        }
    }

    /// Write a cycle's packets, retrying transient write failures up to
    /// the per-cycle budget. A broken link is not retried here.
    fn write_cycle_frames(&mut self, frames: &[Vec<u8>], gap: Duration) -> Result<(), ProtocolError> {
        let budget = self.config().ota_write_retry_per_cycle;
        let mut attempts = 0u32;
        loop {
            match self.write_frames(WriteTarget::Ota, frames, gap) {
                Ok(()) => return Ok(()),
                Err(ProtocolError::ConnectionBroken) => return Err(ProtocolError::ConnectionBroken),
                Err(e) => {
                    attempts += 1;
                    if attempts >= budget {
                        return Err(e);
                    }
                    warn!(attempts, error = %e, "cycle write failed, retrying");
                }
            }
        }
    }

    /// Expect the device to disconnect and reboot, then reconnect,
    /// re-authenticate and compare the reported firmware version with
    /// the target. A wall-clock ceiling covers the whole phase in case
    /// the device never drops the link.
    fn wait_reboot_and_verify(
        &mut self,
        target: &str,
        progress: &OtaProgress,
    ) -> Result<(), ProtocolError> {
        let ceiling = progress.reboot_wait * self.config().reboot_wait_scale;
        let deadline = Instant::now() + ceiling;

        loop {
            self.check_cancel()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProtocolError::Timeout(ErrorCode::WaitModuleRebootTimeout));
            }
            match self.pump_once(remaining.min(self.config().poll_slice())) {
                Ok(Some((kind, _))) => debug!(kind = %kind, "stray message while awaiting reboot"),
                Ok(None) => {}
                Err(ProtocolError::ConnectionBroken) => break,
                Err(e) => return Err(e),
            }
        }
        info!("device disconnected to reboot, reconnecting");

        let attempts = self.config().reconnect_attempt_limit;
        let attempt_gap = Duration::from_millis(self.config().reconnect_gap_ms);
        for attempt in 1..=attempts {
            self.check_cancel()?;
            if Instant::now() >= deadline {
                return Err(ProtocolError::Timeout(ErrorCode::WaitModuleRebootTimeout));
            }
            match self.reconnect_once() {
                Ok(()) => {
                    let version = self.state().ota_version.clone();
                    if version.as_deref() == Some(target) {
                        info!(version = target, "device rebooted into the target firmware");
                        return Ok(());
                    }
                    warn!(?version, target, "device rebooted into an unexpected version");
                    return Err(ProtocolError::Failed(ErrorCode::ModuleUpdateFail));
                }
                Err(e) => warn!(attempt, error = %e, "reconnect attempt failed"),
            }
            thread::sleep(attempt_gap);
        }
        Err(ProtocolError::Failed(ErrorCode::ModuleUpdateConnectTimeout))
    }

    fn reconnect_once(&mut self) -> Result<(), ProtocolError> {
        self.connect()?;
        self.authenticate_connection()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OtaInfo;
    use crate::protocol::constants::*;
    use crate::session::{TestSession, test_session};

    // HMAC-SHA1("1060P1D1", 0xAABBCC) — see pairing tests.
    const CONNECT_SIGN: &str = "31bca3d61c32f01fb5c122ad83d9c33e4657ba3a";

    fn ota_session(file_len: usize, target: &str) -> TestSession {
        let mut session = test_session();
        session.clock_override = Some(1000);
        session.state_mut().ota_version = Some("1.0".into());
        session.state_mut().mtu = 64;
        session.backend().set_psk("P1/D1", "aabbcc");
        let firmware: Vec<u8> = (0..file_len).map(|b| b as u8).collect();
        session.backend().set_ota(
            OtaInfo {
                target_version: target.into(),
                firmware_url: "https://firmware.example/image.bin".into(),
            },
            firmware,
        );
        session
    }

    /// Device grants the update: 10 packages of 23 bytes per cycle,
    /// 1s retry gap, 1s reboot ceiling, resume offset `received`.
    fn queue_accept(session: &TestSession, received: u32) {
        let mut payload = vec![0x03, 10, 23, 1, 1];
        payload.extend_from_slice(&received.to_be_bytes());
        payload.push(0);
        session.transport().queue_message(MSG_UPDATE_REPLY, &payload);
    }

    fn queue_ack(session: &TestSession, seq: u8, total: u32) {
        let mut payload = vec![seq];
        payload.extend_from_slice(&total.to_be_bytes());
        session
            .transport()
            .queue_message(MSG_UPDATE_DATA_REPLY, &payload);
    }

    /// Integrity success, reboot disconnect, then the reconnect auth
    /// replies reporting `version`.
    fn queue_reboot_and_auth(session: &TestSession, version: &str) {
        session
            .transport()
            .queue_message(MSG_UPDATE_CHECK_REPLY, &[0x80]);
        session.transport().queue_disconnect();
        session
            .transport()
            .queue_message(MSG_CONNECT_REPLY, &hex::decode(CONNECT_SIGN).unwrap());
        let mut info = vec![0x02, 0x00, 0x14, version.len() as u8];
        info.extend_from_slice(version.as_bytes());
        session.transport().queue_message(MSG_DEVICE_INFO, &info);
    }

    #[test]
    fn test_full_update_happy_path() {
        let mut session = ota_session(1000, "2.0");
        queue_accept(&session, 0);
        for cycle in 1..=5u32 {
            queue_ack(&session, 10, cycle * 200);
        }
        queue_reboot_and_auth(&session, "2.0");
        // First reconnect attempt fails; the second succeeds.
        session.transport().fail_next_connects(1);

        let report = session.start_ota().unwrap();
        assert_eq!(report.target_version, "2.0");
        assert_eq!(report.file_size, 1000);
        assert!(!session.ota_in_progress);

        let writes = session.transport().writes_to(WriteTarget::Ota);
        // Request + 50 data packets + data end.
        assert_eq!(writes.len(), 52);
        assert_eq!(writes[0][0], OTA_UPDATE_REQUEST);
        assert_eq!(&writes[1][..3], &[OTA_UPDATE_DATA, 21, 0]);
        assert_eq!(writes[51], vec![OTA_UPDATE_DATA_END]);
    }

    #[test]
    fn test_resume_starts_at_received_offset() {
        let mut session = ota_session(1000, "2.0");
        queue_accept(&session, 200);
        for cycle in 1..=4u32 {
            queue_ack(&session, 10, 200 + cycle * 200);
        }
        queue_reboot_and_auth(&session, "2.0");

        session.start_ota().unwrap();

        let writes = session.transport().writes_to(WriteTarget::Ota);
        // Request + 40 data packets + data end.
        assert_eq!(writes.len(), 42);
        // The first chunk is file[200..220], not file[0..20].
        let expected: Vec<u8> = (200u16..220).map(|b| b as u8).collect();
        assert_eq!(&writes[1][3..], &expected[..]);
    }

    #[test]
    fn test_short_ack_resends_from_acked_sequence() {
        let mut session = ota_session(100, "2.0");
        queue_accept(&session, 0);
        // Device saw only 3 of 5 packets, then completes the cycle.
        queue_ack(&session, 3, 60);
        queue_ack(&session, 5, 100);
        queue_reboot_and_auth(&session, "2.0");

        session.start_ota().unwrap();

        let writes = session.transport().writes_to(WriteTarget::Ota);
        // Request + 5 + 2 resent + data end.
        assert_eq!(writes.len(), 9);
        // The resend starts at sequence 3.
        assert_eq!(writes[6][2], 3);
        assert_eq!(writes[7][2], 4);
    }

    #[test]
    fn test_ack_mismatch_exhausts_retry_ceiling() {
        let mut session = ota_session(100, "2.0");
        queue_accept(&session, 0);
        // Six consecutive empty acknowledgements: one more than the
        // retry ceiling of five.
        for _ in 0..6 {
            queue_ack(&session, 0, 0);
        }

        let err = session.start_ota().unwrap_err();
        assert_eq!(err.code, ErrorCode::UpdateDataReplyTimeout);
    }

    #[test]
    fn test_disconnect_during_send_fails_immediately() {
        let mut session = ota_session(100, "2.0");
        queue_accept(&session, 0);
        session.transport().queue_disconnect();

        let err = session.start_ota().unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionBroken);
    }

    #[test]
    fn test_cancel_observed_at_next_await_point() {
        let mut session = ota_session(1000, "2.0");
        // No update reply queued: the engine blocks on that wait.
        let handle = session.ota_cancel_handle();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            handle.cancel();
        });

        let err = session.start_ota().unwrap_err();
        assert_eq!(err.code, ErrorCode::UserCancelledOta);
        canceller.join().unwrap();
    }

    #[test]
    fn test_second_start_fails_while_in_progress() {
        let mut session = ota_session(100, "2.0");
        session.ota_in_progress = true;
        let err = session.start_ota().unwrap_err();
        assert_eq!(err.code, ErrorCode::OtaInProgress);
    }

    #[test]
    fn test_already_up_to_date() {
        let mut session = ota_session(100, "1.0");
        let err = session.start_ota().unwrap_err();
        assert_eq!(err.code, ErrorCode::FirmwareUpToDate);
    }

    #[test]
    fn test_missing_device_version_means_unsupported() {
        let mut session = ota_session(100, "2.0");
        session.state_mut().ota_version = None;
        let err = session.start_ota().unwrap_err();
        assert_eq!(err.code, ErrorCode::ModuleNotSupported);
    }

    #[test]
    fn test_device_refusal() {
        let mut session = ota_session(100, "2.0");
        session
            .transport()
            .queue_message(MSG_UPDATE_REPLY, &[0x00, 0x02]);
        let err = session.start_ota().unwrap_err();
        assert_eq!(err.code, ErrorCode::ModuleNotAllowed);
    }

    #[test]
    fn test_integrity_failure_is_terminal() {
        let mut session = ota_session(100, "2.0");
        queue_accept(&session, 0);
        queue_ack(&session, 5, 100);
        session
            .transport()
            .queue_message(MSG_UPDATE_CHECK_REPLY, &[0x01]);

        let err = session.start_ota().unwrap_err();
        assert_eq!(err.code, ErrorCode::UpdateCheckFileFail);
    }

    #[test]
    fn test_wrong_version_after_reboot_fails() {
        let mut session = ota_session(100, "2.0");
        queue_accept(&session, 0);
        queue_ack(&session, 5, 100);
        queue_reboot_and_auth(&session, "1.0");

        let err = session.start_ota().unwrap_err();
        assert_eq!(err.code, ErrorCode::ModuleUpdateFail);
    }

    #[test]
    fn test_unknown_failure_classified_as_unsupported() {
        let mut session = ota_session(100, "2.0");
        // A backend failure has no OTA-specific code; it must collapse
        // to MODULE_DONNOT_SUPPORT.
        session.backend().fail_next_download();

        let err = session.start_ota().unwrap_err();
        assert_eq!(err.code, ErrorCode::ModuleNotSupported);
    }
}
