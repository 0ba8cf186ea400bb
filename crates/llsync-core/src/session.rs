//! Device session: connection-scoped state, the notify pump and the
//! write-then-wait engine every exchange is built on.
//!
//! One session exists per connected peripheral and exclusively owns the
//! negotiated MTU and PSK. The model is a single logical consumer: one
//! in-flight request at a time, driven by blocking polls with bounded
//! slices. Because the consumer is the only reader, listener
//! registration cannot race the triggering write; replies that arrive
//! for anyone else are parked in the inbox and picked up by the next
//! wait or by [`service`](crate::control).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::backend::BackendApi;
use crate::config::LlsyncConfig;
use crate::error::{ErrorCode, ProtocolError};
use crate::events::{LinkPhase, LlsyncEvent, LlsyncObserver, TracingObserver};
use crate::protocol::constants::DEFAULT_MTU;
use crate::protocol::fragment::{Assembled, Reassembler, fragment};
use crate::protocol::message::{EventKind, classify};
use crate::schema::DataTemplate;
use crate::transport::{BleTransport, TransportError, WriteTarget};

/// Completed messages parked for a later consumer before the oldest is
/// dropped.
const INBOX_LIMIT: usize = 32;

/// Logical identity of the peer and the local user.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub product_id: String,
    /// Learned from the bind reply; must be supplied for reconnects.
    pub device_name: String,
    /// 8-byte local user identity, written to the device at bind time,
    /// as 16 hex characters.
    pub user_identity: String,
}

impl DeviceIdentity {
    pub fn device_id(&self) -> String {
        format!("{}/{}", self.product_id, self.device_name)
    }
}

/// Mutable per-connection state. MTU and PSK are written only by the
/// device-info and authentication steps; everything else reads.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub ble_version: u8,
    pub mtu: usize,
    pub authorized: bool,
    pub psk: Option<String>,
    pub ota_version: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            ble_version: 0,
            mtu: DEFAULT_MTU,
            authorized: false,
            psk: None,
            ota_version: None,
        }
    }
}

/// A session over one BLE connection to one peripheral.
pub struct LlsyncSession<T: BleTransport, B: BackendApi, O: LlsyncObserver> {
    transport: T,
    backend: B,
    observer: Arc<O>,
    config: LlsyncConfig,
    template: DataTemplate,
    identity: DeviceIdentity,
    state: SessionState,
    phase: LinkPhase,
    reassemblers: HashMap<EventKind, Reassembler>,
    inbox: VecDeque<(EventKind, Assembled)>,
    pub(crate) ota_in_progress: bool,
    pub(crate) cancel_ota: Arc<AtomicBool>,
    #[cfg(test)]
    pub(crate) clock_override: Option<u32>,
}

impl<T: BleTransport, B: BackendApi> LlsyncSession<T, B, TracingObserver> {
    /// Create a session with the default tracing observer.
    pub fn new(
        transport: T,
        backend: B,
        template: DataTemplate,
        identity: DeviceIdentity,
        config: LlsyncConfig,
    ) -> Self {
        Self::with_observer(
            transport,
            backend,
            template,
            identity,
            config,
            Arc::new(TracingObserver),
        )
    }
}

impl<T: BleTransport, B: BackendApi, O: LlsyncObserver> LlsyncSession<T, B, O> {
    /// Create a session with a custom observer.
    pub fn with_observer(
        transport: T,
        backend: B,
        template: DataTemplate,
        identity: DeviceIdentity,
        config: LlsyncConfig,
        observer: Arc<O>,
    ) -> Self {
        Self {
            transport,
            backend,
            observer,
            config,
            template,
            identity,
            state: SessionState::default(),
            phase: LinkPhase::Disconnected,
            reassemblers: HashMap::new(),
            inbox: VecDeque::new(),
            ota_in_progress: false,
            cancel_ota: Arc::new(AtomicBool::new(false)),
            #[cfg(test)]
            clock_override: None,
        }
    }

    /// Seconds since the Unix epoch, used for auth challenges.
    pub(crate) fn unix_timestamp(&self) -> u32 {
        #[cfg(test)]
        if let Some(fixed) = self.clock_override {
            return fixed;
        }
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    }

    pub fn template(&self) -> &DataTemplate {
        &self.template
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub(crate) fn identity_mut(&mut self) -> &mut DeviceIdentity {
        &mut self.identity
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    pub fn config(&self) -> &LlsyncConfig {
        &self.config
    }

    pub(crate) fn backend(&self) -> &B {
        &self.backend
    }

    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    pub(crate) fn emit(&self, event: LlsyncEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn set_phase(&mut self, to: LinkPhase) {
        if self.phase != to {
            self.emit(LlsyncEvent::PhaseChanged {
                from: self.phase,
                to,
            });
            self.phase = to;
        }
    }

    /// Establish the physical connection and start a fresh epoch.
    pub fn connect(&mut self) -> Result<(), ProtocolError> {
        self.transport.connect()?;
        self.reset_epoch();
        self.set_phase(LinkPhase::Connected);
        info!(device = %self.identity.device_id(), "connected");
        Ok(())
    }

    /// Tear the connection down.
    pub fn disconnect(&mut self) {
        let _ = self.transport.disconnect();
        self.handle_disconnect();
    }

    /// Forget all connection-scoped state. No partial frames or parked
    /// messages survive a reconnect.
    fn reset_epoch(&mut self) {
        self.reassemblers.clear();
        self.inbox.clear();
        self.state.authorized = false;
    }

    pub(crate) fn handle_disconnect(&mut self) {
        self.reset_epoch();
        self.set_phase(LinkPhase::Disconnected);
        self.emit(LlsyncEvent::Disconnected);
    }

    fn reassembler(&mut self, kind: EventKind) -> &mut Reassembler {
        self.reassemblers
            .entry(kind)
            .or_insert_with(|| Reassembler::with_skip(kind.continuation_skip()))
    }

    /// Poll the transport once. Malformed and unknown frames are logged
    /// and dropped; a link drop resets the epoch and fails the caller.
    pub(crate) fn pump_once(
        &mut self,
        slice: Duration,
    ) -> Result<Option<(EventKind, Assembled)>, ProtocolError> {
        let frame = match self.transport.poll_notify(slice) {
            Ok(frame) => frame,
            Err(TransportError::Timeout { .. }) => return Ok(None),
            Err(TransportError::Disconnected) => {
                warn!("link dropped while polling");
                self.handle_disconnect();
                return Err(ProtocolError::ConnectionBroken);
            }
            Err(e) => return Err(e.into()),
        };

        let (kind, body) = match classify(&frame) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "dropping unclassifiable notify frame");
                return Ok(None);
            }
        };
        let body = body.to_vec();

        match self.reassembler(kind).push(&body) {
            Ok(Some(assembled)) => Ok(Some((kind, assembled))),
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(kind = %kind, error = %e, "dropping malformed fragment");
                Ok(None)
            }
        }
    }

    /// Pop the oldest parked message, if any.
    pub(crate) fn next_unsolicited(&mut self) -> Option<(EventKind, Assembled)> {
        self.inbox.pop_front()
    }

    fn take_from_inbox(&mut self, kind: EventKind) -> Option<Assembled> {
        let position = self.inbox.iter().position(|(k, _)| *k == kind)?;
        self.inbox.remove(position).map(|(_, a)| a)
    }

    fn park(&mut self, kind: EventKind, assembled: Assembled) {
        debug!(kind = %kind, "parking message for a later consumer");
        self.inbox.push_back((kind, assembled));
        if self.inbox.len() > INBOX_LIMIT {
            if let Some((dropped, _)) = self.inbox.pop_front() {
                self.emit(LlsyncEvent::MessageDropped {
                    kind: dropped.as_str(),
                });
            }
        }
    }

    /// Wait for a message of `kind`.
    ///
    /// With `timeout == None` the wait never expires; otherwise the
    /// expiry fails with the exchange-specific `timeout_code`. The wait
    /// resolves exactly once: anything arriving after resolution lands
    /// in the inbox instead.
    pub(crate) fn wait_for_event(
        &mut self,
        kind: EventKind,
        timeout: Option<Duration>,
        timeout_code: ErrorCode,
    ) -> Result<Assembled, ProtocolError> {
        self.wait_core(kind, timeout, timeout_code, false)
    }

    /// Like [`wait_for_event`] but observing the OTA cancel flag at
    /// every poll slice.
    pub(crate) fn wait_cancellable(
        &mut self,
        kind: EventKind,
        timeout: Option<Duration>,
        timeout_code: ErrorCode,
    ) -> Result<Assembled, ProtocolError> {
        self.wait_core(kind, timeout, timeout_code, true)
    }

    fn wait_core(
        &mut self,
        kind: EventKind,
        timeout: Option<Duration>,
        timeout_code: ErrorCode,
        cancellable: bool,
    ) -> Result<Assembled, ProtocolError> {
        if let Some(assembled) = self.take_from_inbox(kind) {
            return Ok(assembled);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if cancellable && self.cancel_ota.load(Ordering::SeqCst) {
                return Err(ProtocolError::Cancelled);
            }

            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        debug!(kind = %kind, code = timeout_code.as_str(), "wait expired");
                        return Err(ProtocolError::Timeout(timeout_code));
                    }
                    remaining.min(self.config.poll_slice())
                }
                None => self.config.poll_slice(),
            };

            match self.pump_once(slice)? {
                Some((arrived, assembled)) if arrived == kind => return Ok(assembled),
                Some((arrived, assembled)) => self.park(arrived, assembled),
                None => {}
            }
        }
    }

    /// Wait with a timeout fallback: when the timer fires first the
    /// fallback's value is the (successful) result. The reply transform
    /// runs only for a real reply and its failure is the call's failure.
    pub(crate) fn wait_with_fallback<R>(
        &mut self,
        kind: EventKind,
        timeout: Option<Duration>,
        timeout_code: ErrorCode,
        fallback: Option<impl FnOnce() -> R>,
        transform: impl FnOnce(&Assembled) -> Result<R, ProtocolError>,
    ) -> Result<R, ProtocolError> {
        match self.wait_core(kind, timeout, timeout_code, false) {
            Ok(assembled) => transform(&assembled),
            Err(ProtocolError::Timeout(code)) => match fallback {
                Some(fallback) => {
                    debug!(code = code.as_str(), "wait expired, using fallback result");
                    Ok(fallback())
                }
                None => Err(ProtocolError::Timeout(code)),
            },
            Err(e) => Err(e),
        }
    }

    /// Write frames, then wait for the correlated reply.
    pub(crate) fn write_then_wait(
        &mut self,
        target: WriteTarget,
        frames: &[Vec<u8>],
        kind: EventKind,
        timeout: Option<Duration>,
        timeout_code: ErrorCode,
    ) -> Result<Assembled, ProtocolError> {
        self.write_frames(target, frames, self.config.write_gap())?;
        self.wait_core(kind, timeout, timeout_code, false)
    }

    /// Write a frame sequence with a gap between consecutive frames.
    pub(crate) fn write_frames(
        &mut self,
        target: WriteTarget,
        frames: &[Vec<u8>],
        gap: Duration,
    ) -> Result<(), ProtocolError> {
        for (i, frame) in frames.iter().enumerate() {
            if i != 0 && !gap.is_zero() {
                thread::sleep(gap);
            }
            match self.transport.write(target, frame) {
                Ok(()) => {}
                Err(TransportError::Disconnected) => {
                    self.handle_disconnect();
                    return Err(ProtocolError::ConnectionBroken);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Write to the device-info characteristic with the default gap.
    pub(crate) fn write_info(&mut self, frames: &[Vec<u8>]) -> Result<(), ProtocolError> {
        let gap = self.config.write_gap();
        self.write_frames(WriteTarget::DeviceInfo, frames, gap)
    }

    /// Write to the device-data characteristic with the default gap.
    pub(crate) fn write_data(&mut self, frames: &[Vec<u8>]) -> Result<(), ProtocolError> {
        let gap = self.config.write_gap();
        self.write_frames(WriteTarget::DeviceData, frames, gap)
    }

    /// Frames for a device-info channel message: prefix byte, length
    /// field, payload — fragmented to the current MTU.
    pub(crate) fn info_frames(&self, prefix: u8, payload: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
        Ok(fragment(&[prefix], &[payload.to_vec()], self.state.mtu)?)
    }

    /// A bare one-byte signal on the device-info channel.
    pub(crate) fn signal_frame(prefix: u8) -> Vec<Vec<u8>> {
        vec![vec![prefix]]
    }
}

/// Convenience alias used across the test suite.
#[cfg(test)]
pub(crate) type TestSession = LlsyncSession<
    crate::transport::MockTransport,
    crate::backend::MemoryBackend,
    crate::events::NullObserver,
>;

#[cfg(test)]
pub(crate) fn test_session() -> TestSession {
    use crate::backend::MemoryBackend;
    use crate::events::NullObserver;
    use crate::transport::MockTransport;

    let config = LlsyncConfig {
        wait_bind_reply_ms: 40,
        wait_connect_reply_ms: 40,
        wait_unbind_reply_ms: 40,
        wait_device_info_ms: 40,
        wait_control_reply_ms: 40,
        wait_update_reply_ms: 40,
        wait_user_check_window_reply_ms: 20,
        default_user_check_window_ms: 80,
        write_gap_ms: 0,
        ota_send_gap_ms: 0,
        ota_cycle_retry_limit: 5,
        ota_write_retry_per_cycle: 3,
        reboot_wait_scale: 10,
        reconnect_attempt_limit: 3,
        reconnect_gap_ms: 1,
        poll_slice_ms: 1,
    };
    let identity = DeviceIdentity {
        product_id: "P1".into(),
        device_name: "D1".into(),
        user_identity: "0102030405060708".into(),
    };
    let template = DataTemplate::from_json(
        r#"{
        "properties": [
            {"id": "power_switch", "define": {"type": "bool"}},
            {"id": "brightness", "define": {"type": "int"}}
        ],
        "events": [
            {"id": "overheat", "params": [{"id": "temperature", "define": {"type": "float"}}]}
        ],
        "actions": [
            {"id": "blink", "input": [{"id": "period", "define": {"type": "int"}}],
                          "output": [{"id": "done", "define": {"type": "bool"}}]}
        ]
    }"#,
    )
    .unwrap();

    LlsyncSession::with_observer(
        MockTransport::new(),
        MemoryBackend::new(),
        template,
        identity,
        config,
        Arc::new(NullObserver),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;

    #[test]
    fn test_wait_resolves_queued_event() {
        let mut session = test_session();
        session.transport().queue_message(MSG_CONTROL_REPLY, &[0x00]);

        let assembled = session
            .wait_for_event(
                EventKind::ControlReply,
                Some(Duration::from_millis(20)),
                ErrorCode::WaitControlPropertyReplyTimeout,
            )
            .unwrap();
        assert_eq!(assembled.payload, vec![0x00]);
    }

    #[test]
    fn test_wait_timeout_carries_exchange_code() {
        let mut session = test_session();
        let err = session
            .wait_for_event(
                EventKind::BindReply,
                Some(Duration::from_millis(5)),
                ErrorCode::WaitBindReplyTimeout,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Timeout(ErrorCode::WaitBindReplyTimeout)
        ));
    }

    #[test]
    fn test_unrelated_event_parked_then_consumed() {
        let mut session = test_session();
        // A property report arrives while we wait for a control reply.
        session.transport().queue_message(MSG_PROPERTY_REPORT, &[0x01, 0x01]);
        session.transport().queue_message(MSG_CONTROL_REPLY, &[0x00]);

        session
            .wait_for_event(
                EventKind::ControlReply,
                Some(Duration::from_millis(20)),
                ErrorCode::WaitControlPropertyReplyTimeout,
            )
            .unwrap();

        // The parked report satisfies a later wait without new frames.
        let report = session
            .wait_for_event(
                EventKind::PropertyReport,
                Some(Duration::from_millis(5)),
                ErrorCode::ControlReplyInvalid,
            )
            .unwrap();
        assert_eq!(report.payload, vec![0x01, 0x01]);
    }

    #[test]
    fn test_second_event_is_a_noop_for_resolved_wait() {
        let mut session = test_session();
        session.transport().queue_message(MSG_CONTROL_REPLY, &[0x00]);
        session.transport().queue_message(MSG_CONTROL_REPLY, &[0x01]);

        let first = session
            .wait_for_event(
                EventKind::ControlReply,
                Some(Duration::from_millis(20)),
                ErrorCode::WaitControlPropertyReplyTimeout,
            )
            .unwrap();
        assert_eq!(first.payload, vec![0x00]);

        // The duplicate resolves nothing; it is parked, not delivered twice.
        assert_eq!(session.transport().pending_notifies(), 1);
    }

    #[test]
    fn test_fallback_result_is_success() {
        let mut session = test_session();
        let window = session
            .wait_with_fallback(
                EventKind::UserCheckWindow,
                Some(Duration::from_millis(5)),
                ErrorCode::WaitUserCheckTimeout,
                Some(|| 60u64),
                |_| Ok(0u64),
            )
            .unwrap();
        assert_eq!(window, 60);
    }

    #[test]
    fn test_transform_failure_propagates() {
        let mut session = test_session();
        session.transport().queue_message(MSG_DEVICE_INFO, &[]);

        let err = session
            .wait_with_fallback(
                EventKind::DeviceInfo,
                Some(Duration::from_millis(20)),
                ErrorCode::WaitDeviceInfoTimeout,
                None::<fn() -> ()>,
                |_| Err(ProtocolError::InvalidReply(ErrorCode::DeviceInfoInvalid)),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidReply(ErrorCode::DeviceInfoInvalid)
        ));
    }

    #[test]
    fn test_disconnect_fails_wait_and_resets_epoch() {
        let mut session = test_session();
        // Park something and start a partial reassembly before the drop.
        session.transport().queue_message(MSG_CONTROL_REPLY, &[0x00]);
        session
            .wait_for_event(
                EventKind::ControlReply,
                Some(Duration::from_millis(20)),
                ErrorCode::WaitControlPropertyReplyTimeout,
            )
            .unwrap();
        session.transport().break_link();

        let err = session
            .wait_for_event(
                EventKind::BindReply,
                Some(Duration::from_millis(20)),
                ErrorCode::WaitBindReplyTimeout,
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionBroken));
        assert!(!session.state().authorized);
        assert!(session.inbox.is_empty());
        assert!(session.reassemblers.is_empty());
    }

    #[test]
    fn test_fragmented_reply_reassembles_across_polls() {
        let mut session = test_session();
        // Bind reply split in two: FIRST (3 bytes) + LAST (2 bytes).
        session
            .transport()
            .queue_notify(&[MSG_BIND_REPLY, 0x40, 0x03, 0xAA, 0xBB, 0xCC]);
        session
            .transport()
            .queue_notify(&[MSG_BIND_REPLY, 0xC0, 0x02, 0xDD, 0xEE]);

        let assembled = session
            .wait_for_event(
                EventKind::BindReply,
                Some(Duration::from_millis(20)),
                ErrorCode::WaitBindReplyTimeout,
            )
            .unwrap();
        assert_eq!(assembled.payload, vec![0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);
    }

    #[test]
    fn test_write_then_wait_surfaces_write_failure() {
        let mut session = test_session();
        session.transport().fail_next_writes(1);
        let err = session
            .write_then_wait(
                WriteTarget::DeviceData,
                &[vec![0x00]],
                EventKind::ControlReply,
                Some(Duration::from_millis(5)),
                ErrorCode::WaitControlPropertyReplyTimeout,
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BleWriteError);
    }
}
