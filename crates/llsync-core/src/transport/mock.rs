//! Mock BLE transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{BleTransport, TransportError, WriteTarget};

enum QueueItem {
    Frame(Vec<u8>),
    /// Scripted link drop, observed when the poll reaches it.
    Disconnect,
}

/// Scriptable in-memory transport for unit testing protocol logic.
///
/// Notify frames are pre-queued and handed out in order; writes are
/// captured per characteristic. Link state, write failures, connect
/// failures and mid-script disconnects can be injected.
pub struct MockTransport {
    notify_queue: Arc<Mutex<VecDeque<QueueItem>>>,
    write_log: Arc<Mutex<Vec<(WriteTarget, Vec<u8>)>>>,
    connected: Arc<Mutex<bool>>,
    fail_writes: Arc<Mutex<u32>>,
    fail_connects: Arc<Mutex<u32>>,
    mtu_calls: Arc<Mutex<Vec<usize>>>,
    mtu_supported: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            notify_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(true)),
            fail_writes: Arc::new(Mutex::new(0)),
            fail_connects: Arc::new(Mutex::new(0)),
            mtu_calls: Arc::new(Mutex::new(Vec::new())),
            mtu_supported: Arc::new(Mutex::new(true)),
        }
    }

    /// Queue a raw notify frame to be returned on a later poll.
    pub fn queue_notify(&self, frame: &[u8]) {
        self.notify_queue
            .lock()
            .unwrap()
            .push_back(QueueItem::Frame(frame.to_vec()));
    }

    /// Queue a link drop: once the poll reaches this point in the
    /// script the transport reports `Disconnected` until reconnected.
    pub fn queue_disconnect(&self) {
        self.notify_queue
            .lock()
            .unwrap()
            .push_back(QueueItem::Disconnect);
    }

    /// Queue a notify frame as `[msgType][lenField][payload]` with a
    /// plain (unsplit) length field.
    pub fn queue_message(&self, msg_type: u8, payload: &[u8]) {
        let mut frame = vec![msg_type];
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(payload);
        self.queue_notify(&frame);
    }

    /// All captured writes in order.
    pub fn writes(&self) -> Vec<(WriteTarget, Vec<u8>)> {
        self.write_log.lock().unwrap().clone()
    }

    /// Captured writes to one characteristic.
    pub fn writes_to(&self, target: WriteTarget) -> Vec<Vec<u8>> {
        self.write_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == target)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Drop the link; polls and writes fail with `Disconnected` until
    /// the next `connect`.
    pub fn break_link(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Fail the next `n` writes with `WriteFailed`.
    pub fn fail_next_writes(&self, n: u32) {
        *self.fail_writes.lock().unwrap() = n;
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: u32) {
        *self.fail_connects.lock().unwrap() = n;
    }

    /// MTU values requested through `set_mtu`.
    pub fn mtu_requests(&self) -> Vec<usize> {
        self.mtu_calls.lock().unwrap().clone()
    }

    /// Toggle platform MTU-negotiation support (false mimics iOS).
    pub fn set_mtu_supported(&self, supported: bool) {
        *self.mtu_supported.lock().unwrap() = supported;
    }

    /// Frames still queued and undelivered.
    pub fn pending_notifies(&self) -> usize {
        self.notify_queue.lock().unwrap().len()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl BleTransport for MockTransport {
    fn connect(&self) -> Result<(), TransportError> {
        let mut failures = self.fail_connects.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(TransportError::ConnectFailed("injected failure".into()));
        }
        *self.connected.lock().unwrap() = true;
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        *self.connected.lock().unwrap() = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn write(&self, target: WriteTarget, data: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let mut failures = self.fail_writes.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(TransportError::WriteFailed("injected failure".into()));
        }
        self.write_log.lock().unwrap().push((target, data.to_vec()));
        Ok(())
    }

    fn poll_notify(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        match self.notify_queue.lock().unwrap().pop_front() {
            Some(QueueItem::Frame(frame)) => Ok(frame),
            Some(QueueItem::Disconnect) => {
                *self.connected.lock().unwrap() = false;
                Err(TransportError::Disconnected)
            }
            None => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn set_mtu(&self, mtu: usize) -> Result<(), TransportError> {
        if !*self.mtu_supported.lock().unwrap() {
            return Err(TransportError::SetMtuUnsupported);
        }
        self.mtu_calls.lock().unwrap().push(mtu);
        Ok(())
    }

    fn supports_mtu_negotiation(&self) -> bool {
        *self.mtu_supported.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_queue_order() {
        let mock = MockTransport::new();
        mock.queue_notify(&[1]);
        mock.queue_notify(&[2]);

        assert_eq!(mock.poll_notify(Duration::from_millis(1)).unwrap(), vec![1]);
        assert_eq!(mock.poll_notify(Duration::from_millis(1)).unwrap(), vec![2]);
        assert!(matches!(
            mock.poll_notify(Duration::from_millis(1)),
            Err(TransportError::Timeout { .. })
        ));
    }

    #[test]
    fn test_write_capture_per_target() {
        let mock = MockTransport::new();
        mock.write(WriteTarget::DeviceInfo, &[1]).unwrap();
        mock.write(WriteTarget::Ota, &[2]).unwrap();

        assert_eq!(mock.writes_to(WriteTarget::DeviceInfo), vec![vec![1]]);
        assert_eq!(mock.writes_to(WriteTarget::Ota), vec![vec![2]]);
    }

    #[test]
    fn test_injected_write_failures_expire() {
        let mock = MockTransport::new();
        mock.fail_next_writes(1);
        assert!(mock.write(WriteTarget::DeviceData, &[0]).is_err());
        assert!(mock.write(WriteTarget::DeviceData, &[0]).is_ok());
    }

    #[test]
    fn test_link_state() {
        let mock = MockTransport::new();
        mock.break_link();
        assert!(matches!(
            mock.poll_notify(Duration::from_millis(1)),
            Err(TransportError::Disconnected)
        ));
        assert!(mock.write(WriteTarget::DeviceData, &[0]).is_err());

        mock.connect().unwrap();
        assert!(mock.is_connected());
    }

    #[test]
    fn test_queue_message_framing() {
        let mock = MockTransport::new();
        mock.queue_message(0x0B, &[0x00]);
        let frame = mock.poll_notify(Duration::from_millis(1)).unwrap();
        assert_eq!(frame, vec![0x0B, 0x00, 0x01, 0x00]);
    }
}
