//! Data-model traffic: property/action control issued by the caller and
//! the device-initiated reports served by [`service`](LlsyncSession::service).

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, warn};

use crate::backend::BackendApi;
use crate::error::{ErrorCode, ProtocolError};
use crate::events::{LlsyncEvent, LlsyncObserver};
use crate::protocol::constants::*;
use crate::protocol::fragment::{Assembled, fragment};
use crate::protocol::message::EventKind;
use crate::schema::SchemaError;
use crate::session::LlsyncSession;
use crate::tlv::{self, ActionOutput, EventPayload, ValueMap};
use crate::transport::{BleTransport, WriteTarget};

impl<T: BleTransport, B: BackendApi, O: LlsyncObserver> LlsyncSession<T, B, O> {
    /// Push desired property values to the device. A non-zero device
    /// status surfaces verbatim as [`ProtocolError::DeviceRejected`].
    pub fn control_property(&mut self, values: &ValueMap) -> Result<(), ProtocolError> {
        let encoded = tlv::encode_fields(&self.template().properties, values)?;
        let head = [data_head(DATA_OP_CONTROL_PROPERTY, 0)];
        let frames = fragment(&head, &encoded.chunks, self.state().mtu)?;

        let reply = self.write_then_wait(
            WriteTarget::DeviceData,
            &frames,
            EventKind::ControlReply,
            Some(Duration::from_millis(self.config().wait_control_reply_ms)),
            ErrorCode::WaitControlPropertyReplyTimeout,
        )?;
        check_status(&reply.payload, ErrorCode::ControlReplyInvalid)
    }

    /// Invoke a device action and return its decoded output. The output
    /// is also published to the backend.
    pub fn control_action(
        &mut self,
        action_id: &str,
        params: &ValueMap,
    ) -> Result<ActionOutput, ProtocolError> {
        let (index, encoded) = {
            let template = self.template();
            let index = template
                .action_index(action_id)
                .ok_or_else(|| SchemaError::UnknownId {
                    id: action_id.to_string(),
                })?;
            let action = template
                .action(index)
                .ok_or(SchemaError::UnknownId {
                    id: action_id.to_string(),
                })?;
            (index, tlv::encode_fields(&action.input, params)?)
        };

        let head = [data_head(DATA_OP_CONTROL_ACTION, index)];
        let frames = fragment(&head, &encoded.chunks, self.state().mtu)?;

        let reply = self.write_then_wait(
            WriteTarget::DeviceData,
            &frames,
            EventKind::ActionReply,
            Some(Duration::from_millis(self.config().wait_control_reply_ms)),
            ErrorCode::WaitControlActionReplyTimeout,
        )?;
        let (&code, output) = reply
            .payload
            .split_first()
            .ok_or(ProtocolError::InvalidReply(ErrorCode::ControlReplyInvalid))?;
        if code != 0 {
            return Err(ProtocolError::DeviceRejected { code });
        }

        let output = tlv::decode_action_output(self.template(), output)?;
        let device_id = self.identity().device_id();
        self.backend()
            .publish_action_output(&device_id, &output.action_id, &output.params)?;
        Ok(output)
    }

    /// Serve device-initiated traffic for up to one poll slice: property
    /// reports, status requests and event reports. Returns whether a
    /// message was handled.
    pub fn service(&mut self, wait: Duration) -> Result<bool, ProtocolError> {
        if let Some((kind, assembled)) = self.next_unsolicited() {
            self.dispatch(kind, assembled)?;
            return Ok(true);
        }
        match self.pump_once(wait)? {
            Some((kind, assembled)) => {
                self.dispatch(kind, assembled)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn dispatch(&mut self, kind: EventKind, assembled: Assembled) -> Result<(), ProtocolError> {
        match kind {
            EventKind::PropertyReport => self.on_property_report(&assembled),
            EventKind::GetStatus => self.on_get_status(),
            EventKind::EventReport => self.on_event_report(&assembled),
            other => {
                debug!(kind = %other, "no consumer for message");
                self.emit(LlsyncEvent::MessageDropped {
                    kind: other.as_str(),
                });
                Ok(())
            }
        }
    }

    /// Device pushed property values: decode, forward to the backend,
    /// acknowledge. A schema mismatch is acknowledged as a failure and
    /// then surfaced — it means template/firmware skew, not bad luck.
    fn on_property_report(&mut self, assembled: &Assembled) -> Result<(), ProtocolError> {
        let decoded = tlv::decode_fields(&self.template().properties, &assembled.payload);
        let values = match decoded {
            Ok(values) => values,
            Err(e) => {
                self.ack_property_report(0xFF)?;
                return Err(e.into());
            }
        };

        let device_id = self.identity().device_id();
        match self.backend().report_properties(&device_id, &values) {
            Ok(ack) => self.ack_property_report(ack.code as u8),
            Err(e) => {
                warn!(error = %e, "property report rejected by the backend");
                self.ack_property_report(0xFF)
            }
        }
    }

    fn ack_property_report(&mut self, code: u8) -> Result<(), ProtocolError> {
        self.write_data(&[vec![data_head(DATA_OP_REPORT_ACK, 0), code]])
    }

    /// Device asked for its desired state: reply with the backend's
    /// current values, or a failure status when the lookup fails.
    fn on_get_status(&mut self) -> Result<(), ProtocolError> {
        let device_id = self.identity().device_id();
        let values = match self.backend().desired_properties(&device_id) {
            Ok(values) => values,
            Err(e) => {
                warn!(error = %e, "desired-state lookup failed");
                return self.write_data(&[vec![data_head(DATA_OP_STATUS_REPLY, 0), 0xFF]]);
            }
        };

        let encoded = tlv::encode_fields(&self.template().properties, &values)?;
        let head = [data_head(DATA_OP_STATUS_REPLY, 0), 0x00];
        let frames = fragment(&head, &encoded.chunks, self.state().mtu)?;
        self.write_data(&frames)
    }

    /// One physical payload may carry several events back to back; each
    /// is `[eventIndex:1][len:2][params TLV]`. Drained by an explicit
    /// loop bounded by the declared lengths.
    fn on_event_report(&mut self, assembled: &Assembled) -> Result<(), ProtocolError> {
        let events = parse_event_segments(self, &assembled.payload)?;

        let device_id = self.identity().device_id();
        for event in events {
            let code = match self
                .backend()
                .report_event(&device_id, &event.event_id, &event.params)
            {
                Ok(()) => 0x00,
                Err(e) => {
                    warn!(event = %event.event_id, error = %e, "event rejected by the backend");
                    0xFF
                }
            };
            self.write_data(&[vec![data_head(DATA_OP_EVENT_ACK, event.index), code]])?;
        }
        Ok(())
    }
}

fn parse_event_segments<T: BleTransport, B: BackendApi, O: LlsyncObserver>(
    session: &LlsyncSession<T, B, O>,
    payload: &[u8],
) -> Result<Vec<EventPayload>, ProtocolError> {
    let mut events = Vec::new();
    let mut pos = 0usize;
    while pos < payload.len() {
        let header = payload
            .get(pos..pos + 3)
            .ok_or(ProtocolError::InvalidReply(ErrorCode::ControlReplyInvalid))?;
        let len = BigEndian::read_u16(&header[1..3]) as usize;
        let body = payload
            .get(pos + 3..pos + 3 + len)
            .ok_or(ProtocolError::InvalidReply(ErrorCode::ControlReplyInvalid))?;

        let mut segment = Vec::with_capacity(1 + len);
        segment.push(header[0]);
        segment.extend_from_slice(body);
        events.push(tlv::decode_event_report(session.template(), &segment)?);

        pos += 3 + len;
    }
    Ok(events)
}

fn check_status(payload: &[u8], empty_code: ErrorCode) -> Result<(), ProtocolError> {
    let &code = payload
        .first()
        .ok_or(ProtocolError::InvalidReply(empty_code))?;
    if code == 0 {
        Ok(())
    } else {
        Err(ProtocolError::DeviceRejected { code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_session;
    use crate::tlv::TlvValue;

    fn props(pairs: &[(&str, TlvValue)]) -> ValueMap {
        pairs
            .iter()
            .map(|(id, value)| (id.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn test_control_property_success() {
        let mut session = test_session();
        session.transport().queue_message(MSG_CONTROL_REPLY, &[0x00]);

        session
            .control_property(&props(&[
                ("power_switch", TlvValue::Bool(true)),
                ("brightness", TlvValue::Int(300)),
            ]))
            .unwrap();

        let writes = session.transport().writes_to(WriteTarget::DeviceData);
        assert_eq!(writes.len(), 1);
        // head, plain length 7, bool@0, int@1 — all in one frame.
        assert_eq!(
            writes[0],
            vec![0x00, 0x00, 0x07, 0x00, 0x01, 0x21, 0x00, 0x00, 0x01, 0x2C]
        );
    }

    #[test]
    fn test_control_property_device_rejection_surfaces_code() {
        let mut session = test_session();
        session.transport().queue_message(MSG_CONTROL_REPLY, &[0x05]);

        let err = session
            .control_property(&props(&[("power_switch", TlvValue::Bool(true))]))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DeviceRejected { code: 5 }));
    }

    #[test]
    fn test_control_property_fragments_at_small_mtu() {
        let mut session = test_session();
        session.state_mut().mtu = 8;
        session.transport().queue_message(MSG_CONTROL_REPLY, &[0x00]);

        session
            .control_property(&props(&[
                ("power_switch", TlvValue::Bool(true)),
                ("brightness", TlvValue::Int(300)),
            ]))
            .unwrap();

        let writes = session.transport().writes_to(WriteTarget::DeviceData);
        assert!(writes.len() > 1);
        for frame in &writes {
            assert!(frame.len() <= 8);
            assert_eq!(frame[0], 0x00);
        }
        // First frame FIRST-marked, last frame LAST-marked.
        assert_eq!(writes[0][1] >> 6, 1);
        assert_eq!(writes.last().unwrap()[1] >> 6, 3);
    }

    #[test]
    fn test_control_action_roundtrip() {
        let mut session = test_session();
        // code 0, action index 0, output: done=true.
        session
            .transport()
            .queue_message(MSG_ACTION_REPLY, &[0x00, 0x00, 0x00, 0x01]);

        let output = session
            .control_action("blink", &props(&[("period", TlvValue::Int(5))]))
            .unwrap();
        assert_eq!(output.action_id, "blink");
        assert_eq!(output.params.get("done"), Some(&TlvValue::Bool(true)));
        assert_eq!(
            session.backend().published_actions(),
            vec![("P1/D1".to_string(), "blink".to_string())]
        );

        let writes = session.transport().writes_to(WriteTarget::DeviceData);
        // Action head carries the action index in its suffix.
        assert_eq!(writes[0][0], 0x20);
    }

    #[test]
    fn test_control_action_unknown_id() {
        let mut session = test_session();
        let err = session
            .control_action("no_such_action", &ValueMap::new())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaMismatch);
    }

    #[test]
    fn test_service_property_report_acks_and_forwards() {
        let mut session = test_session();
        // power_switch = true.
        session
            .transport()
            .queue_message(MSG_PROPERTY_REPORT, &[0x00, 0x01]);

        assert!(session.service(Duration::from_millis(5)).unwrap());

        let reported = session.backend().reported_properties();
        assert_eq!(reported.len(), 1);
        assert_eq!(
            reported[0].1.get("power_switch"),
            Some(&TlvValue::Bool(true))
        );
        assert_eq!(
            session.transport().writes_to(WriteTarget::DeviceData),
            vec![vec![0x40, 0x00]]
        );
    }

    #[test]
    fn test_service_property_report_backend_failure_acks_failure() {
        let mut session = test_session();
        session.backend().fail_next_report();
        session
            .transport()
            .queue_message(MSG_PROPERTY_REPORT, &[0x00, 0x01]);

        session.service(Duration::from_millis(5)).unwrap();
        assert_eq!(
            session.transport().writes_to(WriteTarget::DeviceData),
            vec![vec![0x40, 0xFF]]
        );
    }

    #[test]
    fn test_service_property_report_schema_mismatch_is_fatal() {
        let mut session = test_session();
        // Index 31 is not declared.
        session
            .transport()
            .queue_message(MSG_PROPERTY_REPORT, &[0x1F, 0x01]);

        let err = session.service(Duration::from_millis(5)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaMismatch);
        // The device still got a failure ack first.
        assert_eq!(
            session.transport().writes_to(WriteTarget::DeviceData),
            vec![vec![0x40, 0xFF]]
        );
    }

    #[test]
    fn test_service_get_status_replies_with_desired_state() {
        let mut session = test_session();
        session
            .backend()
            .set_desired(props(&[("power_switch", TlvValue::Bool(false))]));
        session.transport().queue_message(MSG_GET_STATUS, &[]);

        session.service(Duration::from_millis(5)).unwrap();
        assert_eq!(
            session.transport().writes_to(WriteTarget::DeviceData),
            vec![vec![0x60, 0x00, 0x00, 0x02, 0x00, 0x00]]
        );
    }

    #[test]
    fn test_service_event_report_multi_event_drain() {
        let mut session = test_session();
        // Two overheat events back to back, 20.0 and 24.0 degrees.
        let mut payload = Vec::new();
        for raw in [[0x41u8, 0xA0, 0x00, 0x00], [0x41, 0xC0, 0x00, 0x00]] {
            payload.push(0x00); // event index
            payload.extend_from_slice(&5u16.to_be_bytes());
            payload.push(0x60); // float param head
            payload.extend_from_slice(&raw);
        }
        session.transport().queue_message(MSG_EVENT_REPORT, &payload);

        session.service(Duration::from_millis(5)).unwrap();
        assert_eq!(session.backend().reported_events().len(), 2);
        // One ack per event, both success.
        assert_eq!(
            session.transport().writes_to(WriteTarget::DeviceData),
            vec![vec![0x80, 0x00], vec![0x80, 0x00]]
        );
    }

    #[test]
    fn test_service_idle_returns_false() {
        let mut session = test_session();
        assert!(!session.service(Duration::from_millis(2)).unwrap());
    }
}
