//! Notify-frame classification.
//!
//! The first byte of every notify frame selects the logical event the
//! rest of the frame belongs to. The set is closed; anything else is
//! dropped by the pump with a warning.

use std::fmt;

use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("empty notify frame")]
    Empty,

    #[error("unknown notify message type 0x{0:02X}")]
    UnknownType(u8),
}

/// Logical event kinds carried over the notify characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BindReply,
    ConnectReply,
    UnbindReply,
    DeviceInfo,
    UserCheckWindow,
    PropertyReport,
    GetStatus,
    EventReport,
    ControlReply,
    ActionReply,
    UpdateReply,
    UpdateDataReply,
    UpdateCheckReply,
}

impl EventKind {
    pub fn from_byte(byte: u8) -> Result<Self, MessageError> {
        Ok(match byte {
            MSG_BIND_REPLY => EventKind::BindReply,
            MSG_CONNECT_REPLY => EventKind::ConnectReply,
            MSG_UNBIND_REPLY => EventKind::UnbindReply,
            MSG_DEVICE_INFO => EventKind::DeviceInfo,
            MSG_USER_CHECK_WINDOW => EventKind::UserCheckWindow,
            MSG_PROPERTY_REPORT => EventKind::PropertyReport,
            MSG_GET_STATUS => EventKind::GetStatus,
            MSG_EVENT_REPORT => EventKind::EventReport,
            MSG_CONTROL_REPLY => EventKind::ControlReply,
            MSG_ACTION_REPLY => EventKind::ActionReply,
            MSG_UPDATE_REPLY => EventKind::UpdateReply,
            MSG_UPDATE_DATA_REPLY => EventKind::UpdateDataReply,
            MSG_UPDATE_CHECK_REPLY => EventKind::UpdateCheckReply,
            other => return Err(MessageError::UnknownType(other)),
        })
    }

    /// Repeated sub-head bytes on continuation fragments of this kind.
    pub fn continuation_skip(self) -> usize {
        match self {
            EventKind::EventReport => 1,
            EventKind::ActionReply => 2,
            _ => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::BindReply => "bind_reply",
            EventKind::ConnectReply => "connect_reply",
            EventKind::UnbindReply => "unbind_reply",
            EventKind::DeviceInfo => "device_info",
            EventKind::UserCheckWindow => "user_check_window",
            EventKind::PropertyReport => "property_report",
            EventKind::GetStatus => "get_status",
            EventKind::EventReport => "event_report",
            EventKind::ControlReply => "control_reply",
            EventKind::ActionReply => "action_reply",
            EventKind::UpdateReply => "update_reply",
            EventKind::UpdateDataReply => "update_data_reply",
            EventKind::UpdateCheckReply => "update_check_reply",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split a raw notify frame into its event kind and body.
pub fn classify(frame: &[u8]) -> Result<(EventKind, &[u8]), MessageError> {
    let (&first, body) = frame.split_first().ok_or(MessageError::Empty)?;
    Ok((EventKind::from_byte(first)?, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_type() {
        let (kind, body) = classify(&[MSG_CONTROL_REPLY, 0x00, 0x01, 0x00]).unwrap();
        assert_eq!(kind, EventKind::ControlReply);
        assert_eq!(body, &[0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_classify_unknown_type() {
        assert!(matches!(
            classify(&[0x7F, 0x00]),
            Err(MessageError::UnknownType(0x7F))
        ));
        assert!(matches!(classify(&[]), Err(MessageError::Empty)));
    }

    #[test]
    fn test_continuation_skip_per_kind() {
        assert_eq!(EventKind::EventReport.continuation_skip(), 1);
        assert_eq!(EventKind::ActionReply.continuation_skip(), 2);
        assert_eq!(EventKind::PropertyReport.continuation_skip(), 0);
    }
}
