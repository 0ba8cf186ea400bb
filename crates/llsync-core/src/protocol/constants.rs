//! Protocol constants for the LLSync BLE profile.
//!
//! Byte values for characteristic routing, message-type dispatch and the
//! per-channel write prefixes. The service/characteristic UUIDs are the
//! ones advertised by LLSync firmware.

/// 16-bit service UUID advertised by LLSync devices.
pub const SERVICE_UUID16: &str = "0000FFE0-0000-1000-8000-00805F9B34FB";

/// Full service UUID used once connected.
pub const SERVICE_UUID: &str = "0000FFE0-65D0-4E20-B56A-E493541BA4E2";

/// Device-info write characteristic (bind/auth/info exchanges).
pub const CHAR_DEVICE_INFO_WRITE: &str = "0000FFE1-65D0-4E20-B56A-E493541BA4E2";

/// Data-model write characteristic (property/action control).
pub const CHAR_DEVICE_DATA_WRITE: &str = "0000FFE2-65D0-4E20-B56A-E493541BA4E2";

/// Firmware-update write characteristic.
pub const CHAR_OTA_WRITE: &str = "0000FFE3-65D0-4E20-B56A-E493541BA4E2";

/// Notify characteristic carrying every device-to-client message.
pub const CHAR_NOTIFY: &str = "0000FFE4-65D0-4E20-B56A-E493541BA4E2";

/// Default MTU assumed before the device-info exchange reports one.
pub const DEFAULT_MTU: usize = 20;

/// Largest MTU value the 13-bit device-info field can carry.
pub const MAX_MTU: usize = 0x1FFF;

// ============================================================================
// Notify message types (first byte of every notify frame)
// ============================================================================

pub const MSG_BIND_REPLY: u8 = 0x00;
pub const MSG_CONNECT_REPLY: u8 = 0x01;
pub const MSG_UNBIND_REPLY: u8 = 0x02;
pub const MSG_DEVICE_INFO: u8 = 0x03;
pub const MSG_USER_CHECK_WINDOW: u8 = 0x04;
pub const MSG_PROPERTY_REPORT: u8 = 0x08;
pub const MSG_GET_STATUS: u8 = 0x09;
pub const MSG_EVENT_REPORT: u8 = 0x0A;
pub const MSG_CONTROL_REPLY: u8 = 0x0B;
pub const MSG_ACTION_REPLY: u8 = 0x0C;
pub const MSG_UPDATE_REPLY: u8 = 0x0E;
pub const MSG_UPDATE_DATA_REPLY: u8 = 0x0F;
pub const MSG_UPDATE_CHECK_REPLY: u8 = 0x10;

// ============================================================================
// Device-info channel write prefixes
// ============================================================================

/// Time-sync / bind request.
pub const INFO_TIME_SYNC: u8 = 0x00;
/// Connection authentication challenge.
pub const INFO_CONNECT_AUTH: u8 = 0x01;
/// Unbind authentication challenge.
pub const INFO_UNBIND_AUTH: u8 = 0x02;
/// Connect result: success. Also triggers the device-info reply.
pub const INFO_CONNECT_SUCCESS: u8 = 0x03;
/// Connect result: failure.
pub const INFO_CONNECT_FAIL: u8 = 0x04;
/// Bind succeeded; payload carries the new PSK and the user identity.
pub const INFO_BIND_SUCCESS: u8 = 0x05;
/// Bind failed; payload carries the backend error code as ASCII.
pub const INFO_BIND_FAIL: u8 = 0x06;
/// User-confirmation cancelled (timeout or explicit cancel).
pub const INFO_USER_CHECK_CANCEL: u8 = 0x07;
/// Result of the explicit MTU negotiation.
pub const INFO_MTU_RESULT: u8 = 0x08;
/// Unbind completed on the backend.
pub const INFO_UNBIND_SUCCESS: u8 = 0x09;
/// Unbind abandoned (signature or backend failure).
pub const INFO_UNBIND_FAIL: u8 = 0x0A;

/// User-check cancel reasons.
pub const USER_CHECK_REASON_TIMEOUT: u8 = 0x00;
pub const USER_CHECK_REASON_CANCEL: u8 = 0x01;

/// MTU result bodies.
pub const MTU_RESULT_SUCCESS: u16 = 0x0000;
pub const MTU_RESULT_FAIL: u16 = 0xFFFF;

// ============================================================================
// Device-data channel heads (3-bit op in the top bits of the head byte)
// ============================================================================

pub const DATA_OP_CONTROL_PROPERTY: u8 = 0;
pub const DATA_OP_CONTROL_ACTION: u8 = 1;
pub const DATA_OP_REPORT_ACK: u8 = 2;
pub const DATA_OP_STATUS_REPLY: u8 = 3;
pub const DATA_OP_EVENT_ACK: u8 = 4;

/// Build a device-data head byte from a 3-bit op and 5-bit suffix.
pub const fn data_head(op: u8, suffix: u8) -> u8 {
    (op << 5) | (suffix & 0x1F)
}

// ============================================================================
// OTA channel write prefixes
// ============================================================================

pub const OTA_UPDATE_REQUEST: u8 = 0x00;
pub const OTA_UPDATE_DATA: u8 = 0x01;
pub const OTA_UPDATE_DATA_END: u8 = 0x02;

/// Reserved bytes per OTA data packet: type + length + sequence.
pub const OTA_PACKET_HEADER_LEN: usize = 3;

/// Challenge string signed by the client in an unbind request.
pub const UNBIND_REQUEST: &str = "UnbindRequest";

/// Challenge string the device must sign in its unbind reply.
pub const UNBIND_RESPONSE: &str = "UnbindResponse";

/// Seconds the device adds to the bind/auth timestamp before signing.
pub const AUTH_TIMESTAMP_SKEW: u32 = 60;

/// HMAC-SHA1 signature length on the wire.
pub const SIGNATURE_LEN: usize = 20;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_head_packing() {
        assert_eq!(data_head(DATA_OP_CONTROL_PROPERTY, 0), 0x00);
        assert_eq!(data_head(DATA_OP_CONTROL_ACTION, 3), 0x23);
        assert_eq!(data_head(DATA_OP_EVENT_ACK, 31), 0x9F);
        // Suffix is masked to five bits.
        assert_eq!(data_head(DATA_OP_REPORT_ACK, 0x3F), 0x5F);
    }
}
