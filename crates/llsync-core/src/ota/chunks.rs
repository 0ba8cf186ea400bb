//! Firmware file handling, cycle chunking and the OTA wire formats.

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use tracing::warn;

use crate::crypto;
use crate::error::{ErrorCode, ProtocolError};
use crate::protocol::constants::{OTA_PACKET_HEADER_LEN, OTA_UPDATE_DATA};

/// A downloaded firmware image with its integrity checksum.
#[derive(Debug, Clone)]
pub struct FirmwareFile {
    bytes: Vec<u8>,
    crc: u32,
}

impl FirmwareFile {
    pub fn new(bytes: Vec<u8>) -> Self {
        let crc = crypto::crc32(&bytes);
        Self { bytes, crc }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }
}

/// Transfer parameters negotiated in the update reply, mutated as
/// cycles are acknowledged.
#[derive(Debug, Clone)]
pub struct OtaProgress {
    pub max_packages_per_cycle: usize,
    pub max_bytes_per_package: usize,
    /// Resume point: bytes the device already holds.
    pub received_size: usize,
    pub retry_gap: Duration,
    pub retry_limit: u32,
    pub reboot_wait: Duration,
    pub send_gap: Duration,
}

/// Device's answer to the update request.
#[derive(Debug, Clone)]
pub struct UpdateOffer {
    pub resume_supported: bool,
    pub progress: OtaProgress,
}

/// `[fileSize:4][crc32:4][versionLen:1][version…]`
pub fn build_update_request(
    file: &FirmwareFile,
    target_version: &str,
) -> Result<Vec<u8>, ProtocolError> {
    let version = target_version.as_bytes();
    if version.len() > u8::MAX as usize {
        return Err(ProtocolError::Failed(ErrorCode::GetOtaInfoFail));
    }
    let mut payload = Vec::with_capacity(9 + version.len());
    payload.extend_from_slice(&(file.len() as u32).to_be_bytes());
    payload.extend_from_slice(&file.crc().to_be_bytes());
    payload.push(version.len() as u8);
    payload.extend_from_slice(version);
    Ok(payload)
}

/// Parse the update reply. `indicate` bit0 grants the update, bit1
/// advertises resume support; a denial carries the device reason in the
/// next byte. The package size is clamped to the session MTU.
pub fn parse_update_reply(
    payload: &[u8],
    mtu: usize,
    retry_limit: u32,
    fallback_send_gap: Duration,
) -> Result<UpdateOffer, ProtocolError> {
    let (&indicate, rest) = payload
        .split_first()
        .ok_or(ProtocolError::InvalidReply(ErrorCode::UpdateReplyInvalid))?;

    if indicate & 0x01 == 0 {
        let reason = rest.first().copied().unwrap_or(0xFF);
        warn!(
            reason,
            detail = refusal_reason(reason),
            "device refused the update request"
        );
        return Err(ProtocolError::Failed(ErrorCode::ModuleNotAllowed));
    }

    if rest.len() < 8 {
        return Err(ProtocolError::InvalidReply(ErrorCode::UpdateReplyInvalid));
    }
    let max_packages_per_cycle = rest[0] as usize;
    let max_bytes_per_package = (rest[1] as usize).min(mtu);
    let retry_gap = Duration::from_secs(u64::from(rest[2]));
    let reboot_wait = Duration::from_secs(u64::from(rest[3]));
    let received_size = BigEndian::read_u32(&rest[4..8]) as usize;
    // The inter-packet gap byte is absent on older firmware.
    let send_gap = match rest.get(8) {
        Some(&ms) if ms > 0 => Duration::from_millis(u64::from(ms)),
        _ => fallback_send_gap,
    };

    if max_packages_per_cycle == 0 || max_bytes_per_package <= OTA_PACKET_HEADER_LEN {
        return Err(ProtocolError::InvalidReply(ErrorCode::UpdateReplyInvalid));
    }

    Ok(UpdateOffer {
        resume_supported: indicate & 0x02 != 0,
        progress: OtaProgress {
            max_packages_per_cycle,
            max_bytes_per_package,
            received_size,
            retry_gap,
            retry_limit,
            reboot_wait,
            send_gap,
        },
    })
}

/// Chunks for the next cycle, starting at the resume offset.
pub fn cycle_chunks<'a>(file: &'a [u8], progress: &OtaProgress) -> Vec<&'a [u8]> {
    let per_package = progress.max_bytes_per_package - OTA_PACKET_HEADER_LEN;
    let remaining = file.len().saturating_sub(progress.received_size);
    let count = remaining
        .div_ceil(per_package)
        .min(progress.max_packages_per_cycle);

    let mut chunks = Vec::with_capacity(count);
    let mut start = progress.received_size;
    for _ in 0..count {
        let end = (start + per_package).min(file.len());
        chunks.push(&file[start..end]);
        start = end;
    }
    chunks
}

/// Data packets `[type:1][len:1][seq:1][chunk…]` for every chunk from
/// `start_seq` to the end of the cycle. `len` counts the sequence byte
/// plus the chunk.
pub fn package_frames(chunks: &[&[u8]], start_seq: usize) -> Vec<Vec<u8>> {
    chunks
        .iter()
        .enumerate()
        .skip(start_seq)
        .map(|(seq, chunk)| {
            let mut frame = Vec::with_capacity(OTA_PACKET_HEADER_LEN + chunk.len());
            frame.push(OTA_UPDATE_DATA);
            frame.push((chunk.len() + 1) as u8);
            frame.push(seq as u8);
            frame.extend_from_slice(chunk);
            frame
        })
        .collect()
}

/// Parse the per-cycle acknowledgement `[seq:1][receivedTotal:4]`.
pub fn parse_data_ack(payload: &[u8]) -> Result<(usize, usize), ProtocolError> {
    if payload.len() < 5 {
        return Err(ProtocolError::InvalidReply(ErrorCode::UpdateReplyInvalid));
    }
    let seq = payload[0] as usize;
    let received = BigEndian::read_u32(&payload[1..5]) as usize;
    Ok((seq, received))
}

/// Parse the integrity verdict `[result:1]`: bit7 set means the device
/// verified the file, otherwise the low bits carry its reason.
pub fn parse_check_reply(payload: &[u8]) -> Result<(), ProtocolError> {
    let &result = payload
        .first()
        .ok_or(ProtocolError::InvalidReply(ErrorCode::UpdateReplyInvalid))?;
    if result & 0x80 != 0 {
        Ok(())
    } else {
        let reason = result & 0x7F;
        warn!(
            reason,
            detail = integrity_failure_reason(reason),
            "device rejected the transferred file"
        );
        Err(ProtocolError::Failed(ErrorCode::UpdateCheckFileFail))
    }
}

/// Device reasons for refusing an update request.
pub fn refusal_reason(code: u8) -> &'static str {
    match code {
        0 => "device-side failure",
        1 => "firmware signature rejected",
        2 => "not enough storage",
        3 => "battery too low",
        4 => "version rejected",
        _ => "unspecified",
    }
}

/// Device reasons for failing the post-transfer integrity check.
pub fn integrity_failure_reason(code: u8) -> &'static str {
    match code {
        0 => "checksum mismatch",
        1 => "file size mismatch",
        2 => "flash write failed",
        _ => "unspecified",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(max_packages: usize, max_bytes: usize, received: usize) -> OtaProgress {
        OtaProgress {
            max_packages_per_cycle: max_packages,
            max_bytes_per_package: max_bytes,
            received_size: received,
            retry_gap: Duration::from_secs(1),
            retry_limit: 5,
            reboot_wait: Duration::from_secs(1),
            send_gap: Duration::ZERO,
        }
    }

    #[test]
    fn test_first_cycle_covers_two_hundred_bytes() {
        // 1000-byte file, 23-byte packages (20 usable), 10 per cycle:
        // the first cycle spans bytes 0..200.
        let file: Vec<u8> = (0..1000u16).map(|b| b as u8).collect();
        let chunks = cycle_chunks(&file, &progress(10, 23, 0));

        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().all(|c| c.len() == 20));
        assert_eq!(chunks[0], &file[0..20]);
        assert_eq!(chunks[9], &file[180..200]);
    }

    #[test]
    fn test_cycle_resumes_at_received_offset() {
        let file: Vec<u8> = (0..1000u16).map(|b| b as u8).collect();
        let chunks = cycle_chunks(&file, &progress(10, 23, 200));
        assert_eq!(chunks[0], &file[200..220]);
    }

    #[test]
    fn test_final_cycle_is_partial() {
        let file = vec![7u8; 1000];
        // 960 received, 40 left: two 20-byte chunks.
        let chunks = cycle_chunks(&file, &progress(10, 23, 960));
        assert_eq!(chunks.len(), 2);

        // Non-aligned tail.
        let chunks = cycle_chunks(&file, &progress(10, 23, 990));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 10);
    }

    #[test]
    fn test_package_frame_layout() {
        let data = [vec![0xAAu8; 20], vec![0xBB; 4]];
        let chunks: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        let frames = package_frames(&chunks, 0);

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][0], OTA_UPDATE_DATA);
        assert_eq!(frames[0][1], 21); // chunk + sequence byte
        assert_eq!(frames[0][2], 0);
        assert_eq!(frames[1][1], 5);
        assert_eq!(frames[1][2], 1);
    }

    #[test]
    fn test_package_frames_resume_from_sequence() {
        let data = [vec![1u8], vec![2], vec![3]];
        let chunks: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        let frames = package_frames(&chunks, 2);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][2], 2);
        assert_eq!(frames[0][3], 3);
    }

    #[test]
    fn test_update_request_layout() {
        let file = FirmwareFile::new(vec![0u8; 1000]);
        let payload = build_update_request(&file, "2.0").unwrap();

        assert_eq!(&payload[0..4], &1000u32.to_be_bytes());
        assert_eq!(&payload[4..8], &0x060B_1780u32.to_be_bytes());
        assert_eq!(payload[8], 3);
        assert_eq!(&payload[9..], b"2.0");
    }

    #[test]
    fn test_update_reply_parsing() {
        let payload = [0x03, 10, 23, 1, 2, 0, 0, 0, 200, 5];
        let offer =
            parse_update_reply(&payload, 64, 5, Duration::from_millis(10)).unwrap();

        assert!(offer.resume_supported);
        assert_eq!(offer.progress.max_packages_per_cycle, 10);
        assert_eq!(offer.progress.max_bytes_per_package, 23);
        assert_eq!(offer.progress.retry_gap, Duration::from_secs(1));
        assert_eq!(offer.progress.reboot_wait, Duration::from_secs(2));
        assert_eq!(offer.progress.received_size, 200);
        assert_eq!(offer.progress.send_gap, Duration::from_millis(5));
    }

    #[test]
    fn test_update_reply_clamps_package_to_mtu() {
        let payload = [0x01, 10, 100, 1, 1, 0, 0, 0, 0];
        let offer = parse_update_reply(&payload, 20, 5, Duration::ZERO).unwrap();
        assert_eq!(offer.progress.max_bytes_per_package, 20);
        assert!(!offer.resume_supported);
    }

    #[test]
    fn test_update_reply_missing_send_gap_uses_fallback() {
        let payload = [0x01, 10, 23, 1, 1, 0, 0, 0, 0];
        let offer =
            parse_update_reply(&payload, 64, 5, Duration::from_millis(10)).unwrap();
        assert_eq!(offer.progress.send_gap, Duration::from_millis(10));
    }

    #[test]
    fn test_update_reply_refusal() {
        let err = parse_update_reply(&[0x00, 0x03], 64, 5, Duration::ZERO).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Failed(ErrorCode::ModuleNotAllowed)
        ));
    }

    #[test]
    fn test_update_reply_truncated() {
        let err = parse_update_reply(&[0x01, 10, 23], 64, 5, Duration::ZERO).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidReply(ErrorCode::UpdateReplyInvalid)
        ));
    }

    #[test]
    fn test_data_ack_parsing() {
        let (seq, received) = parse_data_ack(&[10, 0, 0, 0, 200]).unwrap();
        assert_eq!(seq, 10);
        assert_eq!(received, 200);
        assert!(parse_data_ack(&[1, 2]).is_err());
    }

    #[test]
    fn test_check_reply_parsing() {
        assert!(parse_check_reply(&[0x80]).is_ok());
        assert!(matches!(
            parse_check_reply(&[0x02]).unwrap_err(),
            ProtocolError::Failed(ErrorCode::UpdateCheckFileFail)
        ));
        assert!(parse_check_reply(&[]).is_err());
    }
}
