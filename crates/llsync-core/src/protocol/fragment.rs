//! MTU fragmentation and split-marker reassembly.
//!
//! Every logical message travels as one or more wire frames of at most
//! `mtu` bytes. A frame is `head || lenField || chunk` where `lenField`
//! packs `(splitMarker:2)(flag:1)(length:13)` big-endian. Delivery order
//! is guaranteed by the BLE link, so no sequence numbers are carried.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tracing::debug;

/// Split marker: single-frame message.
pub const SPLIT_NONE: u8 = 0;
/// Split marker: first fragment, resets the reassembly buffer.
pub const SPLIT_FIRST: u8 = 1;
/// Split marker: middle fragment.
pub const SPLIT_MIDDLE: u8 = 2;
/// Split marker: last fragment, completes the message.
pub const SPLIT_LAST: u8 = 3;

/// Largest chunk length the 13-bit field can describe.
pub const MAX_CHUNK_LEN: usize = 0x1FFF;

#[derive(Error, Debug)]
pub enum FragmentError {
    #[error("MTU {mtu} cannot carry a {head_len}-byte head plus length field")]
    MtuTooSmall { mtu: usize, head_len: usize },

    #[error("payload of {len} bytes exceeds the 13-bit length field")]
    PayloadTooLarge { len: usize },

    #[error("frame of {len} bytes is shorter than its declared chunk")]
    Truncated { len: usize },

    #[error("continuation fragment received with no first fragment")]
    OrphanFragment,
}

fn len_field(marker: u8, flag: bool, len: usize) -> u16 {
    ((marker as u16) << 14) | ((flag as u16) << 13) | (len as u16 & 0x1FFF)
}

/// Split a logical message into wire frames.
///
/// `chunks` are the smallest units the payload can be cut at (per-field
/// TLV chunks for data-model messages, a single chunk otherwise); any
/// chunk wider than the frame capacity is cut again. The `head` bytes
/// are repeated on every frame.
pub fn fragment(head: &[u8], chunks: &[Vec<u8>], mtu: usize) -> Result<Vec<Vec<u8>>, FragmentError> {
    let capacity = mtu
        .checked_sub(head.len() + 2)
        .filter(|c| *c > 0)
        .ok_or(FragmentError::MtuTooSmall {
            mtu,
            head_len: head.len(),
        })?;

    let total: usize = chunks.iter().map(Vec::len).sum();
    if total > MAX_CHUNK_LEN {
        return Err(FragmentError::PayloadTooLarge { len: total });
    }

    // Whole message fits in one frame: plain 16-bit length, no split.
    if total <= capacity {
        let mut frame = Vec::with_capacity(head.len() + 2 + total);
        frame.extend_from_slice(head);
        frame.extend_from_slice(&len_field(SPLIT_NONE, false, total).to_be_bytes());
        for chunk in chunks {
            frame.extend_from_slice(chunk);
        }
        return Ok(vec![frame]);
    }

    // Cut oversized chunks down to frame capacity first.
    let mut pieces: Vec<&[u8]> = Vec::new();
    for chunk in chunks {
        if chunk.len() <= capacity {
            pieces.push(chunk);
        } else {
            for piece in chunk.chunks(capacity) {
                pieces.push(piece);
            }
        }
    }

    let last = pieces.len() - 1;
    let mut frames = Vec::with_capacity(pieces.len());
    for (i, piece) in pieces.iter().enumerate() {
        let marker = if i == 0 {
            SPLIT_FIRST
        } else if i == last {
            SPLIT_LAST
        } else {
            SPLIT_MIDDLE
        };
        let mut frame = Vec::with_capacity(head.len() + 2 + piece.len());
        frame.extend_from_slice(head);
        frame.extend_from_slice(&len_field(marker, false, piece.len()).to_be_bytes());
        frame.extend_from_slice(piece);
        frames.push(frame);
    }

    Ok(frames)
}

/// A fully reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    /// Per-message flag bit from the envelope (meaning depends on the
    /// message kind, e.g. "user rejected bind").
    pub flag: bool,
    /// Message payload with all envelope bytes stripped.
    pub payload: Vec<u8>,
}

/// Reassembly state for one message kind within one connection epoch.
///
/// `skip` is the number of repeated sub-head bytes carried at the start
/// of continuation fragments for this kind (event reports repeat the
/// event index, action replies the index and status byte).
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: Vec<u8>,
    active: bool,
    skip: usize,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_skip(skip: usize) -> Self {
        Self {
            skip,
            ..Self::default()
        }
    }

    /// Feed one frame body (`lenField || chunk`). Returns the completed
    /// message once a `NOT_SPLIT` or `LAST` frame arrives.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<Assembled>, FragmentError> {
        if frame.len() < 2 {
            return Err(FragmentError::Truncated { len: frame.len() });
        }
        let field = BigEndian::read_u16(&frame[..2]);
        let marker = (field >> 14) as u8;
        let flag = (field >> 13) & 1 == 1;
        let len = (field & 0x1FFF) as usize;

        let chunk = frame
            .get(2..2 + len)
            .ok_or(FragmentError::Truncated { len: frame.len() })?;

        match marker {
            SPLIT_NONE => Ok(Some(Assembled {
                flag,
                payload: chunk.to_vec(),
            })),
            SPLIT_FIRST => {
                if self.active {
                    // The link is ordered, so a fresh first fragment means
                    // the previous message was abandoned mid-flight.
                    debug!(dropped = self.buf.len(), "discarding incomplete reassembly");
                }
                self.buf.clear();
                self.buf.extend_from_slice(chunk);
                self.active = true;
                Ok(None)
            }
            SPLIT_MIDDLE => {
                if !self.active {
                    return Err(FragmentError::OrphanFragment);
                }
                self.buf.extend_from_slice(&chunk[self.skip.min(chunk.len())..]);
                Ok(None)
            }
            _ => {
                if !self.active {
                    return Err(FragmentError::OrphanFragment);
                }
                self.buf.extend_from_slice(&chunk[self.skip.min(chunk.len())..]);
                self.active = false;
                Ok(Some(Assembled {
                    flag,
                    payload: std::mem::take(&mut self.buf),
                }))
            }
        }
    }

    /// Drop any partial state (called on reconnect).
    pub fn reset(&mut self) {
        self.buf.clear();
        self.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip_head(frames: &[Vec<u8>], head_len: usize) -> Vec<Vec<u8>> {
        frames.iter().map(|f| f[head_len..].to_vec()).collect()
    }

    #[test]
    fn test_single_frame_when_it_fits() {
        let frames = fragment(&[0x20], &[vec![1, 2, 3]], 20).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], vec![0x20, 0x00, 0x03, 1, 2, 3]);
    }

    #[test]
    fn test_roundtrip_across_frames() {
        let data: Vec<u8> = (0..100).collect();
        let frames = fragment(&[0x00], &[data.clone()], 20).unwrap();
        assert!(frames.len() > 2);
        for frame in &frames {
            assert!(frame.len() <= 20);
        }

        let mut asm = Reassembler::new();
        let mut out = None;
        for frame in strip_head(&frames, 1) {
            if let Some(done) = asm.push(&frame).unwrap() {
                out = Some(done);
            }
        }
        let out = out.expect("message should complete");
        assert_eq!(out.payload, data);
        assert!(!out.flag);
    }

    #[test]
    fn test_roundtrip_at_every_split_count() {
        // 2..=6 frames with MTU 20 and a one-byte head (17 bytes/frame).
        for n in 2usize..=6 {
            let data: Vec<u8> = (0..(17 * n - 3) as u16).map(|b| b as u8).collect();
            let frames = fragment(&[0x00], &[data.clone()], 20).unwrap();
            assert_eq!(frames.len(), n);

            let mut asm = Reassembler::new();
            let mut out = None;
            for frame in strip_head(&frames, 1) {
                if let Some(done) = asm.push(&frame).unwrap() {
                    out = Some(done);
                }
            }
            assert_eq!(out.unwrap().payload, data);
        }
    }

    #[test]
    fn test_capacity_honors_wide_heads() {
        let data: Vec<u8> = (0..40).collect();
        let frames = fragment(&[0x60, 0x00], &[data], 20).unwrap();
        for frame in &frames {
            assert!(frame.len() <= 20, "frame of {} bytes", frame.len());
        }
    }

    #[test]
    fn test_first_fragment_resets_stale_buffer() {
        let mut asm = Reassembler::new();
        // First fragment of a message that never completes.
        asm.push(&[0x40, 0x02, 9, 9]).unwrap();
        // A new message starts; the stale bytes must not leak into it.
        asm.push(&[0x40, 0x02, 1, 2]).unwrap();
        let done = asm.push(&[0xC0, 0x02, 3, 4]).unwrap().unwrap();
        assert_eq!(done.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_flag_bit_surfaces_on_last_frame() {
        let mut asm = Reassembler::new();
        asm.push(&[0x40, 0x01, 7]).unwrap();
        // LAST with the flag bit set: 0b1110_0000 0x01.
        let done = asm.push(&[0xE0, 0x01, 8]).unwrap().unwrap();
        assert!(done.flag);
        assert_eq!(done.payload, vec![7, 8]);
    }

    #[test]
    fn test_continuation_skip() {
        let mut asm = Reassembler::with_skip(1);
        asm.push(&[0x40, 0x03, 0x05, 1, 2]).unwrap();
        // Continuations repeat the one-byte sub-head (0x05) which is dropped.
        let done = asm.push(&[0xC0, 0x03, 0x05, 3, 4]).unwrap().unwrap();
        assert_eq!(done.payload, vec![0x05, 1, 2, 3, 4]);
    }

    #[test]
    fn test_orphan_continuation_rejected() {
        let mut asm = Reassembler::new();
        assert!(matches!(
            asm.push(&[0x80, 0x01, 1]),
            Err(FragmentError::OrphanFragment)
        ));
        assert!(matches!(
            asm.push(&[0xC0, 0x01, 1]),
            Err(FragmentError::OrphanFragment)
        ));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let mut asm = Reassembler::new();
        assert!(matches!(
            asm.push(&[0x00, 0x05, 1, 2]),
            Err(FragmentError::Truncated { .. })
        ));
    }

    #[test]
    fn test_mtu_too_small() {
        assert!(matches!(
            fragment(&[0x00, 0x01], &[vec![1]], 3),
            Err(FragmentError::MtuTooSmall { .. })
        ));
    }
}
