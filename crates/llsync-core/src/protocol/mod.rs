//! Wire-level protocol building blocks: constants, fragmentation and
//! notify-frame classification.

pub mod constants;
pub mod fragment;
pub mod message;

pub use fragment::{Assembled, FragmentError, Reassembler, fragment};
pub use message::{EventKind, MessageError, classify};
