//! Control channel between the master and each worker.
//!
//! # Architecture
//!
//! - **protocol**: message types (`Takeover`, `Quit`)
//! - **codec**: tag + length-prefixed framing with a hard size ceiling
//! - **channel**: socketpair endpoints and fd inheritance

pub mod channel;
pub mod codec;
pub mod protocol;

pub use channel::{ControlChannel, ControlReader, ControlWriter, INHERITED_FD};
pub use codec::{CodecError, ControlCodec, MAX_MESSAGE_SIZE};
pub use protocol::{ControlMessage, MessageType};
