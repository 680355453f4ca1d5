//! Control message types exchanged between master and worker.
//!
//! - **Takeover** (worker → master): "I am listening, retire my predecessor"
//! - **Quit** (master → worker): "drain and exit now"

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio_util::bytes::Bytes;

/// Kind of a control message. The discriminant is the wire tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MessageType {
    Takeover = 0x01,
    Quit = 0x02,
}

impl MessageType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Takeover),
            0x02 => Some(Self::Quit),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Takeover => "takeover",
            Self::Quit => "quit",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One control message. `value` is opaque to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub kind: MessageType,
    pub value: Bytes,
}

impl ControlMessage {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            value: Bytes::new(),
        }
    }

    pub fn takeover() -> Self {
        Self::new(MessageType::Takeover)
    }

    pub fn quit() -> Self {
        Self::new(MessageType::Quit)
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }
}
