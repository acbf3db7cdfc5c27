//! Message status vocabulary.
//!
//! A message moves `sending -> sent -> {delivered | read}` and `delivered -> read`.
//! `read` is terminal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Accepted from the sender, not yet durable.
    Sending,
    /// Durable, recipient not yet reached.
    Sent,
    /// Recipient's client is online.
    Delivered,
    /// Recipient has seen the message.
    Read,
}

impl MessageStatus {
    /// Whether a message in this status may move to `next`.
    #[must_use]
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        matches!(
            (self, next),
            (MessageStatus::Sending, MessageStatus::Sent)
                | (MessageStatus::Sent, MessageStatus::Delivered)
                | (MessageStatus::Sent, MessageStatus::Read)
                | (MessageStatus::Delivered, MessageStatus::Read)
        )
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == MessageStatus::Read
    }

    /// Whether the recipient has not read the message yet.
    #[must_use]
    pub fn is_unread(self) -> bool {
        !self.is_terminal()
    }

    /// Wire name of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sending" => Ok(MessageStatus::Sending),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            _ => Err("Invalid message status"),
        }
    }
}
