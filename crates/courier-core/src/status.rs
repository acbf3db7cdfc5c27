//! Message status transitions.
//!
//! Status only ever moves forward. Every transition the core applies goes
//! through [`advance`], and bulk transitions in persistence only touch rows for
//! which [`MessageStatus::can_advance_to`] holds.

use courier_protocol::MessageStatus;
use thiserror::Error;

/// A rejected status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Illegal status transition: {from} -> {to}")]
pub struct StatusError {
    pub from: MessageStatus,
    pub to: MessageStatus,
}

/// Validate a transition and return the new status.
///
/// # Errors
///
/// Returns [`StatusError`] for regressions, skips and self-transitions.
pub fn advance(from: MessageStatus, to: MessageStatus) -> Result<MessageStatus, StatusError> {
    if from.can_advance_to(to) {
        Ok(to)
    } else {
        Err(StatusError { from, to })
    }
}

/// Status a freshly persisted message should settle in.
///
/// A recipient already inside the room reads the message as it lands.
#[must_use]
pub fn initial_status(recipient_in_room: bool) -> MessageStatus {
    if recipient_in_room {
        MessageStatus::Read
    } else {
        MessageStatus::Sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance() {
        assert_eq!(
            advance(MessageStatus::Sent, MessageStatus::Read),
            Ok(MessageStatus::Read)
        );
        let err = advance(MessageStatus::Read, MessageStatus::Sent).unwrap_err();
        assert_eq!(err.to_string(), "Illegal status transition: read -> sent");
    }

    #[test]
    fn test_initial_status() {
        assert_eq!(initial_status(true), MessageStatus::Read);
        assert_eq!(initial_status(false), MessageStatus::Sent);
    }
}
