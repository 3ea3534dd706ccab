// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Outcomes and Statuses
//!
//! `MessageOutcome` is what a handler answers for one message, and
//! `ProfileStatus` is the connection status persisted on the bus profile.

use std::fmt;

/// Result of a handler invocation.
///
/// `Error` and `Undetermined` are dispatched identically: the message is
/// captured as a dead letter and acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageOutcome {
    Acknowledge,
    NegativeAcknowledge,
    Reject,
    Error,
    /// The handler faulted unexpectedly or gave no definitive answer.
    Undetermined,
}

impl MessageOutcome {
    /// True for the outcomes that settle a delivery without a dead letter.
    pub fn is_definitive(&self) -> bool {
        matches!(
            self,
            MessageOutcome::Acknowledge | MessageOutcome::NegativeAcknowledge | MessageOutcome::Reject
        )
    }
}

impl fmt::Display for MessageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageOutcome::Acknowledge => "ack",
            MessageOutcome::NegativeAcknowledge => "nack",
            MessageOutcome::Reject => "reject",
            MessageOutcome::Error => "error",
            MessageOutcome::Undetermined => "undetermined",
        };
        f.write_str(s)
    }
}

/// Connection status persisted on the profile for external visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProfileStatus {
    #[default]
    Disconnected,
    Connected,
}

impl ProfileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileStatus::Connected => "connected",
            ProfileStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ProfileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_broker_outcomes_are_definitive() {
        assert!(MessageOutcome::Acknowledge.is_definitive());
        assert!(MessageOutcome::NegativeAcknowledge.is_definitive());
        assert!(MessageOutcome::Reject.is_definitive());
        assert!(!MessageOutcome::Error.is_definitive());
        assert!(!MessageOutcome::Undetermined.is_definitive());
    }

    #[test]
    fn profile_status_strings() {
        assert_eq!(ProfileStatus::Connected.to_string(), "connected");
        assert_eq!(ProfileStatus::default().as_str(), "disconnected");
    }
}
