//! Per-attempt state machine
//!
//! ```text
//! received -> decoding -> staged -> validating
//!          -> promoting(customers) -> promoting(products)
//!          -> promoting(orders) -> promoting(order_items)
//!          -> completed | completed_with_conflicts
//! ```
//!
//! States only move forward. The last reached state is reported when an
//! attempt is abandoned so a retry knows how far the previous one got.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use super::types::EntityKind;
use crate::error::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Received,
    Decoding,
    Staged,
    Validating,
    Promoting(EntityKind),
    Completed,
    CompletedWithConflicts,
}

impl AttemptState {
    fn rank(&self) -> u8 {
        match self {
            AttemptState::Received => 0,
            AttemptState::Decoding => 1,
            AttemptState::Staged => 2,
            AttemptState::Validating => 3,
            AttemptState::Promoting(kind) => 4 + kind.promotion_rank(),
            AttemptState::Completed | AttemptState::CompletedWithConflicts => 8,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Completed | AttemptState::CompletedWithConflicts
        )
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptState::Received => f.write_str("received"),
            AttemptState::Decoding => f.write_str("decoding"),
            AttemptState::Staged => f.write_str("staged"),
            AttemptState::Validating => f.write_str("validating"),
            AttemptState::Promoting(kind) => write!(f, "promoting({})", kind),
            AttemptState::Completed => f.write_str("completed"),
            AttemptState::CompletedWithConflicts => f.write_str("completed_with_conflicts"),
        }
    }
}

impl std::str::FromStr for AttemptState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(AttemptState::Received),
            "decoding" => Ok(AttemptState::Decoding),
            "staged" => Ok(AttemptState::Staged),
            "validating" => Ok(AttemptState::Validating),
            "completed" => Ok(AttemptState::Completed),
            "completed_with_conflicts" => Ok(AttemptState::CompletedWithConflicts),
            other => other
                .strip_prefix("promoting(")
                .and_then(|rest| rest.strip_suffix(')'))
                .ok_or_else(|| format!("unknown attempt state '{}'", other))?
                .parse()
                .map(AttemptState::Promoting),
        }
    }
}

impl Serialize for AttemptState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AttemptState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Tracks one attempt's progress through [`AttemptState`]
#[derive(Debug, Clone)]
pub struct AttemptMachine {
    attempt_id: Uuid,
    state: AttemptState,
    history: Vec<(AttemptState, DateTime<Utc>)>,
}

impl AttemptMachine {
    pub fn new(attempt_id: Uuid) -> Self {
        Self {
            attempt_id,
            state: AttemptState::Received,
            history: vec![(AttemptState::Received, Utc::now())],
        }
    }

    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn history(&self) -> &[(AttemptState, DateTime<Utc>)] {
        &self.history
    }

    /// Move to `next`; refuses to stay in place or go backwards.
    pub fn advance(&mut self, next: AttemptState) -> Result<(), IngestError> {
        if self.state.is_terminal() || next.rank() <= self.state.rank() {
            return Err(IngestError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        tracing::debug!(
            attempt_id = %self.attempt_id,
            from = %self.state,
            to = %next,
            "Attempt state transition"
        );

        self.state = next;
        self.history.push((next, Utc::now()));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        let mut machine = AttemptMachine::new(Uuid::new_v4());
        machine.advance(AttemptState::Decoding).unwrap();
        machine.advance(AttemptState::Staged).unwrap();
        machine.advance(AttemptState::Validating).unwrap();
        for kind in super::super::types::PROMOTION_ORDER {
            machine.advance(AttemptState::Promoting(kind)).unwrap();
        }
        machine.advance(AttemptState::Completed).unwrap();
        assert_eq!(machine.history().len(), 9);
    }

    #[test]
    fn test_backward_transition_is_rejected() {
        let mut machine = AttemptMachine::new(Uuid::new_v4());
        machine.advance(AttemptState::Decoding).unwrap();
        machine.advance(AttemptState::Staged).unwrap();
        machine.advance(AttemptState::Validating).unwrap();
        machine
            .advance(AttemptState::Promoting(EntityKind::Order))
            .unwrap();

        let err = machine
            .advance(AttemptState::Promoting(EntityKind::Customer))
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidTransition { .. }));
        assert_eq!(machine.state(), AttemptState::Promoting(EntityKind::Order));
    }

    #[test]
    fn test_terminal_state_is_final() {
        let mut machine = AttemptMachine::new(Uuid::new_v4());
        machine.advance(AttemptState::CompletedWithConflicts).unwrap();
        assert!(machine.advance(AttemptState::Completed).is_err());
    }

    #[test]
    fn test_state_string_form() {
        let state = AttemptState::Promoting(EntityKind::OrderItem);
        assert_eq!(state.to_string(), "promoting(order_items)");
        assert_eq!("promoting(order_items)".parse::<AttemptState>().unwrap(), state);

        let json = serde_json::to_string(&AttemptState::CompletedWithConflicts).unwrap();
        assert_eq!(json, "\"completed_with_conflicts\"");
        assert!("promoting(invoices)".parse::<AttemptState>().is_err());
    }
}
