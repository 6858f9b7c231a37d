//! Alerts
//!
//! Per-user notification records written next to state transitions.
//! Append-only: the core creates them and never mutates them again.

use serde::{Deserialize, Serialize};

use crate::core::clock::Millis;
use crate::game::state::{EndReason, Role};
use crate::network::channel::{ChannelError, FieldUpdates};

/// What happened.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertKind {
    /// Recipient was captured
    Captured {
        /// Oni who made the capture
        by_uid: String,
        /// Recipient's down count after the capture
        downs: u32,
        /// Whether that capture eliminated the recipient
        eliminated: bool,
    },
    /// Recipient was rescued
    Rescued {
        /// Runner who made the rescue
        by_uid: String,
    },
    /// A teammate cleared an objective pin
    PinCleared {
        /// Runner who cleared it
        by_uid: String,
        /// Pin id
        pin_id: String,
        /// Pins still standing
        remaining: u32,
    },
    /// The game ended
    GameEnded {
        /// Outcome
        reason: EndReason,
        /// Winning side, if any
        winner: Option<Role>,
    },
}

/// An alert document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Alert id; equals the document id
    #[serde(default)]
    pub id: String,
    /// Recipient
    pub to_uid: String,
    /// Payload
    pub event: AlertKind,
    /// Commit time
    #[serde(default)]
    pub created_at: Option<Millis>,
}

impl Alert {
    /// Create an alert with a fresh id.
    pub fn new(to_uid: impl Into<String>, event: AlertKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            to_uid: to_uid.into(),
            event,
            created_at: None,
        }
    }

    /// Capture notice for the victim.
    pub fn captured(to_uid: &str, by_uid: &str, downs: u32, eliminated: bool) -> Self {
        Self::new(
            to_uid,
            AlertKind::Captured {
                by_uid: by_uid.to_string(),
                downs,
                eliminated,
            },
        )
    }

    /// Rescue notice for the rescued runner.
    pub fn rescued(to_uid: &str, by_uid: &str) -> Self {
        Self::new(to_uid, AlertKind::Rescued { by_uid: by_uid.to_string() })
    }

    /// Pin clear notice for a runner.
    pub fn pin_cleared(to_uid: &str, by_uid: &str, pin_id: &str, remaining: u32) -> Self {
        Self::new(
            to_uid,
            AlertKind::PinCleared {
                by_uid: by_uid.to_string(),
                pin_id: pin_id.to_string(),
                remaining,
            },
        )
    }

    /// Game end notice. The id is fixed per recipient so that redundant
    /// end writes from several clients land on the same document.
    pub fn game_ended(to_uid: &str, reason: EndReason) -> Self {
        Self {
            id: format!("game-ended-{to_uid}"),
            ..Self::new(
                to_uid,
                AlertKind::GameEnded {
                    reason,
                    winner: reason.winning_role(),
                },
            )
        }
    }

    /// Creation write; `createdAt` is stamped by the store.
    pub fn to_updates(&self) -> Result<FieldUpdates, ChannelError> {
        Ok(FieldUpdates::new()
            .set("toUid", self.to_uid.as_str())
            .set_json("event", &self.event)?
            .server_timestamp("createdAt"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::channel::{Document, FieldValue};
    use serde_json::json;

    #[test]
    fn test_alert_ids_are_unique() {
        let a = Alert::rescued("b", "c");
        let b = Alert::rescued("b", "c");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_alert_write_shape() {
        let alert = Alert::captured("b", "a", 1, false);
        let updates = alert.to_updates().unwrap();

        assert_eq!(updates.get("toUid"), Some(&FieldValue::Set(json!("b"))));
        assert_eq!(updates.get("createdAt"), Some(&FieldValue::ServerTimestamp));

        let mut doc = Document::new();
        updates.apply_to(&mut doc, 7);
        let decoded: Alert = crate::game::state::from_document(&doc).unwrap();
        assert_eq!(decoded.event, alert.event);
        assert_eq!(decoded.created_at, Some(7));
    }

    #[test]
    fn test_game_ended_carries_winner() {
        let alert = Alert::game_ended("a", EndReason::RunnersNeutralized);
        assert_eq!(alert.id, Alert::game_ended("a", EndReason::RunnersNeutralized).id);
        assert_eq!(
            alert.event,
            AlertKind::GameEnded {
                reason: EndReason::RunnersNeutralized,
                winner: Some(Role::Oni),
            }
        );
    }
}
