//! Presence state for one document: who is connected, where their cursor
//! is and whether their editor is focused.
//!
//! ```text
//! PRESENCE_SINGLE_UPDATE / PRESENCE_ACTIVITY
//!       │
//!       ▼
//! PresenceRoom::update_cursor() / set_active()   (last write wins)
//!       │
//!       ▼
//! PresenceRoom::snapshot_for(recipient)  ──► PRESENCE_STATE_SET
//! ```
//!
//! Every participant gets a style index used by clients to pick a cursor
//! color. New participants take the least-used index so colors stay
//! distinct for as long as possible.

use std::str::FromStr;

use uuid::Uuid;

use crate::protocol::{CursorRange, Message, OwnUser, RealtimeUser};

/// Number of distinct cursor styles clients render.
pub const STYLE_COUNT: u8 = 8;

/// Who may publish cursor and activity updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresencePolicy {
    #[default]
    Everyone,
    EditorsOnly,
}

impl PresencePolicy {
    pub fn allows(&self, can_edit: bool) -> bool {
        match self {
            PresencePolicy::Everyone => true,
            PresencePolicy::EditorsOnly => can_edit,
        }
    }
}

impl FromStr for PresencePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "everyone" | "all" => Ok(PresencePolicy::Everyone),
            "editors" | "editors-only" | "editors_only" => Ok(PresencePolicy::EditorsOnly),
            other => Err(format!("unknown presence policy '{other}'")),
        }
    }
}

/// One connected participant.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub connection_id: Uuid,
    pub display_name: String,
    pub username: Option<String>,
    pub style_index: u8,
    pub cursor: Option<CursorRange>,
    pub active: bool,
    pub can_edit: bool,
}

impl Participant {
    fn as_realtime_user(&self) -> RealtimeUser {
        RealtimeUser {
            display_name: self.display_name.clone(),
            username: self.username.clone(),
            style_index: self.style_index,
            cursor: self.cursor,
            active: self.active,
        }
    }

    fn as_own_user(&self) -> OwnUser {
        OwnUser {
            display_name: self.display_name.clone(),
            style_index: self.style_index,
        }
    }
}

/// Smallest style index among those used the fewest times.
pub fn least_used_style_index(used: impl IntoIterator<Item = u8>) -> u8 {
    let mut counts = [0usize; STYLE_COUNT as usize];
    for index in used {
        if let Some(count) = counts.get_mut(index as usize) {
            *count += 1;
        }
    }
    let mut best = 0;
    for (index, count) in counts.iter().enumerate() {
        if *count < counts[best] {
            best = index;
        }
    }
    best as u8
}

/// Presence of every connection on one document, in join order.
#[derive(Debug, Default)]
pub struct PresenceRoom {
    participants: Vec<Participant>,
}

impl PresenceRoom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant and return its style index.
    pub fn join(
        &mut self,
        connection_id: Uuid,
        display_name: impl Into<String>,
        username: Option<String>,
        can_edit: bool,
    ) -> u8 {
        if let Some(existing) = self.participant(connection_id) {
            return existing.style_index;
        }
        let style_index = least_used_style_index(self.participants.iter().map(|p| p.style_index));
        self.participants.push(Participant {
            connection_id,
            display_name: display_name.into(),
            username,
            style_index,
            cursor: None,
            active: true,
            can_edit,
        });
        style_index
    }

    pub fn leave(&mut self, connection_id: Uuid) -> Option<Participant> {
        let position = self
            .participants
            .iter()
            .position(|p| p.connection_id == connection_id)?;
        Some(self.participants.remove(position))
    }

    /// Record a cursor move. Returns whether anything changed.
    pub fn update_cursor(
        &mut self,
        connection_id: Uuid,
        cursor: Option<CursorRange>,
        policy: PresencePolicy,
    ) -> bool {
        match self.participant_mut(connection_id) {
            Some(p) if policy.allows(p.can_edit) && p.cursor != cursor => {
                p.cursor = cursor;
                true
            }
            _ => false,
        }
    }

    /// Record focus or idle state. Returns whether anything changed.
    pub fn set_active(&mut self, connection_id: Uuid, active: bool, policy: PresencePolicy) -> bool {
        match self.participant_mut(connection_id) {
            Some(p) if policy.allows(p.can_edit) && p.active != active => {
                p.active = active;
                true
            }
            _ => false,
        }
    }

    /// `PresenceStateSet` as seen by `recipient`: everyone else, plus itself
    /// as `own_user`.
    pub fn snapshot_for(&self, recipient: Uuid) -> Option<Message> {
        let own = self.participant(recipient)?;
        let users = self
            .participants
            .iter()
            .filter(|p| p.connection_id != recipient)
            .map(Participant::as_realtime_user)
            .collect();
        Some(Message::PresenceStateSet {
            users,
            own_user: own.as_own_user(),
        })
    }

    pub fn participant(&self, connection_id: Uuid) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.connection_id == connection_id)
    }

    fn participant_mut(&mut self, connection_id: Uuid) -> Option<&mut Participant> {
        self.participants
            .iter_mut()
            .find(|p| p.connection_id == connection_id)
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_in(message: &Message) -> (Vec<String>, OwnUser) {
        match message {
            Message::PresenceStateSet { users, own_user } => (
                users.iter().map(|u| u.display_name.clone()).collect(),
                own_user.clone(),
            ),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_least_used_style_index() {
        assert_eq!(least_used_style_index([]), 0);
        assert_eq!(least_used_style_index([0, 1, 2]), 3);
        assert_eq!(least_used_style_index([0, 2]), 1);
        let all: Vec<u8> = (0..STYLE_COUNT).collect();
        assert_eq!(least_used_style_index(all.clone()), 0);
        let mut twice = all.clone();
        twice.extend([0, 1]);
        assert_eq!(least_used_style_index(twice), 2);
    }

    #[test]
    fn test_join_assigns_distinct_styles() {
        let mut room = PresenceRoom::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        assert_eq!(room.join(a, "Ada", None, true), 0);
        assert_eq!(room.join(b, "Bob", None, true), 1);
        room.leave(a);
        assert_eq!(room.join(c, "Cy", None, false), 0);
        assert_eq!(room.join(c, "Cy", None, false), 0);
        assert_eq!(room.len(), 2);
    }

    #[test]
    fn test_snapshot_excludes_recipient() {
        let mut room = PresenceRoom::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        room.join(a, "Ada", Some("ada".into()), true);
        room.join(b, "Bob", None, true);
        room.join(c, "Cy", None, false);

        let (users, own) = users_in(&room.snapshot_for(b).unwrap());
        assert_eq!(users, vec!["Ada".to_string(), "Cy".to_string()]);
        assert_eq!(own.display_name, "Bob");
        assert_eq!(own.style_index, 1);
        assert!(room.snapshot_for(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_cursor_last_write_wins() {
        let mut room = PresenceRoom::new();
        let a = Uuid::new_v4();
        room.join(a, "Ada", None, true);

        assert!(room.update_cursor(a, Some(CursorRange::caret(3)), PresencePolicy::Everyone));
        assert!(room.update_cursor(a, Some(CursorRange::selection(1, 4)), PresencePolicy::Everyone));
        assert!(!room.update_cursor(a, Some(CursorRange::selection(1, 4)), PresencePolicy::Everyone));
        assert_eq!(room.participant(a).unwrap().cursor, Some(CursorRange::selection(1, 4)));
    }

    #[test]
    fn test_policy_filters_readers() {
        let mut room = PresenceRoom::new();
        let reader = Uuid::new_v4();
        room.join(reader, "Reader", None, false);

        assert!(!room.update_cursor(reader, Some(CursorRange::caret(0)), PresencePolicy::EditorsOnly));
        assert!(!room.set_active(reader, false, PresencePolicy::EditorsOnly));
        assert!(room.update_cursor(reader, Some(CursorRange::caret(0)), PresencePolicy::Everyone));
        assert!(room.set_active(reader, false, PresencePolicy::Everyone));
        assert!(!room.participant(reader).unwrap().active);
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("everyone".parse(), Ok(PresencePolicy::Everyone));
        assert_eq!("Editors".parse(), Ok(PresencePolicy::EditorsOnly));
        assert!("nobody".parse::<PresencePolicy>().is_err());
    }
}
