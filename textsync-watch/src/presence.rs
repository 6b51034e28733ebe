//! Presence bridge: inbound application messages → per-document ghost
//! cursors, reported through the log.
//!
//! ```text
//!  SessionRegistry message handler (doc id, JSON)
//!       │
//!       ▼
//!  WatchPresence::handle_message()
//!       │   join / leave diff against the previous roster
//!       ▼
//!  log::info!("ann joined README.md")
//! ```

use std::collections::{BTreeSet, HashMap};

use textsync_sync::{PresenceMessage, PresenceRoom};

/// Ghost cursors of every shared document.
#[derive(Debug, Default)]
pub struct WatchPresence {
    rooms: HashMap<String, PresenceRoom>,
}

impl WatchPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one message for `doc_id`. Returns `(joined, left)` participant
    /// labels (nickname if known, else the hash).
    pub fn handle_message(&mut self, doc_id: &str, body: &str) -> (Vec<String>, Vec<String>) {
        let room = self.rooms.entry(doc_id.to_owned()).or_default();
        let before = roster(room);
        if let Err(err) = room.handle_message(body) {
            log::debug!("{doc_id}: ignoring non-presence message: {err}");
            return (Vec::new(), Vec::new());
        }
        let after = roster(room);

        let joined: Vec<String> = after.difference(&before).cloned().collect();
        let left: Vec<String> = before.difference(&after).cloned().collect();
        for name in &joined {
            log::info!("{name} joined {doc_id}");
        }
        for name in &left {
            log::info!("{name} left {doc_id}");
        }
        (joined, left)
    }

    /// Participants currently present in `doc_id`.
    pub fn participants(&self, doc_id: &str) -> Vec<String> {
        self.rooms
            .get(doc_id)
            .map(|room| roster(room).into_iter().collect())
            .unwrap_or_default()
    }
}

fn roster(room: &PresenceRoom) -> BTreeSet<String> {
    room.cursors()
        .map(|c| c.nickname.clone().unwrap_or_else(|| c.participant.clone()))
        .collect()
}

/// Outbound presence for a whole file: no cursor, just our name.
pub fn announce(nickname: &str) -> Option<String> {
    match PresenceMessage::from_offsets(nickname, &[]).encode() {
        Ok(json) => Some(json),
        Err(err) => {
            log::warn!("cannot encode presence: {err}");
            None
        }
    }
}
