//! Presence over the application-message channel: who has their cursor where.
//!
//! ## Flow
//!
//! ```text
//! local cursors ──► PresenceMessage::from_offsets()
//!       │
//!       ▼   JSON in an M: record, once per cycle
//!   gateway (fans messages out, keyed by participant hash)
//!       │
//!       ▼   {"<hash>": {"nickname": "...", "selection": [[b, e], ...]}}
//! PresenceRoom::handle_message()
//!       │
//!       ▼
//! GhostCursor::regions()   (empty marks widened to one char)
//! ```
//!
//! Participants not heard from for 7 seconds are dropped.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Idle time after which a ghost cursor disappears.
pub const CURSOR_TIMEOUT: Duration = Duration::from_secs(7);

// ───────────────────────────────────────────────────────────────────
// Outbound
// ───────────────────────────────────────────────────────────────────

/// Our own presence, sent as an application message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMessage {
    pub nickname: String,
    /// Selections as `[start, end]` character offsets.
    pub selection: Vec<(usize, usize)>,
}

impl PresenceMessage {
    /// Pair up cursor offsets into selections. A trailing odd offset
    /// becomes an empty selection.
    pub fn from_offsets(nickname: impl Into<String>, offsets: &[usize]) -> Self {
        let selection = offsets
            .chunks(2)
            .map(|pair| (pair[0], pair[pair.len() - 1]))
            .collect();
        Self {
            nickname: nickname.into(),
            selection,
        }
    }

    /// Compact JSON.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ───────────────────────────────────────────────────────────────────
// Inbound
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
struct PresenceUpdate {
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default)]
    selection: Option<Vec<(usize, usize)>>,
}

/// Display color derived from the participant hash.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl CursorColor {
    /// Stable hue per participant, fixed saturation and lightness.
    pub fn for_participant(hash: &str) -> Self {
        let mut h: u32 = 0x811c_9dc5;
        for byte in hash.as_bytes() {
            h ^= *byte as u32;
            h = h.wrapping_mul(0x0100_0193);
        }
        let hue = (h % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    let channel = |mut t: f32| {
        if t < 0.0 {
            t += 1.0;
        }
        if t > 1.0 {
            t -= 1.0;
        }
        if t < 1.0 / 6.0 {
            p + (q - p) * 6.0 * t
        } else if t < 0.5 {
            q
        } else if t < 2.0 / 3.0 {
            p + (q - p) * (2.0 / 3.0 - t) * 6.0
        } else {
            p
        }
    };
    (channel(h + 1.0 / 3.0), channel(h), channel(h - 1.0 / 3.0))
}

/// Another participant's cursors in one document.
#[derive(Debug, Clone)]
pub struct GhostCursor {
    pub participant: String,
    pub nickname: Option<String>,
    pub marks: Vec<(usize, usize)>,
    pub color: CursorColor,
    last_update: Instant,
}

impl GhostCursor {
    fn new(participant: &str, now: Instant) -> Self {
        Self {
            participant: participant.to_owned(),
            nickname: None,
            marks: Vec::new(),
            color: CursorColor::for_participant(participant),
            last_update: now,
        }
    }

    fn update(&mut self, update: PresenceUpdate, now: Instant) {
        self.last_update = now;
        if let Some(nickname) = update.nickname {
            self.nickname = Some(nickname);
        }
        if let Some(selection) = update.selection {
            self.marks = selection;
        }
    }

    /// Marks ready for display, normalized so `start <= end`; empty marks
    /// are widened to one character so they stay visible.
    pub fn regions(&self) -> Vec<(usize, usize)> {
        self.marks
            .iter()
            .map(|&(a, b)| {
                let (start, end) = (a.min(b), a.max(b));
                if end == start {
                    (start, end + 1)
                } else {
                    (start, end)
                }
            })
            .collect()
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_update) > timeout
    }
}

/// Ghost cursors of one document.
#[derive(Debug, Clone)]
pub struct PresenceRoom {
    cursors: HashMap<String, GhostCursor>,
    timeout: Duration,
}

impl Default for PresenceRoom {
    fn default() -> Self {
        Self::new(CURSOR_TIMEOUT)
    }
}

impl PresenceRoom {
    pub fn new(timeout: Duration) -> Self {
        Self {
            cursors: HashMap::new(),
            timeout,
        }
    }

    /// Apply an inbound message; returns how many participants it touched.
    pub fn handle_message(&mut self, json: &str) -> Result<usize, serde_json::Error> {
        self.handle_message_at(json, Instant::now())
    }

    pub fn handle_message_at(&mut self, json: &str, now: Instant) -> Result<usize, serde_json::Error> {
        let updates: HashMap<String, PresenceUpdate> = serde_json::from_str(json)?;
        let touched = updates.len();
        for (participant, update) in updates {
            self.cursors
                .entry(participant.clone())
                .or_insert_with(|| GhostCursor::new(&participant, now))
                .update(update, now);
        }
        self.expire_idle_at(now);
        Ok(touched)
    }

    /// Drop idle participants, returning their hashes.
    pub fn expire_idle(&mut self) -> Vec<String> {
        self.expire_idle_at(Instant::now())
    }

    pub fn expire_idle_at(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.timeout;
        let idle: Vec<String> = self
            .cursors
            .values()
            .filter(|c| c.is_idle(now, timeout))
            .map(|c| c.participant.clone())
            .collect();
        for participant in &idle {
            self.cursors.remove(participant);
            log::debug!("ghost cursor {participant} timed out");
        }
        idle
    }

    pub fn cursor(&self, participant: &str) -> Option<&GhostCursor> {
        self.cursors.get(participant)
    }

    pub fn cursors(&self) -> impl Iterator<Item = &GhostCursor> {
        self.cursors.values()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_message_json() {
        let msg = PresenceMessage::from_offsets("ann", &[3, 7, 12]);
        assert_eq!(msg.selection, vec![(3, 7), (12, 12)]);
        assert_eq!(
            msg.encode().unwrap(),
            r#"{"nickname":"ann","selection":[[3,7],[12,12]]}"#
        );
    }

    #[test]
    fn test_handle_message_tracks_participants() {
        let mut room = PresenceRoom::default();
        let touched = room
            .handle_message(r#"{"a1": {"nickname": "bo", "selection": [[5, 5], [9, 2]]}, "b2": {}}"#)
            .unwrap();
        assert_eq!(touched, 2);
        assert_eq!(room.len(), 2);

        let bo = room.cursor("a1").unwrap();
        assert_eq!(bo.nickname.as_deref(), Some("bo"));
        assert_eq!(bo.regions(), vec![(5, 6), (2, 9)]);
        assert!(room.cursor("b2").unwrap().marks.is_empty());
    }

    #[test]
    fn test_update_without_selection_keeps_marks() {
        let mut room = PresenceRoom::default();
        room.handle_message(r#"{"a1": {"selection": [[1, 4]]}}"#).unwrap();
        room.handle_message(r#"{"a1": {"nickname": "cy"}}"#).unwrap();
        assert_eq!(room.cursor("a1").unwrap().marks, vec![(1, 4)]);
    }

    #[test]
    fn test_idle_cursors_expire() {
        let mut room = PresenceRoom::default();
        let start = Instant::now();
        room.handle_message_at(r#"{"old": {}}"#, start).unwrap();
        room.handle_message_at(r#"{"new": {}}"#, start + Duration::from_secs(5)).unwrap();

        let gone = room.expire_idle_at(start + Duration::from_secs(8));
        assert_eq!(gone, vec!["old".to_string()]);
        assert!(room.cursor("new").is_some());
    }

    #[test]
    fn test_bad_json_rejected() {
        let mut room = PresenceRoom::default();
        assert!(room.handle_message("not json").is_err());
        assert!(room.is_empty());
    }

    #[test]
    fn test_color_stable_per_participant() {
        let a = CursorColor::for_participant("abc");
        assert_eq!(a, CursorColor::for_participant("abc"));
        for channel in [a.r, a.g, a.b] {
            assert!((0.0..=1.0).contains(&channel));
        }
    }
}
