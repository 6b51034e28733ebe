//! Per-document reconciliation state machine.
//!
//! ```text
//!                  header / raw resync
//!      ┌──────────┐ ─────────────────────► ┌────────┐
//!      │ UNSYNCED │                        │ SYNCED │
//!      │ deltaOk  │ ◄───────────────────── │ deltaOk│
//!      │ = false  │  version mismatch,     │ = true │
//!      └──────────┘  undecodable delta     └────────┘
//! ```
//!
//! Each cycle a document diffs the live text against its shadow and queues
//! the result on the edit stack. The whole stack is resent until the server
//! acknowledges it, which gives at-least-once delivery without any
//! transport-level retry.
//!
//! Incoming deltas are applied to the shadow exactly and to the live text
//! fuzzily, with cursor offsets dragged along (see [`LiveText`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::checkpoint::DocumentCheckpoint;
use crate::diff::{is_unchanged, target_text, Patch, TextDiffPatch};
use crate::error::SyncError;
use crate::protocol::{ProtocolError, Record};

// ───────────────────────────────────────────────────────────────────
// Live text access
// ───────────────────────────────────────────────────────────────────

/// The host could not take a remote change into its buffer.
#[derive(Debug, Error)]
pub enum LiveTextError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("buffer rejected the write: {0}")]
    Rejected(String),
}

/// Access to the host editor's buffer for one document.
///
/// Offsets count characters. Implementations must be cheap to call from
/// the sync task; they are always called with the document lock held.
pub trait LiveTextSource: Send + Sync {
    fn text(&self) -> String;

    /// Replace the buffer. On error the buffer must still hold its old
    /// text.
    fn set_text(&self, text: &str) -> Result<(), LiveTextError>;

    /// Cursor and selection boundaries to preserve across remote patches.
    fn cursor_offsets(&self) -> Vec<usize> {
        Vec::new()
    }

    fn set_cursor_offsets(&self, _offsets: &[usize]) {}

    /// Optional opaque message to attach to this document's next request.
    fn application_message(&self) -> Option<String> {
        None
    }
}

/// A live-text source plus the lock serializing remote writes against
/// user edits.
pub struct LiveText {
    source: Arc<dyn LiveTextSource>,
    lock: Mutex<()>,
    applying_remote: AtomicBool,
}

// Clears the remote-write flag on every exit path.
struct RemoteWrite<'a>(&'a AtomicBool);

impl<'a> RemoteWrite<'a> {
    fn begin(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RemoteWrite<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl LiveText {
    pub fn new(source: Arc<dyn LiveTextSource>) -> Self {
        Self {
            source,
            lock: Mutex::new(()),
            applying_remote: AtomicBool::new(false),
        }
    }

    /// Snapshot the current text.
    pub fn read(&self) -> String {
        let _guard = self.lock.lock();
        self.source.text()
    }

    pub fn application_message(&self) -> Option<String> {
        self.source.application_message()
    }

    /// Run a user edit while no remote patch can interleave.
    pub fn user_edit<R>(&self, edit: impl FnOnce(&dyn LiveTextSource) -> R) -> R {
        let _guard = self.lock.lock();
        edit(self.source.as_ref())
    }

    /// `true` while the engine is writing into the buffer. Change
    /// notifications raised during that span are not user edits.
    pub fn is_applying_remote(&self) -> bool {
        self.applying_remote.load(Ordering::SeqCst)
    }

    /// Fuzzily apply patches to the live text, preserving cursors.
    ///
    /// Read, apply, write back and cursor restore happen under one lock.
    pub fn apply_patches(&self, dmp: &dyn TextDiffPatch, patches: &[Patch]) -> Result<Vec<bool>, LiveTextError> {
        let _guard = self.lock.lock();
        let text = self.source.text();
        let offsets = self.source.cursor_offsets();
        let outcome = dmp.patch_apply(patches, &text, &offsets);

        if outcome.text != text {
            let _remote = RemoteWrite::begin(&self.applying_remote);
            self.source.set_text(&outcome.text)?;
            self.source.set_cursor_offsets(&outcome.offsets);
        }
        Ok(outcome.applied)
    }

    /// Overwrite the live text, clamping cursors into the new text.
    pub fn overwrite(&self, text: &str) -> Result<(), LiveTextError> {
        let _guard = self.lock.lock();
        let len = text.chars().count();
        let offsets: Vec<usize> = self
            .source
            .cursor_offsets()
            .into_iter()
            .map(|o| o.min(len))
            .collect();

        let _remote = RemoteWrite::begin(&self.applying_remote);
        self.source.set_text(text)?;
        self.source.set_cursor_offsets(&offsets);
        Ok(())
    }
}

impl std::fmt::Debug for LiveText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveText")
            .field("applying_remote", &self.is_applying_remote())
            .finish_non_exhaustive()
    }
}

// ───────────────────────────────────────────────────────────────────
// Shadow document
// ───────────────────────────────────────────────────────────────────

/// An unacknowledged outgoing edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEdit {
    pub version: u64,
    pub record: Record,
}

/// Records one document contributes to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outbound {
    pub records: Vec<Record>,
    /// A local edit was detected this cycle.
    pub changed: bool,
}

/// A document's section of a response: the acknowledged client version from
/// its header and the records that followed it.
#[derive(Debug, Clone, Default)]
pub struct InboundBlock {
    pub acked_version: u64,
    pub records: Vec<Result<Record, ProtocolError>>,
}

/// What processing an inbound block did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundOutcome {
    pub remote_change: bool,
    /// Ask for the next cycle as soon as possible.
    pub resync: bool,
    pub messages: Vec<String>,
    /// The server asked us to stop sharing this document.
    pub unshare: bool,
}

/// Shadow state of one shared text.
#[derive(Debug)]
pub struct ShadowDocument {
    id: String,
    live: Arc<LiveText>,
    shadow_text: String,
    client_version: u64,
    server_version: u64,
    edit_stack: Vec<PendingEdit>,
    delta_ok: bool,
    merge_changes: bool,
}

impl ShadowDocument {
    pub fn new(id: impl Into<String>, live: Arc<LiveText>) -> Self {
        Self {
            id: id.into(),
            live,
            shadow_text: String::new(),
            client_version: 0,
            server_version: 0,
            edit_stack: Vec::new(),
            delta_ok: false,
            merge_changes: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn live(&self) -> &Arc<LiveText> {
        &self.live
    }

    pub fn shadow_text(&self) -> &str {
        &self.shadow_text
    }

    pub fn client_version(&self) -> u64 {
        self.client_version
    }

    pub fn server_version(&self) -> u64 {
        self.server_version
    }

    pub fn delta_ok(&self) -> bool {
        self.delta_ok
    }

    pub fn pending_edits(&self) -> &[PendingEdit] {
        &self.edit_stack
    }

    pub fn merge_changes(&self) -> bool {
        self.merge_changes
    }

    pub fn set_merge_changes(&mut self, merge: bool) {
        self.merge_changes = merge;
    }

    /// Diff the live text against the shadow and emit this cycle's records.
    pub fn produce_outbound(&mut self, dmp: &dyn TextDiffPatch, id_prefix: &str) -> Outbound {
        let live = self.live.read();
        let mut changed = false;

        if self.delta_ok {
            let mut diffs = dmp.diff(&self.shadow_text, &live);
            dmp.cleanup(&mut diffs);
            if !is_unchanged(&diffs) {
                let delta = dmp.delta_encode(&diffs);
                self.edit_stack.push(PendingEdit {
                    version: self.client_version,
                    record: Record::Delta {
                        version: self.client_version,
                        delta,
                        merge: self.merge_changes,
                    },
                });
                self.client_version += 1;
                self.shadow_text = live;
                changed = true;
            }
        } else {
            // Full-text resync. The server adopts the cited version.
            self.client_version += 1;
            log::warn!("{}: resyncing full text at client version {}", self.id, self.client_version);
            self.edit_stack.push(PendingEdit {
                version: self.client_version,
                record: Record::Raw {
                    version: self.client_version,
                    text: live.clone(),
                    force: false,
                },
            });
            self.shadow_text = live;
            self.delta_ok = true;
        }

        let mut records = Vec::with_capacity(self.edit_stack.len() + 2);
        records.push(Record::header(self.server_version, format!("{id_prefix}{}", self.id)));
        records.extend(self.edit_stack.iter().map(|edit| edit.record.clone()));
        if let Some(body) = self.live.application_message() {
            records.push(Record::Message { body, upper: true });
        }

        Outbound { records, changed }
    }

    /// Apply one response block. Never fails: problems degrade the document
    /// so the next cycle resends the full text.
    pub fn consume_inbound(&mut self, dmp: &dyn TextDiffPatch, block: &InboundBlock) -> InboundOutcome {
        let mut outcome = InboundOutcome::default();
        self.acknowledge(block.acked_version);

        for record in &block.records {
            let record = match record {
                Ok(record) => record,
                Err(ProtocolError::UnknownTag(tag)) => {
                    log::warn!("{}: skipping record with unknown tag {tag:?}", self.id);
                    continue;
                }
                Err(err) => {
                    self.degrade(SyncError::Protocol(err.clone()));
                    continue;
                }
            };

            match record {
                Record::Raw { version, text, force } => {
                    self.shadow_text = text.clone();
                    self.client_version = block.acked_version;
                    self.server_version = *version;
                    self.edit_stack.clear();
                    outcome.remote_change = true;
                    if *force {
                        if let Err(err) = self.live.overwrite(text) {
                            self.write_failed(err, &mut outcome);
                        }
                    }
                }
                Record::Delta { version, delta, .. } => {
                    self.consume_delta(dmp, block.acked_version, *version, delta, &mut outcome);
                }
                Record::Message { body, .. } => outcome.messages.push(body.clone()),
                Record::Nullify { .. } => outcome.unshare = true,
                Record::Username(_) | Record::File { .. } => {
                    log::debug!("{}: ignoring stray {:?}", self.id, record);
                }
            }
        }

        outcome
    }

    fn acknowledge(&mut self, acked: u64) {
        self.delta_ok = true;
        self.edit_stack.retain(|edit| edit.version > acked);
    }

    fn consume_delta(
        &mut self,
        dmp: &dyn TextDiffPatch,
        acked: u64,
        version: u64,
        delta: &str,
        outcome: &mut InboundOutcome,
    ) {
        if acked != self.client_version {
            self.degrade(SyncError::VersionMismatch {
                expected: self.client_version,
                got: acked,
            });
            return;
        }
        if version > self.server_version {
            // Server is ahead of us: something was lost in between.
            self.degrade(SyncError::VersionMismatch {
                expected: self.server_version,
                got: version,
            });
            return;
        }
        if version < self.server_version {
            // Duplicate or reordered delivery; already integrated.
            log::warn!(
                "{}: skipping delta for server version {version}, already at {}",
                self.id,
                self.server_version
            );
            return;
        }

        let diffs = match dmp.delta_decode(&self.shadow_text, delta) {
            Ok(diffs) => diffs,
            Err(err) => {
                let err = SyncError::from(err);
                outcome.resync = err.wants_immediate_resync();
                self.degrade(err);
                return;
            }
        };
        self.server_version += 1;
        if is_unchanged(&diffs) {
            return;
        }

        // Both delta flavours merge into the live text; the case only
        // matters to the server.
        let patches = dmp.patch_make(&self.shadow_text, &diffs);
        self.shadow_text = target_text(&diffs);
        outcome.remote_change = true;
        match self.live.apply_patches(dmp, &patches) {
            Ok(applied) => {
                let missed = applied.iter().filter(|ok| !**ok).count();
                if missed > 0 {
                    log::debug!("{}: {missed} of {} hunks missed the live text", self.id, applied.len());
                }
            }
            Err(err) => self.write_failed(err, outcome),
        }
    }

    /// The shadow already holds the server text but the buffer does not.
    /// Diffing the two would send the server's change back as our own
    /// undo, so resync with the full text instead.
    fn write_failed(&mut self, err: LiveTextError, outcome: &mut InboundOutcome) {
        let err = SyncError::from(err);
        outcome.resync |= err.wants_immediate_resync();
        self.degrade(err);
    }

    fn degrade(&mut self, reason: SyncError) {
        log::warn!("{}: {reason}; falling back to full-text sync", self.id);
        self.delta_ok = false;
    }

    /// `N:` record telling the server to drop this document.
    pub fn nullify_record(&self, id_prefix: &str) -> Record {
        Record::Nullify {
            id: format!("{id_prefix}{}", self.id),
        }
    }

    pub fn checkpoint(&self) -> DocumentCheckpoint {
        DocumentCheckpoint {
            id: self.id.clone(),
            shadow_text: self.shadow_text.clone(),
            client_version: self.client_version,
            server_version: self.server_version,
        }
    }

    /// Resume from a checkpoint. The first cycle afterwards is a full-text
    /// resync at the continued version numbers.
    pub fn restore(&mut self, checkpoint: &DocumentCheckpoint) {
        self.shadow_text = checkpoint.shadow_text.clone();
        self.client_version = checkpoint.client_version;
        self.server_version = checkpoint.server_version;
        self.edit_stack.clear();
        self.delta_ok = false;
    }
}
