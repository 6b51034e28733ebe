//! One remote endpoint's set of shared documents.
//!
//! ```text
//!   build_request()                          parse_response()
//!   ┌─────────────────────┐                  ┌──────────────────────────┐
//!   │ u:<session id>      │                  │ F:… ─► block for doc A   │
//!   │ ┌─ doc A outbound ─┐│   transport      │   d:… r:… m:…            │
//!   │ └──────────────────┘│ ───────────────► │ F:… ─► block for doc B   │
//!   │ ┌─ doc B outbound ─┐│ ◄─────────────── │   …                      │
//!   │ └──────────────────┘│                  │ N:… ─► unshare           │
//!   │ <blank line>        │                  │ <blank line>             │
//!   └─────────────────────┘                  └──────────────────────────┘
//! ```
//!
//! Documents are processed one after another inside a cycle. Parsing never
//! fails: truncated responses are dropped whole, bad records are logged and
//! the affected document falls back to a full-text resync.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;

use crate::checkpoint::DocumentCheckpoint;
use crate::config::SyncConfig;
use crate::diff::{DiffMatchPatch, TextDiffPatch};
use crate::document::{InboundBlock, LiveText, ShadowDocument};
use crate::interval::{IntervalController, SpeedProfile};
use crate::protocol::{encode_packet, packet_lines, ProtocolError, Record};

/// Callback for `m:`/`M:` payloads: `(document id, payload)`.
pub type MessageHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// An encoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub body: String,
    /// Carries no document records; nothing needs to be sent.
    pub is_null: bool,
}

/// Side effects of a parsed response the owner may care about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseOutcome {
    /// Response lacked its terminator and was ignored.
    pub truncated: bool,
    /// Final state of the documents the server told us to stop sharing.
    pub unshared: Vec<DocumentCheckpoint>,
}

pub struct SyncSession {
    session_id: String,
    id_prefix: String,
    documents: IndexMap<String, ShadowDocument>,
    local_change: bool,
    remote_change: bool,
    nullify_all: bool,
    interval: IntervalController,
    message_handler: Option<MessageHandler>,
    dmp: Arc<dyn TextDiffPatch>,
}

impl SyncSession {
    pub fn new(config: &SyncConfig, id_prefix: impl Into<String>) -> Self {
        Self {
            session_id: config.session_username(),
            id_prefix: id_prefix.into(),
            documents: IndexMap::new(),
            local_change: false,
            remote_change: false,
            nullify_all: false,
            interval: IntervalController::from_config(config),
            message_handler: None,
            dmp: Arc::new(DiffMatchPatch::default()),
        }
    }

    /// Use a different diff/patch implementation.
    pub fn with_diff(mut self, dmp: Arc<dyn TextDiffPatch>) -> Self {
        self.dmp = dmp;
        self
    }

    pub fn with_interval(mut self, interval: IntervalController) -> Self {
        self.interval = interval;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn id_prefix(&self) -> &str {
        &self.id_prefix
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.documents.contains_key(id)
    }

    pub fn document(&self, id: &str) -> Option<&ShadowDocument> {
        self.documents.get(id)
    }

    pub fn document_mut(&mut self, id: &str) -> Option<&mut ShadowDocument> {
        self.documents.get_mut(id)
    }

    pub fn document_ids(&self) -> impl Iterator<Item = &str> {
        self.documents.keys().map(String::as_str)
    }

    /// Start sharing `id`. Sharing an id twice keeps the existing state.
    pub fn share(
        &mut self,
        id: impl Into<String>,
        live: Arc<LiveText>,
        checkpoint: Option<&DocumentCheckpoint>,
    ) -> &mut ShadowDocument {
        let id = id.into();
        if self.documents.contains_key(&id) {
            log::warn!("{id} is already shared");
        }
        self.documents.entry(id.clone()).or_insert_with(|| {
            let mut doc = ShadowDocument::new(id.clone(), live);
            if let Some(checkpoint) = checkpoint {
                doc.restore(checkpoint);
                log::info!("shared {id} (resuming at c{}/s{})", checkpoint.client_version, checkpoint.server_version);
            } else {
                log::info!("shared {id}");
            }
            doc
        })
    }

    /// Stop sharing `id`, returning its final state for checkpointing.
    pub fn unshare(&mut self, id: &str) -> Option<DocumentCheckpoint> {
        let doc = self.documents.shift_remove(id)?;
        log::info!("unshared {id}");
        Some(doc.checkpoint())
    }

    /// Ask the server to drop every document; they are unshared locally
    /// once the request has been built.
    pub fn nullify_all(&mut self) {
        self.nullify_all = true;
    }

    pub fn set_message_handler(&mut self, handler: Option<MessageHandler>) {
        self.message_handler = handler;
    }

    pub fn on_focus_changed(&mut self, focused: bool) {
        self.interval.note_focus(focused);
    }

    pub fn set_speed_profile(&mut self, profile: SpeedProfile) {
        self.interval.set_profile(profile);
    }

    pub fn interval(&self) -> Duration {
        self.interval.current()
    }

    /// Local and remote change flags for the current cycle.
    pub fn change_flags(&self) -> (bool, bool) {
        (self.local_change, self.remote_change)
    }

    /// Build this cycle's request. Resets the change flags.
    pub fn build_request(&mut self) -> SyncRequest {
        self.local_change = false;
        self.remote_change = false;

        let mut records = vec![Record::Username(self.session_id.clone())];

        if std::mem::take(&mut self.nullify_all) {
            for doc in self.documents.values() {
                records.push(doc.nullify_record(&self.id_prefix));
            }
            for id in self.documents.keys() {
                log::info!("nullified {id}");
            }
            self.documents.clear();
        } else {
            let dmp = Arc::clone(&self.dmp);
            for doc in self.documents.values_mut() {
                let outbound = doc.produce_outbound(dmp.as_ref(), &self.id_prefix);
                self.local_change |= outbound.changed;
                records.extend(outbound.records);
            }
        }

        let is_null = records.len() == 1;
        let body = encode_packet(&records);
        log::debug!("request:\n{body}");
        SyncRequest { body, is_null }
    }

    /// Demultiplex a response into its documents.
    pub fn parse_response(&mut self, text: &str) -> ResponseOutcome {
        let mut outcome = ResponseOutcome::default();
        log::debug!("response:\n{text}");

        let lines = match packet_lines(text) {
            Ok(lines) => lines,
            Err(err) => {
                log::warn!("discarding response: {err}");
                outcome.truncated = true;
                return outcome;
            }
        };

        // Document id and block collected since its header.
        let mut current: Option<(String, InboundBlock)> = None;

        for line in lines {
            let record = Record::parse(line);
            match record {
                Ok(Record::File { version, ref id, .. }) => {
                    self.finish_block(current.take(), &mut outcome);
                    match self.local_id(id) {
                        Some(local) => {
                            current = Some((
                                local,
                                InboundBlock {
                                    acked_version: version,
                                    records: Vec::new(),
                                },
                            ));
                        }
                        None => log::warn!("skipping block for unknown document {id:?}"),
                    }
                }
                Ok(Record::Nullify { ref id }) => {
                    self.finish_block(current.take(), &mut outcome);
                    if let Some(local) = self.local_id(id) {
                        self.drop_unshared(&local, &mut outcome);
                    }
                }
                Ok(Record::Username(_)) => {}
                Err(ProtocolError::UnknownTag(tag)) => {
                    log::warn!("skipping line with unknown tag {tag:?}");
                }
                Err(ref err) if line.starts_with(['F', 'f']) => {
                    // Can't tell which document this header meant.
                    log::warn!("skipping block after bad header: {err}");
                    self.finish_block(current.take(), &mut outcome);
                }
                record => match current.as_mut() {
                    Some((_, block)) => block.records.push(record),
                    None => log::debug!("dropping record outside a document block: {line:?}"),
                },
            }
        }
        self.finish_block(current, &mut outcome);

        outcome
    }

    /// Strip the endpoint prefix and check the document is shared here.
    fn local_id(&self, wire_id: &str) -> Option<String> {
        let Some(local) = wire_id.strip_prefix(self.id_prefix.as_str()) else {
            log::warn!("id {wire_id:?} lacks prefix {:?}", self.id_prefix);
            return None;
        };
        self.documents.contains_key(local).then(|| local.to_owned())
    }

    fn finish_block(&mut self, block: Option<(String, InboundBlock)>, outcome: &mut ResponseOutcome) {
        let Some((id, block)) = block else { return };
        let Some(doc) = self.documents.get_mut(&id) else { return };

        let result = doc.consume_inbound(self.dmp.as_ref(), &block);
        self.remote_change |= result.remote_change;
        if result.resync {
            self.interval.request_immediate();
        }
        if let Some(handler) = &self.message_handler {
            for message in &result.messages {
                handler(&id, message);
            }
        }
        if result.unshare {
            self.drop_unshared(&id, outcome);
        }
    }

    fn drop_unshared(&mut self, id: &str, outcome: &mut ResponseOutcome) {
        if let Some(doc) = self.documents.shift_remove(id) {
            log::info!("server unshared {id}");
            outcome.unshared.push(doc.checkpoint());
        }
    }

    /// Fold this cycle's activity into the interval.
    pub fn recompute_interval(&mut self) -> Duration {
        self.interval.recompute(self.local_change, self.remote_change)
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("session_id", &self.session_id)
            .field("id_prefix", &self.id_prefix)
            .field("documents", &self.documents.keys().collect::<Vec<_>>())
            .field("interval", &self.interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::tests::MemoryText;
    use parking_lot::Mutex;

    fn session() -> SyncSession {
        let config = SyncConfig {
            username: Some("tester".into()),
            ..Default::default()
        };
        SyncSession::new(&config, "p:")
    }

    fn share(session: &mut SyncSession, id: &str, text: &str) -> Arc<MemoryText> {
        let source = MemoryText::new(text);
        session.share(id, Arc::new(LiveText::new(source.clone())), None);
        source
    }

    #[test]
    fn test_empty_session_is_null_sync() {
        let mut s = session();
        let req = s.build_request();
        assert!(req.is_null);
        assert_eq!(req.body, "u:tester\n\n");
    }

    #[test]
    fn test_request_multiplexes_documents() {
        let mut s = session();
        share(&mut s, "a.txt", "alpha");
        share(&mut s, "b.txt", "beta");
        let req = s.build_request();

        assert!(!req.is_null);
        assert_eq!(
            req.body,
            "u:tester\nF:0:p:a.txt\nr:1:alpha\nF:0:p:b.txt\nr:1:beta\n\n"
        );
    }

    #[test]
    fn test_response_routed_by_header() {
        let mut s = session();
        let a = share(&mut s, "a.txt", "alpha");
        let b = share(&mut s, "b.txt", "beta");
        s.build_request();

        let outcome = s.parse_response("F:1:p:b.txt\nd:0:=4\t+!\nF:1:p:a.txt\n\n");
        assert_eq!(outcome, ResponseOutcome::default());
        assert_eq!(b.get(), "beta!");
        assert_eq!(a.get(), "alpha");
        assert_eq!(s.document("b.txt").unwrap().server_version(), 1);
        assert_eq!(s.change_flags(), (false, true));
    }

    #[test]
    fn test_truncated_response_changes_nothing() {
        let mut s = session();
        let a = share(&mut s, "a.txt", "alpha");
        s.build_request();

        let outcome = s.parse_response("F:1:p:a.txt\nd:0:=5\t+!\n");
        assert!(outcome.truncated);
        assert_eq!(a.get(), "alpha");
        let doc = s.document("a.txt").unwrap();
        assert_eq!(doc.server_version(), 0);
        assert_eq!(doc.pending_edits().len(), 1);
    }

    #[test]
    fn test_unknown_document_block_skipped() {
        let mut s = session();
        let a = share(&mut s, "a.txt", "alpha");
        s.build_request();

        s.parse_response("F:1:p:zzz.txt\nd:0:=3\t+x\nF:1:p:a.txt\nd:0:=5\t+?\n\n");
        assert_eq!(a.get(), "alpha?");
    }

    #[test]
    fn test_wrong_prefix_skipped() {
        let mut s = session();
        let a = share(&mut s, "a.txt", "alpha");
        s.build_request();
        s.parse_response("F:1:q:a.txt\nd:0:=5\t+?\n\n");
        assert_eq!(a.get(), "alpha");
        assert!(s.document("a.txt").unwrap().delta_ok());
    }

    #[test]
    fn test_unknown_tag_skips_line_only() {
        let mut s = session();
        let a = share(&mut s, "a.txt", "alpha");
        s.build_request();
        s.parse_response("F:1:p:a.txt\nx:future extension\nd:0:=5\t+!\n\n");
        assert_eq!(a.get(), "alpha!");
        assert!(s.document("a.txt").unwrap().delta_ok());
    }

    #[test]
    fn test_bad_header_does_not_leak_into_previous_block() {
        let mut s = session();
        share(&mut s, "a.txt", "alpha");
        s.build_request();
        s.parse_response("F:1:p:a.txt\nF:x:p:a.txt\nd:0:=5\t+!\n\n");
        assert!(s.document("a.txt").unwrap().delta_ok());
    }

    #[test]
    fn test_version_mismatch_resyncs_with_raw() {
        let mut s = session();
        let a = share(&mut s, "a.txt", "alpha");
        s.build_request();
        s.parse_response("F:1:p:a.txt\n\n");

        s.parse_response("F:9:p:a.txt\nd:0:=5\t+!\n\n");
        assert!(!s.document("a.txt").unwrap().delta_ok());

        a.set("alpha beta");
        let req = s.build_request();
        assert!(req.body.contains("\nr:2:alpha beta\n"));
        assert!(!req.body.contains("\nd:"));
    }

    #[test]
    fn test_server_nullify_unshares() {
        let mut s = session();
        share(&mut s, "a.txt", "alpha");
        share(&mut s, "b.txt", "beta");
        s.build_request();

        let outcome = s.parse_response("N:p:a.txt\n\n");
        let ids: Vec<&str> = outcome.unshared.iter().map(|cp| cp.id.as_str()).collect();
        assert_eq!(ids, vec!["a.txt"]);
        assert_eq!(outcome.unshared[0].shadow_text, "alpha");
        assert!(!s.contains("a.txt"));
        assert!(s.contains("b.txt"));
    }

    #[test]
    fn test_nullify_all() {
        let mut s = session();
        share(&mut s, "a.txt", "alpha");
        share(&mut s, "b.txt", "beta");
        s.nullify_all();

        let req = s.build_request();
        assert_eq!(req.body, "u:tester\nN:p:a.txt\nN:p:b.txt\n\n");
        assert!(s.is_empty());
    }

    #[test]
    fn test_message_handler_receives_payloads() {
        let mut s = session();
        share(&mut s, "a.txt", "alpha");
        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        s.set_message_handler(Some(Arc::new(move |id: &str, body: &str| {
            sink.lock().push((id.to_owned(), body.to_owned()));
        })));
        s.build_request();

        s.parse_response("F:1:p:a.txt\nm:%7B%22nickname%22%3A%22bo%22%7D\n\n");
        assert_eq!(
            seen.lock().as_slice(),
            &[("a.txt".to_string(), "{\"nickname\":\"bo\"}".to_string())]
        );
    }

    #[test]
    fn test_local_change_speeds_up_interval() {
        let mut s = session();
        let a = share(&mut s, "a.txt", "alpha");
        s.build_request();
        s.parse_response("F:1:p:a.txt\n\n");
        s.recompute_interval();

        a.set("alpha!");
        s.build_request();
        assert_eq!(s.change_flags(), (true, false));
        assert_eq!(s.recompute_interval(), Duration::from_millis(1000));
    }

    #[test]
    fn test_decode_failure_requests_immediate_cycle() {
        let mut s = session();
        share(&mut s, "a.txt", "alpha");
        s.build_request();
        s.parse_response("F:1:p:a.txt\nd:0:=50\n\n");
        assert!(!s.document("a.txt").unwrap().delta_ok());
        assert_eq!(s.recompute_interval(), Duration::from_millis(1000));
    }

    #[test]
    fn test_unshare_returns_checkpoint() {
        let mut s = session();
        share(&mut s, "a.txt", "alpha");
        s.build_request();
        let checkpoint = s.unshare("a.txt").unwrap();
        assert_eq!(checkpoint.shadow_text, "alpha");
        assert_eq!(checkpoint.client_version, 1);
        assert!(s.unshare("a.txt").is_none());
    }
}
