//! In-process reference gateway for integration tests.
//!
//! Keeps one master text per file and one view (shadow + version pair) per
//! `(user, file)`, answering each request packet the way a differential
//! sync server does: apply the client's edits to the view shadow and the
//! master, then reply with the difference between the view and the master.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use textsync_sync::diff::{target_text, DiffMatchPatch, TextDiffPatch};
use textsync_sync::protocol::{encode_packet, packet_lines, Record};
use textsync_sync::{LiveTextError, LiveTextSource, Transport, TransportError};

#[derive(Debug, Default, Clone)]
struct View {
    shadow: String,
    client_version: u64,
    server_version: u64,
    delta_ok: bool,
}

#[derive(Default)]
struct State {
    masters: HashMap<String, String>,
    views: HashMap<(String, String), View>,
    /// Pending application messages per file: (sender, body).
    messages: HashMap<String, Vec<(String, String)>>,
    requests: usize,
}

/// Reference differential-sync gateway.
#[derive(Default)]
pub struct ReferenceServer {
    dmp: DiffMatchPatch,
    state: Mutex<State>,
}

impl ReferenceServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn master(&self, file: &str) -> Option<String> {
        self.state.lock().masters.get(file).cloned()
    }

    pub fn set_master(&self, file: &str, text: &str) {
        self.state.lock().masters.insert(file.to_owned(), text.to_owned());
    }

    pub fn requests(&self) -> usize {
        self.state.lock().requests
    }

    /// Answer one request packet.
    pub fn handle(&self, request: &str) -> String {
        let mut state = self.state.lock();
        state.requests += 1;

        let Ok(lines) = packet_lines(request) else {
            return "\n\n".to_owned();
        };

        let mut user = String::new();
        let mut order: Vec<String> = Vec::new();
        let mut current: Option<String> = None;

        for line in lines {
            let Ok(record) = Record::parse(line) else { continue };
            match record {
                Record::Username(name) => user = name,
                Record::File { version, id, .. } => {
                    let view = state.views.entry((user.clone(), id.clone())).or_default();
                    if view.server_version != version {
                        view.delta_ok = false;
                    }
                    if !order.contains(&id) {
                        order.push(id.clone());
                    }
                    current = Some(id);
                }
                Record::Nullify { id } => {
                    state.views.remove(&(user.clone(), id));
                    current = None;
                }
                Record::Raw { version, text, force } => {
                    let Some(file) = current.clone() else { continue };
                    let view = state.views.entry((user.clone(), file.clone())).or_default();
                    view.shadow = text.clone();
                    view.client_version = version;
                    view.delta_ok = true;
                    let master = state.masters.entry(file).or_default();
                    if force || master.is_empty() {
                        *master = text;
                    }
                }
                Record::Delta { version, delta, .. } => {
                    let Some(file) = current.clone() else { continue };
                    let key = (user.clone(), file.clone());
                    let view = state.views.entry(key).or_default();
                    if version < view.client_version {
                        continue;
                    }
                    if version > view.client_version {
                        view.delta_ok = false;
                        continue;
                    }
                    let Ok(diffs) = self.dmp.delta_decode(&view.shadow, &delta) else {
                        view.delta_ok = false;
                        continue;
                    };
                    let patches = self.dmp.patch_make(&view.shadow, &diffs);
                    view.shadow = target_text(&diffs);
                    view.client_version += 1;
                    let master = state.masters.entry(file).or_default();
                    let outcome = self.dmp.patch_apply(&patches, master, &[]);
                    *master = outcome.text;
                }
                Record::Message { body, .. } => {
                    let Some(file) = current.clone() else { continue };
                    state.messages.entry(file).or_default().push((user.clone(), body));
                }
            }
        }

        let mut records = Vec::new();
        for file in order {
            let master = state.masters.get(&file).cloned().unwrap_or_default();
            let Some(view) = state.views.get_mut(&(user.clone(), file.clone())) else {
                continue;
            };
            records.push(Record::header(view.client_version, file.clone()));
            if view.delta_ok {
                if view.shadow != master {
                    let mut diffs = self.dmp.diff(&view.shadow, &master);
                    self.dmp.cleanup(&mut diffs);
                    records.push(Record::Delta {
                        version: view.server_version,
                        delta: self.dmp.delta_encode(&diffs),
                        merge: true,
                    });
                    view.server_version += 1;
                    view.shadow = master;
                }
            } else {
                records.push(Record::Raw {
                    version: view.server_version,
                    text: master.clone(),
                    force: true,
                });
                view.shadow = master;
                view.delta_ok = true;
            }

            let others: Vec<(String, String)> = state
                .messages
                .get(&file)
                .map(|all| all.iter().filter(|(sender, _)| *sender != user).cloned().collect())
                .unwrap_or_default();
            for (sender, body) in others {
                // Fan out keyed by participant, the shape presence rooms expect.
                let body = format!("{{{}:{body}}}", serde_json::Value::String(sender));
                records.push(Record::Message { body, upper: false });
            }
        }
        encode_packet(&records)
    }
}

/// Transport calling straight into a [`ReferenceServer`].
pub struct LoopbackTransport {
    pub server: Arc<ReferenceServer>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn transmit(&self, body: String) -> Result<String, TransportError> {
        Ok(self.server.handle(&body))
    }
}

/// Plain shared buffer standing in for an editor.
#[derive(Default)]
pub struct Buffer {
    text: Mutex<String>,
    cursors: Mutex<Vec<usize>>,
    message: Mutex<Option<String>>,
}

impl Buffer {
    pub fn new(text: &str) -> Arc<Self> {
        let buffer = Self::default();
        *buffer.text.lock() = text.to_owned();
        Arc::new(buffer)
    }

    pub fn get(&self) -> String {
        self.text.lock().clone()
    }

    pub fn set_message(&self, message: Option<String>) {
        *self.message.lock() = message;
    }
}

impl LiveTextSource for Buffer {
    fn text(&self) -> String {
        self.get()
    }

    fn set_text(&self, text: &str) -> Result<(), LiveTextError> {
        *self.text.lock() = text.to_owned();
        Ok(())
    }

    fn cursor_offsets(&self) -> Vec<usize> {
        self.cursors.lock().clone()
    }

    fn set_cursor_offsets(&self, offsets: &[usize]) {
        *self.cursors.lock() = offsets.to_vec();
    }

    fn application_message(&self) -> Option<String> {
        self.message.lock().clone()
    }
}
