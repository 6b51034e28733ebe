//! Application root: one session and scheduler per gateway endpoint.
//!
//! ```text
//! SessionRegistry
//!   ├── ws://a/sync  "proj:" ─► SyncSession ◄── SyncScheduler (task)
//!   │                             ├── README.md
//!   │                             └── src/lib.rs
//!   └── http://b/q   ""      ─► SyncSession ◄── SyncScheduler (task)
//!                                 └── notes.txt
//! ```
//!
//! A scheduler is spawned on the first share against its endpoint and
//! stopped when the last document there is unshared, by the host or by the
//! server. Unsharing writes a checkpoint; sharing the same id again resumes
//! from it.
//!
//! Lock order is registry state, then session. Schedulers only ever take
//! the session lock.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use indexmap::map::Entry;
use indexmap::IndexMap;
use tokio::sync::Mutex;

use crate::checkpoint::{CheckpointStore, DocumentCheckpoint};
use crate::config::{RepoDescriptor, SyncConfig};
use crate::document::{LiveText, LiveTextSource};
use crate::error::SyncError;
use crate::interval::SpeedProfile;
use crate::scheduler::{SchedulerHandle, SyncScheduler, UnshareObserver};
use crate::session::{MessageHandler, SyncSession};
use crate::transport::{DefaultTransportFactory, Transport, TransportFactory};

/// Where a document is synced: gateway URL plus the prefix its ids carry
/// on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncEndpoint {
    pub url: String,
    pub id_prefix: String,
}

impl SyncEndpoint {
    pub fn new(url: impl Into<String>, id_prefix: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            id_prefix: id_prefix.into(),
        }
    }
}

impl From<&RepoDescriptor> for SyncEndpoint {
    fn from(descriptor: &RepoDescriptor) -> Self {
        Self::new(descriptor.gateway.clone(), descriptor.id.clone())
    }
}

struct EndpointSession {
    session: Arc<Mutex<SyncSession>>,
    transport: Arc<dyn Transport>,
    scheduler: Option<SchedulerHandle>,
}

impl EndpointSession {
    fn stop_scheduler(&mut self) -> Option<SchedulerHandle> {
        let handle = self.scheduler.take()?;
        handle.stop();
        Some(handle)
    }
}

struct RegistryState {
    sessions: IndexMap<SyncEndpoint, EndpointSession>,
    enabled: bool,
    profile: Option<SpeedProfile>,
    message_handler: Option<MessageHandler>,
}

struct RegistryInner {
    config: SyncConfig,
    transports: Arc<dyn TransportFactory>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    state: Mutex<RegistryState>,
}

impl RegistryInner {
    fn load_checkpoint(&self, id: &str) -> Option<DocumentCheckpoint> {
        let store = self.checkpoints.as_ref()?;
        match store.load(id) {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                log::warn!("could not load checkpoint for {id}: {err}");
                None
            }
        }
    }

    fn save_checkpoint(&self, checkpoint: &DocumentCheckpoint) -> Result<(), SyncError> {
        if let Some(store) = &self.checkpoints {
            store.save(checkpoint)?;
        }
        Ok(())
    }

    /// Close `endpoint` if its session has no documents left.
    async fn close_if_empty(&self, state: &mut RegistryState, endpoint: &SyncEndpoint) {
        let empty = match state.sessions.get(endpoint) {
            Some(entry) => entry.session.lock().await.is_empty(),
            None => false,
        };
        if !empty {
            return;
        }
        if let Some(mut entry) = state.sessions.shift_remove(endpoint) {
            entry.stop_scheduler();
            log::info!("closed session for {}", endpoint.url);
        }
    }
}

/// Bookkeeping for documents the server unshared on one endpoint.
struct EndpointReaper {
    registry: Weak<RegistryInner>,
    endpoint: SyncEndpoint,
}

#[async_trait]
impl UnshareObserver for EndpointReaper {
    async fn server_unshared(&self, checkpoints: Vec<DocumentCheckpoint>) {
        let Some(inner) = self.registry.upgrade() else { return };
        let mut state = inner.state.lock().await;
        inner.close_if_empty(&mut state, &self.endpoint).await;
        drop(state);

        for checkpoint in &checkpoints {
            if let Err(err) = inner.save_checkpoint(checkpoint) {
                log::error!("failed to checkpoint {}: {err}", checkpoint.id);
            }
        }
    }
}

pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(config: SyncConfig) -> Self {
        let enabled = config.enabled;
        Self {
            inner: Arc::new(RegistryInner {
                config,
                transports: Arc::new(DefaultTransportFactory),
                checkpoints: None,
                state: Mutex::new(RegistryState {
                    sessions: IndexMap::new(),
                    enabled,
                    profile: None,
                    message_handler: None,
                }),
            }),
        }
    }

    // Builders run before anything is shared, while `inner` is unshared.

    pub fn with_transports(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.transports = factory;
        }
        self
    }

    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.checkpoints = Some(store);
        }
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Start syncing `source` as `id` against `endpoint`.
    ///
    /// Returns the wrapper the host must route its own edits through (see
    /// [`LiveText::user_edit`]). Sharing an id that is already shared
    /// returns the existing wrapper.
    pub async fn share_document(
        &self,
        id: &str,
        endpoint: &SyncEndpoint,
        source: Arc<dyn LiveTextSource>,
    ) -> Result<Arc<LiveText>, SyncError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        for entry in state.sessions.values() {
            if let Some(doc) = entry.session.lock().await.document(id) {
                log::warn!("{id} is already shared");
                return Ok(Arc::clone(doc.live()));
            }
        }

        let checkpoint = inner.load_checkpoint(id);
        let enabled = state.enabled;
        let handler = state.message_handler.clone();
        let profile = state.profile;
        let entry = match state.sessions.entry(endpoint.clone()) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                let transport = inner.transports.create(&endpoint.url)?;
                let mut session = SyncSession::new(&inner.config, endpoint.id_prefix.clone());
                session.set_message_handler(handler);
                if let Some(profile) = profile {
                    session.set_speed_profile(profile);
                }
                log::info!("opened session for {}", endpoint.url);
                vacant.insert(EndpointSession {
                    session: Arc::new(Mutex::new(session)),
                    transport,
                    scheduler: None,
                })
            }
        };

        let live = Arc::new(LiveText::new(source));
        entry
            .session
            .lock()
            .await
            .share(id, Arc::clone(&live), checkpoint.as_ref());

        // Checked after the share: a loop that found the session empty
        // flagged its exit before releasing the session lock.
        match &entry.scheduler {
            Some(handle) if handle.is_running() => handle.wake(),
            _ => {
                let reaper = EndpointReaper {
                    registry: Arc::downgrade(&self.inner),
                    endpoint: endpoint.clone(),
                };
                let scheduler =
                    SyncScheduler::new(Arc::clone(&entry.session), Arc::clone(&entry.transport), &inner.config)
                        .enabled(enabled)
                        .with_observer(Arc::new(reaper));
                entry.scheduler = Some(scheduler.spawn());
            }
        }
        Ok(live)
    }

    /// Stop syncing `id` and checkpoint its final state. Returns whether
    /// the id was shared.
    pub async fn unshare_document(&self, id: &str) -> Result<bool, SyncError> {
        let mut state = self.inner.state.lock().await;

        let mut found = None;
        for (endpoint, entry) in state.sessions.iter() {
            if let Some(checkpoint) = entry.session.lock().await.unshare(id) {
                found = Some((endpoint.clone(), checkpoint));
                break;
            }
        }
        let Some((endpoint, checkpoint)) = found else {
            return Ok(false);
        };

        self.inner.close_if_empty(&mut state, &endpoint).await;
        drop(state);

        self.inner.save_checkpoint(&checkpoint)?;
        Ok(true)
    }

    pub async fn set_enabled(&self, enabled: bool) {
        let mut state = self.inner.state.lock().await;
        state.enabled = enabled;
        for entry in state.sessions.values() {
            if let Some(handle) = &entry.scheduler {
                handle.set_enabled(enabled);
            }
        }
        log::info!("sync {}", if enabled { "enabled" } else { "disabled" });
    }

    pub async fn set_speed_profile(&self, profile: SpeedProfile) {
        let mut state = self.inner.state.lock().await;
        state.profile = Some(profile);
        for entry in state.sessions.values() {
            entry.session.lock().await.set_speed_profile(profile);
        }
    }

    /// Receive every inbound `m:`/`M:` payload as `(document id, payload)`.
    pub async fn on_application_message(&self, handler: MessageHandler) {
        let mut state = self.inner.state.lock().await;
        state.message_handler = Some(Arc::clone(&handler));
        for entry in state.sessions.values() {
            entry.session.lock().await.set_message_handler(Some(Arc::clone(&handler)));
        }
    }

    /// Forward an editor focus change to the session syncing `id`.
    pub async fn focus_changed(&self, id: &str, focused: bool) -> bool {
        let state = self.inner.state.lock().await;
        for entry in state.sessions.values() {
            let mut session = entry.session.lock().await;
            if session.contains(id) {
                session.on_focus_changed(focused);
                return true;
            }
        }
        false
    }

    /// Ids of every shared document, grouped by endpoint.
    pub async fn shared_documents(&self) -> Vec<(SyncEndpoint, Vec<String>)> {
        let state = self.inner.state.lock().await;
        let mut out = Vec::with_capacity(state.sessions.len());
        for (endpoint, entry) in state.sessions.iter() {
            let session = entry.session.lock().await;
            out.push((endpoint.clone(), session.document_ids().map(str::to_owned).collect()));
        }
        out
    }

    pub async fn session_count(&self) -> usize {
        self.inner.state.lock().await.sessions.len()
    }

    /// Stop every scheduler, checkpoint every document and wait for the
    /// scheduler tasks to finish. The first checkpoint failure is returned
    /// after everything has been stopped.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        let sessions = std::mem::take(&mut self.inner.state.lock().await.sessions);

        let mut handles = Vec::new();
        let mut checkpoints = Vec::new();
        for (endpoint, mut entry) in sessions {
            handles.extend(entry.stop_scheduler());
            let mut session = entry.session.lock().await;
            let ids: Vec<String> = session.document_ids().map(str::to_owned).collect();
            checkpoints.extend(ids.iter().filter_map(|id| session.unshare(id)));
            log::info!("closed session for {}", endpoint.url);
        }

        let mut first_error = None;
        for checkpoint in &checkpoints {
            if let Err(err) = self.inner.save_checkpoint(checkpoint) {
                log::error!("failed to checkpoint {}: {err}", checkpoint.id);
                first_error.get_or_insert(err);
            }
        }
        for handle in handles {
            handle.join().await;
        }
        log::info!("registry shut down ({} documents checkpointed)", checkpoints.len());

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("config", &self.inner.config)
            .field("checkpoints", &self.inner.checkpoints.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::document::tests::MemoryText;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::time::Duration;

    /// Records every request body and acks whatever header it saw.
    #[derive(Default)]
    struct Recorder {
        bodies: SyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn transmit(&self, body: String) -> Result<String, TransportError> {
            self.bodies.lock().push(body);
            Ok("\n\n".to_owned())
        }
    }

    /// Tells the client to stop sharing `doc` on every exchange.
    #[derive(Default)]
    struct Nullifier {
        calls: SyncMutex<usize>,
    }

    #[async_trait]
    impl Transport for Nullifier {
        async fn transmit(&self, _body: String) -> Result<String, TransportError> {
            *self.calls.lock() += 1;
            Ok("N:doc\n\n".to_owned())
        }
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    fn config() -> SyncConfig {
        SyncConfig {
            username: Some("reg".into()),
            min_sync_interval: 10,
            sync_interval: 20,
            max_sync_interval: 40,
            ..Default::default()
        }
    }

    fn registry(recorder: Arc<Recorder>) -> (SessionRegistry, Arc<MemoryCheckpointStore>) {
        let store = Arc::new(MemoryCheckpointStore::new());
        let factory = move |_: &str| -> Result<Arc<dyn Transport>, TransportError> {
            Ok(recorder.clone() as Arc<dyn Transport>)
        };
        let registry = SessionRegistry::new(config())
            .with_transports(Arc::new(factory))
            .with_checkpoints(store.clone());
        (registry, store)
    }

    #[tokio::test]
    async fn test_share_groups_by_endpoint() {
        let recorder = Arc::new(Recorder::default());
        let (registry, _) = registry(recorder.clone());
        let a = SyncEndpoint::new("ws://a/sync", "a:");
        let b = SyncEndpoint::new("ws://b/sync", "");

        registry.share_document("one", &a, MemoryText::new("1")).await.unwrap();
        registry.share_document("two", &a, MemoryText::new("2")).await.unwrap();
        registry.share_document("three", &b, MemoryText::new("3")).await.unwrap();

        assert_eq!(registry.session_count().await, 2);
        let shared = registry.shared_documents().await;
        assert_eq!(shared[0].1, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(shared[1].1, vec!["three".to_string()]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(recorder.bodies.lock().iter().any(|b| b.contains("F:0:a:one\n")));
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_share_twice_returns_existing() {
        let (registry, _) = registry(Arc::new(Recorder::default()));
        let ep = SyncEndpoint::new("ws://a/sync", "");
        let first = registry.share_document("doc", &ep, MemoryText::new("x")).await.unwrap();
        let second = registry.share_document("doc", &ep, MemoryText::new("y")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unshare_checkpoints_and_closes_session() {
        let (registry, store) = registry(Arc::new(Recorder::default()));
        let ep = SyncEndpoint::new("ws://a/sync", "");
        registry.share_document("doc", &ep, MemoryText::new("hello")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(registry.unshare_document("doc").await.unwrap());
        assert!(!registry.unshare_document("doc").await.unwrap());
        assert_eq!(registry.session_count().await, 0);

        let checkpoint = store.load("doc").unwrap().unwrap();
        assert_eq!(checkpoint.shadow_text, "hello");
        assert_eq!(checkpoint.client_version, 1);
    }

    #[tokio::test]
    async fn test_reshare_resumes_from_checkpoint() {
        let recorder = Arc::new(Recorder::default());
        let (registry, store) = registry(recorder.clone());
        store
            .save(&DocumentCheckpoint {
                id: "doc".into(),
                shadow_text: "old".into(),
                client_version: 6,
                server_version: 4,
            })
            .unwrap();

        let ep = SyncEndpoint::new("ws://a/sync", "");
        registry.share_document("doc", &ep, MemoryText::new("new")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let first = recorder.bodies.lock()[0].clone();
        assert_eq!(first, "u:reg\nF:4:doc\nr:7:new\n\n");
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_registry_does_not_transmit() {
        let recorder = Arc::new(Recorder::default());
        let (registry, _) = registry(recorder.clone());
        registry.set_enabled(false).await;

        let ep = SyncEndpoint::new("ws://a/sync", "");
        registry.share_document("doc", &ep, MemoryText::new("x")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(recorder.bodies.lock().is_empty());

        registry.set_enabled(true).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!recorder.bodies.lock().is_empty());
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_focus_routes_to_owning_session() {
        let (registry, _) = registry(Arc::new(Recorder::default()));
        let ep = SyncEndpoint::new("ws://a/sync", "");
        registry.share_document("doc", &ep, MemoryText::new("x")).await.unwrap();
        assert!(registry.focus_changed("doc", true).await);
        assert!(!registry.focus_changed("missing", true).await);
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_checkpoints_everything() {
        let (registry, store) = registry(Arc::new(Recorder::default()));
        let ep = SyncEndpoint::new("ws://a/sync", "");
        registry.share_document("one", &ep, MemoryText::new("1")).await.unwrap();
        registry.share_document("two", &ep, MemoryText::new("2")).await.unwrap();

        registry.shutdown().await.unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_unshare_closes_session_and_checkpoints() {
        let nullifier = Arc::new(Nullifier::default());
        let store = Arc::new(MemoryCheckpointStore::new());
        let transport = nullifier.clone();
        let factory = move |_: &str| -> Result<Arc<dyn Transport>, TransportError> {
            Ok(transport.clone() as Arc<dyn Transport>)
        };
        let registry = SessionRegistry::new(config())
            .with_transports(Arc::new(factory))
            .with_checkpoints(store.clone());
        let ep = SyncEndpoint::new("ws://a/sync", "");

        registry.share_document("doc", &ep, MemoryText::new("hello")).await.unwrap();
        assert!(eventually(|| store.len() == 1).await);
        assert_eq!(registry.session_count().await, 0);
        assert!(registry.shared_documents().await.is_empty());
        assert!(!registry.unshare_document("doc").await.unwrap());
        let checkpoint = store.load("doc").unwrap().unwrap();
        assert_eq!(checkpoint.shadow_text, "hello");
        assert_eq!(checkpoint.client_version, 1);

        // Sharing again gets a fresh scheduler that resumes the versions.
        registry.share_document("doc", &ep, MemoryText::new("hello again")).await.unwrap();
        assert!(
            eventually(|| {
                matches!(store.load("doc"), Ok(Some(cp)) if cp.client_version == 2 && cp.shadow_text == "hello again")
            })
            .await
        );
        assert_eq!(*nullifier.calls.lock(), 2);
        assert_eq!(registry.session_count().await, 0);
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_endpoint_rejected() {
        let registry = SessionRegistry::new(config());
        let ep = SyncEndpoint::new("gopher://old", "");
        let err = registry
            .share_document("doc", &ep, MemoryText::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Transport(TransportError::UnsupportedScheme(_))));
        assert_eq!(registry.session_count().await, 0);
    }
}
