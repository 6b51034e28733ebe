//! # textsync-sync: differential synchronization of shared text
//!
//! Keeps plain-text buffers in step with a sync gateway by repeatedly
//! exchanging small diffs against a per-document shadow copy.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐  share / unshare   ┌─────────────────┐
//! │ Host editor    │ ─────────────────► │ SessionRegistry │
//! │(LiveTextSource)│                    └────────┬────────┘
//! └───────▲────────┘                            │ one per endpoint
//!         │ fuzzy patch                ┌────────┴────────┐     Transport
//!         │                            │ SyncScheduler   │ ◄──────────────► gateway
//! ┌───────┴────────┐                   │  └ SyncSession  │   ws:// | http://
//! │ ShadowDocument │ ◄──────────────── │     (multiplex) │
//! │ shadow + stack │                   └─────────────────┘
//! └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`diff`]: diff / patch / delta codec (`TextDiffPatch`, `DiffMatchPatch`)
//! - [`protocol`]: line-oriented wire records
//! - [`document`]: per-document reconciliation state machine
//! - [`session`]: request building and response demultiplexing
//! - [`interval`]: adaptive cycle pacing
//! - [`scheduler`]: the cycle loop
//! - [`transport`]: WebSocket and HTTP gateways
//! - [`registry`]: application root owning sessions and schedulers
//! - [`checkpoint`]: resumable shadow state
//! - [`presence`]: ghost cursors over application messages
//! - [`config`]: settings and repository descriptors

pub mod checkpoint;
pub mod config;
pub mod diff;
pub mod document;
pub mod error;
pub mod interval;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use checkpoint::{
    CheckpointStore, DocumentCheckpoint, FileCheckpointStore, MemoryCheckpointStore, StoreError,
};
pub use config::{ConfigError, RepoDescriptor, SyncConfig, DESCRIPTOR_FILE};
pub use diff::{DecodeError, Diff, DiffMatchPatch, DiffOp, Patch, PatchOutcome, TextDiffPatch};
pub use document::{LiveText, LiveTextError, LiveTextSource, ShadowDocument};
pub use error::SyncError;
pub use interval::{FocusBoost, IntervalController, IntervalHook, SpeedProfile};
pub use presence::{GhostCursor, PresenceMessage, PresenceRoom, CURSOR_TIMEOUT};
pub use protocol::{ProtocolError, Record};
pub use registry::{SessionRegistry, SyncEndpoint};
pub use scheduler::{CycleReport, SchedulerHandle, SyncScheduler, UnshareObserver};
pub use session::{MessageHandler, ResponseOutcome, SyncRequest, SyncSession};
pub use transport::{
    DefaultTransportFactory, HttpTransport, Transport, TransportError, TransportFactory, WsTransport,
};
