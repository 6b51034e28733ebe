//! Engine settings and repository descriptors.
//!
//! `SyncConfig` is plain camelCase JSON; every field is optional:
//! ```json
//! { "minSyncInterval": 400, "maxSyncInterval": 1500, "username": "ann" }
//! ```
//!
//! A repository descriptor (`textsync.settings`) marks a directory tree as
//! shared with one gateway:
//! ```json
//! {
//!   "gateway": "ws://sync.example.org/textsync",
//!   "id": "proj:",
//!   "include": ["**/*.md", "src/**"],
//!   "exclude": ["target/**"]
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::interval::SpeedProfile;

/// File name searched for by [`RepoDescriptor::discover`].
pub const DESCRIPTOR_FILE: &str = "textsync.settings";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid glob pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("minimum sync interval {min} ms exceeds maximum {max} ms")]
    IntervalBounds { min: u64, max: u64 },
    #[error("descriptor has an empty gateway")]
    MissingGateway,
}

// ───────────────────────────────────────────────────────────────────
// SyncConfig
// ───────────────────────────────────────────────────────────────────

/// Tunables for sessions and schedulers. Intervals are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Bound on one request/response exchange.
    pub timeout_interval: u64,
    pub min_sync_interval: u64,
    pub max_sync_interval: u64,
    /// Starting interval.
    pub sync_interval: u64,
    /// Session username; a random id of `id_size` chars when absent.
    pub username: Option<String>,
    pub id_size: usize,
    pub enabled: bool,
    /// Poll period while synchronization is disabled.
    pub disabled_poll_interval: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout_interval: 30_000,
            min_sync_interval: 1_000,
            max_sync_interval: 10_000,
            sync_interval: 2_000,
            username: None,
            id_size: 16,
            enabled: true,
            disabled_poll_interval: 1_000,
        }
    }
}

impl SyncConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_sync_interval > self.max_sync_interval {
            return Err(ConfigError::IntervalBounds {
                min: self.min_sync_interval,
                max: self.max_sync_interval,
            });
        }
        Ok(())
    }

    /// Replace the interval bounds and starting point with a preset.
    pub fn apply_profile(&mut self, profile: SpeedProfile) {
        self.min_sync_interval = profile.min;
        self.sync_interval = profile.normal;
        self.max_sync_interval = profile.max;
    }

    pub fn speed_profile(&self) -> SpeedProfile {
        SpeedProfile {
            min: self.min_sync_interval,
            normal: self.sync_interval,
            max: self.max_sync_interval,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_interval)
    }

    pub fn disabled_poll(&self) -> Duration {
        Duration::from_millis(self.disabled_poll_interval)
    }

    /// Configured username, or a fresh random id.
    pub fn session_username(&self) -> String {
        match &self.username {
            Some(name) if !name.is_empty() => name.clone(),
            _ => random_id(self.id_size),
        }
    }
}

/// Random alphanumeric id of `len` characters (at most 32).
pub fn random_id(len: usize) -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(len.clamp(1, 32));
    id
}

// ───────────────────────────────────────────────────────────────────
// RepoDescriptor
// ───────────────────────────────────────────────────────────────────

/// A `textsync.settings` file and the directory it governs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoDescriptor {
    /// Sync endpoint URL.
    pub gateway: String,
    /// Prefix put in front of every document id on the wire.
    #[serde(default)]
    pub id: String,
    /// Globs relative to the root. Empty means everything.
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(skip)]
    root: PathBuf,
}

impl RepoDescriptor {
    /// Walk up from `path` to the nearest directory holding a descriptor.
    pub fn discover(path: &Path) -> Result<Option<Self>, ConfigError> {
        let start = if path.is_dir() { path } else { path.parent().unwrap_or(path) };
        for dir in start.ancestors() {
            if dir.join(DESCRIPTOR_FILE).is_file() {
                return Self::load(dir).map(Some);
            }
        }
        Ok(None)
    }

    /// Load the descriptor in `dir`.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(DESCRIPTOR_FILE);
        let json = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let mut descriptor: Self = serde_json::from_str(&json)?;
        if descriptor.gateway.trim().is_empty() {
            return Err(ConfigError::MissingGateway);
        }
        for pattern in descriptor.include.iter().chain(&descriptor.exclude) {
            glob::Pattern::new(pattern).map_err(|source| ConfigError::Pattern {
                pattern: pattern.clone(),
                source,
            })?;
        }
        descriptor.root = dir.to_path_buf();
        Ok(descriptor)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Document id for `path`: its `/`-separated path below the root.
    pub fn relative_id(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }

    /// Whether `path` is included and not excluded.
    pub fn owns(&self, path: &Path) -> bool {
        let Some(id) = self.relative_id(path) else {
            return false;
        };
        if id == DESCRIPTOR_FILE {
            return false;
        }
        let matches = |patterns: &[String]| {
            patterns.iter().any(|p| {
                glob::Pattern::new(p)
                    .map(|pattern| pattern.matches(&id))
                    .unwrap_or(false)
            })
        };
        (self.include.is_empty() || matches(&self.include)) && !matches(&self.exclude)
    }

    /// Every regular file below the root this descriptor owns, sorted.
    pub fn owned_files(&self) -> Result<Vec<PathBuf>, ConfigError> {
        let root = glob::Pattern::escape(&self.root.to_string_lossy());
        let pattern = format!("{root}/**/*");
        let walk = glob::glob(&pattern).map_err(|source| ConfigError::Pattern {
            pattern: pattern.clone(),
            source,
        })?;

        let mut files = Vec::new();
        for entry in walk {
            match entry {
                Ok(path) if path.is_file() && self.owns(&path) => files.push(path),
                Ok(_) => {}
                Err(err) => log::warn!("skipping unreadable path: {err}"),
            }
        }
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.timeout_interval, 30_000);
        assert_eq!(config.min_sync_interval, 1_000);
        assert_eq!(config.max_sync_interval, 10_000);
        assert_eq!(config.sync_interval, 2_000);
        assert!(config.enabled);
        assert_eq!(SyncConfig::from_json("{}").unwrap(), config);
    }

    #[test]
    fn test_camel_case_json() {
        let config = SyncConfig::from_json(r#"{"minSyncInterval": 200, "maxSyncInterval": 800, "username": "ann"}"#).unwrap();
        assert_eq!(config.min_sync_interval, 200);
        assert_eq!(config.max_sync_interval, 800);
        assert_eq!(config.session_username(), "ann");
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let err = SyncConfig::from_json(r#"{"minSyncInterval": 5000, "maxSyncInterval": 100}"#).unwrap_err();
        assert!(matches!(err, ConfigError::IntervalBounds { min: 5000, max: 100 }));
    }

    #[test]
    fn test_random_username_length() {
        let config = SyncConfig { id_size: 8, ..Default::default() };
        let a = config.session_username();
        assert_eq!(a.len(), 8);
        assert_ne!(a, config.session_username());
    }

    #[test]
    fn test_apply_profile() {
        let mut config = SyncConfig::default();
        config.apply_profile(SpeedProfile::FAST);
        assert_eq!(config.speed_profile(), SpeedProfile::FAST);
    }

    fn write_descriptor(dir: &Path, json: &str) {
        std::fs::write(dir.join(DESCRIPTOR_FILE), json).unwrap();
    }

    #[test]
    fn test_discover_walks_up() {
        let tmp = tempfile::tempdir().unwrap();
        write_descriptor(tmp.path(), r#"{"gateway": "ws://localhost:9999", "id": "p:"}"#);
        let nested = tmp.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        let file = nested.join("notes.md");
        std::fs::write(&file, "x").unwrap();

        let descriptor = RepoDescriptor::discover(&file).unwrap().unwrap();
        assert_eq!(descriptor.root(), tmp.path());
        assert_eq!(descriptor.id, "p:");
        assert_eq!(descriptor.relative_id(&file).as_deref(), Some("a/b/notes.md"));
    }

    #[test]
    fn test_load_missing_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(RepoDescriptor::load(tmp.path()), Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_owns_include_exclude() {
        let tmp = tempfile::tempdir().unwrap();
        write_descriptor(
            tmp.path(),
            r#"{"gateway": "http://h/", "include": ["**/*.md"], "exclude": ["drafts/*"]}"#,
        );
        let descriptor = RepoDescriptor::load(tmp.path()).unwrap();

        assert!(descriptor.owns(&tmp.path().join("readme.md")));
        assert!(descriptor.owns(&tmp.path().join("docs/guide.md")));
        assert!(!descriptor.owns(&tmp.path().join("drafts/wip.md")));
        assert!(!descriptor.owns(&tmp.path().join("main.rs")));
        assert!(!descriptor.owns(Path::new("/elsewhere/readme.md")));
    }

    #[test]
    fn test_empty_include_owns_everything_but_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        write_descriptor(tmp.path(), r#"{"gateway": "http://h/"}"#);
        let descriptor = RepoDescriptor::load(tmp.path()).unwrap();
        assert!(descriptor.owns(&tmp.path().join("any/file.txt")));
        assert!(!descriptor.owns(&tmp.path().join(DESCRIPTOR_FILE)));
    }

    #[test]
    fn test_owned_files_lists_matching_files() {
        let tmp = tempfile::tempdir().unwrap();
        write_descriptor(tmp.path(), r#"{"gateway": "ws://h", "exclude": ["target/**"]}"#);
        std::fs::create_dir_all(tmp.path().join("docs")).unwrap();
        std::fs::create_dir_all(tmp.path().join("target/debug")).unwrap();
        std::fs::write(tmp.path().join("readme.md"), "r").unwrap();
        std::fs::write(tmp.path().join("docs/guide.md"), "g").unwrap();
        std::fs::write(tmp.path().join("target/debug/out.txt"), "o").unwrap();

        let descriptor = RepoDescriptor::load(tmp.path()).unwrap();
        let ids: Vec<String> = descriptor
            .owned_files()
            .unwrap()
            .iter()
            .filter_map(|p| descriptor.relative_id(p))
            .collect();
        assert_eq!(ids, vec!["docs/guide.md".to_string(), "readme.md".to_string()]);
    }

    #[test]
    fn test_bad_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        write_descriptor(tmp.path(), r#"{"gateway": ""}"#);
        assert!(matches!(RepoDescriptor::load(tmp.path()), Err(ConfigError::MissingGateway)));

        write_descriptor(tmp.path(), r#"{"gateway": "ws://h", "include": ["***"]}"#);
        assert!(matches!(RepoDescriptor::load(tmp.path()), Err(ConfigError::Pattern { .. })));
    }
}
