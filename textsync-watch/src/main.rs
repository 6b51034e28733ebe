//! textsync-watch: share a directory tree of text files with a sync gateway.
//!
//! Finds the nearest `textsync.settings` above `--root`, shares every file
//! it owns through one [`SessionRegistry`], and keeps them in sync until
//! Ctrl-C. Shadow state is checkpointed on exit so the next run resumes
//! at the same versions.

mod file_text;
mod presence;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;
use parking_lot::Mutex;

use file_text::FileLiveText;
use presence::WatchPresence;
use textsync_sync::{
    FileCheckpointStore, RepoDescriptor, SessionRegistry, SpeedProfile, SyncConfig, SyncEndpoint,
};

#[derive(Debug, Parser)]
#[command(name = "textsync-watch", version, about = "Share a directory tree of text files with a sync gateway")]
struct Args {
    /// Directory to share; the descriptor is searched from here upwards.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Engine settings (camelCase JSON).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Interval preset.
    #[arg(long, value_parser = ["slow", "normal", "fast"])]
    profile: Option<String>,

    /// Directory for shadow-state checkpoints.
    #[arg(long)]
    checkpoints: Option<PathBuf>,

    /// Name shown to other participants.
    #[arg(long)]
    nickname: Option<String>,
}

fn load_config(args: &Args, descriptor: &RepoDescriptor) -> Result<SyncConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };
    if config.username.is_none() {
        config.username = descriptor.username.clone();
    }
    if let Some(profile) = args.profile.as_deref().and_then(SpeedProfile::by_name) {
        config.apply_profile(profile);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let root = args.root.canonicalize()?;
    let descriptor = RepoDescriptor::discover(&root)?
        .ok_or_else(|| format!("no {} found above {}", textsync_sync::DESCRIPTOR_FILE, root.display()))?;
    let config = load_config(&args, &descriptor)?;
    let endpoint = SyncEndpoint::from(&descriptor);
    info!("syncing {} with {}", descriptor.root().display(), endpoint.url);

    let mut registry = SessionRegistry::new(config.clone());
    if let Some(dir) = &args.checkpoints {
        registry = registry.with_checkpoints(Arc::new(FileCheckpointStore::open(dir)?));
    }

    let presence = Arc::new(Mutex::new(WatchPresence::new()));
    let sink = Arc::clone(&presence);
    registry
        .on_application_message(Arc::new(move |doc_id: &str, body: &str| {
            sink.lock().handle_message(doc_id, body);
        }))
        .await;

    let nickname = args
        .nickname
        .clone()
        .or_else(|| config.username.clone())
        .unwrap_or_else(|| "anonymous".to_owned());
    let announce = presence::announce(&nickname);

    let mut shared = 0usize;
    for path in descriptor.owned_files()? {
        if !path.starts_with(&root) {
            continue;
        }
        let Some(id) = descriptor.relative_id(&path) else { continue };
        let source = match FileLiveText::open(&path, announce.clone()) {
            Ok(source) => Arc::new(source),
            Err(err) => {
                log::warn!("skipping {}: {err}", path.display());
                continue;
            }
        };
        registry.share_document(&id, &endpoint, source).await?;
        shared += 1;
    }
    info!("sharing {shared} file(s); press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    registry.shutdown().await?;
    Ok(())
}
