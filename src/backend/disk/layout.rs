use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs as async_fs;
use tracing::warn;

use crate::backend::StreamIndex;

const LAYOUT_VERSION: u32 = 1;
const VERSION_PREFIX: &str = "v";
const TOMBSTONE_PREFIX: &str = "tombstone-";
pub(super) const TEMP_PREFIX: &str = "tmp_";
pub(super) const INDEX_EXTENSION: &str = "idx";

/// File locations of one store directory.
#[derive(Debug, Clone)]
pub(super) struct Layout {
    dir: PathBuf,
}

impl Layout {
    pub(super) fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub(super) fn dir(&self) -> &Path {
        &self.dir
    }

    fn shard_dir(&self, stem: &str) -> PathBuf {
        let (first, remainder) = stem.split_at(2);
        let (second, _) = remainder.split_at(2);
        self.dir.join(first).join(second)
    }

    pub(super) fn paths(&self, stem: &str) -> EntryPaths {
        let shard = self.shard_dir(stem);
        EntryPaths {
            index: shard.join(format!("{stem}.{INDEX_EXTENSION}")),
            streams: [shard.join(format!("{stem}.0")), shard.join(format!("{stem}.1"))],
            shard,
        }
    }

    pub(super) fn temp_path(&self) -> PathBuf {
        self.dir
            .join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4().simple()))
    }
}

#[derive(Debug, Clone)]
pub(super) struct EntryPaths {
    pub shard: PathBuf,
    pub index: PathBuf,
    pub streams: [PathBuf; 2],
}

impl EntryPaths {
    pub(super) fn stream(&self, stream: StreamIndex) -> &Path {
        &self.streams[stream.slot()]
    }

    pub(super) fn remove_all(&self) {
        for path in self.streams.iter().chain(std::iter::once(&self.index)) {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(error = %err, path = %path.display(), "failed to remove entry file"),
            }
        }
    }
}

pub(super) fn new_stem() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub(super) fn version_dir(root: &Path) -> PathBuf {
    root.join(format!("{VERSION_PREFIX}{LAYOUT_VERSION}"))
}

fn parse_version(name: &str) -> Option<u32> {
    let version = name.strip_prefix(VERSION_PREFIX)?;
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    version.parse().ok()
}

fn tombstone_name(version_name: &str) -> String {
    format!("{TOMBSTONE_PREFIX}{version_name}-{}", uuid::Uuid::new_v4())
}

/// Creates the directory for the current layout version and moves
/// directories of other versions aside. Returns the active directory and the
/// directories that should be removed in the background.
pub(super) async fn prepare_versioned_dir(root: &Path) -> Result<(PathBuf, Vec<PathBuf>)> {
    async_fs::create_dir_all(root)
        .await
        .with_context(|| format!("failed to create store root {}", root.display()))?;

    let active_name = format!("{VERSION_PREFIX}{LAYOUT_VERSION}");
    let active_dir = version_dir(root);
    async_fs::create_dir_all(&active_dir)
        .await
        .with_context(|| format!("failed to create store dir {}", active_dir.display()))?;

    let mut cleanup = Vec::new();
    let mut entries = async_fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == active_name {
            continue;
        }
        if name.starts_with(TOMBSTONE_PREFIX) {
            cleanup.push(entry.path());
            continue;
        }
        if parse_version(&name).is_some() {
            let tombstone = root.join(tombstone_name(&name));
            if let Err(err) = async_fs::rename(entry.path(), &tombstone).await {
                warn!(
                    error = %err,
                    path = %entry.path().display(),
                    "failed to tombstone old store dir"
                );
                continue;
            }
            cleanup.push(tombstone);
        }
    }

    Ok((active_dir, cleanup))
}

pub(super) fn spawn_dir_cleanup(dirs: Vec<PathBuf>) {
    for dir in dirs {
        tokio::spawn(async move {
            match async_fs::remove_dir_all(&dir).await {
                Ok(()) => crate::metrics::record_store_dir_cleanup(),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(
                        error = %err,
                        path = %dir.display(),
                        "failed to remove old store dir"
                    );
                }
            }
        });
    }
}
