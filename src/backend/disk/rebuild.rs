use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::Result;
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::layout::{INDEX_EXTENSION, Layout, TEMP_PREFIX};

/// Commit record written next to an entry's stream files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct IndexRecord {
    pub key: String,
    pub sizes: [u64; 2],
    /// blake3 of each stream, when the stream was written sequentially.
    pub hashes: [Option<String>; 2],
}

#[derive(Debug)]
pub(super) struct RestoredEntry {
    pub stem: String,
    pub record: IndexRecord,
}

/// Walks the store directory and returns every committed entry whose files
/// are intact. Temp files, uncommitted stream files and damaged entries are
/// removed.
pub(super) fn scan(layout: &Layout) -> Result<Vec<RestoredEntry>> {
    remove_temp_files(layout.dir())?;

    let mut restored = Vec::new();
    let mut seen_keys = HashSet::new();

    for shard1 in fs::read_dir(layout.dir())? {
        let shard1 = shard1?;
        if !shard1.file_type()?.is_dir() {
            continue;
        }
        for shard2 in fs::read_dir(shard1.path())? {
            let shard2 = shard2?;
            if !shard2.file_type()?.is_dir() {
                continue;
            }
            let mut index_files = Vec::new();
            let mut stream_files = Vec::new();
            for file in fs::read_dir(shard2.path())? {
                let file = file?;
                if !file.file_type()?.is_file() {
                    continue;
                }
                let path = file.path();
                if path.extension().and_then(|ext| ext.to_str()) == Some(INDEX_EXTENSION) {
                    index_files.push(path);
                } else {
                    stream_files.push(path);
                }
            }

            let mut live_stems = HashSet::new();
            for index in index_files {
                if let Some(entry) = restore_entry(layout, &index, &mut seen_keys) {
                    live_stems.insert(entry.stem.clone());
                    restored.push(entry);
                }
            }

            for path in stream_files {
                let keep = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .is_some_and(|stem| live_stems.contains(stem));
                if !keep {
                    debug!(path = %path.display(), "removing uncommitted stream file");
                    fs::remove_file(&path).ok();
                }
            }

            if fs::read_dir(shard2.path())?.next().is_none() {
                fs::remove_dir_all(shard2.path()).ok();
            }
        }
        if fs::read_dir(shard1.path())?.next().is_none() {
            fs::remove_dir_all(shard1.path()).ok();
        }
    }

    Ok(restored)
}

fn restore_entry(
    layout: &Layout,
    index_path: &Path,
    seen_keys: &mut HashSet<String>,
) -> Option<RestoredEntry> {
    let stem = index_path.file_stem()?.to_str()?.to_string();
    if stem.len() < 4 || !stem.is_ascii() {
        fs::remove_file(index_path).ok();
        return None;
    }
    let paths = layout.paths(&stem);

    let record: IndexRecord = match fs::read(index_path)
        .map_err(anyhow::Error::from)
        .and_then(|data| serde_json::from_slice(&data).map_err(anyhow::Error::from))
    {
        Ok(record) => record,
        Err(err) => {
            warn!(error = %err, path = %index_path.display(), "unreadable index record; removing entry");
            paths.remove_all();
            crate::metrics::record_rebuild_discarded();
            return None;
        }
    };

    for (slot, path) in paths.streams.iter().enumerate() {
        if !stream_intact(path, record.sizes[slot], record.hashes[slot].as_deref()) {
            warn!(key = %record.key, stream = slot, "stream file damaged; removing entry");
            paths.remove_all();
            crate::metrics::record_rebuild_discarded();
            return None;
        }
    }

    if !seen_keys.insert(record.key.clone()) {
        warn!(key = %record.key, "duplicate index record; removing entry");
        paths.remove_all();
        crate::metrics::record_rebuild_discarded();
        return None;
    }

    Some(RestoredEntry { stem, record })
}

fn stream_intact(path: &Path, expected_size: u64, expected_hash: Option<&str>) -> bool {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    if size != expected_size {
        return false;
    }
    match expected_hash {
        Some(expected) if expected_size > 0 => hash_matches(path, expected),
        _ => true,
    }
}

fn hash_matches(path: &Path, expected_hex: &str) -> bool {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let mut hasher = Hasher::new();
    let mut buf = [0u8; 8192];
    loop {
        match std::io::Read::read(&mut file, &mut buf) {
            Ok(0) => break,
            Ok(n) => {
                hasher.update(&buf[..n]);
            }
            Err(_) => return false,
        }
    }
    hasher.finalize().to_hex().as_str() == expected_hex
}

fn remove_temp_files(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(TEMP_PREFIX))
        {
            fs::remove_file(&path).ok();
        }
    }
    Ok(())
}
