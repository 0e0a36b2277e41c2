//! Local replay cache of raw fetch output.
//!
//! A connector stores every raw response it receives (XML pages, HTML
//! pages, JSON pages) as an opaque block, in the order it received them.
//! Replaying the blocks through the same parsing code reproduces the fetch
//! without touching the network.
//!
//! Layout on disk:
//!
//! ```text
//! <dir>/items/blocks.jsonl     one JSON-encoded string per line
//! <dir>/recovery/blocks.jsonl  snapshot taken by backup()
//! ```
//!
//! Blocks are appended a group at a time with a single write followed by a
//! sync, so a crash leaves at most one trailing partial line. Replay reports
//! such a line as corruption; [`ReplayCache::recover`] restores the last
//! snapshot.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use harvest_core::{HarvestError, Result};
use walkdir::WalkDir;

const ITEMS_DIR: &str = "items";
const RECOVERY_DIR: &str = "recovery";
const BLOCKS_FILE: &str = "blocks.jsonl";

#[derive(Debug)]
pub struct ReplayCache {
    dir: PathBuf,
    items_path: PathBuf,
    recovery_path: PathBuf,
}

fn cache_err(action: &str, path: &Path, e: impl std::fmt::Display) -> HarvestError {
    HarvestError::Cache(format!("cannot {} {}: {}", action, path.display(), e))
}

impl ReplayCache {
    /// Open (creating if needed) the cache rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let items_path = dir.join(ITEMS_DIR);
        let recovery_path = dir.join(RECOVERY_DIR);

        for path in [&items_path, &recovery_path] {
            fs::create_dir_all(path).map_err(|e| cache_err("create", path, e))?;
        }

        Ok(Self {
            dir,
            items_path,
            recovery_path,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blocks_file(&self) -> PathBuf {
        self.items_path.join(BLOCKS_FILE)
    }

    /// Append `blocks` as one unit.
    pub fn store(&self, blocks: &[String]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }

        let mut buf = String::new();
        for block in blocks {
            buf.push_str(&serde_json::to_string(block)?);
            buf.push('\n');
        }

        let path = self.blocks_file();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| cache_err("open", &path, e))?;
        file.write_all(buf.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| cache_err("write", &path, e))?;

        tracing::debug!(count = blocks.len(), "stored cache blocks");
        Ok(())
    }

    /// Read the stored blocks back in their original order.
    pub fn retrieve(&self) -> Result<CacheBlocks> {
        let path = self.blocks_file();
        let reader = match File::open(&path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(cache_err("open", &path, e)),
        };
        Ok(CacheBlocks {
            reader,
            line: 0,
            path,
        })
    }

    /// Number of stored blocks.
    pub fn len(&self) -> Result<usize> {
        let mut n = 0;
        for block in self.retrieve()? {
            block?;
            n += 1;
        }
        Ok(n)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Snapshot the current contents into the recovery area.
    pub fn backup(&self) -> Result<()> {
        replace_dir(&self.items_path, &self.recovery_path)?;
        tracing::debug!(dir = %self.dir.display(), "cache backed up");
        Ok(())
    }

    /// Replace the current contents with the last snapshot.
    pub fn recover(&self) -> Result<()> {
        replace_dir(&self.recovery_path, &self.items_path)?;
        tracing::info!(dir = %self.dir.display(), "cache recovered from backup");
        Ok(())
    }

    /// Discard the current contents, keeping a snapshot unless `erase`.
    pub fn clean(&self, erase: bool) -> Result<()> {
        if !erase {
            self.backup()?;
        }
        remove_dir(&self.items_path)?;
        fs::create_dir_all(&self.items_path).map_err(|e| cache_err("create", &self.items_path, e))?;
        tracing::debug!(dir = %self.dir.display(), erase, "cache cleaned");
        Ok(())
    }
}

fn remove_dir(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(cache_err("remove", path, e)),
    }
}

/// Make `to` an exact copy of `from`.
fn replace_dir(from: &Path, to: &Path) -> Result<()> {
    remove_dir(to)?;
    fs::create_dir_all(to).map_err(|e| cache_err("create", to, e))?;

    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(|e| cache_err("walk", from, e))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| cache_err("walk", entry.path(), e))?;
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| cache_err("create", &target, e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| cache_err("copy", entry.path(), e))?;
        }
    }
    Ok(())
}

/// Lazy iterator over stored blocks, returned by [`ReplayCache::retrieve`].
pub struct CacheBlocks {
    reader: Option<BufReader<File>>,
    line: usize,
    path: PathBuf,
}

impl Iterator for CacheBlocks {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        let mut buf = String::new();

        let read = match reader.read_line(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                self.reader = None;
                return Some(Err(cache_err("read", &self.path, e)));
            }
        };
        if read == 0 {
            self.reader = None;
            return None;
        }
        self.line += 1;

        if !buf.ends_with('\n') {
            self.reader = None;
            return Some(Err(HarvestError::Cache(format!(
                "{} is corrupt: block {} was only partially written",
                self.path.display(),
                self.line
            ))));
        }

        Some(serde_json::from_str::<String>(buf.trim_end_matches('\n')).map_err(|e| {
            HarvestError::Cache(format!(
                "{} is corrupt at block {}: {}",
                self.path.display(),
                self.line,
                e
            ))
        }))
    }
}

/// Blocks waiting to be written to a cache as one unit.
///
/// Connectors push every raw response as they receive it and flush once a
/// group of records is complete. Without a cache every call is a no-op.
pub struct CacheQueue {
    cache: Option<Arc<ReplayCache>>,
    pending: Vec<String>,
}

impl CacheQueue {
    pub fn new(cache: Option<Arc<ReplayCache>>) -> Self {
        Self {
            cache,
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, block: impl Into<String>) {
        if self.cache.is_some() {
            self.pending.push(block.into());
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(cache) = &self.cache {
            cache.store(&self.pending)?;
        }
        self.pending.clear();
        Ok(())
    }

    pub fn purge(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
