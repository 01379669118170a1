//! Disk-backed ephemeral store with an in-memory index.
//!
//! Layout under the data directory: content bytes at `<id>` and a JSON
//! metadata sidecar at `<id>.meta`. The sidecar carries the original client
//! filename and the expiry, so the index can be rebuilt after a restart
//! without encoding anything into the content filename itself.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::id::FileId;

/// How long an uploaded file stays resolvable.
pub const FILE_TTL: Duration = Duration::from_secs(60 * 60);

/// Cadence of the expiry sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

const META_SUFFIX: &str = ".meta";

/// One live uploaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub id: FileId,
    /// Client-supplied filename, kept verbatim.
    pub original_name: String,
    /// Absolute expiry, unix milliseconds.
    pub expires_at_ms: u64,
    pub size_bytes: u64,
    /// Location of the content bytes on disk.
    pub path: PathBuf,
}

/// Sidecar metadata persisted next to the content bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMeta {
    original_name: String,
    expires_at_ms: u64,
    size_bytes: u64,
}

struct IndexEntry {
    original_name: String,
    expires_at_ms: u64,
    size_bytes: u64,
}

/// ID-addressed ephemeral file store.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<FileStoreInner>,
}

struct FileStoreInner {
    root: PathBuf,
    index: RwLock<HashMap<FileId, IndexEntry>>,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as u64)
        .unwrap_or_default()
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed and
    /// rebuilding the index from sidecar metadata left by a previous run.
    /// Strays (content without metadata or the reverse) are removed.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create data directory {}", root.display()))?;

        let mut metas: HashMap<FileId, StoredMeta> = HashMap::new();
        let mut contents: HashSet<FileId> = HashSet::new();

        for entry in fs::read_dir(&root)
            .with_context(|| format!("failed to scan data directory {}", root.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if let Some(stem) = name.strip_suffix(META_SUFFIX) {
                if let Ok(id) = stem.parse::<FileId>() {
                    match fs::read(entry.path())
                        .map_err(anyhow::Error::from)
                        .and_then(|bytes| serde_json::from_slice(&bytes).map_err(Into::into))
                    {
                        Ok(meta) => {
                            metas.insert(id, meta);
                        }
                        Err(err) => {
                            warn!(id = %id, "dropping unreadable metadata sidecar: {err}");
                            let _ = fs::remove_file(entry.path());
                        }
                    }
                }
            } else if let Ok(id) = name.parse::<FileId>() {
                contents.insert(id);
            }
        }

        let mut index = HashMap::new();
        for (id, meta) in metas {
            if contents.remove(&id) {
                index.insert(
                    id,
                    IndexEntry {
                        original_name: meta.original_name,
                        expires_at_ms: meta.expires_at_ms,
                        size_bytes: meta.size_bytes,
                    },
                );
            } else {
                let _ = fs::remove_file(meta_path(&root, &id));
            }
        }
        for id in contents {
            warn!(id = %id, "removing orphaned content without metadata");
            let _ = fs::remove_file(content_path(&root, &id));
        }

        if !index.is_empty() {
            info!(entries = index.len(), "rebuilt store index from disk");
        }

        Ok(Self {
            inner: Arc::new(FileStoreInner {
                root,
                index: RwLock::new(index),
            }),
        })
    }

    /// Persist one uploaded file and return its record.
    ///
    /// The ID is generated and its index slot reserved under the write lock,
    /// so concurrent puts can never hand out the same ID. Disk writes happen
    /// after the reservation; a failed write rolls it back.
    pub fn put(&self, original_name: &str, content: &[u8]) -> Result<StoredFile> {
        let expires_at_ms = now_ms() + FILE_TTL.as_millis() as u64;
        let size_bytes = content.len() as u64;

        let id = {
            let mut index = self.inner.index.write();
            let live: HashSet<FileId> = index.keys().copied().collect();
            let id = FileId::generate(&live);
            index.insert(
                id,
                IndexEntry {
                    original_name: original_name.to_string(),
                    expires_at_ms,
                    size_bytes,
                },
            );
            id
        };

        let path = content_path(&self.inner.root, &id);
        let result = (|| -> Result<()> {
            fs::write(&path, content)
                .with_context(|| format!("failed to write content for {id}"))?;
            let meta = StoredMeta {
                original_name: original_name.to_string(),
                expires_at_ms,
                size_bytes,
            };
            fs::write(meta_path(&self.inner.root, &id), serde_json::to_vec(&meta)?)
                .with_context(|| format!("failed to write metadata for {id}"))?;
            Ok(())
        })();

        if let Err(err) = result {
            self.inner.index.write().remove(&id);
            let _ = fs::remove_file(&path);
            let _ = fs::remove_file(meta_path(&self.inner.root, &id));
            return Err(err);
        }

        debug!(id = %id, name = original_name, size = size_bytes, "stored file");

        Ok(StoredFile {
            id,
            original_name: original_name.to_string(),
            expires_at_ms,
            size_bytes,
            path,
        })
    }

    /// Look up a live entry. Expired entries are unresolvable even before the
    /// sweep that removes them.
    pub fn resolve(&self, id: &FileId) -> Option<StoredFile> {
        let index = self.inner.index.read();
        let entry = index.get(id)?;
        if entry.expires_at_ms <= now_ms() {
            return None;
        }
        Some(StoredFile {
            id: *id,
            original_name: entry.original_name.clone(),
            expires_at_ms: entry.expires_at_ms,
            size_bytes: entry.size_bytes,
            path: content_path(&self.inner.root, id),
        })
    }

    /// Delete every entry past its expiry. Individual deletion failures are
    /// logged and skipped; they never abort the rest of the sweep. Returns
    /// the number of entries removed from the index.
    pub fn sweep(&self) -> usize {
        let now = now_ms();

        let expired: Vec<FileId> = {
            let index = self.inner.index.read();
            index
                .iter()
                .filter(|(_, entry)| entry.expires_at_ms < now)
                .map(|(id, _)| *id)
                .collect()
        };

        if expired.is_empty() {
            return 0;
        }

        let mut removed = 0;
        for id in expired {
            let gone = self.inner.index.write().remove(&id).is_some();
            if !gone {
                continue;
            }
            removed += 1;
            if let Err(err) = fs::remove_file(content_path(&self.inner.root, &id)) {
                warn!(id = %id, "failed to remove expired content: {err}");
            }
            if let Err(err) = fs::remove_file(meta_path(&self.inner.root, &id)) {
                warn!(id = %id, "failed to remove expired metadata: {err}");
            }
        }

        info!(removed, "swept expired files");
        removed
    }

    /// Number of currently indexed entries (expired-but-unswept included).
    pub fn live_count(&self) -> usize {
        self.inner.index.read().len()
    }

    /// Root data directory.
    pub fn data_dir(&self) -> &Path {
        &self.inner.root
    }

    #[cfg(test)]
    pub(crate) fn force_expire(&self, id: &FileId) {
        if let Some(entry) = self.inner.index.write().get_mut(id) {
            entry.expires_at_ms = 0;
        }
    }
}

fn content_path(root: &Path, id: &FileId) -> PathBuf {
    root.join(id.as_str())
}

fn meta_path(root: &Path, id: &FileId) -> PathBuf {
    root.join(format!("{id}{META_SUFFIX}"))
}
