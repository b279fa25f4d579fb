//! Artifact cache with mutable-change detection
//!
//! Fetches land under `<run_root>/<group>`. For mutable artifacts (and
//! anything local) the cache records a directory fingerprint after the
//! fetch; `restore` compares the fingerprint again after the run and only
//! uploads when the tree actually changed.

use super::Downloader;
use crate::error::{ErrorSink, Result};
use crate::fingerprint;
use crate::request::Artifact;
use crate::storage::{self, ObjectStore};
use crate::METADATA_GROUP;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct ArtifactCache {
    upload_hashes: Mutex<HashMap<PathBuf, u64>>,
    errors: ErrorSink,
    /// Shared blob cache; immutable hash-keyed artifacts dedupe through it
    downloader: Option<Arc<Downloader>>,
}

impl ArtifactCache {
    pub fn new(errors: ErrorSink) -> Self {
        ArtifactCache {
            upload_hashes: Mutex::new(HashMap::new()),
            errors,
            downloader: None,
        }
    }

    pub fn with_downloader(mut self, downloader: Arc<Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    /// Remote content hash of an artifact, straight from the backing store
    pub async fn hash(&self, store: &dyn ObjectStore, art: &Artifact) -> Result<String> {
        store.hash(art).await
    }

    /// Materialize one artifact group under `run_root`
    ///
    /// The `_metadata` group is reserved: the core neither fetches nor
    /// alters it, a higher layer owns its contents.
    pub async fn fetch(
        &self,
        store: &dyn ObjectStore,
        art: &Artifact,
        group: &str,
        run_root: &Path,
    ) -> Result<()> {
        if group == METADATA_GROUP {
            return Ok(());
        }

        let dest = run_root.join(group);
        std::fs::create_dir_all(&dest)?;

        // Immutable artifacts with a known content hash stage through the
        // single-flight blob cache so concurrent runs share one download
        let blob = match (&self.downloader, &art.hash, art.mutable) {
            (Some(downloader), Some(hash), false) => Some(
                downloader
                    .fetch(hash, |partial| async move {
                        store.fetch_raw(art, &partial).await.map(|_| ())
                    })
                    .await
                    .map_err(|e| e.with("group", group))?,
            ),
            _ => None,
        };

        match blob {
            Some(blob) => {
                if art.unpack {
                    storage::unpack_archive(&blob, &dest)?;
                } else {
                    // The blob is named by hash; restore the object's name
                    let name = Path::new(&art.key)
                        .file_name()
                        .map(|n| n.to_os_string())
                        .unwrap_or_else(|| "blob".into());
                    std::fs::copy(&blob, dest.join(name))?;
                }
            }
            None => {
                store
                    .fetch(art, &dest)
                    .await
                    .map_err(|e| e.with("group", group))?;
            }
        }

        // Immutable remote artifacts never upload, so skip the fingerprint
        if !art.mutable && !art.is_local() {
            return Ok(());
        }

        match fingerprint::dir_hash(&dest) {
            Ok(hash) => {
                self.upload_hashes.lock().insert(dest, hash);
            }
            Err(e) => {
                self.errors.report(e.with("group", group)).await;
            }
        }
        Ok(())
    }

    /// Upload a mutable artifact group if its tree changed since fetch
    ///
    /// Returns whether an upload happened. `_metadata` groups go file by
    /// file; everything else travels as one archive.
    pub async fn restore(
        &self,
        store: &dyn ObjectStore,
        art: &Artifact,
        group: &str,
        run_root: &Path,
    ) -> Result<bool> {
        if !art.mutable {
            return Ok(false);
        }

        let dir = run_root.join(group);
        let current = fingerprint::dir_hash(&dir).map_err(|e| e.with("group", group))?;
        let unchanged = self
            .upload_hashes
            .lock()
            .get(&dir)
            .map(|h| *h == current)
            .unwrap_or(false);
        if unchanged {
            log::debug!("group {} unchanged, skipping upload", group);
            return Ok(false);
        }

        if group == METADATA_GROUP {
            store.hoard(art, &dir).await?;
        } else {
            store.deposit(art, &dir).await?;
        }
        self.upload_hashes.lock().insert(dir, current);
        Ok(true)
    }
}
