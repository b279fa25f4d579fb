//! Object store collaborators
//!
//! The cache talks to blob storage through `ObjectStore`; cloud backings
//! (S3, minio) are wired in by the daemon, while `LocalStore` serves
//! `file://` deployments and tests. Archive artifacts move as tar streams,
//! gzip-compressed when the object key says so.

use crate::error::{Result, WorkerError};
use crate::fingerprint;
use crate::request::Artifact;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

/// Backing storage for artifacts
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Remote content hash (etag-equivalent) of the artifact
    async fn hash(&self, art: &Artifact) -> Result<String>;

    /// Materialize the artifact under `dest`, unpacking archives when the
    /// artifact asks for it; returns bytes transferred
    async fn fetch(&self, art: &Artifact, dest: &Path) -> Result<u64>;

    /// Download the raw object to exactly `dest_file`, no unpacking;
    /// single-flight blob caching builds on this
    async fn fetch_raw(&self, art: &Artifact, dest_file: &Path) -> Result<u64>;

    /// Upload `src` as a single archive at the artifact's location
    async fn deposit(&self, art: &Artifact, src: &Path) -> Result<u64>;

    /// Upload every file under `src` individually, preserving layout
    async fn hoard(&self, art: &Artifact, src: &Path) -> Result<u64>;
}

/// Filesystem-rooted store: objects live at `<root>/<bucket>/<key>`
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalStore { root: root.into() }
    }

    fn object_path(&self, art: &Artifact) -> PathBuf {
        self.root.join(&art.bucket).join(&art.key)
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn hash(&self, art: &Artifact) -> Result<String> {
        let path = self.object_path(art);
        let data = std::fs::read(&path).map_err(|e| {
            WorkerError::from(e).with("object", path.display())
        })?;
        Ok(format!("{:016x}", fingerprint::hash_bytes(&data)))
    }

    async fn fetch(&self, art: &Artifact, dest: &Path) -> Result<u64> {
        let path = self.object_path(art);
        let meta = std::fs::metadata(&path)
            .map_err(|e| WorkerError::from(e).with("object", path.display()))?;

        if art.unpack {
            unpack_archive(&path, dest)?;
        } else {
            let name = path
                .file_name()
                .ok_or_else(|| WorkerError::malformed("object key has no file name"))?;
            std::fs::copy(&path, dest.join(name))?;
        }
        Ok(meta.len())
    }

    async fn fetch_raw(&self, art: &Artifact, dest_file: &Path) -> Result<u64> {
        let path = self.object_path(art);
        let bytes = std::fs::copy(&path, dest_file)
            .map_err(|e| WorkerError::from(e).with("object", path.display()))?;
        Ok(bytes)
    }

    async fn deposit(&self, art: &Artifact, src: &Path) -> Result<u64> {
        let path = self.object_path(art);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        pack_archive(src, &path)?;
        Ok(std::fs::metadata(&path)?.len())
    }

    async fn hoard(&self, art: &Artifact, src: &Path) -> Result<u64> {
        let base = self.object_path(art);
        let mut total = 0u64;
        let mut stack = vec![src.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let rel = path
                    .strip_prefix(src)
                    .map_err(|_| WorkerError::fatal("walked outside upload root"))?;
                let target = base.join(rel);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                total += std::fs::copy(&path, &target)?;
            }
        }
        Ok(total)
    }
}

/// Whether the object key names a gzip-compressed archive
fn is_gzip_key(path: &Path) -> bool {
    let name = path.to_string_lossy().to_ascii_lowercase();
    name.ends_with(".tgz") || name.ends_with(".tar.gz") || name.ends_with(".gz")
}

/// Unpack a tar (optionally gzip) archive into `dest`
pub fn unpack_archive(archive: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let file = File::open(archive)
        .map_err(|e| WorkerError::from(e).with("archive", archive.display()))?;
    let mut reader = BufReader::new(file);

    // Sniff the gzip magic rather than trusting the name
    let mut magic = [0u8; 2];
    let sniffed = reader.read(&mut magic)?;
    let file = File::open(archive)?;
    let reader: Box<dyn Read> = if sniffed == 2 && magic == [0x1f, 0x8b] {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    tar::Archive::new(reader)
        .unpack(dest)
        .map_err(|e| WorkerError::from(e).with("archive", archive.display()))?;
    Ok(())
}

/// Pack `src` into a tar archive at `dest_file`, gzip when the name asks
pub fn pack_archive(src: &Path, dest_file: &Path) -> Result<()> {
    let file = File::create(dest_file)
        .map_err(|e| WorkerError::from(e).with("archive", dest_file.display()))?;
    let writer = BufWriter::new(file);

    if is_gzip_key(dest_file) {
        let encoder = GzEncoder::new(writer, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", src)?;
        builder.into_inner()?.finish()?;
    } else {
        let mut builder = tar::Builder::new(writer);
        builder.append_dir_all(".", src)?;
        builder.into_inner()?;
    }
    Ok(())
}
