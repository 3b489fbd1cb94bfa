use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use futures::StreamExt;
use oci_spec::image::{Descriptor, Digest};
use sha2::{Digest as _, Sha256};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
    sync::RwLock,
};
use tokio_util::io::ReaderStream;

use crate::{media, utils, EdgepackError, EdgepackResult};

use super::{BlobFetcher, BlobStream, BlobWriter, Ingester};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const READ_CHUNK_SIZE: usize = 32 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A file-backed content store.
///
/// On the build path it registers path-backed layers and serves their bytes by digest; on the
/// pull path it acts as the destination, writing each titled layer out as `<root>/<title>`.
/// Clones share state.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    paths: Arc<RwLock<HashMap<String, PathBuf>>>,
}

/// A writer producing one file under a [`FileStore`] root.
struct FileWriter {
    path: PathBuf,
    file: Option<File>,
    hasher: Sha256,
    size: u64,
    committed: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FileStore {
    /// Creates a store rooted at the given directory. The root only matters on the pull path;
    /// a build-side store can be rooted anywhere.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            paths: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers the file at `path` as a blob with the given title and media type, streaming
    /// it once to compute its digest and size.
    pub async fn add(
        &self,
        name: &str,
        media_type: &str,
        path: impl AsRef<Path>,
    ) -> EdgepackResult<Descriptor> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(EdgepackError::SourceMissing(path.to_path_buf()));
        }

        let mut file = File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buffer = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            size += read as u64;
        }

        let digest = utils::digest_from_sha256(hasher.finalize().as_slice());
        self.paths
            .write()
            .await
            .insert(digest.to_string(), path.to_path_buf());

        utils::new_descriptor(
            media_type,
            digest,
            size,
            HashMap::from([(media::ANNOTATION_TITLE.to_string(), name.to_string())]),
        )
    }
}

impl FileWriter {
    async fn create(path: PathBuf) -> EdgepackResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: Some(file),
            hasher: Sha256::new(),
            size: 0,
            committed: false,
        })
    }

    async fn discard(&mut self) -> EdgepackResult<()> {
        self.file.take();
        if !self.committed && self.path.exists() {
            tokio::fs::remove_file(&self.path).await?;
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl BlobFetcher for FileStore {
    async fn fetch(&self, descriptor: &Descriptor) -> EdgepackResult<BlobStream> {
        let paths = self.paths.read().await;
        let path = paths
            .get(&descriptor.digest().to_string())
            .cloned()
            .ok_or_else(|| EdgepackError::NotFound(descriptor.digest().to_string()))?;
        drop(paths);

        let file = File::open(&path).await?;
        let stream = ReaderStream::with_capacity(file, READ_CHUNK_SIZE)
            .map(|chunk| chunk.map_err(EdgepackError::from));
        Ok(stream.boxed())
    }
}

#[async_trait]
impl Ingester for FileStore {
    async fn writer(&self, descriptor: &Descriptor) -> EdgepackResult<Option<Box<dyn BlobWriter>>> {
        // Only titled content materializes as a file; manifests and other unnamed blobs are
        // not part of the pulled tree.
        let Some(title) = utils::descriptor_title(descriptor) else {
            return Ok(None);
        };

        let writer = FileWriter::create(self.root.join(title)).await?;
        Ok(Some(Box::new(writer)))
    }
}

#[async_trait]
impl BlobWriter for FileWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> EdgepackResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| EdgepackError::WriterClosed(self.path.display().to_string()))?;
        file.write_all(bytes).await?;
        self.hasher.update(bytes);
        self.size += bytes.len() as u64;
        Ok(())
    }

    fn digest(&self) -> Digest {
        utils::digest_from_sha256(self.hasher.clone().finalize().as_slice())
    }

    async fn commit(
        &mut self,
        expected_size: u64,
        expected_digest: Option<Digest>,
    ) -> EdgepackResult<()> {
        if self.committed {
            return Ok(());
        }

        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }

        if expected_size > 0 && expected_size != self.size {
            let actual = self.size;
            self.discard().await?;
            return Err(EdgepackError::SizeMismatch {
                expected: expected_size,
                actual,
            });
        }
        if let Some(expected) = expected_digest {
            let actual = self.digest();
            if actual != expected {
                self.discard().await?;
                return Err(EdgepackError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        self.committed = true;
        Ok(())
    }

    async fn close(&mut self) -> EdgepackResult<()> {
        self.discard().await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
