//! A content store laid out as an OCI image layout in a local directory.
//!
//! Blobs live under `<root>/blobs/<algorithm>/<hex>`, and `<root>/index.json` is an OCI image
//! index listing every pushed manifest, tagged by the `org.opencontainers.image.ref.name`
//! annotation. All writes go through a temporary file and a rename.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use futures::StreamExt;
use oci_spec::image::{Descriptor, Digest, ImageIndex, ImageIndexBuilder, MediaType};
use sha2::{Digest as _, Sha256};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    sync::RwLock,
};
use tokio_util::io::ReaderStream;

use crate::{media, utils, EdgepackError, EdgepackResult};

use super::{BlobFetcher, BlobPusher, BlobStream, BlobWriter, ContentStore};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The blob subdirectory of the layout.
pub const BLOBS_SUBDIR: &str = "blobs";

/// The index filename of the layout.
pub const INDEX_FILENAME: &str = "index.json";

/// The layout marker filename.
pub const LAYOUT_FILENAME: &str = "oci-layout";

const LAYOUT_CONTENT: &str = "{\"imageLayoutVersion\":\"1.0.0\"}";

/// Distinguishes temp files of concurrent writers ingesting the same digest.
static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A content store over a local directory laid out as an OCI blob store.
///
/// The in-memory tags map mirrors `index.json`; pushes update it when a manifest commits and
/// [`ContentStore::finalize`] flushes it back to disk atomically. Clones share state.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
    tags: Arc<RwLock<HashMap<String, Descriptor>>>,
}

struct DirectoryFetcher {
    root: PathBuf,
}

struct DirectoryPusher {
    root: PathBuf,
    reference: String,
    tags: Arc<RwLock<HashMap<String, Descriptor>>>,
}

/// Writes one blob to a temporary file, renamed into its content address on commit.
struct DirectoryWriter {
    temp_path: PathBuf,
    final_path: PathBuf,
    file: Option<File>,
    hasher: Sha256,
    size: u64,
    committed: bool,
    /// Present when the blob is a manifest: the reference and tags map to update on commit.
    tag_update: Option<(String, Arc<RwLock<HashMap<String, Descriptor>>>, Descriptor)>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DirectoryStore {
    /// Opens (or initializes) the layout rooted at `root`, loading any existing index.
    pub async fn new(root: impl Into<PathBuf>) -> EdgepackResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(BLOBS_SUBDIR).join("sha256")).await?;

        let mut tags = HashMap::new();
        let index_path = root.join(INDEX_FILENAME);
        if index_path.exists() {
            let bytes = tokio::fs::read(&index_path).await?;
            let index: ImageIndex = serde_json::from_slice(&bytes)?;
            for descriptor in index.manifests() {
                if let Some(name) = utils::descriptor_annotation(descriptor, media::ANNOTATION_REF_NAME)
                {
                    tags.insert(name, descriptor.clone());
                }
            }
        }

        Ok(Self {
            root,
            tags: Arc::new(RwLock::new(tags)),
        })
    }

    /// Returns the layout root.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn blob_path(root: &Path, digest: &Digest) -> PathBuf {
    root.join(BLOBS_SUBDIR)
        .join(digest.algorithm().to_string())
        .join(digest.digest())
}

impl DirectoryWriter {
    async fn create(
        root: &Path,
        descriptor: &Descriptor,
        tag_update: Option<(String, Arc<RwLock<HashMap<String, Descriptor>>>, Descriptor)>,
    ) -> EdgepackResult<Self> {
        let final_path = blob_path(root, descriptor.digest());
        let temp_path = final_path.with_file_name(format!(
            ".{}.{}.tmp",
            descriptor.digest().digest(),
            TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed)
        ));
        if let Some(parent) = temp_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&temp_path)
            .await?;

        Ok(Self {
            temp_path,
            final_path,
            file: Some(file),
            hasher: Sha256::new(),
            size: 0,
            committed: false,
            tag_update,
        })
    }

    async fn discard(&mut self) -> EdgepackResult<()> {
        self.file.take();
        if self.temp_path.exists() {
            tokio::fs::remove_file(&self.temp_path).await?;
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ContentStore for DirectoryStore {
    async fn resolve(&self, reference: &str) -> EdgepackResult<Descriptor> {
        let tags = self.tags.read().await;
        tags.get(reference)
            .cloned()
            .ok_or_else(|| EdgepackError::NotFound(reference.to_string()))
    }

    async fn fetcher(&self, _reference: &str) -> EdgepackResult<Box<dyn BlobFetcher>> {
        Ok(Box::new(DirectoryFetcher {
            root: self.root.clone(),
        }))
    }

    async fn pusher(&self, reference: &str) -> EdgepackResult<Box<dyn BlobPusher>> {
        Ok(Box::new(DirectoryPusher {
            root: self.root.clone(),
            reference: reference.to_string(),
            tags: self.tags.clone(),
        }))
    }

    async fn finalize(&self, _reference: &str) -> EdgepackResult<()> {
        let layout_path = self.root.join(LAYOUT_FILENAME);
        if !layout_path.exists() {
            tokio::fs::write(&layout_path, LAYOUT_CONTENT).await?;
        }

        let manifests: Vec<Descriptor> = {
            let tags = self.tags.read().await;
            let mut manifests: Vec<Descriptor> = tags.values().cloned().collect();
            manifests.sort_by_key(|d| utils::descriptor_annotation(d, media::ANNOTATION_REF_NAME));
            manifests
        };

        let index: ImageIndex = ImageIndexBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageIndex)
            .manifests(manifests)
            .build()?;

        let bytes = serde_json::to_vec_pretty(&index)?;
        let temp_path = self.root.join(format!(".{}.tmp", INDEX_FILENAME));
        tokio::fs::write(&temp_path, &bytes).await?;
        tokio::fs::rename(&temp_path, self.root.join(INDEX_FILENAME)).await?;
        Ok(())
    }
}

#[async_trait]
impl BlobFetcher for DirectoryFetcher {
    async fn fetch(&self, descriptor: &Descriptor) -> EdgepackResult<BlobStream> {
        let path = blob_path(&self.root, descriptor.digest());
        if !path.exists() {
            return Err(EdgepackError::NotFound(descriptor.digest().to_string()));
        }

        let file = File::open(&path).await?;
        let stream = ReaderStream::new(file).map(|chunk| chunk.map_err(EdgepackError::from));
        Ok(stream.boxed())
    }
}

#[async_trait]
impl BlobPusher for DirectoryPusher {
    async fn push(&self, descriptor: &Descriptor) -> EdgepackResult<Box<dyn BlobWriter>> {
        let tag_update = if media::is_manifest_media_type(&descriptor.media_type().to_string()) {
            let tagged = utils::annotate(
                descriptor,
                [(
                    media::ANNOTATION_REF_NAME.to_string(),
                    self.reference.clone(),
                )],
            )?;
            Some((self.reference.clone(), self.tags.clone(), tagged))
        } else {
            None
        };

        let writer = DirectoryWriter::create(&self.root, descriptor, tag_update).await?;
        Ok(Box::new(writer))
    }
}

#[async_trait]
impl BlobWriter for DirectoryWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> EdgepackResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| EdgepackError::WriterClosed(self.final_path.display().to_string()))?;
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

        if self.final_path.exists() {
            // Content-addressed, so an existing blob is the same blob.
            self.discard().await?;
        } else {
            tokio::fs::rename(&self.temp_path, &self.final_path).await?;
        }

        if let Some((reference, tags, tagged)) = self.tag_update.take() {
            tags.write().await.insert(reference, tagged);
        }

        self.committed = true;
        Ok(())
    }

    async fn close(&mut self) -> EdgepackResult<()> {
        if self.committed {
            return Ok(());
        }
        self.discard().await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::TryStreamExt;
    use tempfile::tempdir;

    use super::*;
    use crate::utils::sha256_digest;

    async fn push_blob(
        store: &DirectoryStore,
        reference: &str,
        media_type: &str,
        content: &[u8],
        title: Option<&str>,
    ) -> EdgepackResult<Descriptor> {
        let mut annotations = HashMap::new();
        if let Some(title) = title {
            annotations.insert(media::ANNOTATION_TITLE.to_string(), title.to_string());
        }
        let descriptor = utils::new_descriptor(
            media_type,
            sha256_digest(content),
            content.len() as u64,
            annotations,
        )?;

        let pusher = store.pusher(reference).await?;
        let mut writer = pusher.push(&descriptor).await?;
        writer.write_all(content).await?;
        writer
            .commit(content.len() as u64, Some(sha256_digest(content)))
            .await?;
        Ok(descriptor)
    }

    #[tokio::test]
    async fn test_directory_store_layout_and_roundtrip() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = DirectoryStore::new(dir.path()).await?;
        let reference = "docker.io/library/eve:1.0";

        let layer = push_blob(
            &store,
            reference,
            media::MEDIA_TYPE_ECI_KERNEL,
            b"kernel",
            Some("kernel"),
        )
        .await?;
        let manifest = push_blob(
            &store,
            reference,
            media::MEDIA_TYPE_OCI_IMAGE_MANIFEST,
            b"{\"schemaVersion\":2}",
            None,
        )
        .await?;
        store.finalize(reference).await?;

        // Blob layout.
        let blob = dir
            .path()
            .join(BLOBS_SUBDIR)
            .join("sha256")
            .join(layer.digest().digest());
        assert_eq!(std::fs::read(&blob)?, b"kernel");
        assert!(dir.path().join(INDEX_FILENAME).exists());
        assert!(dir.path().join(LAYOUT_FILENAME).exists());

        // Resolution from a freshly opened store (index round-trips through disk).
        let reopened = DirectoryStore::new(dir.path()).await?;
        let resolved = reopened.resolve(reference).await?;
        assert_eq!(resolved.digest(), manifest.digest());

        let fetcher = reopened.fetcher(reference).await?;
        let chunks: Vec<Bytes> = fetcher.fetch(&layer).await?.try_collect().await?;
        assert_eq!(chunks.concat(), b"kernel");

        Ok(())
    }

    #[tokio::test]
    async fn test_directory_store_failed_commit_leaves_no_blob() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = DirectoryStore::new(dir.path()).await?;

        let descriptor = utils::new_descriptor(
            media::MEDIA_TYPE_ECI_KERNEL,
            sha256_digest(b"kernel"),
            6,
            Default::default(),
        )?;
        let pusher = store.pusher("docker.io/library/eve:1.0").await?;
        let mut writer = pusher.push(&descriptor).await?;
        writer.write_all(b"corrupted").await?;
        let err = writer
            .commit(6, Some(sha256_digest(b"kernel")))
            .await
            .unwrap_err();
        assert!(matches!(err, EdgepackError::SizeMismatch { .. }));

        // Neither the blob nor any temp file survives.
        let entries: Vec<_> = std::fs::read_dir(dir.path().join(BLOBS_SUBDIR).join("sha256"))?
            .collect::<Result<_, _>>()?;
        assert!(entries.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_directory_store_duplicate_commit_succeeds() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = DirectoryStore::new(dir.path()).await?;
        let reference = "docker.io/library/eve:1.0";

        push_blob(&store, reference, media::MEDIA_TYPE_ECI_KERNEL, b"kernel", None).await?;
        // Committing the same content again must be an idempotent success.
        push_blob(&store, reference, media::MEDIA_TYPE_ECI_KERNEL, b"kernel", None).await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_directory_store_unknown_reference() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = DirectoryStore::new(dir.path()).await?;
        assert!(matches!(
            store.resolve("docker.io/library/missing:1").await,
            Err(EdgepackError::NotFound(_))
        ));
        Ok(())
    }
}
