//! Content store over a containerd daemon's content store and image service.
//!
//! The gRPC wire protocol is an external collaborator consumed through the
//! [`ContainerdClient`] capability trait; this module owns the parts that make an image
//! survive inside the daemon: ingesting blobs under a digest-scoped ref, upserting the image
//! record once the manifest commits, and attaching `containerd.io/gc.ref.content.<i>` labels
//! for every child so the garbage collector does not reclaim layers before the image record
//! references them.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use oci_spec::image::{Descriptor, Digest, ImageIndex, ImageManifest};

use crate::{media, EdgepackError, EdgepackResult};

use super::{BlobFetcher, BlobPusher, BlobStream, BlobWriter, ContentStore};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Label prefix preventing containerd's garbage collector from reclaiming child content.
pub const CONTAINERD_GC_REF_PREFIX: &str = "containerd.io/gc.ref.content";

/// The namespace used when the caller passes an empty one.
pub const DEFAULT_CONTAINERD_NAMESPACE: &str = "default";

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The operations a containerd daemon exposes that this store consumes.
///
/// A gRPC socket client implements this in deployments; tests drive the store with an
/// in-memory fake.
#[async_trait]
pub trait ContainerdClient: Send + Sync {
    /// Looks up an image record by name, returning its target descriptor.
    async fn get_image(&self, namespace: &str, name: &str) -> EdgepackResult<Option<Descriptor>>;

    /// Creates or updates an image record pointing at the given target.
    async fn put_image(
        &self,
        namespace: &str,
        name: &str,
        target: &Descriptor,
    ) -> EdgepackResult<()>;

    /// Opens an ingest writer in the daemon's content store under the given ref.
    async fn open_writer(
        &self,
        namespace: &str,
        ref_id: &str,
        descriptor: &Descriptor,
    ) -> EdgepackResult<Box<dyn BlobWriter>>;

    /// Opens a reader over committed content.
    async fn reader(
        &self,
        namespace: &str,
        descriptor: &Descriptor,
    ) -> EdgepackResult<BlobStream>;

    /// Merges labels into the content record of a committed blob.
    async fn update_labels(
        &self,
        namespace: &str,
        digest: &Digest,
        labels: HashMap<String, String>,
    ) -> EdgepackResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A content store backed by a containerd daemon.
#[derive(Clone)]
pub struct ContainerdStore {
    client: Arc<dyn ContainerdClient>,
    namespace: String,
}

impl std::fmt::Debug for ContainerdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerdStore")
            .field("namespace", &self.namespace)
            .finish()
    }
}

struct ContainerdFetcher {
    client: Arc<dyn ContainerdClient>,
    namespace: String,
}

struct ContainerdPusher {
    client: Arc<dyn ContainerdClient>,
    namespace: String,
    reference: String,
}

/// Wraps the daemon's ingest writer, caching manifest and index bytes so the child refs can
/// be computed at commit time. Other media types are not cached, to bound memory.
struct ContainerdWriter {
    inner: Box<dyn BlobWriter>,
    client: Arc<dyn ContainerdClient>,
    namespace: String,
    reference: String,
    descriptor: Descriptor,
    cache: Option<Vec<u8>>,
    committed: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ContainerdStore {
    /// Creates a store over a connected client. An empty namespace selects
    /// [`DEFAULT_CONTAINERD_NAMESPACE`].
    pub fn new(client: Arc<dyn ContainerdClient>, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let namespace = if namespace.is_empty() {
            DEFAULT_CONTAINERD_NAMESPACE.to_string()
        } else {
            namespace
        };
        Self { client, namespace }
    }

    /// Connects to the daemon at the given socket address.
    ///
    /// The gRPC client is not part of this crate; builds that want a live daemon inject one
    /// through [`ContainerdStore::new`].
    pub fn connect(address: &str, _namespace: &str) -> EdgepackResult<Self> {
        Err(EdgepackError::BackendUnavailable(format!(
            "no containerd client is linked into this build, cannot reach {}; construct \
             ContainerdStore::new with a connected ContainerdClient instead",
            address
        )))
    }
}

/// Computes the GC child-reference labels for a committed manifest or index from its cached
/// bytes: one label per referenced child, layers first and the config last for manifests,
/// nested manifests for indices.
fn child_refs(bytes: &[u8], media_type: &str) -> EdgepackResult<HashMap<String, String>> {
    let mut labels = HashMap::new();

    match media_type {
        media::MEDIA_TYPE_OCI_IMAGE_MANIFEST | media::MEDIA_TYPE_DOCKER_MANIFEST => {
            let manifest: ImageManifest = serde_json::from_slice(bytes).map_err(|e| {
                EdgepackError::InvalidInput(format!("did not have a valid manifest: {}", e))
            })?;
            for (index, layer) in manifest.layers().iter().enumerate() {
                labels.insert(
                    format!("{}.{}", CONTAINERD_GC_REF_PREFIX, index),
                    layer.digest().to_string(),
                );
            }
            labels.insert(
                format!("{}.{}", CONTAINERD_GC_REF_PREFIX, manifest.layers().len()),
                manifest.config().digest().to_string(),
            );
        }
        media::MEDIA_TYPE_OCI_IMAGE_INDEX | media::MEDIA_TYPE_DOCKER_MANIFEST_LIST => {
            let index: ImageIndex = serde_json::from_slice(bytes).map_err(|e| {
                EdgepackError::InvalidInput(format!("did not have a valid index: {}", e))
            })?;
            for (position, manifest) in index.manifests().iter().enumerate() {
                labels.insert(
                    format!("{}.{}", CONTAINERD_GC_REF_PREFIX, position),
                    manifest.digest().to_string(),
                );
            }
        }
        _ => {}
    }

    Ok(labels)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ContentStore for ContainerdStore {
    async fn resolve(&self, reference: &str) -> EdgepackResult<Descriptor> {
        match self.client.get_image(&self.namespace, reference).await? {
            Some(descriptor) => Ok(descriptor),
            None => Err(EdgepackError::NotFound(reference.to_string())),
        }
    }

    async fn fetcher(&self, _reference: &str) -> EdgepackResult<Box<dyn BlobFetcher>> {
        Ok(Box::new(ContainerdFetcher {
            client: self.client.clone(),
            namespace: self.namespace.clone(),
        }))
    }

    async fn pusher(&self, reference: &str) -> EdgepackResult<Box<dyn BlobPusher>> {
        Ok(Box::new(ContainerdPusher {
            client: self.client.clone(),
            namespace: self.namespace.clone(),
            reference: reference.to_string(),
        }))
    }

    async fn finalize(&self, _reference: &str) -> EdgepackResult<()> {
        // The image record and GC labels are written in the same transaction as the manifest
        // commit, so there is nothing left to do here.
        Ok(())
    }
}

#[async_trait]
impl BlobFetcher for ContainerdFetcher {
    async fn fetch(&self, descriptor: &Descriptor) -> EdgepackResult<BlobStream> {
        self.client.reader(&self.namespace, descriptor).await
    }
}

#[async_trait]
impl BlobPusher for ContainerdPusher {
    async fn push(&self, descriptor: &Descriptor) -> EdgepackResult<Box<dyn BlobWriter>> {
        let inner = self
            .client
            .open_writer(
                &self.namespace,
                &descriptor.digest().to_string(),
                descriptor,
            )
            .await?;

        let cache = if media::is_manifest_media_type(&descriptor.media_type().to_string()) {
            Some(Vec::with_capacity(descriptor.size() as usize))
        } else {
            None
        };

        Ok(Box::new(ContainerdWriter {
            inner,
            client: self.client.clone(),
            namespace: self.namespace.clone(),
            reference: self.reference.clone(),
            descriptor: descriptor.clone(),
            cache,
            committed: false,
        }))
    }
}

#[async_trait]
impl BlobWriter for ContainerdWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> EdgepackResult<()> {
        if let Some(cache) = self.cache.as_mut() {
            cache.extend_from_slice(bytes);
        }
        self.inner.write_all(bytes).await
    }

    fn digest(&self) -> Digest {
        self.inner.digest()
    }

    async fn commit(
        &mut self,
        expected_size: u64,
        expected_digest: Option<Digest>,
    ) -> EdgepackResult<()> {
        if self.committed {
            return Ok(());
        }

        self.inner.commit(expected_size, expected_digest).await?;

        if let Some(cache) = self.cache.take() {
            self.client
                .put_image(&self.namespace, &self.reference, &self.descriptor)
                .await?;

            let labels = child_refs(&cache, &self.descriptor.media_type().to_string())?;
            if !labels.is_empty() {
                self.client
                    .update_labels(&self.namespace, self.descriptor.digest(), labels)
                    .await?;
            }
        }

        self.committed = true;
        Ok(())
    }

    async fn close(&mut self) -> EdgepackResult<()> {
        if self.committed {
            return Ok(());
        }
        self.inner.close().await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::{stream, StreamExt};
    use oci_spec::image::{ImageManifestBuilder, MediaType};
    use sha2::{Digest as _, Sha256};
    use tokio::sync::Mutex;

    use super::*;
    use crate::utils::{self, sha256_digest};

    /// An in-memory stand-in for the daemon.
    #[derive(Default)]
    struct FakeContainerd {
        content: Arc<Mutex<HashMap<String, Vec<u8>>>>,
        images: Arc<Mutex<HashMap<String, Descriptor>>>,
        labels: Arc<Mutex<HashMap<String, HashMap<String, String>>>>,
    }

    struct FakeWriter {
        content: Arc<Mutex<HashMap<String, Vec<u8>>>>,
        buffer: Vec<u8>,
        hasher: Sha256,
    }

    #[async_trait]
    impl ContainerdClient for FakeContainerd {
        async fn get_image(
            &self,
            _namespace: &str,
            name: &str,
        ) -> EdgepackResult<Option<Descriptor>> {
            Ok(self.images.lock().await.get(name).cloned())
        }

        async fn put_image(
            &self,
            _namespace: &str,
            name: &str,
            target: &Descriptor,
        ) -> EdgepackResult<()> {
            self.images
                .lock()
                .await
                .insert(name.to_string(), target.clone());
            Ok(())
        }

        async fn open_writer(
            &self,
            _namespace: &str,
            _ref_id: &str,
            _descriptor: &Descriptor,
        ) -> EdgepackResult<Box<dyn BlobWriter>> {
            Ok(Box::new(FakeWriter {
                content: self.content.clone(),
                buffer: Vec::new(),
                hasher: Sha256::new(),
            }))
        }

        async fn reader(
            &self,
            _namespace: &str,
            descriptor: &Descriptor,
        ) -> EdgepackResult<BlobStream> {
            let content = self.content.lock().await;
            match content.get(&descriptor.digest().to_string()) {
                Some(bytes) => {
                    let bytes = Bytes::from(bytes.clone());
                    Ok(stream::once(async move { Ok(bytes) }).boxed())
                }
                None => Err(EdgepackError::NotFound(descriptor.digest().to_string())),
            }
        }

        async fn update_labels(
            &self,
            _namespace: &str,
            digest: &Digest,
            labels: HashMap<String, String>,
        ) -> EdgepackResult<()> {
            self.labels
                .lock()
                .await
                .entry(digest.to_string())
                .or_default()
                .extend(labels);
            Ok(())
        }
    }

    #[async_trait]
    impl BlobWriter for FakeWriter {
        async fn write_all(&mut self, bytes: &[u8]) -> EdgepackResult<()> {
            self.buffer.extend_from_slice(bytes);
            self.hasher.update(bytes);
            Ok(())
        }

        fn digest(&self) -> Digest {
            utils::digest_from_sha256(self.hasher.clone().finalize().as_slice())
        }

        async fn commit(
            &mut self,
            _expected_size: u64,
            _expected_digest: Option<Digest>,
        ) -> EdgepackResult<()> {
            let digest = self.digest();
            self.content
                .lock()
                .await
                .insert(digest.to_string(), std::mem::take(&mut self.buffer));
            Ok(())
        }

        async fn close(&mut self) -> EdgepackResult<()> {
            Ok(())
        }
    }

    async fn push_bytes(
        store: &ContainerdStore,
        reference: &str,
        media_type: &str,
        content: &[u8],
    ) -> EdgepackResult<Descriptor> {
        let descriptor = utils::new_descriptor(
            media_type,
            sha256_digest(content),
            content.len() as u64,
            HashMap::new(),
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
    async fn test_containerd_manifest_commit_writes_image_and_gc_labels() -> anyhow::Result<()> {
        let client = Arc::new(FakeContainerd::default());
        let store = ContainerdStore::new(client.clone(), "");
        let reference = "docker.io/library/eve:1.0";

        let layer = push_bytes(&store, reference, media::MEDIA_TYPE_ECI_KERNEL, b"kernel").await?;
        let config = push_bytes(&store, reference, media::MEDIA_TYPE_OCI_IMAGE_CONFIG, b"{}").await?;

        let manifest = ImageManifestBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageManifest)
            .config(config.clone())
            .layers(vec![layer.clone()])
            .build()?;
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let manifest_descriptor = push_bytes(
            &store,
            reference,
            media::MEDIA_TYPE_OCI_IMAGE_MANIFEST,
            &manifest_bytes,
        )
        .await?;

        // The image record now points at the manifest.
        let resolved = store.resolve(reference).await?;
        assert_eq!(resolved.digest(), manifest_descriptor.digest());

        // The GC labels reference every child: layers first, config last.
        let labels = client.labels.lock().await;
        let manifest_labels = labels
            .get(&manifest_descriptor.digest().to_string())
            .expect("labels attached to manifest");
        assert_eq!(
            manifest_labels.get("containerd.io/gc.ref.content.0"),
            Some(&layer.digest().to_string())
        );
        assert_eq!(
            manifest_labels.get("containerd.io/gc.ref.content.1"),
            Some(&config.digest().to_string())
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_containerd_layer_commit_attaches_nothing() -> anyhow::Result<()> {
        let client = Arc::new(FakeContainerd::default());
        let store = ContainerdStore::new(client.clone(), "eve");

        push_bytes(
            &store,
            "docker.io/library/eve:1.0",
            media::MEDIA_TYPE_ECI_INITRD,
            b"initrd",
        )
        .await?;

        assert!(client.images.lock().await.is_empty());
        assert!(client.labels.lock().await.is_empty());
        Ok(())
    }

    #[test]
    fn test_containerd_connect_is_unavailable_without_client() {
        let err = ContainerdStore::connect("/run/containerd/containerd.sock", "default")
            .unwrap_err();
        assert!(matches!(err, EdgepackError::BackendUnavailable(_)));
    }
}
