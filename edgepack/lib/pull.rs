//! The pull orchestrator: resolves a reference, streams the allowed layers into a
//! destination (decompressing where the media type calls for it) and restores the artifact
//! skeleton.

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use futures::StreamExt;
use getset::Getters;
use oci_spec::image::{Descriptor, ImageManifest};
use tokio::{io::AsyncWrite, sync::Mutex};
use tokio_util::sync::CancellationToken;

use crate::{
    artifact::Artifact,
    media,
    progress::{NoopProgress, ProgressTracker},
    store::{BlobFetcher, BlobWriter, ContentStore, DecompressStore, Ingester},
    utils, EdgepackError, EdgepackResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Pulls an image from a content store into a destination.
#[derive(Getters)]
#[getset(get = "pub with_prefix")]
pub struct Puller {
    /// The image reference to pull.
    image: String,
}

/// Optional knobs for a pull.
pub struct PullOpts {
    /// Blocksize for the decompress pipeline; zero selects the default.
    pub blocksize: usize,

    /// Progress sink for per-blob status.
    pub progress: Arc<dyn ProgressTracker>,

    /// Cooperative cancellation token.
    pub cancel: CancellationToken,
}

type SinkBox = Box<dyn AsyncWrite + Send + Unpin>;

/// A pull destination that streams each role into a caller-supplied sink instead of a
/// directory, e.g. straight into files opened by the CLI's `pullfiles`.
///
/// Each sink is handed out once; further layers of the same role are skipped.
#[derive(Default)]
pub struct FilesTarget {
    kernel: Mutex<Option<SinkBox>>,
    initrd: Mutex<Option<SinkBox>>,
    root: Mutex<Option<SinkBox>>,
    config: Mutex<Option<SinkBox>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Puller {
    /// Creates a puller for the given image reference.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
        }
    }

    /// Pulls the image: resolves the reference, verifies and parses the manifest, streams
    /// the config and every layer into the target (decompressing content whose media type
    /// calls for it), and rebuilds the artifact skeleton from the layer descriptors.
    ///
    /// Fails with an unsupported-media-type error when the manifest carries a descriptor
    /// outside the allowed set.
    pub async fn pull(
        &self,
        store: &dyn ContentStore,
        target: Arc<dyn Ingester>,
        opts: PullOpts,
    ) -> EdgepackResult<(Descriptor, Artifact)> {
        if self.image.is_empty() {
            return Err(EdgepackError::ImageReference(
                "must have valid image ref".into(),
            ));
        }

        let manifest_descriptor = store.resolve(&self.image).await?;
        let manifest_media_type = manifest_descriptor.media_type().to_string();
        if manifest_media_type == media::MEDIA_TYPE_OCI_IMAGE_INDEX
            || manifest_media_type == media::MEDIA_TYPE_DOCKER_MANIFEST_LIST
        {
            // Multi-platform images are out of scope; an edge container image is always a
            // single manifest.
            return Err(EdgepackError::UnsupportedMediaType(manifest_media_type));
        }

        let fetcher = store.fetcher(&self.image).await?;

        let mut manifest_bytes = Vec::with_capacity(manifest_descriptor.size() as usize);
        let mut stream = fetcher.fetch(&manifest_descriptor).await?;
        while let Some(chunk) = stream.next().await {
            manifest_bytes.extend_from_slice(&chunk?);
        }
        let actual_digest = utils::sha256_digest(&manifest_bytes);
        if &actual_digest != manifest_descriptor.digest() {
            return Err(EdgepackError::DigestMismatch {
                expected: manifest_descriptor.digest().to_string(),
                actual: actual_digest.to_string(),
            });
        }

        let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)?;

        let allowed: HashSet<&str> = media::all_media_types().into_iter().collect();
        let mut contents: Vec<&Descriptor> = Vec::with_capacity(manifest.layers().len() + 1);
        contents.push(manifest.config());
        contents.extend(manifest.layers().iter());
        for descriptor in &contents {
            let media_type = descriptor.media_type().to_string();
            if !allowed.contains(media_type.as_str()) {
                return Err(EdgepackError::UnsupportedMediaType(media_type));
            }
        }

        let target = DecompressStore::new(target, opts.blocksize);
        let transfers = contents
            .iter()
            .map(|descriptor| pull_blob(fetcher.as_ref(), &target, descriptor, &opts));
        futures::future::try_join_all(transfers).await?;

        let artifact = Artifact::from_layers(manifest.layers());
        Ok((manifest_descriptor, artifact))
    }
}

impl FilesTarget {
    /// Creates a target with no sinks; every layer is skipped until roles are attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the sink the kernel layer streams into.
    pub fn with_kernel(mut self, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.kernel = Mutex::new(Some(Box::new(sink)));
        self
    }

    /// Attaches the sink the initrd layer streams into.
    pub fn with_initrd(mut self, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.initrd = Mutex::new(Some(Box::new(sink)));
        self
    }

    /// Attaches the sink the root disk layer streams into.
    pub fn with_root(mut self, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.root = Mutex::new(Some(Box::new(sink)));
        self
    }

    /// Attaches the sink the config blob streams into.
    pub fn with_config(mut self, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.config = Mutex::new(Some(Box::new(sink)));
        self
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn pull_blob(
    fetcher: &dyn BlobFetcher,
    target: &dyn Ingester,
    descriptor: &Descriptor,
    opts: &PullOpts,
) -> EdgepackResult<()> {
    let Some(mut writer) = target.writer(descriptor).await? else {
        tracing::debug!("destination has no writer for {}, skipping", descriptor.digest());
        return Ok(());
    };

    let name = utils::descriptor_title(descriptor)
        .unwrap_or_else(|| descriptor.media_type().to_string());
    opts.progress
        .start(descriptor.digest(), &name, descriptor.size());

    let result = async {
        let mut stream = fetcher.fetch(descriptor).await?;
        while let Some(chunk) = stream.next().await {
            if opts.cancel.is_cancelled() {
                return Err(EdgepackError::Cancelled);
            }
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            opts.progress.update(descriptor.digest(), chunk.len() as u64);
        }
        writer
            .commit(descriptor.size(), Some(descriptor.digest().clone()))
            .await
    }
    .await;

    match result {
        Ok(()) => {
            opts.progress.finish(descriptor.digest(), &name);
            Ok(())
        }
        Err(err) => {
            let _ = writer.close().await;
            Err(err)
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for PullOpts {
    fn default() -> Self {
        Self {
            blocksize: 0,
            progress: Arc::new(NoopProgress),
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Ingester for FilesTarget {
    async fn writer(&self, descriptor: &Descriptor) -> EdgepackResult<Option<Box<dyn BlobWriter>>> {
        let role = utils::descriptor_annotation(descriptor, media::ANNOTATION_ROLE);
        let media_type = descriptor.media_type().to_string();

        let slot = match role.as_deref() {
            Some(media::ROLE_KERNEL) => &self.kernel,
            Some(media::ROLE_INITRD) => &self.initrd,
            Some(media::ROLE_ROOT_DISK) => &self.root,
            _ if media_type == media::MEDIA_TYPE_ECI_CONFIG
                || media_type == media::MEDIA_TYPE_OCI_IMAGE_CONFIG =>
            {
                &self.config
            }
            _ => return Ok(None),
        };

        let sink = slot.lock().await.take();
        Ok(sink.map(|sink| Box::new(crate::store::IoWriter::new(sink)) as Box<dyn BlobWriter>))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{store::DirectoryStore, utils::sha256_digest};

    #[tokio::test]
    async fn test_pull_rejects_empty_reference() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = DirectoryStore::new(dir.path()).await?;
        let target = Arc::new(FilesTarget::new());

        let err = Puller::new("")
            .pull(&store, target, PullOpts::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("must have valid image ref"));
        Ok(())
    }

    #[tokio::test]
    async fn test_pull_unknown_reference_is_not_found() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = DirectoryStore::new(dir.path()).await?;
        let target = Arc::new(FilesTarget::new());

        let err = Puller::new("docker.io/library/missing:1.0")
            .pull(&store, target, PullOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EdgepackError::NotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_files_target_routes_by_role() -> anyhow::Result<()> {
        let target = FilesTarget::new().with_kernel(Vec::new());

        let kernel_descriptor = utils::new_descriptor(
            media::MEDIA_TYPE_ECI_KERNEL,
            sha256_digest(b"kernel"),
            6,
            HashMap::from([
                (media::ANNOTATION_TITLE.to_string(), "kernel".to_string()),
                (
                    media::ANNOTATION_ROLE.to_string(),
                    media::ROLE_KERNEL.to_string(),
                ),
            ]),
        )?;

        // First request hands out the sink, the second finds it gone.
        assert!(target.writer(&kernel_descriptor).await?.is_some());
        assert!(target.writer(&kernel_descriptor).await?.is_none());

        // A role with no sink attached is skipped.
        let initrd_descriptor = utils::new_descriptor(
            media::MEDIA_TYPE_ECI_INITRD,
            sha256_digest(b"initrd"),
            6,
            HashMap::from([(
                media::ANNOTATION_ROLE.to_string(),
                media::ROLE_INITRD.to_string(),
            )]),
        )?;
        assert!(target.writer(&initrd_descriptor).await?.is_none());

        Ok(())
    }
}
