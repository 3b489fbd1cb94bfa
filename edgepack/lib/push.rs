//! The push orchestrator: builds the manifest and drives it into a content store.

use std::{collections::HashMap, sync::Arc};

use futures::StreamExt;
use getset::Getters;
use oci_spec::image::Descriptor;
use tokio_util::sync::CancellationToken;

use crate::{
    artifact::Artifact,
    manifest::{ConfigOpts, LegacyOpts},
    media::{self, Format},
    progress::{NoopProgress, ProgressTracker},
    store::{BlobPusher, BlobStream, BlobWriter, ContentStore, MultiFetcher},
    utils, EdgepackError, EdgepackResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Pushes one artifact to a content store under an image reference.
#[derive(Getters)]
#[getset(get = "pub with_prefix")]
pub struct Pusher {
    /// The artifact to push.
    artifact: Artifact,

    /// The image reference to push to, e.g. `docker.io/lfedge/eve:1.0`.
    image: String,
}

/// Optional knobs for a push.
pub struct PushOpts {
    /// Legacy-format options. When the format is legacy and no scratch directory is given,
    /// the pusher creates one and removes it when the push finishes.
    pub legacy: LegacyOpts,

    /// Progress sink for per-blob status.
    pub progress: Arc<dyn ProgressTracker>,

    /// Cooperative cancellation token.
    pub cancel: CancellationToken,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Pusher {
    /// Creates a pusher for the given artifact and image reference.
    pub fn new(artifact: Artifact, image: impl Into<String>) -> Self {
        Self {
            artifact,
            image: image.into(),
        }
    }

    /// Builds the image in the given format and pushes it: every referenced blob first, the
    /// manifest strictly last, then the store's finalize step. Returns the manifest digest.
    pub async fn push(
        &self,
        store: &dyn ContentStore,
        format: Format,
        config_opts: &ConfigOpts,
        opts: PushOpts,
    ) -> EdgepackResult<String> {
        if self.image.is_empty() {
            return Err(EdgepackError::ImageReference(
                "must have valid image ref".into(),
            ));
        }
        if self.artifact.is_empty() {
            return Err(EdgepackError::InvalidInput("must have valid artifact".into()));
        }

        // Scratch space for legacy compression, cleaned up when this function returns.
        let mut legacy = opts.legacy.clone();
        let _scratch = match format {
            Format::Legacy if legacy.get_tmp_dir().is_none() => {
                let dir = tempfile::tempdir()?;
                legacy = legacy.with_tmp_dir(dir.path());
                Some(dir)
            }
            _ => None,
        };

        let (manifest, provider) = self.artifact.manifest(format, config_opts, &legacy).await?;

        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let manifest_descriptor = utils::new_descriptor(
            media::MEDIA_TYPE_OCI_IMAGE_MANIFEST,
            utils::sha256_digest(&manifest_bytes),
            manifest_bytes.len() as u64,
            HashMap::new(),
        )?;

        let pusher = store.pusher(&self.image).await?;

        // Every blob the manifest references is committed before the manifest itself goes
        // up, so a failed push never leaves a manifest pointing at missing content.
        let mut blobs: Vec<Descriptor> = manifest.layers().clone();
        blobs.push(manifest.config().clone());
        let transfers = blobs
            .iter()
            .map(|descriptor| push_blob(pusher.as_ref(), &provider, descriptor, &opts));
        futures::future::try_join_all(transfers).await?;

        let mut writer = pusher.push(&manifest_descriptor).await?;
        writer.write_all(&manifest_bytes).await?;
        writer
            .commit(
                manifest_bytes.len() as u64,
                Some(manifest_descriptor.digest().clone()),
            )
            .await?;

        store.finalize(&self.image).await?;

        Ok(manifest_descriptor.digest().to_string())
    }
}

impl Default for PushOpts {
    fn default() -> Self {
        Self {
            legacy: LegacyOpts::default(),
            progress: Arc::new(NoopProgress),
            cancel: CancellationToken::new(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn push_blob(
    pusher: &dyn BlobPusher,
    provider: &MultiFetcher,
    descriptor: &Descriptor,
    opts: &PushOpts,
) -> EdgepackResult<()> {
    use crate::store::BlobFetcher;

    let name = utils::descriptor_title(descriptor)
        .unwrap_or_else(|| descriptor.media_type().to_string());
    opts.progress
        .start(descriptor.digest(), &name, descriptor.size());

    let stream = provider.fetch(descriptor).await?;
    let mut writer = pusher.push(descriptor).await?;

    match copy_blob(stream, writer.as_mut(), descriptor, opts).await {
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

async fn copy_blob(
    mut stream: BlobStream,
    writer: &mut dyn BlobWriter,
    descriptor: &Descriptor,
    opts: &PushOpts,
) -> EdgepackResult<()> {
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

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Source;

    #[tokio::test]
    async fn test_push_rejects_empty_reference() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = crate::store::DirectoryStore::new(dir.path()).await?;

        let artifact = Artifact {
            kernel: Some(Source::memory("kernel", &b"kernel"[..])),
            ..Default::default()
        };
        let err = Pusher::new(artifact, "")
            .push(
                &store,
                Format::Artifacts,
                &ConfigOpts::default(),
                PushOpts::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("must have valid image ref"));
        Ok(())
    }

    #[tokio::test]
    async fn test_push_rejects_empty_artifact() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = crate::store::DirectoryStore::new(dir.path()).await?;

        let err = Pusher::new(Artifact::default(), "docker.io/library/eve:1.0")
            .push(
                &store,
                Format::Artifacts,
                &ConfigOpts::default(),
                PushOpts::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("must have valid artifact"));
        Ok(())
    }

    #[tokio::test]
    async fn test_push_cancellation_aborts() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = crate::store::DirectoryStore::new(dir.path()).await?;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let artifact = Artifact {
            kernel: Some(Source::memory("kernel", &b"kernel"[..])),
            ..Default::default()
        };
        let err = Pusher::new(artifact, "docker.io/library/eve:1.0")
            .push(
                &store,
                Format::Artifacts,
                &ConfigOpts::default(),
                PushOpts {
                    cancel,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EdgepackError::Cancelled));
        Ok(())
    }
}
