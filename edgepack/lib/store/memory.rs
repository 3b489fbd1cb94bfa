use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use oci_spec::image::Descriptor;
use tokio::sync::RwLock;

use crate::{media, utils, EdgepackError, EdgepackResult};

use super::{BlobFetcher, BlobStream};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An in-memory content store for synthesized blobs, e.g. the generated OCI image
/// configuration or memory-backed sources.
///
/// The store is mutated only while an image is being built and is read-only afterwards, when
/// it serves as one leg of the provider handed to the push orchestrator. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    blobs: Arc<RwLock<HashMap<String, Bytes>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a blob under the given title and media type, returning its descriptor.
    pub async fn add(
        &self,
        name: &str,
        media_type: &str,
        content: impl Into<Bytes>,
    ) -> EdgepackResult<Descriptor> {
        let content = content.into();
        let digest = utils::sha256_digest(&content);
        let size = content.len() as u64;

        self.blobs
            .write()
            .await
            .insert(digest.to_string(), content);

        utils::new_descriptor(
            media_type,
            digest,
            size,
            HashMap::from([(media::ANNOTATION_TITLE.to_string(), name.to_string())]),
        )
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl BlobFetcher for MemoryStore {
    async fn fetch(&self, descriptor: &Descriptor) -> EdgepackResult<BlobStream> {
        let blobs = self.blobs.read().await;
        match blobs.get(&descriptor.digest().to_string()) {
            Some(bytes) => {
                let bytes = bytes.clone();
                Ok(stream::once(async move { Ok(bytes) }).boxed())
            }
            None => Err(EdgepackError::NotFound(descriptor.digest().to_string())),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;
    use crate::utils::sha256_digest;

    #[tokio::test]
    async fn test_memory_store_add_and_fetch() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let descriptor = store
            .add("config.json", media::MEDIA_TYPE_OCI_IMAGE_CONFIG, &b"{}"[..])
            .await?;

        assert_eq!(descriptor.size(), 2);
        assert_eq!(descriptor.digest(), &sha256_digest(b"{}"));
        assert_eq!(
            utils::descriptor_title(&descriptor).as_deref(),
            Some("config.json")
        );

        let chunks: Vec<Bytes> = store.fetch(&descriptor).await?.try_collect().await?;
        assert_eq!(chunks.concat(), b"{}");

        Ok(())
    }

    #[tokio::test]
    async fn test_memory_store_unknown_digest_is_not_found() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let descriptor = utils::new_descriptor(
            media::MEDIA_TYPE_ECI_KERNEL,
            sha256_digest(b"missing"),
            7,
            Default::default(),
        )?;

        assert!(matches!(
            store.fetch(&descriptor).await,
            Err(EdgepackError::NotFound(_))
        ));

        Ok(())
    }
}
