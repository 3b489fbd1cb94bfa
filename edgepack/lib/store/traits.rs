use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use oci_spec::image::{Descriptor, Digest};

use crate::EdgepackResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A stream of blob bytes.
pub type BlobStream = BoxStream<'static, EdgepackResult<Bytes>>;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A content store an image can be pushed to and pulled from.
///
/// Implementations address three very different backends (an OCI registry over HTTP, a local
/// directory laid out as an OCI blob store, and a containerd daemon) behind the same four
/// operations, so the push and pull orchestrators never see backend specifics.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Resolves a reference to the descriptor of its manifest.
    async fn resolve(&self, reference: &str) -> EdgepackResult<Descriptor>;

    /// Opens a fetcher for blobs reachable from the given reference.
    async fn fetcher(&self, reference: &str) -> EdgepackResult<Box<dyn BlobFetcher>>;

    /// Opens a pusher for ingesting blobs under the given reference.
    async fn pusher(&self, reference: &str) -> EdgepackResult<Box<dyn BlobPusher>>;

    /// Runs backend-specific post-commit work, e.g. flushing a tags index. A no-op for
    /// backends that commit everything eagerly.
    async fn finalize(&self, reference: &str) -> EdgepackResult<()>;
}

/// Retrieves blob bytes by descriptor.
#[async_trait]
pub trait BlobFetcher: Send + Sync {
    /// Opens a sequential stream over the blob the descriptor names.
    async fn fetch(&self, descriptor: &Descriptor) -> EdgepackResult<BlobStream>;
}

/// Opens ingestion channels for blobs addressed by descriptor.
#[async_trait]
pub trait BlobPusher: Send + Sync {
    /// Opens a writer for the blob the descriptor names. The descriptor acts as a hint: its
    /// digest and size are what `commit` will be verified against.
    async fn push(&self, descriptor: &Descriptor) -> EdgepackResult<Box<dyn BlobWriter>>;
}

/// An ingestion channel for one blob.
///
/// A writer is `Open` until either `commit` or `close` is called. `commit` verifies the
/// expected size and digest against what was written and fails with a size or digest mismatch
/// when they disagree; committing a blob the backend already holds succeeds. `close` without
/// commit discards the bytes and leaves no observable artifact in the backend.
#[async_trait]
pub trait BlobWriter: Send {
    /// Appends bytes to the blob.
    async fn write_all(&mut self, bytes: &[u8]) -> EdgepackResult<()>;

    /// Returns the digest of the bytes written so far.
    fn digest(&self) -> Digest;

    /// Verifies and commits the blob. `expected_size` of zero and `expected_digest` of `None`
    /// skip the respective verification, for decorated writers whose output differs from the
    /// wire bytes.
    async fn commit(
        &mut self,
        expected_size: u64,
        expected_digest: Option<Digest>,
    ) -> EdgepackResult<()>;

    /// Discards the writer without committing.
    async fn close(&mut self) -> EdgepackResult<()>;
}

/// A destination layers can be pulled into: a directory of files or a set of role-keyed
/// sinks.
#[async_trait]
pub trait Ingester: Send + Sync {
    /// Opens a writer for the given descriptor, or returns `None` when the destination has no
    /// interest in it (the layer is skipped).
    async fn writer(&self, descriptor: &Descriptor) -> EdgepackResult<Option<Box<dyn BlobWriter>>>;
}
