use std::sync::Arc;

use async_trait::async_trait;
use oci_spec::image::Descriptor;

use crate::{EdgepackError, EdgepackResult};

use super::{BlobFetcher, BlobStream};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The logical union of several blob fetchers.
///
/// Lookups try each fetcher in insertion order and return the first hit; a provider that does
/// not hold a blob answers `NotFound` and the next one is consulted. The layering core uses
/// this to hand a single provider over its file-backed and memory-backed stores to the push
/// orchestrator.
#[derive(Clone, Default)]
pub struct MultiFetcher {
    fetchers: Vec<Arc<dyn BlobFetcher>>,
}

impl std::fmt::Debug for MultiFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiFetcher")
            .field("fetchers", &self.fetchers.len())
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MultiFetcher {
    /// Creates an empty union.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fetcher to the lookup order.
    pub fn add_fetcher(&mut self, fetcher: Arc<dyn BlobFetcher>) {
        self.fetchers.push(fetcher);
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl BlobFetcher for MultiFetcher {
    async fn fetch(&self, descriptor: &Descriptor) -> EdgepackResult<BlobStream> {
        for fetcher in &self.fetchers {
            match fetcher.fetch(descriptor).await {
                Ok(stream) => return Ok(stream),
                Err(EdgepackError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(EdgepackError::NotFound(descriptor.digest().to_string()))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
