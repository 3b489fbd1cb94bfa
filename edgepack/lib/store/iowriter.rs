use async_trait::async_trait;
use oci_spec::image::Digest;
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{utils, EdgepackError, EdgepackResult};

use super::BlobWriter;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`BlobWriter`] over an arbitrary async sink, so a pulled layer can be streamed straight
/// into an open file, device or pipe.
pub struct IoWriter {
    sink: Box<dyn AsyncWrite + Send + Unpin>,
    hasher: Sha256,
    size: u64,
    committed: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl IoWriter {
    /// Wraps the given sink.
    pub fn new(sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            hasher: Sha256::new(),
            size: 0,
            committed: false,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl BlobWriter for IoWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> EdgepackResult<()> {
        self.sink.write_all(bytes).await?;
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
        self.sink.flush().await?;

        if expected_size > 0 && expected_size != self.size {
            return Err(EdgepackError::SizeMismatch {
                expected: expected_size,
                actual: self.size,
            });
        }
        if let Some(expected) = expected_digest {
            let actual = self.digest();
            if actual != expected {
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
        self.sink.flush().await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::sha256_digest;

    #[tokio::test]
    async fn test_io_writer_hashes_and_verifies() -> anyhow::Result<()> {
        let (client, mut server) = tokio::io::duplex(64);

        let mut writer = IoWriter::new(client);
        writer.write_all(b"ker").await?;
        writer.write_all(b"nel").await?;
        assert_eq!(writer.digest(), sha256_digest(b"kernel"));
        writer.commit(6, Some(sha256_digest(b"kernel"))).await?;
        drop(writer);

        let mut sink = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut sink).await?;
        assert_eq!(sink, b"kernel");
        Ok(())
    }

    #[tokio::test]
    async fn test_io_writer_size_mismatch() -> anyhow::Result<()> {
        let mut writer = IoWriter::new(Vec::new());
        writer.write_all(b"abc").await?;
        assert!(matches!(
            writer.commit(4, None).await,
            Err(EdgepackError::SizeMismatch { .. })
        ));
        Ok(())
    }
}
