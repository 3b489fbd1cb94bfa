//! Writer decorators that transparently gunzip and untar pulled content.
//!
//! A layer whose media type ends in `+gzip` is run through a gunzip stage, and one whose
//! (remaining) media type ends in `.tar` through an untar stage that concatenates the regular
//! file entries. Each stage is a producer/consumer pair: the writer feeds wire bytes into a
//! bounded pipe, a blocking thread decodes them, and a pump task forwards the decoded bytes to
//! the downstream writer. The terminal decoder error travels back to `commit`, which always
//! joins the pipeline before verifying and committing downstream.

use std::{
    io::{Read, Write},
    sync::Arc,
};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use oci_spec::image::{Descriptor, Digest};
use sha2::{Digest as _, Sha256};
use tar::Archive;
use tokio::{sync::mpsc, task};

use crate::{utils, EdgepackError, EdgepackResult};

use super::{BlobWriter, Ingester};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The blocksize used for decoding when the caller passes zero.
pub const DEFAULT_BLOCKSIZE: usize = 32 * 1024;

const PIPE_DEPTH: usize = 4;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An [`Ingester`] decorator that decompresses content whose media type indicates compression
/// before handing it to the wrapped ingester.
pub struct DecompressStore {
    ingester: Arc<dyn Ingester>,
    blocksize: usize,
}

/// The decoding applied by one pipeline stage.
enum Decoder {
    Gunzip,
    Untar,
}

/// A writer that pushes incoming bytes through a decoder running on a blocking thread while
/// hashing the wire bytes for commit-time verification.
struct PassthroughWriter {
    input_tx: Option<mpsc::Sender<Vec<u8>>>,
    decoder: Option<task::JoinHandle<EdgepackResult<()>>>,
    pump: Option<task::JoinHandle<EdgepackResult<Box<dyn BlobWriter>>>>,
    hasher: Sha256,
    size: u64,
    committed: bool,
}

/// Blocking reader over the input pipe, fed to the decoder.
struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    buffer: Vec<u8>,
    offset: usize,
}

/// Blocking writer into the output pipe, fed by the decoder.
struct ChannelSink {
    tx: mpsc::Sender<Vec<u8>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DecompressStore {
    /// Wraps an ingester. A `blocksize` of zero selects [`DEFAULT_BLOCKSIZE`].
    pub fn new(ingester: Arc<dyn Ingester>, blocksize: usize) -> Self {
        Self {
            ingester,
            blocksize: effective_blocksize(blocksize),
        }
    }
}

impl PassthroughWriter {
    fn new(inner: Box<dyn BlobWriter>, blocksize: usize, kind: Decoder) -> Self {
        let blocksize = effective_blocksize(blocksize);
        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(PIPE_DEPTH);
        let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(PIPE_DEPTH);

        let decoder = task::spawn_blocking(move || {
            let reader = ChannelReader {
                rx: input_rx,
                buffer: Vec::new(),
                offset: 0,
            };
            let sink = ChannelSink { tx: output_tx };
            match kind {
                Decoder::Gunzip => gunzip(reader, sink, blocksize),
                Decoder::Untar => untar(reader, sink, blocksize),
            }
        });

        let pump = task::spawn(async move {
            let mut inner = inner;
            while let Some(chunk) = output_rx.recv().await {
                inner.write_all(&chunk).await?;
            }
            Ok(inner)
        });

        Self {
            input_tx: Some(input_tx),
            decoder: Some(decoder),
            pump: Some(pump),
            hasher: Sha256::new(),
            size: 0,
            committed: false,
        }
    }

    /// Closes the input pipe and joins the decoder and pump, returning the downstream writer.
    ///
    /// A failure in the pump (the downstream writer) wins over the broken-pipe error it causes
    /// in the decoder; otherwise the decoder's terminal error is propagated.
    async fn shutdown(&mut self) -> EdgepackResult<Box<dyn BlobWriter>> {
        self.input_tx.take();

        let decoder_result = match self.decoder.take() {
            Some(handle) => handle.await.map_err(EdgepackError::custom)?,
            None => Ok(()),
        };
        let pump_result = match self.pump.take() {
            Some(handle) => handle.await.map_err(EdgepackError::custom)?,
            None => return Err(EdgepackError::WriterClosed("decompress pipeline".into())),
        };

        let inner = pump_result?;
        decoder_result?;
        Ok(inner)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks whether a media type indicates gzip compression and/or a tar stream. The `+gzip`
/// suffix is stripped before the `.tar` suffix is probed, so `...tar+gzip` reports both.
pub fn media_type_compression(media_type: &str) -> (bool, bool) {
    let mut media_type = media_type;
    let mut gzip = false;
    if let Some(stripped) = media_type.strip_suffix("+gzip") {
        media_type = stripped;
        gzip = true;
    }
    let tar = media_type.ends_with(".tar");
    (gzip, tar)
}

/// Wraps a writer with the decompression stages its media type calls for. A media type with
/// no compression suffix returns the writer unchanged.
pub fn decompress_writer(
    writer: Box<dyn BlobWriter>,
    media_type: &str,
    blocksize: usize,
) -> Box<dyn BlobWriter> {
    let (gzip, tar) = media_type_compression(media_type);
    let mut writer = writer;
    if tar {
        writer = Box::new(PassthroughWriter::new(writer, blocksize, Decoder::Untar));
    }
    if gzip {
        writer = Box::new(PassthroughWriter::new(writer, blocksize, Decoder::Gunzip));
    }
    writer
}

fn effective_blocksize(blocksize: usize) -> usize {
    if blocksize == 0 {
        DEFAULT_BLOCKSIZE
    } else {
        blocksize
    }
}

/// Decodes a gzip stream, forwarding decompressed bytes downstream.
fn gunzip(reader: ChannelReader, mut sink: ChannelSink, blocksize: usize) -> EdgepackResult<()> {
    let mut decoder = GzDecoder::new(reader);
    let mut buffer = vec![0u8; blocksize];
    loop {
        let read = decoder
            .read(&mut buffer)
            .map_err(|e| EdgepackError::custom(anyhow::anyhow!("gunzip: data read error: {}", e)))?;
        if read == 0 {
            return Ok(());
        }
        sink.write_all(&buffer[..read])
            .map_err(|e| EdgepackError::custom(anyhow::anyhow!("gunzip: write error: {}", e)))?;
    }
}

/// Reads a tar stream, concatenating the data of its regular-file entries downstream.
fn untar(reader: ChannelReader, mut sink: ChannelSink, blocksize: usize) -> EdgepackResult<()> {
    let mut archive = Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| EdgepackError::custom(anyhow::anyhow!("untar: header read error: {}", e)))?;

    let mut buffer = vec![0u8; blocksize];
    for entry in entries {
        let mut entry = entry
            .map_err(|e| EdgepackError::custom(anyhow::anyhow!("untar: header read error: {}", e)))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        loop {
            let read = entry.read(&mut buffer).map_err(|e| {
                EdgepackError::custom(anyhow::anyhow!("untar: data read error: {}", e))
            })?;
            if read == 0 {
                break;
            }
            sink.write_all(&buffer[..read])
                .map_err(|e| EdgepackError::custom(anyhow::anyhow!("untar: write error: {}", e)))?;
        }
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Ingester for DecompressStore {
    async fn writer(&self, descriptor: &Descriptor) -> EdgepackResult<Option<Box<dyn BlobWriter>>> {
        let Some(inner) = self.ingester.writer(descriptor).await? else {
            return Ok(None);
        };
        Ok(Some(decompress_writer(
            inner,
            &descriptor.media_type().to_string(),
            self.blocksize,
        )))
    }
}

#[async_trait]
impl BlobWriter for PassthroughWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> EdgepackResult<()> {
        let tx = self
            .input_tx
            .as_ref()
            .ok_or_else(|| EdgepackError::WriterClosed("decompress pipeline".into()))?;

        if tx.send(bytes.to_vec()).await.is_err() {
            // The decoder bailed out; surface its terminal error instead of a pipe error.
            let error = match self.shutdown().await {
                Ok(mut inner) => {
                    let _ = inner.close().await;
                    EdgepackError::WriterClosed("decompress pipeline".into())
                }
                Err(err) => err,
            };
            return Err(error);
        }

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

        let mut inner = self.shutdown().await?;

        if expected_size > 0 && expected_size != self.size {
            let _ = inner.close().await;
            return Err(EdgepackError::SizeMismatch {
                expected: expected_size,
                actual: self.size,
            });
        }
        if let Some(expected) = expected_digest {
            let actual = self.digest();
            if actual != expected {
                let _ = inner.close().await;
                return Err(EdgepackError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        // The downstream writer saw decoded bytes, not the wire bytes, so it commits without
        // expectations of its own.
        inner.commit(0, None).await?;
        self.committed = true;
        Ok(())
    }

    async fn close(&mut self) -> EdgepackResult<()> {
        if self.committed {
            return Ok(());
        }
        if let Ok(mut inner) = self.shutdown().await {
            let _ = inner.close().await;
        }
        Ok(())
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.offset >= self.buffer.len() {
            match self.rx.blocking_recv() {
                Some(chunk) => {
                    self.buffer = chunk;
                    self.offset = 0;
                }
                None => return Ok(0),
            }
        }

        let available = &self.buffer[self.offset..];
        let count = available.len().min(buf.len());
        buf[..count].copy_from_slice(&available[..count]);
        self.offset += count;
        Ok(count)
    }
}

impl Write for ChannelSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx.blocking_send(buf.to_vec()).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "downstream writer went away",
            )
        })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    };

    use super::*;
    use crate::{media, tgz, utils::sha256_digest};

    #[derive(Clone, Default)]
    struct CaptureWriter {
        bytes: Arc<Mutex<Vec<u8>>>,
        committed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl BlobWriter for CaptureWriter {
        async fn write_all(&mut self, bytes: &[u8]) -> EdgepackResult<()> {
            self.bytes.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }

        fn digest(&self) -> Digest {
            sha256_digest(&self.bytes.lock().unwrap())
        }

        async fn commit(
            &mut self,
            _expected_size: u64,
            _expected_digest: Option<Digest>,
        ) -> EdgepackResult<()> {
            self.committed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&mut self) -> EdgepackResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_decompress_media_type_detection() {
        assert_eq!(
            media_type_compression(media::MEDIA_TYPE_OCI_IMAGE_LAYER_GZIP),
            (true, true)
        );
        assert_eq!(
            media_type_compression(media::MEDIA_TYPE_OCI_IMAGE_LAYER),
            (false, true)
        );
        assert_eq!(media_type_compression("application/vnd.test.v1+gzip"), (true, false));
        assert_eq!(
            media_type_compression(media::MEDIA_TYPE_ECI_KERNEL),
            (false, false)
        );
    }

    #[tokio::test]
    async fn test_decompress_gunzip_stage() -> anyhow::Result<()> {
        use flate2::write::GzEncoder;

        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"hello, edge device")?;
        let compressed = encoder.finish()?;

        let capture = CaptureWriter::default();
        let mut writer = decompress_writer(
            Box::new(capture.clone()),
            "application/vnd.test.v1+gzip",
            0,
        );

        writer.write_all(&compressed).await?;
        writer
            .commit(compressed.len() as u64, Some(sha256_digest(&compressed)))
            .await?;

        assert_eq!(capture.bytes.lock().unwrap().as_slice(), b"hello, edge device");
        assert!(capture.committed.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn test_decompress_gunzip_and_untar_chain() -> anyhow::Result<()> {
        let content = vec![42u8; 100 * 1024];
        let (_, _, compressed) = tgz::compress_bytes(&content, "disk-root-root.raw", 0)?;

        let capture = CaptureWriter::default();
        let mut writer = decompress_writer(
            Box::new(capture.clone()),
            media::MEDIA_TYPE_OCI_IMAGE_LAYER_GZIP,
            512,
        );

        // Feed the wire bytes in small chunks to exercise the pipe.
        for chunk in compressed.chunks(1000) {
            writer.write_all(chunk).await?;
        }
        writer.commit(compressed.len() as u64, None).await?;

        assert_eq!(*capture.bytes.lock().unwrap(), content);
        Ok(())
    }

    #[tokio::test]
    async fn test_decompress_corrupt_stream_fails_commit() -> anyhow::Result<()> {
        let capture = CaptureWriter::default();
        let mut writer = decompress_writer(
            Box::new(capture.clone()),
            "application/vnd.test.v1+gzip",
            0,
        );

        // Valid gzip magic is 0x1f 0x8b; this is neither.
        let _ = writer.write_all(b"definitely not gzip").await;
        let err = writer.commit(0, None).await.unwrap_err();
        assert!(err.to_string().contains("gunzip"));
        assert!(!capture.committed.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn test_decompress_wire_digest_verified() -> anyhow::Result<()> {
        let (_, _, compressed) = tgz::compress_bytes(b"kernel", "kernel", 0)?;

        let capture = CaptureWriter::default();
        let mut writer = decompress_writer(
            Box::new(capture.clone()),
            media::MEDIA_TYPE_OCI_IMAGE_LAYER_GZIP,
            0,
        );
        writer.write_all(&compressed).await?;

        let err = writer
            .commit(0, Some(sha256_digest(b"some other bytes")))
            .await
            .unwrap_err();
        assert!(matches!(err, EdgepackError::DigestMismatch { .. }));
        Ok(())
    }
}
