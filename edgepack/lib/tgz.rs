//! Deterministic single-entry tar+gzip compression with streaming digests.
//!
//! Legacy-format layers are produced here: the tar stream contains exactly one entry with a
//! caller-supplied name and timestamp, and two SHA-256 digests are computed while compressing,
//! one over the tar bytes and one over the final gzip bytes. Given identical content, entry
//! name and timestamp the tar digest is invariant across runs and machines; the gzip digest is
//! additionally pinned by the [`LEGACY_GZIP_LEVEL`] and [`LEGACY_GZIP_OS`] header constants so
//! published images stay re-derivable.

use std::{
    fs::File,
    io::{Read, Write},
    path::Path,
};

use flate2::{Compression, GzBuilder};
use oci_spec::image::Digest;
use sha2::{Digest as _, Sha256};
use tar::{Builder, EntryType, Header};

use crate::{utils, CompressError, EdgepackResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The gzip compression level legacy layers are written with.
pub const LEGACY_GZIP_LEVEL: u32 = 6;

/// The OS byte written into the gzip header of legacy layers (0x03, Unix).
pub const LEGACY_GZIP_OS: u8 = 0x03;

/// The mode bits of the single tar entry.
const ENTRY_MODE: u32 = 0o644;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A writer that forwards to an inner writer while hashing every byte exactly once.
struct TeeWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<W: Write> TeeWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn into_parts(self) -> (W, Digest) {
        let digest = utils::digest_from_sha256(self.hasher.finalize().as_slice());
        (self.inner, digest)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Compresses the file at `input` into a single-entry tar+gzip stream at `output`.
///
/// The tar entry is named `name`, carries mode 0644 and `timestamp` (seconds since the epoch)
/// as its modification time, and nothing else: owner, group and the remaining header fields
/// stay zero so the stream is deterministic.
///
/// Returns the digest of the tar bytes and the digest of the gzip bytes, in that order. On any
/// failure the partially written `output` is removed.
pub fn compress(
    input: &Path,
    name: &str,
    output: &Path,
    timestamp: u64,
) -> EdgepackResult<(Digest, Digest)> {
    let result = compress_file(input, name, output, timestamp);
    if result.is_err() {
        let _ = std::fs::remove_file(output);
    }
    Ok(result?)
}

/// Compresses in-memory bytes with the same deterministic rules as [`compress`], returning the
/// tar digest, the gzip digest and the compressed bytes.
///
/// This is how memory-backed sources are carried in the legacy format.
pub fn compress_bytes(
    content: &[u8],
    name: &str,
    timestamp: u64,
) -> EdgepackResult<(Digest, Digest, Vec<u8>)> {
    let mut buffer = Vec::new();
    let (tar_digest, gzip_digest) = compress_stream(
        content,
        content.len() as u64,
        name,
        timestamp,
        &mut buffer,
        Path::new(name),
        Path::new("<memory>"),
    )?;
    Ok((tar_digest, gzip_digest, buffer))
}

fn compress_file(
    input: &Path,
    name: &str,
    output: &Path,
    timestamp: u64,
) -> Result<(Digest, Digest), CompressError> {
    let mut file = File::open(input).map_err(|source| CompressError::SourceOpen {
        path: input.to_path_buf(),
        source,
    })?;
    let metadata = file.metadata().map_err(|source| CompressError::SourceStat {
        path: input.to_path_buf(),
        source,
    })?;
    let sink = File::create(output).map_err(|source| CompressError::Sink {
        path: output.to_path_buf(),
        source,
    })?;

    compress_stream(&mut file, metadata.len(), name, timestamp, sink, input, output)
}

/// Streams `size` bytes from `input` through tar and gzip into `sink`, hashing both stages.
#[allow(clippy::too_many_arguments)]
fn compress_stream<R: Read, W: Write>(
    mut input: R,
    size: u64,
    name: &str,
    timestamp: u64,
    sink: W,
    input_path: &Path,
    sink_path: &Path,
) -> Result<(Digest, Digest), CompressError> {
    let sink_error = |source: std::io::Error| CompressError::Sink {
        path: sink_path.to_path_buf(),
        source,
    };

    let gzip_tee = TeeWriter::new(sink);
    let gzip = GzBuilder::new()
        .mtime(0)
        .operating_system(LEGACY_GZIP_OS)
        .write(gzip_tee, Compression::new(LEGACY_GZIP_LEVEL));
    let tar_tee = TeeWriter::new(gzip);
    let mut archive = Builder::new(tar_tee);

    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(ENTRY_MODE);
    header.set_size(size);
    header.set_mtime(timestamp);
    header
        .set_path(name)
        .map_err(|source| CompressError::TarHeader {
            path: input_path.to_path_buf(),
            source,
        })?;
    header.set_cksum();

    archive
        .append(&header, &mut input)
        .map_err(|source| CompressError::TarData {
            path: input_path.to_path_buf(),
            source,
        })?;

    // Close the archive and the gzip stream by hand so every byte, including the tar
    // end-of-archive markers, reaches the hashers before the digests are taken.
    let tar_tee = archive.into_inner().map_err(sink_error)?;
    let (gzip, tar_digest) = tar_tee.into_parts();
    let gzip_tee = gzip.finish().map_err(sink_error)?;
    let (mut sink, gzip_digest) = gzip_tee.into_parts();
    sink.flush().map_err(sink_error)?;

    Ok((tar_digest, gzip_digest))
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<W: Write> Write for TeeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
