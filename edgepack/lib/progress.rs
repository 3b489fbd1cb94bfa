//! Progress reporting for blob transfers.

use std::{
    io::Write,
    sync::Mutex,
};

use oci_spec::image::Digest;

use crate::utils;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A sink for per-blob transfer progress.
///
/// Implementations must be safe to call from concurrent transfers.
pub trait ProgressTracker: Send + Sync {
    /// Called when the transfer of a blob begins.
    fn start(&self, digest: &Digest, name: &str, total: u64);

    /// Called as bytes of a blob move.
    fn update(&self, digest: &Digest, bytes: u64);

    /// Called when the transfer of a blob has completed.
    fn finish(&self, digest: &Digest, name: &str);
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A progress tracker that reports nothing.
pub struct NoopProgress;

/// A progress tracker that writes one status line per blob, serialized by a mutex so
/// concurrent transfers do not interleave output.
pub struct StatusProgress {
    verb: &'static str,
    out: Mutex<Box<dyn Write + Send>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl StatusProgress {
    /// Creates a status-line tracker that prefixes each line with `verb`, e.g. `"Uploading"`.
    pub fn new(verb: &'static str, out: impl Write + Send + 'static) -> Self {
        Self {
            verb,
            out: Mutex::new(Box::new(out)),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl ProgressTracker for NoopProgress {
    fn start(&self, _digest: &Digest, _name: &str, _total: u64) {}

    fn update(&self, _digest: &Digest, _bytes: u64) {}

    fn finish(&self, _digest: &Digest, _name: &str) {}
}

impl ProgressTracker for StatusProgress {
    fn start(&self, digest: &Digest, name: &str, _total: u64) {
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{} {} {}", self.verb, utils::short_digest(digest), name);
        }
    }

    fn update(&self, _digest: &Digest, _bytes: u64) {}

    fn finish(&self, _digest: &Digest, _name: &str) {}
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
