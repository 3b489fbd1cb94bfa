use std::path::{Path, PathBuf};

use bytes::Bytes;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A source for one artifact component, either backed by a file on disk or held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Bytes read from a file at the given path.
    File {
        /// Absolute or relative path to the file.
        path: PathBuf,
    },

    /// Bytes held in memory under a logical name.
    Memory {
        /// The filename the bytes are saved under.
        name: String,

        /// The bytes themselves.
        content: Bytes,
    },
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Source {
    /// Creates a file-backed source.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Source::File { path: path.into() }
    }

    /// Creates a memory-backed source.
    pub fn memory(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Source::Memory {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Returns the path to the backing file, or `None` for a memory source.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Source::File { path } => Some(path),
            Source::Memory { .. } => None,
        }
    }

    /// Returns the in-memory content, or `None` for a file source.
    pub fn content(&self) -> Option<&Bytes> {
        match self {
            Source::File { .. } => None,
            Source::Memory { content, .. } => Some(content),
        }
    }

    /// Returns the target filename: the basename for a file source, the logical name for a
    /// memory source.
    pub fn name(&self) -> String {
        match self {
            Source::File { path } => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Source::Memory { name, .. } => name.clone(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_file_name_is_basename() {
        let source = Source::file("/some/dir/disk1.qcow2");
        assert_eq!(source.name(), "disk1.qcow2");
        assert_eq!(source.path(), Some(Path::new("/some/dir/disk1.qcow2")));
        assert!(source.content().is_none());
    }

    #[test]
    fn test_source_memory_name_is_logical() {
        let source = Source::memory("kernel", &b"vmlinuz"[..]);
        assert_eq!(source.name(), "kernel");
        assert!(source.path().is_none());
        assert_eq!(source.content().map(|c| c.as_ref()), Some(&b"vmlinuz"[..]));
    }
}
