use super::{Disk, Source};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The typed bundle an edge container image is built from, mapping each role to its source.
///
/// An artifact is immutable once handed to the layering core; the layer order of the resulting
/// image is solely a function of the roles present: kernel, initrd, root disk, additional disks
/// in index order, then untyped extras.
#[derive(Debug, Clone, Default)]
pub struct Artifact {
    /// The kernel image.
    pub kernel: Option<Source>,

    /// The initial RAM disk.
    pub initrd: Option<Source>,

    /// An optional machine-readable config. When absent, a synthetic OCI image configuration
    /// is generated at build time.
    pub config: Option<Source>,

    /// The root disk.
    pub root: Option<Disk>,

    /// Additional disks, index-stable.
    pub disks: Vec<Disk>,

    /// Untyped extra files.
    pub other: Vec<Source>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Artifact {
    /// Checks whether the artifact carries no sources at all.
    pub fn is_empty(&self) -> bool {
        self.kernel.is_none()
            && self.initrd.is_none()
            && self.config.is_none()
            && self.root.is_none()
            && self.disks.is_empty()
            && self.other.is_empty()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::DiskKind;

    #[test]
    fn test_artifact_emptiness() {
        assert!(Artifact::default().is_empty());

        let artifact = Artifact {
            kernel: Some(Source::file("/boot/vmlinuz")),
            ..Default::default()
        };
        assert!(!artifact.is_empty());

        let artifact = Artifact {
            disks: vec![Disk::new(Source::file("/data/disk.raw"), DiskKind::Raw)],
            ..Default::default()
        };
        assert!(!artifact.is_empty());
    }
}
