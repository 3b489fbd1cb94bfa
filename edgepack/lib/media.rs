//! The wire vocabulary of an edge container image: media type constants for every layer
//! role and disk format, the annotation and label keys that tie layers back to their roles,
//! the [`Format`] selecting between native and legacy wire encodings, and the helpers that
//! pick the on-wire media type for a layer or config blob.

use std::{fmt, str::FromStr};

use crate::EdgepackError;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Media type for an ECI machine-readable config blob.
pub const MEDIA_TYPE_ECI_CONFIG: &str = "application/vnd.lfedge.eci.config.v1+json";

/// Media type for an ECI kernel layer.
pub const MEDIA_TYPE_ECI_KERNEL: &str = "application/vnd.lfedge.eci.kernel.layer.v1+kernel";

/// Media type for an ECI initrd layer.
pub const MEDIA_TYPE_ECI_INITRD: &str = "application/vnd.lfedge.eci.initrd.layer.v1+cpio";

/// Media type for an untyped extra ECI layer.
pub const MEDIA_TYPE_ECI_OTHER: &str = "application/vnd.lfedge.eci.other.layer.v1";

/// Media type for a raw disk layer.
pub const MEDIA_TYPE_ECI_DISK_RAW: &str = "application/vnd.lfedge.disk.layer.v1+raw";

/// Media type for a VHD disk layer.
pub const MEDIA_TYPE_ECI_DISK_VHD: &str = "application/vnd.lfedge.disk.layer.v1+vhd";

/// Media type for a VMDK disk layer.
pub const MEDIA_TYPE_ECI_DISK_VMDK: &str = "application/vnd.lfedge.disk.layer.v1+vmdk";

/// Media type for an ISO disk layer.
pub const MEDIA_TYPE_ECI_DISK_ISO: &str = "application/vnd.lfedge.disk.layer.v1+iso";

/// Media type for a qcow disk layer.
pub const MEDIA_TYPE_ECI_DISK_QCOW: &str = "application/vnd.lfedge.disk.layer.v1+qcow";

/// Media type for a qcow2 disk layer.
pub const MEDIA_TYPE_ECI_DISK_QCOW2: &str = "application/vnd.lfedge.disk.layer.v1+qcow2";

/// Media type for an OVA disk layer.
pub const MEDIA_TYPE_ECI_DISK_OVA: &str = "application/vnd.lfedge.disk.layer.v1+ova";

/// Media type for a VHDX disk layer.
pub const MEDIA_TYPE_ECI_DISK_VHDX: &str = "application/vnd.lfedge.disk.layer.v1+vhdx";

/// Media type for an OCI image configuration blob.
pub const MEDIA_TYPE_OCI_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// Media type for an uncompressed OCI image layer.
pub const MEDIA_TYPE_OCI_IMAGE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";

/// Media type for a gzip-compressed OCI image layer.
pub const MEDIA_TYPE_OCI_IMAGE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Media type for an OCI image manifest.
pub const MEDIA_TYPE_OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media type for an OCI image index.
pub const MEDIA_TYPE_OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Media type for a Docker schema2 manifest, accepted on pulls for compatibility.
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Media type for a Docker schema2 manifest list, accepted on pulls for compatibility.
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Annotation key carrying a layer's original custom media type, preserved even when the wire
/// media type is a generic OCI one.
pub const ANNOTATION_MEDIA_TYPE: &str = "org.lfedge.eci.mediatype";

/// Annotation key carrying the logical role of a layer.
pub const ANNOTATION_ROLE: &str = "org.lfedge.eci.role";

/// OCI annotation key carrying a layer's title.
pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";

/// OCI annotation key carrying the reference a manifest was tagged with.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Image config label key recording the kernel path.
pub const ANNOTATION_KERNEL_PATH: &str = "org.lfedge.eci.kernel.path";

/// Image config label key recording the initrd path.
pub const ANNOTATION_INITRD_PATH: &str = "org.lfedge.eci.initrd.path";

/// Image config label key recording the root disk path.
pub const ANNOTATION_ROOT_PATH: &str = "org.lfedge.eci.root.path";

/// Image config label key recording an untyped extra path. A single key is shared by all
/// extras, so the last one wins.
pub const ANNOTATION_OTHER_PATH: &str = "org.lfedge.eci.other.path";

/// Role value for a kernel layer.
pub const ROLE_KERNEL: &str = "kernel";

/// Role value for an initrd layer.
pub const ROLE_INITRD: &str = "initrd";

/// Role value for a root disk layer.
pub const ROLE_ROOT_DISK: &str = "root";

/// Role value for an additional disk layer.
pub const ROLE_ADDITIONAL_DISK: &str = "disk";

/// Role value for an untyped extra layer.
pub const ROLE_OTHER: &str = "other";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The wire format an edge container image is written in.
///
/// In the artifacts format every layer carries its native, domain-specific media type and is
/// stored as-is. In the legacy format every layer is wrapped in a deterministic single-entry
/// tar stream and gzip-compressed so registries unaware of custom media types still accept it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Native media types, unwrapped layers.
    #[default]
    Artifacts,

    /// Generic OCI gzipped-layer media types, tar+gzip wrapped layers.
    Legacy,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns every media type an edge container image pull is allowed to carry.
pub fn all_media_types() -> Vec<&'static str> {
    vec![
        MEDIA_TYPE_ECI_CONFIG,
        MEDIA_TYPE_ECI_KERNEL,
        MEDIA_TYPE_ECI_INITRD,
        MEDIA_TYPE_ECI_OTHER,
        MEDIA_TYPE_ECI_DISK_RAW,
        MEDIA_TYPE_ECI_DISK_VHD,
        MEDIA_TYPE_ECI_DISK_VMDK,
        MEDIA_TYPE_ECI_DISK_ISO,
        MEDIA_TYPE_ECI_DISK_QCOW,
        MEDIA_TYPE_ECI_DISK_QCOW2,
        MEDIA_TYPE_ECI_DISK_OVA,
        MEDIA_TYPE_ECI_DISK_VHDX,
        MEDIA_TYPE_OCI_IMAGE_CONFIG,
        MEDIA_TYPE_OCI_IMAGE_LAYER,
        MEDIA_TYPE_OCI_IMAGE_LAYER_GZIP,
        MEDIA_TYPE_OCI_IMAGE_MANIFEST,
        MEDIA_TYPE_OCI_IMAGE_INDEX,
    ]
}

/// Returns the on-wire media type for a layer with the given custom media type.
///
/// Legacy images carry every layer as a generic OCI gzipped layer; the custom media type is
/// preserved in the [`ANNOTATION_MEDIA_TYPE`] annotation instead.
pub fn layer_media_type(custom: &str, format: Format) -> String {
    match format {
        Format::Legacy => MEDIA_TYPE_OCI_IMAGE_LAYER_GZIP.to_string(),
        Format::Artifacts => custom.to_string(),
    }
}

/// Returns the on-wire media type for a config blob with the given custom media type.
pub fn config_media_type(custom: &str, format: Format) -> String {
    match format {
        Format::Legacy => MEDIA_TYPE_OCI_IMAGE_CONFIG.to_string(),
        Format::Artifacts => custom.to_string(),
    }
}

/// Checks whether a media type denotes an image manifest or index, in either the OCI or the
/// Docker vocabulary.
pub fn is_manifest_media_type(media_type: &str) -> bool {
    matches!(
        media_type,
        MEDIA_TYPE_OCI_IMAGE_MANIFEST
            | MEDIA_TYPE_OCI_IMAGE_INDEX
            | MEDIA_TYPE_DOCKER_MANIFEST
            | MEDIA_TYPE_DOCKER_MANIFEST_LIST
    )
}

/// Returns the image config label key recording the path of additional disk `index`.
pub fn disk_index_path_annotation(index: usize) -> String {
    format!("org.lfedge.eci.disk.{}.path", index)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for Format {
    type Err = EdgepackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "artifacts" => Ok(Format::Artifacts),
            "legacy" => Ok(Format::Legacy),
            other => Err(EdgepackError::InvalidInput(format!(
                "unknown format: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Artifacts => write!(f, "artifacts"),
            Format::Legacy => write!(f, "legacy"),
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
    fn test_media_layer_media_type_by_format() {
        assert_eq!(
            layer_media_type(MEDIA_TYPE_ECI_KERNEL, Format::Artifacts),
            MEDIA_TYPE_ECI_KERNEL
        );
        assert_eq!(
            layer_media_type(MEDIA_TYPE_ECI_KERNEL, Format::Legacy),
            MEDIA_TYPE_OCI_IMAGE_LAYER_GZIP
        );
        assert_eq!(
            layer_media_type(MEDIA_TYPE_ECI_DISK_QCOW2, Format::Legacy),
            MEDIA_TYPE_OCI_IMAGE_LAYER_GZIP
        );
    }

    #[test]
    fn test_media_config_media_type_by_format() {
        assert_eq!(
            config_media_type(MEDIA_TYPE_ECI_CONFIG, Format::Artifacts),
            MEDIA_TYPE_ECI_CONFIG
        );
        assert_eq!(
            config_media_type(MEDIA_TYPE_ECI_CONFIG, Format::Legacy),
            MEDIA_TYPE_OCI_IMAGE_CONFIG
        );
    }

    #[test]
    fn test_media_allowed_set_contains_custom_and_oci_types() {
        let all = all_media_types();
        assert!(all.contains(&MEDIA_TYPE_ECI_KERNEL));
        assert!(all.contains(&MEDIA_TYPE_ECI_DISK_VHDX));
        assert!(all.contains(&MEDIA_TYPE_OCI_IMAGE_MANIFEST));
        assert!(all.contains(&MEDIA_TYPE_OCI_IMAGE_LAYER_GZIP));
        assert!(!all.contains(&"application/octet-stream"));
    }

    #[test]
    fn test_media_format_parses_from_cli_names() {
        assert_eq!("artifacts".parse::<Format>().unwrap(), Format::Artifacts);
        assert_eq!("legacy".parse::<Format>().unwrap(), Format::Legacy);
        assert!("container".parse::<Format>().is_err());
    }

    #[test]
    fn test_media_disk_index_annotation() {
        assert_eq!(disk_index_path_annotation(0), "org.lfedge.eci.disk.0.path");
        assert_eq!(disk_index_path_annotation(7), "org.lfedge.eci.disk.7.path");
    }
}
