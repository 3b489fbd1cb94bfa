use std::collections::HashMap;

use oci_spec::image::{Descriptor, DescriptorBuilder, Digest, MediaType};

use crate::{media, EdgepackResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Maps a media type string onto the [`MediaType`] enum, falling back to
/// [`MediaType::Other`] for the custom ECI types.
pub fn media_type_from_str(s: &str) -> MediaType {
    match s {
        media::MEDIA_TYPE_OCI_IMAGE_MANIFEST => MediaType::ImageManifest,
        media::MEDIA_TYPE_OCI_IMAGE_INDEX => MediaType::ImageIndex,
        media::MEDIA_TYPE_OCI_IMAGE_CONFIG => MediaType::ImageConfig,
        media::MEDIA_TYPE_OCI_IMAGE_LAYER => MediaType::ImageLayer,
        media::MEDIA_TYPE_OCI_IMAGE_LAYER_GZIP => MediaType::ImageLayerGzip,
        other => MediaType::Other(other.to_string()),
    }
}

/// Builds a descriptor from its parts.
pub fn new_descriptor(
    media_type: &str,
    digest: Digest,
    size: u64,
    annotations: HashMap<String, String>,
) -> EdgepackResult<Descriptor> {
    let descriptor = DescriptorBuilder::default()
        .media_type(media_type_from_str(media_type))
        .digest(digest)
        .size(size)
        .annotations(annotations)
        .build()?;
    Ok(descriptor)
}

/// Rebuilds a descriptor with the given annotations merged over any existing ones.
pub fn annotate(
    descriptor: &Descriptor,
    extra: impl IntoIterator<Item = (String, String)>,
) -> EdgepackResult<Descriptor> {
    let mut annotations = descriptor.annotations().clone().unwrap_or_default();
    annotations.extend(extra);
    new_descriptor(
        &descriptor.media_type().to_string(),
        descriptor.digest().clone(),
        descriptor.size(),
        annotations,
    )
}

/// Looks up a single annotation on a descriptor.
pub fn descriptor_annotation(descriptor: &Descriptor, key: &str) -> Option<String> {
    descriptor
        .annotations()
        .as_ref()
        .and_then(|annotations| annotations.get(key).cloned())
}

/// Returns the `org.opencontainers.image.title` annotation of a descriptor, if present.
pub fn descriptor_title(descriptor: &Descriptor) -> Option<String> {
    descriptor_annotation(descriptor, media::ANNOTATION_TITLE)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::sha256_digest;

    #[test]
    fn test_oci_media_type_mapping_round_trips() {
        assert_eq!(
            media_type_from_str(media::MEDIA_TYPE_OCI_IMAGE_MANIFEST).to_string(),
            media::MEDIA_TYPE_OCI_IMAGE_MANIFEST
        );
        assert_eq!(
            media_type_from_str(media::MEDIA_TYPE_ECI_KERNEL).to_string(),
            media::MEDIA_TYPE_ECI_KERNEL
        );
    }

    #[test]
    fn test_oci_annotate_merges_over_existing() {
        let descriptor = new_descriptor(
            media::MEDIA_TYPE_ECI_KERNEL,
            sha256_digest(b"kernel"),
            6,
            HashMap::from([(media::ANNOTATION_TITLE.to_string(), "old".to_string())]),
        )
        .unwrap();

        let descriptor = annotate(
            &descriptor,
            [
                (media::ANNOTATION_TITLE.to_string(), "kernel".to_string()),
                (
                    media::ANNOTATION_ROLE.to_string(),
                    media::ROLE_KERNEL.to_string(),
                ),
            ],
        )
        .unwrap();

        assert_eq!(
            descriptor_title(&descriptor).as_deref(),
            Some("kernel"),
            "later annotations must win"
        );
        assert_eq!(
            descriptor_annotation(&descriptor, media::ANNOTATION_ROLE).as_deref(),
            Some(media::ROLE_KERNEL)
        );
        assert_eq!(descriptor.size(), 6);
    }
}
