//! The artifact layering core.
//!
//! The build path maps an [`Artifact`] onto an ordered list of OCI layer descriptors plus an
//! image configuration, honoring the selected wire format, and returns the manifest together
//! with a provider the push orchestrator streams the bytes from. The restore path rebuilds an
//! artifact skeleton from the descriptors a pull returned.
//!
//! Layer order is solely a function of the artifact: kernel, initrd, root disk, additional
//! disks in index order, then untyped extras.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use getset::Getters;
use oci_spec::image::{
    Arch, ConfigBuilder, Descriptor, Digest, ImageConfigurationBuilder, ImageManifest,
    ImageManifestBuilder, MediaType, Os, RootFsBuilder,
};

use crate::{
    artifact::{Artifact, Disk, DiskKind, Source},
    media::{self, Format},
    store::{FileStore, MemoryStore, MultiFetcher},
    tgz, utils, EdgepackError, EdgepackResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The author recorded in a synthesized image configuration when none is supplied.
pub const DEFAULT_AUTHOR: &str = "lf-edge/edge-containers";

/// The title of the kernel layer.
pub const KERNEL_LAYER_NAME: &str = "kernel";

/// The title of the initrd layer.
pub const INITRD_LAYER_NAME: &str = "initrd";

/// The title of the config blob.
pub const CONFIG_BLOB_NAME: &str = "config.json";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Values for a synthesized OCI image configuration. Empty fields fall back to
/// [`DEFAULT_AUTHOR`] and the host OS and architecture.
#[derive(Debug, Clone, Default)]
pub struct ConfigOpts {
    /// The image author.
    pub author: String,

    /// The image operating system.
    pub os: String,

    /// The image architecture.
    pub architecture: String,
}

/// Options for building in the legacy format.
#[derive(Debug, Clone, Default, Getters)]
#[getset(get = "pub with_prefix")]
pub struct LegacyOpts {
    /// The scratch directory compressed layers are staged in. Required for legacy builds;
    /// the caller owns its cleanup.
    tmp_dir: Option<PathBuf>,

    /// The timestamp stamped into every compressed layer's tar entry. Defaults to the epoch.
    timestamp: Option<DateTime<Utc>>,
}

/// Resolved legacy settings used while adding layers.
struct LegacyInfo {
    dir: PathBuf,
    timestamp: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LegacyOpts {
    /// Sets the scratch directory.
    pub fn with_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = Some(dir.into());
        self
    }

    /// Sets the layer timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

impl Artifact {
    /// Builds the OCI manifest for this artifact in the given format, returning it together
    /// with a provider serving every referenced blob.
    ///
    /// When the artifact carries no config source a synthetic OCI image configuration is
    /// generated: its `diff_ids` are the tar digests of the layers in legacy format and the
    /// layer digests themselves in artifacts format, and its labels record the role path of
    /// every layer.
    pub async fn manifest(
        &self,
        format: Format,
        config_opts: &ConfigOpts,
        legacy_opts: &LegacyOpts,
    ) -> EdgepackResult<(ImageManifest, MultiFetcher)> {
        let legacy = match format {
            Format::Legacy => {
                let dir = legacy_opts.tmp_dir.clone().ok_or_else(|| {
                    EdgepackError::InvalidInput(
                        "did not provide valid temporary directory for format legacy".into(),
                    )
                })?;
                if !dir.is_dir() {
                    return Err(EdgepackError::InvalidInput(format!(
                        "legacy scratch directory {} does not exist",
                        dir.display()
                    )));
                }
                Some(LegacyInfo {
                    dir,
                    timestamp: legacy_opts
                        .timestamp
                        .map(|t| t.timestamp().max(0) as u64)
                        .unwrap_or(0),
                })
            }
            Format::Artifacts => None,
        };

        let file_store = FileStore::new("");
        let memory_store = MemoryStore::new();

        let mut layers: Vec<Descriptor> = Vec::new();
        let mut diff_ids: Vec<String> = Vec::new();
        let mut labels: HashMap<String, String> = HashMap::new();

        if let Some(kernel) = &self.kernel {
            let (descriptor, diff_id) = add_layer(
                kernel,
                KERNEL_LAYER_NAME,
                media::MEDIA_TYPE_ECI_KERNEL,
                Some(media::ROLE_KERNEL),
                format,
                legacy.as_ref(),
                &file_store,
                &memory_store,
            )
            .await?;
            layers.push(descriptor);
            diff_ids.push(diff_id.to_string());
            labels.insert(
                media::ANNOTATION_KERNEL_PATH.to_string(),
                format!("/{}", KERNEL_LAYER_NAME),
            );
        }

        if let Some(initrd) = &self.initrd {
            let (descriptor, diff_id) = add_layer(
                initrd,
                INITRD_LAYER_NAME,
                media::MEDIA_TYPE_ECI_INITRD,
                Some(media::ROLE_INITRD),
                format,
                legacy.as_ref(),
                &file_store,
                &memory_store,
            )
            .await?;
            layers.push(descriptor);
            diff_ids.push(diff_id.to_string());
            labels.insert(
                media::ANNOTATION_INITRD_PATH.to_string(),
                format!("/{}", INITRD_LAYER_NAME),
            );
        }

        if let Some(disk) = &self.root {
            let name = format!("disk-root-{}", disk.source.name());
            let (descriptor, diff_id) = add_layer(
                &disk.source,
                &name,
                disk.kind.media_type(),
                Some(media::ROLE_ROOT_DISK),
                format,
                legacy.as_ref(),
                &file_store,
                &memory_store,
            )
            .await?;
            layers.push(descriptor);
            diff_ids.push(diff_id.to_string());
            labels.insert(media::ANNOTATION_ROOT_PATH.to_string(), format!("/{}", name));
        }

        for (index, disk) in self.disks.iter().enumerate() {
            let name = format!("disk-{}-{}", index, disk.source.name());
            let (descriptor, diff_id) = add_layer(
                &disk.source,
                &name,
                disk.kind.media_type(),
                Some(media::ROLE_ADDITIONAL_DISK),
                format,
                legacy.as_ref(),
                &file_store,
                &memory_store,
            )
            .await?;
            layers.push(descriptor);
            diff_ids.push(diff_id.to_string());
            labels.insert(media::disk_index_path_annotation(index), format!("/{}", name));
        }

        for other in &self.other {
            let name = other.name();
            let (descriptor, diff_id) = add_layer(
                other,
                &name,
                media::MEDIA_TYPE_ECI_OTHER,
                None,
                format,
                legacy.as_ref(),
                &file_store,
                &memory_store,
            )
            .await?;
            layers.push(descriptor);
            diff_ids.push(diff_id.to_string());
            // A single shared key, so with several extras the last one wins.
            labels.insert(media::ANNOTATION_OTHER_PATH.to_string(), format!("/{}", name));
        }

        let config_descriptor = match &self.config {
            Some(config) => {
                let wire_media_type = media::config_media_type(media::MEDIA_TYPE_ECI_CONFIG, format);
                // The config blob is ingested as-is in both formats; only its wire media
                // type differs.
                let (descriptor, _) = add_named_source(
                    config,
                    CONFIG_BLOB_NAME,
                    &wire_media_type,
                    None,
                    &file_store,
                    &memory_store,
                )
                .await
                .map_err(|source| wrap_add_error(source, CONFIG_BLOB_NAME, config))?;
                utils::annotate(
                    &descriptor,
                    [(
                        media::ANNOTATION_MEDIA_TYPE.to_string(),
                        media::MEDIA_TYPE_ECI_CONFIG.to_string(),
                    )],
                )?
            }
            None => {
                let author = if config_opts.author.is_empty() {
                    DEFAULT_AUTHOR.to_string()
                } else {
                    config_opts.author.clone()
                };
                let os = if config_opts.os.is_empty() {
                    std::env::consts::OS.to_string()
                } else {
                    config_opts.os.clone()
                };
                let architecture = if config_opts.architecture.is_empty() {
                    std::env::consts::ARCH.to_string()
                } else {
                    config_opts.architecture.clone()
                };

                let config = ImageConfigurationBuilder::default()
                    .created(Utc::now().to_rfc3339())
                    .author(author)
                    .os(Os::from(os.as_str()))
                    .architecture(Arch::from(architecture.as_str()))
                    .rootfs(
                        RootFsBuilder::default()
                            .typ("layers".to_string())
                            .diff_ids(diff_ids.clone())
                            .build()?,
                    )
                    .config(ConfigBuilder::default().labels(labels.clone()).build()?)
                    .build()?;

                let bytes = serde_json::to_vec(&config)?;
                memory_store
                    .add(CONFIG_BLOB_NAME, media::MEDIA_TYPE_OCI_IMAGE_CONFIG, bytes)
                    .await?
            }
        };

        let manifest = ImageManifestBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageManifest)
            .config(config_descriptor)
            .layers(layers)
            .build()?;

        let mut provider = MultiFetcher::new();
        provider.add_fetcher(Arc::new(file_store));
        provider.add_fetcher(Arc::new(memory_store));

        Ok((manifest, provider))
    }

    /// Rebuilds an artifact skeleton from the layer descriptors of a pulled manifest.
    ///
    /// Every titled layer becomes a file source named after its title, relative to wherever
    /// the pull wrote it. Disk kinds are recovered from the preserved custom media type
    /// annotation. When a role occurs more than once the last occurrence wins.
    pub fn from_layers(layers: &[Descriptor]) -> Artifact {
        let mut artifact = Artifact::default();

        for descriptor in layers {
            let Some(title) = utils::descriptor_title(descriptor) else {
                tracing::debug!("skipping unnamed layer {}", descriptor.digest());
                continue;
            };
            let source = Source::file(PathBuf::from(&title));
            let role = utils::descriptor_annotation(descriptor, media::ANNOTATION_ROLE);
            let custom_media_type =
                utils::descriptor_annotation(descriptor, media::ANNOTATION_MEDIA_TYPE)
                    .unwrap_or_else(|| descriptor.media_type().to_string());

            match role.as_deref() {
                Some(media::ROLE_KERNEL) => {
                    if artifact.kernel.is_some() {
                        tracing::warn!("duplicate kernel layer, keeping {}", title);
                    }
                    artifact.kernel = Some(source);
                }
                Some(media::ROLE_INITRD) => {
                    if artifact.initrd.is_some() {
                        tracing::warn!("duplicate initrd layer, keeping {}", title);
                    }
                    artifact.initrd = Some(source);
                }
                Some(media::ROLE_ROOT_DISK) => {
                    if artifact.root.is_some() {
                        tracing::warn!("duplicate root disk layer, keeping {}", title);
                    }
                    artifact.root = Some(Disk::new(source, disk_kind_for(&custom_media_type)));
                }
                Some(media::ROLE_ADDITIONAL_DISK) => {
                    artifact
                        .disks
                        .push(Disk::new(source, disk_kind_for(&custom_media_type)));
                }
                _ => artifact.other.push(source),
            }
        }

        artifact
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn disk_kind_for(media_type: &str) -> DiskKind {
    DiskKind::from_media_type(media_type).unwrap_or_else(|| {
        tracing::warn!("unknown disk media type {}, assuming raw", media_type);
        DiskKind::Raw
    })
}

fn wrap_add_error(source: EdgepackError, name: &str, layer_source: &Source) -> EdgepackError {
    EdgepackError::AddLayer {
        name: name.to_string(),
        path: layer_source
            .path()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("<memory>")),
        source: Box::new(source),
    }
}

/// Materializes one role's source as a layer: compresses it in legacy format, ingests it into
/// the right store, and annotates the descriptor. Returns the descriptor and the layer's
/// DiffID (the tar digest in legacy format, the layer digest otherwise).
#[allow(clippy::too_many_arguments)]
async fn add_layer(
    source: &Source,
    name: &str,
    custom_media_type: &str,
    role: Option<&str>,
    format: Format,
    legacy: Option<&LegacyInfo>,
    file_store: &FileStore,
    memory_store: &MemoryStore,
) -> EdgepackResult<(Descriptor, Digest)> {
    let wire_media_type = media::layer_media_type(custom_media_type, format);
    let (descriptor, diff_id) =
        add_named_source(source, name, &wire_media_type, legacy, file_store, memory_store)
            .await
            .map_err(|err| wrap_add_error(err, name, source))?;

    let mut annotations = vec![
        (
            media::ANNOTATION_MEDIA_TYPE.to_string(),
            custom_media_type.to_string(),
        ),
        (media::ANNOTATION_TITLE.to_string(), name.to_string()),
    ];
    if let Some(role) = role {
        annotations.push((media::ANNOTATION_ROLE.to_string(), role.to_string()));
    }

    let descriptor = utils::annotate(&descriptor, annotations)?;
    Ok((descriptor, diff_id))
}

async fn add_named_source(
    source: &Source,
    name: &str,
    wire_media_type: &str,
    legacy: Option<&LegacyInfo>,
    file_store: &FileStore,
    memory_store: &MemoryStore,
) -> EdgepackResult<(Descriptor, Digest)> {
    match (source, legacy) {
        (Source::File { path }, Some(legacy)) => {
            if !path.exists() {
                return Err(EdgepackError::SourceMissing(path.clone()));
            }
            let tgz_path = legacy.dir.join(name);
            let input = path.clone();
            let entry_name = name.to_string();
            let output = tgz_path.clone();
            let timestamp = legacy.timestamp;
            let (tar_digest, _) = tokio::task::spawn_blocking(move || {
                tgz::compress(&input, &entry_name, &output, timestamp)
            })
            .await
            .map_err(EdgepackError::custom)??;

            let descriptor = file_store.add(name, wire_media_type, &tgz_path).await?;
            Ok((descriptor, tar_digest))
        }
        (Source::File { path }, None) => {
            let descriptor = file_store.add(name, wire_media_type, path).await?;
            let diff_id = descriptor.digest().clone();
            Ok((descriptor, diff_id))
        }
        (Source::Memory { content, .. }, Some(legacy)) => {
            let (tar_digest, _, compressed) =
                tgz::compress_bytes(content, name, legacy.timestamp)?;
            let descriptor = memory_store.add(name, wire_media_type, compressed).await?;
            Ok((descriptor, tar_digest))
        }
        (Source::Memory { content, .. }, None) => {
            let descriptor = memory_store
                .add(name, wire_media_type, content.clone())
                .await?;
            let diff_id = descriptor.digest().clone();
            Ok((descriptor, diff_id))
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::TimeZone;
    use futures::TryStreamExt;
    use oci_spec::image::ImageConfiguration;
    use tempfile::tempdir;

    use super::*;
    use crate::{store::BlobFetcher, utils::sha256_digest};

    fn annotation(descriptor: &Descriptor, key: &str) -> Option<String> {
        utils::descriptor_annotation(descriptor, key)
    }

    async fn read_config(
        provider: &MultiFetcher,
        manifest: &ImageManifest,
    ) -> anyhow::Result<ImageConfiguration> {
        let chunks: Vec<Bytes> = provider.fetch(manifest.config()).await?.try_collect().await?;
        Ok(serde_json::from_slice(&chunks.concat())?)
    }

    #[tokio::test]
    async fn test_manifest_kernel_only_artifacts_format() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let kernel_path = dir.path().join("kernel");
        std::fs::write(&kernel_path, b"kernel")?;

        let artifact = Artifact {
            kernel: Some(Source::file(&kernel_path)),
            ..Default::default()
        };
        let (manifest, provider) = artifact
            .manifest(Format::Artifacts, &ConfigOpts::default(), &LegacyOpts::default())
            .await?;

        assert_eq!(manifest.layers().len(), 1);
        let layer = &manifest.layers()[0];
        assert_eq!(layer.media_type().to_string(), media::MEDIA_TYPE_ECI_KERNEL);
        assert_eq!(layer.digest(), &sha256_digest(b"kernel"));
        assert_eq!(layer.size(), 6);
        assert_eq!(
            annotation(layer, media::ANNOTATION_MEDIA_TYPE).as_deref(),
            Some(media::MEDIA_TYPE_ECI_KERNEL)
        );
        assert_eq!(
            annotation(layer, media::ANNOTATION_ROLE).as_deref(),
            Some(media::ROLE_KERNEL)
        );
        assert_eq!(
            annotation(layer, media::ANNOTATION_TITLE).as_deref(),
            Some("kernel")
        );

        let config = read_config(&provider, &manifest).await?;
        assert_eq!(
            config.rootfs().diff_ids(),
            &vec![sha256_digest(b"kernel").to_string()]
        );
        let labels = config
            .config()
            .as_ref()
            .and_then(|c| c.labels().clone())
            .unwrap_or_default();
        assert_eq!(
            labels.get(media::ANNOTATION_KERNEL_PATH),
            Some(&"/kernel".to_string())
        );
        assert_eq!(config.author().as_deref(), Some(DEFAULT_AUTHOR));

        Ok(())
    }

    #[tokio::test]
    async fn test_manifest_kernel_legacy_format() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let scratch = tempdir()?;
        let kernel_path = dir.path().join("kernel");
        std::fs::write(&kernel_path, b"kernel")?;

        let timestamp = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let artifact = Artifact {
            kernel: Some(Source::file(&kernel_path)),
            ..Default::default()
        };
        let (manifest, provider) = artifact
            .manifest(
                Format::Legacy,
                &ConfigOpts::default(),
                &LegacyOpts::default()
                    .with_tmp_dir(scratch.path())
                    .with_timestamp(timestamp),
            )
            .await?;

        let layer = &manifest.layers()[0];
        assert_eq!(
            layer.media_type().to_string(),
            media::MEDIA_TYPE_OCI_IMAGE_LAYER_GZIP
        );
        // The custom media type and role survive in the annotations.
        assert_eq!(
            annotation(layer, media::ANNOTATION_MEDIA_TYPE).as_deref(),
            Some(media::MEDIA_TYPE_ECI_KERNEL)
        );
        assert_eq!(
            annotation(layer, media::ANNOTATION_ROLE).as_deref(),
            Some(media::ROLE_KERNEL)
        );

        // The layer digest is the gzip digest, the DiffID the tar digest.
        let (expected_tar, expected_gzip, _) =
            tgz::compress_bytes(b"kernel", "kernel", timestamp.timestamp() as u64)?;
        assert_eq!(layer.digest(), &expected_gzip);

        let config = read_config(&provider, &manifest).await?;
        assert_eq!(config.rootfs().diff_ids(), &vec![expected_tar.to_string()]);

        Ok(())
    }

    #[tokio::test]
    async fn test_manifest_full_bundle_ordering_and_labels() -> anyhow::Result<()> {
        let dir = tempdir()?;
        for (name, content) in [
            ("kernel", &b"kernel"[..]),
            ("initrd", &b"initrd"[..]),
            ("root.raw", &b"root disk"[..]),
            ("disk1.qcow2", &b"disk one"[..]),
        ] {
            std::fs::write(dir.path().join(name), content)?;
        }

        let artifact = Artifact {
            kernel: Some(Source::file(dir.path().join("kernel"))),
            initrd: Some(Source::file(dir.path().join("initrd"))),
            root: Some(Disk::new(
                Source::file(dir.path().join("root.raw")),
                DiskKind::Raw,
            )),
            disks: vec![Disk::new(
                Source::file(dir.path().join("disk1.qcow2")),
                DiskKind::Qcow2,
            )],
            ..Default::default()
        };
        let (manifest, provider) = artifact
            .manifest(Format::Artifacts, &ConfigOpts::default(), &LegacyOpts::default())
            .await?;

        let titles: Vec<String> = manifest
            .layers()
            .iter()
            .filter_map(utils::descriptor_title)
            .collect();
        assert_eq!(
            titles,
            vec!["kernel", "initrd", "disk-root-root.raw", "disk-0-disk1.qcow2"]
        );
        assert_eq!(
            manifest.layers()[3].media_type().to_string(),
            media::MEDIA_TYPE_ECI_DISK_QCOW2
        );

        let config = read_config(&provider, &manifest).await?;
        let labels = config
            .config()
            .as_ref()
            .and_then(|c| c.labels().clone())
            .unwrap_or_default();
        assert_eq!(
            labels.get(media::ANNOTATION_KERNEL_PATH),
            Some(&"/kernel".to_string())
        );
        assert_eq!(
            labels.get(media::ANNOTATION_INITRD_PATH),
            Some(&"/initrd".to_string())
        );
        assert_eq!(
            labels.get(media::ANNOTATION_ROOT_PATH),
            Some(&"/disk-root-root.raw".to_string())
        );
        assert_eq!(
            labels.get("org.lfedge.eci.disk.0.path"),
            Some(&"/disk-0-disk1.qcow2".to_string())
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_manifest_missing_sources_error_prefixes() -> anyhow::Result<()> {
        let cases: Vec<(Artifact, &str)> = vec![
            (
                Artifact {
                    kernel: Some(Source::file("abcd.kernel")),
                    ..Default::default()
                },
                "error adding kernel",
            ),
            (
                Artifact {
                    initrd: Some(Source::file("abcd.initrd")),
                    ..Default::default()
                },
                "error adding initrd",
            ),
            (
                Artifact {
                    config: Some(Source::file("abcd.config")),
                    ..Default::default()
                },
                "error adding config",
            ),
            (
                Artifact {
                    root: Some(Disk::new(Source::file("abcd.diskroot"), DiskKind::Raw)),
                    ..Default::default()
                },
                "error adding disk-root",
            ),
            (
                Artifact {
                    disks: vec![Disk::new(Source::file("abcd.diskone"), DiskKind::Vmdk)],
                    ..Default::default()
                },
                "error adding disk-0",
            ),
        ];

        for (artifact, prefix) in cases {
            let err = artifact
                .manifest(Format::Artifacts, &ConfigOpts::default(), &LegacyOpts::default())
                .await
                .unwrap_err();
            assert!(
                err.to_string().starts_with(prefix),
                "expected prefix {:?}, got {:?}",
                prefix,
                err.to_string()
            );
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_manifest_legacy_requires_scratch_dir() -> anyhow::Result<()> {
        let artifact = Artifact {
            kernel: Some(Source::memory("kernel", &b"kernel"[..])),
            ..Default::default()
        };
        let err = artifact
            .manifest(Format::Legacy, &ConfigOpts::default(), &LegacyOpts::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("temporary directory"));
        Ok(())
    }

    #[tokio::test]
    async fn test_manifest_memory_source_legacy_synthesizes_tar() -> anyhow::Result<()> {
        let scratch = tempdir()?;
        let artifact = Artifact {
            kernel: Some(Source::memory("kernel", &b"kernel"[..])),
            ..Default::default()
        };
        let (manifest, provider) = artifact
            .manifest(
                Format::Legacy,
                &ConfigOpts::default(),
                &LegacyOpts::default().with_tmp_dir(scratch.path()),
            )
            .await?;

        let (expected_tar, expected_gzip, _) = tgz::compress_bytes(b"kernel", "kernel", 0)?;
        let layer = &manifest.layers()[0];
        assert_eq!(layer.digest(), &expected_gzip);

        let config = read_config(&provider, &manifest).await?;
        assert_eq!(config.rootfs().diff_ids(), &vec![expected_tar.to_string()]);

        Ok(())
    }

    #[tokio::test]
    async fn test_manifest_provided_config_used_as_is() -> anyhow::Result<()> {
        let artifact = Artifact {
            kernel: Some(Source::memory("kernel", &b"kernel"[..])),
            config: Some(Source::memory("my-config", &b"{\"eve\":true}"[..])),
            ..Default::default()
        };
        let (manifest, _) = artifact
            .manifest(Format::Artifacts, &ConfigOpts::default(), &LegacyOpts::default())
            .await?;

        assert_eq!(
            manifest.config().media_type().to_string(),
            media::MEDIA_TYPE_ECI_CONFIG
        );
        assert_eq!(
            manifest.config().digest(),
            &sha256_digest(b"{\"eve\":true}")
        );
        assert_eq!(
            annotation(manifest.config(), media::ANNOTATION_MEDIA_TYPE).as_deref(),
            Some(media::MEDIA_TYPE_ECI_CONFIG)
        );

        Ok(())
    }

    #[test]
    fn test_manifest_restore_roles_and_duplicates() {
        let make = |title: &str, role: Option<&str>, custom: &str| {
            let mut annotations = HashMap::from([
                (media::ANNOTATION_TITLE.to_string(), title.to_string()),
                (media::ANNOTATION_MEDIA_TYPE.to_string(), custom.to_string()),
            ]);
            if let Some(role) = role {
                annotations.insert(media::ANNOTATION_ROLE.to_string(), role.to_string());
            }
            utils::new_descriptor(
                custom,
                sha256_digest(title.as_bytes()),
                title.len() as u64,
                annotations,
            )
            .unwrap()
        };

        let layers = vec![
            make("kernel-old", Some(media::ROLE_KERNEL), media::MEDIA_TYPE_ECI_KERNEL),
            make("kernel", Some(media::ROLE_KERNEL), media::MEDIA_TYPE_ECI_KERNEL),
            make("initrd", Some(media::ROLE_INITRD), media::MEDIA_TYPE_ECI_INITRD),
            make(
                "disk-root-root.raw",
                Some(media::ROLE_ROOT_DISK),
                media::MEDIA_TYPE_ECI_DISK_RAW,
            ),
            make(
                "disk-0-disk1.qcow2",
                Some(media::ROLE_ADDITIONAL_DISK),
                media::MEDIA_TYPE_ECI_DISK_QCOW2,
            ),
            make("notes.txt", None, media::MEDIA_TYPE_ECI_OTHER),
        ];

        let artifact = Artifact::from_layers(&layers);

        // Duplicate kernel: the last occurrence wins.
        assert_eq!(artifact.kernel.unwrap().name(), "kernel");
        assert_eq!(artifact.initrd.unwrap().name(), "initrd");
        let root = artifact.root.unwrap();
        assert_eq!(root.kind, DiskKind::Raw);
        assert_eq!(root.source.name(), "disk-root-root.raw");
        assert_eq!(artifact.disks.len(), 1);
        assert_eq!(artifact.disks[0].kind, DiskKind::Qcow2);
        assert_eq!(artifact.other.len(), 1);
        assert_eq!(artifact.other[0].name(), "notes.txt");
    }
}
