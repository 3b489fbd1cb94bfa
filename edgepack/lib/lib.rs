//! `edgepack` packages edge-device boot artifacts into OCI images and restores them.
//!
//! # Overview
//!
//! An Edge Container Image (ECI) bundles a kernel, an initial RAM disk, an optional
//! machine-readable config, a root disk, auxiliary disks and untyped extra files, so that
//! bootable payloads travel through the same registries, mirrors and caches that host
//! container images. edgepack handles:
//! - Deterministic, bidirectional mapping between a typed artifact bundle and OCI
//!   descriptors, manifest and image configuration, in two wire formats
//! - Blob ingestion and retrieval over pluggable content stores
//! - Transparent decompression on the pull path
//!
//! # Wire formats
//!
//! - **artifacts**: every layer carries its native media type and is stored as-is
//! - **legacy**: every layer is a deterministic single-entry tar+gzip stream under the
//!   generic OCI gzipped-layer media type, for registries that reject custom media types
//!
//! # Backends
//!
//! - An OCI registry, over an HTTP transport with token authentication
//! - A local directory laid out as an OCI blob store
//! - A containerd daemon, through an injected client
//!
//! # Modules
//!
//! - [`artifact`] - The typed bundle model: sources, disks, roles
//! - [`manifest`] - The layering core: build and restore paths
//! - [`store`] - Content stores and the decompress pipeline
//! - [`push`] / [`pull`] - The transfer orchestrators
//! - [`tgz`] - Deterministic streaming compression
//! - [`cli`] - Command-line argument parsing for the `eci` binary

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod artifact;
pub mod cli;
pub mod manifest;
pub mod media;
pub mod progress;
pub mod pull;
pub mod push;
pub mod reference;
pub mod store;
pub mod tgz;
pub mod utils;

pub use error::*;
